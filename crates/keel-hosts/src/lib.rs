//! # keel-hosts
//!
//! Maintains `/etc/hosts`-style records for containers.
//!
//! The file is usually bind-mounted into a running container, so rewrites
//! are serialized per path and, on Linux, guarded by a best-effort write
//! lease that blocks concurrent readers until the rewrite completes.

#![warn(missing_docs)]

pub mod hosts;
pub mod lease;

pub use hosts::{AddMode, Record, add, build, build_no_ipv6, delete, drop_path, update};
pub use lease::FileLease;
