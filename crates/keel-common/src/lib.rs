//! # keel-common
//!
//! Shared utilities and types for the Keel network plane.
//!
//! This crate provides common functionality used across all Keel crates:
//! - The error taxonomy surfaced by every operation
//! - Standard filesystem paths
//! - Caller-name tagging for log lines

#![warn(missing_docs)]

pub mod caller;
pub mod error;
pub mod net;
pub mod paths;

pub use error::{ErrorKind, KeelError, KeelResult};
pub use net::Cidr;
pub use paths::KeelPaths;
