//! # keel-netns
//!
//! Network namespace ownership and in-namespace interface plumbing:
//! bind-mounted namespace files, the ordered interface configuration
//! sequence with rollback, gateway and static-route programming,
//! neighbor entries and unsolicited ARP/NA advertisement.
//!
//! `setns` binds the calling OS thread, so every in-namespace operation
//! runs on a dedicated thread with its own current-thread runtime; see
//! [`namespace::Namespace`].

pub mod advertise;
pub mod interface;
pub mod namespace;
pub mod nlwrap;

pub use advertise::AdvertiseSettings;
pub use interface::{Interface, InterfaceOptions};
pub use namespace::{Namespace, StaticRoute, set_unlink_grace};
pub use nlwrap::{Handle, RouteEntry};
