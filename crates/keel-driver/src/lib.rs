//! # keel-driver
//!
//! The bridge network driver and the contracts around it: network and
//! endpoint lifecycle over [`keel_firewall`] and [`keel_netns`], driver
//! and IPAM traits for the controller, persisted driver state through
//! [`keel_store`], and HTTP adapters for out-of-process plugins.

pub mod api;
pub mod config;
pub mod driver;
pub mod endpoint;
pub mod remote;

pub use api::{
    AllocatedPool, EndpointInterface, Ipam, IpamCapabilities, IpamData, JoinInfo,
    NetworkDriver, Options, PoolRequest, request_pool_excluding,
};
pub use config::{GatewayMode, NetworkSettings};
pub use driver::{BridgeDriver, LinkPlumbing, NetlinkPlumbing};
pub use endpoint::{EndpointRecord, PortBinding, ResolvedBinding};
pub use remote::{RemoteDriver, RemoteIpam};
