//! # keel-firewall
//!
//! iptables programming for bridge networks: the DOCKER chain topology,
//! per-network NAT/filter/isolation rules, published-port rules, raw-table
//! endpoint hardening and firewalld reload replay.
//!
//! Rules are data (family, table, chain, argv) executed through the
//! [`rule::Backend`] trait; production shells out to `iptables`/
//! `ip6tables -w` under a process-wide lock, tests and dry runs record
//! into [`rule::MemoryBackend`].

pub mod chains;
pub mod endpoint;
pub mod firewalld;
pub mod network;
pub mod ports;
pub mod rule;

pub use chains::{FirewallConfig, Iptabler, detect_wsl2_mirrored};
pub use firewalld::Firewalld;
pub use network::{FamilyConfig, NetworkConfig, NetworkFirewall};
pub use ports::PortBinding;
pub use rule::{Backend, IpVersion, IptablesBackend, MemoryBackend, Table};
