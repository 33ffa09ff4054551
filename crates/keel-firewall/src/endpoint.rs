//! Per-endpoint raw-table hardening.
//!
//! A host that can route straight to a container address would bypass the
//! NAT path and the per-network default drop. A raw PREROUTING drop per
//! endpoint address closes that hole; it is skipped for networks where
//! direct access is the point (internal, routed, unprotected) and when
//! raw rules are disabled by environment.

use std::net::{Ipv4Addr, Ipv6Addr};

use keel_common::KeelResult;

use crate::chains::RuleOp;
use crate::network::NetworkFirewall;
use crate::rule::{IpVersion, Table, args};

fn direct_access_exempt(fw: &NetworkFirewall, v: IpVersion) -> bool {
    let config = fw.config();
    if config.internal || fw.iptabler().config().allow_direct_routing {
        return true;
    }
    config
        .family(v)
        .is_none_or(|fam| fam.routed || fam.unprotected)
}

fn drop_op(fw: &NetworkFirewall, v: IpVersion, address: &str) -> RuleOp {
    RuleOp::append(
        v,
        Table::Raw,
        "PREROUTING",
        args(["-d", address, "!", "-i", fw.config().if_name.as_str(), "-j", "DROP"]),
    )
}

impl NetworkFirewall {
    /// Install the direct-access drops for a new endpoint's addresses.
    ///
    /// # Errors
    ///
    /// On failure the already-installed drop is removed before the error
    /// is returned.
    pub fn add_endpoint(
        &self,
        ep_ipv4: Option<Ipv4Addr>,
        ep_ipv6: Option<Ipv6Addr>,
    ) -> KeelResult<()> {
        let checkpoint = self.cleaner_count();
        for (v, address) in endpoint_addresses(ep_ipv4, ep_ipv6) {
            if direct_access_exempt(self, v) {
                continue;
            }
            if let Err(e) = self.apply_tracked(&drop_op(self, v, &address)) {
                self.unwind_to(checkpoint);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Remove an endpoint's direct-access drops.
    ///
    /// # Errors
    ///
    /// Returns the first deletion error.
    pub fn del_endpoint(
        &self,
        ep_ipv4: Option<Ipv4Addr>,
        ep_ipv6: Option<Ipv6Addr>,
    ) -> KeelResult<()> {
        for (v, address) in endpoint_addresses(ep_ipv4, ep_ipv6) {
            if direct_access_exempt(self, v) {
                continue;
            }
            self.remove_tracked(&drop_op(self, v, &address))?;
        }
        Ok(())
    }
}

fn endpoint_addresses(
    ep_ipv4: Option<Ipv4Addr>,
    ep_ipv6: Option<Ipv6Addr>,
) -> Vec<(IpVersion, String)> {
    let mut addresses = Vec::with_capacity(2);
    if let Some(ip) = ep_ipv4 {
        addresses.push((IpVersion::V4, ip.to_string()));
    }
    if let Some(ip) = ep_ipv6 {
        addresses.push((IpVersion::V6, ip.to_string()));
    }
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chains::{FirewallConfig, Iptabler};
    use crate::firewalld::Firewalld;
    use crate::network::{FamilyConfig, NetworkConfig};
    use crate::rule::MemoryBackend;
    use std::sync::Arc;

    fn network(mutate: impl FnOnce(&mut NetworkConfig)) -> (NetworkFirewall, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let fwld = Firewalld::disabled();
        let ipt = Iptabler::new(backend.clone(), FirewallConfig::default(), &fwld).unwrap();
        let mut nc = NetworkConfig {
            if_name: "br-e0".to_string(),
            internal: false,
            icc: true,
            masquerade: true,
            trusted_host_interfaces: Vec::new(),
            config4: Some(FamilyConfig {
                prefix: "172.21.0.0/16".parse().unwrap(),
                host_ip: None,
                routed: false,
                unprotected: false,
            }),
            config6: None,
        };
        mutate(&mut nc);
        let fw = ipt.new_network(nc).unwrap();
        (fw, backend)
    }

    #[test]
    fn endpoint_address_gets_a_raw_drop() {
        let (fw, be) = network(|_| {});
        fw.add_endpoint(Some("172.21.0.5".parse().unwrap()), None)
            .unwrap();

        assert_eq!(
            be.rules(IpVersion::V4, Table::Raw, "PREROUTING"),
            vec!["-d 172.21.0.5 ! -i br-e0 -j DROP".to_string()]
        );

        fw.del_endpoint(Some("172.21.0.5".parse().unwrap()), None)
            .unwrap();
        assert!(be.rules(IpVersion::V4, Table::Raw, "PREROUTING").is_empty());
    }

    #[test]
    fn routed_and_unprotected_networks_skip_the_drop() {
        let (fw, be) = network(|nc| nc.config4.as_mut().unwrap().routed = true);
        fw.add_endpoint(Some("172.21.0.5".parse().unwrap()), None)
            .unwrap();
        assert!(be.rules(IpVersion::V4, Table::Raw, "PREROUTING").is_empty());

        let (fw, be) = network(|nc| nc.config4.as_mut().unwrap().unprotected = true);
        fw.add_endpoint(Some("172.21.0.5".parse().unwrap()), None)
            .unwrap();
        assert!(be.rules(IpVersion::V4, Table::Raw, "PREROUTING").is_empty());
    }

    #[test]
    fn internal_networks_skip_the_drop() {
        let (fw, be) = network(|nc| nc.internal = true);
        fw.add_endpoint(Some("172.21.0.5".parse().unwrap()), None)
            .unwrap();
        assert!(be.rules(IpVersion::V4, Table::Raw, "PREROUTING").is_empty());
    }
}
