//! Endpoint records and host-port binding resolution.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use keel_common::{Cidr, KeelError, KeelResult};
use serde::{Deserialize, Serialize};

/// A requested port publication. `host_port..=host_port_end` is the range
/// the caller accepts; zero means "publish without host exposure".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    /// Protocol: `tcp`, `udp`, `sctp` or `icmp`.
    pub proto: String,
    /// Container-side port.
    pub port: u16,
    /// Host address to bind; `None` uses the network's default binding.
    pub host_ip: Option<IpAddr>,
    /// First acceptable host port.
    pub host_port: u16,
    /// Last acceptable host port; `0` means exactly `host_port`.
    pub host_port_end: u16,
}

impl PortBinding {
    fn range(&self) -> std::ops::RangeInclusive<u16> {
        let end = if self.host_port_end == 0 {
            self.host_port
        } else {
            self.host_port_end
        };
        self.host_port..=end
    }
}

/// An active publication: the single `(proto, host ip, host port)` tuple
/// a request resolved to.
pub type BindingKey = (String, IpAddr, u16);

/// The persisted image of an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointRecord {
    /// Endpoint id.
    pub id: String,
    /// Owning network id.
    pub network_id: String,
    /// IPv4 address and prefix.
    #[serde(default, with = "cidr_opt_serde")]
    pub addr: Option<Cidr>,
    /// IPv6 address and prefix.
    #[serde(default, with = "cidr_opt_serde")]
    pub addr_v6: Option<Cidr>,
    /// Hardware address.
    pub mac: Option<[u8; 6]>,
    /// Host-side veth name.
    pub host_if_name: String,
    /// Sandbox-side name, set while joined.
    #[serde(default)]
    pub container_if_name: Option<String>,
    /// Namespace path of the joined sandbox.
    #[serde(default)]
    pub sandbox_key: Option<String>,
    /// Published ports as resolved against the host.
    #[serde(default)]
    pub bindings: Vec<ResolvedBinding>,
}

impl EndpointRecord {
    /// The endpoint's IPv4 address without its prefix.
    #[must_use]
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        match self.addr.map(|a| a.addr()) {
            Some(IpAddr::V4(v4)) => Some(v4),
            _ => None,
        }
    }

    /// The endpoint's IPv6 address without its prefix.
    #[must_use]
    pub fn ipv6(&self) -> Option<Ipv6Addr> {
        match self.addr_v6.map(|a| a.addr()) {
            Some(IpAddr::V6(v6)) => Some(v6),
            _ => None,
        }
    }
}

/// A binding after host-port allocation, ready for rule programming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedBinding {
    /// Protocol.
    pub proto: String,
    /// Host address, unspecified when binding all addresses.
    pub host_ip: IpAddr,
    /// The single host port chosen from the requested range.
    pub host_port: u16,
    /// Container address.
    pub container_ip: IpAddr,
    /// Container port.
    pub container_port: u16,
}

impl ResolvedBinding {
    /// The uniqueness tuple this binding occupies. Unexposed bindings
    /// (host port zero) occupy nothing.
    #[must_use]
    pub fn key(&self) -> Option<BindingKey> {
        (self.host_port != 0).then(|| (self.proto.clone(), self.host_ip, self.host_port))
    }

    /// The firewall view of this binding.
    #[must_use]
    pub fn to_firewall(&self) -> keel_firewall::PortBinding {
        keel_firewall::PortBinding {
            proto: self.proto.clone(),
            host_ip: self.host_ip,
            host_port: self.host_port,
            container_ip: self.container_ip,
            container_port: self.container_port,
        }
    }
}

fn unspecified(for_ip: IpAddr) -> IpAddr {
    if for_ip.is_ipv6() {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }
}

/// Resolve requested bindings against the active set, picking the first
/// free host port in each requested range.
///
/// One request produces one resolved binding per endpoint address family
/// matching the host address family. Tuples chosen here are appended to
/// `active` so later requests in the same batch cannot collide.
///
/// # Errors
///
/// [`KeelError::AlreadyExists`] when every port in a requested range is
/// taken, [`KeelError::InvalidParameter`] for an inverted range.
pub fn resolve_bindings(
    requested: &[PortBinding],
    container_v4: Option<Ipv4Addr>,
    container_v6: Option<Ipv6Addr>,
    default_host_ip: Option<IpAddr>,
    active: &mut HashSet<BindingKey>,
) -> KeelResult<Vec<ResolvedBinding>> {
    let mut resolved = Vec::new();

    for request in requested {
        if request.host_port_end != 0 && request.host_port_end < request.host_port {
            return Err(KeelError::invalid(format!(
                "inverted host port range {}-{}",
                request.host_port, request.host_port_end
            )));
        }

        let container_ips: Vec<IpAddr> = [
            container_v4.map(IpAddr::V4),
            container_v6.map(IpAddr::V6),
        ]
        .into_iter()
        .flatten()
        .collect();

        for container_ip in container_ips {
            let host_ip = request
                .host_ip
                .or(default_host_ip)
                .filter(|ip| ip.is_ipv6() == container_ip.is_ipv6())
                .unwrap_or_else(|| unspecified(container_ip));
            if let Some(requested_ip) = request.host_ip {
                // An explicit host address publishes only its own family.
                if requested_ip.is_ipv6() != container_ip.is_ipv6()
                    && !requested_ip.is_unspecified()
                {
                    continue;
                }
            }

            let binding = if request.host_port == 0 {
                ResolvedBinding {
                    proto: request.proto.clone(),
                    host_ip,
                    host_port: 0,
                    container_ip,
                    container_port: request.port,
                }
            } else {
                allocate(request, host_ip, container_ip, active)?
            };
            if let Some(key) = binding.key() {
                active.insert(key);
            }
            resolved.push(binding);
        }
    }

    Ok(resolved)
}

fn allocate(
    request: &PortBinding,
    host_ip: IpAddr,
    container_ip: IpAddr,
    active: &HashSet<BindingKey>,
) -> KeelResult<ResolvedBinding> {
    for host_port in request.range() {
        let key = (request.proto.clone(), host_ip, host_port);
        if !active.contains(&key) {
            return Ok(ResolvedBinding {
                proto: request.proto.clone(),
                host_ip,
                host_port,
                container_ip,
                container_port: request.port,
            });
        }
    }
    Err(KeelError::AlreadyExists {
        resource: "port binding",
        id: format!(
            "{}:{}:{}-{}",
            request.proto,
            host_ip,
            request.host_port,
            *request.range().end()
        ),
    })
}

/// Locally administered MAC derived from the endpoint's IPv4 address.
/// Stable across restarts so ARP caches stay warm.
#[must_use]
pub fn mac_from_ip(ip: Ipv4Addr) -> [u8; 6] {
    let o = ip.octets();
    [0x02, 0x42, o[0], o[1], o[2], o[3]]
}

/// `Option<Cidr>` as its canonical string form.
mod cidr_opt_serde {
    use keel_common::Cidr;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(cidr: &Option<Cidr>, ser: S) -> Result<S::Ok, S::Error> {
        cidr.map(|c| c.to_string()).serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Cidr>, D::Error> {
        let s = Option::<String>::deserialize(de)?;
        s.map(|s| s.parse().map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp(port: u16, host_port: u16) -> PortBinding {
        PortBinding {
            proto: "tcp".to_string(),
            port,
            host_ip: None,
            host_port,
            host_port_end: 0,
        }
    }

    #[test]
    fn fixed_port_resolves_to_itself() {
        let mut active = HashSet::new();
        let resolved = resolve_bindings(
            &[tcp(80, 8080)],
            Some("172.17.0.2".parse().unwrap()),
            None,
            None,
            &mut active,
        )
        .unwrap();

        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].host_port, 8080);
        assert_eq!(resolved[0].host_ip, "0.0.0.0".parse::<IpAddr>().unwrap());
        assert!(active.contains(&("tcp".to_string(), resolved[0].host_ip, 8080)));
    }

    #[test]
    fn duplicate_tuple_is_rejected() {
        let mut active = HashSet::new();
        resolve_bindings(
            &[tcp(80, 8080)],
            Some("172.17.0.2".parse().unwrap()),
            None,
            None,
            &mut active,
        )
        .unwrap();

        let err = resolve_bindings(
            &[tcp(81, 8080)],
            Some("172.17.0.3".parse().unwrap()),
            None,
            None,
            &mut active,
        )
        .unwrap_err();
        assert!(matches!(err, KeelError::AlreadyExists { .. }));
    }

    #[test]
    fn range_takes_the_first_free_port() {
        let mut active = HashSet::new();
        let any: IpAddr = "0.0.0.0".parse().unwrap();
        active.insert(("tcp".to_string(), any, 8080));
        active.insert(("tcp".to_string(), any, 8081));

        let mut request = tcp(80, 8080);
        request.host_port_end = 8090;
        let resolved = resolve_bindings(
            &[request],
            Some("172.17.0.2".parse().unwrap()),
            None,
            None,
            &mut active,
        )
        .unwrap();
        assert_eq!(resolved[0].host_port, 8082);
    }

    #[test]
    fn exhausted_range_reports_already_exists() {
        let mut active = HashSet::new();
        let any: IpAddr = "0.0.0.0".parse().unwrap();
        active.insert(("tcp".to_string(), any, 8080));
        active.insert(("tcp".to_string(), any, 8081));

        let mut request = tcp(80, 8080);
        request.host_port_end = 8081;
        let err = resolve_bindings(
            &[request],
            Some("172.17.0.2".parse().unwrap()),
            None,
            None,
            &mut active,
        )
        .unwrap_err();
        assert!(matches!(err, KeelError::AlreadyExists { .. }));
    }

    #[test]
    fn different_protocols_share_a_port() {
        let mut active = HashSet::new();
        let mut udp = tcp(53, 53);
        udp.proto = "udp".to_string();
        let resolved = resolve_bindings(
            &[tcp(53, 53), udp],
            Some("172.17.0.2".parse().unwrap()),
            None,
            None,
            &mut active,
        )
        .unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].host_port, 53);
        assert_eq!(resolved[1].host_port, 53);
    }

    #[test]
    fn zero_host_port_occupies_no_tuple() {
        let mut active = HashSet::new();
        let resolved = resolve_bindings(
            &[tcp(80, 0), tcp(81, 0)],
            Some("172.17.0.2".parse().unwrap()),
            None,
            None,
            &mut active,
        )
        .unwrap();
        assert_eq!(resolved.len(), 2);
        assert!(active.is_empty());
    }

    #[test]
    fn dual_stack_endpoint_gets_one_binding_per_family() {
        let mut active = HashSet::new();
        let resolved = resolve_bindings(
            &[tcp(80, 8080)],
            Some("172.17.0.2".parse().unwrap()),
            Some("fd00:1::2".parse().unwrap()),
            None,
            &mut active,
        )
        .unwrap();

        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].host_ip, "0.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(resolved[1].host_ip, "::".parse::<IpAddr>().unwrap());
        assert_eq!(active.len(), 2);
    }

    #[test]
    fn explicit_host_address_publishes_only_its_family() {
        let mut active = HashSet::new();
        let mut request = tcp(80, 8080);
        request.host_ip = Some("192.168.1.5".parse().unwrap());
        let resolved = resolve_bindings(
            &[request],
            Some("172.17.0.2".parse().unwrap()),
            Some("fd00:1::2".parse().unwrap()),
            None,
            &mut active,
        )
        .unwrap();

        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].host_ip, "192.168.1.5".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn inverted_range_is_invalid() {
        let mut active = HashSet::new();
        let mut request = tcp(80, 9000);
        request.host_port_end = 8000;
        let err = resolve_bindings(
            &[request],
            Some("172.17.0.2".parse().unwrap()),
            None,
            None,
            &mut active,
        )
        .unwrap_err();
        assert!(matches!(err, KeelError::InvalidParameter { .. }));
    }

    #[test]
    fn mac_is_derived_from_the_ipv4_address() {
        let mac = mac_from_ip("172.17.0.2".parse().unwrap());
        assert_eq!(mac, [0x02, 0x42, 172, 17, 0, 2]);
        // Locally administered, unicast.
        assert_eq!(mac[0] & 0x03, 0x02);
    }

    #[test]
    fn record_survives_a_serde_round_trip() {
        let record = EndpointRecord {
            id: "e1".to_string(),
            network_id: "n1".to_string(),
            addr: Some("172.17.0.2/16".parse().unwrap()),
            addr_v6: None,
            mac: Some([0x02, 0x42, 172, 17, 0, 2]),
            host_if_name: "veth123".to_string(),
            container_if_name: Some("eth0".to_string()),
            sandbox_key: Some("/var/run/netns/s1".to_string()),
            bindings: vec![ResolvedBinding {
                proto: "tcp".to_string(),
                host_ip: "0.0.0.0".parse().unwrap(),
                host_port: 8080,
                container_ip: "172.17.0.2".parse().unwrap(),
                container_port: 80,
            }],
        };

        let json = serde_json::to_vec(&record).unwrap();
        let back: EndpointRecord = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.addr, record.addr);
        assert_eq!(back.bindings, record.bindings);
        assert_eq!(back.ipv4(), Some("172.17.0.2".parse().unwrap()));
        assert_eq!(back.ipv6(), None);
    }
}
