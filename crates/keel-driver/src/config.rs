//! Network configuration: option labels, validation and the persisted
//! record shape.

use std::net::IpAddr;

use keel_common::{Cidr, KeelError, KeelResult};
use keel_firewall::{FamilyConfig, NetworkConfig};
use serde::{Deserialize, Serialize};

use crate::api::{IpamData, Options};

/// Label setting the bridge interface name.
pub const OPT_BRIDGE_NAME: &str = "com.docker.network.bridge.name";
/// Label toggling inter-container connectivity.
pub const OPT_ENABLE_ICC: &str = "com.docker.network.bridge.enable_icc";
/// Label toggling masquerading of outbound traffic.
pub const OPT_ENABLE_MASQUERADE: &str = "com.docker.network.bridge.enable_ip_masquerade";
/// Label binding published ports to one host address by default.
pub const OPT_HOST_BINDING_IPV4: &str = "com.docker.network.bridge.host_binding_ipv4";
/// Label marking the daemon's default bridge.
pub const OPT_DEFAULT_BRIDGE: &str = "com.docker.network.bridge.default_bridge";
/// Label selecting the IPv4 gateway mode.
pub const OPT_GATEWAY_MODE_V4: &str = "com.docker.network.bridge.gateway_mode_ipv4";
/// Label selecting the IPv6 gateway mode.
pub const OPT_GATEWAY_MODE_V6: &str = "com.docker.network.bridge.gateway_mode_ipv6";
/// Label listing host interfaces trusted to reach the bridge,
/// colon-separated.
pub const OPT_TRUSTED_HOST_INTERFACES: &str =
    "com.docker.network.bridge.trusted_host_interfaces";
/// Label setting the bridge MTU.
pub const OPT_MTU: &str = "com.docker.network.driver.mtu";
/// Label cutting the network off from the host's uplinks.
pub const OPT_INTERNAL: &str = "com.docker.network.internal";
/// Label enabling IPv6 on the network.
pub const OPT_ENABLE_IPV6: &str = "com.docker.network.enable_ipv6";

/// Prefix a generated bridge name carries when [`OPT_BRIDGE_NAME`] is not
/// given.
pub const BRIDGE_NAME_PREFIX: &str = "br-";

/// How a family's traffic leaves the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GatewayMode {
    /// NATed behind the host, published ports only.
    #[default]
    Nat,
    /// NATed, but the default DROP for unpublished ports is lifted.
    NatUnprotected,
    /// Routed: container addresses are reachable as-is, no NAT.
    Routed,
}

impl GatewayMode {
    fn parse(value: &str) -> KeelResult<Self> {
        match value {
            "nat" => Ok(Self::Nat),
            "nat-unprotected" => Ok(Self::NatUnprotected),
            "routed" => Ok(Self::Routed),
            other => Err(KeelError::invalid(format!("unknown gateway mode {other}"))),
        }
    }

    /// Whether this mode exempts the family from per-endpoint direct
    /// access filtering.
    #[must_use]
    pub fn routed(self) -> bool {
        matches!(self, Self::Routed)
    }
}

/// Per-family address assignment, derived from one [`IpamData`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyAddressing {
    /// The network's pool.
    #[serde(with = "cidr_serde")]
    pub pool: Cidr,
    /// The gateway address, with the pool's prefix length.
    #[serde(with = "cidr_serde")]
    pub gateway: Cidr,
}

/// Validated, persistable network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Network id the controller assigned.
    pub id: String,
    /// Bridge interface name.
    pub bridge_name: String,
    /// Inter-container connectivity.
    pub enable_icc: bool,
    /// Masquerade outbound traffic.
    pub enable_masquerade: bool,
    /// Default host address for published ports.
    pub host_binding_ipv4: Option<IpAddr>,
    /// This is the daemon's default bridge.
    pub default_bridge: bool,
    /// No host uplink, traffic stays on the bridge.
    pub internal: bool,
    /// Bridge MTU; `0` leaves the kernel default.
    pub mtu: u32,
    /// IPv4 gateway mode.
    pub gateway_mode_v4: GatewayMode,
    /// IPv6 gateway mode.
    pub gateway_mode_v6: GatewayMode,
    /// Host interfaces allowed past the inter-network isolation rules.
    pub trusted_host_interfaces: Vec<String>,
    /// IPv4 addressing; bridge networks always carry one.
    pub addr4: Option<FamilyAddressing>,
    /// IPv6 addressing, present when IPv6 is enabled.
    pub addr6: Option<FamilyAddressing>,
}

impl NetworkSettings {
    /// Parse driver options and allocated pools into a validated
    /// configuration.
    ///
    /// # Errors
    ///
    /// [`KeelError::InvalidParameter`] on an unknown bridge-scoped label,
    /// a malformed value, or an inconsistent option combination.
    pub fn parse(
        id: &str,
        options: &Options,
        ipv4: &[IpamData],
        ipv6: &[IpamData],
    ) -> KeelResult<Self> {
        if id.is_empty() {
            return Err(KeelError::invalid("network id is empty"));
        }

        let mut settings = Self {
            id: id.to_string(),
            bridge_name: default_bridge_name(id),
            enable_icc: true,
            enable_masquerade: true,
            host_binding_ipv4: None,
            default_bridge: false,
            internal: false,
            mtu: 0,
            gateway_mode_v4: GatewayMode::default(),
            gateway_mode_v6: GatewayMode::default(),
            trusted_host_interfaces: Vec::new(),
            addr4: family_addressing(ipv4)?,
            addr6: family_addressing(ipv6)?,
        };

        for (label, value) in options {
            match label.as_str() {
                OPT_BRIDGE_NAME => {
                    if value.is_empty() {
                        return Err(KeelError::invalid("bridge name is empty"));
                    }
                    value.clone_into(&mut settings.bridge_name);
                }
                OPT_ENABLE_ICC => settings.enable_icc = parse_bool(label, value)?,
                OPT_ENABLE_MASQUERADE => {
                    settings.enable_masquerade = parse_bool(label, value)?;
                }
                OPT_HOST_BINDING_IPV4 => {
                    let ip: IpAddr = value
                        .parse()
                        .map_err(|_| KeelError::invalid(format!("bad {label}: {value}")))?;
                    settings.host_binding_ipv4 = Some(ip);
                }
                OPT_DEFAULT_BRIDGE => settings.default_bridge = parse_bool(label, value)?,
                OPT_GATEWAY_MODE_V4 => settings.gateway_mode_v4 = GatewayMode::parse(value)?,
                OPT_GATEWAY_MODE_V6 => settings.gateway_mode_v6 = GatewayMode::parse(value)?,
                OPT_TRUSTED_HOST_INTERFACES => {
                    settings.trusted_host_interfaces = value
                        .split(':')
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                OPT_MTU => {
                    settings.mtu = value
                        .parse()
                        .map_err(|_| KeelError::invalid(format!("bad {label}: {value}")))?;
                }
                OPT_INTERNAL => settings.internal = parse_bool(label, value)?,
                OPT_ENABLE_IPV6 => {}
                other if other.starts_with("com.docker.network.bridge.") => {
                    return Err(KeelError::invalid(format!("unknown bridge option {other}")));
                }
                // Labels outside the bridge namespace belong to other layers.
                _ => {}
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> KeelResult<()> {
        if self.addr4.is_none() && self.addr6.is_none() {
            return Err(KeelError::invalid("network has no address pool"));
        }
        if self.internal && (self.gateway_mode_v4.routed() || self.gateway_mode_v6.routed()) {
            return Err(KeelError::invalid(
                "internal networks cannot use a routed gateway mode",
            ));
        }
        // Routed traffic keeps its source address; masquerading it would
        // defeat the mode.
        let routed_everywhere = match (&self.addr4, &self.addr6) {
            (Some(_), Some(_)) => {
                self.gateway_mode_v4.routed() && self.gateway_mode_v6.routed()
            }
            (Some(_), None) => self.gateway_mode_v4.routed(),
            (None, Some(_)) => self.gateway_mode_v6.routed(),
            (None, None) => false,
        };
        if routed_everywhere && self.enable_masquerade {
            return Err(KeelError::invalid(
                "masquerading is meaningless on a fully routed network",
            ));
        }
        Ok(())
    }

    /// The firewall view of this configuration.
    #[must_use]
    pub fn to_firewall(&self) -> NetworkConfig {
        let family = |addr: &Option<FamilyAddressing>, mode: GatewayMode| {
            addr.as_ref().map(|a| FamilyConfig {
                prefix: a.pool,
                host_ip: self.host_binding_ipv4.filter(|ip| {
                    // The binding address only steers SNAT for its family.
                    ip.is_ipv4() == !a.pool.is_ipv6()
                }),
                routed: mode.routed(),
                unprotected: mode == GatewayMode::NatUnprotected,
            })
        };
        NetworkConfig {
            if_name: self.bridge_name.clone(),
            internal: self.internal,
            icc: self.enable_icc,
            masquerade: self.enable_masquerade,
            trusted_host_interfaces: self.trusted_host_interfaces.clone(),
            config4: family(&self.addr4, self.gateway_mode_v4),
            config6: family(&self.addr6, self.gateway_mode_v6),
        }
    }
}

/// The generated bridge name for a network id.
#[must_use]
pub fn default_bridge_name(id: &str) -> String {
    format!("{BRIDGE_NAME_PREFIX}{}", short_id(id, 12))
}

/// Truncate an opaque id to at most `max` bytes without splitting a
/// character. Ids come from the controller and are not guaranteed ASCII.
pub(crate) fn short_id(id: &str, max: usize) -> &str {
    if id.len() <= max {
        return id;
    }
    let mut end = max;
    while !id.is_char_boundary(end) {
        end -= 1;
    }
    &id[..end]
}

fn parse_bool(label: &str, value: &str) -> KeelResult<bool> {
    value
        .parse()
        .map_err(|_| KeelError::invalid(format!("bad {label}: {value}")))
}

/// Reduce the controller's pool list to the single pool per family the
/// bridge driver supports, defaulting the gateway to the pool's first
/// host address.
fn family_addressing(data: &[IpamData]) -> KeelResult<Option<FamilyAddressing>> {
    let Some(first) = data.first() else {
        return Ok(None);
    };
    if data.len() > 1 {
        return Err(KeelError::invalid("bridge networks take one pool per family"));
    }
    let gateway = match first.gateway {
        Some(gw) => gw,
        None => first_host(&first.pool)?,
    };
    if !first.pool.contains(gateway.addr()) {
        return Err(KeelError::invalid(format!(
            "gateway {gateway} outside pool {}",
            first.pool
        )));
    }
    Ok(Some(FamilyAddressing {
        pool: first.pool,
        gateway,
    }))
}

fn first_host(pool: &Cidr) -> KeelResult<Cidr> {
    let gw = match pool.addr() {
        IpAddr::V4(v4) => IpAddr::V4(
            u32::from(v4)
                .checked_add(1)
                .ok_or_else(|| KeelError::invalid(format!("pool {pool} has no host addresses")))?
                .into(),
        ),
        IpAddr::V6(v6) => IpAddr::V6(
            u128::from(v6)
                .checked_add(1)
                .ok_or_else(|| KeelError::invalid(format!("pool {pool} has no host addresses")))?
                .into(),
        ),
    };
    Cidr::new(gw, pool.prefix_len())
}

/// `Cidr` as its canonical string form, for the persisted record.
pub(crate) mod cidr_serde {
    use keel_common::Cidr;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(cidr: &Cidr, ser: S) -> Result<S::Ok, S::Error> {
        cidr.to_string().serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Cidr, D::Error> {
        let s = String::deserialize(de)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn pool(cidr: &str, gateway: Option<&str>) -> IpamData {
        IpamData {
            address_space: "local".to_string(),
            pool: cidr.parse().unwrap(),
            gateway: gateway.map(|g| g.parse().unwrap()),
            aux_addresses: HashMap::new(),
        }
    }

    fn opts(pairs: &[(&str, &str)]) -> Options {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn defaults_fill_in_for_an_empty_option_map() {
        let s = NetworkSettings::parse(
            "0123456789abcdef",
            &Options::new(),
            &[pool("172.20.0.0/16", None)],
            &[],
        )
        .unwrap();

        assert_eq!(s.bridge_name, "br-0123456789ab");
        assert!(s.enable_icc);
        assert!(s.enable_masquerade);
        assert!(!s.internal);
        assert_eq!(s.gateway_mode_v4, GatewayMode::Nat);
        // Gateway defaults to the first host address of the pool.
        assert_eq!(s.addr4.unwrap().gateway.to_string(), "172.20.0.1/16");
    }

    #[test]
    fn labels_override_defaults() {
        let s = NetworkSettings::parse(
            "n1",
            &opts(&[
                (OPT_BRIDGE_NAME, "docker0"),
                (OPT_ENABLE_ICC, "false"),
                (OPT_ENABLE_MASQUERADE, "false"),
                (OPT_HOST_BINDING_IPV4, "192.168.1.5"),
                (OPT_MTU, "1450"),
                (OPT_TRUSTED_HOST_INTERFACES, "eth1:eth2"),
            ]),
            &[pool("172.17.0.0/16", Some("172.17.0.1/16"))],
            &[],
        )
        .unwrap();

        assert_eq!(s.bridge_name, "docker0");
        assert!(!s.enable_icc);
        assert!(!s.enable_masquerade);
        assert_eq!(s.host_binding_ipv4, Some("192.168.1.5".parse().unwrap()));
        assert_eq!(s.mtu, 1450);
        assert_eq!(s.trusted_host_interfaces, ["eth1", "eth2"]);
    }

    #[test]
    fn unknown_bridge_scoped_labels_are_rejected() {
        let err = NetworkSettings::parse(
            "n1",
            &opts(&[("com.docker.network.bridge.bogus", "1")]),
            &[pool("172.17.0.0/16", None)],
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, KeelError::InvalidParameter { .. }));

        // Labels outside the bridge namespace are someone else's.
        NetworkSettings::parse(
            "n1",
            &opts(&[("com.example.other", "1")]),
            &[pool("172.17.0.0/16", None)],
            &[],
        )
        .unwrap();
    }

    #[test]
    fn internal_rejects_routed_gateway_mode() {
        let err = NetworkSettings::parse(
            "n1",
            &opts(&[(OPT_INTERNAL, "true"), (OPT_GATEWAY_MODE_V4, "routed")]),
            &[pool("172.17.0.0/16", None)],
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, KeelError::InvalidParameter { .. }));
    }

    #[test]
    fn fully_routed_network_rejects_masquerade() {
        let err = NetworkSettings::parse(
            "n1",
            &opts(&[(OPT_GATEWAY_MODE_V4, "routed")]),
            &[pool("172.17.0.0/16", None)],
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, KeelError::InvalidParameter { .. }));

        // Explicitly disabling masquerade makes routed consistent.
        let s = NetworkSettings::parse(
            "n1",
            &opts(&[
                (OPT_GATEWAY_MODE_V4, "routed"),
                (OPT_ENABLE_MASQUERADE, "false"),
            ]),
            &[pool("172.17.0.0/16", None)],
            &[],
        )
        .unwrap();
        assert!(s.gateway_mode_v4.routed());
    }

    #[test]
    fn generated_bridge_names_respect_char_boundaries() {
        // A multi-byte character straddling the 12-byte cut must not
        // split; the name just comes out a byte shorter.
        let s = NetworkSettings::parse(
            "abcdefghijk\u{e9}z",
            &Options::new(),
            &[pool("172.20.0.0/16", None)],
            &[],
        )
        .unwrap();
        assert_eq!(s.bridge_name, "br-abcdefghijk");

        assert_eq!(default_bridge_name("caf\u{e9}"), "br-caf\u{e9}");
    }

    #[test]
    fn all_ones_pool_without_a_gateway_is_rejected() {
        let err = NetworkSettings::parse(
            "n1",
            &Options::new(),
            &[pool("255.255.255.255/32", None)],
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, KeelError::InvalidParameter { .. }));
    }

    #[test]
    fn gateway_outside_pool_is_rejected() {
        let err = NetworkSettings::parse(
            "n1",
            &Options::new(),
            &[pool("172.17.0.0/16", Some("10.0.0.1/16"))],
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, KeelError::InvalidParameter { .. }));
    }

    #[test]
    fn firewall_view_carries_modes_and_binding() {
        let s = NetworkSettings::parse(
            "n1",
            &opts(&[
                (OPT_GATEWAY_MODE_V6, "nat-unprotected"),
                (OPT_HOST_BINDING_IPV4, "203.0.113.7"),
            ]),
            &[pool("172.17.0.0/16", None)],
            &[pool("fd00:1::/64", None)],
        )
        .unwrap();

        let fw = s.to_firewall();
        let v4 = fw.config4.unwrap();
        assert_eq!(v4.host_ip, Some("203.0.113.7".parse().unwrap()));
        assert!(!v4.unprotected);
        let v6 = fw.config6.unwrap();
        assert!(v6.unprotected);
        // An IPv4 binding address never leaks into the IPv6 family.
        assert_eq!(v6.host_ip, None);
    }

    #[test]
    fn settings_survive_a_serde_round_trip() {
        let s = NetworkSettings::parse(
            "n1",
            &opts(&[(OPT_MTU, "9000")]),
            &[pool("172.17.0.0/16", None)],
            &[pool("fd00:1::/64", Some("fd00:1::1/64"))],
        )
        .unwrap();

        let json = serde_json::to_vec(&s).unwrap();
        let back: NetworkSettings = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.mtu, 9000);
        assert_eq!(back.addr6.unwrap().gateway.to_string(), "fd00:1::1/64");
    }
}
