//! Published-port rule programming.
//!
//! Each binding maps to up to five rules: the DNAT, the hairpin
//! masquerade, the top-inserted open-port accept (so it precedes the
//! per-network default drop), the SCTP checksum mangle, and the raw-table
//! loopback hardening.

use std::net::IpAddr;

use keel_common::{KeelError, KeelResult};

use crate::chains::{DOCKER_CHAIN, RuleOp};
use crate::network::NetworkFirewall;
use crate::rule::{IpVersion, Table, args};

/// One published port, as the firewall sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    /// `tcp`, `udp` or `sctp`. ICMP bindings carry no port and install no
    /// rules.
    pub proto: String,
    /// Host address the port is bound to; unspecified means all.
    pub host_ip: IpAddr,
    /// Host port; 0 publishes without host exposure (no NAT).
    pub host_port: u16,
    /// Container address.
    pub container_ip: IpAddr,
    /// Container port.
    pub container_port: u16,
}

impl PortBinding {
    fn family(&self) -> IpVersion {
        if self.container_ip.is_ipv6() {
            IpVersion::V6
        } else {
            IpVersion::V4
        }
    }

    /// DNAT destination, bracketed for IPv6.
    fn nat_destination(&self) -> String {
        match self.container_ip {
            IpAddr::V4(ip) => format!("{ip}:{}", self.container_port),
            IpAddr::V6(ip) => format!("[{ip}]:{}", self.container_port),
        }
    }

    /// `-d` match for the NAT rule; unspecified binds cover everything.
    fn host_destination(&self) -> String {
        if self.host_ip.is_unspecified() {
            match self.family() {
                IpVersion::V4 => "0.0.0.0/0".to_string(),
                IpVersion::V6 => "::/0".to_string(),
            }
        } else {
            self.host_ip.to_string()
        }
    }

    fn is_ipv4_loopback(&self) -> bool {
        matches!(self.host_ip, IpAddr::V4(ip) if ip.is_loopback())
    }
}

/// The ordered rule list for one binding.
fn port_ops(fw: &NetworkFirewall, binding: &PortBinding) -> KeelResult<Vec<RuleOp>> {
    if binding.proto == "icmp" {
        // Port concepts do not apply; connectivity comes from the routed
        // or ICC rules.
        return Ok(Vec::new());
    }
    if !matches!(binding.proto.as_str(), "tcp" | "udp" | "sctp") {
        return Err(KeelError::invalid(format!(
            "unsupported protocol {}",
            binding.proto
        )));
    }

    let v = binding.family();
    if fw.config().family(v).is_none() {
        return Err(KeelError::invalid(format!(
            "{} binding on a network without that family",
            binding.container_ip
        )));
    }

    let daemon = fw.iptabler().config();
    let if_name = fw.config().if_name.clone();
    let proto = binding.proto.as_str();
    let cip = binding.container_ip.to_string();
    let cport = binding.container_port.to_string();
    let hport = binding.host_port.to_string();
    let mut ops = Vec::new();

    let nat = binding.host_port != 0;
    if nat {
        let mut rule = args(["-p", proto, "-d", &binding.host_destination(), "--dport", &hport]);
        if !daemon.hairpin {
            rule.extend(args(["!", "-i", &if_name]));
        }
        if v == IpVersion::V6 {
            // Link-local sources must not be DNATed.
            rule.extend(args(["!", "-s", "fe80::/10"]));
        }
        rule.extend(args(["-j", "DNAT", "--to-destination", &binding.nat_destination()]));
        ops.push(RuleOp::append(v, Table::Nat, DOCKER_CHAIN, rule));

        if daemon.hairpin {
            ops.push(RuleOp::append(
                v,
                Table::Nat,
                "POSTROUTING",
                args([
                    "-p", proto, "-s", &cip, "-d", &cip, "--dport", &cport, "-j", "MASQUERADE",
                ]),
            ));
        }
    }

    // Precedes the per-network default drop.
    ops.push(RuleOp::insert_top(
        v,
        Table::Filter,
        DOCKER_CHAIN,
        args([
            "!", "-i", &if_name, "-o", &if_name, "-p", proto, "-d", &cip, "--dport", &cport,
            "-j", "ACCEPT",
        ]),
    ));

    if nat && proto == "sctp" && daemon.sctp_checksum_fixup {
        // Offloaded NICs emit bad SCTP CRCs through NAT.
        ops.push(RuleOp::append(
            v,
            Table::Mangle,
            "POSTROUTING",
            args([
                "-p", "sctp", "-m", "sctp", "--dport", &hport, "-j", "CHECKSUM",
                "--checksum-fill",
            ]),
        ));
    }

    if nat && binding.is_ipv4_loopback() && !daemon.allow_direct_routing {
        let hip = binding.host_ip.to_string();
        if daemon.wsl2_mirrored {
            // Mirrored-mode Windows loopback traffic arrives on loopback0.
            ops.push(RuleOp::append(
                v,
                Table::Raw,
                "PREROUTING",
                args([
                    "-p", proto, "-d", &hip, "--dport", &hport, "-i", "loopback0", "-j",
                    "ACCEPT",
                ]),
            ));
        }
        ops.push(RuleOp::append(
            v,
            Table::Raw,
            "PREROUTING",
            args(["-p", proto, "-d", &hip, "--dport", &hport, "!", "-i", "lo", "-j", "DROP"]),
        ));
    }

    Ok(ops)
}

impl NetworkFirewall {
    /// Install the rules for a set of published ports.
    ///
    /// # Errors
    ///
    /// On failure every rule installed by this call is removed before the
    /// error is returned.
    pub fn add_ports(&self, bindings: &[PortBinding]) -> KeelResult<()> {
        let checkpoint = self.cleaner_count();
        for binding in bindings {
            let ops = match port_ops(self, binding) {
                Ok(ops) => ops,
                Err(e) => {
                    self.unwind_to(checkpoint);
                    return Err(e);
                }
            };
            for op in ops {
                if let Err(e) = self.apply_tracked(&op) {
                    self.unwind_to(checkpoint);
                    return Err(e);
                }
            }
            tracing::debug!(
                bridge = %self.config().if_name,
                proto = %binding.proto,
                host = %binding.host_ip,
                host_port = binding.host_port,
                container = %binding.container_ip,
                container_port = binding.container_port,
                "port published"
            );
        }
        Ok(())
    }

    /// Remove the rules of a set of published ports. Absent rules are
    /// no-ops, so retries are safe.
    ///
    /// # Errors
    ///
    /// Returns the first deletion error.
    pub fn del_ports(&self, bindings: &[PortBinding]) -> KeelResult<()> {
        for binding in bindings {
            for op in port_ops(self, binding)? {
                self.remove_tracked(&op)?;
            }
        }
        Ok(())
    }
}
