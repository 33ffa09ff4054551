//! Per-network rule programming.
//!
//! A network's rules are computed as an ordered list of tagged operations
//! and applied front to back; every applied operation is pushed onto a
//! cleaner stack that deletion and rollback unwind in reverse. Isolation
//! teardown is best effort: those errors are logged so a partial failure
//! never strands the chains half-rebuilt.

use std::net::IpAddr;
use std::sync::Arc;

use keel_common::{Cidr, KeelResult};
use parking_lot::Mutex;

use crate::chains::{
    BRIDGE_CHAIN, CT_CHAIN, DOCKER_CHAIN, FORWARD_CHAIN, ISOLATION_STAGE_1, ISOLATION_STAGE_2,
    Iptabler, RuleOp,
};
use crate::rule::{IpVersion, Table, args};

/// One IP family of a network's firewall configuration.
#[derive(Debug, Clone)]
pub struct FamilyConfig {
    /// Bridge subnet for this family.
    pub prefix: Cidr,
    /// SNAT to this address instead of masquerading when set.
    pub host_ip: Option<IpAddr>,
    /// Routed gateway mode: no NAT, inbound traffic allowed.
    pub routed: bool,
    /// Skip the per-network default DROP (accept unpublished ports).
    pub unprotected: bool,
}

impl FamilyConfig {
    /// The NAT target: SNAT to the bound host address, else MASQUERADE.
    fn nat_target(&self) -> Vec<String> {
        match self.host_ip {
            Some(ip) => args(["-j", "SNAT", "--to-source", &ip.to_string()]),
            None => args(["-j", "MASQUERADE"]),
        }
    }
}

/// Firewall-facing description of one bridge network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bridge interface name.
    pub if_name: String,
    /// Internal network: no host or external connectivity.
    pub internal: bool,
    /// Inter-container communication on the same bridge.
    pub icc: bool,
    /// Masquerade outbound traffic.
    pub masquerade: bool,
    /// Host interfaces allowed to reach the bridge directly.
    pub trusted_host_interfaces: Vec<String>,
    /// IPv4 family settings, if the network has an IPv4 subnet.
    pub config4: Option<FamilyConfig>,
    /// IPv6 family settings, if the network has an IPv6 subnet.
    pub config6: Option<FamilyConfig>,
}

impl NetworkConfig {
    /// The family settings for one IP version.
    #[must_use]
    pub fn family(&self, v: IpVersion) -> Option<&FamilyConfig> {
        match v {
            IpVersion::V4 => self.config4.as_ref(),
            IpVersion::V6 => self.config6.as_ref(),
        }
    }
}

/// Whether a failure undoing this operation is logged rather than
/// returned. Isolation-chain teardown must never abort a deletion midway.
fn best_effort_removal(op: &RuleOp) -> bool {
    op.chain == ISOLATION_STAGE_1 || op.chain == ISOLATION_STAGE_2
}

/// The inter-network isolation rules for one family.
fn inc_ops(v: IpVersion, if_name: &str, routed: bool) -> Vec<RuleOp> {
    let mut ops = Vec::new();
    if routed {
        // Routed networks accept inbound traffic from other bridges;
        // replies are matched first, so the conntrack accept sits above
        // the blanket return. Top inserts land in reverse push order.
        ops.push(RuleOp::insert_top(
            v,
            Table::Filter,
            ISOLATION_STAGE_1,
            args(["-o", if_name, "-j", "RETURN"]),
        ));
        ops.push(RuleOp::insert_top(
            v,
            Table::Filter,
            ISOLATION_STAGE_1,
            args([
                "-m",
                "conntrack",
                "--ctstate",
                "RELATED,ESTABLISHED",
                "-o",
                if_name,
                "-j",
                "ACCEPT",
            ]),
        ));
    }
    ops.push(RuleOp::append(
        v,
        Table::Filter,
        ISOLATION_STAGE_1,
        args(["-i", if_name, "!", "-o", if_name, "-j", ISOLATION_STAGE_2]),
    ));
    ops.push(RuleOp::insert_top(
        v,
        Table::Filter,
        ISOLATION_STAGE_2,
        args(["-o", if_name, "-j", "DROP"]),
    ));
    ops
}

/// The ICC accept/drop for one family.
fn icc_ops(v: IpVersion, config: &NetworkConfig) -> Vec<RuleOp> {
    let if_name = config.if_name.as_str();
    if config.icc {
        if config.internal {
            // Internal networks get intra-bridge traffic only.
            vec![RuleOp::append(
                v,
                Table::Filter,
                FORWARD_CHAIN,
                args(["-i", if_name, "-o", if_name, "-j", "ACCEPT"]),
            )]
        } else {
            vec![RuleOp::append(
                v,
                Table::Filter,
                FORWARD_CHAIN,
                args(["-i", if_name, "-j", "ACCEPT"]),
            )]
        }
    } else {
        vec![RuleOp::append(
            v,
            Table::Filter,
            FORWARD_CHAIN,
            args(["-i", if_name, "-o", if_name, "-j", "DROP"]),
        )]
    }
}

/// The full ordered rule list for one family of a network.
fn family_ops(
    iptabler: &Iptabler,
    config: &NetworkConfig,
    v: IpVersion,
    fam: &FamilyConfig,
) -> Vec<RuleOp> {
    let if_name = config.if_name.as_str();
    let prefix = fam.prefix.to_string();
    let hairpin = iptabler.config().hairpin;
    let mut ops = Vec::new();

    if config.internal {
        // Nothing enters or leaves the bridge with an outside address.
        ops.push(RuleOp::append(
            v,
            Table::Filter,
            ISOLATION_STAGE_1,
            args(["-i", if_name, "!", "-d", &prefix, "-j", "DROP"]),
        ));
        ops.push(RuleOp::append(
            v,
            Table::Filter,
            ISOLATION_STAGE_1,
            args(["-o", if_name, "!", "-s", &prefix, "-j", "DROP"]),
        ));
        ops.extend(icc_ops(v, config));
        return ops;
    }

    // 1. Outbound NAT.
    if config.masquerade && !fam.routed {
        let mut rule = args(["-s", &prefix, "!", "-o", if_name]);
        rule.extend(fam.nat_target());
        ops.push(RuleOp::append(v, Table::Nat, "POSTROUTING", rule));
    }
    // 2./3. Hairpin split: without hairpin, proxy-handled traffic must not
    // be DNATed back into the bridge; with hairpin, localhost sources are
    // NATed out through it.
    if config.masquerade && !hairpin {
        ops.push(RuleOp::append(
            v,
            Table::Nat,
            DOCKER_CHAIN,
            args(["-i", if_name, "-j", "RETURN"]),
        ));
    }
    if config.masquerade && hairpin {
        let mut rule = args(["-m", "addrtype", "--src-type", "LOCAL", "-o", if_name]);
        rule.extend(fam.nat_target());
        ops.push(RuleOp::append(v, Table::Nat, "POSTROUTING", rule));
    }
    // 4./5. ICC and outgoing accept.
    ops.extend(icc_ops(v, config));
    if !config.icc {
        ops.push(RuleOp::append(
            v,
            Table::Filter,
            FORWARD_CHAIN,
            args(["-i", if_name, "!", "-o", if_name, "-j", "ACCEPT"]),
        ));
    }
    // 6. Routed networks answer pings.
    if fam.routed {
        let icmp = match v {
            IpVersion::V4 => "icmp",
            IpVersion::V6 => "icmpv6",
        };
        ops.push(RuleOp::append(
            v,
            Table::Filter,
            DOCKER_CHAIN,
            args(["-o", if_name, "-p", icmp, "-j", "ACCEPT"]),
        ));
    }
    // 7. Established flows back into the bridge.
    ops.push(RuleOp::append(
        v,
        Table::Filter,
        CT_CHAIN,
        args([
            "-o",
            if_name,
            "-m",
            "conntrack",
            "--ctstate",
            "RELATED,ESTABLISHED",
            "-j",
            "ACCEPT",
        ]),
    ));
    // 8. Per-bridge dispatch into DOCKER.
    ops.push(RuleOp::append(
        v,
        Table::Filter,
        BRIDGE_CHAIN,
        args(["-o", if_name, "-j", DOCKER_CHAIN]),
    ));
    // 9. Per-network default; published ports are inserted above it.
    let default_verdict = if fam.unprotected { "ACCEPT" } else { "DROP" };
    ops.push(RuleOp::append(
        v,
        Table::Filter,
        DOCKER_CHAIN,
        args(["!", "-i", if_name, "-o", if_name, "-j", default_verdict]),
    ));
    // 10. Inter-network isolation.
    ops.extend(inc_ops(v, if_name, fam.routed));
    // Trusted host interfaces bypass the default drop.
    for trusted in &config.trusted_host_interfaces {
        ops.push(RuleOp::insert_top(
            v,
            Table::Filter,
            DOCKER_CHAIN,
            args(["-i", trusted.as_str(), "-o", if_name, "-j", "ACCEPT"]),
        ));
    }

    ops
}

/// Re-run a network's network-level rules after a firewalld wipe.
/// Idempotent against surviving rules.
pub(crate) fn reapply_network_level_rules(
    iptabler: &Iptabler,
    config: &NetworkConfig,
) -> KeelResult<()> {
    for v in iptabler.families() {
        match config.family(v) {
            Some(fam) => {
                for op in family_ops(iptabler, config, v, fam) {
                    iptabler.apply_op(&op)?;
                }
            }
            None => clear_inc(iptabler, v, &config.if_name),
        }
    }
    tracing::debug!(bridge = %config.if_name, "network rules reapplied");
    Ok(())
}

/// Remove any isolation rules for a family the network does not carry.
/// Cleanup after config changes; absent rules are no-ops.
fn clear_inc(iptabler: &Iptabler, v: IpVersion, if_name: &str) {
    for routed in [true, false] {
        for op in inc_ops(v, if_name, routed) {
            if let Err(e) = iptabler.remove_op(&op) {
                tracing::warn!(error = %e, bridge = if_name, "isolation cleanup");
            }
        }
    }
}

/// Live firewall state of one network: its config plus the cleaner stack
/// accumulated by network, endpoint and port programming.
#[derive(Debug)]
pub struct NetworkFirewall {
    iptabler: Arc<Iptabler>,
    config: NetworkConfig,
    cleaners: Mutex<Vec<RuleOp>>,
    zone_registered: Mutex<bool>,
}

impl Iptabler {
    /// Program all network-level rules for a new network.
    ///
    /// # Errors
    ///
    /// On any rule failure every already-applied rule is removed and the
    /// error returned; no partial state survives.
    pub fn new_network(self: &Arc<Self>, config: NetworkConfig) -> KeelResult<NetworkFirewall> {
        let fw = NetworkFirewall {
            iptabler: Arc::clone(self),
            config,
            cleaners: Mutex::new(Vec::new()),
            zone_registered: Mutex::new(false),
        };

        for v in self.families() {
            match fw.config.family(v) {
                Some(fam) => {
                    let ops = family_ops(self, &fw.config, v, fam);
                    for op in ops {
                        if let Err(e) = fw.apply_tracked(&op) {
                            fw.unwind();
                            return Err(e);
                        }
                    }
                }
                None => clear_inc(self, v, &fw.config.if_name),
            }
        }

        if let Err(e) = self.firewalld().add_interface_to_zone(&fw.config.if_name) {
            fw.unwind();
            return Err(e);
        }
        *fw.zone_registered.lock() = self.firewalld().is_running();

        self.register_network(fw.config.clone());
        tracing::info!(bridge = %fw.config.if_name, "network firewall programmed");
        Ok(fw)
    }
}

impl NetworkFirewall {
    pub(crate) fn iptabler(&self) -> &Arc<Iptabler> {
        &self.iptabler
    }

    /// The network's firewall configuration.
    #[must_use]
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Apply one operation and record its cleaner.
    pub(crate) fn apply_tracked(&self, op: &RuleOp) -> KeelResult<()> {
        self.iptabler.apply_op(op)?;
        self.cleaners.lock().push(op.clone());
        Ok(())
    }

    /// Remove one operation and retire its cleaner.
    pub(crate) fn remove_tracked(&self, op: &RuleOp) -> KeelResult<()> {
        self.iptabler.remove_op(op)?;
        let mut cleaners = self.cleaners.lock();
        if let Some(idx) = cleaners.iter().rposition(|c| {
            c.v == op.v && c.table == op.table && c.chain == op.chain && c.args == op.args
        }) {
            cleaners.remove(idx);
        }
        Ok(())
    }

    /// Remove the most recent cleaners down to `keep`, in reverse order.
    pub(crate) fn unwind_to(&self, keep: usize) {
        let mut cleaners = self.cleaners.lock();
        while cleaners.len() > keep {
            let Some(op) = cleaners.pop() else { break };
            if let Err(e) = self.iptabler.remove_op(&op) {
                if best_effort_removal(&op) {
                    tracing::warn!(error = %e, chain = op.chain, "isolation teardown");
                } else {
                    tracing::error!(error = %e, chain = op.chain, "rule teardown failed");
                }
            }
        }
    }

    pub(crate) fn cleaner_count(&self) -> usize {
        self.cleaners.lock().len()
    }

    fn unwind(&self) {
        self.unwind_to(0);
    }

    /// Re-run the network-level rules, e.g. after a firewalld reload.
    ///
    /// # Errors
    ///
    /// Returns the first rule error.
    pub fn reapply_network_level_rules(&self) -> KeelResult<()> {
        reapply_network_level_rules(&self.iptabler, &self.config)
    }

    /// Tear the network's rules down, unwinding every registered cleaner
    /// in reverse order and releasing the firewalld zone registration.
    pub fn delete(&self) {
        if std::mem::take(&mut *self.zone_registered.lock()) {
            if let Err(e) = self
                .iptabler
                .firewalld()
                .remove_interface_from_zone(&self.config.if_name)
            {
                tracing::warn!(error = %e, bridge = %self.config.if_name, "zone removal");
            }
        }
        self.unwind();
        self.iptabler.unregister_network(&self.config.if_name);
        tracing::info!(bridge = %self.config.if_name, "network firewall removed");
    }
}
