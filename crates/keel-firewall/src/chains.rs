//! The DOCKER chain topology.
//!
//! Chain names are a wire contract: co-operating systems jump to
//! `DOCKER-FORWARD`, so they never change. Startup removes whatever a
//! previous daemon left behind, recreates the chains, and wires the jumps
//! so the kernel evaluates conntrack accepts before per-bridge rules
//! before inter-network isolation.

use std::collections::HashMap;
use std::sync::Arc;

use keel_common::KeelResult;
use parking_lot::Mutex;

use crate::firewalld::Firewalld;
use crate::network::NetworkConfig;
use crate::rule::{Backend, IpVersion, Table, args};

/// Per-port and per-network NAT/filter rules live here.
pub const DOCKER_CHAIN: &str = "DOCKER";
/// Parent chain jumped to from `FORWARD`; the extension point for
/// co-operating systems.
pub const FORWARD_CHAIN: &str = "DOCKER-FORWARD";
/// Dispatches forwarded traffic to `DOCKER` per bridge.
pub const BRIDGE_CHAIN: &str = "DOCKER-BRIDGE";
/// Conntrack accepts for established flows into bridges.
pub const CT_CHAIN: &str = "DOCKER-CT";
/// First stage of inter-network isolation.
pub const ISOLATION_STAGE_1: &str = "DOCKER-ISOLATION-STAGE-1";
/// Second stage of inter-network isolation.
pub const ISOLATION_STAGE_2: &str = "DOCKER-ISOLATION-STAGE-2";
/// Single-stage isolation chain from old daemons; removed on startup.
pub const OBSOLETE_ISOLATION: &str = "DOCKER-ISOLATION";

const FILTER_CHAINS: &[&str] = &[
    DOCKER_CHAIN,
    FORWARD_CHAIN,
    BRIDGE_CHAIN,
    CT_CHAIN,
    ISOLATION_STAGE_1,
    ISOLATION_STAGE_2,
];

/// Raw-table rules are skipped entirely when this is set.
pub const ENV_NO_RAW: &str = "DOCKER_INSECURE_NO_IPTABLES_RAW";
/// Enables the SCTP checksum mangle workaround.
pub const ENV_SCTP_CHECKSUM: &str = "DOCKER_IPTABLES_SCTP_CHECKSUM";

/// Daemon-level firewall configuration.
#[derive(Debug, Clone)]
pub struct FirewallConfig {
    /// Program IPv4 rules.
    pub ipv4: bool,
    /// Program IPv6 rules.
    pub ipv6: bool,
    /// Hairpin mode: the userland proxy is disabled and bridges loop
    /// published traffic back through themselves.
    pub hairpin: bool,
    /// Set the `FORWARD` default policy to DROP.
    pub forward_policy_drop: bool,
    /// Skip raw-table rules (`DOCKER_INSECURE_NO_IPTABLES_RAW=1`).
    pub allow_direct_routing: bool,
    /// Install the SCTP checksum mangle rule for published SCTP ports.
    pub sctp_checksum_fixup: bool,
    /// WSL2 mirrored-networking mode detected.
    pub wsl2_mirrored: bool,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            ipv4: true,
            ipv6: false,
            hairpin: false,
            forward_policy_drop: true,
            allow_direct_routing: false,
            sctp_checksum_fixup: false,
            wsl2_mirrored: false,
        }
    }
}

impl FirewallConfig {
    /// Defaults plus environment toggles and WSL2 detection.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            allow_direct_routing: std::env::var(ENV_NO_RAW).is_ok_and(|v| v == "1"),
            sctp_checksum_fixup: std::env::var(ENV_SCTP_CHECKSUM).is_ok_and(|v| v == "1"),
            wsl2_mirrored: detect_wsl2_mirrored(),
            ..Self::default()
        }
    }
}

/// WSL2 mirrored-networking detection: the `loopback0` adapter exists and
/// `wslinfo` is executable. In mirrored mode Windows-to-Linux loopback
/// traffic arrives via PREROUTING rather than OUTPUT, so published
/// loopback ports need an extra NAT return.
#[must_use]
pub fn detect_wsl2_mirrored() -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::path::Path::new("/sys/class/net/loopback0").exists()
            && std::fs::metadata("/usr/bin/wslinfo")
                .map(|m| m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Where a rule lands in its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// Appended once; skipped when already present.
    Append,
    /// (Re)inserted at the top: an existing copy is deleted first so the
    /// rule ends up in position 1 without duplicating.
    InsertTop,
}

/// A single tagged rule operation; the unit of setup and rollback.
#[derive(Debug, Clone)]
pub(crate) struct RuleOp {
    pub v: IpVersion,
    pub table: Table,
    pub chain: &'static str,
    pub args: Vec<String>,
    pub placement: Placement,
}

impl RuleOp {
    pub(crate) fn append(
        v: IpVersion,
        table: Table,
        chain: &'static str,
        args: Vec<String>,
    ) -> Self {
        Self {
            v,
            table,
            chain,
            args,
            placement: Placement::Append,
        }
    }

    pub(crate) fn insert_top(
        v: IpVersion,
        table: Table,
        chain: &'static str,
        args: Vec<String>,
    ) -> Self {
        Self {
            v,
            table,
            chain,
            args,
            placement: Placement::InsertTop,
        }
    }
}

/// Owner of the chain topology and daemon-level rules.
///
/// Registers itself with the firewalld subscriber: a reload replays chain
/// creation first, then every live network's network-level rules.
#[derive(Debug)]
pub struct Iptabler {
    backend: Arc<dyn Backend>,
    config: FirewallConfig,
    firewalld: Arc<Firewalld>,
    /// Live network configs keyed by bridge name, for reload replay.
    networks: Mutex<HashMap<String, NetworkConfig>>,
}

impl Iptabler {
    /// Tear down stale state, build the chain topology and register the
    /// reload replay.
    ///
    /// # Errors
    ///
    /// Fails when chain creation or jump installation fails; stale-state
    /// removal errors are logged and ignored.
    pub fn new(
        backend: Arc<dyn Backend>,
        config: FirewallConfig,
        firewalld: &Arc<Firewalld>,
    ) -> KeelResult<Arc<Self>> {
        let this = Arc::new(Self {
            backend,
            config,
            firewalld: Arc::clone(firewalld),
            networks: Mutex::new(HashMap::new()),
        });

        for v in this.families() {
            this.cleanup_stale(v);
            this.setup_chains(v)?;
        }
        this.setup_wsl2_mirrored_rule()?;

        let weak = Arc::downgrade(&this);
        firewalld.on_reload(move || {
            if let Some(iptabler) = weak.upgrade() {
                if let Err(e) = iptabler.replay() {
                    tracing::error!(error = %e, "firewalld replay failed");
                }
            }
        });

        Ok(this)
    }

    /// The enabled IP families.
    pub(crate) fn families(&self) -> Vec<IpVersion> {
        let mut families = Vec::with_capacity(2);
        if self.config.ipv4 {
            families.push(IpVersion::V4);
        }
        if self.config.ipv6 {
            families.push(IpVersion::V6);
        }
        families
    }

    pub(crate) fn config(&self) -> &FirewallConfig {
        &self.config
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub(crate) fn firewalld(&self) -> &Arc<Firewalld> {
        &self.firewalld
    }

    /// Remove chains and jump rules left by a previous daemon, including
    /// the obsolete single-stage isolation chain. Best effort.
    fn cleanup_stale(&self, v: IpVersion) {
        let be = &self.backend;

        for (jump_target, chain) in [
            (FORWARD_CHAIN, "FORWARD"),
            (OBSOLETE_ISOLATION, "FORWARD"),
            (DOCKER_CHAIN, "FORWARD"),
        ] {
            let rule = args(["-j", jump_target]);
            if let Err(e) = be.delete_rule(v, Table::Filter, chain, &rule) {
                tracing::debug!(error = %e, chain, target = jump_target, "stale jump removal");
            }
        }

        let mut stale: Vec<&str> = FILTER_CHAINS.to_vec();
        stale.push(OBSOLETE_ISOLATION);
        for chain in stale {
            let _ = be.flush_chain(v, Table::Filter, chain);
            if let Err(e) = be.delete_chain(v, Table::Filter, chain) {
                tracing::debug!(error = %e, chain, "stale chain removal");
            }
        }
        let _ = be.flush_chain(v, Table::Nat, DOCKER_CHAIN);
        if let Err(e) = be.delete_chain(v, Table::Nat, DOCKER_CHAIN) {
            tracing::debug!(error = %e, chain = DOCKER_CHAIN, "stale nat chain removal");
        }
    }

    /// Create the chains and (re)install the jump rules for one family.
    pub(crate) fn setup_chains(&self, v: IpVersion) -> KeelResult<()> {
        let be = &self.backend;

        for chain in FILTER_CHAINS {
            be.new_chain(v, Table::Filter, chain)?;
        }
        be.new_chain(v, Table::Nat, DOCKER_CHAIN)?;

        // FORWARD dispatches everything to DOCKER-FORWARD.
        self.apply_op(&RuleOp::insert_top(
            v,
            Table::Filter,
            "FORWARD",
            args(["-j", FORWARD_CHAIN]),
        ))?;

        // Top inserts in reverse topological order; effective evaluation is
        // conntrack, then per-bridge dispatch, then isolation.
        for target in [ISOLATION_STAGE_1, BRIDGE_CHAIN, CT_CHAIN] {
            self.apply_op(&RuleOp::insert_top(
                v,
                Table::Filter,
                FORWARD_CHAIN,
                args(["-j", target]),
            ))?;
        }

        // Locally-destined traffic consults the NAT DOCKER chain.
        self.apply_op(&RuleOp::append(
            v,
            Table::Nat,
            "PREROUTING",
            args(["-m", "addrtype", "--dst-type", "LOCAL", "-j", DOCKER_CHAIN]),
        ))?;
        let output_jump = if self.config.hairpin {
            args(["-m", "addrtype", "--dst-type", "LOCAL", "-j", DOCKER_CHAIN])
        } else {
            args([
                "-m",
                "addrtype",
                "--dst-type",
                "LOCAL",
                "!",
                "-d",
                v.loopback(),
                "-j",
                DOCKER_CHAIN,
            ])
        };
        self.apply_op(&RuleOp::append(v, Table::Nat, "OUTPUT", output_jump))?;

        if self.config.forward_policy_drop {
            be.set_policy(v, Table::Filter, "FORWARD", "DROP")?;
        }

        tracing::debug!(family = ?v, "firewall chains installed");
        Ok(())
    }

    /// In WSL2 mirrored mode, Windows loopback traffic must not be DNATed
    /// back into containers when the proxy handles it.
    fn setup_wsl2_mirrored_rule(&self) -> KeelResult<()> {
        if !(self.config.ipv4 && self.config.wsl2_mirrored && !self.config.hairpin) {
            return Ok(());
        }
        self.apply_op(&RuleOp::append(
            IpVersion::V4,
            Table::Nat,
            DOCKER_CHAIN,
            args(["-i", "loopback0", "-d", "127.0.0.0/8", "-j", "RETURN"]),
        ))
    }

    /// Execute one tagged operation, idempotently.
    pub(crate) fn apply_op(&self, op: &RuleOp) -> KeelResult<()> {
        match op.placement {
            Placement::Append => {
                if !self.backend.rule_exists(op.v, op.table, op.chain, &op.args)? {
                    self.backend.append_rule(op.v, op.table, op.chain, &op.args)?;
                }
            }
            Placement::InsertTop => {
                self.backend.delete_rule(op.v, op.table, op.chain, &op.args)?;
                self.backend.insert_rule(op.v, op.table, op.chain, 1, &op.args)?;
            }
        }
        Ok(())
    }

    /// Undo one tagged operation. Absent rules are not an error.
    pub(crate) fn remove_op(&self, op: &RuleOp) -> KeelResult<()> {
        self.backend.delete_rule(op.v, op.table, op.chain, &op.args)
    }

    pub(crate) fn register_network(&self, config: NetworkConfig) {
        self.networks.lock().insert(config.if_name.clone(), config);
    }

    pub(crate) fn unregister_network(&self, if_name: &str) {
        self.networks.lock().remove(if_name);
    }

    /// Tear down every chain and jump this daemon owns, for shutdown
    /// with cleanup enabled. Best effort.
    pub fn flush(&self) {
        for v in self.families() {
            self.cleanup_stale(v);
        }
        self.networks.lock().clear();
    }

    /// Rebuild chains, then replay every live network's network-level
    /// rules. Endpoint and port rules are replayed by the driver from its
    /// own state.
    ///
    /// # Errors
    ///
    /// Returns the first chain-setup or rule error.
    pub fn replay(&self) -> KeelResult<()> {
        for v in self.families() {
            self.setup_chains(v)?;
        }
        self.setup_wsl2_mirrored_rule()?;

        let networks: Vec<NetworkConfig> = self.networks.lock().values().cloned().collect();
        for config in networks {
            crate::network::reapply_network_level_rules(self, &config)?;
        }
        Ok(())
    }
}
