//! Rules as data, executed through a pluggable backend.
//!
//! Rule programming is expressed as argv vectors against a
//! `(family, table, chain)` coordinate. The production backend shells out
//! to `iptables`/`ip6tables` under a process-wide lock; the in-memory
//! backend records the same operations for tests and dry runs.

use std::collections::BTreeMap;
use std::fmt;
use std::process::Command;

use keel_common::{KeelError, KeelResult};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// IP family a rule applies to. v4 and v6 rule sets are independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IpVersion {
    /// IPv4 (`iptables`).
    V4,
    /// IPv6 (`ip6tables`).
    V6,
}

impl IpVersion {
    /// The binary implementing this family.
    #[must_use]
    pub fn binary(self) -> &'static str {
        match self {
            Self::V4 => "iptables",
            Self::V6 => "ip6tables",
        }
    }

    /// The loopback expression for this family.
    #[must_use]
    pub fn loopback(self) -> &'static str {
        match self {
            Self::V4 => "127.0.0.0/8",
            Self::V6 => "::1/128",
        }
    }
}

/// iptables table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    /// The filter table.
    Filter,
    /// The nat table.
    Nat,
    /// The mangle table.
    Mangle,
    /// The raw table.
    Raw,
}

impl Table {
    /// The `-t` argument value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::Nat => "nat",
            Self::Mangle => "mangle",
            Self::Raw => "raw",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executes chain and rule operations for one kernel.
///
/// Implementations must be idempotent where documented: creating an
/// existing chain and deleting an absent rule are not errors.
pub trait Backend: Send + Sync + fmt::Debug {
    /// Whether the exact rule is present.
    fn rule_exists(&self, v: IpVersion, table: Table, chain: &str, args: &[String])
    -> KeelResult<bool>;

    /// Append a rule at the end of the chain.
    fn append_rule(&self, v: IpVersion, table: Table, chain: &str, args: &[String])
    -> KeelResult<()>;

    /// Insert a rule at 1-based `pos`.
    fn insert_rule(
        &self,
        v: IpVersion,
        table: Table,
        chain: &str,
        pos: usize,
        args: &[String],
    ) -> KeelResult<()>;

    /// Delete a rule; deleting an absent rule is a no-op.
    fn delete_rule(&self, v: IpVersion, table: Table, chain: &str, args: &[String])
    -> KeelResult<()>;

    /// Whether a chain exists.
    fn chain_exists(&self, v: IpVersion, table: Table, chain: &str) -> KeelResult<bool>;

    /// Create a chain; creating an existing chain is a no-op.
    fn new_chain(&self, v: IpVersion, table: Table, chain: &str) -> KeelResult<()>;

    /// Remove every rule in a chain.
    fn flush_chain(&self, v: IpVersion, table: Table, chain: &str) -> KeelResult<()>;

    /// Delete an (empty) chain; deleting an absent chain is a no-op.
    fn delete_chain(&self, v: IpVersion, table: Table, chain: &str) -> KeelResult<()>;

    /// Set the default policy of a built-in chain.
    fn set_policy(&self, v: IpVersion, table: Table, chain: &str, policy: &str) -> KeelResult<()>;
}

/// iptables is a process-wide shared resource; every invocation serializes
/// through this lock regardless of which backend instance issued it.
static IPTABLES_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Production backend shelling out to `iptables`/`ip6tables`.
#[derive(Debug, Default)]
pub struct IptablesBackend;

impl IptablesBackend {
    /// Create a backend.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn run(v: IpVersion, args: &[&str]) -> KeelResult<()> {
        let _guard = IPTABLES_LOCK.lock();
        let output = Command::new(v.binary())
            .arg("-w")
            .args(args)
            .output()
            .map_err(|e| KeelError::internal(format!("failed to execute {}: {e}", v.binary())))?;

        if !output.status.success() {
            return Err(KeelError::internal(format!(
                "{} {} failed: {}",
                v.binary(),
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn check(v: IpVersion, args: &[&str]) -> KeelResult<bool> {
        let _guard = IPTABLES_LOCK.lock();
        let output = Command::new(v.binary())
            .arg("-w")
            .args(args)
            .output()
            .map_err(|e| KeelError::internal(format!("failed to execute {}: {e}", v.binary())))?;
        Ok(output.status.success())
    }

    fn rule_args<'a>(
        op: &'a str,
        table: Table,
        chain: &'a str,
        args: &'a [String],
    ) -> Vec<&'a str> {
        let mut argv = vec!["-t", table.as_str(), op, chain];
        argv.extend(args.iter().map(String::as_str));
        argv
    }
}

impl Backend for IptablesBackend {
    fn rule_exists(
        &self,
        v: IpVersion,
        table: Table,
        chain: &str,
        args: &[String],
    ) -> KeelResult<bool> {
        Self::check(v, &Self::rule_args("-C", table, chain, args))
    }

    fn append_rule(
        &self,
        v: IpVersion,
        table: Table,
        chain: &str,
        args: &[String],
    ) -> KeelResult<()> {
        Self::run(v, &Self::rule_args("-A", table, chain, args))
    }

    fn insert_rule(
        &self,
        v: IpVersion,
        table: Table,
        chain: &str,
        pos: usize,
        args: &[String],
    ) -> KeelResult<()> {
        let pos = pos.to_string();
        let mut argv = vec!["-t", table.as_str(), "-I", chain, pos.as_str()];
        argv.extend(args.iter().map(String::as_str));
        Self::run(v, &argv)
    }

    fn delete_rule(
        &self,
        v: IpVersion,
        table: Table,
        chain: &str,
        args: &[String],
    ) -> KeelResult<()> {
        if self.rule_exists(v, table, chain, args)? {
            Self::run(v, &Self::rule_args("-D", table, chain, args))?;
        }
        Ok(())
    }

    fn chain_exists(&self, v: IpVersion, table: Table, chain: &str) -> KeelResult<bool> {
        Self::check(v, &["-t", table.as_str(), "-nL", chain])
    }

    fn new_chain(&self, v: IpVersion, table: Table, chain: &str) -> KeelResult<()> {
        if self.chain_exists(v, table, chain)? {
            return Ok(());
        }
        Self::run(v, &["-t", table.as_str(), "-N", chain])
    }

    fn flush_chain(&self, v: IpVersion, table: Table, chain: &str) -> KeelResult<()> {
        Self::run(v, &["-t", table.as_str(), "-F", chain])
    }

    fn delete_chain(&self, v: IpVersion, table: Table, chain: &str) -> KeelResult<()> {
        if !self.chain_exists(v, table, chain)? {
            return Ok(());
        }
        Self::run(v, &["-t", table.as_str(), "-X", chain])
    }

    fn set_policy(&self, v: IpVersion, table: Table, chain: &str, policy: &str) -> KeelResult<()> {
        Self::run(v, &["-t", table.as_str(), "-P", chain, policy])
    }
}

type ChainKey = (IpVersion, Table, String);

#[derive(Debug, Default)]
struct MemState {
    /// Chain -> ordered rule list (argv joined with spaces).
    rules: BTreeMap<ChainKey, Vec<String>>,
    policies: BTreeMap<ChainKey, String>,
}

/// In-memory backend recording rule operations.
///
/// Used by the test suites and as a dry-run target. Built-in chains
/// (`FORWARD`, `PREROUTING`, ...) implicitly exist.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemState>,
    /// When set, any append/insert whose rendered rule contains this
    /// substring fails. Drives rollback tests.
    fail_on: Mutex<Option<String>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key(v: IpVersion, table: Table, chain: &str) -> ChainKey {
        (v, table, chain.to_string())
    }

    fn render(args: &[String]) -> String {
        args.join(" ")
    }

    fn check_fail(&self, rendered: &str) -> KeelResult<()> {
        if let Some(needle) = self.fail_on.lock().as_deref() {
            if rendered.contains(needle) {
                return Err(KeelError::internal(format!(
                    "injected failure on rule: {rendered}"
                )));
            }
        }
        Ok(())
    }

    /// Make the next matching append/insert fail.
    pub fn fail_on(&self, needle: impl Into<String>) {
        *self.fail_on.lock() = Some(needle.into());
    }

    /// Clear failure injection.
    pub fn clear_failures(&self) {
        *self.fail_on.lock() = None;
    }

    /// The ordered rules of a chain, rendered as strings.
    #[must_use]
    pub fn rules(&self, v: IpVersion, table: Table, chain: &str) -> Vec<String> {
        self.state
            .lock()
            .rules
            .get(&Self::key(v, table, chain))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of occurrences of an exact rule in a chain.
    #[must_use]
    pub fn count(&self, v: IpVersion, table: Table, chain: &str, rule: &str) -> usize {
        self.rules(v, table, chain)
            .iter()
            .filter(|r| r.as_str() == rule)
            .count()
    }

    /// Whether a chain is present (explicitly created or built-in with rules).
    #[must_use]
    pub fn has_chain(&self, v: IpVersion, table: Table, chain: &str) -> bool {
        self.state
            .lock()
            .rules
            .contains_key(&Self::key(v, table, chain))
    }

    /// Every rule, across all tables and chains, mentioning `needle`.
    #[must_use]
    pub fn rules_mentioning(&self, needle: &str) -> Vec<String> {
        let state = self.state.lock();
        state
            .rules
            .iter()
            .flat_map(|((v, table, chain), rules)| {
                rules
                    .iter()
                    .filter(|r| r.contains(needle))
                    .map(move |r| format!("{} {table} {chain} {r}", v.binary()))
            })
            .collect()
    }

    /// The recorded policy of a built-in chain.
    #[must_use]
    pub fn policy(&self, v: IpVersion, table: Table, chain: &str) -> Option<String> {
        self.state
            .lock()
            .policies
            .get(&Self::key(v, table, chain))
            .cloned()
    }
}

impl Backend for MemoryBackend {
    fn rule_exists(
        &self,
        v: IpVersion,
        table: Table,
        chain: &str,
        args: &[String],
    ) -> KeelResult<bool> {
        let rendered = Self::render(args);
        Ok(self
            .state
            .lock()
            .rules
            .get(&Self::key(v, table, chain))
            .is_some_and(|rules| rules.iter().any(|r| r == &rendered)))
    }

    fn append_rule(
        &self,
        v: IpVersion,
        table: Table,
        chain: &str,
        args: &[String],
    ) -> KeelResult<()> {
        let rendered = Self::render(args);
        self.check_fail(&rendered)?;
        self.state
            .lock()
            .rules
            .entry(Self::key(v, table, chain))
            .or_default()
            .push(rendered);
        Ok(())
    }

    fn insert_rule(
        &self,
        v: IpVersion,
        table: Table,
        chain: &str,
        pos: usize,
        args: &[String],
    ) -> KeelResult<()> {
        let rendered = Self::render(args);
        self.check_fail(&rendered)?;
        let mut state = self.state.lock();
        let rules = state.rules.entry(Self::key(v, table, chain)).or_default();
        let idx = (pos.saturating_sub(1)).min(rules.len());
        rules.insert(idx, rendered);
        Ok(())
    }

    fn delete_rule(
        &self,
        v: IpVersion,
        table: Table,
        chain: &str,
        args: &[String],
    ) -> KeelResult<()> {
        let rendered = Self::render(args);
        let mut state = self.state.lock();
        if let Some(rules) = state.rules.get_mut(&Self::key(v, table, chain)) {
            if let Some(idx) = rules.iter().position(|r| r == &rendered) {
                rules.remove(idx);
            }
        }
        Ok(())
    }

    fn chain_exists(&self, v: IpVersion, table: Table, chain: &str) -> KeelResult<bool> {
        Ok(self.has_chain(v, table, chain))
    }

    fn new_chain(&self, v: IpVersion, table: Table, chain: &str) -> KeelResult<()> {
        self.state
            .lock()
            .rules
            .entry(Self::key(v, table, chain))
            .or_default();
        Ok(())
    }

    fn flush_chain(&self, v: IpVersion, table: Table, chain: &str) -> KeelResult<()> {
        if let Some(rules) = self.state.lock().rules.get_mut(&Self::key(v, table, chain)) {
            rules.clear();
        }
        Ok(())
    }

    fn delete_chain(&self, v: IpVersion, table: Table, chain: &str) -> KeelResult<()> {
        self.state.lock().rules.remove(&Self::key(v, table, chain));
        Ok(())
    }

    fn set_policy(&self, v: IpVersion, table: Table, chain: &str, policy: &str) -> KeelResult<()> {
        self.state
            .lock()
            .policies
            .insert(Self::key(v, table, chain), policy.to_string());
        Ok(())
    }
}

/// Render rule arguments from string-ish pieces.
pub(crate) fn args<I, S>(pieces: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    pieces.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_backend_orders_inserts() {
        let be = MemoryBackend::new();
        be.new_chain(IpVersion::V4, Table::Filter, "TEST").unwrap();
        be.append_rule(IpVersion::V4, Table::Filter, "TEST", &args(["-j", "A"]))
            .unwrap();
        be.insert_rule(IpVersion::V4, Table::Filter, "TEST", 1, &args(["-j", "B"]))
            .unwrap();

        assert_eq!(
            be.rules(IpVersion::V4, Table::Filter, "TEST"),
            vec!["-j B".to_string(), "-j A".to_string()]
        );
    }

    #[test]
    fn memory_backend_delete_is_idempotent() {
        let be = MemoryBackend::new();
        let rule = args(["-j", "DROP"]);
        be.append_rule(IpVersion::V4, Table::Filter, "TEST", &rule)
            .unwrap();
        be.delete_rule(IpVersion::V4, Table::Filter, "TEST", &rule)
            .unwrap();
        be.delete_rule(IpVersion::V4, Table::Filter, "TEST", &rule)
            .unwrap();
        assert_eq!(be.count(IpVersion::V4, Table::Filter, "TEST", "-j DROP"), 0);
    }

    #[test]
    fn failure_injection_matches_substring() {
        let be = MemoryBackend::new();
        be.fail_on("MASQUERADE");
        assert!(
            be.append_rule(
                IpVersion::V4,
                Table::Nat,
                "POSTROUTING",
                &args(["-j", "MASQUERADE"])
            )
            .is_err()
        );
        assert!(
            be.append_rule(IpVersion::V4, Table::Filter, "FORWARD", &args(["-j", "ACCEPT"]))
                .is_ok()
        );
    }
}
