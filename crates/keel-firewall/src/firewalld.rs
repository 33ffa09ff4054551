//! firewalld integration.
//!
//! When firewalld is running, a reload wipes every iptables rule the
//! daemon installed. Interested parties register replay callbacks here;
//! `notify_reload` runs them in registration order. Bridge interfaces are
//! also registered in the docker zone so firewalld does not filter
//! intra-bridge traffic.

use std::process::Command;
use std::sync::Arc;

use keel_common::{KeelError, KeelResult};
use parking_lot::Mutex;

/// The firewalld zone holding bridge interfaces.
pub const DOCKER_ZONE: &str = "docker";

type ReloadCallback = Box<dyn Fn() + Send + Sync>;

/// Process-wide firewalld reload subscriber.
///
/// One instance is created at daemon startup and shared; tests construct
/// their own with [`Firewalld::disabled`] or [`Firewalld::simulated`] and
/// drive [`Firewalld::notify_reload`] directly.
pub struct Firewalld {
    running: bool,
    callbacks: Mutex<Vec<ReloadCallback>>,
}

impl std::fmt::Debug for Firewalld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Firewalld")
            .field("running", &self.running)
            .field("callbacks", &self.callbacks.lock().len())
            .finish()
    }
}

impl Firewalld {
    /// Detect whether firewalld is running on this host.
    #[must_use]
    pub fn detect() -> Arc<Self> {
        let running = Command::new("firewall-cmd")
            .arg("--state")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if running {
            tracing::info!("firewalld detected, reload replay enabled");
        }
        Arc::new(Self {
            running,
            callbacks: Mutex::new(Vec::new()),
        })
    }

    /// A subscriber for hosts without firewalld.
    #[must_use]
    pub fn disabled() -> Arc<Self> {
        Arc::new(Self {
            running: false,
            callbacks: Mutex::new(Vec::new()),
        })
    }

    /// A subscriber that behaves as if firewalld were running, without
    /// touching `firewall-cmd`. For tests.
    #[must_use]
    pub fn simulated() -> Arc<Self> {
        Arc::new(Self {
            running: true,
            callbacks: Mutex::new(Vec::new()),
        })
    }

    /// Whether firewalld is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Register a callback to replay state after a firewalld reload.
    pub fn on_reload(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.callbacks.lock().push(Box::new(callback));
    }

    /// Run every registered reload callback, in registration order.
    ///
    /// In production this is driven by the D-Bus `Reloaded` signal watcher;
    /// tests call it directly.
    pub fn notify_reload(&self) {
        tracing::info!("firewalld reload, replaying firewall state");
        let callbacks = self.callbacks.lock();
        for callback in callbacks.iter() {
            callback();
        }
    }

    /// Put `interface` into the docker zone so firewalld passes its
    /// traffic. No-op when firewalld is not running.
    ///
    /// # Errors
    ///
    /// Surfaces `firewall-cmd` failures as internal errors.
    pub fn add_interface_to_zone(&self, interface: &str) -> KeelResult<()> {
        if !self.running {
            return Ok(());
        }
        self.zone_cmd("--add-interface", interface)
    }

    /// Remove `interface` from the docker zone.
    ///
    /// # Errors
    ///
    /// Surfaces `firewall-cmd` failures as internal errors.
    pub fn remove_interface_from_zone(&self, interface: &str) -> KeelResult<()> {
        if !self.running {
            return Ok(());
        }
        self.zone_cmd("--remove-interface", interface)
    }

    fn zone_cmd(&self, op: &str, interface: &str) -> KeelResult<()> {
        let output = Command::new("firewall-cmd")
            .args([format!("--zone={DOCKER_ZONE}"), op.to_string(), interface.to_string()])
            .output()
            .map_err(|e| KeelError::internal(format!("failed to execute firewall-cmd: {e}")))?;

        if !output.status.success() {
            return Err(KeelError::internal(format!(
                "firewall-cmd {op} {interface} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        tracing::debug!(interface, op, zone = DOCKER_ZONE, "firewalld zone updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn reload_runs_callbacks_in_order() {
        let fw = Firewalld::simulated();
        let hits = Arc::new(AtomicUsize::new(0));

        for expected in 0..3usize {
            let hits = hits.clone();
            fw.on_reload(move || {
                assert_eq!(hits.fetch_add(1, Ordering::SeqCst) % 3, expected);
            });
        }

        fw.notify_reload();
        fw.notify_reload();
        assert_eq!(hits.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn zone_ops_are_noops_when_not_running() {
        let fw = Firewalld::disabled();
        fw.add_interface_to_zone("br-test").unwrap();
        fw.remove_interface_from_zone("br-test").unwrap();
    }
}
