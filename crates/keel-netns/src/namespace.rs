//! Network namespace ownership.
//!
//! A `Namespace` owns a bind-mounted netns file and serializes every
//! mutating operation on it. Netlink work happens on dedicated OS
//! threads: `setns` binds the calling thread, so each operation spawns a
//! thread, enters the namespace, runs a current-thread runtime and sends
//! its result back over a oneshot channel. Never run `setns` on a
//! runtime worker.

use std::collections::HashMap;
use std::net::IpAddr;
use std::os::fd::{AsFd, AsRawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use keel_common::{Cidr, KeelError, KeelResult};
use parking_lot::Mutex;

use crate::advertise::advertise_loop;
use crate::interface::{Interface, InterfaceOptions, configure};
use crate::nlwrap::Handle;

const UNLINK_ATTEMPTS: u32 = 20;
const UNLINK_GAP: Duration = Duration::from_millis(100);

/// How long a destroyed namespace's mountpoint lingers before the file
/// is unlinked. Late readers of the key (a restarting daemon, an exec
/// racing teardown) see a dead file instead of nothing.
static UNLINK_GRACE: Mutex<Duration> = Mutex::new(Duration::from_secs(60));

/// Override the grace period between [`Namespace::destroy`] and the
/// mountpoint unlink. Mainly for test harnesses that cannot wait out the
/// default minute.
pub fn set_unlink_grace(grace: Duration) {
    *UNLINK_GRACE.lock() = grace;
}

fn unlink_grace() -> Duration {
    *UNLINK_GRACE.lock()
}

/// An ordered static route maintained alongside the kernel state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticRoute {
    /// Destination prefix.
    pub destination: Cidr,
    /// Next hop.
    pub next_hop: IpAddr,
}

struct InterfaceState {
    iface: Interface,
    index: u32,
    /// Dropping the sender cancels a still-running advertisement burst.
    stop: Option<crossbeam_channel::Sender<()>>,
}

#[derive(Default)]
struct NsState {
    /// Per-prefix counters backing `dstPrefix + N` name assignment.
    counters: HashMap<String, u64>,
    interfaces: Vec<InterfaceState>,
    gateway: Option<IpAddr>,
    gateway_v6: Option<IpAddr>,
    static_routes: Vec<StaticRoute>,
}

/// A network namespace addressed by its bind-mount path.
pub struct Namespace {
    key: PathBuf,
    /// Created (and therefore unmounted/unlinked) by this process.
    owned: bool,
    /// Serializes interface and route mutations.
    ops: tokio::sync::Mutex<()>,
    state: Mutex<NsState>,
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("key", &self.key)
            .field("owned", &self.owned)
            .field("interfaces", &self.state.lock().interfaces.len())
            .finish()
    }
}

fn errno_to_err(context: &'static str, e: rustix::io::Errno) -> KeelError {
    KeelError::internal(format!("{context}: {}", std::io::Error::from(e)))
}

fn enter(path: &Path) -> KeelResult<()> {
    let file = std::fs::File::open(path)?;
    rustix::thread::move_into_link_name_space(
        file.as_fd(),
        Some(rustix::thread::LinkNameSpaceType::Network),
    )
    .map_err(|e| errno_to_err("setns", e))
}

impl Namespace {
    /// Create a fresh namespace bind-mounted at `key` and bring its
    /// loopback up.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` when `key` is taken; unshare/mount failures
    /// surface as internal errors.
    pub async fn create(key: impl Into<PathBuf>) -> KeelResult<Arc<Self>> {
        let key = key.into();
        if key.exists() {
            return Err(KeelError::AlreadyExists {
                resource: "namespace",
                id: key.display().to_string(),
            });
        }
        if let Some(parent) = key.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Mount target must exist before the bind.
        drop(std::fs::File::create(&key)?);

        let path = key.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::Builder::new()
            .name("keel-netns-init".into())
            .spawn(move || {
                let result = init_namespace(&path);
                let _ = tx.send(result);
            })?;
        match rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = std::fs::remove_file(&key);
                return Err(e);
            }
            Err(_) => {
                let _ = std::fs::remove_file(&key);
                return Err(KeelError::internal("namespace init thread panicked"));
            }
        }

        tracing::info!(key = %key.display(), "namespace created");
        Ok(Arc::new(Self {
            key,
            owned: true,
            ops: tokio::sync::Mutex::new(()),
            state: Mutex::new(NsState::default()),
        }))
    }

    /// Attach to an existing namespace file, e.g. a sandbox created by
    /// the container runtime.
    ///
    /// # Errors
    ///
    /// `NotFound` when `key` does not exist.
    pub fn open(key: impl Into<PathBuf>) -> KeelResult<Arc<Self>> {
        let key = key.into();
        if !key.exists() {
            return Err(KeelError::NotFound {
                resource: "namespace",
                id: key.display().to_string(),
            });
        }
        Ok(Arc::new(Self {
            key,
            owned: false,
            ops: tokio::sync::Mutex::new(()),
            state: Mutex::new(NsState::default()),
        }))
    }

    /// The namespace's bind-mount path.
    #[must_use]
    pub fn key(&self) -> &Path {
        &self.key
    }

    /// Run `f` against a netlink handle rooted in this namespace.
    async fn exec<T, F, Fut>(&self, f: F) -> KeelResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Handle) -> Fut + Send + 'static,
        Fut: Future<Output = KeelResult<T>>,
    {
        let path = self.key.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::Builder::new()
            .name("keel-netns-op".into())
            .spawn(move || {
                let result = run_entered(&path, f);
                let _ = tx.send(result);
            })?;
        rx.await
            .map_err(|_| KeelError::internal("namespace op thread panicked"))?
    }

    /// Add an interface to the namespace per the documented sequence.
    /// `host` is a handle in the host namespace used to move an existing
    /// link in; for bridges the link is created in place. Returns the
    /// assigned destination name.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` for an unknown master; `RouteConflict` when an
    /// address collides with an existing route; configuration failures
    /// roll the link back to the host namespace and surface unchanged.
    pub async fn add_interface(
        &self,
        host: &Handle,
        src_name: &str,
        dst_prefix: &str,
        options: InterfaceOptions,
    ) -> KeelResult<String> {
        let _op = self.ops.lock().await;

        let dst_name = {
            let mut state = self.state.lock();
            if let Some(master) = &options.master {
                let known = state
                    .interfaces
                    .iter()
                    .any(|i| i.iface.options().bridge && i.iface.dst_name() == master);
                if !known {
                    return Err(KeelError::invalid(format!(
                        "master {master} is not a bridge in this namespace"
                    )));
                }
            }
            let counter = state.counters.entry(dst_prefix.to_string()).or_insert(0);
            let dst_name = format!("{dst_prefix}{counter}");
            *counter += 1;
            dst_name
        };
        let iface = Interface::new(src_name.to_string(), dst_name.clone(), options);

        if iface.options().bridge {
            let name = src_name.to_string();
            self.exec(move |h| async move { h.create_bridge(&name).await.map(|_| ()) })
                .await?;
        } else {
            // Move the host-side link in; a link the caller already
            // created inside the namespace is used as is.
            let ns_file = std::fs::File::open(&self.key)?;
            match host.link_index(src_name).await {
                Ok(index) => {
                    host.move_to_namespace(index, ns_file.as_raw_fd()).await?;
                }
                Err(KeelError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let host_ns = std::fs::File::open("/proc/self/ns/net")?;
        let to_configure = iface.clone();
        let configured = self
            .exec(move |h| async move {
                let result = configure(&h, &to_configure, host_ns.as_raw_fd()).await;
                drop(host_ns);
                result
            })
            .await?;

        let stop = self.spawn_advertiser(&iface, configured.index, configured.upped, configured.mac)?;

        self.state.lock().interfaces.push(InterfaceState {
            iface,
            index: configured.index,
            stop,
        });
        tracing::info!(
            key = %self.key.display(),
            src = src_name,
            dst = %dst_name,
            "interface added"
        );
        Ok(dst_name)
    }

    fn spawn_advertiser(
        &self,
        iface: &Interface,
        index: u32,
        upped: bool,
        mac: Option<[u8; 6]>,
    ) -> KeelResult<Option<crossbeam_channel::Sender<()>>> {
        let options = iface.options();
        let ipv4 = options.address.and_then(|c| match c.addr() {
            IpAddr::V4(a) => Some(a),
            IpAddr::V6(_) => None,
        });
        let ipv6 = options.address_v6.and_then(|c| match c.addr() {
            IpAddr::V6(a) => Some(a),
            IpAddr::V4(_) => None,
        });
        let settings = options.advertise.clamped();
        let Some(mac) = mac else { return Ok(None) };
        if !upped || settings.messages == 0 || (ipv4.is_none() && ipv6.is_none()) {
            return Ok(None);
        }

        let (tx, rx) = crossbeam_channel::bounded::<()>(0);
        let path = self.key.clone();
        std::thread::Builder::new()
            .name("keel-netns-adv".into())
            .spawn(move || {
                if let Err(e) = enter(&path) {
                    tracing::warn!(error = %e, "advertiser setns");
                    return;
                }
                advertise_loop(index, mac, ipv4, ipv6, settings, &rx);
            })?;
        Ok(Some(tx))
    }

    /// Remove an interface: cancel its advertiser, bring it down, restore
    /// its source name and push it back to the host namespace. Bridges
    /// are deleted in place.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown name; netlink failures surface
    /// unchanged.
    pub async fn remove_interface(&self, dst_name: &str) -> KeelResult<()> {
        let _op = self.ops.lock().await;

        let entry = {
            let mut state = self.state.lock();
            let pos = state
                .interfaces
                .iter()
                .position(|i| i.iface.dst_name() == dst_name)
                .ok_or_else(|| KeelError::NotFound {
                    resource: "interface",
                    id: dst_name.to_string(),
                })?;
            state.interfaces.remove(pos)
        };
        drop(entry.stop);
        let iface = entry.iface;

        let host_ns = std::fs::File::open("/proc/self/ns/net")?;
        self.exec(move |h| async move {
            if iface.options().bridge {
                h.delete_link(iface.dst_name()).await
            } else {
                let index = h.link_index(iface.dst_name()).await?;
                h.set_down(index).await?;
                h.rename(index, iface.src_name()).await?;
                let result = h.move_to_namespace(index, host_ns.as_raw_fd()).await;
                drop(host_ns);
                result
            }
        })
        .await?;
        tracing::info!(key = %self.key.display(), dst = dst_name, "interface removed");
        Ok(())
    }

    /// A snapshot of the namespace's interfaces.
    #[must_use]
    pub fn interfaces(&self) -> Vec<Interface> {
        self.state
            .lock()
            .interfaces
            .iter()
            .map(|i| i.iface.clone())
            .collect()
    }

    /// Install the default route for the gateway's family. The gateway
    /// must be reachable through a directly-connected route. `None` and
    /// unspecified addresses are no-ops.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` when no connected route covers the gateway.
    pub async fn set_gateway(&self, gateway: Option<IpAddr>) -> KeelResult<()> {
        let Some(gw) = gateway else { return Ok(()) };
        if gw.is_unspecified() {
            return Ok(());
        }
        self.exec(move |h| async move {
            let routes = h.routes(gw.is_ipv6()).await?;
            let oif = routes
                .iter()
                .filter(|r| !r.is_default())
                .find(|r| r.destination.as_ref().is_some_and(|d| d.contains(gw)))
                .and_then(|r| r.oif)
                .ok_or_else(|| {
                    KeelError::invalid(format!("no connected route to gateway {gw}"))
                })?;
            h.add_route(None, Some(gw), Some(oif)).await
        })
        .await?;

        let mut state = self.state.lock();
        if gw.is_ipv6() {
            state.gateway_v6 = Some(gw);
        } else {
            state.gateway = Some(gw);
        }
        Ok(())
    }

    /// Remove the default route for one family. A no-op when no gateway
    /// is set.
    ///
    /// # Errors
    ///
    /// Surfaces the netlink failure.
    pub async fn unset_gateway(&self, ipv6: bool) -> KeelResult<()> {
        let set = {
            let state = self.state.lock();
            if ipv6 {
                state.gateway_v6.is_some()
            } else {
                state.gateway.is_some()
            }
        };
        if !set {
            return Ok(());
        }
        self.exec(move |h| async move { h.del_route(None, ipv6).await })
            .await?;
        let mut state = self.state.lock();
        if ipv6 {
            state.gateway_v6 = None;
        } else {
            state.gateway = None;
        }
        Ok(())
    }

    /// The gateway programmed for one family, if any.
    #[must_use]
    pub fn gateway(&self, ipv6: bool) -> Option<IpAddr> {
        let state = self.state.lock();
        if ipv6 { state.gateway_v6 } else { state.gateway }
    }

    /// Add a static route and record it in program order.
    ///
    /// # Errors
    ///
    /// Surfaces the netlink failure.
    pub async fn add_static_route(&self, route: StaticRoute) -> KeelResult<()> {
        let destination = route.destination;
        let next_hop = route.next_hop;
        self.exec(move |h| async move {
            h.add_route(Some(&destination), Some(next_hop), None).await
        })
        .await?;
        self.state.lock().static_routes.push(route);
        Ok(())
    }

    /// Remove a static route; absent kernel routes are no-ops.
    ///
    /// # Errors
    ///
    /// Surfaces the netlink failure.
    pub async fn remove_static_route(&self, route: &StaticRoute) -> KeelResult<()> {
        let destination = route.destination;
        self.exec(move |h| async move {
            h.del_route(Some(&destination), destination.is_ipv6()).await
        })
        .await?;
        let mut state = self.state.lock();
        if let Some(pos) = state.static_routes.iter().position(|r| r == route) {
            state.static_routes.remove(pos);
        }
        Ok(())
    }

    /// The static routes, in program order.
    #[must_use]
    pub fn static_routes(&self) -> Vec<StaticRoute> {
        self.state.lock().static_routes.clone()
    }

    /// Program a permanent neighbor entry on `if_name`.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown interface; netlink failures surface
    /// unchanged.
    pub async fn add_neighbor(&self, if_name: &str, ip: IpAddr, mac: [u8; 6]) -> KeelResult<()> {
        let name = if_name.to_string();
        self.exec(move |h| async move {
            let index = h.link_index(&name).await?;
            h.add_neighbor(index, ip, mac).await
        })
        .await
    }

    /// Remove a neighbor entry; with `bridge_cleanup` the dynamic fdb
    /// entry for the same hardware address goes too.
    ///
    /// # Errors
    ///
    /// `NotFound` when no matching entry exists.
    pub async fn delete_neighbor(
        &self,
        if_name: &str,
        ip: IpAddr,
        mac: [u8; 6],
        bridge_cleanup: bool,
    ) -> KeelResult<()> {
        let name = if_name.to_string();
        self.exec(move |h| async move {
            let index = h.link_index(&name).await?;
            h.del_neighbor(index, ip, mac, bridge_cleanup).await
        })
        .await
    }

    /// Tear the namespace down: cancel advertisers and detach the bind
    /// mount. The mountpoint file itself is unlinked after the configured
    /// grace period (see [`set_unlink_grace`]), on a background task.
    /// Only namespaces created by this process are unmounted; attached
    /// ones are left alone.
    ///
    /// # Errors
    ///
    /// Surfaces unmount failures; a late unlink failure is logged.
    pub async fn destroy(&self) -> KeelResult<()> {
        let _op = self.ops.lock().await;
        self.state.lock().interfaces.clear();
        if !self.owned {
            return Ok(());
        }

        let key = self.key.clone();
        tokio::task::spawn_blocking(move || unmount_key(&key))
            .await
            .map_err(|_| KeelError::internal("namespace teardown task panicked"))??;

        tokio::spawn(unlink_after_grace(self.key.clone(), unlink_grace()));

        tracing::info!(key = %self.key.display(), "namespace destroyed");
        Ok(())
    }
}

fn unmount_key(key: &Path) -> KeelResult<()> {
    if let Err(e) = rustix::mount::unmount(key, rustix::mount::UnmountFlags::DETACH) {
        // Already unmounted is fine.
        if e != rustix::io::Errno::INVAL && e != rustix::io::Errno::NOENT {
            return Err(errno_to_err("namespace unmount", e));
        }
    }
    Ok(())
}

/// Unlink a detached mountpoint after `grace`, retrying while the kernel
/// still holds the file.
async fn unlink_after_grace(key: PathBuf, grace: Duration) {
    tokio::time::sleep(grace).await;
    let path = key.clone();
    let result = tokio::task::spawn_blocking(move || {
        let mut last = None;
        for _ in 0..UNLINK_ATTEMPTS {
            match std::fs::remove_file(&path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => {
                    last = Some(e);
                    std::thread::sleep(UNLINK_GAP);
                }
            }
        }
        Err(last.map_or_else(
            || KeelError::internal("namespace unlink failed"),
            KeelError::Io,
        ))
    })
    .await;

    match result {
        Ok(Ok(())) => tracing::debug!(key = %key.display(), "namespace mountpoint unlinked"),
        Ok(Err(e)) => tracing::warn!(key = %key.display(), error = %e, "namespace unlink"),
        Err(_) => tracing::warn!(key = %key.display(), "namespace unlink task panicked"),
    }
}

fn init_namespace(path: &Path) -> KeelResult<()> {
    rustix::thread::unshare(rustix::thread::UnshareFlags::NEWNET)
        .map_err(|e| errno_to_err("unshare", e))?;
    rustix::mount::mount_bind("/proc/thread-self/ns/net", path)
        .map_err(|e| errno_to_err("namespace bind mount", e))?;

    // Loopback starts down in a fresh namespace.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async {
        let handle = Handle::new()?;
        let index = handle.link_index("lo").await?;
        handle.set_up(index).await
    })
}

fn run_entered<T, F, Fut>(path: &Path, f: F) -> KeelResult<T>
where
    F: FnOnce(Handle) -> Fut,
    Fut: Future<Output = KeelResult<T>>,
{
    enter(path)?;
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async move {
        let handle = Handle::new()?;
        f(handle).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_rejects_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let err = Namespace::open(dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, KeelError::NotFound { .. }));
    }

    #[test_log::test(tokio::test)]
    async fn unlink_waits_out_the_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("ns-lingering");
        drop(std::fs::File::create(&key).unwrap());

        tokio::spawn(unlink_after_grace(key.clone(), Duration::from_millis(200)));

        // Still present inside the grace window.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(key.exists());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!key.exists());
    }

    // Creation, interface moves and gateway programming need CAP_NET_ADMIN
    // and a writable mount namespace; exercised by the ignored tests below
    // on a privileged host.

    #[test_log::test(tokio::test)]
    #[ignore = "requires CAP_NET_ADMIN and CAP_SYS_ADMIN"]
    async fn create_and_destroy_round_trip() {
        set_unlink_grace(Duration::from_millis(100));
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("ns-test");

        let ns = Namespace::create(key.clone()).await.unwrap();
        assert!(key.exists());

        let err = Namespace::create(key.clone()).await.unwrap_err();
        assert!(matches!(err, KeelError::AlreadyExists { .. }));

        ns.destroy().await.unwrap();
        // The mountpoint lingers until the grace period elapses.
        assert!(key.exists());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!key.exists());
    }

    #[tokio::test]
    #[ignore = "requires CAP_NET_ADMIN and CAP_SYS_ADMIN"]
    async fn bridge_and_veth_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let ns = Namespace::create(dir.path().join("ns-links")).await.unwrap();
        let host = Handle::new().unwrap();

        let bridge = ns
            .add_interface(
                &host,
                "kbr0",
                "bridge",
                InterfaceOptions {
                    bridge: true,
                    address: Some("10.99.0.1/24".parse().unwrap()),
                    ..InterfaceOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(bridge, "bridge0");

        host.create_veth("kveth-h", "kveth-c").await.unwrap();
        let eth = ns
            .add_interface(
                &host,
                "kveth-c",
                "eth",
                InterfaceOptions {
                    address: Some("10.99.0.2/24".parse().unwrap()),
                    master: Some("bridge0".to_string()),
                    ..InterfaceOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(eth, "eth0");

        ns.set_gateway(Some("10.99.0.1".parse().unwrap())).await.unwrap();
        assert!(ns.gateway(false).is_some());
        ns.unset_gateway(false).await.unwrap();

        ns.remove_interface("eth0").await.unwrap();
        host.delete_link("kveth-h").await.unwrap();
        ns.destroy().await.unwrap();
    }
}
