//! Interface description and the in-namespace configuration sequence.
//!
//! The configuration order is a contract: rename, MAC, IPv4, IPv6,
//! master, link-local addresses, sysctls, up, routes, upped-wait. A
//! failure anywhere renames the link back to its source name and returns
//! it to the host namespace so the caller can retry or release it.

use std::os::fd::RawFd;
use std::path::PathBuf;
use std::time::Duration;

use keel_common::{Cidr, KeelError, KeelResult};

use crate::advertise::AdvertiseSettings;
use crate::nlwrap::{Handle, RouteEntry};

const UP_ATTEMPTS: u32 = 3;
const UP_RETRY_GAP: Duration = Duration::from_millis(10);
const UPPED_WAIT: Duration = Duration::from_secs(5);
const UPPED_POLL: Duration = Duration::from_millis(100);

/// Optional settings for a new interface.
#[derive(Debug, Clone, Default)]
pub struct InterfaceOptions {
    /// Hardware address to assign.
    pub mac: Option<[u8; 6]>,
    /// IPv4 address.
    pub address: Option<Cidr>,
    /// IPv6 address. Its presence decides whether IPv6 is enabled on the
    /// interface at all.
    pub address_v6: Option<Cidr>,
    /// Additional link-local addresses.
    pub link_local_addresses: Vec<Cidr>,
    /// Non-default routes through this interface.
    pub routes: Vec<Cidr>,
    /// Create the link as a bridge inside the namespace.
    pub bridge: bool,
    /// Enslave to this bridge, which must already live in the namespace.
    pub master: Option<String>,
    /// Per-interface sysctls, `net.X.Y.IFNAME.Z=VALUE` form.
    pub sysctls: Vec<String>,
    /// Unsolicited ARP/NA burst after the interface is up.
    pub advertise: AdvertiseSettings,
}

/// One interface owned by a namespace.
#[derive(Debug, Clone)]
pub struct Interface {
    src_name: String,
    dst_name: String,
    options: InterfaceOptions,
}

impl Interface {
    pub(crate) fn new(src_name: String, dst_name: String, options: InterfaceOptions) -> Self {
        Self {
            src_name,
            dst_name,
            options,
        }
    }

    /// The name the link had in the host namespace.
    #[must_use]
    pub fn src_name(&self) -> &str {
        &self.src_name
    }

    /// The name assigned inside the namespace.
    #[must_use]
    pub fn dst_name(&self) -> &str {
        &self.dst_name
    }

    /// The interface's settings.
    #[must_use]
    pub fn options(&self) -> &InterfaceOptions {
        &self.options
    }
}

/// Reject an address that an existing non-default route already covers,
/// or that covers such a route. Default routes never conflict.
pub(crate) fn check_route_conflict(routes: &[RouteEntry], address: &Cidr) -> KeelResult<()> {
    for route in routes {
        let Some(dst) = &route.destination else {
            continue;
        };
        if dst.is_ipv6() != address.is_ipv6() {
            continue;
        }
        if dst.overlaps(address) {
            return Err(KeelError::RouteConflict {
                address: address.to_string(),
                route: dst.to_string(),
            });
        }
    }
    Ok(())
}

/// Split `net.X.Y.IFNAME.Z=VALUE` into the `/proc/sys` path (with the
/// interface name substituted) and the value.
pub(crate) fn parse_sysctl(spec: &str, if_name: &str) -> KeelResult<(PathBuf, String)> {
    let (key, value) = spec
        .split_once('=')
        .ok_or_else(|| KeelError::invalid(format!("malformed sysctl {spec}")))?;
    let key = key.replace("IFNAME", if_name);
    let mut path = PathBuf::from("/proc/sys");
    for part in key.split('.') {
        if part.is_empty() || part == ".." || part.contains('/') {
            return Err(KeelError::invalid(format!("malformed sysctl key {key}")));
        }
        path.push(part);
    }
    Ok((path, value.trim().to_string()))
}

fn apply_sysctl(spec: &str, if_name: &str) -> KeelResult<()> {
    let (path, value) = parse_sysctl(spec, if_name)?;
    std::fs::write(&path, value)?;
    Ok(())
}

/// Whether IPv6 should be live on this interface.
fn wants_ipv6(options: &InterfaceOptions) -> bool {
    options.address_v6.is_some()
        || options.link_local_addresses.iter().any(Cidr::is_ipv6)
}

/// Outcome of a successful configuration run.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Configured {
    pub index: u32,
    /// Whether the link reached `IFF_UP` inside the wait budget.
    pub upped: bool,
    /// The link's hardware address, for the advertisement burst.
    pub mac: Option<[u8; 6]>,
}

/// Run the full in-namespace configuration sequence.
///
/// Runs on a thread already inside the target namespace; `host_ns` is
/// the fd the link is pushed back through on failure.
pub(crate) async fn configure(
    handle: &Handle,
    iface: &Interface,
    host_ns: RawFd,
) -> KeelResult<Configured> {
    let index = handle.link_index(iface.src_name()).await?;
    handle.set_down(index).await?;

    match configure_steps(handle, iface, index).await {
        Ok(upped) => {
            let mac = match iface.options().mac {
                Some(mac) => Some(mac),
                None => handle.link_mac(iface.dst_name()).await.unwrap_or_default(),
            };
            Ok(Configured { index, upped, mac })
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                src = iface.src_name(),
                dst = iface.dst_name(),
                "interface configuration failed, rolling back"
            );
            if let Err(undo) = handle.rename(index, iface.src_name()).await {
                tracing::warn!(error = %undo, "rollback rename");
            } else if !iface.options().bridge {
                if let Err(undo) = handle.move_to_namespace(index, host_ns).await {
                    tracing::warn!(error = %undo, "rollback move to host");
                }
            }
            Err(e)
        }
    }
}

async fn configure_steps(handle: &Handle, iface: &Interface, index: u32) -> KeelResult<bool> {
    let options = iface.options();
    let dst_name = iface.dst_name();

    handle.rename(index, dst_name).await?;
    if let Some(mac) = options.mac {
        handle.set_mac(index, mac).await?;
    }

    let routes = existing_routes(handle).await?;
    if let Some(address) = &options.address {
        check_route_conflict(&routes, address)?;
        handle.add_address(index, address, false).await?;
    }
    if let Some(address) = &options.address_v6 {
        check_route_conflict(&routes, address)?;
        handle.add_address(index, address, true).await?;
    }

    if let Some(master) = &options.master {
        let master_index = handle.link_index(master).await?;
        handle.set_master(index, master_index).await?;
    }

    for address in &options.link_local_addresses {
        handle.add_address(index, address, address.is_ipv6()).await?;
    }

    // IPv6 participation is all or nothing; a disabled interface must not
    // join multicast groups.
    let disable_v6 = if wants_ipv6(options) { "0" } else { "1" };
    apply_sysctl(
        &format!("net.ipv6.conf.IFNAME.disable_ipv6={disable_v6}"),
        dst_name,
    )?;
    for sysctl in &options.sysctls {
        apply_sysctl(sysctl, dst_name)?;
    }

    bring_up(handle, index).await?;

    for route in &options.routes {
        if route.is_default() {
            // Default routes belong to gateway programming.
            continue;
        }
        handle.add_route(Some(route), None, Some(index)).await?;
    }

    Ok(wait_until_up(handle, dst_name).await)
}

async fn existing_routes(handle: &Handle) -> KeelResult<Vec<RouteEntry>> {
    let mut routes = handle.routes(false).await?;
    routes.extend(handle.routes(true).await?);
    Ok(routes)
}

/// The kernel occasionally refuses an up right after a rename settles.
async fn bring_up(handle: &Handle, index: u32) -> KeelResult<()> {
    let mut last = None;
    for _ in 0..UP_ATTEMPTS {
        match handle.set_up(index).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                last = Some(e);
                tokio::time::sleep(UP_RETRY_GAP).await;
            }
        }
    }
    Err(last.unwrap_or_else(|| KeelError::internal("link up failed")))
}

/// Poll for `IFF_UP` within the wait budget. A timeout is not an error;
/// it only suppresses the advertisement burst.
async fn wait_until_up(handle: &Handle, name: &str) -> bool {
    let deadline = tokio::time::Instant::now() + UPPED_WAIT;
    loop {
        match handle.is_up(name).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                tracing::debug!(error = %e, name, "upped poll");
            }
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(name, "interface did not reach IFF_UP in time");
            return false;
        }
        tokio::time::sleep(UPPED_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(dst: &str) -> RouteEntry {
        RouteEntry {
            destination: Some(dst.parse().unwrap()),
            gateway: None,
            oif: None,
        }
    }

    #[test]
    fn route_conflict_detected_both_directions() {
        let routes = vec![route("10.10.0.0/16")];

        // Address inside the routed prefix.
        let err = check_route_conflict(&routes, &"10.10.3.0/24".parse().unwrap()).unwrap_err();
        assert!(matches!(err, KeelError::RouteConflict { .. }));

        // Address prefix covering the route.
        let err = check_route_conflict(&routes, &"10.0.0.0/8".parse().unwrap()).unwrap_err();
        assert!(matches!(err, KeelError::RouteConflict { .. }));

        check_route_conflict(&routes, &"192.168.1.0/24".parse().unwrap()).unwrap();
    }

    #[test]
    fn default_routes_never_conflict() {
        let routes = vec![RouteEntry {
            destination: None,
            gateway: Some("10.10.0.1".parse().unwrap()),
            oif: Some(2),
        }];
        check_route_conflict(&routes, &"10.10.3.0/24".parse().unwrap()).unwrap();
    }

    #[test]
    fn families_do_not_cross_conflict() {
        let routes = vec![route("10.10.0.0/16")];
        check_route_conflict(&routes, &"fd00::/64".parse().unwrap()).unwrap();
    }

    #[test]
    fn sysctl_paths_substitute_the_interface_name() {
        let (path, value) =
            parse_sysctl("net.ipv6.conf.IFNAME.accept_ra=0", "eth0").unwrap();
        assert_eq!(
            path,
            PathBuf::from("/proc/sys/net/ipv6/conf/eth0/accept_ra")
        );
        assert_eq!(value, "0");
    }

    #[test]
    fn sysctl_rejects_traversal_and_malformed_specs() {
        assert!(parse_sysctl("net.ipv4.ip_forward", "eth0").is_err());
        assert!(parse_sysctl("net..conf.IFNAME.x=1", "eth0").is_err());
        assert!(parse_sysctl("net.a/b.c=1", "eth0").is_err());
    }
}
