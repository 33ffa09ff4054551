//! Thin wrapper around an rtnetlink handle.
//!
//! One `Handle` per namespace; the connection task is held alive for the
//! handle's lifetime. Kernel idiosyncrasies are normalized here: `File
//! exists` on adds and `No such device` / `No such process` on deletes
//! are idempotent outcomes, not errors.

use std::net::IpAddr;
use std::os::fd::RawFd;

use futures::TryStreamExt;
use keel_common::{Cidr, KeelError, KeelResult};
use netlink_packet_route::link::{LinkAttribute, LinkFlags, LinkMessage};
use netlink_packet_route::neighbour::{
    NeighbourAddress, NeighbourAttribute, NeighbourMessage, NeighbourState,
};
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
use netlink_packet_route::AddressFamily;
use rtnetlink::{LinkBridge, LinkUnspec, LinkVeth, RouteMessageBuilder};

/// A parsed kernel route, reduced to what gateway programming and
/// conflict checks need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    /// Destination prefix; `None` for default routes.
    pub destination: Option<Cidr>,
    /// Next hop, if any.
    pub gateway: Option<IpAddr>,
    /// Output interface index, if any.
    pub oif: Option<u32>,
}

impl RouteEntry {
    /// Whether this is a default route.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.destination.is_none()
    }
}

/// Netlink handle rooted in the namespace it was created in.
#[derive(Debug)]
pub struct Handle {
    inner: rtnetlink::Handle,
    _task: tokio::task::JoinHandle<()>,
}

fn map_nl(context: &'static str, e: rtnetlink::Error) -> KeelError {
    KeelError::internal(format!("{context}: {e}"))
}

fn already_exists(e: &rtnetlink::Error) -> bool {
    e.to_string().contains("File exists")
}

fn already_gone(e: &rtnetlink::Error) -> bool {
    let text = e.to_string();
    text.contains("No such device") || text.contains("No such process")
}

impl Handle {
    /// Open a connection in the calling thread's current namespace.
    ///
    /// # Errors
    ///
    /// Fails when the netlink socket cannot be created.
    pub fn new() -> KeelResult<Self> {
        let (conn, inner, _) = rtnetlink::new_connection()?;
        let task = tokio::spawn(conn);
        Ok(Self { inner, _task: task })
    }

    /// Resolve a link name to its ifindex.
    ///
    /// # Errors
    ///
    /// `NotFound` when no such link exists.
    pub async fn link_index(&self, name: &str) -> KeelResult<u32> {
        Ok(self.link_message(name).await?.header.index)
    }

    /// Fetch a link message by name.
    ///
    /// # Errors
    ///
    /// `NotFound` when no such link exists.
    pub async fn link_message(&self, name: &str) -> KeelResult<LinkMessage> {
        let mut links = self
            .inner
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(KeelError::NotFound {
                resource: "link",
                id: name.to_string(),
            }),
            Err(e) if already_gone(&e) => Err(KeelError::NotFound {
                resource: "link",
                id: name.to_string(),
            }),
            Err(e) => Err(map_nl("link lookup", e)),
        }
    }

    /// Whether a link with this name exists.
    pub async fn link_exists(&self, name: &str) -> bool {
        self.link_message(name).await.is_ok()
    }

    /// Whether the link carries `IFF_UP`.
    ///
    /// # Errors
    ///
    /// `NotFound` when the link disappeared.
    pub async fn is_up(&self, name: &str) -> KeelResult<bool> {
        let msg = self.link_message(name).await?;
        Ok(msg.header.flags.contains(LinkFlags::Up))
    }

    /// The link's hardware address, if it has one.
    ///
    /// # Errors
    ///
    /// `NotFound` when the link does not exist.
    pub async fn link_mac(&self, name: &str) -> KeelResult<Option<[u8; 6]>> {
        let msg = self.link_message(name).await?;
        for attr in &msg.attributes {
            if let LinkAttribute::Address(bytes) = attr {
                if let Ok(mac) = <[u8; 6]>::try_from(bytes.as_slice()) {
                    return Ok(Some(mac));
                }
            }
        }
        Ok(None)
    }

    /// Create a bridge link. Racing creations resolve to the survivor.
    ///
    /// # Errors
    ///
    /// Surfaces netlink failures other than `File exists`.
    pub async fn create_bridge(&self, name: &str) -> KeelResult<u32> {
        let result = self
            .inner
            .link()
            .add(LinkBridge::new(name).build())
            .execute()
            .await;
        match result {
            Ok(()) => {}
            Err(e) if already_exists(&e) => {}
            Err(e) => return Err(map_nl("bridge create", e)),
        }
        self.link_index(name).await
    }

    /// Create a veth pair in the current namespace.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` when either name is taken.
    pub async fn create_veth(&self, name: &str, peer: &str) -> KeelResult<()> {
        self.inner
            .link()
            .add(LinkVeth::new(name, peer).build())
            .execute()
            .await
            .map_err(|e| {
                if already_exists(&e) {
                    KeelError::AlreadyExists {
                        resource: "link",
                        id: name.to_string(),
                    }
                } else {
                    map_nl("veth create", e)
                }
            })
    }

    /// Delete a link by name; an absent link is a no-op.
    ///
    /// # Errors
    ///
    /// Surfaces netlink failures other than the link being gone.
    pub async fn delete_link(&self, name: &str) -> KeelResult<()> {
        let index = match self.link_index(name).await {
            Ok(index) => index,
            Err(KeelError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        match self.inner.link().del(index).execute().await {
            Ok(()) => Ok(()),
            Err(e) if already_gone(&e) => Ok(()),
            Err(e) => Err(map_nl("link delete", e)),
        }
    }

    async fn set_link(&self, context: &'static str, msg: LinkMessage) -> KeelResult<()> {
        self.inner
            .link()
            .set(msg)
            .execute()
            .await
            .map_err(|e| map_nl(context, e))
    }

    /// Bring a link up.
    ///
    /// # Errors
    ///
    /// Surfaces the netlink failure.
    pub async fn set_up(&self, index: u32) -> KeelResult<()> {
        self.set_link("link up", LinkUnspec::new_with_index(index).up().build())
            .await
    }

    /// Bring a link down.
    ///
    /// # Errors
    ///
    /// Surfaces the netlink failure.
    pub async fn set_down(&self, index: u32) -> KeelResult<()> {
        self.set_link("link down", LinkUnspec::new_with_index(index).down().build())
            .await
    }

    /// Rename a link. The link must be down.
    ///
    /// # Errors
    ///
    /// Surfaces the netlink failure.
    pub async fn rename(&self, index: u32, name: &str) -> KeelResult<()> {
        self.set_link(
            "link rename",
            LinkUnspec::new_with_index(index).name(name.to_string()).build(),
        )
        .await
    }

    /// Set a link's hardware address.
    ///
    /// # Errors
    ///
    /// Surfaces the netlink failure.
    pub async fn set_mac(&self, index: u32, mac: [u8; 6]) -> KeelResult<()> {
        self.set_link(
            "link set mac",
            LinkUnspec::new_with_index(index).address(mac.to_vec()).build(),
        )
        .await
    }

    /// Enslave a link to a bridge.
    ///
    /// # Errors
    ///
    /// Surfaces the netlink failure.
    pub async fn set_master(&self, index: u32, master: u32) -> KeelResult<()> {
        self.set_link(
            "link set master",
            LinkUnspec::new_with_index(index).controller(master).build(),
        )
        .await
    }

    /// Set a link's MTU.
    ///
    /// # Errors
    ///
    /// Surfaces the netlink failure.
    pub async fn set_mtu(&self, index: u32, mtu: u32) -> KeelResult<()> {
        self.set_link(
            "link set mtu",
            LinkUnspec::new_with_index(index).mtu(mtu).build(),
        )
        .await
    }

    /// Move a link into the namespace behind `fd`.
    ///
    /// # Errors
    ///
    /// Surfaces the netlink failure.
    pub async fn move_to_namespace(&self, index: u32, fd: RawFd) -> KeelResult<()> {
        self.set_link(
            "link move to namespace",
            LinkUnspec::new_with_index(index).setns_by_fd(fd).build(),
        )
        .await
    }

    /// Add an address; adding an already-assigned address is a no-op.
    /// `nodad` suppresses duplicate address detection for pre-allocated
    /// IPv6 addresses.
    ///
    /// # Errors
    ///
    /// Surfaces netlink failures other than `File exists`.
    pub async fn add_address(&self, index: u32, cidr: &Cidr, nodad: bool) -> KeelResult<()> {
        let mut req = self.inner.address().add(index, cidr.addr(), cidr.prefix_len());
        if nodad && cidr.is_ipv6() {
            req.message_mut()
                .header
                .flags
                .insert(netlink_packet_route::address::AddressHeaderFlags::Nodad);
        }
        match req.execute().await {
            Ok(()) => Ok(()),
            Err(e) if already_exists(&e) => Ok(()),
            Err(e) => Err(map_nl("address add", e)),
        }
    }

    /// List all routes for one family.
    ///
    /// # Errors
    ///
    /// Surfaces the netlink failure.
    pub async fn routes(&self, ipv6: bool) -> KeelResult<Vec<RouteEntry>> {
        let message = if ipv6 {
            RouteMessageBuilder::<std::net::Ipv6Addr>::new().build()
        } else {
            RouteMessageBuilder::<std::net::Ipv4Addr>::new().build()
        };
        let mut stream = self.inner.route().get(message).execute();
        let mut entries = Vec::new();
        while let Some(msg) = stream.try_next().await.map_err(|e| map_nl("route list", e))? {
            entries.push(parse_route(&msg));
        }
        Ok(entries)
    }

    /// Add a route; an existing identical route is a no-op.
    ///
    /// # Errors
    ///
    /// Surfaces netlink failures other than `File exists`.
    pub async fn add_route(
        &self,
        destination: Option<&Cidr>,
        gateway: Option<IpAddr>,
        oif: Option<u32>,
    ) -> KeelResult<()> {
        let ipv6 = destination.map_or_else(
            || matches!(gateway, Some(IpAddr::V6(_))),
            Cidr::is_ipv6,
        );
        let message = if ipv6 {
            let mut builder = RouteMessageBuilder::<std::net::Ipv6Addr>::new();
            if let Some(dst) = destination {
                if let IpAddr::V6(addr) = dst.addr() {
                    builder = builder.destination_prefix(addr, dst.prefix_len());
                }
            }
            if let Some(IpAddr::V6(gw)) = gateway {
                builder = builder.gateway(gw);
            }
            if let Some(index) = oif {
                builder = builder.output_interface(index);
            }
            builder.build()
        } else {
            let mut builder = RouteMessageBuilder::<std::net::Ipv4Addr>::new();
            if let Some(dst) = destination {
                if let IpAddr::V4(addr) = dst.addr() {
                    builder = builder.destination_prefix(addr, dst.prefix_len());
                }
            }
            if let Some(IpAddr::V4(gw)) = gateway {
                builder = builder.gateway(gw);
            }
            if let Some(index) = oif {
                builder = builder.output_interface(index);
            }
            builder.build()
        };
        match self.inner.route().add(message).execute().await {
            Ok(()) => Ok(()),
            Err(e) if already_exists(&e) => Ok(()),
            Err(e) => Err(map_nl("route add", e)),
        }
    }

    /// Delete the route matching `destination` (`None` deletes the
    /// default route). An absent route is a no-op.
    ///
    /// # Errors
    ///
    /// Surfaces netlink failures other than the route being gone.
    pub async fn del_route(&self, destination: Option<&Cidr>, ipv6: bool) -> KeelResult<()> {
        let message = if ipv6 {
            RouteMessageBuilder::<std::net::Ipv6Addr>::new().build()
        } else {
            RouteMessageBuilder::<std::net::Ipv4Addr>::new().build()
        };
        let mut stream = self.inner.route().get(message).execute();
        while let Some(msg) = stream.try_next().await.map_err(|e| map_nl("route list", e))? {
            let entry = parse_route(&msg);
            if entry.destination.as_ref() == destination {
                return match self.inner.route().del(msg).execute().await {
                    Ok(()) => Ok(()),
                    Err(e) if already_gone(&e) => Ok(()),
                    Err(e) => Err(map_nl("route delete", e)),
                };
            }
        }
        Ok(())
    }

    /// Program a permanent neighbor entry.
    ///
    /// # Errors
    ///
    /// Surfaces netlink failures other than `File exists`.
    pub async fn add_neighbor(&self, index: u32, ip: IpAddr, mac: [u8; 6]) -> KeelResult<()> {
        let result = self
            .inner
            .neighbours()
            .add(index, ip)
            .link_local_address(&mac)
            .state(NeighbourState::Permanent)
            .replace()
            .execute()
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if already_exists(&e) => Ok(()),
            Err(e) => Err(map_nl("neighbor add", e)),
        }
    }

    /// Remove a neighbor entry; with `bridge_cleanup` the dynamic
    /// `AF_BRIDGE` fdb entry learned for the same hardware address is
    /// removed as well.
    ///
    /// # Errors
    ///
    /// `NotFound` when no matching entry exists; other netlink failures
    /// surface unchanged.
    pub async fn del_neighbor(
        &self,
        index: u32,
        ip: IpAddr,
        mac: [u8; 6],
        bridge_cleanup: bool,
    ) -> KeelResult<()> {
        let mut stream = self.inner.neighbours().get().execute();
        let mut found = false;
        let mut matches = Vec::new();
        while let Some(msg) = stream
            .try_next()
            .await
            .map_err(|e| map_nl("neighbor list", e))?
        {
            if msg.header.ifindex != index {
                continue;
            }
            if neighbour_matches(&msg, ip, mac, bridge_cleanup) {
                found = true;
                matches.push(msg);
            }
        }
        if !found {
            return Err(KeelError::NotFound {
                resource: "neighbor",
                id: ip.to_string(),
            });
        }
        for msg in matches {
            match self.inner.neighbours().del(msg).execute().await {
                Ok(()) => {}
                Err(e) if already_gone(&e) => {}
                Err(e) => return Err(map_nl("neighbor delete", e)),
            }
        }
        Ok(())
    }
}

fn neighbour_matches(
    msg: &NeighbourMessage,
    ip: IpAddr,
    mac: [u8; 6],
    bridge_cleanup: bool,
) -> bool {
    let mut dst_match = false;
    let mut lla_match = false;
    for attr in &msg.attributes {
        match attr {
            NeighbourAttribute::Destination(dst) => {
                let addr = match dst {
                    NeighbourAddress::Inet(a) => Some(IpAddr::V4(*a)),
                    NeighbourAddress::Inet6(a) => Some(IpAddr::V6(*a)),
                    _ => None,
                };
                dst_match = addr == Some(ip);
            }
            NeighbourAttribute::LinkLocalAddress(lla) => {
                lla_match = lla.as_slice() == mac;
            }
            _ => {}
        }
    }
    if bridge_cleanup && msg.header.family == AddressFamily::Bridge {
        // fdb entries have no destination address; match on the mac.
        return lla_match;
    }
    dst_match
}

fn parse_route(msg: &RouteMessage) -> RouteEntry {
    let mut destination = None;
    let mut gateway = None;
    let mut oif = None;
    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Destination(dst) => {
                let addr = match dst {
                    RouteAddress::Inet(a) => Some(IpAddr::V4(*a)),
                    RouteAddress::Inet6(a) => Some(IpAddr::V6(*a)),
                    _ => None,
                };
                destination = addr
                    .and_then(|a| Cidr::new(a, msg.header.destination_prefix_length).ok());
            }
            RouteAttribute::Gateway(gw) => {
                gateway = match gw {
                    RouteAddress::Inet(a) => Some(IpAddr::V4(*a)),
                    RouteAddress::Inet6(a) => Some(IpAddr::V6(*a)),
                    _ => None,
                };
            }
            RouteAttribute::Oif(index) => oif = Some(*index),
            _ => {}
        }
    }
    RouteEntry {
        destination,
        gateway,
        oif,
    }
}
