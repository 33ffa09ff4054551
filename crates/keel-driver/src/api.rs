//! Driver and IPAM contracts.
//!
//! The controller talks to every network driver through [`NetworkDriver`]
//! and to every address allocator through [`Ipam`]; the bridge driver and
//! the remote plugin adapters implement the same traits.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use keel_common::{Cidr, KeelResult};
use keel_netns::StaticRoute;

use crate::endpoint::PortBinding;

/// Free-form driver options, `label → value`.
pub type Options = HashMap<String, String>;

/// One allocated prefix handed to `create_network` per family.
#[derive(Debug, Clone)]
pub struct IpamData {
    /// Address space the pool came from.
    pub address_space: String,
    /// The allocated pool.
    pub pool: Cidr,
    /// Gateway address inside the pool, with its prefix.
    pub gateway: Option<Cidr>,
    /// Auxiliary reserved addresses.
    pub aux_addresses: HashMap<String, IpAddr>,
}

/// Endpoint interface parameters. Fields the caller leaves empty are
/// filled by the driver during `create_endpoint`.
#[derive(Debug, Clone, Default)]
pub struct EndpointInterface {
    /// IPv4 address and prefix.
    pub address: Option<Cidr>,
    /// IPv6 address and prefix.
    pub address_v6: Option<Cidr>,
    /// Hardware address.
    pub mac: Option<[u8; 6]>,
}

/// What a sandbox needs to plumb an endpoint after `join`.
#[derive(Debug, Clone)]
pub struct JoinInfo {
    /// Name of the link to move into the sandbox.
    pub src_name: String,
    /// Prefix the sandbox assigns the final name from.
    pub dst_prefix: String,
    /// IPv4 gateway.
    pub gateway: Option<IpAddr>,
    /// IPv6 gateway.
    pub gateway_v6: Option<IpAddr>,
    /// Static routes to program in the sandbox.
    pub static_routes: Vec<StaticRoute>,
}

/// The contract a network driver exposes to the controller.
#[async_trait]
pub trait NetworkDriver: Send + Sync {
    /// Create a network from allocated pools and driver options.
    async fn create_network(
        &self,
        id: &str,
        options: &Options,
        ipv4: &[IpamData],
        ipv6: &[IpamData],
    ) -> KeelResult<()>;

    /// Delete a network. Fails while endpoints exist.
    async fn delete_network(&self, id: &str) -> KeelResult<()>;

    /// Create an endpoint; fills the empty fields of `interface`.
    async fn create_endpoint(
        &self,
        nid: &str,
        eid: &str,
        interface: &mut EndpointInterface,
        options: &Options,
    ) -> KeelResult<()>;

    /// Delete an endpoint and its host-side plumbing.
    async fn delete_endpoint(&self, nid: &str, eid: &str) -> KeelResult<()>;

    /// Attach an endpoint to a sandbox namespace.
    async fn join(
        &self,
        nid: &str,
        eid: &str,
        sandbox_key: &str,
        options: &Options,
    ) -> KeelResult<JoinInfo>;

    /// Detach an endpoint from its sandbox.
    async fn leave(&self, nid: &str, eid: &str) -> KeelResult<()>;

    /// Publish an endpoint's ports on the host.
    async fn program_external_connectivity(
        &self,
        nid: &str,
        eid: &str,
        bindings: &[PortBinding],
    ) -> KeelResult<()>;

    /// Withdraw an endpoint's published ports.
    async fn revoke_external_connectivity(&self, nid: &str, eid: &str) -> KeelResult<()>;

    /// Operational data for an endpoint (port map, addresses).
    async fn endpoint_oper_info(&self, nid: &str, eid: &str) -> KeelResult<Options>;

    /// Node-membership event. Local drivers ignore these.
    async fn discover_new(&self, _kind: &str, _data: &Options) -> KeelResult<()> {
        Ok(())
    }

    /// Node-departure event. Local drivers ignore these.
    async fn discover_delete(&self, _kind: &str, _data: &Options) -> KeelResult<()> {
        Ok(())
    }
}

/// A pool allocation request.
#[derive(Debug, Clone, Default)]
pub struct PoolRequest {
    /// Address space to allocate from.
    pub address_space: String,
    /// Specific pool to reserve; `None` lets the allocator choose.
    pub pool: Option<Cidr>,
    /// Sub-range of `pool` to hand addresses from.
    pub sub_pool: Option<Cidr>,
    /// Allocator options.
    pub options: Options,
    /// Request an IPv6 pool.
    pub v6: bool,
    /// Prefixes the chosen pool must not overlap.
    pub exclude: Vec<Cidr>,
}

/// A successful pool allocation.
#[derive(Debug, Clone)]
pub struct AllocatedPool {
    /// Token for later release.
    pub pool_id: String,
    /// The allocated prefix.
    pub pool: Cidr,
    /// Allocator metadata.
    pub meta: Options,
}

/// What a remote allocator requires of its callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpamCapabilities {
    /// Endpoint MAC must be passed in address requests.
    pub requires_mac_address: bool,
    /// Allocations must be replayed to the plugin after a restart.
    pub requires_request_replay: bool,
}

/// The address allocator contract consumed by the driver.
#[async_trait]
pub trait Ipam: Send + Sync {
    /// The allocator's (local, global) default address spaces.
    async fn default_address_spaces(&self) -> KeelResult<(String, String)>;

    /// Allocate a pool.
    async fn request_pool(&self, request: &PoolRequest) -> KeelResult<AllocatedPool>;

    /// Release a pool.
    async fn release_pool(&self, pool_id: &str) -> KeelResult<()>;

    /// Allocate an address from a pool; `None` lets the allocator pick.
    async fn request_address(
        &self,
        pool_id: &str,
        address: Option<IpAddr>,
        options: &Options,
    ) -> KeelResult<(Cidr, Options)>;

    /// Release an address back to its pool.
    async fn release_address(&self, pool_id: &str, address: IpAddr) -> KeelResult<()>;
}

/// Allocate a local-space pool that overlaps none of `request.exclude`.
///
/// The allocator hands out candidate prefixes in its own order; rejected
/// candidates are held (not released) until a fitting one arrives, so the
/// allocator cannot return the same prefix twice within the iteration.
/// Requests that pin a pool or target another address space pass through
/// untouched.
///
/// # Errors
///
/// Surfaces the allocator's failure; an exhausted allocator typically
/// reports no pool available.
pub async fn request_pool_excluding(
    ipam: &dyn Ipam,
    request: PoolRequest,
    local_space: &str,
) -> KeelResult<AllocatedPool> {
    if request.pool.is_some() || request.address_space != local_space {
        return ipam.request_pool(&request).await;
    }

    let mut held = Vec::new();
    let result = loop {
        match ipam.request_pool(&request).await {
            Ok(allocated) => {
                if request.exclude.iter().any(|x| x.overlaps(&allocated.pool)) {
                    tracing::debug!(pool = %allocated.pool, "pool overlaps exclusion, holding");
                    held.push(allocated.pool_id);
                    continue;
                }
                break Ok(allocated);
            }
            Err(e) => break Err(e),
        }
    };
    for pool_id in held {
        if let Err(e) = ipam.release_pool(&pool_id).await {
            tracing::warn!(error = %e, pool_id, "held pool release");
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_common::KeelError;
    use parking_lot::Mutex;

    /// Allocator handing out a fixed candidate list in order, never
    /// repeating a pool that is still held.
    struct FakeIpam {
        candidates: Mutex<Vec<Cidr>>,
        released: Mutex<Vec<String>>,
    }

    impl FakeIpam {
        fn new(candidates: &[&str]) -> Self {
            Self {
                candidates: Mutex::new(
                    candidates.iter().map(|c| c.parse().unwrap()).collect(),
                ),
                released: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Ipam for FakeIpam {
        async fn default_address_spaces(&self) -> KeelResult<(String, String)> {
            Ok(("local".to_string(), "global".to_string()))
        }

        async fn request_pool(&self, _request: &PoolRequest) -> KeelResult<AllocatedPool> {
            let mut candidates = self.candidates.lock();
            if candidates.is_empty() {
                return Err(KeelError::NotFound {
                    resource: "pool",
                    id: "exhausted".to_string(),
                });
            }
            let pool = candidates.remove(0);
            Ok(AllocatedPool {
                pool_id: pool.to_string(),
                pool,
                meta: Options::new(),
            })
        }

        async fn release_pool(&self, pool_id: &str) -> KeelResult<()> {
            self.released.lock().push(pool_id.to_string());
            Ok(())
        }

        async fn request_address(
            &self,
            _pool_id: &str,
            _address: Option<IpAddr>,
            _options: &Options,
        ) -> KeelResult<(Cidr, Options)> {
            unimplemented!("not used by pool iteration tests")
        }

        async fn release_address(&self, _pool_id: &str, _address: IpAddr) -> KeelResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn iteration_skips_excluded_pools_and_releases_held_ones() {
        let ipam = FakeIpam::new(&["172.17.0.0/16", "172.18.0.0/16", "172.19.0.0/16"]);
        let request = PoolRequest {
            address_space: "local".to_string(),
            exclude: vec![
                "172.17.0.0/16".parse().unwrap(),
                "172.18.0.0/16".parse().unwrap(),
            ],
            ..PoolRequest::default()
        };

        let allocated = request_pool_excluding(&ipam, request, "local").await.unwrap();
        assert_eq!(allocated.pool.to_string(), "172.19.0.0/16");
        assert_eq!(
            *ipam.released.lock(),
            vec!["172.17.0.0/16".to_string(), "172.18.0.0/16".to_string()]
        );
    }

    #[tokio::test]
    async fn exhaustion_surfaces_and_releases_held_pools() {
        let ipam = FakeIpam::new(&["172.17.0.0/16"]);
        let request = PoolRequest {
            address_space: "local".to_string(),
            exclude: vec!["172.17.0.0/16".parse().unwrap()],
            ..PoolRequest::default()
        };

        let err = request_pool_excluding(&ipam, request, "local").await.unwrap_err();
        assert!(matches!(err, KeelError::NotFound { .. }));
        assert_eq!(*ipam.released.lock(), vec!["172.17.0.0/16".to_string()]);
    }

    #[tokio::test]
    async fn pinned_pools_bypass_the_iteration() {
        let ipam = FakeIpam::new(&["10.0.0.0/24"]);
        let request = PoolRequest {
            address_space: "local".to_string(),
            pool: Some("10.0.0.0/24".parse().unwrap()),
            exclude: vec!["10.0.0.0/8".parse().unwrap()],
            ..PoolRequest::default()
        };

        // A pinned pool is the caller's choice; exclusions do not apply.
        let allocated = request_pool_excluding(&ipam, request, "local").await.unwrap();
        assert_eq!(allocated.pool.to_string(), "10.0.0.0/24");
        assert!(ipam.released.lock().is_empty());
    }
}
