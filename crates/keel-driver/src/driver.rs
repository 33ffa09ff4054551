//! The bridge driver: network and endpoint lifecycle, host-side link
//! plumbing, rule programming and state persistence.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use keel_common::{Cidr, KeelError, KeelResult};
use keel_firewall::Iptabler;
use keel_netns::Handle;
use keel_store::{FileStore, KvPair};
use tokio::sync::Mutex;

use crate::api::{EndpointInterface, JoinInfo, NetworkDriver, Options};
use crate::config::NetworkSettings;
use crate::endpoint::{
    BindingKey, EndpointRecord, PortBinding, resolve_bindings, mac_from_ip,
};

/// Interface name prefix handed to the sandbox at join.
const CONTAINER_IF_PREFIX: &str = "eth";

/// Host-side link operations the driver needs. Production goes through
/// netlink; tests substitute a recorder.
#[async_trait]
pub trait LinkPlumbing: Send + Sync {
    /// Whether a link with this name exists.
    async fn link_exists(&self, name: &str) -> bool;
    /// Create a bridge link.
    async fn create_bridge(&self, name: &str) -> KeelResult<()>;
    /// Assign an address to a link.
    async fn add_address(&self, name: &str, address: &Cidr) -> KeelResult<()>;
    /// Set a link's MTU.
    async fn set_mtu(&self, name: &str, mtu: u32) -> KeelResult<()>;
    /// Bring a link up.
    async fn set_up(&self, name: &str) -> KeelResult<()>;
    /// Delete a link. Absent links are a no-op.
    async fn delete_link(&self, name: &str) -> KeelResult<()>;
    /// Create a veth pair in the host namespace.
    async fn create_veth(&self, name: &str, peer: &str) -> KeelResult<()>;
    /// Enslave a link to a bridge.
    async fn attach_to_bridge(&self, name: &str, bridge: &str) -> KeelResult<()>;
}

/// [`LinkPlumbing`] over the host's netlink handle.
#[derive(Debug)]
pub struct NetlinkPlumbing {
    handle: Handle,
}

impl NetlinkPlumbing {
    /// Open a netlink connection in the current namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the netlink socket cannot be created.
    pub fn new() -> KeelResult<Self> {
        Ok(Self {
            handle: Handle::new()?,
        })
    }
}

#[async_trait]
impl LinkPlumbing for NetlinkPlumbing {
    async fn link_exists(&self, name: &str) -> bool {
        self.handle.link_exists(name).await
    }

    async fn create_bridge(&self, name: &str) -> KeelResult<()> {
        self.handle.create_bridge(name).await.map(|_| ())
    }

    async fn add_address(&self, name: &str, address: &Cidr) -> KeelResult<()> {
        let index = self.handle.link_index(name).await?;
        self.handle.add_address(index, address, false).await
    }

    async fn set_mtu(&self, name: &str, mtu: u32) -> KeelResult<()> {
        let index = self.handle.link_index(name).await?;
        self.handle.set_mtu(index, mtu).await
    }

    async fn set_up(&self, name: &str) -> KeelResult<()> {
        let index = self.handle.link_index(name).await?;
        self.handle.set_up(index).await
    }

    async fn delete_link(&self, name: &str) -> KeelResult<()> {
        self.handle.delete_link(name).await
    }

    async fn create_veth(&self, name: &str, peer: &str) -> KeelResult<()> {
        self.handle.create_veth(name, peer).await
    }

    async fn attach_to_bridge(&self, name: &str, bridge: &str) -> KeelResult<()> {
        let index = self.handle.link_index(name).await?;
        let master = self.handle.link_index(bridge).await?;
        self.handle.set_master(index, master).await
    }
}

struct EndpointState {
    record: EndpointRecord,
    token: KvPair,
}

struct NetworkState {
    settings: NetworkSettings,
    firewall: keel_firewall::NetworkFirewall,
    token: KvPair,
    endpoints: HashMap<String, EndpointState>,
    /// Whether the bridge link was created by us (and is ours to delete).
    created_bridge: bool,
}

/// The local bridge network driver.
///
/// One driver-wide lock serializes network and endpoint mutations;
/// iptables and netlink already serialize below it, and reads of
/// operational data take the same lock briefly.
pub struct BridgeDriver {
    iptabler: Arc<Iptabler>,
    store: Arc<FileStore>,
    links: Arc<dyn LinkPlumbing>,
    networks: Mutex<HashMap<String, NetworkState>>,
    active_bindings: parking_lot::Mutex<HashSet<BindingKey>>,
}

impl BridgeDriver {
    /// Build a driver over the given firewall, store and link plumbing.
    #[must_use]
    pub fn new(
        iptabler: Arc<Iptabler>,
        store: Arc<FileStore>,
        links: Arc<dyn LinkPlumbing>,
    ) -> Self {
        Self {
            iptabler,
            store,
            links,
            networks: Mutex::new(HashMap::new()),
            active_bindings: parking_lot::Mutex::new(HashSet::new()),
        }
    }

    /// Rebuild in-memory state from the store after a restart.
    ///
    /// Network-level rules are reapplied; endpoint and port rules are
    /// replayed from the persisted records. Stale chains were already
    /// cleared when the [`Iptabler`] came up.
    ///
    /// # Errors
    ///
    /// Returns the first error reprogramming a network; earlier networks
    /// stay restored.
    pub async fn restore(&self) -> KeelResult<()> {
        let mut networks = self.networks.lock().await;

        for pair in self.store.list("bridge/")? {
            let settings: NetworkSettings = serde_json::from_slice(&pair.value)?;
            let id = settings.id.clone();
            tracing::info!(network = %id, bridge = %settings.bridge_name, "restoring network");

            let firewall = self.iptabler.new_network(settings.to_firewall())?;
            // The bridge may be gone after a reboot; put it back. A bridge
            // carrying the generated name is ours to delete later even if
            // it survived the restart.
            let created = self.setup_bridge(&settings).await?;
            let owned =
                created || settings.bridge_name == crate::config::default_bridge_name(&id);
            let mut state = NetworkState {
                created_bridge: owned,
                settings,
                firewall,
                token: pair,
                endpoints: HashMap::new(),
            };

            for ep_pair in self.store.list(&format!("endpoint/{id}/"))? {
                let record: EndpointRecord = serde_json::from_slice(&ep_pair.value)?;
                state.firewall.add_endpoint(record.ipv4(), record.ipv6())?;
                if !record.bindings.is_empty() {
                    let fw: Vec<_> = record.bindings.iter().map(|b| b.to_firewall()).collect();
                    state.firewall.add_ports(&fw)?;
                    let mut active = self.active_bindings.lock();
                    active.extend(record.bindings.iter().filter_map(|b| b.key()));
                }
                state.endpoints.insert(
                    record.id.clone(),
                    EndpointState {
                        record,
                        token: ep_pair,
                    },
                );
            }

            networks.insert(id, state);
        }

        tracing::info!(networks = networks.len(), "driver state restored");
        Ok(())
    }

    async fn setup_bridge(&self, settings: &NetworkSettings) -> KeelResult<bool> {
        let name = &settings.bridge_name;
        let created = if self.links.link_exists(name).await {
            false
        } else {
            self.links.create_bridge(name).await?;
            true
        };

        let result: KeelResult<()> = async {
            if let Some(addr4) = &settings.addr4 {
                self.links.add_address(name, &addr4.gateway).await?;
            }
            if let Some(addr6) = &settings.addr6 {
                self.links.add_address(name, &addr6.gateway).await?;
            }
            if settings.mtu > 0 {
                self.links.set_mtu(name, settings.mtu).await?;
            }
            self.links.set_up(name).await
        }
        .await;

        if let Err(e) = result {
            if created {
                if let Err(undo) = self.links.delete_link(name).await {
                    tracing::warn!(error = %undo, bridge = %name, "bridge rollback");
                }
            }
            return Err(e);
        }
        Ok(created)
    }
}

fn network_key(id: &str) -> String {
    format!("bridge/{id}")
}

fn endpoint_key(nid: &str, eid: &str) -> String {
    format!("endpoint/{nid}/{eid}")
}

fn veth_names(eid: &str) -> (String, String) {
    let short = crate::config::short_id(eid, 7);
    (format!("veth{short}"), format!("vethc{short}"))
}

fn network_not_found(id: &str) -> KeelError {
    KeelError::NotFound {
        resource: "network",
        id: id.to_string(),
    }
}

fn endpoint_not_found(id: &str) -> KeelError {
    KeelError::NotFound {
        resource: "endpoint",
        id: id.to_string(),
    }
}

#[async_trait]
impl NetworkDriver for BridgeDriver {
    async fn create_network(
        &self,
        id: &str,
        options: &Options,
        ipv4: &[crate::api::IpamData],
        ipv6: &[crate::api::IpamData],
    ) -> KeelResult<()> {
        let settings = NetworkSettings::parse(id, options, ipv4, ipv6)?;

        let mut networks = self.networks.lock().await;
        if networks.contains_key(id) {
            return Err(KeelError::AlreadyExists {
                resource: "network",
                id: id.to_string(),
            });
        }
        tracing::info!(network = %id, bridge = %settings.bridge_name, "creating network");

        let firewall = self.iptabler.new_network(settings.to_firewall())?;

        let created_bridge = match self.setup_bridge(&settings).await {
            Ok(created) => created,
            Err(e) => {
                firewall.delete();
                return Err(e);
            }
        };

        let value = serde_json::to_vec(&settings)?;
        let token = match self.store.atomic_put(&network_key(id), &value, None) {
            Ok(token) => token,
            Err(e) => {
                firewall.delete();
                if created_bridge {
                    if let Err(undo) = self.links.delete_link(&settings.bridge_name).await {
                        tracing::warn!(error = %undo, "bridge rollback");
                    }
                }
                return Err(e);
            }
        };

        networks.insert(
            id.to_string(),
            NetworkState {
                settings,
                firewall,
                token,
                endpoints: HashMap::new(),
                created_bridge,
            },
        );
        Ok(())
    }

    async fn delete_network(&self, id: &str) -> KeelResult<()> {
        let mut networks = self.networks.lock().await;
        let state = networks.get(id).ok_or_else(|| network_not_found(id))?;

        if !state.endpoints.is_empty() {
            return Err(KeelError::Forbidden {
                message: format!(
                    "network {id} has {} active endpoints",
                    state.endpoints.len()
                ),
            });
        }
        if state.settings.default_bridge {
            return Err(KeelError::Forbidden {
                message: "the default bridge cannot be deleted".to_string(),
            });
        }

        // CAS first so a concurrent writer is detected before any
        // kernel state is torn down.
        self.store.atomic_delete(&network_key(id), &state.token)?;

        let state = networks.remove(id).unwrap_or_else(|| unreachable!());
        tracing::info!(network = %id, bridge = %state.settings.bridge_name, "deleting network");

        state.firewall.delete();
        if state.created_bridge {
            if let Err(e) = self.links.delete_link(&state.settings.bridge_name).await {
                tracing::warn!(error = %e, bridge = %state.settings.bridge_name, "bridge removal");
            }
        }
        Ok(())
    }

    async fn create_endpoint(
        &self,
        nid: &str,
        eid: &str,
        interface: &mut EndpointInterface,
        _options: &Options,
    ) -> KeelResult<()> {
        let mut networks = self.networks.lock().await;
        let state = networks.get_mut(nid).ok_or_else(|| network_not_found(nid))?;
        if state.endpoints.contains_key(eid) {
            return Err(KeelError::AlreadyExists {
                resource: "endpoint",
                id: eid.to_string(),
            });
        }
        if state.settings.addr4.is_some() && interface.address.is_none() {
            return Err(KeelError::invalid("endpoint needs an IPv4 address"));
        }

        let mut record = EndpointRecord {
            id: eid.to_string(),
            network_id: nid.to_string(),
            addr: interface.address,
            addr_v6: interface.address_v6,
            mac: interface.mac,
            host_if_name: String::new(),
            container_if_name: None,
            sandbox_key: None,
            bindings: Vec::new(),
        };
        if record.mac.is_none() {
            record.mac = record.ipv4().map(mac_from_ip);
        }
        interface.mac = record.mac;

        let (host_name, peer_name) = veth_names(eid);
        record.host_if_name.clone_from(&host_name);

        self.links.create_veth(&host_name, &peer_name).await?;
        let plumbed: KeelResult<()> = async {
            self.links
                .attach_to_bridge(&host_name, &state.settings.bridge_name)
                .await?;
            self.links.set_up(&host_name).await?;
            state.firewall.add_endpoint(record.ipv4(), record.ipv6())
        }
        .await;
        if let Err(e) = plumbed {
            if let Err(undo) = self.links.delete_link(&host_name).await {
                tracing::warn!(error = %undo, "veth rollback");
            }
            return Err(e);
        }

        let value = serde_json::to_vec(&record)?;
        let token = match self.store.atomic_put(&endpoint_key(nid, eid), &value, None) {
            Ok(token) => token,
            Err(e) => {
                if let Err(undo) = state.firewall.del_endpoint(record.ipv4(), record.ipv6()) {
                    tracing::warn!(error = %undo, "endpoint rule rollback");
                }
                if let Err(undo) = self.links.delete_link(&host_name).await {
                    tracing::warn!(error = %undo, "veth rollback");
                }
                return Err(e);
            }
        };

        tracing::info!(network = %nid, endpoint = %eid, veth = %host_name, "created endpoint");
        state
            .endpoints
            .insert(eid.to_string(), EndpointState { record, token });
        Ok(())
    }

    async fn delete_endpoint(&self, nid: &str, eid: &str) -> KeelResult<()> {
        let mut networks = self.networks.lock().await;
        let state = networks.get_mut(nid).ok_or_else(|| network_not_found(nid))?;
        let ep = state
            .endpoints
            .get(eid)
            .ok_or_else(|| endpoint_not_found(eid))?;

        self.store
            .atomic_delete(&endpoint_key(nid, eid), &ep.token)?;
        let ep = state
            .endpoints
            .remove(eid)
            .unwrap_or_else(|| unreachable!());

        if !ep.record.bindings.is_empty() {
            let fw: Vec<_> = ep.record.bindings.iter().map(|b| b.to_firewall()).collect();
            if let Err(e) = state.firewall.del_ports(&fw) {
                tracing::warn!(error = %e, endpoint = %eid, "port rule removal");
            }
            let mut active = self.active_bindings.lock();
            for key in ep.record.bindings.iter().filter_map(|b| b.key()) {
                active.remove(&key);
            }
        }
        if let Err(e) = state
            .firewall
            .del_endpoint(ep.record.ipv4(), ep.record.ipv6())
        {
            tracing::warn!(error = %e, endpoint = %eid, "endpoint rule removal");
        }
        if let Err(e) = self.links.delete_link(&ep.record.host_if_name).await {
            tracing::warn!(error = %e, veth = %ep.record.host_if_name, "veth removal");
        }

        tracing::info!(network = %nid, endpoint = %eid, "deleted endpoint");
        Ok(())
    }

    async fn join(
        &self,
        nid: &str,
        eid: &str,
        sandbox_key: &str,
        _options: &Options,
    ) -> KeelResult<JoinInfo> {
        let mut networks = self.networks.lock().await;
        let state = networks.get_mut(nid).ok_or_else(|| network_not_found(nid))?;
        let settings_gw4 = state.settings.addr4.as_ref().map(|a| a.gateway.addr());
        let settings_gw6 = state.settings.addr6.as_ref().map(|a| a.gateway.addr());
        let internal = state.settings.internal;
        let ep = state
            .endpoints
            .get_mut(eid)
            .ok_or_else(|| endpoint_not_found(eid))?;

        if ep.record.sandbox_key.is_some() {
            return Err(KeelError::Forbidden {
                message: format!("endpoint {eid} is already joined"),
            });
        }

        ep.record.sandbox_key = Some(sandbox_key.to_string());
        let value = serde_json::to_vec(&ep.record)?;
        ep.token = self
            .store
            .atomic_put(&endpoint_key(nid, eid), &value, Some(&ep.token))?;

        let (_, peer_name) = veth_names(eid);
        tracing::info!(network = %nid, endpoint = %eid, sandbox = %sandbox_key, "joined");
        Ok(JoinInfo {
            src_name: peer_name,
            dst_prefix: CONTAINER_IF_PREFIX.to_string(),
            // Internal networks route nowhere off the bridge.
            gateway: settings_gw4.filter(|_| !internal),
            gateway_v6: settings_gw6.filter(|_| !internal),
            static_routes: Vec::new(),
        })
    }

    async fn leave(&self, nid: &str, eid: &str) -> KeelResult<()> {
        let mut networks = self.networks.lock().await;
        let state = networks.get_mut(nid).ok_or_else(|| network_not_found(nid))?;
        let ep = state
            .endpoints
            .get_mut(eid)
            .ok_or_else(|| endpoint_not_found(eid))?;

        if ep.record.sandbox_key.take().is_none() {
            return Err(KeelError::Forbidden {
                message: format!("endpoint {eid} is not joined"),
            });
        }
        ep.record.container_if_name = None;
        let value = serde_json::to_vec(&ep.record)?;
        ep.token = self
            .store
            .atomic_put(&endpoint_key(nid, eid), &value, Some(&ep.token))?;

        tracing::info!(network = %nid, endpoint = %eid, "left");
        Ok(())
    }

    async fn program_external_connectivity(
        &self,
        nid: &str,
        eid: &str,
        bindings: &[PortBinding],
    ) -> KeelResult<()> {
        let mut networks = self.networks.lock().await;
        let state = networks.get_mut(nid).ok_or_else(|| network_not_found(nid))?;
        let default_host_ip = state.settings.host_binding_ipv4;
        let ep = state
            .endpoints
            .get_mut(eid)
            .ok_or_else(|| endpoint_not_found(eid))?;

        let resolved = {
            let mut active = self.active_bindings.lock();
            let before: HashSet<BindingKey> = active.clone();
            match resolve_bindings(
                bindings,
                ep.record.ipv4(),
                ep.record.ipv6(),
                default_host_ip,
                &mut active,
            ) {
                Ok(resolved) => resolved,
                Err(e) => {
                    *active = before;
                    return Err(e);
                }
            }
        };

        let fw: Vec<_> = resolved.iter().map(|b| b.to_firewall()).collect();
        if let Err(e) = state.firewall.add_ports(&fw) {
            let mut active = self.active_bindings.lock();
            for key in resolved.iter().filter_map(|b| b.key()) {
                active.remove(&key);
            }
            return Err(e);
        }

        ep.record.bindings = resolved;
        let value = serde_json::to_vec(&ep.record)?;
        ep.token = self
            .store
            .atomic_put(&endpoint_key(nid, eid), &value, Some(&ep.token))?;

        tracing::info!(
            network = %nid,
            endpoint = %eid,
            ports = ep.record.bindings.len(),
            "programmed external connectivity"
        );
        Ok(())
    }

    async fn revoke_external_connectivity(&self, nid: &str, eid: &str) -> KeelResult<()> {
        let mut networks = self.networks.lock().await;
        let state = networks.get_mut(nid).ok_or_else(|| network_not_found(nid))?;
        let ep = state
            .endpoints
            .get_mut(eid)
            .ok_or_else(|| endpoint_not_found(eid))?;

        if ep.record.bindings.is_empty() {
            return Ok(());
        }
        let fw: Vec<_> = ep.record.bindings.iter().map(|b| b.to_firewall()).collect();
        state.firewall.del_ports(&fw)?;
        {
            let mut active = self.active_bindings.lock();
            for key in ep.record.bindings.iter().filter_map(|b| b.key()) {
                active.remove(&key);
            }
        }

        ep.record.bindings.clear();
        let value = serde_json::to_vec(&ep.record)?;
        ep.token = self
            .store
            .atomic_put(&endpoint_key(nid, eid), &value, Some(&ep.token))?;

        tracing::info!(network = %nid, endpoint = %eid, "revoked external connectivity");
        Ok(())
    }

    async fn endpoint_oper_info(&self, nid: &str, eid: &str) -> KeelResult<Options> {
        let networks = self.networks.lock().await;
        let state = networks.get(nid).ok_or_else(|| network_not_found(nid))?;
        let ep = state
            .endpoints
            .get(eid)
            .ok_or_else(|| endpoint_not_found(eid))?;

        let mut info = Options::new();
        info.insert("host_if_name".to_string(), ep.record.host_if_name.clone());
        if let Some(mac) = ep.record.mac {
            info.insert(
                "mac_address".to_string(),
                format!(
                    "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                    mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
                ),
            );
        }
        if !ep.record.bindings.is_empty() {
            info.insert(
                "exposed_ports".to_string(),
                serde_json::to_string(&ep.record.bindings)?,
            );
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_firewall::{Firewalld, FirewallConfig, MemoryBackend};
    use parking_lot::Mutex as PlMutex;

    /// Records link operations; every link "exists" once created.
    #[derive(Default)]
    struct FakeLinks {
        existing: PlMutex<HashSet<String>>,
        log: PlMutex<Vec<String>>,
        fail_on: PlMutex<Option<String>>,
    }

    impl FakeLinks {
        fn log_op(&self, op: String) -> KeelResult<()> {
            if self
                .fail_on
                .lock()
                .as_ref()
                .is_some_and(|f| op.starts_with(f))
            {
                return Err(KeelError::internal(format!("injected failure: {op}")));
            }
            self.log.lock().push(op);
            Ok(())
        }
    }

    #[async_trait]
    impl LinkPlumbing for FakeLinks {
        async fn link_exists(&self, name: &str) -> bool {
            self.existing.lock().contains(name)
        }

        async fn create_bridge(&self, name: &str) -> KeelResult<()> {
            self.log_op(format!("bridge {name}"))?;
            self.existing.lock().insert(name.to_string());
            Ok(())
        }

        async fn add_address(&self, name: &str, address: &Cidr) -> KeelResult<()> {
            self.log_op(format!("addr {name} {address}"))
        }

        async fn set_mtu(&self, name: &str, mtu: u32) -> KeelResult<()> {
            self.log_op(format!("mtu {name} {mtu}"))
        }

        async fn set_up(&self, name: &str) -> KeelResult<()> {
            self.log_op(format!("up {name}"))
        }

        async fn delete_link(&self, name: &str) -> KeelResult<()> {
            self.log_op(format!("del {name}"))?;
            self.existing.lock().remove(name);
            Ok(())
        }

        async fn create_veth(&self, name: &str, peer: &str) -> KeelResult<()> {
            self.log_op(format!("veth {name} {peer}"))?;
            self.existing.lock().insert(name.to_string());
            self.existing.lock().insert(peer.to_string());
            Ok(())
        }

        async fn attach_to_bridge(&self, name: &str, bridge: &str) -> KeelResult<()> {
            self.log_op(format!("master {name} {bridge}"))
        }
    }

    struct Rig {
        _dir: tempfile::TempDir,
        backend: Arc<MemoryBackend>,
        links: Arc<FakeLinks>,
        store: Arc<FileStore>,
        driver: BridgeDriver,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::default());
        let iptabler = Iptabler::new(
            backend.clone(),
            FirewallConfig::default(),
            &Firewalld::disabled(),
        )
        .unwrap();
        let links = Arc::new(FakeLinks::default());
        let store = Arc::new(FileStore::open(dir.path().join("driver.db")).unwrap());
        let driver = BridgeDriver::new(iptabler, store.clone(), links.clone());
        Rig {
            _dir: dir,
            backend,
            links,
            store,
            driver,
        }
    }

    fn pool(cidr: &str) -> crate::api::IpamData {
        crate::api::IpamData {
            address_space: "local".to_string(),
            pool: cidr.parse().unwrap(),
            gateway: None,
            aux_addresses: HashMap::new(),
        }
    }

    async fn create_net(driver: &BridgeDriver, id: &str) {
        driver
            .create_network(id, &Options::new(), &[pool("172.20.0.0/16")], &[])
            .await
            .unwrap();
    }

    async fn create_ep(driver: &BridgeDriver, nid: &str, eid: &str, addr: &str) {
        let mut iface = EndpointInterface {
            address: Some(addr.parse().unwrap()),
            ..EndpointInterface::default()
        };
        driver
            .create_endpoint(nid, eid, &mut iface, &Options::new())
            .await
            .unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn create_network_plumbs_bridge_rules_and_store() {
        let rig = rig();
        create_net(&rig.driver, "net1abcdef012345").await;

        let log = rig.links.log.lock().clone();
        assert!(log.contains(&"bridge br-net1abcdef01".to_string()));
        assert!(log.contains(&"addr br-net1abcdef01 172.20.0.1/16".to_string()));
        assert!(log.contains(&"up br-net1abcdef01".to_string()));
        assert!(rig.store.exists("bridge/net1abcdef012345").unwrap());
        assert!(
            !rig.backend
                .rules_mentioning("br-net1abcdef01")
                .is_empty()
        );
    }

    #[test_log::test(tokio::test)]
    async fn duplicate_network_id_is_rejected() {
        let rig = rig();
        create_net(&rig.driver, "n1").await;
        let err = rig
            .driver
            .create_network("n1", &Options::new(), &[pool("172.21.0.0/16")], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::AlreadyExists { .. }));
    }

    #[test_log::test(tokio::test)]
    async fn failed_create_leaves_no_trace() {
        let rig = rig();
        *rig.links.fail_on.lock() = Some("up".to_string());

        let err = rig
            .driver
            .create_network("n1", &Options::new(), &[pool("172.20.0.0/16")], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::Internal { .. }));

        // No bridge, no KV entry, no rules mentioning the bridge.
        assert!(!rig.links.link_exists("br-n1").await);
        assert!(!rig.store.exists("bridge/n1").unwrap());
        assert!(
            rig.backend
                .rules_mentioning("br-n1")
                .is_empty()
        );
    }

    #[test_log::test(tokio::test)]
    async fn delete_network_refuses_while_endpoints_exist() {
        let rig = rig();
        create_net(&rig.driver, "n1").await;
        create_ep(&rig.driver, "n1", "e1", "172.20.0.2/16").await;

        let err = rig.driver.delete_network("n1").await.unwrap_err();
        assert!(matches!(err, KeelError::Forbidden { .. }));

        rig.driver.delete_endpoint("n1", "e1").await.unwrap();
        rig.driver.delete_network("n1").await.unwrap();
        assert!(!rig.store.exists("bridge/n1").unwrap());
        assert!(!rig.links.link_exists("br-n1").await);
    }

    #[test_log::test(tokio::test)]
    async fn create_endpoint_fills_mac_and_attaches_veth() {
        let rig = rig();
        create_net(&rig.driver, "n1").await;

        let mut iface = EndpointInterface {
            address: Some("172.20.0.2/16".parse().unwrap()),
            ..EndpointInterface::default()
        };
        rig.driver
            .create_endpoint("n1", "e1abcdef99", &mut iface, &Options::new())
            .await
            .unwrap();

        assert_eq!(iface.mac, Some([0x02, 0x42, 172, 20, 0, 2]));
        let log = rig.links.log.lock().clone();
        assert!(log.contains(&"veth vethe1abcde vethce1abcde".to_string()));
        assert!(log.contains(&"master vethe1abcde br-n1".to_string()));
        assert!(rig.store.exists("endpoint/n1/e1abcdef99").unwrap());
    }

    #[test]
    fn veth_names_respect_char_boundaries() {
        // Opaque endpoint ids are not guaranteed ASCII; a multi-byte
        // character straddling the cut shortens the name instead of
        // panicking.
        let (host, peer) = veth_names("abcdef\u{e9}0");
        assert_eq!(host, "vethabcdef");
        assert_eq!(peer, "vethcabcdef");

        let (host, peer) = veth_names("e1");
        assert_eq!(host, "vethe1");
        assert_eq!(peer, "vethce1");
    }

    #[test_log::test(tokio::test)]
    async fn join_reports_gateway_and_marks_the_endpoint() {
        let rig = rig();
        create_net(&rig.driver, "n1").await;
        create_ep(&rig.driver, "n1", "e1", "172.20.0.2/16").await;

        let info = rig
            .driver
            .join("n1", "e1", "/run/netns/sb1", &Options::new())
            .await
            .unwrap();
        assert_eq!(info.src_name, "vethce1");
        assert_eq!(info.dst_prefix, "eth");
        assert_eq!(info.gateway, Some("172.20.0.1".parse().unwrap()));
        assert_eq!(info.gateway_v6, None);

        let err = rig
            .driver
            .join("n1", "e1", "/run/netns/sb2", &Options::new())
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::Forbidden { .. }));

        rig.driver.leave("n1", "e1").await.unwrap();
        rig.driver
            .join("n1", "e1", "/run/netns/sb2", &Options::new())
            .await
            .unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn port_binding_tuples_are_unique_across_endpoints() {
        let rig = rig();
        create_net(&rig.driver, "n1").await;
        create_ep(&rig.driver, "n1", "e1", "172.20.0.2/16").await;
        create_ep(&rig.driver, "n1", "e2", "172.20.0.3/16").await;

        let binding = PortBinding {
            proto: "tcp".to_string(),
            port: 80,
            host_ip: None,
            host_port: 8080,
            host_port_end: 0,
        };
        rig.driver
            .program_external_connectivity("n1", "e1", std::slice::from_ref(&binding))
            .await
            .unwrap();

        let err = rig
            .driver
            .program_external_connectivity("n1", "e2", std::slice::from_ref(&binding))
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::AlreadyExists { .. }));

        // Revoking frees the tuple for the next endpoint.
        rig.driver
            .revoke_external_connectivity("n1", "e1")
            .await
            .unwrap();
        rig.driver
            .program_external_connectivity("n1", "e2", &[binding])
            .await
            .unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn failed_port_programming_releases_its_tuples() {
        let rig = rig();
        create_net(&rig.driver, "n1").await;
        create_ep(&rig.driver, "n1", "e1", "172.20.0.2/16").await;

        rig.backend.fail_on("--to-destination");
        let binding = PortBinding {
            proto: "tcp".to_string(),
            port: 80,
            host_ip: None,
            host_port: 8080,
            host_port_end: 0,
        };
        rig.driver
            .program_external_connectivity("n1", "e1", std::slice::from_ref(&binding))
            .await
            .unwrap_err();

        rig.backend.clear_failures();
        rig.driver
            .program_external_connectivity("n1", "e1", &[binding])
            .await
            .unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn oper_info_reports_veth_mac_and_ports() {
        let rig = rig();
        create_net(&rig.driver, "n1").await;
        create_ep(&rig.driver, "n1", "e1", "172.20.0.2/16").await;
        rig.driver
            .program_external_connectivity(
                "n1",
                "e1",
                &[PortBinding {
                    proto: "tcp".to_string(),
                    port: 80,
                    host_ip: None,
                    host_port: 8080,
                    host_port_end: 0,
                }],
            )
            .await
            .unwrap();

        let info = rig.driver.endpoint_oper_info("n1", "e1").await.unwrap();
        assert_eq!(info.get("host_if_name").unwrap(), "vethe1");
        assert_eq!(info.get("mac_address").unwrap(), "02:42:ac:14:00:02");
        assert!(info.get("exposed_ports").unwrap().contains("8080"));
    }

    #[test_log::test(tokio::test)]
    async fn restore_rebuilds_networks_endpoints_and_bindings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("driver.db");
        let backend = Arc::new(MemoryBackend::default());
        let links = Arc::new(FakeLinks::default());

        {
            let iptabler = Iptabler::new(
                backend.clone(),
                FirewallConfig::default(),
                &Firewalld::disabled(),
            )
            .unwrap();
            let store = Arc::new(FileStore::open(&path).unwrap());
            let driver = BridgeDriver::new(iptabler, store.clone(), links.clone());
            create_net(&driver, "n1").await;
            create_ep(&driver, "n1", "e1", "172.20.0.2/16").await;
            driver
                .program_external_connectivity(
                    "n1",
                    "e1",
                    &[PortBinding {
                        proto: "tcp".to_string(),
                        port: 80,
                        host_ip: None,
                        host_port: 8080,
                        host_port_end: 0,
                    }],
                )
                .await
                .unwrap();
            store.close();
        }

        // Fresh daemon: new iptabler wipes the chains, restore replays.
        let iptabler = Iptabler::new(
            backend.clone(),
            FirewallConfig::default(),
            &Firewalld::disabled(),
        )
        .unwrap();
        let store = Arc::new(FileStore::open(&path).unwrap());
        let driver = BridgeDriver::new(iptabler, store, links);
        driver.restore().await.unwrap();

        // Rules for the bridge and the published port are back.
        assert!(
            !backend
                .rules_mentioning("br-n1")
                .is_empty()
        );
        let nat = backend.rules_mentioning("8080");
        assert!(!nat.is_empty());

        // Restored tuples still enforce uniqueness.
        let err = driver
            .program_external_connectivity(
                "n1",
                "e1",
                &[PortBinding {
                    proto: "tcp".to_string(),
                    port: 81,
                    host_ip: None,
                    host_port: 8080,
                    host_port_end: 0,
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::AlreadyExists { .. }));

        driver.delete_endpoint("n1", "e1").await.unwrap();
        driver.delete_network("n1").await.unwrap();
    }
}
