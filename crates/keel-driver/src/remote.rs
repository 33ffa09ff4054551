//! HTTP adapters for out-of-process driver and IPAM plugins.
//!
//! Plugins speak a JSON-RPC-over-POST protocol: each method is a path
//! like `/NetworkDriver.CreateNetwork`, the body is a JSON object, and a
//! non-empty `Err` field in the response is the plugin's error channel.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use keel_common::{Cidr, KeelError, KeelResult};
use keel_netns::StaticRoute;
use serde::{Deserialize, Serialize};

use crate::api::{
    AllocatedPool, EndpointInterface, Ipam, IpamCapabilities, IpamData, JoinInfo,
    NetworkDriver, Options, PoolRequest,
};
use crate::endpoint::PortBinding;

async fn call<B: Serialize + Sync>(
    client: &reqwest::Client,
    base: &str,
    method: &str,
    body: &B,
) -> KeelResult<serde_json::Value> {
    let url = format!("{base}/{method}");
    let response = client
        .post(&url)
        .json(body)
        .send()
        .await
        .map_err(|e| KeelError::internal(format!("{method}: {e}")))?;
    let status = response.status();
    let value: serde_json::Value = response
        .json()
        .await
        .map_err(|e| KeelError::internal(format!("{method}: bad response: {e}")))?;

    if let Some(err) = value.get("Err").and_then(serde_json::Value::as_str) {
        if !err.is_empty() {
            return Err(KeelError::internal(format!("{method}: {err}")));
        }
    }
    if !status.is_success() {
        return Err(KeelError::internal(format!("{method}: HTTP {status}")));
    }
    Ok(value)
}

fn parse<T: serde::de::DeserializeOwned>(method: &str, value: serde_json::Value) -> KeelResult<T> {
    serde_json::from_value(value)
        .map_err(|e| KeelError::internal(format!("{method}: bad response: {e}")))
}

fn format_mac(mac: [u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

fn parse_mac(s: &str) -> KeelResult<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in &mut mac {
        let part = parts
            .next()
            .ok_or_else(|| KeelError::invalid(format!("bad mac {s}")))?;
        *byte = u8::from_str_radix(part, 16)
            .map_err(|_| KeelError::invalid(format!("bad mac {s}")))?;
    }
    if parts.next().is_some() {
        return Err(KeelError::invalid(format!("bad mac {s}")));
    }
    Ok(mac)
}

fn parse_cidr_opt(field: &str, s: Option<&String>) -> KeelResult<Option<Cidr>> {
    s.filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .map_err(|_| KeelError::invalid(format!("bad {field}: {s}")))
        })
        .transpose()
}

#[derive(Serialize)]
struct IpamDataWire {
    #[serde(rename = "AddressSpace")]
    address_space: String,
    #[serde(rename = "Pool")]
    pool: String,
    #[serde(rename = "Gateway")]
    gateway: String,
    #[serde(rename = "AuxAddresses")]
    aux_addresses: HashMap<String, String>,
}

impl From<&IpamData> for IpamDataWire {
    fn from(data: &IpamData) -> Self {
        Self {
            address_space: data.address_space.clone(),
            pool: data.pool.to_string(),
            gateway: data.gateway.map(|g| g.to_string()).unwrap_or_default(),
            aux_addresses: data
                .aux_addresses
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect(),
        }
    }
}

/// A network driver served by an external plugin process.
pub struct RemoteDriver {
    name: String,
    base: String,
    client: reqwest::Client,
}

impl RemoteDriver {
    /// Connect to a plugin at `base` (scheme, host and port, no trailing
    /// slash).
    #[must_use]
    pub fn new(name: impl Into<String>, base: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: base.into(),
            client: reqwest::Client::new(),
        }
    }

    /// The plugin's registered name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn call(
        &self,
        method: &str,
        body: &(impl Serialize + Sync),
    ) -> KeelResult<serde_json::Value> {
        call(&self.client, &self.base, method, body).await
    }
}

#[derive(Deserialize, Default)]
struct InterfaceWire {
    #[serde(rename = "Address", default)]
    address: Option<String>,
    #[serde(rename = "AddressIPv6", default)]
    address_v6: Option<String>,
    #[serde(rename = "MacAddress", default)]
    mac_address: Option<String>,
}

#[derive(Deserialize)]
struct CreateEndpointResponse {
    #[serde(rename = "Interface", default)]
    interface: Option<InterfaceWire>,
}

#[derive(Deserialize)]
struct StaticRouteWire {
    #[serde(rename = "Destination")]
    destination: String,
    #[serde(rename = "NextHop", default)]
    next_hop: Option<String>,
    #[serde(rename = "RouteType", default)]
    route_type: u8,
}

#[derive(Deserialize)]
struct InterfaceNameWire {
    #[serde(rename = "SrcName")]
    src_name: String,
    #[serde(rename = "DstPrefix")]
    dst_prefix: String,
}

#[derive(Deserialize)]
struct JoinResponse {
    #[serde(rename = "InterfaceName")]
    interface_name: InterfaceNameWire,
    #[serde(rename = "Gateway", default)]
    gateway: Option<String>,
    #[serde(rename = "GatewayIPv6", default)]
    gateway_v6: Option<String>,
    #[serde(rename = "StaticRoutes", default)]
    static_routes: Vec<StaticRouteWire>,
}

fn parse_ip_opt(field: &str, s: Option<&String>) -> KeelResult<Option<IpAddr>> {
    s.filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .map_err(|_| KeelError::invalid(format!("bad {field}: {s}")))
        })
        .transpose()
}

#[async_trait]
impl NetworkDriver for RemoteDriver {
    async fn create_network(
        &self,
        id: &str,
        options: &Options,
        ipv4: &[IpamData],
        ipv6: &[IpamData],
    ) -> KeelResult<()> {
        let body = serde_json::json!({
            "NetworkID": id,
            "Options": options,
            "IPv4Data": ipv4.iter().map(IpamDataWire::from).collect::<Vec<_>>(),
            "IPv6Data": ipv6.iter().map(IpamDataWire::from).collect::<Vec<_>>(),
        });
        self.call("NetworkDriver.CreateNetwork", &body).await?;
        Ok(())
    }

    async fn delete_network(&self, id: &str) -> KeelResult<()> {
        let body = serde_json::json!({ "NetworkID": id });
        self.call("NetworkDriver.DeleteNetwork", &body).await?;
        Ok(())
    }

    async fn create_endpoint(
        &self,
        nid: &str,
        eid: &str,
        interface: &mut EndpointInterface,
        options: &Options,
    ) -> KeelResult<()> {
        let body = serde_json::json!({
            "NetworkID": nid,
            "EndpointID": eid,
            "Interface": {
                "Address": interface.address.map(|a| a.to_string()).unwrap_or_default(),
                "AddressIPv6": interface.address_v6.map(|a| a.to_string()).unwrap_or_default(),
                "MacAddress": interface.mac.map(format_mac).unwrap_or_default(),
            },
            "Options": options,
        });
        let value = self.call("NetworkDriver.CreateEndpoint", &body).await?;
        let response: CreateEndpointResponse = parse("NetworkDriver.CreateEndpoint", value)?;

        // The plugin only fills fields the caller left empty.
        if let Some(wire) = response.interface {
            if interface.address.is_none() {
                interface.address = parse_cidr_opt("Address", wire.address.as_ref())?;
            }
            if interface.address_v6.is_none() {
                interface.address_v6 =
                    parse_cidr_opt("AddressIPv6", wire.address_v6.as_ref())?;
            }
            if interface.mac.is_none() {
                if let Some(mac) = wire.mac_address.filter(|m| !m.is_empty()) {
                    interface.mac = Some(parse_mac(&mac)?);
                }
            }
        }
        Ok(())
    }

    async fn delete_endpoint(&self, nid: &str, eid: &str) -> KeelResult<()> {
        let body = serde_json::json!({ "NetworkID": nid, "EndpointID": eid });
        self.call("NetworkDriver.DeleteEndpoint", &body).await?;
        Ok(())
    }

    async fn join(
        &self,
        nid: &str,
        eid: &str,
        sandbox_key: &str,
        options: &Options,
    ) -> KeelResult<JoinInfo> {
        let body = serde_json::json!({
            "NetworkID": nid,
            "EndpointID": eid,
            "SandboxKey": sandbox_key,
            "Options": options,
        });
        let value = self.call("NetworkDriver.Join", &body).await?;
        let response: JoinResponse = parse("NetworkDriver.Join", value)?;

        let mut static_routes = Vec::new();
        for route in response.static_routes {
            let Some(next_hop) = parse_ip_opt("NextHop", route.next_hop.as_ref())? else {
                // Connected routes (type 1) carry no next hop; the sandbox
                // gets those from its interface addresses already.
                tracing::debug!(
                    destination = %route.destination,
                    route_type = route.route_type,
                    "skipping next-hop-less static route"
                );
                continue;
            };
            let destination: Cidr = route.destination.parse().map_err(|_| {
                KeelError::invalid(format!("bad route destination {}", route.destination))
            })?;
            static_routes.push(StaticRoute {
                destination,
                next_hop,
            });
        }

        Ok(JoinInfo {
            src_name: response.interface_name.src_name,
            dst_prefix: response.interface_name.dst_prefix,
            gateway: parse_ip_opt("Gateway", response.gateway.as_ref())?,
            gateway_v6: parse_ip_opt("GatewayIPv6", response.gateway_v6.as_ref())?,
            static_routes,
        })
    }

    async fn leave(&self, nid: &str, eid: &str) -> KeelResult<()> {
        let body = serde_json::json!({ "NetworkID": nid, "EndpointID": eid });
        self.call("NetworkDriver.Leave", &body).await?;
        Ok(())
    }

    async fn program_external_connectivity(
        &self,
        nid: &str,
        eid: &str,
        bindings: &[PortBinding],
    ) -> KeelResult<()> {
        let body = serde_json::json!({
            "NetworkID": nid,
            "EndpointID": eid,
            "Options": { "com.docker.network.portmap": bindings },
        });
        self.call("NetworkDriver.ProgramExternalConnectivity", &body)
            .await?;
        Ok(())
    }

    async fn revoke_external_connectivity(&self, nid: &str, eid: &str) -> KeelResult<()> {
        let body = serde_json::json!({ "NetworkID": nid, "EndpointID": eid });
        self.call("NetworkDriver.RevokeExternalConnectivity", &body)
            .await?;
        Ok(())
    }

    async fn endpoint_oper_info(&self, nid: &str, eid: &str) -> KeelResult<Options> {
        let body = serde_json::json!({ "NetworkID": nid, "EndpointID": eid });
        let value = self.call("NetworkDriver.EndpointOperInfo", &body).await?;

        let mut info = Options::new();
        if let Some(map) = value.get("Value").and_then(serde_json::Value::as_object) {
            for (k, v) in map {
                let rendered = v
                    .as_str()
                    .map_or_else(|| v.to_string(), std::string::ToString::to_string);
                info.insert(k.clone(), rendered);
            }
        }
        Ok(info)
    }

    async fn discover_new(&self, kind: &str, data: &Options) -> KeelResult<()> {
        let body = serde_json::json!({ "DiscoveryType": kind, "DiscoveryData": data });
        self.call("NetworkDriver.DiscoverNew", &body).await?;
        Ok(())
    }

    async fn discover_delete(&self, kind: &str, data: &Options) -> KeelResult<()> {
        let body = serde_json::json!({ "DiscoveryType": kind, "DiscoveryData": data });
        self.call("NetworkDriver.DiscoverDelete", &body).await?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct CapabilitiesResponse {
    #[serde(rename = "RequiresMACAddress", default)]
    requires_mac_address: bool,
    #[serde(rename = "RequiresRequestReplay", default)]
    requires_request_replay: bool,
}

/// An address allocator served by an external plugin process.
pub struct RemoteIpam {
    name: String,
    base: String,
    client: reqwest::Client,
    capabilities: IpamCapabilities,
}

impl RemoteIpam {
    /// Connect to a plugin at `base`, probing its capabilities. Legacy
    /// plugins without `GetCapabilities` register with the defaults.
    pub async fn connect(name: impl Into<String>, base: impl Into<String>) -> Self {
        let name = name.into();
        let base = base.into();
        let client = reqwest::Client::new();

        let capabilities = match call(
            &client,
            &base,
            "IpamDriver.GetCapabilities",
            &serde_json::json!({}),
        )
        .await
        .and_then(|v| parse::<CapabilitiesResponse>("IpamDriver.GetCapabilities", v))
        {
            Ok(caps) => IpamCapabilities {
                requires_mac_address: caps.requires_mac_address,
                requires_request_replay: caps.requires_request_replay,
            },
            Err(e) => {
                tracing::debug!(plugin = %name, error = %e, "no capabilities, assuming legacy");
                IpamCapabilities::default()
            }
        };

        Self {
            name,
            base,
            client,
            capabilities,
        }
    }

    /// The plugin's registered name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// What the plugin requires of its callers.
    #[must_use]
    pub fn capabilities(&self) -> IpamCapabilities {
        self.capabilities
    }

    async fn call(
        &self,
        method: &str,
        body: &(impl Serialize + Sync),
    ) -> KeelResult<serde_json::Value> {
        call(&self.client, &self.base, method, body).await
    }
}

#[derive(Deserialize)]
struct AddressSpacesResponse {
    #[serde(rename = "LocalDefaultAddressSpace")]
    local: String,
    #[serde(rename = "GlobalDefaultAddressSpace")]
    global: String,
}

#[derive(Deserialize)]
struct RequestPoolResponse {
    #[serde(rename = "PoolID")]
    pool_id: String,
    #[serde(rename = "Pool")]
    pool: String,
    #[serde(rename = "Data", default)]
    data: HashMap<String, String>,
}

#[derive(Deserialize)]
struct RequestAddressResponse {
    #[serde(rename = "Address", default)]
    address: Option<String>,
    #[serde(rename = "Data", default)]
    data: HashMap<String, String>,
}

#[async_trait]
impl Ipam for RemoteIpam {
    async fn default_address_spaces(&self) -> KeelResult<(String, String)> {
        let value = self
            .call("IpamDriver.GetDefaultAddressSpaces", &serde_json::json!({}))
            .await?;
        let spaces: AddressSpacesResponse =
            parse("IpamDriver.GetDefaultAddressSpaces", value)?;
        Ok((spaces.local, spaces.global))
    }

    async fn request_pool(&self, request: &PoolRequest) -> KeelResult<AllocatedPool> {
        let body = serde_json::json!({
            "AddressSpace": request.address_space,
            "Pool": request.pool.map(|p| p.to_string()).unwrap_or_default(),
            "SubPool": request.sub_pool.map(|p| p.to_string()).unwrap_or_default(),
            "Options": request.options,
            "V6": request.v6,
        });
        let value = self.call("IpamDriver.RequestPool", &body).await?;
        let response: RequestPoolResponse = parse("IpamDriver.RequestPool", value)?;

        let pool: Cidr = response
            .pool
            .parse()
            .map_err(|_| KeelError::invalid(format!("bad pool {}", response.pool)))?;
        Ok(AllocatedPool {
            pool_id: response.pool_id,
            pool,
            meta: response.data,
        })
    }

    async fn release_pool(&self, pool_id: &str) -> KeelResult<()> {
        let body = serde_json::json!({ "PoolID": pool_id });
        self.call("IpamDriver.ReleasePool", &body).await?;
        Ok(())
    }

    async fn request_address(
        &self,
        pool_id: &str,
        address: Option<IpAddr>,
        options: &Options,
    ) -> KeelResult<(Cidr, Options)> {
        let body = serde_json::json!({
            "PoolID": pool_id,
            "Address": address.map(|a| a.to_string()).unwrap_or_default(),
            "Options": options,
        });
        let value = self.call("IpamDriver.RequestAddress", &body).await?;
        let response: RequestAddressResponse = parse("IpamDriver.RequestAddress", value)?;

        // An allocator that answers without an address has nothing left.
        let Some(address) = response.address.filter(|a| !a.is_empty()) else {
            return Err(KeelError::NotFound {
                resource: "address",
                id: pool_id.to_string(),
            });
        };
        let cidr: Cidr = address
            .parse()
            .map_err(|_| KeelError::invalid(format!("bad address {address}")))?;
        Ok((cidr, response.data))
    }

    async fn release_address(&self, pool_id: &str, address: IpAddr) -> KeelResult<()> {
        let body = serde_json::json!({
            "PoolID": pool_id,
            "Address": address.to_string(),
        });
        self.call("IpamDriver.ReleaseAddress", &body).await?;
        Ok(())
    }
}
