use crate::models::{Host, HostId, NetId, Node, NodeId, Protocol, WgPublicKey};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

/// One WireGuard peer as the receiving host should install it. A `remove`
/// entry tells the receiver to drop the peer during incremental
/// reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub public_key: WgPublicKey,
    #[serde(default)]
    pub allowed_ips: Vec<IpNet>,
    pub endpoint: Option<SocketAddr>,
    pub persistent_keepalive: Option<u16>,
    #[serde(default)]
    pub remove: bool,
}

/// Identity/address summary carried alongside the raw peer list so
/// receivers can label interfaces without another lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdAndAddr {
    pub id: String,
    pub name: String,
    pub address: String,
    pub is_ext_client: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EgressNetworkRoute {
    pub egress_gw_addr: Option<IpNet>,
    pub egress_gw_addr6: Option<IpNet>,
    pub node_addr: Option<IpNet>,
    pub node_addr6: Option<IpNet>,
    pub egress_ranges: Vec<IpNet>,
}

/// A filter entry an ingress gateway applies between its clients and the
/// rest of the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FwRule {
    pub src_ip: IpNet,
    pub dst_ip: IpNet,
    pub allowed_protocol: Protocol,
    #[serde(default)]
    pub allowed_ports: Vec<String>,
    pub allow: bool,
}

/// The full derived state pushed to one host: its peer list plus the
/// auxiliary structures (ids, egress routes, ingress firewall rules).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerUpdate {
    pub server: String,
    pub host_id: HostId,
    pub peers: Vec<PeerConfig>,
    pub peer_ids: Vec<IdAndAddr>,
    pub egress_routes: Vec<EgressNetworkRoute>,
    pub is_ingress_gateway: bool,
    pub fw_rules: Vec<FwRule>,
    /// true: receiver atomically replaces its peer set; false: receiver
    /// reconciles incrementally (deletion deltas use this).
    pub replace_peers: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostMgmtAction {
    JoinHostToNetwork,
    DeleteHost,
    UpdateHost,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostUpdate {
    pub action: HostMgmtAction,
    pub host: Host,
    pub node: Option<Node>,
}

/// Per-node connectivity metrics pushed to the exporter topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub node_id: NodeId,
    pub network: NetId,
    pub connectivity: HashMap<String, NodeMetric>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetric {
    pub connected: bool,
    pub latency_ms: u64,
    pub uptime_secs: u64,
}
