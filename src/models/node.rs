use crate::models::{AclId, ExtClient, HostId, NetId, NodeId};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeAction {
    #[default]
    NoOp,
    Delete,
    ForceUpdate,
}

/// A host's membership in exactly one network. Owns the host's address
/// within that network's ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub host_id: HostId,
    pub network: NetId,
    pub address: Option<Ipv4Addr>,
    pub address6: Option<Ipv6Addr>,
    pub is_egress_gateway: bool,
    #[serde(default)]
    pub egress_gateway_ranges: Vec<IpNet>,
    pub is_ingress_gateway: bool,
    pub is_internet_gateway: bool,
    /// The internet gateway this node routes its default traffic through,
    /// when it has selected one.
    pub internet_gw_node_id: Option<NodeId>,
    pub is_fail_over: bool,
    pub pending_delete: bool,
    pub last_check_in: i64,
    #[serde(default)]
    pub action: NodeAction,
}

impl Node {
    pub fn address_ipnet4(&self) -> Option<IpNet> {
        self.address
            .map(|a| IpNet::new(IpAddr::V4(a), 32).expect("/32 prefix"))
    }

    pub fn address_ipnet6(&self) -> Option<IpNet> {
        self.address6
            .map(|a| IpNet::new(IpAddr::V6(a), 128).expect("/128 prefix"))
    }
}

/// Accessors shared by everything that can appear in a peer graph,
/// regardless of whether it is a real node or a projected ext-client.
pub trait PeerAddr {
    fn acl_id(&self) -> AclId;
    fn network(&self) -> &NetId;
    fn addr4(&self) -> Option<Ipv4Addr>;
    fn addr6(&self) -> Option<Ipv6Addr>;

    fn addr4_net(&self) -> Option<IpNet> {
        self.addr4()
            .map(|a| IpNet::new(IpAddr::V4(a), 32).expect("/32 prefix"))
    }

    fn addr6_net(&self) -> Option<IpNet> {
        self.addr6()
            .map(|a| IpNet::new(IpAddr::V6(a), 128).expect("/128 prefix"))
    }
}

impl PeerAddr for Node {
    fn acl_id(&self) -> AclId {
        AclId::from(self.id)
    }

    fn network(&self) -> &NetId {
        &self.network
    }

    fn addr4(&self) -> Option<Ipv4Addr> {
        self.address
    }

    fn addr6(&self) -> Option<Ipv6Addr> {
        self.address6
    }
}

impl PeerAddr for ExtClient {
    fn acl_id(&self) -> AclId {
        AclId::new(self.client_id.clone())
    }

    fn network(&self) -> &NetId {
        &self.network
    }

    fn addr4(&self) -> Option<Ipv4Addr> {
        self.address
    }

    fn addr6(&self) -> Option<Ipv6Addr> {
        self.address6
    }
}

/// Uniform participant type for the policy engine and the firewall-rule
/// emitter: a device node, an ext-client projected as a static device, or
/// a user-bound ext-client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Peer {
    Device(Node),
    StaticDevice(ExtClient),
    StaticUser(ExtClient),
}

impl Peer {
    pub fn is_static(&self) -> bool {
        !matches!(self, Peer::Device(_))
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Peer::StaticUser(_))
    }

    pub fn static_client(&self) -> Option<&ExtClient> {
        match self {
            Peer::Device(_) => None,
            Peer::StaticDevice(c) | Peer::StaticUser(c) => Some(c),
        }
    }
}

impl PeerAddr for Peer {
    fn acl_id(&self) -> AclId {
        match self {
            Peer::Device(n) => n.acl_id(),
            Peer::StaticDevice(c) | Peer::StaticUser(c) => c.acl_id(),
        }
    }

    fn network(&self) -> &NetId {
        match self {
            Peer::Device(n) => n.network(),
            Peer::StaticDevice(c) | Peer::StaticUser(c) => c.network(),
        }
    }

    fn addr4(&self) -> Option<Ipv4Addr> {
        match self {
            Peer::Device(n) => n.addr4(),
            Peer::StaticDevice(c) | Peer::StaticUser(c) => c.addr4(),
        }
    }

    fn addr6(&self) -> Option<Ipv6Addr> {
        match self {
            Peer::Device(n) => n.addr6(),
            Peer::StaticDevice(c) | Peer::StaticUser(c) => c.addr6(),
        }
    }
}
