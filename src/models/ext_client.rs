use crate::models::{AclId, NetId, NodeId, Peer, WgPublicKey};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};

/// A remote WireGuard peer reaching the overlay through a pinned ingress
/// gateway. `client_id` is unique within the network and at most 15 bytes
/// (it doubles as an interface name on some endpoints).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtClient {
    pub client_id: String,
    pub network: NetId,
    pub public_key: WgPublicKey,
    /// Only populated when the server generated the key pair; otherwise a
    /// placeholder the client config template tells the operator to fill.
    #[serde(default)]
    pub private_key: String,
    pub address: Option<Ipv4Addr>,
    pub address6: Option<Ipv6Addr>,
    #[serde(default)]
    pub extra_allowed_ips: Vec<IpNet>,
    pub ingress_gateway_id: NodeId,
    #[serde(default)]
    pub owner_id: String,
    /// Non-empty marks this as a user client rather than a device client.
    #[serde(default)]
    pub remote_access_client_id: String,
    pub enabled: bool,
    #[serde(default)]
    pub denied_acls: HashSet<AclId>,
    #[serde(default)]
    pub dns: String,
    #[serde(default)]
    pub post_up: String,
    #[serde(default)]
    pub post_down: String,
    #[serde(default)]
    pub tags: HashSet<String>,
    pub last_modified: i64,
}

impl ExtClient {
    pub fn is_user_client(&self) -> bool {
        !self.remote_access_client_id.is_empty()
    }

    /// Projects the client into the uniform peer shape the policy engine
    /// and firewall emitter operate on.
    pub fn to_peer(&self) -> Peer {
        if self.is_user_client() {
            Peer::StaticUser(self.clone())
        } else {
            Peer::StaticDevice(self.clone())
        }
    }

    /// Per-client deny list, consulted before any policy evaluation.
    pub fn allows_peer(&self, peer_id: &AclId) -> bool {
        !self.denied_acls.contains(peer_id)
    }
}

/// Caller-supplied update payload. Merging into an existing client is
/// selective: identity and key fields only replace when supplied, script
/// fields are normalized, the deny list only replaces when present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomExtClient {
    pub client_id: String,
    pub public_key: Option<WgPublicKey>,
    #[serde(default)]
    pub extra_allowed_ips: Vec<IpNet>,
    pub enabled: bool,
    pub denied_acls: Option<HashSet<AclId>>,
    #[serde(default)]
    pub remote_access_client_id: String,
    #[serde(default)]
    pub dns: String,
    #[serde(default)]
    pub post_up: String,
    #[serde(default)]
    pub post_down: String,
    #[serde(default)]
    pub tags: HashSet<String>,
}

impl CustomExtClient {
    /// A no-op update payload for an existing client.
    pub fn from_client(client: &ExtClient) -> Self {
        Self {
            client_id: client.client_id.clone(),
            public_key: Some(client.public_key),
            extra_allowed_ips: client.extra_allowed_ips.clone(),
            enabled: client.enabled,
            denied_acls: Some(client.denied_acls.clone()),
            remote_access_client_id: client.remote_access_client_id.clone(),
            dns: client.dns.clone(),
            post_up: client.post_up.clone(),
            post_down: client.post_down.clone(),
            tags: client.tags.clone(),
        }
    }
}
