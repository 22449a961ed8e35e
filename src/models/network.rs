use crate::models::NetId;
use chrono::Utc;
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

/// A logical overlay with an address range and a membership set of nodes.
/// At least one of the two address ranges is always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub net_id: NetId,
    pub address_range: Option<Ipv4Net>,
    pub address_range6: Option<Ipv6Net>,
    pub is_ipv4: bool,
    pub is_ipv6: bool,
    pub default_udp_hole_punch: bool,
    #[serde(default)]
    pub default_user_policy: Policy,
    #[serde(default)]
    pub default_device_policy: Policy,
    #[serde(default)]
    pub access_keys: Vec<AccessKey>,
    pub nodes_last_modified: i64,
    pub key_update_timestamp: i64,
}

impl Network {
    pub fn new(net_id: NetId, range4: Option<Ipv4Net>, range6: Option<Ipv6Net>) -> Self {
        let now = Utc::now().timestamp();
        Self {
            net_id,
            is_ipv4: range4.is_some(),
            is_ipv6: range6.is_some(),
            address_range: range4,
            address_range6: range6,
            default_udp_hole_punch: true,
            default_user_policy: Policy::default(),
            default_device_policy: Policy::default(),
            access_keys: Vec::new(),
            nodes_last_modified: now,
            key_update_timestamp: now,
        }
    }
}

/// A shared enrollment secret. The value is what joining hosts present;
/// uses counts remaining enrollments (0 = unlimited).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessKey {
    pub name: String,
    pub value: String,
    pub uses: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    All,
    Tcp,
    Udp,
    Icmp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficDirection {
    Uni,
    Bi,
}

/// A network-wide default policy (one for user→device, one for
/// device→device). `enabled` means blanket allow; per-pair ACL entries
/// override. The protocol/port set is what justifying rules carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub enabled: bool,
    pub proto: Protocol,
    pub ports: Vec<String>,
    pub direction: TrafficDirection,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            enabled: true,
            proto: Protocol::All,
            ports: Vec::new(),
            direction: TrafficDirection::Bi,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    User,
    Device,
}
