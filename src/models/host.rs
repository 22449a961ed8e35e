use crate::models::{HostId, NodeId, WgPublicKey};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Os {
    Linux,
    Windows,
    Macos,
    Freebsd,
    Iot,
}

/// A machine with one WireGuard interface. A host may participate in
/// several networks; each membership is a separate node referencing back
/// here via `host_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub name: String,
    pub public_key: WgPublicKey,
    pub endpoint_ip: Option<IpAddr>,
    pub listen_port: u16,
    pub persistent_keepalive: u16,
    pub os: Os,
    #[serde(default)]
    pub nodes: Vec<NodeId>,
}

impl Host {
    /// The reachable wire endpoint, if the host has declared one.
    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint_ip
            .map(|ip| SocketAddr::new(ip, self.listen_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WgKeyPair;

    #[test]
    fn endpoint_combines_ip_and_listen_port() {
        let mut host = Host {
            id: HostId::generate(),
            name: "edge-1".into(),
            public_key: WgKeyPair::generate().public_key(),
            endpoint_ip: Some("203.0.113.7".parse().unwrap()),
            listen_port: 51821,
            persistent_keepalive: 20,
            os: Os::Linux,
            nodes: Vec::new(),
        };
        assert_eq!(host.endpoint().unwrap().to_string(), "203.0.113.7:51821");

        host.endpoint_ip = None;
        assert!(host.endpoint().is_none());
    }
}
