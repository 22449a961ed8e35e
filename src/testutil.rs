//! Shared fixtures for the in-crate test suites.

use crate::controller::{Controller, ServerConfig};
use crate::models::{Host, HostId, NetId, Network, Node, Os, WgKeyPair};
use crate::mq::RecordingBroker;
use crate::store::MemoryStore;
use std::sync::Arc;

pub(crate) fn test_controller() -> (Controller, Arc<RecordingBroker>) {
    let broker = Arc::new(RecordingBroker::new());
    let config = ServerConfig {
        server_id: "srv-1".into(),
        ..Default::default()
    };
    let controller = Controller::new(config, Arc::new(MemoryStore::new()), broker.clone());
    (controller, broker)
}

pub(crate) fn test_host(name: &str) -> Host {
    Host {
        id: HostId::generate(),
        name: name.to_owned(),
        public_key: WgKeyPair::generate().public_key(),
        endpoint_ip: Some("198.51.100.10".parse().unwrap()),
        listen_port: 51820,
        persistent_keepalive: 20,
        os: Os::Linux,
        nodes: Vec::new(),
    }
}

pub(crate) fn test_network(id: &str, cidr4: &str) -> Network {
    Network::new(NetId::new(id), Some(cidr4.parse().unwrap()), None)
}

/// A `10.0.0.0/24` network with one joined host whose node is promoted to
/// ingress gateway. Returns the refreshed host and the gateway node.
pub(crate) async fn network_with_ingress(
    controller: &Controller,
    net_id: &str,
) -> (NetId, Host, Node) {
    let network = test_network(net_id, "10.0.0.0/24");
    let net_id = network.net_id.clone();
    controller.inner.save_network(&network).await.unwrap();

    let host = test_host("gw-host");
    controller.inner.upsert_host(&host).await.unwrap();
    let mut node = controller
        .inner
        .join_host_to_network(&host.id, &net_id)
        .await
        .unwrap();
    node.is_ingress_gateway = true;
    controller.inner.upsert_node(&node).await.unwrap();

    let host = controller.inner.get_host(&host.id).await.unwrap();
    (net_id, host, node)
}
