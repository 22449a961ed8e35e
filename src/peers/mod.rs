mod fw;

use crate::controller::{ControllerInner, Error};
use crate::models::{
    EgressNetworkRoute, ExtClient, Host, IdAndAddr, Node, Peer, PeerAddr, PeerConfig, PeerUpdate,
    WgPublicKey,
};
use ipnet::IpNet;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::warn;

impl ControllerInner {
    /// Computes the exact peer list one host should install, given a
    /// snapshot of the full node inventory. `deleted_node` and
    /// `deleted_clients` are negative deltas: they are dropped from the
    /// computed set and re-emitted as removal hints so receivers can
    /// reconcile incrementally.
    pub async fn get_peer_update_for_host(
        &self,
        host: &Host,
        all_nodes: &[Node],
        deleted_node: Option<&Node>,
        deleted_clients: &[ExtClient],
    ) -> Result<PeerUpdate, Error> {
        let mut update = PeerUpdate {
            server: self.config.server_id.clone(),
            host_id: host.id,
            peers: Vec::new(),
            peer_ids: Vec::new(),
            egress_routes: Vec::new(),
            is_ingress_gateway: false,
            fw_rules: Vec::new(),
            replace_peers: false,
        };
        // one entry per WireGuard key; a host peered over several networks
        // merges its allowed-IPs into a single config
        let mut by_key: HashMap<WgPublicKey, usize> = HashMap::new();

        let mut host_nodes: Vec<&Node> =
            all_nodes.iter().filter(|n| n.host_id == host.id).collect();
        host_nodes.sort_by(|a, b| a.id.cmp(&b.id));
        let mut sorted_nodes: Vec<&Node> = all_nodes.iter().collect();
        sorted_nodes.sort_by(|a, b| a.id.cmp(&b.id));

        for node in &host_nodes {
            let network = self.get_network(&node.network).await?;

            for other in &sorted_nodes {
                if other.network != node.network
                    || other.id == node.id
                    || other.host_id == host.id
                    || other.pending_delete
                {
                    continue;
                }

                let (allowed, _) = self
                    .is_node_allowed_to_communicate(
                        &Peer::Device((*node).clone()),
                        &Peer::Device((*other).clone()),
                        true,
                    )
                    .await?;
                if !allowed {
                    continue;
                }

                let peer_host = match self.get_host(&other.host_id).await {
                    Ok(peer_host) => peer_host,
                    Err(e) => {
                        warn!("Skipping peer {} without host: {}", other.id, e);
                        continue;
                    }
                };

                let mut allowed_ips: Vec<IpNet> = Vec::new();
                if let Some(addr) = other.address_ipnet4() {
                    allowed_ips.push(addr);
                }
                if let Some(addr) = other.address_ipnet6() {
                    allowed_ips.push(addr);
                }

                if other.is_egress_gateway {
                    for range in &other.egress_gateway_ranges {
                        if egress_range_conflicts(range, node) {
                            continue;
                        }
                        allowed_ips.push(*range);
                    }
                    update.egress_routes.push(EgressNetworkRoute {
                        egress_gw_addr: other.address_ipnet4(),
                        egress_gw_addr6: other.address_ipnet6(),
                        node_addr: node.address_ipnet4(),
                        node_addr6: node.address_ipnet6(),
                        egress_ranges: other.egress_gateway_ranges.clone(),
                    });
                }

                if other.is_ingress_gateway {
                    // the ingress carries its anchored clients' addresses
                    // for every host that is not the ingress itself
                    let mut gw_clients =
                        self.get_gw_ext_clients(&other.id, &node.network).await?;
                    gw_clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
                    for client in gw_clients.iter().filter(|c| c.enabled) {
                        if let Some(addr) = client.addr4_net() {
                            allowed_ips.push(addr);
                        }
                        if let Some(addr) = client.addr6_net() {
                            allowed_ips.push(addr);
                        }
                        allowed_ips.extend(client.extra_allowed_ips.iter().copied());
                    }
                }

                if other.is_internet_gateway && node.internet_gw_node_id == Some(other.id) {
                    allowed_ips = vec!["0.0.0.0/0".parse().expect("default route")];
                    if network.is_ipv6 {
                        allowed_ips.push("::/0".parse().expect("default route"));
                    }
                }

                match by_key.get(&peer_host.public_key) {
                    Some(&idx) => {
                        let existing = &mut update.peers[idx];
                        for ip in allowed_ips {
                            if !existing.allowed_ips.contains(&ip) {
                                existing.allowed_ips.push(ip);
                            }
                        }
                    }
                    None => {
                        by_key.insert(peer_host.public_key, update.peers.len());
                        update.peers.push(PeerConfig {
                            public_key: peer_host.public_key,
                            allowed_ips,
                            endpoint: peer_host.endpoint(),
                            persistent_keepalive: match peer_host.persistent_keepalive {
                                0 => None,
                                interval => Some(interval),
                            },
                            remove: false,
                        });
                    }
                }
                update.peer_ids.push(IdAndAddr {
                    id: other.id.to_string(),
                    name: peer_host.name.clone(),
                    address: primary_addr(*other),
                    is_ext_client: false,
                });
            }

            if node.is_ingress_gateway {
                update.is_ingress_gateway = true;
                self.append_ext_peers(node, host, &mut update, &mut by_key)
                    .await?;
                let rules = self.get_fw_rules_on_ingress_gateway(node).await?;
                update.fw_rules.extend(rules);
            }
        }

        if let Some(deleted) = deleted_node {
            if deleted.host_id != host.id {
                match self.get_host(&deleted.host_id).await {
                    Ok(deleted_host) => {
                        remove_peer(&mut update, &mut by_key, deleted_host.public_key);
                        update
                            .peer_ids
                            .retain(|entry| entry.id != deleted.id.to_string());
                    }
                    Err(e) => warn!("Deleted node {} has no host: {}", deleted.id, e),
                }
            }
        }
        for client in deleted_clients {
            remove_peer(&mut update, &mut by_key, client.public_key);
            update
                .peer_ids
                .retain(|entry| entry.id != client.public_key.to_string());
        }

        Ok(update)
    }

    /// Emits one peer entry per enabled ext-client anchored on the given
    /// ingress node, filtered through the deny list and the policy engine.
    /// Clients are visited in client-id order so repeated computations
    /// are byte-identical.
    async fn append_ext_peers(
        &self,
        node: &Node,
        host: &Host,
        update: &mut PeerUpdate,
        by_key: &mut HashMap<WgPublicKey, usize>,
    ) -> Result<(), Error> {
        let mut clients = self.get_network_ext_clients(&node.network).await?;
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));

        let gateway = Peer::Device(node.clone());
        for client in clients {
            if !client.allows_peer(&node.acl_id()) {
                continue;
            }
            if client.is_user_client() {
                let (ok, _) = self
                    .is_user_allowed_to_communicate(&client.owner_id, &gateway)
                    .await?;
                if !ok {
                    continue;
                }
            } else if !self.is_peer_allowed(&client.to_peer(), &gateway, true).await? {
                continue;
            }

            if host.public_key == client.public_key
                || client.ingress_gateway_id != node.id
                || !client.enabled
            {
                continue;
            }

            let mut allowed_ips: Vec<IpNet> = Vec::new();
            if let Some(addr) = client.addr4_net() {
                allowed_ips.push(addr);
            }
            if let Some(addr) = client.addr6_net() {
                allowed_ips.push(addr);
            }
            allowed_ips.extend(client.extra_allowed_ips.iter().copied());

            update.egress_routes.push(EgressNetworkRoute {
                egress_gw_addr: client.addr4_net(),
                egress_gw_addr6: client.addr6_net(),
                node_addr: node.address_ipnet4(),
                node_addr6: node.address_ipnet6(),
                egress_ranges: client.extra_allowed_ips.clone(),
            });

            if by_key.contains_key(&client.public_key) {
                continue;
            }
            by_key.insert(client.public_key, update.peers.len());
            update.peers.push(PeerConfig {
                public_key: client.public_key,
                allowed_ips,
                endpoint: None,
                persistent_keepalive: None,
                remove: false,
            });
            update.peer_ids.push(IdAndAddr {
                id: client.public_key.to_string(),
                name: client.client_id.clone(),
                address: primary_addr(&client),
                is_ext_client: true,
            });
        }
        Ok(())
    }
}

/// A gateway's announced range must not swallow the target's own address.
fn egress_range_conflicts(range: &IpNet, node: &Node) -> bool {
    if let Some(addr) = node.address {
        if range.contains(&IpAddr::V4(addr)) {
            return true;
        }
    }
    if let Some(addr) = node.address6 {
        if range.contains(&IpAddr::V6(addr)) {
            return true;
        }
    }
    false
}

fn remove_peer(
    update: &mut PeerUpdate,
    by_key: &mut HashMap<WgPublicKey, usize>,
    key: WgPublicKey,
) {
    if by_key.remove(&key).is_some() {
        update.peers.retain(|p| p.public_key != key);
        // indices shifted; rebuild
        by_key.clear();
        for (idx, peer) in update.peers.iter().enumerate() {
            by_key.insert(peer.public_key, idx);
        }
    }
    update.peers.push(PeerConfig {
        public_key: key,
        allowed_ips: Vec::new(),
        endpoint: None,
        persistent_keepalive: None,
        remove: true,
    });
}

fn primary_addr(peer: &dyn PeerAddr) -> String {
    peer.addr4()
        .map(|a| a.to_string())
        .or_else(|| peer.addr6().map(|a| a.to_string()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Controller;
    use crate::models::CustomExtClient;
    use crate::testutil::{network_with_ingress, test_controller, test_host};

    fn enabled_custom(client_id: &str) -> CustomExtClient {
        CustomExtClient {
            client_id: client_id.to_owned(),
            enabled: true,
            ..Default::default()
        }
    }

    async fn update_for(controller: &Controller, host: &Host) -> PeerUpdate {
        let all_nodes = controller.inner.get_all_nodes().await.unwrap();
        controller
            .inner
            .get_peer_update_for_host(host, &all_nodes, None, &[])
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn new_ext_client_appears_with_host_route() {
        let (controller, _) = test_controller();
        let (net, host, gw) = network_with_ingress(&controller, "n1").await;

        let client = controller
            .inner
            .create_ext_client(net, gw.id, String::new(), enabled_custom("c1"))
            .await
            .unwrap();
        assert_eq!(client.address.unwrap().to_string(), "10.0.0.2");

        let update = update_for(&controller, &host).await;
        assert!(update.is_ingress_gateway);

        let entry = update
            .peers
            .iter()
            .find(|p| p.public_key == client.public_key)
            .expect("client peer entry");
        assert!(entry
            .allowed_ips
            .contains(&"10.0.0.2/32".parse().unwrap()));
        assert!(!entry.remove);

        let id_entry = update
            .peer_ids
            .iter()
            .find(|e| e.name == "c1")
            .expect("client id entry");
        assert!(id_entry.is_ext_client);
        assert_eq!(id_entry.address, "10.0.0.2");
    }

    #[tokio::test]
    async fn disabled_client_is_omitted() {
        let (controller, _) = test_controller();
        let (net, host, gw) = network_with_ingress(&controller, "n1").await;
        let client = controller
            .inner
            .create_ext_client(net, gw.id, String::new(), enabled_custom("c1"))
            .await
            .unwrap();

        controller
            .inner
            .toggle_ext_client_connectivity(&client, false)
            .await
            .unwrap();

        let update = update_for(&controller, &host).await;
        assert!(update
            .peers
            .iter()
            .all(|p| p.public_key != client.public_key));
    }

    #[tokio::test]
    async fn deleted_client_turns_into_remove_entry() {
        let (controller, _) = test_controller();
        let (net, host, gw) = network_with_ingress(&controller, "n1").await;
        let client = controller
            .inner
            .create_ext_client(net, gw.id, String::new(), enabled_custom("c1"))
            .await
            .unwrap();
        controller
            .inner
            .delete_ext_client_and_cleanup(&client)
            .await
            .unwrap();

        let all_nodes = controller.inner.get_all_nodes().await.unwrap();
        let update = controller
            .inner
            .get_peer_update_for_host(&host, &all_nodes, None, std::slice::from_ref(&client))
            .await
            .unwrap();

        let entry = update
            .peers
            .iter()
            .find(|p| p.public_key == client.public_key)
            .expect("removal hint");
        assert!(entry.remove);
        assert!(entry.allowed_ips.is_empty());
    }

    #[tokio::test]
    async fn node_peers_carry_addresses_and_endpoint() {
        let (controller, _) = test_controller();
        let (net, host, _gw) = network_with_ingress(&controller, "n1").await;

        let other = test_host("h2");
        controller.inner.upsert_host(&other).await.unwrap();
        let other_node = controller
            .inner
            .join_host_to_network(&other.id, &net)
            .await
            .unwrap();

        let update = update_for(&controller, &host).await;
        let entry = update
            .peers
            .iter()
            .find(|p| p.public_key == other.public_key)
            .expect("node peer entry");
        assert!(entry
            .allowed_ips
            .contains(&other_node.address_ipnet4().unwrap()));
        assert_eq!(entry.endpoint, other.endpoint());
        assert_eq!(entry.persistent_keepalive, Some(20));
    }

    #[tokio::test]
    async fn repeated_computation_is_byte_identical() {
        let (controller, _) = test_controller();
        let (net, host, gw) = network_with_ingress(&controller, "n1").await;
        for id in ["beta", "alpha", "gamma"] {
            controller
                .inner
                .create_ext_client(net.clone(), gw.id, String::new(), enabled_custom(id))
                .await
                .unwrap();
        }

        let first = serde_json::to_vec(&update_for(&controller, &host).await).unwrap();
        // a no-op read in between must not disturb the output
        controller.inner.get_all_nodes().await.unwrap();
        let second = serde_json::to_vec(&update_for(&controller, &host).await).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn internet_gateway_replaces_allowed_ips_for_selected_nodes() {
        let (controller, _) = test_controller();
        let (net, host, node) = network_with_ingress(&controller, "n1").await;

        let gw_host = test_host("inet-gw");
        controller.inner.upsert_host(&gw_host).await.unwrap();
        let mut gw_node = controller
            .inner
            .join_host_to_network(&gw_host.id, &net)
            .await
            .unwrap();
        gw_node.is_internet_gateway = true;
        controller.inner.upsert_node(&gw_node).await.unwrap();

        let mut node = node;
        node.internet_gw_node_id = Some(gw_node.id);
        controller.inner.upsert_node(&node).await.unwrap();

        let update = update_for(&controller, &host).await;
        let entry = update
            .peers
            .iter()
            .find(|p| p.public_key == gw_host.public_key)
            .expect("gateway peer entry");
        assert_eq!(entry.allowed_ips, vec!["0.0.0.0/0".parse::<IpNet>().unwrap()]);
    }

    #[tokio::test]
    async fn conflicting_egress_range_is_skipped() {
        let (controller, _) = test_controller();
        let (net, host, _node) = network_with_ingress(&controller, "n1").await;

        let egress_host = test_host("egress");
        controller.inner.upsert_host(&egress_host).await.unwrap();
        let mut egress_node = controller
            .inner
            .join_host_to_network(&egress_host.id, &net)
            .await
            .unwrap();
        egress_node.is_egress_gateway = true;
        egress_node.egress_gateway_ranges = vec![
            // swallows the target's own 10.0.0.1
            "10.0.0.0/24".parse().unwrap(),
            "192.168.50.0/24".parse().unwrap(),
        ];
        controller.inner.upsert_node(&egress_node).await.unwrap();

        let update = update_for(&controller, &host).await;
        let entry = update
            .peers
            .iter()
            .find(|p| p.public_key == egress_host.public_key)
            .expect("egress peer entry");
        assert!(!entry.allowed_ips.contains(&"10.0.0.0/24".parse().unwrap()));
        assert!(entry
            .allowed_ips
            .contains(&"192.168.50.0/24".parse().unwrap()));
        assert_eq!(update.egress_routes.len(), 1);
    }

    #[tokio::test]
    async fn client_deny_list_blocks_its_gateway_entry() {
        let (controller, _) = test_controller();
        let (net, host, gw) = network_with_ingress(&controller, "n1").await;

        let mut custom = enabled_custom("denier");
        custom.denied_acls = Some([gw.acl_id()].into_iter().collect());
        let client = controller
            .inner
            .create_ext_client(net, gw.id, String::new(), custom)
            .await
            .unwrap();

        let update = update_for(&controller, &host).await;
        assert!(update
            .peers
            .iter()
            .all(|p| p.public_key != client.public_key));
    }
}
