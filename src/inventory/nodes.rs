use crate::controller::{ControllerInner, Error};
use crate::models::{HostId, NetId, Node, NodeAction, NodeId, PeerAddr};
use crate::store::NODES_TABLE;
use chrono::Utc;
use std::net::IpAddr;
use tracing::warn;

impl ControllerInner {
    pub async fn get_all_nodes(&self) -> Result<Vec<Node>, Error> {
        if self.config.cache_enabled {
            let cached: Vec<Node> = self
                .caches
                .nodes
                .read()
                .expect("node cache poisoned")
                .values()
                .cloned()
                .collect();
            if !cached.is_empty() {
                return Ok(cached);
            }
        }

        let records = match self.store.fetch_records(NODES_TABLE).await {
            Ok(records) => records,
            Err(e) if e.is_empty_record() => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut nodes = Vec::with_capacity(records.len());
        for (key, value) in records {
            let node: Node = match serde_json::from_slice(&value) {
                Ok(node) => node,
                Err(e) => {
                    warn!("Skipping undecodable node record {}: {}", key, e);
                    continue;
                }
            };
            self.store_node_in_cache(&node);
            nodes.push(node);
        }
        Ok(nodes)
    }

    pub async fn get_network_nodes(&self, network: &NetId) -> Result<Vec<Node>, Error> {
        Ok(self
            .get_all_nodes()
            .await?
            .into_iter()
            .filter(|n| &n.network == network)
            .collect())
    }

    pub async fn get_node_by_id(&self, id: &NodeId) -> Result<Node, Error> {
        if self.config.cache_enabled {
            let cache = self.caches.nodes.read().expect("node cache poisoned");
            if let Some(node) = cache.get(id) {
                return Ok(node.clone());
            }
        }

        let data = self
            .store
            .fetch_record(NODES_TABLE, &id.to_string())
            .await
            .map_err(|e| {
                if e.is_empty_record() {
                    Error::NotFound(format!("node {id}"))
                } else {
                    e.into()
                }
            })?;
        let node: Node = serde_json::from_slice(&data)?;
        self.store_node_in_cache(&node);
        Ok(node)
    }

    pub async fn upsert_node(&self, node: &Node) -> Result<(), Error> {
        let data = serde_json::to_vec(node)?;
        self.store
            .insert(NODES_TABLE, &node.id.to_string(), data)
            .await?;
        self.store_node_in_cache(node);
        Ok(())
    }

    /// Creates the node representing a host's membership in a network,
    /// allocating addresses under the allocator mutex, and registers the
    /// node with its host.
    pub async fn join_host_to_network(
        &self,
        host_id: &HostId,
        net_id: &NetId,
    ) -> Result<Node, Error> {
        let mut host = self.get_host(host_id).await?;
        let network = self.get_network(net_id).await?;

        let mut node = Node {
            id: NodeId::generate(),
            host_id: host.id,
            network: net_id.clone(),
            address: None,
            address6: None,
            is_egress_gateway: false,
            egress_gateway_ranges: Vec::new(),
            is_ingress_gateway: false,
            is_internet_gateway: false,
            internet_gw_node_id: None,
            is_fail_over: false,
            pending_delete: false,
            last_check_in: Utc::now().timestamp(),
            action: NodeAction::NoOp,
        };

        {
            let mut map = self.alloc.lock().await;
            if network.is_ipv4 {
                node.address = Some(self.unique_address_locked(&mut map, net_id, true).await?);
            }
            if network.is_ipv6 {
                node.address6 = Some(self.unique_address6_locked(&mut map, net_id, true).await?);
            }
            self.upsert_node(&node).await?;
        }

        host.nodes.push(node.id);
        self.upsert_host(&host).await?;
        self.set_network_nodes_last_modified(net_id).await?;
        Ok(node)
    }

    /// Marks the node for removal without touching addresses; the caller
    /// follows up with the deleted-node publications.
    pub async fn mark_node_pending_delete(&self, node: &Node) -> Result<Node, Error> {
        let mut node = node.clone();
        node.pending_delete = true;
        node.action = NodeAction::Delete;
        self.upsert_node(&node).await?;
        Ok(node)
    }

    /// Hard delete: removes the record, releases both addresses, strips
    /// ACL mentions, and detaches the node from its host.
    pub async fn delete_node(&self, node: &Node) -> Result<(), Error> {
        self.store
            .delete_record(NODES_TABLE, &node.id.to_string())
            .await?;
        if self.config.cache_enabled {
            self.caches
                .nodes
                .write()
                .expect("node cache poisoned")
                .remove(&node.id);
        }

        if let Some(a) = node.address {
            self.remove_ip_from_allocated_ip_map(&node.network, IpAddr::V4(a))
                .await;
        }
        if let Some(a) = node.address6 {
            self.remove_ip_from_allocated_ip_map(&node.network, IpAddr::V6(a))
                .await;
        }

        if let Err(e) = self.remove_acl_entity(&node.network, &node.acl_id()).await {
            warn!("Failed to clean ACLs for deleted node {}: {}", node.id, e);
        }

        if let Ok(mut host) = self.get_host(&node.host_id).await {
            host.nodes.retain(|id| *id != node.id);
            self.upsert_host(&host).await?;
        }

        self.set_network_nodes_last_modified(&node.network).await
    }

    /// Reassigns every node's IPv4 address after a network range change.
    /// The allocator mutex is held for the whole sweep so concurrent
    /// creations cannot interleave.
    pub async fn update_network_node_addresses(&self, network: &NetId) -> Result<(), Error> {
        let mut map = self.alloc.lock().await;
        let mut nodes = self.get_network_nodes(network).await?;
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        map.drop_network(network);
        for node in &mut nodes {
            node.address = None;
            self.upsert_node(node).await?;
        }
        for node in &mut nodes {
            node.address = Some(self.unique_address_locked(&mut map, network, true).await?);
            self.upsert_node(node).await?;
        }
        drop(map);
        self.set_network_nodes_last_modified(network).await
    }

    /// IPv6 counterpart of `update_network_node_addresses`.
    pub async fn update_network_node_addresses6(&self, network: &NetId) -> Result<(), Error> {
        let mut map = self.alloc.lock().await;
        let mut nodes = self.get_network_nodes(network).await?;
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        map.drop_network(network);
        for node in &mut nodes {
            node.address6 = None;
            self.upsert_node(node).await?;
        }
        for node in &mut nodes {
            node.address6 = Some(self.unique_address6_locked(&mut map, network, true).await?);
            self.upsert_node(node).await?;
        }
        drop(map);
        self.set_network_nodes_last_modified(network).await
    }

    fn store_node_in_cache(&self, node: &Node) {
        if self.config.cache_enabled {
            self.caches
                .nodes
                .write()
                .expect("node cache poisoned")
                .insert(node.id, node.clone());
        }
    }
}
