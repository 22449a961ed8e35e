use crate::controller::{ControllerInner, Error};
use crate::models::{ExtClient, Host, HostUpdate, Metrics, NetId, Node, NodeAction, Os};
use crate::mq::{
    BATCH_SIZE, METRICS_EXPORTER_TOPIC, MQ_TIMEOUT, SERVER_STATUS_TOPIC, host_update_topic,
    node_update_topic, peer_update_topic,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error};

/// Snapshot of everything the retained `server/status` message tracks.
/// A new message goes out only when a field changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub db_connected: bool,
    pub broker_connected: bool,
    pub is_broker_conn_open: bool,
    pub license_error: String,
    pub is_pro: bool,
    pub trial_end_date: Option<DateTime<Utc>>,
    pub is_on_trial_license: bool,
    pub is_failover_existed: HashMap<NetId, bool>,
}

impl ControllerInner {
    /// QoS-0 publish with the hard per-call deadline.
    pub(crate) async fn publish(
        &self,
        topic: &str,
        data: Vec<u8>,
        retain: bool,
    ) -> Result<(), Error> {
        match tokio::time::timeout(MQ_TIMEOUT, self.broker.publish(topic, data, retain)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::PublishTimeout {
                topic: topic.to_owned(),
            }),
        }
    }

    /// Pushes a freshly derived peer update to every host, twenty at a
    /// time. Each batch is joined before the next starts; a failed host is
    /// logged and does not abort the batch.
    pub async fn publish_peer_update(&self, replace_peers: bool) -> Result<(), Error> {
        self.publish_peer_update_batches(None, Vec::new(), replace_peers, false)
            .await
    }

    /// Fan-out accounting for a node the inventory no longer holds.
    pub async fn publish_deleted_node_peer_update(
        &self,
        deleted_node: &Node,
    ) -> Result<(), Error> {
        self.publish_peer_update_batches(Some(deleted_node.clone()), Vec::new(), false, false)
            .await
    }

    /// Fan-out accounting for a deleted ext client. IoT hosts cannot
    /// reconcile client removals and are skipped.
    pub async fn publish_deleted_client_peer_update(
        &self,
        deleted_client: &ExtClient,
    ) -> Result<(), Error> {
        self.publish_peer_update_batches(None, vec![deleted_client.clone()], false, true)
            .await
    }

    async fn publish_peer_update_batches(
        &self,
        deleted_node: Option<Node>,
        deleted_clients: Vec<ExtClient>,
        replace_peers: bool,
        skip_iot: bool,
    ) -> Result<(), Error> {
        let hosts = self.get_all_hosts().await?;
        let all_nodes = Arc::new(self.get_all_nodes().await?);
        let deleted_node = Arc::new(deleted_node);
        let deleted_clients = Arc::new(deleted_clients);

        for batch in hosts.chunks(BATCH_SIZE) {
            let mut tasks = JoinSet::new();
            for host in batch {
                if skip_iot && host.os == Os::Iot {
                    continue;
                }
                let inner = self.arc();
                let host = host.clone();
                let all_nodes = all_nodes.clone();
                let deleted_node = deleted_node.clone();
                let deleted_clients = deleted_clients.clone();
                tasks.spawn(async move {
                    if let Err(e) = inner
                        .publish_single_host_peer_update(
                            &host,
                            &all_nodes,
                            deleted_node.as_ref().as_ref(),
                            &deleted_clients,
                            replace_peers,
                        )
                        .await
                    {
                        error!("failed to publish peer update to host {}: {}", host.id, e);
                    }
                });
            }
            while tasks.join_next().await.is_some() {}
        }
        Ok(())
    }

    pub async fn publish_single_host_peer_update(
        &self,
        host: &Host,
        all_nodes: &[Node],
        deleted_node: Option<&Node>,
        deleted_clients: &[ExtClient],
        replace_peers: bool,
    ) -> Result<(), Error> {
        let mut update = self
            .get_peer_update_for_host(host, all_nodes, deleted_node, deleted_clients)
            .await?;
        update.replace_peers = replace_peers;
        let data = serde_json::to_vec(&update)?;
        self.publish(
            &peer_update_topic(&host.id, &self.config.server_id),
            data,
            false,
        )
        .await
    }

    pub async fn node_update(&self, node: &Node) -> Result<(), Error> {
        // a node without a host has nobody listening
        if self.get_host(&node.host_id).await.is_err() {
            return Ok(());
        }
        debug!("publishing node update to {}", node.id);

        let data = serde_json::to_vec(node)?;
        if let Err(e) = self.publish(&node_update_topic(node), data, false).await {
            error!("error publishing node update to peer {}: {}", node.id, e);
            return Err(e);
        }
        Ok(())
    }

    pub async fn host_update(&self, host_update: &HostUpdate) -> Result<(), Error> {
        debug!("publishing host update to {}", host_update.host.id);

        let data = serde_json::to_vec(host_update)?;
        if let Err(e) = self
            .publish(
                &host_update_topic(&host_update.host.id, &self.config.server_id),
                data,
                false,
            )
            .await
        {
            error!(
                "error publishing host update to {}: {}",
                host_update.host.id, e
            );
            return Err(e);
        }
        Ok(())
    }

    /// Publishes the deleted-node peer update, optionally preceded by the
    /// node update carrying the delete action.
    pub async fn publish_mq_updates_for_deleted_node(
        &self,
        mut node: Node,
        send_node_update: bool,
    ) {
        node.pending_delete = true;
        node.action = NodeAction::Delete;
        if send_node_update {
            if let Err(e) = self.node_update(&node).await {
                error!("error publishing node update to node {}: {}", node.id, e);
            }
        }
        if let Err(e) = self.publish_deleted_node_peer_update(&node).await {
            error!("error publishing peer update: {}", e);
        }
    }

    /// Emits the retained server-status message when any tracked field
    /// moved since the last successful publish.
    pub async fn server_status_update(&self) -> Result<(), Error> {
        let mut failover_existed = HashMap::new();
        if self.config.is_pro {
            if let Ok(networks) = self.get_networks().await {
                for network in networks {
                    let exists = self
                        .get_network_nodes(&network.net_id)
                        .await
                        .map(|nodes| nodes.iter().any(|n| n.is_fail_over))
                        .unwrap_or(false);
                    failover_existed.insert(network.net_id, exists);
                }
            }
        }

        let current = ServerStatus {
            db_connected: self.store.is_connected(),
            broker_connected: self.broker.is_connected(),
            is_broker_conn_open: self.broker.is_connection_open(),
            license_error: self.config.license_error.clone(),
            is_pro: self.config.is_pro,
            trial_end_date: self.config.trial_end_date,
            is_on_trial_license: self.config.is_on_trial_license,
            is_failover_existed: failover_existed,
        };

        {
            let cache = self.status_cache.lock().await;
            if *cache == current {
                return Ok(());
            }
        }

        let data = serde_json::to_vec(&current)?;
        self.publish(SERVER_STATUS_TOPIC, data, true).await?;
        *self.status_cache.lock().await = current;
        Ok(())
    }

    pub async fn push_metrics_to_exporter(&self, metrics: &Metrics) -> Result<(), Error> {
        debug!("pushing metrics to exporter");
        let data = serde_json::to_vec(metrics)?;
        self.publish(METRICS_EXPORTER_TOPIC, data, true).await
    }
}
