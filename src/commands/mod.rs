//! The stable verbs external collaborators (HTTP handlers, CLI, GUI)
//! invoke. Every verb validates its input, mutates the inventory, then
//! triggers the publisher; broker failures are logged per target and
//! never fail the enclosing command.

use crate::acls::AclContainer;
use crate::controller::{Controller, Error};
use crate::models::{
    AccessKey, CustomExtClient, ExtClient, Host, HostId, HostMgmtAction, HostUpdate, NetId,
    Network, Node, NodeId, WgPublicKey,
};
use chrono::Utc;
use tracing::{error, info, warn};

const MAX_NET_ID_LEN: usize = 32;
const MAX_CLIENT_ID_LEN: usize = 15;

fn valid_name(name: &str, max_len: usize) -> bool {
    !name.is_empty()
        && name.len() <= max_len
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

impl Controller {
    // == networks ==

    pub async fn create_network(
        &self,
        operator: &str,
        mut network: Network,
    ) -> Result<Network, Error> {
        if !valid_name(network.net_id.as_str(), MAX_NET_ID_LEN) {
            return Err(Error::BadRequest(format!(
                "illegal network name {}",
                network.net_id
            )));
        }
        if network.address_range.is_none() && network.address_range6.is_none() {
            return Err(Error::BadRequest("IPv4 or IPv6 CIDR required".into()));
        }
        if self.inner.get_network(&network.net_id).await.is_ok() {
            return Err(Error::BadRequest(format!(
                "network {} already exists",
                network.net_id
            )));
        }

        network.is_ipv4 = network.address_range.is_some();
        network.is_ipv6 = network.address_range6.is_some();
        let now = Utc::now().timestamp();
        network.nodes_last_modified = now;
        network.key_update_timestamp = now;

        self.inner.save_network(&network).await?;
        info!("{} created network {}", operator, network.net_id);
        Ok(network)
    }

    /// Applies an updated network record. A changed address range
    /// triggers re-addressing of every member node; range and
    /// hole-punching changes push node updates plus a fresh peer graph.
    pub async fn update_network(
        &self,
        operator: &str,
        net_id: &NetId,
        new: Network,
    ) -> Result<Network, Error> {
        let current = self.inner.get_network(net_id).await?;
        if new.net_id != current.net_id {
            return Err(Error::BadRequest("network name cannot change".into()));
        }

        let range4_changed = new.address_range != current.address_range;
        let range6_changed = new.address_range6 != current.address_range6;
        let holepunch_changed = new.default_udp_hole_punch != current.default_udp_hole_punch;

        let mut updated = current.clone();
        updated.address_range = new.address_range;
        updated.address_range6 = new.address_range6;
        updated.is_ipv4 = new.address_range.is_some();
        updated.is_ipv6 = new.address_range6.is_some();
        updated.default_udp_hole_punch = new.default_udp_hole_punch;
        updated.default_user_policy = new.default_user_policy;
        updated.default_device_policy = new.default_device_policy;
        self.inner.save_network(&updated).await?;

        if range4_changed && updated.is_ipv4 {
            self.inner.update_network_node_addresses(net_id).await?;
        }
        if range6_changed && updated.is_ipv6 {
            self.inner.update_network_node_addresses6(net_id).await?;
        }
        if range4_changed || range6_changed || holepunch_changed {
            for node in self.inner.get_network_nodes(net_id).await? {
                if let Err(e) = self.inner.node_update(&node).await {
                    warn!("failed to send update to node {}: {}", node.id, e);
                }
            }
            if let Err(e) = self.inner.publish_peer_update(true).await {
                error!("failed to publish peer update after network change: {}", e);
            }
        }

        info!("{} updated network {}", operator, net_id);
        Ok(updated)
    }

    /// Deletion is refused while any node still belongs to the network.
    pub async fn delete_network(&self, operator: &str, net_id: &NetId) -> Result<(), Error> {
        let nodes = self.inner.get_network_nodes(net_id).await?;
        if !nodes.is_empty() {
            return Err(Error::Forbidden(format!(
                "node check failed: network {net_id} still has {} node(s)",
                nodes.len()
            )));
        }

        self.inner
            .store
            .delete_record(crate::store::ACLS_TABLE, net_id.as_str())
            .await?;
        self.inner.delete_network_record(net_id).await?;
        info!("{} deleted network {}", operator, net_id);
        Ok(())
    }

    pub async fn get_network(&self, net_id: &NetId) -> Result<Network, Error> {
        self.inner.get_network(net_id).await
    }

    pub async fn get_networks(&self) -> Result<Vec<Network>, Error> {
        self.inner.get_networks().await
    }

    // == access keys ==

    pub async fn create_access_key(
        &self,
        operator: &str,
        net_id: &NetId,
        key: AccessKey,
    ) -> Result<AccessKey, Error> {
        let key = self.inner.create_access_key(net_id, key).await?;
        info!("{} created access key {} on {}", operator, key.name, net_id);
        Ok(key)
    }

    pub async fn get_keys(&self, net_id: &NetId) -> Result<Vec<AccessKey>, Error> {
        self.inner.get_keys(net_id).await
    }

    pub async fn delete_key(
        &self,
        operator: &str,
        key_name: &str,
        net_id: &NetId,
    ) -> Result<(), Error> {
        self.inner.delete_key(key_name, net_id).await?;
        info!("{} deleted access key {} on {}", operator, key_name, net_id);
        Ok(())
    }

    /// Stamps the network's key-update timestamp and notifies every
    /// member node.
    pub async fn key_update(&self, operator: &str, net_id: &NetId) -> Result<Network, Error> {
        let network = self.inner.key_update(net_id).await?;
        for node in self.inner.get_network_nodes(net_id).await? {
            if let Err(e) = self.inner.node_update(&node).await {
                warn!(
                    "failed to send update to node during key update {}: {}",
                    node.id, e
                );
            }
        }
        info!("{} updated key on network {}", operator, net_id);
        Ok(network)
    }

    // == ACLs ==

    pub async fn get_network_acl(&self, net_id: &NetId) -> Result<AclContainer, Error> {
        // ensure the network exists so an unknown id is NotFound, not an
        // empty matrix
        self.inner.get_network(net_id).await?;
        self.inner.get_network_acls(net_id).await
    }

    pub async fn update_network_acl(
        &self,
        operator: &str,
        net_id: &NetId,
        acls: AclContainer,
    ) -> Result<AclContainer, Error> {
        self.inner.get_network(net_id).await?;
        self.inner.save_network_acls(net_id, &acls).await?;
        info!("{} updated ACLs for network {}", operator, net_id);

        if let Err(e) = self.inner.publish_peer_update(false).await {
            error!(
                "failed to publish peer update after ACL update on {}: {}",
                net_id, e
            );
        }
        Ok(acls)
    }

    // == ext clients ==

    pub async fn create_ext_client(
        &self,
        operator: &str,
        net_id: &NetId,
        gateway: &NodeId,
        custom: CustomExtClient,
    ) -> Result<ExtClient, Error> {
        if !custom.client_id.is_empty() && !valid_name(&custom.client_id, MAX_CLIENT_ID_LEN) {
            return Err(Error::BadRequest(format!(
                "illegal client id {}",
                custom.client_id
            )));
        }
        let gw_node = self.inner.get_node_by_id(gateway).await?;
        if &gw_node.network != net_id || !gw_node.is_ingress_gateway {
            return Err(Error::BadRequest(format!(
                "node {gateway} is not an ingress gateway on {net_id}"
            )));
        }

        let client = self
            .inner
            .create_ext_client(net_id.clone(), *gateway, operator.to_owned(), custom)
            .await?;
        info!(
            "{} created ext client {} on {}",
            operator, client.client_id, net_id
        );

        if let Err(e) = self.inner.publish_peer_update(false).await {
            error!("failed to publish peer update for new ext client: {}", e);
        }
        Ok(client)
    }

    /// Update is delete-then-save so the record key tracks the client id
    /// even when the id itself changes.
    pub async fn update_ext_client(
        &self,
        operator: &str,
        net_id: &NetId,
        client_id: &str,
        custom: CustomExtClient,
    ) -> Result<ExtClient, Error> {
        let old = self.inner.get_ext_client(client_id, net_id).await?;

        if custom.client_id != old.client_id {
            if !valid_name(&custom.client_id, MAX_CLIENT_ID_LEN) {
                return Err(Error::BadRequest(format!(
                    "illegal client id {}",
                    custom.client_id
                )));
            }
            if self.inner.get_ext_client(&custom.client_id, net_id).await.is_ok() {
                return Err(Error::BadRequest(format!(
                    "ext client {} already exists on {}",
                    custom.client_id, net_id
                )));
            }
        }

        let new = crate::inventory::update_ext_client_fields(&old, &custom);
        self.inner.remove_ext_client_record(net_id, client_id).await?;
        self.inner.save_ext_client(&new).await?;
        info!("{} updated ext client {} on {}", operator, new.client_id, net_id);

        if let Err(e) = self.inner.publish_peer_update(false).await {
            error!("failed to publish peer update for ext client update: {}", e);
        }
        Ok(new)
    }

    pub async fn toggle_ext_client_connectivity(
        &self,
        operator: &str,
        net_id: &NetId,
        client_id: &str,
        enable: bool,
    ) -> Result<ExtClient, Error> {
        let old = self.inner.get_ext_client(client_id, net_id).await?;
        let new = self
            .inner
            .toggle_ext_client_connectivity(&old, enable)
            .await?;
        info!(
            "{} set ext client {} on {} enabled={}",
            operator, client_id, net_id, enable
        );

        let publish_result = if enable {
            self.inner.publish_peer_update(false).await
        } else {
            self.inner.publish_deleted_client_peer_update(&old).await
        };
        if let Err(e) = publish_result {
            error!("failed to publish peer update after toggle: {}", e);
        }
        Ok(new)
    }

    /// Removes the client; ACL cleanup runs asynchronously. Use
    /// `delete_ext_client_and_cleanup` when the matrix must be clean on
    /// return.
    pub async fn delete_ext_client(
        &self,
        operator: &str,
        net_id: &NetId,
        client_id: &str,
    ) -> Result<(), Error> {
        let client = self.inner.delete_ext_client(net_id, client_id).await?;
        info!("{} deleted ext client {} on {}", operator, client_id, net_id);

        if let Err(e) = self.inner.publish_deleted_client_peer_update(&client).await {
            error!("failed to publish deleted client update: {}", e);
        }
        Ok(())
    }

    pub async fn delete_ext_client_and_cleanup(
        &self,
        operator: &str,
        client: &ExtClient,
    ) -> Result<(), Error> {
        self.inner.delete_ext_client_and_cleanup(client).await?;
        info!(
            "{} deleted ext client {} on {} with ACL cleanup",
            operator, client.client_id, client.network
        );

        if let Err(e) = self.inner.publish_deleted_client_peer_update(client).await {
            error!("failed to publish deleted client update: {}", e);
        }
        Ok(())
    }

    pub async fn get_network_ext_clients(&self, net_id: &NetId) -> Result<Vec<ExtClient>, Error> {
        self.inner.get_network_ext_clients(net_id).await
    }

    pub async fn get_ext_client(
        &self,
        client_id: &str,
        net_id: &NetId,
    ) -> Result<ExtClient, Error> {
        self.inner.get_ext_client(client_id, net_id).await
    }

    pub async fn get_ext_client_by_pub_key(
        &self,
        public_key: &WgPublicKey,
        net_id: &NetId,
    ) -> Result<ExtClient, Error> {
        self.inner.get_ext_client_by_pub_key(public_key, net_id).await
    }

    pub async fn get_gw_ext_clients(
        &self,
        gateway: &NodeId,
        net_id: &NetId,
    ) -> Result<Vec<ExtClient>, Error> {
        self.inner.get_gw_ext_clients(gateway, net_id).await
    }

    // == hosts and nodes ==

    pub async fn upsert_host(&self, host: &Host) -> Result<(), Error> {
        self.inner.upsert_host(host).await
    }

    pub async fn get_host(&self, id: &HostId) -> Result<Host, Error> {
        self.inner.get_host(id).await
    }

    pub async fn get_all_hosts(&self) -> Result<Vec<Host>, Error> {
        self.inner.get_all_hosts().await
    }

    pub async fn remove_host(&self, operator: &str, host: &Host) -> Result<(), Error> {
        self.inner.remove_host(host).await?;
        info!("{} removed host {}", operator, host.id);
        Ok(())
    }

    pub async fn join_host_to_network(
        &self,
        operator: &str,
        host_id: &HostId,
        net_id: &NetId,
    ) -> Result<Node, Error> {
        let node = self.inner.join_host_to_network(host_id, net_id).await?;
        info!(
            "{} joined host {} to network {} as node {}",
            operator, host_id, net_id, node.id
        );

        let host = self.inner.get_host(host_id).await?;
        let update = HostUpdate {
            action: HostMgmtAction::JoinHostToNetwork,
            host,
            node: Some(node.clone()),
        };
        if let Err(e) = self.inner.host_update(&update).await {
            error!("failed to publish host update for join: {}", e);
        }
        if let Err(e) = self.inner.publish_peer_update(false).await {
            error!("failed to publish peer update for join: {}", e);
        }
        Ok(node)
    }

    /// Soft delete marks the node pending and tells the mesh; hard delete
    /// (`force`) also removes the record and releases its addresses.
    pub async fn delete_node(&self, operator: &str, node: &Node, force: bool) -> Result<(), Error> {
        let node = if force {
            self.inner.delete_node(node).await?;
            node.clone()
        } else {
            self.inner.mark_node_pending_delete(node).await?
        };
        info!("{} deleted node {} (force={})", operator, node.id, force);

        self.inner
            .publish_mq_updates_for_deleted_node(node, true)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acls::{AclContainer, AclRule};
    use crate::controller::ErrorKind;
    use crate::models::{AclId, NetId, PeerAddr};
    use crate::store::ACLS_TABLE;
    use crate::testutil::{network_with_ingress, test_controller, test_host, test_network};

    const OP: &str = "admin";

    fn enabled_custom(client_id: &str) -> CustomExtClient {
        CustomExtClient {
            client_id: client_id.to_owned(),
            enabled: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_network_validates_name_and_cidr() {
        let (controller, _) = test_controller();

        let no_cidr = Network::new(NetId::new("n1"), None, None);
        let err = controller.create_network(OP, no_cidr).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);

        let bad_name = test_network("Bad_Name", "10.0.0.0/24");
        let err = controller.create_network(OP, bad_name).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);

        let network = test_network("n1", "10.0.0.0/24");
        controller.create_network(OP, network.clone()).await.unwrap();
        let err = controller.create_network(OP, network).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn network_create_then_delete_restores_prior_state() {
        let (controller, _) = test_controller();
        let network = test_network("n1", "10.0.0.0/24");
        let net = network.net_id.clone();

        controller.create_network(OP, network).await.unwrap();
        controller.delete_network(OP, &net).await.unwrap();

        let err = controller.get_network(&net).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(controller.get_networks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_network_refused_while_nodes_remain() {
        let (controller, _) = test_controller();
        let network = test_network("n1", "10.0.0.0/24");
        let net = network.net_id.clone();
        controller.create_network(OP, network).await.unwrap();

        let host = test_host("h1");
        controller.upsert_host(&host).await.unwrap();
        let node = controller.join_host_to_network(OP, &host.id, &net).await.unwrap();

        // an ACL record exists for the network
        let mut acls = AclContainer::default();
        acls.change_access(&node.acl_id(), &AclId::new("alice"), AclRule::Allowed);
        controller.update_network_acl(OP, &net, acls).await.unwrap();

        let err = controller.delete_network(OP, &net).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        controller.delete_node(OP, &node, true).await.unwrap();
        controller.delete_network(OP, &net).await.unwrap();

        // the ACL record went with the network
        let err = controller
            .inner
            .store
            .fetch_record(ACLS_TABLE, net.as_str())
            .await
            .unwrap_err();
        assert!(err.is_empty_record());
    }

    #[tokio::test]
    async fn access_key_lifecycle() {
        let (controller, _) = test_controller();
        let network = test_network("n1", "10.0.0.0/24");
        let net = network.net_id.clone();
        controller.create_network(OP, network).await.unwrap();

        let key = controller
            .create_access_key(
                OP,
                &net,
                AccessKey {
                    name: "deploy".into(),
                    value: String::new(),
                    uses: 3,
                },
            )
            .await
            .unwrap();
        assert_eq!(key.value.len(), 16);

        let err = controller
            .create_access_key(
                OP,
                &net,
                AccessKey {
                    name: "deploy".into(),
                    value: String::new(),
                    uses: 1,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);

        assert_eq!(controller.get_keys(&net).await.unwrap().len(), 1);
        controller.delete_key(OP, "deploy", &net).await.unwrap();
        assert!(controller.get_keys(&net).await.unwrap().is_empty());

        let err = controller.delete_key(OP, "deploy", &net).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn key_update_stamps_and_notifies_nodes() {
        let (controller, broker) = test_controller();
        let (net, _host, node) = network_with_ingress(&controller, "n1").await;

        let mut network = controller.get_network(&net).await.unwrap();
        network.key_update_timestamp = 1_000;
        controller.inner.save_network(&network).await.unwrap();

        let network = controller.key_update(OP, &net).await.unwrap();
        assert!(network.key_update_timestamp > 1_000);

        assert!(broker
            .topics()
            .iter()
            .any(|t| t.starts_with(&format!("node/update/{}/{}", net, node.id))));
    }

    #[tokio::test]
    async fn ext_client_requires_an_ingress_gateway() {
        let (controller, _) = test_controller();
        let network = test_network("n1", "10.0.0.0/24");
        let net = network.net_id.clone();
        controller.create_network(OP, network).await.unwrap();

        let host = test_host("h1");
        controller.upsert_host(&host).await.unwrap();
        let node = controller.join_host_to_network(OP, &host.id, &net).await.unwrap();

        let err = controller
            .create_ext_client(OP, &net, &node.id, enabled_custom("c1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn delete_and_cleanup_leaves_no_acl_mentions() {
        let (controller, _) = test_controller();
        let (net, _host, gw) = network_with_ingress(&controller, "n1").await;

        let c1 = controller
            .create_ext_client(OP, &net, &gw.id, enabled_custom("c1"))
            .await
            .unwrap();
        let c2 = controller
            .create_ext_client(OP, &net, &gw.id, enabled_custom("c2"))
            .await
            .unwrap();

        let mut acls = controller.get_network_acl(&net).await.unwrap();
        acls.change_access(&c1.acl_id(), &c2.acl_id(), AclRule::Allowed);
        acls.change_access(&c1.acl_id(), &gw.acl_id(), AclRule::NotAllowed);
        controller.update_network_acl(OP, &net, acls).await.unwrap();

        controller.delete_ext_client_and_cleanup(OP, &c1).await.unwrap();

        let acls = controller.get_network_acl(&net).await.unwrap();
        assert!(!acls.mentions(&c1.acl_id()));
        assert!(controller.get_ext_client("c1", &net).await.is_err());
    }

    #[tokio::test]
    async fn rename_via_update_moves_the_record_key() {
        let (controller, _) = test_controller();
        let (net, _host, gw) = network_with_ingress(&controller, "n1").await;
        let client = controller
            .create_ext_client(OP, &net, &gw.id, enabled_custom("old-name"))
            .await
            .unwrap();

        let mut custom = CustomExtClient::from_client(&client);
        custom.client_id = "new-name".into();
        let renamed = controller
            .update_ext_client(OP, &net, "old-name", custom)
            .await
            .unwrap();
        assert_eq!(renamed.client_id, "new-name");

        assert!(controller.get_ext_client("old-name", &net).await.is_err());
        let loaded = controller.get_ext_client("new-name", &net).await.unwrap();
        assert_eq!(loaded.public_key, client.public_key);
    }

    #[tokio::test]
    async fn toggle_publishes_a_deleted_client_update() {
        let (controller, broker) = test_controller();
        let (net, host, gw) = network_with_ingress(&controller, "n1").await;
        controller
            .create_ext_client(OP, &net, &gw.id, enabled_custom("c1"))
            .await
            .unwrap();

        broker.published.lock().unwrap().clear();
        let toggled = controller
            .toggle_ext_client_connectivity(OP, &net, "c1", false)
            .await
            .unwrap();
        assert!(!toggled.enabled);

        assert!(broker
            .topics()
            .iter()
            .any(|t| t.contains(&host.id.to_string())));
    }

    #[tokio::test]
    async fn lookup_by_public_key() {
        let (controller, _) = test_controller();
        let (net, _host, gw) = network_with_ingress(&controller, "n1").await;
        let client = controller
            .create_ext_client(OP, &net, &gw.id, enabled_custom("c1"))
            .await
            .unwrap();

        let found = controller
            .get_ext_client_by_pub_key(&client.public_key, &net)
            .await
            .unwrap();
        assert_eq!(found.client_id, "c1");
    }
}
