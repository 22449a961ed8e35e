use crate::controller::{ControllerInner, Error};
use crate::models::{
    CustomExtClient, ExtClient, NetId, Node, NodeId, Peer, PeerAddr, WgKeyPair, WgPublicKey,
};
use crate::store::{EXT_CLIENT_TABLE, record_key};
use chrono::Utc;
use ipnet::IpNet;
use rand::Rng;
use std::net::IpAddr;
use tracing::{error, trace};

const NAME_ADJECTIVES: &[&str] = &[
    "amber", "bold", "brisk", "calm", "clear", "deep", "dusky", "eager", "faint", "grand", "keen",
    "lucid", "mellow", "quiet", "rapid", "solid", "stark", "vivid", "warm", "wild",
];

const NAME_NOUNS: &[&str] = &[
    "basin", "brook", "cedar", "cliff", "crane", "delta", "fjord", "glade", "heron", "inlet",
    "maple", "mesa", "otter", "raven", "reef", "ridge", "shoal", "stone", "tarn", "wren",
];

impl ControllerInner {
    fn all_ext_clients_from_cache(&self) -> Vec<ExtClient> {
        self.caches
            .ext_clients
            .read()
            .expect("ext-client cache poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn store_ext_client_in_cache(&self, key: &str, client: &ExtClient) {
        if self.config.cache_enabled {
            self.caches
                .ext_clients
                .write()
                .expect("ext-client cache poisoned")
                .insert(key.to_owned(), client.clone());
        }
    }

    fn delete_ext_client_from_cache(&self, key: &str) {
        if self.config.cache_enabled {
            self.caches
                .ext_clients
                .write()
                .expect("ext-client cache poisoned")
                .remove(key);
        }
    }

    pub async fn get_network_ext_clients(&self, network: &NetId) -> Result<Vec<ExtClient>, Error> {
        if self.config.cache_enabled {
            let all = self.all_ext_clients_from_cache();
            if !all.is_empty() {
                return Ok(all
                    .into_iter()
                    .filter(|c| &c.network == network)
                    .collect());
            }
        }

        let records = match self.store.fetch_records(EXT_CLIENT_TABLE).await {
            Ok(records) => records,
            Err(e) if e.is_empty_record() => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut clients = Vec::new();
        for value in records.values() {
            let client: ExtClient = match serde_json::from_slice(value) {
                Ok(client) => client,
                Err(_) => continue,
            };
            if let Ok(key) = record_key(&client.client_id, client.network.as_str()) {
                self.store_ext_client_in_cache(&key, &client);
            }
            if &client.network == network {
                clients.push(client);
            }
        }
        Ok(clients)
    }

    pub async fn get_all_ext_clients(&self) -> Result<Vec<ExtClient>, Error> {
        let mut clients = Vec::new();
        for network in self.get_networks().await? {
            match self.get_network_ext_clients(&network.net_id).await {
                Ok(mut net_clients) => clients.append(&mut net_clients),
                Err(_) => continue,
            }
        }
        Ok(clients)
    }

    pub async fn get_ext_client(&self, client_id: &str, network: &NetId) -> Result<ExtClient, Error> {
        let key = record_key(client_id, network.as_str())
            .map_err(|e| Error::BadRequest(e.to_string()))?;

        if self.config.cache_enabled {
            let cache = self
                .caches
                .ext_clients
                .read()
                .expect("ext-client cache poisoned");
            if let Some(client) = cache.get(&key) {
                return Ok(client.clone());
            }
        }

        let data = self
            .store
            .fetch_record(EXT_CLIENT_TABLE, &key)
            .await
            .map_err(|e| {
                if e.is_empty_record() {
                    Error::NotFound(format!("ext client {client_id} on {network}"))
                } else {
                    e.into()
                }
            })?;
        let client: ExtClient = serde_json::from_slice(&data)?;
        self.store_ext_client_in_cache(&key, &client);
        Ok(client)
    }

    pub async fn get_ext_client_by_pub_key(
        &self,
        public_key: &WgPublicKey,
        network: &NetId,
    ) -> Result<ExtClient, Error> {
        self.get_network_ext_clients(network)
            .await?
            .into_iter()
            .find(|c| &c.public_key == public_key)
            .ok_or_else(|| Error::NotFound(format!("ext client with key {public_key}")))
    }

    /// All ext clients pinned to the given ingress gateway.
    pub async fn get_gw_ext_clients(
        &self,
        gateway: &NodeId,
        network: &NetId,
    ) -> Result<Vec<ExtClient>, Error> {
        Ok(self
            .get_network_ext_clients(network)
            .await?
            .into_iter()
            .filter(|c| &c.ingress_gateway_id == gateway)
            .collect())
    }

    /// Creates an ext client. The allocator mutex is held for the whole
    /// operation: address assignment, the client-id uniqueness check, and
    /// record persistence all depend on it.
    pub async fn create_ext_client(
        &self,
        network: NetId,
        ingress_gateway_id: NodeId,
        owner_id: String,
        custom: CustomExtClient,
    ) -> Result<ExtClient, Error> {
        let mut map = self.alloc.lock().await;

        let (public_key, private_key) = match custom.public_key {
            Some(key) => (key, "[ENTER PRIVATE KEY]".to_string()),
            None => {
                let pair = WgKeyPair::generate();
                (pair.public_key(), pair.private_key_base64())
            }
        };

        let parent = self.get_network(&network).await?;

        let mut client = ExtClient {
            client_id: custom.client_id,
            network: network.clone(),
            public_key,
            private_key,
            address: None,
            address6: None,
            extra_allowed_ips: custom.extra_allowed_ips,
            ingress_gateway_id,
            owner_id,
            remote_access_client_id: custom.remote_access_client_id,
            enabled: custom.enabled,
            denied_acls: custom.denied_acls.unwrap_or_default(),
            dns: custom.dns,
            post_up: custom.post_up.replace("\r\n", "\n"),
            post_down: custom.post_down.replace("\r\n", "\n"),
            tags: custom.tags,
            last_modified: 0,
        };

        if !client.client_id.is_empty()
            && self.get_ext_client(&client.client_id, &network).await.is_ok()
        {
            return Err(Error::BadRequest(format!(
                "ext client {} already exists on {}",
                client.client_id, network
            )));
        }

        if parent.is_ipv4 {
            client.address = Some(self.unique_address_locked(&mut map, &network, true).await?);
        }
        if parent.is_ipv6 {
            client.address6 = Some(self.unique_address6_locked(&mut map, &network, true).await?);
        }

        if client.client_id.is_empty() {
            client.client_id = self.generate_node_name(&network).await?;
        }

        client.last_modified = Utc::now().timestamp();

        self.persist_ext_client(&client).await?;
        register_client_ips(&mut map, &client);
        Ok(client)
    }

    /// Picks a random friendly name not colliding with an existing client:
    /// at most 10 attempts, at most 15 characters.
    pub async fn generate_node_name(&self, network: &NetId) -> Result<String, Error> {
        for _ in 0..10 {
            let name = {
                let mut rng = rand::rng();
                let adjective = NAME_ADJECTIVES[rng.random_range(0..NAME_ADJECTIVES.len())];
                let noun = NAME_NOUNS[rng.random_range(0..NAME_NOUNS.len())];
                format!("{adjective}-{noun}")
            };
            if name.len() > 15 {
                continue;
            }
            if self.get_ext_client(&name, network).await.is_ok() {
                // a client with this name already exists
                continue;
            }
            return Ok(name);
        }
        Err(Error::NameGenExhausted)
    }

    /// Persists the client and registers its addresses. Callers inside the
    /// allocator critical section use `persist_ext_client` +
    /// `register_client_ips` directly instead.
    pub async fn save_ext_client(&self, client: &ExtClient) -> Result<(), Error> {
        self.persist_ext_client(client).await?;
        let mut map = self.alloc.lock().await;
        register_client_ips(&mut map, client);
        Ok(())
    }

    async fn persist_ext_client(&self, client: &ExtClient) -> Result<(), Error> {
        let key = record_key(&client.client_id, client.network.as_str())
            .map_err(|e| Error::BadRequest(e.to_string()))?;
        let data = serde_json::to_vec(client)?;
        self.store.insert(EXT_CLIENT_TABLE, &key, data).await?;
        self.store_ext_client_in_cache(&key, client);
        self.set_network_nodes_last_modified(&client.network).await
    }

    /// Deletes the record, releases both addresses, and schedules the ACL
    /// cleanup asynchronously. `delete_ext_client_and_cleanup` is the
    /// synchronous variant.
    pub async fn delete_ext_client(
        &self,
        network: &NetId,
        client_id: &str,
    ) -> Result<ExtClient, Error> {
        let client = self.remove_ext_client_record(network, client_id).await?;

        let inner = self.arc();
        let cleanup_net = network.clone();
        let acl_id = client.acl_id();
        tokio::spawn(async move {
            if let Err(e) = inner.remove_acl_entity(&cleanup_net, &acl_id).await {
                error!(
                    "Failed to clean ACLs for deleted ext client {}: {}",
                    acl_id, e
                );
            }
        });

        Ok(client)
    }

    /// Deletes the client and strips its ACL mentions before returning.
    pub async fn delete_ext_client_and_cleanup(&self, client: &ExtClient) -> Result<(), Error> {
        self.remove_ext_client_record(&client.network, &client.client_id)
            .await?;
        self.remove_acl_entity(&client.network, &client.acl_id())
            .await
    }

    pub(crate) async fn remove_ext_client_record(
        &self,
        network: &NetId,
        client_id: &str,
    ) -> Result<ExtClient, Error> {
        let key = record_key(client_id, network.as_str())
            .map_err(|e| Error::BadRequest(e.to_string()))?;
        let client = self.get_ext_client(client_id, network).await?;

        self.store.delete_record(EXT_CLIENT_TABLE, &key).await?;

        // recycle addresses
        if let Some(a) = client.address {
            self.remove_ip_from_allocated_ip_map(network, IpAddr::V4(a))
                .await;
        }
        if let Some(a) = client.address6 {
            self.remove_ip_from_allocated_ip_map(network, IpAddr::V6(a))
                .await;
        }
        self.delete_ext_client_from_cache(&key);
        Ok(client)
    }

    /// Enables or disables a client. Modeled as delete-then-save so the
    /// record key stays consistent with the client id; ACL entries are
    /// left untouched.
    pub async fn toggle_ext_client_connectivity(
        &self,
        client: &ExtClient,
        enable: bool,
    ) -> Result<ExtClient, Error> {
        let mut update = CustomExtClient::from_client(client);
        update.enabled = enable;

        let new_client = update_ext_client_fields(client, &update);
        if let Err(e) = self
            .remove_ext_client_record(&client.network, &client.client_id)
            .await
        {
            error!(
                "Failed to delete ext client during update, id {} network {}: {}",
                client.client_id, client.network, e
            );
            return Err(e);
        }
        if let Err(e) = self.save_ext_client(&new_client).await {
            error!(
                "Failed to save updated ext client, id {} network {}: {}",
                new_client.client_id, new_client.network, e
            );
            return Err(e);
        }

        Ok(new_client)
    }

    /// Egress ranges visible on the client's network: every egress
    /// gateway's announced ranges plus the other clients' extra allowed
    /// addresses.
    pub async fn get_egress_ranges_on_network(
        &self,
        client: &ExtClient,
    ) -> Result<Vec<IpNet>, Error> {
        let mut result = Vec::new();
        for node in self.get_network_nodes(&client.network).await? {
            if node.is_egress_gateway {
                result.extend(node.egress_gateway_ranges.iter().copied());
            }
        }
        for other in self.get_network_ext_clients(&client.network).await? {
            if other.client_id == client.client_id {
                continue;
            }
            result.extend(other.extra_allowed_ips.iter().copied());
        }
        Ok(result)
    }

    /// The allowed-IPs a client's own WireGuard config should carry: the
    /// whole default route when its gateway is an internet gateway,
    /// otherwise the network ranges plus the egress ranges.
    pub async fn get_ext_client_allowed_ips(&self, client: &ExtClient) -> Vec<IpNet> {
        let gw_node = match self.get_node_by_id(&client.ingress_gateway_id).await {
            Ok(node) => node,
            Err(e) => {
                error!(
                    "failed to get ingress gateway node [{}] info: {}",
                    client.ingress_gateway_id, e
                );
                return Vec::new();
            }
        };
        let network = match self.get_network(&client.network).await {
            Ok(network) => network,
            Err(_) => {
                error!("Could not retrieve ingress gateway network {}", client.network);
                return Vec::new();
            }
        };

        if gw_node.is_internet_gateway {
            let mut allowed = vec!["0.0.0.0/0".parse().expect("default route")];
            if gw_node.address6.is_some() && client.address6.is_some() {
                allowed.push("::/0".parse().expect("default route"));
            }
            return allowed;
        }

        let mut allowed: Vec<IpNet> = Vec::new();
        if let Some(range) = network.address_range {
            allowed.push(range.into());
        }
        if let Some(range) = network.address_range6 {
            allowed.push(range.into());
        }
        if let Ok(egress) = self.get_egress_ranges_on_network(client).await {
            allowed.extend(egress);
        }
        allowed
    }

    /// Ext clients of a network projected into the uniform peer shape,
    /// sorted by client id for deterministic emission. `only_wg` drops
    /// user clients.
    pub async fn get_static_nodes_by_network(
        &self,
        network: &NetId,
        only_wg: bool,
    ) -> Result<Vec<Peer>, Error> {
        let mut clients = self.get_network_ext_clients(network).await?;
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        Ok(clients
            .into_iter()
            .filter(|c| !(only_wg && c.is_user_client()))
            .map(|c| c.to_peer())
            .collect())
    }

    pub async fn get_static_user_nodes_by_network(
        &self,
        network: &NetId,
    ) -> Result<Vec<Peer>, Error> {
        let mut clients = self.get_network_ext_clients(network).await?;
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        Ok(clients
            .into_iter()
            .filter(|c| c.is_user_client())
            .map(Peer::StaticUser)
            .collect())
    }

    pub async fn get_static_nodes_by_gw(&self, gw_node: &Node) -> Result<Vec<Peer>, Error> {
        let mut clients = self
            .get_gw_ext_clients(&gw_node.id, &gw_node.network)
            .await?;
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        Ok(clients.into_iter().map(|c| c.to_peer()).collect())
    }

    /// Addresses of static nodes not already covered by an enabled
    /// blanket default policy.
    pub async fn get_static_node_ips(&self, node: &Node) -> Result<Vec<IpAddr>, Error> {
        let network = self.get_network(&node.network).await?;
        let mut ips = Vec::new();
        for peer in self.get_static_nodes_by_network(&node.network, false).await? {
            let Some(client) = peer.static_client() else {
                continue;
            };
            if client.is_user_client() && network.default_user_policy.enabled {
                continue;
            }
            if !client.is_user_client() && network.default_device_policy.enabled {
                continue;
            }
            if let Some(a) = client.address {
                ips.push(IpAddr::V4(a));
            }
            if let Some(a) = client.address6 {
                ips.push(IpAddr::V6(a));
            }
        }
        Ok(ips)
    }
}

/// Builds the merged record for an update: identity fields replace
/// outright, key and deny-list fields only when supplied, script fields
/// are CRLF-normalized.
pub fn update_ext_client_fields(old: &ExtClient, update: &CustomExtClient) -> ExtClient {
    let mut new = old.clone();
    new.client_id = update.client_id.clone();
    if let Some(key) = update.public_key {
        if key != old.public_key {
            new.public_key = key;
        }
    }
    if update.dns != old.dns {
        new.dns = update.dns.clone();
    }
    if update.enabled != old.enabled {
        new.enabled = update.enabled;
    }
    new.extra_allowed_ips = update.extra_allowed_ips.clone();
    if let Some(denied) = &update.denied_acls {
        if denied != &old.denied_acls {
            new.denied_acls = denied.clone();
        }
    }
    new.post_up = update.post_up.replace("\r\n", "\n");
    new.post_down = update.post_down.replace("\r\n", "\n");
    new.tags = update.tags.clone();
    new
}

/// Registers a client's addresses in an already-locked allocated-IP map.
pub(crate) fn register_client_ips(
    map: &mut crate::alloc::AllocatedIpMap,
    client: &ExtClient,
) {
    if !map.is_loaded(&client.network) {
        return;
    }
    if let Some(a) = client.address {
        map.insert(&client.network, IpAddr::V4(a));
        trace!("Registered {} for {}", a, client.client_id);
    }
    if let Some(a) = client.address6 {
        map.insert(&client.network, IpAddr::V6(a));
    }
}
