use crate::controller::{ControllerInner, Error};
use crate::models::{AccessKey, NetId, Network};
use crate::store::NETWORKS_TABLE;
use chrono::Utc;
use rand::RngCore;
use tracing::warn;

impl ControllerInner {
    pub async fn get_networks(&self) -> Result<Vec<Network>, Error> {
        if self.config.cache_enabled {
            let cached: Vec<Network> = self
                .caches
                .networks
                .read()
                .expect("network cache poisoned")
                .values()
                .cloned()
                .collect();
            if !cached.is_empty() {
                return Ok(cached);
            }
        }

        let records = match self.store.fetch_records(NETWORKS_TABLE).await {
            Ok(records) => records,
            Err(e) if e.is_empty_record() => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut networks = Vec::with_capacity(records.len());
        for (key, value) in records {
            let network: Network = match serde_json::from_slice(&value) {
                Ok(network) => network,
                Err(e) => {
                    warn!("Skipping undecodable network record {}: {}", key, e);
                    continue;
                }
            };
            self.store_network_in_cache(&network);
            networks.push(network);
        }
        Ok(networks)
    }

    pub async fn get_network(&self, net_id: &NetId) -> Result<Network, Error> {
        if self.config.cache_enabled {
            let cache = self.caches.networks.read().expect("network cache poisoned");
            if let Some(network) = cache.get(net_id) {
                return Ok(network.clone());
            }
        }

        let data = self
            .store
            .fetch_record(NETWORKS_TABLE, net_id.as_str())
            .await
            .map_err(|e| {
                if e.is_empty_record() {
                    Error::NotFound(format!("network {net_id}"))
                } else {
                    e.into()
                }
            })?;
        let network: Network = serde_json::from_slice(&data)?;
        self.store_network_in_cache(&network);
        Ok(network)
    }

    pub async fn save_network(&self, network: &Network) -> Result<(), Error> {
        let data = serde_json::to_vec(network)?;
        self.store
            .insert(NETWORKS_TABLE, network.net_id.as_str(), data)
            .await?;
        self.store_network_in_cache(network);
        Ok(())
    }

    pub(crate) async fn delete_network_record(&self, net_id: &NetId) -> Result<(), Error> {
        self.store
            .delete_record(NETWORKS_TABLE, net_id.as_str())
            .await?;
        if self.config.cache_enabled {
            self.caches
                .networks
                .write()
                .expect("network cache poisoned")
                .remove(net_id);
        }
        self.alloc.lock().await.drop_network(net_id);
        Ok(())
    }

    /// Stamps the network's membership-change timestamp; peers use it to
    /// detect stale views.
    pub async fn set_network_nodes_last_modified(&self, net_id: &NetId) -> Result<(), Error> {
        let mut network = self.get_network(net_id).await?;
        network.nodes_last_modified = Utc::now().timestamp();
        self.save_network(&network).await
    }

    pub(crate) fn store_network_in_cache(&self, network: &Network) {
        if self.config.cache_enabled {
            self.caches
                .networks
                .write()
                .expect("network cache poisoned")
                .insert(network.net_id.clone(), network.clone());
        }
    }

    // access keys live inside the network record, so every mutation here
    // is one aggregate save

    pub async fn create_access_key(
        &self,
        net_id: &NetId,
        mut key: AccessKey,
    ) -> Result<AccessKey, Error> {
        let mut network = self.get_network(net_id).await?;

        if key.name.is_empty() {
            key.name = random_string(5);
        }
        if network.access_keys.iter().any(|k| k.name == key.name) {
            return Err(Error::BadRequest(format!(
                "duplicate access key name {}",
                key.name
            )));
        }
        if key.value.is_empty() {
            key.value = random_string(16);
        }

        network.access_keys.push(key.clone());
        self.save_network(&network).await?;
        Ok(key)
    }

    pub async fn get_keys(&self, net_id: &NetId) -> Result<Vec<AccessKey>, Error> {
        Ok(self.get_network(net_id).await?.access_keys)
    }

    pub async fn delete_key(&self, key_name: &str, net_id: &NetId) -> Result<(), Error> {
        let mut network = self.get_network(net_id).await?;
        let before = network.access_keys.len();
        network.access_keys.retain(|k| k.name != key_name);
        if network.access_keys.len() == before {
            return Err(Error::NotFound(format!("access key {key_name}")));
        }
        self.save_network(&network).await
    }

    /// Stamps the key-update timestamp; nodes re-enroll on seeing it move.
    pub async fn key_update(&self, net_id: &NetId) -> Result<Network, Error> {
        let mut network = self.get_network(net_id).await?;
        network.key_update_timestamp = Utc::now().timestamp();
        self.save_network(&network).await?;
        Ok(network)
    }
}

/// Random base32 string of the given length, the shape access-key values
/// take on the wire.
pub(crate) fn random_string(length: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut bytes = vec![0u8; length];
    rand::rng().fill_bytes(&mut bytes);
    bytes
        .iter()
        .map(|b| CHARSET[(*b as usize) % CHARSET.len()] as char)
        .collect()
}
