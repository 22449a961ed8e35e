use crate::controller::{ControllerInner, Error};
use crate::models::{Host, HostId};
use crate::store::HOSTS_TABLE;
use tracing::warn;

impl ControllerInner {
    /// All hosts, sorted by id so bulk fan-out batches are stable.
    pub async fn get_all_hosts(&self) -> Result<Vec<Host>, Error> {
        let mut hosts = if self.config.cache_enabled {
            let cached: Vec<Host> = self
                .caches
                .hosts
                .read()
                .expect("host cache poisoned")
                .values()
                .cloned()
                .collect();
            if !cached.is_empty() {
                cached
            } else {
                self.fetch_all_hosts().await?
            }
        } else {
            self.fetch_all_hosts().await?
        };

        hosts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(hosts)
    }

    async fn fetch_all_hosts(&self) -> Result<Vec<Host>, Error> {
        let records = match self.store.fetch_records(HOSTS_TABLE).await {
            Ok(records) => records,
            Err(e) if e.is_empty_record() => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut hosts = Vec::with_capacity(records.len());
        for (key, value) in records {
            let host: Host = match serde_json::from_slice(&value) {
                Ok(host) => host,
                Err(e) => {
                    warn!("Skipping undecodable host record {}: {}", key, e);
                    continue;
                }
            };
            self.store_host_in_cache(&host);
            hosts.push(host);
        }
        Ok(hosts)
    }

    pub async fn get_host(&self, id: &HostId) -> Result<Host, Error> {
        if self.config.cache_enabled {
            let cache = self.caches.hosts.read().expect("host cache poisoned");
            if let Some(host) = cache.get(id) {
                return Ok(host.clone());
            }
        }

        let data = self
            .store
            .fetch_record(HOSTS_TABLE, &id.to_string())
            .await
            .map_err(|e| {
                if e.is_empty_record() {
                    Error::NotFound(format!("host {id}"))
                } else {
                    e.into()
                }
            })?;
        let host: Host = serde_json::from_slice(&data)?;
        self.store_host_in_cache(&host);
        Ok(host)
    }

    pub async fn upsert_host(&self, host: &Host) -> Result<(), Error> {
        let data = serde_json::to_vec(host)?;
        self.store
            .insert(HOSTS_TABLE, &host.id.to_string(), data)
            .await?;
        self.store_host_in_cache(host);
        Ok(())
    }

    /// Hosts may only be removed once every node of theirs is gone.
    pub async fn remove_host(&self, host: &Host) -> Result<(), Error> {
        if !host.nodes.is_empty() {
            return Err(Error::Forbidden(format!(
                "host {} still has {} node(s)",
                host.id,
                host.nodes.len()
            )));
        }

        self.store
            .delete_record(HOSTS_TABLE, &host.id.to_string())
            .await?;
        if self.config.cache_enabled {
            self.caches
                .hosts
                .write()
                .expect("host cache poisoned")
                .remove(&host.id);
        }
        Ok(())
    }

    fn store_host_in_cache(&self, host: &Host) {
        if self.config.cache_enabled {
            self.caches
                .hosts
                .write()
                .expect("host cache poisoned")
                .insert(host.id, host.clone());
        }
    }
}
