use crate::controller::{ControllerInner, Error};
use crate::models::{AclId, NetId};
use crate::store::{ACLS_TABLE, Store};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclRule {
    /// Absent/unset entries fall through to the network's default policy.
    #[default]
    Unset,
    NotAllowed,
    Allowed,
}

/// The per-network allow/deny matrix. Sparse: only explicitly written
/// entries are stored. The whole matrix persists as one record, so a save
/// is atomic and the last writer wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AclContainer(pub HashMap<AclId, HashMap<AclId, AclRule>>);

impl AclContainer {
    /// Loads a network's matrix, deep-copied; an absent record yields an
    /// empty matrix.
    pub async fn fetch(store: &dyn Store, network: &NetId) -> Result<Self, Error> {
        match store.fetch_record(ACLS_TABLE, network.as_str()).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.is_empty_record() => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persists the whole matrix as one value.
    pub async fn save(&self, store: &dyn Store, network: &NetId) -> Result<(), Error> {
        let data = serde_json::to_vec(self)?;
        store.insert(ACLS_TABLE, network.as_str(), data).await?;
        Ok(())
    }

    pub fn rule(&self, a: &AclId, b: &AclId) -> AclRule {
        self.0
            .get(a)
            .and_then(|row| row.get(b))
            .copied()
            .unwrap_or_default()
    }

    pub fn set_rule(&mut self, a: &AclId, b: &AclId, rule: AclRule) {
        self.0.entry(a.clone()).or_default().insert(b.clone(), rule);
    }

    /// Writes both directions of a pair at once.
    pub fn change_access(&mut self, a: &AclId, b: &AclId, rule: AclRule) {
        self.set_rule(a, b, rule);
        self.set_rule(b, a, rule);
    }

    /// Removes an entity entirely: its outer row, and its column in every
    /// surviving row. Both edits happen in memory; the caller persists
    /// with one `save`.
    pub fn remove_acl(&mut self, id: &AclId) {
        self.0.remove(id);
        for row in self.0.values_mut() {
            row.remove(id);
        }
    }

    pub fn mentions(&self, id: &AclId) -> bool {
        self.0.contains_key(id) || self.0.values().any(|row| row.contains_key(id))
    }
}

impl ControllerInner {
    pub async fn get_network_acls(&self, network: &NetId) -> Result<AclContainer, Error> {
        AclContainer::fetch(self.store.as_ref(), network).await
    }

    pub async fn save_network_acls(
        &self,
        network: &NetId,
        acls: &AclContainer,
    ) -> Result<(), Error> {
        acls.save(self.store.as_ref(), network).await
    }

    /// Strips every mention of an entity from the network matrix and
    /// persists the result.
    pub async fn remove_acl_entity(&self, network: &NetId, id: &AclId) -> Result<(), Error> {
        let mut acls = self.get_network_acls(network).await?;
        acls.remove_acl(id);
        self.save_network_acls(network, &acls).await
    }
}
