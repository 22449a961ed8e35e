mod error;

use ahash::RandomState;
use async_trait::async_trait;
pub use error::*;
use std::collections::HashMap;
use std::sync::RwLock;

pub const NETWORKS_TABLE: &str = "networks";
pub const NODES_TABLE: &str = "nodes";
pub const HOSTS_TABLE: &str = "hosts";
pub const EXT_CLIENT_TABLE: &str = "ext_client";
pub const ACLS_TABLE: &str = "acls";

/// Flat table/key/value persistence. Values are opaque byte strings; the
/// inventory layers encode entities as JSON. There are no transactions:
/// multi-key atomicity is achieved by keeping one aggregate record per
/// top-level entity (e.g. a network's whole ACL matrix is a single value).
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert(&self, table: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Fetches a single record, `EmptyRecord` if the key is absent.
    async fn fetch_record(&self, table: &str, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Fetches a whole table, `EmptyRecord` if it holds no records.
    async fn fetch_records(&self, table: &str) -> Result<HashMap<String, Vec<u8>>, StoreError>;

    async fn delete_record(&self, table: &str, key: &str) -> Result<(), StoreError>;

    fn is_connected(&self) -> bool {
        true
    }
}

/// Composes the compound record key `{id}#{namespace}`; both operands are
/// required non-empty.
pub fn record_key(id: &str, namespace: &str) -> Result<String, StoreError> {
    if id.is_empty() || namespace.is_empty() {
        return Err(StoreError::InvalidKey(format!("{id}#{namespace}")));
    }
    Ok(format!("{id}#{namespace}"))
}

/// In-process store used by the daemon default and the test suite. The
/// production KV driver lives behind the same trait.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, HashMap<String, Vec<u8>, RandomState>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert(&self, table: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut tables = self.tables.write().expect("store lock poisoned");
        tables
            .entry(table.to_owned())
            .or_default()
            .insert(key.to_owned(), value);
        Ok(())
    }

    async fn fetch_record(&self, table: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let tables = self.tables.read().expect("store lock poisoned");
        tables
            .get(table)
            .and_then(|records| records.get(key))
            .cloned()
            .ok_or(StoreError::EmptyRecord)
    }

    async fn fetch_records(&self, table: &str) -> Result<HashMap<String, Vec<u8>>, StoreError> {
        let tables = self.tables.read().expect("store lock poisoned");
        match tables.get(table) {
            Some(records) if !records.is_empty() => Ok(records
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()),
            _ => Err(StoreError::EmptyRecord),
        }
    }

    async fn delete_record(&self, table: &str, key: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.write().expect("store lock poisoned");
        if let Some(records) = tables.get_mut(table) {
            records.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_missing_record_is_empty_record() {
        let store = MemoryStore::new();
        let err = store.fetch_record(NETWORKS_TABLE, "nope").await.unwrap_err();
        assert!(err.is_empty_record());
    }

    #[tokio::test]
    async fn insert_then_fetch_round_trips() {
        let store = MemoryStore::new();
        store
            .insert(NODES_TABLE, "a", b"payload".to_vec())
            .await
            .unwrap();
        assert_eq!(store.fetch_record(NODES_TABLE, "a").await.unwrap(), b"payload");

        let all = store.fetch_records(NODES_TABLE).await.unwrap();
        assert_eq!(all.len(), 1);

        store.delete_record(NODES_TABLE, "a").await.unwrap();
        assert!(store
            .fetch_records(NODES_TABLE)
            .await
            .unwrap_err()
            .is_empty_record());
    }

    #[test]
    fn record_key_requires_both_operands() {
        assert_eq!(record_key("alice", "net1").unwrap(), "alice#net1");
        assert!(record_key("", "net1").is_err());
        assert!(record_key("alice", "").is_err());
    }
}
