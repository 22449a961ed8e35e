mod publishers;

use crate::models::{HostId, Node};
use async_trait::async_trait;
pub use publishers::*;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

pub const SERVER_STATUS_TOPIC: &str = "server/status";
pub const METRICS_EXPORTER_TOPIC: &str = "metrics_exporter";

/// Hard deadline on every broker publish.
pub const MQ_TIMEOUT: Duration = Duration::from_secs(10);

/// Bulk publishers deliver to at most this many hosts concurrently.
pub const BATCH_SIZE: usize = 20;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("cannot publish, broker not connected")]
    NotConnected,

    #[error("publish rejected: {0}")]
    Rejected(String),
}

/// Seam to the MQTT-style pub/sub broker. All control-plane messages go
/// out at QoS 0; `retain` marks last-value topics (`server/status`,
/// `metrics_exporter`).
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool)
        -> Result<(), BrokerError>;

    fn is_connected(&self) -> bool;

    fn is_connection_open(&self) -> bool;
}

/// Broker stub for deployments without a message queue: accepts and drops
/// every message so command flows stay publishable.
#[derive(Default)]
pub struct NullBroker;

#[async_trait]
impl Broker for NullBroker {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        _retain: bool,
    ) -> Result<(), BrokerError> {
        trace!("Dropping {} byte message to {}", payload.len(), topic);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn is_connection_open(&self) -> bool {
        true
    }
}

pub fn peer_update_topic(host_id: &HostId, server_id: &str) -> String {
    format!("peers/host/{host_id}/{server_id}")
}

pub fn node_update_topic(node: &Node) -> String {
    format!("node/update/{}/{}", node.network, node.id)
}

pub fn host_update_topic(host_id: &HostId, server_id: &str) -> String {
    format!("host/update/{host_id}/{server_id}")
}

/// Test double that records every publish and can be told to reject
/// messages for topics containing a marker string.
#[cfg(test)]
pub(crate) struct RecordingBroker {
    pub published: std::sync::Mutex<Vec<(String, Vec<u8>, bool)>>,
    pub fail_matching: std::sync::Mutex<Option<String>>,
}

#[cfg(test)]
impl RecordingBroker {
    pub fn new() -> Self {
        Self {
            published: std::sync::Mutex::new(Vec::new()),
            fail_matching: std::sync::Mutex::new(None),
        }
    }

    pub fn topics(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(t, _, _)| t.clone())
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl Broker for RecordingBroker {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), BrokerError> {
        if let Some(marker) = self.fail_matching.lock().unwrap().as_deref() {
            if topic.contains(marker) {
                return Err(BrokerError::Rejected(format!("injected failure on {topic}")));
            }
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_owned(), payload, retain));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn is_connection_open(&self) -> bool {
        true
    }
}
