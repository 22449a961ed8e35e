mod config;
mod error;
mod housekeeping;

pub use config::*;
pub use error::*;

use crate::alloc::AllocatedIpMap;
use crate::models::{ExtClient, Host, HostId, NetId, Network, Node, NodeId};
use crate::mq::{Broker, ServerStatus};
use crate::store::Store;
use ahash::RandomState;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::info;

/// Flag-gated in-memory caches, one shard per entity type. Read paths take
/// the read lock, write paths the write lock for the whole mutation; no
/// lock is held across store or broker awaits.
pub(crate) struct Caches {
    pub networks: RwLock<HashMap<NetId, Network, RandomState>>,
    pub hosts: RwLock<HashMap<HostId, Host, RandomState>>,
    pub nodes: RwLock<HashMap<NodeId, Node, RandomState>>,
    /// Keyed by the compound record key `{client_id}#{net_id}`.
    pub ext_clients: RwLock<HashMap<String, ExtClient, RandomState>>,
}

impl Caches {
    fn new() -> Self {
        Self {
            networks: RwLock::new(HashMap::with_hasher(RandomState::new())),
            hosts: RwLock::new(HashMap::with_hasher(RandomState::new())),
            nodes: RwLock::new(HashMap::with_hasher(RandomState::new())),
            ext_clients: RwLock::new(HashMap::with_hasher(RandomState::new())),
        }
    }
}

pub struct ControllerInner {
    pub(crate) config: ServerConfig,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) caches: Caches,
    /// The allocator mutex: guards the allocated-IP map, and is held
    /// across address generation plus record persistence wherever
    /// uniqueness depends on the persisted side.
    pub(crate) alloc: Mutex<AllocatedIpMap>,
    pub(crate) status_cache: Mutex<ServerStatus>,
    pub(crate) cancellation_token: CancellationToken,
    /// Back-reference to the owning Arc so fan-out tasks can be spawned
    /// from `&self` methods.
    me: Weak<ControllerInner>,
}

impl ControllerInner {
    pub(crate) fn arc(&self) -> Arc<ControllerInner> {
        self.me.upgrade().expect("controller dropped while in use")
    }
}

/// Handle owning all process-wide mutable state of the control plane.
pub struct Controller {
    pub(crate) inner: Arc<ControllerInner>,
}

impl Controller {
    pub fn new(config: ServerConfig, store: Arc<dyn Store>, broker: Arc<dyn Broker>) -> Self {
        let inner = Arc::new_cyclic(|me| ControllerInner {
            config,
            store,
            broker,
            caches: Caches::new(),
            alloc: Mutex::new(AllocatedIpMap::new()),
            status_cache: Mutex::new(ServerStatus::default()),
            cancellation_token: CancellationToken::new(),
            me: me.clone(),
        });
        Self { inner }
    }

    /// Creates the controller and spawns its housekeeping task.
    pub fn start(config: ServerConfig, store: Arc<dyn Store>, broker: Arc<dyn Broker>) -> Self {
        info!("Start mesh controller.");
        let controller = Self::new(config, store, broker);

        tokio::spawn(ControllerInner::housekeeping_runner(
            controller.inner.clone(),
            controller.inner.cancellation_token.child_token(),
        ));

        controller
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.cancellation_token.cancelled()
    }

    pub fn shutdown(&self) {
        info!("Shutdown mesh controller.");
        self.inner.cancellation_token.cancel();
    }

    pub fn server_id(&self) -> &str {
        &self.inner.config.server_id
    }
}
