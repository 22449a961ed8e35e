use crate::controller::{ControllerInner, Error};
use crate::models::NetId;
use ahash::RandomState;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::trace;

/// Per-network set of in-use addresses. Rebuilt lazily from persisted
/// nodes and ext-clients, then maintained synchronously under the
/// allocator mutex.
pub struct AllocatedIpMap {
    nets: HashMap<NetId, HashSet<IpAddr>, RandomState>,
}

impl AllocatedIpMap {
    pub fn new() -> Self {
        Self {
            nets: HashMap::with_hasher(RandomState::new()),
        }
    }

    pub fn is_loaded(&self, network: &NetId) -> bool {
        self.nets.contains_key(network)
    }

    pub fn is_allocated(&self, network: &NetId, ip: IpAddr) -> bool {
        self.nets
            .get(network)
            .is_some_and(|used| used.contains(&ip))
    }

    pub fn insert(&mut self, network: &NetId, ip: IpAddr) {
        self.nets.entry(network.clone()).or_default().insert(ip);
    }

    pub fn remove(&mut self, network: &NetId, ip: IpAddr) {
        if let Some(used) = self.nets.get_mut(network) {
            used.remove(&ip);
        }
    }

    pub fn load(&mut self, network: &NetId, used: HashSet<IpAddr>) {
        self.nets.insert(network.clone(), used);
    }

    pub fn drop_network(&mut self, network: &NetId) {
        self.nets.remove(network);
    }
}

impl Default for AllocatedIpMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerInner {
    /// Returns the first free IPv4 address in the network range, marking
    /// it used when `reserve` is set. Check and reservation happen under
    /// one lock acquisition.
    pub async fn unique_address(&self, network: &NetId, reserve: bool) -> Result<Ipv4Addr, Error> {
        let mut map = self.alloc.lock().await;
        self.unique_address_locked(&mut map, network, reserve).await
    }

    pub async fn unique_address6(&self, network: &NetId, reserve: bool) -> Result<Ipv6Addr, Error> {
        let mut map = self.alloc.lock().await;
        self.unique_address6_locked(&mut map, network, reserve)
            .await
    }

    /// IPv4 variant for callers already holding the allocator mutex.
    /// Scanning starts one past the network address and excludes the
    /// broadcast address.
    pub(crate) async fn unique_address_locked(
        &self,
        map: &mut AllocatedIpMap,
        network: &NetId,
        reserve: bool,
    ) -> Result<Ipv4Addr, Error> {
        let net = self.get_network(network).await?;
        let range = net
            .address_range
            .ok_or_else(|| Error::BadRequest(format!("network {network} has no IPv4 range")))?;
        self.ensure_allocated_loaded(map, network).await?;

        let first = u32::from(range.network()) + 1;
        let broadcast = u32::from(range.broadcast());
        for raw in first..broadcast {
            let candidate = Ipv4Addr::from(raw);
            if !map.is_allocated(network, IpAddr::V4(candidate)) {
                if reserve {
                    map.insert(network, IpAddr::V4(candidate));
                }
                trace!("Assigned address {} in network {}", candidate, network);
                return Ok(candidate);
            }
        }

        Err(Error::AddressSpaceExhausted(network.clone()))
    }

    /// IPv6 variant; scanning starts at the first host address.
    pub(crate) async fn unique_address6_locked(
        &self,
        map: &mut AllocatedIpMap,
        network: &NetId,
        reserve: bool,
    ) -> Result<Ipv6Addr, Error> {
        let net = self.get_network(network).await?;
        let range = net
            .address_range6
            .ok_or_else(|| Error::BadRequest(format!("network {network} has no IPv6 range")))?;
        self.ensure_allocated_loaded(map, network).await?;

        let first = u128::from(range.network()) + 1;
        let last = u128::from(range.broadcast());
        let mut raw = first;
        while raw <= last {
            let candidate = Ipv6Addr::from(raw);
            if !map.is_allocated(network, IpAddr::V6(candidate)) {
                if reserve {
                    map.insert(network, IpAddr::V6(candidate));
                }
                trace!("Assigned address {} in network {}", candidate, network);
                return Ok(candidate);
            }
            raw += 1;
        }

        Err(Error::AddressSpaceExhausted(network.clone()))
    }

    pub async fn add_ip_to_allocated_ip_map(&self, network: &NetId, ip: IpAddr) {
        let mut map = self.alloc.lock().await;
        if map.is_loaded(network) {
            map.insert(network, ip);
        }
    }

    pub async fn remove_ip_from_allocated_ip_map(&self, network: &NetId, ip: IpAddr) {
        let mut map = self.alloc.lock().await;
        map.remove(network, ip);
    }

    /// Rebuilds a network's in-use set from persisted nodes and
    /// ext-clients on first touch.
    pub(crate) async fn ensure_allocated_loaded(
        &self,
        map: &mut AllocatedIpMap,
        network: &NetId,
    ) -> Result<(), Error> {
        if map.is_loaded(network) {
            return Ok(());
        }

        let mut used = HashSet::new();
        for node in self.get_network_nodes(network).await? {
            if let Some(a) = node.address {
                used.insert(IpAddr::V4(a));
            }
            if let Some(a) = node.address6 {
                used.insert(IpAddr::V6(a));
            }
        }
        for client in self.get_network_ext_clients(network).await? {
            if let Some(a) = client.address {
                used.insert(IpAddr::V4(a));
            }
            if let Some(a) = client.address6 {
                used.insert(IpAddr::V6(a));
            }
        }

        trace!(
            "Rebuilt allocated-IP map for network {} with {} entries",
            network,
            used.len()
        );
        map.load(network, used);
        Ok(())
    }
}
