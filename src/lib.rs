//! netweave is the control plane of a WireGuard mesh overlay. It owns the
//! authoritative inventory (networks, hosts, nodes, ext-clients) and the
//! per-network ACL matrix, derives policy-filtered per-host peer graphs,
//! and fans the results out over a pub/sub broker so every participating
//! host converges on the same view.
//!
//! The persistence driver and the broker client are external
//! collaborators behind the [`store::Store`] and [`mq::Broker`] traits.

pub mod acls;
pub mod alloc;
pub mod commands;
pub mod controller;
pub mod inventory;
pub mod models;
pub mod mq;
pub mod peers;
pub mod policy;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;
