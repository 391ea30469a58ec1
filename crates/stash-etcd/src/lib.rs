//! etcd backend for stash.
//!
//! Talks to the etcd v3 JSON gateway (`/v3/kv/*`, `/v3/lease/grant`,
//! `/v3/watch`) over `reqwest`, failing over between endpoints. Optionally
//! starts a local etcd member first and joins peers discovered through a
//! load balancer's DNS name.
//!
//! # Modules
//!
//! - [`etcd`] -- the [`Etcd`] store and [`EtcdConfig`]
//! - [`client`] -- HTTP gateway client with endpoint failover
//! - [`wire`] -- request and response shapes
//! - [`node`] -- launching an embedded member

pub mod client;
pub mod etcd;
pub mod node;
pub mod wire;

#[cfg(test)]
mod fake;

pub use client::{check_health, normalize_endpoint, Gateway, LineReader};
pub use etcd::{lease_seconds, Etcd, EtcdConfig, DEFAULT_REQUEST_TIMEOUT, PAGE_SIZE};
pub use node::{
    EtcdNode, NodeConfig, DEFAULT_CLIENT_PORT, DEFAULT_PEER_PORT, DEFAULT_STARTUP_TIMEOUT,
};
pub use wire::{prefix_end, prefix_range};
