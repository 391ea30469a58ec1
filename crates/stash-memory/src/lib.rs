//! In-process backend for stash.
//!
//! - [`EventfulMap`] -- ordered map with per-entry revisions and a
//!   broadcast change feed
//! - [`TtlTimers`] -- per-key expiry tasks guarded by revision
//! - [`InMemory`] -- the [`Store`](stash_core::Store) over both
//! - [`MemoryConfig`] -- builds a ready [`Connection`](stash_core::Connection)

pub mod map;
pub mod memory;
pub mod ttl;

pub use map::{EventfulMap, DEFAULT_EVENT_CAPACITY};
pub use memory::{InMemory, MemoryConfig};
pub use ttl::TtlTimers;
