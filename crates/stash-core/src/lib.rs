//! Store contract and typed facade for stash.
//!
//! A [`Store`] is a flat byte-level key/value backend. A [`Connection`]
//! wraps one store with a [`Coder`](stash_encoding::Coder) and adds:
//!
//! - typed get/set through the value codec
//! - [`Bucket`]s, namespaced views built through the key codec
//! - prefix transactions, at most one running per bucket prefix
//! - typed iterate and watch streams that report decode failures per item
//!
//! # Modules
//!
//! - [`traits`] -- the [`Store`] trait every backend implements
//! - [`connection`] / [`bucket`] -- the typed facade
//! - [`stream`] -- channel types and the [`TaskRegistry`] owning producers
//! - [`adapter`] -- decoding wrappers over raw streams
//! - [`locks`] -- per-prefix async mutexes
//! - [`logger`] -- the injected [`Logger`] handle

pub mod adapter;
pub mod bucket;
pub mod connection;
pub mod error;
pub mod event;
pub mod locks;
pub mod logger;
pub mod options;
pub mod stream;
pub mod traits;

#[cfg(test)]
mod testing;

pub use adapter::{TypedEvents, TypedItems};
pub use bucket::Bucket;
pub use connection::Connection;
pub use error::{StoreError, StoreResult};
pub use event::{Event, EventKind, Item, ItemError, ItemResult};
pub use locks::PrefixLocks;
pub use logger::{default_logger, Logger, MemoryLogger, NoopLogger, TracingLogger};
pub use options::{ttl_of, SetOption};
pub use stream::{EventStream, ItemStream, TaskRegistry, STREAM_CAPACITY};
pub use traits::Store;

pub use stash_encoding;
