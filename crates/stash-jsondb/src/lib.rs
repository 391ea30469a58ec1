//! JSON file backend for stash.
//!
//! Keeps every key in an in-process map and mirrors it to one
//! human-readable JSON document. Values must therefore be JSON, and the
//! default key codec is the readable `[bucket]//key` form.

pub mod file;
pub mod jsondb;

pub use jsondb::{JsonDb, JsonDbConfig, Layout, DEFAULT_SYNC_INTERVAL};
