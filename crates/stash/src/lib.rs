//! Key/value storage facade.
//!
//! One [`Connection`] API over interchangeable backends: an in-process map,
//! a JSON file, or an etcd cluster. Keys are hierarchical and values are
//! typed; the connection's [`Coder`] flattens and serializes both.
//!
//! ```no_run
//! # async fn demo() -> stash::StashResult<()> {
//! let conn = stash::open(&stash::StashConfig::json("state.json")).await?;
//! let users = conn.bucket(&["users"])?;
//! users.set("1", &"ada", &[]).await?;
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod open;

pub use config::{BackendConfig, NodeSettings, StashConfig};
pub use error::{StashError, StashResult};
pub use open::{open, open_with_logger};

// Re-export key types
pub use stash_core::{
    Bucket, Connection, Event, EventKind, Item, ItemError, ItemResult, Logger, SetOption, Store,
    StoreError, StoreResult, TypedEvents, TypedItems,
};
pub use stash_encoding::{Coder, CoderBuilder, CustomValue, EncodingError, KeyCodec, ValueCodec};
pub use stash_etcd::{Etcd, EtcdConfig, NodeConfig};
pub use stash_jsondb::{JsonDb, JsonDbConfig};
pub use stash_memory::{InMemory, MemoryConfig};
