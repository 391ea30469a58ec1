//! One async mutex per transaction prefix.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lazily created per-prefix locks.
///
/// Entries live as long as the store. Prefixes are compared literally, so
/// `"a"` and `"a/b"` never contend.
#[derive(Debug, Default)]
pub struct PrefixLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PrefixLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive ownership of `prefix`.
    pub async fn lock(&self, prefix: &str) -> OwnedMutexGuard<()> {
        self.handle(prefix).lock_owned().await
    }

    /// Number of prefixes that have ever been locked.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn handle(&self, prefix: &str) -> Arc<Mutex<()>> {
        if let Some(existing) = self.locks.get(prefix) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.locks
                .entry(prefix.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }
}
