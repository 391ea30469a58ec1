//! Deferred deletion of keys.
//!
//! One timer task per key. Scheduling a key aborts its previous timer, and a
//! timer only deletes the entry if it still carries the revision the timer
//! was scheduled for, so a stale timer can never remove a fresh value.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use stash_core::Logger;

use crate::map::EventfulMap;

#[derive(Debug)]
struct Timer {
    revision: u64,
    handle: JoinHandle<()>,
}

/// Registry of pending expiries, keyed by flattened key.
#[derive(Clone, Debug)]
pub struct TtlTimers {
    timers: Arc<Mutex<HashMap<String, Timer>>>,
    logger: Arc<dyn Logger>,
}

impl TtlTimers {
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
            logger,
        }
    }

    /// Delete `key` from `map` after `after`, if it is still at `revision`.
    ///
    /// A timer already registered for a newer revision wins and this call is
    /// a no-op.
    pub fn schedule(&self, map: &Arc<EventfulMap>, key: &str, revision: u64, after: Duration) {
        let mut timers = self.timers.lock();
        if let Some(existing) = timers.get(key) {
            if existing.revision > revision {
                return;
            }
        }

        let map = Arc::clone(map);
        let registry = Arc::clone(&self.timers);
        let logger = Arc::clone(&self.logger);
        let owned = key.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if map.remove_if_revision(&owned, revision) {
                logger.debug(format_args!("EXPIRE {owned}"));
            }
            let mut timers = registry.lock();
            if timers.get(&owned).map(|t| t.revision) == Some(revision) {
                timers.remove(&owned);
            }
        });

        if let Some(previous) = timers.insert(key.to_string(), Timer { revision, handle }) {
            previous.handle.abort();
        }
    }

    /// Drop the timer of `key` unless it belongs to a write newer than
    /// `revision`.
    pub fn cancel_through(&self, key: &str, revision: u64) {
        let mut timers = self.timers.lock();
        if timers.get(key).map(|t| t.revision <= revision) == Some(true) {
            if let Some(timer) = timers.remove(key) {
                timer.handle.abort();
            }
        }
    }

    /// Number of timers that have not fired yet.
    pub fn pending(&self) -> usize {
        self.timers.lock().len()
    }

    /// Abort every timer and wait for the tasks to wind down.
    pub async fn shutdown(&self) {
        let timers: Vec<Timer> = self.timers.lock().drain().map(|(_, t)| t).collect();
        for timer in timers {
            timer.handle.abort();
            let _ = timer.handle.await;
        }
    }
}
