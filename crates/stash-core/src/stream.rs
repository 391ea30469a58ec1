//! Background producers for iterate and watch, and the registry that owns
//! them.
//!
//! Every producer runs as a tokio task writing into a bounded channel. It
//! stops when the caller's token is cancelled, when the consumer drops its
//! receiver, or when the registry shuts down, whichever comes first.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::event::{Event, ItemResult};

/// Buffer size of every iterate and watch channel.
pub const STREAM_CAPACITY: usize = 10;

/// Raw iteration stream from a backend.
///
/// A producer that cannot finish sends one error, keyed by the prefix it was
/// scanning, and stops.
pub type ItemStream = mpsc::Receiver<ItemResult<Vec<u8>>>;

/// Raw change stream from a backend.
pub type EventStream = mpsc::Receiver<Event>;

/// Owns the background tasks of one store so `close` can stop and join them.
#[derive(Debug)]
pub struct TaskRegistry {
    shutdown: CancellationToken,
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            next_id: AtomicU64::new(0),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Token cancelled when the registry shuts down.
    pub fn token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run `task` until it finishes or the registry shuts down.
    pub fn spawn<Fut>(&self, task: Fut) -> u64
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        self.track(tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = task => {}
            }
        }))
    }

    /// Start a producer feeding a fresh bounded channel and return its
    /// receiver.
    ///
    /// The producer is dropped mid-flight once `cancel` fires, the receiver
    /// is dropped, or the registry shuts down.
    pub fn spawn_feed<T, F, Fut>(&self, cancel: &CancellationToken, producer: F) -> mpsc::Receiver<T>
    where
        T: Send + 'static,
        F: FnOnce(mpsc::Sender<T>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let watched = tx.clone();
        let cancel = cancel.clone();
        let shutdown = self.shutdown.clone();
        let feed = producer(tx);
        self.track(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = shutdown.cancelled() => {}
                _ = watched.closed() => {}
                _ = feed => {}
            }
        }));
        rx
    }

    /// Number of tasks that have not finished yet.
    pub fn active(&self) -> usize {
        self.tasks
            .lock()
            .values()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Cancel every task and wait for all of them to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            // Cancelled or panicked producers have nothing left to report.
            let _ = handle.await;
        }
    }

    fn track(&self, handle: JoinHandle<()>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, h| !h.is_finished());
        tasks.insert(id, handle);
        id
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
