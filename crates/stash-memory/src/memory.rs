use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use stash_core::{
    default_logger, ttl_of, Connection, Event, EventStream, Item, ItemStream, Logger, SetOption,
    Store, StoreError, StoreResult, TaskRegistry,
};
use stash_encoding::{Coder, KeyCodec, ValueCodec};

use crate::map::{EventfulMap, DEFAULT_EVENT_CAPACITY};
use crate::ttl::TtlTimers;

/// Store backed by an [`EventfulMap`].
///
/// Supports [`SetOption::Ttl`]. [`SetOption::Lease`] is logged as
/// unsupported and ignored.
#[derive(Debug)]
pub struct InMemory {
    map: Arc<EventfulMap>,
    timers: TtlTimers,
    tasks: TaskRegistry,
    logger: Arc<dyn Logger>,
}

impl InMemory {
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self::with_map(Arc::new(EventfulMap::new()), logger)
    }

    /// A store over an existing map, e.g. one preloaded from disk.
    pub fn with_map(map: Arc<EventfulMap>, logger: Arc<dyn Logger>) -> Self {
        Self {
            map,
            timers: TtlTimers::new(Arc::clone(&logger)),
            tasks: TaskRegistry::new(),
            logger,
        }
    }

    pub fn map(&self) -> &Arc<EventfulMap> {
        &self.map
    }

    /// Background producers and timers still alive.
    pub fn background_tasks(&self) -> usize {
        self.tasks.active() + self.timers.pending()
    }
}

#[async_trait]
impl Store for InMemory {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.map.get(key).ok_or_else(|| StoreError::not_found(key))
    }

    async fn set(&self, key: &str, value: Vec<u8>, options: &[SetOption]) -> StoreResult<()> {
        for option in options {
            if !matches!(option, SetOption::Ttl(_)) {
                let err = StoreError::UnsupportedOption {
                    option: option.name(),
                    backend: self.name(),
                };
                self.logger.warn(format_args!("{err}"));
            }
        }

        let revision = self.map.insert(key, value);
        match ttl_of(options) {
            Some(after) => self.timers.schedule(&self.map, key, revision, after),
            None => self.timers.cancel_through(key, revision),
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.map.contains(key))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        if let Some(revision) = self.map.remove(key) {
            self.timers.cancel_through(key, revision);
        }
        Ok(())
    }

    async fn len(&self, prefix: &str) -> StoreResult<usize> {
        Ok(self.map.count(prefix))
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self.map.keys(prefix))
    }

    async fn values(&self, prefix: &str) -> StoreResult<Vec<Vec<u8>>> {
        Ok(self.map.values(prefix))
    }

    async fn iter(&self, cancel: &CancellationToken, prefix: &str) -> StoreResult<ItemStream> {
        let items = self.map.scan(prefix);
        Ok(self.tasks.spawn_feed(cancel, |tx| async move {
            for (key, value) in items {
                if tx.send(Ok(Item { key, value })).await.is_err() {
                    return;
                }
            }
        }))
    }

    async fn watch(&self, cancel: &CancellationToken, prefix: &str) -> StoreResult<EventStream> {
        let mut feed = self.map.subscribe();
        let prefix = prefix.to_string();
        let logger = Arc::clone(&self.logger);
        Ok(self.tasks.spawn_feed(cancel, |tx| async move {
            loop {
                let event = match feed.recv().await {
                    Ok(event) if event.key().starts_with(&prefix) => event,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(missed)) => {
                        logger.warn(format_args!("watcher on {prefix:?} lagged by {missed} events"));
                        Event::Error {
                            key: prefix.clone(),
                            message: format!("watcher lagged, {missed} events dropped"),
                        }
                    }
                    Err(RecvError::Closed) => return,
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }))
    }

    async fn close(&self) -> StoreResult<()> {
        self.timers.shutdown().await;
        self.tasks.shutdown().await;
        Ok(())
    }
}

/// Options for an in-memory [`Connection`].
///
/// Defaults to the binary key codec with CBOR values.
#[derive(Clone, Debug)]
pub struct MemoryConfig {
    coder: Coder,
    logger: Arc<dyn Logger>,
    event_capacity: usize,
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self {
            coder: Coder::new(KeyCodec::binary(), ValueCodec::Cbor),
            logger: default_logger(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn coder(mut self, coder: Coder) -> Self {
        self.coder = coder;
        self
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Buffer of the change feed shared by all watchers.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Build the bare store.
    pub fn build(&self) -> StoreResult<InMemory> {
        if self.event_capacity == 0 {
            return Err(StoreError::Configuration(
                "event capacity must be positive".into(),
            ));
        }
        let map = Arc::new(EventfulMap::with_capacity(self.event_capacity));
        Ok(InMemory::with_map(map, Arc::clone(&self.logger)))
    }

    pub fn connect(self) -> StoreResult<Connection> {
        let store = self.build()?;
        Ok(Connection::new(Arc::new(store), self.coder, self.logger))
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::new()
    }
}
