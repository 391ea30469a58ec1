use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use stash_core::{
    default_logger, Connection, EventStream, ItemStream, Logger, SetOption, Store, StoreError,
    StoreResult, TaskRegistry,
};
use stash_encoding::{Coder, KeyCodec, ValueCodec};
use stash_memory::{EventfulMap, InMemory};

use crate::file;

/// Default period between file syncs.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Where the database lives on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Layout {
    /// One JSON document holding every key.
    File(PathBuf),
    /// One file per bucket. Recognized but not supported.
    Dir(PathBuf),
}

/// Options for a JSON file store.
///
/// Defaults to the simple key codec with JSON values and a one second sync.
#[derive(Clone, Debug)]
pub struct JsonDbConfig {
    layout: Option<Layout>,
    sync_interval: Duration,
    coder: Coder,
    logger: Arc<dyn Logger>,
}

impl JsonDbConfig {
    pub fn new() -> Self {
        Self {
            layout: None,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            coder: Coder::new(KeyCodec::simple(), ValueCodec::Json),
            logger: default_logger(),
        }
    }

    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.layout = Some(Layout::File(path.into()));
        self
    }

    pub fn dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.layout = Some(Layout::Dir(path.into()));
        self
    }

    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// The value codec must be JSON: values are written to the file as-is.
    pub fn coder(mut self, coder: Coder) -> Self {
        self.coder = coder;
        self
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    fn validate(&self) -> StoreResult<PathBuf> {
        let path = match &self.layout {
            None => return Err(StoreError::Configuration("json store needs a file path".into())),
            Some(Layout::Dir(dir)) => {
                return Err(StoreError::Configuration(format!(
                    "directory layout ({}) is not supported",
                    dir.display()
                )))
            }
            Some(Layout::File(path)) if path.as_os_str().is_empty() => {
                return Err(StoreError::Configuration("json store needs a file path".into()))
            }
            Some(Layout::File(path)) => path.clone(),
        };
        if *self.coder.values() != ValueCodec::Json {
            return Err(StoreError::Configuration(format!(
                "json store cannot persist {} values",
                self.coder.values().name()
            )));
        }
        if self.sync_interval.is_zero() {
            return Err(StoreError::Configuration(
                "sync interval must be positive".into(),
            ));
        }
        Ok(path)
    }

    /// Load the file and start the sync ticker. Must run inside a tokio
    /// runtime.
    pub fn build(&self) -> StoreResult<JsonDb> {
        let path = self.validate()?;
        let entries = file::load(&path)?;
        let map = Arc::new(EventfulMap::new());
        let loaded = entries.len();
        map.load(entries);
        self.logger
            .info(format_args!("loaded {loaded} keys from {}", path.display()));

        let db = JsonDb {
            memory: InMemory::with_map(Arc::clone(&map), Arc::clone(&self.logger)),
            sync: Syncer {
                saved_revision: Arc::new(AtomicU64::new(map.revision())),
                map,
                path,
                writing: Arc::new(tokio::sync::Mutex::new(())),
                logger: Arc::clone(&self.logger),
            },
            tasks: TaskRegistry::new(),
            closed: AtomicBool::new(false),
        };
        db.start_ticker(self.sync_interval);
        Ok(db)
    }

    pub fn connect(self) -> StoreResult<Connection> {
        let db = self.build()?;
        Ok(Connection::new(Arc::new(db), self.coder, self.logger))
    }
}

impl Default for JsonDbConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory store mirrored to a JSON file.
///
/// The file is rewritten in full on every tick that follows a change, and
/// once more on close.
#[derive(Debug)]
pub struct JsonDb {
    memory: InMemory,
    sync: Syncer,
    tasks: TaskRegistry,
    closed: AtomicBool,
}

impl JsonDb {
    pub fn path(&self) -> &Path {
        &self.sync.path
    }

    /// Write the file now.
    pub async fn save(&self) -> StoreResult<()> {
        self.sync.save().await
    }

    fn start_ticker(&self, every: Duration) {
        let sync = self.sync.clone();
        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if sync.is_current() {
                    continue;
                }
                if let Err(e) = sync.save().await {
                    sync.logger
                        .error(format_args!("sync of {} failed: {e}", sync.path.display()));
                }
            }
        });
    }
}

/// Everything a save needs, shared between the store and its ticker.
#[derive(Clone, Debug)]
struct Syncer {
    map: Arc<EventfulMap>,
    path: PathBuf,
    saved_revision: Arc<AtomicU64>,
    writing: Arc<tokio::sync::Mutex<()>>,
    logger: Arc<dyn Logger>,
}

impl Syncer {
    fn is_current(&self) -> bool {
        self.saved_revision.load(Ordering::Acquire) == self.map.revision()
    }

    /// Snapshot the map, then render and write it on the blocking pool.
    ///
    /// The write guard travels with the blocking job, so a write orphaned by
    /// a cancelled ticker still finishes before the next snapshot is taken.
    async fn save(&self) -> StoreResult<()> {
        let guard = Arc::clone(&self.writing).lock_owned().await;
        let revision = self.map.revision();
        let snapshot = self.map.snapshot();
        let path = self.path.clone();
        let logger = Arc::clone(&self.logger);
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let contents = file::render(&snapshot, logger.as_ref())?;
            file::write_atomic(&path, &contents)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        self.saved_revision.store(revision, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl Store for JsonDb {
    fn name(&self) -> &'static str {
        "json"
    }

    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.memory.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, options: &[SetOption]) -> StoreResult<()> {
        self.memory.set(key, value, options).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.memory.exists(key).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.memory.delete(key).await
    }

    async fn len(&self, prefix: &str) -> StoreResult<usize> {
        self.memory.len(prefix).await
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.memory.keys(prefix).await
    }

    async fn values(&self, prefix: &str) -> StoreResult<Vec<Vec<u8>>> {
        self.memory.values(prefix).await
    }

    async fn iter(&self, cancel: &CancellationToken, prefix: &str) -> StoreResult<ItemStream> {
        self.memory.iter(cancel, prefix).await
    }

    async fn watch(&self, cancel: &CancellationToken, prefix: &str) -> StoreResult<EventStream> {
        self.memory.watch(cancel, prefix).await
    }

    async fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.tasks.shutdown().await;
        self.memory.close().await?;
        self.save().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use stash_core::{MemoryLogger, NoopLogger};

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct User {
        name: String,
    }

    fn config(path: &Path) -> JsonDbConfig {
        JsonDbConfig::new().file(path).logger(Arc::new(NoopLogger))
    }

    #[tokio::test]
    async fn close_persists_and_reopen_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");

        let c = config(&path).connect().unwrap();
        let users = c.bucket(&["users"]).unwrap();
        users.set("1", &User { name: "ada".into() }, &[]).await.unwrap();
        c.close().await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\t\"[users]//1\": {"), "{text}");

        let c = config(&path).connect().unwrap();
        let users = c.bucket(&["users"]).unwrap();
        assert_eq!(users.get::<User>("1").await.unwrap().name, "ada");
        c.close().await.unwrap();
    }

    #[tokio::test]
    async fn ticker_syncs_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        let c = config(&path)
            .sync_interval(Duration::from_millis(20))
            .connect()
            .unwrap();
        c.set("k", &1, &[]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"k\": 1"));
        c.close().await.unwrap();
    }

    #[tokio::test]
    async fn non_json_value_does_not_block_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        let log = MemoryLogger::new();
        let c = JsonDbConfig::new()
            .file(&path)
            .sync_interval(Duration::from_millis(20))
            .logger(log.clone())
            .connect()
            .unwrap();
        c.set_raw("bin", vec![0xff, 0x00], &[]).await.unwrap();
        c.set("k", &1u32, &[]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"k\": 1"), "{text}");
        assert!(!log.contains("ERROR", "sync of"));

        c.set("k", &2u32, &[]).await.unwrap();
        c.close().await.unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"bin\": null"), "{text}");
        assert!(text.contains("\"k\": 2"), "{text}");
        assert!(log.contains("WARN", "\"bin\""));
    }

    #[tokio::test]
    async fn empty_value_survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");

        let c = config(&path).connect().unwrap();
        c.set_raw("e", Vec::new(), &[]).await.unwrap();
        assert_eq!(c.get::<User>("e").await.unwrap(), User::default());
        c.close().await.unwrap();

        let c = config(&path).connect().unwrap();
        assert!(c.get_raw("e").await.unwrap().is_empty());
        assert_eq!(c.get::<User>("e").await.unwrap(), User::default());
        c.close().await.unwrap();
    }

    #[tokio::test]
    async fn explicit_save_writes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let db = config(&dir.path().join("db.json")).build().unwrap();
        db.set("k", b"7".to_vec(), &[]).await.unwrap();
        db.save().await.unwrap();
        let text = std::fs::read_to_string(db.path()).unwrap();
        assert!(text.contains("\"k\": 7"), "{text}");
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db = config(&dir.path().join("db.json")).build().unwrap();
        db.close().await.unwrap();
        db.close().await.unwrap();
        assert!(db.path().exists());
    }

    #[tokio::test]
    async fn ttl_and_watch_work_through_the_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let c = config(&dir.path().join("db.json")).connect().unwrap();
        let cancel = CancellationToken::new();
        let mut events = c.watch::<i32>(&cancel, "").await.unwrap();
        c.set("t", &5, &[SetOption::Ttl(Duration::from_millis(20))])
            .await
            .unwrap();
        assert_eq!(events.recv().await.unwrap().key(), "t");
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!c.exists("t").await.unwrap());
        c.close().await.unwrap();
    }

    #[test]
    fn dir_layout_is_rejected() {
        let err = JsonDbConfig::new().dir("/tmp/stash").build().unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));
    }

    #[test]
    fn missing_path_is_rejected() {
        let err = JsonDbConfig::new().build().unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));
    }

    #[test]
    fn non_json_values_are_rejected() {
        let err = JsonDbConfig::new()
            .file("db.json")
            .coder(Coder::new(KeyCodec::simple(), ValueCodec::Cbor))
            .build()
            .unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));
    }

    #[tokio::test]
    async fn corrupt_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(matches!(
            config(&path).build(),
            Err(StoreError::Serialization(_))
        ));
    }
}
