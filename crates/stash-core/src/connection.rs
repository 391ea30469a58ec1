//! The typed facade over one [`Store`].

use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use stash_encoding::Coder;

use crate::adapter::{TypedEvents, TypedItems};
use crate::bucket::Bucket;
use crate::error::{StoreError, StoreResult};
use crate::locks::PrefixLocks;
use crate::logger::Logger;
use crate::options::SetOption;
use crate::stream::{EventStream, ItemStream};
use crate::traits::Store;

struct Inner {
    store: Arc<dyn Store>,
    coder: Arc<Coder>,
    locks: PrefixLocks,
    logger: Arc<dyn Logger>,
    closed: AtomicBool,
}

/// A handle to an open store. Cheap to clone; clones share everything.
///
/// Keys passed here are flattened keys. Use [`Connection::key`] to build one
/// from segments, or [`Connection::bucket`] for a namespaced view.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn new(store: Arc<dyn Store>, coder: Coder, logger: Arc<dyn Logger>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                coder: Arc::new(coder),
                locks: PrefixLocks::new(),
                logger,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn backend(&self) -> &'static str {
        self.inner.store.name()
    }

    pub fn coder(&self) -> &Arc<Coder> {
        &self.inner.coder
    }

    pub fn logger(&self) -> &Arc<dyn Logger> {
        &self.inner.logger
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Flatten key segments with the connection's key codec.
    pub fn key<S: AsRef<str>>(&self, segments: &[S]) -> StoreResult<String> {
        Ok(self.inner.coder.keys().encode_key(segments)?)
    }

    // -----------------------------------------------------------------------
    // Single keys
    // -----------------------------------------------------------------------

    pub async fn set<V: Serialize + Any>(
        &self,
        key: &str,
        value: &V,
        options: &[SetOption],
    ) -> StoreResult<()> {
        let bytes = self.inner.coder.encode_value(value)?;
        self.set_raw(key, bytes, options).await
    }

    /// Store bytes as-is, bypassing the value codec.
    pub async fn set_raw(&self, key: &str, value: Vec<u8>, options: &[SetOption]) -> StoreResult<()> {
        self.ensure_open()?;
        self.inner.logger.debug(format_args!("SET {key}"));
        self.inner.store.set(key, value, options).await
    }

    /// Decode the value at `key` into a fresh `V`.
    ///
    /// An empty stored value yields `V::default()`.
    pub async fn get<V: DeserializeOwned + Default + Any>(&self, key: &str) -> StoreResult<V> {
        let mut out = V::default();
        self.get_into(key, &mut out).await?;
        Ok(out)
    }

    /// Decode the value at `key` into `out`. An empty stored value leaves
    /// `out` untouched.
    pub async fn get_into<V: DeserializeOwned + Any>(&self, key: &str, out: &mut V) -> StoreResult<()> {
        let raw = self.get_raw(key).await?;
        self.inner.coder.decode_into(&raw, out)?;
        Ok(())
    }

    pub async fn get_raw(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.ensure_open()?;
        self.inner.logger.debug(format_args!("GET {key}"));
        self.inner.store.get(key).await
    }

    pub async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.ensure_open()?;
        self.inner.logger.debug(format_args!("EXISTS {key}"));
        self.inner.store.exists(key).await
    }

    pub async fn delete(&self, key: &str) -> StoreResult<()> {
        self.ensure_open()?;
        self.inner.logger.debug(format_args!("DELETE {key}"));
        self.inner.store.delete(key).await
    }

    // -----------------------------------------------------------------------
    // Prefix scans
    // -----------------------------------------------------------------------

    pub async fn len(&self, prefix: &str) -> StoreResult<usize> {
        self.ensure_open()?;
        self.inner.logger.debug(format_args!("LEN {prefix}"));
        self.inner.store.len(prefix).await
    }

    pub async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.ensure_open()?;
        self.inner.logger.debug(format_args!("KEYS {prefix}"));
        self.inner.store.keys(prefix).await
    }

    pub async fn raw_values(&self, prefix: &str) -> StoreResult<Vec<Vec<u8>>> {
        self.ensure_open()?;
        self.inner.logger.debug(format_args!("VALUES {prefix}"));
        self.inner.store.values(prefix).await
    }

    /// Decoded values under `prefix`. Fails on the first undecodable one.
    pub async fn values<V: DeserializeOwned + Default + Any>(&self, prefix: &str) -> StoreResult<Vec<V>> {
        self.raw_values(prefix)
            .await?
            .iter()
            .map(|raw| self.inner.coder.decode::<V>(raw).map_err(StoreError::from))
            .collect()
    }

    /// Every pair under `prefix`, decoded. Fails on the first undecodable
    /// value, or when the backend cannot finish the scan.
    pub async fn to_map<V: DeserializeOwned + Default + Any>(
        &self,
        prefix: &str,
    ) -> StoreResult<BTreeMap<String, V>> {
        let raw = self.iter_raw(&CancellationToken::new(), prefix).await?;
        self.decode_map(raw, None).await
    }

    /// Decode every value under `prefix` to JSON and log it at info level.
    pub async fn dump(&self, prefix: &str) -> StoreResult<BTreeMap<String, serde_json::Value>> {
        let dump = self.to_map::<serde_json::Value>(prefix).await?;
        let pretty = serde_json::to_string_pretty(&dump)?;
        self.inner.logger.info(format_args!("DUMP {prefix}\n{pretty}"));
        Ok(dump)
    }

    // -----------------------------------------------------------------------
    // Streams
    // -----------------------------------------------------------------------

    pub async fn iter_raw(&self, cancel: &CancellationToken, prefix: &str) -> StoreResult<ItemStream> {
        self.ensure_open()?;
        self.inner.logger.debug(format_args!("ITER {prefix}"));
        self.inner.store.iter(cancel, prefix).await
    }

    pub async fn watch_raw(&self, cancel: &CancellationToken, prefix: &str) -> StoreResult<EventStream> {
        self.ensure_open()?;
        self.inner.logger.debug(format_args!("WATCH {prefix}"));
        self.inner.store.watch(cancel, prefix).await
    }

    pub async fn iter<V: DeserializeOwned + Default + Any>(
        &self,
        cancel: &CancellationToken,
        prefix: &str,
    ) -> StoreResult<TypedItems<V>> {
        let raw = self.iter_raw(cancel, prefix).await?;
        Ok(TypedItems::new(raw, Arc::clone(&self.inner.coder), None))
    }

    pub async fn watch<V: DeserializeOwned + Default + Any>(
        &self,
        cancel: &CancellationToken,
        prefix: &str,
    ) -> StoreResult<TypedEvents<V>> {
        let raw = self.watch_raw(cancel, prefix).await?;
        Ok(TypedEvents::new(raw, Arc::clone(&self.inner.coder), None))
    }

    // -----------------------------------------------------------------------
    // Buckets and transactions
    // -----------------------------------------------------------------------

    /// A bucket for `path`. Elements may be bare segments or already
    /// encoded bucket strings; both are flattened into one path.
    pub fn bucket<S: AsRef<str>>(&self, path: &[S]) -> StoreResult<Bucket> {
        let keys = self.inner.coder.keys();
        let segments = keys.decode_bucket(path);
        let prefix = keys.encode_bucket(&segments)?;
        let lock = segments.join(keys.symbols().delimiter);
        Ok(Bucket::new(self.clone(), segments, prefix, lock))
    }

    /// Run `f` with exclusive ownership of the literal `prefix`.
    ///
    /// The same string always takes the same lock; other strings, nested
    /// ones included, are unaffected. `f` receives a bucket wrapping
    /// `prefix` as one segment, reserved symbols and all. A panic inside `f`
    /// releases the lock and surfaces as [`StoreError::TransactionPanicked`].
    pub async fn with_transaction<F, Fut, T>(&self, prefix: &str, f: F) -> StoreResult<T>
    where
        F: FnOnce(Bucket) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let keys = self.inner.coder.keys();
        let bucket = Bucket::new(
            self.clone(),
            vec![prefix.to_string()],
            keys.wrap_bucket(prefix),
            prefix.to_string(),
        );
        self.run_transaction(prefix, bucket, f).await
    }

    pub(crate) async fn run_transaction<F, Fut, T>(
        &self,
        lock: &str,
        bucket: Bucket,
        f: F,
    ) -> StoreResult<T>
    where
        F: FnOnce(Bucket) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        self.ensure_open()?;
        let prefix = lock.to_string();
        self.inner.logger.debug(format_args!("TX {prefix}"));
        let _guard = self.inner.locks.lock(&prefix).await;
        match AssertUnwindSafe(f(bucket)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                self.inner
                    .logger
                    .error(format_args!("transaction on {prefix} panicked"));
                Err(StoreError::TransactionPanicked { prefix })
            }
        }
    }

    pub(crate) async fn decode_map<V: DeserializeOwned + Default + Any>(
        &self,
        mut raw: ItemStream,
        bucket: Option<&str>,
    ) -> StoreResult<BTreeMap<String, V>> {
        let coder = &self.inner.coder;
        let mut out = BTreeMap::new();
        while let Some(item) = raw.recv().await {
            let item = item.map_err(|e| StoreError::BackendUnavailable(e.to_string()))?;
            let value = coder.decode::<V>(&item.value)?;
            let key = match bucket {
                Some(prefix) => coder
                    .keys()
                    .strip_bucket(prefix, &item.key)
                    .map(str::to_string)
                    .unwrap_or(item.key),
                None => item.key,
            };
            out.insert(key, value);
        }
        Ok(out)
    }

    /// Stop background work, flush, and reject further calls. Idempotent.
    pub async fn close(&self) -> StoreResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner
            .logger
            .info(format_args!("closing {} store", self.backend()));
        self.inner.store.close().await
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("backend", &self.backend())
            .field("coder", &self.inner.coder)
            .field("closed", &self.is_closed())
            .finish()
    }
}
