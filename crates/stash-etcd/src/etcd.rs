//! The etcd [`Store`] and its configuration.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use stash_core::{
    default_logger, Connection, Event, EventStream, Item, ItemError, ItemStream, Logger, SetOption,
    Store, StoreError, StoreResult, TaskRegistry,
};
use stash_encoding::{Coder, KeyCodec, ValueCodec};

use crate::client::{Gateway, LineReader};
use crate::node::{self, EtcdNode, NodeConfig};
use crate::wire::{
    b64, key_string, parse_watch_line, prefix_range, unb64, DeleteRangeRequest, Ignored,
    LeaseGrantRequest, LeaseGrantResponse, PutRequest, RangeRequest, RangeResponse, WatchRequest,
    WatchUpdate,
};

/// Keys fetched per range request when scanning.
pub const PAGE_SIZE: i64 = 1000;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Lease length for a TTL: whole seconds rounded up, at least one.
pub fn lease_seconds(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
}

/// Options for an etcd-backed [`Connection`].
///
/// Defaults to the simple key codec with JSON values.
#[derive(Clone, Debug)]
pub struct EtcdConfig {
    endpoints: Vec<String>,
    node: Option<NodeConfig>,
    request_timeout: Duration,
    coder: Coder,
    logger: Arc<dyn Logger>,
}

impl EtcdConfig {
    pub fn new() -> Self {
        Self {
            endpoints: Vec::new(),
            node: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            coder: Coder::new(KeyCodec::simple(), ValueCodec::Json),
            logger: default_logger(),
        }
    }

    pub fn endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoints.extend(endpoints.into_iter().map(Into::into));
        self
    }

    /// Start a local member first and talk to the resulting cluster.
    pub fn node(mut self, node: NodeConfig) -> Self {
        self.node = Some(node);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn coder(mut self, coder: Coder) -> Self {
        self.coder = coder;
        self
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub async fn build(&self) -> StoreResult<Etcd> {
        let mut endpoints = self.endpoints.clone();
        let node = match &self.node {
            Some(config) => {
                let node = node::start(config, &self.logger).await?;
                endpoints.extend(node.client_urls().iter().cloned());
                Some(node)
            }
            None => None,
        };
        let gateway = Gateway::new(&endpoints, self.request_timeout)?;
        self.logger
            .info(format_args!("etcd endpoints: {:?}", gateway.endpoints()));
        Ok(Etcd {
            gateway: Arc::new(gateway),
            tasks: TaskRegistry::new(),
            node: Mutex::new(node),
            logger: Arc::clone(&self.logger),
        })
    }

    pub async fn connect(self) -> StoreResult<Connection> {
        let store = self.build().await?;
        Ok(Connection::new(Arc::new(store), self.coder, self.logger))
    }
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Store on an etcd cluster.
///
/// TTLs become leases: each `set` with [`SetOption::Ttl`] grants a fresh
/// lease and attaches the key to it. A later `set` without one detaches the
/// key, so an old lease never removes a newer value.
#[derive(Debug)]
pub struct Etcd {
    gateway: Arc<Gateway>,
    tasks: TaskRegistry,
    node: Mutex<Option<EtcdNode>>,
    logger: Arc<dyn Logger>,
}

impl Etcd {
    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    async fn grant_lease(&self, ttl: Duration) -> StoreResult<i64> {
        let grant: LeaseGrantResponse = self
            .gateway
            .call(
                "/v3/lease/grant",
                &LeaseGrantRequest {
                    ttl: lease_seconds(ttl),
                },
            )
            .await?;
        Ok(grant.id)
    }

    async fn count(&self, request: RangeRequest) -> StoreResult<usize> {
        let response: RangeResponse = self
            .gateway
            .call(
                "/v3/kv/range",
                &RangeRequest {
                    count_only: true,
                    ..request
                },
            )
            .await?;
        Ok(usize::try_from(response.count).unwrap_or(0))
    }
}

/// All pairs under `prefix`, fetched page by page.
async fn scan(gateway: &Gateway, prefix: &str, keys_only: bool) -> StoreResult<Vec<(String, Vec<u8>)>> {
    let mut out = Vec::new();
    let mut pages = Pager::new(prefix, keys_only);
    while let Some(page) = pages.next(gateway).await? {
        out.extend(page);
    }
    Ok(out)
}

struct Pager {
    from: Vec<u8>,
    range_end: Vec<u8>,
    keys_only: bool,
    done: bool,
}

impl Pager {
    fn new(prefix: &str, keys_only: bool) -> Self {
        let (from, range_end) = prefix_range(prefix);
        Self {
            from,
            range_end,
            keys_only,
            done: false,
        }
    }

    async fn next(&mut self, gateway: &Gateway) -> StoreResult<Option<Vec<(String, Vec<u8>)>>> {
        if self.done {
            return Ok(None);
        }
        let response: RangeResponse = gateway
            .call(
                "/v3/kv/range",
                &RangeRequest {
                    limit: PAGE_SIZE,
                    keys_only: self.keys_only,
                    ..RangeRequest::range(&self.from, &self.range_end)
                },
            )
            .await?;
        let mut page = Vec::with_capacity(response.kvs.len());
        for kv in &response.kvs {
            page.push((key_string(&kv.key)?, unb64(&kv.value)?));
        }
        match page.last() {
            Some((last, _)) if response.more => {
                let mut from = last.as_bytes().to_vec();
                from.push(0);
                self.from = from;
            }
            _ => self.done = true,
        }
        Ok(Some(page))
    }
}

#[async_trait]
impl Store for Etcd {
    fn name(&self) -> &'static str {
        "etcd"
    }

    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        let response: RangeResponse = self
            .gateway
            .call("/v3/kv/range", &RangeRequest::key(key))
            .await?;
        match response.kvs.first() {
            Some(kv) => unb64(&kv.value),
            None => Err(StoreError::not_found(key)),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, options: &[SetOption]) -> StoreResult<()> {
        let mut lease = 0;
        for option in options {
            match option {
                SetOption::Ttl(ttl) => lease = self.grant_lease(*ttl).await?,
                SetOption::Lease(id) => lease = *id,
                other => {
                    let err = StoreError::UnsupportedOption {
                        option: other.name(),
                        backend: self.name(),
                    };
                    self.logger.warn(format_args!("{err}"));
                }
            }
        }
        let _: Ignored = self
            .gateway
            .call(
                "/v3/kv/put",
                &PutRequest {
                    key: b64(key.as_bytes()),
                    value: b64(&value),
                    lease,
                },
            )
            .await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.count(RangeRequest::key(key)).await? > 0)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let _: Ignored = self
            .gateway
            .call(
                "/v3/kv/deleterange",
                &DeleteRangeRequest {
                    key: b64(key.as_bytes()),
                },
            )
            .await?;
        Ok(())
    }

    async fn len(&self, prefix: &str) -> StoreResult<usize> {
        let (from, range_end) = prefix_range(prefix);
        self.count(RangeRequest::range(&from, &range_end)).await
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let pairs = scan(&self.gateway, prefix, true).await?;
        Ok(pairs.into_iter().map(|(k, _)| k).collect())
    }

    async fn values(&self, prefix: &str) -> StoreResult<Vec<Vec<u8>>> {
        let pairs = scan(&self.gateway, prefix, false).await?;
        Ok(pairs.into_iter().map(|(_, v)| v).collect())
    }

    /// The first page is fetched before returning, so a cluster that cannot
    /// serve the scan at all fails the call. A later page that fails ends the
    /// stream with one error item.
    async fn iter(&self, cancel: &CancellationToken, prefix: &str) -> StoreResult<ItemStream> {
        let gateway = Arc::clone(&self.gateway);
        let mut pages = Pager::new(prefix, false);
        let first = pages.next(&gateway).await?.unwrap_or_default();
        let prefix = prefix.to_string();
        let logger = Arc::clone(&self.logger);
        Ok(self.tasks.spawn_feed(cancel, |tx| async move {
            let mut page = first;
            loop {
                for (key, value) in page {
                    if tx.send(Ok(Item { key, value })).await.is_err() {
                        return;
                    }
                }
                page = match pages.next(&gateway).await {
                    Ok(Some(page)) => page,
                    Ok(None) => return,
                    Err(e) => {
                        logger.error(format_args!("iteration of {prefix:?} stopped: {e}"));
                        let _ = tx
                            .send(Err(ItemError {
                                key: prefix,
                                message: format!("iteration stopped: {e}"),
                            }))
                            .await;
                        return;
                    }
                };
            }
        }))
    }

    async fn watch(&self, cancel: &CancellationToken, prefix: &str) -> StoreResult<EventStream> {
        let chunks = self
            .gateway
            .stream("/v3/watch", &WatchRequest::prefix(prefix))
            .await?;
        let mut lines = LineReader::new(chunks);

        // Hold the call until the server confirms the watch is in place.
        loop {
            let line = match lines.next_line().await {
                Some(line) => line?,
                None => {
                    return Err(StoreError::BackendUnavailable(
                        "watch stream closed before creation".into(),
                    ))
                }
            };
            match parse_watch_line(&line, prefix) {
                WatchUpdate::Created => break,
                WatchUpdate::Failed(reason) => return Err(StoreError::BackendUnavailable(reason)),
                WatchUpdate::Events(_) => continue,
            }
        }

        let prefix = prefix.to_string();
        let logger = Arc::clone(&self.logger);
        Ok(self.tasks.spawn_feed(cancel, |tx| async move {
            while let Some(line) = lines.next_line().await {
                let events = match line {
                    Ok(line) => match parse_watch_line(&line, &prefix) {
                        WatchUpdate::Events(events) => events,
                        WatchUpdate::Created => continue,
                        WatchUpdate::Failed(reason) => vec![Event::Error {
                            key: prefix.clone(),
                            message: reason,
                        }],
                    },
                    Err(e) => vec![Event::Error {
                        key: prefix.clone(),
                        message: e.to_string(),
                    }],
                };
                for event in events {
                    if let Event::Error { message, .. } = &event {
                        logger.warn(format_args!("watch on {prefix:?}: {message}"));
                    }
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }))
    }

    async fn close(&self) -> StoreResult<()> {
        self.tasks.shutdown().await;
        let node = self.node.lock().take();
        if let Some(mut node) = node {
            self.logger.info(format_args!("stopping etcd {}", node.name()));
            node.stop().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeEtcd;
    use serde::{Deserialize, Serialize};
    use stash_core::{MemoryLogger, TypedEvents};

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct User {
        name: String,
    }

    async fn next(events: &mut TypedEvents<i32>) -> Option<Event<i32>> {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
    }

    async fn connect(fake: &FakeEtcd) -> Connection {
        EtcdConfig::new()
            .endpoints([fake.endpoint.clone()])
            .connect()
            .await
            .unwrap()
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    #[test]
    fn lease_seconds_round_up() {
        assert_eq!(lease_seconds(Duration::from_millis(1)), 1);
        assert_eq!(lease_seconds(Duration::ZERO), 1);
        assert_eq!(lease_seconds(Duration::from_secs(2)), 2);
        assert_eq!(lease_seconds(Duration::from_millis(2001)), 3);
    }

    #[tokio::test]
    async fn build_without_endpoints_fails() {
        let err = EtcdConfig::new().build().await.unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)), "{err:?}");
    }

    // -----------------------------------------------------------------------
    // Key/value operations
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn set_get_roundtrip() {
        let fake = FakeEtcd::start().await;
        let c = connect(&fake).await;
        c.set("user/1", &User { name: "ada".into() }, &[])
            .await
            .unwrap();
        let got: User = c.get("user/1").await.unwrap();
        assert_eq!(got.name, "ada");
        assert_eq!(c.backend(), "etcd");
        assert_eq!(fake.state.lease_of("user/1"), Some(0));
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let fake = FakeEtcd::start().await;
        let c = connect(&fake).await;
        let err = c.get::<User>("nope").await.unwrap_err();
        assert!(err.is_not_found(), "{err:?}");
        assert!(!c.exists("nope").await.unwrap());
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let fake = FakeEtcd::start().await;
        let c = connect(&fake).await;
        c.set("k", &1, &[]).await.unwrap();
        assert!(c.exists("k").await.unwrap());
        c.delete("k").await.unwrap();
        assert!(!c.exists("k").await.unwrap());
        // Deleting again is not an error.
        c.delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn prefix_queries() {
        let fake = FakeEtcd::start().await;
        let c = connect(&fake).await;
        for (k, v) in [("user/1", 1), ("user/2", 2), ("users", 3), ("order/1", 4)] {
            c.set(k, &v, &[]).await.unwrap();
        }
        assert_eq!(c.keys("user/").await.unwrap(), vec!["user/1", "user/2"]);
        assert_eq!(c.values::<i32>("user/").await.unwrap(), vec![1, 2]);
        assert_eq!(c.len("user/").await.unwrap(), 2);
        assert_eq!(c.len("").await.unwrap(), 4);
        assert_eq!(c.keys("").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn scans_span_several_pages() {
        let fake = FakeEtcd::start().await;
        let c = connect(&fake).await;
        let total = PAGE_SIZE as usize + 5;
        for i in 0..total {
            c.set(&format!("n/{i:05}"), &i, &[]).await.unwrap();
        }
        let keys = c.keys("n/").await.unwrap();
        assert_eq!(keys.len(), total);
        assert_eq!(keys.last().map(String::as_str), Some("n/01004"));

        let cancel = CancellationToken::new();
        let items = c.iter::<usize>(&cancel, "n/").await.unwrap().collect_all().await;
        assert_eq!(items.len(), total);
        assert!(items.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn failed_page_ends_the_stream_with_an_error() {
        let fake = FakeEtcd::start().await;
        let c = connect(&fake).await;
        let page = PAGE_SIZE as usize;
        for i in 0..page + 5 {
            c.set(&format!("n/{i:05}"), &i, &[]).await.unwrap();
        }

        fake.state.fail_ranges_after(1);
        let cancel = CancellationToken::new();
        let items = c.iter::<usize>(&cancel, "n/").await.unwrap().collect_all().await;
        assert_eq!(items.len(), page + 1);
        assert!(items[..page].iter().all(Result::is_ok));
        let err = items[page].as_ref().unwrap_err();
        assert_eq!(err.key, "n/");
        assert!(err.message.contains("iteration stopped"), "{err}");

        fake.state.fail_ranges_after(1);
        let err = c.to_map::<usize>("n/").await.unwrap_err();
        assert!(matches!(err, StoreError::BackendUnavailable(_)), "{err:?}");
    }

    #[tokio::test]
    async fn failed_first_page_fails_the_call() {
        let fake = FakeEtcd::start().await;
        let c = connect(&fake).await;
        c.set("n/1", &1, &[]).await.unwrap();
        fake.state.fail_ranges_after(0);
        let cancel = CancellationToken::new();
        let err = match c.iter::<i32>(&cancel, "n/").await {
            Ok(_) => panic!("iteration should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, StoreError::BackendUnavailable(_)), "{err:?}");
    }

    #[tokio::test]
    async fn buckets_use_simple_keys() {
        let fake = FakeEtcd::start().await;
        let c = connect(&fake).await;
        let users = c.bucket(&["users"]).unwrap();
        users.set("1", &User { name: "bo".into() }, &[]).await.unwrap();
        assert_eq!(c.keys("").await.unwrap(), vec!["[users]//1"]);
        assert_eq!(users.keys().await.unwrap(), vec!["1"]);
    }

    // -----------------------------------------------------------------------
    // Leases
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn ttl_attaches_a_lease_that_expires() {
        let fake = FakeEtcd::start().await;
        let c = connect(&fake).await;
        c.set("session", &"abc", &[SetOption::Ttl(Duration::from_millis(50))])
            .await
            .unwrap();
        assert!(fake.state.lease_of("session").unwrap() > 0);
        assert!(c.exists("session").await.unwrap());

        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert!(!c.exists("session").await.unwrap());
    }

    #[tokio::test]
    async fn explicit_lease_is_passed_through() {
        let fake = FakeEtcd::start().await;
        let c = connect(&fake).await;
        c.set("k", &1, &[SetOption::Lease(42)]).await.unwrap();
        assert_eq!(fake.state.lease_of("k"), Some(42));
    }

    #[tokio::test]
    async fn overwrite_without_ttl_detaches_lease() {
        let fake = FakeEtcd::start().await;
        let c = connect(&fake).await;
        c.set("k", &1, &[SetOption::Ttl(Duration::from_secs(1))])
            .await
            .unwrap();
        c.set("k", &2, &[]).await.unwrap();
        assert_eq!(fake.state.lease_of("k"), Some(0));

        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert_eq!(c.get::<i32>("k").await.unwrap(), 2);
    }

    // -----------------------------------------------------------------------
    // Watch and failover
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn watch_sees_puts_and_deletes() {
        let fake = FakeEtcd::start().await;
        let c = connect(&fake).await;
        let cancel = CancellationToken::new();
        let mut events = c.watch::<i32>(&cancel, "w/").await.unwrap();

        c.set("w/a", &1, &[]).await.unwrap();
        c.set("other", &9, &[]).await.unwrap();
        c.delete("w/a").await.unwrap();

        assert_eq!(
            next(&mut events).await,
            Some(Event::Put {
                key: "w/a".into(),
                value: 1
            })
        );
        assert_eq!(
            next(&mut events).await,
            Some(Event::Delete { key: "w/a".into() })
        );

        cancel.cancel();
        let end = tokio::time::timeout(Duration::from_secs(1), events.recv()).await;
        assert_eq!(end.unwrap(), None);
    }

    #[tokio::test]
    async fn dead_endpoint_fails_over() {
        let fake = FakeEtcd::start().await;
        let log = MemoryLogger::new();
        let c = EtcdConfig::new()
            .endpoints(["http://127.0.0.1:9".to_string(), fake.endpoint.clone()])
            .request_timeout(Duration::from_secs(1))
            .logger(log.clone())
            .connect()
            .await
            .unwrap();
        c.set("k", &7, &[]).await.unwrap();
        assert_eq!(c.get::<i32>("k").await.unwrap(), 7);
        assert!(log.contains("INFO", "etcd endpoints"));
    }

    #[tokio::test]
    async fn close_stops_background_work() {
        let fake = FakeEtcd::start().await;
        let store = EtcdConfig::new()
            .endpoints([fake.endpoint.clone()])
            .build()
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let mut events = store.watch(&cancel, "").await.unwrap();
        store.close().await.unwrap();
        let end = tokio::time::timeout(Duration::from_secs(1), events.recv()).await;
        assert_eq!(end.unwrap(), None);
    }
}
