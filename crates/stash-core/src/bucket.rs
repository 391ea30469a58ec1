//! Namespaced views over a connection.

use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::adapter::{TypedEvents, TypedItems};
use crate::connection::Connection;
use crate::error::{StoreError, StoreResult};
use crate::options::SetOption;

/// Every key of a bucket is stored as `<prefix><delimiter><key>`, where the
/// prefix is the marker-wrapped bucket path. Keys seen through a bucket are
/// relative to it.
#[derive(Clone, Debug)]
pub struct Bucket {
    conn: Connection,
    path: Vec<String>,
    prefix: String,
    lock: String,
}

impl Bucket {
    pub(crate) fn new(conn: Connection, path: Vec<String>, prefix: String, lock: String) -> Self {
        Self {
            conn,
            path,
            prefix,
            lock,
        }
    }

    /// Segments of the bucket path.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// The encoded bucket path.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Flattened store key of `key` in this bucket.
    pub fn full_key(&self, key: &str) -> StoreResult<String> {
        Ok(self.conn.coder().keys().bucket_key(&self.prefix, key)?)
    }

    /// Store prefix shared by every key directly in this bucket.
    pub fn scan_prefix(&self) -> String {
        self.conn.coder().keys().bucket_scan_prefix(&self.prefix)
    }

    fn relative(&self, full: String) -> String {
        match self.conn.coder().keys().strip_bucket(&self.prefix, &full) {
            Some(rel) => rel.to_string(),
            None => full,
        }
    }

    pub async fn set<V: Serialize + Any>(
        &self,
        key: &str,
        value: &V,
        options: &[SetOption],
    ) -> StoreResult<()> {
        self.conn.set(&self.full_key(key)?, value, options).await
    }

    pub async fn set_raw(&self, key: &str, value: Vec<u8>, options: &[SetOption]) -> StoreResult<()> {
        self.conn.set_raw(&self.full_key(key)?, value, options).await
    }

    pub async fn get<V: DeserializeOwned + Default + Any>(&self, key: &str) -> StoreResult<V> {
        self.conn.get(&self.full_key(key)?).await
    }

    pub async fn get_into<V: DeserializeOwned + Any>(&self, key: &str, out: &mut V) -> StoreResult<()> {
        self.conn.get_into(&self.full_key(key)?, out).await
    }

    pub async fn get_raw(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.conn.get_raw(&self.full_key(key)?).await
    }

    pub async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.conn.exists(&self.full_key(key)?).await
    }

    pub async fn delete(&self, key: &str) -> StoreResult<()> {
        self.conn.delete(&self.full_key(key)?).await
    }

    /// Number of keys directly in this bucket.
    pub async fn len(&self) -> StoreResult<usize> {
        self.conn.len(&self.scan_prefix()).await
    }

    /// Bucket-relative keys, ascending.
    pub async fn keys(&self) -> StoreResult<Vec<String>> {
        let keys = self.conn.keys(&self.scan_prefix()).await?;
        Ok(keys.into_iter().map(|k| self.relative(k)).collect())
    }

    pub async fn raw_values(&self) -> StoreResult<Vec<Vec<u8>>> {
        self.conn.raw_values(&self.scan_prefix()).await
    }

    pub async fn values<V: DeserializeOwned + Default + Any>(&self) -> StoreResult<Vec<V>> {
        self.conn.values(&self.scan_prefix()).await
    }

    pub async fn to_map<V: DeserializeOwned + Default + Any>(&self) -> StoreResult<BTreeMap<String, V>> {
        let raw = self
            .conn
            .iter_raw(&CancellationToken::new(), &self.scan_prefix())
            .await?;
        self.conn.decode_map(raw, Some(&self.prefix)).await
    }

    /// Decode the bucket to JSON and log it at info level.
    pub async fn dump(&self) -> StoreResult<BTreeMap<String, serde_json::Value>> {
        let dump = self.to_map::<serde_json::Value>().await?;
        let pretty = serde_json::to_string_pretty(&dump).map_err(StoreError::from)?;
        self.conn
            .logger()
            .info(format_args!("DUMP {}\n{pretty}", self.prefix));
        Ok(dump)
    }

    pub async fn iter<V: DeserializeOwned + Default + Any>(
        &self,
        cancel: &CancellationToken,
    ) -> StoreResult<TypedItems<V>> {
        let raw = self.conn.iter_raw(cancel, &self.scan_prefix()).await?;
        Ok(TypedItems::new(
            raw,
            Arc::clone(self.conn.coder()),
            Some(self.prefix.clone()),
        ))
    }

    pub async fn watch<V: DeserializeOwned + Default + Any>(
        &self,
        cancel: &CancellationToken,
    ) -> StoreResult<TypedEvents<V>> {
        let raw = self.conn.watch_raw(cancel, &self.scan_prefix()).await?;
        Ok(TypedEvents::new(
            raw,
            Arc::clone(self.conn.coder()),
            Some(self.prefix.clone()),
        ))
    }

    /// A bucket nested below this one.
    pub fn bucket<S: AsRef<str>>(&self, sub: &[S]) -> StoreResult<Bucket> {
        let mut path: Vec<String> = self.path.clone();
        path.extend(self.conn.coder().keys().decode_bucket(sub));
        self.conn.bucket(&path)
    }

    /// Run `f` with exclusive ownership of this bucket's prefix.
    ///
    /// Shares its lock with `with_transaction` on the delimiter-joined path,
    /// so `bucket(&["a", "b"])` and `with_transaction("a//b", ..)` exclude
    /// each other under the simple codec.
    pub async fn transaction<F, Fut, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(Bucket) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let lock = self.lock.clone();
        self.conn.run_transaction(&lock, self.clone(), f).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use crate::testing::MapStore;
    use stash_encoding::{Coder, KeyCodec, ValueCodec};

    fn conn() -> Connection {
        Connection::new(
            Arc::new(MapStore::default()),
            Coder::new(KeyCodec::simple(), ValueCodec::Json),
            Arc::new(NoopLogger),
        )
    }

    #[tokio::test]
    async fn bucket_keys_are_prefixed_in_the_store() {
        let c = conn();
        let users = c.bucket(&["users"]).unwrap();
        users.set("1", &"ada", &[]).await.unwrap();
        assert_eq!(c.keys("").await.unwrap(), vec!["[users]//1"]);
        assert_eq!(users.keys().await.unwrap(), vec!["1"]);
        assert_eq!(users.get::<String>("1").await.unwrap(), "ada");
        assert!(users.exists("1").await.unwrap());
    }

    #[tokio::test]
    async fn sibling_and_nested_buckets_are_isolated() {
        let c = conn();
        let a = c.bucket(&["a"]).unwrap();
        let ab = a.bucket(&["b"]).unwrap();
        let other = c.bucket(&["ab"]).unwrap();
        a.set("k", &1, &[]).await.unwrap();
        ab.set("k", &2, &[]).await.unwrap();
        other.set("k", &3, &[]).await.unwrap();

        assert_eq!(a.len().await.unwrap(), 1);
        assert_eq!(ab.prefix(), "[a//b]");
        assert_eq!(ab.path(), ["a".to_string(), "b".to_string()]);
        assert_eq!(ab.values::<i32>().await.unwrap(), vec![2]);
        assert_eq!(other.to_map::<i32>().await.unwrap()["k"], 3);
    }

    #[tokio::test]
    async fn bucket_from_wrapped_strings_matches_segments() {
        let c = conn();
        let direct = c.bucket(&["x", "y"]).unwrap();
        let wrapped = c.bucket(&["[x]", "y"]).unwrap();
        assert_eq!(direct.prefix(), wrapped.prefix());
    }

    #[tokio::test]
    async fn bucket_iter_strips_prefix() {
        let c = conn();
        let b = c.bucket(&["items"]).unwrap();
        b.set("a", &1, &[]).await.unwrap();
        b.set("b", &2, &[]).await.unwrap();
        let items = b
            .iter::<i32>(&CancellationToken::new())
            .await
            .unwrap()
            .collect_all()
            .await;
        let keys: Vec<_> = items.into_iter().map(|i| i.unwrap().key).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn bucket_rejects_reserved_keys() {
        let c = conn();
        let b = c.bucket(&["b"]).unwrap();
        let err = b.set("x//y", &1, &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::Encoding(_)));
    }

    #[tokio::test]
    async fn bucket_transaction_and_dump() {
        let c = conn();
        let b = c.bucket(&["tx"]).unwrap();
        let n = b
            .transaction(|inner| async move {
                inner.set("n", &41, &[]).await?;
                let n: i32 = inner.get("n").await?;
                inner.set("n", &(n + 1), &[]).await?;
                Ok(n + 1)
            })
            .await
            .unwrap();
        assert_eq!(n, 42);
        assert_eq!(b.dump().await.unwrap()["n"], 42);
        b.delete("n").await.unwrap();
        assert!(b.get_raw("n").await.unwrap_err().is_not_found());
    }
}
