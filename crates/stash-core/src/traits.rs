use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::StoreResult;
use crate::options::SetOption;
use crate::stream::{EventStream, ItemStream};

/// A flat, prefix-scannable key/value backend.
///
/// Keys are already flattened by the key codec and values are opaque bytes;
/// the backend never interprets either. All implementations must satisfy:
/// - `get` of a missing key is [`StoreError::NotFound`](crate::StoreError::NotFound).
/// - `keys` and `values` are ordered by ascending key.
/// - `iter` and `watch` return immediately. Their producers stop when
///   `cancel` fires, when the receiver is dropped, or on `close`.
/// - `watch` is subscribed before it returns, so a write issued after the
///   call is always observed.
/// - Unsupported [`SetOption`]s are logged and ignored; the write happens.
#[async_trait]
pub trait Store: Send + Sync {
    /// Short backend name for logs and errors.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> StoreResult<Vec<u8>>;

    async fn set(&self, key: &str, value: Vec<u8>, options: &[SetOption]) -> StoreResult<()>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Remove `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Number of keys starting with `prefix`.
    async fn len(&self, prefix: &str) -> StoreResult<usize>;

    /// Keys starting with `prefix`, ascending.
    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Values of the keys starting with `prefix`, in key order.
    async fn values(&self, prefix: &str) -> StoreResult<Vec<Vec<u8>>>;

    /// Lazily stream every pair under `prefix` in key order.
    async fn iter(&self, cancel: &CancellationToken, prefix: &str) -> StoreResult<ItemStream>;

    /// Stream changes to keys under `prefix` from now on.
    async fn watch(&self, cancel: &CancellationToken, prefix: &str) -> StoreResult<EventStream>;

    /// Stop background work and flush. Idempotent.
    async fn close(&self) -> StoreResult<()>;
}
