//! A minimal store for exercising the connection layer in unit tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{StoreError, StoreResult};
use crate::event::Item;
use crate::options::SetOption;
use crate::stream::{EventStream, ItemStream, TaskRegistry};
use crate::traits::Store;

#[derive(Default)]
pub(crate) struct MapStore {
    map: Mutex<BTreeMap<String, Vec<u8>>>,
    tasks: TaskRegistry,
}

impl MapStore {
    fn scan(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
        self.map
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[async_trait]
impl Store for MapStore {
    fn name(&self) -> &'static str {
        "map"
    }

    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.map
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found(key))
    }

    async fn set(&self, key: &str, value: Vec<u8>, _options: &[SetOption]) -> StoreResult<()> {
        self.map.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.map.lock().contains_key(key))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.map.lock().remove(key);
        Ok(())
    }

    async fn len(&self, prefix: &str) -> StoreResult<usize> {
        Ok(self.scan(prefix).len())
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self.scan(prefix).into_iter().map(|(k, _)| k).collect())
    }

    async fn values(&self, prefix: &str) -> StoreResult<Vec<Vec<u8>>> {
        Ok(self.scan(prefix).into_iter().map(|(_, v)| v).collect())
    }

    async fn iter(&self, cancel: &CancellationToken, prefix: &str) -> StoreResult<ItemStream> {
        let items = self.scan(prefix);
        Ok(self.tasks.spawn_feed(cancel, |tx| async move {
            for (key, value) in items {
                if tx.send(Ok(Item { key, value })).await.is_err() {
                    return;
                }
            }
        }))
    }

    async fn watch(&self, cancel: &CancellationToken, _prefix: &str) -> StoreResult<EventStream> {
        Ok(self.tasks.spawn_feed(cancel, |_tx| std::future::pending()))
    }

    async fn close(&self) -> StoreResult<()> {
        self.tasks.shutdown().await;
        Ok(())
    }
}
