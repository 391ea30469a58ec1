//! Typed views over raw iterate and watch streams.
//!
//! Each raw record is decoded as it arrives. A record that fails to decode
//! is replaced by one error element carrying its key, and the stream goes
//! on. Errors sent by the backend pass through unchanged apart from the key.
//! Bucket streams also strip the bucket prefix from every key.

use std::any::Any;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use serde::de::DeserializeOwned;

use stash_encoding::Coder;

use crate::event::{Event, Item, ItemError, ItemResult};
use crate::stream::{EventStream, ItemStream};

struct Decoder<V> {
    coder: Arc<Coder>,
    bucket: Option<String>,
    _value: PhantomData<fn() -> V>,
}

impl<V: DeserializeOwned + Default + Any> Decoder<V> {
    fn relative(&self, key: String) -> String {
        match &self.bucket {
            Some(prefix) => match self.coder.keys().strip_bucket(prefix, &key) {
                Some(rel) => rel.to_string(),
                None => key,
            },
            None => key,
        }
    }

    fn item(&self, raw: ItemResult<Vec<u8>>) -> ItemResult<V> {
        let raw = match raw {
            Ok(raw) => raw,
            Err(e) => {
                return Err(ItemError {
                    key: self.relative(e.key),
                    message: e.message,
                })
            }
        };
        let key = self.relative(raw.key);
        match self.coder.decode::<V>(&raw.value) {
            Ok(value) => Ok(Item { key, value }),
            Err(e) => Err(ItemError {
                key,
                message: e.to_string(),
            }),
        }
    }

    fn event(&self, raw: Event) -> Event<V> {
        match raw {
            Event::Put { key, value } => {
                let key = self.relative(key);
                match self.coder.decode::<V>(&value) {
                    Ok(value) => Event::Put { key, value },
                    Err(e) => Event::Error {
                        key,
                        message: e.to_string(),
                    },
                }
            }
            Event::Delete { key } => Event::Delete {
                key: self.relative(key),
            },
            Event::Error { key, message } => Event::Error {
                key: self.relative(key),
                message,
            },
        }
    }
}

/// Decoded iteration stream.
pub struct TypedItems<V> {
    inner: ItemStream,
    decoder: Decoder<V>,
}

impl<V: DeserializeOwned + Default + Any> TypedItems<V> {
    pub fn new(inner: ItemStream, coder: Arc<Coder>, bucket: Option<String>) -> Self {
        Self {
            inner,
            decoder: Decoder {
                coder,
                bucket,
                _value: PhantomData,
            },
        }
    }

    /// Next item, or `None` once the producer is done.
    pub async fn recv(&mut self) -> Option<ItemResult<V>> {
        let raw = self.inner.recv().await?;
        Some(self.decoder.item(raw))
    }

    /// Drain the stream.
    pub async fn collect_all(mut self) -> Vec<ItemResult<V>> {
        let mut out = Vec::new();
        while let Some(item) = self.recv().await {
            out.push(item);
        }
        out
    }
}

impl<V: DeserializeOwned + Default + Any> Stream for TypedItems<V> {
    type Item = ItemResult<V>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.inner
            .poll_recv(cx)
            .map(|raw| raw.map(|item| this.decoder.item(item)))
    }
}

/// Decoded change stream.
pub struct TypedEvents<V> {
    inner: EventStream,
    decoder: Decoder<V>,
}

impl<V: DeserializeOwned + Default + Any> TypedEvents<V> {
    pub fn new(inner: EventStream, coder: Arc<Coder>, bucket: Option<String>) -> Self {
        Self {
            inner,
            decoder: Decoder {
                coder,
                bucket,
                _value: PhantomData,
            },
        }
    }

    pub async fn recv(&mut self) -> Option<Event<V>> {
        let raw = self.inner.recv().await?;
        Some(self.decoder.event(raw))
    }
}

impl<V: DeserializeOwned + Default + Any> Stream for TypedEvents<V> {
    type Item = Event<V>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.inner
            .poll_recv(cx)
            .map(|raw| raw.map(|event| this.decoder.event(event)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use stash_encoding::{KeyCodec, ValueCodec};
    use tokio::sync::mpsc;

    fn coder() -> Arc<Coder> {
        Arc::new(Coder::new(KeyCodec::simple(), ValueCodec::Json))
    }

    #[tokio::test]
    async fn malformed_record_becomes_one_error_in_place() {
        let (tx, rx) = mpsc::channel(16);
        for i in 0..11u32 {
            let value = if i == 4 {
                b"{oops".to_vec()
            } else {
                i.to_string().into_bytes()
            };
            tx.send(Ok(Item {
                key: format!("k{i:02}"),
                value,
            }))
            .await
            .unwrap();
        }
        drop(tx);

        let items = TypedItems::<u32>::new(rx, coder(), None).collect_all().await;
        assert_eq!(items.len(), 11);
        assert_eq!(items.iter().filter(|i| i.is_ok()).count(), 10);
        let bad = items[4].as_ref().unwrap_err();
        assert_eq!(bad.key, "k04");
        assert_eq!(items[5].as_ref().unwrap().value, 5);
    }

    #[tokio::test]
    async fn bucket_prefix_is_stripped() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(Item {
            key: "[users]//1".into(),
            value: br#""ada""#.to_vec(),
        }))
        .await
        .unwrap();
        drop(tx);

        let mut items = TypedItems::<String>::new(rx, coder(), Some("[users]".into()));
        let first = items.next().await.unwrap().unwrap();
        assert_eq!(first.key, "1");
        assert_eq!(first.value, "ada");
        assert!(items.next().await.is_none());
    }

    #[tokio::test]
    async fn backend_error_passes_through() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(Item {
            key: "n/1".into(),
            value: b"1".to_vec(),
        }))
        .await
        .unwrap();
        tx.send(Err(ItemError {
            key: "n/".into(),
            message: "iteration stopped".into(),
        }))
        .await
        .unwrap();
        drop(tx);

        let items = TypedItems::<u32>::new(rx, coder(), None).collect_all().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().value, 1);
        let err = items[1].as_ref().unwrap_err();
        assert_eq!(err.key, "n/");
        assert_eq!(err.message, "iteration stopped");
    }

    #[tokio::test]
    async fn events_decode_and_report_errors() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Event::Put {
            key: "a".into(),
            value: b"1".to_vec(),
        })
        .await
        .unwrap();
        tx.send(Event::Put {
            key: "b".into(),
            value: b"nope".to_vec(),
        })
        .await
        .unwrap();
        tx.send(Event::Delete { key: "a".into() }).await.unwrap();
        drop(tx);

        let mut events = TypedEvents::<i64>::new(rx, coder(), None);
        assert_eq!(
            events.recv().await,
            Some(Event::Put {
                key: "a".into(),
                value: 1
            })
        );
        let err = events.recv().await.unwrap();
        assert_eq!(err.kind(), crate::event::EventKind::Error);
        assert_eq!(err.key(), "b");
        assert_eq!(events.recv().await, Some(Event::Delete { key: "a".into() }));
        assert_eq!(events.recv().await, None);
    }
}
