//! In-process stand-in for the etcd JSON gateway, for tests.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::wire::{b64, unb64};

#[derive(Clone, Debug)]
struct Change {
    key: Vec<u8>,
    value: Option<Vec<u8>>,
}

pub struct FakeState {
    pub data: Mutex<BTreeMap<Vec<u8>, (Vec<u8>, i64)>>,
    events: broadcast::Sender<Change>,
    next_lease: AtomicI64,
    ranges_left: Mutex<Option<usize>>,
}

impl FakeState {
    /// Serve `n` more range requests, then answer every one with 503.
    pub fn fail_ranges_after(&self, n: usize) {
        *self.ranges_left.lock() = Some(n);
    }

    fn take_range(&self) -> bool {
        match self.ranges_left.lock().as_mut() {
            None => true,
            Some(0) => false,
            Some(left) => {
                *left -= 1;
                true
            }
        }
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>, lease: i64) {
        let mut data = self.data.lock();
        data.insert(key.clone(), (value.clone(), lease));
        let _ = self.events.send(Change {
            key,
            value: Some(value),
        });
    }

    fn delete(&self, key: &[u8]) {
        let mut data = self.data.lock();
        if data.remove(key).is_some() {
            let _ = self.events.send(Change {
                key: key.to_vec(),
                value: None,
            });
        }
    }

    /// Lease attached to `key`, 0 for none.
    pub fn lease_of(&self, key: &str) -> Option<i64> {
        self.data.lock().get(key.as_bytes()).map(|(_, lease)| *lease)
    }
}

/// A running fake gateway on a random local port.
pub struct FakeEtcd {
    pub endpoint: String,
    pub state: Arc<FakeState>,
    server: JoinHandle<()>,
}

impl FakeEtcd {
    pub async fn start() -> Self {
        let (events, _) = broadcast::channel(256);
        let state = Arc::new(FakeState {
            data: Mutex::new(BTreeMap::new()),
            events,
            next_lease: AtomicI64::new(100),
            ranges_left: Mutex::new(None),
        });
        let app = Router::new()
            .route("/health", get(health))
            .route("/v3/kv/range", post(range))
            .route("/v3/kv/put", post(put))
            .route("/v3/kv/deleterange", post(delete_range))
            .route("/v3/lease/grant", post(lease_grant))
            .route("/v3/watch", post(watch))
            .with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            endpoint: format!("http://{addr}"),
            state,
            server,
        }
    }
}

impl Drop for FakeEtcd {
    fn drop(&mut self) {
        self.server.abort();
    }
}

fn bytes(v: &Value) -> Vec<u8> {
    v.as_str().map(|s| unb64(s).unwrap()).unwrap_or_default()
}

fn int(v: &Value) -> i64 {
    v.as_i64()
        .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        .unwrap_or(0)
}

fn in_range(key: &[u8], from: &[u8], end: Option<&[u8]>) -> bool {
    match end {
        None => key == from,
        Some([0]) => key >= from,
        Some(end) => key >= from && key < end,
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "health": "true" }))
}

async fn range(
    State(state): State<Arc<FakeState>>,
    Json(req): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    if !state.take_range() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    let from = bytes(&req["key"]);
    let end = req.get("range_end").map(bytes);
    let limit = int(&req["limit"]);
    let keys_only = req["keys_only"].as_bool().unwrap_or(false);
    let count_only = req["count_only"].as_bool().unwrap_or(false);

    let data = state.data.lock();
    let matched: Vec<_> = data
        .iter()
        .filter(|(k, _)| in_range(k, &from, end.as_deref()))
        .collect();
    let count = matched.len();
    let take = if limit > 0 { limit as usize } else { count };
    let kvs: Vec<Value> = if count_only {
        Vec::new()
    } else {
        matched
            .iter()
            .take(take)
            .map(|(k, (v, lease))| {
                let mut kv = json!({ "key": b64(k), "mod_revision": "1", "lease": lease.to_string() });
                if !keys_only && !v.is_empty() {
                    kv["value"] = json!(b64(v));
                }
                kv
            })
            .collect()
    };
    Ok(Json(json!({
        "header": { "revision": "1" },
        "kvs": kvs,
        "more": count > take,
        "count": count.to_string(),
    })))
}

async fn put(State(state): State<Arc<FakeState>>, Json(req): Json<Value>) -> Json<Value> {
    state.put(bytes(&req["key"]), bytes(&req["value"]), int(&req["lease"]));
    Json(json!({ "header": {} }))
}

async fn delete_range(State(state): State<Arc<FakeState>>, Json(req): Json<Value>) -> Json<Value> {
    state.delete(&bytes(&req["key"]));
    Json(json!({ "header": {} }))
}

async fn lease_grant(State(state): State<Arc<FakeState>>, Json(req): Json<Value>) -> Json<Value> {
    let ttl = int(&req["TTL"]);
    let id = state.next_lease.fetch_add(1, Ordering::Relaxed);
    let expiry = Arc::clone(&state);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(ttl as u64)).await;
        let doomed: Vec<Vec<u8>> = expiry
            .data
            .lock()
            .iter()
            .filter(|(_, (_, lease))| *lease == id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            expiry.delete(&key);
        }
    });
    Json(json!({ "ID": id.to_string(), "TTL": ttl.to_string() }))
}

async fn watch(State(state): State<Arc<FakeState>>, Json(req): Json<Value>) -> Response {
    let create = &req["create_request"];
    let from = bytes(&create["key"]);
    let end = bytes(&create["range_end"]);
    let rx = state.events.subscribe();

    let created = futures::stream::once(async {
        Ok::<String, Infallible>(format!(
            "{}\n",
            json!({ "result": { "header": {}, "created": true } })
        ))
    });
    let changes = futures::stream::unfold((rx, from, end), |(mut rx, from, end)| async move {
        loop {
            match rx.recv().await {
                Ok(change) if in_range(&change.key, &from, Some(end.as_slice())) => {
                    let event = match change.value {
                        Some(value) => json!({ "kv": { "key": b64(&change.key), "value": b64(&value) } }),
                        None => json!({ "type": "DELETE", "kv": { "key": b64(&change.key) } }),
                    };
                    let line = format!("{}\n", json!({ "result": { "header": {}, "events": [event] } }));
                    return Some((Ok::<String, Infallible>(line), (rx, from, end)));
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Response::new(Body::from_stream(created.chain(changes)))
}
