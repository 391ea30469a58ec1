//! JSON shapes of the etcd v3 gateway.
//!
//! Keys and values travel base64-encoded. Requests use the proto field
//! names; responses are accepted in either proto or camelCase form, and
//! 64-bit integers may arrive as strings or numbers.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{de, Deserialize, Deserializer, Serialize};

use stash_core::{Event, StoreError, StoreResult};

pub fn b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn unb64(text: &str) -> StoreResult<Vec<u8>> {
    STANDARD
        .decode(text)
        .map_err(|e| StoreError::Serialization(format!("bad base64 from gateway: {e}")))
}

/// Key bytes from the gateway as a string key.
pub fn key_string(text: &str) -> StoreResult<String> {
    String::from_utf8(unb64(text)?)
        .map_err(|e| StoreError::Serialization(format!("non UTF-8 key: {e}")))
}

/// Smallest key greater than every key starting with `prefix`.
///
/// Trailing `0xff` bytes cannot be incremented and are dropped; a prefix of
/// nothing but `0xff` has no upper bound and yields `[0]`, which etcd reads
/// as "to the end of the keyspace".
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    for i in (0..prefix.len()).rev() {
        if prefix[i] < 0xff {
            let mut end = prefix[..=i].to_vec();
            end[i] += 1;
            return end;
        }
    }
    vec![0]
}

/// `(key, range_end)` covering every key under `prefix`.
pub fn prefix_range(prefix: &str) -> (Vec<u8>, Vec<u8>) {
    if prefix.is_empty() {
        (vec![0], vec![0])
    } else {
        (prefix.as_bytes().to_vec(), prefix_end(prefix.as_bytes()))
    }
}

fn int64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(i64),
        Text(String),
    }
    match Repr::deserialize(d)? {
        Repr::Number(n) => Ok(n),
        Repr::Text(s) => s.parse().map_err(de::Error::custom),
    }
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Debug, Default, Serialize)]
pub struct RangeRequest {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range_end: Option<String>,
    #[serde(skip_serializing_if = "is_zero")]
    pub limit: i64,
    #[serde(skip_serializing_if = "is_false")]
    pub keys_only: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub count_only: bool,
}

impl RangeRequest {
    pub fn key(key: &str) -> Self {
        Self {
            key: b64(key.as_bytes()),
            ..Self::default()
        }
    }

    /// Every key in `[from, range_end)`.
    pub fn range(from: &[u8], range_end: &[u8]) -> Self {
        Self {
            key: b64(from),
            range_end: Some(b64(range_end)),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct KeyValue {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, alias = "modRevision", deserialize_with = "int64")]
    pub mod_revision: i64,
    #[serde(default, deserialize_with = "int64")]
    pub lease: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct RangeResponse {
    #[serde(default)]
    pub kvs: Vec<KeyValue>,
    #[serde(default)]
    pub more: bool,
    #[serde(default, deserialize_with = "int64")]
    pub count: i64,
}

#[derive(Debug, Serialize)]
pub struct PutRequest {
    pub key: String,
    pub value: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub lease: i64,
}

#[derive(Debug, Serialize)]
pub struct DeleteRangeRequest {
    pub key: String,
}

/// Gateway responses whose body is ignored.
#[derive(Debug, Default, Deserialize)]
pub struct Ignored {}

#[derive(Debug, Serialize)]
pub struct LeaseGrantRequest {
    #[serde(rename = "TTL")]
    pub ttl: i64,
}

#[derive(Debug, Deserialize)]
pub struct LeaseGrantResponse {
    #[serde(rename = "ID", alias = "id", deserialize_with = "int64")]
    pub id: i64,
}

#[derive(Debug, Serialize)]
pub struct WatchRequest {
    pub create_request: WatchCreate,
}

#[derive(Debug, Serialize)]
pub struct WatchCreate {
    pub key: String,
    pub range_end: String,
}

impl WatchRequest {
    pub fn prefix(prefix: &str) -> Self {
        let (key, range_end) = prefix_range(prefix);
        Self {
            create_request: WatchCreate {
                key: b64(&key),
                range_end: b64(&range_end),
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct WatchLine {
    pub result: Option<WatchResult>,
    pub error: Option<GatewayError>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WatchResult {
    #[serde(default)]
    pub created: bool,
    #[serde(default)]
    pub canceled: bool,
    #[serde(default, alias = "cancelReason")]
    pub cancel_reason: String,
    #[serde(default)]
    pub events: Vec<WatchEvent>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WatchEvent {
    /// Absent for PUT, the zero value of the enum.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    pub kv: Option<KeyValue>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GatewayError {
    #[serde(default)]
    pub message: String,
}

/// What one line of the watch stream means to a watcher.
#[derive(Debug, PartialEq, Eq)]
pub enum WatchUpdate {
    /// The server acknowledged the watch.
    Created,
    /// Changes, in order. Undecodable entries are error events.
    Events(Vec<Event>),
    /// The stream ended abnormally. No more lines follow.
    Failed(String),
}

/// Interpret one newline-delimited JSON message of a watch stream.
pub fn parse_watch_line(line: &str, prefix: &str) -> WatchUpdate {
    let parsed: WatchLine = match serde_json::from_str(line) {
        Ok(parsed) => parsed,
        Err(e) => return WatchUpdate::Failed(format!("bad watch message: {e}")),
    };
    if let Some(err) = parsed.error {
        return WatchUpdate::Failed(err.message);
    }
    let Some(result) = parsed.result else {
        return WatchUpdate::Events(Vec::new());
    };
    if result.canceled {
        let reason = if result.cancel_reason.is_empty() {
            "watch canceled by server".to_string()
        } else {
            result.cancel_reason
        };
        return WatchUpdate::Failed(reason);
    }
    if result.created && result.events.is_empty() {
        return WatchUpdate::Created;
    }

    let events = result
        .events
        .into_iter()
        .map(|event| {
            let Some(kv) = event.kv else {
                return Event::Error {
                    key: prefix.to_string(),
                    message: "watch event without key".into(),
                };
            };
            let key = match key_string(&kv.key) {
                Ok(key) => key,
                Err(e) => {
                    return Event::Error {
                        key: prefix.to_string(),
                        message: e.to_string(),
                    }
                }
            };
            match event.kind.as_deref() {
                Some("DELETE") => Event::Delete { key },
                None | Some("PUT") => match unb64(&kv.value) {
                    Ok(value) => Event::Put { key, value },
                    Err(e) => Event::Error {
                        key,
                        message: e.to_string(),
                    },
                },
                Some(other) => Event::Error {
                    key,
                    message: format!("unknown event type {other}"),
                },
            }
        })
        .collect();
    WatchUpdate::Events(events)
}
