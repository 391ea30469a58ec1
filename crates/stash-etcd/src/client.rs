//! HTTP client for the gateway with endpoint failover.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use stash_core::{StoreError, StoreResult};

/// Chunks of a streaming response body.
pub type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Vec<u8>>> + Send>>;

/// Normalize an endpoint to `scheme://host:port` without a trailing slash.
pub fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// Talks to whichever endpoint answers, starting from the last good one.
#[derive(Debug)]
pub struct Gateway {
    http: reqwest::Client,
    endpoints: Vec<String>,
    preferred: AtomicUsize,
    request_timeout: Duration,
}

impl Gateway {
    pub fn new(endpoints: &[String], request_timeout: Duration) -> StoreResult<Self> {
        let endpoints: Vec<String> = endpoints
            .iter()
            .filter(|e| !e.trim().is_empty())
            .map(|e| normalize_endpoint(e))
            .collect();
        if endpoints.is_empty() {
            return Err(StoreError::Configuration(
                "etcd needs at least one endpoint".into(),
            ));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| StoreError::Configuration(format!("http client: {e}")))?;
        Ok(Self {
            http,
            endpoints,
            preferred: AtomicUsize::new(0),
            request_timeout,
        })
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// POST `body` to `path` and decode the JSON reply.
    pub async fn call<Req, Resp>(&self, path: &str, body: &Req) -> StoreResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let response = self.post(path, body, Some(self.request_timeout)).await?;
        response
            .json::<Resp>()
            .await
            .map_err(|e| StoreError::Serialization(format!("{path}: {e}")))
    }

    /// POST `body` to `path` and hand back the body as a chunk stream.
    /// No request timeout applies to the stream.
    pub async fn stream<Req>(&self, path: &str, body: &Req) -> StoreResult<ByteStream>
    where
        Req: Serialize + ?Sized,
    {
        let response = self.post(path, body, None).await?;
        Ok(Box::pin(
            response.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec())),
        ))
    }

    /// Whether any endpoint reports itself healthy.
    pub async fn healthy(&self) -> bool {
        for endpoint in &self.endpoints {
            if check_health(&self.http, endpoint, self.request_timeout).await {
                return true;
            }
        }
        false
    }

    async fn post<Req>(
        &self,
        path: &str,
        body: &Req,
        timeout: Option<Duration>,
    ) -> StoreResult<reqwest::Response>
    where
        Req: Serialize + ?Sized,
    {
        let start = self.preferred.load(Ordering::Relaxed);
        let mut last_error = String::new();
        for offset in 0..self.endpoints.len() {
            let index = (start + offset) % self.endpoints.len();
            let url = format!("{}{path}", self.endpoints[index]);
            let mut request = self.http.post(&url).json(body);
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    self.preferred.store(index, Ordering::Relaxed);
                    return Ok(response);
                }
                Ok(response) if response.status().is_client_error() => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    return Err(StoreError::Serialization(format!(
                        "{url} rejected request ({status}): {text}"
                    )));
                }
                Ok(response) => last_error = format!("{url}: status {}", response.status()),
                Err(e) => last_error = format!("{url}: {e}"),
            }
        }
        Err(StoreError::BackendUnavailable(format!(
            "all etcd endpoints failed, last error: {last_error}"
        )))
    }
}

/// GET `<endpoint>/health` and check for `{"health":"true"}`.
pub async fn check_health(http: &reqwest::Client, endpoint: &str, timeout: Duration) -> bool {
    #[derive(serde::Deserialize)]
    struct Health {
        health: String,
    }
    let url = format!("{}/health", normalize_endpoint(endpoint));
    let Ok(response) = http.get(&url).timeout(timeout).send().await else {
        return false;
    };
    if !response.status().is_success() {
        return false;
    }
    matches!(response.json::<Health>().await, Ok(h) if h.health == "true")
}

/// Splits a chunk stream into lines.
pub struct LineReader {
    chunks: ByteStream,
    buf: Vec<u8>,
    done: bool,
}

impl LineReader {
    pub fn new(chunks: ByteStream) -> Self {
        Self {
            chunks,
            buf: Vec::new(),
            done: false,
        }
    }

    /// Next non-empty line, `None` at end of stream.
    pub async fn next_line(&mut self) -> Option<StoreResult<String>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let rest = self.buf.split_off(pos + 1);
                let line = std::mem::replace(&mut self.buf, rest);
                let text = String::from_utf8_lossy(&line).trim().to_string();
                if text.is_empty() {
                    continue;
                }
                return Some(Ok(text));
            }
            if self.done {
                let line = std::mem::take(&mut self.buf);
                let text = String::from_utf8_lossy(&line).trim().to_string();
                return (!text.is_empty()).then_some(Ok(text));
            }
            match self.chunks.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    self.done = true;
                    self.buf.clear();
                    return Some(Err(StoreError::BackendUnavailable(format!(
                        "watch stream broke: {e}"
                    ))));
                }
                None => self.done = true,
            }
        }
    }
}
