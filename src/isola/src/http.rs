//! Host-dispatched HTTP capability.
//!
//! The guest issues `(method, url, headers, body?)`; the bridge enqueues
//! the registered handler on the host scheduler captured at registration
//! time, optionally wraps the await in the sandbox timeout, and converts
//! the response body into the canonical `(status, headers, body_mode,
//! payload)` form. Chunked bodies are pulled one chunk at a time through a
//! per-response source handle so the guest observes completions in FIFO of
//! issuance. The bridge applies no URL policy — that is the handler's job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{Level, instrument};

use crate::error::{IsolaError, Result};

/// A guest-originated HTTP request handed to the registered handler.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Request method, upper-case.
    pub method: String,
    /// Absolute request URL.
    pub url: String,
    /// Request headers.
    pub headers: HashMap<String, String>,
    /// Request body, if any.
    pub body: Option<Bytes>,
}

/// The handler's response.
#[derive(Debug)]
pub struct HttpResponse {
    /// Response status code.
    pub status: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Response body.
    pub body: HttpBody,
}

/// A response body in one of the three canonical modes.
pub enum HttpBody {
    /// No body.
    Empty,
    /// A single concrete buffer.
    Bytes(Bytes),
    /// A chunked byte source, drained chunk by chunk.
    Stream(BoxStream<'static, Result<Bytes>>),
}

impl HttpBody {
    /// A chunked body from any stream of byte buffers.
    pub fn from_chunks<S>(chunks: S) -> Self
    where
        S: futures::Stream<Item = Result<Bytes>> + Send + 'static,
    {
        HttpBody::Stream(chunks.boxed())
    }

    fn mode(&self) -> &'static str {
        match self {
            HttpBody::Empty => isola_common::BODY_NONE,
            HttpBody::Bytes(_) => isola_common::BODY_BYTES,
            HttpBody::Stream(_) => isola_common::BODY_STREAM,
        }
    }
}

impl std::fmt::Debug for HttpBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpBody::Empty => f.write_str("Empty"),
            HttpBody::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            HttpBody::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<Bytes> for HttpBody {
    fn from(bytes: Bytes) -> Self {
        HttpBody::Bytes(bytes)
    }
}

impl From<Vec<u8>> for HttpBody {
    fn from(bytes: Vec<u8>) -> Self {
        HttpBody::Bytes(bytes.into())
    }
}

impl From<&'static [u8]> for HttpBody {
    fn from(bytes: &'static [u8]) -> Self {
        HttpBody::Bytes(Bytes::from_static(bytes))
    }
}

/// An async HTTP handler the host installs on a sandbox.
///
/// Plain `Fn(HttpRequest) -> impl Future` closures implement this via a
/// blanket impl. The handler runs on the scheduler captured at
/// registration, never on the guest worker.
#[async_trait]
pub trait HttpHandler: Send + Sync {
    /// Serve one request.
    async fn handle(&self, request: HttpRequest) -> Result<HttpResponse>;
}

#[async_trait]
impl<F, Fut> HttpHandler for F
where
    F: Fn(HttpRequest) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<HttpResponse>> + Send,
{
    async fn handle(&self, request: HttpRequest) -> Result<HttpResponse> {
        self(request).await
    }
}

/// The default outbound handler: forwards the request over a shared
/// `reqwest` client and streams the response back.
///
/// Installed per-sandbox at construction; replace it with
/// [`Sandbox::set_http_handler`] to apply policy or stub the network.
///
/// [`Sandbox::set_http_handler`]: crate::Sandbox::set_http_handler
#[derive(Debug, Clone)]
pub struct DefaultHttpHandler {
    client: reqwest::Client,
}

impl DefaultHttpHandler {
    /// Build the handler with a fresh client.
    ///
    /// # Errors
    ///
    /// Fails with [`IsolaError::Internal`] when the TLS backend cannot be
    /// initialized.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| IsolaError::internal(format!("failed to build http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpHandler for DefaultHttpHandler {
    async fn handle(&self, request: HttpRequest) -> Result<HttpResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| IsolaError::invalid(format!("invalid http method '{}'", request.method)))?;
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| IsolaError::internal(format!("http request failed: {e}")))?;

        let status = response.status().as_u16();
        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }
        let body = HttpBody::from_chunks(response.bytes_stream().map(|chunk| {
            chunk.map_err(|e| IsolaError::internal(format!("http body read failed: {e}")))
        }));
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Reap payload of a completed fetch, in the wire shape the guest decodes.
#[derive(Debug, Serialize)]
pub(crate) struct FetchReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) headers: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) body_mode: Option<&'static str>,
    /// Base64 body for `bytes` mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) body: Option<String>,
    /// Source handle for `stream` mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) source: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) err: Option<String>,
}

impl FetchReply {
    fn error(message: impl Into<String>) -> Self {
        Self {
            status: None,
            headers: None,
            body_mode: None,
            body: None,
            source: None,
            err: Some(message.into()),
        }
    }
}

/// Reap payload of a chunk read.
#[derive(Debug, Serialize)]
pub(crate) struct ReadReply {
    pub(crate) done: bool,
    /// Base64 chunk when `done` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) chunk: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) err: Option<String>,
}

type SharedChunkSource = Arc<tokio::sync::Mutex<BoxStream<'static, Result<Bytes>>>>;

/// Live chunk sources for stream-mode bodies, keyed by handle.
#[derive(Clone, Default)]
pub(crate) struct SourceTable {
    next_id: Arc<AtomicU32>,
    sources: Arc<Mutex<HashMap<u32, SharedChunkSource>>>,
}

impl SourceTable {
    fn insert(&self, source: BoxStream<'static, Result<Bytes>>) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.sources
            .lock()
            .expect("source table poisoned")
            .insert(id, Arc::new(tokio::sync::Mutex::new(source)));
        id
    }

    fn get(&self, id: u32) -> Option<SharedChunkSource> {
        self.sources
            .lock()
            .expect("source table poisoned")
            .get(&id)
            .cloned()
    }

    pub(crate) fn remove(&self, id: u32) {
        self.sources
            .lock()
            .expect("source table poisoned")
            .remove(&id);
    }
}

/// Registered handler plus the scheduler it runs on.
#[derive(Clone)]
pub(crate) struct HttpBridge {
    handler: Arc<dyn HttpHandler>,
    scheduler: Handle,
}

impl HttpBridge {
    pub(crate) fn new(handler: Arc<dyn HttpHandler>, scheduler: Handle) -> Self {
        Self { handler, scheduler }
    }

    /// The future driving one fetch.
    ///
    /// The handler itself is enqueued on the scheduler captured at
    /// registration; the returned future only awaits its outcome, which is
    /// the pollable's reap payload. Handler failures and timeouts become
    /// an `err` payload for the guest call rather than aborting the run.
    #[instrument(skip_all, level = Level::DEBUG, fields(method = %request.method, url = %request.url))]
    pub(crate) fn fetch_future(
        &self,
        request: HttpRequest,
        timeout: Option<Duration>,
        sources: SourceTable,
    ) -> impl std::future::Future<Output = serde_json::Value> + Send + 'static {
        let handler = Arc::clone(&self.handler);
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let request = request.clone();
        self.scheduler.spawn(async move {
            let invoke = handler.handle(request);
            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, invoke).await {
                    Ok(result) => result,
                    Err(_) => Err(IsolaError::DeadlineExceeded),
                },
                None => invoke.await,
            };
            let reply = match outcome {
                Ok(response) => {
                    let body_mode = response.body.mode();
                    let (body, source) = match response.body {
                        HttpBody::Empty => (None, None),
                        HttpBody::Bytes(bytes) => (
                            Some(base64::engine::general_purpose::STANDARD.encode(&bytes)),
                            None,
                        ),
                        HttpBody::Stream(stream) => (None, Some(sources.insert(stream))),
                    };
                    FetchReply {
                        status: Some(response.status),
                        headers: Some(response.headers),
                        body_mode: Some(body_mode),
                        body,
                        source,
                        err: None,
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "http handler failed");
                    FetchReply::error(err.to_string())
                }
            };
            let value = serde_json::to_value(&reply).unwrap_or_else(|e| {
                serde_json::json!({ "err": format!("failed to encode fetch reply: {e}") })
            });
            let _ = reply_tx.send(value);
        });
        async move {
            match reply_rx.await {
                Ok(value) => value,
                Err(_) => serde_json::json!({ "err": "http dispatch task was dropped" }),
            }
        }
    }
}

impl std::fmt::Debug for HttpBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBridge").finish()
    }
}

/// The future pulling the next chunk of a stream-mode body.
///
/// Reads are issued one at a time by the guest worker, so per-request
/// chunk order is the source's own order.
pub(crate) fn read_chunk_future(
    sources: SourceTable,
    source_id: u32,
) -> impl std::future::Future<Output = serde_json::Value> + Send + 'static {
    async move {
        let reply = match sources.get(source_id) {
            Some(source) => {
                let chunk = source.lock().await.next().await;
                match chunk {
                    Some(Ok(bytes)) => ReadReply {
                        done: false,
                        chunk: Some(base64::engine::general_purpose::STANDARD.encode(&bytes)),
                        err: None,
                    },
                    Some(Err(err)) => {
                        sources.remove(source_id);
                        ReadReply {
                            done: true,
                            chunk: None,
                            err: Some(err.to_string()),
                        }
                    }
                    None => {
                        sources.remove(source_id);
                        ReadReply {
                            done: true,
                            chunk: None,
                            err: None,
                        }
                    }
                }
            }
            None => ReadReply {
                done: true,
                chunk: None,
                err: Some(format!("unknown http body source {source_id}")),
            },
        };
        serde_json::to_value(&reply).unwrap_or_else(|e| {
            serde_json::json!({ "err": format!("failed to encode read reply: {e}") })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge_with<H: HttpHandler + 'static>(handler: H) -> HttpBridge {
        HttpBridge::new(Arc::new(handler), Handle::current())
    }

    #[tokio::test]
    async fn bytes_body_is_inlined() {
        let bridge = bridge_with(|_request: HttpRequest| async {
            Ok(HttpResponse {
                status: 201,
                headers: HashMap::from([("x-test".to_string(), "bytes".to_string())]),
                body: HttpBody::Bytes(Bytes::from_static(b"ok")),
            })
        });
        let reply = bridge
            .fetch_future(
                HttpRequest {
                    method: "GET".into(),
                    url: "https://example.test/bytes".into(),
                    headers: HashMap::new(),
                    body: None,
                },
                None,
                SourceTable::default(),
            )
            .await;
        assert_eq!(reply["status"], 201);
        assert_eq!(reply["headers"]["x-test"], "bytes");
        assert_eq!(reply["body_mode"], "bytes");
        let body = base64::engine::general_purpose::STANDARD
            .decode(reply["body"].as_str().unwrap())
            .unwrap();
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn chunked_body_reads_in_order_until_done() {
        let bridge = bridge_with(|_request: HttpRequest| async {
            let chunks = futures::stream::iter([
                Ok(Bytes::from_static(b"a")),
                Ok(Bytes::from_static(b"b")),
            ]);
            Ok(HttpResponse {
                status: 200,
                headers: HashMap::new(),
                body: HttpBody::from_chunks(chunks),
            })
        });
        let sources = SourceTable::default();
        let reply = bridge
            .fetch_future(
                HttpRequest {
                    method: "GET".into(),
                    url: "https://example.test/stream".into(),
                    headers: HashMap::new(),
                    body: None,
                },
                None,
                sources.clone(),
            )
            .await;
        assert_eq!(reply["body_mode"], "stream");
        let source = reply["source"].as_u64().unwrap() as u32;

        let mut collected = Vec::new();
        loop {
            let chunk = read_chunk_future(sources.clone(), source).await;
            if chunk["done"].as_bool().unwrap() {
                assert!(chunk.get("err").is_none());
                break;
            }
            collected.extend(
                base64::engine::general_purpose::STANDARD
                    .decode(chunk["chunk"].as_str().unwrap())
                    .unwrap(),
            );
        }
        assert_eq!(collected, b"ab");
        // The source is released once drained.
        let after = read_chunk_future(sources, source).await;
        assert!(after["err"].as_str().unwrap().contains("unknown"));
    }

    #[tokio::test]
    async fn handler_timeout_becomes_err_payload() {
        let bridge = bridge_with(|_request: HttpRequest| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(HttpResponse {
                status: 200,
                headers: HashMap::new(),
                body: HttpBody::Empty,
            })
        });
        let reply = bridge
            .fetch_future(
                HttpRequest {
                    method: "GET".into(),
                    url: "https://example.test/stall".into(),
                    headers: HashMap::new(),
                    body: None,
                },
                Some(Duration::from_millis(10)),
                SourceTable::default(),
            )
            .await;
        assert!(reply["err"].as_str().unwrap().contains("deadline"));
    }

    #[tokio::test]
    async fn handler_error_does_not_panic_the_bridge() {
        let bridge = bridge_with(|_request: HttpRequest| async {
            Err::<HttpResponse, _>(IsolaError::internal("refused by policy"))
        });
        let reply = bridge
            .fetch_future(
                HttpRequest {
                    method: "GET".into(),
                    url: "https://example.test/deny".into(),
                    headers: HashMap::new(),
                    body: None,
                },
                None,
                SourceTable::default(),
            )
            .await;
        assert!(reply["err"].as_str().unwrap().contains("refused"));
    }
}
