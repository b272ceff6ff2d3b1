//! `reqwest`-backed vendor transport with connect and read timeouts.
//!
//! Streaming bodies apply the read timeout to each gap between chunks rather
//! than to the whole body.

use crate::{BoxStream, Result};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use reqwest::Proxy;
use std::env;
use std::sync::RwLock;
use std::time::Duration;

/// A fully built vendor call: what a driver produces and the transport sends.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Response is consumed incrementally.
    pub stream: bool,
}

impl HttpRequest {
    pub fn json(url: impl Into<String>, body: &serde_json::Value, stream: bool) -> Result<Self> {
        Ok(Self {
            url: url.into(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Bytes::from(serde_json::to_vec(body)?),
            stream,
        })
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Whole-body vendor reply.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Streaming vendor reply. `body` yields chunks as they arrive; an idle gap
/// longer than the read timeout ends it with a timeout error.
pub struct StreamReply {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: BoxStream<'static, Bytes>,
}

impl StreamReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Drain the body, used for error statuses.
    pub async fn collect(self) -> Result<Bytes> {
        let chunks: Vec<Bytes> = self.body.try_collect().await?;
        Ok(Bytes::from(chunks.concat()))
    }
}

/// One pooled HTTP client for one (endpoint, credential) pair.
pub struct HttpTransport {
    client: RwLock<Option<reqwest::Client>>,
    read_timeout: Duration,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(
                env::var("GATEWAY_HTTP_POOL_MAX_IDLE_PER_HOST")
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(32),
            )
            .pool_idle_timeout(Some(Duration::from_secs(
                env::var("GATEWAY_HTTP_POOL_IDLE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(90),
            )))
            .http2_adaptive_window(true)
            .http2_keep_alive_interval(Some(Duration::from_secs(30)))
            .http2_keep_alive_timeout(Duration::from_secs(10));

        if let Ok(proxy_url) = env::var("GATEWAY_PROXY_URL") {
            if let Ok(proxy) = Proxy::all(&proxy_url) {
                builder = builder.proxy(proxy);
            }
        }

        let client = builder
            .build()
            .map_err(|e| crate::Error::Transport(TransportError::Other(e.to_string())))?;

        Ok(Self {
            client: RwLock::new(Some(client)),
            read_timeout,
        })
    }

    /// Release the connection pool. Calls already in flight keep their own
    /// handle and finish normally; new calls fail with [`TransportError::Closed`].
    pub fn close(&self) {
        let mut guard = self.client.write().unwrap_or_else(|e| e.into_inner());
        guard.take();
    }

    pub fn is_closed(&self) -> bool {
        self.client
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    fn client(&self) -> std::result::Result<reqwest::Client, TransportError> {
        self.client
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(TransportError::Closed)
    }

    fn builder(&self, request: &HttpRequest) -> std::result::Result<reqwest::RequestBuilder, TransportError> {
        let mut req = self.client()?.post(&request.url).body(request.body.clone());
        for (k, v) in &request.headers {
            req = req.header(k, v);
        }
        if request.stream && request.header("accept").is_none() {
            req = req.header("accept", "text/event-stream");
        }
        Ok(req)
    }

    /// Send and read the whole body within the read timeout.
    pub async fn send(&self, request: &HttpRequest) -> Result<HttpReply> {
        let response = self
            .builder(request)?
            .timeout(self.read_timeout)
            .send()
            .await
            .map_err(TransportError::from)?;
        let status = response.status().as_u16();
        let content_type = content_type(&response);
        let body = response.bytes().await.map_err(TransportError::from)?;
        Ok(HttpReply {
            status,
            content_type,
            body,
        })
    }

    /// Send and hand back the body as a stream once the headers arrive.
    pub async fn open_stream(&self, request: &HttpRequest) -> Result<StreamReply> {
        let read_timeout = self.read_timeout;
        let pending = self.builder(request)?.send();
        let response = tokio::time::timeout(read_timeout, pending)
            .await
            .map_err(|_| TransportError::Timeout {
                phase: "headers",
                after_ms: read_timeout.as_millis() as u64,
            })?
            .map_err(TransportError::from)?;

        let status = response.status().as_u16();
        let content_type = content_type(&response);
        let chunks = response.bytes_stream();
        let body = futures::stream::unfold(Some(Box::pin(chunks)), move |state| async move {
            let mut chunks = state?;
            match tokio::time::timeout(read_timeout, chunks.next()).await {
                Err(_) => Some((
                    Err(crate::Error::Transport(TransportError::Timeout {
                        phase: "body",
                        after_ms: read_timeout.as_millis() as u64,
                    })),
                    None,
                )),
                Ok(None) => None,
                Ok(Some(Err(e))) => Some((Err(crate::Error::Transport(TransportError::Http(e))), None)),
                Ok(Some(Ok(bytes))) => Some((Ok(bytes), Some(chunks))),
            }
        });
        Ok(StreamReply {
            status,
            content_type,
            body: Box::pin(body),
        })
    }
}

fn content_type(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Timed out waiting for response {phase} after {after_ms}ms")]
    Timeout { phase: &'static str, after_ms: u64 },

    #[error("Transport closed (client evicted)")]
    Closed,

    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        match self {
            TransportError::Http(e) => e.is_timeout(),
            TransportError::Timeout { .. } => true,
            _ => false,
        }
    }
}
