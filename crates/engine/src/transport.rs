//! Transport seam between the engine and the network.
//!
//! The engine hands a fully assembled [`TransportRequest`] to a
//! [`Transport`] and interprets the resulting status code; it never talks
//! HTTP directly. [`HttpTransport`] is the production implementation on
//! `reqwest`, tests substitute scripted in-process transports.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::{CachePolicy, Method, ProgressHandler};
use futures::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// Upload body chunk size used to pace upload progress callbacks.
const UPLOAD_CHUNK: usize = 64 * 1024;

/// A resolved, encoded request ready to be sent.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL, query string already attached for bodyless methods.
    pub url: String,
    /// Merged engine and operation headers.
    pub headers: HashMap<String, String>,
    /// Content type and encoded body, when the method carries one.
    pub body: Option<(String, Vec<u8>)>,
    /// Whether the transport may serve the response from a local cache.
    pub cache: CachePolicy,
    /// Spool file for the response body. When set, a success-status body is
    /// streamed to this path chunk by chunk instead of being buffered, and
    /// the response carries [`TransportBody::File`]. Error bodies are still
    /// buffered so the engine can read them as a message.
    pub destination: Option<PathBuf>,
}

/// Raw response from a transport, before the engine materializes it.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers, last value wins on duplicates.
    pub headers: HashMap<String, String>,
    /// Response body, buffered or spooled to disk.
    pub body: TransportBody,
}

/// Where a response body ended up.
#[derive(Debug, Clone)]
pub enum TransportBody {
    /// Body buffered in memory.
    Memory(Bytes),
    /// Body streamed to `path` as it arrived, `len` bytes in total. The
    /// file holds raw network bytes; the engine finalizes it from there.
    File {
        /// Spool path the body was written to.
        path: PathBuf,
        /// Number of bytes written.
        len: u64,
    },
}

impl TransportBody {
    /// Body length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            Self::Memory(bytes) => bytes.len() as u64,
            Self::File { len, .. } => *len,
        }
    }

    /// Whether the body is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transport-level failures. Status-code handling is the engine's job;
/// these cover the cases where no response arrived at all.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The connection could not be established or broke mid-flight.
    #[error("connection error: {0}")]
    Connection(String),
    /// The transport's own timeout fired.
    #[error("transport timeout")]
    Timeout,
    /// The request could not be constructed (bad URL, bad header).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The response body could not be written to its destination file.
    #[error("destination write failed: {0}")]
    Sink(String),
}

/// Progress callbacks threaded through to the transport for a single
/// attempt.
#[derive(Clone, Default)]
pub struct ProgressHooks {
    /// Called with upload fractions in `0.0..=1.0`.
    pub upload: Option<ProgressHandler>,
    /// Called with download fractions in `0.0..=1.0`.
    pub download: Option<ProgressHandler>,
    /// Caller-supplied expected body size, used when the server omits
    /// `Content-Length`.
    pub expected_size: Option<u64>,
}

impl std::fmt::Debug for ProgressHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressHooks")
            .field("upload", &self.upload.is_some())
            .field("download", &self.download.is_some())
            .field("expected_size", &self.expected_size)
            .finish()
    }
}

/// Executes a single request attempt.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send the request and return the raw response.
    ///
    /// Implementations should report upload progress while the body streams
    /// out and download progress as the response streams in, when the
    /// corresponding hook is present.
    async fn execute(
        &self,
        request: TransportRequest,
        hooks: ProgressHooks,
    ) -> Result<TransportResponse, TransportError>;
}

/// Production transport on a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport with a default client.
    ///
    /// # Panics
    ///
    /// Panics if the default TLS backend cannot be initialized.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .build()
                .expect("default client configuration should not fail"),
        }
    }

    /// Build a transport around an existing client, preserving its pools
    /// and TLS configuration.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_builder() || err.is_request() {
        TransportError::InvalidRequest(err.to_string())
    } else {
        TransportError::Connection(err.to_string())
    }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Delete => reqwest::Method::DELETE,
        Method::Patch => reqwest::Method::PATCH,
        Method::Head => reqwest::Method::HEAD,
    }
}

/// Download total for progress reporting. The caller's declared expected
/// size wins over the server's `Content-Length`.
fn download_total(expected: Option<u64>, content_length: Option<u64>) -> Option<u64> {
    expected.or(content_length)
}

/// Completion fraction for `done` of `total` bytes, clamped to `1.0`.
/// Returns `None` when the total is unknown or zero.
fn progress_fraction(done: u64, total: Option<u64>) -> Option<f64> {
    match total {
        Some(total) if total > 0 => {
            #[allow(clippy::cast_precision_loss)]
            let fraction = done as f64 / total as f64;
            Some(fraction.min(1.0))
        }
        _ => None,
    }
}

/// Split an upload body into a progress-reporting byte stream.
fn upload_stream(
    body: Vec<u8>,
    hook: ProgressHandler,
) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> {
    let total = body.len() as u64;
    let chunks: Vec<Bytes> = body
        .chunks(UPLOAD_CHUNK)
        .map(Bytes::copy_from_slice)
        .collect();
    let mut sent = 0u64;
    futures::stream::iter(chunks).map(move |chunk| {
        sent += chunk.len() as u64;
        if let Some(fraction) = progress_fraction(sent, Some(total)) {
            hook(fraction);
        }
        Ok(chunk)
    })
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(
        &self,
        request: TransportRequest,
        hooks: ProgressHooks,
    ) -> Result<TransportResponse, TransportError> {
        let mut builder = self
            .client
            .request(to_reqwest_method(request.method), &request.url);

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if request.cache == CachePolicy::IgnoreLocalCache {
            builder = builder.header(reqwest::header::CACHE_CONTROL, "no-cache");
        }

        if let Some((content_type, body)) = request.body {
            builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
            if let Some(hook) = hooks.upload.clone() {
                if body.is_empty() {
                    hook(1.0);
                    builder = builder.body(Vec::new());
                } else {
                    builder = builder.body(reqwest::Body::wrap_stream(upload_stream(body, hook)));
                }
            } else {
                builder = builder.body(body);
            }
        }

        let response = builder.send().await.map_err(|e| classify(&e))?;

        let status = response.status().as_u16();
        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }

        let total = download_total(hooks.expected_size, response.content_length());
        let spool = request
            .destination
            .filter(|_| (200..300).contains(&status));
        let body = if let Some(path) = spool {
            let mut file = tokio::fs::File::create(&path)
                .await
                .map_err(|e| TransportError::Sink(e.to_string()))?;
            let mut written = 0u64;
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| classify(&e))?;
                file.write_all(&chunk)
                    .await
                    .map_err(|e| TransportError::Sink(e.to_string()))?;
                written += chunk.len() as u64;
                if let Some(hook) = &hooks.download
                    && let Some(fraction) = progress_fraction(written, total)
                {
                    hook(fraction);
                }
            }
            file.flush()
                .await
                .map_err(|e| TransportError::Sink(e.to_string()))?;
            if let Some(hook) = &hooks.download {
                hook(1.0);
            }
            TransportBody::File { path, len: written }
        } else if let Some(hook) = hooks.download {
            let mut buf = Vec::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| classify(&e))?;
                buf.extend_from_slice(&chunk);
                if let Some(fraction) = progress_fraction(buf.len() as u64, total) {
                    hook(fraction);
                }
            }
            hook(1.0);
            TransportBody::Memory(Bytes::from(buf))
        } else {
            TransportBody::Memory(response.bytes().await.map_err(|e| classify(&e))?)
        };

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}
