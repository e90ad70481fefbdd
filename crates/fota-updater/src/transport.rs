//! Byte transport for manifests and firmware payloads.
//!
//! A [`Transport`] turns a URL into a status, a few headers and a buffered
//! byte stream. Three implementations are provided:
//!
//! - [`HttpTransport`]: reqwest over rustls, optionally pinned to a root CA
//! - [`FileTransport`]: local files, for updates staged on disk
//! - [`MemoryTransport`]: canned responses, for hosts without a network

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use tokio::io::{AsyncBufRead, BufReader};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::asset::CryptoAsset;
use crate::error::UpdateError;

/// Buffered payload body. `fill_buf` is the "data available" wait and its
/// first byte is a non-consuming peek.
pub type PayloadStream = Box<dyn AsyncBufRead + Send + Unpin>;

const CONNECT_TIMEOUT_SECS: u64 = 30;

/// A fetched resource.
pub struct FetchResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub body: PayloadStream,
}

impl FetchResponse {
    /// Only `200 OK` and `301 Moved Permanently` carry a usable body.
    pub fn is_success(&self) -> bool {
        matches!(self.status, 200 | 301)
    }
}

impl fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Payload encodings the transfer engine accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// `application/octet-stream`
    Raw,
    /// `application/gzip`, accepted since zlib payloads are supported
    Gzip,
}

impl PayloadKind {
    /// Classify a `Content-Type` header value, ignoring parameters.
    pub fn from_content_type(content_type: Option<&str>) -> Option<Self> {
        let essence = content_type?.split(';').next()?.trim().to_ascii_lowercase();
        match essence.as_str() {
            "application/octet-stream" => Some(Self::Raw),
            "application/gzip" => Some(Self::Gzip),
            _ => None,
        }
    }
}

/// Source of manifests and payloads.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a GET for `url`, forwarding `headers`.
    ///
    /// Non-success statuses are returned as responses, not errors; errors
    /// are reserved for requests that could not be made at all.
    async fn fetch(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<FetchResponse, UpdateError>;
}

/// HTTP(S) transport.
///
/// In strict mode every `https` request is verified against the configured
/// root CA only; a strict request without a usable root CA is refused before
/// any connection is made.
pub struct HttpTransport {
    client: reqwest::Client,
    strict: bool,
    has_root_ca: bool,
}

impl HttpTransport {
    /// Build a transport.
    ///
    /// # Arguments
    ///
    /// * `root_ca` - trust anchor for `https` URLs (PEM or DER)
    /// * `allow_insecure` - skip certificate verification entirely
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the root CA does not parse as a certificate.
    pub fn new(root_ca: Option<&CryptoAsset>, allow_insecure: bool) -> Result<Self, UpdateError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .user_agent(format!("fota-updater/{}", env!("CARGO_PKG_VERSION")));

        let mut has_root_ca = false;
        if allow_insecure {
            warn!("TLS certificate verification disabled");
            builder = builder.danger_accept_invalid_certs(true);
        } else if let Some(asset) = root_ca.filter(|a| a.is_usable()) {
            let bytes = asset.get();
            let certificate = reqwest::Certificate::from_pem(bytes)
                .or_else(|_| reqwest::Certificate::from_der(bytes))
                .map_err(|e| {
                    UpdateError::ConfigError(format!("root CA {}: {}", asset.name(), e))
                })?;
            builder = builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(certificate);
            has_root_ca = true;
        }

        Ok(Self {
            client: builder.build()?,
            strict: !allow_insecure,
            has_root_ca,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<FetchResponse, UpdateError> {
        if self.strict && !self.has_root_ca && url.starts_with("https://") {
            return Err(UpdateError::MissingRootCa);
        }

        debug!("Fetching URL: {}", url);
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| UpdateError::NetworkError(e.to_string()))?;

        let status = response.status().as_u16();
        let content_length = response.content_length();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        debug!(status, ?content_length, ?content_type, "Response received");

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e)));

        Ok(FetchResponse {
            status,
            content_length,
            content_type,
            body: Box::new(StreamReader::new(Box::pin(body))),
        })
    }
}

/// Serves files from the local filesystem.
///
/// `file://` prefixes are stripped; relative paths resolve against `root`.
#[derive(Debug, Clone)]
pub struct FileTransport {
    root: PathBuf,
}

impl FileTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, url: &str) -> PathBuf {
        let path = Path::new(url.strip_prefix("file://").unwrap_or(url));
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

#[async_trait]
impl Transport for FileTransport {
    async fn fetch(
        &self,
        url: &str,
        _headers: &[(String, String)],
    ) -> Result<FetchResponse, UpdateError> {
        let path = self.resolve(url);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "File not found");
                return Ok(FetchResponse {
                    status: 404,
                    content_length: None,
                    content_type: None,
                    body: Box::new(tokio::io::empty()),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata().await?.len();
        debug!(path = %path.display(), len, "Serving local file");
        Ok(FetchResponse {
            status: 200,
            content_length: Some(len),
            content_type: Some("application/octet-stream".to_string()),
            body: Box::new(BufReader::new(file)),
        })
    }
}

/// A canned response for [`MemoryTransport`].
#[derive(Debug, Clone)]
pub struct MemoryResource {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    /// Reported length, `None` for chunked responses
    pub content_length: Option<u64>,
    /// Bytes handed out per read
    pub chunk_size: usize,
    /// Stop producing data after this many bytes, without ending the stream
    pub stall_after: Option<usize>,
}

impl MemoryResource {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::with_type(body, "application/octet-stream")
    }

    pub fn json(body: impl Into<Vec<u8>>) -> Self {
        Self::with_type(body, "application/json")
    }

    pub fn with_type(body: impl Into<Vec<u8>>, content_type: &str) -> Self {
        let body = body.into();
        Self {
            status: 200,
            content_type: Some(content_type.to_string()),
            content_length: Some(body.len() as u64),
            body,
            chunk_size: 1024,
            stall_after: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            body: Vec::new(),
            content_length: Some(0),
            chunk_size: 1024,
            stall_after: None,
        }
    }

    pub fn chunked(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn unknown_length(mut self) -> Self {
        self.content_length = None;
        self
    }

    pub fn stalling_after(mut self, bytes: usize) -> Self {
        self.stall_after = Some(bytes);
        self
    }

    fn stream(&self) -> PayloadStream {
        let visible = self
            .stall_after
            .map_or(&self.body[..], |n| &self.body[..n.min(self.body.len())]);
        let chunks: Vec<io::Result<Bytes>> = visible
            .chunks(self.chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let chunks = stream::iter(chunks);

        if self.stall_after.is_some() {
            Box::new(StreamReader::new(chunks.chain(stream::pending())))
        } else {
            Box::new(StreamReader::new(chunks))
        }
    }
}

/// Serves [`MemoryResource`]s by exact URL and records every request.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    resources: Mutex<HashMap<String, MemoryResource>>,
    requests: Mutex<Vec<(String, Vec<(String, String)>)>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(self, url: impl Into<String>, resource: MemoryResource) -> Self {
        if let Ok(mut resources) = self.resources.lock() {
            resources.insert(url.into(), resource);
        }
        self
    }

    /// Requested URLs with their headers, oldest first.
    pub fn requests(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn requested_urls(&self) -> Vec<String> {
        self.requests().into_iter().map(|(url, _)| url).collect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn fetch(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<FetchResponse, UpdateError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push((url.to_string(), headers.to_vec()));
        }

        let resource = self
            .resources
            .lock()
            .ok()
            .and_then(|r| r.get(url).cloned())
            .unwrap_or_else(|| MemoryResource::status(404));

        Ok(FetchResponse {
            status: resource.status,
            content_length: resource.content_length,
            content_type: resource.content_type.clone(),
            body: resource.stream(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_success_statuses() {
        for (status, ok) in [(200, true), (301, true), (302, false), (204, false), (404, false)] {
            let response = FetchResponse {
                status,
                content_length: None,
                content_type: None,
                body: Box::new(tokio::io::empty()),
            };
            assert_eq!(response.is_success(), ok, "{status}");
        }
    }

    #[test]
    fn test_payload_kind() {
        assert_eq!(
            PayloadKind::from_content_type(Some("application/octet-stream")),
            Some(PayloadKind::Raw)
        );
        assert_eq!(
            PayloadKind::from_content_type(Some("Application/Gzip; charset=binary")),
            Some(PayloadKind::Gzip)
        );
        assert_eq!(PayloadKind::from_content_type(Some("application/x-tar")), None);
        assert_eq!(PayloadKind::from_content_type(Some("text/html")), None);
        assert_eq!(PayloadKind::from_content_type(None), None);
    }

    #[tokio::test]
    async fn test_memory_transport_records_requests() {
        let transport = MemoryTransport::new().serve("http://h/fw.bin", MemoryResource::ok(vec![7u8; 3000]).chunked(1000));
        let headers = vec![("Authorization".to_string(), "Bearer t".to_string())];

        let mut response = transport.fetch("http://h/fw.bin", &headers).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.content_length, Some(3000));

        let mut body = Vec::new();
        response.body.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, vec![7u8; 3000]);

        let missing = transport.fetch("http://h/other", &[]).await.unwrap();
        assert_eq!(missing.status, 404);

        let requests = transport.requests();
        assert_eq!(requests[0].1, headers);
        assert_eq!(transport.requested_urls(), vec!["http://h/fw.bin", "http://h/other"]);
    }

    #[tokio::test]
    async fn test_file_transport() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("fw.bin"), b"firmware").unwrap();
        let transport = FileTransport::new(dir.path());

        let mut response = transport.fetch("fw.bin", &[]).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.content_length, Some(8));
        let mut body = Vec::new();
        response.body.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"firmware");

        let absolute = format!("file://{}", dir.path().join("fw.bin").display());
        assert_eq!(transport.fetch(&absolute, &[]).await.unwrap().status, 200);
        assert_eq!(transport.fetch("missing.bin", &[]).await.unwrap().status, 404);
    }

    #[tokio::test]
    async fn test_strict_https_without_root_ca() {
        let transport = HttpTransport::new(None, false).unwrap();
        let result = transport.fetch("https://example.invalid/manifest.json", &[]).await;
        assert!(matches!(result, Err(UpdateError::MissingRootCa)));
    }
}
