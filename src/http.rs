//! HTTPS-only HTTP transport for registry metadata and model artifacts.
//!
//! [`Transport`] is the seam the download engine and registry talk through;
//! [`HttpClient`] implements it over a blocking `ureq` agent with explicit
//! timeouts, manual redirect following, chunked body streaming with progress,
//! and cooperative cancellation.

use crate::error::{ErrorKind, Result, SdkError};
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// Bytes read from the wire per chunk.
pub const CHUNK_SIZE: usize = 8_192;

const MAX_REDIRECTS: usize = 5;
const USER_AGENT: &str = concat!("selkie/", env!("CARGO_PKG_VERSION"));

/// Cooperative cancellation flag shared between a caller and an in-flight
/// transfer.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; the transfer stops at the next chunk boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Byte transport abstraction over HTTP.
///
/// Implemented by [`HttpClient`] in production; tests substitute scripted
/// implementations to exercise retry, resume and corruption paths without a
/// network.
pub trait Transport: Send + Sync {
    /// Reject URLs this transport will not touch. Called before any I/O or
    /// filesystem side effect.
    fn validate_url(&self, _url: &str) -> Result<()> {
        Ok(())
    }

    /// Stream the response body of `url` starting at byte `offset` into
    /// `sink`. `on_bytes` receives the cumulative count of bytes received by
    /// this call after each chunk. Returns the total bytes written.
    fn fetch(
        &self,
        url: &str,
        offset: u64,
        cancel: &CancelFlag,
        sink: &mut dyn Write,
        on_bytes: &mut dyn FnMut(u64),
    ) -> Result<u64>;

    /// GET `url` and return the body as text.
    fn fetch_text(&self, url: &str) -> Result<String>;

    /// Content length of `url` via HEAD, when the server reports one.
    fn content_length(&self, url: &str) -> Result<Option<u64>>;
}

/// Blocking HTTPS client over `ureq`.
pub struct HttpClient {
    agent: ureq::Agent,
    allow_insecure: bool,
}

impl HttpClient {
    /// Client with the default HTTPS-only policy.
    pub fn new() -> Self {
        Self {
            agent: build_agent(),
            allow_insecure: false,
        }
    }

    /// Client that additionally accepts plain `http://` URLs.
    ///
    /// Exists for tests against loopback mock servers; production code paths
    /// construct [`HttpClient::new`].
    pub fn allow_insecure() -> Self {
        Self {
            agent: build_agent(),
            allow_insecure: true,
        }
    }

    fn scheme_error(url: &str) -> SdkError {
        SdkError::new(
            ErrorKind::InvalidInputParameterValue,
            "only HTTPS URLs are supported for registry and model transfers",
            format!("url={url}"),
        )
        .with_recovery("use an https:// URL")
    }

    /// Issue a GET for `url`, following up to [`MAX_REDIRECTS`] redirects.
    /// Every hop is scheme-validated before it is contacted.
    fn get_response(&self, url: &str, offset: u64) -> Result<ureq::Response> {
        let mut current = url.to_owned();
        for _ in 0..=MAX_REDIRECTS {
            self.validate_url(&current)?;
            let mut req = self.agent.get(&current).set("User-Agent", USER_AGENT);
            if offset > 0 {
                req = req.set("Range", &format!("bytes={offset}-"));
            }
            match req.call() {
                Ok(resp) => {
                    let status = resp.status();
                    if (300..400).contains(&status) {
                        match resp.header("Location") {
                            Some(location) => {
                                debug!(status, location, "following redirect");
                                current = resolve_location(&current, location);
                                continue;
                            }
                            None => return Err(http_status_error(status, &current)),
                        }
                    }
                    if offset > 0 && status == 200 {
                        return Err(SdkError::new(
                            ErrorKind::NetworkHTTPError,
                            "server ignored the range request for a resumed transfer",
                            format!("url={current} offset={offset} status=200"),
                        ));
                    }
                    return Ok(resp);
                }
                Err(ureq::Error::Status(code, resp)) => {
                    if (300..400).contains(&code) {
                        if let Some(location) = resp.header("Location") {
                            current = resolve_location(&current, location);
                            continue;
                        }
                    }
                    return Err(http_status_error(code, &current));
                }
                Err(ureq::Error::Transport(t)) => return Err(classify_transport(&t, &current)),
            }
        }
        Err(SdkError::new(
            ErrorKind::NetworkHTTPError,
            "redirect chain exceeded the supported depth",
            format!("url={url} max_redirects={MAX_REDIRECTS}"),
        ))
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HttpClient {
    fn validate_url(&self, url: &str) -> Result<()> {
        if url.starts_with("https://") {
            return Ok(());
        }
        if self.allow_insecure && url.starts_with("http://") {
            return Ok(());
        }
        Err(Self::scheme_error(url))
    }

    fn fetch(
        &self,
        url: &str,
        offset: u64,
        cancel: &CancelFlag,
        sink: &mut dyn Write,
        on_bytes: &mut dyn FnMut(u64),
    ) -> Result<u64> {
        self.validate_url(url)?;
        if cancel.is_cancelled() {
            return Err(cancelled_error(url));
        }
        let resp = self.get_response(url, offset)?;
        let mut reader = resp.into_reader();
        let mut buf = [0u8; CHUNK_SIZE];
        let mut received: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(cancelled_error(url));
            }
            let n = reader
                .read(&mut buf)
                .map_err(|e| body_read_error(url, &e))?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n])?;
            received += n as u64;
            on_bytes(received);
        }
        Ok(received)
    }

    fn fetch_text(&self, url: &str) -> Result<String> {
        self.validate_url(url)?;
        let resp = self.get_response(url, 0)?;
        resp.into_string().map_err(|e| body_read_error(url, &e))
    }

    fn content_length(&self, url: &str) -> Result<Option<u64>> {
        self.validate_url(url)?;
        let mut current = url.to_owned();
        for _ in 0..=MAX_REDIRECTS {
            self.validate_url(&current)?;
            match self
                .agent
                .head(&current)
                .set("User-Agent", USER_AGENT)
                .call()
            {
                Ok(resp) => {
                    let status = resp.status();
                    if (300..400).contains(&status) {
                        match resp.header("Location") {
                            Some(location) => {
                                current = resolve_location(&current, location);
                                continue;
                            }
                            None => return Err(http_status_error(status, &current)),
                        }
                    }
                    return Ok(resp
                        .header("Content-Length")
                        .and_then(|v| v.parse::<u64>().ok()));
                }
                Err(ureq::Error::Status(code, resp)) => {
                    if (300..400).contains(&code) {
                        if let Some(location) = resp.header("Location") {
                            current = resolve_location(&current, location);
                            continue;
                        }
                    }
                    return Err(http_status_error(code, &current));
                }
                Err(ureq::Error::Transport(t)) => return Err(classify_transport(&t, &current)),
            }
        }
        Err(SdkError::new(
            ErrorKind::NetworkHTTPError,
            "redirect chain exceeded the supported depth",
            format!("url={url} max_redirects={MAX_REDIRECTS}"),
        ))
    }
}

fn build_agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(10))
        .timeout_read(Duration::from_secs(30))
        .timeout_write(Duration::from_secs(20))
        .redirects(0)
        .build()
}

/// Resolve a `Location` header against the origin of the current URL.
fn resolve_location(current: &str, location: &str) -> String {
    if location.starts_with("http://") || location.starts_with("https://") {
        return location.to_owned();
    }
    if let Some(scheme_end) = current.find("://") {
        let authority = &current[scheme_end + 3..];
        let origin_end = authority
            .find('/')
            .map_or(current.len(), |i| scheme_end + 3 + i);
        let origin = &current[..origin_end];
        if location.starts_with('/') {
            return format!("{origin}{location}");
        }
    }
    location.to_owned()
}

fn cancelled_error(url: &str) -> SdkError {
    SdkError::new(
        ErrorKind::OperationCancelled,
        "transfer was cancelled by the caller",
        format!("url={url}"),
    )
}

fn http_status_error(status: u16, url: &str) -> SdkError {
    SdkError::new(
        ErrorKind::NetworkHTTPError,
        "server answered with a non-success HTTP status",
        format!("url={url} status={status}"),
    )
}

fn body_read_error(url: &str, e: &std::io::Error) -> SdkError {
    let kind = if e.kind() == std::io::ErrorKind::TimedOut
        || e.kind() == std::io::ErrorKind::WouldBlock
    {
        ErrorKind::NetworkConnectionTimeout
    } else {
        ErrorKind::NetworkUnreachable
    };
    SdkError::new(
        kind,
        "connection interrupted while reading the response body",
        format!("url={url} error={e}"),
    )
}

fn classify_transport(t: &ureq::Transport, url: &str) -> SdkError {
    let text = t.to_string();
    let lower = text.to_lowercase();
    if lower.contains("certificate")
        || lower.contains("tls")
        || lower.contains("ssl")
        || lower.contains("handshake")
    {
        return SdkError::new(
            ErrorKind::NetworkSSLError,
            "TLS negotiation or certificate validation failed",
            format!("url={url} error={text}"),
        );
    }
    let kind = match t.kind() {
        ureq::ErrorKind::Dns => ErrorKind::NetworkDNSFailure,
        ureq::ErrorKind::ConnectionFailed => ErrorKind::NetworkUnreachable,
        ureq::ErrorKind::Io => {
            if lower.contains("timed out") || lower.contains("timeout") {
                ErrorKind::NetworkConnectionTimeout
            } else {
                ErrorKind::NetworkUnreachable
            }
        }
        _ => ErrorKind::NetworkUnreachable,
    };
    SdkError::new(
        kind,
        "network transport failure while contacting the server",
        format!("url={url} error={text}"),
    )
}
