// Resource downloader for descriptors and archives.
//
// IMPORTANT:
// - Never log credentials; URLs pass through `mask_url_credentials`.
// - Cancellation is observed while waiting on the network and between 1 KiB writes.

use crate::error::{InstallError, InstallErrorKind};
use crate::utils::logging::{mask_sensitive, mask_url_credentials};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, info, warn};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::StatusCode;
use std::fmt;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Media type of an application descriptor.
pub const DESCRIPTOR_MEDIA_TYPE: &str = "text/vnd.sun.j2me.app-descriptor";
/// Media types accepted for a suite archive.
pub const ARCHIVE_MEDIA_TYPES: &[&str] = &["application/java", "application/java-archive"];
/// Largest single write into the sink, and the progress reporting granularity.
pub const TRANSFER_UNIT: usize = 1024;

const ACCEPT_CHARSET: &str = "UTF-8, ISO-8859-1";

/// Username/password pair for Basic authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// `Basic <base64(user:password)>`
    pub fn basic_header(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", STANDARD.encode(raw.as_bytes()))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &mask_sensitive(&self.username))
            .field("password", &"***")
            .finish()
    }
}

/// What is being fetched; drives content negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Descriptor,
    Archive,
}

impl ResourceKind {
    pub fn media_types(self) -> &'static [&'static str] {
        match self {
            Self::Descriptor => &[DESCRIPTOR_MEDIA_TYPE],
            Self::Archive => ARCHIVE_MEDIA_TYPES,
        }
    }

    /// Descriptors are requested with `Accept: */*` and checked afterwards.
    fn sends_accept_types(self) -> bool {
        matches!(self, Self::Archive)
    }

    /// Some servers send archives without a Content-Type; descriptors must carry one.
    fn allows_missing_media_type(self) -> bool {
        matches!(self, Self::Archive)
    }

    fn label(self) -> &'static str {
        match self {
            Self::Descriptor => "descriptor",
            Self::Archive => "archive",
        }
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("server not found: {0}")]
    ServerNotFound(String),
    #[error("resource not found")]
    NotFound,
    #[error("unacceptable media type: {}", .0.as_deref().unwrap_or("<none>"))]
    InvalidMediaType(Option<String>),
    #[error("server requires authentication")]
    Unauthorized,
    #[error("proxy requires authentication")]
    ProxyAuth,
    #[error("server requests an authentication scheme other than Basic")]
    CannotAuthenticate,
    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error("download cancelled")]
    Cancelled,
    #[error("failed to write downloaded data: {0}")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    /// Map to the installer vocabulary, flavoured by the resource being fetched.
    pub fn into_install_error(self, kind: ResourceKind) -> InstallError {
        use InstallErrorKind as K;
        let descriptor = kind == ResourceKind::Descriptor;
        match self {
            Self::InvalidUrl(detail) => InstallError::with_detail(
                if descriptor { K::InvalidJadUrl } else { K::InvalidJarUrl },
                detail,
            ),
            Self::ServerNotFound(detail) => InstallError::with_detail(
                if descriptor { K::JadServerNotFound } else { K::JarServerNotFound },
                detail,
            ),
            Self::NotFound => {
                InstallError::new(if descriptor { K::JadNotFound } else { K::JarNotFound })
            }
            Self::InvalidMediaType(found) => {
                let kind = if descriptor { K::InvalidJadType } else { K::InvalidJarType };
                match found {
                    Some(found) => InstallError::with_detail(kind, found),
                    None => InstallError::new(kind),
                }
            }
            Self::Unauthorized => InstallError::new(K::Unauthorized),
            Self::ProxyAuth => InstallError::new(K::ProxyAuth),
            Self::CannotAuthenticate => InstallError::new(K::CannotAuthenticate),
            Self::HttpStatus(code) => {
                InstallError::with_detail(K::TransferFailed, format!("HTTP {}", code))
            }
            Self::Transfer(detail) => InstallError::with_detail(K::TransferFailed, detail),
            Self::Cancelled => InstallError::cancelled(),
            Self::Io(e) => InstallError::from(e),
        }
    }
}

/// Receives transfer progress. Returning an error aborts the transfer.
#[async_trait]
pub trait TransferObserver: Send + Sync {
    async fn on_progress(&self, bytes_so_far: u64) -> Result<(), DownloadError>;
}

/// Observer that ignores progress.
pub struct NoProgress;

#[async_trait]
impl TransferObserver for NoProgress {
    async fn on_progress(&self, _bytes_so_far: u64) -> Result<(), DownloadError> {
        Ok(())
    }
}

/// One fetch.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub kind: ResourceKind,
    pub credentials: Option<&'a Credentials>,
    pub proxy_credentials: Option<&'a Credentials>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub bytes: u64,
    pub media_type: Option<String>,
    /// `charset` parameter of the Content-Type, if any.
    pub charset: Option<String>,
}

/// Delay requested by a `Retry-After` header in seconds, capped. Absent or non-numeric values
/// (including HTTP dates) yield `None`: the caller stops retrying.
pub fn retry_delay(header: Option<&str>, cap: Duration) -> Option<Duration> {
    let secs: u64 = header?.trim().parse().ok()?;
    Some(Duration::from_secs(secs).min(cap))
}

/// `text/plain; charset=ISO-8859-1` -> (`text/plain`, `ISO-8859-1`)
pub fn parse_content_type(value: &str) -> (String, Option<String>) {
    let mut parts = value.split(';');
    let media_type = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    let charset = parts.find_map(|p| {
        let (k, v) = p.split_once('=')?;
        if k.trim().eq_ignore_ascii_case("charset") {
            Some(v.trim().trim_matches('"').to_string())
        } else {
            None
        }
    });
    (media_type, charset)
}

fn supports_basic_auth(challenge: Option<&str>) -> bool {
    challenge
        .map(|c| c.trim_start().to_ascii_lowercase().starts_with("basic"))
        .unwrap_or(false)
}

/// Settings for [`ResourceDownloader`].
#[derive(Debug, Clone)]
pub struct DownloaderSettings {
    pub user_agent: String,
    pub locale: Option<String>,
    pub max_retry_after: Duration,
    pub connect_timeout: Duration,
    pub use_system_proxy: bool,
}

pub struct ResourceDownloader {
    client: reqwest::Client,
    settings: DownloaderSettings,
}

impl ResourceDownloader {
    pub fn new(settings: DownloaderSettings) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().connect_timeout(settings.connect_timeout);
        if !settings.use_system_proxy {
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build download HTTP client: {}", e))?;
        Ok(Self { client, settings })
    }

    fn request_headers(&self, request: &FetchRequest<'_>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let accept = if request.kind.sends_accept_types() {
            request.kind.media_types().join(", ")
        } else {
            "*/*".to_string()
        };
        let pairs = [
            (header::ACCEPT, Some(accept)),
            (header::ACCEPT_CHARSET, Some(ACCEPT_CHARSET.to_string())),
            (header::ACCEPT_LANGUAGE, self.settings.locale.clone()),
            (header::USER_AGENT, Some(self.settings.user_agent.clone())),
            (
                header::AUTHORIZATION,
                request.credentials.map(Credentials::basic_header),
            ),
            (
                header::PROXY_AUTHORIZATION,
                request.proxy_credentials.map(Credentials::basic_header),
            ),
        ];
        for (name, value) in pairs {
            let Some(value) = value else { continue };
            match HeaderValue::from_str(&value) {
                Ok(v) => {
                    headers.insert(name, v);
                }
                Err(_) => warn!(
                    "[PHASE: download] [STEP: headers] Skipping header with invalid characters (header={})",
                    name
                ),
            }
        }
        headers
    }

    /// Fetch `request.url` into `sink`, returning the number of bytes written.
    pub async fn fetch<W>(
        &self,
        request: &FetchRequest<'_>,
        sink: &mut W,
        observer: &dyn TransferObserver,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, DownloadError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let started = Instant::now();
        let masked = mask_url_credentials(request.url);
        info!(
            "[PHASE: download] [STEP: fetch] fetch entered (resource={}, url={}, credentials={}, proxy_credentials={})",
            request.kind.label(),
            masked,
            request.credentials.is_some(),
            request.proxy_credentials.is_some()
        );

        let url = validate_url(request.url)?;
        let headers = self.request_headers(request);

        let mut attempt = 0u32;
        let response = loop {
            attempt += 1;
            let send = self.client.get(url.clone()).headers(headers.clone()).send();
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                res = send => res.map_err(|e| {
                    warn!(
                        "[PHASE: download] [STEP: connect] Request failed (url={}, attempt={}, err={})",
                        masked, attempt, e
                    );
                    if e.is_builder() {
                        DownloadError::InvalidUrl(e.to_string())
                    } else if e.is_connect() || e.is_timeout() {
                        DownloadError::ServerNotFound(e.to_string())
                    } else {
                        DownloadError::Transfer(e.to_string())
                    }
                })?,
            };

            if response.status() != StatusCode::SERVICE_UNAVAILABLE {
                break response;
            }
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok());
            match retry_delay(retry_after, self.settings.max_retry_after) {
                Some(delay) => {
                    warn!(
                        "[PHASE: download] [STEP: retry] Server busy; retrying (url={}, attempt={}, retry_after={:?}, delay_ms={})",
                        masked,
                        attempt,
                        retry_after,
                        delay.as_millis()
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => break response,
            }
        };

        let status = response.status();
        debug!(
            "[PHASE: download] [STEP: status] Response received (url={}, status={}, attempts={})",
            masked,
            status.as_u16(),
            attempt
        );
        match status {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(DownloadError::NotFound),
            StatusCode::NOT_ACCEPTABLE => return Err(DownloadError::InvalidMediaType(None)),
            StatusCode::UNAUTHORIZED => {
                let challenge = response
                    .headers()
                    .get(header::WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok());
                if !supports_basic_auth(challenge) {
                    return Err(DownloadError::CannotAuthenticate);
                }
                return Err(DownloadError::Unauthorized);
            }
            StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
                let challenge = response
                    .headers()
                    .get(header::PROXY_AUTHENTICATE)
                    .or_else(|| response.headers().get(header::WWW_AUTHENTICATE))
                    .and_then(|v| v.to_str().ok());
                if !supports_basic_auth(challenge) {
                    return Err(DownloadError::CannotAuthenticate);
                }
                return Err(DownloadError::ProxyAuth);
            }
            other => return Err(DownloadError::HttpStatus(other.as_u16())),
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(parse_content_type);
        let (media_type, charset) = match content_type {
            Some((media_type, charset)) if !media_type.is_empty() => (Some(media_type), charset),
            _ => (None, None),
        };
        match media_type.as_deref() {
            Some(mt) if request.kind.media_types().iter().any(|t| *t == mt) => {}
            None if request.kind.allows_missing_media_type() => {}
            _ => return Err(DownloadError::InvalidMediaType(media_type)),
        }

        let bytes = transfer(response, sink, observer, cancel).await?;

        info!(
            "[PHASE: download] [STEP: fetch] fetch exit (resource={}, url={}, bytes={}, duration_ms={})",
            request.kind.label(),
            masked,
            bytes,
            started.elapsed().as_millis()
        );
        Ok(DownloadOutcome {
            bytes,
            media_type,
            charset,
        })
    }
}

fn validate_url(raw: &str) -> Result<url::Url, DownloadError> {
    let url = url::Url::parse(raw.trim()).map_err(|e| DownloadError::InvalidUrl(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(DownloadError::InvalidUrl(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(DownloadError::InvalidUrl("missing host".to_string()));
    }
    Ok(url)
}

/// Stream the body into `sink` in writes of at most [`TRANSFER_UNIT`] bytes, reporting progress
/// at every completed unit and at end of stream.
async fn transfer<W>(
    mut response: reqwest::Response,
    sink: &mut W,
    observer: &dyn TransferObserver,
    cancel: &CancellationToken,
) -> Result<u64, DownloadError>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    let unit = TRANSFER_UNIT as u64;
    let mut total: u64 = 0;

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            chunk = response.chunk() => chunk.map_err(|e| DownloadError::Transfer(e.to_string()))?,
        };
        let Some(chunk) = chunk else { break };

        let mut rest: &[u8] = &chunk;
        while !rest.is_empty() {
            let room = (unit - total % unit) as usize;
            let n = room.min(rest.len());
            sink.write_all(&rest[..n]).await?;
            total += n as u64;
            rest = &rest[n..];
            if total % unit == 0 {
                observer.on_progress(total).await?;
            }
        }
    }

    sink.flush().await?;
    if total == 0 || total % unit != 0 {
        observer.on_progress(total).await?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{CannedResponse, TestServer};
    use std::sync::Mutex;

    fn downloader() -> ResourceDownloader {
        ResourceDownloader::new(DownloaderSettings {
            user_agent: "Profile/MIDP-2.1 Configuration/CLDC-1.1".to_string(),
            locale: Some("en-US".to_string()),
            max_retry_after: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            use_system_proxy: false,
        })
        .unwrap()
    }

    fn request(url: &str, kind: ResourceKind) -> FetchRequest<'_> {
        FetchRequest {
            url,
            kind,
            credentials: None,
            proxy_credentials: None,
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        seen: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl TransferObserver for RecordingObserver {
        async fn on_progress(&self, bytes_so_far: u64) -> Result<(), DownloadError> {
            self.seen.lock().unwrap().push(bytes_so_far);
            Ok(())
        }
    }

    #[test]
    fn retry_after_is_capped() {
        let cap = Duration::from_secs(60);
        assert_eq!(retry_delay(Some("3600"), cap), Some(Duration::from_secs(60)));
        assert_eq!(retry_delay(Some(" 5 "), cap), Some(Duration::from_secs(5)));
        assert_eq!(retry_delay(Some("Fri, 31 Dec 1999 23:59:59 GMT"), cap), None);
        assert_eq!(retry_delay(None, cap), None);
    }

    #[test]
    fn content_type_parsing() {
        assert_eq!(
            parse_content_type("Text/Vnd.Sun.J2ME.App-Descriptor; charset=\"ISO-8859-1\""),
            (
                "text/vnd.sun.j2me.app-descriptor".to_string(),
                Some("ISO-8859-1".to_string())
            )
        );
        assert_eq!(parse_content_type("application/java"), ("application/java".to_string(), None));
    }

    #[test]
    fn basic_header_encodes_credentials() {
        let creds = Credentials::new("Aladdin", "open sesame");
        assert_eq!(creds.basic_header(), "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
        assert!(!format!("{:?}", creds).contains("open sesame"));
    }

    #[tokio::test]
    async fn descriptor_fetch_sends_negotiation_headers() {
        let server = TestServer::start(vec![(
            "/app.jad",
            vec![CannedResponse::ok(
                "text/vnd.sun.j2me.app-descriptor; charset=UTF-8",
                b"MIDlet-Name: A\n",
            )],
        )])
        .await;
        let url = server.url("/app.jad");
        let creds = Credentials::new("user", "secret");
        let mut req = request(&url, ResourceKind::Descriptor);
        req.credentials = Some(&creds);

        let mut body = Vec::new();
        let outcome = downloader()
            .fetch(&req, &mut body, &NoProgress, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(body, b"MIDlet-Name: A\n".to_vec());
        assert_eq!(outcome.charset.as_deref(), Some("UTF-8"));
        let sent = &server.requests()[0];
        assert_eq!(sent.header("accept"), Some("*/*"));
        assert_eq!(sent.header("accept-charset"), Some("UTF-8, ISO-8859-1"));
        assert_eq!(sent.header("accept-language"), Some("en-US"));
        assert_eq!(
            sent.header("user-agent"),
            Some("Profile/MIDP-2.1 Configuration/CLDC-1.1")
        );
        assert_eq!(sent.header("authorization"), Some("Basic dXNlcjpzZWNyZXQ="));
    }

    #[tokio::test]
    async fn archive_fetch_lists_acceptable_types_and_allows_missing_type() {
        let server = TestServer::start(vec![(
            "/app.jar",
            vec![CannedResponse::status(200).body(b"PK")],
        )])
        .await;
        let url = server.url("/app.jar");
        let mut body = Vec::new();
        downloader()
            .fetch(
                &request(&url, ResourceKind::Archive),
                &mut body,
                &NoProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            server.requests()[0].header("accept"),
            Some("application/java, application/java-archive")
        );
    }

    #[tokio::test]
    async fn descriptor_with_wrong_media_type_is_rejected() {
        let server = TestServer::start(vec![(
            "/app.jad",
            vec![CannedResponse::ok("text/html", b"<html/>")],
        )])
        .await;
        let url = server.url("/app.jad");
        let err = downloader()
            .fetch(
                &request(&url, ResourceKind::Descriptor),
                &mut Vec::new(),
                &NoProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(
            matches!(err, DownloadError::InvalidMediaType(Some(ref t)) if t == "text/html"),
            "unexpected error: {:?}",
            err
        );
    }

    #[tokio::test]
    async fn status_codes_map_to_distinct_errors() {
        let server = TestServer::start(vec![
            ("/missing", vec![CannedResponse::status(404)]),
            ("/refused", vec![CannedResponse::status(406)]),
            (
                "/basic",
                vec![CannedResponse::status(401).header("WWW-Authenticate", "Basic realm=\"ota\"")],
            ),
            (
                "/digest",
                vec![CannedResponse::status(401).header("WWW-Authenticate", "Digest realm=\"ota\"")],
            ),
            (
                "/proxy",
                vec![CannedResponse::status(407).header("Proxy-Authenticate", "basic realm=\"p\"")],
            ),
            ("/broken", vec![CannedResponse::status(500)]),
        ])
        .await;
        let d = downloader();
        let token = CancellationToken::new();

        let fetch = |path: &'static str| {
            let url = server.url(path);
            let d = &d;
            let token = &token;
            async move {
                d.fetch(
                    &request(&url, ResourceKind::Descriptor),
                    &mut Vec::new(),
                    &NoProgress,
                    token,
                )
                .await
                .unwrap_err()
            }
        };

        assert!(matches!(fetch("/missing").await, DownloadError::NotFound));
        assert!(matches!(fetch("/refused").await, DownloadError::InvalidMediaType(None)));
        assert!(matches!(fetch("/basic").await, DownloadError::Unauthorized));
        assert!(matches!(fetch("/digest").await, DownloadError::CannotAuthenticate));
        assert!(matches!(fetch("/proxy").await, DownloadError::ProxyAuth));
        assert!(matches!(fetch("/broken").await, DownloadError::HttpStatus(500)));
    }

    #[tokio::test]
    async fn service_unavailable_retries_after_delay() {
        let server = TestServer::start(vec![(
            "/app.jad",
            vec![
                CannedResponse::status(503).header("Retry-After", "0"),
                CannedResponse::ok(DESCRIPTOR_MEDIA_TYPE, b"MIDlet-Name: A\n"),
            ],
        )])
        .await;
        let url = server.url("/app.jad");
        let mut body = Vec::new();
        downloader()
            .fetch(
                &request(&url, ResourceKind::Descriptor),
                &mut body,
                &NoProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(server.requests().len(), 2, "503 should be retried once");
        assert_eq!(body, b"MIDlet-Name: A\n".to_vec());
    }

    #[tokio::test]
    async fn service_unavailable_without_retry_after_stops_retrying() {
        let server = TestServer::start(vec![("/app.jad", vec![CannedResponse::status(503)])]).await;
        let url = server.url("/app.jad");
        let err = downloader()
            .fetch(
                &request(&url, ResourceKind::Descriptor),
                &mut Vec::new(),
                &NoProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::HttpStatus(503)));
        assert_eq!(server.requests().len(), 1);
    }

    #[tokio::test]
    async fn progress_is_reported_per_kib_and_at_end() {
        let payload = vec![7u8; 2 * 1024 + 100];
        let server = TestServer::start(vec![(
            "/app.jar",
            vec![CannedResponse::ok("application/java-archive", &payload)],
        )])
        .await;
        let url = server.url("/app.jar");
        let observer = RecordingObserver::default();
        let mut body = Vec::new();
        let outcome = downloader()
            .fetch(
                &request(&url, ResourceKind::Archive),
                &mut body,
                &observer,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.bytes, payload.len() as u64);
        assert_eq!(body, payload);
        assert_eq!(*observer.seen.lock().unwrap(), vec![1024, 2048, 2148]);
    }

    #[tokio::test]
    async fn observer_error_aborts_transfer() {
        struct StopAfterFirst;
        #[async_trait]
        impl TransferObserver for StopAfterFirst {
            async fn on_progress(&self, _bytes: u64) -> Result<(), DownloadError> {
                Err(DownloadError::Cancelled)
            }
        }

        let payload = vec![1u8; 8 * 1024];
        let server = TestServer::start(vec![(
            "/app.jar",
            vec![CannedResponse::ok("application/java", &payload)],
        )])
        .await;
        let url = server.url("/app.jar");
        let mut body = Vec::new();
        let err = downloader()
            .fetch(
                &request(&url, ResourceKind::Archive),
                &mut body,
                &StopAfterFirst,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Cancelled));
        assert_eq!(body.len(), 1024, "nothing past the first unit may be written");
    }

    #[tokio::test]
    async fn invalid_and_unreachable_urls_are_distinguished() {
        let d = downloader();
        let token = CancellationToken::new();

        let err = d
            .fetch(
                &request("ftp://h.example/app.jad", ResourceKind::Descriptor),
                &mut Vec::new(),
                &NoProgress,
                &token,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::InvalidUrl(_)));

        let err = d
            .fetch(
                &request("http://127.0.0.1:9/app.jad", ResourceKind::Descriptor),
                &mut Vec::new(),
                &NoProgress,
                &token,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::ServerNotFound(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_request_completes() {
        let token = CancellationToken::new();
        token.cancel();
        let err = downloader()
            .fetch(
                &request("http://127.0.0.1:9/app.jad", ResourceKind::Descriptor),
                &mut Vec::new(),
                &NoProgress,
                &token,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Cancelled));
    }
}
