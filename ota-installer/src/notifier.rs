// Provider status reporting (MIDlet-Install-Notify).

use crate::download::Credentials;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Terminal outcome reported to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OtaStatus {
    Success,
    InsufficientMemory,
    UserCancelled,
    SizeMismatch,
    AttributeMismatch,
    InvalidDescriptor,
    InvalidArchive,
    IncompatibleDevice,
    AuthorizationFailure,
    PushRegistrationFailure,
    ContentHandlerConflict,
}

impl OtaStatus {
    pub fn code(self) -> u16 {
        match self {
            Self::Success => 900,
            Self::InsufficientMemory => 901,
            Self::UserCancelled => 902,
            Self::SizeMismatch => 904,
            Self::AttributeMismatch => 905,
            Self::InvalidDescriptor => 906,
            Self::InvalidArchive => 907,
            Self::IncompatibleDevice => 908,
            Self::AuthorizationFailure => 910,
            Self::PushRegistrationFailure => 911,
            Self::ContentHandlerConflict => 938,
        }
    }

    pub fn text(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::InsufficientMemory => "Insufficient Memory",
            Self::UserCancelled => "User Cancelled",
            Self::SizeMismatch => "JAR Size Mismatch",
            Self::AttributeMismatch => "Attribute Mismatch",
            Self::InvalidDescriptor => "Invalid Descriptor",
            Self::InvalidArchive => "Invalid JAR",
            Self::IncompatibleDevice => "Incompatible Configuration or Profile",
            Self::AuthorizationFailure => "Application Authorization Failure",
            Self::PushRegistrationFailure => "Push Registration Failure",
            Self::ContentHandlerConflict => "Content handler conflicts with other handlers",
        }
    }

    /// Body of the status report: `<code> <text>`.
    pub fn message(self) -> String {
        format!("{} {}", self.code(), self.text())
    }
}

/// Sends one status report toward a provider URL. Delivery is best-effort: implementations log
/// failures and never return them.
#[async_trait]
pub trait OtaNotifier: Send + Sync {
    async fn notify(&self, url: &str, status: OtaStatus, proxy_credentials: Option<&Credentials>);
}

/// Drops every report (used when notifications are disabled).
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentNotifier;

#[async_trait]
impl OtaNotifier for SilentNotifier {
    async fn notify(&self, url: &str, status: OtaStatus, _proxy: Option<&Credentials>) {
        debug!(
            "[PHASE: notify] [STEP: report] Notifications disabled; dropping report (status={}, url={})",
            status.code(),
            crate::utils::logging::mask_url_credentials(url)
        );
    }
}

/// POSTs the status line as `text/plain`.
pub struct HttpOtaNotifier {
    client: reqwest::Client,
}

impl HttpOtaNotifier {
    pub fn new(timeout: Duration, use_system_proxy: bool) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if !use_system_proxy {
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build notification HTTP client: {}", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl OtaNotifier for HttpOtaNotifier {
    async fn notify(&self, url: &str, status: OtaStatus, proxy_credentials: Option<&Credentials>) {
        let started = Instant::now();
        let masked = crate::utils::logging::mask_url_credentials(url);
        info!(
            "[PHASE: notify] [STEP: report] Sending status report (status={}, url={})",
            status.code(),
            masked
        );

        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(status.message());
        if let Some(creds) = proxy_credentials {
            request = request.header(reqwest::header::PROXY_AUTHORIZATION, creds.basic_header());
        }

        match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(
                    "[PHASE: notify] [STEP: report] Status report delivered (status={}, http_status={}, duration_ms={})",
                    status.code(),
                    resp.status().as_u16(),
                    started.elapsed().as_millis()
                );
            }
            Ok(resp) => {
                warn!(
                    "[PHASE: notify] [STEP: report] Provider rejected status report (status={}, http_status={}, url={})",
                    status.code(),
                    resp.status().as_u16(),
                    masked
                );
            }
            Err(e) => {
                warn!(
                    "[PHASE: notify] [STEP: report] Failed to deliver status report (status={}, url={}, err={})",
                    status.code(),
                    masked,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{CannedResponse, TestServer};

    #[test]
    fn status_messages_use_ota_codes() {
        assert_eq!(OtaStatus::Success.message(), "900 Success");
        assert_eq!(OtaStatus::UserCancelled.message(), "902 User Cancelled");
        assert_eq!(OtaStatus::InvalidArchive.code(), 907);
        assert_eq!(OtaStatus::ContentHandlerConflict.code(), 938);
    }

    #[tokio::test]
    async fn http_notifier_posts_status_line() {
        let server = TestServer::start(vec![("/notify", vec![CannedResponse::ok("text/plain", b"")])]).await;
        let notifier = HttpOtaNotifier::new(Duration::from_secs(5), false).unwrap();

        notifier
            .notify(&server.url("/notify"), OtaStatus::Success, None)
            .await;

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].body, b"900 Success".to_vec());
        assert_eq!(requests[0].header("content-type"), Some("text/plain"));
    }

    #[tokio::test]
    async fn http_notifier_swallows_delivery_failures() {
        let notifier = HttpOtaNotifier::new(Duration::from_secs(2), false).unwrap();
        // Nothing listens on port 9 of the loopback interface; the call must simply return.
        notifier
            .notify("http://127.0.0.1:9/notify", OtaStatus::UserCancelled, None)
            .await;
    }
}
