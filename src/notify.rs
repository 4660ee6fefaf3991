//! Best-effort webhook notifications
//!
//! Delivery failures are logged and never propagate to the workflow that
//! triggered the notification.

use reqwest::{Client, ClientBuilder};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::RecoveryConfig;

const DEFAULT_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyStatus {
    Success,
    Error,
}

/// Body posted to the webhook
#[derive(Debug, Serialize)]
pub struct NotificationPayload<'a> {
    pub status: NotifyStatus,
    pub message: &'a str,
    pub service: &'a str,
}

/// Build the HTTP client, falling back to reqwest's defaults (no request timeout) on failure
fn build_client(builder: ClientBuilder) -> Client {
    match builder.build() {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "could not build webhook client, using defaults without a request timeout");
            Client::new()
        }
    }
}

pub struct Notifier {
    client: Client,
    url: Option<String>,
    service: String,
    attempts: u32,
    backoff: Duration,
}

impl Notifier {
    pub fn new(url: Option<String>, service: &str) -> Self {
        let client = build_client(Client::builder().timeout(REQUEST_TIMEOUT));
        Self {
            client,
            url,
            service: service.to_string(),
            attempts: DEFAULT_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }

    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self::new(config.webhook_url.clone(), &config.service_name)
    }

    /// A notifier with no webhook; every call is a no-op
    pub fn disabled() -> Self {
        Self::new(None, "lifeboat")
    }

    /// Override the retry policy (attempts are clamped to at least one)
    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }

    /// Post a notification, retrying with doubling backoff; returns whether it was delivered
    pub async fn notify(&self, status: NotifyStatus, message: &str) -> bool {
        let Some(url) = self.url.as_deref() else {
            debug!(?status, "no webhook configured, skipping notification");
            return false;
        };
        let payload = NotificationPayload {
            status,
            message,
            service: &self.service,
        };

        let mut delay = self.backoff;
        for attempt in 1..=self.attempts {
            match self.client.post(url).json(&payload).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(?status, attempt, "notification delivered");
                    return true;
                }
                Ok(resp) => {
                    warn!(attempt, http_status = resp.status().as_u16(), "webhook rejected notification");
                }
                Err(e) => {
                    warn!(attempt, error = %e, "webhook delivery failed");
                }
            }
            if attempt < self.attempts {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }

        error!(
            attempts = self.attempts,
            ?status,
            notification = message,
            "giving up on webhook notification"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_payload_shape() {
        let payload = NotificationPayload {
            status: NotifyStatus::Error,
            message: "Database backup failed",
            service: "lifeboat",
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "status": "error",
                "message": "Database backup failed",
                "service": "lifeboat"
            })
        );
    }

    #[test]
    fn test_client_build_failure_falls_back() {
        // An invalid header value only surfaces when the client is built
        let client = build_client(Client::builder().user_agent("lifeboat\nnotifier"));
        assert!(client.get("http://127.0.0.1:1/hook").build().is_ok());
    }

    #[tokio::test]
    async fn test_disabled_notifier_is_noop() {
        let notifier = Notifier::disabled();
        assert!(!notifier.is_enabled());
        assert!(!notifier.notify(NotifyStatus::Success, "ok").await);
    }

    #[tokio::test]
    async fn test_unreachable_webhook_does_not_fail() {
        let notifier = Notifier::new(Some("http://127.0.0.1:1/hook".to_string()), "lifeboat")
            .with_retry(2, Duration::from_millis(10));
        assert!(!notifier.notify(NotifyStatus::Error, "boom").await);
    }

    #[tokio::test]
    async fn test_delivers_json_body() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.ends_with(b"}") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });

        let notifier = Notifier::new(Some(format!("http://{}/hook", addr)), "attribution-api");
        assert!(notifier.notify(NotifyStatus::Success, "Database backup completed").await);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /hook"));
        assert!(request.contains(r#""status":"success""#));
        assert!(request.contains(r#""service":"attribution-api""#));
    }
}
