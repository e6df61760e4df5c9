//! C1: Sink Port -- the trait every delivery channel implements, plus
//! reference implementations.
//!
//! HTTP status classification in `WebhookPort::send` follows the same
//! buckets as the webhook mediation path it's grounded on: 2xx is success,
//! 429 is rate-limited (never counted as a hard failure), other 4xx is
//! permanent, 5xx is transient.

use aegis_common::model::{ChannelKind, Device, DeliveryOutcome};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::template::RenderedContent;

#[async_trait]
pub trait Sink: Send + Sync {
    fn channel(&self) -> ChannelKind;
    async fn send(&self, device: &Device, rendered: &RenderedContent) -> DeliveryOutcome;
}

/// Always-available sink that writes to the structured log. Useful as a
/// fallback channel and in tests.
pub struct LogSink;

#[async_trait]
impl Sink for LogSink {
    fn channel(&self) -> ChannelKind {
        ChannelKind::LogSink
    }

    async fn send(&self, device: &Device, rendered: &RenderedContent) -> DeliveryOutcome {
        tracing::info!(
            target = "aegis_notify::log_sink",
            device_id = %device.id,
            subject = %rendered.subject,
            body = %rendered.body,
            "notification"
        );
        DeliveryOutcome::Success
    }
}

/// Discards everything. Used where a channel is configured but no real
/// transport is wired up (demo/test default).
pub struct NoOpSink {
    channel: ChannelKind,
}

impl NoOpSink {
    pub fn new(channel: ChannelKind) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl Sink for NoOpSink {
    fn channel(&self) -> ChannelKind {
        self.channel
    }

    async fn send(&self, _device: &Device, _rendered: &RenderedContent) -> DeliveryOutcome {
        DeliveryOutcome::Success
    }
}

fn sign_payload(secret: &str, timestamp_ms: i64, body: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts a key of any length");
    mac.update(format!("{timestamp_ms}{body}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub struct WebhookPortConfig {
    pub signing_secret: Option<String>,
    pub timeout: Duration,
    /// Optional outbound rate limit; `None` means unlimited.
    pub max_per_second: Option<u32>,
}

impl Default for WebhookPortConfig {
    fn default() -> Self {
        Self {
            signing_secret: None,
            timeout: Duration::from_secs(10),
            max_per_second: None,
        }
    }
}

type WebhookRateLimiter = governor::RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// HTTP POST sink. `Sms` and `Slack` reuse this transport unmodified against
/// their own device addresses -- the original system had no dedicated
/// client for either, both were "POST a JSON body to a URL".
pub struct WebhookPort {
    client: reqwest::Client,
    config: WebhookPortConfig,
    channel: ChannelKind,
    rate_limiter: Option<WebhookRateLimiter>,
}

impl WebhookPort {
    pub fn new(channel: ChannelKind, config: WebhookPortConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("reqwest client builds with default TLS backend");
        let rate_limiter = config
            .max_per_second
            .and_then(std::num::NonZeroU32::new)
            .map(governor::Quota::per_second)
            .map(governor::RateLimiter::direct);
        Self {
            client,
            config,
            channel,
            rate_limiter,
        }
    }

    fn classify(status: reqwest::StatusCode) -> DeliveryOutcome {
        if status.is_success() {
            DeliveryOutcome::Success
        } else if status.as_u16() == 429 {
            DeliveryOutcome::RateLimited
        } else if status.is_client_error() {
            DeliveryOutcome::Permanent
        } else {
            DeliveryOutcome::Transient
        }
    }
}

#[async_trait]
impl Sink for WebhookPort {
    fn channel(&self) -> ChannelKind {
        self.channel
    }

    async fn send(&self, device: &Device, rendered: &RenderedContent) -> DeliveryOutcome {
        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }

        let body = serde_json::json!({
            "subject": rendered.subject,
            "body": rendered.body,
        })
        .to_string();

        let mut request = self.client.post(&device.address).body(body.clone());

        if let Some(secret) = &self.config.signing_secret {
            let timestamp_ms = chrono::Utc::now().timestamp_millis();
            let signature = sign_payload(secret, timestamp_ms, &body);
            request = request
                .header("X-AEGIS-SIGNATURE", signature)
                .header("X-AEGIS-TIMESTAMP", timestamp_ms.to_string());
        }

        match request.send().await {
            Ok(response) => Self::classify(response.status()),
            Err(err) => {
                warn!(error = %err, device_id = %device.id, "webhook send failed");
                DeliveryOutcome::Transient
            }
        }
    }
}

/// In-memory reference push sink. Records every send so tests can assert on
/// it; flags a device `invalid` when its address is the sentinel
/// `"invalid-token"`, mirroring how a real push provider reports a dead
/// token.
pub struct InMemoryPushSink {
    sent: Arc<Mutex<Vec<(String, RenderedContent)>>>,
}

impl InMemoryPushSink {
    pub fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sent_messages(&self) -> Vec<(String, RenderedContent)> {
        self.sent.lock().clone()
    }
}

impl Default for InMemoryPushSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for InMemoryPushSink {
    fn channel(&self) -> ChannelKind {
        ChannelKind::Push
    }

    async fn send(&self, device: &Device, rendered: &RenderedContent) -> DeliveryOutcome {
        if device.address == "invalid-token" {
            return DeliveryOutcome::InvalidRecipient;
        }
        self.sent
            .lock()
            .push((device.address.clone(), rendered.clone()));
        DeliveryOutcome::Success
    }
}

/// In-memory reference email sink. `batch.rs`'s digest composition sends its
/// combined subject/body through this the same way it would any single
/// message.
pub struct InMemoryEmailSink {
    sent: Arc<Mutex<Vec<(String, RenderedContent)>>>,
}

impl InMemoryEmailSink {
    pub fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sent_messages(&self) -> Vec<(String, RenderedContent)> {
        self.sent.lock().clone()
    }
}

impl Default for InMemoryEmailSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for InMemoryEmailSink {
    fn channel(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn send(&self, device: &Device, rendered: &RenderedContent) -> DeliveryOutcome {
        self.sent
            .lock()
            .push((device.address.clone(), rendered.clone()));
        DeliveryOutcome::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_common::model::ChannelKind;

    fn device(address: &str) -> Device {
        Device::new("d1", "u1", ChannelKind::Push, address)
    }

    #[tokio::test]
    async fn push_sink_flags_invalid_token() {
        let sink = InMemoryPushSink::new();
        let rendered = RenderedContent {
            subject: "hi".to_string(),
            body: "there".to_string(),
        };
        let outcome = sink.send(&device("invalid-token"), &rendered).await;
        assert_eq!(outcome, DeliveryOutcome::InvalidRecipient);
        assert!(sink.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn push_sink_records_successful_sends() {
        let sink = InMemoryPushSink::new();
        let rendered = RenderedContent {
            subject: "hi".to_string(),
            body: "there".to_string(),
        };
        let outcome = sink.send(&device("tok-abc"), &rendered).await;
        assert_eq!(outcome, DeliveryOutcome::Success);
        assert_eq!(sink.sent_messages().len(), 1);
    }

    #[test]
    fn signing_is_deterministic_for_same_inputs() {
        let a = sign_payload("secret", 1000, "body");
        let b = sign_payload("secret", 1000, "body");
        assert_eq!(a, b);
        let c = sign_payload("secret", 1001, "body");
        assert_ne!(a, c);
    }

    fn webhook_rendered() -> RenderedContent {
        RenderedContent {
            subject: "hi".to_string(),
            body: "there".to_string(),
        }
    }

    async fn send_to(uri: &str) -> DeliveryOutcome {
        let port = WebhookPort::new(ChannelKind::Webhook, WebhookPortConfig::default());
        let device = Device::new("d1", "u1", ChannelKind::Webhook, uri);
        port.send(&device, &webhook_rendered()).await
    }

    #[tokio::test]
    async fn webhook_2xx_is_success() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(200))
            .mount(&server)
            .await;

        assert_eq!(send_to(&server.uri()).await, DeliveryOutcome::Success);
    }

    #[tokio::test]
    async fn webhook_429_is_rate_limited() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(429))
            .mount(&server)
            .await;

        assert_eq!(send_to(&server.uri()).await, DeliveryOutcome::RateLimited);
    }

    #[tokio::test]
    async fn webhook_other_4xx_is_permanent() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert_eq!(send_to(&server.uri()).await, DeliveryOutcome::Permanent);
    }

    #[tokio::test]
    async fn webhook_5xx_is_transient() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(503))
            .mount(&server)
            .await;

        assert_eq!(send_to(&server.uri()).await, DeliveryOutcome::Transient);
    }

    #[tokio::test]
    async fn webhook_connection_failure_is_transient() {
        // Nothing listens on this port; the request itself fails before any
        // status code comes back.
        assert_eq!(
            send_to("http://127.0.0.1:1").await,
            DeliveryOutcome::Transient
        );
    }
}
