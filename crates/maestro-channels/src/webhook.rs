use crate::notifier::Notifier;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use maestro_core::{MaestroError, MaestroResult, NotificationEvent};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the shared secret.
pub const SECRET_HEADER: &str = "X-Webhook-Secret";
/// Header carrying `sha256=<hex>` of the body when signing is enabled.
pub const SIGNATURE_HEADER: &str = "X-Maestro-Signature";

/// Configuration for a single outbound webhook.
#[derive(Deserialize, Clone, Debug)]
pub struct WebhookConfig {
    /// Name used in logs.
    pub name: String,
    /// Target URL; events are POSTed as JSON.
    pub url: String,
    /// Shared secret sent via the X-Webhook-Secret header.
    pub secret: Option<String>,
    /// Also sign the body with HMAC-SHA256 using the secret.
    #[serde(default)]
    pub sign: bool,
    /// Only forward events whose kind is listed. Empty forwards everything.
    #[serde(default)]
    pub events: Vec<String>,
    /// Per-request timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    5000
}

/// POSTs notification events to an HTTP endpoint.
pub struct WebhookNotifier {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookNotifier {
    /// Build the HTTP client for one endpoint.
    pub fn new(config: WebhookConfig) -> MaestroResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| MaestroError::Http(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    fn accepts(&self, event: &NotificationEvent) -> bool {
        self.config.events.is_empty() || self.config.events.iter().any(|k| k == event.kind())
    }
}

/// Compute the `sha256=<hex>` signature of a body.
pub fn sign_body(secret: &str, body: &[u8]) -> MaestroResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| MaestroError::Notification(format!("Invalid signing key: {e}")))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Check a received signature header against the body, in constant time.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(hex_sig) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(sig) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&sig).is_ok()
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn notify(&self, event: &NotificationEvent) -> MaestroResult<()> {
        if !self.accepts(event) {
            debug!(webhook = %self.config.name, event = event.kind(), "Event filtered out");
            return Ok(());
        }

        let body = serde_json::to_vec(event)?;
        let mut request = self
            .client
            .post(&self.config.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(secret) = &self.config.secret {
            request = request.header(SECRET_HEADER, secret);
            if self.config.sign {
                request = request.header(SIGNATURE_HEADER, sign_body(secret, &body)?);
            }
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| MaestroError::Http(format!("Webhook '{}' send error: {e}", self.config.name)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MaestroError::Notification(format!(
                "Webhook '{}' returned {status}",
                self.config.name
            )));
        }
        debug!(webhook = %self.config.name, event = event.kind(), "Webhook delivered");
        Ok(())
    }
}
