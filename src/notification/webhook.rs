use std::time::Duration;

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use tracing::{info, warn};

// ── Delivery Report ──────────────────────────────────────────

/// Outcome of one delivery attempt, recorded verbatim in the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryReport {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeliveryReport {
    pub fn delivered(status: Option<u16>) -> Self {
        Self {
            ok: true,
            status,
            body: None,
            error: None,
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            ok: false,
            status: None,
            body: None,
            error: Some(error.to_string()),
        }
    }
}

// ── HMAC Signing ─────────────────────────────────────────────

/// HMAC-SHA256 of `payload` keyed by `secret`, as `sha256=<hex>`.
fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("invalid webhook signing key: {}", e))?;
    mac.update(payload);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

// ── Webhook Sender ───────────────────────────────────────────

/// Posts JSON events to webhook endpoints.
///
/// Every request carries `x-hitl-delivery-id`, `x-hitl-timestamp` and
/// `x-hitl-event`; with a signing secret configured the body is signed into
/// `x-hitl-signature`. A single attempt is made: redelivery belongs to the
/// event log, not to the sender.
#[derive(Clone)]
pub struct WebhookSender {
    client: reqwest::Client,
    signing_secret: Option<String>,
}

impl WebhookSender {
    pub fn new(timeout: Duration, signing_secret: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("hitl-pipeline/0.1")
            .build()
            .context("failed to build webhook HTTP client")?;
        Ok(Self {
            client,
            signing_secret: signing_secret.filter(|s| !s.is_empty()),
        })
    }

    /// POST `body` to `url`. Non-2xx responses come back as `ok = false`;
    /// transport failures are errors.
    pub async fn send(&self, url: &str, event_type: &str, body: &Value) -> Result<DeliveryReport> {
        let payload = serde_json::to_vec(body).context("webhook serialize error")?;
        let delivery_id = uuid::Uuid::new_v4().to_string();
        let timestamp = chrono::Utc::now().timestamp().to_string();

        let mut req = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .header("x-hitl-delivery-id", &delivery_id)
            .header("x-hitl-timestamp", &timestamp)
            .header("x-hitl-event", event_type);

        if let Some(secret) = &self.signing_secret {
            req = req.header("x-hitl-signature", hmac_sha256_hex(secret, &payload)?);
        }

        let resp = req
            .body(payload)
            .send()
            .await
            .with_context(|| format!("webhook request to {} failed", url))?;

        let status = resp.status();
        if status.is_success() {
            info!(url, event_type, delivery_id = %delivery_id, status = %status, "webhook delivered");
            return Ok(DeliveryReport::delivered(Some(status.as_u16())));
        }

        let body = resp.text().await.unwrap_or_default();
        warn!(
            url,
            event_type,
            delivery_id = %delivery_id,
            status = %status,
            body = %body,
            "webhook delivery failed (non-2xx)"
        );
        Ok(DeliveryReport {
            ok: false,
            status: Some(status.as_u16()),
            body: Some(body),
            error: None,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sender(secret: Option<&str>) -> WebhookSender {
        WebhookSender::new(Duration::from_secs(2), secret.map(String::from)).unwrap()
    }

    #[test]
    fn test_hmac_signature_deterministic() {
        let sig1 = hmac_sha256_hex("secret123", b"payload").unwrap();
        let sig2 = hmac_sha256_hex("secret123", b"payload").unwrap();
        assert_eq!(sig1, sig2);
        assert!(sig1.starts_with("sha256="));
    }

    #[test]
    fn test_hmac_signature_different_secret() {
        let sig1 = hmac_sha256_hex("secret1", b"payload").unwrap();
        let sig2 = hmac_sha256_hex("secret2", b"payload").unwrap();
        assert_ne!(sig1, sig2);
    }

    #[test]
    fn test_report_omits_empty_fields() {
        let json = serde_json::to_value(DeliveryReport::delivered(Some(200))).unwrap();
        assert_eq!(json, json!({"ok": true, "status": 200}));
    }

    #[tokio::test]
    async fn test_signed_delivery_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("x-hitl-event", "approval_created"))
            .and(header_exists("x-hitl-delivery-id"))
            .and(header_exists("x-hitl-signature"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let report = sender(Some("s3cret"))
            .send(&format!("{}/hook", server.uri()), "approval_created", &json!({"a": 1}))
            .await
            .unwrap();
        assert_eq!(report, DeliveryReport::delivered(Some(204)));
    }

    #[tokio::test]
    async fn test_non_2xx_is_reported_not_raised() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let report = sender(None)
            .send(&server.uri(), "approval_created", &json!({}))
            .await
            .unwrap();
        assert!(!report.ok);
        assert_eq!(report.status, Some(500));
        assert_eq!(report.body.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        let result = sender(None)
            .send("http://127.0.0.1:1/hook", "approval_created", &json!({}))
            .await;
        assert!(result.is_err());
    }
}
