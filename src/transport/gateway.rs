//! HTTP client for the WhatsApp bridge sidecar.
//!
//! The bridge exposes `/send` for outbound messages, `/messages` as a
//! long-poll source of inbound payloads and `/status` for health. All
//! operations carry the configured account id so one bridge can serve
//! several bot instances.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{GatewayError, InboundPayload, OutboundMessage, Transport};

/// HTTP connect timeout for the reqwest client.
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// HTTP request timeout for sends.
const SEND_TIMEOUT_SECS: u64 = 10;

/// Long-poll window requested from the bridge, in seconds.
const POLL_WINDOW_SECS: u64 = 25;

/// Extra slack on top of the poll window for the HTTP timeout.
const POLL_SLACK_SECS: u64 = 10;

/// Response envelope from the bridge HTTP API.
#[derive(Deserialize)]
struct BridgeResponse<T> {
    #[allow(dead_code)]
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<T>,
}

/// Connection status reported by the bridge.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeStatus {
    /// Whether the bridge is connected to WhatsApp.
    #[serde(default)]
    pub connected: bool,
    /// The linked phone number, when connected.
    #[serde(default)]
    pub phone_number: Option<String>,
}

/// Client for the WhatsApp HTTP bridge.
pub struct GatewayClient {
    client: reqwest::Client,
    base_url: String,
    account_id: String,
}

impl GatewayClient {
    /// Create a client for the bridge at `base_url` sending as `account_id`.
    pub fn new(base_url: impl Into<String>, account_id: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(SEND_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            account_id: account_id.into(),
        }
    }

    /// Check whether the bridge is reachable and connected.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/status", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp
                .json::<BridgeResponse<BridgeStatus>>()
                .await
                .ok()
                .and_then(|b| b.data)
                .is_some_and(|s| s.connected),
            _ => false,
        }
    }

    /// Long-poll the bridge for inbound payloads.
    ///
    /// Blocks up to the poll window and returns whatever arrived (possibly
    /// empty). Transport-level failures surface as [`GatewayError`] so the
    /// caller can back off.
    pub async fn poll_inbound(&self) -> Result<Vec<InboundPayload>, GatewayError> {
        let url = format!(
            "{}/messages?account_id={}&timeout={POLL_WINDOW_SECS}",
            self.base_url, self.account_id
        );
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(
                POLL_WINDOW_SECS.saturating_add(POLL_SLACK_SECS),
            ))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Rejected(status.as_u16()));
        }

        let body: BridgeResponse<Vec<InboundPayload>> = response.json().await?;
        let payloads = body.data.unwrap_or_default();
        if !payloads.is_empty() {
            debug!(count = payloads.len(), "inbound payloads received");
        }
        Ok(payloads)
    }
}

#[async_trait]
impl Transport for GatewayClient {
    async fn send(&self, to: &str, message: &OutboundMessage) -> Result<(), GatewayError> {
        let url = format!("{}/send", self.base_url);
        let mut body = json!({
            "account_id": self.account_id,
            "to": to,
            "message": message.response,
        });

        if let Some(ui) = &message.ui {
            body["ui"] = serde_json::to_value(ui).unwrap_or_default();
        }
        if let Some(media_url) = &message.media_url {
            body["media_url"] = json!(media_url);
            body["media_type"] = json!(message.media_type.as_deref().unwrap_or("image"));
            if let Some(caption) = &message.media_caption {
                body["media_caption"] = json!(caption);
            }
        }

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(to, status = status.as_u16(), "gateway rejected send");
            return Err(GatewayError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}
