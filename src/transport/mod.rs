//! Messaging transport: inbound/outbound payloads and the send interface.
//!
//! The router consumes [`InboundPayload`] and produces [`OutboundMessage`]
//! lists; the [`Transport`] trait is how any component pushes a message to
//! a phone. The concrete [`gateway::GatewayClient`] talks to the WhatsApp
//! HTTP bridge sidecar.

pub mod gateway;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Errors from the messaging gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// HTTP request to the bridge failed.
    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The bridge rejected the send.
    #[error("gateway rejected send: status {0}")]
    Rejected(u16),
}

/// Inbound message payload as delivered by the gateway.
///
/// Fields beyond these are ignored on deserialization.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InboundPayload {
    /// Sender phone in channel-specific form. Required.
    #[serde(default)]
    pub from_number: String,
    /// Message id, used as an idempotency hint.
    #[serde(default)]
    pub id: Option<String>,
    /// User text.
    #[serde(default)]
    pub content: Option<String>,
    /// Quick-reply payload or button label, when the channel supports it.
    #[serde(default)]
    pub selected_option: Option<String>,
    /// ISO-8601 timestamp.
    #[serde(default)]
    pub timestamp: Option<String>,
    /// `text`, `image`, `location`, ...
    #[serde(default)]
    pub message_type: Option<String>,
    /// Attachments, if any.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl InboundPayload {
    /// Build a plain text payload. Test and tooling helper.
    pub fn text(from: &str, content: &str) -> Self {
        Self {
            from_number: from.to_owned(),
            content: Some(content.to_owned()),
            message_type: Some("text".to_owned()),
            ..Self::default()
        }
    }
}

/// An inbound attachment. Only the type is inspected by the core.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Attachment {
    /// Attachment type (`image`, `audio`, ...).
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

/// Button UI hint attached to an outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonsUi {
    /// Always `"buttons"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Button labels in display order.
    pub buttons: Vec<String>,
}

impl ButtonsUi {
    /// Build a buttons hint from labels.
    pub fn new(buttons: Vec<String>) -> Self {
        Self {
            kind: "buttons".to_owned(),
            buttons,
        }
    }
}

/// An outbound message: text body plus optional UI and media.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Text body (markdown-ish, `*` marks bold).
    pub response: String,
    /// Quick-reply buttons, when supported by the channel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ui: Option<ButtonsUi>,
    /// Media attachment URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    /// Media type (only `image` is used).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Caption accompanying the media.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_caption: Option<String>,
}

impl OutboundMessage {
    /// Build a plain text message.
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            response: body.into(),
            ..Self::default()
        }
    }

    /// Build a text message with quick-reply buttons.
    pub fn with_buttons(body: impl Into<String>, buttons: Vec<String>) -> Self {
        Self {
            response: body.into(),
            ui: Some(ButtonsUi::new(buttons)),
            ..Self::default()
        }
    }
}

/// Outbound send interface.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message to a phone.
    async fn send(&self, to: &str, message: &OutboundMessage) -> Result<(), GatewayError>;

    /// Send a plain text message to a phone.
    async fn send_text(&self, to: &str, text: &str) -> Result<(), GatewayError> {
        self.send(to, &OutboundMessage::text(text)).await
    }
}
