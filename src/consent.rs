//! Data-sharing consent: prompt, reply interpretation and the append-only
//! audit trail.
//!
//! The consent prompt is a two-message pair (explanation + numeric menu).
//! Replies are accepted as raw digits, button labels, leading-number
//! payloads or free-text yes/no; anything ambiguous re-sends the prompt.

use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use serde_json::json;
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::customers::StoreError;
use crate::messages;
use crate::text::normalize;
use crate::transport::{InboundPayload, OutboundMessage};

/// Affirmative replies accepted as consent, normalized.
const YES_WORDS: &[&str] = &[
    "si", "sí", "yes", "acepto", "aceptar", "claro", "ok", "okay", "dale", "de acuerdo",
    "por supuesto", "esta bien", "bueno", "correcto",
];

/// Negative replies accepted as decline, normalized.
const NO_WORDS: &[&str] = &[
    "no", "no acepto", "rechazo", "rechazar", "negativo", "nunca", "no quiero", "no gracias",
];

/// The customer's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentReply {
    /// Data sharing accepted.
    Accepted,
    /// Data sharing declined.
    Declined,
}

impl ConsentReply {
    /// The audit row value for this decision.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Declined => "declined",
        }
    }
}

/// Normalize a button/quick-reply value: collapse whitespace and reduce a
/// leading number ("1 Acepto") to the number alone.
pub fn normalize_button(value: &str) -> Option<String> {
    static LEADING_NUMBER: OnceLock<Regex> = OnceLock::new();
    let pattern = LEADING_NUMBER
        .get_or_init(|| Regex::new(r"^(\d+)").unwrap_or_else(|e| panic!("static regex: {e}")));

    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    match pattern.captures(&collapsed) {
        Some(captures) => captures.get(1).map(|m| m.as_str().to_owned()),
        None => Some(collapsed),
    }
}

/// Interpret free text as yes/no. `None` when ambiguous.
pub fn interpret_yes_no(text: &str) -> Option<bool> {
    let normalized = normalize(text);
    if normalized.is_empty() {
        return None;
    }
    if YES_WORDS.iter().any(|w| normalize(w) == normalized) {
        return Some(true);
    }
    if NO_WORDS.iter().any(|w| normalize(w) == normalized) {
        return Some(false);
    }
    None
}

/// Parse a consent reply from the selected option and/or message text.
///
/// Precedence: button `1`/`2`, button option text, numeric text, free
/// yes/no text. Returns `None` when the reply is ambiguous.
pub fn parse_consent_reply(selected: Option<&str>, text: &str) -> Option<ConsentReply> {
    let accept_label = normalize(messages::CONSENT_OPTIONS[0]);
    let decline_label = normalize(messages::CONSENT_OPTIONS[1]);

    if let Some(selected) = selected.and_then(normalize_button) {
        match selected.as_str() {
            "1" => return Some(ConsentReply::Accepted),
            "2" => return Some(ConsentReply::Declined),
            other => {
                let normalized = normalize(other);
                if normalized == accept_label {
                    return Some(ConsentReply::Accepted);
                }
                if normalized == decline_label {
                    return Some(ConsentReply::Declined);
                }
            }
        }
    }

    if let Some(option) = normalize_button(text) {
        match option.as_str() {
            "1" => return Some(ConsentReply::Accepted),
            "2" => return Some(ConsentReply::Declined),
            _ => {}
        }
    }

    let normalized = normalize(text);
    if normalized == accept_label {
        return Some(ConsentReply::Accepted);
    }
    if normalized == decline_label {
        return Some(ConsentReply::Declined);
    }

    match interpret_yes_no(text) {
        Some(true) => Some(ConsentReply::Accepted),
        Some(false) => Some(ConsentReply::Declined),
        None => None,
    }
}

/// The two consent prompt messages, in send order.
pub fn consent_prompt() -> Vec<OutboundMessage> {
    vec![
        OutboundMessage::text(messages::CONSENT_PROMPT),
        OutboundMessage::with_buttons(
            messages::consent_menu(),
            messages::CONSENT_OPTIONS.iter().map(|s| (*s).to_owned()).collect(),
        ),
    ]
}

/// Append-only store over the `consents` table.
#[derive(Clone)]
pub struct ConsentRepository {
    pool: SqlitePool,
}

impl ConsentRepository {
    /// Create a repository over `pool`.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append an audit record for a customer's decision.
    ///
    /// The metadata captures the inbound payload context: message id, raw
    /// text, selected option, timestamp, platform and message type.
    pub async fn record(
        &self,
        customer_id: &str,
        reply: ConsentReply,
        payload: &InboundPayload,
    ) -> Result<(), StoreError> {
        let metadata = json!({
            "message_id": payload.id,
            "raw_text": payload.content,
            "selected_option": payload.selected_option,
            "timestamp": payload.timestamp,
            "platform": "whatsapp",
            "message_type": payload.message_type,
            "recorded_at": Utc::now().to_rfc3339(),
        });

        sqlx::query(
            "INSERT INTO consents (id, user_id, user_type, response, message_log, created_at)
             VALUES (?1, ?2, 'customer', ?3, ?4, ?5)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(customer_id)
        .bind(reply.as_str())
        .bind(metadata.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        info!(customer_id, response = reply.as_str(), "consent recorded");
        Ok(())
    }

    /// Number of audit rows for a customer. Test and admin helper.
    pub async fn count_for(&self, customer_id: &str) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM consents WHERE user_id = ?1")
            .bind(customer_id)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        Ok(row.0)
    }
}
