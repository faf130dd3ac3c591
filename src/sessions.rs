//! Rolling per-phone session transcript.
//!
//! Keeps the last few user and bot messages under `session:<phone>` so
//! LLM prompts can carry recent context. Falls back to an in-process map
//! when the K/V store fails, so a store outage degrades context instead
//! of dropping it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::kv::{self, KvStore};

fn session_key(phone: &str) -> String {
    format!("session:{phone}")
}

/// One recorded message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    /// Message text.
    pub message: String,
    /// When it was recorded (ISO-8601).
    pub timestamp: String,
    /// Whether the bot sent it.
    #[serde(default)]
    pub is_bot: bool,
    /// Free-form metadata (message id, etc.).
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Rolling transcript store.
pub struct SessionLog {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
    max_messages: usize,
    fallback: Mutex<HashMap<String, Vec<SessionMessage>>>,
}

impl SessionLog {
    /// Create a log keeping at most `max_messages` per phone with `ttl`.
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration, max_messages: usize) -> Self {
        Self {
            kv,
            ttl,
            max_messages: max_messages.max(1),
            fallback: Mutex::new(HashMap::new()),
        }
    }

    /// Record a message, newest first, trimming to the window.
    pub async fn record(
        &self,
        phone: &str,
        message: &str,
        is_bot: bool,
        metadata: serde_json::Value,
    ) {
        let entry = SessionMessage {
            message: message.to_owned(),
            timestamp: Utc::now().to_rfc3339(),
            is_bot,
            metadata,
        };

        let key = session_key(phone);
        let mut history = match kv::get_record::<Vec<SessionMessage>>(self.kv.as_ref(), &key).await
        {
            Ok(history) => history.unwrap_or_default(),
            Err(e) => {
                warn!(phone, error = %e, "session read failed, using in-memory fallback");
                self.record_fallback(phone, entry).await;
                return;
            }
        };

        history.insert(0, entry.clone());
        history.truncate(self.max_messages);

        if let Err(e) = kv::set_record(self.kv.as_ref(), &key, &history, Some(self.ttl)).await {
            warn!(phone, error = %e, "session write failed, using in-memory fallback");
            self.record_fallback(phone, entry).await;
        }
    }

    /// Recent messages, newest first, up to `limit`.
    pub async fn history(&self, phone: &str, limit: usize) -> Vec<SessionMessage> {
        let key = session_key(phone);
        match kv::get_record::<Vec<SessionMessage>>(self.kv.as_ref(), &key).await {
            Ok(Some(history)) => history.into_iter().take(limit).collect(),
            Ok(None) => self.history_fallback(phone, limit).await,
            Err(e) => {
                warn!(phone, error = %e, "session read failed, serving in-memory fallback");
                self.history_fallback(phone, limit).await
            }
        }
    }

    /// Format the most recent exchange as prompt context, oldest first.
    pub async fn context_string(&self, phone: &str, limit: usize) -> String {
        let mut history = self.history(phone, limit).await;
        history.reverse();
        history
            .iter()
            .map(|msg| {
                let who = if msg.is_bot { "Asistente" } else { "Usuario" };
                format!("{who}: {}", msg.message)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn record_fallback(&self, phone: &str, entry: SessionMessage) {
        let mut fallback = self.fallback.lock().await;
        let history = fallback.entry(phone.to_owned()).or_default();
        history.insert(0, entry);
        history.truncate(self.max_messages);
    }

    async fn history_fallback(&self, phone: &str, limit: usize) -> Vec<SessionMessage> {
        let fallback = self.fallback.lock().await;
        fallback
            .get(phone)
            .map(|history| history.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }
}
