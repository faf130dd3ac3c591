//! Content safety gate: LLM moderation, warning counter and temporary bans.
//!
//! The ban check runs before any classification so banned phones never
//! trigger a paid LLM call. Classification failures fail open — the need
//! interpreter downstream still applies its own semantic check.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::kv::{self, KvError, KvStore};
use crate::llm::{extract_json_object, ChatRequest, LlmClient};
use crate::messages;

/// TTL for warnings and bans: 15 minutes.
const PENALTY_TTL_SECS: u64 = 900;

/// Minutes until a ban expires.
const BAN_MINUTES: i64 = 15;

const MODERATION_SYSTEM_PROMPT: &str = "\
Eres un moderador de contenido experto. Detecta si el texto contiene:

1. CONTENIDO ILEGAL O INAPROPIADO:
   - Armas, violencia, delitos
   - Drogas, sustancias ilegales
   - Servicios sexuales, prostitución, contenido pornográfico
   - Odio, discriminación, acoso

2. INPUT SIN SENTIDO O FALSO:
   - Textos que no expresan una necesidad real de servicio

Responde SOLO con JSON:
{
  \"is_valid\": true/false,
  \"category\": \"valid\" | \"illegal\" | \"inappropriate\" | \"nonsense\" | \"false\",
  \"reason\": \"explicación breve\",
  \"should_ban\": true/false
}";

/// Per-phone warning counter (`warnings:<phone>`).
#[derive(Debug, Default, Serialize, Deserialize)]
struct WarningCounter {
    #[serde(default)]
    count: u32,
    #[serde(default)]
    last_warning_at: Option<String>,
    #[serde(default)]
    last_offense: Option<String>,
}

/// Per-phone temporary block (`ban:<phone>`).
#[derive(Debug, Serialize, Deserialize)]
struct Ban {
    banned_at: String,
    reason: String,
    expires_at: String,
}

/// Outcome of moderating one inbound text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Moderation {
    /// Content is fine; continue routing.
    Allowed,
    /// Nonsense or deceptive input: ask the user to reformulate.
    Reformulate {
        /// Reply to send.
        reply: String,
    },
    /// First illegal/inappropriate strike: warn.
    Warned {
        /// Reply to send.
        reply: String,
    },
    /// Second strike: the phone is now banned.
    Banned {
        /// Reply to send (includes the resume time).
        reply: String,
    },
}

/// Content gate over the K/V penalty records and the LLM moderator.
pub struct ContentGate {
    kv: Arc<dyn KvStore>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl ContentGate {
    /// Create a gate. Without an LLM client every text is allowed through.
    pub fn new(kv: Arc<dyn KvStore>, llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { kv, llm }
    }

    /// Whether a live ban exists for `phone`.
    ///
    /// A K/V failure reports "not banned" so an outage never silences
    /// legitimate users.
    pub async fn is_banned(&self, phone: &str) -> bool {
        match self.kv.get(&ban_key(phone)).await {
            Ok(entry) => entry.is_some(),
            Err(e) => {
                warn!(phone, error = %e, "ban lookup failed, assuming not banned");
                false
            }
        }
    }

    /// Classify `text` and apply the two-strike discipline.
    pub async fn moderate(&self, phone: &str, text: &str) -> Result<Moderation, KvError> {
        let Some(llm) = &self.llm else {
            return Ok(Moderation::Allowed);
        };

        let request = ChatRequest::new(
            MODERATION_SYSTEM_PROMPT,
            format!("Analiza este mensaje de usuario: \"{text}\""),
        )
        .max_tokens(150);

        let raw = match llm.complete(request).await {
            Ok(raw) => raw,
            Err(e) => {
                // Fail open: the interpreter still filters downstream.
                warn!(phone, error = %e, "moderation llm call failed, allowing text");
                return Ok(Moderation::Allowed);
            }
        };

        let Some(parsed) = extract_json_object(&raw) else {
            warn!(phone, "unparseable moderation response, allowing text");
            return Ok(Moderation::Allowed);
        };

        let category = parsed
            .get("category")
            .and_then(|v| v.as_str())
            .unwrap_or("valid");
        let reason = parsed
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        match category {
            "valid" => Ok(Moderation::Allowed),
            "nonsense" | "false" => {
                info!(phone, reason, "nonsense input detected");
                Ok(Moderation::Reformulate {
                    reply: messages::NONSENSE_INPUT.to_owned(),
                })
            }
            "illegal" | "inappropriate" => self.apply_strike(phone, category, reason).await,
            other => {
                warn!(phone, category = other, "unknown moderation category, allowing text");
                Ok(Moderation::Allowed)
            }
        }
    }

    async fn apply_strike(
        &self,
        phone: &str,
        category: &str,
        reason: &str,
    ) -> Result<Moderation, KvError> {
        let key = warnings_key(phone);
        let existing: WarningCounter = kv::get_record(self.kv.as_ref(), &key)
            .await?
            .unwrap_or_default();

        if existing.count == 0 {
            let counter = WarningCounter {
                count: 1,
                last_warning_at: Some(Utc::now().to_rfc3339()),
                last_offense: Some(format!("{category}: {reason}")),
            };
            kv::set_record(
                self.kv.as_ref(),
                &key,
                &counter,
                Some(Duration::from_secs(PENALTY_TTL_SECS)),
            )
            .await?;
            warn!(phone, category, reason, "first offense, warning issued");
            return Ok(Moderation::Warned {
                reply: messages::CONTENT_WARNING.to_owned(),
            });
        }

        let now = Utc::now();
        let expires_at = now
            .checked_add_signed(ChronoDuration::minutes(BAN_MINUTES))
            .unwrap_or(now);
        let ban = Ban {
            banned_at: now.to_rfc3339(),
            reason: format!("{category}: {reason} (2da ofensa)"),
            expires_at: expires_at.to_rfc3339(),
        };
        kv::set_record(
            self.kv.as_ref(),
            &ban_key(phone),
            &ban,
            Some(Duration::from_secs(PENALTY_TTL_SECS)),
        )
        .await?;
        warn!(phone, category, "second offense, phone banned");

        Ok(Moderation::Banned {
            reply: messages::ban_notice(&format_resume_time(expires_at)),
        })
    }
}

fn ban_key(phone: &str) -> String {
    format!("ban:{phone}")
}

fn warnings_key(phone: &str) -> String {
    format!("warnings:{phone}")
}

fn format_resume_time(at: DateTime<Utc>) -> String {
    at.format("%H:%M").to_string()
}
