//! Environment-driven configuration.
//!
//! Every tunable is an environment variable with a default; `.env` files
//! are honored via `dotenvy` before the first read. `Config::from_env`
//! fails fast on unparseable values instead of limping along with
//! defaults the operator did not choose.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use url::Url;

/// Service configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path.
    pub database_path: String,
    /// WhatsApp bridge base URL.
    pub gateway_url: String,
    /// Account id this bot sends as.
    pub gateway_account_id: String,

    /// OpenAI-compatible API key. LLM features degrade gracefully when
    /// absent.
    pub openai_api_key: Option<String>,
    /// LLM API base URL.
    pub llm_base_url: String,
    /// Model used for every classification/extraction prompt.
    pub llm_model: String,
    /// Concurrent LLM calls allowed process-wide.
    pub max_llm_concurrency: usize,
    /// Per-call LLM timeout.
    pub llm_timeout: Duration,

    /// Object storage base URL (signed photo URLs). Optional.
    pub storage_url: Option<String>,
    /// Storage bucket holding provider photos.
    pub storage_bucket: String,
    /// Storage service key. Optional.
    pub storage_service_key: Option<String>,

    /// Conversation flow TTL.
    pub flow_ttl: Duration,
    /// Inactivity window before a session restarts.
    pub session_timeout: Duration,
    /// Availability response deadline.
    pub availability_timeout: Duration,
    /// Availability probe record TTL.
    pub availability_ttl: Duration,
    /// Availability polling cadence.
    pub availability_poll_interval: Duration,
    /// Catalog snapshot TTL.
    pub catalog_ttl: Duration,
    /// Relational store operation timeout (pool acquire).
    pub store_timeout: Duration,
    /// Invalid replies tolerated in the confirm menu.
    pub max_confirm_attempts: u32,

    /// Session transcript TTL.
    pub session_log_ttl: Duration,
    /// Messages kept per session transcript.
    pub session_log_max_messages: usize,

    /// Directory for rotated JSON logs.
    pub logs_dir: String,
}

impl Config {
    /// Load the configuration from the environment (and `.env`).
    pub fn from_env() -> Result<Self> {
        // Missing .env files are fine; malformed ones are not silent.
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(e).context("failed to read .env");
            }
        }

        Ok(Self {
            database_path: var_or("DATABASE_PATH", "minka.db"),
            gateway_url: url_var("GATEWAY_URL", "http://localhost:3001")?,
            gateway_account_id: var_or("GATEWAY_ACCOUNT_ID", "bot-clientes"),

            openai_api_key: var_opt("OPENAI_API_KEY"),
            llm_base_url: url_var("LLM_BASE_URL", "https://api.openai.com")?,
            llm_model: var_or("LLM_MODEL", "gpt-4o-mini"),
            max_llm_concurrency: parse_var("MAX_LLM_CONCURRENCY", 5)?,
            llm_timeout: secs_var("LLM_TIMEOUT_SECONDS", 5.0)?,

            storage_url: var_opt("STORAGE_URL"),
            storage_bucket: var_or("STORAGE_BUCKET", "providers"),
            storage_service_key: var_opt("STORAGE_SERVICE_KEY"),

            flow_ttl: secs_var("FLOW_TTL_SECONDS", 86400.0)?,
            session_timeout: secs_var("SESSION_TIMEOUT_SECONDS", 180.0)?,
            availability_timeout: secs_var("AVAILABILITY_TIMEOUT_SECONDS", 45.0)?,
            availability_ttl: secs_var("AVAILABILITY_TTL_SECONDS", 120.0)?,
            availability_poll_interval: secs_var("AVAILABILITY_POLL_INTERVAL_SECONDS", 1.0)?,
            catalog_ttl: secs_var("SERVICE_SYNONYMS_CACHE_TTL", 3600.0)?,
            store_timeout: secs_var("STORE_TIMEOUT_SECONDS", 5.0)?,
            max_confirm_attempts: parse_var("MAX_CONFIRM_ATTEMPTS", 2)?,

            session_log_ttl: secs_var("SESSION_LOG_TTL_SECONDS", 3600.0)?,
            session_log_max_messages: parse_var("SESSION_LOG_MAX_MESSAGES", 10)?,

            logs_dir: var_opt("LOGS_DIR").unwrap_or_else(default_logs_dir),
        })
    }
}

/// Default logs directory under the platform data dir, `./logs` when the
/// platform offers none.
fn default_logs_dir() -> String {
    directories::ProjectDirs::from("", "", "minka")
        .map(|dirs| {
            dirs.data_local_dir()
                .join("logs")
                .to_string_lossy()
                .into_owned()
        })
        .unwrap_or_else(|| "./logs".to_owned())
}

impl fmt::Display for Config {
    /// Redacted summary for `check-config`; secrets never print.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "database_path: {}", self.database_path)?;
        writeln!(f, "gateway_url: {}", self.gateway_url)?;
        writeln!(f, "gateway_account_id: {}", self.gateway_account_id)?;
        writeln!(f, "llm: {} @ {}", self.llm_model, self.llm_base_url)?;
        writeln!(
            f,
            "openai_api_key: {}",
            redact(self.openai_api_key.as_deref())
        )?;
        writeln!(
            f,
            "storage: {} (bucket {}, key {})",
            self.storage_url.as_deref().unwrap_or("-"),
            self.storage_bucket,
            redact(self.storage_service_key.as_deref())
        )?;
        writeln!(
            f,
            "flow_ttl: {}s, session_timeout: {}s",
            self.flow_ttl.as_secs(),
            self.session_timeout.as_secs()
        )?;
        writeln!(
            f,
            "availability: timeout {}s, ttl {}s, poll {:?}",
            self.availability_timeout.as_secs(),
            self.availability_ttl.as_secs(),
            self.availability_poll_interval
        )?;
        writeln!(f, "catalog_ttl: {}s", self.catalog_ttl.as_secs())?;
        write!(f, "logs_dir: {}", self.logs_dir)
    }
}

fn redact(value: Option<&str>) -> &'static str {
    match value {
        Some(v) if !v.is_empty() => "set",
        _ => "unset",
    }
}

fn var_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn var_or(name: &str, default: &str) -> String {
    var_opt(name).unwrap_or_else(|| default.to_owned())
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var_opt(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        None => Ok(default),
    }
}

/// Read a URL variable, validating the value parses as an absolute URL.
fn url_var(name: &str, default: &str) -> Result<String> {
    let raw = var_or(name, default);
    Url::parse(&raw).with_context(|| format!("invalid URL in {name}: {raw:?}"))?;
    Ok(raw.trim_end_matches('/').to_owned())
}

fn secs_var(name: &str, default: f64) -> Result<Duration> {
    let secs: f64 = parse_var(name, default)?;
    if !secs.is_finite() || secs < 0.0 {
        anyhow::bail!("invalid value for {name}: {secs} (must be a non-negative number)");
    }
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; each uses distinct names to
    // stay independent of execution order.

    #[test]
    fn test_defaults_without_env() {
        let value = parse_var::<u32>("MINKA_TEST_UNSET_U32", 7).expect("default");
        assert_eq!(value, 7);
        let dur = secs_var("MINKA_TEST_UNSET_SECS", 1.5).expect("default");
        assert_eq!(dur, Duration::from_millis(1500));
    }

    #[test]
    fn test_parse_var_reads_env() {
        std::env::set_var("MINKA_TEST_SET_U32", "42");
        let value = parse_var::<u32>("MINKA_TEST_SET_U32", 7).expect("parse");
        assert_eq!(value, 42);
        std::env::remove_var("MINKA_TEST_SET_U32");
    }

    #[test]
    fn test_parse_var_rejects_garbage() {
        std::env::set_var("MINKA_TEST_BAD_U32", "many");
        assert!(parse_var::<u32>("MINKA_TEST_BAD_U32", 7).is_err());
        std::env::remove_var("MINKA_TEST_BAD_U32");
    }

    #[test]
    fn test_secs_var_rejects_negative() {
        std::env::set_var("MINKA_TEST_NEG_SECS", "-3");
        assert!(secs_var("MINKA_TEST_NEG_SECS", 1.0).is_err());
        std::env::remove_var("MINKA_TEST_NEG_SECS");
    }

    #[test]
    fn test_url_var_validates() {
        std::env::set_var("MINKA_TEST_URL", "http://bridge:3001/");
        let url = url_var("MINKA_TEST_URL", "http://localhost:3001").expect("parse");
        assert_eq!(url, "http://bridge:3001");
        std::env::remove_var("MINKA_TEST_URL");

        std::env::set_var("MINKA_TEST_BAD_URL", "not a url");
        assert!(url_var("MINKA_TEST_BAD_URL", "http://localhost:3001").is_err());
        std::env::remove_var("MINKA_TEST_BAD_URL");
    }

    #[test]
    fn test_default_logs_dir_is_not_empty() {
        assert!(!default_logs_dir().is_empty());
    }

    #[test]
    fn test_var_opt_ignores_blank() {
        std::env::set_var("MINKA_TEST_BLANK", "   ");
        assert!(var_opt("MINKA_TEST_BLANK").is_none());
        std::env::remove_var("MINKA_TEST_BLANK");
    }

    #[test]
    fn test_display_redacts_secrets() {
        let config = Config {
            database_path: "minka.db".to_owned(),
            gateway_url: "http://localhost:3001".to_owned(),
            gateway_account_id: "bot-clientes".to_owned(),
            openai_api_key: Some("sk-secret".to_owned()),
            llm_base_url: "https://api.openai.com".to_owned(),
            llm_model: "gpt-4o-mini".to_owned(),
            max_llm_concurrency: 5,
            llm_timeout: Duration::from_secs(5),
            storage_url: None,
            storage_bucket: "providers".to_owned(),
            storage_service_key: Some("key".to_owned()),
            flow_ttl: Duration::from_secs(86400),
            session_timeout: Duration::from_secs(180),
            availability_timeout: Duration::from_secs(45),
            availability_ttl: Duration::from_secs(120),
            availability_poll_interval: Duration::from_secs(1),
            catalog_ttl: Duration::from_secs(3600),
            store_timeout: Duration::from_secs(5),
            max_confirm_attempts: 2,
            session_log_ttl: Duration::from_secs(3600),
            session_log_max_messages: 10,
            logs_dir: "./logs".to_owned(),
        };
        let summary = config.to_string();
        assert!(!summary.contains("sk-secret"));
        assert!(summary.contains("openai_api_key: set"));
    }
}
