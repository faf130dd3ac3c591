//! Provider search over the relational catalog.
//!
//! Inputs are validated up front (length, character set, SQL patterns)
//! before any query is built; terms are synonym-expanded through the
//! catalog and matched case-insensitively against both the profession
//! column and the denormalized services text.

use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::catalog::ServiceCatalog;
use crate::customers::StoreError;

/// Default number of candidates fetched.
pub const DEFAULT_SEARCH_LIMIT: u32 = 20;

/// Characters rejected in search inputs.
const FORBIDDEN_FRAGMENTS: &[&str] = &[";", "'", "\"", "--", "/*", "*/", "\\", "\0", "|", "="];

/// Errors from search input validation and execution.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// An input field failed validation.
    #[error("invalid search input for {field}: {reason}")]
    InvalidInput {
        /// Which field was rejected.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// The underlying query failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A provider as searched and presented.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSummary {
    /// Row id.
    #[serde(default)]
    pub id: String,
    /// Messaging JID (may be a non-dialable handle).
    #[serde(default)]
    pub phone: Option<String>,
    /// Dialable E.164 phone, preferred for contact.
    #[serde(default)]
    pub real_phone: Option<String>,
    /// Legacy phone column.
    #[serde(default)]
    pub phone_number: Option<String>,
    /// Display name.
    #[serde(default)]
    pub full_name: String,
    /// Canonical city.
    #[serde(default)]
    pub city: Option<String>,
    /// Canonical profession.
    #[serde(default)]
    pub profession: Option<String>,
    /// Offered services.
    #[serde(default)]
    pub services: Vec<String>,
    /// Rating in `0..=5`.
    #[serde(default)]
    pub rating: f64,
    /// Years of experience.
    #[serde(default)]
    pub experience_years: i64,
    /// Face photo URL or storage path.
    #[serde(default)]
    pub face_photo_url: Option<String>,
    /// Social media profile URL.
    #[serde(default)]
    pub social_media_url: Option<String>,
    /// Social media platform name.
    #[serde(default)]
    pub social_media_type: Option<String>,
    /// Availability flag from the catalog.
    #[serde(default)]
    pub available: bool,
    /// Verification flag; only verified providers are searched.
    #[serde(default)]
    pub verified: bool,
}

impl ProviderSummary {
    /// The phone to contact: `real_phone`, else `phone`, else the legacy
    /// `phone_number` column. `None` when the provider is not contactable.
    pub fn contact_phone(&self) -> Option<&str> {
        [&self.real_phone, &self.phone, &self.phone_number]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .map(str::trim)
            .find(|p| !p.is_empty())
    }
}

/// A validated search query.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    /// Canonical profession to search.
    pub profession: String,
    /// Canonical city filter, lowercased.
    pub city: Option<String>,
    /// Result cap in `1..=100`.
    pub limit: u32,
}

impl SearchQuery {
    /// Validate and build a query.
    pub fn new(
        profession: &str,
        city: Option<&str>,
        limit: u32,
    ) -> Result<Self, SearchError> {
        let profession = validate_term("profession", profession)?;
        let city = match city {
            Some(city) => Some(validate_term("city", city)?),
            None => None,
        };
        if !(1..=100).contains(&limit) {
            return Err(SearchError::InvalidInput {
                field: "limit",
                reason: format!("{limit} outside 1..=100"),
            });
        }
        Ok(Self {
            profession,
            city,
            limit,
        })
    }
}

fn sql_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(union|select|insert|update|delete|drop|alter|create|exec)\b")
            .unwrap_or_else(|e| panic!("static regex: {e}"))
    })
}

fn validate_term(field: &'static str, raw: &str) -> Result<String, SearchError> {
    let cleaned = raw.trim().to_lowercase();
    let reject = |reason: &str| SearchError::InvalidInput {
        field,
        reason: reason.to_owned(),
    };

    if !(2..=100).contains(&cleaned.chars().count()) {
        return Err(reject("length outside 2..=100"));
    }
    if cleaned.chars().all(|c| c.is_ascii_digit()) {
        return Err(reject("numeric only"));
    }
    for fragment in FORBIDDEN_FRAGMENTS {
        if cleaned.contains(fragment) {
            return Err(reject("forbidden characters"));
        }
    }
    if sql_pattern().is_match(&cleaned) {
        return Err(reject("sql keywords"));
    }
    if cleaned
        .chars()
        .any(|c| (c as u32) < 32 && !matches!(c, '\n' | '\r' | '\t'))
    {
        return Err(reject("control characters"));
    }
    Ok(cleaned)
}

/// Split a denormalized services text into individual entries.
pub fn split_services(raw: &str) -> Vec<String> {
    raw.split(|c: char| matches!(c, ';' | ',' | '/' | '|' | '\n'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

#[derive(sqlx::FromRow)]
struct ProviderRow {
    id: String,
    phone: Option<String>,
    real_phone: Option<String>,
    phone_number: Option<String>,
    full_name: Option<String>,
    city: Option<String>,
    profession: Option<String>,
    services: Option<String>,
    rating: Option<f64>,
    available: Option<bool>,
    verified: Option<bool>,
    experience_years: Option<i64>,
    face_photo_url: Option<String>,
    social_media_url: Option<String>,
    social_media_type: Option<String>,
}

impl From<ProviderRow> for ProviderSummary {
    fn from(row: ProviderRow) -> Self {
        Self {
            id: row.id,
            phone: row.phone,
            real_phone: row.real_phone,
            phone_number: row.phone_number,
            full_name: row.full_name.unwrap_or_else(|| "Proveedor".to_owned()),
            city: row.city,
            profession: row.profession,
            services: row.services.as_deref().map(split_services).unwrap_or_default(),
            rating: row.rating.unwrap_or(0.0).clamp(0.0, 5.0),
            experience_years: row.experience_years.unwrap_or(0).max(0),
            face_photo_url: row.face_photo_url,
            social_media_url: row.social_media_url,
            social_media_type: row.social_media_type,
            available: row.available.unwrap_or(false),
            verified: row.verified.unwrap_or(false),
        }
    }
}

/// Search over the `providers` table.
pub struct ProviderSearch {
    pool: SqlitePool,
    catalog: Arc<ServiceCatalog>,
}

impl ProviderSearch {
    /// Create a search over `pool` expanding terms through `catalog`.
    pub fn new(pool: SqlitePool, catalog: Arc<ServiceCatalog>) -> Self {
        Self { pool, catalog }
    }

    /// Run a validated query and return ranked candidates.
    ///
    /// Terms are the profession plus its catalog synonyms; each matches
    /// `profession` or `services` case-insensitively. Only verified rows
    /// qualify; results are ordered by rating descending and truncated to
    /// the query limit. An empty list is a valid outcome.
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<ProviderSummary>, SearchError> {
        let terms = self.catalog.expand_profession(&query.profession).await;
        debug!(profession = %query.profession, terms = terms.len(), "search terms expanded");

        let mut builder = sqlx::QueryBuilder::new(
            "SELECT id, phone, real_phone, phone_number, full_name, city, profession, services, \
             rating, available, verified, experience_years, face_photo_url, social_media_url, \
             social_media_type FROM providers WHERE verified = 1",
        );

        builder.push(" AND (");
        for (idx, term) in terms.iter().enumerate() {
            if idx > 0 {
                builder.push(" OR ");
            }
            let pattern = format!("%{}%", term.to_lowercase());
            builder.push("lower(profession) LIKE ");
            builder.push_bind(pattern.clone());
            builder.push(" OR lower(services) LIKE ");
            builder.push_bind(pattern);
        }
        builder.push(")");

        if let Some(city) = &query.city {
            builder.push(" AND lower(city) LIKE ");
            builder.push_bind(format!("%{city}%"));
        }

        builder.push(" ORDER BY rating DESC LIMIT ");
        builder.push_bind(i64::from(query.limit));

        let rows: Vec<ProviderRow> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Query)?;

        info!(
            profession = %query.profession,
            city = query.city.as_deref().unwrap_or("-"),
            results = rows.len(),
            "provider search complete"
        );
        Ok(rows.into_iter().map(ProviderSummary::from).collect())
    }
}
