//! Customer records in the relational store.
//!
//! One row per phone. Creation happens lazily on first contact with
//! `has_consent = false`; the consent service and the city detector are
//! the only writers afterwards.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

/// Errors from relational store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying query failed.
    #[error("store query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// The referenced row does not exist.
    #[error("customer not found: {0}")]
    NotFound(String),
}

/// A customer row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Customer {
    /// Opaque id.
    pub id: String,
    /// E.164 phone, unique.
    pub phone_number: String,
    /// Display name, when known.
    pub full_name: Option<String>,
    /// Canonical city, when confirmed or carried over.
    pub city: Option<String>,
    /// When the city was last confirmed (ISO-8601).
    pub city_confirmed_at: Option<String>,
    /// Whether the customer granted data-sharing consent.
    pub has_consent: bool,
}

/// Repository over the `customers` table.
#[derive(Clone)]
pub struct CustomerRepository {
    pool: SqlitePool,
}

impl CustomerRepository {
    /// Create a repository over `pool`.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Find a customer by phone.
    pub async fn find_by_phone(&self, phone: &str) -> Result<Option<Customer>, StoreError> {
        let row = sqlx::query_as::<_, Customer>(
            "SELECT id, phone_number, full_name, city, city_confirmed_at, has_consent
             FROM customers WHERE phone_number = ?1",
        )
        .bind(phone)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Get the customer for `phone`, creating the row on first contact.
    ///
    /// Idempotent on `phone`: concurrent calls converge on the same row.
    pub async fn get_or_create(
        &self,
        phone: &str,
        full_name: Option<&str>,
        city: Option<&str>,
    ) -> Result<Customer, StoreError> {
        let now = Utc::now().to_rfc3339();
        let id = Uuid::new_v4().to_string();

        let inserted = sqlx::query(
            "INSERT INTO customers (id, phone_number, full_name, city, has_consent, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)
             ON CONFLICT (phone_number) DO NOTHING",
        )
        .bind(&id)
        .bind(phone)
        .bind(full_name)
        .bind(city)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            info!(phone, "customer created");
        }

        self.find_by_phone(phone)
            .await?
            .ok_or_else(|| StoreError::NotFound(phone.to_owned()))
    }

    /// Set the customer's city and stamp `city_confirmed_at`.
    pub async fn update_city(&self, customer_id: &str, city: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE customers SET city = ?1, city_confirmed_at = ?2, updated_at = ?2 WHERE id = ?3",
        )
        .bind(city)
        .bind(&now)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;
        debug!(customer_id, city, "customer city updated");
        Ok(())
    }

    /// Clear the customer's city and its confirmation timestamp.
    pub async fn clear_city(&self, customer_id: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE customers SET city = NULL, city_confirmed_at = NULL, updated_at = ?1 WHERE id = ?2",
        )
        .bind(&now)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark consent as granted.
    pub async fn set_consent(&self, customer_id: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE customers SET has_consent = 1, updated_at = ?1 WHERE id = ?2")
            .bind(&now)
            .bind(customer_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Revoke consent (reset keyword path).
    pub async fn clear_consent(&self, customer_id: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE customers SET has_consent = 0, updated_at = ?1 WHERE id = ?2")
            .bind(&now)
            .bind(customer_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
