//! SQLite pool setup and schema migration.
//!
//! The schema is created idempotently at startup; there is no separate
//! migration history. Column shapes follow the catalog tables the bot
//! reads (`providers`, `service_synonyms`) and writes
//! (`customers`, `consents`).

use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

/// Maximum connections in the pool.
const MAX_CONNECTIONS: u32 = 5;

/// Open (and create if missing) the database at `path`.
///
/// `acquire_timeout` bounds how long a query waits for a pooled
/// connection, which is the store-operation timeout for a local database.
pub async fn connect(path: &str, acquire_timeout: Duration) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(acquire_timeout)
        .connect_with(options)
        .await
}

/// Open an in-memory database. Test helper.
pub async fn connect_in_memory() -> Result<SqlitePool, sqlx::Error> {
    // A single connection keeps every query on the same in-memory database.
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
}

/// Create all tables if they do not exist yet.
pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS customers (
            id TEXT PRIMARY KEY,
            phone_number TEXT NOT NULL UNIQUE,
            full_name TEXT,
            city TEXT,
            city_confirmed_at TEXT,
            has_consent INTEGER NOT NULL DEFAULT 0,
            notes TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS consents (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            user_type TEXT NOT NULL CHECK (user_type IN ('customer', 'provider')),
            response TEXT NOT NULL CHECK (response IN ('accepted', 'declined')),
            message_log TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS providers (
            id TEXT PRIMARY KEY,
            phone TEXT,
            real_phone TEXT,
            phone_number TEXT,
            full_name TEXT NOT NULL,
            city TEXT,
            profession TEXT,
            services TEXT,
            rating REAL NOT NULL DEFAULT 0,
            available INTEGER NOT NULL DEFAULT 0,
            verified INTEGER NOT NULL DEFAULT 0,
            experience_years INTEGER NOT NULL DEFAULT 0,
            face_photo_url TEXT,
            social_media_url TEXT,
            social_media_type TEXT,
            created_at TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS service_synonyms (
            canonical_profession TEXT NOT NULL,
            synonym TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (canonical_profession, synonym)
        )",
    )
    .execute(pool)
    .await?;

    info!("database schema ready");
    Ok(())
}
