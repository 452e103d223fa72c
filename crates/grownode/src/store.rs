//! Persisted key/value store backing `Persisted` leaf parameters.
//!
//! Every operation is a single statement, so writes are atomic per key at
//! the SQLite layer and no lock is held between calls.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::error::Result;

/// Longest key the store accepts; longer inputs are hashed down to this.
pub const STORE_KEY_MAX: usize = 15;

#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

/// Derive the store key for a leaf parameter: lowercased `"{leaf}_{param}"`
/// hashed with 64-bit FNV-1a, hex encoded and cut to [`STORE_KEY_MAX`].
/// Distinct names may collide; nothing detects it.
pub fn store_key(leaf: &str, param: &str) -> String {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let raw = format!("{leaf}_{param}").to_lowercase();
    let hash = raw.bytes().fold(FNV_OFFSET, |h, b| {
        (h ^ u64::from(b)).wrapping_mul(FNV_PRIME)
    });

    let mut key = format!("{hash:016x}");
    key.truncate(STORE_KEY_MAX);
    key
}

impl Store {
    /// store_url examples:
    /// - "sqlite:/var/lib/grownode/grownode.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(store_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(store_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);

        // Each connection to an in-memory database is a separate database.
        let max_connections = if store_url.contains(":memory:") { 1 } else { 4 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        sqlx::query(
            r#"
            INSERT INTO param_store (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
              value=excluded.value,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::debug!(key, len = value.len(), "store set");
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM param_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }

    /// Factory reset: drop every stored value.
    pub async fn erase(&self) -> Result<u64> {
        let done = sqlx::query("DELETE FROM param_store")
            .execute(&self.pool)
            .await?;
        tracing::warn!(removed = done.rows_affected(), "store erased");
        Ok(done.rows_affected())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
