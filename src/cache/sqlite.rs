//! SQLite-backed [`CacheBackend`], the default primary store.
//!
//! Two tables:
//!
//! - `cache_entries(key, value, expires_at)`: `expires_at` in Unix
//!   milliseconds; expired rows are invisible to `get` and removed lazily
//! - `cache_counters(key, field, value)`: hash-style counters, incremented
//!   atomically with `INSERT … ON CONFLICT … RETURNING`

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use super::CacheBackend;
use crate::db;

pub struct SqliteBackend {
    pool: SqlitePool,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl SqliteBackend {
    /// Opens the database at `path` and creates the cache tables.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        let backend = Self { pool };
        backend.migrate().await?;
        Ok(backend)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_cache_entries_expiry ON cache_entries(expires_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_counters (
                key TEXT NOT NULL,
                field TEXT NOT NULL,
                value INTEGER NOT NULL,
                PRIMARY KEY (key, field)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl CacheBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value, expires_at FROM cache_entries WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let expires_at: i64 = row.get("expires_at");
        if expires_at <= now_ms() {
            sqlx::query("DELETE FROM cache_entries WHERE key = ? AND expires_at <= ?")
                .bind(key)
                .bind(now_ms())
                .execute(&self.pool)
                .await?;
            return Ok(None);
        }
        Ok(Some(row.get("value")))
    }

    async fn set_ex(&self, key: &str, ttl_secs: u64, value: &str) -> Result<()> {
        let ttl_ms = i64::try_from(ttl_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        let expires_at = now_ms().saturating_add(ttl_ms);
        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn hincr_by(&self, key: &str, field: &str, by: i64) -> Result<i64> {
        let value: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO cache_counters (key, field, value)
            VALUES (?, ?, ?)
            ON CONFLICT(key, field) DO UPDATE SET value = value + excluded.value
            RETURNING value
            "#,
        )
        .bind(key)
        .bind(field)
        .bind(by)
        .fetch_one(&self.pool)
        .await?;
        Ok(value)
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query("SELECT field, value FROM cache_counters WHERE key = ?")
            .bind(key)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("field"), r.get::<i64, _>("value")))
            .collect())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE substr(key, 1, length(?1)) = ?1")
            .bind(prefix)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?")
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
