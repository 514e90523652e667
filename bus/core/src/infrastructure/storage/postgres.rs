// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Storage Backend
//!
//! Networked implementation of the storage interface via `sqlx`, shared by
//! every bus process pointing at the same database.
//!
//! | Table | Holds |
//! |-------|-------|
//! | `bus_entries` | scalar keys |
//! | `bus_set_members` | one row per set member |
//! | `bus_list_items` | one row per list item, ordered by `seq` |
//!
//! TTL is carried as an `expires_at` column evaluated against the database
//! clock; every read filters on it and [`Storage::purge_expired`] deletes
//! what has lapsed. Sets do not expire.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::domain::storage::{Storage, StorageError};
use crate::infrastructure::db::Database;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS bus_entries (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        expires_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS bus_set_members (
        set_key TEXT NOT NULL,
        member TEXT NOT NULL,
        PRIMARY KEY (set_key, member)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS bus_list_items (
        list_key TEXT NOT NULL,
        seq BIGSERIAL,
        value TEXT NOT NULL,
        expires_at TIMESTAMPTZ,
        PRIMARY KEY (list_key, seq)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS bus_entries_expires_at_idx ON bus_entries (expires_at) WHERE expires_at IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS bus_list_items_expires_at_idx ON bus_list_items (expires_at) WHERE expires_at IS NOT NULL",
];

/// `expires_at` expression for an optional TTL bound as milliseconds
const EXPIRY_EXPR: &str =
    "CASE WHEN $%::BIGINT IS NULL THEN NULL ELSE now() + ($%::BIGINT * INTERVAL '1 millisecond') END";

const LIVE: &str = "(expires_at IS NULL OR expires_at > now())";

fn expiry(param: usize) -> String {
    EXPIRY_EXPR.replace('%', &param.to_string())
}

fn ttl_millis(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.get_pool().clone(),
        }
    }

    /// Create tables and indexes if they do not exist yet
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT value FROM bus_entries WHERE key = $1 AND {}",
            LIVE
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(row.try_get("value")?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        sqlx::query(&format!(
            r#"
            INSERT INTO bus_entries (key, value, expires_at)
            VALUES ($1, $2, {})
            ON CONFLICT (key) DO UPDATE SET
                value = EXCLUDED.value,
                expires_at = EXCLUDED.expires_at
            "#,
            expiry(3)
        ))
        .bind(key)
        .bind(value)
        .bind(ttl_millis(ttl))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        removed += sqlx::query(&format!("DELETE FROM bus_entries WHERE key = $1 AND {}", LIVE))
            .bind(key)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        // Expired leftovers go too, without counting as a hit
        sqlx::query("DELETE FROM bus_entries WHERE key = $1")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        removed += sqlx::query("DELETE FROM bus_set_members WHERE set_key = $1")
            .bind(key)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        removed += sqlx::query("DELETE FROM bus_list_items WHERE list_key = $1")
            .bind(key)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError> {
        let millis = ttl_millis(Some(ttl));
        let mut tx = self.pool.begin().await?;
        let scalar = sqlx::query(&format!(
            "UPDATE bus_entries SET expires_at = {} WHERE key = $1 AND {}",
            expiry(2),
            LIVE
        ))
        .bind(key)
        .bind(millis)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let list = sqlx::query(&format!(
            "UPDATE bus_list_items SET expires_at = {} WHERE list_key = $1 AND {}",
            expiry(2),
            LIVE
        ))
        .bind(key)
        .bind(millis)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(scalar + list > 0)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "INSERT INTO bus_set_members (set_key, member) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(key)
        .bind(member)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM bus_set_members WHERE set_key = $1 AND member = $2")
            .bind(key)
            .bind(member)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query("SELECT member FROM bus_set_members WHERE set_key = $1 ORDER BY member")
            .bind(key)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("member").map_err(StorageError::from))
            .collect()
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM bus_set_members WHERE set_key = $1 AND member = $2) AS present",
        )
        .bind(key)
        .bind(member)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("present")?)
    }

    async fn list_push(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<u64, StorageError> {
        let millis = ttl_millis(ttl);
        let mut tx = self.pool.begin().await?;

        // An expired list starts over
        sqlx::query("DELETE FROM bus_list_items WHERE list_key = $1 AND expires_at <= now()")
            .bind(key)
            .execute(&mut *tx)
            .await?;

        sqlx::query(&format!(
            "INSERT INTO bus_list_items (list_key, value, expires_at) VALUES ($1, $2, {})",
            expiry(3)
        ))
        .bind(key)
        .bind(value)
        .bind(millis)
        .execute(&mut *tx)
        .await?;

        if millis.is_some() {
            sqlx::query(&format!(
                "UPDATE bus_list_items SET expires_at = {} WHERE list_key = $1",
                expiry(2)
            ))
            .bind(key)
            .bind(millis)
            .execute(&mut *tx)
            .await?;
        }

        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS len FROM bus_list_items WHERE list_key = $1 AND {}",
            LIVE
        ))
        .bind(key)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        let len: i64 = row.try_get("len")?;
        Ok(len.max(0) as u64)
    }

    async fn list_range(&self, key: &str, offset: usize, limit: Option<usize>) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT value FROM bus_list_items WHERE list_key = $1 AND {} ORDER BY seq OFFSET $2 LIMIT $3",
            LIVE
        ))
        .bind(key)
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .bind(limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX)))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("value").map_err(StorageError::from))
            .collect()
    }

    async fn list_len(&self, key: &str) -> Result<u64, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS len FROM bus_list_items WHERE list_key = $1 AND {}",
            LIVE
        ))
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        let len: i64 = row.try_get("len")?;
        Ok(len.max(0) as u64)
    }

    async fn purge_expired(&self) -> Result<u64, StorageError> {
        let entries = sqlx::query("DELETE FROM bus_entries WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?
            .rows_affected();
        let items = sqlx::query("DELETE FROM bus_list_items WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(entries + items)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_expression_binds_requested_parameter() {
        let expr = expiry(3);
        assert!(expr.contains("$3::BIGINT IS NULL"));
        assert!(expr.contains("($3::BIGINT * INTERVAL"));
        assert!(!expr.contains('%'));
    }

    #[test]
    fn test_ttl_millis() {
        assert_eq!(ttl_millis(None), None);
        assert_eq!(ttl_millis(Some(Duration::from_secs(60))), Some(60_000));
    }
}
