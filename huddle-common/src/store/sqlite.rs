//! SQLite store backend
//!
//! One database file shared by every node on a host. WAL mode lets readers
//! proceed beside the single writer; `busy_timeout` is set per connection so
//! contending writers wait instead of failing immediately.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::keys::prefix_upper_bound;
use super::{LogSlice, LogStore, Mutator, StateStore, TailEntry, Versioned};
use crate::events::{Event, NewEvent, Topic};
use crate::ids::{TenantId, UserId};
use crate::time::{expiry_from_ttl, from_ms, now_ms};
use crate::{Error, Result};

/// Optimistic read-modify-write attempts before reporting contention
const UPDATE_MAX_ATTEMPTS: usize = 16;

type EventRow = (i64, String, String, String, i64);
type TailRow = (i64, String, String, i64, String, String, String, i64);

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path` and ensure the schema
    pub async fn open(db_path: &Path, busy_timeout: Duration) -> Result<Self> {
        let newly_created = !db_path.exists();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .connect_with(options)
            .await?;

        if newly_created {
            info!("Initialized new store database: {}", db_path.display());
        } else {
            info!("Opened existing store database: {}", db_path.display());
        }

        create_kv_table(&pool).await?;
        create_log_heads_table(&pool).await?;
        create_event_log_table(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn read_row(&self, key: &str) -> Result<Option<(String, i64, Option<i64>)>> {
        let row = sqlx::query_as::<_, (String, i64, Option<i64>)>(
            "SELECT value, version, expires_at FROM kv_store WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

async fn create_kv_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kv_store (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            version INTEGER NOT NULL,
            expires_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_kv_store_expires ON kv_store(expires_at)")
        .execute(pool)
        .await?;
    Ok(())
}

async fn create_log_heads_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS log_heads (
            tenant_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            last_id INTEGER NOT NULL,
            PRIMARY KEY (tenant_id, user_id)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_event_log_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS event_log (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            event_id INTEGER NOT NULL,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            origin_node TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE (tenant_id, user_id, event_id)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

fn is_live(expires_at: Option<i64>, now: i64) -> bool {
    expires_at.map_or(true, |at| at > now)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn decode_event(row: EventRow) -> Result<Event> {
    let (event_id, event_type, payload, origin_node, created_at) = row;
    Ok(Event {
        id: to_u64(event_id),
        event_type,
        payload: serde_json::from_str(&payload)?,
        origin_node,
        timestamp: from_ms(created_at),
    })
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<Versioned> {
        let expires_at = expiry_from_ttl(ttl);
        let version: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO kv_store (key, value, version, expires_at) VALUES (?, ?, 1, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                version = kv_store.version + 1,
                expires_at = excluded.expires_at
            RETURNING version
            "#,
        )
        .bind(key)
        .bind(value.to_string())
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(Versioned {
            value,
            version: to_u64(version),
            expires_at,
        })
    }

    async fn insert(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<Versioned> {
        let expires_at = expiry_from_ttl(ttl);
        // An expired row may be replaced; a live one wins
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO kv_store (key, value, version, expires_at) VALUES (?, ?, 1, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                version = kv_store.version + 1,
                expires_at = excluded.expires_at
            WHERE kv_store.expires_at IS NOT NULL AND kv_store.expires_at <= ?
            RETURNING version
            "#,
        )
        .bind(key)
        .bind(value.to_string())
        .bind(expires_at)
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await?;

        match version {
            Some(version) => Ok(Versioned {
                value,
                version: to_u64(version),
                expires_at,
            }),
            None => Err(Error::Conflict(format!("key already exists: {key}"))),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let Some((value, version, expires_at)) = self.read_row(key).await? else {
            return Ok(None);
        };
        if !is_live(expires_at, now_ms()) {
            return Ok(None);
        }
        Ok(Some(Versioned {
            value: serde_json::from_str(&value)?,
            version: to_u64(version),
            expires_at,
        }))
    }

    async fn update(
        &self,
        key: &str,
        ttl: Option<Duration>,
        mutator: &mut Mutator<'_>,
    ) -> Result<Versioned> {
        for attempt in 1..=UPDATE_MAX_ATTEMPTS {
            let row = self.read_row(key).await?;
            let now = now_ms();

            let live = match &row {
                Some((value, version, expires_at)) if is_live(*expires_at, now) => {
                    Some((serde_json::from_str::<Value>(value)?, *version, *expires_at))
                }
                _ => None,
            };

            let next = mutator(live.as_ref().map(|(value, _, _)| value))?;
            let expires_at = match ttl {
                Some(ttl) => expiry_from_ttl(Some(ttl)),
                None => live.as_ref().and_then(|(_, _, expires_at)| *expires_at),
            };

            // Compare-and-swap on the version we read (or on absence)
            let written: Option<i64> = match &row {
                Some((_, version, _)) => {
                    sqlx::query_scalar(
                        r#"
                        UPDATE kv_store SET value = ?, version = version + 1, expires_at = ?
                        WHERE key = ? AND version = ?
                        RETURNING version
                        "#,
                    )
                    .bind(next.to_string())
                    .bind(expires_at)
                    .bind(key)
                    .bind(*version)
                    .fetch_optional(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query_scalar(
                        r#"
                        INSERT INTO kv_store (key, value, version, expires_at) VALUES (?, ?, 1, ?)
                        ON CONFLICT(key) DO NOTHING
                        RETURNING version
                        "#,
                    )
                    .bind(key)
                    .bind(next.to_string())
                    .bind(expires_at)
                    .fetch_optional(&self.pool)
                    .await?
                }
            };

            if let Some(version) = written {
                return Ok(Versioned {
                    value: next,
                    version: to_u64(version),
                    expires_at,
                });
            }
            debug!("update of {} lost a race (attempt {})", key, attempt);
            tokio::task::yield_now().await;
        }

        Err(Error::Conflict(format!(
            "update of {key} kept losing to concurrent writers"
        )))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed: Option<Option<i64>> =
            sqlx::query_scalar("DELETE FROM kv_store WHERE key = ? RETURNING expires_at")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(removed.is_some_and(|expires_at| is_live(expires_at, now_ms())))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        let rows = sqlx::query_as::<_, (String, String, i64, Option<i64>)>(
            r#"
            SELECT key, value, version, expires_at FROM kv_store
            WHERE key >= ? AND key < ? AND (expires_at IS NULL OR expires_at > ?)
            ORDER BY key
            "#,
        )
        .bind(prefix)
        .bind(prefix_upper_bound(prefix))
        .bind(now_ms())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(key, value, version, expires_at)| {
                Ok((
                    key,
                    Versioned {
                        value: serde_json::from_str(&value)?,
                        version: to_u64(version),
                        expires_at,
                    },
                ))
            })
            .collect()
    }

    async fn sweep_expired(&self) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM kv_store WHERE expires_at IS NOT NULL AND expires_at <= ?")
                .bind(now_ms())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl LogStore for SqliteStore {
    async fn append(
        &self,
        topic: &Topic,
        event: NewEvent,
        origin_node: &str,
        capacity: usize,
    ) -> Result<Event> {
        let created_at = now_ms();
        let payload = event.payload.to_string();

        // Head bump is the first statement so the write lock is taken up front
        let mut tx = self.pool.begin().await?;
        let last_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO log_heads (tenant_id, user_id, last_id) VALUES (?, ?, 1)
            ON CONFLICT(tenant_id, user_id) DO UPDATE SET last_id = log_heads.last_id + 1
            RETURNING last_id
            "#,
        )
        .bind(topic.tenant_id.as_str())
        .bind(topic.user_id.as_str())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO event_log
                (tenant_id, user_id, event_id, event_type, payload, origin_node, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(topic.tenant_id.as_str())
        .bind(topic.user_id.as_str())
        .bind(last_id)
        .bind(&event.event_type)
        .bind(&payload)
        .bind(origin_node)
        .bind(created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM event_log WHERE tenant_id = ? AND user_id = ? AND event_id <= ?")
            .bind(topic.tenant_id.as_str())
            .bind(topic.user_id.as_str())
            .bind(last_id - to_i64(capacity.max(1) as u64))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Event {
            id: to_u64(last_id),
            event_type: event.event_type,
            payload: event.payload,
            origin_node: origin_node.to_string(),
            timestamp: from_ms(created_at),
        })
    }

    async fn read_since(&self, topic: &Topic, cursor: u64, limit: usize) -> Result<LogSlice> {
        // One read transaction so events and bounds come from the same snapshot
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT event_id, event_type, payload, origin_node, created_at FROM event_log
            WHERE tenant_id = ? AND user_id = ? AND event_id > ?
            ORDER BY event_id
            LIMIT ?
            "#,
        )
        .bind(topic.tenant_id.as_str())
        .bind(topic.user_id.as_str())
        .bind(to_i64(cursor))
        .bind(to_i64(limit as u64))
        .fetch_all(&mut *tx)
        .await?;

        let oldest_id: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(event_id) FROM event_log WHERE tenant_id = ? AND user_id = ?",
        )
        .bind(topic.tenant_id.as_str())
        .bind(topic.user_id.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let head_id: Option<i64> =
            sqlx::query_scalar("SELECT last_id FROM log_heads WHERE tenant_id = ? AND user_id = ?")
                .bind(topic.tenant_id.as_str())
                .bind(topic.user_id.as_str())
                .fetch_optional(&mut *tx)
                .await?;

        tx.commit().await?;

        Ok(LogSlice {
            events: rows.into_iter().map(decode_event).collect::<Result<_>>()?,
            oldest_id: oldest_id.map(to_u64),
            head_id: head_id.map(to_u64).unwrap_or(0),
        })
    }

    async fn tail(&self, after_seq: u64, limit: usize) -> Result<Vec<TailEntry>> {
        let rows = sqlx::query_as::<_, TailRow>(
            r#"
            SELECT seq, tenant_id, user_id, event_id, event_type, payload, origin_node, created_at
            FROM event_log
            WHERE seq > ?
            ORDER BY seq
            LIMIT ?
            "#,
        )
        .bind(to_i64(after_seq))
        .bind(to_i64(limit as u64))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(
                |(seq, tenant_id, user_id, event_id, event_type, payload, origin_node, created_at)| {
                    Ok(TailEntry {
                        seq: to_u64(seq),
                        topic: Topic::new(TenantId::new(tenant_id), UserId::new(user_id)),
                        event: decode_event((event_id, event_type, payload, origin_node, created_at))?,
                    })
                },
            )
            .collect()
    }

    async fn tail_head(&self) -> Result<u64> {
        let head: Option<i64> = sqlx::query_scalar("SELECT MAX(seq) FROM event_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(head.map(to_u64).unwrap_or(0))
    }
}
