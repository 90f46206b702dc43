//! Sync state persistence
//!
//! SQLite storage for the mutation log, snapshots and the local entity cache.
//!
//! The mutation log is append-only: every queue change appends a `put` or
//! `remove` row and the live queue is recovered by replaying rows in sequence
//! order. Compaction drops superseded rows inside a single transaction, so an
//! interrupted write or compaction never loses an acknowledged-pending record.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::error::QueueError;
use super::types::{EntityType, MutationKind, PendingMutation, ServerEntity, Snapshot};

/// Create every sync table
pub async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS mutation_log (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            op TEXT NOT NULL,
            record_id TEXT,
            entity_type TEXT,
            entity_id TEXT NOT NULL,
            kind TEXT,
            payload TEXT,
            base_version INTEGER,
            attempts INTEGER NOT NULL DEFAULT 0,
            created_at TEXT,
            revision INTEGER NOT NULL DEFAULT 0,
            force INTEGER NOT NULL DEFAULT 0,
            fatal INTEGER NOT NULL DEFAULT 0,
            next_retry_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_mutation_log_entity ON mutation_log(entity_id);

        CREATE TABLE IF NOT EXISTS snapshots (
            entity_id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            version INTEGER NOT NULL,
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS entity_cache (
            entity_id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

// ============================================================================
// Mutation Log
// ============================================================================

/// Append-only persistence for the mutation queue
pub struct MutationLog<'a> {
    pool: &'a SqlitePool,
}

impl<'a> MutationLog<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Record the current state of a pending mutation
    pub async fn append_put(&self, mutation: &PendingMutation) -> Result<(), QueueError> {
        let mut conn = self.pool.acquire().await?;
        append_put(&mut *conn, mutation).await
    }

    /// Record that an entity no longer has a pending mutation
    pub async fn append_remove(&self, entity_id: &str) -> Result<(), QueueError> {
        let mut conn = self.pool.acquire().await?;
        append_remove(&mut *conn, entity_id).await
    }

    /// Replay the log into the live queue, oldest enqueue first
    pub async fn load(&self) -> Result<Vec<PendingMutation>, QueueError> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT seq, op, record_id, entity_type, entity_id, kind, payload,
                   base_version, attempts, created_at, revision, force, fatal,
                   next_retry_at
            FROM mutation_log
            ORDER BY seq ASC
            "#,
        )
        .fetch_all(self.pool)
        .await?;

        let mut live: Vec<(i64, PendingMutation)> = Vec::new();
        for row in rows {
            let position = live
                .iter()
                .position(|(_, m)| m.entity_id == row.entity_id);

            if row.op == "remove" {
                if let Some(index) = position {
                    live.remove(index);
                }
                continue;
            }

            let seq = row.seq;
            let mutation = row.into_mutation()?;
            match position {
                Some(index) => live[index].1 = mutation,
                None => live.push((seq, mutation)),
            }
        }

        live.sort_by(|(a_seq, a), (b_seq, b)| {
            a.created_at.cmp(&b.created_at).then(a_seq.cmp(b_seq))
        });

        Ok(live.into_iter().map(|(_, m)| m).collect())
    }

    /// Drop superseded and removed rows; returns how many rows were deleted
    pub async fn compact(&self) -> Result<u64, QueueError> {
        let mut tx = self.pool.begin().await?;

        let superseded = sqlx::query(
            r#"
            DELETE FROM mutation_log
            WHERE seq NOT IN (SELECT MAX(seq) FROM mutation_log GROUP BY entity_id)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        let removed = sqlx::query("DELETE FROM mutation_log WHERE op = 'remove'")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(superseded.rows_affected() + removed.rows_affected())
    }

    /// Number of rows currently in the log
    pub async fn row_count(&self) -> Result<u64, QueueError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM mutation_log")
            .fetch_one(self.pool)
            .await?;
        Ok(count.0 as u64)
    }
}

pub(crate) async fn append_put(
    conn: &mut SqliteConnection,
    mutation: &PendingMutation,
) -> Result<(), QueueError> {
    let payload = mutation
        .payload
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        r#"
        INSERT INTO mutation_log (
            op, record_id, entity_type, entity_id, kind, payload, base_version,
            attempts, created_at, revision, force, fatal, next_retry_at
        ) VALUES ('put', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(mutation.id.to_string())
    .bind(mutation.entity_type.as_str())
    .bind(&mutation.entity_id)
    .bind(mutation.kind.as_str())
    .bind(&payload)
    .bind(mutation.base_version.map(|v| v as i64))
    .bind(mutation.attempts as i64)
    .bind(mutation.created_at.to_rfc3339())
    .bind(mutation.revision as i64)
    .bind(mutation.force)
    .bind(mutation.fatal)
    .bind(mutation.next_retry_at.map(|t| t.to_rfc3339()))
    .execute(conn)
    .await?;

    Ok(())
}

pub(crate) async fn append_remove(
    conn: &mut SqliteConnection,
    entity_id: &str,
) -> Result<(), QueueError> {
    sqlx::query("INSERT INTO mutation_log (op, entity_id) VALUES ('remove', ?)")
        .bind(entity_id)
        .execute(conn)
        .await?;
    Ok(())
}

#[derive(sqlx::FromRow)]
struct LogRow {
    seq: i64,
    op: String,
    record_id: Option<String>,
    entity_type: Option<String>,
    entity_id: String,
    kind: Option<String>,
    payload: Option<String>,
    base_version: Option<i64>,
    attempts: i64,
    created_at: Option<String>,
    revision: i64,
    force: bool,
    fatal: bool,
    next_retry_at: Option<String>,
}

impl LogRow {
    fn into_mutation(self) -> Result<PendingMutation, QueueError> {
        let seq = self.seq;
        let corrupt = |field: &str| QueueError::Corrupt(format!("{} (seq {})", field, seq));

        let id = self
            .record_id
            .as_deref()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| corrupt("record_id"))?;
        let entity_type = self
            .entity_type
            .as_deref()
            .and_then(EntityType::parse)
            .ok_or_else(|| corrupt("entity_type"))?;
        let kind = self
            .kind
            .as_deref()
            .and_then(MutationKind::parse)
            .ok_or_else(|| corrupt("kind"))?;
        let created_at = self
            .created_at
            .as_deref()
            .and_then(parse_time)
            .ok_or_else(|| corrupt("created_at"))?;

        let payload = self
            .payload
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(PendingMutation {
            id,
            entity_type,
            entity_id: self.entity_id,
            kind,
            payload,
            base_version: self.base_version.map(|v| v as u64),
            attempts: self.attempts as u32,
            created_at,
            revision: self.revision as u64,
            force: self.force,
            fatal: self.fatal,
            next_retry_at: self.next_retry_at.as_deref().and_then(parse_time),
        })
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ============================================================================
// Snapshots & Entity Cache
// ============================================================================

/// Repository for diff bases and the local entity cache
pub struct SnapshotRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SnapshotRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Get the last agreed value for an entity
    pub async fn get(&self, entity_id: &str) -> Result<Option<Snapshot>, sqlx::Error> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            r#"
            SELECT entity_id, entity_type, version, data, updated_at
            FROM snapshots
            WHERE entity_id = ?
            "#,
        )
        .bind(entity_id)
        .fetch_optional(self.pool)
        .await?;

        Ok(row.and_then(SnapshotRow::into_snapshot))
    }

    /// Record a confirmed server state as the new diff base
    pub async fn put(
        &self,
        entity_type: EntityType,
        entity: &ServerEntity,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        put_snapshot(&mut *conn, entity_type, entity, now).await
    }

    pub async fn delete(&self, entity_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM snapshots WHERE entity_id = ?")
            .bind(entity_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Current local value of an entity
    pub async fn cached(&self, entity_id: &str) -> Result<Option<Value>, sqlx::Error> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT data FROM entity_cache WHERE entity_id = ?")
                .bind(entity_id)
                .fetch_optional(self.pool)
                .await?;

        Ok(row.and_then(|(data,)| serde_json::from_str(&data).ok()))
    }

    /// Overwrite the local value of an entity
    pub async fn cache(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        data: &Value,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        put_cache(&mut *conn, entity_type, entity_id, data, now).await
    }

    pub async fn evict(&self, entity_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM entity_cache WHERE entity_id = ?")
            .bind(entity_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Forget an entity entirely (confirmed delete)
    pub async fn forget(&self, entity_id: &str) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM snapshots WHERE entity_id = ?")
            .bind(entity_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM entity_cache WHERE entity_id = ?")
            .bind(entity_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await
    }
}

pub(crate) async fn put_snapshot(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    entity: &ServerEntity,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO snapshots (entity_id, entity_type, version, data, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(entity_id) DO UPDATE SET
            entity_type = excluded.entity_type,
            version = excluded.version,
            data = excluded.data,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&entity.id)
    .bind(entity_type.as_str())
    .bind(entity.version as i64)
    .bind(entity.data.to_string())
    .bind(now.to_rfc3339())
    .execute(conn)
    .await?;

    Ok(())
}

pub(crate) async fn put_cache(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    entity_id: &str,
    data: &Value,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO entity_cache (entity_id, entity_type, data, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(entity_id) DO UPDATE SET
            data = excluded.data,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(entity_id)
    .bind(entity_type.as_str())
    .bind(data.to_string())
    .bind(now.to_rfc3339())
    .execute(conn)
    .await?;

    Ok(())
}

/// Move every persisted trace of a temporary id to its server id
///
/// Runs in one transaction: the log gets a `remove` for the old id (plus a
/// `put` for any edit made while the create was in flight), the snapshot is
/// written under the server id and the cache row is re-keyed.
pub(crate) async fn commit_create_ack(
    pool: &SqlitePool,
    temp_id: &str,
    entity_type: EntityType,
    acked: &ServerEntity,
    follow_up: Option<&PendingMutation>,
    now: DateTime<Utc>,
) -> Result<(), QueueError> {
    let mut tx = pool.begin().await?;

    append_remove(&mut *tx, temp_id).await?;
    if let Some(mutation) = follow_up {
        append_put(&mut *tx, mutation).await?;
    }

    put_snapshot(&mut *tx, entity_type, acked, now).await?;

    sqlx::query("DELETE FROM entity_cache WHERE entity_id = ?")
        .bind(temp_id)
        .execute(&mut *tx)
        .await?;

    let data = follow_up
        .and_then(|m| m.payload.as_ref())
        .unwrap_or(&acked.data);
    put_cache(&mut *tx, entity_type, &acked.id, data, now).await?;

    tx.commit().await?;
    Ok(())
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    entity_id: String,
    entity_type: String,
    version: i64,
    data: String,
    updated_at: String,
}

impl SnapshotRow {
    fn into_snapshot(self) -> Option<Snapshot> {
        Some(Snapshot {
            entity_type: EntityType::parse(&self.entity_type)?,
            version: self.version as u64,
            data: serde_json::from_str(&self.data).ok()?,
            updated_at: parse_time(&self.updated_at)?,
            entity_id: self.entity_id,
        })
    }
}
