//! Mutation queue
//!
//! Durable, ordered store of pending local mutations with:
//! - At most one outstanding mutation per entity (later edits squash)
//! - FIFO order by original enqueue time
//! - Append-only persistence with periodic compaction
//! - Atomic temporary-id rewrite on create acknowledgment

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use super::clock::Clock;
use super::conflict::ConflictStore;
use super::error::QueueError;
use super::status::SyncStatusStore;
use super::store::{self, MutationLog, SnapshotRepository};
use super::types::{EntityType, MutationKind, PendingMutation, ServerEntity, SyncStatus, TempId};

/// Compact the log after this many appends unless configured otherwise
pub const DEFAULT_COMPACT_EVERY: u64 = 64;

/// What happened to a queue record when its create was acknowledged
#[derive(Debug, Clone, PartialEq)]
pub enum CreateAck {
    /// Nothing left to send
    Settled,
    /// The entity was edited while the create was in flight; the newer edit
    /// is now queued against the server id
    FollowUp(MutationKind),
    /// The create was cancelled locally while in flight
    Cancelled,
}

/// How the server answered an update or delete
#[derive(Debug, Clone, Copy)]
pub enum Settlement<'a> {
    /// Update accepted; the cache takes the server's value
    Accepted {
        entity_type: EntityType,
        server: &'a ServerEntity,
    },
    /// Delete confirmed; snapshot and cache are dropped
    Deleted,
    /// Payload refused; the cache reverts to the last agreed value
    Reverted {
        entity_type: EntityType,
        snapshot: &'a Value,
    },
}

#[derive(Clone)]
pub struct MutationQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    status: SyncStatusStore,
    conflicts: ConflictStore,
    /// Live records in FIFO order; held across log writes so the log order
    /// always matches memory
    entries: Mutex<Vec<PendingMutation>>,
    appends_since_compact: AtomicU64,
    compact_every: u64,
    /// Bumped on every enqueue; lets the engine tell if work arrived mid-pass
    generation: AtomicU64,
}

impl MutationQueue {
    /// Open the queue, replaying and compacting the persisted log
    pub async fn open(
        pool: SqlitePool,
        clock: Arc<dyn Clock>,
        status: SyncStatusStore,
        conflicts: ConflictStore,
        compact_every: u64,
    ) -> Result<Self, QueueError> {
        let log = MutationLog::new(&pool);
        let entries = log.load().await?;
        let compacted = log.compact().await?;

        for mutation in &entries {
            status.set(&mutation.entity_id, mutation.kind.pending_status());
        }

        tracing::info!(
            pending = entries.len(),
            compacted_rows = compacted,
            "Mutation queue loaded"
        );

        Ok(Self {
            inner: Arc::new(QueueInner {
                pool,
                clock,
                status,
                conflicts,
                entries: Mutex::new(entries),
                appends_since_compact: AtomicU64::new(0),
                compact_every: compact_every.max(1),
                generation: AtomicU64::new(0),
            }),
        })
    }

    // ========================================================================
    // Enqueue
    // ========================================================================

    /// Queue a local edit, squashing into any pending mutation for the entity
    pub async fn enqueue(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        kind: MutationKind,
        payload: Value,
    ) -> Result<(), QueueError> {
        if self.inner.conflicts.contains(entity_id)
            || self.inner.status.get(entity_id) == Some(SyncStatus::Conflict)
        {
            return Err(QueueError::Blocked(entity_id.to_string()));
        }

        let now = self.inner.clock.now();
        let mut entries = self.inner.entries.lock().await;
        let position = entries.iter().position(|m| m.entity_id == entity_id);

        let record = match position {
            None => {
                let base_version = match kind {
                    MutationKind::Create => None,
                    _ => Some(self.base_version(entity_id).await?),
                };
                let payload = (kind != MutationKind::Delete).then_some(payload);
                let mutation =
                    PendingMutation::new(entity_type, entity_id, kind, payload, base_version, now);
                entries.push(mutation.clone());
                mutation
            }
            Some(index) => {
                let existing = &mut entries[index];
                match (existing.kind, kind) {
                    (MutationKind::Delete, _) => {
                        return Err(QueueError::EntityDeleted(entity_id.to_string()));
                    }
                    (MutationKind::Create, MutationKind::Delete) => {
                        // The server never saw it; both edits cancel out
                        entries.remove(index);
                        MutationLog::new(&self.inner.pool)
                            .append_remove(entity_id)
                            .await?;
                        SnapshotRepository::new(&self.inner.pool)
                            .evict(entity_id)
                            .await?;
                        self.inner.status.remove(entity_id);
                        self.bump_generation();
                        drop(entries);
                        tracing::debug!(entity_id = %entity_id, "Unsent create cancelled by delete");
                        return self.after_append().await;
                    }
                    (_, MutationKind::Delete) => {
                        existing.kind = MutationKind::Delete;
                        existing.payload = None;
                    }
                    // create stays create, update stays update
                    (_, _) => existing.payload = Some(payload),
                }
                existing.attempts = 0;
                existing.next_retry_at = None;
                existing.fatal = false;
                existing.revision += 1;
                existing.clone()
            }
        };

        MutationLog::new(&self.inner.pool).append_put(&record).await?;
        if let Some(payload) = &record.payload {
            SnapshotRepository::new(&self.inner.pool)
                .cache(entity_type, entity_id, payload, now)
                .await?;
        }
        self.inner.status.set(entity_id, record.kind.pending_status());
        self.inner.status.clear_error(entity_id);
        self.bump_generation();
        drop(entries);

        tracing::debug!(
            entity_id = %entity_id,
            kind = record.kind.as_str(),
            revision = record.revision,
            "Mutation enqueued"
        );

        self.after_append().await
    }

    async fn base_version(&self, entity_id: &str) -> Result<u64, QueueError> {
        if TempId::is_temporary(entity_id) {
            return Err(QueueError::UnknownEntity(entity_id.to_string()));
        }
        SnapshotRepository::new(&self.inner.pool)
            .get(entity_id)
            .await?
            .map(|snapshot| snapshot.version)
            .ok_or_else(|| QueueError::UnknownEntity(entity_id.to_string()))
    }

    // ========================================================================
    // Read Side
    // ========================================================================

    /// Oldest due mutation whose entity is not in `skip`
    ///
    /// Fatal records, entities parked in conflict and records still backing
    /// off are never returned. The record stays queued until
    /// [`remove`](Self::remove) or [`settle`](Self::settle) is called.
    pub async fn dequeue_next(&self, skip: &HashSet<String>) -> Option<PendingMutation> {
        let now = self.inner.clock.now();
        let entries = self.inner.entries.lock().await;
        entries
            .iter()
            .find(|m| self.is_due(m, now) && !skip.contains(&m.entity_id))
            .cloned()
    }

    pub async fn get(&self, entity_id: &str) -> Option<PendingMutation> {
        let entries = self.inner.entries.lock().await;
        entries.iter().find(|m| m.entity_id == entity_id).cloned()
    }

    /// Every pending mutation in queue order
    pub async fn pending(&self) -> Vec<PendingMutation> {
        self.inner.entries.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.entries.lock().await.is_empty()
    }

    /// Number of records some later pass will send
    pub async fn sendable_len(&self) -> usize {
        let entries = self.inner.entries.lock().await;
        entries.iter().filter(|m| self.is_sendable(m)).count()
    }

    /// Number of records a pass could send right now
    pub async fn due_len(&self) -> usize {
        let now = self.inner.clock.now();
        let entries = self.inner.entries.lock().await;
        entries.iter().filter(|m| self.is_due(m, now)).count()
    }

    /// Earliest future retry time among records backing off
    pub async fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        let now = self.inner.clock.now();
        let entries = self.inner.entries.lock().await;
        entries
            .iter()
            .filter(|m| self.is_sendable(m))
            .filter_map(|m| m.next_retry_at)
            .filter(|at| *at > now)
            .min()
    }

    fn is_sendable(&self, mutation: &PendingMutation) -> bool {
        !mutation.fatal && !self.inner.conflicts.contains(&mutation.entity_id)
    }

    fn is_due(&self, mutation: &PendingMutation, now: DateTime<Utc>) -> bool {
        self.is_sendable(mutation) && mutation.next_retry_at.map_or(true, |at| at <= now)
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Engine / Resolver Side
    // ========================================================================

    /// Drop the pending mutation for an entity
    pub async fn remove(&self, entity_id: &str) -> Result<Option<PendingMutation>, QueueError> {
        let mut entries = self.inner.entries.lock().await;
        let Some(index) = entries.iter().position(|m| m.entity_id == entity_id) else {
            return Ok(None);
        };

        MutationLog::new(&self.inner.pool)
            .append_remove(entity_id)
            .await?;
        let removed = entries.remove(index);
        drop(entries);

        self.after_append().await?;
        Ok(Some(removed))
    }

    /// Settle an answered update or delete
    ///
    /// Removes the record only if it was not edited again while the request
    /// was in flight; a newer edit stays queued (rebased onto the server
    /// version when the update was accepted). The entity cache and status are
    /// written with the queue lock held, so an enqueue can never land between
    /// dropping the record and overwriting its cached value. Returns the
    /// record still pending, if any.
    pub async fn settle(
        &self,
        entity_id: &str,
        sent_revision: u64,
        settlement: Settlement<'_>,
    ) -> Result<Option<PendingMutation>, QueueError> {
        let now = self.inner.clock.now();
        let mut entries = self.inner.entries.lock().await;
        let Some(index) = entries.iter().position(|m| m.entity_id == entity_id) else {
            return Ok(None);
        };

        // Nothing is left to send once the server no longer has the entity
        let edited = entries[index].revision != sent_revision;
        if edited && !matches!(settlement, Settlement::Deleted) {
            let record = &mut entries[index];
            if let Settlement::Accepted { server, .. } = settlement {
                record.base_version = Some(server.version);
                record.force = false;
            }
            let record = record.clone();
            MutationLog::new(&self.inner.pool).append_put(&record).await?;
            self.inner
                .status
                .set(entity_id, record.kind.pending_status());
            drop(entries);

            self.after_append().await?;
            return Ok(Some(record));
        }

        MutationLog::new(&self.inner.pool)
            .append_remove(entity_id)
            .await?;
        entries.remove(index);

        let repo = SnapshotRepository::new(&self.inner.pool);
        match settlement {
            Settlement::Accepted {
                entity_type,
                server,
            } => {
                repo.cache(entity_type, entity_id, &server.data, now).await?;
                self.inner.status.clear_error(entity_id);
                self.inner.status.set(entity_id, SyncStatus::Synced);
            }
            Settlement::Deleted => {
                repo.forget(entity_id).await?;
                self.inner.status.remove(entity_id);
            }
            Settlement::Reverted {
                entity_type,
                snapshot,
            } => {
                repo.cache(entity_type, entity_id, snapshot, now).await?;
                self.inner.status.set(entity_id, SyncStatus::Synced);
            }
        }
        drop(entries);

        self.after_append().await?;
        Ok(None)
    }

    /// Apply an in-place change to a pending record and persist it
    pub async fn modify<F>(
        &self,
        entity_id: &str,
        change: F,
    ) -> Result<Option<PendingMutation>, QueueError>
    where
        F: FnOnce(&mut PendingMutation),
    {
        let mut entries = self.inner.entries.lock().await;
        let Some(record) = entries.iter_mut().find(|m| m.entity_id == entity_id) else {
            return Ok(None);
        };

        change(record);
        let record = record.clone();
        MutationLog::new(&self.inner.pool).append_put(&record).await?;
        drop(entries);

        self.after_append().await?;
        Ok(Some(record))
    }

    /// Count a transient failure and schedule the next retry
    pub async fn record_attempt(
        &self,
        entity_id: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<u32, QueueError> {
        let record = self
            .modify(entity_id, |m| {
                m.attempts += 1;
                m.next_retry_at = next_retry_at;
            })
            .await?;
        Ok(record.map(|m| m.attempts).unwrap_or(0))
    }

    /// Rename a temporary id after the server acknowledged the create
    ///
    /// The log, snapshot and cache move in one database transaction and the
    /// in-memory queue and status store are updated while the queue lock is
    /// held, so no reader sees a half-applied rewrite.
    pub async fn rewrite_id(
        &self,
        temp_id: &str,
        sent_revision: u64,
        entity_type: EntityType,
        acked: &ServerEntity,
    ) -> Result<CreateAck, QueueError> {
        let now = self.inner.clock.now();
        let mut entries = self.inner.entries.lock().await;
        let position = entries.iter().position(|m| m.entity_id == temp_id);

        let follow_up = position.and_then(|index| {
            let record = &entries[index];
            (record.revision != sent_revision).then(|| {
                let mut next = record.clone();
                next.entity_id = acked.id.clone();
                next.base_version = Some(acked.version);
                next.attempts = 0;
                next.next_retry_at = None;
                if next.kind == MutationKind::Create {
                    next.kind = MutationKind::Update;
                }
                next
            })
        });

        store::commit_create_ack(
            &self.inner.pool,
            temp_id,
            entity_type,
            acked,
            follow_up.as_ref(),
            now,
        )
        .await?;

        let outcome = match (position, follow_up) {
            (None, _) => CreateAck::Cancelled,
            (Some(index), Some(next)) => {
                let kind = next.kind;
                self.inner
                    .status
                    .rename(temp_id, &acked.id, kind.pending_status());
                entries[index] = next;
                CreateAck::FollowUp(kind)
            }
            (Some(index), None) => {
                self.inner.status.rename(temp_id, &acked.id, SyncStatus::Synced);
                entries.remove(index);
                CreateAck::Settled
            }
        };
        drop(entries);

        tracing::info!(
            temp_id = %temp_id,
            server_id = %acked.id,
            outcome = ?outcome,
            "Create acknowledged"
        );

        self.after_append().await?;
        Ok(outcome)
    }

    /// Compact the persisted log now
    pub async fn compact(&self) -> Result<u64, QueueError> {
        let _entries = self.inner.entries.lock().await;
        let deleted = MutationLog::new(&self.inner.pool).compact().await?;
        self.inner.appends_since_compact.store(0, Ordering::SeqCst);
        tracing::debug!(deleted_rows = deleted, "Mutation log compacted");
        Ok(deleted)
    }

    fn bump_generation(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
    }

    async fn after_append(&self) -> Result<(), QueueError> {
        let appended = self.inner.appends_since_compact.fetch_add(1, Ordering::SeqCst) + 1;
        if appended >= self.inner.compact_every {
            self.compact().await?;
        }
        Ok(())
    }
}
