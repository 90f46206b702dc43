//! Sync engine
//!
//! Drains the mutation queue against the remote transport:
//! - One in-flight request at a time, queue order, per-entity total order
//! - Coalesced triggers (a trigger during a pass schedules one rerun)
//! - Rebase-and-resubmit on version mismatch with disjoint changes
//! - Entities with true divergence are parked without blocking the rest

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::{broadcast, Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;

use super::clock::Clock;
use super::conflict::{ConflictDetector, ConflictRecord, ConflictStore, Detection, MergePolicy};
use super::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use super::error::{Result, TransportError};
use super::queue::{CreateAck, MutationQueue, Settlement, DEFAULT_COMPACT_EVERY};
use super::resolver::ConflictResolver;
use super::retry::RetryPolicy;
use super::status::{Subscription, SyncStatusStore};
use super::store::{self, SnapshotRepository};
use super::transport::SyncTransport;
use super::types::{
    ConflictDetails, DrainReport, EntityType, MutationKind, PendingMutation, Resolution,
    ServerEntity, SyncProgress, SyncStatus, TempId,
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    /// Per-call limit; exceeding it counts as a transient failure
    pub request_timeout: Duration,
    pub compact_every: u64,
    pub merge_policy: MergePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            compact_every: DEFAULT_COMPACT_EVERY,
            merge_policy: MergePolicy::default(),
        }
    }
}

/// Facade over the queue, status store and resolver
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn SyncTransport>,
    monitor: ConnectivityMonitor,
    queue: MutationQueue,
    status: SyncStatusStore,
    conflicts: ConflictStore,
    resolver: ConflictResolver,
    config: EngineConfig,
    /// Held for the whole of a drain; at most one drain runs
    draining: Mutex<()>,
    rerun: AtomicBool,
    /// Queue generation when the running pass started
    pass_generation: AtomicU64,
    /// Signalled after every pass so the scheduler re-reads retry times
    rescheduled: Arc<Notify>,
}

/// How one mutation left the pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Synced,
    Conflict,
    Failed,
    Deferred,
}

/// A single transport request
#[derive(Clone, Copy)]
enum Request<'a> {
    Fetch,
    Create(&'a Value),
    Update(&'a Value, Option<u64>),
    Delete(Option<u64>),
}

enum Attempt {
    /// `None` for deletes
    Done(Option<ServerEntity>),
    Rejected(TransportError),
    /// Retry ceiling reached or connectivity lost
    GaveUp,
}

impl SyncEngine {
    /// Open the engine on an initialised pool, replaying the persisted queue
    pub async fn new(
        pool: SqlitePool,
        transport: Arc<dyn SyncTransport>,
        monitor: ConnectivityMonitor,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Result<Self> {
        store::init_schema(&pool).await?;

        let status = SyncStatusStore::new();
        let conflicts = ConflictStore::new();
        let queue = MutationQueue::open(
            pool.clone(),
            clock.clone(),
            status.clone(),
            conflicts.clone(),
            config.compact_every,
        )
        .await?;
        let resolver = ConflictResolver::new(
            pool.clone(),
            clock.clone(),
            queue.clone(),
            status.clone(),
            conflicts.clone(),
            config.merge_policy.clone(),
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                pool,
                clock,
                transport,
                monitor,
                queue,
                status,
                conflicts,
                resolver,
                config,
                draining: Mutex::new(()),
                rerun: AtomicBool::new(false),
                pass_generation: AtomicU64::new(0),
                rescheduled: Arc::new(Notify::new()),
            }),
        })
    }

    // ========================================================================
    // Local Edits
    // ========================================================================

    /// Queue a local edit
    ///
    /// Edits addressed to a temporary id that was already acknowledged are
    /// redirected to the server id.
    pub async fn enqueue(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        kind: MutationKind,
        payload: Value,
    ) -> Result<()> {
        let entity_id = self
            .inner
            .status
            .resolve_alias(entity_id)
            .unwrap_or_else(|| entity_id.to_string());

        self.inner
            .queue
            .enqueue(entity_type, &entity_id, kind, payload)
            .await?;
        Ok(())
    }

    /// Queue a new entity under a fresh temporary id
    pub async fn create(&self, entity_type: EntityType, payload: Value) -> Result<String> {
        let id = TempId::generate();
        self.enqueue(entity_type, &id, MutationKind::Create, payload)
            .await?;
        Ok(id)
    }

    /// Record an entity fetched from the server as the agreed base
    ///
    /// Entities with a pending mutation keep their local value; only the
    /// cache of untouched entities is refreshed.
    pub async fn track(&self, entity_type: EntityType, entity: &ServerEntity) -> Result<()> {
        if self.inner.queue.get(&entity.id).await.is_some() {
            return Ok(());
        }
        let repo = SnapshotRepository::new(&self.inner.pool);
        let now = self.inner.clock.now();
        repo.put(entity_type, entity, now).await?;
        repo.cache(entity_type, &entity.id, &entity.data, now).await?;
        self.inner.status.set(&entity.id, SyncStatus::Synced);
        Ok(())
    }

    /// Current local value of an entity
    pub async fn cached(&self, entity_id: &str) -> Result<Option<Value>> {
        Ok(SnapshotRepository::new(&self.inner.pool)
            .cached(entity_id)
            .await?)
    }

    // ========================================================================
    // Read Side
    // ========================================================================

    pub fn status(&self) -> &SyncStatusStore {
        &self.inner.status
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.inner.monitor
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.inner.queue
    }

    /// See [`SyncStatusStore::subscribe`]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&str, Option<SyncStatus>) + Send + Sync + 'static,
    {
        self.inner.status.subscribe(listener)
    }

    pub fn get_conflict(&self, entity_id: &str) -> Option<ConflictDetails> {
        self.inner.conflicts.get(entity_id).map(|record| record.details)
    }

    pub async fn resolve_conflict(&self, entity_id: &str, resolution: Resolution) -> Result<()> {
        self.inner.resolver.resolve(entity_id, resolution).await?;
        Ok(())
    }

    // ========================================================================
    // Triggers
    // ========================================================================

    /// Start a drain in the background
    ///
    /// While a drain is running this only schedules a rerun, and only if
    /// something was enqueued since the running pass started.
    pub fn trigger_sync(&self) {
        if !self.inner.monitor.is_online() {
            tracing::debug!("Sync trigger ignored while offline");
            return;
        }

        let engine = self.clone();
        tokio::spawn(async move {
            let Ok(guard) = engine.inner.draining.try_lock() else {
                engine.request_rerun();
                return;
            };
            if engine.inner.queue.due_len().await == 0 {
                return;
            }
            if let Err(e) = engine.drain(guard).await {
                tracing::error!(error = %e, "Sync drain failed");
            }
        });
    }

    /// Run a drain and wait for it
    ///
    /// When a drain is already in flight this coalesces like
    /// [`trigger_sync`](Self::trigger_sync): the running drain takes one more
    /// pass if something was enqueued since it started, and the returned
    /// report is empty apart from `deferred`.
    pub async fn sync_now(&self) -> Result<DrainReport> {
        if !self.inner.monitor.is_online() {
            return Ok(self.idle_report().await);
        }
        let Ok(guard) = self.inner.draining.try_lock() else {
            tracing::debug!("Drain in flight, sync request coalesced");
            self.request_rerun();
            return Ok(self.idle_report().await);
        };
        self.drain(guard).await
    }

    async fn idle_report(&self) -> DrainReport {
        DrainReport {
            deferred: self.inner.queue.sendable_len().await,
            ..DrainReport::default()
        }
    }

    /// Spawn the scheduler: drains on every reconnect and whenever a record's
    /// retry backoff runs out
    pub fn start(&self) -> JoinHandle<()> {
        let engine = Arc::downgrade(&self.inner);
        let mut events = self.inner.monitor.events();
        let queue = self.inner.queue.clone();
        let clock = self.inner.clock.clone();
        let rescheduled = self.inner.rescheduled.clone();

        tokio::spawn(async move {
            loop {
                let next_retry_at = queue.next_retry_at().await;
                let backoff = async {
                    match next_retry_at {
                        Some(at) => {
                            let wait = (at - clock.now()).to_std().unwrap_or_default();
                            clock.sleep(wait).await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    event = events.recv() => match event {
                        Ok(ConnectivityEvent::Reconnected) => {
                            tracing::info!("Reconnected, draining mutation queue");
                            if !Self::wake(&engine) {
                                break;
                            }
                        }
                        Ok(ConnectivityEvent::Disconnected) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "Connectivity events lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = backoff => {
                        tracing::debug!("Retry backoff elapsed");
                        if !Self::wake(&engine) {
                            break;
                        }
                    }
                    _ = rescheduled.notified() => {}
                }
            }
        })
    }

    /// Trigger a drain if the engine is still alive
    fn wake(engine: &Weak<EngineInner>) -> bool {
        match engine.upgrade() {
            Some(inner) => {
                SyncEngine { inner }.trigger_sync();
                true
            }
            None => false,
        }
    }

    fn request_rerun(&self) {
        let pass_generation = self.inner.pass_generation.load(Ordering::SeqCst);
        if self.inner.queue.generation() != pass_generation {
            self.inner.rerun.store(true, Ordering::SeqCst);
        }
    }

    // ========================================================================
    // Drain
    // ========================================================================

    async fn drain(&self, guard: MutexGuard<'_, ()>) -> Result<DrainReport> {
        let mut total = DrainReport::default();
        let mut guard = Some(guard);

        loop {
            let held = match guard.take() {
                Some(held) => held,
                None => match self.inner.draining.try_lock() {
                    Ok(held) => held,
                    // Another drain picked the rerun up
                    Err(_) => break,
                },
            };

            loop {
                self.inner.rerun.store(false, Ordering::SeqCst);
                self.inner
                    .pass_generation
                    .store(self.inner.queue.generation(), Ordering::SeqCst);

                let report = self.run_pass().await?;
                total.processed += report.processed;
                total.synced += report.synced;
                total.conflicts += report.conflicts;
                total.failed += report.failed;
                total.deferred = report.deferred;

                if !self.inner.rerun.swap(false, Ordering::SeqCst)
                    || !self.inner.monitor.is_online()
                {
                    break;
                }
                tracing::debug!("Rerun requested during pass");
            }
            drop(held);

            // A trigger can land between the last check and the unlock
            if !self.inner.rerun.load(Ordering::SeqCst) {
                break;
            }
        }

        Ok(total)
    }

    async fn run_pass(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let total = self.inner.queue.due_len().await;
        if total == 0 {
            report.deferred = self.inner.queue.sendable_len().await;
            return Ok(report);
        }

        tracing::info!(pending = total, "Sync pass started");
        self.inner
            .status
            .set_progress(Some(SyncProgress { processed: 0, total }));

        let mut seen = HashSet::new();
        while let Some(mutation) = self.inner.queue.dequeue_next(&seen).await {
            if !self.inner.monitor.is_online() {
                tracing::info!("Connectivity lost, pass stopped");
                break;
            }
            seen.insert(mutation.entity_id.clone());

            match self.process(mutation).await? {
                Outcome::Synced => report.synced += 1,
                Outcome::Conflict => report.conflicts += 1,
                Outcome::Failed => report.failed += 1,
                Outcome::Deferred => {}
            }
            report.processed += 1;
            self.inner.status.set_progress(Some(SyncProgress {
                processed: report.processed,
                total: total.max(report.processed),
            }));
        }

        report.deferred = self.inner.queue.sendable_len().await;
        self.inner.status.set_progress(None);
        self.inner.rescheduled.notify_one();

        tracing::info!(
            processed = report.processed,
            synced = report.synced,
            conflicts = report.conflicts,
            failed = report.failed,
            deferred = report.deferred,
            "Sync pass finished"
        );

        Ok(report)
    }

    /// Send one mutation to completion, conflict or give-up
    async fn process(&self, mut mutation: PendingMutation) -> Result<Outcome> {
        let mut rebased = false;

        loop {
            let base_version = if mutation.force {
                None
            } else {
                mutation.base_version
            };
            let empty = Value::Object(Default::default());
            let payload = mutation.payload.as_ref().unwrap_or(&empty);
            let request = match mutation.kind {
                MutationKind::Create => Request::Create(payload),
                MutationKind::Update => Request::Update(payload, base_version),
                MutationKind::Delete => Request::Delete(base_version),
            };

            let attempt = self.send_with_retry(&mutation, request).await?;
            return match (mutation.kind, attempt) {
                (_, Attempt::GaveUp) => Ok(Outcome::Failed),

                (MutationKind::Create, Attempt::Done(Some(acked))) => {
                    self.acknowledge_create(&mutation, acked).await
                }
                (MutationKind::Update, Attempt::Done(Some(server))) => {
                    self.acknowledge_update(&mutation, server).await
                }
                (MutationKind::Delete, Attempt::Done(_))
                | (MutationKind::Delete, Attempt::Rejected(TransportError::NotFound(_))) => {
                    self.acknowledge_delete(&mutation).await
                }
                (MutationKind::Update, Attempt::Rejected(TransportError::NotFound(_))) => {
                    self.server_deleted(&mutation).await
                }
                (_, Attempt::Rejected(TransportError::VersionMismatch))
                    if mutation.kind != MutationKind::Create =>
                {
                    match self.reconcile(&mutation, rebased).await? {
                        Reconcile::Resubmit(next) => {
                            mutation = next;
                            rebased = true;
                            continue;
                        }
                        Reconcile::Done(outcome) => Ok(outcome),
                    }
                }
                (_, Attempt::Rejected(TransportError::Validation(message))) => {
                    self.reject(&mutation, &message).await
                }
                (_, Attempt::Rejected(error)) => {
                    tracing::warn!(
                        entity_id = %mutation.entity_id,
                        error = %error,
                        "Unexpected transport failure"
                    );
                    self.inner
                        .status
                        .set_error(&mutation.entity_id, error.to_string());
                    Ok(Outcome::Failed)
                }
                (_, Attempt::Done(_)) => {
                    self.inner
                        .status
                        .set_error(&mutation.entity_id, "Server acknowledged without a body");
                    Ok(Outcome::Failed)
                }
            };
        }
    }

    /// Issue a request, retrying transient failures with backoff
    async fn send_with_retry(&self, mutation: &PendingMutation, request: Request<'_>) -> Result<Attempt> {
        let retry = self.inner.config.retry;
        let mut tries = 0;

        loop {
            let error = match self.send(mutation, request).await {
                Ok(reply) => return Ok(Attempt::Done(reply)),
                Err(error) if !error.is_transient() => return Ok(Attempt::Rejected(error)),
                Err(error) => error,
            };

            tries += 1;
            let failed = mutation.attempts + tries;
            let delay = retry.delay(failed);
            let next_retry_at = self.inner.clock.now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            let attempts = self
                .inner
                .queue
                .record_attempt(&mutation.entity_id, Some(next_retry_at))
                .await?;

            tracing::warn!(
                entity_id = %mutation.entity_id,
                attempts,
                error = %error,
                "Transient sync failure"
            );

            if tries >= retry.max_attempts {
                self.inner.status.set_error(
                    &mutation.entity_id,
                    format!("Gave up after {} attempts: {}", attempts, error),
                );
                return Ok(Attempt::GaveUp);
            }
            if !self.inner.monitor.is_online() {
                return Ok(Attempt::GaveUp);
            }

            self.inner.clock.sleep(delay).await;
        }
    }

    async fn send(
        &self,
        mutation: &PendingMutation,
        request: Request<'_>,
    ) -> std::result::Result<Option<ServerEntity>, TransportError> {
        let transport = &self.inner.transport;
        let entity_type = mutation.entity_type;
        let id = mutation.entity_id.as_str();

        let call = async {
            match request {
                Request::Fetch => transport.fetch(entity_type, id).await.map(Some),
                Request::Create(payload) => transport.create(entity_type, payload).await.map(Some),
                Request::Update(payload, base_version) => transport
                    .update(entity_type, id, payload, base_version)
                    .await
                    .map(Some),
                Request::Delete(base_version) => transport
                    .delete(entity_type, id, base_version)
                    .await
                    .map(|_| None),
            }
        };

        tokio::time::timeout(self.inner.config.request_timeout, call)
            .await
            .unwrap_or(Err(TransportError::Timeout))
    }

    // ========================================================================
    // Acknowledgments
    // ========================================================================

    async fn acknowledge_create(&self, mutation: &PendingMutation, acked: ServerEntity) -> Result<Outcome> {
        let outcome = self
            .inner
            .queue
            .rewrite_id(&mutation.entity_id, mutation.revision, mutation.entity_type, &acked)
            .await?;

        if outcome == CreateAck::Cancelled {
            // Deleted locally while the create was in flight
            self.inner
                .queue
                .enqueue(mutation.entity_type, &acked.id, MutationKind::Delete, Value::Null)
                .await?;
        }
        Ok(Outcome::Synced)
    }

    async fn acknowledge_update(&self, mutation: &PendingMutation, server: ServerEntity) -> Result<Outcome> {
        let repo = SnapshotRepository::new(&self.inner.pool);
        let now = self.inner.clock.now();
        repo.put(mutation.entity_type, &server, now).await?;

        // Edited again in flight: the newer value stays cached and queued
        self.inner
            .queue
            .settle(
                &mutation.entity_id,
                mutation.revision,
                Settlement::Accepted {
                    entity_type: mutation.entity_type,
                    server: &server,
                },
            )
            .await?;

        tracing::debug!(entity_id = %mutation.entity_id, version = server.version, "Update acknowledged");
        Ok(Outcome::Synced)
    }

    async fn acknowledge_delete(&self, mutation: &PendingMutation) -> Result<Outcome> {
        self.inner
            .queue
            .settle(&mutation.entity_id, mutation.revision, Settlement::Deleted)
            .await?;

        tracing::debug!(entity_id = %mutation.entity_id, "Delete acknowledged");
        Ok(Outcome::Synced)
    }

    // ========================================================================
    // Mismatch Handling
    // ========================================================================

    /// Fetch the server value after a version mismatch and diff against it
    async fn reconcile(&self, mutation: &PendingMutation, rebased: bool) -> Result<Reconcile> {
        let server = match self.send_with_retry(mutation, Request::Fetch).await? {
            Attempt::Done(Some(server)) => server,
            Attempt::Rejected(TransportError::NotFound(_)) => {
                let outcome = match mutation.kind {
                    MutationKind::Delete => self.acknowledge_delete(mutation).await?,
                    _ => self.server_deleted(mutation).await?,
                };
                return Ok(Reconcile::Done(outcome));
            }
            Attempt::Rejected(error) => {
                self.inner
                    .status
                    .set_error(&mutation.entity_id, error.to_string());
                return Ok(Reconcile::Done(Outcome::Failed));
            }
            Attempt::GaveUp | Attempt::Done(None) => return Ok(Reconcile::Done(Outcome::Failed)),
        };

        let repo = SnapshotRepository::new(&self.inner.pool);
        let base = repo
            .get(&mutation.entity_id)
            .await?
            .map(|snapshot| snapshot.data)
            .unwrap_or(Value::Null);

        let detection = match (mutation.kind, &mutation.payload) {
            (MutationKind::Update, Some(local)) => ConflictDetector::detect(&base, local, &server.data),
            _ => ConflictDetector::detect_delete(&base, &server.data),
        };

        match detection {
            Detection::Conflict { details, merged } => {
                self.park(mutation, details, merged, Some(server.version));
                Ok(Reconcile::Done(Outcome::Conflict))
            }
            Detection::Clean { .. } if rebased => {
                // The server moved again under the rebased resubmit
                tracing::debug!(entity_id = %mutation.entity_id, "Second mismatch, deferring");
                Ok(Reconcile::Done(Outcome::Deferred))
            }
            Detection::Clean { merged } => self.rebase(mutation, &server, merged).await,
        }
    }

    async fn rebase(
        &self,
        mutation: &PendingMutation,
        server: &ServerEntity,
        merged: Value,
    ) -> Result<Reconcile> {
        let current = self.inner.queue.get(&mutation.entity_id).await;
        if current.map(|m| m.revision) != Some(mutation.revision) {
            // Edited while we were diffing; the next pass diffs the newer value
            return Ok(Reconcile::Done(Outcome::Deferred));
        }

        let repo = SnapshotRepository::new(&self.inner.pool);
        let now = self.inner.clock.now();
        repo.put(mutation.entity_type, server, now).await?;

        let is_update = mutation.kind == MutationKind::Update;
        if is_update {
            repo.cache(mutation.entity_type, &mutation.entity_id, &merged, now)
                .await?;
        }

        let version = server.version;
        let next = self
            .inner
            .queue
            .modify(&mutation.entity_id, |m| {
                m.base_version = Some(version);
                m.force = false;
                if is_update {
                    m.payload = Some(merged);
                }
            })
            .await?;

        tracing::debug!(
            entity_id = %mutation.entity_id,
            base_version = version,
            "Rebased onto server version"
        );

        Ok(match next {
            Some(next) => Reconcile::Resubmit(next),
            None => Reconcile::Done(Outcome::Deferred),
        })
    }

    /// A local update hit an entity the server no longer has
    async fn server_deleted(&self, mutation: &PendingMutation) -> Result<Outcome> {
        let base = SnapshotRepository::new(&self.inner.pool)
            .get(&mutation.entity_id)
            .await?
            .map(|snapshot| snapshot.data)
            .unwrap_or(Value::Null);
        let local = mutation.payload.clone().unwrap_or(Value::Null);

        match ConflictDetector::detect_server_deleted(&base, &local) {
            Detection::Conflict { details, merged } => {
                self.park(mutation, details, merged, None);
                Ok(Outcome::Conflict)
            }
            // Nothing of ours would be lost
            Detection::Clean { .. } => self.acknowledge_delete(mutation).await,
        }
    }

    fn park(&self, mutation: &PendingMutation, details: ConflictDetails, merged: Value, server_version: Option<u64>) {
        tracing::warn!(
            entity_id = %mutation.entity_id,
            fields = ?details.conflicting_fields,
            "Conflict detected"
        );

        self.inner.conflicts.insert(
            &mutation.entity_id,
            ConflictRecord {
                entity_type: mutation.entity_type,
                kind: mutation.kind,
                details,
                merged,
                server_version,
            },
        );
        self.inner
            .status
            .set(&mutation.entity_id, SyncStatus::Conflict);
    }

    /// The server refused the payload itself; retrying cannot help
    async fn reject(&self, mutation: &PendingMutation, message: &str) -> Result<Outcome> {
        tracing::warn!(
            entity_id = %mutation.entity_id,
            error = %message,
            "Mutation rejected by server"
        );
        self.inner.status.set_error(&mutation.entity_id, message);

        let repo = SnapshotRepository::new(&self.inner.pool);
        match repo.get(&mutation.entity_id).await? {
            Some(snapshot) => {
                // An edit made in flight stays queued and is sent next pass
                self.inner
                    .queue
                    .settle(
                        &mutation.entity_id,
                        mutation.revision,
                        Settlement::Reverted {
                            entity_type: mutation.entity_type,
                            snapshot: &snapshot.data,
                        },
                    )
                    .await?;
            }
            None => {
                // Nothing to revert to; keep it for the user to fix unless
                // they already did while it was in flight
                let revision = mutation.revision;
                self.inner
                    .queue
                    .modify(&mutation.entity_id, |m| {
                        if m.revision == revision {
                            m.fatal = true;
                        }
                    })
                    .await?;
            }
        }

        Ok(Outcome::Failed)
    }
}

enum Reconcile {
    Resubmit(PendingMutation),
    Done(Outcome),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::ManualClock;
    use crate::sync::connectivity::MonitorConfig;
    use crate::sync::error::{QueueError, SyncError};
    use crate::sync::store::tests::setup_test_db;
    use crate::sync::testing::{Call, MemoryTransport};
    use chrono::Utc;
    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

    struct Harness {
        engine: SyncEngine,
        server: MemoryTransport,
        pool: SqlitePool,
        clock: ManualClock,
    }

    async fn harness() -> Harness {
        harness_with(EngineConfig::default()).await
    }

    async fn harness_with(config: EngineConfig) -> Harness {
        let clock = ManualClock::auto_advance(Utc::now());
        harness_on(setup_test_db().await, config, clock).await
    }

    async fn harness_on(pool: SqlitePool, config: EngineConfig, clock: ManualClock) -> Harness {
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let monitor = ConnectivityMonitor::new(shared.clone(), MonitorConfig::default(), true);
        let server = MemoryTransport::new();

        let engine = SyncEngine::new(
            pool.clone(),
            Arc::new(server.clone()),
            monitor,
            shared,
            config,
        )
        .await
        .unwrap();

        Harness {
            engine,
            server,
            pool,
            clock,
        }
    }

    fn single_attempt() -> EngineConfig {
        EngineConfig {
            retry: RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            },
            ..EngineConfig::default()
        }
    }

    /// Seed the server and the local base with the same entity
    async fn fetched(h: &Harness, id: &str, data: Value) -> ServerEntity {
        let entity = h.server.seed(id, 1, data);
        h.engine.track(EntityType::Order, &entity).await.unwrap();
        entity
    }

    fn writes(server: &MemoryTransport) -> usize {
        server
            .calls()
            .iter()
            .filter(|call| !matches!(call, Call::Fetch(_)))
            .count()
    }

    #[tokio::test]
    async fn test_update_round_trip() {
        let h = harness().await;
        fetched(&h, "A", json!({"status": "open", "notes": "a"})).await;

        h.engine
            .enqueue(EntityType::Order, "A", MutationKind::Update, json!({"status": "open", "notes": "b"}))
            .await
            .unwrap();
        assert_eq!(h.engine.status().get("A"), Some(SyncStatus::PendingUpdate));

        let report = h.engine.sync_now().await.unwrap();

        assert_eq!(report.synced, 1);
        assert_eq!(report.deferred, 0);
        assert_eq!(h.engine.status().get("A"), Some(SyncStatus::Synced));
        assert_eq!(h.server.get("A").unwrap().version, 2);
        assert!(h.engine.queue().is_empty().await);
        assert_eq!(h.engine.status().progress(), None);
    }

    #[tokio::test]
    async fn test_create_ack_rewrites_temp_id() {
        let h = harness().await;
        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let sink = seen.clone();
        let _subscription = h.engine.subscribe(move |id, status| {
            sink.lock().push((id.to_string(), status));
        });

        let temp = h.engine.create(EntityType::Order, json!({"notes": "new"})).await.unwrap();
        h.engine.sync_now().await.unwrap();

        assert_eq!(h.engine.status().get(&temp), None);
        assert_eq!(h.engine.status().get("order-1"), Some(SyncStatus::Synced));
        assert_eq!(h.engine.status().resolve_alias(&temp).as_deref(), Some("order-1"));
        assert_eq!(h.engine.cached(&temp).await.unwrap(), None);
        assert_eq!(h.engine.cached("order-1").await.unwrap(), Some(json!({"notes": "new"})));
        assert_eq!(
            *seen.lock(),
            vec![
                (temp.clone(), Some(SyncStatus::PendingCreate)),
                ("order-1".to_string(), Some(SyncStatus::Synced)),
            ]
        );

        // Late edits through the temporary id land on the server id
        h.engine
            .enqueue(EntityType::Order, &temp, MutationKind::Update, json!({"notes": "edited"}))
            .await
            .unwrap();
        assert_eq!(h.engine.queue().get("order-1").await.unwrap().base_version, Some(1));
    }

    #[tokio::test]
    async fn test_edit_during_create_follows_up() {
        let h = harness().await;
        let temp = h.engine.create(EntityType::Order, json!({"notes": "a"})).await.unwrap();

        h.server.hold_next();
        let engine = h.engine.clone();
        let pass = tokio::spawn(async move { engine.sync_now().await });

        h.server.entered().await;
        h.engine
            .enqueue(EntityType::Order, &temp, MutationKind::Update, json!({"notes": "b"}))
            .await
            .unwrap();
        h.server.release();
        pass.await.unwrap().unwrap();

        // The follow-up was sent in the same pass under the server id
        assert_eq!(h.server.get("order-1").unwrap().data, json!({"notes": "b"}));
        assert_eq!(h.engine.status().get("order-1"), Some(SyncStatus::Synced));
        assert!(h.engine.queue().is_empty().await);
    }

    #[tokio::test]
    async fn test_disjoint_edits_rebase_and_resubmit() {
        let h = harness().await;
        fetched(&h, "A", json!({"status": "open", "notes": "a"})).await;

        h.engine
            .enqueue(EntityType::Order, "A", MutationKind::Update, json!({"status": "open", "notes": "b"}))
            .await
            .unwrap();
        h.server.edit("A", json!({"status": "closed", "notes": "a"}));

        let report = h.engine.sync_now().await.unwrap();

        assert_eq!(report.synced, 1);
        assert_eq!(report.conflicts, 0);
        let server = h.server.get("A").unwrap();
        assert_eq!(server.data, json!({"status": "closed", "notes": "b"}));
        assert_eq!(server.version, 3);
        assert_eq!(h.engine.status().get("A"), Some(SyncStatus::Synced));
    }

    #[tokio::test]
    async fn test_conflict_parks_only_that_entity() {
        let h = harness().await;
        fetched(&h, "A", json!({"notes": "a"})).await;
        fetched(&h, "B", json!({"notes": "a"})).await;

        h.engine
            .enqueue(EntityType::Order, "A", MutationKind::Update, json!({"notes": "mine"}))
            .await
            .unwrap();
        h.engine
            .enqueue(EntityType::Order, "B", MutationKind::Update, json!({"notes": "fine"}))
            .await
            .unwrap();
        h.server.edit("A", json!({"notes": "theirs"}));

        let report = h.engine.sync_now().await.unwrap();

        assert_eq!(report.conflicts, 1);
        assert_eq!(report.synced, 1);
        assert_eq!(h.engine.status().get("A"), Some(SyncStatus::Conflict));
        assert_eq!(h.engine.status().get("B"), Some(SyncStatus::Synced));

        let details = h.engine.get_conflict("A").unwrap();
        assert_eq!(details.conflicting_fields, vec!["notes".to_string()]);
        assert_eq!(details.local_entity, json!({"notes": "mine"}));
        assert_eq!(details.server_entity, json!({"notes": "theirs"}));

        let err = h
            .engine
            .enqueue(EntityType::Order, "A", MutationKind::Update, json!({"notes": "again"}))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Queue(QueueError::Blocked(_))));

        // Parked entities are not retried by later passes
        let before = h.server.calls().len();
        h.engine.sync_now().await.unwrap();
        assert_eq!(h.server.calls().len(), before);
    }

    #[tokio::test]
    async fn test_local_resolution_overwrites_server() {
        let h = harness().await;
        fetched(&h, "A", json!({"notes": "a", "tax": 1})).await;
        h.engine
            .enqueue(EntityType::Order, "A", MutationKind::Update, json!({"notes": "mine", "tax": 1}))
            .await
            .unwrap();
        h.server.edit("A", json!({"notes": "theirs", "tax": 2}));
        h.engine.sync_now().await.unwrap();

        h.engine.resolve_conflict("A", Resolution::Local).await.unwrap();
        assert_eq!(h.engine.status().get("A"), Some(SyncStatus::PendingUpdate));
        h.engine.sync_now().await.unwrap();

        assert_eq!(h.server.get("A").unwrap().data, json!({"notes": "mine", "tax": 2}));
        assert_eq!(h.engine.status().get("A"), Some(SyncStatus::Synced));
        assert!(h.engine.get_conflict("A").is_none());
    }

    #[tokio::test]
    async fn test_transient_failure_retries_with_backoff() {
        let h = harness().await;
        fetched(&h, "A", json!({"notes": "a"})).await;
        h.engine
            .enqueue(EntityType::Order, "A", MutationKind::Update, json!({"notes": "b"}))
            .await
            .unwrap();

        h.server.fail_next(TransportError::Network("reset".to_string()));
        h.server.fail_next(TransportError::Timeout);

        let report = h.engine.sync_now().await.unwrap();

        assert_eq!(report.synced, 1);
        assert_eq!(writes(&h.server), 3);
        assert_eq!(h.engine.status().error("A"), None);
    }

    #[tokio::test]
    async fn test_retry_ceiling_keeps_mutation() {
        let config = EngineConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                ..RetryPolicy::default()
            },
            ..EngineConfig::default()
        };
        let h = harness_with(config).await;
        fetched(&h, "A", json!({"notes": "a"})).await;
        h.engine
            .enqueue(EntityType::Order, "A", MutationKind::Update, json!({"notes": "b"}))
            .await
            .unwrap();

        for _ in 0..3 {
            h.server.fail_next(TransportError::Network("down".to_string()));
        }
        let report = h.engine.sync_now().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(writes(&h.server), 3);
        let mutation = h.engine.queue().get("A").await.unwrap();
        assert_eq!(mutation.attempts, 3);
        assert!(mutation.next_retry_at.is_some());
        assert_eq!(h.engine.status().get("A"), Some(SyncStatus::PendingUpdate));
        assert!(h.engine.status().error("A").unwrap().contains("3 attempts"));

        // A later pass picks it up once the backoff has run out
        h.clock.advance(RetryPolicy::default().delay(3));
        let report = h.engine.sync_now().await.unwrap();
        assert_eq!(report.synced, 1);
        assert!(h.engine.queue().is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_mutation_waits_out_backoff() {
        let h = harness_with(single_attempt()).await;
        fetched(&h, "A", json!({"notes": "a"})).await;
        h.engine
            .enqueue(EntityType::Order, "A", MutationKind::Update, json!({"notes": "b"}))
            .await
            .unwrap();

        h.server.fail_next(TransportError::Network("reset".to_string()));
        let report = h.engine.sync_now().await.unwrap();
        assert_eq!(report.failed, 1);
        let retry_at = h.engine.queue().get("A").await.unwrap().next_retry_at.unwrap();
        assert_eq!(retry_at - h.clock.now(), chrono::Duration::seconds(1));

        // Triggers before the backoff ran out send nothing
        let report = h.engine.sync_now().await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.deferred, 1);
        h.engine.trigger_sync();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(writes(&h.server), 1);

        h.clock.advance(Duration::from_secs(1));
        let report = h.engine.sync_now().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(writes(&h.server), 2);
    }

    #[tokio::test]
    async fn test_scheduler_retries_when_backoff_elapses() {
        let clock = ManualClock::new(Utc::now());
        let h = harness_on(setup_test_db().await, single_attempt(), clock).await;
        fetched(&h, "A", json!({"notes": "a"})).await;
        h.engine
            .enqueue(EntityType::Order, "A", MutationKind::Update, json!({"notes": "b"}))
            .await
            .unwrap();

        h.server.fail_next(TransportError::Network("reset".to_string()));
        h.engine.sync_now().await.unwrap();

        let scheduler = h.engine.start();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(writes(&h.server), 1);

        h.clock.advance(Duration::from_secs(1));
        for _ in 0..200 {
            if h.engine.status().get("A") == Some(SyncStatus::Synced) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.engine.status().get("A"), Some(SyncStatus::Synced));
        assert_eq!(writes(&h.server), 2);
        scheduler.abort();
    }

    #[tokio::test]
    async fn test_request_timeout_is_transient() {
        let config = EngineConfig {
            request_timeout: Duration::from_millis(50),
            ..EngineConfig::default()
        };
        let h = harness_with(config).await;
        fetched(&h, "A", json!({"notes": "a"})).await;
        h.engine
            .enqueue(EntityType::Order, "A", MutationKind::Update, json!({"notes": "b"}))
            .await
            .unwrap();

        h.server.hang_next();
        let report = h.engine.sync_now().await.unwrap();

        assert_eq!(report.synced, 1);
        assert_eq!(writes(&h.server), 2);
    }

    #[tokio::test]
    async fn test_validation_reverts_to_snapshot() {
        let h = harness().await;
        fetched(&h, "A", json!({"total": 10})).await;
        h.engine
            .enqueue(EntityType::Order, "A", MutationKind::Update, json!({"total": -1}))
            .await
            .unwrap();

        h.server.fail_next(TransportError::Validation("total must be positive".to_string()));
        let report = h.engine.sync_now().await.unwrap();

        assert_eq!(report.failed, 1);
        assert!(h.engine.queue().is_empty().await);
        assert_eq!(h.engine.status().get("A"), Some(SyncStatus::Synced));
        assert_eq!(
            h.engine.status().error("A").as_deref(),
            Some("total must be positive")
        );
        assert_eq!(h.engine.cached("A").await.unwrap(), Some(json!({"total": 10})));
    }

    #[tokio::test]
    async fn test_validation_on_new_entity_keeps_it_pending() {
        let h = harness().await;
        let temp = h.engine.create(EntityType::Order, json!({"total": -1})).await.unwrap();

        h.server.fail_next(TransportError::Validation("total must be positive".to_string()));
        h.engine.sync_now().await.unwrap();

        assert!(h.engine.queue().get(&temp).await.unwrap().fatal);
        assert_eq!(h.engine.status().get(&temp), Some(SyncStatus::PendingCreate));
        assert!(h.engine.status().error(&temp).is_some());

        // Skipped until edited
        let before = h.server.calls().len();
        h.engine.sync_now().await.unwrap();
        assert_eq!(h.server.calls().len(), before);

        h.engine
            .enqueue(EntityType::Order, &temp, MutationKind::Update, json!({"total": 5}))
            .await
            .unwrap();
        h.engine.sync_now().await.unwrap();
        assert!(h.engine.queue().is_empty().await);
        assert_eq!(h.engine.status().get("order-1"), Some(SyncStatus::Synced));
    }

    #[tokio::test]
    async fn test_delete_removes_entity_entirely() {
        let h = harness().await;
        fetched(&h, "A", json!({"notes": "a"})).await;
        h.engine
            .enqueue(EntityType::Order, "A", MutationKind::Delete, Value::Null)
            .await
            .unwrap();

        h.engine.sync_now().await.unwrap();

        assert!(h.server.get("A").is_none());
        assert_eq!(h.engine.status().get("A"), None);
        assert!(SnapshotRepository::new(&h.pool).get("A").await.unwrap().is_none());
        assert_eq!(h.engine.cached("A").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_offline_skips_pass() {
        let h = harness().await;
        fetched(&h, "A", json!({"notes": "a"})).await;
        h.engine
            .enqueue(EntityType::Order, "A", MutationKind::Update, json!({"notes": "b"}))
            .await
            .unwrap();

        h.engine.monitor().report(false);
        let report = h.engine.sync_now().await.unwrap();

        assert_eq!(report.processed, 0);
        assert_eq!(report.deferred, 1);
        assert!(h.server.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_triggers_drain() {
        let h = harness().await;
        fetched(&h, "A", json!({"notes": "a"})).await;
        h.engine.monitor().report(false);
        let listener = h.engine.start();

        h.engine
            .enqueue(EntityType::Order, "A", MutationKind::Update, json!({"notes": "b"}))
            .await
            .unwrap();
        h.engine.monitor().report(true);

        for _ in 0..200 {
            if h.engine.status().get("A") == Some(SyncStatus::Synced) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.engine.status().get("A"), Some(SyncStatus::Synced));
        listener.abort();
    }

    #[tokio::test]
    async fn test_trigger_during_pass_is_coalesced() {
        let h = harness().await;
        fetched(&h, "A", json!({"notes": "a"})).await;
        h.engine
            .enqueue(EntityType::Order, "A", MutationKind::Update, json!({"notes": "b"}))
            .await
            .unwrap();

        h.server.hold_next();
        let engine = h.engine.clone();
        let pass = tokio::spawn(async move { engine.sync_now().await });
        h.server.entered().await;

        // Nothing new enqueued: these must not start or schedule another pass
        for _ in 0..5 {
            h.engine.trigger_sync();
        }
        tokio::task::yield_now().await;
        h.server.release();

        let report = pass.await.unwrap().unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(writes(&h.server), 1);
    }

    #[tokio::test]
    async fn test_sync_request_during_drain_is_coalesced() {
        let h = harness_with(single_attempt()).await;
        fetched(&h, "A", json!({"notes": "a"})).await;
        h.engine
            .enqueue(EntityType::Order, "A", MutationKind::Update, json!({"notes": "b"}))
            .await
            .unwrap();

        h.server.fail_next(TransportError::Network("reset".to_string()));
        h.server.hold_next();
        let engine = h.engine.clone();
        let pass = tokio::spawn(async move { engine.sync_now().await });
        h.server.entered().await;

        // Nothing new enqueued: answered at once, no second pass
        let report = h.engine.sync_now().await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.deferred, 1);

        h.server.release();
        let report = pass.await.unwrap().unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(writes(&h.server), 1);
    }

    #[tokio::test]
    async fn test_trigger_on_empty_queue_is_idempotent() {
        let h = harness().await;
        fetched(&h, "A", json!({"notes": "a"})).await;
        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let sink = seen.clone();
        let _subscription = h.engine.subscribe(move |id, status| {
            sink.lock().push((id.to_string(), status));
        });
        let progress = h.engine.status().watch_progress();

        h.engine.trigger_sync();
        h.engine.trigger_sync();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let report = h.engine.sync_now().await.unwrap();

        assert_eq!(report.processed, 0);
        assert_eq!(report.deferred, 0);
        assert!(h.server.calls().is_empty());
        assert!(seen.lock().is_empty());
        assert!(!progress.has_changed().unwrap());
        assert_eq!(h.engine.status().get("A"), Some(SyncStatus::Synced));
    }

    #[tokio::test]
    async fn test_restart_mid_drain_keeps_only_unacknowledged() {
        let dir = tempfile::TempDir::new().unwrap();
        let options = SqliteConnectOptions::new()
            .filename(dir.path().join("sync.db"))
            .create_if_missing(true);

        {
            let pool = SqlitePoolOptions::new()
                .connect_with(options.clone())
                .await
                .unwrap();
            let clock = ManualClock::auto_advance(Utc::now());
            let h = harness_on(pool.clone(), EngineConfig::default(), clock).await;
            fetched(&h, "A", json!({"notes": "a"})).await;
            fetched(&h, "B", json!({"notes": "a"})).await;
            for id in ["A", "B"] {
                h.engine
                    .enqueue(EntityType::Order, id, MutationKind::Update, json!({"notes": "b"}))
                    .await
                    .unwrap();
            }

            // A goes through; B's request never comes back
            h.server.hold_after(1);
            let engine = h.engine.clone();
            let pass = tokio::spawn(async move { engine.sync_now().await });
            h.server.entered().await;
            assert_eq!(h.engine.status().get("A"), Some(SyncStatus::Synced));

            pass.abort();
            let _ = pass.await;
            drop(h);
            pool.close().await;
        }

        let pool = SqlitePoolOptions::new().connect_with(options).await.unwrap();
        let clock = ManualClock::auto_advance(Utc::now());
        let h = harness_on(pool, EngineConfig::default(), clock).await;

        let pending = h.engine.queue().pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entity_id, "B");
        assert_eq!(pending[0].payload, Some(json!({"notes": "b"})));
        assert_eq!(h.engine.status().get("B"), Some(SyncStatus::PendingUpdate));
        assert_eq!(h.engine.status().get("A"), None);

        h.server.seed("B", 1, json!({"notes": "a"}));
        let report = h.engine.sync_now().await.unwrap();
        assert_eq!(report.synced, 1);
        assert!(h.engine.queue().is_empty().await);
    }

    #[tokio::test]
    async fn test_edit_during_pass_schedules_one_rerun() {
        let h = harness().await;
        fetched(&h, "A", json!({"notes": "a"})).await;
        h.engine
            .enqueue(EntityType::Order, "A", MutationKind::Update, json!({"notes": "b"}))
            .await
            .unwrap();

        h.server.hold_next();
        let engine = h.engine.clone();
        let pass = tokio::spawn(async move { engine.sync_now().await });
        h.server.entered().await;

        h.engine
            .enqueue(EntityType::Order, "A", MutationKind::Update, json!({"notes": "c"}))
            .await
            .unwrap();
        h.engine.trigger_sync();
        h.engine.trigger_sync();
        // Let the spawned triggers observe the running drain
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        h.server.release();

        let report = pass.await.unwrap().unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(h.server.get("A").unwrap().data, json!({"notes": "c"}));
        assert_eq!(h.engine.status().get("A"), Some(SyncStatus::Synced));
        assert!(h.engine.queue().is_empty().await);
    }

    #[tokio::test]
    async fn test_server_deletion_against_local_edit_conflicts() {
        let h = harness().await;
        fetched(&h, "A", json!({"notes": "a"})).await;
        h.engine
            .enqueue(EntityType::Order, "A", MutationKind::Update, json!({"notes": "b"}))
            .await
            .unwrap();
        h.server.remove("A");

        let report = h.engine.sync_now().await.unwrap();

        assert_eq!(report.conflicts, 1);
        let details = h.engine.get_conflict("A").unwrap();
        assert_eq!(details.server_entity, Value::Null);

        h.engine.resolve_conflict("A", Resolution::Local).await.unwrap();
        h.engine.sync_now().await.unwrap();
        assert_eq!(h.engine.status().get("order-1"), Some(SyncStatus::Synced));
        assert_eq!(h.server.get("order-1").unwrap().data, json!({"notes": "b"}));
    }
}
