//! Conflict resolution
//!
//! Applies a user's decision to an entity parked in conflict and returns it
//! to the normal queue flow.

use std::sync::Arc;

use serde_json::Value;
use sqlx::SqlitePool;

use super::clock::Clock;
use super::conflict::{ConflictRecord, ConflictStore, FieldAuthority, MergePolicy};
use super::error::ResolveError;
use super::queue::MutationQueue;
use super::status::SyncStatusStore;
use super::store::SnapshotRepository;
use super::types::{MutationKind, PendingMutation, Resolution, ServerEntity, SyncStatus};

#[derive(Clone)]
pub struct ConflictResolver {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    queue: MutationQueue,
    status: SyncStatusStore,
    conflicts: ConflictStore,
    policy: MergePolicy,
}

impl ConflictResolver {
    pub fn new(
        pool: SqlitePool,
        clock: Arc<dyn Clock>,
        queue: MutationQueue,
        status: SyncStatusStore,
        conflicts: ConflictStore,
        policy: MergePolicy,
    ) -> Self {
        Self {
            pool,
            clock,
            queue,
            status,
            conflicts,
            policy,
        }
    }

    /// Resolve a parked entity
    ///
    /// The entity leaves `conflict` only after its queue record, snapshot and
    /// cache reflect the decision.
    pub async fn resolve(&self, entity_id: &str, resolution: Resolution) -> Result<(), ResolveError> {
        let record = self
            .conflicts
            .get(entity_id)
            .ok_or_else(|| ResolveError::NotInConflict(entity_id.to_string()))?;

        let next_status = match (resolution, record.server_version) {
            (Resolution::Server, _) => self.take_server(entity_id, &record).await?,
            // Nothing left on the server to merge with; re-create from local
            (Resolution::Local | Resolution::Merge, None) => self.recreate(entity_id, &record).await?,
            (Resolution::Local, Some(version)) => self.take_local(entity_id, &record, version).await?,
            (Resolution::Merge, Some(version)) => self.merge(entity_id, &record, version).await?,
        };

        self.conflicts.take(entity_id);
        self.status.clear_error(entity_id);
        match next_status {
            Some(status) => self.status.set(entity_id, status),
            None => self.status.remove(entity_id),
        }

        tracing::info!(
            entity_id = %entity_id,
            resolution = ?resolution,
            fields = ?record.details.conflicting_fields,
            "Conflict resolved"
        );

        Ok(())
    }

    /// Discard the local mutation and adopt the server's value
    async fn take_server(
        &self,
        entity_id: &str,
        record: &ConflictRecord,
    ) -> Result<Option<SyncStatus>, ResolveError> {
        self.queue.remove(entity_id).await?;
        let repo = SnapshotRepository::new(&self.pool);

        let Some(version) = record.server_version else {
            repo.forget(entity_id).await?;
            return Ok(None);
        };

        let server = self.server_entity(entity_id, record, version);
        let now = self.clock.now();
        repo.put(record.entity_type, &server, now).await?;
        repo.cache(record.entity_type, entity_id, &server.data, now)
            .await?;
        Ok(Some(SyncStatus::Synced))
    }

    /// Keep the local value and overwrite the server once
    async fn take_local(
        &self,
        entity_id: &str,
        record: &ConflictRecord,
        version: u64,
    ) -> Result<Option<SyncStatus>, ResolveError> {
        if record.kind == MutationKind::Delete {
            self.requeue(entity_id, |m| {
                m.force = true;
                m.base_version = Some(version);
            })
            .await?;
            return Ok(Some(SyncStatus::PendingDelete));
        }

        // Local values for the conflicting fields; the server's disjoint
        // edits survive through the clean merge
        let payload = MergePolicy::new(FieldAuthority::Local).apply(
            &record.merged,
            &record.details.local_entity,
            &record.details.server_entity,
            &record.details.conflicting_fields,
        );
        self.adopt_server_base(entity_id, record, version, &payload)
            .await?;
        self.requeue(entity_id, |m| {
            m.kind = MutationKind::Update;
            m.payload = Some(payload);
            m.base_version = Some(version);
            m.force = true;
        })
        .await?;
        Ok(Some(SyncStatus::PendingUpdate))
    }

    /// Settle conflicting fields by authority and resubmit as an update
    async fn merge(
        &self,
        entity_id: &str,
        record: &ConflictRecord,
        version: u64,
    ) -> Result<Option<SyncStatus>, ResolveError> {
        if record.kind == MutationKind::Delete {
            // Re-issue the delete against what the server now holds
            self.adopt_server_base(entity_id, record, version, &record.details.server_entity)
                .await?;
            self.requeue(entity_id, |m| {
                m.force = false;
                m.base_version = Some(version);
            })
            .await?;
            return Ok(Some(SyncStatus::PendingDelete));
        }

        let payload = self.policy.apply(
            &record.merged,
            &record.details.local_entity,
            &record.details.server_entity,
            &record.details.conflicting_fields,
        );
        self.adopt_server_base(entity_id, record, version, &payload)
            .await?;
        self.requeue(entity_id, |m| {
            m.kind = MutationKind::Update;
            m.payload = Some(payload);
            m.base_version = Some(version);
            m.force = false;
        })
        .await?;
        Ok(Some(SyncStatus::PendingUpdate))
    }

    /// The server deleted the entity while it had local edits
    async fn recreate(
        &self,
        entity_id: &str,
        record: &ConflictRecord,
    ) -> Result<Option<SyncStatus>, ResolveError> {
        let payload = record.details.local_entity.clone();
        let repo = SnapshotRepository::new(&self.pool);
        repo.delete(entity_id).await?;
        repo.cache(record.entity_type, entity_id, &payload, self.clock.now())
            .await?;

        self.requeue(entity_id, |m| {
            m.kind = MutationKind::Create;
            m.payload = Some(payload);
            m.base_version = None;
            m.force = false;
        })
        .await?;
        Ok(Some(SyncStatus::PendingCreate))
    }

    /// The server value becomes the diff base; the cache shows the outcome
    async fn adopt_server_base(
        &self,
        entity_id: &str,
        record: &ConflictRecord,
        version: u64,
        cached: &Value,
    ) -> Result<(), ResolveError> {
        let repo = SnapshotRepository::new(&self.pool);
        let now = self.clock.now();
        let server = self.server_entity(entity_id, record, version);
        repo.put(record.entity_type, &server, now).await?;
        repo.cache(record.entity_type, entity_id, cached, now).await?;
        Ok(())
    }

    async fn requeue<F>(&self, entity_id: &str, change: F) -> Result<(), ResolveError>
    where
        F: FnOnce(&mut PendingMutation),
    {
        self.queue
            .modify(entity_id, |m| {
                change(m);
                m.attempts = 0;
                m.next_retry_at = None;
                m.fatal = false;
            })
            .await?;
        Ok(())
    }

    fn server_entity(&self, entity_id: &str, record: &ConflictRecord, version: u64) -> ServerEntity {
        ServerEntity {
            id: entity_id.to_string(),
            version,
            data: record.details.server_entity.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::ManualClock;
    use crate::sync::queue::DEFAULT_COMPACT_EVERY;
    use crate::sync::store::tests::setup_test_db;
    use crate::sync::types::{ConflictDetails, EntityType};
    use chrono::Utc;
    use serde_json::json;

    struct Fixture {
        pool: SqlitePool,
        queue: MutationQueue,
        status: SyncStatusStore,
        conflicts: ConflictStore,
        resolver: ConflictResolver,
    }

    /// Entity "A" at version 1, a local update queued, parked against version 2
    async fn parked(kind: MutationKind) -> Fixture {
        let pool = setup_test_db().await;
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::auto_advance(Utc::now()));
        let status = SyncStatusStore::new();
        let conflicts = ConflictStore::new();
        let queue = MutationQueue::open(
            pool.clone(),
            clock.clone(),
            status.clone(),
            conflicts.clone(),
            DEFAULT_COMPACT_EVERY,
        )
        .await
        .unwrap();

        let base = json!({"status": "open", "notes": "a", "tax": 1});
        SnapshotRepository::new(&pool)
            .put(
                EntityType::Order,
                &ServerEntity {
                    id: "A".to_string(),
                    version: 1,
                    data: base,
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let local = json!({"status": "void", "notes": "b", "tax": 1});
        let payload = if kind == MutationKind::Delete { Value::Null } else { local.clone() };
        queue.enqueue(EntityType::Order, "A", kind, payload).await.unwrap();

        let server = json!({"status": "closed", "notes": "c", "tax": 2});
        conflicts.insert(
            "A",
            ConflictRecord {
                entity_type: EntityType::Order,
                kind,
                details: ConflictDetails {
                    local_entity: local,
                    server_entity: server.clone(),
                    conflicting_fields: vec!["notes".to_string(), "status".to_string()],
                },
                merged: server,
                server_version: Some(2),
            },
        );
        status.set("A", SyncStatus::Conflict);

        let resolver = ConflictResolver::new(
            pool.clone(),
            clock,
            queue.clone(),
            status.clone(),
            conflicts.clone(),
            MergePolicy::default(),
        );

        Fixture {
            pool,
            queue,
            status,
            conflicts,
            resolver,
        }
    }

    #[tokio::test]
    async fn test_not_in_conflict() {
        let f = parked(MutationKind::Update).await;

        let err = f.resolver.resolve("B", Resolution::Local).await.unwrap_err();
        assert!(matches!(err, ResolveError::NotInConflict(id) if id == "B"));
    }

    #[tokio::test]
    async fn test_server_wins() {
        let f = parked(MutationKind::Update).await;

        f.resolver.resolve("A", Resolution::Server).await.unwrap();

        assert!(f.queue.get("A").await.is_none());
        assert!(!f.conflicts.contains("A"));
        assert_eq!(f.status.get("A"), Some(SyncStatus::Synced));

        let repo = SnapshotRepository::new(&f.pool);
        let snapshot = repo.get("A").await.unwrap().unwrap();
        assert_eq!(snapshot.version, 2);
        assert_eq!(repo.cached("A").await.unwrap().unwrap()["notes"], "c");
    }

    #[tokio::test]
    async fn test_local_wins_forces_once() {
        let f = parked(MutationKind::Update).await;

        f.resolver.resolve("A", Resolution::Local).await.unwrap();

        let mutation = f.queue.get("A").await.unwrap();
        assert!(mutation.force);
        assert_eq!(mutation.base_version, Some(2));
        assert_eq!(
            mutation.payload,
            Some(json!({"status": "void", "notes": "b", "tax": 2}))
        );
        assert_eq!(f.status.get("A"), Some(SyncStatus::PendingUpdate));
    }

    #[tokio::test]
    async fn test_merge_uses_field_authority() {
        let f = parked(MutationKind::Update).await;

        f.resolver.resolve("A", Resolution::Merge).await.unwrap();

        let mutation = f.queue.get("A").await.unwrap();
        assert!(!mutation.force);
        assert_eq!(mutation.kind, MutationKind::Update);
        assert_eq!(mutation.base_version, Some(2));
        assert_eq!(
            mutation.payload,
            Some(json!({"status": "closed", "notes": "b", "tax": 2}))
        );
        assert_eq!(f.status.get("A"), Some(SyncStatus::PendingUpdate));

        // Resolved entities accept edits again
        f.queue
            .enqueue(EntityType::Order, "A", MutationKind::Update, json!({"notes": "d"}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_local_delete_keeps_delete() {
        let f = parked(MutationKind::Delete).await;

        f.resolver.resolve("A", Resolution::Local).await.unwrap();

        let mutation = f.queue.get("A").await.unwrap();
        assert_eq!(mutation.kind, MutationKind::Delete);
        assert!(mutation.force);
        assert_eq!(f.status.get("A"), Some(SyncStatus::PendingDelete));
    }

    #[tokio::test]
    async fn test_server_deleted_local_wins_recreates() {
        let f = parked(MutationKind::Update).await;
        let mut record = f.conflicts.take("A").unwrap();
        record.server_version = None;
        record.details.server_entity = Value::Null;
        f.conflicts.insert("A", record);

        f.resolver.resolve("A", Resolution::Local).await.unwrap();

        let mutation = f.queue.get("A").await.unwrap();
        assert_eq!(mutation.kind, MutationKind::Create);
        assert_eq!(mutation.base_version, None);
        assert_eq!(f.status.get("A"), Some(SyncStatus::PendingCreate));
        assert!(SnapshotRepository::new(&f.pool).get("A").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_server_deleted_server_wins_forgets() {
        let f = parked(MutationKind::Update).await;
        let mut record = f.conflicts.take("A").unwrap();
        record.server_version = None;
        f.conflicts.insert("A", record);

        f.resolver.resolve("A", Resolution::Server).await.unwrap();

        assert!(f.queue.is_empty().await);
        assert_eq!(f.status.get("A"), None);
        assert!(SnapshotRepository::new(&f.pool).cached("A").await.unwrap().is_none());
    }
}
