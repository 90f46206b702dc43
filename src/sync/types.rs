//! Sync data types
//!
//! Defines types for offline-first synchronization including:
//! - Pending mutations with version tracking
//! - Per-entity sync status and drain progress
//! - Conflict details and resolutions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Prefix for ids assigned locally before the server acknowledges a create
pub const TEMP_ID_PREFIX: &str = "PENDING-";

/// Helpers for temporary (not yet acknowledged) entity ids
pub struct TempId;

impl TempId {
    /// Generate a fresh temporary id
    pub fn generate() -> String {
        format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4())
    }

    /// Whether an id was assigned locally and never acknowledged
    pub fn is_temporary(id: &str) -> bool {
        id.starts_with(TEMP_ID_PREFIX)
    }
}

/// Types of entities that can be synced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Order,
    OrderItem,
    Customer,
    Product,
}

impl EntityType {
    /// Stable name used in persisted records
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Order => "order",
            EntityType::OrderItem => "order_item",
            EntityType::Customer => "customer",
            EntityType::Product => "product",
        }
    }

    /// REST collection the transport addresses this type under
    pub fn collection(&self) -> &'static str {
        match self {
            EntityType::Order => "orders",
            EntityType::OrderItem => "order-items",
            EntityType::Customer => "customers",
            EntityType::Product => "products",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "order" => Some(EntityType::Order),
            "order_item" => Some(EntityType::OrderItem),
            "customer" => Some(EntityType::Customer),
            "product" => Some(EntityType::Product),
            _ => None,
        }
    }
}

/// Types of queued mutations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Create => "create",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(MutationKind::Create),
            "update" => Some(MutationKind::Update),
            "delete" => Some(MutationKind::Delete),
            _ => None,
        }
    }

    /// Status an entity shows while a mutation of this kind is queued
    pub fn pending_status(&self) -> SyncStatus {
        match self {
            MutationKind::Create => SyncStatus::PendingCreate,
            MutationKind::Update => SyncStatus::PendingUpdate,
            MutationKind::Delete => SyncStatus::PendingDelete,
        }
    }
}

/// A local mutation waiting for server acknowledgment
///
/// At most one exists per entity id; later edits squash into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    /// Unique record ID
    pub id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub kind: MutationKind,
    /// Full local value of the entity (absent for deletes)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Server version this mutation was made against (absent for creates)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_version: Option<u64>,
    pub attempts: u32,
    /// Original enqueue time; squashing never moves it
    pub created_at: DateTime<Utc>,
    /// Bumped on every squash so in-flight acks can tell if they went stale
    #[serde(default)]
    pub revision: u64,
    /// Skip the version check on the next send (local-wins resolution)
    #[serde(default)]
    pub force: bool,
    /// Rejected by the server with nothing to fall back to; skipped until edited
    #[serde(default)]
    pub fatal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl PendingMutation {
    pub fn new(
        entity_type: EntityType,
        entity_id: &str,
        kind: MutationKind,
        payload: Option<Value>,
        base_version: Option<u64>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_type,
            entity_id: entity_id.to_string(),
            kind,
            payload,
            base_version,
            attempts: 0,
            created_at: now,
            revision: 0,
            force: false,
            fatal: false,
            next_retry_at: None,
        }
    }
}

/// Last value both client and server agreed on; the three-way diff base
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub version: u64,
    pub data: Value,
    pub updated_at: DateTime<Utc>,
}

/// An entity as the server currently holds it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEntity {
    pub id: String,
    pub version: u64,
    pub data: Value,
}

/// Sync state of a single entity as seen by external consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    PendingCreate,
    PendingUpdate,
    PendingDelete,
    Conflict,
}

/// Progress of the drain pass currently in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncProgress {
    pub processed: usize,
    pub total: usize,
}

/// A true three-way divergence awaiting a decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDetails {
    /// Base plus the local non-conflicting changes and local conflicting values
    pub local_entity: Value,
    /// Null when the server deleted the entity
    pub server_entity: Value,
    pub conflicting_fields: Vec<String>,
}

/// How to resolve a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Keep the local version, overwriting the server once
    Local,
    /// Keep the server version
    Server,
    /// Combine both sides by field authority
    Merge,
}

/// Outcome summary of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub processed: usize,
    pub synced: usize,
    pub conflicts: usize,
    pub failed: usize,
    /// Entities left in the queue for a later pass
    pub deferred: usize,
}
