//! Offline-first synchronization
//!
//! Provides:
//! - A durable per-entity mutation queue that squashes repeated edits
//! - Version-checked replay against the remote backend
//! - Three-way conflict detection and user-driven resolution
//! - A subscribable status feed and connectivity monitor
//!
//! # Sync Cycle
//!
//! 1. Local edits go through `SyncEngine::enqueue` (or `create` for new entities)
//! 2. A reconnect or manual trigger starts a drain pass
//! 3. Each pending mutation is sent with the server version it was made against
//! 4. On version mismatch the server value is fetched and diffed three ways
//! 5. Disjoint changes are merged and resubmitted; true divergence is parked
//! 6. Parked entities wait for `SyncEngine::resolve_conflict`
//!
//! # Conflict Resolution
//!
//! - `Local`: the local value overwrites the server once
//! - `Server`: the local mutation is discarded
//! - `Merge`: conflicting fields are settled by a field-authority table

mod clock;
mod conflict;
mod connectivity;
mod engine;
mod error;
mod queue;
mod resolver;
mod retry;
mod status;
mod store;
mod transport;
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use clock::{Clock, SystemClock};
pub use conflict::{ConflictDetector, Detection, FieldAuthority, MergePolicy};
pub use connectivity::{
    ConnectivityEvent, ConnectivityMonitor, ConnectivityState, MonitorConfig,
    DEFAULT_RECONNECT_DEBOUNCE, DEFAULT_WAS_OFFLINE_WINDOW,
};
pub use engine::{EngineConfig, SyncEngine, DEFAULT_REQUEST_TIMEOUT};
pub use error::{QueueError, ResolveError, Result, SyncError, TransportError};
pub use queue::{CreateAck, MutationQueue, Settlement, DEFAULT_COMPACT_EVERY};
pub use retry::RetryPolicy;
pub use status::{Subscription, SyncStatusStore};
pub use store::init_schema;
pub use transport::{HttpTransport, SyncTransport};
pub use types::{
    ConflictDetails, DrainReport, EntityType, MutationKind, PendingMutation, Resolution,
    ServerEntity, Snapshot, SyncProgress, SyncStatus, TempId, TEMP_ID_PREFIX,
};
