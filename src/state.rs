//! Application state management

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::sync::SyncEngine;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    db: SqlitePool,
    engine: SyncEngine,
}

impl AppState {
    pub fn new(config: Config, db: SqlitePool, engine: SyncEngine) -> Self {
        Self {
            inner: Arc::new(AppStateInner { config, db, engine }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the database pool
    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    /// Get the sync engine
    pub fn engine(&self) -> &SyncEngine {
        &self.inner.engine
    }
}
