//! Configuration management for the order sync service

use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::sync::{EngineConfig, MergePolicy, MonitorConfig, RetryPolicy};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Base URL of the order backend
    pub remote_url: String,
    pub request_timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub compact_every: u64,
    pub reconnect_debounce_ms: u64,
    pub was_offline_secs: u64,
    /// Fields where the server wins a merge
    pub server_fields: Vec<String>,
    /// Fields where the local edit wins a merge
    pub local_fields: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            database: DatabaseConfig {
                url: "sqlite:./order-sync.db".to_string(),
            },
            sync: SyncConfig::default(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            remote_url: "http://localhost:8080/api".to_string(),
            request_timeout_ms: 15_000,
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
            compact_every: 64,
            reconnect_debounce_ms: 2_000,
            was_offline_secs: 10,
            server_fields: to_fields("status,total,subtotal,tax"),
            local_fields: to_fields("notes,description"),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        let defaults = SyncConfig::default();

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: parse_var("SERVER_PORT", 3000),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:./order-sync.db".to_string()),
            },
            sync: SyncConfig {
                remote_url: env::var("SYNC_REMOTE_URL")?,
                request_timeout_ms: parse_var("SYNC_REQUEST_TIMEOUT_MS", defaults.request_timeout_ms),
                max_attempts: parse_var("SYNC_MAX_ATTEMPTS", defaults.max_attempts),
                backoff_base_ms: parse_var("SYNC_BACKOFF_BASE_MS", defaults.backoff_base_ms),
                backoff_cap_ms: parse_var("SYNC_BACKOFF_CAP_MS", defaults.backoff_cap_ms),
                compact_every: parse_var("SYNC_COMPACT_EVERY", defaults.compact_every),
                reconnect_debounce_ms: parse_var(
                    "SYNC_RECONNECT_DEBOUNCE_MS",
                    defaults.reconnect_debounce_ms,
                ),
                was_offline_secs: parse_var("SYNC_WAS_OFFLINE_SECS", defaults.was_offline_secs),
                server_fields: env::var("SYNC_SERVER_FIELDS")
                    .map(|v| to_fields(&v))
                    .unwrap_or(defaults.server_fields),
                local_fields: env::var("SYNC_LOCAL_FIELDS")
                    .map(|v| to_fields(&v))
                    .unwrap_or(defaults.local_fields),
            },
        })
    }
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn merge_policy(&self) -> MergePolicy {
        MergePolicy::from_lists(self.server_fields.as_slice(), self.local_fields.as_slice())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            retry: RetryPolicy {
                base: Duration::from_millis(self.backoff_base_ms),
                cap: Duration::from_millis(self.backoff_cap_ms),
                max_attempts: self.max_attempts.max(1),
            },
            request_timeout: self.request_timeout(),
            compact_every: self.compact_every,
            merge_policy: self.merge_policy(),
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            reconnect_debounce: Duration::from_millis(self.reconnect_debounce_ms),
            was_offline_window: Duration::from_secs(self.was_offline_secs),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn to_fields(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .map(str::to_string)
        .collect()
}
