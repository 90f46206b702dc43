//! Order Sync
//!
//! Offline-first synchronization engine for the order console, plus the
//! local HTTP surface the console talks to.
//!
//! # Modules
//!
//! - `sync`: Mutation queue, drain engine, conflict detection and resolution
//! - `routes`: axum handlers for status, mutations, triggers and conflicts
//! - `db`: SQLite pool setup

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
pub mod sync;
