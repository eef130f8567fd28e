//! # Backlog Persistence
//!
//! Durable record store for the backlog queue engine, backed by SQLite.
//!
//! The adapter opens a handle to a named collection (one table per
//! collection) and caches it for the store's lifetime; the engine in
//! `backlog-queue` works against the `RecordStore` trait and never sees
//! the SQL.

pub mod sqlite;

pub use sqlite::{connect, SqliteConfig, SqliteRecordStore};
