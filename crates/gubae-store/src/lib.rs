//! # gubae-store
//!
//! Durable storage for gubae conversations and messages, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for every domain model.
//! Message records are append-only; the only mutable message state lives in
//! the overlay tables (edits, soft-deletes, reactions).

pub mod conversations;
pub mod database;
pub mod members;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod overlay;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
