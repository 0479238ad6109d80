//! # quickchat-store
//!
//! Durable message storage for QuickChat, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides the three message operations the
//! delivery path needs: append, pairwise history and seen-marking.

pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
