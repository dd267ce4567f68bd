//! # dscuss-store
//!
//! Durable storage for a dscuss node, backed by SQLite.
//!
//! [`EntityStore`] holds users, messages and operations in `entities.db`:
//! inserts are idempotent and append-only, and every newly written entity is
//! pushed to the attached observer channels. [`ProfileStore`] holds the
//! owner's moderator set in `profile.db`.

pub mod database;
pub mod history;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod operations;
pub mod profile;
pub mod users;

mod error;

pub use database::{EntityStore, ObserverId};
pub use error::{Result, StoreError};
pub use models::UserHistory;
pub use profile::ProfileStore;
