//! # crewsync-store
//!
//! Durable client-side state for warm start: the last-known session
//! (identity plus permission set) and the bearer credential. Nothing in
//! here is authoritative; a fresh answer from the authorization service
//! always wins over the cached copy.

pub mod database;
pub mod migrations;
pub mod session;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use session::CachedSession;
