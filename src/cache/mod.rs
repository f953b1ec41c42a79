//! Generic caching layer for request interception and offline support.
//!
//! This module provides:
//! - A registry of named, persistent response stores (SQLite-backed)
//! - Request identities keyed by method + normalized URL
//! - Cache-first, network-first and stale-while-revalidate strategies
//! - Basic offline mode (serve the stored copy when the network is unavailable)

mod layer;
mod storage;
mod types;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, GenerationStorage, SqliteStorage, StoreHandle, TaskStorage};
pub use types::{CacheResult, CacheSource, RequestIdentity, ResponseSnapshot};
