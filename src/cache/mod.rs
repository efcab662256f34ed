//! Named response caches for offline support.
//!
//! This module provides the worker's equivalent of the browser Cache API:
//! - Caches are addressed by generation-tagged names (`static-cache-v1`)
//! - Entries are keyed by the normalized request (method + URL)
//! - Only GET requests are ever stored
//! - Writes replace the whole entry, so concurrent handlers never see a
//!   partially updated response

mod storage;
mod traits;

pub use storage::SqliteStorage;
pub use traits::{CacheKind, CacheNames, CacheStore, CachedResponse, EntryInfo};
