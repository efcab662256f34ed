/// Schema for the worker database.
///
/// One file holds the named response caches, the background sync queue and
/// the key/value store backing analytics.
pub const SCHEMA: &str = r#"
-- Named caches (one row per generation-tagged name)
CREATE TABLE IF NOT EXISTS caches (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Cached responses, keyed by a hash of the normalized request
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    entry_hash TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    size INTEGER NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (cache_name, entry_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_age
    ON cache_entries(cache_name, cached_at);

-- Deferred writes waiting for a sync event
CREATE TABLE IF NOT EXISTS sync_queue (
    id TEXT PRIMARY KEY,
    endpoint TEXT NOT NULL,
    data TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Durable key/value storage (analytics buffer, privacy preferences, session)
CREATE TABLE IF NOT EXISTS local_storage (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;
