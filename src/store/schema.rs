/// Schema for the engine's durable store.
pub const SCHEMA: &str = r#"
-- Named cache buckets; versioned buckets carry the version tag in the name
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    version TEXT NOT NULL,
    max_age_secs INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

-- Cached HTTP responses, keyed by request identity within a partition
CREATE TABLE IF NOT EXISTS http_cache (
    partition TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    content_type TEXT,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (partition, request_key)
);

CREATE INDEX IF NOT EXISTS idx_http_cache_partition ON http_cache(partition);

-- Domain entity snapshots (serialized JSON)
CREATE TABLE IF NOT EXISTS entities (
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (entity_type, entity_id)
);

-- Pending-mutation queue; insertion order preserved via rowid
CREATE TABLE IF NOT EXISTS mutations (
    id TEXT PRIMARY KEY,
    action TEXT NOT NULL,
    payload BLOB NOT NULL,
    created_at TEXT NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0,
    rejected INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);

-- Push subscription records
CREATE TABLE IF NOT EXISTS push_subscriptions (
    endpoint TEXT PRIMARY KEY,
    p256dh TEXT NOT NULL,
    auth TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Engine metadata (active cache version marker)
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;
