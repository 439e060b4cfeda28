use super::SqlStep;

pub const MEMORY_ENTRIES: SqlStep = SqlStep {
    from: 1,
    to: 2,
    name: "memory_entries",
    sql: "
CREATE TABLE IF NOT EXISTS memory_entries (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    channel_id TEXT,
    user_id TEXT,
    continuity_key TEXT,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    embedding BLOB,
    embedding_model TEXT,
    embedding_dimensions INTEGER,
    metadata TEXT DEFAULT '{}',
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_memory_session_created_at
    ON memory_entries(session_id, created_at);

CREATE INDEX IF NOT EXISTS idx_memory_continuity_created_at
    ON memory_entries(continuity_key, created_at);

CREATE INDEX IF NOT EXISTS idx_memory_role
    ON memory_entries(role, created_at);
",
};
