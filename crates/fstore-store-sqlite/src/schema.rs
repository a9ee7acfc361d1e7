//! SQL schema for the function store.
//!
//! Executed once per writer connection. `PRAGMA user_version` records the
//! layout for future migrations.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- Current state, one row per function name.
CREATE TABLE IF NOT EXISTS functions (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    name           TEXT    NOT NULL UNIQUE,
    code           TEXT    NOT NULL,
    description    TEXT    NOT NULL DEFAULT '',
    description_en TEXT,
    description_jp TEXT,
    tags           TEXT    NOT NULL DEFAULT '[]',   -- JSON array
    dependencies   TEXT    NOT NULL DEFAULT '[]',   -- JSON array
    test_cases     TEXT    NOT NULL DEFAULT '[]',   -- JSON array of {input, expected}
    entry_point    TEXT,
    status         TEXT    NOT NULL DEFAULT 'pending',
    version        INTEGER NOT NULL DEFAULT 1,
    metadata       TEXT    NOT NULL,                -- JSON FunctionMetadata
    call_count     INTEGER NOT NULL DEFAULT 0,
    last_called_at TEXT,
    created_at     TEXT    NOT NULL,
    updated_at     TEXT    NOT NULL
);

-- Superseded versions. Append-only; rows go away only with their function.
CREATE TABLE IF NOT EXISTS function_versions (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    function_id  INTEGER NOT NULL REFERENCES functions(id) ON DELETE CASCADE,
    version      INTEGER NOT NULL,
    code         TEXT    NOT NULL,
    description  TEXT    NOT NULL,
    dependencies TEXT    NOT NULL,
    test_cases   TEXT    NOT NULL,
    saved_at     TEXT    NOT NULL,
    archived_at  TEXT    NOT NULL,
    UNIQUE (function_id, version)
);

CREATE TABLE IF NOT EXISTS embeddings (
    function_id INTEGER NOT NULL REFERENCES functions(id) ON DELETE CASCADE,
    model_name  TEXT    NOT NULL,
    dimension   INTEGER NOT NULL,
    vector      TEXT    NOT NULL,                   -- JSON array of f32
    encoded_at  TEXT    NOT NULL,
    PRIMARY KEY (function_id, model_name)
);

CREATE TABLE IF NOT EXISTS config (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS functions_status_idx  ON functions(status);
CREATE INDEX IF NOT EXISTS functions_updated_idx ON functions(updated_at);
CREATE INDEX IF NOT EXISTS versions_function_idx ON function_versions(function_id);

PRAGMA user_version = 1;
";
