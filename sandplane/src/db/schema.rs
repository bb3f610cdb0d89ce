//! SQL schema.

pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA_VERSION_TABLE: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
";

/// Sandbox records: JSON blob plus queryable columns.
const SANDBOXES_TABLE: &str = "
CREATE TABLE IF NOT EXISTS sandboxes (
    key TEXT PRIMARY KEY,
    team_id TEXT NOT NULL,
    sandbox_id TEXT NOT NULL,
    state TEXT NOT NULL,
    data TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sandboxes_team ON sandboxes(team_id);
";

/// Ephemeral markers and locks. `expires_at` is unix time in milliseconds.
const EPHEMERAL_TABLES: &str = "
CREATE TABLE IF NOT EXISTS markers (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS locks (
    key TEXT PRIMARY KEY,
    token TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
";

const TEMPLATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS templates (
    id TEXT PRIMARY KEY,
    team_id TEXT NOT NULL,
    source_sandbox_id TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS builds (
    id TEXT PRIMARY KEY,
    team_id TEXT NOT NULL,
    sandbox_id TEXT NOT NULL,
    base_template_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    status TEXT NOT NULL,
    reason TEXT,
    created_at TEXT NOT NULL,
    finished_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_builds_sandbox ON builds(sandbox_id);
CREATE TABLE IF NOT EXISTS template_builds (
    template_id TEXT NOT NULL REFERENCES templates(id) ON DELETE CASCADE,
    build_id TEXT NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
    tag TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (template_id, build_id)
);
CREATE TABLE IF NOT EXISTS aliases (
    namespace TEXT NOT NULL,
    alias TEXT NOT NULL,
    template_id TEXT NOT NULL REFERENCES templates(id) ON DELETE CASCADE,
    PRIMARY KEY (namespace, alias)
);
";

pub fn all_schemas() -> [&'static str; 4] {
    [
        SCHEMA_VERSION_TABLE,
        SANDBOXES_TABLE,
        EPHEMERAL_TABLES,
        TEMPLATE_TABLES,
    ]
}
