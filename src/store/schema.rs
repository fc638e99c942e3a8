/// Ordered schema migrations. `MIGRATIONS[n]` brings the database from
/// version n to n + 1; applied versions are recorded in `schema_version`.
pub const MIGRATIONS: &[&str] = &[V1_INITIAL];

const V1_INITIAL: &str = r#"
-- Tracked upstream repositories
CREATE TABLE IF NOT EXISTS repositories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner TEXT NOT NULL,
    name TEXT NOT NULL,
    url TEXT NOT NULL UNIQUE,
    description TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    is_private INTEGER NOT NULL DEFAULT 0,

    -- Mirror bookkeeping
    local_path TEXT,
    last_cloned TEXT,
    last_updated TEXT,   -- set only when a fetch produced new commits
    last_checked TEXT,   -- set on any successful metadata poll
    error_message TEXT,
    created_at TEXT NOT NULL,

    UNIQUE(owner, name)
);

-- Snapshot files on disk, one row per archive
CREATE TABLE IF NOT EXISTS archives (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    filename TEXT NOT NULL,
    file_path TEXT NOT NULL,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    file_count INTEGER NOT NULL DEFAULT 0,
    is_incremental INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

-- Content digests captured at the last successful snapshot
CREATE TABLE IF NOT EXISTS file_hashes (
    repo_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    path TEXT NOT NULL,
    digest TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    PRIMARY KEY (repo_id, path)
);

-- Key/value settings from a closed allowlist
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_repositories_status ON repositories(status);
CREATE INDEX IF NOT EXISTS idx_archives_repo ON archives(repo_id);
"#;
