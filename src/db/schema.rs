//! Database schema and migrations for Nimbus.
//!
//! Migrations are applied in order when the database is opened. The
//! `schema_version` table records which ones have run.

/// Database migrations.
pub const MIGRATIONS: &[&str] = &[
    // v1: storage policies and users
    r#"
-- Storage policies select a backend and its path/name generation rules
CREATE TABLE policies (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    name                  TEXT NOT NULL,
    policy_type           TEXT NOT NULL,                 -- 'local', 'memory'
    base_path             TEXT NOT NULL DEFAULT '',
    dir_name_rule         TEXT NOT NULL DEFAULT 'uploads/{uid}/{path}',
    file_name_rule        TEXT NOT NULL DEFAULT '{randomkey8}_{originname}',
    max_size              INTEGER NOT NULL DEFAULT 0,    -- 0 = unlimited
    allowed_extensions    TEXT NOT NULL DEFAULT '',      -- comma separated, '' = any
    chunk_size            INTEGER NOT NULL DEFAULT 0,
    origin_link           INTEGER NOT NULL DEFAULT 0,
    listable              INTEGER NOT NULL DEFAULT 0,
    thumb_needed          INTEGER NOT NULL DEFAULT 1,
    placeholder_with_size INTEGER NOT NULL DEFAULT 0,
    thumb_width           INTEGER,
    thumb_height          INTEGER,
    created_at            TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Users own files; storage is the quota ledger counter
CREATE TABLE users (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    username    TEXT NOT NULL UNIQUE,
    policy_id   INTEGER NOT NULL REFERENCES policies(id),
    capacity    INTEGER NOT NULL DEFAULT 0,              -- bytes
    storage     INTEGER NOT NULL DEFAULT 0,              -- bytes in use
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);
"#,
    // v2: folder hierarchy
    r#"
CREATE TABLE folders (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    owner_id    INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    parent_id   INTEGER REFERENCES folders(id) ON DELETE CASCADE,  -- NULL for root
    created_at  TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at  TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (parent_id, name)
);

CREATE INDEX idx_folders_owner ON folders(owner_id);
CREATE UNIQUE INDEX idx_folders_root ON folders(owner_id) WHERE parent_id IS NULL;
"#,
    // v3: file records
    r#"
CREATE TABLE files (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    name               TEXT NOT NULL,
    user_id            INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    folder_id          INTEGER NOT NULL REFERENCES folders(id),
    source_name        TEXT NOT NULL,                    -- physical key
    size               INTEGER NOT NULL DEFAULT 0,
    policy_id          INTEGER NOT NULL REFERENCES policies(id),
    upload_session_id  TEXT UNIQUE,                      -- set while a placeholder
    pic_info           TEXT NOT NULL DEFAULT '',
    metadata           TEXT NOT NULL DEFAULT '{}',       -- JSON object
    created_at         TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at         TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (folder_id, name)
);

CREATE INDEX idx_files_user ON files(user_id);
CREATE INDEX idx_files_source ON files(policy_id, source_name);
"#,
    // v4: share records pointing at files or folders
    r#"
CREATE TABLE shares (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    source_id   INTEGER NOT NULL,
    is_dir      INTEGER NOT NULL DEFAULT 0,
    views       INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX idx_shares_source ON shares(source_id, is_dir);
"#,
];
