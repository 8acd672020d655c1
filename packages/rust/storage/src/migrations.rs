//! SQL migrations for the DocHarvest database.
//!
//! Applied in order when a database is opened read-write. Each migration
//! records its version in `schema_migrations` as its last statement.

/// A versioned batch of SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: sources, pages, documents, code_examples",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS sources (
    source_id        TEXT PRIMARY KEY,
    title            TEXT,
    summary          TEXT,
    total_word_count INTEGER NOT NULL DEFAULT 0,
    metadata_json    TEXT NOT NULL DEFAULT '{}',
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pages (
    id           TEXT PRIMARY KEY,
    source_id    TEXT NOT NULL REFERENCES sources(source_id) ON DELETE CASCADE,
    url          TEXT NOT NULL,
    title        TEXT,
    full_content TEXT NOT NULL,
    word_count   INTEGER NOT NULL DEFAULT 0,
    chunk_count  INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    UNIQUE(source_id, url)
);

CREATE INDEX IF NOT EXISTS idx_pages_source ON pages(source_id);

CREATE TABLE IF NOT EXISTS documents (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id      TEXT NOT NULL,
    page_id        TEXT NOT NULL REFERENCES pages(id) ON DELETE CASCADE,
    url            TEXT NOT NULL,
    chunk_number   INTEGER NOT NULL,
    content        TEXT NOT NULL,
    metadata_json  TEXT NOT NULL DEFAULT '{}',
    embedding_json TEXT NOT NULL DEFAULT '[]',
    created_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_documents_source ON documents(source_id);
CREATE INDEX IF NOT EXISTS idx_documents_page ON documents(page_id);

CREATE TABLE IF NOT EXISTS code_examples (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id      TEXT NOT NULL,
    url            TEXT NOT NULL,
    chunk_number   INTEGER NOT NULL,
    language       TEXT,
    content        TEXT NOT NULL,
    summary        TEXT NOT NULL,
    metadata_json  TEXT NOT NULL DEFAULT '{}',
    embedding_json TEXT NOT NULL DEFAULT '[]',
    created_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_code_examples_source ON code_examples(source_id, url);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
    ]
}
