//! libSQL storage layer (offline mode).
//!
//! [`Storage`] wraps a local libSQL database holding sources, pages,
//! embedded document chunks and code examples, and implements
//! [`SourceRepository`] for the crawl pipeline.
//!
//! **Access rules:**
//! - crawl jobs: read-write via [`Storage::open`]
//! - inspection (`docharvest source`): read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database, Row, params};
use tokio::sync::Mutex;
use uuid::Uuid;

use docharvest_shared::{
    CodeExample, DocumentChunk, HarvestError, Metadata, PageRecord, Result, Source, SourceId,
    SourceRepository, SourceUpsert,
};

/// Primary storage handle wrapping a libSQL database.
///
/// One handle is shared by all running jobs. Every write takes `write_lock`,
/// so no statement lands inside another job's open transaction on the shared
/// connection.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    write_lock: Mutex<()>,
}

fn db_err(e: libsql::Error) -> HarvestError {
    HarvestError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HarvestError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
            write_lock: Mutex::new(()),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(HarvestError::Storage(format!(
                "database not found: {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
            write_lock: Mutex::new(()),
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        HarvestError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0,
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(HarvestError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SourceRepository
// ---------------------------------------------------------------------------

#[async_trait]
impl SourceRepository for Storage {
    async fn get_source_by_id(&self, source_id: &SourceId) -> Result<Option<Source>> {
        let mut rows = self
            .conn
            .query(
                "SELECT source_id, title, summary, total_word_count, metadata_json,
                        created_at, updated_at
                 FROM sources WHERE source_id = ?1",
                params![source_id.as_str()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_source(&row)?)),
            None => Ok(None),
        }
    }

    async fn upsert_source(&self, source: &SourceUpsert) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        let metadata = to_json(&source.metadata)?;
        let word_count = source.total_word_count.map(|c| c as i64);

        // json_patch merges the new keys into the stored map (RFC 7396).
        self.conn
            .execute(
                "INSERT INTO sources
                   (source_id, title, summary, total_word_count, metadata_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, COALESCE(?4, 0), ?5, ?6, ?6)
                 ON CONFLICT(source_id) DO UPDATE SET
                   title = COALESCE(excluded.title, sources.title),
                   summary = COALESCE(excluded.summary, sources.summary),
                   total_word_count = COALESCE(?4, sources.total_word_count),
                   metadata_json = json_patch(COALESCE(sources.metadata_json, '{}'), excluded.metadata_json),
                   updated_at = excluded.updated_at",
                params![
                    source.source_id.as_str(),
                    source.title.as_deref(),
                    source.summary.as_deref(),
                    word_count,
                    metadata.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn update_source_metadata(&self, source_id: &SourceId, patch: &Metadata) -> Result<bool> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        let patch = to_json(patch)?;

        let changed = self
            .conn
            .execute(
                "UPDATE sources
                 SET metadata_json = json_patch(COALESCE(metadata_json, '{}'), ?1),
                     updated_at = ?2
                 WHERE source_id = ?3",
                params![patch.as_str(), now.as_str(), source_id.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    async fn get_page_count_by_source(&self, source_id: &SourceId) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM pages WHERE source_id = ?1",
                params![source_id.as_str()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(db_err)?.max(0) as u64),
            None => Ok(0),
        }
    }

    async fn upsert_page(&self, page: &PageRecord) -> Result<String> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();

        let tx = self.conn.transaction().await.map_err(db_err)?;

        let existing = {
            let mut rows = tx
                .query(
                    "SELECT id FROM pages WHERE source_id = ?1 AND url = ?2",
                    params![page.source_id.as_str(), page.url.as_str()],
                )
                .await
                .map_err(db_err)?;
            match rows.next().await.map_err(db_err)? {
                Some(row) => Some(row.get::<String>(0).map_err(db_err)?),
                None => None,
            }
        };

        let page_id = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE pages SET title = ?1, full_content = ?2, word_count = ?3,
                            chunk_count = ?4, updated_at = ?5
                     WHERE id = ?6",
                    params![
                        page.title.as_deref(),
                        page.full_content.as_str(),
                        page.word_count as i64,
                        i64::from(page.chunk_count),
                        now.as_str(),
                        id.as_str(),
                    ],
                )
                .await
                .map_err(db_err)?;
                tx.execute("DELETE FROM documents WHERE page_id = ?1", params![id.as_str()])
                    .await
                    .map_err(db_err)?;
                tx.execute(
                    "DELETE FROM code_examples WHERE source_id = ?1 AND url = ?2",
                    params![page.source_id.as_str(), page.url.as_str()],
                )
                .await
                .map_err(db_err)?;
                id
            }
            None => {
                let id = if page.id.is_empty() {
                    Uuid::now_v7().to_string()
                } else {
                    page.id.clone()
                };
                tx.execute(
                    "INSERT INTO pages
                       (id, source_id, url, title, full_content, word_count, chunk_count,
                        created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                    params![
                        id.as_str(),
                        page.source_id.as_str(),
                        page.url.as_str(),
                        page.title.as_deref(),
                        page.full_content.as_str(),
                        page.word_count as i64,
                        i64::from(page.chunk_count),
                        now.as_str(),
                    ],
                )
                .await
                .map_err(db_err)?;
                id
            }
        };

        tx.commit().await.map_err(db_err)?;
        Ok(page_id)
    }

    async fn insert_documents_batch(&self, chunks: &[DocumentChunk]) -> Result<usize> {
        self.check_writable()?;
        if chunks.is_empty() {
            return Ok(0);
        }
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();

        let tx = self.conn.transaction().await.map_err(db_err)?;
        for chunk in chunks {
            let metadata = to_json(&chunk.metadata)?;
            let embedding = to_json(&chunk.embedding)?;
            tx.execute(
                "INSERT INTO documents
                   (source_id, page_id, url, chunk_number, content, metadata_json,
                    embedding_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    chunk.source_id.as_str(),
                    chunk.page_id.as_str(),
                    chunk.url.as_str(),
                    i64::from(chunk.chunk_number),
                    chunk.content.as_str(),
                    metadata.as_str(),
                    embedding.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;

        tracing::debug!(count = chunks.len(), "inserted document chunks");
        Ok(chunks.len())
    }

    async fn insert_code_examples_batch(&self, examples: &[CodeExample]) -> Result<usize> {
        self.check_writable()?;
        if examples.is_empty() {
            return Ok(0);
        }
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();

        let tx = self.conn.transaction().await.map_err(db_err)?;
        for example in examples {
            let metadata = to_json(&example.metadata)?;
            let embedding = to_json(&example.embedding)?;
            tx.execute(
                "INSERT INTO code_examples
                   (source_id, url, chunk_number, language, content, summary, metadata_json,
                    embedding_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    example.source_id.as_str(),
                    example.url.as_str(),
                    i64::from(example.chunk_number),
                    example.language.as_deref(),
                    example.content.as_str(),
                    example.summary.as_str(),
                    metadata.as_str(),
                    embedding.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;

        tracing::debug!(count = examples.len(), "inserted code examples");
        Ok(examples.len())
    }

    async fn get_documents_by_source(&self, source_id: &SourceId) -> Result<Vec<DocumentChunk>> {
        let mut rows = self
            .conn
            .query(
                "SELECT source_id, page_id, url, chunk_number, content, metadata_json, embedding_json
                 FROM documents WHERE source_id = ?1
                 ORDER BY url, chunk_number",
                params![source_id.as_str()],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(DocumentChunk {
                source_id: SourceId::from(row.get::<String>(0).map_err(db_err)?.as_str()),
                page_id: row.get::<String>(1).map_err(db_err)?,
                url: row.get::<String>(2).map_err(db_err)?,
                chunk_number: row.get::<u32>(3).map_err(db_err)?,
                content: row.get::<String>(4).map_err(db_err)?,
                metadata: from_json(&row.get::<String>(5).map_err(db_err)?)?,
                embedding: from_json(&row.get::<String>(6).map_err(db_err)?)?,
            });
        }
        Ok(results)
    }

    async fn get_code_examples_by_source(&self, source_id: &SourceId) -> Result<Vec<CodeExample>> {
        let mut rows = self
            .conn
            .query(
                "SELECT source_id, url, chunk_number, language, content, summary,
                        metadata_json, embedding_json
                 FROM code_examples WHERE source_id = ?1
                 ORDER BY url, chunk_number",
                params![source_id.as_str()],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(CodeExample {
                source_id: SourceId::from(row.get::<String>(0).map_err(db_err)?.as_str()),
                url: row.get::<String>(1).map_err(db_err)?,
                chunk_number: row.get::<u32>(2).map_err(db_err)?,
                language: row.get::<String>(3).ok(),
                content: row.get::<String>(4).map_err(db_err)?,
                summary: row.get::<String>(5).map_err(db_err)?,
                metadata: from_json(&row.get::<String>(6).map_err(db_err)?)?,
                embedding: from_json(&row.get::<String>(7).map_err(db_err)?)?,
            });
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn row_to_source(row: &Row) -> Result<Source> {
    Ok(Source {
        source_id: SourceId::from(row.get::<String>(0).map_err(db_err)?.as_str()),
        title: row.get::<String>(1).ok(),
        summary: row.get::<String>(2).ok(),
        total_word_count: row.get::<i64>(3).map_err(db_err)?.max(0) as u64,
        metadata: from_json(&row.get::<String>(4).map_err(db_err)?)?,
        created_at: parse_timestamp(&row.get::<String>(5).map_err(db_err)?)?,
        updated_at: parse_timestamp(&row.get::<String>(6).map_err(db_err)?)?,
    })
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| HarvestError::Storage(format!("invalid date {s:?}: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| HarvestError::Storage(format!("failed to encode JSON column: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_str(s)
        .map_err(|e| HarvestError::Storage(format!("failed to decode JSON column: {e}")))
}
