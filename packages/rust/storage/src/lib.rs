//! libSQL storage layer: the knowledge store and research run history.
//!
//! The [`Storage`] struct wraps a local libSQL database holding crawled
//! documents (indexed with FTS5 for retrieval) and a record of completed
//! research runs. It implements [`KnowledgeStore`], the store/retrieve
//! contract the research pipeline depends on.

mod migrations;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use darkscout_shared::{DarkscoutError, KnowledgeItem, ResearchRun, Result, RetrievedDocument};
use libsql::{Connection, Database, params};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Upper bound on query terms passed to FTS5.
const MAX_QUERY_TERMS: usize = 32;

// ---------------------------------------------------------------------------
// KnowledgeStore contract
// ---------------------------------------------------------------------------

/// Persists crawled text and answers relevance-ranked lookups.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Persist items with their source address. Items with empty content are skipped.
    async fn store(&self, items: &[KnowledgeItem]) -> Result<()>;

    /// Up to `k` documents relevant to `query`, best match first.
    async fn retrieve(&self, query: &str, k: u32) -> Result<Vec<RetrievedDocument>>;
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

impl Storage {
    /// Open or create a database at `path`, applying pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DarkscoutError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DarkscoutError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| DarkscoutError::Storage(e.to_string()))?;

        let storage = Self { db, conn };
        storage.run_migrations().await?;
        Ok(storage)
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
                        DarkscoutError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    // -----------------------------------------------------------------------
    // Document operations
    // -----------------------------------------------------------------------

    /// Insert non-empty items, returning how many were written.
    pub async fn insert_documents(&self, items: &[KnowledgeItem]) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let mut written = 0;

        for item in items.iter().filter(|i| !i.content.is_empty()) {
            let id = Uuid::now_v7().to_string();
            let hash = content_hash(&item.content);
            self.conn
                .execute(
                    "INSERT INTO documents (id, url, content, content_hash, stored_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        id.as_str(),
                        item.url.as_str(),
                        item.content.as_str(),
                        hash.as_str(),
                        now.as_str()
                    ],
                )
                .await
                .map_err(|e| DarkscoutError::Storage(e.to_string()))?;
            written += 1;
        }

        Ok(written)
    }

    /// Number of stored documents.
    pub async fn document_count(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM documents", params![])
            .await
            .map_err(|e| DarkscoutError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map(|n| n.max(0) as u64)
                .map_err(|e| DarkscoutError::Storage(e.to_string())),
            Ok(None) => Ok(0),
            Err(e) => Err(DarkscoutError::Storage(e.to_string())),
        }
    }

    /// Full-text search over document content, ranked by bm25.
    pub async fn search(&self, query: &str, limit: u32) -> Result<Vec<RetrievedDocument>> {
        let Some(match_expr) = fts_match_expression(query) else {
            return Ok(Vec::new());
        };

        let mut rows = self
            .conn
            .query(
                "SELECT d.url, d.content, rank
                 FROM documents_fts fts
                 JOIN documents d ON d.rowid = fts.rowid
                 WHERE documents_fts MATCH ?1
                 ORDER BY rank
                 LIMIT ?2",
                params![match_expr.as_str(), limit],
            )
            .await
            .map_err(|e| DarkscoutError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let url: String = row
                .get(0)
                .map_err(|e| DarkscoutError::Storage(e.to_string()))?;
            let content: String = row
                .get(1)
                .map_err(|e| DarkscoutError::Storage(e.to_string()))?;
            let score: f64 = row.get(2).unwrap_or(0.0);
            results.push(RetrievedDocument {
                url,
                content,
                score,
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Research run history
    // -----------------------------------------------------------------------

    /// Record a completed research run.
    pub async fn insert_run(&self, run: &ResearchRun) -> Result<()> {
        let plan_json = serde_json::to_string(&run.plan)
            .map_err(|e| DarkscoutError::Storage(format!("failed to encode plan: {e}")))?;
        let id = run.id.to_string();
        let started = run.started_at.to_rfc3339();
        let finished = run.finished_at.to_rfc3339();

        self.conn
            .execute(
                "INSERT INTO research_runs (id, query, plan_json, report, source_count, started_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.as_str(),
                    run.query.as_str(),
                    plan_json.as_str(),
                    run.report.as_str(),
                    run.source_count as i64,
                    started.as_str(),
                    finished.as_str()
                ],
            )
            .await
            .map_err(|e| DarkscoutError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Most recent runs first.
    pub async fn list_runs(&self, limit: u32) -> Result<Vec<ResearchRun>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, query, plan_json, report, source_count, started_at, finished_at
                 FROM research_runs
                 ORDER BY started_at DESC
                 LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(|e| DarkscoutError::Storage(e.to_string()))?;

        let mut runs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            runs.push(row_to_run(&row)?);
        }
        Ok(runs)
    }
}

#[async_trait]
impl KnowledgeStore for Storage {
    async fn store(&self, items: &[KnowledgeItem]) -> Result<()> {
        let written = self.insert_documents(items).await?;
        if written > 0 {
            tracing::info!(documents = written, "stored documents in knowledge base");
        } else {
            tracing::debug!("no non-empty documents to store");
        }
        Ok(())
    }

    async fn retrieve(&self, query: &str, k: u32) -> Result<Vec<RetrievedDocument>> {
        tracing::info!(%query, k, "retrieving documents from knowledge base");
        self.search(query, k).await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Build an FTS5 expression matching any of the query's words.
///
/// Each term is quoted so punctuation and FTS5 operators in user input are
/// inert. Returns `None` when the query has no words.
fn fts_match_expression(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .take(MAX_QUERY_TERMS)
        .map(|t| format!("\"{}\"", t.to_lowercase()))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

/// Compute SHA-256 hash of content.
fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DarkscoutError::Storage(format!("invalid date: {e}")))
}

/// Convert a database row to a [`ResearchRun`].
fn row_to_run(row: &libsql::Row) -> Result<ResearchRun> {
    let storage_err = |e: libsql::Error| DarkscoutError::Storage(e.to_string());

    let id: String = row.get(0).map_err(storage_err)?;
    let plan_json: String = row.get(2).map_err(storage_err)?;
    let started: String = row.get(5).map_err(storage_err)?;
    let finished: String = row.get(6).map_err(storage_err)?;

    Ok(ResearchRun {
        id: id
            .parse()
            .map_err(|e| DarkscoutError::Storage(format!("invalid run id '{id}': {e}")))?,
        query: row.get(1).map_err(storage_err)?,
        plan: serde_json::from_str(&plan_json)
            .map_err(|e| DarkscoutError::Storage(format!("invalid plan json: {e}")))?,
        report: row.get(3).map_err(storage_err)?,
        source_count: row.get::<i64>(4).map_err(storage_err)?.max(0) as usize,
        started_at: parse_timestamp(&started)?,
        finished_at: parse_timestamp(&finished)?,
    })
}
