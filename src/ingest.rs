//! Document ingestion pipeline.
//!
//! Drives a document through parse → chunk → embed → store, tracking progress
//! in the in-memory [`JobStore`] and persisting the outcome on the document
//! row (`pending` → `processing` → `completed` | `failed`).
//!
//! Re-ingestion is delete-then-replace: prior chunks are removed before new
//! ones are written, so a document never contributes stale and fresh chunks
//! at the same time. The delete waits until segmentation has produced the
//! replacement pieces, and an embedding failure mid-document removes the
//! partially written chunks again, so a `failed` document contributes no
//! chunks to search. Chunk writes are two-phase — the row is inserted first,
//! the embedding BLOB attached after — and the insert upserts on
//! `(document_id, chunk_index)` so a crashed run can be replayed. Rows left
//! without a vector are invisible to search and recoverable via
//! [`IngestionPipeline::repair_missing_vectors`].
//!
//! KB usage counters are recomputed from the source tables after every run,
//! success or failure, rather than adjusted incrementally.

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::embedding::{vec_to_blob, EmbeddingGateway};
use crate::jobs::JobStore;
use crate::models::{Document, DocumentStatus, JobStatus, KnowledgeBase, Visibility};
use crate::parse;
use crate::ragconfig::ConfigResolver;
use crate::segment::{chunk_with_config, ChunkPiece};

// ============ Knowledge base / document storage ============

/// Create a knowledge base owned by `account_id`.
pub async fn create_knowledge_base(
    pool: &SqlitePool,
    account_id: &str,
    name: &str,
    visibility: Visibility,
) -> Result<KnowledgeBase> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO knowledge_bases (id, account_id, name, visibility, backend, status, created_at, updated_at)
        VALUES (?, ?, ?, ?, 'local', 'active', ?, ?)
        "#,
    )
    .bind(&id)
    .bind(account_id)
    .bind(name)
    .bind(visibility.as_str())
    .bind(now.timestamp())
    .bind(now.timestamp())
    .execute(pool)
    .await?;

    Ok(KnowledgeBase {
        id,
        account_id: account_id.to_string(),
        name: name.to_string(),
        visibility,
        backend: crate::models::BackendKind::LocalVector,
        status: "active".to_string(),
        document_count: 0,
        chunk_count: 0,
        total_bytes: 0,
        created_at: now,
        updated_at: now,
    })
}

/// Delete a knowledge base and everything hanging off it: chunks, documents,
/// its configuration row, and grants referencing it.
pub async fn delete_knowledge_base(pool: &SqlitePool, kb_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM chunks WHERE kb_id = ?")
        .bind(kb_id)
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM documents WHERE kb_id = ?")
        .bind(kb_id)
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM rag_configurations WHERE kb_id = ?")
        .bind(kb_id)
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM asset_permissions WHERE asset_type = 'knowledge_base' AND asset_id = ?")
        .bind(kb_id)
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM knowledge_bases WHERE id = ?")
        .bind(kb_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Store a document's raw bytes in `pending` state, ready for processing.
pub async fn add_document(
    pool: &SqlitePool,
    kb_id: &str,
    name: &str,
    mime_type: &str,
    bytes: &[u8],
) -> Result<Document> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let content_hash = hash_bytes(bytes);

    sqlx::query(
        r#"
        INSERT INTO documents (id, kb_id, name, mime_type, content, status, content_hash, size_bytes, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(kb_id)
    .bind(name)
    .bind(mime_type)
    .bind(bytes)
    .bind(&content_hash)
    .bind(bytes.len() as i64)
    .bind(now.timestamp())
    .bind(now.timestamp())
    .execute(pool)
    .await?;

    Ok(Document {
        id,
        kb_id: kb_id.to_string(),
        name: name.to_string(),
        mime_type: mime_type.to_string(),
        status: DocumentStatus::Pending,
        error: None,
        content_hash,
        size_bytes: bytes.len() as i64,
        created_at: now,
        updated_at: now,
    })
}

fn hash_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Recompute a KB's usage counters from the source tables.
pub async fn resync_kb_counters(pool: &SqlitePool, kb_id: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE knowledge_bases SET
            document_count = (SELECT COUNT(*) FROM documents WHERE kb_id = ?1),
            chunk_count = (SELECT COUNT(*) FROM chunks WHERE kb_id = ?1),
            total_bytes = (SELECT COALESCE(SUM(size_bytes), 0) FROM documents WHERE kb_id = ?1),
            updated_at = ?2
        WHERE id = ?1
        "#,
    )
    .bind(kb_id)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

async fn set_document_status(
    pool: &SqlitePool,
    document_id: &str,
    status: DocumentStatus,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE documents SET status = ?, error = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now().timestamp())
        .bind(document_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ============ Pipeline ============

#[derive(Clone)]
pub struct IngestionPipeline {
    pool: SqlitePool,
    gateway: Arc<EmbeddingGateway>,
    configs: ConfigResolver,
    jobs: Arc<JobStore>,
    concurrency: usize,
}

impl IngestionPipeline {
    pub fn new(
        pool: SqlitePool,
        gateway: Arc<EmbeddingGateway>,
        jobs: Arc<JobStore>,
        concurrency: usize,
    ) -> Self {
        Self {
            configs: ConfigResolver::new(pool.clone()),
            pool,
            gateway,
            jobs,
            concurrency: concurrency.max(1),
        }
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    /// Process one document end to end. Returns the job id; the job record
    /// reflects the failure when this returns `Err`.
    pub async fn process_document(&self, document_id: &str) -> Result<String> {
        let row = sqlx::query("SELECT kb_id, name, mime_type, content FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| anyhow!("document not found: {}", document_id))?;

        let kb_id: String = row.get("kb_id");
        let name: String = row.get("name");
        let mime_type: String = row.get("mime_type");
        let content: Vec<u8> = row.get("content");

        let account_id: String =
            sqlx::query_scalar("SELECT account_id FROM knowledge_bases WHERE id = ?")
                .bind(&kb_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| anyhow!("knowledge base not found: {}", kb_id))?;

        let job_id = self.jobs.create(&account_id, &kb_id, document_id);

        match self
            .run(&job_id, document_id, &kb_id, &account_id, &name, &mime_type, &content)
            .await
        {
            Ok(chunk_count) => {
                set_document_status(&self.pool, document_id, DocumentStatus::Completed, None)
                    .await?;
                resync_kb_counters(&self.pool, &kb_id).await?;
                self.jobs.set_progress(&job_id, JobStatus::Completed, 100);
                info!(document = name, chunks = chunk_count, "document ingested");
                Ok(job_id)
            }
            Err(e) => {
                let msg = format!("{:#}", e);
                warn!(document = name, error = %msg, "document ingestion failed");
                set_document_status(&self.pool, document_id, DocumentStatus::Failed, Some(&msg))
                    .await?;
                resync_kb_counters(&self.pool, &kb_id).await?;
                self.jobs.fail(&job_id, &msg);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        job_id: &str,
        document_id: &str,
        kb_id: &str,
        account_id: &str,
        name: &str,
        mime_type: &str,
        content: &[u8],
    ) -> Result<usize> {
        set_document_status(&self.pool, document_id, DocumentStatus::Processing, None).await?;
        self.jobs.set_progress(job_id, JobStatus::Processing, 0);

        let parsed = parse::parse(content, mime_type)
            .with_context(|| format!("failed to parse document {}", name))?;
        self.jobs.set_progress(job_id, JobStatus::Processing, 10);

        let config = self.configs.effective_config(kb_id, account_id).await?;
        let mut pieces = chunk_with_config(&parsed.text, &config.chunking)?;
        self.jobs.set_progress(job_id, JobStatus::Processing, 30);

        // Replacement point: prior chunks are dropped only once new pieces
        // exist, so a parse or chunking failure leaves the previous good
        // chunks searchable.
        self.delete_chunks(document_id).await?;

        if pieces.is_empty() {
            return Ok(0);
        }

        let mut metadata = parsed.metadata;
        if metadata.title.is_none() {
            metadata.title = Some(name.to_string());
        }
        let metadata_json = serde_json::to_string(&metadata)?;

        // Embed in pipeline-level batches so progress moves during long
        // documents; the gateway sub-batches further per provider limits.
        let batch_size = config.embedding.batch_size.max(1);
        let total = pieces.len();

        let mut batches: Vec<Vec<ChunkPiece>> = Vec::new();
        while !pieces.is_empty() {
            let rest = pieces.split_off(pieces.len().min(batch_size));
            batches.push(std::mem::replace(&mut pieces, rest));
        }

        if let Err(e) = self
            .embed_and_store(job_id, document_id, kb_id, batches, &config.embedding, &metadata_json, total)
            .await
        {
            // A failed attempt must not leave half a document searchable
            self.delete_chunks(document_id).await?;
            return Err(e);
        }

        Ok(total)
    }

    async fn delete_chunks(&self, document_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn embed_and_store(
        &self,
        job_id: &str,
        document_id: &str,
        kb_id: &str,
        batches: Vec<Vec<ChunkPiece>>,
        facet: &crate::ragconfig::EmbeddingFacet,
        metadata_json: &str,
        total: usize,
    ) -> Result<()> {
        let mut done = 0usize;
        let mut chunk_index = 0i64;

        for batch in batches {
            let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
            let embedded = self
                .gateway
                .embed_batch_with_config(&texts, facet)
                .await
                .context("embedding failed")?;

            if embedded.vectors.len() != batch.len() {
                bail!(
                    "embedding gateway returned {} vectors for {} chunks",
                    embedded.vectors.len(),
                    batch.len()
                );
            }

            for (piece, vector) in batch.iter().zip(embedded.vectors.iter()) {
                self.write_chunk(document_id, kb_id, chunk_index, piece, metadata_json, vector)
                    .await?;
                chunk_index += 1;
            }

            done += batch.len();
            let progress = 50 + (40 * done / total) as u8;
            self.jobs.set_progress(job_id, JobStatus::Processing, progress);
        }

        Ok(())
    }

    /// Two-phase chunk write: row first, vector attached after. The upsert
    /// on `(document_id, chunk_index)` makes replays idempotent.
    async fn write_chunk(
        &self,
        document_id: &str,
        kb_id: &str,
        chunk_index: i64,
        piece: &ChunkPiece,
        metadata_json: &str,
        vector: &[f32],
    ) -> Result<()> {
        let chunk_id: String = sqlx::query_scalar(
            r#"
            INSERT INTO chunks (id, document_id, kb_id, chunk_index, text, start_char, end_char, token_count, metadata_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(document_id, chunk_index) DO UPDATE SET
                text = excluded.text,
                start_char = excluded.start_char,
                end_char = excluded.end_char,
                token_count = excluded.token_count,
                metadata_json = excluded.metadata_json,
                embedding = NULL
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(document_id)
        .bind(kb_id)
        .bind(chunk_index)
        .bind(&piece.text)
        .bind(piece.start_char as i64)
        .bind(piece.end_char as i64)
        .bind(piece.token_count as i64)
        .bind(metadata_json)
        .fetch_one(&self.pool)
        .await?;

        sqlx::query("UPDATE chunks SET embedding = ? WHERE id = ?")
            .bind(vec_to_blob(vector))
            .bind(&chunk_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Process several documents with bounded concurrency. Each outcome is
    /// independent — one failure never aborts the rest.
    pub async fn process_documents(
        &self,
        document_ids: &[String],
    ) -> Vec<(String, Result<String>)> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();

        for doc_id in document_ids {
            let pipeline = self.clone();
            let doc_id = doc_id.clone();
            let semaphore = semaphore.clone();
            set.spawn(async move {
                // Closed only on runtime shutdown
                let _permit = semaphore.acquire_owned().await;
                let result = pipeline.process_document(&doc_id).await;
                (doc_id, result)
            });
        }

        let mut outcomes = Vec::with_capacity(document_ids.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(error = %e, "ingestion task panicked"),
            }
        }
        outcomes
    }

    /// Reset every document in a KB to `pending` and process them all again.
    /// Used after a chunking or embedding configuration change.
    pub async fn reprocess_knowledge_base(&self, kb_id: &str) -> Result<Vec<(String, Result<String>)>> {
        let doc_ids: Vec<String> = sqlx::query_scalar("SELECT id FROM documents WHERE kb_id = ?")
            .bind(kb_id)
            .fetch_all(&self.pool)
            .await?;

        warn!(
            kb = kb_id,
            documents = doc_ids.len(),
            "reprocessing entire knowledge base"
        );
        sqlx::query("UPDATE documents SET status = 'pending', error = NULL, updated_at = ? WHERE kb_id = ?")
            .bind(Utc::now().timestamp())
            .bind(kb_id)
            .execute(&self.pool)
            .await?;

        Ok(self.process_documents(&doc_ids).await)
    }

    /// Embed and attach vectors for chunk rows left without one (interrupted
    /// second write phase). Returns how many rows were repaired.
    pub async fn repair_missing_vectors(&self, kb_id: &str) -> Result<usize> {
        let account_id: String =
            sqlx::query_scalar("SELECT account_id FROM knowledge_bases WHERE id = ?")
                .bind(kb_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| anyhow!("knowledge base not found: {}", kb_id))?;

        let orphans = sqlx::query("SELECT id, text FROM chunks WHERE kb_id = ? AND embedding IS NULL")
            .bind(kb_id)
            .fetch_all(&self.pool)
            .await?;
        if orphans.is_empty() {
            return Ok(0);
        }

        let config = self.configs.effective_config(kb_id, &account_id).await?;
        let texts: Vec<String> = orphans.iter().map(|r| r.get("text")).collect();
        let embedded = self
            .gateway
            .embed_batch_with_config(&texts, &config.embedding)
            .await?;

        for (row, vector) in orphans.iter().zip(embedded.vectors.iter()) {
            let id: String = row.get("id");
            sqlx::query("UPDATE chunks SET embedding = ? WHERE id = ?")
                .bind(vec_to_blob(vector))
                .bind(id)
                .execute(&self.pool)
                .await?;
        }

        info!(kb = kb_id, repaired = orphans.len(), "attached missing vectors");
        Ok(orphans.len())
    }
}
