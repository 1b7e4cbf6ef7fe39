//! Semantic retrieval over ingested chunks.
//!
//! A search resolves the accessible knowledge bases first and only ever
//! touches chunks inside them — access control is a data filter here, not a
//! request guard. Scoring is brute-force cosine similarity over candidate
//! rows decoded from their BLOBs; at this system's scale that beats
//! maintaining an ANN index.
//!
//! Selection: over-fetch twice `top_k` by score, drop rows under
//! `min_score`, then greedily admit chunks while the token budget holds.
//! A chunk that would overflow the budget is skipped whole, never truncated,
//! and selection continues with smaller ones.
//!
//! Degraded modes return empty results instead of erroring: no accessible
//! KB, or a query embedding failure (logged), both yield an empty set so
//! callers can degrade to answering without context.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::warn;

use crate::access::{AccessResolver, ListFilter};
use crate::embedding::{blob_to_vec, cosine_similarity, EmbeddingGateway};
use crate::models::{AssetType, ChunkMetadata, PermissionLevel};
use crate::ragconfig::ConfigResolver;

/// A chunk selected for a query, with its provenance.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub document_name: String,
    pub kb_id: String,
    pub text: String,
    pub score: f32,
    pub token_count: usize,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchResults {
    pub chunks: Vec<ScoredChunk>,
    pub total_tokens: usize,
}

/// A deduplicated source listing for presentation next to the context.
#[derive(Debug, Clone, Serialize)]
pub struct SourceRef {
    pub document_id: String,
    pub document_name: String,
    pub snippet: String,
    pub score: f32,
}

#[derive(Clone)]
pub struct RetrievalEngine {
    pool: SqlitePool,
    gateway: Arc<EmbeddingGateway>,
    access: AccessResolver,
    configs: ConfigResolver,
}

impl RetrievalEngine {
    pub fn new(pool: SqlitePool, gateway: Arc<EmbeddingGateway>, access: AccessResolver) -> Self {
        Self {
            configs: ConfigResolver::new(pool.clone()),
            pool,
            gateway,
            access,
        }
    }

    /// Search the knowledge bases `account_id` can read.
    ///
    /// `kb_filter` narrows the search to specific KBs; requested KBs the
    /// account cannot read are silently dropped rather than erroring, so a
    /// caller holding a stale KB list still gets its permitted results.
    pub async fn search(
        &self,
        account_id: &str,
        query: &str,
        kb_filter: Option<&[String]>,
    ) -> Result<SearchResults> {
        let kb_ids = self.readable_kbs(account_id, kb_filter).await?;
        if kb_ids.is_empty() {
            return Ok(SearchResults::default());
        }

        // Retrieval settings come from the first accessible KB's cascade.
        let config = self.configs.effective_config(&kb_ids[0], account_id).await?;

        let query_vector = match self.gateway.embed_query(query, &config.embedding).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "query embedding failed, returning no context");
                return Ok(SearchResults::default());
            }
        };

        let candidates = self.fetch_candidates(&kb_ids).await?;

        let mut scored: Vec<ScoredChunk> = candidates
            .into_iter()
            .map(|(chunk, vector)| {
                let score = cosine_similarity(&query_vector, &vector);
                ScoredChunk { score, ..chunk }
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(config.retrieval.top_k * 2);
        scored.retain(|c| c.score >= config.retrieval.min_score);

        // Greedy budget fill: oversized chunks are skipped, not truncated.
        let mut selected = Vec::new();
        let mut total_tokens = 0usize;
        for chunk in scored {
            if selected.len() >= config.retrieval.top_k {
                break;
            }
            if total_tokens + chunk.token_count > config.retrieval.max_context_tokens {
                continue;
            }
            total_tokens += chunk.token_count;
            selected.push(chunk);
        }

        Ok(SearchResults {
            chunks: selected,
            total_tokens,
        })
    }

    async fn readable_kbs(
        &self,
        account_id: &str,
        kb_filter: Option<&[String]>,
    ) -> Result<Vec<String>> {
        match kb_filter {
            Some(requested) => {
                let mut readable = Vec::new();
                for kb_id in requested {
                    let decision = self
                        .access
                        .check_access(
                            account_id,
                            AssetType::KnowledgeBase,
                            kb_id,
                            PermissionLevel::Read,
                        )
                        .await?;
                    if decision.granted {
                        readable.push(kb_id.clone());
                    }
                }
                Ok(readable)
            }
            None => {
                let assets = self
                    .access
                    .list_accessible_assets(
                        account_id,
                        &ListFilter {
                            asset_type: Some(AssetType::KnowledgeBase),
                            include_expired: false,
                        },
                    )
                    .await?;
                Ok(assets.into_iter().map(|a| a.asset_id).collect())
            }
        }
    }

    /// All embedded chunks in the given KBs, paired with their decoded
    /// vectors. Rows without a vector are excluded by the predicate.
    async fn fetch_candidates(&self, kb_ids: &[String]) -> Result<Vec<(ScoredChunk, Vec<f32>)>> {
        let placeholders = vec!["?"; kb_ids.len()].join(", ");
        let sql = format!(
            r#"
            SELECT c.id, c.document_id, c.kb_id, c.text, c.token_count, c.metadata_json,
                   c.embedding, d.name AS document_name
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE c.kb_id IN ({}) AND c.embedding IS NOT NULL
            "#,
            placeholders
        );

        let mut query = sqlx::query(&sql);
        for kb_id in kb_ids {
            query = query.bind(kb_id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let blob: Vec<u8> = row.get("embedding");
            let metadata_json: String = row.get("metadata_json");
            let metadata: ChunkMetadata =
                serde_json::from_str(&metadata_json).unwrap_or_default();
            let token_count: i64 = row.get("token_count");

            candidates.push((
                ScoredChunk {
                    chunk_id: row.get("id"),
                    document_id: row.get("document_id"),
                    document_name: row.get("document_name"),
                    kb_id: row.get("kb_id"),
                    text: row.get("text"),
                    score: 0.0,
                    token_count: token_count as usize,
                    metadata,
                },
                blob_to_vec(&blob),
            ));
        }
        Ok(candidates)
    }
}

// ============ Context assembly ============

/// Render selected chunks into a prompt-ready context block. Each chunk is
/// prefixed with its provenance so the consumer can attribute answers.
pub fn build_context(results: &SearchResults) -> String {
    let mut sections = Vec::with_capacity(results.chunks.len());
    for chunk in &results.chunks {
        let mut provenance = format!("[source: {}", chunk.document_name);
        if let Some(section) = &chunk.metadata.section {
            provenance.push_str(&format!(", {}", section));
        }
        if let Some(page) = chunk.metadata.page {
            provenance.push_str(&format!(", page {}", page));
        }
        provenance.push(']');
        sections.push(format!("{}\n{}", provenance, chunk.text));
    }
    sections.join("\n\n---\n\n")
}

/// One source entry per document, keeping each document's best-scoring
/// chunk as the preview snippet.
pub fn collect_sources(results: &SearchResults) -> Vec<SourceRef> {
    let mut sources: Vec<SourceRef> = Vec::new();
    for chunk in &results.chunks {
        if sources.iter().any(|s| s.document_id == chunk.document_id) {
            continue;
        }
        sources.push(SourceRef {
            document_id: chunk.document_id.clone(),
            document_name: chunk.document_name.clone(),
            snippet: snippet_of(&chunk.text, 120),
            score: chunk.score,
        });
    }
    sources
}

fn snippet_of(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}…", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::test_support::StubProvider;
    use crate::ingest::{add_document, create_knowledge_base, IngestionPipeline};
    use crate::jobs::JobStore;
    use crate::models::Visibility;
    use crate::ragconfig::{ConfigScope, RagConfigUpdate, RetrievalFacet};
    use crate::{db, migrate};

    struct Fixture {
        pool: SqlitePool,
        engine: RetrievalEngine,
        pipeline: IngestionPipeline,
    }

    async fn fixture() -> Fixture {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();

        let gateway = Arc::new(EmbeddingGateway::with_providers(vec![Box::new(
            StubProvider::new("openai", true, false),
        )]));
        let pipeline = IngestionPipeline::new(
            pool.clone(),
            gateway.clone(),
            Arc::new(JobStore::new(100)),
            3,
        );
        let engine = RetrievalEngine::new(pool.clone(), gateway, AccessResolver::new(pool.clone()));
        Fixture {
            pool,
            engine,
            pipeline,
        }
    }

    async fn ingest_corpus(fx: &Fixture, owner: &str) -> String {
        let kb = create_knowledge_base(&fx.pool, owner, "corpus", Visibility::Private)
            .await
            .unwrap();
        // Low min_score so stub-vector similarities always pass the filter
        ConfigResolver::new(fx.pool.clone())
            .save_config(
                &ConfigScope::KnowledgeBase(kb.id.clone()),
                RagConfigUpdate {
                    retrieval: Some(RetrievalFacet {
                        min_score: 0.0,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        for (name, body) in [
            ("rust.txt", "rust ownership and borrowing rules for memory safety"),
            ("db.txt", "sqlite write ahead logging and checkpoint behavior"),
            ("net.txt", "tcp congestion control and retransmission timers"),
        ] {
            let doc = add_document(&fx.pool, &kb.id, name, "text/plain", body.as_bytes())
                .await
                .unwrap();
            fx.pipeline.process_document(&doc.id).await.unwrap();
        }
        kb.id
    }

    #[tokio::test]
    async fn test_identical_text_ranks_first() {
        let fx = fixture().await;
        let kb_id = ingest_corpus(&fx, "alice").await;

        let results = fx
            .engine
            .search(
                "alice",
                "rust ownership and borrowing rules for memory safety",
                Some(&[kb_id]),
            )
            .await
            .unwrap();

        assert!(!results.chunks.is_empty());
        assert_eq!(results.chunks[0].document_name, "rust.txt");
        assert!(results.chunks[0].score > 0.99);
    }

    #[tokio::test]
    async fn test_no_accessible_kb_returns_empty() {
        let fx = fixture().await;
        let kb_id = ingest_corpus(&fx, "alice").await;

        let explicit = fx
            .engine
            .search("mallory", "anything", Some(&[kb_id]))
            .await
            .unwrap();
        assert!(explicit.chunks.is_empty());

        let implicit = fx.engine.search("mallory", "anything", None).await.unwrap();
        assert!(implicit.chunks.is_empty());
    }

    #[tokio::test]
    async fn test_search_without_filter_uses_accessible_kbs() {
        let fx = fixture().await;
        ingest_corpus(&fx, "alice").await;

        let results = fx.engine.search("alice", "sqlite checkpoint", None).await.unwrap();
        assert!(!results.chunks.is_empty());
    }

    #[tokio::test]
    async fn test_embedding_failure_degrades_to_empty() {
        let fx = fixture().await;
        let kb_id = ingest_corpus(&fx, "alice").await;

        let broken = Arc::new(EmbeddingGateway::with_providers(vec![Box::new(
            StubProvider::new("openai", true, true),
        )]));
        let engine =
            RetrievalEngine::new(fx.pool.clone(), broken, AccessResolver::new(fx.pool.clone()));

        let results = engine.search("alice", "anything", Some(&[kb_id])).await.unwrap();
        assert!(results.chunks.is_empty());
    }

    #[tokio::test]
    async fn test_token_budget_skips_overflow_chunks() {
        let fx = fixture().await;
        let kb_id = ingest_corpus(&fx, "alice").await;

        // Budget smaller than any single chunk: nothing fits
        ConfigResolver::new(fx.pool.clone())
            .save_config(
                &ConfigScope::KnowledgeBase(kb_id.clone()),
                RagConfigUpdate {
                    retrieval: Some(RetrievalFacet {
                        min_score: 0.0,
                        max_context_tokens: 1,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let results = fx
            .engine
            .search("alice", "sqlite checkpoint", Some(&[kb_id]))
            .await
            .unwrap();
        assert!(results.chunks.is_empty());
        assert_eq!(results.total_tokens, 0);
    }

    #[tokio::test]
    async fn test_top_k_limits_selection() {
        let fx = fixture().await;
        let kb_id = ingest_corpus(&fx, "alice").await;

        ConfigResolver::new(fx.pool.clone())
            .save_config(
                &ConfigScope::KnowledgeBase(kb_id.clone()),
                RagConfigUpdate {
                    retrieval: Some(RetrievalFacet {
                        min_score: 0.0,
                        top_k: 1,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let results = fx
            .engine
            .search("alice", "sqlite checkpoint", Some(&[kb_id]))
            .await
            .unwrap();
        assert_eq!(results.chunks.len(), 1);
    }

    #[tokio::test]
    async fn test_build_context_carries_provenance() {
        let results = SearchResults {
            chunks: vec![ScoredChunk {
                chunk_id: "c1".to_string(),
                document_id: "d1".to_string(),
                document_name: "manual.pdf".to_string(),
                kb_id: "kb1".to_string(),
                text: "the content".to_string(),
                score: 0.9,
                token_count: 3,
                metadata: ChunkMetadata {
                    section: Some("Setup".to_string()),
                    page: Some(4),
                    ..Default::default()
                },
            }],
            total_tokens: 3,
        };

        let context = build_context(&results);
        assert!(context.contains("[source: manual.pdf, Setup, page 4]"));
        assert!(context.contains("the content"));

        let sources = collect_sources(&results);
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].document_name, "manual.pdf");
    }
}
