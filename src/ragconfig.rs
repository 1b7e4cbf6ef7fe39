//! Cascading RAG configuration resolver.
//!
//! A configuration row is scoped either to one knowledge base, to an account
//! as its default, or is the hard-coded system default. Resolution walks
//! KB row → account default → system default and always returns a fully
//! populated [`RagConfig`].
//!
//! Writes merge facet-by-facet: saving only a `chunking` facet leaves the
//! stored `embedding`/`retrieval` facets untouched. `retrieval.min_score` is
//! clamped to `[0.05, 0.7]` on every write — too permissive returns noise,
//! too strict returns nothing.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Lower/upper bounds applied to `retrieval.min_score` on write.
pub const MIN_SCORE_FLOOR: f32 = 0.05;
pub const MIN_SCORE_CEIL: f32 = 0.7;

/// Chunking facet: how document text is segmented.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_size_tokens")]
    pub size_tokens: usize,
    #[serde(default)]
    pub overlap_tokens: usize,
    #[serde(default = "default_min_size")]
    pub min_size: usize,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default = "default_separators")]
    pub separators: Vec<String>,
    #[serde(default)]
    pub custom_pattern: Option<String>,
}

fn default_strategy() -> String {
    "recursive".to_string()
}
fn default_size_tokens() -> usize {
    400
}
fn default_min_size() -> usize {
    10
}
fn default_max_size() -> usize {
    2000
}
fn default_separators() -> Vec<String> {
    vec![
        "\n\n".to_string(),
        "\n".to_string(),
        ". ".to_string(),
        " ".to_string(),
    ]
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            size_tokens: default_size_tokens(),
            overlap_tokens: 0,
            min_size: default_min_size(),
            max_size: default_max_size(),
            separators: default_separators(),
            custom_pattern: None,
        }
    }
}

/// Embedding facet: which provider/model turns chunks into vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingFacet {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_dimensions() -> usize {
    1536
}
fn default_batch_size() -> usize {
    64
}

impl Default for EmbeddingFacet {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            dimensions: default_dimensions(),
            batch_size: default_batch_size(),
            endpoint: None,
        }
    }
}

/// Retrieval facet: how query results are selected and budgeted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalFacet {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    #[serde(default)]
    pub hybrid: bool,
    #[serde(default)]
    pub rerank: bool,
}

fn default_top_k() -> usize {
    5
}
fn default_min_score() -> f32 {
    0.3
}
fn default_max_context_tokens() -> usize {
    2000
}

impl Default for RetrievalFacet {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_score: default_min_score(),
            max_context_tokens: default_max_context_tokens(),
            hybrid: false,
            rerank: false,
        }
    }
}

/// Fully resolved configuration — no optional facets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RagConfig {
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingFacet,
    pub retrieval: RetrievalFacet,
}

impl RagConfig {
    /// The immutable system default, used when no row matches.
    pub fn system_default() -> Self {
        Self::default()
    }
}

/// Partial update; `None` facets leave the stored value untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RagConfigUpdate {
    pub chunking: Option<ChunkingConfig>,
    pub embedding: Option<EmbeddingFacet>,
    pub retrieval: Option<RetrievalFacet>,
}

/// Where a configuration row is anchored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigScope {
    KnowledgeBase(String),
    AccountDefault(String),
}

/// Resolves effective configuration through the three-level cascade.
#[derive(Clone)]
pub struct ConfigResolver {
    pool: SqlitePool,
}

/// Stored facets for one scope; any facet may be absent.
#[derive(Debug, Clone, Default)]
struct StoredFacets {
    chunking: Option<ChunkingConfig>,
    embedding: Option<EmbeddingFacet>,
    retrieval: Option<RetrievalFacet>,
}

impl ConfigResolver {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Resolve the effective configuration for a knowledge base.
    ///
    /// Order: KB-scoped row, else the account's default row, else the
    /// system default. Facets resolve independently — a KB row holding only
    /// a chunking facet still inherits embedding/retrieval from below.
    pub async fn effective_config(&self, kb_id: &str, account_id: &str) -> Result<RagConfig> {
        let kb_row = self.load_facets_for_kb(kb_id).await?;
        let account_row = self.load_facets_for_account(account_id).await?;
        let system = RagConfig::system_default();

        Ok(RagConfig {
            chunking: kb_row
                .chunking
                .or(account_row.chunking)
                .unwrap_or(system.chunking),
            embedding: kb_row
                .embedding
                .or(account_row.embedding)
                .unwrap_or(system.embedding),
            retrieval: kb_row
                .retrieval
                .or(account_row.retrieval)
                .unwrap_or(system.retrieval),
        })
    }

    /// Merge a partial update into the row for `scope`, creating the row if
    /// absent. Only supplied facets are overwritten.
    pub async fn save_config(&self, scope: &ConfigScope, update: RagConfigUpdate) -> Result<()> {
        let existing = match scope {
            ConfigScope::KnowledgeBase(kb_id) => self.load_facets_for_kb(kb_id).await?,
            ConfigScope::AccountDefault(account_id) => {
                self.load_facets_for_account(account_id).await?
            }
        };

        let chunking = update.chunking.or(existing.chunking);
        let embedding = update.embedding.or(existing.embedding);
        let mut retrieval = update.retrieval.or(existing.retrieval);
        if let Some(ref mut r) = retrieval {
            r.min_score = r.min_score.clamp(MIN_SCORE_FLOOR, MIN_SCORE_CEIL);
        }

        let chunking_json = chunking.map(|c| serde_json::to_string(&c)).transpose()?;
        let embedding_json = embedding.map(|e| serde_json::to_string(&e)).transpose()?;
        let retrieval_json = retrieval.map(|r| serde_json::to_string(&r)).transpose()?;

        let now = chrono::Utc::now().timestamp();

        match scope {
            ConfigScope::KnowledgeBase(kb_id) => {
                sqlx::query(
                    r#"
                    INSERT INTO rag_configurations
                        (id, kb_id, account_id, is_account_default, chunking_json, embedding_json, retrieval_json, created_at, updated_at)
                    VALUES (?, ?, NULL, 0, ?, ?, ?, ?, ?)
                    ON CONFLICT(kb_id) WHERE kb_id IS NOT NULL DO UPDATE SET
                        chunking_json = excluded.chunking_json,
                        embedding_json = excluded.embedding_json,
                        retrieval_json = excluded.retrieval_json,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(Uuid::new_v4().to_string())
                .bind(kb_id)
                .bind(&chunking_json)
                .bind(&embedding_json)
                .bind(&retrieval_json)
                .bind(now)
                .bind(now)
                .execute(&self.pool)
                .await?;
            }
            ConfigScope::AccountDefault(account_id) => {
                sqlx::query(
                    r#"
                    INSERT INTO rag_configurations
                        (id, kb_id, account_id, is_account_default, chunking_json, embedding_json, retrieval_json, created_at, updated_at)
                    VALUES (?, NULL, ?, 1, ?, ?, ?, ?, ?)
                    ON CONFLICT(account_id) WHERE is_account_default = 1 DO UPDATE SET
                        chunking_json = excluded.chunking_json,
                        embedding_json = excluded.embedding_json,
                        retrieval_json = excluded.retrieval_json,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(Uuid::new_v4().to_string())
                .bind(account_id)
                .bind(&chunking_json)
                .bind(&embedding_json)
                .bind(&retrieval_json)
                .bind(now)
                .bind(now)
                .execute(&self.pool)
                .await?;
            }
        }

        Ok(())
    }

    /// Delete the configuration row for a scope (falls back down the cascade).
    pub async fn delete_config(&self, scope: &ConfigScope) -> Result<()> {
        match scope {
            ConfigScope::KnowledgeBase(kb_id) => {
                sqlx::query("DELETE FROM rag_configurations WHERE kb_id = ?")
                    .bind(kb_id)
                    .execute(&self.pool)
                    .await?;
            }
            ConfigScope::AccountDefault(account_id) => {
                sqlx::query(
                    "DELETE FROM rag_configurations WHERE account_id = ? AND is_account_default = 1",
                )
                .bind(account_id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn load_facets_for_kb(&self, kb_id: &str) -> Result<StoredFacets> {
        let row = sqlx::query(
            "SELECT chunking_json, embedding_json, retrieval_json FROM rag_configurations WHERE kb_id = ?",
        )
        .bind(kb_id)
        .fetch_optional(&self.pool)
        .await?;

        parse_facets(row)
    }

    async fn load_facets_for_account(&self, account_id: &str) -> Result<StoredFacets> {
        let row = sqlx::query(
            "SELECT chunking_json, embedding_json, retrieval_json FROM rag_configurations WHERE account_id = ? AND is_account_default = 1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        parse_facets(row)
    }
}

fn parse_facets(row: Option<sqlx::sqlite::SqliteRow>) -> Result<StoredFacets> {
    let Some(row) = row else {
        return Ok(StoredFacets::default());
    };

    let chunking: Option<String> = row.get("chunking_json");
    let embedding: Option<String> = row.get("embedding_json");
    let retrieval: Option<String> = row.get("retrieval_json");

    Ok(StoredFacets {
        chunking: chunking.as_deref().map(serde_json::from_str).transpose()?,
        embedding: embedding.as_deref().map(serde_json::from_str).transpose()?,
        retrieval: retrieval.as_deref().map(serde_json::from_str).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};

    async fn resolver() -> ConfigResolver {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        ConfigResolver::new(pool)
    }

    #[tokio::test]
    async fn test_system_default_when_no_rows() {
        let r = resolver().await;
        let cfg = r.effective_config("kb1", "acc1").await.unwrap();
        assert_eq!(cfg, RagConfig::system_default());
    }

    #[tokio::test]
    async fn test_cascade_order() {
        let r = resolver().await;

        // Account default: top_k 7
        r.save_config(
            &ConfigScope::AccountDefault("acc1".to_string()),
            RagConfigUpdate {
                retrieval: Some(RetrievalFacet {
                    top_k: 7,
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        // KB-specific: top_k 11
        r.save_config(
            &ConfigScope::KnowledgeBase("kb1".to_string()),
            RagConfigUpdate {
                retrieval: Some(RetrievalFacet {
                    top_k: 11,
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let cfg = r.effective_config("kb1", "acc1").await.unwrap();
        assert_eq!(cfg.retrieval.top_k, 11);

        // Removing the KB row falls back to the account default
        r.delete_config(&ConfigScope::KnowledgeBase("kb1".to_string()))
            .await
            .unwrap();
        let cfg = r.effective_config("kb1", "acc1").await.unwrap();
        assert_eq!(cfg.retrieval.top_k, 7);

        // Removing that falls back to the system default
        r.delete_config(&ConfigScope::AccountDefault("acc1".to_string()))
            .await
            .unwrap();
        let cfg = r.effective_config("kb1", "acc1").await.unwrap();
        assert_eq!(cfg.retrieval.top_k, RagConfig::system_default().retrieval.top_k);
    }

    #[tokio::test]
    async fn test_partial_update_preserves_other_facets() {
        let r = resolver().await;
        let scope = ConfigScope::KnowledgeBase("kb1".to_string());

        r.save_config(
            &scope,
            RagConfigUpdate {
                embedding: Some(EmbeddingFacet {
                    model: "custom-model".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        // Supplying chunking alone must not erase the stored embedding facet
        r.save_config(
            &scope,
            RagConfigUpdate {
                chunking: Some(ChunkingConfig {
                    size_tokens: 123,
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let cfg = r.effective_config("kb1", "acc1").await.unwrap();
        assert_eq!(cfg.embedding.model, "custom-model");
        assert_eq!(cfg.chunking.size_tokens, 123);
    }

    #[tokio::test]
    async fn test_min_score_clamped_on_write() {
        let r = resolver().await;
        let scope = ConfigScope::KnowledgeBase("kb1".to_string());

        r.save_config(
            &scope,
            RagConfigUpdate {
                retrieval: Some(RetrievalFacet {
                    min_score: 0.9,
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let cfg = r.effective_config("kb1", "acc1").await.unwrap();
        assert!((cfg.retrieval.min_score - MIN_SCORE_CEIL).abs() < f32::EPSILON);

        r.save_config(
            &scope,
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
        let cfg = r.effective_config("kb1", "acc1").await.unwrap();
        assert!((cfg.retrieval.min_score - MIN_SCORE_FLOOR).abs() < f32::EPSILON);
    }
}
