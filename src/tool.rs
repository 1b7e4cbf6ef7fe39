//! Tool-call boundary: the `search_knowledge` function exposed to agent
//! runtimes. Thin by design — all behavior lives in the retrieval engine,
//! this module only shapes the response for a prompt-consuming caller.

use anyhow::Result;
use serde::Serialize;

use crate::retrieval::{build_context, collect_sources, RetrievalEngine, SourceRef};

/// Response of the `search_knowledge` tool.
///
/// `found` tells the caller whether there is any context worth injecting;
/// when false the other fields are empty and the caller should answer
/// without retrieved context.
#[derive(Debug, Clone, Serialize)]
pub struct SearchKnowledgeResponse {
    pub found: bool,
    pub context: String,
    pub sources: Vec<SourceRef>,
    pub chunks_used: usize,
    pub total_tokens: usize,
}

/// Run a knowledge search on behalf of an agent tool call.
///
/// `kb_ids` narrows the search; `None` searches everything the account can
/// read. Access failures and degraded retrieval both surface as
/// `found: false`, never as an error the agent has to handle.
pub async fn search_knowledge(
    engine: &RetrievalEngine,
    account_id: &str,
    query: &str,
    kb_ids: Option<&[String]>,
) -> Result<SearchKnowledgeResponse> {
    let results = engine.search(account_id, query, kb_ids).await?;

    if results.chunks.is_empty() {
        return Ok(SearchKnowledgeResponse {
            found: false,
            context: String::new(),
            sources: Vec::new(),
            chunks_used: 0,
            total_tokens: 0,
        });
    }

    Ok(SearchKnowledgeResponse {
        found: true,
        context: build_context(&results),
        sources: collect_sources(&results),
        chunks_used: results.chunks.len(),
        total_tokens: results.total_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessResolver;
    use crate::embedding::test_support::StubProvider;
    use crate::embedding::EmbeddingGateway;
    use crate::ingest::{add_document, create_knowledge_base, IngestionPipeline};
    use crate::jobs::JobStore;
    use crate::models::Visibility;
    use crate::ragconfig::{ConfigResolver, ConfigScope, RagConfigUpdate, RetrievalFacet};
    use crate::{db, migrate};
    use std::sync::Arc;

    async fn engine_with_corpus() -> RetrievalEngine {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();

        let gateway = Arc::new(EmbeddingGateway::with_providers(vec![Box::new(
            StubProvider::new("openai", true, false),
        )]));
        let pipeline = IngestionPipeline::new(
            pool.clone(),
            gateway.clone(),
            Arc::new(JobStore::new(100)),
            1,
        );

        let kb = create_knowledge_base(&pool, "alice", "notes", Visibility::Private)
            .await
            .unwrap();
        ConfigResolver::new(pool.clone())
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
        let doc = add_document(
            &pool,
            &kb.id,
            "deploy.txt",
            "text/plain",
            b"the deployment runs through the staging gate before production",
        )
        .await
        .unwrap();
        pipeline.process_document(&doc.id).await.unwrap();

        RetrievalEngine::new(pool.clone(), gateway, AccessResolver::new(pool))
    }

    #[tokio::test]
    async fn test_found_response_carries_context_and_sources() {
        let engine = engine_with_corpus().await;
        let response = search_knowledge(&engine, "alice", "how does deployment work", None)
            .await
            .unwrap();

        assert!(response.found);
        assert!(response.context.contains("deploy.txt"));
        assert_eq!(response.sources.len(), 1);
        assert!(response.chunks_used >= 1);
        assert!(response.total_tokens > 0);
    }

    #[tokio::test]
    async fn test_no_access_yields_found_false() {
        let engine = engine_with_corpus().await;
        let response = search_knowledge(&engine, "mallory", "deployment", None)
            .await
            .unwrap();

        assert!(!response.found);
        assert!(response.context.is_empty());
        assert!(response.sources.is_empty());
    }
}
