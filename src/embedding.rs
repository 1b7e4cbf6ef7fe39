//! Embedding provider abstraction and the multi-provider gateway.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`OpenAiProvider`]** — `POST /v1/embeddings`, order-corrected by the
//!   provider-supplied item index.
//! - **[`CohereProvider`]** — `POST /v1/embed`, response order matches input.
//! - **[`CustomHttpProvider`]** — generic `POST {endpoint} {texts, model}`
//!   contract for self-hosted models; no code change needed to add one.
//!
//! The [`EmbeddingGateway`] tries the configured provider first, then a fixed
//! fallback order (minus the one already tried), skipping providers whose
//! availability check fails and catching per-provider request failures. The
//! last error is surfaced only when every provider fails. Batches larger than
//! `batch_size` are split into sequential sub-batches and concatenated in
//! input order — sequential on purpose, to respect provider rate limits.
//!
//! # Retry Strategy
//!
//! Within one provider call, transient failures are retried with exponential
//! backoff (1s, 2s, 4s, capped):
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network error / timeout → retry
//!
//! Any failure, retryable or not, advances the gateway to the next provider.
//!
//! Also provides the vector codec for SQLite BLOB storage
//! ([`vec_to_blob`] / [`blob_to_vec`]) and [`cosine_similarity`].

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ProvidersConfig;
use crate::ragconfig::EmbeddingFacet;
use crate::segment::estimate_tokens;

/// Fallback order tried after the configured provider.
pub const FALLBACK_ORDER: [&str; 3] = ["openai", "cohere", "custom"];

/// One provider response: vectors in input order plus the token usage the
/// provider reported (estimated when the provider reports none).
#[derive(Debug, Clone)]
pub struct EmbedBatch {
    pub vectors: Vec<Vec<f32>>,
    pub total_tokens: usize,
}

/// Gateway result: concatenated vectors plus which provider served them.
#[derive(Debug, Clone)]
pub struct GatewayResult {
    pub vectors: Vec<Vec<f32>>,
    pub total_tokens: usize,
    pub provider_used: String,
}

/// A concrete embedding backend.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider identifier used in the fallback order (e.g. `"openai"`).
    fn name(&self) -> &str;

    /// Cheap local check — credentials present, endpoint configured. The
    /// facet is consulted because it can carry a per-KB endpoint. A provider
    /// failing this is skipped without a request.
    fn is_available(&self, facet: &EmbeddingFacet) -> bool;

    /// Embed one sub-batch. Must return exactly one vector per input text,
    /// in input order.
    async fn embed_batch(&self, texts: &[String], facet: &EmbeddingFacet) -> Result<EmbedBatch>;
}

// ============ Shared HTTP helper ============

/// POST a JSON body with bearer auth and retry/backoff on retryable failures.
///
/// Retryable: network error, timeout, HTTP 429, HTTP 5xx.
/// Terminal: any other 4xx — fails immediately without further attempts.
async fn post_json_with_retry(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(4));
            tokio::time::sleep(delay).await;
        }

        let mut req = client.post(url).json(body);
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response.json().await?);
                }
                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(anyhow!("embedding API error {}: {}", status, body_text));
                    continue;
                }
                // Client error (not 429) — terminal, don't retry
                bail!("embedding API error {}: {}", status, body_text);
            }
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("embedding request failed after retries")))
}

// ============ OpenAI ============

/// OpenAI embeddings API. Requires the configured API key env var.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key_env: String,
    max_retries: u32,
}

impl OpenAiProvider {
    pub fn new(client: reqwest::Client, settings: &ProvidersConfig) -> Self {
        Self {
            client,
            api_key_env: settings.openai_api_key_env.clone(),
            max_retries: settings.max_retries,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn is_available(&self, _facet: &EmbeddingFacet) -> bool {
        std::env::var(&self.api_key_env).is_ok_and(|v| !v.is_empty())
    }

    async fn embed_batch(&self, texts: &[String], facet: &EmbeddingFacet) -> Result<EmbedBatch> {
        let api_key = std::env::var(&self.api_key_env)
            .map_err(|_| anyhow!("{} not set", self.api_key_env))?;

        let body = serde_json::json!({
            "model": facet.model,
            "input": texts,
            "dimensions": facet.dimensions,
        });

        let json = post_json_with_retry(
            &self.client,
            "https://api.openai.com/v1/embeddings",
            Some(&api_key),
            &body,
            self.max_retries,
        )
        .await?;

        let data = json
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| anyhow!("invalid OpenAI response: missing data array"))?;

        // The API does not guarantee output order; re-sort by the item index.
        let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
        for item in data {
            let index = item
                .get("index")
                .and_then(|i| i.as_u64())
                .ok_or_else(|| anyhow!("invalid OpenAI response: missing index"))?
                as usize;
            let embedding = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| anyhow!("invalid OpenAI response: missing embedding"))?;
            let vec: Vec<f32> = embedding
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();
            indexed.push((index, vec));
        }
        indexed.sort_by_key(|(i, _)| *i);

        if indexed.len() != texts.len() {
            bail!(
                "OpenAI returned {} embeddings for {} inputs",
                indexed.len(),
                texts.len()
            );
        }

        let total_tokens = json
            .pointer("/usage/total_tokens")
            .and_then(|t| t.as_u64())
            .map(|t| t as usize)
            .unwrap_or_else(|| texts.iter().map(|t| estimate_tokens(t)).sum());

        Ok(EmbedBatch {
            vectors: indexed.into_iter().map(|(_, v)| v).collect(),
            total_tokens,
        })
    }
}

// ============ Cohere ============

/// Cohere embed API. Response order matches input order per their contract.
pub struct CohereProvider {
    client: reqwest::Client,
    api_key_env: String,
    max_retries: u32,
}

impl CohereProvider {
    pub fn new(client: reqwest::Client, settings: &ProvidersConfig) -> Self {
        Self {
            client,
            api_key_env: settings.cohere_api_key_env.clone(),
            max_retries: settings.max_retries,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for CohereProvider {
    fn name(&self) -> &str {
        "cohere"
    }

    fn is_available(&self, _facet: &EmbeddingFacet) -> bool {
        std::env::var(&self.api_key_env).is_ok_and(|v| !v.is_empty())
    }

    async fn embed_batch(&self, texts: &[String], facet: &EmbeddingFacet) -> Result<EmbedBatch> {
        let api_key = std::env::var(&self.api_key_env)
            .map_err(|_| anyhow!("{} not set", self.api_key_env))?;

        let body = serde_json::json!({
            "model": facet.model,
            "texts": texts,
            "input_type": "search_document",
        });

        let json = post_json_with_retry(
            &self.client,
            "https://api.cohere.ai/v1/embed",
            Some(&api_key),
            &body,
            self.max_retries,
        )
        .await?;

        let embeddings = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("invalid Cohere response: missing embeddings"))?;

        let vectors: Vec<Vec<f32>> = embeddings
            .iter()
            .map(|row| {
                row.as_array()
                    .map(|a| a.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
                    .ok_or_else(|| anyhow!("invalid Cohere response: non-array embedding"))
            })
            .collect::<Result<_>>()?;

        if vectors.len() != texts.len() {
            bail!(
                "Cohere returned {} embeddings for {} inputs",
                vectors.len(),
                texts.len()
            );
        }

        let total_tokens = json
            .pointer("/meta/billed_units/input_tokens")
            .and_then(|t| t.as_u64())
            .map(|t| t as usize)
            .unwrap_or_else(|| texts.iter().map(|t| estimate_tokens(t)).sum());

        Ok(EmbedBatch {
            vectors,
            total_tokens,
        })
    }
}

// ============ Custom HTTP ============

/// Generic self-hosted provider.
///
/// Contract: `POST {endpoint}` with `{"texts": [...], "model": "..."}`,
/// response `{"embeddings": [[...], ...], "token_counts": [..]?}`. The
/// endpoint comes from the embedding facet when set, else from runtime
/// configuration.
pub struct CustomHttpProvider {
    client: reqwest::Client,
    default_endpoint: Option<String>,
    max_retries: u32,
}

impl CustomHttpProvider {
    pub fn new(client: reqwest::Client, settings: &ProvidersConfig) -> Self {
        Self {
            client,
            default_endpoint: settings.custom_endpoint.clone(),
            max_retries: settings.max_retries,
        }
    }

    fn endpoint_for<'a>(&'a self, facet: &'a EmbeddingFacet) -> Option<&'a str> {
        facet
            .endpoint
            .as_deref()
            .or(self.default_endpoint.as_deref())
    }
}

#[async_trait]
impl EmbeddingProvider for CustomHttpProvider {
    fn name(&self) -> &str {
        "custom"
    }

    fn is_available(&self, facet: &EmbeddingFacet) -> bool {
        self.endpoint_for(facet).is_some()
    }

    async fn embed_batch(&self, texts: &[String], facet: &EmbeddingFacet) -> Result<EmbedBatch> {
        let endpoint = self
            .endpoint_for(facet)
            .ok_or_else(|| anyhow!("custom embedding provider has no endpoint configured"))?;

        let body = serde_json::json!({
            "texts": texts,
            "model": facet.model,
        });

        let json = post_json_with_retry(&self.client, endpoint, None, &body, self.max_retries).await?;

        let embeddings = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("invalid custom provider response: missing embeddings"))?;

        let vectors: Vec<Vec<f32>> = embeddings
            .iter()
            .map(|row| {
                row.as_array()
                    .map(|a| a.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
                    .ok_or_else(|| anyhow!("invalid custom provider response: non-array embedding"))
            })
            .collect::<Result<_>>()?;

        if vectors.len() != texts.len() {
            bail!(
                "custom provider returned {} embeddings for {} inputs",
                vectors.len(),
                texts.len()
            );
        }

        let total_tokens = json
            .get("token_counts")
            .and_then(|t| t.as_array())
            .map(|counts| counts.iter().filter_map(|c| c.as_u64()).sum::<u64>() as usize)
            .unwrap_or_else(|| texts.iter().map(|t| estimate_tokens(t)).sum());

        Ok(EmbedBatch {
            vectors,
            total_tokens,
        })
    }
}

// ============ Gateway ============

/// Multi-provider embedding client with ordered fallback.
pub struct EmbeddingGateway {
    providers: Vec<Box<dyn EmbeddingProvider>>,
}

impl EmbeddingGateway {
    /// Build the standard provider set from runtime configuration.
    pub fn from_settings(settings: &ProvidersConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;

        Ok(Self {
            providers: vec![
                Box::new(OpenAiProvider::new(client.clone(), settings)),
                Box::new(CohereProvider::new(client.clone(), settings)),
                Box::new(CustomHttpProvider::new(client, settings)),
            ],
        })
    }

    /// Build a gateway over an explicit provider set (tests, embedded use).
    pub fn with_providers(providers: Vec<Box<dyn EmbeddingProvider>>) -> Self {
        Self { providers }
    }

    /// Embed a batch of texts, splitting into `batch_size` sub-batches and
    /// concatenating vectors in input order. Tries the facet's provider
    /// first, then the fixed fallback order minus the one already tried.
    pub async fn embed_batch_with_config(
        &self,
        texts: &[String],
        facet: &EmbeddingFacet,
    ) -> Result<GatewayResult> {
        if texts.is_empty() {
            return Ok(GatewayResult {
                vectors: Vec::new(),
                total_tokens: 0,
                provider_used: facet.provider.clone(),
            });
        }

        let mut order: Vec<&str> = vec![facet.provider.as_str()];
        for name in FALLBACK_ORDER {
            if name != facet.provider {
                order.push(name);
            }
        }

        let batch_size = facet.batch_size.max(1);
        let mut last_err: Option<anyhow::Error> = None;

        for name in order {
            let Some(provider) = self.providers.iter().find(|p| p.name() == name) else {
                continue;
            };
            if !provider.is_available(facet) {
                debug!(provider = name, "embedding provider unavailable, skipping");
                continue;
            }

            match embed_in_sub_batches(provider.as_ref(), texts, facet, batch_size).await {
                Ok((vectors, total_tokens)) => {
                    return Ok(GatewayResult {
                        vectors,
                        total_tokens,
                        provider_used: name.to_string(),
                    });
                }
                Err(e) => {
                    warn!(provider = name, error = %e, "embedding provider failed, trying next");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("no embedding provider available")))
    }

    /// Embed a single query text.
    pub async fn embed_query(&self, text: &str, facet: &EmbeddingFacet) -> Result<Vec<f32>> {
        let result = self
            .embed_batch_with_config(&[text.to_string()], facet)
            .await?;
        result
            .vectors
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("empty embedding response"))
    }
}

/// Sequential sub-batch loop for one provider. Vectors are concatenated in
/// input order; a failed sub-batch fails the whole provider attempt.
async fn embed_in_sub_batches(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    facet: &EmbeddingFacet,
    batch_size: usize,
) -> Result<(Vec<Vec<f32>>, usize)> {
    let mut vectors = Vec::with_capacity(texts.len());
    let mut total_tokens = 0usize;

    for sub in texts.chunks(batch_size) {
        let batch = provider.embed_batch(sub, facet).await?;
        if batch.vectors.len() != sub.len() {
            bail!(
                "provider {} returned {} vectors for {} inputs",
                provider.name(),
                batch.vectors.len(),
                sub.len()
            );
        }
        vectors.extend(batch.vectors);
        total_tokens += batch.total_tokens;
    }

    Ok((vectors, total_tokens))
}

// ============ Vector codec ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}


#[cfg(test)]
mod tests {
    use super::test_support::StubProvider;
    use super::*;

    fn facet(provider: &str, batch_size: usize) -> EmbeddingFacet {
        EmbeddingFacet {
            provider: provider.to_string(),
            batch_size,
            dimensions: 8,
            ..Default::default()
        }
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("text number {}", i)).collect()
    }

    #[tokio::test]
    async fn test_fallback_reaches_third_provider() {
        // First unavailable, second available but erroring, third healthy.
        let gateway = EmbeddingGateway::with_providers(vec![
            Box::new(StubProvider::new("openai", false, false)),
            Box::new(StubProvider::new("cohere", true, true)),
            Box::new(StubProvider::new("custom", true, false)),
        ]);

        let result = gateway
            .embed_batch_with_config(&texts(3), &facet("openai", 64))
            .await
            .unwrap();
        assert_eq!(result.provider_used, "custom");
        assert_eq!(result.vectors.len(), 3);
    }

    #[tokio::test]
    async fn test_configured_provider_tried_first() {
        let gateway = EmbeddingGateway::with_providers(vec![
            Box::new(StubProvider::new("openai", true, false)),
            Box::new(StubProvider::new("cohere", true, false)),
        ]);

        let result = gateway
            .embed_batch_with_config(&texts(2), &facet("cohere", 64))
            .await
            .unwrap();
        assert_eq!(result.provider_used, "cohere");
    }

    #[tokio::test]
    async fn test_all_providers_fail_surfaces_last_error() {
        let gateway = EmbeddingGateway::with_providers(vec![
            Box::new(StubProvider::new("openai", true, true)),
            Box::new(StubProvider::new("cohere", false, false)),
            Box::new(StubProvider::new("custom", true, true)),
        ]);

        let err = gateway
            .embed_batch_with_config(&texts(1), &facet("openai", 64))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("custom"));
    }

    #[tokio::test]
    async fn test_sub_batches_split_and_preserve_order() {
        let provider = Box::new(StubProvider::new("openai", true, false));
        let gateway = EmbeddingGateway::with_providers(vec![provider]);

        let input = texts(5);
        let result = gateway
            .embed_batch_with_config(&input, &facet("openai", 2))
            .await
            .unwrap();

        assert_eq!(result.vectors.len(), 5);
        // Concatenation must match input order
        for (text, vec) in input.iter().zip(result.vectors.iter()) {
            assert_eq!(vec, &test_support::stub_vector(text, 8));
        }
    }

    #[test]
    fn test_custom_provider_availability_honors_facet_endpoint() {
        let settings = crate::config::ProvidersConfig::default();
        let provider = CustomHttpProvider::new(reqwest::Client::new(), &settings);

        let mut f = facet("custom", 64);
        assert!(!provider.is_available(&f));

        f.endpoint = Some("http://localhost:9831/embed".to_string());
        assert!(provider.is_available(&f));
    }

    #[tokio::test]
    async fn test_gateway_uses_facet_endpoint_without_deployment_config() {
        use axum::{routing::post, Json, Router};

        async fn embed(Json(body): Json<serde_json::Value>) -> Json<serde_json::Value> {
            let n = body["texts"].as_array().map(|t| t.len()).unwrap_or(0);
            Json(serde_json::json!({ "embeddings": vec![vec![0.5f32; 4]; n] }))
        }

        let app = Router::new().route("/embed", post(embed));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // No custom_endpoint in deployment settings; only the facet carries one
        let settings = crate::config::ProvidersConfig::default();
        let gateway = EmbeddingGateway::with_providers(vec![Box::new(CustomHttpProvider::new(
            reqwest::Client::new(),
            &settings,
        ))]);

        let mut f = facet("custom", 64);
        f.endpoint = Some(format!("http://{}/embed", addr));

        let result = gateway
            .embed_batch_with_config(&texts(2), &f)
            .await
            .unwrap();
        assert_eq!(result.provider_used, "custom");
        assert_eq!(result.vectors.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_input_short_circuits() {
        let gateway = EmbeddingGateway::with_providers(vec![]);
        let result = gateway
            .embed_batch_with_config(&[], &facet("openai", 64))
            .await
            .unwrap();
        assert!(result.vectors.is_empty());
        assert_eq!(result.total_tokens, 0);
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob.len(), 20);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn test_cosine_bounds() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }
}
