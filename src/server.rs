//! HTTP API server.
//!
//! Callers authenticate with the `x-account-id` header; the server trusts it
//! and enforces asset-level permissions below that boundary. Every response
//! uses the `{success, data}` / `{success: false, message}` envelope.
//!
//! Routes:
//! - `GET  /health`
//! - `GET  /permissions/check?asset_type=&asset_id=&level=`
//! - `GET  /permissions/accessible?asset_type=&include_expired=`
//! - `POST /permissions/share`
//! - `DELETE /permissions/revoke`
//! - `GET  /config?kb_id=`
//! - `PUT  /config`
//! - `POST /knowledge-bases`
//! - `DELETE /knowledge-bases/{id}`
//! - `POST /knowledge-bases/{id}/documents`
//! - `POST /knowledge-bases/{id}/reprocess`
//! - `GET  /knowledge-bases/{id}/jobs`
//! - `GET  /jobs/{id}`
//! - `POST /tools/search_knowledge`

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::access::{AccessResolver, ListFilter};
use crate::config::Config;
use crate::db;
use crate::embedding::EmbeddingGateway;
use crate::ingest::{self, IngestionPipeline};
use crate::jobs::JobStore;
use crate::migrate;
use crate::models::{AssetType, PermissionLevel, Visibility};
use crate::ragconfig::{ConfigResolver, ConfigScope, RagConfigUpdate};
use crate::retrieval::RetrievalEngine;
use crate::tool;

pub struct AppState {
    pool: sqlx::SqlitePool,
    pub access: AccessResolver,
    pub configs: ConfigResolver,
    pub engine: RetrievalEngine,
    pub pipeline: IngestionPipeline,
}

impl AppState {
    pub fn new(pool: sqlx::SqlitePool, config: &Config) -> Result<Self> {
        let gateway = Arc::new(EmbeddingGateway::from_settings(&config.providers)?);
        let access = AccessResolver::new(pool.clone());
        let jobs = Arc::new(JobStore::new(config.ingest.job_cap));
        Ok(Self {
            configs: ConfigResolver::new(pool.clone()),
            engine: RetrievalEngine::new(pool.clone(), gateway.clone(), access.clone()),
            pipeline: IngestionPipeline::new(pool.clone(), gateway, jobs, config.ingest.concurrency),
            access,
            pool,
        })
    }

    /// Build state over an explicit gateway (tests run without credentials).
    pub fn with_gateway(
        pool: sqlx::SqlitePool,
        config: &Config,
        gateway: Arc<EmbeddingGateway>,
    ) -> Self {
        let access = AccessResolver::new(pool.clone());
        let jobs = Arc::new(JobStore::new(config.ingest.job_cap));
        Self {
            configs: ConfigResolver::new(pool.clone()),
            engine: RetrievalEngine::new(pool.clone(), gateway.clone(), access.clone()),
            pipeline: IngestionPipeline::new(pool.clone(), gateway, jobs, config.ingest.concurrency),
            access,
            pool,
        }
    }

    pub fn pool(&self) -> &sqlx::SqlitePool {
        &self.pool
    }
}

/// Run the server until the process is stopped.
pub async fn serve(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    let state = Arc::new(AppState::new(pool, config)?);

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "ragkit server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/permissions/check", get(permissions_check))
        .route("/permissions/accessible", get(permissions_accessible))
        .route("/permissions/share", post(permissions_share))
        .route("/permissions/revoke", delete(permissions_revoke))
        .route("/config", get(config_get))
        .route("/config", put(config_put))
        .route("/knowledge-bases", post(kb_create))
        .route("/knowledge-bases/{id}", delete(kb_delete))
        .route("/knowledge-bases/{id}/documents", post(document_ingest))
        .route("/knowledge-bases/{id}/reprocess", post(kb_reprocess))
        .route("/knowledge-bases/{id}/jobs", get(jobs_for_kb))
        .route("/jobs/{id}", get(job_get))
        .route("/tools/search_knowledge", post(tools_search_knowledge))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============ Envelope helpers ============

type ApiResult = std::result::Result<Json<Value>, (StatusCode, Json<Value>)>;

fn ok(data: Value) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

fn fail(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({ "success": false, "message": message.into() })),
    )
}

/// Map a handler error onto a status by its phrasing: permission denials are
/// the caller's fault, everything else is ours.
fn error_status(e: &anyhow::Error) -> StatusCode {
    let msg = e.to_string();
    if msg.contains("permission denied") {
        StatusCode::FORBIDDEN
    } else if msg.contains("not found") {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn internal(e: anyhow::Error) -> (StatusCode, Json<Value>) {
    fail(error_status(&e), format!("{:#}", e))
}

fn account_from(headers: &HeaderMap) -> std::result::Result<String, (StatusCode, Json<Value>)> {
    headers
        .get("x-account-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| fail(StatusCode::UNAUTHORIZED, "missing x-account-id header"))
}

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<Value>) {
    fail(StatusCode::BAD_REQUEST, message)
}

// ============ Handlers ============

async fn health() -> Json<Value> {
    ok(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct CheckParams {
    asset_type: String,
    asset_id: String,
    #[serde(default = "default_level")]
    level: String,
}

fn default_level() -> String {
    "read".to_string()
}

async fn permissions_check(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<CheckParams>,
) -> ApiResult {
    let account_id = account_from(&headers)?;
    let asset_type = AssetType::parse(&params.asset_type).map_err(|e| bad_request(e.to_string()))?;
    let level = PermissionLevel::parse(&params.level).map_err(|e| bad_request(e.to_string()))?;

    let decision = state
        .access
        .check_access(&account_id, asset_type, &params.asset_id, level)
        .await
        .map_err(internal)?;
    Ok(ok(serde_json::to_value(decision).map_err(|e| internal(e.into()))?))
}

#[derive(Deserialize)]
struct AccessibleParams {
    asset_type: Option<String>,
    #[serde(default)]
    include_expired: bool,
}

async fn permissions_accessible(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<AccessibleParams>,
) -> ApiResult {
    let account_id = account_from(&headers)?;
    let asset_type = params
        .asset_type
        .as_deref()
        .map(AssetType::parse)
        .transpose()
        .map_err(|e| bad_request(e.to_string()))?;

    let assets = state
        .access
        .list_accessible_assets(
            &account_id,
            &ListFilter {
                asset_type,
                include_expired: params.include_expired,
            },
        )
        .await
        .map_err(internal)?;
    Ok(ok(serde_json::to_value(assets).map_err(|e| internal(e.into()))?))
}

#[derive(Deserialize)]
struct ShareBody {
    grantee_id: String,
    asset_type: String,
    asset_id: String,
    level: String,
    expires_at: Option<DateTime<Utc>>,
    note: Option<String>,
}

async fn permissions_share(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ShareBody>,
) -> ApiResult {
    let account_id = account_from(&headers)?;
    let asset_type = AssetType::parse(&body.asset_type).map_err(|e| bad_request(e.to_string()))?;
    let level = PermissionLevel::parse(&body.level).map_err(|e| bad_request(e.to_string()))?;

    state
        .access
        .share_asset(
            &account_id,
            &body.grantee_id,
            asset_type,
            &body.asset_id,
            level,
            body.expires_at,
            body.note,
        )
        .await
        .map_err(internal)?;
    Ok(ok(json!({ "shared": true })))
}

#[derive(Deserialize)]
struct RevokeBody {
    grantee_id: String,
    asset_type: String,
    asset_id: String,
}

async fn permissions_revoke(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RevokeBody>,
) -> ApiResult {
    let account_id = account_from(&headers)?;
    let asset_type = AssetType::parse(&body.asset_type).map_err(|e| bad_request(e.to_string()))?;

    state
        .access
        .revoke_access(&account_id, &body.grantee_id, asset_type, &body.asset_id)
        .await
        .map_err(internal)?;
    Ok(ok(json!({ "revoked": true })))
}

#[derive(Deserialize)]
struct ConfigParams {
    kb_id: String,
}

async fn config_get(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<ConfigParams>,
) -> ApiResult {
    let account_id = account_from(&headers)?;

    let decision = state
        .access
        .check_access(
            &account_id,
            AssetType::KnowledgeBase,
            &params.kb_id,
            PermissionLevel::Read,
        )
        .await
        .map_err(internal)?;
    if !decision.granted {
        return Err(fail(StatusCode::FORBIDDEN, "permission denied: no read access"));
    }

    let config = state
        .configs
        .effective_config(&params.kb_id, &account_id)
        .await
        .map_err(internal)?;
    Ok(ok(serde_json::to_value(config).map_err(|e| internal(e.into()))?))
}

#[derive(Deserialize)]
struct ConfigPutBody {
    /// KB scope when set; the caller's account default otherwise.
    kb_id: Option<String>,
    #[serde(flatten)]
    update: RagConfigUpdate,
}

async fn config_put(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ConfigPutBody>,
) -> ApiResult {
    let account_id = account_from(&headers)?;

    let scope = match body.kb_id {
        Some(kb_id) => {
            let decision = state
                .access
                .check_access(
                    &account_id,
                    AssetType::KnowledgeBase,
                    &kb_id,
                    PermissionLevel::Admin,
                )
                .await
                .map_err(internal)?;
            if !decision.granted {
                return Err(fail(
                    StatusCode::FORBIDDEN,
                    "permission denied: admin access required to change configuration",
                ));
            }
            ConfigScope::KnowledgeBase(kb_id)
        }
        None => ConfigScope::AccountDefault(account_id),
    };

    state
        .configs
        .save_config(&scope, body.update)
        .await
        .map_err(internal)?;
    Ok(ok(json!({ "saved": true })))
}

#[derive(Deserialize)]
struct KbCreateBody {
    name: String,
    #[serde(default = "default_visibility")]
    visibility: String,
}

fn default_visibility() -> String {
    "private".to_string()
}

async fn kb_create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<KbCreateBody>,
) -> ApiResult {
    let account_id = account_from(&headers)?;
    let visibility =
        Visibility::parse(&body.visibility).map_err(|e| bad_request(e.to_string()))?;

    let kb = ingest::create_knowledge_base(state.pool(), &account_id, &body.name, visibility)
        .await
        .map_err(internal)?;
    Ok(ok(json!({ "id": kb.id, "name": kb.name })))
}

async fn kb_delete(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(kb_id): Path<String>,
) -> ApiResult {
    let account_id = account_from(&headers)?;

    let decision = state
        .access
        .check_access(
            &account_id,
            AssetType::KnowledgeBase,
            &kb_id,
            PermissionLevel::Admin,
        )
        .await
        .map_err(internal)?;
    if !decision.granted {
        return Err(fail(
            StatusCode::FORBIDDEN,
            "permission denied: admin access required to delete a knowledge base",
        ));
    }

    ingest::delete_knowledge_base(state.pool(), &kb_id)
        .await
        .map_err(internal)?;
    Ok(ok(json!({ "deleted": true })))
}

#[derive(Deserialize)]
struct DocumentBody {
    name: String,
    #[serde(default = "default_mime")]
    mime_type: String,
    content: String,
}

fn default_mime() -> String {
    "text/plain".to_string()
}

/// Store a document and process it in the background. The response carries
/// the document id; progress is polled via `GET /knowledge-bases/{id}/jobs`.
async fn document_ingest(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(kb_id): Path<String>,
    Json(body): Json<DocumentBody>,
) -> ApiResult {
    let account_id = account_from(&headers)?;

    let decision = state
        .access
        .check_access(
            &account_id,
            AssetType::KnowledgeBase,
            &kb_id,
            PermissionLevel::Write,
        )
        .await
        .map_err(internal)?;
    if !decision.granted {
        return Err(fail(
            StatusCode::FORBIDDEN,
            "permission denied: write access required to ingest documents",
        ));
    }

    let doc = ingest::add_document(
        state.pool(),
        &kb_id,
        &body.name,
        &body.mime_type,
        body.content.as_bytes(),
    )
    .await
    .map_err(internal)?;

    let pipeline = state.pipeline.clone();
    let doc_id = doc.id.clone();
    tokio::spawn(async move {
        // Failure is recorded on the document row and its job
        let _ = pipeline.process_document(&doc_id).await;
    });

    Ok(ok(json!({ "document_id": doc.id, "status": "pending" })))
}

/// Re-run the full pipeline over every document in the KB, typically after a
/// configuration change. Runs in the background; progress is polled via
/// `GET /knowledge-bases/{id}/jobs`.
async fn kb_reprocess(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(kb_id): Path<String>,
) -> ApiResult {
    let account_id = account_from(&headers)?;

    let decision = state
        .access
        .check_access(
            &account_id,
            AssetType::KnowledgeBase,
            &kb_id,
            PermissionLevel::Admin,
        )
        .await
        .map_err(internal)?;
    if !decision.granted {
        return Err(fail(
            StatusCode::FORBIDDEN,
            "permission denied: admin access required to reprocess a knowledge base",
        ));
    }

    let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE kb_id = ?")
        .bind(&kb_id)
        .fetch_one(state.pool())
        .await
        .map_err(|e| internal(e.into()))?;

    let pipeline = state.pipeline.clone();
    let kb = kb_id.clone();
    tokio::spawn(async move {
        // Per-document failures are recorded on the document rows and jobs
        let _ = pipeline.reprocess_knowledge_base(&kb).await;
    });

    Ok(ok(json!({ "documents": documents, "status": "pending" })))
}

async fn jobs_for_kb(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(kb_id): Path<String>,
) -> ApiResult {
    let account_id = account_from(&headers)?;

    let decision = state
        .access
        .check_access(
            &account_id,
            AssetType::KnowledgeBase,
            &kb_id,
            PermissionLevel::Read,
        )
        .await
        .map_err(internal)?;
    if !decision.granted {
        return Err(fail(StatusCode::FORBIDDEN, "permission denied: no read access"));
    }

    let jobs = state.pipeline.jobs().list_for_kb(&kb_id);
    Ok(ok(serde_json::to_value(jobs).map_err(|e| internal(e.into()))?))
}

async fn job_get(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> ApiResult {
    let account_id = account_from(&headers)?;

    match state.pipeline.jobs().get(&job_id) {
        Some(job) if job.account_id == account_id => {
            Ok(ok(serde_json::to_value(job).map_err(|e| internal(e.into()))?))
        }
        _ => Err(fail(StatusCode::NOT_FOUND, "job not found")),
    }
}

#[derive(Deserialize)]
struct SearchBody {
    query: String,
    kb_ids: Option<Vec<String>>,
}

async fn tools_search_knowledge(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SearchBody>,
) -> ApiResult {
    let account_id = account_from(&headers)?;

    let response = tool::search_knowledge(
        &state.engine,
        &account_id,
        &body.query,
        body.kb_ids.as_deref(),
    )
    .await
    .map_err(internal)?;
    Ok(ok(serde_json::to_value(response).map_err(|e| internal(e.into()))?))
}
