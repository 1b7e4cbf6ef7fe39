//! Core data models used throughout ragkit.
//!
//! These types represent the knowledge bases, documents, chunks, permissions,
//! and jobs that flow through the ingestion and retrieval pipeline. Enum
//! variants map to lowercase codes in SQLite TEXT columns via `as_str`/`parse`.

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who can see a knowledge base without an explicit grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Private,
    Public,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Public => "public",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "private" => Ok(Visibility::Private),
            "public" => Ok(Visibility::Public),
            other => bail!("unknown visibility: {}", other),
        }
    }
}

/// Where a knowledge base's vectors live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Chunks and vectors stored in the local SQLite store.
    LocalVector,
    /// Mirrored from an external system; read-only for ingestion.
    ExternalSync,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::LocalVector => "local",
            BackendKind::ExternalSync => "external",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "local" => Ok(BackendKind::LocalVector),
            "external" => Ok(BackendKind::ExternalSync),
            other => bail!("unknown backend kind: {}", other),
        }
    }
}

/// Processing state of a document. Re-ingestion resets to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "pending" => Ok(DocumentStatus::Pending),
            "processing" => Ok(DocumentStatus::Processing),
            "completed" => Ok(DocumentStatus::Completed),
            "failed" => Ok(DocumentStatus::Failed),
            other => bail!("unknown document status: {}", other),
        }
    }
}

/// Permission level under the total order `Read < Write < Admin`.
///
/// `PartialOrd`/`Ord` derive on declaration order, so level sufficiency is
/// a plain `>=` comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    Read,
    Write,
    Admin,
}

impl PermissionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionLevel::Read => "read",
            PermissionLevel::Write => "write",
            PermissionLevel::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "read" => Ok(PermissionLevel::Read),
            "write" => Ok(PermissionLevel::Write),
            "admin" => Ok(PermissionLevel::Admin),
            other => bail!("unknown permission level: {}", other),
        }
    }
}

/// A permission-governed resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    KnowledgeBase,
    Instruction,
    Tool,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::KnowledgeBase => "knowledge_base",
            AssetType::Instruction => "instruction",
            AssetType::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "knowledge_base" => Ok(AssetType::KnowledgeBase),
            "instruction" => Ok(AssetType::Instruction),
            "tool" => Ok(AssetType::Tool),
            other => bail!("unknown asset type: {}", other),
        }
    }

    /// Table holding the asset rows of this type (for owner lookups and
    /// display-name enrichment).
    pub fn table(&self) -> &'static str {
        match self {
            AssetType::KnowledgeBase => "knowledge_bases",
            AssetType::Instruction => "instructions",
            AssetType::Tool => "tools",
        }
    }
}

/// How an access decision was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionSource {
    Owned,
    Shared,
    Public,
}

impl PermissionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionSource::Owned => "owned",
            PermissionSource::Shared => "shared",
            PermissionSource::Public => "public",
        }
    }
}

/// A named, access-controlled collection of documents and derived chunks.
#[derive(Debug, Clone)]
pub struct KnowledgeBase {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub visibility: Visibility,
    pub backend: BackendKind,
    pub status: String,
    pub document_count: i64,
    pub chunk_count: i64,
    pub total_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A file uploaded into a knowledge base. `status` is the only field the
/// ingestion pipeline mutates.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub kb_id: String,
    pub name: String,
    pub mime_type: String,
    pub status: DocumentStatus,
    pub error: Option<String>,
    pub content_hash: String,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Free-form provenance carried by each chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

/// A stored chunk row. `kb_id` is denormalized from the document for
/// query locality; `embedding` is attached in a second write and may be
/// absent after a crash (such rows are excluded from search).
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: String,
    pub document_id: String,
    pub kb_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub start_char: i64,
    pub end_char: i64,
    pub token_count: i64,
    pub metadata: ChunkMetadata,
    pub embedding: Option<Vec<f32>>,
}

/// An explicit grant of access to one asset.
#[derive(Debug, Clone, Serialize)]
pub struct AssetPermission {
    pub id: String,
    pub account_id: String,
    pub asset_type: AssetType,
    pub asset_id: String,
    pub level: PermissionLevel,
    pub source: PermissionSource,
    pub expires_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

impl AssetPermission {
    /// A permission with a past expiry is treated as absent.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }
}

/// Status of an in-memory processing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Per-ingestion job record. Lives only in memory; superseded entries are
/// pruned by a size cap, not by time.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingJob {
    pub id: String,
    pub document_id: String,
    pub kb_id: String,
    pub account_id: String,
    pub status: JobStatus,
    /// Integer progress, 0–100.
    pub progress: u8,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_level_order() {
        assert!(PermissionLevel::Read < PermissionLevel::Write);
        assert!(PermissionLevel::Write < PermissionLevel::Admin);
        assert!(PermissionLevel::Admin >= PermissionLevel::Read);
    }

    #[test]
    fn test_enum_roundtrip() {
        for level in [
            PermissionLevel::Read,
            PermissionLevel::Write,
            PermissionLevel::Admin,
        ] {
            assert_eq!(PermissionLevel::parse(level.as_str()).unwrap(), level);
        }
        for status in [
            DocumentStatus::Pending,
            DocumentStatus::Processing,
            DocumentStatus::Completed,
            DocumentStatus::Failed,
        ] {
            assert_eq!(DocumentStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(PermissionLevel::parse("root").is_err());
    }

    #[test]
    fn test_permission_expiry() {
        let now = Utc::now();
        let perm = AssetPermission {
            id: "p1".to_string(),
            account_id: "acc1".to_string(),
            asset_type: AssetType::KnowledgeBase,
            asset_id: "kb1".to_string(),
            level: PermissionLevel::Read,
            source: PermissionSource::Shared,
            expires_at: Some(now - chrono::Duration::seconds(1)),
            note: None,
        };
        assert!(perm.is_expired(now));

        let open = AssetPermission {
            expires_at: None,
            ..perm.clone()
        };
        assert!(!open.is_expired(now));
    }
}
