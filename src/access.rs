//! Asset access resolution.
//!
//! Resolves whether an account may read/write/administer an asset
//! (knowledge base, instruction set, or tool). Resolution order, first match
//! wins: cached entry younger than the TTL → owner (implicit admin) → public
//! visibility (implicit read) → unexpired explicit grant → denied.
//!
//! Every resolution, including denials, is cached keyed by
//! `(account, asset_type, asset_id)`. The cache is an injected service
//! ([`TtlCache`]) rather than a global so a multi-process deployment can swap
//! the backing store without touching call sites. Mutations (`share_asset`,
//! `revoke_access`) eagerly invalidate every entry referencing the mutated
//! asset regardless of grantee, so correctness never depends on TTL expiry
//! alone.
//!
//! Denials are values, not errors: [`AccessDecision::granted`] is false and
//! callers decide what to do. Only the admin pre-check on mutations raises.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::models::{AssetType, PermissionLevel, PermissionSource};

/// How long a cached resolution stays valid.
pub const CACHE_TTL: Duration = Duration::from_secs(5 * 60);
/// Cap on retained cache entries.
const CACHE_CAP: usize = 10_000;

/// Outcome of a `check_access` call.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AccessDecision {
    pub granted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<PermissionLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PermissionSource>,
}

/// The cached, request-independent part of a resolution: the level the
/// account holds (if any) and where it came from. Sufficiency against a
/// required level is computed per call, which makes access monotonic by
/// construction.
#[derive(Debug, Clone, Copy)]
struct Resolution {
    level: Option<PermissionLevel>,
    source: Option<PermissionSource>,
}

impl Resolution {
    const DENIED: Resolution = Resolution {
        level: None,
        source: None,
    };

    fn decide(&self, required: PermissionLevel) -> AccessDecision {
        AccessDecision {
            granted: self.level.is_some_and(|l| l >= required),
            level: self.level,
            source: self.source,
        }
    }
}

// ============ TTL cache ============

struct CacheEntry {
    resolution: Resolution,
    inserted_at: Instant,
}

/// Expiring key→resolution map. Entries are immutable once written and
/// replacement is idempotent, so last-writer-wins under concurrency is safe.
pub struct TtlCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    cap: usize,
}

impl TtlCache {
    pub fn new(ttl: Duration, cap: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            cap,
        }
    }

    fn get(&self, key: &str) -> Option<Resolution> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(key)?;
        if entry.inserted_at.elapsed() >= self.ttl {
            return None;
        }
        Some(entry.resolution)
    }

    fn insert(&self, key: String, resolution: Resolution) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.cap {
            entries.retain(|_, e| e.inserted_at.elapsed() < self.ttl);
            if entries.len() >= self.cap {
                entries.clear();
            }
        }
        entries.insert(
            key,
            CacheEntry {
                resolution,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop every entry whose key contains `fragment` (asset-scoped
    /// invalidation regardless of grantee).
    fn invalidate_containing(&self, fragment: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|k, _| !k.contains(fragment));
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new(CACHE_TTL, CACHE_CAP)
    }
}

fn cache_key(account_id: &str, asset_type: AssetType, asset_id: &str) -> String {
    format!("{}:{}", account_id, asset_fragment(asset_type, asset_id))
}

fn asset_fragment(asset_type: AssetType, asset_id: &str) -> String {
    format!("{}:{}", asset_type.as_str(), asset_id)
}

// ============ Resolver ============

/// An asset an account can reach, with display name for listings.
#[derive(Debug, Clone, Serialize)]
pub struct AccessibleAsset {
    pub asset_type: AssetType,
    pub asset_id: String,
    pub name: String,
    pub level: PermissionLevel,
    pub source: PermissionSource,
}

/// Filters for [`AccessResolver::list_accessible_assets`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Restrict to one asset type; `None` lists all three.
    pub asset_type: Option<AssetType>,
    /// Include grants whose expiry has passed.
    pub include_expired: bool,
}

#[derive(Clone)]
pub struct AccessResolver {
    pool: SqlitePool,
    cache: Arc<TtlCache>,
}

impl AccessResolver {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_cache(pool, Arc::new(TtlCache::default()))
    }

    /// Inject a cache (shorter TTL in tests, shared instance across services).
    pub fn with_cache(pool: SqlitePool, cache: Arc<TtlCache>) -> Self {
        Self { pool, cache }
    }

    /// Resolve whether `account_id` holds `required` on the asset.
    pub async fn check_access(
        &self,
        account_id: &str,
        asset_type: AssetType,
        asset_id: &str,
        required: PermissionLevel,
    ) -> Result<AccessDecision> {
        let key = cache_key(account_id, asset_type, asset_id);
        if let Some(resolution) = self.cache.get(&key) {
            return Ok(resolution.decide(required));
        }

        let resolution = self.resolve(account_id, asset_type, asset_id).await?;
        self.cache.insert(key, resolution);
        Ok(resolution.decide(required))
    }

    async fn resolve(
        &self,
        account_id: &str,
        asset_type: AssetType,
        asset_id: &str,
    ) -> Result<Resolution> {
        // Owner and visibility live on the asset row itself
        let asset_row = sqlx::query(&format!(
            "SELECT account_id, visibility FROM {} WHERE id = ?",
            asset_type.table()
        ))
        .bind(asset_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = asset_row else {
            return Ok(Resolution::DENIED);
        };

        let owner: String = row.get("account_id");
        if owner == account_id {
            return Ok(Resolution {
                level: Some(PermissionLevel::Admin),
                source: Some(PermissionSource::Owned),
            });
        }

        let visibility: String = row.get("visibility");
        if visibility == "public" {
            return Ok(Resolution {
                level: Some(PermissionLevel::Read),
                source: Some(PermissionSource::Public),
            });
        }

        // Unexpired explicit grant
        let grant = sqlx::query(
            r#"
            SELECT level, expires_at FROM asset_permissions
            WHERE account_id = ? AND asset_type = ? AND asset_id = ?
            "#,
        )
        .bind(account_id)
        .bind(asset_type.as_str())
        .bind(asset_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = grant {
            let expires_at: Option<i64> = row.get("expires_at");
            let expired = expires_at.is_some_and(|ts| ts <= Utc::now().timestamp());
            if !expired {
                let level: String = row.get("level");
                return Ok(Resolution {
                    level: Some(PermissionLevel::parse(&level)?),
                    source: Some(PermissionSource::Shared),
                });
            }
        }

        Ok(Resolution::DENIED)
    }

    /// Grant `grantee` a level on an asset. The caller must hold admin on
    /// the asset — resolved through this same resolver.
    #[allow(clippy::too_many_arguments)]
    pub async fn share_asset(
        &self,
        caller_id: &str,
        grantee_id: &str,
        asset_type: AssetType,
        asset_id: &str,
        level: PermissionLevel,
        expires_at: Option<DateTime<Utc>>,
        note: Option<String>,
    ) -> Result<()> {
        let decision = self
            .check_access(caller_id, asset_type, asset_id, PermissionLevel::Admin)
            .await?;
        if !decision.granted {
            bail!("permission denied: admin access required to share this asset");
        }

        sqlx::query(
            r#"
            INSERT INTO asset_permissions (id, account_id, asset_type, asset_id, level, source, expires_at, note, created_at)
            VALUES (?, ?, ?, ?, ?, 'shared', ?, ?, ?)
            ON CONFLICT(account_id, asset_type, asset_id) DO UPDATE SET
                level = excluded.level,
                expires_at = excluded.expires_at,
                note = excluded.note
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(grantee_id)
        .bind(asset_type.as_str())
        .bind(asset_id)
        .bind(level.as_str())
        .bind(expires_at.map(|t| t.timestamp()))
        .bind(note)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        // Stale grants must not outlive the mutation
        self.cache
            .invalidate_containing(&asset_fragment(asset_type, asset_id));
        Ok(())
    }

    /// Remove `grantee`'s explicit grant on an asset. Caller must hold admin.
    pub async fn revoke_access(
        &self,
        caller_id: &str,
        grantee_id: &str,
        asset_type: AssetType,
        asset_id: &str,
    ) -> Result<()> {
        let decision = self
            .check_access(caller_id, asset_type, asset_id, PermissionLevel::Admin)
            .await?;
        if !decision.granted {
            bail!("permission denied: admin access required to revoke access");
        }

        sqlx::query(
            "DELETE FROM asset_permissions WHERE account_id = ? AND asset_type = ? AND asset_id = ?",
        )
        .bind(grantee_id)
        .bind(asset_type.as_str())
        .bind(asset_id)
        .execute(&self.pool)
        .await?;

        self.cache
            .invalidate_containing(&asset_fragment(asset_type, asset_id));
        Ok(())
    }

    /// Union of owned and shared assets, per requested type. Shared entries
    /// are enriched with the display name from the owning table.
    pub async fn list_accessible_assets(
        &self,
        account_id: &str,
        filter: &ListFilter,
    ) -> Result<Vec<AccessibleAsset>> {
        let types: Vec<AssetType> = match filter.asset_type {
            Some(t) => vec![t],
            None => vec![AssetType::KnowledgeBase, AssetType::Instruction, AssetType::Tool],
        };

        let mut assets = Vec::new();

        for asset_type in types {
            let owned = sqlx::query(&format!(
                "SELECT id, name FROM {} WHERE account_id = ? ORDER BY name",
                asset_type.table()
            ))
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;

            for row in owned {
                assets.push(AccessibleAsset {
                    asset_type,
                    asset_id: row.get("id"),
                    name: row.get("name"),
                    level: PermissionLevel::Admin,
                    source: PermissionSource::Owned,
                });
            }

            let shared = sqlx::query(&format!(
                r#"
                SELECT p.asset_id, p.level, p.expires_at, a.name
                FROM asset_permissions p
                JOIN {} a ON a.id = p.asset_id
                WHERE p.account_id = ? AND p.asset_type = ?
                ORDER BY a.name
                "#,
                asset_type.table()
            ))
            .bind(account_id)
            .bind(asset_type.as_str())
            .fetch_all(&self.pool)
            .await?;

            let now = Utc::now().timestamp();
            for row in shared {
                let expires_at: Option<i64> = row.get("expires_at");
                if !filter.include_expired && expires_at.is_some_and(|ts| ts <= now) {
                    continue;
                }
                let level: String = row.get("level");
                assets.push(AccessibleAsset {
                    asset_type,
                    asset_id: row.get("asset_id"),
                    name: row.get("name"),
                    level: PermissionLevel::parse(&level)?,
                    source: PermissionSource::Shared,
                });
            }
        }

        Ok(assets)
    }
}
