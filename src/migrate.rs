use anyhow::Result;
use sqlx::SqlitePool;

/// Create the full schema. Idempotent — safe to run on every startup.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Knowledge bases with denormalized usage counters
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS knowledge_bases (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            name TEXT NOT NULL,
            visibility TEXT NOT NULL DEFAULT 'private',
            backend TEXT NOT NULL DEFAULT 'local',
            status TEXT NOT NULL DEFAULT 'active',
            document_count INTEGER NOT NULL DEFAULT 0,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            total_bytes INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            kb_id TEXT NOT NULL,
            name TEXT NOT NULL,
            mime_type TEXT NOT NULL DEFAULT 'text/plain',
            content BLOB NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            error TEXT,
            content_hash TEXT NOT NULL,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (kb_id) REFERENCES knowledge_bases(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Chunks carry kb_id denormalized for the IN (kb_ids) search predicate.
    // The embedding BLOB is attached after row insertion and may be NULL.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            kb_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            start_char INTEGER NOT NULL,
            end_char INTEGER NOT NULL,
            token_count INTEGER NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            embedding BLOB,
            UNIQUE(document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One row per KB, or one account-default row per account, enforced below
    // by partial unique indexes.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rag_configurations (
            id TEXT PRIMARY KEY,
            kb_id TEXT,
            account_id TEXT,
            is_account_default INTEGER NOT NULL DEFAULT 0,
            chunking_json TEXT,
            embedding_json TEXT,
            retrieval_json TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS asset_permissions (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            asset_type TEXT NOT NULL,
            asset_id TEXT NOT NULL,
            level TEXT NOT NULL,
            source TEXT NOT NULL DEFAULT 'shared',
            expires_at INTEGER,
            note TEXT,
            created_at INTEGER NOT NULL,
            UNIQUE(account_id, asset_type, asset_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Instruction sets and tools are external assets; only their identity and
    // owner matter to the access resolver.
    for table in ["instructions", "tools"] {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                name TEXT NOT NULL,
                visibility TEXT NOT NULL DEFAULT 'private',
                created_at INTEGER NOT NULL
            )
            "#,
            table
        ))
        .execute(pool)
        .await?;
    }

    // Indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_kb ON documents(kb_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_kb ON chunks(kb_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_permissions_asset ON asset_permissions(asset_type, asset_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_kb_account ON knowledge_bases(account_id)")
        .execute(pool)
        .await?;

    // At most one configuration row per knowledge base
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_ragcfg_kb ON rag_configurations(kb_id) WHERE kb_id IS NOT NULL",
    )
    .execute(pool)
    .await?;
    // At most one account-default row per account
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_ragcfg_account_default ON rag_configurations(account_id) WHERE is_account_default = 1",
    )
    .execute(pool)
    .await?;

    Ok(())
}
