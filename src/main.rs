//! # ragkit CLI
//!
//! Commands for database initialization, knowledge-base management, document
//! ingestion, search, and starting the API server.
//!
//! ## Usage
//!
//! ```bash
//! ragkit --config ./ragkit.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragkit init` | Create the SQLite database and run schema migrations |
//! | `ragkit serve` | Start the REST API server |
//! | `ragkit kb create <name>` | Create a knowledge base |
//! | `ragkit kb list` | List knowledge bases accessible to the account |
//! | `ragkit kb delete <id>` | Delete a knowledge base and its contents |
//! | `ragkit kb reprocess <id>` | Re-chunk and re-embed every document |
//! | `ragkit ingest <kb-id> <file>` | Ingest a local file into a knowledge base |
//! | `ragkit search "<query>"` | Search accessible knowledge bases |
//! | `ragkit config show <kb-id>` | Print the effective RAG configuration |
//! | `ragkit config set <kb-id>` | Overwrite configuration facets |
//!
//! All commands act on behalf of the account given with `--account`
//! (the same identity the server reads from the `x-account-id` header).

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use ragkit::access::{AccessResolver, ListFilter};
use ragkit::embedding::EmbeddingGateway;
use ragkit::ingest::{self, IngestionPipeline};
use ragkit::jobs::JobStore;
use ragkit::models::{AssetType, Visibility};
use ragkit::ragconfig::{
    ConfigResolver, ConfigScope, EmbeddingFacet, RagConfigUpdate, RetrievalFacet,
};
use ragkit::retrieval::RetrievalEngine;
use ragkit::{config, db, migrate, server};

/// ragkit — multi-tenant knowledge-base ingestion and retrieval engine.
#[derive(Parser)]
#[command(
    name = "ragkit",
    about = "Multi-tenant knowledge-base ingestion and retrieval engine",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./ragkit.toml")]
    config: PathBuf,

    /// Account to act as (asset owner / search identity).
    #[arg(long, global = true, default_value = "local")]
    account: String,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Idempotent —
    /// running it multiple times is safe.
    Init,

    /// Start the REST API server.
    ///
    /// Binds to the address configured in `[server].bind`.
    Serve,

    /// Manage knowledge bases.
    Kb {
        #[command(subcommand)]
        action: KbAction,
    },

    /// Ingest a local file into a knowledge base.
    ///
    /// Parses, chunks, and embeds the file, then stores the chunks. The MIME
    /// type is guessed from the file extension (`.pdf` → PDF, else text).
    Ingest {
        /// Target knowledge base id.
        kb_id: String,

        /// Path to the file to ingest.
        file: PathBuf,
    },

    /// Search accessible knowledge bases.
    Search {
        /// The search query string.
        query: String,

        /// Restrict the search to one knowledge base.
        #[arg(long)]
        kb: Option<String>,
    },

    /// Show or change a knowledge base's RAG configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Knowledge-base management subcommands.
#[derive(Subcommand)]
enum KbAction {
    /// Create a knowledge base owned by the acting account.
    Create {
        /// Display name.
        name: String,

        /// Make the knowledge base readable by everyone.
        #[arg(long)]
        public: bool,
    },

    /// List knowledge bases the acting account can access.
    List,

    /// Delete a knowledge base, its documents, and its chunks.
    Delete {
        /// Knowledge base id.
        id: String,
    },

    /// Re-run parse, chunk, and embed over every document in a knowledge
    /// base. Use after changing its chunking or embedding configuration.
    Reprocess {
        /// Knowledge base id.
        id: String,
    },
}

/// Configuration subcommands.
#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration for a knowledge base.
    Show {
        /// Knowledge base id.
        kb_id: String,
    },

    /// Overwrite facets of a knowledge base's configuration.
    ///
    /// Embedding flags replace the embedding facet, retrieval flags the
    /// retrieval facet; facets with no flag given are left untouched.
    Set {
        /// Knowledge base id.
        kb_id: String,

        /// Embedding provider (`openai`, `cohere`, `custom`).
        #[arg(long)]
        provider: Option<String>,

        /// Endpoint for the custom provider.
        #[arg(long)]
        endpoint: Option<String>,

        /// Minimum similarity score for retrieval.
        #[arg(long)]
        min_score: Option<f32>,

        /// Maximum chunks returned by a search.
        #[arg(long)]
        top_k: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ragkit=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::serve(&cfg).await?;
        }
        Commands::Kb { action } => match action {
            KbAction::Create { name, public } => {
                let pool = db::connect(&cfg).await?;
                migrate::run_migrations(&pool).await?;
                let visibility = if public {
                    Visibility::Public
                } else {
                    Visibility::Private
                };
                let kb =
                    ingest::create_knowledge_base(&pool, &cli.account, &name, visibility).await?;
                println!("Created knowledge base {} ({})", kb.name, kb.id);
            }
            KbAction::List => {
                let pool = db::connect(&cfg).await?;
                let access = AccessResolver::new(pool);
                let assets = access
                    .list_accessible_assets(
                        &cli.account,
                        &ListFilter {
                            asset_type: Some(AssetType::KnowledgeBase),
                            include_expired: false,
                        },
                    )
                    .await?;
                if assets.is_empty() {
                    println!("No accessible knowledge bases.");
                }
                for asset in assets {
                    println!(
                        "{}  {}  [{} via {}]",
                        asset.asset_id,
                        asset.name,
                        asset.level.as_str(),
                        asset.source.as_str()
                    );
                }
            }
            KbAction::Delete { id } => {
                let pool = db::connect(&cfg).await?;
                ingest::delete_knowledge_base(&pool, &id).await?;
                println!("Deleted knowledge base {}", id);
            }
            KbAction::Reprocess { id } => {
                let pool = db::connect(&cfg).await?;
                let gateway = Arc::new(EmbeddingGateway::from_settings(&cfg.providers)?);
                let jobs = Arc::new(JobStore::new(cfg.ingest.job_cap));
                let pipeline = IngestionPipeline::new(pool, gateway, jobs, cfg.ingest.concurrency);

                let outcomes = pipeline.reprocess_knowledge_base(&id).await?;
                let failed = outcomes.iter().filter(|(_, r)| r.is_err()).count();
                println!(
                    "Reprocessed {} of {} documents in {}",
                    outcomes.len() - failed,
                    outcomes.len(),
                    id
                );
                for (doc_id, result) in &outcomes {
                    if let Err(e) = result {
                        eprintln!("  {} failed: {:#}", doc_id, e);
                    }
                }
            }
        },
        Commands::Ingest { kb_id, file } => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;

            let bytes = std::fs::read(&file)?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "document".to_string());
            let mime_type = match file.extension().and_then(|e| e.to_str()) {
                Some("pdf") => "application/pdf",
                Some("md") => "text/markdown",
                _ => "text/plain",
            };

            let doc = ingest::add_document(&pool, &kb_id, &name, mime_type, &bytes).await?;

            let gateway = Arc::new(EmbeddingGateway::from_settings(&cfg.providers)?);
            let jobs = Arc::new(JobStore::new(cfg.ingest.job_cap));
            let pipeline = IngestionPipeline::new(pool, gateway, jobs, cfg.ingest.concurrency);
            pipeline.process_document(&doc.id).await?;
            println!("Ingested {} into {}", name, kb_id);
        }
        Commands::Search { query, kb } => {
            let pool = db::connect(&cfg).await?;
            let gateway = Arc::new(EmbeddingGateway::from_settings(&cfg.providers)?);
            let access = AccessResolver::new(pool.clone());
            let engine = RetrievalEngine::new(pool, gateway, access);

            let kb_filter = kb.map(|id| vec![id]);
            let results = engine
                .search(&cli.account, &query, kb_filter.as_deref())
                .await?;

            if results.chunks.is_empty() {
                println!("No results.");
            }
            for chunk in &results.chunks {
                println!(
                    "[{:.3}] {} — {}",
                    chunk.score,
                    chunk.document_name,
                    first_line(&chunk.text, 100)
                );
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show { kb_id } => {
                let pool = db::connect(&cfg).await?;
                let resolver = ConfigResolver::new(pool);
                let config = resolver.effective_config(&kb_id, &cli.account).await?;
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Set {
                kb_id,
                provider,
                endpoint,
                min_score,
                top_k,
            } => {
                let pool = db::connect(&cfg).await?;
                let resolver = ConfigResolver::new(pool);

                let embedding = if provider.is_some() || endpoint.is_some() {
                    let mut facet = EmbeddingFacet::default();
                    if let Some(provider) = provider {
                        facet.provider = provider;
                    }
                    facet.endpoint = endpoint;
                    Some(facet)
                } else {
                    None
                };
                let retrieval = if min_score.is_some() || top_k.is_some() {
                    let mut facet = RetrievalFacet::default();
                    if let Some(min_score) = min_score {
                        facet.min_score = min_score;
                    }
                    if let Some(top_k) = top_k {
                        facet.top_k = top_k;
                    }
                    Some(facet)
                } else {
                    None
                };

                resolver
                    .save_config(
                        &ConfigScope::KnowledgeBase(kb_id.clone()),
                        RagConfigUpdate {
                            embedding,
                            retrieval,
                            ..Default::default()
                        },
                    )
                    .await?;
                println!("Updated configuration for {}", kb_id);
            }
        },
    }

    Ok(())
}

fn first_line(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    line.chars().take(max_chars).collect()
}
