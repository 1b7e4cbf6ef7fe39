//! # ragkit
//!
//! A multi-tenant knowledge-base ingestion and retrieval engine.
//!
//! ragkit stores documents in per-account knowledge bases, chunks and embeds
//! them through a multi-provider gateway, and serves permission-filtered
//! semantic search via a REST API, an agent tool call, and a CLI.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌──────────┐
//! │ Documents │──▶│   Pipeline    │──▶│  SQLite   │
//! │ txt/pdf   │   │ Chunk+Embed  │   │ chunks+vec│
//! └───────────┘   └──────────────┘   └────┬─────┘
//!                                         │
//!                  ┌─────────────┬────────┤
//!                  ▼             ▼        ▼
//!             ┌─────────┐  ┌─────────┐ ┌─────┐
//!             │  REST   │  │  tool   │ │ CLI │
//!             │ (axum)  │  │ adapter │ │     │
//!             └─────────┘  └─────────┘ └─────┘
//! ```
//!
//! Every read path is filtered through the access resolver: owner → public →
//! explicit grant, with a TTL cache in front. Chunking, embedding, and
//! retrieval settings cascade KB → account default → system default.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML runtime configuration |
//! | [`models`] | Core data types |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`access`] | Asset permission resolution with TTL cache |
//! | [`ragconfig`] | Cascading chunking/embedding/retrieval configuration |
//! | [`segment`] | Text chunking strategies |
//! | [`parse`] | Document text extraction |
//! | [`embedding`] | Embedding provider gateway with fallback |
//! | [`jobs`] | In-memory ingestion job tracking |
//! | [`ingest`] | Document ingestion pipeline |
//! | [`retrieval`] | Permission-filtered semantic search |
//! | [`tool`] | `search_knowledge` tool adapter |
//! | [`server`] | REST API server |

pub mod access;
pub mod config;
pub mod db;
pub mod embedding;
pub mod ingest;
pub mod jobs;
pub mod migrate;
pub mod models;
pub mod parse;
pub mod ragconfig;
pub mod retrieval;
pub mod segment;
pub mod server;
pub mod tool;
