//! End-to-end tests driving the `ragkit` binary.
//!
//! Embedding traffic goes through a local mock server speaking the custom
//! provider contract, so the full ingest → search path runs without any
//! external API credentials.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

fn ragkit_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("ragkit");
    path
}

fn write_config(root: &Path, custom_endpoint: Option<&str>) -> PathBuf {
    let db_path = root.join("ragkit.sqlite");
    let mut toml = format!("[db]\npath = \"{}\"\n", db_path.display());
    if let Some(endpoint) = custom_endpoint {
        toml.push_str(&format!(
            "\n[providers]\ncustom_endpoint = \"{}\"\n",
            endpoint
        ));
    }
    let config_path = root.join("ragkit.toml");
    fs::write(&config_path, toml).unwrap();
    config_path
}

fn run_cli(config: &Path, account: &str, args: &[&str]) -> Output {
    Command::new(ragkit_binary())
        .arg("--config")
        .arg(config)
        .arg("--account")
        .arg(account)
        .args(args)
        .output()
        .expect("failed to run ragkit binary")
}

fn stdout_of(output: &Output) -> String {
    assert!(
        output.status.success(),
        "command failed\nstdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Pull the id out of "Created knowledge base <name> (<id>)".
fn kb_id_from(create_output: &str) -> String {
    let start = create_output.rfind('(').unwrap() + 1;
    let end = create_output.rfind(')').unwrap();
    create_output[start..end].to_string()
}

#[test]
fn test_init_creates_database_idempotently() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(tmp.path(), None);

    stdout_of(&run_cli(&config, "local", &["init"]));
    assert!(tmp.path().join("ragkit.sqlite").exists());

    // Second run must not fail
    stdout_of(&run_cli(&config, "local", &["init"]));
}

#[test]
fn test_kb_lifecycle_and_per_account_visibility() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(tmp.path(), None);
    stdout_of(&run_cli(&config, "alice", &["init"]));

    let created = stdout_of(&run_cli(&config, "alice", &["kb", "create", "docs"]));
    let kb_id = kb_id_from(&created);

    let listed = stdout_of(&run_cli(&config, "alice", &["kb", "list"]));
    assert!(listed.contains("docs"));
    assert!(listed.contains(&kb_id));
    assert!(listed.contains("admin via owned"));

    // A different account sees nothing
    let other = stdout_of(&run_cli(&config, "bob", &["kb", "list"]));
    assert!(other.contains("No accessible knowledge bases."));

    stdout_of(&run_cli(&config, "alice", &["kb", "delete", &kb_id]));
    let after = stdout_of(&run_cli(&config, "alice", &["kb", "list"]));
    assert!(after.contains("No accessible knowledge bases."));
}

#[test]
fn test_public_kb_visible_to_other_accounts_search() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(tmp.path(), None);
    stdout_of(&run_cli(&config, "alice", &["init"]));

    let created = stdout_of(&run_cli(
        &config,
        "alice",
        &["kb", "create", "handbook", "--public"],
    ));
    let kb_id = kb_id_from(&created);

    // Public visibility grants read, so a search against it comes back
    // empty rather than access-denied (the KB holds no chunks).
    let searched = stdout_of(&run_cli(
        &config,
        "bob",
        &["search", "anything", "--kb", &kb_id],
    ));
    assert!(searched.contains("No results."));
}

// ============ Mock embedding provider ============

/// Deterministic text → vector map shared by ingestion and query embedding,
/// so identical texts get identical vectors.
fn mock_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; 32];
    for (i, b) in text.bytes().enumerate() {
        v[i % 32] += b as f32 / 255.0;
    }
    v
}

/// Serve the custom provider contract on an ephemeral port.
async fn start_mock_embedder() -> String {
    use axum::{routing::post, Json, Router};
    use serde_json::{json, Value};

    async fn embed(Json(body): Json<Value>) -> Json<Value> {
        let texts = body
            .get("texts")
            .and_then(|t| t.as_array())
            .cloned()
            .unwrap_or_default();
        let embeddings: Vec<Vec<f32>> = texts
            .iter()
            .map(|t| mock_vector(t.as_str().unwrap_or_default()))
            .collect();
        Json(json!({ "embeddings": embeddings }))
    }

    let app = Router::new().route("/embed", post(embed));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/embed", addr)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ingest_and_search_through_custom_provider() {
    let endpoint = start_mock_embedder().await;

    let tmp = TempDir::new().unwrap();
    let config = write_config(tmp.path(), Some(&endpoint));
    let config_for_cli = config.clone();

    let doc_body = "the release pipeline deploys to staging before production";
    let doc_path = tmp.path().join("notes.txt");
    fs::write(&doc_path, doc_body).unwrap();
    let doc_path_str = doc_path.to_string_lossy().into_owned();
    let endpoint_for_cli = endpoint.clone();

    // CLI invocations block, so run them off the async workers
    let output = tokio::task::spawn_blocking(move || {
        let config = config_for_cli;
        stdout_of(&run_cli(&config, "alice", &["init"]));

        let created = stdout_of(&run_cli(&config, "alice", &["kb", "create", "notes"]));
        let kb_id = kb_id_from(&created);

        stdout_of(&run_cli(
            &config,
            "alice",
            &[
                "config",
                "set",
                &kb_id,
                "--provider",
                "custom",
                "--endpoint",
                &endpoint_for_cli,
                "--min-score",
                "0.05",
            ],
        ));

        let ingested = stdout_of(&run_cli(
            &config,
            "alice",
            &["ingest", &kb_id, &doc_path_str],
        ));
        assert!(ingested.contains("Ingested notes.txt"));

        let found = stdout_of(&run_cli(
            &config,
            "alice",
            &[
                "search",
                "the release pipeline deploys to staging before production",
                "--kb",
                &kb_id,
            ],
        ));

        let denied = stdout_of(&run_cli(
            &config,
            "mallory",
            &["search", "release pipeline", "--kb", &kb_id],
        ));

        (found, denied)
    })
    .await
    .unwrap();

    let (found, denied) = output;
    assert!(found.contains("notes.txt"), "search output: {}", found);
    assert!(denied.contains("No results."), "denied output: {}", denied);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_config_show_reflects_saved_facets() {
    let endpoint = start_mock_embedder().await;

    let tmp = TempDir::new().unwrap();
    let config = write_config(tmp.path(), Some(&endpoint));

    let shown = tokio::task::spawn_blocking(move || {
        stdout_of(&run_cli(&config, "alice", &["init"]));
        let created = stdout_of(&run_cli(&config, "alice", &["kb", "create", "notes"]));
        let kb_id = kb_id_from(&created);

        stdout_of(&run_cli(
            &config,
            "alice",
            &["config", "set", &kb_id, "--provider", "custom", "--top-k", "3"],
        ));
        stdout_of(&run_cli(&config, "alice", &["config", "show", &kb_id]))
    })
    .await
    .unwrap();

    assert!(shown.contains("\"provider\": \"custom\""));
    assert!(shown.contains("\"top_k\": 3"));
}
