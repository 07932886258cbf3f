use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn docctx_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("docctx");
    path
}

fn long_handbook() -> String {
    let mut paras = vec![
        "EMPLOYEE HANDBOOK".to_string(),
        "This handbook applies to every employee of the centre.".to_string(),
    ];
    for i in 0..30 {
        paras.push(format!(
            "Section filler {i}: opening hours, parking, and general housekeeping notes."
        ));
    }
    paras.insert(
        20,
        "Every caregiver must pass a background check before the first shift. Background check results are kept on file.".to_string(),
    );
    paras.join("\n\n")
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let docs_dir = root.join("docs");
    fs::create_dir_all(docs_dir.join("policies")).unwrap();
    fs::write(docs_dir.join("policies/handbook.txt"), long_handbook()).unwrap();
    fs::write(docs_dir.join("memo.txt"), "Staff meeting moved to Friday.").unwrap();
    fs::write(
        docs_dir.join("faq.html"),
        "<!DOCTYPE html><html><head><title>Parent FAQ</title></head><body><h1>Pickup</h1><p>Pickup ends at 6pm.</p></body></html>",
    )
    .unwrap();

    let config_content = format!(
        r#"[storage]
documents_dir = "{root}/docs"
index_dir = "{root}/data/indexes"
embedding_dir = "{root}/data/embeddings"

[chunking]
target_chars = 300
min_index_chars = 1000

[retrieval]
max_chunks = 3
"#,
        root = root.display()
    );

    let config_path = config_dir.join("docctx.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_docctx(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = docctx_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run docctx binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_context_with_query() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_docctx(
        &config_path,
        &["context", "policies/handbook.txt", "--query", "background check"],
    );
    assert!(success, "context failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.starts_with("### DOCUMENT TITLES ###\nhandbook.txt"));
    assert!(stdout.contains("--- RELEVANT SECTION 1 ---"));
    assert!(stdout.contains("must pass a background check"));
    assert!(stdout.contains("This handbook applies to every employee"));
    assert!(!stdout.contains("RELEVANT SECTION 4"));
}

#[test]
fn test_context_multiple_documents() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_docctx(
        &config_path,
        &["context", "policies/handbook.txt", "memo.txt", "faq.html"],
    );
    assert!(success, "context failed: stdout={}, stderr={}", stdout, stderr);
    // shortest first
    let memo = stdout.find("DOCUMENT CONTENT: memo.txt").unwrap();
    let faq = stdout.find("DOCUMENT CONTENT: Parent FAQ").unwrap();
    let handbook = stdout.find("DOCUMENT CONTENT: handbook.txt").unwrap();
    assert!(memo < handbook && faq < handbook);
    assert!(stdout.contains("--- HEADINGS FROM Parent FAQ ---\n# Pickup"));
    assert!(stdout.contains("*** IMPORTANT DOCUMENT ***\n--- DOCUMENT CONTENT: memo.txt ---"));
}

#[test]
fn test_context_missing_document() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_docctx(&config_path, &["context", "nope.pdf"]);
    assert!(success);
    assert!(stdout.contains("[No documents found for the requested IDs]"));
}

#[test]
fn test_context_budget() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_docctx(
        &config_path,
        &["context", "policies/handbook.txt", "--max-chars", "400"],
    );
    assert!(success);
    assert!(stdout.trim_end().ends_with(
        "[Content truncated to fit the context budget. The document contains more information.]"
    ));
    assert!(stdout.trim_end().chars().count() < 600);
}

#[test]
fn test_index_all_then_inspect() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_docctx(&config_path, &["index", "--all"]);
    assert!(success, "index failed: stdout={}, stderr={}", stdout, stderr);
    assert!(
        stdout.contains("Indexed 1 document(s), skipped 2"),
        "unexpected output: {}",
        stdout
    );

    let indexes: Vec<_> = fs::read_dir(tmp.path().join("data/indexes"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(indexes.len(), 1);
    assert!(indexes[0].ends_with(".index.json"));

    let (stdout, stderr, success) =
        run_docctx(&config_path, &["inspect", "policies/handbook.txt"]);
    assert!(success, "inspect failed: stdout={}, stderr={}", stdout, stderr);
    let summary: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(summary["document_id"], "policies/handbook.txt");
    assert_eq!(summary["stale"], false);
    assert_eq!(summary["has_embeddings"], false);
    assert!(summary["total_chunks"].as_u64().unwrap() > 3);
}

#[test]
fn test_inspect_without_index_fails() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_docctx(&config_path, &["inspect", "memo.txt"]);
    assert!(!success);
    assert!(stderr.contains("No index stored for memo.txt"));
}

#[test]
fn test_index_requires_target() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success) = run_docctx(&config_path, &["index"]);
    assert!(!success);
}

#[test]
fn test_extract_html() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_docctx(&config_path, &["extract", "faq.html"]);
    assert!(success, "extract failed: stdout={}, stderr={}", stdout, stderr);
    let doc: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(doc["title"], "Parent FAQ");
    assert_eq!(doc["headings"], "# Pickup");
    assert!(doc["body"].as_str().unwrap().contains("Pickup ends at 6pm."));
}

#[test]
fn test_extract_file_outside_store() {
    let (tmp, config_path) = setup_test_env();
    let outside = tmp.path().join("rules.html");
    fs::write(
        &outside,
        "<html><head><title>Caf&eacute; Rules</title></head><body><h2>Snacks</h2><p>No nuts &mdash; ever.</p></body></html>",
    )
    .unwrap();

    let (stdout, stderr, success) =
        run_docctx(&config_path, &["extract", "--file", outside.to_str().unwrap()]);
    assert!(success, "extract failed: stdout={}, stderr={}", stdout, stderr);
    let doc: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(doc["title"], "Caf\u{e9} Rules");
    assert_eq!(doc["headings"], "## Snacks");
    assert!(doc["body"].as_str().unwrap().contains("No nuts \u{2014} ever."));
}

#[test]
fn test_extract_file_missing() {
    let (tmp, config_path) = setup_test_env();
    let missing = tmp.path().join("nowhere.pdf");

    let (_, stderr, success) =
        run_docctx(&config_path, &["extract", "--file", missing.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("nowhere.pdf"), "stderr={}", stderr);
}

#[test]
fn test_extract_requires_target() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_docctx(&config_path, &["extract"]);
    assert!(!success);
    assert!(stderr.contains("--file"));
}

#[test]
fn test_invalid_config_fails() {
    let (tmp, _) = setup_test_env();
    let bad = tmp.path().join("config/bad.toml");
    fs::write(&bad, "[storage]\ndocuments_dir = \"d\"\n\n[retrieval]\nsemantic_weight = 2.0\n").unwrap();

    let (_, stderr, success) = run_docctx(&bad, &["context", "memo.txt"]);
    assert!(!success);
    assert!(stderr.contains("semantic_weight"));
}
