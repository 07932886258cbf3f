//! # doc-context CLI (`docctx`)
//!
//! ## Usage
//!
//! ```bash
//! docctx --config ./config/docctx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docctx context <ids…> [--query q]` | Print assembled context for documents |
//! | `docctx index [ids…] [--all]` | Build indexes (and embeddings) ahead of time |
//! | `docctx extract <id>` / `--file <path>` | Print the extracted structure as JSON |
//! | `docctx inspect <id>` | Print a summary of the stored index as JSON |
//!
//! Logs go to stderr (`RUST_LOG`, default `info`); stdout carries only
//! command output.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use doc_context::config;
use doc_context::retrieve::Retriever;

/// doc-context: query-focused context retrieval over PDF, HTML, DOCX and
/// text documents.
#[derive(Parser)]
#[command(name = "docctx", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docctx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print context for one or more documents.
    ///
    /// With `--query`, each large document is reduced to its most relevant
    /// sections; without it, full text is returned.
    Context {
        /// Document ids (paths relative to `storage.documents_dir`).
        #[arg(required = true)]
        ids: Vec<String>,

        /// Question to focus the context on.
        #[arg(long)]
        query: Option<String>,

        /// Character budget; defaults to `retrieval.max_context_chars`.
        #[arg(long)]
        max_chars: Option<usize>,
    },

    /// Build indexes ahead of time.
    Index {
        /// Document ids to index.
        ids: Vec<String>,

        /// Index every document under `storage.documents_dir`.
        #[arg(long, conflicts_with = "ids")]
        all: bool,
    },

    /// Print a document's extracted title, chapters, headings and body as JSON.
    Extract {
        /// Document id in the store.
        id: Option<String>,

        /// Extract a file from disk instead of the store.
        #[arg(long, conflicts_with = "id")]
        file: Option<PathBuf>,
    },

    /// Print a summary of a document's stored index as JSON.
    Inspect { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let retriever = Retriever::from_config(&cfg)?;

    match cli.command {
        Commands::Context {
            ids,
            query,
            max_chars,
        } => {
            let out = retriever
                .get_context(&ids, query.as_deref(), max_chars)
                .await;
            println!("{}", out);
        }
        Commands::Index { ids, all } => {
            if !all && ids.is_empty() {
                bail!("Specify document ids or --all");
            }
            let report = tokio::task::spawn_blocking(move || {
                if all {
                    retriever.index_all()
                } else {
                    Ok(retriever.index_documents(&ids))
                }
            })
            .await??;
            println!(
                "Indexed {} document(s), skipped {} below the size threshold, {} failed.",
                report.indexed.len(),
                report.skipped.len(),
                report.failed.len()
            );
            for (id, reason) in &report.failed {
                println!("  {}: {}", id, reason);
            }
        }
        Commands::Extract { id, file } => {
            let doc = match (id, file) {
                (_, Some(path)) => {
                    tokio::task::spawn_blocking(move || retriever.extract_file(&path)).await??
                }
                (Some(id), None) => {
                    tokio::task::spawn_blocking(move || retriever.extract_document(&id))
                        .await??
                }
                (None, None) => bail!("Specify a document id or --file"),
            };
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        Commands::Inspect { id } => {
            let summary = tokio::task::spawn_blocking({
                let id = id.clone();
                move || retriever.inspect(&id)
            })
            .await??
            .with_context(|| format!("No index stored for {}", id))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
