//! # File Vault CLI (`vault`)
//!
//! ```bash
//! vault --config ./config/vault.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vault init` | Create the database and storage directories |
//! | `vault upload <path>` | Store a file and index it |
//! | `vault delete <id>` | Delete a file |
//! | `vault get <id>` | Show a file, optionally writing its bytes out |
//! | `vault list` | List stored files |
//! | `vault search "<query>"` | Rank files by semantic similarity |
//! | `vault reindex <id>` / `--all` | Rebuild chunks |
//! | `vault reset-index` | Drop every chunk |
//! | `vault stats` | Dedup and indexing statistics |
//! | `vault repair` | Re-drive cleanups, verify content, purge orphans |
//!
//! Logs go to stderr; `RUST_LOG` overrides the level.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use filevault::vault::IndexingDisposition;
use filevault::{load_config, Vault};
use filevault_core::models::IndexOutcome;
use filevault_core::search::{Aggregation, SearchRequest};

/// File Vault: a deduplicating file store with semantic search.
#[derive(Parser)]
#[command(name = "vault", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/vault.toml")]
    config: PathBuf,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema and storage directories. Idempotent.
    Init,

    /// Store a file. Identical bytes are stored once.
    Upload {
        path: PathBuf,

        /// Display name (defaults to the file name).
        #[arg(long)]
        name: Option<String>,

        /// Declared MIME type (defaults to a guess from the extension).
        #[arg(long = "type")]
        declared_type: Option<String>,
    },

    /// Delete a file by id.
    Delete { id: String },

    /// Show a file's metadata and indexing state.
    Get {
        id: String,

        /// Write the stored bytes to this path.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// List stored files.
    List,

    /// Search files by meaning.
    Search {
        query: String,

        #[arg(long)]
        top_k: Option<usize>,

        /// Minimum aggregated score in [0, 1].
        #[arg(long)]
        threshold: Option<f64>,

        /// max, mean, or weighted.
        #[arg(long, default_value = "max")]
        aggregation: String,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Purge and rebuild chunks for one file or every file.
    Reindex {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        id: Option<String>,

        #[arg(long)]
        all: bool,
    },

    /// Delete every chunk from the vector index.
    ResetIndex,

    /// Show storage and indexing statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Re-drive pending cleanups, verify stored content and purge orphans.
    Repair,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = load_config(&cli.config)?;
    let vault = Vault::open(cfg).await?;
    let result = run(&vault, cli.command).await;
    vault.shutdown().await;
    result
}

async fn run(vault: &Vault, command: Commands) -> Result<()> {
    match command {
        Commands::Init => {
            println!(
                "Vault initialized at {}",
                vault.config().storage.root.display()
            );
        }
        Commands::Upload {
            path,
            name,
            declared_type,
        } => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let name = match name {
                Some(n) => n,
                None => file_name(&path)?,
            };
            let outcome = vault
                .upload(&bytes, &name, declared_type.as_deref())
                .await?;
            println!("{}", outcome.file.id);
            eprintln!(
                "stored {} ({}, {} bytes, {} content, {} reference{})",
                outcome.file.display_name,
                outcome.file.declared_type,
                outcome.file.size_bytes,
                if outcome.is_new_content { "new" } else { "existing" },
                outcome.reference_count,
                if outcome.reference_count == 1 { "" } else { "s" }
            );
            match outcome.indexing {
                IndexingDisposition::Inline { outcome } => {
                    eprintln!("indexing: {}", describe_outcome(&outcome))
                }
                IndexingDisposition::Queued => {
                    vault.wait_idle().await;
                    if let Some(status) = vault.index_status(&outcome.file.id).await? {
                        eprintln!("indexing: {}", status.state);
                    }
                }
                IndexingDisposition::Disabled => eprintln!("indexing: disabled"),
            }
        }
        Commands::Delete { id } => {
            let outcome = vault.delete(&id).await?;
            vault.wait_idle().await;
            println!(
                "Deleted {} ({} reference{} remain{}{})",
                outcome.file_id,
                outcome.remaining_references,
                if outcome.remaining_references == 1 { "" } else { "s" },
                if outcome.remaining_references == 1 { "s" } else { "" },
                if outcome.content_deleted {
                    ", content removed"
                } else {
                    ""
                }
            );
        }
        Commands::Get { id, output } => {
            let file = vault.get(&id).await?;
            println!("id:          {}", file.id);
            println!("name:        {}", file.display_name);
            println!("type:        {}", file.declared_type);
            println!("size:        {}", file.size_bytes);
            println!("fingerprint: {}", file.content_fingerprint);
            println!("created:     {}", file.created_at.format("%Y-%m-%d %H:%M:%S"));
            if let Some(status) = vault.index_status(&id).await? {
                print!("index:       {} ({} chunks", status.state, status.chunk_count);
                match status.last_error {
                    Some(err) => println!(", {})", err),
                    None => println!(")"),
                }
            }
            if let Some(output) = output {
                let (_, bytes) = vault.read(&id).await?;
                tokio::fs::write(&output, &bytes)
                    .await
                    .with_context(|| format!("writing {}", output.display()))?;
                eprintln!("wrote {} bytes to {}", bytes.len(), output.display());
            }
        }
        Commands::List => {
            let files = vault.list().await?;
            if files.is_empty() {
                println!("No files.");
            }
            for f in files {
                println!(
                    "{}  {:>10}  {:<28}  {}",
                    f.id, f.size_bytes, f.declared_type, f.display_name
                );
            }
        }
        Commands::Search {
            query,
            top_k,
            threshold,
            aggregation,
            json,
        } => {
            let mut request =
                SearchRequest::new(query).aggregation(aggregation.parse::<Aggregation>()?);
            if let Some(k) = top_k {
                request = request.top_k(k);
            }
            if let Some(t) = threshold {
                request = request.threshold(t);
            }
            let results = vault.search(&request).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else if results.is_empty() {
                println!("No results.");
            } else {
                for (i, r) in results.iter().enumerate() {
                    println!(
                        "{}. [{:.4}] {} ({}, {} chunk{})",
                        i + 1,
                        r.score,
                        r.display_name,
                        r.file_id,
                        r.matched_chunks,
                        if r.matched_chunks == 1 { "" } else { "s" }
                    );
                    println!("   {}", r.preview.replace('\n', " "));
                }
            }
        }
        Commands::Reindex { id, all } => {
            if all {
                let report = vault.reindex_all().await?;
                println!(
                    "Reindexed: {} indexed, {} skipped, {} failed",
                    report.indexed, report.skipped, report.failed
                );
            } else if let Some(id) = id {
                let outcome = vault.reindex(&id).await?;
                println!("{}: {}", id, describe_outcome(&outcome));
            }
        }
        Commands::ResetIndex => {
            let removed = vault.reset_index().await?;
            println!("Removed {} chunks.", removed);
        }
        Commands::Stats { json } => {
            let stats = vault.stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print!("{}", stats.render());
            }
        }
        Commands::Repair => {
            let report = vault.repair().await?;
            vault.wait_idle().await;
            println!(
                "Cleanups: {} completed, {} alarmed. Re-queued: {}. Corrupt: {}. Orphans: {} purged, {} failed.",
                report.cleanups_completed,
                report.cleanups_alarmed,
                report.indexing_requeued,
                report.corrupt_contents,
                report.orphans_purged,
                report.orphans_failed
            );
        }
    }
    Ok(())
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))
}

fn describe_outcome(outcome: &IndexOutcome) -> String {
    match outcome {
        IndexOutcome::Done { chunks } => format!("done, {} chunks", chunks),
        IndexOutcome::Skipped { reason } => format!("skipped ({})", reason),
        IndexOutcome::Failed { error, attempts } => {
            format!("failed after {} attempt(s): {}", attempts, error)
        }
    }
}
