//! # Federated retrieval CLI (`fedr`)
//!
//! ## Usage
//!
//! ```bash
//! fedr --config ./config/fedr.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fedr init` | Create the SQLite database and run schema migrations |
//! | `fedr sources` | List source kinds with health and session state |
//! | `fedr sync <kind\|all>` | Run an indexing pass |
//! | `fedr retrieve "<query>"` | Federated retrieval over all reachable sources |
//! | `fedr answer "<query>"` | Retrieval plus a generated answer |
//! | `fedr stats` | Index statistics per source |
//! | `fedr serve` | Start the HTTP retrieval API |
//!
//! Sessions live in memory only, so a one-shot command that needs the wiki
//! or the SSO portal takes its credential on the command line:
//!
//! ```bash
//! fedr sync wiki --login wiki=bearer:$WIKI_TOKEN
//! fedr retrieve "Wo finde ich den Laborplan?" --login wiki=bearer:$WIKI_TOKEN
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use federated_retrieval::config;
use federated_retrieval::engine::{Engine, SyncOutcome, SyncTarget};
use federated_retrieval::migrate;
use federated_retrieval::models::SourceKind;
use federated_retrieval::planner::RetrievalResponse;
use federated_retrieval::server;
use federated_retrieval::session::Credential;
use federated_retrieval::sources;

/// Federated retrieval over a file share, a wiki and two web portals.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/fedr.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "fedr",
    about = "Federated connector and retrieval engine",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/fedr.toml")]
    config: PathBuf,

    /// Credential for a protected source, as `<kind>=<scheme>:<value>`.
    ///
    /// Repeatable. Schemes: `bearer:<token>`, `cookie:<value>`,
    /// `basic:<user>:<password>`.
    #[arg(long = "login", global = true, value_parser = parse_login)]
    logins: Vec<(SourceKind, Credential)>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// List source kinds, whether they are configured, healthy and logged in.
    Sources,

    /// Run an indexing pass for one source kind or `all`.
    ///
    /// Credential-protected sources without a session are reported as
    /// needing login and left untouched.
    Sync {
        /// `share`, `wiki`, `public_portal`, `sso_portal` or `all`.
        target: SyncTarget,
    },

    /// Federated retrieval.
    Retrieve {
        query: String,

        /// Maximum number of merged results (default: `retrieval.max_results`).
        #[arg(long)]
        limit: Option<usize>,

        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Retrieve, then ask the completion model for an answer.
    Answer {
        query: String,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show index statistics.
    Stats,

    /// Start the HTTP retrieval API on `[server].bind`.
    Serve,
}

fn parse_login(s: &str) -> Result<(SourceKind, Credential), String> {
    let (kind, credential) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid login '{}': expected <kind>=<scheme>:<value>", s))?;
    let kind: SourceKind = kind.parse().map_err(|e: anyhow::Error| e.to_string())?;
    let credential: Credential = credential
        .parse()
        .map_err(|e: anyhow::Error| e.to_string())?;
    Ok((kind, credential))
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

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let engine = Engine::open(cfg).await?;
    for (kind, credential) in cli.logins {
        engine
            .login(kind, credential)
            .with_context(|| format!("Login for {} failed", kind))?;
    }

    match cli.command {
        Commands::Init => {}
        Commands::Sources => {
            sources::print_sources(&sources::list_sources(&engine).await);
        }
        Commands::Sync { target } => {
            let outcomes = engine.trigger_sync(target).await;
            print_sync_outcomes(&outcomes);
            if outcomes
                .iter()
                .all(|o| matches!(o, SyncOutcome::Failed { .. }))
                && !outcomes.is_empty()
            {
                anyhow::bail!("sync failed for every requested source");
            }
        }
        Commands::Retrieve { query, limit, json } => {
            let response = engine.retrieve(&query, limit).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print_retrieval(&response);
            }
        }
        Commands::Answer { query, limit } => {
            let response = engine.answer(&query, limit).await?;
            match &response.answer {
                Some(answer) => println!("{}\n", answer.trim()),
                None => println!("No relevant passages found.\n"),
            }
            print_retrieval(&response.retrieval);
        }
        Commands::Stats => {
            let stats = engine.stats().await?;
            println!("Embedding model:  {}", stats.embedding_model);
            println!("Completion model: {}", stats.completion_model);
            println!("Total entries:    {}", stats.index.total);
            println!();
            println!("{:<15} {:>8}  LAST INDEXED", "SOURCE", "ENTRIES");
            for (kind, s) in &stats.index.per_source {
                let last = s
                    .last_indexed_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<15} {:>8}  {}", kind.as_str(), s.entries, last);
            }
        }
        Commands::Serve => {
            server::run_server(engine).await?;
        }
    }

    Ok(())
}

fn print_sync_outcomes(outcomes: &[SyncOutcome]) {
    for outcome in outcomes {
        match outcome {
            SyncOutcome::Completed(r) => {
                let kind = r.source_kind.map(|k| k.as_str()).unwrap_or("-");
                println!(
                    "{:<15} listed {} fetched {} unchanged {} embedded {} deleted {} skipped {} failed {}{} ({} ms)",
                    kind,
                    r.listed,
                    r.fetched,
                    r.unchanged,
                    r.embedded,
                    r.deleted,
                    r.skipped,
                    r.failed,
                    if r.reconciled { " [reconciled]" } else { "" },
                    r.duration_ms
                );
                for skipped in &r.skipped_paths {
                    println!("  skipped {}: {}", skipped.source_path, skipped.reason);
                }
                if r.auth_required {
                    println!("  session rejected mid-sync; log in again and re-run");
                }
            }
            SyncOutcome::NeedsLogin { source_kind } => {
                println!(
                    "{:<15} needs login (use --login {}=<credential>)",
                    source_kind.as_str(),
                    source_kind
                );
            }
            SyncOutcome::Failed { source_kind, error } => {
                println!("{:<15} failed: {}", source_kind.as_str(), error);
            }
        }
    }
}

fn print_retrieval(response: &RetrievalResponse) {
    println!("Outcome: {:?}", response.outcome);
    if let Some(error) = &response.error {
        println!("Error: {}", error);
    }
    for u in &response.unavailable {
        println!("  unavailable: {} ({:?}: {})", u.source_kind, u.reason, u.detail);
    }
    if !response.reauth_required.is_empty() {
        let kinds: Vec<&str> = response.reauth_required.iter().map(|k| k.as_str()).collect();
        println!("  log in again to: {}", kinds.join(", "));
    }
    println!();

    if response.results.is_empty() {
        println!("No results.");
        return;
    }
    for (i, item) in response.results.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} ({})",
            i + 1,
            item.score,
            item.title,
            item.source_kind
        );
        println!("    {}", item.uri);
        println!("    {}", item.snippet);
        println!();
    }
}
