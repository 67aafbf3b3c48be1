//! # Comment Harness CLI (`chx`)
//!
//! ```bash
//! chx --config ./config/chx.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `chx init` | Create the SQLite database and run schema migrations |
//! | `chx ingest` | Ingest comment archives from `[archives].dir` |
//! | `chx index build [LOGIN…]` | Build or refresh per-subject vector indexes |
//! | `chx index status [LOGIN…]` | Show published generations |
//! | `chx search similar LOGIN QUERY` | Comments closest to a query text |
//! | `chx search centroid LOGIN` | Most typical comments |
//! | `chx search emotion LOGIN --weight joy=1` | Comments near a blend of emotion axes |
//! | `chx react like ID` | Increment a reaction counter |
//! | `chx notes generate` | Generate context notes for disliked comments |
//! | `chx stats` | Store, ledger and note counts |
//! | `chx serve` | Start the HTTP server |

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use comment_harness::config;
use comment_harness::embedding::create_provider;
use comment_harness::index_build::{self, IndexBuilder};
use comment_harness::ingest::{self, IngestOptions};
use comment_harness::notes::{self, NotesOptions};
use comment_harness::search::{self, parse_weight, SearchRequest};
use comment_harness::{db, migrate, server, stats, store};
use comment_harness_core::models::Reaction;

/// Comment Harness: idempotent comment-archive ingestion and per-subject
/// semantic retrieval.
#[derive(Parser)]
#[command(name = "chx", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/chx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Ingest comment archives.
    ///
    /// Archives already recorded in the ledger with the same content hash
    /// are skipped. An archive whose hash changed is reported as drifted
    /// and left untouched unless `--reingest` is given.
    Ingest {
        /// Archive directory (defaults to `[archives].dir`).
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Reprocess archives even when the ledger says they are done.
        #[arg(long)]
        reingest: bool,

        /// Show what would be processed without writing anything.
        #[arg(long)]
        dry_run: bool,
    },

    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    Search {
        #[command(subcommand)]
        mode: SearchMode,
    },

    /// Add to a comment's like or dislike counter.
    React {
        #[arg(value_enum)]
        reaction: ReactionArg,

        comment_id: String,

        /// Amount to add (1-100).
        #[arg(long, default_value_t = 1)]
        count: i64,
    },

    Notes {
        #[command(subcommand)]
        action: NotesAction,
    },

    /// Show store, ledger and note counts.
    Stats,

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum IndexAction {
    /// Build indexes for the given subjects (default: every session owner).
    Build { logins: Vec<String> },
    /// Show the published generation of each subject.
    Status { logins: Vec<String> },
}

#[derive(Subcommand)]
enum SearchMode {
    /// Comments semantically closest to QUERY.
    Similar {
        login: String,
        query: String,
        #[arg(short, long)]
        k: Option<usize>,
    },
    /// Comments closest to the mean embedding.
    Centroid {
        login: String,
        /// Restrict to one session.
        #[arg(long)]
        session: Option<i64>,
        /// Slide the window away from the centroid, 0.0 to 1.0.
        #[arg(long)]
        position: Option<f64>,
        #[arg(short, long)]
        k: Option<usize>,
    },
    /// Comments closest to a weighted blend of emotion axes.
    Emotion {
        login: String,
        /// Axis weight as KEY=W; repeat for several axes.
        #[arg(long = "weight", value_parser = parse_weight, required = true)]
        weights: Vec<(String, f64)>,
        #[arg(short, long)]
        k: Option<usize>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ReactionArg {
    Like,
    Dislike,
}

impl From<ReactionArg> for Reaction {
    fn from(r: ReactionArg) -> Self {
        match r {
            ReactionArg::Like => Reaction::Like,
            ReactionArg::Dislike => Reaction::Dislike,
        }
    }
}

#[derive(Subcommand)]
enum NotesAction {
    /// Generate notes for comments over the dislike threshold.
    Generate {
        /// Regenerate existing notes (they are backed up first).
        #[arg(long)]
        force: bool,

        /// Maximum number of comments to process.
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns `Ok(false)` when the command ran but some unit of work failed.
async fn run(cli: Cli) -> anyhow::Result<bool> {
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            dir,
            reingest,
            dry_run,
        } => {
            let opts = IngestOptions {
                dir,
                reingest,
                dry_run,
            };
            let report = ingest::run_ingest(&cfg, &opts).await?;
            ingest::print_report(&report, dry_run);
            return Ok(!report.has_failures());
        }
        Commands::Index { action } => match action {
            IndexAction::Build { logins } => {
                let pool = db::connect(&cfg).await?;
                let logins = if logins.is_empty() {
                    index_build::default_subjects(&cfg, &pool).await?
                } else {
                    logins
                };
                let provider = create_provider(&cfg.embedding)?;
                let builder = Arc::new(IndexBuilder::new(&cfg, pool.clone(), provider));
                let results =
                    index_build::build_subjects(builder, logins, cfg.index.max_parallel_builds)
                        .await;
                pool.close().await;
                return Ok(index_build::print_results(&results));
            }
            IndexAction::Status { logins } => {
                search::run_index_status(&cfg, logins).await?;
            }
        },
        Commands::Search { mode } => {
            let (request, k) = match mode {
                SearchMode::Similar { login, query, k } => {
                    (SearchRequest::Similar { login, query }, k)
                }
                SearchMode::Centroid {
                    login,
                    session,
                    position,
                    k,
                } => (
                    SearchRequest::Centroid {
                        login,
                        session,
                        position,
                    },
                    k,
                ),
                SearchMode::Emotion { login, weights, k } => {
                    (SearchRequest::Emotion { login, weights }, k)
                }
            };
            search::run_search(&cfg, request, k).await?;
        }
        Commands::React {
            reaction,
            comment_id,
            count,
        } => {
            let pool = db::connect(&cfg).await?;
            let result = store::add_reaction(&pool, &comment_id, reaction.into(), count).await;
            pool.close().await;
            let counts = result?;
            println!("react");
            println!("  comment: {}", comment_id);
            println!("  likes: {}", counts.likes);
            println!("  dislikes: {}", counts.dislikes);
            println!("ok");
        }
        Commands::Notes { action } => match action {
            NotesAction::Generate { force, limit } => {
                let producer = notes::create_producer(&cfg.notes)?;
                let opts = NotesOptions { force, limit };
                let report = notes::run_generate_notes(&cfg, producer.as_ref(), &opts).await?;
                notes::print_report(&report);
            }
        },
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(true)
}
