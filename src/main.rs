//! # mmrag CLI
//!
//! ```bash
//! mmrag --config ./config/mmrag.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mmrag init` | Create the SQLite database and schema |
//! | `mmrag ingest <paths..>` | Ingest files or directories |
//! | `mmrag remove <id>` | Remove a document and its entries |
//! | `mmrag search "<query>"` | Nearest chunks, no generation |
//! | `mmrag ask "<question>"` | Grounded answer with citations |
//! | `mmrag documents` | List indexed documents |
//! | `mmrag stats` | Index summary |
//! | `mmrag reset --yes` | Drop every document and entry |
//! | `mmrag completions <shell>` | Shell completion script |
//!
//! Logging goes to stderr and is controlled with `RUST_LOG`
//! (default `mmrag=info`).

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mmrag::commands;
use mmrag::config;
use mmrag::stats;
use mmrag_core::models::{ChunkModality, Modality};

/// Multimodal retrieval-augmented question answering over text, images,
/// and PDFs.
#[derive(Parser)]
#[command(name = "mmrag", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/mmrag.toml")]
    config: PathBuf,

    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema. Idempotent.
    Init,

    /// Ingest files. Directories are walked recursively.
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Treat every file as this modality instead of detecting it
        /// (text, image, pdf).
        #[arg(long)]
        modality: Option<Modality>,
    },

    /// Remove a document by id.
    Remove { id: String },

    /// Search the index without generating an answer.
    Search {
        query: String,

        /// Only return chunks of this kind (text, image, pdf-page).
        #[arg(long)]
        modality: Option<ChunkModality>,

        /// Leave image chunks out of the results.
        #[arg(long, conflicts_with = "modality")]
        no_images: bool,

        /// Maximum number of results (defaults to retrieval.top_k).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Ask a question and get an answer with citations.
    Ask {
        question: String,

        /// Continue an existing session.
        #[arg(long)]
        session: Option<String>,

        /// Only retrieve chunks of this kind (text, image, pdf-page).
        #[arg(long)]
        modality: Option<ChunkModality>,

        /// Leave image chunks out of retrieval.
        #[arg(long, conflicts_with = "modality")]
        no_images: bool,
    },

    /// List indexed documents.
    Documents,

    /// Show index statistics.
    Stats,

    /// Delete every document and entry from the index.
    Reset {
        /// Confirm the deletion.
        #[arg(long)]
        yes: bool,
    },

    /// Generate shell completions.
    Completions { shell: Shell },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mmrag=info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    if let Commands::Completions { shell } = cli.command {
        generate(shell, &mut Cli::command(), "mmrag", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => commands::run_init(&cfg).await?,
        Commands::Ingest { paths, modality } => {
            commands::run_ingest(&cfg, &paths, modality, cli.json).await?
        }
        Commands::Remove { id } => commands::run_remove(&cfg, &id).await?,
        Commands::Search {
            query,
            modality,
            no_images,
            limit,
        } => {
            let scope = commands::Scope::new(modality, no_images);
            commands::run_search(&cfg, &query, scope, limit, cli.json).await?
        }
        Commands::Ask {
            question,
            session,
            modality,
            no_images,
        } => {
            let scope = commands::Scope::new(modality, no_images);
            commands::run_ask(&cfg, &question, session, scope, cli.json).await?
        }
        Commands::Documents => stats::run_documents(&cfg).await?,
        Commands::Stats => stats::run_stats(&cfg).await?,
        Commands::Reset { yes } => commands::run_reset(&cfg, yes).await?,
        Commands::Completions { .. } => {}
    }

    Ok(())
}
