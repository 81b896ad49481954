//! # vizchat CLI
//!
//! The `vizchat` binary registers datasets, opens chat sessions, sends
//! chat events and runs the websocket chat server.
//!
//! ## Usage
//!
//! ```bash
//! vizchat --config ./config/vizchat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vizchat init` | Create the SQLite database and run schema migrations |
//! | `vizchat dataset add` | Register a CSV dataset and enrich its schema |
//! | `vizchat dataset enrich <id>` | (Re)compute a dataset's enriched schema |
//! | `vizchat dataset show <id>` | Print a dataset with its schema |
//! | `vizchat session new <dataset_id>` | Open a chat session |
//! | `vizchat ask <session> "<question>"` | Generate visualizations |
//! | `vizchat refine <session> <turn> "<question>"` | Refine an earlier visualization |
//! | `vizchat analyze <session> <turn>` | Analyze an earlier visualization |
//! | `vizchat history <session>` | List a session's visualizations |
//! | `vizchat templates` | List chart kinds and their reference templates |
//! | `vizchat serve` | Start the websocket chat server |
//!
//! Event commands print every outbound message as one JSON line on stdout;
//! logs go to stderr.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use vizchat::commands;
use vizchat::config;
use vizchat_core::messages::EventKind;

/// vizchat: ask questions about a dataset, get charts back.
#[derive(Parser)]
#[command(
    name = "vizchat",
    about = "vizchat: LLM-driven visualization chat over tabular datasets",
    version,
    long_about = "vizchat recommends, generates, renders and analyzes charts for \
    natural-language questions about a CSV dataset. Generated code runs in an \
    embedded, resource-limited Lua sandbox."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/vizchat.toml`. A missing file means all defaults.
    #[arg(long, global = true, default_value = "./config/vizchat.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Manage datasets.
    Dataset {
        #[command(subcommand)]
        action: DatasetAction,
    },

    /// Manage chat sessions.
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Ask a question; generates fresh visualizations.
    Ask {
        session_id: Uuid,
        question: String,
    },

    /// Ask a follow-up about an earlier visualization.
    Refine {
        session_id: Uuid,
        /// UUID of the assistant turn to refine.
        assistant_uuid: Uuid,
        question: String,
    },

    /// Analyze the image of an earlier visualization.
    Analyze {
        session_id: Uuid,
        /// UUID of the assistant turn to analyze.
        assistant_uuid: Uuid,
        #[arg(default_value = "What does this visualization show?")]
        question: String,
    },

    /// List the visualizations of a session, oldest first.
    History { session_id: Uuid },

    /// List configured chart kinds and the template each resolves to.
    Templates,

    /// Start the websocket chat server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum DatasetAction {
    /// Register a CSV dataset.
    ///
    /// The URI may be a local path, `file://` or `http(s)://`. Unless
    /// `--no-enrich` is given, column properties and the schema are computed
    /// right away; otherwise they are computed on first use.
    Add {
        #[arg(long)]
        uri: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        no_enrich: bool,
    },

    /// Recompute column properties and schema.
    Enrich { id: String },

    /// Print a dataset and its enrichment as JSON.
    Show { id: String },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Open a new chat session on a dataset; prints the session id.
    New { dataset_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vizchat=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            commands::run_init(&cfg).await?;
        }
        Commands::Dataset { action } => match action {
            DatasetAction::Add {
                uri,
                name,
                description,
                no_enrich,
            } => {
                commands::run_dataset_add(&cfg, &uri, &name, &description, !no_enrich).await?;
            }
            DatasetAction::Enrich { id } => {
                commands::run_dataset_enrich(&cfg, &id).await?;
            }
            DatasetAction::Show { id } => {
                commands::run_dataset_show(&cfg, &id).await?;
            }
        },
        Commands::Session { action } => match action {
            SessionAction::New { dataset_id } => {
                commands::run_session_new(&cfg, &dataset_id).await?;
            }
        },
        Commands::Ask {
            session_id,
            question,
        } => {
            commands::run_event(&cfg, EventKind::GenerateVisualizations, session_id, &question, None)
                .await?;
        }
        Commands::Refine {
            session_id,
            assistant_uuid,
            question,
        } => {
            commands::run_event(
                &cfg,
                EventKind::RefineVisualizations,
                session_id,
                &question,
                Some(assistant_uuid),
            )
            .await?;
        }
        Commands::Analyze {
            session_id,
            assistant_uuid,
            question,
        } => {
            commands::run_event(
                &cfg,
                EventKind::AnalyzeVisualization,
                session_id,
                &question,
                Some(assistant_uuid),
            )
            .await?;
        }
        Commands::History { session_id } => {
            commands::run_history(&cfg, session_id).await?;
        }
        Commands::Templates => {
            commands::run_templates(&cfg);
        }
        Commands::Serve => {
            commands::run_serve(&cfg).await?;
        }
    }

    Ok(())
}
