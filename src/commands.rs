//! CLI command implementations.
//!
//! Each `run_*` function backs one `vizchat` subcommand. Machine-readable
//! output (dataset JSON, outbound chat messages) goes to stdout; progress is
//! logged through `tracing` to stderr.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;
use vizchat_core::messages::{EventKind, InboundEvent, OutboundMessage, UserMessageBody};
use vizchat_core::models::{ChatSession, Dataset};
use vizchat_core::store::Store;

use crate::config::Config;
use crate::orchestrator::{Orchestrator, ReplySink};
use crate::sqlite_store::SqliteStore;
use crate::templates::TemplateStore;
use crate::{dataset, db, enrich, llm, migrate, server};

/// Prints each outbound message as one JSON line.
pub struct StdoutSink;

#[async_trait]
impl ReplySink for StdoutSink {
    async fn send(&self, message: OutboundMessage) -> Result<()> {
        println!("{}", serde_json::to_string(&message)?);
        Ok(())
    }
}

/// Open the configured database, creating tables when missing.
pub async fn open_store(cfg: &Config) -> Result<Arc<SqliteStore>> {
    let pool = db::connect(cfg).await?;
    migrate::run_migrations(&pool).await?;
    Ok(Arc::new(SqliteStore::new(pool)))
}

pub async fn run_init(cfg: &Config) -> Result<()> {
    let pool = db::connect(cfg).await?;
    migrate::run_migrations(&pool).await?;
    pool.close().await;
    println!("Database initialized at {}", cfg.db.path.display());
    Ok(())
}

/// Compute enrichment for `dataset` and persist it, filling an empty
/// description from the model.
async fn enrich_dataset(cfg: &Config, store: &dyn Store, dataset: &Dataset) -> Result<()> {
    let client = llm::build_client(&cfg.llm)?;
    let frame = dataset::load_frame(&dataset.uri).await?;
    info!(rows = frame.len(), columns = frame.columns.len(), "loaded {}", dataset.uri);

    let (props, schema) = enrich::enrich_frame(
        client.as_ref(),
        &frame,
        cfg.pipeline.sample_values,
        cfg.llm.schema_retries,
    )
    .await;
    store.save_enrichment(&dataset.id, &props, &schema).await?;

    if dataset.description.trim().is_empty() {
        match enrich::describe_dataset(client.as_ref(), &schema, cfg.llm.schema_retries).await {
            Ok(description) => store.update_description(&dataset.id, &description).await?,
            Err(e) => warn!(error = %e, "could not describe dataset"),
        }
    }
    Ok(())
}

pub async fn run_dataset_add(
    cfg: &Config,
    uri: &str,
    name: &str,
    description: &str,
    enrich_now: bool,
) -> Result<()> {
    let store = open_store(cfg).await?;
    let dataset = Dataset::new(uri, name, description);
    store.create_dataset(&dataset).await?;
    if enrich_now {
        enrich_dataset(cfg, store.as_ref(), &dataset).await?;
    }
    println!("{}", dataset.id);
    Ok(())
}

pub async fn run_dataset_enrich(cfg: &Config, id: &str) -> Result<()> {
    let store = open_store(cfg).await?;
    let dataset = store
        .get_dataset(id)
        .await?
        .with_context(|| format!("Dataset not found: {}", id))?;
    enrich_dataset(cfg, store.as_ref(), &dataset).await?;
    println!("Enriched dataset {}", id);
    Ok(())
}

pub async fn run_dataset_show(cfg: &Config, id: &str) -> Result<()> {
    let store = open_store(cfg).await?;
    let dataset = store
        .get_dataset(id)
        .await?
        .with_context(|| format!("Dataset not found: {}", id))?;
    println!("{}", serde_json::to_string_pretty(&dataset)?);
    Ok(())
}

pub async fn run_session_new(cfg: &Config, dataset_id: &str) -> Result<()> {
    let store = open_store(cfg).await?;
    if store.get_dataset(dataset_id).await?.is_none() {
        bail!("Dataset not found: {}", dataset_id);
    }
    let session = ChatSession::new(dataset_id);
    store.create_session(&session).await?;
    println!("{}", session.id);
    Ok(())
}

/// Send one chat event through the pipeline, printing every reply.
pub async fn run_event(
    cfg: &Config,
    kind: EventKind,
    session_id: Uuid,
    question: &str,
    reply_to: Option<Uuid>,
) -> Result<()> {
    let store = open_store(cfg).await?;
    let client = llm::build_client(&cfg.llm)?;
    let orchestrator = Orchestrator::new(cfg, store, client);
    let event = InboundEvent {
        kind,
        user_message_body: UserMessageBody {
            question: question.to_string(),
            session_id,
        },
        reply_to_assistant_message_uuid: reply_to,
    };
    orchestrator.handle(event, &StdoutSink).await;
    Ok(())
}

pub async fn run_history(cfg: &Config, session_id: Uuid) -> Result<()> {
    let store = open_store(cfg).await?;
    if store.get_session(session_id).await?.is_none() {
        bail!("Chat session not found: {}", session_id);
    }
    let turns = store.list_assistant_turns(session_id).await?;
    if turns.is_empty() {
        println!("No visualizations yet.");
    }
    for turn in turns {
        let analyzed = if turn.analysis().is_some() { " (analyzed)" } else { "" };
        println!(
            "{}  {:<20} [{}]{}\n    {}",
            turn.id,
            turn.viz_name,
            turn.columns_involved.join(", "),
            analyzed,
            turn.reason
        );
    }
    Ok(())
}

pub fn run_templates(cfg: &Config) {
    let store = TemplateStore::new(&cfg.pipeline.templates_dir, &cfg.pipeline.template_ext);
    for kind in &cfg.pipeline.chart_kinds {
        match store.lookup(kind) {
            Ok(template) => println!("{:<20} {}", kind, template.path.display()),
            Err(e) => println!("{:<20} MISSING ({})", kind, e),
        }
    }
}

pub async fn run_serve(cfg: &Config) -> Result<()> {
    let store = open_store(cfg).await?;
    let client = llm::build_client(&cfg.llm)?;
    let orchestrator = Arc::new(Orchestrator::new(cfg, store, client));
    server::run_server(cfg, orchestrator).await
}
