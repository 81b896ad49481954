//! Event driver: turns one inbound chat event into replies.
//!
//! ```text
//! generate_visualizations ─▶ ack ─▶ recommend ─┐
//! refine_visualizations   ─▶ ack ─▶ refine ────┴─▶ per candidate (concurrent):
//!                                                  template ─▶ extract ─▶ render
//!                                                  ─▶ persist ─▶ viz_code
//! analyze_visualization   ─▶ ack ─▶ analyze prior turn ─▶ analyze_visualization
//! ```
//!
//! Events on one session are handled one at a time. Candidate failures are
//! logged and skipped; only session-level failures (unknown session, bad
//! event, unreadable dataset) become an `error` reply. Nothing is returned
//! to the transport as an error.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vizchat_core::frame::TabularFrame;
use vizchat_core::messages::{EventKind, InboundEvent, OutboundMessage};
use vizchat_core::models::{AssistantTurn, ChatSession, Dataset, UserTurn, VisualizationCandidate};
use vizchat_core::store::Store;

use crate::analyze::VisualizationAnalyzer;
use crate::config::{Config, PipelineConfig};
use crate::dataset;
use crate::error::PipelineError;
use crate::extract::DataExtractionStage;
use crate::llm::LlmClient;
use crate::recommend::{RefinementContext, VisualizationRecommender, VisualizationRefiner};
use crate::render::{RenderOutcome, RenderStage, RenderedArtifact};
use crate::sandbox::{CodeSandbox, SandboxLimits};
use crate::schema::{ensure_catalog, SchemaCatalog};
use crate::templates::TemplateStore;

/// Destination of outbound messages.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> anyhow::Result<()>;
}

/// Forwards replies into a channel (used by the websocket server).
pub struct ChannelSink(pub mpsc::UnboundedSender<OutboundMessage>);

#[async_trait]
impl ReplySink for ChannelSink {
    async fn send(&self, message: OutboundMessage) -> anyhow::Result<()> {
        self.0
            .send(message)
            .map_err(|_| anyhow!("reply channel closed"))
    }
}

/// A fully generated visualization, not yet persisted.
#[derive(Debug, Clone)]
pub struct GeneratedVisualization {
    pub candidate: VisualizationCandidate,
    pub extract_code: String,
    pub data: Arc<TabularFrame>,
    pub artifact: RenderedArtifact,
}

/// Template lookup, extraction and rendering for one candidate.
pub struct CandidatePipeline {
    templates: TemplateStore,
    extraction: DataExtractionStage,
    render: RenderStage,
}

impl CandidatePipeline {
    pub fn new(templates: TemplateStore, extraction: DataExtractionStage, render: RenderStage) -> Self {
        Self {
            templates,
            extraction,
            render,
        }
    }

    /// `Ok(None)` when every render attempt failed.
    pub async fn run(
        &self,
        schema: &SchemaCatalog,
        candidate: &VisualizationCandidate,
        working: Arc<TabularFrame>,
    ) -> Result<Option<GeneratedVisualization>, PipelineError> {
        let template = self.templates.lookup(&candidate.kind)?;
        let extraction = self
            .extraction
            .extract(schema, candidate, &template, working)
            .await?;
        match self
            .render
            .render(schema, candidate, extraction.frame.clone(), &template)
            .await?
        {
            RenderOutcome::Rendered(artifact) => Ok(Some(GeneratedVisualization {
                candidate: candidate.clone(),
                extract_code: extraction.code,
                data: extraction.frame,
                artifact,
            })),
            RenderOutcome::Exhausted { attempts, last_error } => {
                warn!(
                    kind = %candidate.kind,
                    attempts,
                    last_error = %last_error,
                    "dropping candidate after failed renders"
                );
                Ok(None)
            }
        }
    }
}

pub struct Orchestrator {
    store: Arc<dyn Store>,
    llm: Arc<dyn LlmClient>,
    settings: PipelineConfig,
    schema_retries: u32,
    recommender: VisualizationRecommender,
    refiner: VisualizationRefiner,
    analyzer: VisualizationAnalyzer,
    candidates: Arc<CandidatePipeline>,
    workers: Arc<Semaphore>,
    frames: RwLock<FrameCache>,
    sessions: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

/// Loaded working frames by dataset id; evicts the oldest load when full.
struct FrameCache {
    capacity: usize,
    frames: HashMap<String, Arc<TabularFrame>>,
    order: VecDeque<String>,
}

impl FrameCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            frames: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, id: &str) -> Option<Arc<TabularFrame>> {
        self.frames.get(id).cloned()
    }

    fn insert(&mut self, id: String, frame: Arc<TabularFrame>) {
        if self.frames.insert(id.clone(), frame).is_some() {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.frames.remove(&oldest);
                debug!(dataset = %oldest, "evicted cached frame");
            }
        }
    }

    fn len(&self) -> usize {
        self.frames.len()
    }
}

impl Orchestrator {
    pub fn new(config: &Config, store: Arc<dyn Store>, llm: Arc<dyn LlmClient>) -> Self {
        let settings = config.pipeline.clone();
        let schema_retries = config.llm.schema_retries;
        let templates = TemplateStore::new(&settings.templates_dir, &settings.template_ext);
        let kinds = templates.validate_kinds(&settings.chart_kinds);
        if kinds.is_empty() {
            warn!(
                dir = %settings.templates_dir.display(),
                "no chart kind has a reference template; nothing can be generated"
            );
        }
        let sandbox = CodeSandbox::new(SandboxLimits::from_config(&config.sandbox));

        let candidates = CandidatePipeline::new(
            templates,
            DataExtractionStage::new(llm.clone(), sandbox.clone(), schema_retries),
            RenderStage::new(
                llm.clone(),
                sandbox,
                &settings.artifacts_dir,
                settings.max_render_attempts,
                schema_retries,
            ),
        );

        Self {
            recommender: VisualizationRecommender::new(
                llm.clone(),
                kinds.clone(),
                settings.recommend_count,
                schema_retries,
            ),
            refiner: VisualizationRefiner::new(llm.clone(), kinds, settings.refine_count, schema_retries),
            analyzer: VisualizationAnalyzer::new(llm.clone(), schema_retries),
            candidates: Arc::new(candidates),
            workers: Arc::new(Semaphore::new(settings.max_concurrency.max(1))),
            frames: RwLock::new(FrameCache::new(settings.frame_cache_size)),
            sessions: Mutex::new(HashMap::new()),
            store,
            llm,
            settings,
            schema_retries,
        }
    }

    /// Handle one raw JSON event. Every failure becomes an `error` reply.
    pub async fn handle_raw(&self, text: &str, sink: &dyn ReplySink) {
        match serde_json::from_str::<InboundEvent>(text) {
            Ok(event) => self.handle(event, sink).await,
            Err(e) => {
                let err = PipelineError::InvalidEvent(e.to_string());
                warn!(error = %err, "rejecting inbound event");
                send(sink, OutboundMessage::error(err.to_string())).await;
            }
        }
    }

    /// Handle one parsed event. Every failure becomes an `error` reply.
    pub async fn handle(&self, event: InboundEvent, sink: &dyn ReplySink) {
        let session_id = event.user_message_body.session_id;
        let lock = self.session_lock(session_id);
        {
            let _guard = lock.lock().await;
            info!(session = %session_id, kind = ?event.kind, "handling event");
            if let Err(e) = self.dispatch(&event, sink).await {
                warn!(session = %session_id, error = %e, "event failed");
                send(sink, OutboundMessage::error(e.to_string())).await;
            }
        }
        self.release_session(session_id, lock);
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn session_lock(&self, id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.sessions().entry(id).or_default().clone()
    }

    /// Drop the session's lock entry unless another event holds or awaits it.
    fn release_session(&self, id: Uuid, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut sessions = self.sessions();
        // the map's handle plus ours
        if Arc::strong_count(&lock) <= 2 {
            sessions.remove(&id);
        }
    }

    /// Sessions with an event in flight or queued.
    pub fn active_sessions(&self) -> usize {
        self.sessions().len()
    }

    /// Number of working frames currently cached.
    pub async fn cached_frames(&self) -> usize {
        self.frames.read().await.len()
    }

    async fn dispatch(&self, event: &InboundEvent, sink: &dyn ReplySink) -> Result<(), PipelineError> {
        let session = self
            .store
            .get_session(event.user_message_body.session_id)
            .await?
            .ok_or(PipelineError::SessionNotFound(event.user_message_body.session_id))?;
        let dataset = self
            .store
            .get_dataset(&session.dataset_id)
            .await?
            .ok_or_else(|| PipelineError::DatasetNotFound(session.dataset_id.clone()))?;
        let question = event.user_message_body.question.as_str();

        match event.kind {
            EventKind::GenerateVisualizations => {
                send(sink, OutboundMessage::ack("Generating visualization types...")).await;
                let user_turn = UserTurn::new(session.id, question, None);
                self.store.create_user_turn(&user_turn).await?;

                let (catalog, working) = self.prepare(&dataset).await?;
                let candidates = self.recommender.recommend(&catalog, question).await;
                send(
                    sink,
                    OutboundMessage::ack(format!(
                        "Generated visualization types: {}",
                        kind_list(&candidates)
                    )),
                )
                .await;
                self.run_candidates(&session, &user_turn, catalog, working, candidates, sink)
                    .await
            }
            EventKind::RefineVisualizations => {
                let prior_id = reply_target(event)?;
                send(sink, OutboundMessage::ack("Refining visualization...")).await;
                let prior = self.prior_turn(&session, prior_id).await?;
                let user_turn = UserTurn::new(session.id, question, Some(prior.id));
                self.store.create_user_turn(&user_turn).await?;

                let recent = self
                    .store
                    .recent_questions(session.id, self.settings.history_window)
                    .await?;
                let context = RefinementContext::new(question, &prior, &recent);
                let (catalog, working) = self.prepare(&dataset).await?;
                let candidates = self.refiner.refine(&catalog, question, &context).await;
                send(
                    sink,
                    OutboundMessage::ack(format!(
                        "Refined visualization types: {}",
                        kind_list(&candidates)
                    )),
                )
                .await;
                self.run_candidates(&session, &user_turn, catalog, working, candidates, sink)
                    .await
            }
            EventKind::AnalyzeVisualization => {
                let prior_id = reply_target(event)?;
                send(sink, OutboundMessage::ack("Analyzing visualization...")).await;
                let prior = self.prior_turn(&session, prior_id).await?;
                let user_turn = UserTurn::new(session.id, question, Some(prior.id));
                self.store.create_user_turn(&user_turn).await?;

                let catalog = SchemaCatalog::from_dataset(&dataset).unwrap_or_default();
                let analysis = match self
                    .analyzer
                    .analyze(
                        prior.raster_base64().as_deref(),
                        &catalog.properties_for(&prior.columns_involved),
                        &prior.reason,
                        question,
                    )
                    .await
                {
                    Ok(analysis) => {
                        self.store.attach_analysis(prior.id, &analysis).await?;
                        analysis
                    }
                    // replied to, never stored
                    Err(e) => format!("Error: {}", e),
                };
                send(sink, OutboundMessage::analysis(&prior, &analysis)).await;
                Ok(())
            }
        }
    }

    async fn prior_turn(&self, session: &ChatSession, id: Uuid) -> Result<AssistantTurn, PipelineError> {
        self.store
            .get_assistant_turn(id)
            .await?
            .filter(|turn| turn.session_id == session.id)
            .ok_or(PipelineError::AssistantTurnNotFound(id))
    }

    /// Enriched schema and working frame of `dataset`.
    async fn prepare(&self, dataset: &Dataset) -> Result<(Arc<SchemaCatalog>, Arc<TabularFrame>), PipelineError> {
        let working = self.working_frame(dataset).await?;
        let catalog = ensure_catalog(
            self.store.as_ref(),
            self.llm.as_ref(),
            dataset,
            &working,
            self.settings.sample_values,
            self.schema_retries,
        )
        .await?;
        Ok((Arc::new(catalog), working))
    }

    async fn working_frame(&self, dataset: &Dataset) -> Result<Arc<TabularFrame>, PipelineError> {
        if let Some(frame) = self.frames.read().await.get(&dataset.id) {
            return Ok(frame);
        }
        let frame = dataset::load_frame(&dataset.uri)
            .await
            .map_err(|e| PipelineError::DataLoad(format!("{}: {:#}", dataset.uri, e)))?;
        info!(dataset = %dataset.id, rows = frame.len(), columns = frame.columns.len(), "loaded dataset");
        let frame = Arc::new(frame);
        self.frames.write().await.insert(dataset.id.clone(), frame.clone());
        Ok(frame)
    }

    /// Run every candidate concurrently; persist and stream each success as
    /// it completes.
    async fn run_candidates(
        &self,
        session: &ChatSession,
        user_turn: &UserTurn,
        catalog: Arc<SchemaCatalog>,
        working: Arc<TabularFrame>,
        candidates: Vec<VisualizationCandidate>,
        sink: &dyn ReplySink,
    ) -> Result<(), PipelineError> {
        let total = candidates.len();
        let mut tasks = JoinSet::new();
        for candidate in candidates {
            let pipeline = self.candidates.clone();
            let workers = self.workers.clone();
            let catalog = catalog.clone();
            let working = working.clone();
            tasks.spawn(async move {
                let _permit = workers
                    .acquire_owned()
                    .await
                    .map_err(|e| PipelineError::Storage(anyhow!("worker pool closed: {}", e)))?;
                let result = pipeline.run(&catalog, &candidate, working).await;
                if let Err(e) = &result {
                    warn!(kind = %candidate.kind, error = %e, "dropping candidate");
                }
                result
            });
        }

        let mut delivered = 0usize;
        while let Some(joined) = tasks.join_next().await {
            let generated = match joined {
                Ok(Ok(Some(generated))) => generated,
                Ok(Ok(None)) | Ok(Err(_)) => continue,
                Err(e) => {
                    warn!(error = %e, "candidate task failed");
                    continue;
                }
            };
            let turn = assistant_turn(session, user_turn, generated);
            if let Err(e) = self.store.create_assistant_turn(&turn).await {
                warn!(kind = %turn.viz_name, error = %e, "failed to persist visualization; dropping it");
                continue;
            }
            send(sink, OutboundMessage::viz_code(&turn)).await;
            delivered += 1;
        }
        info!(
            session = %session.id,
            candidates = total,
            delivered,
            "event complete"
        );
        Ok(())
    }
}

fn assistant_turn(session: &ChatSession, user_turn: &UserTurn, generated: GeneratedVisualization) -> AssistantTurn {
    AssistantTurn {
        id: Uuid::new_v4(),
        session_id: session.id,
        parent_user_turn_id: Some(user_turn.id),
        viz_name: generated.candidate.kind,
        columns_involved: generated.candidate.columns_involved,
        reason: generated.candidate.reason,
        extract_code: generated.extract_code,
        svg_json: generated.artifact.svg_json(),
        render_code: generated.artifact.code,
        data: generated.data.to_records(),
        extra_attrs: serde_json::json!({}),
        created_at: chrono::Utc::now().timestamp(),
    }
}

fn reply_target(event: &InboundEvent) -> Result<Uuid, PipelineError> {
    event.reply_to_assistant_message_uuid.ok_or_else(|| {
        PipelineError::InvalidEvent(format!(
            "{:?} requires reply_to_assistant_message_uuid",
            event.kind
        ))
    })
}

fn kind_list(candidates: &[VisualizationCandidate]) -> String {
    if candidates.is_empty() {
        return "none".to_string();
    }
    candidates
        .iter()
        .map(|c| c.kind.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Send, logging a closed transport instead of failing the event.
async fn send(sink: &dyn ReplySink, message: OutboundMessage) {
    let kind = message.kind();
    if let Err(e) = sink.send(message).await {
        warn!(kind, error = %e, "failed to deliver reply");
    }
}
