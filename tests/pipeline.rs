use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use uuid::Uuid;

use vizchat::config::Config;
use vizchat::error::PipelineError;
use vizchat::extract::DataExtractionStage;
use vizchat::llm::{Completion, LlmClient, Prompt};
use vizchat::orchestrator::{CandidatePipeline, Orchestrator, ReplySink};
use vizchat::render::RenderStage;
use vizchat::sandbox::CodeSandbox;
use vizchat::schema::SchemaCatalog;
use vizchat::templates::TemplateStore;
use vizchat_core::frame::TabularFrame;
use vizchat_core::messages::OutboundMessage;
use vizchat_core::models::{
    AssistantTurn, ChatSession, ColumnProperty, ColumnSchema, Dataset, UserTurn, VisualizationCandidate,
};
use vizchat_core::store::memory::InMemoryStore;
use vizchat_core::store::Store;

const CARS: &str = "year,engine_size,city_mpg,highway_mpg,vehicle_type
2018,1.6,31,40,sedan
2018,3.0,19,25,suv
2019,2.0,26,33,sedan
2019,5.0,14,19,truck
2020,1.8,29,38,sedan
2020,3.5,,24,suv
2021,2.5,22,30,suv
2022,4.0,16,21,truck
2022,1.5,33,42,sedan
";

const SCATTER_EXTRACT: &str = "```lua\nextract_df = frame.select(frame.dropna(df, {'engine_size', 'city_mpg'}), {'engine_size', 'city_mpg'})\n```";
const SCATTER_RENDER: &str = "plt.figure({ title = 'Engine size vs mpg' })\nplt.scatter(frame.column(df, 'engine_size'), frame.column(df, 'city_mpg'))\nplt.savefig(save_file_name)";
const BAR_EXTRACT: &str = "local c = frame.dropna(df, {'vehicle_type', 'city_mpg'})\nextract_df = frame.group_by(c, 'vehicle_type', { avg_city_mpg = { 'city_mpg', 'mean' } })";
const BAR_RENDER: &str = "plt.bar(frame.column(df, 'vehicle_type'), frame.column(df, 'avg_city_mpg'))\nplt.savefig(save_file_name)";

/// LLM double answering per signature; records every prompt.
#[derive(Default)]
struct ScriptedLlm {
    replies: Mutex<HashMap<&'static str, Value>>,
    code: Mutex<HashMap<(&'static str, String), String>>,
    delays: Mutex<HashMap<(&'static str, String), Duration>>,
    prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedLlm {
    fn reply(self: &Arc<Self>, signature: &'static str, value: Value) -> Arc<Self> {
        self.replies.lock().unwrap().insert(signature, value);
        self.clone()
    }

    fn code(self: &Arc<Self>, signature: &'static str, kind: &str, code: &str) -> Arc<Self> {
        self.code
            .lock()
            .unwrap()
            .insert((signature, kind.to_string()), code.to_string());
        self.clone()
    }

    fn slow(self: &Arc<Self>, signature: &'static str, kind: &str, delay: Duration) -> Arc<Self> {
        self.delays
            .lock()
            .unwrap()
            .insert((signature, kind.to_string()), delay);
        self.clone()
    }

    fn prompts_for(&self, signature: &str) -> Vec<Prompt> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.name() == signature)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, prompt: &Prompt) -> Result<Completion> {
        self.prompts.lock().unwrap().push(prompt.clone());
        let name = prompt.name();
        let delay = prompt
            .value("visualization_type")
            .and_then(|kind| self.delays.lock().unwrap().get(&(name, kind.to_string())).copied());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(kind) = prompt.value("visualization_type") {
            if let Some(code) = self.code.lock().unwrap().get(&(name, kind.to_string())) {
                return Completion::from_value(json!({ "code": code }));
            }
        }
        match self.replies.lock().unwrap().get(name) {
            Some(value) => Completion::from_value(value.clone()),
            None => anyhow::bail!("no scripted reply for {}", name),
        }
    }
}

#[derive(Default)]
struct CapturingSink {
    messages: Mutex<Vec<Value>>,
}

impl CapturingSink {
    fn all(&self) -> Vec<Value> {
        self.messages.lock().unwrap().clone()
    }

    fn of_type(&self, kind: &str) -> Vec<Value> {
        self.all().into_iter().filter(|m| m["type"] == kind).collect()
    }
}

#[async_trait]
impl ReplySink for CapturingSink {
    async fn send(&self, message: OutboundMessage) -> Result<()> {
        self.messages
            .lock()
            .unwrap()
            .push(serde_json::to_value(&message)?);
        Ok(())
    }
}

/// Store whose first assistant-turn write fails.
struct FlakyStore {
    inner: InMemoryStore,
    failed: AtomicBool,
}

#[async_trait]
impl Store for FlakyStore {
    async fn create_dataset(&self, dataset: &Dataset) -> Result<()> {
        self.inner.create_dataset(dataset).await
    }

    async fn get_dataset(&self, id: &str) -> Result<Option<Dataset>> {
        self.inner.get_dataset(id).await
    }

    async fn save_enrichment(
        &self,
        dataset_id: &str,
        column_properties: &[ColumnProperty],
        dataset_schema: &[ColumnSchema],
    ) -> Result<()> {
        self.inner
            .save_enrichment(dataset_id, column_properties, dataset_schema)
            .await
    }

    async fn update_description(&self, dataset_id: &str, description: &str) -> Result<()> {
        self.inner.update_description(dataset_id, description).await
    }

    async fn create_session(&self, session: &ChatSession) -> Result<()> {
        self.inner.create_session(session).await
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<ChatSession>> {
        self.inner.get_session(id).await
    }

    async fn create_user_turn(&self, turn: &UserTurn) -> Result<()> {
        self.inner.create_user_turn(turn).await
    }

    async fn recent_questions(&self, session_id: Uuid, limit: usize) -> Result<Vec<String>> {
        self.inner.recent_questions(session_id, limit).await
    }

    async fn create_assistant_turn(&self, turn: &AssistantTurn) -> Result<()> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        self.inner.create_assistant_turn(turn).await
    }

    async fn get_assistant_turn(&self, id: Uuid) -> Result<Option<AssistantTurn>> {
        self.inner.get_assistant_turn(id).await
    }

    async fn attach_analysis(&self, id: Uuid, analysis: &str) -> Result<()> {
        self.inner.attach_analysis(id, analysis).await
    }

    async fn list_assistant_turns(&self, session_id: Uuid) -> Result<Vec<AssistantTurn>> {
        self.inner.list_assistant_turns(session_id).await
    }
}

struct Env {
    _tmp: TempDir,
    config: Config,
    store: Arc<InMemoryStore>,
    session: ChatSession,
}

fn copy_templates(to: &Path) {
    let from = Path::new(env!("CARGO_MANIFEST_DIR")).join("templates");
    fs::create_dir_all(to).unwrap();
    for entry in fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        fs::copy(entry.path(), to.join(entry.file_name())).unwrap();
    }
}

async fn setup() -> Env {
    let tmp = TempDir::new().unwrap();
    let csv = tmp.path().join("cars.csv");
    fs::write(&csv, CARS).unwrap();
    copy_templates(&tmp.path().join("templates"));

    let mut config = Config::default();
    config.pipeline.templates_dir = tmp.path().join("templates");
    config.pipeline.artifacts_dir = tmp.path().join("artifacts");
    config.llm.schema_retries = 0;

    let store = Arc::new(InMemoryStore::new());
    let dataset = Dataset::new(&csv.to_string_lossy(), "cars", "");
    store.create_dataset(&dataset).await.unwrap();
    let session = ChatSession::new(&dataset.id);
    store.create_session(&session).await.unwrap();

    Env {
        _tmp: tmp,
        config,
        store,
        session,
    }
}

fn event(kind: &str, session: Uuid, question: &str, reply_to: Option<Uuid>) -> String {
    json!({
        "type": kind,
        "user_message_body": { "question": question, "session_id": session },
        "reply_to_assistant_message_uuid": reply_to,
    })
    .to_string()
}

fn recommend_both() -> Value {
    json!({ "visualizations": [
        {
            "visualization_type": "scatter_plot_chart",
            "columns_involved": ["engine_size", "city_mpg"],
            "reason": "Larger engines tend to have lower city mpg."
        },
        {
            "visualization_type": "bar_chart",
            "columns_involved": ["vehicle_type", "city_mpg"],
            "reason": "Compare average mpg per vehicle type."
        }
    ]})
}

fn working_llm() -> Arc<ScriptedLlm> {
    Arc::new(ScriptedLlm::default())
        .reply("EnrichColumn", json!({ "semantic_type": "measurement", "description": "a column" }))
        .reply("RecommendVisualizations", recommend_both())
        .code("GenerateExtractionCode", "scatter_plot_chart", SCATTER_EXTRACT)
        .code("GenerateRenderCode", "scatter_plot_chart", SCATTER_RENDER)
        .code("GenerateExtractionCode", "bar_chart", BAR_EXTRACT)
        .code("GenerateRenderCode", "bar_chart", BAR_RENDER)
}

#[tokio::test]
async fn fresh_generation_streams_visualizations() {
    let env = setup().await;
    let llm = working_llm();
    let orchestrator = Orchestrator::new(&env.config, env.store.clone(), llm.clone());
    let sink = CapturingSink::default();

    orchestrator
        .handle_raw(
            &event(
                "generate_visualizations",
                env.session.id,
                "How does engine size correlate with fuel efficiency?",
                None,
            ),
            &sink,
        )
        .await;

    let messages = sink.all();
    assert_eq!(messages[0]["type"], "ack");
    assert_eq!(messages[0]["content"], "Generating visualization types...");
    assert_eq!(messages[1]["content"], "Generated visualization types: scatter_plot_chart, bar_chart");
    assert!(sink.of_type("error").is_empty());

    let viz = sink.of_type("viz_code");
    assert_eq!(viz.len(), 2);
    for message in &viz {
        assert_eq!(message["role"], "assistant");
        assert!(!message["pd_code"].as_str().unwrap().is_empty());
        assert!(!message["pd_viz_code"].as_str().unwrap().contains("```"));
        let svg_json: Value = serde_json::from_str(message["svg_json"].as_str().unwrap()).unwrap();
        assert!(svg_json["svg"].as_str().unwrap().contains("<svg"));
        assert!(!svg_json["png_base64"].as_str().unwrap().is_empty());
        assert!(!message["data"].as_array().unwrap().is_empty());
    }
    let scatter = viz.iter().find(|m| m["viz_name"] == "scatter_plot_chart").unwrap();
    assert_eq!(scatter["data"].as_array().unwrap().len(), 8);
    assert_eq!(scatter["columns_involved"], json!(["engine_size", "city_mpg"]));

    // persisted with the user turn as parent; dataset enriched lazily
    let turns = env.store.list_assistant_turns(env.session.id).await.unwrap();
    assert_eq!(turns.len(), 2);
    assert!(turns.iter().all(|t| t.parent_user_turn_id.is_some()));
    let dataset = env.store.get_dataset(&env.session.dataset_id).await.unwrap().unwrap();
    assert!(dataset.is_enriched());
    assert_eq!(dataset.dataset_schema.unwrap().len(), 5);

    // the render prompt only describes columns of the extracted frame
    for prompt in llm.prompts_for("GenerateRenderCode") {
        if prompt.value("visualization_type") == Some("scatter_plot_chart") {
            assert!(!prompt.value("column_properties").unwrap().contains("vehicle_type"));
        }
    }
    // templates are passed to code generation
    let extraction = llm.prompts_for("GenerateExtractionCode");
    assert!(extraction[0].value("reference_docs").unwrap().contains("-- @extract"));
}

#[tokio::test]
async fn refinement_context_carries_prior_turn() {
    let env = setup().await;
    let llm = working_llm().reply(
        "RefineVisualizations",
        json!({ "visualizations": [{
            "visualization_type": "bar_chart",
            "columns_involved": ["vehicle_type", "city_mpg"],
            "reason": "Split by vehicle type."
        }]}),
    );
    let orchestrator = Orchestrator::new(&env.config, env.store.clone(), llm.clone());
    let first = CapturingSink::default();
    orchestrator
        .handle_raw(
            &event("generate_visualizations", env.session.id, "Engine size vs mpg?", None),
            &first,
        )
        .await;
    let scatter = first
        .of_type("viz_code")
        .into_iter()
        .find(|m| m["viz_name"] == "scatter_plot_chart")
        .unwrap();
    let prior_id: Uuid = serde_json::from_value(scatter["assistant_message_uuid"].clone()).unwrap();

    let sink = CapturingSink::default();
    orchestrator
        .handle_raw(
            &event(
                "refine_visualizations",
                env.session.id,
                "Now split it by vehicle type",
                Some(prior_id),
            ),
            &sink,
        )
        .await;

    let messages = sink.all();
    assert_eq!(messages[0]["content"], "Refining visualization...");
    assert_eq!(messages[1]["content"], "Refined visualization types: bar_chart");
    assert_eq!(sink.of_type("viz_code").len(), 1);

    let refine = llm.prompts_for("RefineVisualizations");
    assert_eq!(refine.len(), 1);
    let context = refine[0].value("context").unwrap();
    assert!(context.contains("Larger engines tend to have lower city mpg."));
    assert!(context.contains("scatter_plot_chart"));
    assert!(context.contains("Previous question: Engine size vs mpg?"));
}

#[tokio::test]
async fn analysis_of_broken_raster_replies_error_without_storing() {
    let env = setup().await;
    let turn = AssistantTurn {
        id: Uuid::new_v4(),
        session_id: env.session.id,
        parent_user_turn_id: None,
        viz_name: "scatter_plot_chart".into(),
        columns_involved: vec!["engine_size".into(), "city_mpg".into()],
        reason: "correlation".into(),
        extract_code: "extract_df = df".into(),
        render_code: "plt.savefig(save_file_name)".into(),
        svg_json: json!({ "svg": "<svg/>", "png_base64": "bm90IGFuIGltYWdl" }).to_string(),
        data: vec![json!({"engine_size": 1.6, "city_mpg": 31})],
        extra_attrs: json!({}),
        created_at: 0,
    };
    env.store.create_assistant_turn(&turn).await.unwrap();

    let llm = Arc::new(ScriptedLlm::default()).reply("AnalyzeVisualization", json!({"analysis": "fine"}));
    let orchestrator = Orchestrator::new(&env.config, env.store.clone(), llm.clone());
    let sink = CapturingSink::default();
    orchestrator
        .handle_raw(
            &event("analyze_visualization", env.session.id, "What does it show?", Some(turn.id)),
            &sink,
        )
        .await;

    let messages = sink.all();
    assert_eq!(messages[0]["content"], "Analyzing visualization...");
    let analysis = sink.of_type("analyze_visualization");
    assert_eq!(analysis.len(), 1);
    assert_eq!(analysis[0]["assistant_message_uuid"], json!(turn.id));
    assert!(analysis[0]["reason"].as_str().unwrap().starts_with("Error"));
    assert_eq!(analysis[0]["data"], json!([]));
    assert!(llm.prompts_for("AnalyzeVisualization").is_empty());

    let stored = env.store.get_assistant_turn(turn.id).await.unwrap().unwrap();
    assert!(stored.analysis().is_none());
}

#[tokio::test]
async fn analysis_of_rendered_chart_uses_vision() {
    let env = setup().await;
    let llm = working_llm().reply(
        "AnalyzeVisualization",
        json!({"analysis": "City mpg falls as engine size grows."}),
    );
    let orchestrator = Orchestrator::new(&env.config, env.store.clone(), llm.clone());
    let first = CapturingSink::default();
    orchestrator
        .handle_raw(&event("generate_visualizations", env.session.id, "mpg?", None), &first)
        .await;
    let prior = &first.of_type("viz_code")[0];
    let prior_id: Uuid = serde_json::from_value(prior["assistant_message_uuid"].clone()).unwrap();

    let sink = CapturingSink::default();
    orchestrator
        .handle_raw(
            &event("analyze_visualization", env.session.id, "Explain", Some(prior_id)),
            &sink,
        )
        .await;
    let analysis = sink.of_type("analyze_visualization");
    assert_eq!(analysis[0]["reason"], "City mpg falls as engine size grows.");
    assert_eq!(analysis[0]["viz_name"], prior["viz_name"]);
    assert_eq!(analysis[0]["pd_code"], prior["pd_code"]);

    let prompts = llm.prompts_for("AnalyzeVisualization");
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0].images.len(), 1);
    // no new assistant turn for an analysis
    assert_eq!(env.store.assistant_turn_count(), 2);
}

#[tokio::test]
async fn all_extractions_failing_still_completes() {
    let env = setup().await;
    let llm = working_llm()
        .code("GenerateExtractionCode", "scatter_plot_chart", "error('bad extraction')")
        .code("GenerateExtractionCode", "bar_chart", "local nothing = 1");
    let orchestrator = Orchestrator::new(&env.config, env.store.clone(), llm.clone());
    let sink = CapturingSink::default();
    orchestrator
        .handle_raw(&event("generate_visualizations", env.session.id, "mpg?", None), &sink)
        .await;

    let messages = sink.all();
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().all(|m| m["type"] == "ack"));
    assert!(llm.prompts_for("GenerateRenderCode").is_empty());
    assert_eq!(env.store.assistant_turn_count(), 0);
}

#[tokio::test]
async fn failing_render_is_dropped_after_max_attempts() {
    let env = setup().await;
    let llm = working_llm()
        .reply(
            "RecommendVisualizations",
            json!({ "visualizations": [{
                "visualization_type": "scatter_plot_chart",
                "columns_involved": ["engine_size", "city_mpg"],
                "reason": "correlation"
            }]}),
        )
        .code("GenerateRenderCode", "scatter_plot_chart", "plt.scatter({1}, {'x'})");
    let orchestrator = Orchestrator::new(&env.config, env.store.clone(), llm.clone());
    let sink = CapturingSink::default();
    orchestrator
        .handle_raw(&event("generate_visualizations", env.session.id, "mpg?", None), &sink)
        .await;

    assert_eq!(llm.prompts_for("GenerateRenderCode").len(), 5);
    assert!(sink.of_type("viz_code").is_empty());
    assert!(sink.of_type("error").is_empty());
}

#[tokio::test]
async fn recommendation_failure_degrades_to_no_candidates() {
    let env = setup().await;
    let llm = Arc::new(ScriptedLlm::default());
    let orchestrator = Orchestrator::new(&env.config, env.store.clone(), llm);
    let sink = CapturingSink::default();
    orchestrator
        .handle_raw(&event("generate_visualizations", env.session.id, "mpg?", None), &sink)
        .await;
    let messages = sink.all();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1]["content"], "Generated visualization types: none");
}

#[tokio::test]
async fn unknown_session_and_bad_events_reply_with_error() {
    let env = setup().await;
    let orchestrator = Orchestrator::new(&env.config, env.store.clone(), working_llm());

    let sink = CapturingSink::default();
    let missing = Uuid::new_v4();
    orchestrator
        .handle_raw(&event("generate_visualizations", missing, "mpg?", None), &sink)
        .await;
    let messages = sink.all();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["type"], "error");
    assert_eq!(messages[0]["role"], "assistant");
    assert!(messages[0]["content"].as_str().unwrap().contains(&missing.to_string()));

    let sink = CapturingSink::default();
    orchestrator.handle_raw("{\"type\": \"dance\"}", &sink).await;
    assert_eq!(sink.of_type("error").len(), 1);

    let sink = CapturingSink::default();
    orchestrator
        .handle_raw(&event("refine_visualizations", env.session.id, "more", None), &sink)
        .await;
    let errors = sink.of_type("error");
    assert_eq!(errors.len(), 1);
    assert!(errors[0]["content"].as_str().unwrap().contains("reply_to_assistant_message_uuid"));

    let sink = CapturingSink::default();
    orchestrator
        .handle_raw(
            &event("analyze_visualization", env.session.id, "why", Some(Uuid::new_v4())),
            &sink,
        )
        .await;
    assert_eq!(sink.of_type("error").len(), 1);
}

#[tokio::test]
async fn missing_template_fails_before_code_generation() {
    let tmp = TempDir::new().unwrap();
    let llm = working_llm();
    let sandbox = CodeSandbox::default();
    let pipeline = CandidatePipeline::new(
        TemplateStore::new(tmp.path(), "lua"),
        DataExtractionStage::new(llm.clone(), sandbox.clone(), 0),
        RenderStage::new(llm.clone(), sandbox, tmp.path().join("artifacts"), 5, 0),
    );
    let candidate = VisualizationCandidate {
        kind: "scatter_plot_chart".into(),
        columns_involved: vec!["engine_size".into()],
        reason: "r".into(),
    };
    let frame = Arc::new(TabularFrame::from_json(&json!([{"engine_size": 1.0}])).unwrap());

    for _ in 0..2 {
        let err = pipeline
            .run(&SchemaCatalog::default(), &candidate, frame.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::TemplateNotFound { ref kind, .. } if kind == "scatter_plot_chart"));
    }
    assert!(llm.prompts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn persist_failure_keeps_sibling_candidates_running() {
    let env = setup().await;
    let store = Arc::new(FlakyStore {
        inner: InMemoryStore::new(),
        failed: AtomicBool::new(false),
    });
    let dataset = env.store.get_dataset(&env.session.dataset_id).await.unwrap().unwrap();
    store.create_dataset(&dataset).await.unwrap();
    store.create_session(&env.session).await.unwrap();

    // the scatter chart finishes first and its write fails; the bar chart is still rendering
    let llm = working_llm().slow("GenerateRenderCode", "bar_chart", Duration::from_millis(1500));
    let orchestrator = Orchestrator::new(&env.config, store.clone(), llm);
    let sink = CapturingSink::default();
    orchestrator
        .handle_raw(&event("generate_visualizations", env.session.id, "mpg?", None), &sink)
        .await;

    assert!(sink.of_type("error").is_empty());
    let viz = sink.of_type("viz_code");
    assert_eq!(viz.len(), 1);
    assert_eq!(viz[0]["viz_name"], "bar_chart");
    let turns = store.list_assistant_turns(env.session.id).await.unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].viz_name, "bar_chart");
}

#[tokio::test]
async fn finished_events_release_session_locks() {
    let env = setup().await;
    let orchestrator = Orchestrator::new(&env.config, env.store.clone(), working_llm());
    let (first, second) = (CapturingSink::default(), CapturingSink::default());
    let first_event = event("generate_visualizations", env.session.id, "mpg?", None);
    let second_event = event("generate_visualizations", env.session.id, "size?", None);
    tokio::join!(
        orchestrator.handle_raw(&first_event, &first),
        orchestrator.handle_raw(&second_event, &second),
    );
    assert_eq!(first.of_type("viz_code").len(), 2);
    assert_eq!(second.of_type("viz_code").len(), 2);
    assert_eq!(orchestrator.active_sessions(), 0);

    // an unknown session never leaves an entry behind either
    let sink = CapturingSink::default();
    orchestrator
        .handle_raw(&event("generate_visualizations", Uuid::new_v4(), "q", None), &sink)
        .await;
    assert_eq!(orchestrator.active_sessions(), 0);
}

#[tokio::test]
async fn frame_cache_keeps_configured_number_of_datasets() {
    let mut env = setup().await;
    env.config.pipeline.frame_cache_size = 1;
    let csv = env._tmp.path().join("more_cars.csv");
    fs::write(&csv, CARS).unwrap();
    let other = Dataset::new(&csv.to_string_lossy(), "more cars", "");
    env.store.create_dataset(&other).await.unwrap();
    let other_session = ChatSession::new(&other.id);
    env.store.create_session(&other_session).await.unwrap();

    let orchestrator = Orchestrator::new(&env.config, env.store.clone(), working_llm());
    for session in [env.session.id, other_session.id] {
        let sink = CapturingSink::default();
        orchestrator
            .handle_raw(&event("generate_visualizations", session, "mpg?", None), &sink)
            .await;
        assert_eq!(sink.of_type("viz_code").len(), 2);
        assert_eq!(orchestrator.cached_frames().await, 1);
    }
}
