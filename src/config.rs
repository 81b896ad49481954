//! TOML configuration.
//!
//! Every section and field has a default so a minimal file (or an empty one)
//! is valid; [`load_config`] parses and validates.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/vizchat.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_model")]
    pub vision_model: String,
    #[serde(default = "default_llm_url")]
    pub url: String,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_schema_retries")]
    pub schema_retries: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            vision_model: default_model(),
            url: default_llm_url(),
            temperature: 0.0,
            max_retries: default_max_retries(),
            schema_retries: default_schema_retries(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_schema_retries() -> u32 {
    1
}
fn default_llm_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_templates_dir")]
    pub templates_dir: PathBuf,
    #[serde(default = "default_template_ext")]
    pub template_ext: String,
    #[serde(default = "default_chart_kinds")]
    pub chart_kinds: Vec<String>,
    #[serde(default = "default_recommend_count")]
    pub recommend_count: usize,
    #[serde(default = "default_refine_count")]
    pub refine_count: usize,
    #[serde(default = "default_max_render_attempts")]
    pub max_render_attempts: u32,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
    #[serde(default = "default_sample_values")]
    pub sample_values: usize,
    /// Datasets whose parsed frames stay in memory.
    #[serde(default = "default_frame_cache_size")]
    pub frame_cache_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            templates_dir: default_templates_dir(),
            template_ext: default_template_ext(),
            chart_kinds: default_chart_kinds(),
            recommend_count: default_recommend_count(),
            refine_count: default_refine_count(),
            max_render_attempts: default_max_render_attempts(),
            max_concurrency: default_max_concurrency(),
            history_window: default_history_window(),
            artifacts_dir: default_artifacts_dir(),
            sample_values: default_sample_values(),
            frame_cache_size: default_frame_cache_size(),
        }
    }
}

fn default_templates_dir() -> PathBuf {
    PathBuf::from("./templates")
}
fn default_template_ext() -> String {
    "lua".to_string()
}
fn default_chart_kinds() -> Vec<String> {
    [
        "area_chart",
        "line_chart",
        "bar_chart",
        "pie_chart",
        "scatter_plot_chart",
        "hexbin_chart",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_recommend_count() -> usize {
    4
}
fn default_refine_count() -> usize {
    2
}
fn default_max_render_attempts() -> u32 {
    5
}
fn default_max_concurrency() -> usize {
    10
}
fn default_history_window() -> usize {
    5
}
fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("./data/artifacts")
}
fn default_sample_values() -> usize {
    3
}
fn default_frame_cache_size() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    #[serde(default = "default_sandbox_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_sandbox_timeout_secs(),
            memory_limit_mb: default_memory_limit_mb(),
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_sandbox_timeout_secs() -> u64 {
    30
}
fn default_memory_limit_mb() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "config file not found; using defaults");
        return parse_config("");
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    match config.llm.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be openai or disabled.",
            other
        ),
    }
    if config.llm.is_enabled() && config.llm.model.trim().is_empty() {
        anyhow::bail!("llm.model must be set when provider is '{}'", config.llm.provider);
    }

    let pipeline = &config.pipeline;
    if pipeline.chart_kinds.is_empty() {
        anyhow::bail!("pipeline.chart_kinds must not be empty");
    }
    if pipeline.recommend_count == 0 {
        anyhow::bail!("pipeline.recommend_count must be >= 1");
    }
    if pipeline.refine_count == 0 || pipeline.refine_count > pipeline.recommend_count {
        anyhow::bail!("pipeline.refine_count must be in [1, recommend_count]");
    }
    if pipeline.max_render_attempts == 0 {
        anyhow::bail!("pipeline.max_render_attempts must be >= 1");
    }
    if pipeline.max_concurrency == 0 {
        anyhow::bail!("pipeline.max_concurrency must be >= 1");
    }
    if pipeline.frame_cache_size == 0 {
        anyhow::bail!("pipeline.frame_cache_size must be >= 1");
    }
    if config.sandbox.timeout_secs == 0 {
        anyhow::bail!("sandbox.timeout_secs must be > 0");
    }

    Ok(config)
}
