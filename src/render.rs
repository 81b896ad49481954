//! Render stage: generated plotting code, run until it produces a chart.
//!
//! Each attempt asks the model for plotting code, runs it against the
//! extracted frame and reads back the SVG it saved. A failed attempt feeds
//! its code and error into the next prompt. After `max_attempts` failures
//! the candidate is given up.
//!
//! ```text
//! Attempting(1, None) ──fail──▶ Attempting(2, Some(code, err)) ── … ──▶ ExhaustedFailed
//!        │                              │
//!        └──────────ok──────────────────┴──▶ Succeeded(artifact)
//! ```
//!
//! Every attempt writes to its own file under the artifacts directory, so
//! concurrent candidates of the same kind never share an output path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vizchat_core::frame::TabularFrame;
use vizchat_core::models::VisualizationCandidate;

use crate::error::PipelineError;
use crate::extract::CodeReply;
use crate::llm::{complete_as, field, LlmClient, Prompt, Signature};
use crate::plot::{render_png, Figure, PlotSurface};
use crate::sandbox::{clean_code, Bindings, CodeSandbox};
use crate::schema::SchemaCatalog;
use crate::templates::ReferenceTemplate;

/// A rendered chart in the forms the client consumes.
#[derive(Debug, Clone)]
pub struct RenderedArtifact {
    pub code: String,
    pub svg_text: String,
    pub raster_base64: String,
}

impl RenderedArtifact {
    /// `{"svg": ..., "png_base64": ...}` as a JSON string.
    pub fn svg_json(&self) -> String {
        serde_json::json!({
            "svg": self.svg_text,
            "png_base64": self.raster_base64,
        })
        .to_string()
    }
}

#[derive(Debug)]
pub enum RenderOutcome {
    Rendered(RenderedArtifact),
    Exhausted { attempts: u32, last_error: String },
}

/// Code and error of the last failed attempt.
#[derive(Debug, Clone)]
struct Failure {
    code: String,
    error: String,
}

#[derive(Debug)]
enum RenderState {
    Attempting { attempt: u32, last: Option<Failure> },
    Succeeded(RenderedArtifact),
    ExhaustedFailed { attempts: u32, last: Option<Failure> },
}

fn render_signature() -> Signature {
    Signature {
        name: "GenerateRenderCode",
        instructions: "You write Lua 5.4 code that draws one chart. The chart data is \
            bound as `df`, a frame table { columns = {...}, rows = { {col = value}, ... } }. \
            Draw with the `plt` API exactly as in the reference template, optionally add \
            hover labels with `interact.hover`, and finish with `plt.savefig(save_file_name)`. \
            Use only the columns listed in column_properties. If previous_code and error \
            are given, the previous attempt failed with that error: fix the cause. \
            Reply with a JSON object {\"code\": \"...\"} holding only code."
            .to_string(),
        inputs: vec![
            field("visualization_type", "the chart kind"),
            field("column_properties", "properties of the columns in df"),
            field("reason", "what the chart should show"),
            field("reference_docs", "reference template for this chart kind"),
            field("previous_code", "code of the failed previous attempt, if any"),
            field("error", "error raised by the previous attempt, if any"),
        ],
        outputs: vec![field("code", "Lua code that saves the chart to save_file_name")],
    }
}

/// Draws the raster form of a saved figure.
type Rasterizer = fn(&Figure) -> anyhow::Result<Vec<u8>>;

pub struct RenderStage {
    llm: Arc<dyn LlmClient>,
    sandbox: CodeSandbox,
    artifacts_dir: PathBuf,
    max_attempts: u32,
    schema_retries: u32,
    rasterize: Rasterizer,
}

impl RenderStage {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        sandbox: CodeSandbox,
        artifacts_dir: impl Into<PathBuf>,
        max_attempts: u32,
        schema_retries: u32,
    ) -> Self {
        Self {
            llm,
            sandbox,
            artifacts_dir: artifacts_dir.into(),
            max_attempts: max_attempts.max(1),
            schema_retries,
            rasterize: render_png,
        }
    }

    #[cfg(test)]
    fn with_rasterizer(mut self, rasterize: Rasterizer) -> Self {
        self.rasterize = rasterize;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Render `candidate` from `extracted`, retrying with error feedback.
    ///
    /// Only storage-level problems (an unusable artifacts directory) are
    /// returned as errors; failing code ends in [`RenderOutcome::Exhausted`].
    pub async fn render(
        &self,
        schema: &SchemaCatalog,
        candidate: &VisualizationCandidate,
        extracted: Arc<TabularFrame>,
        template: &ReferenceTemplate,
    ) -> Result<RenderOutcome, PipelineError> {
        tokio::fs::create_dir_all(&self.artifacts_dir)
            .await
            .map_err(|e| {
                PipelineError::Storage(anyhow::anyhow!(
                    "cannot create artifacts dir {}: {}",
                    self.artifacts_dir.display(),
                    e
                ))
            })?;

        let columns = serde_json::to_string_pretty(&schema.properties_for(&extracted.columns))
            .unwrap_or_default();

        let mut state = RenderState::Attempting {
            attempt: 1,
            last: None,
        };
        loop {
            state = match state {
                RenderState::Attempting { attempt, last } => {
                    let result = self
                        .attempt(candidate, &columns, &extracted, template, attempt, last.as_ref())
                        .await;
                    match result {
                        Ok(artifact) => RenderState::Succeeded(artifact),
                        Err((code, err)) if err.is_retryable_render() => {
                            warn!(
                                kind = %candidate.kind,
                                attempt,
                                max = self.max_attempts,
                                error = %err,
                                "render attempt failed"
                            );
                            let last = Some(Failure {
                                code: code.or_else(|| last.map(|l| l.code)).unwrap_or_default(),
                                error: err.to_string(),
                            });
                            if attempt >= self.max_attempts {
                                RenderState::ExhaustedFailed {
                                    attempts: attempt,
                                    last,
                                }
                            } else {
                                RenderState::Attempting {
                                    attempt: attempt + 1,
                                    last,
                                }
                            }
                        }
                        Err((_, err)) => return Err(err),
                    }
                }
                RenderState::Succeeded(artifact) => {
                    return Ok(RenderOutcome::Rendered(artifact));
                }
                RenderState::ExhaustedFailed { attempts, last } => {
                    warn!(kind = %candidate.kind, attempts, "render attempts exhausted");
                    return Ok(RenderOutcome::Exhausted {
                        attempts,
                        last_error: last.map(|l| l.error).unwrap_or_default(),
                    });
                }
            };
        }
    }

    /// One attempt. On failure, returns the generated code (when there was
    /// any) with the error.
    async fn attempt(
        &self,
        candidate: &VisualizationCandidate,
        columns: &str,
        extracted: &Arc<TabularFrame>,
        template: &ReferenceTemplate,
        attempt: u32,
        last: Option<&Failure>,
    ) -> Result<RenderedArtifact, (Option<String>, PipelineError)> {
        let mut prompt = Prompt::new(render_signature())
            .input("visualization_type", candidate.kind.as_str())
            .input("column_properties", columns)
            .input("reason", candidate.reason.as_str())
            .input("reference_docs", template.text.as_str());
        if let Some(last) = last {
            prompt = prompt
                .input("previous_code", last.code.as_str())
                .input("error", last.error.as_str());
        }
        let reply: CodeReply = complete_as(self.llm.as_ref(), &prompt, self.schema_retries)
            .await
            .map_err(|e| (None, PipelineError::CodeGeneration(e.to_string())))?;
        let code = clean_code(&reply.code);
        debug!(kind = %candidate.kind, attempt, code = %code, "render code");

        let output = self.artifacts_dir.join(format!(
            "{}-{}-{}.svg",
            candidate.kind,
            attempt,
            Uuid::new_v4().simple()
        ));
        let surface = PlotSurface::with_output(output.clone());
        let bindings = Bindings::new()
            .frame("df", extracted.clone())
            .surface("plt", surface.clone())
            .text("save_file_name", output.to_string_lossy())
            .interactive();

        let result = self.run(&code, bindings, &output, &surface).await;
        remove_artifact(&output).await;
        match result {
            Ok((svg_text, raster_base64)) => {
                info!(kind = %candidate.kind, attempt, "rendered visualization");
                Ok(RenderedArtifact {
                    code,
                    svg_text,
                    raster_base64,
                })
            }
            Err(e) => Err((Some(code), e)),
        }
    }

    async fn run(
        &self,
        code: &str,
        bindings: Bindings,
        output: &Path,
        surface: &PlotSurface,
    ) -> Result<(String, String), PipelineError> {
        self.sandbox.execute(code, bindings, "save_file_name").await?;

        let svg_text = tokio::fs::read_to_string(output).await.map_err(|e| {
            PipelineError::ArtifactRead {
                path: output.to_path_buf(),
                message: format!("{} (did the code call plt.savefig(save_file_name)?)", e),
            }
        })?;
        if svg_text.trim().is_empty() {
            return Err(PipelineError::ArtifactRead {
                path: output.to_path_buf(),
                message: "file is empty".to_string(),
            });
        }

        let figure = surface
            .figure()
            .map_err(|e| PipelineError::CodeExecution(e.to_string()))?;
        let rasterize = self.rasterize;
        let png = tokio::task::spawn_blocking(move || rasterize(&figure))
            .await
            .map_err(|e| PipelineError::CodeExecution(format!("raster rendering aborted: {}", e)))?
            .map_err(|e| PipelineError::CodeExecution(format!("raster rendering failed: {}", e)))?;
        Ok((svg_text, base64::engine::general_purpose::STANDARD.encode(png)))
    }
}

async fn remove_artifact(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %path.display(), error = %e, "could not remove artifact");
        }
    }
}
