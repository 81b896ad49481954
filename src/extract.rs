//! Data extraction: generated code that shapes the dataset for one chart.
//!
//! The model writes Lua that reads the working frame `df` and binds the
//! chart's data to `extract_df`. The code runs once; a failure drops the
//! candidate without affecting its siblings.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info};
use vizchat_core::frame::TabularFrame;
use vizchat_core::models::VisualizationCandidate;

use crate::error::PipelineError;
use crate::llm::{complete_as, field, LlmClient, Prompt, Signature};
use crate::sandbox::{clean_code, Bindings, CodeSandbox};
use crate::schema::SchemaCatalog;
use crate::templates::ReferenceTemplate;

/// Global the extraction code must bind.
pub const EXTRACT_RESULT: &str = "extract_df";

/// Reply of every code-generation call.
#[derive(Debug, Deserialize)]
pub struct CodeReply {
    pub code: String,
}

/// Output of a successful extraction.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub code: String,
    pub frame: Arc<TabularFrame>,
}

fn extraction_signature() -> Signature {
    Signature {
        name: "GenerateExtractionCode",
        instructions: format!(
            "You write Lua 5.4 code that prepares data for one chart. The working \
             dataset is bound as `df`, a frame table {{ columns = {{...}}, rows = {{ {{col = value}}, ... }} }}. \
             Use the `frame` and `np` helpers shown in the reference template. Rules: \
             do not rename columns; drop rows with missing or invalid values in the \
             columns you use; keep only the columns the chart needs; assign the \
             resulting frame to the global `{result}`. No file or network access is \
             available. Reply with a JSON object {{\"code\": \"...\"}} holding only code.",
            result = EXTRACT_RESULT
        ),
        inputs: vec![
            field("dataset_schema", "columns with semantic types and descriptions"),
            field("visualization_type", "the chart kind"),
            field("columns_involved", "dataset columns the chart uses"),
            field("reason", "what the chart should show"),
            field("reference_docs", "reference template for this chart kind"),
        ],
        outputs: vec![field("code", "Lua code binding extract_df")],
    }
}

pub struct DataExtractionStage {
    llm: Arc<dyn LlmClient>,
    sandbox: CodeSandbox,
    schema_retries: u32,
}

impl DataExtractionStage {
    pub fn new(llm: Arc<dyn LlmClient>, sandbox: CodeSandbox, schema_retries: u32) -> Self {
        Self {
            llm,
            sandbox,
            schema_retries,
        }
    }

    /// Generate extraction code for `candidate` and run it against `working`.
    pub async fn extract(
        &self,
        schema: &SchemaCatalog,
        candidate: &VisualizationCandidate,
        template: &ReferenceTemplate,
        working: Arc<TabularFrame>,
    ) -> Result<Extraction, PipelineError> {
        let prompt = Prompt::new(extraction_signature())
            .input("dataset_schema", schema.schema_json())
            .input("visualization_type", candidate.kind.as_str())
            .input("columns_involved", candidate.columns_involved.join(", "))
            .input("reason", candidate.reason.as_str())
            .input("reference_docs", template.text.as_str());
        let reply: CodeReply = complete_as(self.llm.as_ref(), &prompt, self.schema_retries)
            .await
            .map_err(|e| PipelineError::CodeGeneration(e.to_string()))?;
        let code = clean_code(&reply.code);
        debug!(kind = %candidate.kind, code = %code, "extraction code");

        let value = self
            .sandbox
            .execute(&code, Bindings::new().frame("df", working), EXTRACT_RESULT)
            .await?
            .ok_or_else(|| {
                PipelineError::CodeExecution(format!("code did not bind `{}`", EXTRACT_RESULT))
            })?;
        let frame = TabularFrame::from_json(&value)
            .map_err(|e| PipelineError::CodeExecution(format!("`{}`: {}", EXTRACT_RESULT, e)))?;
        if frame.columns.is_empty() || frame.is_empty() {
            return Err(PipelineError::CodeExecution(format!(
                "`{}` is empty ({} columns, {} rows)",
                EXTRACT_RESULT,
                frame.columns.len(),
                frame.len()
            )));
        }
        info!(
            kind = %candidate.kind,
            columns = frame.columns.len(),
            rows = frame.len(),
            "extracted chart data"
        );
        Ok(Extraction {
            code,
            frame: Arc::new(frame),
        })
    }
}
