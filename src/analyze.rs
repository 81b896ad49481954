//! Vision analysis of a rendered chart.
//!
//! A missing or undecodable raster and a failed model call are both
//! [`PipelineError::Analysis`]. The caller turns them into an `Error: ...`
//! reply and stores nothing.

use std::sync::Arc;

use base64::Engine;
use serde::Deserialize;
use tracing::{info, warn};
use vizchat_core::models::ColumnProperty;

use crate::error::PipelineError;
use crate::llm::{complete_as, field, LlmClient, Prompt, Signature};

#[derive(Debug, Deserialize)]
pub struct AnalysisReply {
    pub analysis: String,
}

fn analyze_signature() -> Signature {
    Signature {
        name: "AnalyzeVisualization",
        instructions: "You are a data analyst. Look at the attached chart and explain \
            what it shows: the main pattern, notable outliers or groups, and what it \
            means for the user's question. Refer to the columns by name. Keep it to \
            one or two short paragraphs. Reply with a JSON object {\"analysis\": \"...\"}."
            .to_string(),
        inputs: vec![
            field("column_properties", "properties of the plotted columns"),
            field("reason", "why this chart was drawn"),
            field("question", "what the user wants to know"),
        ],
        outputs: vec![field("analysis", "the analysis text")],
    }
}

/// Check that `raster_base64` decodes to an image.
fn decode_raster(raster_base64: Option<&str>) -> Result<(), PipelineError> {
    let encoded = raster_base64
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| PipelineError::Analysis("visualization has no raster image".into()))?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| PipelineError::Analysis(format!("raster is not valid base64: {}", e)))?;
    image::load_from_memory(&bytes)
        .map_err(|e| PipelineError::Analysis(format!("raster is not a readable image: {}", e)))?;
    Ok(())
}

pub struct VisualizationAnalyzer {
    llm: Arc<dyn LlmClient>,
    schema_retries: u32,
}

impl VisualizationAnalyzer {
    pub fn new(llm: Arc<dyn LlmClient>, schema_retries: u32) -> Self {
        Self { llm, schema_retries }
    }

    pub async fn analyze(
        &self,
        raster_base64: Option<&str>,
        columns: &[ColumnProperty],
        reason: &str,
        question: &str,
    ) -> Result<String, PipelineError> {
        if let Err(e) = decode_raster(raster_base64) {
            warn!(error = %e, "cannot analyze visualization");
            return Err(e);
        }
        let columns = serde_json::to_string_pretty(columns).unwrap_or_default();
        let prompt = Prompt::new(analyze_signature())
            .input("column_properties", columns)
            .input("reason", reason)
            .input("question", question)
            .image(raster_base64.unwrap_or_default().trim());
        match complete_as::<AnalysisReply>(self.llm.as_ref(), &prompt, self.schema_retries).await {
            Ok(reply) => {
                info!(chars = reply.analysis.len(), "analyzed visualization");
                Ok(reply.analysis)
            }
            Err(e) => {
                warn!(error = %e, "visualization analysis failed");
                Err(PipelineError::Analysis(format!("vision model call failed: {}", e)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Completion, ModelKind};
    use crate::plot::{render_png, Figure, Series, SeriesKind};
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct Vision {
        fail: bool,
        models: Mutex<Vec<ModelKind>>,
    }

    #[async_trait]
    impl LlmClient for Vision {
        async fn complete(&self, prompt: &Prompt) -> Result<Completion> {
            self.models.lock().unwrap().push(prompt.model);
            if self.fail {
                anyhow::bail!("vision model unavailable");
            }
            Completion::from_value(json!({"analysis": "Sedans are the most fuel efficient."}))
        }
    }

    fn png_base64() -> String {
        let figure = Figure {
            series: vec![Series::new(SeriesKind::Bar {
                categories: vec!["sedan".into(), "suv".into()],
                values: vec![29.0, 19.0],
            })],
            ..Figure::default()
        };
        base64::engine::general_purpose::STANDARD.encode(render_png(&figure).unwrap())
    }

    fn analyzer(fail: bool) -> (Arc<Vision>, VisualizationAnalyzer) {
        let llm = Arc::new(Vision {
            fail,
            models: Mutex::new(vec![]),
        });
        (llm.clone(), VisualizationAnalyzer::new(llm, 0))
    }

    #[tokio::test]
    async fn analyzes_with_vision_model() {
        let (llm, analyzer) = analyzer(false);
        let png = png_base64();
        let text = analyzer
            .analyze(Some(&png), &[], "mpg by type", "which is best?")
            .await
            .unwrap();
        assert_eq!(text, "Sedans are the most fuel efficient.");
        assert_eq!(llm.models.lock().unwrap().as_slice(), &[ModelKind::Vision]);
    }

    #[tokio::test]
    async fn broken_raster_is_an_analysis_error() {
        let (llm, analyzer) = analyzer(false);
        let garbage = base64::engine::general_purpose::STANDARD.encode(b"definitely not a png");
        for raster in [None, Some("not base64!"), Some(garbage.as_str())] {
            let err = analyzer.analyze(raster, &[], "r", "q").await.unwrap_err();
            assert!(matches!(err, PipelineError::Analysis(_)), "{:?}", raster);
        }
        // the model is never asked about an unreadable image
        assert!(llm.models.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn model_failure_is_an_analysis_error() {
        let (_, analyzer) = analyzer(true);
        let png = png_base64();
        let err = analyzer.analyze(Some(&png), &[], "r", "q").await.unwrap_err();
        assert!(err.to_string().contains("vision model unavailable"));
    }
}
