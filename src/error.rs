//! Error taxonomy for the visualization pipeline.
//!
//! Session- and event-level variants are surfaced to the client as an
//! `error` reply. Per-candidate variants are logged and the candidate is
//! dropped; only [`PipelineError::is_retryable_render`] errors feed the
//! render retry loop.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Chat session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("Assistant message not found: {0}")]
    AssistantTurnNotFound(Uuid),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Recommendation failed: {0}")]
    Recommendation(String),

    #[error("Code generation failed: {0}")]
    CodeGeneration(String),

    #[error("Code execution failed: {0}")]
    CodeExecution(String),

    #[error("Failed to read artifact {}: {message}", path.display())]
    ArtifactRead { path: PathBuf, message: String },

    #[error("Analysis failed: {0}")]
    Analysis(String),

    #[error("No reference template for chart kind '{kind}' (searched: {})", searched.join(", "))]
    TemplateNotFound { kind: String, searched: Vec<String> },

    #[error("Data loading failed: {0}")]
    DataLoad(String),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl PipelineError {
    /// Errors that the render stage answers with another attempt.
    pub fn is_retryable_render(&self) -> bool {
        matches!(
            self,
            PipelineError::CodeExecution(_)
                | PipelineError::ArtifactRead { .. }
                | PipelineError::CodeGeneration(_)
        )
    }
}
