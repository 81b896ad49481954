//! Per-chart-kind reference templates.
//!
//! A template is a Lua file documenting the `frame`/`plt` API for one chart
//! kind with a worked extraction and plotting example. It is pasted into the
//! code-generation prompts so generated code follows a known-good shape.
//!
//! Lookup for kind `k` with extension `e` tries `k.e`, then `k_chart.e`.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::PipelineError;

/// A loaded reference template.
#[derive(Debug, Clone)]
pub struct ReferenceTemplate {
    pub kind: String,
    pub path: PathBuf,
    pub text: String,
}

/// Directory of reference templates.
#[derive(Debug, Clone)]
pub struct TemplateStore {
    dir: PathBuf,
    ext: String,
}

impl TemplateStore {
    pub fn new(dir: impl Into<PathBuf>, ext: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            ext: ext.into().trim_start_matches('.').to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn candidates(&self, kind: &str) -> Vec<PathBuf> {
        vec![
            self.dir.join(format!("{}.{}", kind, self.ext)),
            self.dir.join(format!("{}_chart.{}", kind, self.ext)),
        ]
    }

    /// Load the template for `kind`.
    pub fn lookup(&self, kind: &str) -> Result<ReferenceTemplate, PipelineError> {
        let candidates = self.candidates(kind);
        for path in &candidates {
            if let Ok(text) = std::fs::read_to_string(path) {
                return Ok(ReferenceTemplate {
                    kind: kind.to_string(),
                    path: path.clone(),
                    text,
                });
            }
        }
        Err(PipelineError::TemplateNotFound {
            kind: kind.to_string(),
            searched: candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
        })
    }

    /// Keep the kinds that have a template, warning about the rest.
    pub fn validate_kinds(&self, kinds: &[String]) -> Vec<String> {
        kinds
            .iter()
            .filter(|kind| match self.lookup(kind) {
                Ok(_) => true,
                Err(e) => {
                    warn!(kind = %kind, error = %e, "chart kind disabled");
                    false
                }
            })
            .cloned()
            .collect()
    }
}
