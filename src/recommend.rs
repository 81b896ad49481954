//! Choosing which visualizations to draw.
//!
//! [`VisualizationRecommender`] proposes charts for a fresh question;
//! [`VisualizationRefiner`] proposes fewer, targeted charts for a follow-up
//! that refers to an earlier answer. Both degrade to an empty list when the
//! model fails: an empty list means "nothing to generate", never an error.
//!
//! Every returned candidate has a supported kind and only columns that exist
//! in the dataset schema.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};
use vizchat_core::models::{AssistantTurn, VisualizationCandidate};

use crate::error::PipelineError;
use crate::llm::{complete_as, field, LlmClient, Prompt, Signature};
use crate::schema::SchemaCatalog;

/// Reply shape shared by recommendation and refinement.
#[derive(Debug, Deserialize)]
pub struct RecommendationReply {
    pub visualizations: Vec<VisualizationCandidate>,
}

/// Conversation state handed to the refiner.
#[derive(Debug, Clone, Default)]
pub struct RefinementContext {
    pub question: String,
    /// Most recent earlier question that differs from `question`.
    pub previous_question: Option<String>,
    pub prior_viz_name: String,
    pub prior_reason: String,
    pub prior_columns: Vec<String>,
    /// Recent questions, newest first.
    pub history: Vec<String>,
}

impl RefinementContext {
    /// Build from the prior turn and the session's recent questions
    /// (newest first, possibly including `question` itself).
    pub fn new(question: &str, prior: &AssistantTurn, recent: &[String]) -> Self {
        let previous_question = recent
            .iter()
            .find(|q| q.trim() != question.trim())
            .cloned();
        Self {
            question: question.to_string(),
            previous_question,
            prior_viz_name: prior.viz_name.clone(),
            prior_reason: prior.reason.clone(),
            prior_columns: prior.columns_involved.clone(),
            history: recent.to_vec(),
        }
    }

    pub fn to_text(&self) -> String {
        let mut out = format!("Current question: {}\n", self.question);
        if let Some(prev) = &self.previous_question {
            out.push_str(&format!("Previous question: {}\n", prev));
        }
        out.push_str(&format!(
            "Previous visualization: {}\nPrevious reason: {}\nPrevious columns: {}\n",
            self.prior_viz_name,
            self.prior_reason,
            self.prior_columns.join(", ")
        ));
        if !self.history.is_empty() {
            out.push_str("Recent questions (newest first):\n");
            for q in &self.history {
                out.push_str(&format!("- {}\n", q));
            }
        }
        out
    }
}

fn kinds_list(kinds: &[String]) -> String {
    kinds.join(", ")
}

fn recommend_signature(kinds: &[String], count: usize) -> Signature {
    Signature {
        name: "RecommendVisualizations",
        instructions: format!(
            "You are a data visualization expert. Given the schema of a dataset and a \
             question about it, recommend up to {count} different visualizations that \
             answer the question. Each visualization_type must be one of: {kinds}. \
             columns_involved must use exact column names from the schema. Give a one \
             or two sentence reason per visualization. Reply with a JSON object \
             {{\"visualizations\": [{{\"visualization_type\", \"columns_involved\", \"reason\"}}]}}.",
            count = count,
            kinds = kinds_list(kinds),
        ),
        inputs: vec![
            field("dataset_schema", "columns with semantic types and descriptions"),
            field("question", "the user's question"),
        ],
        outputs: vec![field(
            "visualizations",
            "list of {visualization_type, columns_involved, reason}",
        )],
    }
}

fn refine_signature(kinds: &[String], count: usize) -> Signature {
    Signature {
        name: "RefineVisualizations",
        instructions: format!(
            "You are a data visualization expert refining an earlier answer. The user \
             saw a previous visualization and asked a follow-up. Using the conversation \
             context, recommend at most {count} visualizations that address the \
             follow-up, keeping what still applies from the previous one. Each \
             visualization_type must be one of: {kinds}. columns_involved must use exact \
             column names from the schema. Reply with a JSON object \
             {{\"visualizations\": [{{\"visualization_type\", \"columns_involved\", \"reason\"}}]}}.",
            count = count,
            kinds = kinds_list(kinds),
        ),
        inputs: vec![
            field("dataset_schema", "columns with semantic types and descriptions"),
            field("question", "the follow-up question"),
            field("context", "previous question, previous visualization and recent history"),
        ],
        outputs: vec![field(
            "visualizations",
            "list of {visualization_type, columns_involved, reason}",
        )],
    }
}

/// Keep supported candidates with known columns, at most `count`.
fn sanitize(
    candidates: Vec<VisualizationCandidate>,
    schema: &SchemaCatalog,
    kinds: &[String],
    count: usize,
) -> Vec<VisualizationCandidate> {
    candidates
        .into_iter()
        .filter_map(|mut c| {
            if !kinds.contains(&c.kind) {
                warn!(kind = %c.kind, "dropping unsupported visualization kind");
                return None;
            }
            let before = c.columns_involved.len();
            c.columns_involved.retain(|col| schema.has_column(col));
            if c.columns_involved.len() != before {
                warn!(kind = %c.kind, "dropped unknown columns from candidate");
            }
            if c.columns_involved.is_empty() {
                warn!(kind = %c.kind, "dropping candidate without known columns");
                return None;
            }
            Some(c)
        })
        .take(count)
        .collect()
}

async fn ask(
    llm: &dyn LlmClient,
    prompt: &Prompt,
    schema_retries: u32,
) -> Result<Vec<VisualizationCandidate>, PipelineError> {
    debug!(signature = prompt.name(), "requesting visualization candidates");
    complete_as::<RecommendationReply>(llm, prompt, schema_retries)
        .await
        .map(|reply| reply.visualizations)
        .map_err(|e| PipelineError::Recommendation(e.to_string()))
}

pub struct VisualizationRecommender {
    llm: Arc<dyn LlmClient>,
    kinds: Vec<String>,
    count: usize,
    schema_retries: u32,
}

impl VisualizationRecommender {
    pub fn new(llm: Arc<dyn LlmClient>, kinds: Vec<String>, count: usize, schema_retries: u32) -> Self {
        Self {
            llm,
            kinds,
            count,
            schema_retries,
        }
    }

    pub async fn recommend(&self, schema: &SchemaCatalog, question: &str) -> Vec<VisualizationCandidate> {
        let prompt = Prompt::new(recommend_signature(&self.kinds, self.count))
            .input("dataset_schema", schema.schema_json())
            .input("question", question);
        match ask(self.llm.as_ref(), &prompt, self.schema_retries).await {
            Ok(candidates) => {
                let kept = sanitize(candidates, schema, &self.kinds, self.count);
                info!(candidates = kept.len(), "recommended visualizations");
                kept
            }
            Err(e) => {
                warn!(error = %e, "recommendation failed; nothing to generate");
                Vec::new()
            }
        }
    }
}

pub struct VisualizationRefiner {
    llm: Arc<dyn LlmClient>,
    kinds: Vec<String>,
    count: usize,
    schema_retries: u32,
}

impl VisualizationRefiner {
    pub fn new(llm: Arc<dyn LlmClient>, kinds: Vec<String>, count: usize, schema_retries: u32) -> Self {
        Self {
            llm,
            kinds,
            count,
            schema_retries,
        }
    }

    pub async fn refine(
        &self,
        schema: &SchemaCatalog,
        question: &str,
        context: &RefinementContext,
    ) -> Vec<VisualizationCandidate> {
        let prompt = Prompt::new(refine_signature(&self.kinds, self.count))
            .input("dataset_schema", schema.schema_json())
            .input("question", question)
            .input("context", context.to_text());
        match ask(self.llm.as_ref(), &prompt, self.schema_retries).await {
            Ok(candidates) => {
                let kept = sanitize(candidates, schema, &self.kinds, self.count);
                info!(candidates = kept.len(), "refined visualizations");
                kept
            }
            Err(e) => {
                warn!(error = %e, "refinement failed; nothing to generate");
                Vec::new()
            }
        }
    }
}
