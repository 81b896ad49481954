//! Storage abstraction for vizchat.
//!
//! The [`Store`] trait covers everything the pipeline needs from persistence:
//! datasets and their cached enrichment, chat sessions, and the user and
//! assistant turns of each session. Backends are pluggable (SQLite in the
//! main crate, [`memory::InMemoryStore`] here for tests).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{AssistantTurn, ChatSession, ColumnProperty, ColumnSchema, Dataset, UserTurn};

/// Abstract storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create_dataset`](Store::create_dataset) | Register a tabular source |
/// | [`save_enrichment`](Store::save_enrichment) | Cache column properties and schema |
/// | [`create_session`](Store::create_session) | Open a conversation on a dataset |
/// | [`create_user_turn`](Store::create_user_turn) | Record a question |
/// | [`recent_questions`](Store::recent_questions) | Question history, newest first |
/// | [`create_assistant_turn`](Store::create_assistant_turn) | Record a rendered visualization |
/// | [`attach_analysis`](Store::attach_analysis) | Store analysis text on a turn |
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_dataset(&self, dataset: &Dataset) -> Result<()>;

    async fn get_dataset(&self, id: &str) -> Result<Option<Dataset>>;

    /// Persist computed enrichment. Both lists must cover the same columns.
    async fn save_enrichment(
        &self,
        dataset_id: &str,
        column_properties: &[ColumnProperty],
        dataset_schema: &[ColumnSchema],
    ) -> Result<()>;

    async fn update_description(&self, dataset_id: &str, description: &str) -> Result<()>;

    async fn create_session(&self, session: &ChatSession) -> Result<()>;

    async fn get_session(&self, id: Uuid) -> Result<Option<ChatSession>>;

    async fn create_user_turn(&self, turn: &UserTurn) -> Result<()>;

    /// The last `limit` questions of a session, newest first.
    async fn recent_questions(&self, session_id: Uuid, limit: usize) -> Result<Vec<String>>;

    async fn create_assistant_turn(&self, turn: &AssistantTurn) -> Result<()>;

    async fn get_assistant_turn(&self, id: Uuid) -> Result<Option<AssistantTurn>>;

    /// Set `extra_attrs.analysis` on an existing turn.
    async fn attach_analysis(&self, id: Uuid, analysis: &str) -> Result<()>;

    /// All assistant turns of a session, oldest first.
    async fn list_assistant_turns(&self, session_id: Uuid) -> Result<Vec<AssistantTurn>>;
}

/// Merge `analysis` into an `extra_attrs` bag, replacing non-object values.
pub fn with_analysis(extra_attrs: &serde_json::Value, analysis: &str) -> serde_json::Value {
    let mut attrs = match extra_attrs {
        serde_json::Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    attrs.insert(
        "analysis".to_string(),
        serde_json::Value::String(analysis.to_string()),
    );
    serde_json::Value::Object(attrs)
}
