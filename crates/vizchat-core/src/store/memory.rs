//! In-memory [`Store`] implementation for tests.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. Insertion order of
//! turns is kept so history queries behave like the SQLite backend.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{AssistantTurn, ChatSession, ColumnProperty, ColumnSchema, Dataset, UserTurn};

use super::{with_analysis, Store};

pub struct InMemoryStore {
    datasets: RwLock<HashMap<String, Dataset>>,
    sessions: RwLock<HashMap<Uuid, ChatSession>>,
    user_turns: RwLock<Vec<UserTurn>>,
    assistant_turns: RwLock<Vec<AssistantTurn>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            datasets: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            user_turns: RwLock::new(Vec::new()),
            assistant_turns: RwLock::new(Vec::new()),
        }
    }

    /// Number of stored assistant turns across all sessions.
    pub fn assistant_turn_count(&self) -> usize {
        self.assistant_turns.read().map(|t| t.len()).unwrap_or(0)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_dataset(&self, dataset: &Dataset) -> Result<()> {
        let mut datasets = self.datasets.write().map_err(poisoned)?;
        datasets.insert(dataset.id.clone(), dataset.clone());
        Ok(())
    }

    async fn get_dataset(&self, id: &str) -> Result<Option<Dataset>> {
        let datasets = self.datasets.read().map_err(poisoned)?;
        Ok(datasets.get(id).cloned())
    }

    async fn save_enrichment(
        &self,
        dataset_id: &str,
        column_properties: &[ColumnProperty],
        dataset_schema: &[ColumnSchema],
    ) -> Result<()> {
        let mut datasets = self.datasets.write().map_err(poisoned)?;
        let Some(dataset) = datasets.get_mut(dataset_id) else {
            bail!("dataset not found: {}", dataset_id);
        };
        dataset.column_properties = Some(column_properties.to_vec());
        dataset.dataset_schema = Some(dataset_schema.to_vec());
        Ok(())
    }

    async fn update_description(&self, dataset_id: &str, description: &str) -> Result<()> {
        let mut datasets = self.datasets.write().map_err(poisoned)?;
        let Some(dataset) = datasets.get_mut(dataset_id) else {
            bail!("dataset not found: {}", dataset_id);
        };
        dataset.description = description.to_string();
        Ok(())
    }

    async fn create_session(&self, session: &ChatSession) -> Result<()> {
        let mut sessions = self.sessions.write().map_err(poisoned)?;
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<ChatSession>> {
        let sessions = self.sessions.read().map_err(poisoned)?;
        Ok(sessions.get(&id).cloned())
    }

    async fn create_user_turn(&self, turn: &UserTurn) -> Result<()> {
        let mut turns = self.user_turns.write().map_err(poisoned)?;
        turns.push(turn.clone());
        Ok(())
    }

    async fn recent_questions(&self, session_id: Uuid, limit: usize) -> Result<Vec<String>> {
        let turns = self.user_turns.read().map_err(poisoned)?;
        Ok(turns
            .iter()
            .rev()
            .filter(|t| t.session_id == session_id)
            .take(limit)
            .map(|t| t.question.clone())
            .collect())
    }

    async fn create_assistant_turn(&self, turn: &AssistantTurn) -> Result<()> {
        let mut turns = self.assistant_turns.write().map_err(poisoned)?;
        turns.push(turn.clone());
        Ok(())
    }

    async fn get_assistant_turn(&self, id: Uuid) -> Result<Option<AssistantTurn>> {
        let turns = self.assistant_turns.read().map_err(poisoned)?;
        Ok(turns.iter().find(|t| t.id == id).cloned())
    }

    async fn attach_analysis(&self, id: Uuid, analysis: &str) -> Result<()> {
        let mut turns = self.assistant_turns.write().map_err(poisoned)?;
        let Some(turn) = turns.iter_mut().find(|t| t.id == id) else {
            bail!("assistant turn not found: {}", id);
        };
        turn.extra_attrs = with_analysis(&turn.extra_attrs, analysis);
        Ok(())
    }

    async fn list_assistant_turns(&self, session_id: Uuid) -> Result<Vec<AssistantTurn>> {
        let turns = self.assistant_turns.read().map_err(poisoned)?;
        Ok(turns
            .iter()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect())
    }
}
