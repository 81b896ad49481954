//! SQLite-backed [`Store`] implementation.
//!
//! Structured fields (column properties, schema, turn data, extension bag)
//! are stored as JSON text columns. Ids are stored as text.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use vizchat_core::models::{
    AssistantTurn, ChatSession, ColumnProperty, ColumnSchema, Dataset, UserTurn,
};
use vizchat_core::store::{with_analysis, Store};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn parse_uuid(text: &str) -> Result<Uuid> {
    Uuid::parse_str(text).with_context(|| format!("invalid uuid in database: {}", text))
}

fn parse_json<T: DeserializeOwned>(text: &str, what: &str) -> Result<T> {
    serde_json::from_str(text).with_context(|| format!("invalid {} JSON in database", what))
}

fn dataset_from_row(row: &SqliteRow) -> Result<Dataset> {
    let props: Option<String> = row.get("column_properties_json");
    let schema: Option<String> = row.get("dataset_schema_json");
    Ok(Dataset {
        id: row.get("id"),
        uri: row.get("uri"),
        name: row.get("name"),
        description: row.get("description"),
        column_properties: props
            .map(|p| parse_json(&p, "column_properties"))
            .transpose()?,
        dataset_schema: schema
            .map(|s| parse_json(&s, "dataset_schema"))
            .transpose()?,
        created_at: row.get("created_at"),
    })
}

fn assistant_turn_from_row(row: &SqliteRow) -> Result<AssistantTurn> {
    let id: String = row.get("id");
    let session_id: String = row.get("session_id");
    let parent: Option<String> = row.get("parent_user_turn_id");
    let columns: String = row.get("columns_involved_json");
    let data: String = row.get("data_json");
    let extra: String = row.get("extra_attrs_json");
    Ok(AssistantTurn {
        id: parse_uuid(&id)?,
        session_id: parse_uuid(&session_id)?,
        parent_user_turn_id: parent.as_deref().map(parse_uuid).transpose()?,
        viz_name: row.get("viz_name"),
        columns_involved: parse_json(&columns, "columns_involved")?,
        reason: row.get("reason"),
        extract_code: row.get("extract_code"),
        render_code: row.get("render_code"),
        svg_json: row.get("svg_json"),
        data: parse_json(&data, "data")?,
        extra_attrs: parse_json(&extra, "extra_attrs")?,
        created_at: row.get("created_at"),
    })
}

const ASSISTANT_COLUMNS: &str = "id, session_id, parent_user_turn_id, viz_name, \
    columns_involved_json, reason, extract_code, render_code, svg_json, data_json, \
    extra_attrs_json, created_at";

#[async_trait]
impl Store for SqliteStore {
    async fn create_dataset(&self, dataset: &Dataset) -> Result<()> {
        let props = dataset
            .column_properties
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let schema = dataset
            .dataset_schema
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            r#"
            INSERT INTO datasets (id, uri, name, description, column_properties_json,
                                  dataset_schema_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&dataset.id)
        .bind(&dataset.uri)
        .bind(&dataset.name)
        .bind(&dataset.description)
        .bind(props)
        .bind(schema)
        .bind(dataset.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_dataset(&self, id: &str) -> Result<Option<Dataset>> {
        let row = sqlx::query("SELECT * FROM datasets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(dataset_from_row).transpose()
    }

    async fn save_enrichment(
        &self,
        dataset_id: &str,
        column_properties: &[ColumnProperty],
        dataset_schema: &[ColumnSchema],
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE datasets SET column_properties_json = ?, dataset_schema_json = ? WHERE id = ?",
        )
        .bind(serde_json::to_string(column_properties)?)
        .bind(serde_json::to_string(dataset_schema)?)
        .bind(dataset_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("dataset not found: {}", dataset_id);
        }
        Ok(())
    }

    async fn update_description(&self, dataset_id: &str, description: &str) -> Result<()> {
        sqlx::query("UPDATE datasets SET description = ? WHERE id = ?")
            .bind(description)
            .bind(dataset_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_session(&self, session: &ChatSession) -> Result<()> {
        sqlx::query("INSERT INTO chat_sessions (id, dataset_id, created_at) VALUES (?, ?, ?)")
            .bind(session.id.to_string())
            .bind(&session.dataset_id)
            .bind(session.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<ChatSession>> {
        let row = sqlx::query("SELECT id, dataset_id, created_at FROM chat_sessions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let id: String = row.get("id");
                Ok(Some(ChatSession {
                    id: parse_uuid(&id)?,
                    dataset_id: row.get("dataset_id"),
                    created_at: row.get("created_at"),
                }))
            }
            None => Ok(None),
        }
    }

    async fn create_user_turn(&self, turn: &UserTurn) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_turns (id, session_id, question, reply_to, created_at, seq)
            VALUES (?, ?, ?, ?, ?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM user_turns))
            "#,
        )
        .bind(turn.id.to_string())
        .bind(turn.session_id.to_string())
        .bind(&turn.question)
        .bind(turn.reply_to.map(|id| id.to_string()))
        .bind(turn.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_questions(&self, session_id: Uuid, limit: usize) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT question FROM user_turns WHERE session_id = ? ORDER BY seq DESC LIMIT ?",
        )
        .bind(session_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("question")).collect())
    }

    async fn create_assistant_turn(&self, turn: &AssistantTurn) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO assistant_turns (id, session_id, parent_user_turn_id, viz_name,
                                         columns_involved_json, reason, extract_code,
                                         render_code, svg_json, data_json,
                                         extra_attrs_json, created_at, seq)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                    (SELECT COALESCE(MAX(seq), 0) + 1 FROM assistant_turns))
            "#,
        )
        .bind(turn.id.to_string())
        .bind(turn.session_id.to_string())
        .bind(turn.parent_user_turn_id.map(|id| id.to_string()))
        .bind(&turn.viz_name)
        .bind(serde_json::to_string(&turn.columns_involved)?)
        .bind(&turn.reason)
        .bind(&turn.extract_code)
        .bind(&turn.render_code)
        .bind(&turn.svg_json)
        .bind(serde_json::to_string(&turn.data)?)
        .bind(serde_json::to_string(&turn.extra_attrs)?)
        .bind(turn.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_assistant_turn(&self, id: Uuid) -> Result<Option<AssistantTurn>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM assistant_turns WHERE id = ?",
            ASSISTANT_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(assistant_turn_from_row).transpose()
    }

    async fn attach_analysis(&self, id: Uuid, analysis: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT extra_attrs_json FROM assistant_turns WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .with_context(|| format!("assistant turn not found: {}", id))?;
        let extra: String = row.get("extra_attrs_json");
        let merged = with_analysis(&parse_json(&extra, "extra_attrs")?, analysis);
        sqlx::query("UPDATE assistant_turns SET extra_attrs_json = ? WHERE id = ?")
            .bind(serde_json::to_string(&merged)?)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_assistant_turns(&self, session_id: Uuid) -> Result<Vec<AssistantTurn>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM assistant_turns WHERE session_id = ? ORDER BY seq",
            ASSISTANT_COLUMNS
        ))
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(assistant_turn_from_row).collect()
    }
}
