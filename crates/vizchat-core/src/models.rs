//! Core data models used throughout vizchat.
//!
//! These types represent datasets and their enrichment, chat sessions, the
//! user and assistant turns that make up a conversation, and the transient
//! visualization candidates proposed by the recommender.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-column statistics computed from the raw frame.
///
/// `std`, `min` and `max` are only present for dtypes where they make sense:
/// numbers carry all three, dates carry `min`/`max` as strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    /// One of `number`, `boolean`, `date`, `category`, `string`.
    pub dtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub std: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<serde_json::Value>,
    #[serde(default)]
    pub samples: Vec<serde_json::Value>,
    pub num_unique_values: usize,
    #[serde(default)]
    pub semantic_type: String,
    #[serde(default)]
    pub description: String,
}

/// A column name together with its [`ColumnStats`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnProperty {
    pub column_name: String,
    pub properties: ColumnStats,
}

/// High-level, human-readable schema entry for one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub column_name: String,
    pub description: String,
    pub semantic_type: String,
}

/// Reference to a tabular source plus its cached enrichment.
///
/// `column_properties` and `dataset_schema` are both `None` until the
/// dataset has been enriched; afterwards they always cover the same columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub uri: String,
    pub name: String,
    pub description: String,
    pub column_properties: Option<Vec<ColumnProperty>>,
    pub dataset_schema: Option<Vec<ColumnSchema>>,
    pub created_at: i64,
}

impl Dataset {
    pub fn new(uri: &str, name: &str, description: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            uri: uri.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            column_properties: None,
            dataset_schema: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn is_enriched(&self) -> bool {
        self.column_properties.is_some() && self.dataset_schema.is_some()
    }
}

/// One conversation, bound to exactly one dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: Uuid,
    pub dataset_id: String,
    pub created_at: i64,
}

impl ChatSession {
    pub fn new(dataset_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            dataset_id: dataset_id.to_string(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// A question asked by the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTurn {
    pub id: Uuid,
    pub session_id: Uuid,
    pub question: String,
    /// The assistant turn this question follows up on, if any.
    pub reply_to: Option<Uuid>,
    pub created_at: i64,
}

impl UserTurn {
    pub fn new(session_id: Uuid, question: &str, reply_to: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            question: question.to_string(),
            reply_to,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// One fully rendered visualization, persisted once and never rewritten
/// except for attaching an analysis under `extra_attrs.analysis`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantTurn {
    pub id: Uuid,
    pub session_id: Uuid,
    pub parent_user_turn_id: Option<Uuid>,
    pub viz_name: String,
    pub columns_involved: Vec<String>,
    pub reason: String,
    pub extract_code: String,
    pub render_code: String,
    /// JSON-encoded `{"svg": ..., "png_base64": ...}`.
    pub svg_json: String,
    pub data: Vec<serde_json::Value>,
    pub extra_attrs: serde_json::Value,
    pub created_at: i64,
}

impl AssistantTurn {
    /// The raster encoding stored inside `svg_json`, if any.
    pub fn raster_base64(&self) -> Option<String> {
        let value: serde_json::Value = serde_json::from_str(&self.svg_json).ok()?;
        value
            .get("png_base64")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    }

    pub fn analysis(&self) -> Option<&str> {
        self.extra_attrs.get("analysis").and_then(|v| v.as_str())
    }
}

/// A proposed chart: kind, the columns it needs and why.
///
/// Never persisted; produced by the recommender or refiner and consumed by
/// the generation stages straight away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualizationCandidate {
    #[serde(rename = "visualization_type", alias = "kind")]
    pub kind: String,
    #[serde(default)]
    pub columns_involved: Vec<String>,
    #[serde(default)]
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn_with(svg_json: &str) -> AssistantTurn {
        AssistantTurn {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            parent_user_turn_id: None,
            viz_name: "bar_chart".into(),
            columns_involved: vec![],
            reason: String::new(),
            extract_code: String::new(),
            render_code: String::new(),
            svg_json: svg_json.into(),
            data: vec![],
            extra_attrs: serde_json::json!({}),
            created_at: 0,
        }
    }

    #[test]
    fn raster_is_read_from_svg_json() {
        let turn = turn_with(r#"{"svg":"<svg/>","png_base64":"aGVsbG8="}"#);
        assert_eq!(turn.raster_base64().as_deref(), Some("aGVsbG8="));
    }

    #[test]
    fn raster_missing_or_empty_is_none() {
        assert!(turn_with("").raster_base64().is_none());
        assert!(turn_with(r#"{"svg":"<svg/>","png_base64":""}"#)
            .raster_base64()
            .is_none());
    }

    #[test]
    fn candidate_accepts_visualization_type_key() {
        let c: VisualizationCandidate = serde_json::from_value(serde_json::json!({
            "visualization_type": "scatter_plot_chart",
            "columns_involved": ["engine_size", "city_mpg"],
            "reason": "correlation"
        }))
        .unwrap();
        assert_eq!(c.kind, "scatter_plot_chart");
        assert_eq!(c.columns_involved.len(), 2);
    }
}
