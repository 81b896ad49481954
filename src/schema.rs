//! Read access to a dataset's enriched schema.
//!
//! A [`SchemaCatalog`] is a snapshot of one dataset's column properties and
//! column schema. It is built once per event and shared read-only by every
//! candidate pipeline. [`ensure_catalog`] computes and persists enrichment
//! for datasets that were registered without it.

use std::collections::HashSet;

use tracing::info;
use vizchat_core::frame::TabularFrame;
use vizchat_core::models::{ColumnProperty, ColumnSchema, Dataset};
use vizchat_core::store::Store;

use crate::enrich;
use crate::error::PipelineError;
use crate::llm::LlmClient;

#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    column_properties: Vec<ColumnProperty>,
    dataset_schema: Vec<ColumnSchema>,
}

impl SchemaCatalog {
    pub fn new(column_properties: Vec<ColumnProperty>, dataset_schema: Vec<ColumnSchema>) -> Self {
        Self {
            column_properties,
            dataset_schema,
        }
    }

    /// Catalog of an already-enriched dataset.
    pub fn from_dataset(dataset: &Dataset) -> Option<Self> {
        match (&dataset.column_properties, &dataset.dataset_schema) {
            (Some(props), Some(schema)) => Some(Self::new(props.clone(), schema.clone())),
            _ => None,
        }
    }

    pub fn get_column_properties(&self) -> &[ColumnProperty] {
        &self.column_properties
    }

    pub fn get_dataset_schema(&self) -> &[ColumnSchema] {
        &self.dataset_schema
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.dataset_schema.iter().any(|c| c.column_name == name)
    }

    /// Column properties restricted to `columns`, in catalog order.
    pub fn properties_for(&self, columns: &[String]) -> Vec<ColumnProperty> {
        let wanted: HashSet<&str> = columns.iter().map(|c| c.as_str()).collect();
        self.column_properties
            .iter()
            .filter(|p| wanted.contains(p.column_name.as_str()))
            .cloned()
            .collect()
    }

    /// The schema as prompt text.
    pub fn schema_json(&self) -> String {
        serde_json::to_string_pretty(&self.dataset_schema).unwrap_or_default()
    }
}

/// Catalog for `dataset`, enriching `frame` and persisting the result
/// when the dataset has none cached.
pub async fn ensure_catalog(
    store: &dyn Store,
    llm: &dyn LlmClient,
    dataset: &Dataset,
    frame: &TabularFrame,
    samples: usize,
    schema_retries: u32,
) -> Result<SchemaCatalog, PipelineError> {
    if let Some(catalog) = SchemaCatalog::from_dataset(dataset) {
        return Ok(catalog);
    }
    info!(dataset = %dataset.id, "dataset not enriched; computing schema");
    let (props, schema) = enrich::enrich_frame(llm, frame, samples, schema_retries).await;
    store.save_enrichment(&dataset.id, &props, &schema).await?;
    Ok(SchemaCatalog::new(props, schema))
}
