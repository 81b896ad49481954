//! Schema enrichment: column statistics and semantic annotations.
//!
//! [`column_properties`] is pure and deterministic (seeded sampling).
//! [`annotate_columns`] and [`describe_dataset`] ask the LLM for semantic
//! types and descriptions; a failed annotation falls back to the inferred
//! dtype so the annotated column set always matches the frame.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use vizchat_core::frame::TabularFrame;
use vizchat_core::models::{ColumnProperty, ColumnSchema, ColumnStats};

use crate::llm::{complete_as, field, LlmClient, Prompt, Signature};

const SAMPLE_SEED: u64 = 42;
const CATEGORY_RATIO: f64 = 0.5;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// Compute per-column statistics for every column of `frame`.
pub fn column_properties(frame: &TabularFrame, samples: usize) -> Vec<ColumnProperty> {
    frame
        .columns
        .iter()
        .map(|name| ColumnProperty {
            column_name: name.clone(),
            properties: column_stats(&frame.column(name), samples),
        })
        .collect()
}

fn column_stats(values: &[Value], samples: usize) -> ColumnStats {
    let present: Vec<&Value> = values.iter().filter(|v| !v.is_null()).collect();

    let mut seen = BTreeSet::new();
    let mut unique: Vec<Value> = Vec::new();
    for v in &present {
        if seen.insert(v.to_string()) {
            unique.push((*v).clone());
        }
    }

    let mut stats = ColumnStats {
        dtype: "string".to_string(),
        std: None,
        min: None,
        max: None,
        samples: Vec::new(),
        num_unique_values: unique.len(),
        semantic_type: String::new(),
        description: String::new(),
    };
    if present.is_empty() {
        return stats;
    }

    let numbers: Option<Vec<f64>> = present.iter().map(|v| v.as_f64()).collect();
    if let Some(numbers) = numbers {
        stats.dtype = "number".to_string();
        stats.std = Some(sample_std(&numbers));
        stats.min = numbers.iter().cloned().reduce(f64::min).map(|m| json!(m));
        stats.max = numbers.iter().cloned().reduce(f64::max).map(|m| json!(m));
    } else if present.iter().all(|v| v.is_boolean()) {
        stats.dtype = "boolean".to_string();
    } else if let Some(dates) = present
        .iter()
        .map(|v| v.as_str().and_then(parse_date))
        .collect::<Option<Vec<NaiveDateTime>>>()
    {
        stats.dtype = "date".to_string();
        stats.min = dates.iter().min().map(|d| json!(d.to_string()));
        stats.max = dates.iter().max().map(|d| json!(d.to_string()));
    } else if (unique.len() as f64) / (present.len() as f64) < CATEGORY_RATIO {
        stats.dtype = "category".to_string();
    }

    let mut rng = StdRng::seed_from_u64(SAMPLE_SEED);
    stats.samples = unique
        .choose_multiple(&mut rng, samples.min(unique.len()))
        .cloned()
        .collect();
    stats
}

fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    var.sqrt()
}

fn parse_date(value: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.naive_utc());
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(dt);
        }
    }
    for format in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(value, format) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    None
}

#[derive(Debug, Deserialize)]
struct ColumnAnnotation {
    semantic_type: String,
    description: String,
}

fn enrich_column_signature() -> Signature {
    Signature {
        name: "EnrichColumn",
        instructions: "You describe one column of a tabular dataset for an analyst. \
            Given the column's name, inferred dtype, summary statistics and sample values, \
            give it a short semantic type (for example: price, year, country, identifier, \
            measurement, rating) and a one-sentence description of what it contains."
            .to_string(),
        inputs: vec![field("column", "column name, dtype, statistics and samples as JSON")],
        outputs: vec![
            field("semantic_type", "a short semantic label for the column"),
            field("description", "one sentence describing the column"),
        ],
    }
}

/// Fill `semantic_type` and `description` for each column.
pub async fn annotate_columns(
    llm: &dyn LlmClient,
    properties: &mut [ColumnProperty],
    schema_retries: u32,
) {
    for prop in properties.iter_mut() {
        let column = match serde_json::to_string(&prop) {
            Ok(text) => text,
            Err(e) => {
                warn!(column = %prop.column_name, error = %e, "could not serialize column");
                continue;
            }
        };
        let prompt = Prompt::new(enrich_column_signature()).input("column", column);
        match complete_as::<ColumnAnnotation>(llm, &prompt, schema_retries).await {
            Ok(annotation) => {
                prop.properties.semantic_type = annotation.semantic_type;
                prop.properties.description = annotation.description;
            }
            Err(e) => {
                warn!(column = %prop.column_name, error = %e, "column annotation failed");
            }
        }
        if prop.properties.semantic_type.is_empty() {
            prop.properties.semantic_type = prop.properties.dtype.clone();
        }
    }
}

/// Derive the high-level schema from annotated properties.
pub fn dataset_schema(properties: &[ColumnProperty]) -> Vec<ColumnSchema> {
    properties
        .iter()
        .map(|p| ColumnSchema {
            column_name: p.column_name.clone(),
            description: p.properties.description.clone(),
            semantic_type: if p.properties.semantic_type.is_empty() {
                p.properties.dtype.clone()
            } else {
                p.properties.semantic_type.clone()
            },
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct DatasetDescription {
    dataset_description: String,
}

/// Ask for a one-paragraph description of the whole dataset.
pub async fn describe_dataset(
    llm: &dyn LlmClient,
    schema: &[ColumnSchema],
    schema_retries: u32,
) -> anyhow::Result<String> {
    let signature = Signature {
        name: "DescribeDataset",
        instructions: "Given the column schema of a dataset, write one short paragraph \
            describing what the dataset is about and what questions it can answer."
            .to_string(),
        inputs: vec![field("dataset_schema", "columns with semantic types and descriptions")],
        outputs: vec![field("dataset_description", "a one-paragraph description")],
    };
    let prompt = Prompt::new(signature).input("dataset_schema", serde_json::to_string(schema)?);
    let reply: DatasetDescription = complete_as(llm, &prompt, schema_retries).await?;
    Ok(reply.dataset_description)
}

/// Full enrichment of a frame: statistics, annotations and derived schema.
pub async fn enrich_frame(
    llm: &dyn LlmClient,
    frame: &TabularFrame,
    samples: usize,
    schema_retries: u32,
) -> (Vec<ColumnProperty>, Vec<ColumnSchema>) {
    let mut properties = column_properties(frame, samples);
    annotate_columns(llm, &mut properties, schema_retries).await;
    let schema = dataset_schema(&properties);
    info!(columns = schema.len(), "enriched dataset schema");
    (properties, schema)
}
