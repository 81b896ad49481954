//! A small row-oriented tabular frame.
//!
//! Rows are JSON objects keyed by column name; `columns` keeps the column
//! order. Missing keys and JSON `null` both mean "no value".

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TabularFrame {
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
}

impl TabularFrame {
    pub fn new(columns: Vec<String>, rows: Vec<Map<String, Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// All values of one column in row order, `Null` where absent.
    pub fn column(&self, name: &str) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| row.get(name).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Rows as a list of JSON objects, for the `data` field of replies.
    pub fn to_records(&self) -> Vec<Value> {
        self.rows.iter().cloned().map(Value::Object).collect()
    }

    /// Build a frame from either `{"columns": [...], "rows": [...]}` or a
    /// plain array of row objects.
    ///
    /// For the array form, columns are collected from the row keys.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Object(obj) if obj.contains_key("rows") => {
                let rows = match obj.get("rows") {
                    Some(Value::Array(rows)) => rows_from_array(rows)?,
                    // An empty Lua table comes back as an empty object.
                    Some(Value::Object(o)) if o.is_empty() => Vec::new(),
                    _ => bail!("`rows` must be an array of row tables"),
                };
                let columns = match obj.get("columns") {
                    Some(Value::Array(cols)) => cols
                        .iter()
                        .map(|c| match c {
                            Value::String(s) => Ok(s.clone()),
                            other => bail!("column names must be strings, got {}", other),
                        })
                        .collect::<Result<Vec<_>>>()?,
                    _ => infer_columns(&rows),
                };
                Ok(Self { columns, rows })
            }
            Value::Array(items) => {
                let rows = rows_from_array(items)?;
                let columns = infer_columns(&rows);
                Ok(Self { columns, rows })
            }
            other => bail!(
                "expected a frame table or an array of rows, got {}",
                type_name(other)
            ),
        }
    }
}

fn rows_from_array(items: &[Value]) -> Result<Vec<Map<String, Value>>> {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(row) => Ok(row.clone()),
            other => bail!("row {} is a {}, expected a table", i + 1, type_name(other)),
        })
        .collect()
}

fn infer_columns(rows: &[Map<String, Value>]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "nil",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "table",
    }
}
