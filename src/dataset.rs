//! Loading datasets into a [`TabularFrame`].
//!
//! Sources are CSV files addressed by a local path, a `file://` URI or an
//! `http(s)://` URL. Cell values are typed per cell: empty cells become
//! `null`, integers and floats become numbers, `true`/`false` become
//! booleans, everything else stays a string.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{Map, Number, Value};
use tracing::info;
use vizchat_core::frame::TabularFrame;

/// Read the CSV at `uri` into a frame.
pub async fn load_frame(uri: &str) -> Result<TabularFrame> {
    let text = if uri.starts_with("http://") || uri.starts_with("https://") {
        let response = reqwest::get(uri)
            .await
            .with_context(|| format!("Failed to fetch dataset: {}", uri))?
            .error_for_status()
            .with_context(|| format!("Failed to fetch dataset: {}", uri))?;
        response.text().await?
    } else {
        let path = uri.strip_prefix("file://").unwrap_or(uri);
        tokio::fs::read_to_string(Path::new(path))
            .await
            .with_context(|| format!("Failed to read dataset: {}", path))?
    };

    let frame = parse_csv(&text).with_context(|| format!("Failed to parse dataset: {}", uri))?;
    info!(uri, rows = frame.len(), columns = frame.columns.len(), "loaded dataset");
    Ok(frame)
}

/// Parse CSV text with a header row.
pub fn parse_csv(text: &str) -> Result<TabularFrame> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let columns: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut row = Map::new();
        for (name, cell) in columns.iter().zip(record.iter()) {
            row.insert(name.clone(), parse_cell(cell));
        }
        rows.push(row);
    }

    Ok(TabularFrame::new(columns, rows))
}

fn parse_cell(cell: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = cell.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(f) = cell.parse::<f64>() {
        if let Some(n) = Number::from_f64(f) {
            return Value::Number(n);
        }
        return Value::Null;
    }
    match cell {
        "true" | "True" | "TRUE" => Value::Bool(true),
        "false" | "False" | "FALSE" => Value::Bool(false),
        _ => Value::String(cell.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cells_are_typed() {
        let frame = parse_csv("a,b,c,d\n1,2.5,true,x\n,NaN,False,  y \n").unwrap();
        assert_eq!(frame.columns, vec!["a", "b", "c", "d"]);
        assert_eq!(frame.rows[0]["a"], json!(1));
        assert_eq!(frame.rows[0]["b"], json!(2.5));
        assert_eq!(frame.rows[0]["c"], json!(true));
        assert_eq!(frame.rows[0]["d"], json!("x"));
        assert_eq!(frame.rows[1]["a"], Value::Null);
        assert_eq!(frame.rows[1]["b"], Value::Null);
        assert_eq!(frame.rows[1]["c"], json!(false));
        assert_eq!(frame.rows[1]["d"], json!("y"));
    }

    #[tokio::test]
    async fn loads_local_file_and_file_uri() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cars.csv");
        std::fs::write(&path, "engine_size,city_mpg\n1.6,31\n3.0,19\n").unwrap();

        let frame = load_frame(path.to_str().unwrap()).await.unwrap();
        assert_eq!(frame.len(), 2);

        let uri = format!("file://{}", path.display());
        let frame = load_frame(&uri).await.unwrap();
        assert_eq!(frame.column("city_mpg"), vec![json!(31), json!(19)]);

        assert!(load_frame("/definitely/not/here.csv").await.is_err());
    }
}
