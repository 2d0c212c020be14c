//! Result rendering for the command line: aligned text tables, JSON and CSV,
//! plus timestamped result files.

use crate::error::Result;
use chrono::Local;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

pub const DEFAULT_RESULTS_DIR: &str = "results";

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Fixed-width table with a `-+-` separator under the header line.
pub fn to_table(headers: &[String], rows: &[Vec<Value>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    let rendered: Vec<Vec<String>> = rows
        .iter()
        .map(|row| row.iter().map(cell_text).collect())
        .collect();
    for row in &rendered {
        for (i, cell) in row.iter().enumerate().take(widths.len()) {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let pad = |text: &str, width: usize| {
        let fill = width.saturating_sub(text.chars().count());
        format!("{}{}", text, " ".repeat(fill))
    };

    let mut lines = Vec::with_capacity(rendered.len() + 2);
    lines.push(
        headers
            .iter()
            .zip(&widths)
            .map(|(h, w)| pad(h, *w))
            .collect::<Vec<_>>()
            .join(" | "),
    );
    lines.push(
        widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-"),
    );
    for row in &rendered {
        lines.push(
            widths
                .iter()
                .enumerate()
                .map(|(i, w)| pad(row.get(i).map(String::as_str).unwrap_or(""), *w))
                .collect::<Vec<_>>()
                .join(" | "),
        );
    }
    lines.join("\n")
}

/// Rows as objects keyed by header.
pub fn rows_as_objects(headers: &[String], rows: &[Vec<Value>]) -> Vec<Value> {
    rows.iter()
        .map(|row| {
            let mut item = Map::new();
            for (i, header) in headers.iter().enumerate() {
                item.insert(header.clone(), row.get(i).cloned().unwrap_or(Value::Null));
            }
            Value::Object(item)
        })
        .collect()
}

pub fn to_json(headers: &[String], rows: &[Vec<Value>]) -> Result<String> {
    Ok(serde_json::to_string(&rows_as_objects(headers, rows))?)
}

pub fn to_csv(headers: &[String], rows: &[Vec<Value>]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(headers)?;
    for row in rows {
        writer.write_record(row.iter().map(|v| match v {
            Value::Null => String::new(),
            other => cell_text(other),
        }))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn result_path(dir: &Path, extension: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    Ok(dir.join(format!("result_{}.{}", stamp, extension)))
}

/// Writes `{question, sql, rows}` to a timestamped JSON file under `dir`.
pub fn save_json(
    dir: &Path,
    question: &str,
    sql: &str,
    headers: &[String],
    rows: &[Vec<Value>],
) -> Result<PathBuf> {
    let path = result_path(dir, "json")?;
    let payload = serde_json::json!({
        "question": question,
        "sql": sql,
        "rows": rows_as_objects(headers, rows),
    });
    std::fs::write(&path, serde_json::to_string(&payload)?)?;
    Ok(path)
}

/// Writes a one-row CSV: question, sql, rows as a JSON array.
pub fn save_csv(
    dir: &Path,
    question: &str,
    sql: &str,
    headers: &[String],
    rows: &[Vec<Value>],
) -> Result<PathBuf> {
    let path = result_path(dir, "csv")?;
    let mut writer = csv::Writer::from_path(&path)?;
    writer.write_record(["question", "sql", "rows"])?;
    let rows_json = serde_json::to_string(&rows_as_objects(headers, rows))?;
    writer.write_record([question, sql, rows_json.as_str()])?;
    writer.flush()?;
    Ok(path)
}
