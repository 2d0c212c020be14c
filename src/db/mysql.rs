//! MySQL connector backed by sqlx

use super::{redact, ConnectionDescriptor, DatabaseConnector, ExecutionResult};
use crate::error::{Result, Text2SqlError};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::{Column, Connection, Executor, Row, Statement, TypeInfo, ValueRef};
use std::str::FromStr;
use tracing::debug;

const LIST_COLUMNS_SQL: &str = "SELECT CAST(table_name AS CHAR) AS table_name, \
     CAST(column_name AS CHAR) AS column_name \
     FROM information_schema.columns WHERE table_schema = ? \
     ORDER BY table_name, ordinal_position";

pub struct MySqlConnector {
    descriptor: ConnectionDescriptor,
    options: MySqlConnectOptions,
}

impl MySqlConnector {
    pub fn new(descriptor: ConnectionDescriptor) -> Result<Self> {
        let options = MySqlConnectOptions::from_str(&descriptor.url)
            .map_err(|e| Text2SqlError::Connection(format!("Invalid MySQL URL: {}", e)))?
            .charset("utf8mb4");
        Ok(Self { descriptor, options })
    }

    async fn connect(&self) -> Result<MySqlConnection> {
        debug!("Connecting to MySQL at {}", redact(&self.descriptor.url));
        MySqlConnection::connect_with(&self.options)
            .await
            .map_err(|e| {
                Text2SqlError::Connection(format!(
                    "Failed to connect to MySQL {}:{}: {}",
                    self.descriptor.host, self.descriptor.port, e
                ))
            })
    }

    async fn fetch(&self, sql: &str) -> Result<ExecutionResult> {
        let mut conn = self.connect().await?;
        let result = fetch_with(&mut conn, sql).await;
        let _ = conn.close().await;
        result
    }
}

async fn fetch_with(conn: &mut MySqlConnection, sql: &str) -> Result<ExecutionResult> {
    let rows = sqlx::query(sql)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| Text2SqlError::Query(e.to_string()))?;

    let headers = match rows.first() {
        Some(first) => first.columns().iter().map(|c| c.name().to_string()).collect(),
        // No rows to read column names from; ask the server to describe the statement.
        None => match conn.prepare(sql).await {
            Ok(stmt) => stmt.columns().iter().map(|c| c.name().to_string()).collect(),
            Err(_) => Vec::new(),
        },
    };

    let rows = rows
        .iter()
        .map(|row| (0..row.len()).map(|idx| decode_cell(row, idx)).collect())
        .collect();

    Ok(ExecutionResult::new(headers, rows))
}

/// Best-effort conversion of a MySQL cell into JSON.
fn decode_cell(row: &MySqlRow, idx: usize) -> Value {
    match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Err(_) => return Value::Null,
        _ => {}
    }

    let type_name = row.column(idx).type_info().name();
    let decoded = match type_name {
        "BOOLEAN" => row.try_get::<bool, _>(idx).ok().map(Value::from),
        t if t.ends_with("UNSIGNED") => row.try_get::<u64, _>(idx).ok().map(Value::from),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            row.try_get::<i64, _>(idx).ok().map(Value::from)
        }
        "FLOAT" | "DOUBLE" => row
            .try_get::<f64, _>(idx)
            .or_else(|_| row.try_get::<f32, _>(idx).map(f64::from))
            .ok()
            .map(Value::from),
        "DATETIME" | "TIMESTAMP" => row
            .try_get::<NaiveDateTime, _>(idx)
            .ok()
            .map(|v| Value::String(v.to_string())),
        "DATE" => row
            .try_get::<NaiveDate, _>(idx)
            .ok()
            .map(|v| Value::String(v.to_string())),
        "TIME" => row
            .try_get::<NaiveTime, _>(idx)
            .ok()
            .map(|v| Value::String(v.to_string())),
        _ => None,
    };

    decoded
        .or_else(|| row.try_get_unchecked::<String, _>(idx).ok().map(Value::String))
        .or_else(|| {
            row.try_get_unchecked::<Vec<u8>, _>(idx)
                .ok()
                .map(|bytes| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        })
        .unwrap_or(Value::Null)
}

#[async_trait]
impl DatabaseConnector for MySqlConnector {
    fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    async fn list_columns(&self) -> Result<Vec<(String, String)>> {
        let mut conn = self.connect().await?;
        let rows = sqlx::query(LIST_COLUMNS_SQL)
            .bind(&self.descriptor.database)
            .fetch_all(&mut conn)
            .await
            .map_err(|e| Text2SqlError::Query(format!("Schema introspection failed: {}", e)));
        let _ = conn.close().await;

        rows?
            .iter()
            .map(|row| {
                let table: String = row
                    .try_get(0)
                    .map_err(|e| Text2SqlError::Query(e.to_string()))?;
                let column: String = row
                    .try_get(1)
                    .map_err(|e| Text2SqlError::Query(e.to_string()))?;
                Ok((table, column))
            })
            .collect()
    }

    async fn execute(&self, sql: &str) -> Result<ExecutionResult> {
        self.fetch(sql).await
    }

    async fn explain(&self, sql: &str) -> Result<ExecutionResult> {
        self.fetch(&format!("EXPLAIN {}", sql)).await
    }
}
