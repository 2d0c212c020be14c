//! SQL Server connector backed by tiberius
//!
//! Connection settings vary a lot between deployments (named instances,
//! self-signed certificates, servers without TLS), so `connect` walks a list
//! of candidate configurations and keeps the first one that works.

use super::{ConnectionDescriptor, DatabaseConnector, ExecutionResult};
use crate::error::{Result, Text2SqlError};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, SqlBrowser};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::debug;

type MssqlClient = Client<Compat<TcpStream>>;

const LIST_COLUMNS_SQL: &str = "SELECT TABLE_NAME, COLUMN_NAME FROM INFORMATION_SCHEMA.COLUMNS \
     ORDER BY TABLE_NAME, ORDINAL_POSITION";

/// One way of reaching the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Candidate {
    named_instance: bool,
    relaxed_tls: bool,
}

pub struct MssqlConnector {
    descriptor: ConnectionDescriptor,
}

impl MssqlConnector {
    pub fn new(descriptor: ConnectionDescriptor) -> Self {
        Self { descriptor }
    }

    fn candidates(&self) -> Vec<Candidate> {
        let mut out = Vec::new();
        let routes: &[bool] = if self.descriptor.instance.is_some() {
            &[true, false]
        } else {
            &[false]
        };
        for &named_instance in routes {
            for relaxed_tls in [false, true] {
                out.push(Candidate {
                    named_instance,
                    relaxed_tls,
                });
            }
        }
        out
    }

    fn config_for(&self, candidate: Candidate) -> Config {
        let d = &self.descriptor;
        let mut config = Config::new();
        config.host(&d.host);
        config.port(d.port);
        if !d.database.is_empty() {
            config.database(&d.database);
        }
        config.authentication(AuthMethod::sql_server(&d.user, &d.password));
        if candidate.named_instance {
            if let Some(ref instance) = d.instance {
                config.instance_name(instance);
            }
        }
        if candidate.relaxed_tls {
            config.encryption(EncryptionLevel::NotSupported);
            config.trust_cert();
        }
        config
    }

    async fn try_connect(config: Config, named_instance: bool) -> tiberius::Result<MssqlClient> {
        let tcp = if named_instance {
            TcpStream::connect_named(&config).await?
        } else {
            TcpStream::connect(config.get_addr()).await?
        };
        tcp.set_nodelay(true)?;
        Client::connect(config, tcp.compat_write()).await
    }

    async fn connect(&self) -> Result<MssqlClient> {
        let mut last_err = None;
        for candidate in self.candidates() {
            let config = self.config_for(candidate);
            match Self::try_connect(config, candidate.named_instance).await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    debug!(?candidate, "SQL Server connection attempt failed: {}", e);
                    last_err = Some(e);
                }
            }
        }
        Err(Text2SqlError::Connection(format!(
            "Failed to connect SQL Server {}:{} with available settings: {}",
            self.descriptor.host,
            self.descriptor.port,
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no candidates".to_string())
        )))
    }
}

async fn fetch_with(client: &mut MssqlClient, sql: &str) -> tiberius::Result<ExecutionResult> {
    let mut stream = client.simple_query(sql).await?;
    let headers: Vec<String> = stream
        .columns()
        .await?
        .map(|cols| cols.iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    let rows = stream
        .into_first_result()
        .await?
        .into_iter()
        .map(|row| row.into_iter().map(|data| column_to_value(&data)).collect())
        .collect();
    Ok(ExecutionResult::new(headers, rows))
}

fn query_error(e: tiberius::error::Error) -> Text2SqlError {
    Text2SqlError::Query(e.to_string())
}

fn column_to_value(data: &ColumnData<'static>) -> Value {
    let value = match data {
        ColumnData::U8(v) => v.map(Value::from),
        ColumnData::I16(v) => v.map(Value::from),
        ColumnData::I32(v) => v.map(Value::from),
        ColumnData::I64(v) => v.map(Value::from),
        ColumnData::F32(v) => v.map(|f| Value::from(f64::from(f))),
        ColumnData::F64(v) => v.map(Value::from),
        ColumnData::Bit(v) => v.map(Value::Bool),
        ColumnData::String(v) => v.as_ref().map(|s| Value::String(s.to_string())),
        ColumnData::Guid(v) => v.map(|g| Value::String(g.to_string())),
        ColumnData::Numeric(v) => v.map(|n| Value::String(n.to_string())),
        ColumnData::Binary(v) => v
            .as_ref()
            .map(|b| Value::String(String::from_utf8_lossy(b).into_owned())),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(data)
                .ok()
                .flatten()
                .map(|v| Value::String(v.to_string()))
        }
        ColumnData::Date(_) => NaiveDate::from_sql(data)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_string())),
        ColumnData::Time(_) => NaiveTime::from_sql(data)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_string())),
        ColumnData::DateTimeOffset(_) => DateTime::<FixedOffset>::from_sql(data)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_rfc3339())),
        _ => None,
    };
    value.unwrap_or(Value::Null)
}

#[async_trait]
impl DatabaseConnector for MssqlConnector {
    fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    async fn list_columns(&self) -> Result<Vec<(String, String)>> {
        let mut client = self.connect().await?;
        let rows = client
            .simple_query(LIST_COLUMNS_SQL)
            .await
            .map_err(query_error)?
            .into_first_result()
            .await
            .map_err(query_error)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let table: Option<&str> = row.try_get(0).map_err(query_error)?;
            let column: Option<&str> = row.try_get(1).map_err(query_error)?;
            if let (Some(table), Some(column)) = (table, column) {
                out.push((table.to_string(), column.to_string()));
            }
        }
        let _ = client.close().await;
        Ok(out)
    }

    async fn execute(&self, sql: &str) -> Result<ExecutionResult> {
        let mut client = self.connect().await?;
        let result = fetch_with(&mut client, sql).await.map_err(query_error);
        let _ = client.close().await;
        result
    }

    async fn explain(&self, sql: &str) -> Result<ExecutionResult> {
        let mut client = self.connect().await?;
        client
            .simple_query("SET SHOWPLAN_TEXT ON")
            .await
            .map_err(query_error)?
            .into_results()
            .await
            .map_err(query_error)?;

        let result = fetch_with(&mut client, sql).await.map_err(query_error);

        if let Ok(stream) = client.simple_query("SET SHOWPLAN_TEXT OFF").await {
            let _ = stream.into_results().await;
        }
        let _ = client.close().await;

        let mut plan = result?;
        if plan.headers.is_empty() {
            plan.headers = vec!["Plan".to_string()];
        }
        Ok(plan)
    }
}
