//! Query execution
//!
//! Runs guarded statements against a connector under a timeout.

use crate::db::{DatabaseConnector, ExecutionResult};
use crate::error::{Result, Text2SqlError};
use crate::guard::ValidatedSql;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct QueryExecutor {
    connector: Arc<dyn DatabaseConnector>,
    timeout: Duration,
}

impl QueryExecutor {
    pub fn new(connector: Arc<dyn DatabaseConnector>, timeout: Duration) -> Self {
        Self { connector, timeout }
    }

    pub async fn query(&self, sql: &ValidatedSql) -> Result<ExecutionResult> {
        let result = self
            .bounded(self.connector.execute(sql.as_str()), "query")
            .await?;
        info!(
            "Query returned {} rows, {} columns",
            result.rows.len(),
            result.headers.len()
        );
        Ok(result)
    }

    pub async fn explain(&self, sql: &ValidatedSql) -> Result<ExecutionResult> {
        let plan = self
            .bounded(self.connector.explain(sql.as_str()), "explain")
            .await?;
        info!("Plan has {} rows", plan.rows.len());
        Ok(plan)
    }

    async fn bounded<F>(&self, fut: F, what: &str) -> Result<ExecutionResult>
    where
        F: std::future::Future<Output = Result<ExecutionResult>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Text2SqlError::Query(format!(
                "{} timed out after {}s",
                what,
                self.timeout.as_secs()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ConnectionDescriptor;
    use crate::dialect::Dialect;
    use crate::guard::validate;
    use async_trait::async_trait;

    struct SlowConnector {
        descriptor: ConnectionDescriptor,
        delay: Duration,
    }

    #[async_trait]
    impl DatabaseConnector for SlowConnector {
        fn descriptor(&self) -> &ConnectionDescriptor {
            &self.descriptor
        }

        async fn list_columns(&self) -> Result<Vec<(String, String)>> {
            Ok(Vec::new())
        }

        async fn execute(&self, sql: &str) -> Result<ExecutionResult> {
            tokio::time::sleep(self.delay).await;
            Ok(ExecutionResult::new(
                vec!["sql".to_string()],
                vec![vec![serde_json::json!(sql)]],
            ))
        }

        async fn explain(&self, _sql: &str) -> Result<ExecutionResult> {
            tokio::time::sleep(self.delay).await;
            Ok(ExecutionResult::new(vec!["Plan".to_string()], Vec::new()))
        }
    }

    fn executor(delay_ms: u64, timeout_ms: u64) -> QueryExecutor {
        let connector = SlowConnector {
            descriptor: ConnectionDescriptor::parse("mysql://root@localhost/db").unwrap(),
            delay: Duration::from_millis(delay_ms),
        };
        QueryExecutor::new(Arc::new(connector), Duration::from_millis(timeout_ms))
    }

    #[tokio::test]
    async fn test_query_passes_validated_text() {
        let sql = validate("SELECT 1", Dialect::Mysql).unwrap();
        let result = executor(0, 1000).query(&sql).await.unwrap();
        assert_eq!(result.rows[0][0], "SELECT 1 LIMIT 100");
    }

    #[tokio::test]
    async fn test_timeout_surfaces_as_query_error() {
        let sql = validate("SELECT 1", Dialect::Mysql).unwrap();
        let err = executor(200, 10).query(&sql).await.unwrap_err();
        assert!(matches!(err, Text2SqlError::Query(_)));
        let err = executor(200, 10).explain(&sql).await.unwrap_err();
        assert!(matches!(err, Text2SqlError::Query(_)));
    }
}
