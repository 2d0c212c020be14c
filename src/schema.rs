//! Schema Catalog
//!
//! Introspects a connection into a table -> columns map plus one readable
//! document per table. Snapshots are cached per connection URL for the
//! lifetime of the process.

use crate::db::{ConnectionDescriptor, DatabaseConnector};
use crate::error::Result;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub tables: IndexMap<String, Vec<String>>,
    pub docs: Vec<String>,
}

impl SchemaSnapshot {
    /// Groups `(table, column)` pairs by table, keeping first-seen table order
    /// and column order within each table.
    pub fn from_columns<I>(columns: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut tables: IndexMap<String, Vec<String>> = IndexMap::new();
        for (table, column) in columns {
            tables.entry(table).or_default().push(column);
        }
        let docs = tables
            .iter()
            .map(|(table, cols)| table_doc(table, cols))
            .collect();
        Self { tables, docs }
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// All docs joined by newlines.
    pub fn docs_text(&self) -> String {
        self.docs.join("\n")
    }

    /// True when `name` equals a table or column name, ignoring case.
    pub fn has_identifier(&self, name: &str) -> bool {
        self.tables.iter().any(|(table, cols)| {
            table.eq_ignore_ascii_case(name) || cols.iter().any(|c| c.eq_ignore_ascii_case(name))
        })
    }
}

fn table_doc(table: &str, columns: &[String]) -> String {
    format!("table {}: {}", table, columns.join(", "))
}

/// Side-channel record written next to the process for inspection.
#[derive(Debug, Serialize)]
struct DbInfo<'a> {
    db: &'a str,
    host: &'a str,
    port: u16,
    tables: &'a IndexMap<String, Vec<String>>,
    docs: &'a [String],
}

pub struct SchemaCatalog {
    cache: Mutex<HashMap<String, SchemaSnapshot>>,
    db_info_dir: Option<PathBuf>,
}

impl SchemaCatalog {
    pub fn new(db_info_dir: Option<PathBuf>) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            db_info_dir,
        }
    }

    /// Returns the cached snapshot for this connection, introspecting on a miss.
    pub async fn load(&self, connector: &dyn DatabaseConnector) -> Result<SchemaSnapshot> {
        let key = connector.descriptor().url.clone();
        if let Some(snapshot) = self.cached(&key) {
            debug!("Schema cache hit ({} tables)", snapshot.table_count());
            return Ok(snapshot);
        }
        self.refresh(connector).await
    }

    /// Introspects the connection and replaces any cached snapshot.
    pub async fn refresh(&self, connector: &dyn DatabaseConnector) -> Result<SchemaSnapshot> {
        let descriptor = connector.descriptor();
        let columns = connector.list_columns().await?;
        let snapshot = SchemaSnapshot::from_columns(columns);
        info!(
            "Loaded schema for '{}' ({} tables)",
            descriptor.database,
            snapshot.table_count()
        );

        if let Some(ref dir) = self.db_info_dir {
            if let Err(e) = write_db_info(dir, descriptor, &snapshot) {
                warn!("Could not write db info to {}: {}", dir.display(), e);
            }
        }

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(descriptor.url.clone(), snapshot.clone());
        }
        Ok(snapshot)
    }

    pub fn invalidate(&self, url: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(url);
        }
    }

    fn cached(&self, key: &str) -> Option<SchemaSnapshot> {
        self.cache.lock().ok().and_then(|cache| cache.get(key).cloned())
    }
}

fn write_db_info(
    dir: &Path,
    descriptor: &ConnectionDescriptor,
    snapshot: &SchemaSnapshot,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let name = if descriptor.database.is_empty() {
        "default"
    } else {
        descriptor.database.as_str()
    };
    let path = dir.join(format!("{}.json", name));
    let info = DbInfo {
        db: &descriptor.database,
        host: &descriptor.host,
        port: descriptor.port,
        tables: &snapshot.tables,
        docs: &snapshot.docs,
    };
    std::fs::write(&path, serde_json::to_string(&info)?)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ExecutionResult;
    use crate::error::Text2SqlError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeConnector {
        descriptor: ConnectionDescriptor,
        columns: Vec<(String, String)>,
        calls: AtomicUsize,
    }

    impl FakeConnector {
        fn new(columns: &[(&str, &str)]) -> Self {
            Self {
                descriptor: ConnectionDescriptor::parse("mysql://root:pw@localhost:3306/db").unwrap(),
                columns: columns
                    .iter()
                    .map(|(t, c)| (t.to_string(), c.to_string()))
                    .collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DatabaseConnector for FakeConnector {
        fn descriptor(&self) -> &ConnectionDescriptor {
            &self.descriptor
        }

        async fn list_columns(&self) -> Result<Vec<(String, String)>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.columns.clone())
        }

        async fn execute(&self, _sql: &str) -> Result<ExecutionResult> {
            Err(Text2SqlError::Query("not supported".to_string()))
        }

        async fn explain(&self, _sql: &str) -> Result<ExecutionResult> {
            Err(Text2SqlError::Query("not supported".to_string()))
        }
    }

    #[test]
    fn test_snapshot_groups_columns() {
        let snapshot = SchemaSnapshot::from_columns(vec![
            ("t1".to_string(), "c1".to_string()),
            ("t1".to_string(), "c2".to_string()),
            ("t2".to_string(), "a".to_string()),
        ]);
        assert_eq!(snapshot.tables.keys().collect::<Vec<_>>(), vec!["t1", "t2"]);
        assert_eq!(snapshot.tables["t1"], vec!["c1", "c2"]);
        assert_eq!(snapshot.docs, vec!["table t1: c1, c2", "table t2: a"]);
        assert_eq!(snapshot.docs.len(), snapshot.tables.len());
    }

    #[test]
    fn test_has_identifier_ignores_case() {
        let snapshot =
            SchemaSnapshot::from_columns(vec![("Orders".to_string(), "Total".to_string())]);
        assert!(snapshot.has_identifier("orders"));
        assert!(snapshot.has_identifier("TOTAL"));
        assert!(!snapshot.has_identifier("customer"));
    }

    #[tokio::test]
    async fn test_load_writes_db_info() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = SchemaCatalog::new(Some(dir.path().to_path_buf()));
        let connector = FakeConnector::new(&[("t1", "c1"), ("t1", "c2"), ("t2", "a")]);

        let snapshot = catalog.load(&connector).await.unwrap();
        assert!(snapshot.tables.contains_key("t1"));
        assert!(snapshot.tables.contains_key("t2"));

        let written = std::fs::read_to_string(dir.path().join("db.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&written).unwrap();
        assert_eq!(value["db"], "db");
        assert_eq!(value["port"], 3306);
        assert_eq!(value["docs"][0], "table t1: c1, c2");
    }

    #[tokio::test]
    async fn test_load_is_cached_and_stable() {
        let catalog = SchemaCatalog::new(None);
        let connector = FakeConnector::new(&[("orders", "id"), ("orders", "total")]);

        let first = catalog.load(&connector).await.unwrap();
        let second = catalog.load(&connector).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);

        let refreshed = catalog.refresh(&connector).await.unwrap();
        assert_eq!(first, refreshed);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unwritable_db_info_does_not_fail_load() {
        let file = tempfile::NamedTempFile::new().unwrap();
        // A regular file where a directory is expected.
        let catalog = SchemaCatalog::new(Some(file.path().join("nested")));
        let connector = FakeConnector::new(&[("t", "c")]);
        assert!(catalog.load(&connector).await.is_ok());
    }
}
