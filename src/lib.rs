pub mod config;
pub mod db;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod guard;
pub mod llm;
pub mod orchestrator;
pub mod output;
pub mod schema;
pub mod schema_rag;

pub use config::{Config, ConfigUpdate};
pub use dialect::Dialect;
pub use error::{ErrorKind, Result, Text2SqlError};
pub use guard::{Rejection, SqlGuard, ValidatedSql};
pub use orchestrator::{
    BatchItemResult, BatchOptions, Orchestrator, ProgressListener, QueryOutcome, RunOptions, Stage,
};
pub use schema::{SchemaCatalog, SchemaSnapshot};
