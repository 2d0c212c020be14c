use crate::guard::Rejection;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Text2SqlError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Unsupported dialect: {0}")]
    UnsupportedDialect(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, Text2SqlError>;

/// Coarse classification used when reporting failures per batch item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingQuestion,
    UngroundedQuestion,
    SemanticMismatch,
    UnsafeSql,
    Connection,
    UnsupportedDialect,
    Generation,
    ModelUnavailable,
    Query,
    Other,
}

impl Text2SqlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Text2SqlError::Connection(_) => ErrorKind::Connection,
            Text2SqlError::UnsupportedDialect(_) => ErrorKind::UnsupportedDialect,
            Text2SqlError::Generation(_) => ErrorKind::Generation,
            Text2SqlError::ModelUnavailable(_) => ErrorKind::ModelUnavailable,
            Text2SqlError::Query(_) => ErrorKind::Query,
            Text2SqlError::Rejected(rejection) => rejection.kind(),
            _ => ErrorKind::Other,
        }
    }
}
