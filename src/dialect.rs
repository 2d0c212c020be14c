use crate::error::{Result, Text2SqlError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Target SQL variant. Drives prompt phrasing and driver selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Mysql,
    Mssql,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Mysql => "mysql",
            Dialect::Mssql => "mssql",
        }
    }

    /// Dialect implied by a connection URL. Anything that is not `mssql://`
    /// is treated as MySQL; the connector rejects unknown schemes later.
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("mssql://") {
            Dialect::Mssql
        } else {
            Dialect::Mysql
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = Text2SqlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" => Ok(Dialect::Mysql),
            "mssql" | "sqlserver" => Ok(Dialect::Mssql),
            other => Err(Text2SqlError::UnsupportedDialect(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_from_url() {
        assert_eq!(Dialect::from_url("mssql://sa:pw@host:1433/db"), Dialect::Mssql);
        assert_eq!(Dialect::from_url("mysql://root@localhost/db"), Dialect::Mysql);
        assert_eq!(Dialect::from_url("postgres://x"), Dialect::Mysql);
    }

    #[test]
    fn test_dialect_parse() {
        assert_eq!("MySQL".parse::<Dialect>().unwrap(), Dialect::Mysql);
        assert_eq!("sqlserver".parse::<Dialect>().unwrap(), Dialect::Mssql);
        assert!(matches!(
            "oracle".parse::<Dialect>(),
            Err(Text2SqlError::UnsupportedDialect(_))
        ));
    }
}
