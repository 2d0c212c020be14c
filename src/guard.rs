//! Safety & Semantics Guard
//!
//! Every candidate statement passes through a fixed sequence of checks
//! before it may reach a database:
//!
//! 1. sentinel: the model said the question cannot be grounded
//! 2. semantics: domain terms and temporal grouping match the schema/SQL
//! 3. safety: read-only, single statement, row limit present
//!
//! Only `validate` can produce a `ValidatedSql`, which is the sole input type
//! the executor accepts.

use crate::dialect::Dialect;
use crate::error::ErrorKind;
use crate::schema::SchemaSnapshot;
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use thiserror::Error;
use tracing::warn;

pub const FORBIDDEN_KEYWORDS: &[&str] = &["delete", "update", "insert", "drop", "alter", "truncate"];
pub const UNGROUNDED_SENTINEL: &str = "7355608";
pub const DEFAULT_LIMIT_CLAUSE: &str = "LIMIT 100";

/// Aggregation phrases that imply the answer is grouped by a time bucket.
pub const TEMPORAL_PHRASES: &[&str] = &[
    "daily", "per day", "each day", "by day", "every day", "monthly", "per month", "by month",
    "weekly", "per week", "yearly", "per year", "每天", "每日", "按天", "每月", "按月", "每周",
    "按周", "每年",
];

/// Alias groups for business terms that must exist in the schema when asked
/// about.
pub const DEFAULT_TERM_GROUPS: &[&[&str]] = &[&["pizza", "披萨", "比萨"]];

const QUESTION_STOPWORDS: &[&str] = &[
    "a", "an", "the", "of", "in", "on", "at", "to", "for", "by", "with", "from", "and", "or",
    "is", "are", "was", "were", "be", "do", "does", "did", "what", "which", "who", "whom",
    "when", "where", "why", "how", "many", "much", "show", "list", "give", "me", "find", "get",
    "all", "each", "every", "per", "top", "my", "our", "their", "this", "that", "these",
    "those", "it", "its", "than", "more", "less", "most", "least", "please", "can", "you",
];

lazy_static! {
    static ref GROUP_BY: Regex = Regex::new(r"(?i)group\s+by").unwrap();
    static ref IDENT_TOKEN: Regex = Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").unwrap();
    static ref CJK_RUN: Regex = Regex::new(r"[\x{4e00}-\x{9fff}]{2,}").unwrap();
}

/// Why a candidate statement was refused. Soft failure: reported to the
/// caller, never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("the question cannot be answered from the available tables and columns")]
    UngroundedQuestion,

    #[error("semantic mismatch: {reason}")]
    SemanticMismatch { reason: String },

    #[error("unsafe sql: {reason}")]
    UnsafeSql { reason: String },
}

impl Rejection {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Rejection::UngroundedQuestion => ErrorKind::UngroundedQuestion,
            Rejection::SemanticMismatch { .. } => ErrorKind::SemanticMismatch,
            Rejection::UnsafeSql { .. } => ErrorKind::UnsafeSql,
        }
    }

    fn unsafe_sql(reason: impl Into<String>) -> Self {
        Rejection::UnsafeSql {
            reason: reason.into(),
        }
    }

    fn mismatch(reason: impl Into<String>) -> Self {
        Rejection::SemanticMismatch {
            reason: reason.into(),
        }
    }
}

/// A statement that passed `validate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSql(String);

impl ValidatedSql {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ValidatedSql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ValidatedSql {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub fn check_sentinel(sql: &str) -> Result<(), Rejection> {
    if sql.trim() == UNGROUNDED_SENTINEL {
        return Err(Rejection::UngroundedQuestion);
    }
    Ok(())
}

/// Heuristic question/schema/SQL consistency checks.
pub fn check_semantics(
    question: &str,
    sql: &str,
    schema: &SchemaSnapshot,
    term_groups: &[Vec<String>],
) -> Result<(), Rejection> {
    let q = question.to_lowercase();
    let docs = schema.docs_text().to_lowercase();

    for group in term_groups {
        let asked = group.iter().find(|alias| q.contains(alias.to_lowercase().as_str()));
        if let Some(alias) = asked {
            let present = group.iter().any(|a| docs.contains(a.to_lowercase().as_str()));
            if !present {
                return Err(Rejection::mismatch(format!(
                    "the question mentions '{}' but no matching table or column exists",
                    alias
                )));
            }
        }
    }

    if let Some(phrase) = TEMPORAL_PHRASES.iter().find(|p| q.contains(**p)) {
        if !GROUP_BY.is_match(sql) {
            return Err(Rejection::mismatch(format!(
                "the question asks for a '{}' breakdown but the query has no GROUP BY",
                phrase
            )));
        }
    }

    Ok(())
}

/// Read-only single-statement check; appends the default limit when none is
/// present. The dialect does not change the checks.
pub fn validate(sql: &str, _dialect: Dialect) -> Result<ValidatedSql, Rejection> {
    let s = sql.trim();
    let lowered = s.to_lowercase();

    if let Some(keyword) = FORBIDDEN_KEYWORDS.iter().find(|k| lowered.contains(**k)) {
        return Err(Rejection::unsafe_sql(format!(
            "forbidden keyword '{}'",
            keyword
        )));
    }
    if s.contains(';') {
        return Err(Rejection::unsafe_sql("multiple statements are not allowed"));
    }
    if !lowered.starts_with("select") && !lowered.starts_with("explain select") {
        return Err(Rejection::unsafe_sql("only SELECT statements are allowed"));
    }

    if lowered.contains("limit") {
        Ok(ValidatedSql(s.to_string()))
    } else {
        Ok(ValidatedSql(format!("{} {}", s, DEFAULT_LIMIT_CLAUSE)))
    }
}

/// The guard with its configured term groups.
#[derive(Debug, Clone)]
pub struct SqlGuard {
    term_groups: Vec<Vec<String>>,
}

impl Default for SqlGuard {
    fn default() -> Self {
        Self::new(
            DEFAULT_TERM_GROUPS
                .iter()
                .map(|g| g.iter().map(|s| s.to_string()).collect())
                .collect(),
        )
    }
}

impl SqlGuard {
    pub fn new(term_groups: Vec<Vec<String>>) -> Self {
        Self { term_groups }
    }

    pub fn term_groups(&self) -> &[Vec<String>] {
        &self.term_groups
    }

    /// Sentinel, then semantics, then safety. Stops at the first rejection.
    pub fn check(
        &self,
        question: &str,
        sql: &str,
        schema: &SchemaSnapshot,
        dialect: Dialect,
    ) -> Result<ValidatedSql, Rejection> {
        let outcome = check_sentinel(sql)
            .and_then(|_| check_semantics(question, sql, schema, &self.term_groups))
            .and_then(|_| validate(sql, dialect));
        if let Err(ref rejection) = outcome {
            warn!("Rejected generated SQL: {}", rejection);
        }
        outcome
    }
}

/// Question terms the schema does not seem to cover, first-seen order,
/// deduplicated case-insensitively.
pub fn suggest_missing_terms(question: &str, schema: &SchemaSnapshot) -> Vec<String> {
    let docs = schema.docs_text().to_lowercase();

    IDENT_TOKEN
        .find_iter(question)
        .filter(|m| m.as_str().chars().count() >= 2)
        .filter(|m| !QUESTION_STOPWORDS.contains(&m.as_str().to_lowercase().as_str()))
        .merge_by(CJK_RUN.find_iter(question), |a, b| a.start() <= b.start())
        .map(|m| m.as_str())
        .filter(|term| !docs.contains(&term.to_lowercase()) && !schema.has_identifier(term))
        .unique_by(|term| term.to_lowercase())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(pairs: &[(&str, &str)]) -> SchemaSnapshot {
        SchemaSnapshot::from_columns(
            pairs
                .iter()
                .map(|(t, c)| (t.to_string(), c.to_string())),
        )
    }

    fn rejects_unsafe(sql: &str) -> bool {
        matches!(validate(sql, Dialect::Mysql), Err(Rejection::UnsafeSql { .. }))
    }

    #[test]
    fn test_forbidden_keywords_rejected() {
        for sql in [
            "SELECT * FROM t WHERE x = 1 OR 1=1 DELETE",
            "select * from t where note = 'Update me'",
            "INSERT INTO t VALUES (1)",
            "select 1 from dropped_items",
            "SELECT * FROM alter_log",
            "TRUNCATE t",
        ] {
            assert!(rejects_unsafe(sql), "{}", sql);
        }
    }

    #[test]
    fn test_semicolon_and_non_select_rejected() {
        assert!(rejects_unsafe("SELECT 1; SELECT 2"));
        assert!(rejects_unsafe("SELECT 1;"));
        assert!(rejects_unsafe("WITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(rejects_unsafe("show tables"));
        assert!(rejects_unsafe("EXPLAIN ANALYZE SELECT 1"));
    }

    #[test]
    fn test_limit_appended_once() {
        let v = validate("  SELECT id FROM orders  ", Dialect::Mysql).unwrap();
        assert_eq!(v.as_str(), "SELECT id FROM orders LIMIT 100");

        let again = validate(v.as_str(), Dialect::Mysql).unwrap();
        assert_eq!(again, v);

        let explained = validate("explain select id from orders limit 5", Dialect::Mssql).unwrap();
        assert_eq!(explained.as_str(), "explain select id from orders limit 5");
    }

    #[test]
    fn test_sentinel() {
        assert_eq!(check_sentinel(" 7355608\n"), Err(Rejection::UngroundedQuestion));
        assert!(check_sentinel("SELECT 7355608").is_ok());
    }

    #[test]
    fn test_domain_term_mismatch() {
        let guard = SqlGuard::default();
        let s = schema(&[("orders", "id"), ("orders", "total")]);
        let result = guard.check("list pizza sales", "SELECT * FROM orders", &s, Dialect::Mysql);
        assert!(matches!(result, Err(Rejection::SemanticMismatch { .. })));

        let result = guard.check("披萨销量", "SELECT * FROM orders", &s, Dialect::Mysql);
        assert!(matches!(result, Err(Rejection::SemanticMismatch { .. })));

        let with_pizza = schema(&[("pizza_types", "name")]);
        assert!(guard
            .check("list pizza sales", "SELECT name FROM pizza_types", &with_pizza, Dialect::Mysql)
            .is_ok());
    }

    #[test]
    fn test_temporal_phrase_requires_group_by() {
        let s = schema(&[("orders", "date"), ("orders", "total")]);
        let groups: Vec<Vec<String>> = Vec::new();
        assert!(matches!(
            check_semantics("daily revenue", "SELECT SUM(total) FROM orders", &s, &groups),
            Err(Rejection::SemanticMismatch { .. })
        ));
        assert!(check_semantics(
            "daily revenue",
            "SELECT date, SUM(total) FROM orders GROUP BY date",
            &s,
            &groups
        )
        .is_ok());
        assert!(check_semantics(
            "每月 收入",
            "select date, sum(total) from orders group\n  by date",
            &s,
            &groups
        )
        .is_ok());
        assert!(check_semantics("total revenue", "SELECT SUM(total) FROM orders", &s, &groups).is_ok());
    }

    #[test]
    fn test_pipeline_order() {
        let guard = SqlGuard::default();
        let s = schema(&[("orders", "id")]);
        // Sentinel wins over every later stage.
        assert_eq!(
            guard.check("daily pizza", "7355608", &s, Dialect::Mysql),
            Err(Rejection::UngroundedQuestion)
        );
        // Semantics runs before safety.
        assert!(matches!(
            guard.check("daily totals", "DELETE FROM orders", &s, Dialect::Mysql),
            Err(Rejection::SemanticMismatch { .. })
        ));
        assert_eq!(
            guard
                .check("order ids", "SELECT id FROM orders", &s, Dialect::Mysql)
                .unwrap()
                .as_str(),
            "SELECT id FROM orders LIMIT 100"
        );
    }

    #[test]
    fn test_rejection_kinds() {
        assert_eq!(Rejection::UngroundedQuestion.kind(), ErrorKind::UngroundedQuestion);
        assert_eq!(Rejection::mismatch("x").kind(), ErrorKind::SemanticMismatch);
        assert_eq!(Rejection::unsafe_sql("x").kind(), ErrorKind::UnsafeSql);
    }

    #[test]
    fn test_suggest_missing_terms() {
        let s = schema(&[("orders", "id"), ("orders", "customer_name"), ("orders", "total")]);
        let terms = suggest_missing_terms(
            "Show total revenue by Region and region for 会员等级 and orders in 华东",
            &s,
        );
        assert_eq!(terms, vec!["revenue", "Region", "会员等级", "华东"]);

        let again = suggest_missing_terms(
            "Show total revenue by Region and region for 会员等级 and orders in 华东",
            &s,
        );
        assert_eq!(terms, again);
    }

    #[test]
    fn test_suggest_missing_terms_skips_substrings_of_docs() {
        let s = schema(&[("orders", "customer_name")]);
        // "customer" appears inside the docs text.
        assert!(suggest_missing_terms("customer", &s).is_empty());
        assert!(suggest_missing_terms("x 的", &s).is_empty());
    }
}
