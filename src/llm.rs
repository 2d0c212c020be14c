//! Generation client
//!
//! Builds the text-to-SQL prompt, calls an OpenAI-compatible chat completion
//! service, and pulls a single statement out of the reply.

use crate::dialect::Dialect;
use crate::error::{Result, Text2SqlError};
use crate::guard::UNGROUNDED_SENTINEL;
use crate::schema::SchemaSnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

pub const SCHEMA_EXCERPT_CHARS: usize = 4000;
pub const CONTEXT_EXCERPT_CHARS: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Upstream chat completion capability.
///
/// Implementations return `Text2SqlError::ModelUnavailable` when the service
/// reports that the requested model does not exist.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, model: &str, messages: &[ChatMessage]) -> Result<String>;
}

/// Chat completions over an OpenAI-compatible HTTP API.
pub struct OpenAiCompatibleClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiCompatibleClient {
    pub fn new(api_key: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

/// Whether an upstream error message means "no such model".
pub fn is_model_unavailable(message: &str) -> bool {
    message.contains("Model does not exist") || message.contains("20012")
}

fn upstream_error(message: String) -> Text2SqlError {
    if is_model_unavailable(&message) {
        Text2SqlError::ModelUnavailable(message)
    } else {
        Text2SqlError::Generation(message)
    }
}

#[async_trait]
impl CompletionService for OpenAiCompatibleClient {
    async fn complete(&self, model: &str, messages: &[ChatMessage]) -> Result<String> {
        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": 0,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Text2SqlError::Generation(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(upstream_error(format!(
                "LLM API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response.json().await.map_err(|e| {
            Text2SqlError::Generation(format!("Failed to parse LLM response: {}", e))
        })?;

        if let Some(error) = response_json.get("error") {
            return Err(upstream_error(format!("LLM API error: {}", error)));
        }

        // A null content is treated as an empty reply.
        Ok(response_json
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string())
    }
}

/// Strips code fences, cuts at the first `;`, trims.
pub fn extract_sql(text: &str) -> String {
    let mut t = text.trim().to_string();
    if t.contains("```") {
        t = t.replace("```sql", "").replace("```", "").trim().to_string();
    }
    if let Some(semi) = t.find(';') {
        t.truncate(semi);
    }
    t.trim().to_string()
}

fn char_prefix(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// System + user messages for one question.
pub fn build_messages(
    question: &str,
    schema: &SchemaSnapshot,
    dialect: Dialect,
    limit: usize,
    context_docs: &[String],
) -> Vec<ChatMessage> {
    let schema_docs = schema.docs_text();
    let schema_excerpt = char_prefix(&schema_docs, SCHEMA_EXCERPT_CHARS);
    let context = context_docs.join("\n");
    let context_excerpt = char_prefix(&context, CONTEXT_EXCERPT_CHARS);

    let system = format!(
        "You are an assistant that only returns SQL. Target dialect: {dialect}. \
         Return exactly one valid SELECT statement with no explanation and no code block. \
         Use only the tables and columns provided. Return at most {limit} rows. \
         If the question cannot be answered from the provided tables and columns, \
         return exactly {sentinel}.",
        dialect = dialect,
        limit = limit,
        sentinel = UNGROUNDED_SENTINEL,
    );
    let user = format!(
        "Question: {}\nSchema:\n{}\nContext:\n{}\nOutput: one {} SELECT query.",
        question, schema_excerpt, context_excerpt, dialect
    );

    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

/// Turns a question into candidate SQL. The model can be swapped at runtime.
pub struct SqlGenerator {
    service: Arc<dyn CompletionService>,
    model: RwLock<String>,
}

impl SqlGenerator {
    pub fn new(service: Arc<dyn CompletionService>, model: impl Into<String>) -> Self {
        Self {
            service,
            model: RwLock::new(model.into()),
        }
    }

    pub fn model(&self) -> String {
        match self.model.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Hot-swaps the model used for subsequent calls.
    pub fn reconfigure_model(&self, model_name: &str) {
        let model_name = model_name.trim();
        if model_name.is_empty() {
            return;
        }
        let mut guard = match self.model.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        info!("Switching model from '{}' to '{}'", guard, model_name);
        *guard = model_name.to_string();
    }

    pub async fn generate(
        &self,
        question: &str,
        schema: &SchemaSnapshot,
        dialect: Dialect,
        limit: usize,
        context_docs: &[String],
    ) -> Result<String> {
        let messages = build_messages(question, schema, dialect, limit, context_docs);
        let model = self.model();
        debug!("Requesting SQL from model '{}'", model);

        let text = self.service.complete(&model, &messages).await?;
        let sql = extract_sql(&text);
        info!("Model '{}' returned {} chars of SQL", model, sql.len());
        Ok(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingService {
        reply: String,
        seen: Mutex<Vec<(String, Vec<ChatMessage>)>>,
    }

    #[async_trait]
    impl CompletionService for RecordingService {
        async fn complete(&self, model: &str, messages: &[ChatMessage]) -> Result<String> {
            self.seen
                .lock()
                .unwrap()
                .push((model.to_string(), messages.to_vec()));
            Ok(self.reply.clone())
        }
    }

    #[test]
    fn test_extract_sql_strips_fences_and_tail() {
        assert_eq!(
            extract_sql("```sql\nSELECT id FROM orders;\n```"),
            "SELECT id FROM orders"
        );
        assert_eq!(
            extract_sql("  SELECT 1; DROP TABLE x;  "),
            "SELECT 1"
        );
        assert_eq!(extract_sql("SELECT a FROM t"), "SELECT a FROM t");
        assert_eq!(extract_sql(" 7355608 "), "7355608");
    }

    #[test]
    fn test_build_messages_bounds_excerpts() {
        let long_table = "x".repeat(5000);
        let schema = SchemaSnapshot::from_columns(vec![(long_table, "id".to_string())]);
        let context = vec!["披".repeat(3000)];
        let messages = build_messages("how many rows", &schema, Dialect::Mssql, 50, &context);

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert!(messages[0].content.contains("mssql"));
        assert!(messages[0].content.contains(UNGROUNDED_SENTINEL));
        let user = &messages[1].content;
        assert!(user.starts_with("Question: how many rows\n"));
        assert!(!user.contains(&"x".repeat(4001)));
        assert!(user.contains(&"x".repeat(3990)));
        assert_eq!(user.matches('披').count(), CONTEXT_EXCERPT_CHARS);
    }

    #[test]
    fn test_model_unavailable_detection() {
        assert!(matches!(
            upstream_error("Model does not exist. Please check it".to_string()),
            Text2SqlError::ModelUnavailable(_)
        ));
        assert!(matches!(
            upstream_error("{\"code\":20012}".to_string()),
            Text2SqlError::ModelUnavailable(_)
        ));
        assert!(matches!(
            upstream_error("rate limited".to_string()),
            Text2SqlError::Generation(_)
        ));
    }

    #[tokio::test]
    async fn test_generate_uses_hot_swapped_model() {
        let service = Arc::new(RecordingService {
            reply: "```sql\nSELECT * FROM orders;\n```".to_string(),
            seen: Mutex::new(Vec::new()),
        });
        let generator = SqlGenerator::new(service.clone(), "model-a");
        let schema = SchemaSnapshot::from_columns(vec![("orders".to_string(), "id".to_string())]);

        let sql = generator
            .generate("all orders", &schema, Dialect::Mysql, 10, &[])
            .await
            .unwrap();
        assert_eq!(sql, "SELECT * FROM orders");

        generator.reconfigure_model("model-b");
        generator.reconfigure_model("  ");
        generator
            .generate("all orders", &schema, Dialect::Mysql, 10, &[])
            .await
            .unwrap();

        let seen = service.seen.lock().unwrap();
        assert_eq!(seen[0].0, "model-a");
        assert_eq!(seen[1].0, "model-b");
    }
}
