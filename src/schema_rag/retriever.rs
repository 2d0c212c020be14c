//! Context Index
//!
//! Holds an immutable snapshot of grounding documents and answers top-K
//! relevance queries, by embedding similarity when a backend is configured
//! and by lexical token counting otherwise.

use crate::schema_rag::embedder::{cosine_similarity, Embedder, Embedding};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Documents plus their embeddings, if similarity mode is active.
#[derive(Debug, Default)]
pub struct IndexSnapshot {
    documents: Vec<String>,
    embeddings: Option<Vec<Embedding>>,
}

impl IndexSnapshot {
    pub fn documents(&self) -> &[String] {
        &self.documents
    }

    pub fn has_similarity(&self) -> bool {
        self.embeddings.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalMode {
    Similarity,
    Lexical,
}

pub struct ContextIndex {
    snapshot: Arc<IndexSnapshot>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl Default for ContextIndex {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ContextIndex {
    pub fn new(embedder: Option<Arc<dyn Embedder>>) -> Self {
        Self {
            snapshot: Arc::new(IndexSnapshot::default()),
            embedder,
        }
    }

    /// Replaces the whole index. Embedding failures degrade to lexical mode.
    pub async fn build(&mut self, documents: Vec<String>) {
        let embeddings = match self.embedder {
            Some(ref embedder) if !documents.is_empty() => match embedder.embed(&documents).await {
                Ok(vectors) => Some(vectors),
                Err(e) => {
                    warn!("Embedding build failed, using lexical retrieval: {}", e);
                    None
                }
            },
            _ => None,
        };

        let snapshot = IndexSnapshot {
            documents,
            embeddings,
        };
        info!(
            "Built context index with {} documents ({:?} mode)",
            snapshot.documents.len(),
            if snapshot.has_similarity() {
                RetrievalMode::Similarity
            } else {
                RetrievalMode::Lexical
            }
        );
        self.snapshot = Arc::new(snapshot);
    }

    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        Arc::clone(&self.snapshot)
    }

    pub fn len(&self) -> usize {
        self.snapshot.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.documents.is_empty()
    }

    pub fn mode(&self) -> RetrievalMode {
        if self.snapshot.has_similarity() {
            RetrievalMode::Similarity
        } else {
            RetrievalMode::Lexical
        }
    }

    /// At most `top_k` documents, most relevant first.
    pub async fn query(&self, question: &str, top_k: usize) -> Vec<String> {
        let snapshot = self.snapshot();
        if top_k == 0 || snapshot.documents.is_empty() {
            return Vec::new();
        }

        if let (Some(embedder), Some(embeddings)) = (&self.embedder, &snapshot.embeddings) {
            match embedder.embed_one(question).await {
                Ok(query_vec) => {
                    return similarity_rank(&snapshot.documents, embeddings, &query_vec, top_k);
                }
                Err(e) => debug!("Query embedding failed, falling back to lexical: {}", e),
            }
        }

        lexical_rank(&snapshot.documents, question, top_k)
    }
}

pub fn similarity_rank(
    documents: &[String],
    embeddings: &[Embedding],
    query: &[f32],
    top_k: usize,
) -> Vec<String> {
    let mut scored: Vec<(usize, f32)> = embeddings
        .iter()
        .enumerate()
        .map(|(idx, e)| (idx, cosine_similarity(e, query)))
        .collect();
    // Stable sort keeps original order among equal scores.
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    scored
        .into_iter()
        .take(top_k)
        .filter_map(|(idx, _)| documents.get(idx).cloned())
        .collect()
}

/// Counts whitespace-separated question tokens found in each document
/// (case-insensitive substring); drops zero scores.
pub fn lexical_rank(documents: &[String], question: &str, top_k: usize) -> Vec<String> {
    let question = question.to_lowercase();
    let tokens: Vec<&str> = question.split_whitespace().collect();

    let mut scored: Vec<(usize, &String)> = documents
        .iter()
        .map(|doc| {
            let lowered = doc.to_lowercase();
            let score = tokens.iter().filter(|tok| lowered.contains(**tok)).count();
            (score, doc)
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));

    scored
        .into_iter()
        .take(top_k)
        .filter(|(score, _)| *score > 0)
        .map(|(_, doc)| doc.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, Text2SqlError};
    use async_trait::async_trait;

    /// Embeds by counting a fixed vocabulary; fails on demand.
    struct VocabEmbedder {
        vocab: Vec<&'static str>,
        fail_queries: bool,
    }

    #[async_trait]
    impl Embedder for VocabEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
            if self.fail_queries && texts.len() == 1 {
                return Err(Text2SqlError::Generation("offline".to_string()));
            }
            Ok(texts
                .iter()
                .map(|t| {
                    let t = t.to_lowercase();
                    self.vocab
                        .iter()
                        .map(|w| t.matches(w).count() as f32)
                        .collect()
                })
                .collect())
        }
    }

    fn docs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_lexical_match_and_miss() {
        let documents = docs(&["table orders: id, total"]);
        assert_eq!(
            lexical_rank(&documents, "orders total", 5),
            vec!["table orders: id, total".to_string()]
        );
        assert!(lexical_rank(&documents, "nonexistent", 5).is_empty());
    }

    #[test]
    fn test_lexical_orders_by_score_then_position() {
        let documents = docs(&[
            "table customers: id, name",
            "table orders: id, customer_id, total",
            "table payments: id, order_id, total",
        ]);
        let ranked = lexical_rank(&documents, "ORDERS Total", 5);
        assert_eq!(
            ranked,
            docs(&[
                "table orders: id, customer_id, total",
                "table payments: id, order_id, total",
            ])
        );
        assert_eq!(lexical_rank(&documents, "id", 2).len(), 2);
        assert_eq!(lexical_rank(&documents, "id", 2)[0], documents[0]);
    }

    #[tokio::test]
    async fn test_index_without_backend_uses_lexical() {
        let mut index = ContextIndex::new(None);
        index.build(docs(&["table orders: id, total"])).await;
        assert_eq!(index.mode(), RetrievalMode::Lexical);
        assert_eq!(index.query("orders total", 5).await.len(), 1);
        assert!(index.query("nonexistent", 5).await.is_empty());
    }

    #[tokio::test]
    async fn test_similarity_mode_ranks_by_score() {
        let embedder = Arc::new(VocabEmbedder {
            vocab: vec!["pizza", "order", "customer"],
            fail_queries: false,
        });
        let mut index = ContextIndex::new(Some(embedder));
        index
            .build(docs(&[
                "table customer: id, name",
                "table pizza: id, name, price",
                "table order_items: order_id, pizza_id",
            ]))
            .await;
        assert_eq!(index.mode(), RetrievalMode::Similarity);

        let result = index.query("which pizza sells best", 1).await;
        assert_eq!(result, docs(&["table pizza: id, name, price"]));
    }

    #[tokio::test]
    async fn test_similarity_ties_keep_document_order() {
        let embedder = Arc::new(VocabEmbedder {
            vocab: vec!["pizza"],
            fail_queries: false,
        });
        let mut index = ContextIndex::new(Some(embedder));
        index
            .build(docs(&["table a: pizza", "table b: pizza", "table c: salad"]))
            .await;
        assert_eq!(
            index.query("pizza", 2).await,
            docs(&["table a: pizza", "table b: pizza"])
        );

        index
            .build(docs(&["table b: pizza", "table a: pizza"]))
            .await;
        assert_eq!(
            index.query("pizza", 5).await,
            docs(&["table b: pizza", "table a: pizza"])
        );
    }

    #[tokio::test]
    async fn test_query_embedding_failure_falls_back() {
        let embedder = Arc::new(VocabEmbedder {
            vocab: vec!["orders"],
            fail_queries: true,
        });
        let mut index = ContextIndex::new(Some(embedder));
        index.build(docs(&["table orders: id", "table users: id"])).await;

        let result = index.query("orders", 5).await;
        assert_eq!(result, docs(&["table orders: id"]));
    }

    #[tokio::test]
    async fn test_rebuild_replaces_snapshot() {
        let mut index = ContextIndex::new(None);
        index.build(docs(&["table a: x"])).await;
        let before = index.snapshot();
        index.build(docs(&["table b: y", "table c: z"])).await;

        assert_eq!(before.documents(), docs(&["table a: x"]).as_slice());
        assert_eq!(index.len(), 2);
    }
}
