//! Grounding retrieval: embedding backends, the context index, and
//! knowledge-file ingestion.

pub mod embedder;
pub mod knowledge;
pub mod retriever;

pub use embedder::{cosine_similarity, Embedder, Embedding, OpenAiEmbedder};
pub use knowledge::{extract_text, load_docs_from_dir};
pub use retriever::{lexical_rank, ContextIndex, IndexSnapshot, RetrievalMode};
