//! journal-rag - 온디바이스 저널 RAG 엔진
//!
//! 저널 엔트리를 청크로 나눠 키워드(SQLite FTS5) + 벡터 인덱스로 유지하고,
//! 질문을 인용이 달린 프롬프트로 바꿔 로컬 모델에 전달합니다.

pub mod cli;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod inference;
pub mod journal;
pub mod knowledge;

// Re-exports
pub use config::{get_data_dir, EngineConfig, RuntimeConfig};
pub use embedding::{
    create_embedder, embed_with_timeout, Embedding, EmbeddingError, EmbeddingProvider,
    HashingEmbedding, OllamaEmbedding,
};
pub use engine::{AskResponse, CitedEntry, EngineError, JournalAssistant};
pub use inference::{create_inference, InferenceError, InferenceProvider, OllamaInference};
pub use journal::{Entry, EntryEvent};
pub use knowledge::{
    ChunkConfig, Chunker, ConversationLog, ConversationTurn, HybridRetriever, IndexReport,
    IndexStore, Indexer, Prompt, PromptBuilder, PromptConfig, RetrievalConfig, Retrieval,
    RetrievedDoc, Role, WindowChunker,
};
