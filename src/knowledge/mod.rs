//! Knowledge 모듈 - 저널 검색 증강(RAG) 컨텍스트 엔진
//!
//! - Chunker: 엔트리 본문을 겹치는 구간으로 분할
//! - Store: SQLite (엔트리/청크 + FTS5 키워드 + 벡터 BLOB)
//! - Indexer: CRUD 이벤트를 받아 인덱스를 원자적으로 교체
//! - Hybrid: 키워드/벡터/최신성 가중합 검색
//! - Prompt: 토큰 예산 안에서 인용 포함 프롬프트 구성
//! - Conversation: 대화 턴 기록

mod chunker;
mod conversation;
mod hybrid;
mod indexer;
mod prompt;
mod store;
mod vector;

// Re-exports
pub use chunker::{
    default_chunker, window_chunker, ChunkConfig, Chunker, TextChunk, WindowChunker,
};
pub use conversation::{ConversationLog, ConversationSummary, ConversationTurn, Role};
pub use hybrid::{
    build_fts_query, extract_terms, recency_boost, HybridRetriever, RetrievalConfig, Retrieval,
    RetrievedDoc, SubScores,
};
pub use indexer::{content_fingerprint, IndexOutcome, IndexReport, Indexer, SyncReport};
pub use prompt::{Citation, Prompt, PromptBuilder, PromptConfig};
pub use store::{
    ChunkKeywordHit, ChunkRecord, ChunkView, EmbeddingKind, EmbeddingRecord, EntryIndexState,
    EntryKeywordHit, IndexSet, IndexStore, StoreStats,
};
pub use vector::{
    blob_to_vec, cosine_similarity, rank_by_similarity, vec_to_blob, VectorCandidate, VectorHit,
};
