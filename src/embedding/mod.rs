//! 임베딩 모듈 - 텍스트 벡터화 인터페이스
//!
//! 코어(인덱서/검색기)는 [`EmbeddingProvider`] 트레이트만 사용합니다.
//! 실제 모델은 로컬 런타임(Ollama) 또는 오프라인 해싱 임베딩으로 교체할 수 있습니다.
//!
//! ## 사용법
//! ```rust,ignore
//! let embedder = HashingEmbedding::new(384);
//! let embedding = embed_with_timeout(&embedder, "Hello", Duration::from_secs(5)).await?;
//! ```

mod hashing;
mod ollama;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::RuntimeConfig;

pub use hashing::{HashingEmbedding, DEFAULT_HASHING_DIMENSION};
pub use ollama::OllamaEmbedding;

// ============================================================================
// Types
// ============================================================================

/// 임베딩 결과 - 벡터와 이를 만든 모델 ID
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub model_id: String,
}

/// 임베딩 실패 유형
///
/// 코어는 세 경우 모두 "임베딩 불가"로 취급하고 키워드 전용으로 진행합니다.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("embedding call timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
}

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 프로바이더 트레이트
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 단일 텍스트 임베딩
    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError>;

    /// 모델 식별자 - 다른 모델의 벡터끼리는 비교하지 않음
    fn model_id(&self) -> &str;

    /// 프로바이더 이름
    fn name(&self) -> &str;
}

/// 타임아웃이 걸린 임베딩 호출
///
/// 멈춘 호출은 `EmbeddingError::Timeout`으로 변환되며 future는 취소(drop)됩니다.
pub async fn embed_with_timeout(
    provider: &dyn EmbeddingProvider,
    text: &str,
    timeout: Duration,
) -> Result<Embedding, EmbeddingError> {
    match tokio::time::timeout(timeout, provider.embed(text)).await {
        Ok(result) => result,
        Err(_) => Err(EmbeddingError::Timeout(timeout)),
    }
}

// ============================================================================
// Factory Function
// ============================================================================

/// 설정에 따라 임베딩 프로바이더 생성
///
/// offline 모드면 해싱 임베딩, 아니면 로컬 Ollama 런타임을 사용합니다.
pub fn create_embedder(runtime: &RuntimeConfig) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    if runtime.offline {
        tracing::info!(
            "Using offline hashing embedding (dimension: {})",
            DEFAULT_HASHING_DIMENSION
        );
        return Ok(Arc::new(HashingEmbedding::new(DEFAULT_HASHING_DIMENSION)));
    }

    let embedder = OllamaEmbedding::new(&runtime.ollama_url, &runtime.embed_model)?;
    tracing::info!("Using local embedding runtime: {}", embedder.model_id());
    Ok(Arc::new(embedder))
}

// ============================================================================
// Tests
// ============================================================================
