//! 추론 모듈 - 로컬 언어 모델 인터페이스
//!
//! 엔진은 [`InferenceProvider`]만 사용합니다. 프롬프트를 넣으면 전체 텍스트나
//! 토큰 스트림이 나오는 블랙박스로 취급합니다.

mod ollama;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::RuntimeConfig;

pub use ollama::OllamaInference;

/// 추론 실패 유형
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("inference runtime unavailable: {0}")]
    Unavailable(String),

    /// 토큰 수신측이 닫혀 생성을 중단함
    #[error("generation cancelled")]
    Cancelled,

    #[error("invalid inference response: {0}")]
    InvalidResponse(String),
}

/// 추론 프로바이더 트레이트
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// 전체 응답 생성
    async fn generate(&self, prompt: &str, max_tokens: usize) -> Result<String, InferenceError>;

    /// 토큰 스트리밍 생성
    ///
    /// 토큰을 `tokens`로 보내고 끝나면 전체 텍스트를 반환합니다.
    /// 수신측이 drop되면 생성을 멈추고 `InferenceError::Cancelled`를 반환합니다.
    async fn generate_stream(
        &self,
        prompt: &str,
        max_tokens: usize,
        tokens: mpsc::Sender<String>,
    ) -> Result<String, InferenceError>;

    fn name(&self) -> &str;
}

/// 런타임 없이 동작할 때 쓰는 프로바이더 - 항상 Unavailable
///
/// 엔진은 이 경우 검색 결과 목록으로 대체 답변을 만듭니다.
#[derive(Debug, Clone, Default)]
pub struct OfflineInference;

#[async_trait]
impl InferenceProvider for OfflineInference {
    async fn generate(&self, _prompt: &str, _max_tokens: usize) -> Result<String, InferenceError> {
        Err(InferenceError::Unavailable("offline mode".into()))
    }

    async fn generate_stream(
        &self,
        _prompt: &str,
        _max_tokens: usize,
        _tokens: mpsc::Sender<String>,
    ) -> Result<String, InferenceError> {
        Err(InferenceError::Unavailable("offline mode".into()))
    }

    fn name(&self) -> &str {
        "offline"
    }
}

/// 설정에 따라 추론 프로바이더 생성
pub fn create_inference(runtime: &RuntimeConfig) -> anyhow::Result<Arc<dyn InferenceProvider>> {
    if runtime.offline {
        tracing::info!("Offline mode: answers fall back to retrieved entry lists");
        return Ok(Arc::new(OfflineInference));
    }
    let provider = OllamaInference::new(&runtime.ollama_url, &runtime.chat_model)?;
    tracing::info!("Using local chat runtime: {}", runtime.chat_model);
    Ok(Arc::new(provider))
}
