//! Ollama 로컬 임베딩 프로바이더
//!
//! ref: https://github.com/ollama/ollama/blob/main/docs/api.md#generate-embeddings

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Embedding, EmbeddingError, EmbeddingProvider};

/// 5xx/네트워크 오류 시 최대 재시도 횟수
const MAX_RETRIES: u32 = 2;
/// 재시도 초기 백오프 (ms)
const INITIAL_BACKOFF_MS: u64 = 500;

/// Ollama 임베딩 구현체
#[derive(Debug, Clone)]
pub struct OllamaEmbedding {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    model_id: String,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct OllamaError {
    error: String,
}

impl OllamaEmbedding {
    /// 새 인스턴스 생성
    ///
    /// # Arguments
    /// * `base_url` - 런타임 주소 (예: http://127.0.0.1:11434)
    /// * `model` - 임베딩 모델 이름 (예: nomic-embed-text)
    pub fn new(base_url: &str, model: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/api/embeddings", base_url.trim_end_matches('/')),
            model: model.to_string(),
            model_id: format!("ollama/{}", model),
        })
    }

    fn backoff(attempt: u32) -> Duration {
        Duration::from_millis(INITIAL_BACKOFF_MS * 2u64.pow(attempt))
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedding {
    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        let request = EmbedRequest {
            model: &self.model,
            prompt: text,
        };

        let mut last_error = EmbeddingError::ProviderUnavailable("no attempt made".into());

        for attempt in 0..=MAX_RETRIES {
            let response = match self.client.post(&self.endpoint).json(&request).send().await {
                Ok(resp) => resp,
                Err(e) if e.is_connect() => {
                    // 런타임이 떠 있지 않음 - 재시도해도 의미 없음
                    return Err(EmbeddingError::ProviderUnavailable(format!(
                        "cannot reach {}: {}",
                        self.endpoint, e
                    )));
                }
                Err(e) => {
                    last_error = EmbeddingError::ProviderUnavailable(e.to_string());
                    if attempt < MAX_RETRIES {
                        let backoff = Self::backoff(attempt);
                        tracing::warn!(
                            "Embedding request failed, retrying in {:?} (attempt {}/{})",
                            backoff,
                            attempt + 1,
                            MAX_RETRIES
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    continue;
                }
            };

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;

            if status.is_success() {
                let parsed: EmbedResponse = serde_json::from_str(&body)
                    .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
                if parsed.embedding.is_empty() {
                    return Err(EmbeddingError::InvalidResponse(
                        "empty embedding vector".into(),
                    ));
                }
                return Ok(Embedding {
                    vector: parsed.embedding,
                    model_id: self.model_id.clone(),
                });
            }

            let message = serde_json::from_str::<OllamaError>(&body)
                .map(|e| e.error)
                .unwrap_or(body);

            if status.is_server_error() {
                // 모델 로딩 중일 수 있음
                last_error = EmbeddingError::ProviderUnavailable(format!("{}: {}", status, message));
                if attempt < MAX_RETRIES {
                    let backoff = Self::backoff(attempt);
                    tracing::warn!("Embedding runtime returned {}, backing off {:?}", status, backoff);
                    tokio::time::sleep(backoff).await;
                }
                continue;
            }

            // 4xx (모델 미설치 등) - 즉시 실패
            return Err(EmbeddingError::ProviderUnavailable(format!(
                "{}: {}",
                status, message
            )));
        }

        Err(last_error)
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_and_model_id() {
        let embedder = OllamaEmbedding::new("http://localhost:11434/", "nomic-embed-text").unwrap();
        assert_eq!(embedder.endpoint, "http://localhost:11434/api/embeddings");
        assert_eq!(embedder.model_id(), "ollama/nomic-embed-text");
    }

    #[test]
    fn test_backoff_grows() {
        assert!(OllamaEmbedding::backoff(1) > OllamaEmbedding::backoff(0));
    }

    #[tokio::test]
    async fn test_unreachable_runtime_is_unavailable() {
        // 127.0.0.1:9 (discard) 는 보통 닫혀 있음
        let embedder = OllamaEmbedding::new("http://127.0.0.1:9", "any").unwrap();
        let result = embedder.embed("hello").await;
        assert!(matches!(
            result,
            Err(EmbeddingError::ProviderUnavailable(_))
        ));
    }
}
