//! Ollama 로컬 생성 프로바이더
//!
//! ref: https://github.com/ollama/ollama/blob/main/docs/api.md#generate-a-completion

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{InferenceError, InferenceProvider};

#[derive(Debug, Clone)]
pub struct OllamaInference {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    num_predict: usize,
}

/// 비스트리밍 응답과 NDJSON 스트림의 각 줄이 같은 모양
#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

impl OllamaInference {
    pub fn new(base_url: &str, model: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(300))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/api/generate", base_url.trim_end_matches('/')),
            model: model.to_string(),
        })
    }

    async fn send(&self, prompt: &str, max_tokens: usize, stream: bool) -> Result<reqwest::Response, InferenceError> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream,
            options: GenerateOptions {
                num_predict: max_tokens,
            },
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| InferenceError::Unavailable(format!("cannot reach {}: {}", self.endpoint, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Unavailable(format!("{}: {}", status, body)));
        }
        Ok(response)
    }
}

/// NDJSON 한 줄 파싱
fn parse_line(line: &str) -> Result<Option<GenerateChunk>, InferenceError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let chunk: GenerateChunk =
        serde_json::from_str(line).map_err(|e| InferenceError::InvalidResponse(e.to_string()))?;
    if let Some(error) = chunk.error {
        return Err(InferenceError::Unavailable(error));
    }
    Ok(Some(chunk))
}

#[async_trait]
impl InferenceProvider for OllamaInference {
    async fn generate(&self, prompt: &str, max_tokens: usize) -> Result<String, InferenceError> {
        let response = self.send(prompt, max_tokens, false).await?;
        let body = response
            .text()
            .await
            .map_err(|e| InferenceError::InvalidResponse(e.to_string()))?;

        match parse_line(&body)? {
            Some(chunk) => Ok(chunk.response.trim().to_string()),
            None => Err(InferenceError::InvalidResponse("empty body".into())),
        }
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        max_tokens: usize,
        tokens: mpsc::Sender<String>,
    ) -> Result<String, InferenceError> {
        let mut response = self.send(prompt, max_tokens, true).await?;

        let mut buffer: Vec<u8> = Vec::new();
        let mut full = String::new();

        loop {
            let bytes = response
                .chunk()
                .await
                .map_err(|e| InferenceError::Unavailable(format!("stream interrupted: {}", e)))?;
            let Some(bytes) = bytes else {
                break;
            };
            buffer.extend_from_slice(&bytes);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let Some(chunk) = parse_line(&line)? else {
                    continue;
                };
                if !chunk.response.is_empty() {
                    full.push_str(&chunk.response);
                    if tokens.send(chunk.response).await.is_err() {
                        // 수신측이 닫힘 - 응답을 drop해서 연결 종료
                        return Err(InferenceError::Cancelled);
                    }
                }
                if chunk.done {
                    return Ok(full);
                }
            }
        }

        // 마지막 줄에 개행이 없는 경우
        if let Some(chunk) = parse_line(&String::from_utf8_lossy(&buffer))? {
            if !chunk.response.is_empty() {
                full.push_str(&chunk.response);
                if tokens.send(chunk.response).await.is_err() {
                    return Err(InferenceError::Cancelled);
                }
            }
        }
        Ok(full)
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint() {
        let provider = OllamaInference::new("http://localhost:11434/", "llama3.1:8b").unwrap();
        assert_eq!(provider.endpoint, "http://localhost:11434/api/generate");
    }

    #[test]
    fn test_parse_line() {
        let chunk = parse_line(r#"{"response":"Hel","done":false}"#).unwrap().unwrap();
        assert_eq!(chunk.response, "Hel");
        assert!(!chunk.done);

        assert!(parse_line("   ").unwrap().is_none());
        assert!(matches!(
            parse_line(r#"{"error":"model not found"}"#),
            Err(InferenceError::Unavailable(_))
        ));
        assert!(matches!(
            parse_line("not json"),
            Err(InferenceError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_request_shape() {
        let request = GenerateRequest {
            model: "m",
            prompt: "p",
            stream: true,
            options: GenerateOptions { num_predict: 512 },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["options"]["num_predict"], 512);
        assert_eq!(json["stream"], true);
    }

    #[tokio::test]
    async fn test_unreachable_runtime() {
        let provider = OllamaInference::new("http://127.0.0.1:9", "any").unwrap();
        assert!(matches!(
            provider.generate("hello", 8).await,
            Err(InferenceError::Unavailable(_))
        ));
    }
}
