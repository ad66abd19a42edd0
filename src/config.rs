//! 엔진 설정
//!
//! 각 컴포넌트 설정(청킹/검색/프롬프트)은 해당 모듈에 있고,
//! 여기서는 이를 묶어 환경변수(`JOURNAL_*`)로 덮어씁니다.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::knowledge::{ChunkConfig, PromptConfig, RetrievalConfig};

/// 기본 로컬 런타임 주소 (Ollama)
pub const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";

// ============================================================================
// Data Directory
// ============================================================================

/// 데이터 디렉토리 경로 (~/.journal-rag/)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".journal-rag")
}

// ============================================================================
// RuntimeConfig
// ============================================================================

/// 로컬 모델 런타임 설정
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeConfig {
    pub ollama_url: String,
    pub embed_model: String,
    pub chat_model: String,
    /// 임베딩 호출 1건당 타임아웃 (초)
    pub embed_timeout_secs: u64,
    /// 답변 최대 토큰 수
    pub max_answer_tokens: usize,
    /// true면 런타임 없이 해싱 임베딩만 사용
    pub offline: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            embed_model: "nomic-embed-text".to_string(),
            chat_model: "llama3.1:8b".to_string(),
            embed_timeout_secs: 10,
            max_answer_tokens: 512,
            offline: false,
        }
    }
}

impl RuntimeConfig {
    pub fn embed_timeout(&self) -> Duration {
        Duration::from_secs(self.embed_timeout_secs)
    }
}

// ============================================================================
// EngineConfig
// ============================================================================

/// 전체 엔진 설정
#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub chunk: ChunkConfig,
    pub retrieval: RetrievalConfig,
    pub prompt: PromptConfig,
    pub runtime: RuntimeConfig,
    /// 청크 벡터와 함께 엔트리 전체 벡터도 생성 (청크가 안 잡힌 엔트리의 벡터 신호)
    pub whole_entry_vectors: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: get_data_dir(),
            chunk: ChunkConfig::default(),
            retrieval: RetrievalConfig::default(),
            prompt: PromptConfig::default(),
            runtime: RuntimeConfig::default(),
            whole_entry_vectors: false,
        }
    }
}

impl EngineConfig {
    /// 기본값 위에 환경변수를 덮어써서 생성
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// 인덱스 DB 경로
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("journal-index.db")
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("JOURNAL_DATA_DIR").filter(|v| !v.is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup("JOURNAL_OLLAMA_URL").filter(|v| !v.is_empty()) {
            self.runtime.ollama_url = url;
        }
        if let Some(model) = lookup("JOURNAL_EMBED_MODEL").filter(|v| !v.is_empty()) {
            self.runtime.embed_model = model;
        }
        if let Some(model) = lookup("JOURNAL_CHAT_MODEL").filter(|v| !v.is_empty()) {
            self.runtime.chat_model = model;
        }

        parse_into(&lookup, "JOURNAL_EMBED_TIMEOUT_SECS", &mut self.runtime.embed_timeout_secs);
        parse_into(&lookup, "JOURNAL_CHUNK_SIZE", &mut self.chunk.target_characters);
        parse_into(&lookup, "JOURNAL_CHUNK_OVERLAP", &mut self.chunk.overlap_characters);
        parse_into(&lookup, "JOURNAL_TOKEN_BUDGET", &mut self.prompt.token_budget);
        parse_into(&lookup, "JOURNAL_TOP_K", &mut self.retrieval.top_k);
        parse_into(&lookup, "JOURNAL_OFFLINE", &mut self.runtime.offline);
        parse_into(&lookup, "JOURNAL_WHOLE_ENTRY_VECTORS", &mut self.whole_entry_vectors);
    }
}

/// 파싱 실패 시 경고만 남기고 기존 값 유지
fn parse_into<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!("Ignoring invalid value for {}: {:?}", key, raw),
    }
}
