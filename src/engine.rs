//! JournalAssistant - 질문 → 검색 → 프롬프트 → 로컬 모델 → 대화 기록
//!
//! 질의 API의 진입점입니다. 입력 오류(빈 질문, 모르는 사용자)는 에러로,
//! 임베딩/추론 실패는 `degraded` 표시로만 드러납니다.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::embedding::{create_embedder, EmbeddingProvider};
use crate::inference::{create_inference, InferenceError, InferenceProvider};
use crate::journal::{Entry, EntryEvent};
use crate::knowledge::{
    Citation, ConversationLog, ConversationSummary, ConversationTurn, HybridRetriever, Indexer,
    IndexStore, Prompt, PromptBuilder, Retrieval, SyncReport, WindowChunker,
};

// ============================================================================
// Errors & Types
// ============================================================================

/// 질의 API 에러
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("question is empty")]
    EmptyQuery,

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("entry not found: {0}")]
    EntryNotFound(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// 답변에 인용된 엔트리
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CitedEntry {
    pub entry_id: String,
    pub title: String,
    /// YYYY-MM-DD
    pub date: String,
}

impl From<Citation> for CitedEntry {
    fn from(c: Citation) -> Self {
        Self {
            entry_id: c.entry_id,
            title: c.title,
            date: c.date,
        }
    }
}

/// 질문 응답
#[derive(Debug, Clone, Serialize)]
pub struct AskResponse {
    pub answer: String,
    pub cited_entries: Vec<CitedEntry>,
    /// 키워드 전용 검색이었거나 모델 없이 대체 답변을 만들었음
    pub degraded: bool,
    pub conversation_id: String,
    /// 스트리밍 도중 수신측이 닫혀 중단됨
    pub cancelled: bool,
}

/// 검색/프롬프트 준비 결과
struct Prepared {
    conversation_id: String,
    retrieval: Retrieval,
    prompt: Prompt,
}

// ============================================================================
// JournalAssistant
// ============================================================================

pub struct JournalAssistant {
    config: EngineConfig,
    store: IndexStore,
    indexer: Indexer,
    retriever: HybridRetriever,
    prompts: PromptBuilder,
    conversations: ConversationLog,
    inference: Arc<dyn InferenceProvider>,
}

impl JournalAssistant {
    /// 설정대로 저장소와 프로바이더를 열어서 생성
    pub fn open(config: EngineConfig) -> anyhow::Result<Self> {
        let store = open_store(&config.data_dir, &config.db_path())?;
        let embedder = create_embedder(&config.runtime)?;
        let inference = create_inference(&config.runtime)?;
        Self::with_providers(config, store, embedder, inference)
    }

    /// 프로바이더를 직접 지정해서 생성
    pub fn with_providers(
        config: EngineConfig,
        store: IndexStore,
        embedder: Arc<dyn EmbeddingProvider>,
        inference: Arc<dyn InferenceProvider>,
    ) -> anyhow::Result<Self> {
        let timeout = config.runtime.embed_timeout();
        let indexer = Indexer::new(
            store.clone(),
            Arc::new(WindowChunker::new(config.chunk.clone())),
            embedder.clone(),
            timeout,
        )
        .with_whole_entry_vectors(config.whole_entry_vectors);
        let retriever = HybridRetriever::new(store.clone(), embedder, config.retrieval.clone(), timeout);
        let prompts = PromptBuilder::new(config.prompt.clone());
        let conversations = ConversationLog::attach(&store)?;

        Ok(Self {
            config,
            store,
            indexer,
            retriever,
            prompts,
            conversations,
            inference,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    pub fn indexer(&self) -> &Indexer {
        &self.indexer
    }

    pub fn conversations(&self) -> &ConversationLog {
        &self.conversations
    }

    /// 엔트리 CRUD 이벤트 구독 시작
    pub fn spawn_indexer(&self, events: mpsc::Receiver<EntryEvent>) -> JoinHandle<()> {
        self.indexer.spawn_listener(events)
    }

    /// 임베딩 모델 변경 확인 (시작 시 호출)
    pub async fn sync_model(&self) -> anyhow::Result<SyncReport> {
        self.indexer.sync_model().await
    }

    pub fn get_entry(&self, entry_id: &str) -> Result<Entry, EngineError> {
        self.store
            .get_entry(entry_id)?
            .ok_or_else(|| EngineError::EntryNotFound(entry_id.to_string()))
    }

    fn ensure_user(&self, user_id: &str) -> Result<(), EngineError> {
        if self.store.user_exists(user_id)? {
            Ok(())
        } else {
            Err(EngineError::UnknownUser(user_id.to_string()))
        }
    }

    /// 검색만 수행
    pub async fn search(&self, user_id: &str, query: &str, k: usize) -> Result<Retrieval, EngineError> {
        if query.trim().is_empty() {
            return Err(EngineError::EmptyQuery);
        }
        self.ensure_user(user_id)?;
        Ok(self.retriever.retrieve(user_id, query, k).await?)
    }

    /// 대화 기록 (오래된 것부터)
    pub fn history(&self, conversation_id: &str, n: usize) -> Result<Vec<ConversationTurn>, EngineError> {
        Ok(self.conversations.recent(conversation_id, n)?)
    }

    pub fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationSummary>, EngineError> {
        Ok(self.conversations.list_conversations(user_id)?)
    }

    async fn prepare(
        &self,
        user_id: &str,
        question: &str,
        conversation_id: Option<&str>,
    ) -> Result<Prepared, EngineError> {
        if question.trim().is_empty() {
            return Err(EngineError::EmptyQuery);
        }
        self.ensure_user(user_id)?;

        let conversation_id = conversation_id
            .filter(|id| !id.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let history = self
            .conversations
            .recent(&conversation_id, self.config.prompt.history_turns)?;
        let retrieval = self
            .retriever
            .retrieve(user_id, question, self.config.retrieval.top_k)
            .await?;
        let prompt = self
            .prompts
            .build(question, &retrieval.docs, retrieval.degraded, &history);

        tracing::debug!(
            "Prompt for conversation {}: {} docs, ~{} tokens, truncated={}",
            conversation_id,
            prompt.citations.len(),
            prompt.estimated_tokens,
            prompt.truncated
        );

        self.conversations
            .append(&ConversationTurn::user(&conversation_id, user_id, question))?;

        Ok(Prepared {
            conversation_id,
            retrieval,
            prompt,
        })
    }

    fn finish(
        &self,
        user_id: &str,
        prepared: Prepared,
        answer: String,
        degraded: bool,
        cancelled: bool,
    ) -> Result<AskResponse, EngineError> {
        let cited_ids = prepared.prompt.cited_entry_ids();
        self.conversations.append(&ConversationTurn::assistant(
            &prepared.conversation_id,
            user_id,
            answer.clone(),
            cited_ids,
        ))?;

        tracing::info!(
            "Answered in conversation {} (citations={}, degraded={}, cancelled={})",
            prepared.conversation_id,
            prepared.prompt.citations.len(),
            degraded,
            cancelled
        );

        Ok(AskResponse {
            answer,
            cited_entries: prepared.prompt.citations.into_iter().map(CitedEntry::from).collect(),
            degraded,
            conversation_id: prepared.conversation_id,
            cancelled,
        })
    }

    /// 질문에 답변
    ///
    /// 로컬 모델을 쓸 수 없으면 검색된 엔트리 목록으로 대체 답변을 만들고
    /// `degraded = true`로 표시합니다.
    pub async fn ask(
        &self,
        user_id: &str,
        question: &str,
        conversation_id: Option<&str>,
    ) -> Result<AskResponse, EngineError> {
        let prepared = self.prepare(user_id, question, conversation_id).await?;
        let mut degraded = prepared.retrieval.degraded;

        let answer = match self
            .inference
            .generate(&prepared.prompt.render(), self.config.runtime.max_answer_tokens)
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!("Inference failed, answering from retrieved entries: {}", e);
                degraded = true;
                fallback_answer(&prepared.prompt)
            }
        };

        self.finish(user_id, prepared, answer, degraded, false)
    }

    /// 스트리밍 답변
    ///
    /// 토큰을 `tokens`로 전달합니다. 수신측을 drop하면 생성이 취소되고
    /// 그때까지 전달된 부분 답변이 기록됩니다.
    pub async fn ask_stream(
        &self,
        user_id: &str,
        question: &str,
        conversation_id: Option<&str>,
        tokens: mpsc::Sender<String>,
    ) -> Result<AskResponse, EngineError> {
        let prepared = self.prepare(user_id, question, conversation_id).await?;
        let mut degraded = prepared.retrieval.degraded;

        let (inner_tx, mut inner_rx) = mpsc::channel::<String>(32);
        let rendered = prepared.prompt.render();
        let generation = self
            .inference
            .generate_stream(&rendered, self.config.runtime.max_answer_tokens, inner_tx);

        let outbound = &tokens;
        let forward = async move {
            let mut delivered = String::new();
            while let Some(token) = inner_rx.recv().await {
                if outbound.send(token.clone()).await.is_err() {
                    break;
                }
                delivered.push_str(&token);
            }
            // inner_rx drop → 프로바이더 쪽 send 실패 → Cancelled
            drop(inner_rx);
            delivered
        };

        let (result, delivered) = tokio::join!(generation, forward);

        let (answer, cancelled) = match result {
            Ok(full) => (full, false),
            Err(InferenceError::Cancelled) => {
                tracing::info!("Answer stream cancelled by caller");
                (delivered, true)
            }
            Err(e) if delivered.is_empty() => {
                tracing::warn!("Inference failed, answering from retrieved entries: {}", e);
                degraded = true;
                let fallback = fallback_answer(&prepared.prompt);
                // 수신측이 이미 닫혔어도 답변은 기록
                let _ = tokens.send(fallback.clone()).await;
                (fallback, false)
            }
            Err(e) => {
                tracing::warn!("Answer stream interrupted: {}", e);
                degraded = true;
                (delivered, false)
            }
        };

        self.finish(user_id, prepared, answer, degraded, cancelled)
    }
}

fn open_store(data_dir: &Path, db_path: &Path) -> anyhow::Result<IndexStore> {
    if !data_dir.exists() {
        std::fs::create_dir_all(data_dir).context("Failed to create data directory")?;
    }
    IndexStore::open(db_path).context("Failed to open index store")
}

/// 모델 없이 만드는 결정적 답변 - 관련 엔트리를 날짜와 함께 나열
fn fallback_answer(prompt: &Prompt) -> String {
    if prompt.citations.is_empty() {
        return "The local model is not available right now, and no journal entries matched your question."
            .to_string();
    }

    let mut answer = String::from(
        "The local model is not available right now. These journal entries look related to your question:",
    );
    for citation in &prompt.citations {
        answer.push_str(&format!("\n- {}: {}", citation.date, citation.title));
    }
    answer
}

// ============================================================================
// Tests
// ============================================================================
