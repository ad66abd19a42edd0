//! Indexer - 엔트리 CRUD 이벤트를 인덱스에 반영
//!
//! 엔트리 하나당 하나의 재인덱싱만 진행되도록 엔트리별 가드를 잡고,
//! 청킹 → 임베딩 → 교체 세트 구성 → 원자적 교체 순으로 처리합니다.
//! 임베딩 실패는 해당 청크를 키워드 전용으로 남길 뿐 저장을 막지 않습니다.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::{JoinHandle, JoinSet};

use crate::embedding::{embed_with_timeout, EmbeddingError, EmbeddingProvider};
use crate::journal::{Entry, EntryEvent};

use super::chunker::Chunker;
use super::store::{ChunkRecord, EmbeddingKind, EmbeddingRecord, IndexSet, IndexStore};

/// 모델 교체/백필 시 동시에 재인덱싱할 엔트리 수
const REINDEX_CONCURRENCY: usize = 4;

// ============================================================================
// Reports
// ============================================================================

/// 엔트리 하나의 인덱싱 결과
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexReport {
    pub entry_id: String,
    pub chunk_count: usize,
    pub embedded_chunks: usize,
    pub keyword_only_chunks: usize,
    /// 지문이 같아 건너뜀
    pub skipped: bool,
    /// 이미 더 최신 버전이 인덱싱되어 있어 건너뜀
    pub stale: bool,
}

/// 이벤트 처리 결과
#[derive(Debug, Clone, PartialEq)]
pub enum IndexOutcome {
    Indexed(IndexReport),
    Deleted { entry_id: String, existed: bool },
}

/// 모델 동기화 결과
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub previous_model: Option<String>,
    pub current_model: String,
    pub previous_profile: Option<String>,
    pub current_profile: String,
    pub reindexed: usize,
    pub failed: usize,
}

// ============================================================================
// Indexer
// ============================================================================

type GuardMap = Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>;

/// 엔트리별 직렬화 가드
///
/// drop 시 다른 대기자가 없으면 맵에서 제거됩니다.
struct EntryGuard {
    entry_id: String,
    guards: GuardMap,
    _lock: OwnedMutexGuard<()>,
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        if let Ok(mut map) = self.guards.lock() {
            // 맵 + 이 가드 = 2
            let unused = map
                .get(&self.entry_id)
                .map(|lock| Arc::strong_count(lock) <= 2)
                .unwrap_or(false);
            if unused {
                map.remove(&self.entry_id);
            }
        }
    }
}

/// 인덱서
#[derive(Clone)]
pub struct Indexer {
    store: IndexStore,
    chunker: Arc<dyn Chunker>,
    embedder: Arc<dyn EmbeddingProvider>,
    embed_timeout: Duration,
    embed_whole_entry: bool,
    guards: GuardMap,
}

impl Indexer {
    pub fn new(
        store: IndexStore,
        chunker: Arc<dyn Chunker>,
        embedder: Arc<dyn EmbeddingProvider>,
        embed_timeout: Duration,
    ) -> Self {
        Self {
            store,
            chunker,
            embedder,
            embed_timeout,
            embed_whole_entry: false,
            guards: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// 엔트리 전체 벡터도 함께 생성
    pub fn with_whole_entry_vectors(mut self, enabled: bool) -> Self {
        self.embed_whole_entry = enabled;
        self
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    pub fn model_id(&self) -> &str {
        self.embedder.model_id()
    }

    /// 인덱스 내용을 결정하는 설정 묶음
    ///
    /// 모델, 청커 경계 설정, 엔트리 벡터 여부 중 하나라도 바뀌면 값이 달라집니다.
    pub fn index_profile(&self) -> String {
        format!(
            "{}|{}|entry-vectors={}",
            self.embedder.model_id(),
            self.chunker.signature(),
            self.embed_whole_entry
        )
    }

    async fn lock_entry(&self, entry_id: &str) -> Result<EntryGuard> {
        let lock = {
            let mut map = self
                .guards
                .lock()
                .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
            Arc::clone(
                map.entry(entry_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };

        Ok(EntryGuard {
            entry_id: entry_id.to_string(),
            guards: Arc::clone(&self.guards),
            _lock: lock.lock_owned().await,
        })
    }

    /// 현재 잡혀 있거나 대기 중인 엔트리 가드 수
    pub fn active_guards(&self) -> usize {
        self.guards.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// CRUD 이벤트 하나 처리
    pub async fn handle(&self, event: EntryEvent) -> Result<IndexOutcome> {
        match event {
            EntryEvent::Created(entry) | EntryEvent::Updated(entry) => {
                Ok(IndexOutcome::Indexed(self.index_entry(&entry).await?))
            }
            EntryEvent::Deleted { entry_id, .. } => {
                let existed = self.delete_entry(&entry_id).await?;
                Ok(IndexOutcome::Deleted { entry_id, existed })
            }
        }
    }

    /// 엔트리 (재)인덱싱
    ///
    /// 교체가 실패하면 에러를 반환하고 이전 버전은 그대로 남습니다.
    pub async fn index_entry(&self, entry: &Entry) -> Result<IndexReport> {
        let _guard = self.lock_entry(&entry.id).await?;

        let model_id = self.embedder.model_id().to_string();
        let fingerprint = content_fingerprint(entry, &self.index_profile());

        if let Some(state) = self.store.entry_index_state(&entry.id, &model_id)? {
            if state.updated_at > entry.updated_at {
                tracing::debug!("Ignoring stale event for entry {}", entry.id);
                return Ok(IndexReport {
                    entry_id: entry.id.clone(),
                    chunk_count: state.chunk_count,
                    stale: true,
                    ..Default::default()
                });
            }
            if state.fingerprint.as_deref() == Some(fingerprint.as_str())
                && state.keyword_only_chunks == 0
            {
                // 청크는 그대로, 기분/날짜만 반영
                self.store
                    .update_entry_metadata(entry)
                    .with_context(|| format!("Failed to update metadata for entry {}", entry.id))?;
                return Ok(IndexReport {
                    entry_id: entry.id.clone(),
                    chunk_count: state.chunk_count,
                    embedded_chunks: state.chunk_count,
                    skipped: true,
                    ..Default::default()
                });
            }
        }

        let pieces = self.chunker.chunk(&entry.body);
        assert!(
            pieces.iter().enumerate().all(|(i, c)| c.index == i),
            "chunker {} produced non-contiguous indices for entry {}",
            self.chunker.name(),
            entry.id
        );

        // 버전별 청크 ID - 교체 중인 두 버전의 청크가 섞이지 않음
        let version = &fingerprint[..12];
        let chunks: Vec<ChunkRecord> = pieces
            .into_iter()
            .map(|piece| ChunkRecord {
                id: format!("{}:{}:{}", entry.id, version, piece.index),
                entry_id: entry.id.clone(),
                user_id: entry.user_id.clone(),
                chunk_index: piece.index,
                text: piece.text,
                created_at: entry.updated_at,
            })
            .collect();

        let mut embeddings = Vec::with_capacity(chunks.len() + 1);
        let mut provider_down = false;

        for chunk in &chunks {
            if provider_down {
                break;
            }
            match embed_with_timeout(self.embedder.as_ref(), &chunk.text, self.embed_timeout).await {
                Ok(embedding) => embeddings.push(EmbeddingRecord {
                    owner_id: chunk.id.clone(),
                    entry_id: entry.id.clone(),
                    kind: EmbeddingKind::Chunk,
                    model_id: embedding.model_id,
                    vector: embedding.vector,
                }),
                Err(e) => {
                    // 런타임이 없거나 멈췄으면 남은 청크는 시도하지 않음
                    provider_down = matches!(
                        e,
                        EmbeddingError::ProviderUnavailable(_) | EmbeddingError::Timeout(_)
                    );
                    tracing::warn!(
                        "Chunk {} of entry {} left keyword-only: {}",
                        chunk.chunk_index,
                        entry.id,
                        e
                    );
                }
            }
        }

        let embedded_chunks = embeddings.len();

        if self.embed_whole_entry && !provider_down && !entry.body.trim().is_empty() {
            let text = format!("{}\n\n{}", entry.title, entry.body);
            match embed_with_timeout(self.embedder.as_ref(), &text, self.embed_timeout).await {
                Ok(embedding) => embeddings.push(EmbeddingRecord {
                    owner_id: entry.id.clone(),
                    entry_id: entry.id.clone(),
                    kind: EmbeddingKind::Entry,
                    model_id: embedding.model_id,
                    vector: embedding.vector,
                }),
                Err(e) => tracing::warn!("Whole-entry vector skipped for {}: {}", entry.id, e),
            }
        }

        let report = IndexReport {
            entry_id: entry.id.clone(),
            chunk_count: chunks.len(),
            embedded_chunks,
            keyword_only_chunks: chunks.len() - embedded_chunks,
            skipped: false,
            stale: false,
        };

        let set = IndexSet { chunks, embeddings };
        self.store
            .replace_entry_index(entry, &fingerprint, &set)
            .with_context(|| format!("Failed to swap index for entry {}", entry.id))?;

        tracing::info!(
            "Indexed entry {} (chunks={}, embedded={}, keyword-only={})",
            entry.id,
            report.chunk_count,
            report.embedded_chunks,
            report.keyword_only_chunks
        );

        Ok(report)
    }

    /// 엔트리와 모든 파생 데이터 삭제
    pub async fn delete_entry(&self, entry_id: &str) -> Result<bool> {
        let _guard = self.lock_entry(entry_id).await?;
        let existed = self
            .store
            .delete_entry(entry_id)
            .with_context(|| format!("Failed to delete entry {}", entry_id))?;

        if existed {
            tracing::info!("Deleted entry {} from index", entry_id);
        }
        Ok(existed)
    }

    /// 저장된 엔트리를 다시 읽어 재인덱싱
    async fn reindex_stored(&self, entry_id: &str) -> Result<Option<IndexReport>> {
        match self.store.get_entry(entry_id)? {
            Some(entry) => Ok(Some(self.index_entry(&entry).await?)),
            None => Ok(None),
        }
    }

    /// 임베딩 모델이나 인덱스 프로필이 바뀌었으면 전체 재인덱싱
    pub async fn sync_model(&self) -> Result<SyncReport> {
        let current = self.embedder.model_id().to_string();
        let previous = self.store.active_model()?;
        let current_profile = self.index_profile();
        let previous_profile = self.store.index_profile()?;

        let mut report = SyncReport {
            previous_model: previous.clone(),
            current_model: current.clone(),
            previous_profile: previous_profile.clone(),
            current_profile: current_profile.clone(),
            ..Default::default()
        };

        if previous.as_deref() == Some(current.as_str())
            && previous_profile.as_deref() == Some(current_profile.as_str())
        {
            return Ok(report);
        }

        let ids = self.store.all_entry_ids()?;
        if !ids.is_empty() {
            tracing::info!(
                "Index profile changed ({:?} -> {}), reindexing {} entries",
                previous_profile,
                current_profile,
                ids.len()
            );
        }

        let results: Vec<Result<Option<IndexReport>>> = stream::iter(ids)
            .map(|id| async move { self.reindex_stored(&id).await })
            .buffer_unordered(REINDEX_CONCURRENCY)
            .collect()
            .await;

        for result in results {
            match result {
                Ok(Some(_)) => report.reindexed += 1,
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::error!("Reindex during model sync failed: {:#}", e);
                }
            }
        }

        self.store.set_active_model(&current)?;
        self.store.set_index_profile(&current_profile)?;
        Ok(report)
    }

    /// 키워드 전용 청크가 남은 엔트리를 다시 임베딩
    ///
    /// 반환값은 모든 청크가 임베딩된 엔트리 수입니다.
    pub async fn backfill(&self) -> Result<usize> {
        let ids = self.store.entries_needing_backfill(self.embedder.model_id())?;
        if ids.is_empty() {
            return Ok(0);
        }
        tracing::info!("Backfilling embeddings for {} entries", ids.len());

        let results: Vec<Result<Option<IndexReport>>> = stream::iter(ids)
            .map(|id| async move { self.reindex_stored(&id).await })
            .buffer_unordered(REINDEX_CONCURRENCY)
            .collect()
            .await;

        let mut completed = 0;
        for result in results {
            match result {
                Ok(Some(report)) if report.keyword_only_chunks == 0 => completed += 1,
                Ok(_) => {}
                Err(e) => tracing::error!("Backfill failed: {:#}", e),
            }
        }
        Ok(completed)
    }

    /// 이벤트 채널 구독
    ///
    /// 이벤트마다 태스크를 띄워 서로 다른 엔트리는 독립적으로 진행됩니다.
    /// 송신측이 모두 닫히면 진행 중인 태스크를 기다린 뒤 종료합니다.
    pub fn spawn_listener(&self, mut events: mpsc::Receiver<EntryEvent>) -> JoinHandle<()> {
        let indexer = self.clone();
        tokio::spawn(async move {
            let mut tasks = JoinSet::new();

            while let Some(event) = events.recv().await {
                let worker = indexer.clone();
                tasks.spawn(async move {
                    let entry_id = event.entry_id().to_string();
                    if let Err(e) = worker.handle(event).await {
                        tracing::error!("Index event for entry {} failed: {:#}", entry_id, e);
                    }
                });

                // 완료된 태스크 정리
                while let Some(joined) = tasks.try_join_next() {
                    if let Err(e) = joined {
                        tracing::error!("Index task panicked: {}", e);
                    }
                }
            }

            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    tracing::error!("Index task panicked: {}", e);
                }
            }
            tracing::debug!("Index listener stopped");
        })
    }
}

/// 엔트리 내용 + 인덱스 프로필 지문 (SHA-256 hex)
pub fn content_fingerprint(entry: &Entry, profile: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [entry.title.as_str(), entry.body.as_str(), &entry.tags_text(), profile] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{Embedding, HashingEmbedding};
    use crate::knowledge::chunker::{ChunkConfig, WindowChunker};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    /// 켜고 끌 수 있는 임베딩 (같은 모델 ID 유지)
    struct SwitchableEmbedding {
        inner: HashingEmbedding,
        available: AtomicBool,
    }

    impl SwitchableEmbedding {
        fn new(available: bool) -> Self {
            Self {
                inner: HashingEmbedding::new(32),
                available: AtomicBool::new(available),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for SwitchableEmbedding {
        async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
            if self.available.load(Ordering::SeqCst) {
                self.inner.embed(text).await
            } else {
                Err(EmbeddingError::ProviderUnavailable("runtime offline".into()))
            }
        }

        fn model_id(&self) -> &str {
            self.inner.model_id()
        }

        fn name(&self) -> &str {
            "switchable"
        }
    }

    struct StalledEmbedding;

    #[async_trait]
    impl EmbeddingProvider for StalledEmbedding {
        async fn embed(&self, _text: &str) -> Result<Embedding, EmbeddingError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(EmbeddingError::ProviderUnavailable("never".into()))
        }

        fn model_id(&self) -> &str {
            "stalled"
        }

        fn name(&self) -> &str {
            "stalled"
        }
    }

    fn create_indexer(embedder: Arc<dyn EmbeddingProvider>) -> (TempDir, Indexer) {
        let dir = TempDir::new().unwrap();
        let store = IndexStore::open(&dir.path().join("index.db")).unwrap();
        let indexer = Indexer::new(
            store,
            Arc::new(WindowChunker::with_defaults()),
            embedder,
            Duration::from_secs(5),
        );
        (dir, indexer)
    }

    fn gratitude_body() -> String {
        "I am grateful for my sister who called me today. ".repeat(16)
    }

    #[tokio::test]
    async fn test_gratitude_entry_two_chunks_with_embeddings() {
        let (_dir, indexer) = create_indexer(Arc::new(HashingEmbedding::new(64)));
        let entry = Entry::new("u1", "Gratitude", gratitude_body());

        let report = indexer.index_entry(&entry).await.unwrap();
        assert_eq!(report.chunk_count, 2);
        assert_eq!(report.embedded_chunks, 2);
        assert_eq!(report.keyword_only_chunks, 0);

        let store = indexer.store();
        let chunks = store.chunks_for_entry(&entry.id).unwrap();
        assert_eq!(chunks.len(), WindowChunker::with_defaults().chunk(&entry.body).len());
        assert_eq!(store.embeddings_for_entry(&entry.id).unwrap().len(), 2);
        assert!(store.verify_chunk_sequence(&entry.id).unwrap());
        assert_eq!(indexer.active_guards(), 0);
    }

    #[tokio::test]
    async fn test_update_replaces_three_chunks_with_one() {
        let (_dir, indexer) = create_indexer(Arc::new(HashingEmbedding::new(64)));
        let mut entry = Entry::new("u1", "Long day", "word ".repeat(250));
        let first = indexer.index_entry(&entry).await.unwrap();
        assert_eq!(first.chunk_count, 3);

        entry.edit_body("A short note.");
        let second = indexer.index_entry(&entry).await.unwrap();
        assert_eq!(second.chunk_count, 1);

        let store = indexer.store();
        let chunks = store.chunks_for_entry(&entry.id).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "A short note.");
        assert_eq!(store.embeddings_for_entry(&entry.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reindex_unchanged_is_idempotent() {
        let (_dir, indexer) = create_indexer(Arc::new(HashingEmbedding::new(64)));
        let entry = Entry::new("u1", "Same", gratitude_body());

        indexer.index_entry(&entry).await.unwrap();
        let chunks_before = indexer.store().chunks_for_entry(&entry.id).unwrap();
        let vectors_before = indexer.store().embeddings_for_entry(&entry.id).unwrap();

        let again = indexer.index_entry(&entry).await.unwrap();
        assert!(again.skipped);

        assert_eq!(indexer.store().chunks_for_entry(&entry.id).unwrap(), chunks_before);
        assert_eq!(indexer.store().embeddings_for_entry(&entry.id).unwrap(), vectors_before);
    }

    #[tokio::test]
    async fn test_stale_update_is_ignored() {
        let (_dir, indexer) = create_indexer(Arc::new(HashingEmbedding::new(16)));
        let original = Entry::new("u1", "T", "first version");
        let mut newer = original.clone();
        newer.body = "second version".into();
        newer.updated_at = original.updated_at + chrono::Duration::seconds(1);

        indexer.index_entry(&newer).await.unwrap();
        let report = indexer.index_entry(&original).await.unwrap();
        assert!(report.stale);

        let chunks = indexer.store().chunks_for_entry(&original.id).unwrap();
        assert_eq!(chunks[0].text, "second version");
    }

    #[tokio::test]
    async fn test_unavailable_provider_leaves_keyword_only_then_backfills() {
        let embedder = Arc::new(SwitchableEmbedding::new(false));
        let (_dir, indexer) = create_indexer(embedder.clone());
        let entry = Entry::new("u1", "Offline", gratitude_body());

        let report = indexer.index_entry(&entry).await.unwrap();
        assert_eq!(report.chunk_count, 2);
        assert_eq!(report.keyword_only_chunks, 2);
        assert!(indexer.store().embeddings_for_entry(&entry.id).unwrap().is_empty());
        assert!(indexer.store().get_entry(&entry.id).unwrap().is_some());

        embedder.available.store(true, Ordering::SeqCst);
        assert_eq!(indexer.backfill().await.unwrap(), 1);
        assert_eq!(indexer.store().embeddings_for_entry(&entry.id).unwrap().len(), 2);
        assert_eq!(indexer.backfill().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stalled_provider_times_out_to_keyword_only() {
        let dir = TempDir::new().unwrap();
        let store = IndexStore::open(&dir.path().join("index.db")).unwrap();
        let indexer = Indexer::new(
            store,
            Arc::new(WindowChunker::with_defaults()),
            Arc::new(StalledEmbedding),
            Duration::from_millis(30),
        );
        let entry = Entry::new("u1", "Stall", gratitude_body());

        let report = tokio::time::timeout(Duration::from_secs(5), indexer.index_entry(&entry))
            .await
            .expect("guard held too long")
            .unwrap();
        assert_eq!(report.keyword_only_chunks, report.chunk_count);

        // 가드가 풀려 바로 삭제 가능
        let deleted = tokio::time::timeout(Duration::from_secs(1), indexer.delete_entry(&entry.id))
            .await
            .unwrap()
            .unwrap();
        assert!(deleted);
    }

    #[tokio::test]
    async fn test_model_change_reindexes_everything() {
        let dir = TempDir::new().unwrap();
        let store = IndexStore::open(&dir.path().join("index.db")).unwrap();
        let chunker: Arc<dyn Chunker> = Arc::new(WindowChunker::with_defaults());

        let old = Indexer::new(
            store.clone(),
            chunker.clone(),
            Arc::new(HashingEmbedding::new(16)),
            Duration::from_secs(5),
        );
        old.sync_model().await.unwrap();
        let a = Entry::new("u1", "A", "first entry text");
        let b = Entry::new("u1", "B", "second entry text");
        old.index_entry(&a).await.unwrap();
        old.index_entry(&b).await.unwrap();

        let new = Indexer::new(store.clone(), chunker, Arc::new(HashingEmbedding::new(32)), Duration::from_secs(5));
        let report = new.sync_model().await.unwrap();
        assert_eq!(report.previous_model.as_deref(), Some("hashing-v1-16"));
        assert_eq!(report.reindexed, 2);
        assert_eq!(report.failed, 0);

        assert!(store
            .vector_candidates("u1", "hashing-v1-16", EmbeddingKind::Chunk)
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .vector_candidates("u1", "hashing-v1-32", EmbeddingKind::Chunk)
                .unwrap()
                .len(),
            2
        );
        assert_eq!(store.active_model().unwrap().as_deref(), Some("hashing-v1-32"));

        // 두 번째 동기화는 할 일 없음
        assert_eq!(new.sync_model().await.unwrap().reindexed, 0);
    }

    #[tokio::test]
    async fn test_chunk_config_change_rebuilds_chunks() {
        let dir = TempDir::new().unwrap();
        let store = IndexStore::open(&dir.path().join("index.db")).unwrap();
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashingEmbedding::new(16));

        let wide = Indexer::new(
            store.clone(),
            Arc::new(WindowChunker::new(ChunkConfig::new(500, 50))),
            embedder.clone(),
            Duration::from_secs(5),
        );
        wide.sync_model().await.unwrap();
        let entry = Entry::new("u1", "Gratitude", gratitude_body());
        wide.index_entry(&entry).await.unwrap();
        assert_eq!(store.chunks_for_entry(&entry.id).unwrap().len(), 2);

        let narrow_chunker = WindowChunker::new(ChunkConfig::new(100, 10));
        let expected = narrow_chunker.chunk(&entry.body).len();
        assert!(expected > 2);
        let narrow = Indexer::new(
            store.clone(),
            Arc::new(narrow_chunker),
            embedder,
            Duration::from_secs(5),
        );
        assert_ne!(wide.index_profile(), narrow.index_profile());

        // 모델은 같아도 프로필이 달라 전체 재인덱싱
        let report = narrow.sync_model().await.unwrap();
        assert_eq!(report.previous_model, Some(report.current_model.clone()));
        assert_eq!(report.previous_profile.as_deref(), Some(wide.index_profile().as_str()));
        assert_eq!(report.reindexed, 1);
        assert_eq!(store.chunks_for_entry(&entry.id).unwrap().len(), expected);
        assert_eq!(store.index_profile().unwrap(), Some(narrow.index_profile()));

        // 같은 설정으로 다시 보내면 건너뜀
        let again = narrow.index_entry(&entry).await.unwrap();
        assert!(again.skipped);
        assert_eq!(again.chunk_count, expected);
        assert!(store.verify_chunk_sequence(&entry.id).unwrap());
    }

    #[tokio::test]
    async fn test_chunk_config_change_without_sync() {
        let dir = TempDir::new().unwrap();
        let store = IndexStore::open(&dir.path().join("index.db")).unwrap();
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashingEmbedding::new(16));
        let entry = Entry::new("u1", "Gratitude", gratitude_body());

        Indexer::new(
            store.clone(),
            Arc::new(WindowChunker::with_defaults()),
            embedder.clone(),
            Duration::from_secs(5),
        )
        .index_entry(&entry)
        .await
        .unwrap();

        let narrow_chunker = WindowChunker::new(ChunkConfig::new(100, 10));
        let expected = narrow_chunker.chunk(&entry.body).len();
        let narrow = Indexer::new(store.clone(), Arc::new(narrow_chunker), embedder, Duration::from_secs(5));
        let report = narrow.index_entry(&entry).await.unwrap();

        assert!(!report.skipped);
        assert_eq!(report.chunk_count, expected);
        assert_eq!(store.chunks_for_entry(&entry.id).unwrap().len(), expected);
    }

    #[tokio::test]
    async fn test_skip_path_persists_metadata() {
        let (_dir, indexer) = create_indexer(Arc::new(HashingEmbedding::new(16)));
        let mut entry = Entry::new("u1", "Evening", gratitude_body());
        let original_updated = entry.updated_at;
        indexer.index_entry(&entry).await.unwrap();
        let chunks_before = indexer.store().chunks_for_entry(&entry.id).unwrap();

        entry.mood = Some("happy".into());
        entry.updated_at = original_updated + chrono::Duration::seconds(5);
        let report = indexer.index_entry(&entry).await.unwrap();
        assert!(report.skipped);

        let stored = indexer.store().get_entry(&entry.id).unwrap().unwrap();
        assert_eq!(stored.mood.as_deref(), Some("happy"));
        assert_eq!(stored.updated_at, entry.updated_at);
        assert_eq!(indexer.store().chunks_for_entry(&entry.id).unwrap(), chunks_before);

        // 저장된 updated_at보다 오래된 이벤트는 이제 stale로 판정
        let mut older = entry.clone();
        older.body = "an edit that arrived late".into();
        older.updated_at = original_updated + chrono::Duration::seconds(2);
        assert!(indexer.index_entry(&older).await.unwrap().stale);
        assert_eq!(indexer.store().chunks_for_entry(&entry.id).unwrap(), chunks_before);
    }

    #[tokio::test]
    async fn test_empty_body_has_no_chunks_but_is_stored() {
        let (_dir, indexer) = create_indexer(Arc::new(HashingEmbedding::new(16)));
        let entry = Entry::new("u1", "Title only", "   ");
        let report = indexer.index_entry(&entry).await.unwrap();
        assert_eq!(report.chunk_count, 0);
        assert!(indexer.store().get_entry(&entry.id).unwrap().is_some());
        assert_eq!(indexer.store().search_entries_fts("u1", "\"title\"", 5).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_whole_entry_vector() {
        let (_dir, indexer) = create_indexer(Arc::new(HashingEmbedding::new(16)));
        let indexer = indexer.with_whole_entry_vectors(true);
        let entry = Entry::new("u1", "Walk", "river walk at dusk");
        indexer.index_entry(&entry).await.unwrap();

        let records = indexer.store().embeddings_for_entry(&entry.id).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().any(|r| r.kind == EmbeddingKind::Entry && r.owner_id == entry.id));
    }

    #[tokio::test]
    async fn test_concurrent_entries_proceed_independently() {
        let (_dir, indexer) = create_indexer(Arc::new(HashingEmbedding::new(16)));
        let a = Entry::new("u1", "A", "alpha text");
        let b = Entry::new("u1", "B", "beta text");

        let (ra, rb) = tokio::join!(indexer.index_entry(&a), indexer.index_entry(&b));
        assert_eq!(ra.unwrap().chunk_count, 1);
        assert_eq!(rb.unwrap().chunk_count, 1);
        assert_eq!(indexer.active_guards(), 0);
    }

    #[tokio::test]
    async fn test_listener_applies_events() {
        let (_dir, indexer) = create_indexer(Arc::new(HashingEmbedding::new(16)));
        let (tx, rx) = mpsc::channel(8);
        let handle = indexer.spawn_listener(rx);

        let keep = Entry::new("u1", "Keep", "this one stays");
        let gone = Entry::new("u1", "Gone", "this one goes");
        tx.send(EntryEvent::Created(keep.clone())).await.unwrap();
        tx.send(EntryEvent::Created(gone.clone())).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let outcome = indexer
            .handle(EntryEvent::Deleted {
                user_id: "u1".into(),
                entry_id: gone.id.clone(),
            })
            .await
            .unwrap();
        assert_eq!(
            outcome,
            IndexOutcome::Deleted {
                entry_id: gone.id.clone(),
                existed: true
            }
        );

        assert!(indexer.store().get_entry(&keep.id).unwrap().is_some());
        assert!(indexer.store().get_entry(&gone.id).unwrap().is_none());
    }

    #[test]
    fn test_fingerprint_tracks_content_and_profile() {
        let mut entry = Entry::new("u1", "T", "body");
        let base = content_fingerprint(&entry, "m1");
        assert_eq!(base, content_fingerprint(&entry, "m1"));
        assert_ne!(base, content_fingerprint(&entry, "m2"));

        entry.tags.insert("tag".into());
        assert_ne!(base, content_fingerprint(&entry, "m1"));
        assert_eq!(base.len(), 64);
    }
}
