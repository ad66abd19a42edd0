//! 하이브리드 검색 - FTS5 키워드 + 벡터 유사도 + 최신성 가중합
//!
//! fused = w_k * kw + w_v * vec + w_r * recency
//!
//! - kw: -bm25를 후보 집합 최대값으로 나눈 값 (0~1, 단조)
//! - vec: max(cosine, 0)
//! - recency: 0.5^(경과일 / 반감기), 상한 recency_cap
//!
//! 엔트리 전체 벡터가 있으면 청크 결과가 없는 엔트리의 벡터 신호로 쓰며,
//! 엔트리 단위 키워드와 같은 감쇠(entry_tier_discount)를 적용합니다.
//!
//! 쿼리 임베딩이 실패하면 w_v = 0으로 키워드 전용 검색을 하고 degraded로 표시합니다.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::embedding::{embed_with_timeout, EmbeddingProvider};

use super::store::{ChunkKeywordHit, EmbeddingKind, EntryKeywordHit, IndexStore};
use super::vector::{rank_by_similarity, VectorHit};

/// 키워드 추출 시 버리는 흔한 영어 단어
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "have", "his", "how", "its", "may", "who", "did", "get", "she",
    "too", "use", "what", "when", "where", "which", "why", "with", "this", "that", "from",
    "they", "them", "then", "than", "there", "were", "been", "being", "into", "about", "would",
    "could", "should", "does", "just", "your", "yours", "mine", "some", "more", "most", "very",
];

// ============================================================================
// Configuration
// ============================================================================

/// 검색 설정
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalConfig {
    /// 질문당 가져올 문서 수
    pub top_k: usize,
    pub keyword_weight: f32,
    pub vector_weight: f32,
    pub recency_weight: f32,
    /// 최신성 반감기 (일)
    pub recency_half_life_days: f32,
    pub recency_cap: f32,
    /// 키워드+벡터 관련도 하한 (최신성만으로는 통과 불가)
    pub min_relevance: f32,
    /// 후보 풀 = k * candidate_multiplier
    pub candidate_multiplier: usize,
    /// 엔트리당 최대 구간 수
    pub passages_per_entry: usize,
    /// 엔트리 단위 폴백 결과의 감쇠
    pub entry_tier_discount: f32,
    /// LIKE 폴백 결과의 키워드 점수
    pub like_fallback_score: f32,
    /// 엔트리 단위 결과에 사용할 본문 앞부분 길이 (문자)
    pub snippet_characters: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            keyword_weight: 0.4,
            vector_weight: 0.4,
            recency_weight: 0.2,
            recency_half_life_days: 30.0,
            recency_cap: 1.0,
            min_relevance: 0.05,
            candidate_multiplier: 4,
            passages_per_entry: 1,
            entry_tier_discount: 0.5,
            like_fallback_score: 0.25,
            snippet_characters: 500,
        }
    }
}

// ============================================================================
// Types
// ============================================================================

/// 세부 점수
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SubScores {
    pub keyword: f32,
    pub vector: f32,
    pub recency: f32,
}

/// 검색 결과 문서 (질의마다 생성되고 응답 후 버려짐)
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedDoc {
    pub entry_id: String,
    pub title: String,
    pub date: DateTime<Utc>,
    /// 엔트리 단위 폴백이면 None
    pub chunk_index: Option<usize>,
    pub text: String,
    pub score: f32,
    pub scores: SubScores,
}

impl RetrievedDoc {
    pub fn date_label(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }
}

/// 검색 결과
#[derive(Debug, Clone, Default, Serialize)]
pub struct Retrieval {
    pub docs: Vec<RetrievedDoc>,
    /// 벡터 신호 없이 키워드만으로 순위를 매겼음
    pub degraded: bool,
}

/// 키워드 계층별 후보
#[derive(Debug, Default)]
struct KeywordCandidates {
    chunks: Vec<ChunkKeywordHit>,
    entries: Vec<EntryKeywordHit>,
    like: Vec<String>,
}

/// 벡터 계층별 후보
#[derive(Debug, Default)]
struct VectorHits {
    chunks: Vec<VectorHit>,
    /// 엔트리 전체 벡터 (chunk_id = entry_id)
    entries: Vec<VectorHit>,
}

/// 융합 전 후보
#[derive(Debug, Default, Clone)]
struct Candidate {
    keyword: f32,
    vector: f32,
}

// ============================================================================
// HybridRetriever
// ============================================================================

/// 하이브리드 검색기
#[derive(Clone)]
pub struct HybridRetriever {
    store: IndexStore,
    embedder: Arc<dyn EmbeddingProvider>,
    config: RetrievalConfig,
    embed_timeout: Duration,
}

impl HybridRetriever {
    pub fn new(
        store: IndexStore,
        embedder: Arc<dyn EmbeddingProvider>,
        config: RetrievalConfig,
        embed_timeout: Duration,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
            embed_timeout,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// 질의에 대한 상위 k개 문서
    pub async fn retrieve(&self, user_id: &str, query: &str, k: usize) -> Result<Retrieval> {
        self.retrieve_at(user_id, query, k, Utc::now()).await
    }

    /// 기준 시각을 지정한 검색 (최신성 계산용)
    pub async fn retrieve_at(
        &self,
        user_id: &str,
        query: &str,
        k: usize,
        now: DateTime<Utc>,
    ) -> Result<Retrieval> {
        let query = query.trim();
        if query.is_empty() || k == 0 {
            return Ok(Retrieval::default());
        }

        let pool = k.saturating_mul(self.config.candidate_multiplier.max(1));
        let fts_query = build_fts_query(&extract_terms(query));

        // 1+2. 키워드 검색(블로킹 풀)과 쿼리 임베딩을 동시에
        let keyword_task = {
            let store = self.store.clone();
            let user_id = user_id.to_string();
            let like_query = query.to_string();
            tokio::task::spawn_blocking(move || -> Result<KeywordCandidates> {
                let chunks = store.search_chunks_fts(&user_id, &fts_query, pool)?;
                let entries = store.search_entries_fts(&user_id, &fts_query, pool)?;
                let like = if chunks.is_empty() && entries.is_empty() {
                    store.search_like(&user_id, &like_query, pool)?
                } else {
                    vec![]
                };
                Ok(KeywordCandidates { chunks, entries, like })
            })
        };
        let embed_task = embed_with_timeout(self.embedder.as_ref(), query, self.embed_timeout);

        let (keyword, embedded) = tokio::join!(keyword_task, embed_task);
        let keyword = keyword.context("Keyword search task failed")??;

        let (vector_hits, degraded) = match embedded {
            Ok(embedding) if embedding.model_id == self.embedder.model_id() => {
                let chunks =
                    self.store
                        .vector_candidates(user_id, &embedding.model_id, EmbeddingKind::Chunk)?;
                let entries =
                    self.store
                        .vector_candidates(user_id, &embedding.model_id, EmbeddingKind::Entry)?;
                let hits = VectorHits {
                    chunks: rank_by_similarity(&embedding.vector, chunks, pool),
                    entries: rank_by_similarity(&embedding.vector, entries, pool),
                };
                (hits, false)
            }
            Ok(embedding) => {
                tracing::warn!(
                    "Query embedded with {} but provider reports {}, using keyword only",
                    embedding.model_id,
                    self.embedder.model_id()
                );
                (VectorHits::default(), true)
            }
            Err(e) => {
                tracing::warn!("Query embedding unavailable, using keyword only: {}", e);
                (VectorHits::default(), true)
            }
        };

        let docs = self.fuse(user_id, keyword, vector_hits, degraded, k, now)?;
        Ok(Retrieval { docs, degraded })
    }

    /// 3~5. 점수 융합, 엔트리 중복 제거, 정렬
    fn fuse(
        &self,
        user_id: &str,
        keyword: KeywordCandidates,
        vector_hits: VectorHits,
        degraded: bool,
        k: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<RetrievedDoc>> {
        let cfg = &self.config;

        // chunk_id -> 후보
        let mut chunk_candidates: HashMap<String, Candidate> = HashMap::new();
        let max_chunk = keyword.chunks.iter().map(|h| h.relevance).fold(0.0, f64::max);
        for hit in &keyword.chunks {
            chunk_candidates.entry(hit.chunk_id.clone()).or_default().keyword =
                normalize_keyword(hit.relevance, max_chunk);
        }
        for hit in &vector_hits.chunks {
            chunk_candidates.entry(hit.chunk_id.clone()).or_default().vector =
                hit.similarity.max(0.0);
        }

        let chunk_ids: Vec<String> = chunk_candidates.keys().cloned().collect();
        let views = self.store.hydrate_chunks(user_id, &chunk_ids)?;
        let covered: HashSet<&str> = views.values().map(|v| v.entry_id.as_str()).collect();

        // entry_id -> 후보 (청크 결과가 없는 엔트리만)
        let mut entry_candidates: HashMap<String, Candidate> = HashMap::new();
        let max_entry = keyword.entries.iter().map(|h| h.relevance).fold(0.0, f64::max);
        for hit in &keyword.entries {
            if covered.contains(hit.entry_id.as_str()) {
                continue;
            }
            entry_candidates.entry(hit.entry_id.clone()).or_default().keyword =
                normalize_keyword(hit.relevance, max_entry) * cfg.entry_tier_discount;
        }
        for entry_id in &keyword.like {
            if covered.contains(entry_id.as_str()) {
                continue;
            }
            entry_candidates.entry(entry_id.clone()).or_default().keyword = cfg.like_fallback_score;
        }
        for hit in &vector_hits.entries {
            if covered.contains(hit.entry_id.as_str()) {
                continue;
            }
            entry_candidates.entry(hit.entry_id.clone()).or_default().vector =
                hit.similarity.max(0.0) * cfg.entry_tier_discount;
        }

        let entry_ids: Vec<String> = entry_candidates.keys().cloned().collect();
        let entries = self.store.hydrate_entries(user_id, &entry_ids)?;

        let vector_weight = if degraded { 0.0 } else { cfg.vector_weight };
        let relevance_denominator = cfg.keyword_weight + vector_weight;

        let score = |c: &Candidate, date: DateTime<Utc>| -> Option<(f32, SubScores)> {
            let relevance_raw = cfg.keyword_weight * c.keyword + vector_weight * c.vector;
            if relevance_denominator <= 0.0 || relevance_raw / relevance_denominator < cfg.min_relevance {
                return None;
            }
            let recency = recency_boost(date, now, cfg.recency_half_life_days, cfg.recency_cap);
            let fused = relevance_raw + cfg.recency_weight * recency;
            Some((
                fused,
                SubScores {
                    keyword: c.keyword,
                    vector: if degraded { 0.0 } else { c.vector },
                    recency,
                },
            ))
        };

        let mut docs = Vec::with_capacity(chunk_candidates.len() + entry_candidates.len());

        for (chunk_id, candidate) in &chunk_candidates {
            // 삭제되었거나 교체된 버전의 청크
            let Some(view) = views.get(chunk_id) else {
                continue;
            };
            if let Some((fused, scores)) = score(candidate, view.entry_created_at) {
                docs.push(RetrievedDoc {
                    entry_id: view.entry_id.clone(),
                    title: view.title.clone(),
                    date: view.entry_created_at,
                    chunk_index: Some(view.chunk_index),
                    text: view.text.clone(),
                    score: fused,
                    scores,
                });
            }
        }

        for (entry_id, candidate) in &entry_candidates {
            let Some(entry) = entries.get(entry_id) else {
                continue;
            };
            if let Some((fused, scores)) = score(candidate, entry.created_at) {
                let text = if entry.body.trim().is_empty() {
                    entry.title.clone()
                } else {
                    leading_window(&entry.body, cfg.snippet_characters)
                };
                docs.push(RetrievedDoc {
                    entry_id: entry.id.clone(),
                    title: entry.title.clone(),
                    date: entry.created_at,
                    chunk_index: None,
                    text,
                    score: fused,
                    scores,
                });
            }
        }

        docs.sort_by(compare_docs);

        // 엔트리별 상위 passages_per_entry개만 유지
        let per_entry = cfg.passages_per_entry.max(1);
        let mut taken: HashMap<String, usize> = HashMap::new();
        docs.retain(|doc| {
            let count = taken.entry(doc.entry_id.clone()).or_insert(0);
            *count += 1;
            *count <= per_entry
        });
        docs.truncate(k);

        tracing::debug!(
            "Retrieved {} docs (chunk candidates={}, entry candidates={}, degraded={})",
            docs.len(),
            chunk_candidates.len(),
            entry_candidates.len(),
            degraded
        );

        Ok(docs)
    }
}

// ============================================================================
// Scoring helpers
// ============================================================================

/// 점수 내림차순 → 최신 우선 → 낮은 chunk_index → entry_id
fn compare_docs(a: &RetrievedDoc, b: &RetrievedDoc) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.date.cmp(&a.date))
        .then_with(|| a.chunk_index.cmp(&b.chunk_index))
        .then_with(|| a.entry_id.cmp(&b.entry_id))
}

/// 후보 집합 최대값 기준 정규화 (최대값이 0에 가까우면 모두 1.0)
fn normalize_keyword(relevance: f64, max: f64) -> f32 {
    if max <= f64::EPSILON {
        1.0
    } else {
        (relevance / max).clamp(0.0, 1.0) as f32
    }
}

/// 지수 감쇠 최신성 가중치 - 미래 날짜는 경과 0일
pub fn recency_boost(date: DateTime<Utc>, now: DateTime<Utc>, half_life_days: f32, cap: f32) -> f32 {
    let age_days = ((now - date).num_seconds().max(0) as f64 / 86_400.0) as f32;
    let half_life = half_life_days.max(f32::EPSILON);
    0.5f32.powf(age_days / half_life).clamp(0.0, cap.max(0.0))
}

fn leading_window(text: &str, max_chars: usize) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    normalized.chars().take(max_chars.max(1)).collect()
}

fn word_regex() -> &'static Regex {
    static WORD: OnceLock<Regex> = OnceLock::new();
    WORD.get_or_init(|| Regex::new(r"\w+").expect("valid regex"))
}

/// 질의어 추출 - 소문자화, 불용어/2글자 이하 제거, 중복 제거
///
/// 남는 단어가 없으면 모든 단어를 사용합니다.
pub fn extract_terms(query: &str) -> Vec<String> {
    let words: Vec<String> = word_regex()
        .find_iter(query)
        .map(|m| m.as_str().to_lowercase())
        .collect();

    let mut seen = HashSet::new();
    let filtered: Vec<String> = words
        .iter()
        .filter(|w| w.chars().count() > 2 && !STOPWORDS.contains(&w.as_str()))
        .filter(|w| seen.insert((*w).clone()))
        .cloned()
        .collect();

    if !filtered.is_empty() {
        return filtered;
    }

    let mut seen = HashSet::new();
    words.into_iter().filter(|w| seen.insert(w.clone())).collect()
}

/// FTS5 MATCH 식 - 각 단어를 따옴표로 감싸 OR 결합
pub fn build_fts_query(terms: &[String]) -> String {
    terms
        .iter()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

// ============================================================================
// Tests
// ============================================================================
