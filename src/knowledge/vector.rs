//! Vector utilities - 코사인 유사도 및 BLOB 직렬화
//!
//! 벡터는 SQLite BLOB(little-endian f32)으로 저장되고,
//! 유사도는 Rust에서 전수 계산합니다. 저널 규모에서는 ANN이 필요 없습니다.

use std::cmp::Ordering;

// ============================================================================
// Types
// ============================================================================

/// 벡터 검색 후보 (검색 대상 청크 하나)
#[derive(Debug, Clone)]
pub struct VectorCandidate {
    pub chunk_id: String,
    pub entry_id: String,
    pub chunk_index: usize,
    pub embedding: Vec<f32>,
}

/// 벡터 검색 결과
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: String,
    pub entry_id: String,
    pub chunk_index: usize,
    /// 코사인 유사도 (-1.0 ~ 1.0)
    pub similarity: f32,
}

// ============================================================================
// Utility Functions
// ============================================================================

/// 코사인 유사도 계산
///
/// 결과는 -1.0 ~ 1.0 범위입니다.
/// 길이가 다르거나 비어 있으면 0.0을 반환합니다.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// f32 벡터 -> BLOB (little-endian)
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// BLOB -> f32 벡터
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// 후보 전체에 대해 유사도를 계산하고 상위 limit개 반환
///
/// 동점은 entry_id, chunk_index 순으로 정렬해 입력 순서와 무관하게 결정적입니다.
pub fn rank_by_similarity(
    query: &[f32],
    candidates: Vec<VectorCandidate>,
    limit: usize,
) -> Vec<VectorHit> {
    let mut hits: Vec<VectorHit> = candidates
        .into_iter()
        .filter(|c| c.embedding.len() == query.len())
        .map(|c| VectorHit {
            similarity: cosine_similarity(query, &c.embedding),
            chunk_id: c.chunk_id,
            entry_id: c.entry_id,
            chunk_index: c.chunk_index,
        })
        .collect();

    hits.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.entry_id.cmp(&b.entry_id))
            .then_with(|| a.chunk_index.cmp(&b.chunk_index))
    });
    hits.truncate(limit);
    hits
}

// ============================================================================
// Tests
// ============================================================================
