//! Text Chunking Module
//!
//! 엔트리 본문을 겹치는 구간(청크)으로 분할합니다.
//! 순수 함수이며 동일한 입력은 항상 동일한 경계를 만듭니다.

use serde::Serialize;

// ============================================================================
// Chunk Configuration
// ============================================================================

/// 청킹 설정 (단위: 문자 수, 바이트 아님)
#[derive(Debug, Clone, Serialize)]
pub struct ChunkConfig {
    /// 목표 청크 크기
    pub target_characters: usize,
    /// 이전 청크와 겹치는 크기
    pub overlap_characters: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            target_characters: 500,
            overlap_characters: 50,
        }
    }
}

impl ChunkConfig {
    pub fn new(target_characters: usize, overlap_characters: usize) -> Self {
        Self {
            target_characters,
            overlap_characters,
        }
    }

    /// 오버랩 없는 설정
    pub fn without_overlap(target_characters: usize) -> Self {
        Self::new(target_characters, 0)
    }

    /// 실제 사용되는 (target, overlap) - target >= 1, overlap < target
    fn effective(&self) -> (usize, usize) {
        let target = self.target_characters.max(1);
        let overlap = self.overlap_characters.min(target - 1);
        (target, overlap)
    }
}

// ============================================================================
// Chunker Trait
// ============================================================================

/// 분할된 청크 (index는 0부터 연속)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub index: usize,
    pub text: String,
}

/// 텍스트 청킹 전략 트레이트
pub trait Chunker: Send + Sync {
    /// 텍스트를 청크로 분할
    fn chunk(&self, text: &str) -> Vec<TextChunk>;

    /// 청커 이름
    fn name(&self) -> &'static str;

    /// 경계에 영향을 주는 설정까지 포함한 식별자
    ///
    /// 값이 바뀌면 저장된 청크는 모두 다시 만들어야 합니다.
    fn signature(&self) -> String {
        self.name().to_string()
    }
}

// ============================================================================
// WindowChunker
// ============================================================================

/// 고정 크기 윈도우 청커
///
/// - 연속 공백을 하나로 압축
/// - 윈도우 끝은 가능하면 마지막 공백으로 당겨서 단어를 자르지 않음
/// - 다음 윈도우는 이전 끝에서 overlap 만큼 앞에서 시작
pub struct WindowChunker {
    config: ChunkConfig,
}

impl WindowChunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(ChunkConfig::default())
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }
}

impl Chunker for WindowChunker {
    fn chunk(&self, text: &str) -> Vec<TextChunk> {
        let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if normalized.is_empty() {
            return vec![];
        }

        let chars: Vec<char> = normalized.chars().collect();
        let len = chars.len();
        let (target, overlap) = self.config.effective();

        let mut chunks = Vec::new();
        let mut start = 0;

        loop {
            let hard_end = (start + target).min(len);
            let mut end = hard_end;

            // 윈도우가 overlap보다 길게 남는 경우에만 공백 경계로 당김
            if hard_end < len {
                if let Some(ws) = (start + overlap + 1..hard_end).rev().find(|&i| chars[i] == ' ') {
                    end = ws;
                }
            }

            let piece: String = chars[start..end].iter().collect();
            let piece = piece.trim();
            if !piece.is_empty() {
                chunks.push(TextChunk {
                    index: chunks.len(),
                    text: piece.to_string(),
                });
            }

            if end >= len {
                break;
            }

            // end - overlap > start 이므로 항상 전진
            let mut next = end - overlap;
            if overlap > 0 {
                if let Some(ws) = (next..end).find(|&i| chars[i] == ' ') {
                    if ws + 1 < end {
                        next = ws + 1;
                    }
                }
            }
            start = next;
        }

        chunks
    }

    fn name(&self) -> &'static str {
        "WindowChunker"
    }

    fn signature(&self) -> String {
        let (target, overlap) = self.config.effective();
        format!("window-{}-{}", target, overlap)
    }
}

// ============================================================================
// Factory Functions
// ============================================================================

/// 기본 청커 생성
pub fn default_chunker() -> Box<dyn Chunker> {
    Box::new(WindowChunker::with_defaults())
}

/// 설정을 지정한 윈도우 청커 생성
pub fn window_chunker(config: ChunkConfig) -> Box<dyn Chunker> {
    Box::new(WindowChunker::new(config))
}

// ============================================================================
// Tests
// ============================================================================
