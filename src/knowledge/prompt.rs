//! Prompt Builder - 검색 결과를 토큰 예산 안의 프롬프트로 패킹
//!
//! 스니펫은 순위 순서대로 넣고, 예산을 넘기기 직전에 멈춥니다.
//! 같은 입력이면 항상 같은 프롬프트가 나옵니다.

use serde::Serialize;

use super::conversation::{ConversationTurn, Role};
use super::hybrid::RetrievedDoc;

const SYSTEM_INSTRUCTION: &str = "You are a thoughtful assistant for a private journal. \
Answer the question using the journal excerpts provided. \
Cite the date of each entry you rely on, for example (2024-03-01). \
If the excerpts do not contain the answer, say so plainly.";

const DEGRADED_NOTE: &str =
    "The excerpts were found by keyword matching only and may miss related entries.";

const NO_CONTEXT: &str = "No journal context found for this question. \
Tell the user that no matching entries were found and do not invent past events.";

// ============================================================================
// Configuration
// ============================================================================

/// 프롬프트 설정
#[derive(Debug, Clone, Serialize)]
pub struct PromptConfig {
    /// 전체 프롬프트 토큰 예산
    pub token_budget: usize,
    /// 토큰 추정용 문자/토큰 비율
    pub chars_per_token: usize,
    /// 포함할 최근 대화 턴 수
    pub history_turns: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            token_budget: 2048,
            chars_per_token: 4,
            history_turns: 6,
        }
    }
}

// ============================================================================
// Types
// ============================================================================

/// 프롬프트에 실제로 들어간 엔트리
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    pub entry_id: String,
    pub title: String,
    /// YYYY-MM-DD
    pub date: String,
}

/// 완성된 프롬프트
#[derive(Debug, Clone, Serialize)]
pub struct Prompt {
    pub system: String,
    pub user: String,
    pub citations: Vec<Citation>,
    pub estimated_tokens: usize,
    /// 예산 때문에 빠진 스니펫/턴이 있음
    pub truncated: bool,
}

impl Prompt {
    /// completion 방식 런타임용 단일 문자열
    pub fn render(&self) -> String {
        render_parts(&self.system, &self.user)
    }

    pub fn cited_entry_ids(&self) -> Vec<String> {
        self.citations.iter().map(|c| c.entry_id.clone()).collect()
    }
}

// ============================================================================
// PromptBuilder
// ============================================================================

pub struct PromptBuilder {
    config: PromptConfig,
}

impl PromptBuilder {
    pub fn new(config: PromptConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PromptConfig {
        &self.config
    }

    /// ceil(chars / chars_per_token)
    pub fn estimate_tokens(&self, text: &str) -> usize {
        let per_token = self.config.chars_per_token.max(1);
        text.chars().count().div_ceil(per_token)
    }

    /// 프롬프트 생성
    ///
    /// `docs`는 순위 순서, `history`는 오래된 것부터.
    pub fn build(
        &self,
        question: &str,
        docs: &[RetrievedDoc],
        degraded: bool,
        history: &[ConversationTurn],
    ) -> Prompt {
        let budget = self.config.token_budget;

        let system = if degraded {
            format!("{}\n{}", SYSTEM_INSTRUCTION, DEGRADED_NOTE)
        } else {
            SYSTEM_INSTRUCTION.to_string()
        };

        let fits = |blocks: &[String], turns: &[String]| -> bool {
            let user = assemble_user(question, blocks, turns);
            self.estimate_tokens(&render_parts(&system, &user)) <= budget
        };

        let mut truncated = false;

        // 1. 스니펫 - 순위 순서, 처음으로 넘치는 지점에서 중단
        let mut blocks: Vec<String> = Vec::new();
        let mut packed: Vec<&RetrievedDoc> = Vec::new();
        for doc in docs {
            let mut candidate = blocks.clone();
            candidate.push(snippet_block(blocks.len() + 1, doc));
            if !fits(&candidate, &[]) {
                truncated = true;
                break;
            }
            blocks = candidate;
            packed.push(doc);
        }

        // 2. 이전 대화 - 최신 턴 우선으로 고르고, 맞지 않는 턴은 통째로 건너뜀
        let start = history.len().saturating_sub(self.config.history_turns);
        let recent = &history[start..];
        let mut chosen: Vec<usize> = Vec::new();
        for (i, turn) in recent.iter().enumerate().rev() {
            let mut indices = chosen.clone();
            indices.push(i);
            indices.sort_unstable();
            let lines: Vec<String> = indices.iter().map(|&j| turn_line(&recent[j])).collect();
            if fits(&blocks, &lines) {
                chosen = indices;
            } else {
                tracing::debug!("Skipping conversation turn {} ({} chars)", turn.id, turn.content.len());
                truncated = true;
            }
        }
        let turns: Vec<String> = chosen.iter().map(|&j| turn_line(&recent[j])).collect();

        let user = assemble_user(question, &blocks, &turns);
        let estimated_tokens = self.estimate_tokens(&render_parts(&system, &user));

        let mut citations: Vec<Citation> = Vec::new();
        for doc in packed {
            if !citations.iter().any(|c| c.entry_id == doc.entry_id) {
                citations.push(Citation {
                    entry_id: doc.entry_id.clone(),
                    title: doc.title.clone(),
                    date: doc.date_label(),
                });
            }
        }

        Prompt {
            system,
            user,
            citations,
            estimated_tokens,
            truncated,
        }
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(PromptConfig::default())
    }
}

fn render_parts(system: &str, user: &str) -> String {
    format!("{}\n\n{}\n\nAssistant:", system, user)
}

fn snippet_block(number: usize, doc: &RetrievedDoc) -> String {
    format!("[{}] ({}, \"{}\")\n{}", number, doc.date_label(), doc.title, doc.text)
}

fn turn_line(turn: &ConversationTurn) -> String {
    let speaker = match turn.role {
        Role::User => "User",
        Role::Assistant => "Assistant",
    };
    format!("{}: {}", speaker, turn.content)
}

fn assemble_user(question: &str, blocks: &[String], turns: &[String]) -> String {
    let mut sections = Vec::with_capacity(3);
    if blocks.is_empty() {
        sections.push(NO_CONTEXT.to_string());
    } else {
        sections.push(format!("Journal excerpts:\n{}", blocks.join("\n\n")));
    }
    if !turns.is_empty() {
        sections.push(format!("Earlier in this conversation:\n{}", turns.join("\n")));
    }
    sections.push(format!("Question: {}", question));
    sections.join("\n\n")
}

// ============================================================================
// Tests
// ============================================================================
