//! 저널 엔트리 모델 및 CRUD 이벤트
//!
//! 엔트리 저장 자체는 외부 협력자가 담당합니다.
//! 인덱서는 변경 이벤트(생성/수정/삭제)만 구독합니다.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Entry
// ============================================================================

/// 저널 엔트리 (변경 직후의 전체 페이로드)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood: Option<String>,
    /// 태그 집합 (정렬된 상태로 유지 - 지문 계산이 결정적이도록)
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl Entry {
    /// 새 엔트리 생성 (id는 UUID v4)
    pub fn new(user_id: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            title: title.into(),
            body: body.into(),
            created_at: now,
            updated_at: now,
            mood: None,
            tags: BTreeSet::new(),
        }
    }

    /// 본문 수정 - updated_at 갱신
    pub fn edit_body(&mut self, body: impl Into<String>) {
        self.body = body.into();
        self.updated_at = Utc::now();
    }

    /// 인용 표시용 날짜 (YYYY-MM-DD)
    pub fn date_label(&self) -> String {
        self.created_at.format("%Y-%m-%d").to_string()
    }

    /// 키워드 인덱스용 태그 문자열
    pub fn tags_text(&self) -> String {
        self.tags.iter().cloned().collect::<Vec<_>>().join(" ")
    }
}

// ============================================================================
// EntryEvent
// ============================================================================

/// 엔트리 CRUD 이벤트
#[derive(Debug, Clone)]
pub enum EntryEvent {
    Created(Entry),
    Updated(Entry),
    Deleted { user_id: String, entry_id: String },
}

impl EntryEvent {
    pub fn entry_id(&self) -> &str {
        match self {
            EntryEvent::Created(entry) | EntryEvent::Updated(entry) => &entry.id,
            EntryEvent::Deleted { entry_id, .. } => entry_id,
        }
    }
}
