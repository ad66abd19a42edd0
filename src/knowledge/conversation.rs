//! Conversation Log - 대화 턴 기록 (추가 전용)
//!
//! 인덱스 DB와 같은 SQLite 커넥션을 공유합니다.
//! 턴은 삽입 순서(seq)대로 유지되며 수정/삭제하지 않습니다.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use super::store::{format_datetime, get_datetime, IndexStore};

/// 발화자
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    fn parse(s: &str) -> Self {
        if s == "assistant" {
            Role::Assistant
        } else {
            Role::User
        }
    }
}

/// 대화 턴
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationTurn {
    pub id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub cited_entry_ids: Vec<String>,
}

impl ConversationTurn {
    pub fn user(conversation_id: &str, user_id: &str, content: impl Into<String>) -> Self {
        Self::new(conversation_id, user_id, Role::User, content.into(), vec![])
    }

    pub fn assistant(
        conversation_id: &str,
        user_id: &str,
        content: impl Into<String>,
        cited_entry_ids: Vec<String>,
    ) -> Self {
        Self::new(conversation_id, user_id, Role::Assistant, content.into(), cited_entry_ids)
    }

    fn new(
        conversation_id: &str,
        user_id: &str,
        role: Role,
        content: String,
        cited_entry_ids: Vec<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            role,
            content,
            timestamp: Utc::now(),
            cited_entry_ids,
        }
    }
}

/// 대화 목록 항목
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub turn_count: usize,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// 첫 사용자 질문
    pub first_question: Option<String>,
}

/// 대화 로그
#[derive(Clone)]
pub struct ConversationLog {
    conn: Arc<Mutex<Connection>>,
}

impl ConversationLog {
    /// 인덱스 저장소의 커넥션에 붙어 테이블 생성
    pub fn attach(store: &IndexStore) -> Result<Self> {
        let log = Self {
            conn: store.shared_connection(),
        };
        log.lock()?
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS conversation_turns (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    conversation_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    cited_entries TEXT NOT NULL DEFAULT '[]'
                );
                CREATE INDEX IF NOT EXISTS idx_turns_conversation
                    ON conversation_turns(conversation_id, seq);
                CREATE INDEX IF NOT EXISTS idx_turns_user ON conversation_turns(user_id);
                "#,
            )
            .context("Failed to create conversation table")?;
        Ok(log)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    /// 턴 추가
    pub fn append(&self, turn: &ConversationTurn) -> Result<()> {
        let cited = serde_json::to_string(&turn.cited_entry_ids)?;
        self.lock()?
            .execute(
                "INSERT INTO conversation_turns
                    (id, conversation_id, user_id, role, content, timestamp, cited_entries)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    turn.id,
                    turn.conversation_id,
                    turn.user_id,
                    turn.role.as_str(),
                    turn.content,
                    format_datetime(&turn.timestamp),
                    cited,
                ],
            )
            .context("Failed to append conversation turn")?;
        Ok(())
    }

    /// 최근 n개 턴 (오래된 것부터)
    pub fn recent(&self, conversation_id: &str, n: usize) -> Result<Vec<ConversationTurn>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, user_id, role, content, timestamp, cited_entries
             FROM conversation_turns
             WHERE conversation_id = ?1
             ORDER BY seq DESC
             LIMIT ?2",
        )?;
        let mut turns = stmt
            .query_map(params![conversation_id, n as i64], |row| {
                let cited: String = row.get(6)?;
                Ok(ConversationTurn {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    user_id: row.get(2)?,
                    role: Role::parse(&row.get::<_, String>(3)?),
                    content: row.get(4)?,
                    timestamp: get_datetime(row, 5)?,
                    cited_entry_ids: serde_json::from_str(&cited).unwrap_or_default(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        turns.reverse();
        Ok(turns)
    }

    /// 대화의 전체 턴 수
    pub fn turn_count(&self, conversation_id: &str) -> Result<usize> {
        let count: i64 = self.lock()?.query_row(
            "SELECT COUNT(*) FROM conversation_turns WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// 사용자의 대화 목록 (최근 활동순)
    pub fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT t.conversation_id,
                   COUNT(*),
                   MIN(t.timestamp),
                   MAX(t.timestamp),
                   (SELECT f.content FROM conversation_turns f
                     WHERE f.conversation_id = t.conversation_id AND f.role = 'user'
                     ORDER BY f.seq LIMIT 1),
                   MAX(t.seq) AS last_seq
            FROM conversation_turns t
            WHERE t.user_id = ?1
            GROUP BY t.conversation_id
            ORDER BY last_seq DESC
            "#,
        )?;
        let summaries = stmt
            .query_map(params![user_id], |row| {
                Ok(ConversationSummary {
                    conversation_id: row.get(0)?,
                    turn_count: row.get::<_, i64>(1)? as usize,
                    started_at: get_datetime(row, 2)?,
                    last_activity: get_datetime(row, 3)?,
                    first_question: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_log() -> (TempDir, ConversationLog) {
        let dir = TempDir::new().unwrap();
        let store = IndexStore::open(&dir.path().join("index.db")).unwrap();
        let log = ConversationLog::attach(&store).unwrap();
        (dir, log)
    }

    #[test]
    fn test_recent_returns_last_n_in_order() {
        let (_dir, log) = create_log();
        for i in 0..5 {
            log.append(&ConversationTurn::user("c1", "u1", format!("q{}", i)))
                .unwrap();
        }

        let recent = log.recent("c1", 3).unwrap();
        let contents: Vec<_> = recent.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["q2", "q3", "q4"]);
        assert_eq!(log.turn_count("c1").unwrap(), 5);
        assert!(log.recent("other", 3).unwrap().is_empty());
    }

    #[test]
    fn test_assistant_turn_keeps_citations() {
        let (_dir, log) = create_log();
        log.append(&ConversationTurn::user("c1", "u1", "what happened?"))
            .unwrap();
        log.append(&ConversationTurn::assistant(
            "c1",
            "u1",
            "you went hiking",
            vec!["e1".into(), "e2".into()],
        ))
        .unwrap();

        let turns = log.recent("c1", 10).unwrap();
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns[1].cited_entry_ids, vec!["e1", "e2"]);
    }

    #[test]
    fn test_list_conversations() {
        let (_dir, log) = create_log();
        log.append(&ConversationTurn::user("old", "u1", "first question"))
            .unwrap();
        log.append(&ConversationTurn::assistant("old", "u1", "answer", vec![]))
            .unwrap();
        log.append(&ConversationTurn::user("new", "u1", "second question"))
            .unwrap();
        log.append(&ConversationTurn::user("theirs", "u2", "not mine"))
            .unwrap();

        let list = log.list_conversations("u1").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].conversation_id, "new");
        assert_eq!(list[1].turn_count, 2);
        assert_eq!(list[1].first_question.as_deref(), Some("first question"));
    }

    #[test]
    fn test_role_serde() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
    }
}
