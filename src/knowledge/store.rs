//! Index Store - rusqlite 기반 저널 인덱스 저장소
//!
//! 엔트리, 파생 청크, 두 개의 병렬 인덱스(FTS5 키워드 / 벡터 BLOB)를
//! 하나의 SQLite 파일에 보관합니다. 엔트리 단위 교체/삭제는 단일 트랜잭션입니다.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row};
use serde::Serialize;

use super::vector::{blob_to_vec, vec_to_blob, VectorCandidate};
use crate::journal::Entry;

// ============================================================================
// Types
// ============================================================================

/// 저장된 청크
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub id: String,
    pub entry_id: String,
    pub user_id: String,
    pub chunk_index: usize,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// 임베딩 소유자 종류 - 청크 벡터 또는 엔트리 전체 벡터
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingKind {
    Chunk,
    Entry,
}

impl EmbeddingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingKind::Chunk => "chunk",
            EmbeddingKind::Entry => "entry",
        }
    }

    fn parse(s: &str) -> Self {
        if s == "entry" {
            EmbeddingKind::Entry
        } else {
            EmbeddingKind::Chunk
        }
    }
}

/// 저장된 임베딩 (owner_id = chunk id 또는 entry id)
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub owner_id: String,
    pub entry_id: String,
    pub kind: EmbeddingKind,
    pub model_id: String,
    pub vector: Vec<f32>,
}

/// 엔트리 하나의 교체 단위 (새 청크 + 새 임베딩)
#[derive(Debug, Clone, Default)]
pub struct IndexSet {
    pub chunks: Vec<ChunkRecord>,
    pub embeddings: Vec<EmbeddingRecord>,
}

/// FTS5 청크 검색 결과
#[derive(Debug, Clone)]
pub struct ChunkKeywordHit {
    pub chunk_id: String,
    pub entry_id: String,
    pub chunk_index: usize,
    /// -bm25 (0 이상, 클수록 관련성 높음)
    pub relevance: f64,
}

/// FTS5 엔트리 검색 결과 (폴백 계층)
#[derive(Debug, Clone)]
pub struct EntryKeywordHit {
    pub entry_id: String,
    pub relevance: f64,
}

/// 검색 결과 구성을 위한 청크 + 엔트리 메타데이터
#[derive(Debug, Clone)]
pub struct ChunkView {
    pub chunk_id: String,
    pub entry_id: String,
    pub chunk_index: usize,
    pub text: String,
    pub title: String,
    pub entry_created_at: DateTime<Utc>,
}

/// 엔트리 인덱스 상태 (재인덱싱 생략 판단용)
#[derive(Debug, Clone, PartialEq)]
pub struct EntryIndexState {
    pub fingerprint: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub chunk_count: usize,
    pub keyword_only_chunks: usize,
}

/// 저장소 통계
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub user_count: usize,
    pub entry_count: usize,
    pub chunk_count: usize,
    pub embedding_count: usize,
    pub keyword_only_chunks: usize,
    pub active_model: Option<String>,
    pub db_path: PathBuf,
}

// ============================================================================
// IndexStore
// ============================================================================

/// Index Store
///
/// 커넥션은 짧게 잡는 뮤텍스 뒤에서 공유됩니다.
/// 청킹/임베딩 같은 느린 작업은 이 락 밖에서 수행해야 합니다.
#[derive(Clone)]
pub struct IndexStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl IndexStore {
    /// 저장소 열기 (없으면 생성)
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("Failed to open SQLite database")?;

        Self::from_connection(conn, path.to_path_buf())
    }

    /// 메모리 DB (테스트용)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn, PathBuf::from(":memory:"))
    }

    fn from_connection(conn: Connection, db_path: PathBuf) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
        };
        store.initialize()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// 같은 커넥션을 공유하는 다른 저장소(대화 로그)용
    pub(crate) fn shared_connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    /// 스키마 초기화
    fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("Failed to set pragmas")?;

        // 메모리 DB는 WAL을 지원하지 않음
        if self.db_path.as_os_str() != ":memory:" {
            conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
                .context("Failed to enable WAL")?;
        }

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entries (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL REFERENCES users(id),
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '',
                mood TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                fingerprint TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_entries_user ON entries(user_id, created_at);

            CREATE TABLE IF NOT EXISTS chunks (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                entry_id TEXT NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(entry_id, chunk_index)
            );
            CREATE INDEX IF NOT EXISTS idx_chunks_user ON chunks(user_id);

            CREATE TABLE IF NOT EXISTS embeddings (
                owner_id TEXT PRIMARY KEY,
                entry_id TEXT NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                model_id TEXT NOT NULL,
                dim INTEGER NOT NULL,
                vector BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_embeddings_entry ON embeddings(entry_id);
            CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(model_id);

            CREATE TABLE IF NOT EXISTS index_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .context("Failed to create index tables")?;

        // FTS5 가상 테이블 + 동기화 트리거
        // source: https://www.sqlite.org/fts5.html#external_content_tables
        conn.execute_batch(
            r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS chunk_fts USING fts5(
                text,
                content=chunks,
                content_rowid=seq,
                tokenize='porter unicode61'
            );

            CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
                INSERT INTO chunk_fts(rowid, text) VALUES (new.seq, new.text);
            END;

            CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
                INSERT INTO chunk_fts(chunk_fts, rowid, text)
                VALUES ('delete', old.seq, old.text);
            END;

            CREATE VIRTUAL TABLE IF NOT EXISTS entry_fts USING fts5(
                title,
                body,
                tags,
                content=entries,
                content_rowid=seq,
                tokenize='porter unicode61'
            );

            CREATE TRIGGER IF NOT EXISTS entries_ai AFTER INSERT ON entries BEGIN
                INSERT INTO entry_fts(rowid, title, body, tags)
                VALUES (new.seq, new.title, new.body, new.tags);
            END;

            CREATE TRIGGER IF NOT EXISTS entries_ad AFTER DELETE ON entries BEGIN
                INSERT INTO entry_fts(entry_fts, rowid, title, body, tags)
                VALUES ('delete', old.seq, old.title, old.body, old.tags);
            END;

            CREATE TRIGGER IF NOT EXISTS entries_au AFTER UPDATE ON entries BEGIN
                INSERT INTO entry_fts(entry_fts, rowid, title, body, tags)
                VALUES ('delete', old.seq, old.title, old.body, old.tags);
                INSERT INTO entry_fts(rowid, title, body, tags)
                VALUES (new.seq, new.title, new.body, new.tags);
            END;
            "#,
        )
        .context("Failed to create FTS5 index")?;

        tracing::debug!("Index store initialized at {:?}", self.db_path);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------------

    /// 엔트리와 파생 인덱스를 원자적으로 교체
    ///
    /// 이전 청크/임베딩/키워드 행을 지우고 새 세트를 넣는 것이 하나의 트랜잭션입니다.
    /// 실패하면 롤백되어 이전 버전이 그대로 남습니다.
    pub fn replace_entry_index(&self, entry: &Entry, fingerprint: &str, set: &IndexSet) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().context("Failed to begin swap transaction")?;

        tx.execute(
            "INSERT OR IGNORE INTO users (id, created_at) VALUES (?1, ?2)",
            params![entry.user_id, format_datetime(&Utc::now())],
        )
        .context("Failed to register user")?;

        let tags_json = serde_json::to_string(&entry.tags).context("Failed to encode tags")?;
        tx.execute(
            "INSERT INTO entries (id, user_id, title, body, tags, mood, created_at, updated_at, fingerprint)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                title = excluded.title,
                body = excluded.body,
                tags = excluded.tags,
                mood = excluded.mood,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                fingerprint = excluded.fingerprint",
            params![
                entry.id,
                entry.user_id,
                entry.title,
                entry.body,
                tags_json,
                entry.mood,
                format_datetime(&entry.created_at),
                format_datetime(&entry.updated_at),
                fingerprint,
            ],
        )
        .context("Failed to upsert entry")?;

        tx.execute("DELETE FROM embeddings WHERE entry_id = ?1", params![entry.id])
            .context("Failed to delete previous embeddings")?;
        tx.execute("DELETE FROM chunks WHERE entry_id = ?1", params![entry.id])
            .context("Failed to delete previous chunks")?;

        {
            let mut insert_chunk = tx.prepare(
                "INSERT INTO chunks (id, entry_id, user_id, chunk_index, text, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for chunk in &set.chunks {
                insert_chunk
                    .execute(params![
                        chunk.id,
                        chunk.entry_id,
                        chunk.user_id,
                        chunk.chunk_index as i64,
                        chunk.text,
                        format_datetime(&chunk.created_at),
                    ])
                    .context("Failed to insert chunk")?;
            }

            let mut insert_embedding = tx.prepare(
                "INSERT INTO embeddings (owner_id, entry_id, kind, model_id, dim, vector)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for record in &set.embeddings {
                insert_embedding
                    .execute(params![
                        record.owner_id,
                        record.entry_id,
                        record.kind.as_str(),
                        record.model_id,
                        record.vector.len() as i64,
                        vec_to_blob(&record.vector),
                    ])
                    .context("Failed to insert embedding")?;
            }
        }

        tx.commit().context("Failed to commit swap transaction")?;
        Ok(())
    }

    /// 엔트리와 모든 파생 데이터를 원자적으로 삭제
    pub fn delete_entry(&self, entry_id: &str) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().context("Failed to begin delete transaction")?;

        tx.execute("DELETE FROM embeddings WHERE entry_id = ?1", params![entry_id])?;
        tx.execute("DELETE FROM chunks WHERE entry_id = ?1", params![entry_id])?;
        let rows = tx.execute("DELETE FROM entries WHERE id = ?1", params![entry_id])?;

        tx.commit().context("Failed to commit delete transaction")?;
        Ok(rows > 0)
    }

    /// 엔트리 메타데이터만 갱신 (청크/임베딩은 그대로)
    ///
    /// 내용 지문이 같은 수정 이벤트에서 기분/날짜 변경을 반영합니다.
    pub fn update_entry_metadata(&self, entry: &Entry) -> Result<bool> {
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "UPDATE entries SET mood = ?2, created_at = ?3, updated_at = ?4 WHERE id = ?1",
                params![
                    entry.id,
                    entry.mood,
                    format_datetime(&entry.created_at),
                    format_datetime(&entry.updated_at),
                ],
            )
            .context("Failed to update entry metadata")?;
        Ok(rows > 0)
    }

    /// 활성 임베딩 모델 ID 기록
    pub fn set_active_model(&self, model_id: &str) -> Result<()> {
        self.set_meta("active_model", model_id)
    }

    /// 인덱스 프로필 기록 (청커 설정 등 청크 경계를 결정하는 값)
    pub fn set_index_profile(&self, profile: &str) -> Result<()> {
        self.set_meta("index_profile", profile)
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO index_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .with_context(|| format!("Failed to write index meta {}", key))?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------------

    pub fn active_model(&self) -> Result<Option<String>> {
        self.meta("active_model")
    }

    pub fn index_profile(&self) -> Result<Option<String>> {
        self.meta("index_profile")
    }

    fn meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM index_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn user_exists(&self, user_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let exists: i64 = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(exists != 0)
    }

    /// ID로 엔트리 조회
    pub fn get_entry(&self, entry_id: &str) -> Result<Option<Entry>> {
        let conn = self.lock()?;
        let entry = conn
            .query_row(
                "SELECT id, user_id, title, body, tags, mood, created_at, updated_at
                 FROM entries WHERE id = ?1",
                params![entry_id],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// 사용자 엔트리 목록 (최신순)
    pub fn list_entries(&self, user_id: &str, limit: usize) -> Result<Vec<Entry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, title, body, tags, mood, created_at, updated_at
             FROM entries WHERE user_id = ?1
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![user_id, limit as i64], row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// 전체 엔트리 ID (모델 교체 시 재인덱싱용)
    pub fn all_entry_ids(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id FROM entries ORDER BY seq")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// 엔트리의 청크 (chunk_index 순)
    pub fn chunks_for_entry(&self, entry_id: &str) -> Result<Vec<ChunkRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, entry_id, user_id, chunk_index, text, created_at
             FROM chunks WHERE entry_id = ?1 ORDER BY chunk_index",
        )?;
        let chunks = stmt
            .query_map(params![entry_id], |row| {
                Ok(ChunkRecord {
                    id: row.get(0)?,
                    entry_id: row.get(1)?,
                    user_id: row.get(2)?,
                    chunk_index: row.get::<_, i64>(3)? as usize,
                    text: row.get(4)?,
                    created_at: get_datetime(row, 5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(chunks)
    }

    /// 엔트리의 임베딩 (owner_id 순)
    pub fn embeddings_for_entry(&self, entry_id: &str) -> Result<Vec<EmbeddingRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT owner_id, entry_id, kind, model_id, vector
             FROM embeddings WHERE entry_id = ?1 ORDER BY owner_id",
        )?;
        let records = stmt
            .query_map(params![entry_id], |row| {
                Ok(EmbeddingRecord {
                    owner_id: row.get(0)?,
                    entry_id: row.get(1)?,
                    kind: EmbeddingKind::parse(&row.get::<_, String>(2)?),
                    model_id: row.get(3)?,
                    vector: blob_to_vec(&row.get::<_, Vec<u8>>(4)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// chunk_index가 0부터 빈틈없이 이어지는지 확인
    pub fn verify_chunk_sequence(&self, entry_id: &str) -> Result<bool> {
        let chunks = self.chunks_for_entry(entry_id)?;
        Ok(chunks.iter().enumerate().all(|(i, c)| c.chunk_index == i))
    }

    /// 엔트리 인덱스 상태 (지문 + 키워드 전용 청크 수)
    pub fn entry_index_state(&self, entry_id: &str, model_id: &str) -> Result<Option<EntryIndexState>> {
        let conn = self.lock()?;
        let state = conn
            .query_row(
                "SELECT e.fingerprint, e.updated_at,
                        (SELECT COUNT(*) FROM chunks c WHERE c.entry_id = e.id),
                        (SELECT COUNT(*) FROM chunks c
                          WHERE c.entry_id = e.id
                            AND NOT EXISTS (SELECT 1 FROM embeddings v
                                             WHERE v.owner_id = c.id AND v.model_id = ?2))
                 FROM entries e WHERE e.id = ?1",
                params![entry_id, model_id],
                |row| {
                    Ok(EntryIndexState {
                        fingerprint: row.get(0)?,
                        updated_at: get_datetime(row, 1)?,
                        chunk_count: row.get::<_, i64>(2)? as usize,
                        keyword_only_chunks: row.get::<_, i64>(3)? as usize,
                    })
                },
            )
            .optional()?;
        Ok(state)
    }

    /// 현재 모델의 임베딩이 빠진 청크가 있는 엔트리
    pub fn entries_needing_backfill(&self, model_id: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT c.entry_id FROM chunks c
             WHERE NOT EXISTS (SELECT 1 FROM embeddings v
                               WHERE v.owner_id = c.id AND v.model_id = ?1)
             ORDER BY c.entry_id",
        )?;
        let ids = stmt
            .query_map(params![model_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// FTS5 청크 키워드 검색 (BM25)
    ///
    /// source: https://www.sqlite.org/fts5.html#the_bm25_function
    pub fn search_chunks_fts(&self, user_id: &str, fts_query: &str, limit: usize) -> Result<Vec<ChunkKeywordHit>> {
        if fts_query.is_empty() {
            return Ok(vec![]);
        }
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT c.id, c.entry_id, c.chunk_index, bm25(chunk_fts) AS score
            FROM chunk_fts
            JOIN chunks c ON c.seq = chunk_fts.rowid
            WHERE chunk_fts MATCH ?1 AND c.user_id = ?2
            ORDER BY score
            LIMIT ?3
            "#,
        )?;
        let hits = stmt
            .query_map(params![fts_query, user_id, limit as i64], |row| {
                Ok(ChunkKeywordHit {
                    chunk_id: row.get(0)?,
                    entry_id: row.get(1)?,
                    chunk_index: row.get::<_, i64>(2)? as usize,
                    relevance: (-row.get::<_, f64>(3)?).max(0.0),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Chunk keyword search failed")?;
        Ok(hits)
    }

    /// FTS5 엔트리 키워드 검색 (제목 가중치 2배)
    pub fn search_entries_fts(&self, user_id: &str, fts_query: &str, limit: usize) -> Result<Vec<EntryKeywordHit>> {
        if fts_query.is_empty() {
            return Ok(vec![]);
        }
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT e.id, bm25(entry_fts, 2.0, 1.0, 1.0) AS score
            FROM entry_fts
            JOIN entries e ON e.seq = entry_fts.rowid
            WHERE entry_fts MATCH ?1 AND e.user_id = ?2
            ORDER BY score
            LIMIT ?3
            "#,
        )?;
        let hits = stmt
            .query_map(params![fts_query, user_id, limit as i64], |row| {
                Ok(EntryKeywordHit {
                    entry_id: row.get(0)?,
                    relevance: (-row.get::<_, f64>(1)?).max(0.0),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Entry keyword search failed")?;
        Ok(hits)
    }

    /// 간단한 LIKE 검색 (FTS5 결과가 없을 때 마지막 폴백)
    pub fn search_like(&self, user_id: &str, keyword: &str, limit: usize) -> Result<Vec<String>> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Ok(vec![]);
        }
        let conn = self.lock()?;
        let pattern = format!("%{}%", escape_like(&keyword.to_lowercase()));
        let mut stmt = conn.prepare(
            r#"
            SELECT id FROM entries
            WHERE user_id = ?1
              AND (LOWER(title) LIKE ?2 ESCAPE '\' OR LOWER(body) LIKE ?2 ESCAPE '\')
            ORDER BY created_at DESC
            LIMIT ?3
            "#,
        )?;
        let ids = stmt
            .query_map(params![user_id, pattern, limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// 특정 모델로 만든 사용자 벡터 전체
    ///
    /// `EmbeddingKind::Entry`면 후보의 `chunk_id`는 엔트리 ID, `chunk_index`는 0입니다.
    pub fn vector_candidates(
        &self,
        user_id: &str,
        model_id: &str,
        kind: EmbeddingKind,
    ) -> Result<Vec<VectorCandidate>> {
        let conn = self.lock()?;
        let sql = match kind {
            EmbeddingKind::Chunk => {
                "SELECT c.id, c.entry_id, c.chunk_index, v.vector
                 FROM embeddings v
                 JOIN chunks c ON c.id = v.owner_id
                 WHERE c.user_id = ?1 AND v.model_id = ?2 AND v.kind = 'chunk'"
            }
            EmbeddingKind::Entry => {
                "SELECT e.id, e.id, 0, v.vector
                 FROM embeddings v
                 JOIN entries e ON e.id = v.owner_id
                 WHERE e.user_id = ?1 AND v.model_id = ?2 AND v.kind = 'entry'"
            }
        };
        let mut stmt = conn.prepare(sql)?;
        let candidates = stmt
            .query_map(params![user_id, model_id], |row| {
                Ok(VectorCandidate {
                    chunk_id: row.get(0)?,
                    entry_id: row.get(1)?,
                    chunk_index: row.get::<_, i64>(2)? as usize,
                    embedding: blob_to_vec(&row.get::<_, Vec<u8>>(3)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(candidates)
    }

    /// 청크 ID 목록을 현재 커밋된 청크+엔트리로 조회
    ///
    /// 삭제되었거나 교체된 버전의 청크는 결과에 포함되지 않습니다.
    pub fn hydrate_chunks(&self, user_id: &str, chunk_ids: &[String]) -> Result<HashMap<String, ChunkView>> {
        if chunk_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.lock()?;
        let placeholders = vec!["?"; chunk_ids.len()].join(",");
        let sql = format!(
            "SELECT c.id, c.entry_id, c.chunk_index, c.text, e.title, e.created_at
             FROM chunks c JOIN entries e ON e.id = c.entry_id
             WHERE e.user_id = ? AND c.id IN ({})",
            placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let bind = std::iter::once(user_id.to_string()).chain(chunk_ids.iter().cloned());
        let views = stmt
            .query_map(params_from_iter(bind), |row| {
                Ok(ChunkView {
                    chunk_id: row.get(0)?,
                    entry_id: row.get(1)?,
                    chunk_index: row.get::<_, i64>(2)? as usize,
                    text: row.get(3)?,
                    title: row.get(4)?,
                    entry_created_at: get_datetime(row, 5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(views.into_iter().map(|v| (v.chunk_id.clone(), v)).collect())
    }

    /// 엔트리 ID 목록을 현재 커밋된 엔트리로 조회
    pub fn hydrate_entries(&self, user_id: &str, entry_ids: &[String]) -> Result<HashMap<String, Entry>> {
        if entry_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.lock()?;
        let placeholders = vec!["?"; entry_ids.len()].join(",");
        let sql = format!(
            "SELECT id, user_id, title, body, tags, mood, created_at, updated_at
             FROM entries WHERE user_id = ? AND id IN ({})",
            placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let bind = std::iter::once(user_id.to_string()).chain(entry_ids.iter().cloned());
        let entries = stmt
            .query_map(params_from_iter(bind), row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries.into_iter().map(|e| (e.id.clone(), e)).collect())
    }

    /// 저장소 통계
    pub fn stats(&self) -> Result<StoreStats> {
        let active_model = self.active_model()?;
        let conn = self.lock()?;

        let count = |sql: &str| -> Result<usize> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };

        let keyword_only_chunks = match &active_model {
            Some(model) => conn.query_row(
                "SELECT COUNT(*) FROM chunks c
                 WHERE NOT EXISTS (SELECT 1 FROM embeddings v
                                   WHERE v.owner_id = c.id AND v.model_id = ?1)",
                params![model],
                |row| row.get::<_, i64>(0),
            )? as usize,
            None => count("SELECT COUNT(*) FROM chunks")?,
        };

        Ok(StoreStats {
            user_count: count("SELECT COUNT(*) FROM users")?,
            entry_count: count("SELECT COUNT(*) FROM entries")?,
            chunk_count: count("SELECT COUNT(*) FROM chunks")?,
            embedding_count: count("SELECT COUNT(*) FROM embeddings")?,
            keyword_only_chunks,
            active_model,
            db_path: self.db_path.clone(),
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 고정 폭 RFC3339 (나노초, Z) - 문자열 정렬이 시간 정렬과 일치
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// RFC3339 컬럼을 DateTime<Utc>로 읽기
///
/// 깨진 값은 현재 시각으로 대체하지 않고 변환 에러로 올립니다.
pub(crate) fn get_datetime(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            tracing::warn!("Corrupt timestamp in column {}: {:?}", idx, raw);
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
        })
}

/// LIKE 와일드카드가 문자 그대로 매칭되도록 백슬래시 이스케이프
fn escape_like(keyword: &str) -> String {
    let mut escaped = String::with_capacity(keyword.len());
    for c in keyword.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<Entry> {
    let tags_json: String = row.get(4)?;
    let tags: BTreeSet<String> = serde_json::from_str(&tags_json).unwrap_or_default();
    Ok(Entry {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        body: row.get(3)?,
        tags,
        mood: row.get(5)?,
        created_at: get_datetime(row, 6)?,
        updated_at: get_datetime(row, 7)?,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (TempDir, IndexStore) {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let store = IndexStore::open(&db_path).unwrap();
        (dir, store)
    }

    fn index_set(entry: &Entry, texts: &[&str], model: &str) -> IndexSet {
        let chunks: Vec<ChunkRecord> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| ChunkRecord {
                id: format!("{}:v:{}", entry.id, i),
                entry_id: entry.id.clone(),
                user_id: entry.user_id.clone(),
                chunk_index: i,
                text: t.to_string(),
                created_at: entry.updated_at,
            })
            .collect();
        let embeddings = chunks
            .iter()
            .map(|c| EmbeddingRecord {
                owner_id: c.id.clone(),
                entry_id: entry.id.clone(),
                kind: EmbeddingKind::Chunk,
                model_id: model.to_string(),
                vector: vec![1.0, 0.0],
            })
            .collect();
        IndexSet { chunks, embeddings }
    }

    #[test]
    fn test_replace_and_read_back() {
        let (_dir, store) = create_test_store();
        let mut entry = Entry::new("u1", "Morning", "coffee and sunrise");
        entry.tags.insert("calm".into());

        store
            .replace_entry_index(&entry, "fp1", &index_set(&entry, &["coffee and sunrise"], "m1"))
            .unwrap();

        let loaded = store.get_entry(&entry.id).unwrap().unwrap();
        assert_eq!(loaded.title, "Morning");
        assert!(loaded.tags.contains("calm"));
        assert_eq!(loaded.created_at, entry.created_at);
        assert!(store.user_exists("u1").unwrap());
        assert!(!store.user_exists("nobody").unwrap());

        assert_eq!(store.chunks_for_entry(&entry.id).unwrap().len(), 1);
        assert_eq!(store.embeddings_for_entry(&entry.id).unwrap().len(), 1);
    }

    #[test]
    fn test_replace_drops_previous_version() {
        let (_dir, store) = create_test_store();
        let entry = Entry::new("u1", "Long", "a b c");
        store
            .replace_entry_index(&entry, "fp1", &index_set(&entry, &["one", "two", "three"], "m1"))
            .unwrap();
        assert_eq!(store.chunks_for_entry(&entry.id).unwrap().len(), 3);

        let mut shorter = index_set(&entry, &["only"], "m1");
        shorter.chunks[0].id = format!("{}:w:0", entry.id);
        shorter.embeddings[0].owner_id = shorter.chunks[0].id.clone();
        store.replace_entry_index(&entry, "fp2", &shorter).unwrap();

        let chunks = store.chunks_for_entry(&entry.id).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "only");
        assert_eq!(store.embeddings_for_entry(&entry.id).unwrap().len(), 1);
        assert!(store.verify_chunk_sequence(&entry.id).unwrap());

        // 이전 청크 텍스트는 키워드 인덱스에서도 사라져야 함
        assert!(store.search_chunks_fts("u1", "\"three\"", 10).unwrap().is_empty());
        assert_eq!(store.search_chunks_fts("u1", "\"only\"", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_swap_keeps_previous_version() {
        let (_dir, store) = create_test_store();
        let entry = Entry::new("u1", "Title", "body");
        store
            .replace_entry_index(&entry, "fp1", &index_set(&entry, &["first"], "m1"))
            .unwrap();

        // 같은 chunk_index 중복 -> UNIQUE 위반으로 트랜잭션 실패
        let mut broken = index_set(&entry, &["x", "y"], "m1");
        broken.chunks[1].chunk_index = 0;
        assert!(store.replace_entry_index(&entry, "fp2", &broken).is_err());

        let chunks = store.chunks_for_entry(&entry.id).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "first");
        let state = store.entry_index_state(&entry.id, "m1").unwrap().unwrap();
        assert_eq!(state.fingerprint.as_deref(), Some("fp1"));
    }

    #[test]
    fn test_delete_entry_cascades() {
        let (_dir, store) = create_test_store();
        let entry = Entry::new("u1", "Gone", "soon deleted");
        store
            .replace_entry_index(&entry, "fp", &index_set(&entry, &["soon deleted"], "m1"))
            .unwrap();

        assert!(store.delete_entry(&entry.id).unwrap());
        assert!(store.get_entry(&entry.id).unwrap().is_none());
        assert!(store.chunks_for_entry(&entry.id).unwrap().is_empty());
        assert!(store.embeddings_for_entry(&entry.id).unwrap().is_empty());
        assert!(store.search_chunks_fts("u1", "\"deleted\"", 10).unwrap().is_empty());
        assert!(store.search_entries_fts("u1", "\"gone\"", 10).unwrap().is_empty());
        assert!(!store.delete_entry(&entry.id).unwrap());
    }

    #[test]
    fn test_keyword_search_is_user_scoped_and_stemmed() {
        let (_dir, store) = create_test_store();
        let mine = Entry::new("u1", "Thanks", "I am grateful for friends");
        let theirs = Entry::new("u2", "Thanks", "grateful for the weather");
        store
            .replace_entry_index(&mine, "a", &index_set(&mine, &["I am grateful for friends"], "m1"))
            .unwrap();
        store
            .replace_entry_index(&theirs, "b", &index_set(&theirs, &["grateful for the weather"], "m1"))
            .unwrap();

        let hits = store.search_chunks_fts("u1", "\"grateful\"", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry_id, mine.id);
        assert!(hits[0].relevance >= 0.0);

        // porter 토크나이저: friend -> friends
        assert_eq!(store.search_chunks_fts("u1", "\"friend\"", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_vector_candidates_filter_model() {
        let (_dir, store) = create_test_store();
        let entry = Entry::new("u1", "T", "b");
        store
            .replace_entry_index(&entry, "fp", &index_set(&entry, &["b"], "old-model"))
            .unwrap();

        assert_eq!(
            store.vector_candidates("u1", "old-model", EmbeddingKind::Chunk).unwrap().len(),
            1
        );
        assert!(store
            .vector_candidates("u1", "new-model", EmbeddingKind::Chunk)
            .unwrap()
            .is_empty());
        assert!(store
            .vector_candidates("u1", "old-model", EmbeddingKind::Entry)
            .unwrap()
            .is_empty());
        assert_eq!(store.entries_needing_backfill("new-model").unwrap(), vec![entry.id.clone()]);
        assert!(store.entries_needing_backfill("old-model").unwrap().is_empty());
    }

    #[test]
    fn test_hydrate_skips_missing() {
        let (_dir, store) = create_test_store();
        let entry = Entry::new("u1", "T", "b");
        let set = index_set(&entry, &["b"], "m1");
        store.replace_entry_index(&entry, "fp", &set).unwrap();

        let ids = vec![set.chunks[0].id.clone(), "missing:0".to_string()];
        let views = store.hydrate_chunks("u1", &ids).unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[&set.chunks[0].id].title, "T");

        assert!(store.hydrate_chunks("u2", &ids).unwrap().is_empty());
    }

    #[test]
    fn test_search_like_and_stats() {
        let (_dir, store) = create_test_store();
        let entry = Entry::new("u1", "Gym", "Leg day was brutal");
        store.replace_entry_index(&entry, "fp", &IndexSet::default()).unwrap();
        store.set_active_model("m1").unwrap();

        assert_eq!(store.search_like("u1", "BRUTAL", 10).unwrap(), vec![entry.id.clone()]);

        let stats = store.stats().unwrap();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.chunk_count, 0);
        assert_eq!(stats.active_model.as_deref(), Some("m1"));
    }

    #[test]
    fn test_entry_vector_candidates() {
        let (_dir, store) = create_test_store();
        let entry = Entry::new("u1", "Whole", "entire entry text");
        let mut set = index_set(&entry, &["entire entry text"], "m1");
        set.embeddings.push(EmbeddingRecord {
            owner_id: entry.id.clone(),
            entry_id: entry.id.clone(),
            kind: EmbeddingKind::Entry,
            model_id: "m1".into(),
            vector: vec![0.0, 1.0],
        });
        store.replace_entry_index(&entry, "fp", &set).unwrap();

        let whole = store.vector_candidates("u1", "m1", EmbeddingKind::Entry).unwrap();
        assert_eq!(whole.len(), 1);
        assert_eq!(whole[0].chunk_id, entry.id);
        assert_eq!(whole[0].embedding, vec![0.0, 1.0]);
        assert_eq!(store.vector_candidates("u1", "m1", EmbeddingKind::Chunk).unwrap().len(), 1);
        assert!(store.vector_candidates("u2", "m1", EmbeddingKind::Entry).unwrap().is_empty());
    }

    #[test]
    fn test_like_search_treats_wildcards_literally() {
        let (_dir, store) = create_test_store();
        let percent = Entry::new("u1", "Goals", "finished 100% of the list");
        let digits = Entry::new("u1", "Numbers", "counted 1000 sheep");
        let underscore = Entry::new("u1", "Code", "renamed a_b today");
        let plain = Entry::new("u1", "Letters", "wrote axb on the board");
        for entry in [&percent, &digits, &underscore, &plain] {
            store.replace_entry_index(entry, "fp", &IndexSet::default()).unwrap();
        }

        assert_eq!(store.search_like("u1", "100%", 10).unwrap(), vec![percent.id.clone()]);
        assert_eq!(store.search_like("u1", "a_b", 10).unwrap(), vec![underscore.id.clone()]);
        assert_eq!(escape_like(r"50%_\"), r"50\%\_\\");
    }

    #[test]
    fn test_update_entry_metadata_keeps_chunks() {
        let (_dir, store) = create_test_store();
        let mut entry = Entry::new("u1", "Mood", "same words");
        let set = index_set(&entry, &["same words"], "m1");
        store.replace_entry_index(&entry, "fp", &set).unwrap();

        entry.mood = Some("happy".into());
        entry.updated_at += chrono::Duration::seconds(5);
        assert!(store.update_entry_metadata(&entry).unwrap());

        let loaded = store.get_entry(&entry.id).unwrap().unwrap();
        assert_eq!(loaded.mood.as_deref(), Some("happy"));
        assert_eq!(loaded.updated_at, entry.updated_at);
        assert_eq!(store.chunks_for_entry(&entry.id).unwrap(), set.chunks);
        assert!(!store.update_entry_metadata(&Entry::new("u1", "x", "y")).unwrap());
    }

    #[test]
    fn test_corrupt_timestamp_is_an_error() {
        let (_dir, store) = create_test_store();
        let entry = Entry::new("u1", "Broken", "body");
        store.replace_entry_index(&entry, "fp", &IndexSet::default()).unwrap();

        store
            .lock()
            .unwrap()
            .execute(
                "UPDATE entries SET created_at = 'not-a-date' WHERE id = ?1",
                params![entry.id],
            )
            .unwrap();

        assert!(store.get_entry(&entry.id).is_err());
        assert!(store.list_entries("u1", 10).is_err());
    }

    #[test]
    fn test_index_meta_roundtrip() {
        let store = IndexStore::open_in_memory().unwrap();
        assert!(store.index_profile().unwrap().is_none());
        store.set_index_profile("window-500-50").unwrap();
        store.set_active_model("m1").unwrap();
        store.set_index_profile("window-100-10").unwrap();
        assert_eq!(store.index_profile().unwrap().as_deref(), Some("window-100-10"));
        assert_eq!(store.active_model().unwrap().as_deref(), Some("m1"));
    }

    #[test]
    fn test_in_memory_store() {
        let store = IndexStore::open_in_memory().unwrap();
        assert!(store.active_model().unwrap().is_none());
        assert_eq!(store.stats().unwrap().entry_count, 0);
    }
}
