//! CLI 모듈
//!
//! journal-rag CLI 명령어 정의 및 구현
//!
//! 엔트리 저장은 원래 외부 협력자의 몫이지만, CLI는 그 역할을 대신해
//! CRUD 이벤트를 만들어 인덱서에 전달합니다.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::engine::{EngineError, JournalAssistant};
use crate::journal::{Entry, EntryEvent};
use crate::knowledge::{IndexOutcome, IndexReport};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "journal-rag")]
#[command(version, about = "온디바이스 저널 RAG 어시스턴트", long_about = None)]
pub struct Cli {
    /// 사용자 ID
    #[arg(short, long, global = true, default_value = "me")]
    pub user: String,

    /// 로컬 모델 런타임 없이 실행 (해싱 임베딩 + 대체 답변)
    #[arg(long, global = true)]
    pub offline: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 새 엔트리 작성
    Add {
        /// 제목
        #[arg(short, long)]
        title: String,

        /// 본문
        #[arg(short, long)]
        body: Option<String>,

        /// 본문 파일
        #[arg(long)]
        file: Option<PathBuf>,

        /// 태그 (여러 번 지정 가능)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// 기분
        #[arg(long)]
        mood: Option<String>,
    },

    /// 엔트리 수정
    Edit {
        /// 엔트리 ID
        id: String,

        #[arg(short, long)]
        title: Option<String>,

        #[arg(short, long)]
        body: Option<String>,

        #[arg(long)]
        file: Option<PathBuf>,

        /// 태그 교체
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// 엔트리 삭제
    Delete {
        /// 엔트리 ID
        id: String,
    },

    /// 엔트리 목록
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// 저널 검색 (답변 생성 없이)
    Search {
        query: String,

        #[arg(short, long, default_value = "5")]
        limit: usize,
    },

    /// 저널에 질문
    Ask {
        question: String,

        /// 이어갈 대화 ID
        #[arg(short, long)]
        conversation: Option<String>,

        /// 스트리밍 없이 한 번에 출력
        #[arg(long)]
        no_stream: bool,
    },

    /// 대화 목록 또는 특정 대화 내용
    History {
        /// 대화 ID (없으면 목록)
        #[arg(short, long)]
        conversation: Option<String>,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// 모델 변경 반영 및 누락 임베딩 보충
    Reindex,

    /// 상태 확인
    Status,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    let user = cli.user;
    let offline = cli.offline;

    match cli.command {
        Commands::Add {
            title,
            body,
            file,
            tags,
            mood,
        } => cmd_add(&user, offline, title, body, file, tags, mood).await,
        Commands::Edit {
            id,
            title,
            body,
            file,
            tags,
        } => cmd_edit(&user, offline, &id, title, body, file, tags).await,
        Commands::Delete { id } => cmd_delete(&user, offline, &id).await,
        Commands::List { limit } => cmd_list(&user, offline, limit).await,
        Commands::Search { query, limit } => cmd_search(&user, offline, &query, limit).await,
        Commands::Ask {
            question,
            conversation,
            no_stream,
        } => cmd_ask(&user, offline, &question, conversation, no_stream).await,
        Commands::History {
            conversation,
            limit,
        } => cmd_history(&user, offline, conversation, limit).await,
        Commands::Reindex => cmd_reindex(offline).await,
        Commands::Status => cmd_status(offline).await,
    }
}

/// 설정을 읽어 엔진 열기 (모델 변경 시 재인덱싱 포함)
async fn open_engine(offline: bool) -> Result<JournalAssistant> {
    let mut config = EngineConfig::from_env();
    if offline {
        config.runtime.offline = true;
    }

    let engine = JournalAssistant::open(config).context("엔진 초기화 실패")?;
    let report = engine.sync_model().await.context("임베딩 모델 동기화 실패")?;
    if report.reindexed > 0 {
        println!(
            "[*] 인덱스 설정 변경 감지 ({} -> {}): {} 엔트리 재인덱싱",
            report.previous_profile.as_deref().unwrap_or("-"),
            report.current_profile,
            report.reindexed
        );
    }
    Ok(engine)
}

// ============================================================================
// Command Implementations
// ============================================================================

fn read_body(body: Option<String>, file: Option<PathBuf>) -> Result<Option<String>> {
    match (body, file) {
        (Some(_), Some(_)) => bail!("--body 와 --file 은 함께 쓸 수 없습니다"),
        (Some(body), None) => Ok(Some(body)),
        (None, Some(path)) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("파일 읽기 실패: {}", path.display()))?;
            Ok(Some(text))
        }
        (None, None) => Ok(None),
    }
}

fn print_report(report: &IndexReport) {
    if report.stale {
        println!("[!] 더 최신 버전이 이미 인덱싱되어 있습니다");
    } else if report.skipped {
        println!("[OK] 변경 없음 (청크 {} 개 유지)", report.chunk_count);
    } else {
        println!(
            "[OK] 인덱싱 완료: 청크 {}, 임베딩 {}, 키워드 전용 {}",
            report.chunk_count, report.embedded_chunks, report.keyword_only_chunks
        );
        if report.keyword_only_chunks > 0 {
            println!("     임베딩 런타임이 돌아오면 `journal-rag reindex` 로 보충하세요");
        }
    }
}

/// 엔트리 작성 (add)
async fn cmd_add(
    user: &str,
    offline: bool,
    title: String,
    body: Option<String>,
    file: Option<PathBuf>,
    tags: Vec<String>,
    mood: Option<String>,
) -> Result<()> {
    let body = read_body(body, file)?.unwrap_or_default();
    let engine = open_engine(offline).await?;

    let mut entry = Entry::new(user, title, body);
    entry.tags = tags.into_iter().collect();
    entry.mood = mood;

    let outcome = engine
        .indexer()
        .handle(EntryEvent::Created(entry.clone()))
        .await
        .context("엔트리 인덱싱 실패")?;

    println!("[OK] 엔트리가 추가되었습니다 (ID: {})", entry.id);
    if let IndexOutcome::Indexed(report) = outcome {
        print_report(&report);
    }
    Ok(())
}

/// 엔트리 수정 (edit)
async fn cmd_edit(
    user: &str,
    offline: bool,
    id: &str,
    title: Option<String>,
    body: Option<String>,
    file: Option<PathBuf>,
    tags: Vec<String>,
) -> Result<()> {
    let body = read_body(body, file)?;
    if title.is_none() && body.is_none() && tags.is_empty() {
        bail!("--title, --body, --file, --tag 중 하나 이상을 지정해야 합니다");
    }

    let engine = open_engine(offline).await?;
    let mut entry = engine.get_entry(id)?;
    if entry.user_id != user {
        bail!("ID {}인 엔트리를 찾을 수 없습니다", id);
    }

    if let Some(title) = title {
        entry.title = title;
    }
    if let Some(body) = body {
        entry.body = body;
    }
    if !tags.is_empty() {
        entry.tags = tags.into_iter().collect::<BTreeSet<_>>();
    }
    entry.updated_at = Utc::now();

    let outcome = engine
        .indexer()
        .handle(EntryEvent::Updated(entry))
        .await
        .context("엔트리 재인덱싱 실패")?;

    println!("[OK] 엔트리가 수정되었습니다 (ID: {})", id);
    if let IndexOutcome::Indexed(report) = outcome {
        print_report(&report);
    }
    Ok(())
}

/// 엔트리 삭제 (delete)
async fn cmd_delete(user: &str, offline: bool, id: &str) -> Result<()> {
    let engine = open_engine(offline).await?;

    let entry = engine.get_entry(id)?;
    if entry.user_id != user {
        bail!("ID {}인 엔트리를 찾을 수 없습니다", id);
    }

    let outcome = engine
        .indexer()
        .handle(EntryEvent::Deleted {
            user_id: user.to_string(),
            entry_id: id.to_string(),
        })
        .await
        .context("엔트리 삭제 실패")?;

    match outcome {
        IndexOutcome::Deleted { existed: true, .. } => {
            println!("[OK] 엔트리가 삭제되었습니다: {}", entry.title)
        }
        _ => println!("[!] 이미 삭제된 엔트리입니다"),
    }
    Ok(())
}

/// 목록 (list)
async fn cmd_list(user: &str, offline: bool, limit: usize) -> Result<()> {
    let engine = open_engine(offline).await?;
    let entries = engine
        .store()
        .list_entries(user, limit)
        .context("엔트리 목록 조회 실패")?;

    if entries.is_empty() {
        println!("[!] 저장된 엔트리가 없습니다.");
        return Ok(());
    }

    println!("[OK] 엔트리 ({} 건):\n", entries.len());
    for entry in entries {
        let tags = if entry.tags.is_empty() {
            "-".to_string()
        } else {
            entry.tags_text()
        };
        println!("  {} {}", entry.date_label(), truncate_text(&entry.title, 40));
        println!("        ID: {}", entry.id);
        println!(
            "        태그: {} | 기분: {} | {} chars",
            tags,
            entry.mood.as_deref().unwrap_or("-"),
            entry.body.chars().count()
        );
        println!();
    }
    Ok(())
}

/// 검색 (search)
async fn cmd_search(user: &str, offline: bool, query: &str, limit: usize) -> Result<()> {
    let engine = open_engine(offline).await?;

    println!("[*] 검색 중: \"{}\"", query);
    let retrieval = match engine.search(user, query, limit).await {
        Ok(r) => r,
        Err(EngineError::UnknownUser(_)) => {
            println!("\n[!] 아직 작성한 엔트리가 없습니다.");
            return Ok(());
        }
        Err(e) => return Err(e).context("검색 실패"),
    };

    if retrieval.degraded {
        println!("[!] 임베딩을 사용할 수 없어 키워드 검색만 사용했습니다");
    }
    if retrieval.docs.is_empty() {
        println!("\n[!] 검색 결과가 없습니다.");
        return Ok(());
    }

    println!("\n[OK] 검색 결과 ({} 건):\n", retrieval.docs.len());
    for (i, doc) in retrieval.docs.iter().enumerate() {
        println!(
            "{}. [점수: {:.4}] {} {}",
            i + 1,
            doc.score,
            doc.date_label(),
            doc.title
        );
        println!(
            "   키워드 {:.2} | 벡터 {:.2} | 최신성 {:.2}",
            doc.scores.keyword, doc.scores.vector, doc.scores.recency
        );
        println!("   내용: {}", truncate_text(&doc.text, 200));
        println!();
    }
    Ok(())
}

/// 질문 (ask)
async fn cmd_ask(
    user: &str,
    offline: bool,
    question: &str,
    conversation: Option<String>,
    no_stream: bool,
) -> Result<()> {
    let engine = open_engine(offline).await?;

    let response = if no_stream {
        let response = engine.ask(user, question, conversation.as_deref()).await;
        if let Ok(ref r) = response {
            println!("{}", r.answer);
        }
        response
    } else {
        let (tx, mut rx) = mpsc::channel::<String>(64);
        let printer = tokio::spawn(async move {
            let mut stdout = std::io::stdout();
            while let Some(token) = rx.recv().await {
                print!("{}", token);
                let _ = stdout.flush();
            }
            println!();
        });
        let response = engine
            .ask_stream(user, question, conversation.as_deref(), tx)
            .await;
        printer.await.context("출력 태스크 실패")?;
        response
    };

    let response = match response {
        Ok(r) => r,
        Err(EngineError::UnknownUser(_)) => {
            bail!("아직 작성한 엔트리가 없습니다. `journal-rag add` 로 먼저 작성하세요")
        }
        Err(e) => return Err(e).context("질문 처리 실패"),
    };

    println!();
    if !response.cited_entries.is_empty() {
        println!("[참고한 엔트리]");
        for cited in &response.cited_entries {
            println!("  - {} {} ({})", cited.date, cited.title, cited.entry_id);
        }
    }
    if response.degraded {
        println!("[!] 제한된 모드로 답변했습니다 (키워드 검색만 사용했거나 모델을 쓸 수 없음)");
    }
    println!("[대화 ID] {}", response.conversation_id);
    Ok(())
}

/// 대화 기록 (history)
async fn cmd_history(
    user: &str,
    offline: bool,
    conversation: Option<String>,
    limit: usize,
) -> Result<()> {
    let engine = open_engine(offline).await?;

    let Some(conversation_id) = conversation else {
        let conversations = engine.list_conversations(user)?;
        if conversations.is_empty() {
            println!("[!] 대화 기록이 없습니다.");
            return Ok(());
        }
        println!("[OK] 대화 ({} 건):\n", conversations.len());
        for c in conversations.iter().take(limit) {
            println!(
                "  {} | {} 턴 | {}",
                c.last_activity.format("%Y-%m-%d %H:%M"),
                c.turn_count,
                truncate_text(c.first_question.as_deref().unwrap_or("-"), 50)
            );
            println!("        ID: {}", c.conversation_id);
        }
        return Ok(());
    };

    let turns = engine.history(&conversation_id, limit)?;
    if turns.is_empty() {
        println!("[!] 대화를 찾을 수 없습니다: {}", conversation_id);
        return Ok(());
    }
    for turn in turns {
        let speaker = match turn.role {
            crate::knowledge::Role::User => "나",
            crate::knowledge::Role::Assistant => "AI",
        };
        println!(
            "[{}] {}: {}",
            turn.timestamp.format("%Y-%m-%d %H:%M"),
            speaker,
            turn.content
        );
    }
    Ok(())
}

/// 재인덱싱 (reindex)
async fn cmd_reindex(offline: bool) -> Result<()> {
    // open_engine 에서 모델 변경은 이미 반영됨
    let engine = open_engine(offline).await?;

    println!("[*] 누락된 임베딩 보충 중...");
    let completed = engine.indexer().backfill().await.context("보충 실패")?;
    println!("[OK] {} 엔트리 임베딩 완료", completed);

    let stats = engine.store().stats()?;
    if stats.keyword_only_chunks > 0 {
        println!(
            "[!] 아직 키워드 전용 청크 {} 개 (임베딩 런타임 확인 필요)",
            stats.keyword_only_chunks
        );
    }
    Ok(())
}

/// 상태 확인 (status)
async fn cmd_status(offline: bool) -> Result<()> {
    let mut config = EngineConfig::from_env();
    if offline {
        config.runtime.offline = true;
    }

    println!("journal-rag 상태\n");
    println!("[*] 데이터 디렉토리: {}", config.data_dir.display());
    if config.runtime.offline {
        println!("[*] 런타임: 오프라인 (해싱 임베딩)");
    } else {
        println!(
            "[*] 런타임: {} (임베딩 {}, 채팅 {})",
            config.runtime.ollama_url, config.runtime.embed_model, config.runtime.chat_model
        );
    }
    tracing::debug!(
        "Effective config: {}",
        serde_json::to_string(&config).unwrap_or_default()
    );

    let db_path = config.db_path();
    if !db_path.exists() {
        println!("[!] 아직 인덱스가 없습니다.");
        return Ok(());
    }

    match JournalAssistant::open(config) {
        Ok(engine) => match engine.store().stats() {
            Ok(stats) => {
                println!("[OK] 사용자: {} | 엔트리: {} 건", stats.user_count, stats.entry_count);
                println!(
                    "     청크: {} | 임베딩: {} | 키워드 전용: {}",
                    stats.chunk_count, stats.embedding_count, stats.keyword_only_chunks
                );
                println!(
                    "     활성 모델: {}",
                    stats.active_model.as_deref().unwrap_or("-")
                );
                if let Ok(meta) = std::fs::metadata(&db_path) {
                    println!("     DB 크기: {}", format_bytes(meta.len() as usize));
                }

                let mut broken = 0;
                for id in engine.store().all_entry_ids()? {
                    if !engine.store().verify_chunk_sequence(&id)? {
                        broken += 1;
                    }
                }
                if broken > 0 {
                    println!("[!] 청크 순서가 어긋난 엔트리 {} 건", broken);
                }
            }
            Err(e) => {
                println!("[!] 통계 조회 실패: {}", e);
            }
        },
        Err(e) => {
            println!("[!] 인덱스 열기 실패: {}", e);
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// 바이트 크기 포맷팅
fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================
