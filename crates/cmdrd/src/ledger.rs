//! Execution ledger: the append-only audit trail.
//!
//! SQLite in WAL mode behind a single mutex-guarded connection, all access
//! on the blocking pool. Rows are inserted once and never updated or
//! deleted.

use cmdr_common::{CommanderError, ExecutionRecord, RiskTier};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS execution_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    target_id INTEGER NOT NULL,
    conversation_id INTEGER,
    command TEXT NOT NULL,
    risk_tier TEXT NOT NULL,
    confirmed INTEGER NOT NULL,
    stdout TEXT NOT NULL,
    stderr TEXT NOT NULL,
    exit_code INTEGER NOT NULL,
    started_at TEXT NOT NULL,
    duration_ms INTEGER NOT NULL
)";

pub struct ExecutionLedger {
    conn: Arc<Mutex<Connection>>,
}

impl ExecutionLedger {
    /// Open (or create) the ledger database at `path`.
    pub async fn open(path: &Path) -> Result<Self, CommanderError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let path: PathBuf = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, CommanderError> {
            let conn = Connection::open(&path)
                .map_err(|e| CommanderError::Ledger(format!("open failed: {e}")))?;
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(|e| CommanderError::Ledger(format!("WAL pragma failed: {e}")))?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(|e| CommanderError::Ledger(format!("synchronous pragma failed: {e}")))?;
            conn.execute(SCHEMA, [])
                .map_err(|e| CommanderError::Ledger(format!("schema init failed: {e}")))?;
            Ok(conn)
        })
        .await
        .map_err(|e| CommanderError::Ledger(format!("open task failed: {e}")))??;

        info!("Execution ledger ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory ledger for tests.
    pub async fn in_memory() -> Result<Self, CommanderError> {
        let conn = tokio::task::spawn_blocking(|| -> Result<Connection, CommanderError> {
            let conn = Connection::open_in_memory()
                .map_err(|e| CommanderError::Ledger(format!("open failed: {e}")))?;
            conn.execute(SCHEMA, [])
                .map_err(|e| CommanderError::Ledger(format!("schema init failed: {e}")))?;
            Ok(conn)
        })
        .await
        .map_err(|e| CommanderError::Ledger(format!("open task failed: {e}")))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Append one record, returning the assigned id.
    pub async fn append(&self, record: &ExecutionRecord) -> Result<i64, CommanderError> {
        let conn = Arc::clone(&self.conn);
        let record = record.clone();

        tokio::task::spawn_blocking(move || -> Result<i64, CommanderError> {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO execution_records
                 (user_id, target_id, conversation_id, command, risk_tier, confirmed,
                  stdout, stderr, exit_code, started_at, duration_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.user_id,
                    record.target_id,
                    record.conversation_id,
                    record.command,
                    record.risk_tier.as_str(),
                    record.confirmed,
                    record.stdout,
                    record.stderr,
                    record.exit_code,
                    record.started_at.to_rfc3339(),
                    record.duration_ms as i64,
                ],
            )
            .map_err(|e| CommanderError::Ledger(format!("append failed: {e}")))?;
            Ok(conn.last_insert_rowid())
        })
        .await
        .map_err(|e| CommanderError::Ledger(format!("append task failed: {e}")))?
    }

    /// Most-recent-first page of a user's records, optionally filtered by
    /// target.
    pub async fn query(
        &self,
        user_id: i64,
        target_id: Option<i64>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ExecutionRecord>, CommanderError> {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || -> Result<Vec<ExecutionRecord>, CommanderError> {
            let conn = conn.blocking_lock();
            let sql = match target_id {
                Some(_) => {
                    "SELECT id, user_id, target_id, conversation_id, command, risk_tier,
                            confirmed, stdout, stderr, exit_code, started_at, duration_ms
                     FROM execution_records
                     WHERE user_id = ?1 AND target_id = ?2
                     ORDER BY id DESC LIMIT ?3 OFFSET ?4"
                }
                None => {
                    "SELECT id, user_id, target_id, conversation_id, command, risk_tier,
                            confirmed, stdout, stderr, exit_code, started_at, duration_ms
                     FROM execution_records
                     WHERE user_id = ?1
                     ORDER BY id DESC LIMIT ?2 OFFSET ?3"
                }
            };

            let mut stmt = conn
                .prepare(sql)
                .map_err(|e| CommanderError::Ledger(format!("query prepare failed: {e}")))?;

            let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<ExecutionRecord> {
                let tier: String = row.get(5)?;
                let started_at: String = row.get(10)?;
                Ok(ExecutionRecord {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    target_id: row.get(2)?,
                    conversation_id: row.get(3)?,
                    command: row.get(4)?,
                    risk_tier: RiskTier::parse(&tier).unwrap_or(RiskTier::Low),
                    confirmed: row.get(6)?,
                    stdout: row.get(7)?,
                    stderr: row.get(8)?,
                    exit_code: row.get(9)?,
                    started_at: chrono::DateTime::parse_from_rfc3339(&started_at)
                        .map(|dt| dt.with_timezone(&chrono::Utc))
                        .unwrap_or_else(|_| chrono::Utc::now()),
                    duration_ms: row.get::<_, i64>(11)? as u64,
                })
            };

            let rows = match target_id {
                Some(target) => stmt
                    .query_map(
                        params![user_id, target, limit as i64, offset as i64],
                        map_row,
                    )
                    .map_err(|e| CommanderError::Ledger(format!("query failed: {e}")))?
                    .collect::<rusqlite::Result<Vec<_>>>(),
                None => stmt
                    .query_map(params![user_id, limit as i64, offset as i64], map_row)
                    .map_err(|e| CommanderError::Ledger(format!("query failed: {e}")))?
                    .collect::<rusqlite::Result<Vec<_>>>(),
            }
            .map_err(|e| CommanderError::Ledger(format!("row decode failed: {e}")))?;

            Ok(rows)
        })
        .await
        .map_err(|e| CommanderError::Ledger(format!("query task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(user_id: i64, target_id: i64, command: &str) -> ExecutionRecord {
        ExecutionRecord {
            id: 0,
            user_id,
            target_id,
            conversation_id: Some(1),
            command: command.to_string(),
            risk_tier: RiskTier::Medium,
            confirmed: true,
            stdout: "ok\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
            started_at: Utc::now(),
            duration_ms: 12,
        }
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_ids() {
        let ledger = ExecutionLedger::in_memory().await.unwrap();
        let first = ledger.append(&record(1, 7, "a")).await.unwrap();
        let second = ledger.append(&record(1, 7, "b")).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_query_most_recent_first() {
        let ledger = ExecutionLedger::in_memory().await.unwrap();
        ledger.append(&record(1, 7, "first")).await.unwrap();
        ledger.append(&record(1, 7, "second")).await.unwrap();

        let rows = ledger.query(1, None, 10, 0).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].command, "second");
        assert_eq!(rows[1].command, "first");
    }

    #[tokio::test]
    async fn test_query_filters_by_target_and_user() {
        let ledger = ExecutionLedger::in_memory().await.unwrap();
        ledger.append(&record(1, 7, "on-seven")).await.unwrap();
        ledger.append(&record(1, 8, "on-eight")).await.unwrap();
        ledger.append(&record(2, 7, "other-user")).await.unwrap();

        let rows = ledger.query(1, Some(7), 10, 0).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].command, "on-seven");

        let all = ledger.query(1, None, 10, 0).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_query_respects_limit_and_offset() {
        let ledger = ExecutionLedger::in_memory().await.unwrap();
        for i in 0..5 {
            ledger.append(&record(1, 7, &format!("cmd-{i}"))).await.unwrap();
        }

        let page = ledger.query(1, None, 2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].command, "cmd-4");

        let next = ledger.query(1, None, 2, 2).await.unwrap();
        assert_eq!(next[0].command, "cmd-2");
    }

    #[tokio::test]
    async fn test_round_trip_preserves_fields() {
        let ledger = ExecutionLedger::in_memory().await.unwrap();
        let mut r = record(1, 7, "systemctl restart nginx");
        r.exit_code = 3;
        r.stderr = "failed\n".to_string();
        ledger.append(&r).await.unwrap();

        let rows = ledger.query(1, Some(7), 1, 0).await.unwrap();
        let row = &rows[0];
        assert_eq!(row.risk_tier, RiskTier::Medium);
        assert!(row.confirmed);
        assert_eq!(row.exit_code, 3);
        assert_eq!(row.stderr, "failed\n");
        assert_eq!(row.conversation_id, Some(1));
    }

    #[tokio::test]
    async fn test_open_creates_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ledger.db");
        let ledger = ExecutionLedger::open(&path).await.unwrap();
        ledger.append(&record(1, 7, "a")).await.unwrap();
        assert!(path.exists());
    }
}
