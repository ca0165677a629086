//! Execution records — the rows of the append-only audit trail.

use crate::intent::RiskTier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One execution attempt against a target. Never mutated once written.
///
/// `id` is 0 until the ledger assigns one on append. Attempts that failed at
/// the transport layer carry the error text in `stderr` and exit code −1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: i64,
    pub user_id: i64,
    pub target_id: i64,
    pub conversation_id: Option<i64>,
    pub command: String,
    pub risk_tier: RiskTier,
    pub confirmed: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ExecutionRecord {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}
