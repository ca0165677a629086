//! Command executor: runs commands over pooled sessions and records every
//! attempt in the ledger.
//!
//! Non-zero exit codes are data for the caller; only transport-level
//! failures (timeout, reset, lost auth) surface as errors, and those evict
//! the session so the next request reconnects.

use crate::events::{EventBus, SessionEvent};
use crate::ledger::ExecutionLedger;
use crate::pool::SessionPool;
use cmdr_common::{CommanderError, ExecutionRecord, RiskTier, Target};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// One execution request, fully resolved by the orchestrator.
pub struct ExecutionRequest<'a> {
    pub user_id: i64,
    pub conversation_id: Option<i64>,
    pub target: &'a Target,
    pub command: &'a str,
    pub risk_tier: RiskTier,
    pub confirmed: bool,
}

/// Batched host diagnostics.
#[derive(Debug, Clone, Default)]
pub struct SystemInfo {
    pub hostname: String,
    pub uptime: String,
    pub memory: String,
    pub disk: String,
    pub cpu_cores: String,
}

pub struct CommandExecutor {
    pool: Arc<SessionPool>,
    ledger: Arc<ExecutionLedger>,
    events: EventBus,
    command_timeout: Duration,
}

impl CommandExecutor {
    pub fn new(
        pool: Arc<SessionPool>,
        ledger: Arc<ExecutionLedger>,
        events: EventBus,
        command_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            ledger,
            events,
            command_timeout,
        }
    }

    /// Execute one command and append exactly one ledger row, whatever the
    /// outcome. Returns the appended record on completion; transport-level
    /// failures return the error after the row is written.
    pub async fn execute(
        &self,
        request: ExecutionRequest<'_>,
    ) -> Result<ExecutionRecord, CommanderError> {
        let started_at = Utc::now();
        let started = std::time::Instant::now();

        let outcome = match self.pool.acquire(request.target).await {
            Ok(session) => session.run(request.command, self.command_timeout).await,
            Err(e) => Err(e),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let mut record = ExecutionRecord {
            id: 0,
            user_id: request.user_id,
            target_id: request.target.id,
            conversation_id: request.conversation_id,
            command: request.command.to_string(),
            risk_tier: request.risk_tier,
            confirmed: request.confirmed,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            started_at,
            duration_ms,
        };

        match outcome {
            Ok(output) => {
                record.stdout = output.stdout;
                record.stderr = output.stderr;
                record.exit_code = output.exit_code;
                record.duration_ms = duration_ms;
                record.id = self.ledger.append(&record).await?;

                info!(
                    target_id = request.target.id,
                    exit_code = record.exit_code,
                    duration_ms = record.duration_ms,
                    "command completed"
                );
                self.events.publish(SessionEvent::SshOutput {
                    target_id: request.target.id,
                    conversation_id: request.conversation_id,
                    command: record.command.clone(),
                    risk_tier: record.risk_tier,
                    exit_code: record.exit_code,
                });
                Ok(record)
            }
            Err(e) => {
                record.stderr = e.to_string();
                record.id = self.ledger.append(&record).await?;

                warn!(target_id = request.target.id, error = %e, "command failed");
                self.events.publish(SessionEvent::SshError {
                    target_id: request.target.id,
                    conversation_id: request.conversation_id,
                    command: record.command.clone(),
                    message: e.to_string(),
                });

                if e.poisons_session() {
                    self.pool.evict(request.target.id).await;
                }
                Err(e)
            }
        }
    }

    /// Batched diagnostics: independent short-lived commands issued
    /// concurrently, serialized at the session layer. Never recorded in the
    /// ledger — these are probes, not operator actions.
    pub async fn system_info(&self, target: &Target) -> Result<SystemInfo, CommanderError> {
        let session = self.pool.acquire(target).await?;
        let timeout = self.command_timeout;

        let (hostname, uptime, memory, disk, cpu_cores) = tokio::join!(
            session.run("hostname", timeout),
            session.run("uptime -p", timeout),
            session.run("free -h | grep Mem", timeout),
            session.run("df -h / | tail -1", timeout),
            session.run("nproc", timeout),
        );

        Ok(SystemInfo {
            hostname: hostname?.stdout.trim().to_string(),
            uptime: uptime?.stdout.trim().to_string(),
            memory: memory?.stdout.trim().to_string(),
            disk: disk?.stdout.trim().to_string(),
            cpu_cores: cpu_cores?.stdout.trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ExecOutput, FakeTransport};

    fn target(id: i64) -> Target {
        Target::new(id, "db-01", "10.0.0.5", 22, "ops", Some("pw".into()), None).unwrap()
    }

    async fn executor_with(transport: Arc<FakeTransport>) -> (CommandExecutor, Arc<ExecutionLedger>) {
        let events = EventBus::new();
        let pool = Arc::new(SessionPool::new(
            transport,
            Duration::from_secs(5),
            events.clone(),
        ));
        let ledger = Arc::new(ExecutionLedger::in_memory().await.unwrap());
        let executor = CommandExecutor::new(
            pool,
            Arc::clone(&ledger),
            events,
            Duration::from_secs(5),
        );
        (executor, ledger)
    }

    fn request<'a>(target: &'a Target, command: &'a str) -> ExecutionRequest<'a> {
        ExecutionRequest {
            user_id: 1,
            conversation_id: Some(3),
            target,
            command,
            risk_tier: RiskTier::Low,
            confirmed: false,
        }
    }

    #[tokio::test]
    async fn test_success_appends_one_record() {
        let transport = Arc::new(FakeTransport::new());
        let (executor, ledger) = executor_with(Arc::clone(&transport)).await;
        let t = target(7);

        let record = executor.execute(request(&t, "uptime")).await.unwrap();
        assert_eq!(record.exit_code, 0);
        assert!(record.id > 0);

        let rows = ledger.query(1, None, 10, 0).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].command, "uptime");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_data_not_error() {
        let transport = Arc::new(FakeTransport::new());
        transport.script(
            "false",
            ExecOutput {
                stdout: String::new(),
                stderr: "nope\n".to_string(),
                exit_code: 1,
                duration_ms: 2,
            },
        );
        let (executor, ledger) = executor_with(Arc::clone(&transport)).await;
        let t = target(7);

        let record = executor.execute(request(&t, "false")).await.unwrap();
        assert_eq!(record.exit_code, 1);
        assert!(!record.succeeded());

        let rows = ledger.query(1, None, 10, 0).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_appends_record_and_evicts() {
        let transport = Arc::new(FakeTransport::new().with_dead_after(0));
        let (executor, ledger) = executor_with(Arc::clone(&transport)).await;
        let t = target(7);

        let err = executor.execute(request(&t, "uptime")).await.unwrap_err();
        assert!(matches!(err, CommanderError::Execution(_)));

        // Exactly one row, carrying the failure.
        let rows = ledger.query(1, None, 10, 0).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].exit_code, -1);
        assert!(rows[0].stderr.contains("reset"));
    }

    #[tokio::test]
    async fn test_dead_session_reconnects_on_next_execute() {
        // First exec works, second hits a reset, third should reconnect.
        let transport = Arc::new(FakeTransport::new().with_dead_after(1));
        let (executor, _ledger) = executor_with(Arc::clone(&transport)).await;
        let t = target(7);

        assert!(executor.execute(request(&t, "one")).await.is_ok());
        assert!(executor.execute(request(&t, "two")).await.is_err());
        assert_eq!(transport.connect_count(7), 1);

        // Eviction happened; this acquire dials a fresh connection.
        assert!(executor.execute(request(&t, "three")).await.is_ok());
        assert_eq!(transport.connect_count(7), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_still_appends_record() {
        let transport = Arc::new(FakeTransport::new());
        transport.fail_target(7, "no route to host");
        let (executor, ledger) = executor_with(Arc::clone(&transport)).await;
        let t = target(7);

        let err = executor.execute(request(&t, "uptime")).await.unwrap_err();
        assert!(matches!(err, CommanderError::Connection(_)));

        let rows = ledger.query(1, None, 10, 0).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].stderr.contains("no route"));
    }

    #[tokio::test]
    async fn test_system_info_skips_ledger() {
        let transport = Arc::new(FakeTransport::new());
        transport.script(
            "hostname",
            ExecOutput {
                stdout: "db-01\n".to_string(),
                stderr: String::new(),
                exit_code: 0,
                duration_ms: 1,
            },
        );
        let (executor, ledger) = executor_with(Arc::clone(&transport)).await;
        let t = target(7);

        let info = executor.system_info(&t).await.unwrap();
        assert_eq!(info.hostname, "db-01");

        let rows = ledger.query(1, None, 10, 0).await.unwrap();
        assert!(rows.is_empty());
    }
}
