//! Remote shell transport.
//!
//! `Transport` is the seam between the session pool and the wire:
//! `Ssh2Transport` drives libssh2 from blocking tasks, `FakeTransport`
//! scripts connects and command results for tests. Neither knows about
//! pooling, risk, or the ledger.

use async_trait::async_trait;
use cmdr_common::{AuthMethod, CommanderError, Target};
use std::collections::HashMap;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Cap on captured output per stream, matching what a chat reply can
/// usefully carry.
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

/// A live remote shell connection.
#[async_trait]
pub trait RemoteHandle: Send + Sync + std::fmt::Debug {
    /// Run one command to completion, line-buffered. Non-zero exit is data,
    /// not an error; only transport failures return `Err`.
    async fn exec(&self, command: &str) -> Result<ExecOutput, CommanderError>;

    /// Tear the connection down. Idempotent.
    async fn close(&self);
}

/// Connection factory.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, target: &Target) -> Result<Box<dyn RemoteHandle>, CommanderError>;
}

// ---------------------------------------------------------------------------
// SSH implementation
// ---------------------------------------------------------------------------

/// libssh2-backed transport. All blocking calls run on the blocking pool.
pub struct Ssh2Transport {
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl Ssh2Transport {
    pub fn new(connect_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            command_timeout,
        }
    }
}

#[async_trait]
impl Transport for Ssh2Transport {
    async fn connect(&self, target: &Target) -> Result<Box<dyn RemoteHandle>, CommanderError> {
        let target = target.clone();
        let connect_timeout = self.connect_timeout;
        let command_timeout = self.command_timeout;

        let session = tokio::task::spawn_blocking(move || {
            connect_blocking(&target, connect_timeout, command_timeout)
        })
        .await
        .map_err(|e| CommanderError::Connection(format!("connect task failed: {e}")))??;

        Ok(Box::new(Ssh2Handle {
            session: Arc::new(Mutex::new(session)),
        }))
    }
}

fn connect_blocking(
    target: &Target,
    connect_timeout: Duration,
    command_timeout: Duration,
) -> Result<ssh2::Session, CommanderError> {
    let addr = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|e| CommanderError::Connection(format!("cannot resolve {}: {e}", target.host)))?
        .next()
        .ok_or_else(|| {
            CommanderError::Connection(format!("no address found for {}", target.host))
        })?;

    let tcp = TcpStream::connect_timeout(&addr, connect_timeout)
        .map_err(|e| CommanderError::Connection(format!("{}: {e}", target.host)))?;
    tcp.set_read_timeout(Some(connect_timeout)).ok();
    tcp.set_write_timeout(Some(connect_timeout)).ok();

    let mut session = ssh2::Session::new()
        .map_err(|e| CommanderError::Connection(format!("session init failed: {e}")))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| CommanderError::Connection(format!("handshake with {}: {e}", target.host)))?;

    match &target.auth {
        AuthMethod::Password(password) => session
            .userauth_password(&target.username, password)
            .map_err(|e| CommanderError::Connection(format!("password auth rejected: {e}")))?,
        AuthMethod::PrivateKey { key, passphrase } => session
            .userauth_pubkey_memory(&target.username, None, key, passphrase.as_deref())
            .map_err(|e| CommanderError::Connection(format!("key auth rejected: {e}")))?,
    }

    if !session.authenticated() {
        return Err(CommanderError::Connection(
            "authentication failed".to_string(),
        ));
    }

    session.set_keepalive(true, 30);
    // Bound blocking channel operations so a wedged server cannot hold the
    // worker thread forever.
    session.set_timeout(command_timeout.as_millis() as u32);

    debug!(target = %target.name, host = %target.host, "SSH session established");
    Ok(session)
}

struct Ssh2Handle {
    session: Arc<Mutex<ssh2::Session>>,
}

impl std::fmt::Debug for Ssh2Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ssh2Handle").finish_non_exhaustive()
    }
}

#[async_trait]
impl RemoteHandle for Ssh2Handle {
    async fn exec(&self, command: &str) -> Result<ExecOutput, CommanderError> {
        let session = Arc::clone(&self.session);
        let command = command.to_string();

        tokio::task::spawn_blocking(move || exec_blocking(&session, &command))
            .await
            .map_err(|e| CommanderError::Execution(format!("exec task failed: {e}")))?
    }

    async fn close(&self) {
        let session = Arc::clone(&self.session);
        let _ = tokio::task::spawn_blocking(move || {
            let session = session.lock().unwrap();
            if let Err(e) = session.disconnect(None, "closing", None) {
                debug!("SSH disconnect reported: {e}");
            }
        })
        .await;
    }
}

fn exec_blocking(
    session: &Mutex<ssh2::Session>,
    command: &str,
) -> Result<ExecOutput, CommanderError> {
    let started = Instant::now();
    let session = session.lock().unwrap();

    let mut channel = session
        .channel_session()
        .map_err(|e| CommanderError::Execution(format!("channel open failed: {e}")))?;
    channel
        .exec(command)
        .map_err(|e| CommanderError::Execution(format!("exec failed: {e}")))?;

    let mut stdout = String::new();
    (&mut channel)
        .take(MAX_OUTPUT_BYTES as u64)
        .read_to_string(&mut stdout)
        .map_err(|e| CommanderError::Execution(format!("stdout read failed: {e}")))?;

    let mut stderr = String::new();
    channel
        .stderr()
        .take(MAX_OUTPUT_BYTES as u64)
        .read_to_string(&mut stderr)
        .map_err(|e| CommanderError::Execution(format!("stderr read failed: {e}")))?;

    channel
        .wait_close()
        .map_err(|e| CommanderError::Execution(format!("channel close failed: {e}")))?;
    let exit_code = channel.exit_status().unwrap_or(-1);

    Ok(ExecOutput {
        stdout,
        stderr,
        exit_code,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

// ---------------------------------------------------------------------------
// Scripted transport for tests
// ---------------------------------------------------------------------------

/// Test transport: counts connects per target, optionally delays or fails
/// them, and scripts command results. Handles can be configured to die
/// after a number of execs to simulate a dropped session.
#[derive(Default)]
pub struct FakeTransport {
    connect_delay: Option<Duration>,
    dead_after: Option<usize>,
    connects: Mutex<HashMap<i64, usize>>,
    failing_targets: Mutex<HashMap<i64, String>>,
    scripted: Mutex<HashMap<String, ExecOutput>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every connect, widening the race window in pool tests.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    /// Handles stop working after `n` execs, then fail like a reset peer.
    pub fn with_dead_after(mut self, n: usize) -> Self {
        self.dead_after = Some(n);
        self
    }

    /// Make connects to `target_id` fail with `message`.
    pub fn fail_target(&self, target_id: i64, message: impl Into<String>) {
        self.failing_targets
            .lock()
            .unwrap()
            .insert(target_id, message.into());
    }

    pub fn clear_failure(&self, target_id: i64) {
        self.failing_targets.lock().unwrap().remove(&target_id);
    }

    /// Script the result of a specific command string.
    pub fn script(&self, command: impl Into<String>, output: ExecOutput) {
        self.scripted.lock().unwrap().insert(command.into(), output);
    }

    pub fn connect_count(&self, target_id: i64) -> usize {
        self.connects
            .lock()
            .unwrap()
            .get(&target_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, target: &Target) -> Result<Box<dyn RemoteHandle>, CommanderError> {
        *self.connects.lock().unwrap().entry(target.id).or_insert(0) += 1;

        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(message) = self.failing_targets.lock().unwrap().get(&target.id) {
            return Err(CommanderError::Connection(message.clone()));
        }

        Ok(Box::new(FakeHandle {
            scripted: self.scripted.lock().unwrap().clone(),
            dead_after: self.dead_after,
            execs: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug)]
struct FakeHandle {
    scripted: HashMap<String, ExecOutput>,
    dead_after: Option<usize>,
    execs: AtomicUsize,
    closed: AtomicBool,
}

#[async_trait]
impl RemoteHandle for FakeHandle {
    async fn exec(&self, command: &str) -> Result<ExecOutput, CommanderError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CommanderError::Execution(
                "connection already closed".to_string(),
            ));
        }

        let n = self.execs.fetch_add(1, Ordering::AcqRel);
        if let Some(limit) = self.dead_after {
            if n >= limit {
                warn!(command, "fake transport: simulating reset connection");
                return Err(CommanderError::Execution(
                    "connection reset by peer".to_string(),
                ));
            }
        }

        if let Some(output) = self.scripted.get(command) {
            return Ok(output.clone());
        }

        Ok(ExecOutput {
            stdout: format!("ran: {command}\n"),
            stderr: String::new(),
            exit_code: 0,
            duration_ms: 1,
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(id: i64) -> Target {
        Target::new(id, "t", "127.0.0.1", 22, "ops", Some("pw".into()), None).unwrap()
    }

    #[tokio::test]
    async fn test_fake_transport_counts_connects() {
        let transport = FakeTransport::new();
        let t = target(7);
        transport.connect(&t).await.unwrap();
        transport.connect(&t).await.unwrap();
        assert_eq!(transport.connect_count(7), 2);
        assert_eq!(transport.connect_count(8), 0);
    }

    #[tokio::test]
    async fn test_fake_transport_scripted_output() {
        let transport = FakeTransport::new();
        transport.script(
            "uptime",
            ExecOutput {
                stdout: "up 3 days\n".to_string(),
                stderr: String::new(),
                exit_code: 0,
                duration_ms: 5,
            },
        );

        let handle = transport.connect(&target(1)).await.unwrap();
        let out = handle.exec("uptime").await.unwrap();
        assert_eq!(out.stdout, "up 3 days\n");
    }

    #[tokio::test]
    async fn test_fake_transport_dead_handle() {
        let transport = FakeTransport::new().with_dead_after(1);
        let handle = transport.connect(&target(1)).await.unwrap();

        assert!(handle.exec("first").await.is_ok());
        let err = handle.exec("second").await.unwrap_err();
        assert!(matches!(err, CommanderError::Execution(_)));
    }

    #[tokio::test]
    async fn test_fake_transport_failing_target() {
        let transport = FakeTransport::new();
        transport.fail_target(3, "no route to host");

        let err = transport.connect(&target(3)).await.unwrap_err();
        assert!(matches!(err, CommanderError::Connection(_)));

        transport.clear_failure(3);
        assert!(transport.connect(&target(3)).await.is_ok());
    }
}
