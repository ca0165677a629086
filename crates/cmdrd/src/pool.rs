//! Session pool: at most one live connection per target.
//!
//! The pool's core correctness property is connect de-duplication: while a
//! connect for a target is in flight, every other `acquire` for that target
//! awaits the same attempt instead of dialing in parallel. The map lock is
//! held only for entry lookup and insertion, never across a connect, so
//! unrelated targets do not serialize against each other.

use crate::events::{EventBus, SessionEvent};
use crate::transport::{ExecOutput, RemoteHandle, Transport};
use cmdr_common::{CommanderError, Target};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// A live, reusable remote-shell connection to one target. Owned by the
/// pool, shared with executors through `Arc`.
#[derive(Debug)]
pub struct Session {
    target_id: i64,
    handle: Box<dyn RemoteHandle>,
    /// One in-flight command per session; remote shells do not multiplex
    /// command streams safely.
    exec_lock: tokio::sync::Mutex<()>,
    last_used: Mutex<Instant>,
}

impl Session {
    fn new(target_id: i64, handle: Box<dyn RemoteHandle>) -> Self {
        Self {
            target_id,
            handle,
            exec_lock: tokio::sync::Mutex::new(()),
            last_used: Mutex::new(Instant::now()),
        }
    }

    pub fn target_id(&self) -> i64 {
        self.target_id
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().unwrap().elapsed()
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap() = Instant::now();
    }

    /// Run one command, serialized with any other caller holding this
    /// session, bounded by `timeout`.
    pub async fn run(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, CommanderError> {
        let _guard = self.exec_lock.lock().await;
        self.touch();
        match tokio::time::timeout(timeout, self.handle.exec(command)).await {
            Ok(result) => result,
            Err(_) => Err(CommanderError::Timeout(
                timeout.as_secs(),
                format!("command `{command}`"),
            )),
        }
    }

    async fn close(&self) {
        self.handle.close().await;
    }
}

/// Result of probing a connection config outside the pool.
#[derive(Debug, Clone)]
pub struct ConnectionProbe {
    pub ok: bool,
    pub latency_ms: u64,
    pub message: String,
}

/// Outcome of an in-flight connect, shared with every waiter. `None` means
/// still connecting.
type ConnectOutcome = Option<Result<Arc<Session>, Arc<CommanderError>>>;

enum PoolEntry {
    Ready(Arc<Session>),
    /// Connect in flight; waiters watch for the shared outcome so every
    /// caller sees the same session or the same failure.
    Connecting(watch::Receiver<ConnectOutcome>),
}

/// Re-materialize a shared connect failure for one waiter, preserving the
/// variants callers branch on.
fn shared_error(e: &CommanderError) -> CommanderError {
    match e {
        CommanderError::PoolShuttingDown => CommanderError::PoolShuttingDown,
        CommanderError::Timeout(secs, what) => CommanderError::Timeout(*secs, what.clone()),
        CommanderError::Configuration(msg) => CommanderError::Configuration(msg.clone()),
        CommanderError::Connection(msg) => CommanderError::Connection(msg.clone()),
        other => CommanderError::Connection(other.to_string()),
    }
}

/// Owns zero-or-one live session per target id.
pub struct SessionPool {
    transport: Arc<dyn Transport>,
    entries: Mutex<HashMap<i64, PoolEntry>>,
    shutting_down: AtomicBool,
    connect_timeout: Duration,
    events: EventBus,
}

impl SessionPool {
    pub fn new(transport: Arc<dyn Transport>, connect_timeout: Duration, events: EventBus) -> Self {
        Self {
            transport,
            entries: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            connect_timeout,
            events,
        }
    }

    /// Acquire the session for a target, connecting lazily.
    ///
    /// Concurrent callers for the same target share a single connect
    /// attempt and receive the same session or the same error. A failed
    /// attempt evicts the entry so the next acquire retries cleanly.
    pub async fn acquire(&self, target: &Target) -> Result<Arc<Session>, CommanderError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(CommanderError::PoolShuttingDown);
        }

        enum Plan {
            Wait(watch::Receiver<ConnectOutcome>),
            Connect(watch::Sender<ConnectOutcome>),
        }

        let plan = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get(&target.id) {
                Some(PoolEntry::Ready(session)) => {
                    session.touch();
                    return Ok(Arc::clone(session));
                }
                Some(PoolEntry::Connecting(rx)) => Plan::Wait(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    entries.insert(target.id, PoolEntry::Connecting(rx));
                    Plan::Connect(tx)
                }
            }
        };

        match plan {
            Plan::Wait(rx) => self.await_inflight(target.id, rx).await,
            Plan::Connect(tx) => self.connect_and_publish(target, tx).await,
        }
    }

    async fn await_inflight(
        &self,
        target_id: i64,
        mut rx: watch::Receiver<ConnectOutcome>,
    ) -> Result<Arc<Session>, CommanderError> {
        debug!(target_id, "awaiting in-flight connect");
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return match outcome {
                    Ok(session) => {
                        session.touch();
                        Ok(session)
                    }
                    Err(e) => Err(shared_error(&e)),
                };
            }
            if rx.changed().await.is_err() {
                // Connect task dropped without publishing: pool shut down
                // underneath us or the task was aborted.
                return if self.shutting_down.load(Ordering::Acquire) {
                    Err(CommanderError::PoolShuttingDown)
                } else {
                    Err(CommanderError::Connection(
                        "connect attempt aborted".to_string(),
                    ))
                };
            }
        }
    }

    async fn connect_and_publish(
        &self,
        target: &Target,
        tx: watch::Sender<ConnectOutcome>,
    ) -> Result<Arc<Session>, CommanderError> {
        let attempt_id = uuid::Uuid::new_v4();
        info!(target_id = target.id, host = %target.host, %attempt_id, "connecting");
        let result = self.connect(target).await;

        let mut entries = self.entries.lock().unwrap();
        if self.shutting_down.load(Ordering::Acquire) {
            entries.remove(&target.id);
            drop(entries);
            let _ = tx.send(Some(Err(Arc::new(CommanderError::PoolShuttingDown))));
            if let Ok(session) = result {
                session.close().await;
            }
            return Err(CommanderError::PoolShuttingDown);
        }

        match result {
            Ok(session) => {
                entries.insert(target.id, PoolEntry::Ready(Arc::clone(&session)));
                drop(entries);
                let _ = tx.send(Some(Ok(Arc::clone(&session))));
                self.events.publish(SessionEvent::SshConnected {
                    target_id: target.id,
                });
                Ok(session)
            }
            Err(e) => {
                // Failed attempts are evicted; the next acquire retries.
                entries.remove(&target.id);
                drop(entries);
                warn!(target_id = target.id, %attempt_id, error = %e, "connect failed");
                let _ = tx.send(Some(Err(Arc::new(shared_error(&e)))));
                Err(e)
            }
        }
    }

    async fn connect(&self, target: &Target) -> Result<Arc<Session>, CommanderError> {
        let handle = match tokio::time::timeout(
            self.connect_timeout,
            self.transport.connect(target),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(CommanderError::Timeout(
                    self.connect_timeout.as_secs(),
                    format!("connect to {}", target.host),
                ))
            }
        };
        Ok(Arc::new(Session::new(target.id, handle)))
    }

    /// Drop a session that observed a transport-level failure so the next
    /// acquire reconnects instead of reusing a dead handle.
    pub async fn evict(&self, target_id: i64) {
        let removed = {
            let mut entries = self.entries.lock().unwrap();
            match entries.remove(&target_id) {
                Some(PoolEntry::Ready(session)) => Some(session),
                Some(other) => {
                    // A connect is in flight; leave it to conclude on its own.
                    entries.insert(target_id, other);
                    None
                }
                None => None,
            }
        };
        if let Some(session) = removed {
            info!(target_id, "evicting dead session");
            session.close().await;
            self.events
                .publish(SessionEvent::SshDisconnected { target_id });
        }
    }

    /// Explicit operator disconnect.
    pub async fn disconnect(&self, target_id: i64) {
        self.evict(target_id).await;
    }

    /// Whether a target currently has a connected session.
    pub fn is_connected(&self, target_id: i64) -> bool {
        matches!(
            self.entries.lock().unwrap().get(&target_id),
            Some(PoolEntry::Ready(_))
        )
    }

    /// Probe a connection config without registering anything in the pool
    /// and without touching the ledger.
    pub async fn test_connection(&self, target: &Target) -> ConnectionProbe {
        let started = Instant::now();
        let handle = match tokio::time::timeout(
            self.connect_timeout,
            self.transport.connect(target),
        )
        .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                return ConnectionProbe {
                    ok: false,
                    latency_ms: started.elapsed().as_millis() as u64,
                    message: e.to_string(),
                }
            }
            Err(_) => {
                return ConnectionProbe {
                    ok: false,
                    latency_ms: started.elapsed().as_millis() as u64,
                    message: format!("timed out after {}s", self.connect_timeout.as_secs()),
                }
            }
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let probe = match handle.exec("echo ok").await {
            Ok(out) if out.exit_code == 0 => ConnectionProbe {
                ok: true,
                latency_ms,
                message: "connection OK".to_string(),
            },
            Ok(out) => ConnectionProbe {
                ok: false,
                latency_ms,
                message: format!("probe command exited with {}", out.exit_code),
            },
            Err(e) => ConnectionProbe {
                ok: false,
                latency_ms,
                message: e.to_string(),
            },
        };
        handle.close().await;
        probe
    }

    /// Drain the pool at shutdown. New and pending acquires fail with
    /// `PoolShuttingDown`; live sessions are closed.
    pub async fn disconnect_all(&self) {
        self.shutting_down.store(true, Ordering::Release);

        let drained: Vec<(i64, PoolEntry)> = {
            let mut entries = self.entries.lock().unwrap();
            entries.drain().collect()
        };

        for (target_id, entry) in drained {
            if let PoolEntry::Ready(session) = entry {
                session.close().await;
                self.events
                    .publish(SessionEvent::SshDisconnected { target_id });
            }
        }
        info!("session pool drained");
    }
}
