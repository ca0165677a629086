//! ChatOps Commander daemon.
//!
//! Wires the orchestration core together, then runs until interrupted.
//! The conversation layer (HTTP/websocket app) drives `Orchestrator`
//! through the library API; this binary owns lifecycle: config, logging,
//! the session pool, and a clean drain on shutdown.

use anyhow::Result;
use cmdrd::config::CommanderConfig;
use cmdrd::events::EventBus;
use cmdrd::executor::CommandExecutor;
use cmdrd::intent_parser::IntentParser;
use cmdrd::ledger::ExecutionLedger;
use cmdrd::orchestrator::Orchestrator;
use cmdrd::pool::SessionPool;
use cmdrd::transport::Ssh2Transport;
use cmdr_common::{HttpAiClient, InMemoryTargetStore, RiskGate, Target};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("cmdrd v{} starting", env!("CARGO_PKG_VERSION"));

    let config = CommanderConfig::load_or_default();

    let events = EventBus::new();
    let ledger = Arc::new(ExecutionLedger::open(Path::new(&config.ledger.db_path)).await?);

    let transport = Arc::new(Ssh2Transport::new(
        Duration::from_secs(config.ssh.connect_timeout_secs),
        Duration::from_secs(config.ssh.command_timeout_secs),
    ));
    let pool = Arc::new(SessionPool::new(
        transport,
        Duration::from_secs(config.ssh.connect_timeout_secs),
        events.clone(),
    ));

    let targets = Arc::new(InMemoryTargetStore::new());
    for entry in &config.targets {
        match Target::new(
            entry.id,
            entry.name.clone(),
            entry.host.clone(),
            entry.port,
            entry.username.clone(),
            entry.password.clone(),
            entry.private_key.clone(),
        ) {
            Ok(target) => targets.insert(entry.user_id, target).await,
            Err(e) => warn!(name = %entry.name, "skipping target: {e}"),
        }
    }

    let ai = Arc::new(HttpAiClient::new(config.ai.clone())?);
    let parser = IntentParser::new(ai, config.chat.max_history);
    let gate = RiskGate::new(Duration::from_secs(config.chat.confirmation_ttl_secs));
    let executor = CommandExecutor::new(
        Arc::clone(&pool),
        Arc::clone(&ledger),
        events.clone(),
        Duration::from_secs(config.ssh.command_timeout_secs),
    );

    // Handed to the conversation layer in the managed deployment.
    let _orchestrator = Arc::new(Orchestrator::new(
        parser,
        gate,
        Arc::clone(&pool),
        executor,
        targets,
    ));

    // Mirror session events into the log until the notification layer
    // attaches its own subscriber.
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            info!(?event, "session event");
        }
    });

    info!("cmdrd ready");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down: draining session pool");
    pool.disconnect_all().await;
    info!("Shutdown complete");

    Ok(())
}
