//! Per-conversation confirmation gate.
//!
//! Pure state machine: `Idle → AwaitingConfirmation → Approved | Cancelled
//! → Idle`. Intents that need no confirmation approve immediately. At most
//! one pending confirmation exists per conversation; a new
//! confirmation-requiring intent replaces it, last-write-wins.

use crate::intent::Intent;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Default lifetime of a pending confirmation before it counts as declined.
pub const DEFAULT_CONFIRMATION_TTL: Duration = Duration::from_secs(120);

/// A confirmation waiting for the operator's yes/no.
#[derive(Debug, Clone)]
pub struct PendingConfirmation {
    pub conversation_id: i64,
    pub intent: Intent,
    pub created_at: Instant,
}

/// Outcome of submitting an intent to the gate.
#[derive(Debug, Clone)]
pub enum GateDecision {
    /// Low-risk intent; execution may proceed immediately.
    Approved(Intent),
    /// The intent was parked; ask the operator before executing.
    NeedsConfirmation(Intent),
}

/// Holds pending-confirmation state for every conversation.
pub struct RiskGate {
    pending: Mutex<HashMap<i64, PendingConfirmation>>,
    ttl: Duration,
}

impl RiskGate {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Evaluate an intent for a conversation.
    ///
    /// The intent's tier has already been normalized from the action table
    /// (`Intent::new`), so the decision here is purely
    /// `requires_confirmation`.
    pub fn submit(&self, conversation_id: i64, intent: Intent) -> GateDecision {
        if !intent.requires_confirmation {
            return GateDecision::Approved(intent);
        }

        let mut pending = self.pending.lock().unwrap();
        if let Some(previous) = pending.insert(
            conversation_id,
            PendingConfirmation {
                conversation_id,
                intent: intent.clone(),
                created_at: Instant::now(),
            },
        ) {
            // Last-write-wins: a new risky intent supersedes the one still
            // waiting for an answer.
            info!(
                conversation_id,
                superseded = %previous.intent.command,
                replacement = %intent.command,
                "pending confirmation replaced by newer intent"
            );
        }

        GateDecision::NeedsConfirmation(intent)
    }

    /// The operator affirmed. Returns the approved intent, or `None` when
    /// nothing was pending (or it had already expired).
    pub fn confirm(&self, conversation_id: i64) -> Option<Intent> {
        let mut pending = self.pending.lock().unwrap();
        let entry = pending.remove(&conversation_id)?;
        if entry.created_at.elapsed() > self.ttl {
            debug!(conversation_id, "confirmation arrived after expiry");
            return None;
        }
        Some(entry.intent)
    }

    /// The operator declined (or the orchestrator is abandoning the
    /// confirmation). No side effects beyond clearing the state.
    pub fn cancel(&self, conversation_id: i64) -> Option<Intent> {
        self.pending
            .lock()
            .unwrap()
            .remove(&conversation_id)
            .map(|p| p.intent)
    }

    /// Whether a live (non-expired) confirmation is pending. Expired
    /// entries are swept here, transitioning to Cancelled with no side
    /// effects.
    pub fn has_pending(&self, conversation_id: i64) -> bool {
        let mut pending = self.pending.lock().unwrap();
        match pending.get(&conversation_id) {
            Some(entry) if entry.created_at.elapsed() > self.ttl => {
                pending.remove(&conversation_id);
                debug!(conversation_id, "pending confirmation expired");
                false
            }
            Some(_) => true,
            None => false,
        }
    }
}

impl Default for RiskGate {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIRMATION_TTL)
    }
}
