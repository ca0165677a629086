//! Orchestrator: the end-to-end request/response cycle.
//!
//! text → intent parser → risk gate → (confirmed) → session pool →
//! executor → ledger → natural-language explanation. Every taxonomy error
//! is recovered here and becomes a user-facing reply; nothing crashes the
//! process.

use crate::executor::{CommandExecutor, ExecutionRequest};
use crate::intent_parser::IntentParser;
use crate::pool::SessionPool;
use cmdr_common::{
    ChatMessage, CommanderError, ExecutionRecord, GateDecision, Intent, RiskGate, Target,
    TargetRepository,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Who is asking. Filled in by the external auth layer; the core never
/// queries identity state itself.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub user_id: i64,
    pub conversation_id: i64,
    /// Opaque role string ("admin", "operator"); carried for the audit
    /// trail and the conversation layer, not interpreted here.
    pub role: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// A command ran (exit code may still be non-zero).
    Executed,
    /// A risky intent is parked; the operator must confirm.
    ConfirmationRequested,
    /// A pending confirmation was declined or expired.
    Cancelled,
    /// Plain chat / unrecognized request; nothing touched a session.
    Informational,
    /// A stage failed; the text explains what happened.
    Error,
}

/// What goes back to the conversation layer.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub kind: ReplyKind,
    pub text: String,
    pub record: Option<ExecutionRecord>,
}

impl ChatReply {
    fn new(kind: ReplyKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            record: None,
        }
    }
}

pub struct Orchestrator {
    parser: IntentParser,
    gate: RiskGate,
    pool: Arc<SessionPool>,
    executor: CommandExecutor,
    targets: Arc<dyn TargetRepository>,
    /// Last target each conversation acted on, for hint-less follow-ups
    /// ("now restart it").
    last_target: Mutex<HashMap<i64, i64>>,
}

impl Orchestrator {
    pub fn new(
        parser: IntentParser,
        gate: RiskGate,
        pool: Arc<SessionPool>,
        executor: CommandExecutor,
        targets: Arc<dyn TargetRepository>,
    ) -> Self {
        Self {
            parser,
            gate,
            pool,
            executor,
            targets,
            last_target: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Handle one chat message for a conversation.
    pub async fn handle_message(
        &self,
        ctx: &RequestContext,
        text: &str,
        history: &[ChatMessage],
    ) -> ChatReply {
        // A pending confirmation intercepts yes/no before any parsing.
        if self.gate.has_pending(ctx.conversation_id) {
            if is_affirmation(text) {
                return match self.gate.confirm(ctx.conversation_id) {
                    Some(intent) => self.run_intent(ctx, intent, true).await,
                    None => ChatReply::new(
                        ReplyKind::Cancelled,
                        "That confirmation expired. Nothing was run — please repeat the request.",
                    ),
                };
            }
            if is_declination(text) {
                self.gate.cancel(ctx.conversation_id);
                return ChatReply::new(ReplyKind::Cancelled, "Okay, cancelled. Nothing was run.");
            }
            // Anything else falls through: a fresh intent supersedes the
            // pending one below.
        }

        let targets = self.targets.list(ctx.user_id).await;
        let intent = match self.parser.parse(text, history, &targets).await {
            Ok(intent) => intent,
            Err(CommanderError::IntentParse(reason)) => {
                warn!(conversation_id = ctx.conversation_id, %reason, "unparseable AI reply");
                Intent::unrecognized(text)
            }
            Err(e) => {
                warn!(conversation_id = ctx.conversation_id, error = %e, "intent service failed");
                return ChatReply::new(
                    ReplyKind::Error,
                    format!("✗ I couldn't reach the AI service ({e}). Please try again."),
                );
            }
        };

        if !intent.is_executable() {
            // Clear any stale confirmation: the operator has moved on.
            self.gate.cancel(ctx.conversation_id);
            let reply_text = if intent.explanation.is_empty() {
                "I couldn't map that to a server action.".to_string()
            } else {
                intent.explanation.clone()
            };
            return ChatReply::new(ReplyKind::Informational, reply_text);
        }

        // A fresh executable intent supersedes whatever was pending;
        // risky ones are re-parked by the gate below.
        self.gate.cancel(ctx.conversation_id);

        match self.gate.submit(ctx.conversation_id, intent) {
            GateDecision::Approved(intent) => self.run_intent(ctx, intent, false).await,
            GateDecision::NeedsConfirmation(intent) => {
                let where_ = intent
                    .target_hint
                    .as_deref()
                    .unwrap_or("the last-used server");
                ChatReply::new(
                    ReplyKind::ConfirmationRequested,
                    format!(
                        "⚠ This will run `{}` on {} (risk: {}). {} Reply \"yes\" to proceed or \"no\" to cancel.",
                        intent.command, where_, intent.risk_tier, intent.explanation
                    ),
                )
            }
        }
    }

    /// Approved path: resolve the target, execute, explain.
    async fn run_intent(&self, ctx: &RequestContext, intent: Intent, confirmed: bool) -> ChatReply {
        let target = match self.resolve_target(ctx, &intent).await {
            Some(target) => target,
            None => {
                let hint = intent.target_hint.as_deref().unwrap_or("");
                return ChatReply::new(
                    ReplyKind::Error,
                    if hint.is_empty() {
                        "✗ I couldn't tell which server this is for. Name one of your registered servers.".to_string()
                    } else {
                        format!("✗ No registered server matches \"{hint}\".")
                    },
                );
            }
        };

        self.last_target
            .lock()
            .unwrap()
            .insert(ctx.conversation_id, target.id);

        info!(
            user_id = ctx.user_id,
            conversation_id = ctx.conversation_id,
            role = %ctx.role,
            target_id = target.id,
            command = %intent.command,
            tier = %intent.risk_tier,
            confirmed,
            "executing"
        );

        let result = self
            .executor
            .execute(ExecutionRequest {
                user_id: ctx.user_id,
                conversation_id: Some(ctx.conversation_id),
                target: &target,
                command: &intent.command,
                risk_tier: intent.risk_tier,
                confirmed,
            })
            .await;

        match result {
            Ok(record) => {
                let text = summarize_outcome(&intent, &target, &record);
                ChatReply {
                    kind: ReplyKind::Executed,
                    text,
                    record: Some(record),
                }
            }
            Err(e) => {
                let mut text = format!(
                    "✗ Running `{}` on {} failed: {}.",
                    intent.command, target.name, e
                );
                if e.poisons_session() {
                    text.push_str(" The connection has been dropped; the next attempt will reconnect.");
                } else {
                    text.push_str(" Nothing was run.");
                }
                ChatReply::new(ReplyKind::Error, text)
            }
        }
    }

    async fn resolve_target(&self, ctx: &RequestContext, intent: &Intent) -> Option<Target> {
        if let Some(hint) = intent.target_hint.as_deref().filter(|h| !h.trim().is_empty()) {
            let targets = self.targets.list(ctx.user_id).await;
            return targets.into_iter().find(|t| t.matches_hint(hint));
        }

        let remembered = {
            let last = self.last_target.lock().unwrap();
            last.get(&ctx.conversation_id).copied()
        };
        match remembered {
            Some(target_id) => self.targets.get(target_id).await,
            None => None,
        }
    }
}

/// 2–4 sentence outcome explanation with an explicit success or failure
/// marker.
fn summarize_outcome(intent: &Intent, target: &Target, record: &ExecutionRecord) -> String {
    let snippet = |s: &str| {
        let line = s.lines().next().unwrap_or("").trim();
        if line.chars().count() > 200 {
            let mut cut: String = line.chars().take(200).collect();
            cut.push('…');
            cut
        } else {
            line.to_string()
        }
    };

    if record.succeeded() {
        let mut text = format!(
            "✓ Ran `{}` on {} in {}ms.",
            record.command, target.name, record.duration_ms
        );
        let out = snippet(&record.stdout);
        if !out.is_empty() {
            text.push_str(&format!(" Output: {out}"));
        }
        if !intent.explanation.is_empty() {
            text.push_str(&format!(" {}", intent.explanation));
        }
        text
    } else {
        let err = snippet(if record.stderr.is_empty() {
            &record.stdout
        } else {
            &record.stderr
        });
        let mut text = format!(
            "✗ `{}` on {} exited with code {}.",
            record.command, target.name, record.exit_code
        );
        if !err.is_empty() {
            text.push_str(&format!(" Error output: {err}"));
        }
        text.push_str(" The session is still connected; you can retry or adjust the command.");
        text
    }
}

fn normalize_short_reply(text: &str) -> String {
    text.trim()
        .trim_end_matches(['.', '!'])
        .to_ascii_lowercase()
}

fn is_affirmation(text: &str) -> bool {
    matches!(
        normalize_short_reply(text).as_str(),
        "yes" | "y" | "yes please" | "confirm" | "confirmed" | "proceed" | "do it" | "go ahead"
            | "ok" | "okay" | "sure"
    )
}

fn is_declination(text: &str) -> bool {
    matches!(
        normalize_short_reply(text).as_str(),
        "no" | "n" | "cancel" | "abort" | "stop" | "nope" | "don't" | "do not" | "negative"
    )
}
