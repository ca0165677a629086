//! Structured intents and the deterministic risk policy.
//!
//! The AI proposes an intent; the risk tier it reports is advisory only.
//! `RiskTier::for_action` is the single source of truth, recomputed from the
//! structured action so a manipulated or wrong classification can never
//! bypass confirmation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordinal risk classification governing confirmation requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskTier {
    /// The fixed action→tier table. Read-only actions are low, reversible
    /// service operations medium, deploys and configuration changes high,
    /// irreversible destruction critical.
    pub fn for_action(action: ActionKind) -> Self {
        match action {
            ActionKind::Status
            | ActionKind::Read
            | ActionKind::List
            | ActionKind::Query
            | ActionKind::Unknown => RiskTier::Low,
            ActionKind::Start | ActionKind::Stop | ActionKind::Restart => RiskTier::Medium,
            ActionKind::Deploy | ActionKind::Configure => RiskTier::High,
            ActionKind::Delete | ActionKind::Destroy => RiskTier::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Low => "low",
            RiskTier::Medium => "medium",
            RiskTier::High => "high",
            RiskTier::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(RiskTier::Low),
            "medium" => Some(RiskTier::Medium),
            "high" => Some(RiskTier::High),
            "critical" => Some(RiskTier::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of administrative actions the orchestrator understands.
/// Anything else degrades to `Unknown`, which is informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Status,
    Read,
    List,
    Query,
    Start,
    Stop,
    Restart,
    Deploy,
    Configure,
    Delete,
    Destroy,
    Unknown,
}

impl ActionKind {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "status" | "check" | "health" => ActionKind::Status,
            "read" | "show" | "view" | "cat" | "tail" => ActionKind::Read,
            "list" | "ls" => ActionKind::List,
            "query" | "info" | "inspect" => ActionKind::Query,
            "start" | "enable" => ActionKind::Start,
            "stop" | "disable" => ActionKind::Stop,
            "restart" | "reload" => ActionKind::Restart,
            "deploy" | "release" | "rollout" => ActionKind::Deploy,
            "configure" | "config" | "configuration-change" | "update-config" => {
                ActionKind::Configure
            }
            "delete" | "remove" | "rm" => ActionKind::Delete,
            "destroy" | "purge" | "wipe" => ActionKind::Destroy,
            _ => ActionKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Status => "status",
            ActionKind::Read => "read",
            ActionKind::List => "list",
            ActionKind::Query => "query",
            ActionKind::Start => "start",
            ActionKind::Stop => "stop",
            ActionKind::Restart => "restart",
            ActionKind::Deploy => "deploy",
            ActionKind::Configure => "configure",
            ActionKind::Delete => "delete",
            ActionKind::Destroy => "destroy",
            ActionKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The structured, risk-tagged interpretation of a free-text instruction.
///
/// Immutable once produced; one per user message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub raw_text: String,
    pub action: ActionKind,
    /// Concrete shell command the AI proposes; empty for informational
    /// intents that never reach a session.
    pub command: String,
    pub target_hint: Option<String>,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub risk_tier: RiskTier,
    pub requires_confirmation: bool,
    pub confidence: f32,
    pub explanation: String,
}

impl Intent {
    /// Build a normalized intent: the tier always comes from the action
    /// table, never from the caller.
    pub fn new(
        raw_text: impl Into<String>,
        action: ActionKind,
        command: impl Into<String>,
        target_hint: Option<String>,
        parameters: serde_json::Value,
        confidence: f32,
        explanation: impl Into<String>,
    ) -> Self {
        let risk_tier = RiskTier::for_action(action);
        Self {
            raw_text: raw_text.into(),
            action,
            command: command.into(),
            target_hint,
            parameters,
            risk_tier,
            requires_confirmation: risk_tier != RiskTier::Low,
            confidence,
            explanation: explanation.into(),
        }
    }

    /// Degraded intent for replies the parser could not understand.
    /// Low risk, no confirmation, no command.
    pub fn unrecognized(raw_text: impl Into<String>) -> Self {
        Self::new(
            raw_text,
            ActionKind::Unknown,
            "",
            None,
            serde_json::Value::Null,
            0.0,
            "I couldn't understand that request. Could you rephrase it?",
        )
    }

    /// Whether this intent carries a command to run on a target.
    pub fn is_executable(&self) -> bool {
        self.action != ActionKind::Unknown && !self.command.trim().is_empty()
    }
}
