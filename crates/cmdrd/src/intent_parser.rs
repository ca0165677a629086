//! Intent parser: adapter over the AI text service.
//!
//! Serializes the message plus bounded recent history into one completion,
//! strips any code-fence wrapping from the reply, and parses it as a strict
//! JSON intent. The AI's self-reported risk tier is advisory; the tier in
//! the returned `Intent` always comes from the action table.

use cmdr_common::{
    ActionKind, AiClient, AiError, ChatMessage, CommanderError, Intent, RiskTier, Target,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Raw reply shape the AI must produce. Anything that does not parse into
/// this is an `IntentParse` failure, never a best-effort partial intent.
#[derive(Debug, Deserialize)]
struct RawIntent {
    action: String,
    #[serde(default)]
    command: String,
    #[serde(default, alias = "target_hint")]
    target: Option<String>,
    #[serde(default)]
    parameters: serde_json::Value,
    #[serde(default)]
    risk_tier: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    explanation: String,
}

pub struct IntentParser {
    ai: Arc<dyn AiClient>,
    max_history: usize,
}

impl IntentParser {
    pub fn new(ai: Arc<dyn AiClient>, max_history: usize) -> Self {
        Self { ai, max_history }
    }

    /// Interpret one operator message against recent history and the
    /// target inventory.
    pub async fn parse(
        &self,
        message: &str,
        history: &[ChatMessage],
        targets: &[Target],
    ) -> Result<Intent, CommanderError> {
        let system_prompt = build_system_prompt(targets);

        let start = history.len().saturating_sub(self.max_history);
        let mut messages: Vec<ChatMessage> = history[start..].to_vec();
        messages.push(ChatMessage::user(message));

        let reply = self
            .ai
            .complete(&system_prompt, &messages)
            .await
            .map_err(map_ai_error)?;

        let cleaned = strip_code_fences(&reply);
        let raw: RawIntent = serde_json::from_str(cleaned)
            .map_err(|e| CommanderError::IntentParse(format!("{e}: {cleaned:.120}")))?;

        let action = ActionKind::parse(&raw.action);
        let intent = Intent::new(
            message,
            action,
            raw.command,
            raw.target,
            raw.parameters,
            raw.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
            raw.explanation,
        );

        // The reported tier is advisory only; log when the table disagrees.
        if let Some(reported) = raw.risk_tier.as_deref().and_then(RiskTier::parse) {
            if reported != intent.risk_tier {
                warn!(
                    action = %action,
                    reported = %reported,
                    recomputed = %intent.risk_tier,
                    "AI-reported risk tier overridden by action table"
                );
            }
        }

        debug!(action = %intent.action, tier = %intent.risk_tier, "intent parsed");
        Ok(intent)
    }
}

fn map_ai_error(e: AiError) -> CommanderError {
    match e {
        AiError::Service { status, message } => CommanderError::IntentService { status, message },
        AiError::Timeout(secs) => CommanderError::IntentService {
            status: 503,
            message: format!("AI request timed out after {secs}s"),
        },
        AiError::Request(message) => CommanderError::IntentService {
            status: 503,
            message,
        },
        AiError::EmptyReply => CommanderError::IntentService {
            status: 503,
            message: "AI returned an empty reply".to_string(),
        },
    }
}

fn build_system_prompt(targets: &[Target]) -> String {
    let inventory = if targets.is_empty() {
        "(none registered)".to_string()
    } else {
        targets
            .iter()
            .map(|t| format!("- {} ({})", t.name, t.host))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "You are ChatOps Commander, an assistant that translates operator \
requests into server administration commands.\n\
Known servers:\n{inventory}\n\n\
Reply with ONLY a JSON object, no prose, matching exactly:\n\
{{\n\
  \"action\": \"status|read|list|query|start|stop|restart|deploy|configure|delete|destroy|unknown\",\n\
  \"command\": \"the shell command to run, or empty if none\",\n\
  \"target\": \"server name or host, or null\",\n\
  \"parameters\": {{}},\n\
  \"risk_tier\": \"low|medium|high|critical\",\n\
  \"confidence\": 0.0,\n\
  \"explanation\": \"one or two sentences describing what will happen\"\n\
}}\n\
Use action \"unknown\" with an empty command for requests that are not \
server administration."
    )
}

/// Drop a Markdown code fence around the reply, if present. Models wrap
/// JSON in ```json fences despite instructions often enough that this is
/// load-bearing.
fn strip_code_fences(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip the info string ("json") on the opening fence line.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().trim_end_matches("```").trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmdr_common::FakeAiClient;

    fn targets() -> Vec<Target> {
        vec![Target::new(7, "db-01", "10.0.0.5", 22, "ops", Some("pw".into()), None).unwrap()]
    }

    fn intent_json(action: &str, tier: &str) -> String {
        format!(
            r#"{{"action":"{action}","command":"systemctl restart nginx","target":"db-01",
                "parameters":{{}},"risk_tier":"{tier}","confidence":0.9,
                "explanation":"Restarts nginx."}}"#
        )
    }

    #[tokio::test]
    async fn test_parses_plain_json() {
        let ai = Arc::new(FakeAiClient::always(intent_json("restart", "medium")));
        let parser = IntentParser::new(ai, 10);

        let intent = parser.parse("restart nginx", &[], &targets()).await.unwrap();
        assert_eq!(intent.action, ActionKind::Restart);
        assert_eq!(intent.risk_tier, RiskTier::Medium);
        assert!(intent.requires_confirmation);
        assert_eq!(intent.target_hint.as_deref(), Some("db-01"));
    }

    #[tokio::test]
    async fn test_strips_code_fences() {
        let fenced = format!("```json\n{}\n```", intent_json("status", "low"));
        let ai = Arc::new(FakeAiClient::always(fenced));
        let parser = IntentParser::new(ai, 10);

        let intent = parser.parse("how is nginx", &[], &targets()).await.unwrap();
        assert_eq!(intent.action, ActionKind::Status);
    }

    #[tokio::test]
    async fn test_reported_tier_is_advisory_only() {
        // AI claims "low" for a restart; the table says medium.
        let ai = Arc::new(FakeAiClient::always(intent_json("restart", "low")));
        let parser = IntentParser::new(ai, 10);

        let intent = parser.parse("restart nginx", &[], &targets()).await.unwrap();
        assert_eq!(intent.risk_tier, RiskTier::Medium);
        assert!(intent.requires_confirmation);
    }

    #[tokio::test]
    async fn test_malformed_reply_is_parse_error() {
        let ai = Arc::new(FakeAiClient::always("Sure! I'll restart nginx for you."));
        let parser = IntentParser::new(ai, 10);

        let err = parser.parse("restart nginx", &[], &targets()).await.unwrap_err();
        assert!(matches!(err, CommanderError::IntentParse(_)));
    }

    #[tokio::test]
    async fn test_service_failure_propagates() {
        let ai = Arc::new(FakeAiClient::always_error(AiError::Service {
            status: 429,
            message: "rate limited".to_string(),
        }));
        let parser = IntentParser::new(ai, 10);

        let err = parser.parse("restart nginx", &[], &targets()).await.unwrap_err();
        assert!(matches!(
            err,
            CommanderError::IntentService { status: 429, .. }
        ));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let ai = Arc::new(FakeAiClient::always(intent_json("status", "low")));
        let parser = IntentParser::new(Arc::clone(&ai) as Arc<dyn AiClient>, 2);

        let history: Vec<ChatMessage> = (0..10)
            .map(|i| ChatMessage::user(format!("message {i}")))
            .collect();
        // Parses fine; the bound is exercised (only the tail is sent).
        parser.parse("status", &history, &targets()).await.unwrap();
        assert_eq!(ai.call_count(), 1);
    }

    #[test]
    fn test_strip_code_fences_variants() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  ```json\n{}\n```  "), "{}");
    }
}
