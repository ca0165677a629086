//! Shared types for the ChatOps Commander core.
//!
//! Everything the daemon and its collaborators agree on lives here: the
//! error taxonomy, the target/credential model, structured intents with the
//! deterministic risk policy, the per-conversation confirmation gate, the
//! AI-client abstraction, and execution records.

pub mod ai_client;
pub mod error;
pub mod intent;
pub mod record;
pub mod risk_gate;
pub mod target;

pub use ai_client::{AiClient, AiConfig, AiError, ChatMessage, ChatRole, FakeAiClient, HttpAiClient};
pub use error::CommanderError;
pub use intent::{ActionKind, Intent, RiskTier};
pub use record::ExecutionRecord;
pub use risk_gate::{GateDecision, PendingConfirmation, RiskGate};
pub use target::{AuthMethod, InMemoryTargetStore, Target, TargetRepository};
