//! Target descriptors and the repository seam to the management layer.
//!
//! A target is a remote host plus exactly one authentication method. The
//! management layer (outside this core) creates and edits targets; the core
//! only reads them.

use crate::error::CommanderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Default SSH port when the descriptor omits one.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Authentication material for a target. The enum makes "exactly one of
/// password/key" structural rather than a runtime check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Password(String),
    PrivateKey {
        key: String,
        passphrase: Option<String>,
    },
}

/// A remote host descriptor with connection credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: i64,
    /// Human-facing name ("db-01"), used for target-hint resolution.
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
}

impl Target {
    /// Build a target from raw optional secrets, rejecting contradictory
    /// credentials before any network I/O.
    pub fn new(
        id: i64,
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: Option<String>,
        private_key: Option<String>,
    ) -> Result<Self, CommanderError> {
        let auth = match (password, private_key) {
            (Some(password), None) => AuthMethod::Password(password),
            (None, Some(key)) => AuthMethod::PrivateKey {
                key,
                passphrase: None,
            },
            (Some(_), Some(_)) => {
                return Err(CommanderError::Configuration(
                    "both password and private key are set; exactly one is required".to_string(),
                ))
            }
            (None, None) => {
                return Err(CommanderError::Configuration(
                    "no authentication method configured; set a password or a private key"
                        .to_string(),
                ))
            }
        };

        Ok(Self {
            id,
            name: name.into(),
            host: host.into(),
            port,
            username: username.into(),
            auth,
        })
    }

    /// Case-insensitive match against the name or host, for resolving the
    /// AI's target hint ("restart nginx on db-01").
    pub fn matches_hint(&self, hint: &str) -> bool {
        let hint = hint.trim();
        self.name.eq_ignore_ascii_case(hint) || self.host.eq_ignore_ascii_case(hint)
    }
}

/// Read-only view of the target store owned by the management layer.
#[async_trait]
pub trait TargetRepository: Send + Sync {
    async fn get(&self, id: i64) -> Option<Target>;
    async fn list(&self, user_id: i64) -> Vec<Target>;
}

/// In-memory target store for tests and the standalone daemon.
#[derive(Default)]
pub struct InMemoryTargetStore {
    targets: RwLock<HashMap<i64, (i64, Target)>>,
}

impl InMemoryTargetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user_id: i64, target: Target) {
        self.targets
            .write()
            .await
            .insert(target.id, (user_id, target));
    }
}

#[async_trait]
impl TargetRepository for InMemoryTargetStore {
    async fn get(&self, id: i64) -> Option<Target> {
        self.targets.read().await.get(&id).map(|(_, t)| t.clone())
    }

    async fn list(&self, user_id: i64) -> Vec<Target> {
        let mut targets: Vec<Target> = self
            .targets
            .read()
            .await
            .values()
            .filter(|(owner, _)| *owner == user_id)
            .map(|(_, t)| t.clone())
            .collect();
        targets.sort_by_key(|t| t.id);
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_auth_accepted() {
        let target = Target::new(1, "db-01", "10.0.0.5", 22, "ops", Some("s3cret".into()), None);
        assert!(target.is_ok());
        assert!(matches!(target.unwrap().auth, AuthMethod::Password(_)));
    }

    #[test]
    fn test_key_auth_accepted() {
        let target = Target::new(1, "db-01", "10.0.0.5", 22, "ops", None, Some("KEY".into()));
        assert!(matches!(
            target.unwrap().auth,
            AuthMethod::PrivateKey { .. }
        ));
    }

    #[test]
    fn test_both_secrets_rejected() {
        let err = Target::new(
            1,
            "db-01",
            "10.0.0.5",
            22,
            "ops",
            Some("s3cret".into()),
            Some("KEY".into()),
        )
        .unwrap_err();
        assert!(matches!(err, CommanderError::Configuration(_)));
    }

    #[test]
    fn test_no_secret_rejected() {
        let err = Target::new(1, "db-01", "10.0.0.5", 22, "ops", None, None).unwrap_err();
        assert!(matches!(err, CommanderError::Configuration(_)));
    }

    #[test]
    fn test_hint_matching() {
        let target =
            Target::new(7, "db-01", "10.0.0.5", 22, "ops", Some("pw".into()), None).unwrap();
        assert!(target.matches_hint("db-01"));
        assert!(target.matches_hint("DB-01"));
        assert!(target.matches_hint("10.0.0.5"));
        assert!(!target.matches_hint("web-02"));
    }

    #[tokio::test]
    async fn test_in_memory_store_scopes_by_user() {
        let store = InMemoryTargetStore::new();
        store
            .insert(
                1,
                Target::new(10, "a", "h1", 22, "u", Some("p".into()), None).unwrap(),
            )
            .await;
        store
            .insert(
                2,
                Target::new(11, "b", "h2", 22, "u", Some("p".into()), None).unwrap(),
            )
            .await;

        assert_eq!(store.list(1).await.len(), 1);
        assert_eq!(store.list(2).await.len(), 1);
        assert!(store.get(10).await.is_some());
        assert!(store.get(99).await.is_none());
    }
}
