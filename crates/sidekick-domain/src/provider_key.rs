//! Provider keys: pointers to LLM credentials held by a secret manager.
//!
//! The core never stores secret material; a provider key names where the
//! secret lives and which provider it unlocks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretManagerType {
    /// Secret resolved from the process environment.
    Env,

    /// Secret resolved from the OS keyring.
    Keyring,

    /// Secret resolved from the local config file.
    LocalConfig,
}

impl std::fmt::Display for SecretManagerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Env => write!(f, "env"),
            Self::Keyring => write!(f, "keyring"),
            Self::LocalConfig => write!(f, "local_config"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderKey {
    pub id: String,

    /// Provider the key unlocks, e.g. `openai` or `anthropic`.
    pub provider_type: String,

    /// Optional human label; listings order by nickname then id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,

    pub secret_manager_type: SecretManagerType,

    /// Name the secret manager resolves, e.g. an env var name.
    pub secret_name: String,

    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl ProviderKey {
    /// Validate the fields a persist requires. Returns the offending field
    /// name on failure.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.id.is_empty() {
            return Err("id");
        }
        if self.provider_type.trim().is_empty() {
            return Err("providerType");
        }
        if self.secret_name.trim().is_empty() {
            return Err("secretName");
        }
        Ok(())
    }

    /// Sort key for listings: nickname first, then id.
    pub fn sort_key(&self) -> (String, String) {
        (
            self.nickname.clone().unwrap_or_default(),
            self.id.clone(),
        )
    }
}
