//! Prefixed, time-ordered identifiers.
//!
//! Every entity id is an opaque string of the form `<prefix>_<token>` where
//! the token is a UUIDv7 in simple (hex) form. UUIDv7 tokens sort by creation
//! time, so lexicographic order on ids of one prefix is creation order.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known id prefixes, one per entity type.
pub mod prefixes {
    pub const WORKSPACE: &str = "ws";
    pub const TASK: &str = "task";
    pub const FLOW: &str = "flow";
    pub const SUBFLOW: &str = "sf";
    pub const FLOW_ACTION: &str = "fa";
    pub const WORKTREE: &str = "wt";
    pub const PROVIDER_KEY: &str = "pk";
}

/// An opaque entity identifier.
///
/// Ids are compared, hashed, and ordered as plain strings. The empty id is
/// the "unset" value; persistence layers reject it.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    /// Generate a fresh time-ordered id with the given prefix.
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{}_{}", prefix, Uuid::now_v7().simple()))
    }

    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The type tag in front of the first underscore, if any.
    pub fn prefix(&self) -> Option<&str> {
        self.0.split_once('_').map(|(p, _)| p)
    }

    /// Check whether this id carries the given type tag.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.prefix() == Some(prefix)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Id {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for Id {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
