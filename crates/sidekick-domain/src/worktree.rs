//! Worktrees: isolated on-disk checkouts, one per flow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::Id;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worktree {
    pub id: Id,
    pub workspace_id: Id,
    pub flow_id: Id,

    /// Branch name the checkout is on.
    pub name: String,

    pub working_directory: String,

    pub created: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::prefixes;

    #[test]
    fn test_round_trip() {
        let wt = Worktree {
            id: Id::generate(prefixes::WORKTREE),
            workspace_id: Id::generate(prefixes::WORKSPACE),
            flow_id: Id::generate(prefixes::FLOW),
            name: "sidekick/task-42".to_string(),
            working_directory: "/tmp/worktrees/task-42".to_string(),
            created: Utc::now(),
        };

        let json = serde_json::to_string(&wt).unwrap();
        let parsed: Worktree = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, wt);
    }
}
