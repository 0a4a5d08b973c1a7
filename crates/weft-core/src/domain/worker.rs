//! Worker sessions.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{SessionId, TaskId, WorkerId};

/// What a worker sends when it joins a project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,

    #[serde(default)]
    pub capabilities: BTreeSet<String>,

    /// Allocator capacity; `None` falls back to the configured default.
    #[serde(default)]
    pub max_concurrent_tasks: Option<usize>,
}

impl RegisterRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = Some(max);
        self
    }
}

/// One registration of a worker.
///
/// Liveness is never stored: it is re-evaluated from `last_heartbeat`
/// every time a decision needs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSession {
    pub worker_id: WorkerId,
    pub session_id: SessionId,
    pub name: String,

    #[serde(default)]
    pub capabilities: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_tasks: Option<usize>,

    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,

    #[serde(default)]
    pub claimed_tasks: BTreeSet<TaskId>,
}

impl WorkerSession {
    /// `now - last_heartbeat < timeout`.
    ///
    /// A heartbeat stamped in the future (clock skew between processes)
    /// counts as live.
    pub fn is_live(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        let age = now.signed_duration_since(self.last_heartbeat);
        match age.to_std() {
            Ok(age) => age < timeout,
            Err(_) => true,
        }
    }

    pub fn has_capabilities(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ulid::Ulid;

    fn session_with_heartbeat(last_heartbeat: DateTime<Utc>) -> WorkerSession {
        WorkerSession {
            worker_id: WorkerId::from_ulid(Ulid::new()),
            session_id: SessionId::from_ulid(Ulid::new()),
            name: "w".into(),
            capabilities: BTreeSet::new(),
            max_concurrent_tasks: None,
            registered_at: last_heartbeat,
            last_heartbeat,
            claimed_tasks: BTreeSet::new(),
        }
    }

    #[rstest]
    #[case::fresh(0, true)]
    #[case::just_inside(299, true)]
    #[case::at_timeout(300, false)]
    #[case::stale(360, false)]
    fn liveness_is_strictly_less_than_timeout(#[case] age_secs: i64, #[case] live: bool) {
        let now = Utc::now();
        let session = session_with_heartbeat(now - chrono::Duration::seconds(age_secs));
        assert_eq!(session.is_live(now, Duration::from_secs(300)), live);
    }

    #[test]
    fn future_heartbeat_counts_as_live() {
        let now = Utc::now();
        let session = session_with_heartbeat(now + chrono::Duration::seconds(30));
        assert!(session.is_live(now, Duration::from_secs(1)));
    }

    #[test]
    fn capabilities_must_cover_requirements() {
        let mut session = session_with_heartbeat(Utc::now());
        session.capabilities.insert("rust".into());

        let mut required = BTreeSet::new();
        assert!(session.has_capabilities(&required));
        required.insert("rust".to_string());
        assert!(session.has_capabilities(&required));
        required.insert("sql".to_string());
        assert!(!session.has_capabilities(&required));
    }
}
