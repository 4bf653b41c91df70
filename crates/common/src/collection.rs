use serde::{Deserialize, Serialize};

/// Collection lifetime state. A context that was never terminated is running.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollectorState {
    #[default]
    Running,
    Terminated,
}

/// Durable record of one server collection.
///
/// Timestamps are microseconds since the Unix epoch. `active_time` and
/// `kill_timestamp` are always set together when the collection terminates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ExecutionContext {
    pub session_id: String,
    pub state: CollectorState,
    pub create_time: u64,
    pub start_time: u64,
    pub active_time: u64,
    pub kill_timestamp: u64,
    pub artifacts_with_results: Vec<String>,
    pub total_collected_rows: u64,
    pub total_uploaded_files: u64,
    pub total_uploaded_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<String>,
}

impl ExecutionContext {
    pub fn new(session_id: impl Into<String>, create_time: u64) -> Self {
        Self {
            session_id: session_id.into(),
            create_time,
            ..Self::default()
        }
    }

    /// Record a result-set name once, preserving first-seen order.
    /// Returns `true` if the name was new.
    pub fn add_artifact_with_results(&mut self, name: &str) -> bool {
        if self.artifacts_with_results.iter().any(|n| n == name) {
            return false;
        }
        self.artifacts_with_results.push(name.to_string());
        true
    }

    pub fn terminate(&mut self, now: u64) {
        self.state = CollectorState::Terminated;
        self.active_time = now;
        self.kill_timestamp = now;
    }

    pub fn is_terminated(&self) -> bool {
        self.state == CollectorState::Terminated
    }
}
