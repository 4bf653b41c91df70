use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One result row: column name to value, in the order the engine produced them.
pub type Row = Map<String, Value>;

/// A unit of work pulled from the server queue.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub session_id: String,
    #[serde(default)]
    pub task_id: u64,
    #[serde(default)]
    pub cancel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<QueryAction>,
}

impl Task {
    pub fn run(session_id: impl Into<String>, action: QueryAction) -> Self {
        Self {
            session_id: session_id.into(),
            task_id: 0,
            cancel: false,
            action: Some(action),
        }
    }

    pub fn cancellation(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            task_id: 0,
            cancel: true,
            action: None,
        }
    }

    pub fn with_task_id(mut self, task_id: u64) -> Self {
        self.task_id = task_id;
        self
    }

    pub fn is_cancel(&self) -> bool {
        self.cancel
    }
}

/// Ordered queries plus the environment they start from.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryAction {
    /// `None` means the request never carried a query list at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queries: Option<Vec<QuerySpec>>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

impl QueryAction {
    pub fn new(queries: Vec<QuerySpec>) -> Self {
        Self {
            queries: Some(queries),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push(EnvVar {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Environment pairs as a row, later keys overriding earlier ones.
    pub fn env_row(&self) -> Row {
        let mut row = Row::new();
        for var in &self.env {
            row.insert(var.key.clone(), Value::String(var.value.clone()));
        }
        row
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct QuerySpec {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl QuerySpec {
    pub fn unnamed(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            name: None,
        }
    }

    pub fn named(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            name: Some(name.into()),
        }
    }

    /// The result-set name, ignoring empty names.
    pub fn result_name(&self) -> Option<&str> {
        self.name.as_deref().filter(|name| !name.is_empty())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

/// A single line of a session's log result set.
#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    pub timestamp: u64,
    pub time: DateTime<Utc>,
    pub message: String,
}

impl LogEntry {
    pub fn now(message: impl Into<String>) -> Self {
        let time = Utc::now();
        Self {
            timestamp: time.timestamp_micros().max(0) as u64,
            time,
            message: message.into(),
        }
    }

    pub fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert("Timestamp".into(), Value::from(self.timestamp));
        row.insert("time".into(), Value::String(self.time.to_string()));
        row.insert("message".into(), Value::String(self.message.clone()));
        row
    }
}
