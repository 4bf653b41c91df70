// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
pub mod collection;
pub mod fs;
pub mod limits;
pub mod task;

pub use collection::{CollectorState, ExecutionContext};
pub use task::{EnvVar, LogEntry, QueryAction, QuerySpec, Row, Task};

/// Recipient name used for every task addressed to the server itself.
pub const SERVER_RECIPIENT: &str = "server";

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    chrono::Utc::now().timestamp_micros().max(0) as u64
}
