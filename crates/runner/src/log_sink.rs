use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;
use warden_common::LogEntry;

use crate::backend::{Deobfuscator, ResultSink};
use crate::config::RunnerConfig;
use crate::paths::FlowPaths;

/// Writes a session's log messages into its log result set.
///
/// Each message is pushed on its own as soon as it is written, so the log
/// is readable while the query is still running and survives a crash of the
/// runner right after.
pub struct LogSink {
    config: Arc<RunnerConfig>,
    results: Arc<dyn ResultSink>,
    deobfuscator: Arc<dyn Deobfuscator>,
    session_id: String,
    path: PathBuf,
}

impl LogSink {
    pub fn new(
        config: Arc<RunnerConfig>,
        results: Arc<dyn ResultSink>,
        deobfuscator: Arc<dyn Deobfuscator>,
        paths: &FlowPaths,
    ) -> Self {
        Self {
            config,
            results,
            deobfuscator,
            session_id: paths.session_id().to_string(),
            path: paths.log(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Record one message. Storage failures are reported through tracing
    /// and never fail the caller.
    pub fn log(&self, message: &str) {
        let message = self.deobfuscator.deobfuscate(&self.config, message);
        let entry = LogEntry::now(message);
        if let Err(err) = self.results.push_rows(&self.path, vec![entry.to_row()]) {
            warn!(
                session_id = %self.session_id,
                "failed to store log message: {:#}", err
            );
        }
    }
}

/// Raw log writes, one entry per write call. Trailing newlines are dropped.
impl io::Write for &LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        let trimmed = text.trim_end_matches(['\r', '\n']);
        if !trimmed.is_empty() {
            self.log(trimmed);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::MemoryResultSink;
    use std::io::Write;

    struct Rot13;

    impl Deobfuscator for Rot13 {
        fn deobfuscate(&self, _config: &RunnerConfig, input: &str) -> String {
            input
                .chars()
                .map(|c| match c {
                    'a'..='m' | 'A'..='M' => (c as u8 + 13) as char,
                    'n'..='z' | 'N'..='Z' => (c as u8 - 13) as char,
                    _ => c,
                })
                .collect()
        }
    }

    fn sink(results: Arc<MemoryResultSink>, deobfuscator: Arc<dyn Deobfuscator>) -> LogSink {
        LogSink::new(
            Arc::new(RunnerConfig::default()),
            results,
            deobfuscator,
            &FlowPaths::new("server", "F.1"),
        )
    }

    #[test]
    fn each_write_becomes_one_entry() {
        let results = Arc::new(MemoryResultSink::new());
        let log = sink(results.clone(), Arc::new(crate::backend::IdentityDeobfuscator));
        log.log("first");
        (&log).write_all(b"second\n").unwrap();
        (&log).write_all(b"\n").unwrap();

        let rows = results.rows(&FlowPaths::new("server", "F.1").log());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["message"], "first");
        assert_eq!(rows[1]["message"], "second");
        assert!(rows[0]["Timestamp"].as_u64().unwrap() <= rows[1]["Timestamp"].as_u64().unwrap());
        assert!(rows[0]["time"].as_str().unwrap().ends_with("UTC"));
    }

    #[test]
    fn messages_are_deobfuscated() {
        let results = Arc::new(MemoryResultSink::new());
        let log = sink(results.clone(), Arc::new(Rot13));
        log.log("Uryyb");
        assert_eq!(
            results.log_messages("server", "F.1"),
            vec!["Hello".to_string()]
        );
    }
}
