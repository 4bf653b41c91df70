use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use warden_common::limits::{
    parse_env_bool, parse_env_string, parse_env_u64, resolve_secs, LimitSource,
};
use warden_common::SERVER_RECIPIENT;

pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_DATA_ROOT: &str = "./warden-data";

const MAX_QUERY_TIMEOUT_SECS: u64 = 86_400;
const MAX_POLL_INTERVAL_SECS: u64 = 3_600;

/// Runner settings, normally read from the `[runner]` table of the service
/// TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    pub recipient: String,
    pub notification_channel: String,
    pub query_timeout_secs: u64,
    pub poll_interval_secs: u64,
    /// Stop the dispatch loop when a notification-triggered poll fails.
    pub stop_on_notification_error: bool,
    pub data_root: PathBuf,
    /// Largest single upload a server query may store. `None` means no cap.
    pub max_upload_bytes: Option<u64>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            recipient: SERVER_RECIPIENT.to_string(),
            notification_channel: SERVER_RECIPIENT.to_string(),
            query_timeout_secs: DEFAULT_QUERY_TIMEOUT_SECS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            stop_on_notification_error: true,
            data_root: PathBuf::from(DEFAULT_DATA_ROOT),
            max_upload_bytes: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    runner: Option<RunnerConfig>,
}

impl RunnerConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Load from a TOML file, falling back to defaults on any problem with the
    /// file, then apply `WARDEN_*` environment overrides.
    pub fn load(config_path: Option<&Path>) -> Self {
        let base = config_path.and_then(Self::read_file).unwrap_or_default();
        base.with_env_overrides()
    }

    fn read_file(path: &Path) -> Option<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(value) => value,
            Err(err) => {
                warn!("Failed to read config file {}: {}", path.display(), err);
                return None;
            }
        };

        match Self::from_toml_str(&contents) {
            Ok(cfg) => {
                info!("Loaded runner configuration from {}", path.display());
                Some(cfg)
            }
            Err(err) => {
                warn!("Failed to parse {}: {}", path.display(), err);
                None
            }
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        let parsed: ConfigFile = toml::from_str(contents)?;
        let mut cfg = parsed.runner.unwrap_or_default();
        cfg.sanitize();
        Ok(cfg)
    }

    fn sanitize(&mut self) {
        if self.query_timeout_secs == 0 {
            warn!(
                "query_timeout_secs must be greater than zero; using {}",
                DEFAULT_QUERY_TIMEOUT_SECS
            );
            self.query_timeout_secs = DEFAULT_QUERY_TIMEOUT_SECS;
        }
        if self.poll_interval_secs == 0 {
            warn!(
                "poll_interval_secs must be greater than zero; using {}",
                DEFAULT_POLL_INTERVAL_SECS
            );
            self.poll_interval_secs = DEFAULT_POLL_INTERVAL_SECS;
        }
        if self.recipient.trim().is_empty() {
            self.recipient = SERVER_RECIPIENT.to_string();
        }
        if self.notification_channel.trim().is_empty() {
            self.notification_channel = self.recipient.clone();
        }
    }

    pub fn with_env_overrides(mut self) -> Self {
        let (timeout, source) = resolve_secs(
            "WARDEN_QUERY_TIMEOUT_SECS",
            Some(self.query_timeout_secs),
            DEFAULT_QUERY_TIMEOUT_SECS,
            1,
            MAX_QUERY_TIMEOUT_SECS,
        );
        if source == LimitSource::Env {
            info!(timeout_secs = timeout, "query timeout overridden by environment");
        }
        self.query_timeout_secs = timeout;

        let (interval, _) = resolve_secs(
            "WARDEN_POLL_INTERVAL_SECS",
            Some(self.poll_interval_secs),
            DEFAULT_POLL_INTERVAL_SECS,
            1,
            MAX_POLL_INTERVAL_SECS,
        );
        self.poll_interval_secs = interval;

        if let Some(stop) = parse_env_bool("WARDEN_STOP_ON_NOTIFICATION_ERROR") {
            self.stop_on_notification_error = stop;
        }
        if let Some(root) = parse_env_string("WARDEN_DATA_ROOT") {
            self.data_root = PathBuf::from(root);
        }
        if let Some(limit) = parse_env_u64("WARDEN_MAX_UPLOAD_BYTES") {
            self.max_upload_bytes = (limit > 0).then_some(limit);
        }
        self
    }
}
