//! Server artifact runner.
//!
//! Polls the server work queue, runs each task's queries against one shared
//! scope with a rolling deadline, and records progress in a per-session
//! execution context. Cancellation is cooperative: a cancel task or a
//! deadline expiry signals the engine, which winds down on its own.

pub mod acl;
pub mod backend;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod file_store;
pub mod local;
pub mod log_sink;
pub mod paths;
pub mod registry;
pub mod uploader;

pub use acl::{AclProfile, Permission};
pub use backend::{
    CompiledQuery, Datastore, Deobfuscator, IdentityDeobfuscator, Notification, Notifier,
    ParseError, QueryEngine, ResultSink, ResultWriter, RowStream, RunnerDeps, Scope,
    ScopeBuilder, ScopeParams, Subscription, UploadMode, UploadResponse, Uploader,
};
pub use config::RunnerConfig;
pub use context::{ContextHandle, ContextStore};
pub use dispatch::{start_server_artifact_service, ServerArtifactsRunner};
pub use error::{RunnerError, RunnerResult};
pub use executor::{ExecutionSummary, QueryExecutor};
pub use file_store::{FileDatastore, FileResultSink};
pub use local::{LocalNotifier, MemoryDatastore, MemoryResultSink};
pub use log_sink::LogSink;
pub use paths::FlowPaths;
pub use registry::{CancellationRegistry, Registration};
pub use uploader::ServerUploader;
