use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::task::spawn_blocking;
use tracing::debug;
use warden_common::fs::{SafeFileWriter, WriteMode};

use crate::backend::{UploadMode, UploadResponse, Uploader};
use crate::context::ContextHandle;
use crate::paths::FlowPaths;

/// Uploader handed to server queries.
///
/// Uploads land in the file store under the collection's `uploads/`
/// directory. This gives queries write access to the file store, which is
/// how artifacts manage server files; only path escapes are refused.
pub struct ServerUploader {
    writer: SafeFileWriter,
    paths: FlowPaths,
    context: ContextHandle,
}

impl ServerUploader {
    pub fn new(writer: SafeFileWriter, paths: FlowPaths, context: ContextHandle) -> Self {
        Self {
            writer,
            paths,
            context,
        }
    }
}

#[async_trait]
impl Uploader for ServerUploader {
    async fn upload(&self, name: &str, data: &[u8], mode: UploadMode) -> Result<UploadResponse> {
        let relative = self.paths.upload(name);
        let writer = self.writer.clone();
        let content = data.to_vec();
        let size = content.len() as u64;
        let write_mode = match mode {
            UploadMode::Append => WriteMode::Append,
            UploadMode::Truncate => WriteMode::Overwrite,
        };

        let target = relative.clone();
        spawn_blocking(move || writer.write(&target, &content, write_mode))
            .await
            .context("upload task panicked")?
            .with_context(|| format!("failed to upload {}", name))?;

        self.context
            .update(|ctx| {
                ctx.total_uploaded_files += 1;
                ctx.total_uploaded_bytes += size;
            })
            .await?;

        debug!(
            session_id = %self.paths.session_id(),
            path = %relative.display(),
            size,
            "stored server upload"
        );

        Ok(UploadResponse {
            path: relative.to_string_lossy().to_string(),
            size,
        })
    }
}
