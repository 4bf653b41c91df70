//! File-backed datastore and result sets.
//!
//! Layout under the data root:
//! - `queues/<recipient>/<task_id>.json`: one queued task per file
//! - `clients/<recipient>/collections/<session>/context.json`: context record
//! - `clients/<recipient>/collections/<session>/logs.jsonl`: session log
//! - `clients/<recipient>/artifacts/<name>/<session>.jsonl`: result sets

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::spawn_blocking;
use tracing::warn;
use warden_common::fs::{SafeFileWriter, WriteMode};
use warden_common::{now_micros, ExecutionContext, Row, Task};

use crate::backend::{Datastore, ResultSink, ResultWriter};
use crate::paths::{queue_dir, queue_entry, FlowPaths};

const MAX_QUEUE_ATTEMPTS: usize = 1024;

#[derive(Debug, Clone)]
pub struct FileDatastore {
    writer: SafeFileWriter,
}

impl FileDatastore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            writer: SafeFileWriter::new(root),
        }
    }

    pub fn root(&self) -> &Path {
        self.writer.root()
    }

    /// Queue a task for `recipient`. Tasks without an id get one derived from
    /// the current time, so queue order follows submission order. A queued
    /// entry is never replaced: a taken generated id moves on to the next
    /// free one, a taken explicit id is an error.
    pub fn queue_task(&self, recipient: &str, mut task: Task) -> Result<u64> {
        let generated = task.task_id == 0;
        if generated {
            task.task_id = now_micros();
        }

        for _ in 0..MAX_QUEUE_ATTEMPTS {
            let body = serde_json::to_vec_pretty(&task)?;
            if self
                .writer
                .write_new_atomic(&queue_entry(recipient, task.task_id), &body)?
            {
                return Ok(task.task_id);
            }
            if !generated {
                bail!("task {} is already queued for {}", task.task_id, recipient);
            }
            task.task_id += 1;
        }
        bail!("no free task id for {} after {} attempts", recipient, MAX_QUEUE_ATTEMPTS)
    }

    fn read_queue(&self, recipient: &str) -> Result<Vec<Task>> {
        let dir = self.writer.resolve(&queue_dir(recipient))?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to list {}", dir.display()))
            }
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().map(|ext| ext == "json").unwrap_or(false))
            .collect();
        files.sort();

        let mut tasks = Vec::with_capacity(files.len());
        for path in files {
            let parsed = File::open(&path)
                .map_err(anyhow::Error::from)
                .and_then(|file| Ok(serde_json::from_reader::<_, Task>(file)?));
            match parsed {
                Ok(mut task) => {
                    if task.task_id == 0 {
                        task.task_id = task_id_from_path(&path).unwrap_or(0);
                    }
                    tasks.push(task);
                }
                Err(err) => warn!("Skipping unreadable queued task {}: {:#}", path.display(), err),
            }
        }
        Ok(tasks)
    }

    fn remove_entry(&self, recipient: &str, task_id: u64) -> Result<()> {
        let path = self.writer.resolve(&queue_entry(recipient, task_id))?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to unqueue {}", path.display())),
        }
    }

    fn read_record(&self, path: &Path) -> Result<Option<ExecutionContext>> {
        let full = self.writer.resolve(path)?;
        let file = match File::open(&full) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("failed to open {}", full.display())),
        };
        let context = serde_json::from_reader(file)
            .with_context(|| format!("failed to parse record {}", full.display()))?;
        Ok(Some(context))
    }
}

fn task_id_from_path(path: &Path) -> Option<u64> {
    path.file_stem()?.to_str()?.parse().ok()
}

#[async_trait]
impl Datastore for FileDatastore {
    async fn fetch_pending_tasks(&self, recipient: &str) -> Result<Vec<Task>> {
        let store = self.clone();
        let recipient = recipient.to_string();
        spawn_blocking(move || store.read_queue(&recipient))
            .await
            .context("queue scan panicked")?
    }

    async fn remove_from_queue(&self, recipient: &str, task: &Task) -> Result<()> {
        if task.task_id == 0 {
            bail!("task for session {} has no task id", task.session_id);
        }
        let store = self.clone();
        let recipient = recipient.to_string();
        let task_id = task.task_id;
        spawn_blocking(move || store.remove_entry(&recipient, task_id))
            .await
            .context("unqueue panicked")?
    }

    async fn get_record(&self, path: &Path) -> Result<Option<ExecutionContext>> {
        let store = self.clone();
        let path = path.to_path_buf();
        spawn_blocking(move || store.read_record(&path))
            .await
            .context("record read panicked")?
    }

    async fn put_record(&self, path: &Path, context: &ExecutionContext) -> Result<()> {
        let writer = self.writer.clone();
        let path = path.to_path_buf();
        let body = serde_json::to_vec_pretty(context)?;
        spawn_blocking(move || writer.write_atomic(&path, &body))
            .await
            .context("record write panicked")?
    }
}

/// JSON-lines result sets, one file per result set.
#[derive(Debug, Clone)]
pub struct FileResultSink {
    writer: SafeFileWriter,
}

impl FileResultSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            writer: SafeFileWriter::new(root),
        }
    }

    /// Read back every row of the result set at `path`.
    pub fn read_rows(&self, path: &Path) -> Result<Vec<Row>> {
        let full = self.writer.resolve(path)?;
        let file = match File::open(&full) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("failed to open {}", full.display())),
        };

        let mut rows = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            rows.push(serde_json::from_str(&line)?);
        }
        Ok(rows)
    }
}

/// Run blocking file I/O from a sync trait method. On a multi-threaded
/// runtime the worker hands its other tasks off first; elsewhere the call
/// simply blocks.
fn blocking_io<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

fn encode_rows(rows: &[Row]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut buf, row)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

impl ResultSink for FileResultSink {
    fn open_writer(
        &self,
        recipient: &str,
        session_id: &str,
        name: &str,
        append: bool,
    ) -> Result<Box<dyn ResultWriter>> {
        let path = FlowPaths::new(recipient, session_id).result_set(name);
        let mode = if append {
            WriteMode::Append
        } else {
            WriteMode::Overwrite
        };
        let file = self.writer.open(&path, mode)?;
        Ok(Box::new(FileResultWriter {
            file: Some(file),
            path,
        }))
    }

    fn push_rows(&self, path: &Path, rows: Vec<Row>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let body = encode_rows(&rows)?;
        blocking_io(|| self.writer.append_durable(path, &body))
    }
}

struct FileResultWriter {
    file: Option<File>,
    path: PathBuf,
}

impl ResultWriter for FileResultWriter {
    fn write(&mut self, row: Row) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            bail!("result set {} already closed", self.path.display());
        };
        // One write per row keeps rows whole for concurrent readers.
        file.write_all(&encode_rows(std::slice::from_ref(&row))?)
            .with_context(|| format!("failed to write row to {}", self.path.display()))
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            blocking_io(|| -> io::Result<()> {
                file.flush()?;
                file.sync_data()
            })?;
        }
        Ok(())
    }
}
