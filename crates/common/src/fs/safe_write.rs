use anyhow::{bail, Context, Result};
use fs2::FileExt;
use path_clean::PathClean;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Overwrite,
    Append,
    CreateNew,
}

/// Writes files beneath a single root, refusing anything that would land
/// outside of it.
#[derive(Debug, Clone)]
pub struct SafeFileWriter {
    root: PathBuf,
    max_file_size: Option<u64>,
}

impl SafeFileWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_file_size: None,
        }
    }

    pub fn with_max_size(mut self, max_size: Option<u64>) -> Self {
        self.max_file_size = max_size;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path against the root.
    pub fn resolve(&self, relative: &Path) -> Result<PathBuf> {
        let cleaned = relative.clean();

        if cleaned.is_absolute() || cleaned.has_root() {
            bail!("absolute path '{}' is not allowed", relative.display());
        }

        for component in cleaned.components() {
            match component {
                Component::ParentDir => bail!(
                    "path '{}' contains parent directory traversal",
                    relative.display()
                ),
                Component::Prefix(_) | Component::RootDir => {
                    bail!("path '{}' is not relative", relative.display())
                }
                _ => {}
            }
        }

        if cleaned.as_os_str().is_empty() || cleaned == Path::new(".") {
            bail!("empty path");
        }

        Ok(self.root.join(cleaned))
    }

    fn validate_content(&self, content: &[u8]) -> Result<()> {
        if let Some(max_size) = self.max_file_size {
            if content.len() as u64 > max_size {
                bail!(
                    "content size {} exceeds maximum {} bytes",
                    content.len(),
                    max_size
                );
            }
        }
        Ok(())
    }

    fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).with_context(|| {
                    format!(
                        "failed to create parent directories for '{}'",
                        parent.display()
                    )
                })?;
            }
        }
        Ok(())
    }

    /// Open a file for writing. `Append` never truncates existing data.
    pub fn open(&self, relative: &Path, mode: WriteMode) -> Result<File> {
        let path = self.resolve(relative)?;
        Self::ensure_parent(&path)?;

        let mut options = OpenOptions::new();
        match mode {
            WriteMode::Overwrite => options.write(true).create(true).truncate(true),
            WriteMode::Append => options.create(true).append(true),
            WriteMode::CreateNew => options.write(true).create_new(true),
        };

        options
            .open(&path)
            .with_context(|| format!("failed to open '{}' ({:?})", path.display(), mode))
    }

    pub fn write(&self, relative: &Path, content: &[u8], mode: WriteMode) -> Result<PathBuf> {
        self.validate_content(content)?;
        let path = self.resolve(relative)?;
        let mut file = self.open(relative, mode)?;
        file.write_all(content)
            .with_context(|| format!("failed to write data into '{}'", path.display()))?;
        Ok(path)
    }

    /// Append and fsync, so the data survives a crash right after the call.
    pub fn append_durable(&self, relative: &Path, content: &[u8]) -> Result<()> {
        self.validate_content(content)?;
        let mut file = self.open(relative, WriteMode::Append)?;
        file.write_all(content)?;
        file.sync_data()?;
        Ok(())
    }

    /// Replace a file atomically (exclusive lock + fsync + rename).
    pub fn write_atomic(&self, relative: &Path, content: &[u8]) -> Result<()> {
        self.validate_content(content)?;
        let path = self.resolve(relative)?;
        Self::ensure_parent(&path)?;

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .context("atomic write target has no file name")?;
        let lock_path = path.with_file_name(format!("{}.lock", file_name));
        let temp_path = path.with_file_name(format!("{}.tmp", file_name));

        let lock = File::create(&lock_path)
            .with_context(|| format!("failed to create lock '{}'", lock_path.display()))?;
        lock.lock_exclusive()?;

        let mut temp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        temp.write_all(content)?;
        temp.sync_all()?;
        drop(temp);

        fs::rename(&temp_path, &path)
            .with_context(|| format!("failed to replace '{}'", path.display()))?;

        #[cfg(target_family = "unix")]
        {
            if let Some(parent) = path.parent() {
                File::open(parent)?.sync_all()?;
            }
        }

        drop(lock);
        Ok(())
    }

    /// Publish a new file atomically without ever replacing one. Returns
    /// `false` when the target exists or another writer is publishing it.
    pub fn write_new_atomic(&self, relative: &Path, content: &[u8]) -> Result<bool> {
        self.validate_content(content)?;
        let path = self.resolve(relative)?;
        Self::ensure_parent(&path)?;
        if path.exists() {
            return Ok(false);
        }

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .context("publish target has no file name")?;
        let temp_relative = relative.with_file_name(format!("{}.new", file_name));
        let temp_path = self.resolve(&temp_relative)?;

        let mut temp = match self.open(&temp_relative, WriteMode::CreateNew) {
            Ok(file) => file,
            Err(err) if is_already_exists(&err) => return Ok(false),
            Err(err) => return Err(err),
        };
        let written = temp.write_all(content).and_then(|_| temp.sync_all());
        drop(temp);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(err)
                .with_context(|| format!("failed to write data into '{}'", temp_path.display()));
        }

        // A hard link fails instead of replacing an existing target.
        let linked = fs::hard_link(&temp_path, &path);
        let _ = fs::remove_file(&temp_path);
        match linked {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => {
                Err(err).with_context(|| format!("failed to publish '{}'", path.display()))
            }
        }
    }
}

fn is_already_exists(err: &anyhow::Error) -> bool {
    err.downcast_ref::<io::Error>()
        .map(|e| e.kind() == io::ErrorKind::AlreadyExists)
        .unwrap_or(false)
}
