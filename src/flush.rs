//! Session flushing to numbered log files.
//!
//! In the default mode every flush lands in a fresh `<n>.log` where `n` is
//! one more than the largest numeric stem already present in the log
//! directory; gaps are never reused and existing files are never replaced.
//! In overwrite mode a single fixed file is rewritten on every flush.
//!
//! Either way the text is first written to a hidden temp file in the log
//! directory and then renamed into place, so a failed write never leaves a
//! partial log behind.

use crate::colorize::colorize;
use crate::config::OutputConfig;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

const LOG_EXTENSION: &str = "log";

/// Publish attempts before giving up when racing another writer.
const MAX_CREATE_ATTEMPTS: usize = 8;

const STAGING_PREFIX: &str = ".qrlog-";

/// Errors that can occur while writing a session to disk
#[derive(Error, Debug)]
pub enum FlushError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write log file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Largest numeric `<n>.log` stem in `dir`, or 0 if there is none.
pub fn max_log_id(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };

    entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                return None;
            }
            path.file_stem()?.to_str()?.parse::<u64>().ok()
        })
        .max()
        .unwrap_or(0)
}

/// Path the next default-mode flush will use.
pub fn next_log_path(dir: &Path) -> PathBuf {
    dir.join(format!("{}.{LOG_EXTENSION}", max_log_id(dir) + 1))
}

/// Hidden temp file in `dir`. On Unix it is created 0666 minus the umask,
/// the same as a plain `File::create`.
fn staging_file(dir: &Path) -> std::io::Result<NamedTempFile> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(STAGING_PREFIX);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(std::fs::Permissions::from_mode(0o666));
    }
    builder.tempfile_in(dir)
}

/// Writes flushed sessions into the configured log directory.
#[derive(Debug, Clone)]
pub struct LogWriter {
    dir: PathBuf,
    overwrite_name: Option<String>,
    colorize: bool,
}

impl LogWriter {
    pub fn new(config: &OutputConfig) -> Self {
        Self {
            dir: config.log_dir.clone(),
            overwrite_name: config
                .overwrite
                .then(|| config.overwrite_name.clone()),
            colorize: config.colorize,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `text` to its destination file and return the path.
    pub fn flush(&self, text: &str) -> Result<PathBuf, FlushError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| FlushError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;

        let rendered = if self.colorize {
            colorize(text)
        } else {
            text.to_string()
        };

        let fill = |file: &mut File| file.write_all(rendered.as_bytes());
        let path = match &self.overwrite_name {
            Some(name) => self.write_replacing(&self.dir.join(name), fill)?,
            None => self.write_new(fill)?,
        };

        info!(path = %path.display(), bytes = rendered.len(), "session flushed");
        Ok(path)
    }

    /// Stage the contents produced by `fill`. The temp file is removed if
    /// anything fails before it is published.
    fn stage(
        &self,
        fill: impl FnOnce(&mut File) -> std::io::Result<()>,
    ) -> Result<NamedTempFile, FlushError> {
        let write_err = |source| FlushError::Write {
            path: self.dir.clone(),
            source,
        };
        let mut tmp = staging_file(&self.dir).map_err(write_err)?;
        fill(tmp.as_file_mut()).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        Ok(tmp)
    }

    fn write_replacing(
        &self,
        path: &Path,
        fill: impl FnOnce(&mut File) -> std::io::Result<()>,
    ) -> Result<PathBuf, FlushError> {
        let tmp = self.stage(fill)?;
        tmp.persist(path).map_err(|e| FlushError::Write {
            path: path.to_path_buf(),
            source: e.error,
        })?;
        Ok(path.to_path_buf())
    }

    fn write_new(
        &self,
        fill: impl FnOnce(&mut File) -> std::io::Result<()>,
    ) -> Result<PathBuf, FlushError> {
        let mut tmp = self.stage(fill)?;
        let mut attempt = 0;
        loop {
            let path = next_log_path(&self.dir);
            match tmp.persist_noclobber(&path) {
                Ok(_) => return Ok(path),
                Err(e)
                    if e.error.kind() == std::io::ErrorKind::AlreadyExists
                        && attempt + 1 < MAX_CREATE_ATTEMPTS =>
                {
                    debug!(path = %path.display(), "log file appeared concurrently; rescanning");
                    attempt += 1;
                    tmp = e.file;
                }
                Err(e) => {
                    return Err(FlushError::Write {
                        path,
                        source: e.error,
                    });
                }
            }
        }
    }
}
