//! Single-run guard per tag.
//!
//! A lock marker exists for as long as a run for that tag is in progress.
//! If the process is killed the marker stays behind and has to be removed
//! by hand.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

/// Lock store errors.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode lock marker: {0}")]
    Marker(#[from] serde_json::Error),
}

/// Guards against overlapping runs for the same tag.
pub trait RunLockStore: Send + Sync {
    /// Take the lock. Returns `false` if it is already held.
    fn acquire(&self, tag: &str) -> Result<bool, LockError>;

    /// Drop the lock. Releasing a lock that is not held is not an error.
    fn release(&self, tag: &str) -> Result<(), LockError>;
}

/// Contents of a lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMarker {
    pub tag: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Lock files in a directory, one per tag.
#[derive(Debug, Clone)]
pub struct FileLockStore {
    dir: PathBuf,
}

impl FileLockStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the lock file for `tag`.
    pub fn path_for(&self, tag: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", sanitize_tag(tag)))
    }

    /// Read the marker currently holding `tag`, if any.
    pub fn holder(&self, tag: &str) -> Option<LockMarker> {
        let contents = fs::read_to_string(self.path_for(tag)).ok()?;
        serde_json::from_str(&contents).ok()
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> LockError + '_ {
    move |source| LockError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl RunLockStore for FileLockStore {
    fn acquire(&self, tag: &str) -> Result<bool, LockError> {
        fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;

        let path = self.path_for(tag);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if let Some(holder) = self.holder(tag) {
                    warn!(
                        tag,
                        pid = holder.pid,
                        acquired_at = %holder.acquired_at,
                        "Run lock already held"
                    );
                }
                return Ok(false);
            }
            Err(e) => return Err(io_error(&path)(e)),
        };

        claim(&path, &mut file, tag)?;

        debug!(tag, path = ?path, "Run lock acquired");
        Ok(true)
    }

    fn release(&self, tag: &str) -> Result<(), LockError> {
        let path = self.path_for(tag);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(tag, path = ?path, "Run lock released");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path)(e)),
        }
    }
}

/// Write the marker into a freshly created lock file. The file is removed
/// again if the write fails so a half-written lock never blocks later runs.
fn claim<W: Write>(path: &Path, out: &mut W, tag: &str) -> Result<(), LockError> {
    let marker = LockMarker {
        tag: tag.to_string(),
        pid: std::process::id(),
        acquired_at: Utc::now(),
    };

    let written = serde_json::to_vec_pretty(&marker)
        .map_err(LockError::from)
        .and_then(|contents| {
            out.write_all(&contents)
                .and_then(|()| out.flush())
                .map_err(io_error(path))
        });

    if written.is_err() {
        if let Err(e) = fs::remove_file(path) {
            warn!(tag, path = ?path, error = %e, "Failed to remove incomplete lock file");
        }
    }
    written
}

/// Process-local lock store.
#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    held: Mutex<HashSet<String>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, tag: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(tag)
    }
}

impl RunLockStore for InMemoryLockStore {
    fn acquire(&self, tag: &str) -> Result<bool, LockError> {
        Ok(self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tag.to_string()))
    }

    fn release(&self, tag: &str) -> Result<(), LockError> {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tag);
        Ok(())
    }
}

/// Map a tag onto a safe file name.
///
/// Unsafe characters become `_`; a digest of the raw tag keeps tags that
/// sanitize to the same text apart.
pub fn sanitize_tag(tag: &str) -> String {
    let readable: String = tag
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let digest = Sha256::digest(tag.as_bytes());
    format!("{}-{}", readable, hex::encode(&digest[..6]))
}
