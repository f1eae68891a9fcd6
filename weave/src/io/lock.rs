//! Cross-process advisory locks under `.weave/locks/`.
//!
//! One lock file per task serializes spawn/complete/recover for that task.
//! Short-lived shared locks (`state.lock`, `notes.lock`) serialize
//! read-modify-write of the cache and the notes ref. The OS releases a lock
//! when the holding process dies, so a crash never leaves a task wedged.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::backoff::Backoff;
use crate::error::WeaveError;

/// Written into the lock file for diagnostics only.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Holder {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// An exclusive lock held until drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

enum Attempt {
    Contended,
    Failed(std::io::Error),
}

impl FileLock {
    /// Try to take the lock, retrying with backoff. `Ok(None)` means the
    /// retry budget ran out while another holder kept it.
    pub fn acquire(path: &Path, backoff: &Backoff) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create lock dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("open lock {}", path.display()))?;

        let contended = fs2::lock_contended_error();
        let outcome = backoff.run(
            |attempt| match file.try_lock_exclusive() {
                Ok(()) => Ok(()),
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.raw_os_error() == contended.raw_os_error() =>
                {
                    debug!(path = %path.display(), attempt, "lock contended");
                    Err(Attempt::Contended)
                }
                Err(err) => Err(Attempt::Failed(err)),
            },
            |err| matches!(err, Attempt::Contended),
        );
        match outcome {
            Ok(()) => {}
            Err(Attempt::Contended) => return Ok(None),
            Err(Attempt::Failed(err)) => {
                return Err(err).with_context(|| format!("lock {}", path.display()));
            }
        }

        let mut lock = Self {
            file,
            path: path.to_path_buf(),
        };
        if let Err(err) = lock.write_holder() {
            warn!(path = %path.display(), err = %err, "failed to record lock holder");
        }
        debug!(path = %path.display(), "lock acquired");
        Ok(Some(lock))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_holder(&mut self) -> Result<()> {
        let holder = Holder {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        self.file.set_len(0).context("truncate lock file")?;
        self.file.seek(SeekFrom::Start(0)).context("seek lock file")?;
        serde_json::to_writer(&mut self.file, &holder).context("write lock holder")?;
        self.file.flush().context("flush lock file")?;
        Ok(())
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), err = %err, "failed to release lock");
        } else {
            debug!(path = %self.path.display(), "lock released");
        }
    }
}

/// Take the per-task lock or fail with [`WeaveError::Busy`].
pub fn lock_task(locks_dir: &Path, task: u64, backoff: &Backoff) -> Result<FileLock> {
    let path = locks_dir.join(format!("task-{task}.lock"));
    FileLock::acquire(&path, backoff)?.ok_or_else(|| {
        WeaveError::Busy {
            task,
            attempts: backoff.attempts(),
        }
        .into()
    })
}

/// Take a named shared lock (`state`, `notes`); exhaustion is an operational error.
pub fn lock_named(locks_dir: &Path, name: &str, backoff: &Backoff) -> Result<FileLock> {
    let path = locks_dir.join(format!("{name}.lock"));
    FileLock::acquire(&path, backoff)?
        .with_context(|| format!("{name} lock still held after {} attempts", backoff.attempts()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;

    fn quick() -> Backoff {
        Backoff::new(2, 1)
    }

    #[test]
    fn second_holder_gets_busy() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = lock_task(temp.path(), 7, &quick()).expect("first lock");
        let err = lock_task(temp.path(), 7, &quick()).expect_err("contended");
        assert!(matches!(
            classify(&err),
            Some(WeaveError::Busy { task: 7, attempts: 3 })
        ));
        drop(first);
        lock_task(temp.path(), 7, &quick()).expect("free after drop");
    }

    #[test]
    fn different_tasks_do_not_contend() {
        let temp = tempfile::tempdir().expect("tempdir");
        let _seven = lock_task(temp.path(), 7, &quick()).expect("seven");
        let _eight = lock_task(temp.path(), 8, &quick()).expect("eight");
    }

    #[test]
    fn lock_file_records_holder_and_survives_release() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock = lock_named(temp.path(), "state", &quick()).expect("lock");
        let path = lock.path().to_path_buf();
        let raw = std::fs::read_to_string(&path).expect("read");
        assert!(raw.contains("\"pid\""));
        drop(lock);
        assert!(path.exists());
    }
}
