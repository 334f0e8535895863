// backuptool/src/lock.rs
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::{BackupError, Result};

const LOCK_FILE_NAME: &str = ".backuptool.lock";

/// Mutual-exclusion guard keyed on the backup root. Two concurrent runs would
/// race on the maintenance sentinel and on retention deletions, so a second
/// invocation fails fast instead of queueing.
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(backup_root: &Path) -> Result<Self> {
        std::fs::create_dir_all(backup_root)?;
        let path = backup_root.join(LOCK_FILE_NAME);
        match Self::try_create(&path) {
            Err(BackupError::ConcurrentRun(_)) if holder_is_gone(&path) => {
                // A crashed or killed run never reaches Drop; reclaim its
                // lock instead of blocking every later cron invocation.
                tracing::warn!(
                    "removing stale lock file {} left by a dead process",
                    path.display()
                );
                std::fs::remove_file(&path)?;
                Self::try_create(&path)
            }
            other => other,
        }
    }

    fn try_create(path: &Path) -> Result<Self> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                Ok(RunLock { path: path.to_path_buf() })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(BackupError::ConcurrentRun(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// True only when the lock file names a pid that no longer exists. An
/// unreadable or malformed lock file is treated as held.
fn holder_is_gone(path: &Path) -> bool {
    let Ok(content) = std::fs::read_to_string(path) else {
        return false;
    };
    let Ok(pid) = content.trim().parse::<i32>() else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    matches!(
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None),
        Err(nix::errno::Errno::ESRCH)
    )
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("failed to remove lock file {}: {}", self.path.display(), e);
        }
    }
}
