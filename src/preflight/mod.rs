// backuptool/src/preflight/mod.rs
//
// Pre-flight gate: everything here is pure validation. Nothing is stopped,
// written or deleted until every check has passed.
use std::path::{Path, PathBuf};

use crate::config::{AppConfig, ServicesConfig};
use crate::engine::Runtime;
use crate::errors::{BackupError, Result};

pub struct Preflight {
    pub allow_root: bool,
    pub min_free_bytes: u64,
    pub backup_root: PathBuf,
    pub services: ServicesConfig,
    pub db_user: String,
}

impl Preflight {
    pub fn from_config(config: &AppConfig, allow_root: bool) -> Self {
        Preflight {
            allow_root,
            min_free_bytes: config.min_free_bytes,
            backup_root: config.backup_root.clone(),
            services: config.services.clone(),
            db_user: config.db_user.clone(),
        }
    }

    /// Runs the checks in order, short-circuiting on the first failure:
    /// privilege, disk space, then subsystem health.
    pub async fn check<R: Runtime + ?Sized>(&self, runtime: &R) -> Result<()> {
        let is_root = nix::unistd::Uid::effective().is_root();
        if !privilege_ok(is_root, self.allow_root) {
            return Err(BackupError::Privilege);
        }

        let available = free_space_of(&self.backup_root)?;
        if !disk_ok(available, self.min_free_bytes) {
            return Err(BackupError::DiskSpace {
                required: self.min_free_bytes,
                available,
            });
        }
        tracing::debug!(
            "disk check passed: {} bytes free, {} required",
            available,
            self.min_free_bytes
        );

        let running = runtime.running_services().await?;
        for name in [
            &self.services.app,
            &self.services.database,
            &self.services.proxy,
        ] {
            if !running.iter().any(|s| s == name) {
                return Err(BackupError::ServiceNotReady(name.clone()));
            }
        }

        runtime
            .exec_capture(&self.services.database, &["pg_isready", "-U", &self.db_user])
            .await
            .map_err(|e| {
                BackupError::ServiceNotReady(format!(
                    "{} (pg_isready): {}",
                    self.services.database, e
                ))
            })?;

        tracing::info!("preflight checks passed");
        Ok(())
    }
}

fn privilege_ok(is_root: bool, allow_root: bool) -> bool {
    !is_root || allow_root
}

fn disk_ok(available: u64, required: u64) -> bool {
    available >= required
}

/// Free bytes on the filesystem holding `path`, probing the deepest existing
/// ancestor so the check also works before the backup root has been created.
pub(crate) fn free_space_of(path: &Path) -> Result<u64> {
    let mut probe = path;
    while !probe.exists() {
        probe = probe
            .parent()
            .ok_or_else(|| BackupError::Config(format!("no existing ancestor of {}", path.display())))?;
    }
    let stat = nix::sys::statvfs::statvfs(probe)
        .map_err(|e| BackupError::Config(format!("statvfs on {} failed: {}", probe.display(), e)))?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}
