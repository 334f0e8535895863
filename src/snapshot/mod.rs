// backuptool/src/snapshot/mod.rs
pub(crate) mod archive;
pub(crate) mod db_dump;

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::AppConfig;
use crate::engine::Runtime;
use crate::errors::{ArtifactKind, BackupError, Result};
use crate::retention::SnapshotClass;

/// One captured file inside a snapshot.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub size: u64,
}

/// A fully produced, verified snapshot. Immutable once this value exists;
/// only the retention pruner removes it.
#[derive(Debug)]
pub struct Snapshot {
    pub token: String,
    pub dir: PathBuf,
    pub class: SnapshotClass,
    pub artifacts: Vec<Artifact>,
    /// True when the config artifact fell back to the minimal file set.
    pub degraded: bool,
    pub summary_path: PathBuf,
}

pub struct Producer<'a, R: Runtime + ?Sized> {
    runtime: &'a R,
    config: &'a AppConfig,
}

impl<'a, R: Runtime + ?Sized> Producer<'a, R> {
    pub fn new(runtime: &'a R, config: &'a AppConfig) -> Self {
        Producer { runtime, config }
    }

    /// Captures the three artifacts into `snapshot_dir` and writes the
    /// summary. Each capture is verified immediately; the first failure
    /// aborts the remaining steps with the failing kind.
    pub async fn produce(
        &self,
        snapshot_dir: &Path,
        token: &str,
        class: SnapshotClass,
    ) -> Result<Snapshot> {
        let database = self.capture_database(snapshot_dir, token).await?;
        let files = self.capture_files(snapshot_dir, token)?;
        let (config, degraded) = self.capture_config(snapshot_dir, token)?;

        let artifacts = vec![database, files, config];
        let summary_path = write_summary(snapshot_dir, token, class, &artifacts, degraded)?;

        Ok(Snapshot {
            token: token.to_string(),
            dir: snapshot_dir.to_path_buf(),
            class,
            artifacts,
            degraded,
            summary_path,
        })
    }

    async fn capture_database(&self, snapshot_dir: &Path, token: &str) -> Result<Artifact> {
        let dest_dir = snapshot_dir.join("database");
        std::fs::create_dir_all(&dest_dir)?;
        let dest = dest_dir.join(format!("{}_database.sql.gz", token));

        tracing::info!("capturing database artifact to {}", dest.display());
        let size = db_dump::dump_cluster(
            self.runtime,
            &self.config.services.database,
            &self.config.db_user,
            &dest,
        )
        .await
        .map_err(|e| artifact_error(ArtifactKind::Database, &e))?;
        db_dump::verify_dump(&dest).map_err(|e| artifact_error(ArtifactKind::Database, &e))?;

        Ok(Artifact {
            kind: ArtifactKind::Database,
            path: dest,
            size,
        })
    }

    fn capture_files(&self, snapshot_dir: &Path, token: &str) -> Result<Artifact> {
        let dest_dir = snapshot_dir.join("data");
        std::fs::create_dir_all(&dest_dir)?;
        let dest = dest_dir.join(format!("{}_data.tar.gz", token));

        // Only durable user content. Logs and plugin caches are rebuildable
        // and would balloon the artifact.
        tracing::info!(
            "capturing files artifact from {}",
            self.config.paths.uploads_dir.display()
        );
        archive::create_tar_gz(&dest, &[self.config.paths.uploads_dir.clone()], &[])
            .map_err(|e| artifact_error(ArtifactKind::Files, &e))?;
        verify_archive(&dest, ArtifactKind::Files)?;

        let size = std::fs::metadata(&dest)?.len();
        Ok(Artifact {
            kind: ArtifactKind::Files,
            path: dest,
            size,
        })
    }

    /// Config capture: env + compose + proxy config + cert material, with the
    /// CA's history subtree excluded. If that fails, fall back to the minimal
    /// required set and report the snapshot as degraded instead of failing.
    fn capture_config(&self, snapshot_dir: &Path, token: &str) -> Result<(Artifact, bool)> {
        let dest_dir = snapshot_dir.join("config");
        std::fs::create_dir_all(&dest_dir)?;
        let dest = dest_dir.join(format!("{}_config.tar.gz", token));
        let paths = &self.config.paths;

        let mut full_sources = vec![paths.env_file.clone()];
        full_sources.extend(paths.compose_files.iter().cloned());
        full_sources.push(paths.proxy_conf_dir.clone());
        let mut excludes = Vec::new();
        if let Some(cert_dir) = &paths.cert_dir {
            full_sources.push(cert_dir.clone());
            excludes.push(cert_dir.join(&paths.cert_exclude_subdir));
        }

        tracing::info!("capturing config artifact to {}", dest.display());
        let full = archive::create_tar_gz(&dest, &full_sources, &excludes)
            .and_then(|_| verify_archive_anyhow(&dest));

        let degraded = match full {
            Ok(()) => false,
            Err(e) => {
                tracing::warn!(
                    "full config capture failed ({:#}), falling back to the minimal set",
                    e
                );
                let mut minimal = vec![paths.env_file.clone()];
                minimal.extend(paths.compose_files.iter().cloned());
                minimal.push(paths.proxy_conf_dir.clone());
                archive::create_tar_gz(&dest, &minimal, &[])
                    .map_err(|e| artifact_error(ArtifactKind::Config, &e))?;
                verify_archive(&dest, ArtifactKind::Config)?;
                true
            }
        };

        let size = std::fs::metadata(&dest)?.len();
        Ok((
            Artifact {
                kind: ArtifactKind::Config,
                path: dest,
                size,
            },
            degraded,
        ))
    }
}

fn artifact_error(kind: ArtifactKind, err: &anyhow::Error) -> BackupError {
    BackupError::Artifact {
        kind,
        reason: format!("{:#}", err),
    }
}

fn verify_archive_anyhow(path: &Path) -> anyhow::Result<()> {
    let size = std::fs::metadata(path)?.len();
    if size == 0 {
        anyhow::bail!("archive {} is empty", path.display());
    }
    let entries = archive::entry_count(path)?;
    if entries == 0 {
        anyhow::bail!("archive {} contains no files", path.display());
    }
    Ok(())
}

fn verify_archive(path: &Path, kind: ArtifactKind) -> Result<()> {
    verify_archive_anyhow(path).map_err(|e| artifact_error(kind, &e))
}

/// Human-readable summary written at the snapshot top level. Other tooling
/// greps this; keep the artifact lines `name<TAB>bytes`.
fn write_summary(
    snapshot_dir: &Path,
    token: &str,
    class: SnapshotClass,
    artifacts: &[Artifact],
    degraded: bool,
) -> Result<PathBuf> {
    let path = snapshot_dir.join(format!("{}_summary.txt", token));
    let mut file = std::fs::File::create(&path)?;

    writeln!(file, "snapshot: {}", token)?;
    writeln!(file, "class: {}", class)?;
    let mut total = 0u64;
    for artifact in artifacts {
        let name = artifact
            .path
            .strip_prefix(snapshot_dir)
            .unwrap_or(&artifact.path);
        writeln!(file, "artifact: {}\t{}", name.display(), artifact.size)?;
        total += artifact.size;
    }
    writeln!(file, "total_bytes: {}", total)?;
    if let Ok(free) = crate::preflight::free_space_of(snapshot_dir) {
        writeln!(file, "free_disk_bytes: {}", free)?;
    }
    writeln!(
        file,
        "status: {}",
        if degraded { "DEGRADED (minimal config set)" } else { "OK" }
    )?;
    Ok(path)
}
