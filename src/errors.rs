// backuptool/src/errors.rs
use std::path::PathBuf;
use thiserror::Error;

/// Artifact kinds a snapshot must contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Database,
    Files,
    Config,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactKind::Database => write!(f, "database"),
            ArtifactKind::Files => write!(f, "files"),
            ArtifactKind::Config => write!(f, "config"),
        }
    }
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("refusing to run as the superuser (pass --allow-root to override)")]
    Privilege,

    #[error("not enough free disk space: required {required} bytes, available {available} bytes")]
    DiskSpace { required: u64, available: u64 },

    #[error("service not ready: {0}")]
    ServiceNotReady(String),

    #[error("another backup run is already active (lock file {0})")]
    ConcurrentRun(PathBuf),

    #[error("service {0} still reported running after the stop window")]
    ServiceStop(String),

    #[error("failed to start service {0}; site is left unserved, manual intervention required")]
    ServiceStart(String),

    #[error(
        "service is running but the maintenance sentinel {path} could not be removed: {source}; \
         users keep seeing the notice page"
    )]
    SentinelStuck {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{kind} artifact capture failed: {reason}")]
    Artifact { kind: ArtifactKind, reason: String },

    #[error("remote publish failed: {0}")]
    Publish(String),

    #[error("container engine call failed: {0}")]
    Engine(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("run interrupted by signal")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BackupError {
    /// Process exit code for the CLI. Preconditions, production failures and
    /// a failed service restart each get their own code so cron wrappers can
    /// tell them apart.
    pub fn exit_code(&self) -> u8 {
        match self {
            BackupError::Privilege
            | BackupError::DiskSpace { .. }
            | BackupError::ServiceNotReady(_) => 2,
            BackupError::Artifact { .. } | BackupError::Interrupted => 3,
            BackupError::ServiceStart(_) | BackupError::SentinelStuck { .. } => 4,
            BackupError::ConcurrentRun(_) => 5,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
