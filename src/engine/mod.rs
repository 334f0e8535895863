// backuptool/src/engine/mod.rs
//
// Boundary to the container engine. The orchestrator only ever needs four
// verbs (list running services, stop one service, start the stack, exec a
// command inside a service), so they live behind a trait and the rest of the
// crate never sees `docker` itself.
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use which::which;

use crate::errors::{BackupError, Result};

#[async_trait]
pub trait Runtime: Send + Sync {
    /// Names of services the engine currently reports as running.
    async fn running_services(&self) -> Result<Vec<String>>;

    /// Stop a single service. Returning Ok only means the stop command was
    /// accepted; callers confirm via `running_services`.
    async fn stop_service(&self, name: &str) -> Result<()>;

    /// Start every service of the stack.
    async fn start_services(&self) -> Result<()>;

    /// Run a command inside a running service and capture its stdout.
    async fn exec_capture(&self, service: &str, cmd: &[&str]) -> Result<Vec<u8>>;
}

/// `docker compose` backed implementation.
pub struct DockerEngine {
    docker: PathBuf,
    compose_file: Option<PathBuf>,
    command_timeout: Duration,
}

impl DockerEngine {
    pub fn new(compose_file: Option<PathBuf>, command_timeout: Duration) -> Result<Self> {
        let docker = which("docker").map_err(|_| {
            BackupError::Engine(
                "docker executable not found in PATH; install the container engine first".into(),
            )
        })?;
        Ok(DockerEngine {
            docker,
            compose_file,
            command_timeout,
        })
    }

    fn compose_args(&self) -> Vec<String> {
        let mut args = vec!["compose".to_string()];
        if let Some(file) = &self.compose_file {
            args.push("-f".to_string());
            args.push(file.display().to_string());
        }
        args
    }

    async fn run(&self, args: Vec<String>) -> Result<std::process::Output> {
        let pretty = args.join(" ");
        tracing::debug!("running: docker {}", pretty);
        let mut cmd = Command::new(&self.docker);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = timeout(self.command_timeout, cmd.output())
            .await
            .map_err(|_| {
                BackupError::Engine(format!(
                    "`docker {}` did not finish within {:?}",
                    pretty, self.command_timeout
                ))
            })?
            .map_err(|e| BackupError::Engine(format!("failed to run `docker {}`: {}", pretty, e)))?;

        if !output.status.success() {
            return Err(BackupError::Engine(format!(
                "`docker {}` failed with status {}\nStderr: {}",
                pretty,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(output)
    }
}

#[async_trait]
impl Runtime for DockerEngine {
    async fn running_services(&self) -> Result<Vec<String>> {
        let mut args = self.compose_args();
        args.extend(
            ["ps", "--services", "--status", "running"]
                .iter()
                .map(|s| s.to_string()),
        );
        let output = self.run(args).await?;
        let services = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        Ok(services)
    }

    async fn stop_service(&self, name: &str) -> Result<()> {
        let mut args = self.compose_args();
        args.push("stop".to_string());
        args.push(name.to_string());
        self.run(args).await?;
        Ok(())
    }

    async fn start_services(&self) -> Result<()> {
        let mut args = self.compose_args();
        args.push("start".to_string());
        self.run(args).await?;
        Ok(())
    }

    async fn exec_capture(&self, service: &str, cmd: &[&str]) -> Result<Vec<u8>> {
        let mut args = self.compose_args();
        args.push("exec".to_string());
        args.push("-T".to_string());
        args.push(service.to_string());
        args.extend(cmd.iter().map(|s| s.to_string()));
        let output = self.run(args).await?;
        Ok(output.stdout)
    }
}

/// Polls `probe` up to `attempts` times, sleeping `interval` between tries.
/// Returns true as soon as the probe does, false once the bound is spent.
/// Shared by stop-confirmation and start-health confirmation.
pub async fn poll_until<F, Fut>(attempts: u32, interval: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for attempt in 1..=attempts {
        if probe().await {
            return true;
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    false
}
