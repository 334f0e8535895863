// backuptool/src/maintenance/mod.rs
//
// Maintenance window controller. The sentinel file is the single shared piece
// of state between this process and the reverse proxy: the proxy serves the
// notice page whenever the file exists. This process is the only writer.
use chrono::Local;
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::{poll_until, Runtime};
use crate::errors::{BackupError, Result};

const STOP_CONFIRM_ATTEMPTS: u32 = 10;
const STOP_CONFIRM_INTERVAL: Duration = Duration::from_secs(1);

pub struct MaintenanceGate<'a, R: Runtime + ?Sized> {
    runtime: &'a R,
    sentinel: PathBuf,
    app_service: String,
    /// Must be at least the proxy's config-poll interval so in-flight
    /// requests drain before the app is cut over.
    settle: Duration,
    health_attempts: u32,
    health_interval: Duration,
}

impl<'a, R: Runtime + ?Sized> MaintenanceGate<'a, R> {
    pub fn new(
        runtime: &'a R,
        sentinel: PathBuf,
        app_service: String,
        settle: Duration,
        health_attempts: u32,
        health_interval: Duration,
    ) -> Self {
        MaintenanceGate {
            runtime,
            sentinel,
            app_service,
            settle,
            health_attempts,
            health_interval,
        }
    }

    pub fn is_raised(&self) -> bool {
        self.sentinel.exists()
    }

    /// Raise the window: sentinel first, settle delay, then stop the app and
    /// confirm it is gone from the engine's service list. On failure the
    /// sentinel is left in place; the caller's unconditional `lower()` owns
    /// the cleanup.
    pub async fn raise(&self) -> Result<()> {
        tracing::info!("raising maintenance window");
        std::fs::write(
            &self.sentinel,
            format!("maintenance since {}\n", Local::now().format("%Y-%m-%d %H:%M:%S")),
        )?;
        tokio::time::sleep(self.settle).await;

        self.runtime.stop_service(&self.app_service).await?;

        let app = self.app_service.clone();
        let stopped = poll_until(STOP_CONFIRM_ATTEMPTS, STOP_CONFIRM_INTERVAL, || {
            let app = app.clone();
            async move {
                match self.runtime.running_services().await {
                    Ok(running) => !running.iter().any(|s| s == &app),
                    Err(e) => {
                        tracing::debug!("service list poll failed: {}", e);
                        false
                    }
                }
            }
        })
        .await;

        if !stopped {
            return Err(BackupError::ServiceStop(self.app_service.clone()));
        }
        tracing::info!("app service {} stopped, window is open", self.app_service);
        Ok(())
    }

    /// Lower the window: start the stack, confirm health best-effort, remove
    /// the sentinel last. A failed start command is the one fatal outcome
    /// here and deliberately leaves the sentinel up, so users keep seeing the
    /// notice page instead of a raw upstream error. A start that merely has
    /// not reported healthy within the bound is only a warning.
    pub async fn lower(&self) -> Result<()> {
        tracing::info!("lowering maintenance window");
        self.runtime
            .start_services()
            .await
            .map_err(|e| {
                tracing::error!("start command failed: {}", e);
                BackupError::ServiceStart(self.app_service.clone())
            })?;

        let app = self.app_service.clone();
        let healthy = poll_until(self.health_attempts, self.health_interval, || {
            let app = app.clone();
            async move {
                match self.runtime.running_services().await {
                    Ok(running) => running.iter().any(|s| s == &app),
                    Err(_) => false,
                }
            }
        })
        .await;

        if !healthy {
            tracing::warn!(
                "app service {} not reporting running after {} attempts; \
                 continuing anyway, the start command itself succeeded",
                self.app_service,
                self.health_attempts
            );
        }

        if self.sentinel.exists() {
            if let Err(e) = std::fs::remove_file(&self.sentinel) {
                // The service is back but the proxy keeps serving the notice
                // page; this must not drown in the generic I/O bucket.
                tracing::error!(
                    "service {} is running but the sentinel {} could not be removed: {}; \
                     remove it by hand to restore the site",
                    self.app_service,
                    self.sentinel.display(),
                    e
                );
                return Err(BackupError::SentinelStuck {
                    path: self.sentinel.clone(),
                    source: e,
                });
            }
        }
        tracing::info!("maintenance window closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::FakeRuntime;

    fn gate<'a>(runtime: &'a FakeRuntime, sentinel: PathBuf) -> MaintenanceGate<'a, FakeRuntime> {
        MaintenanceGate::new(
            runtime,
            sentinel,
            "app".to_string(),
            Duration::ZERO,
            3,
            Duration::from_millis(1),
        )
    }

    #[tokio::test]
    async fn raise_writes_sentinel_then_stops_app() {
        let dir = tempfile::tempdir().unwrap();
        let sentinel = dir.path().join("maintenance.flag");
        let runtime = FakeRuntime::with_running(&["app", "db", "proxy"]);
        let gate = gate(&runtime, sentinel.clone());

        gate.raise().await.unwrap();
        assert!(gate.is_raised());
        let calls = runtime.calls();
        assert_eq!(calls[0], "stop app");
        assert!(calls[1..].iter().all(|c| c == "ps"));
    }

    #[tokio::test]
    async fn raise_fails_when_app_refuses_to_stop() {
        let dir = tempfile::tempdir().unwrap();
        let sentinel = dir.path().join("maintenance.flag");
        let runtime = FakeRuntime::with_running(&["app", "db", "proxy"]);
        runtime.state.lock().unwrap().stop_is_noop = true;
        let gate = gate(&runtime, sentinel.clone());

        match gate.raise().await {
            Err(BackupError::ServiceStop(name)) => assert_eq!(name, "app"),
            other => panic!("expected ServiceStop, got {:?}", other.map(|_| ())),
        }
        // Sentinel stays up for the caller's unconditional lower().
        assert!(sentinel.exists());
    }

    #[tokio::test]
    async fn lower_starts_and_removes_sentinel_last() {
        let dir = tempfile::tempdir().unwrap();
        let sentinel = dir.path().join("maintenance.flag");
        let runtime = FakeRuntime::with_running(&["app", "db", "proxy"]);
        let gate = gate(&runtime, sentinel.clone());

        gate.raise().await.unwrap();
        gate.lower().await.unwrap();
        assert!(!sentinel.exists());
        assert!(runtime.calls().contains(&"start".to_string()));
    }

    #[tokio::test]
    async fn lower_tolerates_slow_health_reports() {
        let dir = tempfile::tempdir().unwrap();
        let sentinel = dir.path().join("maintenance.flag");
        let runtime = FakeRuntime::with_running(&["app", "db", "proxy"]);
        let gate = gate(&runtime, sentinel.clone());

        gate.raise().await.unwrap();
        runtime.state.lock().unwrap().start_lag = 2;
        gate.lower().await.unwrap();
        assert!(!sentinel.exists());
    }

    #[tokio::test]
    async fn unremovable_sentinel_is_its_own_failure() {
        let dir = tempfile::tempdir().unwrap();
        // A directory in the sentinel's place defeats remove_file even for
        // the superuser.
        let sentinel = dir.path().join("maintenance.flag");
        std::fs::create_dir(&sentinel).unwrap();
        let runtime = FakeRuntime::with_running(&["app", "db", "proxy"]);
        let gate = gate(&runtime, sentinel.clone());

        match gate.lower().await {
            Err(BackupError::SentinelStuck { path, .. }) => assert_eq!(path, sentinel),
            other => panic!("expected SentinelStuck, got {:?}", other.map(|_| ())),
        }
        assert!(sentinel.exists());
        assert!(runtime.calls().contains(&"start".to_string()));
    }

    #[tokio::test]
    async fn failed_start_is_fatal_and_keeps_the_notice_up() {
        let dir = tempfile::tempdir().unwrap();
        let sentinel = dir.path().join("maintenance.flag");
        let runtime = FakeRuntime::with_running(&["app", "db", "proxy"]);
        let gate = gate(&runtime, sentinel.clone());

        gate.raise().await.unwrap();
        runtime.state.lock().unwrap().fail_start = true;
        match gate.lower().await {
            Err(BackupError::ServiceStart(name)) => assert_eq!(name, "app"),
            other => panic!("expected ServiceStart, got {:?}", other.map(|_| ())),
        }
        assert!(sentinel.exists());
    }
}
