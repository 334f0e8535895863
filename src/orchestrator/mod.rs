// backuptool/src/orchestrator/mod.rs
//
// The one place where ordering matters. Sequence: preflight, snapshot dir,
// raise maintenance, produce, lower maintenance, local prune, publish.
// Once raise() has succeeded, lower() runs on every exit path out of here,
// including Ctrl-C. Prune and publish failures degrade the outcome instead
// of aborting it.
use chrono::Local;
use std::future::Future;

use crate::config::AppConfig;
use crate::engine::Runtime;
use crate::errors::{BackupError, Result};
use crate::lock::RunLock;
use crate::maintenance::MaintenanceGate;
use crate::preflight::Preflight;
use crate::publish::Publisher;
use crate::retention::{self, weekday_classifier, RetentionRule, TOKEN_FORMAT};
use crate::snapshot::{Producer, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Checking,
    SnapshotDirCreated,
    MaintenanceRaised,
    Producing,
    MaintenanceLowered,
    LocalPruned,
    Published,
    Done,
}

fn enter(state: RunState) {
    tracing::info!("state: {:?}", state);
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    CompletedWithWarnings(Vec<String>),
}

pub async fn run<R: Runtime + ?Sized>(
    config: &AppConfig,
    runtime: &R,
    allow_root: bool,
) -> Result<RunOutcome> {
    run_with_shutdown(config, runtime, allow_root, wait_for_interrupt()).await
}

async fn wait_for_interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        // Without a signal stream the run simply cannot be interrupted
        // gracefully; it must still be able to finish.
        tracing::warn!("failed to listen for interrupt signals: {}", e);
        std::future::pending::<()>().await;
    }
}

/// The run proper, with the shutdown trigger passed in so tests can fire it
/// at a chosen point. The trigger is armed before the sentinel is written:
/// an interrupt anywhere between raise and produce reaches the same
/// lower-and-discard cleanup instead of killing the process mid-window.
async fn run_with_shutdown<R: Runtime + ?Sized>(
    config: &AppConfig,
    runtime: &R,
    allow_root: bool,
    shutdown: impl Future<Output = ()>,
) -> Result<RunOutcome> {
    // Held for the whole run; two concurrent runs would race on the
    // sentinel and on retention deletions.
    let _lock = RunLock::acquire(&config.backup_root)?;
    let mut shutdown = std::pin::pin!(shutdown);

    enter(RunState::Checking);
    Preflight::from_config(config, allow_root)
        .check(runtime)
        .await?;

    let token = Local::now().format(TOKEN_FORMAT).to_string();
    let token_time = retention::parse_token(&token)
        .ok_or_else(|| BackupError::Config(format!("generated token does not parse: {}", token)))?;
    let class = weekday_classifier(config.weekly_day)(token_time);
    let snapshot_dir = config.backup_root.join(&token);
    std::fs::create_dir_all(&snapshot_dir)?;
    enter(RunState::SnapshotDirCreated);
    tracing::info!("snapshot {} ({}) at {}", token, class, snapshot_dir.display());

    let gate = MaintenanceGate::new(
        runtime,
        config.sentinel_path.clone(),
        config.services.app.clone(),
        config.settle,
        config.health_attempts,
        config.health_interval,
    );

    // The shutdown branch comes first so the trigger is armed before the
    // sentinel is written; a Ctrl-C during the settle delay or the stop
    // confirmation poll lands here, not in the default disposition.
    let raise_result = tokio::select! {
        biased;
        _ = &mut shutdown => {
            tracing::warn!("interrupted, restoring service before exiting");
            Err(BackupError::Interrupted)
        }
        result = gate.raise() => result,
    };
    if let Err(e) = raise_result {
        // Best-effort lower: the sentinel may already be up and the app may
        // or may not have stopped.
        if let Err(lower_err) = gate.lower().await {
            tracing::error!("cleanup after failed raise also failed: {}", lower_err);
        }
        discard_snapshot_dir(&snapshot_dir);
        return Err(e);
    }
    enter(RunState::MaintenanceRaised);

    enter(RunState::Producing);
    let producer = Producer::new(runtime, config);
    let produce_result = tokio::select! {
        biased;
        _ = &mut shutdown => {
            tracing::warn!("interrupted, restoring service before exiting");
            Err(BackupError::Interrupted)
        }
        result = producer.produce(&snapshot_dir, &token, class) => result,
    };

    // Unconditional cleanup path: the service comes back and the sentinel
    // goes away whatever happened above.
    let lower_result = gate.lower().await;

    let snapshot: Snapshot = match (produce_result, lower_result) {
        (_, Err(lower_err)) => {
            // A failed start outranks everything else: users cannot reach
            // the service at all.
            return Err(lower_err);
        }
        (Err(produce_err), Ok(())) => {
            discard_snapshot_dir(&snapshot_dir);
            return Err(produce_err);
        }
        (Ok(snapshot), Ok(())) => snapshot,
    };
    enter(RunState::MaintenanceLowered);

    let mut warnings = Vec::new();
    if snapshot.degraded {
        warnings.push("config artifact degraded to the minimal file set".to_string());
    }

    let now = Local::now().naive_local();
    match retention::prune(
        &config.backup_root,
        &RetentionRule::KeepLast(config.local_keep_last),
        weekday_classifier(config.weekly_day),
        now,
    ) {
        Ok(deleted) => {
            enter(RunState::LocalPruned);
            tracing::info!("local retention: {} snapshot(s) pruned", deleted);
        }
        Err(e) => {
            tracing::warn!("local retention pass failed: {}", e);
            warnings.push(format!("local retention pass failed: {}", e));
        }
    }

    match &config.spaces_config {
        Some(spaces) => match publish_remote(config, spaces, now).await {
            Ok(()) => enter(RunState::Published),
            Err(e) => {
                tracing::warn!("remote publish failed: {}", e);
                warnings.push(format!("remote publish failed: {}", e));
            }
        },
        None => {
            tracing::info!("no remote store configured, skipping publish");
        }
    }

    enter(RunState::Done);
    if warnings.is_empty() {
        Ok(RunOutcome::Completed)
    } else {
        Ok(RunOutcome::CompletedWithWarnings(warnings))
    }
}

async fn publish_remote(
    config: &AppConfig,
    spaces: &crate::config::SpacesConfig,
    now: chrono::NaiveDateTime,
) -> Result<()> {
    let publisher = Publisher::connect(spaces).await?;
    let stats = publisher
        .publish(&config.backup_root, config.weekly_day, now)
        .await?;
    tracing::info!(
        "remote publish: {} file(s) uploaded, {} remote snapshot(s) pruned",
        stats.uploaded_files,
        stats.pruned_snapshots
    );
    Ok(())
}

/// A production failure leaves a half-written snapshot directory behind; it
/// must not linger, retention would otherwise treat it as a valid snapshot.
fn discard_snapshot_dir(snapshot_dir: &std::path::Path) {
    if let Err(e) = std::fs::remove_dir_all(snapshot_dir) {
        tracing::warn!(
            "failed to discard incomplete snapshot {}: {}",
            snapshot_dir.display(),
            e
        );
    }
}

/// Standalone local retention pass (the cron entry point that runs between
/// full backups). Takes the same lock as a full run.
pub fn prune_local(config: &AppConfig) -> Result<usize> {
    let _lock = RunLock::acquire(&config.backup_root)?;
    retention::prune(
        &config.backup_root,
        &RetentionRule::KeepLast(config.local_keep_last),
        weekday_classifier(config.weekly_day),
        Local::now().naive_local(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PathsConfig, ServicesConfig};
    use crate::engine::testing::FakeRuntime;
    use crate::errors::ArtifactKind;
    use chrono::Weekday;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    fn test_config(root: &Path) -> AppConfig {
        let uploads = root.join("uploads");
        fs::create_dir_all(&uploads).unwrap();
        fs::write(uploads.join("doc.txt"), "content").unwrap();
        let env_file = root.join(".env");
        fs::write(&env_file, "APP_SECRET=x").unwrap();
        let proxy = root.join("conf.d");
        fs::create_dir_all(&proxy).unwrap();
        fs::write(proxy.join("site.conf"), "server {}").unwrap();

        AppConfig {
            backup_root: root.join("backups"),
            sentinel_path: root.join("maintenance.flag"),
            log_file: None,
            compose_file: None,
            db_user: "postgres".into(),
            weekly_day: Weekday::Sun,
            settle: Duration::ZERO,
            min_free_bytes: 0,
            local_keep_last: 2,
            command_timeout: Duration::from_secs(5),
            health_attempts: 2,
            health_interval: Duration::from_millis(1),
            services: ServicesConfig {
                app: "app".into(),
                database: "db".into(),
                proxy: "proxy".into(),
            },
            paths: PathsConfig {
                uploads_dir: uploads,
                env_file,
                compose_files: vec![],
                proxy_conf_dir: proxy,
                cert_dir: None,
                cert_exclude_subdir: "archive".into(),
            },
            spaces_config: None,
        }
    }

    fn healthy_runtime() -> FakeRuntime {
        let runtime = FakeRuntime::with_running(&["app", "db", "proxy"]);
        runtime.state.lock().unwrap().exec_output =
            b"CREATE ROLE app;\n-- PostgreSQL database cluster dump complete\n".to_vec();
        runtime
    }

    #[tokio::test]
    async fn happy_path_completes_and_leaves_no_window() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let runtime = healthy_runtime();

        let outcome = run(&config, &runtime, true).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed));

        // Sentinel absent and app back in the running set.
        assert!(!config.sentinel_path.exists());
        assert!(runtime
            .state
            .lock()
            .unwrap()
            .running
            .contains(&"app".to_string()));

        // Exactly one snapshot with three artifacts and a summary.
        let snapshots: Vec<_> = fs::read_dir(&config.backup_root)
            .unwrap()
            .map(|e| e.unwrap())
            .filter(|e| e.path().is_dir())
            .collect();
        assert_eq!(snapshots.len(), 1);
        let snapshot_dir = snapshots[0].path();
        let token = snapshots[0].file_name().to_string_lossy().into_owned();
        let summary =
            fs::read_to_string(snapshot_dir.join(format!("{}_summary.txt", token))).unwrap();
        assert!(summary.contains("status: OK"));
        assert_eq!(summary.matches("artifact:").count(), 3);

        // Exactly one raise and one lower.
        let calls = runtime.calls();
        assert_eq!(calls.iter().filter(|c| *c == "stop app").count(), 1);
        assert_eq!(calls.iter().filter(|c| *c == "start").count(), 1);
    }

    #[tokio::test]
    async fn precondition_failure_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.min_free_bytes = u64::MAX;
        let runtime = healthy_runtime();

        match run(&config, &runtime, true).await {
            Err(BackupError::DiskSpace { .. }) => {}
            other => panic!("expected DiskSpace, got {:?}", other.map(|_| ())),
        }
        assert!(!config.sentinel_path.exists());
        assert!(runtime.calls().iter().all(|c| c != "stop app" && c != "start"));
        // No snapshot directory was created.
        assert!(fs::read_dir(&config.backup_root)
            .unwrap()
            .all(|e| !e.unwrap().path().is_dir()));
    }

    #[tokio::test]
    async fn artifact_failure_still_restores_service() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        // Files capture will fail mid-production.
        config.paths.uploads_dir = dir.path().join("gone");
        let runtime = healthy_runtime();

        match run(&config, &runtime, true).await {
            Err(BackupError::Artifact { kind, .. }) => assert_eq!(kind, ArtifactKind::Files),
            other => panic!("expected ArtifactError, got {:?}", other.map(|_| ())),
        }

        // Maintenance invariant: window closed, app running again.
        assert!(!config.sentinel_path.exists());
        assert!(runtime
            .state
            .lock()
            .unwrap()
            .running
            .contains(&"app".to_string()));
        let calls = runtime.calls();
        assert_eq!(calls.iter().filter(|c| *c == "stop app").count(), 1);
        assert_eq!(calls.iter().filter(|c| *c == "start").count(), 1);

        // The incomplete snapshot was discarded.
        assert!(fs::read_dir(&config.backup_root)
            .unwrap()
            .all(|e| !e.unwrap().path().is_dir()));
    }

    #[tokio::test]
    async fn failed_restart_is_the_fatal_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.paths.uploads_dir = dir.path().join("gone");
        let runtime = healthy_runtime();
        runtime.state.lock().unwrap().fail_start = true;

        match run(&config, &runtime, true).await {
            Err(e @ BackupError::ServiceStart(_)) => assert_eq!(e.exit_code(), 4),
            other => panic!("expected ServiceStart, got {:?}", other.map(|_| ())),
        }
        // The notice page stays up rather than exposing a dead upstream.
        assert!(config.sentinel_path.exists());
    }

    #[tokio::test]
    async fn interrupt_while_raising_still_restores_service() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let runtime = healthy_runtime();
        let interrupt = std::sync::Arc::new(tokio::sync::Notify::new());
        {
            let mut state = runtime.state.lock().unwrap();
            // The stop is accepted but never takes effect, so the run is
            // stuck in the stop confirmation poll when the interrupt lands.
            state.stop_is_noop = true;
            state.notify_on_stop = Some(interrupt.clone());
        }

        let trigger = interrupt.clone();
        let shutdown = async move { trigger.notified().await };
        match run_with_shutdown(&config, &runtime, true, shutdown).await {
            Err(BackupError::Interrupted) => {}
            other => panic!("expected Interrupted, got {:?}", other.map(|_| ())),
        }

        // Window closed, stack started, half-written snapshot gone.
        assert!(!config.sentinel_path.exists());
        assert!(runtime.calls().contains(&"start".to_string()));
        assert!(fs::read_dir(&config.backup_root)
            .unwrap()
            .all(|e| !e.unwrap().path().is_dir()));
        // The lock was released, so the next cron run is not shut out.
        RunLock::acquire(&config.backup_root).unwrap();
    }

    #[tokio::test]
    async fn concurrent_runs_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let runtime = healthy_runtime();

        let _held = RunLock::acquire(&config.backup_root).unwrap();
        match run(&config, &runtime, true).await {
            Err(BackupError::ConcurrentRun(_)) => {}
            other => panic!("expected ConcurrentRun, got {:?}", other.map(|_| ())),
        }
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn repeated_runs_respect_local_retention() {
        use chrono::Datelike;

        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        let runtime = healthy_runtime();

        // Pin the weekly day away from the dates in play so every snapshot
        // in this test is daily-class whatever day it runs on.
        let now = Local::now();
        config.weekly_day = now.date_naive().weekday().succ();

        // Seed two older snapshots; a new run prunes down to keep-last 2.
        let seeded: Vec<String> = (1..=2)
            .map(|d| (now - chrono::Duration::days(d)).format(TOKEN_FORMAT).to_string())
            .collect();
        for token in &seeded {
            fs::create_dir_all(config.backup_root.join(token).join("database")).unwrap();
        }
        run(&config, &runtime, true).await.unwrap();

        let mut names: Vec<String> = fs::read_dir(&config.backup_root)
            .unwrap()
            .map(|e| e.unwrap())
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);
        // The oldest seeded snapshot is gone, the fresh one survives.
        assert_eq!(names[0], seeded[0]);
        assert!(names[1] > seeded[0]);
    }
}
