//! Backup orchestrator for a self-hosted collaboration stack.
//!
//! Produces a consistent point-in-time snapshot (database dump, uploads
//! archive, config archive) behind a maintenance window, applies local
//! retention, and mirrors the retention root to an S3-compatible store.

// backuptool/src/main.rs
mod config;
mod engine;
mod errors;
mod lock;
mod logging;
mod maintenance;
mod orchestrator;
mod preflight;
mod publish;
mod retention;
mod snapshot;

use config::AppConfig;
use engine::DockerEngine;
use errors::BackupError;
use orchestrator::RunOutcome;
use preflight::Preflight;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

struct CliArgs {
    command: String,
    verbose: bool,
    allow_root: bool,
    config_path: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    let args = match parse_args(env::args().skip(1)) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{}", msg);
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    let app_config = match AppConfig::load_from_json(&args.config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init(args.verbose, app_config.log_file.as_deref()) {
        eprintln!("Error: {:?}", e);
        return ExitCode::FAILURE;
    }

    match run_app(&args, &app_config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run_app(args: &CliArgs, config: &AppConfig) -> errors::Result<()> {
    match args.command.as_str() {
        "run" | "backup" => {
            let engine = DockerEngine::new(config.compose_file.clone(), config.command_timeout)?;
            match orchestrator::run(config, &engine, args.allow_root).await? {
                RunOutcome::Completed => {
                    tracing::info!("backup run completed");
                }
                RunOutcome::CompletedWithWarnings(warnings) => {
                    for warning in &warnings {
                        tracing::warn!("{}", warning);
                    }
                    tracing::info!("backup run completed with {} warning(s)", warnings.len());
                }
            }
            Ok(())
        }
        "prune" => {
            let deleted = orchestrator::prune_local(config)?;
            tracing::info!("local retention: {} snapshot(s) pruned", deleted);
            Ok(())
        }
        "check" => {
            let engine = DockerEngine::new(config.compose_file.clone(), config.command_timeout)?;
            Preflight::from_config(config, args.allow_root)
                .check(&engine)
                .await?;
            tracing::info!("all preconditions satisfied");
            Ok(())
        }
        other => Err(BackupError::Config(format!("unknown command: {}", other))),
    }
}

fn parse_args(raw: impl Iterator<Item = String>) -> Result<CliArgs, String> {
    let mut command = None;
    let mut verbose = false;
    let mut allow_root = false;
    let mut config_path = PathBuf::from("config.json");

    let mut raw = raw;
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "-v" | "--verbose" => verbose = true,
            "--allow-root" => allow_root = true,
            "--config" => {
                let value = raw
                    .next()
                    .ok_or_else(|| "--config requires a path".to_string())?;
                config_path = PathBuf::from(value);
            }
            flag if flag.starts_with('-') => {
                return Err(format!("unknown flag: {}", flag));
            }
            positional => {
                if command.is_some() {
                    return Err(format!("unexpected argument: {}", positional));
                }
                command = Some(positional.to_string());
            }
        }
    }

    Ok(CliArgs {
        command: command.unwrap_or_else(|| "run".to_string()),
        verbose,
        allow_root,
        config_path,
    })
}

fn print_usage() {
    eprintln!("Usage: backuptool [run|prune|check] [--verbose] [--allow-root] [--config <path>]");
    eprintln!("  run    produce a snapshot behind a maintenance window, then prune and publish (default)");
    eprintln!("  prune  apply local retention only");
    eprintln!("  check  run the preflight checks and exit");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<CliArgs, String> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn defaults_to_run() {
        let parsed = args(&[]).unwrap();
        assert_eq!(parsed.command, "run");
        assert!(!parsed.verbose);
        assert!(!parsed.allow_root);
        assert_eq!(parsed.config_path, PathBuf::from("config.json"));
    }

    #[test]
    fn flags_and_command_in_any_order() {
        let parsed = args(&["--verbose", "prune", "--config", "/etc/backuptool.json"]).unwrap();
        assert_eq!(parsed.command, "prune");
        assert!(parsed.verbose);
        assert_eq!(parsed.config_path, PathBuf::from("/etc/backuptool.json"));
    }

    #[test]
    fn rejects_unknown_flags_and_extra_positionals() {
        assert!(args(&["--frobnicate"]).is_err());
        assert!(args(&["run", "extra"]).is_err());
        assert!(args(&["--config"]).is_err());
    }
}
