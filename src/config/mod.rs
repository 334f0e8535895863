// backuptool/src/config/mod.rs
use anyhow::{Context, Result};
use chrono::Weekday;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_MIN_FREE_BYTES: u64 = 2 * 1024 * 1024 * 1024; // 2 GiB
const DEFAULT_SETTLE_SECS: u64 = 2;
const DEFAULT_LOCAL_KEEP_LAST: usize = 2;
const DEFAULT_REMOTE_DAILY_DAYS: i64 = 7;
const DEFAULT_REMOTE_WEEKLY_DAYS: i64 = 28;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 600;
const DEFAULT_HEALTH_ATTEMPTS: u32 = 30;
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 2;

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
    pub daily_retention_days: Option<i64>,
    pub weekly_retention_days: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonServicesConfig {
    pub app: Option<String>,
    pub database: Option<String>,
    pub proxy: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonPathsConfig {
    pub uploads_dir: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    pub compose_files: Option<Vec<PathBuf>>,
    pub proxy_conf_dir: Option<PathBuf>,
    pub cert_dir: Option<PathBuf>,
    pub cert_exclude_subdir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub backup_root: Option<PathBuf>,
    pub sentinel_path: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub compose_file: Option<PathBuf>,
    pub db_user: Option<String>,
    pub weekly_day: Option<String>,
    pub settle_secs: Option<u64>,
    pub min_free_bytes: Option<u64>,
    pub local_keep_last: Option<usize>,
    pub command_timeout_secs: Option<u64>,
    pub health_attempts: Option<u32>,
    pub health_interval_secs: Option<u64>,
    pub services: Option<JsonServicesConfig>,
    pub paths: Option<JsonPathsConfig>,
    pub s3_storage: Option<JsonS3StorageConfig>,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct SpacesConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub folder_prefix: Option<String>,
    pub daily_retention: Duration,
    pub weekly_retention: Duration,
}

#[derive(Debug, Clone)]
pub struct ServicesConfig {
    pub app: String,
    pub database: String,
    pub proxy: String,
}

#[derive(Debug, Clone)]
pub struct PathsConfig {
    pub uploads_dir: PathBuf,
    pub env_file: PathBuf,
    pub compose_files: Vec<PathBuf>,
    pub proxy_conf_dir: PathBuf,
    pub cert_dir: Option<PathBuf>,
    /// Subdirectory of `cert_dir` that is excluded from the config artifact
    /// (the CA keeps every historical key/cert there and it grows unbounded).
    pub cert_exclude_subdir: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub backup_root: PathBuf,
    pub sentinel_path: PathBuf,
    pub log_file: Option<PathBuf>,
    pub compose_file: Option<PathBuf>,
    pub db_user: String,
    pub weekly_day: Weekday,
    pub settle: Duration,
    pub min_free_bytes: u64,
    pub local_keep_last: usize,
    pub command_timeout: Duration,
    pub health_attempts: u32,
    pub health_interval: Duration,
    pub services: ServicesConfig,
    pub paths: PathsConfig,
    pub spaces_config: Option<SpacesConfig>,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw: RawJsonConfig = serde_json::from_str(&config_content).with_context(|| {
            format!(
                "Failed to parse JSON from config file at {}",
                config_path.display()
            )
        })?;
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawJsonConfig) -> Result<Self> {
        let backup_root = raw
            .backup_root
            .context("backup_root must be set in config.json")?;
        if backup_root.as_os_str().is_empty() {
            anyhow::bail!("backup_root cannot be empty in config.json");
        }

        let sentinel_path = raw
            .sentinel_path
            .context("sentinel_path must be set in config.json")?;

        let services_raw = raw.services.context("services must be set in config.json")?;
        let services = ServicesConfig {
            app: services_raw
                .app
                .context("services.app must be set in config.json")?,
            database: services_raw
                .database
                .context("services.database must be set in config.json")?,
            proxy: services_raw
                .proxy
                .context("services.proxy must be set in config.json")?,
        };

        let paths_raw = raw.paths.context("paths must be set in config.json")?;
        let paths = PathsConfig {
            uploads_dir: paths_raw
                .uploads_dir
                .context("paths.uploads_dir must be set in config.json")?,
            env_file: paths_raw
                .env_file
                .context("paths.env_file must be set in config.json")?,
            compose_files: paths_raw
                .compose_files
                .unwrap_or_default(),
            proxy_conf_dir: paths_raw
                .proxy_conf_dir
                .context("paths.proxy_conf_dir must be set in config.json")?,
            cert_dir: paths_raw.cert_dir,
            cert_exclude_subdir: paths_raw
                .cert_exclude_subdir
                .unwrap_or_else(|| "archive".to_string()),
        };

        let weekly_day = match raw.weekly_day.as_deref() {
            None => Weekday::Sun,
            Some(day) => day
                .parse::<Weekday>()
                .map_err(|_| anyhow::anyhow!("weekly_day is not a valid weekday name: {}", day))?,
        };

        let spaces_config = raw.s3_storage.as_ref().and_then(|s3_raw| {
            if let (Some(bucket), Some(region), Some(key_id), Some(secret), Some(endpoint)) = (
                s3_raw.bucket_name.as_ref().filter(|s| !s.is_empty()),
                s3_raw.region.as_ref().filter(|s| !s.is_empty()),
                s3_raw.access_key_id.as_ref().filter(|s| !s.is_empty()),
                s3_raw.secret_access_key.as_ref().filter(|s| !s.is_empty()),
                s3_raw.endpoint_url.as_ref().filter(|s| !s.is_empty()),
            ) {
                Some(SpacesConfig {
                    bucket_name: bucket.clone(),
                    region: region.clone(),
                    access_key_id: key_id.clone(),
                    secret_access_key: secret.clone(),
                    endpoint_url: endpoint.clone(),
                    folder_prefix: s3_raw.folder_prefix.clone().filter(|s| !s.is_empty()),
                    daily_retention: days(
                        s3_raw.daily_retention_days.unwrap_or(DEFAULT_REMOTE_DAILY_DAYS),
                    ),
                    weekly_retention: days(
                        s3_raw
                            .weekly_retention_days
                            .unwrap_or(DEFAULT_REMOTE_WEEKLY_DAYS),
                    ),
                })
            } else {
                if s3_raw.bucket_name.is_some()
                    || s3_raw.region.is_some()
                    || s3_raw.access_key_id.is_some()
                    || s3_raw.secret_access_key.is_some()
                    || s3_raw.endpoint_url.is_some()
                {
                    tracing::warn!(
                        "s3_storage is present in config.json but some required fields \
                         (bucket_name, region, access_key_id, secret_access_key, endpoint_url) \
                         are missing or empty; remote publishing will be disabled"
                    );
                }
                None
            }
        });

        Ok(AppConfig {
            backup_root,
            sentinel_path,
            log_file: raw.log_file,
            compose_file: raw.compose_file,
            db_user: raw.db_user.unwrap_or_else(|| "postgres".to_string()),
            weekly_day,
            settle: Duration::from_secs(raw.settle_secs.unwrap_or(DEFAULT_SETTLE_SECS)),
            min_free_bytes: raw.min_free_bytes.unwrap_or(DEFAULT_MIN_FREE_BYTES),
            local_keep_last: raw.local_keep_last.unwrap_or(DEFAULT_LOCAL_KEEP_LAST),
            command_timeout: Duration::from_secs(
                raw.command_timeout_secs.unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS),
            ),
            health_attempts: raw.health_attempts.unwrap_or(DEFAULT_HEALTH_ATTEMPTS),
            health_interval: Duration::from_secs(
                raw.health_interval_secs.unwrap_or(DEFAULT_HEALTH_INTERVAL_SECS),
            ),
            services,
            paths,
            spaces_config,
        })
    }
}

fn days(n: i64) -> Duration {
    Duration::from_secs((n.max(0) as u64) * 24 * 60 * 60)
}
