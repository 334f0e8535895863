// backuptool/src/publish/mod.rs
//
// One-way mirror of the local retention root to an S3-compatible store
// (DigitalOcean Spaces in production), then an age-based prune of the remote
// namespace. Local is the source of truth; nothing ever flows back.
use aws_sdk_s3 as s3;
use chrono::{NaiveDateTime, Weekday};
use s3::config::Region;
use s3::primitives::ByteStream;
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use walkdir::WalkDir;

use crate::config::SpacesConfig;
use crate::errors::{BackupError, Result};
use crate::retention::{expired_tokens, parse_token, weekday_classifier, RetentionRule};

#[derive(Debug, Default)]
pub struct PublishStats {
    pub uploaded_files: usize,
    pub pruned_snapshots: usize,
}

pub struct Publisher {
    client: s3::Client,
    bucket: String,
    prefix: Option<String>,
    remote_rule: RetentionRule,
}

impl Publisher {
    pub async fn connect(spaces_config: &SpacesConfig) -> Result<Self> {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&spaces_config.endpoint_url)
            .region(Region::new(spaces_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &spaces_config.access_key_id,
                &spaces_config.secret_access_key,
                None,
                None,
                "Static",
            ))
            .load()
            .await;

        Ok(Publisher {
            client: s3::Client::new(&sdk_config),
            bucket: spaces_config.bucket_name.clone(),
            prefix: spaces_config.folder_prefix.clone(),
            remote_rule: RetentionRule::MaxAge {
                daily: spaces_config.daily_retention,
                weekly: spaces_config.weekly_retention,
            },
        })
    }

    /// Mirrors every snapshot under `local_root`, then prunes the remote
    /// namespace under its own (looser) age rule. Returns what was done so
    /// the orchestrator can log it.
    pub async fn publish(
        &self,
        local_root: &Path,
        weekly_day: Weekday,
        now: NaiveDateTime,
    ) -> Result<PublishStats> {
        let remote_keys = self.list_remote_keys().await?;
        let mut stats = PublishStats::default();

        for entry in std::fs::read_dir(local_root)? {
            let entry = entry?;
            let path = entry.path();
            let Some(token) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if !path.is_dir() || parse_token(&token).is_none() {
                continue;
            }
            stats.uploaded_files += self
                .mirror_snapshot(&path, &token, &remote_keys)
                .await?;
        }

        stats.pruned_snapshots = self.prune_remote(&remote_keys, weekly_day, now).await?;
        Ok(stats)
    }

    async fn mirror_snapshot(
        &self,
        snapshot_dir: &Path,
        token: &str,
        remote_keys: &HashSet<String>,
    ) -> Result<usize> {
        let mut uploaded = 0;
        for entry in WalkDir::new(snapshot_dir).follow_links(false) {
            let entry =
                entry.map_err(|e| BackupError::Publish(format!("walk {}: {}", token, e)))?;
            if !entry.path().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(snapshot_dir)
                .map_err(|e| BackupError::Publish(e.to_string()))?;
            let key = object_key(self.prefix.as_deref(), token, rel);
            if remote_keys.contains(&key) {
                continue;
            }

            tracing::debug!("uploading {} to s3://{}/{}", entry.path().display(), self.bucket, key);
            let body = ByteStream::from_path(entry.path()).await.map_err(|e| {
                BackupError::Publish(format!("read {}: {}", entry.path().display(), e))
            })?;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .body(body)
                .send()
                .await
                .map_err(|e| BackupError::Publish(format!("put {}: {}", key, e)))?;
            uploaded += 1;
        }
        if uploaded > 0 {
            tracing::info!("mirrored snapshot {} ({} new files)", token, uploaded);
        }
        Ok(uploaded)
    }

    async fn list_remote_keys(&self) -> Result<HashSet<String>> {
        let mut keys = HashSet::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut req = self.client.list_objects_v2().bucket(&self.bucket);
            if let Some(prefix) = &self.prefix {
                req = req.prefix(format!("{}/", prefix.trim_end_matches('/')));
            }
            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }
            let page = req
                .send()
                .await
                .map_err(|e| BackupError::Publish(format!("list remote namespace: {}", e)))?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    keys.insert(key.to_string());
                }
            }
            match page.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(keys)
    }

    /// Applies the remote age rule to the snapshot tokens seen in the remote
    /// key space and deletes every object under expired tokens. A failed
    /// object deletion is logged and skipped.
    async fn prune_remote(
        &self,
        remote_keys: &HashSet<String>,
        weekly_day: Weekday,
        now: NaiveDateTime,
    ) -> Result<usize> {
        let tokens: BTreeSet<String> = remote_keys
            .iter()
            .filter_map(|k| token_of_key(self.prefix.as_deref(), k))
            .collect();
        let tokens: Vec<String> = tokens.into_iter().collect();
        let expired = expired_tokens(
            &tokens,
            &self.remote_rule,
            weekday_classifier(weekly_day),
            now,
        );

        let mut pruned = 0;
        for token in expired {
            let token_prefix = object_key(self.prefix.as_deref(), &token, Path::new(""));
            let mut all_deleted = true;
            for key in remote_keys.iter().filter(|k| k.starts_with(&token_prefix)) {
                if let Err(e) = self
                    .client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                {
                    tracing::warn!("failed to delete remote object {}: {}", key, e);
                    all_deleted = false;
                }
            }
            if all_deleted {
                tracing::info!("pruned remote snapshot {}", token);
                pruned += 1;
            }
        }
        Ok(pruned)
    }
}

fn object_key(prefix: Option<&str>, token: &str, rel: &Path) -> String {
    let mut key = String::new();
    if let Some(prefix) = prefix {
        key.push_str(prefix.trim_end_matches('/'));
        key.push('/');
    }
    key.push_str(token);
    key.push('/');
    key.push_str(&rel.to_string_lossy());
    key
}

fn token_of_key(prefix: Option<&str>, key: &str) -> Option<String> {
    let rest = match prefix {
        Some(prefix) => key.strip_prefix(&format!("{}/", prefix.trim_end_matches('/')))?,
        None => key,
    };
    let token = rest.split('/').next()?;
    parse_token(token).map(|_| token.to_string())
}
