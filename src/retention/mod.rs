// backuptool/src/retention/mod.rs
//
// Retention arithmetic over timestamp-named snapshots. The directory name is
// the authoritative timestamp; filesystem mtime is never consulted. Anything
// whose name does not parse is never a deletion candidate (fail safe).
use chrono::{Datelike, NaiveDateTime, Weekday};
use std::path::Path;
use std::time::Duration;

use crate::errors::Result;

/// Token format snapshot directories are named with, one-second resolution.
pub const TOKEN_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotClass {
    Daily,
    Weekly,
}

impl std::fmt::Display for SnapshotClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotClass::Daily => write!(f, "daily"),
            SnapshotClass::Weekly => write!(f, "weekly"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RetentionRule {
    /// Keep the newest N of each class by token order, delete the rest, so a
    /// count-based rule cannot starve the rarer weekly snapshots out of the
    /// local store.
    KeepLast(usize),
    /// Delete snapshots whose age meets or exceeds their class's threshold.
    MaxAge { daily: Duration, weekly: Duration },
}

pub fn parse_token(token: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(token, TOKEN_FORMAT).ok()
}

/// Default classifier: snapshots taken on the designated weekday are weekly,
/// everything else daily. The class is derived from the token, so it is the
/// same wherever the snapshot lives.
pub fn weekday_classifier(weekly_day: Weekday) -> impl Fn(NaiveDateTime) -> SnapshotClass {
    move |ts| {
        if ts.weekday() == weekly_day {
            SnapshotClass::Weekly
        } else {
            SnapshotClass::Daily
        }
    }
}

/// Pure rule evaluation: which of `tokens` fall outside the rule right now.
/// Unparseable tokens are silently kept. Shared by the local pruner and the
/// remote publisher.
pub fn expired_tokens<C>(
    tokens: &[String],
    rule: &RetentionRule,
    classify: C,
    now: NaiveDateTime,
) -> Vec<String>
where
    C: Fn(NaiveDateTime) -> SnapshotClass,
{
    let mut dated: Vec<(String, NaiveDateTime)> = tokens
        .iter()
        .filter_map(|t| parse_token(t).map(|ts| (t.clone(), ts)))
        .collect();

    match rule {
        RetentionRule::KeepLast(n) => {
            // Token text sorts the same as the encoded timestamp.
            dated.sort_by(|a, b| b.0.cmp(&a.0));
            let mut kept_daily = 0usize;
            let mut kept_weekly = 0usize;
            dated
                .into_iter()
                .filter(|(_, ts)| {
                    let kept = match classify(*ts) {
                        SnapshotClass::Daily => &mut kept_daily,
                        SnapshotClass::Weekly => &mut kept_weekly,
                    };
                    *kept += 1;
                    *kept > *n
                })
                .map(|(t, _)| t)
                .collect()
        }
        RetentionRule::MaxAge { daily, weekly } => dated
            .into_iter()
            .filter(|(_, ts)| {
                let age = now.signed_duration_since(*ts);
                let threshold = match classify(*ts) {
                    SnapshotClass::Daily => *daily,
                    SnapshotClass::Weekly => *weekly,
                };
                match chrono::Duration::from_std(threshold) {
                    Ok(threshold) => age >= threshold,
                    Err(_) => false,
                }
            })
            .map(|(t, _)| t)
            .collect(),
    }
}

/// Deletes every snapshot directory under `root` that falls outside `rule`.
/// Returns how many were actually removed; a failed removal is logged and
/// skipped, never aborting the pass.
pub fn prune<C>(root: &Path, rule: &RetentionRule, classify: C, now: NaiveDateTime) -> Result<usize>
where
    C: Fn(NaiveDateTime) -> SnapshotClass,
{
    let mut tokens = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.path().is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if parse_token(name).is_some() {
                tokens.push(name.to_string());
            }
        }
    }

    let expired = expired_tokens(&tokens, rule, classify, now);
    let mut deleted = 0;
    for token in expired {
        let path = root.join(&token);
        match std::fs::remove_dir_all(&path) {
            Ok(()) => {
                tracing::info!("pruned snapshot {}", token);
                deleted += 1;
            }
            Err(e) => {
                tracing::warn!("failed to prune snapshot {}: {}", path.display(), e);
            }
        }
    }
    Ok(deleted)
}
