#![forbid(unsafe_code)]

//! Worker policy: immutable configuration loaded once at startup from a
//! TOML file at the repository root. A missing or malformed policy file
//! is a fatal startup error; tasks may override retry and timeout
//! fields per-task, everything else is global.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::error::QworkerError;

pub const POLICY_FILE: &str = "queueworker.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Policy {
    pub queue: QueuePolicy,
    pub retry: RetryPolicy,
    pub breaker: BreakerPolicy,
    pub git: GitPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueuePolicy {
    pub max_concurrent_tasks: usize,
    pub recovery_processing_stale_minutes: u64,
    pub heartbeat_every_seconds: u64,
    pub log_rotate_max_mb: u64,
    pub log_keep_days: u64,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            recovery_processing_stale_minutes: 30,
            heartbeat_every_seconds: 10,
            log_rotate_max_mb: 25,
            log_keep_days: 14,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub default_max_retries: u32,
    pub backoff_start_seconds: u64,
    pub backoff_max_seconds: u64,
    pub jitter_seconds: u64,
    pub retry_on_exit_codes: Vec<i32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            default_max_retries: 2,
            backoff_start_seconds: 5,
            backoff_max_seconds: 300,
            jitter_seconds: 3,
            retry_on_exit_codes: vec![1, 998],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerPolicy {
    pub window_failures: u32,
    pub open_seconds: u64,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            window_failures: 3,
            open_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GitPolicy {
    pub index_lock_stale_minutes: u64,
    pub auto_gc: bool,
    pub gc_every_minutes: u64,
}

impl Default for GitPolicy {
    fn default() -> Self {
        Self {
            index_lock_stale_minutes: 30,
            auto_gc: false,
            gc_every_minutes: 720,
        }
    }
}

pub fn load(path: &Path) -> anyhow::Result<Policy> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read policy file {}", path.display()))?;
    let policy: Policy = toml::from_str(&raw)
        .with_context(|| format!("failed to parse TOML in {}", path.display()))?;
    policy.validate()?;
    Ok(policy)
}

impl Policy {
    pub fn validate(&self) -> Result<(), QworkerError> {
        if self.queue.max_concurrent_tasks == 0 {
            return Err(QworkerError::Config(
                "queue.max_concurrent_tasks must be >= 1".to_owned(),
            ));
        }
        if self.queue.heartbeat_every_seconds == 0 {
            return Err(QworkerError::Config(
                "queue.heartbeat_every_seconds must be >= 1".to_owned(),
            ));
        }
        if self.breaker.window_failures == 0 {
            return Err(QworkerError::Config(
                "breaker.window_failures must be >= 1".to_owned(),
            ));
        }
        Ok(())
    }
}

fn home_dir() -> Option<PathBuf> {
    if let Some(v) = std::env::var_os("HOME") {
        return Some(PathBuf::from(v));
    }
    if let Some(v) = std::env::var_os("USERPROFILE") {
        return Some(PathBuf::from(v));
    }
    None
}

#[must_use]
pub fn expand_tilde(input: &str) -> String {
    if let Some(rest) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(rest).to_string_lossy().to_string();
        }
    }
    input.to_owned()
}

fn expand_env_vars(input: &str) -> String {
    // Expand $VAR and ${VAR}. Leave unknown vars untouched.
    let re = regex::Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?")
        .unwrap_or_else(|_| regex::Regex::new("$^").unwrap());
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        std::env::var(key).unwrap_or_else(|_| caps[0].to_owned())
    })
    .to_string()
}

pub fn expand_path(input: &str) -> anyhow::Result<PathBuf> {
    let expanded = expand_env_vars(&expand_tilde(input));
    let p = PathBuf::from(expanded);
    if p.is_absolute() {
        return Ok(p);
    }
    let cwd = std::env::current_dir().context("failed to get current directory")?;
    Ok(cwd.join(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_valid() {
        Policy::default().validate().unwrap();
    }

    #[test]
    fn validation_catches_zero_minimums() {
        let mut policy = Policy::default();
        policy.queue.max_concurrent_tasks = 0;
        assert!(policy.validate().is_err());

        let mut policy = Policy::default();
        policy.breaker.window_failures = 0;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn load_parses_partial_toml_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(POLICY_FILE);
        std::fs::write(
            &path,
            "[queue]\nmax_concurrent_tasks = 5\n\n[retry]\nretry_on_exit_codes = [1, 75, 998]\n",
        )
        .unwrap();

        let policy = load(&path).unwrap();
        assert_eq!(policy.queue.max_concurrent_tasks, 5);
        assert_eq!(policy.retry.retry_on_exit_codes, vec![1, 75, 998]);
        // Untouched sections keep their defaults.
        assert_eq!(policy.breaker.window_failures, 3);
        assert_eq!(policy.queue.log_keep_days, 14);
    }

    #[test]
    fn load_fails_on_missing_or_malformed_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(load(&dir.path().join("absent.toml")).is_err());

        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[queue\nmax = ").unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn expand_path_absolutizes_relative_input() {
        let p = expand_path("some/rel/dir").unwrap();
        assert!(p.is_absolute());
    }
}
