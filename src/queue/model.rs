#![forbid(unsafe_code)]

//! Canonical task record and the validator that produces it.
//!
//! Producers write loosely-shaped JSON lines; `decode_line` turns one
//! line into a [`Task`] with every default filled in from policy, or
//! fails with a reason. Defaulting happens only here, never downstream.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::config::RetryPolicy;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Dispatch ordering weight: high before normal before low.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::High => 2,
            Self::Normal => 1,
            Self::Low => 0,
        }
    }
}

/// One decoded line from a task file, before defaulting.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    pub id: Option<String>,
    pub tool: Option<String>,
    pub repo: Option<String>,
    pub priority: Option<Priority>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    pub prompt: Option<String>,
    pub max_retries: Option<u32>,
    pub backoff_sec: Option<u64>,
    pub backoff_max: Option<u64>,
    pub jitter_sec: Option<u64>,
    pub attempt: Option<u32>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub run_at: Option<String>,
    pub recurring_minutes: Option<u64>,
    pub timeout_sec: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub tool: String,
    pub repo: PathBuf,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub max_retries: u32,
    pub backoff_sec: u64,
    pub backoff_max: u64,
    pub jitter_sec: u64,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub run_at: Option<OffsetDateTime>,
    pub recurring_minutes: u64,
    pub timeout_sec: u64,
}

/// Final disposition of a task, kept in-memory keyed by id so
/// dependents can be gated on it.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub success: bool,
    pub exit: i32,
    pub reason: Option<String>,
}

#[must_use]
pub fn new_task_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id.chars().take(10).collect()
}

pub fn decode_line(line: &str, retry: &RetryPolicy, default_repo: &Path) -> anyhow::Result<Task> {
    let spec: TaskSpec = serde_json::from_str(line).context("bad json")?;
    canonicalize(spec, retry, default_repo)
}

pub fn canonicalize(
    spec: TaskSpec,
    retry: &RetryPolicy,
    default_repo: &Path,
) -> anyhow::Result<Task> {
    let tool = spec.tool.as_deref().map(str::trim).unwrap_or_default();
    if tool.is_empty() {
        anyhow::bail!("task is missing required field 'tool'");
    }
    let tool = tool.to_lowercase();

    let id = match spec.id.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => v.to_owned(),
        _ => new_task_id(),
    };

    let repo = match spec.repo.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => {
            let p = PathBuf::from(v);
            if p.is_absolute() {
                p
            } else {
                default_repo.join(p)
            }
        }
        _ => default_repo.to_path_buf(),
    };

    let run_at = match spec.run_at.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Some(
            OffsetDateTime::parse(v, &Rfc3339)
                .map_err(|e| anyhow::anyhow!("invalid run_at '{v}': {e}"))?,
        ),
        _ => None,
    };

    let depends_on: Vec<String> = spec
        .depends_on
        .iter()
        .map(|d| d.trim().to_owned())
        .filter(|d| !d.is_empty())
        .collect();

    Ok(Task {
        id,
        tool,
        repo,
        priority: spec.priority.unwrap_or_default(),
        args: spec.args,
        flags: spec.flags,
        files: spec.files,
        prompt: spec.prompt.filter(|p| !p.trim().is_empty()),
        max_retries: spec.max_retries.unwrap_or(retry.default_max_retries),
        backoff_sec: spec.backoff_sec.unwrap_or(retry.backoff_start_seconds),
        backoff_max: spec.backoff_max.unwrap_or(retry.backoff_max_seconds),
        jitter_sec: spec.jitter_sec.unwrap_or(retry.jitter_seconds),
        attempt: spec.attempt.unwrap_or(0),
        depends_on,
        run_at,
        recurring_minutes: spec.recurring_minutes.unwrap_or(0),
        timeout_sec: spec.timeout_sec.unwrap_or(0),
    })
}

impl Task {
    /// A task depending on itself can never become ready.
    #[must_use]
    pub fn has_self_dependency(&self) -> bool {
        self.depends_on.iter().any(|d| d == &self.id)
    }

    /// Clone for re-enqueueing a recurring task after success: fresh id,
    /// attempt counter reset, dependencies not inherited.
    #[must_use]
    pub fn recurrence(&self, now: OffsetDateTime) -> Task {
        const MAX_MINUTES: u64 = i64::MAX as u64 / 60;
        let minutes = self.recurring_minutes.min(MAX_MINUTES) as i64;

        let mut next = self.clone();
        next.id = new_task_id();
        next.attempt = 0;
        next.depends_on.clear();
        next.run_at = Some(now + time::Duration::minutes(minutes));
        next
    }
}
