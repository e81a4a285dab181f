#![forbid(unsafe_code)]

//! Durable observability: the append-only attempt ledger, the heartbeat
//! file, and the running-tasks snapshot.
//!
//! The ledger is shared across processes (external dashboards tail it),
//! so every append holds an exclusive advisory lock on a sidecar lock
//! file. The sidecar never rotates, which keeps rotation from racing an
//! appender that opened the ledger a moment earlier. Readers tolerate a
//! truncated final line.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use fs2::FileExt as _;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::queue::model::Priority;

/// One line per attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub id: String,
    pub tool: String,
    pub attempt: u32,
    pub exit: i32,
    pub ok: bool,
    pub repo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
    lock_path: PathBuf,
    archive_dir: PathBuf,
    max_bytes: u64,
}

impl Ledger {
    #[must_use]
    pub fn new(logs_dir: &Path, max_mb: u64) -> Self {
        Self {
            path: logs_dir.join("ledger.jsonl"),
            lock_path: logs_dir.join("ledger.jsonl.lock"),
            archive_dir: logs_dir.join("archive"),
            max_bytes: max_mb.saturating_mul(1024 * 1024),
        }
    }

    /// Override the rotation threshold in bytes rather than megabytes.
    #[must_use]
    pub fn with_max_bytes(mut self, bytes: u64) -> Self {
        self.max_bytes = bytes;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &LedgerRecord) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_path)
            .with_context(|| format!("failed to open {}", self.lock_path.display()))?;
        lock.lock_exclusive()
            .with_context(|| format!("failed to lock {}", self.lock_path.display()))?;

        let result = self.append_locked(record);
        let _ = lock.unlock();
        result
    }

    fn append_locked(&self, record: &LedgerRecord) -> anyhow::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;

        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        file.flush()?;

        let len = file.metadata()?.len();
        drop(file);
        if self.max_bytes > 0 && len > self.max_bytes {
            self.rotate()?;
        }
        Ok(())
    }

    fn rotate(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.archive_dir)
            .with_context(|| format!("failed to create {}", self.archive_dir.display()))?;
        let stamp = OffsetDateTime::now_utc().unix_timestamp_nanos();
        let dest = self.archive_dir.join(format!("ledger.jsonl.{stamp}"));
        std::fs::rename(&self.path, &dest).with_context(|| {
            format!(
                "failed to rotate {} -> {}",
                self.path.display(),
                dest.display()
            )
        })?;
        Ok(())
    }

    /// All parseable records; a truncated tail line is skipped.
    pub fn read_all(&self) -> anyhow::Result<Vec<LedgerRecord>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read {}", self.path.display()));
            }
        };
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub pid: u32,
    pub running: usize,
    pub max: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningTask {
    pub id: String,
    pub tool: String,
    pub repo: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started: OffsetDateTime,
    pub file: String,
    pub priority: Priority,
    pub attempt: u32,
}

/// The `.state/` directory read by external dashboards and the
/// supervisor. All writes go through temp-file-plus-rename.
#[derive(Debug, Clone)]
pub struct StateFiles {
    dir: PathBuf,
}

impl StateFiles {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn ensure_dir(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))
    }

    #[must_use]
    pub fn heartbeat_path(&self) -> PathBuf {
        self.dir.join("heartbeat.json")
    }

    #[must_use]
    pub fn breakers_path(&self) -> PathBuf {
        self.dir.join("circuit_breakers.json")
    }

    #[must_use]
    pub fn running_path(&self) -> PathBuf {
        self.dir.join("running_tasks.json")
    }

    pub fn write_heartbeat(&self, running: usize, max: usize) -> anyhow::Result<()> {
        self.ensure_dir()?;
        let beat = Heartbeat {
            timestamp: OffsetDateTime::now_utc(),
            pid: std::process::id(),
            running,
            max,
        };
        write_json_atomic(&self.heartbeat_path(), &beat)
    }

    pub fn write_running(&self, running: &[RunningTask]) -> anyhow::Result<()> {
        self.ensure_dir()?;
        write_json_atomic(&self.running_path(), &running)
    }
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp, &data).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Age of the heartbeat file's recorded timestamp, if readable.
#[must_use]
pub fn heartbeat_age(path: &Path, now: OffsetDateTime) -> Option<time::Duration> {
    let data = std::fs::read(path).ok()?;
    let beat: Heartbeat = serde_json::from_slice(&data).ok()?;
    Some(now - beat.timestamp)
}

/// Delete archive files and per-task logs older than `keep_days`.
pub fn prune_old_logs(logs_dir: &Path, keep_days: u64) -> anyhow::Result<usize> {
    if keep_days == 0 {
        return Ok(0);
    }
    const MAX_DAYS: u64 = i64::MAX as u64 / 86_400;
    let cutoff = OffsetDateTime::now_utc()
        - time::Duration::days(keep_days.min(MAX_DAYS) as i64);
    let cutoff: std::time::SystemTime = cutoff.into();

    let mut removed = 0;
    let mut sweep = |dir: &Path, matches: &dyn Fn(&str) -> bool| {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !matches(&name) {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(mtime) = meta.modified() else { continue };
            if mtime < cutoff && std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
    };

    sweep(&logs_dir.join("archive"), &|_| true);
    sweep(logs_dir, &|name| {
        name.starts_with("task_") && name.ends_with(".log")
    });
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, attempt: u32, exit: i32) -> LedgerRecord {
        LedgerRecord {
            ts: OffsetDateTime::now_utc(),
            id: id.to_owned(),
            tool: "git".to_owned(),
            attempt,
            exit,
            ok: exit == 0,
            repo: "/srv/repo".to_owned(),
            duration_ms: Some(12),
            note: None,
        }
    }

    #[test]
    fn append_and_read_roundtrip() {
        let td = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::new(td.path(), 25);

        ledger.append(&record("a", 1, 0)).unwrap();
        ledger.append(&record("a", 2, 1)).unwrap();

        let records = ledger.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].attempt, 1);
        assert!(records[0].ok);
        assert!(!records[1].ok);
    }

    #[test]
    fn read_all_skips_truncated_tail() {
        let td = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::new(td.path(), 25);
        ledger.append(&record("a", 1, 0)).unwrap();
        let mut raw = std::fs::read_to_string(ledger.path()).unwrap();
        raw.push_str("{\"ts\":\"2025-");
        std::fs::write(ledger.path(), raw).unwrap();

        assert_eq!(ledger.read_all().unwrap().len(), 1);
    }

    #[test]
    fn oversized_ledger_rotates_into_archive() {
        let td = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::new(td.path(), 25).with_max_bytes(8);

        ledger.append(&record("a", 1, 0)).unwrap();
        assert!(!ledger.path().exists());
        let archived: Vec<_> = std::fs::read_dir(td.path().join("archive"))
            .unwrap()
            .collect();
        assert_eq!(archived.len(), 1);

        // A fresh file starts on the next append.
        ledger.append(&record("b", 1, 0)).unwrap();
        assert_eq!(ledger.read_all().unwrap().len(), 1);
    }

    #[test]
    fn heartbeat_writes_and_ages() {
        let td = tempfile::tempdir().expect("tempdir");
        let state = StateFiles::new(td.path().join(".state"));
        state.write_heartbeat(2, 4).unwrap();

        let now = OffsetDateTime::now_utc();
        let age = heartbeat_age(&state.heartbeat_path(), now).unwrap();
        assert!(age < time::Duration::seconds(5));
        assert!(heartbeat_age(&state.heartbeat_path().with_extension("missing"), now).is_none());
    }

    #[test]
    fn prune_old_logs_removes_only_aged_files() {
        let td = tempfile::tempdir().expect("tempdir");
        let logs = td.path();
        std::fs::create_dir_all(logs.join("archive")).unwrap();
        std::fs::write(logs.join("archive").join("ledger.jsonl.1"), "old").unwrap();
        std::fs::write(logs.join("task_old.log"), "old").unwrap();
        std::fs::write(logs.join("task_new.log"), "new").unwrap();
        std::fs::write(logs.join("queueworker.log"), "keep").unwrap();

        let old = std::time::SystemTime::now() - std::time::Duration::from_secs(3 * 86_400);
        for name in ["archive/ledger.jsonl.1", "task_old.log"] {
            let f = std::fs::OpenOptions::new()
                .write(true)
                .open(logs.join(name))
                .unwrap();
            f.set_modified(old).unwrap();
        }

        let removed = prune_old_logs(logs, 1).unwrap();
        assert_eq!(removed, 2);
        assert!(logs.join("task_new.log").exists());
        assert!(logs.join("queueworker.log").exists());
    }
}
