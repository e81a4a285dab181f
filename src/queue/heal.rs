#![forbid(unsafe_code)]

//! Self-healing of stale on-disk state left behind by a crashed worker
//! or an interrupted git process.

use std::path::PathBuf;

use anyhow::Context as _;
use tracing::info;

use crate::core::git::Git;
use crate::queue::paths::{self, QueueDirs};

/// Move `processing/*.jsonl` files older than `stale_minutes` back to
/// the inbox. Run once at startup: a file still in `processing/` from a
/// previous run belongs to a worker that died mid-ingest.
pub fn recover_stale_processing(
    dirs: &QueueDirs,
    stale_minutes: u64,
) -> anyhow::Result<Vec<PathBuf>> {
    let mut recovered = Vec::new();
    if !dirs.processing.exists() {
        return Ok(recovered);
    }

    let cutoff =
        std::time::SystemTime::now() - std::time::Duration::from_secs(stale_minutes * 60);

    for entry in std::fs::read_dir(&dirs.processing)
        .with_context(|| format!("failed to read {}", dirs.processing.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("jsonl") {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        let Ok(mtime) = meta.modified() else { continue };
        if mtime >= cutoff {
            continue;
        }
        let dest = paths::move_into(&path, &dirs.inbox)?;
        info!("recovered stale processing file {}", dest.display());
        recovered.push(dest);
    }
    Ok(recovered)
}

/// Delete a stale `.git/index.lock`. Only safe when no git task is
/// currently running in this worker, which serializes git through its
/// tool lock.
pub fn repair_stale_index_lock(
    git: &Git,
    stale_minutes: u64,
    git_task_running: bool,
) -> anyhow::Result<bool> {
    if git_task_running {
        return Ok(false);
    }
    let lock = git.index_lock_path();
    let Ok(meta) = std::fs::metadata(&lock) else {
        return Ok(false);
    };
    let Ok(mtime) = meta.modified() else {
        return Ok(false);
    };

    let cutoff =
        std::time::SystemTime::now() - std::time::Duration::from_secs(stale_minutes * 60);
    if mtime >= cutoff {
        return Ok(false);
    }

    std::fs::remove_file(&lock)
        .with_context(|| format!("failed to remove {}", lock.display()))?;
    info!("removed stale {}", lock.display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn age(path: &std::path::Path, minutes: u64) {
        let old = std::time::SystemTime::now() - std::time::Duration::from_secs(minutes * 60);
        let f = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        f.set_modified(old).unwrap();
    }

    #[test]
    fn stale_processing_files_return_to_inbox() {
        let td = tempfile::tempdir().expect("tempdir");
        let dirs = QueueDirs::new(td.path());
        dirs.ensure().unwrap();

        let stale = dirs.processing.join("stale.jsonl");
        let fresh = dirs.processing.join("fresh.jsonl");
        std::fs::write(&stale, "{}\n").unwrap();
        std::fs::write(&fresh, "{}\n").unwrap();
        age(&stale, 30);

        let recovered = recover_stale_processing(&dirs, 10).unwrap();
        assert_eq!(recovered.len(), 1);
        assert!(dirs.inbox.join("stale.jsonl").exists());
        assert!(!stale.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn stale_index_lock_is_removed_unless_git_is_running() {
        let td = tempfile::tempdir().expect("tempdir");
        let repo = td.path();
        std::fs::create_dir_all(repo.join(".git")).unwrap();
        let git = Git::new(repo.to_path_buf());

        let lock = git.index_lock_path();
        std::fs::write(&lock, "").unwrap();
        age(&lock, 45);

        assert!(!repair_stale_index_lock(&git, 30, true).unwrap());
        assert!(lock.exists());

        assert!(repair_stale_index_lock(&git, 30, false).unwrap());
        assert!(!lock.exists());

        // Nothing to do when the lock is fresh or absent.
        assert!(!repair_stale_index_lock(&git, 30, false).unwrap());
        std::fs::write(&lock, "").unwrap();
        assert!(!repair_stale_index_lock(&git, 30, false).unwrap());
        assert!(lock.exists());
    }
}
