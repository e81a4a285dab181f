#![forbid(unsafe_code)]

//! The file-level task lifecycle: inbox/, processing/, done/, failed/,
//! quarantine/. Every ingested file ends up in exactly one terminal
//! folder.

use std::path::{Path, PathBuf};

use anyhow::Context as _;

#[derive(Debug, Clone)]
pub struct QueueDirs {
    pub inbox: PathBuf,
    pub processing: PathBuf,
    pub done: PathBuf,
    pub failed: PathBuf,
    pub quarantine: PathBuf,
}

impl QueueDirs {
    #[must_use]
    pub fn new(tasks_dir: &Path) -> Self {
        Self {
            inbox: tasks_dir.join("inbox"),
            processing: tasks_dir.join("processing"),
            done: tasks_dir.join("done"),
            failed: tasks_dir.join("failed"),
            quarantine: tasks_dir.join("quarantine"),
        }
    }

    pub fn ensure(&self) -> anyhow::Result<()> {
        for dir in [
            &self.inbox,
            &self.processing,
            &self.done,
            &self.failed,
            &self.quarantine,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Oldest `*.jsonl` file in the inbox, by mtime then name.
    pub fn oldest_inbox_file(&self) -> anyhow::Result<Option<PathBuf>> {
        if !self.inbox.exists() {
            return Ok(None);
        }
        let mut candidates: Vec<(std::time::SystemTime, String, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&self.inbox)
            .with_context(|| format!("failed to read {}", self.inbox.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("jsonl") {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let mtime = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            let name = entry.file_name().to_string_lossy().into_owned();
            candidates.push((mtime, name, path));
        }
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(candidates.into_iter().next().map(|(_, _, p)| p))
    }
}

/// Move `file` into `dest_dir`, keeping its name unless that name is
/// already taken, in which case a timestamp suffix is inserted.
pub fn move_into(file: &Path, dest_dir: &Path) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dest_dir)
        .with_context(|| format!("failed to create {}", dest_dir.display()))?;

    let name = file
        .file_name()
        .and_then(|s| s.to_str())
        .map(str::to_owned)
        .with_context(|| format!("file has no name: {}", file.display()))?;

    let mut dest = dest_dir.join(&name);
    if dest.exists() {
        let stem = file
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("tasks");
        let stamp = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
        dest = dest_dir.join(format!("{stem}_{stamp}.jsonl"));
    }

    std::fs::rename(file, &dest)
        .with_context(|| format!("failed to move {} -> {}", file.display(), dest.display()))?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_inbox_file_orders_by_mtime_then_name() {
        let td = tempfile::tempdir().expect("tempdir");
        let dirs = QueueDirs::new(td.path());
        dirs.ensure().unwrap();

        std::fs::write(dirs.inbox.join("b.jsonl"), "{}\n").unwrap();
        std::fs::write(dirs.inbox.join("a.jsonl"), "{}\n").unwrap();
        std::fs::write(dirs.inbox.join("skip.txt"), "ignored").unwrap();

        // Force identical mtimes so the name breaks the tie.
        let now = std::time::SystemTime::now();
        for name in ["a.jsonl", "b.jsonl"] {
            let f = std::fs::OpenOptions::new()
                .write(true)
                .open(dirs.inbox.join(name))
                .unwrap();
            f.set_modified(now).unwrap();
        }

        let oldest = dirs.oldest_inbox_file().unwrap().unwrap();
        assert_eq!(oldest.file_name().unwrap(), "a.jsonl");
    }

    #[test]
    fn oldest_inbox_file_is_none_when_empty() {
        let td = tempfile::tempdir().expect("tempdir");
        let dirs = QueueDirs::new(td.path());
        dirs.ensure().unwrap();
        assert!(dirs.oldest_inbox_file().unwrap().is_none());
    }

    #[test]
    fn move_into_keeps_name_and_dodges_collisions() {
        let td = tempfile::tempdir().expect("tempdir");
        let src_dir = td.path().join("src");
        let dest_dir = td.path().join("dest");
        std::fs::create_dir_all(&src_dir).unwrap();

        let f1 = src_dir.join("t.jsonl");
        std::fs::write(&f1, "one\n").unwrap();
        let moved = move_into(&f1, &dest_dir).unwrap();
        assert_eq!(moved.file_name().unwrap(), "t.jsonl");

        let f2 = src_dir.join("t.jsonl");
        std::fs::write(&f2, "two\n").unwrap();
        let moved2 = move_into(&f2, &dest_dir).unwrap();
        assert_ne!(moved2, moved);
        assert!(moved2.exists());
        assert!(moved.exists());
    }
}
