#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use crate::error::QworkerError;

#[derive(Debug, Clone)]
pub struct Git {
    repo_root: PathBuf,
}

impl Git {
    #[must_use]
    pub fn new(repo_root: PathBuf) -> Self {
        Self { repo_root }
    }

    /// Path of the index lock git leaves behind when a process dies
    /// mid-operation.
    #[must_use]
    pub fn index_lock_path(&self) -> PathBuf {
        self.repo_root.join(".git").join("index.lock")
    }

    pub fn gc_auto(&self) -> Result<(), QworkerError> {
        let _ = self.run(&["gc", "--auto"])?;
        Ok(())
    }

    pub fn run(&self, args: &[&str]) -> Result<String, QworkerError> {
        let out = self.run_raw(args)?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&out.stderr);
            Err(QworkerError::Other(format!(
                "git {}: {}",
                args.join(" "),
                stderr.trim()
            )))
        }
    }

    pub fn run_raw(&self, args: &[&str]) -> Result<Output, QworkerError> {
        let out = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => QworkerError::GitNotFound,
                _ => QworkerError::Other(format!("failed to run git: {e}")),
            })?;
        Ok(out)
    }
}

pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let mut cur = Some(start);
    while let Some(dir) = cur {
        let candidate = dir.join(".git");
        if candidate.is_dir() || candidate.is_file() {
            return Some(dir.to_path_buf());
        }
        cur = dir.parent();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_repo_root_walks_up_from_nested_dir() {
        let td = tempfile::tempdir().expect("tempdir");
        let repo = td.path().join("repo");
        let nested = repo.join("a").join("b");
        std::fs::create_dir_all(repo.join(".git")).unwrap();
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_repo_root(&nested), Some(repo.clone()));
        assert_eq!(find_repo_root(td.path()), None);
    }

    #[test]
    fn index_lock_path_is_under_dot_git() {
        let git = Git::new(PathBuf::from("/srv/repo"));
        assert_eq!(
            git.index_lock_path(),
            PathBuf::from("/srv/repo/.git/index.lock")
        );
    }
}
