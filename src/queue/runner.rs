#![forbid(unsafe_code)]

//! Runs one task's command with the retry loop: spawn, capture output
//! into the per-task log, enforce the timeout, append a ledger record
//! per attempt, back off and try again while policy allows.
//!
//! Nothing here propagates errors to the scheduler; every failure mode
//! collapses into the structured [`RunOutcome`].

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use rand::Rng as _;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _};
use tracing::warn;

use crate::queue::ledger::{Ledger, LedgerRecord};
use crate::queue::resolve::ResolvedCommand;

/// Executable not found on PATH; never retried.
pub const EXIT_NOT_FOUND: i32 = 127;
/// Command resolver rejected the task (e.g. safety violation).
pub const EXIT_REJECTED: i32 = 403;
/// Skipped because a dependency failed.
pub const EXIT_DEP_FAILED: i32 = 409;
/// Killed by the per-task timeout; retried if policy allows.
pub const EXIT_TIMEOUT: i32 = 998;
/// File-level parse failure, recorded under the id `"parse"`.
pub const EXIT_PARSE: i32 = 999;

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub backoff_sec: u64,
    pub backoff_max: u64,
    pub jitter_sec: u64,
    pub retry_on_exit_codes: Vec<i32>,
}

#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub exit: i32,
    pub duration_ms: u64,
    pub timed_out: bool,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub success: bool,
    pub final_exit: i32,
    pub attempts: Vec<AttemptRecord>,
    pub started: OffsetDateTime,
    pub ended: OffsetDateTime,
}

/// Everything the runner needs, detached from scheduler state so the
/// job can live on its own spawned task.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub task_id: String,
    pub tool: String,
    pub command: ResolvedCommand,
    pub cwd: PathBuf,
    pub log_path: PathBuf,
    pub timeout_sec: u64,
    pub retry: RetrySettings,
    pub starting_attempt: u32,
}

struct AttemptExit {
    exit: i32,
    timed_out: bool,
    not_found: bool,
}

pub async fn run_job(spec: JobSpec, ledger: Ledger) -> RunOutcome {
    let started = OffsetDateTime::now_utc();
    let repo = spec.cwd.to_string_lossy().into_owned();

    let mut attempts: Vec<AttemptRecord> = Vec::new();
    let mut attempt = spec.starting_attempt;

    let (success, final_exit) = loop {
        attempt += 1;
        let t0 = Instant::now();
        let outcome = run_attempt(&spec).await;
        let duration_ms = t0.elapsed().as_millis() as u64;

        attempts.push(AttemptRecord {
            attempt,
            exit: outcome.exit,
            duration_ms,
            timed_out: outcome.timed_out,
        });

        let record = LedgerRecord {
            ts: OffsetDateTime::now_utc(),
            id: spec.task_id.clone(),
            tool: spec.tool.clone(),
            attempt,
            exit: outcome.exit,
            ok: outcome.exit == 0,
            repo: repo.clone(),
            duration_ms: Some(duration_ms),
            note: outcome.timed_out.then(|| "timeout".to_owned()),
        };
        if let Err(e) = ledger.append(&record) {
            warn!("ledger append failed for task {}: {e}", spec.task_id);
        }

        if outcome.exit == 0 {
            break (true, 0);
        }
        let retry = !outcome.not_found
            && attempt < spec.retry.max_retries
            && spec.retry.retry_on_exit_codes.contains(&outcome.exit);
        if !retry {
            break (false, outcome.exit);
        }
        tokio::time::sleep(backoff_delay(&spec.retry, attempt)).await;
    };

    RunOutcome {
        success,
        final_exit,
        attempts,
        started,
        ended: OffsetDateTime::now_utc(),
    }
}

/// `min(backoff_max, backoff_start * 2^(attempt-1))` plus uniform
/// jitter in `[0, jitter_sec)`.
fn backoff_delay(retry: &RetrySettings, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    let base = retry
        .backoff_sec
        .saturating_mul(1u64 << exp)
        .min(retry.backoff_max);
    let jitter = if retry.jitter_sec > 0 {
        rand::thread_rng().gen_range(0.0..retry.jitter_sec as f64)
    } else {
        0.0
    };
    Duration::from_secs_f64(base as f64 + jitter)
}

async fn run_attempt(spec: &JobSpec) -> AttemptExit {
    let mut log = match open_log(spec).await {
        Ok(log) => log,
        Err(e) => {
            warn!("cannot open {}: {e}", spec.log_path.display());
            return AttemptExit {
                exit: 1,
                timed_out: false,
                not_found: false,
            };
        }
    };

    let mut cmd = tokio::process::Command::new(&spec.command.program);
    cmd.args(&spec.command.args);
    cmd.current_dir(&spec.cwd);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let _ = log
                .write_all(
                    format!("executable not found on PATH: {}\n", spec.command.program).as_bytes(),
                )
                .await;
            let _ = log.flush().await;
            return AttemptExit {
                exit: EXIT_NOT_FOUND,
                timed_out: false,
                not_found: true,
            };
        }
        Err(e) => {
            let _ = log
                .write_all(format!("failed to start {}: {e}\n", spec.command.program).as_bytes())
                .await;
            let _ = log.flush().await;
            return AttemptExit {
                exit: 1,
                timed_out: false,
                not_found: false,
            };
        }
    };

    let mut drains: Vec<tokio::task::JoinHandle<()>> = Vec::new();
    if let Some(out) = child.stdout.take() {
        match log.try_clone().await {
            Ok(log_out) => drains.push(tokio::spawn(drain_lines(out, log_out))),
            Err(e) => warn!("cannot clone log handle: {e}"),
        }
    }
    if let Some(err) = child.stderr.take() {
        match log.try_clone().await {
            Ok(log_err) => drains.push(tokio::spawn(drain_lines(err, log_err))),
            Err(e) => warn!("cannot clone log handle: {e}"),
        }
    }

    let (exit, timed_out) = if spec.timeout_sec > 0 {
        let window = Duration::from_secs(spec.timeout_sec);
        match tokio::time::timeout(window, child.wait()).await {
            Ok(Ok(status)) => (status.code().unwrap_or(1), false),
            Ok(Err(e)) => {
                warn!("wait failed for task {}: {e}", spec.task_id);
                (1, false)
            }
            Err(_) => {
                let _ = child.kill().await;
                (EXIT_TIMEOUT, true)
            }
        }
    } else {
        match child.wait().await {
            Ok(status) => (status.code().unwrap_or(1), false),
            Err(e) => {
                warn!("wait failed for task {}: {e}", spec.task_id);
                (1, false)
            }
        }
    };

    for drain in drains {
        let _ = drain.await;
    }
    if timed_out {
        let _ = log
            .write_all(format!("killed after {}s timeout\n", spec.timeout_sec).as_bytes())
            .await;
    }
    let _ = log.flush().await;

    AttemptExit {
        exit,
        timed_out,
        not_found: false,
    }
}

async fn open_log(spec: &JobSpec) -> anyhow::Result<tokio::fs::File> {
    if let Some(parent) = spec.log_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut log = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&spec.log_path)
        .await?;
    let stamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_owned());
    log.write_all(format!("=== Attempt {stamp} ===\n").as_bytes())
        .await?;
    Ok(log)
}

async fn drain_lines<R>(reader: R, mut log: tokio::fs::File)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = tokio::io::BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut buf = line.into_bytes();
        buf.push(b'\n');
        let _ = log.write_all(&buf).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_retry() -> RetrySettings {
        RetrySettings {
            max_retries: 0,
            backoff_sec: 0,
            backoff_max: 0,
            jitter_sec: 0,
            retry_on_exit_codes: vec![1, EXIT_TIMEOUT],
        }
    }

    fn spec(dir: &std::path::Path, program: &str, args: &[&str]) -> JobSpec {
        JobSpec {
            task_id: "t1".to_owned(),
            tool: "sh".to_owned(),
            command: ResolvedCommand {
                program: program.to_owned(),
                args: args.iter().map(|s| (*s).to_owned()).collect(),
            },
            cwd: dir.to_path_buf(),
            log_path: dir.join("task_t1.log"),
            timeout_sec: 0,
            retry: no_retry(),
            starting_attempt: 0,
        }
    }

    #[tokio::test]
    async fn captures_output_and_records_success() {
        let td = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::new(td.path(), 25);
        let spec = spec(td.path(), "sh", &["-c", "echo hello; echo oops >&2"]);

        let outcome = run_job(spec.clone(), ledger.clone()).await;
        assert!(outcome.success);
        assert_eq!(outcome.final_exit, 0);
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(outcome.attempts[0].attempt, 1);

        let log = std::fs::read_to_string(&spec.log_path).unwrap();
        assert!(log.contains("=== Attempt "));
        assert!(log.contains("hello"));
        assert!(log.contains("oops"));

        let records = ledger.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].ok);
        assert_eq!(records[0].attempt, 1);
    }

    #[tokio::test]
    async fn missing_executable_is_127_and_never_retried() {
        let td = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::new(td.path(), 25);
        let mut spec = spec(td.path(), "qworker-no-such-binary", &[]);
        spec.retry.max_retries = 5;
        spec.retry.retry_on_exit_codes = vec![EXIT_NOT_FOUND];

        let outcome = run_job(spec.clone(), ledger).await;
        assert!(!outcome.success);
        assert_eq!(outcome.final_exit, EXIT_NOT_FOUND);
        assert_eq!(outcome.attempts.len(), 1);

        let log = std::fs::read_to_string(&spec.log_path).unwrap();
        assert!(log.contains("not found on PATH"));
    }

    #[tokio::test]
    async fn retries_until_the_command_succeeds() {
        let td = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::new(td.path(), 25);
        let mut spec = spec(
            td.path(),
            "sh",
            &[
                "-c",
                "n=$(cat n 2>/dev/null || echo 0); n=$((n+1)); echo $n > n; [ $n -ge 3 ]",
            ],
        );
        spec.retry.max_retries = 3;

        let outcome = run_job(spec, ledger.clone()).await;
        assert!(outcome.success);
        let exits: Vec<i32> = outcome.attempts.iter().map(|a| a.exit).collect();
        assert_eq!(exits, vec![1, 1, 0]);

        let attempts: Vec<u32> = ledger
            .read_all()
            .unwrap()
            .iter()
            .map(|r| r.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn exit_code_outside_retry_set_is_final() {
        let td = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::new(td.path(), 25);
        let mut spec = spec(td.path(), "sh", &["-c", "exit 7"]);
        spec.retry.max_retries = 3;

        let outcome = run_job(spec, ledger).await;
        assert!(!outcome.success);
        assert_eq!(outcome.final_exit, 7);
        assert_eq!(outcome.attempts.len(), 1);
    }

    #[tokio::test]
    async fn timeout_kills_the_child_with_998() {
        let td = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::new(td.path(), 25);
        let mut spec = spec(td.path(), "sh", &["-c", "sleep 30"]);
        spec.timeout_sec = 1;

        let outcome = run_job(spec.clone(), ledger).await;
        assert!(!outcome.success);
        assert_eq!(outcome.final_exit, EXIT_TIMEOUT);
        assert!(outcome.attempts[0].timed_out);

        let log = std::fs::read_to_string(&spec.log_path).unwrap();
        assert!(log.contains("timeout"));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetrySettings {
            max_retries: 10,
            backoff_sec: 5,
            backoff_max: 30,
            jitter_sec: 0,
            retry_on_exit_codes: vec![1],
        };
        assert_eq!(backoff_delay(&retry, 1), Duration::from_secs(5));
        assert_eq!(backoff_delay(&retry, 2), Duration::from_secs(10));
        assert_eq!(backoff_delay(&retry, 3), Duration::from_secs(20));
        assert_eq!(backoff_delay(&retry, 4), Duration::from_secs(30));
        assert_eq!(backoff_delay(&retry, 9), Duration::from_secs(30));
    }

    #[test]
    fn backoff_jitter_stays_in_range() {
        let retry = RetrySettings {
            max_retries: 1,
            backoff_sec: 1,
            backoff_max: 60,
            jitter_sec: 2,
            retry_on_exit_codes: vec![1],
        };
        for _ in 0..50 {
            let d = backoff_delay(&retry, 1);
            assert!(d >= Duration::from_secs(1));
            assert!(d < Duration::from_secs(3));
        }
    }
}
