#![forbid(unsafe_code)]

//! The worker's main loop.
//!
//! A single cooperative loop owns all queue state: pending entries, the
//! running-jobs map, per-file contexts, task results, and tool locks.
//! Dispatched tasks run on spawned tokio tasks; the loop polls their
//! handles without blocking and reaps them on the next tick. Task-level
//! failures never propagate out of the loop; each task's final
//! disposition is a ledger record plus a file move.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Policy;
use crate::core::git::Git;
use crate::queue::breaker::BreakerBoard;
use crate::queue::heal;
use crate::queue::ledger::{self, Ledger, LedgerRecord, RunningTask, StateFiles};
use crate::queue::model::{self, Task, TaskResult};
use crate::queue::paths::{self, QueueDirs};
use crate::queue::resolve::Resolvers;
use crate::queue::runner::{self, JobSpec, RetrySettings, RunOutcome};

/// Dropping this file into the repo root requests a graceful shutdown:
/// running tasks finish, nothing new starts.
pub const STOP_SENTINEL: &str = "STOP.HEADLESS";

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub repo: PathBuf,
    pub tasks_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub poll: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Pending,
    Running,
    Complete,
}

#[derive(Debug)]
struct PendingEntry {
    task: Task,
    source: PathBuf,
    state: EntryState,
    added: OffsetDateTime,
}

/// Bookkeeping for one ingested file; when every task has resolved the
/// file moves to its terminal folder.
#[derive(Debug)]
struct FileContext {
    total: usize,
    completed: usize,
    failures: usize,
}

struct RunningJob {
    tool: String,
    repo: String,
    source: PathBuf,
    started: OffsetDateTime,
    priority: model::Priority,
    attempt: u32,
    handle: JoinHandle<RunOutcome>,
}

pub struct Scheduler {
    opts: WorkerOptions,
    policy: Policy,
    dirs: QueueDirs,
    state: StateFiles,
    ledger: Ledger,
    resolvers: Resolvers,
    breakers: BreakerBoard,
    git: Git,
    pending: Vec<PendingEntry>,
    contexts: HashMap<PathBuf, FileContext>,
    running: HashMap<String, RunningJob>,
    results: HashMap<String, TaskResult>,
    tool_locks: HashMap<String, String>,
    last_heartbeat: Option<Instant>,
    last_gc: Option<Instant>,
    stop: bool,
}

impl Scheduler {
    pub fn new(opts: WorkerOptions, policy: Policy) -> anyhow::Result<Self> {
        let dirs = QueueDirs::new(&opts.tasks_dir);
        dirs.ensure()?;
        let state = StateFiles::new(opts.repo.join(".state"));
        state.ensure_dir()?;
        std::fs::create_dir_all(&opts.logs_dir)?;

        let ledger = Ledger::new(&opts.logs_dir, policy.queue.log_rotate_max_mb);
        let resolvers = Resolvers::load_plugins(&opts.repo.join("plugins"));
        let breakers = BreakerBoard::load(state.breakers_path());
        let git = Git::new(opts.repo.clone());

        let recovered =
            heal::recover_stale_processing(&dirs, policy.queue.recovery_processing_stale_minutes)?;
        if !recovered.is_empty() {
            info!("recovered {} stale processing file(s)", recovered.len());
        }
        if let Err(e) = ledger::prune_old_logs(&opts.logs_dir, policy.queue.log_keep_days) {
            warn!("log prune failed: {e}");
        }

        Ok(Self {
            opts,
            policy,
            dirs,
            state,
            ledger,
            resolvers,
            breakers,
            git,
            pending: Vec::new(),
            contexts: HashMap::new(),
            running: HashMap::new(),
            results: HashMap::new(),
            tool_locks: HashMap::new(),
            last_heartbeat: None,
            last_gc: None,
            stop: false,
        })
    }

    /// True once a stop was requested and the last running task reaped.
    #[must_use]
    pub fn finished(&self) -> bool {
        self.stop && self.running.is_empty()
    }

    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.running.is_empty() && self.pending.iter().all(|e| e.state == EntryState::Complete)
    }

    #[must_use]
    pub fn result(&self, id: &str) -> Option<&TaskResult> {
        self.results.get(id)
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        info!(
            "worker started (repo {}, cap {})",
            self.opts.repo.display(),
            self.policy.queue.max_concurrent_tasks
        );

        loop {
            self.tick().await;
            if self.finished() {
                break;
            }
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received; draining running tasks");
                    self.stop = true;
                }
                () = tokio::time::sleep(self.opts.poll) => {}
            }
        }

        if let Err(e) = self.state.write_running(&[]) {
            warn!("failed to clear running snapshot: {e}");
        }
        info!("worker stopped");
        Ok(())
    }

    /// One pass of the state machine. Transient I/O problems are logged
    /// and retried implicitly on the next tick.
    pub async fn tick(&mut self) {
        self.write_heartbeat_if_due();
        self.git_self_heal();

        if self.opts.repo.join(STOP_SENTINEL).exists() {
            if !self.stop {
                info!("stop sentinel found; draining running tasks");
            }
            self.stop = true;
        }

        self.reap_finished().await;
        self.fail_blocked_dependents();

        if !self.stop {
            self.dispatch_ready();
            self.ingest_one();
        }
    }

    fn write_heartbeat_if_due(&mut self) {
        let every = Duration::from_secs(self.policy.queue.heartbeat_every_seconds);
        let due = self.last_heartbeat.is_none_or(|at| at.elapsed() >= every);
        if !due {
            return;
        }
        match self.state.write_heartbeat(
            self.running.len(),
            self.policy.queue.max_concurrent_tasks,
        ) {
            Ok(()) => self.last_heartbeat = Some(Instant::now()),
            Err(e) => warn!("heartbeat write failed: {e}"),
        }
    }

    fn git_self_heal(&mut self) {
        if !self.opts.repo.join(".git").exists() {
            return;
        }
        let git_running = self.tool_locks.contains_key("git");
        if let Err(e) = heal::repair_stale_index_lock(
            &self.git,
            self.policy.git.index_lock_stale_minutes,
            git_running,
        ) {
            warn!("index.lock repair failed: {e}");
        }

        if self.policy.git.auto_gc && !git_running {
            let every = Duration::from_secs(self.policy.git.gc_every_minutes * 60);
            let due = self.last_gc.is_none_or(|at| at.elapsed() >= every);
            if due {
                if let Err(e) = self.git.gc_auto() {
                    warn!("git gc failed: {e}");
                }
                self.last_gc = Some(Instant::now());
            }
        }
    }

    async fn reap_finished(&mut self) {
        let finished: Vec<String> = self
            .running
            .iter()
            .filter(|(_, job)| job.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        if finished.is_empty() {
            return;
        }

        for id in finished {
            let Some(job) = self.running.remove(&id) else {
                continue;
            };
            self.tool_locks.remove(&job.tool);

            let outcome = match job.handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("job {id} aborted: {e}");
                    RunOutcome {
                        success: false,
                        final_exit: 1,
                        attempts: Vec::new(),
                        started: job.started,
                        ended: OffsetDateTime::now_utc(),
                    }
                }
            };

            let breaker_update = if outcome.success {
                self.breakers.record_success(&job.tool)
            } else {
                self.breakers.record_failure(
                    &job.tool,
                    &self.policy.breaker,
                    OffsetDateTime::now_utc(),
                )
            };
            if let Err(e) = breaker_update {
                warn!("breaker persist failed for '{}': {e}", job.tool);
            }

            let reason = (!outcome.success).then(|| format!("exit {}", outcome.final_exit));
            self.results.insert(
                id.clone(),
                TaskResult {
                    success: outcome.success,
                    exit: outcome.final_exit,
                    reason,
                },
            );

            let mut recur: Option<Task> = None;
            if let Some(entry) = self.pending.iter_mut().find(|e| e.task.id == id) {
                entry.state = EntryState::Complete;
                if outcome.success && entry.task.recurring_minutes > 0 {
                    recur = Some(entry.task.clone());
                }
            }
            if let Some(task) = recur {
                self.enqueue_recurrence(&task);
            }

            info!(
                "task {id} ({}) finished: exit {} after {} attempt(s)",
                job.tool,
                outcome.final_exit,
                outcome.attempts.len()
            );
            self.bump_context(&job.source, outcome.success);
        }

        self.write_running_snapshot();
    }

    fn enqueue_recurrence(&self, task: &Task) {
        let now = OffsetDateTime::now_utc();
        let next = task.recurrence(now);
        let name = format!(
            "recur_{}_{:02}{:02}{:02}.jsonl",
            next.id,
            now.hour(),
            now.minute(),
            now.second()
        );
        let path = self.dirs.inbox.join(name);
        let write = serde_json::to_string(&next)
            .map_err(anyhow::Error::from)
            .and_then(|mut line| {
                line.push('\n');
                std::fs::write(&path, line).map_err(anyhow::Error::from)
            });
        match write {
            Ok(()) => info!(
                "re-enqueued recurring task {} as {} (+{} min)",
                task.id, next.id, task.recurring_minutes
            ),
            Err(e) => warn!("failed to re-enqueue recurring task {}: {e}", task.id),
        }
    }

    /// Pending tasks whose dependency has already failed complete
    /// immediately with exit 409; their own failure cascades on later
    /// ticks.
    fn fail_blocked_dependents(&mut self) {
        let blocked: Vec<(String, String)> = self
            .pending
            .iter()
            .filter(|e| e.state == EntryState::Pending)
            .filter_map(|e| {
                e.task
                    .depends_on
                    .iter()
                    .find(|d| self.results.get(*d).is_some_and(|r| !r.success))
                    .map(|d| (e.task.id.clone(), d.clone()))
            })
            .collect();

        for (id, dep) in blocked {
            self.fail_without_run(
                &id,
                runner::EXIT_DEP_FAILED,
                format!("dependency failed: {dep}"),
            );
        }
    }

    /// Complete a pending task as failed without launching a process:
    /// resolver rejections, failed dependencies, self-dependencies.
    fn fail_without_run(&mut self, id: &str, exit: i32, note: String) {
        let Some(entry) = self
            .pending
            .iter_mut()
            .find(|e| e.task.id == id && e.state == EntryState::Pending)
        else {
            return;
        };
        entry.state = EntryState::Complete;
        let task = entry.task.clone();
        let source = entry.source.clone();

        let record = LedgerRecord {
            ts: OffsetDateTime::now_utc(),
            id: task.id.clone(),
            tool: task.tool.clone(),
            attempt: task.attempt + 1,
            exit,
            ok: false,
            repo: task.repo.to_string_lossy().into_owned(),
            duration_ms: None,
            note: Some(note.clone()),
        };
        if let Err(e) = self.ledger.append(&record) {
            warn!("ledger append failed for task {id}: {e}");
        }

        warn!("task {id} failed without running: {note}");
        self.results.insert(
            task.id,
            TaskResult {
                success: false,
                exit,
                reason: Some(note),
            },
        );
        self.bump_context(&source, false);
    }

    fn deps_satisfied(&self, task: &Task) -> bool {
        task.depends_on
            .iter()
            .all(|d| self.results.get(d).is_some_and(|r| r.success))
    }

    fn dispatch_ready(&mut self) {
        let max = self.policy.queue.max_concurrent_tasks;
        if self.running.len() >= max {
            return;
        }
        let now = OffsetDateTime::now_utc();

        let mut ready: Vec<(u8, OffsetDateTime, String)> = self
            .pending
            .iter()
            .filter(|e| e.state == EntryState::Pending)
            .filter(|e| !self.tool_locks.contains_key(&e.task.tool))
            .filter(|e| e.task.run_at.is_none_or(|at| now >= at))
            .filter(|e| self.deps_satisfied(&e.task))
            .map(|e| (e.task.priority.rank(), e.added, e.task.id.clone()))
            .collect();
        // Highest priority first; FIFO within a priority.
        ready.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let mut dispatched = false;
        for (_, _, id) in ready {
            if self.running.len() >= max {
                break;
            }
            dispatched |= self.dispatch_one(&id);
        }
        if dispatched {
            self.write_running_snapshot();
        }
    }

    fn dispatch_one(&mut self, id: &str) -> bool {
        let Some(pos) = self
            .pending
            .iter()
            .position(|e| e.task.id == id && e.state == EntryState::Pending)
        else {
            return false;
        };
        let task = self.pending[pos].task.clone();
        if self.tool_locks.contains_key(&task.tool) {
            // Lock went to an earlier dispatch in this same pass.
            return false;
        }

        let prompt_file = match self.write_prompt_file(&task) {
            Ok(p) => p,
            Err(e) => {
                warn!("prompt file write failed for task {id}: {e}");
                None
            }
        };

        let command = match self.resolvers.resolve(&task, prompt_file.as_deref()) {
            Ok(command) => command,
            Err(e) => {
                self.fail_without_run(id, runner::EXIT_REJECTED, e.to_string());
                return false;
            }
        };

        let source = self.pending[pos].source.clone();
        self.pending[pos].state = EntryState::Running;
        self.tool_locks.insert(task.tool.clone(), task.id.clone());

        let spec = JobSpec {
            task_id: task.id.clone(),
            tool: task.tool.clone(),
            command,
            cwd: task.repo.clone(),
            log_path: self.opts.logs_dir.join(format!("task_{}.log", task.id)),
            timeout_sec: task.timeout_sec,
            retry: RetrySettings {
                max_retries: task.max_retries,
                backoff_sec: task.backoff_sec,
                backoff_max: task.backoff_max,
                jitter_sec: task.jitter_sec,
                retry_on_exit_codes: self.policy.retry.retry_on_exit_codes.clone(),
            },
            starting_attempt: task.attempt,
        };
        let handle = tokio::spawn(runner::run_job(spec, self.ledger.clone()));

        info!("dispatched task {} ({})", task.id, task.tool);
        self.running.insert(
            task.id.clone(),
            RunningJob {
                tool: task.tool,
                repo: task.repo.to_string_lossy().into_owned(),
                source,
                started: OffsetDateTime::now_utc(),
                priority: task.priority,
                attempt: task.attempt,
                handle,
            },
        );
        true
    }

    fn write_prompt_file(&self, task: &Task) -> anyhow::Result<Option<PathBuf>> {
        let Some(prompt) = &task.prompt else {
            return Ok(None);
        };
        let dir = self.opts.logs_dir.join("prompts");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("prompt_{}.txt", task.id));
        std::fs::write(&path, prompt)?;
        Ok(Some(path))
    }

    /// Ingest at most one inbox file per tick, oldest first. The file is
    /// committed atomically: every line must decode and no breaker may
    /// be open before any entry joins the pending set.
    fn ingest_one(&mut self) {
        let file = match self.dirs.oldest_inbox_file() {
            Ok(Some(file)) => file,
            Ok(None) => return,
            Err(e) => {
                warn!("inbox scan failed: {e}");
                return;
            }
        };
        let processing = match paths::move_into(&file, &self.dirs.processing) {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to claim {}: {e}", file.display());
                return;
            }
        };
        let raw = match std::fs::read_to_string(&processing) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("failed to read {}: {e}", processing.display());
                return;
            }
        };

        let now = OffsetDateTime::now_utc();
        let mut tasks: Vec<Task> = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            match model::decode_line(line, &self.policy.retry, &self.opts.repo) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    let record = LedgerRecord {
                        ts: now,
                        id: "parse".to_owned(),
                        tool: String::new(),
                        attempt: 1,
                        exit: runner::EXIT_PARSE,
                        ok: false,
                        repo: self.opts.repo.to_string_lossy().into_owned(),
                        duration_ms: None,
                        note: Some(format!("bad json: {e:#}")),
                    };
                    if let Err(e) = self.ledger.append(&record) {
                        warn!("ledger append failed: {e}");
                    }
                    warn!("parse failure in {}: {e:#}", processing.display());
                    if let Err(e) = paths::move_into(&processing, &self.dirs.failed) {
                        warn!("failed to move {}: {e}", processing.display());
                    }
                    return;
                }
            }
        }

        if let Some(task) = tasks.iter().find(|t| self.breakers.is_open(&t.tool, now)) {
            warn!(
                "circuit breaker open for '{}'; quarantining {}",
                task.tool,
                processing.display()
            );
            if let Err(e) = paths::move_into(&processing, &self.dirs.quarantine) {
                warn!("failed to quarantine {}: {e}", processing.display());
            }
            return;
        }

        if tasks.is_empty() {
            if let Err(e) = paths::move_into(&processing, &self.dirs.done) {
                warn!("failed to move {}: {e}", processing.display());
            }
            return;
        }

        info!(
            "ingested {} task(s) from {}",
            tasks.len(),
            processing.display()
        );
        self.contexts.insert(
            processing.clone(),
            FileContext {
                total: tasks.len(),
                completed: 0,
                failures: 0,
            },
        );
        let mut self_deps: Vec<String> = Vec::new();
        for task in tasks {
            if task.has_self_dependency() {
                self_deps.push(task.id.clone());
            }
            self.pending.push(PendingEntry {
                task,
                source: processing.clone(),
                state: EntryState::Pending,
                added: now,
            });
        }
        for id in self_deps {
            self.fail_without_run(
                &id,
                runner::EXIT_DEP_FAILED,
                "self dependency is unresolvable".to_owned(),
            );
        }
    }

    fn bump_context(&mut self, source: &PathBuf, success: bool) {
        let complete = match self.contexts.get_mut(source) {
            Some(ctx) => {
                ctx.completed += 1;
                if !success {
                    ctx.failures += 1;
                }
                ctx.completed >= ctx.total
            }
            None => false,
        };
        if complete {
            self.finalize_file(source);
        }
    }

    fn finalize_file(&mut self, source: &PathBuf) {
        let Some(ctx) = self.contexts.remove(source) else {
            return;
        };
        self.pending.retain(|e| &e.source != source);
        let dest = if ctx.failures == 0 {
            &self.dirs.done
        } else {
            &self.dirs.failed
        };
        match paths::move_into(source, dest) {
            Ok(moved) => info!(
                "{} complete ({} failed of {}) -> {}",
                source.display(),
                ctx.failures,
                ctx.total,
                moved.display()
            ),
            Err(e) => warn!("failed to finalize {}: {e}", source.display()),
        }
    }

    fn write_running_snapshot(&self) {
        let mut snapshot: Vec<RunningTask> = self
            .running
            .iter()
            .map(|(id, job)| RunningTask {
                id: id.clone(),
                tool: job.tool.clone(),
                repo: job.repo.clone(),
                started: job.started,
                file: job
                    .source
                    .file_name()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                priority: job.priority,
                attempt: job.attempt,
            })
            .collect();
        snapshot.sort_by(|a, b| a.started.cmp(&b.started).then_with(|| a.id.cmp(&b.id)));
        if let Err(e) = self.state.write_running(&snapshot) {
            warn!("failed to write running snapshot: {e}");
        }
    }
}
