#![forbid(unsafe_code)]

//! Keeps a worker alive.
//!
//! The supervisor has no persistent state: it spawns the worker, then
//! checks every few seconds that the process is alive and its heartbeat
//! file is fresh. A dead or hung worker is killed and respawned. An OS
//! service manager is expected to start the supervisor itself at boot.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::queue::ledger;

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub state_dir: PathBuf,
    pub heartbeat_stale: Duration,
    pub check_every: Duration,
}

/// True when the heartbeat file is unreadable or older than `window`.
#[must_use]
pub fn heartbeat_is_stale(
    heartbeat_path: &std::path::Path,
    now: OffsetDateTime,
    window: Duration,
) -> bool {
    match ledger::heartbeat_age(heartbeat_path, now) {
        Some(age) => age.whole_seconds() > window.as_secs() as i64,
        None => true,
    }
}

pub async fn supervise(opts: SupervisorOptions) -> anyhow::Result<()> {
    let heartbeat_path = opts.state_dir.join("heartbeat.json");

    loop {
        info!(
            "starting worker: {} {}",
            opts.program.display(),
            opts.args.join(" ")
        );
        let mut child = tokio::process::Command::new(&opts.program)
            .args(&opts.args)
            .spawn()
            .with_context(|| format!("failed to spawn {}", opts.program.display()))?;
        let spawned = Instant::now();

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received; stopping worker");
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    return Ok(());
                }
                () = tokio::time::sleep(opts.check_every) => {}
            }

            match child.try_wait() {
                Ok(Some(status)) => {
                    warn!("worker exited ({status}); restarting");
                    break;
                }
                Ok(None) => {}
                Err(e) => warn!("failed to poll worker: {e}"),
            }

            // Give a fresh worker one stale-window to produce its first
            // heartbeat before judging it hung.
            if spawned.elapsed() < opts.heartbeat_stale {
                continue;
            }
            if heartbeat_is_stale(&heartbeat_path, OffsetDateTime::now_utc(), opts.heartbeat_stale)
            {
                warn!("heartbeat stale; killing worker");
                let _ = child.kill().await;
                let _ = child.wait().await;
                break;
            }
        }
    }
}
