#![forbid(unsafe_code)]

//! Per-tool circuit breakers.
//!
//! A burst of consecutive failures opens the breaker for a tool; while
//! open, ingestion diverts whole task files to `quarantine/`. The first
//! successful attempt closes it again. There is no half-open probe: once
//! `until` passes, tasks simply flow again.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::warn;

use crate::config::BreakerPolicy;
use crate::queue::ledger::write_json_atomic;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BreakerState {
    #[default]
    Closed,
    Open,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolBreaker {
    pub fails: u32,
    pub state: BreakerState,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub until: Option<OffsetDateTime>,
}

#[derive(Debug)]
pub struct BreakerBoard {
    path: PathBuf,
    tools: BTreeMap<String, ToolBreaker>,
}

impl BreakerBoard {
    /// Load persisted breaker state. A missing file is an empty board;
    /// an unreadable one is logged and replaced on the next save.
    #[must_use]
    pub fn load(path: PathBuf) -> Self {
        let tools = match std::fs::read(&path) {
            Ok(data) => match serde_json::from_slice(&data) {
                Ok(tools) => tools,
                Err(e) => {
                    warn!("ignoring malformed {}: {e}", path.display());
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self { path, tools }
    }

    #[must_use]
    pub fn is_open(&self, tool: &str, now: OffsetDateTime) -> bool {
        let Some(breaker) = self.tools.get(tool) else {
            return false;
        };
        breaker.state == BreakerState::Open && breaker.until.is_some_and(|until| now < until)
    }

    #[must_use]
    pub fn get(&self, tool: &str) -> Option<&ToolBreaker> {
        self.tools.get(tool)
    }

    pub fn record_success(&mut self, tool: &str) -> anyhow::Result<()> {
        let breaker = self.tools.entry(tool.to_owned()).or_default();
        breaker.fails = 0;
        breaker.state = BreakerState::Closed;
        breaker.until = None;
        self.save()
    }

    pub fn record_failure(
        &mut self,
        tool: &str,
        policy: &BreakerPolicy,
        now: OffsetDateTime,
    ) -> anyhow::Result<()> {
        let breaker = self.tools.entry(tool.to_owned()).or_default();
        breaker.fails += 1;
        if breaker.fails >= policy.window_failures {
            breaker.state = BreakerState::Open;
            breaker.until = Some(now + time::Duration::seconds(policy.open_seconds as i64));
        }
        self.save()
    }

    fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_json_atomic(&self.path, &self.tools)
    }
}
