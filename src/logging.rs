#![forbid(unsafe_code)]

//! Process-wide logging.
//!
//! Two sinks: a compact stderr layer filtered by `RUST_LOG` (defaults to
//! `info`), and an append-only human log at `logs/queueworker.log` that
//! external dashboards tail. The file sink is plain text without ANSI
//! escapes.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _};

pub fn init(log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).compact();

    let Some(path) = log_file else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        return Ok(());
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        .init();
    Ok(())
}

/// Move an oversized log file into an `archive/` sibling with a
/// timestamp suffix. Called once at startup before the file is reopened
/// for appending.
pub fn rotate_oversized(path: &Path, max_mb: u64) -> anyhow::Result<()> {
    let Ok(meta) = std::fs::metadata(path) else {
        return Ok(());
    };
    if meta.len() <= max_mb.saturating_mul(1024 * 1024) {
        return Ok(());
    }

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let archive = parent.join("archive");
    std::fs::create_dir_all(&archive)
        .with_context(|| format!("failed to create {}", archive.display()))?;

    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("queueworker.log");
    let stamp = time::OffsetDateTime::now_utc().unix_timestamp();
    let dest = archive.join(format!("{name}.{stamp}"));
    std::fs::rename(path, &dest)
        .with_context(|| format!("failed to rename {} -> {}", path.display(), dest.display()))?;
    Ok(())
}
