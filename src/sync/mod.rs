//! One-way incremental mirror from transient to durable storage.
//!
//! There is no sync state besides the two trees: every cycle walks the source
//! and copies a file when the destination copy is missing, has a different
//! size, or is older than the source. Files are never deleted from the
//! destination. In-flight temporary files (see [`crate::fsutil`]) are skipped,
//! which is all the coordination needed with workers writing into the source.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::config::SyncConfig;
use crate::error::{FleetError, Result};
use crate::fsutil;

/// Modification times closer than this are considered equal; durable
/// filesystems may store coarser timestamps than the transient tier.
const MODIFY_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Regular files seen in the source
    pub scanned: usize,
    pub copied: usize,
    pub bytes_copied: u64,
    pub unchanged: usize,
    /// Temporary files still being written
    pub in_flight: usize,
    pub failed: usize,
}

impl SyncReport {
    fn merge(&mut self, other: &SyncReport) {
        self.scanned += other.scanned;
        self.copied += other.copied;
        self.bytes_copied += other.bytes_copied;
        self.unchanged += other.unchanged;
        self.in_flight += other.in_flight;
        self.failed += other.failed;
    }
}

fn needs_copy(src: &std::fs::Metadata, dst: &Path) -> bool {
    let dst = match std::fs::metadata(dst) {
        Ok(meta) => meta,
        Err(_) => return true,
    };
    if src.len() != dst.len() {
        return true;
    }
    match (src.modified(), dst.modified()) {
        (Ok(s), Ok(d)) => s
            .duration_since(d)
            .map(|newer_by| newer_by > MODIFY_WINDOW)
            .unwrap_or(false),
        _ => true,
    }
}

/// Run one reconciliation cycle. Per-file errors are counted, not returned.
pub fn sync_once(source: &Path, destination: &Path) -> Result<SyncReport> {
    let mut report = SyncReport::default();
    if !source.exists() {
        return Ok(report);
    }
    std::fs::create_dir_all(destination)?;

    for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "Sync walk error");
                report.failed += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if fsutil::is_temp_file(path) {
            report.in_flight += 1;
            continue;
        }
        report.scanned += 1;

        let rel = path
            .strip_prefix(source)
            .map_err(|e| FleetError::Internal(format!("walk escaped source: {e}")))?;
        let target = destination.join(rel);

        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Sync stat failed");
                report.failed += 1;
                continue;
            }
        };
        if !needs_copy(&meta, &target) {
            report.unchanged += 1;
            continue;
        }

        match fsutil::copy_atomic(path, &target) {
            Ok(bytes) => {
                tracing::debug!(file = %rel.display(), bytes, "Synced");
                report.copied += 1;
                report.bytes_copied += bytes;
            }
            Err(e) => {
                tracing::warn!(file = %rel.display(), error = %e, "Sync copy failed, will retry next cycle");
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

async fn run_cycle(config: &SyncConfig) -> Result<SyncReport> {
    let source = config.source.clone();
    let destination = config.destination.clone();
    tokio::task::spawn_blocking(move || sync_once(&source, &destination))
        .await
        .map_err(|e| FleetError::Internal(format!("sync task panicked: {e}")))?
}

/// Periodic sync running beside the workers.
///
/// Started with [`SyncLoop::start`]; [`SyncLoop::stop`] ends the timer, waits
/// for a cycle in progress, and runs one last cycle synchronously.
pub struct SyncLoop {
    config: SyncConfig,
    cancel: CancellationToken,
    handle: JoinHandle<SyncReport>,
    cycles: Arc<AtomicU64>,
}

impl SyncLoop {
    pub fn start(config: SyncConfig) -> Self {
        let cancel = CancellationToken::new();
        let cycles = Arc::new(AtomicU64::new(0));

        let task_config = config.clone();
        let task_cancel = cancel.clone();
        let task_cycles = cycles.clone();
        let handle = tokio::spawn(async move {
            Self::run(task_config, task_cancel, task_cycles).await
        });

        tracing::info!(
            source = %config.source.display(),
            destination = %config.destination.display(),
            interval_secs = config.interval.as_secs(),
            "Sync loop started"
        );
        Self {
            config,
            cancel,
            handle,
            cycles,
        }
    }

    async fn run(config: SyncConfig, cancel: CancellationToken, cycles: Arc<AtomicU64>) -> SyncReport {
        let mut totals = SyncReport::default();
        let period = config.interval.max(Duration::from_millis(10));
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let started = SystemTime::now();
            match run_cycle(&config).await {
                Ok(report) => {
                    tracing::info!(
                        copied = report.copied,
                        bytes = report.bytes_copied,
                        unchanged = report.unchanged,
                        failed = report.failed,
                        elapsed_ms = started.elapsed().map(|d| d.as_millis() as u64).unwrap_or(0),
                        "Sync cycle finished"
                    );
                    totals.merge(&report);
                }
                Err(e) => tracing::warn!(error = %e, "Sync cycle failed, will retry next cycle"),
            }
            cycles.fetch_add(1, Ordering::Relaxed);
        }
        totals
    }

    /// Completed background cycles so far.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Stop the timer and run the final pass. The returned report covers the
    /// final pass only.
    pub async fn stop(self) -> Result<SyncReport> {
        self.cancel.cancel();
        match self.handle.await {
            Ok(totals) => tracing::debug!(copied = totals.copied, "Background sync stopped"),
            Err(e) => tracing::warn!(error = %e, "Sync task ended abnormally"),
        }

        let report = run_cycle(&self.config).await?;
        tracing::info!(
            copied = report.copied,
            bytes = report.bytes_copied,
            unchanged = report.unchanged,
            failed = report.failed,
            "Final sync finished"
        );
        Ok(report)
    }
}
