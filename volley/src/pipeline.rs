//! Pipeline loop: discovers batch sources, drains them and archives them.
//!
//! The loop is an explicit state machine:
//!
//! ```text
//! IDLE -> SCANNING -> SELECTED -> DRAINING -> ARCHIVING -> SCANNING
//! ```
//!
//! The stop token is checked at every state boundary and never inside a drain,
//! so a stop request lets the current drain finish, and its archive happen,
//! before the loop exits. Waiting in `IDLE` is the only place the stop token
//! can cut a state short.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::batch::{read_batch, Batch};
use crate::config::{Config, RateLimitConfig};
use crate::engine::{Dispatcher, DrainSummary};
use crate::error::Result;
use crate::queue::{group_records, Queue};
use crate::sink::JsonlResultLog;
use crate::types::BatchState;

/// Suffix of result log files.
pub const RESULTS_SUFFIX: &str = "results.jsonl";

/// Result log of a batch while it drains: `<output_dir>/<stem>.<fingerprint>.results.jsonl`.
///
/// The fingerprint ties the log to the source contents. A log left behind for
/// an earlier source with the same name is never picked up by a different one.
pub fn in_progress_log_path(output_dir: &Path, batch: &Batch) -> PathBuf {
    output_dir.join(format!("{}.{}.{RESULTS_SUFFIX}", batch.name, batch.fingerprint))
}

const ARCHIVE_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Configuration for the pipeline loop.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub processed_dir: PathBuf,
    /// Extension identifying batch sources, without the dot
    pub batch_extension: String,
    /// Wait between scans that found nothing
    pub poll_interval: Duration,
    /// Batches selected and drained together per pass
    pub batch_concurrency: usize,
    pub rate_limits: RateLimitConfig,
    /// Stop as soon as a scan finds nothing to do
    pub exit_when_idle: bool,
}

impl PipelineConfig {
    pub fn from_config(config: &Config, exit_when_idle: bool) -> Self {
        Self {
            input_dir: config.input_dir.clone(),
            output_dir: config.output_dir.clone(),
            processed_dir: config.processed_dir.clone(),
            batch_extension: config.batch_extension.clone(),
            poll_interval: config.poll_interval,
            batch_concurrency: config.batch_concurrency(),
            rate_limits: config.rate_limits.clone(),
            exit_when_idle,
        }
    }
}

/// A batch that passed validation and is ready to drain.
#[derive(Debug)]
pub struct ReadyBatch {
    pub batch: Batch,
    pub queues: Vec<Queue>,
}

/// A batch whose drain completed and which is waiting to be archived.
#[derive(Debug)]
pub struct DrainedBatch {
    pub batch: Batch,
    pub log_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub summary: DrainSummary,
}

/// States of the pipeline loop.
#[derive(Debug)]
pub enum PipelineState {
    /// Waiting for the poll interval before the next scan
    Idle,
    Scanning,
    /// Sources picked by the last scan, in name order
    Selected(Vec<PathBuf>),
    Draining(Vec<ReadyBatch>),
    Archiving {
        drained: Vec<DrainedBatch>,
        /// Batches of this pass whose drain failed
        failed: usize,
    },
    Stopped,
}

impl PipelineState {
    fn name(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Scanning => "scanning",
            PipelineState::Selected(_) => "selected",
            PipelineState::Draining(_) => "draining",
            PipelineState::Archiving { .. } => "archiving",
            PipelineState::Stopped => "stopped",
        }
    }
}

/// Counters over the lifetime of one [`Pipeline::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub archived: usize,
    pub rejected: usize,
    pub failed: usize,
}

/// The continuous scan, drain and archive loop.
pub struct Pipeline {
    config: PipelineConfig,
    dispatcher: Dispatcher,
    /// Sources that failed validation, with their modification time at the time
    rejected: HashMap<PathBuf, Option<SystemTime>>,
    stats: PipelineStats,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, dispatcher: Dispatcher) -> Self {
        Self {
            config,
            dispatcher,
            rejected: HashMap::new(),
            stats: PipelineStats::default(),
        }
    }

    /// Run until `stop` is cancelled. With `exit_when_idle` set, also stop when
    /// a scan finds nothing or a pass leaves a batch failed.
    ///
    /// # Errors
    /// Only failing to create the working directories is fatal. Problems with a
    /// single batch are logged and the loop moves on.
    pub async fn run(&mut self, stop: CancellationToken) -> Result<PipelineStats> {
        for dir in [
            &self.config.input_dir,
            &self.config.output_dir,
            &self.config.processed_dir,
        ] {
            tokio::fs::create_dir_all(dir).await?;
        }

        tracing::info!(
            input_dir = %self.config.input_dir.display(),
            output_dir = %self.config.output_dir.display(),
            processed_dir = %self.config.processed_dir.display(),
            batch_concurrency = self.config.batch_concurrency,
            "Pipeline started"
        );

        let mut state = PipelineState::Scanning;
        loop {
            // A finished drain is always archived before the stop is honored
            let interruptible = !matches!(
                state,
                PipelineState::Archiving { .. } | PipelineState::Stopped
            );
            if stop.is_cancelled() && interruptible {
                tracing::info!(state = state.name(), "Stop requested");
                state = PipelineState::Stopped;
            }

            tracing::trace!(state = state.name(), "Pipeline state");

            state = match state {
                PipelineState::Idle => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = stop.cancelled() => {}
                    }
                    PipelineState::Scanning
                }
                PipelineState::Scanning => match self.scan().await {
                    Ok(found) if found.is_empty() => {
                        if self.config.exit_when_idle {
                            tracing::info!("No batches left, exiting");
                            PipelineState::Stopped
                        } else {
                            PipelineState::Idle
                        }
                    }
                    Ok(found) => PipelineState::Selected(found),
                    Err(e) => {
                        tracing::warn!(error = %e, input_dir = %self.config.input_dir.display(), "Scan failed");
                        PipelineState::Idle
                    }
                },
                PipelineState::Selected(paths) => PipelineState::Draining(self.prepare(paths).await),
                PipelineState::Draining(ready) => self.drain(ready).await,
                PipelineState::Archiving { drained, mut failed } => {
                    for drained in drained {
                        if let Err(e) = self.archive(&drained).await {
                            tracing::error!(batch = %drained.batch.name, error = %e, "Failed to archive batch");
                            failed += 1;
                        }
                    }
                    self.stats.failed += failed;
                    // Failed batches are still in the input directory
                    if failed > 0 && self.config.exit_when_idle {
                        tracing::warn!(failed, "Batches failed, exiting instead of retrying them");
                        PipelineState::Stopped
                    } else if failed > 0 {
                        PipelineState::Idle
                    } else {
                        PipelineState::Scanning
                    }
                }
                PipelineState::Stopped => {
                    tracing::info!(
                        archived = self.stats.archived,
                        rejected = self.stats.rejected,
                        failed = self.stats.failed,
                        "Pipeline stopped"
                    );
                    return Ok(self.stats);
                }
            };
        }
    }

    /// List batch sources in the input directory, oldest name first, skipping
    /// rejected sources that have not changed since they were rejected.
    async fn scan(&mut self) -> Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.config.input_dir).await?;
        let mut found = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let matches_extension = path
                .extension()
                .is_some_and(|ext| ext == self.config.batch_extension.as_str());
            if !matches_extension || !entry.file_type().await?.is_file() {
                continue;
            }
            found.push(path);
        }
        found.sort();

        self.rejected.retain(|path, _| found.contains(path));

        let mut selectable = Vec::new();
        for path in found {
            if let Some(rejected_mtime) = self.rejected.get(&path) {
                if *rejected_mtime == modified(&path).await {
                    continue;
                }
                tracing::info!(source = %path.display(), "Rejected batch changed, reconsidering");
                self.rejected.remove(&path);
            }
            selectable.push(path);
        }

        let total = selectable.len();
        selectable.truncate(self.config.batch_concurrency);
        if total > 0 {
            tracing::info!(
                found = total,
                selected = selectable.len(),
                "Selected batches"
            );
        }
        Ok(selectable)
    }

    /// Read, validate and group the selected sources. Sources that fail are
    /// remembered and left in place.
    async fn prepare(&mut self, paths: Vec<PathBuf>) -> Vec<ReadyBatch> {
        let mut ready = Vec::new();
        for path in paths {
            let registry = self.dispatcher.registry();
            let prepared = match read_batch(&path, |tag| registry.contains(tag)).await {
                Ok(batch) => group_records(batch.records.clone(), &self.config.rate_limits)
                    .map(|queues| ReadyBatch { batch, queues }),
                Err(e) => Err(e),
            };

            match prepared {
                Ok(batch) => {
                    tracing::info!(
                        batch = %batch.batch.name,
                        records = batch.batch.len(),
                        queues = batch.queues.len(),
                        "Batch accepted"
                    );
                    ready.push(batch);
                }
                Err(e) => {
                    tracing::warn!(
                        source = %path.display(),
                        error = %e,
                        structural = e.is_structural(),
                        "Rejecting batch, leaving it in place"
                    );
                    let mtime = modified(&path).await;
                    self.rejected.insert(path, mtime);
                    self.stats.rejected += 1;
                }
            }
        }
        ready
    }

    /// Drain the prepared batches together.
    async fn drain(&self, ready: Vec<ReadyBatch>) -> PipelineState {
        let outcomes = futures::future::join_all(ready.into_iter().map(|r| self.drain_one(r))).await;

        let mut drained = Vec::new();
        let mut failed = 0;
        for outcome in outcomes {
            match outcome {
                Ok(batch) => drained.push(batch),
                Err(()) => failed += 1,
            }
        }
        PipelineState::Archiving { drained, failed }
    }

    #[tracing::instrument(skip_all, fields(batch = %ready.batch.name))]
    async fn drain_one(&self, ready: ReadyBatch) -> std::result::Result<DrainedBatch, ()> {
        let ReadyBatch { mut batch, queues } = ready;
        let started_at = Utc::now();
        let log_path = in_progress_log_path(&self.config.output_dir, &batch);

        let log = match JsonlResultLog::open(&log_path).await {
            Ok(log) => Arc::new(log),
            Err(e) => {
                tracing::error!(error = %e, "Cannot open result log, batch left in place");
                return Err(());
            }
        };

        batch.state = BatchState::InProgress;
        tracing::info!(records = batch.len(), log = %log_path.display(), "Draining batch");

        match self.dispatcher.drain(&batch.name, queues, log).await {
            Ok(summary) => {
                batch.state = BatchState::Drained;
                Ok(DrainedBatch {
                    batch,
                    log_path,
                    started_at,
                    summary,
                })
            }
            Err(e) => {
                tracing::error!(error = %e, "Drain halted, batch left in place to resume later");
                Err(())
            }
        }
    }

    /// Move the drained source to the processed directory and stamp its log.
    ///
    /// The source moves first: if the process dies in between, the next run
    /// sees no source and leaves the unstamped log alone, rather than
    /// re-draining a source whose log was already moved away.
    async fn archive(&mut self, drained: &DrainedBatch) -> Result<()> {
        let stamp = drained.started_at.format(ARCHIVE_TIMESTAMP_FORMAT).to_string();
        let name = &drained.batch.name;

        let archived_source = unused_path(
            &self.config.processed_dir,
            &format!("{name}.{stamp}"),
            &self.config.batch_extension,
        )
        .await;
        move_file(&drained.batch.source, &archived_source).await?;

        let archived_log = unused_path(&self.config.output_dir, &format!("{name}.{stamp}"), RESULTS_SUFFIX).await;
        move_file(&drained.log_path, &archived_log).await?;

        self.stats.archived += 1;
        tracing::info!(
            batch = %name,
            archived_to = %archived_source.display(),
            results = %archived_log.display(),
            succeeded = drained.summary.succeeded,
            failed = drained.summary.failed,
            skipped = drained.summary.skipped,
            "Batch archived"
        );
        Ok(())
    }
}

async fn modified(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path)
        .await
        .and_then(|metadata| metadata.modified())
        .ok()
}

/// `<dir>/<stem>.<suffix>`, or `<dir>/<stem>-<n>.<suffix>` if that is taken.
async fn unused_path(dir: &Path, stem: &str, suffix: &str) -> PathBuf {
    let mut candidate = dir.join(format!("{stem}.{suffix}"));
    let mut n = 1;
    while tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        candidate = dir.join(format!("{stem}-{n}.{suffix}"));
        n += 1;
    }
    candidate
}

/// Rename, falling back to copy and remove when the rename fails (e.g. across filesystems).
async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Err(rename_error) = tokio::fs::rename(from, to).await {
        tracing::debug!(from = %from.display(), to = %to.display(), error = %rename_error, "Rename failed, copying instead");
        if tokio::fs::copy(from, to).await.is_err() {
            return Err(rename_error.into());
        }
        tokio::fs::remove_file(from).await?;
    }
    Ok(())
}
