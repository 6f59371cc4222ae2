//! Copy Scheduler: drains catalog entries in `pending` or `error` through a fixed pool of
//! workers.
//!
//! Entries are split between workers up front, so no entry is ever handed to two workers. A
//! worker still claims each entry with a compare-and-set to `copying` before touching it, and
//! skips entries that changed state since the run listed them.

use crate::prelude::*;

use crate::execution::catalog::{Catalog, CatalogEntry, CatalogStatus};
use crate::execution::stats::CopyStats;
use crate::ops::interface::{ObjectDestination, ObjectSource, StorageError, StorageResult};
use crate::ops::path_mapping::PathMapping;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

pub const REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Everything the workers of one run share.
pub struct CopyContext {
    pub project: String,
    pub catalog: Catalog,
    pub source: Arc<dyn ObjectSource>,
    pub destination: Arc<dyn ObjectDestination>,
    pub mapping: PathMapping,
}

/// Splits `entries` round-robin into at most `workers` non-empty groups. Every entry lands in
/// exactly one group.
pub fn partition_entries<T>(entries: Vec<T>, workers: usize) -> Vec<Vec<T>> {
    let groups = workers.max(1).min(entries.len());
    let mut partitions: Vec<Vec<T>> = (0..groups).map(|_| Vec::new()).collect();
    for (idx, entry) in entries.into_iter().enumerate() {
        partitions[idx % groups].push(entry);
    }
    partitions
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyOutcome {
    AlreadyPresent,
    Copied(u64),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Entries that needed a copy when the run started.
    pub total: usize,
    pub completed: u64,
    pub exists: u64,
    pub failed: u64,
    /// Entries left for the next run because the run was cancelled.
    pub cancelled: u64,
    pub bytes_copied: u64,
    pub was_cancelled: bool,
}

impl RunSummary {
    /// Built once every worker has returned. Entries that were neither finished nor claimed
    /// elsewhere were left behind by cancellation.
    fn from_stats(total: usize, stats: &CopyStats) -> Self {
        let accounted = (stats.num_finished() + stats.num_claim_lost.get()).max(0) as usize;
        let cancelled = total.saturating_sub(accounted) as u64;
        Self {
            total,
            completed: stats.num_completed.get().max(0) as u64,
            exists: stats.num_exists.get().max(0) as u64,
            failed: stats.num_errors.get().max(0) as u64,
            cancelled,
            bytes_copied: stats.bytes_copied.get().max(0) as u64,
            was_cancelled: cancelled > 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && !self.was_cancelled
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} of {} objects copied ({} bytes), {} already at destination, {} failed",
            self.completed, self.total, self.bytes_copied, self.exists, self.failed
        )?;
        if self.was_cancelled {
            write!(f, ", cancelled with {} left for the next run", self.cancelled)?;
        }
        Ok(())
    }
}

async fn copy_entry(
    ctx: &CopyContext,
    entry: &CatalogEntry,
    cancel: &CancellationToken,
) -> StorageResult<CopyOutcome> {
    let dest_path = ctx.mapping.destination_path(&entry.path);
    if cancel.is_cancelled() {
        return Err(StorageError::Cancelled);
    }
    if entry.source_changed {
        debug!("{} changed at the source, overwriting {dest_path}", entry.path);
    } else if ctx.destination.exists(&dest_path, cancel).await? {
        debug!("{dest_path} already at destination");
        return Ok(CopyOutcome::AlreadyPresent);
    }
    let written = ctx
        .destination
        .copy_from(ctx.source.as_ref(), &entry.path, &dest_path, entry.size, cancel)
        .await?;
    debug!("copied {} -> {dest_path} ({written} bytes)", entry.path);
    Ok(CopyOutcome::Copied(written))
}

/// Runs one entry through `copying` to its next state. Only catalog failures are returned;
/// copy failures end up on the entry.
async fn process_entry(
    ctx: &CopyContext,
    entry: &CatalogEntry,
    stats: &CopyStats,
    cancel: &CancellationToken,
) -> Result<()> {
    let claimed = ctx
        .catalog
        .transition_status(
            entry.id,
            &CatalogStatus::NEEDS_COPY,
            CatalogStatus::Copying,
            None,
        )
        .await?;
    if !claimed {
        debug!("{} was claimed elsewhere, skipping", entry.path);
        stats.num_claim_lost.inc(1);
        return Ok(());
    }

    stats.start_processing();
    let outcome = copy_entry(ctx, entry, cancel).await;
    stats.finish_processing();

    let (status, message) = match outcome {
        Ok(CopyOutcome::AlreadyPresent) => {
            stats.num_exists.inc(1);
            (CatalogStatus::Exists, None)
        }
        Ok(CopyOutcome::Copied(bytes)) => {
            stats.num_completed.inc(1);
            stats.bytes_copied.inc(bytes as i64);
            (CatalogStatus::Completed, None)
        }
        Err(StorageError::Cancelled) => {
            stats.num_cancelled.inc(1);
            (CatalogStatus::Pending, None)
        }
        Err(err) => {
            warn!("failed to copy {}: {err}", entry.path);
            stats.num_errors.inc(1);
            (CatalogStatus::Error, Some(err.to_string()))
        }
    };
    let moved = ctx
        .catalog
        .transition_status(entry.id, &[CatalogStatus::Copying], status, message.as_deref())
        .await?;
    if !moved {
        warn!(
            "{} changed in the catalog while being copied; not marking it {status}",
            entry.path
        );
    }
    Ok(())
}

async fn run_worker(
    ctx: Arc<CopyContext>,
    entries: Vec<CatalogEntry>,
    stats: Arc<CopyStats>,
    cancel: CancellationToken,
) -> Result<()> {
    let num_entries = entries.len();
    for entry in entries.iter() {
        if cancel.is_cancelled() {
            break;
        }
        if let Err(err) = process_entry(&ctx, entry, &stats, &cancel).await {
            // Catalog trouble: stop the whole run, the others roll back what they hold.
            cancel.cancel();
            return Err(err);
        }
    }
    trace!("worker done with {num_entries} entries");
    Ok(())
}

fn spawn_progress_reporter(stats: Arc<CopyStats>, total: usize) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REPORT_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            info!("progress: {}/{total} done; {stats}", stats.num_finished());
        }
    })
}

/// Copies every entry of `ctx.project` that needs it, using `workers` concurrent workers.
///
/// Entries left in `copying` by an interrupted run are put back to `pending` first. The
/// returned summary reports failed entries; an `Err` means the catalog itself failed.
pub async fn run_copy(
    ctx: Arc<CopyContext>,
    workers: usize,
    cancel: &CancellationToken,
) -> Result<RunSummary> {
    if workers == 0 {
        bail!("worker count must be at least 1");
    }
    let reset = ctx.catalog.reset_interrupted(&ctx.project).await?;
    if reset > 0 {
        warn!("{reset} entries left in copying by an interrupted run were reset to pending");
    }

    let entries = ctx.catalog.list_needing_copy(&ctx.project).await?;
    let total = entries.len();
    if total == 0 {
        info!("nothing to copy for `{}`", ctx.project);
        return Ok(RunSummary::default());
    }
    info!("copying {total} objects for `{}` with {workers} workers", ctx.project);

    let stats = Arc::new(CopyStats::default());
    let run_cancel = cancel.child_token();
    let mut join_set = JoinSet::new();
    for (worker_id, partition) in partition_entries(entries, workers).into_iter().enumerate() {
        join_set.spawn(
            run_worker(ctx.clone(), partition, stats.clone(), run_cancel.clone())
                .instrument(info_span!("copy_worker", worker_id)),
        );
    }

    let reporter = spawn_progress_reporter(stats.clone(), total);
    let mut first_err: Option<anyhow::Error> = None;
    while let Some(task_result) = join_set.join_next().await {
        let err = match task_result {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => err,
            Err(err) => anyhow::Error::from(err).context("copy worker panicked"),
        };
        error!("copy worker failed: {err:#}");
        run_cancel.cancel();
        first_err.get_or_insert(err);
    }
    reporter.abort();

    if let Some(err) = first_err {
        return Err(err).with_context(|| format!("Copy run for `{}` aborted", ctx.project));
    }
    let summary = RunSummary::from_stats(total, &stats);
    info!("copy run for `{}` finished: {summary}", ctx.project);
    Ok(summary)
}
