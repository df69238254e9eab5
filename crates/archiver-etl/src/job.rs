//! Migration job: one transition, one PV, one logical time
//!
//! Per run:
//! 1. list the chunks the source considers ready as of the logical time
//! 2. for each chunk in source order, check destination space, then open,
//!    prepare a partition and append into this run's pending buffer
//! 3. commit the pending buffer once
//! 4. delete what was committed, plus whatever policy gave up on
//! 5. run destination post-processors, then deferred post-ETL tasks
//! 6. account timings and bytes on the stage and the shared accumulator
//!
//! A chunk that fails to move, for lack of space or an I/O error, goes
//! through the stage's resolved policy: DELETE flags it and moves on, SKIP
//! stops the run there so later chunks stay in order for the next firing.
//! Nothing escapes [`MigrationJob::run`]; failures and panics are logged
//! and recorded on the stage.

use crate::error::{EtlError, StorageError};
use crate::metrics::PhaseTimings;
use crate::policy::{FailureAction, ResolvedPolicy};
use crate::stage::EtlStage;
use crate::storage::{ChunkDescriptor, EtlContext, EtlDest};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Space that must stay free on a destination beyond the chunk itself
pub const FREE_SPACE_MARGIN_BYTES: u64 = 1024 * 1024;

/// What one run did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobReport {
    /// Chunks the source reported ready
    pub chunks_listed: usize,
    /// Chunks appended and committed
    pub chunks_moved: usize,
    /// Chunks flagged for deletion without being moved
    pub chunks_given_up: usize,
    /// Chunks the source confirmed deleting
    pub chunks_deleted: usize,
    /// Bytes of the committed chunks
    pub bytes_moved: u64,
    /// The pending buffer was committed
    pub committed: bool,
    /// Policy stopped the run before the last chunk
    pub stopped_early: bool,
    /// Time per phase
    pub phases: PhaseTimings,
}

/// Result of invoking a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Another run of the same stage was in progress; nothing was done
    AlreadyRunning,
    /// The source had nothing ready; nothing was written or counted
    NothingReady,
    /// The run went through
    Completed(JobReport),
    /// The run failed; the message is also recorded on the stage
    Failed(String),
}

impl JobOutcome {
    /// Report of a completed run
    #[inline]
    #[must_use]
    pub fn report(&self) -> Option<&JobReport> {
        match self {
            Self::Completed(report) => Some(report),
            _ => None,
        }
    }

    /// The run failed
    #[inline]
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Moved,
    GivenUp,
}

/// One invocation of a stage's migration
#[derive(Debug, Clone)]
pub struct MigrationJob {
    stage: Arc<EtlStage>,
    as_of: Option<DateTime<Utc>>,
}

impl MigrationJob {
    /// Job for a scheduled firing; processes as of now minus the stage's padding
    #[inline]
    #[must_use]
    pub fn scheduled(stage: Arc<EtlStage>) -> Self {
        Self { stage, as_of: None }
    }

    /// Job that processes as if the time were `at`
    #[inline]
    #[must_use]
    pub fn as_if_at(stage: Arc<EtlStage>, at: DateTime<Utc>) -> Self {
        Self {
            stage,
            as_of: Some(at),
        }
    }

    /// Stage this job runs for
    #[inline]
    #[must_use]
    pub fn stage(&self) -> &Arc<EtlStage> {
        &self.stage
    }

    /// Run the migration; never fails outward
    pub async fn run(&self) -> JobOutcome {
        let stage = &self.stage;
        let now = Utc::now();
        let Some(_guard) = stage.try_begin(now) else {
            error!(
                pv = %stage.pv_name(),
                index = stage.index(),
                "etl for this stage is already running; not starting another"
            );
            return JobOutcome::AlreadyRunning;
        };
        let as_of = self.as_of.unwrap_or_else(|| stage.scheduled_as_of(now));

        let failure = match AssertUnwindSafe(self.migrate(as_of)).catch_unwind().await {
            Ok(Ok(outcome)) => return outcome,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
        };
        error!(
            pv = %stage.pv_name(),
            index = stage.index(),
            "etl run failed: {}",
            failure
        );
        stage.record_failure(failure.clone(), Utc::now());
        JobOutcome::Failed(failure)
    }

    async fn migrate(&self, as_of: DateTime<Utc>) -> Result<JobOutcome, EtlError> {
        let stage = &self.stage;
        let pv = stage.pv_name();
        let source = stage.source();
        let dest = stage.dest();
        let ctx = EtlContext::with_gating(Arc::clone(stage.gating()));
        let started = Instant::now();
        let mut phases = PhaseTimings::default();

        let t = Instant::now();
        let chunks = source.list_ready_chunks(pv, as_of, &ctx).await?;
        phases.list_chunks_ms = elapsed_ms(t);
        if chunks.is_empty() {
            debug!(pv, index = stage.index(), %as_of, "no chunks ready");
            return Ok(JobOutcome::NothingReady);
        }
        debug!(
            pv,
            index = stage.index(),
            chunks = chunks.len(),
            from = %source.name(),
            to = %dest.name(),
            "migrating"
        );

        let mut report = JobReport {
            chunks_listed: chunks.len(),
            ..JobReport::default()
        };
        let mut handled: Vec<(ChunkDescriptor, Disposition)> = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let t = Instant::now();
            let space = self.check_space(dest.as_ref(), &chunk).await;
            phases.check_space_ms += elapsed_ms(t);

            let transferred = match space {
                Ok(()) => self
                    .transfer(dest.as_ref(), &chunk, &ctx, &mut phases)
                    .await
                    .map_err(|e| format!("moving {} failed: {e}", chunk.key)),
                Err(reason) => Err(reason),
            };
            let reason = match transferred {
                Ok(appended) => {
                    if !appended {
                        debug!(pv, key = %chunk.key, "destination appended no samples");
                    }
                    handled.push((chunk, Disposition::Moved));
                    continue;
                }
                Err(reason) => reason,
            };

            match self.on_chunk_failure(&chunk, &reason) {
                FailureAction::DeleteAndContinue => handled.push((chunk, Disposition::GivenUp)),
                FailureAction::StopRun => {
                    report.stopped_early = true;
                    break;
                }
            }
        }

        let any_moved = handled.iter().any(|(_, d)| *d == Disposition::Moved);
        if any_moved {
            let t = Instant::now();
            let result = dest.commit(pv, &ctx).await;
            phases.commit_ms = elapsed_ms(t);
            report.committed = match result {
                Ok(true) => true,
                Ok(false) => {
                    error!(pv, dest = %dest.name(), "commit reported failure; keeping sources");
                    false
                }
                Err(e) => {
                    error!(pv, dest = %dest.name(), "commit failed; keeping sources: {}", e);
                    false
                }
            };
        }

        let mut deletions = Vec::with_capacity(handled.len());
        for (chunk, disposition) in handled {
            match disposition {
                Disposition::Moved if report.committed => {
                    report.chunks_moved += 1;
                    report.bytes_moved += chunk.size_bytes;
                    deletions.push(chunk);
                }
                Disposition::Moved => {}
                Disposition::GivenUp => {
                    report.chunks_given_up += 1;
                    deletions.push(chunk);
                }
            }
        }

        let mut deletion_failure = None;
        if !deletions.is_empty() {
            let t = Instant::now();
            match source.mark_for_deletion(&deletions, &ctx).await {
                Ok(()) => report.chunks_deleted = deletions.len(),
                Err(e) => {
                    error!(pv, source = %source.name(), "deleting migrated chunks failed: {}", e);
                    deletion_failure = Some(format!("deleting from {} failed: {e}", source.name()));
                }
            }
            phases.mark_deletion_ms = elapsed_ms(t);
        }

        let t = Instant::now();
        if let Err(e) = dest
            .run_post_processors(pv, stage.value_type(), &ctx)
            .await
        {
            error!(pv, dest = %dest.name(), "post processors failed: {}", e);
        }
        phases.post_processors_ms = elapsed_ms(t);

        let t = Instant::now();
        ctx.execute_post_etl_tasks();
        phases.post_etl_tasks_ms = elapsed_ms(t);

        report.phases = phases;
        stage.record_run(Utc::now(), elapsed_ms(started), &phases, report.bytes_moved);
        if let Some(message) = deletion_failure {
            stage.record_failure(message, Utc::now());
        }
        info!(
            pv,
            index = stage.index(),
            moved = report.chunks_moved,
            given_up = report.chunks_given_up,
            bytes = report.bytes_moved,
            "etl run complete"
        );
        Ok(JobOutcome::Completed(report))
    }

    /// `Err` carries the reason the chunk must not be written
    async fn check_space(&self, dest: &dyn EtlDest, chunk: &ChunkDescriptor) -> Result<(), String> {
        if chunk.size_bytes == 0 {
            return Ok(());
        }
        let Some(capacity) = dest.storage_metrics() else {
            return Ok(());
        };
        let needed = chunk.size_bytes.saturating_add(FREE_SPACE_MARGIN_BYTES);
        match capacity.usable_space(self.stage.metrics().space_cache()).await {
            Ok(free) if free >= needed => Ok(()),
            Ok(free) => Err(format!(
                "{} needs {needed} bytes but {} has {free} free",
                chunk.key,
                dest.name()
            )),
            Err(e) => {
                warn!(dest = %dest.name(), "cannot determine free space; writing anyway: {}", e);
                Ok(())
            }
        }
    }

    async fn transfer(
        &self,
        dest: &dyn EtlDest,
        chunk: &ChunkDescriptor,
        ctx: &EtlContext,
        phases: &mut PhaseTimings,
    ) -> Result<bool, StorageError> {
        let pv = self.stage.pv_name();
        let t = Instant::now();
        let stream = chunk.open().await?;
        phases.append_ms += elapsed_ms(t);

        let t = Instant::now();
        dest.prepare_new_partition(pv, &chunk.first_event, self.stage.value_type(), ctx)
            .await?;
        phases.prepare_partition_ms += elapsed_ms(t);

        let t = Instant::now();
        let appended = dest.append_data(pv, stream, ctx).await;
        phases.append_ms += elapsed_ms(t);
        appended
    }

    fn on_chunk_failure(&self, chunk: &ChunkDescriptor, reason: &str) -> FailureAction {
        let stage = &self.stage;
        let policy = stage.effective_policy();
        match policy {
            ResolvedPolicy::Delete => {
                error!(
                    pv = %stage.pv_name(),
                    index = stage.index(),
                    key = %chunk.key,
                    "{}; deleting source chunk without moving it",
                    reason
                );
                stage.record_out_of_space();
            }
            ResolvedPolicy::Skip => {
                warn!(
                    pv = %stage.pv_name(),
                    index = stage.index(),
                    key = %chunk.key,
                    "{}; leaving it and later chunks for the next run",
                    reason
                );
            }
        }
        policy.on_failure()
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
