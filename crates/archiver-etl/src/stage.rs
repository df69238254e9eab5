//! One (PV, transition index) pair
//!
//! A stage owns the source and destination handles for its transition, its
//! cadence and next expected start, per-stage counters, the last recorded
//! failure and the single-flight guard that keeps two runs of the same
//! stage from overlapping.

use crate::gating::GatingState;
use crate::granularity::PartitionGranularity;
use crate::metrics::{format_bytes, MetricDetail, PhaseTimings, TransitionMetrics};
use crate::policy::{OutOfSpacePolicy, ResolvedPolicy};
use crate::storage::{EtlDest, EtlSource};
use crate::types::ValueType;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Longest interval between two runs of a stage
pub const MAX_CADENCE_SECS: u64 = 8 * 60 * 60;

/// Slack added after the aligned boundary for a stage's first run
pub const FIRST_RUN_BUFFER_SECS: i64 = 5 * 60;

/// Cadence a source granularity asks for on its own
#[inline]
#[must_use]
pub fn base_cadence_secs(granularity: PartitionGranularity) -> u64 {
    granularity.approx_seconds_per_chunk().min(MAX_CADENCE_SECS)
}

/// First cadence-aligned boundary after `now`, plus the buffer
#[must_use]
pub fn aligned_first_run(now: DateTime<Utc>, cadence_secs: u64) -> DateTime<Utc> {
    let cadence = i64::try_from(cadence_secs.max(1)).unwrap_or(i64::MAX);
    let boundary = (now.timestamp().saturating_add(cadence) / cadence).saturating_mul(cadence);
    DateTime::from_timestamp(boundary.saturating_add(FIRST_RUN_BUFFER_SECS), 0).unwrap_or(now)
}

/// Counters kept per stage
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageStats {
    /// Completed runs
    pub runs: u64,
    /// Sum of run durations
    pub total_ms: u64,
    /// Duration of the last run
    pub last_run_ms: u64,
    /// When the last run completed
    pub last_completed: Option<DateTime<Utc>>,
    /// Per-phase totals
    pub phases: PhaseTimings,
    /// Bytes moved
    pub bytes_moved: u64,
    /// Chunks deleted without being moved
    pub out_of_space_deletions: u64,
}

impl StageStats {
    /// Average run duration
    #[must_use]
    pub fn average_ms(&self) -> u64 {
        self.total_ms.checked_div(self.runs).unwrap_or(0)
    }
}

/// Failure recorded by the most recent run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastFailure {
    /// When it was recorded
    pub at: DateTime<Utc>,
    /// What went wrong
    pub message: String,
}

/// Persistent state of one transition for one PV
pub struct EtlStage {
    pv_name: String,
    index: usize,
    value_type: ValueType,
    source: RwLock<Arc<dyn EtlSource>>,
    dest: RwLock<Arc<dyn EtlDest>>,
    policy: ResolvedPolicy,
    cadence_secs: AtomicU64,
    next_start: Mutex<DateTime<Utc>>,
    running: AtomicBool,
    run_started: Mutex<Option<DateTime<Utc>>>,
    stats: Mutex<StageStats>,
    last_failure: Mutex<Option<LastFailure>>,
    metrics: Arc<TransitionMetrics>,
    gating: Arc<GatingState>,
}

impl std::fmt::Debug for EtlStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtlStage")
            .field("pv_name", &self.pv_name)
            .field("index", &self.index)
            .field("source", &self.source_name())
            .field("dest", &self.dest_name())
            .field("policy", &self.policy)
            .field("cadence_secs", &self.cadence_secs())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl EtlStage {
    /// Create a stage; the policy is resolved for `index` here, once
    #[must_use]
    pub fn new(
        pv_name: impl Into<String>,
        index: usize,
        value_type: ValueType,
        source: Arc<dyn EtlSource>,
        dest: Arc<dyn EtlDest>,
        policy: OutOfSpacePolicy,
        metrics: Arc<TransitionMetrics>,
    ) -> Self {
        let now = Utc::now();
        let cadence = base_cadence_secs(source.partition_granularity());
        Self {
            pv_name: pv_name.into(),
            index,
            value_type,
            source: RwLock::new(source),
            dest: RwLock::new(dest),
            policy: policy.resolve(index),
            cadence_secs: AtomicU64::new(cadence),
            next_start: Mutex::new(aligned_first_run(now, cadence)),
            running: AtomicBool::new(false),
            run_started: Mutex::new(None),
            stats: Mutex::new(StageStats::default()),
            last_failure: Mutex::new(None),
            metrics,
            gating: Arc::new(GatingState::default()),
        }
    }

    /// Share an appliance-wide gating state instead of a private one
    #[must_use]
    pub fn with_gating(mut self, gating: Arc<GatingState>) -> Self {
        self.gating = gating;
        self
    }

    /// Gating state handed to every run's context
    #[inline]
    #[must_use]
    pub fn gating(&self) -> &Arc<GatingState> {
        &self.gating
    }

    /// PV name
    #[inline]
    #[must_use]
    pub fn pv_name(&self) -> &str {
        &self.pv_name
    }

    /// Transition index
    #[inline]
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Value type handed to destinations
    #[inline]
    #[must_use]
    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Current source handle
    #[must_use]
    pub fn source(&self) -> Arc<dyn EtlSource> {
        Arc::clone(&self.source.read())
    }

    /// Current destination handle
    #[must_use]
    pub fn dest(&self) -> Arc<dyn EtlDest> {
        Arc::clone(&self.dest.read())
    }

    /// Swap the source; takes effect at the next run
    pub fn set_source(&self, source: Arc<dyn EtlSource>) {
        *self.source.write() = source;
    }

    /// Swap the destination; takes effect at the next run
    pub fn set_dest(&self, dest: Arc<dyn EtlDest>) {
        *self.dest.write() = dest;
    }

    /// Source tier name
    #[must_use]
    pub fn source_name(&self) -> String {
        self.source.read().name().to_string()
    }

    /// Destination tier name
    #[must_use]
    pub fn dest_name(&self) -> String {
        self.dest.read().name().to_string()
    }

    /// Policy resolved for this index
    #[inline]
    #[must_use]
    pub fn effective_policy(&self) -> ResolvedPolicy {
        self.policy
    }

    /// Shared accumulator for this index
    #[inline]
    #[must_use]
    pub fn metrics(&self) -> &Arc<TransitionMetrics> {
        &self.metrics
    }

    /// Seconds between runs
    #[inline]
    #[must_use]
    pub fn cadence_secs(&self) -> u64 {
        self.cadence_secs.load(Ordering::Relaxed)
    }

    /// Seconds between runs
    #[inline]
    #[must_use]
    pub fn cadence(&self) -> Duration {
        Duration::from_secs(self.cadence_secs())
    }

    /// Change cadence and realign the next start
    pub fn set_cadence(&self, cadence_secs: u64, now: DateTime<Utc>) {
        self.cadence_secs.store(cadence_secs, Ordering::Relaxed);
        *self.next_start.lock() = aligned_first_run(now, cadence_secs);
    }

    /// When the next run is expected
    #[must_use]
    pub fn next_start(&self) -> DateTime<Utc> {
        *self.next_start.lock()
    }

    /// Delay from `now` until the next expected start
    #[must_use]
    pub fn initial_delay(&self, now: DateTime<Utc>) -> Duration {
        (self.next_start() - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Lag applied to scheduled runs so the upstream tier can finish its
    /// partition: a tenth of a source chunk
    #[must_use]
    pub fn processing_padding(&self) -> Duration {
        let chunk = self.source.read().partition_granularity().approx_seconds_per_chunk();
        Duration::from_secs((chunk + 5) / 10)
    }

    /// Logical time a scheduled run at `now` processes as of
    #[must_use]
    pub fn scheduled_as_of(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.processing_padding())
            .map_or(now, |pad| now - pad)
    }

    /// A run is in progress
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// When the in-progress run started
    #[must_use]
    pub fn run_started(&self) -> Option<DateTime<Utc>> {
        *self.run_started.lock()
    }

    /// Claim the stage for a run
    ///
    /// `None` if another run holds it. The claim is released when the guard
    /// drops, whatever way the run ends.
    #[must_use]
    pub fn try_begin(&self, now: DateTime<Utc>) -> Option<RunGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        *self.run_started.lock() = Some(now);
        *self.last_failure.lock() = None;
        let cadence = i64::try_from(self.cadence_secs()).unwrap_or(i64::MAX);
        *self.next_start.lock() = now + chrono::Duration::seconds(cadence);
        Some(RunGuard { stage: self })
    }

    /// Account for a completed run on the stage and the shared accumulator
    pub fn record_run(
        &self,
        completed: DateTime<Utc>,
        elapsed_ms: u64,
        phases: &PhaseTimings,
        bytes: u64,
    ) {
        {
            let mut stats = self.stats.lock();
            stats.runs += 1;
            stats.total_ms += elapsed_ms;
            stats.last_run_ms = elapsed_ms;
            stats.last_completed = Some(completed);
            stats.phases.accumulate(phases);
            stats.bytes_moved += bytes;
        }
        self.metrics.record_run(elapsed_ms, phases, bytes, completed);
    }

    /// Account for a chunk deleted without being moved
    pub fn record_out_of_space(&self) {
        self.stats.lock().out_of_space_deletions += 1;
        self.metrics.record_out_of_space();
    }

    /// Remember a failure
    pub fn record_failure(&self, message: impl Into<String>, at: DateTime<Utc>) {
        *self.last_failure.lock() = Some(LastFailure {
            at,
            message: message.into(),
        });
    }

    /// Failure of the most recent run, if it had one
    #[must_use]
    pub fn last_failure(&self) -> Option<LastFailure> {
        self.last_failure.lock().clone()
    }

    /// Copy of the counters
    #[must_use]
    pub fn stats(&self) -> StageStats {
        self.stats.lock().clone()
    }

    /// Status rows for this stage
    #[must_use]
    pub fn details(&self) -> Vec<MetricDetail> {
        let source = self.source();
        let dest = self.dest();
        let name = format!("{} ({} \u{bb} {})", self.index, source.name(), dest.name());
        let stats = self.stats();
        let mut rows = vec![
            MetricDetail::new(format!("{name} partition"), format!(
                "{} \u{bb} {}",
                source.partition_granularity(),
                dest.partition_granularity()
            )),
            MetricDetail::new(format!("{name} cadence (s)"), self.cadence_secs()),
            MetricDetail::new(
                format!("{name} last completed"),
                stats
                    .last_completed
                    .map_or_else(|| "Not yet".to_string(), |t| t.to_rfc3339()),
            ),
            MetricDetail::new(format!("{name} last job took (ms)"), stats.last_run_ms),
            MetricDetail::new(format!("{name} next job starts"), self.next_start().to_rfc3339()),
            MetricDetail::new(format!("{name} total time (ms)"), stats.total_ms),
            MetricDetail::new(format!("{name} average time (ms)"), stats.average_ms()),
            MetricDetail::new(format!("{name} times run"), stats.runs),
            MetricDetail::new(
                format!("{name} out of space chunks deleted"),
                stats.out_of_space_deletions,
            ),
            MetricDetail::new(format!("{name} bytes moved"), format_bytes(stats.bytes_moved)),
        ];
        for (phase, ms) in stats.phases.named() {
            rows.push(MetricDetail::new(format!("{name} {phase} (ms)"), ms));
        }
        if let Some(started) = self.run_started() {
            rows.push(MetricDetail::new(
                format!("{name} running since"),
                started.to_rfc3339(),
            ));
        }
        if let Some(failure) = self.last_failure() {
            rows.push(MetricDetail::new(
                format!("{name} last failure"),
                format!("{}: {}", failure.at.to_rfc3339(), failure.message),
            ));
        }
        rows
    }
}

/// Claim on a stage for the duration of one run
#[derive(Debug)]
pub struct RunGuard<'a> {
    stage: &'a EtlStage,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        *self.stage.run_started.lock() = None;
        self.stage.running.store(false, Ordering::Release);
    }
}
