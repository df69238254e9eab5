//! Appliance-wide ETL metrics
//!
//! One [`TransitionMetrics`] exists per transition index for the life of the
//! registry and is shared by every PV's stage at that index. Counters are
//! atomic adds so concurrent stages on a wider pool never lose updates.
//! The usage estimates (approximate last global ETL time and the 7-day
//! window) sit behind a small mutex.

use crate::error::StorageError;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default lifetime of a cached usable-space reading
pub const DEFAULT_SPACE_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// Quiet period after which the approximate last global ETL time restarts
pub const USAGE_RESET_GAP_SECS: i64 = 15 * 60;

const SECS_PER_DAY: i64 = 86_400;
const WEEK_DAYS: usize = 7;

/// Milliseconds spent in each phase of a migration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PhaseTimings {
    /// Listing ready chunks
    pub list_chunks_ms: u64,
    /// Checking destination capacity
    pub check_space_ms: u64,
    /// Preparing destination partitions
    pub prepare_partition_ms: u64,
    /// Opening streams and appending
    pub append_ms: u64,
    /// Committing the pending buffer
    pub commit_ms: u64,
    /// Deleting moved sources
    pub mark_deletion_ms: u64,
    /// Destination post-processors
    pub post_processors_ms: u64,
    /// Deferred post-ETL tasks
    pub post_etl_tasks_ms: u64,
}

impl PhaseTimings {
    /// Phase names paired with their values, in execution order
    #[must_use]
    pub fn named(&self) -> [(&'static str, u64); 8] {
        [
            ("getETLStreams", self.list_chunks_ms),
            ("checkSizes", self.check_space_ms),
            ("prepareForNewPartition", self.prepare_partition_ms),
            ("appendToETLAppendData", self.append_ms),
            ("commitETLAppendData", self.commit_ms),
            ("markForDeletion", self.mark_deletion_ms),
            ("runPostProcessors", self.post_processors_ms),
            ("executePostETLTasks", self.post_etl_tasks_ms),
        ]
    }

    /// Sum over all phases
    #[inline]
    #[must_use]
    pub fn total_ms(&self) -> u64 {
        self.named().iter().map(|(_, v)| v).sum()
    }

    /// Add another set of timings into this one
    pub fn accumulate(&mut self, other: &Self) {
        self.list_chunks_ms += other.list_chunks_ms;
        self.check_space_ms += other.check_space_ms;
        self.prepare_partition_ms += other.prepare_partition_ms;
        self.append_ms += other.append_ms;
        self.commit_ms += other.commit_ms;
        self.mark_deletion_ms += other.mark_deletion_ms;
        self.post_processors_ms += other.post_processors_ms;
        self.post_etl_tasks_ms += other.post_etl_tasks_ms;
    }
}

#[derive(Debug, Default)]
struct PhaseCounters([AtomicU64; 8]);

impl PhaseCounters {
    fn add(&self, timings: &PhaseTimings) {
        for (slot, (_, ms)) in self.0.iter().zip(timings.named()) {
            slot.fetch_add(ms, Ordering::Relaxed);
        }
    }

    fn load(&self) -> PhaseTimings {
        let v: Vec<u64> = self.0.iter().map(|c| c.load(Ordering::Relaxed)).collect();
        PhaseTimings {
            list_chunks_ms: v[0],
            check_space_ms: v[1],
            prepare_partition_ms: v[2],
            append_ms: v[3],
            commit_ms: v[4],
            mark_deletion_ms: v[5],
            post_processors_ms: v[6],
            post_etl_tasks_ms: v[7],
        }
    }
}

/// Usable-space readings cached by storage root
#[derive(Debug, Clone)]
pub struct SpaceCache {
    inner: Cache<String, u64>,
}

impl Default for SpaceCache {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_SPACE_CACHE_TTL)
    }
}

impl SpaceCache {
    /// Create a cache whose readings expire after `ttl`
    #[inline]
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(1_024)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Cached reading for `root`, measuring on a miss
    ///
    /// # Errors
    /// The measurement's error when nothing is cached and measuring fails
    pub async fn usable_space<F>(&self, root: &str, measure: F) -> Result<u64, StorageError>
    where
        F: Future<Output = Result<u64, StorageError>>,
    {
        self.inner
            .try_get_with(root.to_string(), measure)
            .await
            .map_err(|e| StorageError::Capacity(e.to_string()))
    }

    /// Drop the reading for `root`
    pub async fn invalidate(&self, root: &str) {
        self.inner.invalidate(root).await;
    }
}

#[derive(Debug)]
struct UsageWindow {
    approx_last_global_ms: u64,
    last_update_secs: Option<i64>,
    weekly_ms: [Option<u64>; WEEK_DAYS],
}

impl UsageWindow {
    fn new() -> Self {
        Self {
            approx_last_global_ms: 0,
            last_update_secs: None,
            weekly_ms: [None; WEEK_DAYS],
        }
    }

    fn record(&mut self, elapsed_ms: u64, now_secs: i64) {
        // Runs of every PV at one index arrive back to back; a quiet gap
        // means the previous sweep is over and a new estimate starts.
        let quiet = self
            .last_update_secs
            .map_or(true, |last| now_secs - last > USAGE_RESET_GAP_SECS);
        if quiet {
            self.approx_last_global_ms = 0;
        }
        self.approx_last_global_ms += elapsed_ms;
        self.last_update_secs = Some(now_secs);

        let day = day_bucket(now_secs);
        self.weekly_ms[day] = Some(self.weekly_ms[day].unwrap_or(0) + elapsed_ms);
        self.weekly_ms[(day + 1) % WEEK_DAYS] = None;
    }

    #[allow(clippy::cast_precision_loss)]
    fn weekly_percent(&self, now_secs: i64) -> f64 {
        let (days, total_ms) = self
            .weekly_ms
            .iter()
            .flatten()
            .fold((0_i64, 0_u64), |(n, sum), ms| (n + 1, sum + ms));
        if days == 0 {
            return 0.0;
        }
        let window_secs = (days - 1) * SECS_PER_DAY + now_secs.rem_euclid(SECS_PER_DAY);
        if window_secs <= 0 {
            return 0.0;
        }
        (total_ms as f64 / 1_000.0) * 100.0 / window_secs as f64
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn day_bucket(now_secs: i64) -> usize {
    now_secs.div_euclid(SECS_PER_DAY).rem_euclid(WEEK_DAYS as i64) as usize
}

/// Counters shared by every stage at one transition index
#[derive(Debug)]
pub struct TransitionMetrics {
    index: usize,
    started_at: DateTime<Utc>,
    total_runs: AtomicU64,
    overall_ms: AtomicU64,
    phases: PhaseCounters,
    bytes_moved: AtomicU64,
    out_of_space_deletions: AtomicU64,
    usage: Mutex<UsageWindow>,
    space_cache: SpaceCache,
}

impl TransitionMetrics {
    /// Create counters for `index`
    #[must_use]
    pub fn new(index: usize, space_cache_ttl: Duration) -> Self {
        Self {
            index,
            started_at: Utc::now(),
            total_runs: AtomicU64::new(0),
            overall_ms: AtomicU64::new(0),
            phases: PhaseCounters::default(),
            bytes_moved: AtomicU64::new(0),
            out_of_space_deletions: AtomicU64::new(0),
            usage: Mutex::new(UsageWindow::new()),
            space_cache: SpaceCache::with_ttl(space_cache_ttl),
        }
    }

    /// Transition index
    #[inline]
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Capacity cache for destinations at this index
    #[inline]
    #[must_use]
    pub fn space_cache(&self) -> &SpaceCache {
        &self.space_cache
    }

    /// Account for one completed run
    pub fn record_run(&self, elapsed_ms: u64, phases: &PhaseTimings, bytes: u64, now: DateTime<Utc>) {
        self.total_runs.fetch_add(1, Ordering::Relaxed);
        self.overall_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
        self.phases.add(phases);
        self.bytes_moved.fetch_add(bytes, Ordering::Relaxed);
        self.usage.lock().record(elapsed_ms, now.timestamp());
    }

    /// Account for one chunk deleted because it could not be moved
    pub fn record_out_of_space(&self) {
        self.out_of_space_deletions.fetch_add(1, Ordering::Relaxed);
    }

    /// Runs recorded so far
    #[inline]
    #[must_use]
    pub fn total_runs(&self) -> u64 {
        self.total_runs.load(Ordering::Relaxed)
    }

    /// Out-of-space deletions so far
    #[inline]
    #[must_use]
    pub fn out_of_space_deletions(&self) -> u64 {
        self.out_of_space_deletions.load(Ordering::Relaxed)
    }

    /// Bytes moved so far
    #[inline]
    #[must_use]
    pub fn bytes_moved(&self) -> u64 {
        self.bytes_moved.load(Ordering::Relaxed)
    }

    /// Percentage of wall-clock time since startup spent migrating
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn etl_percentage(&self, now: DateTime<Utc>) -> f64 {
        let uptime_ms = (now - self.started_at).num_milliseconds();
        if uptime_ms <= 0 {
            return 0.0;
        }
        self.overall_ms.load(Ordering::Relaxed) as f64 * 100.0 / uptime_ms as f64
    }

    /// Point-in-time copy of every counter
    #[must_use]
    pub fn snapshot(&self, now: DateTime<Utc>) -> TransitionSnapshot {
        let (approx_last_global_etl_ms, weekly_usage_percent) = {
            let usage = self.usage.lock();
            (
                usage.approx_last_global_ms,
                usage.weekly_percent(now.timestamp()),
            )
        };
        TransitionSnapshot {
            index: self.index,
            total_runs: self.total_runs(),
            overall_ms: self.overall_ms.load(Ordering::Relaxed),
            phases: self.phases.load(),
            bytes_moved: self.bytes_moved(),
            out_of_space_deletions: self.out_of_space_deletions(),
            approx_last_global_etl_ms,
            weekly_usage_percent,
            etl_percentage: self.etl_percentage(now),
        }
    }
}

/// Copy of one index's counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionSnapshot {
    /// Transition index
    pub index: usize,
    /// Completed runs
    pub total_runs: u64,
    /// Total run time
    pub overall_ms: u64,
    /// Per-phase totals
    pub phases: PhaseTimings,
    /// Bytes moved
    pub bytes_moved: u64,
    /// Chunks deleted without being moved
    pub out_of_space_deletions: u64,
    /// Duration of the most recent sweep across PVs
    pub approx_last_global_etl_ms: u64,
    /// Share of the last week spent migrating
    pub weekly_usage_percent: f64,
    /// Share of uptime spent migrating
    pub etl_percentage: f64,
}

/// A name/value row for status pages
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricDetail {
    /// Row label
    pub name: String,
    /// Rendered value
    pub value: String,
}

impl MetricDetail {
    /// Create a row
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl ToString) -> Self {
        Self {
            name: name.into(),
            value: value.to_string(),
        }
    }
}

/// All per-index counters of an appliance
#[derive(Debug)]
pub struct EtlMetrics {
    transitions: Vec<Arc<TransitionMetrics>>,
}

impl EtlMetrics {
    /// One accumulator per transition index
    #[must_use]
    pub fn new(max_transitions: usize, space_cache_ttl: Duration) -> Self {
        Self {
            transitions: (0..max_transitions)
                .map(|i| Arc::new(TransitionMetrics::new(i, space_cache_ttl)))
                .collect(),
        }
    }

    /// Accumulator for `index`
    #[inline]
    #[must_use]
    pub fn for_index(&self, index: usize) -> Option<Arc<TransitionMetrics>> {
        self.transitions.get(index).cloned()
    }

    /// Number of indices tracked
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    /// No indices tracked
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    /// Snapshots of every index
    #[must_use]
    pub fn snapshots(&self, now: DateTime<Utc>) -> Vec<TransitionSnapshot> {
        self.transitions.iter().map(|t| t.snapshot(now)).collect()
    }

    /// Headline numbers keyed the way status pages expect
    #[must_use]
    pub fn summary(&self, now: DateTime<Utc>) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        let mut max_pct = 0.0_f64;
        for snap in self.snapshots(now) {
            out.insert(
                format!("totalETLRuns({})", snap.index),
                snap.total_runs.to_string(),
            );
            out.insert(
                format!("timeForOverallETLInSeconds({})", snap.index),
                (snap.overall_ms / 1_000).to_string(),
            );
            max_pct = max_pct.max(snap.etl_percentage);
        }
        out.insert("maxETLPercentage".to_string(), format!("{max_pct:.0}"));
        out
    }

    /// Detailed rows per index
    #[must_use]
    pub fn details(&self, now: DateTime<Utc>) -> Vec<MetricDetail> {
        let mut rows = Vec::new();
        for snap in self.snapshots(now) {
            let i = snap.index;
            if snap.total_runs == 0 {
                rows.push(MetricDetail::new(format!("Startup ETL({i})"), "In progress"));
                continue;
            }
            rows.push(MetricDetail::new(
                format!("Avg time spent by ETL({i}) (s/run)"),
                format!("{:.2}", per_run_secs(snap.overall_ms, snap.total_runs)),
            ));
            rows.push(MetricDetail::new(
                format!("Percentage of time spent by ETL({i})"),
                format!("{:.2}", snap.etl_percentage),
            ));
            rows.push(MetricDetail::new(
                format!("Approx time taken by last job ETL({i}) (s)"),
                format!("{:.2}", ms_to_secs(snap.approx_last_global_etl_ms)),
            ));
            rows.push(MetricDetail::new(
                format!("Estimated weekly usage ETL({i}) (%)"),
                format!("{:.2}", snap.weekly_usage_percent),
            ));
            for (phase, ms) in snap.phases.named() {
                rows.push(MetricDetail::new(
                    format!("Avg time spent in {phase} ETL({i}) (s/run)"),
                    format!("{:.2}", per_run_secs(ms, snap.total_runs)),
                ));
            }
            rows.push(MetricDetail::new(
                format!("Chunks deleted out of space ETL({i})"),
                snap.out_of_space_deletions,
            ));
            rows.push(MetricDetail::new(
                format!("Bytes moved ETL({i})"),
                format_bytes(snap.bytes_moved),
            ));
        }
        rows
    }
}

#[allow(clippy::cast_precision_loss)]
fn ms_to_secs(ms: u64) -> f64 {
    ms as f64 / 1_000.0
}

#[allow(clippy::cast_precision_loss)]
fn per_run_secs(ms: u64, runs: u64) -> f64 {
    if runs == 0 {
        0.0
    } else {
        ms_to_secs(ms) / runs as f64
    }
}

/// Render a byte count with a binary unit
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [(&str, u64); 3] = [("GB", 1 << 30), ("MB", 1 << 20), ("KB", 1 << 10)];
    for (unit, size) in UNITS {
        if bytes >= size {
            #[allow(clippy::cast_precision_loss)]
            let scaled = bytes as f64 / size as f64;
            return format!("{scaled:.2} {unit}");
        }
    }
    format!("{bytes} B")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at_secs(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn record_run_accumulates() {
        let metrics = TransitionMetrics::new(0, DEFAULT_SPACE_CACHE_TTL);
        let phases = PhaseTimings {
            append_ms: 40,
            commit_ms: 10,
            ..PhaseTimings::default()
        };
        metrics.record_run(60, &phases, 1_024, at_secs(1_000_000));
        metrics.record_run(60, &phases, 1_024, at_secs(1_000_010));
        metrics.record_out_of_space();

        let snap = metrics.snapshot(at_secs(1_000_020));
        assert_eq!(snap.total_runs, 2);
        assert_eq!(snap.overall_ms, 120);
        assert_eq!(snap.phases.append_ms, 80);
        assert_eq!(snap.phases.total_ms(), 100);
        assert_eq!(snap.bytes_moved, 2_048);
        assert_eq!(snap.out_of_space_deletions, 1);
        assert_eq!(snap.approx_last_global_etl_ms, 120);
    }

    #[test]
    fn last_global_estimate_restarts_after_quiet_gap() {
        let mut window = UsageWindow::new();
        window.record(500, 10_000);
        window.record(700, 10_100);
        assert_eq!(window.approx_last_global_ms, 1_200);
        window.record(300, 10_100 + USAGE_RESET_GAP_SECS + 1);
        assert_eq!(window.approx_last_global_ms, 300);
    }

    #[test]
    fn weekly_window_clears_following_day() {
        let mut window = UsageWindow::new();
        let day = SECS_PER_DAY;
        window.record(1_000, 3 * day);
        let bucket = day_bucket(3 * day);
        assert_eq!(window.weekly_ms[bucket], Some(1_000));
        assert_eq!(window.weekly_ms[(bucket + 1) % WEEK_DAYS], None);

        // Half a day into the first bucket: 1s over 43200s.
        let pct = window.weekly_percent(3 * day + day / 2);
        assert!((pct - 100.0 / 43_200.0).abs() < 1e-9);
    }

    #[test]
    fn summary_and_details_rows() {
        let metrics = EtlMetrics::new(2, DEFAULT_SPACE_CACHE_TTL);
        metrics
            .for_index(0)
            .unwrap()
            .record_run(2_000, &PhaseTimings::default(), 3 << 20, Utc::now());
        let summary = metrics.summary(Utc::now());
        assert_eq!(summary["totalETLRuns(0)"], "1");
        assert_eq!(summary["totalETLRuns(1)"], "0");
        assert_eq!(summary["timeForOverallETLInSeconds(0)"], "2");

        let details = metrics.details(Utc::now());
        assert!(details
            .iter()
            .any(|d| d.name == "Startup ETL(1)" && d.value == "In progress"));
        assert!(details
            .iter()
            .any(|d| d.name == "Bytes moved ETL(0)" && d.value == "3.00 MB"));
    }

    #[test]
    fn byte_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2_048), "2.00 KB");
        assert_eq!(format_bytes(5 << 30), "5.00 GB");
    }

    #[tokio::test]
    async fn space_cache_measures_once_per_root() {
        let cache = SpaceCache::default();
        let first = cache.usable_space("/sts", async { Ok(10) }).await.unwrap();
        let second = cache.usable_space("/sts", async { Ok(99) }).await.unwrap();
        assert_eq!((first, second), (10, 10));

        let failed = cache
            .usable_space("/mts", async { Err(StorageError::Capacity("df".into())) })
            .await;
        assert!(failed.is_err());

        cache.invalidate("/sts").await;
        assert_eq!(
            cache.usable_space("/sts", async { Ok(99) }).await.unwrap(),
            99
        );
    }
}
