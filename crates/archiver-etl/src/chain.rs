//! Ordered stages of one PV
//!
//! A trigger runs the stages strictly one after another; stage k+1 starts
//! only once stage k's run for the same trigger has returned. This holds for
//! scheduled firings and for "as if at" runs alike, since the chain, not the
//! stage, owns the recurring schedule. Progress is visible as a
//! [`ChainRunState`]. Cancelling a chain stops its schedule and, for sources
//! that ask for it, spawns one last run far in the future so everything left
//! in them is treated as ready.

use crate::error::StorageError;
use crate::job::{JobOutcome, MigrationJob};
use crate::metrics::MetricDetail;
use crate::pool::WorkerPool;
use crate::schedule::ScheduleHandle;
use crate::stage::{base_cadence_secs, EtlStage, LastFailure, MAX_CADENCE_SECS};
use crate::types::Event;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How far ahead a consolidation run pretends to be
pub const CONSOLIDATION_HORIZON_DAYS: i64 = 365;

/// Slack added to a chain's earliest stage delay
pub const CHAIN_START_SLACK: Duration = Duration::from_secs(10);

/// Delay reported for a chain without stages
pub const EMPTY_CHAIN_DELAY: Duration = Duration::from_secs(10 * 365 * 86_400);

/// Where a chain is in its current trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChainRunState {
    /// Never triggered
    Idle,
    /// Running stage `k`
    RunningStage(usize),
    /// Last trigger ran every stage without a failure
    Done,
    /// Last trigger recorded a failure; `stage` is the first that failed
    Failed {
        /// Index of the first failing stage
        stage: usize,
    },
}

/// Result of one trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainRun {
    /// Final state
    pub state: ChainRunState,
    /// Outcome per stage, in order
    pub outcomes: Vec<JobOutcome>,
}

/// All stages of one PV
pub struct StageChain {
    pv_name: String,
    stages: Vec<Arc<EtlStage>>,
    pools: Vec<Arc<WorkerPool>>,
    state: Mutex<ChainRunState>,
    trigger: tokio::sync::Mutex<()>,
    schedule: Mutex<Option<ScheduleHandle>>,
}

impl std::fmt::Debug for StageChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageChain")
            .field("pv_name", &self.pv_name)
            .field("stages", &self.stages.len())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl StageChain {
    /// Empty chain; stage `k` will run on `pools[k]`, or inline without one
    #[must_use]
    pub fn new(pv_name: impl Into<String>, pools: Vec<Arc<WorkerPool>>) -> Self {
        Self {
            pv_name: pv_name.into(),
            stages: Vec::new(),
            pools,
            state: Mutex::new(ChainRunState::Idle),
            trigger: tokio::sync::Mutex::new(()),
            schedule: Mutex::new(None),
        }
    }

    /// Append the next stage
    ///
    /// Its cadence is its source's own, raised to the slowest earlier stage
    /// so a downstream stage never outpaces its upstream.
    pub fn push_stage(&mut self, stage: EtlStage, now: DateTime<Utc>) -> Arc<EtlStage> {
        let own = base_cadence_secs(stage.source().partition_granularity());
        let floor = self
            .stages
            .iter()
            .map(|s| s.cadence_secs())
            .max()
            .unwrap_or(0);
        stage.set_cadence(own.max(floor), now);
        let stage = Arc::new(stage);
        self.stages.push(Arc::clone(&stage));
        stage
    }

    /// PV name
    #[inline]
    #[must_use]
    pub fn pv_name(&self) -> &str {
        &self.pv_name
    }

    /// Stages in order
    #[inline]
    #[must_use]
    pub fn stages(&self) -> &[Arc<EtlStage>] {
        &self.stages
    }

    /// Stage at `index`
    #[inline]
    #[must_use]
    pub fn stage(&self, index: usize) -> Option<&Arc<EtlStage>> {
        self.stages.get(index)
    }

    /// Current run state
    #[must_use]
    pub fn state(&self) -> ChainRunState {
        *self.state.lock()
    }

    /// Delay until the chain as a whole is due
    #[must_use]
    pub fn initial_delay(&self, now: DateTime<Utc>) -> Duration {
        self.stages
            .iter()
            .map(|s| s.initial_delay(now))
            .min()
            .map_or(EMPTY_CHAIN_DELAY, |d| d + CHAIN_START_SLACK)
    }

    /// Interval between scheduled firings: the fastest stage's cadence
    #[must_use]
    pub fn cadence(&self) -> Duration {
        let secs = self
            .stages
            .iter()
            .map(|s| s.cadence_secs())
            .min()
            .unwrap_or(MAX_CADENCE_SECS);
        Duration::from_secs(secs)
    }

    /// Run every stage in order as if the time were `at`
    ///
    /// Concurrent triggers of the same chain queue behind each other. A
    /// failing stage does not stop later ones; the first failure is what
    /// the final state reports.
    pub async fn run_as_if_at(&self, at: DateTime<Utc>) -> ChainRun {
        debug!(pv = %self.pv_name, %at, "running chain as if at");
        self.run_stages(|stage| MigrationJob::as_if_at(stage, at)).await
    }

    /// Run every stage in order for a scheduled firing
    ///
    /// Each stage processes as of the firing time minus its own padding.
    pub async fn run_scheduled(&self) -> ChainRun {
        self.run_stages(MigrationJob::scheduled).await
    }

    async fn run_stages<F>(&self, job_for: F) -> ChainRun
    where
        F: Fn(Arc<EtlStage>) -> MigrationJob,
    {
        let _trigger = self.trigger.lock().await;
        let mut outcomes = Vec::with_capacity(self.stages.len());
        let mut first_failure = None;

        for (k, stage) in self.stages.iter().enumerate() {
            *self.state.lock() = ChainRunState::RunningStage(k);
            debug!(pv = %self.pv_name, stage = k, "running stage");
            let job = job_for(Arc::clone(stage));
            let outcome = match self.pools.get(k) {
                Some(pool) => pool.run(job.run()).await,
                None => job.run().await,
            };
            if outcome.is_failed() && first_failure.is_none() {
                first_failure = Some(k);
            }
            outcomes.push(outcome);
        }

        let state = first_failure.map_or(ChainRunState::Done, |stage| ChainRunState::Failed {
            stage,
        });
        *self.state.lock() = state;
        ChainRun { state, outcomes }
    }

    /// Attach the recurring schedule, cancelling any previous one
    pub fn set_schedule(&self, handle: ScheduleHandle) {
        if let Some(old) = self.schedule.lock().replace(handle) {
            old.cancel();
        }
    }

    /// A schedule is attached
    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        self.schedule.lock().is_some()
    }

    /// When the next scheduled firing is due, if one is pending
    #[must_use]
    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.schedule.lock().as_ref().and_then(ScheduleHandle::next_fire)
    }

    /// Stop the schedule; a firing already in flight finishes its stages
    pub fn cancel_schedule(&self) -> bool {
        match self.schedule.lock().take() {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop scheduling and start consolidation where sources want it
    ///
    /// Returns the consolidation task, if one was spawned. Shutdown does
    /// not wait for it.
    pub fn cancel(&self, now: DateTime<Utc>) -> Option<JoinHandle<()>> {
        self.cancel_schedule();

        let pending: Vec<Arc<EtlStage>> = self
            .stages
            .iter()
            .filter(|s| s.source().consolidate_on_shutdown())
            .cloned()
            .collect();
        if pending.is_empty() {
            return None;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(pv = %self.pv_name, "no runtime available; skipping consolidation");
            return None;
        };

        let at = now + ChronoDuration::days(CONSOLIDATION_HORIZON_DAYS);
        let pv = self.pv_name.clone();
        info!(pv = %pv, stages = pending.len(), "scheduling consolidation");
        Some(runtime.spawn(async move {
            for stage in pending {
                if let JobOutcome::Failed(message) = MigrationJob::as_if_at(stage, at).run().await {
                    error!(pv = %pv, "consolidation failed: {}", message);
                }
            }
        }))
    }

    /// Most recent sample found scanning destinations in chain order
    ///
    /// # Errors
    /// The first destination error encountered
    pub async fn latest_event(&self) -> Result<Option<Event>, StorageError> {
        for stage in &self.stages {
            if let Some(event) = stage.dest().last_known_event(&self.pv_name).await? {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    /// First failure recorded on any stage
    #[must_use]
    pub fn last_failure(&self) -> Option<(usize, LastFailure)> {
        self.stages
            .iter()
            .find_map(|s| s.last_failure().map(|f| (s.index(), f)))
    }

    /// Status rows for every stage
    #[must_use]
    pub fn details(&self) -> Vec<MetricDetail> {
        self.stages.iter().flat_map(|s| s.details()).collect()
    }
}
