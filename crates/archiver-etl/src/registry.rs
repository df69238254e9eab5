//! Registry and scheduler
//!
//! The registry owns one worker pool and one metrics accumulator per
//! transition index, plus a discovery poller that picks up newly owned,
//! unpaused PVs. For each PV it builds a [`StageChain`] from the PV's
//! ordered storage endpoints and schedules the chain as one fixed-delay
//! task. Each firing runs the stages in order, stage k on the pool for
//! index k, so a downstream stage never runs while its upstream stage is
//! still migrating for the same firing.
//!
//! Registering a chain, switching to manual control and shutting down are
//! serialized, so a chain is never left scheduled once either mode is on.
//!
//! In manual-control mode nothing is scheduled and pools are closed, so
//! tests and operators drive migrations synchronously with
//! [`EtlRegistry::run_etls`].

use crate::chain::{ChainRun, ChainRunState, StageChain};
use crate::config::{ConfigService, EtlConfig};
use crate::error::{ConfigError, EtlError};
use crate::gating::GatingState;
use crate::job::JobOutcome;
use crate::metrics::{EtlMetrics, MetricDetail, TransitionMetrics};
use crate::pool::WorkerPool;
use crate::schedule::{spawn_fixed_delay, ScheduleHandle};
use crate::stage::EtlStage;
use crate::storage::TierResolver;
use crate::types::{Event, PvChange, PvTypeInfo};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How a chain's accumulators and pools are wired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wiring {
    /// Registry pools and the shared per-index accumulators
    Shared,
    /// No pools, private accumulators; for one-off runs
    Detached,
}

/// Appliance-wide ETL registry
pub struct EtlRegistry {
    config: EtlConfig,
    config_service: Arc<dyn ConfigService>,
    resolver: Arc<dyn TierResolver>,
    pools: Vec<Arc<WorkerPool>>,
    metrics: Arc<EtlMetrics>,
    gating: Arc<GatingState>,
    chains: DashMap<String, Arc<StageChain>>,
    manual: AtomicBool,
    shut_down: AtomicBool,
    poller: Mutex<Option<ScheduleHandle>>,
    lifecycle: Mutex<()>,
}

impl std::fmt::Debug for EtlRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtlRegistry")
            .field("appliance", &self.config.appliance_identity)
            .field("chains", &self.chains.len())
            .field("manual", &self.is_manual())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl EtlRegistry {
    /// Build a registry; nothing runs until [`start`](Self::start)
    ///
    /// # Errors
    /// `ConfigError::Invalid` if the configuration does not validate
    pub fn new(
        config: EtlConfig,
        config_service: Arc<dyn ConfigService>,
        resolver: Arc<dyn TierResolver>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let pools = WorkerPool::for_transitions(config.max_transitions, config.scheduler.pool_size);
        let metrics = Arc::new(EtlMetrics::new(
            config.max_transitions,
            config.space_cache_ttl(),
        ));
        let gating = Arc::new(config.gating_state());
        info!(
            appliance = %config.appliance_identity,
            transitions = config.max_transitions,
            policy = %config.out_of_space_policy,
            "etl registry created"
        );
        Ok(Arc::new(Self {
            config,
            config_service,
            resolver,
            pools,
            metrics,
            gating,
            chains: DashMap::new(),
            manual: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            poller: Mutex::new(None),
            lifecycle: Mutex::new(()),
        }))
    }

    /// Start the discovery poller; the first sweep runs immediately
    pub fn start(self: &Arc<Self>) {
        if self.is_manual() || self.is_shut_down() {
            warn!("etl registry not started: manual control or shut down");
            return;
        }
        let registry = Arc::downgrade(self);
        let handle = spawn_fixed_delay(
            "etl-discovery",
            Duration::ZERO,
            self.config.scheduler.discovery_interval(),
            move || {
                let registry = registry.clone();
                async move {
                    if let Some(registry) = registry.upgrade() {
                        registry.discover().await;
                    }
                }
            },
        );
        if let Some(old) = self.poller.lock().replace(handle) {
            old.cancel();
        }
    }

    /// Configuration in force
    #[inline]
    #[must_use]
    pub fn config(&self) -> &EtlConfig {
        &self.config
    }

    /// Per-index accumulators
    #[inline]
    #[must_use]
    pub fn metrics(&self) -> &Arc<EtlMetrics> {
        &self.metrics
    }

    /// Gating tracker
    #[inline]
    #[must_use]
    pub fn gating(&self) -> &Arc<GatingState> {
        &self.gating
    }

    /// Worker pools, by index
    #[inline]
    #[must_use]
    pub fn pools(&self) -> &[Arc<WorkerPool>] {
        &self.pools
    }

    /// Manual control is on
    #[inline]
    #[must_use]
    pub fn is_manual(&self) -> bool {
        self.manual.load(Ordering::Acquire)
    }

    /// Registry has been shut down
    #[inline]
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Chain for `pv`, if registered
    #[must_use]
    pub fn chain(&self, pv: &str) -> Option<Arc<StageChain>> {
        self.chains.get(pv).map(|c| Arc::clone(c.value()))
    }

    /// Registered PV names, sorted
    #[must_use]
    pub fn pv_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.chains.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// One discovery sweep; returns how many chains were added
    pub async fn discover(&self) -> usize {
        if self.is_shut_down() {
            return 0;
        }
        let mut added = 0;
        for pv in self.config_service.owned_pvs() {
            if self.chains.contains_key(&pv) {
                continue;
            }
            let Some(info) = self.config_service.type_info(&pv) else {
                warn!(pv = %pv, "owned pv has no type info; skipping");
                continue;
            };
            if info.paused {
                debug!(pv = %pv, "pv is paused; not scheduling etl");
                continue;
            }
            if let Ok(true) = self.add_pv(&info).await {
                added += 1;
            }
        }
        if added > 0 {
            info!(added, total = self.chains.len(), "discovered pvs for etl");
        }
        added
    }

    /// Build and schedule the chain for a PV
    ///
    /// `Ok(false)` if the PV already has one.
    ///
    /// # Errors
    /// Configuration problems (too few endpoints, too many transitions,
    /// unresolvable endpoints) and `EtlError::ShutDown`
    pub async fn add_pv(&self, info: &PvTypeInfo) -> Result<bool, EtlError> {
        if self.is_shut_down() {
            return Err(EtlError::ShutDown);
        }
        if self.chains.contains_key(&info.pv_name) {
            debug!(pv = %info.pv_name, "etl already scheduled");
            return Ok(false);
        }

        let chain = Arc::new(self.build_chain(info, None, Wiring::Shared).await?);
        let now = Utc::now();

        let _lifecycle = self.lifecycle.lock();
        if self.is_shut_down() {
            return Err(EtlError::ShutDown);
        }
        match self.chains.entry(info.pv_name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&chain));
            }
        }
        let manual = self.is_manual();
        if !manual {
            self.schedule_chain(&chain, now);
        }
        info!(
            pv = %info.pv_name,
            stages = chain.stages().len(),
            manual,
            "etl chain registered"
        );
        Ok(true)
    }

    /// Unschedule a PV; returns the consolidation task if one was started
    pub fn remove_pv(&self, pv: &str) -> Option<JoinHandle<()>> {
        let (_, chain) = self.chains.remove(pv)?;
        info!(pv, "removing etl chain");
        chain.cancel(Utc::now())
    }

    /// React to a PV's type information changing
    ///
    /// Deleted, paused or reassigned PVs are removed; active ones added.
    ///
    /// # Errors
    /// Whatever [`add_pv`](Self::add_pv) reports
    pub async fn on_type_info_changed(&self, pv: &str, change: PvChange) -> Result<(), EtlError> {
        let info = match change {
            PvChange::Deleted => None,
            PvChange::Updated => self.config_service.type_info(pv),
        };
        match info {
            Some(info) if !info.paused && info.appliance == self.config.appliance_identity => {
                self.add_pv(&info).await.map(|_| ())
            }
            _ => {
                debug!(pv, ?change, "pv no longer active here");
                self.remove_pv(pv);
                Ok(())
            }
        }
    }

    /// Stop scheduling and close pools so callers drive runs themselves
    pub fn manual_control(&self) {
        warn!("etl switched to manual control; scheduled runs stop");
        let _lifecycle = self.lifecycle.lock();
        self.manual.store(true, Ordering::Release);
        if let Some(poller) = self.poller.lock().take() {
            poller.cancel();
        }
        for chain in &self.chains {
            chain.value().cancel_schedule();
        }
        for pool in &self.pools {
            pool.close();
        }
    }

    /// Run every registered chain as if the time were `at`
    ///
    /// # Errors
    /// `EtlError::JobFailed` for the first stage failure, after the failing
    /// chain has run to its end
    pub async fn run_etls(&self, at: DateTime<Utc>) -> Result<(), EtlError> {
        for pv in self.pv_names() {
            self.run_pv_etls(&pv, at).await?;
        }
        Ok(())
    }

    /// Run one PV's chain as if the time were `at`
    ///
    /// # Errors
    /// `ConfigError::UnknownPv` if not registered, `EtlError::JobFailed`
    /// if a stage failed
    pub async fn run_pv_etls(&self, pv: &str, at: DateTime<Utc>) -> Result<ChainRun, EtlError> {
        let chain = self
            .chain(pv)
            .ok_or_else(|| ConfigError::UnknownPv(pv.to_string()))?;
        let run = chain.run_as_if_at(at).await;
        check_run(pv, &run)?;
        Ok(run)
    }

    /// Migrate an unscheduled PV's data down to the tier named `storage`
    ///
    /// Builds a throwaway chain with private accumulators and runs stages in
    /// order until the one writing into `storage`. Returns the number of
    /// stages run.
    ///
    /// # Errors
    /// `ConfigError::StillScheduled`, `ConfigError::UnknownPv`,
    /// `ConfigError::UnknownStorage`, or `EtlError::JobFailed`
    pub async fn consolidate_pv_until(
        &self,
        pv: &str,
        storage: &str,
        at: DateTime<Utc>,
    ) -> Result<usize, EtlError> {
        if self.chains.contains_key(pv) {
            return Err(ConfigError::StillScheduled(pv.to_string()).into());
        }
        let info = self
            .config_service
            .type_info(pv)
            .ok_or_else(|| ConfigError::UnknownPv(pv.to_string()))?;
        let chain = self.build_chain(&info, Some(storage), Wiring::Detached).await?;
        let reaches = chain
            .stages()
            .last()
            .is_some_and(|s| s.dest_name() == storage);
        if !reaches {
            return Err(ConfigError::UnknownStorage {
                pv: pv.to_string(),
                storage: storage.to_string(),
            }
            .into());
        }
        info!(pv, storage, stages = chain.stages().len(), "consolidating pv");
        let run = chain.run_as_if_at(at).await;
        check_run(pv, &run)?;
        Ok(chain.stages().len())
    }

    /// Most recent sample for `pv` across its chain's destinations
    ///
    /// # Errors
    /// Destination errors
    pub async fn latest_event(&self, pv: &str) -> Result<Option<Event>, EtlError> {
        match self.chain(pv) {
            Some(chain) => Ok(chain.latest_event().await?),
            None => Ok(None),
        }
    }

    /// Status rows for one PV's chain
    #[must_use]
    pub fn pv_details(&self, pv: &str) -> Option<Vec<MetricDetail>> {
        self.chain(pv).map(|c| c.details())
    }

    /// Stop everything
    ///
    /// Cancels the poller and every schedule, removes every PV (starting
    /// consolidation where sources ask for it) and closes the pools. The
    /// returned consolidation tasks are not awaited here.
    pub fn shutdown(&self) -> Vec<JoinHandle<()>> {
        let _lifecycle = self.lifecycle.lock();
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        info!(pvs = self.chains.len(), "shutting down etl");
        if let Some(poller) = self.poller.lock().take() {
            poller.cancel();
        }
        let consolidations: Vec<JoinHandle<()>> = self
            .pv_names()
            .iter()
            .filter_map(|pv| self.remove_pv(pv))
            .collect();
        for pool in &self.pools {
            pool.close();
        }
        consolidations
    }

    fn schedule_chain(&self, chain: &Arc<StageChain>, now: DateTime<Utc>) {
        let initial = chain.initial_delay(now);
        let cadence = chain.cadence();
        let weak = Arc::downgrade(chain);
        let handle = spawn_fixed_delay(format!("etl-{}", chain.pv_name()), initial, cadence, move || {
            let chain = weak.clone();
            async move {
                let Some(chain) = chain.upgrade() else {
                    return;
                };
                let run = chain.run_scheduled().await;
                if let ChainRunState::Failed { stage } = run.state {
                    debug!(pv = %chain.pv_name(), stage, "scheduled chain run recorded a failure");
                }
            }
        });
        debug!(
            pv = %chain.pv_name(),
            stages = chain.stages().len(),
            initial_secs = initial.as_secs(),
            cadence_secs = cadence.as_secs(),
            "chain scheduled"
        );
        chain.set_schedule(handle);
    }

    async fn build_chain(
        &self,
        info: &PvTypeInfo,
        until: Option<&str>,
        wiring: Wiring,
    ) -> Result<StageChain, EtlError> {
        let pv = info.pv_name.as_str();
        let stores = &info.data_stores;
        if stores.len() < 2 {
            warn!(pv, count = stores.len(), "need at least two data stores for etl; skipping");
            return Err(ConfigError::TooFewDataStores {
                pv: pv.to_string(),
                count: stores.len(),
            }
            .into());
        }
        let transitions = info.transition_count();
        if transitions > self.config.max_transitions {
            error!(
                pv,
                transitions,
                max = self.config.max_transitions,
                fatal = true,
                "pv needs more etl transitions than this installation supports"
            );
            return Err(ConfigError::TooManyTransitions {
                pv: pv.to_string(),
                transitions,
                max: self.config.max_transitions,
            }
            .into());
        }

        let pools = match wiring {
            Wiring::Shared => self.pools.clone(),
            Wiring::Detached => Vec::new(),
        };
        let now = Utc::now();
        let mut chain = StageChain::new(pv, pools);
        for (index, pair) in stores.windows(2).enumerate() {
            let source = self.resolver.resolve_source(&pair[0]).map_err(|e| {
                error!(pv, index, endpoint = %pair[0], "cannot resolve etl source: {}", e);
                e
            })?;
            let dest = self.resolver.resolve_dest(&pair[1]).map_err(|e| {
                error!(pv, index, endpoint = %pair[1], "cannot resolve etl destination: {}", e);
                e
            })?;
            let metrics = match wiring {
                Wiring::Shared => self.metrics.for_index(index).ok_or_else(|| {
                    ConfigError::Invalid(format!("no metrics for transition {index}"))
                })?,
                Wiring::Detached => Arc::new(TransitionMetrics::new(
                    index,
                    self.config.space_cache_ttl(),
                )),
            };
            if wiring == Wiring::Shared {
                if let Some(capacity) = dest.storage_metrics() {
                    if let Err(e) = capacity.usable_space(metrics.space_cache()).await {
                        debug!(pv, dest = %dest.name(), "initial space check failed: {}", e);
                    }
                }
            }
            let reached = until.is_some_and(|name| dest.name() == name);
            chain.push_stage(
                EtlStage::new(
                    pv,
                    index,
                    info.value_type,
                    source,
                    dest,
                    self.config.out_of_space_policy,
                    metrics,
                )
                .with_gating(Arc::clone(&self.gating)),
                now,
            );
            if reached {
                break;
            }
        }
        Ok(chain)
    }
}

fn check_run(pv: &str, run: &ChainRun) -> Result<(), EtlError> {
    if let ChainRunState::Failed { stage } = run.state {
        let message = match run.outcomes.get(stage) {
            Some(JobOutcome::Failed(message)) => message.clone(),
            _ => "unknown failure".to_string(),
        };
        return Err(EtlError::JobFailed {
            pv: pv.to_string(),
            index: stage,
            message,
        });
    }
    Ok(())
}
