//! Two-appliance fail-over rig
//!
//! The primary archives even seconds into `sts` (hourly), `mts` (daily) and
//! `lts` (yearly); the peer archives odd seconds into its own hourly tier.
//! On the primary, `mts` is wrapped in a [`MergeDedupTier`] whose peer is
//! the other appliance's `sts`, so migrating `mts` into `lts` fills in the
//! seconds the primary missed.

use crate::config::{StaticConfigService, TierDirectory};
use crate::memory::MemoryTier;
use crate::merge::MergeDedupTier;
use crate::samples::{parity_samples, Parity};
use archiver_etl::{ConfigError, EtlConfig, EtlRegistry, PartitionGranularity, PvTypeInfo};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Appliance identity the rig's registry runs as
pub const PRIMARY_APPLIANCE: &str = "appliance0";

/// Endpoint names of the primary's chain, first tier first
pub const FAILOVER_STORES: [&str; 3] = ["sts", "mts", "lts"];

/// Tiers and collaborators of both appliances
#[derive(Debug)]
pub struct FailoverRig {
    pub pv: String,
    pub primary_sts: Arc<MemoryTier>,
    pub primary_mts: Arc<MemoryTier>,
    pub primary_lts: Arc<MemoryTier>,
    pub peer_sts: Arc<MemoryTier>,
    pub config_service: Arc<StaticConfigService>,
    pub directory: Arc<TierDirectory>,
}

impl FailoverRig {
    pub fn new(pv: impl Into<String>) -> Self {
        let pv = pv.into();
        let primary_sts = Arc::new(MemoryTier::new("sts", PartitionGranularity::Hour));
        let primary_mts = Arc::new(MemoryTier::new("mts", PartitionGranularity::Day));
        let primary_lts = Arc::new(MemoryTier::new("lts", PartitionGranularity::Year));
        let peer_sts = Arc::new(MemoryTier::new("peer-sts", PartitionGranularity::Hour));

        let directory = Arc::new(TierDirectory::new());
        directory.register("sts", Arc::clone(&primary_sts));
        directory.register(
            "mts",
            Arc::new(MergeDedupTier::new(
                Arc::clone(&primary_mts),
                Arc::clone(&peer_sts) as Arc<dyn crate::merge::RetrievalEndpoint>,
            )),
        );
        directory.register("lts", Arc::clone(&primary_lts));

        let config_service = Arc::new(StaticConfigService::new(PRIMARY_APPLIANCE));
        config_service.insert(PvTypeInfo::new(
            pv.clone(),
            PRIMARY_APPLIANCE,
            FAILOVER_STORES.iter().map(ToString::to_string).collect(),
        ));

        Self {
            pv,
            primary_sts,
            primary_mts,
            primary_lts,
            peer_sts,
            config_service,
            directory,
        }
    }

    /// Write even seconds to the primary and odd seconds to the peer
    ///
    /// Returns the number of seconds covered.
    pub fn seed(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> usize {
        let even = parity_samples(start, end, Parity::Even);
        let odd = parity_samples(start, end, Parity::Odd);
        let total = even.len() + odd.len();
        self.primary_sts.insert_events(&self.pv, even);
        self.peer_sts.insert_events(&self.pv, odd);
        total
    }

    /// Write only to the primary, leaving the peer without data
    pub fn seed_primary_only(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> usize {
        let even = parity_samples(start, end, Parity::Even);
        let count = even.len();
        self.primary_sts.insert_events(&self.pv, even);
        count
    }

    /// Registry for the primary appliance
    ///
    /// # Errors
    /// Whatever configuration validation reports
    pub fn registry(&self, config: EtlConfig) -> Result<Arc<EtlRegistry>, ConfigError> {
        EtlRegistry::new(
            config.with_appliance_identity(PRIMARY_APPLIANCE),
            Arc::clone(&self.config_service) as Arc<dyn archiver_etl::ConfigService>,
            Arc::clone(&self.directory) as Arc<dyn archiver_etl::TierResolver>,
        )
    }
}
