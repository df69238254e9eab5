//! Installation configuration and the configuration collaborator
//!
//! `EtlConfig` is read from TOML:
//!
//! ```toml
//! appliance_identity = "appliance0"
//! max_transitions = 5
//! out_of_space_policy = "DELETE_SRC_STREAMS_IF_FIRST_DEST_WHEN_OUT_OF_SPACE"
//!
//! [scheduler]
//! pool_size = 1
//! discovery_interval_secs = 300
//!
//! [gating]
//! default_max_intervals = 100
//! [gating.scopes]
//! failover = 500
//! ```

use crate::error::ConfigError;
use crate::gating::{GatingState, DEFAULT_MAX_INTERVALS};
use crate::policy::OutOfSpacePolicy;
use crate::types::PvTypeInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Default number of tier transitions an installation supports
pub const DEFAULT_MAX_TRANSITIONS: usize = 5;

/// ETL settings for one appliance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtlConfig {
    /// Identity of this appliance; PVs owned elsewhere are not migrated here
    pub appliance_identity: String,
    /// Upper bound on transitions per PV; one worker pool per transition
    pub max_transitions: usize,
    /// Strategy when a destination is full
    pub out_of_space_policy: OutOfSpacePolicy,
    /// Scheduling knobs
    pub scheduler: SchedulerConfig,
    /// Gating caps
    pub gating: GatingConfig,
    /// Lifetime of cached usable-space readings
    pub space_cache_ttl_secs: u64,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            appliance_identity: "appliance0".to_string(),
            max_transitions: DEFAULT_MAX_TRANSITIONS,
            out_of_space_policy: OutOfSpacePolicy::default(),
            scheduler: SchedulerConfig::default(),
            gating: GatingConfig::default(),
            space_cache_ttl_secs: 600,
        }
    }
}

impl EtlConfig {
    /// Defaults
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate TOML
    ///
    /// # Errors
    /// `ConfigError::Parse` or `ConfigError::Invalid`
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    ///
    /// # Errors
    /// `ConfigError::Io`, `ConfigError::Parse` or `ConfigError::Invalid`
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Reject values the registry cannot run with
    ///
    /// # Errors
    /// `ConfigError::Invalid` naming the offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_transitions == 0 {
            return Err(ConfigError::Invalid("max_transitions must be at least 1".into()));
        }
        if self.scheduler.pool_size == 0 {
            return Err(ConfigError::Invalid("scheduler.pool_size must be at least 1".into()));
        }
        if self.scheduler.discovery_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.discovery_interval_secs must be at least 1".into(),
            ));
        }
        if self.gating.default_max_intervals == 0 {
            return Err(ConfigError::Invalid(
                "gating.default_max_intervals must be at least 1".into(),
            ));
        }
        if let Some((scope, _)) = self.gating.scopes.iter().find(|(_, max)| **max == 0) {
            return Err(ConfigError::Invalid(format!(
                "gating.scopes.{scope} must be at least 1"
            )));
        }
        Ok(())
    }

    /// Set appliance identity
    #[inline]
    #[must_use]
    pub fn with_appliance_identity(mut self, identity: impl Into<String>) -> Self {
        self.appliance_identity = identity.into();
        self
    }

    /// Set max transitions
    #[inline]
    #[must_use]
    pub fn with_max_transitions(mut self, max: usize) -> Self {
        self.max_transitions = max;
        self
    }

    /// Set out-of-space policy
    #[inline]
    #[must_use]
    pub fn with_out_of_space_policy(mut self, policy: OutOfSpacePolicy) -> Self {
        self.out_of_space_policy = policy;
        self
    }

    /// Set per-index pool size
    #[inline]
    #[must_use]
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.scheduler.pool_size = size;
        self
    }

    /// Set discovery interval
    #[inline]
    #[must_use]
    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.scheduler.discovery_interval_secs = interval.as_secs().max(1);
        self
    }

    /// Set a gating cap for one scope
    #[inline]
    #[must_use]
    pub fn with_gating_scope(mut self, scope: impl Into<String>, max: usize) -> Self {
        self.gating.scopes.insert(scope.into(), max);
        self
    }

    /// Space cache TTL
    #[inline]
    #[must_use]
    pub fn space_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.space_cache_ttl_secs)
    }

    /// Gating state honouring the configured caps
    #[must_use]
    pub fn gating_state(&self) -> GatingState {
        self.gating
            .scopes
            .iter()
            .fold(
                GatingState::new(self.gating.default_max_intervals),
                |state, (scope, max)| state.with_scope_limit(scope.clone(), *max),
            )
    }
}

/// Scheduling knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Concurrent migrations per transition index
    pub pool_size: usize,
    /// How often the registry looks for newly owned PVs
    pub discovery_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            discovery_interval_secs: 300,
        }
    }
}

impl SchedulerConfig {
    /// Discovery interval
    #[inline]
    #[must_use]
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }
}

/// Gating caps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatingConfig {
    /// Cap for scopes without an override
    pub default_max_intervals: usize,
    /// Per-scope caps
    pub scopes: BTreeMap<String, usize>,
}

impl Default for GatingConfig {
    fn default() -> Self {
        Self {
            default_max_intervals: DEFAULT_MAX_INTERVALS,
            scopes: BTreeMap::new(),
        }
    }
}

/// Source of PV ownership and type information
pub trait ConfigService: Send + Sync {
    /// PVs currently assigned to this appliance
    fn owned_pvs(&self) -> Vec<String>;

    /// Type information for `pv`
    fn type_info(&self, pv: &str) -> Option<PvTypeInfo>;
}
