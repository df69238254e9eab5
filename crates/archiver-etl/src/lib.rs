//! Archiver ETL - tiered storage migration for archived PVs
//!
//! Each PV's samples flow through an ordered chain of storage tiers. For
//! every adjacent pair of tiers this crate runs a periodic migration that:
//! - lists the source chunks whose partitions have closed
//! - checks the destination has room, applying the out-of-space policy
//! - appends and atomically commits into the destination
//! - deletes the migrated sources and runs post-processing
//!
//! Around that sit the gating tracker used during fail-over recovery,
//! per-transition worker pools and metrics, and the registry that discovers
//! PVs and schedules their chains.
//!
//! # Example
//!
//! ```rust,ignore
//! use archiver_etl::prelude::*;
//!
//! # async fn example(
//! #     config_service: std::sync::Arc<dyn ConfigService>,
//! #     resolver: std::sync::Arc<dyn TierResolver>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = EtlConfig::load("etl.toml")?;
//! let registry = EtlRegistry::new(config, config_service, resolver)?;
//! registry.start();
//!
//! // ... later
//! for task in registry.shutdown() {
//!     task.await?;
//! }
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod chain;
pub mod config;
pub mod error;
pub mod gating;
pub mod granularity;
pub mod job;
pub mod metrics;
pub mod policy;
pub mod pool;
pub mod registry;
pub mod schedule;
pub mod stage;
pub mod storage;
pub mod types;

// Re-exports for convenience
pub use chain::{ChainRun, ChainRunState, StageChain};
pub use config::{ConfigService, EtlConfig, GatingConfig, SchedulerConfig};
pub use error::{ConfigError, EtlError, EtlResult, StorageError, StorageResult};
pub use gating::{GatingScope, GatingState, Interval};
pub use granularity::PartitionGranularity;
pub use job::{JobOutcome, JobReport, MigrationJob, FREE_SPACE_MARGIN_BYTES};
pub use metrics::{EtlMetrics, MetricDetail, PhaseTimings, SpaceCache, TransitionMetrics};
pub use policy::{FailureAction, OutOfSpacePolicy, ResolvedPolicy};
pub use pool::WorkerPool;
pub use registry::EtlRegistry;
pub use schedule::{spawn_fixed_delay, ScheduleHandle};
pub use stage::{EtlStage, LastFailure, StageStats};
pub use storage::{
    ChunkDescriptor, EtlContext, EtlDest, EtlSource, EventStream, StorageMetrics, StreamOpener,
    TierResolver,
};
pub use types::{Event, PvChange, PvTypeInfo, ValueType};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for wiring up the ETL
    pub use crate::{
        ChunkDescriptor, ConfigService, EtlConfig, EtlContext, EtlDest, EtlError, EtlRegistry,
        EtlSource, Event, EventStream, JobOutcome, MigrationJob, OutOfSpacePolicy,
        PartitionGranularity, PvTypeInfo, StorageError, StorageMetrics, TierResolver, ValueType,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
