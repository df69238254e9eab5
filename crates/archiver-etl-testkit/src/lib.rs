//! Test kit for the archiver ETL
//!
//! In-memory tiers, scripted collaborators, a static configuration service
//! and the fail-over rig used by integration tests and the simulator.

#![allow(missing_docs)]

pub mod config;
pub mod failover;
pub mod memory;
pub mod merge;
pub mod samples;
pub mod scripted;

pub use config::{StaticConfigService, TierDirectory};
pub use failover::{FailoverRig, FAILOVER_STORES, PRIMARY_APPLIANCE};
pub use memory::{MemoryTier, TierCounters, DEFAULT_BYTES_PER_EVENT};
pub use merge::{MergeDedup, MergeDedupTier, RetrievalEndpoint};
pub use samples::{gaps, parity_samples, regular_samples, Parity};
pub use scripted::{ActivityLog, ChunkScript, DestCounters, RecordingDest, ScriptedSource};

/// Install a test subscriber once; honours `RUST_LOG`
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
