//! Error types for the archiver ETL
//!
//! Three layers:
//! - `StorageError` for anything a storage tier collaborator reports
//! - `ConfigError` for installation and per-PV configuration problems
//! - `EtlError` for the operational entry points that surface both

/// Errors reported by storage tier collaborators
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Underlying I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A chunk stream failed while being read
    #[error("stream error in {key}: {message}")]
    Stream {
        /// Chunk key
        key: String,
        /// Failure detail
        message: String,
    },

    /// The tier (or a peer behind it) could not be reached
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Usable space could not be determined
    #[error("capacity check failed: {0}")]
    Capacity(String),

    /// Destination rejected a write because it is full
    #[error("out of space: needed {needed} bytes, {available} available")]
    OutOfSpace {
        /// Bytes the write required
        needed: u64,
        /// Bytes the tier reported free
        available: u64,
    },

    /// Anything else a tier wants to report
    #[error("{0}")]
    Other(String),
}

impl StorageError {
    /// Build a stream error for a chunk key
    #[inline]
    #[must_use]
    pub fn stream(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Stream {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Could not read the configuration file
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// TOML did not parse into the expected shape
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// Out-of-space policy name not recognised
    #[error("unknown out-of-space policy: {0}")]
    UnknownPolicy(String),

    /// Partition granularity name not recognised
    #[error("unknown partition granularity: {0}")]
    UnknownGranularity(String),

    /// A PV needs at least two storage endpoints to have a transition
    #[error("pv {pv} has {count} data stores; at least 2 are needed for ETL")]
    TooFewDataStores {
        /// PV name
        pv: String,
        /// Number of configured endpoints
        count: usize,
    },

    /// A PV asks for more transitions than the installation supports
    #[error("pv {pv} needs {transitions} transitions; installation supports {max}")]
    TooManyTransitions {
        /// PV name
        pv: String,
        /// Transitions the PV would need
        transitions: usize,
        /// Installation maximum
        max: usize,
    },

    /// Storage endpoint could not be resolved to a tier
    #[error("unknown storage endpoint: {0}")]
    UnknownEndpoint(String),

    /// No type information for the PV
    #[error("unknown pv: {0}")]
    UnknownPv(String),

    /// Operation requires the PV to be unscheduled first
    #[error("pv {0} is still scheduled for ETL")]
    StillScheduled(String),

    /// No stage in the PV's chain writes to the named storage
    #[error("pv {pv} has no stage writing to {storage}")]
    UnknownStorage {
        /// PV name
        pv: String,
        /// Requested destination name
        storage: String,
    },
}

/// Errors surfaced by the operational entry points
#[derive(Debug, thiserror::Error)]
pub enum EtlError {
    /// Storage collaborator failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration failure
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A stage run recorded a failure
    #[error("etl for {pv} (transition {index}) failed: {message}")]
    JobFailed {
        /// PV name
        pv: String,
        /// Transition index of the failing stage
        index: usize,
        /// Recorded failure
        message: String,
    },

    /// Registry has been shut down
    #[error("etl registry is shut down")]
    ShutDown,
}

/// Result alias for storage collaborators
pub type StorageResult<T> = Result<T, StorageError>;

/// Result alias for operational entry points
pub type EtlResult<T> = Result<T, EtlError>;
