//! Shared value types: samples, PV type information and change notifications

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One archived sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Sample timestamp
    pub timestamp: DateTime<Utc>,
    /// Sample value
    pub value: f64,
}

impl Event {
    /// Create a sample
    #[inline]
    #[must_use]
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }

    /// Timestamp as epoch milliseconds
    #[inline]
    #[must_use]
    pub fn epoch_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

/// Archived value type of a PV
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ValueType {
    /// Scalar string
    #[serde(rename = "DBR_SCALAR_STRING")]
    ScalarString,
    /// Scalar short
    #[serde(rename = "DBR_SCALAR_SHORT")]
    ScalarShort,
    /// Scalar float
    #[serde(rename = "DBR_SCALAR_FLOAT")]
    ScalarFloat,
    /// Scalar enum
    #[serde(rename = "DBR_SCALAR_ENUM")]
    ScalarEnum,
    /// Scalar byte
    #[serde(rename = "DBR_SCALAR_BYTE")]
    ScalarByte,
    /// Scalar int
    #[serde(rename = "DBR_SCALAR_INT")]
    ScalarInt,
    /// Scalar double
    #[default]
    #[serde(rename = "DBR_SCALAR_DOUBLE")]
    ScalarDouble,
    /// Waveform of doubles
    #[serde(rename = "DBR_WAVEFORM_DOUBLE")]
    WaveformDouble,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ScalarString => "DBR_SCALAR_STRING",
            Self::ScalarShort => "DBR_SCALAR_SHORT",
            Self::ScalarFloat => "DBR_SCALAR_FLOAT",
            Self::ScalarEnum => "DBR_SCALAR_ENUM",
            Self::ScalarByte => "DBR_SCALAR_BYTE",
            Self::ScalarInt => "DBR_SCALAR_INT",
            Self::ScalarDouble => "DBR_SCALAR_DOUBLE",
            Self::WaveformDouble => "DBR_WAVEFORM_DOUBLE",
        };
        f.write_str(name)
    }
}

/// What the configuration collaborator knows about a PV
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PvTypeInfo {
    /// PV name
    pub pv_name: String,
    /// Archived value type
    pub value_type: ValueType,
    /// Archiving paused
    #[serde(default)]
    pub paused: bool,
    /// Identity of the appliance that owns the PV
    pub appliance: String,
    /// Ordered storage endpoints, first tier first
    pub data_stores: Vec<String>,
}

impl PvTypeInfo {
    /// Type info owned by `appliance` with the given tiers
    #[must_use]
    pub fn new(
        pv_name: impl Into<String>,
        appliance: impl Into<String>,
        data_stores: Vec<String>,
    ) -> Self {
        Self {
            pv_name: pv_name.into(),
            value_type: ValueType::default(),
            paused: false,
            appliance: appliance.into(),
            data_stores,
        }
    }

    /// Set the value type
    #[inline]
    #[must_use]
    pub fn with_value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    /// Set the paused flag
    #[inline]
    #[must_use]
    pub fn with_paused(mut self, paused: bool) -> Self {
        self.paused = paused;
        self
    }

    /// Number of tier transitions the endpoint list implies
    #[inline]
    #[must_use]
    pub fn transition_count(&self) -> usize {
        self.data_stores.len().saturating_sub(1)
    }
}

/// Kind of change reported for a PV's type information
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PvChange {
    /// Type info was added or updated
    Updated,
    /// Type info was removed
    Deleted,
}
