//! What a migration does when a destination runs out of space
//!
//! The installation picks one [`OutOfSpacePolicy`]. Each stage resolves it
//! once, at construction, into a [`ResolvedPolicy`] for its transition
//! index. A chunk that fails to move (no space, or an I/O error while
//! reading or writing it) is then handled by [`ResolvedPolicy::on_failure`].

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Installation-wide out-of-space strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OutOfSpacePolicy {
    /// Leave the source alone and stop the run
    #[serde(rename = "SKIP_ETL_WHEN_OUT_OF_SPACE")]
    Skip,
    /// Drop the source chunk and keep going
    #[serde(rename = "DELETE_SRC_STREAMS_WHEN_OUT_OF_SPACE")]
    Delete,
    /// Drop only from the first tier, which protects the sampling engine's
    /// buffer; skip everywhere else
    #[default]
    #[serde(rename = "DELETE_SRC_STREAMS_IF_FIRST_DEST_WHEN_OUT_OF_SPACE")]
    DeleteIfFirstTier,
}

impl OutOfSpacePolicy {
    /// All policies
    pub const ALL: [Self; 3] = [Self::Skip, Self::Delete, Self::DeleteIfFirstTier];

    /// Canonical configuration name
    #[inline]
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Skip => "SKIP_ETL_WHEN_OUT_OF_SPACE",
            Self::Delete => "DELETE_SRC_STREAMS_WHEN_OUT_OF_SPACE",
            Self::DeleteIfFirstTier => "DELETE_SRC_STREAMS_IF_FIRST_DEST_WHEN_OUT_OF_SPACE",
        }
    }

    /// Behaviour for the stage at `transition_index`
    #[inline]
    #[must_use]
    pub const fn resolve(self, transition_index: usize) -> ResolvedPolicy {
        match self {
            Self::Skip => ResolvedPolicy::Skip,
            Self::Delete => ResolvedPolicy::Delete,
            Self::DeleteIfFirstTier if transition_index == 0 => ResolvedPolicy::Delete,
            Self::DeleteIfFirstTier => ResolvedPolicy::Skip,
        }
    }
}

impl fmt::Display for OutOfSpacePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OutOfSpacePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ConfigError::UnknownPolicy(s.to_string()))
    }
}

/// Policy as it applies to one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResolvedPolicy {
    /// Stop at the failing chunk
    Skip,
    /// Flag the failing chunk for deletion and continue
    Delete,
}

impl ResolvedPolicy {
    /// What to do with a chunk that could not be moved
    #[inline]
    #[must_use]
    pub const fn on_failure(self) -> FailureAction {
        match self {
            Self::Skip => FailureAction::StopRun,
            Self::Delete => FailureAction::DeleteAndContinue,
        }
    }
}

/// Handling of a chunk that could not be moved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Add the chunk to the deletion set and go on to the next one
    DeleteAndContinue,
    /// Leave the chunk and every later one for the next run
    StopRun,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_tier_default_deletes_only_at_index_zero() {
        let policy = OutOfSpacePolicy::default();
        assert_eq!(policy, OutOfSpacePolicy::DeleteIfFirstTier);
        assert_eq!(policy.resolve(0), ResolvedPolicy::Delete);
        for index in 1..6 {
            assert_eq!(policy.resolve(index), ResolvedPolicy::Skip);
        }
    }

    #[test]
    fn explicit_policies_ignore_index() {
        for index in 0..6 {
            assert_eq!(OutOfSpacePolicy::Skip.resolve(index), ResolvedPolicy::Skip);
            assert_eq!(
                OutOfSpacePolicy::Delete.resolve(index),
                ResolvedPolicy::Delete
            );
        }
    }

    #[test]
    fn failure_actions() {
        assert_eq!(ResolvedPolicy::Skip.on_failure(), FailureAction::StopRun);
        assert_eq!(
            ResolvedPolicy::Delete.on_failure(),
            FailureAction::DeleteAndContinue
        );
    }

    #[test]
    fn names_round_trip() {
        for policy in OutOfSpacePolicy::ALL {
            assert_eq!(policy.name().parse::<OutOfSpacePolicy>().unwrap(), policy);
        }
        assert!("DELETE_EVERYTHING".parse::<OutOfSpacePolicy>().is_err());
    }
}
