//! Partition granularity of a storage tier
//!
//! Every tier lays a PV's samples out in fixed calendar partitions. The ETL
//! only needs three things from a granularity: a rough chunk length in
//! seconds (for cadence and processing padding), and the start of the
//! partition that contains an instant and of the one after it.

use crate::error::ConfigError;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const SECS_PER_DAY: i64 = 86_400;

/// Size of the calendar partitions a tier writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PartitionGranularity {
    /// Five minute partitions
    #[serde(rename = "PARTITION_5MIN")]
    FiveMinutes,
    /// Fifteen minute partitions
    #[serde(rename = "PARTITION_15MIN")]
    FifteenMinutes,
    /// Thirty minute partitions
    #[serde(rename = "PARTITION_30MIN")]
    ThirtyMinutes,
    /// Hourly partitions
    #[serde(rename = "PARTITION_HOUR")]
    Hour,
    /// Daily partitions
    #[serde(rename = "PARTITION_DAY")]
    Day,
    /// Calendar month partitions
    #[serde(rename = "PARTITION_MONTH")]
    Month,
    /// Calendar year partitions
    #[serde(rename = "PARTITION_YEAR")]
    Year,
}

impl PartitionGranularity {
    /// All granularities, finest first
    pub const ALL: [Self; 7] = [
        Self::FiveMinutes,
        Self::FifteenMinutes,
        Self::ThirtyMinutes,
        Self::Hour,
        Self::Day,
        Self::Month,
        Self::Year,
    ];

    /// Approximate length of one partition in seconds
    ///
    /// Months and years round up (31 and 366 days).
    #[inline]
    #[must_use]
    pub const fn approx_seconds_per_chunk(self) -> u64 {
        match self {
            Self::FiveMinutes => 300,
            Self::FifteenMinutes => 900,
            Self::ThirtyMinutes => 1_800,
            Self::Hour => 3_600,
            Self::Day => 86_400,
            Self::Month => 31 * 86_400,
            Self::Year => 366 * 86_400,
        }
    }

    /// Canonical configuration name
    #[inline]
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::FiveMinutes => "PARTITION_5MIN",
            Self::FifteenMinutes => "PARTITION_15MIN",
            Self::ThirtyMinutes => "PARTITION_30MIN",
            Self::Hour => "PARTITION_HOUR",
            Self::Day => "PARTITION_DAY",
            Self::Month => "PARTITION_MONTH",
            Self::Year => "PARTITION_YEAR",
        }
    }

    /// Start of the partition containing `ts`
    #[must_use]
    pub fn partition_start(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Month => month_start(ts.year(), ts.month()).unwrap_or(ts),
            Self::Year => month_start(ts.year(), 1).unwrap_or(ts),
            fixed => {
                let width = fixed.fixed_width_secs();
                let secs = ts.timestamp();
                DateTime::from_timestamp(secs - secs.rem_euclid(width), 0).unwrap_or(ts)
            }
        }
    }

    /// Start of the partition after the one containing `ts`
    #[must_use]
    pub fn next_partition_start(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let start = self.partition_start(ts);
        match self {
            Self::Month => {
                let (year, month) = if start.month() == 12 {
                    (start.year() + 1, 1)
                } else {
                    (start.year(), start.month() + 1)
                };
                month_start(year, month).unwrap_or(start)
            }
            Self::Year => month_start(start.year() + 1, 1).unwrap_or(start),
            fixed => start + Duration::seconds(fixed.fixed_width_secs()),
        }
    }

    fn fixed_width_secs(self) -> i64 {
        match self {
            Self::FiveMinutes => 300,
            Self::FifteenMinutes => 900,
            Self::ThirtyMinutes => 1_800,
            Self::Hour => 3_600,
            Self::Day | Self::Month | Self::Year => SECS_PER_DAY,
        }
    }
}

fn month_start(year: i32, month: u32) -> Option<DateTime<Utc>> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

impl fmt::Display for PartitionGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PartitionGranularity {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|g| {
                g.name().eq_ignore_ascii_case(wanted)
                    || g.name()
                        .trim_start_matches("PARTITION_")
                        .eq_ignore_ascii_case(wanted)
            })
            .ok_or_else(|| ConfigError::UnknownGranularity(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn approx_seconds() {
        assert_eq!(PartitionGranularity::Hour.approx_seconds_per_chunk(), 3_600);
        assert_eq!(
            PartitionGranularity::Month.approx_seconds_per_chunk(),
            2_678_400
        );
        assert_eq!(
            PartitionGranularity::Year.approx_seconds_per_chunk(),
            31_622_400
        );
    }

    #[test]
    fn fixed_partitions_floor() {
        let ts = at(2024, 3, 5, 13, 47, 12);
        assert_eq!(
            PartitionGranularity::FifteenMinutes.partition_start(ts),
            at(2024, 3, 5, 13, 45, 0)
        );
        assert_eq!(
            PartitionGranularity::Hour.next_partition_start(ts),
            at(2024, 3, 5, 14, 0, 0)
        );
        assert_eq!(
            PartitionGranularity::Day.partition_start(ts),
            at(2024, 3, 5, 0, 0, 0)
        );
    }

    #[test]
    fn calendar_partitions_roll_over() {
        let ts = at(2024, 12, 31, 23, 59, 59);
        assert_eq!(
            PartitionGranularity::Month.next_partition_start(ts),
            at(2025, 1, 1, 0, 0, 0)
        );
        assert_eq!(
            PartitionGranularity::Year.partition_start(ts),
            at(2024, 1, 1, 0, 0, 0)
        );
        assert_eq!(
            PartitionGranularity::Year.next_partition_start(ts),
            at(2025, 1, 1, 0, 0, 0)
        );
    }

    #[test]
    fn parses_names() {
        assert_eq!(
            "PARTITION_HOUR".parse::<PartitionGranularity>().unwrap(),
            PartitionGranularity::Hour
        );
        assert_eq!(
            "5min".parse::<PartitionGranularity>().unwrap(),
            PartitionGranularity::FiveMinutes
        );
        assert!("fortnight".parse::<PartitionGranularity>().is_err());
    }
}
