//! Sample generators and checks

use archiver_etl::Event;
use chrono::{DateTime, Duration, Utc};

/// Which seconds an appliance archives in a fail-over pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    Even,
    Odd,
}

impl Parity {
    fn matches(self, secs: i64) -> bool {
        match self {
            Self::Even => secs.rem_euclid(2) == 0,
            Self::Odd => secs.rem_euclid(2) == 1,
        }
    }
}

/// One sample per matching second in `[start, end)`; the value is the epoch second
pub fn parity_samples(start: DateTime<Utc>, end: DateTime<Utc>, parity: Parity) -> Vec<Event> {
    let (first, last) = (start.timestamp(), end.timestamp());
    (first..last)
        .filter(|s| parity.matches(*s))
        .filter_map(|s| DateTime::from_timestamp(s, 0))
        .map(|ts| Event::new(ts, ts.timestamp() as f64))
        .collect()
}

/// One sample every `step` in `[start, end)`
pub fn regular_samples(start: DateTime<Utc>, end: DateTime<Utc>, step: Duration) -> Vec<Event> {
    let mut out = Vec::new();
    let mut ts = start;
    while ts < end {
        out.push(Event::new(ts, ts.timestamp() as f64));
        ts += step;
    }
    out
}

/// Pairs of neighbours that are not exactly `step` apart
pub fn gaps(events: &[Event], step: Duration) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    events
        .windows(2)
        .filter(|w| w[1].timestamp - w[0].timestamp != step)
        .map(|w| (w[0].timestamp, w[1].timestamp))
        .collect()
}
