//! Gating tracker
//!
//! Remembers, per named scope, which time ranges are already available
//! downstream so fail-over recovery does not import them a second time.
//!
//! Each scope holds a bounded set of disjoint, non-touching half-open
//! intervals in epoch milliseconds. Inserting merges with every interval it
//! overlaps or touches; when the scope grows past its cap the intervals with
//! the smallest starts are dropped first. A single lock guards the whole
//! state since gating calls are rare compared to sample traffic.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// Default cap on stored intervals per scope
pub const DEFAULT_MAX_INTERVALS: usize = 100;

/// Half-open `[start, end)` range in epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interval {
    start: i64,
    end: i64,
}

impl Interval {
    /// Create an interval; `None` when `end <= start`
    #[inline]
    #[must_use]
    pub fn new(start: i64, end: i64) -> Option<Self> {
        (end > start).then_some(Self { start, end })
    }

    /// Inclusive start
    #[inline]
    #[must_use]
    pub fn start(&self) -> i64 {
        self.start
    }

    /// Exclusive end
    #[inline]
    #[must_use]
    pub fn end(&self) -> i64 {
        self.end
    }

    /// Strict overlap; sharing only a boundary does not count
    #[inline]
    #[must_use]
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.end > start && self.start < end
    }

    /// Overlap including shared boundaries
    #[inline]
    #[must_use]
    pub fn overlaps_or_touches(&self, other: &Self) -> bool {
        self.end >= other.start && self.start <= other.end
    }
}

/// Bounded interval set for one scope
#[derive(Debug, Clone)]
pub struct GatingScope {
    name: String,
    max_intervals: usize,
    // start -> end; disjoint so ends are sorted too
    intervals: BTreeMap<i64, i64>,
}

impl GatingScope {
    /// Create an empty scope
    #[must_use]
    pub fn new(name: impl Into<String>, max_intervals: usize) -> Self {
        Self {
            name: name.into(),
            max_intervals: max_intervals.max(1),
            intervals: BTreeMap::new(),
        }
    }

    /// Scope name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Interval cap
    #[inline]
    #[must_use]
    pub fn max_intervals(&self) -> usize {
        self.max_intervals
    }

    /// Record `[start, end)` as available downstream
    ///
    /// Empty and inverted ranges are ignored.
    pub fn keep(&mut self, start: i64, end: i64) {
        let Some(incoming) = Interval::new(start, end) else {
            debug!(scope = %self.name, start, end, "ignoring empty gating interval");
            return;
        };

        let absorbed: Vec<Interval> = self
            .intervals
            .range(..=incoming.end)
            .rev()
            .map(|(&s, &e)| Interval { start: s, end: e })
            .take_while(|stored| stored.overlaps_or_touches(&incoming))
            .collect();

        let merged = absorbed.iter().fold(incoming, |acc, stored| Interval {
            start: acc.start.min(stored.start),
            end: acc.end.max(stored.end),
        });
        for stored in &absorbed {
            self.intervals.remove(&stored.start);
        }
        self.intervals.insert(merged.start, merged.end);

        while self.intervals.len() > self.max_intervals {
            if let Some((s, e)) = self.intervals.pop_first() {
                debug!(scope = %self.name, start = s, end = e, "evicting gating interval");
            }
        }
    }

    /// Whether `[start, end)` strictly overlaps any stored interval
    #[must_use]
    pub fn should_keep(&self, start: i64, end: i64) -> bool {
        // The stored interval with the largest start below `end` also has the
        // largest end among candidates.
        self.intervals
            .range(..end)
            .next_back()
            .is_some_and(|(&s, &e)| Interval { start: s, end: e }.overlaps(start, end))
    }

    /// Stored intervals in start order
    #[must_use]
    pub fn intervals(&self) -> Vec<Interval> {
        self.intervals
            .iter()
            .map(|(&start, &end)| Interval { start, end })
            .collect()
    }

    /// Number of stored intervals
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    /// No intervals stored
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }
}

/// All gating scopes of an appliance
#[derive(Debug)]
pub struct GatingState {
    default_max: usize,
    overrides: HashMap<String, usize>,
    scopes: Mutex<HashMap<String, GatingScope>>,
}

impl Default for GatingState {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INTERVALS)
    }
}

impl GatingState {
    /// Create with a cap applied to every scope
    #[must_use]
    pub fn new(default_max: usize) -> Self {
        Self {
            default_max,
            overrides: HashMap::new(),
            scopes: Mutex::new(HashMap::new()),
        }
    }

    /// Override the cap for one scope
    #[must_use]
    pub fn with_scope_limit(mut self, scope: impl Into<String>, max: usize) -> Self {
        self.overrides.insert(scope.into(), max);
        self
    }

    /// Cap that a scope gets when it is created
    #[inline]
    #[must_use]
    pub fn max_intervals_for(&self, scope: &str) -> usize {
        self.overrides
            .get(scope)
            .copied()
            .unwrap_or(self.default_max)
    }

    /// Record `[start, end)` in `scope`
    pub fn keep(&self, scope: &str, start: i64, end: i64) {
        self.with_scope(scope, |s| s.keep(start, end));
    }

    /// Whether `[start, end)` strictly overlaps something kept in `scope`
    #[must_use]
    pub fn should_keep(&self, scope: &str, start: i64, end: i64) -> bool {
        self.with_scope(scope, |s| s.should_keep(start, end))
    }

    /// Snapshot of a scope's intervals
    #[must_use]
    pub fn intervals(&self, scope: &str) -> Vec<Interval> {
        self.scopes
            .lock()
            .get(scope)
            .map(GatingScope::intervals)
            .unwrap_or_default()
    }

    /// Names of the scopes created so far
    #[must_use]
    pub fn scope_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scopes.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn with_scope<R>(&self, scope: &str, f: impl FnOnce(&mut GatingScope) -> R) -> R {
        let mut scopes = self.scopes.lock();
        let entry = scopes.entry(scope.to_string()).or_insert_with(|| {
            let max = self.max_intervals_for(scope);
            info!(scope, max, "creating new gating scope");
            GatingScope::new(scope, max)
        });
        f(entry)
    }
}
