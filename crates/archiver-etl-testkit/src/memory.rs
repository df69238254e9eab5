//! In-memory storage tier
//!
//! Samples are kept per PV in partitions keyed by partition start. A tier
//! acts as both ETL source and destination. Appends land in a pending
//! buffer keyed by the run's context id and only become visible on commit,
//! where they merge into existing partitions deduplicated by timestamp.
//! A chunk's stream is read completely before anything is buffered, so a
//! stream that fails part way leaves the pending buffer untouched.

use crate::merge::RetrievalEndpoint;
use archiver_etl::{
    ChunkDescriptor, EtlContext, EtlDest, EtlSource, Event, EventStream, PartitionGranularity,
    SpaceCache, StorageError, StorageMetrics, StreamOpener, ValueType,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Nominal on-disk size of one sample
pub const DEFAULT_BYTES_PER_EVENT: u64 = 16;

/// Calls a tier has served
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierCounters {
    /// `list_ready_chunks` calls
    pub listings: usize,
    /// `append_data` calls that buffered samples
    pub appends: usize,
    /// Commits that published something
    pub commits: usize,
    /// Partitions removed by `mark_for_deletion`
    pub deletions: usize,
    /// Partitions created by `prepare_new_partition`
    pub partitions_created: usize,
    /// `run_post_processors` calls
    pub post_processor_runs: usize,
}

#[derive(Debug, Default)]
struct TierState {
    committed: HashMap<String, BTreeMap<DateTime<Utc>, Vec<Event>>>,
    pending: HashMap<(uuid::Uuid, String), Vec<Event>>,
    prepared: HashMap<String, Vec<DateTime<Utc>>>,
    counters: TierCounters,
    fail_commits: bool,
}

/// A storage tier held in memory
#[derive(Debug)]
pub struct MemoryTier {
    name: String,
    root: String,
    granularity: PartitionGranularity,
    bytes_per_event: u64,
    capacity_bytes: Option<u64>,
    consolidate_on_shutdown: bool,
    state: Mutex<TierState>,
}

impl MemoryTier {
    /// Empty tier with unlimited capacity
    #[must_use]
    pub fn new(name: impl Into<String>, granularity: PartitionGranularity) -> Self {
        let name = name.into();
        Self {
            root: format!("mem://{name}"),
            name,
            granularity,
            bytes_per_event: DEFAULT_BYTES_PER_EVENT,
            capacity_bytes: None,
            consolidate_on_shutdown: false,
            state: Mutex::new(TierState::default()),
        }
    }

    /// Report capacity so the job checks free space
    #[must_use]
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity_bytes = Some(bytes);
        self
    }

    /// Size each sample counts for
    #[must_use]
    pub fn with_bytes_per_event(mut self, bytes: u64) -> Self {
        self.bytes_per_event = bytes;
        self
    }

    /// Ask for a final migration when the PV is removed
    #[must_use]
    pub fn with_consolidate_on_shutdown(mut self, consolidate: bool) -> Self {
        self.consolidate_on_shutdown = consolidate;
        self
    }

    /// Make commits report failure
    pub fn set_fail_commits(&self, fail: bool) {
        self.state.lock().fail_commits = fail;
    }

    /// Write samples straight into committed partitions
    pub fn insert_events(&self, pv: &str, events: impl IntoIterator<Item = Event>) {
        let mut state = self.state.lock();
        let partitions = state.committed.entry(pv.to_string()).or_default();
        let mut grouped: BTreeMap<DateTime<Utc>, Vec<Event>> = BTreeMap::new();
        for event in events {
            grouped
                .entry(self.granularity.partition_start(event.timestamp))
                .or_default()
                .push(event);
        }
        for (start, batch) in grouped {
            merge_into(partitions.entry(start).or_default(), batch);
        }
    }

    /// Every committed sample of `pv`, in time order
    #[must_use]
    pub fn events(&self, pv: &str) -> Vec<Event> {
        self.state
            .lock()
            .committed
            .get(pv)
            .map(|p| p.values().flatten().copied().collect())
            .unwrap_or_default()
    }

    /// Committed samples of `pv` in `[start, end)`
    #[must_use]
    pub fn events_between(&self, pv: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Event> {
        if end <= start {
            return Vec::new();
        }
        let state = self.state.lock();
        let Some(partitions) = state.committed.get(pv) else {
            return Vec::new();
        };
        let first = self.granularity.partition_start(start);
        partitions
            .range(first..end)
            .flat_map(|(_, events)| events.iter())
            .filter(|e| e.timestamp >= start && e.timestamp < end)
            .copied()
            .collect()
    }

    /// Number of committed partitions for `pv`
    #[must_use]
    pub fn partition_count(&self, pv: &str) -> usize {
        self.state.lock().committed.get(pv).map_or(0, BTreeMap::len)
    }

    /// Samples buffered but not committed, across runs
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.values().map(Vec::len).sum()
    }

    /// Call counters
    #[must_use]
    pub fn counters(&self) -> TierCounters {
        self.state.lock().counters
    }

    /// Bytes held across all PVs
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        let state = self.state.lock();
        let events: usize = state
            .committed
            .values()
            .flat_map(BTreeMap::values)
            .map(Vec::len)
            .sum();
        self.bytes_per_event * events as u64
    }

    fn chunk_key(&self, pv: &str, start: DateTime<Utc>) -> String {
        format!("{}/{}/{}", self.name, pv, start.format("%Y-%m-%dT%H:%M"))
    }
}

/// Merge `incoming` into sorted `existing`; stored samples win ties
fn merge_into(existing: &mut Vec<Event>, mut incoming: Vec<Event>) {
    incoming.sort_by_key(|e| e.timestamp);
    let mut merged = Vec::with_capacity(existing.len() + incoming.len());
    let mut old = std::mem::take(existing).into_iter().peekable();
    let mut new = incoming.into_iter().peekable();
    loop {
        let take_old = match (old.peek(), new.peek()) {
            (None, None) => break,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(o), Some(n)) => {
                if o.timestamp == n.timestamp {
                    new.next();
                    continue;
                }
                o.timestamp < n.timestamp
            }
        };
        let next = if take_old { old.next() } else { new.next() };
        if let Some(event) = next {
            if merged
                .last()
                .map_or(true, |last: &Event| last.timestamp != event.timestamp)
            {
                merged.push(event);
            }
        }
    }
    *existing = merged;
}

struct SnapshotOpener {
    description: String,
    events: Vec<Event>,
}

#[async_trait]
impl StreamOpener for SnapshotOpener {
    async fn open(&self) -> Result<EventStream, StorageError> {
        Ok(EventStream::from_events(
            self.description.clone(),
            self.events.clone(),
        ))
    }
}

#[async_trait]
impl EtlSource for MemoryTier {
    fn name(&self) -> &str {
        &self.name
    }

    fn partition_granularity(&self) -> PartitionGranularity {
        self.granularity
    }

    async fn list_ready_chunks(
        &self,
        pv: &str,
        as_of: DateTime<Utc>,
        _ctx: &EtlContext,
    ) -> Result<Vec<ChunkDescriptor>, StorageError> {
        let mut state = self.state.lock();
        state.counters.listings += 1;
        let Some(partitions) = state.committed.get(pv) else {
            return Ok(Vec::new());
        };
        let ready = partitions
            .iter()
            .filter(|(start, events)| {
                !events.is_empty() && self.granularity.next_partition_start(**start) <= as_of
            })
            .filter_map(|(start, events)| {
                let first = *events.first()?;
                let key = self.chunk_key(pv, *start);
                let opener = Arc::new(SnapshotOpener {
                    description: key.clone(),
                    events: events.clone(),
                });
                Some(ChunkDescriptor::new(
                    key,
                    pv,
                    self.bytes_per_event * events.len() as u64,
                    self.granularity,
                    first,
                    opener,
                ))
            })
            .collect();
        Ok(ready)
    }

    async fn mark_for_deletion(
        &self,
        chunks: &[ChunkDescriptor],
        _ctx: &EtlContext,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        let mut removed = 0;
        for chunk in chunks {
            if let Some(partitions) = state.committed.get_mut(&chunk.pv_name) {
                if partitions.remove(&chunk.partition_start()).is_some() {
                    removed += 1;
                }
            }
        }
        state.counters.deletions += removed;
        debug!(tier = %self.name, removed, "deleted partitions");
        Ok(())
    }

    fn consolidate_on_shutdown(&self) -> bool {
        self.consolidate_on_shutdown
    }
}

#[async_trait]
impl EtlDest for MemoryTier {
    fn name(&self) -> &str {
        &self.name
    }

    fn partition_granularity(&self) -> PartitionGranularity {
        self.granularity
    }

    async fn prepare_new_partition(
        &self,
        pv: &str,
        first_event: &Event,
        _value_type: ValueType,
        _ctx: &EtlContext,
    ) -> Result<bool, StorageError> {
        let start = self.granularity.partition_start(first_event.timestamp);
        let mut state = self.state.lock();
        let exists = state
            .committed
            .get(pv)
            .is_some_and(|p| p.contains_key(&start));
        let prepared = state.prepared.entry(pv.to_string()).or_default();
        if exists || prepared.contains(&start) {
            return Ok(false);
        }
        prepared.push(start);
        state.counters.partitions_created += 1;
        Ok(true)
    }

    async fn append_data(
        &self,
        pv: &str,
        stream: EventStream,
        ctx: &EtlContext,
    ) -> Result<bool, StorageError> {
        let events = stream.collect::<Result<Vec<Event>, StorageError>>()?;
        if events.is_empty() {
            return Ok(false);
        }
        let mut state = self.state.lock();
        state
            .pending
            .entry((ctx.id(), pv.to_string()))
            .or_default()
            .extend(events);
        state.counters.appends += 1;
        Ok(true)
    }

    async fn commit(&self, pv: &str, ctx: &EtlContext) -> Result<bool, StorageError> {
        let mut state = self.state.lock();
        let pending = state
            .pending
            .remove(&(ctx.id(), pv.to_string()))
            .unwrap_or_default();
        state.prepared.remove(pv);
        if state.fail_commits {
            return Ok(false);
        }
        if pending.is_empty() {
            return Ok(true);
        }
        let mut grouped: BTreeMap<DateTime<Utc>, Vec<Event>> = BTreeMap::new();
        for event in pending {
            grouped
                .entry(self.granularity.partition_start(event.timestamp))
                .or_default()
                .push(event);
        }
        let partitions = state.committed.entry(pv.to_string()).or_default();
        for (start, batch) in grouped {
            merge_into(partitions.entry(start).or_default(), batch);
        }
        state.counters.commits += 1;
        Ok(true)
    }

    async fn run_post_processors(
        &self,
        _pv: &str,
        _value_type: ValueType,
        _ctx: &EtlContext,
    ) -> Result<(), StorageError> {
        self.state.lock().counters.post_processor_runs += 1;
        Ok(())
    }

    async fn last_known_event(&self, pv: &str) -> Result<Option<Event>, StorageError> {
        Ok(self
            .state
            .lock()
            .committed
            .get(pv)
            .and_then(|p| p.values().rev().find_map(|events| events.last().copied())))
    }

    fn storage_metrics(&self) -> Option<&dyn StorageMetrics> {
        self.capacity_bytes.map(|_| self as &dyn StorageMetrics)
    }
}

#[async_trait]
impl StorageMetrics for MemoryTier {
    fn root(&self) -> &str {
        &self.root
    }

    async fn usable_space(&self, cache: &SpaceCache) -> Result<u64, StorageError> {
        let capacity = self.capacity_bytes.unwrap_or(u64::MAX);
        let free = capacity.saturating_sub(self.used_bytes());
        cache.usable_space(&self.root, async move { Ok(free) }).await
    }
}

#[async_trait]
impl RetrievalEndpoint for MemoryTier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        pv: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Event>, StorageError> {
        Ok(self.events_between(pv, start, end))
    }

    async fn last_event(&self, pv: &str) -> Result<Option<Event>, StorageError> {
        self.last_known_event(pv).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn ev(secs: i64, value: f64) -> Event {
        Event::new(Utc.timestamp_opt(secs, 0).unwrap(), value)
    }

    #[test]
    fn merge_keeps_stored_on_ties() {
        let mut stored = vec![ev(1, 1.0), ev(3, 3.0)];
        merge_into(&mut stored, vec![ev(4, 40.0), ev(2, 20.0), ev(3, 30.0), ev(2, 21.0)]);
        let values: Vec<f64> = stored.iter().map(|e| e.value).collect();
        assert_eq!(values, vec![1.0, 20.0, 3.0, 40.0]);
    }

    #[tokio::test]
    async fn lists_only_closed_partitions() {
        let tier = MemoryTier::new("sts", PartitionGranularity::Hour);
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        tier.insert_events(
            "pv",
            (0..3).map(|h| Event::new(base + Duration::hours(h), 0.0)),
        );
        let ctx = EtlContext::new();
        let ready = tier
            .list_ready_chunks("pv", base + Duration::minutes(150), &ctx)
            .await
            .unwrap();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].size_bytes, DEFAULT_BYTES_PER_EVENT);
    }

    #[tokio::test]
    async fn commit_publishes_only_own_context() {
        let tier = MemoryTier::new("mts", PartitionGranularity::Day);
        let mine = EtlContext::new();
        let other = EtlContext::new();
        tier.append_data("pv", EventStream::from_events("a", vec![ev(10, 1.0)]), &mine)
            .await
            .unwrap();
        tier.append_data("pv", EventStream::from_events("b", vec![ev(20, 2.0)]), &other)
            .await
            .unwrap();
        assert!(tier.events("pv").is_empty());
        assert!(tier.commit("pv", &mine).await.unwrap());
        assert_eq!(tier.events("pv"), vec![ev(10, 1.0)]);
        assert_eq!(tier.pending_len(), 1);
    }

    #[tokio::test]
    async fn failed_stream_buffers_nothing() {
        let tier = MemoryTier::new("mts", PartitionGranularity::Day);
        let ctx = EtlContext::new();
        let items = vec![Ok(ev(1, 1.0)), Err(StorageError::stream("k", "torn"))];
        let stream = EventStream::new("broken", items.into_iter());
        assert!(tier.append_data("pv", stream, &ctx).await.is_err());
        assert_eq!(tier.pending_len(), 0);
    }
}
