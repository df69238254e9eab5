//! Scripted collaborators
//!
//! [`ScriptedSource`] hands out a fixed list of chunks, some of which can be
//! made to fail part way through reading. [`RecordingDest`] records what it
//! was asked to do and can be told to fail commits, post-processors or
//! capacity checks, or to report a given amount of free space. Both write
//! into a shared [`ActivityLog`] so tests can assert ordering across stages.

use archiver_etl::{
    ChunkDescriptor, EtlContext, EtlDest, EtlSource, Event, EventStream, PartitionGranularity,
    SpaceCache, StorageError, StorageMetrics, StreamOpener, ValueType,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Shared, ordered record of collaborator activity
#[derive(Debug, Clone, Default)]
pub struct ActivityLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// One chunk a [`ScriptedSource`] will report
#[derive(Debug, Clone)]
pub struct ChunkScript {
    pub key: String,
    pub size_bytes: u64,
    pub events: Vec<Event>,
    /// Yield this many samples, then a stream error
    pub fail_after: Option<usize>,
}

impl ChunkScript {
    pub fn new(key: impl Into<String>, size_bytes: u64, events: Vec<Event>) -> Self {
        Self {
            key: key.into(),
            size_bytes,
            events,
            fail_after: None,
        }
    }

    pub fn failing_after(mut self, samples: usize) -> Self {
        self.fail_after = Some(samples);
        self
    }
}

struct ScriptOpener {
    script: ChunkScript,
}

#[async_trait]
impl StreamOpener for ScriptOpener {
    async fn open(&self) -> Result<EventStream, StorageError> {
        let script = &self.script;
        let items: Vec<Result<Event, StorageError>> = match script.fail_after {
            Some(n) => script
                .events
                .iter()
                .take(n)
                .copied()
                .map(Ok)
                .chain(std::iter::once(Err(StorageError::stream(
                    script.key.clone(),
                    "scripted read failure",
                ))))
                .collect(),
            None => script.events.iter().copied().map(Ok).collect(),
        };
        Ok(EventStream::new(script.key.clone(), items.into_iter()))
    }
}

/// Source that reports a scripted list of chunks
pub struct ScriptedSource {
    name: String,
    granularity: PartitionGranularity,
    chunks: Mutex<Vec<ChunkScript>>,
    list_delay: Option<Duration>,
    fail_deletion: AtomicBool,
    consolidate: bool,
    deleted: Mutex<Vec<String>>,
    listings: AtomicUsize,
    log: ActivityLog,
}

impl std::fmt::Debug for ScriptedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedSource")
            .field("name", &self.name)
            .field("chunks", &self.chunks.lock().len())
            .finish_non_exhaustive()
    }
}

impl ScriptedSource {
    pub fn new(name: impl Into<String>, granularity: PartitionGranularity, log: ActivityLog) -> Self {
        Self {
            name: name.into(),
            granularity,
            chunks: Mutex::new(Vec::new()),
            list_delay: None,
            fail_deletion: AtomicBool::new(false),
            consolidate: false,
            deleted: Mutex::new(Vec::new()),
            listings: AtomicUsize::new(0),
            log,
        }
    }

    /// Sleep this long inside every listing
    pub fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = Some(delay);
        self
    }

    pub fn with_consolidate_on_shutdown(mut self, consolidate: bool) -> Self {
        self.consolidate = consolidate;
        self
    }

    pub fn with_chunks(self, chunks: Vec<ChunkScript>) -> Self {
        *self.chunks.lock() = chunks;
        self
    }

    pub fn push_chunk(&self, chunk: ChunkScript) {
        self.chunks.lock().push(chunk);
    }

    pub fn set_fail_deletion(&self, fail: bool) {
        self.fail_deletion.store(fail, Ordering::SeqCst);
    }

    /// Keys deleted so far, in order
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    /// Keys still held
    pub fn remaining(&self) -> Vec<String> {
        self.chunks.lock().iter().map(|c| c.key.clone()).collect()
    }

    pub fn listings(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EtlSource for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn partition_granularity(&self) -> PartitionGranularity {
        self.granularity
    }

    async fn list_ready_chunks(
        &self,
        pv: &str,
        _as_of: DateTime<Utc>,
        _ctx: &EtlContext,
    ) -> Result<Vec<ChunkDescriptor>, StorageError> {
        self.log.push(format!("start:{}", self.name));
        self.listings.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.list_delay {
            tokio::time::sleep(delay).await;
        }
        let scripts = self.chunks.lock().clone();
        Ok(scripts
            .into_iter()
            .map(|script| {
                let first = script
                    .events
                    .first()
                    .copied()
                    .unwrap_or_else(|| Event::new(DateTime::<Utc>::UNIX_EPOCH, 0.0));
                ChunkDescriptor::new(
                    script.key.clone(),
                    pv,
                    script.size_bytes,
                    self.granularity,
                    first,
                    Arc::new(ScriptOpener { script }),
                )
            })
            .collect())
    }

    async fn mark_for_deletion(
        &self,
        chunks: &[ChunkDescriptor],
        _ctx: &EtlContext,
    ) -> Result<(), StorageError> {
        if self.fail_deletion.load(Ordering::SeqCst) {
            return Err(StorageError::Other("scripted deletion failure".to_string()));
        }
        let keys: Vec<&str> = chunks.iter().map(|c| c.key.as_str()).collect();
        self.chunks.lock().retain(|c| !keys.contains(&c.key.as_str()));
        self.deleted
            .lock()
            .extend(keys.iter().map(|k| (*k).to_string()));
        Ok(())
    }

    fn consolidate_on_shutdown(&self) -> bool {
        self.consolidate
    }
}

/// What a [`RecordingDest`] has been asked to do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DestCounters {
    pub prepares: usize,
    pub appends: usize,
    pub commits: usize,
    pub post_processor_runs: usize,
}

/// Destination that records every call
pub struct RecordingDest {
    name: String,
    root: String,
    granularity: PartitionGranularity,
    free_space: Option<u64>,
    space_check_fails: bool,
    fail_commit: AtomicBool,
    fail_post_processors: AtomicBool,
    panic_on_append: AtomicBool,
    pending: Mutex<HashMap<Uuid, Vec<Event>>>,
    committed: Mutex<Vec<Event>>,
    counters: Mutex<DestCounters>,
    log: ActivityLog,
}

impl std::fmt::Debug for RecordingDest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingDest")
            .field("name", &self.name)
            .field("counters", &self.counters())
            .finish_non_exhaustive()
    }
}

impl RecordingDest {
    pub fn new(name: impl Into<String>, granularity: PartitionGranularity, log: ActivityLog) -> Self {
        let name = name.into();
        Self {
            root: format!("rec://{name}"),
            name,
            granularity,
            free_space: None,
            space_check_fails: false,
            fail_commit: AtomicBool::new(false),
            fail_post_processors: AtomicBool::new(false),
            panic_on_append: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            committed: Mutex::new(Vec::new()),
            counters: Mutex::new(DestCounters::default()),
            log,
        }
    }

    /// Report this much usable space
    pub fn with_free_space(mut self, bytes: u64) -> Self {
        self.free_space = Some(bytes);
        self
    }

    /// Report capacity but fail every space check
    pub fn with_failing_space_check(mut self) -> Self {
        self.free_space = Some(0);
        self.space_check_fails = true;
        self
    }

    pub fn set_fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_post_processors(&self, fail: bool) {
        self.fail_post_processors.store(fail, Ordering::SeqCst);
    }

    pub fn set_panic_on_append(&self, panic: bool) {
        self.panic_on_append.store(panic, Ordering::SeqCst);
    }

    pub fn committed(&self) -> Vec<Event> {
        self.committed.lock().clone()
    }

    pub fn counters(&self) -> DestCounters {
        *self.counters.lock()
    }
}

#[async_trait]
impl EtlDest for RecordingDest {
    fn name(&self) -> &str {
        &self.name
    }

    fn partition_granularity(&self) -> PartitionGranularity {
        self.granularity
    }

    async fn prepare_new_partition(
        &self,
        _pv: &str,
        _first_event: &Event,
        _value_type: ValueType,
        _ctx: &EtlContext,
    ) -> Result<bool, StorageError> {
        self.counters.lock().prepares += 1;
        Ok(true)
    }

    async fn append_data(
        &self,
        _pv: &str,
        stream: EventStream,
        ctx: &EtlContext,
    ) -> Result<bool, StorageError> {
        if self.panic_on_append.load(Ordering::SeqCst) {
            panic!("scripted append panic in {}", self.name);
        }
        let events = stream.collect::<Result<Vec<Event>, StorageError>>()?;
        self.counters.lock().appends += 1;
        let appended = !events.is_empty();
        self.pending.lock().entry(ctx.id()).or_default().extend(events);
        Ok(appended)
    }

    async fn commit(&self, _pv: &str, ctx: &EtlContext) -> Result<bool, StorageError> {
        self.counters.lock().commits += 1;
        let pending = self.pending.lock().remove(&ctx.id()).unwrap_or_default();
        if self.fail_commit.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.committed.lock().extend(pending);
        Ok(true)
    }

    async fn run_post_processors(
        &self,
        _pv: &str,
        _value_type: ValueType,
        _ctx: &EtlContext,
    ) -> Result<(), StorageError> {
        self.counters.lock().post_processor_runs += 1;
        self.log.push(format!("done:{}", self.name));
        if self.fail_post_processors.load(Ordering::SeqCst) {
            return Err(StorageError::Other("scripted post processor failure".to_string()));
        }
        Ok(())
    }

    async fn last_known_event(&self, _pv: &str) -> Result<Option<Event>, StorageError> {
        Ok(self.committed.lock().iter().max_by_key(|e| e.timestamp).copied())
    }

    fn storage_metrics(&self) -> Option<&dyn StorageMetrics> {
        self.free_space.map(|_| self as &dyn StorageMetrics)
    }
}

#[async_trait]
impl StorageMetrics for RecordingDest {
    fn root(&self) -> &str {
        &self.root
    }

    async fn usable_space(&self, cache: &SpaceCache) -> Result<u64, StorageError> {
        let reading = if self.space_check_fails {
            Err(StorageError::Unavailable(format!("{} is not mounted", self.root)))
        } else {
            Ok(self.free_space.unwrap_or(u64::MAX))
        };
        cache.usable_space(&self.root, async move { reading }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn ev(secs: i64) -> Event {
        Event::new(Utc.timestamp_opt(secs, 0).unwrap(), secs as f64)
    }

    #[tokio::test]
    async fn failing_script_yields_prefix_then_error() {
        let log = ActivityLog::new();
        let source = ScriptedSource::new("src", PartitionGranularity::Hour, log.clone())
            .with_chunks(vec![ChunkScript::new("c1", 10, vec![ev(1), ev(2), ev(3)]).failing_after(2)]);
        let ctx = EtlContext::new();
        let chunks = source.list_ready_chunks("pv", Utc::now(), &ctx).await.unwrap();
        let items: Vec<_> = chunks[0].open().await.unwrap().collect();
        assert_eq!(items.len(), 3);
        assert!(items[2].is_err());
        assert_eq!(log.entries(), vec!["start:src".to_string()]);
    }

    #[tokio::test]
    async fn deletion_removes_scripts() {
        let source = ScriptedSource::new("src", PartitionGranularity::Hour, ActivityLog::new())
            .with_chunks(vec![
                ChunkScript::new("c1", 1, vec![ev(1)]),
                ChunkScript::new("c2", 1, vec![ev(2)]),
            ]);
        let ctx = EtlContext::new();
        let chunks = source.list_ready_chunks("pv", Utc::now(), &ctx).await.unwrap();
        source.mark_for_deletion(&chunks[..1], &ctx).await.unwrap();
        assert_eq!(source.deleted(), vec!["c1".to_string()]);
        assert_eq!(source.remaining(), vec!["c2".to_string()]);
    }
}
