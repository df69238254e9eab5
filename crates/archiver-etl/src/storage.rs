//! Storage tier collaborators
//!
//! The ETL never touches chunk formats. A tier that can be migrated *from*
//! implements [`EtlSource`]; a tier that can be migrated *into* implements
//! [`EtlDest`] and may expose [`StorageMetrics`] so the job can check free
//! space before writing. [`TierResolver`] turns a configured endpoint string
//! into those handles.

use crate::error::{ConfigError, StorageError};
use crate::gating::GatingState;
use crate::granularity::PartitionGranularity;
use crate::metrics::SpaceCache;
use crate::types::{Event, ValueType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Lazily read samples of one chunk
///
/// Reading can fail part way through; the failure is yielded as an `Err`
/// item and the consumer decides what to do with what it already read.
pub struct EventStream {
    description: String,
    events: Box<dyn Iterator<Item = Result<Event, StorageError>> + Send>,
}

impl EventStream {
    /// Wrap a fallible iterator
    #[must_use]
    pub fn new<I>(description: impl Into<String>, events: I) -> Self
    where
        I: Iterator<Item = Result<Event, StorageError>> + Send + 'static,
    {
        Self {
            description: description.into(),
            events: Box::new(events),
        }
    }

    /// Stream over samples already in memory
    #[must_use]
    pub fn from_events(description: impl Into<String>, events: Vec<Event>) -> Self {
        Self::new(description, events.into_iter().map(Ok))
    }

    /// What the stream reads from
    #[inline]
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }
}

impl Iterator for EventStream {
    type Item = Result<Event, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.events.next()
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Opens the stream behind a chunk descriptor
#[async_trait]
pub trait StreamOpener: Send + Sync {
    /// Open a fresh stream over the chunk
    async fn open(&self) -> Result<EventStream, StorageError>;
}

/// A source chunk that is ready to migrate
#[derive(Clone)]
pub struct ChunkDescriptor {
    /// Identifier unique within the source
    pub key: String,
    /// PV the chunk belongs to
    pub pv_name: String,
    /// Size on disk
    pub size_bytes: u64,
    /// Partition granularity of the source
    pub granularity: PartitionGranularity,
    /// Earliest sample in the chunk
    pub first_event: Event,
    opener: Arc<dyn StreamOpener>,
}

impl ChunkDescriptor {
    /// Describe a chunk
    #[must_use]
    pub fn new(
        key: impl Into<String>,
        pv_name: impl Into<String>,
        size_bytes: u64,
        granularity: PartitionGranularity,
        first_event: Event,
        opener: Arc<dyn StreamOpener>,
    ) -> Self {
        Self {
            key: key.into(),
            pv_name: pv_name.into(),
            size_bytes,
            granularity,
            first_event,
            opener,
        }
    }

    /// Open the chunk's samples
    ///
    /// # Errors
    /// Whatever the source reports when opening
    pub async fn open(&self) -> Result<EventStream, StorageError> {
        self.opener.open().await
    }

    /// The opener, for wrapping
    #[inline]
    #[must_use]
    pub fn opener(&self) -> Arc<dyn StreamOpener> {
        Arc::clone(&self.opener)
    }

    /// Replace the opener, keeping everything else
    #[inline]
    #[must_use]
    pub fn with_opener(mut self, opener: Arc<dyn StreamOpener>) -> Self {
        self.opener = opener;
        self
    }

    /// Start of the partition this chunk covers
    #[inline]
    #[must_use]
    pub fn partition_start(&self) -> DateTime<Utc> {
        self.granularity.partition_start(self.first_event.timestamp)
    }

    /// Start of the partition after this one
    #[inline]
    #[must_use]
    pub fn partition_end(&self) -> DateTime<Utc> {
        self.granularity
            .next_partition_start(self.first_event.timestamp)
    }
}

impl fmt::Debug for ChunkDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkDescriptor")
            .field("key", &self.key)
            .field("pv_name", &self.pv_name)
            .field("size_bytes", &self.size_bytes)
            .field("granularity", &self.granularity)
            .field("first_event", &self.first_event)
            .finish_non_exhaustive()
    }
}

/// Work deferred until after a run's deletions
pub type PostEtlTask = Box<dyn FnOnce() -> Result<(), StorageError> + Send>;

/// Per-run context handed to every collaborator call
///
/// Destinations key their pending append buffers by the context id, so a
/// commit only publishes what this run appended. Tiers that recover data
/// from a peer consult [`EtlContext::gating`] to skip windows already
/// imported.
pub struct EtlContext {
    id: Uuid,
    post_tasks: Mutex<Vec<(String, PostEtlTask)>>,
    gating: Arc<GatingState>,
}

impl Default for EtlContext {
    fn default() -> Self {
        Self::new()
    }
}

impl EtlContext {
    /// Fresh context with a private gating state
    #[must_use]
    pub fn new() -> Self {
        Self::with_gating(Arc::new(GatingState::default()))
    }

    /// Fresh context sharing `gating`
    #[must_use]
    pub fn with_gating(gating: Arc<GatingState>) -> Self {
        Self {
            id: Uuid::new_v4(),
            post_tasks: Mutex::new(Vec::new()),
            gating,
        }
    }

    /// Windows already available downstream, per scope
    #[inline]
    #[must_use]
    pub fn gating(&self) -> &GatingState {
        &self.gating
    }

    /// Run identifier
    #[inline]
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue work to run once the run has finished deleting
    pub fn add_post_etl_task(&self, description: impl Into<String>, task: PostEtlTask) {
        self.post_tasks.lock().push((description.into(), task));
    }

    /// Queued tasks
    #[must_use]
    pub fn pending_post_etl_tasks(&self) -> usize {
        self.post_tasks.lock().len()
    }

    /// Run and clear every queued task; failures are logged
    ///
    /// Returns the number of tasks that succeeded.
    pub fn execute_post_etl_tasks(&self) -> usize {
        let tasks = std::mem::take(&mut *self.post_tasks.lock());
        let mut ok = 0;
        for (description, task) in tasks {
            match task() {
                Ok(()) => {
                    debug!(context = %self.id, task = %description, "post etl task done");
                    ok += 1;
                }
                Err(e) => {
                    error!(context = %self.id, task = %description, "post etl task failed: {}", e);
                }
            }
        }
        ok
    }
}

impl fmt::Debug for EtlContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtlContext")
            .field("id", &self.id)
            .field("pending_post_tasks", &self.pending_post_etl_tasks())
            .finish()
    }
}

/// Tier that data migrates out of
#[async_trait]
pub trait EtlSource: Send + Sync {
    /// Tier name, unique within a PV's chain
    fn name(&self) -> &str;

    /// Human readable description
    fn description(&self) -> String {
        self.name().to_string()
    }

    /// Partition layout of the tier
    fn partition_granularity(&self) -> PartitionGranularity;

    /// Chunks for `pv` whose partitions have closed as of `as_of`, oldest first
    async fn list_ready_chunks(
        &self,
        pv: &str,
        as_of: DateTime<Utc>,
        ctx: &EtlContext,
    ) -> Result<Vec<ChunkDescriptor>, StorageError>;

    /// Physically remove chunks that have been migrated or given up on
    async fn mark_for_deletion(
        &self,
        chunks: &[ChunkDescriptor],
        ctx: &EtlContext,
    ) -> Result<(), StorageError>;

    /// Whether removing the PV should trigger one last migration
    fn consolidate_on_shutdown(&self) -> bool {
        false
    }
}

/// Tier that data migrates into
#[async_trait]
pub trait EtlDest: Send + Sync {
    /// Tier name, unique within a PV's chain
    fn name(&self) -> &str;

    /// Human readable description
    fn description(&self) -> String {
        self.name().to_string()
    }

    /// Partition layout of the tier
    fn partition_granularity(&self) -> PartitionGranularity;

    /// Make sure a partition exists for `first_event`; true if one was created
    async fn prepare_new_partition(
        &self,
        pv: &str,
        first_event: &Event,
        value_type: ValueType,
        ctx: &EtlContext,
    ) -> Result<bool, StorageError>;

    /// Append a chunk's samples into this run's pending buffer
    async fn append_data(
        &self,
        pv: &str,
        stream: EventStream,
        ctx: &EtlContext,
    ) -> Result<bool, StorageError>;

    /// Publish this run's pending buffer atomically
    async fn commit(&self, pv: &str, ctx: &EtlContext) -> Result<bool, StorageError>;

    /// Refresh derived data (reduced/decimated streams and the like)
    async fn run_post_processors(
        &self,
        pv: &str,
        value_type: ValueType,
        ctx: &EtlContext,
    ) -> Result<(), StorageError>;

    /// Most recent sample committed for `pv`
    async fn last_known_event(&self, pv: &str) -> Result<Option<Event>, StorageError>;

    /// Capacity reporting, when the tier has any
    fn storage_metrics(&self) -> Option<&dyn StorageMetrics> {
        None
    }
}

/// Capacity of a destination tier
#[async_trait]
pub trait StorageMetrics: Send + Sync {
    /// Root the tier writes under; the space cache key
    fn root(&self) -> &str;

    /// Free bytes under the root, through the cache
    async fn usable_space(&self, cache: &SpaceCache) -> Result<u64, StorageError>;
}

/// Turns configured endpoint strings into tier handles
pub trait TierResolver: Send + Sync {
    /// Handle for migrating out of `endpoint`
    ///
    /// # Errors
    /// `ConfigError::UnknownEndpoint` when nothing matches
    fn resolve_source(&self, endpoint: &str) -> Result<Arc<dyn EtlSource>, ConfigError>;

    /// Handle for migrating into `endpoint`
    ///
    /// # Errors
    /// `ConfigError::UnknownEndpoint` when nothing matches
    fn resolve_dest(&self, endpoint: &str) -> Result<Arc<dyn EtlDest>, ConfigError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn post_tasks_run_once_and_clear() {
        let ctx = EtlContext::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        ctx.add_post_etl_task(
            "count",
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        ctx.add_post_etl_task(
            "fail",
            Box::new(|| Err(StorageError::Other("boom".to_string()))),
        );
        assert_eq!(ctx.pending_post_etl_tasks(), 2);
        assert_eq!(ctx.execute_post_etl_tasks(), 1);
        assert_eq!(ctx.pending_post_etl_tasks(), 0);
        assert_eq!(ctx.execute_post_etl_tasks(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stream_yields_errors_in_place() {
        let ts = Utc::now();
        let items = vec![
            Ok(Event::new(ts, 1.0)),
            Err(StorageError::stream("k", "torn")),
        ];
        let stream = EventStream::new("test", items.into_iter());
        let collected: Vec<_> = stream.collect();
        assert!(collected[0].is_ok());
        assert!(collected[1].is_err());
    }
}
