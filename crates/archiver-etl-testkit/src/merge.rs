//! Merge-dedup tier for fail-over pairs
//!
//! Two appliances archive the same PV. On one of them a tier is wrapped so
//! that, when its chunks migrate onward, each chunk's samples are merged
//! with whatever the peer holds for the same partition window. Ties on
//! timestamp keep the local sample. Writes into the wrapped tier go to the
//! local tier unchanged.
//!
//! Once a merged window has been migrated and deleted locally it is kept in
//! the run's gating state under `<peer>:<pv>`. A later chunk for a window
//! that overlaps a kept one is read from the local tier alone.

use crate::memory::MemoryTier;
use archiver_etl::{
    ChunkDescriptor, EtlContext, EtlDest, EtlSource, Event, EventStream, PartitionGranularity,
    StorageError, StorageMetrics, StreamOpener, ValueType,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::iter::Peekable;
use std::sync::Arc;
use tracing::debug;

/// Read access to another appliance's data for a PV
#[async_trait]
pub trait RetrievalEndpoint: Send + Sync {
    /// Endpoint name
    fn name(&self) -> &str;

    /// Samples in `[start, end)`, in time order
    async fn fetch(
        &self,
        pv: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Event>, StorageError>;

    /// Most recent sample the endpoint has
    async fn last_event(&self, pv: &str) -> Result<Option<Event>, StorageError>;
}

/// Stream joining a local chunk with a peer's samples
///
/// Both inputs are in time order; equal timestamps yield the local sample
/// once. A local read error is passed through and ends the stream.
pub struct MergeDedup<I: Iterator<Item = Event>> {
    local: Peekable<EventStream>,
    other: Peekable<I>,
    failed: bool,
}

enum Head {
    Sample(DateTime<Utc>),
    Error,
    Done,
}

impl<I: Iterator<Item = Event>> MergeDedup<I> {
    /// Join `local` and `other`
    pub fn new(local: EventStream, other: I) -> Self {
        Self {
            local: local.peekable(),
            other: other.peekable(),
            failed: false,
        }
    }
}

impl<I: Iterator<Item = Event>> Iterator for MergeDedup<I> {
    type Item = Result<Event, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let local = match self.local.peek() {
            Some(Ok(event)) => Head::Sample(event.timestamp),
            Some(Err(_)) => Head::Error,
            None => Head::Done,
        };
        let other = self.other.peek().map(|e| e.timestamp);
        match (local, other) {
            (Head::Error, _) => {
                self.failed = true;
                self.local.next()
            }
            (Head::Done, None) => None,
            (Head::Done, Some(_)) => self.other.next().map(Ok),
            (Head::Sample(_), None) => self.local.next(),
            (Head::Sample(l), Some(o)) if o < l => self.other.next().map(Ok),
            (Head::Sample(l), Some(o)) => {
                if o == l {
                    self.other.next();
                }
                self.local.next()
            }
        }
    }
}

struct MergeOpener {
    pv: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    local: Arc<dyn StreamOpener>,
    other: Arc<dyn RetrievalEndpoint>,
    imported: bool,
}

#[async_trait]
impl StreamOpener for MergeOpener {
    async fn open(&self) -> Result<EventStream, StorageError> {
        let local = self.local.open().await?;
        if self.imported {
            debug!(pv = %self.pv, peer = %self.other.name(), start = %self.start, "window already imported");
            return Ok(local);
        }
        let other = self.other.fetch(&self.pv, self.start, self.end).await?;
        if other.is_empty() {
            return Err(StorageError::Unavailable(format!(
                "no data from {} for {} in [{}, {}); skipping etl",
                self.other.name(),
                self.pv,
                self.start,
                self.end
            )));
        }
        debug!(pv = %self.pv, peer = %self.other.name(), peer_samples = other.len(), "merging");
        let description = format!("merge({} + {})", local.description(), self.other.name());
        Ok(EventStream::new(
            description,
            MergeDedup::new(local, other.into_iter()),
        ))
    }
}

/// Local tier merged with a peer when read as an ETL source
pub struct MergeDedupTier {
    local: Arc<MemoryTier>,
    other: Arc<dyn RetrievalEndpoint>,
}

impl std::fmt::Debug for MergeDedupTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeDedupTier")
            .field("local", &EtlSource::name(self.local.as_ref()))
            .field("other", &self.other.name())
            .finish()
    }
}

impl MergeDedupTier {
    /// Wrap `local`, merging with `other`
    #[must_use]
    pub fn new(local: Arc<MemoryTier>, other: Arc<dyn RetrievalEndpoint>) -> Self {
        Self { local, other }
    }

    /// The wrapped local tier
    #[must_use]
    pub fn local(&self) -> &Arc<MemoryTier> {
        &self.local
    }

    /// Gating scope recording windows imported from the peer for `pv`
    #[must_use]
    pub fn gating_scope(&self, pv: &str) -> String {
        format!("{}:{}", self.other.name(), pv)
    }
}

#[async_trait]
impl EtlSource for MergeDedupTier {
    fn name(&self) -> &str {
        EtlSource::name(self.local.as_ref())
    }

    fn description(&self) -> String {
        format!(
            "merge-dedup of {} with {}",
            EtlSource::name(self.local.as_ref()),
            self.other.name()
        )
    }

    fn partition_granularity(&self) -> PartitionGranularity {
        EtlSource::partition_granularity(self.local.as_ref())
    }

    async fn list_ready_chunks(
        &self,
        pv: &str,
        as_of: DateTime<Utc>,
        ctx: &EtlContext,
    ) -> Result<Vec<ChunkDescriptor>, StorageError> {
        let chunks = self.local.list_ready_chunks(pv, as_of, ctx).await?;
        let scope = self.gating_scope(pv);
        Ok(chunks
            .into_iter()
            .map(|chunk| {
                let (start, end) = (chunk.partition_start(), chunk.partition_end());
                let imported = ctx.gating().should_keep(
                    &scope,
                    start.timestamp_millis(),
                    end.timestamp_millis(),
                );
                let opener = Arc::new(MergeOpener {
                    pv: pv.to_string(),
                    start,
                    end,
                    local: chunk.opener(),
                    other: Arc::clone(&self.other),
                    imported,
                });
                chunk.with_opener(opener)
            })
            .collect())
    }

    async fn mark_for_deletion(
        &self,
        chunks: &[ChunkDescriptor],
        ctx: &EtlContext,
    ) -> Result<(), StorageError> {
        self.local.mark_for_deletion(chunks, ctx).await?;
        for chunk in chunks {
            ctx.gating().keep(
                &self.gating_scope(&chunk.pv_name),
                chunk.partition_start().timestamp_millis(),
                chunk.partition_end().timestamp_millis(),
            );
        }
        Ok(())
    }

    fn consolidate_on_shutdown(&self) -> bool {
        self.local.consolidate_on_shutdown()
    }
}

#[async_trait]
impl EtlDest for MergeDedupTier {
    fn name(&self) -> &str {
        EtlDest::name(self.local.as_ref())
    }

    fn partition_granularity(&self) -> PartitionGranularity {
        EtlDest::partition_granularity(self.local.as_ref())
    }

    async fn prepare_new_partition(
        &self,
        pv: &str,
        first_event: &Event,
        value_type: ValueType,
        ctx: &EtlContext,
    ) -> Result<bool, StorageError> {
        self.local
            .prepare_new_partition(pv, first_event, value_type, ctx)
            .await
    }

    async fn append_data(
        &self,
        pv: &str,
        stream: EventStream,
        ctx: &EtlContext,
    ) -> Result<bool, StorageError> {
        self.local.append_data(pv, stream, ctx).await
    }

    async fn commit(&self, pv: &str, ctx: &EtlContext) -> Result<bool, StorageError> {
        self.local.commit(pv, ctx).await
    }

    async fn run_post_processors(
        &self,
        pv: &str,
        value_type: ValueType,
        ctx: &EtlContext,
    ) -> Result<(), StorageError> {
        self.local.run_post_processors(pv, value_type, ctx).await
    }

    /// Later of the local and peer samples
    async fn last_known_event(&self, pv: &str) -> Result<Option<Event>, StorageError> {
        let local = self.local.last_known_event(pv).await?;
        let other = self.other.last_event(pv).await?;
        Ok(match (local, other) {
            (Some(l), Some(o)) if o.timestamp > l.timestamp => Some(o),
            (Some(l), _) => Some(l),
            (None, o) => o,
        })
    }

    fn storage_metrics(&self) -> Option<&dyn StorageMetrics> {
        self.local.storage_metrics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archiver_etl::{GatingState, Interval};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPeer {
        tier: MemoryTier,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl RetrievalEndpoint for CountingPeer {
        fn name(&self) -> &str {
            "peer"
        }

        async fn fetch(
            &self,
            pv: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<Event>, StorageError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.tier.fetch(pv, start, end).await
        }

        async fn last_event(&self, pv: &str) -> Result<Option<Event>, StorageError> {
            self.tier.last_event(pv).await
        }
    }

    fn counting_peer(events: Vec<Event>) -> Arc<CountingPeer> {
        let tier = MemoryTier::new("peer", PartitionGranularity::Hour);
        tier.insert_events("pv", events);
        Arc::new(CountingPeer {
            tier,
            fetches: AtomicUsize::new(0),
        })
    }

    fn ev(secs: i64, value: f64) -> Event {
        Event::new(Utc.timestamp_opt(secs, 0).unwrap(), value)
    }

    #[test]
    fn interleaves_and_prefers_local() {
        let local = EventStream::from_events("local", vec![ev(0, 0.0), ev(2, 2.0), ev(4, 4.0)]);
        let other = vec![ev(1, 10.0), ev(2, 20.0), ev(5, 50.0)];
        let merged: Vec<Event> = MergeDedup::new(local, other.into_iter())
            .collect::<Result<_, _>>()
            .unwrap();
        let values: Vec<f64> = merged.iter().map(|e| e.value).collect();
        assert_eq!(values, vec![0.0, 10.0, 2.0, 4.0, 50.0]);
    }

    #[test]
    fn local_error_ends_stream() {
        let items = vec![Ok(ev(0, 0.0)), Err(StorageError::stream("k", "torn"))];
        let local = EventStream::new("local", items.into_iter());
        let merged: Vec<_> = MergeDedup::new(local, vec![ev(1, 1.0), ev(3, 3.0)].into_iter()).collect();
        assert_eq!(merged.len(), 3);
        assert!(merged[2].is_err());
    }

    #[tokio::test]
    async fn empty_peer_window_fails_open() {
        let local = Arc::new(MemoryTier::new("mts", PartitionGranularity::Day));
        local.insert_events("pv", vec![ev(100, 1.0)]);
        let peer = Arc::new(MemoryTier::new("peer", PartitionGranularity::Hour));
        let tier = MergeDedupTier::new(Arc::clone(&local), peer);
        let ctx = EtlContext::new();
        let chunks = tier
            .list_ready_chunks("pv", Utc.timestamp_opt(10 * 86_400, 0).unwrap(), &ctx)
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(matches!(
            chunks[0].open().await,
            Err(StorageError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn deleted_window_is_kept_in_gating_scope() {
        let local = Arc::new(MemoryTier::new("mts", PartitionGranularity::Day));
        local.insert_events("pv", vec![ev(100, 1.0)]);
        let peer = counting_peer(vec![ev(200, 2.0)]);
        let tier = MergeDedupTier::new(Arc::clone(&local), peer.clone());
        let gating = Arc::new(GatingState::default());
        let ctx = EtlContext::with_gating(Arc::clone(&gating));

        let chunks = tier
            .list_ready_chunks("pv", Utc.timestamp_opt(10 * 86_400, 0).unwrap(), &ctx)
            .await
            .unwrap();
        let merged: Vec<Event> = chunks[0].open().await.unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(merged, vec![ev(100, 1.0), ev(200, 2.0)]);
        assert_eq!(peer.fetches.load(Ordering::SeqCst), 1);
        assert!(gating.intervals("peer:pv").is_empty());

        tier.mark_for_deletion(&chunks, &ctx).await.unwrap();
        assert_eq!(tier.gating_scope("pv"), "peer:pv");
        assert_eq!(gating.intervals("peer:pv"), vec![Interval::new(0, 86_400_000).unwrap()]);
    }

    #[tokio::test]
    async fn window_already_kept_is_not_imported_again() {
        let local = Arc::new(MemoryTier::new("mts", PartitionGranularity::Day));
        let peer = counting_peer(vec![ev(200, 2.0), ev(90_000, 3.0)]);
        let tier = MergeDedupTier::new(Arc::clone(&local), peer.clone());
        let gating = Arc::new(GatingState::default());
        gating.keep("peer:pv", 0, 86_400_000);
        let as_of = Utc.timestamp_opt(10 * 86_400, 0).unwrap();

        // late local data for the imported day, plus a day never imported
        local.insert_events("pv", vec![ev(300, 4.0), ev(90_100, 5.0)]);
        let ctx = EtlContext::with_gating(Arc::clone(&gating));
        let chunks = tier.list_ready_chunks("pv", as_of, &ctx).await.unwrap();
        assert_eq!(chunks.len(), 2);

        let kept: Vec<Event> = chunks[0].open().await.unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(kept, vec![ev(300, 4.0)]);
        assert_eq!(peer.fetches.load(Ordering::SeqCst), 0);

        let fresh: Vec<Event> = chunks[1].open().await.unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(fresh, vec![ev(90_000, 3.0), ev(90_100, 5.0)]);
        assert_eq!(peer.fetches.load(Ordering::SeqCst), 1);

        // a context with its own gating state imports the day again
        let private = EtlContext::new();
        let chunks = tier.list_ready_chunks("pv", as_of, &private).await.unwrap();
        let merged: Vec<Event> = chunks[0].open().await.unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(merged, vec![ev(200, 2.0), ev(300, 4.0)]);
        assert_eq!(peer.fetches.load(Ordering::SeqCst), 2);
    }
}
