use archiver_etl::metrics::TransitionMetrics;
use archiver_etl::{
    EtlStage, Event, JobOutcome, MigrationJob, OutOfSpacePolicy, PartitionGranularity, ValueType,
    FREE_SPACE_MARGIN_BYTES,
};
use archiver_etl_testkit::{ActivityLog, ChunkScript, RecordingDest, ScriptedSource};
use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

const PV: &str = "ring:current";

fn ev(secs: i64) -> Event {
    Event::new(Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(), secs as f64)
}

fn three_chunks() -> Vec<ChunkScript> {
    vec![
        ChunkScript::new("c1", 10, vec![ev(0), ev(1)]),
        ChunkScript::new("c2", 10, vec![ev(3600), ev(3601)]),
        ChunkScript::new("c3", 10, vec![ev(7200), ev(7201)]),
    ]
}

struct Fixture {
    source: Arc<ScriptedSource>,
    dest: Arc<RecordingDest>,
    stage: Arc<EtlStage>,
}

fn fixture(
    chunks: Vec<ChunkScript>,
    dest: RecordingDest,
    index: usize,
    policy: OutOfSpacePolicy,
) -> Fixture {
    let log = ActivityLog::new();
    let source = Arc::new(ScriptedSource::new("sts", PartitionGranularity::Hour, log).with_chunks(chunks));
    let dest = Arc::new(dest);
    let stage = Arc::new(EtlStage::new(
        PV,
        index,
        ValueType::ScalarDouble,
        Arc::clone(&source) as _,
        Arc::clone(&dest) as _,
        policy,
        Arc::new(TransitionMetrics::new(index, Duration::from_secs(600))),
    ));
    Fixture { source, dest, stage }
}

fn mts() -> RecordingDest {
    RecordingDest::new("mts", PartitionGranularity::Day, ActivityLog::new())
}

async fn run(stage: &Arc<EtlStage>) -> JobOutcome {
    MigrationJob::as_if_at(Arc::clone(stage), Utc::now()).run().await
}

#[tokio::test]
async fn test_no_ready_chunks_touches_nothing() {
    let f = fixture(Vec::new(), mts(), 0, OutOfSpacePolicy::default());
    assert_eq!(run(&f.stage).await, JobOutcome::NothingReady);
    assert_eq!(f.dest.counters().commits, 0);
    assert_eq!(f.dest.counters().post_processor_runs, 0);
    assert_eq!(f.stage.stats().runs, 0);
    assert_eq!(f.stage.metrics().total_runs(), 0);
    assert_eq!(f.source.listings(), 1);
}

#[tokio::test]
async fn test_moves_commits_and_deletes_in_order() {
    let f = fixture(three_chunks(), mts(), 0, OutOfSpacePolicy::default());
    let outcome = run(&f.stage).await;
    let report = outcome.report().expect("completed");
    assert_eq!(report.chunks_listed, 3);
    assert_eq!(report.chunks_moved, 3);
    assert_eq!(report.chunks_deleted, 3);
    assert_eq!(report.bytes_moved, 30);
    assert!(report.committed);
    assert_eq!(f.source.deleted(), vec!["c1", "c2", "c3"]);
    assert_eq!(f.dest.committed().len(), 6);
    assert_eq!(f.dest.counters().commits, 1);
    assert_eq!(f.dest.counters().post_processor_runs, 1);
    assert_eq!(f.stage.stats().runs, 1);
    assert_eq!(f.stage.metrics().total_runs(), 1);
    assert_eq!(f.stage.metrics().bytes_moved(), 30);
    assert!(!f.stage.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_run_is_refused() {
    let log = ActivityLog::new();
    let source = Arc::new(
        ScriptedSource::new("sts", PartitionGranularity::Hour, log.clone())
            .with_list_delay(Duration::from_secs(30))
            .with_chunks(three_chunks()),
    );
    let dest = Arc::new(mts());
    let stage = Arc::new(EtlStage::new(
        PV,
        0,
        ValueType::ScalarDouble,
        Arc::clone(&source) as _,
        Arc::clone(&dest) as _,
        OutOfSpacePolicy::default(),
        Arc::new(TransitionMetrics::new(0, Duration::from_secs(600))),
    ));

    let (first, second) = tokio::join!(run(&stage), run(&stage));
    assert!(matches!(first, JobOutcome::Completed(_)));
    assert_eq!(second, JobOutcome::AlreadyRunning);
    assert_eq!(source.listings(), 1);
    assert_eq!(stage.stats().runs, 1);

    // the guard is released once the first run returns
    source.push_chunk(ChunkScript::new("c4", 10, vec![ev(10_800)]));
    assert!(matches!(run(&stage).await, JobOutcome::Completed(_)));
}

#[tokio::test]
async fn test_out_of_space_skip_keeps_everything() {
    let f = fixture(
        three_chunks(),
        mts().with_free_space(100),
        0,
        OutOfSpacePolicy::Skip,
    );
    let outcome = run(&f.stage).await;
    let report = outcome.report().expect("completed");
    assert!(report.stopped_early);
    assert!(!report.committed);
    assert_eq!(report.chunks_moved, 0);
    assert_eq!(report.chunks_given_up, 0);
    assert!(f.source.deleted().is_empty());
    assert_eq!(f.source.remaining(), vec!["c1", "c2", "c3"]);
    assert_eq!(f.dest.counters().appends, 0);
    assert_eq!(f.dest.counters().commits, 0);
    assert_eq!(f.stage.stats().out_of_space_deletions, 0);
}

#[tokio::test]
async fn test_out_of_space_delete_gives_up_every_chunk() {
    let f = fixture(
        three_chunks(),
        mts().with_free_space(100),
        2,
        OutOfSpacePolicy::Delete,
    );
    let report = run(&f.stage).await.report().cloned().expect("completed");
    assert_eq!(report.chunks_given_up, 3);
    assert_eq!(report.chunks_deleted, 3);
    assert_eq!(report.bytes_moved, 0);
    assert!(!report.committed);
    assert_eq!(f.source.deleted(), vec!["c1", "c2", "c3"]);
    assert!(f.dest.committed().is_empty());
    assert_eq!(f.stage.stats().out_of_space_deletions, 3);
    assert_eq!(f.stage.metrics().out_of_space_deletions(), 3);
}

#[tokio::test]
async fn test_default_policy_depends_on_index() {
    let first = fixture(three_chunks(), mts().with_free_space(100), 0, OutOfSpacePolicy::DeleteIfFirstTier);
    let report = run(&first.stage).await.report().cloned().expect("completed");
    assert_eq!(report.chunks_given_up, 3);

    let later = fixture(three_chunks(), mts().with_free_space(100), 1, OutOfSpacePolicy::DeleteIfFirstTier);
    let report = run(&later.stage).await.report().cloned().expect("completed");
    assert_eq!(report.chunks_given_up, 0);
    assert!(report.stopped_early);
    assert_eq!(later.source.remaining().len(), 3);
}

#[tokio::test]
async fn test_free_space_must_cover_margin() {
    let exact = fixture(
        three_chunks(),
        mts().with_free_space(10 + FREE_SPACE_MARGIN_BYTES),
        1,
        OutOfSpacePolicy::Skip,
    );
    let report = run(&exact.stage).await.report().cloned().expect("completed");
    assert_eq!(report.chunks_moved, 3);

    let short = fixture(
        three_chunks(),
        mts().with_free_space(10 + FREE_SPACE_MARGIN_BYTES - 1),
        1,
        OutOfSpacePolicy::Skip,
    );
    let report = run(&short.stage).await.report().cloned().expect("completed");
    assert_eq!(report.chunks_moved, 0);
}

#[tokio::test]
async fn test_failed_space_check_writes_anyway() {
    let f = fixture(three_chunks(), mts().with_failing_space_check(), 0, OutOfSpacePolicy::Skip);
    let report = run(&f.stage).await.report().cloned().expect("completed");
    assert_eq!(report.chunks_moved, 3);
}

#[tokio::test]
async fn test_stream_error_with_delete_continues() {
    let mut chunks = three_chunks();
    chunks[1] = chunks[1].clone().failing_after(1);
    let f = fixture(chunks, mts(), 0, OutOfSpacePolicy::Delete);
    let report = run(&f.stage).await.report().cloned().expect("completed");
    assert_eq!(report.chunks_moved, 2);
    assert_eq!(report.chunks_given_up, 1);
    assert_eq!(f.source.deleted(), vec!["c1", "c2", "c3"]);
    let committed: Vec<f64> = f.dest.committed().iter().map(|e| e.value).collect();
    assert_eq!(committed, vec![0.0, 1.0, 7200.0, 7201.0]);
}

#[tokio::test]
async fn test_stream_error_with_skip_stops_in_order() {
    let mut chunks = three_chunks();
    chunks[1] = chunks[1].clone().failing_after(1);
    let f = fixture(chunks, mts(), 0, OutOfSpacePolicy::Skip);
    let report = run(&f.stage).await.report().cloned().expect("completed");
    assert!(report.stopped_early);
    assert_eq!(report.chunks_moved, 1);
    assert_eq!(f.source.deleted(), vec!["c1"]);
    assert_eq!(f.source.remaining(), vec!["c2", "c3"]);
    assert_eq!(f.dest.committed().len(), 2);
}

#[tokio::test]
async fn test_failed_commit_keeps_sources() {
    let f = fixture(three_chunks(), mts(), 0, OutOfSpacePolicy::default());
    f.dest.set_fail_commit(true);
    let report = run(&f.stage).await.report().cloned().expect("completed");
    assert!(!report.committed);
    assert_eq!(report.chunks_moved, 0);
    assert_eq!(report.bytes_moved, 0);
    assert!(f.source.deleted().is_empty());
    assert_eq!(f.source.remaining().len(), 3);
}

#[tokio::test]
async fn test_post_processor_failure_is_swallowed() {
    let f = fixture(three_chunks(), mts(), 0, OutOfSpacePolicy::default());
    f.dest.set_fail_post_processors(true);
    let outcome = run(&f.stage).await;
    assert!(!outcome.is_failed());
    assert_eq!(f.source.deleted().len(), 3);
    assert!(f.stage.last_failure().is_none());
}

#[tokio::test]
async fn test_deletion_failure_is_recorded() {
    let f = fixture(three_chunks(), mts(), 0, OutOfSpacePolicy::default());
    f.source.set_fail_deletion(true);
    let report = run(&f.stage).await.report().cloned().expect("completed");
    assert_eq!(report.chunks_deleted, 0);
    assert_eq!(f.dest.committed().len(), 6);
    let failure = f.stage.last_failure().expect("failure recorded");
    assert!(failure.message.contains("deleting from sts failed"));
}

#[tokio::test]
async fn test_panic_becomes_failure_and_releases_guard() {
    let f = fixture(three_chunks(), mts(), 0, OutOfSpacePolicy::default());
    f.dest.set_panic_on_append(true);
    match run(&f.stage).await {
        JobOutcome::Failed(message) => assert!(message.contains("panicked")),
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(!f.stage.is_running());
    assert!(f.stage.last_failure().is_some());
    assert!(f.source.deleted().is_empty());

    f.dest.set_panic_on_append(false);
    assert!(matches!(run(&f.stage).await, JobOutcome::Completed(_)));
    assert!(f.stage.last_failure().is_none());
}
