use archiver_etl::{ChainRunState, EtlConfig, Interval, JobOutcome};
use archiver_etl_testkit::{gaps, init_test_logging, parity_samples, FailoverRig, Parity};
use chrono::{DateTime, Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;

const PV: &str = "failover:pv";

fn window() -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc.with_ymd_and_hms(2023, 3, 1, 0, 0, 0).unwrap();
    (start, start + Duration::days(2))
}

fn year_end_month() -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc.with_ymd_and_hms(2022, 12, 15, 0, 0, 0).unwrap();
    (start, Utc.with_ymd_and_hms(2023, 1, 15, 0, 0, 0).unwrap())
}

fn imported(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Interval> {
    Interval::new(start.timestamp_millis(), end.timestamp_millis())
        .into_iter()
        .collect()
}

fn far_future() -> DateTime<Utc> {
    Utc::now() + Duration::days(3_650)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_merged_chain_fills_every_second() {
    init_test_logging();
    let rig = FailoverRig::new(PV);
    let (start, end) = window();
    let total = rig.seed(start, end);

    let registry = rig.registry(EtlConfig::new()).unwrap();
    registry.manual_control();
    assert_eq!(registry.discover().await, 1);

    let run = registry.run_pv_etls(PV, far_future()).await.unwrap();
    assert_eq!(run.state, ChainRunState::Done);

    let merged = rig
        .primary_lts
        .events_between(PV, start - Duration::days(730), end + Duration::days(730));
    assert_eq!(merged.len(), total);
    assert!(gaps(&merged, Duration::seconds(1)).is_empty());
    assert_eq!(merged.first().map(|e| e.timestamp), Some(start));
    assert_eq!(merged.last().map(|e| e.timestamp), Some(end - Duration::seconds(1)));

    assert!(rig.primary_sts.events(PV).is_empty());
    assert!(rig.primary_mts.events(PV).is_empty());
    // the peer is read, never written
    assert_eq!(rig.peer_sts.events(PV).len(), total / 2);

    let latest = registry.latest_event(PV).await.unwrap().unwrap();
    assert_eq!(latest.timestamp, end - Duration::seconds(1));
    assert_eq!(registry.gating().intervals("peer-sts:failover:pv"), imported(start, end));
    registry.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_month_across_year_boundary_fills_every_second() {
    init_test_logging();
    let rig = FailoverRig::new(PV);
    let (start, end) = year_end_month();
    let total = rig.seed(start, end);
    assert_eq!(total, 31 * 86_400);

    let registry = rig.registry(EtlConfig::new()).unwrap();
    registry.manual_control();
    assert_eq!(registry.discover().await, 1);

    let run = registry.run_pv_etls(PV, far_future()).await.unwrap();
    assert_eq!(run.state, ChainRunState::Done);
    let merge_stage = run.outcomes[1].report().expect("merge stage completed");
    assert_eq!(merge_stage.chunks_moved, 31);
    assert!(!merge_stage.stopped_early);

    let merged = rig
        .primary_lts
        .events_between(PV, start - Duration::days(730), end + Duration::days(730));
    assert_eq!(merged.len(), total);
    assert!(gaps(&merged, Duration::seconds(1)).is_empty());
    assert!(merged.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    assert_eq!(merged.first().map(|e| e.timestamp), Some(start));
    assert_eq!(merged.last().map(|e| e.timestamp), Some(end - Duration::seconds(1)));
    // one yearly partition on each side of new year
    assert_eq!(rig.primary_lts.partition_count(PV), 2);

    assert!(rig.primary_sts.events(PV).is_empty());
    assert!(rig.primary_mts.events(PV).is_empty());
    assert_eq!(registry.gating().intervals("peer-sts:failover:pv"), imported(start, end));

    // nothing left to do on a second pass
    let again = registry.run_pv_etls(PV, far_future()).await.unwrap();
    assert!(again.outcomes.iter().all(|o| *o == JobOutcome::NothingReady));
    assert_eq!(rig.primary_lts.events(PV).len(), total);
    registry.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_day_missing_on_peer_stays_behind() {
    init_test_logging();
    let rig = FailoverRig::new(PV);
    let (start, end) = window();
    let total = rig.seed(start, end);
    let extra = rig.seed_primary_only(end, end + Duration::days(1));

    let registry = rig.registry(EtlConfig::new()).unwrap();
    registry.manual_control();
    registry.discover().await;

    let run = registry.run_pv_etls(PV, far_future()).await.unwrap();
    let merge_stage = run.outcomes[1].report().expect("merge stage completed");
    assert!(merge_stage.stopped_early);
    assert_eq!(merge_stage.chunks_moved, 2);
    assert!(matches!(run.outcomes[0], JobOutcome::Completed(_)));

    assert_eq!(rig.primary_lts.events(PV).len(), total);
    assert_eq!(rig.primary_mts.events(PV).len(), extra);
    assert_eq!(rig.primary_mts.partition_count(PV), 1);

    // once the peer catches up the remaining day goes through
    rig.peer_sts
        .insert_events(PV, parity_samples(end, end + Duration::days(1), Parity::Odd));
    registry.run_pv_etls(PV, far_future()).await.unwrap();
    let merged = rig.primary_lts.events(PV);
    assert_eq!(merged.len(), total + 2 * extra);
    assert!(gaps(&merged, Duration::seconds(1)).is_empty());
    registry.shutdown();
}
