use archiver_etl::gating::{GatingScope, GatingState};
use proptest::prelude::*;

fn ranges(max_len: usize) -> impl Strategy<Value = Vec<(i64, i64)>> {
    prop::collection::vec((0i64..1_000, 1i64..50).prop_map(|(s, len)| (s, s + len)), 0..max_len)
}

#[test]
fn test_touching_intervals_merge() {
    let mut scope = GatingScope::new("failover", 10);
    scope.keep(0, 10);
    scope.keep(10, 20);
    scope.keep(30, 40);
    scope.keep(25, 30);
    let stored: Vec<(i64, i64)> = scope.intervals().iter().map(|i| (i.start(), i.end())).collect();
    assert_eq!(stored, vec![(0, 20), (25, 40)]);
}

#[test]
fn test_boundary_is_not_overlap() {
    let mut scope = GatingScope::new("failover", 10);
    scope.keep(100, 200);
    assert!(!scope.should_keep(200, 300));
    assert!(!scope.should_keep(0, 100));
    assert!(scope.should_keep(199, 300));
    assert!(scope.should_keep(150, 160));
    assert!(scope.should_keep(0, 1_000));
}

#[test]
fn test_inverted_and_empty_ranges_ignored() {
    let mut scope = GatingScope::new("failover", 10);
    scope.keep(50, 50);
    scope.keep(60, 10);
    assert!(scope.is_empty());
}

#[test]
fn test_oldest_interval_evicted_at_cap() {
    let mut scope = GatingScope::new("failover", 2);
    scope.keep(0, 10);
    scope.keep(20, 30);
    scope.keep(40, 50);
    assert_eq!(scope.len(), 2);
    assert!(!scope.should_keep(0, 10));
    assert!(scope.should_keep(20, 30));
    assert!(scope.should_keep(40, 50));
}

#[test]
fn test_scopes_are_independent_and_capped_per_scope() {
    let state = GatingState::new(3).with_scope_limit("tiny", 1);
    state.keep("tiny", 0, 10);
    state.keep("tiny", 20, 30);
    state.keep("wide", 0, 10);
    state.keep("wide", 20, 30);
    assert_eq!(state.intervals("tiny").len(), 1);
    assert_eq!(state.intervals("wide").len(), 2);
    assert!(!state.should_keep("other", 0, 100));
    assert_eq!(state.scope_names(), vec!["other", "tiny", "wide"]);
}

proptest! {
    #[test]
    fn prop_stored_intervals_are_disjoint_and_separated(raw in ranges(60)) {
        let mut scope = GatingScope::new("p", 1_000);
        for (s, e) in &raw {
            scope.keep(*s, *e);
        }
        let stored = scope.intervals();
        for w in stored.windows(2) {
            prop_assert!(w[0].start() < w[0].end());
            prop_assert!(w[0].end() < w[1].start());
        }
    }

    #[test]
    fn prop_should_keep_matches_brute_force(raw in ranges(40), q in (0i64..1_100, 1i64..80)) {
        let mut scope = GatingScope::new("p", 1_000);
        for (s, e) in &raw {
            scope.keep(*s, *e);
        }
        let (qs, qe) = (q.0, q.0 + q.1);
        let expected = raw.iter().any(|(s, e)| *e > qs && *s < qe);
        prop_assert_eq!(scope.should_keep(qs, qe), expected);
    }

    #[test]
    fn prop_every_kept_range_is_covered(raw in ranges(40)) {
        let mut scope = GatingScope::new("p", 1_000);
        for (s, e) in &raw {
            scope.keep(*s, *e);
        }
        let stored = scope.intervals();
        for (s, e) in &raw {
            prop_assert!(stored.iter().any(|i| i.start() <= *s && i.end() >= *e));
        }
    }

    #[test]
    fn prop_cap_never_exceeded(raw in ranges(60), cap in 1usize..6) {
        let mut scope = GatingScope::new("p", cap);
        for (s, e) in &raw {
            scope.keep(*s, *e);
            prop_assert!(scope.len() <= cap);
        }
    }
}
