//! End-to-end scenarios for the retryable-request deduplication index,
//! driven through the public surface the consensus replica uses: register,
//! replication_finished, bootstrap, and the log-GC poll.

use std::sync::Arc;
use std::time::Duration;

use keel_consensus::consensus::{
    ClientId, CoarseTimePoint, ConsensusError, ConsensusRound, IndexCounts, ManualTimeSource,
    OpId, ReplicateMsg, RequestId, RestartSafeClock, RetryableRequestSettings, RetryableRequests,
    RetryableRequestsMetrics,
};

const CLIENT: ClientId = ClientId::from_parts(0x11, 0x22);

struct Tablet {
    index: RetryableRequests,
    source: Arc<ManualTimeSource>,
    settings: Arc<RetryableRequestSettings>,
    metrics: Arc<RetryableRequestsMetrics>,
}

fn tablet() -> Tablet {
    let source = Arc::new(ManualTimeSource::new(Duration::from_secs(10_000)));
    let settings = Arc::new(RetryableRequestSettings::default());
    let mut index = RetryableRequests::with_clock_and_settings(
        "T tablet-1 P peer-1: ",
        RestartSafeClock::new(source.clone()),
        settings.clone(),
    );
    let metrics = Arc::new(RetryableRequestsMetrics::new());
    index.set_metrics(metrics.clone());
    Tablet {
        index,
        source,
        settings,
        metrics,
    }
}

fn write_msg(op_index: i64, request_id: RequestId, min_running: RequestId) -> ReplicateMsg {
    ReplicateMsg::write_op(OpId::new(1, op_index), CLIENT, request_id, min_running)
}

fn register(tablet: &mut Tablet, msg: &ReplicateMsg) -> Result<bool, ConsensusError> {
    let round = ConsensusRound::detached(msg.clone());
    tablet.index.register(&round, CoarseTimePoint::UNSET)
}

fn commit(tablet: &mut Tablet, msg: &ReplicateMsg) {
    assert_eq!(register(tablet, msg).expect("register"), true);
    tablet.index.replication_finished(msg, &Ok(()), 1);
}

fn assert_already_present(tablet: &mut Tablet, msg: &ReplicateMsg) {
    match register(tablet, msg) {
        Err(ConsensusError::AlreadyPresent(_)) => {}
        other => panic!("expected AlreadyPresent, got {other:?}"),
    }
}

#[test]
fn contiguous_commits_collapse_into_one_range() {
    let mut tablet = tablet();
    commit(&mut tablet, &write_msg(10, 1, 0));
    commit(&mut tablet, &write_msg(11, 2, 0));

    assert_eq!(tablet.metrics.replicated_retryable_request_ranges(), 1);
    assert_eq!(tablet.index.debug_counts().replicated, 1);
    assert_already_present(&mut tablet, &write_msg(12, 1, 0));
    assert_already_present(&mut tablet, &write_msg(13, 2, 0));
    assert_eq!(
        tablet.index.clean_expired_replicated_and_get_min_op_id(),
        OpId::new(1, 10)
    );
}

#[test]
fn closing_a_gap_joins_ranges() {
    let mut tablet = tablet();
    commit(&mut tablet, &write_msg(10, 1, 0));
    commit(&mut tablet, &write_msg(11, 2, 0));
    commit(&mut tablet, &write_msg(12, 4, 0));
    assert_eq!(tablet.metrics.replicated_retryable_request_ranges(), 2);

    commit(&mut tablet, &write_msg(13, 3, 0));
    assert_eq!(tablet.metrics.replicated_retryable_request_ranges(), 1);
    for id in 1..=4 {
        assert_already_present(&mut tablet, &write_msg(20 + id as i64, id, 0));
    }
    assert_eq!(
        tablet.index.clean_expired_replicated_and_get_min_op_id(),
        OpId::new(1, 10)
    );
}

#[test]
fn range_time_limit_keeps_ranges_apart() {
    let mut tablet = tablet();
    tablet.settings.set_range_time_limit_secs(1);

    commit(&mut tablet, &write_msg(10, 1, 0));
    tablet.source.advance(Duration::from_secs(2));
    commit(&mut tablet, &write_msg(11, 2, 0));

    assert_eq!(tablet.metrics.replicated_retryable_request_ranges(), 2);
    assert_eq!(tablet.index.debug_counts().replicated, 2);
}

#[tokio::test]
async fn duplicate_of_a_successful_request_is_told_already_present() {
    let mut tablet = tablet();
    let msg = write_msg(10, 5, 0);

    let (primary, primary_rx) = ConsensusRound::new(msg.clone());
    assert_eq!(
        tablet
            .index
            .register(&primary, CoarseTimePoint::UNSET)
            .expect("register"),
        true
    );

    let (duplicate, duplicate_rx) = ConsensusRound::new(msg.clone());
    assert_eq!(
        tablet
            .index
            .register(&duplicate, CoarseTimePoint::UNSET)
            .expect("register duplicate"),
        false
    );

    tablet.index.replication_finished(&msg, &Ok(()), 3);
    // The consensus layer itself resolves the primary round.
    primary.notify_replication_finished(Ok(()), 3, Some(vec![msg.id]));

    let primary_outcome = primary_rx.await.expect("primary outcome");
    assert!(primary_outcome.status.is_ok());
    assert_eq!(primary_outcome.applied_op_ids.as_deref(), Some(&[msg.id][..]));

    let duplicate_outcome = duplicate_rx.await.expect("duplicate outcome");
    match duplicate_outcome.status {
        Err(ConsensusError::AlreadyPresent(message)) => assert_eq!(message, "Duplicate request"),
        other => panic!("unexpected duplicate status: {other:?}"),
    }
    assert_eq!(duplicate_outcome.leader_term, 3);
    assert!(duplicate_outcome.applied_op_ids.is_none());
}

#[test]
fn every_deferred_duplicate_is_notified_exactly_once() {
    let mut tablet = tablet();
    let msg = write_msg(10, 5, 0);
    assert_eq!(register(&mut tablet, &msg).expect("register"), true);

    let mut receivers = Vec::new();
    for _ in 0..3 {
        let (round, rx) = ConsensusRound::new(msg.clone());
        assert_eq!(
            tablet
                .index
                .register(&round, CoarseTimePoint::UNSET)
                .expect("register duplicate"),
            false
        );
        receivers.push(rx);
    }

    tablet.index.replication_finished(&msg, &Ok(()), 2);
    for mut rx in receivers {
        let outcome = rx.try_recv().expect("one notification per duplicate");
        assert!(matches!(
            outcome.status,
            Err(ConsensusError::AlreadyPresent(_))
        ));
        assert!(rx.try_recv().is_err(), "no second notification");
    }
}

#[test]
fn watermark_advance_trims_and_expires() {
    let mut tablet = tablet();
    for id in 10..=20 {
        commit(&mut tablet, &write_msg(100 + id as i64, id, 0));
    }
    assert_eq!(tablet.metrics.replicated_retryable_request_ranges(), 1);

    commit(&mut tablet, &write_msg(130, 21, 15));

    // Below the watermark: terminally rejected, carrying the watermark.
    match register(&mut tablet, &write_msg(131, 12, 15)) {
        Err(ConsensusError::Expired {
            request_id,
            min_running_request_id,
        }) => {
            assert_eq!(request_id, 12);
            assert_eq!(min_running_request_id, 15);
        }
        other => panic!("expected Expired, got {other:?}"),
    }

    // The surviving range now starts at the watermark.
    assert_already_present(&mut tablet, &write_msg(132, 15, 15));
    assert_already_present(&mut tablet, &write_msg(133, 21, 15));
    assert_eq!(
        tablet.index.min_running_request_id(CLIENT).expect("known"),
        15
    );
}

#[test]
fn gc_drops_aged_ranges_and_reports_the_survivor_floor() {
    let mut tablet = tablet();
    commit(&mut tablet, &write_msg(10, 1, 0));
    tablet.source.advance(Duration::from_secs(170));
    commit(&mut tablet, &write_msg(20, 3, 0));
    tablet.source.advance(Duration::from_secs(30));

    assert_eq!(
        tablet.index.clean_expired_replicated_and_get_min_op_id(),
        OpId::new(1, 20)
    );
    assert_eq!(tablet.index.debug_counts().replicated, 1);
    assert!(
        tablet.index.min_running_request_id(CLIENT).is_ok(),
        "client must outlive its expired ranges"
    );
}

#[test]
fn quiet_clients_are_forgotten_and_the_log_is_released() {
    let mut tablet = tablet();
    commit(&mut tablet, &write_msg(10, 1, 0));

    tablet.source.advance(Duration::from_secs(130));
    assert_eq!(
        tablet.index.clean_expired_replicated_and_get_min_op_id(),
        OpId::MAX
    );

    tablet.source.advance(Duration::from_secs(130));
    assert_eq!(
        tablet.index.clean_expired_replicated_and_get_min_op_id(),
        OpId::MAX
    );
    assert!(matches!(
        tablet.index.min_running_request_id(CLIENT),
        Err(ConsensusError::NotFound(_))
    ));
    assert_eq!(tablet.index.debug_counts(), IndexCounts::default());
    assert_eq!(tablet.metrics.running_retryable_requests(), 0);
    assert_eq!(tablet.metrics.replicated_retryable_request_ranges(), 0);
}

#[test]
fn successful_requests_stay_rejected_but_failures_clear() {
    let mut tablet = tablet();

    let committed = write_msg(10, 1, 0);
    commit(&mut tablet, &committed);
    assert_already_present(&mut tablet, &committed);

    let aborted = write_msg(11, 2, 0);
    assert_eq!(register(&mut tablet, &aborted).expect("register"), true);
    tablet.index.replication_finished(
        &aborted,
        &Err(ConsensusError::Aborted("term changed".to_string())),
        1,
    );
    assert_eq!(
        register(&mut tablet, &aborted).expect("register after failure"),
        true,
        "failure must clear state and re-admit the id"
    );
}

#[test]
fn non_write_rounds_pass_through_untracked() {
    let mut tablet = tablet();
    let round = ConsensusRound::detached(ReplicateMsg::no_op(OpId::new(1, 1)));
    assert_eq!(
        tablet
            .index
            .register(&round, CoarseTimePoint::UNSET)
            .expect("register"),
        true
    );
    tablet
        .index
        .replication_finished(&ReplicateMsg::no_op(OpId::new(1, 1)), &Ok(()), 1);
    assert_eq!(tablet.index.debug_counts(), IndexCounts::default());
}

#[test]
fn bootstrap_replay_matches_live_replication() {
    let mut tablet = tablet();
    let replay_time = tablet.index.clock().now();
    for id in 1..=5 {
        tablet
            .index
            .bootstrap(&write_msg(10 + id as i64, id, 0), replay_time);
    }
    tablet
        .index
        .bootstrap(&ReplicateMsg::no_op(OpId::new(1, 16)), replay_time);

    assert_eq!(tablet.index.debug_counts().replicated, 1);
    assert_eq!(tablet.index.debug_counts().running, 0);
    for id in 1..=5 {
        assert_already_present(&mut tablet, &write_msg(20 + id as i64, id, 0));
    }
    assert_eq!(
        tablet.index.clean_expired_replicated_and_get_min_op_id(),
        OpId::new(1, 11)
    );
}

#[test]
fn out_of_order_commits_converge_with_consistent_gauges() {
    let mut tablet = tablet();
    // Deterministic permutation of 1..=60: 7 is a primitive root mod 61.
    let mut id: u64 = 1;
    for i in 0..60 {
        id = id * 7 % 61;
        commit(&mut tablet, &write_msg(100 + i, id, 0));
        let counts = tablet.index.debug_counts();
        assert_eq!(counts.running, 0);
        assert_eq!(
            tablet.metrics.replicated_retryable_request_ranges(),
            counts.replicated as i64,
            "gauge must track the table after every operation"
        );
    }

    assert_eq!(tablet.index.debug_counts().replicated, 1);
    assert_eq!(
        tablet.index.clean_expired_replicated_and_get_min_op_id(),
        OpId::new(1, 100)
    );
}
