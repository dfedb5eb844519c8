use super::fixtures::{n, nodes, Cluster};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tesseradb_orchestrator::core::errors::OrchestratorError;
use tesseradb_orchestrator::core::events::BucketEvent;
use tesseradb_orchestrator::core::map::algebra::unbalanced;
use tesseradb_orchestrator::core::recovery::DeltaRecoveryRequest;
use tesseradb_orchestrator::core::service::WorkerKind;
use tesseradb_orchestrator::core::topology::BucketKind;

fn no_delta() -> DeltaRecoveryRequest {
    DeltaRecoveryRequest::Buckets(Vec::new())
}

#[tokio::test]
async fn test_rebalance_three_to_four_nodes() {
    // Scenario S1 at full size: 1024 vbuckets, one replica, add n4.
    let cluster = Cluster::with_bucket(&["n1", "n2", "n3"], "default", 1024, 1);
    cluster.add_node("n4");

    let keep = nodes(&["n1", "n2", "n3", "n4"]);
    cluster
        .service
        .start_rebalance(keep.clone(), nodes(&[]), nodes(&[]), nodes(&[]), no_delta())
        .unwrap();
    let (kind, result) = cluster.service.wait().await.unwrap();
    assert_eq!(kind, WorkerKind::Rebalance);
    result.unwrap();

    let bucket = cluster.bucket("default");
    assert_eq!(bucket.servers, keep);
    assert!(bucket.fast_forward_map.is_none());
    assert!(!unbalanced(&bucket.map, &keep));
    bucket.map.check_integrity(&keep).unwrap();

    let masters = bucket.map.master_counts();
    for node in &keep {
        assert_eq!(masters.get(node).copied().unwrap_or(0), 256);
    }
}

#[tokio::test]
async fn test_rebalance_on_balanced_cluster_moves_nothing() {
    let cluster = Cluster::with_bucket(&["n1", "n2", "n3"], "default", 96, 1);
    let before = cluster.bucket("default").map;

    let keep = nodes(&["n1", "n2", "n3"]);
    let mut events = cluster.service.bus().subscribe();
    cluster
        .service
        .start_rebalance(keep, nodes(&[]), nodes(&[]), nodes(&[]), no_delta())
        .unwrap();
    cluster.service.wait().await.unwrap().1.unwrap();

    assert_eq!(cluster.bucket("default").map, before);
    assert_eq!(cluster.sim.takeover_count(), 0);
    assert_eq!(cluster.sim.deletion_count(), 0);
    loop {
        match events.try_recv() {
            Some(BucketEvent::MapCommitted { bucket, moves }) => {
                assert_eq!(bucket, "default");
                assert_eq!(moves, 0);
                break;
            }
            Some(_) => continue,
            None => panic!("expected a MapCommitted event"),
        }
    }
}

#[tokio::test]
async fn test_rebalance_out_ejects_the_node() {
    let cluster = Cluster::with_bucket(&["n1", "n2", "n3"], "default", 64, 1);

    let keep = nodes(&["n1", "n2"]);
    cluster
        .service
        .start_rebalance(keep.clone(), nodes(&["n3"]), nodes(&[]), nodes(&[]), no_delta())
        .unwrap();
    cluster.service.wait().await.unwrap().1.unwrap();

    let bucket = cluster.bucket("default");
    assert_eq!(bucket.servers, keep);
    assert!(!bucket.map.nodes().contains(&n("n3")));
    assert!(!unbalanced(&bucket.map, &keep));
    // The orchestrator ejected the node after the move.
    assert!(!cluster.store.contains_node(&n("n3")));
}

#[tokio::test]
async fn test_memcached_bucket_just_commits_servers() {
    let cluster = Cluster::with_bucket(&["n1", "n2"], "default", 32, 1);
    let mut mc = tesseradb_orchestrator::core::topology::BucketConfig::new_memcached("mc");
    mc.servers = nodes(&["n1", "n2"]);
    cluster.store.insert_bucket(mc);
    cluster.add_node("n3");

    let keep = nodes(&["n1", "n2", "n3"]);
    cluster
        .service
        .start_rebalance(keep.clone(), nodes(&[]), nodes(&[]), nodes(&[]), no_delta())
        .unwrap();
    cluster.service.wait().await.unwrap().1.unwrap();

    let mc = cluster.bucket("mc");
    assert_eq!(mc.kind, BucketKind::Memcached);
    assert_eq!(mc.servers, keep);
}

#[tokio::test]
async fn test_rebalance_fails_on_replica_mismatch() {
    let cluster = Cluster::with_bucket(&["n1", "n2"], "default", 16, 1);
    cluster.add_node("n3");
    // n1 will report a stream the committed map cannot imply.
    cluster.sim.override_replicators(
        "default",
        &n("n1"),
        BTreeSet::from([(n("n3"), n("n1"), 999)]),
    );

    cluster
        .service
        .start_rebalance(
            nodes(&["n1", "n2", "n3"]),
            nodes(&[]),
            nodes(&[]),
            nodes(&[]),
            no_delta(),
        )
        .unwrap();
    let (_, result) = cluster.service.wait().await.unwrap();
    assert_eq!(result.unwrap_err(), OrchestratorError::BadReplicas);
}

#[tokio::test]
async fn test_stop_mid_rebalance_and_resume() {
    // Scenario S7: stop while the mover is running, then finish the
    // transition with a second rebalance.
    let cluster = Cluster::with_bucket(&["n1", "n2", "n3"], "default", 256, 1);
    cluster.add_node("n4");
    cluster.sim.set_latency(Duration::from_millis(10));
    let before = cluster.bucket("default").map;

    let keep = nodes(&["n1", "n2", "n3", "n4"]);
    cluster
        .service
        .start_rebalance(keep.clone(), nodes(&[]), nodes(&[]), nodes(&[]), no_delta())
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let stop_sent = Instant::now();
    cluster.service.stop();
    let (_, result) = cluster.service.wait().await.unwrap();
    assert_eq!(result.unwrap_err(), OrchestratorError::Stopped);
    // The cancellation bound: well inside query_states_timeout + 5s.
    assert!(stop_sent.elapsed() < Duration::from_secs(5));

    // The transition is parked, not rolled back.
    let parked = cluster.bucket("default");
    assert_eq!(parked.map, before);
    assert!(parked.fast_forward_map.is_some());

    // A subsequent rebalance completes it.
    cluster.sim.set_latency(Duration::ZERO);
    cluster
        .service
        .start_rebalance(keep.clone(), nodes(&[]), nodes(&[]), nodes(&[]), no_delta())
        .unwrap();
    cluster.service.wait().await.unwrap().1.unwrap();

    let finished = cluster.bucket("default");
    assert!(finished.fast_forward_map.is_none());
    assert!(!unbalanced(&finished.map, &keep));
}

#[tokio::test]
async fn test_rebalance_reports_progress() {
    let cluster = Cluster::with_bucket(&["n1", "n2"], "default", 64, 1);
    cluster.add_node("n3");
    let progress = cluster.service.progress();

    cluster
        .service
        .start_rebalance(
            nodes(&["n1", "n2", "n3"]),
            nodes(&[]),
            nodes(&[]),
            nodes(&[]),
            no_delta(),
        )
        .unwrap();
    cluster.service.wait().await.unwrap().1.unwrap();
    assert_eq!(*progress.borrow(), 1.0);
}

#[tokio::test]
async fn test_start_rebalance_rejects_bad_plans() {
    let cluster = Cluster::with_bucket(&["n1", "n2"], "default", 16, 1);

    // An empty keep-set leaves no KV nodes.
    assert_eq!(
        cluster
            .service
            .start_rebalance(nodes(&[]), nodes(&[]), nodes(&[]), nodes(&[]), no_delta()),
        Err(OrchestratorError::NoKvNodesLeft)
    );

    // Unknown nodes are rejected before any worker exists.
    assert_eq!(
        cluster.service.start_rebalance(
            nodes(&["n1", "n2", "nx"]),
            nodes(&[]),
            nodes(&[]),
            nodes(&[]),
            no_delta()
        ),
        Err(OrchestratorError::UnknownNode(n("nx")))
    );
    assert!(cluster.service.wait().await.is_none());
}

#[tokio::test]
async fn test_delta_recovery_round_trip() {
    // Scenario S5 end to end: fail n3 over, bring it back delta, land it on
    // exactly the vbuckets it held.
    let cluster = Cluster::with_bucket(&["n1", "n2", "n3"], "default", 24, 1);
    let committed = cluster.bucket("default").map;

    cluster.service.orchestrate_failover(&n("n3")).await.unwrap();
    let recorded = cluster.store.failover_vbuckets(&n("n3"))["default"].clone();
    assert!(!recorded.is_empty());

    cluster.store.set_recovery(
        &n("n3"),
        tesseradb_orchestrator::core::topology::RecoveryKind::Delta,
    );
    cluster
        .service
        .start_rebalance(
            nodes(&["n1", "n2", "n3"]),
            nodes(&[]),
            nodes(&[]),
            nodes(&["n3"]),
            DeltaRecoveryRequest::All,
        )
        .unwrap();
    cluster.service.wait().await.unwrap().1.unwrap();

    let bucket = cluster.bucket("default");
    assert_eq!(bucket.map, committed);
    assert_eq!(bucket.map.vbuckets_of(&n("n3")), recorded);
    assert!(bucket.delta_recovery_map.is_none());

    let info = cluster.store.node_info(&n("n3")).unwrap();
    assert_eq!(
        info.membership,
        tesseradb_orchestrator::core::topology::Membership::Active
    );
}

#[tokio::test]
async fn test_delta_recovery_rejected_without_history() {
    // Scenario S6: no compatible past map, so the start API refuses.
    let cluster = Cluster::with_unrecorded_bucket(&["n1", "n2", "n3"], "default", 24, 1);
    cluster.service.orchestrate_failover(&n("n3")).await.unwrap();
    cluster.store.set_recovery(
        &n("n3"),
        tesseradb_orchestrator::core::topology::RecoveryKind::Delta,
    );

    let err = cluster
        .service
        .start_rebalance(
            nodes(&["n1", "n2", "n3"]),
            nodes(&[]),
            nodes(&[]),
            nodes(&["n3"]),
            DeltaRecoveryRequest::All,
        )
        .unwrap_err();
    assert_eq!(err, OrchestratorError::DeltaRecoveryNotPossible);
    assert!(cluster.service.wait().await.is_none());
}
