use super::fixtures::{n, nodes, Cluster};
use std::collections::BTreeSet;
use tesseradb_orchestrator::core::errors::OrchestratorError;
use tesseradb_orchestrator::core::events::BucketEvent;
use tesseradb_orchestrator::core::map::VbucketMap;
use tesseradb_orchestrator::core::service::WorkerKind;
use tesseradb_orchestrator::core::topology::{
    BucketConfig, Membership, NodeId, Service,
};

fn chain(entries: &[Option<&str>]) -> Vec<Option<NodeId>> {
    entries.iter().map(|o| o.map(NodeId::new)).collect()
}

/// The scenario S4 layout: n1 is master of vbuckets {0, 2, 4} and replica
/// of {1, 3}.
fn s4_cluster() -> Cluster {
    let cluster = Cluster::bare(&["n1", "n2", "n3"]);
    let mut bucket = BucketConfig::new_membase("default", 6, 1);
    bucket.servers = nodes(&["n1", "n2", "n3"]);
    bucket.map = VbucketMap {
        chains: vec![
            chain(&[Some("n1"), Some("n2")]),
            chain(&[Some("n2"), Some("n1")]),
            chain(&[Some("n1"), Some("n3")]),
            chain(&[Some("n3"), Some("n1")]),
            chain(&[Some("n1"), Some("n2")]),
            chain(&[Some("n2"), Some("n3")]),
        ],
    };
    cluster.sim.apply_map("default", &bucket.map);
    cluster.store.insert_bucket(bucket);
    cluster
}

#[tokio::test]
async fn test_graceful_failover_drains_then_fails_over() {
    let cluster = s4_cluster();
    let mut events = cluster.service.bus().subscribe();

    cluster.service.start_graceful_failover(&n("n1")).unwrap();
    let (kind, result) = cluster.service.wait().await.unwrap();
    assert_eq!(kind, WorkerKind::GracefulFailover);
    result.unwrap();

    // No vbucket lost a copy: every chain still has a master and no
    // data-loss audit fired.
    let bucket = cluster.bucket("default");
    for c in &bucket.map.chains {
        assert!(matches!(c.first(), Some(Some(_))));
        assert!(!c.iter().flatten().any(|node| *node == n("n1")));
    }
    while let Some(event) = events.try_recv() {
        assert!(
            !matches!(event, BucketEvent::DataLost { .. }),
            "graceful failover must not lose data"
        );
    }

    assert!(!bucket.servers.contains(&n("n1")));
    let info = cluster.store.node_info(&n("n1")).unwrap();
    assert_eq!(info.membership, Membership::InactiveFailed);

    // The drained node's vbuckets are on record for a later delta
    // recovery: it held a copy of every vbucket but 5.
    let recorded = cluster.store.failover_vbuckets(&n("n1"))["default"].clone();
    assert_eq!(recorded, BTreeSet::from([0, 1, 2, 3, 4]));
}

#[tokio::test]
async fn test_graceful_failover_rejects_replica_free_buckets() {
    let cluster = Cluster::with_bucket(&["n1", "n2"], "default", 4, 0);
    let err = cluster.service.start_graceful_failover(&n("n1")).unwrap_err();
    assert_eq!(err, OrchestratorError::NotGraceful(n("n1")));
    assert!(cluster.service.wait().await.is_none());
}

#[tokio::test]
async fn test_graceful_failover_rejects_non_kv_and_last_nodes() {
    let cluster = Cluster::with_bucket(&["n1", "n2"], "default", 4, 1);
    cluster.store.add_node(
        n("q1"),
        BTreeSet::from([Service::Query]),
        Membership::Active,
    );

    assert_eq!(
        cluster.service.start_graceful_failover(&n("q1")),
        Err(OrchestratorError::NonKvNode(n("q1")))
    );
    assert_eq!(
        cluster.service.start_graceful_failover(&n("nx")),
        Err(OrchestratorError::UnknownNode(n("nx")))
    );

    let lonely = Cluster::with_bucket(&["n1"], "default", 4, 1);
    assert_eq!(
        lonely.service.start_graceful_failover(&n("n1")),
        Err(OrchestratorError::LastNode(n("n1")))
    );
}

#[tokio::test]
async fn test_hard_failover_then_full_rebalance_rebuilds_replicas() {
    // After a hard failover the surviving map has holes; a rebalance over
    // the remaining nodes repairs them.
    let cluster = Cluster::with_bucket(&["n1", "n2", "n3"], "default", 48, 1);
    cluster.service.orchestrate_failover(&n("n3")).await.unwrap();

    let holes = cluster
        .bucket("default")
        .map
        .chains
        .iter()
        .filter(|c| c.iter().any(Option::is_none))
        .count();
    assert!(holes > 0, "failover should leave replica holes");

    let keep = nodes(&["n1", "n2"]);
    cluster
        .service
        .start_rebalance(
            keep.clone(),
            nodes(&[]),
            nodes(&[]),
            nodes(&[]),
            tesseradb_orchestrator::core::recovery::DeltaRecoveryRequest::Buckets(Vec::new()),
        )
        .unwrap();
    cluster.service.wait().await.unwrap().1.unwrap();

    let bucket = cluster.bucket("default");
    assert!(!tesseradb_orchestrator::core::map::algebra::unbalanced(
        &bucket.map,
        &keep
    ));
    bucket.map.check_integrity(&keep).unwrap();
}
