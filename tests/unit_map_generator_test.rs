use std::collections::{BTreeMap, BTreeSet};
use tesseradb_orchestrator::core::errors::OrchestratorError;
use tesseradb_orchestrator::core::map::algebra::{unbalanced, vbucket_movements};
use tesseradb_orchestrator::core::map::generator::{
    generate_bucket_map, generate_initial_map, MapOptions,
};
use tesseradb_orchestrator::core::map::history::MapHistory;
use tesseradb_orchestrator::core::map::VbucketMap;
use tesseradb_orchestrator::core::topology::{BucketConfig, NodeId, ServerGroups};

fn n(name: &str) -> NodeId {
    NodeId::new(name)
}

fn nodes(names: &[&str]) -> BTreeSet<NodeId> {
    names.iter().map(NodeId::new).collect()
}

/// The starting map of scenario S1: round-robin masters with the replica
/// offset by one position.
fn round_robin_map(num_vbuckets: usize, names: &[&str]) -> VbucketMap {
    let chains = (0..num_vbuckets)
        .map(|vb| {
            vec![
                Some(NodeId::new(names[vb % names.len()])),
                Some(NodeId::new(names[(vb + 1) % names.len()])),
            ]
        })
        .collect();
    VbucketMap { chains }
}

fn assert_balance(map: &VbucketMap, keep: &BTreeSet<NodeId>, num_vbuckets: usize, replicas: usize) {
    let masters = map.master_counts();
    let replicas_per_node = map.replica_counts();
    let k = keep.len();
    for node in keep {
        let m = masters.get(node).copied().unwrap_or(0) as i64;
        let r = replicas_per_node.get(node).copied().unwrap_or(0) as i64;
        let master_quota = (num_vbuckets / k) as i64;
        let replica_quota = (num_vbuckets * replicas / k) as i64;
        assert!(
            (m - master_quota).abs() <= 1,
            "node {node} holds {m} masters, quota {master_quota}"
        );
        assert!(
            (r - replica_quota).abs() <= 1,
            "node {node} holds {r} replicas, quota {replica_quota}"
        );
    }
}

#[test]
fn test_initial_map_is_balanced() {
    let keep = nodes(&["n1", "n2", "n3"]);
    let bucket = BucketConfig::new_membase("b", 64, 1);
    let (map, _) = generate_initial_map(&bucket, &keep, &ServerGroups::default()).unwrap();

    map.check_integrity(&keep).unwrap();
    assert!(!unbalanced(&map, &keep));
    assert_balance(&map, &keep, 64, 1);
}

#[test]
fn test_generation_is_deterministic() {
    let keep = nodes(&["n1", "n2", "n3", "n4"]);
    let mut bucket = BucketConfig::new_membase("b", 128, 2);
    bucket.map = round_robin_map(128, &["n1", "n2", "n3"]);
    // A three-entry chain is expected; pad the seeded two-entry chains.
    for chain in &mut bucket.map.chains {
        chain.push(None);
    }

    let history = MapHistory::new(4);
    let (a, _) = generate_bucket_map(&bucket, &keep, &ServerGroups::default(), &history).unwrap();
    let (b, _) = generate_bucket_map(&bucket, &keep, &ServerGroups::default(), &history).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_three_to_four_node_rebalance() {
    // Scenario S1, scaled at full size: 1024 vbuckets, one replica.
    let keep = nodes(&["n1", "n2", "n3", "n4"]);
    let mut bucket = BucketConfig::new_membase("default", 1024, 1);
    bucket.map = round_robin_map(1024, &["n1", "n2", "n3"]);

    let history = MapHistory::new(4);
    let (map, _) = generate_bucket_map(&bucket, &keep, &ServerGroups::default(), &history).unwrap();

    map.check_integrity(&keep).unwrap();
    assert!(!unbalanced(&map, &keep));
    let masters = map.master_counts();
    for node in &keep {
        assert_eq!(masters.get(node).copied().unwrap_or(0), 256);
    }

    // The move count stays in the vicinity of the minimum; a from-scratch
    // generation would touch nearly every position.
    let moves = vbucket_movements(&bucket.map, &map);
    assert!(moves >= 256, "at least the new node's share must move, got {moves}");
    assert!(moves <= 832, "movement should stay near the minimum, got {moves}");
}

#[test]
fn test_balanced_map_is_reused_verbatim() {
    let keep = nodes(&["n1", "n2", "n3"]);
    let mut bucket = BucketConfig::new_membase("b", 96, 1);
    let (map, opts) = generate_initial_map(&bucket, &keep, &ServerGroups::default()).unwrap();
    bucket.map = map.clone();
    bucket.map_opts_hash = Some(opts.opts_hash());

    let history = MapHistory::new(4);
    let (again, _) = generate_bucket_map(&bucket, &keep, &ServerGroups::default(), &history).unwrap();
    assert_eq!(map, again);
    assert_eq!(vbucket_movements(&map, &again), 0);
}

#[test]
fn test_staged_delta_recovery_map_is_honored() {
    let keep = nodes(&["n1", "n2", "n3"]);
    let mut bucket = BucketConfig::new_membase("b", 32, 1);
    let (target, opts) = generate_initial_map(&bucket, &keep, &ServerGroups::default()).unwrap();
    bucket.delta_recovery_map = Some((target.clone(), opts));
    // Current map differs from the staged target.
    bucket.map = round_robin_map(32, &["n1", "n2"]);

    let history = MapHistory::new(4);
    let (map, _) = generate_bucket_map(&bucket, &keep, &ServerGroups::default(), &history).unwrap();
    assert_eq!(map, target);
}

#[test]
fn test_tags_spread_chains_across_groups() {
    let keep = nodes(&["n1", "n2", "n3", "n4"]);
    let mut groups = ServerGroups::default();
    groups
        .groups
        .insert("rack-a".into(), nodes(&["n1", "n2"]));
    groups
        .groups
        .insert("rack-b".into(), nodes(&["n3", "n4"]));

    let bucket = BucketConfig::new_membase("b", 64, 1);
    let (map, opts) = generate_initial_map(&bucket, &keep, &groups).unwrap();
    assert!(opts.tags.is_some());

    let rack_a = nodes(&["n1", "n2"]);
    for chain in &map.chains {
        let in_a = chain
            .iter()
            .flatten()
            .filter(|node| rack_a.contains(*node))
            .count();
        // Master and replica must never share a rack here: two racks, two
        // chain positions.
        assert_eq!(in_a, 1, "chain {chain:?} does not span both racks");
    }
}

#[test]
fn test_server_groups_race_is_raised() {
    let keep = nodes(&["n1", "n2", "n3"]);
    let mut groups = ServerGroups::default();
    groups.groups.insert("rack-a".into(), nodes(&["n1"]));
    groups.groups.insert("rack-b".into(), nodes(&["n2"]));
    // n3 has no enclosing group while tags are active.

    let bucket = BucketConfig::new_membase("b", 16, 1);
    let err = generate_initial_map(&bucket, &keep, &groups).unwrap_err();
    assert_eq!(err, OrchestratorError::ServerGroupsRace);
}

#[test]
fn test_single_group_disables_tags() {
    let keep = nodes(&["n1", "n2"]);
    let mut groups = ServerGroups::default();
    groups.groups.insert("rack-a".into(), nodes(&["n1", "n2"]));

    let bucket = BucketConfig::new_membase("b", 16, 1);
    let (_, opts) = generate_initial_map(&bucket, &keep, &groups).unwrap();
    assert!(opts.tags.is_none());
}

#[test]
fn test_opts_hash_tracks_inputs() {
    let bucket = BucketConfig::new_membase("b", 16, 1);
    let groups = ServerGroups::default();
    let a = MapOptions::build(&bucket, &nodes(&["n1", "n2"]), &groups).unwrap();
    let b = MapOptions::build(&bucket, &nodes(&["n1", "n2"]), &groups).unwrap();
    let c = MapOptions::build(&bucket, &nodes(&["n1", "n3"]), &groups).unwrap();
    assert_eq!(a.opts_hash(), b.opts_hash());
    assert_ne!(a.opts_hash(), c.opts_hash());
}

#[test]
fn test_short_keep_set_pads_chains() {
    // Two nodes, two replicas requested: the third position stays open.
    let keep = nodes(&["n1", "n2"]);
    let bucket = BucketConfig::new_membase("b", 8, 2);
    let (map, _) = generate_initial_map(&bucket, &keep, &ServerGroups::default()).unwrap();

    for chain in &map.chains {
        assert_eq!(chain.len(), 3);
        assert!(chain[0].is_some());
        assert!(chain[1].is_some());
        assert!(chain[2].is_none());
    }
    assert!(!unbalanced(&map, &keep));
}

#[test]
fn test_master_counts_spread_with_remainder() {
    let keep = nodes(&["n1", "n2", "n3"]);
    let bucket = BucketConfig::new_membase("b", 16, 0);
    let (map, _) = generate_initial_map(&bucket, &keep, &ServerGroups::default()).unwrap();

    let counts: BTreeMap<NodeId, usize> = map.master_counts();
    let mut values: Vec<usize> = keep
        .iter()
        .map(|n| counts.get(n).copied().unwrap_or(0))
        .collect();
    values.sort();
    assert_eq!(values.iter().sum::<usize>(), 16);
    assert!(values[2] - values[0] <= 1);
}
