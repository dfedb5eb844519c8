// src/core/map/algebra.rs

//! Pure functions over vbucket maps: promotion, distance, and balance
//! predicates. Nothing here touches the config store or the engine.

use super::generator::MapOptions;
use super::{Chain, VbucketMap};
use crate::core::topology::NodeId;
use std::collections::BTreeSet;

/// Removes every node in `dead_nodes` from every chain, shifting survivors
/// toward the head and padding with `None`. Surviving entries keep their
/// relative order, so replicas are promoted in chain order.
pub fn promote_replicas(map: &VbucketMap, dead_nodes: &BTreeSet<NodeId>) -> VbucketMap {
    let chains = map
        .chains
        .iter()
        .map(|chain| {
            let mut survivors: Chain = chain
                .iter()
                .filter(|entry| match entry {
                    Some(node) => !dead_nodes.contains(node),
                    None => false,
                })
                .cloned()
                .collect();
            survivors.resize(chain.len(), None);
            survivors
        })
        .collect();
    VbucketMap { chains }
}

/// Like [`promote_replicas`], but demotes `node` to the tail of any chain it
/// appears in instead of deleting it: traffic drains off the node while its
/// data stays replicated. A chain in which `node` is the only member is left
/// unchanged; the graceful-failover precondition rejects such maps.
pub fn promote_replicas_for_graceful_failover(map: &VbucketMap, node: &NodeId) -> VbucketMap {
    let chains = map
        .chains
        .iter()
        .map(|chain| {
            if !chain.iter().flatten().any(|n| n == node) {
                return chain.clone();
            }
            let mut survivors: Chain = chain
                .iter()
                .filter(|entry| matches!(entry, Some(n) if n != node))
                .cloned()
                .collect();
            if survivors.is_empty() {
                return chain.clone();
            }
            survivors.push(Some(node.clone()));
            survivors.resize(chain.len(), None);
            survivors
        })
        .collect();
    VbucketMap { chains }
}

/// Number of positions at which two chains differ.
pub fn chain_distance(a: &Chain, b: &Chain) -> usize {
    a.iter().zip(b.iter()).filter(|(x, y)| x != y).count()
}

/// Total number of positions at which the two maps differ. A cheap distance
/// measure used for logging and progress, not a data-copy estimate.
pub fn vbucket_movements(a: &VbucketMap, b: &VbucketMap) -> usize {
    a.chains
        .iter()
        .zip(b.chains.iter())
        .map(|(ca, cb)| chain_distance(ca, cb))
        .sum()
}

/// True iff `past_map` can serve as the target without regeneration: it has
/// the current vbucket count, refers only to nodes in `keep`, and was
/// generated under options hashing identically to the current ones.
pub fn is_trivially_compatible_past_map(
    keep: &BTreeSet<NodeId>,
    current_map: &VbucketMap,
    current_opts: &MapOptions,
    past_map: &VbucketMap,
    past_opts: &MapOptions,
) -> bool {
    past_map.num_vbuckets() == current_map.num_vbuckets()
        && current_opts.opts_hash() == past_opts.opts_hash()
        && past_map.nodes().is_subset(keep)
}

/// Reports imbalance when a chain has a hole in an effective position, or
/// when master or replica load differs by more than one across `servers`.
pub fn unbalanced(map: &VbucketMap, servers: &BTreeSet<NodeId>) -> bool {
    if servers.is_empty() {
        return false;
    }
    let effective_len = map.chain_len().min(servers.len());

    for chain in &map.chains {
        if chain.iter().take(effective_len).any(Option::is_none) {
            return true;
        }
    }

    spread_exceeds_one(&map.master_counts(), servers)
        || spread_exceeds_one(&map.replica_counts(), servers)
}

fn spread_exceeds_one(
    counts: &std::collections::BTreeMap<NodeId, usize>,
    servers: &BTreeSet<NodeId>,
) -> bool {
    let per_server: Vec<usize> = servers
        .iter()
        .map(|n| counts.get(n).copied().unwrap_or(0))
        .collect();
    match (per_server.iter().max(), per_server.iter().min()) {
        (Some(max), Some(min)) => max - min > 1,
        _ => false,
    }
}
