// src/core/recovery.rs

//! Delta recovery planning: re-admitting previously failed-over nodes while
//! keeping their on-disk vbucket data.
//!
//! A node can only come back "delta" if the map history contains a map in
//! which it held exactly the vbuckets recorded at the moment it was failed
//! over. The planner searches the history per bucket; the resulting plans
//! carry a transitional bucket config that re-admits the nodes without a
//! full data copy.

use crate::core::map::VbucketMap;
use crate::core::map::generator::MapOptions;
use crate::core::map::history::MapHistory;
use crate::core::store::ConfigStore;
use crate::core::topology::{BucketConfig, NodeId, ServerGroups};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Which buckets the caller requires delta recovery for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaRecoveryRequest {
    /// Every membase bucket must plan successfully.
    All,
    /// The named buckets must plan successfully; others recover fully.
    Buckets(Vec<String>),
}

impl DeltaRecoveryRequest {
    fn requires(&self, bucket: &str) -> bool {
        match self {
            DeltaRecoveryRequest::All => true,
            DeltaRecoveryRequest::Buckets(names) => names.iter().any(|n| n == bucket),
        }
    }
}

/// A per-bucket delta recovery plan.
#[derive(Debug, Clone)]
pub struct DeltaRecoveryPlan {
    pub bucket: String,
    /// The historical map the recovering nodes' data corresponds to.
    pub target_map: VbucketMap,
    pub target_opts: MapOptions,
    /// The config to install while the nodes are re-admitted.
    pub transitional: BucketConfig,
}

/// Finds a past map in which every recovering node held exactly the
/// vbuckets recorded at its failover, under options congruent with the
/// current ones.
fn find_delta_recovery_map(
    store: &ConfigStore,
    all_nodes: &BTreeSet<NodeId>,
    deltas: &BTreeSet<NodeId>,
    bucket: &BucketConfig,
    groups: &ServerGroups,
    history: &MapHistory,
) -> Option<(VbucketMap, MapOptions)> {
    let current_opts = MapOptions::build(bucket, all_nodes, groups).ok()?;
    let candidates = history.find_matching_past_maps(all_nodes, &bucket.map, &current_opts);

    for (past_map, past_opts) in candidates {
        let matches_all = deltas.iter().all(|node| {
            let recorded = store
                .failover_vbuckets(node)
                .get(&bucket.name)
                .cloned()
                .unwrap_or_default();
            !recorded.is_empty() && past_map.vbuckets_of(node) == recorded
        });
        if matches_all {
            return Some((past_map.clone(), past_opts.clone()));
        }
    }
    None
}

/// Builds the transitional config that re-admits the recovering nodes:
/// surviving entries of the current chain keep their positions at the
/// front, then the target chain's recovering nodes are appended, padded to
/// the chain length.
fn transitional_bucket(
    bucket: &BucketConfig,
    target_map: &VbucketMap,
    target_opts: &MapOptions,
    deltas: &BTreeSet<NodeId>,
) -> BucketConfig {
    let chain_len = bucket.chain_len();
    let chains = bucket
        .map
        .chains
        .iter()
        .zip(target_map.chains.iter())
        .map(|(cur_chain, tgt_chain)| {
            let mut chain: Vec<Option<NodeId>> = cur_chain
                .iter()
                .filter(|entry| matches!(entry, Some(n) if !deltas.contains(n)))
                .cloned()
                .collect();
            for entry in tgt_chain.iter().flatten() {
                if deltas.contains(entry) && !chain.iter().flatten().any(|n| n == entry) {
                    chain.push(Some(entry.clone()));
                }
            }
            chain.truncate(chain_len);
            chain.resize(chain_len, None);
            chain
        })
        .collect();

    let mut transitional = bucket.clone();
    transitional.servers = bucket.servers.union(deltas).cloned().collect();
    transitional.map = VbucketMap { chains };
    transitional.delta_recovery_map = Some((target_map.clone(), target_opts.clone()));
    transitional
}

/// Runs the planner over every membase bucket. Returns one plan per bucket
/// that can be delta-recovered, or an empty vector when a required bucket
/// has no plan, in which case the whole delta recovery is rejected.
pub fn build_delta_recovery_buckets(
    store: &ConfigStore,
    all_nodes: &BTreeSet<NodeId>,
    deltas: &BTreeSet<NodeId>,
    requested: &DeltaRecoveryRequest,
) -> Vec<DeltaRecoveryPlan> {
    if deltas.is_empty() {
        return Vec::new();
    }

    let groups = store.server_groups();
    let history = store.past_vbucket_maps();
    let mut plans = Vec::new();

    for name in store.bucket_names() {
        let Some(bucket) = store.get_bucket(&name) else {
            continue;
        };
        if !bucket.is_membase() {
            continue;
        }

        match find_delta_recovery_map(store, all_nodes, deltas, &bucket, &groups, &history) {
            Some((target_map, target_opts)) => {
                debug!("Delta recovery plan found for bucket '{}'.", name);
                let transitional =
                    transitional_bucket(&bucket, &target_map, &target_opts, deltas);
                plans.push(DeltaRecoveryPlan {
                    bucket: name,
                    target_map,
                    target_opts,
                    transitional,
                });
            }
            None if requested.requires(&name) => {
                info!(
                    "No compatible past map for bucket '{}'; delta recovery is not possible.",
                    name
                );
                return Vec::new();
            }
            None => {}
        }
    }

    plans
}
