// src/core/map/generator.rs

//! Produces target vbucket maps: balanced master/replica placement drawn
//! from a keep-set, minimizing movement against the current map and
//! honoring server-group anti-affinity.
//!
//! All choices are deterministic: quotas and candidates are ordered by
//! `(vbucket_id, node_id)`, so two runs on identical inputs produce
//! identical maps.

use super::algebra::{self, unbalanced};
use super::history::MapHistory;
use super::{Chain, VbucketMap};
use crate::core::errors::OrchestratorError;
use crate::core::topology::{BucketConfig, GroupId, NodeId, ServerGroups};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use tracing::{debug, info};

/// The options a map was generated under. Hashing these detects when a
/// committed map must be regenerated and gates reuse of historical maps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapOptions {
    pub num_vbuckets: usize,
    pub num_replicas: usize,
    /// The keep-set, sorted.
    pub keep: Vec<NodeId>,
    /// `(node, group)` pairs restricted to the keep-set; `None` when fewer
    /// than two non-empty server groups intersect it.
    pub tags: Option<Vec<(NodeId, GroupId)>>,
}

impl MapOptions {
    /// Builds options from bucket properties and the rack topology. Raises
    /// `ServerGroupsRace` if tags are active but a keep-node has no
    /// enclosing group.
    pub fn build(
        bucket: &BucketConfig,
        keep: &BTreeSet<NodeId>,
        groups: &ServerGroups,
    ) -> Result<Self, OrchestratorError> {
        let tags = if groups.populated_groups(keep) >= 2 {
            let mut pairs = Vec::with_capacity(keep.len());
            for node in keep {
                match groups.group_of(node) {
                    Some(group) => pairs.push((node.clone(), group)),
                    None => return Err(OrchestratorError::ServerGroupsRace),
                }
            }
            Some(pairs)
        } else {
            None
        };

        Ok(MapOptions {
            num_vbuckets: bucket.num_vbuckets,
            num_replicas: bucket.num_replicas,
            keep: keep.iter().cloned().collect(),
            tags,
        })
    }

    /// A stable hash over the option set. Covers only the modern fields;
    /// there is no legacy option-hash to interoperate with.
    pub fn opts_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.num_vbuckets.hash(&mut hasher);
        self.num_replicas.hash(&mut hasher);
        for node in &self.keep {
            node.as_str().hash(&mut hasher);
        }
        match &self.tags {
            None => 0u8.hash(&mut hasher),
            Some(pairs) => {
                1u8.hash(&mut hasher);
                for (node, group) in pairs {
                    node.as_str().hash(&mut hasher);
                    group.as_ref().hash(&mut hasher);
                }
            }
        }
        hasher.finish()
    }
}

/// Computes the target map for a bucket. Returns a staged delta-recovery
/// map unchanged when it is trivially compatible, reuses the committed map
/// or a recent historical map when possible, and otherwise runs the
/// balancing generator.
pub fn generate_bucket_map(
    bucket: &BucketConfig,
    keep: &BTreeSet<NodeId>,
    groups: &ServerGroups,
    history: &MapHistory,
) -> Result<(VbucketMap, MapOptions), OrchestratorError> {
    let opts = MapOptions::build(bucket, keep, groups)?;

    if let Some((dr_map, dr_opts)) = &bucket.delta_recovery_map {
        if algebra::is_trivially_compatible_past_map(keep, &bucket.map, &opts, dr_map, dr_opts) {
            info!(
                "Bucket '{}': using staged delta recovery map as rebalance target.",
                bucket.name
            );
            return Ok((dr_map.clone(), opts));
        }
    }

    // The committed map survives as-is when its options still hash the same
    // and it is balanced over the keep-set.
    if bucket.map_opts_hash == Some(opts.opts_hash())
        && bucket.map.nodes().is_subset(keep)
        && !unbalanced(&bucket.map, keep)
    {
        debug!("Bucket '{}': current map is already balanced, reusing.", bucket.name);
        return Ok((bucket.map.clone(), opts));
    }

    for (past_map, past_opts) in history.iter_recent() {
        if algebra::is_trivially_compatible_past_map(keep, &bucket.map, &opts, past_map, past_opts)
            && !unbalanced(past_map, keep)
        {
            info!("Bucket '{}': reusing a compatible historical map.", bucket.name);
            return Ok((past_map.clone(), opts));
        }
    }

    let map = balance(&bucket.map, &opts);
    Ok((map, opts))
}

/// The special case where no map exists yet: every chain starts out
/// unassigned.
pub fn generate_initial_map(
    bucket: &BucketConfig,
    keep: &BTreeSet<NodeId>,
    groups: &ServerGroups,
) -> Result<(VbucketMap, MapOptions), OrchestratorError> {
    let opts = MapOptions::build(bucket, keep, groups)?;
    let empty = VbucketMap::empty(bucket.num_vbuckets, bucket.num_replicas);
    Ok((balance(&empty, &opts), opts))
}

/// Per-node target counts for a slot pool: everyone gets `total / k`, and
/// the remainder goes to the nodes currently holding the most of that slot
/// kind so fewer slots have to move.
fn slot_targets(
    total: usize,
    keep: &[NodeId],
    current_counts: &BTreeMap<NodeId, usize>,
) -> BTreeMap<NodeId, usize> {
    let k = keep.len();
    let base = total / k;
    let remainder = total % k;

    let mut ordered: Vec<&NodeId> = keep.iter().collect();
    ordered.sort_by_key(|n| {
        (
            std::cmp::Reverse(current_counts.get(*n).copied().unwrap_or(0)),
            (*n).clone(),
        )
    });

    let mut targets = BTreeMap::new();
    for (i, node) in ordered.into_iter().enumerate() {
        targets.insert(node.clone(), if i < remainder { base + 1 } else { base });
    }
    targets
}

struct ReplicaPicker<'a> {
    opts: &'a MapOptions,
    groups_by_node: BTreeMap<NodeId, GroupId>,
}

impl<'a> ReplicaPicker<'a> {
    fn new(opts: &'a MapOptions) -> Self {
        let groups_by_node = opts
            .tags
            .iter()
            .flatten()
            .map(|(n, g)| (n.clone(), g.clone()))
            .collect();
        Self { opts, groups_by_node }
    }

    fn group_of(&self, node: &NodeId) -> Option<&GroupId> {
        self.groups_by_node.get(node)
    }

    fn tag_ok(&self, node: &NodeId, chain_groups: &BTreeSet<GroupId>) -> bool {
        match self.group_of(node) {
            Some(group) => !chain_groups.contains(group),
            None => true,
        }
    }

    /// Picks a replica for one chain position. Preference order: the
    /// current occupant, then tag-distinct nodes still under quota, then
    /// any node under quota, then the occupant regardless of quota, then
    /// the least-loaded node. Ties always break by node order.
    fn pick(
        &self,
        incumbent: Option<&NodeId>,
        chain_nodes: &BTreeSet<NodeId>,
        chain_groups: &BTreeSet<GroupId>,
        assigned: &BTreeMap<NodeId, usize>,
        targets: &BTreeMap<NodeId, usize>,
    ) -> NodeId {
        let deficit = |n: &NodeId| {
            targets.get(n).copied().unwrap_or(0) as i64 - assigned.get(n).copied().unwrap_or(0) as i64
        };
        let eligible_incumbent = incumbent
            .filter(|n| targets.contains_key(*n) && !chain_nodes.contains(*n));

        if let Some(n) = eligible_incumbent {
            if deficit(n) > 0 && self.tag_ok(n, chain_groups) {
                return n.clone();
            }
        }

        let candidates: Vec<&NodeId> = self
            .opts
            .keep
            .iter()
            .filter(|n| !chain_nodes.contains(*n))
            .collect();

        let best_under_quota = |require_tag: bool| {
            candidates
                .iter()
                .filter(|n| deficit(n) > 0)
                .filter(|n| !require_tag || self.tag_ok(n, chain_groups))
                .max_by_key(|n| (deficit(n), std::cmp::Reverse((**n).clone())))
                .map(|n| (*n).clone())
        };

        if let Some(n) = best_under_quota(true) {
            return n;
        }
        if let Some(n) = best_under_quota(false) {
            return n;
        }
        if let Some(n) = eligible_incumbent {
            return n.clone();
        }
        candidates
            .iter()
            .min_by_key(|n| (assigned.get(**n).copied().unwrap_or(0), (**n).clone()))
            .map(|n| (*n).clone())
            .expect("keep-set always exceeds the effective chain length")
    }
}

/// The balancing generator. Assigns masters against exact quotas, fills
/// replica positions greedily with incumbent preference, then repairs any
/// residual replica imbalance by swapping slots from over- to under-quota
/// nodes.
fn balance(current: &VbucketMap, opts: &MapOptions) -> VbucketMap {
    let keep = &opts.keep;
    let k = keep.len();
    let nv = opts.num_vbuckets;
    let chain_len = opts.num_replicas + 1;
    let effective_len = chain_len.min(k);

    let cur = normalize(current, nv, chain_len);
    let keep_set: BTreeSet<NodeId> = keep.iter().cloned().collect();

    // --- Masters: exact quotas, incumbents kept while under target ---
    let master_targets = slot_targets(nv, keep, &cur.master_counts());
    let mut master_assigned: BTreeMap<NodeId, usize> = BTreeMap::new();
    let mut masters: Vec<Option<NodeId>> = vec![None; nv];

    for vb in 0..nv {
        if let Some(Some(m)) = cur.chains[vb].first() {
            if keep_set.contains(m)
                && master_assigned.get(m).copied().unwrap_or(0) < master_targets[m]
            {
                masters[vb] = Some(m.clone());
                *master_assigned.entry(m.clone()).or_insert(0) += 1;
            }
        }
    }
    for master in masters.iter_mut() {
        if master.is_none() {
            let chosen = keep
                .iter()
                .filter(|n| master_assigned.get(*n).copied().unwrap_or(0) < master_targets[*n])
                .max_by_key(|n| {
                    (
                        master_targets[*n] as i64
                            - master_assigned.get(*n).copied().unwrap_or(0) as i64,
                        std::cmp::Reverse((*n).clone()),
                    )
                })
                .expect("master quotas sum to the vbucket count")
                .clone();
            *master_assigned.entry(chosen.clone()).or_insert(0) += 1;
            *master = Some(chosen);
        }
    }

    // --- Replicas: greedy fill, then swap repair ---
    let replica_slots = nv * (effective_len - 1);
    let replica_targets = slot_targets(replica_slots, keep, &cur.replica_counts());
    let picker = ReplicaPicker::new(opts);
    let mut replica_assigned: BTreeMap<NodeId, usize> = BTreeMap::new();
    let mut chains: Vec<Chain> = Vec::with_capacity(nv);

    for vb in 0..nv {
        let master = masters[vb].clone().expect("every vbucket was assigned a master");
        let mut chain: Chain = vec![Some(master.clone())];
        let mut chain_nodes: BTreeSet<NodeId> = BTreeSet::from([master.clone()]);
        let mut chain_groups: BTreeSet<GroupId> = BTreeSet::new();
        if let Some(g) = picker.group_of(&master) {
            chain_groups.insert(g.clone());
        }

        for pos in 1..effective_len {
            let incumbent = cur.chains[vb].get(pos).and_then(Option::as_ref);
            let chosen = picker.pick(
                incumbent,
                &chain_nodes,
                &chain_groups,
                &replica_assigned,
                &replica_targets,
            );
            *replica_assigned.entry(chosen.clone()).or_insert(0) += 1;
            if let Some(g) = picker.group_of(&chosen) {
                chain_groups.insert(g.clone());
            }
            chain_nodes.insert(chosen.clone());
            chain.push(Some(chosen));
        }
        chain.resize(chain_len, None);
        chains.push(chain);
    }

    let mut map = VbucketMap { chains };
    repair_replica_quotas(&mut map, &picker, &mut replica_assigned, &replica_targets);

    debug!(
        "Generated map over {} nodes: {} position changes vs current.",
        k,
        algebra::vbucket_movements(&cur, &map)
    );
    map
}

/// Moves replica slots from over-quota donors to under-quota receivers until
/// quotas are exact or no legal swap remains. Swaps that keep server-group
/// diversity are tried before ones that give it up.
fn repair_replica_quotas(
    map: &mut VbucketMap,
    picker: &ReplicaPicker<'_>,
    assigned: &mut BTreeMap<NodeId, usize>,
    targets: &BTreeMap<NodeId, usize>,
) {
    'outer: loop {
        let receiver = targets
            .iter()
            .find(|(n, t)| assigned.get(*n).copied().unwrap_or(0) < **t)
            .map(|(n, _)| n.clone());
        let Some(receiver) = receiver else {
            return;
        };

        for require_tag in [true, false] {
            for vb in 0..map.num_vbuckets() {
                if map.chains[vb].iter().flatten().any(|n| *n == receiver) {
                    continue;
                }
                let chain_groups: BTreeSet<GroupId> = map.chains[vb]
                    .iter()
                    .flatten()
                    .filter_map(|n| picker.group_of(n).cloned())
                    .collect();
                if require_tag && !picker.tag_ok(&receiver, &chain_groups) {
                    continue;
                }
                for pos in 1..map.chains[vb].len() {
                    let Some(donor) = map.chains[vb][pos].clone() else {
                        continue;
                    };
                    if assigned.get(&donor).copied().unwrap_or(0)
                        <= targets.get(&donor).copied().unwrap_or(0)
                    {
                        continue;
                    }
                    map.chains[vb][pos] = Some(receiver.clone());
                    *assigned.entry(donor).or_insert(0) -= 1;
                    *assigned.entry(receiver.clone()).or_insert(0) += 1;
                    continue 'outer;
                }
            }
        }

        // No legal swap for this receiver; the map stays as close to
        // balanced as the chain constraints allow.
        return;
    }
}

/// Pads or truncates the current map to the requested geometry so position
/// comparisons line up.
fn normalize(map: &VbucketMap, num_vbuckets: usize, chain_len: usize) -> VbucketMap {
    let mut chains: Vec<Chain> = map
        .chains
        .iter()
        .take(num_vbuckets)
        .map(|chain| {
            let mut c = chain.clone();
            c.resize(chain_len, None);
            c
        })
        .collect();
    chains.resize(num_vbuckets, vec![None; chain_len]);
    VbucketMap { chains }
}
