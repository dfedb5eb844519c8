// src/core/map/mod.rs

//! Vbucket map types and the operations that produce and compare them.

pub mod algebra;
pub mod generator;
pub mod history;

use crate::core::topology::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One vbucket's replication chain: `[master, replica_1, ...]`. `None` is the
/// unassigned sentinel. The length is fixed per bucket; shorter effective
/// chains carry trailing `None`s.
pub type Chain = Vec<Option<NodeId>>;

/// The full placement of a bucket: one chain per vbucket id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VbucketMap {
    pub chains: Vec<Chain>,
}

impl VbucketMap {
    /// An all-unassigned map with `num_vbuckets` chains of length
    /// `num_replicas + 1`.
    pub fn empty(num_vbuckets: usize, num_replicas: usize) -> Self {
        VbucketMap {
            chains: vec![vec![None; num_replicas + 1]; num_vbuckets],
        }
    }

    pub fn num_vbuckets(&self) -> usize {
        self.chains.len()
    }

    pub fn chain_len(&self) -> usize {
        self.chains.first().map_or(0, Vec::len)
    }

    /// Every node referenced anywhere in the map.
    pub fn nodes(&self) -> BTreeSet<NodeId> {
        self.chains
            .iter()
            .flatten()
            .flatten()
            .cloned()
            .collect()
    }

    /// Vbucket ids at which `node` appears in some position of the chain.
    /// Accumulated from the highest vbucket id down, matching the order the
    /// failover record is built in.
    pub fn vbuckets_of(&self, node: &NodeId) -> BTreeSet<u16> {
        let mut out = BTreeSet::new();
        for (vb, chain) in self.chains.iter().enumerate().rev() {
            if chain.iter().flatten().any(|n| n == node) {
                out.insert(vb as u16);
            }
        }
        out
    }

    /// Per-node count of master (head) positions.
    pub fn master_counts(&self) -> BTreeMap<NodeId, usize> {
        let mut counts = BTreeMap::new();
        for chain in &self.chains {
            if let Some(Some(master)) = chain.first() {
                *counts.entry(master.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Per-node count of replica (non-head) positions.
    pub fn replica_counts(&self) -> BTreeMap<NodeId, usize> {
        let mut counts = BTreeMap::new();
        for chain in &self.chains {
            for node in chain.iter().skip(1).flatten() {
                *counts.entry(node.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Verifies the per-bucket chain invariants: uniform chain length, no
    /// duplicate node within a chain, every entry a member of `servers`.
    pub fn check_integrity(&self, servers: &BTreeSet<NodeId>) -> Result<(), String> {
        let expected_len = self.chain_len();
        for (vb, chain) in self.chains.iter().enumerate() {
            if chain.len() != expected_len {
                return Err(format!(
                    "chain for vbucket {vb} has length {} (expected {expected_len})",
                    chain.len()
                ));
            }
            let mut seen = BTreeSet::new();
            for node in chain.iter().flatten() {
                if !seen.insert(node) {
                    return Err(format!("node '{node}' appears twice in chain for vbucket {vb}"));
                }
                if !servers.contains(node) {
                    return Err(format!(
                        "node '{node}' in chain for vbucket {vb} is not a bucket server"
                    ));
                }
            }
        }
        Ok(())
    }
}
