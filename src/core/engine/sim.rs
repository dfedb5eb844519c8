// src/core/engine/sim.rs

//! An in-process engine used by the test suite. Every operation applies a
//! configurable latency and honors per-node fault injection: a failed node
//! answers with an error, a hung node never answers within any sane bound.

use super::{EngineClient, QueryStatesResult, Replicator, VbucketState};
use crate::core::errors::OrchestratorError;
use crate::core::map::VbucketMap;
use crate::core::topology::NodeId;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct SimEngine {
    states: DashMap<(String, NodeId, u16), VbucketState>,
    latency: Mutex<Duration>,
    failed_nodes: DashMap<NodeId, String>,
    hung_nodes: DashMap<NodeId, ()>,
    replicator_overrides: DashMap<(String, NodeId), BTreeSet<Replicator>>,
    /// Takeovers performed (transitions of a vbucket to `Active`).
    takeovers: AtomicUsize,
    deletions: AtomicUsize,
}

impl SimEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(SimEngine::default())
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Makes every call touching `node` fail with the given reason.
    pub fn fail_node(&self, node: &NodeId, reason: &str) {
        self.failed_nodes.insert(node.clone(), reason.to_string());
    }

    /// Makes every call touching `node` hang far past any timeout.
    pub fn hang_node(&self, node: &NodeId) {
        self.hung_nodes.insert(node.clone(), ());
    }

    pub fn heal_node(&self, node: &NodeId) {
        self.failed_nodes.remove(node);
        self.hung_nodes.remove(node);
    }

    /// Overrides what `list_replicators` reports for `(bucket, node)`.
    pub fn override_replicators(&self, bucket: &str, node: &NodeId, reps: BTreeSet<Replicator>) {
        self.replicator_overrides
            .insert((bucket.to_string(), node.clone()), reps);
    }

    pub fn takeover_count(&self) -> usize {
        self.takeovers.load(Ordering::Relaxed)
    }

    pub fn deletion_count(&self) -> usize {
        self.deletions.load(Ordering::Relaxed)
    }

    /// Seeds engine state from a committed map, as a janitor run would.
    pub fn apply_map(&self, bucket: &str, map: &VbucketMap) {
        for (vb, chain) in map.chains.iter().enumerate() {
            let master = chain.first().cloned().flatten();
            for (pos, entry) in chain.iter().enumerate() {
                let Some(node) = entry else { continue };
                let state = if pos == 0 {
                    VbucketState::Active
                } else {
                    VbucketState::Replica {
                        of: master.clone(),
                    }
                };
                self.states
                    .insert((bucket.to_string(), node.clone(), vb as u16), state);
            }
        }
    }

    pub fn state_of(&self, bucket: &str, node: &NodeId, vbucket: u16) -> Option<VbucketState> {
        self.states
            .get(&(bucket.to_string(), node.clone(), vbucket))
            .map(|e| e.value().clone())
    }

    async fn touch(&self, node: &NodeId) -> Result<(), OrchestratorError> {
        if self.hung_nodes.contains_key(node) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if let Some(reason) = self.failed_nodes.get(node) {
            return Err(OrchestratorError::EngineError {
                node: node.clone(),
                reason: reason.value().clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EngineClient for SimEngine {
    async fn query_states(
        &self,
        bucket: &str,
        nodes: &[NodeId],
        _timeout: Duration,
    ) -> Result<QueryStatesResult, OrchestratorError> {
        let mut result = QueryStatesResult::default();
        for node in nodes {
            if self.failed_nodes.contains_key(node) || self.hung_nodes.contains_key(node) {
                result.zombies.push(node.clone());
                continue;
            }
            for entry in self.states.iter() {
                let (b, n, vb) = entry.key();
                if b == bucket && n == node {
                    result
                        .states
                        .insert((node.clone(), *vb), entry.value().clone());
                }
            }
        }
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(result)
    }

    async fn set_vbucket_state(
        &self,
        bucket: &str,
        node: &NodeId,
        vbucket: u16,
        state: VbucketState,
    ) -> Result<(), OrchestratorError> {
        self.touch(node).await?;
        if state == VbucketState::Active {
            self.takeovers.fetch_add(1, Ordering::Relaxed);
        }
        self.states
            .insert((bucket.to_string(), node.clone(), vbucket), state);
        Ok(())
    }

    async fn wait_for_replication_drain(
        &self,
        _bucket: &str,
        node: &NodeId,
        _vbucket: u16,
    ) -> Result<(), OrchestratorError> {
        self.touch(node).await
    }

    async fn delete_vbucket(
        &self,
        bucket: &str,
        node: &NodeId,
        vbucket: u16,
    ) -> Result<(), OrchestratorError> {
        self.touch(node).await?;
        self.deletions.fetch_add(1, Ordering::Relaxed);
        self.states
            .remove(&(bucket.to_string(), node.clone(), vbucket));
        Ok(())
    }

    async fn list_active_buckets(&self, node: &NodeId) -> Result<Vec<String>, OrchestratorError> {
        self.touch(node).await?;
        let mut buckets: Vec<String> = self
            .states
            .iter()
            .filter(|e| &e.key().1 == node)
            .map(|e| e.key().0.clone())
            .collect();
        buckets.sort();
        buckets.dedup();
        Ok(buckets)
    }

    async fn delete_unused_bucket_files(
        &self,
        node: &NodeId,
        keep: &[String],
    ) -> Result<(), OrchestratorError> {
        self.touch(node).await?;
        self.states
            .retain(|(b, n, _), _| n != node || keep.contains(b));
        Ok(())
    }

    async fn shutdown_excess_buckets(
        &self,
        node: &NodeId,
        _keep: &[String],
    ) -> Result<(), OrchestratorError> {
        self.touch(node).await
    }

    async fn wait_for_bucket_ready(
        &self,
        _bucket: &str,
        node: &NodeId,
    ) -> Result<(), OrchestratorError> {
        self.touch(node).await
    }

    async fn list_replicators(
        &self,
        bucket: &str,
        node: &NodeId,
    ) -> Result<BTreeSet<Replicator>, OrchestratorError> {
        self.touch(node).await?;
        if let Some(reps) = self
            .replicator_overrides
            .get(&(bucket.to_string(), node.clone()))
        {
            return Ok(reps.value().clone());
        }
        let mut reps = BTreeSet::new();
        for entry in self.states.iter() {
            let (b, n, vb) = entry.key();
            if b == bucket && n == node {
                if let VbucketState::Replica { of: Some(src) } = entry.value() {
                    reps.insert((src.clone(), node.clone(), *vb));
                }
            }
        }
        Ok(reps)
    }
}
