// src/core/engine/mod.rs

//! The data-plane seam: the per-node engine client the mover and janitor
//! drive. The real implementation speaks the KV engine's control protocol;
//! this crate only consumes the trait. A scriptable in-process simulator
//! lives in [`sim`] for the test suite.

pub mod sim;

use crate::core::errors::OrchestratorError;
use crate::core::topology::NodeId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// State of one vbucket on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VbucketState {
    Active,
    /// A replica streaming from `of`. `None` while the upstream is being
    /// (re)established.
    Replica { of: Option<NodeId> },
    Dead,
}

/// Result of a `query_states` fan-out: per-(node, vbucket) states plus the
/// nodes that failed to answer ("zombies").
#[derive(Debug, Clone, Default)]
pub struct QueryStatesResult {
    pub states: BTreeMap<(NodeId, u16), VbucketState>,
    pub zombies: Vec<NodeId>,
}

/// A replication stream implied by a chain: `(source, destination, vbucket)`.
pub type Replicator = (NodeId, NodeId, u16);

#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Queries vbucket states for a bucket across a set of nodes.
    async fn query_states(
        &self,
        bucket: &str,
        nodes: &[NodeId],
        timeout: Duration,
    ) -> Result<QueryStatesResult, OrchestratorError>;

    async fn set_vbucket_state(
        &self,
        bucket: &str,
        node: &NodeId,
        vbucket: u16,
        state: VbucketState,
    ) -> Result<(), OrchestratorError>;

    /// Blocks until the replication stream into `node` for `vbucket` has
    /// caught up with its source. Required before a takeover.
    async fn wait_for_replication_drain(
        &self,
        bucket: &str,
        node: &NodeId,
        vbucket: u16,
    ) -> Result<(), OrchestratorError>;

    async fn delete_vbucket(
        &self,
        bucket: &str,
        node: &NodeId,
        vbucket: u16,
    ) -> Result<(), OrchestratorError>;

    async fn list_active_buckets(&self, node: &NodeId) -> Result<Vec<String>, OrchestratorError>;

    /// Deletes on-disk state for any bucket not in `keep`.
    async fn delete_unused_bucket_files(
        &self,
        node: &NodeId,
        keep: &[String],
    ) -> Result<(), OrchestratorError>;

    /// Blocks until local buckets outside `keep` have shut down.
    async fn shutdown_excess_buckets(
        &self,
        node: &NodeId,
        keep: &[String],
    ) -> Result<(), OrchestratorError>;

    /// Blocks until the bucket is ready to serve on `node`.
    async fn wait_for_bucket_ready(
        &self,
        bucket: &str,
        node: &NodeId,
    ) -> Result<(), OrchestratorError>;

    /// The replication streams currently terminating at `node`.
    async fn list_replicators(
        &self,
        bucket: &str,
        node: &NodeId,
    ) -> Result<BTreeSet<Replicator>, OrchestratorError>;
}
