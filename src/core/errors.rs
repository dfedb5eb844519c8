// src/core/errors.rs

//! Defines the primary error type for the orchestrator.

use crate::core::topology::NodeId;
use thiserror::Error;

/// The main error enum, covering every exit reason the orchestrator surfaces
/// to its callers. Using `thiserror` allows for clean error definitions and
/// automatic `From` trait implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    // --- Planning errors (refused before any durable side effect) ---
    #[error("No KV nodes would be left in the cluster")]
    NoKvNodesLeft,

    #[error("Delta recovery is not possible with the current map history")]
    DeltaRecoveryNotPossible,

    #[error("Node '{0}' cannot be failed over gracefully")]
    NotGraceful(NodeId),

    #[error("Node '{0}' does not run the KV service")]
    NonKvNode(NodeId),

    #[error("Node '{0}' is the last active KV node")]
    LastNode(NodeId),

    #[error("Node '{0}' is not a member of the cluster")]
    UnknownNode(NodeId),

    #[error("Server group topology changed during map generation")]
    ServerGroupsRace,

    #[error("Another orchestration is already in progress")]
    InProgress,

    // --- Precondition errors (abort before any vbucket moves) ---
    #[error("Pre-rebalance config synchronization failed on nodes: {0:?}")]
    PreRebalanceConfigSynchronizationFailed(Vec<NodeId>),

    #[error("Bucket cleanup failed on nodes: {0:?}")]
    BucketsCleanupFailed(Vec<NodeId>),

    #[error("Waiting for bucket shutdowns failed on nodes: {0:?}")]
    BucketsShutdownWaitFailed(Vec<NodeId>),

    // --- Execution errors (abort mid-rebalance) ---
    #[error("Vbucket mover crashed: {0}")]
    MoverCrashed(String),

    #[error("Pre-rebalance janitor run failed for buckets: {0:?}")]
    PreRebalanceJanitorRunFailed(Vec<String>),

    #[error("Bucket '{bucket}' is not ready yet on nodes: {nodes:?}")]
    NotAllNodesAreReadyYet { bucket: String, nodes: Vec<NodeId> },

    // --- Verification errors (abort after moves) ---
    #[error("Replica set mismatch detected after rebalance")]
    BadReplicas,

    #[error("Replica verification could not query all nodes")]
    BadReplicasDueToBadResults,

    // --- Cancellation (always clean, never a failure) ---
    #[error("Operation was stopped")]
    Stopped,

    // --- Engine / transport failures ---
    #[error("Engine error on node '{node}': {reason}")]
    EngineError { node: NodeId, reason: String },

    #[error("Timed out waiting for '{0}'")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// A stop is a clean exit; everything else is a failure.
    pub fn is_stop(&self) -> bool {
        matches!(self, OrchestratorError::Stopped)
    }
}
