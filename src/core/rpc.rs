// src/core/rpc.rs

//! Bounded concurrent fan-out over cluster nodes.
//!
//! Many orchestration steps issue the same call to every keep-node and then
//! decide, per step, whether partial failure is fatal. The result is a
//! tri-partition: nodes that answered, nodes that answered with an error,
//! and nodes that did not answer within the bound.

use crate::core::errors::OrchestratorError;
use crate::core::topology::NodeId;
use futures::future::join_all;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Outcome of a fan-out call across a node set.
#[derive(Debug)]
pub struct Multicall<T> {
    pub good: Vec<(NodeId, T)>,
    pub bad: Vec<(NodeId, OrchestratorError)>,
    pub down: Vec<NodeId>,
}

impl<T> Multicall<T> {
    /// Nodes that did not return a successful result, in node order.
    pub fn failed_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .bad
            .iter()
            .map(|(n, _)| n.clone())
            .chain(self.down.iter().cloned())
            .collect();
        nodes.sort();
        nodes
    }

    pub fn all_good(&self) -> bool {
        self.bad.is_empty() && self.down.is_empty()
    }
}

/// Issues `call` against every node concurrently, bounding each call by
/// `per_call_timeout`. A timeout classifies the node as down; any other
/// error classifies it as bad.
pub async fn multicall<T, F, Fut>(
    nodes: &[NodeId],
    per_call_timeout: Duration,
    call: F,
) -> Multicall<T>
where
    F: Fn(NodeId) -> Fut,
    Fut: Future<Output = Result<T, OrchestratorError>>,
{
    let futures = nodes.iter().map(|node| {
        let node = node.clone();
        let fut = call(node.clone());
        async move {
            match tokio::time::timeout(per_call_timeout, fut).await {
                Ok(Ok(value)) => (node, Ok(Some(value))),
                Ok(Err(e)) => (node, Err(e)),
                Err(_) => (node, Ok(None)),
            }
        }
    });

    let mut result = Multicall {
        good: Vec::new(),
        bad: Vec::new(),
        down: Vec::new(),
    };

    for (node, outcome) in join_all(futures).await {
        match outcome {
            Ok(Some(value)) => result.good.push((node, value)),
            Ok(None) => {
                warn!("Node '{}' did not answer within {:?}.", node, per_call_timeout);
                result.down.push(node);
            }
            Err(e) => {
                warn!("Node '{}' answered with an error: {}", node, e);
                result.bad.push((node, e));
            }
        }
    }

    result
}
