// src/core/rebalance/verify.rs

//! Post-move replication verification: the streams the engine actually
//! runs must be exactly the streams the committed map implies.

use crate::core::engine::{EngineClient, Replicator};
use crate::core::errors::OrchestratorError;
use crate::core::map::VbucketMap;
use crate::core::rpc;
use crate::core::topology::NodeId;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Every `(source, destination, vbucket)` stream a map implies.
pub fn expected_replicators(map: &VbucketMap) -> BTreeSet<Replicator> {
    let mut expected = BTreeSet::new();
    for (vb, chain) in map.chains.iter().enumerate() {
        let Some(Some(master)) = chain.first() else {
            continue;
        };
        for replica in chain.iter().skip(1).flatten() {
            expected.insert((master.clone(), replica.clone(), vb as u16));
        }
    }
    expected
}

/// Compares the expected replicator set against what each node reports.
/// Any unreachable node is fatal before any comparison is.
pub async fn verify_replication(
    engine: &Arc<dyn EngineClient>,
    bucket: &str,
    map: &VbucketMap,
    nodes: &BTreeSet<NodeId>,
    per_node_timeout: Duration,
) -> Result<(), OrchestratorError> {
    let node_list: Vec<NodeId> = nodes.iter().cloned().collect();
    let result = rpc::multicall(&node_list, per_node_timeout, |node| {
        let engine = engine.clone();
        let bucket = bucket.to_string();
        async move { engine.list_replicators(&bucket, &node).await }
    })
    .await;

    if !result.all_good() {
        error!(
            "Replica verification for bucket '{}' could not query nodes: {:?}",
            bucket,
            result.failed_nodes()
        );
        return Err(OrchestratorError::BadReplicasDueToBadResults);
    }

    let mut actual = BTreeSet::new();
    for (_, reps) in result.good {
        actual.extend(reps);
    }

    let expected = expected_replicators(map);
    if actual != expected {
        let missing: Vec<&Replicator> = expected.difference(&actual).collect();
        let extra: Vec<&Replicator> = actual.difference(&expected).collect();
        error!(
            "Replica mismatch for bucket '{}': {} missing, {} unexpected.",
            bucket,
            missing.len(),
            extra.len()
        );
        return Err(OrchestratorError::BadReplicas);
    }

    info!("Replica verification for bucket '{}' passed.", bucket);
    Ok(())
}
