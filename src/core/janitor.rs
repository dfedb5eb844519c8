// src/core/janitor.rs

//! The janitor reconciles engine state with the committed config: every
//! chain member gets the vbucket state the map says it should have. It runs
//! as a barrier before and after rebalance steps and after a failover. A
//! sweep over an already-consistent bucket applies nothing.

use crate::core::engine::{EngineClient, VbucketState};
use crate::core::store::ConfigStore;
use crate::core::topology::NodeId;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Sweeps one bucket: queries current states, derives the desired states
/// from the committed map, and applies only the differences. Returns the
/// nodes on which any query or state application failed.
pub async fn sweep_bucket(
    store: &ConfigStore,
    engine: &Arc<dyn EngineClient>,
    bucket_name: &str,
    query_timeout: Duration,
) -> Result<(), Vec<NodeId>> {
    let Some(bucket) = store.get_bucket(bucket_name) else {
        return Ok(());
    };
    if !bucket.is_membase() {
        return Ok(());
    }

    let servers: Vec<NodeId> = bucket.servers.iter().cloned().collect();
    let observed = match engine.query_states(bucket_name, &servers, query_timeout).await {
        Ok(result) => result,
        Err(e) => {
            warn!("Janitor could not query states for '{}': {}", bucket_name, e);
            return Err(servers);
        }
    };
    if !observed.zombies.is_empty() {
        return Err(observed.zombies);
    }

    // Desired states per node, derived purely from the map.
    let mut desired: BTreeMap<(NodeId, u16), VbucketState> = BTreeMap::new();
    for (vb, chain) in bucket.map.chains.iter().enumerate() {
        let master = chain.first().cloned().flatten();
        for (pos, entry) in chain.iter().enumerate() {
            let Some(node) = entry else { continue };
            if !bucket.servers.contains(node) {
                continue;
            }
            let state = if pos == 0 {
                VbucketState::Active
            } else {
                VbucketState::Replica {
                    of: master.clone(),
                }
            };
            desired.insert((node.clone(), vb as u16), state);
        }
    }

    let mut failed: Vec<NodeId> = Vec::new();
    let mut applied = 0usize;
    for ((node, vb), state) in desired {
        if observed.states.get(&(node.clone(), vb)) == Some(&state) {
            continue;
        }
        if failed.contains(&node) {
            continue;
        }
        match engine.set_vbucket_state(bucket_name, &node, vb, state).await {
            Ok(()) => applied += 1,
            Err(e) => {
                warn!(
                    "Janitor failed to apply state for vbucket {} of '{}' on '{}': {}",
                    vb, bucket_name, node, e
                );
                failed.push(node);
            }
        }
    }

    if failed.is_empty() {
        debug!(
            "Janitor sweep of bucket '{}' applied {} state change(s).",
            bucket_name, applied
        );
        Ok(())
    } else {
        Err(failed)
    }
}
