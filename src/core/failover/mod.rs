// src/core/failover/mod.rs

//! Hard failover and auto-failover validation.
//!
//! Hard failover promotes replicas for every bucket the lost node served,
//! records which vbuckets it held for a later delta recovery, and marks the
//! node inactive-failed. The node is never evicted here; it may come back.

pub mod graceful;

use crate::core::engine::EngineClient;
use crate::core::errors::OrchestratorError;
use crate::core::events::{BucketEvent, EventBus};
use crate::core::janitor;
use crate::core::map::algebra::promote_replicas;
use crate::core::store::ConfigStore;
use crate::core::topology::{Membership, NodeId};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Hard failover of one node. Per bucket: memcached buckets just lose the
/// node from their server set; membase buckets get their replicas promoted
/// and any resulting data loss audited.
pub async fn orchestrate_failover(
    store: &Arc<ConfigStore>,
    engine: &Arc<dyn EngineClient>,
    bus: &Arc<EventBus>,
    node: &NodeId,
    query_timeout: Duration,
) -> Result<(), OrchestratorError> {
    if !store.contains_node(node) {
        return Err(OrchestratorError::UnknownNode(node.clone()));
    }
    info!("Starting hard failover of node '{}'.", node);
    let dead: BTreeSet<NodeId> = BTreeSet::from([node.clone()]);

    for name in store.bucket_names() {
        let Some(bucket) = store.get_bucket(&name) else {
            continue;
        };
        if !bucket.servers.contains(node) {
            continue;
        }

        if !bucket.is_membase() {
            store.update_bucket(&name, |b| {
                b.servers.remove(node);
            });
            continue;
        }

        // Record what the node was serving before the promotion wipes it
        // from the map; delta recovery needs this exact set.
        store.record_failover_vbuckets(node, &name, bucket.map.vbuckets_of(node));

        let promoted = promote_replicas(&bucket.map, &dead);
        let lost = promoted
            .chains
            .iter()
            .filter(|chain| matches!(chain.first(), Some(None)))
            .count();
        if lost > 0 {
            let percentage = (lost * 100 / promoted.num_vbuckets().max(1)) as u8;
            warn!(
                "Failover of '{}' lost data in {} vbucket(s) of bucket '{}' ({}%).",
                node, lost, name, percentage
            );
            bus.publish(BucketEvent::DataLost {
                bucket: name.clone(),
                percentage,
            });
        }

        store.update_bucket(&name, |b| {
            b.map = promoted;
            b.fast_forward_map = None;
            b.servers.remove(node);
        });

        // A failed janitor run is reported but does not block the failover.
        if let Err(nodes) = janitor::sweep_bucket(store, engine, &name, query_timeout).await {
            warn!(
                "Janitor run after failover of bucket '{}' failed on {:?}.",
                name, nodes
            );
        }
    }

    store.remove_node_from_services(node);
    store.set_membership(node, Membership::InactiveFailed);
    store.sync_announcements();
    info!("Hard failover of node '{}' finished.", node);
    Ok(())
}

/// Simulates the promotion for every membase bucket and returns the ones
/// that would end up with a masterless vbucket. Auto-failover proceeds only
/// when the list is empty.
pub fn validate_autofailover(store: &ConfigStore, node: &NodeId) -> Result<(), Vec<String>> {
    let dead: BTreeSet<NodeId> = BTreeSet::from([node.clone()]);
    let mut unsafe_buckets = Vec::new();

    for name in store.bucket_names() {
        let Some(bucket) = store.get_bucket(&name) else {
            continue;
        };
        if !bucket.is_membase() || !bucket.servers.contains(node) {
            continue;
        }
        let promoted = promote_replicas(&bucket.map, &dead);
        let masterless = promoted
            .chains
            .iter()
            .zip(bucket.map.chains.iter())
            .any(|(after, before)| {
                matches!(after.first(), Some(None)) && !matches!(before.first(), Some(None))
            });
        if masterless {
            unsafe_buckets.push(name);
        }
    }

    if unsafe_buckets.is_empty() {
        Ok(())
    } else {
        Err(unsafe_buckets)
    }
}

/// Whether a failover of `node` can be attempted at all.
pub fn check_failover_possible(store: &ConfigStore, node: &NodeId) -> Result<(), OrchestratorError> {
    if !store.contains_node(node) {
        return Err(OrchestratorError::UnknownNode(node.clone()));
    }
    let mut remaining = store.active_kv_nodes();
    remaining.remove(node);
    if remaining.is_empty() {
        return Err(OrchestratorError::LastNode(node.clone()));
    }
    Ok(())
}
