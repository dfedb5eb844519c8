// src/core/failover/graceful.rs

//! Graceful failover: drain a node's masters onto replicas before failing
//! it over, so no data copy is lost. The drain maps are precomputed and
//! validated up front; the node must never end up at the head of a chain.

use super::orchestrate_failover;
use crate::config::OrchestratorConfig;
use crate::core::engine::EngineClient;
use crate::core::errors::OrchestratorError;
use crate::core::events::EventBus;
use crate::core::map::VbucketMap;
use crate::core::map::algebra::promote_replicas_for_graceful_failover;
use crate::core::rebalance::StopToken;
use crate::core::rebalance::mover::{MoverOutcome, VbucketMover};
use crate::core::store::ConfigStore;
use crate::core::topology::{NodeId, Service};
use std::sync::Arc;
use tracing::info;

/// Validates the preconditions and precomputes the per-bucket drain maps.
/// Performed synchronously before any worker is spawned, so a planning
/// error never leaves a durable side effect.
pub fn plan_graceful_failover(
    store: &ConfigStore,
    node: &NodeId,
) -> Result<Vec<(String, VbucketMap)>, OrchestratorError> {
    let info = store
        .node_info(node)
        .ok_or_else(|| OrchestratorError::UnknownNode(node.clone()))?;
    if !info.services.contains(&Service::Kv) {
        return Err(OrchestratorError::NonKvNode(node.clone()));
    }
    let mut remaining = store.active_kv_nodes();
    remaining.remove(node);
    if remaining.is_empty() {
        return Err(OrchestratorError::LastNode(node.clone()));
    }

    let mut drains = Vec::new();
    for name in store.bucket_names() {
        let Some(bucket) = store.get_bucket(&name) else {
            continue;
        };
        if !bucket.is_membase() || !bucket.servers.contains(node) {
            continue;
        }
        let drained = promote_replicas_for_graceful_failover(&bucket.map, node);
        let still_head = drained
            .chains
            .iter()
            .any(|chain| matches!(chain.first(), Some(Some(n)) if n == node));
        if still_head {
            return Err(OrchestratorError::NotGraceful(node.clone()));
        }
        if drained != bucket.map {
            drains.push((name, drained));
        }
    }
    Ok(drains)
}

/// Executes a planned graceful failover: per bucket, a mover drains the
/// node out of the head position, the drained map is committed, and once
/// every bucket is drained the node is hard-failed-over.
pub async fn run_graceful_failover(
    store: Arc<ConfigStore>,
    engine: Arc<dyn EngineClient>,
    bus: Arc<EventBus>,
    config: OrchestratorConfig,
    node: NodeId,
    drains: Vec<(String, VbucketMap)>,
    stop: StopToken,
) -> Result<(), OrchestratorError> {
    info!(
        "Starting graceful failover of '{}' across {} bucket(s).",
        node,
        drains.len()
    );

    for (name, target) in drains {
        if stop.is_stopped() {
            return Err(OrchestratorError::Stopped);
        }
        let Some(bucket) = store.get_bucket(&name) else {
            continue;
        };

        let mover = VbucketMover::new(
            &name,
            bucket.map.clone(),
            target.clone(),
            engine.clone(),
            config.moves_per_node,
            config.query_states_timeout(),
            stop.clone(),
            None,
        );
        match mover.run().await {
            Ok(MoverOutcome::Completed) => {}
            Ok(MoverOutcome::Stopped) => return Err(OrchestratorError::Stopped),
            Err(e) => return Err(OrchestratorError::MoverCrashed(e.to_string())),
        }

        store.update_bucket(&name, |b| {
            b.map = target;
        });
        store.sync_announcements();
        info!("Bucket '{}': node '{}' drained out of all head positions.", name, node);
    }

    if stop.is_stopped() {
        return Err(OrchestratorError::Stopped);
    }
    orchestrate_failover(&store, &engine, &bus, &node, config.query_states_timeout()).await?;
    info!("Graceful failover of '{}' done.", node);
    Ok(())
}
