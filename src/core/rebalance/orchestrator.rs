// src/core/rebalance/orchestrator.rs

//! The top-level rebalance driver. Walks the cluster through nine
//! observable checkpoints, one bucket at a time, honoring a stop request
//! between any two of them. Every fatal error aborts the whole rebalance;
//! the cluster is restartable from any consistent post-commit checkpoint.

use super::mover::{MoverOutcome, ProgressFn, VbucketMover};
use super::verify::verify_replication;
use super::StopToken;
use crate::config::OrchestratorConfig;
use crate::core::engine::EngineClient;
use crate::core::errors::OrchestratorError;
use crate::core::events::{BucketEvent, EventBus};
use crate::core::janitor;
use crate::core::map::algebra::vbucket_movements;
use crate::core::map::generator::generate_bucket_map;
use crate::core::recovery::DeltaRecoveryPlan;
use crate::core::rpc;
use crate::core::store::ConfigStore;
use crate::core::topology::{BucketKind, Membership, NodeId, RecoveryKind, Service};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// The validated inputs of one rebalance run.
#[derive(Debug, Clone)]
pub struct RebalancePlan {
    pub keep: BTreeSet<NodeId>,
    pub eject: BTreeSet<NodeId>,
    pub failed: BTreeSet<NodeId>,
    pub delta_nodes: BTreeSet<NodeId>,
    pub delta_plans: Vec<DeltaRecoveryPlan>,
}

pub struct RebalanceOrchestrator {
    store: Arc<ConfigStore>,
    engine: Arc<dyn EngineClient>,
    bus: Arc<EventBus>,
    config: OrchestratorConfig,
    self_node: NodeId,
    stop: StopToken,
    progress: Arc<watch::Sender<f64>>,
}

impl RebalanceOrchestrator {
    pub fn new(
        store: Arc<ConfigStore>,
        engine: Arc<dyn EngineClient>,
        bus: Arc<EventBus>,
        config: OrchestratorConfig,
        self_node: NodeId,
        stop: StopToken,
        progress: Arc<watch::Sender<f64>>,
    ) -> Self {
        RebalanceOrchestrator {
            store,
            engine,
            bus,
            config,
            self_node,
            stop,
            progress,
        }
    }

    fn check_stop(&self) -> Result<(), OrchestratorError> {
        if self.stop.is_stopped() {
            Err(OrchestratorError::Stopped)
        } else {
            Ok(())
        }
    }

    async fn sleep_or_stop(&self, duration: Duration) -> Result<(), OrchestratorError> {
        if duration.is_zero() {
            return self.check_stop();
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.stop.stopped() => Err(OrchestratorError::Stopped),
        }
    }

    pub async fn run(self, plan: RebalancePlan) -> Result<(), OrchestratorError> {
        let run_id = hex::encode(rand::random::<[u8; 20]>());
        info!(
            "Rebalance {} starting: keep {:?}, eject {:?}, failed {:?}, {} delta plan(s).",
            run_id,
            plan.keep,
            plan.eject,
            plan.failed,
            plan.delta_plans.len()
        );

        let result = self.run_inner(&plan).await;
        match &result {
            Ok(()) => info!("Rebalance {} completed.", run_id),
            Err(e) if e.is_stop() => info!("Rebalance {} stopped.", run_id),
            Err(e) => warn!("Rebalance {} failed: {}", run_id, e),
        }
        result
    }

    async fn run_inner(&self, plan: &RebalancePlan) -> Result<(), OrchestratorError> {
        let keep_list: Vec<NodeId> = plan.keep.iter().cloned().collect();

        // Step 1: push config to every keep-node before touching anything.
        self.check_stop()?;
        self.store.sync_announcements();
        self.store
            .synchronize_remote(&keep_list, self.config.apply_config_timeout())
            .await
            .map_err(OrchestratorError::PreRebalanceConfigSynchronizationFailed)?;

        // Step 2: activate keep-nodes and refresh every service map.
        self.check_stop()?;
        for node in &plan.keep {
            if !plan.delta_nodes.contains(node) {
                self.store.set_membership(node, Membership::Active);
            }
        }
        for service in Service::ALL {
            let nodes: BTreeSet<NodeId> = self
                .store
                .nodes_running(service)
                .intersection(&plan.keep)
                .cloned()
                .collect();
            self.store.set_service_nodes(service, nodes);
        }

        // Step 3: evict failed nodes immediately so they cannot perturb
        // later steps.
        self.check_stop()?;
        for node in &plan.failed {
            if *node != self.self_node {
                self.store.eject_node(node);
            }
        }

        // Step 4: delete on-disk state for buckets keep-nodes no longer
        // host.
        self.check_stop()?;
        let bucket_names = self.store.bucket_names();
        let cleanup = rpc::multicall(&keep_list, self.config.apply_config_timeout(), |node| {
            let engine = self.engine.clone();
            let keep_buckets = bucket_names.clone();
            async move {
                let active = engine.list_active_buckets(&node).await?;
                let stale = active.iter().filter(|b| !keep_buckets.contains(b)).count();
                if stale > 0 {
                    info!("Node '{}' holds {} stale bucket(s); deleting their files.", node, stale);
                }
                engine.delete_unused_bucket_files(&node, &keep_buckets).await
            }
        })
        .await;
        if !cleanup.all_good() {
            return Err(OrchestratorError::BucketsCleanupFailed(cleanup.failed_nodes()));
        }

        // Step 5: wait until excess local buckets are torn down.
        self.check_stop()?;
        let shutdown_timeout = self.config.buckets_shutdown_timeout(bucket_names.len());
        let shutdowns = rpc::multicall(&keep_list, shutdown_timeout, |node| {
            let engine = self.engine.clone();
            let keep_buckets = bucket_names.clone();
            async move { engine.shutdown_excess_buckets(&node, &keep_buckets).await }
        })
        .await;
        if !shutdowns.all_good() {
            return Err(OrchestratorError::BucketsShutdownWaitFailed(
                shutdowns.failed_nodes(),
            ));
        }

        // Step 6: apply delta recovery, if planned.
        self.check_stop()?;
        if !plan.delta_plans.is_empty() {
            self.apply_delta_recovery(plan, &keep_list).await?;
        }

        // Step 7: rebalance buckets one at a time, in config order.
        let names = self.store.bucket_names();
        let total = names.len().max(1);
        for (index, name) in names.iter().enumerate() {
            self.check_stop()?;
            let _ = self.progress.send(index as f64 / total as f64);
            self.rebalance_bucket(plan, name, index, total).await?;
        }
        let _ = self.progress.send(1.0);

        // Step 8: final sync, then let dependent services drain before any
        // eject.
        self.check_stop()?;
        self.store.sync_announcements();
        if let Err(nodes) = self
            .store
            .synchronize_remote(&keep_list, self.config.apply_config_timeout())
            .await
        {
            warn!("Post-rebalance config synchronization failed on {:?}.", nodes);
        }
        let eject_services: BTreeSet<&'static str> = plan
            .eject
            .iter()
            .filter_map(|n| self.store.node_info(n))
            .flat_map(|info| info.services.into_iter().map(|s| s.name()))
            .collect();
        self.sleep_or_stop(self.config.max_eject_delay(eject_services))
            .await?;

        // Step 9: eject everyone leaving. Never ourselves; that is the
        // caller's responsibility.
        for node in &plan.eject {
            if *node != self.self_node {
                self.store.eject_node(node);
            }
        }
        self.store.sync_announcements();

        Ok(())
    }

    /// Atomically installs the transitional bucket configs, re-admits the
    /// recovering nodes, and waits for the buckets to come up on them.
    async fn apply_delta_recovery(
        &self,
        plan: &RebalancePlan,
        keep_list: &[NodeId],
    ) -> Result<(), OrchestratorError> {
        info!(
            "Applying delta recovery for {} bucket(s) on nodes {:?}.",
            plan.delta_plans.len(),
            plan.delta_nodes
        );
        let transitionals = plan
            .delta_plans
            .iter()
            .map(|p| p.transitional.clone())
            .collect();
        self.store.set_buckets(transitionals);

        for node in &plan.delta_nodes {
            self.store.set_recovery(node, RecoveryKind::None);
            self.store.set_membership(node, Membership::Active);
            self.store.clear_failover_vbuckets(node);
        }

        self.store.sync_announcements();
        if let Err(nodes) = self
            .store
            .synchronize_remote(keep_list, self.config.apply_config_timeout())
            .await
        {
            return Err(OrchestratorError::PreRebalanceConfigSynchronizationFailed(nodes));
        }

        for delta_plan in &plan.delta_plans {
            let involved: Vec<NodeId> = plan
                .delta_nodes
                .iter()
                .filter(|n| delta_plan.transitional.servers.contains(*n))
                .cloned()
                .collect();
            let readiness = rpc::multicall(&involved, self.config.readiness_timeout(), |node| {
                let engine = self.engine.clone();
                let bucket = delta_plan.bucket.clone();
                async move { engine.wait_for_bucket_ready(&bucket, &node).await }
            })
            .await;
            if !readiness.all_good() {
                return Err(OrchestratorError::NotAllNodesAreReadyYet {
                    bucket: delta_plan.bucket.clone(),
                    nodes: readiness.failed_nodes(),
                });
            }
            for node in involved {
                self.bus.publish(BucketEvent::BucketReady {
                    bucket: delta_plan.bucket.clone(),
                    node,
                });
            }
        }
        Ok(())
    }

    async fn rebalance_bucket(
        &self,
        plan: &RebalancePlan,
        name: &str,
        index: usize,
        total: usize,
    ) -> Result<(), OrchestratorError> {
        let Some(bucket) = self.store.get_bucket(name) else {
            return Ok(());
        };
        let keep_kv: BTreeSet<NodeId> = self
            .store
            .nodes_running(Service::Kv)
            .intersection(&plan.keep)
            .cloned()
            .collect();

        match bucket.kind {
            BucketKind::Memcached => {
                // Stateless at this layer: committing the server set is the
                // whole rebalance.
                self.store.update_bucket(name, |b| {
                    b.servers = keep_kv.clone();
                });
                self.store.sync_announcements();
                Ok(())
            }
            BucketKind::Membase => {
                self.rebalance_membase_bucket(plan, name, &keep_kv, index, total)
                    .await
            }
        }
    }

    async fn rebalance_membase_bucket(
        &self,
        plan: &RebalancePlan,
        name: &str,
        keep_kv: &BTreeSet<NodeId>,
        index: usize,
        total: usize,
    ) -> Result<(), OrchestratorError> {
        let bucket = self
            .store
            .get_bucket(name)
            .ok_or_else(|| OrchestratorError::Internal(format!("bucket '{name}' disappeared")))?;

        // Rebalanced-out members stay in the server set while their data
        // moves off; they are dropped at commit.
        let moving_out: BTreeSet<NodeId> =
            bucket.servers.intersection(&plan.eject).cloned().collect();
        let servers_during_move: BTreeSet<NodeId> =
            keep_kv.union(&moving_out).cloned().collect();
        self.store.update_bucket(name, |b| {
            b.servers = servers_during_move.clone();
        });
        self.store.sync_announcements();

        let server_list: Vec<NodeId> = servers_during_move.iter().cloned().collect();
        let readiness = rpc::multicall(&server_list, self.config.readiness_timeout(), |node| {
            let engine = self.engine.clone();
            let bucket = name.to_string();
            async move { engine.wait_for_bucket_ready(&bucket, &node).await }
        })
        .await;
        if !readiness.all_good() {
            return Err(OrchestratorError::NotAllNodesAreReadyYet {
                bucket: name.to_string(),
                nodes: readiness.failed_nodes(),
            });
        }

        if janitor::sweep_bucket(
            &self.store,
            &self.engine,
            name,
            self.config.query_states_timeout(),
        )
        .await
        .is_err()
        {
            return Err(OrchestratorError::PreRebalanceJanitorRunFailed(vec![
                name.to_string(),
            ]));
        }

        let bucket = self
            .store
            .get_bucket(name)
            .ok_or_else(|| OrchestratorError::Internal(format!("bucket '{name}' disappeared")))?;
        let groups = self.store.server_groups();
        let history = self.store.past_vbucket_maps();
        let (target, opts) = generate_bucket_map(&bucket, keep_kv, &groups, &history)?;

        let movements = vbucket_movements(&bucket.map, &target);
        info!(
            "Bucket '{}': target map requires {} position change(s).",
            name, movements
        );

        if movements > 0 {
            self.store.update_bucket(name, |b| {
                b.fast_forward_map = Some(target.clone());
            });
            self.store.sync_announcements();

            let progress_tx = self.progress.clone();
            let progress: ProgressFn = Arc::new(move |fractions| {
                let mean = if fractions.is_empty() {
                    1.0
                } else {
                    fractions.values().sum::<f64>() / fractions.len() as f64
                };
                let _ = progress_tx.send((index as f64 + mean) / total as f64);
            });

            let mover = VbucketMover::new(
                name,
                bucket.map.clone(),
                target.clone(),
                self.engine.clone(),
                self.config.moves_per_node,
                self.config.query_states_timeout(),
                self.stop.clone(),
                Some(progress),
            );
            match mover.run().await {
                Ok(MoverOutcome::Completed) => {}
                Ok(MoverOutcome::Stopped) => {
                    self.bus.publish(BucketEvent::Stopped {
                        bucket: name.to_string(),
                        node: self.self_node.clone(),
                        reason: "stopped".to_string(),
                    });
                    return Err(OrchestratorError::Stopped);
                }
                Err(e) => return Err(OrchestratorError::MoverCrashed(e.to_string())),
            }

            if !moving_out.is_empty() {
                // Let clients see graceful not-my-vbucket responses from the
                // departing nodes before they drop out of the server set.
                self.sleep_or_stop(self.config.rebalance_out_delay()).await?;
            }
        }

        self.store.commit_bucket_map(name, target.clone(), &opts);
        self.store.update_bucket(name, |b| {
            b.servers = keep_kv.clone();
        });
        self.store.sync_announcements();

        verify_replication(
            &self.engine,
            name,
            &target,
            keep_kv,
            self.config.query_states_timeout(),
        )
        .await?;

        self.bus.publish(BucketEvent::MapCommitted {
            bucket: name.to_string(),
            moves: movements,
        });
        Ok(())
    }
}
