// src/core/service.rs

//! The orchestrator's service surface, consumed by the CLI/HTTP layer.
//!
//! Long-running operations (rebalance, graceful failover) are validated
//! synchronously and only then spawned as a worker, so a planning error
//! never has a durable side effect. At most one worker runs at a time; a
//! stop request forwards to it and its exit reason is surfaced to the
//! caller.

use crate::config::OrchestratorConfig;
use crate::core::engine::EngineClient;
use crate::core::errors::OrchestratorError;
use crate::core::events::EventBus;
use crate::core::failover;
use crate::core::failover::graceful::{plan_graceful_failover, run_graceful_failover};
use crate::core::rebalance::orchestrator::{RebalanceOrchestrator, RebalancePlan};
use crate::core::rebalance::{StopHandle, stop_channel};
use crate::core::recovery::{DeltaRecoveryRequest, build_delta_recovery_buckets};
use crate::core::store::ConfigStore;
use crate::core::topology::{NodeId, Service};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Rebalance,
    GracefulFailover,
}

struct ActiveWorker {
    kind: WorkerKind,
    stop: StopHandle,
    handle: JoinHandle<Result<(), OrchestratorError>>,
}

pub struct OrchestratorService {
    store: Arc<ConfigStore>,
    engine: Arc<dyn EngineClient>,
    bus: Arc<EventBus>,
    config: OrchestratorConfig,
    self_node: NodeId,
    active: Mutex<Option<ActiveWorker>>,
    progress_tx: Arc<watch::Sender<f64>>,
    progress_rx: watch::Receiver<f64>,
}

impl OrchestratorService {
    pub fn new(
        store: Arc<ConfigStore>,
        engine: Arc<dyn EngineClient>,
        config: OrchestratorConfig,
        self_node: NodeId,
    ) -> Self {
        let (progress_tx, progress_rx) = watch::channel(0.0);
        OrchestratorService {
            store,
            engine,
            bus: Arc::new(EventBus::new()),
            config,
            self_node,
            active: Mutex::new(None),
            progress_tx: Arc::new(progress_tx),
            progress_rx,
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Overall progress of the running operation, as a fraction.
    pub fn progress(&self) -> watch::Receiver<f64> {
        self.progress_rx.clone()
    }

    /// Hard failover, performed inline: it is short and must not race a
    /// running rebalance worker's view of the config.
    pub async fn orchestrate_failover(&self, node: &NodeId) -> Result<(), OrchestratorError> {
        failover::check_failover_possible(&self.store, node)?;
        failover::orchestrate_failover(
            &self.store,
            &self.engine,
            &self.bus,
            node,
            self.config.query_states_timeout(),
        )
        .await
    }

    /// Buckets that would lose a master if `node` were failed over now.
    pub fn validate_autofailover(&self, node: &NodeId) -> Result<(), Vec<String>> {
        failover::validate_autofailover(&self.store, node)
    }

    pub fn check_failover_possible(&self, node: &NodeId) -> Result<(), OrchestratorError> {
        failover::check_failover_possible(&self.store, node)
    }

    /// Validates and starts a rebalance worker. All planning errors are
    /// returned here, before the worker exists.
    pub fn start_rebalance(
        &self,
        keep: BTreeSet<NodeId>,
        eject: BTreeSet<NodeId>,
        failed: BTreeSet<NodeId>,
        delta_nodes: BTreeSet<NodeId>,
        delta_buckets: DeltaRecoveryRequest,
    ) -> Result<(), OrchestratorError> {
        let keep_kv: BTreeSet<NodeId> = self
            .store
            .nodes_running(Service::Kv)
            .intersection(&keep)
            .cloned()
            .collect();
        if keep_kv.is_empty() {
            return Err(OrchestratorError::NoKvNodesLeft);
        }
        for node in keep.iter().chain(eject.iter()) {
            if !self.store.contains_node(node) {
                return Err(OrchestratorError::UnknownNode(node.clone()));
            }
        }

        let delta_plans = if delta_nodes.is_empty() {
            Vec::new()
        } else {
            let all_nodes = self.store.all_nodes();
            let plans =
                build_delta_recovery_buckets(&self.store, &all_nodes, &delta_nodes, &delta_buckets);
            if plans.is_empty() {
                return Err(OrchestratorError::DeltaRecoveryNotPossible);
            }
            plans
        };

        let plan = RebalancePlan {
            keep,
            eject,
            failed,
            delta_nodes,
            delta_plans,
        };

        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return Err(OrchestratorError::InProgress);
        }

        let (stop_handle, stop_token) = stop_channel();
        let orchestrator = RebalanceOrchestrator::new(
            self.store.clone(),
            self.engine.clone(),
            self.bus.clone(),
            self.config.clone(),
            self.self_node.clone(),
            stop_token,
            self.progress_tx.clone(),
        );
        let handle = tokio::spawn(orchestrator.run(plan));
        *active = Some(ActiveWorker {
            kind: WorkerKind::Rebalance,
            stop: stop_handle,
            handle,
        });
        info!("Rebalance worker started.");
        Ok(())
    }

    /// Validates and starts a graceful failover worker.
    pub fn start_graceful_failover(&self, node: &NodeId) -> Result<(), OrchestratorError> {
        let drains = plan_graceful_failover(&self.store, node)?;

        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return Err(OrchestratorError::InProgress);
        }

        let (stop_handle, stop_token) = stop_channel();
        let handle = tokio::spawn(run_graceful_failover(
            self.store.clone(),
            self.engine.clone(),
            self.bus.clone(),
            self.config.clone(),
            node.clone(),
            drains,
            stop_token,
        ));
        *active = Some(ActiveWorker {
            kind: WorkerKind::GracefulFailover,
            stop: stop_handle,
            handle,
        });
        info!("Graceful failover worker started for '{}'.", node);
        Ok(())
    }

    /// Forwards a stop to the active worker, if any. Stopping an already
    /// finished worker is indistinguishable from success.
    pub fn stop(&self) {
        if let Some(worker) = self.active.lock().as_ref() {
            worker.stop.stop();
        }
    }

    /// Waits for the active worker and surfaces its exit reason. `None`
    /// when no worker was running.
    pub async fn wait(&self) -> Option<(WorkerKind, Result<(), OrchestratorError>)> {
        let worker = self.active.lock().take()?;
        let result = match worker.handle.await {
            Ok(result) => result,
            Err(join_err) => Err(OrchestratorError::Internal(format!(
                "worker panicked: {join_err}"
            ))),
        };
        Some((worker.kind, result))
    }
}
