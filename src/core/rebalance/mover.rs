// src/core/rebalance/mover.rs

//! The per-bucket vbucket mover: drives every vbucket whose chain differs
//! between the current and target map through the transition
//!
//! ```text
//! ACTIVE_ON_CUR --(replicate target replicas)--> REPLICAS_READY
//! REPLICAS_READY --(takeover on new master)----> ACTIVE_ON_NEW
//! ACTIVE_ON_NEW --(delete on departed nodes)---> CLEAN
//! ```
//!
//! At most one transition is in flight per vbucket, and at most
//! `moves_per_pair` per (old master, new master) pair, which backpressures
//! the engine. Replication is verified drained before any takeover. A stop
//! request lets in-flight transitions finish and reports how far the mover
//! got.

use super::StopToken;
use crate::core::engine::{EngineClient, VbucketState};
use crate::core::errors::OrchestratorError;
use crate::core::map::algebra::chain_distance;
use crate::core::map::{Chain, VbucketMap};
use crate::core::topology::NodeId;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Reports per-node completion fractions at coarse granularity.
pub type ProgressFn = Arc<dyn Fn(BTreeMap<NodeId, f64>) + Send + Sync>;

/// How a mover run ended, short of a fatal engine error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoverOutcome {
    Completed,
    /// Stopped before all transitions were scheduled; the cluster is in a
    /// consistent intermediate state.
    Stopped,
}

#[derive(Debug, Clone)]
struct Move {
    vbucket: u16,
    current: Chain,
    target: Chain,
    master_changed: bool,
}

type PairKey = (Option<NodeId>, Option<NodeId>);

pub struct VbucketMover {
    bucket: String,
    current: VbucketMap,
    target: VbucketMap,
    engine: Arc<dyn EngineClient>,
    moves_per_pair: usize,
    query_states_timeout: Duration,
    stop: StopToken,
    progress: Option<ProgressFn>,
}

impl VbucketMover {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bucket: &str,
        current: VbucketMap,
        target: VbucketMap,
        engine: Arc<dyn EngineClient>,
        moves_per_pair: usize,
        query_states_timeout: Duration,
        stop: StopToken,
        progress: Option<ProgressFn>,
    ) -> Self {
        VbucketMover {
            bucket: bucket.to_string(),
            current,
            target,
            engine,
            moves_per_pair: moves_per_pair.max(1),
            query_states_timeout,
            stop,
            progress,
        }
    }

    /// Runs every planned transition to completion, a stop, or the first
    /// fatal engine error.
    pub async fn run(self) -> Result<MoverOutcome, OrchestratorError> {
        let mut pending = self.plan_moves();
        let total = pending.len();
        if total == 0 {
            debug!("Bucket '{}': maps are identical, nothing to move.", self.bucket);
            return Ok(MoverOutcome::Completed);
        }
        info!(
            "Bucket '{}': starting mover with {} vbucket transition(s).",
            self.bucket, total
        );

        let node_totals = Self::node_totals(&pending);
        let mut node_done: BTreeMap<NodeId, usize> = BTreeMap::new();
        let mut pair_load: HashMap<PairKey, usize> = HashMap::new();
        let mut in_flight: JoinSet<(u16, PairKey, Vec<NodeId>, Result<(), OrchestratorError>)> =
            JoinSet::new();
        let mut done = 0usize;
        let mut fatal: Option<OrchestratorError> = None;
        let mut stopped = false;

        loop {
            if !stopped && fatal.is_none() {
                self.schedule_eligible(&mut pending, &mut pair_load, &mut in_flight);
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                joined = in_flight.join_next() => {
                    let Some(joined) = joined else { continue };
                    match joined {
                        Ok((vbucket, pair, nodes, result)) => {
                            *pair_load.entry(pair).or_insert(0) -= 1;
                            match result {
                                Ok(()) => {
                                    done += 1;
                                    for node in nodes {
                                        *node_done.entry(node).or_insert(0) += 1;
                                    }
                                    self.report_progress(&node_totals, &node_done);
                                }
                                Err(e) => {
                                    warn!(
                                        "Bucket '{}': transition of vbucket {} failed: {}",
                                        self.bucket, vbucket, e
                                    );
                                    fatal.get_or_insert(e);
                                }
                            }
                        }
                        Err(join_err) => {
                            fatal.get_or_insert(OrchestratorError::Internal(format!(
                                "mover worker panicked: {join_err}"
                            )));
                        }
                    }
                }
                _ = self.stop.stopped(), if !stopped => {
                    info!(
                        "Bucket '{}': stop requested; letting {} in-flight transition(s) finish.",
                        self.bucket,
                        in_flight.len()
                    );
                    stopped = true;
                }
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }
        if stopped && done < total {
            info!(
                "Bucket '{}': mover stopped after {}/{} transitions.",
                self.bucket, done, total
            );
            return Ok(MoverOutcome::Stopped);
        }
        info!("Bucket '{}': mover completed {} transition(s).", self.bucket, done);
        Ok(MoverOutcome::Completed)
    }

    /// All chains that differ, cheapest first; within equal distance,
    /// master-changing transitions go first to free the old master sooner.
    fn plan_moves(&self) -> VecDeque<Move> {
        let mut moves: Vec<Move> = self
            .current
            .chains
            .iter()
            .zip(self.target.chains.iter())
            .enumerate()
            .filter(|(_, (cur, tgt))| cur != tgt)
            .map(|(vb, (cur, tgt))| Move {
                vbucket: vb as u16,
                current: cur.clone(),
                target: tgt.clone(),
                master_changed: cur.first() != tgt.first(),
            })
            .collect();
        moves.sort_by_key(|m| {
            (
                chain_distance(&m.current, &m.target),
                if m.master_changed { 0 } else { 1 },
                m.vbucket,
            )
        });
        moves.into()
    }

    fn node_totals(moves: &VecDeque<Move>) -> BTreeMap<NodeId, usize> {
        let mut totals = BTreeMap::new();
        for m in moves {
            for node in Self::involved_nodes(m) {
                *totals.entry(node).or_insert(0) += 1;
            }
        }
        totals
    }

    fn involved_nodes(m: &Move) -> BTreeSet<NodeId> {
        m.current
            .iter()
            .chain(m.target.iter())
            .flatten()
            .cloned()
            .collect()
    }

    fn pair_key(m: &Move) -> PairKey {
        (
            m.current.first().cloned().flatten(),
            m.target.first().cloned().flatten(),
        )
    }

    fn schedule_eligible(
        &self,
        pending: &mut VecDeque<Move>,
        pair_load: &mut HashMap<PairKey, usize>,
        in_flight: &mut JoinSet<(u16, PairKey, Vec<NodeId>, Result<(), OrchestratorError>)>,
    ) {
        let mut deferred = VecDeque::new();
        while let Some(m) = pending.pop_front() {
            let pair = Self::pair_key(&m);
            let load = pair_load.entry(pair.clone()).or_insert(0);
            if *load >= self.moves_per_pair {
                deferred.push_back(m);
                continue;
            }
            *load += 1;

            let engine = self.engine.clone();
            let bucket = self.bucket.clone();
            let timeout = self.query_states_timeout;
            let nodes: Vec<NodeId> = Self::involved_nodes(&m).into_iter().collect();
            in_flight.spawn(async move {
                let vbucket = m.vbucket;
                let result = execute_move(engine, &bucket, m, timeout).await;
                (vbucket, pair, nodes, result)
            });
        }
        *pending = deferred;
    }

    fn report_progress(
        &self,
        totals: &BTreeMap<NodeId, usize>,
        done: &BTreeMap<NodeId, usize>,
    ) {
        if let Some(progress) = &self.progress {
            let fractions = totals
                .iter()
                .map(|(node, total)| {
                    let d = done.get(node).copied().unwrap_or(0);
                    (node.clone(), d as f64 / (*total).max(1) as f64)
                })
                .collect();
            progress(fractions);
        }
    }
}

/// One vbucket's transition, start to finish.
async fn execute_move(
    engine: Arc<dyn EngineClient>,
    bucket: &str,
    m: Move,
    query_states_timeout: Duration,
) -> Result<(), OrchestratorError> {
    let vb = m.vbucket;
    let cur_master = m.current.first().cloned().flatten();
    let tgt_master = m.target.first().cloned().flatten();
    let cur_nodes: BTreeSet<NodeId> = m.current.iter().flatten().cloned().collect();
    let tgt_nodes: BTreeSet<NodeId> = m.target.iter().flatten().cloned().collect();

    // Step 1: establish replication into every target node that needs it.
    if m.master_changed {
        if let (Some(new_master), Some(old_master)) = (&tgt_master, &cur_master) {
            engine
                .set_vbucket_state(
                    bucket,
                    new_master,
                    vb,
                    VbucketState::Replica {
                        of: Some(old_master.clone()),
                    },
                )
                .await?;
        }
    }
    for replica in m.target.iter().skip(1).flatten() {
        // The outgoing master keeps serving until the takeover below.
        if m.master_changed && Some(replica) == cur_master.as_ref() {
            continue;
        }
        engine
            .set_vbucket_state(
                bucket,
                replica,
                vb,
                VbucketState::Replica {
                    of: tgt_master.clone(),
                },
            )
            .await?;
    }

    // Step 2: refuse to promote until the stream into the new master has
    // drained, then take over and demote the outgoing master.
    if m.master_changed {
        if let Some(new_master) = &tgt_master {
            engine
                .query_states(bucket, std::slice::from_ref(new_master), query_states_timeout)
                .await?;
            engine
                .wait_for_replication_drain(bucket, new_master, vb)
                .await?;
            engine
                .set_vbucket_state(bucket, new_master, vb, VbucketState::Active)
                .await?;
        }
        if let Some(old_master) = &cur_master {
            if tgt_nodes.contains(old_master) {
                engine
                    .set_vbucket_state(
                        bucket,
                        old_master,
                        vb,
                        VbucketState::Replica {
                            of: tgt_master.clone(),
                        },
                    )
                    .await?;
            }
        }
    }

    // Step 3: delete the vbucket on nodes leaving the chain.
    for node in cur_nodes.difference(&tgt_nodes) {
        engine.delete_vbucket(bucket, node, vb).await?;
    }

    Ok(())
}
