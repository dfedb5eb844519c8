// src/core/store.rs

//! The cluster config store: the only shared writable resource.
//!
//! All durable orchestration state lives here: node membership and
//! recovery markers, bucket configs and their maps, server groups, service
//! assignments, failover records, and the map history. Multi-field bucket
//! updates happen atomically under one lock; remote propagation goes
//! through a pluggable transport so the replication subsystem stays a
//! collaborator.

use crate::core::errors::OrchestratorError;
use crate::core::map::VbucketMap;
use crate::core::map::generator::MapOptions;
use crate::core::map::history::MapHistory;
use crate::core::rpc;
use crate::core::topology::{BucketConfig, Membership, NodeId, RecoveryKind, ServerGroups, Service};
use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Per-node record kept in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub membership: Membership,
    pub recovery: RecoveryKind,
    /// Services the node is provisioned to run.
    pub services: BTreeSet<Service>,
}

/// The durable part of the store, serialized to disk between runs.
#[derive(Debug, Serialize, Deserialize)]
struct SerializableStoreState {
    nodes: BTreeMap<NodeId, NodeInfo>,
    buckets: Vec<BucketConfig>,
    server_groups: ServerGroups,
    failover_vbuckets: BTreeMap<NodeId, BTreeMap<String, BTreeSet<u16>>>,
    history: MapHistory,
}

/// Transport used to push buffered config writes to a remote node. The
/// in-process implementation always succeeds; tests substitute failing or
/// slow transports.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn push_config(&self, node: &NodeId) -> Result<(), OrchestratorError>;
}

/// Default transport for a single-process deployment.
pub struct LocalSync;

#[async_trait]
impl SyncTransport for LocalSync {
    async fn push_config(&self, _node: &NodeId) -> Result<(), OrchestratorError> {
        Ok(())
    }
}

pub struct ConfigStore {
    nodes: DashMap<NodeId, NodeInfo>,
    buckets: RwLock<IndexMap<String, BucketConfig>>,
    server_groups: RwLock<ServerGroups>,
    /// Active service assignment, distinct from per-node provisioning.
    service_map: DashMap<Service, BTreeSet<NodeId>>,
    /// For each hard-failed-over node: per bucket, the vbuckets it was
    /// serving at the moment of failover.
    failover_vbuckets: DashMap<NodeId, BTreeMap<String, BTreeSet<u16>>>,
    history: RwLock<MapHistory>,
    transport: Arc<dyn SyncTransport>,
}

impl ConfigStore {
    pub fn new(history_limit: usize, transport: Arc<dyn SyncTransport>) -> Self {
        ConfigStore {
            nodes: DashMap::new(),
            buckets: RwLock::new(IndexMap::new()),
            server_groups: RwLock::new(ServerGroups::default()),
            service_map: DashMap::new(),
            failover_vbuckets: DashMap::new(),
            history: RwLock::new(MapHistory::new(history_limit)),
            transport,
        }
    }

    pub fn in_process(history_limit: usize) -> Self {
        Self::new(history_limit, Arc::new(LocalSync))
    }

    // --- Nodes ---

    pub fn add_node(&self, node: NodeId, services: BTreeSet<Service>, membership: Membership) {
        self.nodes.insert(
            node,
            NodeInfo {
                membership,
                recovery: RecoveryKind::None,
                services,
            },
        );
    }

    pub fn node_info(&self, node: &NodeId) -> Option<NodeInfo> {
        self.nodes.get(node).map(|e| e.value().clone())
    }

    pub fn contains_node(&self, node: &NodeId) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn all_nodes(&self) -> BTreeSet<NodeId> {
        self.nodes.iter().map(|e| e.key().clone()).collect()
    }

    pub fn set_membership(&self, node: &NodeId, membership: Membership) {
        if let Some(mut info) = self.nodes.get_mut(node) {
            info.membership = membership;
        }
    }

    pub fn set_recovery(&self, node: &NodeId, recovery: RecoveryKind) {
        if let Some(mut info) = self.nodes.get_mut(node) {
            info.recovery = recovery;
        }
    }

    /// Removes the node from the cluster entirely: membership, service
    /// assignments, and server groups.
    pub fn eject_node(&self, node: &NodeId) {
        info!("Ejecting node '{}' from the cluster config.", node);
        self.nodes.remove(node);
        for mut entry in self.service_map.iter_mut() {
            entry.value_mut().remove(node);
        }
        let mut groups = self.server_groups.write();
        for members in groups.groups.values_mut() {
            members.remove(node);
        }
    }

    /// Nodes provisioned for a service, regardless of membership.
    pub fn nodes_running(&self, service: Service) -> BTreeSet<NodeId> {
        self.nodes
            .iter()
            .filter(|e| e.value().services.contains(&service))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Active members provisioned for the KV service.
    pub fn active_kv_nodes(&self) -> BTreeSet<NodeId> {
        self.nodes
            .iter()
            .filter(|e| {
                e.value().membership == Membership::Active
                    && e.value().services.contains(&Service::Kv)
            })
            .map(|e| e.key().clone())
            .collect()
    }

    // --- Service map ---

    pub fn set_service_nodes(&self, service: Service, nodes: BTreeSet<NodeId>) {
        self.service_map.insert(service, nodes);
    }

    pub fn service_nodes(&self, service: Service) -> BTreeSet<NodeId> {
        self.service_map
            .get(&service)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn remove_node_from_services(&self, node: &NodeId) {
        for mut entry in self.service_map.iter_mut() {
            entry.value_mut().remove(node);
        }
    }

    // --- Server groups ---

    pub fn set_server_groups(&self, groups: ServerGroups) {
        *self.server_groups.write() = groups;
    }

    pub fn server_groups(&self) -> ServerGroups {
        self.server_groups.read().clone()
    }

    // --- Buckets ---

    pub fn insert_bucket(&self, config: BucketConfig) {
        self.buckets.write().insert(config.name.clone(), config);
    }

    pub fn remove_bucket(&self, name: &str) {
        self.buckets.write().shift_remove(name);
    }

    /// Bucket names in config order.
    pub fn bucket_names(&self) -> Vec<String> {
        self.buckets.read().keys().cloned().collect()
    }

    pub fn get_bucket(&self, name: &str) -> Option<BucketConfig> {
        self.buckets.read().get(name).cloned()
    }

    /// Applies `f` to the bucket config under the write lock: the
    /// compare-and-set surface for multi-field updates.
    pub fn update_bucket<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut BucketConfig) -> R,
    ) -> Option<R> {
        self.buckets.write().get_mut(name).map(f)
    }

    /// Atomically replaces several bucket configs at once. Used by the
    /// delta-recovery apply step.
    pub fn set_buckets(&self, configs: Vec<BucketConfig>) {
        let mut buckets = self.buckets.write();
        for config in configs {
            buckets.insert(config.name.clone(), config);
        }
    }

    /// Commits a new map for a bucket: replaces the whole map atomically,
    /// clears the fast-forward and delta-recovery maps, stores the option
    /// hash, and retires the map into history.
    pub fn commit_bucket_map(&self, name: &str, map: VbucketMap, opts: &MapOptions) {
        {
            let mut buckets = self.buckets.write();
            if let Some(bucket) = buckets.get_mut(name) {
                bucket.map = map.clone();
                bucket.map_opts_hash = Some(opts.opts_hash());
                bucket.fast_forward_map = None;
                bucket.delta_recovery_map = None;
            }
        }
        self.history.write().record(map, opts.clone());
        debug!("Committed new vbucket map for bucket '{}'.", name);
    }

    // --- Failover records ---

    pub fn record_failover_vbuckets(&self, node: &NodeId, bucket: &str, vbuckets: BTreeSet<u16>) {
        self.failover_vbuckets
            .entry(node.clone())
            .or_default()
            .insert(bucket.to_string(), vbuckets);
    }

    pub fn failover_vbuckets(&self, node: &NodeId) -> BTreeMap<String, BTreeSet<u16>> {
        self.failover_vbuckets
            .get(node)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn clear_failover_vbuckets(&self, node: &NodeId) {
        self.failover_vbuckets.remove(node);
    }

    // --- Map history ---

    pub fn past_vbucket_maps(&self) -> MapHistory {
        self.history.read().clone()
    }

    pub fn record_past_map(&self, map: VbucketMap, opts: MapOptions) {
        self.history.write().record(map, opts);
    }

    // --- Persistence ---

    /// Saves the durable store state to `path` atomically.
    pub fn save_config(&self, path: &str) -> std::io::Result<()> {
        let state = SerializableStoreState {
            nodes: self
                .nodes
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            buckets: self.buckets.read().values().cloned().collect(),
            server_groups: self.server_groups.read().clone(),
            failover_vbuckets: self
                .failover_vbuckets
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            history: self.history.read().clone(),
        };

        let content = serde_json::to_string_pretty(&state)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let temp_path = format!("{}.tmp-{}", path, rand::random::<u32>());
        std::fs::write(&temp_path, content)?;
        std::fs::rename(temp_path, path)?;
        info!("Cluster config saved to {}", path);
        Ok(())
    }

    /// Restores a store from a file written by [`Self::save_config`].
    pub fn load_config(
        path: &str,
        transport: Arc<dyn SyncTransport>,
        history_limit: usize,
    ) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let state: SerializableStoreState = serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let store = ConfigStore::new(history_limit, transport);
        for (node, info) in state.nodes {
            store.nodes.insert(node, info);
        }
        {
            let mut buckets = store.buckets.write();
            for bucket in state.buckets {
                buckets.insert(bucket.name.clone(), bucket);
            }
        }
        *store.server_groups.write() = state.server_groups;
        for (node, records) in state.failover_vbuckets {
            store.failover_vbuckets.insert(node, records);
        }
        *store.history.write() = state.history;
        Ok(store)
    }

    // --- Propagation ---

    /// Pushes locally buffered writes. The in-process store has nothing
    /// buffered; the call exists as the ordering point config readers rely
    /// on.
    pub fn sync_announcements(&self) {
        debug!("Config announcements flushed.");
    }

    /// Propagates the config to every node in `nodes`, bounded per node.
    /// Returns the nodes that could not be reached.
    pub async fn synchronize_remote(
        &self,
        nodes: &[NodeId],
        per_node_timeout: Duration,
    ) -> Result<(), Vec<NodeId>> {
        let transport = self.transport.clone();
        let result = rpc::multicall(nodes, per_node_timeout, |node| {
            let transport = transport.clone();
            async move { transport.push_config(&node).await }
        })
        .await;

        if result.all_good() {
            Ok(())
        } else {
            Err(result.failed_nodes())
        }
    }
}
