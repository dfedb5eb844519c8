// src/core/topology.rs

//! Cluster membership, services, server groups, and bucket configuration.

use crate::core::map::VbucketMap;
use crate::core::map::generator::MapOptions;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// An interned node identifier. Cheap to clone; the total order over node
/// names is what makes map generation deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Arc<str>);

impl NodeId {
    pub fn new(name: impl AsRef<str>) -> Self {
        NodeId(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId::new(s)
    }
}

/// Cluster membership state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Membership {
    Active,
    InactiveAdded,
    InactiveFailed,
}

/// How a previously failed-over node should be brought back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryKind {
    #[default]
    None,
    Delta,
    Full,
}

/// The services a node can run. The orchestrator only moves data for `Kv`;
/// the rest participate in service-map updates and eject delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Service {
    Kv,
    Index,
    Query,
    Fts,
}

impl Service {
    pub const ALL: [Service; 4] = [Service::Kv, Service::Index, Service::Query, Service::Fts];

    pub fn name(&self) -> &'static str {
        match self {
            Service::Kv => "kv",
            Service::Index => "index",
            Service::Query => "query",
            Service::Fts => "fts",
        }
    }
}

/// A named server group (rack / fault domain).
pub type GroupId = Arc<str>;

/// Rack topology. Groups only act as anti-affinity tags when at least two
/// non-empty groups intersect the keep-set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerGroups {
    pub groups: BTreeMap<String, BTreeSet<NodeId>>,
}

impl ServerGroups {
    /// The enclosing group of a node, if any.
    pub fn group_of(&self, node: &NodeId) -> Option<GroupId> {
        self.groups
            .iter()
            .find(|(_, members)| members.contains(node))
            .map(|(name, _)| Arc::from(name.as_str()))
    }

    /// Counts groups that have at least one member in `keep`.
    pub fn populated_groups(&self, keep: &BTreeSet<NodeId>) -> usize {
        self.groups
            .values()
            .filter(|members| members.iter().any(|n| keep.contains(n)))
            .count()
    }
}

/// Bucket kind. Memcached buckets are stateless at this layer and only
/// participate in server-set changes; membase buckets carry vbucket maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketKind {
    Membase,
    Memcached,
}

/// Per-bucket configuration as stored in the config store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    pub name: String,
    pub kind: BucketKind,
    pub num_replicas: usize,
    pub num_vbuckets: usize,
    /// Nodes that currently host or should host the bucket.
    pub servers: BTreeSet<NodeId>,
    pub map: VbucketMap,
    /// The target map of an in-progress rebalance. Exists only for the
    /// duration of one bucket's move and is cleared on commit or failover.
    #[serde(default)]
    pub fast_forward_map: Option<VbucketMap>,
    /// Hash of the options the current map was generated with; a mismatch
    /// forces regeneration.
    #[serde(default)]
    pub map_opts_hash: Option<u64>,
    /// A candidate target map staged for delta recovery.
    #[serde(default)]
    pub delta_recovery_map: Option<(VbucketMap, MapOptions)>,
}

impl BucketConfig {
    pub fn new_membase(name: &str, num_vbuckets: usize, num_replicas: usize) -> Self {
        BucketConfig {
            name: name.to_string(),
            kind: BucketKind::Membase,
            num_replicas,
            num_vbuckets,
            servers: BTreeSet::new(),
            map: VbucketMap::empty(num_vbuckets, num_replicas),
            fast_forward_map: None,
            map_opts_hash: None,
            delta_recovery_map: None,
        }
    }

    pub fn new_memcached(name: &str) -> Self {
        BucketConfig {
            name: name.to_string(),
            kind: BucketKind::Memcached,
            num_replicas: 0,
            num_vbuckets: 0,
            servers: BTreeSet::new(),
            map: VbucketMap::empty(0, 0),
            fast_forward_map: None,
            map_opts_hash: None,
            delta_recovery_map: None,
        }
    }

    pub fn is_membase(&self) -> bool {
        self.kind == BucketKind::Membase
    }

    /// Chain length for this bucket's map.
    pub fn chain_len(&self) -> usize {
        self.num_replicas + 1
    }
}
