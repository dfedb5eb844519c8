//! Shared harness: an in-process config store, a simulated engine, and the
//! orchestrator service wired together the way the daemon would.

use std::collections::BTreeSet;
use std::sync::Arc;
use tesseradb_orchestrator::config::OrchestratorConfig;
use tesseradb_orchestrator::core::engine::sim::SimEngine;
use tesseradb_orchestrator::core::engine::EngineClient;
use tesseradb_orchestrator::core::map::generator::generate_initial_map;
use tesseradb_orchestrator::core::service::OrchestratorService;
use tesseradb_orchestrator::core::store::ConfigStore;
use tesseradb_orchestrator::core::topology::{
    BucketConfig, Membership, NodeId, ServerGroups, Service,
};

pub fn n(name: &str) -> NodeId {
    NodeId::new(name)
}

pub fn nodes(names: &[&str]) -> BTreeSet<NodeId> {
    names.iter().map(NodeId::new).collect()
}

/// Aggressive timeouts and no rebalance-out delay, so tests stay fast while
/// still exercising every bounded wait.
pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.readiness_timeout_secs = 5;
    config.query_states_timeout_secs = 5;
    config.apply_config_timeout_secs = 5;
    config.buckets_shutdown_timeout_secs = 2;
    config.rebalance_out_delay_secs = 0;
    config
}

pub struct Cluster {
    pub store: Arc<ConfigStore>,
    pub sim: Arc<SimEngine>,
    pub service: OrchestratorService,
}

impl Cluster {
    /// Active KV nodes plus one committed, balanced membase bucket whose
    /// map sits in history and whose states are loaded into the engine.
    pub fn with_bucket(
        node_names: &[&str],
        bucket_name: &str,
        num_vbuckets: usize,
        num_replicas: usize,
    ) -> Self {
        let cluster = Cluster::bare(node_names);
        cluster.seed_bucket(bucket_name, num_vbuckets, num_replicas, true);
        cluster
    }

    /// Same, but the bucket's map is installed without a history record,
    /// as if every commit before this process's lifetime were lost.
    pub fn with_unrecorded_bucket(
        node_names: &[&str],
        bucket_name: &str,
        num_vbuckets: usize,
        num_replicas: usize,
    ) -> Self {
        let cluster = Cluster::bare(node_names);
        cluster.seed_bucket(bucket_name, num_vbuckets, num_replicas, false);
        cluster
    }

    pub fn bare(node_names: &[&str]) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let store = Arc::new(ConfigStore::in_process(8));
        for name in node_names {
            store.add_node(n(name), BTreeSet::from([Service::Kv]), Membership::Active);
        }
        let sim = SimEngine::new();
        let engine: Arc<dyn EngineClient> = sim.clone();
        let service = OrchestratorService::new(
            store.clone(),
            engine,
            test_config(),
            n(node_names[0]),
        );
        Cluster { store, sim, service }
    }

    pub fn seed_bucket(
        &self,
        bucket_name: &str,
        num_vbuckets: usize,
        num_replicas: usize,
        record_history: bool,
    ) {
        let keep = self.store.active_kv_nodes();
        let mut bucket = BucketConfig::new_membase(bucket_name, num_vbuckets, num_replicas);
        let (map, opts) =
            generate_initial_map(&bucket, &keep, &ServerGroups::default()).unwrap();
        bucket.servers = keep;
        bucket.map = map.clone();
        bucket.map_opts_hash = Some(opts.opts_hash());
        self.store.insert_bucket(bucket);
        if record_history {
            self.store.record_past_map(map.clone(), opts);
        }
        self.sim.apply_map(bucket_name, &map);
    }

    pub fn add_node(&self, name: &str) {
        self.store
            .add_node(n(name), BTreeSet::from([Service::Kv]), Membership::InactiveAdded);
    }

    pub fn bucket(&self, name: &str) -> BucketConfig {
        self.store.get_bucket(name).unwrap()
    }
}
