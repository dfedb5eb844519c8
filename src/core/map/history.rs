// src/core/map/history.rs

//! Bounded history of committed vbucket maps.
//!
//! Every map commit appends here together with its generation options. The
//! history feeds two consumers: map generation (reuse of a recent
//! compatible map avoids data shuffling) and delta recovery (locating the
//! map a returning node's on-disk data corresponds to).

use super::VbucketMap;
use super::algebra::is_trivially_compatible_past_map;
use super::generator::MapOptions;
use crate::core::topology::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapHistory {
    entries: Vec<(VbucketMap, MapOptions)>,
    limit: usize,
}

impl MapHistory {
    pub fn new(limit: usize) -> Self {
        MapHistory {
            entries: Vec::new(),
            limit: limit.max(1),
        }
    }

    /// Appends a committed map, dropping the oldest entry past the bound.
    /// Recording the same map twice in a row is a no-op.
    pub fn record(&mut self, map: VbucketMap, opts: MapOptions) {
        if self.entries.last().is_some_and(|(m, o)| *m == map && *o == opts) {
            return;
        }
        self.entries.push((map, opts));
        if self.entries.len() > self.limit {
            let excess = self.entries.len() - self.limit;
            self.entries.drain(..excess);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries from most to least recent.
    pub fn iter_recent(&self) -> impl Iterator<Item = &(VbucketMap, MapOptions)> {
        self.entries.iter().rev()
    }

    /// Filters the history down to maps congruent with the current map
    /// under the current options: same vbucket count, identical option
    /// hash, and no reference to a node outside `all_nodes`. Most recent
    /// first.
    pub fn find_matching_past_maps(
        &self,
        all_nodes: &BTreeSet<NodeId>,
        current_map: &VbucketMap,
        current_opts: &MapOptions,
    ) -> Vec<&(VbucketMap, MapOptions)> {
        self.iter_recent()
            .filter(|(past_map, past_opts)| {
                is_trivially_compatible_past_map(
                    all_nodes,
                    current_map,
                    current_opts,
                    past_map,
                    past_opts,
                )
            })
            .collect()
    }
}
