//! # Ring Routing Table
//!
//! This module implements the path table at the heart of VRR routing.
//!
//! ## Key Concepts
//!
//! - **Endpoint buckets**: an ordered map keyed by ring identifier; each
//!   bucket holds the path entries terminating at that endpoint. An entry is
//!   mirrored under both of its endpoints, so a path is findable from either
//!   end.
//! - **Greedy selection**: a lookup walks to the bucket whose key is
//!   ring-closest to the destination. Reaching the local node's own bucket is
//!   terminal: the packet is for us.
//! - **Orientation**: `na` is the next hop on the `ea` side of the path and
//!   `nb` the next hop on the `eb` side, so the matched bucket key decides
//!   which hop continues toward the destination.
//!
//! Entries between the same endpoint pair are distinguished by path id; a
//! lookup prefers the highest path id (most recent on a tie). Inserting a
//! duplicate path id at an endpoint is rejected so concurrent setups stay
//! unambiguous.
//!
//! The table is plain data; the engine serializes access through a single
//! exclusive lock and copies anything it needs before releasing it.

use std::collections::BTreeMap;

use crate::identity::NodeId;

/// One bidirectional path through this node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteEntry {
    /// Endpoint A (the setup's source).
    pub ea: NodeId,
    /// Endpoint B (the setup's destination); may be `NONE` in degenerate
    /// entries and is then not bucketed.
    pub eb: NodeId,
    /// Next hop toward `ea`.
    pub na: NodeId,
    /// Next hop toward `eb`.
    pub nb: NodeId,
    /// Identifier distinguishing concurrent paths between the same pair.
    pub path_id: u32,
    /// Insertion order, used only to break path-id ties.
    seq: u64,
}

/// Ordered map from endpoint id to the path entries ending there.
#[derive(Debug)]
pub struct RoutingTable {
    local: NodeId,
    buckets: BTreeMap<NodeId, Vec<RouteEntry>>,
    seq: u64,
}

impl RoutingTable {
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            buckets: BTreeMap::new(),
            seq: 0,
        }
    }

    /// Number of distinct endpoint buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Insert a path entry under both endpoint buckets.
    ///
    /// Returns false (and stores nothing) when either endpoint already holds
    /// an entry with this path id.
    pub fn insert(&mut self, ea: NodeId, eb: NodeId, na: NodeId, nb: NodeId, path_id: u32) -> bool {
        let duplicate = [ea, eb]
            .iter()
            .filter(|e| !e.is_none())
            .any(|e| self.bucket_has_path(*e, path_id));
        if duplicate {
            return false;
        }

        self.seq += 1;
        let entry = RouteEntry {
            ea,
            eb,
            na,
            nb,
            path_id,
            seq: self.seq,
        };

        if !ea.is_none() {
            self.buckets.entry(ea).or_default().push(entry.clone());
        }
        if !eb.is_none() && eb != ea {
            self.buckets.entry(eb).or_default().push(entry);
        }
        true
    }

    /// Remove the entry identified by `(endpoint, path_id)` from both of its
    /// buckets and return it; its next hops drive teardown propagation.
    pub fn remove(&mut self, endpoint: NodeId, path_id: u32) -> Option<RouteEntry> {
        let entry = self.take_from_bucket(endpoint, path_id)?;
        let other = if entry.ea == endpoint {
            entry.eb
        } else {
            entry.ea
        };
        if !other.is_none() && other != endpoint {
            self.take_from_bucket(other, path_id);
        }
        Some(entry)
    }

    /// Next hop toward `dst`, skipping the bucket of `exclude` if given.
    ///
    /// Walks to the ring-closest endpoint bucket; the local node's own bucket
    /// is terminal (None). Among the bucket's entries the highest path id
    /// wins, and the hop on the matched endpoint's side of that entry is
    /// returned.
    pub fn search(&self, dst: NodeId, exclude: Option<NodeId>) -> Option<NodeId> {
        let key = self.closest_key(dst, exclude)?;
        if key == self.local {
            return None;
        }
        let entry = self
            .buckets
            .get(&key)?
            .iter()
            .max_by_key(|e| (e.path_id, e.seq))?;
        let hop = if key == entry.ea { entry.na } else { entry.nb };
        if hop.is_none() || hop == self.local {
            None
        } else {
            Some(hop)
        }
    }

    /// True if any bucket holds an entry with this path id.
    pub fn has_path_id(&self, path_id: u32) -> bool {
        self.buckets
            .values()
            .any(|entries| entries.iter().any(|e| e.path_id == path_id))
    }

    /// Snapshot of the entries terminating at `endpoint`.
    pub fn entries_at(&self, endpoint: NodeId) -> Vec<RouteEntry> {
        self.buckets.get(&endpoint).cloned().unwrap_or_default()
    }

    /// `(endpoint, path_id)` pairs of every entry using `hop` as a next hop.
    /// Used to tear down paths through a reaped neighbor.
    pub fn paths_via(&self, hop: NodeId) -> Vec<(NodeId, u32)> {
        let mut found = Vec::new();
        for entries in self.buckets.values() {
            for e in entries {
                if (e.na == hop || e.nb == hop) && !found.contains(&(e.ea, e.path_id)) {
                    found.push((e.ea, e.path_id));
                }
            }
        }
        found
    }

    fn bucket_has_path(&self, endpoint: NodeId, path_id: u32) -> bool {
        self.buckets
            .get(&endpoint)
            .is_some_and(|entries| entries.iter().any(|e| e.path_id == path_id))
    }

    fn take_from_bucket(&mut self, endpoint: NodeId, path_id: u32) -> Option<RouteEntry> {
        let entries = self.buckets.get_mut(&endpoint)?;
        let idx = entries.iter().position(|e| e.path_id == path_id)?;
        let entry = entries.remove(idx);
        if entries.is_empty() {
            self.buckets.remove(&endpoint);
        }
        Some(entry)
    }

    /// Ring-closest bucket key to `dst`, honoring the exclusion.
    ///
    /// The closest key in circular order is always among the immediate
    /// successors/predecessors of `dst`; the exclusion removes at most one
    /// key, so two candidates per direction suffice.
    fn closest_key(&self, dst: NodeId, exclude: Option<NodeId>) -> Option<NodeId> {
        let not_excluded = |k: &&NodeId| Some(**k) != exclude;

        let successors = self
            .buckets
            .range(dst..)
            .map(|(k, _)| k)
            .chain(self.buckets.range(..dst).map(|(k, _)| k))
            .filter(not_excluded)
            .take(2);
        let predecessors = self
            .buckets
            .range(..dst)
            .rev()
            .map(|(k, _)| k)
            .chain(self.buckets.range(dst..).rev().map(|(k, _)| k))
            .filter(not_excluded)
            .take(2);

        successors
            .chain(predecessors)
            .copied()
            .min_by_key(|k| (dst.distance(*k), k.raw()))
    }
}
