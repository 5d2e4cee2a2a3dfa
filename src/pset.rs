//! # Physical Neighbor Set
//!
//! Tracks the nodes reachable over the link layer, their link state, and
//! their failure counters. Link state follows a fixed transition table driven
//! by what each received hello reports about *us*:
//!
//! | current \ reported | Linked | Pending | Missing |
//! |--------------------|--------|---------|---------|
//! | Unknown            | Linked | Pending | Pending |
//! | Pending            | Linked | Linked  | Pending |
//! | Linked             | Linked | Linked  | Pending |
//! | Failed             | Linked | Pending | Pending |
//!
//! A neighbor listing us among its linked nodes proves both directions work.
//! Two fresh nodes first see each other in the peer's pending list, which is
//! why Pending x Pending promotes to Linked.
//!
//! Failure detection is two-staged: a neighbor whose fail counter reaches the
//! timeout is marked Failed (and disappears from hello lists), and one that
//! reaches twice the timeout is reaped entirely. Any accepted packet resets
//! the counter.
//!
//! The set is plain data behind the engine's lock; snapshot methods copy out
//! everything callers need so no lock is held across I/O.

use std::collections::HashMap;

use rand::seq::IteratorRandom;
use rand::Rng;

use crate::identity::{LinkAddr, NodeId};

/// Link state of a physical neighbor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkStatus {
    Unknown,
    Pending,
    Linked,
    Failed,
}

/// What a received hello reports about this node's place in the sender's
/// neighbor lists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HelloRole {
    /// We appear in the sender's linked (active or inactive) list.
    Linked,
    /// We appear in the sender's pending list.
    Pending,
    /// We appear nowhere.
    Missing,
}

/// The 4x3 hello transition table.
fn next_status(current: LinkStatus, reported: HelloRole) -> LinkStatus {
    use HelloRole as R;
    use LinkStatus as S;
    match (current, reported) {
        (_, R::Linked) => S::Linked,
        (S::Pending | S::Linked, R::Pending) => S::Linked,
        (S::Unknown | S::Failed, R::Pending) => S::Pending,
        (_, R::Missing) => S::Pending,
    }
}

/// One physical neighbor.
#[derive(Clone, Debug)]
pub struct PsetEntry {
    pub node: NodeId,
    pub link_addr: LinkAddr,
    pub status: LinkStatus,
    pub active: bool,
    pub fail_count: u32,
}

/// Outcome of folding a hello into the set.
#[derive(Clone, Copy, Debug)]
pub struct HelloOutcome {
    pub previous: LinkStatus,
    pub previous_active: bool,
    pub status: LinkStatus,
    pub sender_active: bool,
}

impl HelloOutcome {
    /// True when this hello moved the neighbor into the Linked-and-active
    /// state, from any other combination. That includes an already-linked
    /// neighbor that only now advertises itself active.
    pub fn became_linked_active(&self) -> bool {
        self.status == LinkStatus::Linked
            && self.sender_active
            && !(self.previous == LinkStatus::Linked && self.previous_active)
    }
}

/// The three id lists a hello advertises.
#[derive(Clone, Debug, Default)]
pub struct HelloLists {
    pub linked_active: Vec<NodeId>,
    pub linked_inactive: Vec<NodeId>,
    pub pending: Vec<NodeId>,
}

/// Set of link-reachable neighbors, bounded by `capacity`.
#[derive(Debug)]
pub struct PhysicalSet {
    capacity: usize,
    entries: HashMap<NodeId, PsetEntry>,
}

impl PhysicalSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.entries.contains_key(&node)
    }

    /// True when the neighbor is present with a live (Linked) link.
    pub fn is_linked(&self, node: NodeId) -> bool {
        self.entries
            .get(&node)
            .is_some_and(|e| e.status == LinkStatus::Linked)
    }

    pub fn get(&self, node: NodeId) -> Option<&PsetEntry> {
        self.entries.get(&node)
    }

    /// Add a neighbor. Returns false if it is already present or the set is
    /// at capacity.
    pub fn add(&mut self, node: NodeId, link_addr: LinkAddr, status: LinkStatus, active: bool) -> bool {
        if self.entries.contains_key(&node) || self.entries.len() >= self.capacity {
            return false;
        }
        self.entries.insert(
            node,
            PsetEntry {
                node,
                link_addr,
                status,
                active,
                fail_count: 0,
            },
        );
        true
    }

    /// Update a present neighbor's status and activity. False if absent.
    pub fn update_status(&mut self, node: NodeId, status: LinkStatus, active: bool) -> bool {
        match self.entries.get_mut(&node) {
            Some(entry) => {
                entry.status = status;
                entry.active = active;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, node: NodeId) -> Option<PsetEntry> {
        self.entries.remove(&node)
    }

    /// Resolve the sender of a frame by its link address.
    pub fn lookup_by_link_addr(&self, addr: LinkAddr) -> Option<NodeId> {
        self.entries
            .values()
            .find(|e| e.link_addr == addr)
            .map(|e| e.node)
    }

    pub fn link_addr_of(&self, node: NodeId) -> Option<LinkAddr> {
        self.entries.get(&node).map(|e| e.link_addr)
    }

    /// Fold a received hello into the set: get-or-create the entry, apply the
    /// transition table, record the sender's activity, and clear its fail
    /// counter. Returns None when a new neighbor cannot be admitted (set at
    /// capacity).
    pub fn observe_hello(
        &mut self,
        node: NodeId,
        link_addr: LinkAddr,
        role: HelloRole,
        sender_active: bool,
    ) -> Option<HelloOutcome> {
        if !self.entries.contains_key(&node)
            && !self.add(node, link_addr, LinkStatus::Unknown, sender_active)
        {
            return None;
        }
        let entry = self.entries.get_mut(&node)?;
        let previous = entry.status;
        let previous_active = entry.active;
        entry.status = next_status(previous, role);
        entry.link_addr = link_addr;
        entry.active = sender_active;
        entry.fail_count = 0;
        Some(HelloOutcome {
            previous,
            previous_active,
            status: entry.status,
            sender_active,
        })
    }

    /// Clear a neighbor's fail counter (any accepted packet counts as life).
    pub fn reset_fail_count(&mut self, node: NodeId) -> bool {
        match self.entries.get_mut(&node) {
            Some(entry) => {
                entry.fail_count = 0;
                true
            }
            None => false,
        }
    }

    /// One failure-detection tick: every entry's counter is incremented,
    /// entries reaching `mark_after` are marked Failed, and entries reaching
    /// twice that are removed. Returns (newly marked, reaped).
    pub fn tick_failures(&mut self, mark_after: u32) -> (Vec<NodeId>, Vec<PsetEntry>) {
        let mut marked = Vec::new();
        let mut reap = Vec::new();
        for entry in self.entries.values_mut() {
            entry.fail_count += 1;
            if entry.fail_count >= mark_after && entry.status != LinkStatus::Failed {
                entry.status = LinkStatus::Failed;
                marked.push(entry.node);
            }
            if entry.fail_count >= 2 * mark_after {
                reap.push(entry.node);
            }
        }
        let reaped = reap
            .into_iter()
            .filter_map(|node| self.entries.remove(&node))
            .collect();
        (marked, reaped)
    }

    /// Uniform random pick among Linked, active neighbors.
    pub fn pick_proxy<R: Rng>(&self, rng: &mut R) -> Option<NodeId> {
        self.entries
            .values()
            .filter(|e| e.status == LinkStatus::Linked && e.active)
            .choose(rng)
            .map(|e| e.node)
    }

    /// The three id lists advertised in our hellos. Failed and Unknown
    /// entries are not advertised.
    pub fn hello_lists(&self) -> HelloLists {
        let mut lists = HelloLists::default();
        for entry in self.entries.values() {
            match entry.status {
                LinkStatus::Linked if entry.active => lists.linked_active.push(entry.node),
                LinkStatus::Linked => lists.linked_inactive.push(entry.node),
                LinkStatus::Pending => lists.pending.push(entry.node),
                LinkStatus::Unknown | LinkStatus::Failed => {}
            }
        }
        lists
    }

    /// Owned copy of every entry, for inspection surfaces.
    pub fn snapshot(&self) -> Vec<PsetEntry> {
        self.entries.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn addr(last: u8) -> LinkAddr {
        LinkAddr::from_bytes([0xaa, 0xbb, 0xcc, 0xdd, 0xee, last])
    }

    fn id(raw: u32) -> NodeId {
        NodeId::new(raw)
    }

    #[test]
    fn first_hello_with_pending_role_creates_pending_entry() {
        let mut pset = PhysicalSet::new(20);
        let outcome = pset
            .observe_hello(id(150), addr(1), HelloRole::Pending, false)
            .expect("admitted");
        assert_eq!(outcome.previous, LinkStatus::Unknown);
        assert_eq!(outcome.status, LinkStatus::Pending);
        assert_eq!(pset.get(id(150)).unwrap().status, LinkStatus::Pending);
    }

    #[test]
    fn linked_report_promotes_pending() {
        let mut pset = PhysicalSet::new(20);
        pset.observe_hello(id(150), addr(1), HelloRole::Pending, false);
        let outcome = pset
            .observe_hello(id(150), addr(1), HelloRole::Linked, true)
            .expect("present");
        assert!(outcome.became_linked_active());
        assert!(outcome.sender_active);
        assert!(pset.is_linked(id(150)));
    }

    #[test]
    fn late_activation_of_linked_neighbor_still_triggers() {
        let mut pset = PhysicalSet::new(20);
        pset.observe_hello(id(150), addr(1), HelloRole::Pending, false);
        let outcome = pset
            .observe_hello(id(150), addr(1), HelloRole::Linked, false)
            .unwrap();
        assert!(!outcome.became_linked_active(), "inactive neighbor");

        let outcome = pset
            .observe_hello(id(150), addr(1), HelloRole::Linked, true)
            .unwrap();
        assert!(outcome.became_linked_active(), "activation flips the state");

        let outcome = pset
            .observe_hello(id(150), addr(1), HelloRole::Linked, true)
            .unwrap();
        assert!(!outcome.became_linked_active(), "steady state is quiet");
    }

    #[test]
    fn two_fresh_nodes_converge() {
        // Both sides start Unknown; each side's second hello observation sees
        // itself in the peer's pending list and must complete the handshake.
        let mut pset = PhysicalSet::new(20);
        pset.observe_hello(id(150), addr(1), HelloRole::Missing, false);
        assert_eq!(pset.get(id(150)).unwrap().status, LinkStatus::Pending);
        let outcome = pset
            .observe_hello(id(150), addr(1), HelloRole::Pending, false)
            .unwrap();
        assert_eq!(outcome.status, LinkStatus::Linked);
    }

    #[test]
    fn missing_report_demotes_linked() {
        let mut pset = PhysicalSet::new(20);
        pset.observe_hello(id(150), addr(1), HelloRole::Linked, true);
        let outcome = pset
            .observe_hello(id(150), addr(1), HelloRole::Missing, true)
            .unwrap();
        assert_eq!(outcome.status, LinkStatus::Pending);
    }

    #[test]
    fn hello_resets_fail_count() {
        let mut pset = PhysicalSet::new(20);
        pset.observe_hello(id(150), addr(1), HelloRole::Linked, true);

        let (marked, reaped) = pset.tick_failures(4);
        assert!(marked.is_empty() && reaped.is_empty());
        assert_eq!(pset.get(id(150)).unwrap().fail_count, 1);

        pset.observe_hello(id(150), addr(1), HelloRole::Linked, true);
        assert_eq!(pset.get(id(150)).unwrap().fail_count, 0);
    }

    #[test]
    fn failure_marking_and_reaping_are_staged() {
        let mut pset = PhysicalSet::new(20);
        pset.observe_hello(id(150), addr(1), HelloRole::Linked, true);

        for _ in 0..3 {
            let (marked, _) = pset.tick_failures(4);
            assert!(marked.is_empty());
        }
        let (marked, reaped) = pset.tick_failures(4);
        assert_eq!(marked, vec![id(150)]);
        assert!(reaped.is_empty());
        assert_eq!(pset.get(id(150)).unwrap().status, LinkStatus::Failed);

        for _ in 0..3 {
            let (_, reaped) = pset.tick_failures(4);
            assert!(reaped.is_empty());
        }
        let (_, reaped) = pset.tick_failures(4);
        assert_eq!(reaped.len(), 1);
        assert!(!pset.contains(id(150)));
    }

    #[test]
    fn proxy_pick_requires_linked_and_active() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut pset = PhysicalSet::new(20);
        pset.add(id(1), addr(1), LinkStatus::Linked, false);
        pset.add(id(2), addr(2), LinkStatus::Pending, true);
        pset.add(id(3), addr(3), LinkStatus::Failed, true);
        assert_eq!(pset.pick_proxy(&mut rng), None);

        pset.add(id(4), addr(4), LinkStatus::Linked, true);
        assert_eq!(pset.pick_proxy(&mut rng), Some(id(4)));
    }

    #[test]
    fn hello_lists_partition_by_status() {
        let mut pset = PhysicalSet::new(20);
        pset.add(id(1), addr(1), LinkStatus::Linked, true);
        pset.add(id(2), addr(2), LinkStatus::Linked, false);
        pset.add(id(3), addr(3), LinkStatus::Pending, false);
        pset.add(id(4), addr(4), LinkStatus::Failed, true);

        let lists = pset.hello_lists();
        assert_eq!(lists.linked_active, vec![id(1)]);
        assert_eq!(lists.linked_inactive, vec![id(2)]);
        assert_eq!(lists.pending, vec![id(3)]);
    }

    #[test]
    fn capacity_bounds_admission() {
        let mut pset = PhysicalSet::new(2);
        assert!(pset.add(id(1), addr(1), LinkStatus::Pending, false));
        assert!(pset.add(id(2), addr(2), LinkStatus::Pending, false));
        assert!(!pset.add(id(3), addr(3), LinkStatus::Pending, false));
        assert!(pset
            .observe_hello(id(4), addr(4), HelloRole::Missing, false)
            .is_none());
        // Known neighbors still update at capacity.
        assert!(pset
            .observe_hello(id(1), addr(1), HelloRole::Linked, true)
            .is_some());
    }

    #[test]
    fn link_addr_lookup_both_ways() {
        let mut pset = PhysicalSet::new(20);
        pset.add(id(150), addr(9), LinkStatus::Linked, true);
        assert_eq!(pset.lookup_by_link_addr(addr(9)), Some(id(150)));
        assert_eq!(pset.lookup_by_link_addr(addr(8)), None);
        assert_eq!(pset.link_addr_of(id(150)), Some(addr(9)));
    }
}
