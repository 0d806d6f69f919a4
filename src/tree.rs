//! Prefix tree storage.
//!
//! Nodes live in a slab arena and are addressed by 32-bit handles, so the
//! age list and parent links never hold raw pointers. Each node is one level
//! of the tree: 256 slots, one per value of the next address octet. Every
//! non-root node is threaded on an intrusive doubly-linked age list in
//! allocation order; eviction walks that list.
//!
//! The arena tracks an exact byte ledger (`allocated`) covering every live
//! node and counter. Callers check their budget against it before asking for
//! an allocation.

use crate::ewma::RateEwma;

/// Slots per node, one per octet value.
pub(crate) const FAN_OUT: usize = 256;

/// Maximum node depth: one level per IPv4 octet.
pub(crate) const MAX_DEPTH: usize = 4;

/// Arena handle for a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub(crate) struct NodeRef(u32);

impl NodeRef {
    pub(crate) const NULL: NodeRef = NodeRef(u32::MAX);

    #[inline]
    pub(crate) fn is_null(self) -> bool {
        self.0 == u32::MAX
    }

    #[inline]
    fn new(idx: usize) -> Self {
        debug_assert!(idx < u32::MAX as usize);
        NodeRef(idx as u32)
    }

    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Rate pair for one prefix, plus its optional refinement.
#[derive(Debug, Clone)]
pub(crate) struct Counter {
    pub(crate) fwd_rate: RateEwma,
    pub(crate) rev_rate: RateEwma,
    /// Next-level node, NULL until a zoom-in allocates it.
    pub(crate) child: NodeRef,
    /// Packets traversing this counter are stamped until this tick.
    pub(crate) anno_until: u64,
}

impl Default for Counter {
    fn default() -> Self {
        Self {
            fwd_rate: RateEwma::new(),
            rev_rate: RateEwma::new(),
            child: NodeRef::NULL,
            anno_until: 0,
        }
    }
}

type SlotArray = [Option<Box<Counter>>; FAN_OUT];

/// One level of the prefix tree.
#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) slots: Box<SlotArray>,
    /// The counter owning this node: (node, slot byte). None for the root.
    pub(crate) parent: Option<(NodeRef, u8)>,
    prev: NodeRef,
    next: NodeRef,
}

impl Node {
    fn new(parent: Option<(NodeRef, u8)>) -> Self {
        Self {
            slots: Box::new(std::array::from_fn(|_| None)),
            parent,
            prev: NodeRef::NULL,
            next: NodeRef::NULL,
        }
    }
}

/// Ledger cost of one node: the struct plus its boxed slot array.
pub(crate) const NODE_COST: usize =
    std::mem::size_of::<Node>() + std::mem::size_of::<SlotArray>();

/// Ledger cost of one counter.
pub(crate) const COUNTER_COST: usize = std::mem::size_of::<Counter>();

enum Entry {
    Occupied(Node),
    /// Free slot, chained through the free list.
    Vacant(NodeRef),
}

/// Arena-backed prefix tree with an intrusive age list and a byte ledger.
pub(crate) struct PrefixTree {
    entries: Vec<Entry>,
    free_head: NodeRef,
    root: NodeRef,
    first: NodeRef,
    last: NodeRef,
    allocated: usize,
}

impl PrefixTree {
    pub(crate) fn new() -> Self {
        let mut tree = Self {
            entries: Vec::with_capacity(64),
            free_head: NodeRef::NULL,
            root: NodeRef::NULL,
            first: NodeRef::NULL,
            last: NodeRef::NULL,
            allocated: 0,
        };
        tree.root = tree.alloc_entry(Node::new(None));
        tree.allocated = NODE_COST;
        tree
    }

    #[inline]
    pub(crate) fn root(&self) -> NodeRef {
        self.root
    }

    #[inline]
    pub(crate) fn first(&self) -> NodeRef {
        self.first
    }

    #[inline]
    pub(crate) fn last(&self) -> NodeRef {
        self.last
    }

    /// Bytes currently charged to live nodes and counters.
    #[inline]
    pub(crate) fn allocated(&self) -> usize {
        self.allocated
    }

    pub(crate) fn node(&self, r: NodeRef) -> &Node {
        match &self.entries[r.index()] {
            Entry::Occupied(node) => node,
            Entry::Vacant(_) => unreachable!("stale node handle"),
        }
    }

    pub(crate) fn node_mut(&mut self, r: NodeRef) -> &mut Node {
        match &mut self.entries[r.index()] {
            Entry::Occupied(node) => node,
            Entry::Vacant(_) => unreachable!("stale node handle"),
        }
    }

    #[inline]
    pub(crate) fn next_of(&self, r: NodeRef) -> NodeRef {
        self.node(r).next
    }

    #[inline]
    pub(crate) fn prev_of(&self, r: NodeRef) -> NodeRef {
        self.node(r).prev
    }

    pub(crate) fn counter(&self, node: NodeRef, byte: u8) -> Option<&Counter> {
        self.node(node).slots[byte as usize].as_deref()
    }

    pub(crate) fn counter_mut(&mut self, node: NodeRef, byte: u8) -> Option<&mut Counter> {
        self.node_mut(node).slots[byte as usize].as_deref_mut()
    }

    /// Place `counter` into an empty slot and charge the ledger.
    pub(crate) fn insert_counter(&mut self, node: NodeRef, byte: u8, counter: Counter) {
        let slot = &mut self.node_mut(node).slots[byte as usize];
        debug_assert!(slot.is_none());
        *slot = Some(Box::new(counter));
        self.allocated += COUNTER_COST;
    }

    /// Allocate a child node under the counter at (`parent`, `slot`), splice
    /// it at the age-list tail and charge the ledger.
    ///
    /// The owning counter must exist and must not already have a child.
    pub(crate) fn alloc_node(&mut self, parent: NodeRef, slot: u8) -> NodeRef {
        let r = self.alloc_entry(Node::new(Some((parent, slot))));

        let tail = self.last;
        {
            let node = self.node_mut(r);
            node.prev = tail;
            node.next = NodeRef::NULL;
        }
        if tail.is_null() {
            self.first = r;
        } else {
            self.node_mut(tail).next = r;
        }
        self.last = r;

        let owner = self
            .counter_mut(parent, slot)
            .expect("child allocated under a missing counter");
        debug_assert!(owner.child.is_null());
        owner.child = r;

        self.allocated += NODE_COST;
        r
    }

    /// Destroy `r` and everything below it.
    ///
    /// Counters are freed first (recursing into their children), then `r` is
    /// spliced off the age list, its owning counter's child link is cleared
    /// and its arena slot recycled. Returns the age-list neighbors `r` had at
    /// splice time; both are live nodes (or NULL), so an eviction walk can
    /// resume from either side.
    pub(crate) fn destroy_subtree(&mut self, r: NodeRef) -> (NodeRef, NodeRef) {
        debug_assert_ne!(r, self.root, "the root is never destroyed");
        self.drop_counters(r);

        let neighbors = self.unlink(r);
        if let Some((parent, slot)) = self.node(r).parent {
            // The owner is gone already when an ancestor is being destroyed.
            if let Some(owner) = self.counter_mut(parent, slot) {
                owner.child = NodeRef::NULL;
            }
        }
        self.free_entry(r);
        self.allocated -= NODE_COST;
        neighbors
    }

    /// Drop every counter of the root, destroying their subtrees. Afterwards
    /// only the root remains charged.
    pub(crate) fn clear_root_children(&mut self) {
        let root = self.root;
        self.drop_counters(root);
        debug_assert_eq!(self.allocated, NODE_COST);
    }

    fn drop_counters(&mut self, r: NodeRef) {
        for byte in 0..FAN_OUT {
            let child = match self.node_mut(r).slots[byte].take() {
                Some(counter) => {
                    self.allocated -= COUNTER_COST;
                    counter.child
                }
                None => continue,
            };
            if !child.is_null() {
                self.destroy_subtree(child);
            }
        }
    }

    fn unlink(&mut self, r: NodeRef) -> (NodeRef, NodeRef) {
        let (prev, next) = {
            let node = self.node(r);
            (node.prev, node.next)
        };
        if prev.is_null() {
            self.first = next;
        } else {
            self.node_mut(prev).next = next;
        }
        if next.is_null() {
            self.last = prev;
        } else {
            self.node_mut(next).prev = prev;
        }
        (prev, next)
    }

    fn alloc_entry(&mut self, node: Node) -> NodeRef {
        if self.free_head.is_null() {
            let r = NodeRef::new(self.entries.len());
            self.entries.push(Entry::Occupied(node));
            r
        } else {
            let r = self.free_head;
            match &self.entries[r.index()] {
                Entry::Vacant(next_free) => self.free_head = *next_free,
                Entry::Occupied(_) => unreachable!("corrupt free list"),
            }
            self.entries[r.index()] = Entry::Occupied(node);
            r
        }
    }

    fn free_entry(&mut self, r: NodeRef) {
        self.entries[r.index()] = Entry::Vacant(self.free_head);
        self.free_head = r;
    }
}

#[cfg(test)]
impl PrefixTree {
    /// Structural audit: the age list holds exactly the non-root nodes in a
    /// well-formed double linking, parent/child links are symmetric, depth
    /// stays within [`MAX_DEPTH`] and the byte ledger matches a recount.
    pub(crate) fn assert_consistent(&self) {
        use std::collections::HashSet;

        assert!(self.node(self.root).parent.is_none());

        let mut reachable = Vec::new();
        let mut bytes = 0usize;
        self.audit_walk(self.root, 1, &mut reachable, &mut bytes);
        assert_eq!(bytes, self.allocated, "byte ledger drift");

        let reachable: HashSet<NodeRef> = reachable.into_iter().collect();
        assert!(!reachable.contains(&self.root));

        let mut listed = HashSet::new();
        let mut prev = NodeRef::NULL;
        let mut cur = self.first;
        while !cur.is_null() {
            assert_eq!(self.node(cur).prev, prev, "broken prev link");
            assert!(listed.insert(cur), "age list visits a node twice");
            prev = cur;
            cur = self.node(cur).next;
        }
        assert_eq!(self.last, prev, "tail does not match forward walk");
        assert_eq!(listed, reachable, "age list != reachable non-root nodes");
    }

    fn audit_walk(
        &self,
        r: NodeRef,
        depth: usize,
        reachable: &mut Vec<NodeRef>,
        bytes: &mut usize,
    ) {
        assert!(depth <= MAX_DEPTH, "tree deeper than {MAX_DEPTH}");
        *bytes += NODE_COST;
        for byte in 0..FAN_OUT {
            if let Some(counter) = &self.node(r).slots[byte] {
                *bytes += COUNTER_COST;
                if !counter.child.is_null() {
                    assert_eq!(
                        self.node(counter.child).parent,
                        Some((r, byte as u8)),
                        "parent link does not point back"
                    );
                    reachable.push(counter.child);
                    self.audit_walk(counter.child, depth + 1, reachable, bytes);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> Counter {
        Counter::default()
    }

    #[test]
    fn fresh_tree_charges_only_the_root() {
        let tree = PrefixTree::new();
        assert_eq!(tree.allocated(), NODE_COST);
        assert!(tree.first().is_null());
        assert!(tree.last().is_null());
        tree.assert_consistent();
    }

    #[test]
    fn alloc_node_splices_at_tail() {
        let mut tree = PrefixTree::new();
        let root = tree.root();
        tree.insert_counter(root, 10, counter());
        let a = tree.alloc_node(root, 10);
        tree.insert_counter(root, 20, counter());
        let b = tree.alloc_node(root, 20);

        assert_eq!(tree.first(), a);
        assert_eq!(tree.last(), b);
        assert_eq!(tree.next_of(a), b);
        assert_eq!(tree.prev_of(b), a);
        assert_eq!(tree.allocated(), 2 * NODE_COST + 2 * COUNTER_COST);
        tree.assert_consistent();
    }

    #[test]
    fn destroy_returns_live_neighbors() {
        let mut tree = PrefixTree::new();
        let root = tree.root();
        for byte in [1u8, 2, 3] {
            tree.insert_counter(root, byte, counter());
            tree.alloc_node(root, byte);
        }
        let (a, b, c) = (tree.first(), tree.next_of(tree.first()), tree.last());

        let (prev, next) = tree.destroy_subtree(b);
        assert_eq!(prev, a);
        assert_eq!(next, c);
        assert_eq!(tree.next_of(a), c);
        assert!(tree.counter(root, 2).unwrap().child.is_null());
        tree.assert_consistent();
    }

    #[test]
    fn destroy_is_recursive_and_settles_the_ledger() {
        let mut tree = PrefixTree::new();
        let root = tree.root();
        tree.insert_counter(root, 10, counter());
        let l1 = tree.alloc_node(root, 10);
        tree.insert_counter(l1, 0, counter());
        let l2 = tree.alloc_node(l1, 0);
        tree.insert_counter(l2, 0, counter());
        tree.alloc_node(l2, 0);

        tree.destroy_subtree(l1);
        assert_eq!(tree.allocated(), NODE_COST + COUNTER_COST);
        assert!(tree.first().is_null());
        tree.assert_consistent();
    }

    #[test]
    fn arena_slots_are_recycled() {
        let mut tree = PrefixTree::new();
        let root = tree.root();
        tree.insert_counter(root, 1, counter());
        let a = tree.alloc_node(root, 1);
        tree.destroy_subtree(a);

        tree.insert_counter(root, 2, counter());
        let b = tree.alloc_node(root, 2);
        // The freed arena slot is reused for the next allocation.
        assert_eq!(a, b);
        tree.assert_consistent();
    }

    #[test]
    fn clear_root_children_leaves_the_root_alone() {
        let mut tree = PrefixTree::new();
        let root = tree.root();
        for byte in 0..8u8 {
            tree.insert_counter(root, byte, counter());
            let n = tree.alloc_node(root, byte);
            tree.insert_counter(n, 0, counter());
        }
        tree.clear_root_children();
        assert_eq!(tree.allocated(), NODE_COST);
        assert!(tree.first().is_null() && tree.last().is_null());
        tree.assert_consistent();
    }
}
