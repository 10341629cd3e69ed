//! Hybrid quad-tree over the world rectangle.
//!
//! One tree indexes both moving points (agents, POIs) and rectangles (views,
//! air beacons). Internal `Node`s hold rects and four children; `Leaf`s hold
//! points only. Down to the configured minimum depth the tree is fully
//! built out of `Node`s; below it, leaves are promoted to nodes when they
//! must accept a rect and demoted back once no rect remains beneath them.
//!
//! Nodes live in an arena (`Vec` of slots addressed by `NodeId`), so the
//! child->parent links needed by the upward purge are plain indices rather
//! than owning references. A rect's [`RectHandle`] records the 1, 2 or 4
//! nodes that store it, which makes removal O(handle) with no tree scan.

use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;

use log::{error, warn};
use smallvec::SmallVec;

use crate::geo::{Point, Rect, WORLD};

/// Index of a node slot in the tree arena.
pub type NodeId = u32;

const ROOT: NodeId = 0;

/// The nodes storing a rect, in split order. Stable for the lifetime of the
/// rect's membership: a node referenced by a live handle always holds at
/// least one rect and is therefore never reclaimed by the purge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RectHandle(SmallVec<[NodeId; 4]>);

impl RectHandle {
    pub fn nodes(&self) -> &[NodeId] {
        &self.0
    }
}

struct Node<R> {
    rect: Rect,
    parent: Option<NodeId>,
    depth: usize,
    /// Children in split order: top-left, top-right, bottom-right, bottom-left.
    children: [NodeId; 4],
    /// Rects stored directly at this node, each with its full rect.
    rects: Vec<(R, Rect)>,
}

struct Leaf<P> {
    rect: Rect,
    parent: NodeId,
    depth: usize,
    points: Vec<(P, Point)>,
}

enum Slot<P, R> {
    Node(Node<R>),
    Leaf(Leaf<P>),
    /// Reclaimed by a demotion, available for reuse.
    Free,
}

/// The hybrid index. `P` tags point entries, `R` tags rect entries; both are
/// compared by identity (`Eq`) and deduplicated by hash.
pub struct QuadTree<P, R> {
    slots: Vec<Slot<P, R>>,
    free: Vec<NodeId>,
    min_depth: usize,
}

impl<P, R> QuadTree<P, R>
where
    P: Clone + Eq + Hash + Debug,
    R: Clone + Eq + Hash + Debug,
{
    /// Creates a tree over the world rectangle, fully subdivided down to
    /// `min_depth`.
    pub fn new(min_depth: usize) -> Self {
        let mut tree = Self {
            slots: Vec::new(),
            free: Vec::new(),
            min_depth,
        };
        tree.init_node(WORLD, 0, None);
        tree
    }

    pub fn min_depth(&self) -> usize {
        self.min_depth
    }

    fn alloc(&mut self, slot: Slot<P, R>) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.slots[id as usize] = slot;
                id
            }
            None => {
                self.slots.push(slot);
                (self.slots.len() - 1) as NodeId
            }
        }
    }

    /// Builds a node and, recursively, everything beneath it down to
    /// `min_depth`, where children start as leaves.
    fn init_node(&mut self, rect: Rect, depth: usize, parent: Option<NodeId>) -> NodeId {
        let id = self.alloc(Slot::Node(Node {
            rect,
            parent,
            depth,
            children: [0; 4],
            rects: Vec::new(),
        }));
        let quarters = rect.split4();
        let mut children = [0; 4];
        for (child, quarter) in children.iter_mut().zip(quarters) {
            *child = if depth == self.min_depth {
                self.alloc(Slot::Leaf(Leaf {
                    rect: quarter,
                    parent: id,
                    depth: depth + 1,
                    points: Vec::new(),
                }))
            } else {
                self.init_node(quarter, depth + 1, Some(id))
            };
        }
        if let Slot::Node(node) = &mut self.slots[id as usize] {
            node.children = children;
        }
        id
    }

    fn node(&self, id: NodeId) -> &Node<R> {
        match &self.slots[id as usize] {
            Slot::Node(node) => node,
            _ => unreachable!("slot {id} expected to be a node"),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node<R> {
        match &mut self.slots[id as usize] {
            Slot::Node(node) => node,
            _ => unreachable!("slot {id} expected to be a node"),
        }
    }

    fn leaf_mut(&mut self, id: NodeId) -> &mut Leaf<P> {
        match &mut self.slots[id as usize] {
            Slot::Leaf(leaf) => leaf,
            _ => unreachable!("slot {id} expected to be a leaf"),
        }
    }

    fn slot_rect(&self, id: NodeId) -> Rect {
        match &self.slots[id as usize] {
            Slot::Node(node) => node.rect,
            Slot::Leaf(leaf) => leaf.rect,
            Slot::Free => unreachable!("free slot {id} reached through a live link"),
        }
    }

    /// Deterministic point dispatch: which child of `node_id` a point falls
    /// into. Used identically on the insert and lookup paths so boundary
    /// points always land in, and are found in, the same leaf.
    fn sub_with(&self, node_id: NodeId, p: &Point) -> NodeId {
        let node = self.node(node_id);
        let c = node.rect.center();
        let index = if p.x < c.x {
            if p.y < c.y {
                3 // bottom-left
            } else {
                0 // top-left
            }
        } else if p.y < c.y {
            2 // bottom-right
        } else {
            1 // top-right
        };
        node.children[index]
    }

    fn leaf_for(&self, p: &Point) -> NodeId {
        let mut id = ROOT;
        loop {
            let next = self.sub_with(id, p);
            if matches!(self.slots[next as usize], Slot::Leaf(_)) {
                return next;
            }
            id = next;
        }
    }

    // --- points ---

    pub fn add_point(&mut self, item: P, point: Point) {
        let leaf = self.leaf_for(&point);
        self.leaf_mut(leaf).points.push((item, point));
    }

    /// Removes a point entry by identity. Removing an entry that is not in
    /// the index is logged and otherwise tolerated.
    pub fn remove_point(&mut self, item: &P, point: &Point) {
        let leaf = self.leaf_for(point);
        let points = &mut self.leaf_mut(leaf).points;
        match points.iter().position(|(p, _)| p == item) {
            Some(index) => {
                points.remove(index);
            }
            None => warn!("removing point entry not present in the index: {item:?}"),
        }
    }

    /// Moves a point entry, mutating in place when source and destination
    /// share a leaf.
    pub fn move_point(&mut self, item: &P, from: &Point, to: Point) {
        let current = self.leaf_for(from);
        let destination = self.leaf_for(&to);
        if current == destination {
            let points = &mut self.leaf_mut(current).points;
            match points.iter_mut().find(|(p, _)| p == item) {
                Some(entry) => entry.1 = to,
                None => {
                    warn!("moving point entry not present in the index: {item:?}");
                    points.push((item.clone(), to));
                }
            }
        } else {
            self.remove_point(item, from);
            self.add_point(item.clone(), to);
        }
    }

    // --- rects ---

    /// Adds a rect entry and returns the handle recording which nodes store
    /// it.
    pub fn add_rect(&mut self, item: R, rect: Rect) -> RectHandle {
        self.add_rect_at(ROOT, item, rect)
    }

    fn add_rect_at(&mut self, node_id: NodeId, item: R, rect: Rect) -> RectHandle {
        let node_rect = self.node(node_id).rect;

        // Larger than half the node on either axis: no child can hold it,
        // so it lives here.
        if 2.0 * rect.width() > node_rect.width() || 2.0 * rect.height() > node_rect.height() {
            self.node_mut(node_id).rects.push((item, rect));
            let mut handle = SmallVec::new();
            handle.push(node_id);
            return RectHandle(handle);
        }

        // Fits entirely inside one child: descend, promoting a leaf to a
        // node on the way down.
        let children = self.node(node_id).children;
        for child in children {
            if self.slot_rect(child).contains_rect(&rect) {
                let child = self.ensure_node(child);
                return self.add_rect_at(child, item, rect);
            }
        }

        // Small enough for the children but crossing their boundaries:
        // split around our center and store the full rect under the deepest
        // node containing each part.
        let center = node_rect.center();
        let parts = rect.split_around(center);
        if parts.is_empty() {
            error!("rect {rect:?} does not straddle the center of {node_rect:?}");
            self.node_mut(node_id).rects.push((item, rect));
            let mut handle = SmallVec::new();
            handle.push(node_id);
            return RectHandle(handle);
        }
        let mut handle = SmallVec::new();
        for part in &parts {
            let owner = self.node_for_rect(node_id, part);
            self.node_mut(owner).rects.push((item.clone(), rect));
            handle.push(owner);
        }
        RectHandle(handle)
    }

    /// Finds the deepest existing descendant node whose rect contains `rect`,
    /// promoting leaves as needed; falls back to `node_id` itself.
    fn node_for_rect(&mut self, node_id: NodeId, rect: &Rect) -> NodeId {
        let children = self.node(node_id).children;
        for child in children {
            if self.slot_rect(child).contains_rect(rect) {
                return match &self.slots[child as usize] {
                    Slot::Leaf(_) => self.promote(child),
                    Slot::Node(_) => self.node_for_rect(child, rect),
                    Slot::Free => unreachable!("free slot {child} reached through a live link"),
                };
            }
        }
        node_id
    }

    fn ensure_node(&mut self, id: NodeId) -> NodeId {
        match &self.slots[id as usize] {
            Slot::Node(_) => id,
            Slot::Leaf(_) => self.promote(id),
            Slot::Free => unreachable!("free slot {id} reached through a live link"),
        }
    }

    /// Promotes a leaf to a node in place (same id, so parent links and
    /// handles stay valid), carrying its points down into fresh leaves.
    fn promote(&mut self, id: NodeId) -> NodeId {
        let leaf = match std::mem::replace(&mut self.slots[id as usize], Slot::Free) {
            Slot::Leaf(leaf) => leaf,
            _ => unreachable!("slot {id} expected to be a leaf"),
        };
        self.slots[id as usize] = Slot::Node(Node {
            rect: leaf.rect,
            parent: Some(leaf.parent),
            depth: leaf.depth,
            children: [0; 4],
            rects: Vec::new(),
        });
        let quarters = leaf.rect.split4();
        let mut children = [0; 4];
        for (child, quarter) in children.iter_mut().zip(quarters) {
            *child = self.alloc(Slot::Leaf(Leaf {
                rect: quarter,
                parent: id,
                depth: leaf.depth + 1,
                points: Vec::new(),
            }));
        }
        self.node_mut(id).children = children;
        for (item, point) in leaf.points {
            let child = self.sub_with(id, &point);
            self.leaf_mut(child).points.push((item, point));
        }
        id
    }

    /// Removes a rect entry through its handle, then tries to shrink the
    /// tree upward from each owning node.
    pub fn remove_rect(&mut self, item: &R, handle: &RectHandle) {
        for &node_id in handle.nodes() {
            self.remove_from_rects(node_id, item);
            self.purge(node_id);
        }
    }

    fn remove_from_rects(&mut self, node_id: NodeId, item: &R) {
        let rects = &mut self.node_mut(node_id).rects;
        match rects.iter().position(|(r, _)| r == item) {
            Some(index) => {
                rects.remove(index);
            }
            None => warn!("removing rect entry not stored where its handle points: {item:?}"),
        }
    }

    /// Moves a rect entry: remove then re-add, returning the new handle.
    pub fn move_rect(&mut self, item: &R, handle: &RectHandle, to: Rect) -> RectHandle {
        self.remove_rect(item, handle);
        self.add_rect(item.clone(), to)
    }

    /// Walks upward from `start`, demoting every node below the minimum
    /// depth that holds no rect anywhere beneath it.
    fn purge(&mut self, start: NodeId) {
        let mut current = Some(start);
        while let Some(id) = current {
            let (depth, parent, has_rects) = match &self.slots[id as usize] {
                Slot::Node(node) => (node.depth, node.parent, !node.rects.is_empty()),
                _ => return,
            };
            if depth <= self.min_depth || has_rects {
                return;
            }
            if self.count_rects(id) == 0 {
                self.demote(id);
            }
            current = parent;
        }
    }

    fn count_rects(&self, id: NodeId) -> usize {
        match &self.slots[id as usize] {
            Slot::Node(node) => {
                node.rects.len()
                    + node
                        .children
                        .iter()
                        .map(|&child| self.count_rects(child))
                        .sum::<usize>()
            }
            _ => 0,
        }
    }

    /// Replaces a node with a leaf carrying every point beneath it (same id,
    /// so the parent's child link stays valid) and reclaims the descendants.
    fn demote(&mut self, id: NodeId) {
        let node = match std::mem::replace(&mut self.slots[id as usize], Slot::Free) {
            Slot::Node(node) => node,
            _ => unreachable!("slot {id} expected to be a node"),
        };
        let parent = match node.parent {
            Some(parent) => parent,
            None => unreachable!("the root is never demoted"),
        };
        let mut points = Vec::new();
        for child in node.children {
            self.drain_points(child, &mut points);
        }
        self.slots[id as usize] = Slot::Leaf(Leaf {
            rect: node.rect,
            parent,
            depth: node.depth,
            points,
        });
    }

    fn drain_points(&mut self, id: NodeId, out: &mut Vec<(P, Point)>) {
        match std::mem::replace(&mut self.slots[id as usize], Slot::Free) {
            Slot::Leaf(leaf) => out.extend(leaf.points),
            Slot::Node(node) => {
                for child in node.children {
                    self.drain_points(child, out);
                }
            }
            Slot::Free => {}
        }
        self.free.push(id);
    }

    // --- queries ---

    /// All point entries inside `query`. Order unspecified.
    pub fn points_in(&self, query: &Rect) -> Vec<P> {
        let mut out = Vec::new();
        self.collect_points_in(ROOT, query, &mut out);
        out
    }

    fn collect_points_in(&self, id: NodeId, query: &Rect, out: &mut Vec<P>) {
        match &self.slots[id as usize] {
            Slot::Node(node) => {
                for &child in &node.children {
                    if self.slot_rect(child).intersects(query) {
                        self.collect_points_in(child, query, out);
                    }
                }
            }
            Slot::Leaf(leaf) => {
                if query.contains_rect(&leaf.rect) {
                    out.extend(leaf.points.iter().map(|(item, _)| item.clone()));
                } else {
                    out.extend(
                        leaf.points
                            .iter()
                            .filter(|(_, point)| query.contains(point))
                            .map(|(item, _)| item.clone()),
                    );
                }
            }
            Slot::Free => {}
        }
    }

    /// All rect entries whose rect contains `p` and that `accept` keeps.
    /// Deduplicated by identity: a split rect is stored under several nodes
    /// but is returned once.
    pub fn rects_with_point<F>(&self, p: &Point, accept: F) -> HashSet<R>
    where
        F: Fn(&R) -> bool,
    {
        let mut found = HashSet::new();
        let mut id = ROOT;
        loop {
            for (item, rect) in &self.node(id).rects {
                if rect.contains(p) && accept(item) {
                    found.insert(item.clone());
                }
            }
            let next = self.sub_with(id, p);
            match &self.slots[next as usize] {
                Slot::Node(_) => id = next,
                _ => return found,
            }
        }
    }

    // --- deep checks, used by the integrity test suite ---

    /// Walks the whole tree and asserts its structural invariants:
    /// parent/child containment, depth bookkeeping, the minimum-depth
    /// contract, points residing in their leaf's rect, and every stored rect
    /// being reachable through its owner's handle (`handle_of`) from exactly
    /// the nodes that hold it. Panics on the first violation.
    pub fn check_integrity<F>(&self, handle_of: F)
    where
        F: Fn(&R) -> Option<RectHandle>,
    {
        let mut stored: Vec<(R, NodeId)> = Vec::new();
        self.check_slot(ROOT, None, 0, &mut stored);

        let mut expected = 0;
        for (item, node_id) in &stored {
            let handle = handle_of(item)
                .unwrap_or_else(|| panic!("stored rect {item:?} has no handle"));
            assert!(
                handle.nodes().contains(node_id),
                "rect {item:?} stored at node {node_id} missing from its handle {handle:?}"
            );
        }
        let mut seen: HashSet<R> = HashSet::new();
        for (item, _) in &stored {
            seen.insert(item.clone());
        }
        for item in &seen {
            if let Some(handle) = handle_of(item) {
                expected += handle.nodes().len();
                for node_id in handle.nodes() {
                    let occurrences = self
                        .node(*node_id)
                        .rects
                        .iter()
                        .filter(|(r, _)| r == item)
                        .count();
                    assert_eq!(
                        occurrences, 1,
                        "rect {item:?} stored {occurrences} times at node {node_id}"
                    );
                }
            }
        }
        assert_eq!(
            stored.len(),
            expected,
            "stored rect entries do not match the union of handles"
        );
    }

    fn check_slot(
        &self,
        id: NodeId,
        parent: Option<NodeId>,
        depth: usize,
        stored: &mut Vec<(R, NodeId)>,
    ) {
        match &self.slots[id as usize] {
            Slot::Node(node) => {
                assert_eq!(node.parent, parent, "node {id} has a wrong parent link");
                assert_eq!(node.depth, depth, "node {id} has a wrong depth");
                for &child in &node.children {
                    assert!(
                        node.rect.contains_rect(&self.slot_rect(child)),
                        "child of node {id} not contained in it"
                    );
                }
                for (item, rect) in &node.rects {
                    stored.push((item.clone(), id));
                    for &child in &node.children {
                        assert!(
                            !self.slot_rect(child).contains_rect(rect),
                            "rect {item:?} at node {id} should be stored lower"
                        );
                    }
                }
                for &child in &node.children {
                    self.check_slot(child, Some(id), depth + 1, stored);
                }
            }
            Slot::Leaf(leaf) => {
                assert!(depth > self.min_depth, "leaf {id} above the minimum depth");
                assert_eq!(Some(leaf.parent), parent, "leaf {id} has a wrong parent link");
                assert_eq!(leaf.depth, depth, "leaf {id} has a wrong depth");
                for (item, point) in &leaf.points {
                    assert!(
                        leaf.rect.contains(point),
                        "point {item:?} outside its leaf's rect"
                    );
                }
            }
            Slot::Free => panic!("free slot {id} reached through a live link"),
        }
    }

    /// Total stored points and leaf count.
    pub fn count_points_and_leaves(&self) -> (usize, usize) {
        let mut points = 0;
        let mut leaves = 0;
        for slot in &self.slots {
            if let Slot::Leaf(leaf) = slot {
                points += leaf.points.len();
                leaves += 1;
            }
        }
        (points, leaves)
    }

    /// Total stored rect entries and node count.
    pub fn count_rect_entries_and_nodes(&self) -> (usize, usize) {
        let mut rects = 0;
        let mut nodes = 0;
        for slot in &self.slots {
            if let Slot::Node(node) = slot {
                rects += node.rects.len();
                nodes += 1;
            }
        }
        (rects, nodes)
    }

    /// Nodes below the minimum depth with no rect anywhere beneath them;
    /// zero after a correct purge.
    pub fn count_purgeable_nodes(&self) -> usize {
        let mut count = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            if let Slot::Node(node) = slot {
                if node.depth > self.min_depth && self.count_rects(index as NodeId) == 0 {
                    count += 1;
                }
            }
        }
        count
    }

    /// All point entries found by exhaustively scanning every leaf,
    /// bypassing the dispatch path.
    pub fn scan_points(&self) -> Vec<(P, Point)> {
        let mut out = Vec::new();
        for slot in &self.slots {
            if let Slot::Leaf(leaf) = slot {
                out.extend(leaf.points.iter().cloned());
            }
        }
        out
    }
}
