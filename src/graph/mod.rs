//! The operation graph and its scheduler.
//!
//! [`Graph`] is an id-addressed arena of [`GraphNode`]s with adjacency maps on
//! both ends of every edge. Every topology mutation re-sorts synchronously, so
//! the execution order is always current when the next tick starts.
//!
//! ```text
//!   seed ──Seed──▶ warp ──Normal──▶ blur ─┐
//!                   ▲                     │
//!                   └──────── Blit ───────┘
//! ```
//!
//! Sorting the graph above yields `[warp, blur]`: the `Blit` edge reads
//! last frame's `blur`, so it does not hold `warp` back.

mod events;
mod node;
mod scheduler;

pub use events::GraphEvent;
pub use node::{EdgeKind, GraphNode, InputEdge, NodeId, NodeKind};
pub use scheduler::Schedule;

use std::collections::BTreeMap;

/// Node arena, adjacency and the cached execution order.
#[derive(Default)]
pub struct Graph {
    nodes: BTreeMap<NodeId, GraphNode>,
    next_id: u32,
    output: Option<NodeId>,
    schedule: Schedule,
    events: Vec<GraphEvent>,
}

impl Graph {
    /// An empty graph. The first node gets id `0`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an operation node. It stays isolated, and unscheduled, until an edge
    /// touches it.
    pub fn add_operation(&mut self) -> NodeId {
        self.add_node(NodeKind::Operation)
    }

    /// Add a seed node. Seeds only ever appear as edge sources.
    pub fn add_seed(&mut self) -> NodeId {
        self.add_node(NodeKind::Seed)
    }

    fn add_node(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, GraphNode::new(id, kind));
        tracing::debug!(%id, ?kind, "node added");
        self.sort();
        id
    }

    /// The node with `id`, if it exists.
    pub fn node(&self, id: NodeId) -> Option<&GraphNode> {
        self.nodes.get(&id)
    }

    /// Every node in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Number of nodes, operations and seeds alike.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add an edge `source -> dest` with blend weight `weight`.
    ///
    /// Edges from seeds are [`EdgeKind::Seed`], all others start as
    /// [`EdgeKind::Normal`]. Fails on a self-loop, an unknown id, a seed
    /// destination, or an existing edge between the pair; the graph is left
    /// unchanged on failure.
    pub fn connect(&mut self, source: NodeId, dest: NodeId, weight: f32) -> bool {
        if source == dest {
            return false;
        }
        let Some(source_kind) = self.nodes.get(&source).map(GraphNode::kind) else {
            return false;
        };
        let Some(dst) = self.nodes.get_mut(&dest) else {
            return false;
        };
        if dst.is_seed() {
            return false;
        }
        let added = match source_kind {
            NodeKind::Seed => dst.add_seed_input(source, weight),
            NodeKind::Operation => dst.add_input(source, EdgeKind::Normal, weight),
        };
        if !added {
            return false;
        }
        if let Some(src) = self.nodes.get_mut(&source) {
            src.add_output(dest);
        }
        tracing::debug!(%source, %dest, weight, "connected");
        self.sort();
        true
    }

    /// Remove the edge `source -> dest`. Returns `false` when there is none.
    pub fn disconnect(&mut self, source: NodeId, dest: NodeId) -> bool {
        let removed = self
            .nodes
            .get_mut(&dest)
            .and_then(|dst| dst.remove_input(source))
            .is_some();
        if !removed {
            return false;
        }
        if let Some(src) = self.nodes.get_mut(&source) {
            src.remove_output(dest);
        }
        tracing::debug!(%source, %dest, "disconnected");
        self.sort();
        true
    }

    /// Switch an operation-to-operation edge between `Normal` and `Blit`.
    /// Seed edges cannot change kind.
    pub fn set_edge_type(&mut self, source: NodeId, dest: NodeId, kind: EdgeKind) -> bool {
        let source_is_seed = match self.nodes.get(&source) {
            Some(node) => node.is_seed(),
            None => return false,
        };
        if source_is_seed || kind == EdgeKind::Seed {
            return false;
        }
        let changed = self
            .nodes
            .get_mut(&dest)
            .is_some_and(|dst| dst.set_input_type(source, kind));
        if changed {
            tracing::debug!(%source, %dest, ?kind, "edge type changed");
            self.sort();
        }
        changed
    }

    /// The edge `source -> dest`, looked up on the destination's input map.
    pub fn edge(&self, source: NodeId, dest: NodeId) -> Option<InputEdge> {
        self.nodes.get(&dest)?.inputs().get(&source).copied()
    }

    /// Blend weight of the edge `source -> dest`.
    pub fn blend_factor(&self, source: NodeId, dest: NodeId) -> Option<f32> {
        self.nodes.get(&dest)?.blend_factor(source)
    }

    /// Set the blend weight of an existing edge. Weights are not normalized;
    /// the order is unaffected.
    pub fn set_blend_factor(&mut self, source: NodeId, dest: NodeId, weight: f32) -> bool {
        self.nodes
            .get_mut(&dest)
            .is_some_and(|dst| dst.set_blend_factor(source, weight))
    }

    /// Give every input of `dest` the weight `1 / input count`.
    pub fn equalize_blend_factors(&mut self, dest: NodeId) -> bool {
        match self.nodes.get_mut(&dest) {
            Some(dst) => {
                dst.equalize_blend_factors();
                true
            }
            None => false,
        }
    }

    /// Whether any consumer reads `id` through a blit edge.
    pub fn has_blit_output(&self, id: NodeId) -> bool {
        self.nodes.get(&id).is_some_and(|node| {
            node.outputs()
                .iter()
                .any(|dest| self.edge(id, *dest).is_some_and(|e| e.kind == EdgeKind::Blit))
        })
    }

    /// The node selected for display and readback.
    pub fn output(&self) -> Option<NodeId> {
        self.output
    }

    /// Select the output node, or none. Fails for an unknown id.
    pub fn set_output(&mut self, id: Option<NodeId>) -> bool {
        if let Some(id) = id
            && !self.nodes.contains_key(&id)
        {
            return false;
        }
        if self.output != id {
            self.output = id;
            self.events.push(GraphEvent::OutputTextureChanged(id));
        }
        true
    }

    /// Remove an operation node and its incident edges.
    pub fn remove_node(&mut self, id: NodeId) -> bool {
        self.remove(id, NodeKind::Operation)
    }

    /// Remove a seed node and its outgoing edges.
    pub fn remove_seed(&mut self, id: NodeId) -> bool {
        self.remove(id, NodeKind::Seed)
    }

    fn remove(&mut self, id: NodeId, kind: NodeKind) -> bool {
        if self.nodes.get(&id).map(GraphNode::kind) != Some(kind) {
            return false;
        }
        let Some(node) = self.nodes.remove(&id) else {
            return false;
        };
        for source in node.inputs().keys() {
            if let Some(src) = self.nodes.get_mut(source) {
                src.remove_output(id);
            }
        }
        for dest in node.outputs() {
            if let Some(dst) = self.nodes.get_mut(dest) {
                dst.remove_input(id);
            }
        }
        if self.output == Some(id) {
            self.output = None;
            self.events.push(GraphEvent::OutputTextureChanged(None));
        }
        self.events.push(GraphEvent::NodeRemoved(id));
        tracing::debug!(%id, ?kind, "node removed");
        self.sort();
        true
    }

    /// Remove every node. Ids are not reused afterwards.
    pub fn clear(&mut self) {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        self.nodes.clear();
        if self.output.take().is_some() {
            self.events.push(GraphEvent::OutputTextureChanged(None));
        }
        self.events
            .extend(ids.into_iter().map(GraphEvent::NodeRemoved));
        self.sort();
    }

    /// Recompute the execution order. Runs automatically after every topology
    /// change; calling it again without changes yields the same order.
    pub fn sort(&mut self) -> &[NodeId] {
        let schedule = scheduler::sort(&mut self.nodes);
        if !schedule.excluded.is_empty() {
            tracing::debug!(excluded = ?schedule.excluded, "nodes on an unresolved cycle skipped");
        }
        if schedule.order != self.schedule.order {
            self.events
                .push(GraphEvent::SortedOrderChanged(schedule.order.clone()));
        }
        self.schedule = schedule;
        &self.schedule.order
    }

    /// Operations to execute each tick, in order.
    pub fn order(&self) -> &[NodeId] {
        &self.schedule.order
    }

    /// Operations excluded by an all-`Normal` cycle.
    pub fn excluded(&self) -> &[NodeId] {
        &self.schedule.excluded
    }

    /// Take every event queued since the last drain, oldest first.
    pub fn drain_events(&mut self) -> Vec<GraphEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(graph: &mut Graph, n: usize) -> Vec<NodeId> {
        let ids: Vec<NodeId> = (0..n).map(|_| graph.add_operation()).collect();
        for pair in ids.windows(2) {
            assert!(graph.connect(pair[0], pair[1], 1.0));
        }
        ids
    }

    #[test]
    fn orders_a_chain_by_normal_edges() {
        let mut graph = Graph::new();
        let ids = chain(&mut graph, 3);
        assert_eq!(graph.order(), ids.as_slice());
    }

    #[test]
    fn isolated_operations_are_not_scheduled() {
        let mut graph = Graph::new();
        let lonely = graph.add_operation();
        assert!(graph.order().is_empty());
        assert!(graph.excluded().is_empty());
        assert!(graph.node(lonely).is_some());
    }

    #[test]
    fn normal_cycle_is_excluded() {
        let mut graph = Graph::new();
        let a = graph.add_operation();
        let b = graph.add_operation();
        assert!(graph.connect(a, b, 1.0));
        assert!(graph.connect(b, a, 1.0));
        assert!(graph.order().is_empty());
        assert_eq!(graph.excluded(), &[a, b]);

        assert!(graph.set_edge_type(b, a, EdgeKind::Blit));
        assert_eq!(graph.order(), &[a, b]);
        assert!(graph.excluded().is_empty());
    }

    #[test]
    fn seed_edges_cannot_change_kind() {
        let mut graph = Graph::new();
        let seed = graph.add_seed();
        let op = graph.add_operation();
        assert!(graph.connect(seed, op, 1.0));
        assert_eq!(graph.edge(seed, op).map(|e| e.kind), Some(EdgeKind::Seed));
        assert!(!graph.set_edge_type(seed, op, EdgeKind::Normal));
        assert!(!graph.connect(op, seed, 1.0));
    }

    #[test]
    fn removal_detaches_edges_and_output() {
        let mut graph = Graph::new();
        let ids = chain(&mut graph, 3);
        assert!(graph.set_output(Some(ids[1])));
        graph.drain_events();

        assert!(graph.remove_node(ids[1]));
        assert!(!graph.remove_seed(ids[0]));
        assert!(graph.node(ids[0]).unwrap().outputs().is_empty());
        assert!(graph.node(ids[2]).unwrap().inputs().is_empty());
        assert_eq!(graph.output(), None);

        let events = graph.drain_events();
        assert!(events.contains(&GraphEvent::OutputTextureChanged(None)));
        assert!(events.contains(&GraphEvent::NodeRemoved(ids[1])));
    }

    #[test]
    fn order_change_is_reported_once() {
        let mut graph = Graph::new();
        chain(&mut graph, 2);
        graph.drain_events();
        let before = graph.order().to_vec();
        graph.sort();
        assert_eq!(graph.order(), before.as_slice());
        assert!(graph.drain_events().is_empty());
    }

    #[test]
    fn set_output_rejects_unknown_ids() {
        let mut graph = Graph::new();
        assert!(!graph.set_output(Some(NodeId(42))));
        assert!(graph.set_output(None));
    }
}
