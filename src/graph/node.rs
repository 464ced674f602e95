use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable id of an operation or seed. Ids are never reused within a graph, so
/// id order is insertion order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a destination reads its source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// The source's output computed this frame. Orders the source first.
    Normal,
    /// The source's output from last frame. Does not constrain ordering, which
    /// is what lets a feedback cycle execute.
    Blit,
    /// A seed's current texture.
    Seed,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InputEdge {
    pub kind: EdgeKind,
    pub blend: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Operation,
    Seed,
}

/// Adjacency and sort state of one node.
#[derive(Clone, Debug)]
pub struct GraphNode {
    id: NodeId,
    kind: NodeKind,
    inputs: BTreeMap<NodeId, InputEdge>,
    outputs: BTreeSet<NodeId>,
    pub(crate) computed: bool,
}

impl GraphNode {
    pub(crate) fn new(id: NodeId, kind: NodeKind) -> Self {
        Self {
            id,
            kind,
            inputs: BTreeMap::new(),
            outputs: BTreeSet::new(),
            computed: false,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_seed(&self) -> bool {
        self.kind == NodeKind::Seed
    }

    pub fn inputs(&self) -> &BTreeMap<NodeId, InputEdge> {
        &self.inputs
    }

    pub fn outputs(&self) -> &BTreeSet<NodeId> {
        &self.outputs
    }

    /// No inputs and no outputs.
    pub fn is_isolated(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty()
    }

    /// Add an inbound edge. At most one edge per source.
    pub fn add_input(&mut self, source: NodeId, kind: EdgeKind, blend: f32) -> bool {
        if source == self.id || self.inputs.contains_key(&source) {
            return false;
        }
        self.inputs.insert(source, InputEdge { kind, blend });
        true
    }

    pub fn remove_input(&mut self, source: NodeId) -> Option<InputEdge> {
        self.inputs.remove(&source)
    }

    pub fn add_seed_input(&mut self, seed: NodeId, blend: f32) -> bool {
        self.add_input(seed, EdgeKind::Seed, blend)
    }

    /// Remove an inbound edge only if it is a seed edge.
    pub fn remove_seed_input(&mut self, seed: NodeId) -> bool {
        match self.inputs.get(&seed) {
            Some(edge) if edge.kind == EdgeKind::Seed => {
                self.inputs.remove(&seed);
                true
            }
            _ => false,
        }
    }

    /// Change an edge's kind. Returns `false` if there is no such edge or the
    /// kind is unchanged.
    pub fn set_input_type(&mut self, source: NodeId, kind: EdgeKind) -> bool {
        match self.inputs.get_mut(&source) {
            Some(edge) if edge.kind != kind => {
                edge.kind = kind;
                true
            }
            _ => false,
        }
    }

    pub fn add_output(&mut self, dest: NodeId) -> bool {
        self.outputs.insert(dest)
    }

    pub fn remove_output(&mut self, dest: NodeId) -> bool {
        self.outputs.remove(&dest)
    }

    pub fn blend_factor(&self, source: NodeId) -> Option<f32> {
        self.inputs.get(&source).map(|edge| edge.blend)
    }

    pub fn set_blend_factor(&mut self, source: NodeId, blend: f32) -> bool {
        match self.inputs.get_mut(&source) {
            Some(edge) => {
                edge.blend = blend;
                true
            }
            None => false,
        }
    }

    /// Set every inbound weight to `1 / inputs`.
    pub fn equalize_blend_factors(&mut self) {
        if self.inputs.is_empty() {
            return;
        }
        let weight = 1.0 / self.inputs.len() as f32;
        for edge in self.inputs.values_mut() {
            edge.blend = weight;
        }
    }
}
