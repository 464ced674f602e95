//! Execution ordering.
//!
//! Only [`EdgeKind::Normal`] edges constrain the order. A node is ready when
//! every `Normal` source has been computed, so a cycle executes as long as one
//! of its edges is a `Blit` (or `Seed`) edge. Ties go to the lower id.

use std::collections::BTreeMap;

use super::node::{EdgeKind, GraphNode};
use super::NodeId;

/// Result of one sort.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Schedule {
    /// Operations to execute this frame, in order.
    pub order: Vec<NodeId>,
    /// Operations left on an all-`Normal` cycle (or downstream of one).
    pub excluded: Vec<NodeId>,
}

pub(crate) fn sort(nodes: &mut BTreeMap<NodeId, GraphNode>) -> Schedule {
    for node in nodes.values_mut() {
        node.computed = false;
    }

    let mut order = Vec::new();

    // Seeds are always available; ready operations are sources with a consumer
    // or nodes whose inputs are all non-Normal.
    let ready: Vec<NodeId> = nodes
        .values()
        .filter(|node| {
            node.is_seed()
                || (node.inputs().is_empty() && !node.outputs().is_empty())
                || (!node.inputs().is_empty()
                    && node.inputs().values().all(|e| e.kind != EdgeKind::Normal))
        })
        .map(GraphNode::id)
        .collect();
    for id in ready {
        if let Some(node) = nodes.get_mut(&id) {
            node.computed = true;
            if !node.is_seed() {
                order.push(id);
            }
        }
    }

    loop {
        let mut progressed = false;
        let pending: Vec<NodeId> = nodes
            .values()
            .filter(|node| !node.computed && !node.inputs().is_empty())
            .map(GraphNode::id)
            .collect();
        for id in pending {
            let satisfied = nodes.get(&id).is_some_and(|node| {
                node.inputs().iter().all(|(source, edge)| {
                    edge.kind != EdgeKind::Normal
                        || nodes.get(source).is_some_and(|s| s.computed)
                })
            });
            if satisfied && let Some(node) = nodes.get_mut(&id) {
                node.computed = true;
                order.push(id);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    let excluded = nodes
        .values()
        .filter(|node| !node.computed && !node.is_isolated())
        .map(GraphNode::id)
        .collect();

    Schedule { order, excluded }
}
