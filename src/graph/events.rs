use super::NodeId;

/// Notifications for an editor or any other observer of the graph.
///
/// Events queue up as the graph changes and are collected with
/// [`Graph::drain_events`](super::Graph::drain_events).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GraphEvent {
    /// The execution order changed. Carries the new order.
    SortedOrderChanged(Vec<NodeId>),
    /// The node whose texture is the engine output changed.
    OutputTextureChanged(Option<NodeId>),
    NodeRemoved(NodeId),
}
