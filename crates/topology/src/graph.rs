//! Registry + adjacency graph over the overlay membership

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::{NodeAddress, NodeId, TopologyError};

/// The overlay topology: a registry of known nodes and an undirected
/// adjacency relation over the registered ids.
///
/// Invariants:
/// - every id in the adjacency also appears in the registry (`validate`
///   restores this after arbitrary mutation)
/// - no self-loops
/// - adjacency is symmetric
///
/// The graph itself is synchronous; callers guard it with their own lock
/// and never hold that lock across network I/O.
#[derive(Debug, Default)]
pub struct TopologyGraph {
    registry: BTreeMap<NodeId, NodeAddress>,
    adjacency: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl TopologyGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new node with an empty neighbor set.
    pub fn add_node(&mut self, id: NodeId, address: NodeAddress) -> Result<(), TopologyError> {
        if self.registry.contains_key(&id) {
            return Err(TopologyError::DuplicateNode(id));
        }
        self.registry.insert(id, address);
        self.adjacency.insert(id, BTreeSet::new());
        Ok(())
    }

    /// Remove a node, its registry entry and all incident edges.
    /// Returns whether the node was registered.
    pub fn remove_node(&mut self, id: NodeId) -> bool {
        if self.registry.remove(&id).is_none() {
            return false;
        }
        self.adjacency.remove(&id);
        for neighbors in self.adjacency.values_mut() {
            neighbors.remove(&id);
        }
        true
    }

    /// Update the address of a registered node.
    pub fn update_address(
        &mut self,
        id: NodeId,
        address: NodeAddress,
    ) -> Result<(), TopologyError> {
        match self.registry.get_mut(&id) {
            Some(slot) => {
                *slot = address;
                Ok(())
            }
            None => Err(TopologyError::UnknownNode(id)),
        }
    }

    /// Whether a node is registered.
    pub fn contains(&self, id: NodeId) -> bool {
        self.registry.contains_key(&id)
    }

    /// Address of a registered node.
    pub fn address_of(&self, id: NodeId) -> Option<NodeAddress> {
        self.registry.get(&id).cloned()
    }

    /// All registered ids in ascending order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.registry.keys().copied().collect()
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Add an undirected edge. Self-loops are ignored.
    pub fn add_edge(&mut self, a: NodeId, b: NodeId) {
        if a == b {
            return;
        }
        self.adjacency.entry(a).or_default().insert(b);
        self.adjacency.entry(b).or_default().insert(a);
    }

    /// Remove an undirected edge.
    pub fn remove_edge(&mut self, a: NodeId, b: NodeId) {
        if let Some(neighbors) = self.adjacency.get_mut(&a) {
            neighbors.remove(&b);
        }
        if let Some(neighbors) = self.adjacency.get_mut(&b) {
            neighbors.remove(&a);
        }
    }

    /// Neighbors of a node in ascending order.
    pub fn neighbors(&self, id: NodeId) -> Vec<NodeId> {
        self.adjacency
            .get(&id)
            .map(|n| n.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Breadth-first shortest path from `from` to `to`.
    ///
    /// Returns `[from]` when `from == to`, the full id sequence including
    /// both endpoints when a path exists, and an empty vector otherwise.
    pub fn find_path(&self, from: NodeId, to: NodeId) -> Vec<NodeId> {
        if from == to {
            return vec![from];
        }

        let mut queue = VecDeque::new();
        let mut parent: BTreeMap<NodeId, NodeId> = BTreeMap::new();

        queue.push_back(from);
        parent.insert(from, from);

        while let Some(current) = queue.pop_front() {
            if current == to {
                // Walk the parent chain back to the origin.
                let mut path = vec![to];
                let mut node = to;
                while node != from {
                    node = parent[&node];
                    path.push(node);
                }
                path.reverse();
                return path;
            }

            if let Some(neighbors) = self.adjacency.get(&current) {
                for &neighbor in neighbors {
                    if !parent.contains_key(&neighbor) {
                        parent.insert(neighbor, current);
                        queue.push_back(neighbor);
                    }
                }
            }
        }

        Vec::new()
    }

    /// Whether every registered id is reachable from every other.
    ///
    /// Graphs with at most one vertex are connected.
    pub fn is_connected(&self) -> bool {
        if self.registry.len() <= 1 {
            return true;
        }

        let start = *self.registry.keys().next().unwrap_or(&NodeId::BROADCAST);
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::new();
        visited.insert(start);
        queue.push_back(start);

        while let Some(current) = queue.pop_front() {
            if let Some(neighbors) = self.adjacency.get(&current) {
                for &neighbor in neighbors {
                    if visited.insert(neighbor) {
                        queue.push_back(neighbor);
                    }
                }
            }
        }

        visited.len() == self.registry.len()
    }

    /// Prune adjacency entries whose id is not in the registry, restoring
    /// the graph invariants.
    pub fn validate(&mut self) {
        let registry = &self.registry;
        self.adjacency.retain(|id, _| registry.contains_key(id));
        for neighbors in self.adjacency.values_mut() {
            neighbors.retain(|id| registry.contains_key(id));
        }
    }

    /// Last-resort logical repair: if the graph is disconnected, add edges
    /// in ring order over the current id list so it becomes connected.
    ///
    /// This only mutates the graph; opening transport connections for the
    /// new edges is the membership manager's job.
    pub fn repair(&mut self) {
        self.validate();
        if self.is_connected() {
            return;
        }

        let ids = self.node_ids();
        if ids.len() > 1 {
            for i in 0..ids.len() {
                let next = ids[(i + 1) % ids.len()];
                self.add_edge(ids[i], next);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> NodeId {
        NodeId::new(raw)
    }

    fn addr(port: u16) -> NodeAddress {
        NodeAddress::new("127.0.0.1", port)
    }

    fn graph_with(ids: &[u64]) -> TopologyGraph {
        let mut graph = TopologyGraph::new();
        for &raw in ids {
            graph.add_node(id(raw), addr(9000 + raw as u16)).unwrap();
        }
        graph
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let mut graph = graph_with(&[1]);
        assert!(matches!(
            graph.add_node(id(1), addr(9100)),
            Err(TopologyError::DuplicateNode(_))
        ));
    }

    #[test]
    fn update_address_requires_registration() {
        let mut graph = graph_with(&[1]);
        graph.update_address(id(1), addr(9500)).unwrap();
        assert_eq!(graph.address_of(id(1)), Some(addr(9500)));
        assert!(matches!(
            graph.update_address(id(9), addr(9500)),
            Err(TopologyError::UnknownNode(_))
        ));
    }

    #[test]
    fn remove_drops_incident_edges() {
        let mut graph = graph_with(&[1, 2, 3]);
        graph.add_edge(id(1), id(2));
        graph.add_edge(id(2), id(3));
        assert!(graph.remove_node(id(2)));
        assert!(graph.neighbors(id(1)).is_empty());
        assert!(graph.neighbors(id(3)).is_empty());
        assert!(!graph.remove_node(id(2)));
    }

    #[test]
    fn adjacency_is_symmetric() {
        let mut graph = graph_with(&[1, 2]);
        graph.add_edge(id(1), id(2));
        assert_eq!(graph.neighbors(id(1)), vec![id(2)]);
        assert_eq!(graph.neighbors(id(2)), vec![id(1)]);
        graph.remove_edge(id(2), id(1));
        assert!(graph.neighbors(id(1)).is_empty());
        assert!(graph.neighbors(id(2)).is_empty());
    }

    #[test]
    fn self_loops_are_ignored() {
        let mut graph = graph_with(&[1]);
        graph.add_edge(id(1), id(1));
        assert!(graph.neighbors(id(1)).is_empty());
    }

    #[test]
    fn path_endpoints_and_adjacency() {
        let mut graph = graph_with(&[1, 2, 3, 4]);
        graph.add_edge(id(1), id(2));
        graph.add_edge(id(2), id(3));
        graph.add_edge(id(3), id(4));

        let path = graph.find_path(id(1), id(4));
        assert_eq!(path, vec![id(1), id(2), id(3), id(4)]);
        for pair in path.windows(2) {
            assert!(graph.neighbors(pair[0]).contains(&pair[1]));
        }
    }

    #[test]
    fn path_to_self_is_singleton() {
        let graph = graph_with(&[1]);
        assert_eq!(graph.find_path(id(1), id(1)), vec![id(1)]);
    }

    #[test]
    fn no_path_is_empty() {
        let graph = graph_with(&[1, 2]);
        assert!(graph.find_path(id(1), id(2)).is_empty());
    }

    #[test]
    fn connectivity() {
        let mut graph = graph_with(&[1, 2, 3]);
        assert!(!graph.is_connected());
        graph.add_edge(id(1), id(2));
        graph.add_edge(id(2), id(3));
        assert!(graph.is_connected());

        assert!(TopologyGraph::new().is_connected());
        assert!(graph_with(&[7]).is_connected());
    }

    #[test]
    fn validate_prunes_orphans() {
        let mut graph = graph_with(&[1, 2]);
        graph.add_edge(id(1), id(2));
        // Inject an orphan edge the way a stale update would.
        graph.adjacency.entry(id(1)).or_default().insert(id(99));
        graph.adjacency.insert(id(99), BTreeSet::from([id(1)]));

        graph.validate();

        for (node, neighbors) in &graph.adjacency {
            assert!(graph.registry.contains_key(node));
            for neighbor in neighbors {
                assert!(graph.registry.contains_key(neighbor));
            }
        }
    }

    #[test]
    fn repair_restores_connectivity() {
        let mut graph = graph_with(&[1, 2, 3, 4, 5]);
        graph.add_edge(id(1), id(2));
        assert!(!graph.is_connected());
        graph.repair();
        assert!(graph.is_connected());
    }

    #[test]
    fn repair_keeps_connected_graph_untouched() {
        let mut graph = graph_with(&[1, 2]);
        graph.add_edge(id(1), id(2));
        graph.repair();
        assert_eq!(graph.neighbors(id(1)), vec![id(2)]);
    }
}
