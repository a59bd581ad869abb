use std::collections::{HashMap, HashSet, VecDeque};

use crate::models::{EntityType, GraphEdge, ItemGraph};

/// Undirected adjacency over the edges accepted by `follow`.
pub fn adjacency_map<'a, F>(graph: &'a ItemGraph, follow: F) -> HashMap<&'a str, Vec<&'a str>>
where
    F: Fn(&GraphEdge) -> bool,
{
    let known_nodes: HashSet<&str> = graph.nodes.iter().map(|node| node.id.as_str()).collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = known_nodes
        .iter()
        .map(|node_id| (*node_id, Vec::new()))
        .collect();

    for edge in graph.edges.iter().filter(|edge| follow(edge)) {
        let (source, target) = (edge.source.as_str(), edge.target.as_str());
        if !known_nodes.contains(source) || !known_nodes.contains(target) {
            // Skip dangling edges instead of failing the whole traversal.
            continue;
        }
        adjacency.entry(source).or_default().push(target);
        adjacency.entry(target).or_default().push(source);
    }
    adjacency
}

/// Nodes reachable from `seed` over accepted edges, ignoring direction.
pub fn connected_component<F>(graph: &ItemGraph, seed: &str, follow: F) -> HashSet<String>
where
    F: Fn(&GraphEdge) -> bool,
{
    let adjacency = adjacency_map(graph, follow);
    let mut visited = HashSet::new();
    if !adjacency.contains_key(seed) {
        return visited;
    }

    let mut queue = VecDeque::from([seed]);
    visited.insert(seed.to_string());
    while let Some(node_id) = queue.pop_front() {
        let Some(neighbours) = adjacency.get(node_id) else {
            continue;
        };
        for neighbour in neighbours {
            if visited.insert((*neighbour).to_string()) {
                queue.push_back(neighbour);
            }
        }
    }
    visited
}

/// Keeps only `keep` nodes and the edges between them.
pub fn retain_nodes(graph: &mut ItemGraph, keep: &HashSet<String>) {
    graph.nodes.retain(|node| keep.contains(&node.id));
    drop_dangling_edges(graph);
}

pub fn drop_dangling_edges(graph: &mut ItemGraph) {
    let known: HashSet<&str> = graph.nodes.iter().map(|node| node.id.as_str()).collect();
    graph
        .edges
        .retain(|edge| known.contains(edge.source.as_str()) && known.contains(edge.target.as_str()));
}

/// Drops nodes of `leaf_types` that are not the source of any edge.
pub fn prune_leaves(graph: &mut ItemGraph, leaf_types: &[EntityType]) {
    if leaf_types.is_empty() {
        return;
    }
    let sources: HashSet<&str> = graph.edges.iter().map(|edge| edge.source.as_str()).collect();
    let keep: HashSet<String> = graph
        .nodes
        .iter()
        .filter(|node| !leaf_types.contains(&node.node_type) || sources.contains(node.id.as_str()))
        .map(|node| node.id.clone())
        .collect();
    retain_nodes(graph, &keep);
}
