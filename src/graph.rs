//! Read-only graph views over stored relationships.
//!
//! Node ids are `immutable_id`s. Edges follow the data: a constituent or component points at
//! the item it went into, a mention points from the mentioning item to the mentioned one.

use std::collections::HashSet;

use anyhow::anyhow;
use serde_json::{Value, json};

use crate::algorithms::{connected_component, drop_dangling_edges, prune_leaves, retain_nodes};
use crate::error::{LibError, Result};
use crate::models::{EntityType, GraphEdge, GraphNode, Item, ItemGraph, RelationType};
use crate::relationships::{IdentityIndex, TargetIdentity};
use crate::store::{DocFilter, DocumentStore, Namespace};

/// Collection node as the graph needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionNode {
    pub immutable_id: String,
    pub collection_id: String,
}

impl CollectionNode {
    pub fn from_document(document: &Value) -> Option<Self> {
        Some(Self {
            immutable_id: document.get("immutable_id")?.as_str()?.to_string(),
            collection_id: document.get("collection_id")?.as_str()?.to_string(),
        })
    }
}

fn parse_items(documents: Vec<Value>) -> Vec<Item> {
    documents
        .into_iter()
        .filter_map(|document| match Item::from_document(document) {
            Ok(item) if item.immutable_id.is_some() => Some(item),
            Ok(item) => {
                tracing::warn!(item_id = %item.item_id, "skipping item without immutable id");
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, "skipping unreadable item document");
                None
            }
        })
        .collect()
}

/// Assembles nodes and edges from already-permitted documents.
///
/// Targets outside `items`/`collections` produce no edge; missing or unreadable collections
/// simply never become nodes.
pub fn build_graph(items: &[Item], collections: &[CollectionNode], show_collections: bool) -> ItemGraph {
    let mut index = IdentityIndex::new();
    for item in items {
        if let Some(identity) = TargetIdentity::of_item(item) {
            index.insert(identity);
        }
    }
    if show_collections {
        for collection in collections {
            index.insert(TargetIdentity::collection(collection.immutable_id.clone()));
        }
    }

    let mut graph = ItemGraph::default();
    for item in items {
        let Some(node_id) = item.immutable_id.as_deref() else {
            continue;
        };
        graph.nodes.push(GraphNode {
            id: node_id.to_string(),
            label: item.item_id.clone(),
            node_type: item.item_type.into(),
            refcode: item.refcode.clone(),
        });
    }
    if show_collections {
        graph.nodes.extend(collections.iter().map(|collection| GraphNode {
            id: collection.immutable_id.clone(),
            label: collection.collection_id.clone(),
            node_type: EntityType::Collections,
            refcode: None,
        }));
    }

    let mut seen_edges: HashSet<String> = HashSet::new();
    for item in items {
        let Some(node_id) = item.immutable_id.as_deref() else {
            continue;
        };
        for relationship in &item.relationships {
            let Some(target) = index.resolve(&relationship.target) else {
                continue;
            };
            let target_id = target.immutable_id.as_str();
            let edge = match (relationship.relation, relationship.target_type) {
                (RelationType::IsPartOf, EntityType::Collections) => {
                    GraphEdge::new(target_id, node_id, RelationType::IsPartOf)
                }
                (_, EntityType::Collections) => continue,
                (RelationType::Parent | RelationType::IsPartOf, _) => {
                    GraphEdge::new(target_id, node_id, relationship.relation)
                }
                (RelationType::Child, _) => GraphEdge::new(node_id, target_id, RelationType::Child),
                (RelationType::Mentioned, _) => {
                    GraphEdge::new(node_id, target_id, RelationType::Mentioned)
                }
                _ => continue,
            };
            if edge.source != edge.target && seen_edges.insert(edge.id.clone()) {
                graph.edges.push(edge);
            }
        }
    }

    drop_dangling_edges(&mut graph);
    graph
}

fn is_structural(edge: &GraphEdge) -> bool {
    matches!(
        edge.relation,
        RelationType::Parent | RelationType::Child | RelationType::IsPartOf
    )
}

async fn load_collections<S: DocumentStore>(
    store: &S,
    visible: &DocFilter,
    show_collections: bool,
) -> Result<Vec<CollectionNode>> {
    if !show_collections {
        return Ok(Vec::new());
    }
    let documents = store.find(Namespace::Collections, visible).await?;
    Ok(documents
        .iter()
        .filter_map(CollectionNode::from_document)
        .collect())
}

/// Every item the caller may read, with leaf-prone kinds dropped unless they feed an edge.
pub async fn global_graph<S: DocumentStore>(
    store: &S,
    visible: &DocFilter,
    show_collections: bool,
    leaf_types: &[EntityType],
) -> Result<ItemGraph> {
    let items = parse_items(store.find(Namespace::Items, visible).await?);
    let collections = load_collections(store, visible, show_collections).await?;

    let mut graph = build_graph(&items, &collections, show_collections);
    prune_leaves(&mut graph, leaf_types);
    tracing::debug!(
        nodes = graph.nodes.len(),
        edges = graph.edges.len(),
        "built global graph"
    );
    Ok(graph)
}

/// The structural component around one item plus that item's direct mentions.
pub async fn item_graph<S: DocumentStore>(
    store: &S,
    visible: &DocFilter,
    item_id: &str,
    show_collections: bool,
) -> Result<ItemGraph> {
    let items = parse_items(store.find(Namespace::Items, visible).await?);
    let Some(seed) = items
        .iter()
        .find(|item| item.item_id == item_id)
        .and_then(|item| item.immutable_id.clone())
    else {
        return Err(LibError::not_found(
            "Item not found",
            anyhow!("item {item_id} not found or not visible"),
        ));
    };
    let collections = load_collections(store, visible, show_collections).await?;

    let mut graph = build_graph(&items, &collections, show_collections);
    let collection_ids: HashSet<&str> = collections
        .iter()
        .map(|collection| collection.immutable_id.as_str())
        .collect();
    let component = connected_component(&graph, &seed, |edge| {
        is_structural(edge)
            && !collection_ids.contains(edge.source.as_str())
            && !collection_ids.contains(edge.target.as_str())
    });

    let mut keep = component.clone();
    for edge in &graph.edges {
        let mention_of_seed =
            edge.relation == RelationType::Mentioned && (edge.source == seed || edge.target == seed);
        if mention_of_seed {
            keep.insert(edge.source.clone());
            keep.insert(edge.target.clone());
        }
        let membership = collection_ids.contains(edge.source.as_str())
            && component.contains(&edge.target);
        if membership {
            keep.insert(edge.source.clone());
        }
    }
    retain_nodes(&mut graph, &keep);
    Ok(graph)
}

/// Items belonging to one collection; the collection itself is the scope, not a node.
pub async fn collection_graph<S: DocumentStore>(
    store: &S,
    visible: &DocFilter,
    collection_id: &str,
    show_collections: bool,
) -> Result<ItemGraph> {
    let scope = DocFilter::field_eq("collection_id", collection_id).and(visible.clone());
    let Some(collection) = store
        .find_one(Namespace::Collections, &scope)
        .await?
        .as_ref()
        .and_then(CollectionNode::from_document)
    else {
        return Err(LibError::not_found(
            "Collection not found",
            anyhow!("collection {collection_id} not found or not visible"),
        ));
    };

    let members = DocFilter::array_contains(
        "collections",
        json!({ "immutable_id": collection.immutable_id }),
    )
    .and(visible.clone());
    let items = parse_items(store.find(Namespace::Items, &members).await?);
    let collections: Vec<CollectionNode> = load_collections(store, visible, show_collections)
        .await?
        .into_iter()
        .filter(|other| other.immutable_id != collection.immutable_id)
        .collect();

    Ok(build_graph(&items, &collections, show_collections))
}
