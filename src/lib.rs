pub mod algorithms;
#[cfg(feature = "api")]
pub mod api;
pub mod cascade;
pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod graph;
pub mod invariants;
pub mod models;
pub mod operations;
pub mod permissions;
pub mod references;
pub mod relationships;
pub mod store;

pub mod prelude {
    pub use crate::algorithms::{connected_component, prune_leaves};
    #[cfg(feature = "api")]
    pub use crate::api::{AppError, CurrentActor, GraphApp};
    pub use crate::cascade::{cascade_delete, propagate_item_id_change};
    pub use crate::config::GraphConfig;
    #[cfg(feature = "sqlx")]
    pub use crate::db::{PgDocumentStore, create_document_tables};
    pub use crate::error::{ErrorKind, LibError, Result};
    pub use crate::graph::{build_graph, collection_graph, global_graph, item_graph};
    pub use crate::invariants::{
        RelationshipInvariantViolation, ensure_relationship_invariants,
        relationship_invariant_violations,
    };
    pub use crate::models::{
        CollectionDocument, Constituent, ConstituentItem, CreateCollectionPayload, DeleteOutcome,
        EntityType, EntryReference, GraphEdge, GraphNode, GraphQuery, GroupId, InlineSubstance,
        Item, ItemGraph, ItemType, RelationType, Relationship, SyncWarning, TargetIdentifier,
        UpdateItemPayload, UserId, WriteOutcome,
    };
    pub use crate::operations::{
        ItemOperation, ItemOperationResult, ItemOperations, RelationshipReport,
    };
    pub use crate::permissions::{Actor, CreatorGroupPolicy, PermissionPolicy, Role};
    pub use crate::references::{ExtractedReferences, RelationshipSource, extract_references};
    pub use crate::relationships::{
        IdentityIndex, TargetIdentity, resolve_references, synchronize_relationships,
    };
    pub use crate::store::{DocFilter, DocPatch, DocumentStore, MemoryStore, Namespace};
}
