use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::cascade::{cascade_delete, propagate_item_id_change};
use crate::config::GraphConfig;
use crate::error::{LibError, Result};
use crate::graph;
use crate::invariants::{
    RelationshipInvariantViolation, ensure_relationship_invariants,
    relationship_invariant_violations,
};
use crate::models::{
    CollectionDocument, CompositionList, CreateCollectionPayload, DeleteOutcome, GraphQuery,
    Item, ItemGraph, Relationship, SyncWarning, UpdateItemPayload, WriteOutcome,
};
use crate::permissions::{Actor, CreatorGroupPolicy, PermissionPolicy};
use crate::references::extract_references;
use crate::relationships::{resolve_references, synchronize_relationships};
use crate::store::{DocFilter, DocPatch, DocumentStore, Namespace};

const IMMUTABLE_FIELDS: [&str; 3] = ["immutable_id", "refcode", "type"];
const REFCODE_ATTEMPTS: usize = 5;

/// Tool-friendly item and graph actions.
///
/// Callers must provide a trusted `actor` sourced from validated auth/session state,
/// not from request bodies.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum ItemOperation {
    CreateItem {
        item: Value,
    },
    UpdateItem {
        item_id: String,
        payload: UpdateItemPayload,
    },
    GetItem {
        item_id: String,
    },
    DeleteItem {
        item_id: String,
    },
    CheckRelationships {
        item_id: String,
    },
    CreateCollection {
        payload: CreateCollectionPayload,
    },
    DeleteCollection {
        collection_id: String,
    },
    GlobalGraph {
        #[serde(default)]
        query: GraphQuery,
    },
    ItemGraph {
        item_id: String,
        #[serde(default)]
        query: GraphQuery,
    },
    CollectionGraph {
        collection_id: String,
        #[serde(default)]
        query: GraphQuery,
    },
}

/// Dry-run comparison of a stored relationship list with what synchronization would write.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipReport {
    pub violations: Vec<RelationshipInvariantViolation>,
    pub warnings: Vec<SyncWarning>,
    pub synchronized: Vec<Relationship>,
}

impl RelationshipReport {
    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ItemOperationResult {
    Item { item: Item },
    Written { outcome: WriteOutcome },
    Collection { collection: CollectionDocument },
    Relationships { report: RelationshipReport },
    Graph { graph: ItemGraph },
    Deleted { outcome: DeleteOutcome },
}

pub struct ItemOperations<S, P = CreatorGroupPolicy> {
    store: Arc<S>,
    policy: Arc<P>,
    config: Arc<GraphConfig>,
}

impl<S, P> Clone for ItemOperations<S, P> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            policy: Arc::clone(&self.policy),
            config: Arc::clone(&self.config),
        }
    }
}

impl<S: DocumentStore> ItemOperations<S> {
    pub fn with_default_policy(store: Arc<S>, config: GraphConfig) -> Self {
        Self::new(store, CreatorGroupPolicy, config)
    }
}

impl<S: DocumentStore, P: PermissionPolicy> ItemOperations<S, P> {
    pub fn new(store: Arc<S>, policy: P, config: GraphConfig) -> Self {
        Self {
            store,
            policy: Arc::new(policy),
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub async fn execute(
        &self,
        actor: &Actor,
        operation: ItemOperation,
    ) -> Result<ItemOperationResult> {
        match operation {
            ItemOperation::CreateItem { item } => {
                let outcome = self.create_item(actor, item).await?;
                Ok(ItemOperationResult::Written { outcome })
            }
            ItemOperation::UpdateItem { item_id, payload } => {
                let outcome = self.update_item(actor, &item_id, payload).await?;
                Ok(ItemOperationResult::Written { outcome })
            }
            ItemOperation::GetItem { item_id } => {
                let item = self.get_item(actor, &item_id).await?;
                Ok(ItemOperationResult::Item { item })
            }
            ItemOperation::DeleteItem { item_id } => {
                let outcome = self.delete_item(actor, &item_id).await?;
                Ok(ItemOperationResult::Deleted { outcome })
            }
            ItemOperation::CheckRelationships { item_id } => {
                let report = self.check_relationships(actor, &item_id).await?;
                Ok(ItemOperationResult::Relationships { report })
            }
            ItemOperation::CreateCollection { payload } => {
                let collection = self.create_collection(actor, payload).await?;
                Ok(ItemOperationResult::Collection { collection })
            }
            ItemOperation::DeleteCollection { collection_id } => {
                self.delete_collection(actor, &collection_id).await?;
                Ok(ItemOperationResult::Deleted {
                    outcome: DeleteOutcome {
                        cleaned_referrers: 0,
                    },
                })
            }
            ItemOperation::GlobalGraph { query } => {
                let graph = self.global_graph(actor, query).await?;
                Ok(ItemOperationResult::Graph { graph })
            }
            ItemOperation::ItemGraph { item_id, query } => {
                let graph = self.item_graph(actor, &item_id, query).await?;
                Ok(ItemOperationResult::Graph { graph })
            }
            ItemOperation::CollectionGraph {
                collection_id,
                query,
            } => {
                let graph = self.collection_graph(actor, &collection_id, query).await?;
                Ok(ItemOperationResult::Graph { graph })
            }
        }
    }

    pub async fn create_item(&self, actor: &Actor, document: Value) -> Result<WriteOutcome> {
        let mut item = Item::from_document(document)?;
        item.validate()?;
        self.ensure_item_id_free(&item.item_id).await?;

        item.immutable_id = Some(Uuid::new_v4().to_string());
        item.refcode = Some(self.generate_refcode().await?);
        if !item.creator_ids.contains(&actor.user_id) {
            item.creator_ids.push(actor.user_id);
        }

        let warnings = self.synchronize(&mut item).await?;
        item.last_modified = Some(Utc::now());
        self.store
            .insert_one(Namespace::Items, item.to_document()?)
            .await?;

        tracing::info!(
            item_id = %item.item_id,
            relationships = item.relationships.len(),
            "item created"
        );
        Ok(WriteOutcome { item, warnings })
    }

    pub async fn update_item(
        &self,
        actor: &Actor,
        item_id: &str,
        payload: UpdateItemPayload,
    ) -> Result<WriteOutcome> {
        let (existing, mut document) = self
            .load_item(actor, item_id, self.policy.write_filter(actor))
            .await?;

        for field in IMMUTABLE_FIELDS {
            let changed = payload
                .fields
                .get(field)
                .is_some_and(|value| document.get(field) != Some(value));
            if changed {
                return Err(LibError::invalid_with_code(
                    "immutable_field",
                    "Field cannot be changed after creation",
                    anyhow!("attempted to change {field} of item {item_id}"),
                ));
            }
        }
        if let Value::Object(fields) = &mut document {
            for (field, value) in &payload.fields {
                fields.insert(field.clone(), value.clone());
            }
        }

        let mut item = Item::from_document(document)?;
        item.validate()?;

        let renamed = item.item_id != existing.item_id;
        if renamed {
            self.ensure_item_id_free(&item.item_id).await?;
        }

        let warnings = self.synchronize(&mut item).await?;
        item.last_modified = Some(Utc::now());
        let patch = item_patch(&item, &payload)?;
        let filter = immutable_filter(&existing)?;

        if renamed {
            let propagated = propagate_item_id_change(
                self.store.as_ref(),
                &item,
                &existing.item_id,
                &item.item_id,
            )
            .await;
            if let Err(err) = propagated {
                self.revert_item_id_change(&item, &existing.item_id).await;
                return Err(err);
            }
        }
        let persisted = match self.store.update_one(Namespace::Items, &filter, &patch).await {
            Ok(ack) if ack.matched == 0 => Err(LibError::not_found(
                "Item not found",
                anyhow!("item {item_id} disappeared during update"),
            )),
            Ok(_) => Ok(()),
            Err(err) => Err(err),
        };
        if let Err(err) = persisted {
            if renamed {
                self.revert_item_id_change(&item, &existing.item_id).await;
            }
            return Err(err);
        }

        tracing::info!(
            item_id = %item.item_id,
            relationships = item.relationships.len(),
            "item updated"
        );
        Ok(WriteOutcome { item, warnings })
    }

    pub async fn get_item(&self, actor: &Actor, item_id: &str) -> Result<Item> {
        let (item, _) = self
            .load_item(actor, item_id, self.policy.read_filter(actor))
            .await?;
        Ok(item)
    }

    /// Cleans every referrer, then removes the item. A failed cleanup leaves the item stored.
    pub async fn delete_item(&self, actor: &Actor, item_id: &str) -> Result<DeleteOutcome> {
        let (item, _) = self
            .load_item(actor, item_id, self.policy.write_filter(actor))
            .await?;

        let cleaned_referrers = cascade_delete(self.store.as_ref(), &item).await?;
        let ack = self
            .store
            .delete_one(Namespace::Items, &immutable_filter(&item)?)
            .await?;
        if ack.deleted == 0 {
            tracing::warn!(item_id, "item vanished before its document was removed");
        }

        tracing::info!(item_id, cleaned_referrers, "item deleted");
        Ok(DeleteOutcome { cleaned_referrers })
    }

    pub async fn check_relationships(
        &self,
        actor: &Actor,
        item_id: &str,
    ) -> Result<RelationshipReport> {
        let (item, _) = self
            .load_item(actor, item_id, self.policy.read_filter(actor))
            .await?;

        let extracted = extract_references(&item);
        let resolved = resolve_references(self.store.as_ref(), &item, extracted).await?;
        let violations =
            relationship_invariant_violations(&item.relationships, &resolved.references, &resolved.index);
        let synchronized =
            synchronize_relationships(&item.relationships, &resolved.references, &resolved.index);

        Ok(RelationshipReport {
            violations,
            warnings: resolved.warnings,
            synchronized,
        })
    }

    pub async fn create_collection(
        &self,
        actor: &Actor,
        payload: CreateCollectionPayload,
    ) -> Result<CollectionDocument> {
        let collection_id = payload.collection_id.trim().to_string();
        if collection_id.is_empty() {
            return Err(LibError::invalid(
                "Collection ID is required",
                anyhow!("empty collection_id"),
            ));
        }
        let taken = self
            .store
            .find_one(
                Namespace::Collections,
                &DocFilter::field_eq("collection_id", collection_id.as_str()),
            )
            .await?;
        if taken.is_some() {
            return Err(LibError::invalid_with_code(
                "collection_id_taken",
                "Collection ID already exists",
                anyhow!("duplicate collection_id {collection_id}"),
            ));
        }

        let collection = CollectionDocument {
            collection_id,
            immutable_id: Some(Uuid::new_v4().to_string()),
            title: payload.title,
            creator_ids: vec![actor.user_id],
            group_ids: payload.group_ids,
            extra: serde_json::Map::new(),
        };
        let document = serde_json::to_value(&collection)
            .map_err(|err| LibError::unknown("Collection could not be serialized", anyhow!(err)))?;
        self.store
            .insert_one(Namespace::Collections, document)
            .await?;

        tracing::info!(collection_id = %collection.collection_id, "collection created");
        Ok(collection)
    }

    /// Removes only the collection document; members keep their stale entries.
    pub async fn delete_collection(&self, actor: &Actor, collection_id: &str) -> Result<()> {
        let filter = DocFilter::field_eq("collection_id", collection_id)
            .and(self.policy.write_filter(actor));
        let ack = self
            .store
            .delete_one(Namespace::Collections, &filter)
            .await?;
        if ack.deleted == 0 {
            return Err(LibError::not_found(
                "Collection not found",
                anyhow!("collection {collection_id} not found or not writable"),
            ));
        }

        tracing::info!(collection_id, "collection deleted");
        Ok(())
    }

    pub async fn global_graph(&self, actor: &Actor, query: GraphQuery) -> Result<ItemGraph> {
        graph::global_graph(
            self.store.as_ref(),
            &self.policy.read_filter(actor),
            self.show_collections(&query),
            &self.config.leaf_types,
        )
        .await
    }

    pub async fn item_graph(
        &self,
        actor: &Actor,
        item_id: &str,
        query: GraphQuery,
    ) -> Result<ItemGraph> {
        graph::item_graph(
            self.store.as_ref(),
            &self.policy.read_filter(actor),
            item_id,
            self.show_collections(&query),
        )
        .await
    }

    pub async fn collection_graph(
        &self,
        actor: &Actor,
        collection_id: &str,
        query: GraphQuery,
    ) -> Result<ItemGraph> {
        graph::collection_graph(
            self.store.as_ref(),
            &self.policy.read_filter(actor),
            collection_id,
            self.show_collections(&query),
        )
        .await
    }

    fn show_collections(&self, query: &GraphQuery) -> bool {
        !query
            .hide_collections
            .unwrap_or(self.config.hide_collections)
    }

    async fn load_item(
        &self,
        actor: &Actor,
        item_id: &str,
        permission: DocFilter,
    ) -> Result<(Item, Value)> {
        let filter = DocFilter::field_eq("item_id", item_id).and(permission);
        let Some(document) = self.store.find_one(Namespace::Items, &filter).await? else {
            return Err(LibError::not_found(
                "Item not found",
                anyhow!("item {item_id} not found for user {}", actor.user_id),
            ));
        };
        let item = Item::from_document(document.clone())?;
        Ok((item, document))
    }

    async fn ensure_item_id_free(&self, item_id: &str) -> Result<()> {
        let taken = self
            .store
            .find_one(Namespace::Items, &DocFilter::field_eq("item_id", item_id))
            .await?;
        if taken.is_some() {
            return Err(LibError::invalid_with_code(
                "item_id_taken",
                "Item ID already exists",
                anyhow!("duplicate item_id {item_id}"),
            ));
        }
        Ok(())
    }

    async fn generate_refcode(&self) -> Result<String> {
        for _ in 0..REFCODE_ATTEMPTS {
            let suffix: String = Uuid::new_v4().simple().to_string().chars().take(6).collect();
            let refcode = format!("{}:{suffix}", self.config.refcode_prefix);
            let taken = self
                .store
                .find_one(Namespace::Items, &DocFilter::field_eq("refcode", refcode.as_str()))
                .await?;
            if taken.is_none() {
                return Ok(refcode);
            }
        }
        Err(LibError::message("Could not allocate a unique refcode"))
    }

    /// Points referrers back at `previous` after the renamed item failed to persist.
    async fn revert_item_id_change(&self, item: &Item, previous: &str) {
        if let Err(err) =
            propagate_item_id_change(self.store.as_ref(), item, &item.item_id, previous).await
        {
            tracing::error!(
                item_id = previous,
                renamed_to = %item.item_id,
                error = %err.source,
                "referrers left pointing at an unsaved item id"
            );
        }
    }

    /// Extract, resolve, reconcile and check; leaves the new list on `item`.
    async fn synchronize(&self, item: &mut Item) -> Result<Vec<SyncWarning>> {
        let extracted = extract_references(&*item);
        let resolved = resolve_references(self.store.as_ref(), item, extracted).await?;
        let relationships =
            synchronize_relationships(&item.relationships, &resolved.references, &resolved.index);
        ensure_relationship_invariants(&relationships, &resolved.references, &resolved.index)?;

        tracing::debug!(
            item_id = %item.item_id,
            before = item.relationships.len(),
            after = relationships.len(),
            "relationships synchronized"
        );
        item.relationships = relationships;
        Ok(resolved.warnings)
    }
}

fn immutable_filter(item: &Item) -> Result<DocFilter> {
    let immutable_id = item.immutable_id.as_deref().ok_or_else(|| {
        LibError::unknown(
            "Stored item has no immutable ID",
            anyhow!("item {} has no immutable_id", item.item_id),
        )
    })?;
    Ok(DocFilter::field_eq("immutable_id", immutable_id))
}

/// Every field of the rewritten item, with cleared payload fields and lists written explicitly.
fn item_patch(item: &Item, payload: &UpdateItemPayload) -> Result<DocPatch> {
    let Value::Object(fields) = item.to_document()? else {
        return Err(LibError::message("Item did not serialize to an object"));
    };

    let mut patch = DocPatch::new();
    for (field, requested) in &payload.fields {
        if !fields.contains_key(field) {
            patch.insert(field, cleared_value(requested));
        }
    }
    for list in CompositionList::ALL {
        if !fields.contains_key(list.field_name()) && payload.fields.contains_key(list.field_name())
        {
            patch.insert(list.field_name(), json!([]));
        }
    }
    for (field, value) in fields {
        patch.insert(&field, value);
    }
    Ok(patch)
}

/// Stored form of a field the item skips when empty, shaped like the requested value.
fn cleared_value(requested: &Value) -> Value {
    match requested {
        Value::Array(_) => json!([]),
        Value::Object(_) => json!({}),
        _ => Value::Null,
    }
}
