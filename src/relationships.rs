use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use serde_json::Value;

use crate::error::Result;
use crate::models::{
    CONSTITUENT_DESCRIPTION, EntityType, Item, ReferenceCategory, RelationType, Relationship,
    SyncWarning, TargetIdentifier,
};
use crate::references::ExtractedReferences;
use crate::store::{DocFilter, DocumentStore, Namespace};

/// A live entity as seen by identity resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetIdentity {
    pub immutable_id: String,
    pub entity_type: EntityType,
    pub item_id: Option<String>,
    pub refcode: Option<String>,
}

impl TargetIdentity {
    pub fn collection(immutable_id: impl Into<String>) -> Self {
        Self {
            immutable_id: immutable_id.into(),
            entity_type: EntityType::Collections,
            item_id: None,
            refcode: None,
        }
    }

    pub fn of_item(item: &Item) -> Option<Self> {
        Some(Self {
            immutable_id: item.immutable_id.clone()?,
            entity_type: item.item_type.into(),
            item_id: Some(item.item_id.clone()),
            refcode: item.refcode.clone(),
        })
    }

    pub fn from_item_document(document: &Value) -> Option<Self> {
        #[derive(Deserialize)]
        struct IdentityFields {
            immutable_id: String,
            #[serde(rename = "type")]
            entity_type: EntityType,
            item_id: Option<String>,
            refcode: Option<String>,
        }

        let fields = IdentityFields::deserialize(document).ok()?;
        Some(Self {
            immutable_id: fields.immutable_id,
            entity_type: fields.entity_type,
            item_id: fields.item_id,
            refcode: fields.refcode,
        })
    }

    pub fn from_collection_document(document: &Value) -> Option<Self> {
        document
            .get("immutable_id")
            .and_then(Value::as_str)
            .map(Self::collection)
    }
}

/// Comparison key for relationship targets. Known entities compare by `immutable_id`, so a
/// relationship stored by `item_id` and a token carrying the `refcode` of the same item agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CanonicalKey {
    Known(String),
    Unresolved(TargetIdentifier),
}

#[derive(Debug, Clone, Default)]
pub struct IdentityIndex {
    by_identifier: HashMap<TargetIdentifier, TargetIdentity>,
}

impl IdentityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, identity: TargetIdentity) {
        if let Some(item_id) = &identity.item_id {
            self.by_identifier
                .insert(TargetIdentifier::ItemId(item_id.clone()), identity.clone());
        }
        if let Some(refcode) = &identity.refcode {
            self.by_identifier
                .insert(TargetIdentifier::Refcode(refcode.clone()), identity.clone());
        }
        self.by_identifier.insert(
            TargetIdentifier::ImmutableId(identity.immutable_id.clone()),
            identity,
        );
    }

    pub fn resolve(&self, identifier: &TargetIdentifier) -> Option<&TargetIdentity> {
        self.by_identifier.get(identifier)
    }

    pub fn canonical(&self, identifier: &TargetIdentifier) -> CanonicalKey {
        match self.resolve(identifier) {
            Some(identity) => CanonicalKey::Known(identity.immutable_id.clone()),
            None => CanonicalKey::Unresolved(identifier.clone()),
        }
    }

    pub fn len(&self) -> usize {
        self.by_identifier.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_identifier.is_empty()
    }
}

/// Which auto-generated family a stored relationship belongs to; `None` means manual.
pub fn relationship_category(relationship: &Relationship) -> Option<ReferenceCategory> {
    if relationship.target_type == EntityType::Collections {
        Some(ReferenceCategory::Collection)
    } else if relationship.relation == RelationType::Mentioned {
        Some(ReferenceCategory::Mention)
    } else if relationship.is_constituent_link() {
        Some(ReferenceCategory::Composition)
    } else {
        None
    }
}

/// Outcome of looking every reference up in the store.
#[derive(Debug, Clone, Default)]
pub struct ResolvedReferences {
    pub references: ExtractedReferences,
    pub index: IdentityIndex,
    pub warnings: Vec<SyncWarning>,
}

/// Resolves extracted tokens and existing relationship targets against the store.
///
/// Tokens naming entities that do not exist are dropped and reported as warnings; tokens
/// resolving to `item` itself are dropped silently.
pub async fn resolve_references<S: DocumentStore>(
    store: &S,
    item: &Item,
    extracted: ExtractedReferences,
) -> Result<ResolvedReferences> {
    let mut item_identifiers: Vec<TargetIdentifier> = Vec::new();
    let mut collection_identifiers: Vec<TargetIdentifier> = Vec::new();
    let push_unique = |list: &mut Vec<TargetIdentifier>, identifier: &TargetIdentifier| {
        if !list.contains(identifier) {
            list.push(identifier.clone());
        }
    };

    for token in &extracted.composition {
        push_unique(&mut item_identifiers, &token.identifier);
    }
    for token in &extracted.mentions {
        push_unique(&mut item_identifiers, &token.identifier);
    }
    for token in &extracted.collections {
        push_unique(&mut collection_identifiers, &token.identifier());
    }
    for relationship in &item.relationships {
        if relationship.target_type == EntityType::Collections {
            push_unique(&mut collection_identifiers, &relationship.target);
        } else {
            push_unique(&mut item_identifiers, &relationship.target);
        }
    }

    let mut index = IdentityIndex::new();
    if !item_identifiers.is_empty() {
        let filter = DocFilter::Or(item_identifiers.iter().map(DocFilter::identifier).collect());
        for document in store.find(Namespace::Items, &filter).await? {
            if let Some(identity) = TargetIdentity::from_item_document(&document) {
                index.insert(identity);
            }
        }
    }
    if !collection_identifiers.is_empty() {
        let filter = DocFilter::Or(
            collection_identifiers
                .iter()
                .map(DocFilter::identifier)
                .collect(),
        );
        for document in store.find(Namespace::Collections, &filter).await? {
            if let Some(identity) = TargetIdentity::from_collection_document(&document) {
                index.insert(identity);
            }
        }
    }
    // The item itself may not be stored yet (create) or may be mid-rename (update).
    if let Some(identity) = TargetIdentity::of_item(item) {
        index.insert(identity);
    }

    let own_key = item
        .immutable_id
        .as_ref()
        .map(|id| CanonicalKey::Known(id.clone()));
    let is_self = |identifier: &TargetIdentifier| {
        item.is_addressed_by(identifier) || own_key.as_ref() == Some(&index.canonical(identifier))
    };

    let mut warnings = Vec::new();
    let mut keep = |category: ReferenceCategory, identifier: &TargetIdentifier| -> bool {
        if is_self(identifier) {
            return false;
        }
        if index.resolve(identifier).is_some() {
            return true;
        }
        tracing::warn!(
            item_id = %item.item_id,
            reference = %identifier,
            ?category,
            "omitting relationship to missing entity"
        );
        warnings.push(SyncWarning {
            category,
            identifier: identifier.clone(),
        });
        false
    };

    let references = ExtractedReferences {
        composition: extracted
            .composition
            .into_iter()
            .filter(|token| keep(ReferenceCategory::Composition, &token.identifier))
            .collect(),
        collections: extracted
            .collections
            .into_iter()
            .filter(|token| keep(ReferenceCategory::Collection, &token.identifier()))
            .collect(),
        mentions: extracted
            .mentions
            .into_iter()
            .filter(|token| keep(ReferenceCategory::Mention, &token.identifier))
            .collect(),
    };

    Ok(ResolvedReferences {
        references,
        index,
        warnings,
    })
}

struct WantedTarget {
    relation: RelationType,
    build: Relationship,
}

/// Reconciles `existing` against the extracted tokens.
///
/// Manual relationships are kept untouched and in place. Auto-generated relationships
/// whose token disappeared are removed, duplicates of one target collapse to the first
/// entry, and relationships for new tokens are appended in token order.
pub fn synchronize_relationships(
    existing: &[Relationship],
    tokens: &ExtractedReferences,
    index: &IdentityIndex,
) -> Vec<Relationship> {
    let wanted = wanted_relationships(tokens, index);

    let manual_keys: HashSet<(CanonicalKey, RelationType)> = existing
        .iter()
        .filter(|relationship| relationship_category(relationship).is_none())
        .map(|relationship| (index.canonical(&relationship.target), relationship.relation))
        .collect();

    let mut satisfied: HashSet<(ReferenceCategory, CanonicalKey)> = HashSet::new();
    let mut output = Vec::with_capacity(existing.len() + tokens.composition.len());
    for relationship in existing {
        let Some(category) = relationship_category(relationship) else {
            output.push(relationship.clone());
            continue;
        };
        let key = index.canonical(&relationship.target);
        let still_wanted = wanted
            .get(&category)
            .and_then(|targets| targets.iter().find(|(target, _)| *target == key))
            .is_some_and(|(_, target)| target.relation == relationship.relation);
        if still_wanted && satisfied.insert((category, key)) {
            output.push(relationship.clone());
        }
    }

    for category in [
        ReferenceCategory::Composition,
        ReferenceCategory::Collection,
        ReferenceCategory::Mention,
    ] {
        let Some(targets) = wanted.get(&category) else {
            continue;
        };
        for (key, target) in targets {
            if satisfied.contains(&(category, key.clone())) {
                continue;
            }
            if manual_keys.contains(&(key.clone(), target.relation)) {
                continue;
            }
            satisfied.insert((category, key.clone()));
            output.push(target.build.clone());
        }
    }

    output
}

fn wanted_relationships(
    tokens: &ExtractedReferences,
    index: &IdentityIndex,
) -> HashMap<ReferenceCategory, Vec<(CanonicalKey, WantedTarget)>> {
    let mut wanted: HashMap<ReferenceCategory, Vec<(CanonicalKey, WantedTarget)>> = HashMap::new();
    let mut push = |category: ReferenceCategory, key: CanonicalKey, target: WantedTarget| {
        let targets = wanted.entry(category).or_default();
        if !targets.iter().any(|(existing, _)| *existing == key) {
            targets.push((key, target));
        }
    };

    for token in &tokens.composition {
        let resolved_type = index
            .resolve(&token.identifier)
            .map(|identity| identity.entity_type)
            .or(token.target_type);
        let Some(target_type) = resolved_type else {
            tracing::debug!(reference = %token.identifier, "constituent has no known type");
            continue;
        };
        let relation = token.list.relation();
        push(
            ReferenceCategory::Composition,
            index.canonical(&token.identifier),
            WantedTarget {
                relation,
                build: Relationship::new(relation, target_type, token.identifier.clone())
                    .with_description(CONSTITUENT_DESCRIPTION),
            },
        );
    }

    for token in &tokens.collections {
        let identifier = token.identifier();
        push(
            ReferenceCategory::Collection,
            index.canonical(&identifier),
            WantedTarget {
                relation: RelationType::IsPartOf,
                build: Relationship::new(
                    RelationType::IsPartOf,
                    EntityType::Collections,
                    identifier,
                ),
            },
        );
    }

    for token in &tokens.mentions {
        let target_type = index
            .resolve(&token.identifier)
            .map_or(token.target_type, |identity| identity.entity_type);
        push(
            ReferenceCategory::Mention,
            index.canonical(&token.identifier),
            WantedTarget {
                relation: RelationType::Mentioned,
                build: Relationship::new(
                    RelationType::Mentioned,
                    target_type,
                    token.identifier.clone(),
                ),
            },
        );
    }

    wanted
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::models::{CollectionReference, Constituent, EntryReference, ItemType};
    use crate::references::extract_references;
    use crate::store::MemoryStore;

    fn identity(immutable_id: &str, item_id: &str, refcode: &str) -> TargetIdentity {
        TargetIdentity {
            immutable_id: immutable_id.to_string(),
            entity_type: EntityType::Samples,
            item_id: Some(item_id.to_string()),
            refcode: Some(refcode.to_string()),
        }
    }

    fn sample_with_parents(parents: &[&str]) -> Item {
        let mut item = Item::new(ItemType::Sample, "child");
        for parent in parents {
            item.synthesis_constituents.push(Constituent::entry(
                EntryReference::item_id(*parent).with_type(ItemType::Sample),
                Some(1.0),
            ));
        }
        item
    }

    fn sync(item: &Item, index: &IdentityIndex) -> Vec<Relationship> {
        synchronize_relationships(&item.relationships, &extract_references(item), index)
    }

    #[test]
    fn synchronization_is_idempotent() {
        let mut item = sample_with_parents(&["a", "b"]);
        item.collections.push(CollectionReference::new("c1"));
        item.description =
            Some(r#"<span data-item-id="a" data-type="samples">a</span>"#.to_string());
        let index = IdentityIndex::new();

        let first = sync(&item, &index);
        item.relationships = first.clone();
        let second = sync(&item, &index);
        assert_eq!(first, second);
        assert_eq!(first.len(), 4);
    }

    #[test]
    fn composition_round_trip_produces_one_edge_per_constituent() {
        let mut item = sample_with_parents(&["a", "b", "a"]);
        item.relationships = vec![
            Relationship::new(
                RelationType::Parent,
                EntityType::Samples,
                TargetIdentifier::ItemId("b".to_string()),
            )
            .with_description(CONSTITUENT_DESCRIPTION),
            Relationship::new(
                RelationType::Parent,
                EntityType::Samples,
                TargetIdentifier::ItemId("b".to_string()),
            )
            .with_description(CONSTITUENT_DESCRIPTION),
        ];

        let output = sync(&item, &IdentityIndex::new());
        let targets: Vec<&str> = output.iter().map(|rel| rel.target.value()).collect();
        assert_eq!(targets, vec!["b", "a"]);
        assert!(output.iter().all(|rel| rel.relation == RelationType::Parent));
    }

    #[test]
    fn refcode_token_matches_relationship_stored_by_item_id() {
        let mut index = IdentityIndex::new();
        index.insert(identity("imm-a", "a", "lab:aaaaaa"));

        let mut item = Item::new(ItemType::Sample, "child");
        item.synthesis_constituents.push(Constituent::entry(
            EntryReference::item_id("a").with_refcode("lab:aaaaaa"),
            None,
        ));
        let stored = Relationship::new(
            RelationType::Parent,
            EntityType::Samples,
            TargetIdentifier::ItemId("a".to_string()),
        )
        .with_description(CONSTITUENT_DESCRIPTION);
        item.relationships = vec![stored.clone()];

        let output = sync(&item, &index);
        assert_eq!(output, vec![stored]);
    }

    #[test]
    fn manual_edges_survive_composition_edits() {
        let sibling = Relationship::new(
            RelationType::Sibling,
            EntityType::Samples,
            TargetIdentifier::ItemId("twin".to_string()),
        );
        let other: Relationship = serde_json::from_value(json!({
            "relation": "other",
            "type": "equipment",
            "refcode": "lab:balanc",
            "description": "weighed on",
            "custom": [1, 2, 3]
        }))
        .expect("relationship should parse");

        let mut item = sample_with_parents(&["a"]);
        item.relationships = vec![sibling.clone(), other.clone()];
        item.relationships = sync(&item, &IdentityIndex::new());

        item.synthesis_constituents = sample_with_parents(&["b"]).synthesis_constituents;
        let output = sync(&item, &IdentityIndex::new());

        assert_eq!(output[0], sibling);
        assert_eq!(output[1], other);
        assert_eq!(output.len(), 3);
        assert_eq!(output[2].target.value(), "b");
    }

    #[test]
    fn removing_collection_removes_only_its_relationship() {
        let mut item = Item::new(ItemType::Sample, "s");
        item.collections.push(CollectionReference::new("c1"));
        item.relationships = vec![Relationship::new(
            RelationType::Sibling,
            EntityType::Samples,
            TargetIdentifier::ItemId("x".to_string()),
        )];
        item.relationships = sync(&item, &IdentityIndex::new());
        let collection_edges = item
            .relationships
            .iter()
            .filter(|rel| rel.target_type == EntityType::Collections)
            .count();
        assert_eq!(collection_edges, 1);

        item.collections.clear();
        let output = sync(&item, &IdentityIndex::new());
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].relation, RelationType::Sibling);
    }

    #[test]
    fn manual_parent_edge_is_not_duplicated() {
        let manual = Relationship::new(
            RelationType::Parent,
            EntityType::Samples,
            TargetIdentifier::ItemId("a".to_string()),
        );
        let mut item = sample_with_parents(&["a"]);
        item.relationships = vec![manual.clone()];

        let output = sync(&item, &IdentityIndex::new());
        assert_eq!(output, vec![manual]);
    }

    #[tokio::test]
    async fn resolution_drops_missing_targets_with_warning() {
        let store = MemoryStore::new();
        store
            .insert_one(
                Namespace::Items,
                json!({"type": "samples", "item_id": "a", "immutable_id": "imm-a", "refcode": "lab:aaaaaa"}),
            )
            .await
            .expect("insert");

        let mut item = sample_with_parents(&["a", "ghost"]);
        item.immutable_id = Some("imm-child".to_string());
        item.description = Some(
            r#"<span data-item-id="ghost2" data-type="samples"></span>"#.to_string(),
        );

        let extracted = extract_references(&item);
        let resolved = resolve_references(&store, &item, extracted)
            .await
            .expect("resolution should succeed");

        assert_eq!(resolved.references.composition.len(), 1);
        assert!(resolved.references.mentions.is_empty());
        assert_eq!(
            resolved.warnings,
            vec![
                SyncWarning {
                    category: ReferenceCategory::Composition,
                    identifier: TargetIdentifier::ItemId("ghost".to_string()),
                },
                SyncWarning {
                    category: ReferenceCategory::Mention,
                    identifier: TargetIdentifier::ItemId("ghost2".to_string()),
                },
            ]
        );
        assert_eq!(
            resolved.index.canonical(&TargetIdentifier::Refcode("lab:aaaaaa".to_string())),
            CanonicalKey::Known("imm-a".to_string())
        );
    }

    #[tokio::test]
    async fn resolution_drops_self_reference_by_refcode() {
        let store = MemoryStore::new();
        let mut item = Item::new(ItemType::Sample, "me");
        item.immutable_id = Some("imm-me".to_string());
        item.refcode = Some("lab:mememe".to_string());
        item.synthesis_constituents.push(Constituent::entry(
            EntryReference::new(TargetIdentifier::Refcode("lab:mememe".to_string())),
            None,
        ));

        let extracted = extract_references(&item);
        let resolved = resolve_references(&store, &item, extracted)
            .await
            .expect("resolution should succeed");
        assert!(resolved.references.composition.is_empty());
        assert!(resolved.warnings.is_empty());
    }
}
