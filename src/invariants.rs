use std::collections::{HashMap, HashSet};

use anyhow::anyhow;
use serde::Serialize;

use crate::error::{LibError, Result};
use crate::models::{ReferenceCategory, RelationType, Relationship, TargetIdentifier};
use crate::references::ExtractedReferences;
use crate::relationships::{CanonicalKey, IdentityIndex, relationship_category};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelationshipInvariantViolation {
    DuplicateRelationship {
        target: TargetIdentifier,
        relation: RelationType,
    },
    MissingConstituentRelationship {
        target: TargetIdentifier,
    },
    OrphanConstituentRelationship {
        target: TargetIdentifier,
    },
    MissingCollectionRelationship {
        target: TargetIdentifier,
    },
    UnexpectedCollectionRelationship {
        target: TargetIdentifier,
    },
    MissingMentionRelationship {
        target: TargetIdentifier,
    },
    UnexpectedMentionRelationship {
        target: TargetIdentifier,
    },
    DanglingReference {
        target: TargetIdentifier,
    },
}

impl RelationshipInvariantViolation {
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::DuplicateRelationship { .. } => "relationship_duplicate",
            Self::MissingConstituentRelationship { .. } => "relationship_missing_constituent",
            Self::OrphanConstituentRelationship { .. } => "relationship_orphan_constituent",
            Self::MissingCollectionRelationship { .. } => "relationship_missing_collection",
            Self::UnexpectedCollectionRelationship { .. } => "relationship_unexpected_collection",
            Self::MissingMentionRelationship { .. } => "relationship_missing_mention",
            Self::UnexpectedMentionRelationship { .. } => "relationship_unexpected_mention",
            Self::DanglingReference { .. } => "relationship_dangling_reference",
        }
    }

    pub const fn public_message(&self) -> &'static str {
        match self {
            Self::DuplicateRelationship { .. } => {
                "Item has two relationships of the same kind to one target"
            }
            Self::MissingConstituentRelationship { .. } => {
                "Constituent has no matching relationship"
            }
            Self::OrphanConstituentRelationship { .. } => {
                "Constituent relationship has no matching constituent"
            }
            Self::MissingCollectionRelationship { .. } => {
                "Collection membership has no matching relationship"
            }
            Self::UnexpectedCollectionRelationship { .. } => {
                "Collection relationship does not match collection membership"
            }
            Self::MissingMentionRelationship { .. } => "Mention has no matching relationship",
            Self::UnexpectedMentionRelationship { .. } => {
                "Mention relationship does not match any mention"
            }
            Self::DanglingReference { .. } => "Relationship points at a missing entity",
        }
    }

    /// Dangling manual references predate the write and must not block it.
    pub const fn blocks_write(&self) -> bool {
        !matches!(self, Self::DanglingReference { .. })
    }
}

/// Checks a synchronized relationship list against the tokens it was built from.
///
/// `index` must cover every relationship target, as produced by `resolve_references`.
pub fn relationship_invariant_violations(
    relationships: &[Relationship],
    tokens: &ExtractedReferences,
    index: &IdentityIndex,
) -> Vec<RelationshipInvariantViolation> {
    let mut violations = Vec::new();

    let mut counts: HashMap<(CanonicalKey, RelationType), usize> = HashMap::new();
    for relationship in relationships {
        let key = index.canonical(&relationship.target);
        if matches!(key, CanonicalKey::Unresolved(_)) {
            violations.push(RelationshipInvariantViolation::DanglingReference {
                target: relationship.target.clone(),
            });
        }
        let count = counts.entry((key, relationship.relation)).or_insert(0);
        *count += 1;
        if *count == 2 {
            violations.push(RelationshipInvariantViolation::DuplicateRelationship {
                target: relationship.target.clone(),
                relation: relationship.relation,
            });
        }
    }

    let composition_keys: HashSet<CanonicalKey> = tokens
        .composition
        .iter()
        .map(|token| index.canonical(&token.identifier))
        .collect();
    for token in &tokens.composition {
        let key = index.canonical(&token.identifier);
        if !counts.contains_key(&(key, token.list.relation())) {
            violations.push(RelationshipInvariantViolation::MissingConstituentRelationship {
                target: token.identifier.clone(),
            });
        }
    }

    let collection_keys: HashSet<CanonicalKey> = tokens
        .collections
        .iter()
        .map(|token| index.canonical(&token.identifier()))
        .collect();
    let mention_keys: HashSet<CanonicalKey> = tokens
        .mentions
        .iter()
        .map(|token| index.canonical(&token.identifier))
        .collect();

    let mut seen_collections = HashSet::new();
    let mut seen_mentions = HashSet::new();
    for relationship in relationships {
        let key = index.canonical(&relationship.target);
        match relationship_category(relationship) {
            Some(ReferenceCategory::Composition) if !composition_keys.contains(&key) => {
                violations.push(RelationshipInvariantViolation::OrphanConstituentRelationship {
                    target: relationship.target.clone(),
                });
            }
            Some(ReferenceCategory::Collection) => {
                if !collection_keys.contains(&key) {
                    violations.push(
                        RelationshipInvariantViolation::UnexpectedCollectionRelationship {
                            target: relationship.target.clone(),
                        },
                    );
                }
                seen_collections.insert(key);
            }
            Some(ReferenceCategory::Mention) => {
                if !mention_keys.contains(&key) {
                    violations.push(RelationshipInvariantViolation::UnexpectedMentionRelationship {
                        target: relationship.target.clone(),
                    });
                }
                seen_mentions.insert(key);
            }
            _ => {}
        }
    }

    for token in &tokens.collections {
        let identifier = token.identifier();
        if !seen_collections.contains(&index.canonical(&identifier)) {
            violations.push(RelationshipInvariantViolation::MissingCollectionRelationship {
                target: identifier,
            });
        }
    }
    for token in &tokens.mentions {
        if !seen_mentions.contains(&index.canonical(&token.identifier)) {
            violations.push(RelationshipInvariantViolation::MissingMentionRelationship {
                target: token.identifier.clone(),
            });
        }
    }

    violations
}

pub fn ensure_relationship_invariants(
    relationships: &[Relationship],
    tokens: &ExtractedReferences,
    index: &IdentityIndex,
) -> Result<()> {
    let violations = relationship_invariant_violations(relationships, tokens, index);
    for violation in violations.iter().filter(|violation| !violation.blocks_write()) {
        tracing::warn!(code = violation.error_code(), ?violation, "relationship invariant");
    }
    if let Some(first) = violations.iter().find(|violation| violation.blocks_write()) {
        return Err(LibError::invalid_with_code(
            first.error_code(),
            first.public_message(),
            anyhow!("relationship invariant validation failed: {:?}", violations),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        CONSTITUENT_DESCRIPTION, CollectionReference, Constituent, EntityType, EntryReference,
        Item, ItemType,
    };
    use crate::references::extract_references;
    use crate::relationships::{TargetIdentity, synchronize_relationships};

    fn parent_edge(item_id: &str) -> Relationship {
        Relationship::new(
            RelationType::Parent,
            EntityType::Samples,
            TargetIdentifier::ItemId(item_id.to_string()),
        )
        .with_description(CONSTITUENT_DESCRIPTION)
    }

    fn known_index(item_ids: &[&str]) -> IdentityIndex {
        let mut index = IdentityIndex::new();
        for item_id in item_ids {
            index.insert(TargetIdentity {
                immutable_id: format!("imm-{item_id}"),
                entity_type: EntityType::Samples,
                item_id: Some(item_id.to_string()),
                refcode: None,
            });
        }
        index.insert(TargetIdentity::collection("c1"));
        index
    }

    #[test]
    fn synchronized_lists_have_no_violations() {
        let mut item = Item::new(ItemType::Sample, "child");
        item.synthesis_constituents.push(Constituent::entry(
            EntryReference::item_id("a").with_type(ItemType::Sample),
            None,
        ));
        item.collections.push(CollectionReference::new("c1"));
        item.description = Some(r#"<i data-type="samples" data-item-id="b"></i>"#.to_string());

        let index = known_index(&["a", "b"]);
        let tokens = extract_references(&item);
        let relationships = synchronize_relationships(&item.relationships, &tokens, &index);

        assert!(relationship_invariant_violations(&relationships, &tokens, &index).is_empty());
        ensure_relationship_invariants(&relationships, &tokens, &index)
            .expect("synchronized list should pass");
    }

    #[test]
    fn duplicates_and_orphans_are_reported() {
        let index = known_index(&["a"]);
        let relationships = vec![parent_edge("a"), parent_edge("a")];
        let violations =
            relationship_invariant_violations(&relationships, &ExtractedReferences::default(), &index);

        assert!(violations.iter().any(|v| matches!(
            v,
            RelationshipInvariantViolation::DuplicateRelationship { relation, .. }
                if *relation == RelationType::Parent
        )));
        assert!(violations.iter().any(|v| matches!(
            v,
            RelationshipInvariantViolation::OrphanConstituentRelationship { .. }
        )));

        let err = ensure_relationship_invariants(
            &relationships,
            &ExtractedReferences::default(),
            &index,
        )
        .expect_err("duplicates should fail");
        assert_eq!(err.code, "relationship_duplicate");
    }

    #[test]
    fn missing_collection_relationship_is_reported() {
        let mut item = Item::new(ItemType::Sample, "s");
        item.collections.push(CollectionReference::new("c1"));
        let tokens = extract_references(&item);

        let violations = relationship_invariant_violations(&[], &tokens, &known_index(&[]));
        assert_eq!(
            violations,
            vec![RelationshipInvariantViolation::MissingCollectionRelationship {
                target: TargetIdentifier::ImmutableId("c1".to_string()),
            }]
        );
    }

    #[test]
    fn dangling_manual_reference_does_not_block() {
        let manual = Relationship::new(
            RelationType::Sibling,
            EntityType::Samples,
            TargetIdentifier::ItemId("gone".to_string()),
        );
        let index = known_index(&[]);
        let violations = relationship_invariant_violations(
            std::slice::from_ref(&manual),
            &ExtractedReferences::default(),
            &index,
        );
        assert!(matches!(
            violations.as_slice(),
            [RelationshipInvariantViolation::DanglingReference { .. }]
        ));
        ensure_relationship_invariants(&[manual], &ExtractedReferences::default(), &index)
            .expect("dangling manual edges are tolerated");
    }
}
