//! Rewrites of other items' documents forced by a change to one item.
//!
//! Each affected referrer is a separate single-document write; there is no cross-document
//! transaction. Every rewrite is a no-op on an already-clean referrer, so an interrupted run
//! can simply be repeated.

use anyhow::anyhow;
use chrono::Utc;
use serde_json::{Value, json};

use crate::error::{LibError, Result};
use crate::models::{
    CompositionList, ConstituentItem, EntityType, InlineSubstance, Item, TargetIdentifier,
};
use crate::references::rename_mentions_in_text;
use crate::store::{DocFilter, DocPatch, DocumentStore, Namespace};

/// Matches every item whose relationships or composition lists mention any of `identifiers`.
pub fn referrer_filter(identifiers: &[TargetIdentifier]) -> DocFilter {
    let mut clauses = Vec::with_capacity(identifiers.len() * (1 + CompositionList::ALL.len()));
    for identifier in identifiers {
        let mut pattern = serde_json::Map::new();
        pattern.insert(
            identifier.field_name().to_string(),
            json!(identifier.value()),
        );
        let pattern = Value::Object(pattern);

        clauses.push(DocFilter::array_contains("relationships", pattern.clone()));
        for list in CompositionList::ALL {
            clauses.push(DocFilter::array_contains(
                list.field_name(),
                json!({ "item": pattern.clone() }),
            ));
        }
    }
    DocFilter::Or(clauses)
}

/// Strips every reference to `doomed` from `referrer`, snapshotting constituents inline.
/// Returns whether anything changed.
pub fn detach_references(referrer: &mut Item, doomed: &Item) -> bool {
    let before = referrer.relationships.len();
    referrer.relationships.retain(|relationship| {
        relationship.target_type == EntityType::Collections
            || !doomed.is_addressed_by(&relationship.target)
    });
    let mut changed = referrer.relationships.len() != before;

    let snapshot = InlineSubstance {
        name: doomed
            .name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| doomed.item_id.clone()),
        chemform: doomed.chemform.clone(),
    };
    for list in CompositionList::ALL {
        for constituent in referrer.composition_mut(list).iter_mut() {
            let points_at_doomed = constituent.entry_reference().is_some_and(|entry| {
                entry
                    .identifiers()
                    .iter()
                    .any(|identifier| doomed.is_addressed_by(identifier))
            });
            if points_at_doomed {
                constituent.item = ConstituentItem::Inline(snapshot.clone());
                changed = true;
            }
        }
    }

    changed
}

/// Points every `item_id`-based reference to `from` at `to` instead, including mention markup.
/// Returns whether anything changed.
pub fn rename_references(referrer: &mut Item, from: &str, to: &str) -> bool {
    let mut changed = false;
    for relationship in &mut referrer.relationships {
        if relationship.target_type != EntityType::Collections
            && relationship.target == TargetIdentifier::ItemId(from.to_string())
        {
            relationship.target = TargetIdentifier::ItemId(to.to_string());
            changed = true;
        }
    }
    for list in CompositionList::ALL {
        for constituent in referrer.composition_mut(list).iter_mut() {
            if let ConstituentItem::Entry(entry) = &mut constituent.item {
                changed |= entry.replace_item_id(from, to);
            }
        }
    }

    let texts = referrer.description.iter_mut().chain(
        referrer
            .blocks_obj
            .values_mut()
            .filter_map(|block| block.freeform_comment.as_mut()),
    );
    for text in texts {
        if let Some(renamed) = rename_mentions_in_text(text, from, to) {
            *text = renamed;
            changed = true;
        }
    }
    changed
}

/// Patch persisting the fields cross-item rewrites may touch.
pub fn referrer_patch(item: &Item) -> Result<DocPatch> {
    let encode = |value: std::result::Result<Value, serde_json::Error>| {
        value.map_err(|err| LibError::unknown("Item could not be serialized", anyhow!(err)))
    };

    let mut patch = DocPatch::new()
        .set("relationships", encode(serde_json::to_value(&item.relationships))?)
        .set("description", json!(item.description))
        .set("blocks_obj", encode(serde_json::to_value(&item.blocks_obj))?)
        .set("last_modified", json!(Utc::now()));
    for list in CompositionList::ALL {
        let constituents = item.composition(list);
        if item.item_type.composition_lists().contains(&list) || !constituents.is_empty() {
            patch.insert(list.field_name(), encode(serde_json::to_value(constituents))?);
        }
    }
    Ok(patch)
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

async fn rewrite_referrers<S, F>(
    store: &S,
    subject: &Item,
    identifiers: &[TargetIdentifier],
    failure: &'static str,
    mut rewrite: F,
) -> Result<usize>
where
    S: DocumentStore,
    F: FnMut(&mut Item) -> bool,
{
    let documents = store
        .find(Namespace::Items, &referrer_filter(identifiers))
        .await
        .map_err(|err| LibError::cascade(failure, err.source))?;

    let mut rewritten = 0usize;
    for document in documents {
        let mut referrer = Item::from_document(document)
            .map_err(|err| LibError::cascade(failure, err.source))?;
        if referrer.immutable_id.is_some() && referrer.immutable_id == subject.immutable_id {
            continue;
        }
        if !rewrite(&mut referrer) {
            continue;
        }

        let filter = immutable_filter(&referrer)?;
        let patch = referrer_patch(&referrer)?;
        let ack = store
            .update_one(Namespace::Items, &filter, &patch)
            .await
            .map_err(|err| {
                LibError::cascade(
                    failure,
                    err.source.context(format!(
                        "rewriting referrer {} after {} earlier rewrites",
                        referrer.item_id, rewritten
                    )),
                )
            })?;
        if ack.matched == 0 {
            tracing::warn!(referrer = %referrer.item_id, "referrer disappeared during rewrite");
            continue;
        }
        rewritten += 1;
    }

    Ok(rewritten)
}

/// Cleans every referrer of `doomed`. Must complete before `doomed` is removed.
pub async fn cascade_delete<S: DocumentStore>(store: &S, doomed: &Item) -> Result<usize> {
    let cleaned = rewrite_referrers(
        store,
        doomed,
        &doomed.identifiers(),
        "Failed to remove references to the deleted item",
        |referrer| detach_references(referrer, doomed),
    )
    .await?;

    tracing::info!(item_id = %doomed.item_id, cleaned, "cascade cleanup complete");
    Ok(cleaned)
}

/// Rewrites `item_id` references from `from` to `to` across all referrers.
pub async fn propagate_item_id_change<S: DocumentStore>(
    store: &S,
    subject: &Item,
    from: &str,
    to: &str,
) -> Result<usize> {
    let renamed = rewrite_referrers(
        store,
        subject,
        &[TargetIdentifier::ItemId(from.to_string())],
        "Failed to update references to the renamed item",
        |referrer| rename_references(referrer, from, to),
    )
    .await?;

    tracing::info!(from, to, renamed, "item id change propagated");
    Ok(renamed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Block, CONSTITUENT_DESCRIPTION, Constituent, EntryReference, ItemType, RelationType,
        Relationship,
    };
    use crate::references::{RelationshipSource, mentions_in_text};
    use crate::store::MemoryStore;

    fn doomed() -> Item {
        let mut item = Item::new(ItemType::StartingMaterial, "nacl");
        item.immutable_id = Some("imm-nacl".to_string());
        item.refcode = Some("lab:nacl01".to_string());
        item.name = Some("Sodium chloride".to_string());
        item.chemform = Some("NaCl".to_string());
        item
    }

    fn referrer() -> Item {
        let mut item = Item::new(ItemType::Sample, "brine");
        item.immutable_id = Some("imm-brine".to_string());
        item.synthesis_constituents = vec![
            Constituent::inline("water", Some("H2O".to_string())),
            Constituent::entry(
                EntryReference::item_id("nacl").with_type(ItemType::StartingMaterial),
                Some(5.0),
            ),
        ];
        item.relationships = vec![
            Relationship::new(
                RelationType::Parent,
                EntityType::StartingMaterials,
                TargetIdentifier::ItemId("nacl".to_string()),
            )
            .with_description(CONSTITUENT_DESCRIPTION),
            Relationship::new(
                RelationType::Mentioned,
                EntityType::StartingMaterials,
                TargetIdentifier::Refcode("lab:nacl01".to_string()),
            ),
            Relationship::new(
                RelationType::Sibling,
                EntityType::Samples,
                TargetIdentifier::ItemId("seawater".to_string()),
            ),
        ];
        item
    }

    #[test]
    fn detach_snapshots_constituent_in_place() {
        let doomed = doomed();
        let mut item = referrer();

        assert!(detach_references(&mut item, &doomed));
        assert_eq!(item.synthesis_constituents.len(), 2);
        assert_eq!(
            item.synthesis_constituents[1].item,
            ConstituentItem::Inline(InlineSubstance {
                name: "Sodium chloride".to_string(),
                chemform: Some("NaCl".to_string()),
            })
        );
        assert_eq!(item.synthesis_constituents[1].quantity, Some(5.0));
        assert_eq!(item.relationships.len(), 1);
        assert_eq!(item.relationships[0].relation, RelationType::Sibling);

        assert!(!detach_references(&mut item, &doomed), "second pass is a no-op");
    }

    #[test]
    fn snapshot_serializes_without_identifier_fields() {
        let doomed = doomed();
        let mut item = referrer();
        detach_references(&mut item, &doomed);

        let document = item.to_document().expect("serialize");
        let snapshot = &document["synthesis_constituents"][1]["item"];
        for field in ["item_id", "refcode", "immutable_id", "type"] {
            assert!(snapshot.get(field).is_none(), "{field} should be stripped");
        }
        assert_eq!(snapshot["name"], json!("Sodium chloride"));
    }

    #[test]
    fn rename_rewrites_item_id_references_only() {
        let mut item = referrer();
        assert!(rename_references(&mut item, "nacl", "sodium-chloride"));
        assert_eq!(
            item.relationships[0].target,
            TargetIdentifier::ItemId("sodium-chloride".to_string())
        );
        assert_eq!(
            item.relationships[1].target,
            TargetIdentifier::Refcode("lab:nacl01".to_string())
        );
        let entry = item.synthesis_constituents[1]
            .entry_reference()
            .expect("still an entry");
        assert_eq!(entry.item_id_value(), Some("sodium-chloride"));
    }

    #[test]
    fn rename_rewrites_mention_markup() {
        let mut item = referrer();
        item.description = Some(
            r#"dissolved <span data-item-id="nacl" data-type="starting_materials">salt</span>"#
                .to_string(),
        );
        item.blocks_obj.insert(
            "b1".to_string(),
            Block {
                freeform_comment: Some(
                    r#"<a data-type='starting_materials' data-item-id='nacl'>x</a>"#.to_string(),
                ),
                extra: serde_json::Map::new(),
            },
        );

        assert!(rename_references(&mut item, "nacl", "sodium-chloride"));

        let texts: Vec<&str> = item.free_text();
        let mentioned: Vec<String> = texts
            .iter()
            .flat_map(|text| mentions_in_text(text))
            .map(|(item_id, _)| item_id)
            .collect();
        assert_eq!(mentioned, vec!["sodium-chloride", "sodium-chloride"]);

        let patch = referrer_patch(&item).expect("patch");
        let comment = &patch.fields()["blocks_obj"]["b1"]["freeform_comment"];
        assert!(comment.as_str().is_some_and(|text| text.contains("'sodium-chloride'")));
        assert!(patch.fields()["description"].to_string().contains("sodium-chloride"));
    }

    #[tokio::test]
    async fn cascade_rewrites_only_referrers() {
        let store = MemoryStore::new();
        let doomed = doomed();
        store
            .insert_one(Namespace::Items, doomed.to_document().expect("serialize"))
            .await
            .expect("insert");
        store
            .insert_one(Namespace::Items, referrer().to_document().expect("serialize"))
            .await
            .expect("insert");
        let mut bystander = Item::new(ItemType::Sample, "bystander");
        bystander.immutable_id = Some("imm-bystander".to_string());
        store
            .insert_one(Namespace::Items, bystander.to_document().expect("serialize"))
            .await
            .expect("insert");

        let cleaned = cascade_delete(&store, &doomed).await.expect("cascade");
        assert_eq!(cleaned, 1);

        let again = cascade_delete(&store, &doomed).await.expect("cascade");
        assert_eq!(again, 0, "cleanup is idempotent");

        let stored = store
            .find_one(Namespace::Items, &DocFilter::field_eq("item_id", "brine"))
            .await
            .expect("find")
            .expect("referrer exists");
        let stored = Item::from_document(stored).expect("parse");
        assert!(stored.relationships.iter().all(|rel| !doomed.is_addressed_by(&rel.target)));
        assert!(stored.last_modified.is_some());
    }
}
