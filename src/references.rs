//! Pure extraction of the references an item makes to other entities.
//!
//! Three independent sources are read: composition lists, the inlined `collections`
//! field, and cross-reference markup embedded in free text. Nothing here touches the store.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{
    CollectionReference, CompositionList, Constituent, EntityType, Item, TargetIdentifier,
};

static TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<[A-Za-z][A-Za-z0-9-]*(?:\s[^>]*)?>").expect("tag pattern is valid")
});

static ATTRIBUTE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([A-Za-z_:][-A-Za-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
        .expect("attribute pattern is valid")
});

const MENTION_ID_ATTRIBUTE: &str = "data-item-id";
const MENTION_TYPE_ATTRIBUTE: &str = "data-type";

/// What the extractor needs to know about an item.
pub trait RelationshipSource {
    fn own_identifiers(&self) -> Vec<TargetIdentifier>;
    fn composition_lists(&self) -> Vec<(CompositionList, &[Constituent])>;
    fn collection_references(&self) -> &[CollectionReference];
    fn free_text(&self) -> Vec<&str>;
}

impl RelationshipSource for Item {
    fn own_identifiers(&self) -> Vec<TargetIdentifier> {
        self.identifiers()
    }

    fn composition_lists(&self) -> Vec<(CompositionList, &[Constituent])> {
        self.item_type
            .composition_lists()
            .iter()
            .map(|list| (*list, self.composition(*list)))
            .collect()
    }

    fn collection_references(&self) -> &[CollectionReference] {
        &self.collections
    }

    fn free_text(&self) -> Vec<&str> {
        self.description
            .as_deref()
            .into_iter()
            .chain(
                self.blocks_obj
                    .values()
                    .filter_map(|block| block.freeform_comment.as_deref()),
            )
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositionToken {
    pub identifier: TargetIdentifier,
    pub target_type: Option<EntityType>,
    pub list: CompositionList,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionToken {
    pub immutable_id: String,
}

impl CollectionToken {
    pub fn identifier(&self) -> TargetIdentifier {
        TargetIdentifier::ImmutableId(self.immutable_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MentionToken {
    pub identifier: TargetIdentifier,
    pub target_type: EntityType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedReferences {
    pub composition: Vec<CompositionToken>,
    pub collections: Vec<CollectionToken>,
    pub mentions: Vec<MentionToken>,
}

impl ExtractedReferences {
    pub fn is_empty(&self) -> bool {
        self.composition.is_empty() && self.collections.is_empty() && self.mentions.is_empty()
    }
}

pub fn extract_references<S: RelationshipSource + ?Sized>(source: &S) -> ExtractedReferences {
    let own = source.own_identifiers();
    ExtractedReferences {
        composition: extract_composition_references(&source.composition_lists()),
        collections: extract_collection_references(source.collection_references()),
        mentions: extract_mention_references(&source.free_text(), &own),
    }
}

pub fn extract_composition_references(
    lists: &[(CompositionList, &[Constituent])],
) -> Vec<CompositionToken> {
    let mut tokens: Vec<CompositionToken> = Vec::new();
    for (list, constituents) in lists {
        for entry in constituents.iter().filter_map(Constituent::entry_reference) {
            let identifier = entry.identifier();
            if tokens.iter().any(|token| token.identifier == identifier) {
                continue;
            }
            tokens.push(CompositionToken {
                identifier,
                target_type: entry.item_type.map(EntityType::from),
                list: *list,
            });
        }
    }
    tokens
}

pub fn extract_collection_references(collections: &[CollectionReference]) -> Vec<CollectionToken> {
    let mut tokens: Vec<CollectionToken> = Vec::with_capacity(collections.len());
    for collection in collections {
        if tokens
            .iter()
            .any(|token| token.immutable_id == collection.immutable_id)
        {
            continue;
        }
        tokens.push(CollectionToken {
            immutable_id: collection.immutable_id.clone(),
        });
    }
    tokens
}

pub fn extract_mention_references(
    texts: &[&str],
    own_identifiers: &[TargetIdentifier],
) -> Vec<MentionToken> {
    let mut tokens: Vec<MentionToken> = Vec::new();
    for text in texts {
        for (item_id, target_type) in mentions_in_text(text) {
            let identifier = TargetIdentifier::ItemId(item_id);
            if own_identifiers.contains(&identifier)
                || tokens.iter().any(|token| token.identifier == identifier)
            {
                continue;
            }
            tokens.push(MentionToken {
                identifier,
                target_type,
            });
        }
    }
    tokens
}

/// Every `(item_id, type)` pair carried by cross-reference tags in `text`, in document order.
pub fn mentions_in_text(text: &str) -> Vec<(String, EntityType)> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let mut found = Vec::new();
    for tag in TAG_RE.find_iter(text) {
        let attributes: HashMap<String, &str> = ATTRIBUTE_RE
            .captures_iter(tag.as_str())
            .filter_map(|captures| {
                let name = captures.get(1)?.as_str().to_ascii_lowercase();
                let value = captures.get(2).or_else(|| captures.get(3))?.as_str();
                Some((name, value))
            })
            .collect();

        let Some(item_id) = attributes
            .get(MENTION_ID_ATTRIBUTE)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
        else {
            continue;
        };
        let Some(raw_type) = attributes.get(MENTION_TYPE_ATTRIBUTE) else {
            continue;
        };
        match raw_type.trim().parse::<EntityType>() {
            Ok(EntityType::Collections) | Err(_) => {
                tracing::debug!(item_id, raw_type, "skipping cross-reference with unusable type");
            }
            Ok(target_type) => found.push((item_id.to_string(), target_type)),
        }
    }
    found
}

/// Rewrites cross-reference tags pointing at `from` so they point at `to`.
/// Returns `None` when `text` holds no such tag.
pub fn rename_mentions_in_text(text: &str, from: &str, to: &str) -> Option<String> {
    let mut ranges = Vec::new();
    for tag in TAG_RE.find_iter(text) {
        for captures in ATTRIBUTE_RE.captures_iter(tag.as_str()) {
            let Some(name) = captures.get(1) else {
                continue;
            };
            if !name.as_str().eq_ignore_ascii_case(MENTION_ID_ATTRIBUTE) {
                continue;
            }
            let Some(value) = captures.get(2).or_else(|| captures.get(3)) else {
                continue;
            };
            if value.as_str().trim() == from {
                ranges.push((tag.start() + value.start(), tag.start() + value.end()));
            }
        }
    }
    if ranges.is_empty() {
        return None;
    }

    let mut renamed = String::with_capacity(text.len());
    let mut cursor = 0;
    for (start, end) in ranges {
        renamed.push_str(&text[cursor..start]);
        renamed.push_str(to);
        cursor = end;
    }
    renamed.push_str(&text[cursor..]);
    Some(renamed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Block, CollectionReference, Constituent, EntryReference, ItemType};

    fn mention(item_id: &str, kind: &str) -> String {
        format!(r#"<span class="mention" data-item-id="{item_id}" data-type="{kind}">{item_id}</span>"#)
    }

    #[test]
    fn markup_detection_ignores_attribute_order() {
        let text = concat!(
            r#"<p>made from <span data-type='samples' data-item-id='abc'>abc</span> and "#,
            r#"<span DATA-ITEM-ID="xyz" class="x" data-type="starting_materials">xyz</span></p>"#
        );
        assert_eq!(
            mentions_in_text(text),
            vec![
                ("abc".to_string(), EntityType::Samples),
                ("xyz".to_string(), EntityType::StartingMaterials),
            ]
        );
    }

    #[test]
    fn empty_or_plain_text_yields_nothing() {
        assert!(mentions_in_text("").is_empty());
        assert!(mentions_in_text("   ").is_empty());
        assert!(mentions_in_text("<p>no references here</p>").is_empty());
        assert!(mentions_in_text(r#"<span data-item-id="abc">missing type</span>"#).is_empty());
    }

    #[test]
    fn repeated_mentions_collapse_to_one_token() {
        let mut item = Item::new(ItemType::Sample, "me");
        item.description = Some(format!(
            "{} then again {}",
            mention("target", "samples"),
            mention("target", "samples")
        ));
        item.blocks_obj.insert(
            "b1".to_string(),
            Block {
                freeform_comment: Some(mention("target", "samples")),
                ..Block::default()
            },
        );

        let extracted = extract_references(&item);
        assert_eq!(extracted.mentions.len(), 1);
        assert_eq!(
            extracted.mentions[0].identifier,
            TargetIdentifier::ItemId("target".to_string())
        );
    }

    #[test]
    fn self_mentions_are_excluded() {
        let mut item = Item::new(ItemType::Sample, "me");
        item.description = Some(format!("{} {}", mention("me", "samples"), mention("you", "cells")));

        let extracted = extract_references(&item);
        assert_eq!(extracted.mentions.len(), 1);
        assert_eq!(extracted.mentions[0].target_type, EntityType::Cells);
    }

    #[test]
    fn composition_tokens_prefer_refcode_and_skip_inline() {
        let mut item = Item::new(ItemType::Cell, "cell-1");
        item.positive_electrode.push(Constituent::entry(
            EntryReference::item_id("cathode").with_refcode("lab:aaaaaa"),
            Some(1.0),
        ));
        item.electrolyte
            .push(Constituent::inline("LiPF6 in EC/DMC", None));
        item.negative_electrode.push(Constituent::entry(
            EntryReference::item_id("anode").with_type(ItemType::Sample),
            None,
        ));

        let extracted = extract_references(&item);
        assert_eq!(
            extracted.composition,
            vec![
                CompositionToken {
                    identifier: TargetIdentifier::Refcode("lab:aaaaaa".to_string()),
                    target_type: None,
                    list: CompositionList::PositiveElectrode,
                },
                CompositionToken {
                    identifier: TargetIdentifier::ItemId("anode".to_string()),
                    target_type: Some(EntityType::Samples),
                    list: CompositionList::NegativeElectrode,
                },
            ]
        );
    }

    #[test]
    fn collection_tokens_are_deduplicated() {
        let mut item = Item::new(ItemType::Sample, "s");
        item.collections.push(CollectionReference::new("c1"));
        item.collections.push(CollectionReference::new("c1"));
        item.collections.push(CollectionReference::new("c2"));

        let extracted = extract_references(&item);
        assert_eq!(extracted.collections.len(), 2);
        assert!(extracted.composition.is_empty());
        assert!(extracted.mentions.is_empty());
    }

    #[test]
    fn renaming_rewrites_only_matching_markup() {
        let text = format!(
            "{} and <span data-type='samples' DATA-ITEM-ID='old'>old</span> beside {}",
            mention("old", "samples"),
            mention("older", "samples")
        );
        let renamed = rename_mentions_in_text(&text, "old", "new").expect("markup present");

        let ids: Vec<String> = mentions_in_text(&renamed).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["new", "new", "older"]);
        assert!(renamed.contains(">old</span>"));
        assert_eq!(rename_mentions_in_text("plain text about old", "old", "new"), None);
    }
}
