use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{LibError, Result};

/// Description attached to relationships generated from composition lists.
pub const CONSTITUENT_DESCRIPTION: &str = "Is a constituent of";

pub const DEFAULT_UNIT: &str = "g";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ItemType {
    #[serde(rename = "samples")]
    Sample,
    #[serde(rename = "starting_materials")]
    StartingMaterial,
    #[serde(rename = "cells")]
    Cell,
    #[serde(rename = "equipment")]
    Equipment,
}

impl ItemType {
    pub const ALL: [ItemType; 4] = [
        ItemType::Sample,
        ItemType::StartingMaterial,
        ItemType::Cell,
        ItemType::Equipment,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            ItemType::Sample => "samples",
            ItemType::StartingMaterial => "starting_materials",
            ItemType::Cell => "cells",
            ItemType::Equipment => "equipment",
        }
    }

    /// Composition lists each item kind may carry.
    pub const fn composition_lists(self) -> &'static [CompositionList] {
        match self {
            ItemType::Sample | ItemType::StartingMaterial => {
                &[CompositionList::SynthesisConstituents]
            }
            ItemType::Cell => &[
                CompositionList::PositiveElectrode,
                CompositionList::NegativeElectrode,
                CompositionList::Electrolyte,
            ],
            ItemType::Equipment => &[],
        }
    }
}

impl FromStr for ItemType {
    type Err = LibError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ItemType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| LibError::invalid("Unknown item type", anyhow!("unknown item type {s}")))
    }
}

/// Kind of entity a relationship points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Samples,
    StartingMaterials,
    Cells,
    Equipment,
    Collections,
}

impl EntityType {
    pub const fn as_str(self) -> &'static str {
        match self {
            EntityType::Samples => "samples",
            EntityType::StartingMaterials => "starting_materials",
            EntityType::Cells => "cells",
            EntityType::Equipment => "equipment",
            EntityType::Collections => "collections",
        }
    }

    pub const fn item_type(self) -> Option<ItemType> {
        match self {
            EntityType::Samples => Some(ItemType::Sample),
            EntityType::StartingMaterials => Some(ItemType::StartingMaterial),
            EntityType::Cells => Some(ItemType::Cell),
            EntityType::Equipment => Some(ItemType::Equipment),
            EntityType::Collections => None,
        }
    }
}

impl From<ItemType> for EntityType {
    fn from(value: ItemType) -> Self {
        match value {
            ItemType::Sample => EntityType::Samples,
            ItemType::StartingMaterial => EntityType::StartingMaterials,
            ItemType::Cell => EntityType::Cells,
            ItemType::Equipment => EntityType::Equipment,
        }
    }
}

impl FromStr for EntityType {
    type Err = LibError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s == "collections" {
            return Ok(EntityType::Collections);
        }
        ItemType::from_str(s).map(EntityType::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositionList {
    SynthesisConstituents,
    PositiveElectrode,
    NegativeElectrode,
    Electrolyte,
}

impl CompositionList {
    pub const ALL: [CompositionList; 4] = [
        CompositionList::SynthesisConstituents,
        CompositionList::PositiveElectrode,
        CompositionList::NegativeElectrode,
        CompositionList::Electrolyte,
    ];

    pub const fn field_name(self) -> &'static str {
        match self {
            CompositionList::SynthesisConstituents => "synthesis_constituents",
            CompositionList::PositiveElectrode => "positive_electrode",
            CompositionList::NegativeElectrode => "negative_electrode",
            CompositionList::Electrolyte => "electrolyte",
        }
    }

    /// Relation recorded on the owning item for an entry in this list.
    pub const fn relation(self) -> RelationType {
        match self {
            CompositionList::SynthesisConstituents => RelationType::Parent,
            CompositionList::PositiveElectrode
            | CompositionList::NegativeElectrode
            | CompositionList::Electrolyte => RelationType::IsPartOf,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    Parent,
    Child,
    Sibling,
    IsPartOf,
    Mentioned,
    Other,
}

impl RelationType {
    pub const fn as_str(self) -> &'static str {
        match self {
            RelationType::Parent => "parent",
            RelationType::Child => "child",
            RelationType::Sibling => "sibling",
            RelationType::IsPartOf => "is_part_of",
            RelationType::Mentioned => "mentioned",
            RelationType::Other => "other",
        }
    }
}

/// One of the three ways a document can be addressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetIdentifier {
    ImmutableId(String),
    ItemId(String),
    Refcode(String),
}

impl TargetIdentifier {
    pub const fn field_name(&self) -> &'static str {
        match self {
            TargetIdentifier::ImmutableId(_) => "immutable_id",
            TargetIdentifier::ItemId(_) => "item_id",
            TargetIdentifier::Refcode(_) => "refcode",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            TargetIdentifier::ImmutableId(value)
            | TargetIdentifier::ItemId(value)
            | TargetIdentifier::Refcode(value) => value,
        }
    }
}

impl fmt::Display for TargetIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.field_name(), self.value())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct UserId(pub Uuid);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::from_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct GroupId(pub Uuid);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GroupId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::from_str(s).map(Self)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRelationship", into = "RawRelationship")]
pub struct Relationship {
    pub relation: RelationType,
    pub target_type: EntityType,
    pub target: TargetIdentifier,
    pub description: Option<String>,
    /// Keys this crate does not interpret; written back unchanged.
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawRelationship {
    relation: RelationType,
    #[serde(rename = "type")]
    target_type: EntityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    immutable_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl TryFrom<RawRelationship> for Relationship {
    type Error = LibError;

    fn try_from(raw: RawRelationship) -> Result<Self> {
        let mut identifiers = [
            non_empty(raw.immutable_id).map(TargetIdentifier::ImmutableId),
            non_empty(raw.item_id).map(TargetIdentifier::ItemId),
            non_empty(raw.refcode).map(TargetIdentifier::Refcode),
        ]
        .into_iter()
        .flatten();

        let Some(target) = identifiers.next() else {
            return Err(LibError::invalid_with_code(
                "relationship_missing_identifier",
                "Relationship must name its target",
                anyhow!("relationship has none of immutable_id, item_id, refcode"),
            ));
        };
        if let Some(second) = identifiers.next() {
            return Err(LibError::invalid_with_code(
                "relationship_ambiguous_identifier",
                "Relationship must use exactly one identifier",
                anyhow!("relationship names both {target} and {second}"),
            ));
        }

        let relationship = Relationship {
            relation: raw.relation,
            target_type: raw.target_type,
            target,
            description: raw.description,
            extra: raw.extra,
        };
        relationship.validate()?;
        Ok(relationship)
    }
}

impl From<Relationship> for RawRelationship {
    fn from(value: Relationship) -> Self {
        let (immutable_id, item_id, refcode) = match value.target {
            TargetIdentifier::ImmutableId(id) => (Some(id), None, None),
            TargetIdentifier::ItemId(id) => (None, Some(id), None),
            TargetIdentifier::Refcode(id) => (None, None, Some(id)),
        };
        RawRelationship {
            relation: value.relation,
            target_type: value.target_type,
            immutable_id,
            item_id,
            refcode,
            description: value.description,
            extra: value.extra,
        }
    }
}

impl Relationship {
    pub fn new(relation: RelationType, target_type: EntityType, target: TargetIdentifier) -> Self {
        Self {
            relation,
            target_type,
            target,
            description: None,
            extra: Map::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.target.value().trim().is_empty() {
            return Err(LibError::invalid_with_code(
                "relationship_missing_identifier",
                "Relationship must name its target",
                anyhow!("relationship identifier {} is empty", self.target.field_name()),
            ));
        }
        let described = self
            .description
            .as_deref()
            .is_some_and(|description| !description.trim().is_empty());
        if self.relation == RelationType::Other && !described {
            return Err(LibError::invalid_with_code(
                "relationship_missing_description",
                "Relationships of type 'other' require a description",
                anyhow!("relation=other without description targeting {}", self.target),
            ));
        }
        Ok(())
    }

    pub fn is_constituent_link(&self) -> bool {
        matches!(self.relation, RelationType::Parent | RelationType::IsPartOf)
            && self.target_type != EntityType::Collections
            && self.description.as_deref() == Some(CONSTITUENT_DESCRIPTION)
    }
}

/// Pointer from a constituent to a live item. Always carries at least one identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryReference {
    immutable_id: Option<String>,
    item_id: Option<String>,
    refcode: Option<String>,
    pub item_type: Option<ItemType>,
    pub name: Option<String>,
    pub chemform: Option<String>,
    pub extra: Map<String, Value>,
}

impl EntryReference {
    pub fn new(identifier: TargetIdentifier) -> Self {
        let mut entry = Self {
            immutable_id: None,
            item_id: None,
            refcode: None,
            item_type: None,
            name: None,
            chemform: None,
            extra: Map::new(),
        };
        match identifier {
            TargetIdentifier::ImmutableId(id) => entry.immutable_id = Some(id),
            TargetIdentifier::ItemId(id) => entry.item_id = Some(id),
            TargetIdentifier::Refcode(id) => entry.refcode = Some(id),
        }
        entry
    }

    pub fn item_id(item_id: impl Into<String>) -> Self {
        Self::new(TargetIdentifier::ItemId(item_id.into()))
    }

    pub fn with_refcode(mut self, refcode: impl Into<String>) -> Self {
        self.refcode = Some(refcode.into());
        self
    }

    pub fn with_type(mut self, item_type: ItemType) -> Self {
        self.item_type = Some(item_type);
        self
    }

    pub fn immutable_id_value(&self) -> Option<&str> {
        self.immutable_id.as_deref()
    }

    pub fn item_id_value(&self) -> Option<&str> {
        self.item_id.as_deref()
    }

    pub fn refcode_value(&self) -> Option<&str> {
        self.refcode.as_deref()
    }

    /// Identifier used for relationships: refcode, then item_id, then immutable_id.
    pub fn identifier(&self) -> TargetIdentifier {
        if let Some(refcode) = &self.refcode {
            TargetIdentifier::Refcode(refcode.clone())
        } else if let Some(item_id) = &self.item_id {
            TargetIdentifier::ItemId(item_id.clone())
        } else if let Some(immutable_id) = &self.immutable_id {
            TargetIdentifier::ImmutableId(immutable_id.clone())
        } else {
            unreachable!("entry references are constructed with an identifier")
        }
    }

    pub fn identifiers(&self) -> Vec<TargetIdentifier> {
        let mut identifiers = Vec::with_capacity(3);
        if let Some(id) = &self.immutable_id {
            identifiers.push(TargetIdentifier::ImmutableId(id.clone()));
        }
        if let Some(id) = &self.item_id {
            identifiers.push(TargetIdentifier::ItemId(id.clone()));
        }
        if let Some(id) = &self.refcode {
            identifiers.push(TargetIdentifier::Refcode(id.clone()));
        }
        identifiers
    }

    /// Rewrites a stored item_id; returns whether anything changed.
    pub fn replace_item_id(&mut self, from: &str, to: &str) -> bool {
        if self.item_id.as_deref() == Some(from) {
            self.item_id = Some(to.to_string());
            true
        } else {
            false
        }
    }
}

/// Unlinked substance description left behind once the referenced item is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineSubstance {
    pub name: String,
    pub chemform: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawConstituentItem", into = "RawConstituentItem")]
pub enum ConstituentItem {
    Entry(EntryReference),
    Inline(InlineSubstance),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawConstituentItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    immutable_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refcode: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    item_type: Option<ItemType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chemform: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl TryFrom<RawConstituentItem> for ConstituentItem {
    type Error = LibError;

    fn try_from(raw: RawConstituentItem) -> Result<Self> {
        let immutable_id = non_empty(raw.immutable_id);
        let item_id = non_empty(raw.item_id);
        let refcode = non_empty(raw.refcode);

        if immutable_id.is_none() && item_id.is_none() && refcode.is_none() {
            let Some(name) = non_empty(raw.name) else {
                return Err(LibError::invalid_with_code(
                    "constituent_missing_name",
                    "Inline constituents require a name",
                    anyhow!("constituent has neither an identifier nor a name"),
                ));
            };
            return Ok(ConstituentItem::Inline(InlineSubstance {
                name,
                chemform: raw.chemform,
            }));
        }

        Ok(ConstituentItem::Entry(EntryReference {
            immutable_id,
            item_id,
            refcode,
            item_type: raw.item_type,
            name: raw.name,
            chemform: raw.chemform,
            extra: raw.extra,
        }))
    }
}

impl From<ConstituentItem> for RawConstituentItem {
    fn from(value: ConstituentItem) -> Self {
        match value {
            ConstituentItem::Entry(entry) => RawConstituentItem {
                immutable_id: entry.immutable_id,
                item_id: entry.item_id,
                refcode: entry.refcode,
                item_type: entry.item_type,
                name: entry.name,
                chemform: entry.chemform,
                extra: entry.extra,
            },
            ConstituentItem::Inline(inline) => RawConstituentItem {
                name: Some(inline.name),
                chemform: inline.chemform,
                ..RawConstituentItem::default()
            },
        }
    }
}

fn default_unit() -> String {
    DEFAULT_UNIT.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constituent {
    pub item: ConstituentItem,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default = "default_unit")]
    pub unit: String,
}

impl Constituent {
    pub fn entry(entry: EntryReference, quantity: Option<f64>) -> Self {
        Self {
            item: ConstituentItem::Entry(entry),
            quantity,
            unit: default_unit(),
        }
    }

    pub fn inline(name: impl Into<String>, chemform: Option<String>) -> Self {
        Self {
            item: ConstituentItem::Inline(InlineSubstance {
                name: name.into(),
                chemform,
            }),
            quantity: None,
            unit: default_unit(),
        }
    }

    pub fn entry_reference(&self) -> Option<&EntryReference> {
        match &self.item {
            ConstituentItem::Entry(entry) => Some(entry),
            ConstituentItem::Inline(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Block {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freeform_comment: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionReference {
    pub immutable_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CollectionReference {
    pub fn new(immutable_id: impl Into<String>) -> Self {
        Self {
            immutable_id: immutable_id.into(),
            collection_id: None,
            title: None,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    #[serde(rename = "type")]
    pub item_type: ItemType,
    pub item_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub immutable_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chemform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    #[serde(default)]
    pub collections: Vec<CollectionReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub synthesis_constituents: Vec<Constituent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub positive_electrode: Vec<Constituent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub negative_electrode: Vec<Constituent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub electrolyte: Vec<Constituent>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub blocks_obj: BTreeMap<String, Block>,
    #[serde(default)]
    pub creator_ids: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_ids: Vec<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Item {
    pub fn new(item_type: ItemType, item_id: impl Into<String>) -> Self {
        Self {
            item_type,
            item_id: item_id.into(),
            immutable_id: None,
            refcode: None,
            name: None,
            chemform: None,
            description: None,
            relationships: Vec::new(),
            collections: Vec::new(),
            synthesis_constituents: Vec::new(),
            positive_electrode: Vec::new(),
            negative_electrode: Vec::new(),
            electrolyte: Vec::new(),
            blocks_obj: BTreeMap::new(),
            creator_ids: Vec::new(),
            group_ids: Vec::new(),
            last_modified: None,
            extra: Map::new(),
        }
    }

    pub fn from_document(document: Value) -> Result<Self> {
        Ok(serde_json::from_value(document)?)
    }

    pub fn to_document(&self) -> Result<Value> {
        serde_json::to_value(self)
            .map_err(|err| LibError::unknown("Item could not be serialized", anyhow!(err)))
    }

    pub fn composition(&self, list: CompositionList) -> &[Constituent] {
        match list {
            CompositionList::SynthesisConstituents => &self.synthesis_constituents,
            CompositionList::PositiveElectrode => &self.positive_electrode,
            CompositionList::NegativeElectrode => &self.negative_electrode,
            CompositionList::Electrolyte => &self.electrolyte,
        }
    }

    pub fn composition_mut(&mut self, list: CompositionList) -> &mut Vec<Constituent> {
        match list {
            CompositionList::SynthesisConstituents => &mut self.synthesis_constituents,
            CompositionList::PositiveElectrode => &mut self.positive_electrode,
            CompositionList::NegativeElectrode => &mut self.negative_electrode,
            CompositionList::Electrolyte => &mut self.electrolyte,
        }
    }

    /// Every identifier this item can be addressed by.
    pub fn identifiers(&self) -> Vec<TargetIdentifier> {
        let mut identifiers = vec![TargetIdentifier::ItemId(self.item_id.clone())];
        if let Some(immutable_id) = &self.immutable_id {
            identifiers.push(TargetIdentifier::ImmutableId(immutable_id.clone()));
        }
        if let Some(refcode) = &self.refcode {
            identifiers.push(TargetIdentifier::Refcode(refcode.clone()));
        }
        identifiers
    }

    pub fn is_addressed_by(&self, identifier: &TargetIdentifier) -> bool {
        match identifier {
            TargetIdentifier::ItemId(id) => self.item_id == *id,
            TargetIdentifier::ImmutableId(id) => self.immutable_id.as_deref() == Some(id),
            TargetIdentifier::Refcode(id) => self.refcode.as_deref() == Some(id),
        }
    }

    /// Field-level checks run before anything is synchronized or written.
    pub fn validate(&self) -> Result<()> {
        if self.item_id.trim().is_empty() {
            return Err(LibError::invalid(
                "Item ID is required",
                anyhow!("empty item_id"),
            ));
        }

        let allowed = self.item_type.composition_lists();
        for list in CompositionList::ALL {
            let constituents = self.composition(list);
            if !constituents.is_empty() && !allowed.contains(&list) {
                return Err(LibError::invalid_with_code(
                    "composition_not_allowed",
                    "Composition list is not valid for this item type",
                    anyhow!(
                        "{} is not a composition list of {}",
                        list.field_name(),
                        self.item_type.as_str()
                    ),
                ));
            }
            for constituent in constituents {
                let invalid = constituent
                    .quantity
                    .filter(|quantity| !quantity.is_finite() || *quantity < 0.0);
                if let Some(quantity) = invalid {
                    return Err(LibError::invalid_with_code(
                        "constituent_invalid_quantity",
                        "Constituent quantity must be a non-negative number",
                        anyhow!("quantity {quantity} in {}", list.field_name()),
                    ));
                }
            }
        }

        for relationship in &self.relationships {
            relationship.validate()?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDocument {
    pub collection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub immutable_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub creator_ids: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_ids: Vec<GroupId>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCollectionPayload {
    pub collection_id: String,
    pub title: Option<String>,
    #[serde(default)]
    pub group_ids: Vec<GroupId>,
}

/// Top-level fields to overwrite on an existing item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpdateItemPayload {
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceCategory {
    Composition,
    Collection,
    Mention,
}

/// A reference that was dropped because its target does not exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncWarning {
    pub category: ReferenceCategory,
    pub identifier: TargetIdentifier,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteOutcome {
    pub item: Item,
    pub warnings: Vec<SyncWarning>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    pub cleaned_referrers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    pub node_type: EntityType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refcode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub relation: RelationType,
}

impl GraphEdge {
    pub fn new(source: &str, target: &str, relation: RelationType) -> Self {
        Self {
            id: format!("{source}->{target}:{}", relation.as_str()),
            source: source.to_string(),
            target: target.to_string(),
            relation,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQuery {
    pub hide_collections: Option<bool>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn relationship_requires_exactly_one_identifier() {
        let err = serde_json::from_value::<Relationship>(json!({
            "relation": "parent",
            "type": "samples"
        }))
        .expect_err("missing identifier should fail");
        assert!(err.to_string().contains("Relationship must name its target"));

        let err = serde_json::from_value::<Relationship>(json!({
            "relation": "parent",
            "type": "samples",
            "item_id": "a",
            "refcode": "lab:abc"
        }))
        .expect_err("two identifiers should fail");
        assert!(err.to_string().contains("exactly one identifier"));
    }

    #[test]
    fn other_relationship_requires_description() {
        let err = serde_json::from_value::<Relationship>(json!({
            "relation": "other",
            "type": "samples",
            "item_id": "a"
        }))
        .expect_err("other without description should fail");
        assert!(err.to_string().contains("require a description"));

        let relationship: Relationship = serde_json::from_value(json!({
            "relation": "other",
            "type": "samples",
            "item_id": "a",
            "description": "measured alongside"
        }))
        .expect("described other relationship should parse");
        assert_eq!(relationship.target, TargetIdentifier::ItemId("a".to_string()));
    }

    #[test]
    fn relationship_keeps_unknown_keys() {
        let raw = json!({
            "relation": "sibling",
            "type": "cells",
            "refcode": "lab:xyz",
            "note": {"added_by": "hand"}
        });
        let relationship: Relationship =
            serde_json::from_value(raw.clone()).expect("relationship should parse");
        assert_eq!(
            serde_json::to_value(&relationship).expect("serialize"),
            raw
        );
    }

    #[test]
    fn constituent_item_discriminates_on_identifier_presence() {
        let entry: Constituent = serde_json::from_value(json!({
            "item": {"item_id": "parent", "type": "samples", "name": "Parent"},
            "quantity": 5.0
        }))
        .expect("entry constituent should parse");
        let reference = entry.entry_reference().expect("should be an entry");
        assert_eq!(
            reference.identifier(),
            TargetIdentifier::ItemId("parent".to_string())
        );
        assert_eq!(entry.unit, DEFAULT_UNIT);

        let inline: Constituent = serde_json::from_value(json!({
            "item": {"name": "water", "chemform": "H2O"},
            "quantity": null,
            "unit": "mL"
        }))
        .expect("inline constituent should parse");
        assert!(matches!(
            inline.item,
            ConstituentItem::Inline(InlineSubstance { ref name, .. }) if name == "water"
        ));
    }

    #[test]
    fn entry_identifier_prefers_refcode() {
        let entry = EntryReference::item_id("parent").with_refcode("lab:abcdef");
        assert_eq!(
            entry.identifier(),
            TargetIdentifier::Refcode("lab:abcdef".to_string())
        );
    }

    #[test]
    fn inline_substance_serializes_without_identifiers() {
        let constituent = Constituent::inline("copper", Some("Cu".to_string()));
        let value = serde_json::to_value(&constituent).expect("serialize");
        assert_eq!(value["item"], json!({"name": "copper", "chemform": "Cu"}));
    }

    #[test]
    fn validate_rejects_foreign_composition_lists() {
        let mut item = Item::new(ItemType::Equipment, "balance");
        item.synthesis_constituents
            .push(Constituent::entry(EntryReference::item_id("x"), None));
        let err = item.validate().expect_err("equipment has no composition");
        assert_eq!(err.code, "composition_not_allowed");
    }

    #[test]
    fn validate_rejects_negative_quantity() {
        let mut item = Item::new(ItemType::Sample, "s1");
        item.synthesis_constituents
            .push(Constituent::entry(EntryReference::item_id("x"), Some(-1.0)));
        let err = item.validate().expect_err("negative quantity should fail");
        assert_eq!(err.code, "constituent_invalid_quantity");
    }

    #[test]
    fn item_document_round_trip_keeps_extra_fields() {
        let raw = json!({
            "type": "samples",
            "item_id": "s1",
            "relationships": [],
            "collections": [],
            "creator_ids": [],
            "date": "2024-01-01"
        });
        let item = Item::from_document(raw).expect("item should parse");
        assert_eq!(item.extra.get("date"), Some(&json!("2024-01-01")));
        let back = item.to_document().expect("serialize");
        assert_eq!(back["date"], json!("2024-01-01"));
    }
}
