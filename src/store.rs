use std::collections::HashMap;
use std::future::Future;

use serde_json::{Map, Value, json};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::models::TargetIdentifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Items,
    Collections,
}

impl Namespace {
    pub const fn as_str(self) -> &'static str {
        match self {
            Namespace::Items => "items",
            Namespace::Collections => "collections",
        }
    }
}

/// Document predicate with JSONB containment semantics, so it maps directly onto `@>`.
#[derive(Debug, Clone, PartialEq)]
pub enum DocFilter {
    All,
    Contains(Value),
    And(Vec<DocFilter>),
    Or(Vec<DocFilter>),
}

impl DocFilter {
    pub fn field_eq(field: &str, value: impl Into<Value>) -> Self {
        let mut pattern = Map::new();
        pattern.insert(field.to_string(), value.into());
        DocFilter::Contains(Value::Object(pattern))
    }

    /// Matches documents whose array `field` holds an element containing `element`.
    pub fn array_contains(field: &str, element: Value) -> Self {
        Self::field_eq(field, json!([element]))
    }

    pub fn identifier(identifier: &TargetIdentifier) -> Self {
        Self::field_eq(identifier.field_name(), identifier.value())
    }

    pub fn and(self, other: DocFilter) -> Self {
        match (self, other) {
            (DocFilter::All, other) | (other, DocFilter::All) => other,
            (DocFilter::And(mut left), DocFilter::And(right)) => {
                left.extend(right);
                DocFilter::And(left)
            }
            (DocFilter::And(mut left), right) => {
                left.push(right);
                DocFilter::And(left)
            }
            (left, right) => DocFilter::And(vec![left, right]),
        }
    }

    pub fn matches(&self, document: &Value) -> bool {
        match self {
            DocFilter::All => true,
            DocFilter::Contains(pattern) => json_contains(document, pattern),
            DocFilter::And(filters) => filters.iter().all(|filter| filter.matches(document)),
            DocFilter::Or(filters) => filters.iter().any(|filter| filter.matches(document)),
        }
    }
}

/// Postgres `jsonb @> jsonb` for the shapes this crate builds.
pub fn json_contains(document: &Value, pattern: &Value) -> bool {
    match (document, pattern) {
        (Value::Object(document), Value::Object(pattern)) => pattern.iter().all(|(key, expected)| {
            document
                .get(key)
                .is_some_and(|actual| json_contains(actual, expected))
        }),
        (Value::Array(document), Value::Array(pattern)) => pattern
            .iter()
            .all(|expected| document.iter().any(|actual| json_contains(actual, expected))),
        (Value::Number(actual), Value::Number(expected)) => actual.as_f64() == expected.as_f64(),
        (actual, expected) => actual == expected,
    }
}

/// Top-level field assignments applied atomically to one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocPatch {
    set: Map<String, Value>,
}

impl DocPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: &str, value: Value) -> Self {
        self.set.insert(field.to_string(), value);
        self
    }

    pub fn insert(&mut self, field: &str, value: Value) {
        self.set.insert(field.to_string(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.set
    }

    pub fn apply(&self, document: &mut Value) {
        if let Value::Object(document) = document {
            for (field, value) in &self.set {
                document.insert(field.clone(), value.clone());
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateAck {
    pub matched: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteAck {
    pub deleted: u64,
}

/// Schemaless document persistence consumed by the relationship subsystem.
pub trait DocumentStore: Send + Sync {
    fn find_one(
        &self,
        namespace: Namespace,
        filter: &DocFilter,
    ) -> impl Future<Output = Result<Option<Value>>> + Send;

    fn find(
        &self,
        namespace: Namespace,
        filter: &DocFilter,
    ) -> impl Future<Output = Result<Vec<Value>>> + Send;

    fn insert_one(
        &self,
        namespace: Namespace,
        document: Value,
    ) -> impl Future<Output = Result<()>> + Send;

    fn update_one(
        &self,
        namespace: Namespace,
        filter: &DocFilter,
        patch: &DocPatch,
    ) -> impl Future<Output = Result<UpdateAck>> + Send;

    fn delete_one(
        &self,
        namespace: Namespace,
        filter: &DocFilter,
    ) -> impl Future<Output = Result<DeleteAck>> + Send;
}

/// Process-local store; documents keep insertion order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    namespaces: RwLock<HashMap<Namespace, Vec<Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self, namespace: Namespace) -> usize {
        self.namespaces
            .read()
            .await
            .get(&namespace)
            .map_or(0, Vec::len)
    }
}

impl DocumentStore for MemoryStore {
    async fn find_one(&self, namespace: Namespace, filter: &DocFilter) -> Result<Option<Value>> {
        let namespaces = self.namespaces.read().await;
        Ok(namespaces
            .get(&namespace)
            .and_then(|documents| documents.iter().find(|document| filter.matches(document)))
            .cloned())
    }

    async fn find(&self, namespace: Namespace, filter: &DocFilter) -> Result<Vec<Value>> {
        let namespaces = self.namespaces.read().await;
        Ok(namespaces
            .get(&namespace)
            .map(|documents| {
                documents
                    .iter()
                    .filter(|document| filter.matches(document))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_one(&self, namespace: Namespace, document: Value) -> Result<()> {
        let mut namespaces = self.namespaces.write().await;
        namespaces.entry(namespace).or_default().push(document);
        Ok(())
    }

    async fn update_one(
        &self,
        namespace: Namespace,
        filter: &DocFilter,
        patch: &DocPatch,
    ) -> Result<UpdateAck> {
        let mut namespaces = self.namespaces.write().await;
        let target = namespaces
            .get_mut(&namespace)
            .and_then(|documents| documents.iter_mut().find(|document| filter.matches(document)));
        match target {
            Some(document) => {
                patch.apply(document);
                Ok(UpdateAck { matched: 1 })
            }
            None => Ok(UpdateAck { matched: 0 }),
        }
    }

    async fn delete_one(&self, namespace: Namespace, filter: &DocFilter) -> Result<DeleteAck> {
        let mut namespaces = self.namespaces.write().await;
        let Some(documents) = namespaces.get_mut(&namespace) else {
            return Ok(DeleteAck { deleted: 0 });
        };
        match documents.iter().position(|document| filter.matches(document)) {
            Some(index) => {
                documents.remove(index);
                Ok(DeleteAck { deleted: 1 })
            }
            None => Ok(DeleteAck { deleted: 0 }),
        }
    }
}
