//! Data model shared by the sync core and its collaborators.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

/// Field holding a document's identifier.
pub const ID_FIELD: &str = "id";

/// Native id field of the document store.
pub const NATIVE_ID_FIELD: &str = "_id";

/// A document as stored in, and returned by, the document store.
pub type Document = Map<String, Value>;

/// Identifies one logical dataset: a collection inside a store.
///
/// Serializes as `{ "store": ..., "collection": ... }`, which is also the
/// payload of a `subscribe-collection` frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub store: String,
    pub collection: String,
}

impl ResourceKey {
    pub fn new(store: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.store, self.collection)
    }
}

/// Normalize a document identifier to its string form.
///
/// Accepts plain strings, numbers and extended-JSON object ids
/// (`{ "$oid": "..." }`).
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => map.get("$oid").and_then(id_string),
        _ => None,
    }
}

/// The identifier of a document, if it carries one. Falls back to the
/// store's native `_id` when `id` is absent.
pub fn document_id(doc: &Document) -> Option<String> {
    doc.get(ID_FIELD)
        .or_else(|| doc.get(NATIVE_ID_FIELD))
        .and_then(id_string)
}

/// Kind of change carried by a push notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    /// Map a server `operationType` onto the three kinds the cache knows.
    /// `replace` is an update that carries the whole document.
    pub fn parse(operation: &str) -> Option<Self> {
        match operation {
            "insert" => Some(Self::Insert),
            "update" | "replace" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// A change on a watched dataset, resolved to its [`ResourceKey`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub key: ResourceKey,
    pub kind: OperationKind,
    pub document_id: String,
    pub full_document: Option<Document>,
    pub updated_fields: Option<Document>,
    pub removed_fields: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    fn as_number(self) -> i8 {
        match self {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    pub direction: SortDirection,
}

/// Read parameters for a collection.
///
/// `filter`, `sort` and `projection` identify the result set; `limit` and
/// `skip` only page through it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FetchParams {
    pub filter: Document,
    pub sort: Vec<SortField>,
    pub projection: Option<Document>,
    pub limit: Option<u64>,
    pub skip: Option<u64>,
}

impl FetchParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality condition to the filter.
    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(field.into(), value.into());
        self
    }

    pub fn sort_asc(mut self, field: impl Into<String>) -> Self {
        self.sort.push(SortField {
            field: field.into(),
            direction: SortDirection::Ascending,
        });
        self
    }

    pub fn sort_desc(mut self, field: impl Into<String>) -> Self {
        self.sort.push(SortField {
            field: field.into(),
            direction: SortDirection::Descending,
        });
        self
    }

    /// Restrict returned documents to the given fields.
    pub fn project<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let projection = self.projection.get_or_insert_with(Document::new);
        for field in fields {
            projection.insert(field.into(), Value::from(1));
        }
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }
}

/// What a write or delete applies to.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteTarget {
    Id(String),
    Filter(Document),
}

impl WriteTarget {
    pub fn to_filter(&self) -> Document {
        match self {
            WriteTarget::Id(id) => {
                let mut filter = Document::new();
                filter.insert(ID_FIELD.to_string(), Value::String(id.clone()));
                filter
            }
            WriteTarget::Filter(filter) => filter.clone(),
        }
    }
}

/// Job kinds understood by the document store endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Get,
    Upsert,
    Delete,
}

/// Request body posted to the document store endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchJob {
    pub job: JobKind,
    pub store: String,
    pub collection: String,
    pub filter: Document,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projection: Option<Document>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty", serialize_with = "serialize_sort")]
    pub sort: Vec<SortField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Document>,
}

impl FetchJob {
    fn base(job: JobKind, key: &ResourceKey, filter: Document) -> Self {
        Self {
            job,
            store: key.store.clone(),
            collection: key.collection.clone(),
            filter,
            projection: None,
            limit: None,
            skip: None,
            sort: Vec::new(),
            data: None,
        }
    }

    pub fn get(key: &ResourceKey, params: &FetchParams) -> Self {
        Self {
            projection: params.projection.clone(),
            limit: params.limit,
            skip: params.skip,
            sort: params.sort.clone(),
            ..Self::base(JobKind::Get, key, params.filter.clone())
        }
    }

    pub fn upsert(key: &ResourceKey, target: &WriteTarget, data: &Document) -> Self {
        Self {
            data: Some(data.clone()),
            ..Self::base(JobKind::Upsert, key, target.to_filter())
        }
    }

    pub fn delete(key: &ResourceKey, target: &WriteTarget) -> Self {
        Self::base(JobKind::Delete, key, target.to_filter())
    }
}

/// Sort is written as `{ field: 1 | -1, ... }` in priority order.
#[allow(clippy::ptr_arg)]
fn serialize_sort<S: Serializer>(sort: &Vec<SortField>, serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(sort.len()))?;
    for field in sort {
        map.serialize_entry(&field.field, &field.direction.as_number())?;
    }
    map.end()
}
