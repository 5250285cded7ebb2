//! Memory records and their document encoding.
//!
//! A [`MemoryRecord`] is the unit of storage: a caller-assigned id, a
//! dense vector, multi-valued string tags used for exact-match filtering,
//! and an opaque payload stored for retrieval only.
//!
//! The codec maps a record onto a flat, prefix-tagged [`Document`]:
//!
//! | record part   | document field     |
//! |---------------|--------------------|
//! | id            | `_id`              |
//! | vector        | `embedding`        |
//! | tag `k`       | `tg_k` (array)     |
//! | payload `k`   | `pl_k` (string)    |
//!
//! Field names are classified through [`FieldKind`], an explicit table
//! rather than scattered prefix sniffing, so decode handles every stored
//! field kind exhaustively. Fields matching no kind are ignored on
//! decode, which keeps the codec forward-compatible with schema
//! additions.
//!
//! Payload values round-trip as strings. This is a deliberate, lossy
//! contract: the codec does not attempt to recover original payload
//! types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::backend::Document;
use crate::error::{EngramError, Result};

/// Reserved document field holding the record identity.
pub const ID_FIELD: &str = "_id";

/// Reserved document field holding the record vector.
pub const VECTOR_FIELD: &str = "embedding";

/// Field-name prefix for tag fields.
pub const TAG_PREFIX: &str = "tg_";

/// Field-name prefix for payload fields.
pub const PAYLOAD_PREFIX: &str = "pl_";

/// The unit of storage: id + vector + tags + payload.
///
/// The vector's dimensionality must equal the dimension the target index
/// was created with; this is a caller contract, not validated here.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Caller-assigned identity, unique within an index.
    pub id: String,
    /// Dense embedding vector.
    pub vector: Vec<f32>,
    /// Multi-valued string attributes, filterable by exact match.
    pub tags: BTreeMap<String, Vec<String>>,
    /// Opaque attributes, stored for retrieval only, never indexed.
    pub payload: BTreeMap<String, String>,
}

impl MemoryRecord {
    /// Create a record with an id and vector.
    pub fn new<S: Into<String>>(id: S, vector: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            vector,
            tags: BTreeMap::new(),
            payload: BTreeMap::new(),
        }
    }

    /// Add a multi-valued tag.
    pub fn with_tag<S: Into<String>>(mut self, key: S, values: Vec<String>) -> Self {
        self.tags.insert(key.into(), values);
        self
    }

    /// Add a payload entry.
    pub fn with_payload<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

/// Classification of one stored document field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind<'a> {
    /// The record identity (`_id`).
    Id,
    /// The record vector (`embedding`).
    Vector,
    /// A tag field; carries the unprefixed tag key.
    Tag(&'a str),
    /// A payload field; carries the unprefixed payload key.
    Payload(&'a str),
    /// Anything else. Ignored on decode.
    Other,
}

impl<'a> FieldKind<'a> {
    /// Classify a document field name.
    pub fn classify(name: &'a str) -> Self {
        if name == ID_FIELD {
            FieldKind::Id
        } else if name == VECTOR_FIELD {
            FieldKind::Vector
        } else if let Some(key) = name.strip_prefix(TAG_PREFIX) {
            FieldKind::Tag(key)
        } else if let Some(key) = name.strip_prefix(PAYLOAD_PREFIX) {
            FieldKind::Payload(key)
        } else {
            FieldKind::Other
        }
    }
}

/// Document field name for a tag key.
pub fn tag_field_name(key: &str) -> String {
    format!("{TAG_PREFIX}{key}")
}

/// Document field name for a payload key.
pub fn payload_field_name(key: &str) -> String {
    format!("{PAYLOAD_PREFIX}{key}")
}

/// Encode a record into its flat document representation.
///
/// Empty tag-value lists and empty payload maps produce no field at all;
/// [`decode`] treats an absent field as an empty collection.
pub fn encode(record: &MemoryRecord) -> Document {
    let mut document = Document::new();
    document.insert(ID_FIELD.to_string(), json!(record.id));
    document.insert(VECTOR_FIELD.to_string(), json!(record.vector));
    for (key, value) in &record.payload {
        document.insert(payload_field_name(key), json!(value));
    }
    for (key, values) in &record.tags {
        if values.is_empty() {
            continue;
        }
        document.insert(tag_field_name(key), json!(values));
    }
    document
}

/// Decode a flat document back into a record.
///
/// The inverse of [`encode`] over the fields it defines; unknown fields
/// are skipped.
pub fn decode(document: &Document) -> Result<MemoryRecord> {
    let mut record = MemoryRecord::default();
    for (name, value) in document {
        match FieldKind::classify(name) {
            FieldKind::Id => {
                record.id = value
                    .as_str()
                    .ok_or_else(|| EngramError::backend("record _id is not a string"))?
                    .to_string();
            }
            FieldKind::Vector => {
                let values = value
                    .as_array()
                    .ok_or_else(|| EngramError::backend("embedding field is not an array"))?;
                record.vector = values
                    .iter()
                    .map(|v| {
                        v.as_f64().map(|f| f as f32).ok_or_else(|| {
                            EngramError::backend("embedding component is not numeric")
                        })
                    })
                    .collect::<Result<Vec<f32>>>()?;
            }
            FieldKind::Tag(key) => {
                let values = value
                    .as_array()
                    .ok_or_else(|| EngramError::backend(format!("tag field {name} is not an array")))?
                    .iter()
                    .map(|v| stringify(v))
                    .collect();
                record.tags.insert(key.to_string(), values);
            }
            FieldKind::Payload(key) => {
                record.payload.insert(key.to_string(), stringify(value));
            }
            FieldKind::Other => {}
        }
    }
    if record.id.is_empty() {
        return Err(EngramError::backend("document without _id"));
    }
    Ok(record)
}

/// String form of a JSON value: strings verbatim, everything else via its
/// JSON rendering.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
