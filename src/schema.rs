//! Search-index definitions: building, command payloads, introspection.
//!
//! The backend's field schema must be declared explicitly and extended
//! incrementally, so this module is the single source of the index
//! definition shape:
//!
//! - [`build_mappings`] produces the field mappings for a target vector
//!   dimensionality plus the string fields that must be filterable.
//!   Output is structurally deterministic: same inputs, byte-for-byte
//!   identical JSON, so repeated submissions are idempotent and diffable.
//! - The `*_command` constructors wrap a definition into the backend's
//!   administrative command documents.
//! - [`IndexMappings`] / [`FieldMapping`] deserialize the
//!   `latestDefinition.mappings` a live index reports, for schema-cache
//!   hydration.
//!
//! The index is declared dynamically-mapped: unknown fields are stored
//! and retrievable, just not filterable until declared. String fields
//! therefore only need declaring when they participate in filtering.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::backend::Document;
use crate::record::VECTOR_FIELD;

/// Vector field type understood by the search backend.
const VECTOR_TYPE: &str = "knnVector";

/// Similarity metric for the vector field. Fixed by design, not
/// configurable per call.
const VECTOR_SIMILARITY: &str = "dotProduct";

/// Build the field mappings for an index definition.
///
/// Always declares the vector field with the given dimensionality and
/// dot-product similarity, marks the index dynamically-mapped, and adds
/// an exact-match oriented string mapping per requested field name. The
/// field set is a `BTreeSet` so emission order (and therefore the
/// serialized form) is deterministic.
pub fn build_mappings(dimension: u32, string_fields: &BTreeSet<String>) -> Value {
    let mut fields = serde_json::Map::new();
    fields.insert(
        VECTOR_FIELD.to_string(),
        json!({
            "type": VECTOR_TYPE,
            "dimensions": dimension,
            "similarity": VECTOR_SIMILARITY,
        }),
    );
    for name in string_fields {
        fields.insert(name.clone(), json!({ "type": "string" }));
    }
    json!({
        "dynamic": true,
        "fields": fields,
    })
}

/// Full index definition: mappings plus the (empty) custom-analyzer list
/// the backend accepts alongside them.
pub fn index_definition(dimension: u32, string_fields: &BTreeSet<String>) -> Value {
    json!({
        "mappings": build_mappings(dimension, string_fields),
        "analyzers": [],
    })
}

/// Command creating the search index for a collection.
pub fn create_search_indexes_command(
    collection: &str,
    index_name: &str,
    dimension: u32,
    string_fields: &BTreeSet<String>,
) -> Document {
    let mut command = Document::new();
    command.insert("createSearchIndexes".to_string(), json!(collection));
    command.insert(
        "indexes".to_string(),
        json!([{
            "name": index_name,
            "definition": index_definition(dimension, string_fields),
        }]),
    );
    command
}

/// Command replacing the definition of an existing search index.
pub fn update_search_index_command(
    collection: &str,
    index_name: &str,
    dimension: u32,
    string_fields: &BTreeSet<String>,
) -> Document {
    let mut command = Document::new();
    command.insert("updateSearchIndex".to_string(), json!(collection));
    command.insert("name".to_string(), json!(index_name));
    command.insert(
        "definition".to_string(),
        index_definition(dimension, string_fields),
    );
    command
}

/// Command dropping one search index by its backend-assigned id.
pub fn drop_search_index_command(collection: &str, id: &str) -> Document {
    let mut command = Document::new();
    command.insert("dropSearchIndex".to_string(), json!(collection));
    command.insert("id".to_string(), json!(id));
    command
}

/// Field mappings as reported by a live index definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexMappings {
    /// Whether undeclared fields are still stored and retrievable.
    #[serde(default)]
    pub dynamic: bool,
    /// Declared fields by name.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldMapping>,
}

/// One declared field mapping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Field type (`knnVector`, `string`, ...).
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Vector dimensionality, for vector fields.
    #[serde(default)]
    pub dimensions: Option<u32>,
    /// Similarity metric, for vector fields.
    #[serde(default)]
    pub similarity: Option<String>,
    /// Analyzer name, for string fields that declare one.
    #[serde(default)]
    pub analyzer: Option<String>,
}

impl IndexMappings {
    /// Names of declared string fields, lower-cased for case-insensitive
    /// matching against requested field sets.
    pub fn string_field_names(&self) -> BTreeSet<String> {
        self.fields
            .iter()
            .filter(|(_, mapping)| mapping.kind == "string")
            .map(|(name, _)| name.to_lowercase())
            .collect()
    }

    /// Dimensionality of the declared vector field, if present.
    pub fn vector_dimension(&self) -> Option<u32> {
        self.fields
            .get(VECTOR_FIELD)
            .and_then(|mapping| mapping.dimensions)
    }
}
