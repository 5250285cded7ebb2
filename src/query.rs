//! Tag-filter compilation into the backend's compound query form.
//!
//! Filtering is exact-match only: a [`TagFilter`] maps tag names to the
//! single value each must carry, and every condition must hold
//! (logical AND). The compiler emits one `must` clause per (tag, value)
//! pair, each a `text` predicate targeting the tag field's prefixed
//! path. No OR-within-filter, ranges, or negation.

use std::collections::BTreeMap;

use serde_json::{Value, json};

use crate::record::tag_field_name;

/// A set of tag-equality conditions, all of which must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagFilter {
    conditions: BTreeMap<String, String>,
}

impl TagFilter {
    /// Create an empty filter (matches everything).
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `tag` to carry `value`.
    pub fn with<K: Into<String>, V: Into<String>>(mut self, tag: K, value: V) -> Self {
        self.conditions.insert(tag.into(), value.into());
        self
    }

    /// Whether this filter has no conditions.
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Iterate the (tag, value) conditions in tag order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.conditions
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Tag names this filter touches, in order.
    pub fn tag_names(&self) -> impl Iterator<Item = &str> {
        self.conditions.keys().map(String::as_str)
    }
}

/// Compile filters into a compound clause document.
///
/// All conditions from all supplied filters land in one `must` list; an
/// empty slice (or all-empty filters) compiles to an empty `must`, which
/// the backend treats as match-all.
pub fn compound_clause(filters: &[TagFilter]) -> Value {
    let mut conditions = Vec::new();
    for filter in filters {
        for (tag, value) in filter.iter() {
            conditions.push(json!({
                "text": {
                    "query": value,
                    "path": tag_field_name(tag),
                }
            }));
        }
    }
    json!({ "must": conditions })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filters_compile_to_empty_must() {
        let compound = compound_clause(&[]);
        assert_eq!(compound, json!({ "must": [] }));

        let compound = compound_clause(&[TagFilter::new()]);
        assert_eq!(compound, json!({ "must": [] }));
    }

    #[test]
    fn test_single_condition_targets_prefixed_path() {
        let filter = TagFilter::new().with("category", "Fantasy");
        let compound = compound_clause(&[filter]);
        assert_eq!(
            compound,
            json!({
                "must": [
                    { "text": { "query": "Fantasy", "path": "tg_category" } }
                ]
            })
        );
    }

    #[test]
    fn test_multiple_conditions_are_all_required() {
        let filter = TagFilter::new().with("color", "red").with("size", "L");
        let compound = compound_clause(&[filter]);
        let must = compound["must"].as_array().unwrap();
        assert_eq!(must.len(), 2);
        assert_eq!(must[0]["text"]["path"], json!("tg_color"));
        assert_eq!(must[1]["text"]["path"], json!("tg_size"));
    }

    #[test]
    fn test_conditions_from_all_filters_are_flattened() {
        let filters = vec![
            TagFilter::new().with("color", "red"),
            TagFilter::new().with("size", "L"),
        ];
        let compound = compound_clause(&filters);
        assert_eq!(compound["must"].as_array().unwrap().len(), 2);
    }
}
