//! Relation shape trees for joined reads.
//!
//! A [`JoinShape`] names which relation fields to fetch and, for each, an
//! optional filter and a nested shape for the related model.

use docmodel_core::{Error, Filter, Result};
use std::collections::BTreeMap;

/// Which relations to fetch.
///
/// # Example
///
/// ```ignore
/// let shape = JoinShape::new()
///     .include("author")
///     .include_where("comments", Filter::eq("approved", true))
///     .path("comments.author");
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinShape {
    relations: BTreeMap<String, JoinNode>,
    everything: bool,
}

/// One requested relation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinNode {
    /// Extra predicate on the related records
    pub filter: Option<Filter>,
    /// Relations to fetch on the related records
    pub nested: JoinShape,
}

impl JoinNode {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    #[must_use]
    pub fn nested(mut self, nested: JoinShape) -> Self {
        self.nested = nested;
        self
    }
}

impl JoinShape {
    /// An empty shape: fetch no relations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every declared relation, recursively.
    ///
    /// Expansion stops at a model already visited on the current path.
    pub fn all() -> Self {
        Self {
            relations: BTreeMap::new(),
            everything: true,
        }
    }

    /// This shape, additionally expanding every relation.
    #[must_use]
    pub fn expand_all(mut self) -> Self {
        self.everything = true;
        self
    }

    /// Does this shape expand to every relation?
    pub fn is_all(&self) -> bool {
        self.everything
    }

    pub fn is_empty(&self) -> bool {
        !self.everything && self.relations.is_empty()
    }

    /// Requested relations, sorted by field name.
    pub fn relations(&self) -> impl Iterator<Item = (&str, &JoinNode)> {
        self.relations.iter().map(|(f, n)| (f.as_str(), n))
    }

    pub fn get(&self, field: &str) -> Option<&JoinNode> {
        self.relations.get(field)
    }

    /// Fetch a relation with no filter.
    #[must_use]
    pub fn include(self, field: impl Into<String>) -> Self {
        self.include_node(field, JoinNode::new())
    }

    /// Fetch a relation, keeping only related records matching `filter`.
    #[must_use]
    pub fn include_where(self, field: impl Into<String>, filter: Filter) -> Self {
        self.include_node(field, JoinNode::new().filter(filter))
    }

    /// Fetch a relation and relations of the related records.
    #[must_use]
    pub fn include_nested(self, field: impl Into<String>, nested: JoinShape) -> Self {
        self.include_node(field, JoinNode::new().nested(nested))
    }

    /// Fetch a relation described by a node, merging with an existing entry.
    #[must_use]
    pub fn include_node(mut self, field: impl Into<String>, node: JoinNode) -> Self {
        self.merge_node(field.into(), node);
        self
    }

    /// Fetch a dotted path of relations (`"comments.author"`).
    ///
    /// Empty segments are ignored.
    #[must_use]
    pub fn path(mut self, path: &str) -> Self {
        let parts: Vec<&str> = path
            .split('.')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        let mut shape = &mut self;
        for part in parts {
            shape = &mut shape
                .relations
                .entry(part.to_string())
                .or_default()
                .nested;
        }
        self
    }

    fn merge_node(&mut self, field: String, node: JoinNode) {
        match self.relations.get_mut(&field) {
            Some(existing) => {
                if node.filter.is_some() {
                    existing.filter = node.filter;
                }
                existing.nested.everything |= node.nested.everything;
                for (nested_field, nested_node) in node.nested.relations {
                    existing.nested.merge_node(nested_field, nested_node);
                }
            }
            None => {
                self.relations.insert(field, node);
            }
        }
    }

    /// Build a shape from JSON.
    ///
    /// `true` (or the top-level value `true`) fetches a relation; an object
    /// nests. Keys starting with `_` are reserved and skipped. `false` leaves
    /// the relation out.
    ///
    /// ```ignore
    /// let shape = JoinShape::from_json(&serde_json::json!({"comments": {"author": true}}))?;
    /// ```
    pub fn from_json(json: &serde_json::Value) -> Result<Self> {
        match json {
            serde_json::Value::Bool(true) => Ok(Self::all()),
            serde_json::Value::Object(map) => {
                let mut shape = Self::new();
                for (field, value) in map {
                    if field.starts_with('_') {
                        continue;
                    }
                    match value {
                        serde_json::Value::Bool(true) => {
                            shape.merge_node(field.clone(), JoinNode::new());
                        }
                        serde_json::Value::Bool(false) => {}
                        serde_json::Value::Object(_) => {
                            let nested = Self::from_json(value)?;
                            shape.merge_node(field.clone(), JoinNode::new().nested(nested));
                        }
                        other => {
                            return Err(Error::config(
                                None,
                                format!("join shape for '{field}' must be a boolean or object, got {other}"),
                            ));
                        }
                    }
                }
                Ok(shape)
            }
            other => Err(Error::config(
                None,
                format!("join shape must be `true` or an object, got {other}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_builds_nested_nodes() {
        let shape = JoinShape::new().path("comments.author").path("comments");
        let comments = shape.get("comments").expect("comments");
        assert!(comments.nested.get("author").is_some());
        assert_eq!(shape.relations().count(), 1);
    }

    #[test]
    fn path_ignores_empty_segments() {
        let shape = JoinShape::new().path(" .team..hq ");
        assert!(shape
            .get("team")
            .and_then(|t| t.nested.get("hq"))
            .is_some());
        assert!(JoinShape::new().path("..").is_empty());
    }

    #[test]
    fn include_merges_filters_and_nesting() {
        let shape = JoinShape::new()
            .include_nested("comments", JoinShape::new().include("author"))
            .include_where("comments", Filter::eq("approved", true));
        let comments = shape.get("comments").expect("comments");
        assert_eq!(comments.filter, Some(Filter::eq("approved", true)));
        assert!(comments.nested.get("author").is_some());
    }

    #[test]
    fn from_json_shapes() {
        let shape =
            JoinShape::from_json(&serde_json::json!({"comments": {"author": true}, "tags": false, "_apply": true}))
                .expect("shape");
        assert!(shape.get("tags").is_none());
        assert!(shape.get("_apply").is_none());
        assert!(shape
            .get("comments")
            .and_then(|c| c.nested.get("author"))
            .is_some());

        assert!(JoinShape::from_json(&serde_json::json!(true))
            .expect("all")
            .is_all());
        assert!(JoinShape::from_json(&serde_json::json!({"comments": 1})).is_err());
    }
}
