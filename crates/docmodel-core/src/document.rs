//! Documents and the in-memory document graph.
//!
//! A [`Document`] is one record's fields plus its save state. Related
//! documents live side by side in a [`DocumentGraph`] arena and refer to each
//! other by [`DocId`], so relation cycles (a post whose comments point back
//! at the post) never form reference cycles.
//!
//! The graph keeps an identity index of `(model, primary key)` so that one
//! stored record is loaded into at most one node.

use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::relationship::RelationKind;
use crate::value::{Record, Value, ValueKey};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// One in-memory instance of a record type.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    model: String,
    fields: Record,
    saved: bool,
    old_value: Option<Record>,
}

impl Document {
    /// Create an unsaved document without applying defaults or hooks.
    ///
    /// [`Registry::new_document`] is the usual constructor.
    pub fn new(model: impl Into<String>, fields: Record) -> Self {
        Self {
            model: model.into(),
            fields,
            saved: false,
            old_value: None,
        }
    }

    /// Create a document for a record read from storage.
    pub fn stored(model: impl Into<String>, fields: Record) -> Self {
        Self {
            model: model.into(),
            old_value: Some(fields.clone()),
            fields,
            saved: true,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn fields(&self) -> &Record {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut Record {
        &mut self.fields
    }

    pub fn into_fields(self) -> Record {
        self.fields
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Set a field, returning the previous value.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(field.into(), value.into())
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    /// Shallow-merge `patch` into the fields.
    pub fn merge(&mut self, patch: Record) {
        self.fields.extend(patch);
    }

    /// Is this document known to exist in storage?
    pub fn is_saved(&self) -> bool {
        self.saved
    }

    /// Override the saved flag.
    ///
    /// Clearing it makes the next save an insert.
    pub fn set_saved(&mut self, saved: bool) {
        self.saved = saved;
        if !saved {
            self.old_value = None;
        }
    }

    /// The fields as last written to or read from storage.
    pub fn old_value(&self) -> Option<&Record> {
        self.old_value.as_ref()
    }

    /// Record that the current fields are now stored.
    pub fn mark_persisted(&mut self) {
        self.saved = true;
        self.old_value = Some(self.fields.clone());
    }

    /// Set a field that storage already holds with this value.
    ///
    /// Updates the old-value snapshot too, so the field does not show as changed.
    pub fn set_persisted_field(&mut self, field: &str, value: Value) {
        if let Some(old) = &mut self.old_value {
            old.insert(field.to_string(), value.clone());
        }
        self.fields.insert(field.to_string(), value);
    }

    /// Record that the stored record is gone.
    pub fn mark_deleted(&mut self) {
        self.saved = false;
        self.old_value = None;
    }

    /// Fields changed since the last persisted snapshot.
    pub fn changed_fields(&self) -> Vec<&str> {
        let Some(old) = &self.old_value else {
            return self.fields.keys().map(String::as_str).collect();
        };
        let mut changed: Vec<&str> = self
            .fields
            .iter()
            .filter(|(k, v)| old.get(*k) != Some(*v))
            .map(|(k, _)| k.as_str())
            .collect();
        changed.extend(
            old.keys()
                .filter(|k| !self.fields.contains_key(*k))
                .map(String::as_str),
        );
        changed
    }

    pub fn to_json(&self) -> serde_json::Value {
        Value::Object(self.fields.clone()).to_json()
    }
}

/// Handle to a document inside a [`DocumentGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocId(usize);

impl DocId {
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Related documents attached on a relation field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Link {
    One(Option<DocId>),
    Many(Vec<DocId>),
}

impl Link {
    /// Linked ids, in order.
    pub fn targets(&self) -> Vec<DocId> {
        match self {
            Link::One(target) => target.iter().copied().collect(),
            Link::Many(targets) => targets.clone(),
        }
    }

    pub fn contains(&self, id: DocId) -> bool {
        match self {
            Link::One(target) => *target == Some(id),
            Link::Many(targets) => targets.contains(&id),
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    doc: Document,
    links: BTreeMap<String, Link>,
    persisted_links: BTreeMap<String, Vec<Value>>,
}

/// Arena of documents and the links between them.
///
/// Ids are never reused; deleting a stored record only marks its document
/// unsaved.
#[derive(Debug, Clone, Default)]
pub struct DocumentGraph {
    nodes: Vec<Node>,
    identity: HashMap<(String, ValueKey), DocId>,
}

impl DocumentGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All ids in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = DocId> + '_ {
        (0..self.nodes.len()).map(DocId)
    }

    /// Add a document without entering it in the identity index.
    ///
    /// Use [`intern`](Self::intern) or [`register_key`](Self::register_key)
    /// to make it findable by key.
    pub fn insert(&mut self, doc: Document) -> DocId {
        let id = DocId(self.nodes.len());
        self.nodes.push(Node {
            doc,
            links: BTreeMap::new(),
            persisted_links: BTreeMap::new(),
        });
        id
    }

    /// Add a document unless one with the same model and key is present.
    ///
    /// Returns the id and whether a new node was created. An existing node
    /// keeps its in-memory state.
    pub fn intern(&mut self, doc: Document, key: &Value) -> (DocId, bool) {
        let identity = (doc.model().to_string(), ValueKey::new(key));
        if let Some(id) = self.identity.get(&identity) {
            return (*id, false);
        }
        let id = self.insert(doc);
        self.identity.insert(identity, id);
        (id, true)
    }

    /// Enter a document in the identity index under `key`.
    pub fn register_key(&mut self, id: DocId, key: &Value) {
        let model = self.nodes[id.0].doc.model().to_string();
        self.identity.insert((model, ValueKey::new(key)), id);
    }

    /// Look up a loaded document by model and key.
    pub fn find(&self, model: &str, key: &Value) -> Option<DocId> {
        self.identity
            .get(&(model.to_string(), ValueKey::new(key)))
            .copied()
    }

    pub fn contains(&self, id: DocId) -> bool {
        id.0 < self.nodes.len()
    }

    /// Borrow a document.
    ///
    /// # Panics
    ///
    /// Panics if `id` did not come from this graph.
    pub fn doc(&self, id: DocId) -> &Document {
        &self.nodes[id.0].doc
    }

    /// Mutably borrow a document.
    ///
    /// # Panics
    ///
    /// Panics if `id` did not come from this graph.
    pub fn doc_mut(&mut self, id: DocId) -> &mut Document {
        &mut self.nodes[id.0].doc
    }

    pub fn link(&self, id: DocId, field: &str) -> Option<&Link> {
        self.nodes[id.0].links.get(field)
    }

    /// Loaded relation fields of a document, sorted by field name.
    pub fn links(&self, id: DocId) -> Vec<(String, Link)> {
        self.nodes[id.0]
            .links
            .iter()
            .map(|(f, l)| (f.clone(), l.clone()))
            .collect()
    }

    /// Every `(field, target)` pair leaving a document.
    pub fn edges(&self, id: DocId) -> Vec<(String, DocId)> {
        self.nodes[id.0]
            .links
            .iter()
            .flat_map(|(f, l)| l.targets().into_iter().map(move |t| (f.clone(), t)))
            .collect()
    }

    /// Replace a relation field's link.
    pub fn set_link(&mut self, id: DocId, field: impl Into<String>, link: Link) {
        self.nodes[id.0].links.insert(field.into(), link);
    }

    /// Forget a relation field entirely (it becomes "not loaded").
    pub fn clear_link(&mut self, id: DocId, field: &str) -> Option<Link> {
        self.nodes[id.0].links.remove(field)
    }

    /// Attach `target` on `owner.field`, checking the declared relation.
    ///
    /// Single-valued relations are replaced; many-valued relations append
    /// unless the target is already attached.
    pub fn attach(
        &mut self,
        registry: &Registry,
        owner: DocId,
        field: &str,
        target: DocId,
    ) -> Result<()> {
        let relation = registry.resolve(self.doc(owner).model(), field)?;
        let target_model = self.doc(target).model();
        if target_model != relation.target {
            return Err(Error::config(
                Some(&relation.owner),
                format!(
                    "relation '{}' expects {}, got {}",
                    relation.field, relation.target, target_model
                ),
            ));
        }
        let is_many = relation.kind.is_many();
        let links = &mut self.nodes[owner.0].links;
        if is_many {
            match links.get_mut(field) {
                Some(Link::Many(targets)) => {
                    if !targets.contains(&target) {
                        targets.push(target);
                    }
                }
                _ => {
                    links.insert(field.to_string(), Link::Many(vec![target]));
                }
            }
        } else {
            links.insert(field.to_string(), Link::One(Some(target)));
        }
        Ok(())
    }

    /// Detach `target` from `owner.field`, or everything when `target` is `None`.
    ///
    /// Single-valued fields become `One(None)` and many-valued fields shrink,
    /// so the change is visible to the next `save_all`.
    pub fn detach(&mut self, owner: DocId, field: &str, target: Option<DocId>) {
        let Some(link) = self.nodes[owner.0].links.get_mut(field) else {
            return;
        };
        match (link, target) {
            (Link::One(current), Some(t)) => {
                if *current == Some(t) {
                    *current = None;
                }
            }
            (Link::One(current), None) => *current = None,
            (Link::Many(targets), Some(t)) => targets.retain(|x| *x != t),
            (Link::Many(targets), None) => targets.clear(),
        }
    }

    /// Detach `target` from every link that points at it.
    ///
    /// Returns the `(owner, field)` pairs that were changed.
    pub fn detach_everywhere(&mut self, target: DocId) -> Vec<(DocId, String)> {
        let mut changed = Vec::new();
        for (index, node) in self.nodes.iter_mut().enumerate() {
            for (field, link) in &mut node.links {
                if link.contains(target) {
                    match link {
                        Link::One(current) => *current = None,
                        Link::Many(targets) => targets.retain(|x| *x != target),
                    }
                    changed.push((DocId(index), field.clone()));
                }
            }
        }
        changed
    }

    /// Target keys last known to be stored for a relation field.
    pub fn persisted_links(&self, id: DocId, field: &str) -> Option<&[Value]> {
        self.nodes[id.0]
            .persisted_links
            .get(field)
            .map(Vec::as_slice)
    }

    pub fn set_persisted_links(&mut self, id: DocId, field: impl Into<String>, keys: Vec<Value>) {
        self.nodes[id.0].persisted_links.insert(field.into(), keys);
    }

    /// Documents reachable from `root` through loaded links, `root` first.
    pub fn reachable(&self, root: DocId) -> Vec<DocId> {
        let mut seen = vec![false; self.nodes.len()];
        let mut order = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if seen[id.0] {
                continue;
            }
            seen[id.0] = true;
            order.push(id);
            let edges = self.edges(id);
            for (_, target) in edges.into_iter().rev() {
                if !seen[target.0] {
                    stack.push(target);
                }
            }
        }
        order
    }

    /// Keys of the documents currently linked on `owner.field`.
    ///
    /// For many-to-many relations this is each target's `right_key` value;
    /// otherwise it is each target's primary key. Targets without a key are
    /// skipped.
    pub fn linked_keys(&self, registry: &Registry, owner: DocId, field: &str) -> Result<Vec<Value>> {
        let relation = registry.resolve(self.doc(owner).model(), field)?;
        let target_type = registry.model(&relation.target)?;
        let key_field = if relation.kind == RelationKind::HasAndBelongsToMany {
            relation.right_key.as_str()
        } else {
            target_type.primary_key()
        };
        Ok(self
            .link(owner, field)
            .map(Link::targets)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|t| self.doc(t).get(key_field).filter(|v| !v.is_null()).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;

    #[test]
    fn stored_documents_snapshot_old_value() {
        let mut doc = Document::stored("Post", record! { "id" => 1, "title" => "A" });
        assert!(doc.is_saved());
        doc.set("title", "B");
        assert_eq!(doc.changed_fields(), vec!["title"]);
        assert_eq!(
            doc.old_value().and_then(|o| o.get("title")),
            Some(&Value::from("A"))
        );
        doc.mark_persisted();
        assert!(doc.changed_fields().is_empty());
        doc.set_saved(false);
        assert!(doc.old_value().is_none());
    }

    #[test]
    fn inserted_documents_are_found_only_once_registered() {
        let mut graph = DocumentGraph::new();
        let id = graph.insert(Document::stored("User", record! { "id" => 4 }));
        assert_eq!(graph.find("User", &Value::Int(4)), None);
        graph.register_key(id, &Value::Int(4));
        assert_eq!(graph.find("User", &Value::Int(4)), Some(id));
    }

    #[test]
    fn intern_dedupes_by_model_and_key() {
        let mut graph = DocumentGraph::new();
        let (a, fresh_a) = graph.intern(
            Document::stored("User", record! { "id" => 1 }),
            &Value::Int(1),
        );
        let (b, fresh_b) = graph.intern(
            Document::stored("User", record! { "id" => 1, "name" => "later" }),
            &Value::Int(1),
        );
        let (c, _) = graph.intern(
            Document::stored("Post", record! { "id" => 1 }),
            &Value::Int(1),
        );
        assert!(fresh_a);
        assert!(!fresh_b);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(graph.doc(a).get("name").is_none());
        assert_eq!(graph.find("Post", &Value::Int(1)), Some(c));
    }

    #[test]
    fn detach_and_reachable() {
        let mut graph = DocumentGraph::new();
        let post = graph.insert(Document::new("Post", Record::new()));
        let c1 = graph.insert(Document::new("Comment", Record::new()));
        let c2 = graph.insert(Document::new("Comment", Record::new()));
        graph.set_link(post, "comments", Link::Many(vec![c1, c2]));
        graph.set_link(c1, "post", Link::One(Some(post)));

        assert_eq!(graph.reachable(post), vec![post, c1, c2]);

        graph.detach(post, "comments", Some(c1));
        assert_eq!(graph.link(post, "comments"), Some(&Link::Many(vec![c2])));

        let changed = graph.detach_everywhere(post);
        assert_eq!(changed, vec![(c1, "post".to_string())]);
        assert_eq!(graph.link(c1, "post"), Some(&Link::One(None)));
    }
}
