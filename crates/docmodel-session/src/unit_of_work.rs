//! Write ordering for document graphs.
//!
//! A [`WriteGraph`] records, for a set of documents, which documents must be
//! stored before which others so that foreign keys can be filled in:
//!
//! - `BelongsTo`: the owner depends on its target (the key lives on the owner)
//! - `HasOne`/`HasMany`: each target depends on the owner (the key lives on the target)
//! - many-to-many: no ordering, link rows are written after all documents
//!
//! Every edge also carries a [`KeyAssignment`] telling which field of the
//! dependency fills which field of the dependent.
//!
//! # Example
//!
//! ```ignore
//! let nodes = graph.reachable(root);
//! let writes = WriteGraph::build(&registry, &graph, &nodes)?;
//! let order = writes.write_order()?; // dependencies first
//! ```

use docmodel_core::{CycleError, DocId, DocumentGraph, Registry, RelationKind, Result};
use std::collections::{HashMap, HashSet};

/// Copy `source.source_field` into `dependent.dependent_field` once the
/// source is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAssignment {
    pub source: DocId,
    pub source_field: String,
    pub dependent: DocId,
    pub dependent_field: String,
}

/// Dependency graph over a set of documents.
#[derive(Debug, Clone, Default)]
pub struct WriteGraph {
    /// Documents in discovery order
    nodes: Vec<DocId>,
    /// Document -> documents it must be written after
    depends_on: HashMap<DocId, Vec<DocId>>,
    assignments: Vec<KeyAssignment>,
    /// `Model:key` labels for error messages
    labels: HashMap<DocId, String>,
}

impl WriteGraph {
    /// Build the graph for `nodes`, following their loaded links.
    ///
    /// Links to documents outside `nodes` are ignored.
    pub fn build(registry: &Registry, graph: &DocumentGraph, nodes: &[DocId]) -> Result<Self> {
        let members: HashSet<DocId> = nodes.iter().copied().collect();
        let mut writes = Self {
            nodes: nodes.to_vec(),
            ..Self::default()
        };

        for &id in nodes {
            let doc = graph.doc(id);
            let record_type = registry.model(doc.model())?;
            let label = match record_type.key_of(doc) {
                Some(key) => format!("{}:{key}", doc.model()),
                None => format!("{}:new{id}", doc.model()),
            };
            writes.labels.insert(id, label);

            for (field, target) in graph.edges(id) {
                if !members.contains(&target) {
                    continue;
                }
                let relation = registry.resolve(doc.model(), &field)?;
                match relation.kind {
                    RelationKind::BelongsTo => writes.add_edge(KeyAssignment {
                        source: target,
                        source_field: relation.right_key.clone(),
                        dependent: id,
                        dependent_field: relation.left_key.clone(),
                    }),
                    RelationKind::HasOne | RelationKind::HasMany => writes.add_edge(KeyAssignment {
                        source: id,
                        source_field: relation.left_key.clone(),
                        dependent: target,
                        dependent_field: relation.right_key.clone(),
                    }),
                    RelationKind::HasAndBelongsToMany => {}
                }
            }
        }

        tracing::debug!(
            documents = writes.nodes.len(),
            edges = writes.assignments.len(),
            "Write graph built"
        );
        Ok(writes)
    }

    fn add_edge(&mut self, assignment: KeyAssignment) {
        let deps = self.depends_on.entry(assignment.dependent).or_default();
        if !deps.contains(&assignment.source) {
            deps.push(assignment.source);
        }
        if !self.assignments.contains(&assignment) {
            self.assignments.push(assignment);
        }
    }

    pub fn nodes(&self) -> &[DocId] {
        &self.nodes
    }

    /// Documents `id` must be written after.
    pub fn dependencies(&self, id: DocId) -> &[DocId] {
        self.depends_on.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn assignments(&self) -> &[KeyAssignment] {
        &self.assignments
    }

    /// Assignments filling fields of `id`.
    pub fn assignments_into(&self, id: DocId) -> impl Iterator<Item = &KeyAssignment> {
        self.assignments.iter().filter(move |a| a.dependent == id)
    }

    /// Is `field` of `id` filled by some assignment?
    pub fn is_assigned(&self, id: DocId, field: &str) -> bool {
        self.assignments
            .iter()
            .any(|a| a.dependent == id && a.dependent_field == field)
    }

    /// Check for dependency cycles.
    pub fn check_cycles(&self) -> std::result::Result<(), CycleError> {
        self.write_order().map(|_| ())
    }

    /// Documents ordered so every dependency comes first.
    ///
    /// Fails with the documents on the cycle when the dependencies loop.
    pub fn write_order(&self) -> std::result::Result<Vec<DocId>, CycleError> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();
        let mut order = Vec::with_capacity(self.nodes.len());

        for &id in &self.nodes {
            if !visited.contains(&id) {
                if let Some(cycle) =
                    self.visit(id, &mut visited, &mut rec_stack, &mut path, &mut order)
                {
                    let path: Vec<String> = cycle.iter().map(|id| self.label(*id)).collect();
                    tracing::debug!(cycle = %path.join(" -> "), "Write cycle detected");
                    return Err(CycleError { path });
                }
            }
        }
        Ok(order)
    }

    /// Documents ordered so referencing documents come before the ones they
    /// reference. Falls back to discovery order when the graph has a cycle.
    pub fn delete_order(&self) -> Vec<DocId> {
        match self.write_order() {
            Ok(mut order) => {
                order.reverse();
                order
            }
            Err(_) => self.nodes.clone(),
        }
    }

    /// DFS helper; returns the cycle when one is found.
    fn visit(
        &self,
        id: DocId,
        visited: &mut HashSet<DocId>,
        rec_stack: &mut HashSet<DocId>,
        path: &mut Vec<DocId>,
        order: &mut Vec<DocId>,
    ) -> Option<Vec<DocId>> {
        visited.insert(id);
        rec_stack.insert(id);
        path.push(id);

        for &dep in self.dependencies(id) {
            if !visited.contains(&dep) {
                if let Some(cycle) = self.visit(dep, visited, rec_stack, path, order) {
                    return Some(cycle);
                }
            } else if rec_stack.contains(&dep) {
                let start = path.iter().position(|p| *p == dep).unwrap_or(0);
                let mut cycle = path[start..].to_vec();
                cycle.push(dep);
                return Some(cycle);
            }
        }

        rec_stack.remove(&id);
        path.pop();
        order.push(id);
        None
    }

    fn label(&self, id: DocId) -> String {
        self.labels
            .get(&id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docmodel_core::{Document, FieldRule, ModelOptions, OdmConfig, Schema, record};

    fn registry() -> Registry {
        let mut registry = Registry::new(OdmConfig::default());
        for (name, table) in [("Post", "posts"), ("Comment", "comments"), ("User", "users")] {
            registry
                .create_model(
                    name,
                    Schema::new().field("name", FieldRule::string().optional()),
                    ModelOptions::new().table(table),
                )
                .expect("model");
        }
        registry
            .belongs_to("Post", "User", "author", "authorId", "id")
            .expect("author");
        registry
            .has_many("Post", "Comment", "comments", "id", "postId")
            .expect("comments");
        registry
            .belongs_to("User", "Post", "pinned", "pinnedId", "id")
            .expect("pinned");
        registry
    }

    #[test]
    fn dependencies_come_first() {
        let registry = registry();
        let mut graph = DocumentGraph::new();
        let post = graph.insert(Document::new("Post", record! {}));
        let user = graph.insert(Document::new("User", record! {}));
        let comment = graph.insert(Document::new("Comment", record! {}));
        graph.attach(&registry, post, "author", user).expect("author");
        graph.attach(&registry, post, "comments", comment).expect("comment");

        let writes = WriteGraph::build(&registry, &graph, &graph.reachable(post)).expect("graph");
        let order = writes.write_order().expect("order");
        let position = |id| order.iter().position(|x| *x == id).expect("present");
        assert!(position(user) < position(post));
        assert!(position(post) < position(comment));

        let into_post: Vec<_> = writes.assignments_into(post).collect();
        assert_eq!(into_post.len(), 1);
        assert_eq!(into_post[0].dependent_field, "authorId");
        assert!(writes.is_assigned(comment, "postId"));

        let delete = writes.delete_order();
        assert_eq!(delete.first(), Some(&comment));
        assert_eq!(delete.last(), Some(&user));
    }

    #[test]
    fn cycles_are_reported_with_labels() {
        let registry = registry();
        let mut graph = DocumentGraph::new();
        let post = graph.insert(Document::stored("Post", record! { "id" => 1 }));
        let user = graph.insert(Document::new("User", record! {}));
        graph.attach(&registry, post, "author", user).expect("author");
        graph.attach(&registry, user, "pinned", post).expect("pinned");

        let writes = WriteGraph::build(&registry, &graph, &graph.reachable(post)).expect("graph");
        let err = writes.write_order().unwrap_err();
        assert_eq!(err.path.first(), err.path.last());
        assert!(err.path.contains(&"Post:1".to_string()));
        assert!(writes.check_cycles().is_err());
        assert_eq!(writes.delete_order(), vec![post, user]);
    }

    #[test]
    fn many_to_many_adds_no_order() {
        let mut registry = registry();
        registry
            .create_model("Tag", Schema::new(), ModelOptions::new().table("tags"))
            .expect("tag");
        registry
            .has_and_belongs_to_many("Post", "Tag", "tags", "id", "id")
            .expect("tags");
        registry
            .has_and_belongs_to_many("Tag", "Post", "posts", "id", "id")
            .expect("posts");
        let mut graph = DocumentGraph::new();
        let post = graph.insert(Document::new("Post", record! {}));
        let tag = graph.insert(Document::new("Tag", record! {}));
        graph.attach(&registry, post, "tags", tag).expect("tag");
        graph.attach(&registry, tag, "posts", post).expect("post");

        let writes = WriteGraph::build(&registry, &graph, &graph.reachable(post)).expect("graph");
        assert!(writes.assignments().is_empty());
        assert_eq!(writes.write_order().expect("order").len(), 2);
    }
}
