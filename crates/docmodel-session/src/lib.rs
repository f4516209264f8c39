//! Graph-aware sessions for docmodel.
//!
//! `docmodel-session` is the **write layer**. A [`Session`] pairs a frozen
//! `Registry` with a `StorageDriver` and runs whole-graph operations against a
//! caller-owned `DocumentGraph`.
//!
//! # Role In The Architecture
//!
//! - **Persistence**: `save` writes one document; `save_all` writes everything
//!   reachable from a root in foreign-key order and reconciles links.
//! - **Deletion**: `delete`, `delete_all` and `purge` remove documents and
//!   clear the references left behind.
//! - **Reads**: `get`, `get_join` and `find` load documents through
//!   `docmodel-query`.
//!
//! # Example
//!
//! ```ignore
//! let session = Session::new(Arc::new(registry), MemoryDriver::new());
//! let mut graph = DocumentGraph::new();
//!
//! let post = graph.insert(session.registry().new_document("Post", record! { "title" => "Hi" })?);
//! let comment = graph.insert(session.registry().new_document("Comment", record! { "text" => "First" })?);
//! graph.attach(session.registry(), post, "comments", comment)?;
//!
//! // Writes the post, then the comment with `postId` filled in
//! session.save_all(&cx, &mut graph, post).await;
//! ```

/// Unwrap a `Result` inside a function returning `Outcome`.
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(err) => return ::asupersync::Outcome::Err(err),
        }
    };
}

pub mod cascade;
pub mod flush;
pub mod unit_of_work;

#[cfg(test)]
mod test_support;

pub use cascade::Cleanup;
pub use flush::WriteStep;
pub use unit_of_work::{KeyAssignment, WriteGraph};

use asupersync::{Cx, Outcome};
use docmodel_core::{
    ConflictPolicy, DocId, Document, DocumentGraph, Error, Filter, LinkTable, Record, Registry,
    Relation, RelationKind, Result, StorageDriver, TableRef, Target, ValidateOptions, Validator,
    Value, try_outcome,
};
use docmodel_query::{JoinQuery, JoinShape};
use std::sync::Arc;

// ============================================================================
// Session
// ============================================================================

/// Runs document operations against one storage driver.
pub struct Session<D: StorageDriver> {
    registry: Arc<Registry>,
    driver: D,
}

impl<D: StorageDriver> std::fmt::Debug for Session<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("models", &self.registry.models().count())
            .field("relations", &self.registry.relations().len())
            .finish_non_exhaustive()
    }
}

impl<D: StorageDriver> Session<D> {
    pub fn new(registry: Arc<Registry>, driver: D) -> Self {
        Self { registry, driver }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Shared handle to the registry.
    pub fn registry_arc(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    // ========================================================================
    // Validation
    // ========================================================================

    /// Validate one document with its model's settings.
    pub fn validate(&self, graph: &mut DocumentGraph, id: DocId) -> Result<()> {
        Validator::new(&self.registry).validate(graph.doc_mut(id))
    }

    /// Validate one document with per-call strictness overrides.
    pub fn validate_with(
        &self,
        graph: &mut DocumentGraph,
        id: DocId,
        options: ValidateOptions,
    ) -> Result<()> {
        Validator::new(&self.registry)
            .with_options(options)
            .validate(graph.doc_mut(id))
    }

    /// Validate `root` and the documents reachable from it.
    pub fn validate_all(
        &self,
        graph: &mut DocumentGraph,
        root: DocId,
        model_to_validate: Option<&str>,
    ) -> Result<()> {
        Validator::new(&self.registry).validate_all(graph, root, model_to_validate)
    }

    // ========================================================================
    // Indexes
    // ========================================================================

    /// Push every index requested by models and relations to the driver.
    ///
    /// Returns the number of requests sent.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn sync_indexes(&self, cx: &Cx) -> Outcome<usize, Error> {
        let requests = self.registry.index_requests();
        for request in &requests {
            let table = TableRef::new(&request.table, &request.primary_key);
            try_outcome!(self.driver.ensure_index(cx, table, &request.index).await);
        }
        tracing::info!(indexes = requests.len(), "Indexes synced");
        Outcome::Ok(requests.len())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Plan a joined read for `model`.
    pub fn join(&self, model: &str, shape: &JoinShape) -> Result<JoinQuery<'_, D>> {
        JoinQuery::new(&self.registry, &self.driver, model, shape)
    }

    /// Load one document by primary key.
    ///
    /// A document already in the graph is returned as is.
    pub async fn get(
        &self,
        cx: &Cx,
        graph: &mut DocumentGraph,
        model: &str,
        key: &Value,
    ) -> Outcome<DocId, Error> {
        self.get_join(cx, graph, model, key, &JoinShape::new()).await
    }

    /// Load one document by primary key together with the relations in `shape`.
    pub async fn get_join(
        &self,
        cx: &Cx,
        graph: &mut DocumentGraph,
        model: &str,
        key: &Value,
        shape: &JoinShape,
    ) -> Outcome<DocId, Error> {
        let query = try_result!(self.join(model, shape));
        query.get(cx, graph, key).await
    }

    /// Load every document of `model` matching `filter`, with the relations in `shape`.
    pub async fn find(
        &self,
        cx: &Cx,
        graph: &mut DocumentGraph,
        model: &str,
        filter: &Filter,
        shape: &JoinShape,
    ) -> Outcome<Vec<DocId>, Error> {
        let query = try_result!(self.join(model, shape));
        query.run(cx, graph, filter).await
    }

    // ========================================================================
    // Single relation writes
    // ========================================================================

    /// Link `target` on `owner.field` and write the link immediately.
    ///
    /// Both documents must be saved. The foreign key (or link row) is written
    /// without saving either document.
    #[tracing::instrument(level = "debug", skip(self, cx, graph))]
    pub async fn add_relation(
        &self,
        cx: &Cx,
        graph: &mut DocumentGraph,
        owner: DocId,
        field: &str,
        target: DocId,
    ) -> Outcome<(), Error> {
        let relation = try_result!(self.registry.resolve(graph.doc(owner).model(), field)).clone();
        try_result!(check_target(&relation, graph.doc(target)));
        for id in [owner, target] {
            try_result!(self.require_saved(graph.doc(id), "add_relation"));
        }

        match relation.kind {
            RelationKind::BelongsTo => {
                let value = try_result!(self.required_field(graph.doc(target), &relation.right_key));
                let key = try_result!(self.key_of(graph.doc(owner)));
                let owner_type = try_result!(self.registry.model(&relation.owner));
                let table = TableRef::new(owner_type.table_name(), owner_type.primary_key());
                try_outcome!(with_step(
                    self.driver
                        .update(cx, table, Target::Key(key), patch(&relation.left_key, value.clone()))
                        .await,
                    0,
                    1,
                    "update",
                    table.name,
                ));
                graph.doc_mut(owner).set_persisted_field(&relation.left_key, value);
            }
            RelationKind::HasOne | RelationKind::HasMany => {
                let value = try_result!(self.required_field(graph.doc(owner), &relation.left_key));
                let key = try_result!(self.key_of(graph.doc(target)));
                let target_type = try_result!(self.registry.model(&relation.target));
                let table = TableRef::new(target_type.table_name(), target_type.primary_key());
                try_outcome!(with_step(
                    self.driver
                        .update(cx, table, Target::Key(key), patch(&relation.right_key, value.clone()))
                        .await,
                    0,
                    1,
                    "update",
                    table.name,
                ));
                graph.doc_mut(target).set_persisted_field(&relation.right_key, value);
            }
            RelationKind::HasAndBelongsToMany => {
                let link = try_result!(link_of(&relation));
                let left = try_result!(self.required_field(graph.doc(owner), &relation.left_key));
                let right = try_result!(self.required_field(graph.doc(target), &relation.right_key));
                let table = TableRef::new(&link.table, docmodel_core::LINK_PRIMARY_KEY);
                try_outcome!(with_step(
                    self.driver
                        .insert(cx, table, vec![link_row(link, &left, &right)], ConflictPolicy::Replace)
                        .await,
                    0,
                    1,
                    "link",
                    table.name,
                ));
            }
        }

        try_result!(graph.attach(&self.registry, owner, field, target));
        if let Some(key) = try_result!(self.link_key(&relation, graph.doc(target))) {
            let mut keys = graph
                .persisted_links(owner, field)
                .map(<[Value]>::to_vec)
                .unwrap_or_default();
            if relation.kind.is_many() {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            } else {
                keys = vec![key];
            }
            graph.set_persisted_links(owner, field, keys);
        }

        tracing::info!(
            relation = %relation.qualified_name(),
            owner = %owner,
            target = %target,
            "Relation added"
        );
        Outcome::Ok(())
    }

    /// Unlink `target` from `owner.field`, or every target when `None`, and
    /// write the change immediately.
    ///
    /// With `None` the removal is predicate based, so targets that were never
    /// loaded are unlinked too.
    #[tracing::instrument(level = "debug", skip(self, cx, graph))]
    pub async fn remove_relation(
        &self,
        cx: &Cx,
        graph: &mut DocumentGraph,
        owner: DocId,
        field: &str,
        target: Option<DocId>,
    ) -> Outcome<(), Error> {
        let relation = try_result!(self.registry.resolve(graph.doc(owner).model(), field)).clone();
        try_result!(self.require_saved(graph.doc(owner), "remove_relation"));
        if let Some(t) = target {
            try_result!(check_target(&relation, graph.doc(t)));
            try_result!(self.require_saved(graph.doc(t), "remove_relation"));
        }

        match relation.kind {
            RelationKind::BelongsTo => {
                let current = graph
                    .doc(owner)
                    .get(&relation.left_key)
                    .filter(|v| !v.is_null())
                    .cloned();
                let points_at_target = match (target, &current) {
                    (_, None) => false,
                    (None, Some(_)) => true,
                    (Some(t), Some(value)) => graph.doc(t).get(&relation.right_key) == Some(value),
                };
                if points_at_target {
                    let key = try_result!(self.key_of(graph.doc(owner)));
                    let owner_type = try_result!(self.registry.model(&relation.owner));
                    let table = TableRef::new(owner_type.table_name(), owner_type.primary_key());
                    try_outcome!(with_step(
                        self.driver
                            .update(cx, table, Target::Key(key), patch(&relation.left_key, Value::Null))
                            .await,
                        0,
                        1,
                        "update",
                        table.name,
                    ));
                    graph
                        .doc_mut(owner)
                        .set_persisted_field(&relation.left_key, Value::Null);
                }
            }
            RelationKind::HasOne | RelationKind::HasMany => {
                let value = try_result!(self.required_field(graph.doc(owner), &relation.left_key));
                let target_type = try_result!(self.registry.model(&relation.target));
                let table = TableRef::new(target_type.table_name(), target_type.primary_key());
                let selector = match target {
                    Some(t) => Target::Key(try_result!(self.key_of(graph.doc(t)))),
                    None => Target::Matching(Filter::eq(&relation.right_key, value.clone())),
                };
                try_outcome!(with_step(
                    self.driver
                        .update(cx, table, selector, patch(&relation.right_key, Value::Null))
                        .await,
                    0,
                    1,
                    "update",
                    table.name,
                ));
                match target {
                    Some(t) => graph
                        .doc_mut(t)
                        .set_persisted_field(&relation.right_key, Value::Null),
                    None => null_matching(graph, &relation.target, &relation.right_key, &value),
                }
            }
            RelationKind::HasAndBelongsToMany => {
                let link = try_result!(link_of(&relation));
                let left = try_result!(self.required_field(graph.doc(owner), &relation.left_key));
                let mut filter = Filter::eq(&link.left_column, left);
                if let Some(t) = target {
                    let right = try_result!(self.required_field(graph.doc(t), &relation.right_key));
                    filter = filter.and(Filter::eq(&link.right_column, right));
                }
                let table = TableRef::new(&link.table, docmodel_core::LINK_PRIMARY_KEY);
                try_outcome!(with_step(
                    self.driver.delete(cx, table, Target::Matching(filter)).await,
                    0,
                    1,
                    "unlink",
                    table.name,
                ));
            }
        }

        graph.detach(owner, field, target);
        let keys = match target {
            None => Vec::new(),
            Some(t) => {
                let removed = try_result!(self.link_key(&relation, graph.doc(t)));
                graph
                    .persisted_links(owner, field)
                    .unwrap_or_default()
                    .iter()
                    .filter(|k| Some(*k) != removed.as_ref())
                    .cloned()
                    .collect()
            }
        };
        graph.set_persisted_links(owner, field, keys);

        tracing::info!(
            relation = %relation.qualified_name(),
            owner = %owner,
            all = target.is_none(),
            "Relation removed"
        );
        Outcome::Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    pub(crate) fn key_of(&self, doc: &Document) -> Result<Value> {
        let record_type = self.registry.model(doc.model())?;
        record_type.key_of(doc).cloned().ok_or_else(|| {
            Error::invalid_write(
                record_type.table_name(),
                format!("document has no '{}'", record_type.primary_key()),
            )
        })
    }

    pub(crate) fn require_saved(&self, doc: &Document, action: &str) -> Result<()> {
        if doc.is_saved() {
            return Ok(());
        }
        let record_type = self.registry.model(doc.model())?;
        Err(Error::invalid_write(
            record_type.table_name(),
            format!("{action} needs a saved {} document", record_type.name()),
        ))
    }

    fn required_field(&self, doc: &Document, field: &str) -> Result<Value> {
        match doc.get(field).filter(|v| !v.is_null()) {
            Some(value) => Ok(value.clone()),
            None => {
                let record_type = self.registry.model(doc.model())?;
                Err(Error::invalid_write(
                    record_type.table_name(),
                    format!("'{field}' has no value"),
                ))
            }
        }
    }

    /// Key recorded in `persisted_links` for a target: its `right_key` for
    /// many-to-many, its primary key otherwise.
    pub(crate) fn link_key(&self, relation: &Relation, target: &Document) -> Result<Option<Value>> {
        let field = if relation.kind == RelationKind::HasAndBelongsToMany {
            relation.right_key.as_str()
        } else {
            self.registry.model(&relation.target)?.primary_key()
        };
        Ok(target.get(field).filter(|v| !v.is_null()).cloned())
    }
}

/// Wrap a failed driver call as a planned-write failure.
pub(crate) fn with_step<T>(
    outcome: Outcome<T, Error>,
    step: usize,
    total: usize,
    operation: &'static str,
    table: &str,
) -> Outcome<T, Error> {
    match outcome {
        Outcome::Err(err) => {
            tracing::debug!(
                step = step,
                total = total,
                operation = operation,
                table = table,
                error = %err,
                "Planned write failed"
            );
            Outcome::Err(Error::persistence(step, total, operation, table, err))
        }
        other => other,
    }
}

pub(crate) fn patch(field: &str, value: Value) -> Record {
    let mut record = Record::new();
    record.insert(field.to_string(), value);
    record
}

/// Join-table row for one pair.
pub(crate) fn link_row(link: &LinkTable, left: &Value, right: &Value) -> Record {
    let mut row = Record::new();
    row.insert(
        docmodel_core::LINK_PRIMARY_KEY.to_string(),
        Value::Text(link.row_id(left, right)),
    );
    row.insert(link.left_column.clone(), left.clone());
    row.insert(link.right_column.clone(), right.clone());
    row
}

pub(crate) fn link_of(relation: &Relation) -> Result<&LinkTable> {
    relation.link.as_ref().ok_or_else(|| {
        Error::config(
            Some(&relation.owner),
            format!("relation '{}' has no link table", relation.field),
        )
    })
}

fn check_target(relation: &Relation, target: &Document) -> Result<()> {
    if target.model() == relation.target {
        return Ok(());
    }
    Err(Error::config(
        Some(&relation.owner),
        format!(
            "relation '{}' expects {}, got {}",
            relation.field,
            relation.target,
            target.model()
        ),
    ))
}

/// Null `field` on every loaded `model` document whose `field` equals `value`.
pub(crate) fn null_matching(graph: &mut DocumentGraph, model: &str, field: &str, value: &Value) {
    let holders: Vec<DocId> = graph
        .ids()
        .filter(|id| {
            let doc = graph.doc(*id);
            doc.model() == model && doc.get(field) == Some(value)
        })
        .collect();
    for id in holders {
        graph.doc_mut(id).set_persisted_field(field, Value::Null);
    }
}
