//! Deleting documents and clearing the references they leave behind.
//!
//! - `delete` removes one stored record.
//! - `delete_all` removes the loaded graph under a document, referencing
//!   documents first. Loaded documents that stay are only changed in memory.
//! - `purge` removes one record and clears every stored reference to it by
//!   predicate, loaded or not.

use crate::unit_of_work::WriteGraph;
use crate::{Session, link_of, null_matching, patch, with_step};
use asupersync::{Cx, Outcome};
use docmodel_core::{
    DocId, DocumentEvent, DocumentGraph, Error, Filter, HookEvent, HookPhase, LINK_PRIMARY_KEY,
    LinkTable, Relation, RelationKind, StorageDriver, TableRef, Target, Value, ValueKey,
    try_outcome,
};
use std::collections::HashSet;

/// A predicate write clearing references to a purged record.
#[derive(Debug, Clone, PartialEq)]
pub enum Cleanup {
    /// `update(table, column == key, column = null)`
    NullColumn {
        model: String,
        table: String,
        primary_key: String,
        column: String,
        key: Value,
    },
    /// `delete(link table, column == key)`
    DeleteLinks {
        table: String,
        column: String,
        key: Value,
    },
}

impl Cleanup {
    pub fn table(&self) -> &str {
        match self {
            Cleanup::NullColumn { table, .. } | Cleanup::DeleteLinks { table, .. } => table,
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Cleanup::NullColumn { column, .. } | Cleanup::DeleteLinks { column, .. } => column,
        }
    }

    pub fn key(&self) -> &Value {
        match self {
            Cleanup::NullColumn { key, .. } | Cleanup::DeleteLinks { key, .. } => key,
        }
    }

    pub const fn operation(&self) -> &'static str {
        match self {
            Cleanup::NullColumn { .. } => "update",
            Cleanup::DeleteLinks { .. } => "delete",
        }
    }

    fn dedup_key(&self) -> (String, String, ValueKey) {
        (
            self.table().to_string(),
            self.column().to_string(),
            ValueKey::new(self.key()),
        )
    }
}

/// A loaded link between a deleted and a kept document.
#[derive(Debug)]
struct SeveredLink {
    holder: DocId,
    field: String,
    target: DocId,
    /// Key dropped from the holder's `persisted_links`
    stored_key: Option<Value>,
    /// Kept document and field to set to null in memory
    cleared: Option<(DocId, String)>,
}

/// Writes of a `delete_all`, in execution order.
#[derive(Debug)]
enum CascadeWrite {
    Unlink {
        link: LinkTable,
        left: Value,
        right: Value,
    },
    Delete(DocId),
}

impl CascadeWrite {
    const fn operation(&self) -> &'static str {
        match self {
            CascadeWrite::Unlink { .. } => "unlink",
            CascadeWrite::Delete(_) => "delete",
        }
    }
}

impl<D: StorageDriver> Session<D> {
    /// Delete one stored document.
    ///
    /// The document stays in the graph, unsaved. Links are not touched.
    #[tracing::instrument(level = "debug", skip(self, cx, graph))]
    pub async fn delete(&self, cx: &Cx, graph: &mut DocumentGraph, id: DocId) -> Outcome<(), Error> {
        try_result!(self.require_saved(graph.doc(id), "delete"));
        let record_type = try_result!(self.registry.model(graph.doc(id).model()));
        let key = try_result!(self.key_of(graph.doc(id)));
        let table = TableRef::new(record_type.table_name(), record_type.primary_key());

        try_result!(record_type.run_hooks(HookPhase::Pre, HookEvent::Delete, graph.doc_mut(id)));
        try_outcome!(with_step(
            self.driver.delete(cx, table, Target::Key(key.clone())).await,
            0,
            1,
            "delete",
            table.name,
        ));
        graph.doc_mut(id).mark_deleted();
        try_result!(record_type.run_hooks(HookPhase::Post, HookEvent::Delete, graph.doc_mut(id)));
        record_type.emit(DocumentEvent::Deleted, graph.doc(id));

        tracing::info!(model = record_type.name(), key = %key, "Document deleted");
        Outcome::Ok(())
    }

    /// Delete `root` and the loaded documents reachable from it.
    ///
    /// With `model_to_delete`, only documents of that model are deleted.
    /// Documents that stay are never written: keys pointing at deleted
    /// documents are nulled in memory as unsaved changes and their links
    /// detached. Returns the deleted ids.
    #[tracing::instrument(level = "debug", skip(self, cx, graph))]
    pub async fn delete_all(
        &self,
        cx: &Cx,
        graph: &mut DocumentGraph,
        root: DocId,
        model_to_delete: Option<&str>,
    ) -> Outcome<Vec<DocId>, Error> {
        let registry = &*self.registry;
        let traversed = traverse(graph, root);
        let writes = try_result!(WriteGraph::build(registry, graph, &traversed));
        let doomed: Vec<DocId> = writes
            .delete_order()
            .into_iter()
            .filter(|id| {
                let doc = graph.doc(*id);
                doc.is_saved() && model_to_delete.is_none_or(|m| doc.model() == m)
            })
            .collect();
        let doomed_set: HashSet<DocId> = doomed.iter().copied().collect();

        for &id in &doomed {
            let record_type = try_result!(registry.model(graph.doc(id).model()));
            try_result!(record_type.run_hooks(HookPhase::Pre, HookEvent::Delete, graph.doc_mut(id)));
        }

        let (plan, severed) = try_result!(self.plan_cascade(graph, &doomed, &doomed_set));
        tracing::info!(
            root = %root,
            traversed = traversed.len(),
            deleted = doomed.len(),
            writes = plan.len(),
            "Deleting document graph"
        );

        let total = plan.len();
        for (step, write) in plan.iter().enumerate() {
            tracing::trace!(step = step, operation = write.operation(), "Executing delete write");
            match write {
                CascadeWrite::Unlink { link, left, right } => {
                    let table = TableRef::new(&link.table, LINK_PRIMARY_KEY);
                    let pair = Filter::eq(&link.left_column, left.clone())
                        .and(Filter::eq(&link.right_column, right.clone()));
                    try_outcome!(with_step(
                        self.driver.delete(cx, table, Target::Matching(pair)).await,
                        step,
                        total,
                        write.operation(),
                        table.name,
                    ));
                }
                CascadeWrite::Delete(id) => {
                    let record_type = try_result!(registry.model(graph.doc(*id).model()));
                    let table = TableRef::new(record_type.table_name(), record_type.primary_key());
                    let key = try_result!(self.key_of(graph.doc(*id)));
                    try_outcome!(with_step(
                        self.driver.delete(cx, table, Target::Key(key)).await,
                        step,
                        total,
                        write.operation(),
                        table.name,
                    ));
                }
            }
        }

        for link in severed {
            if let Some((kept, column)) = &link.cleared {
                graph.doc_mut(*kept).set(column.clone(), Value::Null);
            }
            graph.detach(link.holder, &link.field, Some(link.target));
            if let Some(stored_key) = link.stored_key {
                forget_persisted(graph, link.holder, &link.field, &stored_key);
            }
        }
        for &id in &doomed {
            graph.doc_mut(id).mark_deleted();
            let record_type = try_result!(registry.model(graph.doc(id).model()));
            try_result!(record_type.run_hooks(HookPhase::Post, HookEvent::Delete, graph.doc_mut(id)));
            record_type.emit(DocumentEvent::Deleted, graph.doc(id));
        }

        tracing::info!(root = %root, deleted = doomed.len(), "Document graph deleted");
        Outcome::Ok(doomed)
    }

    /// Plan the writes of a `delete_all`: link rows, then the documents
    /// themselves.
    fn plan_cascade(
        &self,
        graph: &DocumentGraph,
        doomed: &[DocId],
        doomed_set: &HashSet<DocId>,
    ) -> docmodel_core::Result<(Vec<CascadeWrite>, Vec<SeveredLink>)> {
        let registry = &*self.registry;
        let mut unlinks = Vec::new();
        let mut severed = Vec::new();
        let mut seen_rows = HashSet::new();

        for holder in graph.ids() {
            for (field, target) in graph.edges(holder) {
                let holder_gone = doomed_set.contains(&holder);
                let target_gone = doomed_set.contains(&target);
                if !holder_gone && !target_gone {
                    continue;
                }
                let relation = registry.resolve(graph.doc(holder).model(), &field)?;

                if relation.kind == RelationKind::HasAndBelongsToMany {
                    let link = link_of(relation)?;
                    let pair = graph
                        .doc(holder)
                        .get(&relation.left_key)
                        .filter(|v| !v.is_null())
                        .zip(graph.doc(target).get(&relation.right_key).filter(|v| !v.is_null()));
                    let stored = pair.is_some_and(|(_, right)| is_persisted(graph, holder, &field, right));
                    if let (Some((left, right)), true) = (pair, stored) {
                        if seen_rows.insert((link.table.clone(), link.row_id(left, right))) {
                            unlinks.push(CascadeWrite::Unlink {
                                link: link.clone(),
                                left: left.clone(),
                                right: right.clone(),
                            });
                        }
                    }
                    if !(holder_gone && target_gone) {
                        severed.push(SeveredLink {
                            holder,
                            field,
                            target,
                            stored_key: pair.map(|(_, right)| right.clone()),
                            cleared: None,
                        });
                    }
                    continue;
                }

                if holder_gone && target_gone {
                    continue;
                }
                let target_key = self.link_key(relation, graph.doc(target))?;
                severed.push(SeveredLink {
                    holder,
                    field,
                    target,
                    stored_key: target_key,
                    cleared: dangling_key(graph, relation, holder, target, holder_gone),
                });
            }
        }

        let mut plan = unlinks;
        plan.extend(doomed.iter().map(|id| CascadeWrite::Delete(*id)));
        Ok((plan, severed))
    }

    /// Delete one document and clear every stored reference to it.
    ///
    /// References are cleared by predicate, so records that were never
    /// loaded lose them too. Returns the cleanups that were run.
    #[tracing::instrument(level = "debug", skip(self, cx, graph))]
    pub async fn purge(
        &self,
        cx: &Cx,
        graph: &mut DocumentGraph,
        id: DocId,
    ) -> Outcome<Vec<Cleanup>, Error> {
        try_result!(self.require_saved(graph.doc(id), "purge"));
        let registry = &*self.registry;
        let model = graph.doc(id).model().to_string();
        let record_type = try_result!(registry.model(&model));
        let key = try_result!(self.key_of(graph.doc(id)));
        let cleanups = try_result!(self.plan_purge(graph, id));

        try_result!(record_type.run_hooks(HookPhase::Pre, HookEvent::Delete, graph.doc_mut(id)));
        tracing::info!(
            model = %model,
            key = %key,
            cleanups = cleanups.len(),
            "Purging document"
        );

        let total = cleanups.len() + 1;
        let table = TableRef::new(record_type.table_name(), record_type.primary_key());
        try_outcome!(with_step(
            self.driver.delete(cx, table, Target::Key(key.clone())).await,
            0,
            total,
            "delete",
            table.name,
        ));

        for (index, cleanup) in cleanups.iter().enumerate() {
            let step = index + 1;
            tracing::trace!(
                step = step,
                table = cleanup.table(),
                column = cleanup.column(),
                "Running cleanup"
            );
            match cleanup {
                Cleanup::NullColumn {
                    table,
                    primary_key,
                    column,
                    key,
                    ..
                } => {
                    let target = Target::Matching(Filter::eq(column, key.clone()));
                    try_outcome!(with_step(
                        self.driver
                            .update(cx, TableRef::new(table, primary_key), target, patch(column, Value::Null))
                            .await,
                        step,
                        total,
                        cleanup.operation(),
                        table,
                    ));
                }
                Cleanup::DeleteLinks { table, column, key } => {
                    let target = Target::Matching(Filter::eq(column, key.clone()));
                    try_outcome!(with_step(
                        self.driver
                            .delete(cx, TableRef::new(table, LINK_PRIMARY_KEY), target)
                            .await,
                        step,
                        total,
                        cleanup.operation(),
                        table,
                    ));
                }
            }
        }

        for cleanup in &cleanups {
            if let Cleanup::NullColumn {
                model, column, key, ..
            } = cleanup
            {
                null_matching(graph, model, column, key);
            }
        }
        try_result!(self.forget_everywhere(graph, id));
        for (field, _) in graph.links(id) {
            graph.clear_link(id, &field);
            graph.set_persisted_links(id, field, Vec::new());
        }

        graph.doc_mut(id).mark_deleted();
        try_result!(record_type.run_hooks(HookPhase::Post, HookEvent::Delete, graph.doc_mut(id)));
        record_type.emit(DocumentEvent::Deleted, graph.doc(id));
        Outcome::Ok(cleanups)
    }

    /// Cleanups for every relation touching the purged document's model.
    fn plan_purge(&self, graph: &DocumentGraph, id: DocId) -> docmodel_core::Result<Vec<Cleanup>> {
        let registry = &*self.registry;
        let doc = graph.doc(id);
        let model = doc.model();
        let value_of = |field: &str| doc.get(field).filter(|v| !v.is_null()).cloned();

        let mut cleanups = Vec::new();
        for relation in registry.relations_of(model) {
            match relation.kind {
                RelationKind::HasOne | RelationKind::HasMany => {
                    if let Some(key) = value_of(&relation.left_key) {
                        let target = registry.model(&relation.target)?;
                        cleanups.push(Cleanup::NullColumn {
                            model: relation.target.clone(),
                            table: target.table_name().to_string(),
                            primary_key: target.primary_key().to_string(),
                            column: relation.right_key.clone(),
                            key,
                        });
                    }
                }
                RelationKind::HasAndBelongsToMany => {
                    if let Some(key) = value_of(&relation.left_key) {
                        let link = link_of(relation)?;
                        cleanups.push(Cleanup::DeleteLinks {
                            table: link.table.clone(),
                            column: link.left_column.clone(),
                            key,
                        });
                    }
                }
                RelationKind::BelongsTo => {}
            }
        }
        for relation in registry.relations_targeting(model) {
            match relation.kind {
                RelationKind::BelongsTo => {
                    if let Some(key) = value_of(&relation.right_key) {
                        let owner = registry.model(&relation.owner)?;
                        cleanups.push(Cleanup::NullColumn {
                            model: relation.owner.clone(),
                            table: owner.table_name().to_string(),
                            primary_key: owner.primary_key().to_string(),
                            column: relation.left_key.clone(),
                            key,
                        });
                    }
                }
                RelationKind::HasAndBelongsToMany => {
                    if let Some(key) = value_of(&relation.right_key) {
                        let link = link_of(relation)?;
                        cleanups.push(Cleanup::DeleteLinks {
                            table: link.table.clone(),
                            column: link.right_column.clone(),
                            key,
                        });
                    }
                }
                RelationKind::HasOne | RelationKind::HasMany => {}
            }
        }

        let mut seen = HashSet::new();
        cleanups.retain(|c| seen.insert(c.dedup_key()));
        tracing::debug!(model = model, cleanups = cleanups.len(), "Purge planned");
        Ok(cleanups)
    }

    /// Detach `id` from every loaded holder and drop it from their stored links.
    fn forget_everywhere(&self, graph: &mut DocumentGraph, id: DocId) -> docmodel_core::Result<()> {
        let registry = &*self.registry;
        let model = graph.doc(id).model().to_string();
        let holders: Vec<DocId> = graph.ids().collect();
        for holder in holders {
            let holder_model = graph.doc(holder).model().to_string();
            for relation in registry.relations_of(&holder_model) {
                if relation.target != model {
                    continue;
                }
                if let Some(stored_key) = self.link_key(relation, graph.doc(id))? {
                    forget_persisted(graph, holder, &relation.field, &stored_key);
                }
            }
        }
        let changed = graph.detach_everywhere(id);
        tracing::trace!(document = %id, holders = changed.len(), "Detached purged document");
        Ok(())
    }
}

/// Loaded documents under `root`, not descending into a model already on
/// the current path.
fn traverse(graph: &DocumentGraph, root: DocId) -> Vec<DocId> {
    let mut order = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![(root, HashSet::new())];
    while let Some((id, mut path_models)) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        order.push(id);
        path_models.insert(graph.doc(id).model().to_string());
        for (_, target) in graph.edges(id).into_iter().rev() {
            if !path_models.contains(graph.doc(target).model()) {
                stack.push((target, path_models.clone()));
            }
        }
    }
    order
}

/// The kept document and field holding a key to a deleted document.
///
/// `BelongsTo` keys live on the holder, `HasOne`/`HasMany` keys on the
/// target.
fn dangling_key(
    graph: &DocumentGraph,
    relation: &Relation,
    holder: DocId,
    target: DocId,
    holder_gone: bool,
) -> Option<(DocId, String)> {
    let (kept, column) = match (relation.kind, holder_gone) {
        (RelationKind::BelongsTo, false) => (holder, &relation.left_key),
        (RelationKind::HasOne | RelationKind::HasMany, true) => (target, &relation.right_key),
        _ => return None,
    };
    let holds_key = graph.doc(kept).get(column).is_some_and(|v| !v.is_null());
    holds_key.then(|| (kept, column.clone()))
}

fn is_persisted(graph: &DocumentGraph, holder: DocId, field: &str, key: &Value) -> bool {
    graph
        .persisted_links(holder, field)
        .is_some_and(|keys| keys.contains(key))
}

fn forget_persisted(graph: &mut DocumentGraph, holder: DocId, field: &str, key: &Value) {
    let Some(keys) = graph.persisted_links(holder, field) else {
        return;
    };
    if !keys.contains(key) {
        return;
    }
    let kept: Vec<Value> = keys.iter().filter(|k| *k != key).cloned().collect();
    graph.set_persisted_links(holder, field.to_string(), kept);
}
