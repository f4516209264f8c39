//! Saving documents and document graphs.
//!
//! `save_all` plans every write up front so a failure can report its position:
//!
//! 1. documents, dependencies first, with foreign keys filled from stored keys
//! 2. stale `hasOne`/`hasMany` foreign keys set to null
//! 3. many-to-many link rows added, then removed
//!
//! Writes are not rolled back when a later one fails.

use crate::unit_of_work::WriteGraph;
use crate::{Session, link_of, link_row, patch, with_step};
use asupersync::{Cx, Outcome};
use docmodel_core::{
    ConflictPolicy, DocId, DocumentEvent, DocumentGraph, Error, Filter, HookEvent, HookPhase,
    LINK_PRIMARY_KEY, Link, LinkTable, Record, RecordType, RelationKind, StorageDriver, TableRef,
    Target, ValidatePolicy, Validator, Value, ValueKey, try_outcome,
};
use std::collections::HashSet;

/// One planned write of a `save_all`.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteStep {
    /// Insert or replace a document
    Document { id: DocId, insert: bool },
    /// Set a stale foreign key to null
    ClearForeignKey {
        model: String,
        key: Value,
        column: String,
    },
    /// Upsert the link row between two documents
    Link {
        link: LinkTable,
        owner: DocId,
        left_key: String,
        target: DocId,
        right_key: String,
    },
    /// Delete the link row for a stored pair
    Unlink {
        link: LinkTable,
        left: Value,
        right: Value,
    },
}

impl WriteStep {
    pub const fn operation(&self) -> &'static str {
        match self {
            WriteStep::Document { insert: true, .. } => "insert",
            WriteStep::Document { insert: false, .. } => "replace",
            WriteStep::ClearForeignKey { .. } => "update",
            WriteStep::Link { .. } => "link",
            WriteStep::Unlink { .. } => "unlink",
        }
    }
}

impl<D: StorageDriver> Session<D> {
    /// Save one document, ignoring its links.
    #[tracing::instrument(level = "debug", skip(self, cx, graph))]
    pub async fn save(&self, cx: &Cx, graph: &mut DocumentGraph, id: DocId) -> Outcome<(), Error> {
        let registry = &*self.registry;
        let record_type = try_result!(registry.model(graph.doc(id).model()));
        try_result!(record_type.run_hooks(HookPhase::Pre, HookEvent::Save, graph.doc_mut(id)));
        if registry.config().validate == ValidatePolicy::OnSave {
            try_result!(Validator::new(registry).validate(graph.doc_mut(id)));
        }

        let insert = !graph.doc(id).is_saved();
        try_outcome!(self.write_document(cx, graph, record_type, id, insert, 0, 1).await);

        try_result!(record_type.run_hooks(HookPhase::Post, HookEvent::Save, graph.doc_mut(id)));
        record_type.emit(DocumentEvent::Saved, graph.doc(id));
        Outcome::Ok(())
    }

    /// Save `root` and every document reachable from it.
    ///
    /// Documents are written so that every foreign key is known before the
    /// document holding it is written. A dependency cycle fails before any
    /// write.
    #[tracing::instrument(level = "debug", skip(self, cx, graph))]
    pub async fn save_all(
        &self,
        cx: &Cx,
        graph: &mut DocumentGraph,
        root: DocId,
    ) -> Outcome<(), Error> {
        let registry = &*self.registry;
        let nodes = graph.reachable(root);

        for &id in &nodes {
            let record_type = try_result!(registry.model(graph.doc(id).model()));
            try_result!(record_type.run_hooks(HookPhase::Pre, HookEvent::Save, graph.doc_mut(id)));
        }
        if registry.config().validate == ValidatePolicy::OnSave {
            try_result!(Validator::new(registry).validate_all(graph, root, None));
        }

        let writes = try_result!(WriteGraph::build(registry, graph, &nodes));
        let order = match writes.write_order() {
            Ok(order) => order,
            Err(cycle) => return Outcome::Err(Error::CyclicRelation(cycle)),
        };
        let (plan, cleared) = try_result!(self.plan_writes(graph, &writes, &order));

        tracing::info!(
            root = %root,
            documents = order.len(),
            writes = plan.len(),
            "Saving document graph"
        );

        let total = plan.len();
        for (step, write) in plan.iter().enumerate() {
            tracing::trace!(step = step, operation = write.operation(), "Executing write");
            match write {
                WriteStep::Document { id, insert } => {
                    let id = *id;
                    for assignment in writes.assignments_into(id) {
                        let value = graph
                            .doc(assignment.source)
                            .get(&assignment.source_field)
                            .filter(|v| !v.is_null())
                            .cloned();
                        if let Some(value) = value {
                            graph.doc_mut(id).set(assignment.dependent_field.clone(), value);
                        }
                    }
                    for (doc, field) in &cleared {
                        if *doc == id {
                            graph.doc_mut(id).set(field.clone(), Value::Null);
                        }
                    }
                    let record_type = try_result!(registry.model(graph.doc(id).model()));
                    try_outcome!(
                        self.write_document(cx, graph, record_type, id, *insert, step, total)
                            .await
                    );
                }
                WriteStep::ClearForeignKey { model, key, column } => {
                    let record_type = try_result!(registry.model(model));
                    let table = TableRef::new(record_type.table_name(), record_type.primary_key());
                    try_outcome!(with_step(
                        self.driver
                            .update(cx, table, Target::Key(key.clone()), patch(column, Value::Null))
                            .await,
                        step,
                        total,
                        write.operation(),
                        table.name,
                    ));
                    if let Some(holder) = graph.find(model, key) {
                        graph.doc_mut(holder).set_persisted_field(column, Value::Null);
                    }
                }
                WriteStep::Link {
                    link,
                    owner,
                    left_key,
                    target,
                    right_key,
                } => {
                    let table = TableRef::new(&link.table, LINK_PRIMARY_KEY);
                    let pair = graph
                        .doc(*owner)
                        .get(left_key)
                        .filter(|v| !v.is_null())
                        .cloned()
                        .zip(graph.doc(*target).get(right_key).filter(|v| !v.is_null()).cloned());
                    let Some((left, right)) = pair else {
                        let err = Error::invalid_write(
                            &link.table,
                            format!("link needs values for '{left_key}' and '{right_key}'"),
                        );
                        return Outcome::Err(Error::persistence(
                            step,
                            total,
                            write.operation(),
                            &link.table,
                            err,
                        ));
                    };
                    try_outcome!(with_step(
                        self.driver
                            .insert(cx, table, vec![link_row(link, &left, &right)], ConflictPolicy::Replace)
                            .await,
                        step,
                        total,
                        write.operation(),
                        table.name,
                    ));
                }
                WriteStep::Unlink { link, left, right } => {
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
            }
        }

        for &id in &order {
            for (field, _) in graph.links(id) {
                let keys = try_result!(graph.linked_keys(registry, id, &field));
                graph.set_persisted_links(id, field, keys);
            }
        }
        for &id in &order {
            let record_type = try_result!(registry.model(graph.doc(id).model()));
            try_result!(record_type.run_hooks(HookPhase::Post, HookEvent::Save, graph.doc_mut(id)));
            record_type.emit(DocumentEvent::Saved, graph.doc(id));
        }

        tracing::info!(root = %root, writes = total, "Document graph saved");
        Outcome::Ok(())
    }

    /// Plan the writes of a `save_all` and the `belongsTo` keys to null.
    fn plan_writes(
        &self,
        graph: &DocumentGraph,
        writes: &WriteGraph,
        order: &[DocId],
    ) -> docmodel_core::Result<(Vec<WriteStep>, Vec<(DocId, String)>)> {
        let registry = &*self.registry;
        let mut documents = Vec::with_capacity(order.len());
        let mut clears = Vec::new();
        let mut links = Vec::new();
        let mut unlinks = Vec::new();
        let mut cleared = Vec::new();
        let mut seen_clears = HashSet::new();
        let mut seen_unlinks = HashSet::new();

        for &id in order {
            documents.push(WriteStep::Document {
                id,
                insert: !graph.doc(id).is_saved(),
            });

            for (field, link) in graph.links(id) {
                let relation = registry.resolve(graph.doc(id).model(), &field)?;
                let stored = graph.persisted_links(id, &field).unwrap_or_default();
                let current = link.targets();

                match relation.kind {
                    RelationKind::BelongsTo => {
                        if matches!(link, Link::One(None)) && !stored.is_empty() {
                            cleared.push((id, relation.left_key.clone()));
                        }
                    }
                    RelationKind::HasOne | RelationKind::HasMany => {
                        let target_type = registry.model(&relation.target)?;
                        let linked: HashSet<ValueKey> = current
                            .iter()
                            .filter_map(|t| target_type.key_of(graph.doc(*t)))
                            .map(ValueKey::new)
                            .collect();
                        for key in stored {
                            if linked.contains(&ValueKey::new(key)) {
                                continue;
                            }
                            let relinked = graph
                                .find(&relation.target, key)
                                .is_some_and(|t| writes.is_assigned(t, &relation.right_key));
                            if relinked {
                                continue;
                            }
                            let dedup = (relation.target.clone(), relation.right_key.clone(), ValueKey::new(key));
                            if seen_clears.insert(dedup) {
                                clears.push(WriteStep::ClearForeignKey {
                                    model: relation.target.clone(),
                                    key: key.clone(),
                                    column: relation.right_key.clone(),
                                });
                            }
                        }
                    }
                    RelationKind::HasAndBelongsToMany => {
                        let link_table = link_of(relation)?;
                        let stored_keys: HashSet<ValueKey> =
                            stored.iter().map(ValueKey::new).collect();
                        let mut current_keys = HashSet::new();
                        for target in &current {
                            let right = graph
                                .doc(*target)
                                .get(&relation.right_key)
                                .filter(|v| !v.is_null());
                            if let Some(right) = right {
                                current_keys.insert(ValueKey::new(right));
                                if stored_keys.contains(&ValueKey::new(right)) {
                                    continue;
                                }
                            }
                            links.push(WriteStep::Link {
                                link: link_table.clone(),
                                owner: id,
                                left_key: relation.left_key.clone(),
                                target: *target,
                                right_key: relation.right_key.clone(),
                            });
                        }

                        let removed: Vec<&Value> = stored
                            .iter()
                            .filter(|k| !current_keys.contains(&ValueKey::new(k)))
                            .collect();
                        if removed.is_empty() {
                            continue;
                        }
                        let Some(left) = graph
                            .doc(id)
                            .get(&relation.left_key)
                            .filter(|v| !v.is_null())
                        else {
                            continue;
                        };
                        for right in removed {
                            let row = (link_table.table.clone(), link_table.row_id(left, right));
                            if seen_unlinks.insert(row) {
                                unlinks.push(WriteStep::Unlink {
                                    link: link_table.clone(),
                                    left: left.clone(),
                                    right: right.clone(),
                                });
                            }
                        }
                    }
                }
            }
        }

        tracing::debug!(
            documents = documents.len(),
            clears = clears.len(),
            links = links.len(),
            unlinks = unlinks.len(),
            "Write plan built"
        );

        let mut plan = documents;
        plan.extend(clears);
        plan.extend(links);
        plan.extend(unlinks);
        Ok((plan, cleared))
    }

    /// Insert or replace one document and mark it stored.
    #[allow(clippy::too_many_arguments)]
    async fn write_document(
        &self,
        cx: &Cx,
        graph: &mut DocumentGraph,
        record_type: &RecordType,
        id: DocId,
        insert: bool,
        step: usize,
        total: usize,
    ) -> Outcome<(), Error> {
        let table = TableRef::new(record_type.table_name(), record_type.primary_key());
        record_type.emit(DocumentEvent::Saving, graph.doc(id));
        let fields = graph.doc(id).fields().clone();

        if insert {
            let result = try_outcome!(with_step(
                self.driver
                    .insert(cx, table, vec![fields], ConflictPolicy::Error)
                    .await,
                step,
                total,
                "insert",
                table.name,
            ));
            if let Some(key) = result.generated_keys.into_iter().next() {
                graph.doc_mut(id).set(record_type.primary_key(), key);
            }
        } else {
            try_outcome!(with_step(
                self.driver.replace(cx, table, fields).await,
                step,
                total,
                "replace",
                table.name,
            ));
        }

        graph.doc_mut(id).mark_persisted();
        if let Some(key) = record_type.key_of(graph.doc(id)).cloned() {
            graph.register_key(id, &key);
        }
        tracing::trace!(
            model = record_type.name(),
            document = %id,
            insert = insert,
            "Document written"
        );
        Outcome::Ok(())
    }

    /// Insert many new documents of one model in a single batched write.
    ///
    /// Every record gets defaults and `init` hooks, then pre-`save` hooks and
    /// validation, before anything is written.
    #[tracing::instrument(level = "debug", skip(self, cx, graph, records))]
    pub async fn insert_many(
        &self,
        cx: &Cx,
        graph: &mut DocumentGraph,
        model: &str,
        records: Vec<Record>,
        conflict: ConflictPolicy,
    ) -> Outcome<Vec<DocId>, Error> {
        let registry = &*self.registry;
        let record_type = try_result!(registry.model(model));
        let validate = registry.config().validate == ValidatePolicy::OnSave;

        let mut docs = Vec::with_capacity(records.len());
        for record in records {
            let mut doc = try_result!(registry.new_document(model, record));
            try_result!(record_type.run_hooks(HookPhase::Pre, HookEvent::Save, &mut doc));
            if validate {
                try_result!(Validator::new(registry).validate(&mut doc));
            }
            docs.push(doc);
        }
        if docs.is_empty() {
            return Outcome::Ok(Vec::new());
        }

        for doc in &docs {
            record_type.emit(DocumentEvent::Saving, doc);
        }
        let table = TableRef::new(record_type.table_name(), record_type.primary_key());
        let rows: Vec<Record> = docs.iter().map(|d| d.fields().clone()).collect();
        let result = try_outcome!(with_step(
            self.driver.insert(cx, table, rows, conflict).await,
            0,
            1,
            "insert",
            table.name,
        ));

        let mut generated = result.generated_keys.into_iter();
        let mut ids = Vec::with_capacity(docs.len());
        for mut doc in docs {
            if record_type.key_of(&doc).is_none() {
                if let Some(key) = generated.next() {
                    doc.set(record_type.primary_key(), key);
                }
            }
            doc.mark_persisted();
            let id = match record_type.key_of(&doc).cloned() {
                Some(key) => match graph.find(model, &key) {
                    Some(existing) => {
                        *graph.doc_mut(existing) = doc;
                        existing
                    }
                    None => graph.intern(doc, &key).0,
                },
                None => graph.insert(doc),
            };
            ids.push(id);
        }

        for &id in &ids {
            try_result!(record_type.run_hooks(HookPhase::Post, HookEvent::Save, graph.doc_mut(id)));
            record_type.emit(DocumentEvent::Saved, graph.doc(id));
        }
        tracing::info!(
            model = model,
            inserted = result.inserted,
            replaced = result.replaced,
            unchanged = result.unchanged,
            "Documents inserted"
        );
        Outcome::Ok(ids)
    }
}
