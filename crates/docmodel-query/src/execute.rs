//! Join execution.
//!
//! A [`JoinQuery`] runs a [`QueryPlan`] against a storage driver. Every
//! step issues at most one batched `In` read for all owners produced by its
//! parent step, so the number of reads is bounded by the plan length and
//! not by the number of documents.

use crate::plan::{FetchKind, FetchStep, JoinPlanner, QueryPlan};
use crate::shape::JoinShape;
use docmodel_core::{
    Cx, DocId, DocumentGraph, Error, Filter, JoinError, LINK_PRIMARY_KEY, Link, NotFoundError,
    Outcome, Record, Registry, RelationKind, StorageDriver, TableRef, Value, ValueKey,
    try_outcome,
};
use std::collections::{HashMap, HashSet};

/// A planned joined read bound to a registry and a driver.
pub struct JoinQuery<'a, D: StorageDriver> {
    registry: &'a Registry,
    driver: &'a D,
    plan: QueryPlan,
}

impl<D: StorageDriver> std::fmt::Debug for JoinQuery<'_, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinQuery")
            .field("plan", &self.plan)
            .finish_non_exhaustive()
    }
}

impl<D: StorageDriver> std::fmt::Display for JoinQuery<'_, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.plan, f)
    }
}

impl<'a, D: StorageDriver> JoinQuery<'a, D> {
    /// Plan `shape` for `model`.
    pub fn new(
        registry: &'a Registry,
        driver: &'a D,
        model: &str,
        shape: &JoinShape,
    ) -> docmodel_core::Result<Self> {
        let plan = JoinPlanner::new(registry).plan(model, shape)?;
        Ok(Self {
            registry,
            driver,
            plan,
        })
    }

    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    /// Load one root document by key and its related documents.
    #[tracing::instrument(level = "debug", skip(self, cx, graph), fields(model = %self.plan.model()))]
    pub async fn get(
        &self,
        cx: &Cx,
        graph: &mut DocumentGraph,
        key: &Value,
    ) -> Outcome<DocId, Error> {
        let record_type = match self.registry.model(self.plan.model()) {
            Ok(t) => t,
            Err(e) => return Outcome::Err(e),
        };
        let table = TableRef::new(record_type.table_name(), record_type.primary_key());
        let found = try_outcome!(self.driver.get(cx, table, key).await);
        let Some(record) = found else {
            return Outcome::Err(Error::DocumentNotFound(NotFoundError {
                table: record_type.table_name().to_string(),
                key: key.clone(),
            }));
        };
        let root = match self.intern(graph, self.plan.model(), record) {
            Ok(Some(id)) => id,
            Ok(None) => {
                return Outcome::Err(Error::driver(format!(
                    "{} returned a record without '{}'",
                    record_type.table_name(),
                    record_type.primary_key()
                )));
            }
            Err(e) => return Outcome::Err(e),
        };
        try_outcome!(self.attach_to(cx, graph, &[root]).await);
        Outcome::Ok(root)
    }

    /// Load every root document matching `filter` and their related documents.
    #[tracing::instrument(level = "debug", skip(self, cx, graph), fields(model = %self.plan.model()))]
    pub async fn run(
        &self,
        cx: &Cx,
        graph: &mut DocumentGraph,
        filter: &Filter,
    ) -> Outcome<Vec<DocId>, Error> {
        let record_type = match self.registry.model(self.plan.model()) {
            Ok(t) => t,
            Err(e) => return Outcome::Err(e),
        };
        let table = TableRef::new(record_type.table_name(), record_type.primary_key());
        let records = try_outcome!(self.driver.query(cx, table, filter).await);

        let mut roots = Vec::with_capacity(records.len());
        for record in records {
            match self.intern(graph, self.plan.model(), record) {
                Ok(Some(id)) => {
                    if !roots.contains(&id) {
                        roots.push(id);
                    }
                }
                Ok(None) => {}
                Err(e) => return Outcome::Err(e),
            }
        }
        try_outcome!(self.attach_to(cx, graph, &roots).await);
        Outcome::Ok(roots)
    }

    /// Run the plan's steps with `roots` as the root documents.
    ///
    /// Roots must be documents of the plan's model. Links are replaced on
    /// every owner a step touches, and each owner's persisted links are set
    /// to the keys actually loaded.
    pub async fn attach_to(
        &self,
        cx: &Cx,
        graph: &mut DocumentGraph,
        roots: &[DocId],
    ) -> Outcome<(), Error> {
        let mut produced: HashMap<usize, Vec<DocId>> = HashMap::new();
        let mut link_rows: HashMap<usize, Vec<Record>> = HashMap::new();
        let mut reads = 0usize;

        for step in self.plan.steps() {
            let owners: Vec<DocId> = match step.parent {
                Some(parent) => produced.get(&parent.0).cloned().unwrap_or_default(),
                None => roots.to_vec(),
            };
            let owner_keys = distinct(
                owners
                    .iter()
                    .filter_map(|o| graph.doc(*o).get(&step.relation.left_key))
                    .filter(|v| !v.is_null()),
            );

            tracing::trace!(
                step = step.id.0,
                kind = step.kind.as_str(),
                path = %step.path,
                owners = owners.len(),
                keys = owner_keys.len(),
                "Join step"
            );

            match &step.kind {
                FetchKind::LinkRows { link } => {
                    let rows = if owner_keys.is_empty() {
                        Vec::new()
                    } else {
                        reads += 1;
                        let table = TableRef::new(&link.table, LINK_PRIMARY_KEY);
                        let filter = Filter::in_list(&link.left_column, owner_keys);
                        try_outcome!(self.fetch(cx, step, table, &filter).await)
                    };
                    link_rows.insert(step.id.0, rows);
                }
                FetchKind::LinkedTargets { link, rows } => {
                    let rows = link_rows.remove(&rows.0).unwrap_or_default();
                    let wanted = distinct(
                        rows.iter()
                            .filter_map(|r| r.get(&link.right_column))
                            .filter(|v| !v.is_null()),
                    );
                    let targets = if wanted.is_empty() {
                        Vec::new()
                    } else {
                        reads += 1;
                        try_outcome!(self.fetch_targets(cx, step, wanted).await)
                    };
                    let by_right = match self.intern_all(graph, step, targets) {
                        Ok(map) => map,
                        Err(e) => return Outcome::Err(self.step_error(step, e)),
                    };

                    let mut loaded = Vec::new();
                    for owner in &owners {
                        let Some(left) = graph
                            .doc(*owner)
                            .get(&step.relation.left_key)
                            .filter(|v| !v.is_null())
                            .cloned()
                        else {
                            set_loaded(graph, *owner, &step.relation.field, Link::Many(Vec::new()), Vec::new());
                            continue;
                        };
                        let left = ValueKey::new(&left);
                        let mut ids = Vec::new();
                        let mut keys = Vec::new();
                        for row in &rows {
                            let matches_owner = row
                                .get(&link.left_column)
                                .is_some_and(|v| ValueKey::new(v) == left);
                            if !matches_owner {
                                continue;
                            }
                            let Some(right) = row.get(&link.right_column) else {
                                continue;
                            };
                            for id in by_right.get(&ValueKey::new(right)).into_iter().flatten() {
                                if !ids.contains(id) {
                                    ids.push(*id);
                                    keys.push(right.clone());
                                }
                            }
                        }
                        loaded.extend(ids.iter().copied());
                        set_loaded(graph, *owner, &step.relation.field, Link::Many(ids), keys);
                    }
                    produced.insert(step.id.0, dedup(loaded));
                }
                FetchKind::Lookup | FetchKind::Scan => {
                    let targets = if owner_keys.is_empty() {
                        Vec::new()
                    } else {
                        reads += 1;
                        try_outcome!(self.fetch_targets(cx, step, owner_keys).await)
                    };
                    let by_right = match self.intern_all(graph, step, targets) {
                        Ok(map) => map,
                        Err(e) => return Outcome::Err(self.step_error(step, e)),
                    };
                    let target_pk = match self.registry.model(&step.relation.target) {
                        Ok(t) => t.primary_key().to_string(),
                        Err(e) => return Outcome::Err(self.step_error(step, e)),
                    };

                    let mut loaded = Vec::new();
                    for owner in &owners {
                        let ids: Vec<DocId> = graph
                            .doc(*owner)
                            .get(&step.relation.left_key)
                            .filter(|v| !v.is_null())
                            .and_then(|left| by_right.get(&ValueKey::new(left)))
                            .cloned()
                            .unwrap_or_default();
                        let keys: Vec<Value> = ids
                            .iter()
                            .filter_map(|id| graph.doc(*id).get(&target_pk).cloned())
                            .collect();
                        loaded.extend(ids.iter().copied());
                        let link = if step.relation.kind == RelationKind::HasMany {
                            Link::Many(ids)
                        } else {
                            Link::One(ids.first().copied())
                        };
                        let keys = if step.relation.kind == RelationKind::HasMany {
                            keys
                        } else {
                            keys.into_iter().take(1).collect()
                        };
                        set_loaded(graph, *owner, &step.relation.field, link, keys);
                    }
                    produced.insert(step.id.0, dedup(loaded));
                }
            }
        }

        tracing::debug!(
            model = %self.plan.model(),
            roots = roots.len(),
            steps = self.plan.len(),
            reads = reads,
            "Join complete"
        );
        Outcome::Ok(())
    }

    async fn fetch_targets(
        &self,
        cx: &Cx,
        step: &FetchStep,
        keys: Vec<Value>,
    ) -> Outcome<Vec<Record>, Error> {
        let record_type = match self.registry.model(&step.relation.target) {
            Ok(t) => t,
            Err(e) => return Outcome::Err(self.step_error(step, e)),
        };
        let table = TableRef::new(record_type.table_name(), record_type.primary_key());
        let filter = Filter::in_list(&step.relation.right_key, keys).and_opt(step.filter.as_ref());
        self.fetch(cx, step, table, &filter).await
    }

    async fn fetch(
        &self,
        cx: &Cx,
        step: &FetchStep,
        table: TableRef<'_>,
        filter: &Filter,
    ) -> Outcome<Vec<Record>, Error> {
        match self.driver.query(cx, table, filter).await {
            Outcome::Ok(records) => Outcome::Ok(records),
            Outcome::Err(e) => Outcome::Err(self.step_error(step, e)),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Intern target records, grouped by their `right_key` value in read order.
    fn intern_all(
        &self,
        graph: &mut DocumentGraph,
        step: &FetchStep,
        records: Vec<Record>,
    ) -> docmodel_core::Result<HashMap<ValueKey, Vec<DocId>>> {
        let mut by_right: HashMap<ValueKey, Vec<DocId>> = HashMap::new();
        for record in records {
            let Some(right) = record.get(&step.relation.right_key).cloned() else {
                continue;
            };
            if let Some(id) = self.intern(graph, &step.relation.target, record)? {
                let ids = by_right.entry(ValueKey::new(&right)).or_default();
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        Ok(by_right)
    }

    /// Add a stored record to the graph unless a document with its key is
    /// already loaded. Loaded documents keep their in-memory state.
    fn intern(
        &self,
        graph: &mut DocumentGraph,
        model: &str,
        record: Record,
    ) -> docmodel_core::Result<Option<DocId>> {
        let record_type = self.registry.model(model)?;
        let Some(key) = record
            .get(record_type.primary_key())
            .filter(|v| !v.is_null())
            .cloned()
        else {
            return Ok(None);
        };
        if let Some(id) = graph.find(model, &key) {
            return Ok(Some(id));
        }
        let doc = self.registry.hydrate(model, record)?;
        Ok(Some(graph.intern(doc, &key).0))
    }

    fn step_error(&self, step: &FetchStep, source: Error) -> Error {
        Error::Join(JoinError {
            model: step.relation.owner.clone(),
            field: Some(step.relation.field.clone()),
            step: Some(step.id.0),
            message: format!("{} fetch for '{}' failed", step.kind.as_str(), step.path),
            source: Some(Box::new(source)),
        })
    }
}

fn set_loaded(graph: &mut DocumentGraph, owner: DocId, field: &str, link: Link, keys: Vec<Value>) {
    graph.set_link(owner, field, link);
    graph.set_persisted_links(owner, field, keys);
}

fn distinct<'v>(values: impl Iterator<Item = &'v Value>) -> Vec<Value> {
    let mut seen = HashSet::new();
    values
        .filter(|v| seen.insert(ValueKey::new(v)))
        .cloned()
        .collect()
}

fn dedup(ids: Vec<DocId>) -> Vec<DocId> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}
