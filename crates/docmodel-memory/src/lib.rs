//! In-memory storage driver for docmodel.
//!
//! `MemoryDriver` keeps every table as an insertion-ordered list of records
//! behind one `Arc<Mutex<..>>`, so clones share storage. It is meant for tests
//! and embedding:
//!
//! - every successful call is appended to an operation journal
//! - `fail_next`/`fail_next_with` make the next matching call fail, with the
//!   storage message classified by `Error::from_driver_message`
//! - missing primary keys are generated from a per-table integer counter
//!
//! # Example
//!
//! ```ignore
//! let driver = MemoryDriver::new();
//! let session = odm.connect(driver.clone());
//! session.save_all(&cx, &mut graph, post).await;
//! assert_eq!(driver.table_rows("posts").len(), 1);
//! ```

use asupersync::{Cx, Outcome};
use docmodel_core::{
    ConflictPolicy, DeleteResult, DuplicateKeyError, Error, Filter, IndexSpec, InsertResult,
    Record, StorageDriver, TableRef, Target, Value, ValueKey, WriteResult,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Kind of a journaled driver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Get,
    Insert,
    Replace,
    Update,
    Delete,
    Query,
    EnsureIndex,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            OperationKind::Get => "get",
            OperationKind::Insert => "insert",
            OperationKind::Replace => "replace",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Query => "query",
            OperationKind::EnsureIndex => "ensure_index",
        }
    }

    /// Does this kind change stored data?
    pub const fn is_write(self) -> bool {
        matches!(
            self,
            OperationKind::Insert
                | OperationKind::Replace
                | OperationKind::Update
                | OperationKind::Delete
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One journaled driver call.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub kind: OperationKind,
    pub table: String,
    /// Key for keyed calls, and the written key for single-record writes
    pub key: Option<Value>,
    /// Predicate for queries and predicate writes
    pub filter: Option<Filter>,
    /// Records read, written or deleted
    pub affected: u64,
}

#[derive(Debug, Default)]
struct Table {
    rows: Vec<Record>,
    next_key: i64,
    indexes: Vec<IndexSpec>,
}

impl Table {
    fn position(&self, primary_key: &str, key: &Value) -> Option<usize> {
        let wanted = ValueKey::new(key);
        self.rows
            .iter()
            .position(|r| r.get(primary_key).is_some_and(|v| ValueKey::new(v) == wanted))
    }

    fn generate_key(&mut self, primary_key: &str) -> Value {
        loop {
            self.next_key += 1;
            let key = Value::Int(self.next_key);
            if self.position(primary_key, &key).is_none() {
                return key;
            }
        }
    }

    fn matching(&self, primary_key: &str, target: &Target) -> Vec<usize> {
        match target {
            Target::Key(key) => self.position(primary_key, key).into_iter().collect(),
            Target::Matching(filter) => self
                .rows
                .iter()
                .enumerate()
                .filter(|(_, r)| filter.matches(r))
                .map(|(i, _)| i)
                .collect(),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, Table>,
    journal: Vec<Operation>,
    /// Armed failures: call kind, table and the storage message to report
    failures: Vec<(OperationKind, String, String)>,
}

impl MemoryState {
    fn table(&mut self, name: &str) -> &mut Table {
        self.tables.entry(name.to_string()).or_default()
    }

    /// Consume an armed failure for this call, if any.
    fn take_failure(&mut self, kind: OperationKind, table: &str) -> Option<Error> {
        let index = self
            .failures
            .iter()
            .position(|(k, t, _)| *k == kind && t == table)?;
        let (_, _, message) = self.failures.remove(index);
        tracing::debug!(kind = %kind, table = table, message = %message, "Injected driver failure");
        Some(Error::from_driver_message(table, message))
    }

    fn record(&mut self, kind: OperationKind, table: &str, key: Option<Value>, filter: Option<Filter>, affected: u64) {
        tracing::trace!(kind = %kind, table = table, affected = affected, "Memory driver call");
        self.journal.push(Operation {
            kind,
            table: table.to_string(),
            key,
            filter,
            affected,
        });
    }
}

/// Shared in-memory storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store records directly, bypassing the journal.
    pub fn seed(&self, table: &str, records: Vec<Record>) {
        self.lock().table(table).rows.extend(records);
    }

    /// Every stored record of a table, in insertion order.
    pub fn table_rows(&self, table: &str) -> Vec<Record> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// The stored record whose `primary_key` field equals `key`.
    pub fn get_row(&self, table: &str, primary_key: &str, key: &Value) -> Option<Record> {
        let state = self.lock();
        let stored = state.tables.get(table)?;
        stored
            .position(primary_key, key)
            .map(|i| stored.rows[i].clone())
    }

    /// Indexes created on a table.
    pub fn indexes(&self, table: &str) -> Vec<IndexSpec> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.indexes.clone())
            .unwrap_or_default()
    }

    /// Every successful call since the last `clear_journal`.
    pub fn operations(&self) -> Vec<Operation> {
        self.lock().journal.clone()
    }

    /// Journaled calls that changed data.
    pub fn writes(&self) -> Vec<Operation> {
        self.lock()
            .journal
            .iter()
            .filter(|op| op.kind.is_write())
            .cloned()
            .collect()
    }

    /// Number of journaled calls of one kind.
    pub fn count(&self, kind: OperationKind) -> usize {
        self.lock()
            .journal
            .iter()
            .filter(|op| op.kind == kind)
            .count()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    /// Make the next `kind` call on `table` fail with a driver error.
    ///
    /// The failing call changes nothing and is not journaled.
    pub fn fail_next(&self, kind: OperationKind, table: &str) {
        self.fail_next_with(kind, table, format!("injected {kind} failure on {table}"));
    }

    /// Make the next `kind` call on `table` fail as if storage reported
    /// `message`, classified by [`Error::from_driver_message`].
    pub fn fail_next_with(&self, kind: OperationKind, table: &str, message: impl Into<String>) {
        self.lock()
            .failures
            .push((kind, table.to_string(), message.into()));
    }
}

impl StorageDriver for MemoryDriver {
    fn get(
        &self,
        _cx: &Cx,
        table: TableRef<'_>,
        key: &Value,
    ) -> impl Future<Output = Outcome<Option<Record>, Error>> + Send {
        let state = Arc::clone(&self.state);
        let name = table.name.to_string();
        let pk = table.primary_key.to_string();
        let key = key.clone();
        async move {
            let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(err) = guard.take_failure(OperationKind::Get, &name) {
                return Outcome::Err(err);
            }
            let stored = guard.table(&name);
            let found = stored.position(&pk, &key).map(|i| stored.rows[i].clone());
            let affected = u64::from(found.is_some());
            guard.record(OperationKind::Get, &name, Some(key), None, affected);
            Outcome::Ok(found)
        }
    }

    fn insert(
        &self,
        _cx: &Cx,
        table: TableRef<'_>,
        records: Vec<Record>,
        conflict: ConflictPolicy,
    ) -> impl Future<Output = Outcome<InsertResult, Error>> + Send {
        let state = Arc::clone(&self.state);
        let name = table.name.to_string();
        let pk = table.primary_key.to_string();
        async move {
            let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(err) = guard.take_failure(OperationKind::Insert, &name) {
                return Outcome::Err(err);
            }

            let stored = guard.table(&name);
            if conflict == ConflictPolicy::Error {
                let mut seen = Vec::new();
                for record in &records {
                    let Some(key) = record.get(&pk).filter(|v| !v.is_null()) else {
                        continue;
                    };
                    let key_hash = ValueKey::new(key);
                    if stored.position(&pk, key).is_some() || seen.contains(&key_hash) {
                        return Outcome::Err(Error::DuplicatePrimaryKey(DuplicateKeyError {
                            table: name,
                            key: key.clone(),
                        }));
                    }
                    seen.push(key_hash);
                }
            }

            let mut result = InsertResult::default();
            let mut single_key = None;
            for mut record in records {
                let key = match record.get(&pk).filter(|v| !v.is_null()) {
                    Some(key) => key.clone(),
                    None => {
                        let key = stored.generate_key(&pk);
                        record.insert(pk.clone(), key.clone());
                        result.generated_keys.push(key.clone());
                        key
                    }
                };
                single_key = Some(key.clone());
                match stored.position(&pk, &key) {
                    None => {
                        stored.rows.push(record);
                        result.inserted += 1;
                    }
                    Some(i) => {
                        let existing = &mut stored.rows[i];
                        let merged = if conflict == ConflictPolicy::Update {
                            let mut merged = existing.clone();
                            merged.extend(record);
                            merged
                        } else {
                            record
                        };
                        if *existing == merged {
                            result.unchanged += 1;
                        } else {
                            *existing = merged;
                            result.replaced += 1;
                        }
                    }
                }
            }

            let affected = result.inserted + result.replaced;
            let key = if affected + result.unchanged == 1 { single_key } else { None };
            guard.record(OperationKind::Insert, &name, key, None, affected);
            Outcome::Ok(result)
        }
    }

    fn replace(
        &self,
        _cx: &Cx,
        table: TableRef<'_>,
        record: Record,
    ) -> impl Future<Output = Outcome<WriteResult, Error>> + Send {
        let state = Arc::clone(&self.state);
        let name = table.name.to_string();
        let pk = table.primary_key.to_string();
        async move {
            let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(err) = guard.take_failure(OperationKind::Replace, &name) {
                return Outcome::Err(err);
            }
            let Some(key) = record.get(&pk).filter(|v| !v.is_null()).cloned() else {
                return Outcome::Err(Error::invalid_write(
                    name,
                    format!("replace needs a value for '{pk}'"),
                ));
            };
            let stored = guard.table(&name);
            match stored.position(&pk, &key) {
                Some(i) => stored.rows[i] = record,
                None => stored.rows.push(record),
            }
            guard.record(OperationKind::Replace, &name, Some(key), None, 1);
            Outcome::Ok(WriteResult { affected: 1 })
        }
    }

    fn update(
        &self,
        _cx: &Cx,
        table: TableRef<'_>,
        target: Target,
        patch: Record,
    ) -> impl Future<Output = Outcome<WriteResult, Error>> + Send {
        let state = Arc::clone(&self.state);
        let name = table.name.to_string();
        let pk = table.primary_key.to_string();
        async move {
            let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(err) = guard.take_failure(OperationKind::Update, &name) {
                return Outcome::Err(err);
            }
            let stored = guard.table(&name);
            let positions = stored.matching(&pk, &target);
            for i in &positions {
                stored.rows[*i].extend(patch.clone());
            }
            let affected = positions.len() as u64;
            let (key, filter) = split_target(target);
            guard.record(OperationKind::Update, &name, key, filter, affected);
            Outcome::Ok(WriteResult { affected })
        }
    }

    fn delete(
        &self,
        _cx: &Cx,
        table: TableRef<'_>,
        target: Target,
    ) -> impl Future<Output = Outcome<DeleteResult, Error>> + Send {
        let state = Arc::clone(&self.state);
        let name = table.name.to_string();
        let pk = table.primary_key.to_string();
        async move {
            let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(err) = guard.take_failure(OperationKind::Delete, &name) {
                return Outcome::Err(err);
            }
            let stored = guard.table(&name);
            let positions = stored.matching(&pk, &target);
            for i in positions.iter().rev() {
                stored.rows.remove(*i);
            }
            let deleted = positions.len() as u64;
            let (key, filter) = split_target(target);
            guard.record(OperationKind::Delete, &name, key, filter, deleted);
            Outcome::Ok(DeleteResult { deleted })
        }
    }

    fn query(
        &self,
        _cx: &Cx,
        table: TableRef<'_>,
        filter: &Filter,
    ) -> impl Future<Output = Outcome<Vec<Record>, Error>> + Send {
        let state = Arc::clone(&self.state);
        let name = table.name.to_string();
        let filter = filter.clone();
        async move {
            let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(err) = guard.take_failure(OperationKind::Query, &name) {
                return Outcome::Err(err);
            }
            let rows: Vec<Record> = guard
                .table(&name)
                .rows
                .iter()
                .filter(|r| filter.matches(r))
                .cloned()
                .collect();
            guard.record(OperationKind::Query, &name, None, Some(filter), rows.len() as u64);
            Outcome::Ok(rows)
        }
    }

    fn ensure_index(
        &self,
        _cx: &Cx,
        table: TableRef<'_>,
        index: &IndexSpec,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let state = Arc::clone(&self.state);
        let name = table.name.to_string();
        let index = index.clone();
        async move {
            let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(err) = guard.take_failure(OperationKind::EnsureIndex, &name) {
                return Outcome::Err(err);
            }
            let stored = guard.table(&name);
            let created = !stored.indexes.iter().any(|i| i.name == index.name);
            if created {
                stored.indexes.push(index);
            }
            guard.record(OperationKind::EnsureIndex, &name, None, None, u64::from(created));
            Outcome::Ok(())
        }
    }
}

fn split_target(target: Target) -> (Option<Value>, Option<Filter>) {
    match target {
        Target::Key(key) => (Some(key), None),
        Target::Matching(filter) => (None, Some(filter)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use docmodel_core::record;

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    const POSTS: TableRef<'static> = TableRef::new("posts", "id");

    #[test]
    fn insert_generates_missing_keys() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = MemoryDriver::new();
        driver.seed("posts", vec![record! { "id" => 1, "title" => "seeded" }]);

        rt.block_on(async {
            let result = unwrap_outcome(
                driver
                    .insert(
                        &cx,
                        POSTS,
                        vec![record! { "title" => "a" }, record! { "id" => "x", "title" => "b" }],
                        ConflictPolicy::Error,
                    )
                    .await,
            );
            assert_eq!(result.generated_keys, vec![Value::Int(2)]);
            assert_eq!(result.inserted, 2);
        });

        let rows = driver.table_rows("posts");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].get("title"), Some(&Value::from("a")));
    }

    #[test]
    fn duplicate_keys_follow_conflict_policy() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = MemoryDriver::new();
        driver.seed("posts", vec![record! { "id" => 1, "title" => "a", "views" => 3 }]);

        rt.block_on(async {
            let err = driver
                .insert(&cx, POSTS, vec![record! { "id" => 1 }], ConflictPolicy::Error)
                .await;
            assert!(matches!(err, Outcome::Err(Error::DuplicatePrimaryKey(_))));

            let updated = unwrap_outcome(
                driver
                    .insert(
                        &cx,
                        POSTS,
                        vec![record! { "id" => 1, "title" => "b" }],
                        ConflictPolicy::Update,
                    )
                    .await,
            );
            assert_eq!(updated.replaced, 1);

            let same = unwrap_outcome(
                driver
                    .insert(
                        &cx,
                        POSTS,
                        vec![record! { "id" => 1, "title" => "b" }],
                        ConflictPolicy::Update,
                    )
                    .await,
            );
            assert_eq!(same.unchanged, 1);
        });

        let row = driver.get_row("posts", "id", &Value::Int(1)).expect("row");
        assert_eq!(row.get("title"), Some(&Value::from("b")));
        assert_eq!(row.get("views"), Some(&Value::Int(3)));
    }

    #[test]
    fn predicate_update_and_delete() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = MemoryDriver::new();
        driver.seed(
            "comments",
            vec![
                record! { "id" => 1, "postId" => 7 },
                record! { "id" => 2, "postId" => 7 },
                record! { "id" => 3, "postId" => 8 },
            ],
        );
        let comments = TableRef::new("comments", "id");

        rt.block_on(async {
            let written = unwrap_outcome(
                driver
                    .update(
                        &cx,
                        comments,
                        Target::Matching(Filter::eq("postId", 7)),
                        record! { "postId" => Value::Null },
                    )
                    .await,
            );
            assert_eq!(written.affected, 2);

            let deleted = unwrap_outcome(
                driver
                    .delete(&cx, comments, Target::Matching(Filter::eq("postId", Value::Null)))
                    .await,
            );
            assert_eq!(deleted.deleted, 2);
        });

        assert_eq!(driver.table_rows("comments").len(), 1);
        let writes = driver.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].kind, OperationKind::Update);
        assert_eq!(writes[1].filter, Some(Filter::eq("postId", Value::Null)));
    }

    #[test]
    fn injected_failures_fire_once() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = MemoryDriver::new();
        driver.fail_next(OperationKind::Replace, "posts");

        rt.block_on(async {
            let first = driver.replace(&cx, POSTS, record! { "id" => 1 }).await;
            assert!(matches!(first, Outcome::Err(Error::Driver(_))));
            let second = driver.replace(&cx, POSTS, record! { "id" => 1 }).await;
            assert!(matches!(second, Outcome::Ok(WriteResult { affected: 1 })));
        });

        assert_eq!(driver.count(OperationKind::Replace), 1);
        assert_eq!(driver.table_rows("posts").len(), 1);
    }

    #[test]
    fn storage_messages_become_typed_errors() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = MemoryDriver::new();
        driver.fail_next_with(OperationKind::Query, "posts", "Query timed out after 30s");
        driver.fail_next_with(OperationKind::Get, "posts", "Document not found for key 3");

        rt.block_on(async {
            match driver.query(&cx, POSTS, &Filter::All).await {
                Outcome::Err(err) => assert!(err.is_timeout()),
                other => panic!("expected a timeout, got {other:?}"),
            }
            match driver.get(&cx, POSTS, &Value::Int(3)).await {
                Outcome::Err(err) => assert!(err.is_not_found()),
                other => panic!("expected not found, got {other:?}"),
            }
        });
        assert!(driver.operations().is_empty());
    }

    #[test]
    fn ensure_index_is_idempotent() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = MemoryDriver::new();

        rt.block_on(async {
            let index = IndexSpec::new("postId");
            unwrap_outcome(driver.ensure_index(&cx, POSTS, &index).await);
            unwrap_outcome(driver.ensure_index(&cx, POSTS, &index).await);
        });

        assert_eq!(driver.indexes("posts"), vec![IndexSpec::new("postId")]);
        assert_eq!(driver.count(OperationKind::EnsureIndex), 2);
    }
}
