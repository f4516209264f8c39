//! Storage driver trait.
//!
//! The ODM never speaks a wire protocol itself. Every read and write goes
//! through a [`StorageDriver`], addressed by [`TableRef`]:
//!
//! - point reads by primary key
//! - batched inserts with a conflict policy
//! - replace (upsert by key), partial update and delete, by key or predicate
//! - predicate scans
//! - secondary index management
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! context for proper cancellation and timeout handling.

use crate::error::Error;
use crate::filter::Filter;
use crate::value::{Record, Value};
use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};

/// A table and its primary key field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRef<'a> {
    pub name: &'a str,
    pub primary_key: &'a str,
}

impl<'a> TableRef<'a> {
    pub const fn new(name: &'a str, primary_key: &'a str) -> Self {
        Self { name, primary_key }
    }
}

/// What an insert does when the primary key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Fail with `DuplicatePrimaryKey`
    #[default]
    Error,
    /// Overwrite the stored record
    Replace,
    /// Merge the new fields into the stored record
    Update,
}

/// Which records a write applies to.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Key(Value),
    Matching(Filter),
}

/// Outcome of an insert.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertResult {
    /// Keys generated by storage, in the order of the records that lacked one
    pub generated_keys: Vec<Value>,
    pub inserted: u64,
    pub replaced: u64,
    pub unchanged: u64,
}

/// Outcome of a replace or update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteResult {
    pub affected: u64,
}

/// Outcome of a delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteResult {
    pub deleted: u64,
}

/// A secondary index request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    /// Indexed fields; more than one makes a compound index
    pub fields: Vec<String>,
    /// Index each element of an array field
    pub multi: bool,
}

impl IndexSpec {
    /// Single-field index named after the field.
    pub fn new(field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            name: field.clone(),
            fields: vec![field],
            multi: false,
        }
    }

    /// Compound index over several fields.
    pub fn compound(name: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            name: name.into(),
            fields,
            multi: false,
        }
    }

    #[must_use]
    pub fn multi(mut self, multi: bool) -> Self {
        self.multi = multi;
        self
    }
}

/// A connection to document storage.
pub trait StorageDriver: Send + Sync {
    /// Read one record by primary key.
    fn get(
        &self,
        cx: &Cx,
        table: TableRef<'_>,
        key: &Value,
    ) -> impl Future<Output = Outcome<Option<Record>, Error>> + Send;

    /// Insert records. Records without a primary key get a generated one.
    fn insert(
        &self,
        cx: &Cx,
        table: TableRef<'_>,
        records: Vec<Record>,
        conflict: ConflictPolicy,
    ) -> impl Future<Output = Outcome<InsertResult, Error>> + Send;

    /// Write a whole record, inserting it if the key is absent.
    fn replace(
        &self,
        cx: &Cx,
        table: TableRef<'_>,
        record: Record,
    ) -> impl Future<Output = Outcome<WriteResult, Error>> + Send;

    /// Merge `patch` into the targeted records.
    fn update(
        &self,
        cx: &Cx,
        table: TableRef<'_>,
        target: Target,
        patch: Record,
    ) -> impl Future<Output = Outcome<WriteResult, Error>> + Send;

    /// Delete the targeted records.
    fn delete(
        &self,
        cx: &Cx,
        table: TableRef<'_>,
        target: Target,
    ) -> impl Future<Output = Outcome<DeleteResult, Error>> + Send;

    /// Read every record matching `filter`.
    fn query(
        &self,
        cx: &Cx,
        table: TableRef<'_>,
        filter: &Filter,
    ) -> impl Future<Output = Outcome<Vec<Record>, Error>> + Send;

    /// Create a secondary index if it does not exist.
    fn ensure_index(
        &self,
        cx: &Cx,
        table: TableRef<'_>,
        index: &IndexSpec,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;
}
