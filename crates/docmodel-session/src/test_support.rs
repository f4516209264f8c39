//! Drivers shared by the unit tests.

use asupersync::{Cx, Outcome};
use docmodel_core::{
    ConflictPolicy, DeleteResult, Error, Filter, IndexSpec, InsertResult, Record, StorageDriver,
    TableRef, Target, Value, WriteResult,
};
use std::future::Future;

/// Driver that accepts every call and stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct NullDriver;

impl StorageDriver for NullDriver {
    fn get(
        &self,
        _cx: &Cx,
        _table: TableRef<'_>,
        _key: &Value,
    ) -> impl Future<Output = Outcome<Option<Record>, Error>> + Send {
        async { Outcome::Ok(None) }
    }

    fn insert(
        &self,
        _cx: &Cx,
        _table: TableRef<'_>,
        _records: Vec<Record>,
        _conflict: ConflictPolicy,
    ) -> impl Future<Output = Outcome<InsertResult, Error>> + Send {
        async { Outcome::Ok(InsertResult::default()) }
    }

    fn replace(
        &self,
        _cx: &Cx,
        _table: TableRef<'_>,
        _record: Record,
    ) -> impl Future<Output = Outcome<WriteResult, Error>> + Send {
        async { Outcome::Ok(WriteResult::default()) }
    }

    fn update(
        &self,
        _cx: &Cx,
        _table: TableRef<'_>,
        _target: Target,
        _patch: Record,
    ) -> impl Future<Output = Outcome<WriteResult, Error>> + Send {
        async { Outcome::Ok(WriteResult::default()) }
    }

    fn delete(
        &self,
        _cx: &Cx,
        _table: TableRef<'_>,
        _target: Target,
    ) -> impl Future<Output = Outcome<DeleteResult, Error>> + Send {
        async { Outcome::Ok(DeleteResult::default()) }
    }

    fn query(
        &self,
        _cx: &Cx,
        _table: TableRef<'_>,
        _filter: &Filter,
    ) -> impl Future<Output = Outcome<Vec<Record>, Error>> + Send {
        async { Outcome::Ok(Vec::new()) }
    }

    fn ensure_index(
        &self,
        _cx: &Cx,
        _table: TableRef<'_>,
        _index: &IndexSpec,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        async { Outcome::Ok(()) }
    }
}
