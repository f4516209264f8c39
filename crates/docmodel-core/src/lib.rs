//! Core types and traits for docmodel.
//!
//! This crate provides the foundational abstractions of the document mapper:
//!
//! - `Value` and `Record` for schemaless document data
//! - `FieldRule`/`Schema` and `RecordType` for declared models
//! - `Registry` holding models and the relations between them
//! - `Document` and `DocumentGraph` for in-memory documents and their links
//! - `Validator` for field and graph validation
//! - `StorageDriver` trait for document storage
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod config;
pub mod document;
pub mod driver;
pub mod error;
pub mod field;
pub mod filter;
pub mod model;
pub mod registry;
pub mod relationship;
pub mod validate;
pub mod value;

pub use config::{ExtraFieldsBehavior, OdmConfig, TypeEnforcement, ValidatePolicy};
pub use document::{DocId, Document, DocumentGraph, Link};
pub use driver::{
    ConflictPolicy, DeleteResult, IndexSpec, InsertResult, StorageDriver, TableRef, Target,
    WriteResult,
};
pub use error::{
    ConfigError, CycleError, DriverError, DuplicateKeyError, Error, FieldValidationError,
    InvalidWriteError, JoinError, NotFoundError, PersistenceError, Result, TypeError,
    UnknownRelationError, ValidationError, ValidationErrorKind,
};
pub use field::{DefaultValue, FieldRule, Presence, RuleKind, Schema};
pub use filter::Filter;
pub use model::{DocumentEvent, HookEvent, HookPhase, ModelOptions, RecordType};
pub use registry::{IndexRequest, RESERVED_NAMES, Registry};
pub use relationship::{LINK_PRIMARY_KEY, LinkTable, Relation, RelationKind, RelationOptions};
pub use validate::{ValidateOptions, Validator, matches_pattern};
pub use value::{Record, Value, ValueKey};

/// Unwrap an `Outcome::Ok`, returning every other variant from the
/// enclosing function.
///
/// Errors pass through `Into`, so driver errors convert at the boundary.
#[macro_export]
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ok(value) => value,
            $crate::Outcome::Err(err) => return $crate::Outcome::Err(err.into()),
            $crate::Outcome::Cancelled(reason) => return $crate::Outcome::Cancelled(reason),
            $crate::Outcome::Panicked(payload) => return $crate::Outcome::Panicked(payload),
        }
    };
}
