//! docmodel - relation-aware document mapping over pluggable document stores.
//!
//! docmodel turns schemaless records into live documents and keeps track of
//! the relations between them:
//!
//! - Models declared at runtime with field rules, hooks and listeners
//! - `hasOne`, `belongsTo`, `hasMany` and many-to-many relations
//! - Whole-graph saves in foreign-key order, with link reconciliation
//! - Cascading deletes and predicate purges that leave no dangling keys
//! - Batched joined reads described by a `JoinShape`
//! - Structured concurrency through asupersync
//!
//! # Quick Start
//!
//! ```ignore
//! use docmodel::prelude::*;
//!
//! let mut odm = Odm::new(OdmConfig::default());
//! odm.create_model("Post", Schema::new().field("title", FieldRule::string()), ModelOptions::new())?;
//! odm.create_model("Comment", Schema::new().field("text", FieldRule::string()), ModelOptions::new())?;
//! odm.registry_mut().has_many("Post", "Comment", "comments", "id", "postId")?;
//!
//! let session = odm.connect(MemoryDriver::new());
//! let mut graph = DocumentGraph::new();
//! let post = graph.insert(session.registry().new_document("Post", record! { "title" => "Hello" })?);
//! let comment = graph.insert(session.registry().new_document("Comment", record! { "text" => "First" })?);
//! graph.attach(session.registry(), post, "comments", comment)?;
//!
//! // Inserts the post, then the comment with `postId` set to the post's key
//! session.save_all(cx, &mut graph, post).await;
//!
//! // Reads the post back with its comments
//! let mut fresh = DocumentGraph::new();
//! let loaded = session
//!     .get_join(cx, &mut fresh, "Post", &Value::Int(1), &JoinShape::new().include("comments"))
//!     .await;
//! ```

pub use docmodel_core::{
    ConflictPolicy,
    // asupersync re-exports
    Cx,
    // Documents
    DocId,
    Document,
    DocumentEvent,
    DocumentGraph,
    Error,
    ExtraFieldsBehavior,
    // Models
    FieldRule,
    Filter,
    HookEvent,
    HookPhase,
    IndexSpec,
    Link,
    LinkTable,
    ModelOptions,
    OdmConfig,
    Outcome,
    Record,
    RecordType,
    Registry,
    Relation,
    RelationKind,
    RelationOptions,
    Result,
    Schema,
    // Storage
    StorageDriver,
    TableRef,
    Target,
    TypeEnforcement,
    ValidateOptions,
    ValidatePolicy,
    ValidationError,
    Validator,
    Value,
    record,
    try_outcome,
};

pub use docmodel_memory::{MemoryDriver, Operation, OperationKind};
pub use docmodel_query::{JoinNode, JoinPlanner, JoinQuery, JoinShape, QueryPlan};
pub use docmodel_session::{Cleanup, Session, WriteGraph, WriteStep};

pub mod odm;
pub use odm::Odm;

/// Everything needed to declare models and work with documents.
pub mod prelude {
    pub use crate::{
        ConflictPolicy, Cx, DocId, Document, DocumentEvent, DocumentGraph, Error, FieldRule,
        Filter, HookEvent, JoinShape, Link, MemoryDriver, ModelOptions, Odm, OdmConfig, Outcome,
        Record, Registry, RelationKind, Result, Schema, Session, StorageDriver, ValidatePolicy,
        Value, record,
    };
}
