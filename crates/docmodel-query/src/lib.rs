//! Joined reads for docmodel.
//!
//! `docmodel-query` is the **read layer**. It turns a requested relation
//! shape into a plan of batched fetches and stitches the fetched records
//! into a `DocumentGraph`.
//!
//! # Role In The Architecture
//!
//! - **Shapes**: `JoinShape` names the relations to load, with optional
//!   per-relation filters and nesting.
//! - **Planning**: `JoinPlanner` orders fetch steps so owners are always
//!   loaded before what they own.
//! - **Execution**: `JoinQuery` runs one `In` read per step through any
//!   `StorageDriver` and interns results by identity.
//!
//! Most users reach these through `Session::get_join` in the `docmodel`
//! facade crate.

pub mod execute;
pub mod plan;
pub mod shape;

pub use execute::JoinQuery;
pub use plan::{FetchKind, FetchStep, JoinPlanner, QueryPlan, StepId};
pub use shape::{JoinNode, JoinShape};
