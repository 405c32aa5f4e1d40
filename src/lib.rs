//! # reltree - relational-algebra trees for multi-backend queries
//!
//! An embeddable relational-algebra engine: queries are immutable trees of
//! relational operations, and a rule-based optimizer rewrites them while
//! preserving semantics. A single tree may span multiple execution engines
//! (an in-memory iteration engine and a SQL engine are provided), connected
//! by explicit `Transfer` nodes.
//!
//! ## Pipeline
//!
//! ```text
//! leaves (engine payloads)
//!     ↓
//! [operation apply]      → validated, simplified relation tree
//!     ↓                    (merging, identity elimination, pushdown
//!     ↓                     toward preferred engines)
//! [backend converter]    → e.g. sqlparser AST for the SQL engine
//! ```
//!
//! Trees are built bottom-up by applying operations to relations; each
//! `apply` validates columns and engines, simplifies locally (back-to-back
//! sorts, slices, selections, and projections always merge), and - given a
//! preferred engine - tries to commute the new operation upstream past
//! existing ones rather than inserting a `Transfer`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use reltree::{iteration, ColumnExpression, ColumnTag, EngineRef, Predicate};
//!
//! let engine = EngineRef::new(iteration::IterationEngine::new("iteration"));
//! let a = ColumnTag::key("a");
//!
//! let base = iteration::make_leaf(&engine, "base", columns, rows);
//! let filtered = base.selected(Predicate::function(
//!     "gt",
//!     vec![
//!         ColumnExpression::reference(a),
//!         ColumnExpression::literal(0i64),
//!     ],
//! ))?;
//! println!("{filtered}"); // σ[a>0](base_0000_…)
//! ```
//!
//! The optimizer never executes relations - engines do, outside this crate.
//! Doomed relations (statically empty) are preserved for diagnostics, never
//! elided.

pub mod column;
pub mod engine;
pub mod error;
pub mod iteration;
pub mod operations;
pub mod relation;
pub mod sql;

pub use column::{ColumnExpression, ColumnSet, ColumnTag, Predicate, Value};
pub use engine::{Engine, EnginePayload, EngineRef, GenericEngine, OrderedOperation, Payload};
pub use error::{RelationError, Result};
pub use operations::{
    ApplyOptions, BinaryOperation, Calculation, Chain, Deduplication, Join, Materialization,
    PartialJoin, Projection, Selection, Slice, Sort, SortTerm, Transfer, UnaryOperation,
};
pub use relation::{
    BinaryOperationRelation, LeafRelation, Relation, RelationNode, UnaryOperationRelation,
};
