//! # Iteration engine
//!
//! The in-memory reference backend: relations are sequences or keyed
//! mappings of rows held directly in leaf payloads. Execution of operation
//! trees over these rows is a processor concern and lives outside the
//! core; this module supplies the engine identity, its order policy, and
//! the payload types.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::column::{ColumnSet, ColumnTag, Value};
use crate::engine::{Engine, EngineRef, GenericEngine, OrderedOperation, Payload};
use crate::error::{RelationError, Result};
use crate::operations::UnaryOperation;
use crate::relation::Relation;

/// A single row: column tag to value.
pub type Row = BTreeMap<ColumnTag, Value>;

/// Engine-specific function type: a scalar over row values.
pub type RowFunction = fn(&[Value]) -> Value;

// ============================================================================
// Payloads
// ============================================================================

/// An ordered sequence of rows; duplicates allowed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RowSequence {
    rows: Vec<Row>,
}

impl RowSequence {
    pub fn new(rows: Vec<Row>) -> Self {
        RowSequence { rows }
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Convert to a mapping keyed on `unique_key`; later rows win on key
    /// collisions, so the result has unique rows.
    pub fn to_mapping(&self, unique_key: Vec<ColumnTag>) -> Result<RowMapping> {
        let mut rows = HashMap::with_capacity(self.rows.len());
        for row in &self.rows {
            let key = mapping_key(row, &unique_key)?;
            rows.insert(key, row.clone());
        }
        Ok(RowMapping { unique_key, rows })
    }
}

/// Rows keyed by the values of a unique key; inherently duplicate-free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowMapping {
    unique_key: Vec<ColumnTag>,
    rows: HashMap<Vec<Value>, Row>,
}

impl RowMapping {
    pub fn unique_key(&self) -> &[ColumnTag] {
        &self.unique_key
    }

    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &[Value]) -> Option<&Row> {
        self.rows.get(key)
    }
}

fn mapping_key(row: &Row, unique_key: &[ColumnTag]) -> Result<Vec<Value>> {
    unique_key
        .iter()
        .map(|tag| {
            row.get(tag).cloned().ok_or_else(|| {
                RelationError::Column(format!("row is missing unique key column {tag}"))
            })
        })
        .collect()
}

// ============================================================================
// Engine
// ============================================================================

/// The in-memory engine identity.
#[derive(Debug)]
pub struct IterationEngine {
    generic: GenericEngine<RowFunction>,
}

impl IterationEngine {
    pub fn new(name: impl Into<String>) -> Self {
        IterationEngine {
            generic: GenericEngine::new(name),
        }
    }

    pub fn with_functions(
        name: impl Into<String>,
        functions: HashMap<String, RowFunction>,
    ) -> Self {
        IterationEngine {
            generic: GenericEngine::with_functions(name, functions),
        }
    }

    pub fn get_function(&self, name: &str) -> Option<&RowFunction> {
        self.generic.get_function(name)
    }
}

impl Engine for IterationEngine {
    fn name(&self) -> &str {
        self.generic.name()
    }

    fn get_relation_name(&self, prefix: &str) -> String {
        self.generic.get_relation_name(prefix)
    }

    /// Rows are processed sequentially, so every operation preserves order
    /// except reorderings (which impose their own) and transfers into an
    /// engine that does not.
    fn preserves_order(&self, operation: OrderedOperation<'_>) -> bool {
        match operation {
            OrderedOperation::Unary(UnaryOperation::Sort(_) | UnaryOperation::Reordering(_)) => {
                false
            }
            OrderedOperation::Unary(UnaryOperation::Transfer(transfer)) => {
                if transfer.destination().refers_to(self) {
                    true
                } else {
                    transfer.destination().preserves_order(operation)
                }
            }
            _ => true,
        }
    }

    fn supports_function(&self, name: &str) -> bool {
        self.generic.supports_function(name)
    }

    fn get_join_identity_payload(&self) -> Option<Payload> {
        Some(Arc::new(RowSequence::new(vec![Row::new()])))
    }

    fn get_doomed_payload(&self, _columns: &ColumnSet) -> Option<Payload> {
        Some(Arc::new(RowSequence::default()))
    }
}

/// Create a leaf relation holding the given rows; row bounds are exact.
pub fn make_leaf(
    engine: &EngineRef,
    name_prefix: &str,
    columns: ColumnSet,
    rows: RowSequence,
) -> Relation {
    let count = rows.len() as u64;
    Relation::leaf(
        engine.clone(),
        engine.get_relation_name(name_prefix),
        columns,
        Some(Arc::new(rows)),
        count,
        Some(count),
    )
}

/// Create a leaf relation holding a keyed mapping; row bounds are exact.
pub fn make_mapping_leaf(
    engine: &EngineRef,
    name_prefix: &str,
    columns: ColumnSet,
    rows: RowMapping,
) -> Relation {
    let count = rows.len() as u64;
    Relation::leaf(
        engine.clone(),
        engine.get_relation_name(name_prefix),
        columns,
        Some(Arc::new(rows)),
        count,
        Some(count),
    )
}

// ============================================================================
// Tests
// ============================================================================
