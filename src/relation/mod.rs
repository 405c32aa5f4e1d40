//! # Relation trees
//!
//! A [`Relation`] is a node in an immutable query tree: a leaf holding
//! engine-specific content, a unary operation applied to a target, or a
//! binary operation applied to a pair of targets. Trees are shared through
//! cheap handle clones and may form DAGs; rewrites always build fresh nodes
//! that share untouched subtrees with the original.
//!
//! Relations are only ever constructed through operation `apply` methods
//! (or the convenience methods here, which call them); direct node
//! construction cannot uphold the operation invariants.

use std::fmt;
use std::sync::Arc;

use crate::column::{display_columns, ColumnExpression, ColumnSet, ColumnTag, Predicate};
use crate::engine::{EngineRef, OrderedOperation, Payload};
use crate::error::{RelationError, Result};
use crate::operations::{
    ApplyOptions, BinaryOperation, Calculation, Chain, Deduplication, Join, Materialization,
    Projection, Selection, Slice, Sort, SortTerm, Transfer, UnaryOperation,
};

// ============================================================================
// Node types
// ============================================================================

/// A leaf relation: explicit columns and row bounds, engine-specific payload.
#[derive(Debug)]
pub struct LeafRelation {
    pub engine: EngineRef,
    pub name: String,
    pub columns: ColumnSet,
    pub payload: Option<Payload>,
    pub min_rows: u64,
    pub max_rows: Option<u64>,
    /// Diagnostic messages, typically explaining why a doomed relation has
    /// no rows. Preserved through the tree rather than elided.
    pub messages: Vec<String>,
}

/// The action of a [`UnaryOperation`] on a target relation.
#[derive(Debug)]
pub struct UnaryOperationRelation {
    pub operation: UnaryOperation,
    pub target: Relation,
    pub columns: ColumnSet,
    /// Engine-specific contents; `None` for every operation except
    /// `Materialization`, where processors cache results.
    pub payload: Option<Payload>,
    pub is_locked: bool,
}

/// The action of a [`BinaryOperation`] on a pair of target relations.
#[derive(Debug)]
pub struct BinaryOperationRelation {
    pub operation: BinaryOperation,
    pub lhs: Relation,
    pub rhs: Relation,
    pub columns: ColumnSet,
    pub is_locked: bool,
}

/// The three relation shapes. Public so that backends and tree-walking
/// algorithms can pattern-match on structure.
#[derive(Debug)]
pub enum RelationNode {
    Leaf(LeafRelation),
    Unary(UnaryOperationRelation),
    Binary(BinaryOperationRelation),
}

// ============================================================================
// Relation handle
// ============================================================================

/// Shared handle to an immutable relation-tree node.
#[derive(Clone)]
pub struct Relation {
    node: Arc<RelationNode>,
}

impl Relation {
    pub(crate) fn from_node(node: RelationNode) -> Relation {
        Relation {
            node: Arc::new(node),
        }
    }

    /// The underlying node, for structural pattern matching.
    pub fn node(&self) -> &RelationNode {
        &self.node
    }

    /// Whether two handles point at the same node (not just equal trees).
    pub fn same_node(&self, other: &Relation) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    // ------------------------------------------------------------------
    // Leaf constructors
    // ------------------------------------------------------------------

    /// Create a leaf relation. An empty `name` is replaced by a generated
    /// one (`Engine::get_relation_name("leaf")`).
    pub fn leaf(
        engine: EngineRef,
        name: impl Into<String>,
        columns: ColumnSet,
        payload: Option<Payload>,
        min_rows: u64,
        max_rows: Option<u64>,
    ) -> Relation {
        let mut name = name.into();
        if name.is_empty() {
            name = engine.get_relation_name("leaf");
        }
        Relation::from_node(RelationNode::Leaf(LeafRelation {
            engine,
            name,
            columns,
            payload,
            min_rows,
            max_rows,
            messages: Vec::new(),
        }))
    }

    /// The join identity: no columns, exactly one row. A neutral element
    /// for `Join`.
    pub fn join_identity(engine: EngineRef) -> Relation {
        let payload = engine.get_join_identity_payload();
        let name = engine.get_relation_name("identity");
        Relation::from_node(RelationNode::Leaf(LeafRelation {
            engine,
            name,
            columns: ColumnSet::new(),
            payload,
            min_rows: 1,
            max_rows: Some(1),
            messages: Vec::new(),
        }))
    }

    /// A relation statically known to have no rows, with diagnostic
    /// messages explaining why. Doomed relations are preserved, not elided.
    pub fn doomed(engine: EngineRef, columns: ColumnSet, messages: Vec<String>) -> Relation {
        let payload = engine.get_doomed_payload(&columns);
        let name = engine.get_relation_name("doomed");
        Relation::from_node(RelationNode::Leaf(LeafRelation {
            engine,
            name,
            columns,
            payload,
            min_rows: 0,
            max_rows: Some(0),
            messages,
        }))
    }

    // ------------------------------------------------------------------
    // Derived attributes
    // ------------------------------------------------------------------

    /// The engine responsible for interpreting this relation.
    pub fn engine(&self) -> EngineRef {
        match self.node() {
            RelationNode::Leaf(leaf) => leaf.engine.clone(),
            RelationNode::Unary(rel) => rel.operation.applied_engine(&rel.target),
            RelationNode::Binary(rel) => rel.operation.applied_engine(&rel.lhs, &rel.rhs),
        }
    }

    /// The columns in this relation.
    pub fn columns(&self) -> &ColumnSet {
        match self.node() {
            RelationNode::Leaf(leaf) => &leaf.columns,
            RelationNode::Unary(rel) => &rel.columns,
            RelationNode::Binary(rel) => &rel.columns,
        }
    }

    /// The minimum number of rows this relation might have.
    pub fn min_rows(&self) -> u64 {
        match self.node() {
            RelationNode::Leaf(leaf) => leaf.min_rows,
            RelationNode::Unary(rel) => rel.operation.applied_min_rows(&rel.target),
            RelationNode::Binary(rel) => rel.operation.applied_min_rows(&rel.lhs, &rel.rhs),
        }
    }

    /// The maximum number of rows this relation might have; `None` when
    /// unbounded.
    pub fn max_rows(&self) -> Option<u64> {
        match self.node() {
            RelationNode::Leaf(leaf) => leaf.max_rows,
            RelationNode::Unary(rel) => rel.operation.applied_max_rows(&rel.target),
            RelationNode::Binary(rel) => rel.operation.applied_max_rows(&rel.lhs, &rel.rhs),
        }
    }

    /// The engine-specific contents of this relation; always `None` except
    /// on leaves and materializations.
    pub fn payload(&self) -> Option<&Payload> {
        match self.node() {
            RelationNode::Leaf(leaf) => leaf.payload.as_ref(),
            RelationNode::Unary(rel) => rel.payload.as_ref(),
            RelationNode::Binary(_) => None,
        }
    }

    /// Whether tree-manipulation algorithms must treat this relation and
    /// everything upstream of it as fixed.
    pub fn is_locked(&self) -> bool {
        match self.node() {
            RelationNode::Leaf(_) => true,
            RelationNode::Unary(rel) => rel.is_locked,
            RelationNode::Binary(rel) => rel.is_locked,
        }
    }

    /// Whether this is the join identity: no columns and exactly one row.
    pub fn is_join_identity(&self) -> bool {
        self.columns().is_empty() && self.min_rows() == 1 && self.max_rows() == Some(1)
    }

    // ------------------------------------------------------------------
    // Row-order guard
    // ------------------------------------------------------------------

    /// Assert that this relation's row order is not meaningful.
    ///
    /// With `Some(message)`, finding an upstream `Sort` whose ordering
    /// still propagates to this relation raises
    /// [`RelationError::RowOrder`]. With `None`, such sorts are removed
    /// and the operations above them rebuilt.
    pub fn expect_unordered(&self, message: Option<&str>) -> Result<Relation> {
        match self.node() {
            RelationNode::Unary(rel) => match &rel.operation {
                UnaryOperation::Sort(_) | UnaryOperation::Reordering(_) => match message {
                    Some(text) => Err(RelationError::RowOrder(text.to_string())),
                    None => rel.target.expect_unordered(None),
                },
                operation
                    if self
                        .engine()
                        .preserves_order(OrderedOperation::Unary(operation)) =>
                {
                    let new_target = rel.target.expect_unordered(message)?;
                    if new_target.same_node(&rel.target) {
                        Ok(self.clone())
                    } else {
                        Ok(Relation::from_node(RelationNode::Unary(
                            UnaryOperationRelation {
                                operation: rel.operation.clone(),
                                columns: rel.operation.applied_columns(&new_target),
                                target: new_target,
                                payload: None,
                                is_locked: rel.is_locked,
                            },
                        )))
                    }
                }
                _ => Ok(self.clone()),
            },
            RelationNode::Binary(rel)
                if matches!(rel.operation, BinaryOperation::Chain(_))
                    && self.engine().preserves_order(OrderedOperation::Chain) =>
            {
                let new_lhs = rel.lhs.expect_unordered(message)?;
                let new_rhs = rel.rhs.expect_unordered(message)?;
                if new_lhs.same_node(&rel.lhs) && new_rhs.same_node(&rel.rhs) {
                    Ok(self.clone())
                } else {
                    Ok(Relation::from_node(RelationNode::Binary(
                        BinaryOperationRelation {
                            operation: rel.operation.clone(),
                            columns: rel.operation.applied_columns(&new_lhs, &new_rhs),
                            lhs: new_lhs,
                            rhs: new_rhs,
                            is_locked: rel.is_locked,
                        },
                    )))
                }
            }
            _ => Ok(self.clone()),
        }
    }

    // ------------------------------------------------------------------
    // Convenience operations (default apply options)
    // ------------------------------------------------------------------

    /// Add a calculated column; see [`Calculation`].
    pub fn calculated(&self, tag: ColumnTag, expression: ColumnExpression) -> Result<Relation> {
        Calculation::new(tag, expression)?.apply(self, &ApplyOptions::default())
    }

    /// Keep only the given columns; see [`Projection`].
    pub fn with_only_columns(&self, columns: ColumnSet) -> Result<Relation> {
        Projection::new(columns).apply(self, &ApplyOptions::default())
    }

    /// Keep only rows satisfying `predicate`; see [`Selection`].
    pub fn selected(&self, predicate: Predicate) -> Result<Relation> {
        Selection::new(predicate).apply(self, &ApplyOptions::default())
    }

    /// Remove duplicate rows; see [`Deduplication`].
    pub fn without_duplicates(&self) -> Result<Relation> {
        Deduplication::new().apply(self, &ApplyOptions::default())
    }

    /// Order rows by the given terms; see [`Sort`].
    pub fn sorted(&self, terms: Vec<SortTerm>) -> Result<Relation> {
        Sort::new(terms).apply(self, &ApplyOptions::default())
    }

    /// Keep only rows in the positional range `[start, stop)`; see
    /// [`Slice`].
    pub fn sliced(&self, start: u64, stop: Option<u64>) -> Result<Relation> {
        Slice::new(start, stop).apply(self, false)
    }

    /// Mark the upstream tree for single evaluation and reuse; see
    /// [`Materialization`].
    pub fn materialized(&self, name: Option<String>) -> Result<Relation> {
        let operation = match name {
            Some(name) => Materialization::named(name),
            None => Materialization::new(),
        };
        operation.apply(self, "materialization", true, false)
    }

    /// Move this relation's content to another engine; see [`Transfer`].
    pub fn transferred_to(&self, destination: EngineRef) -> Result<Relation> {
        Transfer::new(destination).apply(self, false, false)
    }

    /// Concatenate with another relation of the same columns and engine;
    /// see [`Chain`].
    pub fn chained(&self, rhs: &Relation) -> Result<Relation> {
        Chain.apply(self, rhs, false, false)
    }

    /// Natural join with automatic common-column resolution; see [`Join`].
    pub fn natural_join(&self, rhs: &Relation) -> Result<Relation> {
        Join::new(Predicate::literal(true)).apply(self, rhs, false, false)
    }
}

impl PartialEq for Relation {
    /// Structural equality; `payload`, `columns`, and `is_locked` are not
    /// part of a relation's identity.
    fn eq(&self, other: &Self) -> bool {
        if self.same_node(other) {
            return true;
        }
        match (self.node(), other.node()) {
            (RelationNode::Leaf(a), RelationNode::Leaf(b)) => {
                a.engine == b.engine
                    && a.name == b.name
                    && a.min_rows == b.min_rows
                    && a.max_rows == b.max_rows
            }
            (RelationNode::Unary(a), RelationNode::Unary(b)) => {
                a.operation == b.operation && a.target == b.target
            }
            (RelationNode::Binary(a), RelationNode::Binary(b)) => {
                a.operation == b.operation && a.lhs == b.lhs && a.rhs == b.rhs
            }
            _ => false,
        }
    }
}

impl Eq for Relation {}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node() {
            RelationNode::Leaf(leaf) => f.write_str(&leaf.name),
            RelationNode::Unary(rel) => write!(f, "{}({})", rel.operation, rel.target),
            RelationNode::Binary(rel) => {
                let lhs = binary_operand(&rel.lhs, &rel.operation);
                let rhs = binary_operand(&rel.rhs, &rel.operation);
                write!(f, "{lhs} {} {rhs}", rel.operation)
            }
        }
    }
}

impl fmt::Debug for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Relation({self}; columns=[{}], rows={}..{})",
            display_columns(self.columns()),
            self.min_rows(),
            match self.max_rows() {
                Some(max) => max.to_string(),
                None => String::new(),
            }
        )
    }
}

/// Parenthesize binary operands unless they are leaves or chained uses of
/// the same operator.
fn binary_operand(operand: &Relation, operation: &BinaryOperation) -> String {
    match operand.node() {
        RelationNode::Leaf(_) => operand.to_string(),
        RelationNode::Binary(inner)
            if std::mem::discriminant(&inner.operation) == std::mem::discriminant(operation) =>
        {
            operand.to_string()
        }
        _ => format!("({operand})"),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iteration::IterationEngine;

    fn engine() -> EngineRef {
        EngineRef::new(IterationEngine::new("iteration"))
    }

    fn tags(names: &[&str]) -> ColumnSet {
        names.iter().map(|n| ColumnTag::key(*n)).collect()
    }

    #[test]
    fn test_leaf_attributes() {
        let engine = engine();
        let leaf = Relation::leaf(engine.clone(), "base", tags(&["a", "b"]), None, 2, Some(5));
        assert_eq!(leaf.engine(), engine);
        assert_eq!(leaf.columns(), &tags(&["a", "b"]));
        assert_eq!(leaf.min_rows(), 2);
        assert_eq!(leaf.max_rows(), Some(5));
        assert!(leaf.is_locked());
        assert!(!leaf.is_join_identity());
        assert_eq!(leaf.to_string(), "base");
    }

    #[test]
    fn test_leaf_name_generated_when_empty() {
        let leaf = Relation::leaf(engine(), "", tags(&["a"]), None, 0, None);
        match leaf.node() {
            RelationNode::Leaf(inner) => assert!(inner.name.starts_with("leaf_0000_")),
            _ => panic!("expected a leaf"),
        }
    }

    #[test]
    fn test_join_identity_relation() {
        let identity = Relation::join_identity(engine());
        assert!(identity.is_join_identity());
        assert_eq!(identity.min_rows(), 1);
        assert_eq!(identity.max_rows(), Some(1));
        assert!(identity.columns().is_empty());
    }

    #[test]
    fn test_doomed_relation_preserves_messages() {
        let doomed = Relation::doomed(
            engine(),
            tags(&["a"]),
            vec!["left side of chain was empty".to_string()],
        );
        assert_eq!(doomed.min_rows(), 0);
        assert_eq!(doomed.max_rows(), Some(0));
        match doomed.node() {
            RelationNode::Leaf(leaf) => assert_eq!(leaf.messages.len(), 1),
            _ => panic!("expected a leaf"),
        }
    }

    #[test]
    fn test_structural_equality_ignores_payload() {
        let engine = engine();
        let a = Relation::leaf(engine.clone(), "t", tags(&["a"]), None, 0, None);
        let b = Relation::leaf(
            engine.clone(),
            "t",
            tags(&["a"]),
            Some(Arc::new(42u64)),
            0,
            None,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_equality_distinguishes_engines() {
        let a = Relation::leaf(engine(), "t", tags(&["a"]), None, 0, None);
        let b = Relation::leaf(engine(), "t", tags(&["a"]), None, 0, None);
        assert_ne!(a, b);
    }
}
