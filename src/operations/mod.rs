//! # Operation algebra
//!
//! The closed set of relational operations. [`UnaryOperation`] and
//! [`BinaryOperation`] are tagged sums; three narrow traits
//! ([`MarkerOperation`], [`RowFilterOperation`], [`ReorderingOperation`])
//! are the only extension points, and the commutation optimizer reads
//! nothing from an operation beyond its four algebraic property bits and
//! its required columns, so extensions commute by the same rules.
//!
//! Operations are applied with their `apply` methods, never by constructing
//! relation nodes directly: `apply` validates columns and engines, applies
//! local simplifications (identity elimination, back-to-back merging), and
//! runs the backtracking optimizer when a preferred engine is given.

use std::fmt;
use std::sync::Arc;

use crate::column::ColumnSet;
use crate::engine::EngineRef;
use crate::relation::{
    BinaryOperationRelation, Relation, RelationNode, UnaryOperationRelation,
};

mod calculation;
mod chain;
mod deduplication;
mod join;
mod materialization;
mod projection;
mod selection;
mod slice;
mod sort;
mod transfer;

pub use calculation::Calculation;
pub use chain::Chain;
pub use deduplication::Deduplication;
pub use join::{Join, PartialJoin};
pub use materialization::Materialization;
pub use projection::Projection;
pub use selection::Selection;
pub use slice::Slice;
pub use sort::{Sort, SortTerm};
pub use transfer::Transfer;

// ============================================================================
// Apply options
// ============================================================================

/// Options accepted by every non-trivial unary `apply`.
///
/// When `preferred_engine` is set and differs from the target's engine,
/// `backtrack` attempts to insert the operation upstream past commutable
/// operations; failing that, `transfer` prepends a [`Transfer`], and
/// failing that, `require_preferred_engine` turns the miss into an error.
#[derive(Clone, Debug)]
pub struct ApplyOptions {
    pub preferred_engine: Option<EngineRef>,
    pub backtrack: bool,
    pub transfer: bool,
    pub require_preferred_engine: bool,
    /// Set `is_locked` on the resulting relation.
    pub lock: bool,
    /// Remove upstream sorts whose ordering this operation would discard,
    /// instead of raising `RowOrder`.
    pub strip_ordering: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        ApplyOptions {
            preferred_engine: None,
            backtrack: true,
            transfer: false,
            require_preferred_engine: false,
            lock: false,
            strip_ordering: false,
        }
    }
}

impl ApplyOptions {
    /// Options carrying only the `lock` bit; used when operations re-apply
    /// themselves or each other during simplification and backtracking.
    pub(crate) fn lock_only(lock: bool) -> Self {
        ApplyOptions {
            lock,
            ..ApplyOptions::default()
        }
    }
}

// ============================================================================
// Extension traits
// ============================================================================

/// An extension operation that changes neither the rows nor the columns of
/// its target (like `Materialization` and `Transfer`).
pub trait MarkerOperation: fmt::Debug + fmt::Display + Send + Sync {}

/// An extension operation that only removes rows (like `Selection` and
/// `Slice`).
pub trait RowFilterOperation: fmt::Debug + fmt::Display + Send + Sync {
    fn columns_required(&self) -> ColumnSet {
        ColumnSet::new()
    }

    /// Whether this filter can never turn a non-empty relation empty.
    fn is_empty_invariant(&self) -> bool {
        false
    }

    /// Whether the rows kept depend on the input row order.
    fn is_order_dependent(&self) -> bool;

    /// Whether the rows kept depend on the input row count.
    fn is_count_dependent(&self) -> bool {
        false
    }
}

/// An extension operation that only reorders rows (like `Sort`).
pub trait ReorderingOperation: fmt::Debug + fmt::Display + Send + Sync {
    fn columns_required(&self) -> ColumnSet {
        ColumnSet::new()
    }
}

// ============================================================================
// UnaryOperation
// ============================================================================

/// An operation acting on a single relation.
///
/// `Identity` and `PartialJoin` never appear in constructed relation nodes;
/// their `apply` methods always return something else.
#[derive(Debug, Clone)]
pub enum UnaryOperation {
    Calculation(Calculation),
    Projection(Projection),
    Selection(Selection),
    Deduplication(Deduplication),
    Sort(Sort),
    Slice(Slice),
    Materialization(Materialization),
    Transfer(Transfer),
    Identity,
    PartialJoin(PartialJoin),
    /// User-defined marker operation.
    Marker(Arc<dyn MarkerOperation>),
    /// User-defined row filter.
    RowFilter(Arc<dyn RowFilterOperation>),
    /// User-defined reordering.
    Reordering(Arc<dyn ReorderingOperation>),
}

impl UnaryOperation {
    /// The columns the target relation must have for this operation to be
    /// applied to it.
    pub fn columns_required(&self) -> ColumnSet {
        match self {
            UnaryOperation::Calculation(op) => op.columns_required(),
            UnaryOperation::Projection(op) => op.columns().clone(),
            UnaryOperation::Selection(op) => op.predicate().columns_required(),
            UnaryOperation::Deduplication(op) => op.columns_required(),
            UnaryOperation::Sort(op) => op.columns_required(),
            UnaryOperation::Slice(_)
            | UnaryOperation::Materialization(_)
            | UnaryOperation::Transfer(_)
            | UnaryOperation::Identity => ColumnSet::new(),
            UnaryOperation::PartialJoin(op) => op.columns_required(),
            UnaryOperation::Marker(_) => ColumnSet::new(),
            UnaryOperation::RowFilter(op) => op.columns_required(),
            UnaryOperation::Reordering(op) => op.columns_required(),
        }
    }

    /// Whether this operation can never turn a non-empty target empty.
    pub fn is_empty_invariant(&self) -> bool {
        match self {
            UnaryOperation::Calculation(_)
            | UnaryOperation::Projection(_)
            | UnaryOperation::Deduplication(_)
            | UnaryOperation::Sort(_)
            | UnaryOperation::Materialization(_)
            | UnaryOperation::Transfer(_)
            | UnaryOperation::Identity
            | UnaryOperation::Marker(_)
            | UnaryOperation::Reordering(_) => true,
            UnaryOperation::Selection(_) | UnaryOperation::Slice(_) => false,
            UnaryOperation::PartialJoin(_) => false,
            UnaryOperation::RowFilter(op) => op.is_empty_invariant(),
        }
    }

    /// Whether this operation can never change the (multiset) row count.
    pub fn is_count_invariant(&self) -> bool {
        match self {
            UnaryOperation::Calculation(_)
            | UnaryOperation::Projection(_)
            | UnaryOperation::Sort(_)
            | UnaryOperation::Materialization(_)
            | UnaryOperation::Transfer(_)
            | UnaryOperation::Identity
            | UnaryOperation::Marker(_)
            | UnaryOperation::Reordering(_) => true,
            UnaryOperation::Selection(_)
            | UnaryOperation::Deduplication(_)
            | UnaryOperation::Slice(_)
            | UnaryOperation::PartialJoin(_)
            | UnaryOperation::RowFilter(_) => false,
        }
    }

    /// Whether this operation's result depends on the input row order.
    pub fn is_order_dependent(&self) -> bool {
        match self {
            UnaryOperation::Slice(_) => true,
            UnaryOperation::RowFilter(op) => op.is_order_dependent(),
            _ => false,
        }
    }

    /// Whether this operation's result depends on the input row count.
    pub fn is_count_dependent(&self) -> bool {
        match self {
            UnaryOperation::Slice(_) => true,
            UnaryOperation::RowFilter(op) => op.is_count_dependent(),
            _ => false,
        }
    }

    /// Engine of the relation that results from applying this operation.
    pub fn applied_engine(&self, target: &Relation) -> EngineRef {
        match self {
            UnaryOperation::Transfer(op) => op.destination().clone(),
            UnaryOperation::PartialJoin(op) => op.fixed().engine(),
            _ => target.engine(),
        }
    }

    /// Columns of the relation that results from applying this operation.
    pub fn applied_columns(&self, target: &Relation) -> ColumnSet {
        match self {
            UnaryOperation::Calculation(op) => {
                let mut columns = target.columns().clone();
                columns.insert(op.tag().clone());
                columns
            }
            UnaryOperation::Projection(op) => op.columns().clone(),
            UnaryOperation::PartialJoin(op) => op.applied_columns(target),
            _ => target.columns().clone(),
        }
    }

    /// Minimum rows of the relation that results from applying this
    /// operation.
    pub fn applied_min_rows(&self, target: &Relation) -> u64 {
        match self {
            UnaryOperation::Selection(_) => 0,
            UnaryOperation::Deduplication(_) => {
                if target.min_rows() == 0 {
                    0
                } else {
                    1
                }
            }
            UnaryOperation::Slice(op) => op.applied_min_rows(target),
            UnaryOperation::PartialJoin(op) => op.applied_min_rows(target),
            UnaryOperation::RowFilter(op) => {
                // Row filters can only remove rows; an empty-invariant one
                // leaves at least one row of a non-empty target.
                if target.min_rows() == 0 {
                    0
                } else if op.is_empty_invariant() {
                    1
                } else {
                    0
                }
            }
            _ => target.min_rows(),
        }
    }

    /// Maximum rows of the relation that results from applying this
    /// operation.
    pub fn applied_max_rows(&self, target: &Relation) -> Option<u64> {
        match self {
            UnaryOperation::Slice(op) => op.applied_max_rows(target),
            UnaryOperation::PartialJoin(op) => op.applied_max_rows(target),
            _ => target.max_rows(),
        }
    }

    /// Apply this operation with default options. Used by the optimizer to
    /// re-apply operations after commuting past them, which keeps the
    /// tree simplifications (merging, identity elimination) in force.
    pub fn apply(&self, target: &Relation) -> crate::error::Result<Relation> {
        match self {
            UnaryOperation::Calculation(op) => op.apply(target, &ApplyOptions::default()),
            UnaryOperation::Projection(op) => op.apply(target, &ApplyOptions::default()),
            UnaryOperation::Selection(op) => op.apply(target, &ApplyOptions::default()),
            UnaryOperation::Deduplication(op) => op.apply(target, &ApplyOptions::default()),
            UnaryOperation::Sort(op) => op.apply(target, &ApplyOptions::default()),
            UnaryOperation::Slice(op) => op.apply(target, false),
            UnaryOperation::Materialization(op) => op.apply(target, "materialization", true, false),
            UnaryOperation::Transfer(op) => op.apply(target, false, false),
            UnaryOperation::Identity => Ok(target.clone()),
            UnaryOperation::PartialJoin(op) => op.apply(target, &ApplyOptions::default()),
            UnaryOperation::Marker(_) | UnaryOperation::RowFilter(_) | UnaryOperation::Reordering(_) => {
                Ok(build_unary(self.clone(), target, false))
            }
        }
    }
}

impl PartialEq for UnaryOperation {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (UnaryOperation::Calculation(a), UnaryOperation::Calculation(b)) => a == b,
            (UnaryOperation::Projection(a), UnaryOperation::Projection(b)) => a == b,
            (UnaryOperation::Selection(a), UnaryOperation::Selection(b)) => a == b,
            (UnaryOperation::Deduplication(a), UnaryOperation::Deduplication(b)) => a == b,
            (UnaryOperation::Sort(a), UnaryOperation::Sort(b)) => a == b,
            (UnaryOperation::Slice(a), UnaryOperation::Slice(b)) => a == b,
            (UnaryOperation::Materialization(a), UnaryOperation::Materialization(b)) => a == b,
            (UnaryOperation::Transfer(a), UnaryOperation::Transfer(b)) => a == b,
            (UnaryOperation::Identity, UnaryOperation::Identity) => true,
            (UnaryOperation::PartialJoin(a), UnaryOperation::PartialJoin(b)) => a == b,
            (UnaryOperation::Marker(a), UnaryOperation::Marker(b)) => Arc::ptr_eq(a, b),
            (UnaryOperation::RowFilter(a), UnaryOperation::RowFilter(b)) => Arc::ptr_eq(a, b),
            (UnaryOperation::Reordering(a), UnaryOperation::Reordering(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for UnaryOperation {}

impl fmt::Display for UnaryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryOperation::Calculation(op) => write!(f, "{op}"),
            UnaryOperation::Projection(op) => write!(f, "{op}"),
            UnaryOperation::Selection(op) => write!(f, "{op}"),
            UnaryOperation::Deduplication(op) => write!(f, "{op}"),
            UnaryOperation::Sort(op) => write!(f, "{op}"),
            UnaryOperation::Slice(op) => write!(f, "{op}"),
            UnaryOperation::Materialization(op) => write!(f, "{op}"),
            UnaryOperation::Transfer(op) => write!(f, "{op}"),
            UnaryOperation::Identity => write!(f, "identity"),
            UnaryOperation::PartialJoin(op) => write!(f, "{op}"),
            UnaryOperation::Marker(op) => write!(f, "{op}"),
            UnaryOperation::RowFilter(op) => write!(f, "{op}"),
            UnaryOperation::Reordering(op) => write!(f, "{op}"),
        }
    }
}

// ============================================================================
// BinaryOperation
// ============================================================================

/// An operation acting on a pair of relations; closed to exactly two
/// variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryOperation {
    Join(Join),
    Chain(Chain),
}

impl BinaryOperation {
    /// Engine of the relation that results from applying this operation.
    pub fn applied_engine(&self, lhs: &Relation, _rhs: &Relation) -> EngineRef {
        lhs.engine()
    }

    /// Columns of the relation that results from applying this operation.
    pub fn applied_columns(&self, lhs: &Relation, rhs: &Relation) -> ColumnSet {
        match self {
            BinaryOperation::Join(_) => lhs.columns().union(rhs.columns()).cloned().collect(),
            BinaryOperation::Chain(_) => lhs.columns().clone(),
        }
    }

    /// Minimum rows of the relation that results from applying this
    /// operation.
    pub fn applied_min_rows(&self, lhs: &Relation, rhs: &Relation) -> u64 {
        match self {
            BinaryOperation::Join(_) => 0,
            BinaryOperation::Chain(_) => lhs.min_rows() + rhs.min_rows(),
        }
    }

    /// Maximum rows of the relation that results from applying this
    /// operation.
    pub fn applied_max_rows(&self, lhs: &Relation, rhs: &Relation) -> Option<u64> {
        match self {
            BinaryOperation::Join(_) => match (lhs.max_rows(), rhs.max_rows()) {
                (Some(0), _) | (_, Some(0)) => Some(0),
                (Some(a), Some(b)) => Some(a.saturating_mul(b)),
                _ => None,
            },
            BinaryOperation::Chain(_) => match (lhs.max_rows(), rhs.max_rows()) {
                (Some(a), Some(b)) => Some(a + b),
                _ => None,
            },
        }
    }

    /// Apply this operation with default options; used by the optimizer
    /// when reassembling trees after branch pushdowns.
    pub fn apply(&self, lhs: &Relation, rhs: &Relation) -> crate::error::Result<Relation> {
        match self {
            BinaryOperation::Join(op) => op.apply(lhs, rhs, false, false),
            BinaryOperation::Chain(op) => op.apply(lhs, rhs, false, false),
        }
    }
}

impl fmt::Display for BinaryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinaryOperation::Join(op) => write!(f, "{op}"),
            BinaryOperation::Chain(op) => write!(f, "{op}"),
        }
    }
}

// ============================================================================
// Node builders
// ============================================================================

/// Build a unary operation node; the shared tail of every unary `apply`.
pub(crate) fn build_unary(operation: UnaryOperation, target: &Relation, lock: bool) -> Relation {
    Relation::from_node(RelationNode::Unary(UnaryOperationRelation {
        columns: operation.applied_columns(target),
        operation,
        target: target.clone(),
        payload: None,
        is_locked: lock,
    }))
}

/// Build a binary operation node; the shared tail of `Join` and `Chain`
/// `apply`.
pub(crate) fn build_binary(
    operation: BinaryOperation,
    lhs: &Relation,
    rhs: &Relation,
    lock: bool,
) -> Relation {
    Relation::from_node(RelationNode::Binary(BinaryOperationRelation {
        columns: operation.applied_columns(lhs, rhs),
        operation,
        lhs: lhs.clone(),
        rhs: rhs.clone(),
        is_locked: lock,
    }))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::fmt;

    use super::*;
    use crate::engine::EngineRef;
    use crate::iteration::IterationEngine;
    use crate::relation::Relation;

    #[derive(Debug)]
    struct Snapshot;

    impl fmt::Display for Snapshot {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("snapshot")
        }
    }

    impl MarkerOperation for Snapshot {}

    #[derive(Debug)]
    struct KeepEveryOther;

    impl fmt::Display for KeepEveryOther {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("keep-every-other")
        }
    }

    impl RowFilterOperation for KeepEveryOther {
        fn is_empty_invariant(&self) -> bool {
            true
        }

        fn is_order_dependent(&self) -> bool {
            true
        }

        fn is_count_dependent(&self) -> bool {
            true
        }
    }

    fn leaf(min_rows: u64, max_rows: Option<u64>) -> Relation {
        Relation::leaf(
            EngineRef::new(IterationEngine::new("iteration")),
            "base",
            [crate::column::ColumnTag::key("a")].into_iter().collect(),
            None,
            min_rows,
            max_rows,
        )
    }

    #[test]
    fn test_custom_marker_properties() {
        let operation = UnaryOperation::Marker(Arc::new(Snapshot));
        assert!(operation.is_empty_invariant());
        assert!(operation.is_count_invariant());
        assert!(!operation.is_order_dependent());
        assert!(!operation.is_count_dependent());
        let target = leaf(2, Some(5));
        let applied = operation.apply(&target).unwrap();
        assert_eq!(applied.min_rows(), 2);
        assert_eq!(applied.max_rows(), Some(5));
        assert!(applied.to_string().starts_with("snapshot("));
    }

    #[test]
    fn test_custom_row_filter_properties() {
        let operation = UnaryOperation::RowFilter(Arc::new(KeepEveryOther));
        assert!(operation.is_empty_invariant());
        assert!(!operation.is_count_invariant());
        assert!(operation.is_order_dependent());
        assert!(operation.is_count_dependent());
        let applied = operation.apply(&leaf(2, Some(5))).unwrap();
        // Empty-invariant row filters keep at least one row.
        assert_eq!(applied.min_rows(), 1);
        assert_eq!(applied.max_rows(), Some(5));
        let applied = operation.apply(&leaf(0, Some(5))).unwrap();
        assert_eq!(applied.min_rows(), 0);
    }

    #[test]
    fn test_extension_operations_compare_by_identity() {
        let shared: Arc<dyn MarkerOperation> = Arc::new(Snapshot);
        let a = UnaryOperation::Marker(shared.clone());
        let b = UnaryOperation::Marker(shared);
        let c = UnaryOperation::Marker(Arc::new(Snapshot));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
