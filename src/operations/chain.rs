//! Row concatenation.

use std::fmt;

use crate::column::{display_columns, ColumnSet};
use crate::engine::OrderedOperation;
use crate::error::{RelationError, Result};
use crate::relation::Relation;

use super::{build_binary, BinaryOperation};

/// A binary operation that concatenates the rows of two relations with the
/// same columns, like SQL `UNION ALL`.
///
/// `apply` never returns an operand directly, even when the other side is
/// statically empty: empty branches stay in the tree so diagnostics can
/// report on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chain;

impl Chain {
    /// Concatenate `lhs` and `rhs`.
    ///
    /// If the engine preserves order for chains, all rows of `lhs` come
    /// before all rows of `rhs` in their original orders. Raises `Engine`
    /// on mismatched engines and `Column` on mismatched columns.
    pub fn apply(
        &self,
        lhs: &Relation,
        rhs: &Relation,
        lock: bool,
        strip_ordering: bool,
    ) -> Result<Relation> {
        let lhs = if lhs.engine().preserves_order(OrderedOperation::Chain) {
            lhs.clone()
        } else {
            let message = format!(
                "chain in engine {} will not preserve order when applied to {lhs}",
                lhs.engine()
            );
            lhs.expect_unordered((!strip_ordering).then_some(message.as_str()))?
        };
        let rhs = if rhs.engine().preserves_order(OrderedOperation::Chain) {
            rhs.clone()
        } else {
            let message = format!(
                "chain in engine {} will not preserve order when applied to {rhs}",
                rhs.engine()
            );
            rhs.expect_unordered((!strip_ordering).then_some(message.as_str()))?
        };
        if lhs.engine() != rhs.engine() {
            return Err(RelationError::Engine(format!(
                "mismatched chain engines: {} != {}",
                lhs.engine(),
                rhs.engine()
            )));
        }
        if lhs.columns() != rhs.columns() {
            let only_lhs: ColumnSet = lhs.columns().difference(rhs.columns()).cloned().collect();
            let only_rhs: ColumnSet = rhs.columns().difference(lhs.columns()).cloned().collect();
            return Err(RelationError::Column(format!(
                "mismatched chain columns: [{}] only on the left, [{}] only on the right",
                display_columns(&only_lhs),
                display_columns(&only_rhs)
            )));
        }
        Ok(build_binary(BinaryOperation::Chain(*self), &lhs, &rhs, lock))
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("∪")
    }
}
