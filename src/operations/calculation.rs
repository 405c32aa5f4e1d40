//! Calculated columns.

use std::fmt;

use tracing::debug;

use crate::column::{ColumnExpression, ColumnSet, ColumnTag};
use crate::engine::{EngineRef, OrderedOperation};
use crate::error::{RelationError, Result};
use crate::relation::{Relation, RelationNode};

use super::{build_unary, ApplyOptions, BinaryOperation, Projection, Transfer, UnaryOperation};

/// A unary operation that adds a new column computed from existing ones.
///
/// Calculations are assumed to be deterministic in their input columns; in
/// particular a [`super::Deduplication`] has the same effect on either side
/// of a calculation. The expression must depend on at least one existing
/// column - constant columns would let one-row, zero-column relations hide
/// behind them and break join-identity detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Calculation {
    tag: ColumnTag,
    expression: ColumnExpression,
}

impl Calculation {
    /// Create a calculation; fails with `Column` if the expression depends
    /// on no columns.
    pub fn new(tag: ColumnTag, expression: ColumnExpression) -> Result<Self> {
        if expression.columns_required().is_empty() {
            return Err(RelationError::Column(format!(
                "calculated column {tag} that does not depend on any other columns is not allowed"
            )));
        }
        Ok(Calculation { tag, expression })
    }

    pub fn tag(&self) -> &ColumnTag {
        &self.tag
    }

    pub fn expression(&self) -> &ColumnExpression {
        &self.expression
    }

    pub fn columns_required(&self) -> ColumnSet {
        self.expression.columns_required()
    }

    fn as_operation(&self) -> UnaryOperation {
        UnaryOperation::Calculation(self.clone())
    }

    /// Return a new relation that applies this calculation to `target`.
    ///
    /// Raises `Column` if the expression references columns missing from
    /// the target or if `tag` already exists there; `Engine` if the
    /// expression is unsupported by the engine the operation lands in, or
    /// if `require_preferred_engine` is set and the preferred engine is
    /// unreachable.
    pub fn apply(&self, target: &Relation, options: &ApplyOptions) -> Result<Relation> {
        let operation = self.as_operation();
        let mut target = if target
            .engine()
            .preserves_order(OrderedOperation::Unary(&operation))
        {
            target.clone()
        } else {
            let message = format!(
                "calculation in engine {} will not preserve order when applied to {target}",
                target.engine()
            );
            target.expect_unordered((!options.strip_ordering).then_some(message.as_str()))?
        };
        if !self
            .expression
            .columns_required()
            .is_subset(target.columns())
        {
            let missing: Vec<String> = self
                .expression
                .columns_required()
                .difference(target.columns())
                .map(ToString::to_string)
                .collect();
            return Err(RelationError::Column(format!(
                "cannot calculate column {} because expression requires columns [{}] \
                 that are not present in the target relation {target}",
                self.tag,
                missing.join(", ")
            )));
        }
        if target.columns().contains(&self.tag) {
            return Err(RelationError::Column(format!(
                "calculated column {} is already present in {target}",
                self.tag
            )));
        }
        if let Some(preferred) = &options.preferred_engine {
            if *preferred != target.engine() {
                if options.backtrack {
                    if let Some(result) = self.insert_recursive(&target, preferred, options.lock)? {
                        debug!(operation = %operation, engine = %preferred, "backtracked into preferred engine");
                        return Ok(result);
                    }
                }
                if options.transfer {
                    target = Transfer::new(preferred.clone()).apply(
                        &target,
                        false,
                        options.strip_ordering,
                    )?;
                } else if options.require_preferred_engine {
                    return Err(RelationError::Engine(format!(
                        "no way to apply calculation of column {} with required engine {preferred}",
                        self.tag
                    )));
                }
            }
        }
        if !self.expression.is_supported_by(&target.engine()) {
            return Err(RelationError::Engine(format!(
                "column expression {} does not support engine {}",
                self.expression,
                target.engine()
            )));
        }
        Ok(build_unary(operation, &target, options.lock))
    }

    /// Try to insert this calculation upstream of `target` so that it is
    /// evaluated in `preferred`; `None` means no valid insertion point.
    fn insert_recursive(
        &self,
        target: &Relation,
        preferred: &EngineRef,
        lock: bool,
    ) -> Result<Option<Relation>> {
        if target.is_locked() {
            return Ok(None);
        }
        let required = self.expression.columns_required();
        match target.node() {
            RelationNode::Unary(rel) => {
                // Commuting before a projection means the projection has to
                // keep the calculated column.
                let operation = match &rel.operation {
                    UnaryOperation::Projection(projection) => {
                        let mut columns = projection.columns().clone();
                        columns.insert(self.tag.clone());
                        UnaryOperation::Projection(Projection::new(columns))
                    }
                    other => other.clone(),
                };
                let next = &rel.target;
                if !required.is_subset(next.columns()) {
                    return Ok(None);
                }
                if operation.is_count_dependent() {
                    return Ok(None);
                }
                if operation.is_order_dependent()
                    && !next
                        .engine()
                        .preserves_order(OrderedOperation::Unary(&self.as_operation()))
                {
                    return Ok(None);
                }
                // A calculation otherwise commutes through calculations,
                // deduplications, markers, row filters, and reorderings.
                if next.engine() == *preferred {
                    let pushed = self.apply(next, &ApplyOptions::lock_only(lock))?;
                    return operation.apply(&pushed).map(Some);
                }
                if let Some(new_next) = self.insert_recursive(next, preferred, lock)? {
                    return operation.apply(&new_next).map(Some);
                }
                Ok(None)
            }
            RelationNode::Binary(rel) => match &rel.operation {
                BinaryOperation::Join(join) => {
                    // A calculation is pushed into exactly one join branch.
                    if rel.lhs.columns().is_superset(&required) {
                        if let Some(new_lhs) = self.insert_recursive(&rel.lhs, preferred, lock)? {
                            return join.apply(&new_lhs, &rel.rhs, false, false).map(Some);
                        }
                    }
                    if rel.rhs.columns().is_superset(&required) {
                        if let Some(new_rhs) = self.insert_recursive(&rel.rhs, preferred, lock)? {
                            return join.apply(&rel.lhs, &new_rhs, false, false).map(Some);
                        }
                    }
                    Ok(None)
                }
                BinaryOperation::Chain(chain) => {
                    let new_lhs = self.insert_recursive(&rel.lhs, preferred, lock)?;
                    let new_rhs = self.insert_recursive(&rel.rhs, preferred, lock)?;
                    if let (Some(new_lhs), Some(new_rhs)) = (new_lhs, new_rhs) {
                        chain.apply(&new_lhs, &new_rhs, false, false).map(Some)
                    } else {
                        Ok(None)
                    }
                }
            },
            RelationNode::Leaf(_) => Ok(None),
        }
    }
}

impl fmt::Display for Calculation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+[{}={}]", self.tag, self.expression)
    }
}
