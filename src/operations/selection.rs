//! Row selection by predicate.

use std::fmt;

use tracing::debug;

use crate::column::{display_columns, ColumnSet, Predicate};
use crate::engine::{EngineRef, OrderedOperation};
use crate::error::{RelationError, Result};
use crate::relation::{Relation, RelationNode};

use super::{build_unary, ApplyOptions, BinaryOperation, Transfer, UnaryOperation};

/// A row filter that keeps rows satisfying a boolean column expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    predicate: Predicate,
}

impl Selection {
    /// Create a selection, flattening nested conjunctions and dropping
    /// trivially-true operands from the predicate. A trivially-false
    /// predicate is kept as given; doomed relations stay in the tree for
    /// diagnostics.
    pub fn new(predicate: Predicate) -> Self {
        let predicate = match predicate.flatten_and() {
            Some(operands) => {
                if operands.is_empty() {
                    Predicate::literal(true)
                } else {
                    Predicate::logical_and(operands)
                }
            }
            None => predicate,
        };
        Selection { predicate }
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    pub fn columns_required(&self) -> ColumnSet {
        self.predicate.columns_required()
    }

    fn as_operation(&self) -> UnaryOperation {
        UnaryOperation::Selection(self.clone())
    }

    /// Return a new relation with only the rows that satisfy the
    /// predicate. May be `target` itself when the predicate is trivially
    /// true; back-to-back selections are merged by conjunction.
    pub fn apply(&self, target: &Relation, options: &ApplyOptions) -> Result<Relation> {
        if self.predicate.as_trivial() == Some(true) {
            return Ok(target.clone());
        }
        if !self.predicate.columns_required().is_subset(target.columns()) {
            let missing: ColumnSet = self
                .predicate
                .columns_required()
                .difference(target.columns())
                .cloned()
                .collect();
            return Err(RelationError::Column(format!(
                "predicate {} for target relation {target} needs columns [{}]",
                self.predicate,
                display_columns(&missing)
            )));
        }
        let operation = self.as_operation();
        let mut target = if target
            .engine()
            .preserves_order(OrderedOperation::Unary(&operation))
        {
            target.clone()
        } else {
            let message = format!(
                "selection in engine {} will not preserve order when applied to {target}",
                target.engine()
            );
            target.expect_unordered((!options.strip_ordering).then_some(message.as_str()))?
        };
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
                        "no way to apply selection with predicate {} with required engine {preferred}",
                        self.predicate
                    )));
                }
            }
        }
        if !self.predicate.is_supported_by(&target.engine()) {
            return Err(RelationError::Engine(format!(
                "predicate {} does not support engine {}",
                self.predicate,
                target.engine()
            )));
        }
        if let RelationNode::Unary(rel) = target.node() {
            if let UnaryOperation::Selection(inner) = &rel.operation {
                let merged = Selection::new(inner.predicate.clone().and(self.predicate.clone()));
                return merged.apply(&rel.target, &ApplyOptions::lock_only(options.lock));
            }
        }
        Ok(build_unary(operation, &target, options.lock))
    }

    /// Try to insert this selection upstream of `target` so that it is
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
        let required = self.predicate.columns_required();
        match target.node() {
            RelationNode::Unary(rel) => {
                let next = &rel.target;
                if rel.operation.is_count_dependent() {
                    return Ok(None);
                }
                if rel.operation.is_order_dependent()
                    && !next
                        .engine()
                        .preserves_order(OrderedOperation::Unary(&self.as_operation()))
                {
                    return Ok(None);
                }
                if !required.is_subset(next.columns()) {
                    return Ok(None);
                }
                // A selection otherwise commutes through calculations,
                // deduplications, projections, markers, other row filters,
                // and reorderings.
                if next.engine() == *preferred {
                    let pushed = self.apply(next, &ApplyOptions::lock_only(lock))?;
                    return rel.operation.apply(&pushed).map(Some);
                }
                if let Some(new_next) = self.insert_recursive(next, preferred, lock)? {
                    return rel.operation.apply(&new_next).map(Some);
                }
                Ok(None)
            }
            RelationNode::Binary(rel) => match &rel.operation {
                BinaryOperation::Join(join) => {
                    // A selection may be applied in every branch whose
                    // columns suffice; duplicated pushdown is legal since
                    // selection is idempotent under conjunction.
                    let try_branch = |branch: &Relation| -> Result<Relation> {
                        if branch.columns().is_superset(&required) {
                            Ok(self
                                .insert_recursive(branch, preferred, lock)?
                                .unwrap_or_else(|| branch.clone()))
                        } else {
                            Ok(branch.clone())
                        }
                    };
                    let new_lhs = try_branch(&rel.lhs)?;
                    let new_rhs = try_branch(&rel.rhs)?;
                    if !new_lhs.same_node(&rel.lhs) || !new_rhs.same_node(&rel.rhs) {
                        join.apply(&new_lhs, &new_rhs, false, false).map(Some)
                    } else {
                        Ok(None)
                    }
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

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "σ[{}]", self.predicate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::ColumnTag;

    #[test]
    fn test_construction_flattens_and() {
        let p = Predicate::reference(ColumnTag::new("p"));
        let q = Predicate::reference(ColumnTag::new("q"));
        let selection = Selection::new(Predicate::LogicalAnd(vec![
            Predicate::literal(true),
            Predicate::LogicalAnd(vec![p.clone(), q.clone()]),
        ]));
        assert_eq!(
            selection.predicate(),
            &Predicate::LogicalAnd(vec![p, q])
        );
    }

    #[test]
    fn test_construction_keeps_trivially_false() {
        let selection = Selection::new(Predicate::literal(false));
        assert_eq!(selection.predicate(), &Predicate::literal(false));
    }
}
