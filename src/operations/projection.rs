//! Column projection.

use std::fmt;

use tracing::debug;

use crate::column::{display_columns, ColumnSet};
use crate::engine::{EngineRef, OrderedOperation};
use crate::error::{RelationError, Result};
use crate::relation::{Relation, RelationNode};

use super::{build_unary, ApplyOptions, BinaryOperation, Transfer, UnaryOperation};

/// A unary operation that keeps only the given columns.
///
/// This is the only operation permitted to introduce duplication among row
/// values (as opposed to just propagating duplicates); the row count itself
/// never changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    columns: ColumnSet,
}

impl Projection {
    pub fn new(columns: ColumnSet) -> Self {
        Projection { columns }
    }

    /// The columns to be kept.
    pub fn columns(&self) -> &ColumnSet {
        &self.columns
    }

    fn as_operation(&self) -> UnaryOperation {
        UnaryOperation::Projection(self.clone())
    }

    /// Return a new relation with only this projection's columns.
    ///
    /// Returns `target` unchanged when the columns already match. Stacked
    /// projections fold to the innermost target, and a projection that
    /// drops a calculated column absorbs the calculation.
    pub fn apply(&self, target: &Relation, options: &ApplyOptions) -> Result<Relation> {
        if self.columns == *target.columns() {
            return Ok(target.clone());
        }
        let operation = self.as_operation();
        let mut target = if target
            .engine()
            .preserves_order(OrderedOperation::Unary(&operation))
        {
            target.clone()
        } else {
            let message = format!(
                "projection in engine {} will not preserve order when applied to {target}",
                target.engine()
            );
            target.expect_unordered((!options.strip_ordering).then_some(message.as_str()))?
        };
        if !self.columns.is_subset(target.columns()) {
            let missing: ColumnSet = self
                .columns
                .difference(target.columns())
                .cloned()
                .collect();
            return Err(RelationError::Column(format!(
                "cannot project column(s) [{}] that are not present in the target relation {target}",
                display_columns(&missing)
            )));
        }
        if let Some(preferred) = &options.preferred_engine {
            if *preferred != target.engine() {
                if options.backtrack {
                    target = self.insert_recursive(&target, preferred, options.lock)?;
                    if *target.columns() == self.columns {
                        debug!(operation = %operation, engine = %preferred, "backtracked into preferred engine");
                        return Ok(target);
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
                        "no way to apply projection to columns [{}] with required engine {preferred}",
                        display_columns(&self.columns)
                    )));
                }
            }
        }
        // Local simplifications; insert_recursive performs the same ones
        // when it walks upstream, but they must happen here too for the
        // common case where it is never called.
        match target.node() {
            RelationNode::Unary(rel) => match &rel.operation {
                UnaryOperation::Projection(_) => {
                    return self.apply(&rel.target, &ApplyOptions::lock_only(options.lock));
                }
                UnaryOperation::Calculation(calculation)
                    if !self.columns.contains(calculation.tag()) =>
                {
                    return self.apply(&rel.target, &ApplyOptions::lock_only(options.lock));
                }
                _ => {}
            },
            _ => {}
        }
        Ok(build_unary(operation, &target, options.lock))
    }

    /// Best-effort upstream insertion: returns a tree whose columns may or
    /// may not already match this projection; the caller finishes the job.
    fn insert_recursive(
        &self,
        target: &Relation,
        preferred: &EngineRef,
        lock: bool,
    ) -> Result<Relation> {
        if target.is_locked() {
            return Ok(target.clone());
        }
        match target.node() {
            RelationNode::Unary(rel) => {
                let next = &rel.target;
                // A projection supersedes an inner projection, and absorbs a
                // calculation whose column it drops.
                let reapply: Option<UnaryOperation> = match &rel.operation {
                    UnaryOperation::Projection(_) => None,
                    UnaryOperation::Calculation(calculation)
                        if !self.columns.contains(calculation.tag()) =>
                    {
                        None
                    }
                    other => Some(other.clone()),
                };
                let recurse_with = match &reapply {
                    Some(operation)
                        if !operation.columns_required().is_subset(&self.columns) =>
                    {
                        // Cannot move the entire projection past this
                        // operation; move what we can and let the caller
                        // handle the rest.
                        Projection::new(
                            self.columns
                                .union(&operation.columns_required())
                                .cloned()
                                .collect(),
                        )
                    }
                    _ => self.clone(),
                };
                if let Some(operation) = &reapply {
                    if operation.is_count_dependent() {
                        return Ok(target.clone());
                    }
                    if operation.is_order_dependent()
                        && !next
                            .engine()
                            .preserves_order(OrderedOperation::Unary(&self.as_operation()))
                    {
                        return Ok(target.clone());
                    }
                }
                if next.engine() == *preferred {
                    let pushed = recurse_with.apply(next, &ApplyOptions::lock_only(lock))?;
                    return match reapply {
                        Some(operation) => operation.apply(&pushed),
                        None => Ok(pushed),
                    };
                }
                let new_next = recurse_with.insert_recursive(next, preferred, lock)?;
                if new_next.same_node(next) {
                    // Avoid spurious copies by returning the original.
                    return Ok(target.clone());
                }
                match reapply {
                    Some(operation) => operation.apply(&new_next),
                    None => Ok(new_next),
                }
            }
            RelationNode::Binary(rel) => match &rel.operation {
                BinaryOperation::Join(join) => {
                    // Each branch keeps what the projection wants plus what
                    // the join itself consumes.
                    let mut recurse_columns = self.columns.clone();
                    recurse_columns.extend(join.common_columns()?.iter().cloned());
                    recurse_columns.extend(join.predicate().columns_required());
                    let try_branch = |branch: &Relation| -> Result<Relation> {
                        if recurse_columns.is_superset(branch.columns()) {
                            Ok(branch.clone())
                        } else {
                            let narrowed = Projection::new(
                                recurse_columns
                                    .intersection(branch.columns())
                                    .cloned()
                                    .collect(),
                            );
                            narrowed.insert_recursive(branch, preferred, lock)
                        }
                    };
                    let new_lhs = try_branch(&rel.lhs)?;
                    let new_rhs = try_branch(&rel.rhs)?;
                    if new_lhs.same_node(&rel.lhs) && new_rhs.same_node(&rel.rhs) {
                        Ok(target.clone())
                    } else {
                        join.apply(&new_lhs, &new_rhs, false, false)
                    }
                }
                BinaryOperation::Chain(chain) => {
                    let new_lhs = self.insert_recursive(&rel.lhs, preferred, lock)?;
                    let new_rhs = self.insert_recursive(&rel.rhs, preferred, lock)?;
                    if new_lhs.same_node(&rel.lhs) && new_rhs.same_node(&rel.rhs) {
                        return Ok(target.clone());
                    }
                    if new_lhs.columns() != new_rhs.columns() {
                        // Each side only projected away columns the other
                        // side kept; this is the best we can do.
                        return Ok(target.clone());
                    }
                    chain.apply(&new_lhs, &new_rhs, false, false)
                }
            },
            RelationNode::Leaf(_) => Ok(target.clone()),
        }
    }
}

impl fmt::Display for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Π[{}]", display_columns(&self.columns))
    }
}
