//! Natural joins and their unary partial form.

use std::fmt;

use tracing::debug;

use crate::column::{display_columns, ColumnSet, Predicate};
use crate::error::{RelationError, Result};
use crate::relation::{Relation, RelationNode};

use super::{
    build_binary, ApplyOptions, BinaryOperation, Projection, Transfer, UnaryOperation,
};

/// A natural join: rows matched on common columns (and an optional extra
/// predicate), producing the union of both operands' columns. Equivalent
/// to SQL `INNER JOIN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    predicate: Predicate,
    min_columns: ColumnSet,
    max_columns: Option<ColumnSet>,
}

impl Join {
    /// Join with automatic common-column resolution and the given extra
    /// predicate (use `Predicate::literal(true)` for a pure natural join).
    pub fn new(predicate: Predicate) -> Self {
        Join {
            predicate,
            min_columns: ColumnSet::new(),
            max_columns: None,
        }
    }

    /// Join constrained to resolve its common columns between `min` and
    /// `max`; `apply` fails if the operands cannot satisfy `min`.
    pub fn with_column_bounds(
        predicate: Predicate,
        min_columns: ColumnSet,
        max_columns: Option<ColumnSet>,
    ) -> Self {
        Join {
            predicate,
            min_columns,
            max_columns,
        }
    }

    /// Extra condition on matched rows, beyond common-column equality.
    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    pub fn min_columns(&self) -> &ColumnSet {
        &self.min_columns
    }

    pub fn max_columns(&self) -> Option<&ColumnSet> {
        self.max_columns.as_ref()
    }

    fn is_resolved(&self) -> bool {
        self.max_columns.as_ref() == Some(&self.min_columns)
    }

    /// The equality-constraint columns. Only available once resolved,
    /// which `apply` guarantees for any join attached to a relation node.
    pub fn common_columns(&self) -> Result<&ColumnSet> {
        if self.is_resolved() {
            Ok(&self.min_columns)
        } else {
            Err(RelationError::Column(format!(
                "common columns for join {self} have not been resolved"
            )))
        }
    }

    /// Compute the actual common columns for the given operands: the key
    /// columns both sides share, narrowed by `max_columns`, checked to
    /// cover `min_columns`.
    pub fn applied_common_columns(&self, lhs: &Relation, rhs: &Relation) -> Result<ColumnSet> {
        if self.is_resolved() {
            return Ok(self.min_columns.clone());
        }
        let mut common: ColumnSet = lhs
            .columns()
            .intersection(rhs.columns())
            .filter(|tag| tag.is_key())
            .cloned()
            .collect();
        if let Some(max_columns) = &self.max_columns {
            common = common.intersection(max_columns).cloned().collect();
        }
        if !common.is_superset(&self.min_columns) {
            return Err(RelationError::Column(format!(
                "common columns [{}] for join between {lhs} and {rhs} are not a superset \
                 of the minimum columns [{}]",
                display_columns(&common),
                display_columns(&self.min_columns)
            )));
        }
        Ok(common)
    }

    /// Apply this join to a pair of relations.
    ///
    /// Either operand that is a join identity short-circuits to the other
    /// operand - after validation, so logic bugs are not silently ignored.
    /// Raises `Engine` on mismatched engines or an unsupported predicate,
    /// `Column` on predicate or common-column gaps.
    pub fn apply(
        &self,
        lhs: &Relation,
        rhs: &Relation,
        lock: bool,
        strip_ordering: bool,
    ) -> Result<Relation> {
        if lhs.engine() != rhs.engine() {
            return Err(RelationError::Engine(format!(
                "mismatched join engines: {} != {}",
                lhs.engine(),
                rhs.engine()
            )));
        }
        if !self.predicate.is_supported_by(&lhs.engine()) {
            return Err(RelationError::Engine(format!(
                "join predicate {} does not support engine {}",
                self.predicate,
                lhs.engine()
            )));
        }
        let applied_columns: ColumnSet = lhs.columns().union(rhs.columns()).cloned().collect();
        if !self.predicate.columns_required().is_subset(&applied_columns) {
            let missing: ColumnSet = self
                .predicate
                .columns_required()
                .difference(&applied_columns)
                .cloned()
                .collect();
            return Err(RelationError::Column(format!(
                "missing columns [{}] for join between {lhs} and {rhs} with predicate {}",
                display_columns(&missing),
                self.predicate
            )));
        }
        let operation = if self.is_resolved() {
            for (side, relation) in [("left", lhs), ("right", rhs)] {
                if !relation.columns().is_superset(&self.min_columns) {
                    let missing: ColumnSet = self
                        .min_columns
                        .difference(relation.columns())
                        .cloned()
                        .collect();
                    return Err(RelationError::Column(format!(
                        "missing columns [{}] for {side}-hand side of join between \
                         {lhs} and {rhs}",
                        display_columns(&missing)
                    )));
                }
            }
            self.clone()
        } else {
            let common = self.applied_common_columns(lhs, rhs)?;
            Join::with_column_bounds(self.predicate.clone(), common.clone(), Some(common))
        };
        let lhs = lhs.expect_unordered(
            (!strip_ordering)
                .then(|| format!("join to {rhs} will not preserve order in {lhs}"))
                .as_deref(),
        )?;
        let rhs = rhs.expect_unordered(
            (!strip_ordering)
                .then(|| format!("join to {lhs} will not preserve order in {rhs}"))
                .as_deref(),
        )?;
        if lhs.is_join_identity() {
            return Ok(rhs);
        }
        if rhs.is_join_identity() {
            return Ok(lhs);
        }
        Ok(build_binary(
            BinaryOperation::Join(operation),
            &lhs,
            &rhs,
            lock,
        ))
    }

    /// This join with one operand already provided and held fixed, as a
    /// unary operation (in the spirit of partial function application).
    ///
    /// `fixed_is_lhs` controls which side `fix` takes; the side is usually
    /// irrelevant, but engines may make extra guarantees based on it.
    pub fn partial(
        &self,
        fix: &Relation,
        fixed_is_lhs: bool,
        strip_ordering: bool,
    ) -> Result<PartialJoin> {
        if !self.min_columns.is_subset(fix.columns()) {
            let missing: ColumnSet = self
                .min_columns
                .difference(fix.columns())
                .cloned()
                .collect();
            return Err(RelationError::Column(format!(
                "missing columns [{}] for partial join to {fix}",
                display_columns(&missing)
            )));
        }
        let fix = fix.expect_unordered(
            (!strip_ordering)
                .then(|| format!("join will not preserve order when applied to {fix}"))
                .as_deref(),
        )?;
        Ok(PartialJoin {
            binary: self.clone(),
            fixed: fix,
            fixed_is_lhs,
        })
    }
}

impl fmt::Display for Join {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("⋈")
    }
}

/// A join with one operand held fixed, usable as a unary operation.
///
/// `PartialJoin` never appears in relation trees: its `apply` always
/// produces a binary join relation (or one of the operands, when the other
/// is the join identity). Its value is the unary `apply` signature, which
/// lets the optimizer backtrack or transfer `target` into the fixed
/// relation's engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialJoin {
    binary: Join,
    fixed: Relation,
    fixed_is_lhs: bool,
}

impl PartialJoin {
    pub fn binary(&self) -> &Join {
        &self.binary
    }

    /// The operand already included in the operation.
    pub fn fixed(&self) -> &Relation {
        &self.fixed
    }

    pub fn fixed_is_lhs(&self) -> bool {
        self.fixed_is_lhs
    }

    /// Columns the target must supply: whatever the predicate needs beyond
    /// the fixed side, plus the minimum equality columns.
    pub fn columns_required(&self) -> ColumnSet {
        let mut result = self.binary.predicate.columns_required();
        result.retain(|tag| !self.fixed.columns().contains(tag));
        result.extend(self.binary.min_columns.iter().cloned());
        result
    }

    pub fn applied_columns(&self, target: &Relation) -> ColumnSet {
        self.fixed.columns().union(target.columns()).cloned().collect()
    }

    pub fn applied_min_rows(&self, _target: &Relation) -> u64 {
        0
    }

    pub fn applied_max_rows(&self, target: &Relation) -> Option<u64> {
        match (self.fixed.max_rows(), target.max_rows()) {
            (Some(0), _) | (_, Some(0)) => Some(0),
            (Some(a), Some(b)) => Some(a.saturating_mul(b)),
            _ => None,
        }
    }

    /// Join `target` to the fixed relation.
    ///
    /// Only `target` is backtracked through or transferred; the fixed side
    /// stays put. Raises `Engine` if `target` cannot be brought into the
    /// fixed relation's engine under the given options.
    pub fn apply(&self, target: &Relation, options: &ApplyOptions) -> Result<Relation> {
        if !self.binary.is_resolved() {
            let common = self.binary.applied_common_columns(&self.fixed, target)?;
            let resolved = PartialJoin {
                binary: Join::with_column_bounds(
                    self.binary.predicate.clone(),
                    common.clone(),
                    Some(common),
                ),
                fixed: self.fixed.clone(),
                fixed_is_lhs: self.fixed_is_lhs,
            };
            return resolved.apply(target, options);
        }
        if !self.columns_required().is_subset(target.columns()) {
            let missing: ColumnSet = self
                .columns_required()
                .difference(target.columns())
                .cloned()
                .collect();
            return Err(RelationError::Column(format!(
                "join {self} to relation {target} needs columns [{}]",
                display_columns(&missing)
            )));
        }
        let mut target = target.clone();
        if target.engine() != self.fixed.engine() {
            if options.backtrack {
                if let Some(result) = self.insert_recursive(&target, options.lock)? {
                    debug!(operation = %self, engine = %self.fixed.engine(), "backtracked into fixed engine");
                    return Ok(result);
                }
            }
            if options.transfer {
                target = Transfer::new(self.fixed.engine()).apply(
                    &target,
                    false,
                    options.strip_ordering,
                )?;
            } else {
                return Err(RelationError::Engine(format!(
                    "no way to apply join between {} and {target} in engine {}",
                    self.fixed,
                    self.fixed.engine()
                )));
            }
        }
        if self.fixed_is_lhs {
            self.binary
                .apply(&self.fixed, &target, options.lock, options.strip_ordering)
        } else {
            self.binary
                .apply(&target, &self.fixed, options.lock, options.strip_ordering)
        }
    }

    /// Try to insert this join upstream of `target`, inside the fixed
    /// relation's engine; `None` means no valid insertion point.
    fn insert_recursive(&self, target: &Relation, lock: bool) -> Result<Option<Relation>> {
        if target.is_locked() {
            return Ok(None);
        }
        let required = self.columns_required();
        match target.node() {
            RelationNode::Unary(rel) => {
                let next = &rel.target;
                let operation = match &rel.operation {
                    UnaryOperation::Deduplication(_) => {
                        // A join only commutes past a deduplication if the
                        // fixed relation has unique rows, which cannot be
                        // established here.
                        return Ok(None);
                    }
                    UnaryOperation::Projection(_) => {
                        // The outer projection has to include the columns
                        // the join adds. Common columns are resolved by
                        // now, so the projection cannot change them.
                        UnaryOperation::Projection(Projection::new(
                            self.applied_columns(target),
                        ))
                    }
                    other => other.clone(),
                };
                if operation.is_order_dependent() || operation.is_count_dependent() {
                    return Ok(None);
                }
                if !required.is_subset(next.columns()) {
                    return Ok(None);
                }
                // A partial join otherwise commutes through calculations,
                // markers, row filters, and reorderings.
                if next.engine() == self.fixed.engine() {
                    let pushed = self.apply(next, &ApplyOptions::lock_only(lock))?;
                    return operation.apply(&pushed).map(Some);
                }
                if let Some(new_next) = self.insert_recursive(next, lock)? {
                    return operation.apply(&new_next).map(Some);
                }
                Ok(None)
            }
            RelationNode::Binary(rel) => match &rel.operation {
                BinaryOperation::Join(join) => {
                    // Push into exactly one branch that can supply the
                    // required columns.
                    if rel.lhs.columns().is_superset(&required) {
                        if let Some(new_lhs) = self.insert_recursive(&rel.lhs, lock)? {
                            return join.apply(&new_lhs, &rel.rhs, false, false).map(Some);
                        }
                    }
                    if rel.rhs.columns().is_superset(&required) {
                        if let Some(new_rhs) = self.insert_recursive(&rel.rhs, lock)? {
                            return join.apply(&rel.lhs, &new_rhs, false, false).map(Some);
                        }
                    }
                    Ok(None)
                }
                BinaryOperation::Chain(chain) => {
                    let new_lhs = self.insert_recursive(&rel.lhs, lock)?;
                    let new_rhs = self.insert_recursive(&rel.rhs, lock)?;
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

impl fmt::Display for PartialJoin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "⋈[{}]", self.fixed)
    }
}
