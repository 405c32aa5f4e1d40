//! Duplicate-row removal.

use std::fmt;

use tracing::debug;

use crate::column::{ColumnSet, ColumnTag};
use crate::engine::{EngineRef, OrderedOperation};
use crate::error::{RelationError, Result};
use crate::relation::{Relation, RelationNode};

use super::{build_unary, ApplyOptions, BinaryOperation, Transfer, UnaryOperation};

/// A unary operation that removes duplicate rows.
///
/// `unique_key` lists columns that are sufficient for uniqueness on their
/// own; `apply` guarantees it is always resolved (never `None`) on an
/// operation attached to a relation node, defaulting to every column with
/// `is_key` set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deduplication {
    unique_key: Option<Vec<ColumnTag>>,
}

impl Deduplication {
    /// Deduplication whose key is resolved from the target's key columns
    /// at apply time.
    pub fn new() -> Self {
        Deduplication { unique_key: None }
    }

    /// Deduplication over an explicit unique key.
    pub fn with_key(unique_key: Vec<ColumnTag>) -> Self {
        Deduplication {
            unique_key: Some(unique_key),
        }
    }

    pub fn unique_key(&self) -> Option<&[ColumnTag]> {
        self.unique_key.as_deref()
    }

    pub fn columns_required(&self) -> ColumnSet {
        match &self.unique_key {
            Some(key) => key.iter().cloned().collect(),
            None => ColumnSet::new(),
        }
    }

    fn as_operation(&self) -> UnaryOperation {
        UnaryOperation::Deduplication(self.clone())
    }

    /// Return a new relation with no duplicate rows.
    ///
    /// Raises `Column` if no key can be resolved: the key is unset and no
    /// target column has `is_key`, or an explicit key is not a subset of
    /// the target's columns.
    pub fn apply(&self, target: &Relation, options: &ApplyOptions) -> Result<Relation> {
        let operation = self.as_operation();
        let target = if target
            .engine()
            .preserves_order(OrderedOperation::Unary(&operation))
        {
            target.clone()
        } else {
            let message = format!(
                "deduplication in engine {} will not preserve order when applied to {target}",
                target.engine()
            );
            target.expect_unordered((!options.strip_ordering).then_some(message.as_str()))?
        };
        let Some(unique_key) = &self.unique_key else {
            let resolved = Deduplication::with_key(applied_unique_key(&target)?);
            return resolved.apply(&target, options);
        };
        if !unique_key.iter().all(|tag| target.columns().contains(tag)) {
            let names: Vec<&str> = unique_key.iter().map(ColumnTag::name).collect();
            return Err(RelationError::Column(format!(
                "unique key columns [{}] are not a subset of the columns of {target}",
                names.join(", ")
            )));
        }
        let mut target = target;
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
                        "no way to remove duplicates from {target} in engine {preferred}"
                    )));
                }
            }
        }
        Ok(build_unary(self.as_operation(), &target, options.lock))
    }

    /// Try to insert this deduplication upstream of `target` so that it is
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
        match target.node() {
            RelationNode::Unary(rel) => {
                let next = &rel.target;
                if let UnaryOperation::Deduplication(_) = &rel.operation {
                    // The tree already deduplicates here.
                    return Ok(Some(target.clone()));
                }
                if rel.operation.is_count_dependent() {
                    return Ok(None);
                }
                if rel.operation.is_order_dependent()
                    && !next
                        .engine()
                        .preserves_order(OrderedOperation::Unary(&rel.operation))
                {
                    return Ok(None);
                }
                // Deduplication does not commute through a projection; the
                // check guards against what a projection does (dropping
                // columns may reintroduce duplicates) rather than its type.
                if !target.columns().is_superset(next.columns()) {
                    return Ok(None);
                }
                if !self.columns_required().is_subset(next.columns()) {
                    return Ok(None);
                }
                // A deduplication otherwise commutes through calculations
                // (assumed deterministic), markers, row filters, and
                // reorderings.
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
                    let new_lhs = self.insert_recursive(&rel.lhs, preferred, lock)?;
                    let new_rhs = self.insert_recursive(&rel.rhs, preferred, lock)?;
                    if let (Some(new_lhs), Some(new_rhs)) = (new_lhs, new_rhs) {
                        join.apply(&new_lhs, &new_rhs, false, false).map(Some)
                    } else {
                        Ok(None)
                    }
                }
                // Deduplicating each side of a chain is not equivalent to
                // deduplicating their concatenation.
                BinaryOperation::Chain(_) => Ok(None),
            },
            RelationNode::Leaf(_) => Ok(None),
        }
    }
}

impl Default for Deduplication {
    fn default() -> Self {
        Deduplication::new()
    }
}

/// Resolve the default unique key: all key columns of the target, in name
/// order for determinism.
fn applied_unique_key(target: &Relation) -> Result<Vec<ColumnTag>> {
    let mut key: Vec<ColumnTag> = target
        .columns()
        .iter()
        .filter(|tag| tag.is_key())
        .cloned()
        .collect();
    if key.is_empty() {
        return Err(RelationError::Column(format!(
            "no key columns in relation {target} for deduplication"
        )));
    }
    key.sort_unstable();
    Ok(key)
}

impl fmt::Display for Deduplication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("deduplication")
    }
}
