//! Row ordering.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::column::{ColumnExpression, ColumnSet};
use crate::engine::{EngineRef, OrderedOperation};
use crate::error::{RelationError, Result};
use crate::relation::{Relation, RelationNode};

use super::{build_unary, ApplyOptions, Transfer, UnaryOperation};

/// One criterion of a sort: an expression and a direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortTerm {
    pub expression: ColumnExpression,
    pub ascending: bool,
}

impl SortTerm {
    pub fn ascending(expression: ColumnExpression) -> Self {
        SortTerm {
            expression,
            ascending: true,
        }
    }

    pub fn descending(expression: ColumnExpression) -> Self {
        SortTerm {
            expression,
            ascending: false,
        }
    }
}

impl fmt::Display for SortTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.ascending {
            write!(f, "-")?;
        }
        write!(f, "{}", self.expression)
    }
}

/// A reordering operation that sorts rows by a sequence of terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    terms: Vec<SortTerm>,
}

impl Sort {
    pub fn new(terms: Vec<SortTerm>) -> Self {
        Sort { terms }
    }

    pub fn terms(&self) -> &[SortTerm] {
        &self.terms
    }

    pub fn columns_required(&self) -> ColumnSet {
        let mut result = ColumnSet::new();
        for term in &self.terms {
            result.extend(term.expression.columns_required());
        }
        result
    }

    fn as_operation(&self) -> UnaryOperation {
        UnaryOperation::Sort(self.clone())
    }

    /// Return a new relation with sorted rows.
    ///
    /// A sort with no terms is a no-op. Sorting an already-sorted relation
    /// merges the operations by concatenating their terms, newer first,
    /// with duplicates dropped.
    pub fn apply(&self, target: &Relation, options: &ApplyOptions) -> Result<Relation> {
        if self.terms.is_empty() {
            return Ok(target.clone());
        }
        let mut target = target.clone();
        if let Some(preferred) = &options.preferred_engine {
            if *preferred != target.engine() {
                if options.backtrack {
                    if let Some(result) = self.insert_recursive(&target, preferred, options.lock)? {
                        debug!(operation = %self.as_operation(), engine = %preferred, "backtracked into preferred engine");
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
                        "no way to perform sort on [{}] with required engine {preferred}",
                        display_terms(&self.terms)
                    )));
                }
            }
        }
        for term in &self.terms {
            if !term.expression.is_supported_by(&target.engine()) {
                return Err(RelationError::Engine(format!(
                    "sort term {term} does not support engine {}",
                    target.engine()
                )));
            }
            if !term.expression.columns_required().is_subset(target.columns()) {
                return Err(RelationError::Column(format!(
                    "sort term {term} for target relation {target} needs columns \
                     that are not present"
                )));
            }
        }
        if let RelationNode::Unary(rel) = target.node() {
            if let UnaryOperation::Sort(inner) = &rel.operation {
                let mut new_terms = self.terms.clone();
                for term in inner.terms() {
                    if !new_terms.contains(term) {
                        new_terms.push(term.clone());
                    }
                }
                return Sort::new(new_terms)
                    .apply(&rel.target, &ApplyOptions::lock_only(options.lock));
            }
        }
        Ok(build_unary(self.as_operation(), &target, options.lock))
    }

    /// Try to insert this sort upstream of `target` so that it is
    /// evaluated in `preferred`; `None` means no valid insertion point.
    ///
    /// The sort may only sink below operations that preserve order in the
    /// engine they run in, so that its ordering survives to the root.
    fn insert_recursive(
        &self,
        target: &Relation,
        preferred: &EngineRef,
        lock: bool,
    ) -> Result<Option<Relation>> {
        if target.is_locked() {
            return Ok(None);
        }
        let RelationNode::Unary(rel) = target.node() else {
            return Ok(None);
        };
        let next = &rel.target;
        if !target
            .engine()
            .preserves_order(OrderedOperation::Unary(&rel.operation))
        {
            return Ok(None);
        }
        if rel.operation.is_order_dependent() {
            return Ok(None);
        }
        if !self.columns_required().is_subset(next.columns()) {
            return Ok(None);
        }
        if next.engine() == *preferred {
            let pushed = self.apply(next, &ApplyOptions::lock_only(lock))?;
            return rel.operation.apply(&pushed).map(Some);
        }
        if let Some(new_next) = self.insert_recursive(next, preferred, lock)? {
            return rel.operation.apply(&new_next).map(Some);
        }
        Ok(None)
    }
}

fn display_terms(terms: &[SortTerm]) -> String {
    terms
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for Sort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sort[{}]", display_terms(&self.terms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::ColumnTag;

    #[test]
    fn test_display() {
        let sort = Sort::new(vec![
            SortTerm::ascending(ColumnExpression::reference(ColumnTag::key("a"))),
            SortTerm::descending(ColumnExpression::reference(ColumnTag::key("b"))),
        ]);
        assert_eq!(sort.to_string(), "sort[a, -b]");
    }
}
