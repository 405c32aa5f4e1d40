//! Engine-to-engine transfers.

use std::fmt;

use crate::engine::{EngineRef, OrderedOperation};
use crate::error::Result;
use crate::relation::Relation;

use super::{build_unary, UnaryOperation};

/// A marker operation that moves relation content to another engine.
///
/// A single engine generally cannot process a tree containing transfers;
/// an external processor walks the tree and executes them at the
/// boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    destination: EngineRef,
}

impl Transfer {
    pub fn new(destination: EngineRef) -> Self {
        Transfer { destination }
    }

    /// Engine the relation content will be moved to.
    pub fn destination(&self) -> &EngineRef {
        &self.destination
    }

    /// Return a new relation in the destination engine; `target` itself
    /// when it is already there.
    pub fn apply(&self, target: &Relation, lock: bool, strip_ordering: bool) -> Result<Relation> {
        if target.engine() == self.destination {
            return Ok(target.clone());
        }
        let operation = UnaryOperation::Transfer(self.clone());
        let target = if target
            .engine()
            .preserves_order(OrderedOperation::Unary(&operation))
        {
            target.clone()
        } else {
            let message = format!(
                "transfer from engine {} to {} will not preserve order when applied to {target}",
                target.engine(),
                self.destination
            );
            target.expect_unordered((!strip_ordering).then_some(message.as_str()))?
        };
        Ok(build_unary(operation, &target, lock))
    }
}

impl fmt::Display for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "→[{}]", self.destination)
    }
}
