//! Materialization markers.

use std::fmt;

use crate::engine::OrderedOperation;
use crate::error::Result;
use crate::relation::{Relation, RelationNode};

use super::{build_unary, UnaryOperation};

/// A marker operation indicating the upstream tree should be evaluated
/// once, with the result saved and reused.
///
/// Materialization relations default to locked, since they reflect user
/// intent to cache a specific tree, and are the only non-leaf relations
/// whose payload may be populated (by a processor, under `name`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Materialization {
    name: Option<String>,
}

impl Materialization {
    /// Materialization whose name is minted from the engine at apply time.
    pub fn new() -> Self {
        Materialization { name: None }
    }

    /// Materialization with an explicit payload name.
    pub fn named(name: impl Into<String>) -> Self {
        Materialization {
            name: Some(name.into()),
        }
    }

    /// Name of the cached payload within the engine; always present on an
    /// operation attached to a relation node.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Mark `target` for caching.
    ///
    /// A leaf or an existing materialization is returned unchanged (the
    /// name and prefix are ignored). An unnamed operation takes its name
    /// from `Engine::get_relation_name(name_prefix)`.
    pub fn apply(
        &self,
        target: &Relation,
        name_prefix: &str,
        lock: bool,
        strip_ordering: bool,
    ) -> Result<Relation> {
        match target.node() {
            RelationNode::Leaf(_) => return Ok(target.clone()),
            RelationNode::Unary(rel)
                if matches!(rel.operation, UnaryOperation::Materialization(_)) =>
            {
                return Ok(target.clone());
            }
            _ => {}
        }
        let operation = UnaryOperation::Materialization(self.clone());
        let target = if target
            .engine()
            .preserves_order(OrderedOperation::Unary(&operation))
        {
            target.clone()
        } else {
            let message = format!(
                "materialization in engine {} will not preserve order when applied to {target}",
                target.engine()
            );
            target.expect_unordered((!strip_ordering).then_some(message.as_str()))?
        };
        let operation = match &self.name {
            Some(_) => self.clone(),
            None => Materialization::named(target.engine().get_relation_name(name_prefix)),
        };
        Ok(build_unary(
            UnaryOperation::Materialization(operation),
            &target,
            lock,
        ))
    }
}

impl Default for Materialization {
    fn default() -> Self {
        Materialization::new()
    }
}

impl fmt::Display for Materialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "materialize['{name}']"),
            None => f.write_str("materialize"),
        }
    }
}
