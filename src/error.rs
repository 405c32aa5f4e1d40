//! Error taxonomy for relation-tree construction.
//!
//! All three kinds are recoverable and raised synchronously from `apply`;
//! the library never catches them itself. Failed optimizer pushdowns are
//! reported by absence of a result, not by an error.

/// Errors raised while building or rewriting relation trees.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelationError {
    /// A column contract was violated: missing, duplicate, mismatched
    /// columns, or an empty unique key.
    #[error("column error: {0}")]
    Column(String),

    /// An engine contract was violated: mismatched engines, an expression
    /// the engine cannot evaluate, or no way to reach a preferred engine.
    #[error("engine error: {0}")]
    Engine(String),

    /// An ordered subtree was found where the next operation would not
    /// preserve its order, and stripping was not requested.
    #[error("row order error: {0}")]
    RowOrder(String),
}

pub type Result<T> = std::result::Result<T, RelationError>;
