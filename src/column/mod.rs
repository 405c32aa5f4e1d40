//! # Column model
//!
//! Columns are identified by opaque [`ColumnTag`]s; the values computed for
//! them are described by [`ColumnExpression`] and [`Predicate`] trees. The
//! core never evaluates expressions - it only inspects which columns they
//! require and whether a given engine can evaluate them.

use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::engine::EngineRef;

/// Set of column tags; the column footprint of relations and operations.
pub type ColumnSet = HashSet<ColumnTag>;

// ============================================================================
// ColumnTag
// ============================================================================

/// Opaque, hashable identifier for a column.
///
/// Equality defines column identity. `is_key` marks columns that establish
/// row uniqueness on their own; [`crate::operations::Deduplication`] uses it
/// to default its unique key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnTag {
    name: String,
    is_key: bool,
}

impl ColumnTag {
    /// New non-key column tag.
    pub fn new(name: impl Into<String>) -> Self {
        ColumnTag {
            name: name.into(),
            is_key: false,
        }
    }

    /// New key column tag (participates in natural uniqueness).
    pub fn key(name: impl Into<String>) -> Self {
        ColumnTag {
            name: name.into(),
            is_key: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether uniqueness may be established by this column alone.
    pub fn is_key(&self) -> bool {
        self.is_key
    }
}

impl fmt::Display for ColumnTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Render a column set as a stable, name-sorted list.
pub(crate) fn display_columns(columns: &ColumnSet) -> String {
    let mut names: Vec<&str> = columns.iter().map(ColumnTag::name).collect();
    names.sort_unstable();
    names.join(", ")
}

// ============================================================================
// Value
// ============================================================================

/// Literal value usable in column expressions and in-memory rows.
///
/// `Eq` and `Hash` are implemented manually because of the `f64` payload;
/// floats compare and hash by bit pattern so rows can key maps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        core::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(x) => x.to_bits().hash(state),
            Value::Str(s) => s.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "'{s}'"),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

// ============================================================================
// Standard function vocabulary
// ============================================================================

/// Function names every engine is expected to evaluate before consulting its
/// own `functions` map. The names follow the usual operator vocabulary.
pub const STANDARD_FUNCTIONS: &[&str] = &[
    "add", "sub", "mul", "truediv", "neg", "eq", "ne", "lt", "le", "gt", "ge", "and_", "or_",
    "not_",
];

/// Whether `name` belongs to the standard operator vocabulary.
pub fn is_standard_function(name: &str) -> bool {
    STANDARD_FUNCTIONS.contains(&name)
}

/// Infix spelling for a standard binary function, if it has one.
fn infix_symbol(name: &str) -> Option<&'static str> {
    Some(match name {
        "add" => "+",
        "sub" => "-",
        "mul" => "*",
        "truediv" => "/",
        "eq" => "==",
        "ne" => "!=",
        "lt" => "<",
        "le" => "<=",
        "gt" => ">",
        "ge" => ">=",
        _ => return None,
    })
}

// ============================================================================
// ColumnExpression
// ============================================================================

/// A scalar expression over columns: literals, column references, and named
/// function applications.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnExpression {
    /// A constant value.
    Literal(Value),
    /// The value of an existing column.
    Reference(ColumnTag),
    /// A named function over sub-expressions; resolved per engine.
    Function {
        name: String,
        args: Vec<ColumnExpression>,
    },
}

impl ColumnExpression {
    pub fn literal(value: impl Into<Value>) -> Self {
        ColumnExpression::Literal(value.into())
    }

    pub fn reference(tag: ColumnTag) -> Self {
        ColumnExpression::Reference(tag)
    }

    pub fn function(name: impl Into<String>, args: Vec<ColumnExpression>) -> Self {
        ColumnExpression::Function {
            name: name.into(),
            args,
        }
    }

    /// The set of columns this expression requires from its relation.
    pub fn columns_required(&self) -> ColumnSet {
        let mut result = ColumnSet::new();
        self.collect_columns(&mut result);
        result
    }

    fn collect_columns(&self, into: &mut ColumnSet) {
        match self {
            ColumnExpression::Literal(_) => {}
            ColumnExpression::Reference(tag) => {
                into.insert(tag.clone());
            }
            ColumnExpression::Function { args, .. } => {
                for arg in args {
                    arg.collect_columns(into);
                }
            }
        }
    }

    /// Whether every function this expression uses can be evaluated by
    /// `engine`.
    pub fn is_supported_by(&self, engine: &EngineRef) -> bool {
        match self {
            ColumnExpression::Literal(_) | ColumnExpression::Reference(_) => true,
            ColumnExpression::Function { name, args } => {
                engine.supports_function(name) && args.iter().all(|a| a.is_supported_by(engine))
            }
        }
    }
}

impl fmt::Display for ColumnExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnExpression::Literal(value) => write!(f, "{value}"),
            ColumnExpression::Reference(tag) => write!(f, "{tag}"),
            ColumnExpression::Function { name, args } => match (infix_symbol(name), args.len()) {
                (Some(symbol), 2) => write!(f, "{}{}{}", args[0], symbol, args[1]),
                _ => {
                    write!(f, "{name}(")?;
                    for (i, arg) in args.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{arg}")?;
                    }
                    write!(f, ")")
                }
            },
        }
    }
}

// ============================================================================
// Predicate
// ============================================================================

/// A boolean expression over columns: literals, boolean column references,
/// named predicate functions, and the logical combinators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Predicate {
    /// A constant truth value.
    Literal(bool),
    /// The value of an existing boolean column.
    Reference(ColumnTag),
    /// A named boolean function over column expressions; resolved per engine.
    Function {
        name: String,
        args: Vec<ColumnExpression>,
    },
    LogicalAnd(Vec<Predicate>),
    LogicalOr(Vec<Predicate>),
    LogicalNot(Box<Predicate>),
}

impl Predicate {
    pub fn literal(value: bool) -> Self {
        Predicate::Literal(value)
    }

    pub fn reference(tag: ColumnTag) -> Self {
        Predicate::Reference(tag)
    }

    pub fn function(name: impl Into<String>, args: Vec<ColumnExpression>) -> Self {
        Predicate::Function {
            name: name.into(),
            args,
        }
    }

    /// Conjunction of `operands`; a single operand is returned unchanged.
    pub fn logical_and(mut operands: Vec<Predicate>) -> Self {
        if operands.len() == 1 {
            operands.pop().expect("length checked")
        } else {
            Predicate::LogicalAnd(operands)
        }
    }

    pub fn and(self, other: Predicate) -> Self {
        Predicate::LogicalAnd(vec![self, other])
    }

    pub fn or(self, other: Predicate) -> Self {
        Predicate::LogicalOr(vec![self, other])
    }

    pub fn negated(self) -> Self {
        Predicate::LogicalNot(Box::new(self))
    }

    /// The set of columns this predicate requires from its relation.
    pub fn columns_required(&self) -> ColumnSet {
        let mut result = ColumnSet::new();
        self.collect_columns(&mut result);
        result
    }

    fn collect_columns(&self, into: &mut ColumnSet) {
        match self {
            Predicate::Literal(_) => {}
            Predicate::Reference(tag) => {
                into.insert(tag.clone());
            }
            Predicate::Function { args, .. } => {
                for arg in args {
                    arg.collect_columns(into);
                }
            }
            Predicate::LogicalAnd(operands) | Predicate::LogicalOr(operands) => {
                for operand in operands {
                    operand.collect_columns(into);
                }
            }
            Predicate::LogicalNot(operand) => operand.collect_columns(into),
        }
    }

    /// Whether every function this predicate uses can be evaluated by
    /// `engine`.
    pub fn is_supported_by(&self, engine: &EngineRef) -> bool {
        match self {
            Predicate::Literal(_) | Predicate::Reference(_) => true,
            Predicate::Function { name, args } => {
                engine.supports_function(name) && args.iter().all(|a| a.is_supported_by(engine))
            }
            Predicate::LogicalAnd(operands) | Predicate::LogicalOr(operands) => {
                operands.iter().all(|p| p.is_supported_by(engine))
            }
            Predicate::LogicalNot(operand) => operand.is_supported_by(engine),
        }
    }

    /// `Some(true)` / `Some(false)` for trivially constant predicates,
    /// `None` otherwise.
    pub fn as_trivial(&self) -> Option<bool> {
        match self {
            Predicate::Literal(value) => Some(*value),
            Predicate::LogicalAnd(operands) if operands.is_empty() => Some(true),
            Predicate::LogicalOr(operands) if operands.is_empty() => Some(false),
            _ => None,
        }
    }

    /// Flatten nested conjunctions into a sequence of non-trivial operands.
    ///
    /// Returns `None` if the predicate is trivially false; trivially true
    /// operands are dropped. An empty sequence means trivially true.
    pub fn flatten_and(&self) -> Option<Vec<Predicate>> {
        let mut result = Vec::new();
        if self.flatten_and_into(&mut result) {
            Some(result)
        } else {
            None
        }
    }

    fn flatten_and_into(&self, into: &mut Vec<Predicate>) -> bool {
        match self {
            Predicate::LogicalAnd(operands) => operands.iter().all(|p| p.flatten_and_into(into)),
            other => match other.as_trivial() {
                Some(true) => true,
                Some(false) => false,
                None => {
                    into.push(other.clone());
                    true
                }
            },
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Literal(value) => write!(f, "{value}"),
            Predicate::Reference(tag) => write!(f, "{tag}"),
            Predicate::Function { name, args } => match (infix_symbol(name), args.len()) {
                (Some(symbol), 2) => write!(f, "{}{}{}", args[0], symbol, args[1]),
                _ => {
                    write!(f, "{name}(")?;
                    for (i, arg) in args.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{arg}")?;
                    }
                    write!(f, ")")
                }
            },
            Predicate::LogicalAnd(operands) => {
                if operands.is_empty() {
                    return write!(f, "true");
                }
                for (i, operand) in operands.iter().enumerate() {
                    if i > 0 {
                        write!(f, " and ")?;
                    }
                    write!(f, "{operand}")?;
                }
                Ok(())
            }
            Predicate::LogicalOr(operands) => {
                if operands.is_empty() {
                    return write!(f, "false");
                }
                for (i, operand) in operands.iter().enumerate() {
                    if i > 0 {
                        write!(f, " or ")?;
                    }
                    write!(f, "{operand}")?;
                }
                Ok(())
            }
            Predicate::LogicalNot(operand) => write!(f, "not({operand})"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
