//! # SQL engine
//!
//! The SQL backend translates relation trees into `sqlparser` AST queries;
//! rendering the result with `to_string()` yields executable SQL. Payloads
//! in this engine are [`SelectParts`] structs describing a table or simple
//! `SELECT`.
//!
//! The translation requires every relation in the tree to be in this
//! engine: `Transfer` boundaries and payload-less `Materialization`s must
//! be handled by a processor before conversion.

use std::collections::HashMap;
use std::sync::Arc;

use sqlparser::ast::{self, Ident, ObjectName, SetExpr};

use crate::column::{ColumnExpression, ColumnSet, ColumnTag, Predicate, Value};
use crate::engine::{Engine, EngineRef, GenericEngine, OrderedOperation, Payload};
use crate::error::{RelationError, Result};
use crate::operations::{ApplyOptions, Slice, Sort, SortTerm, UnaryOperation};
use crate::relation::{Relation, RelationNode};

mod select_parts;

pub use select_parts::SelectParts;

/// Name of the column standing in for relations with no real columns; SQL
/// selects cannot be column-free.
pub const EMPTY_COLUMNS_NAME: &str = "IGNORED";

/// Engine-specific function type: builds a SQL expression from converted
/// argument expressions.
pub type SqlFunction = fn(Vec<ast::Expr>) -> ast::Expr;

/// Mapping from column tag to the SQL expression that computes it.
pub type ColumnsAvailable = HashMap<ColumnTag, ast::Expr>;

// ============================================================================
// Engine
// ============================================================================

/// A concrete engine for relations backed by a SQL database.
#[derive(Debug)]
pub struct SqlEngine {
    generic: GenericEngine<SqlFunction>,
}

impl SqlEngine {
    pub fn new(name: impl Into<String>) -> Self {
        SqlEngine {
            generic: GenericEngine::new(name),
        }
    }

    pub fn with_functions(
        name: impl Into<String>,
        functions: HashMap<String, SqlFunction>,
    ) -> Self {
        SqlEngine {
            generic: GenericEngine::with_functions(name, functions),
        }
    }

    /// Convert a relation tree to a SQL `SELECT` (or compound `SELECT`)
    /// query.
    pub fn to_executable(&self, relation: &Relation, options: &SelectOptions) -> Result<ast::Query> {
        if !relation.engine().refers_to(self) {
            return Err(RelationError::Engine(format!(
                "engine {} cannot operate on relation {relation} with engine {}; \
                 process transfers first",
                self.name(),
                relation.engine()
            )));
        }
        match relation.node() {
            RelationNode::Leaf(_) => {
                SelectParts::from_relation(relation, self)?.to_query(relation.columns(), self, options)
            }
            RelationNode::Unary(rel) => match &rel.operation {
                UnaryOperation::Deduplication(_) => self.to_executable(
                    &rel.target,
                    &SelectOptions {
                        distinct: true,
                        ..options.clone()
                    },
                ),
                UnaryOperation::Slice(slice) => {
                    if options.offset != 0 || options.limit.is_some() {
                        // The caller imposes another slice on top; apply it
                        // as an operation so the two merge, then retry.
                        let merged = Slice::new(
                            options.offset,
                            options.limit.map(|limit| options.offset + limit),
                        )
                        .apply(relation, false)?;
                        self.to_executable(
                            &merged,
                            &SelectOptions {
                                offset: 0,
                                limit: None,
                                ..options.clone()
                            },
                        )
                    } else if options.distinct || !options.order_by.is_empty() {
                        // DISTINCT and ORDER BY on the same SELECT would act
                        // before OFFSET/LIMIT; close the slice into a
                        // subquery and apply them outside it.
                        SelectParts::from_relation(relation, self)?.to_query(
                            relation.columns(),
                            self,
                            &SelectOptions {
                                offset: 0,
                                limit: None,
                                ..options.clone()
                            },
                        )
                    } else {
                        self.to_executable(
                            &rel.target,
                            &SelectOptions {
                                offset: slice.start(),
                                limit: slice.limit(),
                                ..options.clone()
                            },
                        )
                    }
                }
                UnaryOperation::Sort(sort) => {
                    if !options.order_by.is_empty() {
                        // The caller imposes its own sorting; apply it as an
                        // operation so the terms merge, then retry.
                        let merged = Sort::new(options.order_by.clone())
                            .apply(relation, &ApplyOptions::default())?;
                        self.to_executable(
                            &merged,
                            &SelectOptions {
                                order_by: Vec::new(),
                                ..options.clone()
                            },
                        )
                    } else {
                        self.to_executable(
                            &rel.target,
                            &SelectOptions {
                                order_by: sort.terms().to_vec(),
                                ..options.clone()
                            },
                        )
                    }
                }
                UnaryOperation::Transfer(transfer) => Err(RelationError::Engine(format!(
                    "engine {} cannot handle transfer from {} to {}; \
                     process the tree first",
                    self.name(),
                    rel.target.engine(),
                    transfer.destination()
                ))),
                UnaryOperation::Calculation(_)
                | UnaryOperation::Materialization(_)
                | UnaryOperation::Projection(_)
                | UnaryOperation::Selection(_) => SelectParts::from_relation(relation, self)?
                    .to_query(relation.columns(), self, options),
                other => Err(RelationError::Engine(format!(
                    "custom operation {other} is not supported by engine {}",
                    self.name()
                ))),
            },
            RelationNode::Binary(rel) => match &rel.operation {
                crate::operations::BinaryOperation::Chain(_) => {
                    let lhs = self.to_executable(&rel.lhs, &SelectOptions::default())?;
                    let rhs = self.to_executable(&rel.rhs, &SelectOptions::default())?;
                    let body = SetExpr::SetOperation {
                        op: ast::SetOperator::Union,
                        set_quantifier: if options.distinct {
                            // Plain UNION deduplicates.
                            ast::SetQuantifier::None
                        } else {
                            ast::SetQuantifier::All
                        },
                        left: query_to_set_expr(lhs, self),
                        right: query_to_set_expr(rhs, self),
                    };
                    // Union output columns go by their plain select aliases.
                    let columns_available: ColumnsAvailable = relation
                        .columns()
                        .iter()
                        .map(|tag| {
                            (
                                tag.clone(),
                                ast::Expr::Identifier(Ident::new(tag.name())),
                            )
                        })
                        .collect();
                    let order_by = options
                        .order_by
                        .iter()
                        .map(|term| self.convert_sort_term(term, &columns_available))
                        .collect::<Result<Vec<_>>>()?;
                    Ok(ast::Query {
                        order_by,
                        offset: offset_clause(options.offset),
                        limit: options.limit.map(number_expr),
                        ..default_query(body)
                    })
                }
                crate::operations::BinaryOperation::Join(_) => SelectParts::from_relation(
                    relation, self,
                )?
                .to_query(relation.columns(), self, options),
            },
        }
    }

    pub fn get_function(&self, name: &str) -> Option<&SqlFunction> {
        self.generic.get_function(name)
    }

    // ------------------------------------------------------------------
    // Conversions
    // ------------------------------------------------------------------

    /// Extract the tag-to-expression mapping a single FROM factor provides,
    /// qualifying column names by the factor's alias or table name.
    pub(crate) fn extract_mapping(
        &self,
        tags: &ColumnSet,
        factor: &ast::TableFactor,
    ) -> Result<ColumnsAvailable> {
        let qualifier = match factor {
            ast::TableFactor::Table {
                alias: Some(alias), ..
            } => alias.name.clone(),
            ast::TableFactor::Table { name, alias: None, .. } => name
                .0
                .last()
                .cloned()
                .ok_or_else(|| RelationError::Engine("table factor with empty name".to_string()))?,
            ast::TableFactor::Derived {
                alias: Some(alias), ..
            } => alias.name.clone(),
            other => {
                return Err(RelationError::Engine(format!(
                    "cannot extract columns from FROM clause {other}"
                )));
            }
        };
        Ok(tags
            .iter()
            .map(|tag| {
                (
                    tag.clone(),
                    ast::Expr::CompoundIdentifier(vec![
                        qualifier.clone(),
                        Ident::new(tag.name()),
                    ]),
                )
            })
            .collect())
    }

    /// Convert a column expression to a SQL expression over the available
    /// columns.
    pub fn convert_column_expression(
        &self,
        expression: &ColumnExpression,
        columns_available: &ColumnsAvailable,
    ) -> Result<ast::Expr> {
        match expression {
            ColumnExpression::Literal(value) => Ok(convert_value(value)),
            ColumnExpression::Reference(tag) => {
                columns_available.get(tag).cloned().ok_or_else(|| {
                    RelationError::Column(format!("column {tag} is not available for conversion"))
                })
            }
            ColumnExpression::Function { name, args } => {
                let sql_args = args
                    .iter()
                    .map(|arg| self.convert_column_expression(arg, columns_available))
                    .collect::<Result<Vec<_>>>()?;
                self.convert_function(name, sql_args)
            }
        }
    }

    /// Convert a predicate to a boolean SQL expression over the available
    /// columns.
    pub fn convert_predicate(
        &self,
        predicate: &Predicate,
        columns_available: &ColumnsAvailable,
    ) -> Result<ast::Expr> {
        match predicate {
            Predicate::Literal(value) => Ok(ast::Expr::Value(ast::Value::Boolean(*value))),
            Predicate::Reference(tag) => columns_available.get(tag).cloned().ok_or_else(|| {
                RelationError::Column(format!("column {tag} is not available for conversion"))
            }),
            Predicate::Function { name, args } => {
                let sql_args = args
                    .iter()
                    .map(|arg| self.convert_column_expression(arg, columns_available))
                    .collect::<Result<Vec<_>>>()?;
                self.convert_function(name, sql_args)
            }
            Predicate::LogicalAnd(operands) => {
                let converted = operands
                    .iter()
                    .map(|operand| self.convert_predicate(operand, columns_available))
                    .collect::<Result<Vec<_>>>()?;
                Ok(conjoin(converted)
                    .unwrap_or(ast::Expr::Value(ast::Value::Boolean(true))))
            }
            Predicate::LogicalOr(operands) => {
                let converted = operands
                    .iter()
                    .map(|operand| self.convert_predicate(operand, columns_available))
                    .collect::<Result<Vec<_>>>()?;
                Ok(combine(converted, ast::BinaryOperator::Or)
                    .unwrap_or(ast::Expr::Value(ast::Value::Boolean(false))))
            }
            Predicate::LogicalNot(operand) => Ok(ast::Expr::UnaryOp {
                op: ast::UnaryOperator::Not,
                expr: Box::new(ast::Expr::Nested(Box::new(
                    self.convert_predicate(operand, columns_available)?,
                ))),
            }),
        }
    }

    /// Flatten a predicate's conjunctions and convert each operand; a
    /// trivially false predicate converts to a single `FALSE`.
    pub fn convert_flattened_predicate(
        &self,
        predicate: &Predicate,
        columns_available: &ColumnsAvailable,
    ) -> Result<Vec<ast::Expr>> {
        match predicate.flatten_and() {
            None => Ok(vec![ast::Expr::Value(ast::Value::Boolean(false))]),
            Some(operands) => operands
                .iter()
                .map(|operand| self.convert_predicate(operand, columns_available))
                .collect(),
        }
    }

    /// Convert a sort term to an `ORDER BY` expression.
    pub fn convert_sort_term(
        &self,
        term: &SortTerm,
        columns_available: &ColumnsAvailable,
    ) -> Result<ast::OrderByExpr> {
        Ok(ast::OrderByExpr {
            expr: self.convert_column_expression(&term.expression, columns_available)?,
            asc: Some(term.ascending),
            nulls_first: None,
        })
    }

    /// Standard operator names first, then the functions map.
    fn convert_function(&self, name: &str, mut args: Vec<ast::Expr>) -> Result<ast::Expr> {
        if let (Some(op), 2) = (binary_operator(name), args.len()) {
            let right = args.pop().expect("length checked");
            let left = args.pop().expect("length checked");
            return Ok(ast::Expr::BinaryOp {
                left: Box::new(left),
                op,
                right: Box::new(right),
            });
        }
        if let (Some(op), 1) = (unary_operator(name), args.len()) {
            let operand = args.pop().expect("length checked");
            return Ok(ast::Expr::UnaryOp {
                op,
                expr: Box::new(ast::Expr::Nested(Box::new(operand))),
            });
        }
        if let Some(function) = self.generic.get_function(name) {
            return Ok(function(args));
        }
        Err(RelationError::Engine(format!(
            "function {name} is not supported by engine {}",
            self.name()
        )))
    }
}

impl Engine for SqlEngine {
    fn name(&self) -> &str {
        self.generic.name()
    }

    fn get_relation_name(&self, prefix: &str) -> String {
        self.generic.get_relation_name(prefix)
    }

    fn preserves_order(&self, operation: OrderedOperation<'_>) -> bool {
        match operation {
            // SELECT DISTINCT ... ORDER BY keeps the ORDER BY, as does
            // SELECT ... ORDER BY ... OFFSET ... LIMIT; either can only be
            // ordered by an immediately-upstream sort, which does not close
            // a subquery before they apply.
            OrderedOperation::Unary(
                UnaryOperation::Slice(_) | UnaryOperation::Deduplication(_),
            ) => true,
            OrderedOperation::Unary(UnaryOperation::Transfer(transfer)) => {
                if transfer.destination().refers_to(self) {
                    // Transfer into SQL means inserting into a table, which
                    // forgets row order.
                    false
                } else {
                    transfer.destination().preserves_order(operation)
                }
            }
            _ => false,
        }
    }

    fn supports_function(&self, name: &str) -> bool {
        self.generic.supports_function(name)
    }

    fn get_join_identity_payload(&self) -> Option<Payload> {
        let alias = self.get_relation_name("identity");
        let query = default_query(SetExpr::Select(Box::new(ast::Select {
            projection: vec![empty_columns_item()],
            ..default_select()
        })));
        Some(Arc::new(SelectParts {
            from: derived_from(query, &alias),
            where_: Vec::new(),
            columns_available: Some(ColumnsAvailable::new()),
        }))
    }

    fn get_doomed_payload(&self, columns: &ColumnSet) -> Option<Payload> {
        let alias = self.get_relation_name("doomed");
        let mut tags: Vec<&ColumnTag> = columns.iter().collect();
        tags.sort_unstable();
        let mut projection: Vec<ast::SelectItem> = tags
            .iter()
            .map(|tag| ast::SelectItem::ExprWithAlias {
                expr: ast::Expr::Value(ast::Value::Null),
                alias: Ident::new(tag.name()),
            })
            .collect();
        if projection.is_empty() {
            projection.push(empty_columns_item());
        }
        let query = default_query(SetExpr::Select(Box::new(ast::Select {
            projection,
            selection: Some(ast::Expr::Value(ast::Value::Boolean(false))),
            ..default_select()
        })));
        Some(Arc::new(SelectParts {
            from: derived_from(query, &alias),
            where_: Vec::new(),
            columns_available: None,
        }))
    }
}

// ============================================================================
// Select options
// ============================================================================

/// Modifiers applied to a generated `SELECT`.
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    pub distinct: bool,
    pub order_by: Vec<SortTerm>,
    pub offset: u64,
    pub limit: Option<u64>,
}

// ============================================================================
// Leaf helper
// ============================================================================

/// Create a leaf relation backed by a database table of the given columns.
/// Row bounds are unknown (`0..`).
pub fn table_leaf(engine: &EngineRef, table: &str, columns: ColumnSet) -> Relation {
    let payload = SelectParts {
        from: ast::TableWithJoins {
            relation: table_factor(table),
            joins: Vec::new(),
        },
        where_: Vec::new(),
        columns_available: None,
    };
    Relation::leaf(
        engine.clone(),
        table,
        columns,
        Some(Arc::new(payload)),
        0,
        None,
    )
}

// ============================================================================
// AST helpers
// ============================================================================

pub(crate) fn default_query(body: SetExpr) -> ast::Query {
    ast::Query {
        with: None,
        body: Box::new(body),
        order_by: Vec::new(),
        limit: None,
        limit_by: Vec::new(),
        offset: None,
        fetch: None,
        locks: Vec::new(),
        for_clause: None,
    }
}

pub(crate) fn default_select() -> ast::Select {
    ast::Select {
        distinct: None,
        top: None,
        projection: Vec::new(),
        into: None,
        from: Vec::new(),
        lateral_views: Vec::new(),
        selection: None,
        group_by: ast::GroupByExpr::Expressions(Vec::new()),
        cluster_by: Vec::new(),
        distribute_by: Vec::new(),
        sort_by: Vec::new(),
        having: None,
        named_window: Vec::new(),
        qualify: None,
        value_table_mode: None,
    }
}

pub(crate) fn table_factor(table: &str) -> ast::TableFactor {
    ast::TableFactor::Table {
        name: ObjectName(vec![Ident::new(table)]),
        alias: None,
        args: None,
        with_hints: Vec::new(),
        version: None,
        partitions: Vec::new(),
    }
}

pub(crate) fn derived_from(subquery: ast::Query, alias: &str) -> ast::TableWithJoins {
    ast::TableWithJoins {
        relation: ast::TableFactor::Derived {
            lateral: false,
            subquery: Box::new(subquery),
            alias: Some(ast::TableAlias {
                name: Ident::new(alias),
                columns: Vec::new(),
            }),
        },
        joins: Vec::new(),
    }
}

/// The literal column standing in for a relation with no real columns.
pub(crate) fn empty_columns_item() -> ast::SelectItem {
    ast::SelectItem::ExprWithAlias {
        expr: ast::Expr::Value(ast::Value::Boolean(true)),
        alias: Ident::new(EMPTY_COLUMNS_NAME),
    }
}

pub(crate) fn number_expr(value: u64) -> ast::Expr {
    ast::Expr::Value(ast::Value::Number(value.to_string(), false))
}

pub(crate) fn offset_clause(offset: u64) -> Option<ast::Offset> {
    if offset == 0 {
        None
    } else {
        Some(ast::Offset {
            value: number_expr(offset),
            rows: ast::OffsetRows::None,
        })
    }
}

/// Combine expressions with a binary operator, left-associatively.
pub(crate) fn combine(
    exprs: Vec<ast::Expr>,
    op: ast::BinaryOperator,
) -> Option<ast::Expr> {
    exprs.into_iter().reduce(|left, right| ast::Expr::BinaryOp {
        left: Box::new(left),
        op: op.clone(),
        right: Box::new(right),
    })
}

/// AND together a list of boolean expressions.
pub(crate) fn conjoin(exprs: Vec<ast::Expr>) -> Option<ast::Expr> {
    combine(exprs, ast::BinaryOperator::And)
}

fn convert_value(value: &Value) -> ast::Expr {
    ast::Expr::Value(match value {
        Value::Null => ast::Value::Null,
        Value::Bool(b) => ast::Value::Boolean(*b),
        Value::Int(i) => ast::Value::Number(i.to_string(), false),
        Value::Float(x) => ast::Value::Number(x.to_string(), false),
        Value::Str(s) => ast::Value::SingleQuotedString(s.clone()),
    })
}

fn binary_operator(name: &str) -> Option<ast::BinaryOperator> {
    Some(match name {
        "add" => ast::BinaryOperator::Plus,
        "sub" => ast::BinaryOperator::Minus,
        "mul" => ast::BinaryOperator::Multiply,
        "truediv" => ast::BinaryOperator::Divide,
        "eq" => ast::BinaryOperator::Eq,
        "ne" => ast::BinaryOperator::NotEq,
        "lt" => ast::BinaryOperator::Lt,
        "le" => ast::BinaryOperator::LtEq,
        "gt" => ast::BinaryOperator::Gt,
        "ge" => ast::BinaryOperator::GtEq,
        "and_" => ast::BinaryOperator::And,
        "or_" => ast::BinaryOperator::Or,
        _ => return None,
    })
}

fn unary_operator(name: &str) -> Option<ast::UnaryOperator> {
    Some(match name {
        "neg" => ast::UnaryOperator::Minus,
        "not_" => ast::UnaryOperator::Not,
        _ => return None,
    })
}

/// Reuse a query's body directly when it has no outer clauses; otherwise
/// wrap it in `SELECT * FROM (query)`.
fn query_to_set_expr(query: ast::Query, engine: &SqlEngine) -> Box<SetExpr> {
    let is_simple = query.with.is_none()
        && query.order_by.is_empty()
        && query.limit.is_none()
        && query.offset.is_none()
        && query.fetch.is_none()
        && query.locks.is_empty();
    if is_simple {
        return query.body;
    }
    Box::new(SetExpr::Select(Box::new(ast::Select {
        projection: vec![ast::SelectItem::Wildcard(
            ast::WildcardAdditionalOptions::default(),
        )],
        from: vec![derived_from(query, &engine.get_relation_name("subquery"))],
        ..default_select()
    })))
}
