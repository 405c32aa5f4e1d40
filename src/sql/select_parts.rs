//! Accumulation of simple `SELECT` queries from relation trees.

use sqlparser::ast::{self, Ident, SetExpr};

use crate::column::{ColumnSet, ColumnTag};
use crate::engine::{payload_downcast, Engine};
use crate::error::{RelationError, Result};
use crate::operations::{BinaryOperation, UnaryOperation};
use crate::relation::{Relation, RelationNode};

use super::{
    conjoin, default_query, default_select, derived_from, empty_columns_item, offset_clause,
    ColumnsAvailable, SelectOptions, SqlEngine,
};

/// A SQL table or simple `SELECT` query under construction: a FROM clause,
/// WHERE terms to be conjoined, and the expressions that compute each
/// column tag.
///
/// `columns_available: None` means the columns are exactly the ones the
/// FROM clause's single factor provides, extracted (qualified by its
/// alias) only when needed.
#[derive(Debug, Clone)]
pub struct SelectParts {
    pub from: ast::TableWithJoins,
    pub where_: Vec<ast::Expr>,
    pub columns_available: Option<ColumnsAvailable>,
}

impl SelectParts {
    /// Resolve `columns_available`, extracting from the FROM clause when
    /// it has not been populated yet.
    pub fn resolved_columns(
        &self,
        columns: &ColumnSet,
        engine: &SqlEngine,
    ) -> Result<ColumnsAvailable> {
        match &self.columns_available {
            Some(available) => Ok(available.clone()),
            None => engine.extract_mapping(columns, &self.from.relation),
        }
    }

    /// Build the executable `SELECT` for these parts, projecting
    /// `select_columns` and applying the given modifiers.
    pub fn to_query(
        &self,
        select_columns: &ColumnSet,
        engine: &SqlEngine,
        options: &SelectOptions,
    ) -> Result<ast::Query> {
        let columns_available = self.resolved_columns(select_columns, engine)?;
        let mut tags: Vec<&ColumnTag> = select_columns.iter().collect();
        tags.sort_unstable();
        let mut projection: Vec<ast::SelectItem> = tags
            .iter()
            .map(|tag| {
                columns_available
                    .get(tag)
                    .cloned()
                    .map(|expr| ast::SelectItem::ExprWithAlias {
                        expr,
                        alias: Ident::new(tag.name()),
                    })
                    .ok_or_else(|| {
                        RelationError::Column(format!(
                            "column {tag} is not available for conversion"
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        if projection.is_empty() {
            projection.push(empty_columns_item());
        }
        let order_by = options
            .order_by
            .iter()
            .map(|term| engine.convert_sort_term(term, &columns_available))
            .collect::<Result<Vec<_>>>()?;
        Ok(ast::Query {
            order_by,
            offset: offset_clause(options.offset),
            limit: options.limit.map(super::number_expr),
            ..default_query(SetExpr::Select(Box::new(ast::Select {
                distinct: options.distinct.then_some(ast::Distinct::Distinct),
                projection,
                from: vec![self.from.clone()],
                selection: conjoin(self.where_.clone()),
                ..default_select()
            })))
        })
    }

    /// Like [`SelectParts::from_relation`], but with `columns_available`
    /// guaranteed to be populated for the relation's columns.
    pub fn from_relation_full(relation: &Relation, engine: &SqlEngine) -> Result<SelectParts> {
        let parts = SelectParts::from_relation(relation, engine)?;
        let columns_available = parts.resolved_columns(relation.columns(), engine)?;
        Ok(SelectParts {
            columns_available: Some(columns_available),
            ..parts
        })
    }

    /// Construct select parts from a relation, translating the operations
    /// this representation can absorb and closing everything else over a
    /// subquery.
    pub fn from_relation(relation: &Relation, engine: &SqlEngine) -> Result<SelectParts> {
        if !relation.engine().refers_to(engine) {
            return Err(RelationError::Engine(format!(
                "engine {} cannot operate on relation {relation} with engine {}; \
                 process transfers first",
                engine.name(),
                relation.engine()
            )));
        }
        if let Some(payload) = relation.payload() {
            return payload_downcast::<SelectParts>(payload).cloned().ok_or_else(|| {
                RelationError::Engine(format!(
                    "relation {relation} carries a payload that is not SQL select parts"
                ))
            });
        }
        match relation.node() {
            RelationNode::Leaf(leaf) => Err(RelationError::Engine(format!(
                "leaf relation {} has no SQL payload",
                leaf.name
            ))),
            RelationNode::Unary(rel) => match &rel.operation {
                UnaryOperation::Materialization(materialization) => {
                    Err(RelationError::Engine(format!(
                        "cannot persist materialization {:?} during SQL conversion; \
                         process the tree first",
                        materialization.name().unwrap_or_default()
                    )))
                }
                UnaryOperation::Calculation(calculation) => {
                    let mut parts = SelectParts::from_relation_full(&rel.target, engine)?;
                    let columns_available = parts
                        .columns_available
                        .as_mut()
                        .expect("from_relation_full populates columns");
                    let expr = engine
                        .convert_column_expression(calculation.expression(), columns_available)?;
                    columns_available.insert(calculation.tag().clone(), expr);
                    Ok(parts)
                }
                // A projection only affects which columns the final SELECT
                // lists, and to_query already projects the relation's own
                // columns; no subquery is needed here.
                UnaryOperation::Projection(_) => SelectParts::from_relation(&rel.target, engine),
                UnaryOperation::Selection(selection) => {
                    let mut parts = SelectParts::from_relation_full(&rel.target, engine)?;
                    let columns_available = parts
                        .columns_available
                        .as_ref()
                        .expect("from_relation_full populates columns");
                    parts.where_.extend(
                        engine
                            .convert_flattened_predicate(selection.predicate(), columns_available)?,
                    );
                    Ok(parts)
                }
                _ => SelectParts::subquery(relation, engine),
            },
            RelationNode::Binary(rel) => match &rel.operation {
                BinaryOperation::Join(join) => {
                    let lhs_parts = SelectParts::from_relation_full(&rel.lhs, engine)?;
                    let rhs_parts = SelectParts::from_relation_full(&rel.rhs, engine)?;
                    let lhs_columns = lhs_parts
                        .columns_available
                        .as_ref()
                        .expect("from_relation_full populates columns");
                    let rhs_columns = rhs_parts
                        .columns_available
                        .as_ref()
                        .expect("from_relation_full populates columns");
                    let mut on_terms: Vec<ast::Expr> = Vec::new();
                    let mut common: Vec<&ColumnTag> =
                        join.common_columns()?.iter().collect();
                    common.sort_unstable();
                    for tag in common {
                        let (Some(left), Some(right)) =
                            (lhs_columns.get(tag), rhs_columns.get(tag))
                        else {
                            return Err(RelationError::Column(format!(
                                "common column {tag} is not available on both join sides"
                            )));
                        };
                        on_terms.push(ast::Expr::BinaryOp {
                            left: Box::new(left.clone()),
                            op: ast::BinaryOperator::Eq,
                            right: Box::new(right.clone()),
                        });
                    }
                    let mut columns_available = lhs_columns.clone();
                    columns_available.extend(rhs_columns.clone());
                    if join.predicate().as_trivial() != Some(true) {
                        on_terms.extend(
                            engine.convert_flattened_predicate(
                                join.predicate(),
                                &columns_available,
                            )?,
                        );
                    }
                    let on_clause =
                        conjoin(on_terms).unwrap_or(ast::Expr::Value(ast::Value::Boolean(true)));
                    let mut joins = lhs_parts.from.joins.clone();
                    joins.push(ast::Join {
                        relation: collapse_from(rhs_parts.from),
                        join_operator: ast::JoinOperator::Inner(ast::JoinConstraint::On(
                            on_clause,
                        )),
                    });
                    let mut where_ = lhs_parts.where_;
                    where_.extend(rhs_parts.where_);
                    Ok(SelectParts {
                        from: ast::TableWithJoins {
                            relation: lhs_parts.from.relation,
                            joins,
                        },
                        where_,
                        columns_available: Some(columns_available),
                    })
                }
                BinaryOperation::Chain(_) => SelectParts::subquery(relation, engine),
            },
        }
    }

    /// Close a relation over a subquery: whatever `to_executable` produces,
    /// aliased as a derived table.
    fn subquery(relation: &Relation, engine: &SqlEngine) -> Result<SelectParts> {
        let query = engine.to_executable(relation, &SelectOptions::default())?;
        Ok(SelectParts {
            from: derived_from(query, &engine.get_relation_name("subquery")),
            where_: Vec::new(),
            columns_available: None,
        })
    }
}

/// Use a FROM clause as a single join operand, nesting it when it already
/// contains joins of its own.
fn collapse_from(from: ast::TableWithJoins) -> ast::TableFactor {
    if from.joins.is_empty() {
        from.relation
    } else {
        ast::TableFactor::NestedJoin {
            table_with_joins: Box::new(from),
            alias: None,
        }
    }
}
