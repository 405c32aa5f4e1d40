//! Commutation-optimizer tests: pushing operations upstream toward a
//! preferred engine, transfer insertion, and the blocking rules.

use std::collections::BTreeMap;

use reltree::iteration::{make_leaf, IterationEngine, RowSequence};
use reltree::sql::{table_leaf, SqlEngine};
use reltree::{
    ApplyOptions, BinaryOperation, Calculation, ColumnExpression, ColumnSet, ColumnTag,
    Deduplication, EngineRef, Join, Predicate, Projection, Relation, RelationError, RelationNode,
    Selection, UnaryOperation,
};

fn iteration_engine() -> EngineRef {
    EngineRef::new(IterationEngine::new("iteration"))
}

fn sql_engine() -> EngineRef {
    EngineRef::new(SqlEngine::new("sql"))
}

fn key_columns(names: &[&str]) -> ColumnSet {
    names.iter().map(|name| ColumnTag::key(*name)).collect()
}

fn iteration_leaf(engine: &EngineRef, names: &[&str]) -> Relation {
    make_leaf(
        engine,
        "leaf",
        key_columns(names),
        RowSequence::new(vec![names
            .iter()
            .map(|name| (ColumnTag::key(*name), reltree::Value::Int(1)))
            .collect::<BTreeMap<_, _>>()]),
    )
}

fn reference(name: &str) -> ColumnExpression {
    ColumnExpression::reference(ColumnTag::key(name))
}

fn greater_than_zero(name: &str) -> Predicate {
    Predicate::function(
        "gt",
        vec![reference(name), ColumnExpression::literal(0i64)],
    )
}

fn preferring(engine: &EngineRef) -> ApplyOptions {
    ApplyOptions {
        preferred_engine: Some(engine.clone()),
        ..ApplyOptions::default()
    }
}

/// Unwrap one unary level, asserting on the operation kind with `matches`.
fn unary_target(relation: &Relation, expect: impl Fn(&UnaryOperation) -> bool) -> Relation {
    match relation.node() {
        RelationNode::Unary(rel) => {
            assert!(expect(&rel.operation), "unexpected operation {}", rel.operation);
            rel.target.clone()
        }
        _ => panic!("expected a unary node, got {relation}"),
    }
}

// ============================================================================
// Transfer insertion
// ============================================================================

#[test]
fn test_transfer_inserted_on_preferred_engine_miss() {
    let sql = sql_engine();
    let iteration = iteration_engine();
    let base = table_leaf(&sql, "t", key_columns(&["a"]));
    let selection = Selection::new(greater_than_zero("a"));
    let result = selection
        .apply(
            &base,
            &ApplyOptions {
                preferred_engine: Some(iteration.clone()),
                backtrack: false,
                transfer: true,
                ..ApplyOptions::default()
            },
        )
        .unwrap();
    // Root σ[p] over →[iteration](t).
    assert_eq!(result.engine(), iteration);
    let inner = unary_target(&result, |op| matches!(op, UnaryOperation::Selection(_)));
    let leaf = unary_target(&inner, |op| matches!(op, UnaryOperation::Transfer(_)));
    assert!(leaf.same_node(&base));
}

#[test]
fn test_require_preferred_engine_errors_without_transfer() {
    let sql = sql_engine();
    let iteration = iteration_engine();
    let base = table_leaf(&sql, "t", key_columns(&["a"]));
    let selection = Selection::new(greater_than_zero("a"));
    let result = selection.apply(
        &base,
        &ApplyOptions {
            preferred_engine: Some(iteration),
            backtrack: false,
            require_preferred_engine: true,
            ..ApplyOptions::default()
        },
    );
    assert!(matches!(result, Err(RelationError::Engine(_))));
}

#[test]
fn test_preferred_engine_miss_without_flags_stays_put() {
    let sql = sql_engine();
    let iteration = iteration_engine();
    let base = table_leaf(&sql, "t", key_columns(&["a"]));
    let selection = Selection::new(greater_than_zero("a"));
    let result = selection
        .apply(
            &base,
            &ApplyOptions {
                preferred_engine: Some(iteration),
                backtrack: false,
                ..ApplyOptions::default()
            },
        )
        .unwrap();
    // Applied in the current engine as a fallback.
    assert_eq!(result.engine(), sql);
}

// ============================================================================
// Backtracking through unary operations
// ============================================================================

#[test]
fn test_selection_backtracks_below_transfer() {
    let sql = sql_engine();
    let iteration = iteration_engine();
    let base = iteration_leaf(&iteration, &["a", "b"]);
    let transferred = base.transferred_to(sql.clone()).unwrap();
    let selection = Selection::new(greater_than_zero("a"));
    let result = selection.apply(&transferred, &preferring(&iteration)).unwrap();
    // The selection lands upstream of the transfer, in its preferred
    // engine; the transfer stays on top.
    assert_eq!(result.engine(), sql);
    let inner = unary_target(&result, |op| matches!(op, UnaryOperation::Transfer(_)));
    assert_eq!(inner.engine(), iteration);
    let leaf = unary_target(&inner, |op| matches!(op, UnaryOperation::Selection(_)));
    assert!(leaf.same_node(&base));
}

#[test]
fn test_backtracking_stops_at_locked_relations() {
    let sql = sql_engine();
    let iteration = iteration_engine();
    let base = iteration_leaf(&iteration, &["a"]);
    let materialized = base
        .transferred_to(sql.clone())
        .unwrap()
        .materialized(None)
        .unwrap();
    assert!(materialized.is_locked());
    let selection = Selection::new(greater_than_zero("a"));
    let result = selection
        .apply(
            &materialized,
            &ApplyOptions {
                preferred_engine: Some(iteration),
                transfer: true,
                ..ApplyOptions::default()
            },
        )
        .unwrap();
    // Backtracking is forbidden by the lock, so a transfer is added on top.
    let inner = unary_target(&result, |op| matches!(op, UnaryOperation::Selection(_)));
    let back = unary_target(&inner, |op| matches!(op, UnaryOperation::Transfer(_)));
    assert!(back.same_node(&materialized));
}

#[test]
fn test_calculation_crosses_a_projection_which_keeps_its_column() {
    let sql = sql_engine();
    let iteration = iteration_engine();
    let base = iteration_leaf(&iteration, &["a", "b", "c"]);
    let transferred = base.transferred_to(sql.clone()).unwrap();
    // The projection lives on the SQL side, between the calculation and
    // its preferred engine.
    let projected = transferred
        .with_only_columns(key_columns(&["a", "b"]))
        .unwrap();
    let calculation = Calculation::new(
        ColumnTag::new("sum"),
        ColumnExpression::function("add", vec![reference("a"), reference("b")]),
    )
    .unwrap();
    let result = calculation.apply(&projected, &preferring(&iteration)).unwrap();
    // Π[a, b, sum](→[sql](+[sum=a+b](leaf))): the calculation crossed the
    // projection, which was widened to keep the calculated column.
    let expected: ColumnSet = [
        ColumnTag::key("a"),
        ColumnTag::key("b"),
        ColumnTag::new("sum"),
    ]
    .into_iter()
    .collect();
    assert_eq!(result.columns(), &expected);
    let transfer = unary_target(&result, |op| matches!(op, UnaryOperation::Projection(_)));
    let calculated = unary_target(&transfer, |op| matches!(op, UnaryOperation::Transfer(_)));
    let leaf = unary_target(&calculated, |op| matches!(op, UnaryOperation::Calculation(_)));
    assert!(leaf.same_node(&base));
}

#[test]
fn test_deduplication_backtracks_below_transfer() {
    let sql = sql_engine();
    let iteration = iteration_engine();
    let base = iteration_leaf(&iteration, &["a"]);
    let transferred = base.transferred_to(sql).unwrap();
    let result = Deduplication::new()
        .apply(&transferred, &preferring(&iteration))
        .unwrap();
    let inner = unary_target(&result, |op| matches!(op, UnaryOperation::Transfer(_)));
    let leaf = unary_target(&inner, |op| matches!(op, UnaryOperation::Deduplication(_)));
    assert!(leaf.same_node(&base));
}

#[test]
fn test_selection_does_not_cross_a_slice() {
    let sql = sql_engine();
    let iteration = iteration_engine();
    let base = iteration_leaf(&iteration, &["a"]);
    // The slice lives on the SQL side, between the selection and its
    // preferred engine.
    let sliced = base
        .transferred_to(sql.clone())
        .unwrap()
        .sliced(0, Some(10))
        .unwrap();
    let selection = Selection::new(greater_than_zero("a"));
    let result = selection
        .apply(
            &sliced,
            &ApplyOptions {
                preferred_engine: Some(iteration.clone()),
                transfer: true,
                ..ApplyOptions::default()
            },
        )
        .unwrap();
    // Selecting before the slice would change which rows survive; the
    // backtrack fails and a transfer is inserted instead.
    assert_eq!(result.engine(), iteration);
    let inner = unary_target(&result, |op| matches!(op, UnaryOperation::Selection(_)));
    let back = unary_target(&inner, |op| matches!(op, UnaryOperation::Transfer(_)));
    assert!(back.same_node(&sliced));
}

// ============================================================================
// Backtracking through binary operations
// ============================================================================

#[test]
fn test_selection_pushdown_into_join_branch() {
    let sql = sql_engine();
    let iteration = iteration_engine();
    let lhs = iteration_leaf(&iteration, &["id", "a"]);
    let lhs_sql = lhs.transferred_to(sql.clone()).unwrap();
    let rhs = table_leaf(&sql, "b_table", key_columns(&["id", "b"]));
    let joined = lhs_sql.natural_join(&rhs).unwrap();
    let selection = Selection::new(greater_than_zero("a"));
    let result = selection.apply(&joined, &preferring(&iteration)).unwrap();
    // The join stays at the root; the selection lands in the lhs branch,
    // upstream of the transfer.
    match result.node() {
        RelationNode::Binary(rel) => {
            assert!(matches!(rel.operation, BinaryOperation::Join(_)));
            assert!(rel.rhs.same_node(&rhs), "rhs must be untouched");
            let below_transfer =
                unary_target(&rel.lhs, |op| matches!(op, UnaryOperation::Transfer(_)));
            let leaf =
                unary_target(&below_transfer, |op| matches!(op, UnaryOperation::Selection(_)));
            assert!(leaf.same_node(&lhs));
        }
        _ => panic!("expected a join at the root, got {result}"),
    }
}

#[test]
fn test_selection_pushdown_into_both_chain_branches() {
    let sql = sql_engine();
    let iteration = iteration_engine();
    let lhs = iteration_leaf(&iteration, &["a"]);
    let rhs = iteration_leaf(&iteration, &["a"]);
    let chained = lhs
        .transferred_to(sql.clone())
        .unwrap()
        .chained(&rhs.transferred_to(sql.clone()).unwrap())
        .unwrap();
    let selection = Selection::new(greater_than_zero("a"));
    let result = selection.apply(&chained, &preferring(&iteration)).unwrap();
    match result.node() {
        RelationNode::Binary(rel) => {
            assert!(matches!(rel.operation, BinaryOperation::Chain(_)));
            for branch in [&rel.lhs, &rel.rhs] {
                let below =
                    unary_target(branch, |op| matches!(op, UnaryOperation::Transfer(_)));
                unary_target(&below, |op| matches!(op, UnaryOperation::Selection(_)));
            }
        }
        _ => panic!("expected a chain at the root, got {result}"),
    }
}

#[test]
fn test_projection_pushdown_narrows_join_branches() {
    let sql = sql_engine();
    let iteration = iteration_engine();
    let lhs = iteration_leaf(&iteration, &["id", "a", "junk"]);
    let lhs_sql = lhs.transferred_to(sql.clone()).unwrap();
    let rhs = table_leaf(&sql, "b_table", key_columns(&["id", "b"]));
    let joined = lhs_sql.natural_join(&rhs).unwrap();
    let projection = Projection::new(key_columns(&["id", "a", "b"]));
    let result = projection.apply(&joined, &preferring(&iteration)).unwrap();
    // The junk column is projected away inside the lhs branch, below the
    // transfer; id survives because the join needs it.
    assert_eq!(result.columns(), &key_columns(&["id", "a", "b"]));
    fn find_projection(relation: &Relation) -> Option<ColumnSet> {
        match relation.node() {
            RelationNode::Unary(rel) => match &rel.operation {
                UnaryOperation::Projection(projection) => Some(projection.columns().clone()),
                _ => find_projection(&rel.target),
            },
            RelationNode::Binary(rel) => {
                find_projection(&rel.lhs).or_else(|| find_projection(&rel.rhs))
            }
            RelationNode::Leaf(_) => None,
        }
    }
    assert_eq!(find_projection(&result), Some(key_columns(&["id", "a"])));
}

// ============================================================================
// Partial joins
// ============================================================================

#[test]
fn test_partial_join_transfers_target_into_fixed_engine() {
    let sql = sql_engine();
    let iteration = iteration_engine();
    let fixed = table_leaf(&sql, "dim", key_columns(&["id", "b"]));
    let target = iteration_leaf(&iteration, &["id", "a"]);
    let partial = Join::new(Predicate::literal(true))
        .partial(&fixed, false, false)
        .unwrap();
    let result = partial
        .apply(
            &target,
            &ApplyOptions {
                backtrack: false,
                transfer: true,
                ..ApplyOptions::default()
            },
        )
        .unwrap();
    match result.node() {
        RelationNode::Binary(rel) => {
            assert!(matches!(rel.operation, BinaryOperation::Join(_)));
            assert!(rel.rhs.same_node(&fixed));
            unary_target(&rel.lhs, |op| matches!(op, UnaryOperation::Transfer(_)));
        }
        _ => panic!("expected a join, got {result}"),
    }
    assert_eq!(result.columns(), &key_columns(&["id", "a", "b"]));
}

#[test]
fn test_partial_join_backtracks_below_transfer() {
    let sql = sql_engine();
    let iteration = iteration_engine();
    let fixed = iteration_leaf(&iteration, &["id", "b"]);
    let target = iteration_leaf(&iteration, &["id", "a"]);
    let transferred = target.transferred_to(sql).unwrap();
    let partial = Join::new(Predicate::literal(true))
        .partial(&fixed, true, false)
        .unwrap();
    let result = partial
        .apply(&transferred, &ApplyOptions::default())
        .unwrap();
    // The join happens in the iteration engine, below the transfer.
    let join = unary_target(&result, |op| matches!(op, UnaryOperation::Transfer(_)));
    match join.node() {
        RelationNode::Binary(rel) => {
            assert!(rel.lhs.same_node(&fixed));
            assert!(rel.rhs.same_node(&target));
        }
        _ => panic!("expected a join below the transfer, got {join}"),
    }
}

#[test]
fn test_partial_join_errors_when_unreachable() {
    let sql = sql_engine();
    let iteration = iteration_engine();
    let fixed = table_leaf(&sql, "dim", key_columns(&["id"]));
    let target = iteration_leaf(&iteration, &["id"]);
    let partial = Join::new(Predicate::literal(true))
        .partial(&fixed, false, false)
        .unwrap();
    let result = partial.apply(
        &target,
        &ApplyOptions {
            backtrack: true,
            transfer: false,
            ..ApplyOptions::default()
        },
    );
    assert!(matches!(result, Err(RelationError::Engine(_))));
}
