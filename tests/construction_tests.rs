//! Construction tests: leaf attributes, derived attributes, string forms,
//! and the universal tree invariants.

use std::collections::BTreeMap;

use reltree::iteration::{make_leaf, IterationEngine, Row, RowSequence};
use reltree::{
    ColumnExpression, ColumnSet, ColumnTag, EngineRef, Predicate, Relation, RelationNode,
    SortTerm, UnaryOperation, Value,
};

fn engine() -> EngineRef {
    EngineRef::new(IterationEngine::new("iteration"))
}

fn columns(names: &[&str]) -> ColumnSet {
    names.iter().map(|name| ColumnTag::key(*name)).collect()
}

fn row(pairs: &[(&str, i64)]) -> Row {
    pairs
        .iter()
        .map(|(name, value)| (ColumnTag::key(*name), Value::Int(*value)))
        .collect::<BTreeMap<_, _>>()
}

fn sample_leaf(engine: &EngineRef) -> Relation {
    let rows = RowSequence::new(vec![
        row(&[("a", 0), ("b", 0)]),
        row(&[("a", 0), ("b", 1)]),
        row(&[("a", 1), ("b", 0)]),
        row(&[("a", 0), ("b", 0)]),
    ]);
    make_leaf(engine, "base", columns(&["a", "b"]), rows)
}

#[test]
fn test_leaf_from_row_sequence() {
    let engine = engine();
    let leaf = sample_leaf(&engine);
    assert_eq!(leaf.engine(), engine);
    assert_eq!(leaf.columns(), &columns(&["a", "b"]));
    assert_eq!(leaf.min_rows(), 4);
    assert_eq!(leaf.max_rows(), Some(4));
    assert!(leaf.payload().is_some());
}

#[test]
fn test_row_bounds_are_consistent_through_operations() {
    let engine = engine();
    let leaf = sample_leaf(&engine);
    let tree = leaf
        .selected(Predicate::reference(ColumnTag::key("a")))
        .unwrap()
        .without_duplicates()
        .unwrap()
        .sliced(1, Some(3))
        .unwrap();
    let min = tree.min_rows();
    let max = tree.max_rows().expect("bounded tree");
    assert!(min <= max, "min {min} must not exceed max {max}");
    assert_eq!(max, 2);
}

#[test]
fn test_selection_display() {
    let engine = engine();
    let leaf = sample_leaf(&engine);
    let selected = leaf
        .selected(Predicate::function(
            "gt",
            vec![
                ColumnExpression::reference(ColumnTag::key("a")),
                ColumnExpression::literal(0i64),
            ],
        ))
        .unwrap();
    let text = selected.to_string();
    assert!(text.starts_with("σ[a>0](base_"), "got {text}");
}

#[test]
fn test_projection_display() {
    let engine = engine();
    let leaf = sample_leaf(&engine);
    let projected = leaf.with_only_columns(columns(&["a"])).unwrap();
    assert!(projected.to_string().starts_with("Π[a]("));
}

#[test]
fn test_calculation_display() {
    let engine = engine();
    let leaf = sample_leaf(&engine);
    let calculated = leaf
        .calculated(
            ColumnTag::new("c"),
            ColumnExpression::function(
                "add",
                vec![
                    ColumnExpression::reference(ColumnTag::key("a")),
                    ColumnExpression::reference(ColumnTag::key("b")),
                ],
            ),
        )
        .unwrap();
    assert!(calculated.to_string().starts_with("+[c=a+b]("));
}

#[test]
fn test_sort_and_slice_display() {
    let engine = engine();
    let leaf = sample_leaf(&engine);
    let sorted = leaf
        .sorted(vec![
            SortTerm::ascending(ColumnExpression::reference(ColumnTag::key("a"))),
            SortTerm::descending(ColumnExpression::reference(ColumnTag::key("b"))),
        ])
        .unwrap();
    assert!(sorted.to_string().starts_with("sort[a, -b]("));
    let sliced = leaf.sliced(1, Some(5)).unwrap();
    assert!(sliced.to_string().starts_with("slice[1:5]("));
}

#[test]
fn test_chain_display_groups_same_operator() {
    let engine = engine();
    let a = sample_leaf(&engine);
    let b = sample_leaf(&engine);
    let c = sample_leaf(&engine);
    let chained = a.chained(&b).unwrap().chained(&c).unwrap();
    // Same-operator binary children print without parentheses.
    let text = chained.to_string();
    assert_eq!(text.matches('∪').count(), 2);
    assert!(!text.contains('('), "got {text}");
}

#[test]
fn test_join_display_parenthesizes_mixed_operators() {
    let engine = engine();
    let a = sample_leaf(&engine);
    let b = sample_leaf(&engine);
    let union = a.chained(&b).unwrap();
    let other = make_leaf(
        &engine,
        "other",
        columns(&["a", "b"]),
        RowSequence::new(vec![]),
    );
    let joined = union.natural_join(&other).unwrap();
    let text = joined.to_string();
    assert!(text.contains("∪)"), "union child should be wrapped: {text}");
    assert!(text.contains('⋈'));
}

#[test]
fn test_transfer_display() {
    let source = engine();
    let destination = EngineRef::new(IterationEngine::new("other"));
    let leaf = sample_leaf(&source);
    let transferred = leaf.transferred_to(destination).unwrap();
    assert!(transferred.to_string().starts_with("→[other]("));
}

#[test]
fn test_materialization_uses_generated_name() {
    let engine = engine();
    let leaf = sample_leaf(&engine);
    let tree = leaf
        .selected(Predicate::reference(ColumnTag::key("a")))
        .unwrap();
    let materialized = tree.materialized(None).unwrap();
    match materialized.node() {
        RelationNode::Unary(rel) => {
            assert!(rel.is_locked, "materializations default to locked");
            match &rel.operation {
                UnaryOperation::Materialization(op) => {
                    assert!(op.name().expect("named").starts_with("materialization_"));
                }
                other => panic!("expected a materialization, got {other}"),
            }
        }
        _ => panic!("expected a unary node"),
    }
}

#[test]
fn test_materialization_of_leaf_is_identity() {
    let engine = engine();
    let leaf = sample_leaf(&engine);
    let materialized = leaf.materialized(None).unwrap();
    assert!(materialized.same_node(&leaf));
}

#[test]
fn test_join_identity_flag_tracks_attributes() {
    let engine = engine();
    let identity = Relation::join_identity(engine.clone());
    assert!(identity.is_join_identity());
    let doomed = Relation::doomed(engine, ColumnSet::new(), vec!["empty".to_string()]);
    assert!(!doomed.is_join_identity());
}

#[test]
fn test_engine_names_are_unique_per_engine() {
    let engine = engine();
    let first = engine.get_relation_name("leaf");
    let second = engine.get_relation_name("leaf");
    assert_ne!(first, second);
    assert!(first.starts_with("leaf_0000_"));
    assert!(second.starts_with("leaf_0001_"));
}
