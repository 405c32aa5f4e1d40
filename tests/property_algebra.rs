//! Property-based tests (proptest) for the algebraic laws the tree
//! simplifications must uphold.

use std::collections::BTreeMap;

use proptest::prelude::*;

use reltree::iteration::{make_leaf, IterationEngine, Row, RowSequence};
use reltree::{
    ColumnExpression, ColumnSet, ColumnTag, EngineRef, Predicate, Relation, RelationNode,
    SortTerm, UnaryOperation, Value,
};

const COLUMN_NAMES: &[&str] = &["a", "b", "c", "d"];

fn engine() -> EngineRef {
    EngineRef::new(IterationEngine::new("iteration"))
}

fn key_columns(names: &[&str]) -> ColumnSet {
    names.iter().map(|name| ColumnTag::key(*name)).collect()
}

fn leaf_with_rows(engine: &EngineRef, row_count: usize) -> Relation {
    let rows: Vec<Row> = (0..row_count)
        .map(|i| {
            COLUMN_NAMES
                .iter()
                .map(|name| (ColumnTag::key(*name), Value::Int(i as i64)))
                .collect::<BTreeMap<_, _>>()
        })
        .collect();
    make_leaf(
        engine,
        "leaf",
        key_columns(COLUMN_NAMES),
        RowSequence::new(rows),
    )
}

fn reference(name: &str) -> ColumnExpression {
    ColumnExpression::reference(ColumnTag::key(name))
}

fn column_predicate(index: usize) -> Predicate {
    Predicate::function(
        "gt",
        vec![
            reference(COLUMN_NAMES[index % COLUMN_NAMES.len()]),
            ColumnExpression::literal(0i64),
        ],
    )
}

fn sort_term(index: usize) -> SortTerm {
    let name = COLUMN_NAMES[index % COLUMN_NAMES.len()];
    if index % 2 == 0 {
        SortTerm::ascending(reference(name))
    } else {
        SortTerm::descending(reference(name))
    }
}

proptest! {
    /// slice[c:d] then slice[a:b] equals the single composed slice.
    #[test]
    fn prop_slice_composition(
        inner_start in 0u64..20,
        inner_len in proptest::option::of(0u64..20),
        outer_start in 0u64..20,
        outer_len in proptest::option::of(0u64..20),
    ) {
        let engine = engine();
        let base = leaf_with_rows(&engine, 30);
        let inner_stop = inner_len.map(|len| inner_start + len);
        let outer_stop = outer_len.map(|len| outer_start + len);
        let stacked = base
            .sliced(inner_start, inner_stop)
            .unwrap()
            .sliced(outer_start, outer_stop)
            .unwrap();
        let composed_start = inner_start + outer_start;
        let composed_stop = match (inner_stop, outer_stop) {
            (None, None) => None,
            (None, Some(stop)) => Some(stop + inner_start),
            (Some(inner), None) => Some(inner),
            (Some(inner), Some(stop)) => Some(inner.min(stop + inner_start)),
        };
        let direct = base.sliced(composed_start, composed_stop).unwrap();
        prop_assert_eq!(&stacked, &direct);
        // Row-count bounds stay ordered.
        if let Some(max) = stacked.max_rows() {
            prop_assert!(stacked.min_rows() <= max);
        }
    }

    /// σ_p(σ_q(x)) equals σ_{q∧p}(x).
    #[test]
    fn prop_selection_merge(indices in proptest::collection::vec(0usize..4, 1..5)) {
        let engine = engine();
        let base = leaf_with_rows(&engine, 5);
        let mut stacked = base.clone();
        for index in &indices {
            stacked = stacked.selected(column_predicate(*index)).unwrap();
        }
        let merged = Predicate::logical_and(
            indices.iter().map(|index| column_predicate(*index)).collect(),
        );
        let direct = base.selected(merged).unwrap();
        prop_assert_eq!(&stacked, &direct);
        // Exactly one selection node remains.
        match stacked.node() {
            RelationNode::Unary(rel) => {
                prop_assert!(matches!(rel.operation, UnaryOperation::Selection(_)));
                prop_assert!(rel.target.same_node(&base));
            }
            _ => prop_assert!(false, "expected a unary node"),
        }
    }

    /// Π_A(Π_B(x)) equals Π_A(x) whenever A ⊆ B.
    #[test]
    fn prop_projection_fold(
        outer_mask in 1u8..16,
        extra_mask in 0u8..16,
    ) {
        let engine = engine();
        let base = leaf_with_rows(&engine, 3);
        let inner_mask = outer_mask | extra_mask;
        let pick = |mask: u8| -> ColumnSet {
            COLUMN_NAMES
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, name)| ColumnTag::key(*name))
                .collect()
        };
        let stacked = base
            .with_only_columns(pick(inner_mask))
            .unwrap()
            .with_only_columns(pick(outer_mask))
            .unwrap();
        let direct = base.with_only_columns(pick(outer_mask)).unwrap();
        prop_assert_eq!(&stacked, &direct);
        prop_assert_eq!(stacked.columns(), &pick(outer_mask));
    }

    /// sort(ts1)(sort(ts2)(x)) concatenates terms, newer first, deduped.
    #[test]
    fn prop_sort_merge(
        older in proptest::collection::vec(0usize..8, 1..4),
        newer in proptest::collection::vec(0usize..8, 1..4),
    ) {
        let engine = engine();
        let base = leaf_with_rows(&engine, 3);
        let older_terms: Vec<SortTerm> = older.iter().map(|i| sort_term(*i)).collect();
        let newer_terms: Vec<SortTerm> = newer.iter().map(|i| sort_term(*i)).collect();
        let stacked = base
            .sorted(older_terms.clone())
            .unwrap()
            .sorted(newer_terms.clone())
            .unwrap();
        let mut expected = newer_terms.clone();
        for term in &older_terms {
            if !expected.contains(term) {
                expected.push(term.clone());
            }
        }
        match stacked.node() {
            RelationNode::Unary(rel) => match &rel.operation {
                UnaryOperation::Sort(sort) => {
                    prop_assert_eq!(sort.terms(), expected.as_slice());
                    prop_assert!(rel.target.same_node(&base));
                }
                other => prop_assert!(false, "expected a sort, got {}", other),
            },
            _ => prop_assert!(false, "expected a unary node"),
        }
    }

    /// Bounds stay ordered and engines stay coherent under random chains
    /// of row-shaping operations.
    #[test]
    fn prop_row_bounds_stay_ordered(
        row_count in 0usize..6,
        steps in proptest::collection::vec(0usize..4, 0..6),
    ) {
        let engine = engine();
        let mut relation = leaf_with_rows(&engine, row_count);
        for (position, step) in steps.iter().enumerate() {
            relation = match step % 4 {
                0 => relation.selected(column_predicate(position)).unwrap(),
                1 => relation.without_duplicates().unwrap(),
                2 => relation
                    .sliced(position as u64, Some(position as u64 + 3))
                    .unwrap(),
                _ => relation.sorted(vec![sort_term(position)]).unwrap(),
            };
        }
        if let Some(max) = relation.max_rows() {
            prop_assert!(relation.min_rows() <= max);
            prop_assert!(max <= row_count as u64);
        }
        prop_assert_eq!(relation.engine(), engine);
    }
}
