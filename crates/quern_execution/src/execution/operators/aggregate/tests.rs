use std::collections::HashMap;

use quern_error::QuernError;
use quern_row::sort::{NullsOrder, SortKey, SortOrder};
use quern_row::{DataType, Row, ScalarValue};
use similar_asserts::assert_eq;

use crate::config::{ExecutionConfig, Interrupts};
use crate::execution::operators::VecRowSource;
use crate::expr::{CompareOp, PhysicalExpr};
use crate::functions::aggregate::AggregateCatalog;

use super::*;

fn int(v: i64) -> ScalarValue {
    ScalarValue::Int64(v)
}

fn fl(v: f64) -> ScalarValue {
    ScalarValue::Float64(v)
}

fn s(v: &str) -> ScalarValue {
    ScalarValue::Utf8(v.to_string())
}

fn null() -> ScalarValue {
    ScalarValue::Null
}

fn row(values: Vec<ScalarValue>) -> Row {
    Row::new(values)
}

fn run(node: AggregateNode, rows: Vec<Row>) -> Vec<Row> {
    run_with_config(node, rows, ExecutionConfig::default())
}

fn run_with_config(node: AggregateNode, rows: Vec<Row>, config: ExecutionConfig) -> Vec<Row> {
    let mut executor =
        AggregateExecutor::try_new(node, Box::new(VecRowSource::new(rows)), config).unwrap();
    collect(&mut executor)
}

fn collect(executor: &mut AggregateExecutor) -> Vec<Row> {
    let mut out = Vec::new();
    while let Some(row) = executor.next_row().unwrap() {
        out.push(row);
    }
    // The stream stays exhausted.
    assert!(executor.next_row().unwrap().is_none());
    out
}

fn multiset(rows: &[Row]) -> Vec<String> {
    let mut formatted: Vec<String> = rows
        .iter()
        .map(|r| {
            let cols: Vec<String> = r.columns.iter().map(|c| format!("{c}")).collect();
            cols.join("|")
        })
        .collect();
    formatted.sort();
    formatted
}

fn sum_call(col: usize) -> AggregateCall {
    AggregateCall::new("sum", vec![PhysicalExpr::column(col)], vec![DataType::Int64])
}

fn count_call(col: usize) -> AggregateCall {
    AggregateCall::new(
        "count",
        vec![PhysicalExpr::column(col)],
        vec![DataType::Int64],
    )
}

#[test]
fn basic_sum_over_one_group() {
    let node = AggregateNode::plain(vec![DataType::Int64], vec![sum_call(0)]);
    let out = run(
        node,
        vec![
            row(vec![int(1)]),
            row(vec![int(2)]),
            row(vec![int(3)]),
            row(vec![null()]),
        ],
    );
    assert_eq!(vec![row(vec![int(6)])], out);
}

#[test]
fn sum_of_only_nulls_is_null() {
    let node = AggregateNode::plain(vec![DataType::Int64], vec![sum_call(0)]);
    let out = run(node, vec![row(vec![null()]), row(vec![null()])]);
    assert_eq!(vec![row(vec![null()])], out);
}

#[test]
fn grouped_hash_aggregation() {
    let node = AggregateNode::grouped(
        AggStrategy::Hashed,
        vec![DataType::Utf8, DataType::Int64],
        vec![0],
        vec![sum_call(1)],
    );
    let out = run(
        node,
        vec![
            row(vec![s("a"), int(1)]),
            row(vec![s("b"), int(2)]),
            row(vec![s("a"), int(3)]),
            row(vec![s("b"), int(4)]),
        ],
    );
    assert_eq!(
        multiset(&[row(vec![s("a"), int(4)]), row(vec![s("b"), int(6)])]),
        multiset(&out)
    );
}

#[test]
fn grouped_sorted_aggregation() {
    let node = AggregateNode::grouped(
        AggStrategy::Sorted,
        vec![DataType::Utf8, DataType::Int64],
        vec![0],
        vec![sum_call(1), count_call(1)],
    );
    let out = run(
        node,
        vec![
            row(vec![s("a"), int(1)]),
            row(vec![s("a"), int(3)]),
            row(vec![s("b"), int(2)]),
            row(vec![s("b"), int(4)]),
        ],
    );
    // Sorted output preserves the input group order.
    assert_eq!(
        vec![
            row(vec![s("a"), int(4), int(2)]),
            row(vec![s("b"), int(6), int(2)]),
        ],
        out
    );
}

#[test]
fn null_group_keys_form_one_group() {
    let node = AggregateNode::grouped(
        AggStrategy::Sorted,
        vec![DataType::Utf8, DataType::Int64],
        vec![0],
        vec![sum_call(1)],
    );
    let out = run(
        node,
        vec![
            row(vec![s("a"), int(1)]),
            row(vec![null(), int(2)]),
            row(vec![null(), int(5)]),
        ],
    );
    assert_eq!(
        vec![
            row(vec![s("a"), int(1)]),
            row(vec![null(), int(7)]),
        ],
        out
    );
}

#[test]
fn rollup_projects_every_set_in_order() {
    // GROUP BY ROLLUP(k1, k2) over pre-sorted input.
    let node = AggregateNode::rollup(
        vec![DataType::Utf8, DataType::Int64, DataType::Int64],
        vec![0, 1],
        vec![sum_call(2)],
    );
    let out = run(
        node,
        vec![
            row(vec![s("x"), int(1), int(10)]),
            row(vec![s("x"), int(1), int(20)]),
            row(vec![s("x"), int(2), int(30)]),
            row(vec![s("y"), int(1), int(40)]),
        ],
    );

    // Each coarser row follows the finer rows that rolled into it.
    assert_eq!(
        vec![
            row(vec![s("x"), int(1), int(30)]),
            row(vec![s("x"), int(2), int(30)]),
            row(vec![s("x"), null(), int(60)]),
            row(vec![s("y"), int(1), int(40)]),
            row(vec![s("y"), null(), int(40)]),
            row(vec![null(), null(), int(100)]),
        ],
        out
    );
}

#[test]
fn rollup_sets_match_separate_aggregations() {
    let input: Vec<Row> = (0..60)
        .map(|i| row(vec![s(["p", "q", "r"][i % 3]), int((i % 4) as i64), int(i as i64)]))
        .collect();
    let mut sorted_input = input.clone();
    sorted_input.sort_by(|a, b| {
        quern_row::sort::compare_rows(a, b, &[SortKey::asc(0), SortKey::asc(1)])
    });

    let rollup_out = run(
        AggregateNode::rollup(
            vec![DataType::Utf8, DataType::Int64, DataType::Int64],
            vec![0, 1],
            vec![sum_call(2)],
        ),
        sorted_input.clone(),
    );

    // Fine set: plain GROUP BY (k1, k2).
    let fine = run(
        AggregateNode::grouped(
            AggStrategy::Sorted,
            vec![DataType::Utf8, DataType::Int64, DataType::Int64],
            vec![0, 1],
            vec![sum_call(2)],
        ),
        sorted_input.clone(),
    );
    // Middle set: GROUP BY k1, with a null k2 column spliced in.
    let mid: Vec<Row> = run(
        AggregateNode::grouped(
            AggStrategy::Sorted,
            vec![DataType::Utf8, DataType::Int64, DataType::Int64],
            vec![0],
            vec![sum_call(2)],
        ),
        sorted_input.clone(),
    )
    .into_iter()
    .map(|r| row(vec![r.columns[0].clone(), null(), r.columns[1].clone()]))
    .collect();
    // Empty set: one total row.
    let total: Vec<Row> = run(
        AggregateNode::plain(
            vec![DataType::Utf8, DataType::Int64, DataType::Int64],
            vec![sum_call(2)],
        ),
        sorted_input,
    )
    .into_iter()
    .map(|r| row(vec![null(), null(), r.columns[0].clone()]))
    .collect();

    let mut expected = fine;
    expected.extend(mid);
    expected.extend(total);
    assert_eq!(multiset(&expected), multiset(&rollup_out));
}

#[test]
fn count_distinct() {
    let call = count_call(0).distinct();
    let node = AggregateNode::plain(vec![DataType::Int64], vec![call]);
    let out = run(
        node,
        vec![
            row(vec![int(1)]),
            row(vec![int(1)]),
            row(vec![int(2)]),
            row(vec![int(2)]),
            row(vec![int(3)]),
        ],
    );
    assert_eq!(vec![row(vec![int(3)])], out);
}

#[test]
fn distinct_matches_pre_deduplicated_input() {
    let raw: Vec<i64> = (0..200).map(|i| (i * i) % 23).collect();
    let mut unique = raw.clone();
    unique.sort_unstable();
    unique.dedup();

    let distinct_out = run(
        AggregateNode::plain(vec![DataType::Int64], vec![sum_call(0).distinct()]),
        raw.iter().map(|&v| row(vec![int(v)])).collect(),
    );
    let dedup_out = run(
        AggregateNode::plain(vec![DataType::Int64], vec![sum_call(0)]),
        unique.iter().map(|&v| row(vec![int(v)])).collect(),
    );
    assert_eq!(dedup_out, distinct_out);
}

#[test]
fn distinct_over_multiple_arguments() {
    let covar = |distinct: bool| {
        let call = AggregateCall::new(
            "covar_pop",
            vec![PhysicalExpr::column(0), PhysicalExpr::column(1)],
            vec![DataType::Float64, DataType::Float64],
        );
        if distinct {
            call.distinct()
        } else {
            call
        }
    };

    // Duplicated (y, x) pairs on the line y = 2x.
    let input = vec![
        row(vec![fl(2.0), fl(1.0)]),
        row(vec![fl(2.0), fl(1.0)]),
        row(vec![fl(4.0), fl(2.0)]),
        row(vec![fl(4.0), fl(2.0)]),
        row(vec![fl(6.0), fl(3.0)]),
    ];

    let distinct_out = run(
        AggregateNode::plain(
            vec![DataType::Float64, DataType::Float64],
            vec![covar(true)],
        ),
        input,
    );
    let expected = run(
        AggregateNode::plain(
            vec![DataType::Float64, DataType::Float64],
            vec![covar(false)],
        ),
        vec![
            row(vec![fl(2.0), fl(1.0)]),
            row(vec![fl(4.0), fl(2.0)]),
            row(vec![fl(6.0), fl(3.0)]),
        ],
    );
    assert_eq!(expected, distinct_out);
}

#[test]
fn ordered_input_aggregate_accepts_sort_spec() {
    let call = sum_call(0).with_order_by(vec![SortKey {
        column: 0,
        order: SortOrder::Desc,
        nulls: NullsOrder::First,
        collation: 0,
    }]);
    let node = AggregateNode::plain(vec![DataType::Int64], vec![call]);
    let out = run(
        node,
        vec![row(vec![int(3)]), row(vec![int(1)]), row(vec![int(2)])],
    );
    assert_eq!(vec![row(vec![int(6)])], out);
}

#[test]
fn aggregate_filter_clause() {
    let call = sum_call(0).with_filter(PhysicalExpr::compare(
        CompareOp::Gt,
        PhysicalExpr::column(0),
        PhysicalExpr::literal(int(1)),
    ));
    let node = AggregateNode::plain(vec![DataType::Int64], vec![call, count_call(0)]);
    let out = run(
        node,
        vec![row(vec![int(1)]), row(vec![int(2)]), row(vec![int(3)])],
    );
    // The filter applies to the first aggregate only.
    assert_eq!(vec![row(vec![int(5), int(3)])], out);
}

#[test]
fn qual_rejects_groups() {
    // HAVING sum(v) > 4: qual reads the eval row, aggregate results start
    // after the input columns.
    let mut node = AggregateNode::grouped(
        AggStrategy::Sorted,
        vec![DataType::Utf8, DataType::Int64],
        vec![0],
        vec![sum_call(1)],
    );
    node = node.with_qual(PhysicalExpr::compare(
        CompareOp::Gt,
        PhysicalExpr::column(2),
        PhysicalExpr::literal(int(4)),
    ));
    let out = run(
        node,
        vec![
            row(vec![s("a"), int(1)]),
            row(vec![s("b"), int(5)]),
            row(vec![s("b"), int(2)]),
        ],
    );
    assert_eq!(vec![row(vec![s("b"), int(7)])], out);
}

#[test]
fn empty_input_plain_emits_one_row() {
    let node = AggregateNode::plain(
        vec![DataType::Int64],
        vec![sum_call(0), count_call(0)],
    );
    let out = run(node, vec![]);
    assert_eq!(vec![row(vec![null(), int(0)])], out);
}

#[test]
fn empty_input_avg_final_is_null() {
    let call = AggregateCall::new(
        "avg",
        vec![PhysicalExpr::column(0)],
        vec![DataType::Float64],
    );
    let node = AggregateNode::plain(vec![DataType::Float64], vec![call]);
    let out = run(node, vec![]);
    assert_eq!(vec![row(vec![null()])], out);
}

#[test]
fn empty_input_grouped_emits_nothing() {
    for strategy in [AggStrategy::Sorted, AggStrategy::Hashed] {
        let node = AggregateNode::grouped(
            strategy,
            vec![DataType::Utf8, DataType::Int64],
            vec![0],
            vec![sum_call(1)],
        );
        assert!(run(node, vec![]).is_empty());
    }
}

#[test]
fn empty_input_rollup_emits_only_the_empty_set() {
    let node = AggregateNode::rollup(
        vec![DataType::Utf8, DataType::Int64, DataType::Int64],
        vec![0, 1],
        vec![sum_call(2), count_call(2)],
    );
    let out = run(node, vec![]);
    assert_eq!(vec![row(vec![null(), null(), null(), int(0)])], out);
}

#[test]
fn identical_aggregates_collapse_to_one_computation() {
    let node = AggregateNode::plain(
        vec![DataType::Int64],
        vec![sum_call(0), sum_call(0)],
    );
    let mut executor = AggregateExecutor::try_new(
        node,
        Box::new(VecRowSource::new(vec![row(vec![int(2)]), row(vec![int(3)])])),
        ExecutionConfig::default(),
    )
    .unwrap();

    assert_eq!(1, executor.num_trans_slots());
    assert_eq!(1, executor.num_agg_slots());

    let out = collect(&mut executor);
    assert_eq!(vec![row(vec![int(5), int(5)])], out);
}

#[test]
fn strategies_agree_on_grouped_output() {
    let mut input: Vec<Row> = (0..500)
        .map(|i| row(vec![int((i * 31 % 10) as i64), int(i as i64)]))
        .collect();

    let node_for = |strategy| {
        AggregateNode::grouped(
            strategy,
            vec![DataType::Int64, DataType::Int64],
            vec![0],
            vec![sum_call(1), count_call(1)],
        )
    };

    let hashed = run(node_for(AggStrategy::Hashed), input.clone());

    input.sort_by(|a, b| quern_row::sort::compare_rows(a, b, &[SortKey::asc(0)]));
    let sorted = run(node_for(AggStrategy::Sorted), input);

    assert_eq!(multiset(&sorted), multiset(&hashed));
}

#[test]
fn mixed_strategy_produces_both_sorted_and_hashed_sets() {
    // Primary sorted rollup over k1, plus a hashed set over k2.
    let mut node = AggregateNode::grouped(
        AggStrategy::Mixed,
        vec![DataType::Int64, DataType::Int64, DataType::Int64],
        vec![0],
        vec![sum_call(2)],
    );
    node.output = vec![
        OutputColumn::GroupColumn(0),
        OutputColumn::GroupColumn(1),
        OutputColumn::AggregateResult(0),
    ];
    node = node.with_chain(vec![ChainedAgg {
        strategy: AggStrategy::Hashed,
        group_cols: vec![1],
        set_lengths: vec![],
        sort_requirement: vec![],
    }]);

    let mut input: Vec<Row> = (0..200)
        .map(|i| row(vec![int((i % 5) as i64), int((i % 7) as i64), int(i as i64)]))
        .collect();
    input.sort_by(|a, b| quern_row::sort::compare_rows(a, b, &[SortKey::asc(0)]));

    let out = run(node, input.clone());

    let by_k1: Vec<Row> = run(
        AggregateNode::grouped(
            AggStrategy::Sorted,
            vec![DataType::Int64, DataType::Int64, DataType::Int64],
            vec![0],
            vec![sum_call(2)],
        ),
        input.clone(),
    )
    .into_iter()
    .map(|r| row(vec![r.columns[0].clone(), null(), r.columns[1].clone()]))
    .collect();

    let by_k2: Vec<Row> = run(
        AggregateNode::grouped(
            AggStrategy::Hashed,
            vec![DataType::Int64, DataType::Int64, DataType::Int64],
            vec![1],
            vec![sum_call(2)],
        ),
        input,
    )
    .into_iter()
    .map(|r| row(vec![null(), r.columns[0].clone(), r.columns[1].clone()]))
    .collect();

    let mut expected = by_k1;
    expected.extend(by_k2);
    assert_eq!(multiset(&expected), multiset(&out));
}

#[test]
fn chained_rollup_re_sorts_between_phases() {
    // Phase 1 groups by k1 (input pre-sorted on k1); phase 2 groups by k2
    // and receives its input through the inter-phase re-sort.
    let mut node = AggregateNode::grouped(
        AggStrategy::Sorted,
        vec![DataType::Int64, DataType::Int64, DataType::Int64],
        vec![0],
        vec![sum_call(2)],
    );
    node.output = vec![
        OutputColumn::GroupColumn(0),
        OutputColumn::GroupColumn(1),
        OutputColumn::AggregateResult(0),
    ];
    node = node.with_chain(vec![ChainedAgg {
        strategy: AggStrategy::Sorted,
        group_cols: vec![1],
        set_lengths: vec![],
        sort_requirement: vec![],
    }]);

    let mut input: Vec<Row> = (0..100)
        .map(|i| row(vec![int((i % 4) as i64), int((i % 9) as i64), int(i as i64)]))
        .collect();
    input.sort_by(|a, b| quern_row::sort::compare_rows(a, b, &[SortKey::asc(0)]));

    let out = run(node, input.clone());

    let by_k1: Vec<Row> = run(
        AggregateNode::grouped(
            AggStrategy::Sorted,
            vec![DataType::Int64, DataType::Int64, DataType::Int64],
            vec![0],
            vec![sum_call(2)],
        ),
        input.clone(),
    )
    .into_iter()
    .map(|r| row(vec![r.columns[0].clone(), null(), r.columns[1].clone()]))
    .collect();

    input.sort_by(|a, b| quern_row::sort::compare_rows(a, b, &[SortKey::asc(1)]));
    let by_k2: Vec<Row> = run(
        AggregateNode::grouped(
            AggStrategy::Sorted,
            vec![DataType::Int64, DataType::Int64, DataType::Int64],
            vec![1],
            vec![sum_call(2)],
        ),
        input,
    )
    .into_iter()
    .map(|r| row(vec![null(), r.columns[0].clone(), r.columns[1].clone()]))
    .collect();

    let mut expected = by_k1;
    expected.extend(by_k2);
    assert_eq!(multiset(&expected), multiset(&out));
}

fn hybrid_config(max_entries: usize, entry_size: usize, nbatches: usize) -> ExecutionConfig {
    ExecutionConfig {
        work_mem: max_entries * entry_size,
        enable_hybrid_hash_agg: true,
        default_hashagg_nbatches: nbatches,
        hybrid_hash_agg_debug: false,
    }
}

#[test]
fn hybrid_spill_matches_in_memory_reference() {
    const KEYS: i64 = 20_000;
    let input: Vec<Row> = (0..KEYS * 2)
        .map(|i| {
            let key = (i * 7919) % KEYS;
            row(vec![int(key), int(key)])
        })
        .collect();

    let node = || {
        AggregateNode::grouped(
            AggStrategy::Hashed,
            vec![DataType::Int64, DataType::Int64],
            vec![0],
            vec![sum_call(1), count_call(1)],
        )
        .with_hybrid(HybridHint {
            entry_size: 64,
            num_groups: KEYS as f64,
        })
    };

    // Sized for 500 entries with 8 batches: each batch still holds ~2500
    // keys, forcing recursive re-partitioning.
    let spilled = run_with_config(node(), input.clone(), hybrid_config(500, 64, 8));
    let reference = run_with_config(node(), input, ExecutionConfig::default());

    assert_eq!(KEYS as usize, spilled.len());
    assert_eq!(multiset(&reference), multiset(&spilled));

    let by_key: HashMap<i64, (i64, i64)> = spilled
        .iter()
        .map(|r| {
            (
                r.columns[0].try_as_i64().unwrap(),
                (
                    r.columns[1].try_as_i64().unwrap(),
                    r.columns[2].try_as_i64().unwrap(),
                ),
            )
        })
        .collect();
    assert_eq!(Some(&(14, 2)), by_key.get(&7));
}

#[test]
fn hybrid_spill_deep_recursion() {
    // Two batches at level zero guarantees several recursion levels before
    // a batch fits in 250 entries.
    const KEYS: i64 = 5_000;
    let input: Vec<Row> = (0..KEYS * 2)
        .map(|i| {
            let key = (i * 104_729) % KEYS;
            row(vec![int(key), int(1)])
        })
        .collect();

    let node = || {
        AggregateNode::grouped(
            AggStrategy::Hashed,
            vec![DataType::Int64, DataType::Int64],
            vec![0],
            vec![count_call(1)],
        )
        .with_hybrid(HybridHint {
            entry_size: 64,
            num_groups: KEYS as f64,
        })
    };

    let spilled = run_with_config(node(), input.clone(), hybrid_config(250, 64, 2));
    assert_eq!(KEYS as usize, spilled.len());
    assert!(spilled
        .iter()
        .all(|r| r.columns[1].try_as_i64().unwrap() == 2));
}

#[test]
fn hybrid_spill_serializes_internal_states() {
    // avg carries an opaque state through serialize/deserialize on spill.
    let input: Vec<Row> = (0..4_000)
        .map(|i| {
            let key = (i * 613) % 1_000;
            row(vec![int(key), fl((key * 3) as f64)])
        })
        .collect();

    let node = || {
        let avg = AggregateCall::new(
            "avg",
            vec![PhysicalExpr::column(1)],
            vec![DataType::Float64],
        );
        AggregateNode::grouped(
            AggStrategy::Hashed,
            vec![DataType::Int64, DataType::Float64],
            vec![0],
            vec![avg],
        )
        .with_hybrid(HybridHint {
            entry_size: 64,
            num_groups: 1_000.0,
        })
    };

    let spilled = run_with_config(node(), input.clone(), hybrid_config(100, 64, 4));
    let reference = run_with_config(node(), input, ExecutionConfig::default());
    assert_eq!(multiset(&reference), multiset(&spilled));
}

#[test]
fn sized_table_without_hybrid_fails_on_overflow() {
    let input: Vec<Row> = (0..100).map(|i| row(vec![int(i), int(1)])).collect();
    let node = AggregateNode::grouped(
        AggStrategy::Hashed,
        vec![DataType::Int64, DataType::Int64],
        vec![0],
        vec![sum_call(1)],
    )
    .with_hybrid(HybridHint {
        entry_size: 64,
        num_groups: 100.0,
    });

    let config = ExecutionConfig {
        work_mem: 10 * 64,
        enable_hybrid_hash_agg: false,
        ..ExecutionConfig::default()
    };
    let mut executor =
        AggregateExecutor::try_new(node, Box::new(VecRowSource::new(input)), config).unwrap();
    let mut result = Ok(None);
    for _ in 0..200 {
        result = executor.next_row();
        if result.is_err() {
            break;
        }
    }
    assert!(matches!(result, Err(QuernError::Internal(_))));
}

#[test]
fn partial_aggregation_pipeline() {
    // Split the input across three streams, run initial+serialize on each,
    // then combine+deserialize+final over the serialized partials.
    let values: Vec<(f64, i64)> = (0..99).map(|i| (i as f64, (i * 3) as i64)).collect();

    let partial_node = || {
        let avg = AggregateCall::new(
            "avg",
            vec![PhysicalExpr::column(0)],
            vec![DataType::Float64],
        );
        AggregateNode::plain(
            vec![DataType::Float64, DataType::Int64],
            vec![avg, sum_call(1)],
        )
        .with_split(AggSplit::INITIAL_SERIAL)
    };

    let mut partial_rows = Vec::new();
    for chunk in 0..3 {
        let stream: Vec<Row> = values
            .iter()
            .filter(|(_, v)| (*v / 3) % 3 == chunk)
            .map(|(f, v)| row(vec![fl(*f), int(*v)]))
            .collect();
        let mut out = run(partial_node(), stream);
        assert_eq!(1, out.len());
        partial_rows.append(&mut out);
    }

    // Partial rows carry [serialized avg state, partial sum].
    assert!(matches!(
        partial_rows[0].columns[0],
        ScalarValue::Binary(_)
    ));

    let final_node = {
        let avg = AggregateCall::new(
            "avg",
            vec![PhysicalExpr::column(0)],
            vec![DataType::Float64],
        );
        AggregateNode::plain(
            vec![DataType::Binary, DataType::Int64],
            vec![avg, sum_call(1)],
        )
        .with_split(AggSplit::FINAL_DESERIAL)
    };
    let combined = run(final_node, partial_rows);

    let single_pass = {
        let avg = AggregateCall::new(
            "avg",
            vec![PhysicalExpr::column(0)],
            vec![DataType::Float64],
        );
        run(
            AggregateNode::plain(
                vec![DataType::Float64, DataType::Int64],
                vec![avg, sum_call(1)],
            ),
            values.iter().map(|(f, v)| row(vec![fl(*f), int(*v)])).collect(),
        )
    };

    assert_eq!(single_pass, combined);
}

#[test]
fn interrupt_cancels_execution() {
    let node = AggregateNode::plain(vec![DataType::Int64], vec![sum_call(0)]);
    let interrupts = Interrupts::new();
    let mut executor = AggregateExecutor::try_new_with(
        node,
        Box::new(VecRowSource::new(vec![row(vec![int(1)])])),
        ExecutionConfig::default(),
        &AggregateCatalog::new(),
        interrupts.clone(),
        None,
    )
    .unwrap();

    interrupts.interrupt();
    assert!(matches!(
        executor.next_row(),
        Err(QuernError::Interrupted)
    ));
}

#[test]
fn redistributed_hash_aggregation_across_workers() {
    use std::thread;

    const WORKERS: usize = 3;
    let state = RedistributeState::new(WORKERS);

    // Each worker sees a slice of the input; groups must come out exactly
    // once across all workers.
    let input: Vec<Row> = (0..300)
        .map(|i| row(vec![int((i % 20) as i64), int(i as i64)]))
        .collect();

    let node = || {
        AggregateNode::grouped(
            AggStrategy::Hashed,
            vec![DataType::Int64, DataType::Int64],
            vec![0],
            vec![sum_call(1), count_call(1)],
        )
    };

    let mut handles = Vec::new();
    for worker_idx in 0..WORKERS {
        let state = state.clone();
        let slice: Vec<Row> = input
            .iter()
            .skip(worker_idx)
            .step_by(WORKERS)
            .cloned()
            .collect();
        let node = node();
        handles.push(thread::spawn(move || {
            let link = WorkerLink::new(state, worker_idx, Interrupts::new());
            let mut executor = AggregateExecutor::try_new_with(
                node,
                Box::new(VecRowSource::new(slice)),
                ExecutionConfig::default(),
                &AggregateCatalog::new(),
                Interrupts::new(),
                Some(link),
            )
            .unwrap();
            let mut out = Vec::new();
            while let Some(row) = executor.next_row().unwrap() {
                out.push(row);
            }
            out
        }));
    }

    let mut all: Vec<Row> = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }

    let reference = run(node(), input);
    assert_eq!(multiset(&reference), multiset(&all));
}
