//! Setup: catalog resolution, de-duplication of aggregate calls into
//! transition and final slots, phase construction, and plan validation.

use std::collections::BTreeSet;

use quern_error::{QuernError, Result};
use quern_row::datatype::{DataType, TypeLayout};
use quern_row::scalar::{equality_fn_for, EqualityFn};
use quern_row::sort::SortKey;
use quern_row::ScalarValue;

use crate::execution::operators::sort::{DatumSorter, TupleSorter};
use crate::expr::PhysicalExpr;
use crate::functions::aggregate::{
    AggregateCatalog, AggregateEntry, InternalState, StateType, StateValue,
};

use super::node::{AggStrategy, AggregateCall, AggregateNode, ChainedAgg, OutputColumn};

/// Pre-parsed initial value for a transition pipeline.
pub(crate) enum InitialValue {
    Null,
    Scalar(ScalarValue),
    Internal(fn() -> Box<dyn InternalState>),
}

impl std::fmt::Debug for InitialValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InitialValue::Null => write!(f, "Null"),
            InitialValue::Scalar(v) => write!(f, "Scalar({v})"),
            InitialValue::Internal(_) => write!(f, "Internal(..)"),
        }
    }
}

/// Transition state cell for one pipeline within one group.
#[derive(Debug)]
pub(crate) struct GroupCell {
    pub value: StateValue,
    pub is_null: bool,
    /// True until the state is first seeded; set only when the initial
    /// value is null. Once false it never becomes true again.
    pub unseeded: bool,
}

impl GroupCell {
    pub fn fresh(initial: &InitialValue) -> GroupCell {
        match initial {
            InitialValue::Null => GroupCell {
                value: StateValue::null(),
                is_null: true,
                unseeded: true,
            },
            InitialValue::Scalar(v) => GroupCell {
                value: StateValue::Scalar(v.clone()),
                is_null: false,
                unseeded: false,
            },
            InitialValue::Internal(make) => GroupCell {
                value: StateValue::Internal(make()),
                is_null: false,
                unseeded: false,
            },
        }
    }
}

/// Per-aggregate sorter backing DISTINCT / ORDER BY inside a call.
#[derive(Debug)]
pub(crate) enum AggSorter {
    Datum(DatumSorter),
    Tuple(TupleSorter),
}

/// One transition state pipeline. Aggregate calls with identical inputs,
/// transition function, and initial value share a slot.
pub(crate) struct TransSlot {
    pub entry: &'static AggregateEntry,
    pub collation: u32,

    pub args: Vec<PhysicalExpr>,
    pub filter: Option<PhysicalExpr>,
    pub direct_args: Vec<PhysicalExpr>,

    pub num_inputs: usize,
    pub num_trans_inputs: usize,

    pub sort_keys: Vec<SortKey>,
    pub num_distinct_cols: usize,
    /// Equality handles, one per distinct column.
    pub eq_fns: Vec<EqualityFn>,

    pub initial: InitialValue,
    pub state_layout: TypeLayout,

    /// Per-grouping-set sorters, created at group start for ordered or
    /// distinct input.
    pub sorters: Vec<Option<AggSorter>>,
}

impl std::fmt::Debug for TransSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransSlot")
            .field("function", &self.entry.name)
            .field("num_inputs", &self.num_inputs)
            .field("num_trans_inputs", &self.num_trans_inputs)
            .field("sort_keys", &self.sort_keys)
            .field("num_distinct_cols", &self.num_distinct_cols)
            .field("initial", &self.initial)
            .finish_non_exhaustive()
    }
}

impl TransSlot {
    pub fn make_cell(&self) -> GroupCell {
        GroupCell::fresh(&self.initial)
    }

    pub fn is_ordered_input(&self) -> bool {
        !self.sort_keys.is_empty()
    }

    pub fn new_sorter(&self) -> AggSorter {
        if self.num_inputs == 1 {
            let key = self.sort_keys[0];
            AggSorter::Datum(DatumSorter::new(key.order, key.nulls))
        } else {
            AggSorter::Tuple(TupleSorter::new(self.sort_keys.clone()))
        }
    }
}

/// One final value pipeline; references a transition slot by index.
#[derive(Debug)]
pub(crate) struct AggSlot {
    pub trans_idx: usize,
    pub entry: &'static AggregateEntry,
    pub result_type: DataType,
    pub num_final_args: usize,
}

/// One scan pass. Phase 0 is the hashed phase; sorted/plain phases follow.
#[derive(Debug)]
pub(crate) struct AggPhase {
    pub strategy: AggStrategy,
    /// Ordered grouping columns (sorted/plain phases).
    pub group_cols: Vec<usize>,
    /// Prefix lengths into `group_cols`, most specific first. Always
    /// non-empty for sorted/plain phases; a plain phase is `[0]`.
    pub set_lengths: Vec<usize>,
    /// Equality handles per position of `group_cols`.
    pub eq_fns: Vec<EqualityFn>,
    /// Input order this phase's scan requires.
    pub sort_requirement: Vec<SortKey>,
}

impl AggPhase {
    pub fn numsets(&self) -> usize {
        self.set_lengths.len()
    }

    /// Columns of the grouping set at `set` (a prefix of `group_cols`).
    pub fn set_cols(&self, set: usize) -> &[usize] {
        &self.group_cols[..self.set_lengths[set]]
    }
}

/// Everything `build` produces for the executor.
pub(crate) struct BuiltAggregates {
    pub phases: Vec<AggPhase>,
    pub trans_slots: Vec<TransSlot>,
    pub agg_slots: Vec<AggSlot>,
    pub agg_for_call: Vec<usize>,
    pub hashed_sets: Vec<Vec<usize>>,
    pub all_grouped_cols: BTreeSet<usize>,
    pub maxsets: usize,
}

fn contract(msg: impl Into<String>) -> QuernError {
    QuernError::PlannerContract(msg.into())
}

/// Flatten the node and its chain into phases plus the list of hashed sets.
///
/// Chain ordering rule: hashed entries first, sorted next, at most one
/// plain last. A mixed "real" node exists iff both hashed and sorted parts
/// are present.
fn build_phases(node: &AggregateNode) -> Result<(Vec<AggPhase>, Vec<Vec<usize>>)> {
    let width = node.num_input_columns();

    let mut hashed_sets: Vec<Vec<usize>> = Vec::new();
    let mut sorted_specs: Vec<(AggStrategy, Vec<usize>, Vec<usize>, Vec<SortKey>)> = Vec::new();

    let normalize_lengths = |group_cols: &[usize], lengths: &[usize]| -> Result<Vec<usize>> {
        let lengths = if lengths.is_empty() {
            vec![group_cols.len()]
        } else {
            lengths.to_vec()
        };
        if lengths[0] != group_cols.len() {
            return Err(contract(
                "finest grouping set must cover all of the phase's grouping columns",
            ));
        }
        if lengths.windows(2).any(|w| w[0] < w[1]) {
            return Err(contract(
                "grouping sets of a rollup must run from most to least specific",
            ));
        }
        Ok(lengths)
    };

    // The primary node's own grouping data belongs to its strategy. A mixed
    // node's primary part is the first sorted rollup.
    match node.strategy {
        AggStrategy::Hashed => {
            if node.group_cols.is_empty() {
                return Err(contract("hashed aggregation requires grouping columns"));
            }
            hashed_sets.push(node.group_cols.clone());
        }
        AggStrategy::Plain => {
            if !node.group_cols.is_empty() {
                return Err(contract("plain aggregation cannot have grouping columns"));
            }
            sorted_specs.push((AggStrategy::Plain, Vec::new(), vec![0], Vec::new()));
        }
        AggStrategy::Sorted | AggStrategy::Mixed => {
            let lengths = normalize_lengths(&node.group_cols, &node.set_lengths)?;
            sorted_specs.push((
                AggStrategy::Sorted,
                node.group_cols.clone(),
                lengths,
                node.sort_requirement.clone(),
            ));
        }
    }

    // Chain: hashed first, then sorted, then at most one plain.
    let mut seen_sorted = false;
    let mut seen_plain = false;
    for entry in &node.chain {
        match entry.strategy {
            AggStrategy::Hashed => {
                if seen_sorted || seen_plain {
                    return Err(contract("hashed chain entries must precede sorted ones"));
                }
                if entry.group_cols.is_empty() {
                    return Err(contract("hashed chain entry requires grouping columns"));
                }
                hashed_sets.push(entry.group_cols.clone());
            }
            AggStrategy::Sorted => {
                if seen_plain {
                    return Err(contract("sorted chain entries must precede the plain one"));
                }
                seen_sorted = true;
                let lengths = normalize_lengths(&entry.group_cols, &entry.set_lengths)?;
                let sort_req = if entry.sort_requirement.is_empty() {
                    entry.group_cols.iter().map(|&c| SortKey::asc(c)).collect()
                } else {
                    entry.sort_requirement.clone()
                };
                sorted_specs.push((AggStrategy::Sorted, entry.group_cols.clone(), lengths, sort_req));
            }
            AggStrategy::Plain => {
                if seen_plain {
                    return Err(contract("at most one plain chain entry is allowed"));
                }
                seen_plain = true;
                sorted_specs.push((AggStrategy::Plain, Vec::new(), vec![0], Vec::new()));
            }
            AggStrategy::Mixed => {
                return Err(contract("mixed strategy is not valid for a chain entry"));
            }
        }
    }

    // Strategy consistency with what the chain contributed.
    let has_hashed = !hashed_sets.is_empty();
    let has_sorted = !sorted_specs.is_empty();
    match node.strategy {
        AggStrategy::Mixed if !(has_hashed && has_sorted) => {
            return Err(contract(
                "mixed aggregation requires both hashed and sorted parts",
            ))
        }
        AggStrategy::Hashed if has_sorted => {
            return Err(contract(
                "hashed aggregation with sorted chain entries must be a mixed node",
            ))
        }
        AggStrategy::Plain | AggStrategy::Sorted if has_hashed => {
            return Err(contract(
                "sorted aggregation with hashed chain entries must be a mixed node",
            ))
        }
        _ => {}
    }

    for set in &hashed_sets {
        if set.iter().any(|&c| c >= width) {
            return Err(contract("grouping column out of range"));
        }
    }

    // Phase 0 is the hashed phase even when empty, keeping sorted phases
    // 1-based.
    let mut phases = vec![AggPhase {
        strategy: AggStrategy::Hashed,
        group_cols: Vec::new(),
        set_lengths: Vec::new(),
        eq_fns: Vec::new(),
        sort_requirement: Vec::new(),
    }];

    for (strategy, group_cols, set_lengths, sort_requirement) in sorted_specs {
        if group_cols.iter().any(|&c| c >= width) {
            return Err(contract("grouping column out of range"));
        }
        let eq_fns = group_cols
            .iter()
            .map(|&c| equality_fn_for(node.input_types[c]))
            .collect();
        phases.push(AggPhase {
            strategy,
            group_cols,
            set_lengths,
            eq_fns,
            sort_requirement,
        });
    }

    Ok((phases, hashed_sets))
}

fn resolve_initial(entry: &'static AggregateEntry) -> Result<InitialValue> {
    match entry.parse_initial_value()? {
        None => Ok(InitialValue::Null),
        Some(StateValue::Scalar(v)) => Ok(InitialValue::Scalar(v)),
        Some(StateValue::Internal(_)) => {
            // Re-derive through the constructor so cells can be built
            // repeatedly without cloning a trait object.
            let make = entry.internal_initial.ok_or_else(|| {
                contract(format!(
                    "aggregate {} has an internal initial value without a constructor",
                    entry.name
                ))
            })?;
            Ok(InitialValue::Internal(make))
        }
    }
}

fn validate_call(node: &AggregateNode, call: &AggregateCall) -> Result<()> {
    for expr in call
        .args
        .iter()
        .chain(call.filter.iter())
        .chain(call.direct_args.iter())
    {
        if expr.contains_aggregate() {
            return Err(QuernError::NestedAggregate(format!(
                "arguments of {} contain an aggregate call",
                call.function
            )));
        }
    }

    if call.num_trans_inputs > call.args.len() {
        return Err(contract("num_trans_inputs exceeds argument count"));
    }
    if call.input_types.len() != call.args.len() {
        return Err(contract("argument types do not match argument expressions"));
    }
    if call.num_distinct_cols != 0 && call.num_distinct_cols != call.sort_keys.len() {
        return Err(contract(
            "DISTINCT must cover either all sort columns or none",
        ));
    }
    if call
        .sort_keys
        .iter()
        .any(|key| key.column >= call.args.len())
    {
        return Err(contract("aggregate sort key out of argument range"));
    }

    let uses_hashing = matches!(node.strategy, AggStrategy::Hashed | AggStrategy::Mixed);
    if uses_hashing && !call.sort_keys.is_empty() {
        return Err(contract(
            "DISTINCT / ORDER BY aggregates cannot run under a hashed strategy",
        ));
    }
    if node.split.combine && !call.sort_keys.is_empty() {
        return Err(contract(
            "DISTINCT / ORDER BY aggregates cannot be combined from partials",
        ));
    }
    if node.split.combine && call.args.is_empty() {
        return Err(contract(
            "a combining aggregate needs its partial state as first argument",
        ));
    }
    if !call.ordered_set && !call.direct_args.is_empty() {
        return Err(contract(
            "direct arguments are only valid for ordered-set aggregates",
        ));
    }

    Ok(())
}

fn validate_entry(node: &AggregateNode, call: &AggregateCall, entry: &'static AggregateEntry) -> Result<()> {
    if node.split.combine && entry.combine.is_none() {
        return Err(contract(format!(
            "combining split mode but {} has no combine function",
            entry.name
        )));
    }
    if entry.combine.is_some() && entry.combine_strict && entry.state_type == StateType::Internal {
        return Err(contract(format!(
            "combine function of {} operates on an internal state and must not be strict",
            entry.name
        )));
    }
    if node.split.serialize
        && entry.state_type == StateType::Internal
        && entry.serialize.is_none()
    {
        return Err(contract(format!(
            "serializing split mode but {} has no serialize function",
            entry.name
        )));
    }
    if node.split.deserialize
        && entry.state_type == StateType::Internal
        && entry.deserialize.is_none()
    {
        return Err(contract(format!(
            "deserializing split mode but {} has no deserialize function",
            entry.name
        )));
    }
    if entry.state_type == StateType::Internal && !node.split.skip_final && entry.final_fn.is_none()
    {
        return Err(contract(format!(
            "{} has an internal state and requires a final function",
            entry.name
        )));
    }

    // A strict transition with a null initial value seeds the state from
    // the first input, which requires binary compatibility.
    if entry.transition_strict && entry.initial_value.is_none() {
        match entry.state_type {
            StateType::Internal => {
                return Err(QuernError::TypeMismatch(format!(
                    "{} is strict with a null initial value but its state is opaque",
                    entry.name
                )))
            }
            StateType::Typed(state_type) => {
                let first_input = call.input_types.first().copied().unwrap_or(DataType::Null);
                if !first_input.binary_compatible_with(&state_type) {
                    return Err(QuernError::TypeMismatch(format!(
                        "{}: first input type {first_input} is not binary-compatible with state type {state_type}",
                        entry.name
                    )));
                }
            }
        }
    }

    Ok(())
}

/// Resolve calls against the catalog and de-duplicate them into transition
/// and final slots.
///
/// Two calls share a final slot when every part of the call matches and no
/// argument contains a volatile function. They share only the transition
/// slot when the transition pipeline matches but the final part differs.
pub(crate) fn build(
    node: &AggregateNode,
    catalog: &AggregateCatalog,
) -> Result<BuiltAggregates> {
    let (phases, hashed_sets) = build_phases(node)?;

    let maxsets = phases[1..]
        .iter()
        .map(AggPhase::numsets)
        .max()
        .unwrap_or(1)
        .max(1);

    let mut all_grouped_cols: BTreeSet<usize> = BTreeSet::new();
    for phase in &phases[1..] {
        all_grouped_cols.extend(phase.group_cols.iter().copied());
    }
    for set in &hashed_sets {
        all_grouped_cols.extend(set.iter().copied());
    }

    let width = node.num_input_columns();
    for output in &node.output {
        match output {
            OutputColumn::GroupColumn(c) if *c >= width => {
                return Err(contract("output references an input column out of range"))
            }
            OutputColumn::AggregateResult(i) if *i >= node.aggregates.len() => {
                return Err(contract("output references a missing aggregate"))
            }
            _ => {}
        }
    }

    let mut trans_slots: Vec<TransSlot> = Vec::new();
    let mut agg_slots: Vec<AggSlot> = Vec::new();
    let mut agg_for_call: Vec<usize> = Vec::with_capacity(node.aggregates.len());

    for call in &node.aggregates {
        validate_call(node, call)?;

        let entry = catalog.lookup(
            &call.function,
            &call.input_types[..call.num_trans_inputs],
        )?;
        validate_entry(node, call, entry)?;

        let volatile = call.args.iter().any(PhysicalExpr::is_volatile)
            || call.filter.as_ref().is_some_and(PhysicalExpr::is_volatile);

        // Full-call match: share the final slot too.
        if !volatile {
            if let Some(existing) = agg_slots.iter().position(|slot| {
                let t = &trans_slots[slot.trans_idx];
                slot.entry.same_function(entry)
                    && slot.result_type == entry.result_type
                    && t.collation == call.collation
                    && t.args == call.args
                    && t.filter == call.filter
                    && t.direct_args == call.direct_args
                    && t.sort_keys == call.sort_keys
                    && t.num_distinct_cols == call.num_distinct_cols
                    && t.num_trans_inputs == call.num_trans_inputs
            }) {
                agg_for_call.push(existing);
                continue;
            }
        }

        // Transition-only match: same pipeline, different final part.
        let trans_idx = if volatile {
            None
        } else {
            trans_slots.iter().position(|t| {
                t.entry.same_transition(entry)
                    && t.collation == call.collation
                    && t.args == call.args
                    && t.filter == call.filter
                    && t.direct_args == call.direct_args
                    && t.sort_keys == call.sort_keys
                    && t.num_distinct_cols == call.num_distinct_cols
                    && t.num_trans_inputs == call.num_trans_inputs
            })
        };

        let trans_idx = match trans_idx {
            Some(idx) => idx,
            None => {
                let initial = resolve_initial(entry)?;
                let state_layout = match entry.state_type {
                    StateType::Typed(t) => t.layout(),
                    StateType::Internal => TypeLayout {
                        fixed_len: None,
                        by_value: false,
                    },
                };
                let eq_fns = call.sort_keys[..call.num_distinct_cols]
                    .iter()
                    .map(|key| {
                        let datatype = call
                            .input_types
                            .get(key.column)
                            .copied()
                            .unwrap_or(DataType::Null);
                        equality_fn_for(datatype)
                    })
                    .collect();

                trans_slots.push(TransSlot {
                    entry,
                    collation: call.collation,
                    args: call.args.clone(),
                    filter: call.filter.clone(),
                    direct_args: call.direct_args.clone(),
                    num_inputs: call.args.len(),
                    num_trans_inputs: call.num_trans_inputs,
                    sort_keys: call.sort_keys.clone(),
                    num_distinct_cols: call.num_distinct_cols,
                    eq_fns,
                    initial,
                    state_layout,
                    sorters: (0..maxsets).map(|_| None).collect(),
                });
                trans_slots.len() - 1
            }
        };

        let result_type = if node.split.skip_final {
            match entry.state_type {
                StateType::Internal => DataType::Binary,
                StateType::Typed(t) => t,
            }
        } else {
            entry.result_type
        };

        let num_final_args = 1
            + call.direct_args.len()
            + if entry.final_extra {
                call.num_trans_inputs
            } else {
                0
            };

        agg_slots.push(AggSlot {
            trans_idx,
            entry,
            result_type,
            num_final_args,
        });
        agg_for_call.push(agg_slots.len() - 1);
    }

    Ok(BuiltAggregates {
        phases,
        trans_slots,
        agg_slots,
        agg_for_call,
        hashed_sets,
        all_grouped_cols,
        maxsets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{CompareOp, ScalarFunc};
    use quern_row::DataType;

    fn sum_call(col: usize) -> AggregateCall {
        AggregateCall::new(
            "sum",
            vec![PhysicalExpr::column(col)],
            vec![DataType::Int64],
        )
    }

    #[test]
    fn identical_calls_share_one_slot() {
        let node = AggregateNode::plain(
            vec![DataType::Int64],
            vec![sum_call(0), sum_call(0)],
        );
        let built = build(&node, &AggregateCatalog::new()).unwrap();
        assert_eq!(1, built.trans_slots.len());
        assert_eq!(1, built.agg_slots.len());
        assert_eq!(vec![0, 0], built.agg_for_call);
    }

    #[test]
    fn different_columns_do_not_share() {
        let node = AggregateNode::plain(
            vec![DataType::Int64, DataType::Int64],
            vec![sum_call(0), sum_call(1)],
        );
        let built = build(&node, &AggregateCatalog::new()).unwrap();
        assert_eq!(2, built.trans_slots.len());
        assert_eq!(2, built.agg_slots.len());
    }

    #[test]
    fn variance_pair_shares_transition_only() {
        let call = |name: &str| {
            AggregateCall::new(
                name,
                vec![PhysicalExpr::column(0)],
                vec![DataType::Float64],
            )
        };
        let node = AggregateNode::plain(
            vec![DataType::Float64],
            vec![call("var_pop"), call("var_samp")],
        );
        let built = build(&node, &AggregateCatalog::new()).unwrap();
        assert_eq!(1, built.trans_slots.len());
        assert_eq!(2, built.agg_slots.len());
        assert_eq!(0, built.agg_slots[0].trans_idx);
        assert_eq!(0, built.agg_slots[1].trans_idx);
    }

    #[test]
    fn volatile_arguments_block_sharing() {
        let volatile_arg = PhysicalExpr::compare(
            CompareOp::Gt,
            PhysicalExpr::ScalarFunction {
                function: ScalarFunc::Random,
                args: vec![],
            },
            PhysicalExpr::column(0),
        );
        let call = AggregateCall::new(
            "count",
            vec![PhysicalExpr::column(0)],
            vec![DataType::Int64],
        )
        .with_filter(volatile_arg);

        let node = AggregateNode::plain(
            vec![DataType::Int64],
            vec![call.clone(), call],
        );
        let built = build(&node, &AggregateCatalog::new()).unwrap();
        assert_eq!(2, built.trans_slots.len());
        assert_eq!(2, built.agg_slots.len());
    }

    #[test]
    fn nested_aggregate_rejected() {
        let call = AggregateCall::new(
            "sum",
            vec![PhysicalExpr::Aggregate {
                name: "count".to_string(),
            }],
            vec![DataType::Int64],
        );
        let node = AggregateNode::plain(vec![DataType::Int64], vec![call]);
        assert!(matches!(
            build(&node, &AggregateCatalog::new()),
            Err(QuernError::NestedAggregate(_))
        ));
    }

    #[test]
    fn missing_catalog_entry() {
        let call = AggregateCall::new(
            "median",
            vec![PhysicalExpr::column(0)],
            vec![DataType::Int64],
        );
        let node = AggregateNode::plain(vec![DataType::Int64], vec![call]);
        assert!(matches!(
            build(&node, &AggregateCatalog::new()),
            Err(QuernError::CatalogMissing(_))
        ));
    }

    #[test]
    fn denied_function_fails_at_init() {
        let node = AggregateNode::plain(vec![DataType::Int64], vec![sum_call(0)]);
        let catalog = AggregateCatalog::with_denied(["sum"]);
        assert!(matches!(
            build(&node, &catalog),
            Err(QuernError::Permission(_))
        ));
    }

    #[test]
    fn distinct_under_hash_rejected() {
        let node = AggregateNode::grouped(
            AggStrategy::Hashed,
            vec![DataType::Int64, DataType::Int64],
            vec![0],
            vec![sum_call(1).distinct()],
        );
        assert!(matches!(
            build(&node, &AggregateCatalog::new()),
            Err(QuernError::PlannerContract(_))
        ));
    }

    #[test]
    fn rollup_lengths_must_decrease() {
        let mut node = AggregateNode::grouped(
            AggStrategy::Sorted,
            vec![DataType::Int64, DataType::Int64],
            vec![0, 1],
            vec![sum_call(1)],
        );
        node.set_lengths = vec![2, 0, 1];
        assert!(matches!(
            build(&node, &AggregateCatalog::new()),
            Err(QuernError::PlannerContract(_))
        ));
    }

    #[test]
    fn chain_ordering_enforced() {
        let mut node = AggregateNode::grouped(
            AggStrategy::Mixed,
            vec![DataType::Int64, DataType::Int64, DataType::Int64],
            vec![0, 1],
            vec![sum_call(2)],
        );
        node.chain = vec![
            ChainedAgg {
                strategy: AggStrategy::Sorted,
                group_cols: vec![1],
                set_lengths: vec![],
                sort_requirement: vec![],
            },
            ChainedAgg {
                strategy: AggStrategy::Hashed,
                group_cols: vec![0],
                set_lengths: vec![],
                sort_requirement: vec![],
            },
        ];
        assert!(matches!(
            build(&node, &AggregateCatalog::new()),
            Err(QuernError::PlannerContract(_))
        ));

        // The valid ordering passes.
        node.chain.swap(0, 1);
        let built = build(&node, &AggregateCatalog::new()).unwrap();
        assert_eq!(1, built.hashed_sets.len());
        assert_eq!(3, built.phases.len());
    }

    #[test]
    fn strict_transition_with_incompatible_seed_type() {
        use crate::functions::aggregate::sum::SUM_INT64;

        // A strict transition with a null initial value seeds from the first
        // input; a first input that is not binary-compatible with the state
        // type must be rejected at init.
        let mut entry = SUM_INT64.clone();
        entry.state_type = StateType::Typed(DataType::Float64);
        let entry: &'static AggregateEntry = Box::leak(Box::new(entry));

        let call = AggregateCall::new(
            "sum",
            vec![PhysicalExpr::column(0)],
            vec![DataType::Int64],
        );
        let node = AggregateNode::plain(vec![DataType::Int64], vec![call.clone()]);
        assert!(matches!(
            validate_entry(&node, &call, entry),
            Err(QuernError::TypeMismatch(_))
        ));
        assert!(validate_entry(&node, &call, &SUM_INT64).is_ok());
    }

    #[test]
    fn strict_combine_with_internal_state_rejected() {
        use crate::functions::aggregate::numeric::AVG_FLOAT64;

        let mut entry = AVG_FLOAT64.clone();
        entry.combine_strict = true;
        let entry: &'static AggregateEntry = Box::leak(Box::new(entry));

        let call = AggregateCall::new(
            "avg",
            vec![PhysicalExpr::column(0)],
            vec![DataType::Float64],
        );
        let node = AggregateNode::plain(vec![DataType::Float64], vec![call.clone()]);
        assert!(matches!(
            validate_entry(&node, &call, entry),
            Err(QuernError::PlannerContract(_))
        ));
    }
}
