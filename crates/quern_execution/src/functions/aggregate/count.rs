use quern_error::Result;
use quern_row::{DataType, ScalarValue};

use super::{AggContext, AggregateEntry, StateType, StateValue};

/// `count(x)`: strict, so null inputs are skipped by the caller.
pub static COUNT: AggregateEntry = AggregateEntry {
    name: "count",
    input_types: &[DataType::Int64],
    state_type: StateType::Typed(DataType::Int64),
    result_type: DataType::Int64,
    initial_value: Some("0"),
    internal_initial: None,
    transition: count_transition,
    transition_strict: true,
    combine: Some(count_combine),
    combine_strict: true,
    final_fn: None,
    final_strict: false,
    final_extra: false,
    serialize: None,
    deserialize: None,
};

/// `count(*)`: no arguments, counts every row.
pub static COUNT_STAR: AggregateEntry = AggregateEntry {
    name: "count_star",
    input_types: &[],
    state_type: StateType::Typed(DataType::Int64),
    result_type: DataType::Int64,
    initial_value: Some("0"),
    internal_initial: None,
    transition: count_transition,
    transition_strict: false,
    combine: Some(count_combine),
    combine_strict: true,
    final_fn: None,
    final_strict: false,
    final_extra: false,
    serialize: None,
    deserialize: None,
};

fn count_transition(
    _ctx: &mut AggContext,
    state: StateValue,
    _args: &[ScalarValue],
) -> Result<StateValue> {
    let cur = state.try_into_scalar()?.try_as_i64()?;
    Ok(StateValue::Scalar(ScalarValue::Int64(cur + 1)))
}

fn count_combine(
    _ctx: &mut AggContext,
    state: StateValue,
    other: StateValue,
) -> Result<StateValue> {
    let a = state.try_into_scalar()?.try_as_i64()?;
    let b = other.try_into_scalar()?.try_as_i64()?;
    Ok(StateValue::Scalar(ScalarValue::Int64(a + b)))
}
