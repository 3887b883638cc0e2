use quern_error::Result;
use quern_row::{DataType, ScalarValue};

use super::{AggContext, AggregateEntry, StateType, StateValue};

/// `sum` over int64.
///
/// Strict transition with a null initial value: the first non-null input
/// seeds the state directly, so the transition body only ever sees a live
/// state.
pub static SUM_INT64: AggregateEntry = AggregateEntry {
    name: "sum",
    input_types: &[DataType::Int64],
    state_type: StateType::Typed(DataType::Int64),
    result_type: DataType::Int64,
    initial_value: None,
    internal_initial: None,
    transition: sum_int64_transition,
    transition_strict: true,
    combine: Some(sum_int64_combine),
    combine_strict: true,
    final_fn: None,
    final_strict: false,
    final_extra: false,
    serialize: None,
    deserialize: None,
};

pub static SUM_FLOAT64: AggregateEntry = AggregateEntry {
    name: "sum",
    input_types: &[DataType::Float64],
    state_type: StateType::Typed(DataType::Float64),
    result_type: DataType::Float64,
    initial_value: None,
    internal_initial: None,
    transition: sum_float64_transition,
    transition_strict: true,
    combine: Some(sum_float64_combine),
    combine_strict: true,
    final_fn: None,
    final_strict: false,
    final_extra: false,
    serialize: None,
    deserialize: None,
};

fn sum_int64_transition(
    _ctx: &mut AggContext,
    state: StateValue,
    args: &[ScalarValue],
) -> Result<StateValue> {
    let cur = state.try_into_scalar()?.try_as_i64()?;
    let input = args[0].try_as_i64()?;
    Ok(StateValue::Scalar(ScalarValue::Int64(
        cur.wrapping_add(input),
    )))
}

fn sum_int64_combine(
    _ctx: &mut AggContext,
    state: StateValue,
    other: StateValue,
) -> Result<StateValue> {
    let a = state.try_into_scalar()?.try_as_i64()?;
    let b = other.try_into_scalar()?.try_as_i64()?;
    Ok(StateValue::Scalar(ScalarValue::Int64(a.wrapping_add(b))))
}

fn sum_float64_transition(
    _ctx: &mut AggContext,
    state: StateValue,
    args: &[ScalarValue],
) -> Result<StateValue> {
    let cur = state.try_into_scalar()?.try_as_f64()?;
    let input = args[0].try_as_f64()?;
    Ok(StateValue::Scalar(ScalarValue::Float64(cur + input)))
}

fn sum_float64_combine(
    _ctx: &mut AggContext,
    state: StateValue,
    other: StateValue,
) -> Result<StateValue> {
    let a = state.try_into_scalar()?.try_as_f64()?;
    let b = other.try_into_scalar()?.try_as_f64()?;
    Ok(StateValue::Scalar(ScalarValue::Float64(a + b)))
}
