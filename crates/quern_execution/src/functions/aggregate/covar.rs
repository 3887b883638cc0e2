use quern_error::{QuernError, Result};
use quern_row::{DataType, ScalarValue};

use super::{AggContext, AggregateEntry, InternalState, StateType, StateValue};

/// Population covariance over (y, x) pairs.
pub static COVAR_POP_FLOAT64: AggregateEntry = AggregateEntry {
    name: "covar_pop",
    input_types: &[DataType::Float64, DataType::Float64],
    state_type: StateType::Internal,
    result_type: DataType::Float64,
    initial_value: Some("0,0,0,0"),
    internal_initial: Some(new_covar_state),
    transition: covar_transition,
    transition_strict: true,
    combine: Some(covar_combine),
    combine_strict: false,
    final_fn: Some(covar_pop_final),
    final_strict: false,
    final_extra: false,
    serialize: Some(covar_serialize),
    deserialize: Some(covar_deserialize),
};

#[derive(Debug, Default, Clone, Copy)]
struct CovarState {
    count: i64,
    sum_y: f64,
    sum_x: f64,
    sum_xy: f64,
}

impl InternalState for CovarState {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn size_bytes(&self) -> usize {
        std::mem::size_of::<CovarState>()
    }
}

fn new_covar_state() -> Box<dyn InternalState> {
    Box::<CovarState>::default()
}

fn covar_transition(
    _ctx: &mut AggContext,
    mut state: StateValue,
    args: &[ScalarValue],
) -> Result<StateValue> {
    let y = args[0].try_as_f64()?;
    let x = args[1].try_as_f64()?;
    let covar = state.internal_mut::<CovarState>()?;
    covar.count += 1;
    covar.sum_y += y;
    covar.sum_x += x;
    covar.sum_xy += x * y;
    Ok(state)
}

fn covar_combine(
    ctx: &mut AggContext,
    mut state: StateValue,
    other: StateValue,
) -> Result<StateValue> {
    if other.is_null() {
        return Ok(state);
    }
    if state.is_null() {
        ctx.arena.charge(other.size_bytes());
        return Ok(other);
    }

    let incoming = *other.internal_ref::<CovarState>()?;
    let covar = state.internal_mut::<CovarState>()?;
    covar.count += incoming.count;
    covar.sum_y += incoming.sum_y;
    covar.sum_x += incoming.sum_x;
    covar.sum_xy += incoming.sum_xy;
    Ok(state)
}

fn covar_pop_final(state: &StateValue, _direct: &[ScalarValue]) -> Result<ScalarValue> {
    if state.is_null() {
        return Ok(ScalarValue::Null);
    }
    let covar = state.internal_ref::<CovarState>()?;
    if covar.count == 0 {
        return Ok(ScalarValue::Null);
    }
    let n = covar.count as f64;
    Ok(ScalarValue::Float64(
        (covar.sum_xy - covar.sum_x * covar.sum_y / n) / n,
    ))
}

fn covar_serialize(state: &StateValue) -> Result<Vec<u8>> {
    let covar = state.internal_ref::<CovarState>()?;
    let mut buf = Vec::with_capacity(32);
    buf.extend_from_slice(&covar.count.to_le_bytes());
    buf.extend_from_slice(&covar.sum_y.to_le_bytes());
    buf.extend_from_slice(&covar.sum_x.to_le_bytes());
    buf.extend_from_slice(&covar.sum_xy.to_le_bytes());
    Ok(buf)
}

fn covar_deserialize(ctx: &mut AggContext, bytes: &[u8]) -> Result<StateValue> {
    if bytes.len() != 32 {
        return Err(QuernError::SpillCorruption(format!(
            "covariance state expects 32 bytes, got {}",
            bytes.len()
        )));
    }
    let state = CovarState {
        count: i64::from_le_bytes(bytes[0..8].try_into().unwrap()),
        sum_y: f64::from_le_bytes(bytes[8..16].try_into().unwrap()),
        sum_x: f64::from_le_bytes(bytes[16..24].try_into().unwrap()),
        sum_xy: f64::from_le_bytes(bytes[24..32].try_into().unwrap()),
    };
    ctx.arena.charge(state.size_bytes());
    Ok(StateValue::Internal(Box::new(state)))
}
