//! Numeric moment aggregates with opaque internal states: avg, var_pop,
//! var_samp. The two variance flavors share one transition pipeline and
//! differ only in their final function.

use quern_error::{QuernError, Result};
use quern_row::{DataType, ScalarValue};

use super::{
    AggContext, AggregateEntry, InternalState, StateType, StateValue,
};

pub static AVG_FLOAT64: AggregateEntry = AggregateEntry {
    name: "avg",
    input_types: &[DataType::Float64],
    state_type: StateType::Internal,
    result_type: DataType::Float64,
    initial_value: Some("0,0"),
    internal_initial: Some(new_avg_state),
    transition: avg_transition,
    transition_strict: true,
    combine: Some(avg_combine),
    combine_strict: false,
    final_fn: Some(avg_final),
    final_strict: false,
    final_extra: false,
    serialize: Some(avg_serialize),
    deserialize: Some(avg_deserialize),
};

pub static VAR_POP_FLOAT64: AggregateEntry = AggregateEntry {
    name: "var_pop",
    input_types: &[DataType::Float64],
    state_type: StateType::Internal,
    result_type: DataType::Float64,
    initial_value: Some("0,0,0"),
    internal_initial: Some(new_var_state),
    transition: var_transition,
    transition_strict: true,
    combine: Some(var_combine),
    combine_strict: false,
    final_fn: Some(var_pop_final),
    final_strict: false,
    final_extra: false,
    serialize: Some(var_serialize),
    deserialize: Some(var_deserialize),
};

pub static VAR_SAMP_FLOAT64: AggregateEntry = AggregateEntry {
    name: "var_samp",
    input_types: &[DataType::Float64],
    state_type: StateType::Internal,
    result_type: DataType::Float64,
    initial_value: Some("0,0,0"),
    internal_initial: Some(new_var_state),
    transition: var_transition,
    transition_strict: true,
    combine: Some(var_combine),
    combine_strict: false,
    final_fn: Some(var_samp_final),
    final_strict: false,
    final_extra: false,
    serialize: Some(var_serialize),
    deserialize: Some(var_deserialize),
};

#[derive(Debug, Default, Clone, Copy)]
struct AvgState {
    count: i64,
    sum: f64,
}

impl InternalState for AvgState {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn size_bytes(&self) -> usize {
        std::mem::size_of::<AvgState>()
    }
}

fn new_avg_state() -> Box<dyn InternalState> {
    Box::<AvgState>::default()
}

fn avg_transition(
    _ctx: &mut AggContext,
    mut state: StateValue,
    args: &[ScalarValue],
) -> Result<StateValue> {
    let input = args[0].try_as_f64()?;
    let avg = state.internal_mut::<AvgState>()?;
    avg.count += 1;
    avg.sum += input;
    Ok(state)
}

fn avg_combine(
    ctx: &mut AggContext,
    mut state: StateValue,
    other: StateValue,
) -> Result<StateValue> {
    // Non-strict: a null partial contributes nothing, a null state adopts
    // the incoming partial.
    if other.is_null() {
        return Ok(state);
    }
    if state.is_null() {
        ctx.arena.charge(other.size_bytes());
        return Ok(other);
    }

    let incoming = *other.internal_ref::<AvgState>()?;
    let avg = state.internal_mut::<AvgState>()?;
    avg.count += incoming.count;
    avg.sum += incoming.sum;
    Ok(state)
}

fn avg_final(state: &StateValue, _direct: &[ScalarValue]) -> Result<ScalarValue> {
    if state.is_null() {
        return Ok(ScalarValue::Null);
    }
    let avg = state.internal_ref::<AvgState>()?;
    if avg.count == 0 {
        return Ok(ScalarValue::Null);
    }
    Ok(ScalarValue::Float64(avg.sum / avg.count as f64))
}

fn avg_serialize(state: &StateValue) -> Result<Vec<u8>> {
    let avg = state.internal_ref::<AvgState>()?;
    let mut buf = Vec::with_capacity(16);
    buf.extend_from_slice(&avg.count.to_le_bytes());
    buf.extend_from_slice(&avg.sum.to_le_bytes());
    Ok(buf)
}

fn avg_deserialize(ctx: &mut AggContext, bytes: &[u8]) -> Result<StateValue> {
    if bytes.len() != 16 {
        return Err(QuernError::SpillCorruption(format!(
            "avg state expects 16 bytes, got {}",
            bytes.len()
        )));
    }
    let state = AvgState {
        count: i64::from_le_bytes(bytes[0..8].try_into().unwrap()),
        sum: f64::from_le_bytes(bytes[8..16].try_into().unwrap()),
    };
    ctx.arena.charge(state.size_bytes());
    Ok(StateValue::Internal(Box::new(state)))
}

#[derive(Debug, Default, Clone, Copy)]
struct VarState {
    count: i64,
    sum: f64,
    sum_squares: f64,
}

impl InternalState for VarState {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn size_bytes(&self) -> usize {
        std::mem::size_of::<VarState>()
    }
}

fn new_var_state() -> Box<dyn InternalState> {
    Box::<VarState>::default()
}

fn var_transition(
    _ctx: &mut AggContext,
    mut state: StateValue,
    args: &[ScalarValue],
) -> Result<StateValue> {
    let input = args[0].try_as_f64()?;
    let var = state.internal_mut::<VarState>()?;
    var.count += 1;
    var.sum += input;
    var.sum_squares += input * input;
    Ok(state)
}

fn var_combine(
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

    let incoming = *other.internal_ref::<VarState>()?;
    let var = state.internal_mut::<VarState>()?;
    var.count += incoming.count;
    var.sum += incoming.sum;
    var.sum_squares += incoming.sum_squares;
    Ok(state)
}

fn var_moments(state: &StateValue) -> Result<Option<VarState>> {
    if state.is_null() {
        return Ok(None);
    }
    Ok(Some(*state.internal_ref::<VarState>()?))
}

fn var_pop_final(state: &StateValue, _direct: &[ScalarValue]) -> Result<ScalarValue> {
    let Some(var) = var_moments(state)? else {
        return Ok(ScalarValue::Null);
    };
    if var.count == 0 {
        return Ok(ScalarValue::Null);
    }
    let n = var.count as f64;
    let mean = var.sum / n;
    Ok(ScalarValue::Float64(var.sum_squares / n - mean * mean))
}

fn var_samp_final(state: &StateValue, _direct: &[ScalarValue]) -> Result<ScalarValue> {
    let Some(var) = var_moments(state)? else {
        return Ok(ScalarValue::Null);
    };
    if var.count < 2 {
        return Ok(ScalarValue::Null);
    }
    let n = var.count as f64;
    let mean = var.sum / n;
    Ok(ScalarValue::Float64(
        (var.sum_squares - n * mean * mean) / (n - 1.0),
    ))
}

fn var_serialize(state: &StateValue) -> Result<Vec<u8>> {
    let var = state.internal_ref::<VarState>()?;
    let mut buf = Vec::with_capacity(24);
    buf.extend_from_slice(&var.count.to_le_bytes());
    buf.extend_from_slice(&var.sum.to_le_bytes());
    buf.extend_from_slice(&var.sum_squares.to_le_bytes());
    Ok(buf)
}

fn var_deserialize(ctx: &mut AggContext, bytes: &[u8]) -> Result<StateValue> {
    if bytes.len() != 24 {
        return Err(QuernError::SpillCorruption(format!(
            "variance state expects 24 bytes, got {}",
            bytes.len()
        )));
    }
    let state = VarState {
        count: i64::from_le_bytes(bytes[0..8].try_into().unwrap()),
        sum: f64::from_le_bytes(bytes[8..16].try_into().unwrap()),
        sum_squares: f64::from_le_bytes(bytes[16..24].try_into().unwrap()),
    };
    ctx.arena.charge(state.size_bytes());
    Ok(StateValue::Internal(Box::new(state)))
}
