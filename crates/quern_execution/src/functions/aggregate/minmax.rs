use std::cmp::Ordering;

use quern_error::Result;
use quern_row::{DataType, ScalarValue};

use super::{AggContext, AggregateEntry, StateType, StateValue};

macro_rules! minmax_entry {
    ($ident:ident, $name:literal, $datatype:ident, $trans:ident, $combine:ident) => {
        pub static $ident: AggregateEntry = AggregateEntry {
            name: $name,
            input_types: &[DataType::$datatype],
            state_type: StateType::Typed(DataType::$datatype),
            result_type: DataType::$datatype,
            initial_value: None,
            internal_initial: None,
            transition: $trans,
            transition_strict: true,
            combine: Some($combine),
            combine_strict: true,
            final_fn: None,
            final_strict: false,
            final_extra: false,
            serialize: None,
            deserialize: None,
        };
    };
}

minmax_entry!(MIN_INT64, "min", Int64, min_transition, min_combine);
minmax_entry!(MAX_INT64, "max", Int64, max_transition, max_combine);
minmax_entry!(MIN_UTF8, "min", Utf8, min_transition, min_combine);
minmax_entry!(MAX_UTF8, "max", Utf8, max_transition, max_combine);

fn pick(state: StateValue, candidate: &ScalarValue, keep: Ordering) -> Result<StateValue> {
    let cur = state.try_into_scalar()?;
    if candidate.total_cmp(&cur) == keep {
        Ok(StateValue::Scalar(candidate.clone()))
    } else {
        Ok(StateValue::Scalar(cur))
    }
}

fn min_transition(
    _ctx: &mut AggContext,
    state: StateValue,
    args: &[ScalarValue],
) -> Result<StateValue> {
    pick(state, &args[0], Ordering::Less)
}

fn max_transition(
    _ctx: &mut AggContext,
    state: StateValue,
    args: &[ScalarValue],
) -> Result<StateValue> {
    pick(state, &args[0], Ordering::Greater)
}

fn min_combine(
    _ctx: &mut AggContext,
    state: StateValue,
    other: StateValue,
) -> Result<StateValue> {
    let other = other.try_into_scalar()?;
    pick(state, &other, Ordering::Less)
}

fn max_combine(
    _ctx: &mut AggContext,
    state: StateValue,
    other: StateValue,
) -> Result<StateValue> {
    let other = other.try_into_scalar()?;
    pick(state, &other, Ordering::Greater)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Arena;

    #[test]
    fn min_keeps_smaller() {
        let mut arena = Arena::new("test");
        let mut ctx = AggContext {
            arena: &mut arena,
            trans_idx: 0,
        };

        let state = StateValue::Scalar(ScalarValue::Utf8("m".to_string()));
        let state =
            min_transition(&mut ctx, state, &[ScalarValue::Utf8("b".to_string())]).unwrap();
        assert_eq!(
            &ScalarValue::Utf8("b".to_string()),
            state.try_as_scalar().unwrap()
        );
    }
}
