//! Per-aggregate machinery: advancing transition states, merging partial
//! states, draining per-aggregate sorters, and finalizing results.

use quern_error::{QuernError, Result};
use quern_row::{Row, ScalarValue};

use crate::config::Interrupts;
use crate::functions::aggregate::{AggContext, StateType, StateValue};
use crate::memory::Arena;

use super::build::{AggSlot, AggSorter, GroupCell, TransSlot};
use super::node::AggSplit;

/// Advance one transition state with the evaluated arguments of one row.
///
/// Strictness is handled here, not in the function: a strict transition is
/// never called with a null input, and a strict transition whose state was
/// never seeded adopts the first non-null input directly (the planner has
/// verified binary compatibility).
pub(crate) fn advance_transition(
    slot: &TransSlot,
    trans_idx: usize,
    cell: &mut GroupCell,
    arena: &mut Arena,
    args: &[ScalarValue],
) -> Result<()> {
    let entry = slot.entry;

    if entry.transition_strict {
        if args[..slot.num_trans_inputs].iter().any(ScalarValue::is_null) {
            return Ok(());
        }
        if cell.unseeded {
            let seed = args[0].clone();
            arena.charge(seed.size_bytes());
            cell.value = StateValue::Scalar(seed);
            cell.is_null = false;
            cell.unseeded = false;
            return Ok(());
        }
        if cell.is_null {
            // Once a strict transition's state goes null it stays null.
            return Ok(());
        }
    }

    let prev = if cell.is_null {
        StateValue::null()
    } else {
        std::mem::replace(&mut cell.value, StateValue::null())
    };
    let prev_size = prev.size_bytes();

    let mut ctx = AggContext { arena, trans_idx };
    let next = (entry.transition)(&mut ctx, prev, &args[..slot.num_trans_inputs])?;
    ctx.arena.charge(next.size_bytes().saturating_sub(prev_size));

    cell.is_null = next.is_null();
    cell.value = next;
    Ok(())
}

/// Merge an incoming partial state into a group cell via the combine
/// function.
///
/// A strict combine treats a null incoming state as a no-op and adopts the
/// incoming state wholesale when the cell was never seeded. Callers on the
/// spill-reload path must verify seeding before calling; reload never
/// produces unseeded cells.
pub(crate) fn combine_transition(
    slot: &TransSlot,
    trans_idx: usize,
    cell: &mut GroupCell,
    arena: &mut Arena,
    incoming: StateValue,
) -> Result<()> {
    let entry = slot.entry;
    let combine = entry.combine.ok_or_else(|| {
        QuernError::internal(format!("{} has no combine function", entry.name))
    })?;

    if entry.combine_strict {
        if incoming.is_null() {
            return Ok(());
        }
        if cell.unseeded {
            arena.charge(incoming.size_bytes());
            cell.value = incoming;
            cell.is_null = false;
            cell.unseeded = false;
            return Ok(());
        }
        if cell.is_null {
            return Ok(());
        }
    }

    let prev = if cell.is_null {
        StateValue::null()
    } else {
        std::mem::replace(&mut cell.value, StateValue::null())
    };

    let mut ctx = AggContext { arena, trans_idx };
    let next = (combine)(&mut ctx, prev, incoming)?;

    cell.is_null = next.is_null();
    cell.unseeded = false;
    cell.value = next;
    Ok(())
}

/// Turn the first transition argument of a combining node into a state
/// value, deserializing opaque states when the split mode says so.
pub(crate) fn incoming_partial_state(
    slot: &TransSlot,
    trans_idx: usize,
    arena: &mut Arena,
    split: AggSplit,
    raw: &ScalarValue,
) -> Result<StateValue> {
    if raw.is_null() {
        return Ok(StateValue::null());
    }
    if split.deserialize && slot.entry.state_type == StateType::Internal {
        let deserialize = slot.entry.deserialize.ok_or_else(|| {
            QuernError::internal(format!("{} has no deserialize function", slot.entry.name))
        })?;
        let bytes = match raw {
            ScalarValue::Binary(bytes) => bytes,
            other => {
                return Err(QuernError::TypeMismatch(format!(
                    "serialized state must be binary, got {}",
                    other.datatype()
                )))
            }
        };
        let mut ctx = AggContext { arena, trans_idx };
        return (deserialize)(&mut ctx, bytes);
    }
    Ok(StateValue::Scalar(raw.clone()))
}

/// Drain a per-aggregate sorter at group boundary, applying DISTINCT and
/// feeding accepted values through the transition function in sort order.
pub(crate) fn process_ordered(
    slot: &mut TransSlot,
    set: usize,
    trans_idx: usize,
    cell: &mut GroupCell,
    arena: &mut Arena,
    interrupts: &Interrupts,
) -> Result<()> {
    let Some(sorter) = slot.sorters[set].take() else {
        return Ok(());
    };

    match sorter {
        AggSorter::Datum(mut sorter) => {
            sorter.finalize();
            let mut prev: Option<ScalarValue> = None;
            while let Some(value) = sorter.get()? {
                interrupts.check()?;
                if slot.num_distinct_cols > 0 {
                    if let Some(p) = &prev {
                        if (slot.eq_fns[0])(p, &value) {
                            continue;
                        }
                    }
                }
                advance_transition(slot, trans_idx, cell, arena, std::slice::from_ref(&value))?;
                if slot.num_distinct_cols > 0 {
                    prev = Some(value);
                }
            }
        }
        AggSorter::Tuple(mut sorter) => {
            sorter.finalize();
            // Two-row window for the duplicate check.
            let mut prev: Option<Row> = None;
            while let Some(row) = sorter.get()? {
                interrupts.check()?;
                if slot.num_distinct_cols > 0 {
                    if let Some(p) = &prev {
                        let duplicate = slot
                            .sort_keys
                            .iter()
                            .take(slot.num_distinct_cols)
                            .zip(slot.eq_fns.iter())
                            .all(|(key, eq)| {
                                eq(&p.columns[key.column], &row.columns[key.column])
                            });
                        if duplicate {
                            continue;
                        }
                    }
                }
                advance_transition(
                    slot,
                    trans_idx,
                    cell,
                    arena,
                    &row.columns[..slot.num_trans_inputs],
                )?;
                if slot.num_distinct_cols > 0 {
                    prev = Some(row);
                }
            }
        }
    }

    Ok(())
}

/// Compute the final value of one aggregate for the group `cell` belongs to.
///
/// Direct arguments are evaluated against the representative row. With the
/// skip-final split mode the transition state itself is emitted, serialized
/// when the split asks for it.
pub(crate) fn finalize_aggregate(
    slot: &TransSlot,
    agg: &AggSlot,
    cell: &GroupCell,
    rep_row: &Row,
    split: AggSplit,
    out_arena: &mut Arena,
) -> Result<ScalarValue> {
    if split.skip_final {
        if cell.is_null {
            return Ok(ScalarValue::Null);
        }
        return match slot.entry.state_type {
            StateType::Internal => {
                let serialize = slot.entry.serialize.ok_or_else(|| {
                    QuernError::internal(format!(
                        "{} has no serialize function",
                        slot.entry.name
                    ))
                })?;
                let bytes = (serialize)(&cell.value)?;
                out_arena.charge(bytes.len());
                Ok(ScalarValue::Binary(bytes))
            }
            StateType::Typed(_) => {
                let value = cell.value.try_as_scalar()?.clone();
                out_arena.charge(value.size_bytes());
                Ok(value)
            }
        };
    }

    let mut final_args = Vec::with_capacity(agg.num_final_args.saturating_sub(1));
    for expr in &slot.direct_args {
        final_args.push(expr.eval(rep_row)?);
    }
    if slot.entry.final_extra {
        // Dummy argument positions matching the aggregated inputs.
        final_args.extend(std::iter::repeat(ScalarValue::Null).take(slot.num_trans_inputs));
    }

    match slot.entry.final_fn {
        Some(final_fn) => {
            if slot.entry.final_strict
                && (cell.is_null || final_args.iter().any(ScalarValue::is_null))
            {
                return Ok(ScalarValue::Null);
            }
            let null_state;
            let state = if cell.is_null {
                null_state = StateValue::null();
                &null_state
            } else {
                &cell.value
            };
            let result = (final_fn)(state, &final_args)?;
            out_arena.charge(result.size_bytes());
            Ok(result)
        }
        None => {
            if cell.is_null {
                return Ok(ScalarValue::Null);
            }
            let value = cell.value.try_as_scalar()?.clone();
            out_arena.charge(value.size_bytes());
            Ok(value)
        }
    }
}
