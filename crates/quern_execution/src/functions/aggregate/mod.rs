//! Aggregate function catalog.
//!
//! A catalog entry resolves an aggregate identifier to its component
//! function handles (transition, combine, final, serialize, deserialize),
//! the initial value in textual form, strictness flags, and state type
//! metadata. Handles are plain function pointers resolved once at executor
//! init; opaque state types get a trait-object vtable instead of a scalar.

pub mod count;
pub mod covar;
pub mod minmax;
pub mod numeric;
pub mod sum;

use std::any::Any;
use std::collections::HashSet;
use std::fmt::Debug;

use once_cell::sync::Lazy;
use quern_error::{QuernError, Result};
use quern_row::{DataType, ScalarValue};

use crate::memory::Arena;

/// Context handed to every component function invocation.
///
/// Carries the arena the current group's state lives in (state allocations
/// are charged here, and shutdown hooks registered here run at the group
/// boundary) and the index of the transition slot being advanced, for
/// implementations that need to know which aggregate is calling them.
pub struct AggContext<'a> {
    pub arena: &'a mut Arena,
    pub trans_idx: usize,
}

/// Opaque transition state for aggregates whose working representation is
/// not a plain scalar. Owned by the arena of its group.
pub trait InternalState: Debug + Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn size_bytes(&self) -> usize;
}

/// A transition value: either a scalar datum or an opaque internal state.
/// SQL NULL is represented as `Scalar(ScalarValue::Null)`.
#[derive(Debug)]
pub enum StateValue {
    Scalar(ScalarValue),
    Internal(Box<dyn InternalState>),
}

impl StateValue {
    pub fn null() -> Self {
        StateValue::Scalar(ScalarValue::Null)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Scalar(ScalarValue::Null))
    }

    pub fn size_bytes(&self) -> usize {
        match self {
            StateValue::Scalar(v) => v.size_bytes(),
            StateValue::Internal(s) => s.size_bytes(),
        }
    }

    pub fn try_into_scalar(self) -> Result<ScalarValue> {
        match self {
            StateValue::Scalar(v) => Ok(v),
            StateValue::Internal(_) => Err(QuernError::internal(
                "expected a scalar transition value, found an internal state",
            )),
        }
    }

    pub fn try_as_scalar(&self) -> Result<&ScalarValue> {
        match self {
            StateValue::Scalar(v) => Ok(v),
            StateValue::Internal(_) => Err(QuernError::internal(
                "expected a scalar transition value, found an internal state",
            )),
        }
    }

    /// Downcast an internal state to its concrete type.
    pub fn internal_mut<T: InternalState + 'static>(&mut self) -> Result<&mut T> {
        match self {
            StateValue::Internal(s) => s
                .as_any_mut()
                .downcast_mut::<T>()
                .ok_or_else(|| QuernError::internal("internal state downcast to wrong type")),
            StateValue::Scalar(_) => Err(QuernError::internal(
                "expected an internal state, found a scalar",
            )),
        }
    }

    pub fn internal_ref<T: InternalState + 'static>(&self) -> Result<&T> {
        match self {
            StateValue::Internal(s) => s
                .as_any()
                .downcast_ref::<T>()
                .ok_or_else(|| QuernError::internal("internal state downcast to wrong type")),
            StateValue::Scalar(_) => Err(QuernError::internal(
                "expected an internal state, found a scalar",
            )),
        }
    }
}

/// State type of an aggregate: a plain scalar type or an opaque internal
/// representation with its own serialize/deserialize pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateType {
    Typed(DataType),
    Internal,
}

pub type TransitionFn = fn(&mut AggContext, StateValue, &[ScalarValue]) -> Result<StateValue>;
pub type CombineFn = fn(&mut AggContext, StateValue, StateValue) -> Result<StateValue>;
pub type FinalFn = fn(&StateValue, &[ScalarValue]) -> Result<ScalarValue>;
pub type SerializeFn = fn(&StateValue) -> Result<Vec<u8>>;
pub type DeserializeFn = fn(&mut AggContext, &[u8]) -> Result<StateValue>;

/// One row of the aggregate catalog.
#[derive(Clone)]
pub struct AggregateEntry {
    pub name: &'static str,
    pub input_types: &'static [DataType],
    pub state_type: StateType,
    pub result_type: DataType,

    /// Initial value in textual form; None means a null initial value.
    pub initial_value: Option<&'static str>,
    /// Constructor for internal initial states; required when `state_type`
    /// is Internal and `initial_value` is set.
    pub internal_initial: Option<fn() -> Box<dyn InternalState>>,

    pub transition: TransitionFn,
    pub transition_strict: bool,

    pub combine: Option<CombineFn>,
    pub combine_strict: bool,

    pub final_fn: Option<FinalFn>,
    pub final_strict: bool,
    /// Whether the final function takes dummy argument positions matching
    /// the aggregated inputs (ordered-set convention).
    pub final_extra: bool,

    pub serialize: Option<SerializeFn>,
    pub deserialize: Option<DeserializeFn>,
}

impl Debug for AggregateEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateEntry")
            .field("name", &self.name)
            .field("input_types", &self.input_types)
            .field("state_type", &self.state_type)
            .field("result_type", &self.result_type)
            .finish_non_exhaustive()
    }
}

impl AggregateEntry {
    /// Parse the textual initial value into a runtime state.
    ///
    /// Returns None for a null initial value.
    pub fn parse_initial_value(&self) -> Result<Option<StateValue>> {
        let Some(text) = self.initial_value else {
            return Ok(None);
        };

        match self.state_type {
            StateType::Internal => {
                let make = self.internal_initial.ok_or_else(|| {
                    QuernError::PlannerContract(format!(
                        "aggregate {} declares an internal initial value without a constructor",
                        self.name
                    ))
                })?;
                Ok(Some(StateValue::Internal(make())))
            }
            StateType::Typed(datatype) => {
                let value = match datatype {
                    DataType::Int32 => ScalarValue::Int32(text.parse().map_err(|_| {
                        QuernError::CatalogMissing(format!("bad initial value {text:?}"))
                    })?),
                    DataType::Int64 => ScalarValue::Int64(text.parse().map_err(|_| {
                        QuernError::CatalogMissing(format!("bad initial value {text:?}"))
                    })?),
                    DataType::Float64 => ScalarValue::Float64(text.parse().map_err(|_| {
                        QuernError::CatalogMissing(format!("bad initial value {text:?}"))
                    })?),
                    DataType::Boolean => ScalarValue::Boolean(text.parse().map_err(|_| {
                        QuernError::CatalogMissing(format!("bad initial value {text:?}"))
                    })?),
                    DataType::Utf8 => ScalarValue::Utf8(text.to_string()),
                    other => {
                        return Err(QuernError::CatalogMissing(format!(
                            "initial value for unsupported state type {other}"
                        )))
                    }
                };
                Ok(Some(StateValue::Scalar(value)))
            }
        }
    }

    /// Pointer identity of the whole entry; used to recognize the same
    /// catalog function when de-duplicating calls.
    pub fn same_function(&self, other: &AggregateEntry) -> bool {
        std::ptr::eq(self, other)
    }

    /// Whether two entries run the same transition pipeline: same component
    /// handles, strictness, state type, and initial value.
    pub fn same_transition(&self, other: &AggregateEntry) -> bool {
        self.transition as usize == other.transition as usize
            && self.transition_strict == other.transition_strict
            && self.state_type == other.state_type
            && self.initial_value == other.initial_value
            && self.combine.map(|f| f as usize) == other.combine.map(|f| f as usize)
            && self.serialize.map(|f| f as usize) == other.serialize.map(|f| f as usize)
            && self.deserialize.map(|f| f as usize) == other.deserialize.map(|f| f as usize)
    }
}

static BUILTIN_AGGREGATES: Lazy<Vec<&'static AggregateEntry>> = Lazy::new(|| {
    vec![
        &sum::SUM_INT64,
        &sum::SUM_FLOAT64,
        &count::COUNT,
        &count::COUNT_STAR,
        &minmax::MIN_INT64,
        &minmax::MAX_INT64,
        &minmax::MIN_UTF8,
        &minmax::MAX_UTF8,
        &numeric::AVG_FLOAT64,
        &numeric::VAR_POP_FLOAT64,
        &numeric::VAR_SAMP_FLOAT64,
        &covar::COVAR_POP_FLOAT64,
    ]
});

/// The catalog handed to the executor. Wraps the built-in registry with an
/// optional per-session deny list for execute privileges.
#[derive(Debug, Default, Clone)]
pub struct AggregateCatalog {
    denied: HashSet<String>,
}

impl AggregateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_denied<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AggregateCatalog {
            denied: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn lookup(&self, name: &str, inputs: &[DataType]) -> Result<&'static AggregateEntry> {
        let entry = BUILTIN_AGGREGATES
            .iter()
            .find(|entry| entry.name == name && entry.input_types == inputs)
            .copied()
            .ok_or_else(|| {
                QuernError::CatalogMissing(format!("no aggregate {name}({inputs:?})"))
            })?;

        if self.denied.contains(name) {
            return Err(QuernError::Permission(format!(
                "execute denied on aggregate {name}"
            )));
        }

        Ok(entry)
    }
}
