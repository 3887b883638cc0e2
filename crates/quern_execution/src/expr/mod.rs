//! Physical expressions evaluated against a single row.
//!
//! The aggregate operator consumes these for aggregate arguments, FILTER
//! clauses, direct arguments, and the post-aggregation qual. Only the small
//! set of shapes those sites need is provided.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use quern_error::{QuernError, Result};
use quern_row::{Row, ScalarValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    fn matches(&self, ord: Ordering) -> bool {
        match self {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::NotEq => ord != Ordering::Equal,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::LtEq => ord != Ordering::Greater,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::GtEq => ord != Ordering::Less,
        }
    }
}

/// Scalar functions callable from expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarFunc {
    Abs,
    /// Uniform random in [0, 1). Volatile: two evaluations of the same
    /// expression may differ, which blocks aggregate de-duplication.
    Random,
}

impl ScalarFunc {
    pub const fn is_volatile(&self) -> bool {
        matches!(self, ScalarFunc::Random)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PhysicalExpr {
    /// Reference a column of the input row.
    Column(usize),

    /// A constant.
    Literal(ScalarValue),

    /// Comparison producing a boolean (null if either side is null).
    Compare {
        op: CompareOp,
        left: Box<PhysicalExpr>,
        right: Box<PhysicalExpr>,
    },

    IsNull(Box<PhysicalExpr>),

    ScalarFunction {
        function: ScalarFunc,
        args: Vec<PhysicalExpr>,
    },

    /// An aggregate call appearing where only scalar expressions are legal.
    /// Never evaluable; the aggregate operator rejects plans that place one
    /// inside aggregate arguments.
    Aggregate { name: String },
}

impl PhysicalExpr {
    pub fn column(idx: usize) -> Self {
        PhysicalExpr::Column(idx)
    }

    pub fn literal(value: ScalarValue) -> Self {
        PhysicalExpr::Literal(value)
    }

    pub fn compare(op: CompareOp, left: PhysicalExpr, right: PhysicalExpr) -> Self {
        PhysicalExpr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn eval(&self, row: &Row) -> Result<ScalarValue> {
        match self {
            PhysicalExpr::Column(idx) => row.column(*idx).cloned(),
            PhysicalExpr::Literal(value) => Ok(value.clone()),
            PhysicalExpr::Compare { op, left, right } => {
                let l = left.eval(row)?;
                let r = right.eval(row)?;
                if l.is_null() || r.is_null() {
                    return Ok(ScalarValue::Null);
                }
                Ok(ScalarValue::Boolean(op.matches(l.total_cmp(&r))))
            }
            PhysicalExpr::IsNull(inner) => Ok(ScalarValue::Boolean(inner.eval(row)?.is_null())),
            PhysicalExpr::ScalarFunction { function, args } => match function {
                ScalarFunc::Abs => {
                    let v = args
                        .first()
                        .ok_or_else(|| QuernError::internal("abs requires one argument"))?
                        .eval(row)?;
                    Ok(match v {
                        ScalarValue::Null => ScalarValue::Null,
                        ScalarValue::Int32(v) => ScalarValue::Int32(v.wrapping_abs()),
                        ScalarValue::Int64(v) => ScalarValue::Int64(v.wrapping_abs()),
                        ScalarValue::Float64(v) => ScalarValue::Float64(v.abs()),
                        other => {
                            return Err(QuernError::TypeMismatch(format!(
                                "abs over {}",
                                other.datatype()
                            )))
                        }
                    })
                }
                ScalarFunc::Random => Ok(ScalarValue::Float64(rand::random::<f64>())),
            },
            PhysicalExpr::Aggregate { name } => Err(QuernError::NestedAggregate(format!(
                "aggregate {name} evaluated as a scalar expression"
            ))),
        }
    }

    /// Evaluate as a filter: true passes, false and null do not.
    pub fn eval_filter(&self, row: &Row) -> Result<bool> {
        Ok(match self.eval(row)? {
            ScalarValue::Boolean(b) => b,
            ScalarValue::Null => false,
            other => {
                return Err(QuernError::TypeMismatch(format!(
                    "filter produced {}, expected boolean",
                    other.datatype()
                )))
            }
        })
    }

    pub fn contains_aggregate(&self) -> bool {
        match self {
            PhysicalExpr::Aggregate { .. } => true,
            PhysicalExpr::Column(_) | PhysicalExpr::Literal(_) => false,
            PhysicalExpr::Compare { left, right, .. } => {
                left.contains_aggregate() || right.contains_aggregate()
            }
            PhysicalExpr::IsNull(inner) => inner.contains_aggregate(),
            PhysicalExpr::ScalarFunction { args, .. } => {
                args.iter().any(|a| a.contains_aggregate())
            }
        }
    }

    /// Conservative volatility: true if any node may yield different results
    /// on re-evaluation.
    pub fn is_volatile(&self) -> bool {
        match self {
            PhysicalExpr::Column(_) | PhysicalExpr::Literal(_) | PhysicalExpr::Aggregate { .. } => {
                false
            }
            PhysicalExpr::Compare { left, right, .. } => left.is_volatile() || right.is_volatile(),
            PhysicalExpr::IsNull(inner) => inner.is_volatile(),
            PhysicalExpr::ScalarFunction { function, args } => {
                function.is_volatile() || args.iter().any(|a| a.is_volatile())
            }
        }
    }

    /// Collect every input column the expression reads.
    pub fn referenced_columns(&self, acc: &mut BTreeSet<usize>) {
        match self {
            PhysicalExpr::Column(idx) => {
                acc.insert(*idx);
            }
            PhysicalExpr::Literal(_) | PhysicalExpr::Aggregate { .. } => {}
            PhysicalExpr::Compare { left, right, .. } => {
                left.referenced_columns(acc);
                right.referenced_columns(acc);
            }
            PhysicalExpr::IsNull(inner) => inner.referenced_columns(acc),
            PhysicalExpr::ScalarFunction { args, .. } => {
                for arg in args {
                    arg.referenced_columns(acc);
                }
            }
        }
    }
}

impl fmt::Display for PhysicalExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhysicalExpr::Column(idx) => write!(f, "@{idx}"),
            PhysicalExpr::Literal(value) => write!(f, "{value}"),
            PhysicalExpr::Compare { op, left, right } => {
                let op = match op {
                    CompareOp::Eq => "=",
                    CompareOp::NotEq => "<>",
                    CompareOp::Lt => "<",
                    CompareOp::LtEq => "<=",
                    CompareOp::Gt => ">",
                    CompareOp::GtEq => ">=",
                };
                write!(f, "{left} {op} {right}")
            }
            PhysicalExpr::IsNull(inner) => write!(f, "{inner} IS NULL"),
            PhysicalExpr::ScalarFunction { function, args } => {
                write!(f, "{function:?}(")?;
                for (idx, arg) in args.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            PhysicalExpr::Aggregate { name } => write!(f, "{name}(...)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_null_is_null() {
        let expr = PhysicalExpr::compare(
            CompareOp::Eq,
            PhysicalExpr::column(0),
            PhysicalExpr::literal(ScalarValue::Int64(1)),
        );
        let row = Row::new(vec![ScalarValue::Null]);
        assert_eq!(ScalarValue::Null, expr.eval(&row).unwrap());
        assert!(!expr.eval_filter(&row).unwrap());
    }

    #[test]
    fn volatility_detected_through_nesting() {
        let expr = PhysicalExpr::compare(
            CompareOp::Gt,
            PhysicalExpr::ScalarFunction {
                function: ScalarFunc::Random,
                args: vec![],
            },
            PhysicalExpr::literal(ScalarValue::Float64(0.5)),
        );
        assert!(expr.is_volatile());
        assert!(!PhysicalExpr::column(2).is_volatile());
    }

    #[test]
    fn referenced_columns_dedup() {
        let expr = PhysicalExpr::compare(
            CompareOp::Eq,
            PhysicalExpr::column(3),
            PhysicalExpr::column(3),
        );
        let mut cols = BTreeSet::new();
        expr.referenced_columns(&mut cols);
        assert_eq!(vec![3], cols.into_iter().collect::<Vec<_>>());
    }
}
