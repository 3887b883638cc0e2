use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use quern_error::{QuernError, Result};

use crate::datatype::DataType;

/// A single owned scalar value.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Binary(Vec<u8>),
}

impl ScalarValue {
    pub fn datatype(&self) -> DataType {
        match self {
            ScalarValue::Null => DataType::Null,
            ScalarValue::Boolean(_) => DataType::Boolean,
            ScalarValue::Int32(_) => DataType::Int32,
            ScalarValue::Int64(_) => DataType::Int64,
            ScalarValue::Float64(_) => DataType::Float64,
            ScalarValue::Utf8(_) => DataType::Utf8,
            ScalarValue::Binary(_) => DataType::Binary,
        }
    }

    pub const fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }

    /// Approximate in-memory footprint, used for arena accounting.
    pub fn size_bytes(&self) -> usize {
        let heap = match self {
            ScalarValue::Utf8(s) => s.len(),
            ScalarValue::Binary(b) => b.len(),
            _ => 0,
        };
        std::mem::size_of::<ScalarValue>() + heap
    }

    pub fn try_as_bool(&self) -> Result<bool> {
        match self {
            ScalarValue::Boolean(b) => Ok(*b),
            other => Err(QuernError::TypeMismatch(format!(
                "expected boolean, got {}",
                other.datatype()
            ))),
        }
    }

    pub fn try_as_i64(&self) -> Result<i64> {
        match self {
            ScalarValue::Int32(v) => Ok(*v as i64),
            ScalarValue::Int64(v) => Ok(*v),
            other => Err(QuernError::TypeMismatch(format!(
                "expected integer, got {}",
                other.datatype()
            ))),
        }
    }

    pub fn try_as_f64(&self) -> Result<f64> {
        match self {
            ScalarValue::Float64(v) => Ok(*v),
            ScalarValue::Int32(v) => Ok(*v as f64),
            ScalarValue::Int64(v) => Ok(*v as f64),
            other => Err(QuernError::TypeMismatch(format!(
                "expected float, got {}",
                other.datatype()
            ))),
        }
    }

    /// Total order over values of the same type. Nulls sort last here;
    /// callers that care about null placement handle nulls before calling.
    /// Floats use the IEEE total order so NaN compares equal to itself.
    pub fn total_cmp(&self, other: &ScalarValue) -> Ordering {
        use ScalarValue::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Greater,
            (_, Null) => Ordering::Less,
            (Boolean(a), Boolean(b)) => a.cmp(b),
            (Int32(a), Int32(b)) => a.cmp(b),
            (Int64(a), Int64(b)) => a.cmp(b),
            (Float64(a), Float64(b)) => a.total_cmp(b),
            (Utf8(a), Utf8(b)) => a.cmp(b),
            (Binary(a), Binary(b)) => a.cmp(b),
            // Mixed-type comparison indicates a planning bug; order by type
            // tag to stay total rather than panic mid-sort.
            (a, b) => a.datatype_rank().cmp(&b.datatype_rank()),
        }
    }

    fn datatype_rank(&self) -> u8 {
        match self {
            ScalarValue::Null => 0,
            ScalarValue::Boolean(_) => 1,
            ScalarValue::Int32(_) => 2,
            ScalarValue::Int64(_) => 3,
            ScalarValue::Float64(_) => 4,
            ScalarValue::Utf8(_) => 5,
            ScalarValue::Binary(_) => 6,
        }
    }

    /// Append a self-describing encoding of this value.
    ///
    /// One tag byte (type, with the high bit marking null), then the payload:
    /// fixed-width little-endian for by-value types, u32 length prefix plus
    /// raw bytes for variable-length types.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            ScalarValue::Null => buf.push(0x80),
            ScalarValue::Boolean(v) => {
                buf.push(1);
                buf.push(*v as u8);
            }
            ScalarValue::Int32(v) => {
                buf.push(2);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            ScalarValue::Int64(v) => {
                buf.push(3);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            ScalarValue::Float64(v) => {
                buf.push(4);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            ScalarValue::Utf8(s) => {
                buf.push(5);
                buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            ScalarValue::Binary(b) => {
                buf.push(6);
                buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
                buf.extend_from_slice(b);
            }
        }
    }

    /// Decode a value previously written by `encode_into`. Returns the value
    /// and the number of bytes consumed.
    pub fn decode_from(buf: &[u8]) -> Result<(ScalarValue, usize)> {
        let corrupt = || QuernError::SpillCorruption("truncated scalar encoding".to_string());

        let tag = *buf.first().ok_or_else(corrupt)?;
        let rest = &buf[1..];
        match tag {
            0x80 => Ok((ScalarValue::Null, 1)),
            1 => {
                let v = *rest.first().ok_or_else(corrupt)?;
                Ok((ScalarValue::Boolean(v != 0), 2))
            }
            2 => {
                let bytes = rest.get(..4).ok_or_else(corrupt)?;
                Ok((ScalarValue::Int32(i32::from_le_bytes(bytes.try_into().unwrap())), 5))
            }
            3 => {
                let bytes = rest.get(..8).ok_or_else(corrupt)?;
                Ok((ScalarValue::Int64(i64::from_le_bytes(bytes.try_into().unwrap())), 9))
            }
            4 => {
                let bytes = rest.get(..8).ok_or_else(corrupt)?;
                Ok((ScalarValue::Float64(f64::from_le_bytes(bytes.try_into().unwrap())), 9))
            }
            5 | 6 => {
                let len_bytes = rest.get(..4).ok_or_else(corrupt)?;
                let len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
                let payload = rest.get(4..4 + len).ok_or_else(corrupt)?;
                let value = if tag == 5 {
                    ScalarValue::Utf8(
                        String::from_utf8(payload.to_vec())
                            .map_err(|_| QuernError::SpillCorruption("invalid utf8".to_string()))?,
                    )
                } else {
                    ScalarValue::Binary(payload.to_vec())
                };
                Ok((value, 1 + 4 + len))
            }
            other => Err(QuernError::SpillCorruption(format!(
                "unknown scalar tag {other}"
            ))),
        }
    }
}

impl Hash for ScalarValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            ScalarValue::Null => 0u8.hash(state),
            ScalarValue::Boolean(v) => v.hash(state),
            ScalarValue::Int32(v) => v.hash(state),
            ScalarValue::Int64(v) => v.hash(state),
            ScalarValue::Float64(v) => v.to_bits().hash(state),
            ScalarValue::Utf8(v) => v.hash(state),
            ScalarValue::Binary(v) => v.hash(state),
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Null => write!(f, "NULL"),
            ScalarValue::Boolean(v) => write!(f, "{v}"),
            ScalarValue::Int32(v) => write!(f, "{v}"),
            ScalarValue::Int64(v) => write!(f, "{v}"),
            ScalarValue::Float64(v) => write!(f, "{v}"),
            ScalarValue::Utf8(v) => write!(f, "{v}"),
            ScalarValue::Binary(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

/// Handle type for per-column equality checks.
///
/// Grouping and DISTINCT both treat nulls as equal to each other: two null
/// keys fall into the same group.
pub type EqualityFn = fn(&ScalarValue, &ScalarValue) -> bool;

pub fn scalars_group_equal(left: &ScalarValue, right: &ScalarValue) -> bool {
    match (left.is_null(), right.is_null()) {
        (true, true) => true,
        (true, false) | (false, true) => false,
        (false, false) => left.total_cmp(right) == Ordering::Equal,
    }
}

/// Resolve the equality function for a column type.
///
/// Every supported type currently shares one implementation; the indirection
/// keeps the call sites shaped like the per-column handles the planner hands
/// out.
pub fn equality_fn_for(_datatype: DataType) -> EqualityFn {
    scalars_group_equal
}
