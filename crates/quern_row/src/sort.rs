use std::cmp::Ordering;

use crate::row::Row;
use crate::scalar::ScalarValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullsOrder {
    First,
    Last,
}

/// One column of a sort requirement.
///
/// Collation is attached to the sort operator, not the equality test; a zero
/// id means the default collation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub column: usize,
    pub order: SortOrder,
    pub nulls: NullsOrder,
    pub collation: u32,
}

impl SortKey {
    pub fn asc(column: usize) -> Self {
        SortKey {
            column,
            order: SortOrder::Asc,
            nulls: NullsOrder::Last,
            collation: 0,
        }
    }
}

pub fn compare_scalars_with(
    left: &ScalarValue,
    right: &ScalarValue,
    order: SortOrder,
    nulls: NullsOrder,
) -> Ordering {
    let ord = match (left.is_null(), right.is_null()) {
        (true, true) => return Ordering::Equal,
        (true, false) => {
            return match nulls {
                NullsOrder::First => Ordering::Less,
                NullsOrder::Last => Ordering::Greater,
            }
        }
        (false, true) => {
            return match nulls {
                NullsOrder::First => Ordering::Greater,
                NullsOrder::Last => Ordering::Less,
            }
        }
        (false, false) => left.total_cmp(right),
    };

    match order {
        SortOrder::Asc => ord,
        SortOrder::Desc => ord.reverse(),
    }
}

/// Compare two rows on the given sort keys.
///
/// Column indexes out of range compare as null; the caller is expected to
/// hand rows wide enough for every key.
pub fn compare_rows(left: &Row, right: &Row, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let null = ScalarValue::Null;
        let l = left.columns.get(key.column).unwrap_or(&null);
        let r = right.columns.get(key.column).unwrap_or(&null);
        let ord = compare_scalars_with(l, r, key.order, key.nulls);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}
