use ahash::RandomState;
use quern_row::{Row, ScalarValue};
use std::hash::{BuildHasher, Hash, Hasher};

/// State used for all hashing during execution.
///
/// Fixed seeds so hash values agree between the in-memory table, the spill
/// batch router, and reload.
pub const HASH_RANDOM_STATE: RandomState = RandomState::with_seeds(0, 0, 0, 0);

/// Get the partition to use for a hash. Used wherever a consistent
/// hash-to-partition mapping is required.
pub const fn partition_for_hash(hash: u64, partitions: usize) -> usize {
    hash as usize % partitions
}

/// Hash the given columns of a row. Columns beyond the row's width hash as
/// nulls.
pub fn hash_row_columns(row: &Row, columns: &[usize]) -> u64 {
    let null = ScalarValue::Null;
    let mut hasher = HASH_RANDOM_STATE.build_hasher();
    for &col in columns {
        row.columns.get(col).unwrap_or(&null).hash(&mut hasher);
    }
    hasher.finish()
}

/// Hash a slice of scalars as one composite key.
pub fn hash_scalars(values: &[ScalarValue]) -> u64 {
    let mut hasher = HASH_RANDOM_STATE.build_hasher();
    for value in values {
        value.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_same_hash() {
        let a = Row::new(vec![
            ScalarValue::Utf8("k".to_string()),
            ScalarValue::Int64(1),
        ]);
        let b = Row::new(vec![
            ScalarValue::Utf8("k".to_string()),
            ScalarValue::Int64(2),
        ]);
        assert_eq!(hash_row_columns(&a, &[0]), hash_row_columns(&b, &[0]));
        assert_ne!(hash_row_columns(&a, &[0, 1]), hash_row_columns(&b, &[0, 1]));
    }

    #[test]
    fn row_and_scalar_hash_agree() {
        let row = Row::new(vec![ScalarValue::Int64(7), ScalarValue::Int64(9)]);
        assert_eq!(
            hash_row_columns(&row, &[1]),
            hash_scalars(&[ScalarValue::Int64(9)])
        );
    }
}
