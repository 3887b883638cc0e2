//! In-memory tuple sorting with a put / finalize / get surface.
//!
//! Phases of the aggregate operator use a `TupleSorter` both as the re-sort
//! bridge between rollup phases and as the per-aggregate sorter backing
//! DISTINCT and ORDER BY inside an aggregate call. Single-input aggregates
//! use the cheaper `DatumSorter` over bare values.

use quern_error::{QuernError, Result};
use quern_row::row::Row;
use quern_row::scalar::ScalarValue;
use quern_row::sort::{compare_rows, compare_scalars_with, NullsOrder, SortKey, SortOrder};

#[derive(Debug)]
pub struct TupleSorter {
    keys: Vec<SortKey>,
    rows: Vec<Row>,
    mem_used: usize,
    finalized: bool,
    next_idx: usize,
}

impl TupleSorter {
    pub fn new(keys: Vec<SortKey>) -> Self {
        TupleSorter {
            keys,
            rows: Vec::new(),
            mem_used: 0,
            finalized: false,
            next_idx: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn mem_used(&self) -> usize {
        self.mem_used
    }

    pub fn put(&mut self, row: Row) -> Result<()> {
        if self.finalized {
            return Err(QuernError::internal("put into a finalized sorter"));
        }
        self.mem_used += row.size_bytes();
        self.rows.push(row);
        Ok(())
    }

    /// Sort the accumulated rows. Must be called exactly once, before `get`.
    pub fn finalize(&mut self) {
        if !self.finalized {
            let keys = std::mem::take(&mut self.keys);
            self.rows.sort_by(|a, b| compare_rows(a, b, &keys));
            self.keys = keys;
            self.finalized = true;
        }
    }

    pub fn get(&mut self) -> Result<Option<Row>> {
        if !self.finalized {
            return Err(QuernError::internal("get from an unfinalized sorter"));
        }
        if self.next_idx >= self.rows.len() {
            return Ok(None);
        }
        let row = std::mem::take(&mut self.rows[self.next_idx]);
        self.next_idx += 1;
        Ok(Some(row))
    }
}

/// Sorter over single values for one-argument ordered/distinct aggregates.
#[derive(Debug)]
pub struct DatumSorter {
    order: SortOrder,
    nulls: NullsOrder,
    values: Vec<ScalarValue>,
    finalized: bool,
    next_idx: usize,
}

impl DatumSorter {
    pub fn new(order: SortOrder, nulls: NullsOrder) -> Self {
        DatumSorter {
            order,
            nulls,
            values: Vec::new(),
            finalized: false,
            next_idx: 0,
        }
    }

    pub fn put(&mut self, value: ScalarValue) -> Result<()> {
        if self.finalized {
            return Err(QuernError::internal("put into a finalized sorter"));
        }
        self.values.push(value);
        Ok(())
    }

    pub fn finalize(&mut self) {
        if !self.finalized {
            self.values
                .sort_by(|a, b| compare_scalars_with(a, b, self.order, self.nulls));
            self.finalized = true;
        }
    }

    pub fn get(&mut self) -> Result<Option<ScalarValue>> {
        if !self.finalized {
            return Err(QuernError::internal("get from an unfinalized sorter"));
        }
        if self.next_idx >= self.values.len() {
            return Ok(None);
        }
        let value = std::mem::replace(&mut self.values[self.next_idx], ScalarValue::Null);
        self.next_idx += 1;
        Ok(Some(value))
    }
}
