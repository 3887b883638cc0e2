//! Hash path: one table per hashed grouping set, keyed by the compact key
//! tuple (the grouping keys plus any columns referenced unaggregated in the
//! target list or qual).

use std::collections::BTreeSet;

use hashbrown::raw::RawTable;
use quern_error::{QuernError, Result};
use quern_row::scalar::{equality_fn_for, EqualityFn};
use quern_row::{Row, ScalarValue};

use crate::execution::operators::util::hash::hash_scalars;
use crate::memory::Arena;

use super::build::{GroupCell, TransSlot};
use super::hybrid::HybridState;
use super::node::{AggregateNode, OutputColumn};

#[derive(Debug)]
pub(crate) struct HashEntry {
    pub hash: u64,
    /// The compact key tuple; doubles as the group's representative.
    pub key_row: Row,
    /// One cell per transition slot.
    pub cells: Vec<GroupCell>,
}

impl HashEntry {
    fn placeholder() -> HashEntry {
        HashEntry {
            hash: 0,
            key_row: Row::empty(),
            cells: Vec::new(),
        }
    }
}

pub(crate) enum LookupOutcome {
    Found(usize),
    Inserted(usize),
    /// The table is at capacity and the key is new.
    Full,
}

/// Open-addressed table over dense entry storage.
pub(crate) struct HashAggTable {
    raw: RawTable<(u64, usize)>,
    pub entries: Vec<HashEntry>,
}

impl std::fmt::Debug for HashAggTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashAggTable")
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl HashAggTable {
    pub fn new() -> Self {
        HashAggTable {
            raw: RawTable::new(),
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn find(
        &self,
        hash: u64,
        key_row: &Row,
        num_key_cols: usize,
        eq_fns: &[EqualityFn],
    ) -> Option<usize> {
        self.raw
            .get(hash, |(entry_hash, idx)| {
                *entry_hash == hash
                    && keys_equal(&self.entries[*idx].key_row, key_row, num_key_cols, eq_fns)
            })
            .map(|(_, idx)| *idx)
    }

    pub fn insert(&mut self, hash: u64, entry: HashEntry) -> usize {
        let idx = self.entries.len();
        self.raw.insert(hash, (hash, idx), |(entry_hash, _)| *entry_hash);
        self.entries.push(entry);
        idx
    }

    pub fn reset(&mut self) {
        self.raw.clear();
        self.entries.clear();
    }
}

fn keys_equal(a: &Row, b: &Row, num_key_cols: usize, eq_fns: &[EqualityFn]) -> bool {
    (0..num_key_cols).all(|i| (eq_fns[i])(&a.columns[i], &b.columns[i]))
}

/// Per hashed grouping set state.
#[derive(Debug)]
pub(crate) struct HashGrouping {
    /// Grouping key columns of this set, in input column numbering.
    pub set_cols: Vec<usize>,
    /// Source columns of the compact key tuple: the keys first, then any
    /// extra columns needed for projection.
    pub key_input_cols: Vec<usize>,
    pub num_key_cols: usize,
    /// Largest input column the compact tuple reads.
    pub largest_col: usize,
    pub eq_fns: Vec<EqualityFn>,

    pub arena: Arena,
    pub table: HashAggTable,
    /// Drain cursor over `table.entries`.
    pub iter_pos: usize,

    /// Entry cap from the planner's sizing hint; enforced even when
    /// spilling is disabled.
    pub max_entries: Option<usize>,
    pub hybrid: Option<HybridState>,
}

impl HashGrouping {
    /// Compute the compact key layout for one grouping set.
    ///
    /// `extra_cols` are the columns referenced unaggregated by the target
    /// list or qual; those not already part of the set's keys ride along in
    /// the compact tuple so projection can read them.
    pub fn new(
        node: &AggregateNode,
        set_cols: Vec<usize>,
        extra_cols: &BTreeSet<usize>,
        set_idx: usize,
    ) -> Self {
        let mut key_input_cols = set_cols.clone();
        for &col in extra_cols {
            if !set_cols.contains(&col) {
                key_input_cols.push(col);
            }
        }
        let largest_col = key_input_cols.iter().copied().max().unwrap_or(0);
        let eq_fns = set_cols
            .iter()
            .map(|&c| equality_fn_for(node.input_types[c]))
            .collect();

        HashGrouping {
            num_key_cols: set_cols.len(),
            set_cols,
            key_input_cols,
            largest_col,
            eq_fns,
            arena: Arena::new(format!("hashcontext_{set_idx}")),
            table: HashAggTable::new(),
            iter_pos: 0,
            max_entries: None,
            hybrid: None,
        }
    }

    pub fn hash_input_row(&self, row: &Row) -> Result<(Row, u64)> {
        if row.num_columns() <= self.largest_col {
            return Err(QuernError::internal(format!(
                "input row has {} columns but the hash key reads column {}",
                row.num_columns(),
                self.largest_col
            )));
        }
        let key_row = row.project(&self.key_input_cols)?;
        let hash = hash_scalars(&key_row.columns[..self.num_key_cols]);
        Ok((key_row, hash))
    }

    /// Probe for the group of `row`, creating a fresh entry when absent.
    ///
    /// Returns `Full` instead of inserting when the sized table is at
    /// capacity; the caller either dumps (hybrid) or fails.
    pub fn lookup_or_insert(
        &mut self,
        row: &Row,
        trans_slots: &[TransSlot],
    ) -> Result<LookupOutcome> {
        let (key_row, hash) = self.hash_input_row(row)?;
        self.find_or_insert(hash, key_row, trans_slots)
    }

    pub fn find_or_insert(
        &mut self,
        hash: u64,
        key_row: Row,
        trans_slots: &[TransSlot],
    ) -> Result<LookupOutcome> {
        if let Some(idx) = self
            .table
            .find(hash, &key_row, self.num_key_cols, &self.eq_fns)
        {
            return Ok(LookupOutcome::Found(idx));
        }

        if let Some(max) = self.max_entries {
            if self.table.len() >= max {
                return Ok(LookupOutcome::Full);
            }
        }

        self.arena.charge(key_row.size_bytes());
        let cells: Vec<_> = trans_slots.iter().map(TransSlot::make_cell).collect();
        let idx = self.table.insert(
            hash,
            HashEntry {
                hash,
                key_row,
                cells,
            },
        );
        Ok(LookupOutcome::Inserted(idx))
    }

    /// Take the next entry of the drain scan, consuming it.
    pub fn take_next_entry(&mut self) -> Option<HashEntry> {
        if self.iter_pos >= self.table.entries.len() {
            return None;
        }
        let entry = std::mem::replace(
            &mut self.table.entries[self.iter_pos],
            HashEntry::placeholder(),
        );
        self.iter_pos += 1;
        Some(entry)
    }

    pub fn restart_scan(&mut self) {
        self.iter_pos = 0;
    }

    /// Rebuild a full-width representative row from the compact key tuple;
    /// columns the compact tuple does not carry are null.
    pub fn expand_representative(&self, key_row: &Row, width: usize) -> Row {
        let mut rep = Row::new(vec![ScalarValue::Null; width]);
        for (compact_idx, &input_col) in self.key_input_cols.iter().enumerate() {
            rep.columns[input_col] = key_row.columns[compact_idx].clone();
        }
        rep
    }

    pub fn spilled(&self) -> bool {
        self.hybrid.as_ref().is_some_and(|h| h.spilled)
    }
}

/// Columns referenced unaggregated by the output projection or qual.
pub(crate) fn unaggregated_columns(node: &AggregateNode) -> BTreeSet<usize> {
    let mut cols = BTreeSet::new();
    for output in &node.output {
        if let OutputColumn::GroupColumn(c) = output {
            cols.insert(*c);
        }
    }
    if let Some(qual) = &node.qual {
        let mut referenced = BTreeSet::new();
        qual.referenced_columns(&mut referenced);
        // Qual columns beyond the input width refer to aggregate results.
        cols.extend(referenced.into_iter().filter(|c| *c < node.num_input_columns()));
    }
    cols
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::operators::aggregate::build::InitialValue;
    use crate::functions::aggregate::count::COUNT_STAR;
    use quern_row::datatype::TypeLayout;
    use quern_row::DataType;

    fn count_slot() -> TransSlot {
        TransSlot {
            entry: &COUNT_STAR,
            collation: 0,
            args: vec![],
            filter: None,
            direct_args: vec![],
            num_inputs: 0,
            num_trans_inputs: 0,
            sort_keys: vec![],
            num_distinct_cols: 0,
            eq_fns: vec![],
            initial: InitialValue::Scalar(ScalarValue::Int64(0)),
            state_layout: TypeLayout {
                fixed_len: Some(8),
                by_value: true,
            },
            sorters: vec![None],
        }
    }

    fn grouping() -> HashGrouping {
        let node = AggregateNode::grouped(
            super::super::node::AggStrategy::Hashed,
            vec![DataType::Utf8, DataType::Int64],
            vec![0],
            vec![],
        );
        HashGrouping::new(&node, vec![0], &BTreeSet::new(), 0)
    }

    fn row(key: &str, v: i64) -> Row {
        Row::new(vec![ScalarValue::Utf8(key.to_string()), ScalarValue::Int64(v)])
    }

    #[test]
    fn insert_then_find() {
        let slots = vec![count_slot()];
        let mut grouping = grouping();

        let first = grouping.lookup_or_insert(&row("a", 1), &slots).unwrap();
        assert!(matches!(first, LookupOutcome::Inserted(0)));

        let second = grouping.lookup_or_insert(&row("a", 2), &slots).unwrap();
        assert!(matches!(second, LookupOutcome::Found(0)));

        let third = grouping.lookup_or_insert(&row("b", 3), &slots).unwrap();
        assert!(matches!(third, LookupOutcome::Inserted(1)));
    }

    #[test]
    fn null_keys_share_a_group() {
        let slots = vec![count_slot()];
        let mut grouping = grouping();

        let null_row = Row::new(vec![ScalarValue::Null, ScalarValue::Int64(1)]);
        assert!(matches!(
            grouping.lookup_or_insert(&null_row, &slots).unwrap(),
            LookupOutcome::Inserted(0)
        ));
        assert!(matches!(
            grouping.lookup_or_insert(&null_row, &slots).unwrap(),
            LookupOutcome::Found(0)
        ));
    }

    #[test]
    fn capacity_reports_full() {
        let slots = vec![count_slot()];
        let mut grouping = grouping();
        grouping.max_entries = Some(1);

        assert!(matches!(
            grouping.lookup_or_insert(&row("a", 1), &slots).unwrap(),
            LookupOutcome::Inserted(0)
        ));
        // Existing key still resolves.
        assert!(matches!(
            grouping.lookup_or_insert(&row("a", 2), &slots).unwrap(),
            LookupOutcome::Found(0)
        ));
        // A new key reports Full.
        assert!(matches!(
            grouping.lookup_or_insert(&row("b", 3), &slots).unwrap(),
            LookupOutcome::Full
        ));
    }

    #[test]
    fn representative_expansion() {
        let grouping = grouping();
        let key_row = Row::new(vec![ScalarValue::Utf8("k".to_string())]);
        let rep = grouping.expand_representative(&key_row, 2);
        assert_eq!(
            Row::new(vec![
                ScalarValue::Utf8("k".to_string()),
                ScalarValue::Null
            ]),
            rep
        );
    }
}
