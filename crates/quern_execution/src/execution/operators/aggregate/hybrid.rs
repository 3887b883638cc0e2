//! Hybrid hash aggregation: when a sized hash table fills up, its entries
//! are partitioned by hash into batch files on disk, the table is reset,
//! and aggregation continues. Draining re-reads one batch at a time,
//! merging duplicate keys through the combine function; a batch that still
//! does not fit re-partitions recursively into a child spill set with one
//! more batch file (finer partitioning).

use quern_error::{QuernError, Result};
use quern_row::{Row, ScalarValue};
use tracing::debug;

use crate::config::{ExecutionConfig, Interrupts};
use crate::functions::aggregate::{AggContext, StateType, StateValue};
use crate::io::SpoolFile;

use super::build::{GroupCell, TransSlot};
use super::hash::{HashEntry, HashGrouping};
use super::node::HybridHint;
use super::trans::combine_transition;

/// Bytes of the fixed per-transition record section: one flag byte plus the
/// inline value image.
const CELL_DISK_LEN: usize = 9;

const FLAG_NULL: u8 = 0x01;
const FLAG_UNSEEDED: u8 = 0x02;

#[derive(Debug)]
pub(crate) struct HybridState {
    /// Batch count used for the root spill set.
    pub nbatches: usize,
    pub entry_size: usize,
    pub spilled: bool,
    /// Active chain of spill sets; the last element is the one being
    /// written to (fill) or drained (reload). Descending into a child set
    /// pushes, finishing a set pops.
    pub stack: Vec<SpillSet>,
}

#[derive(Debug)]
pub(crate) struct SpillSet {
    pub level: u32,
    pub nbatches: usize,
    /// Next batch slot to reload.
    pub current: usize,
    pub batches: Vec<Option<SpillBatch>>,
}

impl SpillSet {
    fn new(level: u32, nbatches: usize) -> Self {
        SpillSet {
            level,
            nbatches,
            current: 0,
            batches: (0..nbatches).map(|_| None).collect(),
        }
    }

    fn write_record(
        &mut self,
        hash: u64,
        key_row: &Row,
        cells: &[GroupCell],
        trans_slots: &[TransSlot],
    ) -> Result<()> {
        let batch_idx = (hash as u32 as usize) % self.nbatches;
        let batch = match &mut self.batches[batch_idx] {
            Some(batch) => batch,
            slot @ None => slot.insert(SpillBatch {
                file: SpoolFile::create()?,
                child: None,
            }),
        };
        write_record(&mut batch.file, hash, key_row, cells, trans_slots)
    }
}

#[derive(Debug)]
pub(crate) struct SpillBatch {
    pub file: SpoolFile,
    pub child: Option<SpillSet>,
}

pub(crate) struct SpillRecord {
    pub hash: u64,
    pub key_row: Row,
    pub cells: Vec<GroupCell>,
}

/// Size the table and attach hybrid state when the config allows spilling.
///
/// The entry cap applies whenever the planner provided sizing, so a table
/// with spilling disabled fails loudly instead of exceeding its budget.
pub(crate) fn setup_hybrid(
    grouping: &mut HashGrouping,
    hint: &HybridHint,
    config: &ExecutionConfig,
) -> Result<()> {
    if hint.entry_size == 0 {
        return Err(QuernError::PlannerContract(
            "hybrid sizing hint with a zero entry size".to_string(),
        ));
    }

    let max_entries = (config.work_mem / hint.entry_size).max(1);
    grouping.max_entries = Some(max_entries);

    if config.enable_hybrid_hash_agg {
        let nbatches = config.default_hashagg_nbatches.max(1);
        grouping.hybrid = Some(HybridState {
            nbatches,
            entry_size: hint.entry_size,
            spilled: false,
            stack: Vec::new(),
        });
        if config.hybrid_hash_agg_debug {
            debug!(
                max_entries,
                nbatches,
                entry_size = hint.entry_size,
                estimated_groups = hint.num_groups,
                "sized hybrid hash table"
            );
        }
    }

    Ok(())
}

impl HashGrouping {
    /// Write every in-memory entry to the current spill set's batch files,
    /// then reset the table and its arena. Called when an insert finds the
    /// table full, and once more when input ends with spilled data.
    pub(crate) fn dump(&mut self, trans_slots: &[TransSlot], debug_log: bool) -> Result<()> {
        let hybrid = self
            .hybrid
            .as_mut()
            .ok_or_else(|| QuernError::internal("dump without hybrid state"))?;

        if !hybrid.spilled {
            hybrid.spilled = true;
            hybrid.stack.push(SpillSet::new(0, hybrid.nbatches));
            if debug_log {
                debug!(
                    level = 0,
                    nbatches = hybrid.nbatches,
                    entry_size = hybrid.entry_size,
                    "hash table spilled, created root spill set"
                );
            }
        }
        if hybrid.stack.len() != 1 {
            return Err(QuernError::internal(
                "dump is only valid while filling the root spill set",
            ));
        }
        let set = hybrid
            .stack
            .last_mut()
            .expect("root spill set pushed above");

        let mut dumped = 0usize;
        for entry in &self.table.entries {
            set.write_record(entry.hash, &entry.key_row, &entry.cells, trans_slots)?;
            dumped += 1;
        }

        self.table.reset();
        self.arena.reset();
        self.iter_pos = 0;

        if debug_log {
            debug!(dumped, "dumped hash table entries to spill files");
        }
        Ok(())
    }

    /// True once every batch at every recursion level has been reloaded.
    pub(crate) fn spill_drained(&self) -> bool {
        match &self.hybrid {
            Some(h) => {
                !h.spilled
                    || h.stack
                        .iter()
                        .all(|set| set.current >= set.batches.len())
            }
            None => true,
        }
    }

    /// Reload the next non-empty batch file into the (reset) table.
    ///
    /// Returns false when the whole spill set tree is exhausted. Keys seen
    /// twice in a batch merge through the combine function; if the table
    /// overflows mid-reload the remaining records re-partition into a child
    /// spill set with one extra batch.
    pub(crate) fn reload_next_batch(
        &mut self,
        trans_slots: &[TransSlot],
        interrupts: &Interrupts,
        debug_log: bool,
    ) -> Result<bool> {
        loop {
            interrupts.check()?;

            let (batch, parent_level, parent_nbatches) = {
                let hybrid = self
                    .hybrid
                    .as_mut()
                    .ok_or_else(|| QuernError::internal("reload without hybrid state"))?;
                let Some(set) = hybrid.stack.last_mut() else {
                    return Ok(false);
                };
                if set.current >= set.batches.len() {
                    // This set is finished; ascend to its parent.
                    hybrid.stack.pop();
                    continue;
                }
                let idx = set.current;
                set.current += 1;
                (set.batches[idx].take(), set.level, set.nbatches)
            };

            let Some(mut batch) = batch else {
                continue;
            };

            self.table.reset();
            self.arena.reset();
            batch.file.rewind()?;

            loop {
                interrupts.check()?;
                let Some(record) = read_record(&mut batch.file, trans_slots, &mut self.arena)?
                else {
                    break;
                };
                batch.file.note_record_read();

                let SpillRecord {
                    hash,
                    key_row,
                    cells,
                } = record;

                match self.table.find(hash, &key_row, self.num_key_cols, &self.eq_fns) {
                    Some(idx) => {
                        for (trans_idx, (slot, incoming)) in
                            trans_slots.iter().zip(cells.into_iter()).enumerate()
                        {
                            let incoming = if incoming.is_null {
                                StateValue::null()
                            } else {
                                incoming.value
                            };
                            let cell = &mut self.table.entries[idx].cells[trans_idx];
                            combine_transition(slot, trans_idx, cell, &mut self.arena, incoming)?;
                        }
                    }
                    None => {
                        let at_capacity = self
                            .max_entries
                            .is_some_and(|max| self.table.len() >= max);
                        if at_capacity {
                            let child = match &mut batch.child {
                                Some(child) => child,
                                slot @ None => {
                                    if debug_log {
                                        debug!(
                                            level = parent_level + 1,
                                            nbatches = parent_nbatches + 1,
                                            "batch overflowed during reload, created child spill set"
                                        );
                                    }
                                    slot.insert(SpillSet::new(
                                        parent_level + 1,
                                        parent_nbatches + 1,
                                    ))
                                }
                            };
                            child.write_record(hash, &key_row, &cells, trans_slots)?;
                        } else {
                            self.arena.charge(
                                key_row.size_bytes()
                                    + cells.iter().map(|c| c.value.size_bytes()).sum::<usize>(),
                            );
                            self.table.insert(
                                hash,
                                HashEntry {
                                    hash,
                                    key_row,
                                    cells,
                                },
                            );
                        }
                    }
                }
            }

            if batch.file.records_read() != batch.file.records_written() {
                return Err(QuernError::SpillCorruption(format!(
                    "spill batch read {} records but {} were written",
                    batch.file.records_read(),
                    batch.file.records_written()
                )));
            }

            // Descend into the child set once this batch's remainder has
            // been routed there.
            if let Some(child) = batch.child.take() {
                let hybrid = self.hybrid.as_mut().expect("hybrid state checked above");
                hybrid.stack.push(child);
            }

            self.restart_scan();
            if debug_log {
                debug!(
                    loaded = self.table.len(),
                    level = parent_level,
                    "reloaded spill batch"
                );
            }
            return Ok(true);
        }
    }
}

/// On-disk record layout:
///
/// ```text
/// u32  hash
/// u64  total_size                   (bytes after this field)
/// u8[] key tuple                    (self-describing row encoding)
/// u8[] per-trans cells              (numtrans x 9: flags + inline value)
/// u8[] by-ref payload               (in slot order; by-ref scalar states
///                                    and serialized internal states)
/// ```
pub(crate) fn write_record(
    file: &mut SpoolFile,
    hash: u64,
    key_row: &Row,
    cells: &[GroupCell],
    trans_slots: &[TransSlot],
) -> Result<()> {
    let mut tuple_bytes = Vec::new();
    key_row.encode_into(&mut tuple_bytes);

    let mut cell_bytes = Vec::with_capacity(cells.len() * CELL_DISK_LEN);
    let mut payload = Vec::new();

    for (slot, cell) in trans_slots.iter().zip(cells) {
        let mut flags = 0u8;
        if cell.is_null {
            flags |= FLAG_NULL;
        }
        if cell.unseeded {
            flags |= FLAG_UNSEEDED;
        }
        cell_bytes.push(flags);

        let mut inline = [0u8; 8];
        if !cell.is_null {
            match (&slot.entry.state_type, &cell.value) {
                (StateType::Internal, value) => {
                    let serialize = slot.entry.serialize.ok_or_else(|| {
                        QuernError::PlannerContract(format!(
                            "cannot spill {}: internal state without a serialize function",
                            slot.entry.name
                        ))
                    })?;
                    let bytes = (serialize)(value)?;
                    payload.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                    payload.extend_from_slice(&bytes);
                }
                (StateType::Typed(_), value) => {
                    let scalar = value.try_as_scalar()?;
                    if slot.state_layout.by_value {
                        inline = inline_value(scalar)?;
                    } else {
                        scalar.encode_into(&mut payload);
                    }
                }
            }
        }
        cell_bytes.extend_from_slice(&inline);
    }

    let total_size = (tuple_bytes.len() + cell_bytes.len() + payload.len()) as u64;

    file.write_all(&(hash as u32).to_le_bytes())?;
    file.write_all(&total_size.to_le_bytes())?;
    file.write_all(&tuple_bytes)?;
    file.write_all(&cell_bytes)?;
    file.write_all(&payload)?;
    file.note_record_written();
    Ok(())
}

/// Read one record, or None at a clean end of file.
pub(crate) fn read_record(
    file: &mut SpoolFile,
    trans_slots: &[TransSlot],
    arena: &mut crate::memory::Arena,
) -> Result<Option<SpillRecord>> {
    let mut hash_bytes = [0u8; 4];
    if !file.read_exact_or_eof(&mut hash_bytes)? {
        return Ok(None);
    }
    let hash = u32::from_le_bytes(hash_bytes) as u64;

    let mut size_bytes = [0u8; 8];
    file.read_exact(&mut size_bytes)?;
    let total_size = u64::from_le_bytes(size_bytes) as usize;

    let mut buf = vec![0u8; total_size];
    file.read_exact(&mut buf)?;

    let (key_row, mut offset) = Row::decode_from(&buf)?;

    let cells_start = offset;
    offset += trans_slots.len() * CELL_DISK_LEN;
    if offset > buf.len() {
        return Err(QuernError::SpillCorruption(
            "spill record too short for its transition cells".to_string(),
        ));
    }

    let mut cells = Vec::with_capacity(trans_slots.len());
    for (idx, slot) in trans_slots.iter().enumerate() {
        let cell_off = cells_start + idx * CELL_DISK_LEN;
        let flags = buf[cell_off];
        let inline: [u8; 8] = buf[cell_off + 1..cell_off + CELL_DISK_LEN]
            .try_into()
            .expect("slice of fixed width");

        let is_null = flags & FLAG_NULL != 0;
        let unseeded = flags & FLAG_UNSEEDED != 0;

        let value = if is_null {
            StateValue::null()
        } else {
            match slot.entry.state_type {
                StateType::Internal => {
                    let len_bytes = buf.get(offset..offset + 4).ok_or_else(|| {
                        QuernError::SpillCorruption("truncated internal state length".to_string())
                    })?;
                    let len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
                    offset += 4;
                    let bytes = buf.get(offset..offset + len).ok_or_else(|| {
                        QuernError::SpillCorruption("truncated internal state bytes".to_string())
                    })?;
                    offset += len;
                    let deserialize = slot.entry.deserialize.ok_or_else(|| {
                        QuernError::PlannerContract(format!(
                            "cannot reload {}: internal state without a deserialize function",
                            slot.entry.name
                        ))
                    })?;
                    let mut ctx = AggContext {
                        arena: &mut *arena,
                        trans_idx: idx,
                    };
                    (deserialize)(&mut ctx, bytes)?
                }
                StateType::Typed(datatype) => {
                    if slot.state_layout.by_value {
                        StateValue::Scalar(from_inline_value(datatype, &inline)?)
                    } else {
                        let (value, used) = ScalarValue::decode_from(&buf[offset..])?;
                        offset += used;
                        StateValue::Scalar(value)
                    }
                }
            }
        };

        cells.push(GroupCell {
            value,
            is_null,
            unseeded,
        });
    }

    if offset != buf.len() {
        return Err(QuernError::SpillCorruption(format!(
            "spill record decoded {offset} of {} bytes",
            buf.len()
        )));
    }

    Ok(Some(SpillRecord {
        hash,
        key_row,
        cells,
    }))
}

fn inline_value(value: &ScalarValue) -> Result<[u8; 8]> {
    let mut inline = [0u8; 8];
    match value {
        ScalarValue::Boolean(v) => inline[0] = *v as u8,
        ScalarValue::Int32(v) => inline[..4].copy_from_slice(&v.to_le_bytes()),
        ScalarValue::Int64(v) => inline.copy_from_slice(&v.to_le_bytes()),
        ScalarValue::Float64(v) => inline.copy_from_slice(&v.to_le_bytes()),
        other => {
            return Err(QuernError::internal(format!(
                "value of type {} is not by-value",
                other.datatype()
            )))
        }
    }
    Ok(inline)
}

fn from_inline_value(datatype: quern_row::DataType, inline: &[u8; 8]) -> Result<ScalarValue> {
    use quern_row::DataType;
    Ok(match datatype {
        DataType::Boolean => ScalarValue::Boolean(inline[0] != 0),
        DataType::Int32 => ScalarValue::Int32(i32::from_le_bytes(inline[..4].try_into().unwrap())),
        DataType::Int64 => ScalarValue::Int64(i64::from_le_bytes(*inline)),
        DataType::Float64 => ScalarValue::Float64(f64::from_le_bytes(*inline)),
        other => {
            return Err(QuernError::SpillCorruption(format!(
                "inline value of non-by-value type {other}"
            )))
        }
    })
}
