//! The aggregation executor: pulls rows from a child source and produces
//! grouped aggregate results one row at a time.

use std::collections::BTreeSet;

use quern_error::{QuernError, Result};
use quern_row::{DataType, Row, ScalarValue};
use smallvec::SmallVec;
use tracing::trace;

use crate::config::{ExecutionConfig, Interrupts};
use crate::execution::operators::sort::TupleSorter;
use crate::execution::operators::RowSource;
use crate::expr::PhysicalExpr;
use crate::memory::Arena;

use super::build::{build, AggPhase, AggSlot, TransSlot};
use super::hash::{unaggregated_columns, HashGrouping, LookupOutcome};
use super::hybrid::setup_hybrid;
use super::node::{AggSplit, AggStrategy, AggregateNode, OutputColumn};
use super::redistribute::WorkerLink;
use super::sorted::SortedStep;
use super::trans::{
    advance_transition, combine_transition, finalize_aggregate, incoming_partial_state,
    process_ordered,
};
use crate::functions::aggregate::AggregateCatalog;

/// Orchestrator states. `next_row` keeps returning Ok(None) once `Done` is
/// reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecState {
    Init,
    FillHash,
    DrainHash,
    RetrieveSorted,
    PhaseSwitch,
    Done,
}

pub struct AggregateExecutor {
    pub(super) strategy: AggStrategy,
    pub(super) split: AggSplit,
    pub(super) input_types: Vec<DataType>,
    pub(super) output: Vec<OutputColumn>,
    pub(super) qual: Option<PhysicalExpr>,

    pub(super) phases: Vec<AggPhase>,
    pub(super) trans_slots: Vec<TransSlot>,
    pub(super) agg_slots: Vec<AggSlot>,
    /// Maps each aggregate call in the target list to its (possibly shared)
    /// final slot.
    pub(super) agg_for_call: Vec<usize>,
    pub(super) all_grouped_cols: BTreeSet<usize>,

    state: ExecState,
    pub(super) current_phase: usize,
    pub(super) projected_set: isize,
    pub(super) input_done: bool,
    pub(super) grp_first_row: Option<Row>,
    /// Representative first tuple of the group currently being projected.
    pub(super) rep_row: Option<Row>,

    /// Transition cells per grouping set per transition slot.
    pub(super) pergroup: Vec<Vec<super::build::GroupCell>>,
    /// One arena per grouping set, rescanned at group boundaries.
    pub(super) aggcontexts: Vec<Arena>,
    /// Per input tuple scratch, reset after every row.
    pub(super) tmp_arena: Arena,
    /// Per output tuple results, reset before each projection.
    pub(super) out_arena: Arena,

    pub(super) sort_in: Option<TupleSorter>,
    pub(super) sort_out: Option<TupleSorter>,

    pub(super) hash_groupings: Vec<HashGrouping>,
    current_hash: usize,

    child: Box<dyn RowSource>,
    pub(super) config: ExecutionConfig,
    pub(super) interrupts: Interrupts,
    worker: Option<WorkerLink>,
}

impl std::fmt::Debug for AggregateExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateExecutor")
            .field("strategy", &self.strategy)
            .field("state", &self.state)
            .field("current_phase", &self.current_phase)
            .field("num_trans", &self.trans_slots.len())
            .field("num_aggs", &self.agg_slots.len())
            .finish_non_exhaustive()
    }
}

impl AggregateExecutor {
    pub fn try_new(
        node: AggregateNode,
        child: Box<dyn RowSource>,
        config: ExecutionConfig,
    ) -> Result<Self> {
        Self::try_new_with(
            node,
            child,
            config,
            &AggregateCatalog::new(),
            Interrupts::new(),
            None,
        )
    }

    pub fn try_new_with(
        node: AggregateNode,
        child: Box<dyn RowSource>,
        config: ExecutionConfig,
        catalog: &AggregateCatalog,
        interrupts: Interrupts,
        worker: Option<WorkerLink>,
    ) -> Result<Self> {
        let built = build(&node, catalog)?;

        let extra_cols = unaggregated_columns(&node);
        let mut hash_groupings = Vec::with_capacity(built.hashed_sets.len());
        for (idx, set) in built.hashed_sets.iter().enumerate() {
            let mut grouping = HashGrouping::new(&node, set.clone(), &extra_cols, idx);
            if let Some(hint) = &node.hybrid {
                setup_hybrid(&mut grouping, hint, &config)?;
            }
            hash_groupings.push(grouping);
        }

        if worker.is_some()
            && (node.strategy != AggStrategy::Hashed || hash_groupings.is_empty())
        {
            return Err(QuernError::PlannerContract(
                "parallel redistribution requires a hashed plan with grouping columns".to_string(),
            ));
        }

        let pergroup = (0..built.maxsets)
            .map(|_| built.trans_slots.iter().map(TransSlot::make_cell).collect())
            .collect();
        let aggcontexts = (0..built.maxsets)
            .map(|s| Arena::new(format!("aggcontext_{s}")))
            .collect();

        Ok(AggregateExecutor {
            strategy: node.strategy,
            split: node.split,
            input_types: node.input_types,
            output: node.output,
            qual: node.qual,
            phases: built.phases,
            trans_slots: built.trans_slots,
            agg_slots: built.agg_slots,
            agg_for_call: built.agg_for_call,
            all_grouped_cols: built.all_grouped_cols,
            state: ExecState::Init,
            current_phase: 0,
            projected_set: -1,
            input_done: false,
            grp_first_row: None,
            rep_row: None,
            pergroup,
            aggcontexts,
            tmp_arena: Arena::new("tmpcontext"),
            out_arena: Arena::new("output_context"),
            sort_in: None,
            sort_out: None,
            hash_groupings,
            current_hash: 0,
            child,
            config,
            interrupts,
            worker,
        })
    }

    /// Number of distinct transition pipelines after de-duplication.
    pub fn num_trans_slots(&self) -> usize {
        self.trans_slots.len()
    }

    /// Number of distinct final pipelines after de-duplication.
    pub fn num_agg_slots(&self) -> usize {
        self.agg_slots.len()
    }

    /// Types of the projected output columns.
    pub fn output_types(&self) -> Vec<DataType> {
        self.output
            .iter()
            .map(|column| match column {
                OutputColumn::GroupColumn(c) => self.input_types[*c],
                OutputColumn::AggregateResult(i) => {
                    self.agg_slots[self.agg_for_call[*i]].result_type
                }
            })
            .collect()
    }

    /// Produce the next output row, or None at end of stream. Idempotent
    /// once the stream is exhausted.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        loop {
            match self.state {
                ExecState::Init => {
                    self.state = match self.strategy {
                        AggStrategy::Hashed => ExecState::FillHash,
                        _ => {
                            self.initialize_phase(1)?;
                            ExecState::RetrieveSorted
                        }
                    };
                }
                ExecState::FillHash => {
                    self.fill_hash_tables()?;
                    self.state = ExecState::DrainHash;
                }
                ExecState::DrainHash => match self.retrieve_hash()? {
                    Some(row) => return Ok(Some(row)),
                    None => self.state = ExecState::Done,
                },
                ExecState::RetrieveSorted => match self.retrieve_sorted()? {
                    SortedStep::Row(row) => return Ok(Some(row)),
                    SortedStep::PhaseExhausted => self.state = ExecState::PhaseSwitch,
                },
                ExecState::PhaseSwitch => {
                    if self.current_phase + 1 < self.phases.len() {
                        trace!(
                            next_phase = self.current_phase + 1,
                            "switching to next sorted phase"
                        );
                        self.initialize_phase(self.current_phase + 1)?;
                        self.input_done = false;
                        self.projected_set = -1;
                        self.grp_first_row = None;
                        self.rep_row = None;
                        self.state = ExecState::RetrieveSorted;
                    } else if self.strategy == AggStrategy::Mixed {
                        // Sorted phases are done; the hash tables were
                        // filled during phase 1.
                        self.initialize_phase(0)?;
                        for grouping in &mut self.hash_groupings {
                            grouping.restart_scan();
                        }
                        self.state = ExecState::DrainHash;
                    } else {
                        self.state = ExecState::Done;
                    }
                }
                ExecState::Done => return Ok(None),
            }
        }
    }

    /// Switch to a phase. The previous phase's output sorter, if any,
    /// becomes this phase's input and is finalized before reading.
    pub(super) fn initialize_phase(&mut self, newphase: usize) -> Result<()> {
        if newphase == 0 {
            self.current_phase = 0;
            return Ok(());
        }

        self.sort_in = None;
        if let Some(mut sorter) = self.sort_out.take() {
            // Phase 1 reads the child directly; later phases read the
            // re-sorted output of their predecessor.
            if newphase > 1 {
                sorter.finalize();
                self.sort_in = Some(sorter);
            }
        }

        if newphase + 1 < self.phases.len() {
            self.sort_out = Some(TupleSorter::new(
                self.phases[newphase + 1].sort_requirement.clone(),
            ));
        }

        self.current_phase = newphase;
        Ok(())
    }

    /// Fetch the next input row of the current phase, copying it into the
    /// next phase's sorter when one is being built.
    pub(super) fn fetch_input_row(&mut self) -> Result<Option<Row>> {
        self.interrupts.check()?;
        let row = match &mut self.sort_in {
            Some(sorter) => sorter.get()?,
            None => self.child.next()?,
        };
        if let (Some(row), Some(out)) = (&row, &mut self.sort_out) {
            out.put(row.clone())?;
        }
        Ok(row)
    }

    /// Reset transition cells (and per-aggregate sorters) for the first
    /// `num_reset` grouping sets of the current phase.
    pub(super) fn initialize_aggregates(&mut self, num_reset: usize) -> Result<()> {
        for s in 0..num_reset {
            for t in 0..self.trans_slots.len() {
                self.pergroup[s][t] = self.trans_slots[t].make_cell();
            }
        }
        if !self.split.combine {
            for t in 0..self.trans_slots.len() {
                if self.trans_slots[t].is_ordered_input() {
                    for s in 0..num_reset {
                        let sorter = self.trans_slots[t].new_sorter();
                        self.trans_slots[t].sorters[s] = Some(sorter);
                    }
                }
            }
        }
        Ok(())
    }

    /// Advance every transition pipeline with one input row, across the
    /// first `num_sorted_sets` grouping sets and any hash entries located
    /// for this row.
    pub(super) fn advance_aggregates_row(
        &mut self,
        row: &Row,
        num_sorted_sets: usize,
        hash_entries: &[(usize, usize)],
    ) -> Result<()> {
        for t in 0..self.trans_slots.len() {
            if let Some(filter) = &self.trans_slots[t].filter {
                if !filter.eval_filter(row)? {
                    continue;
                }
            }

            let mut args: SmallVec<[ScalarValue; 4]> =
                SmallVec::with_capacity(self.trans_slots[t].args.len());
            for expr in &self.trans_slots[t].args {
                args.push(expr.eval(row)?);
            }
            for value in &args {
                self.tmp_arena.charge(value.size_bytes());
            }

            if self.trans_slots[t].is_ordered_input() && !self.split.combine {
                let slot = &mut self.trans_slots[t];
                if slot.entry.transition_strict
                    && args[..slot.num_trans_inputs].iter().any(ScalarValue::is_null)
                {
                    continue;
                }
                for s in 0..num_sorted_sets {
                    let sorter = slot.sorters[s].as_mut().ok_or_else(|| {
                        QuernError::internal("ordered aggregate sorter missing at group scan")
                    })?;
                    match sorter {
                        super::build::AggSorter::Datum(sorter) => {
                            sorter.put(args[0].clone())?;
                        }
                        super::build::AggSorter::Tuple(sorter) => {
                            sorter.put(Row::new(args.to_vec()))?;
                        }
                    }
                }
            } else {
                for s in 0..num_sorted_sets {
                    advance_transition(
                        &self.trans_slots[t],
                        t,
                        &mut self.pergroup[s][t],
                        &mut self.aggcontexts[s],
                        &args,
                    )?;
                }
                for &(g, e) in hash_entries {
                    let grouping = &mut self.hash_groupings[g];
                    advance_transition(
                        &self.trans_slots[t],
                        t,
                        &mut grouping.table.entries[e].cells[t],
                        &mut grouping.arena,
                        &args,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Merge partial transition states carried by one input row of a
    /// combining node.
    pub(super) fn combine_aggregates_row(
        &mut self,
        row: &Row,
        num_sorted_sets: usize,
        hash_entries: &[(usize, usize)],
    ) -> Result<()> {
        for t in 0..self.trans_slots.len() {
            for s in 0..num_sorted_sets {
                let raw = self.trans_slots[t].args[0].eval(row)?;
                let incoming = incoming_partial_state(
                    &self.trans_slots[t],
                    t,
                    &mut self.aggcontexts[s],
                    self.split,
                    &raw,
                )?;
                combine_transition(
                    &self.trans_slots[t],
                    t,
                    &mut self.pergroup[s][t],
                    &mut self.aggcontexts[s],
                    incoming,
                )?;
            }
            for &(g, e) in hash_entries {
                let raw = self.trans_slots[t].args[0].eval(row)?;
                let grouping = &mut self.hash_groupings[g];
                let incoming = incoming_partial_state(
                    &self.trans_slots[t],
                    t,
                    &mut grouping.arena,
                    self.split,
                    &raw,
                )?;
                combine_transition(
                    &self.trans_slots[t],
                    t,
                    &mut grouping.table.entries[e].cells[t],
                    &mut grouping.arena,
                    incoming,
                )?;
            }
        }
        Ok(())
    }

    /// Locate or create the group of `row` in every hashed grouping set,
    /// dumping to spill files and retrying when a sized table is full.
    pub(super) fn lookup_hash_entries(
        &mut self,
        row: &Row,
    ) -> Result<SmallVec<[(usize, usize); 4]>> {
        let mut entries = SmallVec::new();
        for g in 0..self.hash_groupings.len() {
            loop {
                match self.hash_groupings[g].lookup_or_insert(row, &self.trans_slots)? {
                    LookupOutcome::Found(idx) | LookupOutcome::Inserted(idx) => {
                        entries.push((g, idx));
                        break;
                    }
                    LookupOutcome::Full => {
                        if self.hash_groupings[g].hybrid.is_some() {
                            let debug_log = self.config.hybrid_hash_agg_debug;
                            self.hash_groupings[g].dump(&self.trans_slots, debug_log)?;
                            // The table is empty now; the retry succeeds.
                        } else {
                            return Err(QuernError::internal(
                                "hash table exceeded its sized capacity with hybrid hash \
                                 aggregation disabled",
                            ));
                        }
                    }
                }
            }
        }
        Ok(entries)
    }

    /// Dump in-memory remainders of tables that have spilled, so the reload
    /// loop sees a complete partitioning.
    pub(super) fn dump_if_spilled(&mut self) -> Result<()> {
        let debug_log = self.config.hybrid_hash_agg_debug;
        for g in 0..self.hash_groupings.len() {
            if self.hash_groupings[g].spilled() {
                self.hash_groupings[g].dump(&self.trans_slots, debug_log)?;
            }
        }
        Ok(())
    }

    /// Read the child to exhaustion, building every hash table. With a
    /// worker link, rows are first redistributed by the hash of the first
    /// grouping key; peer rows are consumed after local input ends.
    fn fill_hash_tables(&mut self) -> Result<()> {
        if let Some(worker) = &mut self.worker {
            let key_col = self.hash_groupings[0].set_cols[0];
            worker.bind_key(key_col, self.input_types[key_col]);
        }

        loop {
            let Some(row) = self.fetch_input_row()? else {
                break;
            };
            if let Some(worker) = &self.worker {
                if !worker.route(&row)? {
                    // The row belongs to a peer.
                    continue;
                }
            }
            self.process_hash_input(&row)?;
        }

        if self.worker.is_some() {
            if let Some(worker) = &mut self.worker {
                worker.finish_produce()?;
            }
            loop {
                let row = match &mut self.worker {
                    Some(worker) => worker.consume_next()?,
                    None => None,
                };
                let Some(row) = row else { break };
                self.process_hash_input(&row)?;
            }
            if let Some(worker) = &mut self.worker {
                worker.finish_consume()?;
            }
        }

        self.dump_if_spilled()?;
        for grouping in &mut self.hash_groupings {
            grouping.restart_scan();
        }
        Ok(())
    }

    fn process_hash_input(&mut self, row: &Row) -> Result<()> {
        let entries = self.lookup_hash_entries(row)?;
        if self.split.combine {
            self.combine_aggregates_row(row, 0, &entries)?;
        } else {
            self.advance_aggregates_row(row, 0, &entries)?;
        }
        self.tmp_arena.reset();
        Ok(())
    }

    /// Walk the hash tables in declared order, finalizing and projecting
    /// one group per call. Reloads spilled batches as tables drain.
    fn retrieve_hash(&mut self) -> Result<Option<Row>> {
        loop {
            self.interrupts.check()?;
            if self.current_hash >= self.hash_groupings.len() {
                return Ok(None);
            }

            let g = self.current_hash;
            let Some(entry) = self.hash_groupings[g].take_next_entry() else {
                if self.hash_groupings[g].spilled() && !self.hash_groupings[g].spill_drained() {
                    let debug_log = self.config.hybrid_hash_agg_debug;
                    let loaded = {
                        let (groupings, slots) = (&mut self.hash_groupings, &self.trans_slots);
                        groupings[g].reload_next_batch(slots, &self.interrupts, debug_log)?
                    };
                    if loaded {
                        continue;
                    }
                }
                self.current_hash += 1;
                continue;
            };

            let width = self.input_types.len();
            let rep = self.hash_groupings[g].expand_representative(&entry.key_row, width);
            let set_cols = self.hash_groupings[g].set_cols.clone();
            let mut cells = entry.cells;

            // Plain reset: shutdown hooks must not run while other groups
            // of this table are still pending.
            self.out_arena.reset();

            if let Some(row) = self.finalize_and_project(rep, &mut cells, None, &set_cols)? {
                return Ok(Some(row));
            }
        }
    }

    /// Finalize every aggregate for one group and project the output row.
    /// Returns None when the qual rejects the group.
    pub(super) fn finalize_and_project(
        &mut self,
        rep: Row,
        cells: &mut [super::build::GroupCell],
        sorted_set: Option<usize>,
        set_cols: &[usize],
    ) -> Result<Option<Row>> {
        if let Some(s) = sorted_set {
            if !self.split.combine {
                for t in 0..self.trans_slots.len() {
                    if !self.trans_slots[t].is_ordered_input() {
                        continue;
                    }
                    process_ordered(
                        &mut self.trans_slots[t],
                        s,
                        t,
                        &mut cells[t],
                        &mut self.aggcontexts[s],
                        &self.interrupts,
                    )?;
                }
            }
        }

        // Finalize each distinct final pipeline once; calls sharing a slot
        // reuse the value.
        let mut slot_results: Vec<Option<ScalarValue>> = Vec::new();
        slot_results.resize(self.agg_slots.len(), None);
        for (idx, agg) in self.agg_slots.iter().enumerate() {
            let slot = &self.trans_slots[agg.trans_idx];
            let value = finalize_aggregate(
                slot,
                agg,
                &cells[agg.trans_idx],
                &rep,
                self.split,
                &mut self.out_arena,
            )?;
            slot_results[idx] = Some(value);
        }

        // Build the eval row: the representative with grouping columns not
        // in the current set nulled, then one result column per call.
        let mut eval = rep;
        for &col in &self.all_grouped_cols {
            if !set_cols.contains(&col) {
                eval.columns[col] = ScalarValue::Null;
            }
        }
        let width = self.input_types.len();
        for &slot_idx in &self.agg_for_call {
            let value = slot_results[slot_idx]
                .clone()
                .ok_or_else(|| QuernError::internal("aggregate slot not finalized"))?;
            eval.columns.push(value);
        }

        if let Some(qual) = &self.qual {
            if !qual.eval_filter(&eval)? {
                return Ok(None);
            }
        }

        let out = self
            .output
            .iter()
            .map(|column| match column {
                OutputColumn::GroupColumn(c) => eval.column(*c).cloned(),
                OutputColumn::AggregateResult(i) => eval.column(width + *i).cloned(),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(Row::new(out)))
    }
}
