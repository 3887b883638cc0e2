//! Sorted path: one scan per phase produces grouped output for every
//! grouping set of that phase. Equal-key adjacency in the (pre-sorted)
//! input defines group boundaries; `projected_set` walks from the most
//! specific set outward as boundaries cross coarser prefixes.

use quern_error::Result;
use quern_row::{Row, ScalarValue};
use smallvec::SmallVec;

use super::executor::AggregateExecutor;
use super::node::{null_row, AggStrategy};

pub(super) enum SortedStep {
    Row(Row),
    /// Input exhausted and every set projected; the orchestrator decides
    /// whether another phase or the hash drain follows.
    PhaseExhausted,
}

impl AggregateExecutor {
    /// Produce the next sorted-path output row.
    ///
    /// Invariant: `projected_set` is -1 on the initial call of a phase, or
    /// the set index of the group just completed (projected or rejected by
    /// the qual).
    pub(super) fn retrieve_sorted(&mut self) -> Result<SortedStep> {
        loop {
            self.interrupts.check()?;

            let numsets = self.phases[self.current_phase].numsets().max(1);

            // Group boundary: release the finished sets' transition values,
            // running any shutdown hooks aggregates registered.
            self.out_arena.rescan();
            let num_reset = if self.projected_set >= 0 && (self.projected_set as usize) < numsets
            {
                self.projected_set as usize + 1
            } else {
                numsets
            };
            for s in 0..num_reset {
                self.aggcontexts[s].rescan();
            }

            if self.input_done && self.projected_set >= numsets as isize - 1 {
                return Ok(SortedStep::PhaseExhausted);
            }

            // Width of the next coarser set after the one just projected;
            // zero also when no comparison is due.
            let next_set_size = if self.projected_set >= 0
                && (self.projected_set as usize) < numsets - 1
            {
                self.phases[self.current_phase].set_lengths[self.projected_set as usize + 1]
            } else {
                0
            };

            // A boundary for the next coarser set exists when the input is
            // exhausted, or when the previous group's representative and
            // the pending row differ on that set's columns. Empty sets
            // project only once input is exhausted.
            let crossed = self.input_done
                || (self.phases[self.current_phase].strategy != AggStrategy::Plain
                    && self.projected_set != -1
                    && (self.projected_set as usize) < numsets - 1
                    && next_set_size > 0
                    && !self.boundary_columns_match(next_set_size));

            if crossed {
                self.projected_set += 1;
            } else {
                self.projected_set = 0;

                if self.grp_first_row.is_none() {
                    match self.fetch_input_row()? {
                        Some(row) => self.grp_first_row = Some(row),
                        None => {
                            // The phase produced no input at all. Only
                            // grouping sets without key columns still emit
                            // a row.
                            self.input_done = true;
                            let lengths = &self.phases[self.current_phase].set_lengths;
                            while (self.projected_set as usize) < numsets
                                && lengths[self.projected_set as usize] > 0
                            {
                                self.projected_set += 1;
                            }
                            if self.projected_set as usize >= numsets {
                                continue;
                            }
                            self.rep_row = Some(null_row(self.input_types.len()));
                        }
                    }
                }

                self.initialize_aggregates(num_reset)?;

                if let Some(first) = self.grp_first_row.take() {
                    self.rep_row = Some(first.clone());
                    self.scan_group(first)?;
                }
            }

            let current_set = self.projected_set as usize;
            let set_cols: Vec<usize> =
                self.phases[self.current_phase].set_cols(current_set).to_vec();
            let rep = match &self.rep_row {
                Some(rep) => rep.clone(),
                None => null_row(self.input_types.len()),
            };

            let mut cells = std::mem::take(&mut self.pergroup[current_set]);
            let projected =
                self.finalize_and_project(rep, &mut cells, Some(current_set), &set_cols);
            self.pergroup[current_set] = cells;

            if let Some(row) = projected? {
                return Ok(SortedStep::Row(row));
            }
            // Qual rejected this group; keep looking.
        }
    }

    /// Compare the previous group's representative against the pending
    /// first row on the leading `ncols` grouping columns.
    fn boundary_columns_match(&self, ncols: usize) -> bool {
        let (Some(rep), Some(pending)) = (&self.rep_row, &self.grp_first_row) else {
            return true;
        };
        let phase = &self.phases[self.current_phase];
        let null = ScalarValue::Null;
        (0..ncols).all(|i| {
            let col = phase.group_cols[i];
            let a = rep.columns.get(col).unwrap_or(&null);
            let b = pending.columns.get(col).unwrap_or(&null);
            (phase.eq_fns[i])(a, b)
        })
    }

    /// Consume one group's rows: advance every set's transition states per
    /// row until the finest-set boundary or end of input. During phase 1 of
    /// a mixed aggregation each row also feeds the hash tables.
    fn scan_group(&mut self, first: Row) -> Result<()> {
        let numsets = self.phases[self.current_phase].numsets().max(1);
        let ncols = self.phases[self.current_phase].group_cols.len();
        let mixed_fill = self.strategy == AggStrategy::Mixed && self.current_phase == 1;

        let mut current = first;
        loop {
            let hash_entries: SmallVec<[(usize, usize); 4]> = if mixed_fill {
                self.lookup_hash_entries(&current)?
            } else {
                SmallVec::new()
            };

            if self.split.combine {
                self.combine_aggregates_row(&current, numsets, &hash_entries)?;
            } else {
                self.advance_aggregates_row(&current, numsets, &hash_entries)?;
            }
            self.tmp_arena.reset();

            match self.fetch_input_row()? {
                None => {
                    if mixed_fill {
                        self.dump_if_spilled()?;
                    }
                    self.input_done = true;
                    return Ok(());
                }
                Some(next) => {
                    if ncols > 0 && self.finest_boundary(&next) {
                        self.grp_first_row = Some(next);
                        return Ok(());
                    }
                    current = next;
                }
            }
        }
    }

    fn finest_boundary(&self, next: &Row) -> bool {
        let Some(rep) = &self.rep_row else {
            return false;
        };
        let phase = &self.phases[self.current_phase];
        let null = ScalarValue::Null;
        !(0..phase.group_cols.len()).all(|i| {
            let col = phase.group_cols[i];
            let a = rep.columns.get(col).unwrap_or(&null);
            let b = next.columns.get(col).unwrap_or(&null);
            (phase.eq_fns[i])(a, b)
        })
    }
}
