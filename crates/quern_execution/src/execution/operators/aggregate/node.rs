//! Plan-node surface consumed by the aggregate operator.

use quern_row::sort::SortKey;
use quern_row::{DataType, ScalarValue};

use crate::expr::PhysicalExpr;

/// Grouping strategy for the whole plan node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggStrategy {
    /// One group over the entire input.
    Plain,
    /// Input arrives sorted on the grouping columns; equal-key adjacency
    /// defines groups.
    Sorted,
    /// Groups located through hash tables.
    Hashed,
    /// Hash tables are populated while the first sorted pass runs, then
    /// drained once the sorted phases finish.
    Mixed,
}

/// Partial-aggregation split mode flags for the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AggSplit {
    /// Inputs are partial transition states to merge via combine functions.
    pub combine: bool,
    /// Incoming states were serialized and must be deserialized first.
    pub deserialize: bool,
    /// Skip final functions; emit the transition state instead.
    pub skip_final: bool,
    /// Serialize emitted states (only meaningful with `skip_final`).
    pub serialize: bool,
}

impl AggSplit {
    /// Ordinary single-node aggregation.
    pub const SIMPLE: AggSplit = AggSplit {
        combine: false,
        deserialize: false,
        skip_final: false,
        serialize: false,
    };

    /// First stage of a split aggregation: emit serialized partial states.
    pub const INITIAL_SERIAL: AggSplit = AggSplit {
        combine: false,
        deserialize: false,
        skip_final: true,
        serialize: true,
    };

    /// Last stage of a split aggregation: combine deserialized partials and
    /// run final functions.
    pub const FINAL_DESERIAL: AggSplit = AggSplit {
        combine: true,
        deserialize: true,
        skip_final: false,
        serialize: false,
    };
}

/// One aggregate call in the target list.
#[derive(Debug, Clone)]
pub struct AggregateCall {
    /// Aggregate identifier resolved through the catalog.
    pub function: String,

    /// Argument expressions, including any sort-only columns appended after
    /// the transition inputs.
    pub args: Vec<PhysicalExpr>,

    /// Nominal type of each evaluated argument. The catalog is consulted
    /// with the first `num_trans_inputs` of these.
    pub input_types: Vec<DataType>,

    /// How many leading arguments are passed to the transition function.
    pub num_trans_inputs: usize,

    /// Optional FILTER clause; rows failing it skip this aggregate only.
    pub filter: Option<PhysicalExpr>,

    /// ORDER BY inside the call. Key columns index the evaluated argument
    /// tuple.
    pub sort_keys: Vec<SortKey>,

    /// Zero, or equal to `sort_keys.len()` when DISTINCT was requested.
    pub num_distinct_cols: usize,

    /// Ordered-set aggregate (direct arguments evaluated once at finalize).
    pub ordered_set: bool,
    pub direct_args: Vec<PhysicalExpr>,

    pub collation: u32,
}

impl AggregateCall {
    pub fn new(
        function: impl Into<String>,
        args: Vec<PhysicalExpr>,
        input_types: Vec<DataType>,
    ) -> Self {
        let num_trans_inputs = args.len();
        AggregateCall {
            function: function.into(),
            args,
            input_types,
            num_trans_inputs,
            filter: None,
            sort_keys: Vec::new(),
            num_distinct_cols: 0,
            ordered_set: false,
            direct_args: Vec::new(),
            collation: 0,
        }
    }

    pub fn with_filter(mut self, filter: PhysicalExpr) -> Self {
        self.filter = Some(filter);
        self
    }

    /// DISTINCT over all transition inputs: sort on every input column and
    /// eliminate adjacent duplicates.
    pub fn distinct(mut self) -> Self {
        self.sort_keys = (0..self.num_trans_inputs).map(SortKey::asc).collect();
        self.num_distinct_cols = self.sort_keys.len();
        self
    }

    pub fn with_order_by(mut self, keys: Vec<SortKey>) -> Self {
        self.sort_keys = keys;
        self
    }
}

/// A secondary node chained behind the primary one. Hashed entries each
/// contribute one more grouping set; sorted/plain entries each contribute
/// one more rollup (its own scan pass).
#[derive(Debug, Clone)]
pub struct ChainedAgg {
    pub strategy: AggStrategy,
    pub group_cols: Vec<usize>,
    /// Prefix lengths into `group_cols`, most specific first. Empty means a
    /// single set over all of `group_cols`.
    pub set_lengths: Vec<usize>,
    /// Input order this rollup's scan requires; defaults to ascending on
    /// `group_cols` when empty.
    pub sort_requirement: Vec<SortKey>,
}

/// How one output column is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputColumn {
    /// Reference an input column through the group's representative tuple.
    GroupColumn(usize),
    /// Reference a computed aggregate result.
    AggregateResult(usize),
}

/// Planner sizing annotation that enables hybrid (spillable) hashing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HybridHint {
    /// Estimated bytes per hash entry.
    pub entry_size: usize,
    /// Estimated number of groups.
    pub num_groups: f64,
}

/// The aggregation plan node.
#[derive(Debug, Clone)]
pub struct AggregateNode {
    pub strategy: AggStrategy,
    pub split: AggSplit,

    /// Schema of the child plan's rows.
    pub input_types: Vec<DataType>,

    /// Ordered grouping columns of the primary node.
    pub group_cols: Vec<usize>,

    /// Prefix lengths into `group_cols` describing the primary node's
    /// grouping sets, most specific first. Empty means a single set over
    /// all of `group_cols`.
    pub set_lengths: Vec<usize>,

    /// Input order the primary scan expects (informational; the child is
    /// required to deliver it).
    pub sort_requirement: Vec<SortKey>,

    pub aggregates: Vec<AggregateCall>,
    pub chain: Vec<ChainedAgg>,

    pub output: Vec<OutputColumn>,

    /// Post-aggregation qual evaluated against the representative tuple
    /// extended with aggregate results; rejected groups are not emitted.
    pub qual: Option<PhysicalExpr>,

    pub hybrid: Option<HybridHint>,
}

impl AggregateNode {
    /// A node computing `aggregates` grouped by `group_cols`, projecting the
    /// grouping columns followed by every aggregate result.
    pub fn grouped(
        strategy: AggStrategy,
        input_types: Vec<DataType>,
        group_cols: Vec<usize>,
        aggregates: Vec<AggregateCall>,
    ) -> Self {
        let output = group_cols
            .iter()
            .map(|&c| OutputColumn::GroupColumn(c))
            .chain((0..aggregates.len()).map(OutputColumn::AggregateResult))
            .collect();
        let set_lengths = vec![group_cols.len()];
        AggregateNode {
            strategy,
            split: AggSplit::SIMPLE,
            input_types,
            group_cols,
            set_lengths,
            sort_requirement: Vec::new(),
            aggregates,
            chain: Vec::new(),
            output,
            qual: None,
            hybrid: None,
        }
    }

    /// A plain (single group) node projecting only the aggregate results.
    pub fn plain(input_types: Vec<DataType>, aggregates: Vec<AggregateCall>) -> Self {
        let output = (0..aggregates.len())
            .map(OutputColumn::AggregateResult)
            .collect();
        AggregateNode {
            strategy: AggStrategy::Plain,
            split: AggSplit::SIMPLE,
            input_types,
            group_cols: Vec::new(),
            set_lengths: vec![0],
            sort_requirement: Vec::new(),
            aggregates,
            chain: Vec::new(),
            output,
            qual: None,
            hybrid: None,
        }
    }

    /// A sorted rollup over prefixes of `group_cols`: (all, all-1, ..., ()).
    pub fn rollup(
        input_types: Vec<DataType>,
        group_cols: Vec<usize>,
        aggregates: Vec<AggregateCall>,
    ) -> Self {
        let mut node = Self::grouped(AggStrategy::Sorted, input_types, group_cols, aggregates);
        node.set_lengths = (0..=node.group_cols.len()).rev().collect();
        node
    }

    pub fn with_split(mut self, split: AggSplit) -> Self {
        self.split = split;
        self
    }

    pub fn with_qual(mut self, qual: PhysicalExpr) -> Self {
        self.qual = Some(qual);
        self
    }

    pub fn with_hybrid(mut self, hint: HybridHint) -> Self {
        self.hybrid = Some(hint);
        self
    }

    pub fn with_chain(mut self, chain: Vec<ChainedAgg>) -> Self {
        self.chain = chain;
        self
    }

    pub(crate) fn num_input_columns(&self) -> usize {
        self.input_types.len()
    }
}

/// Marker for a null grouping column when building representative tuples.
pub(crate) fn null_row(width: usize) -> quern_row::Row {
    quern_row::Row::new(vec![ScalarValue::Null; width])
}
