//! Grouped aggregation over a stream of rows.
//!
//! Supports plain, sorted, hashed, and mixed grouping strategies, grouping
//! sets and rollups across phases, partial-aggregation split modes,
//! DISTINCT / ORDER BY inside aggregate calls, hybrid hash aggregation
//! with recursive spilling, and the parallel redistribution boundary.

mod build;
mod executor;
mod hash;
mod hybrid;
mod node;
mod redistribute;
mod sorted;
mod trans;

pub use executor::AggregateExecutor;
pub use node::{
    AggSplit, AggStrategy, AggregateCall, AggregateNode, ChainedAgg, HybridHint, OutputColumn,
};
pub use redistribute::{redistribute_worker, RedistributeState, WorkerLink, WorkerStatus};

#[cfg(test)]
mod tests;
