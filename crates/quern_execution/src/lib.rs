//! Streaming aggregation engine for a row-oriented query executor.
//!
//! The central entry point is
//! [`AggregateExecutor`](execution::operators::aggregate::AggregateExecutor):
//! given an aggregation plan node, a child row source, and per-query
//! configuration, it produces grouped aggregate results one row at a time.

pub mod config;
pub mod execution;
pub mod expr;
pub mod functions;
pub mod io;
pub mod memory;
