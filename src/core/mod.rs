//! Core reconciliation logic: types, parsing, lookups, graph, planning, execution.

pub mod datasource;
pub mod error;
pub mod executor;
pub mod graph;
pub mod parser;
pub mod planner;
pub mod stack;
pub mod template;
pub mod types;
