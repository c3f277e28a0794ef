// =============================================================================
// alpha_engine — live crypto trading engine library
// =============================================================================
//
// A thin binary (`main.rs`) wires these modules together and blocks on
// `ctrl_c()`; everything that matters lives here so it can be exercised by
// `#[cfg(test)]` modules without touching the process entry point.
// =============================================================================

pub mod broadcast;
pub mod broker;
pub mod config;
pub mod db;
pub mod decision;
pub mod errors;
pub mod executor;
pub mod market;
pub mod price;
pub mod runner;
pub mod snapshot;
pub mod trigger;
pub mod types;
