//! Shared utilities for harvester integration tests.
//!
//! - `TestHarness` wires a database, clock, account pool and job service
//! - `ScriptedScraper` / `GateScraper` stand in for the browser
//! - builders create accounts and jobs without boilerplate

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::*;
