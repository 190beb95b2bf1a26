//! Test orchestration and coverage enforcement for the fwimage image builder.
//!
//! This crate provides:
//! - Output capture: redirect harness output into in-memory buffers
//! - Module discovery: enumerate entry-type plugins on disk
//! - Test dispatch: run the five test groups, optionally filtered to one test
//! - Coverage gate: re-run the suite under a coverage tool and demand 100%
//! - Structured logs: JSONL run records plus a hashed artifact index

#![forbid(unsafe_code)]

#[macro_use]
pub mod console;
pub mod app;
pub mod config;
pub mod coverage;
pub mod discovery;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod process;
pub mod structured_log;
pub mod suite;

pub use config::{ExecutionOptions, HarnessSettings, RunMode, Verbosity};
pub use coverage::{CoverageBackend, CoverageReport, CoverageSummary};
pub use discovery::{PluginRegistry, discover};
pub use engine::{Engine, ExternalEngine};
pub use error::HarnessError;
pub use suite::{GroupKind, TestCase, TestGroup, TestSuiteResult};
