//! Grading harness for C exercise fixtures.
//!
//! This crate provides:
//! - Fixture loading: path-derived ids, typed expectations, rejected descriptors kept aside
//! - Building and running through `examgrader-exec`, one private output directory per fixture
//! - Oracle comparison: byte-exact stdout/stderr/exit code, a reference program's run, or
//!   googletest case results
//! - Aggregation: one verdict per fixture, ordered by id, rendered as markdown and JSON
//! - Structured JSONL logging of every build/run/compare step

#![forbid(unsafe_code)]

pub mod config;
pub mod diff;
pub mod error;
pub mod fixtures;
pub mod frameworks;
pub mod gtest_report;
pub mod oracle;
pub mod report;
pub mod runner;
pub mod structured_log;
pub mod verify;

pub use config::HarnessConfig;
pub use error::HarnessError;
pub use fixtures::{Corpus, FixtureDescriptor, FixtureKind, load_corpus};
pub use frameworks::{FrameworkRegistry, FrameworkSpec};
pub use report::GradeReport;
pub use runner::Grader;
pub use verify::{GradeSummary, GradedFixture, Verdict};
