//! sqlweave engine - model execution
//!
//! This crate runs execution plans against a relational store:
//! - Level-by-level scheduling with bounded concurrency per level
//! - Materialization of views, tables and incremental tables
//! - Failure isolation, timeouts, fail-fast and cancellation
//! - Recording of run summaries, run logs and per-model metadata

pub mod cancel;
pub mod engine;
pub mod materialize;
pub mod recorder;

pub use cancel::CancellationHandle;
pub use engine::{Engine, EngineError, ModelPhase};
pub use materialize::Statements;
pub use recorder::{FileRecorder, MemoryRecorder, RecorderError, RunRecorder};
