//! Core domain types and traits for the QETL job manager.
//!
//! This crate contains:
//! - Job identifiers
//! - Job lifecycle types (state, status, records, results)
//! - Pipeline definitions and the pipeline builder
//! - The executor trait

pub mod error;
pub mod executor;
pub mod id;
pub mod job;
pub mod pipeline;

pub use error::{Error, Result};
pub use executor::{ComponentInfo, ExecutionOutput, PipelineExecutor};
pub use id::JobId;
pub use job::{FailureKind, JobFailure, JobRecord, JobResults, JobState, JobStatus};
pub use pipeline::{PipelineBuilder, PipelineSpec};
