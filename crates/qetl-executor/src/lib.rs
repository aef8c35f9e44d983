//! Pipeline execution backends for QETL.
//!
//! Provides:
//! - [`ExecutorAdapter`], the timeout/cancellation wrapper used by the job runner
//! - [`ProcessExecutor`], which runs the external pipeline runner as a subprocess

pub mod adapter;
pub mod process;

pub use adapter::{ExecutionOutcome, ExecutorAdapter};
pub use process::ProcessExecutor;
pub use qetl_core::executor::{ComponentInfo, ExecutionOutput, PipelineExecutor};
