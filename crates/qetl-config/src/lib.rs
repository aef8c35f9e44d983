//! KDL configuration parsing for QETL.
//!
//! This crate handles parsing of:
//! - Pipeline documents (`*.kdl`, or `*.json`)
//! - System configuration (`qetl.kdl`)

pub mod error;
mod kdl_util;
pub mod pipeline;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::{load_pipeline, parse_pipeline};
pub use system::{ExecutorConfig, SystemConfig};
