//! Core types for the direktiv workflow engine.
//!
//! This crate holds the workflow definition model, the durable instance
//! records, configuration, and the pure helpers (durations, cron schedules,
//! expressions) shared by the engine and the binary.

pub mod catalog;
pub mod config;
pub mod duration;
pub mod error;
pub mod expr;
pub mod instance;
pub mod model;
pub mod timer;

pub use config::DirektivConfig;
pub use error::{DirektivError, Result};
pub use instance::{InstanceRecord, InstanceStatus, RuntimeRecord};
pub use model::{CompiledWorkflow, State, StateType, Workflow};
