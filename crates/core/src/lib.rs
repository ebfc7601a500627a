// Core types and workflow engine for the dsflow dataset builder

pub mod config;
pub mod error;
pub mod events;
pub mod storage;
pub mod tasks;
pub mod types;
pub mod workflow;

pub use error::{QueueError, WorkflowError};
pub use types::*;
