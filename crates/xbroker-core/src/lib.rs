//! Shared types and error kinds for the command-execution broker.

pub mod error;
pub mod types;

pub use error::BrokerError;
pub use types::{
    ExecutionId, ExecutionMode, ExecutionRecord, ExecutionStatus, OutputArtifact, OutputId,
    OutputKind, OutputStatus, TransitionReason,
};
