//! Error kinds shared across the broker's components.
//!
//! One variant per cause named in the design's error-handling section, not
//! per call site — callers match on kind, not on which function raised it.

use crate::types::{ExecutionId, OutputId};

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("resource limit exceeded: {running}/{max} processes already running")]
    ResourceLimit { running: usize, max: usize },

    #[error("working directory '{0}' is not within an allowed root")]
    DisallowedWorkingDirectory(String),

    #[error("input_data and input_output_id are mutually exclusive")]
    MutuallyExclusiveInput,

    #[error("invalid execution options: {0}")]
    Validation(String),

    #[error("failed to spawn command: {0}")]
    SpawnFailed(String),

    #[error("failed to write to child stdin: {0}")]
    StdinWriteFailed(String),

    #[error("no execution record for id '{0}'")]
    UnknownExecution(ExecutionId),

    #[error("no output artifact for id '{0}'")]
    UnknownOutput(OutputId),

    #[error("offset {offset} is out of range for output '{id}' (size {size})")]
    OffsetOutOfRange {
        id: OutputId,
        offset: u64,
        size: u64,
    },

    #[error("failed to persist output artifact: {0}")]
    OutputWriteFailed(String),

    #[error("pipeline reader timed out after {0:?} without producing data")]
    PipelineReadTimeout(std::time::Duration),

    #[error("no stream state for execution '{0}'")]
    MissingStreamState(ExecutionId),

    #[error("invalid request frame: {0}")]
    InvalidRequest(String),

    #[error("an attach session is already active")]
    AlreadyAttached,

    #[error("unsupported daemon action '{0}'")]
    UnsupportedAction(String),

    #[error("unsupported tool '{0}'")]
    UnsupportedTool(String),

    #[error("socket request timed out after {0:?}")]
    SocketRequestTimeout(std::time::Duration),

    #[error("command was rejected by the security evaluator")]
    SecurityDenied,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_resource_limit() {
        let err = BrokerError::ResourceLimit { running: 2, max: 2 };
        assert_eq!(
            err.to_string(),
            "resource limit exceeded: 2/2 processes already running"
        );
    }

    #[test]
    fn display_offset_out_of_range() {
        let err = BrokerError::OffsetOutOfRange {
            id: OutputId::new(),
            offset: 100,
            size: 10,
        };
        assert!(err.to_string().contains("offset 100"));
        assert!(err.to_string().contains("size 10"));
    }

    #[test]
    fn error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BrokerError>();
    }
}
