//! Accepted execute-request options and their admission validation.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use xbroker_core::{BrokerError, ExecutionMode, OutputId};

pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 3600;
pub const MIN_FOREGROUND_TIMEOUT_SECS: u64 = 1;
pub const MAX_FOREGROUND_TIMEOUT_SECS: u64 = 300;
pub const MIN_MAX_OUTPUT_SIZE: usize = 1024;
pub const MAX_MAX_OUTPUT_SIZE: usize = 100 * 1024 * 1024;
pub const SYNCHRONOUS_INPUT_READ_CAP: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteOptions {
    pub command: String,
    pub mode: ExecutionMode,
    pub working_directory: Option<PathBuf>,
    pub environment_overrides: HashMap<String, String>,
    pub input_data: Option<Vec<u8>>,
    pub input_output_id: Option<OutputId>,
    pub timeout_secs: u64,
    pub foreground_timeout_secs: Option<u64>,
    pub max_output_size: usize,
    pub capture_stderr: bool,
    pub return_partial_on_timeout: bool,
    pub session_id: Option<String>,
}

impl ExecuteOptions {
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.input_data.is_some() && self.input_output_id.is_some() {
            return Err(BrokerError::MutuallyExclusiveInput);
        }
        if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&self.timeout_secs) {
            return Err(BrokerError::Validation(format!(
                "timeout_seconds must be within [{MIN_TIMEOUT_SECS}, {MAX_TIMEOUT_SECS}]"
            )));
        }
        if !(MIN_MAX_OUTPUT_SIZE..=MAX_MAX_OUTPUT_SIZE).contains(&self.max_output_size) {
            return Err(BrokerError::Validation(format!(
                "max_output_size must be within [{MIN_MAX_OUTPUT_SIZE}, {MAX_MAX_OUTPUT_SIZE}]"
            )));
        }
        if let Some(foreground) = self.foreground_timeout_secs {
            if !(MIN_FOREGROUND_TIMEOUT_SECS..=MAX_FOREGROUND_TIMEOUT_SECS).contains(&foreground) {
                return Err(BrokerError::Validation(format!(
                    "foreground_timeout_seconds must be within [{MIN_FOREGROUND_TIMEOUT_SECS}, {MAX_FOREGROUND_TIMEOUT_SECS}]"
                )));
            }
        }
        if self.mode == ExecutionMode::Adaptive {
            let foreground = self.foreground_timeout_secs.ok_or_else(|| {
                BrokerError::Validation("adaptive mode requires foreground_timeout_seconds".to_string())
            })?;
            if foreground > self.timeout_secs {
                return Err(BrokerError::Validation(
                    "foreground_timeout_seconds must be <= timeout_seconds".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ExecuteOptions {
        ExecuteOptions {
            command: "echo hi".to_string(),
            mode: ExecutionMode::Foreground,
            working_directory: None,
            environment_overrides: HashMap::new(),
            input_data: None,
            input_output_id: None,
            timeout_secs: 5,
            foreground_timeout_secs: None,
            max_output_size: 4096,
            capture_stderr: true,
            return_partial_on_timeout: true,
            session_id: None,
        }
    }

    #[test]
    fn mutually_exclusive_input_is_rejected() {
        let mut options = base();
        options.input_data = Some(vec![1]);
        options.input_output_id = Some(OutputId::new());
        assert!(matches!(
            options.validate(),
            Err(BrokerError::MutuallyExclusiveInput)
        ));
    }

    #[test]
    fn adaptive_requires_foreground_timeout_leq_timeout() {
        let mut options = base();
        options.mode = ExecutionMode::Adaptive;
        options.foreground_timeout_secs = Some(10);
        options.timeout_secs = 5;
        assert!(matches!(options.validate(), Err(BrokerError::Validation(_))));

        options.foreground_timeout_secs = Some(5);
        options.timeout_secs = 10;
        assert!(options.validate().is_ok());
    }

    #[test]
    fn timeout_out_of_range_is_rejected() {
        let mut options = base();
        options.timeout_secs = 0;
        assert!(matches!(options.validate(), Err(BrokerError::Validation(_))));
    }
}
