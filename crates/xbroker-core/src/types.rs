//! Shared data model: `ExecutionId`, `OutputId`, `ExecutionRecord`, `OutputArtifact`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Opaque identifier for one accepted execution, unique for the engine's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(Ulid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ExecutionId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

/// Opaque identifier for one persisted output artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputId(Ulid);

impl OutputId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for OutputId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for OutputId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

/// Execution mode requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Foreground,
    Adaptive,
    Background,
    Detached,
}

/// Terminal/in-flight status of an execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Timeout
        )
    }
}

/// Why an execution transitioned from foreground to background, if it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    ForegroundTimeout,
    OutputSizeLimit,
}

/// Summary of the output capture for one execution, sufficient for a caller
/// to decide whether to poll again, re-read via `OutputId`, or treat as final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStatus {
    /// No truncation; process exited before any timer fired.
    Complete,
    /// In-memory ceiling was hit; full output is available via `OutputId`.
    SizeLimit,
    /// Hard timeout fired; partial output may be available via `OutputId`.
    Timeout,
    /// Execution moved to background; still running when the call returned.
    BackgroundTransition,
}

/// A single accepted execution and everything known about it so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub command: String,
    pub working_directory: std::path::PathBuf,
    #[serde(default)]
    pub environment_overrides: std::collections::HashMap<String, String>,
    pub mode: ExecutionMode,
    pub status: ExecutionStatus,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// In-memory captured stdout, truncated to `max_output_size`.
    pub stdout: String,
    /// In-memory captured stderr, truncated to `max_output_size`.
    pub stderr: String,
    pub output_id: Option<OutputId>,
    pub output_status: Option<OutputStatus>,
    pub transition_reason: Option<TransitionReason>,
    /// Set when the output-file write path failed; informational only.
    pub critical_message: Option<String>,
}

impl ExecutionRecord {
    pub fn new(
        id: ExecutionId,
        command: String,
        working_directory: std::path::PathBuf,
        environment_overrides: std::collections::HashMap<String, String>,
        mode: ExecutionMode,
    ) -> Self {
        Self {
            id,
            command,
            working_directory,
            environment_overrides,
            mode,
            status: ExecutionStatus::Running,
            pid: None,
            exit_code: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            stdout: String::new(),
            stderr: String::new(),
            output_id: None,
            output_status: None,
            transition_reason: None,
            critical_message: None,
        }
    }
}

/// Kind of a persisted output artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Stdout,
    Stderr,
    Combined,
    Log,
    Temp,
}

/// Metadata for one file-backed output artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputArtifact {
    pub id: OutputId,
    pub kind: OutputKind,
    pub path: std::path::PathBuf,
    pub size: u64,
    pub execution_id: Option<ExecutionId>,
    pub created_at: DateTime<Utc>,
    pub subscribed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_id_round_trips_through_display_and_parse() {
        let id = ExecutionId::new();
        let rendered = id.to_string();
        let parsed: ExecutionId = rendered.parse().expect("parse execution id");
        assert_eq!(id, parsed);
    }

    #[test]
    fn execution_ids_are_unique() {
        let a = ExecutionId::new();
        let b = ExecutionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn output_status_terminal_classification() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Timeout.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }

    #[test]
    fn execution_record_serializes_to_json() {
        let record = ExecutionRecord::new(
            ExecutionId::new(),
            "echo hello".to_string(),
            std::path::PathBuf::from("/tmp"),
            Default::default(),
            ExecutionMode::Foreground,
        );
        let json = serde_json::to_string(&record).expect("serialize record");
        assert!(json.contains("\"status\":\"running\""));
    }
}
