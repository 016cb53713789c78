//! Execution engine: admission, spawn, output capture, and mode policies.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Child;
use tokio::time::Instant;
use tracing::{error, info, warn};

use xbroker_config::{paths, BrokerConfig};
use xbroker_core::{
    BrokerError, ExecutionId, ExecutionMode, ExecutionRecord, ExecutionStatus, OutputId,
    OutputStatus, TransitionReason,
};
use xbroker_output::OutputStore;
use xbroker_process::{terminate_then_kill, OutputPump};
use xbroker_stream::{
    FileSubscriber, PipelineReader, PipelineReaderConfig, RingConfig, RingSubscriber, StreamPublisher,
};

use crate::options::{ExecuteOptions, SYNCHRONOUS_INPUT_READ_CAP};
use crate::registry::SupervisorRegistry;

const KILL_GRACE: Duration = Duration::from_secs(5);

/// Optional hooks a caller can wire up to react to terminal transitions
/// without polling the registry.
#[async_trait]
pub trait EngineCallbacks: Send + Sync {
    async fn on_complete(&self, _record: &ExecutionRecord) {}
    async fn on_timeout(&self, _record: &ExecutionRecord) {}
    async fn on_error(&self, _id: ExecutionId, _error: &str) {}
}

enum CaptureOutcome {
    Completed { exit_code: Option<i32> },
    TimedOut,
    Transitioned(TransitionReason),
}

/// Everything a capture pass needs to resume: either synchronously, or
/// handed off whole into a background task after an adaptive transition.
struct CaptureState {
    pump: OutputPump,
    child: Child,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    truncated: bool,
}

impl CaptureState {
    async fn run(
        &mut self,
        publisher: &StreamPublisher,
        id: ExecutionId,
        capture_stderr: bool,
        max_output_size: usize,
        hard_deadline: Instant,
        transition_deadline: Option<Instant>,
    ) -> CaptureOutcome {
        loop {
            tokio::select! {
                chunk = self.pump.recv() => {
                    match chunk {
                        Some(c) => {
                            publisher.publish_data(id, &c.data, c.is_stderr).await;
                            let hit_cap = if c.is_stderr {
                                if capture_stderr {
                                    append_bounded(&mut self.stderr, &c.data, max_output_size, &mut self.truncated)
                                } else {
                                    false
                                }
                            } else {
                                append_bounded(&mut self.stdout, &c.data, max_output_size, &mut self.truncated)
                            };
                            if hit_cap && transition_deadline.is_some() {
                                return CaptureOutcome::Transitioned(TransitionReason::OutputSizeLimit);
                            }
                        }
                        None => {
                            let status = self.child.wait().await.ok();
                            return CaptureOutcome::Completed {
                                exit_code: status.and_then(|s| s.code()),
                            };
                        }
                    }
                }
                _ = tokio::time::sleep_until(hard_deadline) => {
                    terminate_then_kill(&mut self.child, KILL_GRACE).await;
                    return CaptureOutcome::TimedOut;
                }
                _ = sleep_until_or_pending(transition_deadline) => {
                    return CaptureOutcome::Transitioned(TransitionReason::ForegroundTimeout);
                }
            }
        }
    }
}

async fn sleep_until_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Appends `data` into `buf` up to `cap`, truncating and flagging if it
/// would overflow. Returns whether this call is what crossed the cap.
fn append_bounded(buf: &mut Vec<u8>, data: &[u8], cap: usize, truncated: &mut bool) -> bool {
    if buf.len() >= cap {
        let already = *truncated;
        *truncated = true;
        return !already;
    }
    let room = cap - buf.len();
    if data.len() > room {
        buf.extend_from_slice(&data[..room]);
        let already = *truncated;
        *truncated = true;
        !already
    } else {
        buf.extend_from_slice(data);
        false
    }
}

pub struct ExecutionEngine {
    config: Arc<BrokerConfig>,
    registry: Arc<SupervisorRegistry>,
    output_store: Arc<OutputStore>,
    publisher: Arc<StreamPublisher>,
    ring: Arc<RingSubscriber>,
    file_subscriber: Arc<FileSubscriber>,
    callbacks: Option<Arc<dyn EngineCallbacks>>,
}

impl ExecutionEngine {
    pub fn new(
        config: Arc<BrokerConfig>,
        registry: Arc<SupervisorRegistry>,
        output_store: Arc<OutputStore>,
        publisher: Arc<StreamPublisher>,
        ring: Arc<RingSubscriber>,
        file_subscriber: Arc<FileSubscriber>,
    ) -> Self {
        Self {
            config,
            registry,
            output_store,
            publisher,
            ring,
            file_subscriber,
            callbacks: None,
        }
    }

    pub fn with_callbacks(mut self, callbacks: Arc<dyn EngineCallbacks>) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    /// Builds the full in-process stack (output store, publisher, ring,
    /// file subscriber, admission registry) from a resolved `BrokerConfig`.
    /// Shared by the one-shot CLI `execute` command and the daemon so the
    /// two never construct the stack differently.
    pub fn from_config(config: Arc<BrokerConfig>) -> Self {
        let runtime_root = paths::runtime_root(config.xdg_runtime_dir.as_deref());
        let output_root = paths::output_root(&runtime_root);

        let output_store = Arc::new(OutputStore::new(output_root.clone()));
        let publisher = Arc::new(StreamPublisher::new());
        let ring = Arc::new(RingSubscriber::new(RingConfig::default()));
        let file_subscriber = Arc::new(FileSubscriber::new(
            Some(output_store.clone()),
            output_root.join("fallback"),
        ));
        let registry = Arc::new(SupervisorRegistry::new(config.max_concurrent_processes));

        Self::new(config, registry, output_store, publisher, ring, file_subscriber)
    }

    /// Exposes the admission/execution-record registry so a caller that
    /// outlives the initial `execute` return (e.g. a CLI polling a
    /// background transition to completion) can watch a record settle.
    pub fn registry(&self) -> &Arc<SupervisorRegistry> {
        &self.registry
    }

    /// Exposes the ring subscriber so a long-lived owner (the daemon) can
    /// run its own periodic `sweep_expired` pass.
    pub fn ring(&self) -> &Arc<RingSubscriber> {
        &self.ring
    }

    pub async fn execute(&self, options: ExecuteOptions) -> Result<ExecutionRecord, BrokerError> {
        options.validate()?;

        let working_directory = options
            .working_directory
            .clone()
            .unwrap_or_else(|| self.config.default_working_directory.clone());
        if !self.config.is_allowed_working_directory(&working_directory) {
            return Err(BrokerError::DisallowedWorkingDirectory(
                working_directory.display().to_string(),
            ));
        }

        let stdin_data = match (&options.input_data, options.input_output_id) {
            (Some(data), None) => Some(data.clone()),
            (None, Some(output_id)) => Some(self.resolve_input(output_id).await?),
            (None, None) => None,
            (Some(_), Some(_)) => unreachable!("validated mutually exclusive above"),
        };

        let id = ExecutionId::new();
        let record = ExecutionRecord::new(
            id,
            options.command.clone(),
            working_directory.clone(),
            options.environment_overrides.clone(),
            options.mode,
        );
        self.registry.try_admit_and_insert(record).await?;

        self.publisher.subscribe(id, self.ring.clone()).await;
        self.publisher.subscribe(id, self.file_subscriber.clone()).await;
        self.publisher.publish_start(id, &options.command).await;

        let detached = options.mode == ExecutionMode::Detached;
        let spawned = xbroker_process::spawn(
            &options.command,
            &working_directory,
            &options.environment_overrides,
            stdin_data.as_deref(),
            detached,
        );

        let mut child = match spawned {
            Ok(child) => child,
            Err(error) => {
                let message = error.to_string();
                self.registry
                    .update(id, |r| {
                        r.status = ExecutionStatus::Failed;
                        r.critical_message = Some(message.clone());
                        r.completed_at = Some(Utc::now());
                    })
                    .await;
                self.publisher.publish_error(id, &message).await;
                if let Some(callbacks) = &self.callbacks {
                    callbacks.on_error(id, &message).await;
                }
                return Err(BrokerError::SpawnFailed(message));
            }
        };

        if let Some(pid) = child.id() {
            self.registry.set_pid(id, pid).await;
        } else {
            warn!(%id, "spawned child exposed no pid; kill-by-id will be unavailable");
        }
        self.registry
            .update(id, |r| r.started_at = Some(Utc::now()))
            .await;

        let output_id = self.file_subscriber.output_id_for(id).await;
        if let Some(output_id) = output_id {
            self.registry.update(id, |r| r.output_id = Some(output_id)).await;
        }

        let pump = OutputPump::new(&mut child);
        let state = CaptureState {
            pump,
            child,
            stdout: Vec::new(),
            stderr: Vec::new(),
            truncated: false,
        };

        let now = Instant::now();
        let hard_deadline = now + Duration::from_secs(options.timeout_secs);

        match options.mode {
            ExecutionMode::Foreground => {
                self.run_to_completion(id, state, options.capture_stderr, options.max_output_size, hard_deadline, None, options.return_partial_on_timeout)
                    .await
            }
            ExecutionMode::Adaptive => {
                let transition_deadline = options
                    .foreground_timeout_secs
                    .map(|secs| now + Duration::from_secs(secs));
                self.run_adaptive(
                    id,
                    state,
                    options.capture_stderr,
                    options.max_output_size,
                    hard_deadline,
                    transition_deadline,
                    options.return_partial_on_timeout,
                )
                .await
            }
            ExecutionMode::Background | ExecutionMode::Detached => {
                self.run_in_background(id, state, options.capture_stderr, options.max_output_size, hard_deadline)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_to_completion(
        &self,
        id: ExecutionId,
        mut state: CaptureState,
        capture_stderr: bool,
        max_output_size: usize,
        hard_deadline: Instant,
        transition_deadline: Option<Instant>,
        return_partial_on_timeout: bool,
    ) -> Result<ExecutionRecord, BrokerError> {
        let outcome = state
            .run(&self.publisher, id, capture_stderr, max_output_size, hard_deadline, transition_deadline)
            .await;
        self.finalize_terminal(id, &state, outcome, return_partial_on_timeout).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_adaptive(
        &self,
        id: ExecutionId,
        mut state: CaptureState,
        capture_stderr: bool,
        max_output_size: usize,
        hard_deadline: Instant,
        transition_deadline: Option<Instant>,
        return_partial_on_timeout: bool,
    ) -> Result<ExecutionRecord, BrokerError> {
        let outcome = state
            .run(&self.publisher, id, capture_stderr, max_output_size, hard_deadline, transition_deadline)
            .await;

        let reason = match outcome {
            CaptureOutcome::Transitioned(reason) => reason,
            _ => return self.finalize_terminal(id, &state, outcome, return_partial_on_timeout).await,
        };

        self.registry
            .update(id, |r| {
                r.output_status = Some(OutputStatus::BackgroundTransition);
                r.transition_reason = Some(reason);
                r.stdout = String::from_utf8_lossy(&state.stdout).into_owned();
                r.stderr = String::from_utf8_lossy(&state.stderr).into_owned();
            })
            .await;
        let snapshot = self.registry.get(id).await?;

        let registry = self.registry.clone();
        let publisher = self.publisher.clone();
        let callbacks = self.callbacks.clone();
        tokio::spawn(async move {
            let outcome = state
                .run(&publisher, id, capture_stderr, max_output_size, hard_deadline, None)
                .await;
            finish_in_background(registry, publisher, callbacks, id, state, outcome, return_partial_on_timeout).await;
        });

        Ok(snapshot)
    }

    async fn run_in_background(
        &self,
        id: ExecutionId,
        mut state: CaptureState,
        capture_stderr: bool,
        max_output_size: usize,
        hard_deadline: Instant,
    ) -> Result<ExecutionRecord, BrokerError> {
        self.registry
            .update(id, |r| r.output_status = Some(OutputStatus::BackgroundTransition))
            .await;
        let snapshot = self.registry.get(id).await?;

        let registry = self.registry.clone();
        let publisher = self.publisher.clone();
        let callbacks = self.callbacks.clone();
        tokio::spawn(async move {
            let outcome = state
                .run(&publisher, id, capture_stderr, max_output_size, hard_deadline, None)
                .await;
            finish_in_background(registry, publisher, callbacks, id, state, outcome, true).await;
        });

        Ok(snapshot)
    }

    async fn finalize_terminal(
        &self,
        id: ExecutionId,
        state: &CaptureState,
        outcome: CaptureOutcome,
        return_partial_on_timeout: bool,
    ) -> Result<ExecutionRecord, BrokerError> {
        apply_terminal_outcome(&self.registry, &self.publisher, id, state, &outcome, return_partial_on_timeout).await;
        let record = self.registry.get(id).await?;
        if let Some(callbacks) = &self.callbacks {
            match outcome {
                CaptureOutcome::TimedOut => callbacks.on_timeout(&record).await,
                _ => callbacks.on_complete(&record).await,
            }
        }
        Ok(record)
    }

    /// Reads stdin from an existing artifact: whole, if it's within the
    /// synchronous read cap; otherwise incrementally through a pipeline
    /// reader, but only while the owning execution is still ring-active —
    /// a finished execution whose artifact exceeds the cap has no way left
    /// to stream it and is rejected rather than read in full into memory.
    async fn resolve_input(&self, output_id: OutputId) -> Result<Vec<u8>, BrokerError> {
        let artifact = self.output_store.get_by_id(output_id).await?;
        if artifact.size <= SYNCHRONOUS_INPUT_READ_CAP {
            let read = self
                .output_store
                .read_by_offset(output_id, 0, artifact.size as usize)
                .await?;
            return Ok(read.content);
        }

        let exec = artifact.execution_id.ok_or(BrokerError::UnknownOutput(output_id))?;
        let still_active = self
            .ring
            .get_stream_state(exec)
            .await
            .map(|s| s.is_active)
            .unwrap_or(false);
        if !still_active {
            return Err(BrokerError::Validation(format!(
                "output '{output_id}' exceeds the synchronous input read cap and its owning execution is no longer active"
            )));
        }

        let mut reader = PipelineReader::new(
            self.output_store.clone(),
            self.ring.clone(),
            output_id,
            exec,
            PipelineReaderConfig::default(),
        );
        let mut buf = Vec::new();
        while let Some(chunk) = reader.read_next().await? {
            buf.extend_from_slice(&chunk);
            if buf.len() as u64 >= SYNCHRONOUS_INPUT_READ_CAP {
                break;
            }
        }
        Ok(buf)
    }
}

async fn apply_terminal_outcome(
    registry: &SupervisorRegistry,
    publisher: &StreamPublisher,
    id: ExecutionId,
    state: &CaptureState,
    outcome: &CaptureOutcome,
    return_partial_on_timeout: bool,
) {
    let (status, output_status, exit_code) = match outcome {
        CaptureOutcome::Completed { exit_code } => (
            ExecutionStatus::Completed,
            if state.truncated { OutputStatus::SizeLimit } else { OutputStatus::Complete },
            *exit_code,
        ),
        CaptureOutcome::TimedOut => (ExecutionStatus::Timeout, OutputStatus::Timeout, None),
        CaptureOutcome::Transitioned(_) => {
            error!(%id, "apply_terminal_outcome called with a non-terminal outcome");
            return;
        }
    };

    let keep_partial = !matches!(outcome, CaptureOutcome::TimedOut) || return_partial_on_timeout;
    let stdout = if keep_partial { String::from_utf8_lossy(&state.stdout).into_owned() } else { String::new() };
    let stderr = if keep_partial { String::from_utf8_lossy(&state.stderr).into_owned() } else { String::new() };

    registry
        .update(id, |r| {
            r.status = status;
            r.exit_code = exit_code;
            r.stdout = stdout;
            r.stderr = stderr;
            r.output_status = Some(output_status);
            r.completed_at = Some(Utc::now());
        })
        .await;
    registry.clear_pid(id).await;
    publisher.publish_end(id, exit_code).await;
}

async fn finish_in_background(
    registry: Arc<SupervisorRegistry>,
    publisher: Arc<StreamPublisher>,
    callbacks: Option<Arc<dyn EngineCallbacks>>,
    id: ExecutionId,
    state: CaptureState,
    outcome: CaptureOutcome,
    return_partial_on_timeout: bool,
) {
    apply_terminal_outcome(&registry, &publisher, id, &state, &outcome, return_partial_on_timeout).await;
    if let Some(callbacks) = callbacks {
        if let Ok(record) = registry.get(id).await {
            match outcome {
                CaptureOutcome::TimedOut => callbacks.on_timeout(&record).await,
                _ => callbacks.on_complete(&record).await,
            }
        }
    }
    info!(%id, "background execution finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use xbroker_output::OutputStore;
    use xbroker_stream::RingConfig;

    fn make_engine(root: PathBuf) -> (ExecutionEngine, Arc<BrokerConfig>) {
        let config = Arc::new(BrokerConfig {
            default_working_directory: root.clone(),
            allowed_working_directories: vec![root.clone()],
            ..BrokerConfig::default()
        });
        let registry = Arc::new(SupervisorRegistry::new(4));
        let output_store = Arc::new(OutputStore::new(root.join("outputs")));
        let publisher = Arc::new(StreamPublisher::new());
        let ring = Arc::new(RingSubscriber::new(RingConfig::default()));
        let file_subscriber = Arc::new(FileSubscriber::new(Some(output_store.clone()), root.join("fallback")));
        let engine = ExecutionEngine::new(config.clone(), registry, output_store, publisher, ring, file_subscriber);
        (engine, config)
    }

    fn base_options(command: &str) -> ExecuteOptions {
        ExecuteOptions {
            command: command.to_string(),
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

    #[tokio::test]
    async fn foreground_execution_completes_and_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _config) = make_engine(dir.path().to_path_buf());

        let record = engine.execute(base_options("echo hi")).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.stdout, "hi\n");
        assert_eq!(record.exit_code, Some(0));
        assert_eq!(record.output_status, Some(OutputStatus::Complete));
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_still_a_normal_completion() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _config) = make_engine(dir.path().to_path_buf());

        let record = engine.execute(base_options("exit 1")).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.exit_code, Some(1));
    }

    #[tokio::test]
    async fn disallowed_working_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _config) = make_engine(dir.path().to_path_buf());
        let mut options = base_options("echo hi");
        options.working_directory = Some(PathBuf::from("/definitely/not/allowed"));

        let result = engine.execute(options).await;
        assert!(matches!(result, Err(BrokerError::DisallowedWorkingDirectory(_))));
    }

    #[tokio::test]
    async fn hard_timeout_kills_and_marks_timeout_status() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _config) = make_engine(dir.path().to_path_buf());
        let mut options = base_options("sleep 30");
        options.timeout_secs = 1;

        let record = engine.execute(options).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Timeout);
        assert_eq!(record.output_status, Some(OutputStatus::Timeout));
    }

    #[tokio::test]
    async fn admission_cap_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _config) = make_engine(dir.path().to_path_buf());
        let mut options = base_options("sleep 30");
        options.mode = ExecutionMode::Background;
        options.timeout_secs = 2;

        for _ in 0..4 {
            engine.execute(options.clone()).await.unwrap();
        }
        let result = engine.execute(options).await;
        assert!(matches!(result, Err(BrokerError::ResourceLimit { .. })));
    }
}
