//! Persists one combined artifact per execution, written incrementally so a
//! pipeline reader can poll it while the execution is still running.
//!
//! The artifact is created empty at `onProcessStart`. Stdout chunks are
//! appended to it as they arrive, so a mid-run poll sees progress; stderr
//! chunks are held in a small in-memory buffer and only appended — as a
//! single `"\n--- STDERR ---\n"` separator followed by the whole stderr
//! block — once `onProcessEnd` fires. The final artifact is therefore
//! `stdout + "\n--- STDERR ---\n" + stderr`, with only stderr ever held in
//! memory rather than the whole run's output.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;
use xbroker_core::{ExecutionId, OutputId, OutputKind};
use xbroker_output::OutputStore;

use crate::subscriber::Subscriber;

#[derive(Debug, Default)]
struct Buffers {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

#[derive(Debug, Default)]
struct ExecState {
    output_id: Option<OutputId>,
    buffers: Buffers,
}

#[derive(Serialize)]
struct FallbackRecord<'a> {
    execution_id: String,
    exit_code: Option<i32>,
    stdout: &'a str,
    stderr: &'a str,
    recorded_at: chrono::DateTime<Utc>,
}

pub struct FileSubscriber {
    store: Option<Arc<OutputStore>>,
    fallback_dir: PathBuf,
    state: Mutex<HashMap<ExecutionId, ExecState>>,
}

impl FileSubscriber {
    pub fn new(store: Option<Arc<OutputStore>>, fallback_dir: PathBuf) -> Self {
        Self {
            store,
            fallback_dir,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// The artifact created for `exec`, available as soon as the first
    /// `onProcessStart` has been delivered. Callers bind this to the
    /// execution record so a later `input_output_id` lookup has something
    /// to resolve even while the execution is still running.
    pub async fn output_id_for(&self, exec: ExecutionId) -> Option<OutputId> {
        self.state.lock().await.get(&exec).and_then(|s| s.output_id)
    }

    async fn write_fallback(&self, exec: ExecutionId, exit_code: Option<i32>, buffers: &Buffers) {
        if let Err(error) = tokio::fs::create_dir_all(&self.fallback_dir).await {
            warn!(%error, "failed to create fallback output directory");
            return;
        }
        let record = FallbackRecord {
            execution_id: exec.to_string(),
            exit_code,
            stdout: &String::from_utf8_lossy(&buffers.stdout),
            stderr: &String::from_utf8_lossy(&buffers.stderr),
            recorded_at: Utc::now(),
        };
        let path = self.fallback_dir.join(format!("{exec}.json"));
        match serde_json::to_vec_pretty(&record) {
            Ok(bytes) => {
                if let Err(error) = tokio::fs::write(&path, bytes).await {
                    warn!(%error, path = %path.display(), "failed to write fallback output record");
                }
            }
            Err(error) => warn!(%error, "failed to serialize fallback output record"),
        }
    }
}

#[async_trait]
impl Subscriber for FileSubscriber {
    async fn on_process_start(&self, exec: ExecutionId, _command: &str) {
        let output_id = match &self.store {
            Some(store) => match store.create_empty(OutputKind::Combined, Some(exec)).await {
                Ok(id) => Some(id),
                Err(error) => {
                    warn!(%error, %exec, "failed to create combined output artifact");
                    None
                }
            },
            None => None,
        };
        self.state.lock().await.insert(
            exec,
            ExecState {
                output_id,
                buffers: Buffers::default(),
            },
        );
    }

    async fn on_output_data(&self, exec: ExecutionId, data: &[u8], is_stderr: bool) {
        let output_id = {
            let mut state = self.state.lock().await;
            let entry = state.entry(exec).or_default();
            if is_stderr {
                entry.buffers.stderr.extend_from_slice(data);
                None
            } else {
                entry.buffers.stdout.extend_from_slice(data);
                entry.output_id
            }
        };

        if let (Some(store), Some(id)) = (&self.store, output_id) {
            if let Err(error) = store.append(id, data).await {
                warn!(%error, %exec, "failed to append to combined output artifact");
            }
        }
    }

    async fn on_process_end(&self, exec: ExecutionId, exit_code: Option<i32>) {
        let state = {
            let mut guard = self.state.lock().await;
            guard.remove(&exec).unwrap_or_default()
        };

        match (&self.store, state.output_id) {
            (Some(store), Some(id)) => {
                if !state.buffers.stderr.is_empty() {
                    let mut section = Vec::with_capacity(state.buffers.stderr.len() + 16);
                    section.extend_from_slice(b"\n--- STDERR ---\n");
                    section.extend_from_slice(&state.buffers.stderr);
                    if let Err(error) = store.append(id, &section).await {
                        warn!(%error, %exec, "failed to append stderr section to combined output artifact");
                    }
                }
            }
            _ => self.write_fallback(exec, exit_code, &state.buffers).await,
        }
    }
}
