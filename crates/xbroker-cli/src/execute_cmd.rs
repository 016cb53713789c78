use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::json;
use xbroker_core::{ExecutionId, ExecutionMode, ExecutionRecord, OutputId};
use xbroker_engine::{ExecuteOptions, ExecutionEngine};

use crate::daemon_cmd;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

fn parse_mode(raw: &str) -> Result<ExecutionMode> {
    match raw {
        "foreground" => Ok(ExecutionMode::Foreground),
        "adaptive" => Ok(ExecutionMode::Adaptive),
        "background" => Ok(ExecutionMode::Background),
        "detached" => Ok(ExecutionMode::Detached),
        other => bail!("unknown execution mode: {other} (expected foreground|adaptive|background|detached)"),
    }
}

fn parse_env_overrides(raw: &[String]) -> Result<HashMap<String, String>> {
    let mut overrides = HashMap::new();
    for entry in raw {
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("invalid --env entry (expected KEY=VALUE): {entry}"))?;
        overrides.insert(key.to_string(), value.to_string());
    }
    Ok(overrides)
}

/// Dispatches `options` to a running daemon's `tool`/`execute` action, if
/// one is attachable for the current workspace/branch. Returns `Ok(None)`
/// when no daemon is reachable (the caller should fall back to an
/// in-process engine); returns `Err` when a daemon IS reachable but itself
/// rejected the request (e.g. its admission cap is full), since that
/// rejection shouldn't be silently papered over by a local fallback run.
async fn try_daemon_execute(config: &xbroker_config::BrokerConfig, options: &ExecuteOptions) -> Result<Option<ExecutionRecord>> {
    let socket_path = daemon_cmd::resolve_socket_path(config, None)?;
    let params = serde_json::to_value(options).context("failed to serialize execute options")?;
    let response = match daemon_cmd::send_request(&socket_path, &json!({"action": "tool", "tool_name": "execute", "params": params})).await {
        Ok(response) => response,
        Err(_) => return Ok(None),
    };

    if response.get("ok").and_then(serde_json::Value::as_bool) != Some(true) {
        let error = response.get("error").and_then(serde_json::Value::as_str).unwrap_or("unknown daemon error");
        bail!("daemon rejected execute request: {error}");
    }
    let record: ExecutionRecord = serde_json::from_value(response["result"].clone()).context("failed to parse daemon execution record")?;
    Ok(Some(record))
}

async fn daemon_get(config: &xbroker_config::BrokerConfig, id: ExecutionId) -> Result<ExecutionRecord> {
    let socket_path = daemon_cmd::resolve_socket_path(config, None)?;
    let params = json!({"execution_id": id});
    let response = daemon_cmd::send_request(&socket_path, &json!({"action": "tool", "tool_name": "get", "params": params})).await?;
    if response.get("ok").and_then(serde_json::Value::as_bool) != Some(true) {
        let error = response.get("error").and_then(serde_json::Value::as_str).unwrap_or("unknown daemon error");
        bail!("daemon rejected get request: {error}");
    }
    serde_json::from_value(response["result"].clone()).context("failed to parse daemon execution record")
}

#[allow(clippy::too_many_arguments)]
pub async fn handle_execute(
    command: String,
    mode: String,
    cwd: Option<String>,
    env_overrides: Vec<String>,
    timeout_seconds: u64,
    foreground_timeout_seconds: Option<u64>,
    max_output_size: usize,
    capture_stderr: bool,
    return_partial_on_timeout: bool,
    input_output_id: Option<OutputId>,
    session_id: Option<String>,
) -> Result<()> {
    let config = xbroker_config::BrokerConfig::from_env()?;

    let options = ExecuteOptions {
        command,
        mode: parse_mode(&mode)?,
        working_directory: cwd.map(PathBuf::from),
        environment_overrides: parse_env_overrides(&env_overrides)?,
        input_data: None,
        input_output_id,
        timeout_secs: timeout_seconds,
        foreground_timeout_secs: foreground_timeout_seconds,
        max_output_size,
        capture_stderr,
        return_partial_on_timeout,
        session_id,
    };

    // Prefer a live daemon for the current workspace/branch, so the
    // execution's state outlives this one-shot process; fall back to an
    // in-process engine when none is attachable.
    let record = if let Some(mut record) = try_daemon_execute(&config, &options).await? {
        while !record.status.is_terminal() {
            tokio::time::sleep(POLL_INTERVAL).await;
            record = daemon_get(&config, record.id).await?;
        }
        record
    } else {
        let config = Arc::new(config);
        let engine = ExecutionEngine::from_config(config);
        let mut record = engine.execute(options).await.context("execution failed")?;
        let id = record.id;

        // A bare one-shot invocation has no daemon to keep a background
        // transition alive after this process exits, so it waits out any
        // adaptive/background continuation here instead of returning early.
        while !record.status.is_terminal() {
            tokio::time::sleep(POLL_INTERVAL).await;
            record = engine
                .registry()
                .get(id)
                .await
                .context("execution record vanished")?;
        }
        record
    };

    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
