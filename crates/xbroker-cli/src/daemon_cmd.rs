use std::io::Stdio;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use xbroker_config::{paths, BrokerConfig};
use xbroker_daemon::{list_attachable, socket, DaemonServer, EngineToolRuntime};
use xbroker_engine::ExecutionEngine;

const ATTACH_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// How often the daemon's long-lived engine evicts ring entries for
/// executions whose last chunk is older than the ring's retention window.
const RING_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub(crate) fn resolve_socket_path(config: &BrokerConfig, branch: Option<String>) -> Result<PathBuf> {
    let cwd = std::env::current_dir().context("failed to resolve current directory")?;
    let runtime_root = paths::runtime_root(config.xdg_runtime_dir.as_deref());
    let branch = branch.unwrap_or_else(|| config.branch.clone());
    Ok(paths::daemon_socket_path(&runtime_root, &cwd, &branch))
}

pub(crate) async fn send_request(socket_path: &PathBuf, request: &Value) -> Result<Value> {
    let mut stream = socket::connect(socket_path)
        .await
        .with_context(|| format!("daemon not reachable at {}", socket_path.display()))?;

    let payload = serde_json::to_string(request).context("failed to serialize daemon request")?;
    stream.write_all(payload.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await?;

    let mut line = String::new();
    let mut reader = BufReader::new(stream);
    let bytes = reader
        .read_line(&mut line)
        .await
        .context("failed to read daemon response")?;
    if bytes == 0 {
        bail!("daemon closed the connection before responding");
    }
    serde_json::from_str(line.trim()).context("failed to parse daemon response")
}

pub async fn handle_serve(foreground: bool, branch: Option<String>) -> Result<()> {
    let config = Arc::new(BrokerConfig::from_env()?);
    let cwd = std::env::current_dir().context("failed to resolve current directory")?;
    let branch = branch.unwrap_or_else(|| config.branch.clone());
    let socket_path = resolve_socket_path(&config, Some(branch.clone()))?;

    if !foreground {
        let exe = std::env::current_exe().context("failed to resolve current executable")?;
        let mut cmd = std::process::Command::new(exe);
        cmd.arg("daemon")
            .arg("serve")
            .arg("--foreground")
            .arg("--branch")
            .arg(&branch);
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        let child = cmd.spawn().context("failed to spawn background daemon")?;
        println!("xbroker daemon started in background (pid={})", child.id());
        return Ok(());
    }

    let engine = Arc::new(ExecutionEngine::from_config(config.clone()));
    let ring = engine.ring().clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RING_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            ring.sweep_expired().await;
        }
    });

    let registry = engine.registry().clone();
    let tool_runtime = Arc::new(EngineToolRuntime::new(engine));
    let server = Arc::new(DaemonServer::new(
        socket_path.clone(),
        cwd,
        branch,
        config.clone(),
        registry,
        tool_runtime,
    ));
    println!("xbroker daemon listening on {}", socket_path.display());
    server.run().await.context("daemon server failed")
}

async fn handle_simple_action(action: &str, branch: Option<String>) -> Result<()> {
    let config = BrokerConfig::from_env()?;
    let socket_path = resolve_socket_path(&config, branch)?;
    let response = send_request(&socket_path, &json!({"action": action})).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

pub async fn handle_status(branch: Option<String>) -> Result<()> {
    handle_simple_action("status", branch).await
}

pub async fn handle_info(branch: Option<String>) -> Result<()> {
    handle_simple_action("info", branch).await
}

pub async fn handle_detach(branch: Option<String>) -> Result<()> {
    handle_simple_action("detach", branch).await
}

pub async fn handle_stop(branch: Option<String>) -> Result<()> {
    handle_simple_action("stop", branch).await
}

/// Binds this connection as the daemon's live attach session, then
/// exchanges heartbeat frames until the user interrupts or the daemon
/// closes the socket.
pub async fn handle_attach(branch: Option<String>) -> Result<()> {
    let config = BrokerConfig::from_env()?;
    let socket_path = resolve_socket_path(&config, branch)?;
    let stream = socket::connect(&socket_path)
        .await
        .with_context(|| format!("daemon not reachable at {}", socket_path.display()))?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_half.write_all(b"{\"action\":\"attach\"}\n").await?;
    write_half.flush().await?;

    let mut line = String::new();
    let bytes = reader.read_line(&mut line).await?;
    if bytes == 0 {
        bail!("daemon closed the connection before acknowledging attach");
    }
    let ack: Value = serde_json::from_str(line.trim()).context("failed to parse attach response")?;
    println!("{}", serde_json::to_string_pretty(&ack)?);
    if ack.get("ok").and_then(Value::as_bool) != Some(true) {
        return Ok(());
    }

    println!("attached; press Ctrl+C to detach");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(ATTACH_HEARTBEAT_INTERVAL) => {
                write_half.write_all(b"{\"type\":\"ping\"}\n").await?;
                write_half.flush().await?;
            }
            _ = tokio::signal::ctrl_c() => break,
        }

        line.clear();
        let read = tokio::time::timeout(Duration::from_millis(200), reader.read_line(&mut line)).await;
        if let Ok(Ok(bytes)) = read {
            if bytes == 0 {
                break;
            }
            if let Ok(frame) = serde_json::from_str::<Value>(line.trim()) {
                if frame.get("type").and_then(Value::as_str) == Some("ping") {
                    write_half.write_all(b"{\"type\":\"pong\"}\n").await?;
                    write_half.flush().await?;
                }
            }
        }
    }

    Ok(())
}

pub async fn handle_list() -> Result<()> {
    let config = BrokerConfig::from_env()?;
    let cwd = std::env::current_dir().context("failed to resolve current directory")?;
    let runtime_root = paths::runtime_root(config.xdg_runtime_dir.as_deref());
    let daemons = list_attachable(&runtime_root, &cwd).await;
    println!("{}", serde_json::to_string_pretty(&daemons)?);
    Ok(())
}
