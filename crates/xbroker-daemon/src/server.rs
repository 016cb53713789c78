//! Daemon socket server: one accept loop, newline-delimited JSON requests,
//! and a single live attach session per daemon instance.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

use xbroker_config::BrokerConfig;
use xbroker_engine::SupervisorRegistry;

use crate::socket;
use crate::tool_runtime::ToolRuntime;

pub const HEARTBEAT_TIMEOUT_MS: u64 = 500;
pub const SOCKET_REQUEST_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, Deserialize)]
struct DaemonRequest {
    action: String,
    #[serde(default)]
    tool_name: Option<String>,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct HeartbeatFrame {
    #[serde(rename = "type")]
    kind: String,
}

struct AttachSlot {
    attached_at: DateTime<Utc>,
    write_half: Mutex<tokio::net::unix::OwnedWriteHalf>,
    pong_notify: Arc<Notify>,
}

struct AttachState {
    slot: Option<AttachSlot>,
    detached_at: Option<DateTime<Utc>>,
}

pub struct DaemonServer {
    socket_path: PathBuf,
    cwd: PathBuf,
    branch: String,
    started_at: DateTime<Utc>,
    config: Arc<BrokerConfig>,
    registry: Arc<SupervisorRegistry>,
    tool_runtime: Arc<dyn ToolRuntime>,
    attach: Mutex<AttachState>,
    shutdown: Notify,
}

impl DaemonServer {
    pub fn new(
        socket_path: PathBuf,
        cwd: PathBuf,
        branch: String,
        config: Arc<BrokerConfig>,
        registry: Arc<SupervisorRegistry>,
        tool_runtime: Arc<dyn ToolRuntime>,
    ) -> Self {
        Self {
            socket_path,
            cwd,
            branch,
            started_at: Utc::now(),
            config,
            registry,
            tool_runtime,
            attach: Mutex::new(AttachState {
                slot: None,
                detached_at: None,
            }),
            shutdown: Notify::new(),
        }
    }

    /// Binds the socket, serves connections until a `stop` action or
    /// SIGTERM/SIGINT, then unlinks the socket file.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = socket::bind_listener(&self.socket_path).await?;
        info!(socket = %self.socket_path.display(), "daemon listening");

        #[cfg(unix)]
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = tokio::signal::ctrl_c() => break,
                _ = sigterm.recv() => break,
                accepted = listener.accept() => {
                    let (stream, _addr) = accepted.context("failed to accept daemon client")?;
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(error) = server.handle_connection(stream).await {
                            warn!(%error, "daemon connection failed");
                        }
                    });
                }
            }
        }

        self.registry.cleanup().await;
        socket::cleanup_socket_file(&self.socket_path).await?;
        info!("daemon shut down");
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, stream: UnixStream) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        let read = tokio::time::timeout(
            Duration::from_millis(SOCKET_REQUEST_TIMEOUT_MS),
            reader.read_line(&mut line),
        )
        .await;

        let bytes = match read {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(error)) => return Err(error).context("failed to read daemon request line"),
            Err(_) => return Ok(()),
        };
        if bytes == 0 {
            return Ok(());
        }

        let request: DaemonRequest = match serde_json::from_str(line.trim()) {
            Ok(request) => request,
            Err(_) => {
                write_json_line(&mut write_half, &json!({"ok": false, "error": "invalid_request"})).await?;
                return Ok(());
            }
        };

        match request.action.as_str() {
            "status" => {
                let payload = self.status_payload(false).await;
                write_json_line(&mut write_half, &payload).await
            }
            "info" => {
                let payload = self.status_payload(true).await;
                write_json_line(&mut write_half, &payload).await
            }
            "attach" | "reattach" => {
                self.handle_attach(reader, write_half).await
            }
            "detach" => {
                let mut attach = self.attach.lock().await;
                attach.slot = None;
                attach.detached_at = Some(Utc::now());
                drop(attach);
                write_json_line(&mut write_half, &json!({"ok": true})).await
            }
            "stop" => {
                write_json_line(&mut write_half, &json!({"ok": true})).await?;
                self.shutdown.notify_one();
                Ok(())
            }
            "tool" => {
                let Some(name) = request.tool_name else {
                    return write_json_line(&mut write_half, &json!({"ok": false, "error": "missing tool_name"})).await;
                };
                let params = request.params.unwrap_or(Value::Null);
                match self.tool_runtime.call(&name, params).await {
                    Ok(result) => write_json_line(&mut write_half, &json!({"ok": true, "result": result})).await,
                    Err(error) => write_json_line(&mut write_half, &json!({"ok": false, "error": error.to_string()})).await,
                }
            }
            other => {
                write_json_line(&mut write_half, &json!({"ok": false, "error": format!("unsupported_action:{other}")})).await
            }
        }
    }

    async fn handle_attach(
        self: &Arc<Self>,
        mut reader: BufReader<tokio::net::unix::OwnedReadHalf>,
        mut write_half: tokio::net::unix::OwnedWriteHalf,
    ) -> Result<()> {
        {
            let mut attach = self.attach.lock().await;
            if attach.slot.is_some() {
                write_json_line(&mut write_half, &json!({"ok": false, "error": "already_attached"})).await?;
                return Ok(());
            }
            write_json_line(&mut write_half, &json!({"ok": true, "attached": true})).await?;
            attach.slot = Some(AttachSlot {
                attached_at: Utc::now(),
                write_half: Mutex::new(write_half),
                pong_notify: Arc::new(Notify::new()),
            });
            attach.detached_at = None;
        }

        loop {
            let mut line = String::new();
            let bytes = match reader.read_line(&mut line).await {
                Ok(bytes) => bytes,
                Err(_) => break,
            };
            if bytes == 0 {
                break;
            }

            let Ok(frame) = serde_json::from_str::<HeartbeatFrame>(line.trim()) else {
                continue;
            };
            match frame.kind.as_str() {
                "ping" => {
                    let attach = self.attach.lock().await;
                    if let Some(slot) = &attach.slot {
                        let mut write_half = slot.write_half.lock().await;
                        let _ = write_half.write_all(b"{\"type\":\"pong\"}\n").await;
                    }
                }
                "pong" => {
                    let attach = self.attach.lock().await;
                    if let Some(slot) = &attach.slot {
                        slot.pong_notify.notify_one();
                    }
                }
                _ => {}
            }
        }

        let mut attach = self.attach.lock().await;
        attach.slot = None;
        attach.detached_at = Some(Utc::now());
        Ok(())
    }

    /// Writes `{type:"ping"}` to the live attach connection and waits up to
    /// `HEARTBEAT_TIMEOUT_MS` for the matching `{type:"pong"}`. Drops the
    /// slot and reports dead on failure or timeout.
    async fn check_attach_liveness(&self) -> bool {
        let pong_notify = {
            let attach = self.attach.lock().await;
            let Some(slot) = &attach.slot else { return false };
            let mut write_half = slot.write_half.lock().await;
            if write_half.write_all(b"{\"type\":\"ping\"}\n").await.is_err() {
                drop(write_half);
                drop(attach);
                let mut attach = self.attach.lock().await;
                attach.slot = None;
                attach.detached_at = Some(Utc::now());
                return false;
            }
            slot.pong_notify.clone()
        };

        let alive = tokio::time::timeout(Duration::from_millis(HEARTBEAT_TIMEOUT_MS), pong_notify.notified())
            .await
            .is_ok();
        if !alive {
            let mut attach = self.attach.lock().await;
            attach.slot = None;
            attach.detached_at = Some(Utc::now());
        }
        alive
    }

    async fn status_payload(&self, extended: bool) -> Value {
        let attached = self.check_attach_liveness().await;
        let attach = self.attach.lock().await;
        let mut payload = json!({
            "ok": true,
            "attached": attached,
            "detached": !attached,
            "attachedAt": attach.slot.as_ref().map(|s| s.attached_at.to_rfc3339()),
            "detachedAt": attach.detached_at.map(|t| t.to_rfc3339()),
            "pid": std::process::id(),
            "cwd": self.cwd.display().to_string(),
            "branch": self.branch,
        });

        if extended {
            let uptime = (Utc::now() - self.started_at).num_seconds().max(0);
            let allowed_working_directories: Vec<String> = self
                .config
                .allowed_working_directories
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            if let Value::Object(map) = &mut payload {
                map.insert("startedAt".to_string(), json!(self.started_at.to_rfc3339()));
                map.insert("uptimeSeconds".to_string(), json!(uptime));
                map.insert("socketPath".to_string(), json!(self.socket_path.display().to_string()));
                map.insert(
                    "maxConcurrentProcesses".to_string(),
                    json!(self.config.max_concurrent_processes),
                );
                map.insert(
                    "allowedWorkingDirectories".to_string(),
                    json!(allowed_working_directories),
                );
            }
        }
        payload
    }
}

async fn write_json_line(writer: &mut tokio::net::unix::OwnedWriteHalf, value: &Value) -> Result<()> {
    let payload = serde_json::to_string(value).context("failed to serialize daemon response")?;
    writer.write_all(payload.as_bytes()).await.context("failed to write daemon response")?;
    writer.write_all(b"\n").await.context("failed to write daemon response delimiter")?;
    writer.flush().await.context("failed to flush daemon response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool_runtime::EmptyToolRuntime;
    use tokio::io::AsyncReadExt;

    fn make_server(dir: &std::path::Path) -> Arc<DaemonServer> {
        Arc::new(DaemonServer::new(
            dir.join("daemon.sock"),
            dir.to_path_buf(),
            "main".to_string(),
            Arc::new(BrokerConfig::default()),
            Arc::new(SupervisorRegistry::new(4)),
            Arc::new(EmptyToolRuntime),
        ))
    }

    #[tokio::test]
    async fn status_reports_not_attached_with_no_slot() {
        let dir = tempfile::tempdir().unwrap();
        let server = make_server(dir.path());
        let payload = server.status_payload(false).await;
        assert_eq!(payload["attached"], json!(false));
        assert_eq!(payload["detached"], json!(true));
    }

    #[tokio::test]
    async fn stop_action_round_trips_ok_over_a_real_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("daemon.sock");
        let server = make_server(dir.path());
        let server_for_task = server.clone();
        let handle = tokio::spawn(async move { server_for_task.run().await });

        // give the listener a moment to bind
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut client = socket::connect(&socket_path).await.unwrap();
        client.write_all(b"{\"action\":\"stop\"}\n").await.unwrap();
        let mut response = vec![0u8; 256];
        let n = client.read(&mut response).await.unwrap();
        let text = String::from_utf8_lossy(&response[..n]);
        assert!(text.contains("\"ok\":true"));

        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap().unwrap();
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn invalid_json_yields_invalid_request_error() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("daemon.sock");
        let server = make_server(dir.path());
        let server_for_task = server.clone();
        let handle = tokio::spawn(async move { server_for_task.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut client = socket::connect(&socket_path).await.unwrap();
        client.write_all(b"not json\n").await.unwrap();
        let mut response = vec![0u8; 256];
        let n = client.read(&mut response).await.unwrap();
        let text = String::from_utf8_lossy(&response[..n]);
        assert!(text.contains("invalid_request"));

        server.shutdown.notify_one();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }
}
