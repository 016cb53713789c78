//! Enumerates attachable daemons for a workspace: live sockets get a probed
//! status, stale ones are cleaned up.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use xbroker_config::paths;

use crate::socket;

pub const SOCKET_CONNECT_TIMEOUT_MS: u64 = 250;

#[derive(Debug, Clone, Serialize)]
pub struct AttachableDaemon {
    pub server_id: String,
    pub socket_path: PathBuf,
    pub status: Option<Value>,
    pub attachable: bool,
    pub reason: Option<String>,
}

/// Scans `<runtime_root>/<hash>/*/daemon.sock`, probing each socket with a
/// bounded-time connect; removes socket files whose probe fails and skips
/// them, queries `status` on the ones that answer.
pub async fn list_attachable(runtime_root: &Path, workspace: &Path) -> Vec<AttachableDaemon> {
    let instances_dir = paths::workspace_instances_glob(runtime_root, workspace);
    let mut results = Vec::new();

    let mut entries = match tokio::fs::read_dir(&instances_dir).await {
        Ok(entries) => entries,
        Err(_) => return results,
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let branch_dir = entry.path();
        if !branch_dir.is_dir() {
            continue;
        }
        let socket_path = branch_dir.join("daemon.sock");
        if !socket_path.exists() {
            continue;
        }

        let server_id = branch_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match probe(&socket_path).await {
            Ok(status) => results.push(AttachableDaemon {
                server_id,
                socket_path,
                status: Some(status),
                attachable: true,
                reason: None,
            }),
            Err(reason) => {
                let _ = socket::cleanup_socket_file(&socket_path).await;
                results.push(AttachableDaemon {
                    server_id,
                    socket_path,
                    status: None,
                    attachable: false,
                    reason: Some(reason),
                });
            }
        }
    }

    results
}

async fn probe(socket_path: &Path) -> Result<Value, String> {
    let connect = tokio::time::timeout(
        Duration::from_millis(SOCKET_CONNECT_TIMEOUT_MS),
        socket::connect(socket_path),
    )
    .await
    .map_err(|_| "connect_timeout".to_string())?
    .map_err(|error| error.to_string())?;

    let mut stream = connect;
    stream
        .write_all(b"{\"action\":\"status\"}\n")
        .await
        .map_err(|error| error.to_string())?;

    let mut line = String::new();
    let mut reader = BufReader::new(stream);
    tokio::time::timeout(
        Duration::from_millis(SOCKET_CONNECT_TIMEOUT_MS),
        reader.read_line(&mut line),
    )
    .await
    .map_err(|_| "status_timeout".to_string())?
    .map_err(|error| error.to_string())?;

    serde_json::from_str(line.trim()).map_err(|error| error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_runtime_root_yields_no_instances() {
        let dir = tempfile::tempdir().unwrap();
        let results = list_attachable(dir.path(), Path::new("/tmp")).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn dead_socket_file_is_cleaned_up_and_reported_unattachable() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("workspace");
        std::fs::create_dir_all(&workspace).unwrap();
        let hash = xbroker_config::paths::workspace_hash(&workspace);
        let branch_dir = dir.path().join(&hash).join("main");
        std::fs::create_dir_all(&branch_dir).unwrap();
        let socket_path = branch_dir.join("daemon.sock");
        // A plain file, not a listening socket: connect will fail fast.
        std::fs::write(&socket_path, b"stale").unwrap();

        let results = list_attachable(dir.path(), &workspace).await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].attachable);
        assert!(!socket_path.exists());
    }
}
