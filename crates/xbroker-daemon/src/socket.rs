//! Unix socket bind/connect/cleanup helpers shared by the daemon server and
//! the workspace locator.

#[cfg(not(unix))]
compile_error!("xbroker-daemon requires Unix domain sockets; Windows is not supported");

use std::path::Path;

use anyhow::{Context, Result};
use tokio::net::{UnixListener, UnixStream};

/// Creates the socket's parent directory, removes any stale socket file,
/// binds, then restricts permissions to `0600`.
pub async fn bind_listener(socket_path: &Path) -> Result<UnixListener> {
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create socket directory: {}", parent.display()))?;
    }

    if socket_path.exists() {
        tokio::fs::remove_file(socket_path)
            .await
            .with_context(|| format!("failed to remove stale socket: {}", socket_path.display()))?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("failed to bind unix socket: {}", socket_path.display()))?;
    set_permissions(socket_path, 0o600).await?;
    Ok(listener)
}

pub async fn connect(socket_path: &Path) -> Result<UnixStream> {
    UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("failed to connect unix socket: {}", socket_path.display()))
}

pub async fn cleanup_socket_file(socket_path: &Path) -> Result<()> {
    if socket_path.exists() {
        tokio::fs::remove_file(socket_path)
            .await
            .with_context(|| format!("failed to cleanup socket: {}", socket_path.display()))?;
    }
    // Best-effort: remove the now-empty branch directory so a workspace's
    // runtime-root doesn't accumulate one empty directory per past branch.
    if let Some(parent) = socket_path.parent() {
        let _ = tokio::fs::remove_dir(parent).await;
    }
    Ok(())
}

async fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .with_context(|| format!("failed to chmod {mode:o}: {}", path.display()))
}
