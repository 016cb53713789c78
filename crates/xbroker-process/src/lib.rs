//! Low-level child-process spawn and output pump.
//!
//! Owns exactly two concerns: getting a shell child running with the right
//! plumbing, and handing the caller a cancel-safe stream of output chunks
//! it can select! against alongside its own timers. Everything above this
//! (truncation accounting, timers, status transitions) belongs to the
//! execution engine, not here.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::warn;

#[cfg(unix)]
use std::os::unix::process::CommandExt;

/// Environment variables always inherited from the broker's own process,
/// on top of whatever `environment_overrides` the caller supplies.
const INHERITED_ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "LANG", "LC_ALL", "TERM", "USER", "SHELL"];

const READ_BUF_SIZE: usize = 8192;

/// One chunk of output read from a child's stdout or stderr pipe.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub data: Vec<u8>,
    pub is_stderr: bool,
}

/// Spawn `/bin/bash -c <command>` in `working_directory` with a filtered
/// environment. `detached` orphans the child into its own session with
/// stdin ignored, matching the `detached` execution mode's spawn policy.
pub fn spawn(
    command: &str,
    working_directory: &Path,
    environment_overrides: &HashMap<String, String>,
    stdin_data: Option<&[u8]>,
    detached: bool,
) -> Result<Child> {
    let mut cmd = Command::new("/bin/bash");
    cmd.arg("-c").arg(command);
    cmd.current_dir(working_directory);
    cmd.env_clear();
    for key in INHERITED_ENV_ALLOWLIST {
        if let Ok(value) = std::env::var(key) {
            cmd.env(key, value);
        }
    }
    for (key, value) in environment_overrides {
        cmd.env(key, value);
    }

    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    if !detached && stdin_data.is_some() {
        cmd.stdin(std::process::Stdio::piped());
    } else {
        cmd.stdin(std::process::Stdio::null());
    }
    cmd.kill_on_drop(true);

    // Isolate the child into its own process group so a timeout kill can
    // target the whole group, not just the shell.
    // SAFETY: setsid() is async-signal-safe and runs before exec.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let mut child = cmd.spawn().context("failed to spawn command")?;

    if !detached {
        if let Some(data) = stdin_data {
            let data = data.to_vec();
            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    use tokio::io::AsyncWriteExt;
                    if let Err(error) = stdin.write_all(&data).await {
                        warn!(%error, "stdin write failed");
                    }
                    let _ = stdin.shutdown().await;
                });
            }
        }
    }

    Ok(child)
}

/// Cancel-safe multiplexer over a child's stdout/stderr pipes.
///
/// `recv()` is meant to be awaited inside the engine's own `tokio::select!`
/// alongside its timeout timers — it returns `None` once both pipes have
/// reached EOF, never blocking past that point. Both pipes are always read
/// and surfaced: whether stderr is *retained* in an execution's in-memory
/// capture buffer is the engine's decision (`capture_stderr`), not this
/// crate's — the publisher and its subscribers (ring, persisted artifact)
/// see every chunk either way.
pub struct OutputPump {
    stdout: Option<BufReader<ChildStdout>>,
    stderr: Option<BufReader<ChildStderr>>,
}

impl OutputPump {
    /// Takes ownership of `child`'s stdout/stderr handles.
    pub fn new(child: &mut Child) -> Self {
        Self {
            stdout: child.stdout.take().map(BufReader::new),
            stderr: child.stderr.take().map(BufReader::new),
        }
    }

    /// Await the next chunk from either pipe. Returns `None` once both
    /// pipes are exhausted.
    pub async fn recv(&mut self) -> Option<OutputChunk> {
        loop {
            if self.stdout.is_none() && self.stderr.is_none() {
                return None;
            }

            let mut stdout_buf = [0u8; READ_BUF_SIZE];
            let mut stderr_buf = [0u8; READ_BUF_SIZE];

            tokio::select! {
                result = read_or_pending(&mut self.stdout, &mut stdout_buf) => {
                    match result {
                        Some(Ok(0)) | Some(Err(_)) => { self.stdout = None; continue; }
                        Some(Ok(n)) => return Some(OutputChunk { data: stdout_buf[..n].to_vec(), is_stderr: false }),
                        None => continue,
                    }
                }
                result = read_or_pending(&mut self.stderr, &mut stderr_buf) => {
                    match result {
                        Some(Ok(0)) | Some(Err(_)) => { self.stderr = None; continue; }
                        Some(Ok(n)) => return Some(OutputChunk { data: stderr_buf[..n].to_vec(), is_stderr: true }),
                        None => continue,
                    }
                }
            }
        }
    }
}

async fn read_or_pending(
    reader: &mut Option<BufReader<impl tokio::io::AsyncRead + Unpin>>,
    buf: &mut [u8],
) -> Option<std::io::Result<usize>> {
    match reader {
        Some(r) => Some(r.read(buf).await),
        None => std::future::pending().await,
    }
}

/// Send SIGTERM to the child's process group, then SIGKILL after `grace`
/// if it hasn't exited by then.
pub async fn terminate_then_kill(child: &mut Child, grace: std::time::Duration) {
    send_signal(child, libc::SIGTERM);
    let waited = tokio::time::timeout(grace, child.wait()).await;
    if waited.is_err() {
        send_signal(child, libc::SIGKILL);
        let _ = child.wait().await;
    }
}

/// Immediately SIGKILL the child's process group. Used for hard timeouts
/// and explicit stop requests where no grace period applies.
pub fn kill_child_process_group(child: &Child) {
    send_signal(child, libc::SIGKILL);
}

fn send_signal(child: &Child, signal: i32) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: kill() is async-signal-safe; negative pid targets the process group.
            unsafe {
                libc::kill(-(pid as i32), signal);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal;
        let _ = child;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn spawn_runs_echo_and_pump_reports_stdout() {
        let mut child = spawn(
            "echo hello",
            Path::new("/tmp"),
            &HashMap::new(),
            None,
            false,
        )
        .expect("spawn echo");

        let mut pump = OutputPump::new(&mut child);
        let mut collected = Vec::new();
        while let Some(chunk) = pump.recv().await {
            collected.extend_from_slice(&chunk.data);
        }
        let status = child.wait().await.expect("wait for echo");
        assert!(status.success());
        assert_eq!(String::from_utf8_lossy(&collected), "hello\n");
    }

    #[tokio::test]
    async fn pump_surfaces_both_stdout_and_stderr_chunks() {
        let mut child = spawn(
            "echo out; echo err 1>&2",
            Path::new("/tmp"),
            &HashMap::new(),
            None,
            false,
        )
        .expect("spawn combined echo");

        let mut pump = OutputPump::new(&mut child);
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(chunk) = pump.recv().await {
            if chunk.is_stderr {
                stderr.extend_from_slice(&chunk.data);
            } else {
                stdout.extend_from_slice(&chunk.data);
            }
        }
        let _ = child.wait().await;
        assert_eq!(String::from_utf8_lossy(&stdout), "out\n");
        assert_eq!(String::from_utf8_lossy(&stderr), "err\n");
    }

    #[tokio::test]
    async fn terminate_then_kill_stops_a_sleeping_child() {
        let mut child = spawn("sleep 30", Path::new("/tmp"), &HashMap::new(), None, false)
            .expect("spawn sleep");
        terminate_then_kill(&mut child, Duration::from_millis(200)).await;
        let status = child.wait().await.expect("wait after kill");
        assert!(!status.success());
    }

    #[tokio::test]
    async fn environment_overrides_are_visible_to_child() {
        let mut overrides = HashMap::new();
        overrides.insert("XBROKER_TEST_VAR".to_string(), "hi".to_string());
        let mut child = spawn(
            "echo $XBROKER_TEST_VAR",
            Path::new("/tmp"),
            &overrides,
            None,
            false,
        )
        .expect("spawn with env override");

        let mut pump = OutputPump::new(&mut child);
        let mut collected = Vec::new();
        while let Some(chunk) = pump.recv().await {
            collected.extend_from_slice(&chunk.data);
        }
        let _ = child.wait().await;
        assert_eq!(String::from_utf8_lossy(&collected), "hi\n");
    }
}
