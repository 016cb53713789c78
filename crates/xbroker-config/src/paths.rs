//! Runtime-root, socket-path, and output-root derivation.
//!
//! Mirrors the teacher's XDG resolution: prefer `$XDG_RUNTIME_DIR`, fall
//! back to a uid-scoped directory under `/tmp` so multiple users on the
//! same host never collide.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

pub const APP_NAME: &str = "xbroker";

fn effective_uid() -> u32 {
    #[cfg(unix)]
    {
        // SAFETY: `geteuid` has no preconditions and returns the caller's uid.
        unsafe { libc::geteuid() }
    }
    #[cfg(not(unix))]
    {
        0
    }
}

/// Resolve the runtime root: `$XDG_RUNTIME_DIR/<app>` or `/tmp/<app>-<uid>`.
pub fn runtime_root(xdg_runtime_dir: Option<&str>) -> PathBuf {
    if let Some(dir) = xdg_runtime_dir {
        return PathBuf::from(dir).join(APP_NAME);
    }
    PathBuf::from("/tmp").join(format!("{APP_NAME}-{}", effective_uid()))
}

/// Hex SHA-256 of the canonicalised workspace path, used to scope socket paths.
pub fn workspace_hash(workspace: &Path) -> String {
    let canonical = workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf());
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `<runtime_root>/<hash>/<branch>/daemon.sock`
pub fn daemon_socket_path(runtime_root: &Path, workspace: &Path, branch: &str) -> PathBuf {
    runtime_root
        .join(workspace_hash(workspace))
        .join(branch)
        .join("daemon.sock")
}

/// Directory under `<runtime_root>/<hash>/*` enumerated by the workspace locator.
pub fn workspace_instances_glob(runtime_root: &Path, workspace: &Path) -> PathBuf {
    runtime_root.join(workspace_hash(workspace))
}

/// Output store root: `output/`, `log/`, `temp/` subdirectories live here.
pub fn output_root(runtime_root: &Path) -> PathBuf {
    runtime_root.join("artifacts")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_root_prefers_xdg_runtime_dir() {
        let path = runtime_root(Some("/run/user/1000"));
        assert_eq!(path, PathBuf::from("/run/user/1000/xbroker"));
    }

    #[test]
    fn runtime_root_falls_back_to_tmp_with_uid() {
        let path = runtime_root(None);
        let rendered = path.to_string_lossy();
        assert!(rendered.starts_with("/tmp/xbroker-"));
    }

    #[test]
    fn workspace_hash_is_stable_for_same_path() {
        let a = workspace_hash(Path::new("/tmp"));
        let b = workspace_hash(Path::new("/tmp"));
        assert_eq!(a, b);
    }

    #[test]
    fn workspace_hash_differs_across_paths() {
        let a = workspace_hash(Path::new("/tmp"));
        let b = workspace_hash(Path::new("/"));
        assert_ne!(a, b);
    }

    #[test]
    fn daemon_socket_path_includes_branch() {
        let root = PathBuf::from("/run/user/1000/xbroker");
        let sock = daemon_socket_path(&root, Path::new("/tmp"), "main");
        assert!(sock.ends_with("main/daemon.sock"));
    }
}
