//! Env-driven configuration, resolved once at startup and threaded by
//! reference — nothing downstream reads `std::env` directly.

use std::path::PathBuf;

use anyhow::{Context, Result};

pub const DEFAULT_MAX_CONCURRENT_PROCESSES: usize = 8;
pub const DEFAULT_MAX_OUTPUT_SIZE: usize = 10 * 1024 * 1024;
const DEFAULT_BRANCH: &str = "main";

/// Resolved broker configuration. Built once in `main` via [`BrokerConfig::from_env`].
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub default_working_directory: PathBuf,
    pub allowed_working_directories: Vec<PathBuf>,
    pub enable_streaming: bool,
    pub security_mode: Option<String>,
    pub max_execution_time_secs: Option<u64>,
    pub max_memory_mb: Option<u64>,
    pub enable_network: bool,
    pub daemon_enabled: bool,
    pub daemon_entry: Option<PathBuf>,
    pub xdg_runtime_dir: Option<String>,
    pub branch: String,
    /// Ambient addition: concurrency cap is part of the admission invariant
    /// (spec §3/§5) but the wire spec never names an env var for it, so this
    /// repo exposes one (`XBROKER_MAX_CONCURRENT_PROCESSES`) for parity with
    /// every other numeric ceiling being env-configurable.
    pub max_concurrent_processes: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_working_directory: std::env::temp_dir(),
            allowed_working_directories: vec![std::env::temp_dir()],
            enable_streaming: true,
            security_mode: None,
            max_execution_time_secs: None,
            max_memory_mb: None,
            enable_network: true,
            daemon_enabled: true,
            daemon_entry: None,
            xdg_runtime_dir: None,
            branch: DEFAULT_BRANCH.to_string(),
            max_concurrent_processes: DEFAULT_MAX_CONCURRENT_PROCESSES,
        }
    }
}

impl BrokerConfig {
    /// Build configuration from the environment variables named in the
    /// external-interfaces section: `DEFAULT_WORKDIR`, `ALLOWED_WORKDIRS`,
    /// `ENABLE_STREAMING`, `SECURITY_MODE`, `MAX_EXECUTION_TIME`,
    /// `MAX_MEMORY_MB`, `ENABLE_NETWORK`, `DAEMON_ENABLED`, `DAEMON_ENTRY`,
    /// `XDG_RUNTIME_DIR`.
    pub fn from_env() -> Result<Self> {
        let cwd = std::env::current_dir().context("failed to resolve current directory")?;

        let default_working_directory = env_path("DEFAULT_WORKDIR").unwrap_or_else(|| cwd.clone());

        let mut allowed_working_directories: Vec<PathBuf> = std::env::var("ALLOWED_WORKDIRS")
            .ok()
            .map(|raw| raw.split(',').map(PathBuf::from).collect())
            .unwrap_or_default();
        if allowed_working_directories.is_empty() {
            allowed_working_directories.push(default_working_directory.clone());
        }

        let enable_streaming = env_bool("ENABLE_STREAMING", true);
        let enable_network = env_bool("ENABLE_NETWORK", true);
        let daemon_enabled = env_bool("DAEMON_ENABLED", true);

        let security_mode = std::env::var("SECURITY_MODE").ok();
        let max_execution_time_secs = env_u64("MAX_EXECUTION_TIME");
        let max_memory_mb = env_u64("MAX_MEMORY_MB");
        let daemon_entry = env_path("DAEMON_ENTRY");
        let xdg_runtime_dir = std::env::var("XDG_RUNTIME_DIR").ok();
        let max_concurrent_processes = env_u64("XBROKER_MAX_CONCURRENT_PROCESSES")
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_CONCURRENT_PROCESSES);

        Ok(Self {
            default_working_directory,
            allowed_working_directories,
            enable_streaming,
            security_mode,
            max_execution_time_secs,
            max_memory_mb,
            enable_network,
            daemon_enabled,
            daemon_entry,
            xdg_runtime_dir,
            branch: DEFAULT_BRANCH.to_string(),
            max_concurrent_processes,
        })
    }

    /// Whether `candidate`, once canonicalised, sits under one of the
    /// configured allowed roots (prefix match, per spec admission rule 2).
    pub fn is_allowed_working_directory(&self, candidate: &std::path::Path) -> bool {
        let canonical = candidate
            .canonicalize()
            .unwrap_or_else(|_| candidate.to_path_buf());
        self.allowed_working_directories.iter().any(|root| {
            let root_canonical = root.canonicalize().unwrap_or_else(|_| root.clone());
            canonical.starts_with(&root_canonical)
        })
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().map(PathBuf::from)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(value) => value.to_ascii_lowercase() != "false",
        Err(_) => default,
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
