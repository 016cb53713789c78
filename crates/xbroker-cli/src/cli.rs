use clap::{Parser, Subcommand};
use xbroker_core::OutputId;

#[derive(Parser)]
#[command(name = "xbroker", version, about = "Process execution broker: run, supervise, and stream long-lived commands")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a command through the engine and print the resulting record as JSON.
    Execute {
        /// Command line to run, passed to a shell.
        command: String,

        #[arg(long, default_value = "foreground")]
        mode: String,

        #[arg(long)]
        cwd: Option<String>,

        /// `KEY=VALUE` environment overrides; may be repeated.
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env_overrides: Vec<String>,

        #[arg(long, default_value_t = 30)]
        timeout_seconds: u64,

        #[arg(long)]
        foreground_timeout_seconds: Option<u64>,

        #[arg(long, default_value_t = 1024 * 1024)]
        max_output_size: usize,

        #[arg(long, default_value_t = true)]
        capture_stderr: bool,

        #[arg(long, default_value_t = false)]
        return_partial_on_timeout: bool,

        /// Read stdin from an existing output artifact instead of this process's stdin.
        #[arg(long)]
        input_output_id: Option<OutputId>,

        #[arg(long)]
        session_id: Option<String>,
    },

    /// Daemon lifecycle and attach-session management.
    Daemon {
        #[command(subcommand)]
        cmd: DaemonCommands,
    },
}

#[derive(Subcommand)]
pub enum DaemonCommands {
    /// Start the daemon for the current workspace/branch.
    Serve {
        /// Run in this process instead of forking a detached background copy.
        #[arg(long)]
        foreground: bool,

        #[arg(long)]
        branch: Option<String>,
    },

    /// Query `{ok, attached, detached, pid, cwd, branch}`.
    Status {
        #[arg(long)]
        branch: Option<String>,
    },

    /// Query the extended status payload (`startedAt`, `uptimeSeconds`, `socketPath`).
    Info {
        #[arg(long)]
        branch: Option<String>,
    },

    /// Bind this connection as the live attach session and forward heartbeats.
    Attach {
        #[arg(long)]
        branch: Option<String>,
    },

    /// Drop the current attach session.
    Detach {
        #[arg(long)]
        branch: Option<String>,
    },

    /// Ask the daemon to shut down and unlink its socket.
    Stop {
        #[arg(long)]
        branch: Option<String>,
    },

    /// List attachable daemons for the current workspace across all branches.
    List,
}
