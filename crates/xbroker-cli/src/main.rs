use anyhow::Result;
use clap::Parser;

mod cli;
mod daemon_cmd;
mod execute_cmd;

use cli::{Cli, Commands, DaemonCommands};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::Execute {
            command,
            mode,
            cwd,
            env_overrides,
            timeout_seconds,
            foreground_timeout_seconds,
            max_output_size,
            capture_stderr,
            return_partial_on_timeout,
            input_output_id,
            session_id,
        } => {
            execute_cmd::handle_execute(
                command,
                mode,
                cwd,
                env_overrides,
                timeout_seconds,
                foreground_timeout_seconds,
                max_output_size,
                capture_stderr,
                return_partial_on_timeout,
                input_output_id,
                session_id,
            )
            .await?;
        }
        Commands::Daemon { cmd } => match cmd {
            DaemonCommands::Serve { foreground, branch } => {
                daemon_cmd::handle_serve(foreground, branch).await?;
            }
            DaemonCommands::Status { branch } => {
                daemon_cmd::handle_status(branch).await?;
            }
            DaemonCommands::Info { branch } => {
                daemon_cmd::handle_info(branch).await?;
            }
            DaemonCommands::Attach { branch } => {
                daemon_cmd::handle_attach(branch).await?;
            }
            DaemonCommands::Detach { branch } => {
                daemon_cmd::handle_detach(branch).await?;
            }
            DaemonCommands::Stop { branch } => {
                daemon_cmd::handle_stop(branch).await?;
            }
            DaemonCommands::List => {
                daemon_cmd::handle_list().await?;
            }
        },
    }

    Ok(())
}
