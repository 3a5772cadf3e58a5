//! warden CLI
//!
//! `warden daemon <config>` runs the supervisor in the foreground; the
//! other subcommands talk to a running daemon over its control socket.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use warden::control::{self, ControlClient, ControlCommand, ControlResponse, ControlServer};
use warden::manager::{AppManager, ManagerConfig};
use warden::InstanceStatus;

#[derive(Parser)]
#[command(
    name = "warden",
    about = "Process supervisor - bounded restart policies, log multiplexing, graceful shutdown",
    version
)]
struct Cli {
    /// Control socket path
    #[arg(short, long, global = true)]
    socket: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor daemon in the foreground
    Daemon {
        /// App configuration file
        config: PathBuf,

        /// Directory for sockets (defaults to $XDG_RUNTIME_DIR/warden)
        #[arg(long)]
        runtime_dir: Option<PathBuf>,

        /// Directory for default log files (defaults to ~/.warden/logs)
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },

    /// Start an app
    Start { name: String },

    /// Gracefully stop an app
    Stop { name: String },

    /// Restart an app
    Restart { name: String },

    /// Re-read the config file and restart an app
    Reload { name: String },

    /// Show per-instance status of an app
    Status { name: String },

    /// List all registered apps
    List,

    /// Shut the supervisor down
    Shutdown,

    /// Check whether the supervisor is responding
    Ping,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Daemon {
            config,
            runtime_dir,
            log_dir,
        } => run_daemon(config, runtime_dir, log_dir, cli.socket).await,
        Commands::Start { name } => {
            client_command(cli.socket, ControlCommand::Start { name }).await
        }
        Commands::Stop { name } => client_command(cli.socket, ControlCommand::Stop { name }).await,
        Commands::Restart { name } => {
            client_command(cli.socket, ControlCommand::Restart { name }).await
        }
        Commands::Reload { name } => {
            client_command(cli.socket, ControlCommand::Reload { name }).await
        }
        Commands::Status { name } => {
            client_command(cli.socket, ControlCommand::Status { name }).await
        }
        Commands::List => client_command(cli.socket, ControlCommand::List).await,
        Commands::Shutdown => client_command(cli.socket, ControlCommand::Shutdown).await,
        Commands::Ping => client_command(cli.socket, ControlCommand::Ping).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_daemon(
    config_path: PathBuf,
    runtime_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    socket: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut manager_config = ManagerConfig::new(config_path);
    if let Some(dir) = runtime_dir {
        manager_config.runtime_dir = dir;
    }
    if let Some(dir) = log_dir {
        manager_config.log_dir = dir;
    }
    let socket = socket
        .unwrap_or_else(|| manager_config.runtime_dir.join(control::CONTROL_SOCKET_NAME));

    let manager = Arc::new(AppManager::new(manager_config));
    let count = manager.load_apps().await?;
    info!(apps = count, "Configuration loaded");

    let mut server = ControlServer::new(&socket);
    server.start().await?;

    manager.start_all().await;

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    info!("Supervisor ready, entering event loop");

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = shutdown_rx.recv() => break,
            conn = server.accept() => match conn {
                Ok(mut stream) => {
                    let manager = Arc::clone(&manager);
                    let shutdown_tx = shutdown_tx.clone();
                    tokio::spawn(async move {
                        match ControlServer::read_command(&mut stream).await {
                            Ok(command) => {
                                let response =
                                    control::dispatch(&manager, &shutdown_tx, command).await;
                                if let Err(error) =
                                    ControlServer::write_response(&mut stream, &response).await
                                {
                                    warn!(%error, "Failed to write control response");
                                }
                            }
                            Err(error) => warn!(%error, "Failed to read control command"),
                        }
                    });
                }
                Err(error) => warn!(%error, "Control accept failed"),
            },
        }
    }

    manager.stop_all().await;
    info!("Supervisor stopped");
    Ok(())
}

async fn client_command(socket: Option<PathBuf>, command: ControlCommand) -> anyhow::Result<()> {
    let socket = socket.unwrap_or_else(control::default_socket_path);
    let client = ControlClient::new(socket);
    let response = client.send_command(command).await?;
    render(response)
}

fn render(response: ControlResponse) -> anyhow::Result<()> {
    match response {
        ControlResponse::Success { message } => {
            println!("{}", message);
            Ok(())
        }
        ControlResponse::Error { message } => Err(anyhow::anyhow!(message)),
        ControlResponse::Pong => {
            println!("pong");
            Ok(())
        }
        ControlResponse::Status { app, instances } => {
            for status in instances {
                println!("{}", format_instance(&app, &status));
            }
            Ok(())
        }
        ControlResponse::AppList { apps } => {
            println!(
                "{:<20} {:<10} {:<8} {:>9} {:>8} {:>9}",
                "NAME", "STATE", "MODE", "INSTANCES", "RUNNING", "RESTARTS"
            );
            for app in apps {
                println!(
                    "{:<20} {:<10} {:<8} {:>9} {:>8} {:>9}",
                    app.name, app.state, app.mode, app.instances, app.running, app.restarts
                );
            }
            Ok(())
        }
    }
}

fn format_instance(app: &str, status: &InstanceStatus) -> String {
    let pid = status
        .pid
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".to_string());
    let uptime = status
        .uptime()
        .filter(|_| status.state.is_active())
        .map(|u| format!("{}s", u.as_secs()))
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!(
        "{}:{} {} pid={} uptime={} restarts={}",
        app, status.instance, status.state, pid, uptime, status.restart_count
    );
    if let Some(reason) = &status.failure_reason {
        line.push_str(&format!(" ({})", reason));
    }
    line
}
