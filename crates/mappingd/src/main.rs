//! mappingd CLI entry point.
//!
//! Runs the kernel mapping daemon, or talks to a running one.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use kernel_launch::ProcessRegistry;
use kernel_mapping::{LaunchOptions, MappingKernelManager};
use log::info;
use mappingd::client::MappingClient;
use mappingd::daemon::{Daemon, DaemonConfig};
use mappingd::settings::{load_settings, save_settings_to};

#[derive(Parser, Debug)]
#[command(name = "mappingd")]
#[command(about = "Daemon mapping notebook sessions to Jupyter kernels")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Socket path for IPC (default: ~/.cache/kernel-mapping/mappingd.sock)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon (default if no command specified)
    Run {
        /// Kill kernels instead of asking them to shut down when the daemon exits
        #[arg(long)]
        kill_on_exit: bool,
    },

    /// List visible kernels
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Start a kernel
    Start {
        /// Session to associate the kernel with
        #[arg(long)]
        session: Option<String>,

        /// Kernelspec name (default from settings)
        #[arg(long)]
        kernel: Option<String>,
    },

    /// Shutdown a kernel
    Stop {
        kernel_id: String,

        /// Skip the graceful shutdown request
        #[arg(long)]
        now: bool,
    },

    /// Check daemon status
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Print the effective settings
    Settings {
        /// Also write them to this file
        #[arg(long)]
        write: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let socket_path = cli.socket.unwrap_or_else(mappingd::default_socket_path);
    let client = MappingClient::new(socket_path.clone());

    match cli.command.unwrap_or(Commands::Run {
        kill_on_exit: false,
    }) {
        Commands::Run { kill_on_exit } => run_daemon(socket_path, kill_on_exit).await?,

        Commands::List { json } => {
            let kernels = client.list_kernels().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&kernels)?);
            } else if kernels.is_empty() {
                println!("No kernels");
            } else {
                for kernel in kernels {
                    println!("{}  {}", kernel.id, kernel.ws_url);
                }
            }
        }

        Commands::Start { session, kernel } => {
            let options = LaunchOptions {
                session_id: session,
                kernel_name: kernel,
                ..Default::default()
            };
            println!("{}", client.start_kernel(options).await?);
        }

        Commands::Stop { kernel_id, now } => {
            client.shutdown_kernel(&kernel_id, now).await?;
            println!("Kernel {} shut down", kernel_id);
        }

        Commands::Status { json } => match client.status().await {
            Ok(status) if json => println!("{}", serde_json::to_string_pretty(&status)?),
            Ok(status) => {
                println!("mappingd {} running on {:?}", status.version, socket_path);
                println!("  Started:  {}", status.started_at);
                println!(
                    "  Kernels:  {} running, {} visible",
                    status.running_kernels, status.visible_kernels
                );
                println!("  Listing:  {}", status.visibility);
            }
            Err(e) => {
                println!("mappingd is not running ({})", e);
                std::process::exit(1);
            }
        },

        Commands::Settings { write } => {
            let settings = load_settings();
            println!("{}", serde_json::to_string_pretty(&settings)?);
            if let Some(path) = write {
                save_settings_to(&path, &settings)?;
                info!("Settings written to {:?}", path);
            }
        }
    }

    Ok(())
}

async fn run_daemon(socket_path: PathBuf, kill_kernels_on_exit: bool) -> anyhow::Result<()> {
    let settings = load_settings();

    info!("Kernel mapping daemon starting...");
    info!("Configuration:");
    info!("  Socket: {:?}", socket_path);
    info!("  Kernel: {}", settings.kernel_name);
    info!("  Kernel args: {:?}", settings.kernel_argv);
    info!("  Listing: {}", settings.visibility);
    info!("  Restart limit: {}", settings.restart_limit);

    let registry = ProcessRegistry::new(settings.launch_config());
    let manager = MappingKernelManager::new(registry, settings.manager_config());
    let config = DaemonConfig {
        socket_path,
        kill_kernels_on_exit,
    };
    let daemon = Daemon::new(config, manager);

    let signal_daemon = daemon.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            signal_daemon.request_shutdown();
        }
    });

    daemon.run().await
}
