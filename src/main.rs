use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sfdroid_helpers::notify::{self, AppEvent, NotifyError, NotifyKind};
use sfdroid_helpers::Config;

/// sfdroid helpers - app lifecycle notifications for the sfdroid renderer
#[derive(Parser)]
#[command(name = "sfdroid-helpers")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); defaults to the config value
    #[arg(short, long)]
    log_level: Option<String>,

    /// Config file (defaults to ~/.config/sfdroid-helpers/config.toml)
    #[arg(short, long, env = "SFDROID_HELPERS_CONFIG")]
    config: Option<PathBuf>,

    /// Renderer socket path
    #[arg(short, long, env = "SFDROID_SOCKET")]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report that a component started
    Start {
        /// Component name, e.g. com.example/.MainActivity
        component: String,
    },
    /// Report that a component closed
    Close {
        /// Component name, e.g. com.example/.MainActivity
        component: String,
    },
    /// Act as the renderer and print received notifications
    Listen {
        /// Print one JSON object per event
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config {
        /// Also write it to the config file
        #[arg(long)]
        write: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load().unwrap_or_default(),
    };
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    // ログ初期化
    init_logging(&config.log_level)?;

    match cli.command {
        Commands::Start { component } => handle_notify(&config, NotifyKind::Start, &component),
        Commands::Close { component } => handle_notify(&config, NotifyKind::Close, &component),
        Commands::Listen { json } => run_listen(&config, json),
        Commands::Config { write } => show_config(&config, cli.config, write),
    }
}

fn handle_notify(config: &Config, kind: NotifyKind, component: &str) -> Result<()> {
    match notify::send_notification(config, kind, component) {
        Ok(()) => {
            info!("Notification sent successfully");
            Ok(())
        }
        Err(e) if e.is_rejected_input() => Err(e.into()),
        Err(e) => {
            // If socket doesn't exist, the renderer is not running - silently succeed
            if config.socket_path.exists() || !matches!(e, NotifyError::Connect { .. }) {
                eprintln!("Warning: Failed to send notification: {}", e);
            }
            Ok(())
        }
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level: {}", level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

#[derive(Serialize)]
struct ReceivedEvent {
    received_at: chrono::DateTime<chrono::Local>,
    #[serde(flatten)]
    event: AppEvent,
}

fn run_listen(config: &Config, json: bool) -> Result<()> {
    // Create tokio runtime for the listener
    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<AppEvent>(100);

        let listener = notify::server::bind(&config.socket_path)?;
        let max_payload = config.max_payload;
        let server = tokio::spawn(async move {
            if let Err(e) = notify::server::serve(listener, max_payload, tx).await {
                tracing::error!("Notification listener error: {}", e);
            }
        });

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    print_event(event, json)?;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, shutting down");
                    break;
                }
            }
        }

        drop(rx);
        let _ = server.await;
        if let Err(e) = std::fs::remove_file(&config.socket_path) {
            tracing::warn!("Failed to remove socket: {}", e);
        }
        Ok::<(), anyhow::Error>(())
    })
}

fn print_event(event: AppEvent, json: bool) -> Result<()> {
    let received_at = chrono::Local::now();
    if json {
        let line = serde_json::to_string(&ReceivedEvent { received_at, event })
            .context("Failed to serialize event")?;
        println!("{}", line);
    } else {
        let verb = match event.kind() {
            NotifyKind::Start => "started",
            NotifyKind::Close => "closed",
        };
        println!(
            "[{}] {} {}",
            received_at.format("%H:%M:%S%.3f"),
            verb,
            event.component()
        );
    }
    Ok(())
}

fn show_config(config: &Config, path: Option<PathBuf>, write: bool) -> Result<()> {
    print!("{}", toml::to_string_pretty(config)?);

    if write {
        match path {
            Some(path) => config.save_to(&path)?,
            None => config.save()?,
        }
        info!("Configuration saved");
    }
    Ok(())
}
