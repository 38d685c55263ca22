//! Warden - local intercepting proxy with transparent redirect rules.
//!
//! `warden run` starts the proxy (and, on rooted hosts, the redirect rules)
//! and keeps it up until Ctrl-C. The other subcommands are maintenance
//! actions that work without a running proxy.

use std::panic;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use warden_app::{
    delete_captured_data, LogBufferLayer, ServiceContext, ServiceController, PANIC_TARGET,
};
use warden_core::{LogBuffer, RootDetector, RulePolicy};
use warden_proxy::{
    process_identity, CaManager, MitmProxyFactory, PrivilegedShell, ProxyConfig,
    TransparentProxyController,
};
use warden_storage::{Database, Settings, DATABASE_FILE};

/// Warden - local intercepting proxy with transparent redirect rules
#[derive(Parser, Debug)]
#[command(name = "warden", version, about)]
struct Args {
    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory for the database, CA, logs and captured content
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the proxy and keep it running until interrupted
    Run {
        /// Listen on this port instead of the configured one
        #[arg(long)]
        port: Option<u16>,

        /// Command line that opens a root shell (default: "su -c sh")
        #[arg(long)]
        shell: Option<String>,

        /// File rewritten with the log view on every update
        #[arg(long)]
        log_view: Option<PathBuf>,
    },

    /// Remove the transparent proxy rules
    ClearRules {
        /// Command line that opens a root shell (default: "su -c sh")
        #[arg(long)]
        shell: Option<String>,
    },

    /// Delete captured exchanges and their content files
    DeleteData,

    /// Write the root CA certificate to a file (.der or .cer for DER)
    ExportCa {
        /// Destination file
        dest: PathBuf,
    },

    /// Print settings and host state
    Status,
}

#[derive(Debug, Serialize)]
struct Status {
    settings: Settings,
    database: PathBuf,
    captures: i64,
    rooted: bool,
    identity: Option<u32>,
    ca_certificate: Option<PathBuf>,
}

/// Initialize logging with file rotation and the log view layer.
fn init_logging(args: &Args, log_dir: &Path, buffer: &LogBuffer) -> Option<WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warden={0},warden_app={0},warden_core={0},warden_storage={0},warden_proxy={0},warn",
            log_level
        ))
    });

    let appender = std::fs::create_dir_all(log_dir).ok().and_then(|_| {
        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .max_log_files(5)
            .filename_prefix("warden")
            .filename_suffix("log")
            .build(log_dir)
            .ok()
    });

    let (file_layer, guard) = match appender {
        Some(appender) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(non_blocking).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(LogBufferLayer::new(buffer.clone()).with_filter(LevelFilter::INFO))
        .init();

    if guard.is_some() {
        tracing::info!("Logging to {:?}", log_dir);
    } else {
        tracing::warn!("File logging unavailable, using console only");
    }

    guard
}

/// Splits a shell command line into program and arguments.
fn parse_shell(command_line: Option<&str>) -> PrivilegedShell {
    let mut parts = command_line.unwrap_or_default().split_whitespace();
    match parts.next() {
        Some(program) => PrivilegedShell::new(program, parts),
        None => PrivilegedShell::default(),
    }
}

fn transparent_controller(shell: Option<&str>) -> TransparentProxyController {
    let identity = process_identity()
        .map(|uid| uid.to_string())
        .unwrap_or_else(|| "0".to_string());

    TransparentProxyController::new(RulePolicy::default(), parse_shell(shell), identity)
}

fn ca_manager(data_dir: &Path) -> CaManager {
    CaManager::new(data_dir.join("ca"))
}

/// Run the proxy until Ctrl-C.
async fn run(
    data_dir: PathBuf,
    settings: Settings,
    buffer: LogBuffer,
    port: Option<u16>,
    shell: Option<String>,
    log_view: Option<PathBuf>,
) -> anyhow::Result<()> {
    // Log panics from worker threads to file; the log view skips this target
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        tracing::error!(target: PANIC_TARGET, "PANIC: {}", panic_info);
        default_hook(panic_info);
    }));

    if let Some(path) = log_view {
        tracing::info!("Writing log view to {:?}", path);
        buffer.subscribe(move |text| {
            let _ = std::fs::write(&path, text);
        });
    }

    let runtime = tokio::runtime::Handle::current();
    let config = ProxyConfig::new(
        port.unwrap_or(settings.proxy_port),
        settings.listen_non_local,
        ca_manager(&data_dir),
    );
    let factory = MitmProxyFactory::new(config, runtime.clone());
    let transparent = transparent_controller(shell.as_deref()).with_log_buffer(buffer);

    let context = ServiceContext::new(&data_dir, Arc::new(factory), transparent);
    let controller = ServiceController::new(context, runtime);

    if let Err(e) = controller.start().wait().await {
        tracing::warn!("Proxy service started with errors: {}", e);
    }

    if !controller.is_running() {
        anyhow::bail!("Proxy service failed to start");
    }

    tracing::info!("Warden is running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    if let Err(e) = controller.stop().wait().await {
        tracing::warn!("Proxy service stopped with errors: {}", e);
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let data_dir = match &args.data_dir {
        Some(dir) => dir.clone(),
        None => Database::default_data_dir()?,
    };

    // Keep the guard alive for the duration of the program
    let buffer = LogBuffer::default();
    let _log_guard = init_logging(&args, &data_dir.join("logs"), &buffer);

    tracing::info!("Starting Warden...");
    tracing::debug!("Args: {:?}", args);

    let store = Database::open_in(&data_dir)
        .map_err(|e| anyhow::anyhow!("Database error: {}", e))?;
    let settings = store.init_settings(&Settings::defaults(&data_dir))?;

    let command = args.command.unwrap_or(Command::Run {
        port: None,
        shell: None,
        log_view: None,
    });

    match command {
        Command::Run {
            port,
            shell,
            log_view,
        } => {
            drop(store);
            run(data_dir, settings, buffer, port, shell, log_view).await?;
        }
        Command::ClearRules { shell } => {
            let report = transparent_controller(shell.as_deref()).clear()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::DeleteData => {
            let report = delete_captured_data(&store, &settings.content_dir())?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::ExportCa { dest } => {
            let path = ca_manager(&data_dir).export(&dest)?;
            println!("{}", path.display());
        }
        Command::Status => {
            let ca = ca_manager(&data_dir);
            let status = Status {
                database: data_dir.join(DATABASE_FILE),
                captures: store.count_captures()?,
                rooted: RootDetector::new().is_rooted(),
                identity: process_identity(),
                ca_certificate: ca.ca_exists().then(|| ca.cert_path()),
                settings,
            };
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    tracing::info!("Warden shutting down");
    Ok(())
}
