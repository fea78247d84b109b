//! StayTerm server
//!
//! Keeps shell sessions alive for remote terminals across dropped connections.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use daemon::config::{Config, EnvOverride};
use daemon::ipc::{self, pidfile, IpcResponse, RegistrationService};
use daemon::server::Dispatcher;
use daemon::session::SessionRegistry;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Name of the rolling log file used when detached.
const LOG_FILE_NAME: &str = "stayterm-server.log";

/// StayTerm server - persistent shell sessions for remote terminals.
#[derive(Parser, Debug)]
#[command(name = "stayterm-server")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Port to listen on (overrides the configuration)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Detach from the terminal and run in the background
    #[arg(short, long)]
    pub daemon: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Register a client with the running server and exit
    #[arg(long, value_name = "ID/KEY", conflicts_with = "idpasskeyfile")]
    pub idpasskey: Option<String>,

    /// Like --idpasskey, reading ID/KEY from a file that is deleted afterwards
    #[arg(long, value_name = "PATH")]
    pub idpasskeyfile: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, overrides) = load_config(&cli)?;

    if let Some((client_id, passkey)) = registration_request(&cli)? {
        init_logging(&cli, &config, false)?;
        overrides.iter().for_each(EnvOverride::log);
        return build_runtime()?.block_on(register(&config, &client_id, &passkey));
    }

    let pid_path = config.daemon.pid_file_path();
    if let Some(pid) = pidfile::get_daemon_pid(&pid_path) {
        bail!("stayterm-server is already running (PID: {})", pid);
    }

    // Detach before any runtime threads exist.
    if cli.daemon {
        nix::unistd::daemon(false, false).context("Failed to detach from terminal")?;
    }

    let _guard = init_logging(&cli, &config, cli.daemon)?;
    overrides.iter().for_each(EnvOverride::log);
    build_runtime()?.block_on(serve(config))
}

/// Load the configuration with environment and command line overrides.
/// The environment overrides are returned so they can be logged once logging
/// is up.
fn load_config(cli: &Cli) -> Result<(Config, Vec<EnvOverride>)> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    let overrides = config.apply_env_overrides();
    if let Some(port) = cli.port {
        config.network.port = port;
    }
    config.validate()?;

    Ok((config, overrides))
}

/// The `ID/KEY` pair from `--idpasskey` or `--idpasskeyfile`, if either was given.
fn registration_request(cli: &Cli) -> Result<Option<(String, String)>> {
    if let Some(pair) = &cli.idpasskey {
        return parse_id_passkey(pair).map(Some);
    }

    match &cli.idpasskeyfile {
        Some(path) => {
            let pair = read_id_passkey_file(path)?;
            parse_id_passkey(&pair).map(Some)
        }
        None => Ok(None),
    }
}

fn read_id_passkey_file(path: &Path) -> Result<String> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    fs::remove_file(path).with_context(|| format!("Failed to delete {}", path.display()))?;
    Ok(contents.trim().to_string())
}

/// Split `ID/KEY` at the first slash.
fn parse_id_passkey(pair: &str) -> Result<(String, String)> {
    match pair.split_once('/') {
        Some((id, key)) if !id.is_empty() && !key.is_empty() => {
            Ok((id.to_string(), key.to_string()))
        }
        _ => bail!("Expected ID/KEY, got {:?}", pair),
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

/// Install the tracing subscriber. Detached servers log to a daily file in
/// the data directory; the returned guard flushes it on drop.
fn init_logging(cli: &Cli, config: &Config, to_file: bool) -> Result<Option<WorkerGuard>> {
    let level = if cli.verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if !to_file {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    }

    fs::create_dir_all(&config.daemon.data_dir).with_context(|| {
        format!(
            "Failed to create data directory {}",
            config.daemon.data_dir.display()
        )
    })?;
    let appender = tracing_appender::rolling::daily(&config.daemon.data_dir, LOG_FILE_NAME);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    Ok(Some(guard))
}

/// Send a `Register` request to the running server.
async fn register(config: &Config, client_id: &str, passkey: &str) -> Result<()> {
    let socket_path = config.daemon.ipc_socket_path();
    let fallback = config.daemon.ipc_socket_fallback();
    let mut client = ipc::connect_with_fallback(&socket_path, fallback.as_deref())
        .await
        .with_context(|| {
            format!(
                "Could not reach stayterm-server at {}. Is it running?",
                socket_path.display()
            )
        })?;

    match client.register(client_id, passkey).await? {
        IpcResponse::Registered { client_id } => {
            println!("Registered client {}", client_id);
            Ok(())
        }
        IpcResponse::Error { message } => bail!("Registration failed: {}", message),
        other => bail!("Unexpected response from server: {:?}", other),
    }
}

async fn serve(config: Config) -> Result<()> {
    let pid_path = config.daemon.pid_file_path();
    pidfile::write_pid_file(&pid_path)
        .with_context(|| format!("Failed to write PID file {}", pid_path.display()))?;

    let result = run_server(&config).await;
    pidfile::remove_pid_file(&pid_path);
    result
}

async fn run_server(config: &Config) -> Result<()> {
    let registry = SessionRegistry::new();
    let dispatcher = Dispatcher::bind(config, registry.clone()).await?;
    let stop = dispatcher.stop_token();

    let primary = config.daemon.ipc_socket_path();
    let fallback = config.daemon.ipc_socket_fallback();
    let (ipc_server, socket_path) = ipc::bind_with_fallback(&primary, fallback.as_deref())
        .await
        .with_context(|| format!("Failed to bind IPC socket {}", primary.display()))?;
    let service = tokio::spawn(RegistrationService::new(ipc_server, registry, stop.clone()).run());

    tracing::info!(
        port = config.network.port,
        pid = std::process::id(),
        socket = %socket_path.display(),
        "stayterm-server started"
    );
    let handle = dispatcher.spawn();

    tokio::select! {
        result = wait_for_shutdown_signal() => result?,
        _ = stop.cancelled() => tracing::info!("Stop requested"),
    }

    handle.halt().await;
    if let Err(e) = service.await {
        tracing::warn!(error = %e, "Registration service task failed");
    }
    let _ = fs::remove_file(&socket_path);

    tracing::info!("stayterm-server stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
    Ok(())
}
