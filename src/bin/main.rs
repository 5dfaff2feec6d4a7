use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::process::ExitCode;
use swankbridge::config::{self, BridgeConfig, SettingsEventKind};
use swankbridge::swank::{CommandBridge, Session, default_handlers};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Serve a SLIME editor over SWANK, backed by a Lisp evaluator subprocess
#[derive(Parser)]
#[command(name = "swankbridge")]
#[command(version)]
#[command(about = "Serve a SLIME editor over SWANK, backed by a Lisp evaluator subprocess")]
struct Cli {
    /// Address to listen on for the editor
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on for the editor (0 picks a free port)
    #[arg(long)]
    port: Option<u16>,

    /// Evaluator executable (e.g. irteusgl, roseus)
    #[arg(long)]
    program: Option<String>,

    /// File the evaluator loads before connecting back
    #[arg(long)]
    init_file: Option<PathBuf>,

    /// Pass terminal color escapes through to the editor
    #[arg(long)]
    color: bool,

    /// Configuration file layered over the user configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Bytes requested per read of the evaluator's output
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Output polling and liveness-check interval
    #[arg(long)]
    poll_interval_ms: Option<u64>,
}

impl Cli {
    fn overrides(&self) -> BridgeConfig {
        BridgeConfig {
            host: self.host.clone(),
            port: self.port,
            program: self.program.clone(),
            init_file: self.init_file.clone(),
            color: self.color.then_some(true),
            read_buffer_size: self.buffer_size,
            poll_interval_ms: self.poll_interval_ms,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.log_level.as_str()))
        .init();

    let outcome = config::load_settings(cli.config.as_deref(), cli.overrides());
    for event in &outcome.events {
        match event.kind {
            SettingsEventKind::Info => info!(target: "swankbridge::config", "{}", event.message),
            SettingsEventKind::Warning => warn!(target: "swankbridge::config", "{}", event.message),
        }
    }
    let settings = outcome.settings;

    let listener = match TcpListener::bind((settings.host.as_str(), settings.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(
                "Failed to listen on {}:{}: {}",
                settings.host, settings.port, e
            );
            return ExitCode::FAILURE;
        }
    };
    let port = match listener.local_addr() {
        Ok(addr) => addr.port(),
        Err(e) => {
            error!("Failed to read listening address: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    let mut session = Session::new(settings, shutdown.clone());
    if let Err(report) = session.launch().await {
        // The editor can still connect and pick RESTART from the debugger
        error!("Failed to start evaluator: {}", report);
    }

    eprintln!(";; Swank started at port: {}.", port);

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            ctrl_c.cancel();
        }
    });

    let mut bridge = CommandBridge::new(session, default_handlers());
    match bridge.serve(listener).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Server failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
