use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use beacon_relay::config::{AppConfig, ConfigStore, StreamMode};
use beacon_relay::relay::{
    CoordinatorSettings, FanoutNotifier, NegotiationCoordinator, StreamRegistry,
};
use beacon_relay::state::AppState;
use beacon_relay::web;
use beacon_relay::webrtc::{MdnsMode, RtcEngine};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// Beacon Relay command line arguments
#[derive(Parser, Debug)]
#[command(name = "beacon-relay")]
#[command(version, about = "One-to-many WebRTC signaling relay", long_about = None)]
struct CliArgs {
    /// Listen address (overrides config file)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides config file and $BEACON_RELAY_PORT / $PORT)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Config file path (default: $BEACON_RELAY_CONFIG or ./beacon-relay.json)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Stream mode: single or multi (overrides config file)
    #[arg(short = 'm', long, value_name = "MODE")]
    mode: Option<StreamMode>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Settings taken from the environment and command line instead of the file
#[derive(Debug, Clone, Default, PartialEq)]
struct Overrides {
    bind_address: Option<String>,
    http_port: Option<u16>,
    mode: Option<StreamMode>,
    mdns_mode: Option<MdnsMode>,
}

impl Overrides {
    fn from_env_and_args(args: &CliArgs) -> Self {
        Self::from_lookup(args, |key| std::env::var(key).ok())
    }

    /// CLI flags win over environment variables
    fn from_lookup<F>(args: &CliArgs, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_port = ["BEACON_RELAY_PORT", "PORT"]
            .iter()
            .find_map(|key| env(key).map(|raw| (*key, raw)))
            .and_then(|(key, raw)| match raw.trim().parse::<u16>() {
                Ok(port) => Some(port),
                Err(_) => {
                    tracing::warn!("Ignoring invalid {}: {}", key, raw);
                    None
                }
            });

        let mdns_mode = env("BEACON_RELAY_MDNS_MODE").and_then(|raw| {
            let mode = MdnsMode::parse(&raw);
            if mode.is_none() {
                tracing::warn!("Ignoring invalid BEACON_RELAY_MDNS_MODE: {}", raw);
            }
            mode
        });

        Self {
            bind_address: args.address.clone(),
            http_port: args.port.or(env_port),
            mode: args.mode,
            mdns_mode,
        }
    }

    fn apply(&self, config: &mut AppConfig) {
        if let Some(addr) = &self.bind_address {
            config.web.bind_address = addr.clone();
        }
        if let Some(port) = self.http_port {
            config.web.http_port = port;
        }
        if let Some(mode) = self.mode {
            config.relay.mode = mode;
        }
        if let Some(mode) = self.mdns_mode {
            config.webrtc.mdns_mode = mode;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = CliArgs::parse();

    // Initialize logging with CLI arguments
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting Beacon Relay v{}", env!("CARGO_PKG_VERSION"));

    // Initialize configuration store
    let config_path = args.config.clone().unwrap_or_else(get_config_path);
    tracing::info!("Config file: {}", config_path.display());
    let config_store = ConfigStore::open(&config_path).await?;

    // Environment and CLI overrides; re-applied on every reload
    let overrides = Overrides::from_env_and_args(&args);
    config_store.apply_overrides(|config| overrides.apply(config));
    let config = config_store.get();

    log_config(&config);

    // Relay core
    let notifier = Arc::new(FanoutNotifier::new(config.relay.notifier_capacity));
    let registry = StreamRegistry::with_notifier(config.relay.candidate_capacity, notifier);
    let engine = Arc::new(RtcEngine::new(config.webrtc.mdns_mode));
    let coordinator =
        NegotiationCoordinator::new(engine, registry, CoordinatorSettings::from(&*config));

    let shutdown = CancellationToken::new();
    let state = AppState::new(config_store.clone(), coordinator.clone(), shutdown.clone());

    // Background tasks
    let sweeper = coordinator.spawn_sweeper(shutdown.clone());
    spawn_settings_watcher(config_store.clone(), coordinator.clone(), shutdown.clone());
    spawn_reload_on_hangup(config_store, overrides, shutdown.clone());

    // Create router
    let app = web::create_router(state.clone());

    let addr: SocketAddr = format!("{}:{}", config.web.bind_address, config.web.http_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen address: {}", e))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Starting HTTP server on {}", listener.local_addr()?);

    // Setup graceful shutdown
    let shutdown_signal = {
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for CTRL+C: {}", e);
            }
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
    {
        tracing::error!("HTTP server error: {}", e);
    }

    cleanup(&state).await;
    let _ = sweeper.await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    // Build filter string based on effective level
    let filter = match effective_level {
        LogLevel::Error => "beacon_relay=error,tower_http=error",
        LogLevel::Warn => "beacon_relay=warn,tower_http=warn",
        LogLevel::Info => "beacon_relay=info,tower_http=info",
        LogLevel::Verbose => "beacon_relay=debug,tower_http=info",
        LogLevel::Debug => "beacon_relay=debug,tower_http=debug",
        LogLevel::Trace => "beacon_relay=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Get the configuration file path
fn get_config_path() -> PathBuf {
    // Check environment variable first
    if let Ok(path) = std::env::var("BEACON_RELAY_CONFIG") {
        return PathBuf::from(path);
    }

    PathBuf::from("beacon-relay.json")
}

fn log_config(config: &AppConfig) {
    tracing::info!(
        mode = ?config.relay.mode,
        candidate_capacity = config.relay.candidate_capacity,
        negotiation_timeout_ms = config.relay.negotiation_timeout_ms,
        "Relay configuration"
    );
    for server in config.webrtc.ice_servers() {
        tracing::info!("ICE server: {}", server.urls.join(", "));
    }
    if config.web.allowed_origins.is_empty() {
        tracing::info!("CORS: any origin");
    } else {
        tracing::info!("CORS origins: {}", config.web.allowed_origins.join(", "));
    }
}

/// Push config file changes into the coordinator
fn spawn_settings_watcher(
    store: ConfigStore,
    coordinator: Arc<NegotiationCoordinator>,
    shutdown: CancellationToken,
) {
    let mut changes = store.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                change = changes.recv() => {
                    if change.is_err() {
                        break;
                    }
                    let config = store.get();
                    coordinator.update_settings(CoordinatorSettings::from(&*config));
                    tracing::info!("Relay settings reloaded");
                }
            }
        }
    });
}

/// Re-read the config file on SIGHUP
///
/// Negotiation timeouts, sweep timing and ICE servers apply to new sessions
/// right away; listener, capacity and mode changes need a restart.
#[cfg(unix)]
fn spawn_reload_on_hangup(store: ConfigStore, overrides: Overrides, shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            tracing::warn!("SIGHUP reload unavailable: {}", e);
            return;
        }
    };

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    tracing::info!("SIGHUP received, reloading configuration");
                    if let Err(e) = store.reload(|config| overrides.apply(config)).await {
                        tracing::error!("Configuration reload failed: {}", e);
                    }
                }
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_store: ConfigStore, _overrides: Overrides, _shutdown: CancellationToken) {}

/// Clean up on shutdown
async fn cleanup(state: &Arc<AppState>) {
    state.shutdown.cancel();
    let closed = state.coordinator.close_all().await;
    tracing::info!("Closed {} sessions", closed);
}
