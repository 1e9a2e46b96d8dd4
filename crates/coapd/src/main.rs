// # coapd - CoAP Observe Daemon
//
// The coapd daemon is a thin integration layer around coap-core. It is
// responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing logging and the runtime
// 3. Building the example resource tree
// 4. Running the CoAP server until SIGINT/SIGTERM
//
// ## Configuration
//
// All configuration is done via environment variables:
//
// ### Socket
// - `COAP_BIND_HOST`: IP address to bind (default 0.0.0.0)
// - `COAP_BIND_PORT`: UDP port (default 5683)
//
// ### Reliability
// - `COAP_ACK_TIMEOUT_MS`: Initial acknowledgement timeout (100-60000)
// - `COAP_MAX_RETRANSMIT`: Retransmissions before an observer is dropped (0-10)
//
// ### Blockwise
// - `COAP_BLOCK_SIZE`: Largest block sent (16, 32, ..., 1024)
//
// ### Other
// - `COAP_CONFIG_FILE`: JSON file in `ServerConfig` format; the variables above override it
// - `COAP_LOG_LEVEL`: trace, debug, info, warn, error
//
// ## Example
//
// ```bash
// export COAP_BIND_HOST=127.0.0.1
// export COAP_ACK_TIMEOUT_MS=1000
// export COAP_LOG_LEVEL=debug
//
// coapd
// ```

mod resources;

use anyhow::{Context, Result};
use coap_core::{CoapServer, ServerConfig, ServerEvent};
use std::env;
use std::process::ExitCode;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// How long the event logger may take to drain after the server stopped
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum CoapExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<CoapExitCode> for ExitCode {
    fn from(code: CoapExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Application configuration
#[derive(Debug)]
struct Config {
    bind_host: Option<String>,
    bind_port: Option<u16>,
    ack_timeout_ms: Option<u64>,
    max_retransmit: Option<u32>,
    block_size: Option<usize>,
    config_file: Option<String>,
    log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key/value source
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            bind_host: lookup("COAP_BIND_HOST"),
            bind_port: parse(&lookup, "COAP_BIND_PORT")?,
            ack_timeout_ms: parse(&lookup, "COAP_ACK_TIMEOUT_MS")?,
            max_retransmit: parse(&lookup, "COAP_MAX_RETRANSMIT")?,
            block_size: parse(&lookup, "COAP_BLOCK_SIZE")?,
            config_file: lookup("COAP_CONFIG_FILE").filter(|s| !s.is_empty()),
            log_level: lookup("COAP_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Validate the configuration
    ///
    /// Checks numeric ranges, the log level and that the config file exists.
    /// Cross-field checks happen once the `ServerConfig` is assembled.
    fn validate(&self) -> Result<()> {
        if let Some(host) = &self.bind_host
            && host.parse::<std::net::IpAddr>().is_err()
        {
            anyhow::bail!("COAP_BIND_HOST must be an IP address. Got: {}", host);
        }

        if let Some(timeout) = self.ack_timeout_ms
            && !(100..=60_000).contains(&timeout)
        {
            anyhow::bail!(
                "COAP_ACK_TIMEOUT_MS must be between 100 and 60000. Got: {}",
                timeout
            );
        }

        if let Some(max_retransmit) = self.max_retransmit
            && max_retransmit > 10
        {
            anyhow::bail!(
                "COAP_MAX_RETRANSMIT must be between 0 and 10. Got: {}",
                max_retransmit
            );
        }

        if let Some(size) = self.block_size
            && (!size.is_power_of_two() || !(16..=1024).contains(&size))
        {
            anyhow::bail!(
                "COAP_BLOCK_SIZE must be a power of two between 16 and 1024. Got: {}",
                size
            );
        }

        if let Some(path) = &self.config_file
            && !std::path::Path::new(path).is_file()
        {
            anyhow::bail!("COAP_CONFIG_FILE does not exist: {}", path);
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "COAP_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        Ok(())
    }

    /// Assemble the server configuration: file first, then environment overrides
    async fn server_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config_file {
            Some(path) => ServerConfig::load(path)
                .await
                .with_context(|| format!("failed to load {}", path))?,
            None => ServerConfig::default(),
        };

        if let Some(host) = &self.bind_host {
            config.bind_host = host.clone();
        }
        if let Some(port) = self.bind_port {
            config.bind_port = port;
        }
        if let Some(timeout) = self.ack_timeout_ms {
            config.reliability.ack_timeout_ms = timeout;
        }
        if let Some(max_retransmit) = self.max_retransmit {
            config.reliability.max_retransmit = max_retransmit;
        }
        if let Some(size) = self.block_size {
            config.blockwise.max_block_size = size;
        }

        config.validate()?;
        Ok(config)
    }

    fn tracing_level(&self) -> Level {
        match self.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{} is not a valid number: '{}'", key, value)),
        _ => Ok(None),
    }
}

fn main() -> ExitCode {
    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return CoapExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return CoapExitCode::ConfigError.into();
    }

    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.tracing_level())
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return CoapExitCode::ConfigError.into();
    }

    info!("Starting coapd daemon");

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return CoapExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        let server_config = match config.server_config().await {
            Ok(server_config) => server_config,
            Err(e) => {
                error!("Configuration error: {:#}", e);
                return CoapExitCode::ConfigError;
            }
        };

        if let Err(e) = run_daemon(server_config).await {
            error!("Daemon error: {:#}", e);
            CoapExitCode::RuntimeError
        } else {
            CoapExitCode::CleanShutdown
        }
    });

    result.into()
}

/// Run the daemon
async fn run_daemon(config: ServerConfig) -> Result<()> {
    let tree = resources::build_tree()?;
    for path in tree.paths() {
        info!("Serving resource /{}", path);
    }

    let (server, events) = CoapServer::bind(config, tree)
        .await
        .context("failed to start CoAP server")?;
    let monitor = tokio::spawn(log_events(events));

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        match wait_for_shutdown().await {
            Ok(signal) => info!("Received shutdown signal: {}", signal),
            Err(e) => error!("Shutdown signal error: {}", e),
        }
        let _ = shutdown_tx.send(());
    });

    server.run_with_shutdown(Some(shutdown_rx)).await?;

    // closes the event channel
    drop(server);
    if tokio::time::timeout(DRAIN_TIMEOUT, monitor).await.is_err() {
        warn!("Event logger did not finish within {:?}", DRAIN_TIMEOUT);
    }

    info!("Shutting down daemon");
    Ok(())
}

/// Log server events until the server goes away
async fn log_events(events: mpsc::Receiver<ServerEvent>) {
    let mut events = ReceiverStream::new(events);
    while let Some(event) = events.next().await {
        match event {
            ServerEvent::Started {
                local_addr,
                resources_count,
            } => info!(
                "Listening on {} with {} resource(s)",
                local_addr, resources_count
            ),
            ServerEvent::ObserverRegistered { path, peer, token } => {
                info!("{} observes /{} (token {})", peer, path, token)
            }
            ServerEvent::ObserverRemoved { path, peer, reason } => {
                info!("{} no longer observes /{} ({})", peer, path, reason)
            }
            ServerEvent::NotificationSent { path, peer, code } => {
                debug!("Notified {} about /{} ({})", peer, path, code)
            }
            ServerEvent::Stopped { reason } => info!("Server stopped: {}", reason),
        }
    }
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
///
/// # Returns
///
/// Returns the name of the signal received.
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for shutdown signals (SIGINT only)
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
