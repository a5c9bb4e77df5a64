//! hass-link CLI - talks to a home-automation hub over its WebSocket API.
//!
//! This is the main binary entry point. See the `hass_link` library for the
//! core functionality.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hass_link::constants::PING_TIMEOUT;
use hass_link::{Config, ConnectionSupervisor, HassApi, HassConnection, TungsteniteSocketFactory};
use mimalloc::MiMalloc;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "hass-link")]
#[command(version)]
#[command(about = "Persistent WebSocket client for a home-automation hub")]
struct Cli {
    /// Hub host (overrides config and HASS_HOST)
    #[arg(long, global = true)]
    host: Option<String>,
    /// Hub port
    #[arg(long, global = true)]
    port: Option<u16>,
    /// Use TLS
    #[arg(long, global = true, overrides_with = "no_ssl")]
    ssl: bool,
    /// Do not use TLS, even if the config file enables it
    #[arg(long, global = true, overrides_with = "ssl")]
    no_ssl: bool,
    /// Long-lived access token
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    /// TLS setting from `--ssl` / `--no-ssl`, the last one given wins.
    fn ssl_override(&self) -> Option<bool> {
        match (self.ssl, self.no_ssl) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Stay connected and print events as JSON lines until Ctrl-C
    Run,
    /// Connect and measure a ping round trip
    Ping {
        /// Seconds to wait for the pong
        #[arg(long, default_value_t = PING_TIMEOUT.as_secs())]
        timeout: u64,
    },
    /// Print every entity state
    States,
    /// Print the hub configuration
    Config,
    /// Invoke a service
    CallService {
        /// Service domain (e.g. "light")
        domain: String,
        /// Service name (e.g. "turn_on")
        service: String,
        /// Service data as a JSON object
        #[arg(long)]
        data: Option<String>,
        /// Target entity
        #[arg(long)]
        entity_id: Option<String>,
    },
    /// Read one entity's state over HTTP
    GetState {
        /// Entity id (e.g. "sensor.temperature")
        entity_id: String,
    },
    /// Write one entity's state over HTTP
    SetState {
        /// Entity id
        entity_id: String,
        /// New state value
        state: String,
        /// Attributes as a JSON object
        #[arg(long)]
        attributes: Option<String>,
    },
}

fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    if let Ok(path) = std::env::var("HASS_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }

    builder.init();
    Ok(())
}

fn resolve_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load()?;
    if let Some(host) = &cli.host {
        config.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(ssl) = cli.ssl_override() {
        config.ssl = ssl;
    }
    if let Some(token) = &cli.token {
        config.token.clone_from(token);
    }
    if !config.has_token() {
        anyhow::bail!("No access token configured: set HASS_TOKEN or pass --token");
    }
    Ok(config)
}

fn new_connection(config: &Config) -> HassConnection {
    HassConnection::new(Arc::new(TungsteniteSocketFactory))
        .with_command_timeout(config.command_timeout())
}

async fn connect_once(config: &Config, fetch_states: bool) -> Result<HassConnection> {
    let connection = new_connection(config);
    connection
        .connect(
            &config.host,
            config.port,
            config.ssl,
            &config.token,
            fetch_states,
        )
        .await
        .with_context(|| format!("Failed to connect to {}", config.websocket_url()))?;
    Ok(connection)
}

fn parse_object(label: &str, raw: Option<&str>) -> Result<Option<Map<String, Value>>> {
    raw.map(|text| {
        serde_json::from_str::<Map<String, Value>>(text)
            .with_context(|| format!("--{label} must be a JSON object"))
    })
    .transpose()
}

async fn run(config: Config) -> Result<()> {
    let connection = Arc::new(new_connection(&config));
    let supervisor = ConnectionSupervisor::new(connection)
        .with_reconnect_interval(config.reconnect_interval())
        .with_ready_poll_interval(config.ready_poll_interval())
        .with_fetch_states(config.fetch_states_on_connect);

    let mut events = supervisor
        .take_events()
        .context("Event stream already taken")?;
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => log::warn!("Failed to serialize event: {}", e),
            }
        }
    });

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => log::info!("Shutdown requested"),
            Err(e) => log::error!("Failed to listen for Ctrl-C: {}", e),
        }
        signal_cancel.cancel();
    });

    supervisor
        .run(&config.host, config.port, config.ssl, &config.token, cancel)
        .await;
    printer.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    match cli.command {
        Commands::Run => run(config).await?,
        Commands::Ping { timeout } => {
            let connection = connect_once(&config, false).await?;
            let start = Instant::now();
            let ok = connection.ping(Duration::from_secs(timeout)).await;
            connection.close().await;
            if !ok {
                anyhow::bail!("No pong within {timeout}s");
            }
            println!("pong in {} ms", start.elapsed().as_millis());
        }
        Commands::States => {
            let connection = connect_once(&config, true).await?;
            let mut states: Vec<_> = connection.states().into_values().collect();
            connection.close().await;
            states.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
            for state in states {
                println!("{:<50} {}", state.entity_id, state.state);
            }
        }
        Commands::Config => {
            let connection = connect_once(&config, false).await?;
            let hub_config = connection.get_config().await;
            connection.close().await;
            println!("{}", serde_json::to_string_pretty(&hub_config?)?);
        }
        Commands::CallService {
            domain,
            service,
            data,
            entity_id,
        } => {
            let data = parse_object("data", data.as_deref())?.map(Value::Object);
            let target = entity_id.map(|id| serde_json::json!({ "entity_id": id }));
            let connection = connect_once(&config, false).await?;
            let ok = connection.call_service(&domain, &service, data, target).await;
            connection.close().await;
            if !ok {
                anyhow::bail!("{domain}.{service} failed");
            }
            println!("{domain}.{service} ok");
        }
        Commands::GetState { entity_id } => {
            let api = HassApi::new(config.http_url(), config.token.clone())?;
            match api.get_state(&entity_id).await? {
                Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                None => anyhow::bail!("Entity {entity_id} not found"),
            }
        }
        Commands::SetState {
            entity_id,
            state,
            attributes,
        } => {
            let attributes = parse_object("attributes", attributes.as_deref())?.unwrap_or_default();
            let api = HassApi::new(config.http_url(), config.token.clone())?;
            let updated = api.set_state(&entity_id, &state, &attributes).await?;
            println!("{}", serde_json::to_string_pretty(&updated)?);
        }
    }

    Ok(())
}
