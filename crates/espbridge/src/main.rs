use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use espbridge::config::ConfigError;
use espbridge::format_diagnostics;
use espbridge::relay;
use espbridge::session::AddressStore;
use espbridge::session::DeviceClient;
use espbridge::session::SessionError;
use espbridge::Config;
use espbridge::DeviceAddress;
use espbridge::Forwarder;
use espbridge::Prober;
use espbridge::RelayClient;
use espbridge::Session;
use espbridge::StatusMessage;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

const DEFAULT_CONFIG: &str = "espbridge.toml";

#[derive(Parser)]
#[command(name = "espbridge")]
#[command(about = "Connectivity probe and command relay for ESP32 devices")]
#[command(version)]
struct Cli {
    /// Config files, merged in order. Falls back to ./espbridge.toml.
    #[arg(short, long = "config", global = true)]
    config: Vec<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },

    /// Check whether a device can be reached
    Probe {
        /// Device address; defaults to the last one used
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Probe a device, register it with the relay, then send any commands
    Connect {
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        /// Command to send once connected; may be repeated
        #[arg(long = "send")]
        send: Vec<String>,
    },

    /// Send a single command through the relay
    Control { host: String, command: String },

    /// Read the device's power state directly
    Status { host: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let Some(config) = load_config(&cli.config)? else {
        return Ok(ExitCode::FAILURE);
    };

    tracing_subscriber::fmt()
        .with_env_filter(config.logging.env_filter())
        .init();

    let store = AddressStore::new(&config.client.state_file);

    match cli.command {
        Commands::Serve { port } => serve(&config, port).await,
        Commands::Probe {
            host,
            port,
            timeout_ms,
        } => {
            let address = resolve_address(host, port, &store)?;
            let mut probe_config = config.probe.clone();
            if let Some(ms) = timeout_ms.filter(|ms| *ms > 0) {
                probe_config.timeout = Duration::from_millis(ms);
            }

            let prober = Prober::from_config(probe_config).context("Failed to build HTTP client")?;
            println!("{}", StatusMessage::connecting(&address.base_url()));
            let report = prober.probe(&address, Some(cancel_on_ctrl_c())).await;
            println!("{}", report.message);
            for attempt in &report.attempts {
                tracing::debug!("{} {} -> {:?}", attempt.mode, attempt.url, attempt.result);
            }

            Ok(exit_code(report.outcome.is_success()))
        }
        Commands::Connect { host, port, send } => connect(&config, &store, host, port, send).await,
        Commands::Control { host, command } => {
            let address = DeviceAddress::parse(&host)?;
            let client = RelayClient::new(&config.client.relay_url, config.client.timeout)?;
            match client.control(&address, &command).await {
                Ok(response) => {
                    println!("{}", StatusMessage::success(render(&response.response)));
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    println!("{}", e.status_message());
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Status { host } => {
            let address = DeviceAddress::parse(&host)?;
            let client = DeviceClient::new(config.client.timeout)?;
            match client.status(&address).await {
                Ok(state) => {
                    println!("{}", StatusMessage::info(format!("{} is {}", address, state)));
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    println!("{}", StatusMessage::error(e.to_string()));
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}

/// Load `paths`, or the default file if it exists, or built-in defaults.
/// Returns `None` after printing diagnostics if the config is invalid.
fn load_config(paths: &[PathBuf]) -> anyhow::Result<Option<Config>> {
    let paths = if paths.is_empty() && Path::new(DEFAULT_CONFIG).exists() {
        vec![PathBuf::from(DEFAULT_CONFIG)]
    } else {
        paths.to_vec()
    };
    if paths.is_empty() {
        return Ok(Some(Config::default()));
    }

    match Config::from_files(&paths) {
        Ok((config, diagnostics)) => {
            if !diagnostics.is_empty() {
                eprint!("{}", format_diagnostics(&diagnostics));
            }
            Ok(Some(config))
        }
        Err(ConfigError::Invalid(diagnostics)) => {
            eprint!("{}", format_diagnostics(&diagnostics));
            Ok(None)
        }
        Err(e) => Err(e).context("Failed to load configuration"),
    }
}

fn resolve_address(
    host: Option<String>,
    port: Option<u16>,
    store: &AddressStore,
) -> anyhow::Result<DeviceAddress> {
    let host = match host {
        Some(host) => host,
        None => store
            .load()?
            .context("No device address given and none remembered from a previous run")?,
    };

    let mut address = DeviceAddress::parse(&host)?;
    if let Some(port) = port {
        address = address.with_port(port)?;
    }

    if let Err(e) = store.save(&address.to_string()) {
        tracing::warn!("Could not remember address: {}", e);
    }
    Ok(address)
}

async fn serve(config: &Config, port: Option<u16>) -> anyhow::Result<ExitCode> {
    let forwarder =
        Forwarder::new(config.relay.forwarder.clone()).context("Failed to build HTTP client")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        shutdown_tx.send(()).ok();
    });

    relay::serve(
        &config.relay.listen,
        port.unwrap_or(config.relay.port),
        forwarder,
        shutdown_rx,
    )
    .await?;

    info!("espbridge relay stopped");
    Ok(ExitCode::SUCCESS)
}

async fn connect(
    config: &Config,
    store: &AddressStore,
    host: Option<String>,
    port: Option<u16>,
    commands: Vec<String>,
) -> anyhow::Result<ExitCode> {
    let address = resolve_address(host, port, store)?;
    let prober = Prober::from_config(config.probe.clone()).context("Failed to build HTTP client")?;
    let client = RelayClient::new(&config.client.relay_url, config.client.timeout)?;
    let mut session = Session::new();

    println!("{}", StatusMessage::connecting(&address.base_url()));
    let report = session
        .connect(&prober, address.clone(), Some(cancel_on_ctrl_c()))
        .await?;
    println!("{}", report.message);
    if !report.outcome.is_success() {
        return Ok(ExitCode::FAILURE);
    }

    if let Err(e) = client.register(&address).await {
        println!("{}", e.status_message());
        session.disconnect();
        return Ok(ExitCode::FAILURE);
    }
    println!(
        "{}",
        StatusMessage::success(format!("Registered {} with {}", address, client.base_url()))
    );

    for command in commands {
        match session.send_command(&client, &command).await {
            Ok(response) => println!(
                "{}",
                StatusMessage::success(format!("{}: {}", command, render(&response.response)))
            ),
            Err(SessionError::Client(e)) => {
                println!("{}", e.status_message());
                return Ok(ExitCode::FAILURE);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Token cancelled on the first Ctrl+C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling");
            trigger.cancel();
        }
    });
    token
}

// Raw-text device replies arrive as JSON strings; print those unquoted
fn render(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
