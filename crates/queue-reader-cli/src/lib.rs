//! # Queue Reader CLI
//!
//! Command-line front end for the `queue-reader` library:
//! - `receive` runs the receive-and-hydrate loop
//! - `send` publishes one message through the selected backend
//! - `config` shows which backend the current settings select
//!
//! Settings are layered with the `config` crate (later sources win):
//!  1. `/etc/queue-reader/reader.yaml`
//!  2. `./config/reader.yaml`
//!  3. the file given with `--config` / `QUEUE_READER_CONFIG`
//!  4. environment variables prefixed `QR__`, e.g. `QR__AMQP__QUEUE_NAME`

use clap::{Parser, Subcommand};
use queue_reader::{
    AmqpConfig, BrokerConfig, BrokerError, BrokerSettings, ConfigurationError, Hydrated,
    HydrationMode, KafkaConfig, QueueReader, ReaderConfig, ReaderError, SqsConfig,
    StorageConfig,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

// ============================================================================
// CLI Structure
// ============================================================================

/// Read messages from RabbitMQ, AWS SQS or Kafka and fetch the blobs they reference
#[derive(Debug, Parser)]
#[command(name = "queue-reader")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "QUEUE_READER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level, used when RUST_LOG is not set
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Receive messages and hydrate their blobs
    Receive {
        /// File each fetched blob is written to
        #[arg(short, long, required_unless_present = "raw")]
        output: Option<PathBuf>,

        /// Stop after the first hydrated blob
        #[arg(long)]
        once: bool,

        /// Fetch without writing, logging status and size instead
        #[arg(long, conflicts_with = "output")]
        raw: bool,
    },

    /// Publish one message to the configured target
    Send {
        /// Message body
        payload: String,
    },

    /// Show the backend selected by the current settings
    Config,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Failed to load settings: {0}")]
    Settings(#[from] config::ConfigError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Reader(#[from] ReaderError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Settings(_) => 1,
            Self::Configuration(_) => 2,
            Self::Reader(ReaderError::Configuration(_)) => 2,
            Self::Reader(ReaderError::Broker(BrokerError::ConfigurationError(_))) => 2,
            Self::Reader(_) => 3,
            Self::Broker(_) => 3,
            Self::InvalidArgument { .. } => 4,
        }
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Settings as loaded from files and the environment
///
/// Every backend has its own section; the first one with a source queue name wins
/// (see [`BrokerSettings::select`]).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReaderSettings {
    pub amqp: AmqpConfig,
    pub sqs: SqsConfig,
    pub kafka: KafkaConfig,
    pub storage: StorageConfig,
}

impl ReaderSettings {
    pub fn into_reader_config(self) -> Result<ReaderConfig, ConfigurationError> {
        let brokers = BrokerSettings {
            amqp: self.amqp,
            sqs: self.sqs,
            kafka: self.kafka,
        };

        Ok(ReaderConfig {
            broker: brokers.select()?,
            storage: self.storage,
        })
    }
}

/// Load settings from the standard locations and the process environment
pub fn load_settings(explicit_path: Option<&Path>) -> Result<ReaderSettings, CliError> {
    load_settings_with(explicit_path, environment())
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("QR").separator("__")
}

/// Load settings with a specific environment source
pub fn load_settings_with(
    explicit_path: Option<&Path>,
    environment: config::Environment,
) -> Result<ReaderSettings, CliError> {
    let mut builder = config::Config::builder()
        .add_source(
            config::File::with_name("/etc/queue-reader/reader")
                .required(false)
                .format(config::FileFormat::Yaml),
        )
        .add_source(
            config::File::with_name("config/reader")
                .required(false)
                .format(config::FileFormat::Yaml),
        );

    if let Some(path) = explicit_path {
        debug!(path = %path.display(), "Loading settings from explicit path");
        builder = builder.add_source(config::File::from(path).required(true));
    }

    let settings = builder.add_source(environment).build()?;
    Ok(settings.try_deserialize()?)
}

// ============================================================================
// Logging
// ============================================================================

/// Install the global subscriber; `RUST_LOG` overrides `level`
pub fn initialize_logging(level: &str, json: bool) -> Result<(), CliError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).map_err(|e| CliError::InvalidArgument {
            message: format!("invalid log level '{}': {}", level, e),
        })?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .try_init()
        .map_err(|e| CliError::InvalidArgument {
            message: format!("logging already initialized: {}", e),
        })
}

// ============================================================================
// Entry Point
// ============================================================================

/// Parse arguments, set up logging and run the selected command
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();
    initialize_logging(&cli.log_level, cli.json_logs)?;
    run(cli).await
}

pub async fn run(cli: Cli) -> Result<(), CliError> {
    let settings = load_settings(cli.config.as_deref())?;

    match cli.command {
        Commands::Receive { output, once, raw } => {
            let mode = hydration_mode(output, raw)?;
            execute_receive_command(settings.into_reader_config()?, mode, once).await
        }
        Commands::Send { payload } => {
            execute_send_command(settings.into_reader_config()?, &payload).await
        }
        Commands::Config => execute_config_command(settings),
    }
}

fn hydration_mode(output: Option<PathBuf>, raw: bool) -> Result<HydrationMode, CliError> {
    match (output, raw) {
        (_, true) => Ok(HydrationMode::Raw),
        (Some(path), false) => Ok(HydrationMode::File(path)),
        (None, false) => Err(CliError::InvalidArgument {
            message: "--output is required unless --raw is given".to_string(),
        }),
    }
}

async fn execute_receive_command(
    config: ReaderConfig,
    mode: HydrationMode,
    once: bool,
) -> Result<(), CliError> {
    let mut reader = QueueReader::connect(config).await?;
    info!(broker = %reader.broker_kind(), "Receiving messages");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, closing reader");
                break;
            }
            hydrated = reader.receive_and_hydrate(&mode) => {
                match hydrated {
                    Some(Hydrated::File(path)) => {
                        info!(path = %path.display(), "Blob written");
                    }
                    Some(Hydrated::Raw(response)) => {
                        info!(
                            status = %response.status(),
                            content_length = ?response.content_length(),
                            "Blob fetched"
                        );
                    }
                    None => continue,
                }

                if once {
                    break;
                }
            }
        }
    }

    reader.close().await?;
    Ok(())
}

async fn execute_send_command(config: ReaderConfig, payload: &str) -> Result<(), CliError> {
    let mut reader = QueueReader::connect(config).await?;
    let sent = reader.send(payload).await;
    reader.close().await?;
    sent?;

    info!(broker = %reader.broker_kind(), bytes = payload.len(), "Message sent");
    Ok(())
}

fn execute_config_command(settings: ReaderSettings) -> Result<(), CliError> {
    let config = settings.into_reader_config()?;
    let backend = match &config.broker {
        BrokerConfig::Amqp(amqp) => format!("{:#?}", amqp),
        BrokerConfig::Sqs(sqs) => format!("{:#?}", sqs),
        BrokerConfig::Kafka(kafka) => format!("{:#?}", kafka),
    };

    println!("broker: {}", config.broker.kind());
    println!("{}", backend);
    println!("{:#?}", config.storage);
    Ok(())
}
