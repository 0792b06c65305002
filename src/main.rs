//! ExoLink - EMG exoskeleton link
//!
//! Command line front end for the motor link, the training upload and the
//! regression stream.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use exolink::config::{self, Config};
use exolink::network::{
    ArtifactEvent, ArtifactListener, ArtifactState, ConnectionState, NetworkConfig, SendOutcome,
};
use exolink::protocol::{ModelArtifact, ModelType, REGRESSION_VALUES};
use exolink::MotorController;

/// ExoLink - EMG exoskeleton link
#[derive(Parser)]
#[command(name = "exolink")]
#[command(version = "0.1.0")]
#[command(about = "Drive an exoskeleton motor and its model training server over UDP", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure and start the motor, then stream regression vectors from stdin
    Connect {
        /// Seconds to wait for the settings confirmation
        #[arg(long, default_value_t = 5)]
        confirm_timeout: u64,
    },

    /// Send the disconnect command to the motor
    Disconnect,

    /// Upload a training dataset and wait for the trained model
    Train {
        /// Dataset file sent verbatim to the training server
        #[arg(short, long)]
        data: PathBuf,

        /// Model to train (ridge-for-exo or tflite)
        #[arg(short, long, default_value = "ridge-for-exo")]
        model_type: ModelType,

        /// Where to write the received model
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run the artifact listener and print everything it decodes
    Listen,

    /// Show the configured motor settings
    Settings {
        /// Check every field against its valid range
        #[arg(long)]
        validate: bool,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new(config.general.log_level.as_deref().unwrap_or("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let net = NetworkConfig::from_config(&config);

    match cli.command {
        Commands::Connect { confirm_timeout } => {
            run_connect(&config, net, Duration::from_secs(confirm_timeout)).await?;
        }
        Commands::Disconnect => {
            let controller = MotorController::new(net);
            controller.send_disconnect().await?;
            println!("Disconnect sent");
        }
        Commands::Train {
            data,
            model_type,
            output,
        } => {
            run_train(net, data, model_type, output).await?;
        }
        Commands::Listen => {
            run_listen(net).await?;
        }
        Commands::Settings { validate } => {
            if validate {
                config.motor.validate()?;
                println!("Motor settings are valid");
            } else {
                println!("{}", config.motor.to_json()?);
            }
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Settings, confirmation, start, then stream stdin until EOF or Ctrl+C
async fn run_connect(
    config: &Config,
    net: NetworkConfig,
    confirm_timeout: Duration,
) -> anyhow::Result<()> {
    let mut controller = MotorController::new(net);
    controller.start().await?;

    let result = stream_session(&controller, config, confirm_timeout).await;

    if let Err(e) = controller.send_disconnect().await {
        tracing::warn!("Failed to send disconnect: {}", e);
    }
    controller.shutdown().await;
    result
}

async fn stream_session(
    controller: &MotorController,
    config: &Config,
    confirm_timeout: Duration,
) -> anyhow::Result<()> {
    let mut changes = controller.subscribe();
    tokio::spawn(async move {
        while let Some(change) = changes.recv().await {
            tracing::info!("Link {} -> {} ({:?})", change.from, change.to, change.trigger);
        }
    });

    controller.send_settings(&config.motor).await?;
    controller
        .wait_for_state(ConnectionState::ReadyToStart, confirm_timeout)
        .await?;
    controller.send_start().await?;

    println!(
        "Connected. Enter {} values per line; Ctrl+D or Ctrl+C to stop.",
        REGRESSION_VALUES
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sent = 0u64;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_vector(&line) {
                    Some(values) => {
                        if controller.send_regression_values(&values).await == SendOutcome::Sent {
                            sent += 1;
                        }
                    }
                    None => tracing::warn!("Skipping line {:?}: expected {} numbers", line, REGRESSION_VALUES),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, disconnecting...");
                break;
            }
        }
    }

    tracing::info!("Sent {} regression vectors", sent);
    Ok(())
}

/// Parse one line of whitespace or comma separated values
fn parse_vector(line: &str) -> Option<[f64; REGRESSION_VALUES]> {
    let values: Vec<f64> = line
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;

    values.try_into().ok()
}

async fn run_train(
    net: NetworkConfig,
    data: PathBuf,
    model_type: ModelType,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let dataset = tokio::fs::read(&data)
        .await
        .with_context(|| format!("Failed to read dataset {}", data.display()))?;

    let mut controller = MotorController::new(net);
    controller.start().await?;
    let mut events = controller
        .take_artifact_events()
        .context("Artifact events already taken")?;

    let mut model = None;
    let result = {
        let upload = controller.upload_training_data(dataset, model_type);
        tokio::pin!(upload);

        loop {
            tokio::select! {
                result = &mut upload => break result.map_err(anyhow::Error::from),
                Some(event) = events.recv() => {
                    if let Some(artifact) = report_event(event) {
                        model = Some(artifact);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    break Err(anyhow::anyhow!("Interrupted"));
                }
            }
        }
    };

    // The model event can trail the upload result by a moment
    if result.is_ok() && model.is_none() {
        model = wait_for_model(&mut events, Duration::from_secs(1)).await;
    }

    controller.shutdown().await;
    let report = result?;
    println!(
        "{} ({} chunks, {} bytes, {:?})",
        report.message, report.total_chunks, report.bytes, report.elapsed
    );

    match (model, output) {
        (Some(artifact), Some(path)) => {
            let bytes = match &artifact {
                ModelArtifact::Ridge(json) => json.as_bytes().to_vec(),
                ModelArtifact::Tflite(bytes) => bytes.clone(),
            };
            tokio::fs::write(&path, bytes).await?;
            println!("{} model written to: {}", artifact.model_type(), path.display());
        }
        (Some(ModelArtifact::Ridge(json)), None) => println!("{}", json),
        (Some(ModelArtifact::Tflite(bytes)), None) => {
            println!("TFLITE model received ({} bytes); use --output to save it", bytes.len());
        }
        (None, _) => tracing::warn!("Model flagged as received but no artifact event arrived"),
    }

    Ok(())
}

async fn wait_for_model(
    events: &mut mpsc::Receiver<ArtifactEvent>,
    window: Duration,
) -> Option<ModelArtifact> {
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        if let Some(artifact) = report_event(event) {
            return Some(artifact);
        }
    }
    None
}

/// Print an event; hand back the artifact if it carries one
fn report_event(event: ArtifactEvent) -> Option<ModelArtifact> {
    match event {
        ArtifactEvent::Model(artifact) => {
            tracing::info!("Received {} model", artifact.model_type());
            Some(artifact)
        }
        ArtifactEvent::Progress {
            current,
            total,
            percent,
        } => {
            println!("Training progress: {}/{} ({}%)", current, total, percent);
            None
        }
        ArtifactEvent::ServerError(text) => {
            eprintln!("Training server error: {}", text);
            None
        }
    }
}

async fn run_listen(net: NetworkConfig) -> anyhow::Result<()> {
    let mut listener = ArtifactListener::new(net, Arc::new(ArtifactState::new()));
    let addr = listener.start().await?;
    let mut events = listener
        .take_event_receiver()
        .context("Artifact events already taken")?;

    println!("Listening for artifacts on {}", addr);
    println!("Press Ctrl+C to stop");

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(ArtifactEvent::Model(ModelArtifact::Ridge(json))) => {
                        println!("Ridge model: {}", json);
                    }
                    Some(ArtifactEvent::Model(ModelArtifact::Tflite(bytes))) => {
                        println!("TFLite model: {} bytes", bytes.len());
                    }
                    Some(event) => {
                        report_event(event);
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    listener.stop().await?;
    Ok(())
}
