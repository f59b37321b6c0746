use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use robot_client::config::{self, AppConfig};
use robot_client::device::DeviceController;
use robot_client::supervisor::{ChannelRole, JanusPublisher, LifecycleSupervisor, StreamChannel};

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

/// robot-client command line arguments
#[derive(Parser, Debug)]
#[command(name = "robot-client")]
#[command(version, about = "Camera streaming and remote control client for robots", long_about = None)]
struct CliArgs {
    /// Configuration file (TOML)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Signaling server URL (overrides config)
    #[arg(short = 'u', long, value_name = "URL")]
    url: Option<String>,

    /// Microcontroller serial port; enables the device (overrides config)
    #[arg(short = 'd', long, value_name = "PORT")]
    device: Option<String>,

    /// Do not start the camera channel
    #[arg(long)]
    no_camera: bool,

    /// Do not start the control channel
    #[arg(long)]
    no_control: bool,

    /// Publish the camera to this Janus server instead of answering viewers
    #[arg(long, value_name = "URL")]
    janus: Option<String>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Also write logs to this file (overrides config)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let config_path = config::resolve_config_path(args.config.clone());
    let mut config = config::load_config(config_path.as_deref()).await?;
    apply_overrides(&mut config, &args);
    config.validate()?;

    let log_file = args
        .log_file
        .clone()
        .or_else(|| config.logging.file.as_ref().map(PathBuf::from));
    init_logging(args.log_level, args.verbose, log_file)?;

    tracing::info!("Starting robot-client v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Signaling server: {}", config.signaling.url);

    let device = if config.device.enabled {
        match DeviceController::open_serial(&config.device).await {
            Ok(device) => Some(device),
            Err(e) => {
                tracing::error!("Microcontroller unavailable, moves will be dropped: {}", e);
                None
            }
        }
    } else {
        tracing::info!("Microcontroller link disabled");
        None
    };

    let mut supervisor = LifecycleSupervisor::new();
    for (role, enabled) in [
        (ChannelRole::Camera, config.camera.enabled),
        (ChannelRole::Control, config.control.enabled),
    ] {
        if !enabled {
            tracing::info!("{} channel disabled", role);
            continue;
        }
        if role == ChannelRole::Camera && config.janus.enabled {
            tracing::info!("Publishing camera to Janus room {}", config.janus.room);
            let started = match JanusPublisher::from_config(&config) {
                Ok(publisher) => supervisor.start_publisher(publisher).await,
                Err(e) => Err(e),
            };
            if let Err(e) = started {
                tracing::error!("Failed to start Janus publisher: {}", e);
            }
            continue;
        }
        let channel = StreamChannel::from_config(role, &config, device.clone());
        if let Err(e) = supervisor.start(channel).await {
            tracing::error!("Failed to start {} channel: {}", role, e);
        }
    }

    if supervisor.is_empty() {
        if let Some(ref device) = device {
            device.shutdown().await;
        }
        anyhow::bail!("No stream channel could be started");
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => tracing::info!("Shutdown signal received"),
                Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
            }
        }
        _ = supervisor.all_stopped() => {
            tracing::warn!("All stream channels stopped");
        }
    }

    supervisor.shutdown().await;
    if let Some(ref device) = device {
        device.shutdown().await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn apply_overrides(config: &mut AppConfig, args: &CliArgs) {
    if let Some(ref url) = args.url {
        config.signaling.url = url.clone();
    }
    if let Some(ref port) = args.device {
        config.device.enabled = true;
        config.device.port = port.clone();
    }
    if args.no_camera {
        config.camera.enabled = false;
    }
    if args.no_control {
        config.control.enabled = false;
    }
    if let Some(ref url) = args.janus {
        config.janus.enabled = true;
        config.janus.url = url.clone();
    }
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8, log_file: Option<PathBuf>) -> anyhow::Result<()> {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "robot_client=error,webrtc=error",
        LogLevel::Warn => "robot_client=warn,webrtc=warn",
        LogLevel::Info => "robot_client=info,webrtc=warn",
        LogLevel::Verbose => "robot_client=debug,webrtc=warn",
        LogLevel::Debug => "robot_client=debug,webrtc=info",
        LogLevel::Trace => "robot_client=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| anyhow::anyhow!("Cannot open log file {}: {}", path.display(), e))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
        }
        None => None,
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }

    Ok(())
}
