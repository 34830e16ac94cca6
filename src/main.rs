use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use waav_voice_client::{
    AudioEgressScheduler, AudioIngressBridge, ClientCommand, ClientConfig, LifecycleEvent,
    RealtimeClient, ServerEvent, WavCaptureSource, WavRenderSink,
};

/// Capture chunk length used when replaying a WAV file.
const INPUT_CHUNK_MS: u32 = 20;

/// WaaV Voice Client - realtime voice conversation client
#[derive(Parser, Debug)]
#[command(name = "waav-voice-client")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to the backend and hold a conversation
    Connect {
        /// 16-bit mono WAV file streamed as microphone input
        #[arg(short = 'i', long = "input", value_name = "WAV")]
        input: Option<PathBuf>,

        /// Write agent audio to this WAV file on exit
        #[arg(short = 'r', long = "record", value_name = "WAV")]
        record: Option<PathBuf>,

        /// Send a text message once connected
        #[arg(short = 't', long = "text")]
        text: Option<String>,

        /// Disconnect after this many seconds (runs until Ctrl-C otherwise)
        #[arg(short = 'd', long = "duration-secs")]
        duration_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Initialize crypto provider for TLS connections
    // This must be done before any TLS connections are attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration from file or environment
    let config = if let Some(config_path) = cli.config {
        info!("Loading configuration from {}", config_path.display());
        ClientConfig::from_file(&config_path).map_err(|e| anyhow!(e.to_string()))?
    } else {
        ClientConfig::from_env().map_err(|e| anyhow!(e.to_string()))?
    };

    match cli.command {
        Commands::Connect {
            input,
            record,
            text,
            duration_secs,
        } => {
            run_conversation(
                config,
                input,
                record,
                text,
                duration_secs.map(Duration::from_secs),
            )
            .await
        }
    }
}

async fn run_conversation(
    config: ClientConfig,
    input: Option<PathBuf>,
    record: Option<PathBuf>,
    text: Option<String>,
    duration: Option<Duration>,
) -> anyhow::Result<()> {
    if !config.has_auth_token() {
        anyhow::bail!("No auth token configured. Set VOICE_AUTH_TOKEN or connection.auth_token");
    }

    let client = RealtimeClient::with_websocket(config.to_client_config())?;

    let _lifecycle = client.on_lifecycle(|event| match event {
        LifecycleEvent::Reconnecting { attempt, delay } => {
            warn!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting")
        }
        LifecycleEvent::ReconnectionFailed { reason } => warn!(%reason, "Reconnection failed"),
        LifecycleEvent::Error(message) => warn!(%message, "Client error"),
        other => info!(event = ?other, "Lifecycle"),
    });
    let _events = client.on_any_event(|event| match event {
        ServerEvent::Transcript {
            role,
            text,
            is_final: true,
        } => info!(?role, %text, "Transcript"),
        ServerEvent::Error { code, message } => warn!(?code, %message, "Server error"),
        ServerEvent::Transcript { .. } => {}
        other => info!(kind = %other.kind(), "Event"),
    });
    let _turns = client.on_turn_change(|change| {
        info!(holder = %change.holder, can_send_input = change.can_send_input, "Turn changed")
    });

    // Agent audio goes to an offline render sink when recording
    let recorder = record.map(|path| {
        let sink = Arc::new(WavRenderSink::new(config.output_sample_rate));
        let scheduler = AudioEgressScheduler::new(sink.clone(), config.egress_config());
        let binding = scheduler.bind(&client);
        (path, sink, scheduler, binding)
    });

    // Microphone input is replayed from a WAV file
    let capture = match input {
        Some(path) => {
            let source = Arc::new(WavCaptureSource::open(&path, INPUT_CHUNK_MS)?);
            if source.sample_rate() != config.input_sample_rate {
                warn!(
                    file_rate = source.sample_rate(),
                    configured_rate = config.input_sample_rate,
                    "Input file sample rate differs from configuration"
                );
            }
            let bridge = AudioIngressBridge::new(source.clone(), config.respect_turn_state);
            bridge.set_client(Some(&client));
            Some((source, bridge))
        }
        None => None,
    };

    client.connect().await?;
    info!(session_id = ?client.session_id(), "Connected");

    if let Some(text) = text {
        client.send_command(&ClientCommand::UserText { text })?;
    }

    let capture_task = match &capture {
        Some((source, bridge)) => {
            bridge.start_streaming()?;
            Some(source.start())
        }
        None => None,
    };

    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
        _ = deadline => info!("Duration elapsed, shutting down"),
    }

    if let Some(task) = capture_task {
        task.abort();
    }
    if let Some((_, bridge)) = &capture {
        info!(status = ?bridge.status(), "Input summary");
        bridge.destroy();
    }

    client.disconnect();
    info!(stats = ?client.stats(), "Connection summary");

    if let Some((path, sink, scheduler, _binding)) = recorder {
        let samples = sink.finish(&path)?;
        info!(path = %path.display(), samples, status = ?scheduler.status(), "Recording saved");
    }

    client.destroy();
    Ok(())
}
