use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;
use tempo_core::{
    Identity, NotificationPort, SessionKind, SessionSnapshot, SyncConfig, SyncError, UiPort,
};
use tempo_engine::{EnginePorts, HttpSessionApi, SyncEngine};
use tempo_telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use tempo_transport::WsConnector;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;

#[derive(Parser, Debug)]
#[command(name = "tempo", about = "Realtime focus timer sync client")]
struct Args {
    /// JSON config file; missing keys use defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, env = "TEMPO_USER_ID")]
    user_id: String,

    /// Bearer token for the session API.
    #[arg(long, env = "TEMPO_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Session mode to select: pomodoro, break or long-break.
    #[arg(long, default_value = "pomodoro", value_parser = parse_mode)]
    mode: SessionKind,

    /// Start the selected session right away.
    #[arg(long)]
    start: bool,

    #[arg(long, default_value = "pretty", value_parser = parse_format)]
    log_format: LogFormat,

    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

fn parse_mode(s: &str) -> Result<SessionKind, String> {
    match s {
        "pomodoro" | "focus" => Ok(SessionKind::Focus),
        "break" => Ok(SessionKind::Break),
        "long-break" | "long_break" => Ok(SessionKind::LongBreak),
        other => Err(format!("unknown mode {other:?}")),
    }
}

fn parse_format(s: &str) -> Result<LogFormat, String> {
    match s {
        "json" => Ok(LogFormat::Json),
        "pretty" => Ok(LogFormat::Pretty),
        other => Err(format!("unknown log format {other:?}")),
    }
}

/// Renders snapshots and surfaced errors as log lines.
struct LogUi;

impl UiPort for LogUi {
    fn render(&self, snapshot: &SessionSnapshot) {
        tracing::info!(
            kind = %snapshot.kind,
            status = %snapshot.status,
            remaining = %snapshot.format_remaining(),
            progress = snapshot.progress(),
            "timer"
        );
    }

    fn report(&self, error: &SyncError) {
        if error.is_fatal() {
            tracing::error!(error = %error, "sync stopped");
        } else {
            tracing::warn!(error = %error, kind = error.error_kind(), "sync problem");
        }
    }
}

struct LogNotifier;

impl NotificationPort for LogNotifier {
    fn notify(&self, title: &str, body: &str) {
        tracing::info!(title, body, "notification");
    }

    fn play_alert(&self) {
        // Terminal bell.
        eprint!("\x07");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: args.log_level,
        format: args.log_format,
        ..TelemetryConfig::default()
    })?;

    let config = SyncConfig::load(args.config.as_deref()).context("failed to load config")?;
    tracing::info!(ws = %config.ws_base_url, api = %config.api_base_url, "starting tempo");

    let api_token = args.token.clone().map(SecretString::from);
    let api = HttpSessionApi::new(&config.api_base_url, api_token, config.request_timeout())
        .context("failed to build HTTP client")?;

    let engine = SyncEngine::new(
        &config,
        EnginePorts {
            connector: Arc::new(WsConnector::default()),
            api: Arc::new(api),
            notifier: Arc::new(LogNotifier),
            ui: Arc::new(LogUi),
        },
    );

    let mut states = WatchStream::new(engine.watch_connection());
    tokio::spawn(async move {
        while let Some(state) = states.next().await {
            tracing::info!(state = %state, "connection");
        }
    });

    let identity = Identity {
        user_id: args.user_id,
        token: args.token.map(SecretString::from),
    };
    engine.connect(&identity);

    engine.select_mode(args.mode).await?;
    if args.start {
        match engine.start().await {
            Ok(id) => tracing::info!(server_id = %id, "session started"),
            Err(e) => tracing::warn!(error = %e, "could not start session"),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!("shutting down");
    engine.shutdown().await;
    Ok(())
}
