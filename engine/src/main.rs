mod state;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use veritas_alerts::{AlertConfig, FailureAlertPipe};
use veritas_attemptlog::AttemptLogWriter;
use veritas_eventbus::EventBus;
use veritas_supervisor::Supervisor;
use veritas_telemetry::metrics::MetricsAggregator;
use veritas_telemetry::query::TelemetryQuery;
use veritas_telemetry::store::{TelemetryConfig, TelemetryStore};
use veritas_trace::{TraceConfig, TraceRecorder};

use state::{InMemoryTaskStore, StaticAgentConfig, StdoutNotificationSink};

#[derive(Parser, Debug)]
#[command(name = "veritas-engine")]
#[command(about = "veritas-kanban supervisor/telemetry core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the core subsystems and hold them open until interrupted.
    /// No HTTP routes: this binary only demonstrates construction and
    /// wiring of the components an outer task-board service depends on.
    Serve {
        #[arg(long, env = "PORT", default_value_t = 3000)]
        port: u16,
        #[arg(long, env = "TELEMETRY_RETENTION_DAYS", default_value_t = 30)]
        telemetry_retention_days: u32,
        #[arg(long, env = "TELEMETRY_COMPRESS_DAYS", default_value_t = 7)]
        telemetry_compress_days: u32,
        #[arg(long)]
        state_dir: Option<String>,
    },
}

fn main() -> ExitCode {
    let (_guard, _info) = match veritas_observability::init_logging(&resolve_state_dir(None).join("logs"), 14) {
        Ok(pair) => pair,
        Err(err) => {
            eprintln!("failed to initialize logging: {err}");
            return ExitCode::from(2);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            tracing::error!(%err, "failed to start tokio runtime");
            return ExitCode::from(2);
        }
    };

    rt.block_on(async_main())
}

async fn async_main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { port, telemetry_retention_days, telemetry_compress_days, state_dir } => {
            let state_dir = resolve_state_dir(state_dir);

            if let Err(err) = std::fs::create_dir_all(state_dir.join("telemetry")) {
                tracing::error!(error = %err, path = %state_dir.display(), "could not create telemetry directory");
                return ExitCode::from(2);
            }

            let bus = EventBus::new();
            let log = AttemptLogWriter::new(&state_dir);
            let trace = TraceRecorder::new(&state_dir, TraceConfig::default());
            let telemetry = TelemetryStore::new(
                &state_dir,
                TelemetryConfig { enabled: true, retention_days: telemetry_retention_days, traces: true, compress_after_days: telemetry_compress_days },
            );
            let tasks = InMemoryTaskStore::seeded();
            let agent_config = StaticAgentConfig::default_roster();
            let alerts = FailureAlertPipe::new(AlertConfig::default(), std::sync::Arc::new(StdoutNotificationSink));

            let supervisor = Supervisor::new(bus.clone(), log, trace, telemetry.clone(), tasks.clone(), agent_config).with_alerts(alerts);
            let metrics = MetricsAggregator::new(TelemetryQuery::new(&state_dir), tasks.clone());
            // Keep both wired components alive for the process lifetime;
            // an outer HTTP layer would hold these the same way.
            let _ = (&supervisor, &metrics);

            log_startup_status(&state_dir, port);

            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("received shutdown signal, flushing telemetry"),
                Err(err) => tracing::warn!(%err, "failed to listen for ctrl-c, shutting down anyway"),
            }
            telemetry.flush().await;
            ExitCode::SUCCESS
        }
    }
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("VERITAS_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".veritas-kanban")
}

fn log_startup_status(state_dir: &PathBuf, port: u16) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let status = serde_json::json!({
        "status": "ready",
        "exe": exe.display().to_string(),
        "state_dir": state_dir.display().to_string(),
        "port": port,
    });
    println!("{status}");
    tracing::info!(%status, "veritas-engine ready");
}
