use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use interview_coach::{
    default_settings_path, load_settings, CpalBackend, InterviewSession, LiveTransport,
    SessionState,
};

/// Practice a job interview out loud against a live AI hiring manager
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Interview context (role, seniority, company, ...)
    #[arg(long, conflicts_with = "context_file")]
    context: Option<String>,

    /// Read the interview context from a file
    #[arg(long, value_name = "PATH")]
    context_file: Option<PathBuf>,

    /// Override the live model from settings
    #[arg(long)]
    model: Option<String>,

    /// Settings file (defaults to <config dir>/interview-coach/settings.json)
    #[arg(long, value_name = "PATH")]
    settings: Option<PathBuf>,

    /// End the session after this many seconds without hearing the interviewer
    #[arg(long, value_name = "SECS")]
    inactivity_timeout: Option<u64>,

    /// Print the session log when the interview ends
    #[arg(long)]
    print_log: bool,
}

fn read_context(cli: &Cli) -> anyhow::Result<String> {
    match (&cli.context, &cli.context_file) {
        (Some(text), _) => Ok(text.clone()),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read context file {}", path.display())),
        (None, None) => bail!("Provide the interview context with --context or --context-file"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (for development convenience)
    // Silently ignore if not found - production uses system env vars
    let _ = dotenvy::dotenv();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // rustls needs a process-wide crypto provider for the wss:// connection
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    let context = read_context(&cli)?;

    let settings_path = match &cli.settings {
        Some(path) => path.clone(),
        None => default_settings_path()?,
    };
    let mut settings = load_settings(&settings_path);
    if let Some(model) = &cli.model {
        settings.model = model.clone();
    }
    if let Some(secs) = cli.inactivity_timeout {
        settings.inactivity_timeout_secs = Some(secs);
    }

    let transport = LiveTransport::from_env(settings.endpoint.clone(), settings.connect_retries)?;
    let session = InterviewSession::new(settings, Arc::new(CpalBackend), Arc::new(transport));
    log::info!("Starting interview session {}", session.id());

    let mut log_rx = session.log().subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = log_rx.recv().await {
            println!("{}", event);
        }
    });

    session.start(&context)?;
    println!("Press Ctrl+C to end the interview.");

    let final_state = tokio::select! {
        state = session.wait_finished() => state,
        _ = tokio::signal::ctrl_c() => {
            println!();
            session.stop();
            session.wait_finished().await
        }
    };

    printer.abort();

    if cli.print_log {
        println!("--- session log ---");
        for line in session.log().lines() {
            println!("{}", line);
        }
    }

    let metrics = serde_json::to_string_pretty(&session.metrics())?;
    log::debug!("Session metrics: {}", metrics);

    if final_state == SessionState::Failed {
        bail!("Interview session failed");
    }
    Ok(())
}
