//! docmission - terminal control panel for documentation missions
//!
//! Hands a project folder to the agent server, streams the mission feed,
//! and saves the generated document.
//!
//! Usage:
//!   docmission ./my-service
//!   docmission ./my-service --server http://agent:8000 --output docs/README.md
//!   docmission ./my-service --stdout > documentation.md

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use docmission_core::{
    ClientConfig, LogEntry, LogLevel, MissionChange, MissionSession, MissionStatus, SessionUpdate,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "docmission")]
#[command(about = "Launch a documentation mission and follow it live")]
#[command(version)]
struct Args {
    /// Project folder to document
    project_path: PathBuf,

    /// Agent server URL, http(s) or ws(s) (overrides config and DOCMISSION_SERVER_URL)
    #[arg(short, long)]
    server: Option<String>,

    /// Where to save the generated document
    #[arg(short, long, conflicts_with = "stdout")]
    output: Option<PathBuf>,

    /// Print the document to stdout instead of saving it
    #[arg(long)]
    stdout: bool,

    /// Config file (default: ~/.docmission/config.yaml)
    #[arg(short, long, env = "DOCMISSION_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds to wait for the first connection
    #[arg(long)]
    connect_timeout: Option<u64>,
}

/// `RUST_LOG` wins; otherwise `DOCMISSION_LOG_LEVEL`, defaulting to warn
fn log_filter() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let directive = std::env::var("DOCMISSION_LOG_LEVEL")
        .map(|level| level_directive(&level))
        .unwrap_or_else(|_| "warn".to_string());
    EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Map the friendly level names onto filter directives
fn level_directive(level: &str) -> String {
    match level.trim().to_ascii_lowercase().as_str() {
        "silent" | "none" => "off".to_string(),
        "fatal" => "error".to_string(),
        "" => "warn".to_string(),
        other => other.to_string(),
    }
}

/// Stand-in for the folder picker: only existing directories get through
fn resolve_project_path(path: &Path) -> Result<String> {
    let resolved = path
        .canonicalize()
        .with_context(|| format!("Project folder not found: {}", path.display()))?;
    if !resolved.is_dir() {
        bail!("Not a directory: {}", resolved.display());
    }
    Ok(resolved.to_string_lossy().into_owned())
}

fn level_color(level: &LogLevel) -> &'static str {
    match level {
        LogLevel::Info => "\x1b[36m",
        LogLevel::Warning => "\x1b[33m",
        LogLevel::Error => "\x1b[31m",
        LogLevel::Success => "\x1b[32m",
        LogLevel::Other(_) => "\x1b[90m",
    }
}

fn print_entry(entry: &LogEntry) {
    eprintln!(
        "\x1b[90m[{}]\x1b[0m {}{}\x1b[0m {}",
        entry.timestamp.with_timezone(&chrono::Local).format("%H:%M:%S"),
        level_color(&entry.level),
        entry.level,
        entry.message
    );
}

fn render(updates: &[SessionUpdate]) {
    for update in updates {
        match update {
            SessionUpdate::Mission(MissionChange::LogAppended(entry)) => print_entry(entry),
            SessionUpdate::Connection { status, epoch } => {
                debug!(status = status.as_str(), epoch, "Connection changed");
                if !status.is_connected() {
                    eprintln!("\x1b[33mLost connection to the agent server, reconnecting...\x1b[0m");
                }
            }
            SessionUpdate::Mission(MissionChange::StatusChanged { .. }) => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(ClientConfig::default_path);
    let mut config = ClientConfig::load(&config_path);
    config.apply_env();
    config.override_server_url(args.server.clone());
    if let Some(secs) = args.connect_timeout {
        config.connect_timeout_secs = secs;
    }

    let project_path = resolve_project_path(&args.project_path)?;

    let mut session = MissionSession::new(config.transport_options());
    session.connect(&config.server_url)?;

    eprintln!("\x1b[90mConnecting to {}...\x1b[0m", config.server_url);
    let wait = Duration::from_secs(config.connect_timeout_secs.max(1));
    if !session.wait_for_connection(wait).await {
        bail!("Could not reach the agent server at {}", config.server_url);
    }
    render(&session.drain());

    session
        .start(&project_path)
        .context("Failed to launch mission")?;
    info!(project_path = %project_path, "Mission launched");
    eprintln!("\x1b[32mMission launched for {}\x1b[0m", project_path);

    // Main event loop
    let interrupted = tokio::select! {
        _ = async {
            while session.mission_status() == MissionStatus::Awaiting {
                match session.next_update().await {
                    Some(updates) => render(&updates),
                    None => break,
                }
            }
        } => false,

        _ = tokio::signal::ctrl_c() => true,
    };

    if interrupted {
        eprintln!("\n\x1b[33mInterrupted, disconnecting...\x1b[0m");
        render(&session.disconnect());
        std::process::exit(1);
    }

    let status = session.mission_status();
    let document = session.document().cloned();
    let report = session.report().cloned();
    session.disconnect();

    match (status, document) {
        (MissionStatus::Completed, Some(document)) => {
            if let Some(report) = report {
                eprintln!("\x1b[90mReview: {}\x1b[0m", report.status);
                for line in &report.feedback {
                    eprintln!("\x1b[90m  - {}\x1b[0m", line);
                }
            }

            if args.stdout {
                print!("{}", document.content);
            } else {
                let output = args.output.unwrap_or(config.output_file);
                document.write_to(&output)?;
                eprintln!("\x1b[32mDocumentation saved to {}\x1b[0m", output.display());
            }
            Ok(())
        }
        (status, _) => {
            eprintln!("\x1b[31mMission ended as {}\x1b[0m", status);
            std::process::exit(1);
        }
    }
}
