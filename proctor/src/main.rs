//! Proctor - exam integrity monitor CLI.
//!
//! `proctor run` drives one exam session from JSON lines on stdin and
//! prints session notices as JSON lines on stdout. `proctor report`
//! summarizes the recorded violations afterwards.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use proctor::aggregate::{aggregate, events_from_records, render_table};
use proctor::detector::VirtualPlatform;
use proctor::events::EventBus;
use proctor::runtime::{ExamRuntime, Input};
use proctor::service::{DetectionService, HttpDetectionClient};
use proctor::session::{SessionConfig, SessionController, StoreSink};
use proctor::{DirectoryFrameSource, SessionOutcome};
use proctor_common::{
    FileStore, LoadedConfig, LogConfig, ProctorConfig, ProctorError, SessionIds, SessionStore,
    Severity, init_logging,
};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{Instrument, error, info, info_span, warn};

#[derive(Parser)]
#[command(name = "proctor")]
#[command(author, version, about = "Exam integrity monitor")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, env = "PROCTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an exam session, reading signals and commands from stdin
    Run {
        #[arg(long)]
        student_id: Option<String>,

        #[arg(long)]
        exam_id: Option<String>,

        /// Directory of JPEG frames used as the camera
        #[arg(long)]
        frames: Option<PathBuf>,

        /// Exam duration in minutes
        #[arg(long)]
        duration: Option<u32>,

        /// Detection service base URL
        #[arg(long)]
        service_url: Option<String>,
    },

    /// Summarize the violations recorded for a session
    Report {
        #[arg(long)]
        student_id: Option<String>,

        #[arg(long)]
        exam_id: Option<String>,

        /// Print rows as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the effective configuration
    Config,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut loaded = ProctorConfig::load(cli.config.as_deref()).map_err(|e| {
        let err = ProctorError::from(e);
        anyhow::anyhow!("{}\n{}", err, err.code().entry().format_full())
    })?;

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        loaded.config.general.log_level.clone()
    };
    let _guards = init_logging(&LogConfig::from_env(&level).with_stderr().with_level(level))
        .context("Failed to initialize logging")?;

    for finding in loaded.config.validate() {
        match finding.severity {
            Severity::Warning => warn!(field = finding.field, "{}", finding.message),
            Severity::Error => error!(field = finding.field, "{}", finding.message),
        }
    }

    match cli.command {
        Commands::Run {
            student_id,
            exam_id,
            frames,
            duration,
            service_url,
        } => {
            if let Some(dir) = frames {
                loaded.config.capture.frame_dir = Some(dir);
                loaded.mark_cli("capture.frame_dir");
            }
            if let Some(minutes) = duration {
                loaded.config.exam.duration_minutes = minutes;
                loaded.mark_cli("exam.duration_minutes");
            }
            if let Some(url) = service_url {
                loaded.config.service.base_url = url;
                loaded.mark_cli("service.base_url");
            }
            run(&loaded.config, student_id, exam_id).await
        }
        Commands::Report {
            student_id,
            exam_id,
            json,
        } => report(&loaded.config, student_id, exam_id, json).await,
        Commands::Config => show_config(&loaded),
    }
}

/// Resolve session ids: both flags override (and are persisted), otherwise
/// the stored ids are used.
fn resolve_ids(
    store: &dyn SessionStore,
    student_id: Option<String>,
    exam_id: Option<String>,
) -> Result<SessionIds, ProctorError> {
    match (student_id, exam_id) {
        (Some(student), Some(exam)) if !student.is_empty() && !exam.is_empty() => {
            let ids = SessionIds::new(student, exam);
            store.save_ids(&ids)?;
            Ok(ids)
        }
        _ => store.load_ids(),
    }
}

async fn run(
    config: &ProctorConfig,
    student_id: Option<String>,
    exam_id: Option<String>,
) -> Result<()> {
    let store: Arc<FileStore> = Arc::new(
        FileStore::open(config.storage.state_file()).context("Failed to open session store")?,
    );
    let ids = match resolve_ids(store.as_ref(), student_id, exam_id) {
        Ok(ids) => Some(ids),
        Err(e) => {
            warn!("{e}; violations will not be reported");
            None
        }
    };

    let run_id = uuid::Uuid::new_v4();
    let span = info_span!("session", %run_id, ids = ?ids.as_ref().map(ToString::to_string));

    let bus = EventBus::default();
    let printer = tokio::spawn(print_notices(bus.subscribe()));

    let controller = SessionController::new(
        SessionConfig::from(&config.exam),
        VirtualPlatform::new(),
        bus,
    );
    let service = Arc::new(HttpDetectionClient::new(&config.service));
    let frames = DirectoryFrameSource::from_config(&config.capture);
    let runtime = ExamRuntime::new(controller, service, ids, frames, StoreSink::new(store))
        .with_capture_retry(config.capture.capture_retry());

    let (tx, rx) = mpsc::channel(64);
    spawn_stdin_reader(tx);

    let outcome: SessionOutcome = runtime.run(rx).instrument(span).await;
    let _ = printer.await;

    info!(
        end_reason = ?outcome.end_reason,
        tab_switches = outcome.state.tab_switch_count,
        fullscreen_exits = outcome.state.fullscreen_exit_count,
        suspected_double_counts = outcome.suspected_double_counts,
        submission_failed = outcome.submission_failed,
        "Session finished"
    );
    Ok(())
}

/// Read JSON lines from stdin on a plain thread. A blocking read cannot be
/// cancelled, so it must not hold up runtime shutdown.
fn spawn_stdin_reader(tx: mpsc::Sender<Input>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match Input::parse_line(&line) {
                Ok(input) => {
                    if tx.blocking_send(input).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(line = %line, "Ignoring unrecognized input: {e}"),
            }
        }
    });
}

async fn print_notices(mut rx: broadcast::Receiver<String>) {
    loop {
        match rx.recv().await {
            Ok(line) => println!("{line}"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Notice output lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn report(
    config: &ProctorConfig,
    student_id: Option<String>,
    exam_id: Option<String>,
    json: bool,
) -> Result<()> {
    let store = FileStore::open(config.storage.state_file())
        .context("Failed to open session store")?;
    let ids = resolve_ids(&store, student_id, exam_id)
        .map_err(|e| anyhow::anyhow!(e.code().entry().format_full()))?;
    let counters = store.load_counters()?;

    let client = HttpDetectionClient::new(&config.service);
    let records = client
        .fetch_violations(&ids)
        .await
        .with_context(|| format!("Error fetching violations for {ids}"))?;
    let rows = aggregate(&events_from_records(&records), counters);

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        print!("{}", render_table(&rows));
    }
    Ok(())
}

fn show_config(loaded: &LoadedConfig) -> Result<()> {
    match &loaded.path {
        Some(path) => println!("# Loaded from {}", path.display()),
        None => println!("# No config file; using defaults"),
    }
    for (key, source) in &loaded.sources {
        println!("# {key}: {source}");
    }
    println!();
    print!(
        "{}",
        toml::to_string_pretty(&loaded.config).context("Failed to render config")?
    );
    Ok(())
}
