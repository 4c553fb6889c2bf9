//! forgeline CLI
//!
//! Entry point for the `forgeline` command-line tool. `run` hosts the
//! pipeline over a watch directory of submission documents; `submit`,
//! `status`, and `replay` are offline helpers over the same data root.

use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use forgeline::{Coordinator, Journal, PipelineConfig};
use forgeline_protocol::{state, RequestId, SubmissionDoc};
use forgeline_worker::{BundleToolchain, ScriptTestDriver};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "forgeline")]
#[command(about = "Build-request dispatch and artifact-pipeline coordinator", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline service over a watch directory
    Run {
        /// Directory scanned for submission documents (*.json)
        #[arg(long)]
        watch: PathBuf,

        /// Path to a TOML config overlay
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Root directory for durable pipeline data
        #[arg(long)]
        data_root: Option<PathBuf>,
    },

    /// Validate a submission document and drop it into the watch directory
    Submit {
        /// Submission document (JSON)
        file: PathBuf,

        /// Watch directory of a running pipeline
        #[arg(long)]
        watch: PathBuf,
    },

    /// Print the stored record of a request
    Status {
        /// Request ID
        id: String,

        /// Root directory for durable pipeline data
        #[arg(long)]
        data_root: PathBuf,
    },

    /// Replay a request's transition journal and print the final state
    Replay {
        /// Request ID
        id: String,

        /// Root directory for durable pipeline data
        #[arg(long)]
        data_root: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run {
            watch,
            config,
            data_root,
        } => run(watch, config, data_root),
        Commands::Submit { file, watch } => submit(file, watch),
        Commands::Status { id, data_root } => status(&id, data_root),
        Commands::Replay { id, data_root } => replay(&id, data_root),
    };

    if let Err(message) = result {
        error!("{}", message);
        process::exit(1);
    }
}

fn load_config(config: Option<PathBuf>, data_root: Option<PathBuf>) -> Result<PipelineConfig, String> {
    let mut effective = match config {
        Some(path) => PipelineConfig::load(&path).map_err(|e| e.to_string())?,
        None => PipelineConfig::default(),
    };
    if let Some(root) = data_root {
        effective.data_root = root;
    }
    Ok(effective)
}

fn run(
    watch: PathBuf,
    config: Option<PathBuf>,
    data_root: Option<PathBuf>,
) -> Result<(), String> {
    let config = load_config(config, data_root)?;
    std::fs::create_dir_all(&watch).map_err(|e| e.to_string())?;

    let mut coordinator = Coordinator::new(
        config,
        Arc::new(BundleToolchain::new()),
        Arc::new(ScriptTestDriver::new()),
    )
    .map_err(|e| e.to_string())?;
    let dispatcher = coordinator.dispatcher();
    coordinator.start();

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .map_err(|e| e.to_string())?;
    }

    info!(watch = %watch.display(), "pipeline running");
    let mut last_sweep = Instant::now();
    while !stop.load(Ordering::SeqCst) {
        scan_watch_dir(&watch, &dispatcher);

        if last_sweep.elapsed() > Duration::from_secs(60) {
            match coordinator.sweep_retired() {
                Ok(0) => {}
                Ok(count) => info!(count, "retired requests swept"),
                Err(e) => warn!(error = %e, "retention sweep failed"),
            }
            last_sweep = Instant::now();
        }

        std::thread::sleep(Duration::from_millis(500));
    }

    info!("shutting down");
    coordinator.shutdown();
    coordinator.join();
    Ok(())
}

/// Submit every pending document in the watch directory, renaming each
/// to record the outcome (`.accepted` / `.rejected`).
fn scan_watch_dir(watch: &std::path::Path, dispatcher: &forgeline::Dispatcher) {
    let entries = match std::fs::read_dir(watch) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "watch directory unreadable");
            return;
        }
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().map(|e| e != "json").unwrap_or(true) {
            continue;
        }
        let outcome = std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|text| serde_json::from_str::<SubmissionDoc>(&text).map_err(|e| e.to_string()))
            .and_then(|doc| dispatcher.submit(doc).map_err(|e| e.to_string()));
        let suffix = match outcome {
            Ok(request_id) => {
                info!(request_id = %request_id, file = %path.display(), "submission accepted");
                "accepted"
            }
            Err(reason) => {
                warn!(file = %path.display(), reason, "submission rejected");
                "rejected"
            }
        };
        if let Err(e) = std::fs::rename(&path, path.with_extension(suffix)) {
            warn!(file = %path.display(), error = %e, "could not mark submission");
        }
    }
}

fn submit(file: PathBuf, watch: PathBuf) -> Result<(), String> {
    let text = std::fs::read_to_string(&file).map_err(|e| e.to_string())?;
    // Parse first so a malformed document never reaches the watch dir.
    let doc: SubmissionDoc = serde_json::from_str(&text).map_err(|e| e.to_string())?;

    std::fs::create_dir_all(&watch).map_err(|e| e.to_string())?;
    let name = format!("submission-{}.json", ulid::Ulid::new());
    let target = watch.join(&name);
    std::fs::write(&target, serde_json::to_string_pretty(&doc).map_err(|e| e.to_string())?)
        .map_err(|e| e.to_string())?;
    info!(file = %target.display(), "submission queued for pickup");
    Ok(())
}

fn status(id: &str, data_root: PathBuf) -> Result<(), String> {
    let journal = Journal::open(data_root.join("state")).map_err(|e| e.to_string())?;
    let stored = journal
        .load(&RequestId::from_string(id))
        .map_err(|e| e.to_string())?;
    println!(
        "{}",
        serde_json::to_string_pretty(&stored).map_err(|e| e.to_string())?
    );
    Ok(())
}

fn replay(id: &str, data_root: PathBuf) -> Result<(), String> {
    let journal = Journal::open(data_root.join("state")).map_err(|e| e.to_string())?;
    let history = journal
        .load_history(&RequestId::from_string(id))
        .map_err(|e| e.to_string())?;
    for record in &history {
        println!(
            "{} seq={} gen={} {:?}",
            record.at.to_rfc3339(),
            record.seq,
            record.lease_generation,
            record.state
        );
    }
    let final_state = state::replay(&history).map_err(|e| e.to_string())?;
    println!("final: {:?}", final_state);
    Ok(())
}
