//! Junction CLI
//!
//! The `junction` command operates a junction deployment.
//!
//! ## Commands
//!
//! - `start-all`: launch every configured worker and supervise it
//! - `stop-all`: stop a running supervisor (or its orphaned workers)
//! - `restart`: ask the running supervisor to restart one worker
//! - `status`: worker liveness, restart counts and the latest health snapshot
//! - `submit`: run one signal through the pipeline
//! - `evaluate`: quality-gate a file
//! - `health`: run one self-healing pass

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn, Level};

use junction_core::process::{
    pid_alive, read_pid_file, remove_pid_file, request_restart, terminate_pid, write_pid_file,
    SupervisorStatus, TokioLauncher,
};
use junction_core::quality_gate::{ValidationLog, ValidationRecord};
use junction_core::{
    init_tracing, ArtifactType, HealthSnapshot, HealthStatus, JunctionConfig, JunctionContext,
    LogFormat, RunStatus, SignalInput, StateStore,
};

#[derive(Parser)]
#[command(name = "junction")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Signal pipeline, role hub and self-supervision", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log line format: text, compact or json
    #[arg(long, global = true, env = "JUNCTION_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Shorthand for `--log-format json`
    #[arg(long, global = true)]
    json_logs: bool,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "JUNCTION_CONFIG")]
    config: Option<PathBuf>,

    /// State directory; overrides `state_dir` from the config file
    #[arg(long, global = true, env = "JUNCTION_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch all workers in dependency order and supervise them until
    /// interrupted
    StartAll,

    /// Stop the running supervisor and its workers
    StopAll,

    /// Restart one worker through the running supervisor
    Restart {
        /// Worker name as configured
        worker: String,
    },

    /// Show worker liveness, restart counts and health
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Run one signal through the pipeline
    Submit {
        /// Signal text (reads --file when omitted)
        #[arg(long, conflicts_with = "file")]
        text: Option<String>,

        /// Read the signal payload from a file
        #[arg(long)]
        file: Option<PathBuf>,

        /// Where the signal came from
        #[arg(long, default_value = "cli")]
        origin: String,

        /// Explicit signal id (derived from the content when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Media reference attached to the signal
        #[arg(long)]
        media: Option<String>,
    },

    /// Score an artifact with the quality gate
    Evaluate {
        /// Artifact to evaluate
        file: PathBuf,

        /// Source instruction the artifact should address
        #[arg(long, default_value = "")]
        instruction: String,

        /// Artifact type: article, summary or post
        #[arg(long = "type", default_value = "article")]
        artifact_type: ArtifactType,
    },

    /// Run one self-healing check and print the snapshot
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        cli.log_format
    };
    init_tracing(format, level);

    let mut config = JunctionConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(dir) = cli.state_dir {
        config.state_dir = dir;
    }

    match cli.command {
        Commands::StartAll => cmd_start_all(config).await,
        Commands::StopAll => cmd_stop_all(&config).await,
        Commands::Restart { worker } => cmd_restart(&config, &worker),
        Commands::Status { json } => cmd_status(&config, json),
        Commands::Submit {
            text,
            file,
            origin,
            id,
            media,
        } => cmd_submit(config, text, file.as_deref(), origin, id, media).await,
        Commands::Evaluate {
            file,
            instruction,
            artifact_type,
        } => cmd_evaluate(&config, &file, &instruction, artifact_type),
        Commands::Health => cmd_health(config).await,
    }
}

async fn cmd_start_all(config: JunctionConfig) -> Result<()> {
    let ctx = JunctionContext::new(config).context("Invalid configuration")?;
    if let Some(pid) = read_pid_file(&ctx.store)? {
        if pid != std::process::id() && pid_alive(pid) {
            bail!("supervisor already running (pid {pid})");
        }
    }
    write_pid_file(&ctx.store).context("Failed to write pid file")?;

    let launcher = TokioLauncher::new().with_log_dir(ctx.store.root().join("logs"));
    let supervisor = ctx
        .process_supervisor(Arc::new(launcher))
        .context("Failed to build process supervisor")?;
    let health = ctx.spawn_health_monitor();

    let ctx = Arc::new(ctx);
    let signals = {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            wait_for_termination().await;
            info!("termination requested");
            ctx.shutdown();
        })
    };

    info!(workers = ctx.config.supervisor.workers.len(), "starting supervisor");
    supervisor.run(ctx.shutdown_signal()).await;

    signals.abort();
    if let Err(e) = health.await {
        warn!(error = %e, "health monitor task failed");
    }
    remove_pid_file(&ctx.store).context("Failed to remove pid file")?;
    println!("all workers stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable; waiting for ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn cmd_stop_all(config: &JunctionConfig) -> Result<()> {
    let store = open_store(config)?;
    let grace = config.supervisor.stop_timeout() + Duration::from_secs(2);

    if let Some(pid) = read_pid_file(&store)? {
        if pid_alive(pid) {
            terminate_pid(pid).with_context(|| format!("Failed to signal supervisor {pid}"))?;
            if !wait_for_exit(pid, grace).await {
                bail!("supervisor {pid} did not stop within {}s", grace.as_secs());
            }
            println!("supervisor {pid} stopped");
            return Ok(());
        }
        remove_pid_file(&store)?;
    }

    // No live supervisor: stop any workers its last status still lists.
    let Some(status) = SupervisorStatus::load(&store)? else {
        println!("nothing to stop");
        return Ok(());
    };
    let mut failed = Vec::new();
    for worker in status.workers {
        let Some(pid) = worker.pid.filter(|pid| pid_alive(*pid)) else {
            continue;
        };
        if terminate_pid(pid).is_err() || !wait_for_exit(pid, grace).await {
            failed.push(worker.name);
        } else {
            println!("stopped {} (pid {pid})", worker.name);
        }
    }
    if !failed.is_empty() {
        bail!("failed to stop: {}", failed.join(", "));
    }
    Ok(())
}

async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !pid_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    !pid_alive(pid)
}

fn cmd_restart(config: &JunctionConfig, worker: &str) -> Result<()> {
    if !config.supervisor.workers.iter().any(|w| w.name == worker) {
        bail!("unknown worker: {worker}");
    }
    let store = open_store(config)?;
    let running = read_pid_file(&store)?.is_some_and(pid_alive);
    if !running {
        bail!("no supervisor is running; use start-all");
    }
    request_restart(&store, worker).context("Failed to write restart request")?;
    println!("restart of {worker} requested");
    Ok(())
}

#[derive(Serialize)]
struct StatusReport {
    supervisor_running: bool,
    supervisor: Option<SupervisorStatus>,
    health: Option<HealthSnapshot>,
}

fn cmd_status(config: &JunctionConfig, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let report = StatusReport {
        supervisor_running: read_pid_file(&store)?.is_some_and(pid_alive),
        supervisor: SupervisorStatus::load(&store)?,
        health: HealthSnapshot::latest(&store)?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "supervisor: {}",
        if report.supervisor_running {
            "running"
        } else {
            "stopped"
        }
    );
    match &report.supervisor {
        Some(status) => {
            println!("workers (as of {}):", status.updated_at.to_rfc3339());
            for w in &status.workers {
                let pid = w.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
                println!(
                    "  {:<20} {:<8} pid {:<8} restarts {}/{}{}",
                    w.name,
                    format!("{:?}", w.state).to_lowercase(),
                    pid,
                    w.restarts,
                    w.max_restarts,
                    if w.critical { "  critical" } else { "" }
                );
            }
        }
        None => println!("workers: no status recorded"),
    }
    match &report.health {
        Some(h) => {
            println!(
                "health: {} at {} ({} issue(s), {} auto-fix(es))",
                h.status.as_str(),
                h.timestamp.to_rfc3339(),
                h.issues.len(),
                h.auto_fixes.len()
            );
            for issue in &h.issues {
                println!("  - {}: {}", issue.component, issue.message);
            }
        }
        None => println!("health: no snapshot recorded"),
    }
    Ok(())
}

async fn cmd_submit(
    config: JunctionConfig,
    text: Option<String>,
    file: Option<&Path>,
    origin: String,
    id: Option<String>,
    media: Option<String>,
) -> Result<()> {
    let payload = match (text, file) {
        (Some(text), _) => text.into_bytes(),
        (None, Some(path)) => {
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?
        }
        (None, None) => bail!("provide --text or --file"),
    };

    let ctx = JunctionContext::new(config).context("Invalid configuration")?;
    if ctx.register_specialists().await == 0 {
        bail!("no generator command configured; set [generator].command");
    }

    let mut input = SignalInput {
        id,
        origin,
        payload,
        media_ref: None,
    };
    if let Some(media) = media {
        input = input.with_media(media);
    }

    let run = ctx.executor.submit(input).await?;
    println!("{}", serde_json::to_string_pretty(&run)?);
    ctx.shutdown();
    if run.status == RunStatus::Error {
        bail!(
            "run {} failed: {}",
            run.id,
            run.reason.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn cmd_evaluate(
    config: &JunctionConfig,
    file: &Path,
    instruction: &str,
    artifact_type: ArtifactType,
) -> Result<()> {
    let artifact = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let gate = junction_core::QualityGate::new(config.quality.clone());
    let judgment = gate.evaluate(&artifact, instruction, artifact_type);

    let store = open_store(config)?;
    ValidationLog::new(store.validation_log_path()).append(&ValidationRecord {
        timestamp: Utc::now(),
        signal_id: None,
        run_id: None,
        attempt: 0,
        judgment: judgment.clone(),
    })?;

    println!("{}", serde_json::to_string_pretty(&judgment)?);
    Ok(())
}

async fn cmd_health(config: JunctionConfig) -> Result<()> {
    let ctx = JunctionContext::new(config).context("Invalid configuration")?;
    let snapshot = ctx.health_supervisor().check().await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    if snapshot.status == HealthStatus::Critical {
        warn!("health is critical");
    }
    Ok(())
}

fn open_store(config: &JunctionConfig) -> Result<StateStore> {
    StateStore::open(&config.state_dir).with_context(|| {
        format!(
            "Failed to open state directory {}",
            config.state_dir.display()
        )
    })
}
