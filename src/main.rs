use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use browser_pool::config::EngineConfig;
use browser_pool::scheduler::StateDump;
use browser_pool::shutdown::install_shutdown_handler;
use browser_pool::worker::{EngineKind, EngineProcess};

#[derive(Parser, Debug)]
#[command(name = "browser-pool")]
#[command(version)]
#[command(about = "Pool of headless-browser engines for DOM exploration and taint tracing")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// List the supported browser engines
    Engines {
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Boot engine processes and keep them alive until interrupted
    Boot(BootArgs),

    /// Inspect a suspended pool's state
    State {
        /// Directory the pool was suspended to
        directory: PathBuf,

        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

#[derive(Parser, Debug)]
struct BootArgs {
    /// Browser engine to boot
    #[arg(long, default_value = "chrome")]
    engine: EngineKind,

    /// Amount of engine processes
    #[arg(long, default_value = "1")]
    size: usize,

    /// Custom engine command line, "{port}" is replaced with the picked port
    #[arg(long, num_args = 1.., allow_hyphen_values = true)]
    command: Option<Vec<String>>,

    /// Shut down after this many seconds instead of waiting for a signal
    #[arg(long)]
    hold_secs: Option<u64>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Output Types
// =============================================================================

#[derive(Serialize)]
struct EngineOutput {
    engine: String,
    command: String,
}

#[derive(Serialize)]
struct BootedEngineOutput {
    id: usize,
    engine: String,
    pid: Option<u32>,
    lifeline_pid: u32,
    endpoint: String,
}

#[derive(Serialize)]
struct StateOutput {
    queued_jobs: usize,
    pending_job_counter: usize,
    callbacks: usize,
    skip_states: usize,
    queued_job_count: u64,
    completed_job_count: u64,
    time_out_count: u64,
    failed_count: u64,
    seconds_per_job: f64,
}

// =============================================================================
// Commands
// =============================================================================

fn handle_engines(output_format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let engines: Vec<EngineOutput> = EngineKind::SUPPORTED
        .iter()
        .map(|kind| EngineOutput {
            engine: kind.to_string(),
            command: kind.default_command().join(" "),
        })
        .collect();

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&engines)?),
        OutputFormat::Table => {
            println!("{:<10} DEFAULT COMMAND", "ENGINE");
            println!("{}", "-".repeat(45));
            for engine in engines {
                println!("{:<10} {}", engine.engine, engine.command);
            }
        }
    }
    Ok(())
}

async fn handle_boot(args: BootArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = EngineConfig::new(args.engine);
    if let Some(command) = args.command {
        config = config.with_command(command);
    }

    let shutdown_token = install_shutdown_handler();

    let spawned = futures::future::join_all(
        (0..args.size.max(1)).map(|_| EngineProcess::spawn(&config)),
    )
    .await;

    let mut engines = Vec::with_capacity(spawned.len());
    let mut failure = None;
    for result in spawned {
        match result {
            Ok(engine) => engines.push(engine),
            Err(e) => failure = Some(e),
        }
    }
    if let Some(e) = failure {
        for engine in &mut engines {
            engine.shutdown(false).await;
        }
        return Err(e.into());
    }

    let booted: Vec<BootedEngineOutput> = engines
        .iter()
        .enumerate()
        .map(|(id, engine)| BootedEngineOutput {
            id,
            engine: engine.kind().to_string(),
            pid: engine.pid(),
            lifeline_pid: engine.lifeline_pid(),
            endpoint: engine.endpoint().to_string(),
        })
        .collect();

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&booted)?),
        OutputFormat::Table => {
            println!(
                "{:<4} {:<8} {:<8} {:<10} ENDPOINT",
                "ID", "ENGINE", "PID", "LIFELINE"
            );
            println!("{}", "-".repeat(60));
            for engine in &booted {
                let pid = engine
                    .pid
                    .map(|pid| pid.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<4} {:<8} {:<8} {:<10} {}",
                    engine.id, engine.engine, pid, engine.lifeline_pid, engine.endpoint
                );
            }
        }
    }

    match args.hold_secs {
        Some(secs) => {
            tokio::select! {
                _ = shutdown_token.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
            }
        }
        None => shutdown_token.cancelled().await,
    }

    tracing::info!(engines = engines.len(), "Shutting down engines");
    for engine in &mut engines {
        engine.shutdown(false).await;
    }
    Ok(())
}

fn handle_state(
    directory: PathBuf,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let dump = StateDump::load(&directory)?;
    let stats = dump.statistics;

    let output = StateOutput {
        queued_jobs: dump.jobs.len(),
        pending_job_counter: dump.pending_job_counter,
        callbacks: dump.callbacks.len(),
        skip_states: dump.skip_states.len(),
        queued_job_count: stats.queued_job_count,
        completed_job_count: stats.completed_job_count,
        time_out_count: stats.time_out_count,
        failed_count: stats.failed_count,
        seconds_per_job: stats.seconds_per_job,
    };

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Table => {
            println!("Suspended Pool");
            println!("{}", "=".repeat(40));
            println!("Queued jobs:      {}", output.queued_jobs);
            println!("Pending jobs:     {}", output.pending_job_counter);
            println!("Callbacks:        {}", output.callbacks);
            println!("Skip states:      {}", output.skip_states);
            println!();
            println!("Queued (total):   {}", output.queued_job_count);
            println!("Completed:        {}", output.completed_job_count);
            println!("Timed out:        {}", output.time_out_count);
            println!("Failed:           {}", output.failed_count);
            println!("Seconds per job:  {:.3}", output.seconds_per_job);
            if !dump.jobs.is_empty() {
                println!();
                println!("{:<38} {:<16} RESOURCE", "JOB ID", "TYPE");
                println!("{}", "-".repeat(70));
                for job in &dump.jobs {
                    let resource = job.resource().map(|r| r.url().to_string()).unwrap_or_default();
                    println!("{:<38} {:<16} {}", job.id, job.kind.name(), resource);
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Engines { output } => handle_engines(&output)?,
        Commands::Boot(boot_args) => handle_boot(boot_args).await?,
        Commands::State { directory, output } => handle_state(directory, &output)?,
    }

    Ok(())
}
