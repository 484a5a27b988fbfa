use anyhow::{Context, Result};
use chunkscribe::config::{Config, PlanMismatchPolicy, Provider};
use chunkscribe::transcribe::create_transcriber;
use chunkscribe::{
    checkpoint_status, print_status, print_summary, transcribe_file, PipelineConfig,
    PreemptionPoller, RunOutcome, ShutdownCoordinator, EXIT_INTERRUPTED,
};
use clap::Parser;
use console::style;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "chunkscribe")]
#[command(version, about = "Resumable transcription of long media files")]
#[command(long_about = "Transcribe long audio/video files chunk by chunk. Progress is checkpointed, so an interrupted run picks up where it stopped.")]
struct Cli {
    /// Input video/audio file
    input: PathBuf,

    /// Output transcript file (defaults to input name with .txt)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Transcription provider: openai, whisper-cpp
    #[arg(short, long)]
    provider: Option<String>,

    /// Model identifier (API model name or ggml model path)
    #[arg(short, long)]
    model: Option<String>,

    /// Source language code (e.g., en, ja, es)
    #[arg(short, long)]
    language: Option<String>,

    /// Chunk length in seconds
    #[arg(long)]
    chunk_seconds: Option<u64>,

    /// Resume from an existing checkpoint (default)
    #[arg(long)]
    resume: bool,

    /// Ignore any existing checkpoint and start over
    #[arg(long)]
    no_resume: bool,

    /// Delete the checkpoint store before starting
    #[arg(long)]
    reset_checkpoint: bool,

    /// Checkpoint store location (relative paths resolve against the output directory)
    #[arg(long)]
    checkpoint_db: Option<PathBuf>,

    /// What to do when a resumed chunk was planned differently: reject, replan, reuse
    #[arg(long)]
    plan_mismatch: Option<String>,

    /// Fail instead of writing a transcript with missing chunks
    #[arg(long)]
    strict_reassembly: bool,

    /// Watch for spot instance interruption notices and stop cleanly
    #[arg(long)]
    spot_drain: bool,

    /// Seconds between spot interruption checks
    #[arg(long)]
    spot_poll_interval: Option<f64>,

    /// Copy the finished transcript into this directory
    #[arg(long)]
    publish_dir: Option<PathBuf>,

    /// Print checkpoint progress for the input and exit
    #[arg(long)]
    status: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

fn derive_output_path(input: &Path) -> PathBuf {
    input.with_extension("txt")
}

fn apply_cli(config: &mut Config, cli: &Cli) -> Result<()> {
    if let Some(ref provider) = cli.provider {
        config.provider = provider
            .parse::<Provider>()
            .map_err(|e| anyhow::anyhow!(e))?;
    }
    if let Some(ref model) = cli.model {
        config.model = model.clone();
    }
    if let Some(ref language) = cli.language {
        config.language = language.clone();
    }
    if let Some(secs) = cli.chunk_seconds {
        config.chunk_seconds = secs;
    }
    if cli.no_resume {
        config.resume_checkpoint = false;
    } else if cli.resume {
        config.resume_checkpoint = true;
    }
    if cli.reset_checkpoint {
        config.reset_checkpoint = true;
    }
    if let Some(ref path) = cli.checkpoint_db {
        config.checkpoint_db = Some(path.clone());
    }
    if let Some(ref policy) = cli.plan_mismatch {
        config.plan_mismatch = policy
            .parse::<PlanMismatchPolicy>()
            .map_err(|e| anyhow::anyhow!(e))?;
    }
    if cli.strict_reassembly {
        config.strict_reassembly = true;
    }
    if cli.spot_drain {
        config.spot_drain_enabled = true;
    }
    if let Some(secs) = cli.spot_poll_interval {
        config.spot_poll_interval_secs = secs;
    }
    if let Some(ref dir) = cli.publish_dir {
        config.publish_dir = Some(dir.clone());
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<ExitCode> {
    if !cli.input.exists() {
        anyhow::bail!("Input file not found: {}", cli.input.display());
    }

    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| derive_output_path(&cli.input));

    let mut config = Config::load().context("Failed to load configuration")?;
    apply_cli(&mut config, &cli)?;

    if cli.status {
        match checkpoint_status(&cli.input, &output, config.checkpoint_db.as_deref())
            .context("Failed to read checkpoint")?
        {
            Some((record, progress)) => print_status(&record, &progress),
            None => println!("No checkpoint found for {}", cli.input.display()),
        }
        return Ok(ExitCode::SUCCESS);
    }

    config.validate().context("Configuration validation failed")?;

    info!("Input:    {}", cli.input.display());
    info!("Output:   {}", output.display());
    info!("Provider: {}", config.provider);
    info!("Model:    {}", config.model);
    info!("Language: {}", config.language);

    let shutdown = ShutdownCoordinator::new();
    shutdown
        .install_signal_handlers()
        .context("Failed to install signal handlers")?;

    let poller = if config.spot_drain_enabled {
        let poller = PreemptionPoller::new(config.metadata_endpoint.clone())
            .context("Failed to create metadata client")?;
        Some(shutdown.spawn_preemption_poller(poller, config.spot_poll_interval()))
    } else {
        None
    };

    let transcriber = create_transcriber(&config).context("Failed to create transcriber")?;
    let pipeline_config = PipelineConfig::from_config(&config);

    let outcome = transcribe_file(
        &cli.input,
        &output,
        transcriber.as_ref(),
        &pipeline_config,
        &shutdown,
    )
    .await;

    if let Some(handle) = poller {
        handle.abort();
    }

    match outcome.context("Transcription failed")? {
        RunOutcome::Completed(summary) => {
            print_summary(&summary);
            Ok(ExitCode::SUCCESS)
        }
        RunOutcome::Interrupted { reason, progress } => {
            warn!(
                "Interrupted by {}: {}/{} chunks done, checkpoint saved",
                reason, progress.done, progress.total
            );
            println!(
                "{} Interrupted ({}), checkpoint saved. Rerun to resume.",
                style("!").yellow(),
                reason
            );
            Ok(ExitCode::from(EXIT_INTERRUPTED as u8))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
