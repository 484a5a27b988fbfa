use crate::audio::{check_ffmpeg, check_ffprobe, create_chunk_files, get_audio_duration};
use crate::checkpoint::{
    chunk_artifact_dir, finalize, plan_chunks, source_fingerprint, store_path,
    write_chunk_artifact, CheckpointStore, ChunkSpec, ChunkStatus, FileRecord, PlanParams,
    ReassemblyMode, StoreOptions, StoreProgress,
};
use crate::config::{Config, PlanMismatchPolicy};
use crate::error::{Result, ScribeError};
use crate::shutdown::ShutdownCoordinator;
use crate::storage::{publish_transcript, LocalBlobStore};
use crate::transcribe::Transcriber;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

/// Exit status for a run stopped by a shutdown request (`EX_TEMPFAIL`).
pub const EXIT_INTERRUPTED: i32 = 75;

const RELEASED_ON_SHUTDOWN: &str = "Chunk released on shutdown";

/// Exponential backoff for retryable chunk failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per chunk within one run, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure: `base * 2^(attempt - 1)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exponent)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

/// Configuration for one transcription run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Source language code.
    pub language: String,
    /// Fixed chunk length in seconds.
    pub chunk_seconds: u64,
    /// Store location override.
    pub checkpoint_db: Option<PathBuf>,
    pub store: StoreOptions,
    pub plan_mismatch: PlanMismatchPolicy,
    pub reassembly: ReassemblyMode,
    pub retry: RetryPolicy,
    /// Directory to publish the finished transcript into.
    pub publish_dir: Option<PathBuf>,
    /// Show progress bars.
    pub show_progress: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl PipelineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            language: config.language.clone(),
            chunk_seconds: config.chunk_seconds,
            checkpoint_db: config.checkpoint_db.clone(),
            store: StoreOptions {
                resume: config.resume_checkpoint,
                reset: config.reset_checkpoint,
                sync_uri: config.checkpoint_sync_uri.clone(),
                ..StoreOptions::default()
            },
            plan_mismatch: config.plan_mismatch,
            reassembly: if config.strict_reassembly {
                ReassemblyMode::Strict
            } else {
                ReassemblyMode::BestEffort
            },
            retry: RetryPolicy {
                max_attempts: config.max_chunk_attempts,
                base_delay: Duration::from_millis(config.retry_base_delay_ms),
            },
            publish_dir: config.publish_dir.clone(),
            show_progress: true,
        }
    }
}

/// Counters for one pass of the claim loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub completed: usize,
    pub permanent_failures: usize,
    pub retries: usize,
    /// Chunks left `retryable_failed` after using up this run's attempts.
    pub deferred: usize,
}

/// How the claim loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    /// No claimable chunk is left.
    Drained(LoopStats),
    /// Shutdown was requested; unfinished chunks stay claimable for a later run.
    Interrupted { reason: String, stats: LoopStats },
}

/// Statistics from a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub output_path: PathBuf,
    pub job_id: String,
    pub transcript_sha256: String,
    pub total_chunks: usize,
    /// Chunk indices absent from the transcript.
    pub missing_chunks: Vec<usize>,
    pub loop_stats: LoopStats,
    pub progress: StoreProgress,
    pub audio_duration: Duration,
    pub total_time: Duration,
    pub provider: String,
    pub published_key: Option<String>,
}

/// Result of [`transcribe_file`].
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(RunSummary),
    Interrupted {
        reason: String,
        progress: StoreProgress,
    },
}

fn shutdown_reason(shutdown: &ShutdownCoordinator) -> String {
    shutdown.reason().unwrap_or_else(|| "unknown".to_string())
}

/// Claim and transcribe chunks until none are claimable or shutdown is requested.
///
/// Chunk-level failures are recorded in the store and do not end the loop. A
/// chunk whose transient failures outlast `retry.max_attempts` stays
/// `retryable_failed` and is skipped for the rest of the run. Claim contention
/// is retried with backoff up to `retry.max_attempts` times; other store
/// errors are returned.
#[allow(clippy::too_many_arguments)]
pub async fn process_claimed_chunks(
    store: &mut CheckpointStore,
    chunk_audio: &BTreeMap<usize, PathBuf>,
    artifact_dir: &Path,
    transcriber: &dyn Transcriber,
    language: &str,
    retry: &RetryPolicy,
    shutdown: &ShutdownCoordinator,
    progress: Option<&ProgressBar>,
) -> Result<LoopOutcome> {
    let mut stats = LoopStats::default();
    let mut attempts: HashMap<usize, u32> = HashMap::new();
    let mut deferred: BTreeSet<usize> = BTreeSet::new();
    let mut contention = 0u32;

    loop {
        if shutdown.should_stop() {
            return Ok(LoopOutcome::Interrupted {
                reason: shutdown_reason(shutdown),
                stats,
            });
        }

        let claimed = match store.claim_next_chunk_skipping(&deferred) {
            Ok(Some(claimed)) => claimed,
            Ok(None) => break,
            Err(e @ ScribeError::StoreContention(_)) => {
                contention += 1;
                if contention >= retry.max_attempts {
                    return Err(e);
                }
                warn!("Checkpoint store busy, retrying claim: {}", e);
                tokio::time::sleep(retry.delay(contention)).await;
                continue;
            }
            Err(e) => return Err(e),
        };
        contention = 0;
        let index = claimed.index;

        if shutdown.should_stop() {
            store.mark_chunk_failed(index, RELEASED_ON_SHUTDOWN, false)?;
            return Ok(LoopOutcome::Interrupted {
                reason: shutdown_reason(shutdown),
                stats,
            });
        }

        let Some(audio) = chunk_audio.get(&index).filter(|path| path.exists()) else {
            let err = ScribeError::ChunkInputMissing(index);
            error!("{}", err);
            store.mark_chunk_failed(index, &err.to_string(), true)?;
            stats.permanent_failures += 1;
            if let Some(pb) = progress {
                pb.inc(1);
            }
            continue;
        };

        let attempt = attempts.entry(index).or_insert(0);
        *attempt += 1;
        debug!(
            "Transcribing chunk {} ({:.1}s-{:.1}s), attempt {}",
            index, claimed.start_seconds, claimed.end_seconds, attempt
        );

        match transcriber.transcribe(audio, language).await {
            Ok(text) => {
                // Artifact must be durable before the chunk is recorded done.
                let (path, sha) = write_chunk_artifact(artifact_dir, index, &text)?;
                store.mark_chunk_done(index, &path.display().to_string(), &sha)?;
                stats.completed += 1;
                if let Some(pb) = progress {
                    pb.inc(1);
                }
            }
            Err(e) if e.is_retryable() && *attempt < retry.max_attempts => {
                let delay = retry.delay(*attempt);
                warn!(
                    "Chunk {} failed (attempt {}/{}), retrying in {}ms: {}",
                    index,
                    attempt,
                    retry.max_attempts,
                    delay.as_millis(),
                    e
                );
                store.mark_chunk_failed(index, &e.to_string(), false)?;
                stats.retries += 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    "Chunk {} still failing after {} attempts, leaving it for the next run: {}",
                    index, attempt, e
                );
                store.mark_chunk_failed(index, &e.to_string(), false)?;
                deferred.insert(index);
                stats.deferred += 1;
                if let Some(pb) = progress {
                    pb.inc(1);
                }
            }
            Err(e) => {
                error!("Chunk {} failed permanently: {}", index, e);
                store.mark_chunk_failed(index, &e.to_string(), true)?;
                stats.permanent_failures += 1;
                if let Some(pb) = progress {
                    pb.inc(1);
                }
            }
        }
    }

    Ok(LoopOutcome::Drained(stats))
}

/// Apply the plan-mismatch policy to chunks whose stored plan differs from `specs`.
fn reconcile_plan(
    store: &mut CheckpointStore,
    specs: &[ChunkSpec],
    mismatched: &[usize],
    policy: PlanMismatchPolicy,
) -> Result<()> {
    if mismatched.is_empty() {
        return Ok(());
    }

    match policy {
        PlanMismatchPolicy::Reject => Err(ScribeError::PlanMismatch {
            indices: mismatched.to_vec(),
        }),
        PlanMismatchPolicy::Replan => {
            let wanted: BTreeSet<usize> = mismatched.iter().copied().collect();
            let changed: Vec<ChunkSpec> = specs
                .iter()
                .filter(|spec| wanted.contains(&spec.index))
                .cloned()
                .collect();
            warn!(
                "Chunk plan changed for {} chunk(s); redoing them",
                changed.len()
            );
            store.replan_chunks(&changed)?;
            Ok(())
        }
        PlanMismatchPolicy::Reuse => {
            warn!(
                "Chunk plan changed for {} chunk(s); reusing earlier results",
                mismatched.len()
            );
            Ok(())
        }
    }
}

fn chunk_progress_bar(total: usize, done: usize) -> ProgressBar {
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.set_position(done as u64);
    pb
}

/// Transcribe `input` into `output`, resuming from and checkpointing into the
/// job's store.
pub async fn transcribe_file(
    input: &Path,
    output: &Path,
    transcriber: &dyn Transcriber,
    pipeline_config: &PipelineConfig,
    shutdown: &ShutdownCoordinator,
) -> Result<RunOutcome> {
    let start_time = Instant::now();

    if !input.exists() {
        return Err(ScribeError::FileNotFound(input.display().to_string()));
    }

    check_ffmpeg()?;
    check_ffprobe()?;

    let total_duration = get_audio_duration(input)?;
    let params = PlanParams {
        chunk_seconds: pipeline_config.chunk_seconds,
        language: pipeline_config.language.clone(),
        model: transcriber.model_id().to_string(),
    };
    let specs = plan_chunks(total_duration, &params)?;
    if specs.is_empty() {
        return Err(ScribeError::AudioExtraction(
            "No audio chunks available for transcription".to_string(),
        ));
    }

    info!(
        "Planned {} chunk(s) of {}s over {:.1}s of media",
        specs.len(),
        pipeline_config.chunk_seconds,
        total_duration
    );

    let db_path = store_path(output, pipeline_config.checkpoint_db.as_deref());
    let source_uri = input.display().to_string();
    let mut store = CheckpointStore::open(
        &db_path,
        &source_uri,
        &source_fingerprint(input),
        specs.len(),
        &pipeline_config.store,
    )?;

    let outcome = run_with_store(
        &mut store,
        input,
        output,
        &specs,
        transcriber,
        pipeline_config,
        shutdown,
    )
    .await;
    let closed = store.close();
    let outcome = outcome?;
    closed?;

    Ok(match outcome {
        RunOutcome::Completed(mut summary) => {
            summary.audio_duration = Duration::from_secs_f64(total_duration);
            summary.total_time = start_time.elapsed();
            RunOutcome::Completed(summary)
        }
        interrupted => interrupted,
    })
}

async fn run_with_store(
    store: &mut CheckpointStore,
    input: &Path,
    output: &Path,
    specs: &[ChunkSpec],
    transcriber: &dyn Transcriber,
    pipeline_config: &PipelineConfig,
    shutdown: &ShutdownCoordinator,
) -> Result<RunOutcome> {
    let registration = store.register_chunks(specs)?;
    reconcile_plan(
        store,
        specs,
        &registration.mismatched,
        pipeline_config.plan_mismatch,
    )?;

    let records = store.chunks()?;
    let wanted: BTreeSet<usize> = records
        .iter()
        .filter(|r| r.status.is_claimable() || r.status == ChunkStatus::Running)
        .map(|r| r.index)
        .collect();
    let already_done = records
        .iter()
        .filter(|r| r.status == ChunkStatus::Done)
        .count();
    if already_done > 0 {
        info!(
            "Resuming: {} of {} chunk(s) already transcribed",
            already_done,
            specs.len()
        );
    }

    // Chunk audio is cheap to regenerate and lives only for this run.
    let work_dir = TempDir::new()?;
    debug!("Using temp directory: {:?}", work_dir.path());

    let chunk_audio: BTreeMap<usize, PathBuf> = if wanted.is_empty() {
        BTreeMap::new()
    } else {
        let created = create_chunk_files(input, specs, &wanted, work_dir.path()).await?;
        if created.is_empty() {
            return Err(ScribeError::AudioExtraction(
                "No audio chunks could be extracted".to_string(),
            ));
        }
        created
            .into_iter()
            .map(|(index, chunk)| (index, chunk.path))
            .collect()
    };

    let artifact_dir = chunk_artifact_dir(output);
    let progress = pipeline_config
        .show_progress
        .then(|| chunk_progress_bar(specs.len(), already_done));

    info!("Transcribing with {}", transcriber.name());
    let loop_outcome = process_claimed_chunks(
        store,
        &chunk_audio,
        &artifact_dir,
        transcriber,
        &pipeline_config.language,
        &pipeline_config.retry,
        shutdown,
        progress.as_ref(),
    )
    .await?;

    if let Some(pb) = &progress {
        pb.finish_and_clear();
    }

    let loop_stats = match loop_outcome {
        LoopOutcome::Drained(stats) => stats,
        LoopOutcome::Interrupted { reason, stats } => {
            warn!(
                "Interrupted ({}) after {} chunk(s) this run; checkpoint saved",
                reason, stats.completed
            );
            return Ok(RunOutcome::Interrupted {
                reason,
                progress: store.progress()?,
            });
        }
    };

    if shutdown.should_stop() {
        return Ok(RunOutcome::Interrupted {
            reason: shutdown_reason(shutdown),
            progress: store.progress()?,
        });
    }

    let reassembly = finalize(
        store,
        &artifact_dir,
        specs.len(),
        output,
        pipeline_config.reassembly,
    )?;

    let published_key = match &pipeline_config.publish_dir {
        Some(dir) => {
            let blobs = LocalBlobStore::new(dir)?;
            Some(publish_transcript(
                &blobs,
                output,
                &reassembly.sha256,
                &input.display().to_string(),
            )?)
        }
        None => None,
    };

    Ok(RunOutcome::Completed(RunSummary {
        output_path: reassembly.output_path,
        job_id: store.job_id().to_string(),
        transcript_sha256: reassembly.sha256,
        total_chunks: specs.len(),
        missing_chunks: reassembly.missing,
        loop_stats,
        progress: store.progress()?,
        audio_duration: Duration::ZERO,
        total_time: Duration::ZERO,
        provider: transcriber.name().to_string(),
        published_key,
    }))
}

/// Look up the checkpoint state for `input` without changing it.
pub fn checkpoint_status(
    input: &Path,
    output: &Path,
    checkpoint_db: Option<&Path>,
) -> Result<Option<(FileRecord, StoreProgress)>> {
    let db_path = store_path(output, checkpoint_db);
    let Some(store) = CheckpointStore::open_existing(
        &db_path,
        &input.display().to_string(),
        &source_fingerprint(input),
    )?
    else {
        return Ok(None);
    };

    let record = store.file_record()?;
    let progress = store.progress()?;
    store.close()?;
    Ok(Some((record, progress)))
}

/// Print a summary of a completed run.
pub fn print_summary(summary: &RunSummary) {
    println!();
    println!("═══════════════════════════════════════════════════════════════");
    println!("                     Transcription Complete                    ");
    println!("═══════════════════════════════════════════════════════════════");
    println!();
    println!("  Output:     {}", summary.output_path.display());
    println!("  SHA-256:    {}", summary.transcript_sha256);
    println!("  Provider:   {}", summary.provider);
    println!(
        "  Duration:   {:.1}s audio",
        summary.audio_duration.as_secs_f64()
    );
    println!();
    println!("  Chunks:");
    println!(
        "    Done:        {}/{}",
        summary.progress.done, summary.total_chunks
    );
    println!("    This run:    {}", summary.loop_stats.completed);
    println!("    Retries:     {}", summary.loop_stats.retries);
    if summary.loop_stats.deferred > 0 {
        println!(
            "    {} {} (rerun to retry)",
            style("Deferred:").yellow(),
            summary.loop_stats.deferred
        );
    }
    if summary.progress.permanent_failed > 0 {
        println!(
            "    {} {}",
            style("Failed:").red(),
            summary.progress.permanent_failed
        );
    }
    if !summary.missing_chunks.is_empty() {
        println!();
        println!(
            "  {} transcript is missing chunk(s) {:?}",
            style("!").yellow(),
            summary.missing_chunks
        );
    }
    if let Some(ref key) = summary.published_key {
        println!("  Published:  {}", key);
    }
    println!(
        "  Total:      {:.2}s",
        summary.total_time.as_secs_f64()
    );
    println!();
    println!("═══════════════════════════════════════════════════════════════");
}

/// Print checkpoint progress for `--status`.
pub fn print_status(record: &FileRecord, progress: &StoreProgress) {
    println!();
    println!("  Job:        {}", record.job_id);
    println!("  Source:     {}", record.source_uri);
    println!(
        "  Chunks:     {}/{} done",
        style(progress.done).green(),
        record.total_chunks
    );
    println!("    pending:          {}", progress.pending);
    println!("    running:          {}", progress.running);
    println!("    retryable_failed: {}", progress.retryable_failed);
    println!("    permanent_failed: {}", progress.permanent_failed);
    if let Some(ref uri) = record.final_output_uri {
        println!("  Output:     {}", uri);
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_config_from_config() {
        let config = Config {
            strict_reassembly: true,
            resume_checkpoint: false,
            max_chunk_attempts: 5,
            retry_base_delay_ms: 250,
            ..Config::default()
        };
        let pipeline = PipelineConfig::from_config(&config);

        assert_eq!(pipeline.reassembly, ReassemblyMode::Strict);
        assert!(!pipeline.store.resume);
        assert_eq!(pipeline.retry.max_attempts, 5);
        assert_eq!(pipeline.retry.base_delay, Duration::from_millis(250));
        assert_eq!(pipeline.chunk_seconds, 600);
        assert!(pipeline.show_progress);
    }

    #[test]
    fn test_retry_delay_doubles() {
        let retry = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(retry.delay(1), Duration::from_millis(100));
        assert_eq!(retry.delay(2), Duration::from_millis(200));
        assert_eq!(retry.delay(3), Duration::from_millis(400));
        assert_eq!(retry.delay(0), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_missing_input() {
        let shutdown = ShutdownCoordinator::new();
        let transcriber = crate::transcribe::WhisperClient::new("sk-test".to_string());
        let result = transcribe_file(
            Path::new("/nonexistent/talk.mp4"),
            Path::new("/tmp/talk.txt"),
            &transcriber,
            &PipelineConfig::default(),
            &shutdown,
        )
        .await;
        assert!(matches!(result, Err(ScribeError::FileNotFound(_))));
    }
}
