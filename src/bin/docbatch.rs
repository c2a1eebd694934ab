//! CLI binary for edgequake-docbatch.
//!
//! A thin shim over the library crate: flags become `JobSettings`, the
//! configuration file and `DOCBATCH_*` variables become a `ConfigManager`,
//! and engine events drive the progress bar.

use anyhow::{bail, Context, Result};
use clap::Parser;
use edgequake_docbatch::batch::StaticProbe;
use edgequake_docbatch::history::MAX_HISTORY_ITEMS;
use edgequake_docbatch::{
    BatchEngine, ConfigManager, FileRef, JobEvent, JobId, JobResults, JobSettings, JobState,
    OutputFormat, PerformanceHistory, TaskOutcome, TaskState, VlmExecutor,
};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert a folder of scans, four at a time, into ./out
  docbatch scans/*.pdf --workers 4 --output-dir out

  # Stricter acceptance, no quality retries
  docbatch invoice.pdf --threshold 0.85 --no-auto-retry

  # Pin every file to one profile
  docbatch --profile gpt-4.1 form.png

  # Machine-readable results on stdout
  docbatch --json report.pdf > results.json

  # Write the effective configuration (defaults + file + env) and exit
  docbatch --config docbatch.json --export-config effective.json

CONFIGURATION:
  The JSON document has four sections: models, performance, quality,
  user_preferences. Any leaf can be overridden from the environment as
  DOCBATCH_<SECTION>_<FIELD>, e.g.

    DOCBATCH_PERFORMANCE_MAX_WORKERS=8
    DOCBATCH_QUALITY_MIN_CONFIDENCE_THRESHOLD=0.8
    DOCBATCH_MODELS_GPT_4_1_TIMEOUT_SECS=240

  Precedence: environment > file > built-in defaults.

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          Needed by OpenAI profiles (gpt-4.1)
  OLLAMA_HOST             Ollama endpoint for the local profiles
  PDFIUM_LIB_PATH         Directory or file of libpdfium (else the system library)
  RUST_LOG                Overrides -v / -q log filtering
"#;

/// Convert batches of documents to Markdown with Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "docbatch",
    version,
    about = "Convert batches of documents to Markdown with Vision LLMs",
    long_about = "Convert PDFs, scans, photos and text files to Markdown in parallel. Every \
result is scored; files below the quality threshold are retried with a stronger model profile \
or fallback settings before the best attempt is kept.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Files to convert.
    files: Vec<PathBuf>,

    /// Write one output file per input here instead of printing to stdout.
    #[arg(short, long, env = "DOCBATCH_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Configuration document (JSON). Missing file means built-in defaults.
    #[arg(short, long, env = "DOCBATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Performance history file; loaded before and saved after the run.
    #[arg(long, env = "DOCBATCH_HISTORY")]
    history: Option<PathBuf>,

    /// Worker pool size for this job (1–64).
    #[arg(short, long, env = "DOCBATCH_WORKERS",
          value_parser = clap::value_parser!(u16).range(1..=64))]
    workers: Option<u16>,

    /// Pin every file to this model profile; disables escalation.
    #[arg(short, long, env = "DOCBATCH_PROFILE")]
    profile: Option<String>,

    /// Minimum accepted quality score (0.0–1.0).
    #[arg(short, long, env = "DOCBATCH_THRESHOLD")]
    threshold: Option<f64>,

    /// Accept the first scored attempt, even below the threshold.
    #[arg(long, env = "DOCBATCH_NO_AUTO_RETRY")]
    no_auto_retry: bool,

    /// Retries per file after timeouts or transport errors (0–10).
    #[arg(long, env = "DOCBATCH_MAX_RETRIES")]
    max_retries: Option<u32>,

    /// Print all results as one JSON document on stdout.
    #[arg(long, env = "DOCBATCH_JSON")]
    json: bool,

    /// Disable the progress bar.
    #[arg(long, env = "DOCBATCH_NO_PROGRESS")]
    no_progress: bool,

    /// Write the effective configuration to this path and exit if no files
    /// were given.
    #[arg(long)]
    export_config: Option<PathBuf>,

    /// Skip resource probing; admission is bounded only by the task cap.
    #[arg(long, env = "DOCBATCH_NO_BACKPRESSURE")]
    no_backpressure: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DOCBATCH_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "DOCBATCH_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar carries the per-file feedback; keep INFO logs out of
    // its way unless asked for.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Configuration and history ────────────────────────────────────────
    // Loaded at the widest bound; the config manager trims it to
    // `user_preferences.max_history_items` once the document is known.
    let history = match &cli.history {
        Some(path) if path.exists() => PerformanceHistory::load(path, MAX_HISTORY_ITEMS)
            .with_context(|| format!("Failed to load history from {}", path.display()))?,
        _ => PerformanceHistory::default(),
    };
    let history = Arc::new(history);
    let config = Arc::new(
        ConfigManager::from_env(cli.config.as_deref(), Arc::clone(&history))
            .context("Failed to load configuration")?,
    );

    if let Some(path) = &cli.export_config {
        config
            .export_config(path)
            .with_context(|| format!("Failed to export configuration to {}", path.display()))?;
        if !cli.quiet {
            eprintln!("{} configuration written to {}", green("✔"), bold(&path.display().to_string()));
        }
        if cli.files.is_empty() {
            return Ok(());
        }
    }
    if cli.files.is_empty() {
        bail!("No input files given");
    }

    let settings = build_settings(&cli)?;
    let doc = config.snapshot();
    let output_format = doc.user_preferences.output_format;

    // ── Engine ───────────────────────────────────────────────────────────
    let mut builder = BatchEngine::builder().config(Arc::clone(&config));
    if cli.no_backpressure {
        builder = builder.resource_probe(Arc::new(StaticProbe::default()));
    }
    let engine = Arc::new(builder.build());
    let executor = Arc::new(VlmExecutor::from_config(&doc));

    let files = cli.files.iter().map(FileRef::path).collect();
    let job_id = engine
        .create_batch_job(files, settings)
        .await
        .context("Failed to create batch job")?;

    let progress = show_progress.then(|| spawn_progress(&engine, job_id, cli.files.len()));
    engine
        .start_batch_processing(job_id, executor)
        .context("Failed to start batch job")?;

    // ── Wait, honouring Ctrl-C ───────────────────────────────────────────
    let state = tokio::select! {
        r = engine.wait_for_job(job_id) => r?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("{} cancelling… (in-flight files will finish)", yellow("⚠"));
            engine.cancel_job(job_id)?;
            engine.wait_for_job(job_id).await?
        }
    };
    if let Some(handle) = progress {
        // The bar task ends on JobFinished; don't hang if that event was lost.
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }

    let results = engine.get_job_results(job_id)?;
    emit_results(&cli, &results, output_format)?;

    if let Some(path) = &cli.history {
        history
            .save(path)
            .with_context(|| format!("Failed to save history to {}", path.display()))?;
    }

    if !cli.quiet {
        print_summary(&results);
    }
    match state {
        JobState::Failed => bail!("Every file failed"),
        JobState::Cancelled => bail!("Job cancelled"),
        _ => Ok(()),
    }
}

/// Map CLI flags to job-level overrides.
fn build_settings(cli: &Cli) -> Result<JobSettings> {
    let mut b = JobSettings::builder();
    if let Some(n) = cli.workers {
        b = b.max_workers(n as usize);
    }
    if let Some(p) = &cli.profile {
        b = b.profile(p.clone());
    }
    if let Some(t) = cli.threshold {
        b = b.quality_threshold(t);
    }
    if cli.no_auto_retry {
        b = b.enable_auto_retry(false);
    }
    if let Some(n) = cli.max_retries {
        b = b.max_retries(n);
    }
    b.build().context("Invalid job settings")
}

/// Render engine events for one job as an indicatif bar.
fn spawn_progress(
    engine: &BatchEngine,
    job_id: JobId,
    total: usize,
) -> tokio::task::JoinHandle<()> {
    let mut events = engine.event_stream();
    let bar = ProgressBar::new(total as u64);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} files  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS),
    );
    bar.set_prefix("Converting");
    bar.enable_steady_tick(Duration::from_millis(80));

    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if event.job_id() != job_id {
                continue;
            }
            match event {
                JobEvent::TaskStarted { file_id, .. } => bar.set_message(file_id),
                JobEvent::Retrying {
                    file_id,
                    next_attempt,
                    reason,
                    profile,
                    ..
                } => bar.println(format!(
                    "  {} {file_id}  {}",
                    yellow("↻"),
                    dim(&format!("attempt {next_attempt} ({reason:?}) with {profile}")),
                )),
                JobEvent::Throttled {
                    memory_mb,
                    cpu_percent,
                    ..
                } => bar.set_message(format!("throttled: {memory_mb} MB, {cpu_percent:.0}% CPU")),
                JobEvent::TaskFinished {
                    file_id,
                    state,
                    score,
                    ..
                } => {
                    let mark = match state {
                        TaskState::Completed => green("✓"),
                        TaskState::CompletedLowQuality => yellow("~"),
                        _ => red("✗"),
                    };
                    let score = score.map(|s| format!("{s:.2}")).unwrap_or_else(|| "-".into());
                    bar.println(format!("  {mark} {file_id:<40}  {}", dim(&format!("score {score}"))));
                    bar.inc(1);
                }
                JobEvent::JobFinished { .. } => break,
                _ => {}
            }
        }
        bar.finish_and_clear();
    })
}

/// Write results to the output directory, or print them.
fn emit_results(cli: &Cli, results: &JobResults, format: OutputFormat) -> Result<()> {
    if cli.json {
        let json = serde_json::to_string_pretty(results).context("Failed to serialise results")?;
        println!("{json}");
        return Ok(());
    }

    if let Some(dir) = &cli.output_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let written = results
            .results
            .iter()
            .filter(|(_, outcome)| outcome.text().is_some())
            .map(|(file_id, _)| file_id.as_str());
        for (file_id, path) in output_paths(dir, written, format) {
            let outcome = &results.results[file_id];
            let Some(text) = outcome.text() else {
                continue;
            };
            let body = match format {
                OutputFormat::Json => {
                    serde_json::to_string_pretty(outcome).context("Failed to serialise result")?
                }
                OutputFormat::Markdown | OutputFormat::Text => text.to_string(),
            };
            std::fs::write(&path, body)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        return Ok(());
    }

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    for (file_id, outcome) in &results.results {
        if let Some(text) = outcome.text() {
            writeln!(handle, "<!-- {file_id} -->\n{text}").context("Failed to write to stdout")?;
        }
    }
    Ok(())
}

/// `<dir>/<file stem>.<ext>` per result, in `file_ids` order. Repeated stems
/// get `-2`, `-3`, ... so no two results share a path.
fn output_paths<'a>(
    dir: &Path,
    file_ids: impl IntoIterator<Item = &'a str>,
    format: OutputFormat,
) -> Vec<(&'a str, PathBuf)> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    file_ids
        .into_iter()
        .map(|file_id| {
            let stem = Path::new(file_id)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("output");
            let n = seen.entry(stem.to_string()).or_insert(0);
            *n += 1;
            let name = if *n == 1 {
                format!("{stem}.{}", format.extension())
            } else {
                format!("{stem}-{n}.{}", format.extension())
            };
            (file_id, dir.join(name))
        })
        .collect()
}

fn print_summary(results: &JobResults) {
    let mut ok = 0;
    let mut low = 0;
    let mut failed = 0;
    let mut skipped = 0;
    for (file_id, outcome) in &results.results {
        match outcome {
            TaskOutcome::Completed { .. } => ok += 1,
            TaskOutcome::CompletedLowQuality { .. } => low += 1,
            TaskOutcome::Failed { error, .. } => {
                failed += 1;
                eprintln!("  {} {file_id}: {}", red("✗"), red(&error.to_string()));
            }
            TaskOutcome::Cancelled => skipped += 1,
        }
    }
    let mark = match results.state {
        JobState::Completed => green("✔"),
        JobState::Failed => red("✘"),
        _ => yellow("⚠"),
    };
    eprintln!(
        "{mark} {}  {} ok  {} low quality  {} failed  {} not started",
        bold(&results.state.to_string()),
        ok,
        low,
        failed,
        skipped
    );
}
