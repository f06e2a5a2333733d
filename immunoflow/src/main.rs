//! `immunoflow` command-line front end.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};

use immunoflow::cancellation::CancellationToken;
use immunoflow::config::PipelineManifest;
use immunoflow::core::{ArtifactType, PipelineRun, PipelineRunStatus, SampleId};
use immunoflow::engine::{FailureMode, PipelineEngine};
use immunoflow::errors::ImmunoflowError;
use immunoflow::events::LoggingEventSink;
use immunoflow::invoke::CollaboratorInvoker;
use immunoflow::observability::init_tracing;
use immunoflow::store::{discover_raw_runs, ArtifactStore, CheckpointStore, FsArtifactStore, FsCheckpointStore};

/// Checkpointed immunopeptidomics pipeline runner
#[derive(Parser, Debug)]
#[command(name = "immunoflow")]
#[command(version)]
struct Cli {
    /// Pipeline manifest (JSON). Without one, the built-in catalog and a
    /// `.immunoflow` store in the current directory are used.
    #[arg(long, short, global = true, env = "IMMUNOFLOW_MANIFEST", value_name = "PATH")]
    manifest: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy a file or directory into the store as a source artifact
    Import {
        /// Sample the artifact belongs to
        #[arg(long)]
        sample: SampleId,
        /// Artifact type of the imported data
        #[arg(long = "type", default_value = "raw_run")]
        artifact_type: ArtifactType,
        /// File or directory to import
        path: PathBuf,
    },
    /// Find Bruker `.d` acquisitions (directories holding `analysis.tdf`)
    Discover {
        /// Directory to search recursively
        root: PathBuf,
        /// Import every acquisition found, named after its directory
        #[arg(long)]
        import: bool,
    },
    /// Print the stages needed to produce a target, without running them
    Plan(TargetArgs),
    /// Produce a target, reusing every valid checkpoint
    #[command(alias = "resume")]
    Run {
        #[command(flatten)]
        target: TargetArgs,
        /// Override the manifest's worker slots
        #[arg(long)]
        workers: Option<usize>,
        /// Stop scheduling new stages after the first failure
        #[arg(long)]
        fail_fast: bool,
    },
    /// Show artifacts and stage history of a sample
    Status {
        /// Sample to inspect
        #[arg(long)]
        sample: SampleId,
    },
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// Samples to process
    #[arg(long = "sample", required = true, num_args = 1..)]
    samples: Vec<SampleId>,
    /// Artifact type to produce
    #[arg(long, default_value = "ranked_list")]
    target: ArtifactType,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.json_logs) {
        eprintln!("failed to initialise logging: {e}");
    }
    match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<ExitCode> {
    let manifest = match &cli.manifest {
        Some(path) => PipelineManifest::load(path)?,
        None => PipelineManifest::default(),
    };

    match cli.command {
        Command::Import {
            sample,
            artifact_type,
            path,
        } => {
            let registry = manifest.build_registry()?;
            if !registry.is_source(artifact_type) {
                bail!("'{artifact_type}' is produced by a stage and cannot be imported");
            }
            let store = FsArtifactStore::open(&manifest.store_root).await?;
            let artifact = store.import(&path, &sample, artifact_type).await?;
            println!("{}\t{}\t{}", artifact.sample, artifact.artifact_type, artifact.id);
            Ok(ExitCode::SUCCESS)
        }
        Command::Discover { root, import } => discover(&manifest, &root, import).await,
        Command::Plan(args) => {
            let engine = build_engine(&manifest).await?;
            for sample in &args.samples {
                let plan = engine.plan(args.target, sample)?;
                println!("{sample} -> {}:", args.target);
                for (index, node) in plan.nodes.iter().enumerate() {
                    let inputs: Vec<String> =
                        node.stage.inputs.iter().map(ToString::to_string).collect();
                    println!(
                        "  {:>2}. {:<12} {} -> {}",
                        index + 1,
                        node.stage.id,
                        inputs.join(" + "),
                        node.stage.output
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            target,
            workers,
            fail_fast,
        } => {
            let mut manifest = manifest;
            if let Some(slots) = workers {
                manifest.engine.worker_slots = slots;
            }
            if fail_fast {
                manifest.engine.failure_mode = FailureMode::FailFast;
            }
            run(&manifest, cli.manifest.as_deref(), target).await
        }
        Command::Status { sample } => status(&manifest, &sample).await,
    }
}

async fn build_engine(manifest: &PipelineManifest) -> Result<PipelineEngine> {
    let registry = Arc::new(manifest.build_registry()?);
    let artifacts = Arc::new(
        FsArtifactStore::open(&manifest.store_root)
            .await
            .context("opening artifact store")?,
    );
    let checkpoints = Arc::new(
        FsCheckpointStore::open(&manifest.store_root)
            .await
            .context("opening checkpoint store")?,
    );
    Ok(PipelineEngine::new(
        registry,
        artifacts,
        checkpoints,
        Arc::new(CollaboratorInvoker::new()),
        manifest.engine.clone(),
    )
    .with_events(Arc::new(LoggingEventSink::default())))
}

async fn discover(manifest: &PipelineManifest, root: &Path, import: bool) -> Result<ExitCode> {
    let runs = discover_raw_runs(root)?;
    if runs.is_empty() {
        warn!(root = %root.display(), "No acquisitions found");
        return Ok(ExitCode::SUCCESS);
    }
    let store = if import {
        Some(FsArtifactStore::open(&manifest.store_root).await?)
    } else {
        None
    };
    for run in runs {
        match &store {
            Some(store) => {
                let artifact = store.import(&run.path, &run.sample, ArtifactType::RawRun).await?;
                println!("{}\t{}\t{}", run.sample, run.path.display(), artifact.id);
            }
            None => println!("{}\t{}", run.sample, run.path.display()),
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn run(manifest: &PipelineManifest, manifest_path: Option<&Path>, args: TargetArgs) -> Result<ExitCode> {
    let engine = build_engine(manifest).await?;
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel("interrupted");
        }
    });

    let requests = args
        .samples
        .iter()
        .map(|sample| {
            let mut resume = String::from("immunoflow");
            if let Some(path) = manifest_path {
                resume.push_str(&format!(" --manifest {}", path.display()));
            }
            resume.push_str(&format!(" run --sample {sample} --target {}", args.target));
            manifest
                .run_request(sample.clone(), args.target)
                .with_resume_command(resume)
        })
        .collect();

    let results = engine.run_samples(requests, &cancel).await;
    let tally = report(&args.samples, results, &mut std::io::stdout().lock())?;
    Ok(if tally.cancelled > 0 {
        ExitCode::from(130)
    } else if tally.failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// How many samples ended in each state.
#[derive(Debug, Default, PartialEq, Eq)]
struct Tally {
    completed: usize,
    failed: usize,
    cancelled: usize,
}

/// Prints one summary per sample. A sample rejected before execution is
/// reported and counted as failed; the others are still reported.
fn report(
    samples: &[SampleId],
    results: Vec<Result<PipelineRun, ImmunoflowError>>,
    out: &mut impl Write,
) -> std::io::Result<Tally> {
    let mut tally = Tally::default();
    for (sample, result) in samples.iter().zip(results) {
        let run = match result {
            Ok(run) => run,
            Err(e) => {
                error!(sample = %sample, error = %e, "Run rejected before execution");
                writeln!(out, "{sample}: not started: {e}")?;
                tally.failed += 1;
                continue;
            }
        };
        writeln!(out, "{}", run.summary())?;
        match run.status {
            PipelineRunStatus::Completed => {
                info!(sample = %run.sample, "Target ready");
                tally.completed += 1;
            }
            PipelineRunStatus::Cancelled => tally.cancelled += 1,
            _ => tally.failed += 1,
        }
    }
    Ok(tally)
}

async fn status(manifest: &PipelineManifest, sample: &SampleId) -> Result<ExitCode> {
    let artifacts = FsArtifactStore::open(&manifest.store_root).await?;
    let checkpoints = FsCheckpointStore::open(&manifest.store_root).await?;

    println!("artifacts:");
    for artifact in artifacts.list(sample).await {
        println!(
            "  {:<18} {}  {:<10} {} bytes",
            artifact.artifact_type.to_string(),
            artifact.id.short(),
            artifact.produced_by,
            artifact.size_bytes
        );
    }
    println!("stage runs:");
    for run in checkpoints.runs_for_sample(sample).await {
        let detail = run
            .error
            .as_ref()
            .map(|d| d.message.clone())
            .or_else(|| run.output.as_ref().map(|id| id.short().to_string()))
            .unwrap_or_default();
        println!(
            "  {:<12} {:<14} attempts={} {}",
            run.stage_id,
            run.status.to_string(),
            run.attempts,
            detail
        );
    }
    Ok(ExitCode::SUCCESS)
}
