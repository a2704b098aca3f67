use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use pipeline_actions::engine::StepStatus;
use pipeline_actions::prelude::*;
use tracing_subscriber::EnvFilter;
#[cfg(feature = "otel")]
use tracing_subscriber::layer::SubscriberExt;
#[cfg(feature = "otel")]
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "pipeline-actions")]
#[command(about = "Run declarative CI/CD pipelines", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline file for one trigger event
    Run {
        /// Path to the pipeline YAML file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Event name (push, pull_request, workflow_dispatch, ...)
        #[arg(short, long, default_value = "push")]
        event: String,

        /// Git ref of the event (e.g. refs/heads/main)
        #[arg(long = "ref", default_value = "")]
        git_ref: String,

        /// Commit SHA
        #[arg(long, default_value = "")]
        sha: String,

        /// Identity that triggered the event
        #[arg(long, default_value = "")]
        actor: String,

        /// Repository slug (owner/name)
        #[arg(long)]
        repository: Option<String>,

        /// JSON event payload; replaces the event flags
        #[arg(long)]
        event_file: Option<PathBuf>,

        /// Path to runner.yaml (default: next to FILE)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Maximum number of parallel jobs (overrides config)
        #[arg(short, long)]
        parallel: Option<usize>,

        /// Default step timeout in milliseconds (overrides config)
        #[arg(short, long)]
        timeout: Option<u64>,

        /// YAML secrets file (overrides config)
        #[arg(long)]
        secrets_file: Option<PathBuf>,

        /// Directory for the JSON run record (overrides config)
        #[arg(long)]
        record_dir: Option<PathBuf>,

        /// Print the run result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate pipeline files without running them
    Validate {
        /// Path to pipeline file or directory
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },

    /// Show the execution levels of a pipeline
    Plan {
        /// Path to the pipeline YAML file
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// List pipelines in a directory
    List {
        /// Path to the pipelines directory
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
}

/// How a command ended, mapped onto the process exit code
enum Outcome {
    Success,
    Failure,
    Cancelled,
}

#[cfg(feature = "otel")]
fn init_otel_tracing(verbose: bool) -> anyhow::Result<()> {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::runtime::Tokio;
    use opentelemetry_sdk::trace::TracerProvider;

    let filter = if verbose {
        "pipeline_actions=debug"
    } else {
        "pipeline_actions=info"
    };

    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&otlp_endpoint)
        .build()?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .build();

    let tracer = provider.tracer("pipeline-actions");
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(otel_layer)
        .init();

    opentelemetry::global::set_tracer_provider(provider);
    Ok(())
}

#[cfg(not(feature = "otel"))]
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        "pipeline_actions=debug"
    } else {
        "pipeline_actions=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    #[cfg(feature = "otel")]
    if let Err(e) = init_otel_tracing(cli.verbose) {
        eprintln!("Failed to initialize tracing: {}", e);
        return ExitCode::from(2);
    }

    #[cfg(not(feature = "otel"))]
    init_tracing(cli.verbose);

    let result = run(cli).await;

    #[cfg(feature = "otel")]
    opentelemetry::global::shutdown_tracer_provider();

    match result {
        Ok(Outcome::Success) => ExitCode::SUCCESS,
        Ok(Outcome::Failure) => ExitCode::from(1),
        Ok(Outcome::Cancelled) => ExitCode::from(130),
        Err(e) => {
            tracing::error!(error = %e, "Pipeline run failed");
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<Outcome> {
    match cli.command {
        Commands::Run {
            file,
            event,
            git_ref,
            sha,
            actor,
            repository,
            event_file,
            config,
            parallel,
            timeout,
            secrets_file,
            record_dir,
            json,
        } => {
            let trigger = match event_file {
                Some(path) => load_event(&path)?,
                None => {
                    let trigger = TriggerEvent::new(event)
                        .with_ref(git_ref)
                        .with_sha(sha)
                        .with_actor(actor);
                    match repository {
                        Some(repo) => trigger.with_repository(repo),
                        None => trigger,
                    }
                }
            };

            let mut config = load_config(config.as_deref(), &file)?;
            if let Some(p) = parallel {
                config.parallel = p;
            }
            if let Some(t) = timeout {
                config.step_timeout = t;
            }
            if let Some(s) = secrets_file {
                config.secrets.file = Some(s);
            }
            if let Some(r) = record_dir {
                config.record_dir = Some(r);
            }

            run_pipeline(file, trigger, config, json).await
        }
        Commands::Validate { path } => validate(path),
        Commands::Plan { file } => plan(file),
        Commands::List { dir } => list_pipelines(dir),
    }
}

fn load_event(path: &Path) -> anyhow::Result<TriggerEvent> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read event file {}: {}", path.display(), e))?;
    Ok(serde_json::from_str(&content)?)
}

/// Explicit config path, else `runner.yaml` next to the pipeline, else defaults
fn load_config(explicit: Option<&Path>, pipeline: &Path) -> anyhow::Result<RunnerConfig> {
    if let Some(path) = explicit {
        return Ok(RunnerConfig::load(path)?);
    }
    let dir = if pipeline.is_dir() {
        pipeline
    } else {
        pipeline.parent().unwrap_or_else(|| Path::new("."))
    };
    Ok(RunnerConfig::discover(dir)?.unwrap_or_default())
}

#[tracing::instrument(skip(trigger, config), fields(file = %file.display()))]
async fn run_pipeline(
    file: PathBuf,
    trigger: TriggerEvent,
    config: RunnerConfig,
    json: bool,
) -> anyhow::Result<Outcome> {
    if !file.exists() {
        tracing::error!(path = %file.display(), "Pipeline file not found");
        anyhow::bail!("Pipeline file not found: {}", file.display());
    }

    let workflow = WorkflowLoader::load_file(&file)?;
    let executor = Executor::from_config(config)?;

    let cancel = executor.cancel_handle();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let result = executor.run(&workflow, trigger).await;
    ctrl_c.abort();

    let result = match result {
        Ok(result) => result,
        Err(ExecutorError::NotTriggered {
            workflow,
            event,
            git_ref,
        }) => {
            println!(
                "Pipeline '{}' is not triggered by '{}' on '{}'; nothing to run",
                workflow, event, git_ref
            );
            return Ok(Outcome::Success);
        }
        Err(e) => return Err(e.into()),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_run_result(&result);
    }

    Ok(match result.status {
        RunStatus::Success => Outcome::Success,
        RunStatus::Failure => Outcome::Failure,
        RunStatus::Cancelled => Outcome::Cancelled,
    })
}

fn validate(path: PathBuf) -> anyhow::Result<Outcome> {
    if !path.exists() {
        anyhow::bail!("Path not found: {}", path.display());
    }

    let executor = Executor::from_config(load_config(None, &path)?)?;

    if path.is_dir() {
        let workflows = WorkflowLoader::load_directory(&path)?;
        if workflows.is_empty() {
            println!("No pipelines found in: {}", path.display());
            return Ok(Outcome::Success);
        }

        let mut invalid = 0;
        for workflow in &workflows {
            match executor.plan(workflow) {
                Ok(graph) => println!(
                    "✓ {} ({} jobs, {} execution levels)",
                    workflow.name,
                    graph.len(),
                    graph.execution_levels().len()
                ),
                Err(e) => {
                    invalid += 1;
                    println!("✗ {}: {}", workflow.name, e);
                }
            }
        }

        if invalid > 0 {
            println!("\n{} of {} pipelines invalid", invalid, workflows.len());
            return Ok(Outcome::Failure);
        }
        println!("\n{} pipelines validated", workflows.len());
    } else {
        let workflow = WorkflowLoader::load_file(&path)?;
        if let Err(e) = executor.plan(&workflow) {
            println!("✗ {}: {}", path.display(), e);
            return Ok(Outcome::Failure);
        }
        println!("✓ {} is valid", path.display());
    }

    Ok(Outcome::Success)
}

fn plan(file: PathBuf) -> anyhow::Result<Outcome> {
    if !file.exists() {
        anyhow::bail!("Pipeline file not found: {}", file.display());
    }

    let executor = Executor::from_config(load_config(None, &file)?)?;
    let workflow = WorkflowLoader::load_file(&file)?;
    let graph = executor.plan(&workflow)?;

    println!("Pipeline: {}", graph.workflow_name());
    println!("Digest: {}\n", graph.digest());

    for (i, level) in graph.execution_levels().iter().enumerate() {
        println!("Level {}:", i);
        for id in level {
            let Some(job) = graph.get_job(id) else { continue };
            let mut notes = Vec::new();
            if !job.needs.is_empty() {
                notes.push(format!("needs: {}", job.needs.join(", ")));
            }
            if job.optional {
                notes.push("optional".to_string());
            }
            if let Some(condition) = &job.condition {
                notes.push(format!("if: {}", condition));
            }

            if notes.is_empty() {
                println!("  {} ({} steps)", id, job.steps.len());
            } else {
                println!("  {} ({} steps; {})", id, job.steps.len(), notes.join("; "));
            }
        }
    }

    Ok(Outcome::Success)
}

fn list_pipelines(dir: PathBuf) -> anyhow::Result<Outcome> {
    if !dir.exists() {
        anyhow::bail!("Directory not found: {}", dir.display());
    }

    let workflows = WorkflowLoader::load_directory(&dir)?;

    if workflows.is_empty() {
        println!("No pipelines found in: {}", dir.display());
        return Ok(Outcome::Success);
    }

    println!("Pipelines in {}:\n", dir.display());

    for w in &workflows {
        let triggers = if w.on.is_empty() {
            "any event".to_string()
        } else {
            w.on.event_names().join(", ")
        };
        println!("  {} ({} jobs; on: {})", w.name, w.jobs.len(), triggers);
    }

    Ok(Outcome::Success)
}

fn print_run_result(result: &RunResult) {
    println!("\n=== Run Result ===\n");
    println!("Status: {}", result.status);
    println!("Run ID: {}", result.run_id);
    println!("Duration: {}ms\n", result.duration_ms());

    for level in &result.execution_levels {
        for id in level {
            let Some(job) = result.jobs.get(id) else { continue };
            let marker = match job.status {
                JobStatus::Succeeded => "✓",
                JobStatus::Skipped => "-",
                JobStatus::Cancelled => "!",
                _ => "✗",
            };
            let optional = if job.optional { " [optional]" } else { "" };
            println!("{} Job: {} ({}){}", marker, id, job.status, optional);

            for step in &job.steps {
                let step_marker = match step.status {
                    StepStatus::Succeeded => "  ✓",
                    StepStatus::NotRun => "  -",
                    StepStatus::Cancelled => "  !",
                    StepStatus::Failed => "  ✗",
                };
                println!("{} {} ({}ms)", step_marker, step.name, step.duration_ms);
                if let Some(err) = &step.error {
                    println!("      Error: {}", err);
                }
            }
            if let Some(err) = &job.error {
                println!("  Error: {}", err);
            }
        }
    }
}
