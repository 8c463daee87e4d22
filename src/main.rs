use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use gatehouse::definition::PipelineDefinition;
use gatehouse::listener::{WEBHOOK_PATH, WebhookListener};
use gatehouse::lockfile::generate_lock;
use gatehouse::naming::ContainerScope;
use gatehouse::observability::log_snapshot;
use gatehouse::pipeline::{PipelineSettings, StageRegistry, build_pipeline};
use gatehouse::process::SystemRunner;
use gatehouse::quality::GateBoard;
use gatehouse::run::{PipelineRun, RunStatus, StageStatus};
use gatehouse::stages;
use gatehouse::templates::{TEMPLATES, generate_template};
use gatehouse::validation::{ValidationReport, validate_definition};
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let otlp_endpoint_for_tracing = match &cli.command {
        Commands::Run(args) => args.otlp_endpoint.clone(),
        _ => None,
    };

    configure_tracing(otlp_endpoint_for_tracing.as_deref())?;

    let command_result = match cli.command {
        Commands::Run(args) => run_pipeline(args),
        Commands::ListStages => {
            list_stages();
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate { definition } => {
            validate_cmd(&definition).map(|()| ExitCode::SUCCESS)
        }
        Commands::Lock { definition, output } => {
            lock_cmd(&definition, output).map(|()| ExitCode::SUCCESS)
        }
        Commands::Init { template, output } => {
            let generated = generate_template(&template, &output)?;
            info!(
                template = %template,
                path = %generated.display(),
                "Pipeline definition generated"
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "gatehouse", &mut io::stdout());
            Ok(ExitCode::SUCCESS)
        }
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint_for_tracing.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    command_result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "gatehouse")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        } else {
            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        }
    }

    #[cfg(not(feature = "otel"))]
    {
        if let Some(endpoint) = otlp_endpoint {
            eprintln!(
                "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
                endpoint
            );
        }

        tracing_subscriber::registry()
            .with(filter.clone())
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?;
    }

    Ok(())
}

fn run_pipeline(args: RunArgs) -> Result<ExitCode> {
    let mut definition = PipelineDefinition::load(&args.definition)?;
    if let Some(scope) = args.container_scope {
        definition.container_scope = scope;
    }
    let listen = args.listen.clone().or_else(|| definition.listen.clone());
    let workspace = args
        .workspace
        .clone()
        .unwrap_or_else(|| definition.resolve_workspace(&args.definition));

    let registry = build_registry();
    let report = validate_definition(&definition, &registry);
    ensure_valid(&args.definition, &report, "Pipeline definition is invalid")?;

    if args.dry_run {
        info!(
            pipeline = definition.name.as_str(),
            workspace = %workspace.display(),
            "Loaded pipeline with {} stage(s): {}",
            definition.stages.len(),
            definition
                .stages
                .iter()
                .map(|spec| spec.display_name())
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        return Ok(ExitCode::SUCCESS);
    }

    let gates = Arc::new(GateBoard::new());
    let executor = build_pipeline(
        &registry,
        &definition.stages,
        PipelineSettings {
            name: definition.name.clone(),
            workspace,
            container_scope: definition.container_scope,
        },
        Arc::new(SystemRunner),
        gates.clone(),
    )?;
    let metrics_handle = executor.metrics();
    info!(
        pipeline = definition.name.as_str(),
        plan = %executor.stage_names().join(" -> "),
        "Pipeline planned"
    );

    let mut listener = match listen {
        Some(addr_str) => {
            let addr: SocketAddr = addr_str
                .parse()
                .with_context(|| format!("Invalid listen address: {addr_str}"))?;
            Some(WebhookListener::start(addr, gates, metrics_handle.clone())?)
        }
        None => {
            if definition.has_stage("quality_gate") {
                warn!(
                    "No listen address configured; {} will never receive a quality gate result",
                    WEBHOOK_PATH
                );
            }
            None
        }
    };

    let run = executor.execute();
    print_summary(&run);

    if let Some(path) = &args.report {
        write_json(path, &run, "run report")?;
    }

    if args.print_metrics || args.metrics_json.is_some() || args.metrics_prometheus.is_some() {
        let snapshot = metrics_handle.snapshot();
        if args.print_metrics {
            log_snapshot(&snapshot);
        }
        if let Some(path) = &args.metrics_json {
            write_json(path, &snapshot, "metrics JSON")?;
        }
        if let Some(path) = &args.metrics_prometheus {
            ensure_parent(path)?;
            std::fs::write(path, snapshot.to_prometheus()).with_context(|| {
                format!("Failed to write Prometheus metrics: {}", path.display())
            })?;
            info!(metrics = %path.display(), "Prometheus metrics written");
        }
    }

    if let Some(listener) = listener.as_mut() {
        listener.stop();
    }

    Ok(ExitCode::from(run.status.exit_code()))
}

fn print_summary(run: &PipelineRun) {
    let status = match run.status {
        RunStatus::Success => "\x1b[32msuccess\x1b[0m",
        RunStatus::Aborted => "\x1b[33maborted\x1b[0m",
        RunStatus::Failed | RunStatus::Running => "\x1b[31mfailed\x1b[0m",
    };
    println!(
        "Pipeline '{}' {} ({}/{} stages, run {})",
        run.pipeline, status, run.cursor, run.stage_count, run.id
    );
    for record in &run.stages {
        let marker = match record.status {
            StageStatus::Succeeded => "ok",
            StageStatus::Failed => "FAILED",
            StageStatus::Aborted => "ABORTED",
            StageStatus::Skipped => "skipped",
        };
        println!("  {:<8} {} ({:.0} ms)", marker, record.name, record.duration_ms);
    }
    if let Some(failure) = &run.failure {
        println!("Failure: {failure}");
        if let Some(last) = run.last_attempted() {
            for line in &last.log {
                println!("  | {line}");
            }
        }
    }
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T, what: &str) -> Result<()> {
    ensure_parent(path)?;
    let file = File::create(path)
        .with_context(|| format!("Failed to create {what} file: {}", path.display()))?;
    to_writer_pretty(file, value)
        .with_context(|| format!("Failed to write {what}: {}", path.display()))?;
    info!(path = %path.display(), "{what} written");
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn ensure_valid(path: &Path, report: &ValidationReport, failure: &str) -> Result<()> {
    for warning in &report.warnings {
        warn!(file = %path.display(), "{warning}");
    }
    if report.is_ok() {
        return Ok(());
    }
    for error_msg in &report.errors {
        error!(file = %path.display(), "{error_msg}");
    }
    Err(anyhow!("{failure}: {} error(s)", report.errors.len()))
}

fn list_stages() {
    let registry = build_registry();
    println!("Available stages:");
    for name in registry.known_stages() {
        println!("- {name}");
    }
}

fn validate_cmd(definition_path: &Path) -> Result<()> {
    let definition = PipelineDefinition::load(definition_path)?;
    let registry = build_registry();
    let report = validate_definition(&definition, &registry);
    ensure_valid(definition_path, &report, "Pipeline validation failed")?;
    info!(file = %definition_path.display(), "Pipeline validation passed");
    Ok(())
}

fn lock_cmd(definition_path: &Path, output: Option<PathBuf>) -> Result<()> {
    let definition = PipelineDefinition::load(definition_path)?;
    let registry = build_registry();
    let report = validate_definition(&definition, &registry);
    ensure_valid(
        definition_path,
        &report,
        "Cannot generate lockfile due to validation errors",
    )?;

    let output_path = output.unwrap_or_else(|| definition_path.with_extension("lock"));
    ensure_parent(&output_path)?;
    generate_lock(&definition, &output_path)?;
    info!(
        lockfile = %output_path.display(),
        "Lockfile generated successfully"
    );
    Ok(())
}

fn build_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    registry
}

#[derive(Parser)]
#[command(
    name = "gatehouse",
    version,
    about = "Checkout, build, analyse, gate and deploy, one stage at a time"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a pipeline definition.
    Run(RunArgs),
    /// List the registered stage kinds.
    ListStages,
    /// Check a pipeline definition without running it.
    Validate { definition: PathBuf },
    /// Write a lockfile with a hash of every stage's parameters.
    Lock {
        definition: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Write a pipeline definition from a bundled template.
    Init {
        #[arg(long, default_value = "two-tier", value_parser = clap::builder::PossibleValuesParser::new(TEMPLATES))]
        template: String,
        #[arg(short, long, default_value = "pipeline.yaml")]
        output: PathBuf,
    },
    /// Print shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
struct RunArgs {
    definition: PathBuf,
    #[arg(long)]
    dry_run: bool,
    /// Address for the quality gate webhook listener.
    #[arg(long, env = "GATEHOUSE_LISTEN")]
    listen: Option<String>,
    #[arg(long = "container-scope", value_enum)]
    container_scope: Option<ContainerScope>,
    #[arg(long)]
    workspace: Option<PathBuf>,
    /// Write the run record as JSON.
    #[arg(long)]
    report: Option<PathBuf>,
    #[arg(long)]
    print_metrics: bool,
    #[arg(long = "metrics-json")]
    metrics_json: Option<PathBuf>,
    #[arg(long = "metrics-prometheus")]
    metrics_prometheus: Option<PathBuf>,
    #[arg(long = "otlp-endpoint")]
    otlp_endpoint: Option<String>,
}
