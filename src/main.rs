use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use devsecops_stack::declaration::{ResolutionContext, StackDeclaration, expand_declarations};
use devsecops_stack::jobs::{DryRunExecutor, JobRunner, ShellExecutor};
use devsecops_stack::lockfile::{check_lock, generate_lock, load_lock};
use devsecops_stack::observability::{MetricsCollector, log_snapshot};
use devsecops_stack::pipeline::{
    ActionRunner, ApprovalDecision, ApprovalGate, ApproveAll, LocalActions, PipelineExecutor,
    PipelineRun, PipelineStatus, PromptApprovals, ScriptedApprovals, SimulatedActions,
};
use devsecops_stack::presets::{generate_preset, preset_names};
use devsecops_stack::security::{audit, compute_sha256, write_sha256};
use devsecops_stack::synth::{GraphDiff, ResourceGraph, synthesize};
use devsecops_stack::validation::{ValidationReport, validate_stack};
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};

fn main() -> Result<()> {
    let Cli {
        account,
        region,
        otlp_endpoint,
        command,
    } = Cli::parse();

    configure_tracing(otlp_endpoint.as_deref())?;

    let overrides = Overrides { account, region };
    let command_result = match command {
        Commands::Synth { stack, output } => synth_command(&stack, output, &overrides),
        Commands::Validate { stack } => validate_command(&stack, &overrides),
        Commands::Lint { patterns } => lint_stacks(&patterns, &overrides),
        Commands::Plan { stack } => plan_command(&stack, &overrides),
        Commands::Outputs { stack, json } => outputs_command(&stack, json, &overrides),
        Commands::Lock { stack, output } => lock_stack(&stack, &output, &overrides),
        Commands::CheckLock { stack, lock } => check_lock_command(&stack, &lock, &overrides),
        Commands::Diff { lhs, rhs } => diff_stacks(&lhs, &rhs, &overrides),
        Commands::Simulate(args) => simulate_command(args, &overrides),
        Commands::Job { action } => job_command(action, &overrides),
        Commands::Preset { action } => preset_command(action),
        Commands::Security { action } => security_command(action, &overrides),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "devsecops-stack", &mut io::stdout());
            Ok(())
        }
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    command_result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "devsecops-stack")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
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
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?;
    }

    Ok(())
}

struct Overrides {
    account: Option<String>,
    region: Option<String>,
}

fn load_stack(path: &Path, overrides: &Overrides) -> Result<StackDeclaration> {
    let mut stack = StackDeclaration::load(path)?;
    stack.apply_overrides(overrides.account.clone(), overrides.region.clone());
    Ok(stack)
}

fn log_report(path: &Path, report: &ValidationReport) {
    for warning in &report.warnings {
        warn!(file = %path.display(), "{warning}");
    }
    for error_msg in &report.errors {
        error!(file = %path.display(), "{error_msg}");
    }
}

/// Loads and validates a declaration, refusing to continue on errors.
fn load_valid_stack(path: &Path, overrides: &Overrides, purpose: &str) -> Result<StackDeclaration> {
    let stack = load_stack(path, overrides)?;
    let report = validate_stack(&stack);
    log_report(path, &report);
    if !report.is_ok() {
        bail!(
            "Cannot {purpose} due to {} validation error(s)",
            report.errors.len()
        );
    }
    Ok(stack)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn synth_graph(stack: &StackDeclaration) -> Result<ResourceGraph> {
    synthesize(stack).with_context(|| format!("Failed to synthesize stack '{}'", stack.name))
}

fn synth_command(path: &Path, output: Option<PathBuf>, overrides: &Overrides) -> Result<()> {
    let stack = load_valid_stack(path, overrides, "synthesize")?;
    let graph = synth_graph(&stack)?;
    let output =
        output.unwrap_or_else(|| PathBuf::from(format!("cdk.out/{}.template.json", stack.name)));
    ensure_parent(&output)?;
    fs::write(&output, graph.render())
        .with_context(|| format!("Failed to write template: {}", output.display()))?;
    info!(
        template = %output.display(),
        resources = graph.resources.len(),
        digest = %graph.digest(),
        "Template synthesized"
    );
    Ok(())
}

fn validate_command(path: &Path, overrides: &Overrides) -> Result<()> {
    let stack = load_stack(path, overrides)?;
    let report = validate_stack(&stack);
    log_report(path, &report);

    if report.is_ok() {
        info!(file = %path.display(), "Stack validation passed");
        Ok(())
    } else {
        Err(anyhow!(
            "Stack validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn lint_stacks(patterns: &[String], overrides: &Overrides) -> Result<()> {
    let paths = expand_declarations(patterns)?;
    let mut failures = 0usize;

    for path in &paths {
        match load_stack(path, overrides) {
            Ok(stack) => {
                let report = validate_stack(&stack);
                log_report(path, &report);
                if report.is_ok() {
                    info!(file = %path.display(), "Lint passed");
                } else {
                    failures += 1;
                }
            }
            Err(err) => {
                failures += 1;
                error!(file = %path.display(), "Failed to load stack declaration: {err:#}");
            }
        }
    }

    if failures > 0 {
        bail!("Lint failed for {failures} declaration(s)");
    }

    info!(declarations = paths.len(), "All stack lint checks passed");
    Ok(())
}

fn plan_command(path: &Path, overrides: &Overrides) -> Result<()> {
    let stack = load_valid_stack(path, overrides, "plan")?;
    let graph = synth_graph(&stack)?;
    let order = graph.creation_order()?;
    println!("Creation order for stack '{}':", stack.name);
    for (position, id) in order.iter().enumerate() {
        let resource_type = graph
            .resources
            .get(id)
            .map(|resource| resource.resource_type.as_str())
            .unwrap_or_default();
        println!("{:>3}. {id} ({resource_type})", position + 1);
    }
    Ok(())
}

fn outputs_command(path: &Path, json: bool, overrides: &Overrides) -> Result<()> {
    let stack = load_stack(path, overrides)?;
    let ctx = ResolutionContext::for_stack(&stack);
    let outputs = stack
        .resolved_outputs(&ctx)
        .with_context(|| format!("Failed to resolve outputs of stack '{}'", stack.name))?;
    if json {
        to_writer_pretty(io::stdout(), &outputs)?;
        println!();
    } else {
        for output in &outputs {
            println!("{} ({}) = {}", output.id, output.export, output.value);
        }
    }
    Ok(())
}

fn lock_stack(path: &Path, output: &Path, overrides: &Overrides) -> Result<()> {
    let stack = load_valid_stack(path, overrides, "generate lockfile")?;
    let lock = generate_lock(&stack, output)?;
    info!(
        lockfile = %output.display(),
        resources = lock.resources.len(),
        "Lockfile generated successfully"
    );
    Ok(())
}

fn print_diff(diff: &GraphDiff) {
    for id in &diff.added {
        println!("+ {id}");
    }
    for id in &diff.removed {
        println!("- {id}");
    }
    for id in &diff.changed {
        println!("~ {id}");
    }
}

fn check_lock_command(path: &Path, lock_path: &Path, overrides: &Overrides) -> Result<()> {
    let stack = load_stack(path, overrides)?;
    let lock = load_lock(lock_path)?;
    if lock.stack != stack.name {
        warn!(
            lockfile = %lock_path.display(),
            "Lockfile was generated for stack '{}', not '{}'",
            lock.stack,
            stack.name
        );
    }
    let check = check_lock(&lock, &synth_graph(&stack)?);
    if check.is_current() {
        info!(lockfile = %lock_path.display(), "Lockfile is up to date");
        return Ok(());
    }
    print_diff(&check.diff);
    bail!(
        "Stack '{}' drifted from its lockfile ({} added, {} removed, {} changed)",
        stack.name,
        check.diff.added.len(),
        check.diff.removed.len(),
        check.diff.changed.len()
    );
}

fn diff_stacks(lhs: &Path, rhs: &Path, overrides: &Overrides) -> Result<()> {
    let left = synth_graph(&load_stack(lhs, overrides)?)?;
    let right = synth_graph(&load_stack(rhs, overrides)?)?;
    let diff = GraphDiff::of_graphs(&left, &right);

    if diff.is_empty() {
        info!(left = %lhs.display(), right = %rhs.display(), "Stacks are equivalent");
        println!("Stacks match: {} == {}", lhs.display(), rhs.display());
        Ok(())
    } else {
        println!(
            "Resource differences between '{}' and '{}':",
            lhs.display(),
            rhs.display()
        );
        print_diff(&diff);
        let total = diff.added.len() + diff.removed.len() + diff.changed.len();
        bail!("Stacks differ ({total} resource(s) affected)");
    }
}

fn simulate_command(args: SimulateArgs, overrides: &Overrides) -> Result<()> {
    let stack = load_valid_stack(&args.stack, overrides, "simulate the pipeline")?;
    let executor = PipelineExecutor::new(&stack);
    let metrics = executor.metrics();

    let mut approvals: Box<dyn ApprovalGate> = if args.interactive {
        Box::new(PromptApprovals::new(io::stdin().lock(), io::stderr()))
    } else if args.approve_all {
        Box::new(ApproveAll)
    } else {
        let decisions = args
            .approve
            .iter()
            .map(|decision| decision.parse::<ApprovalDecision>())
            .collect::<Result<Vec<_>>>()?;
        Box::new(ScriptedApprovals::new(decisions))
    };

    let run = match &args.workspace {
        None => executor.run(&SimulatedActions::failing(args.fail_job.clone()), approvals.as_mut())?,
        Some(workspace) => {
            let ctx = ResolutionContext::for_stack(&stack).with_parameters(args.param.iter().cloned().collect());
            let actions: Box<dyn ActionRunner + '_> = if args.dry_run {
                Box::new(
                    LocalActions::new(&stack, ctx, workspace, DryRunExecutor::new())
                        .with_metrics(metrics.clone()),
                )
            } else {
                Box::new(
                    LocalActions::new(&stack, ctx, workspace, ShellExecutor::default())
                        .with_metrics(metrics.clone()),
                )
            };
            executor.run(actions.as_ref(), approvals.as_mut())?
        }
    };

    print_run(&run);
    emit_metrics(&metrics, &args.metrics)?;

    match run.status() {
        PipelineStatus::Succeeded => {
            info!(pipeline = %run.pipeline, "Pipeline succeeded");
            Ok(())
        }
        PipelineStatus::Running => {
            let stage = run.awaiting_approval().unwrap_or("<unknown>");
            info!(pipeline = %run.pipeline, stage, "Pipeline suspended awaiting approval");
            Ok(())
        }
        PipelineStatus::Failed => match run.failure() {
            Some((stage, failure)) => bail!("Pipeline failed at stage '{stage}': {failure}"),
            None => bail!("Pipeline '{}' failed", run.pipeline),
        },
    }
}

fn print_run(run: &PipelineRun) {
    println!("Pipeline '{}': {}", run.pipeline, run.status());
    for stage in &run.stages {
        match &stage.failure {
            Some(failure) => println!("  {:<12} {} ({failure})", stage.name, stage.status),
            None => println!("  {:<12} {}", stage.name, stage.status),
        }
    }
}

fn emit_metrics(metrics: &MetricsCollector, options: &MetricsArgs) -> Result<()> {
    if !options.print_metrics && options.metrics_json.is_none() && options.metrics_prometheus.is_none()
    {
        return Ok(());
    }
    let snapshot = metrics.snapshot();
    if options.print_metrics {
        log_snapshot(&snapshot);
    }
    if let Some(path) = &options.metrics_json {
        ensure_parent(path)?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, &snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = &options.metrics_prometheus {
        ensure_parent(path)?;
        fs::write(path, snapshot.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

fn job_command(command: JobCommands, overrides: &Overrides) -> Result<()> {
    match command {
        JobCommands::Run {
            stack,
            job,
            workdir,
            dry_run,
            param,
        } => {
            let stack = load_stack(&stack, overrides)?;
            let definition = stack
                .job(&job)
                .ok_or_else(|| anyhow!("Stack '{}' has no job '{job}'", stack.name))?;
            let ctx = ResolutionContext::for_stack(&stack).with_parameters(param.into_iter().collect());
            let env = stack
                .resolve_job_environment(definition, &ctx)
                .with_context(|| format!("Failed to resolve environment of job '{job}'"))?;

            let outcome = if dry_run {
                let executor = DryRunExecutor::new();
                let outcome = JobRunner::new(&executor).run(definition, &env, &workdir)?;
                for command in executor.executed() {
                    println!("{command}");
                }
                outcome
            } else {
                JobRunner::new(&ShellExecutor::default()).run(definition, &env, &workdir)?
            };

            match outcome.failure {
                Some(failure) => bail!("Job '{job}' failed: {failure}"),
                None => {
                    info!(job = %job, phases = outcome.phases.len(), "Job succeeded");
                    Ok(())
                }
            }
        }
        JobCommands::Inspect { stack, job, view } => {
            let stack = load_stack(&stack, overrides)?;
            let definition = stack
                .job(&job)
                .ok_or_else(|| anyhow!("Stack '{}' has no job '{job}'", stack.name))?;
            match view {
                JobView::Buildspec => print!("{}", definition.render_buildspec()?),
                JobView::Permissions => {
                    for permission in definition.required_permissions() {
                        println!("{permission}");
                    }
                }
                JobView::Variables => {
                    let declared = &definition.environment;
                    let undeclared = definition.undeclared_variables();
                    for variable in definition.referenced_variables() {
                        let source = if declared.contains_key(&variable) {
                            "declared"
                        } else if devsecops_stack::jobs::is_platform_variable(&variable) {
                            "platform"
                        } else if undeclared.contains(&variable) {
                            "undeclared"
                        } else {
                            "assigned"
                        };
                        println!("{variable} {source}");
                    }
                }
            }
            Ok(())
        }
    }
}

fn preset_command(command: PresetCommands) -> Result<()> {
    match command {
        PresetCommands::New { preset, output } => {
            let destination =
                output.unwrap_or_else(|| PathBuf::from(format!("stacks/{preset}.yaml")));
            let generated = generate_preset(&preset, &destination)?;
            info!(
                preset = %preset,
                path = %generated.display(),
                "Preset declaration generated"
            );
            Ok(())
        }
        PresetCommands::List => {
            for name in preset_names() {
                println!("{name}");
            }
            Ok(())
        }
    }
}

fn security_command(command: SecurityCommands, overrides: &Overrides) -> Result<()> {
    match command {
        SecurityCommands::Audit { stack, json, fail_on } => {
            let declaration = load_stack(&stack, overrides)?;
            let findings = audit(&declaration);
            if json {
                to_writer_pretty(io::stdout(), &findings)?;
                println!();
            } else {
                for finding in &findings {
                    println!("{finding}");
                }
            }
            let threshold = fail_on.map(AuditThreshold::severity);
            let blocking = findings
                .iter()
                .filter(|finding| threshold.is_some_and(|level| finding.severity >= level))
                .count();
            if blocking > 0 {
                bail!("Security audit found {blocking} blocking finding(s)");
            }
            info!(file = %stack.display(), findings = findings.len(), "Security audit complete");
            Ok(())
        }
        SecurityCommands::Digest { path, output } => {
            if let Some(out_path) = output {
                let digest = write_sha256(&path, &out_path)?;
                println!("{}  {}", digest, path.display());
                info!(
                    file = %path.display(),
                    digest_output = %out_path.display(),
                    "SHA256 digest written"
                );
            } else {
                let digest = compute_sha256(&path)?;
                println!("{}  {}", digest, path.display());
                info!(file = %path.display(), "SHA256 computed");
            }
            Ok(())
        }
    }
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.trim().is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    Ok((key.trim().to_string(), value.to_string()))
}

#[derive(Parser)]
#[command(
    name = "devsecops-stack",
    version,
    about = "Declare, synthesize and rehearse an EKS DevSecOps stack"
)]
struct Cli {
    /// Target account id; required for account-scoped values.
    #[arg(long, global = true, env = "CDK_DEFAULT_ACCOUNT")]
    account: Option<String>,
    #[arg(long, global = true, env = "AWS_REGION")]
    region: Option<String>,
    #[arg(long = "otlp-endpoint", global = true)]
    otlp_endpoint: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the provisioning template for a declaration.
    Synth {
        stack: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Validate {
        stack: PathBuf,
    },
    Lint {
        #[arg(required = true)]
        patterns: Vec<String>,
    },
    /// Print resources in creation order.
    Plan {
        stack: PathBuf,
    },
    Outputs {
        stack: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Lock {
        stack: PathBuf,
        output: PathBuf,
    },
    CheckLock {
        stack: PathBuf,
        lock: PathBuf,
    },
    Diff {
        lhs: PathBuf,
        rhs: PathBuf,
    },
    /// Rehearse a pipeline run.
    Simulate(SimulateArgs),
    Job {
        #[command(subcommand)]
        action: JobCommands,
    },
    Preset {
        #[command(subcommand)]
        action: PresetCommands,
    },
    Security {
        #[command(subcommand)]
        action: SecurityCommands,
    },
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(clap::Args)]
struct SimulateArgs {
    stack: PathBuf,
    /// Decision for each approval gate in order: approve, reject or pending.
    #[arg(long)]
    approve: Vec<String>,
    #[arg(long, conflicts_with_all = ["approve", "interactive"])]
    approve_all: bool,
    #[arg(long, conflicts_with = "approve")]
    interactive: bool,
    /// Job whose build fails in the simulation.
    #[arg(long = "fail-job")]
    fail_job: Vec<String>,
    /// Run job commands locally from this checkout instead of simulating them.
    #[arg(long, conflicts_with = "fail_job")]
    workspace: Option<PathBuf>,
    #[arg(long, requires = "workspace")]
    dry_run: bool,
    #[arg(long, value_parser = parse_key_val, requires = "workspace")]
    param: Vec<(String, String)>,
    #[command(flatten)]
    metrics: MetricsArgs,
}

#[derive(clap::Args)]
struct MetricsArgs {
    #[arg(long)]
    print_metrics: bool,
    #[arg(long = "metrics-json")]
    metrics_json: Option<PathBuf>,
    #[arg(long = "metrics-prometheus")]
    metrics_prometheus: Option<PathBuf>,
}

#[derive(Subcommand)]
enum JobCommands {
    /// Run a job's phases locally.
    Run {
        stack: PathBuf,
        job: String,
        #[arg(long, default_value = ".")]
        workdir: PathBuf,
        #[arg(long)]
        dry_run: bool,
        #[arg(long, value_parser = parse_key_val)]
        param: Vec<(String, String)>,
    },
    Inspect {
        stack: PathBuf,
        job: String,
        #[arg(long, value_enum, default_value_t = JobView::Buildspec)]
        view: JobView,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum JobView {
    Buildspec,
    Permissions,
    Variables,
}

#[derive(Subcommand)]
enum PresetCommands {
    New {
        #[arg(long)]
        preset: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    List,
}

#[derive(Subcommand)]
enum SecurityCommands {
    Audit {
        stack: PathBuf,
        #[arg(long)]
        json: bool,
        /// Exit with an error when a finding reaches this severity.
        #[arg(long, value_enum)]
        fail_on: Option<AuditThreshold>,
    },
    Digest {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum AuditThreshold {
    Low,
    Medium,
    High,
}

impl AuditThreshold {
    fn severity(self) -> devsecops_stack::security::Severity {
        use devsecops_stack::security::Severity;
        match self {
            AuditThreshold::Low => Severity::Low,
            AuditThreshold::Medium => Severity::Medium,
            AuditThreshold::High => Severity::High,
        }
    }
}
