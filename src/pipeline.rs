use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::declaration::{ResolutionContext, StackDeclaration};
use crate::jobs::{BuildJob, CommandExecutor, CommandFailure, JobOutcome, JobRunner, PhaseOutcome};
use crate::observability::MetricsCollector;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDescriptor {
    pub name: String,
    /// Key encrypting the artifact store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_key: Option<String>,
    pub stages: Vec<StageSpec>,
}

impl PipelineDescriptor {
    /// The artifact flowing into each stage: the primary output of the
    /// closest upstream stage that produced one. Approval gates pass the
    /// carried artifact through untouched.
    pub fn carried_artifacts(&self) -> Vec<Option<&str>> {
        let mut carried = None;
        let mut flow = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            flow.push(carried);
            if let Some(primary) = stage.outputs().into_iter().next() {
                carried = Some(primary);
            }
        }
        flow
    }

    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|stage| stage.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub actions: Vec<ActionSpec>,
}

impl StageSpec {
    /// A stage made only of manual approvals.
    pub fn is_gate(&self) -> bool {
        !self.actions.is_empty() && self.actions.iter().all(ActionSpec::is_approval)
    }

    pub fn outputs(&self) -> Vec<&str> {
        self.actions.iter().flat_map(ActionSpec::outputs).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionSpec {
    Source {
        name: String,
        repository: String,
        branch: String,
        output: String,
    },
    Build {
        name: String,
        job: String,
        input: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        outputs: Vec<String>,
    },
    Approval {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
    },
}

impl ActionSpec {
    pub fn name(&self) -> &str {
        match self {
            ActionSpec::Source { name, .. }
            | ActionSpec::Build { name, .. }
            | ActionSpec::Approval { name, .. } => name,
        }
    }

    pub fn input(&self) -> Option<&str> {
        match self {
            ActionSpec::Build { input, .. } => Some(input),
            _ => None,
        }
    }

    pub fn outputs(&self) -> Vec<&str> {
        match self {
            ActionSpec::Source { output, .. } => vec![output.as_str()],
            ActionSpec::Build { outputs, .. } => outputs.iter().map(String::as_str).collect(),
            ActionSpec::Approval { .. } => Vec::new(),
        }
    }

    pub fn is_approval(&self) -> bool {
        matches!(self, ActionSpec::Approval { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PipelineStatus::Running => "running",
            PipelineStatus::Succeeded => "succeeded",
            PipelineStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StageFailure {
    Rejected {
        action: String,
        comment: Option<String>,
    },
    JobFailed {
        job: String,
        failure: CommandFailure,
    },
    MissingArtifact {
        action: String,
        artifact: String,
    },
    ActionError {
        action: String,
        message: String,
    },
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageFailure::Rejected { action, comment } => match comment {
                Some(comment) => write!(f, "approval '{action}' rejected: {comment}"),
                None => write!(f, "approval '{action}' rejected"),
            },
            StageFailure::JobFailed { job, failure } => write!(f, "job '{job}' failed: {failure}"),
            StageFailure::MissingArtifact { action, artifact } => {
                write!(f, "action '{action}' has no input artifact '{artifact}'")
            }
            StageFailure::ActionError { action, message } => {
                write!(f, "action '{action}' errored: {message}")
            }
        }
    }
}

/// Opaque handle to data passed between stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactHandle {
    pub name: String,
    pub producer: String,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub name: String,
    pub status: StageStatus,
    pub completed_actions: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<StageFailure>,
}

/// State of one pipeline execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineRun {
    pub pipeline: String,
    pub stages: Vec<StageRecord>,
    pub artifacts: BTreeMap<String, ArtifactHandle>,
}

impl PipelineRun {
    pub fn status(&self) -> PipelineStatus {
        if self
            .stages
            .iter()
            .any(|stage| stage.status == StageStatus::Failed)
        {
            PipelineStatus::Failed
        } else if !self.stages.is_empty()
            && self
                .stages
                .iter()
                .all(|stage| stage.status == StageStatus::Succeeded)
        {
            PipelineStatus::Succeeded
        } else {
            PipelineStatus::Running
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    /// A stage may start only once everything upstream has succeeded.
    pub fn can_start(&self, index: usize) -> bool {
        index < self.stages.len()
            && self.stages[..index]
                .iter()
                .all(|stage| stage.status == StageStatus::Succeeded)
    }

    /// Stage left suspended on a manual approval, if any.
    pub fn awaiting_approval(&self) -> Option<&str> {
        self.stages
            .iter()
            .find(|stage| stage.status == StageStatus::Running)
            .map(|stage| stage.name.as_str())
    }

    /// Stages that started, in order.
    pub fn executed_stages(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|stage| stage.status != StageStatus::Pending)
            .map(|stage| stage.name.as_str())
            .collect()
    }

    pub fn failure(&self) -> Option<(&str, &StageFailure)> {
        self.stages.iter().find_map(|stage| {
            stage
                .failure
                .as_ref()
                .map(|failure| (stage.name.as_str(), failure))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Rejected { comment: Option<String> },
    /// Nobody has answered yet; the run stays suspended.
    Pending,
}

impl FromStr for ApprovalDecision {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" | "yes" | "y" => Ok(ApprovalDecision::Approved),
            "reject" | "rejected" | "no" | "n" => Ok(ApprovalDecision::Rejected { comment: None }),
            "pending" | "wait" => Ok(ApprovalDecision::Pending),
            other => bail!("Unknown approval decision '{other}' (expected approve, reject or pending)"),
        }
    }
}

/// Source of human decisions for manual approval actions.
pub trait ApprovalGate {
    fn decide(&mut self, stage: &str, action: &str) -> Result<ApprovalDecision>;
}

pub struct ApproveAll;

impl ApprovalGate for ApproveAll {
    fn decide(&mut self, _stage: &str, _action: &str) -> Result<ApprovalDecision> {
        Ok(ApprovalDecision::Approved)
    }
}

/// Answers gates from a fixed list; once exhausted every gate stays pending.
#[derive(Debug, Default)]
pub struct ScriptedApprovals {
    decisions: VecDeque<ApprovalDecision>,
}

impl ScriptedApprovals {
    pub fn new(decisions: impl IntoIterator<Item = ApprovalDecision>) -> Self {
        Self {
            decisions: decisions.into_iter().collect(),
        }
    }
}

impl ApprovalGate for ScriptedApprovals {
    fn decide(&mut self, _stage: &str, _action: &str) -> Result<ApprovalDecision> {
        Ok(self
            .decisions
            .pop_front()
            .unwrap_or(ApprovalDecision::Pending))
    }
}

/// Asks on a terminal-like stream until the answer is y or n. End of input
/// leaves the gate pending.
pub struct PromptApprovals<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> PromptApprovals<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> ApprovalGate for PromptApprovals<R, W> {
    fn decide(&mut self, stage: &str, action: &str) -> Result<ApprovalDecision> {
        loop {
            write!(
                self.output,
                "Approve action '{action}' in stage '{stage}'? [y/n] "
            )?;
            self.output.flush()?;
            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                return Ok(ApprovalDecision::Pending);
            }
            match line.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => return Ok(ApprovalDecision::Approved),
                "n" | "no" => {
                    return Ok(ApprovalDecision::Rejected {
                        comment: Some("rejected at prompt".to_string()),
                    });
                }
                _ => writeln!(self.output, "Please answer y or n.")?,
            }
        }
    }
}

/// Performs the automated actions of a pipeline.
pub trait ActionRunner {
    /// Checks out `branch` and returns where the revision can be read.
    fn fetch_source(&self, repository: &str, branch: &str) -> Result<String>;
    fn run_build(&self, job: &BuildJob, input: &ArtifactHandle) -> Result<JobOutcome>;
}

/// Builds pass unless listed in `failing_jobs`; nothing is executed.
#[derive(Debug, Default)]
pub struct SimulatedActions {
    failing_jobs: BTreeSet<String>,
}

impl SimulatedActions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(jobs: impl IntoIterator<Item = String>) -> Self {
        Self {
            failing_jobs: jobs.into_iter().collect(),
        }
    }
}

impl ActionRunner for SimulatedActions {
    fn fetch_source(&self, repository: &str, branch: &str) -> Result<String> {
        Ok(format!("{repository}@{branch}"))
    }

    fn run_build(&self, job: &BuildJob, _input: &ArtifactHandle) -> Result<JobOutcome> {
        let fail = self.failing_jobs.contains(&job.name);
        let mut phases: Vec<PhaseOutcome> = job
            .phases
            .iter()
            .map(|(phase, commands)| PhaseOutcome {
                phase,
                commands_run: commands.len(),
                succeeded: true,
            })
            .collect();
        let failure = match (fail, phases.last_mut()) {
            (true, Some(last)) => {
                last.succeeded = false;
                let command = job
                    .phases
                    .commands(last.phase)
                    .last()
                    .cloned()
                    .unwrap_or_default();
                Some(CommandFailure {
                    phase: last.phase,
                    index: last.commands_run.saturating_sub(1),
                    command,
                    exit_code: 1,
                })
            }
            _ => None,
        };
        Ok(JobOutcome {
            job: job.name.clone(),
            phases,
            failure,
        })
    }
}

/// Runs job commands on this machine from a checked-out workspace.
pub struct LocalActions<'a, E: CommandExecutor> {
    stack: &'a StackDeclaration,
    ctx: ResolutionContext,
    workspace: PathBuf,
    executor: E,
    metrics: Option<MetricsCollector>,
}

impl<'a, E: CommandExecutor> LocalActions<'a, E> {
    pub fn new(
        stack: &'a StackDeclaration,
        ctx: ResolutionContext,
        workspace: impl Into<PathBuf>,
        executor: E,
    ) -> Self {
        Self {
            stack,
            ctx,
            workspace: workspace.into(),
            executor,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl<E: CommandExecutor> ActionRunner for LocalActions<'_, E> {
    fn fetch_source(&self, repository: &str, branch: &str) -> Result<String> {
        if !self.workspace.is_dir() {
            bail!(
                "Workspace '{}' for {repository}@{branch} is not a directory",
                self.workspace.display()
            );
        }
        Ok(self.workspace.to_string_lossy().to_string())
    }

    fn run_build(&self, job: &BuildJob, input: &ArtifactHandle) -> Result<JobOutcome> {
        let env = self.stack.resolve_job_environment(job, &self.ctx)?;
        let runner = JobRunner::new(&self.executor);
        let runner = match &self.metrics {
            Some(metrics) => runner.with_metrics(metrics.clone()),
            None => runner,
        };
        runner.run(job, &env, Path::new(&input.location))
    }
}

/// Drives a pipeline run through its stages, one at a time.
pub struct PipelineExecutor<'a> {
    stack: &'a StackDeclaration,
    metrics: MetricsCollector,
}

impl<'a> PipelineExecutor<'a> {
    pub fn new(stack: &'a StackDeclaration) -> Self {
        Self {
            stack,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    /// A fresh run with every stage pending.
    pub fn start(&self) -> PipelineRun {
        PipelineRun {
            pipeline: self.stack.pipeline.name.clone(),
            stages: self
                .stack
                .pipeline
                .stages
                .iter()
                .map(|stage| StageRecord {
                    name: stage.name.clone(),
                    status: StageStatus::Pending,
                    completed_actions: 0,
                    failure: None,
                })
                .collect(),
            artifacts: BTreeMap::new(),
        }
    }

    /// Starts a run and advances it as far as it can go.
    pub fn run(
        &self,
        actions: &dyn ActionRunner,
        approvals: &mut dyn ApprovalGate,
    ) -> Result<PipelineRun> {
        let mut run = self.start();
        self.advance(&mut run, actions, approvals)?;
        Ok(run)
    }

    /// Advances `run` until it finishes, fails, or suspends on an approval.
    /// Calling it again on a suspended run resumes at the waiting gate.
    #[instrument(skip_all, fields(pipeline = %run.pipeline))]
    pub fn advance(
        &self,
        run: &mut PipelineRun,
        actions: &dyn ActionRunner,
        approvals: &mut dyn ApprovalGate,
    ) -> Result<PipelineStatus> {
        let descriptor = &self.stack.pipeline;
        if descriptor.stages.is_empty() {
            bail!("Pipeline '{}' has no stages", descriptor.name);
        }
        if run.pipeline != descriptor.name || run.stages.len() != descriptor.stages.len() {
            bail!(
                "Run of '{}' does not match pipeline '{}'",
                run.pipeline,
                descriptor.name
            );
        }

        let started = Instant::now();
        for (index, spec) in descriptor.stages.iter().enumerate() {
            match run.stages[index].status {
                StageStatus::Succeeded => continue,
                StageStatus::Failed => return Ok(PipelineStatus::Failed),
                StageStatus::Pending | StageStatus::Running => {}
            }
            if !run.can_start(index) {
                bail!("Stage '{}' cannot start before its upstream stages succeed", spec.name);
            }

            let span = tracing::span!(tracing::Level::DEBUG, "stage", stage = spec.name.as_str());
            let _span_guard = span.enter();
            let _timer = self.metrics.start_stage(&spec.name);

            if run.stages[index].status == StageStatus::Pending {
                info!(stage = spec.name.as_str(), "Stage started");
            }
            run.stages[index].status = StageStatus::Running;

            let resume_at = run.stages[index].completed_actions;
            for action in spec.actions.iter().skip(resume_at) {
                let result = match self.perform(run, &spec.name, action, actions, approvals) {
                    Ok(result) => result,
                    Err(err) => {
                        self.metrics.record_stage_failure();
                        let record = &mut run.stages[index];
                        record.status = StageStatus::Failed;
                        record.failure = Some(StageFailure::ActionError {
                            action: action.name().to_string(),
                            message: format!("{err:#}"),
                        });
                        self.metrics.record_total_duration(started.elapsed());
                        return Err(err.context(format!("Stage '{}' failed", spec.name)));
                    }
                };
                match result {
                    ActionResult::Done => run.stages[index].completed_actions += 1,
                    ActionResult::Suspended => {
                        info!(
                            stage = spec.name.as_str(),
                            action = action.name(),
                            "Awaiting manual approval"
                        );
                        self.metrics.record_total_duration(started.elapsed());
                        return Ok(PipelineStatus::Running);
                    }
                    ActionResult::Failed(failure) => {
                        warn!(stage = spec.name.as_str(), %failure, "Stage failed");
                        self.metrics.record_stage_failure();
                        let record = &mut run.stages[index];
                        record.status = StageStatus::Failed;
                        record.failure = Some(failure);
                        self.metrics.record_total_duration(started.elapsed());
                        return Ok(PipelineStatus::Failed);
                    }
                }
            }

            run.stages[index].status = StageStatus::Succeeded;
            info!(stage = spec.name.as_str(), "Stage succeeded");
        }

        self.metrics.record_total_duration(started.elapsed());
        Ok(run.status())
    }

    fn perform(
        &self,
        run: &mut PipelineRun,
        stage: &str,
        action: &ActionSpec,
        actions: &dyn ActionRunner,
        approvals: &mut dyn ApprovalGate,
    ) -> Result<ActionResult> {
        match action {
            ActionSpec::Approval { name, .. } => match approvals.decide(stage, name)? {
                ApprovalDecision::Approved => {
                    self.metrics.record_approval(true);
                    info!(stage, action = name.as_str(), "Approved");
                    Ok(ActionResult::Done)
                }
                ApprovalDecision::Rejected { comment } => {
                    self.metrics.record_approval(false);
                    Ok(ActionResult::Failed(StageFailure::Rejected {
                        action: name.clone(),
                        comment,
                    }))
                }
                ApprovalDecision::Pending => Ok(ActionResult::Suspended),
            },
            ActionSpec::Source {
                name,
                repository,
                branch,
                output,
            } => match actions.fetch_source(repository, branch) {
                Ok(location) => {
                    run.artifacts.insert(
                        output.clone(),
                        ArtifactHandle {
                            name: output.clone(),
                            producer: name.clone(),
                            location,
                        },
                    );
                    Ok(ActionResult::Done)
                }
                Err(err) => Ok(ActionResult::Failed(StageFailure::ActionError {
                    action: name.clone(),
                    message: format!("{err:#}"),
                })),
            },
            ActionSpec::Build {
                name,
                job,
                input,
                outputs,
            } => {
                let definition = self
                    .stack
                    .job(job)
                    .ok_or_else(|| anyhow!("Action '{name}' references unknown job '{job}'"))?;
                let Some(handle) = run.artifacts.get(input).cloned() else {
                    return Ok(ActionResult::Failed(StageFailure::MissingArtifact {
                        action: name.clone(),
                        artifact: input.clone(),
                    }));
                };
                let outcome = match actions.run_build(definition, &handle) {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        return Ok(ActionResult::Failed(StageFailure::ActionError {
                            action: name.clone(),
                            message: format!("{err:#}"),
                        }));
                    }
                };
                if let Some(failure) = outcome.failure {
                    return Ok(ActionResult::Failed(StageFailure::JobFailed {
                        job: job.clone(),
                        failure,
                    }));
                }
                for output in outputs {
                    run.artifacts.insert(
                        output.clone(),
                        ArtifactHandle {
                            name: output.clone(),
                            producer: name.clone(),
                            location: handle.location.clone(),
                        },
                    );
                }
                Ok(ActionResult::Done)
            }
        }
    }
}

enum ActionResult {
    Done,
    Suspended,
    Failed(StageFailure),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presets;
    use std::io::Cursor;

    #[test]
    fn carried_artifacts_skip_approval_gates() {
        let stack = presets::preset("devsecops-eks").unwrap();
        let flow = stack.pipeline.carried_artifacts();
        assert_eq!(flow[0], None);
        assert_eq!(flow[1], Some("SourceOutput"));
        assert_eq!(flow[2], Some("PolicyScanOutput"));
        assert_eq!(flow[3], Some("PolicyScanOutput"));
        assert_eq!(flow[4], Some("BuildOutput"));
        assert_eq!(flow[5], Some("BuildOutput"));
    }

    #[test]
    fn approval_decisions_parse() {
        assert_eq!("Approve".parse::<ApprovalDecision>().unwrap(), ApprovalDecision::Approved);
        assert_eq!(
            "reject".parse::<ApprovalDecision>().unwrap(),
            ApprovalDecision::Rejected { comment: None }
        );
        assert!("maybe".parse::<ApprovalDecision>().is_err());
    }

    #[test]
    fn prompt_reads_answers_and_suspends_on_eof() {
        let mut output = Vec::new();
        let mut gate = PromptApprovals::new(Cursor::new("y\nnope\n\nn\n"), &mut output);
        assert_eq!(gate.decide("Gate", "Approve").unwrap(), ApprovalDecision::Approved);
        assert!(matches!(
            gate.decide("Gate", "Approve").unwrap(),
            ApprovalDecision::Rejected { .. }
        ));
        assert_eq!(gate.decide("Gate", "Approve").unwrap(), ApprovalDecision::Pending);
        drop(gate);
        let transcript = String::from_utf8(output).unwrap();
        assert!(transcript.contains("in stage 'Gate'"));
        assert_eq!(transcript.matches("Please answer y or n.").count(), 2);
    }

    struct BrokenGate;

    impl ApprovalGate for BrokenGate {
        fn decide(&mut self, _stage: &str, _action: &str) -> Result<ApprovalDecision> {
            bail!("approval channel closed")
        }
    }

    #[test]
    fn gate_errors_fail_the_stage() {
        let stack = presets::preset("devsecops-eks").unwrap();
        let executor = PipelineExecutor::new(&stack);
        let mut run = executor.start();
        let err = executor
            .advance(&mut run, &SimulatedActions::new(), &mut BrokenGate)
            .unwrap_err();
        assert!(format!("{err:#}").contains("approval channel closed"));

        let gate = run.stage("Approve-1").unwrap();
        assert_eq!(gate.status, StageStatus::Failed);
        assert!(matches!(gate.failure, Some(StageFailure::ActionError { .. })));
        assert_eq!(run.status(), PipelineStatus::Failed);
        assert_eq!(run.awaiting_approval(), None);
    }

    #[test]
    fn empty_runs_are_not_successful() {
        let run = PipelineRun {
            pipeline: "empty".into(),
            stages: Vec::new(),
            artifacts: BTreeMap::new(),
        };
        assert_eq!(run.status(), PipelineStatus::Running);

        let mut stack = presets::preset("minimal").unwrap();
        stack.pipeline.stages.clear();
        let executor = PipelineExecutor::new(&stack);
        assert!(executor.run(&SimulatedActions::new(), &mut ApproveAll).is_err());
    }

    #[test]
    fn can_start_requires_succeeded_upstream() {
        let stack = presets::preset("minimal").unwrap();
        let executor = PipelineExecutor::new(&stack);
        let mut run = executor.start();
        assert!(run.can_start(0));
        assert!(!run.can_start(1));
        run.stages[0].status = StageStatus::Succeeded;
        assert!(run.can_start(1));
        assert!(!run.can_start(run.stages.len()));
    }
}
