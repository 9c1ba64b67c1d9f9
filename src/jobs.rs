use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::observability::MetricsCollector;
use crate::resources::{
    Attribute, EnvValue, PolicyResource, ResourceKind, ResourceRef,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Install,
    PreBuild,
    Build,
    PostBuild,
}

impl Phase {
    pub const ORDER: [Phase; 4] = [Phase::Install, Phase::PreBuild, Phase::Build, Phase::PostBuild];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Install => "install",
            Phase::PreBuild => "pre_build",
            Phase::Build => "build",
            Phase::PostBuild => "post_build",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPhases {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub install: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_build: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_build: Vec<String>,
}

impl BuildPhases {
    pub fn commands(&self, phase: Phase) -> &[String] {
        match phase {
            Phase::Install => &self.install,
            Phase::PreBuild => &self.pre_build,
            Phase::Build => &self.build,
            Phase::PostBuild => &self.post_build,
        }
    }

    /// Non-empty phases in execution order.
    pub fn iter(&self) -> impl Iterator<Item = (Phase, &[String])> {
        Phase::ORDER
            .into_iter()
            .map(|phase| (phase, self.commands(phase)))
            .filter(|(_, commands)| !commands.is_empty())
    }

    pub fn all_commands(&self) -> impl Iterator<Item = &String> {
        self.iter().flat_map(|(_, commands)| commands.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeType {
    #[default]
    Small,
    Medium,
    Large,
}

impl ComputeType {
    pub fn provider_name(&self) -> &'static str {
        match self {
            ComputeType::Small => "BUILD_GENERAL1_SMALL",
            ComputeType::Medium => "BUILD_GENERAL1_MEDIUM",
            ComputeType::Large => "BUILD_GENERAL1_LARGE",
        }
    }
}

/// A build job: an image, an environment and ordered command phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildJob {
    pub name: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
    pub image: String,
    #[serde(default)]
    pub compute: ComputeType,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, EnvValue>,
    pub phases: BuildPhases,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
}

/// Variables the build platform injects into every job.
static PLATFORM_VARIABLES: Lazy<BTreeSet<&'static str>> = Lazy::new(|| {
    ["HOME", "PATH", "PWD", "OLDPWD", "SHELL", "USER", "HOSTNAME"]
        .into_iter()
        .collect()
});

const PLATFORM_PREFIX: &str = "CODEBUILD_";

pub fn is_platform_variable(name: &str) -> bool {
    name.starts_with(PLATFORM_PREFIX) || PLATFORM_VARIABLES.contains(name)
}

/// A permission a job's commands need from its role.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RequiredPermission {
    pub action: String,
    pub resource: PolicyResource,
}

impl RequiredPermission {
    fn new(action: &str, resource: PolicyResource) -> Self {
        Self {
            action: action.to_string(),
            resource,
        }
    }
}

impl fmt::Display for RequiredPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.action, self.resource)
    }
}

const REGISTRY_PULL_ACTIONS: [&str; 3] = [
    "ecr:BatchCheckLayerAvailability",
    "ecr:BatchGetImage",
    "ecr:GetDownloadUrlForLayer",
];

const REGISTRY_PUSH_ACTIONS: [&str; 5] = [
    "ecr:BatchCheckLayerAvailability",
    "ecr:CompleteLayerUpload",
    "ecr:InitiateLayerUpload",
    "ecr:PutImage",
    "ecr:UploadLayerPart",
];

impl BuildJob {
    /// Variables read by any command, `$NAME` or `${NAME}`.
    pub fn referenced_variables(&self) -> BTreeSet<String> {
        self.phases
            .all_commands()
            .flat_map(|command| referenced_variables(command))
            .collect()
    }

    /// Referenced variables nobody provides: not declared, not injected by
    /// the platform, and not assigned earlier in the same command. Each
    /// command runs in its own shell, so assignments never carry over.
    pub fn undeclared_variables(&self) -> BTreeSet<String> {
        self.phases
            .all_commands()
            .flat_map(|command| unassigned_references(command))
            .filter(|name| !self.environment.contains_key(name) && !is_platform_variable(name))
            .collect()
    }

    /// Secrets fetched with `--secret-id <name>`.
    pub fn referenced_secrets(&self) -> BTreeSet<String> {
        self.phases
            .all_commands()
            .filter(|command| command.contains("secretsmanager get-secret-value"))
            .flat_map(|command| option_values(command, "--secret-id"))
            .collect()
    }

    /// Whether any command talks to the cluster API server.
    pub fn uses_cluster_api(&self) -> bool {
        self.phases.all_commands().any(|command| {
            let command = command.trim_start();
            ["kubectl apply", "kubectl get", "kubectl delete", "kubectl rollout", "kubectl create"]
                .iter()
                .any(|prefix| command.starts_with(prefix))
        })
    }

    /// IAM actions implied by the job's commands.
    pub fn required_permissions(&self) -> BTreeSet<RequiredPermission> {
        let mut required = BTreeSet::new();
        for command in self.phases.all_commands() {
            for secret in option_values(command, "--secret-id") {
                if command.contains("secretsmanager get-secret-value") {
                    required.insert(RequiredPermission::new(
                        "secretsmanager:GetSecretValue",
                        PolicyResource::Resource(ResourceRef::new(ResourceKind::Secret, secret)),
                    ));
                }
            }

            if command.contains("ecr get-login") {
                required.insert(RequiredPermission::new(
                    "ecr:GetAuthorizationToken",
                    PolicyResource::Any,
                ));
            }

            let docker = command.trim_start();
            let pulls = docker.starts_with("docker pull") || docker.starts_with("docker run");
            let pushes = docker.starts_with("docker push");
            if pulls || pushes {
                for registry in self.registries_in(command) {
                    let actions: &[&str] = if pushes {
                        &REGISTRY_PUSH_ACTIONS
                    } else {
                        &REGISTRY_PULL_ACTIONS
                    };
                    for action in actions {
                        required.insert(RequiredPermission::new(
                            action,
                            PolicyResource::Resource(registry.clone()),
                        ));
                    }
                }
            }

            if command.contains("eks update-kubeconfig") {
                for name in option_values(command, "--name") {
                    if let Some(cluster) = self.resolve_target(&name, ResourceKind::Cluster) {
                        required.insert(RequiredPermission::new(
                            "eks:DescribeCluster",
                            PolicyResource::Resource(cluster),
                        ));
                    }
                }
            }
        }
        required
    }

    /// Registries whose URI variable appears in `command`.
    fn registries_in(&self, command: &str) -> Vec<ResourceRef> {
        let used = referenced_variables(command);
        self.environment
            .iter()
            .filter(|(name, _)| used.contains(*name))
            .filter_map(|(_, value)| match value {
                EnvValue::Reference(reference)
                    if reference.target.kind == ResourceKind::Registry
                        && reference.attribute == Attribute::Uri =>
                {
                    Some(reference.target.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Maps a command argument onto a declared resource: either a variable
    /// bound to that resource's name or the literal name itself.
    fn resolve_target(&self, token: &str, kind: ResourceKind) -> Option<ResourceRef> {
        let variables = referenced_variables(token);
        if let Some(variable) = variables.iter().next() {
            return match self.environment.get(variable) {
                Some(EnvValue::Reference(reference))
                    if reference.target.kind == kind && reference.attribute == Attribute::Name =>
                {
                    Some(reference.target.clone())
                }
                Some(EnvValue::Literal(literal)) => Some(ResourceRef::new(kind, literal.clone())),
                _ => None,
            };
        }
        Some(ResourceRef::new(kind, token))
    }

    /// Renders the `version: 0.2` build specification.
    pub fn render_buildspec(&self) -> Result<String> {
        let document = BuildSpecDocument {
            version: "0.2",
            phases: BuildSpecPhases {
                install: PhaseCommands::non_empty(&self.phases.install),
                pre_build: PhaseCommands::non_empty(&self.phases.pre_build),
                build: PhaseCommands::non_empty(&self.phases.build),
                post_build: PhaseCommands::non_empty(&self.phases.post_build),
            },
            artifacts: (!self.artifacts.is_empty()).then_some(ArtifactFiles {
                files: &self.artifacts,
            }),
        };
        serde_yaml::to_string(&document)
            .with_context(|| format!("Failed to render buildspec for job '{}'", self.name))
    }
}

#[derive(Serialize)]
struct BuildSpecDocument<'a> {
    version: &'static str,
    phases: BuildSpecPhases<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    artifacts: Option<ArtifactFiles<'a>>,
}

#[derive(Serialize)]
struct BuildSpecPhases<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    install: Option<PhaseCommands<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pre_build: Option<PhaseCommands<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    build: Option<PhaseCommands<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    post_build: Option<PhaseCommands<'a>>,
}

#[derive(Serialize)]
struct PhaseCommands<'a> {
    commands: &'a [String],
}

impl<'a> PhaseCommands<'a> {
    fn non_empty(commands: &'a [String]) -> Option<Self> {
        (!commands.is_empty()).then_some(Self { commands })
    }
}

#[derive(Serialize)]
struct ArtifactFiles<'a> {
    files: &'a [String],
}

/// Shell variables expanded by `command`. Single-quoted text and `\$` are
/// not expansions; `$?`, `$1` and `$(..)` are not variables.
pub fn referenced_variables(command: &str) -> BTreeSet<String> {
    let chars: Vec<char> = command.chars().collect();
    let mut found = BTreeSet::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut idx = 0;
    while idx < chars.len() {
        match chars[idx] {
            '\\' if !in_single => {
                idx += 2;
                continue;
            }
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '$' if !in_single => {
                if let Some((name, consumed)) = variable_at(&chars[idx + 1..]) {
                    found.insert(name);
                    idx += 1 + consumed;
                    continue;
                }
            }
            _ => {}
        }
        idx += 1;
    }
    found
}

fn variable_at(rest: &[char]) -> Option<(String, usize)> {
    match rest.first()? {
        '{' => {
            let end = rest.iter().position(|c| *c == '}')?;
            let name: String = rest[1..end]
                .iter()
                .take_while(|c| c.is_ascii_alphanumeric() || **c == '_')
                .collect();
            is_identifier(&name).then_some((name, end + 1))
        }
        first if first.is_ascii_alphabetic() || *first == '_' => {
            let name: String = rest
                .iter()
                .take_while(|c| c.is_ascii_alphanumeric() || **c == '_')
                .collect();
            let consumed = name.len();
            Some((name, consumed))
        }
        _ => None,
    }
}

/// Splits a command list at `;`, `&`, `|` and newlines outside quotes,
/// backticks and `$(..)`.
fn command_segments(command: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut in_single = false;
    let mut in_double = false;
    let mut in_backtick = false;
    let mut depth = 0usize;
    let mut escaped = false;
    for (idx, c) in command.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if !in_single => escaped = true,
            '\'' if !in_double && !in_backtick => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '`' if !in_single => in_backtick = !in_backtick,
            '(' if !in_single && !in_double => depth += 1,
            ')' if !in_single && !in_double => depth = depth.saturating_sub(1),
            ';' | '&' | '|' | '\n' if !in_single && !in_double && !in_backtick && depth == 0 => {
                segments.push(&command[start..idx]);
                start = idx + c.len_utf8();
            }
            _ => {}
        }
    }
    segments.push(&command[start..]);
    segments
        .into_iter()
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect()
}

fn assignment(segment: &str) -> Option<String> {
    let segment = segment.strip_prefix("export ").unwrap_or(segment).trim_start();
    let (name, _) = segment.split_once('=')?;
    is_identifier(name).then(|| name.to_string())
}

/// Variables `command` expands before assigning them itself. An assignment
/// only covers the segments after it.
pub fn unassigned_references(command: &str) -> BTreeSet<String> {
    let mut assigned = BTreeSet::new();
    let mut unassigned = BTreeSet::new();
    for segment in command_segments(command) {
        for name in referenced_variables(segment) {
            if !assigned.contains(&name) {
                unassigned.insert(name);
            }
        }
        if let Some(name) = assignment(segment) {
            assigned.insert(name);
        }
    }
    unassigned
}

pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// Values following `option` in a command, trimmed of shell punctuation.
fn option_values(command: &str, option: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut tokens = command.split_whitespace();
    while let Some(token) = tokens.next() {
        if token != option {
            continue;
        }
        if let Some(value) = tokens.next() {
            let value: String = value
                .chars()
                .take_while(|c| !matches!(c, '|' | ';' | '&' | '`' | ')' | '"'))
                .collect();
            if !value.is_empty() {
                values.push(value);
            }
        }
    }
    values
}

/// Runs one shell command for a job.
pub trait CommandExecutor {
    /// Returns the command's exit code.
    fn execute(&self, command: &str, env: &BTreeMap<String, String>, workdir: &Path) -> Result<i32>;
}

/// Executes each command with `bash -c`.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self {
            shell: "bash".to_string(),
        }
    }
}

impl ShellExecutor {
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl CommandExecutor for ShellExecutor {
    fn execute(&self, command: &str, env: &BTreeMap<String, String>, workdir: &Path) -> Result<i32> {
        let status = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .current_dir(workdir)
            .envs(env)
            .status()
            .with_context(|| format!("Failed to spawn '{}' for command: {command}", self.shell))?;
        // Killed by a signal: report a generic failure code.
        Ok(status.code().unwrap_or(-1))
    }
}

/// Records commands instead of running them; every command exits 0.
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    executed: Mutex<Vec<String>>,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl CommandExecutor for DryRunExecutor {
    fn execute(&self, command: &str, _env: &BTreeMap<String, String>, _workdir: &Path) -> Result<i32> {
        info!(command, "dry run");
        if let Ok(mut guard) = self.executed.lock() {
            guard.push(command.to_string());
        }
        Ok(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseOutcome {
    pub phase: Phase,
    pub commands_run: usize,
    pub succeeded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandFailure {
    pub phase: Phase,
    pub index: usize,
    pub command: String,
    pub exit_code: i32,
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} command {} exited with {}: {}",
            self.phase,
            self.index + 1,
            self.exit_code,
            self.command
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    pub job: String,
    pub phases: Vec<PhaseOutcome>,
    pub failure: Option<CommandFailure>,
}

impl JobOutcome {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Runs a job's phases in order, stopping at the first nonzero exit.
pub struct JobRunner<'a, E: CommandExecutor + ?Sized> {
    executor: &'a E,
    metrics: Option<MetricsCollector>,
}

impl<'a, E: CommandExecutor + ?Sized> JobRunner<'a, E> {
    pub fn new(executor: &'a E) -> Self {
        Self {
            executor,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[instrument(skip(self, job, env, workdir), fields(job = %job.name))]
    pub fn run(
        &self,
        job: &BuildJob,
        env: &BTreeMap<String, String>,
        workdir: &Path,
    ) -> Result<JobOutcome> {
        let mut phases = Vec::new();
        for (phase, commands) in job.phases.iter() {
            debug!(%phase, commands = commands.len(), "Entering phase");
            let mut commands_run = 0;
            for (index, command) in commands.iter().enumerate() {
                let exit_code = self.executor.execute(command, env, workdir)?;
                commands_run += 1;
                if let Some(metrics) = &self.metrics {
                    metrics.record_command();
                }
                if exit_code != 0 {
                    warn!(%phase, exit_code, command = command.as_str(), "Command failed");
                    phases.push(PhaseOutcome {
                        phase,
                        commands_run,
                        succeeded: false,
                    });
                    return Ok(JobOutcome {
                        job: job.name.clone(),
                        phases,
                        failure: Some(CommandFailure {
                            phase,
                            index,
                            command: command.clone(),
                            exit_code,
                        }),
                    });
                }
            }
            phases.push(PhaseOutcome {
                phase,
                commands_run,
                succeeded: true,
            });
        }

        info!(phases = phases.len(), "Job completed");
        Ok(JobOutcome {
            job: job.name.clone(),
            phases,
            failure: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedExecutor {
        failing: &'static str,
        seen: Mutex<Vec<String>>,
    }

    impl CommandExecutor for ScriptedExecutor {
        fn execute(&self, command: &str, _env: &BTreeMap<String, String>, _workdir: &Path) -> Result<i32> {
            self.seen.lock().unwrap().push(command.to_string());
            Ok(if command == self.failing { 2 } else { 0 })
        }
    }

    fn job(phases: BuildPhases) -> BuildJob {
        BuildJob {
            name: "scan".into(),
            role: "build-role".into(),
            encryption_key: None,
            image: "aws/codebuild/amazonlinux2-x86_64-standard:2.0".into(),
            compute: ComputeType::Small,
            privileged: false,
            environment: BTreeMap::new(),
            phases,
            artifacts: Vec::new(),
        }
    }

    #[test]
    fn finds_referenced_variables() {
        let vars = referenced_variables(
            "docker run -v ${PWD}/h.yaml:/.h.yaml $ECR_REPOSITORY_URI:$HADOLINT_IMAGE_TAG hadolint - < ./Dockerfile",
        );
        let expected: BTreeSet<String> = ["ECR_REPOSITORY_URI", "HADOLINT_IMAGE_TAG", "PWD"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(vars, expected);

        assert!(referenced_variables("echo '$NOT_EXPANDED' \\$ALSO_NOT $? $(date) $1").is_empty());
        assert_eq!(
            referenced_variables("echo ${TAG:-latest}"),
            BTreeSet::from(["TAG".to_string()])
        );
    }

    #[test]
    fn assignments_cover_later_segments_only() {
        assert_eq!(
            unassigned_references(
                "mkdir -p $HOME/bin && cp ./kubectl $HOME/bin/kubectl && export PATH=$PATH:$HOME/bin"
            ),
            BTreeSet::from(["HOME".to_string(), "PATH".to_string()])
        );
        assert!(
            unassigned_references(
                "skip_checks=`paste -d, -s kubernetes/skip_checks.config` && checkov --skip-check $skip_checks"
            )
            .is_empty()
        );
        assert_eq!(
            unassigned_references("echo $LATE; LATE=1"),
            BTreeSet::from(["LATE".to_string()])
        );
        assert_eq!(
            unassigned_references("docker run -e A=1 image && echo $A"),
            BTreeSet::from(["A".to_string()])
        );
        assert_eq!(
            unassigned_references("echo 'a | B=1'; echo $B"),
            BTreeSet::from(["B".to_string()])
        );
    }

    #[test]
    fn segments_ignore_separators_in_quotes_and_substitutions() {
        assert_eq!(
            command_segments("export U=`aws sm get | jq -r .u` && echo \"a;b\" | wc -c"),
            vec!["export U=`aws sm get | jq -r .u`", "echo \"a;b\"", "wc -c"]
        );
        assert_eq!(
            command_segments("X=$(date | tr -d ' ') ; echo $X"),
            vec!["X=$(date | tr -d ' ')", "echo $X"]
        );
    }

    #[test]
    fn undeclared_variables_exclude_platform_and_same_command_assignments() {
        let mut job = job(BuildPhases {
            install: vec!["export TAG=${CODEBUILD_RESOLVED_SOURCE_VERSION}".into()],
            build: vec![
                "docker build -t $ECR_REPOSITORY_URI:$TAG .".into(),
                "export LOCAL=1 && echo $LOCAL".into(),
                "cd $HOME && echo $MISSING".into(),
            ],
            ..Default::default()
        });
        job.environment.insert(
            "ECR_REPOSITORY_URI".into(),
            EnvValue::reference(ResourceKind::Registry, "app", Attribute::Uri),
        );
        // TAG is exported by an earlier command, which runs in another shell.
        assert_eq!(
            job.undeclared_variables(),
            BTreeSet::from(["MISSING".to_string(), "TAG".to_string()])
        );
    }

    #[test]
    fn derives_permissions_from_commands() {
        let mut job = job(BuildPhases {
            install: vec![
                "export u=`aws secretsmanager get-secret-value --secret-id dockerhub| jq -r .username`".into(),
            ],
            build: vec![
                "ECR_LOGIN=$(aws ecr get-login --region $AWS_DEFAULT_REGION --no-include-email)".into(),
                "docker push $ECR_REPOSITORY_URI:$IMAGE_TAG".into(),
                "aws eks update-kubeconfig --name $AWS_CLUSTER_NAME --region $AWS_DEFAULT_REGION".into(),
            ],
            ..Default::default()
        });
        job.environment.insert(
            "ECR_REPOSITORY_URI".into(),
            EnvValue::reference(ResourceKind::Registry, "app", Attribute::Uri),
        );
        job.environment.insert(
            "AWS_CLUSTER_NAME".into(),
            EnvValue::reference(ResourceKind::Cluster, "eks", Attribute::Name),
        );

        let required = job.required_permissions();
        let secret = PolicyResource::Resource(ResourceRef::new(ResourceKind::Secret, "dockerhub"));
        let registry = PolicyResource::Resource(ResourceRef::new(ResourceKind::Registry, "app"));
        let cluster = PolicyResource::Resource(ResourceRef::new(ResourceKind::Cluster, "eks"));
        assert!(required.contains(&RequiredPermission::new("secretsmanager:GetSecretValue", secret)));
        assert!(required.contains(&RequiredPermission::new("ecr:GetAuthorizationToken", PolicyResource::Any)));
        assert!(required.contains(&RequiredPermission::new("ecr:PutImage", registry)));
        assert!(required.contains(&RequiredPermission::new("eks:DescribeCluster", cluster)));
        assert_eq!(job.referenced_secrets(), BTreeSet::from(["dockerhub".to_string()]));
    }

    #[test]
    fn runner_stops_at_first_failure() {
        let job = job(BuildPhases {
            install: vec!["echo install".into()],
            build: vec!["make".into(), "false".into(), "echo never".into()],
            post_build: vec!["echo post".into()],
            ..Default::default()
        });
        let executor = ScriptedExecutor {
            failing: "false",
            seen: Mutex::new(Vec::new()),
        };
        let outcome = JobRunner::new(&executor)
            .run(&job, &BTreeMap::new(), Path::new("."))
            .unwrap();

        assert!(!outcome.succeeded());
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.phase, Phase::Build);
        assert_eq!(failure.index, 1);
        assert_eq!(failure.exit_code, 2);
        assert_eq!(
            *executor.seen.lock().unwrap(),
            vec!["echo install", "make", "false"]
        );
        assert_eq!(outcome.phases.len(), 2);
    }

    #[test]
    fn buildspec_lists_phases_in_order() {
        let mut job = job(BuildPhases {
            pre_build: vec!["echo pre".into()],
            build: vec!["echo build".into()],
            ..Default::default()
        });
        job.artifacts = vec!["kubernetes/*".into()];
        let rendered = job.render_buildspec().unwrap();
        let pre = rendered.find("pre_build").unwrap();
        let build = rendered.find("\n  build").unwrap();
        assert!(pre < build);
        assert!(rendered.contains("kubernetes/*"));
        assert!(!rendered.contains("install"));
    }
}
