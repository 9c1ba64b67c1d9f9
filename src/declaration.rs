use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use glob::glob;
use serde::{Deserialize, Serialize};

use crate::error::{StackError, StackResult};
use crate::jobs::BuildJob;
use crate::pipeline::PipelineDescriptor;
use crate::resources::{
    Attribute, AttributeRef, Cluster, EncryptionKey, EnvValue, LaunchTemplate, Network, NodePool,
    Output, Parameter, PseudoParameter, Registry, ResourceKind, ResourceRef, Role, SecretRef,
    SourceRepo,
};

pub const DECLARATION_VERSION: u32 = 1;

fn default_region() -> String {
    "us-west-2".to_string()
}

fn default_partition() -> String {
    "aws".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackEnvironment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
}

impl Default for StackEnvironment {
    fn default() -> Self {
        Self {
            account: None,
            region: default_region(),
        }
    }
}

/// The whole topology: cluster, registry, source, jobs and release pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackDeclaration {
    pub version: u32,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub environment: StackEnvironment,
    pub network: Network,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<EncryptionKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<Role>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<SecretRef>,
    pub cluster: Cluster,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_pools: Vec<NodePool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub launch_templates: Vec<LaunchTemplate>,
    pub registry: Registry,
    pub source: SourceRepo,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<BuildJob>,
    pub pipeline: PipelineDescriptor,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<Output>,
}

impl StackDeclaration {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read stack declaration: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse stack declaration: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to render stack declaration")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        std::fs::write(path, self.to_yaml()?)
            .with_context(|| format!("Failed to write stack declaration: {}", path.display()))
    }

    /// Applies command-line or environment overrides.
    pub fn apply_overrides(&mut self, account: Option<String>, region: Option<String>) {
        if let Some(account) = account.filter(|value| !value.trim().is_empty()) {
            self.environment.account = Some(account);
        }
        if let Some(region) = region.filter(|value| !value.trim().is_empty()) {
            self.environment.region = region;
        }
    }

    pub fn role(&self, name: &str) -> Option<&Role> {
        self.roles.iter().find(|role| role.name == name)
    }

    pub fn key(&self, name: &str) -> Option<&EncryptionKey> {
        self.keys.iter().find(|key| key.name == name)
    }

    pub fn job(&self, name: &str) -> Option<&BuildJob> {
        self.jobs.iter().find(|job| job.name == name)
    }

    pub fn launch_template(&self, name: &str) -> Option<&LaunchTemplate> {
        self.launch_templates.iter().find(|lt| lt.name == name)
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|param| param.name == name)
    }

    pub fn jobs_for_role<'a>(&'a self, role: &'a str) -> impl Iterator<Item = &'a BuildJob> + 'a {
        self.jobs.iter().filter(move |job| job.role == role)
    }

    /// Whether `target` names a declared resource.
    pub fn contains(&self, target: &ResourceRef) -> bool {
        let name = target.name.as_str();
        match target.kind {
            ResourceKind::Cluster => self.cluster.name == name,
            ResourceKind::NodePool => self.node_pools.iter().any(|pool| pool.name == name),
            ResourceKind::LaunchTemplate => self.launch_template(name).is_some(),
            ResourceKind::Registry => self.registry.name == name,
            ResourceKind::Source => self.source.name == name,
            ResourceKind::Key => self.key(name).is_some(),
            ResourceKind::Role => self.role(name).is_some(),
            ResourceKind::Secret => self.secrets.iter().any(|secret| secret.name == name),
            ResourceKind::Job => self.job(name).is_some(),
            ResourceKind::Pipeline => self.pipeline.name == name,
        }
    }

    /// Resolves a job's environment to concrete strings for a local run.
    pub fn resolve_job_environment(
        &self,
        job: &BuildJob,
        ctx: &ResolutionContext,
    ) -> StackResult<BTreeMap<String, String>> {
        job.environment
            .iter()
            .map(|(name, value)| {
                let resolved = self.resolve_value(value, &format!("job:{}", job.name), ctx)?;
                Ok((name.clone(), resolved))
            })
            .collect()
    }

    pub fn resolve_value(
        &self,
        value: &EnvValue,
        from: &str,
        ctx: &ResolutionContext,
    ) -> StackResult<String> {
        match value {
            EnvValue::Literal(literal) => Ok(literal.clone()),
            EnvValue::Parameter { parameter } => ctx
                .parameters
                .get(parameter)
                .cloned()
                .or_else(|| self.parameter(parameter).and_then(|p| p.default.clone()))
                .ok_or_else(|| StackError::UnresolvedParameter(parameter.clone())),
            EnvValue::Pseudo { pseudo } => match pseudo {
                PseudoParameter::Region => Ok(ctx.region.clone()),
                PseudoParameter::Partition => Ok(ctx.partition.clone()),
                PseudoParameter::AccountId => ctx
                    .account
                    .clone()
                    .ok_or_else(|| StackError::MissingAccount(from.to_string())),
            },
            EnvValue::Reference(reference) => self.physical_value(reference, from, ctx),
        }
    }

    /// Stack outputs with their values computed for `ctx`.
    pub fn resolved_outputs(&self, ctx: &ResolutionContext) -> StackResult<Vec<ResolvedOutput>> {
        self.outputs
            .iter()
            .map(|output| {
                let from = format!("output:{}", output.id);
                Ok(ResolvedOutput {
                    id: output.id.clone(),
                    export: output.export.clone(),
                    value: self.physical_value(&output.value, &from, ctx)?,
                    description: output.description.clone(),
                })
            })
            .collect()
    }

    /// The value a provisioned resource attribute takes, computed from the
    /// naming conventions of the provider.
    fn physical_value(
        &self,
        reference: &AttributeRef,
        from: &str,
        ctx: &ResolutionContext,
    ) -> StackResult<String> {
        let target = &reference.target;
        if !self.contains(target) {
            return Err(StackError::UnknownReference {
                from: from.to_string(),
                target: target.to_string(),
            });
        }
        let unsupported = || StackError::UnsupportedAttribute {
            target: target.clone(),
            attribute: reference.attribute,
        };
        let name = target.name.as_str();
        let region = ctx.region.as_str();
        let partition = ctx.partition.as_str();

        match reference.attribute {
            Attribute::Name => match target.kind {
                // Generated ids only exist once provisioned.
                ResourceKind::Key | ResourceKind::LaunchTemplate => Err(unsupported()),
                _ => Ok(name.to_string()),
            },
            Attribute::Uri => match target.kind {
                ResourceKind::Registry => {
                    let account = ctx.require_account(from)?;
                    Ok(format!("{account}.dkr.ecr.{region}.amazonaws.com/{name}"))
                }
                ResourceKind::Source => Ok(format!(
                    "https://git-codecommit.{region}.amazonaws.com/v1/repos/{name}"
                )),
                _ => Err(unsupported()),
            },
            Attribute::Arn => {
                let account = ctx.require_account(from)?;
                let arn = match target.kind {
                    ResourceKind::Cluster => {
                        format!("arn:{partition}:eks:{region}:{account}:cluster/{name}")
                    }
                    ResourceKind::NodePool => format!(
                        "arn:{partition}:eks:{region}:{account}:nodegroup/{}/{name}",
                        self.cluster.name
                    ),
                    ResourceKind::Registry => {
                        format!("arn:{partition}:ecr:{region}:{account}:repository/{name}")
                    }
                    ResourceKind::Source => {
                        format!("arn:{partition}:codecommit:{region}:{account}:{name}")
                    }
                    ResourceKind::Role => format!("arn:{partition}:iam::{account}:role/{name}"),
                    ResourceKind::Secret => {
                        format!("arn:{partition}:secretsmanager:{region}:{account}:secret:{name}")
                    }
                    ResourceKind::Job => {
                        format!("arn:{partition}:codebuild:{region}:{account}:project/{name}")
                    }
                    ResourceKind::Key | ResourceKind::LaunchTemplate | ResourceKind::Pipeline => {
                        return Err(unsupported());
                    }
                };
                Ok(arn)
            }
            Attribute::Endpoint => Err(unsupported()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedOutput {
    pub id: String,
    pub export: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Inputs needed to turn declared values into concrete strings outside the
/// provisioning engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionContext {
    pub account: Option<String>,
    pub region: String,
    pub partition: String,
    pub parameters: BTreeMap<String, String>,
}

impl ResolutionContext {
    pub fn for_stack(stack: &StackDeclaration) -> Self {
        Self {
            account: stack.environment.account.clone(),
            region: stack.environment.region.clone(),
            partition: default_partition(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: BTreeMap<String, String>) -> Self {
        self.parameters.extend(parameters);
        self
    }

    fn require_account(&self, from: &str) -> StackResult<&str> {
        self.account
            .as_deref()
            .ok_or_else(|| StackError::MissingAccount(from.to_string()))
    }
}

/// Expands glob patterns into existing declaration files.
pub fn expand_declarations(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut resolved = Vec::new();
    for pattern in patterns {
        let matches =
            glob(pattern).with_context(|| format!("Invalid glob pattern: {pattern}"))?;
        let mut found = false;
        for entry in matches {
            let path = entry?;
            if path.is_file() {
                resolved.push(path);
                found = true;
            }
        }
        if !found {
            anyhow::bail!("No stack declarations matched pattern: {pattern}");
        }
    }
    Ok(resolved)
}
