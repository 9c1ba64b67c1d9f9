use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::declaration::{DECLARATION_VERSION, StackDeclaration};
use crate::jobs::{BuildJob, RequiredPermission};
use crate::pipeline::ActionSpec;
use crate::resources::{
    AttributeRef, EnvValue, HttpTokens, PolicyResource, Principal, RegistryEncryption,
    ResourceKind, ResourceRef, action_matches,
};
use crate::security;
use crate::synth;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

pub fn validate_stack(stack: &StackDeclaration) -> ValidationReport {
    let mut report = ValidationReport::default();

    if stack.version != DECLARATION_VERSION {
        report.error(format!("Unsupported declaration version: {}", stack.version));
    }
    if stack.name.trim().is_empty() {
        report.error("Stack name cannot be empty");
    }

    report.merge(validate_names(stack));
    report.merge(validate_network(stack));
    report.merge(validate_cluster(stack));
    report.merge(validate_node_pools(stack));
    report.merge(validate_registry(stack));
    report.merge(validate_source(stack));
    report.merge(validate_roles(stack));
    for job in &stack.jobs {
        report.merge(validate_job(stack, job));
    }
    report.merge(validate_permissions(stack));
    report.merge(validate_pipeline(stack));
    report.merge(validate_outputs(stack));

    // Remaining graph-level problems (id collisions, cycles) only surface
    // once the declaration itself is sound.
    if report.is_ok()
        && let Err(err) = synth::synthesize(stack)
    {
        report.error(format!("Synthesis failed: {err}"));
    }

    for finding in security::audit(stack) {
        report.warn(format!("Security: {finding}"));
    }

    report
}

fn duplicates<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
    let mut seen = BTreeSet::new();
    let mut repeated = BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            repeated.insert(name);
        }
    }
    repeated.into_iter().collect()
}

fn validate_names(stack: &StackDeclaration) -> ValidationReport {
    let mut report = ValidationReport::default();
    let groups: [(&str, Vec<&str>); 8] = [
        ("parameter", stack.parameters.iter().map(|p| p.name.as_str()).collect()),
        ("key", stack.keys.iter().map(|k| k.name.as_str()).collect()),
        ("role", stack.roles.iter().map(|r| r.name.as_str()).collect()),
        ("secret", stack.secrets.iter().map(|s| s.name.as_str()).collect()),
        ("node pool", stack.node_pools.iter().map(|p| p.name.as_str()).collect()),
        ("launch template", stack.launch_templates.iter().map(|t| t.name.as_str()).collect()),
        ("job", stack.jobs.iter().map(|j| j.name.as_str()).collect()),
        ("stage", stack.pipeline.stages.iter().map(|s| s.name.as_str()).collect()),
    ];
    for (kind, names) in groups {
        if names.iter().any(|name| name.trim().is_empty()) {
            report.error(format!("A {kind} has an empty name"));
        }
        for name in duplicates(names) {
            report.error(format!("Duplicate {kind} name '{name}'"));
        }
    }
    for name in duplicates(stack.outputs.iter().map(|o| o.id.as_str())) {
        report.error(format!("Duplicate output id '{name}'"));
    }
    for name in duplicates(stack.outputs.iter().map(|o| o.export.as_str())) {
        report.error(format!("Duplicate export name '{name}'"));
    }
    report
}

fn validate_network(stack: &StackDeclaration) -> ValidationReport {
    let mut report = ValidationReport::default();
    if !stack.network.vpc_id.starts_with("vpc-") {
        report.error(format!("Network '{}' is not a VPC id", stack.network.vpc_id));
    }
    for subnet in &stack.network.subnet_ids {
        if !subnet.starts_with("subnet-") {
            report.error(format!("'{subnet}' is not a subnet id"));
        }
    }
    report
}

fn validate_cluster(stack: &StackDeclaration) -> ValidationReport {
    let mut report = ValidationReport::default();
    let cluster = &stack.cluster;
    if cluster.minor_version().is_none() {
        report.error(format!(
            "Cluster '{}' version '{}' is not a major.minor version",
            cluster.name, cluster.version
        ));
    }
    for role in std::iter::once(&cluster.masters_role).chain(&cluster.admin_roles) {
        if stack.role(role).is_none() {
            report.error(format!(
                "Cluster '{}' grants admin access to unknown role '{role}'",
                cluster.name
            ));
        }
    }
    report
}

fn validate_node_pools(stack: &StackDeclaration) -> ValidationReport {
    let mut report = ValidationReport::default();
    for pool in &stack.node_pools {
        let name = &pool.name;
        if pool.min_size > pool.max_size {
            report.error(format!(
                "Node pool '{name}' min size {} exceeds max size {}",
                pool.min_size, pool.max_size
            ));
        }
        if pool.max_size == 0 {
            report.error(format!("Node pool '{name}' max size must be at least 1"));
        }
        if let Some(desired) = pool.desired_size
            && (desired < pool.min_size || desired > pool.max_size)
        {
            report.error(format!(
                "Node pool '{name}' desired size {desired} is outside {}..={}",
                pool.min_size, pool.max_size
            ));
        }
        match &pool.launch_template {
            Some(_) if !pool.instance_types.is_empty() => report.error(format!(
                "Node pool '{name}' sets instance types and a launch template; the template owns the instance type"
            )),
            Some(template) if stack.launch_template(template).is_none() => report.error(format!(
                "Node pool '{name}' references unknown launch template '{template}'"
            )),
            None if pool.instance_types.is_empty() => report.warn(format!(
                "Node pool '{name}' has no instance types and falls back to the provider default"
            )),
            _ => {}
        }
    }

    for template in &stack.launch_templates {
        let name = &template.name;
        if template.metadata.http_tokens != HttpTokens::Required {
            report.error(format!(
                "Launch template '{name}' must require session tokens for instance metadata"
            ));
        }
        if template.metadata.hop_limit != 1 {
            report.error(format!(
                "Launch template '{name}' metadata hop limit must be 1, found {}",
                template.metadata.hop_limit
            ));
        }
        if !template.image_id.starts_with("ami-") {
            report.error(format!(
                "Launch template '{name}' image '{}' is not a machine image id",
                template.image_id
            ));
        }
        match template
            .boot_commands
            .iter()
            .find(|command| command.contains("/etc/eks/bootstrap.sh"))
        {
            None => report.warn(format!(
                "Launch template '{name}' never runs /etc/eks/bootstrap.sh; nodes will not join the cluster"
            )),
            Some(command) if !command.split_whitespace().any(|arg| arg == stack.cluster.name) => {
                report.error(format!(
                    "Launch template '{name}' bootstraps nodes into a cluster other than '{}'",
                    stack.cluster.name
                ))
            }
            Some(_) => {}
        }
        let used = stack
            .node_pools
            .iter()
            .any(|pool| pool.launch_template.as_deref() == Some(name.as_str()));
        if !used {
            report.warn(format!("Launch template '{name}' is not used by any node pool"));
        }
    }
    report
}

fn validate_registry(stack: &StackDeclaration) -> ValidationReport {
    let mut report = ValidationReport::default();
    let registry = &stack.registry;
    match (registry.encryption, &registry.encryption_key) {
        (RegistryEncryption::Kms, None) => report.error(format!(
            "Registry '{}' uses KMS encryption but declares no key",
            registry.name
        )),
        (RegistryEncryption::Kms, Some(key)) if stack.key(key).is_none() => report.error(format!(
            "Registry '{}' references unknown key '{key}'",
            registry.name
        )),
        (RegistryEncryption::Aes256, Some(key)) => report.warn(format!(
            "Registry '{}' ignores key '{key}' because it uses AES256 encryption",
            registry.name
        )),
        _ => {}
    }
    if !is_registry_name(&registry.name) {
        report.error(format!(
            "Registry name '{}' must be lowercase letters, digits, '-', '_', '.' or '/'",
            registry.name
        ));
    }
    report
}

fn is_registry_name(name: &str) -> bool {
    (2..=256).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "-_./".contains(c))
}

fn validate_source(stack: &StackDeclaration) -> ValidationReport {
    let mut report = ValidationReport::default();
    let name = &stack.source.name;
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c));
    if name.is_empty() || name.len() > 100 || !valid_chars {
        report.error(format!(
            "Source repository name '{name}' must be 1-100 letters, digits, '-', '_' or '.'"
        ));
    }
    report
}

fn validate_roles(stack: &StackDeclaration) -> ValidationReport {
    let mut report = ValidationReport::default();
    for role in &stack.roles {
        for statement in &role.statements {
            let label = statement.sid.as_deref().unwrap_or("<unnamed>");
            if statement.actions.is_empty() || statement.resources.is_empty() {
                report.error(format!(
                    "Role '{}' statement {label} needs at least one action and one resource",
                    role.name
                ));
            }
            for resource in &statement.resources {
                if let PolicyResource::Resource(target) = resource
                    && !stack.contains(target)
                {
                    report.error(format!(
                        "Role '{}' statement {label} references unknown resource '{target}'",
                        role.name
                    ));
                }
            }
        }
    }
    for key in [&stack.pipeline.artifact_key]
        .into_iter()
        .flatten()
        .chain(stack.jobs.iter().filter_map(|job| job.encryption_key.as_ref()))
    {
        if stack.key(key).is_none() {
            report.error(format!("Unknown encryption key '{key}'"));
        }
    }
    report
}

fn check_reference(
    stack: &StackDeclaration,
    reference: &AttributeRef,
    context: &str,
    report: &mut ValidationReport,
) {
    let target = &reference.target;
    if !stack.contains(target) {
        report.error(format!("{context} references unknown resource '{target}'"));
    } else if !target.kind.supports(reference.attribute) {
        report.error(format!(
            "{context} requests attribute '{}' which '{target}' does not expose",
            reference.attribute
        ));
    }
}

fn validate_job(stack: &StackDeclaration, job: &BuildJob) -> ValidationReport {
    let mut report = ValidationReport::default();
    let name = &job.name;

    match stack.role(&job.role) {
        None => report.error(format!("Job '{name}' uses unknown role '{}'", job.role)),
        Some(role) => {
            if role.assumed_by != Principal::Service("codebuild.amazonaws.com".into()) {
                report.warn(format!(
                    "Job '{name}' role '{}' is not assumable by the build service",
                    role.name
                ));
            }
            let cluster = &stack.cluster;
            let is_admin = cluster.masters_role == role.name || cluster.admin_roles.contains(&role.name);
            if job.uses_cluster_api() && !is_admin {
                report.warn(format!(
                    "Job '{name}' calls the cluster API but role '{}' has no cluster access entry",
                    role.name
                ));
            }
        }
    }
    if job.phases.is_empty() {
        report.error(format!("Job '{name}' has no commands"));
    }

    for variable in job.undeclared_variables() {
        report.error(format!(
            "Job '{name}' references undeclared environment variable '{variable}'"
        ));
    }
    let referenced = job.referenced_variables();
    for variable in job.environment.keys() {
        if !referenced.contains(variable) {
            report.warn(format!(
                "Job '{name}' declares environment variable '{variable}' that no command reads"
            ));
        }
    }

    for (variable, value) in &job.environment {
        let context = format!("Job '{name}' variable '{variable}'");
        match value {
            EnvValue::Reference(reference) => check_reference(stack, reference, &context, &mut report),
            EnvValue::Parameter { parameter } if stack.parameter(parameter).is_none() => {
                report.error(format!("{context} uses unknown parameter '{parameter}'"))
            }
            _ => {}
        }
    }

    for secret in job.referenced_secrets() {
        if !stack.contains(&ResourceRef::new(ResourceKind::Secret, secret.as_str())) {
            report.error(format!("Job '{name}' reads undeclared secret '{secret}'"));
        }
    }
    report
}

/// Each role must hold exactly the permissions its jobs' commands need.
fn validate_permissions(stack: &StackDeclaration) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut required: BTreeMap<&str, BTreeSet<RequiredPermission>> = BTreeMap::new();
    for job in &stack.jobs {
        required
            .entry(job.role.as_str())
            .or_default()
            .extend(job.required_permissions());
    }

    for (role_name, needed) in &required {
        let Some(role) = stack.role(role_name) else {
            continue;
        };
        for permission in needed {
            let granted = role
                .statements
                .iter()
                .any(|statement| statement.allows(&permission.action, &permission.resource));
            if !granted {
                report.error(format!(
                    "Role '{role_name}' lacks {permission} required by its jobs"
                ));
            }
        }
        for statement in &role.statements {
            let label = statement.sid.as_deref().unwrap_or("<unnamed>");
            for action in &statement.actions {
                for resource in &statement.resources {
                    let used = needed.iter().any(|permission| {
                        action_matches(action, &permission.action)
                            && (*resource == PolicyResource::Any || *resource == permission.resource)
                    });
                    if !used {
                        report.warn(format!(
                            "Role '{role_name}' statement {label} grants {action} on {resource} which no job uses"
                        ));
                    }
                }
            }
        }
    }
    report
}

fn validate_pipeline(stack: &StackDeclaration) -> ValidationReport {
    let mut report = ValidationReport::default();
    let pipeline = &stack.pipeline;

    if pipeline.name.trim().is_empty() {
        report.error("Pipeline name cannot be empty");
    }
    if pipeline.stages.len() < 2 {
        report.error("Pipeline must contain at least two stages");
    }

    let carried = pipeline.carried_artifacts();
    let mut producers: BTreeMap<&str, &str> = BTreeMap::new();
    let mut consumers: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut used_jobs = BTreeSet::new();

    for (index, stage) in pipeline.stages.iter().enumerate() {
        if stage.actions.is_empty() {
            report.error(format!("Stage '{}' has no actions", stage.name));
        }
        for name in duplicates(stage.actions.iter().map(ActionSpec::name)) {
            report.error(format!("Stage '{}' has duplicate action '{name}'", stage.name));
        }

        let is_source_stage = stage
            .actions
            .iter()
            .all(|action| matches!(action, ActionSpec::Source { .. }));
        if index == 0 && !is_source_stage {
            report.error(format!(
                "First stage '{}' must contain only source actions",
                stage.name
            ));
        }

        for action in &stage.actions {
            let label = format!("Action '{}' in stage '{}'", action.name(), stage.name);
            match action {
                ActionSpec::Source { repository, .. } => {
                    if index != 0 {
                        report.error(format!("{label} is a source action outside the first stage"));
                    }
                    if *repository != stack.source.name {
                        report.error(format!("{label} reads unknown repository '{repository}'"));
                    }
                }
                ActionSpec::Build { job, input, .. } => {
                    used_jobs.insert(job.as_str());
                    if stack.job(job).is_none() {
                        report.error(format!("{label} runs unknown job '{job}'"));
                    }
                    match carried[index] {
                        Some(expected) if expected == input.as_str() => {}
                        Some(expected) => report.error(format!(
                            "{label} reads artifact '{input}' but the previous stage emits '{expected}'"
                        )),
                        None => report.error(format!(
                            "{label} reads artifact '{input}' but no earlier stage emits one"
                        )),
                    }
                    consumers.entry(input.as_str()).or_default().push(action.name());
                }
                ActionSpec::Approval { .. } => {}
            }
            for output in action.outputs() {
                if let Some(previous) = producers.insert(output, stage.name.as_str()) {
                    report.error(format!(
                        "Artifact '{output}' is produced by both stage '{previous}' and stage '{}'",
                        stage.name
                    ));
                }
            }
        }
    }

    for (artifact, readers) in &consumers {
        if readers.len() > 1 {
            report.error(format!(
                "Artifact '{artifact}' is consumed by more than one action"
            ));
        }
    }
    let last_stage = pipeline.stages.last().map(|stage| stage.name.as_str());
    for (artifact, stage) in &producers {
        if !consumers.contains_key(artifact) && Some(*stage) != last_stage {
            report.warn(format!(
                "Artifact '{artifact}' from stage '{stage}' is never consumed"
            ));
        }
    }
    for job in &stack.jobs {
        if !used_jobs.contains(job.name.as_str()) {
            report.warn(format!("Job '{}' is not run by the pipeline", job.name));
        }
    }
    report
}

fn validate_outputs(stack: &StackDeclaration) -> ValidationReport {
    let mut report = ValidationReport::default();
    for output in &stack.outputs {
        if output.export.trim().is_empty() {
            report.error(format!("Output '{}' has an empty export name", output.id));
        }
        check_reference(
            stack,
            &output.value,
            &format!("Output '{}'", output.id),
            &mut report,
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presets;
    use crate::resources::{Attribute, MetadataOptions};

    fn reference() -> StackDeclaration {
        presets::preset("devsecops-eks").unwrap()
    }

    #[test]
    fn presets_validate_cleanly() {
        for name in presets::preset_names() {
            let report = validate_stack(&presets::preset(name).unwrap());
            assert!(report.is_ok(), "{name}: {:#?}", report.errors);
            assert!(report.warnings.is_empty(), "{name}: {:#?}", report.warnings);
        }
    }

    #[test]
    fn rejects_inverted_node_pool_bounds() {
        let mut stack = reference();
        stack.node_pools[0].min_size = 3;
        let report = validate_stack(&stack);
        assert!(report.errors.iter().any(|e| e.contains("min size 3 exceeds max size 2")));
    }

    #[test]
    fn launch_template_must_harden_metadata() {
        let mut stack = reference();
        stack.launch_templates[0].metadata = MetadataOptions::default();
        let report = validate_stack(&stack);
        assert!(report.errors.iter().any(|e| e.contains("require session tokens")));
        assert!(!report.errors.iter().any(|e| e.contains("hop limit")));

        stack.launch_templates[0].metadata.http_tokens = HttpTokens::Required;
        stack.launch_templates[0].metadata.hop_limit = 2;
        let report = validate_stack(&stack);
        assert!(report.errors.iter().any(|e| e.contains("hop limit must be 1, found 2")));
    }

    #[test]
    fn build_input_must_match_carried_artifact() {
        let mut stack = reference();
        if let ActionSpec::Build { input, .. } = &mut stack.pipeline.stages[3].actions[0] {
            *input = "SourceOutput".into();
        }
        let report = validate_stack(&stack);
        assert!(report.errors.iter().any(|e| {
            e.contains("reads artifact 'SourceOutput' but the previous stage emits 'PolicyScanOutput'")
        }));
        assert!(report.errors.iter().any(|e| e.contains("consumed by more than one action")));
    }

    #[test]
    fn undeclared_variables_are_errors() {
        let mut stack = reference();
        stack.jobs[2].environment.remove("AWS_CLUSTER_NAME");
        let report = validate_stack(&stack);
        assert!(report.errors.iter().any(|e| {
            e.contains("references undeclared environment variable 'AWS_CLUSTER_NAME'")
        }));
    }

    #[test]
    fn permissions_must_match_exactly() {
        let mut stack = reference();
        let deploy_role = stack.roles.iter_mut().find(|r| r.name == "deploy-role").unwrap();
        deploy_role.statements[0].actions = vec!["eks:DescribeNodegroup".into()];
        let report = validate_stack(&stack);
        assert!(report.errors.iter().any(|e| {
            e.contains("Role 'deploy-role' lacks eks:DescribeCluster on cluster:eks-cluster")
        }));
        assert!(report.warnings.iter().any(|w| w.contains("grants eks:DescribeNodegroup")));
    }

    #[test]
    fn kms_registry_needs_a_declared_key() {
        let mut stack = reference();
        stack.registry.encryption_key = Some("missing".into());
        let report = validate_stack(&stack);
        assert!(report.errors.iter().any(|e| e.contains("unknown key 'missing'")));
    }

    #[test]
    fn outputs_must_reference_declared_resources() {
        let mut stack = reference();
        stack.outputs[0].value =
            AttributeRef::new(ResourceRef::new(ResourceKind::Source, "repo"), Attribute::Endpoint);
        let report = validate_stack(&stack);
        assert!(report.errors.iter().any(|e| e.contains("unknown resource 'source:repo'")));
    }
}
