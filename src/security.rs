use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::declaration::StackDeclaration;
use crate::jobs::{BuildJob, referenced_variables};
use crate::resources::{ControlPlaneLog, EndpointAccess, EnvValue, PolicyResource, parse_minor_version};

/// AWS managed policies granting far more than a build job needs.
const BROAD_MANAGED_POLICIES: [&str; 7] = [
    "AdministratorAccess",
    "PowerUserAccess",
    "IAMFullAccess",
    "SecretsManagerReadWrite",
    "AmazonS3FullAccess",
    "AmazonEC2ContainerRegistryFullAccess",
    "AmazonEKSClusterPolicy",
];

/// Actions that only accept a `*` resource.
const ACCOUNT_WIDE_ACTIONS: [&str; 2] = ["ecr:GetAuthorizationToken", "sts:GetCallerIdentity"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        };
        f.write_str(label)
    }
}

/// A posture concern found in a declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub severity: Severity,
    /// Resource the finding is about, as `kind:name`.
    pub subject: String,
    pub message: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.subject, self.message)
    }
}

fn finding(severity: Severity, subject: impl Into<String>, message: impl Into<String>) -> Finding {
    Finding {
        severity,
        subject: subject.into(),
        message: message.into(),
    }
}

/// Audits the declaration's security posture. Findings are sorted by
/// severity, highest first.
pub fn audit(stack: &StackDeclaration) -> Vec<Finding> {
    let mut findings = Vec::new();

    let registry = format!("registry:{}", stack.registry.name);
    if !stack.registry.scan_on_push {
        findings.push(finding(Severity::High, &registry, "image scanning on push is disabled"));
    }

    for key in stack.keys.iter().filter(|key| !key.rotation) {
        findings.push(finding(
            Severity::Medium,
            format!("key:{}", key.name),
            "automatic key rotation is disabled",
        ));
    }

    let cluster = format!("cluster:{}", stack.cluster.name);
    match stack.cluster.endpoint_access {
        EndpointAccess::Public => findings.push(finding(
            Severity::High,
            &cluster,
            "API endpoint is reachable only from the internet",
        )),
        EndpointAccess::PublicAndPrivate => findings.push(finding(
            Severity::Medium,
            &cluster,
            "API endpoint is also reachable from the internet",
        )),
        EndpointAccess::Private => {}
    }
    if !stack.cluster.logging.contains(&ControlPlaneLog::Audit) {
        findings.push(finding(Severity::Medium, &cluster, "control-plane audit logging is disabled"));
    }

    for role in &stack.roles {
        let subject = format!("role:{}", role.name);
        for policy in &role.managed_policies {
            if BROAD_MANAGED_POLICIES.contains(&policy.as_str()) {
                findings.push(finding(
                    Severity::High,
                    &subject,
                    format!("managed policy '{policy}' grants more than the role's jobs use"),
                ));
            }
        }
        for statement in &role.statements {
            if statement.actions.iter().any(|action| action == "*") {
                findings.push(finding(Severity::High, &subject, "statement grants every action"));
            }
            let wide = statement.resources.contains(&PolicyResource::Any)
                && statement
                    .actions
                    .iter()
                    .any(|action| !ACCOUNT_WIDE_ACTIONS.contains(&action.as_str()));
            if wide {
                findings.push(finding(
                    Severity::Medium,
                    &subject,
                    format!(
                        "statement {} applies to every resource",
                        statement.sid.as_deref().unwrap_or("without sid")
                    ),
                ));
            }
        }
    }

    let cluster_minor = stack.cluster.minor_version();
    for job in &stack.jobs {
        findings.extend(audit_job(stack, job, cluster_minor));
    }

    findings.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.subject.cmp(&b.subject)));
    findings
}

fn audit_job(stack: &StackDeclaration, job: &BuildJob, cluster_minor: Option<(u32, u32)>) -> Vec<Finding> {
    let subject = format!("job:{}", job.name);
    let mut findings = Vec::new();

    if !is_pinned_image(&job.image) {
        findings.push(finding(
            Severity::Medium,
            &subject,
            format!("build image '{}' is not pinned to a version", job.image),
        ));
    }

    let runs_docker = job
        .phases
        .all_commands()
        .any(|command| command.contains("docker "));
    if job.privileged && !runs_docker {
        findings.push(finding(
            Severity::Medium,
            &subject,
            "privileged mode is enabled but no command uses docker",
        ));
    }

    let mut downloads = false;
    let mut verified = false;
    for command in job.phases.all_commands() {
        let is_download = command.contains("curl ") || command.contains("wget ");
        downloads |= is_download;
        verified |= command.contains("sha256sum -c") || command.contains("shasum -a 256 -c");

        if is_download && pipes_to_shell(command) {
            findings.push(finding(
                Severity::High,
                &subject,
                format!("remote script is piped to a shell without verification: {command}"),
            ));
        }
        if command.contains("http://") {
            findings.push(finding(
                Severity::Medium,
                &subject,
                format!("download over plain HTTP: {command}"),
            ));
        }
        let trimmed = command.trim_start();
        if (trimmed.starts_with("docker pull") || trimmed.starts_with("docker run"))
            && command.split_whitespace().any(|token| token.ends_with(":latest"))
        {
            findings.push(finding(
                Severity::Low,
                &subject,
                format!("command uses a mutable ':latest' image: {command}"),
            ));
        }
        if let (Some(cluster), Some(client)) = (cluster_minor, kubectl_version(stack, job, command))
            && cluster.0 == client.0
            && cluster.1.abs_diff(client.1) > 1
        {
            findings.push(finding(
                Severity::High,
                &subject,
                format!(
                    "kubectl {}.{} is more than one minor version away from cluster {}.{}",
                    client.0, client.1, cluster.0, cluster.1
                ),
            ));
        }
    }
    if downloads && !verified {
        findings.push(finding(
            Severity::Medium,
            &subject,
            "downloads are not verified against a checksum",
        ));
    }
    findings
}

fn is_pinned_image(image: &str) -> bool {
    if image.contains('@') {
        return true;
    }
    let name = image.rsplit('/').next().unwrap_or(image);
    match name.split_once(':') {
        Some((_, tag)) => tag != "latest" && !tag.is_empty(),
        None => false,
    }
}

fn pipes_to_shell(command: &str) -> bool {
    command.split('|').skip(1).any(|segment| {
        let program = segment.split_whitespace().next().unwrap_or_default();
        matches!(program, "bash" | "sh" | "zsh" | "sudo")
    })
}

/// Client version of a kubectl binary fetched from the amazon-eks bucket,
/// with `$VAR` path segments resolved through the job environment.
fn kubectl_version(stack: &StackDeclaration, job: &BuildJob, command: &str) -> Option<(u32, u32)> {
    if !command.contains("kubectl") {
        return None;
    }
    let url = command
        .split_whitespace()
        .find(|token| token.contains("amazon-eks") && token.contains("amazonaws.com/"))?;
    let (_, path) = url.split_once("amazonaws.com/")?;
    let release = path.split("/bin/").next()?;

    let variables = referenced_variables(release);
    let resolved = match variables.iter().next() {
        None => release.to_string(),
        Some(variable) => match job.environment.get(variable)? {
            EnvValue::Literal(value) => value.clone(),
            EnvValue::Parameter { parameter } => stack.parameter(parameter)?.default.clone()?,
            _ => return None,
        },
    };
    parse_minor_version(&resolved)
}

/// Compute the SHA256 digest of the file at `path` and return it as a hex string.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Write the digest of `path` into `output` in `sha256sum -c` format.
pub fn write_sha256(path: &Path, output: &Path) -> Result<String> {
    let digest = compute_sha256(path)?;
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create digest directory: {}", parent.display()))?;
    }
    let mut file = File::create(output)
        .with_context(|| format!("Failed to create digest file: {}", output.display()))?;
    writeln!(file, "{}  {}", digest, path.display()).with_context(|| {
        format!(
            "Failed to write digest for '{}' into '{}'.",
            path.display(),
            output.display()
        )
    })?;
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presets;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn compute_sha256_is_stable() {
        let temp = tempdir().unwrap();
        let file_path = temp.path().join("digest.bin");
        let mut file = File::create(&file_path).unwrap();
        file.write_all(b"abc").unwrap();

        let digest = compute_sha256(&file_path).unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn hardened_reference_stack_has_no_high_findings() {
        let stack = presets::preset("devsecops-eks").unwrap();
        let findings = audit(&stack);
        assert!(
            findings.iter().all(|f| f.severity < Severity::High),
            "{findings:#?}"
        );
    }

    #[test]
    fn flags_unverified_scripts_and_version_skew() {
        let mut stack = presets::preset("devsecops-eks").unwrap();
        let deploy = stack
            .jobs
            .iter_mut()
            .find(|job| job.name == "devsecops-project-eks-deploy")
            .unwrap();
        deploy.phases.pre_build = vec![
            "curl -o kubectl https://amazon-eks.s3.us-west-2.amazonaws.com/1.18.9/2020-11-02/bin/linux/amd64/kubectl".into(),
        ];
        deploy.phases.build = vec!["curl -s http://example.com/scan.sh | bash -s -- image".into()];
        stack.registry.scan_on_push = false;
        stack.roles[1].managed_policies.push("SecretsManagerReadWrite".into());

        let messages: Vec<String> = audit(&stack).iter().map(ToString::to_string).collect();
        let has = |needle: &str| messages.iter().any(|m| m.contains(needle));
        assert!(has("kubectl 1.18 is more than one minor version away from cluster 1.21"));
        assert!(has("piped to a shell"));
        assert!(has("plain HTTP"));
        assert!(has("not verified against a checksum"));
        assert!(has("scanning on push is disabled"));
        assert!(has("SecretsManagerReadWrite"));
        assert_eq!(audit(&stack)[0].severity, Severity::High);
    }

    #[test]
    fn image_pinning() {
        assert!(is_pinned_image("aws/codebuild/amazonlinux2-x86_64-standard:3.0"));
        assert!(!is_pinned_image("public.ecr.aws/ackstorm/checkov:latest"));
        assert!(!is_pinned_image("localhost:5000/tool"));
        assert!(is_pinned_image("tool@sha256:abcd"));
    }
}
