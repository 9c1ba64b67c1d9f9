//! Provisioning-time resource descriptors.
//!
//! Each type here is a plain configuration record read from a stack
//! declaration. Nothing in this module talks to a cloud API.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cluster,
    NodePool,
    LaunchTemplate,
    Registry,
    Source,
    Key,
    Role,
    Secret,
    Job,
    Pipeline,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 10] = [
        ResourceKind::Cluster,
        ResourceKind::NodePool,
        ResourceKind::LaunchTemplate,
        ResourceKind::Registry,
        ResourceKind::Source,
        ResourceKind::Key,
        ResourceKind::Role,
        ResourceKind::Secret,
        ResourceKind::Job,
        ResourceKind::Pipeline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cluster => "cluster",
            ResourceKind::NodePool => "node_pool",
            ResourceKind::LaunchTemplate => "launch_template",
            ResourceKind::Registry => "registry",
            ResourceKind::Source => "source",
            ResourceKind::Key => "key",
            ResourceKind::Role => "role",
            ResourceKind::Secret => "secret",
            ResourceKind::Job => "job",
            ResourceKind::Pipeline => "pipeline",
        }
    }

    /// Whether the provisioned resource exposes `attribute`.
    pub fn supports(&self, attribute: Attribute) -> bool {
        match attribute {
            Attribute::Name => true,
            Attribute::Arn => !matches!(
                self,
                ResourceKind::LaunchTemplate | ResourceKind::Pipeline
            ),
            Attribute::Uri => matches!(self, ResourceKind::Registry | ResourceKind::Source),
            Attribute::Endpoint => *self == ResourceKind::Cluster,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown resource kind '{s}'"))
    }
}

/// Reference to a declared resource, written `kind:name` in declarations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

impl FromStr for ResourceRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = s
            .split_once(':')
            .ok_or_else(|| format!("resource reference '{s}' must look like 'kind:name'"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(format!("resource reference '{s}' has an empty name"));
        }
        Ok(Self::new(kind.trim().parse()?, name))
    }
}

impl TryFrom<String> for ResourceRef {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceRef> for String {
    fn from(value: ResourceRef) -> Self {
        value.to_string()
    }
}

/// Resource scope of a policy statement: `*` or a declared resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PolicyResource {
    Any,
    Resource(ResourceRef),
}

impl fmt::Display for PolicyResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyResource::Any => f.write_str("*"),
            PolicyResource::Resource(target) => target.fmt(f),
        }
    }
}

impl TryFrom<String> for PolicyResource {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.trim() == "*" {
            Ok(PolicyResource::Any)
        } else {
            value.parse().map(PolicyResource::Resource)
        }
    }
}

impl From<PolicyResource> for String {
    fn from(value: PolicyResource) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    #[default]
    Name,
    Arn,
    Uri,
    Endpoint,
}

impl Attribute {
    pub fn is_default(&self) -> bool {
        *self == Attribute::Name
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Attribute::Name => "name",
            Attribute::Arn => "arn",
            Attribute::Uri => "uri",
            Attribute::Endpoint => "endpoint",
        };
        f.write_str(label)
    }
}

/// A resource attribute: `{ ref: registry:app, attribute: uri }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeRef {
    #[serde(rename = "ref")]
    pub target: ResourceRef,
    #[serde(default, skip_serializing_if = "Attribute::is_default")]
    pub attribute: Attribute,
}

impl AttributeRef {
    pub fn new(target: ResourceRef, attribute: Attribute) -> Self {
        Self { target, attribute }
    }
}

/// Who may assume a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Principal {
    AccountRoot,
    Service(String),
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::AccountRoot => f.write_str("account-root"),
            Principal::Service(service) => write!(f, "service:{service}"),
        }
    }
}

impl TryFrom<String> for Principal {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim();
        if value == "account-root" {
            return Ok(Principal::AccountRoot);
        }
        match value.strip_prefix("service:") {
            Some(service) if !service.trim().is_empty() => {
                Ok(Principal::Service(service.trim().to_string()))
            }
            _ => Err(format!(
                "principal '{value}' must be 'account-root' or 'service:<name>'"
            )),
        }
    }
}

impl From<Principal> for String {
    fn from(value: Principal) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub vpc_id: String,
    /// Empty means the subnets are supplied as a template parameter.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnet_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointAccess {
    Private,
    Public,
    PublicAndPrivate,
}

impl EndpointAccess {
    pub fn private_access(&self) -> bool {
        matches!(
            self,
            EndpointAccess::Private | EndpointAccess::PublicAndPrivate
        )
    }

    pub fn public_access(&self) -> bool {
        matches!(
            self,
            EndpointAccess::Public | EndpointAccess::PublicAndPrivate
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlPlaneLog {
    Api,
    Audit,
    Authenticator,
    ControllerManager,
    Scheduler,
}

impl ControlPlaneLog {
    pub fn provider_name(&self) -> &'static str {
        match self {
            ControlPlaneLog::Api => "api",
            ControlPlaneLog::Audit => "audit",
            ControlPlaneLog::Authenticator => "authenticator",
            ControlPlaneLog::ControllerManager => "controllerManager",
            ControlPlaneLog::Scheduler => "scheduler",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub version: String,
    pub endpoint_access: EndpointAccess,
    /// Role mapped to cluster administrators at creation.
    pub masters_role: String,
    /// Additional roles granted cluster-admin access (e.g. the deploy job role).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub admin_roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logging: Vec<ControlPlaneLog>,
}

impl Cluster {
    /// `(major, minor)` parsed from a `1.21`-style version.
    pub fn minor_version(&self) -> Option<(u32, u32)> {
        parse_minor_version(&self.version)
    }
}

/// Parses the leading `major.minor` of a dotted version string.
pub fn parse_minor_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.trim().trim_start_matches('v').split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instance_types: Vec<String>,
    pub min_size: u32,
    pub max_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_template: Option<String>,
}

impl NodePool {
    pub fn desired(&self) -> u32 {
        self.desired_size.unwrap_or(self.min_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpTokens {
    Required,
    Optional,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataOptions {
    pub http_tokens: HttpTokens,
    pub hop_limit: u32,
}

impl Default for MetadataOptions {
    // Provider defaults when a template says nothing.
    fn default() -> Self {
        Self {
            http_tokens: HttpTokens::Optional,
            hop_limit: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchTemplate {
    pub name: String,
    pub image_id: String,
    pub instance_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub boot_commands: Vec<String>,
    #[serde(default)]
    pub metadata: MetadataOptions,
}

impl LaunchTemplate {
    /// Boot script handed to the instance as user data.
    pub fn user_data(&self) -> String {
        let mut script = String::from("#!/bin/bash\n");
        for command in &self.boot_commands {
            script.push_str(command);
            script.push('\n');
        }
        script
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryEncryption {
    Aes256,
    Kms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagMutability {
    Mutable,
    Immutable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    pub name: String,
    pub encryption: RegistryEncryption,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
    pub tag_mutability: TagMutability,
    pub scan_on_push: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRepo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_rotation() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionKey {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_rotation")]
    pub rotation: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStatement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    pub actions: Vec<String>,
    pub resources: Vec<PolicyResource>,
}

impl PolicyStatement {
    pub fn allows(&self, action: &str, resource: &PolicyResource) -> bool {
        self.actions
            .iter()
            .any(|pattern| action_matches(pattern, action))
            && self
                .resources
                .iter()
                .any(|granted| *granted == PolicyResource::Any || granted == resource)
    }
}

/// IAM-style action match: exact (case-insensitive) or trailing `*` wildcard.
pub fn action_matches(pattern: &str, action: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => action
            .to_ascii_lowercase()
            .starts_with(&prefix.to_ascii_lowercase()),
        None => pattern.eq_ignore_ascii_case(action),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub assumed_by: Principal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// AWS managed policy names, e.g. `SecretsManagerReadWrite`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_policies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statements: Vec<PolicyStatement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PseudoParameter {
    Region,
    AccountId,
    Partition,
}

impl PseudoParameter {
    pub fn provider_name(&self) -> &'static str {
        match self {
            PseudoParameter::Region => "AWS::Region",
            PseudoParameter::AccountId => "AWS::AccountId",
            PseudoParameter::Partition => "AWS::Partition",
        }
    }
}

/// Value of a job environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Literal(String),
    Reference(AttributeRef),
    Parameter { parameter: String },
    Pseudo { pseudo: PseudoParameter },
}

impl EnvValue {
    pub fn literal(value: impl Into<String>) -> Self {
        EnvValue::Literal(value.into())
    }

    pub fn reference(kind: ResourceKind, name: &str, attribute: Attribute) -> Self {
        EnvValue::Reference(AttributeRef::new(ResourceRef::new(kind, name), attribute))
    }

    pub fn parameter(name: impl Into<String>) -> Self {
        EnvValue::Parameter {
            parameter: name.into(),
        }
    }

    pub fn pseudo(pseudo: PseudoParameter) -> Self {
        EnvValue::Pseudo { pseudo }
    }
}

/// Named export published once the stack is provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub export: String,
    pub value: AttributeRef,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_refs_parse_and_render() {
        let parsed: ResourceRef = "registry:devsecops-repo-ecr".parse().unwrap();
        assert_eq!(parsed.kind, ResourceKind::Registry);
        assert_eq!(parsed.name, "devsecops-repo-ecr");
        assert_eq!(parsed.to_string(), "registry:devsecops-repo-ecr");

        assert!("devsecops".parse::<ResourceRef>().is_err());
        assert!("bucket:x".parse::<ResourceRef>().is_err());
        assert!("secret:".parse::<ResourceRef>().is_err());
    }

    #[test]
    fn statement_wildcards_match_actions() {
        let statement = PolicyStatement {
            sid: None,
            actions: vec!["ecr:Batch*".into(), "eks:DescribeCluster".into()],
            resources: vec![PolicyResource::Resource(ResourceRef::new(
                ResourceKind::Registry,
                "app",
            ))],
        };
        let registry = PolicyResource::Resource(ResourceRef::new(ResourceKind::Registry, "app"));
        assert!(statement.allows("ecr:BatchGetImage", &registry));
        assert!(!statement.allows("ecr:PutImage", &registry));
        assert!(!statement.allows("ecr:BatchGetImage", &PolicyResource::Any));
    }

    #[test]
    fn env_values_deserialize_from_each_shape() {
        let yaml = r#"
LITERAL: app-latest
URI:
  ref: registry:app
  attribute: uri
NAME:
  ref: cluster:eks
PARAM:
  parameter: KubectlRelease
REGION:
  pseudo: region
"#;
        let values: std::collections::BTreeMap<String, EnvValue> =
            serde_yaml::from_str(yaml).unwrap();
        assert_eq!(values["LITERAL"], EnvValue::literal("app-latest"));
        assert_eq!(
            values["URI"],
            EnvValue::reference(ResourceKind::Registry, "app", Attribute::Uri)
        );
        assert_eq!(
            values["NAME"],
            EnvValue::reference(ResourceKind::Cluster, "eks", Attribute::Name)
        );
        assert_eq!(values["PARAM"], EnvValue::parameter("KubectlRelease"));
        assert_eq!(
            values["REGION"],
            EnvValue::pseudo(PseudoParameter::Region)
        );
    }

    #[test]
    fn minor_versions_parse() {
        assert_eq!(parse_minor_version("1.21"), Some((1, 21)));
        assert_eq!(parse_minor_version("v1.18.9"), Some((1, 18)));
        assert_eq!(parse_minor_version("latest"), None);
    }
}
