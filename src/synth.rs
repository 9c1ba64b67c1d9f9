//! Declaration to resource graph.
//!
//! The graph is rendered as a CloudFormation-style JSON template. Maps are
//! ordered, so rendering the same declaration always yields the same bytes.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::declaration::StackDeclaration;
use crate::error::{StackError, StackResult};
use crate::jobs::BuildJob;
use crate::pipeline::ActionSpec;
use crate::resources::{
    Attribute, AttributeRef, EndpointAccess, EnvValue, HttpTokens, PolicyResource,
    PolicyStatement, Principal, RegistryEncryption, ResourceKind, ResourceRef, Role,
    TagMutability,
};

pub const TEMPLATE_FORMAT_VERSION: &str = "2010-09-09";
pub const SUBNETS_PARAMETER: &str = "SubnetIds";

const POLICY_VERSION: &str = "2012-10-17";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Resource {
    #[serde(rename = "Type")]
    pub resource_type: String,
    pub properties: Value,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<String>,
}

impl Resource {
    pub fn new(resource_type: &str, properties: Value) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            properties,
            depends_on: BTreeSet::new(),
            deletion_policy: None,
        }
    }

    fn after(mut self, id: impl Into<String>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    fn retained(mut self) -> Self {
        self.deletion_policy = Some("Retain".to_string());
        self
    }

    /// Logical ids named by `Ref`, `Fn::GetAtt` and `Fn::Sub` in the properties.
    pub fn references(&self) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        collect_references(&self.properties, &mut found);
        found
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TemplateParameter {
    #[serde(rename = "Type")]
    pub parameter_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TemplateOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub value: Value,
    pub export: ExportName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExportName {
    pub name: String,
}

/// Resources keyed by logical id, plus template parameters and outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGraph {
    pub description: Option<String>,
    pub parameters: BTreeMap<String, TemplateParameter>,
    pub resources: BTreeMap<String, Resource>,
    pub outputs: BTreeMap<String, TemplateOutput>,
}

impl ResourceGraph {
    pub fn insert(&mut self, id: impl Into<String>, resource: Resource) -> StackResult<()> {
        let id = id.into();
        if self.resources.contains_key(&id) || self.parameters.contains_key(&id) {
            return Err(StackError::DuplicateLogicalId(id));
        }
        self.resources.insert(id, resource);
        Ok(())
    }

    fn insert_parameter(&mut self, id: String, parameter: TemplateParameter) -> StackResult<()> {
        if self.resources.contains_key(&id) || self.parameters.contains_key(&id) {
            return Err(StackError::DuplicateLogicalId(id));
        }
        self.parameters.insert(id, parameter);
        Ok(())
    }

    /// Resources `id` must wait for.
    pub fn dependencies(&self, id: &str) -> BTreeSet<String> {
        let Some(resource) = self.resources.get(id) else {
            return BTreeSet::new();
        };
        resource
            .references()
            .into_iter()
            .chain(resource.depends_on.iter().cloned())
            .filter(|target| target != id && self.resources.contains_key(target))
            .collect()
    }

    /// Every `Ref`, `GetAtt` and `DependsOn` target must be a resource, a
    /// parameter or a pseudo parameter.
    pub fn check_references(&self) -> StackResult<()> {
        let known = |target: &str| {
            target.starts_with("AWS::")
                || self.resources.contains_key(target)
                || self.parameters.contains_key(target)
        };
        for (id, resource) in &self.resources {
            let explicit = resource
                .depends_on
                .iter()
                .find(|target| !self.resources.contains_key(target.as_str()));
            if let Some(target) = explicit {
                return Err(StackError::UnknownReference {
                    from: id.clone(),
                    target: target.clone(),
                });
            }
            if let Some(target) = resource.references().into_iter().find(|target| !known(target.as_str())) {
                return Err(StackError::UnknownReference {
                    from: id.clone(),
                    target,
                });
            }
        }
        for (id, output) in &self.outputs {
            let mut found = BTreeSet::new();
            collect_references(&output.value, &mut found);
            if let Some(target) = found.into_iter().find(|target| !known(target.as_str())) {
                return Err(StackError::UnknownReference {
                    from: id.clone(),
                    target,
                });
            }
        }
        Ok(())
    }

    /// Topological order of the resources. Ties break by logical id so the
    /// order is stable.
    pub fn creation_order(&self) -> StackResult<Vec<String>> {
        let mut remaining: BTreeMap<&str, BTreeSet<String>> = self
            .resources
            .keys()
            .map(|id| (id.as_str(), self.dependencies(id)))
            .collect();
        let mut order = Vec::with_capacity(remaining.len());

        loop {
            let ready: Vec<String> = remaining
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(id, _)| id.to_string())
                .collect();
            let Some(next) = ready.into_iter().next() else {
                break;
            };
            remaining.remove(next.as_str());
            for deps in remaining.values_mut() {
                deps.remove(&next);
            }
            order.push(next);
        }

        if !remaining.is_empty() {
            return Err(StackError::DependencyCycle(
                remaining.keys().map(|id| id.to_string()).collect(),
            ));
        }
        Ok(order)
    }

    pub fn to_template(&self) -> Value {
        let mut template = serde_json::Map::new();
        template.insert(
            "AWSTemplateFormatVersion".into(),
            Value::String(TEMPLATE_FORMAT_VERSION.into()),
        );
        if let Some(description) = &self.description {
            template.insert("Description".into(), Value::String(description.clone()));
        }
        if !self.parameters.is_empty() {
            template.insert("Parameters".into(), json!(self.parameters));
        }
        template.insert("Resources".into(), json!(self.resources));
        if !self.outputs.is_empty() {
            template.insert("Outputs".into(), json!(self.outputs));
        }
        Value::Object(template)
    }

    pub fn render(&self) -> String {
        // Serializing a Value into a String cannot fail.
        serde_json::to_string_pretty(&self.to_template()).unwrap_or_default()
    }

    /// SHA-256 of the rendered template.
    pub fn digest(&self) -> String {
        sha256_hex(self.render().as_bytes())
    }

    /// SHA-256 per resource, keyed by logical id.
    pub fn fingerprints(&self) -> BTreeMap<String, String> {
        self.resources
            .iter()
            .map(|(id, resource)| {
                let bytes = serde_json::to_vec(resource).unwrap_or_default();
                (id.clone(), sha256_hex(&bytes))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl GraphDiff {
    pub fn between(
        before: &BTreeMap<String, String>,
        after: &BTreeMap<String, String>,
    ) -> Self {
        let mut diff = GraphDiff::default();
        for (id, fingerprint) in after {
            match before.get(id) {
                None => diff.added.push(id.clone()),
                Some(previous) if previous != fingerprint => diff.changed.push(id.clone()),
                Some(_) => {}
            }
        }
        diff.removed = before
            .keys()
            .filter(|id| !after.contains_key(*id))
            .cloned()
            .collect();
        diff
    }

    pub fn of_graphs(before: &ResourceGraph, after: &ResourceGraph) -> Self {
        Self::between(&before.fingerprints(), &after.fingerprints())
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn collect_references(value: &Value, found: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(target)) = map.get("Ref") {
                found.insert(target.clone());
            }
            if let Some(Value::Array(parts)) = map.get("Fn::GetAtt")
                && let Some(Value::String(target)) = parts.first()
            {
                found.insert(target.clone());
            }
            if let Some(Value::String(template)) = map.get("Fn::Sub") {
                found.extend(sub_variables(template));
            }
            for nested in map.values() {
                collect_references(nested, found);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references(item, found);
            }
        }
        _ => {}
    }
}

/// `${Name}` and `${Name.Attr}` placeholders of an `Fn::Sub` string.
fn sub_variables(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        rest = &rest[start + 2..];
        let Some(end) = rest.find('}') else { break };
        let inner = &rest[..end];
        if !inner.starts_with('!') {
            let name = inner.split('.').next().unwrap_or(inner);
            names.push(name.to_string());
        }
        rest = &rest[end + 1..];
    }
    names
}

/// Logical id for a declared resource: PascalCase name plus a kind suffix.
pub fn logical_id(kind: ResourceKind, name: &str) -> String {
    let base = pascal_case(name);
    let suffix = match kind {
        ResourceKind::Cluster => "Cluster",
        ResourceKind::NodePool => "Nodegroup",
        ResourceKind::LaunchTemplate => "LaunchTemplate",
        ResourceKind::Registry => "Registry",
        ResourceKind::Source => "Repository",
        ResourceKind::Key => "Key",
        ResourceKind::Role => "Role",
        ResourceKind::Secret => "Secret",
        ResourceKind::Job => "Project",
        ResourceKind::Pipeline => "Pipeline",
    };
    if base.ends_with(suffix) {
        base
    } else {
        format!("{base}{suffix}")
    }
}

fn pascal_case(name: &str) -> String {
    name.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

/// Alphanumeric-only id for parameters and outputs.
pub fn sanitize_id(id: &str) -> String {
    id.chars().filter(char::is_ascii_alphanumeric).collect()
}

fn reference(id: &str) -> Value {
    json!({ "Ref": id })
}

fn get_att(id: &str, attribute: &str) -> Value {
    json!({ "Fn::GetAtt": [id, attribute] })
}

fn sub(template: String) -> Value {
    json!({ "Fn::Sub": template })
}

fn managed_policy_arn(name: &str) -> Value {
    sub(format!("arn:${{AWS::Partition}}:iam::aws:policy/{name}"))
}

fn account_root() -> Value {
    sub("arn:${AWS::Partition}:iam::${AWS::AccountId}:root".to_string())
}

fn policy_document(statements: Vec<Value>) -> Value {
    json!({ "Version": POLICY_VERSION, "Statement": statements })
}

fn allow(sid: Option<&str>, actions: &[&str], resources: Vec<Value>) -> Value {
    let mut statement = json!({
        "Effect": "Allow",
        "Action": actions,
        "Resource": resources,
    });
    if let Some(sid) = sid {
        statement["Sid"] = Value::String(sid.to_string());
    }
    statement
}

fn service_role(service: &str, managed: &[&str]) -> Resource {
    Resource::new(
        "AWS::IAM::Role",
        json!({
            "AssumeRolePolicyDocument": policy_document(vec![json!({
                "Action": "sts:AssumeRole",
                "Effect": "Allow",
                "Principal": { "Service": service },
            })]),
            "ManagedPolicyArns": managed.iter().map(|name| managed_policy_arn(name)).collect::<Vec<_>>(),
        }),
    )
}

/// Builds the resource graph for a declaration.
pub fn synthesize(stack: &StackDeclaration) -> StackResult<ResourceGraph> {
    let mut synth = Synthesizer {
        stack,
        graph: ResourceGraph {
            description: stack.description.clone(),
            ..ResourceGraph::default()
        },
    };
    synth.parameters()?;
    synth.keys()?;
    synth.artifact_bucket()?;
    synth.roles()?;
    synth.cluster()?;
    synth.launch_templates()?;
    synth.node_pools()?;
    synth.registry()?;
    synth.source()?;
    synth.jobs()?;
    synth.pipeline()?;
    synth.outputs()?;

    synth.graph.check_references()?;
    synth.graph.creation_order()?;
    Ok(synth.graph)
}

struct Synthesizer<'a> {
    stack: &'a StackDeclaration,
    graph: ResourceGraph,
}

impl Synthesizer<'_> {
    fn cluster_id(&self) -> String {
        logical_id(ResourceKind::Cluster, &self.stack.cluster.name)
    }

    fn pipeline_id(&self) -> String {
        logical_id(ResourceKind::Pipeline, &self.stack.pipeline.name)
    }

    fn bucket_id(&self) -> String {
        format!("{}ArtifactsBucket", self.pipeline_id())
    }

    fn node_role_id(&self) -> String {
        format!("{}NodeRole", self.cluster_id())
    }

    fn subnets(&self) -> Value {
        if self.stack.network.subnet_ids.is_empty() {
            reference(SUBNETS_PARAMETER)
        } else {
            json!(self.stack.network.subnet_ids)
        }
    }

    fn declared_id(&self, target: &ResourceRef, from: &str) -> StackResult<String> {
        if !self.stack.contains(target) {
            return Err(StackError::UnknownReference {
                from: from.to_string(),
                target: target.to_string(),
            });
        }
        Ok(logical_id(target.kind, &target.name))
    }

    /// Template expression for a resource attribute.
    fn attribute(&self, attr: &AttributeRef, from: &str) -> StackResult<Value> {
        let target = &attr.target;
        let id = self.declared_id(target, from)?;
        if !target.kind.supports(attr.attribute) {
            return Err(StackError::UnsupportedAttribute {
                target: target.clone(),
                attribute: attr.attribute,
            });
        }
        let name = target.name.as_str();
        let value = match (target.kind, attr.attribute) {
            // Secrets are managed outside the stack and looked up by name.
            (ResourceKind::Secret, Attribute::Name) => Value::String(name.to_string()),
            (ResourceKind::Secret, _) => sub(format!(
                "arn:${{AWS::Partition}}:secretsmanager:${{AWS::Region}}:${{AWS::AccountId}}:secret:{name}-??????"
            )),
            (ResourceKind::NodePool, Attribute::Name) => get_att(&id, "NodegroupName"),
            (ResourceKind::Source, Attribute::Name) => get_att(&id, "Name"),
            (ResourceKind::Source, Attribute::Uri) => get_att(&id, "CloneUrlHttp"),
            (ResourceKind::Registry, Attribute::Uri) => get_att(&id, "RepositoryUri"),
            (ResourceKind::Cluster, Attribute::Endpoint) => get_att(&id, "Endpoint"),
            (_, Attribute::Name) => reference(&id),
            (_, Attribute::Arn) => get_att(&id, "Arn"),
            (_, attribute) => {
                return Err(StackError::UnsupportedAttribute {
                    target: target.clone(),
                    attribute,
                });
            }
        };
        Ok(value)
    }

    fn arn_of(&self, kind: ResourceKind, name: &str, from: &str) -> StackResult<Value> {
        self.attribute(
            &AttributeRef::new(ResourceRef::new(kind, name), Attribute::Arn),
            from,
        )
    }

    fn env_value(&self, value: &EnvValue, from: &str) -> StackResult<Value> {
        match value {
            EnvValue::Literal(literal) => Ok(Value::String(literal.clone())),
            EnvValue::Reference(reference) => self.attribute(reference, from),
            EnvValue::Parameter { parameter } => {
                if self.stack.parameter(parameter).is_none() {
                    return Err(StackError::UnknownReference {
                        from: from.to_string(),
                        target: format!("parameter:{parameter}"),
                    });
                }
                Ok(reference(&sanitize_id(parameter)))
            }
            EnvValue::Pseudo { pseudo } => Ok(reference(pseudo.provider_name())),
        }
    }

    fn statement(&self, statement: &PolicyStatement, from: &str) -> StackResult<Value> {
        let resources = statement
            .resources
            .iter()
            .map(|resource| match resource {
                PolicyResource::Any => Ok(Value::String("*".to_string())),
                PolicyResource::Resource(target) => {
                    self.arn_of(target.kind, &target.name, from)
                }
            })
            .collect::<StackResult<Vec<_>>>()?;
        let actions: Vec<&str> = statement.actions.iter().map(String::as_str).collect();
        Ok(allow(statement.sid.as_deref(), &actions, resources))
    }

    fn parameters(&mut self) -> StackResult<()> {
        for parameter in &self.stack.parameters {
            self.graph.insert_parameter(
                sanitize_id(&parameter.name),
                TemplateParameter {
                    parameter_type: "String".to_string(),
                    description: parameter.description.clone(),
                    default: parameter.default.clone(),
                },
            )?;
        }
        if self.stack.network.subnet_ids.is_empty() {
            self.graph.insert_parameter(
                SUBNETS_PARAMETER.to_string(),
                TemplateParameter {
                    parameter_type: "List<AWS::EC2::Subnet::Id>".to_string(),
                    description: Some(format!(
                        "Subnets of {} used by the cluster and its node groups",
                        self.stack.network.vpc_id
                    )),
                    default: None,
                },
            )?;
        }
        Ok(())
    }

    fn keys(&mut self) -> StackResult<()> {
        for key in &self.stack.keys {
            let mut properties = json!({
                "EnableKeyRotation": key.rotation,
                "KeyPolicy": policy_document(vec![json!({
                    "Action": "kms:*",
                    "Effect": "Allow",
                    "Principal": { "AWS": account_root() },
                    "Resource": "*",
                })]),
            });
            if let Some(description) = &key.description {
                properties["Description"] = Value::String(description.clone());
            }
            self.graph.insert(
                logical_id(ResourceKind::Key, &key.name),
                Resource::new("AWS::KMS::Key", properties).retained(),
            )?;
        }
        Ok(())
    }

    fn artifact_bucket(&mut self) -> StackResult<()> {
        let pipeline = &self.stack.pipeline;
        let from = self.bucket_id();
        let encryption = match &pipeline.artifact_key {
            Some(key) => json!({
                "SSEAlgorithm": "aws:kms",
                "KMSMasterKeyID": self.arn_of(ResourceKind::Key, key, &from)?,
            }),
            None => json!({ "SSEAlgorithm": "AES256" }),
        };
        let bucket = Resource::new(
            "AWS::S3::Bucket",
            json!({
                "BucketEncryption": {
                    "ServerSideEncryptionConfiguration": [
                        { "ServerSideEncryptionByDefault": encryption }
                    ]
                },
                "PublicAccessBlockConfiguration": {
                    "BlockPublicAcls": true,
                    "BlockPublicPolicy": true,
                    "IgnorePublicAcls": true,
                    "RestrictPublicBuckets": true,
                },
            }),
        )
        .retained();
        self.graph.insert(from, bucket)
    }

    fn roles(&mut self) -> StackResult<()> {
        for role in &self.stack.roles {
            let id = logical_id(ResourceKind::Role, &role.name);
            let resource = self.role_resource(role);
            self.graph.insert(id.clone(), resource)?;

            let mut statements = role
                .statements
                .iter()
                .map(|statement| self.statement(statement, &id))
                .collect::<StackResult<Vec<_>>>()?;
            statements.extend(self.build_baseline(role, &id)?);
            if statements.is_empty() {
                continue;
            }
            let policy_id = format!("{id}DefaultPolicy");
            let policy = Resource::new(
                "AWS::IAM::Policy",
                json!({
                    "PolicyName": policy_id,
                    "PolicyDocument": policy_document(statements),
                    "Roles": [reference(&id)],
                }),
            );
            self.graph.insert(policy_id, policy)?;
        }
        Ok(())
    }

    fn role_resource(&self, role: &Role) -> Resource {
        let principal = match &role.assumed_by {
            Principal::AccountRoot => json!({ "AWS": account_root() }),
            Principal::Service(service) => json!({ "Service": service }),
        };
        let mut properties = json!({
            "RoleName": role.name,
            "AssumeRolePolicyDocument": policy_document(vec![json!({
                "Action": "sts:AssumeRole",
                "Effect": "Allow",
                "Principal": principal,
            })]),
        });
        if let Some(description) = &role.description {
            properties["Description"] = Value::String(description.clone());
        }
        if !role.managed_policies.is_empty() {
            properties["ManagedPolicyArns"] = Value::Array(
                role.managed_policies
                    .iter()
                    .map(|name| managed_policy_arn(name))
                    .collect(),
            );
        }
        Resource::new("AWS::IAM::Role", properties)
    }

    /// Log, artifact and key access every build project needs from its role.
    fn build_baseline(&self, role: &Role, from: &str) -> StackResult<Vec<Value>> {
        let jobs: Vec<&BuildJob> = self.stack.jobs_for_role(&role.name).collect();
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let log_groups = jobs
            .iter()
            .flat_map(|job| {
                let group = format!(
                    "arn:${{AWS::Partition}}:logs:${{AWS::Region}}:${{AWS::AccountId}}:log-group:/aws/codebuild/{}",
                    job.name
                );
                [sub(group.clone()), sub(format!("{group}:*"))]
            })
            .collect();
        let bucket = self.bucket_id();
        let mut statements = vec![
            allow(
                Some("BuildLogs"),
                &["logs:CreateLogGroup", "logs:CreateLogStream", "logs:PutLogEvents"],
                log_groups,
            ),
            allow(
                Some("BuildArtifacts"),
                &[
                    "s3:GetBucketLocation",
                    "s3:GetObject",
                    "s3:GetObjectVersion",
                    "s3:PutObject",
                ],
                vec![
                    get_att(&bucket, "Arn"),
                    sub(format!("${{{bucket}.Arn}}/*")),
                ],
            ),
        ];

        let keys: BTreeSet<&str> = jobs
            .iter()
            .filter_map(|job| job.encryption_key.as_deref())
            .chain(self.stack.pipeline.artifact_key.as_deref())
            .collect();
        if !keys.is_empty() {
            let arns = keys
                .into_iter()
                .map(|key| self.arn_of(ResourceKind::Key, key, from))
                .collect::<StackResult<Vec<_>>>()?;
            statements.push(allow(
                Some("BuildEncryption"),
                &["kms:Decrypt", "kms:Encrypt", "kms:GenerateDataKey*", "kms:ReEncrypt*"],
                arns,
            ));
        }
        Ok(statements)
    }

    fn cluster(&mut self) -> StackResult<()> {
        let cluster = &self.stack.cluster;
        let id = self.cluster_id();
        let service_role_id = format!("{id}ServiceRole");
        self.graph.insert(
            service_role_id.clone(),
            service_role("eks.amazonaws.com", &["AmazonEKSClusterPolicy"]),
        )?;

        let mut properties = json!({
            "Name": cluster.name,
            "Version": cluster.version,
            "RoleArn": get_att(&service_role_id, "Arn"),
            "ResourcesVpcConfig": {
                "SubnetIds": self.subnets(),
                "EndpointPrivateAccess": cluster.endpoint_access.private_access(),
                "EndpointPublicAccess": cluster.endpoint_access.public_access(),
            },
            "AccessConfig": { "AuthenticationMode": "API_AND_CONFIG_MAP" },
        });
        if !cluster.logging.is_empty() {
            let mut types: Vec<&str> = cluster.logging.iter().map(|log| log.provider_name()).collect();
            types.sort_unstable();
            types.dedup();
            properties["Logging"] = json!({
                "ClusterLogging": {
                    "EnabledTypes": types.iter().map(|kind| json!({ "Type": kind })).collect::<Vec<_>>(),
                }
            });
        }
        if cluster.endpoint_access == EndpointAccess::Public {
            properties["ResourcesVpcConfig"]["PublicAccessCidrs"] = json!(["0.0.0.0/0"]);
        }
        self.graph.insert(id.clone(), Resource::new("AWS::EKS::Cluster", properties))?;

        let admins = std::iter::once(&cluster.masters_role).chain(cluster.admin_roles.iter());
        let mut seen = BTreeSet::new();
        for role in admins {
            if !seen.insert(role.as_str()) {
                continue;
            }
            let role_id = self.declared_id(&ResourceRef::new(ResourceKind::Role, role.as_str()), &id)?;
            let entry = Resource::new(
                "AWS::EKS::AccessEntry",
                json!({
                    "ClusterName": reference(&id),
                    "PrincipalArn": get_att(&role_id, "Arn"),
                    "AccessPolicies": [{
                        "PolicyArn": sub("arn:${AWS::Partition}:eks::aws:cluster-access-policy/AmazonEKSClusterAdminPolicy".to_string()),
                        "AccessScope": { "Type": "cluster" },
                    }],
                }),
            );
            self.graph.insert(format!("{id}{role_id}AccessEntry"), entry)?;
        }

        if !self.stack.node_pools.is_empty() {
            let node_role_id = self.node_role_id();
            self.graph.insert(
                node_role_id,
                service_role(
                    "ec2.amazonaws.com",
                    &[
                        "AmazonEKSWorkerNodePolicy",
                        "AmazonEKS_CNI_Policy",
                        "AmazonEC2ContainerRegistryReadOnly",
                    ],
                ),
            )?;
        }
        Ok(())
    }

    fn launch_templates(&mut self) -> StackResult<()> {
        for template in &self.stack.launch_templates {
            let http_tokens = match template.metadata.http_tokens {
                HttpTokens::Required => "required",
                HttpTokens::Optional => "optional",
            };
            let resource = Resource::new(
                "AWS::EC2::LaunchTemplate",
                json!({
                    "LaunchTemplateName": template.name,
                    "LaunchTemplateData": {
                        "ImageId": template.image_id,
                        "InstanceType": template.instance_type,
                        "UserData": { "Fn::Base64": template.user_data() },
                        "MetadataOptions": {
                            "HttpTokens": http_tokens,
                            "HttpPutResponseHopLimit": template.metadata.hop_limit,
                        },
                    },
                }),
            );
            self.graph
                .insert(logical_id(ResourceKind::LaunchTemplate, &template.name), resource)?;
        }
        Ok(())
    }

    fn node_pools(&mut self) -> StackResult<()> {
        let cluster_id = self.cluster_id();
        let node_role_id = self.node_role_id();
        for pool in &self.stack.node_pools {
            let id = logical_id(ResourceKind::NodePool, &pool.name);
            let mut properties = json!({
                "ClusterName": reference(&cluster_id),
                "NodegroupName": pool.name,
                "NodeRole": get_att(&node_role_id, "Arn"),
                "Subnets": self.subnets(),
                "ScalingConfig": {
                    "MinSize": pool.min_size,
                    "MaxSize": pool.max_size,
                    "DesiredSize": pool.desired(),
                },
            });
            if !pool.instance_types.is_empty() {
                properties["InstanceTypes"] = json!(pool.instance_types);
            }
            if let Some(template) = &pool.launch_template {
                let template_id = self.declared_id(
                    &ResourceRef::new(ResourceKind::LaunchTemplate, template.as_str()),
                    &id,
                )?;
                properties["LaunchTemplate"] = json!({
                    "Id": reference(&template_id),
                    "Version": get_att(&template_id, "LatestVersionNumber"),
                });
            }
            self.graph
                .insert(id, Resource::new("AWS::EKS::Nodegroup", properties))?;
        }
        Ok(())
    }

    fn registry(&mut self) -> StackResult<()> {
        let registry = &self.stack.registry;
        let id = logical_id(ResourceKind::Registry, &registry.name);
        let mut encryption = json!({
            "EncryptionType": match registry.encryption {
                RegistryEncryption::Aes256 => "AES256",
                RegistryEncryption::Kms => "KMS",
            }
        });
        let mut key_id = None;
        if registry.encryption == RegistryEncryption::Kms
            && let Some(key) = &registry.encryption_key
        {
            encryption["KmsKey"] = self.arn_of(ResourceKind::Key, key, &id)?;
            key_id = Some(logical_id(ResourceKind::Key, key));
        }
        let mut resource = Resource::new(
            "AWS::ECR::Repository",
            json!({
                "RepositoryName": registry.name,
                "ImageTagMutability": match registry.tag_mutability {
                    TagMutability::Mutable => "MUTABLE",
                    TagMutability::Immutable => "IMMUTABLE",
                },
                "ImageScanningConfiguration": { "ScanOnPush": registry.scan_on_push },
                "EncryptionConfiguration": encryption,
            }),
        )
        .retained();
        if let Some(key_id) = key_id {
            resource = resource.after(key_id);
        }
        self.graph.insert(id, resource)
    }

    fn source(&mut self) -> StackResult<()> {
        let source = &self.stack.source;
        let mut properties = json!({ "RepositoryName": source.name });
        if let Some(description) = &source.description {
            properties["RepositoryDescription"] = Value::String(description.clone());
        }
        self.graph.insert(
            logical_id(ResourceKind::Source, &source.name),
            Resource::new("AWS::CodeCommit::Repository", properties),
        )
    }

    fn jobs(&mut self) -> StackResult<()> {
        for job in &self.stack.jobs {
            let id = logical_id(ResourceKind::Job, &job.name);
            let role_id = self.declared_id(&ResourceRef::new(ResourceKind::Role, job.role.as_str()), &id)?;
            let buildspec = job.render_buildspec().map_err(|err| StackError::BuildSpec {
                job: job.name.clone(),
                message: err.to_string(),
            })?;

            let variables = job
                .environment
                .iter()
                .map(|(name, value)| {
                    Ok(json!({
                        "Name": name,
                        "Type": "PLAINTEXT",
                        "Value": self.env_value(value, &id)?,
                    }))
                })
                .collect::<StackResult<Vec<_>>>()?;
            let pull_credentials = if job.image.starts_with("aws/codebuild/") {
                "CODEBUILD"
            } else {
                "SERVICE_ROLE"
            };

            let mut properties = json!({
                "Name": job.name,
                "ServiceRole": get_att(&role_id, "Arn"),
                "Source": { "Type": "CODEPIPELINE", "BuildSpec": buildspec },
                "Artifacts": { "Type": "CODEPIPELINE" },
                "Environment": {
                    "Type": "LINUX_CONTAINER",
                    "Image": job.image,
                    "ComputeType": job.compute.provider_name(),
                    "PrivilegedMode": job.privileged,
                    "ImagePullCredentialsType": pull_credentials,
                    "EnvironmentVariables": variables,
                },
            });
            if let Some(key) = &job.encryption_key {
                properties["EncryptionKey"] = self.arn_of(ResourceKind::Key, key, &id)?;
            }

            let mut resource = Resource::new("AWS::CodeBuild::Project", properties);
            let policy_id = format!("{role_id}DefaultPolicy");
            if self.graph.resources.contains_key(&policy_id) {
                resource = resource.after(policy_id);
            }
            self.graph.insert(id, resource)?;
        }
        Ok(())
    }

    fn pipeline(&mut self) -> StackResult<()> {
        let pipeline = &self.stack.pipeline;
        let id = self.pipeline_id();
        let role_id = format!("{id}Role");
        let policy_id = format!("{role_id}DefaultPolicy");
        let bucket_id = self.bucket_id();

        let mut stages = Vec::with_capacity(pipeline.stages.len());
        let mut projects = BTreeSet::new();
        let mut repositories = BTreeSet::new();
        for stage in &pipeline.stages {
            let mut actions = Vec::with_capacity(stage.actions.len());
            for (index, action) in stage.actions.iter().enumerate() {
                let (category, provider, configuration) = match action {
                    ActionSpec::Source {
                        repository, branch, ..
                    } => {
                        let repo_id = self.declared_id(
                            &ResourceRef::new(ResourceKind::Source, repository.as_str()),
                            &id,
                        )?;
                        repositories.insert(repo_id.clone());
                        (
                            "Source",
                            "CodeCommit",
                            json!({
                                "RepositoryName": get_att(&repo_id, "Name"),
                                "BranchName": branch,
                                "PollForSourceChanges": false,
                            }),
                        )
                    }
                    ActionSpec::Build { job, .. } => {
                        let project_id = self
                            .declared_id(&ResourceRef::new(ResourceKind::Job, job.as_str()), &id)?;
                        projects.insert(project_id.clone());
                        ("Build", "CodeBuild", json!({ "ProjectName": reference(&project_id) }))
                    }
                    ActionSpec::Approval { comment, .. } => (
                        "Approval",
                        "Manual",
                        match comment {
                            Some(comment) => json!({ "CustomData": comment }),
                            None => json!({}),
                        },
                    ),
                };
                let mut entry = json!({
                    "Name": action.name(),
                    "ActionTypeId": {
                        "Category": category,
                        "Owner": "AWS",
                        "Provider": provider,
                        "Version": "1",
                    },
                    "Configuration": configuration,
                    "RunOrder": index + 1,
                });
                if let Some(input) = action.input() {
                    entry["InputArtifacts"] = json!([{ "Name": input }]);
                }
                let outputs = action.outputs();
                if !outputs.is_empty() {
                    entry["OutputArtifacts"] = Value::Array(
                        outputs.iter().map(|name| json!({ "Name": name })).collect(),
                    );
                }
                actions.push(entry);
            }
            stages.push(json!({ "Name": stage.name, "Actions": actions }));
        }

        self.graph
            .insert(role_id.clone(), service_role("codepipeline.amazonaws.com", &[]))?;

        let mut statements = vec![allow(
            Some("ArtifactStore"),
            &[
                "s3:DeleteObject*",
                "s3:GetBucket*",
                "s3:GetObject*",
                "s3:List*",
                "s3:PutObject",
            ],
            vec![
                get_att(&bucket_id, "Arn"),
                sub(format!("${{{bucket_id}.Arn}}/*")),
            ],
        )];
        if !repositories.is_empty() {
            statements.push(allow(
                Some("SourceCheckout"),
                &[
                    "codecommit:CancelUploadArchive",
                    "codecommit:GetBranch",
                    "codecommit:GetCommit",
                    "codecommit:GetUploadArchiveStatus",
                    "codecommit:UploadArchive",
                ],
                repositories.iter().map(|repo| get_att(repo, "Arn")).collect(),
            ));
        }
        if !projects.is_empty() {
            statements.push(allow(
                Some("StartBuilds"),
                &["codebuild:BatchGetBuilds", "codebuild:StartBuild", "codebuild:StopBuild"],
                projects.iter().map(|project| get_att(project, "Arn")).collect(),
            ));
        }
        let mut artifact_store = json!({ "Type": "S3", "Location": reference(&bucket_id) });
        if let Some(key) = &pipeline.artifact_key {
            let key_arn = self.arn_of(ResourceKind::Key, key, &id)?;
            statements.push(allow(
                Some("ArtifactEncryption"),
                &["kms:Decrypt", "kms:Encrypt", "kms:GenerateDataKey*", "kms:ReEncrypt*"],
                vec![key_arn.clone()],
            ));
            artifact_store["EncryptionKey"] = json!({ "Type": "KMS", "Id": key_arn });
        }
        self.graph.insert(
            policy_id.clone(),
            Resource::new(
                "AWS::IAM::Policy",
                json!({
                    "PolicyName": policy_id,
                    "PolicyDocument": policy_document(statements),
                    "Roles": [reference(&role_id)],
                }),
            ),
        )?;

        let resource = Resource::new(
            "AWS::CodePipeline::Pipeline",
            json!({
                "Name": pipeline.name,
                "RoleArn": get_att(&role_id, "Arn"),
                "ArtifactStore": artifact_store,
                "Stages": stages,
            }),
        )
        .after(policy_id);
        self.graph.insert(id, resource)
    }

    fn outputs(&mut self) -> StackResult<()> {
        for output in &self.stack.outputs {
            let id = sanitize_id(&output.id);
            if self.graph.outputs.contains_key(&id) {
                return Err(StackError::DuplicateLogicalId(id));
            }
            let value = self.attribute(&output.value, &id)?;
            self.graph.outputs.insert(
                id,
                TemplateOutput {
                    description: output.description.clone(),
                    value,
                    export: ExportName {
                        name: output.export.clone(),
                    },
                },
            );
        }
        Ok(())
    }
}
