use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::declaration::{DECLARATION_VERSION, StackDeclaration, StackEnvironment};
use crate::jobs::{BuildJob, BuildPhases, ComputeType};
use crate::pipeline::{ActionSpec, PipelineDescriptor, StageSpec};
use crate::resources::{
    Attribute, AttributeRef, Cluster, ControlPlaneLog, EncryptionKey, EndpointAccess, EnvValue,
    HttpTokens, LaunchTemplate, MetadataOptions, Network, NodePool, Output, Parameter,
    PolicyResource, PolicyStatement, Principal, PseudoParameter, Registry, RegistryEncryption,
    ResourceKind, ResourceRef, Role, SecretRef, SourceRepo, TagMutability,
};

const PRESETS: [&str; 2] = ["devsecops-eks", "minimal"];

pub fn preset_names() -> &'static [&'static str] {
    &PRESETS
}

pub fn preset(name: &str) -> Result<StackDeclaration> {
    match name {
        "devsecops-eks" => Ok(devsecops_eks()),
        "minimal" => Ok(minimal()),
        other => anyhow::bail!(
            "Unknown preset '{other}' (available: {})",
            PRESETS.join(", ")
        ),
    }
}

pub fn generate_preset(name: &str, destination: &Path) -> Result<PathBuf> {
    let stack = preset(name)?;
    let rendered = stack.to_yaml()?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write preset declaration: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}

const BUILD_IMAGE: &str = "aws/codebuild/amazonlinux2-x86_64-standard:3.0";
const SOURCE_FILES: [&str; 4] = ["kubernetes/*", "Dockerfile", "requirements.txt", "server.py"];

/// Cluster, hardened node pools, registry, source repository and the
/// six-stage scan/approve/deploy pipeline.
fn devsecops_eks() -> StackDeclaration {
    let key = "devsecops-key";
    let cluster = "eks-cluster";
    let registry = "devsecops-repo-ecr";
    let source = "devsecops-eks-cc-repository";
    let policy_scan = "cdk_security_check_checkov";
    let image_scan = "devsecops-project-eks-static-scan";
    let deploy = "devsecops-project-eks-deploy";
    let pipeline = "devsecops-project-eks-pipeline";

    StackDeclaration {
        version: DECLARATION_VERSION,
        name: "eks-devsecops-observability".into(),
        description: Some("EKS cluster with a DevSecOps release pipeline".into()),
        environment: StackEnvironment::default(),
        network: Network {
            vpc_id: "vpc-0a242262d04e29a51".into(),
            subnet_ids: Vec::new(),
        },
        parameters: vec![
            parameter(
                "KubectlRelease",
                "kubectl release path under amazon-eks, <version>/<date>",
                Some("1.21.2/2021-07-05"),
            ),
            parameter("KubectlSha256", "SHA-256 of the kubectl binary for KubectlRelease", None),
            parameter("AnchoreScanVersion", "Anchore inline scan script version", Some("v0.3.3")),
            parameter("AnchoreScanSha256", "SHA-256 of the Anchore inline scan script", None),
        ],
        keys: vec![EncryptionKey {
            name: key.into(),
            description: Some("Encrypts images, build output and pipeline artifacts".into()),
            rotation: true,
        }],
        roles: vec![
            Role {
                name: "eks-cluster-admin-role".into(),
                assumed_by: Principal::AccountRoot,
                description: Some("Cluster administrators".into()),
                managed_policies: Vec::new(),
                statements: Vec::new(),
            },
            build_role("policy-scan-role", "Policy scan builds", Vec::new()),
            build_role(
                "image-build-role",
                "Image lint, build and scan",
                vec![
                    statement(
                        "SecretsAccess",
                        &["secretsmanager:GetSecretValue"],
                        vec![
                            resource(ResourceKind::Secret, "dockerhub"),
                            resource(ResourceKind::Secret, "dockerhubtwo"),
                        ],
                    ),
                    statement(
                        "RegistryLogin",
                        &["ecr:GetAuthorizationToken"],
                        vec![PolicyResource::Any],
                    ),
                    statement(
                        "RegistryPullPush",
                        &[
                            "ecr:BatchCheckLayerAvailability",
                            "ecr:BatchGetImage",
                            "ecr:CompleteLayerUpload",
                            "ecr:GetDownloadUrlForLayer",
                            "ecr:InitiateLayerUpload",
                            "ecr:PutImage",
                            "ecr:UploadLayerPart",
                        ],
                        vec![resource(ResourceKind::Registry, registry)],
                    ),
                ],
            ),
            build_role(
                "deploy-role",
                "Cluster deployment",
                vec![statement(
                    "DescribeEKS",
                    &["eks:DescribeCluster"],
                    vec![resource(ResourceKind::Cluster, cluster)],
                )],
            ),
        ],
        secrets: vec![
            SecretRef {
                name: "dockerhub".into(),
                description: Some("Docker Hub username".into()),
            },
            SecretRef {
                name: "dockerhubtwo".into(),
                description: Some("Docker Hub password".into()),
            },
        ],
        cluster: Cluster {
            name: cluster.into(),
            version: "1.21".into(),
            endpoint_access: EndpointAccess::Private,
            masters_role: "eks-cluster-admin-role".into(),
            admin_roles: vec!["deploy-role".into()],
            logging: vec![
                ControlPlaneLog::Api,
                ControlPlaneLog::Authenticator,
                ControlPlaneLog::Scheduler,
                ControlPlaneLog::ControllerManager,
                ControlPlaneLog::Audit,
            ],
        },
        node_pools: vec![
            NodePool {
                name: "extra-ng-without-lt".into(),
                instance_types: vec!["t3.small".into()],
                min_size: 1,
                max_size: 2,
                desired_size: None,
                launch_template: None,
            },
            NodePool {
                name: "extra-ng-with-lt".into(),
                instance_types: Vec::new(),
                min_size: 1,
                max_size: 2,
                desired_size: Some(2),
                launch_template: Some("hardened-node-template".into()),
            },
        ],
        launch_templates: vec![LaunchTemplate {
            name: "hardened-node-template".into(),
            image_id: "ami-061944722678088b6".into(),
            instance_type: "t3.small".into(),
            boot_commands: vec![
                "set -o xtrace".into(),
                format!("/etc/eks/bootstrap.sh {cluster}"),
            ],
            metadata: MetadataOptions {
                http_tokens: HttpTokens::Required,
                hop_limit: 1,
            },
        }],
        registry: Registry {
            name: registry.into(),
            encryption: RegistryEncryption::Kms,
            encryption_key: Some(key.into()),
            tag_mutability: TagMutability::Mutable,
            scan_on_push: true,
        },
        source: SourceRepo {
            name: source.into(),
            description: Some(source.into()),
        },
        jobs: vec![
            BuildJob {
                name: policy_scan.into(),
                role: "policy-scan-role".into(),
                encryption_key: Some(key.into()),
                image: "bridgecrew/checkov:2.3.0".into(),
                compute: ComputeType::Small,
                privileged: false,
                environment: BTreeMap::new(),
                phases: BuildPhases {
                    build: commands(&[
                        "skip_checks=`paste -d, -s kubernetes/skip_checks.config` && checkov --framework cloudformation --skip-check $skip_checks -f cdk.out/eks-devsecops-observability.template.json",
                    ]),
                    ..Default::default()
                },
                artifacts: commands(&SOURCE_FILES),
            },
            BuildJob {
                name: image_scan.into(),
                role: "image-build-role".into(),
                encryption_key: Some(key.into()),
                image: BUILD_IMAGE.into(),
                compute: ComputeType::Small,
                privileged: true,
                environment: BTreeMap::from([
                    (
                        "ECR_REPOSITORY_URI".into(),
                        EnvValue::reference(ResourceKind::Registry, registry, Attribute::Uri),
                    ),
                    ("AWS_DEFAULT_REGION".into(), EnvValue::pseudo(PseudoParameter::Region)),
                    ("HADOLINT_IMAGE_TAG".into(), EnvValue::literal("hadolint-v2.12.0")),
                    ("IMAGE_TAG".into(), EnvValue::literal("app-latest")),
                    ("ANCHORE_SCAN_VERSION".into(), EnvValue::parameter("AnchoreScanVersion")),
                    ("ANCHORE_SCAN_SHA256".into(), EnvValue::parameter("AnchoreScanSha256")),
                ]),
                phases: BuildPhases {
                    install: commands(&[
                        concat!(
                            "export dockerhub_username=`aws secretsmanager get-secret-value --secret-id dockerhub | jq --raw-output \".SecretString\" | jq -r .username`",
                            " && export dockerhub_password=`aws secretsmanager get-secret-value --secret-id dockerhubtwo | jq --raw-output \".SecretString\" | jq -r .password`",
                            " && echo \"$dockerhub_password\" | docker login -u \"$dockerhub_username\" --password-stdin",
                        ),
                    ]),
                    build: commands(&[
                        "mkdir -p $CODEBUILD_SRC_DIR/build/",
                        "cp kubernetes/hadolint.yaml Dockerfile requirements.txt server.py $CODEBUILD_SRC_DIR/build/",
                        "aws ecr get-login-password --region $AWS_DEFAULT_REGION | docker login --username AWS --password-stdin $ECR_REPOSITORY_URI",
                        "docker pull $ECR_REPOSITORY_URI:$HADOLINT_IMAGE_TAG",
                        "cd $CODEBUILD_SRC_DIR/build && docker run --rm -i -v ${PWD}/hadolint.yaml:/.hadolint.yaml $ECR_REPOSITORY_URI:$HADOLINT_IMAGE_TAG hadolint -f json - < ./Dockerfile",
                        "docker build -f Dockerfile -t $ECR_REPOSITORY_URI:$IMAGE_TAG .",
                        "docker history --no-trunc $ECR_REPOSITORY_URI:$IMAGE_TAG",
                    ]),
                    post_build: commands(&[
                        "bash -c \"if [ \\\"$CODEBUILD_BUILD_SUCCEEDING\\\" == \\\"0\\\" ]; then exit 1; fi\"",
                        "docker push $ECR_REPOSITORY_URI:$IMAGE_TAG",
                        "curl -sSLo inline_scan.sh https://ci-tools.anchore.io/inline_scan-$ANCHORE_SCAN_VERSION",
                        "echo \"$ANCHORE_SCAN_SHA256  inline_scan.sh\" | sha256sum -c -",
                        "COMPOSE_INTERACTIVE_NO_CLI=1 bash inline_scan.sh $ECR_REPOSITORY_URI:$IMAGE_TAG",
                    ]),
                    ..Default::default()
                },
                artifacts: commands(&SOURCE_FILES),
            },
            BuildJob {
                name: deploy.into(),
                role: "deploy-role".into(),
                encryption_key: Some(key.into()),
                image: BUILD_IMAGE.into(),
                compute: ComputeType::Small,
                privileged: false,
                environment: BTreeMap::from([
                    (
                        "AWS_CLUSTER_NAME".into(),
                        EnvValue::reference(ResourceKind::Cluster, cluster, Attribute::Name),
                    ),
                    ("AWS_DEFAULT_REGION".into(), EnvValue::pseudo(PseudoParameter::Region)),
                    ("KUBECTL_RELEASE".into(), EnvValue::parameter("KubectlRelease")),
                    ("KUBECTL_SHA256".into(), EnvValue::parameter("KubectlSha256")),
                ]),
                phases: BuildPhases {
                    pre_build: commands(&[
                        "curl -sSLo kubectl https://amazon-eks.s3.us-west-2.amazonaws.com/$KUBECTL_RELEASE/bin/linux/amd64/kubectl",
                        "echo \"$KUBECTL_SHA256  kubectl\" | sha256sum -c -",
                        "install -m 0755 kubectl /usr/local/bin/kubectl",
                        "kubectl version --client",
                        "aws eks update-kubeconfig --name $AWS_CLUSTER_NAME --region $AWS_DEFAULT_REGION",
                        "kubectl get configmap aws-auth -o yaml -n kube-system",
                    ]),
                    build: commands(&[
                        "kubectl apply -f kubernetes/deployment.yaml",
                        "kubectl get pods",
                    ]),
                    ..Default::default()
                },
                artifacts: Vec::new(),
            },
        ],
        pipeline: PipelineDescriptor {
            name: pipeline.into(),
            artifact_key: Some(key.into()),
            stages: vec![
                stage(
                    "Source",
                    vec![ActionSpec::Source {
                        name: "CodeCommit_Source".into(),
                        repository: source.into(),
                        branch: "main".into(),
                        output: "SourceOutput".into(),
                    }],
                ),
                stage("Policy-Scan", vec![build("SourceOutput", policy_scan, Some("PolicyScanOutput"))]),
                stage("Approve-1", vec![approval(Some("Review the policy scan report"))]),
                stage("Build-Scan", vec![build("PolicyScanOutput", image_scan, Some("BuildOutput"))]),
                stage("Approve-2", vec![approval(Some("Approve deployment to the cluster"))]),
                stage("Deploy", vec![build("BuildOutput", deploy, None)]),
            ],
        },
        outputs: vec![
            output("EKS_Cluster_Name", "EKS Cluster", "EKSClusterName", ResourceKind::Cluster, cluster),
            output("ECRRepo", "ECR Repo", "ECRrepo", ResourceKind::Registry, registry),
            output("CodeCommitRepo", "CodeCommit repository", "CCrepo", ResourceKind::Source, source),
            output("CodePipelineName", "CodePipeline", "CPName", ResourceKind::Pipeline, pipeline),
            output("StaticScanCodeBuild", "Static scan project", "StaticScanProject", ResourceKind::Job, image_scan),
            output("EKSDeployCodeBuild", "EKS deploy project", "EKSDeployProject", ResourceKind::Job, deploy),
            output("CheckovCodeBuild", "Policy scan project", "CheckovProject", ResourceKind::Job, policy_scan),
        ],
    }
}

/// One node pool, a registry, a deploy job and source → approve → deploy.
fn minimal() -> StackDeclaration {
    let cluster = "app-cluster";
    let pipeline = "app-pipeline";

    StackDeclaration {
        version: DECLARATION_VERSION,
        name: "minimal-eks".into(),
        description: None,
        environment: StackEnvironment::default(),
        network: Network {
            vpc_id: "vpc-00000000000000000".into(),
            subnet_ids: Vec::new(),
        },
        parameters: Vec::new(),
        keys: Vec::new(),
        roles: vec![
            Role {
                name: "cluster-admin-role".into(),
                assumed_by: Principal::AccountRoot,
                description: None,
                managed_policies: Vec::new(),
                statements: Vec::new(),
            },
            build_role(
                "app-deploy-role",
                "Cluster deployment",
                vec![statement(
                    "DescribeEKS",
                    &["eks:DescribeCluster"],
                    vec![resource(ResourceKind::Cluster, cluster)],
                )],
            ),
        ],
        secrets: Vec::new(),
        cluster: Cluster {
            name: cluster.into(),
            version: "1.29".into(),
            endpoint_access: EndpointAccess::Private,
            masters_role: "cluster-admin-role".into(),
            admin_roles: vec!["app-deploy-role".into()],
            logging: vec![ControlPlaneLog::Api, ControlPlaneLog::Audit],
        },
        node_pools: vec![NodePool {
            name: "default".into(),
            instance_types: vec!["t3.medium".into()],
            min_size: 1,
            max_size: 3,
            desired_size: None,
            launch_template: None,
        }],
        launch_templates: Vec::new(),
        registry: Registry {
            name: "app".into(),
            encryption: RegistryEncryption::Aes256,
            encryption_key: None,
            tag_mutability: TagMutability::Immutable,
            scan_on_push: true,
        },
        source: SourceRepo {
            name: "app-source".into(),
            description: None,
        },
        jobs: vec![BuildJob {
            name: "app-deploy".into(),
            role: "app-deploy-role".into(),
            encryption_key: None,
            image: "aws/codebuild/amazonlinux2-x86_64-standard:5.0".into(),
            compute: ComputeType::Small,
            privileged: false,
            environment: BTreeMap::from([
                (
                    "AWS_CLUSTER_NAME".into(),
                    EnvValue::reference(ResourceKind::Cluster, cluster, Attribute::Name),
                ),
                ("AWS_DEFAULT_REGION".into(), EnvValue::pseudo(PseudoParameter::Region)),
            ]),
            phases: BuildPhases {
                pre_build: commands(&[
                    "aws eks update-kubeconfig --name $AWS_CLUSTER_NAME --region $AWS_DEFAULT_REGION",
                ]),
                build: commands(&["kubectl apply -f kubernetes/"]),
                ..Default::default()
            },
            artifacts: Vec::new(),
        }],
        pipeline: PipelineDescriptor {
            name: pipeline.into(),
            artifact_key: None,
            stages: vec![
                stage(
                    "Source",
                    vec![ActionSpec::Source {
                        name: "Checkout".into(),
                        repository: "app-source".into(),
                        branch: "main".into(),
                        output: "SourceOutput".into(),
                    }],
                ),
                stage("Approve", vec![approval(None)]),
                stage("Deploy", vec![build("SourceOutput", "app-deploy", None)]),
            ],
        },
        outputs: vec![
            output("ClusterName", "Cluster", "AppClusterName", ResourceKind::Cluster, cluster),
            output("PipelineName", "Pipeline", "AppPipelineName", ResourceKind::Pipeline, pipeline),
        ],
    }
}

fn commands(lines: &[&str]) -> Vec<String> {
    lines.iter().map(|line| line.to_string()).collect()
}

fn parameter(name: &str, description: &str, default: Option<&str>) -> Parameter {
    Parameter {
        name: name.into(),
        description: Some(description.into()),
        default: default.map(Into::into),
    }
}

fn resource(kind: ResourceKind, name: &str) -> PolicyResource {
    PolicyResource::Resource(ResourceRef::new(kind, name))
}

fn statement(sid: &str, actions: &[&str], resources: Vec<PolicyResource>) -> PolicyStatement {
    PolicyStatement {
        sid: Some(sid.into()),
        actions: commands(actions),
        resources,
    }
}

fn build_role(name: &str, description: &str, statements: Vec<PolicyStatement>) -> Role {
    Role {
        name: name.into(),
        assumed_by: Principal::Service("codebuild.amazonaws.com".into()),
        description: Some(description.into()),
        managed_policies: Vec::new(),
        statements,
    }
}

fn stage(name: &str, actions: Vec<ActionSpec>) -> StageSpec {
    StageSpec {
        name: name.into(),
        actions,
    }
}

fn build(input: &str, job: &str, output: Option<&str>) -> ActionSpec {
    ActionSpec::Build {
        name: "CodeBuild".into(),
        job: job.into(),
        input: input.into(),
        outputs: output.map(|name| vec![name.to_string()]).unwrap_or_default(),
    }
}

fn approval(comment: Option<&str>) -> ActionSpec {
    ActionSpec::Approval {
        name: "Approve".into(),
        comment: comment.map(Into::into),
    }
}

fn output(id: &str, description: &str, export: &str, kind: ResourceKind, name: &str) -> Output {
    Output {
        id: id.into(),
        description: Some(description.into()),
        export: export.into(),
        value: AttributeRef::new(ResourceRef::new(kind, name), Attribute::Name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_named_preset_builds() {
        for name in preset_names() {
            let stack = preset(name).unwrap();
            assert!(!stack.pipeline.stages.is_empty(), "{name}");
        }
        assert!(preset("nope").is_err());
    }

    #[test]
    fn reference_pipeline_has_six_stages() {
        let stack = preset("devsecops-eks").unwrap();
        let names: Vec<&str> = stack.pipeline.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            ["Source", "Policy-Scan", "Approve-1", "Build-Scan", "Approve-2", "Deploy"]
        );
        assert_eq!(stack.outputs.len(), 7);
    }
}
