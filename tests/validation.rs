use devsecops_stack::declaration::StackDeclaration;
use devsecops_stack::pipeline::ActionSpec;
use devsecops_stack::presets::preset;
use devsecops_stack::resources::{EnvValue, HttpTokens};
use devsecops_stack::validation::validate_stack;

fn reference() -> StackDeclaration {
    preset("devsecops-eks").unwrap()
}

fn has_error(stack: &StackDeclaration, needle: &str) -> bool {
    validate_stack(stack)
        .errors
        .iter()
        .any(|error| error.contains(needle))
}

#[test]
fn node_pool_bounds_are_enforced() {
    let mut stack = reference();
    stack.node_pools[1].min_size = 3;
    stack.node_pools[1].desired_size = Some(3);
    assert!(has_error(&stack, "min size 3 exceeds max size 2"));

    let mut stack = reference();
    stack.node_pools[0].min_size = 0;
    stack.node_pools[0].max_size = 0;
    assert!(has_error(&stack, "max size must be at least 1"));

    let mut stack = reference();
    stack.node_pools[1].desired_size = Some(5);
    assert!(has_error(&stack, "desired size 5 is outside 1..=2"));
}

#[test]
fn custom_image_pool_requires_session_tokens() {
    let mut stack = reference();
    stack.launch_templates[0].metadata.http_tokens = HttpTokens::Optional;
    assert!(has_error(&stack, "must require session tokens"));
}

#[test]
fn node_pool_cannot_mix_instance_types_and_template() {
    let mut stack = reference();
    stack.node_pools[1].instance_types = vec!["t3.large".into()];
    assert!(has_error(&stack, "sets instance types and a launch template"));

    let mut stack = reference();
    stack.node_pools[1].launch_template = Some("missing-template".into());
    assert!(has_error(&stack, "unknown launch template 'missing-template'"));
}

#[test]
fn stage_inputs_follow_the_carried_artifact_through_gates() {
    let mut stack = reference();
    if let ActionSpec::Build { input, .. } = &mut stack.pipeline.stages[5].actions[0] {
        *input = "PolicyScanOutput".into();
    }
    assert!(has_error(
        &stack,
        "reads artifact 'PolicyScanOutput' but the previous stage emits 'BuildOutput'"
    ));
}

#[test]
fn source_actions_belong_to_the_first_stage() {
    let mut stack = reference();
    stack.pipeline.stages.swap(0, 2);
    let report = validate_stack(&stack);
    assert!(
        report
            .errors
            .iter()
            .any(|e| e.contains("must contain only source actions"))
    );
    assert!(
        report
            .errors
            .iter()
            .any(|e| e.contains("source action outside the first stage"))
    );
}

#[test]
fn duplicate_artifact_producers_are_rejected() {
    let mut stack = reference();
    if let ActionSpec::Build { outputs, .. } = &mut stack.pipeline.stages[3].actions[0] {
        *outputs = vec!["PolicyScanOutput".into()];
    }
    assert!(has_error(
        &stack,
        "Artifact 'PolicyScanOutput' is produced by both stage 'Policy-Scan' and stage 'Build-Scan'"
    ));
}

#[test]
fn declared_environment_covers_referenced_variables() {
    let mut stack = reference();
    stack.jobs[1].phases.build.push("echo $SCAN_REPORT_BUCKET".into());
    assert!(has_error(
        &stack,
        "references undeclared environment variable 'SCAN_REPORT_BUCKET'"
    ));

    stack.jobs[1]
        .environment
        .insert("SCAN_REPORT_BUCKET".into(), EnvValue::literal("reports"));
    assert!(validate_stack(&stack).is_ok());
}

#[test]
fn environment_parameters_must_be_declared() {
    let mut stack = reference();
    stack.parameters.retain(|p| p.name != "KubectlSha256");
    assert!(has_error(&stack, "uses unknown parameter 'KubectlSha256'"));
}

#[test]
fn secrets_read_by_jobs_must_be_declared() {
    let mut stack = reference();
    stack.secrets.retain(|s| s.name != "dockerhubtwo");
    assert!(has_error(&stack, "reads undeclared secret 'dockerhubtwo'"));
}

#[test]
fn missing_registry_permissions_are_errors() {
    let mut stack = reference();
    let role = stack
        .roles
        .iter_mut()
        .find(|role| role.name == "image-build-role")
        .unwrap();
    role.statements.retain(|s| s.sid.as_deref() != Some("RegistryPullPush"));
    let report = validate_stack(&stack);
    assert!(
        report
            .errors
            .iter()
            .any(|e| e.contains("lacks ecr:PutImage on registry:devsecops-repo-ecr"))
    );
}

#[test]
fn duplicate_exports_are_rejected() {
    let mut stack = reference();
    stack.outputs[1].export = "EKSClusterName".into();
    assert!(has_error(&stack, "Duplicate export name 'EKSClusterName'"));
}

#[test]
fn unused_jobs_and_templates_warn() {
    let mut stack = reference();
    stack.pipeline.stages.truncate(4);
    stack.node_pools.truncate(1);
    let report = validate_stack(&stack);
    assert!(report.is_ok(), "{:#?}", report.errors);
    assert!(
        report
            .warnings
            .iter()
            .any(|w| w.contains("Job 'devsecops-project-eks-deploy' is not run by the pipeline"))
    );
    assert!(
        report
            .warnings
            .iter()
            .any(|w| w.contains("'hardened-node-template' is not used by any node pool"))
    );
}

#[test]
fn security_findings_surface_as_warnings() {
    let mut stack = reference();
    stack.keys[0].rotation = false;
    let report = validate_stack(&stack);
    assert!(report.is_ok());
    assert!(
        report
            .warnings
            .iter()
            .any(|w| w.starts_with("Security: [medium] key:devsecops-key"))
    );
}
