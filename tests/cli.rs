use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use tempfile::tempdir;

fn cli() -> Command {
    let mut command = Command::cargo_bin("devsecops-stack").expect("binary present");
    command.env_remove("CDK_DEFAULT_ACCOUNT").env_remove("AWS_REGION");
    command
}

fn reference_stack() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("stacks/devsecops-eks.yaml")
}

fn write_preset(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(format!("{name}.yaml"));
    cli()
        .args(["preset", "new", "--preset", name, "--output"])
        .arg(&path)
        .assert()
        .success();
    path
}

fn stdout_of(command: &mut Command) -> String {
    let output = command.output().expect("command runs");
    String::from_utf8(output.stdout).expect("utf8 stdout")
}

#[test]
fn preset_list_names_every_preset() {
    let listed = stdout_of(cli().args(["preset", "list"]));
    assert!(listed.lines().any(|line| line == "devsecops-eks"));
    assert!(listed.lines().any(|line| line == "minimal"));
}

#[test]
fn reference_stack_validates() {
    cli().arg("validate").arg(reference_stack()).assert().success();
}

#[test]
fn broken_stack_fails_validation() {
    let temp = tempdir().unwrap();
    let path = write_preset(temp.path(), "minimal");
    let contents = fs::read_to_string(&path).unwrap();
    fs::write(&path, contents.replace("max_size: 3", "max_size: 0")).unwrap();

    cli().arg("validate").arg(&path).assert().failure();
}

#[test]
fn synth_writes_template_to_requested_path() {
    let temp = tempdir().unwrap();
    let output = temp.path().join("out/stack.template.json");
    cli()
        .arg("synth")
        .arg(reference_stack())
        .arg("--output")
        .arg(&output)
        .assert()
        .success();

    let template: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
    assert_eq!(template["Resources"]["EksCluster"]["Type"], "AWS::EKS::Cluster");
    assert_eq!(template["Outputs"]["EKSClusterName"]["Export"]["Name"], "EKSClusterName");
}

#[test]
fn simulate_stops_on_rejected_gate() {
    let output = cli()
        .arg("simulate")
        .arg(reference_stack())
        .args(["--approve", "approve", "--approve", "reject"])
        .output()
        .unwrap();
    assert!(!output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("Pipeline 'devsecops-project-eks-pipeline': failed"));
    assert!(stdout.contains("Approve-2"));
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("Pipeline failed at stage 'Approve-2'"));
}

#[test]
fn simulate_with_every_gate_approved_succeeds() {
    let temp = tempdir().unwrap();
    let metrics = temp.path().join("metrics.json");
    cli()
        .arg("simulate")
        .arg(reference_stack())
        .arg("--approve-all")
        .arg("--metrics-json")
        .arg(&metrics)
        .assert()
        .success();

    let snapshot: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&metrics).unwrap()).unwrap();
    assert_eq!(snapshot["approvals_granted"], 2);
}

#[test]
fn pending_gate_leaves_run_suspended() {
    let stdout = stdout_of(
        cli()
            .arg("simulate")
            .arg(reference_stack())
            .args(["--approve", "pending"]),
    );
    assert!(stdout.contains(": running"));
}

#[test]
fn lockfile_detects_drift() {
    let temp = tempdir().unwrap();
    let stack = write_preset(temp.path(), "minimal");
    let lock = temp.path().join("locks/minimal.lock.yaml");

    cli().arg("lock").arg(&stack).arg(&lock).assert().success();
    cli().arg("check-lock").arg(&stack).arg(&lock).assert().success();

    let contents = fs::read_to_string(&stack).unwrap();
    fs::write(&stack, contents.replace("max_size: 3", "max_size: 4")).unwrap();
    let output = cli().arg("check-lock").arg(&stack).arg(&lock).output().unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8(output.stdout).unwrap().contains("~ DefaultNodegroup"));
}

#[test]
fn diff_reports_identical_stacks() {
    let temp = tempdir().unwrap();
    let generated = write_preset(temp.path(), "devsecops-eks");
    let stdout = stdout_of(cli().arg("diff").arg(reference_stack()).arg(&generated));
    assert!(stdout.starts_with("Stacks match"));
}

#[test]
fn job_inspect_lists_required_permissions() {
    let stdout = stdout_of(
        cli()
            .args(["job", "inspect"])
            .arg(reference_stack())
            .args(["devsecops-project-eks-static-scan", "--view", "permissions"]),
    );
    assert!(stdout.contains("ecr:PutImage"));
    assert!(stdout.contains("secretsmanager:GetSecretValue"));
}

#[test]
fn job_run_dry_run_prints_commands_in_phase_order() {
    let temp = tempdir().unwrap();
    let stack = write_preset(temp.path(), "minimal");
    let stdout = stdout_of(
        cli()
            .args(["job", "run"])
            .arg(&stack)
            .args(["app-deploy", "--dry-run", "--workdir"])
            .arg(temp.path()),
    );
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(
        lines,
        [
            "aws eks update-kubeconfig --name $AWS_CLUSTER_NAME --region $AWS_DEFAULT_REGION",
            "kubectl apply -f kubernetes/",
        ]
    );
}

#[test]
fn security_digest_writes_checksum_file() {
    let temp = tempdir().unwrap();
    let input = temp.path().join("template.json");
    fs::write(&input, "{}").unwrap();
    let digest_path = temp.path().join("template.json.sha256");

    cli()
        .args(["security", "digest", "--path"])
        .arg(&input)
        .arg("--output")
        .arg(&digest_path)
        .assert()
        .success();

    let written = fs::read_to_string(&digest_path).unwrap();
    assert!(written.starts_with("44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"));
}
