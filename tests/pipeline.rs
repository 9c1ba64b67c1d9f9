use devsecops_stack::declaration::ResolutionContext;
use devsecops_stack::jobs::{DryRunExecutor, Phase};
use devsecops_stack::pipeline::{
    ActionSpec, ApprovalDecision, ApproveAll, LocalActions, PipelineExecutor, PipelineStatus,
    ScriptedApprovals, SimulatedActions, StageFailure, StageStatus,
};
use devsecops_stack::presets::preset;
use tempfile::tempdir;

fn statuses(run: &devsecops_stack::PipelineRun) -> Vec<StageStatus> {
    run.stages.iter().map(|stage| stage.status).collect()
}

#[test]
fn rejected_first_approval_stops_everything_downstream() {
    let stack = preset("devsecops-eks").unwrap();
    let executor = PipelineExecutor::new(&stack);
    let mut approvals = ScriptedApprovals::new([ApprovalDecision::Rejected {
        comment: Some("policy findings".into()),
    }]);

    let run = executor.run(&SimulatedActions::new(), &mut approvals).unwrap();

    assert_eq!(run.status(), PipelineStatus::Failed);
    assert_eq!(
        statuses(&run),
        [
            StageStatus::Succeeded,
            StageStatus::Succeeded,
            StageStatus::Failed,
            StageStatus::Pending,
            StageStatus::Pending,
            StageStatus::Pending,
        ]
    );
    assert_eq!(run.executed_stages(), ["Source", "Policy-Scan", "Approve-1"]);
    let (stage, failure) = run.failure().unwrap();
    assert_eq!(stage, "Approve-1");
    assert_eq!(
        failure,
        &StageFailure::Rejected {
            action: "Approve".into(),
            comment: Some("policy findings".into()),
        }
    );
    assert!(!run.artifacts.contains_key("BuildOutput"));

    let snapshot = executor.metrics().snapshot();
    assert_eq!(snapshot.approvals_rejected, 1);
    assert_eq!(snapshot.stage_failures, 1);
    assert!(!snapshot.stages.contains_key("Build-Scan"));
}

#[test]
fn failed_run_does_not_resume() {
    let stack = preset("devsecops-eks").unwrap();
    let executor = PipelineExecutor::new(&stack);
    let mut run = executor
        .run(
            &SimulatedActions::new(),
            &mut ScriptedApprovals::new([ApprovalDecision::Rejected { comment: None }]),
        )
        .unwrap();
    let before = run.clone();

    let status = executor
        .advance(&mut run, &SimulatedActions::new(), &mut ApproveAll)
        .unwrap();
    assert_eq!(status, PipelineStatus::Failed);
    assert_eq!(run, before);
}

#[test]
fn pending_approval_suspends_and_resumes() {
    let stack = preset("devsecops-eks").unwrap();
    let executor = PipelineExecutor::new(&stack);
    let actions = SimulatedActions::new();

    let mut run = executor
        .run(&actions, &mut ScriptedApprovals::new([]))
        .unwrap();
    assert_eq!(run.status(), PipelineStatus::Running);
    assert_eq!(run.awaiting_approval(), Some("Approve-1"));
    assert_eq!(run.stage("Build-Scan").unwrap().status, StageStatus::Pending);

    let status = executor
        .advance(
            &mut run,
            &actions,
            &mut ScriptedApprovals::new([ApprovalDecision::Approved, ApprovalDecision::Pending]),
        )
        .unwrap();
    assert_eq!(status, PipelineStatus::Running);
    assert_eq!(run.awaiting_approval(), Some("Approve-2"));
    assert_eq!(run.stage("Build-Scan").unwrap().status, StageStatus::Succeeded);

    let status = executor.advance(&mut run, &actions, &mut ApproveAll).unwrap();
    assert_eq!(status, PipelineStatus::Succeeded);
    assert!(statuses(&run).iter().all(|s| *s == StageStatus::Succeeded));

    let snapshot = executor.metrics().snapshot();
    assert_eq!(snapshot.approvals_granted, 2);
    assert_eq!(snapshot.stages["Approve-1"].calls, 2);
    assert_eq!(snapshot.stages["Deploy"].calls, 1);
}

#[test]
fn failing_job_fails_its_stage_without_retry() {
    let stack = preset("devsecops-eks").unwrap();
    let executor = PipelineExecutor::new(&stack);
    let actions = SimulatedActions::failing(["devsecops-project-eks-static-scan".to_string()]);

    let run = executor.run(&actions, &mut ApproveAll).unwrap();
    assert_eq!(run.status(), PipelineStatus::Failed);
    assert_eq!(run.stage("Build-Scan").unwrap().status, StageStatus::Failed);
    assert_eq!(run.stage("Approve-2").unwrap().status, StageStatus::Pending);
    assert_eq!(run.stage("Deploy").unwrap().status, StageStatus::Pending);

    match run.failure() {
        Some((_, StageFailure::JobFailed { job, failure })) => {
            assert_eq!(job, "devsecops-project-eks-static-scan");
            assert_eq!(failure.phase, Phase::PostBuild);
            assert_eq!(failure.exit_code, 1);
        }
        other => panic!("unexpected failure: {other:?}"),
    }
}

#[test]
fn artifacts_flow_through_approval_gates() {
    let stack = preset("devsecops-eks").unwrap();
    let executor = PipelineExecutor::new(&stack);
    let run = executor.run(&SimulatedActions::new(), &mut ApproveAll).unwrap();

    assert_eq!(run.status(), PipelineStatus::Succeeded);
    let build = &run.artifacts["BuildOutput"];
    assert_eq!(build.producer, "CodeBuild");
    assert_eq!(build.location, "devsecops-eks-cc-repository@main");
    assert_eq!(run.artifacts.len(), 3);
}

#[test]
fn missing_input_artifact_fails_the_stage() {
    let mut stack = preset("minimal").unwrap();
    if let ActionSpec::Build { input, .. } = &mut stack.pipeline.stages[2].actions[0] {
        *input = "Nope".into();
    }
    let executor = PipelineExecutor::new(&stack);
    let run = executor.run(&SimulatedActions::new(), &mut ApproveAll).unwrap();
    assert!(matches!(
        run.failure(),
        Some(("Deploy", StageFailure::MissingArtifact { artifact, .. })) if artifact == "Nope"
    ));
}

#[test]
fn local_actions_run_job_commands_from_the_workspace() {
    let temp = tempdir().unwrap();
    let stack = preset("minimal").unwrap();
    let executor = PipelineExecutor::new(&stack);
    let actions = LocalActions::new(
        &stack,
        ResolutionContext::for_stack(&stack),
        temp.path(),
        DryRunExecutor::new(),
    )
    .with_metrics(executor.metrics());

    let run = executor.run(&actions, &mut ApproveAll).unwrap();
    assert_eq!(run.status(), PipelineStatus::Succeeded);
    assert_eq!(executor.metrics().snapshot().commands_executed, 2);
}

#[test]
fn local_actions_need_an_existing_workspace() {
    let temp = tempdir().unwrap();
    let stack = preset("minimal").unwrap();
    let executor = PipelineExecutor::new(&stack);
    let actions = LocalActions::new(
        &stack,
        ResolutionContext::for_stack(&stack),
        temp.path().join("missing"),
        DryRunExecutor::new(),
    );

    let run = executor.run(&actions, &mut ApproveAll).unwrap();
    assert!(matches!(
        run.failure(),
        Some(("Source", StageFailure::ActionError { .. }))
    ));
}
