use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use devsecops_stack::jobs::{BuildJob, BuildPhases, JobRunner, Phase, ShellExecutor};
use devsecops_stack::presets::preset;
use devsecops_stack::validation::validate_stack;
use tempfile::tempdir;

fn job_with(phases: BuildPhases) -> BuildJob {
    let mut job = preset("minimal").unwrap().jobs[0].clone();
    job.environment.clear();
    job.phases = phases;
    job
}

#[test]
fn shell_runner_stops_at_first_nonzero_exit() {
    let temp = tempdir().unwrap();
    let job = job_with(BuildPhases {
        build: vec!["touch first".into(), "exit 3".into(), "touch never".into()],
        post_build: vec!["touch post".into()],
        ..Default::default()
    });

    let outcome = JobRunner::new(&ShellExecutor::default())
        .run(&job, &BTreeMap::new(), temp.path())
        .unwrap();

    let failure = outcome.failure.expect("job fails");
    assert_eq!(failure.phase, Phase::Build);
    assert_eq!(failure.index, 1);
    assert_eq!(failure.exit_code, 3);
    assert!(temp.path().join("first").is_file());
    assert!(!temp.path().join("never").exists());
    assert!(!temp.path().join("post").exists());
}

#[test]
fn shell_runner_injects_environment_in_workdir() {
    let temp = tempdir().unwrap();
    let job = job_with(BuildPhases {
        build: vec!["test \"$GREETING\" = hello && printf '%s' \"$GREETING\" > greeting.txt".into()],
        ..Default::default()
    });
    let env = BTreeMap::from([("GREETING".to_string(), "hello".to_string())]);

    let outcome = JobRunner::new(&ShellExecutor::default())
        .run(&job, &env, temp.path())
        .unwrap();

    assert!(outcome.succeeded(), "{:?}", outcome.failure);
    assert_eq!(fs::read_to_string(temp.path().join("greeting.txt")).unwrap(), "hello");
}

#[test]
fn exports_do_not_reach_the_next_command() {
    let temp = tempdir().unwrap();
    let job = job_with(BuildPhases {
        install: vec![
            "export dockerhub_username=alice".into(),
            "test -n \"$dockerhub_username\"".into(),
        ],
        ..Default::default()
    });
    assert_eq!(
        job.undeclared_variables(),
        BTreeSet::from(["dockerhub_username".to_string()])
    );

    let outcome = JobRunner::new(&ShellExecutor::default())
        .run(&job, &BTreeMap::new(), temp.path())
        .unwrap();
    let failure = outcome.failure.expect("second command sees no variable");
    assert_eq!(failure.phase, Phase::Install);
    assert_eq!(failure.index, 1);
    assert_eq!(failure.exit_code, 1);
}

#[test]
fn chained_exports_are_visible_to_later_segments() {
    let temp = tempdir().unwrap();
    let job = job_with(BuildPhases {
        install: vec!["export dockerhub_username=alice && test -n \"$dockerhub_username\"".into()],
        ..Default::default()
    });
    assert!(job.undeclared_variables().is_empty());

    let outcome = JobRunner::new(&ShellExecutor::default())
        .run(&job, &BTreeMap::new(), temp.path())
        .unwrap();
    assert!(outcome.succeeded(), "{:?}", outcome.failure);
}

#[test]
fn variables_read_before_assignment_are_undeclared() {
    let temp = tempdir().unwrap();
    let job = job_with(BuildPhases {
        build: vec!["test -n \"$LATER\" && LATER=1".into()],
        ..Default::default()
    });
    assert_eq!(
        job.undeclared_variables(),
        BTreeSet::from(["LATER".to_string()])
    );

    let outcome = JobRunner::new(&ShellExecutor::default())
        .run(&job, &BTreeMap::new(), temp.path())
        .unwrap();
    assert_eq!(outcome.failure.map(|failure| failure.exit_code), Some(1));
}

#[test]
fn validation_rejects_exports_split_across_commands() {
    let mut stack = preset("devsecops-eks").unwrap();
    stack.jobs[1].phases.install = vec![
        "export dockerhub_username=alice".into(),
        "test -n \"$dockerhub_username\"".into(),
    ];
    let report = validate_stack(&stack);
    assert!(
        report
            .errors
            .iter()
            .any(|e| e.contains("references undeclared environment variable 'dockerhub_username'")),
        "{:#?}",
        report.errors
    );
}
