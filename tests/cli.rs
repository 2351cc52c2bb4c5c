use std::process::Command; // Run programs

use assert_cmd::prelude::*; // Add methods on commands
use predicates::prelude::*; // Used for writing assertions

fn kiln(home: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("kiln").expect("binary builds");
    cmd.env("KILN_HOME_DIR", home);
    cmd.env_remove("TFL_STORAGE_URI");
    cmd.env_remove("TFL_WORKSPACE_DIR");
    cmd.arg("--hide-bars");
    cmd
}

#[test]
fn no_subcommand_prints_usage() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = tempfile::tempdir()?;
    let mut cmd = kiln(tmp.path());

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("USAGE"));

    Ok(())
}

#[test]
fn experiment_create_writes_index_json() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = tempfile::tempdir()?;

    kiln(tmp.path())
        .args(["experiment", "create", "alpha"])
        .assert()
        .success()
        .stdout(predicate::str::contains("created"));

    let index = tmp
        .path()
        .join("workspace")
        .join("experiments")
        .join("alpha")
        .join("index.json");
    assert!(index.is_file());

    // creating the same experiment again fails
    kiln(tmp.path())
        .args(["experiment", "create", "alpha"])
        .assert()
        .failure();

    Ok(())
}

#[test]
fn submitted_jobs_show_up_queued() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = tempfile::tempdir()?;

    kiln(tmp.path())
        .args(["experiment", "create", "alpha"])
        .assert()
        .success();

    kiln(tmp.path())
        .args([
            "job",
            "submit",
            "--experiment",
            "alpha",
            "--type",
            "TRAIN",
            "--job-data",
            r#"{"config": {"plugin_name": "trainer"}}"#,
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("queued"));

    kiln(tmp.path())
        .args(["job", "list", "--experiment", "alpha"])
        .assert()
        .success()
        .stdout(predicate::str::contains("QUEUED").and(predicate::str::contains("TRAIN")));

    Ok(())
}

#[test]
fn job_show_prints_the_document() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = tempfile::tempdir()?;

    kiln(tmp.path())
        .args(["experiment", "create", "alpha"])
        .assert()
        .success();
    kiln(tmp.path())
        .args(["job", "submit", "--experiment", "alpha", "--type", "EVAL"])
        .assert()
        .success();

    kiln(tmp.path())
        .args(["job", "show", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"experiment_id\": \"alpha\""));

    Ok(())
}

#[test]
fn workflow_run_queues_the_first_task() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = tempfile::tempdir()?;

    kiln(tmp.path())
        .args(["experiment", "create", "alpha"])
        .assert()
        .success();

    let nodes = r#"{"nodes": [
        {"id": "start", "type": "START", "out": ["t1"]},
        {"id": "t1", "type": "TASK", "task_type": "TRAIN",
         "inputs": "{}", "outputs": "{}", "out": []}
    ]}"#;
    kiln(tmp.path())
        .args([
            "workflow",
            "create",
            "wf1",
            "--experiment",
            "alpha",
            "--nodes",
            nodes,
        ])
        .assert()
        .success();

    kiln(tmp.path())
        .args(["workflow", "run", "wf1", "--experiment", "alpha"])
        .assert()
        .success()
        .stdout(predicate::str::contains("started"));

    kiln(tmp.path())
        .args(["job", "list", "--experiment", "alpha", "--type", "TRAIN"])
        .assert()
        .success()
        .stdout(predicate::str::contains("QUEUED"));

    // cancelling from the wrong experiment is rejected with the
    // in-body error
    kiln(tmp.path())
        .args(["workflow", "cancel", "bogus-run", "--experiment", "alpha"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Workflow not found or does not belong to this experiment",
        ));

    Ok(())
}

#[test]
fn org_scoped_workspaces_are_isolated() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = tempfile::tempdir()?;

    kiln(tmp.path())
        .args(["experiment", "create", "alpha", "--org", "team1"])
        .assert()
        .success();

    let index = tmp
        .path()
        .join("orgs")
        .join("team1")
        .join("workspace")
        .join("experiments")
        .join("alpha")
        .join("index.json");
    assert!(index.is_file());

    // no leak into the anonymous workspace
    assert!(!tmp
        .path()
        .join("workspace")
        .join("experiments")
        .join("alpha")
        .exists());

    Ok(())
}
