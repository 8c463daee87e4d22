use std::fs;

use assert_cmd::Command;
use tempfile::tempdir;

fn gatehouse() -> Command {
    let mut cmd = Command::cargo_bin("gatehouse").expect("binary present");
    cmd.env("RUST_LOG", "warn").env_remove("GATEHOUSE_LISTEN");
    cmd
}

#[test]
fn list_stages_prints_every_kind() {
    let output = gatehouse().arg("list-stages").assert().success();
    let stdout = String::from_utf8_lossy(&output.get_output().stdout).into_owned();
    for kind in [
        "analysis",
        "build",
        "checkout",
        "container_deploy",
        "quality_gate",
        "shell",
    ] {
        assert!(stdout.contains(&format!("- {kind}")), "{stdout}");
    }
}

#[test]
fn init_writes_a_definition_that_validates() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("ci/pipeline.yaml");

    gatehouse()
        .args(["init", "--template", "two-tier", "-o"])
        .arg(&path)
        .assert()
        .success();
    assert!(path.is_file());

    gatehouse().arg("validate").arg(&path).assert().success();

    let lock = temp.path().join("ci/pipeline.lock");
    gatehouse().arg("lock").arg(&path).assert().success();
    assert!(fs::read_to_string(lock).unwrap().contains("params_hash"));
}

#[test]
fn validate_rejects_a_broken_definition() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("pipeline.yaml");
    fs::write(
        &path,
        "version: 1\nstages:\n  - stage: quality_gate\n    params:\n      project_key: app\n",
    )
    .unwrap();

    gatehouse().arg("validate").arg(&path).assert().failure();
}

#[test]
fn shell_pipeline_runs_and_writes_report() {
    let temp = tempdir().unwrap();
    let definition = temp.path().join("pipeline.yaml");
    let report = temp.path().join("out/report.json");
    fs::create_dir_all(temp.path().join("workspace")).unwrap();
    fs::write(
        &definition,
        "version: 1\nname: smoke\nstages:\n  - name: Hello\n    stage: shell\n    params:\n      command: echo hello > greeting.txt\n",
    )
    .unwrap();

    gatehouse()
        .arg("run")
        .arg(&definition)
        .arg("--report")
        .arg(&report)
        .assert()
        .success();

    assert_eq!(
        fs::read_to_string(temp.path().join("workspace/greeting.txt"))
            .unwrap()
            .trim(),
        "hello"
    );
    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(report).unwrap()).unwrap();
    assert_eq!(json["status"], "success");
    assert_eq!(json["stages"][0]["status"], "succeeded");
}

#[test]
fn failing_stage_exits_with_status_one() {
    let temp = tempdir().unwrap();
    let definition = temp.path().join("pipeline.yaml");
    fs::create_dir_all(temp.path().join("workspace")).unwrap();
    fs::write(
        &definition,
        "version: 1\nstages:\n  - name: Broken\n    stage: shell\n    params:\n      command: exit 3\n  - name: Never\n    stage: shell\n    params:\n      command: touch never\n",
    )
    .unwrap();

    gatehouse().arg("run").arg(&definition).assert().code(1);
    assert!(!temp.path().join("workspace/never").exists());
}

#[test]
fn quality_gate_timeout_exits_with_status_two() {
    let temp = tempdir().unwrap();
    let definition = temp.path().join("pipeline.yaml");
    fs::create_dir_all(temp.path().join("workspace")).unwrap();
    fs::write(
        &definition,
        "version: 1\nlisten: 127.0.0.1:0\nstages:\n  - stage: analysis\n    params:\n      program: \"true\"\n      project_key: app\n      host_url: http://localhost:9000\n  - stage: quality_gate\n    timeout_secs: 1\n    params:\n      project_key: app\n",
    )
    .unwrap();

    gatehouse().arg("run").arg(&definition).assert().code(2);
}

#[test]
fn dry_run_does_not_execute_stages() {
    let temp = tempdir().unwrap();
    let definition = temp.path().join("pipeline.yaml");
    fs::write(
        &definition,
        "version: 1\nstages:\n  - stage: shell\n    params:\n      command: touch ran\n",
    )
    .unwrap();

    gatehouse()
        .args(["run", "--dry-run"])
        .arg(&definition)
        .assert()
        .success();
    assert!(!temp.path().join("workspace/ran").exists());
}

#[test]
fn completions_are_generated() {
    let output = gatehouse().args(["completions", "bash"]).assert().success();
    assert!(!output.get_output().stdout.is_empty());
}
