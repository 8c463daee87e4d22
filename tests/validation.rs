use std::fs;

use gatehouse::definition::PipelineDefinition;
use gatehouse::lockfile::{build_lock, generate_lock, hash_params};
use gatehouse::pipeline::StageRegistry;
use gatehouse::stages;
use gatehouse::validation::validate_definition;
use tempfile::tempdir;

fn build_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    registry
}

const VALID: &str = r#"
version: 1
name: two-tier-app
workspace: ./workspace
listen: 127.0.0.1:8081
stages:
  - name: Checkout
    stage: checkout
    params:
      repository: https://example.com/app.git
  - name: Build
    stage: build
    params:
      dir: backend
  - name: Analysis
    stage: analysis
    params:
      project_key: backend
      host_url: http://localhost:9000
  - name: Gate
    stage: quality_gate
    timeout_secs: 60
    params:
      project_key: backend
  - name: Deploy
    stage: container_deploy
    params:
      name: backend
      image: app-backend
      context: backend
      container_port: 8080
"#;

#[test]
fn valid_definition_passes() {
    let definition = PipelineDefinition::from_yaml(VALID).unwrap();
    let report = validate_definition(&definition, &build_registry());
    assert!(report.is_ok(), "{:?}", report.errors);
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
}

#[test]
fn gate_without_matching_analysis_is_an_error() {
    let yaml = VALID.replace("      project_key: backend\n  - name: Deploy", "      project_key: frontend\n  - name: Deploy");
    let definition = PipelineDefinition::from_yaml(&yaml).unwrap();
    let report = validate_definition(&definition, &build_registry());
    assert!(
        report
            .errors
            .iter()
            .any(|err| err.contains("must follow an analysis stage"))
    );
}

#[test]
fn reports_structural_errors() {
    let definition = PipelineDefinition::from_yaml(
        r#"
version: 2
listen: not-an-address
stages:
  - name: Deploy
    stage: container_deploy
    abort_on_failure: false
    params:
      name: web
      image: web
      context: .
      container_port: 80
  - name: Deploy
    stage: container_deploy
    timeout_secs: 0
    params:
      name: web
      image: web
      context: .
      container_port: 80
  - stage: teleport
"#,
    )
    .unwrap();
    let report = validate_definition(&definition, &build_registry());
    let joined = report.errors.join("\n");

    assert!(joined.contains("Unsupported pipeline version: 2"), "{joined}");
    assert!(joined.contains("not a valid socket address"), "{joined}");
    assert!(joined.contains("used more than once"), "{joined}");
    assert!(joined.contains("abort_on_failure: false"), "{joined}");
    assert!(joined.contains("zero timeout"), "{joined}");
    assert!(joined.contains("Unknown stage 'teleport'"), "{joined}");
    assert!(joined.contains("same container name 'web'"), "{joined}");
    assert!(joined.contains("same host port 80"), "{joined}");
    assert!(
        report
            .warnings
            .iter()
            .any(|warning| warning.contains("without a checkout stage"))
    );
}

#[test]
fn bad_stage_parameters_are_reported_per_stage() {
    let definition = PipelineDefinition::from_yaml(
        r#"
version: 1
stages:
  - stage: checkout
    params:
      repository: git@example.com:app.git
      shallow: true
"#,
    )
    .unwrap();
    let report = validate_definition(&definition, &build_registry());
    assert!(report.errors.iter().any(|err| err.contains("shallow")));
    assert!(report.warnings.iter().any(|warning| warning.contains("not an HTTPS URL")));
}

#[test]
fn lockfile_records_stage_hashes() {
    let definition = PipelineDefinition::from_yaml(VALID).unwrap();
    let temp = tempdir().unwrap();
    let lock_path = temp.path().join("pipeline.lock");

    generate_lock(&definition, &lock_path).unwrap();

    let contents = fs::read_to_string(&lock_path).unwrap();
    assert!(contents.contains("definition_version: 1"));
    assert!(contents.contains("name: two-tier-app"));
    assert!(contents.contains("stage: quality_gate"));
    assert!(contents.contains("timeout_secs: 60"));
    assert!(contents.contains("params_hash"));

    let lock = build_lock(&definition);
    assert_eq!(lock.stages.len(), 5);
    assert_eq!(lock.container_scope, "fixed");
    assert_eq!(lock.stages[0].params_hash.len(), 64);
}

#[test]
fn param_hash_ignores_key_order_but_not_values() {
    let a = PipelineDefinition::from_yaml(
        "version: 1\nstages:\n  - stage: shell\n    params: {command: make, dir: app}\n",
    )
    .unwrap();
    let b = PipelineDefinition::from_yaml(
        "version: 1\nstages:\n  - stage: shell\n    params: {dir: app, command: make}\n",
    )
    .unwrap();
    let c = PipelineDefinition::from_yaml(
        "version: 1\nstages:\n  - stage: shell\n    params: {dir: app, command: make test}\n",
    )
    .unwrap();

    assert_eq!(hash_params(&a.stages[0]), hash_params(&b.stages[0]));
    assert_ne!(hash_params(&a.stages[0]), hash_params(&c.stages[0]));
}

#[test]
fn malformed_parameter_values_fail_validation() {
    let definition = PipelineDefinition::from_yaml(
        r#"
version: 1
stages:
  - name: Checkout
    stage: checkout
    params:
      repository: https://example.com/app.git
      depth: shallow
  - name: Build
    stage: build
    params:
      skip_tests: maybe
"#,
    )
    .unwrap();
    let report = validate_definition(&definition, &build_registry());

    assert!(!report.is_ok());
    assert!(
        report
            .errors
            .iter()
            .any(|err| err.starts_with("Stage 1 ('Checkout')") && err.contains("'depth'")),
        "{:?}",
        report.errors
    );
    assert!(
        report
            .errors
            .iter()
            .any(|err| err.starts_with("Stage 2 ('Build')") && err.contains("'skip_tests'")),
        "{:?}",
        report.errors
    );
}
