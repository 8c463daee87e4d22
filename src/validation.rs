use std::collections::{HashMap, HashSet};

use serde::Serialize;
use serde_json::Value;

use crate::definition::PipelineDefinition;
use crate::pipeline::{StageRegistry, StageSpec};

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_definition(
    definition: &PipelineDefinition,
    registry: &StageRegistry,
) -> ValidationReport {
    let mut report = ValidationReport::default();

    if definition.version != 1 {
        report.errors.push(format!(
            "Unsupported pipeline version: {}",
            definition.version
        ));
    }

    if definition.name.trim().is_empty() {
        report.errors.push("Pipeline name cannot be empty".into());
    }

    if definition.workspace.as_os_str().is_empty() {
        report.errors.push("Workspace cannot be empty".into());
    }

    if let Some(listen) = &definition.listen
        && listen.parse::<std::net::SocketAddr>().is_err()
    {
        report
            .errors
            .push(format!("Listen address '{listen}' is not a valid socket address"));
    }

    if definition.stages.is_empty() {
        report
            .errors
            .push("Pipeline must contain at least one stage".into());
    }

    let mut seen = HashSet::new();
    for (idx, stage) in definition.stages.iter().enumerate() {
        let label = stage.display_name();
        if !seen.insert(label) {
            report
                .errors
                .push(format!("Stage name '{label}' is used more than once"));
        }
        if !stage.abort_on_failure {
            report.errors.push(format!(
                "Stage {} ('{}') sets abort_on_failure: false; every stage aborts the run on failure",
                idx + 1,
                label
            ));
        }
        if stage.timeout_secs == Some(0) {
            report.errors.push(format!(
                "Stage {} ('{}') has a zero timeout",
                idx + 1,
                label
            ));
        }
        report.merge(validate_stage_order(idx, stage, &definition.stages));
        report.merge(validate_stage(idx, stage, registry));
    }

    report.merge(validate_deploy_targets(&definition.stages));

    if definition.has_stage("quality_gate") && definition.listen.is_none() {
        report.warnings.push(
            "Pipeline waits for a quality gate but sets no 'listen' address; pass --listen when running"
                .into(),
        );
    }

    report
}

fn validate_stage(idx: usize, stage: &StageSpec, registry: &StageRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    let params = stage.params.clone().unwrap_or_default();
    if let Err(err) = registry.create(&stage.stage, params) {
        report.errors.push(format!(
            "Stage {} ('{}'): failed to instantiate stage: {err:#}",
            idx + 1,
            stage.display_name()
        ));
    }

    if stage.stage == "checkout"
        && let Some(url) = param_str(stage, "repository")
        && !url.starts_with("https://")
    {
        report.warnings.push(format!(
            "Checkout repository '{url}' is not an HTTPS URL"
        ));
    }

    report
}

fn validate_stage_order(idx: usize, stage: &StageSpec, pipeline: &[StageSpec]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let earlier = &pipeline[..idx];

    if stage.stage == "checkout" && idx != 0 {
        report
            .warnings
            .push("Checkout stage is not the first stage".into());
    }
    if matches!(stage.stage.as_str(), "build" | "analysis" | "container_deploy")
        && !pipeline.iter().any(|spec| spec.stage == "checkout")
    {
        report.warnings.push(format!(
            "Stage '{}' runs without a checkout stage; the workspace must already exist",
            stage.display_name()
        ));
    }
    if stage.stage == "quality_gate" {
        let project = param_str(stage, "project_key");
        let analysed = earlier.iter().any(|prev| {
            prev.stage == "analysis" && param_str(prev, "project_key") == project
        });
        if !analysed {
            report.errors.push(format!(
                "Quality gate stage '{}' must follow an analysis stage for the same project_key",
                stage.display_name()
            ));
        }
    }
    report
}

fn validate_deploy_targets(pipeline: &[StageSpec]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut names: HashMap<String, &str> = HashMap::new();
    let mut ports: HashMap<u64, &str> = HashMap::new();

    for stage in pipeline.iter().filter(|spec| spec.stage == "container_deploy") {
        let label = stage.display_name();
        if let Some(name) = param_str(stage, "name")
            && let Some(previous) = names.insert(name.to_string(), label)
        {
            report.errors.push(format!(
                "Stages '{previous}' and '{label}' deploy the same container name '{name}'"
            ));
        }
        let port = param_u64(stage, "host_port").or_else(|| param_u64(stage, "container_port"));
        if let Some(port) = port
            && let Some(previous) = ports.insert(port, label)
        {
            report.errors.push(format!(
                "Stages '{previous}' and '{label}' publish the same host port {port}"
            ));
        }
    }
    report
}

fn param<'a>(stage: &'a StageSpec, key: &str) -> Option<&'a Value> {
    stage.params.as_ref().and_then(|params| params.get(key))
}

fn param_str<'a>(stage: &'a StageSpec, key: &str) -> Option<&'a str> {
    param(stage, key).and_then(Value::as_str)
}

fn param_u64(stage: &StageSpec, key: &str) -> Option<u64> {
    param(stage, key).and_then(|value| match value {
        Value::Number(num) => num.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}
