use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};

use crate::definition::PipelineDefinition;
use crate::naming::ContainerScope;
use crate::pipeline::{StageParameters, StageSpec};

pub const TEMPLATES: [&str; 2] = ["two-tier", "minimal"];

pub fn template(name: &str) -> Result<PipelineDefinition> {
    match name {
        "two-tier" => Ok(two_tier()),
        "minimal" => Ok(minimal()),
        other => bail!(
            "Unknown template '{other}'. Available templates: {}",
            TEMPLATES.join(", ")
        ),
    }
}

pub fn generate_template(name: &str, destination: &Path) -> Result<PathBuf> {
    let definition = template(name)?;
    let rendered = serde_yaml::to_string(&definition)?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered).with_context(|| {
        format!("Failed to write pipeline definition: {}", destination.display())
    })?;

    Ok(destination.to_path_buf())
}

/// Spring Boot backend and static frontend, analysed by SonarQube and deployed
/// as two containers.
fn two_tier() -> PipelineDefinition {
    PipelineDefinition {
        version: 1,
        name: "two-tier-app".into(),
        workspace: PathBuf::from("./workspace"),
        listen: Some("0.0.0.0:8081".into()),
        container_scope: ContainerScope::Fixed,
        stages: vec![
            stage(
                "Checkout",
                "checkout",
                json!({
                    "repository": "https://github.com/example/two-tier-app.git",
                    "branch": "main",
                }),
            ),
            stage(
                "Backend Build",
                "build",
                json!({
                    "dir": "backend",
                    "program": "mvn",
                    "args": ["clean", "package"],
                    "skip_tests": true,
                    "artifact": "target/*.jar",
                }),
            ),
            stage(
                "SonarQube Analysis",
                "analysis",
                json!({
                    "dir": "backend",
                    "project_key": "two-tier-backend",
                    "host_url": "http://localhost:9000",
                    "token_env": "SONAR_TOKEN",
                }),
            ),
            StageSpec {
                timeout_secs: Some(120),
                ..stage(
                    "Quality Gate",
                    "quality_gate",
                    json!({ "project_key": "two-tier-backend" }),
                )
            },
            stage(
                "Deploy Backend",
                "container_deploy",
                json!({
                    "name": "backend",
                    "image": "two-tier-backend",
                    "context": "backend",
                    "host_port": 8080,
                    "container_port": 8080,
                }),
            ),
            stage(
                "Deploy Frontend",
                "container_deploy",
                json!({
                    "name": "frontend",
                    "image": "two-tier-frontend",
                    "context": "frontend",
                    "host_port": 3000,
                    "container_port": 80,
                }),
            ),
        ],
    }
}

fn minimal() -> PipelineDefinition {
    PipelineDefinition {
        version: 1,
        name: "minimal".into(),
        workspace: PathBuf::from("./workspace"),
        listen: None,
        container_scope: ContainerScope::Fixed,
        stages: vec![
            stage(
                "Checkout",
                "checkout",
                json!({ "repository": "https://github.com/example/app.git" }),
            ),
            stage("Test", "shell", json!({ "command": "make test" })),
        ],
    }
}

fn stage(name: &str, kind: &str, params: Value) -> StageSpec {
    let params: StageParameters = params.as_object().cloned().unwrap_or_default();
    StageSpec {
        name: Some(name.into()),
        params: Some(params),
        ..StageSpec::new(kind)
    }
}
