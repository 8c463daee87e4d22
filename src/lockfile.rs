use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::definition::PipelineDefinition;
use crate::pipeline::StageSpec;

#[derive(Debug, Serialize)]
pub struct PipelineLock {
    pub definition_version: u32,
    pub name: String,
    pub generated_at: DateTime<Utc>,
    pub workspace: String,
    pub container_scope: String,
    pub stages: Vec<StageLock>,
}

#[derive(Debug, Serialize)]
pub struct StageLock {
    pub name: String,
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    pub params_hash: String,
}

pub fn build_lock(definition: &PipelineDefinition) -> PipelineLock {
    let stages = definition
        .stages
        .iter()
        .map(|spec| StageLock {
            name: spec.display_name().to_string(),
            stage: spec.stage.clone(),
            timeout_secs: spec.timeout_secs,
            params_hash: hash_params(spec),
        })
        .collect();

    PipelineLock {
        definition_version: definition.version,
        name: definition.name.clone(),
        generated_at: Utc::now(),
        workspace: definition.workspace.to_string_lossy().to_string(),
        container_scope: serde_yaml::to_string(&definition.container_scope)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
        stages,
    }
}

pub fn generate_lock(definition: &PipelineDefinition, path: &Path) -> Result<()> {
    let lock = build_lock(definition);
    let file = File::create(path)
        .with_context(|| format!("Failed to create lockfile: {}", path.display()))?;
    serde_yaml::to_writer(file, &lock)
        .with_context(|| format!("Failed to write lockfile: {}", path.display()))?;

    Ok(())
}

/// Stable digest of a stage's kind and parameters. Key order does not matter.
pub fn hash_params(spec: &StageSpec) -> String {
    let mut hasher = Sha256::new();
    let value = serde_json::to_value(spec.params.clone().unwrap_or_default()).unwrap_or_default();
    let serialized = serde_json::to_vec(&value).unwrap_or_default();
    hasher.update(spec.stage.as_bytes());
    hasher.update(serialized);
    format!("{:x}", hasher.finalize())
}
