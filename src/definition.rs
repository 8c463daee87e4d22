use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::naming::ContainerScope;
use crate::pipeline::StageSpec;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineDefinition {
    pub version: u32,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    /// Address the webhook listener binds to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    #[serde(default)]
    pub container_scope: ContainerScope,
    pub stages: Vec<StageSpec>,
}

fn default_name() -> String {
    "pipeline".to_string()
}

fn default_workspace() -> PathBuf {
    PathBuf::from("./workspace")
}

impl PipelineDefinition {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse pipeline YAML: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn has_stage(&self, kind: &str) -> bool {
        self.stages.iter().any(|spec| spec.stage == kind)
    }

    /// Workspace resolved against the directory holding the definition file.
    pub fn resolve_workspace(&self, definition_path: &Path) -> PathBuf {
        if self.workspace.is_absolute() {
            return self.workspace.clone();
        }
        match definition_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(&self.workspace),
            _ => self.workspace.clone(),
        }
    }
}
