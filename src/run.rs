use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::StageError;
use crate::quality::QualityGateResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        }
    }

    /// Process exit code reported by the CLI for this status.
    pub fn exit_code(self) -> u8 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Aborted => 2,
            RunStatus::Failed | RunStatus::Running => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    Aborted,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub name: String,
    pub kind: String,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageRecord {
    pub fn skipped(name: &str, kind: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            status: StageStatus::Skipped,
            started_at: None,
            duration_ms: 0.0,
            log: Vec::new(),
            error: None,
        }
    }
}

/// One execution of a pipeline definition.
///
/// The cursor points at the stage currently executing. It only moves forward
/// through [`PipelineRun::complete_stage`]; [`PipelineRun::terminate`] freezes it
/// on the failing stage.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub pipeline: String,
    pub status: RunStatus,
    pub cursor: usize,
    pub stage_count: usize,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_gate: Option<QualityGateResult>,
}

impl PipelineRun {
    pub fn start(id: Uuid, pipeline: impl Into<String>, stage_count: usize) -> Self {
        Self {
            id,
            pipeline: pipeline.into(),
            status: RunStatus::Running,
            cursor: 0,
            stage_count,
            started_at: Utc::now(),
            finished_at: None,
            stages: Vec::with_capacity(stage_count),
            failure: None,
            quality_gate: None,
        }
    }

    pub fn complete_stage(&mut self, record: StageRecord) {
        if self.status.is_terminal() {
            return;
        }
        self.stages.push(record);
        self.cursor += 1;
        if self.cursor >= self.stage_count {
            self.status = RunStatus::Success;
            self.finished_at = Some(Utc::now());
        }
    }

    pub fn terminate(&mut self, mut record: StageRecord, error: &StageError) {
        if self.status.is_terminal() {
            return;
        }
        let status = error.run_status();
        record.status = match status {
            RunStatus::Aborted => StageStatus::Aborted,
            _ => StageStatus::Failed,
        };
        record.error = Some(error.to_string());
        self.failure = Some(format!("{}: {error}", record.name));
        self.stages.push(record);
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    pub fn push_skipped(&mut self, record: StageRecord) {
        self.stages.push(record);
    }

    pub fn last_attempted(&self) -> Option<&StageRecord> {
        self.stages
            .iter()
            .rev()
            .find(|record| record.status != StageStatus::Skipped)
    }

    pub fn executed_stage_names(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|record| record.status != StageStatus::Skipped)
            .map(|record| record.name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> StageRecord {
        StageRecord {
            name: name.into(),
            kind: "shell".into(),
            status: StageStatus::Succeeded,
            started_at: Some(Utc::now()),
            duration_ms: 1.0,
            log: Vec::new(),
            error: None,
        }
    }

    #[test]
    fn cursor_advances_until_success() {
        let mut run = PipelineRun::start(Uuid::new_v4(), "demo", 2);
        run.complete_stage(record("one"));
        assert_eq!(run.cursor, 1);
        assert_eq!(run.status, RunStatus::Running);
        run.complete_stage(record("two"));
        assert_eq!(run.cursor, 2);
        assert_eq!(run.status, RunStatus::Success);
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn terminated_run_ignores_further_progress() {
        let mut run = PipelineRun::start(Uuid::new_v4(), "demo", 3);
        run.complete_stage(record("one"));
        run.terminate(record("two"), &StageError::Build("mvn exited 1".into()));
        run.complete_stage(record("three"));
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.cursor, 1);
        assert_eq!(run.executed_stage_names(), vec!["one", "two"]);
        assert_eq!(run.last_attempted().unwrap().status, StageStatus::Failed);
    }
}
