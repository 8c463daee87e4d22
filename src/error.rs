use std::time::Duration;

use thiserror::Error;

use crate::run::RunStatus;

/// Outcome of a stage that did not succeed. Every variant is fatal to the run.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("checkout failed: {0}")]
    Checkout(String),
    #[error("build failed: {0}")]
    Build(String),
    #[error("static analysis failed: {0}")]
    Analysis(String),
    #[error("quality gate rejected project '{project}' (status {status})")]
    QualityGateRejected { project: String, status: String },
    #[error("no quality gate result for project '{project}' within {}s", timeout.as_secs())]
    QualityGateTimeout { project: String, timeout: Duration },
    #[error("deploy failed: {0}")]
    Deploy(String),
    #[error("step failed: {0}")]
    Step(String),
}

impl StageError {
    pub fn run_status(&self) -> RunStatus {
        match self {
            StageError::QualityGateRejected { .. } | StageError::QualityGateTimeout { .. } => {
                RunStatus::Aborted
            }
            _ => RunStatus::Failed,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StageError::Checkout(_) => "checkout",
            StageError::Build(_) => "build",
            StageError::Analysis(_) => "analysis",
            StageError::QualityGateRejected { .. } => "quality_gate_rejected",
            StageError::QualityGateTimeout { .. } => "quality_gate_timeout",
            StageError::Deploy(_) => "deploy",
            StageError::Step(_) => "step",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_errors_abort_the_run() {
        let rejected = StageError::QualityGateRejected {
            project: "app".into(),
            status: "ERROR".into(),
        };
        let timeout = StageError::QualityGateTimeout {
            project: "app".into(),
            timeout: Duration::from_secs(120),
        };
        assert_eq!(rejected.run_status(), RunStatus::Aborted);
        assert_eq!(timeout.run_status(), RunStatus::Aborted);
        assert_eq!(
            StageError::Build("exit 1".into()).run_status(),
            RunStatus::Failed
        );
        assert!(timeout.to_string().contains("120s"));
    }
}
