use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

use crate::error::StageError;
use crate::naming::{ContainerScope, ResourceNamer};
use crate::observability::MetricsCollector;
use crate::process::{CommandOutput, CommandRunner, Invocation};
use crate::quality::{GateBoard, QualityGateResult};
use crate::run::{PipelineRun, StageRecord, StageStatus};

const LOG_TAIL_LINES: usize = 200;

pub type StageParameters = Map<String, Value>;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageSpec {
    /// Display name; defaults to the stage kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_abort_on_failure")]
    pub abort_on_failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<StageParameters>,
}

fn default_abort_on_failure() -> bool {
    true
}

impl StageSpec {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            name: None,
            stage: stage.into(),
            timeout_secs: None,
            abort_on_failure: true,
            params: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.stage)
    }
}

/// Everything a stage may touch while it runs.
pub struct StageContext<'a> {
    pub run_id: Uuid,
    pub workspace: &'a Path,
    pub timeout: Option<Duration>,
    pub runner: &'a dyn CommandRunner,
    pub gates: &'a GateBoard,
    pub naming: &'a ResourceNamer,
}

impl StageContext<'_> {
    pub fn resolve(&self, relative: Option<&str>) -> PathBuf {
        match relative {
            Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(dir),
            Some(dir) => self.workspace.join(dir),
            None => self.workspace.to_path_buf(),
        }
    }

    /// Run `invocation`, appending its output to `report`. The output is
    /// returned whatever the exit status; `Err` means it could not be spawned.
    pub fn run_command(
        &self,
        report: &mut StageReport,
        invocation: &Invocation,
    ) -> std::result::Result<CommandOutput, String> {
        let command_line = invocation.display();
        info!(command = %command_line, "Running command");
        report.line(format!("$ {command_line}"));
        let output = self
            .runner
            .run(invocation)
            .map_err(|err| invocation.redact(&format!("{err:#}")))?;
        report.extend(output.tail(LOG_TAIL_LINES));
        Ok(output)
    }

    /// Like [`StageContext::run_command`], but a non-zero exit or a timeout is
    /// an `Err` describing the failure. The stage timeout applies unless the
    /// invocation sets its own.
    pub fn execute(
        &self,
        report: &mut StageReport,
        invocation: Invocation,
    ) -> std::result::Result<CommandOutput, String> {
        let limit = invocation.timeout.or(self.timeout);
        let invocation = invocation.timeout(limit);
        let output = self.run_command(report, &invocation)?;
        if output.success() {
            Ok(output)
        } else {
            Err(format!(
                "`{}` {}",
                invocation.display(),
                output.describe_failure()
            ))
        }
    }
}

/// Diagnostics a stage leaves behind, kept whether or not it succeeds.
#[derive(Debug, Default)]
pub struct StageReport {
    pub log: Vec<String>,
    pub gate: Option<QualityGateResult>,
}

impl StageReport {
    pub fn line(&mut self, line: impl Into<String>) {
        self.log.push(line.into());
        self.trim();
    }

    pub fn extend(&mut self, lines: Vec<String>) {
        self.log.extend(lines);
        self.trim();
    }

    fn trim(&mut self) {
        if self.log.len() > LOG_TAIL_LINES {
            let excess = self.log.len() - LOG_TAIL_LINES;
            self.log.drain(..excess);
        }
    }
}

pub trait Stage: Send + Sync {
    fn kind(&self) -> &'static str;
    fn run(
        &self,
        ctx: &StageContext<'_>,
        report: &mut StageReport,
    ) -> std::result::Result<(), StageError>;
}

type StageConstructor = Arc<dyn Fn(StageParameters) -> Result<Box<dyn Stage>> + Send + Sync>;

pub struct StageRegistry {
    factories: HashMap<String, StageConstructor>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(StageParameters) -> Result<Box<dyn Stage>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(constructor));
    }

    pub fn create(&self, name: &str, params: StageParameters) -> Result<Box<dyn Stage>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            anyhow!(
                "Unknown stage '{}'. Available stages: {}",
                name,
                self.known_stages().join(", ")
            )
        })?;
        factory(params)
    }

    pub fn known_stages(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

struct PlannedStage {
    name: String,
    timeout: Option<Duration>,
    stage: Box<dyn Stage>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub name: String,
    pub workspace: PathBuf,
    pub container_scope: ContainerScope,
}

pub struct PipelineExecutor {
    stages: Vec<PlannedStage>,
    settings: PipelineSettings,
    runner: Arc<dyn CommandRunner>,
    gates: Arc<GateBoard>,
    metrics: MetricsCollector,
}

impl PipelineExecutor {
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|planned| planned.name.as_str()).collect()
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    pub fn execute(&self) -> PipelineRun {
        self.execute_as(Uuid::new_v4())
    }

    /// Run every stage in order, stopping at the first failure. Side effects of
    /// stages that already completed are left in place.
    pub fn execute_as(&self, run_id: Uuid) -> PipelineRun {
        let naming = ResourceNamer::new(self.settings.container_scope, run_id);
        let mut run = PipelineRun::start(run_id, &self.settings.name, self.stages.len());
        let run_span = info_span!("run", pipeline = self.settings.name.as_str(), run_id = %run_id);
        let _run_guard = run_span.enter();
        let total_start = Instant::now();
        info!(stages = self.stages.len(), "Pipeline run started");

        for (index, planned) in self.stages.iter().enumerate() {
            let kind = planned.stage.kind();
            let span = info_span!("stage", stage = planned.name.as_str(), kind);
            let _span_guard = span.enter();
            let mut timer = self.metrics.start_stage(&planned.name);

            let ctx = StageContext {
                run_id,
                workspace: &self.settings.workspace,
                timeout: planned.timeout,
                runner: self.runner.as_ref(),
                gates: self.gates.as_ref(),
                naming: &naming,
            };
            let mut report = StageReport::default();
            let started_at = Utc::now();
            let clock = Instant::now();
            info!("Stage started");
            let outcome = planned.stage.run(&ctx, &mut report);
            let duration_ms = clock.elapsed().as_secs_f64() * 1_000.0;

            if let Some(gate) = report.gate.take() {
                if gate.passed() {
                    self.metrics.record_quality_pass();
                } else {
                    self.metrics.record_quality_failure();
                }
                run.quality_gate = Some(gate);
            }

            let record = StageRecord {
                name: planned.name.clone(),
                kind: kind.to_string(),
                status: StageStatus::Succeeded,
                started_at: Some(started_at),
                duration_ms,
                log: report.log,
                error: None,
            };

            match outcome {
                Ok(()) => {
                    info!(duration_ms, "Stage succeeded");
                    run.complete_stage(record);
                }
                Err(err) => {
                    timer.mark_failed();
                    if matches!(err, StageError::QualityGateTimeout { .. }) {
                        self.metrics.record_quality_timeout();
                    }
                    error!(error = %err, error_kind = err.kind(), duration_ms, "Stage failed");
                    for line in &record.log {
                        warn!(stage = planned.name.as_str(), "{line}");
                    }
                    run.terminate(record, &err);
                    for skipped in &self.stages[index + 1..] {
                        run.push_skipped(StageRecord::skipped(&skipped.name, skipped.stage.kind()));
                    }
                    break;
                }
            }
        }

        self.metrics.record_total_duration(total_start.elapsed());
        self.metrics.record_run(run.status);
        info!(
            status = run.status.as_str(),
            completed = run.cursor,
            total = run.stage_count,
            "Pipeline run finished"
        );
        run
    }
}

pub fn build_pipeline(
    stage_registry: &StageRegistry,
    stage_specs: &[StageSpec],
    settings: PipelineSettings,
    runner: Arc<dyn CommandRunner>,
    gates: Arc<GateBoard>,
) -> Result<PipelineExecutor> {
    if stage_specs.is_empty() {
        bail!("Pipeline must contain at least one stage");
    }

    let mut stages = Vec::with_capacity(stage_specs.len());
    for spec in stage_specs {
        if !spec.abort_on_failure {
            bail!(
                "Stage '{}' sets abort_on_failure: false, which is not supported",
                spec.display_name()
            );
        }
        if spec.timeout_secs == Some(0) {
            bail!("Stage '{}' has a zero timeout", spec.display_name());
        }
        let params = spec.params.clone().unwrap_or_default();
        let stage = stage_registry.create(&spec.stage, params)?;
        stages.push(PlannedStage {
            name: spec.display_name().to_string(),
            timeout: spec.timeout_secs.map(Duration::from_secs),
            stage,
        });
    }

    Ok(PipelineExecutor {
        stages,
        settings,
        runner,
        gates,
        metrics: MetricsCollector::new(),
    })
}
