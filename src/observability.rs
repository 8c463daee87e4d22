use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::run::RunStatus;

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
    pub quality_passes: u64,
    pub quality_failures: u64,
    pub quality_timeouts: u64,
    pub webhooks_received: u64,
    pub runs: RunCounters,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub failures: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct RunCounters {
    pub success: u64,
    pub failed: u64,
    pub aborted: u64,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsSnapshot::default())),
        }
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            failed: false,
            recorded: false,
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms = duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn record_quality_pass(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.quality_passes += 1;
        }
    }

    pub fn record_quality_failure(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.quality_failures += 1;
        }
    }

    pub fn record_quality_timeout(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.quality_timeouts += 1;
        }
    }

    pub fn record_webhook(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.webhooks_received += 1;
        }
    }

    pub fn record_run(&self, status: RunStatus) {
        if let Ok(mut guard) = self.inner.lock() {
            match status {
                RunStatus::Success => guard.runs.success += 1,
                RunStatus::Failed => guard.runs.failed += 1,
                RunStatus::Aborted => guard.runs.aborted += 1,
                RunStatus::Running => {}
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    failed: bool,
    recorded: bool,
}

impl StageTimer {
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration = self.started_at.elapsed();
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            if self.failed {
                metrics.failures += 1;
            }
            let duration_ms = duration.as_secs_f64() * 1_000.0;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            stage = self.stage.as_str(),
            duration_ms = duration.as_secs_f64() * 1_000.0,
            "Stage duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        stage_count = snapshot.stages.len(),
        quality_passes = snapshot.quality_passes,
        quality_failures = snapshot.quality_failures,
        quality_timeouts = snapshot.quality_timeouts,
        webhooks_received = snapshot.webhooks_received,
        "Pipeline metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            failures = metrics.failures,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        counter(
            &mut output,
            "gatehouse_quality_passes_total",
            "Total number of quality gate passes",
            self.quality_passes,
        );
        counter(
            &mut output,
            "gatehouse_quality_failures_total",
            "Total number of quality gate rejections",
            self.quality_failures,
        );
        counter(
            &mut output,
            "gatehouse_quality_timeouts_total",
            "Quality gate waits that ran out of time",
            self.quality_timeouts,
        );
        counter(
            &mut output,
            "gatehouse_webhooks_received_total",
            "Quality gate webhook deliveries accepted",
            self.webhooks_received,
        );

        output.push_str("# HELP gatehouse_runs_total Pipeline runs by terminal status\n");
        output.push_str("# TYPE gatehouse_runs_total counter\n");
        for (status, value) in [
            ("success", self.runs.success),
            ("failed", self.runs.failed),
            ("aborted", self.runs.aborted),
        ] {
            output.push_str(&format!(
                "gatehouse_runs_total{{status=\"{status}\"}} {value}\n"
            ));
        }

        output.push_str("# HELP gatehouse_stage_calls_total Stage invocation count\n");
        output.push_str("# TYPE gatehouse_stage_calls_total counter\n");
        output.push_str("# HELP gatehouse_stage_failures_total Stage failure count\n");
        output.push_str("# TYPE gatehouse_stage_failures_total counter\n");
        output.push_str(
            "# HELP gatehouse_stage_duration_seconds_total Accumulated stage duration in seconds\n",
        );
        output.push_str("# TYPE gatehouse_stage_duration_seconds_total counter\n");
        output.push_str(
            "# HELP gatehouse_stage_duration_seconds_max Maximum stage duration in seconds\n",
        );
        output.push_str("# TYPE gatehouse_stage_duration_seconds_max gauge\n");
        for (stage, metrics) in &self.stages {
            let label = escape_label(stage);
            output.push_str(&format!(
                "gatehouse_stage_calls_total{{stage=\"{}\"}} {}\n",
                label, metrics.calls
            ));
            output.push_str(&format!(
                "gatehouse_stage_failures_total{{stage=\"{}\"}} {}\n",
                label, metrics.failures
            ));
            output.push_str(&format!(
                "gatehouse_stage_duration_seconds_total{{stage=\"{}\"}} {:.6}\n",
                label,
                metrics.total_duration_ms / 1_000.0
            ));
            output.push_str(&format!(
                "gatehouse_stage_duration_seconds_max{{stage=\"{}\"}} {:.6}\n",
                label,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output.push_str("# HELP gatehouse_pipeline_duration_seconds Duration of the last run\n");
        output.push_str("# TYPE gatehouse_pipeline_duration_seconds gauge\n");
        output.push_str(&format!(
            "gatehouse_pipeline_duration_seconds {:.6}\n",
            self.total_duration_ms / 1_000.0
        ));
        output
    }
}

fn counter(output: &mut String, name: &str, help: &str, value: u64) {
    output.push_str(&format!("# HELP {name} {help}\n"));
    output.push_str(&format!("# TYPE {name} counter\n"));
    output.push_str(&format!("{name} {value}\n"));
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
