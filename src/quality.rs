use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Passed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateCondition {
    pub metric: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<String>,
}

/// Verdict delivered by the analysis server for one project.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityGateResult {
    pub project_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub status: GateStatus,
    /// Raw gate status as reported (`OK`, `ERROR`, `NONE`, ...).
    pub gate_status: String,
    pub analysed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_conditions: Vec<GateCondition>,
}

impl QualityGateResult {
    pub fn passed(&self) -> bool {
        self.status == GateStatus::Passed
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload {
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    analysed_at: Option<String>,
    project: ProjectPayload,
    #[serde(default)]
    quality_gate: Option<GatePayload>,
}

#[derive(Debug, Deserialize)]
struct ProjectPayload {
    key: String,
}

#[derive(Debug, Deserialize)]
struct GatePayload {
    status: String,
    #[serde(default)]
    conditions: Vec<ConditionPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConditionPayload {
    metric: String,
    status: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    error_threshold: Option<String>,
}

/// Parse the JSON body SonarQube posts to its configured webhooks.
///
/// The gate passes only when the analysis task succeeded and the gate status is
/// `OK`. A payload without a gate section counts as `NONE` and fails.
pub fn parse_webhook(body: &[u8]) -> Result<QualityGateResult> {
    let payload: WebhookPayload =
        serde_json::from_slice(body).context("Invalid quality gate webhook payload")?;

    let task_ok = payload
        .status
        .as_deref()
        .map(|status| status.eq_ignore_ascii_case("SUCCESS"))
        .unwrap_or(true);
    let (gate_status, conditions) = match payload.quality_gate {
        Some(gate) => (gate.status, gate.conditions),
        None => ("NONE".to_string(), Vec::new()),
    };
    let status = if task_ok && gate_status.eq_ignore_ascii_case("OK") {
        GateStatus::Passed
    } else {
        GateStatus::Failed
    };

    let failed_conditions = conditions
        .into_iter()
        .filter(|condition| !condition.status.eq_ignore_ascii_case("OK"))
        .map(|condition| GateCondition {
            metric: condition.metric,
            status: condition.status,
            value: condition.value,
            threshold: condition.error_threshold,
        })
        .collect();

    Ok(QualityGateResult {
        project_key: payload.project.key,
        task_id: payload.task_id,
        status,
        gate_status,
        analysed_at: payload
            .analysed_at
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now),
        failed_conditions,
    })
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%z")
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to a stage that was already waiting.
    Delivered,
    /// Held until a stage asks for it.
    Stored,
}

enum Slot {
    Waiting(Sender<QualityGateResult>),
    Ready(QualityGateResult),
}

/// Rendezvous between the webhook listener and quality gate stages.
///
/// Each result is consumed exactly once, by the first wait on its project key.
#[derive(Default)]
pub struct GateBoard {
    slots: Mutex<HashMap<String, Slot>>,
}

impl GateBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop any result held for `project_key` from an earlier analysis.
    pub fn reset(&self, project_key: &str) {
        let mut slots = self.slots();
        if matches!(slots.get(project_key), Some(Slot::Ready(_))) {
            slots.remove(project_key);
            debug!(project = project_key, "Discarded stale quality gate result");
        }
    }

    pub fn deliver(&self, result: QualityGateResult) -> Delivery {
        let mut slots = self.slots();
        let key = result.project_key.clone();
        let result = match slots.remove(&key) {
            Some(Slot::Waiting(sender)) => match sender.send(result) {
                Ok(()) => {
                    info!(project = key.as_str(), "Quality gate result delivered");
                    return Delivery::Delivered;
                }
                Err(err) => err.0,
            },
            _ => result,
        };
        info!(project = key.as_str(), "Quality gate result stored");
        slots.insert(key, Slot::Ready(result));
        Delivery::Stored
    }

    /// Block until a result for `project_key` arrives or `timeout` elapses.
    pub fn wait(&self, project_key: &str, timeout: Duration) -> Option<QualityGateResult> {
        let receiver = {
            let mut slots = self.slots();
            if matches!(slots.get(project_key), Some(Slot::Ready(_)))
                && let Some(Slot::Ready(result)) = slots.remove(project_key)
            {
                return Some(result);
            }
            let (sender, receiver) = mpsc::channel();
            slots.insert(project_key.to_string(), Slot::Waiting(sender));
            receiver
        };

        match receiver.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                let mut slots = self.slots();
                match slots.remove(project_key) {
                    Some(Slot::Waiting(_)) => None,
                    Some(ready @ Slot::Ready(_)) => {
                        slots.insert(project_key.to_string(), ready);
                        None
                    }
                    None => receiver.try_recv().ok(),
                }
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| matches!(slot, Slot::Waiting(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const PASSING: &str = r#"{
        "serverUrl": "http://localhost:9000",
        "taskId": "AVh21JS2JepAEhwQ-b3u",
        "status": "SUCCESS",
        "analysedAt": "2016-11-18T10:46:28+0100",
        "project": {"key": "two-tier-backend", "name": "Backend"},
        "qualityGate": {
            "name": "Sonar way",
            "status": "OK",
            "conditions": [
                {"metric": "new_coverage", "operator": "LESS_THAN", "value": "85.0", "status": "OK", "errorThreshold": "80"}
            ]
        }
    }"#;

    fn result(project: &str, status: GateStatus) -> QualityGateResult {
        QualityGateResult {
            project_key: project.into(),
            task_id: None,
            status,
            gate_status: if status == GateStatus::Passed { "OK" } else { "ERROR" }.into(),
            analysed_at: Utc::now(),
            failed_conditions: Vec::new(),
        }
    }

    #[test]
    fn parses_sonarqube_payload() {
        let parsed = parse_webhook(PASSING.as_bytes()).unwrap();
        assert!(parsed.passed());
        assert_eq!(parsed.project_key, "two-tier-backend");
        assert_eq!(parsed.task_id.as_deref(), Some("AVh21JS2JepAEhwQ-b3u"));
        assert_eq!(parsed.analysed_at.to_rfc3339(), "2016-11-18T09:46:28+00:00");
        assert!(parsed.failed_conditions.is_empty());
    }

    #[test]
    fn failed_gate_keeps_failing_conditions() {
        let body = r#"{
            "taskId": "AVh21JS2JepAEhwQ-b3v",
            "status": "SUCCESS",
            "analysedAt": "2024-03-01T08:00:00Z",
            "project": {"key": "two-tier-backend"},
            "qualityGate": {
                "status": "ERROR",
                "conditions": [
                    {"metric": "new_coverage", "value": "12.0", "status": "ERROR", "errorThreshold": "80"},
                    {"metric": "new_bugs", "value": "0", "status": "OK", "errorThreshold": "0"}
                ]
            }
        }"#;
        let parsed = parse_webhook(body.as_bytes()).unwrap();
        assert_eq!(parsed.status, GateStatus::Failed);
        assert_eq!(parsed.gate_status, "ERROR");
        assert_eq!(parsed.failed_conditions.len(), 1);
        assert_eq!(parsed.failed_conditions[0].metric, "new_coverage");
        assert_eq!(parsed.failed_conditions[0].threshold.as_deref(), Some("80"));
    }

    #[test]
    fn missing_gate_or_failed_task_fails() {
        let no_gate = r#"{"status": "SUCCESS", "project": {"key": "p"}}"#;
        let parsed = parse_webhook(no_gate.as_bytes()).unwrap();
        assert_eq!(parsed.gate_status, "NONE");
        assert!(!parsed.passed());

        let failed_task =
            r#"{"status": "FAILED", "project": {"key": "p"}, "qualityGate": {"status": "OK"}}"#;
        assert!(!parse_webhook(failed_task.as_bytes()).unwrap().passed());
        assert!(parse_webhook(b"not json").is_err());
    }

    #[test]
    fn early_result_is_held_for_the_next_wait() {
        let board = GateBoard::new();
        assert_eq!(
            board.deliver(result("app", GateStatus::Passed)),
            Delivery::Stored
        );
        let received = board.wait("app", Duration::from_millis(10)).unwrap();
        assert!(received.passed());
        assert!(board.wait("app", Duration::from_millis(10)).is_none());
    }

    #[test]
    fn reset_discards_stale_result() {
        let board = GateBoard::new();
        board.deliver(result("app", GateStatus::Failed));
        board.reset("app");
        assert!(board.wait("app", Duration::from_millis(10)).is_none());
        assert_eq!(board.pending(), 0);
    }

    #[test]
    fn waiter_receives_result_from_another_thread() {
        let board = Arc::new(GateBoard::new());
        let waiter = {
            let board = board.clone();
            thread::spawn(move || board.wait("app", Duration::from_secs(5)))
        };
        while board.pending() == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(
            board.deliver(result("app", GateStatus::Failed)),
            Delivery::Delivered
        );
        let received = waiter.join().unwrap().unwrap();
        assert_eq!(received.status, GateStatus::Failed);
    }
}
