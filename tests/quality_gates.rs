use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gatehouse::listener::{MAX_WEBHOOK_BYTES, WEBHOOK_PATH, WebhookListener};
use gatehouse::observability::MetricsCollector;
use gatehouse::quality::{GateBoard, GateStatus};

const PASSING: &str = r#"{
    "serverUrl": "http://localhost:9000",
    "taskId": "AVh21JS2JepAEhwQ-b3u",
    "status": "SUCCESS",
    "analysedAt": "2024-05-01T10:00:00+0000",
    "project": {"key": "two-tier-backend", "name": "Backend"},
    "qualityGate": {
        "name": "Sonar way",
        "status": "OK",
        "conditions": [
            {"metric": "new_coverage", "operator": "LESS_THAN", "value": "91.2", "status": "OK", "errorThreshold": "80"}
        ]
    }
}"#;

fn start_listener(gates: Arc<GateBoard>, metrics: MetricsCollector) -> WebhookListener {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    WebhookListener::start(addr, gates, metrics).unwrap()
}

fn request(addr: SocketAddr, method: &str, path: &str, body: &str) -> String {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    write!(
        stream,
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
    .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    response
}

#[test]
fn webhook_wakes_waiting_stage() {
    let gates = Arc::new(GateBoard::new());
    let metrics = MetricsCollector::new();
    let mut listener = start_listener(gates.clone(), metrics.clone());

    let waiter = {
        let gates = gates.clone();
        thread::spawn(move || gates.wait("two-tier-backend", Duration::from_secs(5)))
    };
    thread::sleep(Duration::from_millis(100));

    let response = request(listener.address(), "POST", WEBHOOK_PATH, PASSING);
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("\"accepted\":true"));

    let result = waiter.join().unwrap().expect("gate result delivered");
    assert_eq!(result.status, GateStatus::Passed);
    assert_eq!(result.task_id.as_deref(), Some("AVh21JS2JepAEhwQ-b3u"));
    assert!(result.failed_conditions.is_empty());
    assert_eq!(metrics.snapshot().webhooks_received, 1);

    listener.stop();
}

#[test]
fn early_webhook_is_stored_until_someone_waits() {
    let gates = Arc::new(GateBoard::new());
    let listener = start_listener(gates.clone(), MetricsCollector::new());

    let response = request(listener.address(), "POST", "/sonarqube-webhook", PASSING);
    assert!(response.contains("\"delivery\":\"stored\""), "{response}");

    let result = gates.wait("two-tier-backend", Duration::from_millis(10));
    assert!(result.is_some_and(|gate| gate.passed()));
    assert!(gates.wait("two-tier-backend", Duration::from_millis(10)).is_none());
}

#[test]
fn malformed_webhook_is_rejected() {
    let gates = Arc::new(GateBoard::new());
    let metrics = MetricsCollector::new();
    let listener = start_listener(gates.clone(), metrics.clone());

    let response = request(listener.address(), "POST", WEBHOOK_PATH, "{\"project\": 42");
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    assert!(gates.wait("two-tier-backend", Duration::from_millis(10)).is_none());
    assert_eq!(metrics.snapshot().webhooks_received, 0);
}

#[test]
fn serves_health_and_metrics() {
    let metrics = MetricsCollector::new();
    metrics.record_quality_pass();
    let listener = start_listener(Arc::new(GateBoard::new()), metrics);

    let health = request(listener.address(), "GET", "/healthz", "");
    assert!(health.starts_with("HTTP/1.1 200"));
    assert!(health.ends_with("ok"));

    let prometheus = request(listener.address(), "GET", "/metrics", "");
    assert!(prometheus.contains("gatehouse_quality_passes_total 1"), "{prometheus}");

    let json = request(listener.address(), "GET", "/metrics.json", "");
    assert!(json.contains("\"quality_passes\":1"), "{json}");

    let missing = request(listener.address(), "GET", "/nope", "");
    assert!(missing.starts_with("HTTP/1.1 404"));
}

#[test]
fn binding_a_taken_port_fails() {
    let first = start_listener(Arc::new(GateBoard::new()), MetricsCollector::new());
    let second = WebhookListener::start(
        first.address(),
        Arc::new(GateBoard::new()),
        MetricsCollector::new(),
    );
    assert!(second.is_err());
}

#[test]
fn oversized_webhook_is_refused_before_reading_the_body() {
    let gates = Arc::new(GateBoard::new());
    let listener = start_listener(gates.clone(), MetricsCollector::new());

    let mut stream = TcpStream::connect(listener.address()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    write!(
        stream,
        "POST {WEBHOOK_PATH} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{{",
        MAX_WEBHOOK_BYTES + 1
    )
    .unwrap();
    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response);
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 413"), "{response}");
    assert!(gates.wait("two-tier-backend", Duration::from_millis(10)).is_none());
}
