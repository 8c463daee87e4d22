use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;

use anyhow::{Context, Result, anyhow};
use hyper::body::{Bytes, HttpBody};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::observability::MetricsCollector;
use crate::quality::{GateBoard, parse_webhook};

pub const WEBHOOK_PATH: &str = "/sonarqube-webhook/";
pub const MAX_WEBHOOK_BYTES: usize = 1024 * 1024;

struct ListenerState {
    gates: Arc<GateBoard>,
    metrics: MetricsCollector,
}

/// HTTP listener receiving quality gate callbacks and serving metrics.
///
/// Runs on its own thread with a current-thread tokio runtime; dropping it
/// shuts the server down.
pub struct WebhookListener {
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    address: SocketAddr,
}

impl WebhookListener {
    pub fn start(
        listen: SocketAddr,
        gates: Arc<GateBoard>,
        metrics: MetricsCollector,
    ) -> Result<Self> {
        let socket = TcpListener::bind(listen)
            .with_context(|| format!("Failed to bind webhook listener on {listen}"))?;
        socket
            .set_nonblocking(true)
            .context("Failed to configure webhook listener socket")?;
        let address = socket.local_addr().unwrap_or(listen);

        let (tx, rx) = oneshot::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<(), String>>();
        let state = Arc::new(ListenerState { gates, metrics });

        let thread = std::thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    let _ = ready_tx.send(Err(format!("failed to build listener runtime: {err}")));
                    return;
                }
            };

            runtime.block_on(async move {
                let make_svc = make_service_fn(move |_| {
                    let state = state.clone();
                    async move {
                        Ok::<_, hyper::Error>(service_fn(move |req| {
                            let state = state.clone();
                            async move { handle_request(req, state).await }
                        }))
                    }
                });

                let builder = match hyper::Server::from_tcp(socket) {
                    Ok(builder) => builder,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err.to_string()));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                let server = builder.serve(make_svc);
                let graceful = server.with_graceful_shutdown(async move {
                    let _ = rx.await;
                });

                if let Err(err) = graceful.await {
                    tracing::error!(error = %err, "Webhook listener error");
                }
            });
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Err(anyhow!("Webhook listener failed to start: {reason}")),
            Err(_) => return Err(anyhow!("Webhook listener thread exited during startup")),
        }

        info!(address = %address, path = WEBHOOK_PATH, "Webhook listener started");
        Ok(Self {
            shutdown_tx: Some(tx),
            thread: Some(thread),
            address,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WebhookListener {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle_request(
    req: Request<Body>,
    state: Arc<ListenerState>,
) -> Result<Response<Body>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    match (&method, path.as_str()) {
        (&Method::POST, WEBHOOK_PATH) | (&Method::POST, "/sonarqube-webhook") => {
            match read_limited(req.into_body(), MAX_WEBHOOK_BYTES).await? {
                Some(body) => Ok(accept_webhook(&body, &state)),
                None => {
                    warn!(limit = MAX_WEBHOOK_BYTES, "Rejected oversized webhook");
                    Ok(text(StatusCode::PAYLOAD_TOO_LARGE, "payload too large"))
                }
            }
        }
        (&Method::GET, "/healthz") => Ok(text(StatusCode::OK, "ok")),
        (&Method::GET, "/metrics") => {
            let body = state.metrics.snapshot().to_prometheus();
            Ok(text(StatusCode::OK, body))
        }
        (&Method::GET, "/metrics.json") => {
            let snapshot = state.metrics.snapshot();
            let body = serde_json::to_vec(&snapshot).unwrap_or_else(|_| b"{}".to_vec());
            Ok(json(StatusCode::OK, body))
        }
        _ => Ok(text(StatusCode::NOT_FOUND, Bytes::from_static(b"Not Found"))),
    }
}

/// Collect `body`, giving up with `None` once it exceeds `limit` bytes.
async fn read_limited(mut body: Body, limit: usize) -> Result<Option<Vec<u8>>, hyper::Error> {
    if body.size_hint().lower() > limit as u64 {
        return Ok(None);
    }
    let mut collected = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        if collected.len() + chunk.len() > limit {
            return Ok(None);
        }
        collected.extend_from_slice(&chunk);
    }
    Ok(Some(collected))
}

fn accept_webhook(body: &[u8], state: &ListenerState) -> Response<Body> {
    match parse_webhook(body) {
        Ok(result) => {
            state.metrics.record_webhook();
            info!(
                project = result.project_key.as_str(),
                gate_status = result.gate_status.as_str(),
                task_id = result.task_id.as_deref().unwrap_or("-"),
                "Quality gate webhook received"
            );
            let delivery = state.gates.deliver(result);
            let body = serde_json::json!({
                "accepted": true,
                "delivery": format!("{delivery:?}").to_lowercase(),
            });
            json(StatusCode::OK, body.to_string().into_bytes())
        }
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Rejected malformed webhook");
            text(StatusCode::BAD_REQUEST, format!("{err:#}"))
        }
    }
}

fn text(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}

fn json(status: StatusCode, body: Vec<u8>) -> Response<Body> {
    let mut response = text(status, body);
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}
