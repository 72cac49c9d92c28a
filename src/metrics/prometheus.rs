//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Sync handler invocations per controller
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "virtual_kubelet_reconciliations_total",
        "Total number of sync handler invocations",
        &["controller"]
    ).unwrap();

    /// Sync handler failures per controller
    pub static ref RECONCILIATION_ERRORS: CounterVec = register_counter_vec!(
        "virtual_kubelet_reconciliation_errors_total",
        "Total number of failed sync handler invocations",
        &["controller"]
    ).unwrap();

    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "virtual_kubelet_reconcile_duration_seconds",
        "Duration of sync handler invocations in seconds",
        &["controller"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    /// Keys waiting in each work queue
    pub static ref WORK_QUEUE_DEPTH: GaugeVec = register_gauge_vec!(
        "virtual_kubelet_work_queue_depth",
        "Number of keys waiting in the work queue",
        &["queue"]
    ).unwrap();

    pub static ref WORK_QUEUE_RETRIES: CounterVec = register_counter_vec!(
        "virtual_kubelet_work_queue_retries_total",
        "Total number of rate limited requeues",
        &["queue"]
    ).unwrap();

    /// Node heartbeats by result
    pub static ref NODE_HEARTBEATS: CounterVec = register_counter_vec!(
        "virtual_kubelet_node_heartbeats_total",
        "Total number of node status heartbeats",
        &["result"]
    ).unwrap();

    /// Node lease renewals by result
    pub static ref NODE_LEASE_RENEWALS: CounterVec = register_counter_vec!(
        "virtual_kubelet_node_lease_renewals_total",
        "Total number of node lease renewals",
        &["result"]
    ).unwrap();

    /// Pod status pushes by source
    pub static ref POD_STATUS_UPDATES: CounterVec = register_counter_vec!(
        "virtual_kubelet_pod_status_updates_total",
        "Total number of pod status updates sent to the control plane",
        &["source"]
    ).unwrap();

    /// Pods held by the resource manager
    pub static ref MANAGED_PODS: prometheus::Gauge = prometheus::register_gauge!(
        "virtual_kubelet_managed_pods",
        "Number of pods assigned to this node"
    ).unwrap();

    /// Engine health (1 = healthy, 0 = unhealthy)
    pub static ref ENGINE_HEALTH: prometheus::Gauge = prometheus::register_gauge!(
        "virtual_kubelet_health",
        "Engine health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();

    /// 1 once caches are synced and the dangling pod sweep has finished
    pub static ref ENGINE_READY: prometheus::Gauge = prometheus::register_gauge!(
        "virtual_kubelet_ready",
        "Engine readiness (1 = ready, 0 = starting)"
    ).unwrap();
}

/// Start the metrics HTTP server
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!("Error serving connection: {}", e);
            }
        });
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => metrics_response(),
        "/healthz" | "/health" => health_response(),
        "/readyz" | "/ready" => ready_response(),
        _ => not_found_response(),
    };

    Ok(response)
}

/// Plain response with a fixed status
fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

/// Generate metrics response
fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        );
    }

    let mut response = respond(StatusCode::OK, buffer);
    if let Ok(content_type) = HeaderValue::from_str(encoder.format_type()) {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    response
}

/// Health check response
fn health_response() -> Response<Full<Bytes>> {
    respond(StatusCode::OK, "ok")
}

/// Readiness check response, 503 until the engine reports ready
fn ready_response() -> Response<Full<Bytes>> {
    if ENGINE_READY.get() >= 1.0 {
        respond(StatusCode::OK, "ok")
    } else {
        respond(StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}

/// Not found response
fn not_found_response() -> Response<Full<Bytes>> {
    respond(StatusCode::NOT_FOUND, "Not Found")
}
