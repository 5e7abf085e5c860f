//! Aggregator HTTP API
//!
//! JSON over HTTP/1.1 using hyper:
//! - `POST /register` `{lot?}` → `{key}`
//! - `POST /assign`   `{key, lot}` → `{}`
//! - `POST /report`   `{key, enter?, exit?}` → `{}`
//! - `GET  /lots`     → `{lots: [...]}`
//! - `GET  /lots/{id}` → one lot
//! - `GET  /metrics`  → Prometheus text format
//! - `GET  /health`   → `ok`
//!
//! Known paths hit with the wrong method answer 405. Every request is
//! independent: a failing request never affects another one.

use crate::domain::types::{
    AssignRequest, DeltaEvent, DeviceKey, LotId, LotsResponse, RegisterRequest, RegisterResponse,
};
use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::services::aggregator::{IngestError, OccupancyAggregator};
use crate::services::registry::RegistryError;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Largest request body accepted
const MAX_BODY_BYTES: usize = 16 * 1024;

/// Request-level failures, each mapped to one HTTP status
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("method {0} not allowed")]
    MethodNotAllowed(Method),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),
    #[error("{0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::UnknownDevice(key) => ApiError::NotFound(format!("no such device {key}")),
            IngestError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnknownDevice(key) => {
                ApiError::NotFound(format!("no such device {key}"))
            }
            RegistryError::AlreadyAssigned { .. } => ApiError::Conflict(e.to_string()),
            RegistryError::KeySpaceExhausted(_) => ApiError::Internal(e.to_string()),
        }
    }
}

/// Shared state handed to every connection
pub struct ApiState {
    aggregator: Arc<OccupancyAggregator>,
    metrics: Arc<Metrics>,
    site_id: String,
}

impl ApiState {
    pub fn new(aggregator: Arc<OccupancyAggregator>, metrics: Arc<Metrics>, site_id: &str) -> Self {
        Self { aggregator, metrics, site_id: site_id.to_string() }
    }
}

type ApiResult = Result<Response<Full<Bytes>>, ApiError>;

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> ApiResult {
    let body = serde_json::to_vec(value).map_err(|e| ApiError::Internal(e.to_string()))?;
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

fn empty_object() -> ApiResult {
    json_response(StatusCode::OK, &serde_json::json!({}))
}

fn error_response(e: &ApiError) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": e.to_string() }).to_string();
    let mut builder = Response::builder()
        .status(e.status())
        .header("Content-Type", "application/json");
    if let ApiError::MethodNotAllowed(_) = e {
        builder = builder.header("Allow", "POST");
    }
    builder
        .body(Full::new(Bytes::from(body)))
        .expect("static response should not fail")
}

/// Read and deserialize a JSON body; an empty body yields `T::default()`
async fn read_json<T: DeserializeOwned + Default>(
    req: Request<hyper::body::Incoming>,
) -> Result<T, ApiError> {
    let bytes = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| {
            if e.downcast_ref::<LengthLimitError>().is_some() {
                ApiError::PayloadTooLarge(MAX_BODY_BYTES)
            } else {
                ApiError::BadRequest(e.to_string())
            }
        })?
        .to_bytes();

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(&bytes).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Like `read_json` but an empty body is an error
async fn read_required_json<T: DeserializeOwned>(
    req: Request<hyper::body::Incoming>,
) -> Result<T, ApiError> {
    let value: Option<T> = read_json::<OptionalBody<T>>(req).await?.0;
    value.ok_or_else(|| ApiError::BadRequest("missing request body".to_string()))
}

/// Wrapper giving any body type a `Default` of "absent"
struct OptionalBody<T>(Option<T>);

impl<T> Default for OptionalBody<T> {
    fn default() -> Self {
        Self(None)
    }
}

impl<'de, T: serde::Deserialize<'de>> serde::Deserialize<'de> for OptionalBody<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(|v| Self(Some(v)))
    }
}

async fn register(req: Request<hyper::body::Incoming>, state: &ApiState) -> ApiResult {
    let body: RegisterRequest = read_json(req).await?;
    let key = state.aggregator.registry().register(body.lot)?;
    state.metrics.record_registration();
    json_response(StatusCode::OK, &RegisterResponse { key })
}

async fn assign(req: Request<hyper::body::Incoming>, state: &ApiState) -> ApiResult {
    let body: AssignRequest = read_required_json(req).await?;
    state.aggregator.registry().assign(body.key, body.lot)?;
    state.metrics.record_assignment();
    empty_object()
}

/// `POST /report` body as received; the key is range-checked after parsing
#[derive(Deserialize)]
struct IncomingReport {
    key: i64,
    #[serde(default)]
    enter: Option<u32>,
    #[serde(default)]
    exit: Option<u32>,
}

async fn report(req: Request<hyper::body::Incoming>, state: &ApiState) -> ApiResult {
    let body: IncomingReport = read_required_json(req).await?;

    // A key outside the 31-bit space can never have been handed out
    let Some(key) = DeviceKey::from_wire(body.key) else {
        state.metrics.record_report_unknown();
        return Err(ApiError::NotFound(format!("no such device {}", body.key)));
    };
    let event = DeltaEvent::new(key, body.enter.unwrap_or(0), body.exit.unwrap_or(0));

    // Per-lot locks and the counter store are blocking
    let aggregator = state.aggregator.clone();
    tokio::task::spawn_blocking(move || aggregator.ingest(event))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    empty_object()
}

fn lots(state: &ApiState) -> ApiResult {
    let lots = state.aggregator.query(None)?;
    json_response(StatusCode::OK, &LotsResponse { lots })
}

fn lot(encoded: &str, state: &ApiState) -> ApiResult {
    let id = urlencoding::decode(encoded)
        .map_err(|e| ApiError::BadRequest(format!("invalid lot id encoding: {e}")))?;
    let lot_id = LotId::new(id);
    match state.aggregator.query_lot(&lot_id)? {
        Some(view) => json_response(StatusCode::OK, &view),
        None => Err(ApiError::NotFound(format!("no such lot {lot_id}"))),
    }
}

async fn route(req: Request<hyper::body::Incoming>, state: &ApiState) -> ApiResult {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (&method, path.as_str()) {
        (&Method::POST, "/register") => register(req, state).await,
        (&Method::POST, "/assign") => assign(req, state).await,
        (&Method::POST, "/report") => report(req, state).await,
        (_, "/register" | "/assign" | "/report") => {
            Err(ApiError::MethodNotAllowed(method.clone()))
        }
        (&Method::GET, "/lots") => lots(state),
        (&Method::GET, p) if p.starts_with("/lots/") && p.len() > "/lots/".len() => {
            lot(&p["/lots/".len()..], state)
        }
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(state)?;
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .map_err(|e| ApiError::Internal(e.to_string()))
        }
        (&Method::GET, "/health") => Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .expect("static response should not fail")),
        _ => Err(ApiError::NotFound(format!("no route for {method} {path}"))),
    }
}

/// Handle one HTTP request
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<ApiState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match route(req, &state).await {
        Ok(response) => {
            debug!(method = %method, path = %path, status = %response.status().as_u16(), "api_request");
            Ok(response)
        }
        Err(e) => {
            match &e {
                ApiError::Internal(_) => {
                    error!(method = %method, path = %path, error = %e, "api_request_failed")
                }
                ApiError::BadRequest(_)
                | ApiError::PayloadTooLarge(_)
                | ApiError::MethodNotAllowed(_) => {
                    state.metrics.record_rejected();
                    warn!(method = %method, path = %path, error = %e, "api_request_rejected")
                }
                ApiError::NotFound(_) | ApiError::Conflict(_) => {
                    info!(method = %method, path = %path, error = %e, "api_request_refused")
                }
            }
            Ok(error_response(&e))
        }
    }
}

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Escape a label value for the text exposition format
fn escape_label(value: &str) -> Cow<'_, str> {
    if !value.contains(['\\', '"', '\n']) {
        return Cow::Borrowed(value);
    }
    let mut escaped = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, site: &str, val: u64) {
    let site = escape_label(site);
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    sum: u64,
) {
    let site = escape_label(site);
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {cumulative}");
}

fn write_counters(output: &mut String, site: &str, summary: &MetricsSummary) {
    let counters = [
        ("occupancy_registrations_total", "Devices registered", summary.registrations_total),
        ("occupancy_assignments_total", "Devices assigned to a lot", summary.assignments_total),
        ("occupancy_reports_total", "Reports applied to a lot", summary.reports_applied),
        ("occupancy_reports_unknown_total", "Reports for unknown devices", summary.reports_unknown),
        (
            "occupancy_reports_unassigned_total",
            "Reports from devices without a lot",
            summary.reports_unassigned,
        ),
        ("occupancy_requests_rejected_total", "Malformed or wrong-method requests", summary.requests_rejected),
        ("occupancy_enter_total", "Vehicle entries reported", summary.enter_total),
        ("occupancy_exit_total", "Vehicle exits reported", summary.exit_total),
    ];
    for (name, help, val) in counters {
        write_metric(output, name, help, MetricType::Counter, site, val);
    }
}

fn write_lot_gauges(output: &mut String, site: &str, state: &ApiState) -> Result<(), ApiError> {
    let _ = writeln!(output, "# HELP occupancy_lot_cars Current car count per lot");
    let _ = writeln!(output, "# TYPE occupancy_lot_cars gauge");
    let site = escape_label(site);
    for lot in state.aggregator.query_all()? {
        let _ = writeln!(
            output,
            "occupancy_lot_cars{{site=\"{site}\",lot=\"{}\"}} {}",
            escape_label(lot.id.as_str()),
            lot.car_count
        );
    }
    Ok(())
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(state: &ApiState) -> Result<String, ApiError> {
    let summary = state.metrics.report();
    let site = state.site_id.as_str();
    let mut output = String::with_capacity(4096);

    write_counters(&mut output, site, &summary);
    write_histogram(
        &mut output,
        "occupancy_ingest_latency_us",
        "Report ingest latency in microseconds",
        site,
        &summary.lat_buckets,
        summary.lat_sum_us,
    );
    write_metric(
        &mut output,
        "occupancy_ingest_latency_max_us",
        "Maximum report ingest latency",
        MetricType::Gauge,
        site,
        summary.lat_max_us,
    );
    write_lot_gauges(&mut output, site, state)?;

    Ok(output)
}

/// Serve the API on an already-bound listener until shutdown
pub async fn serve(
    listener: TcpListener,
    state: Arc<ApiState>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, site = %state.site_id, "api_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, state).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                debug!(peer = %peer, error = %e, "api_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "api_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("api_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

/// Bind `addr` and serve until shutdown
pub async fn start_api_server(
    addr: SocketAddr,
    state: Arc<ApiState>,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state, shutdown).await
}
