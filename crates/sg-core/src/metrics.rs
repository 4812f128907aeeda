use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tower::{Layer, Service};

pub const RESULT_SUCCESS: &str = "success";
pub const RESULT_ERROR: &str = "error";
pub const RESULT_SKIPPED: &str = "skipped";

struct Metrics {
    registry: Registry,
    sg_up: IntGaugeVec,
    http_requests_total: IntCounterVec,
    http_request_duration_seconds: HistogramVec,
    archive_requests_total: IntCounterVec,
    archive_builds_total: IntCounterVec,
    archive_build_duration_seconds: HistogramVec,
    build_requests_dropped_total: IntCounterVec,
    stale_archives_reoffered_total: IntCounterVec,
    archives_failed_total: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let registry = Registry::new();

        let sg_up = IntGaugeVec::new(Opts::new("sg_up", "Service health"), &["service"])
            .expect("sg_up metric");

        let http_requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "HTTP request count"),
            &["service", "route", "method", "status"],
        )
        .expect("http_requests_total metric");

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["service", "route", "method", "status"],
        )
        .expect("http_request_duration_seconds metric");

        let archive_requests_total = IntCounterVec::new(
            Opts::new(
                "archive_requests_total",
                "Archive requests by archive type and outcome",
            ),
            &["service", "type", "result"],
        )
        .expect("archive_requests_total metric");

        let archive_builds_total = IntCounterVec::new(
            Opts::new("archive_builds_total", "Archive build outcomes"),
            &["service", "result"],
        )
        .expect("archive_builds_total metric");

        let archive_build_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "archive_build_duration_seconds",
                "Archive build duration in seconds",
            )
            .buckets(vec![
                1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 3600.0,
            ]),
            &["service", "result"],
        )
        .expect("archive_build_duration_seconds metric");

        let build_requests_dropped_total = IntCounterVec::new(
            Opts::new(
                "build_requests_dropped_total",
                "Build requests dropped by the request channel",
            ),
            &["service", "reason"],
        )
        .expect("build_requests_dropped_total metric");

        let stale_archives_reoffered_total = IntCounterVec::new(
            Opts::new(
                "stale_archives_reoffered_total",
                "Stale building archives re-offered by the reaper",
            ),
            &["service"],
        )
        .expect("stale_archives_reoffered_total metric");

        let archives_failed_total = IntCounterVec::new(
            Opts::new(
                "archives_failed_total",
                "Archives moved to FAILED after exhausting build attempts",
            ),
            &["service"],
        )
        .expect("archives_failed_total metric");

        registry
            .register(Box::new(sg_up.clone()))
            .expect("register sg_up");
        registry
            .register(Box::new(http_requests_total.clone()))
            .expect("register http_requests_total");
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .expect("register http_request_duration_seconds");
        registry
            .register(Box::new(archive_requests_total.clone()))
            .expect("register archive_requests_total");
        registry
            .register(Box::new(archive_builds_total.clone()))
            .expect("register archive_builds_total");
        registry
            .register(Box::new(archive_build_duration_seconds.clone()))
            .expect("register archive_build_duration_seconds");
        registry
            .register(Box::new(build_requests_dropped_total.clone()))
            .expect("register build_requests_dropped_total");
        registry
            .register(Box::new(stale_archives_reoffered_total.clone()))
            .expect("register stale_archives_reoffered_total");
        registry
            .register(Box::new(archives_failed_total.clone()))
            .expect("register archives_failed_total");

        Metrics {
            registry,
            sg_up,
            http_requests_total,
            http_request_duration_seconds,
            archive_requests_total,
            archive_builds_total,
            archive_build_duration_seconds,
            build_requests_dropped_total,
            stale_archives_reoffered_total,
            archives_failed_total,
        }
    })
}

pub fn init(service_name: &'static str) {
    metrics().sg_up.with_label_values(&[service_name]).set(1);
}

pub fn record_http_request(
    service_name: &'static str,
    method: &str,
    route: &str,
    status: u16,
    duration: Duration,
) {
    let status = status.to_string();
    let labels = [service_name, route, method, status.as_str()];
    let metrics = metrics();
    metrics.http_requests_total.with_label_values(&labels).inc();
    metrics
        .http_request_duration_seconds
        .with_label_values(&labels)
        .observe(duration.as_secs_f64());
}

pub fn inc_archive_request(service_name: &'static str, archive_type: &str, result: &str) {
    metrics()
        .archive_requests_total
        .with_label_values(&[service_name, archive_type, result])
        .inc();
}

pub fn record_archive_build(service_name: &'static str, result: &str, duration: Duration) {
    let metrics = metrics();
    metrics
        .archive_builds_total
        .with_label_values(&[service_name, result])
        .inc();
    metrics
        .archive_build_duration_seconds
        .with_label_values(&[service_name, result])
        .observe(duration.as_secs_f64());
}

pub fn inc_build_requests_dropped(service_name: &'static str, reason: &str, count: u64) {
    metrics()
        .build_requests_dropped_total
        .with_label_values(&[service_name, reason])
        .inc_by(count);
}

pub fn inc_stale_archives_reoffered(service_name: &'static str, count: u64) {
    if count == 0 {
        return;
    }
    metrics()
        .stale_archives_reoffered_total
        .with_label_values(&[service_name])
        .inc_by(count);
}

pub fn inc_archives_failed(service_name: &'static str) {
    metrics()
        .archives_failed_total
        .with_label_values(&[service_name])
        .inc();
}

pub fn metrics_response(service_name: &'static str) -> impl IntoResponse {
    init(service_name);
    let metrics = metrics();
    let metric_families = metrics.registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            HeaderMap::new(),
            "failed to encode metrics".to_string(),
        );
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    (
        StatusCode::OK,
        headers,
        String::from_utf8_lossy(&buffer).to_string(),
    )
}

#[derive(Clone)]
pub struct MetricsLayer {
    service_name: &'static str,
}

impl MetricsLayer {
    pub fn new(service_name: &'static str) -> Self {
        Self { service_name }
    }
}

#[derive(Clone)]
pub struct MetricsService<S> {
    inner: S,
    service_name: &'static str,
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            service_name: self.service_name,
        }
    }
}

impl<S, ReqBody, ResBody> Service<axum::http::Request<ReqBody>> for MetricsService<S>
where
    S: Service<axum::http::Request<ReqBody>, Response = axum::response::Response<ResBody>>
        + Send
        + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = axum::response::Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: axum::http::Request<ReqBody>) -> Self::Future {
        let service_name = self.service_name;
        let method = request.method().to_string();
        let route = request.uri().path().to_string();
        let start = Instant::now();
        let fut = self.inner.call(request);
        Box::pin(async move {
            match fut.await {
                Ok(response) => {
                    record_http_request(
                        service_name,
                        &method,
                        &route,
                        response.status().as_u16(),
                        start.elapsed(),
                    );
                    Ok(response)
                }
                Err(err) => {
                    record_http_request(service_name, &method, &route, 500, start.elapsed());
                    Err(err)
                }
            }
        })
    }
}
