use axum::{
    extract::{MatchedPath, Request},
    http::StatusCode,
    middleware::Next,
    response::Response,
};

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder, histogram_opts, opts,
    register_counter_vec, register_gauge, register_histogram_vec,
};

use std::sync::LazyLock;
use std::time::{Duration, Instant};

static HTTP_REQUESTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        opts!("http_requests_total", "Total number of HTTP requests"),
        &["method", "route", "status"]
    )
    .unwrap()
});

static HTTP_REQUEST_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "http_request_duration_seconds",
            "HTTP request duration in seconds"
        )
        .buckets(vec![
            0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0
        ]),
        &["method", "route"]
    )
    .unwrap()
});

static RELAY_CONNECTIONS_ACTIVE: LazyLock<Gauge> = LazyLock::new(|| {
    register_gauge!(opts!(
        "relay_connections_active",
        "Active relay connections"
    ))
    .unwrap()
});

static RELAY_ENVELOPES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        opts!("relay_envelopes_total", "Relay envelopes by direction"),
        &["direction"]
    )
    .unwrap()
});

static RELAY_CONNECTIONS_CLOSED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        opts!(
            "relay_connections_closed_total",
            "Closed relay connections by the loop that ended first"
        ),
        &["reason"]
    )
    .unwrap()
});

static STORE_OP_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "store_op_duration_seconds",
            "Duration of store operations in seconds"
        ),
        &["operation"]
    )
    .unwrap()
});

/// Records every request under its route template, so
/// `/users/{username}/convs/{convId}` is one series rather than one per
/// conversation.
pub async fn metrics_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().as_str().to_owned();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());

    let response = next.run(req).await;
    let elapsed = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method.as_str(), route.as_str(), status.as_str()])
        .inc();
    HTTP_REQUEST_DURATION
        .with_label_values(&[method.as_str(), route.as_str()])
        .observe(elapsed);

    response
}

pub async fn metrics_handler() -> Result<String, StatusCode> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| {
            tracing::error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

pub struct Metrics;

impl Metrics {
    pub fn connection_opened() {
        RELAY_CONNECTIONS_ACTIVE.inc();
    }

    pub fn connection_closed(reason: &str) {
        RELAY_CONNECTIONS_ACTIVE.dec();
        RELAY_CONNECTIONS_CLOSED_TOTAL
            .with_label_values(&[reason])
            .inc();
    }

    pub fn envelope_received() {
        RELAY_ENVELOPES_TOTAL.with_label_values(&["received"]).inc();
    }

    pub fn envelope_published() {
        RELAY_ENVELOPES_TOTAL.with_label_values(&["published"]).inc();
    }

    pub fn envelope_delivered() {
        RELAY_ENVELOPES_TOTAL.with_label_values(&["delivered"]).inc();
    }

    pub fn observe_store_op(operation: &str, duration: Duration) {
        STORE_OP_DURATION_SECONDS
            .with_label_values(&[operation])
            .observe(duration.as_secs_f64());
    }
}
