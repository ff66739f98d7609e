use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "Time until the response head is ready in seconds; streamed bodies are not included. Tagged with status, operation.",
};

pub const REQUESTS_INFLIGHT: MetricDef = MetricDef {
    name: "requests.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of requests currently being processed",
};

pub const AUTHORIZATION_DENIED: MetricDef = MetricDef {
    name: "authorization.denied",
    metric_type: MetricType::Counter,
    description: "Requests refused before reaching the adapter. Tagged with reason.",
};

pub const FREEZE_DURATION: MetricDef = MetricDef {
    name: "freeze.duration",
    metric_type: MetricType::Histogram,
    description: "Time to fetch, persist and publish a frozen result in seconds. Tagged with outcome.",
};

pub const FREEZE_CLEANUP_FAILED: MetricDef = MetricDef {
    name: "freeze.cleanup.failed",
    metric_type: MetricType::Counter,
    description: "Temporary freeze artifacts that could not be deleted",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUEST_DURATION,
    REQUESTS_INFLIGHT,
    AUTHORIZATION_DENIED,
    FREEZE_DURATION,
    FREEZE_CLEANUP_FAILED,
];
