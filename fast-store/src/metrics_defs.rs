use shared::metrics_defs::{MetricDef, MetricType};

pub const REFRESH_DURATION: MetricDef = MetricDef {
    name: "fast_store.refresh.duration",
    metric_type: MetricType::Histogram,
    description: "Duration of one cache refresh cycle in seconds",
};

pub const REFRESH_STREAMS: MetricDef = MetricDef {
    name: "fast_store.refresh.streams",
    metric_type: MetricType::Gauge,
    description: "Number of streams projected in the last refresh",
};

pub const REFRESH_LINKS: MetricDef = MetricDef {
    name: "fast_store.refresh.links",
    metric_type: MetricType::Gauge,
    description: "Number of stream-to-destination links projected in the last refresh",
};

pub const REFRESH_FAILURES: MetricDef = MetricDef {
    name: "fast_store.refresh.failures",
    metric_type: MetricType::Counter,
    description: "Refresh cycles that aborted, leaving the previous snapshot serving",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REFRESH_DURATION,
    REFRESH_STREAMS,
    REFRESH_LINKS,
    REFRESH_FAILURES,
];
