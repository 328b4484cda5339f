//! Metric definitions for the ingest router.

use shared::metrics_defs::{MetricDef, MetricType};

pub const EVENTS_RECEIVED: MetricDef = MetricDef {
    name: "ingest_router.events.received",
    metric_type: MetricType::Counter,
    description: "Events accepted by the ingest endpoints",
};

pub const EVENTS_REJECTED: MetricDef = MetricDef {
    name: "ingest_router.events.rejected",
    metric_type: MetricType::Counter,
    description: "Events rejected before delivery, tagged by reason",
};

pub const DELIVERY_FAILURES: MetricDef = MetricDef {
    name: "ingest_router.delivery.failures",
    metric_type: MetricType::Counter,
    description: "Forwards that exhausted all delivery attempts",
};

pub const BACKUP_FAILURES: MetricDef = MetricDef {
    name: "ingest_router.backup.failures",
    metric_type: MetricType::Counter,
    description: "Backup forwards that exhausted all delivery attempts",
};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "ingest_router.request.duration",
    metric_type: MetricType::Histogram,
    description: "End-to-end ingest request handling time in seconds",
};

pub const ALL_METRICS: &[MetricDef] = &[
    EVENTS_RECEIVED,
    EVENTS_REJECTED,
    DELIVERY_FAILURES,
    BACKUP_FAILURES,
    REQUEST_DURATION,
];
