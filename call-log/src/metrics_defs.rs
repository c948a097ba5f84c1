//! Metrics definitions for the client-side uploader.

use shared::metrics_defs::{MetricDef, MetricType};

pub const UPLOADER_SAMPLED_OUT: MetricDef = MetricDef {
    name: "uploader.sampled_out",
    metric_type: MetricType::Counter,
    description: "Records skipped by sampling before being enqueued",
};

pub const UPLOADER_DROPPED: MetricDef = MetricDef {
    name: "uploader.dropped",
    metric_type: MetricType::Counter,
    description: "Records dropped because the upload queue was full",
};

pub const UPLOADER_SENT: MetricDef = MetricDef {
    name: "uploader.sent",
    metric_type: MetricType::Counter,
    description: "Records delivered to the ingestion server",
};

pub const UPLOADER_FAILED: MetricDef = MetricDef {
    name: "uploader.failed",
    metric_type: MetricType::Counter,
    description: "Records dropped after exhausting upload retries",
};

pub const UPLOADER_ATTEMPTS: MetricDef = MetricDef {
    name: "uploader.attempts",
    metric_type: MetricType::Counter,
    description: "Batch upload attempts, including retries",
};

pub const UPLOADER_FLUSH_DURATION: MetricDef = MetricDef {
    name: "uploader.flush.duration",
    metric_type: MetricType::Histogram,
    description: "Time spent in a single flush tick in seconds",
};

pub const UPLOADER_QUEUE_SIZE: MetricDef = MetricDef {
    name: "uploader.queue.size",
    metric_type: MetricType::Gauge,
    description: "Records waiting in the upload queue after a flush",
};

pub const ALL_METRICS: &[MetricDef] = &[
    UPLOADER_SAMPLED_OUT,
    UPLOADER_DROPPED,
    UPLOADER_SENT,
    UPLOADER_FAILED,
    UPLOADER_ATTEMPTS,
    UPLOADER_FLUSH_DURATION,
    UPLOADER_QUEUE_SIZE,
];
