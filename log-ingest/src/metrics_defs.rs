use shared::metrics_defs::{MetricDef, MetricType};

pub const INGEST_BATCH_ACCEPTED: MetricDef = MetricDef {
    name: "ingest.batch.accepted",
    metric_type: MetricType::Counter,
    description: "Records accepted by the batch endpoint",
};

pub const INGEST_BATCH_REJECTED: MetricDef = MetricDef {
    name: "ingest.batch.rejected",
    metric_type: MetricType::Counter,
    description: "Batches rejected by the batch endpoint, tagged by reason",
};

pub const INGEST_QUOTA_REJECTED: MetricDef = MetricDef {
    name: "ingest.quota.rejected",
    metric_type: MetricType::Counter,
    description: "Batches rejected because the per-minute quota was exhausted",
};

pub const STORE_APPENDED_RECORDS: MetricDef = MetricDef {
    name: "ingest.store.appended",
    metric_type: MetricType::Counter,
    description: "Records appended to the log store",
};

pub const STORE_WRITE_FAILURES: MetricDef = MetricDef {
    name: "ingest.store.write_failures",
    metric_type: MetricType::Counter,
    description: "Batches the log store failed to persist",
};

pub const INDEX_REBUILD_DURATION: MetricDef = MetricDef {
    name: "index.rebuild.duration",
    metric_type: MetricType::Histogram,
    description: "Duration of one maintenance run in seconds",
};

pub const INDEX_REBUILD_FILES: MetricDef = MetricDef {
    name: "index.rebuild.files",
    metric_type: MetricType::Counter,
    description: "Index sidecars rebuilt by maintenance",
};

pub const INDEX_REBUILD_FAILURES: MetricDef = MetricDef {
    name: "index.rebuild.failures",
    metric_type: MetricType::Counter,
    description: "Maintenance runs that failed",
};

pub const RETENTION_PURGED: MetricDef = MetricDef {
    name: "retention.purged",
    metric_type: MetricType::Counter,
    description: "Data files deleted by the retention purge",
};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "ingest.request.duration",
    metric_type: MetricType::Histogram,
    description: "Time spent handling an ingestion API request in seconds",
};

pub const ALL_METRICS: &[MetricDef] = &[
    INGEST_BATCH_ACCEPTED,
    INGEST_BATCH_REJECTED,
    INGEST_QUOTA_REJECTED,
    STORE_APPENDED_RECORDS,
    STORE_WRITE_FAILURES,
    INDEX_REBUILD_DURATION,
    INDEX_REBUILD_FILES,
    INDEX_REBUILD_FAILURES,
    RETENTION_PURGED,
    REQUEST_DURATION,
];
