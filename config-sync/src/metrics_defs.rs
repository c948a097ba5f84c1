use shared::metrics_defs::{MetricDef, MetricType};

pub const SYNC_TICKS: MetricDef = MetricDef {
    name: "sync.ticks",
    metric_type: MetricType::Counter,
    description: "Sync ticks, tagged by outcome",
};

pub const SYNC_TICK_DURATION: MetricDef = MetricDef {
    name: "sync.tick.duration",
    metric_type: MetricType::Histogram,
    description: "Duration of a sync tick in seconds",
};

pub const SYNC_SNAPSHOT_APPLIED: MetricDef = MetricDef {
    name: "sync.snapshot.applied",
    metric_type: MetricType::Counter,
    description: "Governance snapshots applied to the local registry",
};

pub const SYNC_SNAPSHOT_VERSION: MetricDef = MetricDef {
    name: "sync.snapshot.version",
    metric_type: MetricType::Gauge,
    description: "Version of the snapshot currently applied",
};

pub const SYNC_GOVERNANCE_RESULT: MetricDef = MetricDef {
    name: "sync.governance.result",
    metric_type: MetricType::Counter,
    description: "Contract allowlist releases processed, tagged applied or rejected",
};

pub const SYNC_FEEDBACK_FAILURES: MetricDef = MetricDef {
    name: "sync.feedback.failures",
    metric_type: MetricType::Counter,
    description: "Governance feedback uploads that failed",
};

pub const SYNC_FINALIZE_ACKED: MetricDef = MetricDef {
    name: "sync.finalize.acked",
    metric_type: MetricType::Counter,
    description: "Releases acknowledged as finalized",
};

pub const SYNC_INVALID_CURSOR: MetricDef = MetricDef {
    name: "sync.finalize.invalid_cursor",
    metric_type: MetricType::Counter,
    description: "Finalize pulls rejected because of an invalid cursor",
};

pub const SYNC_INVALID_CURSOR_FAIL_FAST: MetricDef = MetricDef {
    name: "sync.finalize.invalid_cursor.fail_fast",
    metric_type: MetricType::Counter,
    description: "Invalid cursors that failed the tick without recovery",
};

pub const LEASE_ACQUIRE: MetricDef = MetricDef {
    name: "lease.acquire",
    metric_type: MetricType::Counter,
    description: "Lease acquisition attempts, tagged by resulting mode",
};

pub const REMOTE_REQUEST_RETRIES: MetricDef = MetricDef {
    name: "remote_config.retries",
    metric_type: MetricType::Counter,
    description: "Config center requests retried after a retriable failure",
};

pub const SIGNATURE_REJECTED: MetricDef = MetricDef {
    name: "remote_config.signature.rejected",
    metric_type: MetricType::Counter,
    description: "Config center responses rejected by signature verification",
};

pub const ALL_METRICS: &[MetricDef] = &[
    SYNC_TICKS,
    SYNC_TICK_DURATION,
    SYNC_SNAPSHOT_APPLIED,
    SYNC_SNAPSHOT_VERSION,
    SYNC_GOVERNANCE_RESULT,
    SYNC_FEEDBACK_FAILURES,
    SYNC_FINALIZE_ACKED,
    SYNC_INVALID_CURSOR,
    SYNC_INVALID_CURSOR_FAIL_FAST,
    LEASE_ACQUIRE,
    REMOTE_REQUEST_RETRIES,
    SIGNATURE_REJECTED,
];
