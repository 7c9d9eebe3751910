use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "Request duration in seconds. Tagged with route, status.",
};

pub const CACHE_HIT: MetricDef = MetricDef {
    name: "cache.hit",
    metric_type: MetricType::Counter,
    description: "Responses served from the cache. Tagged with route.",
};

pub const CACHE_MISS: MetricDef = MetricDef {
    name: "cache.miss",
    metric_type: MetricType::Counter,
    description: "Cache lookups that went to the upstream. Tagged with route.",
};

pub const CACHE_WRITE_DROPPED: MetricDef = MetricDef {
    name: "cache.write.dropped",
    metric_type: MetricType::Counter,
    description: "Cache writes discarded because the write queue was full",
};

pub const CACHE_WRITE_FAILED: MetricDef = MetricDef {
    name: "cache.write.failed",
    metric_type: MetricType::Counter,
    description: "Cache writes rejected by the store",
};

pub const CACHE_EVICTED: MetricDef = MetricDef {
    name: "cache.evicted",
    metric_type: MetricType::Counter,
    description: "Expired or unreadable entries deleted from the store",
};

pub const UPSTREAM_WINDOW_FAILURES: MetricDef = MetricDef {
    name: "upstream.window.failure",
    metric_type: MetricType::Counter,
    description: "Failed statistics window queries. Tagged with window.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUEST_DURATION,
    CACHE_HIT,
    CACHE_MISS,
    CACHE_WRITE_DROPPED,
    CACHE_WRITE_FAILED,
    CACHE_EVICTED,
    UPSTREAM_WINDOW_FAILURES,
];
