//metrics.rs
use lazy_static::lazy_static;
use prometheus::{register_counter, register_histogram, Counter, Histogram, HistogramOpts, Opts};

lazy_static! {
    // Delivery metrics
    pub static ref DELIVERIES_SENT: Counter = register_counter!(Opts::new(
        "deliveries_sent_total",
        "Total number of push messages accepted by the gateway"
    ))
    .unwrap();

    pub static ref DELIVERIES_FAILED: Counter = register_counter!(Opts::new(
        "deliveries_failed_total",
        "Total number of push messages that exhausted their attempts"
    ))
    .unwrap();

    pub static ref DELIVERIES_SKIPPED: Counter = register_counter!(Opts::new(
        "deliveries_skipped_total",
        "Total number of sends skipped because the log already records a delivery"
    ))
    .unwrap();

    pub static ref INVALID_TOKENS_REMOVED: Counter = register_counter!(Opts::new(
        "invalid_tokens_removed_total",
        "Total number of device tokens deleted after the gateway rejected them"
    ))
    .unwrap();

    // Campaign and scheduler metrics
    pub static ref CAMPAIGNS_CLAIMED: Counter = register_counter!(Opts::new(
        "campaigns_claimed_total",
        "Total number of campaigns moved into sending by this process"
    ))
    .unwrap();

    pub static ref CLAIM_CONFLICTS: Counter = register_counter!(Opts::new(
        "claim_conflicts_total",
        "Total number of campaign or notification claims lost to another worker"
    ))
    .unwrap();

    pub static ref DUE_ITEMS_DISPATCHED: Counter = register_counter!(Opts::new(
        "due_items_dispatched_total",
        "Total number of due campaigns and scheduled notifications dispatched"
    ))
    .unwrap();

    // Topic metrics
    pub static ref TOPIC_SYNC_FAILURES: Counter = register_counter!(Opts::new(
        "topic_sync_failures_total",
        "Total number of topic membership calls the gateway did not confirm"
    ))
    .unwrap();

    // Timing metrics
    pub static ref GATEWAY_SEND_TIME: Histogram = register_histogram!(
        HistogramOpts::new(
            "gateway_send_time_seconds",
            "Time taken by one gateway send call"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    )
    .unwrap();

    pub static ref CAMPAIGN_DISPATCH_TIME: Histogram = register_histogram!(
        HistogramOpts::new(
            "campaign_dispatch_time_seconds",
            "Time taken to fan a campaign out to every recipient"
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0])
    )
    .unwrap();
}

pub fn metrics_handler() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        return format!("Error encoding metrics: {}", e);
    }

    match String::from_utf8(buffer) {
        Ok(metrics) => metrics,
        Err(e) => format!("Error converting metrics to string: {}", e),
    }
}
