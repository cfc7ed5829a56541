// Prometheus metrics for the quota core
//
// Exposed on the /metrics endpoint of the maintenance command:
// - Admission decisions by outcome (counter)
// - Tokens reserved and committed (counter)
// - Optimistic-write conflicts (counter)
// - Rate limiter degraded mode (gauge)
// - Reconciliation and usage dead-letter backlog (gauge), dropped dead letters (counter)
// - Store operation latency (histogram)

use lazy_static::lazy_static;
use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Admission metrics
    pub static ref ADMISSION_DECISIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("meterguard_admission_decisions_total", "Admission decisions by outcome code"),
        &["outcome"]
    ).expect("Failed to create admission decisions metric");

    // Ledger metrics
    pub static ref TOKENS_RESERVED_TOTAL: IntCounter = IntCounter::new(
        "meterguard_tokens_reserved_total",
        "Tokens provisionally held by reservations"
    ).expect("Failed to create tokens reserved metric");

    pub static ref TOKENS_COMMITTED_TOTAL: IntCounter = IntCounter::new(
        "meterguard_tokens_committed_total",
        "Tokens consumed by committed reservations"
    ).expect("Failed to create tokens committed metric");

    pub static ref OVER_LIMIT_COMMITS_TOTAL: IntCounter = IntCounter::new(
        "meterguard_over_limit_commits_total",
        "Commits whose actual consumption exceeded the monthly limit"
    ).expect("Failed to create over-limit commits metric");

    pub static ref CAS_CONFLICTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("meterguard_cas_conflicts_total", "Conditional writes that lost to a concurrent writer"),
        &["record"]
    ).expect("Failed to create CAS conflicts metric");

    pub static ref RESERVATIONS_EXPIRED_TOTAL: IntCounter = IntCounter::new(
        "meterguard_reservations_expired_total",
        "Pending reservations expired past their TTL"
    ).expect("Failed to create reservations expired metric");

    pub static ref RECONCILIATION_PENDING: IntGauge = IntGauge::new(
        "meterguard_reconciliation_pending",
        "Balance adjustments waiting for reconciliation"
    ).expect("Failed to create reconciliation pending metric");

    // Scheduler metrics
    pub static ref ACCOUNTS_RESET_TOTAL: IntCounter = IntCounter::new(
        "meterguard_accounts_reset_total",
        "Accounts rolled over into a new billing period"
    ).expect("Failed to create accounts reset metric");

    // Rate limiter metrics
    pub static ref RATE_LIMITER_DEGRADED: IntGauge = IntGauge::new(
        "meterguard_rate_limiter_degraded",
        "1 while rate limits are counted per process because the counter store is unreachable"
    ).expect("Failed to create rate limiter degraded metric");

    pub static ref RATE_LIMIT_DEGRADED_DECISIONS_TOTAL: IntCounter = IntCounter::new(
        "meterguard_rate_limit_degraded_decisions_total",
        "Rate limit decisions made from process-local counters"
    ).expect("Failed to create degraded decisions metric");

    // Usage metrics
    pub static ref USAGE_WRITE_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "meterguard_usage_write_failures_total",
        "Usage events that could not be written"
    ).expect("Failed to create usage write failures metric");

    pub static ref USAGE_DEAD_LETTERS: IntGauge = IntGauge::new(
        "meterguard_usage_dead_letters",
        "Usage writes waiting for replay"
    ).expect("Failed to create usage dead letters metric");

    pub static ref USAGE_DEAD_LETTERS_DROPPED_TOTAL: IntCounter = IntCounter::new(
        "meterguard_usage_dead_letters_dropped_total",
        "Usage dead letters discarded because the local outbox was full"
    ).expect("Failed to create usage dead letters dropped metric");

    // Store metrics
    pub static ref STORE_OP_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("meterguard_store_op_duration_seconds", "Store call latency in seconds")
            .buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        &["op"]
    ).expect("Failed to create store op duration metric");

    pub static ref STORE_OP_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("meterguard_store_op_errors_total", "Store calls that failed or timed out"),
        &["op"]
    ).expect("Failed to create store op errors metric");
}

/// Register every metric with the registry; safe to call more than once
pub fn init() -> prometheus::Result<()> {
    let collectors: Vec<Box<dyn Collector>> = vec![
        Box::new(ADMISSION_DECISIONS_TOTAL.clone()),
        Box::new(TOKENS_RESERVED_TOTAL.clone()),
        Box::new(TOKENS_COMMITTED_TOTAL.clone()),
        Box::new(OVER_LIMIT_COMMITS_TOTAL.clone()),
        Box::new(CAS_CONFLICTS_TOTAL.clone()),
        Box::new(RESERVATIONS_EXPIRED_TOTAL.clone()),
        Box::new(RECONCILIATION_PENDING.clone()),
        Box::new(ACCOUNTS_RESET_TOTAL.clone()),
        Box::new(RATE_LIMITER_DEGRADED.clone()),
        Box::new(RATE_LIMIT_DEGRADED_DECISIONS_TOTAL.clone()),
        Box::new(USAGE_WRITE_FAILURES_TOTAL.clone()),
        Box::new(USAGE_DEAD_LETTERS.clone()),
        Box::new(USAGE_DEAD_LETTERS_DROPPED_TOTAL.clone()),
        Box::new(STORE_OP_DURATION_SECONDS.clone()),
        Box::new(STORE_OP_ERRORS_TOTAL.clone()),
    ];

    for collector in collectors {
        match REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}
