use std::net::SocketAddr;
use std::time::Instant;

use crate::engine::EngineError;

// ── RED metrics (transition-driven) ─────────────────────────────

/// Counter: transitions attempted. Labels: op, status.
pub const TRANSITIONS_TOTAL: &str = "deskbook_transitions_total";

/// Histogram: transition latency in seconds, WAL commit included. Labels: op.
pub const TRANSITION_DURATION_SECONDS: &str = "deskbook_transition_duration_seconds";

/// Counter: requests refused because the slot or space was unavailable. Labels: op.
pub const CONFLICTS_TOTAL: &str = "deskbook_conflicts_total";

/// Counter: package check-ins refused for lack of remaining units.
pub const ENTITLEMENT_EXHAUSTED_TOTAL: &str = "deskbook_entitlement_exhausted_total";

// ── Background work ─────────────────────────────────────────────

/// Counter: collaborator calls that failed. Labels: collaborator.
pub const ADVISORY_FAILURES_TOTAL: &str = "deskbook_advisory_failures_total";

/// Counter: items touched by sweeps. Labels: sweep, outcome.
pub const SWEEP_ITEMS_TOTAL: &str = "deskbook_sweep_items_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "deskbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "deskbook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Record the outcome and latency of one engine operation.
pub fn record<T>(op: &'static str, started: Instant, result: &Result<T, EngineError>) {
    let status = match result {
        Ok(_) => "ok",
        Err(e) => e.kind().as_str(),
    };
    metrics::counter!(TRANSITIONS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(TRANSITION_DURATION_SECONDS, "op" => op).record(started.elapsed().as_secs_f64());

    match result {
        Err(EngineError::Conflict { .. }) => {
            metrics::counter!(CONFLICTS_TOTAL, "op" => op).increment(1);
        }
        Err(EngineError::EntitlementExhausted(_)) => {
            metrics::counter!(ENTITLEMENT_EXHAUSTED_TOTAL).increment(1);
        }
        _ => {}
    }
}

pub fn sweep_item(sweep: &'static str, outcome: &'static str) {
    metrics::counter!(SWEEP_ITEMS_TOTAL, "sweep" => sweep, "outcome" => outcome).increment(1);
}
