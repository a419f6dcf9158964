//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Change log reads, filtering and source retries
//! - Per-target delivery outcomes and dead letters
//! - Checkpoint advancement and lag
//! - Circuit breaker state
//! - TTS and notification stage counts
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `fanout_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! Every non-success delivery outcome increments
//! `fanout_delivery_failures_total` with its error kind, so nothing fails
//! without a trace in metrics.
//!
//! # Usage
//!
//! ```rust,no_run
//! use insight_fanout::metrics;
//! use std::time::Duration;
//!
//! metrics::record_events_read("shard-0", 42);
//! metrics::record_batch_delivery("tts", "shard-0", 42, 40, 2, Duration::from_millis(80));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Change Log Reader
// =============================================================================

/// Record events read from a shard.
pub fn record_events_read(shard: &str, count: usize) {
    counter!("fanout_events_read_total", "shard" => shard.to_string()).increment(count as u64);
}

/// Record events that matched no target (acknowledged as success).
pub fn record_events_filtered(shard: &str, count: usize) {
    if count > 0 {
        counter!("fanout_events_filtered_total", "shard" => shard.to_string())
            .increment(count as u64);
    }
}

/// Record change entries the source could not parse.
pub fn record_source_parse_error(shard: &str) {
    counter!("fanout_source_parse_errors_total", "shard" => shard.to_string()).increment(1);
}

/// Record a retry while the source is unavailable.
pub fn record_source_retry(shard: &str) {
    counter!("fanout_source_retries_total", "shard" => shard.to_string()).increment(1);
}

/// Record source read latency.
pub fn record_source_read_latency(shard: &str, duration: Duration) {
    histogram!("fanout_source_read_duration_seconds", "shard" => shard.to_string())
        .record(duration.as_secs_f64());
}

/// Gauge for events waiting to be redelivered on a shard.
pub fn set_redelivery_pending(consumer: &str, shard: &str, pending: usize) {
    gauge!(
        "fanout_redelivery_pending",
        "consumer" => consumer.to_string(),
        "shard" => shard.to_string()
    )
    .set(pending as f64);
}

/// Record a checkpoint advance.
pub fn record_checkpoint_advance(consumer: &str, shard: &str) {
    counter!(
        "fanout_checkpoint_advances_total",
        "consumer" => consumer.to_string(),
        "shard" => shard.to_string()
    )
    .increment(1);
}

/// Gauge for how far a checkpoint trails the shard head.
pub fn set_checkpoint_lag_ms(consumer: &str, shard: &str, lag_ms: u64) {
    gauge!(
        "fanout_checkpoint_lag_ms",
        "consumer" => consumer.to_string(),
        "shard" => shard.to_string()
    )
    .set(lag_ms as f64);
}

// =============================================================================
// Checkpoint Store
// =============================================================================

/// Record checkpoint flush batch (debounced writes).
pub fn record_cursor_flush(flushed: usize, errors: usize) {
    counter!("fanout_checkpoint_flushes_total").increment(1);
    counter!("fanout_checkpoint_flushed_count").increment(flushed as u64);
    if errors > 0 {
        counter!("fanout_checkpoint_flush_errors_total").increment(errors as u64);
    }
}

/// Record checkpoint SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn cursor_retries_total(operation: &str) {
    counter!("fanout_checkpoint_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Delivery
// =============================================================================

/// Record one per-record delivery outcome.
pub fn record_delivery_outcome(target: &str, outcome: &str) {
    counter!(
        "fanout_deliveries_total",
        "target" => target.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a failed delivery by error kind.
pub fn record_delivery_failure(target: &str, kind: &str) {
    counter!(
        "fanout_delivery_failures_total",
        "target" => target.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a target call that hit its deadline.
pub fn record_delivery_timeout(target: &str) {
    counter!("fanout_delivery_timeouts_total", "target" => target.to_string()).increment(1);
}

/// Record events skipped because an earlier event for the same record failed.
pub fn record_delivery_blocked(target: &str) {
    counter!("fanout_delivery_blocked_total", "target" => target.to_string()).increment(1);
}

/// Record a record routed to the dead-letter sink.
pub fn record_dead_letter(target: &str, kind: &str) {
    counter!(
        "fanout_dead_letters_total",
        "target" => target.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a failure writing to the dead-letter sink itself.
pub fn record_dead_letter_error(target: &str) {
    counter!("fanout_dead_letter_errors_total", "target" => target.to_string()).increment(1);
}

/// Record a delivered batch.
pub fn record_batch_delivery(
    target: &str,
    shard: &str,
    total: usize,
    succeeded: usize,
    failed: usize,
    duration: Duration,
) {
    let target = target.to_string();
    let shard = shard.to_string();

    counter!("fanout_batch_events_total", "target" => target.clone(), "shard" => shard.clone())
        .increment(total as u64);
    counter!("fanout_batch_succeeded_total", "target" => target.clone(), "shard" => shard.clone())
        .increment(succeeded as u64);
    if failed > 0 {
        counter!("fanout_batch_failed_total", "target" => target.clone(), "shard" => shard.clone())
            .increment(failed as u64);
    }

    histogram!("fanout_batch_delivery_duration_seconds", "target" => target.clone())
        .record(duration.as_secs_f64());
    histogram!("fanout_batch_size", "target" => target).record(total as f64);
}

/// Record an SLO violation.
pub fn record_slo_violation(target: &str, slo_type: &str, value_ms: u64) {
    counter!(
        "fanout_slo_violations_total",
        "target" => target.to_string(),
        "slo" => slo_type.to_string()
    )
    .increment(1);
    histogram!(
        "fanout_slo_violation_ms",
        "target" => target.to_string(),
        "slo" => slo_type.to_string()
    )
    .record(value_ms as f64);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "fanout_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set circuit breaker state gauge (0=closed, 1=half_open, 2=open).
pub fn set_circuit_state(circuit_name: &str, state: &str) {
    let value = match state {
        "closed" => 0.0,
        "half_open" => 1.0,
        "open" => 2.0,
        _ => -1.0,
    };
    gauge!("fanout_circuit_state", "circuit" => circuit_name.to_string()).set(value);
}

/// Record circuit breaker rejection (circuit was open).
pub fn record_circuit_rejection(circuit_name: &str) {
    counter!("fanout_circuit_rejections_total", "circuit" => circuit_name.to_string())
        .increment(1);
}

// =============================================================================
// Consumers
// =============================================================================

/// Record a TTS state machine transition.
pub fn record_tts_stage(stage: &str) {
    counter!("fanout_tts_stage_total", "stage" => stage.to_string()).increment(1);
}

/// Record a TTS stage call that exceeded its deadline.
pub fn record_tts_timeout(stage: &str) {
    counter!("fanout_tts_timeouts_total", "stage" => stage.to_string()).increment(1);
}

/// Record synthesized audio size.
pub fn record_tts_audio_bytes(bytes: usize) {
    histogram!("fanout_tts_audio_bytes").record(bytes as f64);
}

/// Record a published notification.
pub fn record_notification_published(topic: &str) {
    counter!("fanout_notifications_published_total", "topic" => topic.to_string()).increment(1);
}

// =============================================================================
// Engine
// =============================================================================

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("fanout_engine_state").set(value);
}

/// Gauge for running shard workers.
pub fn set_active_workers(count: usize) {
    gauge!("fanout_active_workers").set(count as f64);
}
