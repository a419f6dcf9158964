//! Shard worker: the single writer for one (consumer, shard).
//!
//! Each worker loops:
//! 1. Pull the next batch from its reader (redeliveries first)
//! 2. Route it, to one target (per-target cursors) or to all (shared cursor)
//! 3. Acknowledge with the failed tokens, which advances the checkpoint
//! 4. Sleep for the poll interval when idle or when the batch had failures
//!
//! # Shutdown
//!
//! The worker watches the shutdown channel at every await point. A batch in
//! flight when the signal arrives is abandoned, not acknowledged: its events
//! go back to the redelivery queue and the checkpoint stays where it was, so
//! the next activation delivers them again.

use crate::batch::{BatchResponse, DeliveryOutcome};
use crate::config::SloConfig;
use crate::error::FanoutError;
use crate::event::{calculate_lag_ms, ChangeEvent, ShardId};
use crate::filter::TargetName;
use crate::metrics;
use crate::resilience::RateLimiter;
use crate::router::FanOutRouter;
use crate::stream::ChangeLogReader;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Ceiling for the backoff after reader errors.
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(30);

/// Which targets a worker's batches go to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum DeliveryScope {
    Target(TargetName),
    AllTargets,
}

pub(super) struct ShardWorker {
    pub reader: Arc<ChangeLogReader>,
    pub router: Arc<FanOutRouter>,
    pub shard: ShardId,
    pub scope: DeliveryScope,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub slo: SloConfig,
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

/// Resolves once shutdown has been signalled (or the engine is gone).
async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep, returning `false` if shutdown arrived first.
async fn pause(rx: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = shutdown_signalled(rx) => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

impl ShardWorker {
    /// Run until shutdown is signalled.
    pub(super) async fn run(self, mut shutdown_rx: watch::Receiver<bool>, active: Arc<AtomicUsize>) {
        let span = info_span!(
            "shard_worker",
            consumer = %self.reader.consumer(),
            shard = %self.shard
        );

        async move {
            metrics::set_active_workers(active.fetch_add(1, Ordering::SeqCst) + 1);
            info!(scope = ?self.scope, "Shard worker started");

            let mut error_backoff = self.poll_interval;

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let next = tokio::select! {
                    biased;
                    _ = shutdown_signalled(&mut shutdown_rx) => break,
                    next = self.reader.next_batch(&self.shard, self.batch_size) => next,
                };

                let batch = match next {
                    Ok(batch) => {
                        error_backoff = self.poll_interval;
                        batch
                    }
                    Err(e) => {
                        warn!(error = %e, backoff_ms = error_backoff.as_millis() as u64, "Reading batch failed");
                        if let FanoutError::InvalidState { .. } = e {
                            // Left over from a cancelled delivery.
                            self.reader.abandon(&self.shard).await;
                        }
                        if !pause(&mut shutdown_rx, error_backoff).await {
                            break;
                        }
                        error_backoff = (error_backoff * 2).min(MAX_ERROR_BACKOFF);
                        continue;
                    }
                };

                if batch.is_empty() {
                    if !pause(&mut shutdown_rx, self.poll_interval).await {
                        break;
                    }
                    continue;
                }

                if let Some(limiter) = &self.rate_limiter {
                    let permits = u32::try_from(batch.len()).unwrap_or(u32::MAX);
                    tokio::select! {
                        biased;
                        _ = shutdown_signalled(&mut shutdown_rx) => {
                            self.abandon_batch().await;
                            break;
                        }
                        _ = limiter.acquire_many(permits) => {}
                    }
                }

                let response = tokio::select! {
                    biased;
                    _ = shutdown_signalled(&mut shutdown_rx) => {
                        self.abandon_batch().await;
                        break;
                    }
                    response = self.deliver(&batch) => response,
                };

                let had_failures = !response.is_empty();
                match self.reader.acknowledge(&self.shard, &response).await {
                    Ok(checkpoint) => {
                        debug!(
                            size = batch.len(),
                            failed = response.len(),
                            checkpoint = ?checkpoint.as_ref().map(|c| c.as_str()),
                            "Batch acknowledged"
                        );
                        if let (Some(checkpoint), Some(last)) = (checkpoint, batch.last()) {
                            self.check_lag(checkpoint.as_str(), last);
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Acknowledging batch failed");
                    }
                }

                if had_failures && !pause(&mut shutdown_rx, self.poll_interval).await {
                    break;
                }
            }

            metrics::set_active_workers(active.fetch_sub(1, Ordering::SeqCst).saturating_sub(1));
            info!("Shard worker stopped");
        }
        .instrument(span)
        .await
    }

    async fn deliver(&self, batch: &[ChangeEvent]) -> BatchResponse {
        match &self.scope {
            DeliveryScope::Target(target) => {
                let outcomes: Vec<DeliveryOutcome> = self.router.route_to(target, batch).await;
                BatchResponse::from_outcomes(batch, &outcomes)
            }
            DeliveryScope::AllTargets => self.router.route(batch).await.response(batch),
        }
    }

    async fn abandon_batch(&self) {
        let count = self.reader.abandon(&self.shard).await;
        if count > 0 {
            info!(count, "Shutdown during delivery, batch left for redelivery");
        }
    }

    fn check_lag(&self, checkpoint: &str, last: &ChangeEvent) {
        let Some(lag_ms) = calculate_lag_ms(checkpoint, last.sequence_token.as_str()) else {
            return;
        };
        if self.slo.is_checkpoint_lag_violation(lag_ms) {
            warn!(
                lag_ms,
                threshold_sec = self.slo.max_checkpoint_lag_sec,
                checkpoint = %checkpoint,
                "SLO violation: checkpoint lagging behind delivered events"
            );
            metrics::record_slo_violation(self.reader.consumer(), "checkpoint_lag", lag_ms);
        }
    }
}
