//! Batch delivery to one target with per-record outcomes.
//!
//! The coordinator takes a batch read from one shard and hands every event
//! to a [`DeliveryTarget`], returning one [`DeliveryOutcome`] per event in
//! input order. A failing record never fails its neighbours.
//!
//! # Design
//!
//! ```text
//! batch ──▶ group by record key ──┬──▶ key A: e1 ─▶ e4 ─▶ e7   (token order)
//!                                 ├──▶ key B: e2 ─▶ e5         (parallel,
//!                                 └──▶ key C: e3 ─▶ e6          bulkhead)
//!                                            │
//!                      timeout ◀── circuit ◀─┘
//!                         │
//!                         ▼
//!            attempt ledger ──▶ dead-letter sink (threshold reached)
//!           (circuit rejections are not attempts)
//!                         │
//!                         ▼
//!            Vec<DeliveryOutcome> (input order) ──▶ BatchResponse
//! ```
//!
//! Once an event fails retryably, later events for the same key in the
//! batch are reported retryable without being attempted, so a record is
//! never written out of order.

use crate::circuit_breaker::{CircuitBreaker, CircuitConfig};
use crate::collaborators::BoxFuture;
use crate::config::{DeliveryConfig, SloConfig};
use crate::dead_letter::{DeadLetter, DeadLetterSink};
use crate::error::{ErrorKind, FanoutError, Result};
use crate::event::{ChangeEvent, RecordKey, SequenceToken, ShardId};
use crate::metrics;
use crate::resilience::Bulkhead;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

/// A downstream consumer of change events.
pub trait DeliveryTarget: Send + Sync {
    fn name(&self) -> &str;

    /// Apply one event. Errors are classified with [`FanoutError::kind`].
    fn process<'a>(&'a self, event: &'a ChangeEvent) -> BoxFuture<'a, ()>;
}

/// Result of delivering one event to one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success,
    RetryableFailure {
        kind: ErrorKind,
        reason: String,
    },
    PermanentFailure {
        kind: ErrorKind,
        reason: String,
        dead_lettered: bool,
    },
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Success)
    }

    /// Whether the event must be redelivered.
    ///
    /// A permanent failure is redelivered until it is dead-lettered.
    pub fn needs_redelivery(&self) -> bool {
        match self {
            DeliveryOutcome::Success => false,
            DeliveryOutcome::RetryableFailure { .. } => true,
            DeliveryOutcome::PermanentFailure { dead_lettered, .. } => !dead_lettered,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DeliveryOutcome::Success => "success",
            DeliveryOutcome::RetryableFailure { .. } => "retryable",
            DeliveryOutcome::PermanentFailure {
                dead_lettered: true,
                ..
            } => "dead_lettered",
            DeliveryOutcome::PermanentFailure { .. } => "permanent",
        }
    }
}

/// Tokens the caller must redeliver. Absence means durably processed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub batch_item_failures: Vec<SequenceToken>,
}

impl BatchResponse {
    /// Build from outcomes aligned with `events`.
    pub fn from_outcomes(events: &[ChangeEvent], outcomes: &[DeliveryOutcome]) -> Self {
        Self {
            batch_item_failures: events
                .iter()
                .zip(outcomes)
                .filter(|(_, outcome)| outcome.needs_redelivery())
                .map(|(event, _)| event.sequence_token.clone())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.batch_item_failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.batch_item_failures.len()
    }
}

type AttemptKey = (String, ShardId, SequenceToken);

/// Failed attempts of one event at one target.
#[derive(Debug, Clone, Copy)]
struct AttemptRecord {
    count: u32,
    first_failure: Instant,
}

/// Delivers batches to targets with isolation, ordering and poison-message
/// protection.
///
/// Shared by every worker of an engine: the bulkhead, circuits and attempt
/// ledger are keyed by target so workers for different shards cooperate.
pub struct DeliveryCoordinator {
    config: DeliveryConfig,
    slo: SloConfig,
    bulkhead: Bulkhead,
    circuits: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    ledger: Mutex<HashMap<AttemptKey, AttemptRecord>>,
    dead_letters: Arc<dyn DeadLetterSink>,
}

impl std::fmt::Debug for DeliveryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryCoordinator")
            .field("config", &self.config)
            .field("bulkhead", &self.bulkhead)
            .finish()
    }
}

impl DeliveryCoordinator {
    pub fn new(config: DeliveryConfig, slo: SloConfig, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        Self {
            bulkhead: Bulkhead::new(config.max_concurrency),
            config,
            slo,
            circuits: RwLock::new(HashMap::new()),
            ledger: Mutex::new(HashMap::new()),
            dead_letters,
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Circuit for `target`, created on first use.
    pub async fn circuit(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(circuit) = self.circuits.read().await.get(target) {
            return circuit.clone();
        }
        self.circuits
            .write()
            .await
            .entry(target.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    target,
                    CircuitConfig::from_delivery(&self.config),
                ))
            })
            .clone()
    }

    /// `(target, likely open)` for every circuit created so far.
    pub async fn circuit_states(&self) -> Vec<(String, bool)> {
        let mut states: Vec<(String, bool)> = self
            .circuits
            .read()
            .await
            .iter()
            .map(|(name, circuit)| (name.clone(), circuit.is_likely_open()))
            .collect();
        states.sort();
        states
    }

    /// Consecutive failed attempts recorded for one event at one target.
    pub async fn attempts(&self, target: &str, shard: &str, token: &SequenceToken) -> u32 {
        let key = (target.to_string(), shard.to_string(), token.clone());
        self.ledger.lock().await.get(&key).map_or(0, |r| r.count)
    }

    /// Deliver `events` to `target`. Outcomes are aligned to input order.
    #[instrument(skip(self, events, target), fields(target_name = %target.name(), size = events.len()))]
    pub async fn deliver(
        &self,
        events: &[ChangeEvent],
        target: &dyn DeliveryTarget,
    ) -> Vec<DeliveryOutcome> {
        if events.is_empty() {
            return Vec::new();
        }
        let start = Instant::now();
        let circuit = self.circuit(target.name()).await;

        // Group by record key; BTreeMap keeps group scheduling deterministic.
        let mut groups: BTreeMap<&RecordKey, Vec<usize>> = BTreeMap::new();
        for (idx, event) in events.iter().enumerate() {
            groups.entry(&event.key).or_default().push(idx);
        }
        for indices in groups.values_mut() {
            indices.sort_by(|a, b| events[*a].sequence_token.cmp(&events[*b].sequence_token));
        }

        let circuit = &circuit;
        let results = join_all(groups.into_values().map(|indices| async move {
            let mut outcomes = Vec::with_capacity(indices.len());
            let mut blocked_by: Option<&SequenceToken> = None;

            for idx in indices {
                let event = &events[idx];
                if let Some(blocker) = blocked_by {
                    metrics::record_delivery_blocked(target.name());
                    outcomes.push((
                        idx,
                        DeliveryOutcome::RetryableFailure {
                            kind: ErrorKind::TransientDependency,
                            reason: format!("blocked by earlier failure of {}", blocker),
                        },
                    ));
                    continue;
                }

                let result = self.attempt(circuit, target, event).await;
                let outcome = self.settle(target.name(), event, result).await;
                if matches!(outcome, DeliveryOutcome::RetryableFailure { .. }) {
                    blocked_by = Some(&event.sequence_token);
                }
                outcomes.push((idx, outcome));
            }
            outcomes
        }))
        .await;

        let mut outcomes = vec![DeliveryOutcome::Success; events.len()];
        for (idx, outcome) in results.into_iter().flatten() {
            outcomes[idx] = outcome;
        }

        let elapsed = start.elapsed();
        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        let failed = outcomes.iter().filter(|o| o.needs_redelivery()).count();
        let shard = events[0].shard.as_str();
        metrics::record_batch_delivery(target.name(), shard, events.len(), succeeded, failed, elapsed);

        if self.slo.is_batch_delivery_violation(elapsed) {
            let ms = elapsed.as_millis() as u64;
            warn!(
                target_name = %target.name(),
                shard = %shard,
                latency_ms = ms,
                threshold_ms = self.slo.max_batch_delivery_latency_ms,
                "SLO violation: batch delivery latency exceeded threshold"
            );
            metrics::record_slo_violation(target.name(), "batch_delivery", ms);
        }

        debug!(
            target_name = %target.name(),
            shard = %shard,
            total = events.len(),
            succeeded,
            failed,
            duration_ms = elapsed.as_millis() as u64,
            "Batch delivered"
        );

        outcomes
    }

    /// Deliver and build the response the reader acknowledges with.
    pub async fn deliver_batch(
        &self,
        events: &[ChangeEvent],
        target: &dyn DeliveryTarget,
    ) -> (Vec<DeliveryOutcome>, BatchResponse) {
        let outcomes = self.deliver(events, target).await;
        let response = BatchResponse::from_outcomes(events, &outcomes);
        (outcomes, response)
    }

    async fn attempt(
        &self,
        circuit: &CircuitBreaker,
        target: &dyn DeliveryTarget,
        event: &ChangeEvent,
    ) -> Result<()> {
        let _permit = self.bulkhead.acquire().await?;
        let deadline = self.config.call_timeout_duration();

        circuit
            .call(|| async {
                match tokio::time::timeout(deadline, target.process(event)).await {
                    Ok(result) => result,
                    Err(_) => {
                        metrics::record_delivery_timeout(target.name());
                        Err(FanoutError::timeout(
                            format!("{} process", target.name()),
                            deadline,
                        ))
                    }
                }
            })
            .await
    }

    /// Turn an attempt result into an outcome, updating the attempt ledger
    /// and dead-lettering when a threshold is reached.
    async fn settle(&self, target: &str, event: &ChangeEvent, result: Result<()>) -> DeliveryOutcome {
        let key = (
            target.to_string(),
            event.shard.clone(),
            event.sequence_token.clone(),
        );

        let err = match result {
            Ok(()) => {
                self.ledger.lock().await.remove(&key);
                metrics::record_delivery_outcome(target, "success");
                return DeliveryOutcome::Success;
            }
            Err(e) => e,
        };

        let kind = err.kind();
        let reason = err.to_string();
        metrics::record_delivery_failure(target, kind.as_str());

        // The target was never called, so the ledger is left alone.
        if matches!(err, FanoutError::CircuitOpen { .. }) {
            debug!(
                target_name = %target,
                shard = %event.shard,
                sequence_token = %event.sequence_token,
                "Circuit open, will redeliver"
            );
            let outcome = DeliveryOutcome::RetryableFailure { kind, reason };
            metrics::record_delivery_outcome(target, outcome.label());
            return outcome;
        }

        let (attempts, failing_for) = {
            let mut ledger = self.ledger.lock().await;
            let record = ledger.entry(key.clone()).or_insert(AttemptRecord {
                count: 0,
                first_failure: Instant::now(),
            });
            record.count += 1;
            (record.count, record.first_failure.elapsed())
        };

        let outcome = if err.is_retryable() {
            if attempts >= self.config.max_retryable_attempts
                && failing_for >= self.config.retry_exhaustion_window_duration()
            {
                let exhausted = FanoutError::ExhaustedRetry {
                    attempts,
                    last_error: reason.clone(),
                };
                let dead_lettered = self
                    .dead_letter(target, event, ErrorKind::ExhaustedRetry, &exhausted.to_string(), attempts)
                    .await;
                if dead_lettered {
                    self.ledger.lock().await.remove(&key);
                    DeliveryOutcome::PermanentFailure {
                        kind: ErrorKind::ExhaustedRetry,
                        reason: exhausted.to_string(),
                        dead_lettered: true,
                    }
                } else {
                    DeliveryOutcome::RetryableFailure { kind, reason }
                }
            } else {
                warn!(
                    target_name = %target,
                    shard = %event.shard,
                    sequence_token = %event.sequence_token,
                    key = %event.key,
                    kind = %kind,
                    attempts,
                    error = %reason,
                    "Delivery failed, will redeliver"
                );
                DeliveryOutcome::RetryableFailure { kind, reason }
            }
        } else {
            error!(
                target_name = %target,
                shard = %event.shard,
                sequence_token = %event.sequence_token,
                key = %event.key,
                tenant = %event.tenant,
                change_kind = %event.change_kind,
                entity_type = %event.entity_type,
                kind = %kind,
                attempts,
                error = %reason,
                "Delivery failed permanently"
            );
            let dead_lettered = attempts >= self.config.dead_letter_after
                && self.dead_letter(target, event, kind, &reason, attempts).await;
            if dead_lettered {
                self.ledger.lock().await.remove(&key);
            }
            DeliveryOutcome::PermanentFailure {
                kind,
                reason,
                dead_lettered,
            }
        };

        metrics::record_delivery_outcome(target, outcome.label());
        outcome
    }

    async fn dead_letter(
        &self,
        target: &str,
        event: &ChangeEvent,
        kind: ErrorKind,
        reason: &str,
        attempts: u32,
    ) -> bool {
        let letter = DeadLetter::new(target, event, kind, reason, attempts);
        match self.dead_letters.publish(letter).await {
            Ok(()) => {
                metrics::record_dead_letter(target, kind.as_str());
                info!(
                    target_name = %target,
                    shard = %event.shard,
                    sequence_token = %event.sequence_token,
                    kind = %kind,
                    attempts,
                    "Record dead-lettered"
                );
                true
            }
            Err(e) => {
                metrics::record_dead_letter_error(target);
                error!(
                    target_name = %target,
                    sequence_token = %event.sequence_token,
                    error = %e,
                    "Dead-letter sink failed, record stays a batch-item failure"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::{ChannelDeadLetterSink, NoopDeadLetterSink};
    use crate::event::ChangeKind;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Records calls; fails tokens from the configured sets.
    #[derive(Default)]
    struct ScriptedTarget {
        transient: HashSet<String>,
        permanent: HashSet<String>,
        slow: HashSet<String>,
        calls: StdMutex<Vec<String>>,
    }

    impl DeliveryTarget for ScriptedTarget {
        fn name(&self) -> &str {
            "scripted"
        }

        fn process<'a>(&'a self, event: &'a ChangeEvent) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                let token = event.sequence_token.to_string();
                self.calls.lock().unwrap().push(token.clone());
                if self.slow.contains(&token) {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                if self.transient.contains(&token) {
                    return Err(FanoutError::transient("speech", "503"));
                }
                if self.permanent.contains(&token) {
                    return Err(FanoutError::validation("summary", "missing"));
                }
                Ok(())
            })
        }
    }

    fn event(ms: u64, sk: &str) -> ChangeEvent {
        ChangeEvent::from_record_change(
            "s0",
            SequenceToken::new(ms, 0),
            ChangeKind::Insert,
            RecordKey::new("USER#a@example.com", sk),
            None,
            Some(json!({"SK": sk})),
        )
        .unwrap()
    }

    fn coordinator() -> DeliveryCoordinator {
        DeliveryCoordinator::new(
            DeliveryConfig::testing(),
            SloConfig::default(),
            Arc::new(NoopDeadLetterSink),
        )
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let target = ScriptedTarget::default();
        assert!(coordinator().deliver(&[], &target).await.is_empty());
    }

    #[tokio::test]
    async fn test_partial_failure_isolated() {
        let events: Vec<_> = (1..=5).map(|i| event(i, &format!("EMAIL#m{}", i))).collect();
        let target = ScriptedTarget {
            transient: HashSet::from(["3-0".to_string()]),
            ..Default::default()
        };

        let (outcomes, response) = coordinator().deliver_batch(&events, &target).await;

        assert_eq!(outcomes.len(), 5);
        assert!(matches!(outcomes[2], DeliveryOutcome::RetryableFailure { .. }));
        assert_eq!(outcomes.iter().filter(|o| o.is_success()).count(), 4);
        assert_eq!(response.batch_item_failures, vec![SequenceToken::new(3, 0)]);
    }

    #[tokio::test]
    async fn test_same_key_sequential_in_token_order() {
        // Arrival order is shuffled; the same key must be processed by token.
        let events = vec![
            event(3, "EMAIL#m1"),
            event(1, "EMAIL#m1"),
            event(2, "EMAIL#m1"),
        ];
        let target = ScriptedTarget::default();

        coordinator().deliver(&events, &target).await;

        let calls = target.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["1-0", "2-0", "3-0"]);
    }

    #[tokio::test]
    async fn test_retryable_failure_blocks_later_events_for_key() {
        let events = vec![
            event(1, "EMAIL#m1"),
            event(2, "EMAIL#m1"),
            event(3, "EMAIL#m2"),
        ];
        let target = ScriptedTarget {
            transient: HashSet::from(["1-0".to_string()]),
            ..Default::default()
        };

        let outcomes = coordinator().deliver(&events, &target).await;

        assert!(matches!(outcomes[0], DeliveryOutcome::RetryableFailure { .. }));
        assert!(matches!(outcomes[1], DeliveryOutcome::RetryableFailure { .. }));
        assert!(outcomes[2].is_success());
        let calls = target.calls.lock().unwrap().clone();
        assert!(!calls.contains(&"2-0".to_string()), "blocked event must not be attempted");
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let mut config = DeliveryConfig::testing();
        config.call_timeout = "20ms".to_string();
        let coordinator = DeliveryCoordinator::new(config, SloConfig::default(), Arc::new(NoopDeadLetterSink));
        let events = vec![event(1, "EMAIL#m1")];
        let target = ScriptedTarget {
            slow: HashSet::from(["1-0".to_string()]),
            ..Default::default()
        };

        let outcomes = coordinator.deliver(&events, &target).await;

        match &outcomes[0] {
            DeliveryOutcome::RetryableFailure { kind, reason } => {
                assert_eq!(*kind, ErrorKind::TransientDependency);
                assert!(reason.contains("Timeout"));
            }
            other => panic!("expected retryable failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_permanent_failure_dead_lettered_on_third_attempt() {
        let (sink, mut rx) = ChannelDeadLetterSink::new();
        let coordinator =
            DeliveryCoordinator::new(DeliveryConfig::testing(), SloConfig::default(), Arc::new(sink));
        let events = vec![event(1, "EMAIL#m1")];
        let target = ScriptedTarget {
            permanent: HashSet::from(["1-0".to_string()]),
            ..Default::default()
        };

        for attempt in 1..=2 {
            let (outcomes, response) = coordinator.deliver_batch(&events, &target).await;
            assert_eq!(
                outcomes[0],
                DeliveryOutcome::PermanentFailure {
                    kind: ErrorKind::Validation,
                    reason: "Validation error (summary): missing".to_string(),
                    dead_lettered: false,
                }
            );
            assert_eq!(response.len(), 1);
            assert_eq!(
                coordinator.attempts("scripted", "s0", &events[0].sequence_token).await,
                attempt
            );
        }

        let (outcomes, response) = coordinator.deliver_batch(&events, &target).await;
        assert!(matches!(
            outcomes[0],
            DeliveryOutcome::PermanentFailure { dead_lettered: true, .. }
        ));
        assert!(response.is_empty());

        let letter = rx.recv().await.unwrap();
        assert_eq!(letter.attempts, 3);
        assert_eq!(letter.kind, ErrorKind::Validation);
        assert_eq!(
            coordinator.attempts("scripted", "s0", &events[0].sequence_token).await,
            0
        );
    }

    #[tokio::test]
    async fn test_dead_letter_sink_failure_keeps_record_failed() {
        let (sink, rx) = ChannelDeadLetterSink::new();
        drop(rx);
        let mut config = DeliveryConfig::testing();
        config.dead_letter_after = 1;
        let coordinator = DeliveryCoordinator::new(config, SloConfig::default(), Arc::new(sink));
        let events = vec![event(1, "EMAIL#m1")];
        let target = ScriptedTarget {
            permanent: HashSet::from(["1-0".to_string()]),
            ..Default::default()
        };

        let (outcomes, response) = coordinator.deliver_batch(&events, &target).await;

        assert!(matches!(
            outcomes[0],
            DeliveryOutcome::PermanentFailure { dead_lettered: false, .. }
        ));
        assert_eq!(response.len(), 1);
    }

    #[tokio::test]
    async fn test_retryable_exhaustion_dead_letters() {
        let (sink, mut rx) = ChannelDeadLetterSink::new();
        let mut config = DeliveryConfig::testing();
        config.max_retryable_attempts = 3;
        let coordinator = DeliveryCoordinator::new(config, SloConfig::default(), Arc::new(sink));
        let events = vec![event(1, "EMAIL#m1")];
        let target = ScriptedTarget {
            transient: HashSet::from(["1-0".to_string()]),
            ..Default::default()
        };

        for _ in 0..2 {
            let outcomes = coordinator.deliver(&events, &target).await;
            assert!(matches!(outcomes[0], DeliveryOutcome::RetryableFailure { .. }));
        }
        let outcomes = coordinator.deliver(&events, &target).await;
        assert!(matches!(
            outcomes[0],
            DeliveryOutcome::PermanentFailure {
                kind: ErrorKind::ExhaustedRetry,
                dead_lettered: true,
                ..
            }
        ));
        assert_eq!(rx.recv().await.unwrap().kind, ErrorKind::ExhaustedRetry);
    }

    #[tokio::test]
    async fn test_success_resets_ledger() {
        let coordinator = coordinator();
        let events = vec![event(1, "EMAIL#m1")];
        let failing = ScriptedTarget {
            transient: HashSet::from(["1-0".to_string()]),
            ..Default::default()
        };
        coordinator.deliver(&events, &failing).await;
        assert_eq!(coordinator.attempts("scripted", "s0", &events[0].sequence_token).await, 1);

        coordinator.deliver(&events, &ScriptedTarget::default()).await;
        assert_eq!(coordinator.attempts("scripted", "s0", &events[0].sequence_token).await, 0);
    }

    #[tokio::test]
    async fn test_open_circuit_rejects_as_retryable() {
        let mut config = DeliveryConfig::testing();
        config.circuit_failure_threshold = 2;
        config.circuit_reset_timeout = "60s".to_string();
        let coordinator = DeliveryCoordinator::new(config, SloConfig::default(), Arc::new(NoopDeadLetterSink));
        let failing = ScriptedTarget {
            transient: (1..=4).map(|i| format!("{}-0", i)).collect(),
            ..Default::default()
        };
        let events: Vec<_> = (1..=4).map(|i| event(i, &format!("EMAIL#m{}", i))).collect();

        for e in &events {
            coordinator.deliver(std::slice::from_ref(e), &failing).await;
        }

        let healthy = ScriptedTarget::default();
        let fresh = vec![event(10, "EMAIL#m10")];
        let outcomes = coordinator.deliver(&fresh, &healthy).await;
        match &outcomes[0] {
            DeliveryOutcome::RetryableFailure { reason, .. } => assert!(reason.contains("Circuit open")),
            other => panic!("expected circuit rejection, got {:?}", other),
        }
        assert!(healthy.calls.lock().unwrap().is_empty());
        assert_eq!(coordinator.circuit_states().await, vec![("scripted".to_string(), true)]);
    }

    #[tokio::test]
    async fn test_circuit_rejections_are_not_attempts() {
        let (sink, mut rx) = ChannelDeadLetterSink::new();
        let mut config = DeliveryConfig::testing();
        config.circuit_failure_threshold = 2;
        config.circuit_reset_timeout = "60s".to_string();
        config.max_retryable_attempts = 3;
        let coordinator = DeliveryCoordinator::new(config, SloConfig::default(), Arc::new(sink));
        let events = vec![event(1, "EMAIL#m1")];
        let failing = ScriptedTarget {
            transient: HashSet::from(["1-0".to_string()]),
            ..Default::default()
        };

        for _ in 0..10 {
            let outcomes = coordinator.deliver(&events, &failing).await;
            assert!(matches!(outcomes[0], DeliveryOutcome::RetryableFailure { .. }));
        }

        assert_eq!(failing.calls.lock().unwrap().len(), 2);
        assert_eq!(coordinator.attempts("scripted", "s0", &events[0].sequence_token).await, 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_outage_shorter_than_window_is_not_dead_lettered() {
        let (sink, mut rx) = ChannelDeadLetterSink::new();
        let mut config = DeliveryConfig::default();
        config.circuit_failure_threshold = 2;
        config.circuit_reset_timeout = "50ms".to_string();
        let coordinator = DeliveryCoordinator::new(config, SloConfig::default(), Arc::new(sink));
        let events = vec![event(1, "EMAIL#m1")];
        let failing = ScriptedTarget {
            transient: HashSet::from(["1-0".to_string()]),
            ..Default::default()
        };

        // Well past max_retryable_attempts, but far inside the window.
        for _ in 0..12 {
            let outcomes = coordinator.deliver(&events, &failing).await;
            assert!(outcomes[0].needs_redelivery());
            tokio::time::sleep(Duration::from_millis(60)).await;
        }
        assert!(failing.calls.lock().unwrap().len() >= 10);

        let outcomes = coordinator.deliver(&events, &ScriptedTarget::default()).await;
        assert!(outcomes[0].is_success());
        assert!(rx.try_recv().is_err());
        assert_eq!(coordinator.attempts("scripted", "s0", &events[0].sequence_token).await, 0);
    }

    #[test]
    fn test_outcome_labels_and_redelivery() {
        let dead = DeliveryOutcome::PermanentFailure {
            kind: ErrorKind::Validation,
            reason: "x".into(),
            dead_lettered: true,
        };
        assert_eq!(dead.label(), "dead_lettered");
        assert!(!dead.needs_redelivery());
        assert_eq!(DeliveryOutcome::Success.label(), "success");
        assert!(!DeliveryOutcome::Success.needs_redelivery());
    }
}
