//! Fan-out of classified events to independent targets.
//!
//! Each target receives its own copy of the events that classified to it
//! and is delivered concurrently with the others. A slow or failing target
//! never fails another target's events. The router does not retry; it
//! reports what happened and lets the reader redeliver.
//!
//! # Combining Outcomes
//!
//! In shared cursor mode one acknowledgement covers every target, so the
//! per-target outcomes of an event are folded into one:
//!
//! | Per-target outcomes | Combined |
//! |---------------------|----------|
//! | all success or dead-lettered | success |
//! | any needs redelivery | retryable failure |
//!
//! While a combined event waits for redelivery, the router remembers which
//! targets already settled it (success or dead letter) and does not call
//! them again. The memory is per process, so after a restart a redelivered
//! event reaches every target again and targets must still be idempotent.

use crate::batch::{BatchResponse, DeliveryCoordinator, DeliveryOutcome, DeliveryTarget};
use crate::error::ErrorKind;
use crate::event::{ChangeEvent, SequenceToken, ShardId};
use crate::filter::{Classifier, TargetName};
use crate::metrics;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Per-event outcomes of one routing pass.
#[derive(Debug, Clone, Default)]
pub struct RouteReport {
    /// One combined outcome per input event, in input order.
    pub outcomes: Vec<DeliveryOutcome>,
    /// Outcomes per target as `(input index, outcome)`.
    pub per_target: BTreeMap<TargetName, Vec<(usize, DeliveryOutcome)>>,
    /// Events that matched no target.
    pub filtered: usize,
}

impl RouteReport {
    pub fn response(&self, events: &[ChangeEvent]) -> BatchResponse {
        BatchResponse::from_outcomes(events, &self.outcomes)
    }
}

type SettledKey = (TargetName, ShardId, SequenceToken);

/// Routes events to targets through a shared delivery coordinator.
pub struct FanOutRouter {
    classifier: Classifier,
    targets: BTreeMap<TargetName, Arc<dyn DeliveryTarget>>,
    coordinator: Arc<DeliveryCoordinator>,
    /// Final per-target outcomes of events still pending redelivery.
    settled: Mutex<HashMap<SettledKey, DeliveryOutcome>>,
}

impl std::fmt::Debug for FanOutRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOutRouter")
            .field("classifier", &self.classifier)
            .field("targets", &self.targets.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FanOutRouter {
    pub fn new(
        classifier: Classifier,
        targets: Vec<Arc<dyn DeliveryTarget>>,
        coordinator: Arc<DeliveryCoordinator>,
    ) -> Self {
        let targets: BTreeMap<TargetName, Arc<dyn DeliveryTarget>> = targets
            .into_iter()
            .map(|t| (t.name().to_string(), t))
            .collect();

        for route in classifier.targets() {
            if !targets.contains_key(route) {
                warn!(target_name = %route, "Route has no registered target, events will be dropped for it");
            }
        }

        Self {
            classifier,
            targets,
            coordinator,
            settled: Mutex::new(HashMap::new()),
        }
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn coordinator(&self) -> &Arc<DeliveryCoordinator> {
        &self.coordinator
    }

    /// Registered target names in order.
    pub fn target_names(&self) -> Vec<TargetName> {
        self.targets.keys().cloned().collect()
    }

    pub fn target(&self, name: &str) -> Option<&Arc<dyn DeliveryTarget>> {
        self.targets.get(name)
    }

    /// Targets whose outcome for an event is remembered, awaiting the
    /// event's redelivery.
    pub async fn settled_count(&self) -> usize {
        self.settled.lock().await.len()
    }

    /// Deliver `events` to every target they classify to.
    ///
    /// A target that already settled a redelivered event is not called
    /// again; its earlier outcome is reused.
    pub async fn route(&self, events: &[ChangeEvent]) -> RouteReport {
        let mut assignments: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        let mut filtered = 0usize;

        for (idx, event) in events.iter().enumerate() {
            let matched = self.classifier.classify(event);
            let mut routed = false;
            for name in &matched {
                if let Some((key, _)) = self.targets.get_key_value(name.as_str()) {
                    assignments.entry(key.as_str()).or_default().push(idx);
                    routed = true;
                }
            }
            if !routed {
                filtered += 1;
            }
        }

        if let Some(first) = events.first() {
            metrics::record_events_filtered(&first.shard, filtered);
        }

        let mut reused: BTreeMap<&str, Vec<(usize, DeliveryOutcome)>> = BTreeMap::new();
        {
            let settled = self.settled.lock().await;
            for (name, indices) in assignments.iter_mut() {
                indices.retain(|&idx| {
                    let event = &events[idx];
                    let key = (name.to_string(), event.shard.clone(), event.sequence_token.clone());
                    match settled.get(&key) {
                        Some(outcome) => {
                            reused.entry(*name).or_default().push((idx, outcome.clone()));
                            false
                        }
                        None => true,
                    }
                });
            }
        }
        if !reused.is_empty() {
            debug!(
                skipped = reused.values().map(Vec::len).sum::<usize>(),
                "Skipped targets that already settled redelivered events"
            );
        }

        let deliveries = assignments.into_iter().filter_map(|(name, indices)| {
            let target = self.targets.get(name)?;
            Some(async move {
                if indices.is_empty() {
                    return (name, Vec::new());
                }
                let batch: Vec<ChangeEvent> = indices.iter().map(|&i| events[i].clone()).collect();
                let outcomes = self.coordinator.deliver(&batch, target.as_ref()).await;
                (name, indices.into_iter().zip(outcomes).collect::<Vec<_>>())
            })
        });
        let mut per_target: BTreeMap<TargetName, Vec<(usize, DeliveryOutcome)>> = BTreeMap::new();
        for (name, outcomes) in join_all(deliveries).await {
            per_target.entry(name.to_string()).or_default().extend(outcomes);
        }
        for (name, outcomes) in reused {
            let entry = per_target.entry(name.to_string()).or_default();
            entry.extend(outcomes);
            entry.sort_by_key(|(idx, _)| *idx);
        }

        let mut by_event: Vec<Vec<(&str, &DeliveryOutcome)>> = vec![Vec::new(); events.len()];
        for (name, outcomes) in &per_target {
            for (idx, outcome) in outcomes {
                by_event[*idx].push((name.as_str(), outcome));
            }
        }
        let outcomes: Vec<DeliveryOutcome> = by_event.iter().map(|o| combine(o)).collect();

        {
            let mut settled = self.settled.lock().await;
            for (idx, per_event) in by_event.iter().enumerate() {
                let event = &events[idx];
                let pending = outcomes[idx].needs_redelivery();
                for (name, outcome) in per_event {
                    let key = (name.to_string(), event.shard.clone(), event.sequence_token.clone());
                    if pending && !outcome.needs_redelivery() {
                        settled.insert(key, (*outcome).clone());
                    } else {
                        settled.remove(&key);
                    }
                }
            }
        }

        debug!(
            events = events.len(),
            filtered,
            targets = per_target.len(),
            "Routed batch"
        );

        RouteReport {
            outcomes,
            per_target,
            filtered,
        }
    }

    /// Deliver `events` to one target only (per-target cursor mode).
    ///
    /// Events the target's route does not accept are reported as success.
    pub async fn route_to(&self, target_name: &str, events: &[ChangeEvent]) -> Vec<DeliveryOutcome> {
        let Some(target) = self.targets.get(target_name) else {
            warn!(target_name = %target_name, "Unknown target, acknowledging batch as filtered");
            return vec![DeliveryOutcome::Success; events.len()];
        };

        let indices: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| self.classifier.classify(e).contains(target_name))
            .map(|(i, _)| i)
            .collect();

        if let Some(first) = events.first() {
            metrics::record_events_filtered(&first.shard, events.len() - indices.len());
        }

        let mut outcomes = vec![DeliveryOutcome::Success; events.len()];
        if indices.is_empty() {
            return outcomes;
        }

        let batch: Vec<ChangeEvent> = indices.iter().map(|&i| events[i].clone()).collect();
        let delivered = self.coordinator.deliver(&batch, target.as_ref()).await;
        for (idx, outcome) in indices.into_iter().zip(delivered) {
            outcomes[idx] = outcome;
        }
        outcomes
    }
}

/// Fold per-target outcomes of one event into a single outcome.
///
/// No outcomes (filtered event) is success.
pub fn combine(outcomes: &[(&str, &DeliveryOutcome)]) -> DeliveryOutcome {
    let pending: Vec<_> = outcomes
        .iter()
        .filter(|(_, outcome)| outcome.needs_redelivery())
        .collect();

    let Some((_, first)) = pending.first() else {
        return DeliveryOutcome::Success;
    };

    let kind = match first {
        DeliveryOutcome::RetryableFailure { kind, .. } => *kind,
        DeliveryOutcome::PermanentFailure { kind, .. } => *kind,
        DeliveryOutcome::Success => ErrorKind::TransientDependency,
    };
    let reason = pending
        .iter()
        .map(|(name, outcome)| match outcome {
            DeliveryOutcome::RetryableFailure { reason, .. }
            | DeliveryOutcome::PermanentFailure { reason, .. } => format!("{}: {}", name, reason),
            DeliveryOutcome::Success => name.to_string(),
        })
        .collect::<Vec<_>>()
        .join("; ");

    DeliveryOutcome::RetryableFailure { kind, reason }
}
