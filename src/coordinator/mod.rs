// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fan-out engine coordinator.
//!
//! Ties together:
//! - The change source ([`crate::stream::ChangeSource`]) and one
//!   [`ChangeLogReader`] per consumer
//! - Checkpoint persistence via [`CursorStore`]
//! - Routing and delivery via [`FanOutRouter`]
//!
//! # Architecture
//!
//! 1. Opens the checkpoint store and discovers shards
//! 2. Creates one consumer per target (per-target cursors) or a single
//!    shared consumer
//! 3. Spawns one worker per (consumer, shard), the only writer of that
//!    shard's checkpoint
//! 4. Flushes checkpoints on an interval and on shutdown

mod shard_worker;
mod types;

pub use types::{CircuitHealth, ConsumerHealth, EngineState, HealthCheck};

use crate::batch::{DeliveryCoordinator, DeliveryTarget};
use crate::collaborators::{ArtifactStore, KeyedStore, PubSub, SpeechSynthesizer};
use crate::config::{CursorMode, FanoutConfig};
use crate::cursor::CursorStore;
use crate::dead_letter::DeadLetterSink;
use crate::error::{FanoutError, Result};
use crate::event::{SequenceToken, ShardId};
use crate::filter::{Classifier, TargetName};
use crate::metrics;
use crate::notify::NotificationPublisher;
use crate::resilience::{retry_with_backoff, RateLimiter, RetryConfig};
use crate::router::FanOutRouter;
use crate::stream::{ChangeLogReader, ChangeSource};
use crate::tts::TtsMaterializer;
use shard_worker::{DeliveryScope, ShardWorker};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for each task before giving up on it.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shard discovery during start gives up after this many attempts.
const DISCOVERY_MAX_ATTEMPTS: usize = 10;

/// Host-provided collaborators for the built-in targets.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn KeyedStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub speech: Arc<dyn SpeechSynthesizer>,
    pub bus: Arc<dyn PubSub>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
}

/// One reader group and the targets it delivers to.
struct Consumer {
    reader: Arc<ChangeLogReader>,
    target: Option<TargetName>,
}

/// The fan-out engine.
///
/// Reads every shard of the change log, routes each event to the targets
/// whose filter it passes and advances checkpoints on per-record outcomes.
pub struct FanoutEngine {
    config: FanoutConfig,
    source: Arc<dyn ChangeSource>,
    router: Arc<FanOutRouter>,

    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    cursor_store: RwLock<Option<Arc<CursorStore>>>,
    consumers: RwLock<Vec<Consumer>>,
    shards: RwLock<Vec<ShardId>>,
    active_workers: Arc<AtomicUsize>,
    handles: RwLock<Vec<JoinHandle<()>>>,
}

impl FanoutEngine {
    /// Create an engine around a prepared router.
    ///
    /// The engine starts in `Created` state. Call [`start()`](Self::start)
    /// to begin delivering.
    pub fn new(config: FanoutConfig, source: Arc<dyn ChangeSource>, router: Arc<FanOutRouter>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            source,
            router,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            cursor_store: RwLock::new(None),
            consumers: RwLock::new(Vec::new()),
            shards: RwLock::new(Vec::new()),
            active_workers: Arc::new(AtomicUsize::new(0)),
            handles: RwLock::new(Vec::new()),
        }
    }

    /// Create an engine with the built-in TTS and notification targets.
    ///
    /// Disabled targets are left out; routes come from the config.
    pub fn with_collaborators(
        config: FanoutConfig,
        source: Arc<dyn ChangeSource>,
        collaborators: Collaborators,
    ) -> Self {
        let mut targets: Vec<Arc<dyn DeliveryTarget>> = Vec::new();
        if config.tts.enabled {
            targets.push(Arc::new(TtsMaterializer::new(
                collaborators.store.clone(),
                collaborators.artifacts.clone(),
                collaborators.speech.clone(),
                &config.tts,
            )));
        }
        if config.notifications.enabled {
            targets.push(Arc::new(NotificationPublisher::new(
                collaborators.bus.clone(),
                &config.notifications,
            )));
        }

        let coordinator = Arc::new(DeliveryCoordinator::new(
            config.settings.delivery.clone(),
            config.settings.slo.clone(),
            collaborators.dead_letters,
        ));
        let router = Arc::new(FanOutRouter::new(
            Classifier::from_config(&config),
            targets,
            coordinator,
        ));
        Self::new(config, source, router)
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<FanOutRouter> {
        &self.router
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// The checkpoint store, once started.
    pub async fn cursor_store(&self) -> Option<Arc<CursorStore>> {
        self.cursor_store.read().await.clone()
    }

    /// Consumer names in spawn order.
    pub async fn consumer_names(&self) -> Vec<String> {
        self.consumers
            .read()
            .await
            .iter()
            .map(|c| c.reader.consumer().to_string())
            .collect()
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }

    /// Start the engine.
    ///
    /// 1. Opens the checkpoint store (SQLite)
    /// 2. Discovers shards
    /// 3. Spawns a worker per (consumer, shard)
    /// 4. Spawns the checkpoint flush task
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(FanoutError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            consumer_id = %self.config.consumer_id,
            cursor_mode = ?self.config.settings.reader.cursor_mode,
            targets = ?self.router.target_names(),
            "Starting fan-out engine"
        );
        self.set_state(EngineState::Starting);

        let cursor_config = &self.config.cursor;
        let store = match CursorStore::open(&cursor_config.sqlite_path, cursor_config.wal_mode).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(error = %e, path = %cursor_config.sqlite_path, "Failed to open checkpoint store");
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        };
        *self.cursor_store.write().await = Some(Arc::clone(&store));

        let shards = match self.discover_shards().await {
            Ok(shards) => shards,
            Err(e) => {
                error!(error = %e, "Shard discovery failed");
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        };
        if shards.is_empty() {
            warn!("Change log has no shards, nothing to deliver");
        }

        self.create_consumers(&store).await;
        self.spawn_workers(&shards).await;
        *self.shards.write().await = shards;
        self.spawn_cursor_flush_task(store).await;

        self.set_state(EngineState::Running);
        info!(
            workers = self.handles.read().await.len().saturating_sub(1),
            "Fan-out engine running"
        );
        Ok(())
    }

    async fn discover_shards(&self) -> Result<Vec<ShardId>> {
        let source_retry = self.config.settings.reader.source_retry();
        let retry = RetryConfig {
            max_attempts: source_retry.max_attempts.min(DISCOVERY_MAX_ATTEMPTS),
            ..source_retry
        };
        let source = Arc::clone(&self.source);
        retry_with_backoff(&retry, "discover_shards", || source.shards(), |attempt, e| {
            warn!(attempt, error = %e, "Shard discovery failed, retrying");
        })
        .await
    }

    async fn create_consumers(&self, store: &Arc<CursorStore>) {
        let reader_config = &self.config.settings.reader;
        let consumer_id = &self.config.consumer_id;
        let make_reader = |name: String| {
            Arc::new(ChangeLogReader::new(
                name,
                Arc::clone(&self.source),
                Arc::clone(store),
                reader_config.source_retry(),
            ))
        };

        let consumers: Vec<Consumer> = match reader_config.cursor_mode {
            CursorMode::PerTarget => self
                .router
                .target_names()
                .into_iter()
                .map(|target| Consumer {
                    reader: make_reader(format!("{}:{}", consumer_id, target)),
                    target: Some(target),
                })
                .collect(),
            CursorMode::Shared => vec![Consumer {
                reader: make_reader(consumer_id.clone()),
                target: None,
            }],
        };

        *self.consumers.write().await = consumers;
    }

    async fn spawn_workers(&self, shards: &[ShardId]) {
        let reader_config = &self.config.settings.reader;
        let rate_limiter: Option<Arc<RateLimiter>> = reader_config.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.refill_rate,
                burst = cfg.burst_size,
                "Rate limiting enabled for delivery"
            );
            Arc::new(RateLimiter::new(cfg))
        });

        let consumers = self.consumers.read().await;
        let mut handles = self.handles.write().await;

        for consumer in consumers.iter() {
            for shard in shards {
                let worker = ShardWorker {
                    reader: Arc::clone(&consumer.reader),
                    router: Arc::clone(&self.router),
                    shard: shard.clone(),
                    scope: match &consumer.target {
                        Some(target) => DeliveryScope::Target(target.clone()),
                        None => DeliveryScope::AllTargets,
                    },
                    batch_size: reader_config.batch_size,
                    poll_interval: reader_config.poll_interval_duration(),
                    slo: self.config.settings.slo.clone(),
                    rate_limiter: rate_limiter.clone(),
                };
                let shutdown_rx = self.shutdown_rx.clone();
                let active = Arc::clone(&self.active_workers);

                handles.push(tokio::spawn(worker.run(shutdown_rx, active)));
                debug!(consumer = %consumer.reader.consumer(), shard = %shard, "Spawned shard worker");
            }
        }
    }

    /// Periodically persist dirty checkpoints.
    async fn spawn_cursor_flush_task(&self, store: Arc<CursorStore>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let flush_interval = self.config.cursor.flush_interval_duration();

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(flush_interval);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = store.flush_dirty().await {
                            warn!(error = %e, "Failed to flush checkpoints");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("Checkpoint flush task stopping");
                            break;
                        }
                    }
                }
            }
        });

        debug!("Spawned checkpoint flush task");
        self.handles.write().await.push(handle);
    }

    /// Health snapshot for monitoring endpoints. Performs no I/O.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let active_workers = self.active_workers.load(Ordering::SeqCst);

        let consumers = self.consumers.read().await;
        let mut consumer_health = Vec::with_capacity(consumers.len());
        let mut pending_redeliveries = 0;
        for consumer in consumers.iter() {
            let shards = consumer.reader.progress().await;
            pending_redeliveries += shards.iter().map(|s| s.pending_redeliveries).sum::<usize>();
            consumer_health.push(ConsumerHealth {
                consumer: consumer.reader.consumer().to_string(),
                target: consumer.target.clone(),
                shards,
            });
        }

        let consumer_names: Vec<&str> = consumers.iter().map(|c| c.reader.consumer()).collect();
        let mut shard_checkpoints: BTreeMap<ShardId, Option<SequenceToken>> = BTreeMap::new();
        if let Some(store) = self.cursor_store.read().await.as_ref() {
            for shard in self.shards.read().await.iter() {
                let lowest = store.shard_checkpoint(shard, &consumer_names).await;
                shard_checkpoints.insert(shard.clone(), lowest);
            }
        }

        let circuits: Vec<CircuitHealth> = self
            .router
            .coordinator()
            .circuit_states()
            .await
            .into_iter()
            .map(|(target, open)| CircuitHealth { target, open })
            .collect();

        let expected_workers = consumers.len() * self.shards.read().await.len();
        let ready = state == EngineState::Running && active_workers >= expected_workers;
        let healthy = ready && circuits.iter().all(|c| !c.open);

        HealthCheck {
            state,
            ready,
            healthy,
            active_workers,
            consumers: consumer_health,
            shard_checkpoints,
            circuits,
            pending_redeliveries,
        }
    }

    /// Shut down gracefully.
    ///
    /// 1. Signal workers to stop (in-flight batches are left for redelivery)
    /// 2. Wait for tasks to finish, with a timeout per task
    /// 3. Flush checkpoints and close the store
    pub async fn shutdown(&mut self) {
        info!("Shutting down fan-out engine");
        self.set_state(EngineState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.handles.write().await;
            std::mem::take(&mut *guard)
        };

        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for tasks to stop");
        }

        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task stopped"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task did not stop in time"),
            }
        }

        if let Some(store) = self.cursor_store.write().await.take() {
            store.close().await;
        }

        metrics::set_active_workers(0);
        self.set_state(EngineState::Stopped);
        info!("Fan-out engine stopped");
    }
}
