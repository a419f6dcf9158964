//! # Insight Fan-out
//!
//! Change-capture fan-out for the email-intelligence pipeline.
//!
//! ## Architecture
//!
//! Every mutation of the keyed store lands in a sharded change log. The
//! engine tails each shard, filters the events and delivers each one to the
//! independent targets that want it, with at-least-once semantics and
//! per-record failure isolation:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              insight-fanout                               │
//! │                                                                           │
//! │  ┌──────────────┐   ┌────────────┐   ┌────────────┐   ┌────────────────┐  │
//! │  │ ChangeSource │──►│ ChangeLog  │──►│ Classifier │──►│ FanOutRouter   │  │
//! │  │ (per shard)  │   │ Reader     │   │ (filters)  │   │                │  │
//! │  └──────────────┘   └────────────┘   └────────────┘   └───────┬────────┘  │
//! │                           ▲                                   │           │
//! │                ack(failed │ tokens)                           ▼           │
//! │                           │              ┌───────────────────────────┐    │
//! │  ┌─────────────┐          └──────────────│ DeliveryCoordinator       │    │
//! │  │ CursorStore │◄─ checkpoints           │ timeout, circuit, ledger  │    │
//! │  │ (SQLite)    │                         └─────┬─────────────┬───────┘    │
//! │  └─────────────┘                               ▼             ▼            │
//! │                                        TtsMaterializer  Notification      │
//! │                                                         Publisher         │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery Guarantees
//!
//! 1. **At-least-once**: a checkpoint only moves past events every target
//!    has handled. Failed events are redelivered in later batches.
//! 2. **Per-key order**: events for one record are delivered in token
//!    order; a retryable failure holds back later events for that record.
//! 3. **Poison isolation**: a record failing validation is dead-lettered
//!    after three attempts instead of blocking its shard.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use insight_fanout::{Collaborators, FanoutConfig, FanoutEngine};
//! use insight_fanout::stream::RedisChangeSource;
//! use std::sync::Arc;
//!
//! # async fn run(collaborators: Collaborators) -> insight_fanout::Result<()> {
//! let config = FanoutConfig::from_file("fanout.json")?;
//! let source = RedisChangeSource::connect(&config.source).await?;
//!
//! let mut engine = FanoutEngine::with_collaborators(config, Arc::new(source), collaborators);
//! engine.start().await?;
//!
//! // Runs until shutdown
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod circuit_breaker;
pub mod collaborators;
pub mod config;
pub mod coordinator;
pub mod cursor;
pub mod dead_letter;
pub mod error;
pub mod event;
pub mod filter;
pub mod metrics;
pub mod notify;
pub mod resilience;
pub mod router;
pub mod stream;
pub mod tts;

// Re-exports for convenience
pub use batch::{BatchResponse, DeliveryCoordinator, DeliveryOutcome, DeliveryTarget};
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitState};
pub use collaborators::{ArtifactStore, BoxFuture, KeyedStore, PubSub, SpeechSynthesizer};
pub use config::{CursorMode, FanoutConfig, FanoutSettings};
pub use coordinator::{Collaborators, EngineState, FanoutEngine, HealthCheck};
pub use cursor::CursorStore;
pub use dead_letter::{DeadLetter, DeadLetterSink};
pub use error::{ErrorKind, FanoutError, Result};
pub use event::{ChangeEvent, ChangeKind, EmailRecord, RecordKey, SequenceToken, ShardId};
pub use filter::{Classifier, FilterRule};
pub use notify::{Notification, NotificationPublisher};
pub use router::FanOutRouter;
pub use stream::{ChangeLogReader, ChangeSource, InMemoryChangeLog};
pub use tts::TtsMaterializer;
