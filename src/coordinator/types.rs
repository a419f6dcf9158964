//! Engine state and health types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ shutdown()                   │ (cursor store open, shards found)
//!    ↓                              ↓
//! Stopped ←── ShuttingDown ←──── Running
//!
//! Starting ──(cursor store or shard discovery failed)──→ Failed
//! ```
//!
//! - **Created**: After `FanoutEngine::new()`. Nothing opened yet.
//! - **Starting**: Opening the checkpoint store and discovering shards.
//! - **Running**: One worker per (consumer, shard) is delivering batches.
//! - **ShuttingDown**: Workers are stopping; in-flight batches are abandoned
//!   and redelivered on the next start.
//! - **Stopped**: Checkpoints flushed. Safe to drop.
//! - **Failed**: Start-up failed. Check logs.

use crate::event::{SequenceToken, ShardId};
use crate::filter::TargetName;
use crate::stream::ShardProgress;
use std::collections::BTreeMap;

/// State of the fan-out engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Health snapshot returned by [`FanoutEngine::health_check()`](super::FanoutEngine::health_check).
///
/// Collected from in-memory state only; building it performs no I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Running with every worker alive.
    pub ready: bool,
    /// Ready and no target circuit open.
    pub healthy: bool,
    pub active_workers: usize,
    pub consumers: Vec<ConsumerHealth>,
    /// Lowest checkpoint across all consumers, per shard. `None` until
    /// every consumer has a checkpoint on that shard.
    pub shard_checkpoints: BTreeMap<ShardId, Option<SequenceToken>>,
    pub circuits: Vec<CircuitHealth>,
    pub pending_redeliveries: usize,
}

/// Progress of one consumer (reader group).
#[derive(Debug, Clone)]
pub struct ConsumerHealth {
    pub consumer: String,
    /// The target this consumer delivers to. `None` in shared cursor mode.
    pub target: Option<TargetName>,
    pub shards: Vec<ShardProgress>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitHealth {
    pub target: TargetName,
    pub open: bool,
}
