//! Dead-letter path for poison records.
//!
//! A record that keeps failing permanently (or exhausts its retry budget)
//! is handed to a [`DeadLetterSink`] and then dropped from redelivery.
//! The sink is the last stop: if it fails, the record stays a batch-item
//! failure so nothing is lost.
//!
//! ```rust,no_run
//! # async fn example() -> insight_fanout::error::Result<()> {
//! use insight_fanout::dead_letter::{ChannelDeadLetterSink, DeadLetterSink};
//!
//! let (sink, mut rx) = ChannelDeadLetterSink::new();
//! tokio::spawn(async move {
//!     while let Some(letter) = rx.recv().await {
//!         println!("{} {} {}", letter.target, letter.sequence_token, letter.reason);
//!     }
//! });
//! # Ok(())
//! # }
//! ```

use crate::collaborators::BoxFuture;
use crate::error::{ErrorKind, FanoutError};
use crate::event::{ChangeEvent, RecordKey, SequenceToken, ShardId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// A record that will not be delivered to one target again.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub target: String,
    pub shard: ShardId,
    pub sequence_token: SequenceToken,
    pub key: RecordKey,
    pub tenant: String,
    pub kind: ErrorKind,
    pub reason: String,
    /// Consecutive failed attempts, including the last one.
    pub attempts: u32,
    pub event: ChangeEvent,
    pub occurred_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

impl DeadLetter {
    pub fn new(
        target: &str,
        event: &ChangeEvent,
        kind: ErrorKind,
        reason: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            target: target.to_string(),
            shard: event.shard.clone(),
            sequence_token: event.sequence_token.clone(),
            key: event.key.clone(),
            tenant: event.tenant.clone(),
            kind,
            reason: reason.into(),
            attempts,
            event: event.clone(),
            occurred_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// Destination for dead letters.
pub trait DeadLetterSink: Send + Sync {
    fn publish(&self, letter: DeadLetter) -> BoxFuture<'_, ()>;
}

/// Logs and discards. Used when no dead-letter destination is configured.
#[derive(Debug, Default, Clone)]
pub struct NoopDeadLetterSink;

impl DeadLetterSink for NoopDeadLetterSink {
    fn publish(&self, letter: DeadLetter) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            warn!(
                target_name = %letter.target,
                shard = %letter.shard,
                sequence_token = %letter.sequence_token,
                key = %letter.key,
                kind = %letter.kind,
                reason = %letter.reason,
                "Dead letter discarded (no sink configured)"
            );
            Ok(())
        })
    }
}

/// Forwards dead letters to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelDeadLetterSink {
    sender: mpsc::UnboundedSender<DeadLetter>,
}

impl ChannelDeadLetterSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeadLetter>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl DeadLetterSink for ChannelDeadLetterSink {
    fn publish(&self, letter: DeadLetter) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            info!(
                target_name = %letter.target,
                sequence_token = %letter.sequence_token,
                kind = %letter.kind,
                "Dead letter queued"
            );
            self.sender
                .send(letter)
                .map_err(|_| FanoutError::transient("dead_letter", "receiver dropped"))
        })
    }
}
