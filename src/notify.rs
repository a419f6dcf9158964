//! Real-time notification publishing.
//!
//! Each routed email change is remapped into a flat [`Notification`] and
//! published as JSON on the configured topic. Subscribers (the web client,
//! mobile push bridges) never see raw record images.
//!
//! Every failure on this path is retryable. A notification that cannot be
//! built today is redelivered rather than dead-lettered, and the attempt
//! ledger still caps it at the retryable ceiling.

use crate::batch::DeliveryTarget;
use crate::collaborators::{BoxFuture, PubSub};
use crate::config::NotificationConfig;
use crate::error::{FanoutError, Result};
use crate::event::{ChangeEvent, ChangeKind, EmailRecord, SequenceToken};
use crate::filter::TARGET_NOTIFICATIONS;
use crate::metrics;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Payload delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub key: String,
    pub user_id: String,
    pub from: Option<String>,
    pub from_name: Option<String>,
    pub subject: Option<String>,
    pub date: Option<String>,
    pub message_id: Option<String>,
    pub summary: Option<String>,
    pub category: Option<String>,
    pub sentiment: Option<String>,
    pub is_urgent: bool,
    pub attachments: Vec<String>,
    pub change_kind: ChangeKind,
    pub sequence_token: SequenceToken,
}

impl Notification {
    /// Remap an event's image. REMOVE events fall back to the before image.
    pub fn from_event(event: &ChangeEvent) -> Result<Self> {
        let image = event
            .after_image
            .as_ref()
            .or(event.before_image.as_ref())
            .ok_or_else(|| FanoutError::validation("image", "event carries no image"))?;
        let record = EmailRecord::from_image(image)?;
        let insights = record.ai_insights.clone().unwrap_or_default();

        Ok(Self {
            key: record.sort_key.clone(),
            user_id: record.user_id.clone().unwrap_or_else(|| event.tenant.clone()),
            from: record.from,
            from_name: record.from_name,
            subject: record.subject,
            date: record.date,
            message_id: record.message_id,
            summary: insights.summary,
            category: insights.category,
            sentiment: insights.sentiment,
            is_urgent: insights.is_urgent,
            attachments: record.attachments.into_iter().map(|a| a.filename).collect(),
            change_kind: event.change_kind,
            sequence_token: event.sequence_token.clone(),
        })
    }
}

/// Publishes notifications for routed events.
pub struct NotificationPublisher {
    bus: Arc<dyn PubSub>,
    topic: String,
}

impl NotificationPublisher {
    pub fn new(bus: Arc<dyn PubSub>, config: &NotificationConfig) -> Self {
        Self {
            bus,
            topic: config.topic.clone(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn publish(&self, event: &ChangeEvent) -> Result<()> {
        let notification = Notification::from_event(event).map_err(retryable)?;
        let payload = serde_json::to_value(&notification).map_err(|e| retryable(e.into()))?;

        self.bus
            .publish(&self.topic, payload)
            .await
            .map_err(retryable)?;

        metrics::record_notification_published(&self.topic);
        debug!(
            topic = %self.topic,
            key = %event.key,
            tenant = %event.tenant,
            sequence_token = %event.sequence_token,
            "Notification published"
        );
        Ok(())
    }
}

/// Keep retryable errors as they are, demote everything else to transient.
fn retryable(err: FanoutError) -> FanoutError {
    if err.is_retryable() {
        err
    } else {
        FanoutError::transient("notifications", err.to_string())
    }
}

impl DeliveryTarget for NotificationPublisher {
    fn name(&self) -> &str {
        TARGET_NOTIFICATIONS
    }

    fn process<'a>(&'a self, event: &'a ChangeEvent) -> BoxFuture<'a, ()> {
        Box::pin(self.publish(event))
    }
}

/// Redis `PUBLISH` bus. Payloads are sent as JSON strings.
#[derive(Clone)]
pub struct RedisPubSub {
    conn: ConnectionManager,
}

impl RedisPubSub {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| FanoutError::redis("connect", e))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| FanoutError::redis("connect", e))?;
        Ok(Self::new(conn))
    }
}

impl PubSub for RedisPubSub {
    fn publish(&self, topic: &str, payload: Value) -> BoxFuture<'_, ()> {
        let topic = topic.to_string();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let body = serde_json::to_string(&payload)?;
            let _receivers: i64 = redis::cmd("PUBLISH")
                .arg(&topic)
                .arg(body)
                .query_async(&mut conn)
                .await
                .map_err(|e| FanoutError::redis("PUBLISH", e))?;
            Ok(())
        })
    }
}
