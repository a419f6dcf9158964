//! External collaborator traits.
//!
//! The pipeline never talks to a concrete keyed store, object store, speech
//! engine or bus directly. The host provides implementations of these
//! traits, which keeps the delivery logic testable with the in-memory
//! versions below.
//!
//! # Example
//!
//! ```rust,no_run
//! use insight_fanout::collaborators::{BoxFuture, SpeechSynthesizer};
//! use insight_fanout::config::VoiceProfile;
//!
//! struct Silence;
//!
//! impl SpeechSynthesizer for Silence {
//!     fn synthesize(&self, _text: &str, _voice: &VoiceProfile) -> BoxFuture<'_, Vec<u8>> {
//!         Box::pin(async { Ok(Vec::new()) }) // empty audio is retried
//!     }
//! }
//! ```

use crate::config::VoiceProfile;
use crate::error::{FanoutError, Result};
use crate::event::{lookup_path, RecordKey};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

// ═══════════════════════════════════════════════════════════════════════════════
// Keyed store
// ═══════════════════════════════════════════════════════════════════════════════

/// Guard evaluated atomically with a conditional update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    /// Apply only if the record still exists.
    RecordExists,
    /// Apply only if the record exists and the target field is not set yet.
    RecordExistsAndFieldAbsent,
}

/// What a conditional update did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    RecordMissing,
    FieldAlreadySet,
}

/// The keyed store the change log is produced from.
pub trait KeyedStore: Send + Sync + 'static {
    /// Fetch a record image.
    fn get(&self, key: &RecordKey) -> BoxFuture<'_, Option<Value>>;

    /// Set `field_path` (dotted) to `value` if `condition` holds.
    fn conditional_update(
        &self,
        key: &RecordKey,
        field_path: &str,
        value: Value,
        condition: WriteCondition,
    ) -> BoxFuture<'_, UpdateOutcome>;
}

/// In-memory keyed store.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeyedStore {
    records: Arc<RwLock<HashMap<RecordKey, Value>>>,
}

impl InMemoryKeyedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, key: RecordKey, image: Value) {
        self.records.write().await.insert(key, image);
    }

    pub async fn remove(&self, key: &RecordKey) -> Option<Value> {
        self.records.write().await.remove(key)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl KeyedStore for InMemoryKeyedStore {
    fn get(&self, key: &RecordKey) -> BoxFuture<'_, Option<Value>> {
        let key = key.clone();
        Box::pin(async move { Ok(self.records.read().await.get(&key).cloned()) })
    }

    fn conditional_update(
        &self,
        key: &RecordKey,
        field_path: &str,
        value: Value,
        condition: WriteCondition,
    ) -> BoxFuture<'_, UpdateOutcome> {
        let key = key.clone();
        let field_path = field_path.to_string();
        Box::pin(async move {
            let mut records = self.records.write().await;
            let Some(record) = records.get_mut(&key) else {
                return Ok(UpdateOutcome::RecordMissing);
            };

            if condition == WriteCondition::RecordExistsAndFieldAbsent
                && lookup_path(record, &field_path).is_some_and(|v| !v.is_null())
            {
                return Ok(UpdateOutcome::FieldAlreadySet);
            }

            set_path(record, &field_path, value)?;
            Ok(UpdateOutcome::Applied)
        })
    }
}

/// Write `value` at a dotted path, creating intermediate objects.
pub fn set_path(doc: &mut Value, path: &str, value: Value) -> Result<()> {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        return Err(FanoutError::validation(path, "empty field path"));
    };

    let mut node = doc;
    for seg in parents {
        let obj = node
            .as_object_mut()
            .ok_or_else(|| FanoutError::validation(path, format!("{} is not an object", seg)))?;
        node = obj
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if node.is_null() {
            *node = Value::Object(Map::new());
        }
    }

    node.as_object_mut()
        .ok_or_else(|| FanoutError::validation(path, "parent is not an object"))?
        .insert(last.to_string(), value);
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Artifact storage
// ═══════════════════════════════════════════════════════════════════════════════

/// Object storage for generated artifacts.
pub trait ArtifactStore: Send + Sync + 'static {
    /// Store bytes under `key`, returning a reference usable by clients.
    fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> BoxFuture<'_, String>;
}

/// A stored artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// In-memory artifact store. References look like `mem://{key}`.
#[derive(Debug, Default, Clone)]
pub struct InMemoryArtifactStore {
    objects: Arc<RwLock<HashMap<String, StoredArtifact>>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<StoredArtifact> {
        self.objects.read().await.get(key).cloned()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> BoxFuture<'_, String> {
        let key = key.to_string();
        let content_type = content_type.to_string();
        Box::pin(async move {
            let reference = format!("mem://{}", key);
            self.objects.write().await.insert(
                key,
                StoredArtifact {
                    bytes,
                    content_type,
                },
            );
            Ok(reference)
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Speech synthesis
// ═══════════════════════════════════════════════════════════════════════════════

/// Text-to-speech engine.
pub trait SpeechSynthesizer: Send + Sync + 'static {
    /// Render `text` with `voice`. An empty result is a transient engine fault.
    fn synthesize(&self, text: &str, voice: &VoiceProfile) -> BoxFuture<'_, Vec<u8>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Pub/sub
// ═══════════════════════════════════════════════════════════════════════════════

/// Real-time notification bus.
pub trait PubSub: Send + Sync + 'static {
    fn publish(&self, topic: &str, payload: Value) -> BoxFuture<'_, ()>;
}

/// Recording bus for embedding and tests.
#[derive(Debug, Default, Clone)]
pub struct InMemoryPubSub {
    messages: Arc<RwLock<Vec<(String, Value)>>>,
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<(String, Value)> {
        self.messages.read().await.clone()
    }

    pub async fn messages_for(&self, topic: &str) -> Vec<Value> {
        self.messages
            .read()
            .await
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

impl PubSub for InMemoryPubSub {
    fn publish(&self, topic: &str, payload: Value) -> BoxFuture<'_, ()> {
        let topic = topic.to_string();
        Box::pin(async move {
            self.messages.write().await.push((topic, payload));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> RecordKey {
        RecordKey::new("USER#a@example.com", "EMAIL#1")
    }

    #[tokio::test]
    async fn test_conditional_update_record_missing() {
        let store = InMemoryKeyedStore::new();
        let outcome = store
            .conditional_update(&key(), "aiInsights.summaryAudioUrl", json!("x"), WriteCondition::RecordExists)
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::RecordMissing);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_conditional_update_applies_nested() {
        let store = InMemoryKeyedStore::new();
        store.put(key(), json!({"aiInsights": {"summary": "hi"}})).await;

        let outcome = store
            .conditional_update(&key(), "aiInsights.summaryAudioUrl", json!("mem://a"), WriteCondition::RecordExists)
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Applied);

        let record = store.get(&key()).await.unwrap().unwrap();
        assert_eq!(record["aiInsights"]["summaryAudioUrl"], json!("mem://a"));
        assert_eq!(record["aiInsights"]["summary"], json!("hi"));
    }

    #[tokio::test]
    async fn test_conditional_update_field_absent_guard() {
        let store = InMemoryKeyedStore::new();
        store
            .put(key(), json!({"aiInsights": {"summaryAudioUrl": "mem://first"}}))
            .await;

        let outcome = store
            .conditional_update(
                &key(),
                "aiInsights.summaryAudioUrl",
                json!("mem://second"),
                WriteCondition::RecordExistsAndFieldAbsent,
            )
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::FieldAlreadySet);

        let record = store.get(&key()).await.unwrap().unwrap();
        assert_eq!(record["aiInsights"]["summaryAudioUrl"], json!("mem://first"));
    }

    #[tokio::test]
    async fn test_conditional_update_null_field_counts_as_absent() {
        let store = InMemoryKeyedStore::new();
        store.put(key(), json!({"aiInsights": {"summaryAudioUrl": null}})).await;
        let outcome = store
            .conditional_update(
                &key(),
                "aiInsights.summaryAudioUrl",
                json!("mem://x"),
                WriteCondition::RecordExistsAndFieldAbsent,
            )
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Applied);
    }

    #[test]
    fn test_set_path_creates_parents() {
        let mut doc = json!({});
        set_path(&mut doc, "a.b.c", json!(1)).unwrap();
        assert_eq!(doc, json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn test_set_path_rejects_scalar_parent() {
        let mut doc = json!({"a": 5});
        assert!(set_path(&mut doc, "a.b", json!(1)).is_err());
        assert!(set_path(&mut doc, "", json!(1)).is_err());
    }

    #[tokio::test]
    async fn test_artifact_store_put() {
        let store = InMemoryArtifactStore::new();
        let reference = store
            .put("audio/t1/abc.mp3", vec![1, 2, 3], "audio/mpeg")
            .await
            .unwrap();
        assert_eq!(reference, "mem://audio/t1/abc.mp3");
        let stored = store.get("audio/t1/abc.mp3").await.unwrap();
        assert_eq!(stored.bytes, vec![1, 2, 3]);
        assert_eq!(stored.content_type, "audio/mpeg");
    }

    #[tokio::test]
    async fn test_pubsub_records_by_topic() {
        let bus = InMemoryPubSub::new();
        bus.publish("a", json!(1)).await.unwrap();
        bus.publish("b", json!(2)).await.unwrap();
        assert_eq!(bus.messages().await.len(), 2);
        assert_eq!(bus.messages_for("b").await, vec![json!(2)]);
    }
}
