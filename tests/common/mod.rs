//! Shared test utilities for pipeline, chaos and integration tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - A recording speech engine and scriptable delivery targets
//! - Email record and change event builders
//! - A harness wiring the in-memory collaborators together

#![allow(dead_code)]

pub mod containers;

pub use containers::*;

use insight_fanout::batch::DeliveryTarget;
use insight_fanout::collaborators::{
    BoxFuture, InMemoryArtifactStore, InMemoryKeyedStore, InMemoryPubSub, SpeechSynthesizer,
};
use insight_fanout::config::VoiceProfile;
use insight_fanout::coordinator::Collaborators;
use insight_fanout::cursor::CursorStore;
use insight_fanout::dead_letter::{ChannelDeadLetterSink, DeadLetter};
use insight_fanout::event::{ChangeEvent, ChangeKind, RecordKey, SequenceToken};
use insight_fanout::stream::InMemoryChangeLog;
use insight_fanout::FanoutError;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

// =============================================================================
// Builders
// =============================================================================

pub fn email_key(tenant: &str, id: &str) -> RecordKey {
    RecordKey::new(format!("USER#{}", tenant), format!("EMAIL#{}", id))
}

/// Email record image as written by the ingestion pipeline.
pub fn email_image(tenant: &str, id: &str, summary: Option<&str>) -> Value {
    let mut insights = json!({
        "category": "Work",
        "sentiment": "Neutral",
        "is_urgent": false
    });
    if let Some(summary) = summary {
        insights["summary"] = json!(summary);
    }
    json!({
        "PK": format!("USER#{}", tenant),
        "SK": format!("EMAIL#{}", id),
        "userId": tenant,
        "from": "sender@example.com",
        "fromName": "Sender",
        "subject": format!("Subject {}", id),
        "date": "2025-03-01T09:00:00Z",
        "messageId": format!("<{}@mail>", id),
        "aiInsights": insights
    })
}

/// INSERT of an email with an explicit token.
pub fn email_insert(shard: &str, token: &str, tenant: &str, id: &str, summary: Option<&str>) -> ChangeEvent {
    ChangeEvent::from_record_change(
        shard,
        token,
        ChangeKind::Insert,
        email_key(tenant, id),
        None,
        Some(email_image(tenant, id, summary)),
    )
    .unwrap()
}

/// MODIFY of an email setting `subject`.
pub fn email_modify(shard: &str, token: &str, tenant: &str, id: &str, subject: &str) -> ChangeEvent {
    let before = email_image(tenant, id, Some("s"));
    let mut after = before.clone();
    after["subject"] = json!(subject);
    ChangeEvent::from_record_change(
        shard,
        token,
        ChangeKind::Modify,
        email_key(tenant, id),
        Some(before),
        Some(after),
    )
    .unwrap()
}

// =============================================================================
// Recording speech engine
// =============================================================================

/// Speech engine that records requests and can be told to misbehave.
#[derive(Default)]
pub struct RecordingSpeech {
    requests: Mutex<Vec<(String, String)>>,
    silent: AtomicBool,
    failures_left: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl RecordingSpeech {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return empty audio from now on.
    pub fn go_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Fail the next `n` calls with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    /// `(text, voice_id)` for every call, in call order.
    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl SpeechSynthesizer for RecordingSpeech {
    fn synthesize(&self, text: &str, voice: &VoiceProfile) -> BoxFuture<'_, Vec<u8>> {
        self.requests
            .lock()
            .unwrap()
            .push((text.to_string(), voice.voice_id.clone()));
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let silent = self.silent.load(Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        let audio = format!("AUDIO[{}]", text).into_bytes();

        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if fail {
                return Err(FanoutError::transient("speech", "engine unavailable"));
            }
            Ok(if silent { Vec::new() } else { audio })
        })
    }
}

// =============================================================================
// Scripted target
// =============================================================================

/// What a scripted target does with one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Transient,
    Permanent,
    Hang,
}

/// Delivery target whose per-record behavior is set by the test.
///
/// Successful events are recorded in call order, and the last after image
/// per key is kept as the "applied" state.
pub struct ScriptedTarget {
    name: String,
    scripts: Mutex<HashMap<String, Script>>,
    delivered: Mutex<Vec<(RecordKey, SequenceToken)>>,
    applied: Mutex<HashMap<RecordKey, Value>>,
    calls: AtomicUsize,
}

impl ScriptedTarget {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            scripts: Mutex::new(HashMap::new()),
            delivered: Mutex::new(Vec::new()),
            applied: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        })
    }

    /// Script the record whose sort key is `EMAIL#{id}`.
    pub fn script(&self, id: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(format!("EMAIL#{}", id), script);
    }

    pub fn heal(&self, id: &str) {
        self.scripts.lock().unwrap().remove(&format!("EMAIL#{}", id));
    }

    pub fn heal_all(&self) {
        self.scripts.lock().unwrap().clear();
    }

    pub fn delivered(&self) -> Vec<(RecordKey, SequenceToken)> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn delivered_tokens(&self) -> HashSet<SequenceToken> {
        self.delivered().into_iter().map(|(_, t)| t).collect()
    }

    pub fn applied(&self, key: &RecordKey) -> Option<Value> {
        self.applied.lock().unwrap().get(key).cloned()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DeliveryTarget for ScriptedTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn process<'a>(&'a self, event: &'a ChangeEvent) -> BoxFuture<'a, ()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().unwrap().get(&event.key.sort_key).copied();

        Box::pin(async move {
            match script {
                Some(Script::Transient) => Err(FanoutError::transient(&self.name, "downstream 503")),
                Some(Script::Permanent) => Err(FanoutError::validation("image", "unprocessable")),
                Some(Script::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
                None => {
                    self.delivered
                        .lock()
                        .unwrap()
                        .push((event.key.clone(), event.sequence_token.clone()));
                    if let Some(after) = &event.after_image {
                        self.applied
                            .lock()
                            .unwrap()
                            .insert(event.key.clone(), after.clone());
                    }
                    Ok(())
                }
            }
        })
    }
}

// =============================================================================
// Harness
// =============================================================================

/// In-memory collaborators wired together.
pub struct Harness {
    pub log: InMemoryChangeLog,
    pub store: InMemoryKeyedStore,
    pub artifacts: InMemoryArtifactStore,
    pub speech: Arc<RecordingSpeech>,
    pub bus: InMemoryPubSub,
    pub dead_letters: mpsc::UnboundedReceiver<DeadLetter>,
    pub collaborators: Collaborators,
}

impl Harness {
    pub async fn new(shards: &[&str]) -> Self {
        init_tracing();
        let log = InMemoryChangeLog::new();
        for shard in shards {
            log.add_shard(shard).await;
        }
        let store = InMemoryKeyedStore::new();
        let artifacts = InMemoryArtifactStore::new();
        let speech = Arc::new(RecordingSpeech::new());
        let bus = InMemoryPubSub::new();
        let (sink, dead_letters) = ChannelDeadLetterSink::new();

        let collaborators = Collaborators {
            store: Arc::new(store.clone()),
            artifacts: Arc::new(artifacts.clone()),
            speech: speech.clone(),
            bus: Arc::new(bus.clone()),
            dead_letters: Arc::new(sink),
        };

        Self {
            log,
            store,
            artifacts,
            speech,
            bus,
            dead_letters,
            collaborators,
        }
    }

    /// Write an email to the store and its INSERT to the change log.
    pub async fn insert_email(&self, shard: &str, tenant: &str, id: &str, summary: Option<&str>) -> SequenceToken {
        let image = email_image(tenant, id, summary);
        self.store.put(email_key(tenant, id), image.clone()).await;
        self.log
            .append(shard, ChangeKind::Insert, email_key(tenant, id), None, Some(image))
            .await
            .unwrap()
    }

    /// Drain everything dead-lettered so far.
    pub fn take_dead_letters(&mut self) -> Vec<DeadLetter> {
        let mut letters = Vec::new();
        while let Ok(letter) = self.dead_letters.try_recv() {
            letters.push(letter);
        }
        letters
    }
}

/// Route engine logs to the test output. Filter with `FANOUT_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("FANOUT_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

pub async fn memory_cursor_store() -> Arc<CursorStore> {
    Arc::new(CursorStore::new(":memory:").await.unwrap())
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
