//! Text-to-speech materialization of email summaries.
//!
//! For each new email the materializer narrates the AI summary, stores the
//! audio as a tenant-scoped artifact and links it back onto the record:
//!
//! ```text
//! PendingSummary ──▶ Synthesizing ──▶ Stored ──▶ Linked
//!       │                 │              │          ▲
//!   no summary       empty audio    put failed      │
//!   VALIDATION        TRANSIENT      TRANSIENT      │
//!                                                   │
//!   summaryAudioUrl already present ────────────────┘ (no-op)
//! ```
//!
//! Synthesis, artifact storage and the link write each run under their own
//! deadline; a timeout names the stage and is retryable.
//!
//! The link step is a conditional write: it applies only while the record
//! exists and has no audio URL yet. A redelivered event therefore leaves
//! at most one reference on the record. An artifact written by an attempt
//! that loses the link race is left in place.

use crate::batch::DeliveryTarget;
use crate::collaborators::{
    ArtifactStore, BoxFuture, KeyedStore, SpeechSynthesizer, UpdateOutcome, WriteCondition,
};
use crate::config::{AudioFormat, TtsConfig, VoiceSelection};
use crate::error::{FanoutError, Result};
use crate::event::{ChangeEvent, EmailRecord};
use crate::filter::TARGET_TTS;
use crate::metrics;
use crate::resilience::RateLimiter;
use serde_json::json;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Field the audio reference is written to.
pub const SUMMARY_AUDIO_FIELD: &str = "aiInsights.summaryAudioUrl";

/// Progress of one record through the materializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsStage {
    PendingSummary,
    Synthesizing,
    Stored,
    Linked,
}

impl TtsStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TtsStage::PendingSummary => "pending_summary",
            TtsStage::Synthesizing => "synthesizing",
            TtsStage::Stored => "stored",
            TtsStage::Linked => "linked",
        }
    }
}

impl fmt::Display for TtsStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Narrates summaries and links the audio onto the email record.
pub struct TtsMaterializer {
    store: Arc<dyn KeyedStore>,
    artifacts: Arc<dyn ArtifactStore>,
    speech: Arc<dyn SpeechSynthesizer>,
    voices: VoiceSelection,
    artifact_prefix: String,
    limiter: Option<Arc<RateLimiter>>,
    deadlines: StageDeadlines,
}

#[derive(Debug, Clone, Copy)]
struct StageDeadlines {
    synthesis: Duration,
    artifact_put: Duration,
    link: Duration,
}

impl fmt::Debug for TtsMaterializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtsMaterializer")
            .field("voices", &self.voices)
            .field("artifact_prefix", &self.artifact_prefix)
            .field("rate_limited", &self.limiter.is_some())
            .field("deadlines", &self.deadlines)
            .finish()
    }
}

impl TtsMaterializer {
    pub fn new(
        store: Arc<dyn KeyedStore>,
        artifacts: Arc<dyn ArtifactStore>,
        speech: Arc<dyn SpeechSynthesizer>,
        config: &TtsConfig,
    ) -> Self {
        let limiter = config
            .rate_limit_config()
            .map(|c| Arc::new(RateLimiter::new(c)));
        Self {
            store,
            artifacts,
            speech,
            voices: config.voices.clone(),
            artifact_prefix: config.artifact_prefix.trim_end_matches('/').to_string(),
            limiter,
            deadlines: StageDeadlines {
                synthesis: config.synthesis_timeout_duration(),
                artifact_put: config.artifact_put_timeout_duration(),
                link: config.link_timeout_duration(),
            },
        }
    }

    /// Share a limiter across materializers (e.g. one per engine).
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn voices(&self) -> &VoiceSelection {
        &self.voices
    }

    /// Fresh artifact key: `{prefix}/{tenant}/{uuid}.{ext}`.
    pub fn artifact_key(&self, tenant: &str, format: AudioFormat) -> String {
        format!(
            "{}/{}/{}.{}",
            self.artifact_prefix,
            tenant,
            uuid::Uuid::new_v4(),
            format.extension()
        )
    }

    /// Run one record through the state machine. Returns the final stage.
    pub async fn materialize(&self, event: &ChangeEvent) -> Result<TtsStage> {
        let image = event
            .after_image
            .as_ref()
            .ok_or_else(|| FanoutError::validation("after_image", "missing"))?;
        let record = EmailRecord::from_image(image)?;

        if let Some(url) = record.summary_audio_url() {
            debug!(
                key = %event.key,
                sequence_token = %event.sequence_token,
                url = %url,
                "Summary audio already linked, skipping"
            );
            metrics::record_tts_stage("already_linked");
            return Ok(TtsStage::Linked);
        }

        // PendingSummary
        if let Some(error) = record.ai_insights.as_ref().and_then(|ai| ai.error.as_deref()) {
            return Err(FanoutError::validation(
                "aiInsights.error",
                format!("insight extraction failed: {}", error),
            ));
        }
        let text = record
            .summary_text()
            .ok_or_else(|| FanoutError::validation("aiInsights.summary", "missing or blank"))?;
        check_tenant_segment(&event.tenant)?;
        metrics::record_tts_stage(TtsStage::PendingSummary.as_str());

        // Synthesizing
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }
        let voice = self.voices.voice_for(&event.tenant);
        let audio = bounded(
            "speech synthesize",
            self.deadlines.synthesis,
            self.speech.synthesize(text, voice),
        )
        .await?;
        if audio.is_empty() {
            return Err(FanoutError::transient("speech", "empty audio stream"));
        }
        metrics::record_tts_stage(TtsStage::Synthesizing.as_str());
        metrics::record_tts_audio_bytes(audio.len());

        // Stored
        let format = voice.output_format;
        let artifact_key = self.artifact_key(&event.tenant, format);
        let reference = bounded(
            "artifact put",
            self.deadlines.artifact_put,
            self.artifacts.put(&artifact_key, audio, format.content_type()),
        )
        .await?;
        metrics::record_tts_stage(TtsStage::Stored.as_str());

        // Linked
        let outcome = bounded(
            "link audio",
            self.deadlines.link,
            self.store.conditional_update(
                &event.key,
                SUMMARY_AUDIO_FIELD,
                json!(reference),
                WriteCondition::RecordExistsAndFieldAbsent,
            ),
        )
        .await?;

        match outcome {
            UpdateOutcome::Applied => {
                metrics::record_tts_stage(TtsStage::Linked.as_str());
                info!(
                    key = %event.key,
                    tenant = %event.tenant,
                    voice = %voice.voice_id,
                    artifact = %artifact_key,
                    "Summary audio linked"
                );
                Ok(TtsStage::Linked)
            }
            UpdateOutcome::FieldAlreadySet => {
                debug!(
                    key = %event.key,
                    artifact = %artifact_key,
                    "Audio linked by an earlier attempt, leaving it"
                );
                metrics::record_tts_stage("already_linked");
                Ok(TtsStage::Linked)
            }
            UpdateOutcome::RecordMissing => Err(FanoutError::Conflict(format!(
                "record {} no longer exists",
                event.key
            ))),
        }
    }
}

/// Tenants become one path segment of the artifact key.
fn check_tenant_segment(tenant: &str) -> Result<()> {
    if tenant.is_empty() {
        return Err(FanoutError::validation("tenant", "missing"));
    }
    let escapes = tenant == "." || tenant == ".." || tenant.contains(['/', '\\']);
    if escapes || tenant.chars().any(char::is_control) {
        return Err(FanoutError::validation(
            "tenant",
            format!("{:?} is not a valid artifact path segment", tenant),
        ));
    }
    Ok(())
}

async fn bounded<T>(stage: &str, limit: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            metrics::record_tts_timeout(stage);
            warn!(stage, timeout_ms = limit.as_millis() as u64, "TTS stage timed out");
            Err(FanoutError::timeout(stage, limit))
        }
    }
}

impl DeliveryTarget for TtsMaterializer {
    fn name(&self) -> &str {
        TARGET_TTS
    }

    fn process<'a>(&'a self, event: &'a ChangeEvent) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.materialize(event).await.map(|_| ()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryArtifactStore, InMemoryKeyedStore};
    use crate::config::VoiceProfile;
    use crate::error::ErrorKind;
    use crate::event::{ChangeKind, RecordKey};
    use serde_json::Value;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeSpeech {
        silent: bool,
        requests: Mutex<Vec<(String, String)>>,
    }

    impl SpeechSynthesizer for FakeSpeech {
        fn synthesize(&self, text: &str, voice: &VoiceProfile) -> BoxFuture<'_, Vec<u8>> {
            self.requests
                .lock()
                .unwrap()
                .push((text.to_string(), voice.voice_id.clone()));
            let audio = if self.silent { Vec::new() } else { text.as_bytes().to_vec() };
            Box::pin(async move { Ok(audio) })
        }
    }

    struct Fixture {
        store: InMemoryKeyedStore,
        artifacts: InMemoryArtifactStore,
        speech: Arc<FakeSpeech>,
        tts: TtsMaterializer,
    }

    fn fixture(speech: FakeSpeech, config: TtsConfig) -> Fixture {
        let store = InMemoryKeyedStore::new();
        let artifacts = InMemoryArtifactStore::new();
        let speech = Arc::new(speech);
        let tts = TtsMaterializer::new(
            Arc::new(store.clone()),
            Arc::new(artifacts.clone()),
            speech.clone(),
            &config,
        );
        Fixture {
            store,
            artifacts,
            speech,
            tts,
        }
    }

    fn image(summary: Option<&str>) -> Value {
        let mut ai = json!({"category": "Work"});
        if let Some(s) = summary {
            ai["summary"] = json!(s);
        }
        json!({
            "PK": "USER#a@example.com",
            "SK": "EMAIL#m1",
            "userId": "a@example.com",
            "subject": "Standup",
            "aiInsights": ai
        })
    }

    fn insert(image: Value) -> ChangeEvent {
        ChangeEvent::from_record_change(
            "s0",
            "1-0",
            ChangeKind::Insert,
            RecordKey::new("USER#a@example.com", "EMAIL#m1"),
            None,
            Some(image),
        )
        .unwrap()
    }

    async fn stored_url(store: &InMemoryKeyedStore) -> Option<String> {
        store
            .get(&RecordKey::new("USER#a@example.com", "EMAIL#m1"))
            .await
            .unwrap()
            .and_then(|r| r["aiInsights"]["summaryAudioUrl"].as_str().map(str::to_string))
    }

    #[tokio::test]
    async fn test_materialize_links_tenant_scoped_audio() {
        let f = fixture(FakeSpeech::default(), TtsConfig::default());
        let img = image(Some("Meeting at 10am"));
        f.store.put(RecordKey::new("USER#a@example.com", "EMAIL#m1"), img.clone()).await;

        let stage = f.tts.materialize(&insert(img)).await.unwrap();

        assert_eq!(stage, TtsStage::Linked);
        let keys = f.artifacts.keys().await;
        assert_eq!(keys.len(), 1);
        assert!(keys[0].starts_with("audio/a@example.com/"));
        assert!(keys[0].ends_with(".mp3"));
        let artifact = f.artifacts.get(&keys[0]).await.unwrap();
        assert_eq!(artifact.content_type, "audio/mpeg");
        assert!(!artifact.bytes.is_empty());
        assert_eq!(stored_url(&f.store).await, Some(format!("mem://{}", keys[0])));
    }

    #[tokio::test]
    async fn test_missing_or_blank_summary_is_validation() {
        let f = fixture(FakeSpeech::default(), TtsConfig::default());
        for img in [image(None), image(Some("   "))] {
            let err = f.tts.materialize(&insert(img)).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
        assert!(f.speech.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insight_error_is_validation() {
        let f = fixture(FakeSpeech::default(), TtsConfig::default());
        let mut img = image(Some("x"));
        img["aiInsights"]["error"] = json!("EmptyMessage");
        let err = f.tts.materialize(&insert(img)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_existing_audio_url_is_noop() {
        let f = fixture(FakeSpeech::default(), TtsConfig::default());
        let mut img = image(Some("Meeting at 10am"));
        img["aiInsights"]["summaryAudioUrl"] = json!("mem://audio/old.mp3");

        let stage = f.tts.materialize(&insert(img)).await.unwrap();

        assert_eq!(stage, TtsStage::Linked);
        assert!(f.speech.requests.lock().unwrap().is_empty());
        assert!(f.artifacts.is_empty().await);
    }

    #[tokio::test]
    async fn test_empty_audio_is_transient() {
        let f = fixture(
            FakeSpeech {
                silent: true,
                ..Default::default()
            },
            TtsConfig::default(),
        );
        let err = f
            .tts
            .materialize(&insert(image(Some("Meeting at 10am"))))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientDependency);
        assert!(f.artifacts.is_empty().await);
    }

    #[tokio::test]
    async fn test_deleted_record_is_conflict() {
        let f = fixture(FakeSpeech::default(), TtsConfig::default());
        let err = f
            .tts
            .materialize(&insert(image(Some("Meeting at 10am"))))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_redelivery_keeps_first_link() {
        let f = fixture(FakeSpeech::default(), TtsConfig::default());
        let img = image(Some("Meeting at 10am"));
        f.store.put(RecordKey::new("USER#a@example.com", "EMAIL#m1"), img.clone()).await;
        let event = insert(img);

        f.tts.materialize(&event).await.unwrap();
        let first = stored_url(&f.store).await;
        // Same stale image redelivered: synthesis runs again, the link does not.
        f.tts.materialize(&event).await.unwrap();

        assert_eq!(stored_url(&f.store).await, first);
        assert_eq!(f.artifacts.len().await, 2);
    }

    #[tokio::test]
    async fn test_voice_selected_by_tenant() {
        let mut config = TtsConfig::default();
        config.voices = VoiceSelection::default().with_voice(
            "a@example.com",
            VoiceProfile {
                voice_id: "Matthew".into(),
                output_format: AudioFormat::OggVorbis,
                ..Default::default()
            },
        );
        let f = fixture(FakeSpeech::default(), config);
        let img = image(Some("Meeting at 10am"));
        f.store.put(RecordKey::new("USER#a@example.com", "EMAIL#m1"), img.clone()).await;

        f.tts.materialize(&insert(img)).await.unwrap();

        let requests = f.speech.requests.lock().unwrap().clone();
        assert_eq!(requests, vec![("Meeting at 10am".to_string(), "Matthew".to_string())]);
        assert!(f.artifacts.keys().await[0].ends_with(".ogg"));
    }

    struct HangingArtifacts;

    impl ArtifactStore for HangingArtifacts {
        fn put(&self, _key: &str, _bytes: Vec<u8>, _content_type: &str) -> BoxFuture<'_, String> {
            Box::pin(async {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                Ok("never".to_string())
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_artifact_put_times_out_at_its_stage() {
        let mut config = TtsConfig::default();
        config.artifact_put_timeout = "250ms".to_string();
        let store = InMemoryKeyedStore::new();
        let speech = Arc::new(FakeSpeech::default());
        let tts = TtsMaterializer::new(
            Arc::new(store.clone()),
            Arc::new(HangingArtifacts),
            speech.clone(),
            &config,
        );
        let img = image(Some("Meeting at 10am"));
        store.put(RecordKey::new("USER#a@example.com", "EMAIL#m1"), img.clone()).await;

        let err = tts.materialize(&insert(img)).await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::TransientDependency);
        assert!(err.to_string().contains("artifact put"), "got: {}", err);
        assert_eq!(speech.requests.lock().unwrap().len(), 1);
        assert_eq!(stored_url(&store).await, None);
    }

    #[tokio::test]
    async fn test_tenant_that_escapes_artifact_scope_is_validation() {
        let f = fixture(FakeSpeech::default(), TtsConfig::default());
        for tenant in ["../b@example.com", "a/b", "..", "a\\b"] {
            let mut img = image(Some("Meeting at 10am"));
            img["userId"] = json!(tenant);
            let err = f.tts.materialize(&insert(img)).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "tenant {:?}", tenant);
        }
        assert!(f.speech.requests.lock().unwrap().is_empty());
        assert!(f.artifacts.is_empty().await);
    }

    #[test]
    fn test_artifact_keys_are_unique() {
        let f = fixture(FakeSpeech::default(), TtsConfig::default());
        let a = f.tts.artifact_key("t", AudioFormat::Mp3);
        let b = f.tts.artifact_key("t", AudioFormat::Mp3);
        assert_ne!(a, b);
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(TtsStage::PendingSummary.to_string(), "pending_summary");
        assert_eq!(TtsStage::Linked.to_string(), "linked");
    }
}
