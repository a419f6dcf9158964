//! Configuration for the fan-out pipeline.
//!
//! Configuration is passed to [`FanoutEngine::new()`](crate::FanoutEngine::new)
//! and can be constructed programmatically or deserialized from JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use insight_fanout::config::FanoutConfig;
//!
//! let config = FanoutConfig {
//!     consumer_id: "fanout-eu-1".into(),
//!     current_tenant: Some("alice@example.com".into()),
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! FanoutConfig
//! ├── consumer_id: String          # Reader group name, prefixes checkpoints
//! ├── current_tenant: Option       # Restrict default routes to one tenant
//! ├── settings: FanoutSettings
//! │   ├── reader: ReaderConfig     # Batch size, polling, cursor mode, source retry
//! │   ├── delivery: DeliveryConfig # Timeouts, concurrency, dead-letter threshold
//! │   └── slo: SloConfig           # SLO thresholds
//! ├── routes: Vec<RouteConfig>     # Filter rule per target (empty = defaults)
//! ├── source: SourceConfig         # Redis change streams
//! ├── tts: TtsConfig               # Voice selection, artifact layout
//! ├── notifications: NotificationConfig
//! └── cursor: CursorConfig         # SQLite checkpoint persistence
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "consumer_id": "fanout-eu-1",
//!   "settings": {
//!     "reader": { "batch_size": 50, "poll_interval": "250ms", "cursor_mode": "per_target" },
//!     "delivery": { "call_timeout": "5s", "dead_letter_after": 3 }
//!   },
//!   "tts": {
//!     "voices": {
//!       "by_tenant": { "alice@example.com": { "voice_id": "Amy", "language_code": "en-GB" } }
//!     }
//!   },
//!   "cursor": { "sqlite_path": "/var/lib/fanout/checkpoints.db" }
//! }
//! ```

use crate::error::{FanoutError, Result};
use crate::filter::FilterRule;
use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `FanoutEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Reader group name. Checkpoints are stored under this id
    /// (suffixed with the target name in per-target cursor mode).
    pub consumer_id: String,

    /// When set, default routes only accept events for this tenant.
    #[serde(default)]
    pub current_tenant: Option<String>,

    #[serde(default)]
    pub settings: FanoutSettings,

    /// Explicit filter rule per target. Empty means the default
    /// INSERT-on-EMAIL routes for every enabled target.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub tts: TtsConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,

    #[serde(default)]
    pub cursor: CursorConfig,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            consumer_id: "insight-fanout".to_string(),
            current_tenant: None,
            settings: FanoutSettings::default(),
            routes: Vec::new(),
            source: SourceConfig::default(),
            tts: TtsConfig::default(),
            notifications: NotificationConfig::default(),
            cursor: CursorConfig::default(),
        }
    }
}

impl FanoutConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(consumer_id: &str) -> Self {
        Self {
            consumer_id: consumer_id.to_string(),
            settings: FanoutSettings {
                reader: ReaderConfig::testing(),
                delivery: DeliveryConfig::testing(),
                slo: SloConfig::default(),
            },
            cursor: CursorConfig::in_memory(),
            ..Default::default()
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| FanoutError::Config(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            FanoutError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    /// Reject settings that would make delivery meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.consumer_id.trim().is_empty() {
            return Err(FanoutError::Config("consumer_id must not be empty".into()));
        }
        if self.settings.reader.batch_size == 0 {
            return Err(FanoutError::Config("reader.batch_size must be > 0".into()));
        }
        if self.settings.delivery.max_concurrency == 0 {
            return Err(FanoutError::Config("delivery.max_concurrency must be > 0".into()));
        }
        if self.settings.delivery.dead_letter_after == 0 {
            return Err(FanoutError::Config("delivery.dead_letter_after must be > 0".into()));
        }
        if self.settings.delivery.max_retryable_attempts < self.settings.delivery.dead_letter_after {
            return Err(FanoutError::Config(
                "delivery.max_retryable_attempts must be >= dead_letter_after".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for route in &self.routes {
            if !seen.insert(route.target.as_str()) {
                return Err(FanoutError::Config(format!(
                    "duplicate route for target {}",
                    route.target
                )));
            }
        }
        Ok(())
    }
}

/// Tunable settings grouped by pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FanoutSettings {
    #[serde(default)]
    pub reader: ReaderConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub slo: SloConfig,
}

/// Filter rule for one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub target: String,
    pub rule: FilterRule,
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReaderConfig: change log consumption
// ═══════════════════════════════════════════════════════════════════════════════

/// How checkpoints are shared between targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CursorMode {
    /// Every target owns a cursor per shard. A slow target never stalls
    /// a fast one.
    #[default]
    PerTarget,
    /// One cursor per shard, advanced on the combined outcome of all targets.
    Shared,
}

/// Change log reader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Maximum events per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Idle wait between polls when a shard has nothing new (e.g., "500ms").
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    #[serde(default)]
    pub cursor_mode: CursorMode,

    /// First backoff delay when the source is unavailable.
    #[serde(default = "default_source_retry_initial")]
    pub source_retry_initial: String,

    /// Backoff ceiling when the source is unavailable.
    #[serde(default = "default_source_retry_max")]
    pub source_retry_max: String,

    /// Give up after this many attempts. `None` retries forever.
    #[serde(default)]
    pub source_retry_max_attempts: Option<usize>,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting
    // ─────────────────────────────────────────────────────────────────────────

    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_batch_size() -> usize {
    100
}

fn default_poll_interval() -> String {
    "500ms".to_string()
}

fn default_source_retry_initial() -> String {
    "100ms".to_string()
}

fn default_source_retry_max() -> String {
    "30s".to_string()
}

fn default_rate_limit_per_sec() -> u32 {
    1_000
}

fn default_rate_limit_burst() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: "500ms".to_string(),
            cursor_mode: CursorMode::PerTarget,
            source_retry_initial: "100ms".to_string(),
            source_retry_max: "30s".to_string(),
            source_retry_max_attempts: None,
            rate_limit_enabled: false,
            rate_limit_per_sec: 1_000,
            rate_limit_burst: 100,
        }
    }
}

impl ReaderConfig {
    /// Fast polling and short backoff for tests.
    pub fn testing() -> Self {
        Self {
            batch_size: 10,
            poll_interval: "10ms".to_string(),
            source_retry_initial: "5ms".to_string(),
            source_retry_max: "50ms".to_string(),
            source_retry_max_attempts: Some(3),
            ..Default::default()
        }
    }

    pub fn poll_interval_duration(&self) -> Duration {
        parse_duration_or(&self.poll_interval, Duration::from_millis(500))
    }

    /// Backoff policy applied while the source is unavailable.
    pub fn source_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.source_retry_max_attempts.unwrap_or(usize::MAX),
            initial_delay: parse_duration_or(&self.source_retry_initial, Duration::from_millis(100)),
            max_delay: parse_duration_or(&self.source_retry_max, Duration::from_secs(30)),
            backoff_factor: 2.0,
            attempt_timeout: Duration::from_secs(5),
        }
    }

    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DeliveryConfig: batch delivery to targets
// ═══════════════════════════════════════════════════════════════════════════════

/// Batch delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Deadline for one target call (e.g., "10s"). Exceeding it is retryable.
    #[serde(default = "default_call_timeout")]
    pub call_timeout: String,

    /// Maximum records processed concurrently within a batch.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Consecutive permanent failures before a record is dead-lettered.
    #[serde(default = "default_dead_letter_after")]
    pub dead_letter_after: u32,

    /// Consecutive retryable failures before a record is dead-lettered
    /// as EXHAUSTED_RETRY.
    #[serde(default = "default_max_retryable_attempts")]
    pub max_retryable_attempts: u32,

    /// Minimum time between a record's first retryable failure and its
    /// EXHAUSTED_RETRY dead letter (e.g., "5m"). Both this and
    /// `max_retryable_attempts` must be reached.
    #[serde(default = "default_retry_exhaustion_window")]
    pub retry_exhaustion_window: String,

    /// Consecutive call failures before a target's circuit opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// How long an open circuit rejects calls (e.g., "30s").
    #[serde(default = "default_circuit_reset_timeout")]
    pub circuit_reset_timeout: String,
}

fn default_call_timeout() -> String {
    "10s".to_string()
}

fn default_max_concurrency() -> usize {
    16
}

fn default_dead_letter_after() -> u32 {
    3
}

fn default_max_retryable_attempts() -> u32 {
    10
}

fn default_retry_exhaustion_window() -> String {
    "5m".to_string()
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_reset_timeout() -> String {
    "30s".to_string()
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            call_timeout: "10s".to_string(),
            max_concurrency: 16,
            dead_letter_after: 3,
            max_retryable_attempts: 10,
            retry_exhaustion_window: "5m".to_string(),
            circuit_failure_threshold: 5,
            circuit_reset_timeout: "30s".to_string(),
        }
    }
}

impl DeliveryConfig {
    pub fn testing() -> Self {
        Self {
            call_timeout: "200ms".to_string(),
            max_concurrency: 4,
            retry_exhaustion_window: "0ms".to_string(),
            circuit_failure_threshold: 1_000,
            circuit_reset_timeout: "50ms".to_string(),
            ..Default::default()
        }
    }

    pub fn call_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.call_timeout, Duration::from_secs(10))
    }

    pub fn circuit_reset_duration(&self) -> Duration {
        parse_duration_or(&self.circuit_reset_timeout, Duration::from_secs(30))
    }

    pub fn retry_exhaustion_window_duration(&self) -> Duration {
        parse_duration_or(&self.retry_exhaustion_window, Duration::from_secs(300))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SloConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// SLO thresholds for detecting performance degradation.
///
/// Violations are logged and exposed via metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloConfig {
    /// Maximum acceptable time to deliver one batch to one target (ms).
    #[serde(default = "default_max_batch_delivery_latency_ms")]
    pub max_batch_delivery_latency_ms: u64,

    /// Maximum acceptable distance between a checkpoint and the shard head.
    #[serde(default = "default_max_checkpoint_lag_sec")]
    pub max_checkpoint_lag_sec: u64,
}

fn default_max_batch_delivery_latency_ms() -> u64 {
    5_000
}

fn default_max_checkpoint_lag_sec() -> u64 {
    60
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            max_batch_delivery_latency_ms: 5_000,
            max_checkpoint_lag_sec: 60,
        }
    }
}

impl SloConfig {
    pub fn is_batch_delivery_violation(&self, latency: Duration) -> bool {
        latency.as_millis() as u64 > self.max_batch_delivery_latency_ms
    }

    pub fn is_checkpoint_lag_violation(&self, lag_ms: u64) -> bool {
        lag_ms > self.max_checkpoint_lag_sec.saturating_mul(1000)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SourceConfig: Redis change streams
// ═══════════════════════════════════════════════════════════════════════════════

/// Where change events are read from when using the Redis source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Stream key prefix; shard `s` lives at `{prefix}:{s}`.
    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,

    /// Shard names to consume.
    #[serde(default)]
    pub shards: Vec<String>,
}

fn default_stream_prefix() -> String {
    "changes".to_string()
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            stream_prefix: "changes".to_string(),
            shards: Vec::new(),
        }
    }
}

impl SourceConfig {
    pub fn stream_key(&self, shard: &str) -> String {
        format!("{}:{}", self.stream_prefix, shard)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TtsConfig: voice selection and artifact layout
// ═══════════════════════════════════════════════════════════════════════════════

/// Encoded audio container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    #[default]
    Mp3,
    OggVorbis,
    Pcm,
}

impl AudioFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::OggVorbis => "audio/ogg",
            AudioFormat::Pcm => "audio/pcm",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::OggVorbis => "ogg",
            AudioFormat::Pcm => "pcm",
        }
    }
}

/// Voice used to narrate a tenant's summaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceProfile {
    pub voice_id: String,
    #[serde(default = "default_voice_engine")]
    pub engine: String,
    #[serde(default = "default_language_code")]
    pub language_code: String,
    #[serde(default)]
    pub output_format: AudioFormat,
}

fn default_voice_engine() -> String {
    "neural".to_string()
}

fn default_language_code() -> String {
    "en-US".to_string()
}

impl Default for VoiceProfile {
    fn default() -> Self {
        Self {
            voice_id: "Joanna".to_string(),
            engine: "neural".to_string(),
            language_code: "en-US".to_string(),
            output_format: AudioFormat::Mp3,
        }
    }
}

/// Explicit `{tenant: voiceProfile}` table with a fallback voice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VoiceSelection {
    #[serde(default)]
    pub by_tenant: HashMap<String, VoiceProfile>,
    #[serde(default)]
    pub default: VoiceProfile,
}

impl VoiceSelection {
    pub fn with_voice(mut self, tenant: impl Into<String>, voice: VoiceProfile) -> Self {
        self.by_tenant.insert(tenant.into(), voice);
        self
    }

    pub fn voice_for(&self, tenant: &str) -> &VoiceProfile {
        self.by_tenant.get(tenant).unwrap_or(&self.default)
    }
}

/// TTS materializer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub voices: VoiceSelection,

    /// Artifact keys are `{artifact_prefix}/{tenant}/{uuid}.{ext}`.
    #[serde(default = "default_artifact_prefix")]
    pub artifact_prefix: String,

    /// Optional cap on speech engine calls per second.
    #[serde(default)]
    pub max_synthesis_per_sec: Option<u32>,

    /// Deadline for one speech synthesis call (e.g., "6s").
    #[serde(default = "default_synthesis_timeout")]
    pub synthesis_timeout: String,

    /// Deadline for storing one audio artifact.
    #[serde(default = "default_artifact_put_timeout")]
    pub artifact_put_timeout: String,

    /// Deadline for the conditional write linking the audio.
    #[serde(default = "default_link_timeout")]
    pub link_timeout: String,
}

fn default_artifact_prefix() -> String {
    "audio".to_string()
}

fn default_synthesis_timeout() -> String {
    "6s".to_string()
}

fn default_artifact_put_timeout() -> String {
    "3s".to_string()
}

fn default_link_timeout() -> String {
    "2s".to_string()
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            voices: VoiceSelection::default(),
            artifact_prefix: "audio".to_string(),
            max_synthesis_per_sec: None,
            synthesis_timeout: default_synthesis_timeout(),
            artifact_put_timeout: default_artifact_put_timeout(),
            link_timeout: default_link_timeout(),
        }
    }
}

impl TtsConfig {
    pub fn synthesis_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.synthesis_timeout, Duration::from_secs(6))
    }

    pub fn artifact_put_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.artifact_put_timeout, Duration::from_secs(3))
    }

    pub fn link_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.link_timeout, Duration::from_secs(2))
    }

    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        self.max_synthesis_per_sec.map(|rate| RateLimitConfig {
            burst_size: rate,
            refill_rate: rate,
        })
    }
}

/// Notification publisher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_topic")]
    pub topic: String,
}

fn default_topic() -> String {
    "email-insights".to_string()
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            topic: "email-insights".to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CursorConfig: checkpoint persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Checkpoint persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorConfig {
    /// Path to SQLite database for checkpoint storage.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// How often dirty checkpoints are flushed to disk (e.g., "5s").
    #[serde(default = "default_flush_interval")]
    pub flush_interval: String,
}

fn default_flush_interval() -> String {
    "5s".to_string()
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "fanout_checkpoints.db".to_string(),
            wal_mode: true,
            flush_interval: "5s".to_string(),
        }
    }
}

impl CursorConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
            flush_interval: "50ms".to_string(),
        }
    }

    pub fn flush_interval_duration(&self) -> Duration {
        parse_duration_or(&self.flush_interval, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
