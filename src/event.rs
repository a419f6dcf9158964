//! Change events and the email record shape they carry.
//!
//! A [`ChangeEvent`] is one mutation to one record in the keyed store, read
//! from a single shard of the change log. Events are validated on
//! construction so downstream code can rely on the image invariant:
//!
//! | Kind | before_image | after_image |
//! |------|--------------|-------------|
//! | INSERT | optional | required |
//! | MODIFY | required | required |
//! | REMOVE | required | absent |
//!
//! # Sequence Tokens
//!
//! Tokens use the `{millis}-{seq}` format and compare numerically
//! (`"9-0" < "10-0"`). The bare token `"0"` sorts before every real token.

use crate::error::{FanoutError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// Entity tag for email records.
pub const ENTITY_EMAIL: &str = "EMAIL";

/// Shard identifier.
pub type ShardId = String;

// ═══════════════════════════════════════════════════════════════════════════════
// SequenceToken
// ═══════════════════════════════════════════════════════════════════════════════

/// Position marker within a shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceToken(String);

impl SequenceToken {
    pub fn new(millis: u64, seq: u64) -> Self {
        Self(format!("{}-{}", millis, seq))
    }

    /// The token that precedes every event in a shard.
    pub fn origin() -> Self {
        Self("0".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_origin(&self) -> bool {
        self.0 == "0"
    }

    /// Millisecond component, if the token is well formed.
    pub fn timestamp_ms(&self) -> Option<u64> {
        parse_token_timestamp(&self.0)
    }
}

impl From<&str> for SequenceToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SequenceToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for SequenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Ord for SequenceToken {
    fn cmp(&self, other: &Self) -> Ordering {
        // Tie-break on the raw string keeps Ord consistent with Eq
        // for non-canonical spellings like "01-0".
        compare_sequence_tokens(&self.0, &other.0).then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for SequenceToken {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Compare two sequence tokens numerically.
///
/// Tokens are formatted as `{timestamp}-{sequence}` (e.g., "1234567890123-0").
/// Malformed components compare as zero.
pub fn compare_sequence_tokens(a: &str, b: &str) -> Ordering {
    let parse = |s: &str| -> (u64, u64) {
        match s.split_once('-') {
            Some((ts, seq)) => (ts.parse().unwrap_or(0), seq.parse().unwrap_or(0)),
            None => (s.parse().unwrap_or(0), 0),
        }
    };

    let (a_ts, a_seq) = parse(a);
    let (b_ts, b_seq) = parse(b);

    a_ts.cmp(&b_ts).then(a_seq.cmp(&b_seq))
}

/// Parse the millisecond timestamp from a token.
///
/// Returns `None` for malformed tokens or the bare origin "0".
pub fn parse_token_timestamp(token: &str) -> Option<u64> {
    let (ts, seq) = token.split_once('-')?;
    seq.parse::<u64>().ok()?;
    ts.parse().ok()
}

/// Time lag in milliseconds between a checkpoint and the shard head.
pub fn calculate_lag_ms(checkpoint: &str, latest: &str) -> Option<u64> {
    let checkpoint_ts = parse_token_timestamp(checkpoint)?;
    let latest_ts = parse_token_timestamp(latest)?;
    Some(latest_ts.saturating_sub(checkpoint_ts))
}

// ═══════════════════════════════════════════════════════════════════════════════
// ChangeKind / RecordKey
// ═══════════════════════════════════════════════════════════════════════════════

/// Mutation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Insert,
    Modify,
    Remove,
}

impl ChangeKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "INSERT" => Some(ChangeKind::Insert),
            "MODIFY" => Some(ChangeKind::Modify),
            "REMOVE" => Some(ChangeKind::Remove),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Modify => "MODIFY",
            ChangeKind::Remove => "REMOVE",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite key of a keyed-store record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub partition_key: String,
    pub sort_key: String,
}

impl RecordKey {
    pub fn new(partition_key: impl Into<String>, sort_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            sort_key: sort_key.into(),
        }
    }

    /// Entity tag encoded in the sort key (`EMAIL#<id>` → `EMAIL`).
    pub fn entity_prefix(&self) -> Option<&str> {
        self.sort_key.split_once('#').map(|(prefix, _)| prefix)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.partition_key, self.sort_key)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ChangeEvent
// ═══════════════════════════════════════════════════════════════════════════════

/// One mutation to one record, as read from a shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub shard: ShardId,
    pub sequence_token: SequenceToken,
    pub change_kind: ChangeKind,
    pub entity_type: String,
    pub tenant: String,
    pub key: RecordKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_image: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_image: Option<Value>,
}

impl ChangeEvent {
    /// Build an event with an explicit entity type and tenant.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shard: impl Into<ShardId>,
        sequence_token: impl Into<SequenceToken>,
        change_kind: ChangeKind,
        entity_type: impl Into<String>,
        tenant: impl Into<String>,
        key: RecordKey,
        before_image: Option<Value>,
        after_image: Option<Value>,
    ) -> Result<Self> {
        let event = Self {
            shard: shard.into(),
            sequence_token: sequence_token.into(),
            change_kind,
            entity_type: entity_type.into(),
            tenant: tenant.into(),
            key,
            before_image,
            after_image,
        };
        event.validate()?;
        Ok(event)
    }

    /// Build an event from a raw keyed-store change.
    ///
    /// The entity type comes from the sort-key prefix (`EMAIL#...`). The
    /// tenant comes from the image's `userId`, falling back to the
    /// partition key suffix (`USER#<tenant>`).
    pub fn from_record_change(
        shard: impl Into<ShardId>,
        sequence_token: impl Into<SequenceToken>,
        change_kind: ChangeKind,
        key: RecordKey,
        before_image: Option<Value>,
        after_image: Option<Value>,
    ) -> Result<Self> {
        let entity_type = key.entity_prefix().unwrap_or_default().to_string();
        let tenant = after_image
            .as_ref()
            .or(before_image.as_ref())
            .and_then(|img| img.get("userId"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                key.partition_key
                    .strip_prefix("USER#")
                    .map(str::to_string)
            })
            .unwrap_or_default();

        Self::new(
            shard,
            sequence_token,
            change_kind,
            entity_type,
            tenant,
            key,
            before_image,
            after_image,
        )
    }

    /// Check the image invariant for this change kind.
    pub fn validate(&self) -> Result<()> {
        let needs_after = matches!(self.change_kind, ChangeKind::Insert | ChangeKind::Modify);
        let needs_before = matches!(self.change_kind, ChangeKind::Modify | ChangeKind::Remove);

        if needs_after && self.after_image.is_none() {
            return Err(FanoutError::validation(
                "after_image",
                format!("{} event requires an after image", self.change_kind),
            ));
        }
        if needs_before && self.before_image.is_none() {
            return Err(FanoutError::validation(
                "before_image",
                format!("{} event requires a before image", self.change_kind),
            ));
        }
        if self.change_kind == ChangeKind::Remove && self.after_image.is_some() {
            return Err(FanoutError::validation(
                "after_image",
                "REMOVE event must not carry an after image",
            ));
        }
        Ok(())
    }

    /// Look up a dotted path in the after image.
    pub fn after_field(&self, path: &str) -> Option<&Value> {
        self.after_image.as_ref().and_then(|img| lookup_path(img, path))
    }
}

/// Resolve a dotted path (`aiInsights.summary`) in a JSON document.
pub fn lookup_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|seg| !seg.is_empty())
        .try_fold(doc, |node, seg| node.get(seg))
}

// ═══════════════════════════════════════════════════════════════════════════════
// EmailRecord
// ═══════════════════════════════════════════════════════════════════════════════

/// An attachment reference stored alongside the email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    #[serde(default)]
    pub s3_key: Option<String>,
}

/// AI-derived insights attached to an email record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiInsights {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub sentiment: Option<String>,
    #[serde(default)]
    pub is_urgent: bool,
    #[serde(default)]
    pub key_dates: Vec<String>,
    #[serde(default)]
    pub amounts: Vec<String>,
    #[serde(default)]
    pub action_items: Vec<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<String>,
    /// Set when insight extraction failed (e.g. `EmptyMessage`).
    #[serde(default)]
    pub error: Option<String>,
    #[serde(rename = "summaryAudioUrl", default, skip_serializing_if = "Option::is_none")]
    pub summary_audio_url: Option<String>,
}

/// Typed view of an email record image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailRecord {
    #[serde(rename = "PK")]
    pub partition_key: String,
    #[serde(rename = "SK")]
    pub sort_key: String,
    #[serde(rename = "userId", default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(rename = "fromName", default)]
    pub from_name: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub cc: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(rename = "messageId", default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(rename = "aiInsights", default)]
    pub ai_insights: Option<AiInsights>,
}

impl EmailRecord {
    /// Parse a record image. Fails with VALIDATION on a shape mismatch.
    pub fn from_image(image: &Value) -> Result<Self> {
        serde_json::from_value(image.clone())
            .map_err(|e| FanoutError::validation("image", e.to_string()))
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.partition_key, &self.sort_key)
    }

    /// Non-blank summary text, if any.
    pub fn summary_text(&self) -> Option<&str> {
        self.ai_insights
            .as_ref()
            .and_then(|ai| ai.summary.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn summary_audio_url(&self) -> Option<&str> {
        self.ai_insights
            .as_ref()
            .and_then(|ai| ai.summary_audio_url.as_deref())
            .filter(|s| !s.is_empty())
    }
}
