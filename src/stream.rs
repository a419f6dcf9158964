// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change log sources and the per-shard reader.
//!
//! A [`ChangeSource`] exposes the keyed store's change log as independent
//! shards of ordered events. The [`ChangeLogReader`] sits on top of it for
//! one consumer and hands out batches, one outstanding batch per shard.
//!
//! # Delivery Guarantees
//!
//! - Events within a shard are returned in sequence-token order.
//! - A shard with no persisted checkpoint starts at LATEST: events written
//!   before the first activation are not replayed.
//! - Failed events reported in a [`BatchResponse`] are redelivered at the
//!   head of the next batch. Successful ones are not.
//! - The checkpoint only ever covers acknowledged events, so a crash
//!   between delivery and acknowledgement redelivers (at-least-once).
//!
//! # Redis Layout
//!
//! [`RedisChangeSource`] reads one stream per shard at `{prefix}:{shard}`.
//! Entry fields:
//!
//! | Field | Required | Content |
//! |-------|----------|---------|
//! | `kind` | yes | `INSERT`, `MODIFY` or `REMOVE` |
//! | `pk`, `sk` | yes | record key |
//! | `entity`, `tenant` | no | derived from the key and image when absent |
//! | `old`, `new` | per kind | JSON image, optionally zstd-compressed |
//! | `hash` | no | SHA-256 hex of the decompressed `new` image |

use crate::batch::BatchResponse;
use crate::collaborators::BoxFuture;
use crate::config::SourceConfig;
use crate::cursor::CursorStore;
use crate::error::{FanoutError, Result};
use crate::event::{calculate_lag_ms, ChangeEvent, ChangeKind, RecordKey, SequenceToken, ShardId};
use crate::metrics;
use crate::resilience::{retry_with_backoff, RetryConfig};
use redis::aio::ConnectionManager;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::io::Read;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

/// zstd magic bytes for decompression detection
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

// ═══════════════════════════════════════════════════════════════════════════════
// ChangeSource
// ═══════════════════════════════════════════════════════════════════════════════

/// The keyed store's change log, split into shards.
pub trait ChangeSource: Send + Sync {
    /// Shards currently present in the log.
    fn shards(&self) -> BoxFuture<'_, Vec<ShardId>>;

    /// Newest token in a shard, or `None` if the shard is empty.
    fn latest_token<'a>(&'a self, shard: &'a str) -> BoxFuture<'a, Option<SequenceToken>>;

    /// Scan up to `limit` entries strictly after `after` (from the start
    /// when `None`), returning the ones that parse, in token order.
    fn read_after<'a>(
        &'a self,
        shard: &'a str,
        after: Option<&'a SequenceToken>,
        limit: usize,
    ) -> BoxFuture<'a, SourcePage>;
}

/// One page scanned from a shard.
///
/// `scanned_to` can be ahead of the last event when trailing entries were
/// unreadable; readers resume after it so such entries are not rescanned.
#[derive(Debug, Clone, Default)]
pub struct SourcePage {
    pub events: Vec<ChangeEvent>,
    pub scanned_to: Option<SequenceToken>,
}

impl SourcePage {
    /// Page where every scanned entry parsed.
    pub fn from_events(events: Vec<ChangeEvent>) -> Self {
        let scanned_to = events.last().map(|e| e.sequence_token.clone());
        Self { events, scanned_to }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// InMemoryChangeLog
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct LogState {
    shards: BTreeMap<ShardId, Vec<ChangeEvent>>,
    last_token: HashMap<ShardId, (u64, u64)>,
    available: bool,
    fail_next: usize,
    reads: usize,
}

/// Sharded append-only change log held in memory.
///
/// Tokens are assigned on append from the wall clock, with the sequence
/// part disambiguating appends within the same millisecond. The log can
/// be switched unavailable to simulate an outage.
#[derive(Debug, Clone)]
pub struct InMemoryChangeLog {
    state: Arc<RwLock<LogState>>,
}

impl Default for InMemoryChangeLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChangeLog {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(LogState {
                available: true,
                ..Default::default()
            })),
        }
    }

    /// Create an empty shard so it shows up in `shards()`.
    pub async fn add_shard(&self, shard: &str) {
        self.state
            .write()
            .await
            .shards
            .entry(shard.to_string())
            .or_default();
    }

    /// Append a raw record change and return its token.
    ///
    /// Entity type and tenant are derived the same way as for the Redis
    /// source.
    pub async fn append(
        &self,
        shard: &str,
        kind: ChangeKind,
        key: RecordKey,
        before_image: Option<Value>,
        after_image: Option<Value>,
    ) -> Result<SequenceToken> {
        let mut state = self.state.write().await;
        let token = Self::next_token(&mut state, shard);
        let event =
            ChangeEvent::from_record_change(shard, token.clone(), kind, key, before_image, after_image)?;
        state.shards.entry(shard.to_string()).or_default().push(event);
        Ok(token)
    }

    /// Append a fully built event. Its shard and token are overwritten.
    pub async fn append_event(&self, shard: &str, mut event: ChangeEvent) -> SequenceToken {
        let mut state = self.state.write().await;
        let token = Self::next_token(&mut state, shard);
        event.shard = shard.to_string();
        event.sequence_token = token.clone();
        state.shards.entry(shard.to_string()).or_default().push(event);
        token
    }

    fn next_token(state: &mut LogState, shard: &str) -> SequenceToken {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let (ms, seq) = match state.last_token.get(shard) {
            Some(&(last_ms, last_seq)) if last_ms >= now => (last_ms, last_seq + 1),
            _ => (now, 0),
        };
        state.last_token.insert(shard.to_string(), (ms, seq));
        SequenceToken::new(ms, seq)
    }

    /// Toggle availability. While unavailable every call fails transiently.
    pub async fn set_available(&self, available: bool) {
        self.state.write().await.available = available;
    }

    /// Fail the next `n` calls, then recover.
    pub async fn fail_next(&self, n: usize) {
        self.state.write().await.fail_next = n;
    }

    pub async fn len(&self, shard: &str) -> usize {
        self.state
            .read()
            .await
            .shards
            .get(shard)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub async fn is_empty(&self, shard: &str) -> bool {
        self.len(shard).await == 0
    }

    /// Number of `read_after` calls that reached the log.
    pub async fn reads(&self) -> usize {
        self.state.read().await.reads
    }

    async fn check_available(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.available {
            return Err(FanoutError::transient("change_log", "source unavailable"));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(FanoutError::transient("change_log", "injected failure"));
        }
        Ok(())
    }
}

impl ChangeSource for InMemoryChangeLog {
    fn shards(&self) -> BoxFuture<'_, Vec<ShardId>> {
        Box::pin(async move {
            self.check_available().await?;
            Ok(self.state.read().await.shards.keys().cloned().collect())
        })
    }

    fn latest_token<'a>(&'a self, shard: &'a str) -> BoxFuture<'a, Option<SequenceToken>> {
        Box::pin(async move {
            self.check_available().await?;
            let state = self.state.read().await;
            Ok(state
                .shards
                .get(shard)
                .and_then(|events| events.last())
                .map(|e| e.sequence_token.clone()))
        })
    }

    fn read_after<'a>(
        &'a self,
        shard: &'a str,
        after: Option<&'a SequenceToken>,
        limit: usize,
    ) -> BoxFuture<'a, SourcePage> {
        Box::pin(async move {
            self.check_available().await?;
            let mut state = self.state.write().await;
            state.reads += 1;
            let Some(events) = state.shards.get(shard) else {
                return Ok(SourcePage::default());
            };
            Ok(SourcePage::from_events(
                events
                    .iter()
                    .filter(|e| after.map_or(true, |a| e.sequence_token > *a))
                    .take(limit)
                    .cloned()
                    .collect(),
            ))
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RedisChangeSource
// ═══════════════════════════════════════════════════════════════════════════════

type StreamEntry = (String, HashMap<String, redis::Value>);

/// Change log backed by one Redis stream per shard.
#[derive(Clone)]
pub struct RedisChangeSource {
    conn: ConnectionManager,
    config: SourceConfig,
}

impl RedisChangeSource {
    pub fn new(conn: ConnectionManager, config: SourceConfig) -> Self {
        Self { conn, config }
    }

    /// Connect using `config.redis_url`.
    pub async fn connect(config: &SourceConfig) -> Result<Self> {
        let url = config
            .redis_url
            .as_deref()
            .ok_or_else(|| FanoutError::Config("source.redis_url is not set".into()))?;
        let client = redis::Client::open(url).map_err(|e| FanoutError::redis("connect", e))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| FanoutError::redis("connect", e))?;
        info!(url = %url, prefix = %config.stream_prefix, "Connected to change log");
        Ok(Self::new(conn, config.clone()))
    }

    async fn discover_shards(&self) -> Result<Vec<ShardId>> {
        let mut conn = self.conn.clone();
        let prefix = format!("{}:", self.config.stream_prefix);
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut shards = BTreeSet::new();

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| FanoutError::redis("SCAN", e))?;

            shards.extend(
                keys.iter()
                    .filter_map(|k| k.strip_prefix(&prefix))
                    .map(str::to_string),
            );
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(shards.into_iter().collect())
    }
}

impl ChangeSource for RedisChangeSource {
    fn shards(&self) -> BoxFuture<'_, Vec<ShardId>> {
        Box::pin(async move {
            if !self.config.shards.is_empty() {
                return Ok(self.config.shards.clone());
            }
            self.discover_shards().await
        })
    }

    fn latest_token<'a>(&'a self, shard: &'a str) -> BoxFuture<'a, Option<SequenceToken>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            // XREVRANGE key + - COUNT 1 returns the newest entry
            let result: Vec<StreamEntry> = redis::cmd("XREVRANGE")
                .arg(self.config.stream_key(shard))
                .arg("+")
                .arg("-")
                .arg("COUNT")
                .arg(1)
                .query_async(&mut conn)
                .await
                .map_err(|e| FanoutError::redis("XREVRANGE", e))?;

            Ok(result.first().map(|(id, _)| SequenceToken::from(id.as_str())))
        })
    }

    fn read_after<'a>(
        &'a self,
        shard: &'a str,
        after: Option<&'a SequenceToken>,
        limit: usize,
    ) -> BoxFuture<'a, SourcePage> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            // "(" makes the start exclusive (Redis 6.2+).
            let start = match after {
                Some(token) if !token.is_origin() => format!("({}", token),
                _ => "-".to_string(),
            };

            let entries: Vec<StreamEntry> = redis::cmd("XRANGE")
                .arg(self.config.stream_key(shard))
                .arg(&start)
                .arg("+")
                .arg("COUNT")
                .arg(limit)
                .query_async(&mut conn)
                .await
                .map_err(|e| FanoutError::redis("XRANGE", e))?;

            let scanned_to = entries.last().map(|(id, _)| SequenceToken::from(id.as_str()));
            let mut events = Vec::with_capacity(entries.len());
            for (id, fields) in entries {
                match parse_change_entry(shard, &id, &fields) {
                    Ok(event) => events.push(event),
                    Err(e) => {
                        metrics::record_source_parse_error(shard);
                        warn!(
                            shard = %shard,
                            sequence_token = %id,
                            error = %e,
                            "Failed to parse change entry, skipping"
                        );
                    }
                }
            }

            if let (Some(first), Some(last)) = (events.first(), events.last()) {
                trace!(
                    shard = %shard,
                    count = events.len(),
                    first = %first.sequence_token,
                    last = %last.sequence_token,
                    "Read change entries via XRANGE"
                );
            }
            Ok(SourcePage { events, scanned_to })
        })
    }
}

/// Parse one stream entry into a [`ChangeEvent`].
pub fn parse_change_entry(
    shard: &str,
    id: &str,
    fields: &HashMap<String, redis::Value>,
) -> Result<ChangeEvent> {
    let kind_str = get_string_field(fields, "kind")?;
    let kind = ChangeKind::parse(&kind_str)
        .ok_or_else(|| FanoutError::StreamParse(format!("Unknown change kind: {}", kind_str)))?;

    let key = RecordKey::new(get_string_field(fields, "pk")?, get_string_field(fields, "sk")?);
    let before = parse_image(fields, "old")?;
    let after = parse_image(fields, "new")?;

    if let (Some(expected), Some(raw)) = (get_string_field(fields, "hash").ok(), fields.get("new")) {
        let data = maybe_decompress(&value_bytes(raw, "new")?)?;
        let computed = compute_content_hash(&data);
        if computed != expected {
            return Err(FanoutError::StreamParse(format!(
                "Content hash mismatch for {}: expected {}, got {}",
                key, expected, computed
            )));
        }
    }

    match (
        get_string_field(fields, "entity").ok(),
        get_string_field(fields, "tenant").ok(),
    ) {
        (Some(entity), Some(tenant)) => {
            ChangeEvent::new(shard, id, kind, entity, tenant, key, before, after)
        }
        (entity, _) => {
            let mut event = ChangeEvent::from_record_change(shard, id, kind, key, before, after)?;
            if let Some(entity) = entity {
                event.entity_type = entity;
            }
            Ok(event)
        }
    }
}

/// Encode an event as stream entry fields, the inverse of [`parse_change_entry`].
///
/// Images larger than `compress_over` bytes are zstd-compressed.
pub fn encode_change_entry(
    event: &ChangeEvent,
    compress_over: Option<usize>,
) -> Result<Vec<(&'static str, Vec<u8>)>> {
    let mut fields = vec![
        ("kind", event.change_kind.as_str().as_bytes().to_vec()),
        ("entity", event.entity_type.as_bytes().to_vec()),
        ("tenant", event.tenant.as_bytes().to_vec()),
        ("pk", event.key.partition_key.as_bytes().to_vec()),
        ("sk", event.key.sort_key.as_bytes().to_vec()),
    ];

    let encode = |image: &Value| -> Result<Vec<u8>> {
        let raw = serde_json::to_vec(image)?;
        match compress_over {
            Some(limit) if raw.len() > limit => zstd::encode_all(&raw[..], 3)
                .map_err(|e| FanoutError::Decompression(format!("zstd encode: {}", e))),
            _ => Ok(raw),
        }
    };

    if let Some(before) = &event.before_image {
        fields.push(("old", encode(before)?));
    }
    if let Some(after) = &event.after_image {
        let raw = serde_json::to_vec(after)?;
        fields.push(("hash", compute_content_hash(&raw).into_bytes()));
        fields.push(("new", encode(after)?));
    }
    Ok(fields)
}

fn parse_image(fields: &HashMap<String, redis::Value>, name: &str) -> Result<Option<Value>> {
    let Some(raw) = fields.get(name) else {
        return Ok(None);
    };
    let bytes = maybe_decompress(&value_bytes(raw, name)?)?;
    if bytes.is_empty() {
        return Ok(None);
    }
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| FanoutError::StreamParse(format!("Invalid JSON in {}: {}", name, e)))
}

/// Extract a string field from a stream entry.
fn get_string_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<String> {
    let value = fields
        .get(name)
        .ok_or_else(|| FanoutError::StreamParse(format!("Missing field: {}", name)))?;

    match value {
        redis::Value::BulkString(bytes) => String::from_utf8(bytes.clone())
            .map_err(|e| FanoutError::StreamParse(format!("Invalid UTF-8 in {}: {}", name, e))),
        redis::Value::SimpleString(s) => Ok(s.clone()),
        _ => Err(FanoutError::StreamParse(format!(
            "Unexpected type for field {}: {:?}",
            name, value
        ))),
    }
}

fn value_bytes(value: &redis::Value, name: &str) -> Result<Vec<u8>> {
    match value {
        redis::Value::BulkString(bytes) => Ok(bytes.clone()),
        redis::Value::SimpleString(s) => Ok(s.as_bytes().to_vec()),
        _ => Err(FanoutError::StreamParse(format!(
            "Unexpected type for field {}: {:?}",
            name, value
        ))),
    }
}

/// Decompress zstd data if it has the magic header, otherwise return as-is.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() >= 4 && data[..4] == ZSTD_MAGIC {
        let mut decoder = zstd::Decoder::new(data)
            .map_err(|e| FanoutError::Decompression(format!("zstd init: {}", e)))?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| FanoutError::Decompression(format!("zstd decode: {}", e)))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

/// SHA-256 content hash as a hex string.
pub fn compute_content_hash(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}

// ═══════════════════════════════════════════════════════════════════════════════
// ChangeLogReader
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct ShardState {
    activated: bool,
    /// Last token read from the source.
    position: Option<SequenceToken>,
    checkpoint: Option<SequenceToken>,
    /// Failed events awaiting redelivery, in token order.
    redelivery: BTreeMap<SequenceToken, ChangeEvent>,
    /// Acknowledged tokens above the checkpoint.
    acked: BTreeSet<SequenceToken>,
    outstanding: Option<Vec<ChangeEvent>>,
}

/// Progress of one shard, for health reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardProgress {
    pub shard: ShardId,
    pub checkpoint: Option<SequenceToken>,
    pub position: Option<SequenceToken>,
    pub pending_redeliveries: usize,
    pub batch_outstanding: bool,
}

/// Batches change events for one consumer, one outstanding batch per shard.
///
/// The reader owns the consumer's checkpoints: they move only through
/// [`acknowledge`](Self::acknowledge).
pub struct ChangeLogReader {
    consumer: String,
    source: Arc<dyn ChangeSource>,
    cursors: Arc<CursorStore>,
    retry: RetryConfig,
    shards: RwLock<HashMap<ShardId, Arc<Mutex<ShardState>>>>,
}

impl std::fmt::Debug for ChangeLogReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeLogReader")
            .field("consumer", &self.consumer)
            .finish()
    }
}

impl ChangeLogReader {
    pub fn new(
        consumer: impl Into<String>,
        source: Arc<dyn ChangeSource>,
        cursors: Arc<CursorStore>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            consumer: consumer.into(),
            source,
            cursors,
            retry,
            shards: RwLock::new(HashMap::new()),
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    async fn shard_state(&self, shard: &str) -> Arc<Mutex<ShardState>> {
        if let Some(state) = self.shards.read().await.get(shard) {
            return state.clone();
        }
        self.shards
            .write()
            .await
            .entry(shard.to_string())
            .or_default()
            .clone()
    }

    async fn call_source<T, F, Fut>(&self, shard: &str, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry_with_backoff(&self.retry, operation, op, |_, _| {
            metrics::record_source_retry(shard);
        })
        .await
    }

    /// Resolve the starting position on first use of a shard.
    async fn activate(&self, shard: &str, state: &mut ShardState) -> Result<()> {
        if state.activated {
            return Ok(());
        }

        if let Some(checkpoint) = self.cursors.get(&self.consumer, shard).await {
            info!(
                consumer = %self.consumer,
                shard = %shard,
                checkpoint = %checkpoint,
                "Resuming shard after persisted checkpoint"
            );
            state.position = Some(checkpoint.clone());
            state.checkpoint = Some(checkpoint);
        } else {
            let latest = self
                .call_source(shard, "latest_token", || self.source.latest_token(shard))
                .await?;
            let start = latest.unwrap_or_else(SequenceToken::origin);
            info!(
                consumer = %self.consumer,
                shard = %shard,
                start = %start,
                "No checkpoint, starting shard at LATEST"
            );
            // Written through so a crash before the next flush cannot make
            // a restart jump forward again.
            self.cursors.set_now(&self.consumer, shard, &start).await?;
            state.position = Some(start.clone());
            state.checkpoint = Some(start);
        }

        state.activated = true;
        Ok(())
    }

    /// Next batch for `shard`: pending redeliveries first, then new events.
    ///
    /// Returns an empty batch when there is nothing to deliver; an empty
    /// batch needs no acknowledgement. Fails with `InvalidState` while an
    /// earlier batch on the same shard is unacknowledged, and with the
    /// source error once retries are exhausted.
    pub async fn next_batch(&self, shard: &str, max_size: usize) -> Result<Vec<ChangeEvent>> {
        let state_lock = self.shard_state(shard).await;
        let mut state = state_lock.lock().await;

        if state.outstanding.is_some() {
            return Err(FanoutError::InvalidState {
                expected: "previous batch acknowledged".into(),
                actual: format!("batch outstanding on shard {}", shard),
            });
        }
        self.activate(shard, &mut state).await?;

        let max_size = max_size.max(1);
        let mut batch: Vec<ChangeEvent> = state.redelivery.values().take(max_size).cloned().collect();

        let remaining = max_size - batch.len();
        if remaining > 0 {
            let fresh = self.read_fresh(shard, &mut state, remaining).await?;
            if !fresh.is_empty() {
                metrics::record_events_read(shard, fresh.len());
            }
            batch.extend(fresh);
        }

        if !batch.is_empty() {
            debug!(
                consumer = %self.consumer,
                shard = %shard,
                size = batch.len(),
                redeliveries = state.redelivery.len().min(max_size),
                "Batch handed out"
            );
            state.outstanding = Some(batch.clone());
        }
        Ok(batch)
    }

    /// Read new events after the shard's position, moving the position
    /// past every scanned entry. Pages that held only unreadable entries
    /// are skipped over rather than returned empty.
    async fn read_fresh(
        &self,
        shard: &str,
        state: &mut ShardState,
        limit: usize,
    ) -> Result<Vec<ChangeEvent>> {
        loop {
            let position = state.position.clone();
            let start = Instant::now();
            let page = self
                .call_source(shard, "read_after", || {
                    self.source.read_after(shard, position.as_ref(), limit)
                })
                .await?;
            metrics::record_source_read_latency(shard, start.elapsed());

            let after_position =
                |t: &SequenceToken| position.as_ref().map_or(true, |p| t > p);

            // Guard against a source that ignores the exclusive start.
            let fresh: Vec<ChangeEvent> = page
                .events
                .into_iter()
                .filter(|e| after_position(&e.sequence_token))
                .collect();

            let scanned = page.scanned_to.filter(|t| after_position(t));
            let furthest = match (fresh.last().map(|e| &e.sequence_token), scanned.as_ref()) {
                (Some(read), Some(scanned)) => Some(read.max(scanned).clone()),
                (Some(read), None) => Some(read.clone()),
                (None, scanned) => scanned.cloned(),
            };
            let Some(furthest) = furthest else {
                return Ok(fresh);
            };
            state.position = Some(furthest.clone());

            if !fresh.is_empty() {
                return Ok(fresh);
            }
            debug!(
                consumer = %self.consumer,
                shard = %shard,
                scanned_to = %furthest,
                "Skipped a page of unreadable entries"
            );
        }
    }

    /// Acknowledge the outstanding batch on `shard`.
    ///
    /// Tokens listed in `response` are queued for redelivery, everything
    /// else in the batch is done. Returns the checkpoint after advancing.
    pub async fn acknowledge(
        &self,
        shard: &str,
        response: &BatchResponse,
    ) -> Result<Option<SequenceToken>> {
        let state_lock = self.shard_state(shard).await;
        let mut state = state_lock.lock().await;

        let Some(batch) = state.outstanding.take() else {
            return Err(FanoutError::InvalidState {
                expected: "outstanding batch".into(),
                actual: format!("nothing to acknowledge on shard {}", shard),
            });
        };

        let failed: BTreeSet<&SequenceToken> = response.batch_item_failures.iter().collect();
        for token in &failed {
            if !batch.iter().any(|e| &e.sequence_token == *token) {
                warn!(
                    consumer = %self.consumer,
                    shard = %shard,
                    sequence_token = %token,
                    "Acknowledgement lists a token outside the batch, ignoring"
                );
            }
        }

        for event in batch {
            let token = event.sequence_token.clone();
            if failed.contains(&token) {
                state.redelivery.insert(token, event);
            } else {
                state.redelivery.remove(&token);
                state.acked.insert(token);
            }
        }

        let candidate = match state.redelivery.keys().next() {
            Some(blocker) => state.acked.range(..blocker.clone()).next_back().cloned(),
            None => state.acked.iter().next_back().cloned(),
        };

        if let Some(next) = candidate {
            if state.checkpoint.as_ref().map_or(true, |c| next > *c) {
                self.cursors.set(&self.consumer, shard, &next).await;
                metrics::record_checkpoint_advance(&self.consumer, shard);
                debug!(
                    consumer = %self.consumer,
                    shard = %shard,
                    checkpoint = %next,
                    "Checkpoint advanced"
                );
                let covered = next.clone();
                state.acked.retain(|t| *t > covered);
                state.checkpoint = Some(next);
            }
        }

        metrics::set_redelivery_pending(&self.consumer, shard, state.redelivery.len());
        if let (Some(checkpoint), Some(position)) = (&state.checkpoint, &state.position) {
            if let Some(lag) = calculate_lag_ms(checkpoint.as_str(), position.as_str()) {
                metrics::set_checkpoint_lag_ms(&self.consumer, shard, lag);
            }
        }

        Ok(state.checkpoint.clone())
    }

    /// Give up on the outstanding batch (e.g. on shutdown). Its events are
    /// redelivered with the next batch; the checkpoint does not move.
    pub async fn abandon(&self, shard: &str) -> usize {
        let state_lock = self.shard_state(shard).await;
        let mut state = state_lock.lock().await;
        let Some(batch) = state.outstanding.take() else {
            return 0;
        };
        let count = batch.len();
        for event in batch {
            state.redelivery.insert(event.sequence_token.clone(), event);
        }
        metrics::set_redelivery_pending(&self.consumer, shard, state.redelivery.len());
        count
    }

    pub async fn checkpoint(&self, shard: &str) -> Option<SequenceToken> {
        let state_lock = self.shard_state(shard).await;
        let state = state_lock.lock().await;
        state.checkpoint.clone()
    }

    pub async fn pending_redeliveries(&self, shard: &str) -> usize {
        let state_lock = self.shard_state(shard).await;
        let state = state_lock.lock().await;
        state.redelivery.len()
    }

    /// Snapshot of every shard this reader has touched.
    ///
    /// Shards busy with a batch are reported from their last known state
    /// without waiting.
    pub async fn progress(&self) -> Vec<ShardProgress> {
        let shards = self.shards.read().await;
        let mut progress: Vec<ShardProgress> = shards
            .iter()
            .map(|(shard, state)| match state.try_lock() {
                Ok(state) => ShardProgress {
                    shard: shard.clone(),
                    checkpoint: state.checkpoint.clone(),
                    position: state.position.clone(),
                    pending_redeliveries: state.redelivery.len(),
                    batch_outstanding: state.outstanding.is_some(),
                },
                Err(_) => ShardProgress {
                    shard: shard.clone(),
                    checkpoint: None,
                    position: None,
                    pending_redeliveries: 0,
                    batch_outstanding: true,
                },
            })
            .collect();
        progress.sort_by(|a, b| a.shard.cmp(&b.shard));
        progress
    }
}
