// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! Provides helpers to spin up Redis containers for integration tests.

use insight_fanout::config::SourceConfig;
use insight_fanout::event::ChangeEvent;
use insight_fanout::stream::encode_change_entry;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Create a vanilla Redis container (streams-compatible).
///
/// Uses official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// A Redis instance acting as the change log.
pub struct TestChangeLog<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub redis_url: String,
    pub source: SourceConfig,
}

impl<'a> TestChangeLog<'a> {
    pub fn new(docker: &'a Cli, stream_prefix: &str) -> Self {
        let container = redis_container(docker);
        let redis_url = redis_url(&container);
        let source = SourceConfig {
            redis_url: Some(redis_url.clone()),
            stream_prefix: stream_prefix.to_string(),
            shards: Vec::new(),
        };
        Self {
            container,
            redis_url,
            source,
        }
    }

    async fn conn(&self) -> redis::RedisResult<redis::aio::MultiplexedConnection> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        client.get_multiplexed_async_connection().await
    }

    /// Append `event` to its shard's stream. Its token is ignored; Redis
    /// assigns a fresh one, which is returned.
    pub async fn append(&self, event: &ChangeEvent, compress_over: Option<usize>) -> redis::RedisResult<String> {
        use redis::AsyncCommands;

        let fields = encode_change_entry(event, compress_over).expect("encodable event");
        let field_refs: Vec<(&str, &[u8])> = fields.iter().map(|(k, v)| (*k, v.as_slice())).collect();

        let mut conn = self.conn().await?;
        conn.xadd(self.source.stream_key(&event.shard), "*", &field_refs)
            .await
    }

    /// Append raw fields, for malformed-entry tests.
    pub async fn append_raw(&self, shard: &str, fields: &[(&str, &str)]) -> redis::RedisResult<String> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        conn.xadd(self.source.stream_key(shard), "*", fields).await
    }

    pub async fn stream_len(&self, shard: &str) -> redis::RedisResult<usize> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        conn.xlen(self.source.stream_key(shard)).await
    }

    /// Subscribe to a pub/sub channel. Returns the message stream.
    pub async fn subscribe(&self, channel: &str) -> redis::RedisResult<redis::aio::PubSub> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        Ok(pubsub)
    }
}
