// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! Provides helpers to spin up Redis containers for integration tests.

use stream_replicator::broker::redis_streams::stream_key;
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

/// A Redis server standing in for one broker cluster.
pub struct TestCluster<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub cluster_id: String,
    pub url: String,
}

impl<'a> TestCluster<'a> {
    pub fn new(docker: &'a Cli, cluster_id: &str) -> Self {
        let container = redis_container(docker);
        let url = redis_url(&container);
        Self {
            container,
            cluster_id: cluster_id.to_string(),
            url,
        }
    }

    async fn connection(&self) -> redis::RedisResult<redis::aio::MultiplexedConnection> {
        let client = redis::Client::open(self.url.as_str())?;
        client.get_multiplexed_async_connection().await
    }

    /// Number of entries in the stream backing `subject`.
    pub async fn stream_len(&self, subject: &str) -> redis::RedisResult<usize> {
        let mut conn = self.connection().await?;
        redis::cmd("XLEN")
            .arg(stream_key(&self.cluster_id, subject))
            .query_async(&mut conn)
            .await
    }

    /// Payloads stored for `subject`, oldest first.
    pub async fn payloads(&self, subject: &str) -> redis::RedisResult<Vec<Vec<u8>>> {
        let mut conn = self.connection().await?;
        let reply: redis::streams::StreamRangeReply = redis::cmd("XRANGE")
            .arg(stream_key(&self.cluster_id, subject))
            .arg("-")
            .arg("+")
            .query_async(&mut conn)
            .await?;

        Ok(reply
            .ids
            .iter()
            .filter_map(|entry| match entry.map.get("payload") {
                Some(redis::Value::BulkString(bytes)) => Some(bytes.clone()),
                _ => None,
            })
            .collect())
    }

    /// Append a raw entry with arbitrary fields, bypassing the broker.
    pub async fn append_raw(&self, subject: &str, fields: &[(&str, &str)]) -> redis::RedisResult<String> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream_key(&self.cluster_id, subject)).arg("*");
        for (field, value) in fields {
            cmd.arg(*field).arg(*value);
        }
        cmd.query_async(&mut conn).await
    }

    /// Entries pending (delivered, unacked) for `group` on `subject`.
    pub async fn pending(&self, subject: &str, group: &str) -> redis::RedisResult<usize> {
        let mut conn = self.connection().await?;
        let reply: redis::streams::StreamPendingReply = redis::cmd("XPENDING")
            .arg(stream_key(&self.cluster_id, subject))
            .arg(group)
            .query_async(&mut conn)
            .await?;
        Ok(reply.count())
    }
}
