//! Log-based broker backend on Redis Streams.
//!
//! Each topic is a stream. Workers read through a consumer group, so several
//! worker instances share the work and Redis tracks per-consumer pending
//! entries (the group's offsets).
//!
//! ```text
//! publish  -> XADD <stream> MAXLEN ~ N * envelope <json>
//! receive  -> XAUTOCLAIM idle pending entries, else XREADGROUP ... BLOCK
//! ack      -> XACK
//! nack     -> XCLAIM ... IDLE <claim_idle> (eligible for XAUTOCLAIM right away)
//! ```
//!
//! Entries that were delivered but never acked (crashed worker) are picked up
//! again by XAUTOCLAIM once they have been idle for `claim_idle_ms`.

use async_trait::async_trait;
use deadpool_redis::redis::streams::{StreamReadOptions, StreamReadReply};
use deadpool_redis::redis::{cmd, AsyncCommands, Value as RedisValue};
use deadpool_redis::{Config, Pool, Runtime};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{AckHandle, BackendKind, Delivery, MessageId, QueueBackend, TransportError};
use crate::config::RedisQueueConfig;
use crate::envelope::{Envelope, Topic, TopicSet};

/// Stream field holding the encoded envelope.
const ENVELOPE_FIELD: &str = "envelope";

/// Redis Streams queue with consumer-group semantics.
pub struct RedisStreamQueue {
    pool: Pool,
    group: String,
    consumer: String,
    key_prefix: String,
    claim_idle: Duration,
    max_len: usize,
}

impl RedisStreamQueue {
    /// Connect, check the server answers, and create the consumer group on
    /// every topic stream.
    pub async fn connect(config: &RedisQueueConfig, topics: &TopicSet) -> Result<Self, TransportError> {
        if config.url.trim().is_empty() {
            return Err(TransportError::Config("queue.redis.url is empty".into()));
        }

        let pool = Config::from_url(config.url.clone())
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| TransportError::Config(format!("invalid Redis pool config: {}", e)))?;

        let queue = Self {
            pool,
            group: config.consumer_group.clone(),
            consumer: config.consumer_name(),
            key_prefix: config.key_prefix.clone(),
            claim_idle: Duration::from_millis(config.claim_idle_ms),
            max_len: config.max_len,
        };

        let mut conn = queue.connection().await?;
        let _: String = cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| TransportError::Unreachable(format!("Redis PING failed: {}", e)))?;

        for topic in topics.all() {
            queue.ensure_group(&mut conn, topic).await?;
        }

        info!(
            consumer_group = %queue.group,
            consumer = %queue.consumer,
            "Redis stream queue connected"
        );
        Ok(queue)
    }

    fn stream_key(&self, topic: &Topic) -> String {
        format!("{}{}", self.key_prefix, topic)
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, TransportError> {
        self.pool
            .get()
            .await
            .map_err(|e| TransportError::Unreachable(format!("Redis connection: {}", e)))
    }

    async fn ensure_group(
        &self,
        conn: &mut deadpool_redis::Connection,
        topic: &Topic,
    ) -> Result<(), TransportError> {
        // Start at 0 so entries published before the first worker came up are consumed.
        let result: Result<(), _> = cmd("XGROUP")
            .arg("CREATE")
            .arg(self.stream_key(topic))
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(conn)
            .await;

        match result {
            Ok(()) => {
                info!(stream = %self.stream_key(topic), consumer_group = %self.group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream = %self.stream_key(topic), "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(TransportError::Backend {
                backend: BackendKind::LogBroker,
                message: format!("XGROUP CREATE failed: {}", e),
            }),
        }
    }

    fn backend_error(context: &str, e: impl std::fmt::Display) -> TransportError {
        TransportError::Backend {
            backend: BackendKind::LogBroker,
            message: format!("{}: {}", context, e),
        }
    }

    fn delivery(&self, topic: &Topic, id: String, fields: &HashMap<String, RedisValue>) -> Delivery {
        let body = fields.get(ENVELOPE_FIELD).and_then(value_bytes).unwrap_or_default();
        Delivery {
            envelope: Envelope::from_wire(topic, &body),
            handle: AckHandle {
                topic: topic.clone(),
                message_id: MessageId(id.clone()),
                receipt: id,
            },
        }
    }

    /// Take over entries other consumers (or a previous run of this one) left pending.
    async fn claim_idle(
        &self,
        conn: &mut deadpool_redis::Connection,
        topic: &Topic,
        max_messages: usize,
    ) -> Result<Vec<Delivery>, TransportError> {
        let reply: RedisValue = cmd("XAUTOCLAIM")
            .arg(self.stream_key(topic))
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.claim_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(max_messages)
            .query_async(conn)
            .await
            .map_err(|e| Self::backend_error("XAUTOCLAIM failed", e))?;

        let claimed = parse_autoclaim(&reply);
        if !claimed.is_empty() {
            info!(
                topic = %topic,
                count = claimed.len(),
                "Claimed idle pending entries"
            );
        }
        Ok(claimed
            .into_iter()
            .map(|(id, fields)| self.delivery(topic, id, &fields))
            .collect())
    }
}

#[async_trait]
impl QueueBackend for RedisStreamQueue {
    fn kind(&self) -> BackendKind {
        BackendKind::LogBroker
    }

    async fn publish(&self, topic: &Topic, envelope: &Envelope) -> Result<MessageId, TransportError> {
        let body = envelope.to_bytes()?;
        let mut conn = self.connection().await?;

        let id: String = cmd("XADD")
            .arg(self.stream_key(topic))
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*")
            .arg(ENVELOPE_FIELD)
            .arg(body)
            .arg("attempt")
            .arg(envelope.attempt())
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::backend_error("XADD failed", e))?;

        debug!(topic = %topic, id = %id, attempt = envelope.attempt(), "Published to stream");
        Ok(MessageId(id))
    }

    async fn receive(
        &self,
        topic: &Topic,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, TransportError> {
        let mut conn = self.connection().await?;

        let claimed = self.claim_idle(&mut conn, topic, max_messages).await?;
        if !claimed.is_empty() {
            return Ok(claimed);
        }

        // BLOCK 0 would wait forever.
        let block_ms = wait.as_millis().max(1) as usize;
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .block(block_ms)
            .count(max_messages);

        let key = self.stream_key(topic);
        let result: Result<Option<StreamReadReply>, _> =
            conn.xread_options(&[key.as_str()], &[">"], &opts).await;

        match result {
            Ok(Some(reply)) => Ok(reply
                .keys
                .into_iter()
                .flat_map(|stream| stream.ids)
                .map(|element| self.delivery(topic, element.id, &element.map))
                .collect()),
            Ok(None) => Ok(Vec::new()),
            Err(e) => {
                let err_str = e.to_string();
                // Timeout / nil reply is the normal idle case.
                if err_str.contains("timed out") || err_str.contains("response was nil") {
                    Ok(Vec::new())
                } else {
                    Err(Self::backend_error("XREADGROUP failed", e))
                }
            }
        }
    }

    async fn ack(&self, handle: &AckHandle) -> Result<(), TransportError> {
        let mut conn = self.connection().await?;
        let acked: u64 = conn
            .xack(self.stream_key(&handle.topic), &self.group, &[&handle.receipt])
            .await
            .map_err(|e| Self::backend_error("XACK failed", e))?;

        if acked == 0 {
            warn!(topic = %handle.topic, id = %handle.receipt, "XACK matched no pending entry");
        }
        Ok(())
    }

    async fn nack(&self, handle: &AckHandle) -> Result<(), TransportError> {
        let mut conn = self.connection().await?;
        let _: RedisValue = cmd("XCLAIM")
            .arg(self.stream_key(&handle.topic))
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(0)
            .arg(&handle.receipt)
            .arg("IDLE")
            .arg(self.claim_idle.as_millis() as u64)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::backend_error("XCLAIM failed", e))?;
        Ok(())
    }

    async fn depth(&self, topic: &Topic) -> Option<u64> {
        let mut conn = self.connection().await.ok()?;
        cmd("XLEN")
            .arg(self.stream_key(topic))
            .query_async(&mut conn)
            .await
            .ok()
    }

    async fn close(&self) {
        self.pool.close();
    }
}

/// Extract bytes from a bulk or simple string reply.
fn value_bytes(value: &RedisValue) -> Option<Vec<u8>> {
    match value {
        RedisValue::BulkString(bytes) => Some(bytes.clone()),
        RedisValue::SimpleString(s) => Some(s.clone().into_bytes()),
        _ => None,
    }
}

fn value_string(value: &RedisValue) -> Option<String> {
    value_bytes(value).map(|b| String::from_utf8_lossy(&b).into_owned())
}

/// Parse an XAUTOCLAIM reply: `[next-id, [[id, [field, value, ...]], ...], (deleted-ids)]`.
///
/// Entries whose payload was trimmed away come back as nil and are skipped.
fn parse_autoclaim(reply: &RedisValue) -> Vec<(String, HashMap<String, RedisValue>)> {
    let RedisValue::Array(parts) = reply else {
        return Vec::new();
    };
    let Some(RedisValue::Array(entries)) = parts.get(1) else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let RedisValue::Array(pair) = entry else {
                return None;
            };
            let id = value_string(pair.first()?)?;
            let RedisValue::Array(flat) = pair.get(1)? else {
                return None;
            };
            let fields = flat
                .chunks(2)
                .filter_map(|kv| match kv {
                    [k, v] => Some((value_string(k)?, v.clone())),
                    _ => None,
                })
                .collect();
            Some((id, fields))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> RedisValue {
        RedisValue::BulkString(s.as_bytes().to_vec())
    }

    #[test]
    fn test_parse_autoclaim_reply() {
        let reply = RedisValue::Array(vec![
            bulk("0-0"),
            RedisValue::Array(vec![
                RedisValue::Array(vec![
                    bulk("1700000000000-0"),
                    RedisValue::Array(vec![bulk("envelope"), bulk("{}"), bulk("attempt"), bulk("1")]),
                ]),
                RedisValue::Array(vec![bulk("1700000000001-0"), RedisValue::Nil]),
            ]),
            RedisValue::Array(vec![]),
        ]);

        let parsed = parse_autoclaim(&reply);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, "1700000000000-0");
        assert_eq!(value_string(&parsed[0].1["envelope"]).unwrap(), "{}");
        assert_eq!(value_string(&parsed[0].1["attempt"]).unwrap(), "1");
    }

    #[test]
    fn test_parse_autoclaim_empty() {
        let reply = RedisValue::Array(vec![bulk("0-0"), RedisValue::Array(vec![]), RedisValue::Array(vec![])]);
        assert!(parse_autoclaim(&reply).is_empty());
        assert!(parse_autoclaim(&RedisValue::Nil).is_empty());
    }

    #[test]
    fn test_value_bytes() {
        assert_eq!(value_bytes(&bulk("abc")).unwrap(), b"abc");
        assert_eq!(value_bytes(&RedisValue::SimpleString("ok".into())).unwrap(), b"ok");
        assert!(value_bytes(&RedisValue::Int(3)).is_none());
    }

    #[tokio::test]
    async fn test_connect_rejects_empty_url() {
        let mut config = RedisQueueConfig::default();
        config.url = String::new();
        let topics = TopicSet::for_domain("fitbit");

        let result = RedisStreamQueue::connect(&config, &topics).await;
        assert!(matches!(result, Err(TransportError::Config(_))));
    }
}
