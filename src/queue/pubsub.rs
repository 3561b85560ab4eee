//! Google Cloud Pub/Sub backend (REST, pull subscriptions).
//!
//! Logical topic `fitbit.notifications.raw` maps to Pub/Sub topic
//! `<prefix>fitbit-notifications-raw` and, unless mapped explicitly, to the
//! subscription `<topic-id>-sub` created by the provisioning tooling.
//!
//! ```text
//! publish  -> POST projects/{p}/topics/{t}:publish
//! receive  -> POST projects/{p}/subscriptions/{s}:pull
//! ack      -> POST projects/{p}/subscriptions/{s}:acknowledge
//! nack     -> POST projects/{p}/subscriptions/{s}:modifyAckDeadline (0 s)
//! ```
//!
//! Unacked messages come back after the subscription's ack deadline.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use super::{AckHandle, BackendKind, Delivery, MessageId, QueueBackend, TransportError};
use crate::config::PubSubConfig;
use crate::envelope::{Envelope, Topic, TopicSet};

/// Pub/Sub keeps a pull open for a while on its own; this caps our side.
const MAX_PULL_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    message: PubsubMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PubsubMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    message_id: String,
}

/// Google Cloud Pub/Sub over its REST API.
pub struct PubSubQueue {
    client: Client,
    endpoint: String,
    project_id: String,
    topic_prefix: String,
    subscriptions: HashMap<String, String>,
    access_token: Option<String>,
}

impl PubSubQueue {
    /// Validate settings and check the raw topic is reachable.
    pub async fn connect(config: &PubSubConfig, topics: &TopicSet) -> Result<Self, TransportError> {
        if config.project_id.trim().is_empty() {
            return Err(TransportError::Config("queue.pubsub.project_id is required".into()));
        }

        let client = Client::builder()
            .timeout(MAX_PULL_WAIT + Duration::from_secs(10))
            .build()
            .map_err(|e| TransportError::Config(format!("HTTP client: {}", e)))?;

        let queue = Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            project_id: config.project_id.trim().to_string(),
            topic_prefix: config.topic_prefix.clone(),
            subscriptions: config.subscriptions.clone(),
            access_token: config.access_token.clone().filter(|t| !t.is_empty()),
        };

        let url = format!("{}/v1/{}", queue.endpoint, queue.topic_path(&topics.raw));
        let response = queue
            .authorized(queue.client.get(&url))
            .send()
            .await
            .map_err(|e| TransportError::Unreachable(format!("Pub/Sub: {}", e)))?;
        if !response.status().is_success() {
            return Err(TransportError::Config(format!(
                "Pub/Sub topic {} not accessible ({})",
                queue.topic_path(&topics.raw),
                response.status()
            )));
        }

        info!(project_id = %queue.project_id, endpoint = %queue.endpoint, "Pub/Sub queue connected");
        Ok(queue)
    }

    fn topic_path(&self, topic: &Topic) -> String {
        format!(
            "projects/{}/topics/{}",
            self.project_id,
            topic_id(&self.topic_prefix, topic)
        )
    }

    fn subscription_path(&self, topic: &Topic) -> String {
        let subscription = self
            .subscriptions
            .get(topic.as_str())
            .cloned()
            .unwrap_or_else(|| default_subscription_id(&topic_id(&self.topic_prefix, topic)));
        format!("projects/{}/subscriptions/{}", self.project_id, subscription)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn call(&self, path: &str, body: Value, timeout: Duration) -> Result<Value, TransportError> {
        let url = format!("{}/v1/{}", self.endpoint, path);
        let response = self
            .authorized(self.client.post(&url))
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Backend {
                        backend: BackendKind::CloudPubSub,
                        message: format!("{} timed out", path),
                    }
                } else {
                    TransportError::Unreachable(format!("Pub/Sub: {}", e))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(|e| TransportError::Backend {
                backend: BackendKind::CloudPubSub,
                message: format!("invalid response from {}: {}", path, e),
            });
        }

        let detail = response.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => Err(
                TransportError::Config(format!("{} returned {}: {}", path, status, detail)),
            ),
            _ => Err(TransportError::Backend {
                backend: BackendKind::CloudPubSub,
                message: format!("{} returned {}: {}", path, status, detail),
            }),
        }
    }
}

#[async_trait]
impl QueueBackend for PubSubQueue {
    fn kind(&self) -> BackendKind {
        BackendKind::CloudPubSub
    }

    async fn publish(&self, topic: &Topic, envelope: &Envelope) -> Result<MessageId, TransportError> {
        let body = publish_body(&envelope.to_bytes()?, envelope);
        let path = format!("{}:publish", self.topic_path(topic));
        let response = self.call(&path, body, Duration::from_secs(10)).await?;

        let parsed: PublishResponse = serde_json::from_value(response)?;
        let id = parsed.message_ids.into_iter().next().ok_or_else(|| TransportError::Backend {
            backend: BackendKind::CloudPubSub,
            message: "publish returned no message id".into(),
        })?;

        debug!(topic = %topic, message_id = %id, "Published to Pub/Sub");
        Ok(MessageId(id))
    }

    async fn receive(
        &self,
        topic: &Topic,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, TransportError> {
        let path = format!("{}:pull", self.subscription_path(topic));
        let timeout = wait.clamp(Duration::from_secs(1), MAX_PULL_WAIT);

        let response = match self
            .call(&path, json!({ "maxMessages": max_messages }), timeout)
            .await
        {
            Ok(response) => response,
            // An idle pull that ran out of time is just an empty batch.
            Err(TransportError::Backend { message, .. }) if message.ends_with("timed out") => {
                return Ok(Vec::new())
            }
            Err(e) => return Err(e),
        };

        let parsed: PullResponse = serde_json::from_value(response)?;
        Ok(parsed
            .received_messages
            .into_iter()
            .map(|received| {
                let body = BASE64.decode(received.message.data.as_bytes()).unwrap_or_else(|_| {
                    received.message.data.clone().into_bytes()
                });
                Delivery {
                    envelope: Envelope::from_wire(topic, &body),
                    handle: AckHandle {
                        topic: topic.clone(),
                        message_id: MessageId(received.message.message_id),
                        receipt: received.ack_id,
                    },
                }
            })
            .collect())
    }

    async fn ack(&self, handle: &AckHandle) -> Result<(), TransportError> {
        let path = format!("{}:acknowledge", self.subscription_path(&handle.topic));
        self.call(&path, json!({ "ackIds": [handle.receipt] }), Duration::from_secs(10))
            .await?;
        Ok(())
    }

    async fn nack(&self, handle: &AckHandle) -> Result<(), TransportError> {
        let path = format!("{}:modifyAckDeadline", self.subscription_path(&handle.topic));
        self.call(
            &path,
            json!({ "ackIds": [handle.receipt], "ackDeadlineSeconds": 0 }),
            Duration::from_secs(10),
        )
        .await?;
        Ok(())
    }
}

/// Pub/Sub topic id for a logical topic: dots become dashes, prefix prepended.
pub fn topic_id(prefix: &str, topic: &Topic) -> String {
    format!("{}{}", prefix, topic.as_str().replace('.', "-"))
}

pub fn default_subscription_id(topic_id: &str) -> String {
    format!("{}-sub", topic_id)
}

fn publish_body(bytes: &[u8], envelope: &Envelope) -> Value {
    json!({
        "messages": [{
            "data": BASE64.encode(bytes),
            "attributes": {
                "attempt": envelope.attempt().to_string(),
                "envelopeId": envelope.id().to_string(),
            }
        }]
    })
}
