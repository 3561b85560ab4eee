//! Amazon SQS backend (JSON protocol, SigV4).
//!
//! Each logical topic maps to a queue URL; a `default` entry catches topics
//! without their own queue. Unacked messages reappear once the queue's
//! visibility timeout runs out.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use super::sigv4::{Credentials, Signer};
use super::{AckHandle, BackendKind, Delivery, MessageId, QueueBackend, TransportError};
use crate::config::SqsConfig;
use crate::envelope::{Envelope, Topic, TopicSet};

const CONTENT_TYPE: &str = "application/x-amz-json-1.0";

/// SQS long polling tops out at 20 seconds.
const MAX_WAIT_SECONDS: u64 = 20;

/// SQS returns at most 10 messages per receive.
const MAX_BATCH: usize = 10;

#[derive(Debug, Deserialize)]
struct SendMessageResponse {
    #[serde(rename = "MessageId")]
    message_id: String,
}

#[derive(Debug, Deserialize)]
struct ReceiveMessageResponse {
    #[serde(rename = "Messages", default)]
    messages: Vec<SqsMessage>,
}

#[derive(Debug, Deserialize)]
struct SqsMessage {
    #[serde(rename = "MessageId")]
    message_id: String,
    #[serde(rename = "ReceiptHandle")]
    receipt_handle: String,
    #[serde(rename = "Body", default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct QueueAttributesResponse {
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(rename = "__type", default)]
    error_type: String,
    #[serde(default, alias = "Message")]
    message: String,
}

/// Amazon SQS queues addressed by URL.
pub struct SqsQueue {
    client: Client,
    endpoint: Url,
    host: String,
    signer: Signer,
    queue_urls: HashMap<String, String>,
    visibility_timeout_secs: u64,
}

impl SqsQueue {
    /// Validate settings and check the raw topic's queue answers.
    pub async fn connect(config: &SqsConfig, topics: &TopicSet) -> Result<Self, TransportError> {
        let queue = Self::from_config(config, topics)?;

        let depth = queue.approximate_depth(&topics.raw).await?;
        info!(
            region = %config.region,
            endpoint = %queue.endpoint,
            raw_depth = depth,
            "SQS queue connected"
        );
        Ok(queue)
    }

    fn from_config(config: &SqsConfig, topics: &TopicSet) -> Result<Self, TransportError> {
        check_topic_urls(&config.queue_urls, topics).map_err(TransportError::Config)?;
        let credentials = Credentials {
            access_key_id: config.access_key_id.clone(),
            secret_access_key: config.secret_access_key.clone(),
            session_token: config.session_token.clone().filter(|t| !t.is_empty()),
        };
        if !credentials.is_complete() {
            return Err(TransportError::Config("queue.sqs credentials are required".into()));
        }

        let endpoint = config
            .endpoint
            .clone()
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| format!("https://sqs.{}.amazonaws.com", config.region));
        let endpoint = Url::parse(&endpoint)
            .map_err(|e| TransportError::Config(format!("invalid SQS endpoint {}: {}", endpoint, e)))?;
        let host = host_header(&endpoint)
            .ok_or_else(|| TransportError::Config(format!("SQS endpoint {} has no host", endpoint)))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(MAX_WAIT_SECONDS + 10))
            .build()
            .map_err(|e| TransportError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            host,
            signer: Signer::new(credentials, config.region.clone(), "sqs"),
            queue_urls: config.queue_urls.clone(),
            visibility_timeout_secs: config.visibility_timeout_secs,
        })
    }

    fn queue_url(&self, topic: &Topic) -> Result<&str, TransportError> {
        resolve_queue_url(&self.queue_urls, topic)
            .ok_or_else(|| TransportError::Config(format!("no SQS queue URL mapped for topic {}", topic)))
    }

    async fn call(&self, action: &str, body: Value) -> Result<Value, TransportError> {
        let payload = serde_json::to_vec(&body)?;
        let target = format!("AmazonSQS.{}", action);
        let signed = self.signer.sign_post(
            &self.host,
            &[("content-type", CONTENT_TYPE), ("x-amz-target", &target)],
            &payload,
            Utc::now(),
        );

        let mut request = self.client.post(self.endpoint.clone()).body(payload);
        for (name, value) in &signed.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Unreachable(format!("SQS {}: {}", action, e)))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| TransportError::Backend {
            backend: BackendKind::CloudQueue,
            message: format!("{} response body: {}", action, e),
        })?;

        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Value::Object(Default::default()));
            }
            return Ok(serde_json::from_str(&text)?);
        }

        let error: ErrorResponse = serde_json::from_str(&text).unwrap_or(ErrorResponse {
            error_type: String::new(),
            message: text.clone(),
        });
        Err(classify_error(action, status.as_u16(), &error))
    }

    async fn approximate_depth(&self, topic: &Topic) -> Result<u64, TransportError> {
        let response = self
            .call(
                "GetQueueAttributes",
                json!({
                    "QueueUrl": self.queue_url(topic)?,
                    "AttributeNames": ["ApproximateNumberOfMessages"],
                }),
            )
            .await?;
        let parsed: QueueAttributesResponse = serde_json::from_value(response)?;
        Ok(parsed
            .attributes
            .get("ApproximateNumberOfMessages")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }
}

#[async_trait]
impl QueueBackend for SqsQueue {
    fn kind(&self) -> BackendKind {
        BackendKind::CloudQueue
    }

    async fn publish(&self, topic: &Topic, envelope: &Envelope) -> Result<MessageId, TransportError> {
        let body = String::from_utf8_lossy(&envelope.to_bytes()?).into_owned();
        let response = self
            .call(
                "SendMessage",
                json!({ "QueueUrl": self.queue_url(topic)?, "MessageBody": body }),
            )
            .await?;
        let parsed: SendMessageResponse = serde_json::from_value(response)?;

        debug!(topic = %topic, message_id = %parsed.message_id, "Published to SQS");
        Ok(MessageId(parsed.message_id))
    }

    async fn receive(
        &self,
        topic: &Topic,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, TransportError> {
        let response = self
            .call(
                "ReceiveMessage",
                json!({
                    "QueueUrl": self.queue_url(topic)?,
                    "MaxNumberOfMessages": max_messages.clamp(1, MAX_BATCH),
                    "WaitTimeSeconds": wait.as_secs().min(MAX_WAIT_SECONDS),
                    "VisibilityTimeout": self.visibility_timeout_secs,
                }),
            )
            .await?;
        let parsed: ReceiveMessageResponse = serde_json::from_value(response)?;

        Ok(parsed
            .messages
            .into_iter()
            .map(|message| Delivery {
                envelope: Envelope::from_wire(topic, message.body.as_bytes()),
                handle: AckHandle {
                    topic: topic.clone(),
                    message_id: MessageId(message.message_id),
                    receipt: message.receipt_handle,
                },
            })
            .collect())
    }

    async fn ack(&self, handle: &AckHandle) -> Result<(), TransportError> {
        self.call(
            "DeleteMessage",
            json!({
                "QueueUrl": self.queue_url(&handle.topic)?,
                "ReceiptHandle": handle.receipt,
            }),
        )
        .await?;
        Ok(())
    }

    async fn nack(&self, handle: &AckHandle) -> Result<(), TransportError> {
        self.call(
            "ChangeMessageVisibility",
            json!({
                "QueueUrl": self.queue_url(&handle.topic)?,
                "ReceiptHandle": handle.receipt,
                "VisibilityTimeout": 0,
            }),
        )
        .await?;
        Ok(())
    }

    async fn depth(&self, topic: &Topic) -> Option<u64> {
        self.approximate_depth(topic).await.ok()
    }
}

pub(crate) fn resolve_queue_url<'a>(urls: &'a HashMap<String, String>, topic: &Topic) -> Option<&'a str> {
    urls.get(topic.as_str())
        .or_else(|| urls.get("default"))
        .map(String::as_str)
        .filter(|url| !url.is_empty())
}

/// Every topic needs a queue URL. The DLQ must not share a queue with the
/// consumed raw or retry topic.
pub(crate) fn check_topic_urls(
    urls: &HashMap<String, String>,
    topics: &TopicSet,
) -> Result<(), String> {
    let resolve = |topic: &Topic| {
        resolve_queue_url(urls, topic)
            .ok_or_else(|| format!("queue.sqs.queue_urls has no URL for topic {} (and no `default`)", topic))
    };
    let raw = resolve(&topics.raw)?;
    let retry = resolve(&topics.retry)?;
    let dlq = resolve(&topics.dlq)?;
    if dlq == raw || dlq == retry {
        return Err(format!(
            "queue.sqs.queue_urls must map the dlq topic {} to its own queue, not {}",
            topics.dlq, dlq
        ));
    }
    Ok(())
}

fn host_header(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn classify_error(action: &str, status: u16, error: &ErrorResponse) -> TransportError {
    let code = error.error_type.rsplit('#').next().unwrap_or_default();
    let message = format!("{} failed ({} {}): {}", action, status, code, error.message);

    let throttled = matches!(
        code,
        "ThrottlingException" | "RequestThrottled" | "ServiceUnavailable" | "InternalError"
    );
    if status >= 500 || status == 429 || throttled {
        TransportError::Backend {
            backend: BackendKind::CloudQueue,
            message,
        }
    } else {
        TransportError::Config(message)
    }
}
