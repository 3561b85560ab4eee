//! Configuration for vitalflow.
//!
//! Loads configuration from a TOML file with `${VAR}` substitution, then
//! applies environment overrides on top.
//!
//! # Example
//!
//! ```toml
//! [queue]
//! backend = "log-broker"
//! fallback_to_memory = false
//!
//! [queue.redis]
//! url = "${REDIS_URL}"
//!
//! [worker]
//! max_retries = 3
//!
//! [timing]
//! log_level = "debug"
//! warn_ms = 1000
//! ```

use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::envelope::{Topic, TopicSet};
use crate::queue::{sqs, BackendKind};

/// Log levels accepted for `[logging] level` and `[timing] log_level`.
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Upper bound for `[worker] max_retries`.
const MAX_RETRY_LIMIT: u32 = 100;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid value for {name}: {value}")]
    InvalidOverride { name: String, value: String },

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct VitalflowConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub provider: ProviderConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Intake HTTP server
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

/// Queue backend selection and per-backend settings
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// Use the in-memory queue when the configured backend fails to start.
    #[serde(default)]
    pub fallback_to_memory: bool,

    /// Retries of a transient transport failure before it surfaces.
    #[serde(default = "default_transport_retries")]
    pub transport_retries: u32,

    #[serde(default = "default_transport_backoff_ms")]
    pub transport_backoff_ms: u64,

    #[serde(default)]
    pub topics: TopicsConfig,

    #[serde(default)]
    pub memory: MemoryQueueConfig,

    #[serde(default)]
    pub redis: RedisQueueConfig,

    #[serde(default)]
    pub pubsub: PubSubConfig,

    #[serde(default)]
    pub sqs: SqsConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            fallback_to_memory: false,
            transport_retries: default_transport_retries(),
            transport_backoff_ms: default_transport_backoff_ms(),
            topics: TopicsConfig::default(),
            memory: MemoryQueueConfig::default(),
            redis: RedisQueueConfig::default(),
            pubsub: PubSubConfig::default(),
            sqs: SqsConfig::default(),
        }
    }
}

fn default_backend() -> BackendKind {
    BackendKind::Memory
}

fn default_transport_retries() -> u32 {
    3
}

fn default_transport_backoff_ms() -> u64 {
    200
}

/// Logical topic names. Unset names derive from the domain.
#[derive(Debug, Deserialize, Clone)]
pub struct TopicsConfig {
    #[serde(default = "default_domain")]
    pub domain: String,

    #[serde(default)]
    pub raw: Option<String>,

    #[serde(default)]
    pub retry: Option<String>,

    #[serde(default)]
    pub dlq: Option<String>,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            raw: None,
            retry: None,
            dlq: None,
        }
    }
}

fn default_domain() -> String {
    "fitbit".to_string()
}

impl TopicsConfig {
    pub fn topic_set(&self) -> TopicSet {
        let derived = TopicSet::for_domain(&self.domain);
        let pick = |explicit: &Option<String>, fallback: Topic| match explicit {
            Some(name) if !name.trim().is_empty() => Topic::new(name.trim()),
            _ => fallback,
        };
        TopicSet {
            raw: pick(&self.raw, derived.raw),
            retry: pick(&self.retry, derived.retry),
            dlq: pick(&self.dlq, derived.dlq),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MemoryQueueConfig {
    #[serde(default = "default_visibility_timeout_ms")]
    pub visibility_timeout_ms: u64,
}

impl Default for MemoryQueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_ms: default_visibility_timeout_ms(),
        }
    }
}

impl MemoryQueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }
}

fn default_visibility_timeout_ms() -> u64 {
    30_000
}

/// Redis Streams log broker
#[derive(Debug, Deserialize, Clone)]
pub struct RedisQueueConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Consumer name inside the group; defaults to `<hostname>-<pid>`.
    #[serde(default)]
    pub consumer: Option<String>,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Deliveries pending longer than this are claimed by other consumers.
    #[serde(default = "default_claim_idle_ms")]
    pub claim_idle_ms: u64,

    /// Approximate cap on stream length.
    #[serde(default = "default_max_len")]
    pub max_len: usize,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            consumer_group: default_consumer_group(),
            consumer: None,
            key_prefix: default_key_prefix(),
            claim_idle_ms: default_claim_idle_ms(),
            max_len: default_max_len(),
        }
    }
}

impl RedisQueueConfig {
    pub fn consumer_name(&self) -> String {
        match &self.consumer {
            Some(name) if !name.is_empty() => name.clone(),
            _ => {
                let host = hostname::get()
                    .map(|h| h.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| "worker".to_string());
                format!("{}-{}", host, std::process::id())
            }
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_consumer_group() -> String {
    "vitalflow_workers".to_string()
}

fn default_key_prefix() -> String {
    "vitalflow:".to_string()
}

fn default_claim_idle_ms() -> u64 {
    60_000
}

fn default_max_len() -> usize {
    100_000
}

/// Google Cloud Pub/Sub
#[derive(Debug, Deserialize, Clone)]
pub struct PubSubConfig {
    #[serde(default)]
    pub project_id: String,

    #[serde(default = "default_pubsub_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub topic_prefix: String,

    /// Logical topic -> subscription id, for subscriptions not named `<topic-id>-sub`.
    #[serde(default)]
    pub subscriptions: HashMap<String, String>,

    #[serde(default)]
    pub access_token: Option<String>,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            endpoint: default_pubsub_endpoint(),
            topic_prefix: String::new(),
            subscriptions: HashMap::new(),
            access_token: None,
        }
    }
}

fn default_pubsub_endpoint() -> String {
    "https://pubsub.googleapis.com".to_string()
}

/// Amazon SQS
#[derive(Debug, Deserialize, Clone)]
pub struct SqsConfig {
    #[serde(default = "default_region")]
    pub region: String,

    /// Overrides `https://sqs.<region>.amazonaws.com`, e.g. for LocalStack.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Logical topic (or `default`) -> queue URL
    #[serde(default)]
    pub queue_urls: HashMap<String, String>,

    #[serde(default)]
    pub access_key_id: String,

    #[serde(default)]
    pub secret_access_key: String,

    #[serde(default)]
    pub session_token: Option<String>,

    #[serde(default = "default_sqs_visibility_secs")]
    pub visibility_timeout_secs: u64,
}

impl Default for SqsConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint: None,
            queue_urls: HashMap::new(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            session_token: None,
            visibility_timeout_secs: default_sqs_visibility_secs(),
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_sqs_visibility_secs() -> u64 {
    30
}

/// Worker loop
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Longest wait of a single receive call.
    #[serde(default = "default_poll_seconds")]
    pub poll_seconds: u64,

    /// Delay before a retry is published; 0 disables it.
    #[serde(default)]
    pub retry_backoff_ms: u64,

    /// Port of the worker's health surface.
    #[serde(default = "default_health_port")]
    pub health_port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            batch_size: default_batch_size(),
            poll_seconds: default_poll_seconds(),
            retry_backoff_ms: 0,
            health_port: default_health_port(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_wait(&self) -> Duration {
        Duration::from_secs(self.poll_seconds)
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_batch_size() -> usize {
    25
}

fn default_poll_seconds() -> u64 {
    2
}

fn default_health_port() -> u16 {
    3001
}

/// Per-operation timing logs
#[derive(Debug, Deserialize, Clone)]
pub struct TimingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Calls slower than this are logged at warn.
    #[serde(default = "default_warn_ms")]
    pub warn_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_level: default_log_level(),
            warn_ms: default_warn_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_warn_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DedupeBackend {
    Memory,
    Redis,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordBackend {
    Memory,
    Jsonl,
}

/// Dedupe and record stores
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_dedupe_backend")]
    pub dedupe: DedupeBackend,

    /// Falls back to `[queue.redis] url`.
    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default = "default_dedupe_ttl_secs")]
    pub dedupe_ttl_secs: u64,

    #[serde(default = "default_record_backend")]
    pub records: RecordBackend,

    #[serde(default = "default_records_path")]
    pub records_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dedupe: default_dedupe_backend(),
            redis_url: None,
            dedupe_ttl_secs: default_dedupe_ttl_secs(),
            records: default_record_backend(),
            records_path: default_records_path(),
        }
    }
}

fn default_dedupe_backend() -> DedupeBackend {
    DedupeBackend::Memory
}

fn default_dedupe_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_record_backend() -> RecordBackend {
    RecordBackend::Jsonl
}

fn default_records_path() -> PathBuf {
    PathBuf::from("data/processed_records.jsonl")
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProviderConfig {
    #[serde(default)]
    pub fitbit: FitbitConfig,
}

/// Fitbit Web API client and subscriber settings
#[derive(Debug, Deserialize, Clone)]
pub struct FitbitConfig {
    #[serde(default = "default_fitbit_api_base")]
    pub api_base: String,

    #[serde(default = "default_fitbit_timeout_ms")]
    pub timeout_ms: u64,

    /// Codes accepted by the subscriber verification handshake.
    #[serde(default)]
    pub verification_codes: Vec<String>,

    /// Subject -> access token. Token refresh is handled elsewhere.
    #[serde(default)]
    pub access_tokens: HashMap<String, String>,

    /// Token used for subjects without their own entry.
    #[serde(default)]
    pub default_access_token: Option<String>,
}

impl Default for FitbitConfig {
    fn default() -> Self {
        Self {
            api_base: default_fitbit_api_base(),
            timeout_ms: default_fitbit_timeout_ms(),
            verification_codes: Vec::new(),
            access_tokens: HashMap::new(),
            default_access_token: None,
        }
    }
}

fn default_fitbit_api_base() -> String {
    "https://api.fitbit.com".to_string()
}

fn default_fitbit_timeout_ms() -> u64 {
    10_000
}

impl VitalflowConfig {
    /// Load configuration from the default path or VITALFLOW_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("VITALFLOW_CONFIG").unwrap_or_else(|_| "config/vitalflow.toml".to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path, then apply environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let mut config = if path.exists() {
            info!(path = %path.display(), "Loading configuration");
            let content = fs::read_to_string(path)?;
            let content = substitute_env_vars(&content);
            debug!("Parsing TOML configuration");
            toml::from_str(&content)?
        } else {
            info!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };

        config.apply_overrides(|name| env::var(name).ok())?;
        config.validate()?;

        info!(
            backend = %config.queue.backend,
            fallback_to_memory = config.queue.fallback_to_memory,
            max_retries = config.worker.max_retries,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Apply the flat environment variables used by container deployments.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string());

        if let Some(v) = get("QUEUE_BACKEND") {
            self.queue.backend = v.parse().map_err(|_| invalid("QUEUE_BACKEND", &v))?;
        }
        if let Some(v) = get("QUEUE_FALLBACK_TO_MEMORY") {
            self.queue.fallback_to_memory = parse_bool("QUEUE_FALLBACK_TO_MEMORY", &v)?;
        }
        if let Some(v) = get("QUEUE_REDIS_URL") {
            self.queue.redis.url = v;
        }
        if let Some(v) = get("QUEUE_GCP_PROJECT_ID") {
            self.queue.pubsub.project_id = v;
        }
        if let Some(v) = get("QUEUE_GCP_TOPIC_PREFIX") {
            self.queue.pubsub.topic_prefix = v;
        }
        if let Some(v) = get("QUEUE_AWS_REGION").filter(|v| !v.is_empty()) {
            self.queue.sqs.region = v;
        }
        if let Some(v) = get("QUEUE_AWS_SQS_TOPIC_URLS").filter(|v| !v.is_empty()) {
            let urls: HashMap<String, String> =
                serde_json::from_str(&v).map_err(|_| invalid("QUEUE_AWS_SQS_TOPIC_URLS", &v))?;
            self.queue.sqs.queue_urls.extend(urls);
        }
        if let Some(v) = get("QUEUE_AWS_SQS_URL").filter(|v| !v.is_empty()) {
            self.queue.sqs.queue_urls.entry("default".to_string()).or_insert(v);
        }
        if let Some(v) = get("AWS_ACCESS_KEY_ID") {
            self.queue.sqs.access_key_id = v;
        }
        if let Some(v) = get("AWS_SECRET_ACCESS_KEY") {
            self.queue.sqs.secret_access_key = v;
        }
        if let Some(v) = get("AWS_SESSION_TOKEN") {
            self.queue.sqs.session_token = Some(v);
        }

        if let Some(v) = get("WORKER_MAX_RETRIES") {
            self.worker.max_retries = v.parse().map_err(|_| invalid("WORKER_MAX_RETRIES", &v))?;
        }
        if let Some(v) = get("WORKER_BATCH_SIZE") {
            self.worker.batch_size = v.parse().map_err(|_| invalid("WORKER_BATCH_SIZE", &v))?;
        }
        if let Some(v) = get("WORKER_POLL_SECONDS") {
            self.worker.poll_seconds = v.parse().map_err(|_| invalid("WORKER_POLL_SECONDS", &v))?;
        }
        if let Some(v) = get("WORKER_TOPIC_RAW") {
            self.queue.topics.raw = Some(v);
        }
        if let Some(v) = get("WORKER_TOPIC_RETRY") {
            self.queue.topics.retry = Some(v);
        }
        if let Some(v) = get("WORKER_TOPIC_DLQ") {
            self.queue.topics.dlq = Some(v);
        }
        if let Some(v) = get("WORKER_OUTPUT_FILE") {
            self.store.records_path = PathBuf::from(v);
        }

        if let Some(v) = get("WORKER_TIMING_ENABLED") {
            self.timing.enabled = parse_bool("WORKER_TIMING_ENABLED", &v)?;
        }
        if let Some(v) = get("WORKER_TIMING_LOG_LEVEL") {
            self.timing.log_level = v;
        }
        if let Some(v) = get("WORKER_TIMING_WARN_MS") {
            let ms: f64 = v.parse().map_err(|_| invalid("WORKER_TIMING_WARN_MS", &v))?;
            if !ms.is_finite() || ms < 0.0 {
                return Err(invalid("WORKER_TIMING_WARN_MS", &v));
            }
            self.timing.warn_ms = ms.round() as u64;
        }

        if let Some(v) = get("FITBIT_SUBSCRIPTION_VERIFY_CODE") {
            self.provider.fitbit.verification_codes = v
                .split(',')
                .map(str::trim)
                .filter(|code| !code.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.logging.level = v;
        }

        self.logging.level = normalize_level(&self.logging.level);
        self.timing.log_level = normalize_level(&self.timing.log_level);

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "logging.level must be one of {:?}, got '{}'",
                LOG_LEVELS, self.logging.level
            )));
        }
        if !LOG_LEVELS.contains(&self.timing.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "timing.log_level must be one of {:?}, got '{}'",
                LOG_LEVELS, self.timing.log_level
            )));
        }

        if self.worker.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "worker.batch_size must be greater than 0".to_string(),
            ));
        }
        if self.worker.max_retries > MAX_RETRY_LIMIT {
            return Err(ConfigError::ValidationError(format!(
                "worker.max_retries must be at most {}",
                MAX_RETRY_LIMIT
            )));
        }

        let topics = self.queue.topics.topic_set();
        if topics.raw == topics.retry || topics.raw == topics.dlq || topics.retry == topics.dlq {
            return Err(ConfigError::ValidationError(
                "raw, retry and dlq topics must be distinct".to_string(),
            ));
        }

        if self.queue.backend == BackendKind::LogBroker && self.queue.redis.url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "queue.redis.url is required for the log-broker backend".to_string(),
            ));
        }
        if self.queue.backend == BackendKind::CloudQueue {
            let urls = &self.queue.sqs.queue_urls;
            let dlq = sqs::resolve_queue_url(urls, &topics.dlq);
            let shared = [&topics.raw, &topics.retry]
                .into_iter()
                .any(|topic| dlq.is_some() && sqs::resolve_queue_url(urls, topic) == dlq);
            if shared {
                return Err(ConfigError::ValidationError(format!(
                    "queue.sqs.queue_urls must map the dlq topic {} to its own queue",
                    topics.dlq
                )));
            }
        }

        if self.store.dedupe == DedupeBackend::Redis && self.dedupe_redis_url().trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "store.redis_url (or queue.redis.url) is required for the redis dedupe store"
                    .to_string(),
            ));
        }

        Ok(())
    }

    pub fn topics(&self) -> TopicSet {
        self.queue.topics.topic_set()
    }

    /// Redis URL of the dedupe store.
    pub fn dedupe_redis_url(&self) -> &str {
        match &self.store.redis_url {
            Some(url) if !url.is_empty() => url,
            _ => &self.queue.redis.url,
        }
    }
}

fn invalid(name: &str, value: &str) -> ConfigError {
    ConfigError::InvalidOverride {
        name: name.to_string(),
        value: value.to_string(),
    }
}

/// Lowercase a level name and accept `warning` for `warn`.
fn normalize_level(level: &str) -> String {
    match level.trim().to_ascii_lowercase().as_str() {
        "warning" => "warn".to_string(),
        other => other.to_string(),
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(invalid(name, value)),
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    let re = match Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}") {
        Ok(re) => re,
        Err(_) => return content.to_string(),
    };

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    })
    .to_string()
}
