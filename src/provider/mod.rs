//! Provider API clients used by the fetch-details stage.
//!
//! A [`ProviderApi`] turns one notification into the metric payload it
//! refers to. Clients are looked up by provider id in a [`ProviderRegistry`].
//! Credentials come from a [`CredentialSource`]; token issuance and refresh
//! live outside this crate, which only reports auth failures back through an
//! [`AuthFailureSink`].
//!
//! ## Built-in clients
//!
//! - [`FitbitClient`]: Fitbit Web API (activities, sleep, body, HRV)

pub mod fitbit;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::config::FitbitConfig;
use crate::record::MetricDetails;

pub use fitbit::FitbitClient;

/// Errors returned by provider clients.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Token expired, revoked or missing. Needs outside remediation.
    #[error("provider authorization failed: {0}")]
    Auth(String),

    /// Network failure, rate limit or provider outage
    #[error("provider temporarily unavailable: {0}")]
    Transient(String),

    /// Provider refused the request for a reason retrying will not fix
    #[error("provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// What the fetch stage asks a provider for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub subject: String,
    pub collection: String,
    /// `YYYY-MM-DD`
    pub date: String,
}

/// A provider's data API.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    /// Provider id this client serves (e.g. "fitbit")
    fn provider(&self) -> &str;

    /// Fetch the metrics a notification refers to.
    async fn fetch_details(
        &self,
        request: &FetchRequest,
        access_token: &str,
    ) -> Result<MetricDetails, ProviderError>;
}

/// Registry of provider clients by provider id.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ProviderApi>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    pub fn register(&mut self, provider: Arc<dyn ProviderApi>) {
        self.providers.insert(provider.provider().to_string(), provider);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn ProviderApi>> {
        self.providers.get(provider).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Source of provider access tokens.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Current access token for `subject` at `provider`.
    ///
    /// A missing credential is an [`ProviderError::Auth`]; a store outage is
    /// [`ProviderError::Transient`].
    async fn access_token(&self, provider: &str, subject: &str) -> Result<String, ProviderError>;
}

/// Tokens from configuration, per subject with an optional shared fallback.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    tokens: HashMap<(String, String), String>,
    fallback: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, provider: &str, subject: &str, token: impl Into<String>) -> Self {
        self.tokens
            .insert((provider.to_string(), subject.to_string()), token.into());
        self
    }

    pub fn with_fallback(mut self, provider: &str, token: impl Into<String>) -> Self {
        self.fallback.insert(provider.to_string(), token.into());
        self
    }

    pub fn from_fitbit_config(config: &FitbitConfig) -> Self {
        let mut credentials = config
            .access_tokens
            .iter()
            .fold(Self::new(), |creds, (subject, token)| {
                creds.with_token("fitbit", subject, token.clone())
            });
        if let Some(token) = config.default_access_token.as_ref().filter(|t| !t.is_empty()) {
            credentials = credentials.with_fallback("fitbit", token.clone());
        }
        credentials
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn access_token(&self, provider: &str, subject: &str) -> Result<String, ProviderError> {
        self.tokens
            .get(&(provider.to_string(), subject.to_string()))
            .or_else(|| self.fallback.get(provider))
            .cloned()
            .ok_or_else(|| {
                ProviderError::Auth(format!("no {} token for subject {}", provider, subject))
            })
    }
}

/// Receives auth failures so tokens can be refreshed or users re-consented.
#[async_trait]
pub trait AuthFailureSink: Send + Sync {
    async fn auth_failed(&self, provider: &str, subject: &str, reason: &str);
}

/// Logs auth failures; the default when no token service is wired in.
pub struct LogAuthFailures;

#[async_trait]
impl AuthFailureSink for LogAuthFailures {
    async fn auth_failed(&self, provider: &str, subject: &str, reason: &str) {
        warn!(
            provider = provider,
            subject = subject,
            reason = reason,
            "Provider credential needs remediation"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;

    #[async_trait]
    impl ProviderApi for Dummy {
        fn provider(&self) -> &str {
            "dummy"
        }

        async fn fetch_details(
            &self,
            _request: &FetchRequest,
            _access_token: &str,
        ) -> Result<MetricDetails, ProviderError> {
            Ok(MetricDetails::default())
        }
    }

    #[test]
    fn test_registry() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(Dummy));

        assert!(registry.get("dummy").is_some());
        assert!(registry.get("fitbit").is_none());
        assert_eq!(registry.list(), vec!["dummy"]);
    }

    #[tokio::test]
    async fn test_static_credentials() {
        let creds = StaticCredentials::new()
            .with_token("fitbit", "42", "tok-42")
            .with_fallback("fitbit", "shared");

        assert_eq!(creds.access_token("fitbit", "42").await.unwrap(), "tok-42");
        assert_eq!(creds.access_token("fitbit", "7").await.unwrap(), "shared");
        assert!(matches!(
            creds.access_token("google_fit", "42").await,
            Err(ProviderError::Auth(_))
        ));
    }

    #[test]
    fn test_credentials_from_config() {
        let mut config = FitbitConfig::default();
        config.access_tokens.insert("42".into(), "tok".into());
        let creds = StaticCredentials::from_fitbit_config(&config);
        assert!(creds.fallback.is_empty());
        assert_eq!(creds.tokens.len(), 1);
    }

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::Transient("429".into()).is_transient());
        assert!(!ProviderError::Auth("revoked".into()).is_transient());
        assert!(!ProviderError::Rejected {
            status: 400,
            message: "bad date".into()
        }
        .is_transient());
    }
}
