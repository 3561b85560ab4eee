//! Fitbit Web API client.
//!
//! Calls are made on behalf of the token owner (`/user/-/`). What gets
//! fetched depends on the notification's collection:
//!
//! | collection | series |
//! |------------|--------|
//! | activities | `steps`, `calories`, `hrv_daily_rmssd` |
//! | sleep      | `sleep_minutes` |
//! | body       | `weight` |
//!
//! Any other collection yields an empty result with a note.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use super::{FetchRequest, ProviderApi, ProviderError};
use crate::config::FitbitConfig;
use crate::event::Provider;
use crate::record::{MetricDetails, MetricPoint};

const DEFAULT_API_BASE: &str = "https://api.fitbit.com";

/// Default timeout for API requests
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct FitbitClient {
    api_base: String,
    client: Client,
    timeout: Duration,
}

impl FitbitClient {
    pub fn new() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            client: Client::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn from_config(config: &FitbitConfig) -> Self {
        Self::new()
            .with_api_base(&config.api_base)
            .with_timeout(Duration::from_millis(config.timeout_ms))
    }

    /// Point the client at another host (tests, proxies).
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// GET a JSON document. `Ok(None)` when the API answers 404 and
    /// `allow_missing` is set.
    async fn get_json(
        &self,
        path: &str,
        access_token: &str,
        allow_missing: bool,
    ) -> Result<Option<Value>, ProviderError> {
        let url = format!("{}{}", self.api_base, path);
        debug!(url = %url, "Fitbit API request");

        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("GET {}: {}", path, e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND && allow_missing {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        response.json().await.map(Some).map_err(|e| ProviderError::Rejected {
            status: status.as_u16(),
            message: format!("invalid JSON from {}: {}", path, e),
        })
    }

    async fn fetch_activities(
        &self,
        date: &str,
        token: &str,
        details: &mut MetricDetails,
    ) -> Result<(), ProviderError> {
        let steps_path = format!("/1/user/-/activities/steps/date/{}/{}.json", date, date);
        if let Some(body) = self.get_json(&steps_path, token, false).await? {
            details.insert("steps", time_series(&body, "activities-steps"));
        }

        let calories_path = format!("/1/user/-/activities/calories/date/{}/{}.json", date, date);
        if let Some(body) = self.get_json(&calories_path, token, false).await? {
            details.insert("calories", time_series(&body, "activities-calories"));
        }

        // HRV is not available for every device; 404 means no data.
        let hrv_path = format!("/1/user/-/hrv/date/{}.json", date);
        match self.get_json(&hrv_path, token, true).await? {
            Some(body) => details.insert("hrv_daily_rmssd", hrv_points(&body)),
            None => details.note(format!("no HRV data for {}", date)),
        }
        Ok(())
    }
}

impl Default for FitbitClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderApi for FitbitClient {
    fn provider(&self) -> &str {
        Provider::Fitbit.as_str()
    }

    async fn fetch_details(
        &self,
        request: &FetchRequest,
        access_token: &str,
    ) -> Result<MetricDetails, ProviderError> {
        let collection = request.collection.to_ascii_lowercase();
        let date = request.date.as_str();
        let mut details = MetricDetails::default();

        match collection.as_str() {
            "userrevokedaccess" => {
                return Err(ProviderError::Auth(format!(
                    "subject {} revoked access",
                    request.subject
                )))
            }
            "activities" => self.fetch_activities(date, access_token, &mut details).await?,
            "sleep" => {
                let path = format!("/1.2/user/-/sleep/date/{}.json", date);
                if let Some(body) = self.get_json(&path, access_token, false).await? {
                    details.insert("sleep_minutes", sleep_points(&body));
                }
            }
            "body" => {
                let path = format!("/1/user/-/body/log/weight/date/{}/{}.json", date, date);
                if let Some(body) = self.get_json(&path, access_token, false).await? {
                    details.insert("weight", weight_points(&body));
                }
            }
            other => {
                warn!(collection = other, "No fetch strategy for Fitbit collection");
                details.note(format!("No fetch strategy for collectionType={}", other));
            }
        }

        Ok(details)
    }
}

/// Map a non-success response to the error taxonomy.
fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let error_type = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/errors/0/errorType")
                .and_then(Value::as_str)
                .map(String::from)
        })
        .unwrap_or_default();

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Auth(if error_type.is_empty() {
            status.to_string()
        } else {
            error_type
        }),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            ProviderError::Transient(format!("Fitbit returned {}", status))
        }
        s if s.is_server_error() => ProviderError::Transient(format!("Fitbit returned {}", status)),
        s => ProviderError::Rejected {
            status: s.as_u16(),
            message: if error_type.is_empty() {
                body.chars().take(200).collect()
            } else {
                error_type
            },
        },
    }
}

/// Fitbit sends numbers as strings in time series.
fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `{"<key>": [{"dateTime": "...", "value": "123"}]}`
fn time_series(body: &Value, key: &str) -> Vec<MetricPoint> {
    body.get(key)
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| {
                    let timestamp = e.get("dateTime")?.as_str()?;
                    Some(MetricPoint::new(timestamp, number(e.get("value")?)?))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn hrv_points(body: &Value) -> Vec<MetricPoint> {
    body.get("hrv")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| {
                    let timestamp = e.get("dateTime")?.as_str()?;
                    let value = e.get("value")?;
                    let daily = number(value.get("dailyRmssd")?)?;
                    let mut point = MetricPoint::new(timestamp, daily);
                    if let Some(deep) = value.get("deepRmssd").and_then(number) {
                        point = point.with_extra(json!({ "deepRmssd": deep }));
                    }
                    Some(point)
                })
                .collect()
        })
        .unwrap_or_default()
}

fn sleep_points(body: &Value) -> Vec<MetricPoint> {
    body.get("sleep")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| {
                    let timestamp = e
                        .get("startTime")
                        .or_else(|| e.get("dateOfSleep"))?
                        .as_str()?;
                    let minutes = number(e.get("minutesAsleep")?)?;
                    Some(MetricPoint::new(timestamp, minutes).with_extra(json!({
                        "dateOfSleep": e.get("dateOfSleep"),
                        "durationMs": e.get("duration"),
                        "efficiency": e.get("efficiency"),
                        "isMainSleep": e.get("isMainSleep"),
                    })))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn weight_points(body: &Value) -> Vec<MetricPoint> {
    body.get("weight")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| {
                    let date = e.get("date")?.as_str()?;
                    let timestamp = match e.get("time").and_then(Value::as_str) {
                        Some(time) => format!("{}T{}", date, time),
                        None => date.to_string(),
                    };
                    let weight = number(e.get("weight")?)?;
                    Some(MetricPoint::new(timestamp, weight).with_extra(json!({
                        "bmi": e.get("bmi"),
                        "source": e.get("source"),
                    })))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::get;
    use axum::{Json, Router};

    /// Serve a fake Fitbit API on a random local port.
    async fn fake_api(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn request(collection: &str) -> FetchRequest {
        FetchRequest {
            subject: "42".into(),
            collection: collection.into(),
            date: "2026-02-01".into(),
        }
    }

    #[test]
    fn test_time_series_parses_string_values() {
        let body = json!({"activities-steps": [
            {"dateTime": "2026-02-01", "value": "8042"},
            {"dateTime": "2026-02-02", "value": "n/a"}
        ]});
        let points = time_series(&body, "activities-steps");
        assert_eq!(points, vec![MetricPoint::new("2026-02-01", 8042.0)]);
    }

    #[test]
    fn test_sleep_and_weight_normalization() {
        let sleep = json!({"sleep": [{
            "dateOfSleep": "2026-02-01",
            "startTime": "2026-01-31T23:10:00.000",
            "minutesAsleep": 431,
            "duration": 28_000_000,
            "efficiency": 93,
            "isMainSleep": true
        }]});
        let points = sleep_points(&sleep);
        assert_eq!(points[0].value, 431.0);
        assert_eq!(points[0].extra["efficiency"], 93);

        let weight = json!({"weight": [{"date": "2026-02-01", "time": "07:02:11", "weight": 72.4, "bmi": 22.1}]});
        let points = weight_points(&weight);
        assert_eq!(points[0].timestamp, "2026-02-01T07:02:11");
        assert_eq!(points[0].value, 72.4);
    }

    #[test]
    fn test_status_classification() {
        let expired = r#"{"errors":[{"errorType":"expired_token","message":"Access token expired"}]}"#;
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, expired),
            ProviderError::Auth("expired_token".into())
        );
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "bad date"),
            ProviderError::Rejected { status: 400, .. }
        ));
    }

    #[tokio::test]
    async fn test_activities_against_fake_api() {
        let router = Router::new()
            .route(
                "/1/user/-/activities/steps/date/:start/:end",
                get(|| async { Json(json!({"activities-steps": [{"dateTime": "2026-02-01", "value": "8042"}]})) }),
            )
            .route(
                "/1/user/-/activities/calories/date/:start/:end",
                get(|| async { Json(json!({"activities-calories": [{"dateTime": "2026-02-01", "value": "2210"}]})) }),
            )
            .route("/1/user/-/hrv/date/:date", get(|| async { AxumStatus::NOT_FOUND }));
        let base = fake_api(router).await;

        let client = FitbitClient::new().with_api_base(&base);
        let details = client.fetch_details(&request("activities"), "tok").await.unwrap();

        assert_eq!(details.series["steps"][0].value, 8042.0);
        assert_eq!(details.series["calories"][0].value, 2210.0);
        assert!(!details.series.contains_key("hrv_daily_rmssd"));
        assert_eq!(details.notes.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_token_is_auth_error() {
        let router = Router::new().route(
            "/1.2/user/-/sleep/date/:date",
            get(|Path(_date): Path<String>| async {
                (
                    AxumStatus::UNAUTHORIZED,
                    Json(json!({"errors": [{"errorType": "expired_token"}]})),
                )
            }),
        );
        let base = fake_api(router).await;

        let client = FitbitClient::new().with_api_base(&base);
        let err = client.fetch_details(&request("sleep"), "tok").await.unwrap_err();
        assert_eq!(err, ProviderError::Auth("expired_token".into()));
    }

    #[tokio::test]
    async fn test_unreachable_api_is_transient() {
        let client = FitbitClient::new()
            .with_api_base("http://127.0.0.1:9")
            .with_timeout(Duration::from_millis(200));
        let err = client.fetch_details(&request("body"), "tok").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_revoked_access_and_unknown_collection() {
        let client = FitbitClient::new().with_api_base("http://127.0.0.1:9");

        let err = client
            .fetch_details(&request("userRevokedAccess"), "tok")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));

        let details = client.fetch_details(&request("foods"), "tok").await.unwrap();
        assert!(details.series.is_empty());
        assert_eq!(details.notes, vec!["No fetch strategy for collectionType=foods"]);
    }
}
