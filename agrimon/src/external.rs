use crate::errors::{Error, Result};
use crate::metrics::COLLABORATOR_FAILURES_TOTAL;
use crate::model::DeviceInfo;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Resolves sensor ids to calibration and ownership.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// `Ok(None)` when the registry does not know the sensor.
    async fn resolve(&self, sensor_id: &str) -> Result<Option<DeviceInfo>>;
}

#[async_trait]
pub trait WeatherProvider: Send + Sync {
    async fn current(&self, location: &str) -> Result<Value>;
}

/// Crop health assessments produced by the image-analysis service.
#[async_trait]
pub trait CropHealthService: Send + Sync {
    async fn health(&self, query: &CropHealthQuery) -> Result<Value>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CropHealthQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crop_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_from: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_to: Option<DateTime<Utc>>,
}

/// Timeout and retry policy for collaborator calls.
#[derive(Debug, Clone, Copy)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub backoff: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(3000),
            backoff: Duration::from_millis(200),
        }
    }
}

const MAX_ATTEMPTS: u32 = 2;

/// Runs a read-only collaborator call with a bounded timeout, retrying once
/// after a short backoff. Any remaining failure becomes `ServiceUnavailable`.
pub async fn call_with_retry<T, F, Fut>(service: &str, policy: CallPolicy, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let failure = match tokio::time::timeout(policy.timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", policy.timeout),
        };

        COLLABORATOR_FAILURES_TOTAL
            .with_label_values(&[service])
            .inc();

        if attempt >= MAX_ATTEMPTS {
            warn!(service, attempt, "Collaborator call failed: {}", failure);
            return Err(Error::ServiceUnavailable(format!(
                "{} unavailable: {}",
                service, failure
            )));
        }

        debug!(
            service,
            "Collaborator call failed (attempt {}/{}): {}. Retrying in {:?}",
            attempt,
            MAX_ATTEMPTS,
            failure,
            policy.backoff
        );
        tokio::time::sleep(policy.backoff).await;
    }
}

fn http_client() -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(2))
        .build()
        .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))
}

async fn get_json(request: reqwest::RequestBuilder) -> Result<Value> {
    let response = request
        .send()
        .await
        .map_err(|e| Error::ServiceUnavailable(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::ServiceUnavailable(format!("upstream returned {}", status)));
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| Error::ServiceUnavailable(format!("invalid upstream body: {}", e)))
}

/// Weather provider reached over HTTP (`GET {base}/weather/current?location=`).
pub struct HttpWeatherProvider {
    client: Client,
    base_url: String,
    policy: CallPolicy,
}

impl HttpWeatherProvider {
    pub fn new(base_url: impl Into<String>, policy: CallPolicy) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            policy,
        })
    }
}

#[async_trait]
impl WeatherProvider for HttpWeatherProvider {
    async fn current(&self, location: &str) -> Result<Value> {
        let url = format!("{}/weather/current", self.base_url);
        call_with_retry("weather", self.policy, || {
            get_json(self.client.get(&url).query(&[("location", location)]))
        })
        .await
    }
}

/// Crop health service reached over HTTP (`GET {base}/crops/health`).
pub struct HttpCropHealthService {
    client: Client,
    base_url: String,
    policy: CallPolicy,
}

impl HttpCropHealthService {
    pub fn new(base_url: impl Into<String>, policy: CallPolicy) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            policy,
        })
    }
}

#[async_trait]
impl CropHealthService for HttpCropHealthService {
    async fn health(&self, query: &CropHealthQuery) -> Result<Value> {
        let url = format!("{}/crops/health", self.base_url);
        call_with_retry("crop_health", self.policy, || {
            get_json(self.client.get(&url).query(query))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> CallPolicy {
        CallPolicy {
            timeout: Duration::from_millis(50),
            backoff: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_retries_once_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = call_with_retry("test", fast(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(Error::ServiceUnavailable("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_surfaces_service_unavailable() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = call_with_retry("slow", fast(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        })
        .await;

        assert!(matches!(result, Err(Error::ServiceUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_query_serializes_only_present_fields() {
        let q = CropHealthQuery {
            crop_type: Some("wheat".into()),
            date_from: None,
            date_to: None,
        };
        assert_eq!(serde_json::to_value(&q).unwrap(), serde_json::json!({"crop_type": "wheat"}));
    }
}
