//! HTTP clients for the upstream authority: one against the SDK base URL
//! (split/segment fetches) and one against the events base URL (bulk
//! submissions), plus the bounded-retry helper shared by the recorders.

use std::future::Future;
use std::time::Duration;

use flagrelay_lib::{Metadata, SegmentChanges, SplitChanges};
use serde::Serialize;

use super::config::UpstreamConfig;
use super::error::UpstreamError;

const SDK_VERSION_HEADER: &str = "SplitSDKVersion";
const MACHINE_IP_HEADER: &str = "SplitSDKMachineIP";
const MACHINE_NAME_HEADER: &str = "SplitSDKMachineName";
const IMPRESSIONS_MODE_HEADER: &str = "SplitSDKImpressionsMode";

/// Identity the relay reports for data it originates (counts, telemetry).
pub fn relay_metadata() -> Metadata {
    Metadata {
        sdk_version: format!("flagrelay-{}", env!("CARGO_PKG_VERSION")),
        machine_ip: "unknown".to_string(),
        machine_name: "unknown".to_string(),
    }
}

/// Retry `op` up to `attempts` times with exponential backoff, retrying only
/// transient failures. The final error is surfaced to the caller.
pub async fn with_retries<T, F, Fut>(
    attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T, UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let mut delay = base_delay;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < attempts => {
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Client for the split/segment fetch surface.
pub struct SdkClient {
    http: reqwest::Client,
    base_url: String,
    apikey: String,
}

impl SdkClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;
        Ok(SdkClient {
            http,
            base_url: config.sdk_url.clone(),
            apikey: config.apikey.clone(),
        })
    }

    pub async fn fetch_split_changes(&self, since: i64) -> Result<SplitChanges, UpstreamError> {
        let response = self
            .http
            .get(format!("{}/splitChanges", self.base_url))
            .query(&[("since", since)])
            .bearer_auth(&self.apikey)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(UpstreamError::Status(response.status()));
        }
        Ok(response.json().await?)
    }

    pub async fn fetch_segment_changes(
        &self,
        name: &str,
        since: i64,
    ) -> Result<SegmentChanges, UpstreamError> {
        let response = self
            .http
            .get(format!("{}/segmentChanges/{}", self.base_url, name))
            .query(&[("since", since)])
            .bearer_auth(&self.apikey)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(UpstreamError::Status(response.status()));
        }
        Ok(response.json().await?)
    }
}

/// Client for the events surface: impressions, counts, events, telemetry.
pub struct EventsClient {
    http: reqwest::Client,
    base_url: String,
    apikey: String,
}

impl EventsClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;
        Ok(EventsClient {
            http,
            base_url: config.events_url.clone(),
            apikey: config.apikey.clone(),
        })
    }

    /// POST a JSON body with the caller's identity carried as headers.
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        metadata: &Metadata,
        impressions_mode: Option<&str>,
        body: &B,
    ) -> Result<(), UpstreamError> {
        let mut request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.apikey)
            .header(SDK_VERSION_HEADER, &metadata.sdk_version)
            .header(MACHINE_IP_HEADER, &metadata.machine_ip)
            .header(MACHINE_NAME_HEADER, metadata.machine_name_or_ip())
            .json(body);
        if let Some(mode) = impressions_mode {
            request = request.header(IMPRESSIONS_MODE_HEADER, mode);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(UpstreamError::Status(response.status()));
        }
        Ok(())
    }

    /// Relay a pre-encoded JSON payload (SDK metrics passthrough).
    pub async fn post_raw(
        &self,
        path: &str,
        metadata: &Metadata,
        body: Vec<u8>,
    ) -> Result<(), UpstreamError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.apikey)
            .header(SDK_VERSION_HEADER, &metadata.sdk_version)
            .header(MACHINE_IP_HEADER, &metadata.machine_ip)
            .header(MACHINE_NAME_HEADER, metadata.machine_name_or_ip())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(UpstreamError::Status(response.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn with_retries_stops_after_success() {
        let calls = AtomicU32::new(0);
        let result = with_retries(3, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(UpstreamError::Status(
                        reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                    ))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn with_retries_surfaces_final_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(UpstreamError::Status(reqwest::StatusCode::BAD_GATEWAY)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn with_retries_does_not_retry_client_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(UpstreamError::Status(reqwest::StatusCode::BAD_REQUEST)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
