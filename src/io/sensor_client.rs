//! HTTP client used by edge sensors to talk to the aggregator
//!
//! Registration is a single attempt. Reports are retried with capped
//! exponential backoff on transport failures and 5xx replies; a 404 means the
//! server does not know the device and is never retried.

use crate::domain::types::{DeltaEvent, DeviceKey, LotId, RegisterRequest, RegisterResponse, ReportRequest};
use crate::infra::config::Config;
use crate::services::session::DeltaSink;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("registration failed: {0}")]
    Registration(String),
    #[error("transmission failed after {attempts} attempt(s): {reason}")]
    Transmission { attempts: u32, reason: String },
    #[error("device {0} is not registered with the server")]
    UnknownDevice(DeviceKey),
    #[error("server rejected report with status {0}")]
    Rejected(u16),
}

/// Log a failed attempt that will be retried (cold path)
#[cold]
fn log_retry(key: DeviceKey, attempt: u32, delay: Duration, reason: &str) {
    warn!(
        device_key = %key,
        attempt = %attempt,
        retry_in_ms = %delay.as_millis(),
        reason = %reason,
        "report_retry"
    );
}

/// Capped exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.retry_max_attempts(),
            initial_backoff: Duration::from_millis(config.retry_initial_backoff_ms()),
            max_backoff: Duration::from_millis(config.retry_max_backoff_ms()),
            multiplier: config.retry_multiplier(),
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let delay = self.initial_backoff.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_backoff.as_secs_f64()))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// One report attempt outcome
enum Attempt {
    Retryable(String),
    Fatal(ClientError),
}

pub struct SensorClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl SensorClient {
    pub fn new(config: &Config) -> Result<Self, ClientError> {
        // Create HTTP client once for reuse (connection pooling)
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms()))
            .http1_only()
            .build()
            .map_err(|e| ClientError::Registration(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.server_url().to_string(),
            retry: RetryPolicy::from_config(config),
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Request a new device identity, optionally bound to a lot
    pub async fn register(&self, lot: Option<&LotId>) -> Result<DeviceKey, ClientError> {
        let body = RegisterRequest { lot: lot.cloned() };
        let response = self
            .http
            .post(self.url("/register"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Registration(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Registration(format!("server answered {status}")));
        }

        let reply: RegisterResponse =
            response.json().await.map_err(|e| ClientError::Registration(e.to_string()))?;

        info!(
            device_key = %reply.key,
            lot_id = ?lot.map(LotId::as_str),
            server = %self.base_url,
            "sensor_registered"
        );
        Ok(reply.key)
    }

    async fn report_once(&self, body: &ReportRequest) -> Result<(), Attempt> {
        let response = self
            .http
            .post(self.url("/report"))
            .json(body)
            .send()
            .await
            .map_err(|e| Attempt::Retryable(e.to_string()))?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(Attempt::Fatal(ClientError::UnknownDevice(body.key))),
            s if s.is_server_error() => Err(Attempt::Retryable(format!("server answered {s}"))),
            s => Err(Attempt::Fatal(ClientError::Rejected(s.as_u16()))),
        }
    }

    /// Send one delta event, retrying transport failures with backoff
    pub async fn report_delta(
        &self,
        key: DeviceKey,
        enter: u32,
        exit: u32,
    ) -> Result<(), ClientError> {
        let body = ReportRequest::from(DeltaEvent::new(key, enter, exit));
        let start = Instant::now();
        let mut attempt = 1;

        loop {
            match self.report_once(&body).await {
                Ok(()) => {
                    info!(
                        device_key = %key,
                        enter = %enter,
                        exit = %exit,
                        attempts = %attempt,
                        latency_us = %start.elapsed().as_micros(),
                        "delta_reported"
                    );
                    return Ok(());
                }
                Err(Attempt::Fatal(e)) => return Err(e),
                Err(Attempt::Retryable(reason)) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(ClientError::Transmission { attempts: attempt, reason });
                    }
                    let delay = self.retry.delay_for(attempt);
                    log_retry(key, attempt, delay, &reason);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl DeltaSink for SensorClient {
    async fn send(&self, event: DeltaEvent) -> Result<(), ClientError> {
        self.report_delta(event.device_key, event.delta.enter, event.delta.exit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_grows_then_caps() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
        assert_eq!(p.delay_for(4), Duration::from_millis(500));
        assert_eq!(p.delay_for(10), Duration::from_millis(500));
    }

    #[test]
    fn test_retry_policy_from_config() {
        let config = Config::default().with_retry(3, 50);
        let p = RetryPolicy::from_config(&config);
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.initial_backoff, Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_unreachable_server_exhausts_retries() {
        // Port 9 on loopback is closed in test environments
        let config = Config::default().with_server_url("http://127.0.0.1:9").with_retry(2, 1);
        let client = SensorClient::new(&config).unwrap();

        match client.report_delta(DeviceKey(1), 1, 0).await {
            Err(ClientError::Transmission { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected transmission error, got {other:?}"),
        }
        assert!(matches!(client.register(None).await, Err(ClientError::Registration(_))));
    }
}
