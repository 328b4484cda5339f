//! Delivery of enveloped events to the downstream ingestion service, with
//! bounded retries and a chained backup forward.

use crate::event::IngestEnvelope;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("downstream returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("delivery failed after {attempts} attempts: {last}")]
    AttemptsExhausted {
        attempts: u32,
        #[source]
        last: Box<DeliveryError>,
    },

    #[error("invalid downstream url: {0}")]
    Url(#[from] url::ParseError),
}

/// HTTP client for the downstream ingestion service.
///
/// Every send is retried up to `attempts` times with exponential backoff:
/// after failed attempt `k` the next one waits `2^(k-1) * base_retry`. The
/// per-request timeout is enforced by the underlying client and is
/// independent of the backoff schedule.
#[derive(Clone)]
pub struct EventForwarder {
    client: reqwest::Client,
    base_url: Url,
    auth_token: Option<String>,
    attempts: u32,
    base_retry: Duration,
}

impl EventForwarder {
    pub fn new(
        base_url: Url,
        auth_token: Option<String>,
        timeout: Duration,
        attempts: u32,
        base_retry: Duration,
    ) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(EventForwarder {
            client,
            base_url,
            auth_token,
            attempts: attempts.max(1),
            base_retry,
        })
    }

    /// Primary forward of the envelope to the downstream `/ingest` endpoint.
    pub async fn forward(&self, envelope: &IngestEnvelope) -> Result<(), DeliveryError> {
        let url = self.base_url.join("ingest")?;
        let body = serde_json::to_value(envelope)
            .map_err(|_| DeliveryError::Status {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: "unserializable envelope".to_string(),
            })?;
        self.post_with_retries(url, &body).await
    }

    /// Writes a copy of the raw event into the workspace backup table. Runs
    /// strictly after the primary forward settles.
    pub async fn forward_backup(
        &self,
        workspace_id: &str,
        event: &Value,
    ) -> Result<(), DeliveryError> {
        let mut url = self
            .base_url
            .join(&format!("post/{workspace_id}_backup"))?;
        url.query_pairs_mut().append_pair("tableName", "backup");
        self.post_with_retries(url, event).await
    }

    async fn post_with_retries(&self, url: Url, body: &Value) -> Result<(), DeliveryError> {
        let mut last: Option<DeliveryError> = None;
        for attempt in 1..=self.attempts {
            if attempt > 1 {
                tokio::time::sleep(backoff_delay(self.base_retry, attempt)).await;
            }
            match self.post_once(url.clone(), body).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        url = %url,
                        attempt,
                        attempts = self.attempts,
                        error = %err,
                        "event delivery attempt failed"
                    );
                    last = Some(err);
                }
            }
        }
        Err(DeliveryError::AttemptsExhausted {
            attempts: self.attempts,
            last: Box::new(last.unwrap_or(DeliveryError::Status {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: "no attempts made".to_string(),
            })),
        })
    }

    async fn post_once(&self, url: Url, body: &Value) -> Result<(), DeliveryError> {
        let mut request = self.client.post(url).json(body);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::Status { status, body })
    }
}

/// Delay before attempt `k` (k >= 2): `2^(k-2) * base`, saturating so an
/// oversized attempt budget cannot overflow.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt - 2).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventOrigin, IngestEnvelope};
    use chrono::Utc;
    use fast_store::model::KeyClass;
    use serde_json::json;
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn forwarder(base: &str, attempts: u32) -> EventForwarder {
        EventForwarder::new(
            Url::parse(base).unwrap(),
            Some("token-1".to_string()),
            Duration::from_secs(5),
            attempts,
            Duration::from_millis(1),
        )
        .unwrap()
    }

    fn envelope() -> IngestEnvelope {
        IngestEnvelope {
            message_id: "m1".to_string(),
            event_type: "track".to_string(),
            ingest_type: KeyClass::Browser,
            message_created: Utc::now(),
            write_key: None,
            origin: EventOrigin {
                base_url: "https://data.acme.com".to_string(),
                slug: Some("acme".to_string()),
                domain: Some("data.acme.com".to_string()),
            },
            http_headers: BTreeMap::new(),
            http_payload: json!({"type": "track"}),
        }
    }

    #[tokio::test]
    async fn test_forward_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .and(header("authorization", "Bearer token-1"))
            .and(body_partial_json(json!({"messageId": "m1"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        forwarder(&server.uri(), 3).forward(&envelope()).await.unwrap();
    }

    #[tokio::test]
    async fn test_exactly_n_attempts_then_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let err = forwarder(&server.uri(), 3)
            .forward(&envelope())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::AttemptsExhausted { attempts: 3, .. }
        ));
    }

    #[test]
    fn test_backoff_schedule_doubles_per_attempt() {
        let base = Duration::from_millis(50);
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(50));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 4), Duration::from_millis(200));
    }

    #[test]
    fn test_backoff_saturates_for_oversized_attempt_budgets() {
        let base = Duration::from_millis(50);
        let huge = backoff_delay(base, 64);
        assert!(huge >= backoff_delay(base, 33));
    }

    #[tokio::test]
    async fn test_retry_delays_follow_the_backoff_schedule() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let forwarder = EventForwarder::new(
            Url::parse(&server.uri()).unwrap(),
            None,
            Duration::from_secs(5),
            3,
            Duration::from_millis(50),
        )
        .unwrap();

        let started = std::time::Instant::now();
        forwarder.forward(&envelope()).await.unwrap_err();
        let elapsed = started.elapsed();

        // Waits 50ms before attempt 2 and 100ms before attempt 3.
        assert!(elapsed >= Duration::from_millis(150), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(450), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn test_success_on_retry_stops_retrying() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        forwarder(&server.uri(), 3).forward(&envelope()).await.unwrap();
    }

    #[tokio::test]
    async fn test_backup_targets_workspace_table() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/post/ws1_backup"))
            .and(query_param("tableName", "backup"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        forwarder(&server.uri(), 1)
            .forward_backup("ws1", &json!({"event": "signup"}))
            .await
            .unwrap();
    }
}
