//! Rate-limited HTTP client for the CRM REST API.
//!
//! Every call is an authenticated GET returning a JSON object. Calls are
//! paced to a minimum wall-clock duration so the request rate stays under
//! the upstream quota regardless of network latency, and transient failures
//! are retried under a bounded policy (exponential backoff with jitter,
//! `Retry-After` honored) instead of looping forever.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use crate::config::{CrmConfig, RetryPolicy};
use crate::error::CrmError;

const HEADER_API_VERSION: &str = "NEON-API-VERSION";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// The one seam between the pipeline and the network. Components take
/// `&dyn CrmApi` so tests can substitute a canned-response fake.
#[async_trait]
pub trait CrmApi: Send + Sync {
    /// GET `base_url + path` and return the parsed JSON object.
    async fn get(&self, path: &str) -> Result<Value, CrmError>;
}

/// Extract the expected top-level field from a response body.
///
/// A JSON `null` at the key is passed through (some endpoints return
/// `"attendees": null` for empty collections); a missing key is a malformed
/// response and is not retried — absence is not transient.
pub fn take_key(body: Value, url: &str, key: &str) -> Result<Value, CrmError> {
    match body {
        Value::Object(mut map) => map.remove(key).ok_or_else(|| CrmError::MalformedResponse {
            url: url.to_string(),
            detail: format!("missing expected key {:?}", key),
        }),
        _ => Err(CrmError::MalformedResponse {
            url: url.to_string(),
            detail: "body is not a JSON object".to_string(),
        }),
    }
}

/// Backoff before retry number `attempt` (1-based). A parseable
/// `Retry-After` value wins, capped at 30s; otherwise exponential backoff
/// from the policy's initial delay, with up to 150ms of jitter.
pub fn retry_delay(attempt: u32, policy: &RetryPolicy, retry_after: Option<&str>) -> Duration {
    if let Some(secs) = retry_after.and_then(|v| v.trim().parse::<u64>().ok()) {
        return Duration::from_secs(secs.min(30));
    }

    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let base = policy
        .initial_backoff_ms
        .saturating_mul(exponent)
        .min(policy.max_backoff_ms);
    let jitter = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0))
        % 150;
    Duration::from_millis(base.saturating_add(jitter))
}

/// Authenticated, paced REST client. Credentials are read-only shared
/// state; the client is safe to share across tasks behind an `Arc`.
pub struct CrmClient {
    http: reqwest::Client,
    base_url: String,
    org_id: String,
    api_key: String,
    api_version: String,
    pacing: Duration,
    retry: RetryPolicy,
}

impl CrmClient {
    pub fn new(cfg: &CrmConfig) -> Result<Self, CrmError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            org_id: cfg.org_id.clone(),
            api_key: cfg.api_key.clone(),
            api_version: cfg.api_version.clone(),
            pacing: cfg.pacing(),
            retry: cfg.retry.clone(),
        })
    }

    /// One attempt: send, classify the status, parse the body. Returns the
    /// `Retry-After` header alongside throttling errors so the retry loop
    /// can honor it.
    async fn try_get(&self, url: &str) -> Result<Value, (CrmError, Option<String>)> {
        let response = self
            .http
            .get(url)
            .basic_auth(&self.org_id, Some(&self.api_key))
            .header(HEADER_API_VERSION, &self.api_version)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .send()
            .await
            .map_err(|e| (CrmError::Http(e), None))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err((
                CrmError::Api {
                    status: status.as_u16(),
                    url: url.to_string(),
                    message,
                },
                retry_after,
            ));
        }

        let text = response.text().await.map_err(|e| (CrmError::Http(e), None))?;
        if text.is_empty() {
            return Err((
                CrmError::MalformedResponse {
                    url: url.to_string(),
                    detail: "empty body".to_string(),
                },
                None,
            ));
        }
        let body: Value = serde_json::from_str(&text).map_err(|_| {
            (
                CrmError::MalformedResponse {
                    url: url.to_string(),
                    detail: "body is not JSON".to_string(),
                },
                None,
            )
        })?;
        if !body.is_object() {
            return Err((
                CrmError::MalformedResponse {
                    url: url.to_string(),
                    detail: "body is not a JSON object".to_string(),
                },
                None,
            ));
        }
        Ok(body)
    }
}

#[async_trait]
impl CrmApi for CrmClient {
    async fn get(&self, path: &str) -> Result<Value, CrmError> {
        let url = format!("{}{}", self.base_url, path);
        let attempts = self.retry.max_attempts.max(1);

        for attempt in 1..=attempts {
            let started = Instant::now();
            match self.try_get(&url).await {
                Ok(body) => {
                    // Pace the call: a fast response still occupies the full
                    // pacing interval.
                    let elapsed = started.elapsed();
                    if elapsed < self.pacing {
                        tokio::time::sleep(self.pacing - elapsed).await;
                    }
                    return Ok(body);
                }
                Err((err, retry_after)) if err.is_retryable() => {
                    if attempt == attempts {
                        return Err(CrmError::RetriesExhausted {
                            url,
                            attempts,
                            last_error: err.to_string(),
                        });
                    }
                    let delay = retry_delay(attempt, &self.retry, retry_after.as_deref());
                    log::warn!(
                        "retry {}/{} for {} after {} (sleep {:?})",
                        attempt,
                        attempts,
                        url,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err((err, _)) => return Err(err),
            }
        }

        Err(CrmError::RetriesExhausted {
            url,
            attempts,
            last_error: "request exhausted retries".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Serves one scripted `(status, body)` response per connection, then
    /// stops accepting. Returns the bound address and a request counter.
    async fn scripted_server(responses: Vec<(u16, &'static str)>) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let reason = if status == 200 { "OK" } else { "Internal Server Error" };
                let response = format!(
                    "HTTP/1.1 {} {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    reason,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        (addr, hits)
    }

    fn local_config(addr: SocketAddr, max_attempts: u32, pacing_ms: u64) -> CrmConfig {
        let mut cfg = CrmConfig::new("org", "key");
        cfg.base_url = format!("http://{}", addr);
        cfg.pacing_ms = pacing_ms;
        cfg.retry = RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        };
        cfg
    }

    #[tokio::test]
    async fn test_get_retries_transient_failure_then_succeeds() {
        let (addr, hits) = scripted_server(vec![
            (500, r#"{"error":"upstream hiccup"}"#),
            (200, r#"{"accounts":[]}"#),
        ])
        .await;
        let client = CrmClient::new(&local_config(addr, 3, 0)).unwrap();

        let body = client.get("/accounts").await.unwrap();
        assert_eq!(body, json!({"accounts": []}));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_get_persistent_failure_exhausts_retries() {
        let err_body = r#"{"error":"still down"}"#;
        let (addr, hits) =
            scripted_server(vec![(500, err_body), (500, err_body), (500, err_body)]).await;
        let client = CrmClient::new(&local_config(addr, 3, 0)).unwrap();

        let err = client.get("/accounts").await.unwrap_err();
        match err {
            CrmError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_get_paces_fast_responses() {
        let (addr, _) = scripted_server(vec![(200, r#"{"ok":true}"#)]).await;
        let client = CrmClient::new(&local_config(addr, 1, 120)).unwrap();

        let started = std::time::Instant::now();
        client.get("/ping").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[test]
    fn test_take_key_extracts_field() {
        let body = json!({"accounts": [{"accountId": 1}], "pagination": {}});
        let accounts = take_key(body, "u", "accounts").unwrap();
        assert_eq!(accounts, json!([{"accountId": 1}]));
    }

    #[test]
    fn test_take_key_passes_null_through() {
        let body = json!({"attendees": null});
        assert_eq!(take_key(body, "u", "attendees").unwrap(), Value::Null);
    }

    #[test]
    fn test_take_key_missing_key_is_malformed() {
        let err = take_key(json!({"other": 1}), "u", "accounts").unwrap_err();
        assert!(matches!(err, CrmError::MalformedResponse { .. }));
    }

    #[test]
    fn test_take_key_rejects_non_object() {
        let err = take_key(json!([1, 2, 3]), "u", "accounts").unwrap_err();
        assert!(matches!(err, CrmError::MalformedResponse { .. }));
    }

    #[test]
    fn test_retry_delay_honors_retry_after() {
        let policy = RetryPolicy::default();
        assert_eq!(retry_delay(1, &policy, Some("3")), Duration::from_secs(3));
        // Capped at 30s
        assert_eq!(retry_delay(1, &policy, Some("600")), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_delay_backs_off_exponentially() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
        };
        let d1 = retry_delay(1, &policy, None).as_millis() as u64;
        let d3 = retry_delay(3, &policy, None).as_millis() as u64;
        let d5 = retry_delay(5, &policy, None).as_millis() as u64;
        assert!((100..250).contains(&d1));
        assert!((400..550).contains(&d3));
        // Clamped to max_backoff plus jitter
        assert!((1_000..1_150).contains(&d5));
    }
}
