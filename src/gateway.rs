use moka::future::Cache;
use reqwest::{Client as HttpClient, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::NotificationPayload;

// FCM rejects topic batches above this size
const TOPIC_BATCH_LIMIT: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("token is no longer valid")]
    InvalidToken,
    #[error("transient gateway failure: {0}")]
    Transient(String),
    #[error("permanent gateway failure: {0}")]
    Permanent(String),
}

/// External push-delivery provider.
#[trait_variant::make(PushGateway: Send)]
pub trait LocalPushGateway {
    async fn send(&self, token: &str, message: &NotificationPayload) -> Result<(), GatewayError>;

    /// Adds each token to the topic; one result per input token, same order.
    async fn subscribe_topic(&self, tokens: &[String], topic: &str) -> Vec<Result<(), GatewayError>>;

    async fn unsubscribe_topic(&self, tokens: &[String], topic: &str) -> Vec<Result<(), GatewayError>>;
}

/// Where the OAuth bearer token for FCM comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FcmCredentials {
    Token(String),
    /// Re-read from disk once the cached copy is older than `refresh`.
    /// Whatever mints tokens for the service account keeps the file current.
    File { path: PathBuf, refresh: Duration },
}

enum AccessToken {
    Static(String),
    File {
        path: PathBuf,
        cache: Cache<(), String>,
    },
}

impl AccessToken {
    fn new(credentials: FcmCredentials) -> Self {
        match credentials {
            FcmCredentials::Token(token) => AccessToken::Static(token),
            FcmCredentials::File { path, refresh } => AccessToken::File {
                path,
                cache: Cache::builder()
                    .max_capacity(1)
                    .time_to_live(refresh)
                    .build(),
            },
        }
    }

    async fn current(&self) -> Result<String, GatewayError> {
        match self {
            AccessToken::Static(token) => Ok(token.clone()),
            AccessToken::File { path, cache } => cache
                .try_get_with((), async {
                    let raw = tokio::fs::read_to_string(path).await?;
                    debug!(path = %path.display(), "Loaded FCM access token");
                    Ok::<_, std::io::Error>(raw.trim().to_string())
                })
                .await
                .map_err(|e: Arc<std::io::Error>| {
                    GatewayError::Transient(format!("cannot read access token: {}", e))
                }),
        }
    }

    /// Drops the cached token. Returns false when there is nothing to reload.
    async fn invalidate(&self) -> bool {
        match self {
            AccessToken::Static(_) => false,
            AccessToken::File { cache, .. } => {
                cache.invalidate(&()).await;
                true
            }
        }
    }
}

/// Firebase Cloud Messaging over HTTP v1, topic membership via the IID batch API.
pub struct FcmGateway {
    http_client: HttpClient,
    project_id: String,
    access_token: AccessToken,
    api_url: String,
    iid_url: String,
}

#[derive(Debug, Deserialize)]
struct FcmErrorEnvelope {
    error: FcmError,
}

#[derive(Debug, Deserialize)]
struct FcmError {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    details: Vec<FcmErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct FcmErrorDetail {
    #[serde(rename = "errorCode", default)]
    error_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    results: Vec<BatchResult>,
}

#[derive(Debug, Deserialize)]
struct BatchResult {
    #[serde(default)]
    error: Option<String>,
}

impl FcmGateway {
    pub fn new(
        project_id: String,
        credentials: FcmCredentials,
        api_url: String,
        iid_url: String,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http_client = HttpClient::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            project_id,
            access_token: AccessToken::new(credentials),
            api_url: api_url.trim_end_matches('/').to_string(),
            iid_url: iid_url.trim_end_matches('/').to_string(),
        })
    }

    async fn batch_topic_call(
        &self,
        action: &str,
        tokens: &[String],
        topic: &str,
    ) -> Vec<Result<(), GatewayError>> {
        let mut results = Vec::with_capacity(tokens.len());
        let access_token = match self.access_token.current().await {
            Ok(token) => token,
            Err(e) => return vec![Err(e); tokens.len()],
        };

        for chunk in tokens.chunks(TOPIC_BATCH_LIMIT) {
            let url = format!("{}/iid/v1:{}", self.iid_url, action);
            let body = json!({
                "to": format!("/topics/{}", topic),
                "registration_tokens": chunk,
            });

            let response = self
                .http_client
                .post(&url)
                .bearer_auth(&access_token)
                .header("access_token_auth", "true")
                .json(&body)
                .send()
                .await;

            let chunk_results = match response {
                Ok(resp) if resp.status().is_success() => match resp.json::<BatchResponse>().await {
                    Ok(batch) => classify_batch(chunk.len(), batch),
                    Err(e) => vec![Err(GatewayError::Transient(e.to_string())); chunk.len()],
                },
                Ok(resp) if resp.status() == StatusCode::UNAUTHORIZED => {
                    vec![Err(self.auth_rejected().await); chunk.len()]
                }
                Ok(resp) => {
                    let status = resp.status();
                    let err = if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        GatewayError::Transient(format!("topic {} returned {}", action, status))
                    } else {
                        GatewayError::Permanent(format!("topic {} returned {}", action, status))
                    };
                    vec![Err(err); chunk.len()]
                }
                Err(e) => vec![Err(GatewayError::Transient(e.to_string())); chunk.len()],
            };

            debug!(
                topic = %topic,
                action = %action,
                tokens = chunk.len(),
                failures = chunk_results.iter().filter(|r| r.is_err()).count(),
                "Topic membership batch processed"
            );
            results.extend(chunk_results);
        }

        results
    }

    /// A rejected token read from a file is reloaded and the call may be
    /// retried. A static token will keep failing.
    async fn auth_rejected(&self) -> GatewayError {
        if self.access_token.invalidate().await {
            warn!("FCM rejected the access token; reloading it");
            GatewayError::Transient("access token rejected".to_string())
        } else {
            GatewayError::Permanent("access token rejected".to_string())
        }
    }
}

impl PushGateway for FcmGateway {
    async fn send(&self, token: &str, message: &NotificationPayload) -> Result<(), GatewayError> {
        let url = format!(
            "{}/v1/projects/{}/messages:send",
            self.api_url, self.project_id
        );
        let body = json!({
            "message": {
                "token": token,
                "notification": {
                    "title": message.title,
                    "body": message.body,
                },
                "data": message.data,
            }
        });

        let access_token = self.access_token.current().await?;
        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(self.auth_rejected().await);
        }

        let body = response.text().await.unwrap_or_default();
        let err = classify_send_failure(status, &body);
        warn!(status = %status, error = %err, "FCM rejected message");
        Err(err)
    }

    async fn subscribe_topic(&self, tokens: &[String], topic: &str) -> Vec<Result<(), GatewayError>> {
        self.batch_topic_call("batchAdd", tokens, topic).await
    }

    async fn unsubscribe_topic(&self, tokens: &[String], topic: &str) -> Vec<Result<(), GatewayError>> {
        self.batch_topic_call("batchRemove", tokens, topic).await
    }
}

fn classify_send_failure(status: StatusCode, body: &str) -> GatewayError {
    let parsed = serde_json::from_str::<FcmErrorEnvelope>(body).ok();
    let error_code = parsed
        .as_ref()
        .and_then(|env| env.error.details.iter().find_map(|d| d.error_code.clone()))
        .unwrap_or_default();
    let message = parsed
        .as_ref()
        .map(|env| format!("{} {}", env.error.status, env.error.message))
        .unwrap_or_else(|| status.to_string());

    if status == StatusCode::NOT_FOUND || error_code == "UNREGISTERED" {
        return GatewayError::InvalidToken;
    }
    if status == StatusCode::BAD_REQUEST && message.contains("registration token") {
        return GatewayError::InvalidToken;
    }
    if status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
        || error_code == "UNAVAILABLE"
        || error_code == "INTERNAL"
        || error_code == "QUOTA_EXCEEDED"
    {
        return GatewayError::Transient(message);
    }
    GatewayError::Permanent(message)
}

fn classify_batch(expected: usize, batch: BatchResponse) -> Vec<Result<(), GatewayError>> {
    let mut results: Vec<Result<(), GatewayError>> = batch
        .results
        .into_iter()
        .map(|r| match r.error.as_deref() {
            None => Ok(()),
            Some("NOT_FOUND") | Some("INVALID_ARGUMENT") => Err(GatewayError::InvalidToken),
            Some("INTERNAL") | Some("TOO_MANY_TOPICS") => Err(GatewayError::Transient(
                r.error.clone().unwrap_or_default(),
            )),
            Some(other) => Err(GatewayError::Permanent(other.to_string())),
        })
        .collect();
    // Missing entries count as failures so callers never assume success
    results.resize(
        expected,
        Err(GatewayError::Transient("missing batch result".to_string())),
    );
    results
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// Scriptable gateway that records every call.
    #[derive(Default)]
    pub struct MockGateway {
        scripted: Mutex<HashMap<String, VecDeque<Result<(), GatewayError>>>>,
        sent: Mutex<Vec<(String, NotificationPayload)>>,
        subscribed: Mutex<Vec<(String, String)>>,
        unsubscribed: Mutex<Vec<(String, String)>>,
        fail_topics: Mutex<bool>,
        delay: Mutex<Option<Duration>>,
    }

    impl MockGateway {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queues outcomes for a token; once drained, sends succeed.
        pub fn script(&self, token: &str, outcomes: Vec<Result<(), GatewayError>>) {
            self.scripted
                .lock()
                .unwrap()
                .entry(token.to_string())
                .or_default()
                .extend(outcomes);
        }

        pub fn fail_topic_calls(&self, fail: bool) {
            *self.fail_topics.lock().unwrap() = fail;
        }

        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock().unwrap() = Some(delay);
        }

        pub fn sent(&self) -> Vec<(String, NotificationPayload)> {
            self.sent.lock().unwrap().clone()
        }

        pub fn send_count(&self, token: &str) -> usize {
            self.sent.lock().unwrap().iter().filter(|(t, _)| t == token).count()
        }

        pub fn subscribed(&self) -> Vec<(String, String)> {
            self.subscribed.lock().unwrap().clone()
        }

        pub fn unsubscribed(&self) -> Vec<(String, String)> {
            self.unsubscribed.lock().unwrap().clone()
        }

        fn topic_results(&self, tokens: &[String]) -> Vec<Result<(), GatewayError>> {
            let fail = *self.fail_topics.lock().unwrap();
            tokens
                .iter()
                .map(|_| {
                    if fail {
                        Err(GatewayError::Transient("topic api down".to_string()))
                    } else {
                        Ok(())
                    }
                })
                .collect()
        }
    }

    impl PushGateway for MockGateway {
        async fn send(&self, token: &str, message: &NotificationPayload) -> Result<(), GatewayError> {
            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.sent
                .lock()
                .unwrap()
                .push((token.to_string(), message.clone()));
            self.scripted
                .lock()
                .unwrap()
                .get_mut(token)
                .and_then(|queue| queue.pop_front())
                .unwrap_or(Ok(()))
        }

        async fn subscribe_topic(&self, tokens: &[String], topic: &str) -> Vec<Result<(), GatewayError>> {
            self.subscribed
                .lock()
                .unwrap()
                .extend(tokens.iter().map(|t| (t.clone(), topic.to_string())));
            self.topic_results(tokens)
        }

        async fn unsubscribe_topic(&self, tokens: &[String], topic: &str) -> Vec<Result<(), GatewayError>> {
            self.unsubscribed
                .lock()
                .unwrap()
                .extend(tokens.iter().map(|t| (t.clone(), topic.to_string())));
            self.topic_results(tokens)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_token_is_invalid() {
        let body = r#"{"error":{"code":404,"message":"Requested entity was not found.","status":"NOT_FOUND","details":[{"@type":"type.googleapis.com/google.firebase.fcm.v1.FcmError","errorCode":"UNREGISTERED"}]}}"#;
        assert_eq!(
            classify_send_failure(StatusCode::NOT_FOUND, body),
            GatewayError::InvalidToken
        );
    }

    #[test]
    fn server_errors_and_throttling_are_transient() {
        assert!(matches!(
            classify_send_failure(StatusCode::SERVICE_UNAVAILABLE, ""),
            GatewayError::Transient(_)
        ));
        assert!(matches!(
            classify_send_failure(StatusCode::TOO_MANY_REQUESTS, ""),
            GatewayError::Transient(_)
        ));
    }

    #[test]
    fn auth_failure_is_permanent() {
        let body = r#"{"error":{"code":401,"message":"Request had invalid authentication credentials.","status":"UNAUTHENTICATED"}}"#;
        assert!(matches!(
            classify_send_failure(StatusCode::UNAUTHORIZED, body),
            GatewayError::Permanent(_)
        ));
    }

    #[test]
    fn batch_results_line_up_with_tokens() {
        let batch: BatchResponse =
            serde_json::from_str(r#"{"results":[{},{"error":"NOT_FOUND"}]}"#).unwrap();
        let results = classify_batch(3, batch);
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert_eq!(results[1], Err(GatewayError::InvalidToken));
        assert!(results[2].is_err());
    }

    fn token_file(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("fcm-token-{}", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn file_token_is_cached_until_invalidated() {
        let path = token_file("first-token\n");
        let token = AccessToken::new(FcmCredentials::File {
            path: path.clone(),
            refresh: Duration::from_secs(3600),
        });

        assert_eq!(token.current().await.unwrap(), "first-token");
        std::fs::write(&path, "second-token").unwrap();
        assert_eq!(token.current().await.unwrap(), "first-token");

        assert!(token.invalidate().await);
        assert_eq!(token.current().await.unwrap(), "second-token");
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn file_token_expires_after_refresh_interval() {
        let path = token_file("old");
        let token = AccessToken::new(FcmCredentials::File {
            path: path.clone(),
            refresh: Duration::from_millis(50),
        });

        assert_eq!(token.current().await.unwrap(), "old");
        std::fs::write(&path, "new").unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(token.current().await.unwrap(), "new");
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn missing_token_file_is_transient() {
        let token = AccessToken::new(FcmCredentials::File {
            path: std::env::temp_dir().join(format!("absent-{}", uuid::Uuid::new_v4())),
            refresh: Duration::from_secs(60),
        });
        assert!(matches!(token.current().await, Err(GatewayError::Transient(_))));
    }

    #[tokio::test]
    async fn static_token_cannot_be_reloaded() {
        let token = AccessToken::new(FcmCredentials::Token("fixed".to_string()));
        assert_eq!(token.current().await.unwrap(), "fixed");
        assert!(!token.invalidate().await);
    }

    #[tokio::test]
    async fn rejected_file_token_is_retryable() {
        let path = token_file("stale");
        let gateway = FcmGateway::new(
            "project".to_string(),
            FcmCredentials::File {
                path: path.clone(),
                refresh: Duration::from_secs(3600),
            },
            "http://127.0.0.1:1".to_string(),
            "http://127.0.0.1:1".to_string(),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(gateway.access_token.current().await.unwrap(), "stale");
        std::fs::write(&path, "fresh").unwrap();

        assert!(matches!(gateway.auth_rejected().await, GatewayError::Transient(_)));
        assert_eq!(gateway.access_token.current().await.unwrap(), "fresh");
        std::fs::remove_file(&path).unwrap();
    }
}
