//! Upstream SMS provider client.
//!
//! [`SmsProvider`] is the seam between the pipeline and the transport. The
//! HTTP implementation maps responses onto [`PipelineError`] so the send
//! worker's retry policy can tell transient failures (timeouts, 5xx, 429)
//! from permanent rejections (other 4xx).

use std::time::Duration;

use reqwest::{header::HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::{
    error::{PipelineError, Result},
    queue::BoxFuture,
};

/// One message to hand to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    /// Destination phone number.
    pub phone: String,
    /// Message body.
    pub body: String,
    /// Our reference for the message (recipient message id).
    pub reference: String,
}

/// Provider acknowledgement of a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// Provider-assigned message id.
    pub provider_message_id: String,
}

/// Raw delivery status reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderStatus {
    /// Provider-assigned message id.
    pub provider_message_id: String,
    /// Provider status code, e.g. `DELIVRD`.
    pub code: String,
}

/// SMS transport.
pub trait SmsProvider: Send + Sync + 'static {
    /// Submits one message.
    fn send(&self, request: SendRequest) -> BoxFuture<'_, Result<SendReceipt>>;

    /// Looks up the current status of previously accepted messages.
    fn poll_status(&self, provider_message_ids: Vec<String>) -> BoxFuture<'_, Result<Vec<ProviderStatus>>>;
}

/// Configuration for the HTTP provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL, e.g. `https://sms.example.com/v1`.
    pub base_url: String,
    /// Bearer API key.
    pub api_key: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9090".to_string(),
            api_key: String::new(),
            timeout: Duration::from_secs(10),
            user_agent: "Herald-Campaigns/1.0".to_string(),
        }
    }
}

#[derive(Serialize)]
struct SendBody<'a> {
    to: &'a str,
    body: &'a str,
    reference: &'a str,
}

#[derive(Deserialize)]
struct SendResponse {
    id: String,
}

#[derive(Deserialize)]
struct RejectionBody {
    code: Option<String>,
}

#[derive(Deserialize)]
struct StatusEntry {
    id: String,
    status: String,
}

/// reqwest-backed provider.
#[derive(Debug, Clone)]
pub struct HttpSmsProvider {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl HttpSmsProvider {
    /// Builds the provider client.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| PipelineError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn transport_error(&self, err: &reqwest::Error) -> PipelineError {
        if err.is_timeout() {
            return PipelineError::timeout(self.config.timeout.as_secs());
        }
        if err.is_connect() {
            return PipelineError::network(format!("connection failed: {err}"));
        }
        PipelineError::network(err.to_string())
    }

    async fn send_message(&self, request: SendRequest) -> Result<SendReceipt> {
        let span = info_span!("sms_send", reference = %request.reference);

        async move {
            let response = self
                .client
                .post(self.url("/messages"))
                .bearer_auth(&self.config.api_key)
                .json(&SendBody {
                    to: &request.phone,
                    body: &request.body,
                    reference: &request.reference,
                })
                .send()
                .await
                .map_err(|e| {
                    tracing::warn!(error = %e, "provider request failed");
                    self.transport_error(&e)
                })?;

            let status = response.status();
            if status.is_success() {
                let body: SendResponse = response
                    .json()
                    .await
                    .map_err(|e| PipelineError::network(format!("malformed provider response: {e}")))?;
                tracing::debug!(provider_message_id = %body.id, "provider accepted message");
                return Ok(SendReceipt { provider_message_id: body.id });
            }

            let retry_after = extract_retry_after_seconds(response.headers());
            let text = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "provider returned error status");

            Err(classify_status(status, retry_after, &text))
        }
        .instrument(span)
        .await
    }

    async fn fetch_statuses(&self, ids: Vec<String>) -> Result<Vec<ProviderStatus>> {
        let span = info_span!("sms_poll_status", batch = ids.len());

        async move {
            let response = self
                .client
                .get(self.url("/messages/status"))
                .bearer_auth(&self.config.api_key)
                .query(&[("ids", ids.join(","))])
                .send()
                .await
                .map_err(|e| self.transport_error(&e))?;

            let status = response.status();
            if !status.is_success() {
                let retry_after = extract_retry_after_seconds(response.headers());
                let text = response.text().await.unwrap_or_default();
                return Err(classify_status(status, retry_after, &text));
            }

            let entries: Vec<StatusEntry> = response
                .json()
                .await
                .map_err(|e| PipelineError::network(format!("malformed status response: {e}")))?;

            Ok(entries
                .into_iter()
                .map(|entry| ProviderStatus { provider_message_id: entry.id, code: entry.status })
                .collect())
        }
        .instrument(span)
        .await
    }
}

impl SmsProvider for HttpSmsProvider {
    fn send(&self, request: SendRequest) -> BoxFuture<'_, Result<SendReceipt>> {
        Box::pin(self.send_message(request))
    }

    fn poll_status(&self, provider_message_ids: Vec<String>) -> BoxFuture<'_, Result<Vec<ProviderStatus>>> {
        Box::pin(self.fetch_statuses(provider_message_ids))
    }
}

/// Maps a non-2xx response to an error.
fn classify_status(status: StatusCode, retry_after: Option<u64>, body: &str) -> PipelineError {
    const DEFAULT_RETRY_AFTER: u64 = 60;

    if status == StatusCode::TOO_MANY_REQUESTS {
        return PipelineError::rate_limited(retry_after.unwrap_or(DEFAULT_RETRY_AFTER));
    }
    if status.is_server_error() {
        return PipelineError::server_error(status.as_u16(), body);
    }

    let code = serde_json::from_str::<RejectionBody>(body)
        .ok()
        .and_then(|rejection| rejection.code)
        .unwrap_or_else(|| format!("HTTP_{}", status.as_u16()));
    PipelineError::rejected(code, false)
}

/// Extracts a Retry-After delay in seconds, accepting either delta-seconds
/// or an HTTP date.
pub fn extract_retry_after_seconds(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(seconds);
    }

    let date_time = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date_time.with_timezone(&chrono::Utc) - chrono::Utc::now();
    delta.to_std().ok().map(|d| d.as_secs())
}

pub mod mock {
    //! Scripted provider for deterministic tests.

    use std::{
        collections::{HashMap, VecDeque},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use tokio::sync::RwLock;

    use super::{ProviderStatus, SendReceipt, SendRequest, SmsProvider};
    use crate::{
        error::{PipelineError, Result},
        queue::BoxFuture,
    };

    /// What the provider does with the next send to a phone.
    #[derive(Debug, Clone)]
    pub enum ScriptedSend {
        /// Accept and assign a fresh provider id.
        Accept,
        /// Fail with the given error.
        Fail(PipelineError),
    }

    /// A message the provider accepted.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SentMessage {
        /// Destination phone number.
        pub phone: String,
        /// Message body.
        pub body: String,
        /// Caller reference.
        pub reference: String,
        /// Assigned provider id.
        pub provider_message_id: String,
    }

    /// Provider double. Accepts every send unless a phone has scripted
    /// outcomes queued.
    #[derive(Clone, Default)]
    pub struct ScriptedProvider {
        scripts: Arc<RwLock<HashMap<String, VecDeque<ScriptedSend>>>>,
        sent: Arc<RwLock<Vec<SentMessage>>>,
        attempts: Arc<AtomicUsize>,
        statuses: Arc<RwLock<HashMap<String, String>>>,
        poll_failures: Arc<RwLock<VecDeque<PipelineError>>>,
        polled: Arc<RwLock<Vec<Vec<String>>>>,
    }

    impl ScriptedProvider {
        /// Creates a provider that accepts everything.
        pub fn new() -> Self {
            Self::default()
        }

        /// Queues outcomes for sends to `phone`, consumed in order.
        pub async fn script(&self, phone: impl Into<String>, outcomes: Vec<ScriptedSend>) {
            self.scripts.write().await.entry(phone.into()).or_default().extend(outcomes);
        }

        /// Sets the delivery status reported for a provider id.
        pub async fn set_status(&self, provider_message_id: impl Into<String>, code: impl Into<String>) {
            self.statuses.write().await.insert(provider_message_id.into(), code.into());
        }

        /// Sets the delivery status for every message accepted for `phone`.
        pub async fn set_status_for_phone(&self, phone: &str, code: &str) {
            let ids: Vec<String> = self
                .sent
                .read()
                .await
                .iter()
                .filter(|m| m.phone == phone)
                .map(|m| m.provider_message_id.clone())
                .collect();
            let mut statuses = self.statuses.write().await;
            for id in ids {
                statuses.insert(id, code.to_string());
            }
        }

        /// Reports `code` for every accepted message.
        pub async fn deliver_all(&self, code: &str) {
            let ids: Vec<String> =
                self.sent.read().await.iter().map(|m| m.provider_message_id.clone()).collect();
            let mut statuses = self.statuses.write().await;
            for id in ids {
                statuses.insert(id, code.to_string());
            }
        }

        /// Makes the next status poll fail.
        pub async fn fail_next_poll(&self, error: PipelineError) {
            self.poll_failures.write().await.push_back(error);
        }

        /// Accepted messages in acceptance order.
        pub async fn sent(&self) -> Vec<SentMessage> {
            self.sent.read().await.clone()
        }

        /// Number of send calls, including failures.
        pub fn attempt_count(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        /// Id batches passed to `poll_status`.
        pub async fn polled_batches(&self) -> Vec<Vec<String>> {
            self.polled.read().await.clone()
        }
    }

    impl SmsProvider for ScriptedProvider {
        fn send(&self, request: SendRequest) -> BoxFuture<'_, Result<SendReceipt>> {
            Box::pin(async move {
                let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                let next = self
                    .scripts
                    .write()
                    .await
                    .get_mut(&request.phone)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or(ScriptedSend::Accept);

                match next {
                    ScriptedSend::Fail(error) => Err(error),
                    ScriptedSend::Accept => {
                        let provider_message_id = format!("prov-{attempt}");
                        self.sent.write().await.push(SentMessage {
                            phone: request.phone,
                            body: request.body,
                            reference: request.reference,
                            provider_message_id: provider_message_id.clone(),
                        });
                        Ok(SendReceipt { provider_message_id })
                    },
                }
            })
        }

        fn poll_status(
            &self,
            provider_message_ids: Vec<String>,
        ) -> BoxFuture<'_, Result<Vec<ProviderStatus>>> {
            Box::pin(async move {
                self.polled.write().await.push(provider_message_ids.clone());
                if let Some(error) = self.poll_failures.write().await.pop_front() {
                    return Err(error);
                }

                let statuses = self.statuses.read().await;
                Ok(provider_message_ids
                    .into_iter()
                    .filter_map(|id| {
                        statuses.get(&id).map(|code| ProviderStatus {
                            provider_message_id: id.clone(),
                            code: code.clone(),
                        })
                    })
                    .collect())
            })
        }
    }
}
