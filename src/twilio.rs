//! Twilio REST API client for sending SMS messages.

use async_trait::async_trait;
use http::StatusCode;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

const DEFAULT_TWILIO_BASE_URL: &str = "https://api.twilio.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Fixed delay before each attempt. Capped linear rather than exponential,
/// so the retry timing is reproducible in tests.
const BACKOFF: [Duration; 3] = [
    Duration::ZERO,
    Duration::from_secs(1),
    Duration::from_secs(2),
];

/// Error sending an SMS via the Twilio API.
#[derive(Debug, Error)]
pub enum TwilioError {
    /// The HTTP request could not be built or sent.
    #[error("twilio: failed to send HTTP request: {0}")]
    Request(#[from] reqwest::Error),
    /// The response body could not be read.
    #[error("twilio: failed to read response: {0}")]
    ReadResponse(#[source] reqwest::Error),
    /// Twilio returned a non-2xx status.
    #[error("twilio: API error (status {status}): {body}")]
    Api { status: StatusCode, body: String },
}

impl TwilioError {
    /// Whether retrying shortly could plausibly resolve this error.
    ///
    /// Retryable: 429, 5xx, request timeouts, and response body read
    /// failures. Anything else (other 4xx, malformed request) is permanent.
    fn is_retryable(&self) -> bool {
        match self {
            TwilioError::Request(err) => err.is_timeout(),
            TwilioError::ReadResponse(_) => true,
            TwilioError::Api { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
        }
    }
}

/// Interface for sending one SMS. Implemented by [`TwilioClient`] and by
/// test stubs.
#[async_trait]
pub trait SmsTransport: Send + Sync {
    /// Send one SMS message.
    async fn send_message(&self, to: &str, from: &str, body: &str) -> Result<(), TwilioError>;
}

/// Sends SMS via direct HTTP calls to the Twilio Messages API.
///
/// Stateless aside from the configured credentials: the account SID binds
/// the API URL, while the Basic auth credentials may be either the account
/// SID + auth token or a scoped API key + secret.
pub struct TwilioClient {
    client: reqwest::Client,
    account_sid: String,
    auth_user: String,
    auth_password: String,
    base_url: String,
}

impl TwilioClient {
    /// Create a new client. `account_sid` is used for URL construction;
    /// `auth_user`/`auth_password` are the HTTP Basic credentials.
    /// An empty `base_url` defaults to the official Twilio API URL.
    pub fn new(
        account_sid: impl Into<String>,
        auth_user: impl Into<String>,
        auth_password: impl Into<String>,
        base_url: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("Invalid reqwest client config"),
            account_sid: account_sid.into(),
            auth_user: auth_user.into(),
            auth_password: auth_password.into(),
            base_url: base_url
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_TWILIO_BASE_URL.to_owned()),
        }
    }

    /// One attempt: POST the form-encoded message and check the status.
    async fn send_once(&self, to: &str, from: &str, body: &str) -> Result<(), TwilioError> {
        let api_url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.base_url, self.account_sid
        );

        let response = self
            .client
            .post(&api_url)
            .basic_auth(&self.auth_user, Some(&self.auth_password))
            .form(&[("To", to), ("From", from), ("Body", body)])
            .send()
            .await?;

        let status = response.status();
        let resp_body = response.text().await.map_err(TwilioError::ReadResponse)?;

        if status.is_success() {
            return Ok(());
        }

        Err(TwilioError::Api {
            status,
            body: resp_body,
        })
    }
}

#[async_trait]
impl SmsTransport for TwilioClient {
    /// Send an SMS, retrying on transient errors (429, 5xx, timeouts, body
    /// read failures) up to 3 attempts with fixed 0s/1s/2s backoff.
    /// The error from the last attempt is returned after exhausting retries.
    async fn send_message(&self, to: &str, from: &str, body: &str) -> Result<(), TwilioError> {
        let mut last_err = None;

        for (attempt, delay) in BACKOFF.iter().enumerate() {
            if !delay.is_zero() {
                tokio::time::sleep(*delay).await;
            }

            match self.send_once(to, from, body).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() => {
                    warn!("Send attempt {} failed, will retry: {err}", attempt + 1);
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        // BACKOFF is non-empty, so at least one attempt ran
        Err(last_err.expect("at least one attempt"))
    }
}
