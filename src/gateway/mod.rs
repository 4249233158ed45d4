//! Gateway for bridging Alertmanager webhooks to Twilio SMS.

use crate::{
    alertmanager::WebhookPayload,
    dispatch::dispatch,
    metrics::Metrics,
    rate_limiter::RateLimiter,
    twilio::{SmsTransport, TwilioClient},
};
use conf::Conf;
use http::{Method, Request, Response, StatusCode, header};
use http_body::Body;
use http_body_util::{BodyExt, Limited};
use serde::Serialize;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio_util::bytes::Buf;
use tracing::{error, info, warn};

/// Inbound request bodies are capped before parsing, to bound memory.
const MAX_BODY_SIZE: usize = 5 * 1024 * 1024;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Configuration for the gateway.
#[derive(Conf, Debug)]
pub struct GatewayConfig {
    /// Twilio account SID. Always used to construct the API URL.
    #[conf(long, env)]
    pub account_sid: String,
    /// Twilio auth token, used for HTTP Basic auth together with the
    /// account SID when no API key is configured.
    #[conf(long, env)]
    pub auth_token: Option<String>,
    /// Twilio API key SID. Takes precedence over the account SID/auth token
    /// for authentication when set together with the secret.
    #[conf(long, env)]
    pub api_key: Option<String>,
    /// Twilio API key secret.
    #[conf(long, env)]
    pub api_key_secret: Option<String>,
    /// Phone number to send messages from.
    #[conf(long, env)]
    pub sender: String,
    /// Default comma-separated receiver phone numbers. May be empty if every
    /// request supplies `?receiver=`.
    #[conf(long, env, default_value = "")]
    pub receiver: String,
    /// Also send notifications for resolved alerts.
    #[conf(long, env)]
    pub send_resolved: bool,
    /// Maximum SMS body length in bytes (0 falls back to 150).
    #[conf(long, env, default_value = "150")]
    pub max_message_length: u32,
    /// Prefix prepended to every outgoing message.
    #[conf(long, env, default_value = "")]
    pub message_prefix: String,
    /// Requests allowed per minute on POST /send (0 = no rate limiting).
    #[conf(long, env, default_value = "0")]
    pub rate_limit: u32,
    /// Format and log messages without calling Twilio. Dry-run sends are
    /// counted as sent.
    #[conf(long, env)]
    pub dry_run: bool,
    /// When set, POST /send requires `Authorization: Bearer <token>`.
    #[conf(long, env)]
    pub webhook_auth_token: Option<String>,
    /// Override the Twilio API base URL (for testing).
    #[conf(long, env)]
    pub twilio_base_url: Option<String>,
}

impl GatewayConfig {
    /// Check invariants that must hold before the server starts.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.account_sid.is_empty() {
            return Err("account_sid must be set");
        }
        if self.sender.is_empty() {
            return Err("sender must be set");
        }
        match (&self.api_key, &self.api_key_secret) {
            (Some(_), Some(_)) => Ok(()),
            (None, None) => {
                if self.auth_token.as_deref().unwrap_or_default().is_empty() {
                    Err("either auth_token or api_key + api_key_secret must be set")
                } else {
                    Ok(())
                }
            }
            _ => Err("api_key and api_key_secret must be set together"),
        }
    }

    /// The HTTP Basic credentials: API key + secret when configured,
    /// otherwise account SID + auth token.
    pub fn auth_credentials(&self) -> (&str, &str) {
        if let (Some(key), Some(secret)) = (&self.api_key, &self.api_key_secret) {
            (key, secret)
        } else {
            (
                &self.account_sid,
                self.auth_token.as_deref().unwrap_or_default(),
            )
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            account_sid: "AC_test".to_owned(),
            auth_token: Some("token".to_owned()),
            api_key: None,
            api_key_secret: None,
            sender: "+0987654321".to_owned(),
            receiver: "+1234567890".to_owned(),
            send_resolved: false,
            max_message_length: 150,
            message_prefix: String::new(),
            rate_limit: 0,
            dry_run: false,
            webhook_auth_token: None,
            twilio_base_url: None,
        }
    }
}

/// Split a comma-separated string of phone numbers, dropping blanks.
pub fn parse_receivers(receivers: &str) -> Vec<String> {
    receivers
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// JSON body of the `GET /health` response.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime: String,
}

/// The gateway owns the transport client, the metrics counters and the rate
/// limiter, and turns inbound Alertmanager webhook requests into SMS
/// dispatches. Construct one per service instance; nothing here is a global,
/// so tests can run independent gateways side by side.
pub struct Gateway {
    config: Arc<GatewayConfig>,
    transport: Arc<dyn SmsTransport>,
    metrics: Metrics,
    rate_limiter: Option<RateLimiter>,
    default_receivers: Vec<String>,
    start_time: Instant,
}

impl Gateway {
    /// Create a gateway with a [`TwilioClient`] built from the config.
    pub fn new(config: GatewayConfig) -> Result<Self, &'static str> {
        config.validate()?;
        let (auth_user, auth_password) = config.auth_credentials();
        let transport = Arc::new(TwilioClient::new(
            &config.account_sid,
            auth_user,
            auth_password,
            config.twilio_base_url.clone(),
        ));
        Ok(Self::with_transport(config, transport))
    }

    /// Create a gateway with a custom transport (useful for testing).
    /// Skips credential validation, since the transport is already built.
    pub fn with_transport(config: GatewayConfig, transport: Arc<dyn SmsTransport>) -> Self {
        let rate_limiter = match config.rate_limit {
            0 => None,
            n => Some(RateLimiter::new(n)),
        };
        let default_receivers = parse_receivers(&config.receiver);
        Self {
            config: Arc::new(config),
            transport,
            metrics: Metrics::new(),
            rate_limiter,
            default_receivers,
            start_time: Instant::now(),
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Handle an incoming HTTP request (e.g., webhooks from Alertmanager).
    pub async fn handle_http_request<B>(&self, req: Request<B>) -> Response<String>
    where
        B: Body + Send,
        B::Data: Buf + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        info!(
            "Received http request: {} {} (version: {:?})",
            req.method(),
            req.uri().path(),
            req.version()
        );

        match req.uri().path() {
            "/" => {
                if !matches!(req.method(), &Method::GET | &Method::HEAD) {
                    err_resp(StatusCode::NOT_IMPLEMENTED, "Use GET or HEAD with this route")
                } else {
                    Response::new("ping".into())
                }
            }
            "/health" => {
                if !matches!(req.method(), &Method::GET | &Method::HEAD) {
                    return err_resp(StatusCode::NOT_IMPLEMENTED, "Use GET or HEAD with this route");
                }
                let uptime = Duration::new(self.start_time.elapsed().as_secs(), 0);
                let body = HealthResponse {
                    status: "ok",
                    version: VERSION,
                    uptime: humantime::format_duration(uptime).to_string(),
                };
                json_resp(
                    StatusCode::OK,
                    serde_json::to_string(&body).expect("health response serializes"),
                )
            }
            "/metrics" => {
                if !matches!(req.method(), &Method::GET | &Method::HEAD) {
                    return err_resp(StatusCode::NOT_IMPLEMENTED, "Use GET or HEAD with this route");
                }
                let mut resp = Response::new(self.metrics.render());
                resp.headers_mut().insert(
                    header::CONTENT_TYPE,
                    header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
                );
                resp
            }
            "/send" => {
                if !matches!(req.method(), &Method::POST) {
                    return err_resp(StatusCode::NOT_IMPLEMENTED, "Use POST with this route");
                }
                match self.handle_post_send(req).await {
                    Ok(resp) => resp,
                    Err((code, msg)) => err_resp(code, msg),
                }
            }
            _ => err_resp(
                StatusCode::NOT_FOUND,
                format!("Not found '{} {}'", req.method(), req.uri().path()),
            ),
        }
    }

    async fn handle_post_send<B>(
        &self,
        req: Request<B>,
    ) -> Result<Response<String>, (StatusCode, &'static str)>
    where
        B: Body + Send,
        B::Data: Buf + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if !has_json_content_type(&req) {
            return Err((
                StatusCode::NOT_ACCEPTABLE,
                "Content-Type must be application/json",
            ));
        }

        if let Some(expected) = &self.config.webhook_auth_token {
            let authorized = req
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .is_some_and(|token| token == expected);
            if !authorized {
                warn!("Rejecting /send request with missing or invalid auth token");
                return Err((StatusCode::UNAUTHORIZED, "Invalid webhook auth token"));
            }
        }

        if let Some(limiter) = &self.rate_limiter
            && !limiter.allow()
        {
            warn!("Rate limit exceeded on /send");
            return Err((StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded"));
        }

        // The receiver query param (comma-separated, URL-encoded) overrides
        // the configured default receiver list.
        let receivers = match receiver_query_param(&req) {
            Some(param) => parse_receivers(&param),
            None => self.default_receivers.clone(),
        };
        if receivers.is_empty() {
            error!("Bad request: receiver not specified");
            return Err((StatusCode::BAD_REQUEST, "receiver not specified"));
        }

        let body_bytes = Limited::new(req.into_body(), MAX_BODY_SIZE)
            .collect()
            .await
            .map_err(|err| {
                warn!("When reading body bytes: {err}");
                (StatusCode::BAD_REQUEST, "Failed to read request body")
            })?
            .to_bytes();

        let payload: WebhookPayload = serde_json::from_slice(&body_bytes).map_err(|err| {
            error!("Could not parse json: {err}");
            (StatusCode::BAD_REQUEST, "Invalid Json")
        })?;

        let summary = dispatch(
            &payload,
            &receivers,
            &self.config,
            &self.transport,
            &self.metrics,
        )
        .await;

        let code = if summary.success {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Ok(json_resp(
            code,
            serde_json::to_string(&summary).expect("summary serializes"),
        ))
    }
}

fn err_resp(code: StatusCode, text: impl Into<String>) -> Response<String> {
    let mut resp = Response::new(text.into());
    *resp.status_mut() = code;
    resp
}

fn json_resp(code: StatusCode, body: String) -> Response<String> {
    let mut resp = Response::new(body);
    *resp.status_mut() = code;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    resp
}

/// Content-Type must be application/json; parameters such as
/// `; charset=utf-8` are allowed and the match is case-insensitive.
fn has_json_content_type<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or_default().trim())
        .is_some_and(|mime| mime.eq_ignore_ascii_case("application/json"))
}

/// Extract the (URL-decoded) `receiver` query parameter, if non-empty.
fn receiver_query_param<B>(req: &Request<B>) -> Option<String> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "receiver")
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twilio::TwilioError;
    use async_trait::async_trait;
    use http_body_util::Full;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::bytes::Bytes;

    #[derive(Default)]
    struct MockTransport {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl SmsTransport for MockTransport {
        async fn send_message(
            &self,
            _to: &str,
            _from: &str,
            _body: &str,
        ) -> Result<(), TwilioError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(TwilioError::Api {
                    status: StatusCode::BAD_REQUEST,
                    body: "nope".to_owned(),
                });
            }
            Ok(())
        }
    }

    const FIRING: &str = r#"{"status":"firing","alerts":[{"annotations":{"summary":"Test alert"},"startsAt":"2024-01-15T10:30:00Z"}]}"#;

    fn gateway(config: GatewayConfig) -> (Gateway, Arc<MockTransport>) {
        gateway_with(config, MockTransport::default())
    }

    fn gateway_with(config: GatewayConfig, mock: MockTransport) -> (Gateway, Arc<MockTransport>) {
        let mock = Arc::new(mock);
        let transport: Arc<dyn SmsTransport> = mock.clone();
        (Gateway::with_transport(config, transport), mock)
    }

    fn send_req(uri: &str, content_type: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, content_type)
            .body(Full::new(Bytes::from(body.to_owned())))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_ping_and_health() {
        let (gw, _) = gateway(GatewayConfig::for_tests());

        let resp = gw.handle_http_request(get_req("/")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body(), "ping");

        let resp = gw.handle_http_request(get_req("/health")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let health: serde_json::Value = serde_json::from_str(resp.body()).unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["version"], VERSION);
    }

    #[tokio::test]
    async fn test_unknown_route_and_wrong_method() {
        let (gw, _) = gateway(GatewayConfig::for_tests());

        let resp = gw.handle_http_request(get_req("/nope")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = gw.handle_http_request(get_req("/send")).await;
        assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn test_send_success() {
        let (gw, mock) = gateway(GatewayConfig::for_tests());

        let resp = gw
            .handle_http_request(send_req("/send", "application/json", FIRING))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let summary: serde_json::Value = serde_json::from_str(resp.body()).unwrap();
        assert_eq!(summary["success"], true);
        assert_eq!(summary["sent"], 1);
        assert_eq!(summary["failed"], 0);
        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);

        let metrics = gw.handle_http_request(get_req("/metrics")).await;
        assert!(metrics.body().contains("sms_gateway_sms_sent_total 1\n"));
    }

    #[tokio::test]
    async fn test_send_content_type() {
        let (gw, mock) = gateway(GatewayConfig::for_tests());

        let resp = gw
            .handle_http_request(send_req("/send", "text/plain", FIRING))
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_ACCEPTABLE);
        assert_eq!(mock.calls.load(Ordering::SeqCst), 0);

        // Charset parameter and case are accepted
        for ct in ["application/json; charset=utf-8", "Application/JSON"] {
            let resp = gw.handle_http_request(send_req("/send", ct, FIRING)).await;
            assert_eq!(resp.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_send_receiver_param_overrides_default() {
        let (gw, _) = gateway(GatewayConfig::for_tests());

        let resp = gw
            .handle_http_request(send_req(
                "/send?receiver=%2B9999999999%2C%2B8888888888",
                "application/json",
                FIRING,
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let summary: serde_json::Value = serde_json::from_str(resp.body()).unwrap();
        assert_eq!(summary["sent"], 2);
    }

    #[tokio::test]
    async fn test_send_no_receiver() {
        let mut config = GatewayConfig::for_tests();
        config.receiver = String::new();
        let (gw, _) = gateway(config);

        let resp = gw
            .handle_http_request(send_req("/send", "application/json", FIRING))
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_send_malformed_json() {
        let (gw, _) = gateway(GatewayConfig::for_tests());

        for body in ["{not json", r#"{"status":"firing","alerts":"not-an-array"}"#] {
            let resp = gw
                .handle_http_request(send_req("/send", "application/json", body))
                .await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn test_send_oversized_body() {
        let (gw, mock) = gateway(GatewayConfig::for_tests());

        let big = "x".repeat(MAX_BODY_SIZE + 1000);
        let resp = gw
            .handle_http_request(send_req("/send", "application/json", &big))
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(mock.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_send_transport_failure_returns_500_with_errors() {
        let (gw, _) = gateway_with(
            GatewayConfig::for_tests(),
            MockTransport {
                fail: true,
                ..Default::default()
            },
        );

        let resp = gw
            .handle_http_request(send_req("/send", "application/json", FIRING))
            .await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let summary: serde_json::Value = serde_json::from_str(resp.body()).unwrap();
        assert_eq!(summary["success"], false);
        assert_eq!(summary["failed"], 1);
        assert_eq!(summary["errors"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_send_webhook_auth() {
        let mut config = GatewayConfig::for_tests();
        config.webhook_auth_token = Some("s3cret".to_owned());
        let (gw, mock) = gateway(config);

        // Missing token
        let resp = gw
            .handle_http_request(send_req("/send", "application/json", FIRING))
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        // Wrong token
        let mut req = send_req("/send", "application/json", FIRING);
        req.headers_mut()
            .insert(header::AUTHORIZATION, "Bearer wrong".parse().unwrap());
        let resp = gw.handle_http_request(req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(mock.calls.load(Ordering::SeqCst), 0);

        // Correct token
        let mut req = send_req("/send", "application/json", FIRING);
        req.headers_mut()
            .insert(header::AUTHORIZATION, "Bearer s3cret".parse().unwrap());
        let resp = gw.handle_http_request(req).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_send_rate_limited() {
        let mut config = GatewayConfig::for_tests();
        config.rate_limit = 2;
        let (gw, _) = gateway(config);

        for _ in 0..2 {
            let resp = gw
                .handle_http_request(send_req("/send", "application/json", FIRING))
                .await;
            assert_eq!(resp.status(), StatusCode::OK);
        }
        let resp = gw
            .handle_http_request(send_req("/send", "application/json", FIRING))
            .await;
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_parse_receivers() {
        assert_eq!(parse_receivers(""), Vec::<String>::new());
        assert_eq!(parse_receivers("+1"), vec!["+1"]);
        assert_eq!(parse_receivers(" +1 , +2 ,, +3 "), vec!["+1", "+2", "+3"]);
    }

    #[test]
    fn test_config_validate() {
        assert!(GatewayConfig::for_tests().validate().is_ok());

        let mut config = GatewayConfig::for_tests();
        config.auth_token = None;
        assert!(config.validate().is_err());

        config.api_key = Some("SK123".to_owned());
        assert!(config.validate().is_err());

        config.api_key_secret = Some("secret".to_owned());
        assert!(config.validate().is_ok());

        let mut config = GatewayConfig::for_tests();
        config.sender = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_api_key_takes_precedence() {
        let mut config = GatewayConfig::for_tests();
        config.api_key = Some("SK789abc".to_owned());
        config.api_key_secret = Some("apiKeySecret".to_owned());
        assert_eq!(config.auth_credentials(), ("SK789abc", "apiKeySecret"));

        let config = GatewayConfig::for_tests();
        assert_eq!(config.auth_credentials(), ("AC_test", "token"));
    }
}
