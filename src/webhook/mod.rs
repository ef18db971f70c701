//! The EventSub webhook delivery core: parses and verifies inbound webhook
//! HTTP requests, dedupes by message id, and dispatches to per-subscription
//! event sequences. This crate never binds a listener — applications wire
//! `handle_request` into whatever HTTP server they already run.

mod cache;

pub use cache::SeenMessageCache;

use std::collections::HashMap;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::WebhookError;
use crate::helix::HelixClient;
use crate::registry::Registry;
use crate::util::{now_epoch_ms, random_hex_secret};

type HmacSha256 = Hmac<Sha256>;

const MESSAGE_ID_HEADER: &str = "Twitch-Eventsub-Message-Id";
const MESSAGE_RETRY_HEADER: &str = "Twitch-Eventsub-Message-Retry";
const MESSAGE_TYPE_HEADER: &str = "Twitch-Eventsub-Message-Type";
const MESSAGE_SIGNATURE_HEADER: &str = "Twitch-Eventsub-Message-Signature";
const MESSAGE_TIMESTAMP_HEADER: &str = "Twitch-Eventsub-Message-Timestamp";
const SUBSCRIPTION_TYPE_HEADER: &str = "Twitch-Eventsub-Subscription-Type";
const SUBSCRIPTION_VERSION_HEADER: &str = "Twitch-Eventsub-Subscription-Version";

const STALE_TOLERANCE_SECS: i64 = 10 * 60;

/// Case-insensitive header bag, as an application would hand to us from its
/// own HTTP framework.
#[derive(Debug, Clone, Default)]
pub struct Headers(HashMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_ascii_lowercase()).map(String::as_str)
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// Outcome of successfully parsing/handling a webhook request: what to send
/// back to Twitch over HTTP.
#[derive(Debug, Clone)]
pub struct WebhookResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl WebhookResponse {
    fn discarded() -> Self {
        Self {
            status: 204,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    fn challenge(challenge: &str) -> Self {
        let body = challenge.as_bytes().to_vec();
        Self {
            status: 200,
            headers: vec![
                ("Content-Type".to_string(), "text/plain".to_string()),
                ("Content-Length".to_string(), body.len().to_string()),
            ],
            body,
        }
    }

    fn accepted() -> Self {
        Self {
            status: 204,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }
}

/// Revocation reason, as reported by Twitch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevocationReason {
    UserRemoved,
    AuthorizationRevoked,
    NotificationFailuresExceeded,
    VersionRemoved,
    Other(String),
}

impl From<&str> for RevocationReason {
    fn from(s: &str) -> Self {
        match s {
            "user_removed" => RevocationReason::UserRemoved,
            "authorization_revoked" => RevocationReason::AuthorizationRevoked,
            "notification_failures_exceeded" => RevocationReason::NotificationFailuresExceeded,
            "version_removed" => RevocationReason::VersionRemoved,
            other => RevocationReason::Other(other.to_string()),
        }
    }
}

impl RevocationReason {
    /// The exact wire value this reason was parsed from (`subscription.status`
    /// on the revocation notification) — round-trips for every variant,
    /// including `Other`.
    pub fn as_str(&self) -> &str {
        match self {
            RevocationReason::UserRemoved => "user_removed",
            RevocationReason::AuthorizationRevoked => "authorization_revoked",
            RevocationReason::NotificationFailuresExceeded => "notification_failures_exceeded",
            RevocationReason::VersionRemoved => "version_removed",
            RevocationReason::Other(s) => s.as_str(),
        }
    }
}

impl std::fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of request this was, once parsed.
#[derive(Debug, Clone)]
pub enum WebhookMessage {
    Challenge { subscription_id: String },
    Revocation { subscription_id: String, reason: RevocationReason },
    Notification {
        subscription_id: String,
        event_type: String,
        version: String,
        condition: Value,
        event: Value,
    },
    Discarded,
}

/// Result of [`parse_request`] / [`WebhookClient::handle_request`].
#[derive(Debug, Clone)]
pub struct ParsedWebhook {
    pub response: WebhookResponse,
    pub message: WebhookMessage,
}

struct ParsedHeaders<'a> {
    message_id: &'a str,
    #[allow(dead_code)]
    retry: Option<&'a str>,
    message_type: &'a str,
    signature: &'a str,
    timestamp: &'a str,
    #[allow(dead_code)]
    subscription_type: Option<&'a str>,
    #[allow(dead_code)]
    subscription_version: Option<&'a str>,
}

fn parse_headers(headers: &Headers) -> Result<ParsedHeaders<'_>, WebhookError> {
    let message_id = headers
        .get(MESSAGE_ID_HEADER)
        .ok_or(WebhookError::MissingHeader(MESSAGE_ID_HEADER))?;
    let message_type = headers
        .get(MESSAGE_TYPE_HEADER)
        .ok_or(WebhookError::MissingHeader(MESSAGE_TYPE_HEADER))?;
    let signature = headers
        .get(MESSAGE_SIGNATURE_HEADER)
        .ok_or(WebhookError::MissingHeader(MESSAGE_SIGNATURE_HEADER))?;
    let timestamp = headers
        .get(MESSAGE_TIMESTAMP_HEADER)
        .ok_or(WebhookError::MissingHeader(MESSAGE_TIMESTAMP_HEADER))?;

    Ok(ParsedHeaders {
        message_id,
        retry: headers.get(MESSAGE_RETRY_HEADER),
        message_type,
        signature,
        timestamp,
        subscription_type: headers.get(SUBSCRIPTION_TYPE_HEADER),
        subscription_version: headers.get(SUBSCRIPTION_VERSION_HEADER),
    })
}

fn verify_signature(secret: &str, headers: &ParsedHeaders<'_>, raw_body: &[u8]) -> Result<(), WebhookError> {
    let expected_hex = headers
        .signature
        .strip_prefix("sha256=")
        .ok_or(WebhookError::InvalidSignature)?;
    let expected_bytes = hex::decode(expected_hex).map_err(|_| WebhookError::InvalidSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(headers.message_id.as_bytes());
    mac.update(headers.timestamp.as_bytes());
    mac.update(raw_body);

    mac.verify_slice(&expected_bytes)
        .map_err(|_| WebhookError::InvalidSignature)
}

fn is_stale(timestamp: &str) -> bool {
    let Ok(sent_at) = chrono::DateTime::parse_from_rfc3339(timestamp) else {
        return true;
    };
    let now_secs = now_epoch_ms() / 1000;
    (now_secs - sent_at.timestamp()).abs() > STALE_TOLERANCE_SECS
}

/// Parse and verify one inbound webhook request, independent of any
/// subscription bookkeeping. `get_secret` resolves a subscription id to its
/// per-subscription HMAC secret.
pub fn parse_request(
    registry: &Registry,
    seen: &mut SeenMessageCache,
    headers: &Headers,
    raw_body: &[u8],
    get_secret: impl FnOnce(&str) -> Option<String>,
) -> Result<ParsedWebhook, WebhookError> {
    let parsed_headers = parse_headers(headers)?;

    let body: Value = serde_json::from_slice(raw_body)?;
    let subscription_id = body["subscription"]["id"]
        .as_str()
        .ok_or(WebhookError::UnknownSubscription(String::new()))?
        .to_string();

    let secret =
        get_secret(&subscription_id).ok_or_else(|| WebhookError::UnknownSubscription(subscription_id.clone()))?;

    verify_signature(&secret, &parsed_headers, raw_body)?;

    if is_stale(parsed_headers.timestamp) {
        return Ok(ParsedWebhook {
            response: WebhookResponse::discarded(),
            message: WebhookMessage::Discarded,
        });
    }

    if !seen.insert(parsed_headers.message_id.to_string()) {
        return Ok(ParsedWebhook {
            response: WebhookResponse::discarded(),
            message: WebhookMessage::Discarded,
        });
    }

    match parsed_headers.message_type {
        "webhook_callback_verification" => {
            let challenge = body["challenge"]
                .as_str()
                .ok_or_else(|| WebhookError::Validation(crate::error::ValidationError::MissingField(
                    "challenge".to_string(),
                )))?;
            Ok(ParsedWebhook {
                response: WebhookResponse::challenge(challenge),
                message: WebhookMessage::Challenge { subscription_id },
            })
        }
        "revocation" => {
            let status = body["subscription"]["status"]
                .as_str()
                .ok_or_else(|| WebhookError::Validation(crate::error::ValidationError::MissingField(
                    "subscription.status".to_string(),
                )))?;
            Ok(ParsedWebhook {
                response: WebhookResponse::accepted(),
                message: WebhookMessage::Revocation {
                    subscription_id,
                    reason: RevocationReason::from(status),
                },
            })
        }
        "notification" => {
            let event_type = body["subscription"]["type"]
                .as_str()
                .ok_or_else(|| WebhookError::Validation(crate::error::ValidationError::MissingField(
                    "subscription.type".to_string(),
                )))?
                .to_string();
            let version = body["subscription"]["version"]
                .as_str()
                .ok_or_else(|| WebhookError::Validation(crate::error::ValidationError::MissingField(
                    "subscription.version".to_string(),
                )))?
                .to_string();
            let condition = body["subscription"]["condition"].clone();
            let event = body["event"].clone();

            if let Some(descriptor) = registry.lookup_by_type_and_version(&event_type, &version) {
                descriptor.event_schema.parse(&event)?;
            }

            Ok(ParsedWebhook {
                response: WebhookResponse::accepted(),
                message: WebhookMessage::Notification {
                    subscription_id,
                    event_type,
                    version,
                    condition,
                    event,
                },
            })
        }
        other => Err(WebhookError::UnknownMessageType(other.to_string())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookSubLifecycle {
    Active,
    Inactive,
    Revoked,
}

pub struct WebhookSubState {
    pub id: String,
    pub lifecycle: WebhookSubLifecycle,
    pub request: Value,
    pub app_access_token: Option<String>,
    pub callback_url: String,
    pub secret: String,
    pub generator: crate::generator::EventGenerator<WebhookNotification, crate::error::RevocationError>,
}

/// One delivered webhook notification, reshaped for application consumption.
#[derive(Debug, Clone)]
pub struct WebhookNotification {
    pub event_type: String,
    pub version: String,
    pub subscription_id: String,
    pub condition: Value,
    pub event: Value,
}

struct Inner {
    subscriptions: HashMap<String, WebhookSubState>,
    seen: SeenMessageCache,
}

/// Owns webhook subscription bookkeeping: secret generation, dedup, and
/// dispatch into per-subscription sequences. Never binds a listener itself.
pub struct WebhookClient {
    inner: Mutex<Inner>,
    helix: Arc<HelixClient>,
    registry: Arc<Registry>,
    default_callback_url: String,
}

impl WebhookClient {
    pub fn new(
        helix: Arc<HelixClient>,
        registry: Arc<Registry>,
        default_callback_url: impl Into<String>,
        cache_capacity: usize,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                subscriptions: HashMap::new(),
                seen: SeenMessageCache::new(cache_capacity),
            }),
            helix,
            registry,
            default_callback_url: default_callback_url.into(),
        }
    }

    /// As [`WebhookClient::new`], taking `default_callback_url` and
    /// `cache_capacity` from the `[eventsub]` section of a
    /// [`crate::config::ClientConfig`] (`callback_url`,
    /// `seen_message_cache_capacity`).
    pub fn from_config(
        helix: Arc<HelixClient>,
        registry: Arc<Registry>,
        config: &crate::config::EventSubConfig,
    ) -> Self {
        Self::new(
            helix,
            registry,
            config.callback_url.clone(),
            config.seen_message_cache_capacity,
        )
    }

    /// Subscribe to `event_key` under `condition`, delivered to `callback_url`
    /// (or the client's default). Creates the subscription via Helix and
    /// registers local bookkeeping for the returned id in one call.
    pub async fn subscribe(
        &self,
        event_key: &str,
        condition: Value,
        callback_url: Option<&str>,
        app_access_token: Option<String>,
    ) -> Result<crate::generator::EventStream<WebhookNotification, crate::error::RevocationError>, WebhookError> {
        let descriptor = self
            .registry
            .lookup_by_key(event_key)
            .ok_or_else(|| WebhookError::UnknownEventKey(event_key.to_string()))?;
        let _ = descriptor.condition_schema.parse(&condition)?;

        let (transport, secret) = self.build_transport(callback_url);
        let callback = transport["callback"].as_str().unwrap_or_default().to_string();

        let body = json!({
            "type": descriptor.event_type,
            "version": descriptor.version,
            "condition": condition,
            "transport": transport,
        });

        let response = self
            .helix
            .create_event_sub_subscription(body.clone(), app_access_token.clone(), None)
            .await?;

        let id = response["data"][0]["id"]
            .as_str()
            .ok_or(WebhookError::EmptyCreateResponse)?
            .to_string();

        Ok(self.register(id, body, app_access_token, callback, secret).await)
    }

    /// Unsubscribe `id`. On Helix failure, the subscription is restored to
    /// `Active` and the failure is logged, not propagated.
    pub async fn unsubscribe(&self, id: &str) -> Result<(), WebhookError> {
        let app_access_token = {
            let mut inner = self.inner.lock().await;
            let sub = inner
                .subscriptions
                .get_mut(id)
                .ok_or_else(|| WebhookError::UnknownSubscription(id.to_string()))?;
            sub.lifecycle = WebhookSubLifecycle::Inactive;
            sub.app_access_token.clone()
        };

        match self.helix.delete_event_sub_subscription(id, app_access_token, None).await {
            Ok(()) => {
                self.remove(id).await;
                Ok(())
            }
            Err(err) => {
                let mut inner = self.inner.lock().await;
                if let Some(sub) = inner.subscriptions.get_mut(id) {
                    sub.lifecycle = WebhookSubLifecycle::Active;
                }
                warn!(subscription_id = id, error = %err, "unsubscribe failed; subscription left active");
                Ok(())
            }
        }
    }

    /// Register local bookkeeping for a subscription that has already been
    /// created via the Helix client, using the `secret` returned by the
    /// matching [`WebhookClient::build_transport`] call (subscribe flows
    /// call this after the create call succeeds).
    pub async fn register(
        &self,
        id: String,
        request: Value,
        app_access_token: Option<String>,
        callback_url: String,
        secret: String,
    ) -> crate::generator::EventStream<WebhookNotification, crate::error::RevocationError> {
        let (generator, stream) = crate::generator::channel();

        let mut inner = self.inner.lock().await;
        inner.subscriptions.insert(
            id.clone(),
            WebhookSubState {
                id: id.clone(),
                lifecycle: WebhookSubLifecycle::Active,
                request,
                app_access_token,
                callback_url,
                secret,
                generator,
            },
        );
        stream
    }

    /// Build the `transport` object for a create-subscription call, ahead of
    /// the Helix call and [`WebhookClient::register`].
    pub fn build_transport(&self, callback_url: Option<&str>) -> (Value, String) {
        let secret = random_hex_secret(32);
        let callback = callback_url.unwrap_or(&self.default_callback_url).to_string();
        (
            json!({ "method": "webhook", "callback": callback, "secret": secret }),
            secret,
        )
    }

    pub async fn mark_inactive(&self, id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(sub) = inner.subscriptions.get_mut(id) {
            sub.lifecycle = WebhookSubLifecycle::Inactive;
        }
    }

    pub async fn mark_active(&self, id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(sub) = inner.subscriptions.get_mut(id) {
            sub.lifecycle = WebhookSubLifecycle::Active;
        }
    }

    pub async fn remove(&self, id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(sub) = inner.subscriptions.remove(id) {
            sub.generator.close();
        }
    }

    /// Parse, verify, dedupe, and dispatch one inbound webhook request.
    pub async fn handle_request(&self, headers: &Headers, raw_body: &[u8]) -> Result<WebhookResponse, WebhookError> {
        let mut inner = self.inner.lock().await;
        let secrets: HashMap<String, String> = inner
            .subscriptions
            .iter()
            .map(|(id, sub)| (id.clone(), sub.secret.clone()))
            .collect();

        let parsed = parse_request(&self.registry, &mut inner.seen, headers, raw_body, |id| {
            secrets.get(id).cloned()
        })?;

        match &parsed.message {
            WebhookMessage::Revocation { subscription_id, reason } => {
                if let Some(sub) = inner.subscriptions.remove(subscription_id) {
                    sub.generator.throw(crate::error::RevocationError {
                        reason: reason.as_str().to_string(),
                    });
                }
            }
            WebhookMessage::Notification {
                subscription_id,
                event_type,
                version,
                condition,
                event,
            } => {
                if let Some(sub) = inner.subscriptions.get(subscription_id) {
                    if sub.lifecycle == WebhookSubLifecycle::Active {
                        sub.generator.push(WebhookNotification {
                            event_type: event_type.clone(),
                            version: version.clone(),
                            subscription_id: subscription_id.clone(),
                            condition: condition.clone(),
                            event: event.clone(),
                        });
                    }
                } else {
                    warn!(subscription_id = %subscription_id, "notification for unknown subscription; dropped");
                }
            }
            WebhookMessage::Challenge { .. } | WebhookMessage::Discarded => {}
        }

        Ok(parsed.response)
    }
}

#[cfg(test)]
mod tests;
