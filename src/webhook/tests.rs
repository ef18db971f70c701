use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;

use super::*;
use crate::error::{HelixError, TransportError};
use crate::helix::{HelixClient, TokenProvider};
use crate::registry::Registry;
use crate::transport::{FetchRequest, FetchResponse, HttpTransport};

struct UnusedTransport;

#[async_trait]
impl HttpTransport for UnusedTransport {
    async fn fetch(&self, _request: FetchRequest) -> Result<FetchResponse, TransportError> {
        panic!("this test never issues a Helix call")
    }
}

struct UnusedTokenProvider;

#[async_trait]
impl TokenProvider for UnusedTokenProvider {
    fn user_access_token(&self) -> Option<String> {
        None
    }
    fn app_access_token(&self) -> Option<String> {
        None
    }
    fn scopes_for(&self, _token: &str) -> Vec<String> {
        Vec::new()
    }
    fn can_refresh(&self) -> bool {
        false
    }
    async fn refresh(&self) -> Result<(), HelixError> {
        Ok(())
    }
}

type HmacSha256 = Hmac<Sha256>;

fn sign(secret: &str, message_id: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(message_id.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn headers_for(message_id: &str, message_type: &str, timestamp: &str, signature: &str) -> Headers {
    let mut headers = Headers::new();
    headers.insert(MESSAGE_ID_HEADER, message_id);
    headers.insert(MESSAGE_TYPE_HEADER, message_type);
    headers.insert(MESSAGE_SIGNATURE_HEADER, signature);
    headers.insert(MESSAGE_TIMESTAMP_HEADER, timestamp);
    headers
}

fn now_rfc3339() -> String {
    chrono::DateTime::<chrono::Utc>::from(std::time::SystemTime::now())
        .to_rfc3339()
}

#[test]
fn missing_header_is_rejected() {
    let registry = Registry::with_defaults();
    let mut seen = SeenMessageCache::new(10);
    let headers = Headers::new();

    let err = parse_request(&registry, &mut seen, &headers, b"{}", |_| None).unwrap_err();
    assert!(matches!(err, WebhookError::MissingHeader(_)));
}

#[test]
fn unknown_subscription_secret_is_rejected() {
    let registry = Registry::with_defaults();
    let mut seen = SeenMessageCache::new(10);
    let ts = now_rfc3339();
    let body = json!({ "subscription": { "id": "sub-1" } }).to_string();
    let headers = headers_for("m1", "notification", &ts, "sha256=deadbeef");

    let err = parse_request(&registry, &mut seen, &headers, body.as_bytes(), |_| None).unwrap_err();
    assert!(matches!(err, WebhookError::UnknownSubscription(_)));
}

#[test]
fn bad_signature_is_rejected() {
    let registry = Registry::with_defaults();
    let mut seen = SeenMessageCache::new(10);
    let ts = now_rfc3339();
    let body = json!({ "subscription": { "id": "sub-1" } }).to_string();
    let headers = headers_for("m1", "notification", &ts, "sha256=00");

    let err = parse_request(&registry, &mut seen, &headers, body.as_bytes(), |_| {
        Some("secret".to_string())
    })
    .unwrap_err();
    assert!(matches!(err, WebhookError::InvalidSignature));
}

#[test]
fn challenge_verification_echoes_the_challenge() {
    let registry = Registry::with_defaults();
    let mut seen = SeenMessageCache::new(10);
    let ts = now_rfc3339();
    let body = json!({
        "subscription": { "id": "sub-1" },
        "challenge": "abc123",
    })
    .to_string();
    let signature = sign("secret", "m1", &ts, body.as_bytes());
    let headers = headers_for("m1", "webhook_callback_verification", &ts, &signature);

    let parsed = parse_request(&registry, &mut seen, &headers, body.as_bytes(), |_| {
        Some("secret".to_string())
    })
    .unwrap();

    assert_eq!(parsed.response.status, 200);
    assert_eq!(parsed.response.body, b"abc123");
    assert!(matches!(parsed.message, WebhookMessage::Challenge { .. }));
}

#[test]
fn revocation_carries_the_reason() {
    let registry = Registry::with_defaults();
    let mut seen = SeenMessageCache::new(10);
    let ts = now_rfc3339();
    let body = json!({
        "subscription": { "id": "sub-1", "status": "authorization_revoked" },
    })
    .to_string();
    let signature = sign("secret", "m1", &ts, body.as_bytes());
    let headers = headers_for("m1", "revocation", &ts, &signature);

    let parsed = parse_request(&registry, &mut seen, &headers, body.as_bytes(), |_| {
        Some("secret".to_string())
    })
    .unwrap();

    assert_eq!(parsed.response.status, 204);
    match parsed.message {
        WebhookMessage::Revocation { reason, .. } => {
            assert_eq!(reason, RevocationReason::AuthorizationRevoked);
        }
        other => panic!("expected Revocation, got {other:?}"),
    }
}

#[test]
fn notification_is_parsed_and_dispatched() {
    let registry = Registry::with_defaults();
    let mut seen = SeenMessageCache::new(10);
    let ts = now_rfc3339();
    let body = json!({
        "subscription": {
            "id": "sub-1",
            "type": "channel.follow",
            "version": "2",
            "condition": { "broadcaster_user_id": "1" },
        },
        "event": { "user_id": "2" },
    })
    .to_string();
    let signature = sign("secret", "m1", &ts, body.as_bytes());
    let headers = headers_for("m1", "notification", &ts, &signature);

    let parsed = parse_request(&registry, &mut seen, &headers, body.as_bytes(), |_| {
        Some("secret".to_string())
    })
    .unwrap();

    assert_eq!(parsed.response.status, 204);
    match parsed.message {
        WebhookMessage::Notification { event_type, event, .. } => {
            assert_eq!(event_type, "channel.follow");
            assert_eq!(event["user_id"], "2");
        }
        other => panic!("expected Notification, got {other:?}"),
    }
}

#[test]
fn duplicate_message_id_is_discarded() {
    let registry = Registry::with_defaults();
    let mut seen = SeenMessageCache::new(10);
    let ts = now_rfc3339();
    let body = json!({
        "subscription": { "id": "sub-1", "status": "user_removed" },
    })
    .to_string();
    let signature = sign("secret", "m1", &ts, body.as_bytes());
    let headers = headers_for("m1", "revocation", &ts, &signature);

    let first = parse_request(&registry, &mut seen, &headers, body.as_bytes(), |_| {
        Some("secret".to_string())
    })
    .unwrap();
    assert!(matches!(first.message, WebhookMessage::Revocation { .. }));

    let second = parse_request(&registry, &mut seen, &headers, body.as_bytes(), |_| {
        Some("secret".to_string())
    })
    .unwrap();
    assert!(matches!(second.message, WebhookMessage::Discarded));
}

#[tokio::test]
async fn webhook_client_dispatches_notification_to_the_registered_generator() {
    let registry = Arc::new(Registry::with_defaults());
    let helix = Arc::new(HelixClient::new(
        Arc::new(UnusedTransport),
        Arc::new(UnusedTokenProvider),
        Arc::new(Registry::with_defaults()),
        "client-id",
    ));
    let client = WebhookClient::new(helix, registry, "https://example.com/callback", 100);

    let secret = "test-secret".to_string();
    let mut stream = client
        .register(
            "sub-1".to_string(),
            json!({ "type": "channel.follow", "version": "2" }),
            None,
            "https://example.com/callback".to_string(),
            secret.clone(),
        )
        .await;

    let ts = now_rfc3339();
    let body = json!({
        "subscription": {
            "id": "sub-1",
            "type": "channel.follow",
            "version": "2",
            "condition": { "broadcaster_user_id": "1" },
        },
        "event": { "user_id": "2" },
    })
    .to_string();
    let signature = sign(&secret, "m1", &ts, body.as_bytes());
    let headers = headers_for("m1", "notification", &ts, &signature);

    let response = client.handle_request(&headers, body.as_bytes()).await.unwrap();
    assert_eq!(response.status, 204);

    let event = stream.next().await.unwrap().unwrap();
    assert_eq!(event.event_type, "channel.follow");
    assert_eq!(event.subscription_id, "sub-1");
}

struct ScriptedTransport {
    responses: std::sync::Mutex<Vec<FetchResponse>>,
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn fetch(&self, _request: FetchRequest) -> Result<FetchResponse, TransportError> {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            panic!("ScriptedTransport ran out of responses");
        }
        Ok(responses.remove(0))
    }
}

fn ok_rate_limit() -> crate::transport::RateLimitHeaders {
    crate::transport::RateLimitHeaders {
        limit: 800,
        remaining: 799,
        reset: 1_700_000_000,
    }
}

#[tokio::test]
async fn subscribe_creates_then_registers_the_subscription() {
    let registry = Arc::new(Registry::with_defaults());
    let transport = ScriptedTransport {
        responses: std::sync::Mutex::new(vec![FetchResponse {
            status: 202,
            body: Some(json!({ "data": [{ "id": "sub-1" }] })),
            rate_limit: ok_rate_limit(),
        }]),
    };
    let helix = Arc::new(HelixClient::new(
        Arc::new(transport),
        Arc::new(UnusedTokenProvider),
        Arc::new(Registry::with_defaults()),
        "client-id",
    ));
    let client = WebhookClient::new(helix, registry, "https://example.com/callback", 100);

    let mut stream = client
        .subscribe(
            "ChannelFollow",
            json!({ "broadcaster_user_id": "1", "moderator_user_id": "1" }),
            None,
            Some("app-token".to_string()),
        )
        .await
        .unwrap();

    let ts = now_rfc3339();
    let body = json!({
        "subscription": {
            "id": "sub-1",
            "type": "channel.follow",
            "version": "2",
            "condition": { "broadcaster_user_id": "1" },
        },
        "event": { "user_id": "2" },
    })
    .to_string();

    let secrets = {
        let inner = client.inner.lock().await;
        inner.subscriptions.get("sub-1").unwrap().secret.clone()
    };
    let signature = sign(&secrets, "m1", &ts, body.as_bytes());
    let headers = headers_for("m1", "notification", &ts, &signature);

    let response = client.handle_request(&headers, body.as_bytes()).await.unwrap();
    assert_eq!(response.status, 204);

    let event = stream.next().await.unwrap().unwrap();
    assert_eq!(event.subscription_id, "sub-1");
}

#[test]
fn revocation_reason_as_str_round_trips_known_and_unknown_values() {
    assert_eq!(RevocationReason::UserRemoved.as_str(), "user_removed");
    assert_eq!(
        RevocationReason::AuthorizationRevoked.as_str(),
        "authorization_revoked"
    );
    assert_eq!(
        RevocationReason::NotificationFailuresExceeded.as_str(),
        "notification_failures_exceeded"
    );
    assert_eq!(RevocationReason::VersionRemoved.as_str(), "version_removed");
    assert_eq!(
        RevocationReason::from("some_future_reason").as_str(),
        "some_future_reason"
    );
}

#[tokio::test]
async fn handle_request_throws_revocation_with_the_raw_wire_status() {
    let registry = Arc::new(Registry::with_defaults());
    let helix = Arc::new(HelixClient::new(
        Arc::new(UnusedTransport),
        Arc::new(UnusedTokenProvider),
        Arc::new(Registry::with_defaults()),
        "client-id",
    ));
    let client = WebhookClient::new(helix, registry, "https://example.com/callback", 100);

    let secret = "sub-1-secret".to_string();
    let mut stream = client
        .register(
            "sub-1".to_string(),
            json!({ "type": "channel.follow", "version": "2" }),
            None,
            "https://example.com/callback".to_string(),
            secret.clone(),
        )
        .await;

    let ts = now_rfc3339();
    let body = json!({
        "subscription": { "id": "sub-1", "status": "authorization_revoked" },
    })
    .to_string();
    let signature = sign(&secret, "m1", &ts, body.as_bytes());
    let headers = headers_for("m1", "revocation", &ts, &signature);

    let response = client.handle_request(&headers, body.as_bytes()).await.unwrap();
    assert_eq!(response.status, 204);

    let err = stream.next().await.unwrap().unwrap_err();
    assert_eq!(err.reason, "authorization_revoked");
}

#[tokio::test]
async fn subscribe_rejects_unknown_event_key() {
    let registry = Arc::new(Registry::with_defaults());
    let helix = Arc::new(HelixClient::new(
        Arc::new(UnusedTransport),
        Arc::new(UnusedTokenProvider),
        Arc::new(Registry::with_defaults()),
        "client-id",
    ));
    let client = WebhookClient::new(helix, registry, "https://example.com/callback", 100);

    let err = client
        .subscribe("NotARealEvent", json!({}), None, None)
        .await
        .unwrap_err();

    assert!(matches!(err, WebhookError::UnknownEventKey(k) if k == "NotARealEvent"));
}

#[tokio::test]
async fn unsubscribe_unknown_id_is_an_error() {
    let registry = Arc::new(Registry::with_defaults());
    let helix = Arc::new(HelixClient::new(
        Arc::new(UnusedTransport),
        Arc::new(UnusedTokenProvider),
        Arc::new(Registry::with_defaults()),
        "client-id",
    ));
    let client = WebhookClient::new(helix, registry, "https://example.com/callback", 100);

    let err = client.unsubscribe("missing").await.unwrap_err();
    assert!(matches!(err, WebhookError::UnknownSubscription(id) if id == "missing"));
}
