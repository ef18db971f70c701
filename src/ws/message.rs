//! The EventSub WebSocket wire envelope and its per-`message_type` payloads.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct Metadata {
    pub message_id: String,
    pub message_type: String,
    pub message_timestamp: String,
    #[serde(default)]
    pub subscription_type: Option<String>,
    #[serde(default)]
    pub subscription_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub metadata: Metadata,
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WelcomeSession {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub keepalive_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub reconnect_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WelcomePayload {
    pub session: WelcomeSession,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectPayload {
    pub session: WelcomeSession,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RevocationSubscription {
    pub id: String,
    pub status: String,
    #[serde(rename = "type")]
    pub sub_type: String,
    pub version: String,
    pub condition: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RevocationPayload {
    pub subscription: RevocationSubscription,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationSubscription {
    pub id: String,
    pub status: String,
    #[serde(rename = "type")]
    pub sub_type: String,
    pub version: String,
    pub condition: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationPayload {
    pub subscription: NotificationSubscription,
    pub event: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn welcome_envelope_parses() {
        let raw = serde_json::json!({
            "metadata": {
                "message_id": "m1",
                "message_type": "session_welcome",
                "message_timestamp": "2024-01-01T00:00:00Z",
            },
            "payload": {
                "session": {
                    "id": "sess-1",
                    "status": "connected",
                    "keepalive_timeout_seconds": 10,
                    "reconnect_url": null,
                }
            }
        });
        let envelope: Envelope = serde_json::from_value(raw).unwrap();
        assert_eq!(envelope.metadata.message_type, "session_welcome");
        let payload: WelcomePayload = serde_json::from_value(envelope.payload).unwrap();
        assert_eq!(payload.session.id, "sess-1");
        assert_eq!(payload.session.keepalive_timeout_seconds, Some(10));
    }

    #[test]
    fn notification_envelope_parses() {
        let raw = serde_json::json!({
            "metadata": {
                "message_id": "m2",
                "message_type": "notification",
                "message_timestamp": "2024-01-01T00:00:01Z",
                "subscription_type": "channel.follow",
                "subscription_version": "2",
            },
            "payload": {
                "subscription": {
                    "id": "sub-1",
                    "status": "enabled",
                    "type": "channel.follow",
                    "version": "2",
                    "condition": { "broadcaster_user_id": "1" },
                },
                "event": { "user_id": "2" }
            }
        });
        let envelope: Envelope = serde_json::from_value(raw).unwrap();
        let payload: NotificationPayload = serde_json::from_value(envelope.payload).unwrap();
        assert_eq!(payload.subscription.sub_type, "channel.follow");
        assert_eq!(payload.event["user_id"], "2");
    }
}
