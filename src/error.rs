//! Crate-wide error taxonomy.
//!
//! Each subsystem gets its own `thiserror` enum; low-level errors are wrapped
//! with endpoint/subscription context before they cross a public boundary.

use crate::scope::ScopeSet;

/// Client-side schema mismatch, raised before any network I/O.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(String),
    #[error("unexpected field `{0}`")]
    UnexpectedField(String),
    #[error("field `{field}` has the wrong type: {reason}")]
    WrongType { field: String, reason: String },
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A single HTTP request could not be carried out at all.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request was cancelled")]
    Cancelled,
    #[error("transport did not return rate-limit headers")]
    MissingRateLimitHeaders,
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("invalid header value: {0}")]
    InvalidHeader(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Snapshot of rate-limit state, attached to [`HelixError::RateLimit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at_ms: i64,
}

/// Errors raised by the Helix HTTP core.
#[derive(Debug, thiserror::Error)]
pub enum HelixError {
    #[error("request validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("endpoint `{endpoint}` requires authentication but no eligible token was supplied")]
    Authorization { endpoint: &'static str },
    #[error("token lacks required scopes for `{endpoint}`: {required:?}")]
    InsufficientScopes {
        endpoint: &'static str,
        required: ScopeSet,
    },
    #[error("rate limit exhausted calling `{endpoint}`")]
    RateLimit {
        endpoint: &'static str,
        snapshot: RateLimitSnapshot,
    },
    #[error("`{endpoint}` returned unexpected status {status}")]
    Api { endpoint: &'static str, status: u16 },
    #[error("`{endpoint}` declared a response body but returned an empty one")]
    EmptyBody { endpoint: &'static str },
    #[error("`{endpoint}` declares no response body but returned a non-empty one")]
    UnexpectedBody { endpoint: &'static str },
    #[error("unknown endpoint `{0}`")]
    UnknownEndpoint(String),
    #[error("token refresh failed: {0}")]
    Refresh(String),
}

/// A WebSocket session became unrecoverable.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("connection closed before the welcome message was received")]
    ClosedBeforeWelcome,
    #[error("expected session_welcome, got message type `{0}`")]
    ExpectedWelcome(String),
    #[error("received a duplicate session_welcome after the handshake")]
    DuplicateWelcome,
    #[error("received a non-text frame before the handshake completed")]
    NonTextFrame,
    #[error("unknown message type `{0}`")]
    UnknownMessageType(String),
    #[error("malformed message envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Server-initiated termination of a subscription, thrown into its generator.
#[derive(Debug, Clone, thiserror::Error)]
#[error("subscription revoked: {reason}")]
pub struct RevocationError {
    pub reason: String,
}

/// Errors from [`crate::ws::WebSocketClient`] subscribe/unsubscribe operations.
#[derive(Debug, thiserror::Error)]
pub enum WsError {
    #[error("unknown event key `{0}`")]
    UnknownEventKey(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Helix(#[from] HelixError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("no subscription with id `{0}`")]
    UnknownSubscription(String),
    #[error("the Helix create-subscription call returned no data")]
    EmptyCreateResponse,
    #[error("operation was cancelled")]
    Cancelled,
}

/// Errors from parsing/handling an inbound webhook request, and from
/// [`crate::webhook::WebhookClient`] subscribe/unsubscribe operations.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("missing required header `{0}`")]
    MissingHeader(&'static str),
    #[error("unknown subscription id `{0}`")]
    UnknownSubscription(String),
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("unknown message type `{0}`")]
    UnknownMessageType(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown event key `{0}`")]
    UnknownEventKey(String),
    #[error(transparent)]
    Helix(#[from] HelixError),
    #[error("the Helix create-subscription call returned no data")]
    EmptyCreateResponse,
}
