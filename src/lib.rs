//! A Twitch EventSub + Helix API client: Helix request dispatch with
//! validation, auth, and retry; EventSub delivery over both the WebSocket
//! and webhook transports; and the supporting config, error, and rate-limit
//! plumbing they share.
//!
//! Nothing in this crate binds a socket listener or opens a connection on
//! its own behalf until a caller asks it to — constructing a client performs
//! no I/O.

pub mod config;
pub mod error;
pub mod generator;
pub mod helix;
pub mod ratelimit;
pub mod registry;
pub mod scope;
pub mod transport;
pub mod util;
pub mod webhook;
pub mod ws;

pub use config::{ClientConfig, ClientIdConfig, EventSubConfig, HelixConfig};
pub use error::{
    HelixError, ProtocolError, RateLimitSnapshot, RevocationError, TransportError, ValidationError,
    WebhookError, WsError,
};
pub use generator::{EventGenerator, EventStream};
pub use helix::{CallParams, HelixClient, TokenProvider};
pub use ratelimit::{RateLimitManager, RateLimitState};
pub use registry::Registry;
pub use scope::ScopeSet;
pub use transport::{FetchRequest, FetchResponse, HttpTransport, QueryValue};
pub use webhook::{Headers, WebhookClient, WebhookMessage, WebhookNotification, WebhookResponse};
pub use ws::{NotificationEvent, SubscribeOptions, Subscription, WebSocketClient};
