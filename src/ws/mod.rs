//! The EventSub WebSocket delivery core: one multiplexed session per client,
//! with reconnect, migration, and automatic re-subscription.

mod client;
mod message;
mod session;

pub use client::{
    NotificationEvent, SubscribeOptions, Subscription, WebSocketClient, WsSubLifecycle, WsSubState,
};
pub use message::{
    Envelope, Metadata, NotificationPayload, NotificationSubscription, ReconnectPayload,
    RevocationPayload, RevocationSubscription, WelcomePayload, WelcomeSession,
};
pub use session::{
    BoxedWsStream, SessionEvent, TungsteniteWsTransport, WebSocketSession, WsMessage, WsStream,
    WsTransport,
};
