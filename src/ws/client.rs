//! Owns at most one live WebSocket session and the subscriptions multiplexed
//! over it: reconnect, migration, and re-subscription after reconnect.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{RevocationError, WsError};
use crate::generator::{channel, EventGenerator, EventStream};
use crate::helix::{HelixClient, TokenProvider};
use crate::registry::Registry;

use super::session::{SessionEvent, WebSocketSession, WsTransport};

const WS_URL: &str = "wss://eventsub.wss.twitch.tv/ws";
const RECOVERABLE_CLOSE_CODES: &[u16] = &[1000, 1001, 4000, 4004, 4005, 4006, 4007];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsSubLifecycle {
    Active,
    Inactive,
    Revoked,
}

/// One `notification` message, reshaped for application consumption.
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub event_type: String,
    pub version: String,
    pub subscription_id: String,
    pub condition: Value,
    pub event: Value,
}

pub struct WsSubState {
    pub id: String,
    pub lifecycle: WsSubLifecycle,
    pub request: Value,
    pub user_access_token: Option<String>,
    pub generator: EventGenerator<NotificationEvent, RevocationError>,
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub user_access_token: Option<String>,
    pub cancel: Option<CancellationToken>,
}

struct ActiveSession {
    session: WebSocketSession,
}

struct ClientInner {
    active_session: Option<ActiveSession>,
    subscriptions: HashMap<String, WsSubState>,
}

struct Shared {
    inner: Mutex<ClientInner>,
    helix: Arc<HelixClient>,
    tokens: Arc<dyn TokenProvider>,
    registry: Arc<Registry>,
    ws_transport: Arc<dyn WsTransport>,
    keepalive_override: Option<u64>,
}

/// Subscribes event keys onto a single multiplexed WebSocket connection and
/// hands back per-subscription event sequences.
#[derive(Clone)]
pub struct WebSocketClient {
    shared: Arc<Shared>,
}

impl WebSocketClient {
    pub fn new(
        helix: Arc<HelixClient>,
        tokens: Arc<dyn TokenProvider>,
        registry: Arc<Registry>,
        ws_transport: Arc<dyn WsTransport>,
        keepalive_override: Option<u64>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(ClientInner {
                    active_session: None,
                    subscriptions: HashMap::new(),
                }),
                helix,
                tokens,
                registry,
                ws_transport,
                keepalive_override,
            }),
        }
    }

    /// As [`WebSocketClient::new`], with `keepalive_override` taken from the
    /// `[eventsub]` section of a [`crate::config::ClientConfig`]
    /// (`keepalive_timeout_seconds`).
    pub fn from_config(
        helix: Arc<HelixClient>,
        tokens: Arc<dyn TokenProvider>,
        registry: Arc<Registry>,
        ws_transport: Arc<dyn WsTransport>,
        config: &crate::config::EventSubConfig,
    ) -> Self {
        Self::new(
            helix,
            tokens,
            registry,
            ws_transport,
            config.keepalive_timeout_seconds.map(u64::from),
        )
    }

    /// Subscribe to `event_key` under `condition`, opening a session first if
    /// none is active.
    pub async fn subscribe(
        &self,
        event_key: &str,
        condition: Value,
        options: SubscribeOptions,
    ) -> Result<Subscription, WsError> {
        let descriptor = self
            .shared
            .registry
            .lookup_by_key(event_key)
            .ok_or_else(|| WsError::UnknownEventKey(event_key.to_string()))?;
        let _ = descriptor.condition_schema.parse(&condition)?;
        let event_type = descriptor.event_type;
        let version = descriptor.version;

        let session_id = self.ensure_session().await?;

        let body = json!({
            "type": event_type,
            "version": version,
            "condition": condition,
            "transport": { "method": "websocket", "session_id": session_id },
        });

        let user_access_token = options
            .user_access_token
            .clone()
            .or_else(|| self.shared.tokens.user_access_token());

        let response = self
            .shared
            .helix
            .create_event_sub_subscription(body.clone(), user_access_token.clone(), None)
            .await?;

        let id = response["data"][0]["id"]
            .as_str()
            .ok_or(WsError::EmptyCreateResponse)?
            .to_string();

        let (generator, stream) = channel::<NotificationEvent, RevocationError>();

        {
            let mut inner = self.shared.inner.lock().await;
            inner.subscriptions.insert(
                id.clone(),
                WsSubState {
                    id: id.clone(),
                    lifecycle: WsSubLifecycle::Active,
                    request: body,
                    user_access_token,
                    generator,
                },
            );
        }

        if let Some(cancel) = options.cancel {
            let me = self.clone();
            let sub_id = id.clone();
            if cancel.is_cancelled() {
                let _ = me.unsubscribe(&sub_id).await;
            } else {
                tokio::spawn(async move {
                    cancel.cancelled().await;
                    let _ = me.unsubscribe(&sub_id).await;
                });
            }
        }

        Ok(Subscription {
            id,
            stream,
            client: self.clone(),
        })
    }

    /// Unsubscribe `id`. On Helix failure, the subscription is restored to
    /// `Active` and the failure is logged, not propagated.
    pub async fn unsubscribe(&self, id: &str) -> Result<(), WsError> {
        let user_access_token = {
            let mut inner = self.shared.inner.lock().await;
            let sub = inner
                .subscriptions
                .get_mut(id)
                .ok_or_else(|| WsError::UnknownSubscription(id.to_string()))?;
            sub.lifecycle = WsSubLifecycle::Inactive;
            sub.user_access_token.clone()
        };

        match self
            .shared
            .helix
            .delete_event_sub_subscription(id, user_access_token, None)
            .await
        {
            Ok(()) => {
                let mut inner = self.shared.inner.lock().await;
                if let Some(sub) = inner.subscriptions.remove(id) {
                    sub.generator.close();
                }
                Ok(())
            }
            Err(err) => {
                let mut inner = self.shared.inner.lock().await;
                if let Some(sub) = inner.subscriptions.get_mut(id) {
                    sub.lifecycle = WsSubLifecycle::Active;
                }
                warn!(subscription_id = id, error = %err, "unsubscribe failed; subscription left active");
                Ok(())
            }
        }
    }

    async fn ensure_session(&self) -> Result<String, WsError> {
        let mut inner = self.shared.inner.lock().await;
        if let Some(active) = &inner.active_session {
            return Ok(active.session.session_id().to_string());
        }
        self.open_session_locked(&mut inner).await
    }

    async fn open_session_locked(&self, inner: &mut ClientInner) -> Result<String, WsError> {
        let (session, events) = WebSocketSession::from_url(
            WS_URL,
            self.shared.ws_transport.as_ref(),
            self.shared.keepalive_override,
        )
        .await?;
        let session_id = session.session_id().to_string();
        self.activate_session_locked(inner, session, events, true).await;
        Ok(session_id)
    }

    async fn activate_session_locked(
        &self,
        inner: &mut ClientInner,
        session: WebSocketSession,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        recreate: bool,
    ) {
        if let Some(previous) = inner.active_session.take() {
            previous.session.dispose();
        }

        let session_id = session.session_id().to_string();
        inner.active_session = Some(ActiveSession { session });

        let pump_client = self.clone();
        tokio::spawn(async move { pump_client.pump_events(events).await });

        if recreate {
            let ids: Vec<String> = inner.subscriptions.keys().cloned().collect();
            for old_id in ids {
                let (request, user_access_token) = {
                    let sub = match inner.subscriptions.get(&old_id) {
                        Some(sub) => sub,
                        None => continue,
                    };
                    (sub.request.clone(), sub.user_access_token.clone())
                };
                let mut new_request = request;
                new_request["transport"]["session_id"] = json!(session_id);

                match self
                    .shared
                    .helix
                    .create_event_sub_subscription(new_request.clone(), user_access_token.clone(), None)
                    .await
                {
                    Ok(response) => match response["data"][0]["id"].as_str() {
                        Some(new_id) => {
                            if let Some(mut sub) = inner.subscriptions.remove(&old_id) {
                                sub.id = new_id.to_string();
                                sub.request = new_request;
                                sub.lifecycle = WsSubLifecycle::Active;
                                inner.subscriptions.insert(new_id.to_string(), sub);
                            }
                        }
                        None => {
                            if let Some(sub) = inner.subscriptions.remove(&old_id) {
                                sub.generator.throw(RevocationError {
                                    reason: "recreate_subscription_empty_response".to_string(),
                                });
                            }
                        }
                    },
                    Err(err) => {
                        if let Some(sub) = inner.subscriptions.remove(&old_id) {
                            sub.generator.throw(RevocationError {
                                reason: format!("recreate_subscription_failed: {err}"),
                            });
                        }
                    }
                }
            }
        }
    }

    async fn pump_events(self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_session_event(event).await;
        }
    }

    async fn handle_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Error(err) => {
                warn!(error = %err, "websocket session protocol error");
            }
            SessionEvent::Close(code) => {
                let recoverable = code.map(|c| RECOVERABLE_CLOSE_CODES.contains(&c)).unwrap_or(true);
                let mut inner = self.shared.inner.lock().await;
                inner.active_session = None;

                if recoverable {
                    for sub in inner.subscriptions.values_mut() {
                        sub.lifecycle = WsSubLifecycle::Inactive;
                    }
                    if let Err(err) = self.open_session_locked(&mut inner).await {
                        warn!(error = %err, "failed to reopen websocket session after close");
                    }
                } else {
                    let ids: Vec<String> = inner.subscriptions.keys().cloned().collect();
                    for id in ids {
                        if let Some(sub) = inner.subscriptions.remove(&id) {
                            sub.generator.throw(RevocationError {
                                reason: code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string()),
                            });
                        }
                    }
                }
            }
            SessionEvent::Reconnect(payload) => {
                let Some(reconnect_url) = payload.session.reconnect_url else {
                    warn!("session_reconnect carried no reconnect_url; ignoring");
                    return;
                };
                self.migrate_session(&reconnect_url).await;
            }
            SessionEvent::Revocation(payload) => {
                let mut inner = self.shared.inner.lock().await;
                if let Some(sub) = inner.subscriptions.remove(&payload.subscription.id) {
                    sub.generator.throw(RevocationError {
                        reason: payload.subscription.status,
                    });
                }
            }
            SessionEvent::Notification(payload) => {
                let mut inner = self.shared.inner.lock().await;
                match inner.subscriptions.get(&payload.subscription.id) {
                    Some(sub) if sub.lifecycle == WsSubLifecycle::Active => {
                        sub.generator.push(NotificationEvent {
                            event_type: payload.subscription.sub_type,
                            version: payload.subscription.version,
                            subscription_id: payload.subscription.id,
                            condition: payload.subscription.condition,
                            event: payload.event,
                        });
                    }
                    Some(_) => {}
                    None => {
                        debug!(
                            subscription_id = %payload.subscription.id,
                            "notification for unknown subscription; dropped"
                        );
                    }
                }
            }
        }
    }

    async fn migrate_session(&self, reconnect_url: &str) {
        match WebSocketSession::from_url(reconnect_url, self.shared.ws_transport.as_ref(), None).await {
            Ok((session, events)) => {
                let mut inner = self.shared.inner.lock().await;
                self.activate_session_locked(&mut inner, session, events, true).await;
            }
            Err(err) => {
                warn!(error = %err, "session migration failed; falling back to opening a new session");
                let mut inner = self.shared.inner.lock().await;
                if let Err(err) = self.open_session_locked(&mut inner).await {
                    warn!(error = %err, "fallback session open also failed");
                }
            }
        }
    }
}

/// Handle to a live subscription's event sequence.
pub struct Subscription {
    id: String,
    stream: EventStream<NotificationEvent, RevocationError>,
    client: WebSocketClient,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn next(&mut self) -> Option<Result<NotificationEvent, RevocationError>> {
        self.stream.next().await
    }

    pub async fn each(self, cb: impl FnMut(NotificationEvent)) -> Option<RevocationError> {
        self.stream.each(cb).await
    }

    pub fn into_stream(self) -> EventStream<NotificationEvent, RevocationError> {
        self.stream
    }

    pub async fn unsubscribe(self) -> Result<(), WsError> {
        self.client.unsubscribe(&self.id).await
    }
}
