//! One live WebSocket connection: welcome handshake, keepalive timer,
//! message demultiplexing, and disposal.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::{ProtocolError, TransportError};

use super::message::{Envelope, NotificationPayload, ReconnectPayload, RevocationPayload, WelcomePayload};

/// A single inbound/outbound WebSocket frame, abstracted away from any
/// particular client library.
#[derive(Debug, Clone)]
pub enum WsMessage {
    Text(String),
    Close(Option<u16>),
}

/// A connected WebSocket, as both a frame source and sink.
pub trait WsStream:
    Stream<Item = Result<WsMessage, TransportError>> + Sink<WsMessage, Error = TransportError> + Send
{
}

impl<T> WsStream for T where
    T: Stream<Item = Result<WsMessage, TransportError>> + Sink<WsMessage, Error = TransportError> + Send
{
}

pub type BoxedWsStream = Pin<Box<dyn WsStream>>;

/// Opens a WebSocket connection. The default implementation wraps
/// `tokio_tungstenite::connect_async`; tests substitute a fake.
#[async_trait]
pub trait WsTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<BoxedWsStream, TransportError>;
}

/// Event surfaced by a session's background read loop, consumed by
/// [`super::client::WebSocketClient`].
#[derive(Debug)]
pub enum SessionEvent {
    Reconnect(ReconnectPayload),
    Revocation(RevocationPayload),
    Notification(NotificationPayload),
    Close(Option<u16>),
    Error(ProtocolError),
}

/// `Connecting` -> (welcome received) -> `Live` -> (`dispose()`) -> `Disposed`.
/// Represented implicitly: a `WebSocketSession` only exists once `Live`; the
/// background task transitions straight to `Disposed` by returning, at which
/// point `dispose()` becomes a no-op abort of an already-finished task.
pub struct WebSocketSession {
    session_id: String,
    keepalive_timeout_seconds: u64,
    handle: tokio::task::JoinHandle<()>,
}

impl WebSocketSession {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn keepalive_timeout_seconds(&self) -> u64 {
        self.keepalive_timeout_seconds
    }

    /// Open `url`, wait for `session_welcome`, and spawn the frame-reading
    /// loop. `keepalive_override`, when given, is appended to `url` as
    /// `keepalive_timeout_seconds`.
    pub async fn from_url(
        url: &str,
        transport: &dyn WsTransport,
        keepalive_override: Option<u64>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), ProtocolError> {
        let full_url = match keepalive_override {
            Some(secs) => format!("{url}?keepalive_timeout_seconds={secs}"),
            None => url.to_string(),
        };

        let mut stream = transport
            .connect(&full_url)
            .await
            .map_err(ProtocolError::Transport)?;

        let welcome = match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                let envelope: Envelope = serde_json::from_str(&text)?;
                if envelope.metadata.message_type != "session_welcome" {
                    return Err(ProtocolError::ExpectedWelcome(envelope.metadata.message_type));
                }
                serde_json::from_value::<WelcomePayload>(envelope.payload)?
            }
            Some(Ok(WsMessage::Close(_))) | None => return Err(ProtocolError::ClosedBeforeWelcome),
            Some(Err(err)) => return Err(ProtocolError::Transport(err)),
        };

        let session_id = welcome.session.id;
        let keepalive_timeout_seconds = welcome.session.keepalive_timeout_seconds.unwrap_or(10);

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_read_loop(stream, tx, keepalive_timeout_seconds));

        Ok((
            Self {
                session_id,
                keepalive_timeout_seconds,
                handle,
            },
            rx,
        ))
    }

    /// Terminate the session immediately. Idempotent: aborting an
    /// already-finished task is a no-op.
    pub fn dispose(&self) {
        self.handle.abort();
    }
}

async fn run_read_loop(
    mut stream: BoxedWsStream,
    tx: mpsc::UnboundedSender<SessionEvent>,
    keepalive_timeout_seconds: u64,
) {
    let timeout = Duration::from_secs(keepalive_timeout_seconds.max(1));
    let mut deadline = Instant::now() + timeout;

    loop {
        tokio::select! {
            _ = sleep_until(deadline) => {
                warn!(keepalive_timeout_seconds, "keepalive timer expired; closing session");
                let _ = stream.close().await;
                let _ = tx.send(SessionEvent::Close(None));
                return;
            }
            frame = stream.next() => {
                match frame {
                    None => {
                        let _ = tx.send(SessionEvent::Close(None));
                        return;
                    }
                    Some(Err(err)) => {
                        let _ = tx.send(SessionEvent::Error(ProtocolError::Transport(err)));
                        let _ = stream.close().await;
                        let _ = tx.send(SessionEvent::Close(None));
                        return;
                    }
                    Some(Ok(WsMessage::Close(code))) => {
                        let _ = tx.send(SessionEvent::Close(code));
                        return;
                    }
                    Some(Ok(WsMessage::Text(text))) => {
                        deadline = Instant::now() + timeout;
                        match decode_frame(&text) {
                            Ok(Some(event)) => {
                                let _ = tx.send(event);
                            }
                            Ok(None) => {}
                            Err(err) => {
                                let _ = tx.send(SessionEvent::Error(err));
                                let _ = stream.close().await;
                                let _ = tx.send(SessionEvent::Close(None));
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

fn decode_frame(text: &str) -> Result<Option<SessionEvent>, ProtocolError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    match envelope.metadata.message_type.as_str() {
        "session_welcome" => Err(ProtocolError::DuplicateWelcome),
        "session_keepalive" => Ok(None),
        "session_reconnect" => Ok(Some(SessionEvent::Reconnect(serde_json::from_value(
            envelope.payload,
        )?))),
        "revocation" => Ok(Some(SessionEvent::Revocation(serde_json::from_value(
            envelope.payload,
        )?))),
        "notification" => Ok(Some(SessionEvent::Notification(serde_json::from_value(
            envelope.payload,
        )?))),
        other => {
            debug!(message_type = other, "unknown websocket message type");
            Err(ProtocolError::UnknownMessageType(other.to_string()))
        }
    }
}

/// Default [`WsTransport`], backed by `tokio_tungstenite::connect_async`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteWsTransport;

#[async_trait]
impl WsTransport for TungsteniteWsTransport {
    async fn connect(&self, url: &str) -> Result<BoxedWsStream, TransportError> {
        let (stream, _response) = connect_async(url).await.map_err(TransportError::WebSocket)?;
        Ok(Box::pin(TungsteniteStream { inner: stream }))
    }
}

struct TungsteniteStream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Stream for TungsteniteStream {
    type Item = Result<WsMessage, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(TungsteniteMessage::Text(text)))) => {
                Poll::Ready(Some(Ok(WsMessage::Text(text))))
            }
            Poll::Ready(Some(Ok(TungsteniteMessage::Close(frame)))) => {
                Poll::Ready(Some(Ok(WsMessage::Close(frame.map(|f| f.code.into())))))
            }
            Poll::Ready(Some(Ok(_other))) => Poll::Ready(Some(Err(TransportError::InvalidHeader(
                "non-text websocket frame".to_string(),
            )))),
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(TransportError::WebSocket(err)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Sink<WsMessage> for TungsteniteStream {
    type Error = TransportError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_ready(cx)
            .map_err(TransportError::WebSocket)
    }

    fn start_send(mut self: Pin<&mut Self>, item: WsMessage) -> Result<(), Self::Error> {
        let msg = match item {
            WsMessage::Text(text) => TungsteniteMessage::Text(text),
            WsMessage::Close(code) => TungsteniteMessage::Close(code.map(|code| CloseFrame {
                code: code.into(),
                reason: std::borrow::Cow::Borrowed(""),
            })),
        };
        Pin::new(&mut self.inner)
            .start_send(msg)
            .map_err(TransportError::WebSocket)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(TransportError::WebSocket)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_close(cx)
            .map_err(TransportError::WebSocket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct FakeStream {
        frames: StdMutex<Vec<Result<WsMessage, TransportError>>>,
    }

    impl Stream for FakeStream {
        type Item = Result<WsMessage, TransportError>;

        fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            let mut frames = self.frames.lock().unwrap();
            if frames.is_empty() {
                Poll::Ready(None)
            } else {
                Poll::Ready(Some(frames.remove(0)))
            }
        }
    }

    impl Sink<WsMessage> for FakeStream {
        type Error = TransportError;
        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
        fn start_send(self: Pin<&mut Self>, _item: WsMessage) -> Result<(), Self::Error> {
            Ok(())
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    struct FakeTransport {
        frames: std::sync::Mutex<Option<Vec<Result<WsMessage, TransportError>>>>,
    }

    #[async_trait]
    impl WsTransport for FakeTransport {
        async fn connect(&self, _url: &str) -> Result<BoxedWsStream, TransportError> {
            let frames = self.frames.lock().unwrap().take().unwrap_or_default();
            Ok(Box::pin(FakeStream {
                frames: StdMutex::new(frames),
            }))
        }
    }

    fn welcome_frame(session_id: &str, keepalive: u64) -> WsMessage {
        WsMessage::Text(
            serde_json::json!({
                "metadata": {
                    "message_id": "m1",
                    "message_type": "session_welcome",
                    "message_timestamp": "2024-01-01T00:00:00Z",
                },
                "payload": {
                    "session": {
                        "id": session_id,
                        "status": "connected",
                        "keepalive_timeout_seconds": keepalive,
                        "reconnect_url": null,
                    }
                }
            })
            .to_string(),
        )
    }

    #[tokio::test]
    async fn welcome_handshake_yields_session_id_and_keepalive() {
        let transport = FakeTransport {
            frames: std::sync::Mutex::new(Some(vec![Ok(welcome_frame("sess-1", 30))])),
        };

        let (session, _events) = WebSocketSession::from_url("wss://example/ws", &transport, None)
            .await
            .unwrap();

        assert_eq!(session.session_id(), "sess-1");
        assert_eq!(session.keepalive_timeout_seconds(), 30);
    }

    #[tokio::test]
    async fn close_before_welcome_is_a_protocol_error() {
        let transport = FakeTransport {
            frames: std::sync::Mutex::new(Some(vec![Ok(WsMessage::Close(Some(1000)))])),
        };

        let err = WebSocketSession::from_url("wss://example/ws", &transport, None)
            .await
            .unwrap_err();

        assert!(matches!(err, ProtocolError::ClosedBeforeWelcome));
    }

    #[tokio::test]
    async fn non_welcome_first_message_is_rejected() {
        let notification = WsMessage::Text(
            serde_json::json!({
                "metadata": {
                    "message_id": "m1",
                    "message_type": "notification",
                    "message_timestamp": "2024-01-01T00:00:00Z",
                },
                "payload": {}
            })
            .to_string(),
        );
        let transport = FakeTransport {
            frames: std::sync::Mutex::new(Some(vec![Ok(notification)])),
        };

        let err = WebSocketSession::from_url("wss://example/ws", &transport, None)
            .await
            .unwrap_err();

        assert!(matches!(err, ProtocolError::ExpectedWelcome(t) if t == "notification"));
    }
}
