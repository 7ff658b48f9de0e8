use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::{SessionError, SessionErrorKind};

/// Minimal duplex frame transport the session runs on.
///
/// `recv` is bounded: `Ok(None)` means the per-receive window elapsed with
/// nothing to deliver, which the wait loops treat as "keep polling".
#[async_trait]
pub trait CdpTransport: Send {
    async fn connect(&mut self) -> Result<(), SessionError>;
    async fn send(&mut self, frame: &str) -> Result<(), SessionError>;
    async fn recv(&mut self, max_wait: Duration) -> Result<Option<String>, SessionError>;
    /// Idempotent teardown.
    async fn close(&mut self);
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Raw websocket transport against a DevTools endpoint.
pub struct WsTransport {
    url: String,
    stream: Option<WsStream>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream: None,
        }
    }

    fn stream_mut(&mut self) -> Result<&mut WsStream, SessionError> {
        self.stream
            .as_mut()
            .ok_or_else(|| SessionError::new(SessionErrorKind::Closed).with_hint("not connected"))
    }
}

#[async_trait]
impl CdpTransport for WsTransport {
    async fn connect(&mut self) -> Result<(), SessionError> {
        let (stream, _) = connect_async(self.url.as_str()).await.map_err(|err| {
            SessionError::new(SessionErrorKind::Transport)
                .with_hint(format!("websocket connect: {err}"))
        })?;
        debug!(target: "cdp-transport", url = %self.url, "devtools connection established");
        self.stream = Some(stream);
        Ok(())
    }

    async fn send(&mut self, frame: &str) -> Result<(), SessionError> {
        let stream = self.stream_mut()?;
        stream.send(Message::text(frame)).await.map_err(|err| {
            SessionError::new(SessionErrorKind::Transport)
                .with_hint(format!("websocket send: {err}"))
        })
    }

    async fn recv(&mut self, max_wait: Duration) -> Result<Option<String>, SessionError> {
        let deadline = Instant::now() + max_wait;
        let stream = self.stream_mut()?;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let message = match timeout(remaining, stream.next()).await {
                Err(_) => return Ok(None),
                Ok(None) => {
                    return Err(SessionError::new(SessionErrorKind::Closed)
                        .with_hint("websocket stream ended"))
                }
                Ok(Some(Err(err))) => {
                    return Err(SessionError::new(SessionErrorKind::Transport)
                        .with_hint(format!("websocket recv: {err}")))
                }
                Ok(Some(Ok(message))) => message,
            };

            match message {
                Message::Text(text) => return Ok(Some(text.as_str().to_owned())),
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => {
                        debug!(target: "cdp-transport", "dropping non-utf8 binary frame");
                        continue;
                    }
                },
                Message::Close(_) => {
                    return Err(SessionError::new(SessionErrorKind::Closed)
                        .with_hint("websocket closed by peer"))
                }
                // Control frames consume none of the caller's window.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = stream.close(None).await {
                debug!(target: "cdp-transport", ?err, "websocket close");
            }
        }
    }
}
