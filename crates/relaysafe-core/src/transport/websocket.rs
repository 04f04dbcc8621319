//! WebSocket relay transport (tokio-tungstenite)
//!
//! One socket per relay. Requests on the same socket are serialized behind
//! a mutex; the pool opens sockets to different relays in parallel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use super::{
    new_subscription_id, ClientMessage, PublishAck, RelayConnector, RelayMessage, RelayTransport,
};
use crate::error::{SafeError, SafeResult};
use crate::event::SignedEvent;
use crate::filter::Filter;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens [`WebSocketRelay`] connections
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a connector
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RelayConnector for WebSocketConnector {
    async fn connect(&self, url: &str, limit: Duration) -> SafeResult<Arc<dyn RelayTransport>> {
        let parsed = url::Url::parse(url).map_err(|e| SafeError::InvalidRelayUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(SafeError::InvalidRelayUrl(url.to_string()));
        }

        let (stream, response) = timeout(limit, connect_async(url))
            .await
            .map_err(|_| SafeError::Timeout(format!("connect to {}", url)))?
            .map_err(|e| SafeError::transport(url, format!("connect failed: {}", e)))?;

        debug!(relay = %url, status = %response.status(), "Relay connected");

        Ok(Arc::new(WebSocketRelay {
            url: url.to_string(),
            stream: Mutex::new(stream),
        }))
    }
}

/// Live WebSocket connection to a relay
pub struct WebSocketRelay {
    url: String,
    stream: Mutex<WsStream>,
}

impl std::fmt::Debug for WebSocketRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketRelay")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl WebSocketRelay {
    async fn send(&self, stream: &mut WsStream, message: &ClientMessage) -> SafeResult<()> {
        stream
            .send(Message::Text(message.to_json()?))
            .await
            .map_err(|e| SafeError::transport(&self.url, format!("send failed: {}", e)))
    }

    /// Next relay frame, answering pings and skipping noise.
    ///
    /// `Ok(None)` means the peer closed the socket.
    async fn receive(&self, stream: &mut WsStream) -> SafeResult<Option<RelayMessage>> {
        loop {
            let message = match stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    return Err(SafeError::transport(&self.url, format!("receive failed: {}", e)))
                }
                None => return Ok(None),
            };

            match message {
                Message::Text(text) => match RelayMessage::from_json(&text) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(e) => {
                        trace!(relay = %self.url, error = %e, "Skipping unparseable frame");
                    }
                },
                Message::Ping(data) => {
                    stream
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| SafeError::transport(&self.url, format!("pong failed: {}", e)))?;
                }
                Message::Close(_) => return Ok(None),
                Message::Binary(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    /// Read stored events for `subscription_id` until EOSE or `deadline`
    async fn collect(
        &self,
        stream: &mut WsStream,
        subscription_id: &str,
        deadline: Instant,
    ) -> SafeResult<Vec<SignedEvent>> {
        let mut events = Vec::new();
        loop {
            let frame = match timeout_at(deadline, self.receive(stream)).await {
                Ok(frame) => frame?,
                Err(_) if !events.is_empty() => {
                    warn!(
                        relay = %self.url,
                        received = events.len(),
                        "Fetch timed out before EOSE, returning partial results"
                    );
                    return Ok(events);
                }
                Err(_) => return Err(SafeError::Timeout(format!("fetch from {}", self.url))),
            };

            match frame {
                Some(RelayMessage::Event {
                    subscription_id: sub,
                    event,
                }) if sub == subscription_id => events.push(event),
                Some(RelayMessage::EndOfStoredEvents(sub)) if sub == subscription_id => {
                    return Ok(events)
                }
                Some(RelayMessage::Closed {
                    subscription_id: sub,
                    message,
                }) if sub == subscription_id => {
                    return Err(SafeError::transport(
                        &self.url,
                        format!("subscription closed: {}", message),
                    ));
                }
                Some(RelayMessage::Notice(notice)) => {
                    debug!(relay = %self.url, %notice, "Relay notice");
                }
                Some(_) => {}
                None => {
                    return Err(SafeError::transport(&self.url, "connection closed"));
                }
            }
        }
    }
}

#[async_trait]
impl RelayTransport for WebSocketRelay {
    fn url(&self) -> &str {
        &self.url
    }

    async fn fetch(&self, filter: &Filter, limit: Duration) -> SafeResult<Vec<SignedEvent>> {
        let deadline = Instant::now() + limit;
        let subscription_id = new_subscription_id();
        let mut stream = self.stream.lock().await;

        self.send(
            &mut stream,
            &ClientMessage::Req {
                subscription_id: subscription_id.clone(),
                filter: filter.clone(),
            },
        )
        .await?;

        let result = self
            .collect(&mut stream, &subscription_id, deadline)
            .await;

        // Best effort: the subscription is finished either way
        if let Err(e) = self
            .send(&mut stream, &ClientMessage::Close(subscription_id))
            .await
        {
            debug!(relay = %self.url, error = %e, "Failed to close subscription");
        }

        if let Ok(events) = &result {
            debug!(relay = %self.url, count = events.len(), "Fetch complete");
        }
        result
    }

    async fn publish(&self, event: &SignedEvent, limit: Duration) -> SafeResult<PublishAck> {
        let deadline = Instant::now() + limit;
        let mut stream = self.stream.lock().await;

        self.send(&mut stream, &ClientMessage::Event(event.clone()))
            .await?;

        loop {
            let frame = timeout_at(deadline, self.receive(&mut stream))
                .await
                .map_err(|_| SafeError::Timeout(format!("publish to {}", self.url)))??;

            match frame {
                Some(RelayMessage::Ok(ack)) if ack.event_id == event.id => {
                    debug!(
                        relay = %self.url,
                        event_id = %event.id,
                        accepted = ack.accepted,
                        "Publish acknowledged"
                    );
                    return Ok(ack);
                }
                Some(_) => {}
                None => return Err(SafeError::transport(&self.url, "connection closed")),
            }
        }
    }

    async fn close(&self) -> SafeResult<()> {
        let mut stream = self.stream.lock().await;
        stream
            .close(None)
            .await
            .map_err(|e| SafeError::transport(&self.url, format!("close failed: {}", e)))
    }
}
