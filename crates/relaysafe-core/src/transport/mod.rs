//! Relay transport boundary
//!
//! A relay speaks newline-free JSON array frames over a duplex connection:
//!
//! ```text
//! client → relay   ["REQ", <sub_id>, <filter>]
//! relay  → client  ["EVENT", <sub_id>, <event>] ... ["EOSE", <sub_id>]
//! client → relay   ["CLOSE", <sub_id>]
//! client → relay   ["EVENT", <event>]
//! relay  → client  ["OK", <event_id>, <accepted>, <message>]
//! ```
//!
//! [`RelayTransport`] is the only thing the rest of the engine sees: open
//! (via [`RelayConnector`]), fetch, publish, close. Every operation is time
//! bounded and resolves to success, explicit rejection, or an error. No
//! business logic lives here, so [`memory::MemoryNetwork`] can stand in for
//! real sockets.

pub mod memory;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{SafeError, SafeResult};
use crate::event::SignedEvent;
use crate::filter::Filter;

/// Relay acknowledgement of a published event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    /// Id the relay acknowledged
    pub event_id: String,
    /// Whether the relay stored the event
    pub accepted: bool,
    /// Relay-provided reason (may be empty)
    pub message: String,
}

/// Frames sent by the client
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Open a subscription
    Req {
        /// Subscription id
        subscription_id: String,
        /// Filter
        filter: Filter,
    },
    /// Publish an event
    Event(SignedEvent),
    /// Close a subscription
    Close(String),
}

impl ClientMessage {
    /// Serialize to a JSON frame
    pub fn to_json(&self) -> SafeResult<String> {
        let frame = match self {
            ClientMessage::Req {
                subscription_id,
                filter,
            } => Value::Array(vec![
                Value::from("REQ"),
                Value::from(subscription_id.as_str()),
                serde_json::to_value(filter)?,
            ]),
            ClientMessage::Event(event) => {
                Value::Array(vec![Value::from("EVENT"), serde_json::to_value(event)?])
            }
            ClientMessage::Close(subscription_id) => Value::Array(vec![
                Value::from("CLOSE"),
                Value::from(subscription_id.as_str()),
            ]),
        };
        Ok(frame.to_string())
    }
}

/// Frames received from a relay
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// Stored or live event for a subscription
    Event {
        /// Subscription id
        subscription_id: String,
        /// Event
        event: SignedEvent,
    },
    /// End of stored events for a subscription
    EndOfStoredEvents(String),
    /// Publish acknowledgement
    Ok(PublishAck),
    /// Subscription closed by the relay
    Closed {
        /// Subscription id
        subscription_id: String,
        /// Reason
        message: String,
    },
    /// Human-readable notice
    Notice(String),
}

impl RelayMessage {
    /// Parse a JSON frame
    pub fn from_json(frame: &str) -> SafeResult<Self> {
        let value: Value = serde_json::from_str(frame)?;
        let parts = value
            .as_array()
            .ok_or_else(|| SafeError::Serialization("frame is not an array".to_string()))?;

        let text = |idx: usize| -> SafeResult<String> {
            parts
                .get(idx)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| SafeError::Serialization(format!("frame field {} missing", idx)))
        };

        match text(0)?.as_str() {
            "EVENT" => {
                let event = parts
                    .get(2)
                    .cloned()
                    .ok_or_else(|| SafeError::Serialization("EVENT without body".to_string()))?;
                Ok(RelayMessage::Event {
                    subscription_id: text(1)?,
                    event: serde_json::from_value(event)?,
                })
            }
            "EOSE" => Ok(RelayMessage::EndOfStoredEvents(text(1)?)),
            "OK" => Ok(RelayMessage::Ok(PublishAck {
                event_id: text(1)?,
                accepted: parts.get(2).and_then(Value::as_bool).unwrap_or(false),
                message: text(3).unwrap_or_default(),
            })),
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription_id: text(1)?,
                message: text(2).unwrap_or_default(),
            }),
            "NOTICE" => Ok(RelayMessage::Notice(text(1).unwrap_or_default())),
            other => Err(SafeError::Serialization(format!(
                "unknown frame type: {}",
                other
            ))),
        }
    }

    /// Serialize to a JSON frame
    pub fn to_json(&self) -> SafeResult<String> {
        let frame = match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => Value::Array(vec![
                Value::from("EVENT"),
                Value::from(subscription_id.as_str()),
                serde_json::to_value(event)?,
            ]),
            RelayMessage::EndOfStoredEvents(sub) => {
                Value::Array(vec![Value::from("EOSE"), Value::from(sub.as_str())])
            }
            RelayMessage::Ok(ack) => Value::Array(vec![
                Value::from("OK"),
                Value::from(ack.event_id.as_str()),
                Value::from(ack.accepted),
                Value::from(ack.message.as_str()),
            ]),
            RelayMessage::Closed {
                subscription_id,
                message,
            } => Value::Array(vec![
                Value::from("CLOSED"),
                Value::from(subscription_id.as_str()),
                Value::from(message.as_str()),
            ]),
            RelayMessage::Notice(message) => {
                Value::Array(vec![Value::from("NOTICE"), Value::from(message.as_str())])
            }
        };
        Ok(frame.to_string())
    }
}

/// Generate a fresh subscription id
pub fn new_subscription_id() -> String {
    ulid::Ulid::new().to_string().to_lowercase()
}

/// One open relay connection
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Relay endpoint URL
    fn url(&self) -> &str;

    /// Subscribe with `filter`, collect stored events until EOSE, then
    /// close the subscription.
    async fn fetch(&self, filter: &Filter, timeout: Duration) -> SafeResult<Vec<SignedEvent>>;

    /// Publish `event` and wait for the relay's `OK`
    async fn publish(&self, event: &SignedEvent, timeout: Duration) -> SafeResult<PublishAck>;

    /// Close the connection
    async fn close(&self) -> SafeResult<()>;
}

/// Opens transports for relay URLs
#[async_trait]
pub trait RelayConnector: Send + Sync {
    /// Open a connection to `url` within `timeout`
    async fn connect(&self, url: &str, timeout: Duration) -> SafeResult<Arc<dyn RelayTransport>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{encrypted_direct_message, Kind};
    use crate::keys::Keys;

    #[test]
    fn test_req_frame() {
        let msg = ClientMessage::Req {
            subscription_id: "sub1".into(),
            filter: Filter::new().kind(Kind::ENCRYPTED_DIRECT_MESSAGE).limit(100),
        };
        assert_eq!(
            msg.to_json().unwrap(),
            r#"["REQ","sub1",{"kinds":[4],"limit":100}]"#
        );
        assert_eq!(
            ClientMessage::Close("sub1".into()).to_json().unwrap(),
            r#"["CLOSE","sub1"]"#
        );
    }

    #[test]
    fn test_publish_frame_has_no_subscription() {
        let keys = Keys::generate();
        let event = encrypted_direct_message(&keys, &keys.public_key(), "ct").unwrap();
        let frame: Value =
            serde_json::from_str(&ClientMessage::Event(event.clone()).to_json().unwrap()).unwrap();
        assert_eq!(frame[0], "EVENT");
        assert_eq!(frame[1]["id"], event.id.as_str());
        assert!(frame.get(2).is_none());
    }

    #[test]
    fn test_parse_relay_frames() {
        let keys = Keys::generate();
        let event = encrypted_direct_message(&keys, &keys.public_key(), "ct").unwrap();
        let frame = RelayMessage::Event {
            subscription_id: "s".into(),
            event: event.clone(),
        }
        .to_json()
        .unwrap();

        assert_eq!(
            RelayMessage::from_json(&frame).unwrap(),
            RelayMessage::Event {
                subscription_id: "s".into(),
                event
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["EOSE","s"]"#).unwrap(),
            RelayMessage::EndOfStoredEvents("s".into())
        );
        assert_eq!(
            RelayMessage::from_json(r#"["OK","abc",false,"blocked: spam"]"#).unwrap(),
            RelayMessage::Ok(PublishAck {
                event_id: "abc".into(),
                accepted: false,
                message: "blocked: spam".into()
            })
        );
        assert!(matches!(
            RelayMessage::from_json(r#"["NOTICE","hi"]"#).unwrap(),
            RelayMessage::Notice(_)
        ));
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(RelayMessage::from_json("{}").is_err());
        assert!(RelayMessage::from_json(r#"["WHAT"]"#).is_err());
        assert!(RelayMessage::from_json(r#"["EVENT","s"]"#).is_err());
        assert!(RelayMessage::from_json("not json").is_err());
    }
}
