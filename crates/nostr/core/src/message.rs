//! NIP-01 wire messages.
//!
//! Every frame is a JSON array sent as one WebSocket text message.
//!
//! **Client → Relay:** `EVENT`, `REQ`, `CLOSE`, `AUTH`.
//! **Relay → Client:** `EVENT`, `OK`, `EOSE`, `CLOSED`, `NOTICE`, `AUTH`.

use serde_json::{Value, json};
use thiserror::Error;

use crate::event::Event;
use crate::filter::Filter;

/// Wire message parse error.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("expected JSON array relay message")]
    NotAnArray,

    #[error("missing relay message kind")]
    MissingKind,

    #[error("invalid {0} message")]
    TooShort(&'static str),

    #[error("invalid {0} field: {1}")]
    InvalidField(&'static str, &'static str),
}

/// Messages sent from client to relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `["EVENT", <event>]`
    Event(Event),

    /// `["REQ", <subscription_id>, <filter1>, <filter2>, ...]`
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },

    /// `["CLOSE", <subscription_id>]`
    Close { subscription_id: String },

    /// `["AUTH", <signed challenge event>]`
    Auth(Event),
}

impl ClientMessage {
    pub fn req(subscription_id: impl Into<String>, filters: Vec<Filter>) -> Self {
        ClientMessage::Req {
            subscription_id: subscription_id.into(),
            filters,
        }
    }

    pub fn close(subscription_id: impl Into<String>) -> Self {
        ClientMessage::Close {
            subscription_id: subscription_id.into(),
        }
    }

    /// Subscription id carried by this frame, if any.
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Req {
                subscription_id, ..
            }
            | ClientMessage::Close { subscription_id } => Some(subscription_id),
            _ => None,
        }
    }

    /// Serialize to the JSON text sent over the socket.
    pub fn to_json(&self) -> String {
        match self {
            ClientMessage::Event(event) => json!(["EVENT", event]).to_string(),
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = vec![json!("REQ"), json!(subscription_id)];
                for filter in filters {
                    frame.push(json!(filter));
                }
                Value::Array(frame).to_string()
            }
            ClientMessage::Close { subscription_id } => {
                json!(["CLOSE", subscription_id]).to_string()
            }
            ClientMessage::Auth(event) => json!(["AUTH", event]).to_string(),
        }
    }
}

/// Messages received from a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// `["EVENT", <subscription_id>, <event>]`
    Event {
        subscription_id: String,
        event: Event,
    },

    /// `["OK", <event_id>, <accepted>, <message?>]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },

    /// `["EOSE", <subscription_id>]`
    Eose { subscription_id: String },

    /// `["CLOSED", <subscription_id>, <message>]`
    Closed {
        subscription_id: String,
        message: String,
    },

    /// `["NOTICE", <message>]`
    Notice { message: String },

    /// `["AUTH", <challenge>]`
    Auth { challenge: String },
}

impl RelayMessage {
    /// Subscription id carried by this frame, if any.
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            RelayMessage::Event {
                subscription_id, ..
            }
            | RelayMessage::Eose { subscription_id }
            | RelayMessage::Closed {
                subscription_id, ..
            } => Some(subscription_id),
            _ => None,
        }
    }

    /// Parse one relay frame. Unknown kinds and empty arrays yield
    /// `Ok(None)`; structurally broken frames yield an error.
    pub fn from_json(text: &str) -> Result<Option<RelayMessage>, MessageError> {
        let value: Value = serde_json::from_str(text)?;
        let array = value.as_array().ok_or(MessageError::NotAnArray)?;
        if array.is_empty() {
            return Ok(None);
        }

        let kind = array[0].as_str().ok_or(MessageError::MissingKind)?;

        match kind {
            "EVENT" => {
                if array.len() < 3 {
                    return Err(MessageError::TooShort("EVENT"));
                }
                let subscription_id = string_field(&array[1], "EVENT", "subscription id")?;
                let event: Event = serde_json::from_value(array[2].clone())
                    .map_err(|_| MessageError::InvalidField("EVENT", "payload"))?;
                Ok(Some(RelayMessage::Event {
                    subscription_id,
                    event,
                }))
            }
            "OK" => {
                if array.len() < 3 {
                    return Err(MessageError::TooShort("OK"));
                }
                let event_id = string_field(&array[1], "OK", "event id")?;
                let accepted = array[2]
                    .as_bool()
                    .ok_or(MessageError::InvalidField("OK", "accepted flag"))?;
                let message = match array.get(3) {
                    Some(value) => string_field(value, "OK", "message text")?,
                    None => String::new(),
                };
                Ok(Some(RelayMessage::Ok {
                    event_id,
                    accepted,
                    message,
                }))
            }
            "EOSE" => {
                if array.len() < 2 {
                    return Err(MessageError::TooShort("EOSE"));
                }
                let subscription_id = string_field(&array[1], "EOSE", "subscription id")?;
                Ok(Some(RelayMessage::Eose { subscription_id }))
            }
            "CLOSED" => {
                if array.len() < 2 {
                    return Err(MessageError::TooShort("CLOSED"));
                }
                let subscription_id = string_field(&array[1], "CLOSED", "subscription id")?;
                let message = match array.get(2) {
                    Some(value) => string_field(value, "CLOSED", "message text")?,
                    None => String::new(),
                };
                Ok(Some(RelayMessage::Closed {
                    subscription_id,
                    message,
                }))
            }
            "NOTICE" => {
                if array.len() < 2 {
                    return Err(MessageError::TooShort("NOTICE"));
                }
                let message = string_field(&array[1], "NOTICE", "message text")?;
                Ok(Some(RelayMessage::Notice { message }))
            }
            "AUTH" => {
                if array.len() < 2 {
                    return Err(MessageError::TooShort("AUTH"));
                }
                let challenge = string_field(&array[1], "AUTH", "challenge")?;
                Ok(Some(RelayMessage::Auth { challenge }))
            }
            _ => Ok(None),
        }
    }
}

fn string_field(
    value: &Value,
    message: &'static str,
    field: &'static str,
) -> Result<String, MessageError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or(MessageError::InvalidField(message, field))
}
