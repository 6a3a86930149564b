//! Engine.IO v4 / Socket.IO v5 text packets.
//!
//! Only the default namespace and text frames are used by the backend, so
//! binary attachments are not supported.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Handshake sent by the server in the Engine.IO `open` packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInfo {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload: Option<u64>,
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_ping_timeout() -> u64 {
    20_000
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// `0{...}`
    Open(OpenInfo),
    /// `1`
    Close,
    /// `2`
    Ping,
    /// `3`
    Pong,
    /// `6`
    Noop,
    /// `40` / `40{...}`
    Connect(Option<Value>),
    /// `41`
    Disconnect,
    /// `42[name, payload]`, with an optional ack id before the array.
    Event {
        name: String,
        payload: Value,
        ack: Option<u64>,
    },
    /// `43<id>[...]`
    Ack { id: u64, payload: Value },
    /// `44{...}`
    ConnectError(Value),
}

impl Packet {
    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        Packet::Event {
            name: name.into(),
            payload,
            ack: None,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Packet::Open(info) => {
                format!("0{}", serde_json::to_string(info).unwrap_or_default())
            }
            Packet::Close => "1".to_string(),
            Packet::Ping => "2".to_string(),
            Packet::Pong => "3".to_string(),
            Packet::Noop => "6".to_string(),
            Packet::Connect(None) => "40".to_string(),
            Packet::Connect(Some(auth)) => format!("40{auth}"),
            Packet::Disconnect => "41".to_string(),
            Packet::Event { name, payload, ack } => {
                let body = Value::Array(vec![Value::String(name.clone()), payload.clone()]);
                match ack {
                    Some(id) => format!("42{id}{body}"),
                    None => format!("42{body}"),
                }
            }
            Packet::Ack { id, payload } => format!("43{id}{}", Value::Array(vec![payload.clone()])),
            Packet::ConnectError(data) => format!("44{data}"),
        }
    }

    pub fn decode(text: &str) -> SyncResult<Packet> {
        let mut chars = text.chars();
        let kind = chars
            .next()
            .ok_or_else(|| SyncError::Socket("empty packet".into()))?;
        let rest = chars.as_str();

        match kind {
            '0' => Ok(Packet::Open(serde_json::from_str(rest)?)),
            '1' => Ok(Packet::Close),
            '2' => Ok(Packet::Ping),
            '3' => Ok(Packet::Pong),
            '4' => decode_message(rest),
            '6' => Ok(Packet::Noop),
            other => Err(SyncError::Socket(format!(
                "unsupported engine packet type {other:?}"
            ))),
        }
    }
}

fn decode_message(text: &str) -> SyncResult<Packet> {
    let mut chars = text.chars();
    let kind = chars
        .next()
        .ok_or_else(|| SyncError::Socket("empty socket packet".into()))?;
    let mut rest = chars.as_str();

    // Non-default namespace: "/admin,..."
    if rest.starts_with('/') {
        rest = match rest.find(',') {
            Some(idx) => &rest[idx + 1..],
            None => "",
        };
    }

    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    let ack = if digits > 0 {
        rest[..digits].parse::<u64>().ok()
    } else {
        None
    };
    let data = &rest[digits..];

    match kind {
        '0' => {
            if data.is_empty() {
                Ok(Packet::Connect(None))
            } else {
                Ok(Packet::Connect(Some(serde_json::from_str(data)?)))
            }
        }
        '1' => Ok(Packet::Disconnect),
        '2' => {
            let mut items = match serde_json::from_str::<Value>(data)? {
                Value::Array(items) => items.into_iter(),
                _ => return Err(SyncError::Socket("event payload is not an array".into())),
            };
            let name = match items.next() {
                Some(Value::String(name)) => name,
                _ => return Err(SyncError::Socket("event without a name".into())),
            };
            Ok(Packet::Event {
                name,
                payload: items.next().unwrap_or(Value::Null),
                ack,
            })
        }
        '3' => {
            let payload = match serde_json::from_str::<Value>(data)? {
                Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
                _ => Value::Null,
            };
            Ok(Packet::Ack {
                id: ack.unwrap_or_default(),
                payload,
            })
        }
        '4' => Ok(Packet::ConnectError(if data.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(data)?
        })),
        other => Err(SyncError::Socket(format!(
            "unsupported socket packet type {other:?}"
        ))),
    }
}
