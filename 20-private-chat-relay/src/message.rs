use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Frames a client may send. Each WebSocket text frame carries one JSON
/// object tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Login {
        username: String,
    },
    PrivateMessage {
        to: String,
        message: String,
    },
    Typing {
        to: String,
    },
    /// Any `type` this relay does not understand.
    #[serde(other)]
    Unknown,
}

/// Frames the relay sends to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    PrivateMessage {
        from: String,
        message: String,
        timestamp: String,
    },
    Typing {
        from: String,
    },
    Delivered {
        to: String,
        message: String,
        timestamp: String,
    },
    System {
        message: String,
    },
    UserList {
        users: Vec<String>,
    },
}

impl ServerFrame {
    pub fn system(message: impl Into<String>) -> Self {
        Self::System {
            message: message.into(),
        }
    }
}

pub fn parse_client_frame(text: &str) -> Result<ClientFrame, RelayError> {
    Ok(serde_json::from_str(text)?)
}

pub fn encode_frame<T: Serialize>(frame: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

/// Hour and minute of the local clock, e.g. `14:07`.
pub fn timestamp() -> String {
    Local::now().format("%H:%M").to_string()
}
