//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};

use crate::replication::Envelope;
use crate::session::{AuthorityRole, ParticipantId};

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Movement input, held until the next one arrives
    Drive {
        /// -1.0 = full reverse, 1.0 = full forward
        throttle: f32,
        /// -1.0 = full left, 1.0 = full right
        turn: f32,
    },

    /// Launch a shell; force is clamped to the configured range
    Fire { launch_force: f32 },

    /// Toggle readiness for the next match
    Ready { ready: bool },

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },

    Leave,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// First message on a connection: identity plus every live cell
    Welcome {
        participant_id: ParticipantId,
        role: AuthorityRole,
        server_time: u64,
        snapshot: Vec<Envelope>,
    },

    /// One envelope from the replication stream
    Replication { envelope: Envelope },

    Error { code: String, message: String },

    Pong {
        /// Echoed client timestamp
        t: u64,
        server_time: u64,
    },
}

impl ServerMsg {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_messages_parse() {
        let msg: ClientMsg =
            serde_json::from_str(r#"{"type":"drive","throttle":1.0,"turn":-0.5}"#).unwrap();
        assert!(matches!(msg, ClientMsg::Drive { throttle, turn } if throttle == 1.0 && turn == -0.5));

        let msg: ClientMsg = serde_json::from_str(r#"{"type":"ready","ready":true}"#).unwrap();
        assert!(matches!(msg, ClientMsg::Ready { ready: true }));

        let msg: ClientMsg = serde_json::from_str(r#"{"type":"leave"}"#).unwrap();
        assert!(matches!(msg, ClientMsg::Leave));

        assert!(serde_json::from_str::<ClientMsg>(r#"{"type":"teleport"}"#).is_err());
    }

    #[test]
    fn test_replication_message_wraps_envelope() {
        let msg = ServerMsg::Replication {
            envelope: Envelope::CellRetired {
                cell: "entity.1.health".to_string(),
            },
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], json!("replication"));
        assert_eq!(value["envelope"]["cell"], json!("entity.1.health"));
    }
}
