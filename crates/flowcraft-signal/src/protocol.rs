//! Wire messages. Must stay in step with the relay transport client.

use serde::{Deserialize, Serialize};

/// A message sent by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a room; the first joiner fixes its password
    Join {
        room: String,
        #[serde(default)]
        password: Option<String>,
        #[serde(default = "default_max_peers")]
        max_peers: usize,
    },
    /// Leave current room
    Leave,
    /// CRDT update bytes, base64 encoded. Relayed untouched.
    Sync { data: String },
    /// Presence message. Relayed untouched.
    Awareness { update: serde_json::Value },
}

fn default_max_peers() -> usize {
    usize::MAX
}

/// A message sent to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirm room join; `peer_count` includes the joiner
    Joined { room: String, peer_count: usize },
    PeerJoined { peer_id: String },
    PeerLeft { peer_id: String },
    /// `peer_id` missed relayed messages; peers answer with a full snapshot
    Resync { peer_id: String },
    Sync { from: String, data: String },
    Awareness {
        from: String,
        update: serde_json::Value,
    },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_defaults() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"join","room":"r"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Join {
                room: "r".into(),
                password: None,
                max_peers: usize::MAX,
            }
        );
    }

    #[test]
    fn test_awareness_payload_is_opaque() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "awareness",
            "update": {"type": "remove", "peer_id": 7, "clock": 2}
        }))
        .unwrap();
        let ClientMessage::Awareness { update } = msg else {
            panic!("expected awareness");
        };
        let relayed = ServerMessage::Awareness {
            from: "c1".into(),
            update,
        };
        let json = serde_json::to_value(&relayed).unwrap();
        assert_eq!(json["type"], "awareness");
        assert_eq!(json["update"]["peer_id"], 7);
    }

    #[test]
    fn test_resync_tag() {
        let json = serde_json::to_value(ServerMessage::Resync {
            peer_id: "c1".into(),
        })
        .unwrap();
        assert_eq!(json, json!({"type": "resync", "peer_id": "c1"}));
    }

    #[test]
    fn test_server_tags() {
        let json = serde_json::to_value(ServerMessage::PeerLeft {
            peer_id: "c1".into(),
        })
        .unwrap();
        assert_eq!(json, json!({"type": "peer_left", "peer_id": "c1"}));
    }
}
