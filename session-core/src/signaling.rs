use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages sent from client to server over the signaling channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        session_id: String,
    },
    Answer {
        answer: SessionDescription,
    },
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        candidate: String,
        #[serde(rename = "sdpMid")]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex")]
        sdp_mline_index: Option<u16>,
    },
    Ping,
    #[serde(rename = "quality:set")]
    QualitySet { quality: u8 },
    #[serde(rename = "fps:set")]
    FpsSet { fps: u8 },
}

/// Messages sent from server to client over the signaling channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Offer {
        offer: SessionDescription,
    },
    Ready,
    Pong,
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Generate a unique peer id for a signaling connection.
pub fn generate_peer_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn join_message_parses() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"join","session_id":"abc"}"#).unwrap();
        matches!(msg, ClientMessage::Join { session_id } if session_id == "abc");
    }

    #[test_timeout::timeout]
    fn ice_candidate_message_parses() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"ice-candidate","candidate":"cand","sdpMid":"0","sdpMLineIndex":0}"#,
        )
        .unwrap();
        assert!(matches!(msg, ClientMessage::IceCandidate { .. }));
    }

    #[test_timeout::timeout]
    fn error_message_serializes_with_tag() {
        let msg = ServerMessage::Error {
            message: "nope".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("\"message\":\"nope\""));
    }

    #[test_timeout::timeout]
    fn peer_ids_are_unique() {
        assert_ne!(generate_peer_id(), generate_peer_id());
    }

    #[test_timeout::timeout]
    fn quality_set_message_parses() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"quality:set","quality":60}"#).unwrap();
        assert!(matches!(msg, ClientMessage::QualitySet { quality: 60 }));
    }
}
