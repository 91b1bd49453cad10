//! # Tunnel Frames
//!
//! Defines the two message kinds exchanged over the tunnel. Messages are
//! serialized as JSON using serde's internally-tagged representation
//! (a `"type"` field), the same convention this codebase uses for every
//! other websocket protocol.
//!
//! `Register` is sent exactly once, by the agent, immediately after the
//! tunnel connects. `Retransmit` carries a full HTTP/1.1 message (request
//! or response, direction implied by who is reading) as a base64 body;
//! it is reused for both directions so the framing stays symmetric.

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Sent once by the agent right after connecting, advertising every
    /// routing key it is prepared to serve.
    Register { keys: Vec<String> },

    /// Carries one HTTP/1.1 message end to end through the tunnel.
    /// `key` identifies the routing key the exchange belongs to, `id`
    /// correlates the request with its eventual response, and `body`
    /// is the raw wire-form bytes produced by [`crate::http_wire`].
    Retransmit {
        key: String,
        id: String,
        #[serde(with = "base64_body")]
        body: Vec<u8>,
    },
}

/// Serializes a `Vec<u8>` field as a base64 string, per the wire format
/// in the external interface: `{"body": "<base64-encoded bytes>"}`.
mod base64_body {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_frame_round_trips() {
        let frame = Frame::Register {
            keys: vec!["/a".to_string(), "/b".to_string()],
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"type":"register","keys":["/a","/b"]}"#);

        let decoded: Frame = serde_json::from_str(&json).unwrap();
        match decoded {
            Frame::Register { keys } => assert_eq!(keys, vec!["/a", "/b"]),
            _ => panic!("expected Register"),
        }
    }

    #[test]
    fn retransmit_frame_base64_encodes_body() {
        let frame = Frame::Retransmit {
            key: "/hello".to_string(),
            id: "abc-123".to_string(),
            body: b"GET / HTTP/1.1\r\n\r\n".to_vec(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"key\":\"/hello\""));
        assert!(json.contains("\"id\":\"abc-123\""));

        let decoded: Frame = serde_json::from_str(&json).unwrap();
        match decoded {
            Frame::Retransmit { body, .. } => {
                assert_eq!(body, b"GET / HTTP/1.1\r\n\r\n".to_vec())
            }
            _ => panic!("expected Retransmit"),
        }
    }

    #[test]
    fn malformed_json_is_rejected() {
        let result: Result<Frame, _> = serde_json::from_str("{not json");
        assert!(result.is_err());
    }
}
