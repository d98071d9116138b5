//! Wire types shared by the server transport and the stream client.
//!
//! Output frames and input chunks travel as JSON objects with camelCase field
//! names. Payload bytes are carried base64-encoded in a `dataBase64` field so
//! arbitrary (non-UTF-8) terminal output survives the trip.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// WebSocket close code sent when the requested session does not exist.
///
/// Clients must treat this as terminal and never reconnect.
pub const CLOSE_NO_SUCH_SESSION: u16 = 1008;

/// Close reason paired with [`CLOSE_NO_SUCH_SESSION`].
pub const NO_SUCH_SESSION_REASON: &str = "no such session";

/// WebSocket close code sent when a subscriber fell too far behind and was
/// dropped from the bus. The client resumes with `from=<lastSeq>`.
pub const CLOSE_SUBSCRIBER_LAGGED: u16 = 1013;

/// Close reason paired with [`CLOSE_SUBSCRIBER_LAGGED`].
pub const SUBSCRIBER_LAGGED_REASON: &str = "subscriber lagged";

/// One sequenced chunk of a session's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputFrame {
    pub session_id: String,
    /// Strictly increasing per session, starting at 1.
    pub seq: u64,
    /// Creation time, milliseconds since the Unix epoch.
    pub ts: i64,
    #[serde(rename = "dataBase64", with = "base64_bytes")]
    pub data: Bytes,
}

/// One chunk of client input.
///
/// `seq` is the client's own counter; the server does not deduplicate by it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputChunk {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub seq: u64,
    #[serde(rename = "dataBase64", with = "base64_bytes")]
    pub data: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_final: Option<bool>,
}

/// Response body of the scrollback endpoint.
///
/// `to` is the last frame's seq, or `from` itself when nothing matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrollbackResponse {
    pub from: u64,
    pub to: u64,
    pub frames: Vec<OutputFrame>,
}

impl ScrollbackResponse {
    pub fn new(from: u64, frames: Vec<OutputFrame>) -> Self {
        let to = frames.last().map_or(from, |f| f.seq);
        Self { from, to, frames }
    }
}

/// Serde adapter for `Bytes` fields carried as standard base64 strings.
pub mod base64_bytes {
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_frame_uses_camel_case_wire_names() {
        let frame = OutputFrame {
            session_id: "abc".into(),
            seq: 7,
            ts: 1_700_000_000_000,
            data: Bytes::from_static(b"hi\n"),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["sessionId"], "abc");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["ts"], 1_700_000_000_000i64);
        assert_eq!(json["dataBase64"], "aGkK");
    }

    #[test]
    fn output_frame_preserves_binary_payload() {
        let frame = OutputFrame {
            session_id: "abc".into(),
            seq: 1,
            ts: 0,
            data: Bytes::from_static(&[0xff, 0x00, 0x1b, b'[']),
        };
        let text = serde_json::to_string(&frame).unwrap();
        let back: OutputFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn input_chunk_parses_minimal_client_message() {
        let chunk: InputChunk =
            serde_json::from_str(r#"{"sessionId":"s","seq":3,"dataBase64":"bHMK"}"#).unwrap();
        assert_eq!(chunk.seq, 3);
        assert_eq!(chunk.data, Bytes::from_static(b"ls\n"));
        assert_eq!(chunk.is_final, None);
    }

    #[test]
    fn input_chunk_rejects_invalid_base64() {
        let result = serde_json::from_str::<InputChunk>(r#"{"sessionId":"s","seq":1,"dataBase64":"!!"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn input_chunk_requires_payload() {
        let result = serde_json::from_str::<InputChunk>(r#"{"sessionId":"s","seq":1}"#);
        assert!(result.is_err());
    }

    #[test]
    fn scrollback_response_to_defaults_to_from_when_empty() {
        let resp = ScrollbackResponse::new(42, vec![]);
        assert_eq!(resp.to, 42);
        assert!(resp.frames.is_empty());
    }

    #[test]
    fn scrollback_response_to_is_last_frame_seq() {
        let frames = (5..=7)
            .map(|seq| OutputFrame {
                session_id: "s".into(),
                seq,
                ts: 0,
                data: Bytes::new(),
            })
            .collect();
        let resp = ScrollbackResponse::new(4, frames);
        assert_eq!(resp.from, 4);
        assert_eq!(resp.to, 7);
    }
}
