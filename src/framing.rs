//! # Framing Codec
//!
//! Two frame families share the data channel: binary frames carrying chunk
//! payloads, and JSON control envelopes carrying the handshake messages of
//! §4.1. This module implements Layout A: `u32` big-endian `file_index`
//! header followed by the raw payload, with chunk index implicit from
//! per-file receive order under an ordered transport.

use crate::config::HEADER_SIZE;
use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Control envelope discriminants, per the handshake table. Unknown `type`
/// values are tolerated by [`decode_control`] rather than rejected, so a
/// future message kind doesn't fail an older peer's session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    OfferBatch { meta: crate::types::BatchMeta },
    AcceptBatch,
    FileStart { meta: crate::types::FileMeta },
    ReadyForFile { file_index: u32 },
    FileEnd { file_index: u32 },
    AckFile { file_index: u32 },
    ProgressSync {
        transferred_bytes: u64,
        speed: f64,
        eta: String,
        completed_files: u32,
        total_files: u32,
    },
}

/// Encode a control message as UTF-8 JSON text, ready for a text-mode send
/// on the control channel.
pub fn encode_control(msg: &ControlMessage) -> Result<String> {
    Ok(serde_json::to_string(msg)?)
}

/// Decode a control message, tolerating unknown `type` discriminants by
/// returning `Ok(None)` (logged by the caller) instead of an error — this
/// is what lets older and newer peers share a session on forward-compatible
/// extensions.
pub fn decode_control(text: &str) -> Result<Option<ControlMessage>> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    match serde_json::from_value::<ControlMessage>(value.clone()) {
        Ok(msg) => Ok(Some(msg)),
        Err(_) => {
            let kind = value.get("type").and_then(|v| v.as_str()).unwrap_or("<missing>");
            tracing::warn!(kind, "dropping unrecognized control message");
            Ok(None)
        }
    }
}

/// Encode a binary frame: 4-byte big-endian `file_index` header followed by
/// the payload.
pub fn encode_binary_frame(file_index: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&file_index.to_be_bytes());
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Decode a binary frame into its `file_index` header and payload slice. A
/// frame shorter than `HEADER_SIZE` is malformed; the caller logs and drops
/// it, never aborting the session over one bad frame.
pub fn decode_binary_frame(frame: &[u8]) -> Result<(u32, &[u8])> {
    if frame.len() < HEADER_SIZE {
        return Err(Error::MalformedFrame(format!(
            "frame of {} bytes is shorter than the {}-byte header",
            frame.len(),
            HEADER_SIZE
        )));
    }
    let (header, payload) = frame.split_at(HEADER_SIZE);
    let file_index = u32::from_be_bytes(header.try_into().expect("split_at(4) yields a 4-byte slice"));
    Ok((file_index, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BatchMeta, FileMeta};

    #[test]
    fn binary_frame_round_trips() {
        let frame = encode_binary_frame(7, b"hello world");
        let (file_index, payload) = decode_binary_frame(&frame).unwrap();
        assert_eq!(file_index, 7);
        assert_eq!(payload, b"hello world");
    }

    #[test]
    fn short_frame_is_malformed() {
        let err = decode_binary_frame(&[0, 1]).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(_)));
    }

    #[test]
    fn control_message_round_trips() {
        let msg = ControlMessage::OfferBatch {
            meta: BatchMeta { total_files: 2, total_size: 2048 },
        };
        let json = encode_control(&msg).unwrap();
        assert!(json.contains("\"type\":\"offer-batch\""));
        let decoded = decode_control(&json).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn file_start_round_trips_with_meta() {
        let msg = ControlMessage::FileStart {
            meta: FileMeta {
                name: "a.bin".into(),
                size: 100,
                mime: "application/octet-stream".into(),
                total_chunks: 2,
                file_index: 0,
            },
        };
        let json = encode_control(&msg).unwrap();
        let decoded = decode_control(&json).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn unknown_control_type_is_tolerated() {
        let json = r#"{"type":"future-extension","foo":"bar"}"#;
        let decoded = decode_control(json).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn malformed_json_is_an_error() {
        let err = decode_control("not json").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
