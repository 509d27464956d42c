//! # Signaling Envelope
//!
//! JSON messages exchanged over the out-of-band signaling transport before
//! the data channel exists, following the shape of the teacher's
//! `RelayClientMessage`/`RelayServerMessage` pair but trimmed to the four
//! variants the handshake actually needs: room join announcements and SDP
//! offer/answer/candidate exchange.

use serde::{Deserialize, Serialize};

/// A signaling message. `sender_id` is compared against the local peer id
/// by the caller so self-sent announcements are ignored, per the handshake
/// rule that envelopes with `senderId == myId` are dropped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum SignalingEnvelope {
    Join { sender_id: String, room_code: String },
    Offer { sender_id: String, offer: String },
    Answer { sender_id: String, answer: String },
    Candidate { sender_id: String, candidate: String },
}

impl SignalingEnvelope {
    pub fn sender_id(&self) -> &str {
        match self {
            SignalingEnvelope::Join { sender_id, .. }
            | SignalingEnvelope::Offer { sender_id, .. }
            | SignalingEnvelope::Answer { sender_id, .. }
            | SignalingEnvelope::Candidate { sender_id, .. } => sender_id,
        }
    }
}

/// Generate a six-digit decimal room code, uniform over `[100000, 999999]`.
pub fn generate_room_code() -> String {
    use rand::Rng;
    let code: u32 = rand::thread_rng().gen_range(100_000..=999_999);
    code.to_string()
}
