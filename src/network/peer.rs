//! # Peer Identity and Role Election
//!
//! A session has exactly one remote peer, identified by an opaque string
//! id announced in `join` envelopes. Roles are elected deterministically so
//! both sides agree without a third round trip: the side with the
//! lexicographically larger id becomes the offerer.

/// What this side does in the handshake: create and send the SDP offer, or
/// wait for one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

/// Elect a role by comparing ids lexicographically, per the handshake rule
/// `myId > peerId` takes the offerer role.
pub fn elect_role(my_id: &str, peer_id: &str) -> Role {
    if my_id > peer_id {
        Role::Offerer
    } else {
        Role::Answerer
    }
}
