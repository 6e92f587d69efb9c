//! Protobuf wire types for the client/replica protocol.
//!
//! Generated from `proto/defl.proto` by `prost-build` (see `build.rs`).
//! This crate only owns message shapes and the small amount of glue
//! (UUID generation, constructors) that every caller would otherwise
//! duplicate; it does not know about sockets or framing.

#![allow(clippy::derive_partial_eq_without_eq)]

include!(concat!(env!("OUT_DIR"), "/defl.rs"));

use uuid::Uuid;

impl ClientRequest {
    pub fn update_weights(client_name: impl Into<String>, target_epoch_id: u64, weights: Vec<u8>) -> Self {
        ClientRequest {
            method: client_request::Method::UpdWeights as i32,
            request_uuid: Uuid::new_v4().to_string(),
            client_name: client_name.into(),
            target_epoch_id: Some(target_epoch_id),
            weights: Some(weights),
        }
    }

    pub fn new_epoch_vote(client_name: impl Into<String>, target_epoch_id: u64) -> Self {
        ClientRequest {
            method: client_request::Method::NewEpochVote as i32,
            request_uuid: Uuid::new_v4().to_string(),
            client_name: client_name.into(),
            target_epoch_id: Some(target_epoch_id),
            weights: None,
        }
    }
}

impl ObsidoRequest {
    pub fn client_register(client_name: impl Into<String>, register_info: RegisterInfo) -> Self {
        ObsidoRequest {
            method: obsido_request::Method::ClientRegister as i32,
            request_uuid: Uuid::new_v4().to_string(),
            client_name: client_name.into(),
            register_info: Some(register_info),
        }
    }

    pub fn fetch_w_last(client_name: impl Into<String>) -> Self {
        ObsidoRequest {
            method: obsido_request::Method::FetchWLast as i32,
            request_uuid: Uuid::new_v4().to_string(),
            client_name: client_name.into(),
            register_info: None,
        }
    }
}

impl Response {
    pub fn request_uuid_parsed(&self) -> Result<Uuid, uuid::Error> {
        Uuid::parse_str(&self.request_uuid)
    }

    pub fn is_ok(&self) -> bool {
        self.stat == response::Status::Ok as i32
    }

    /// `OK` and `NOT_MEET_QUORUM_WAIT` are the two acceptable terminal
    /// statuses for a vote, per the epoch loop's failure semantics.
    pub fn is_vote_accepted(&self) -> bool {
        self.stat == response::Status::Ok as i32
            || self.stat == response::Status::NotMeetQuorumWait as i32
    }
}

/// The literal 3-byte ASCII ack frame exchanged immediately after every
/// transmitted request, before any `Response`/`WeightsResponse` arrives.
pub const ACK: &[u8] = b"Ack";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_weights_roundtrips_method_and_payload() {
        let req = ClientRequest::update_weights("alice", 7, vec![1, 2, 3]);
        assert_eq!(req.method, client_request::Method::UpdWeights as i32);
        assert_eq!(req.target_epoch_id, Some(7));
        assert_eq!(req.weights.as_deref(), Some(&[1u8, 2, 3][..]));
        assert!(Uuid::parse_str(&req.request_uuid).is_ok());
    }

    #[test]
    fn vote_accepts_ok_and_quorum_wait_only() {
        let mut r = Response {
            request_uuid: String::new(),
            response_uuid: String::new(),
            stat: response::Status::Ok as i32,
            r_last_epoch_id: None,
        };
        assert!(r.is_vote_accepted());
        r.stat = response::Status::NotMeetQuorumWait as i32;
        assert!(r.is_vote_accepted());
        r.stat = response::Status::Error as i32;
        assert!(!r.is_vote_accepted());
    }
}
