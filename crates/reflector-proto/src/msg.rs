//! Framed control-channel messages.
//!
//! One [`Msg`] per TCP frame. The first two bytes of a frame payload are
//! the message type tag; the rest is the message's own fields. Tags are
//! stable (they are the wire contract) and live in [`msg_type`] so both
//! encode and decode read from one place.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::wire::{get_array, get_string, get_u16, get_u32, put_blob, put_string};
use crate::{ProtoError, ProtoVer, CHALLENGE_LEN};

/// Stable numeric type tags for control-channel messages.
///
/// Never renumber an existing tag; only append.
pub mod msg_type {
    pub const HEARTBEAT: u16 = 1;
    pub const PROTO_VER: u16 = 5;
    pub const AUTH_CHALLENGE: u16 = 10;
    pub const AUTH_RESPONSE: u16 = 11;
    pub const AUTH_OK: u16 = 12;
    pub const ERROR: u16 = 13;
    pub const SERVER_INFO: u16 = 100;
    pub const NODE_INFO: u16 = 101;
    pub const NODE_JOINED: u16 = 102;
    pub const NODE_LEFT: u16 = 103;
    pub const TALKER_START_V1: u16 = 104;
    pub const TALKER_STOP_V1: u16 = 105;
    pub const SELECT_TG: u16 = 106;
    pub const TG_MONITOR: u16 = 107;
    pub const TALKER_START: u16 = 108;
    pub const TALKER_STOP: u16 = 109;
    pub const REQUEST_QSY: u16 = 110;
}

/// A control-channel message.
///
/// Direction notes match the protocol: the server announces its
/// capability with `ProtoVer` on accept, the client answers with its own;
/// `TalkerStart`/`TalkerStop` carry the talkgroup and are v2-only, while
/// the `…V1` variants carry just the callsign for v1 nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Msg {
    /// Keep-alive, both directions. Empty payload.
    Heartbeat,
    /// Protocol capability announcement, both directions.
    ProtoVer(ProtoVer),
    /// Server to client: random nonce to be signed with the shared key.
    AuthChallenge { challenge: [u8; CHALLENGE_LEN] },
    /// Client to server: callsign plus HMAC of the challenge.
    AuthResponse { callsign: String, digest: Bytes },
    /// Server to client: handshake completed.
    AuthOk,
    /// Server to client: terminal error, usually followed by disconnect.
    Error { message: String },
    /// Server to client: the assigned client id (needed on the datagram
    /// channel) and the callsigns currently connected.
    ServerInfo { client_id: u32, nodes: Vec<String> },
    /// Client to server: opaque node capabilities blob.
    NodeInfo { info: String },
    /// Roster delta: a node completed its handshake.
    NodeJoined { callsign: String },
    /// Roster delta: a node disconnected.
    NodeLeft { callsign: String },
    /// v1 talker event (the v1 protocol has a single implicit channel).
    TalkerStartV1 { callsign: String },
    TalkerStopV1 { callsign: String },
    /// Client to server: request membership of `tg` (0 = leave only).
    SelectTg { tg: u32 },
    /// Client to server: replace the set of monitored talkgroups.
    TgMonitor { tgs: Vec<u32> },
    /// v2 talker event, carries the talkgroup.
    TalkerStart { tg: u32, callsign: String },
    TalkerStop { tg: u32, callsign: String },
    /// Suggest a talkgroup change. Client to server to request one,
    /// server to clients to announce the chosen target.
    RequestQsy { tg: u32 },
    /// A type tag this implementation does not know. Ignored by upper
    /// layers so newer peers remain compatible.
    Unknown(u16),
}

impl Msg {
    /// The numeric type tag this message encodes with.
    pub fn type_tag(&self) -> u16 {
        match self {
            Msg::Heartbeat => msg_type::HEARTBEAT,
            Msg::ProtoVer(_) => msg_type::PROTO_VER,
            Msg::AuthChallenge { .. } => msg_type::AUTH_CHALLENGE,
            Msg::AuthResponse { .. } => msg_type::AUTH_RESPONSE,
            Msg::AuthOk => msg_type::AUTH_OK,
            Msg::Error { .. } => msg_type::ERROR,
            Msg::ServerInfo { .. } => msg_type::SERVER_INFO,
            Msg::NodeInfo { .. } => msg_type::NODE_INFO,
            Msg::NodeJoined { .. } => msg_type::NODE_JOINED,
            Msg::NodeLeft { .. } => msg_type::NODE_LEFT,
            Msg::TalkerStartV1 { .. } => msg_type::TALKER_START_V1,
            Msg::TalkerStopV1 { .. } => msg_type::TALKER_STOP_V1,
            Msg::SelectTg { .. } => msg_type::SELECT_TG,
            Msg::TgMonitor { .. } => msg_type::TG_MONITOR,
            Msg::TalkerStart { .. } => msg_type::TALKER_START,
            Msg::TalkerStop { .. } => msg_type::TALKER_STOP,
            Msg::RequestQsy { .. } => msg_type::REQUEST_QSY,
            Msg::Unknown(tag) => *tag,
        }
    }

    /// Encodes the message into a frame payload (type tag + fields).
    ///
    /// # Errors
    /// Returns [`ProtoError::Oversize`] if a variable-length field does
    /// not fit its `u16` length prefix.
    pub fn encode(&self) -> Result<Bytes, ProtoError> {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u16_le(self.type_tag());
        match self {
            Msg::Heartbeat | Msg::AuthOk | Msg::Unknown(_) => {}
            Msg::ProtoVer(ver) => {
                buf.put_u16_le(ver.major);
                buf.put_u16_le(ver.minor);
            }
            Msg::AuthChallenge { challenge } => {
                buf.put_slice(challenge);
            }
            Msg::AuthResponse { callsign, digest } => {
                put_string(&mut buf, callsign, "callsign")?;
                put_blob(&mut buf, digest, "digest")?;
            }
            Msg::Error { message } => {
                put_string(&mut buf, message, "message")?;
            }
            Msg::ServerInfo { client_id, nodes } => {
                buf.put_u32_le(*client_id);
                let count =
                    u16::try_from(nodes.len()).map_err(|_| ProtoError::Oversize("nodes"))?;
                buf.put_u16_le(count);
                for node in nodes {
                    put_string(&mut buf, node, "nodes")?;
                }
            }
            Msg::NodeInfo { info } => {
                put_string(&mut buf, info, "info")?;
            }
            Msg::NodeJoined { callsign }
            | Msg::NodeLeft { callsign }
            | Msg::TalkerStartV1 { callsign }
            | Msg::TalkerStopV1 { callsign } => {
                put_string(&mut buf, callsign, "callsign")?;
            }
            Msg::SelectTg { tg } | Msg::RequestQsy { tg } => {
                buf.put_u32_le(*tg);
            }
            Msg::TgMonitor { tgs } => {
                let count = u16::try_from(tgs.len()).map_err(|_| ProtoError::Oversize("tgs"))?;
                buf.put_u16_le(count);
                for tg in tgs {
                    buf.put_u32_le(*tg);
                }
            }
            Msg::TalkerStart { tg, callsign } | Msg::TalkerStop { tg, callsign } => {
                buf.put_u32_le(*tg);
                put_string(&mut buf, callsign, "callsign")?;
            }
        }
        Ok(buf.freeze())
    }

    /// Decodes one message from a frame payload.
    ///
    /// An unknown type tag decodes to [`Msg::Unknown`], never an error,
    /// so protocol extensions pass through old servers harmlessly.
    ///
    /// # Errors
    /// Returns [`ProtoError::Malformed`] if the payload is too short or a
    /// field is corrupt for the tagged type.
    pub fn decode(buf: &mut impl Buf) -> Result<Msg, ProtoError> {
        let tag = get_u16(buf, "type")?;
        let msg = match tag {
            msg_type::HEARTBEAT => Msg::Heartbeat,
            msg_type::PROTO_VER => Msg::ProtoVer(ProtoVer::new(
                get_u16(buf, "major")?,
                get_u16(buf, "minor")?,
            )),
            msg_type::AUTH_CHALLENGE => Msg::AuthChallenge {
                challenge: get_array(buf, "challenge")?,
            },
            msg_type::AUTH_RESPONSE => Msg::AuthResponse {
                callsign: get_string(buf, "callsign")?,
                digest: crate::wire::get_blob(buf, "digest")?,
            },
            msg_type::AUTH_OK => Msg::AuthOk,
            msg_type::ERROR => Msg::Error {
                message: get_string(buf, "message")?,
            },
            msg_type::SERVER_INFO => {
                let client_id = get_u32(buf, "client_id")?;
                let count = get_u16(buf, "nodes")?;
                let mut nodes = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    nodes.push(get_string(buf, "nodes")?);
                }
                Msg::ServerInfo { client_id, nodes }
            }
            msg_type::NODE_INFO => Msg::NodeInfo {
                info: get_string(buf, "info")?,
            },
            msg_type::NODE_JOINED => Msg::NodeJoined {
                callsign: get_string(buf, "callsign")?,
            },
            msg_type::NODE_LEFT => Msg::NodeLeft {
                callsign: get_string(buf, "callsign")?,
            },
            msg_type::TALKER_START_V1 => Msg::TalkerStartV1 {
                callsign: get_string(buf, "callsign")?,
            },
            msg_type::TALKER_STOP_V1 => Msg::TalkerStopV1 {
                callsign: get_string(buf, "callsign")?,
            },
            msg_type::SELECT_TG => Msg::SelectTg {
                tg: get_u32(buf, "tg")?,
            },
            msg_type::TG_MONITOR => {
                let count = get_u16(buf, "tgs")?;
                let mut tgs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    tgs.push(get_u32(buf, "tgs")?);
                }
                Msg::TgMonitor { tgs }
            }
            msg_type::TALKER_START => Msg::TalkerStart {
                tg: get_u32(buf, "tg")?,
                callsign: get_string(buf, "callsign")?,
            },
            msg_type::TALKER_STOP => Msg::TalkerStop {
                tg: get_u32(buf, "tg")?,
                callsign: get_string(buf, "callsign")?,
            },
            msg_type::REQUEST_QSY => Msg::RequestQsy {
                tg: get_u32(buf, "tg")?,
            },
            other => Msg::Unknown(other),
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Msg) {
        let bytes = msg.encode().expect("encode");
        let mut buf = bytes;
        let decoded = Msg::decode(&mut buf).expect("decode");
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_heartbeat_round_trip() {
        round_trip(Msg::Heartbeat);
    }

    #[test]
    fn test_proto_ver_round_trip() {
        round_trip(Msg::ProtoVer(ProtoVer::new(2, 0)));
    }

    #[test]
    fn test_auth_challenge_round_trip() {
        round_trip(Msg::AuthChallenge {
            challenge: [0xA5; CHALLENGE_LEN],
        });
    }

    #[test]
    fn test_auth_response_round_trip() {
        round_trip(Msg::AuthResponse {
            callsign: "SM0ABC".into(),
            digest: Bytes::from_static(&[1, 2, 3, 4]),
        });
    }

    #[test]
    fn test_server_info_round_trip() {
        round_trip(Msg::ServerInfo {
            client_id: 42,
            nodes: vec!["SM0ABC".into(), "DL1XYZ".into()],
        });
    }

    #[test]
    fn test_tg_monitor_round_trip() {
        round_trip(Msg::TgMonitor {
            tgs: vec![1, 42, 9999],
        });
        round_trip(Msg::TgMonitor { tgs: vec![] });
    }

    #[test]
    fn test_talker_events_round_trip() {
        round_trip(Msg::TalkerStart {
            tg: 42,
            callsign: "SM0ABC".into(),
        });
        round_trip(Msg::TalkerStop {
            tg: 42,
            callsign: "SM0ABC".into(),
        });
        round_trip(Msg::TalkerStartV1 {
            callsign: "SM0ABC".into(),
        });
        round_trip(Msg::TalkerStopV1 {
            callsign: "SM0ABC".into(),
        });
    }

    #[test]
    fn test_select_tg_and_qsy_round_trip() {
        round_trip(Msg::SelectTg { tg: 42 });
        round_trip(Msg::RequestQsy { tg: 0 });
    }

    #[test]
    fn test_unknown_tag_decodes_to_unknown() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(0x7777);
        buf.put_slice(b"future payload");
        let mut rd = buf.freeze();
        assert_eq!(Msg::decode(&mut rd).unwrap(), Msg::Unknown(0x7777));
    }

    #[test]
    fn test_empty_payload_is_malformed() {
        let mut buf = Bytes::new();
        assert!(Msg::decode(&mut buf).is_err());
    }

    #[test]
    fn test_truncated_known_message_is_malformed() {
        // A SelectTg with only two of its four tg bytes.
        let mut buf = BytesMut::new();
        buf.put_u16_le(msg_type::SELECT_TG);
        buf.put_u16_le(42);
        let mut rd = buf.freeze();
        assert!(matches!(
            Msg::decode(&mut rd),
            Err(ProtoError::Malformed(_))
        ));
    }

    #[test]
    fn test_type_tags_are_unique() {
        let msgs = [
            Msg::Heartbeat,
            Msg::ProtoVer(ProtoVer::new(2, 0)),
            Msg::AuthChallenge {
                challenge: [0; CHALLENGE_LEN],
            },
            Msg::AuthResponse {
                callsign: String::new(),
                digest: Bytes::new(),
            },
            Msg::AuthOk,
            Msg::Error {
                message: String::new(),
            },
            Msg::ServerInfo {
                client_id: 0,
                nodes: vec![],
            },
            Msg::NodeInfo {
                info: String::new(),
            },
            Msg::NodeJoined {
                callsign: String::new(),
            },
            Msg::NodeLeft {
                callsign: String::new(),
            },
            Msg::TalkerStartV1 {
                callsign: String::new(),
            },
            Msg::TalkerStopV1 {
                callsign: String::new(),
            },
            Msg::SelectTg { tg: 0 },
            Msg::TgMonitor { tgs: vec![] },
            Msg::TalkerStart {
                tg: 0,
                callsign: String::new(),
            },
            Msg::TalkerStop {
                tg: 0,
                callsign: String::new(),
            },
            Msg::RequestQsy { tg: 0 },
        ];
        let mut tags: Vec<u16> = msgs.iter().map(Msg::type_tag).collect();
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), msgs.len(), "duplicate type tag");
    }
}
