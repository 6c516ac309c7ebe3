//! Datagram-channel messages.
//!
//! Every datagram starts with the fixed [`UdpHeader`]: type tag, per-peer
//! sequence number, and the sender's client id. The sequence number is
//! assigned in strict send order per peer and wraps mod 2^16; the
//! receiving side's acceptance policy lives with the client state, not
//! here. The payload after the header belongs to the tagged message.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::wire::{get_blob, get_u16, get_u32, put_blob};
use crate::{ClientId, ProtoError};

/// Stable numeric type tags for datagram messages.
pub mod udp_msg_type {
    pub const HEARTBEAT: u16 = 1;
    pub const AUDIO: u16 = 101;
    pub const FLUSH_SAMPLES: u16 = 102;
    pub const ALL_SAMPLES_FLUSHED: u16 = 103;
}

/// Size in bytes of the encoded datagram header.
pub const UDP_HEADER_LEN: usize = 8;

/// The fixed header carried by every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub msg_type: u16,
    pub sequence: u16,
    pub client_id: ClientId,
}

impl UdpHeader {
    /// Decodes the header, leaving `buf` positioned at the payload.
    ///
    /// # Errors
    /// Returns [`ProtoError::Malformed`] on a datagram shorter than the
    /// header. An unknown `msg_type` is not an error here; dispatch
    /// decides what to do with it.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        Ok(Self {
            msg_type: get_u16(buf, "type")?,
            sequence: get_u16(buf, "sequence")?,
            client_id: ClientId(get_u32(buf, "client_id")?),
        })
    }

    fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.msg_type);
        buf.put_u16_le(self.sequence);
        buf.put_u32_le(self.client_id.0);
    }
}

/// A datagram-channel message (header fields excluded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpMsg {
    /// Liveness probe; also used to complete UDP path discovery.
    Heartbeat,
    /// One block of codec-compressed audio from the current talker.
    Audio { audio: Bytes },
    /// End-of-transmission marker from the talker.
    FlushSamples,
    /// Acknowledgement that buffered samples have been played out.
    AllSamplesFlushed,
    /// Unknown type tag; ignored for forward compatibility.
    Unknown(u16),
}

impl UdpMsg {
    pub fn type_tag(&self) -> u16 {
        match self {
            UdpMsg::Heartbeat => udp_msg_type::HEARTBEAT,
            UdpMsg::Audio { .. } => udp_msg_type::AUDIO,
            UdpMsg::FlushSamples => udp_msg_type::FLUSH_SAMPLES,
            UdpMsg::AllSamplesFlushed => udp_msg_type::ALL_SAMPLES_FLUSHED,
            UdpMsg::Unknown(tag) => *tag,
        }
    }

    /// Encodes a full datagram: header with the given sequence number and
    /// sender/receiver-side client id, then the payload.
    pub fn encode(&self, sequence: u16, client_id: ClientId) -> Result<Bytes, ProtoError> {
        let mut buf = BytesMut::with_capacity(UDP_HEADER_LEN + 32);
        UdpHeader {
            msg_type: self.type_tag(),
            sequence,
            client_id,
        }
        .encode_into(&mut buf);
        match self {
            UdpMsg::Heartbeat
            | UdpMsg::FlushSamples
            | UdpMsg::AllSamplesFlushed
            | UdpMsg::Unknown(_) => {}
            UdpMsg::Audio { audio } => put_blob(&mut buf, audio, "audio")?,
        }
        Ok(buf.freeze())
    }

    /// Decodes the payload for an already-decoded header.
    ///
    /// # Errors
    /// Returns [`ProtoError::Malformed`] when the payload is short or
    /// corrupt for the header's type.
    pub fn decode(msg_type: u16, buf: &mut impl Buf) -> Result<UdpMsg, ProtoError> {
        let msg = match msg_type {
            udp_msg_type::HEARTBEAT => UdpMsg::Heartbeat,
            udp_msg_type::AUDIO => UdpMsg::Audio {
                audio: get_blob(buf, "audio")?,
            },
            udp_msg_type::FLUSH_SAMPLES => UdpMsg::FlushSamples,
            udp_msg_type::ALL_SAMPLES_FLUSHED => UdpMsg::AllSamplesFlushed,
            other => UdpMsg::Unknown(other),
        };
        Ok(msg)
    }
}
