//! Wire protocol for the reflector.
//!
//! Two message families share a header shape:
//!
//! - the framed TCP control channel carries one message per frame,
//!   `u16 type` + payload, wrapped in a length-prefixed frame
//!   ([`FrameCodec`]);
//! - the UDP datagram channel carries `u16 type, u16 sequence,
//!   u32 client_id` + payload, delimited by the datagram itself
//!   ([`UdpHeader`], [`UdpMsg`]).
//!
//! All integers are little-endian. Decoding never fails on an unknown
//! message type: unknown tags decode to `Unknown` variants that upper
//! layers ignore, so new messages can be added without breaking old
//! peers. Short or corrupt payloads of known types fail with
//! [`ProtoError::Malformed`].

mod error;
mod frame;
mod msg;
mod types;
mod udp;
mod wire;

pub use error::ProtoError;
pub use frame::{FrameCodec, MAX_FRAME_LEN};
pub use msg::{msg_type, Msg};
pub use types::{ClientId, ProtoVer};
pub use udp::{udp_msg_type, UdpHeader, UdpMsg, UDP_HEADER_LEN};

/// Length in bytes of the authentication challenge nonce.
pub const CHALLENGE_LEN: usize = 20;
