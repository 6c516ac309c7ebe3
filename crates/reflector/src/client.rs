//! Per-connection client state.
//!
//! A [`Client`] is the reflector core's record of one connected node:
//! identity, negotiated protocol generation, connection state, UDP
//! addressing and sequencing, talkgroup selection, and the outbound
//! channel to the connection's writer task. All of it is owned and
//! mutated by the core task only.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::Bytes;
use reflector_proto::{ClientId, Msg, ProtoVer, UdpMsg, CHALLENGE_LEN};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Window for repeating a malformed-datagram warning for one message
/// type from one client.
const DECODE_WARN_INTERVAL: Duration = Duration::from_secs(60);

/// Connection state of a client session.
///
/// ```text
/// Connecting ── send ProtoVer ──► Handshaking ── recv ProtoVer ──►
/// AwaitAuthResp ── verified ──► Connected ── disconnect ──► Destroying
/// ```
///
/// Audio only flows to and from `Connected` clients; the earlier states
/// never appear in a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConState {
    Connecting,
    Handshaking,
    AwaitAuthResp,
    Connected,
    Destroying,
}

/// Why a client session ended. Logged with the disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DisconnectReason {
    PeerClosed,
    ProtocolError,
    AuthFailed,
    IdleTimeout,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PeerClosed => "connection closed by peer",
            Self::ProtocolError => "protocol error",
            Self::AuthFailed => "authentication failed",
            Self::IdleTimeout => "idle timeout",
        };
        f.write_str(s)
    }
}

/// Commands for a connection's writer task.
pub(crate) enum ConnCmd {
    /// Send one encoded frame payload.
    Frame(Bytes),
    /// Flush and shut the socket down.
    Close,
}

/// Outcome of checking an inbound datagram sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SeqCheck {
    /// Exactly the expected sequence number.
    InOrder,
    /// Ahead of the expected number: accepted, with this many datagrams
    /// missing in between.
    Lost(u16),
    /// Behind the expected number (or implausibly far ahead): dropped.
    OutOfSequence,
}

/// One connected node.
pub struct Client {
    pub(crate) id: ClientId,
    pub(crate) con_state: ConState,
    /// Negotiated protocol generation; `None` until the client has
    /// announced its version.
    pub(crate) proto_ver: Option<ProtoVer>,
    /// Empty until authentication completes.
    pub(crate) callsign: String,
    pub(crate) remote_host: IpAddr,
    pub(crate) remote_tcp_port: u16,
    /// 0 until the first datagram reveals the peer's UDP source port.
    pub(crate) remote_udp_port: u16,
    pub(crate) next_udp_rx_seq: u16,
    pub(crate) next_udp_tx_seq: u16,
    /// Cached current talkgroup (0 = none); the TG handler's membership
    /// maps are authoritative, this copy is what broadcast filters read.
    pub(crate) current_tg: u32,
    pub(crate) monitored_tgs: BTreeSet<u32>,
    /// Opaque capabilities blob announced by the node.
    pub(crate) node_info: String,
    /// Nonce for the challenge/response handshake.
    pub(crate) challenge: [u8; CHALLENGE_LEN],
    /// Last inbound traffic on either channel.
    pub(crate) last_rx: Instant,
    pub(crate) last_tcp_tx: Instant,
    pub(crate) last_udp_tx: Instant,
    frame_tx: mpsc::UnboundedSender<ConnCmd>,
    reader_abort: Option<AbortHandle>,
    decode_warns: HashMap<u16, Instant>,
}

impl Client {
    pub(crate) fn new(
        id: ClientId,
        addr: SocketAddr,
        frame_tx: mpsc::UnboundedSender<ConnCmd>,
        reader_abort: Option<AbortHandle>,
        challenge: [u8; CHALLENGE_LEN],
        now: Instant,
    ) -> Self {
        Self {
            id,
            con_state: ConState::Connecting,
            proto_ver: None,
            callsign: String::new(),
            remote_host: addr.ip(),
            remote_tcp_port: addr.port(),
            remote_udp_port: 0,
            next_udp_rx_seq: 0,
            next_udp_tx_seq: 0,
            current_tg: 0,
            monitored_tgs: BTreeSet::new(),
            node_info: String::new(),
            challenge,
            last_rx: now,
            last_tcp_tx: now,
            last_udp_tx: now,
            frame_tx,
            reader_abort,
            decode_warns: HashMap::new(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn callsign(&self) -> &str {
        &self.callsign
    }

    pub fn proto_ver(&self) -> Option<ProtoVer> {
        self.proto_ver
    }

    pub fn current_tg(&self) -> u32 {
        self.current_tg
    }

    pub fn monitored_tgs(&self) -> &BTreeSet<u32> {
        &self.monitored_tgs
    }

    pub(crate) fn is_v1(&self) -> bool {
        self.proto_ver.is_some_and(|v| v.major == 1)
    }

    /// Sends one control-channel message to this client.
    pub(crate) fn send_msg(&mut self, msg: &Msg) {
        match msg.encode() {
            Ok(payload) => self.send_raw(payload),
            Err(e) => {
                tracing::error!(client = %self.id, error = %e, "failed to encode message");
            }
        }
    }

    /// Sends a pre-encoded frame payload (broadcasts encode once and
    /// fan the same buffer out).
    pub(crate) fn send_raw(&mut self, payload: Bytes) {
        if self.frame_tx.send(ConnCmd::Frame(payload)).is_ok() {
            self.last_tcp_tx = Instant::now();
        }
    }

    /// Sends one datagram to this client, assigning the next outbound
    /// sequence number.
    ///
    /// Silently skipped while the peer's UDP port is unknown. A full
    /// socket buffer drops the datagram; the channel is lossy anyway.
    pub(crate) fn send_udp(&mut self, sock: &UdpSocket, msg: &UdpMsg) {
        if self.remote_udp_port == 0 {
            return;
        }
        let seq = self.next_udp_tx_seq;
        let datagram = match msg.encode(seq, self.id) {
            Ok(d) => d,
            Err(e) => {
                tracing::error!(client = %self.id, error = %e, "failed to encode datagram");
                return;
            }
        };
        self.next_udp_tx_seq = self.next_udp_tx_seq.wrapping_add(1);
        let dest = SocketAddr::new(self.remote_host, self.remote_udp_port);
        match sock.try_send_to(&datagram, dest) {
            Ok(_) => self.last_udp_tx = Instant::now(),
            Err(e) => {
                tracing::debug!(client = %self.id, error = %e, "dropping outbound datagram");
            }
        }
    }

    /// Asks the writer task to flush and close the socket, and stops the
    /// reader. Used for server-initiated disconnects; a peer-initiated
    /// disconnect reaches the core after the tasks have already wound
    /// down, in which case this is a no-op.
    pub(crate) fn shutdown_transport(&mut self) {
        let _ = self.frame_tx.send(ConnCmd::Close);
        if let Some(abort) = self.reader_abort.take() {
            abort.abort();
        }
    }

    /// Applies the inbound sequence-number policy and, on acceptance,
    /// advances the expected number to `seq + 1`.
    ///
    /// The difference to the expected number is interpreted as a signed
    /// 16-bit value: negative (mod 2^16) means a stale or duplicated
    /// datagram, positive means datagrams were lost in between.
    pub(crate) fn check_rx_seq(&mut self, seq: u16) -> SeqCheck {
        let diff = seq.wrapping_sub(self.next_udp_rx_seq);
        if diff > 0x7fff {
            return SeqCheck::OutOfSequence;
        }
        self.next_udp_rx_seq = seq.wrapping_add(1);
        if diff > 0 {
            SeqCheck::Lost(diff)
        } else {
            SeqCheck::InOrder
        }
    }

    /// Rate limiter for malformed-datagram warnings: at most one log
    /// line per message type per minute per client.
    pub(crate) fn should_warn_decode(&mut self, msg_type: u16, now: Instant) -> bool {
        match self.decode_warns.get(&msg_type) {
            Some(&last) if now.duration_since(last) < DECODE_WARN_INTERVAL => false,
            _ => {
                self.decode_warns.insert(msg_type, now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> Client {
        let (tx, _rx) = mpsc::unbounded_channel();
        Client::new(
            ClientId(1),
            "10.0.0.1:40000".parse().unwrap(),
            tx,
            None,
            [0u8; CHALLENGE_LEN],
            Instant::now(),
        )
    }

    // =====================================================================
    // check_rx_seq()
    // =====================================================================

    #[test]
    fn test_check_rx_seq_in_order_advances_expected() {
        let mut client = test_client();

        assert_eq!(client.check_rx_seq(0), SeqCheck::InOrder);
        assert_eq!(client.check_rx_seq(1), SeqCheck::InOrder);
        assert_eq!(client.check_rx_seq(2), SeqCheck::InOrder);
        assert_eq!(client.next_udp_rx_seq, 3);
    }

    #[test]
    fn test_check_rx_seq_gap_reports_lost_count() {
        let mut client = test_client();
        client.check_rx_seq(0);

        // Sequence jumps from 1 to 4: datagrams 1, 2, 3 are gone.
        assert_eq!(client.check_rx_seq(4), SeqCheck::Lost(3));
        // The gap resets the expectation to follow the accepted datagram.
        assert_eq!(client.check_rx_seq(5), SeqCheck::InOrder);
    }

    #[test]
    fn test_check_rx_seq_stale_is_dropped_without_advancing() {
        let mut client = test_client();
        client.check_rx_seq(0);
        client.check_rx_seq(1);

        assert_eq!(client.check_rx_seq(0), SeqCheck::OutOfSequence);
        // Expectation unchanged: the next live datagram still fits.
        assert_eq!(client.check_rx_seq(2), SeqCheck::InOrder);
    }

    #[test]
    fn test_check_rx_seq_wraps_around_u16() {
        let mut client = test_client();
        client.next_udp_rx_seq = 0xffff;

        assert_eq!(client.check_rx_seq(0xffff), SeqCheck::InOrder);
        assert_eq!(client.next_udp_rx_seq, 0);
        assert_eq!(client.check_rx_seq(0), SeqCheck::InOrder);
    }

    #[test]
    fn test_check_rx_seq_far_future_is_stale() {
        // A "gap" of more than 0x7fff reads as a negative offset, i.e.
        // a datagram from the past.
        let mut client = test_client();
        assert_eq!(client.check_rx_seq(0x8000), SeqCheck::OutOfSequence);
    }

    // =====================================================================
    // should_warn_decode()
    // =====================================================================

    #[test]
    fn test_should_warn_decode_once_per_type_per_minute() {
        let mut client = test_client();
        let now = Instant::now();

        assert!(client.should_warn_decode(101, now));
        assert!(!client.should_warn_decode(101, now + Duration::from_secs(30)));
        assert!(client.should_warn_decode(101, now + Duration::from_secs(61)));
    }

    #[test]
    fn test_should_warn_decode_types_are_independent() {
        let mut client = test_client();
        let now = Instant::now();

        assert!(client.should_warn_decode(101, now));
        assert!(client.should_warn_decode(102, now));
    }

    // =====================================================================
    // Misc state
    // =====================================================================

    #[test]
    fn test_new_client_starts_unauthenticated() {
        let client = test_client();
        assert_eq!(client.con_state, ConState::Connecting);
        assert!(client.callsign().is_empty());
        assert_eq!(client.current_tg(), 0);
        assert_eq!(client.remote_udp_port, 0);
    }

    #[test]
    fn test_is_v1_tracks_major_version() {
        let mut client = test_client();
        assert!(!client.is_v1());

        client.proto_ver = Some(ProtoVer::new(1, 2));
        assert!(client.is_v1());

        client.proto_ver = Some(ProtoVer::new(2, 0));
        assert!(!client.is_v1());
    }
}
