//! Control-channel session state machine.
//!
//! [`Client::handle_frame`] drives one client's state machine for one
//! inbound message and returns the effects as a list of [`Action`]s for
//! the core to execute. Keeping the transition logic a pure function of
//! client state makes every handshake path testable without sockets.

use reflector_proto::{Msg, ProtoVer};
use ring::hmac;

use crate::client::{Client, ConState, DisconnectReason};

/// An effect requested by the session state machine.
///
/// Executed by the reflector core in order; a `Disconnect` stops the
/// execution of any remaining actions.
#[derive(Debug)]
pub(crate) enum Action {
    /// Send a message to this client.
    Send(Msg),
    /// The challenge/response verified; the core completes the login
    /// (duplicate-callsign check, roster broadcast, v1 auto-join).
    AuthSuccess { callsign: String },
    /// Join the given talkgroup (0 = leave only).
    Join(u32),
    /// Replace the monitored-talkgroup set.
    SetMonitored(Vec<u32>),
    /// Delegate a QSY request (0 = pick a random talkgroup).
    Qsy(u32),
    /// Tear the session down.
    Disconnect(DisconnectReason),
}

impl Client {
    /// Processes one control-channel message.
    ///
    /// `auth_key` is the reflector's shared HMAC key; the digest in an
    /// `AuthResponse` must be the HMAC of the challenge nonce issued to
    /// this client.
    pub(crate) fn handle_frame(&mut self, msg: Msg, auth_key: &hmac::Key) -> Vec<Action> {
        match (self.con_state, msg) {
            // Unknown types pass through every state untouched so newer
            // peers can extend the protocol.
            (_, Msg::Unknown(tag)) => {
                tracing::trace!(client = %self.id, tag, "ignoring unknown message type");
                Vec::new()
            }

            // Liveness is recorded by the core for any inbound traffic;
            // a heartbeat carries nothing else.
            (_, Msg::Heartbeat) => Vec::new(),

            (ConState::Handshaking, Msg::ProtoVer(ver)) => {
                if ver.major < 1 || ver.major > ProtoVer::CURRENT.major {
                    tracing::info!(client = %self.id, %ver, "unsupported protocol version");
                    return vec![
                        Action::Send(Msg::Error {
                            message: format!("Unsupported protocol version {ver}"),
                        }),
                        Action::Disconnect(DisconnectReason::ProtocolError),
                    ];
                }
                self.proto_ver = Some(ver);
                self.con_state = ConState::AwaitAuthResp;
                vec![Action::Send(Msg::AuthChallenge {
                    challenge: self.challenge,
                })]
            }

            (ConState::AwaitAuthResp, Msg::AuthResponse { callsign, digest }) => {
                if callsign.is_empty() {
                    return vec![
                        Action::Send(Msg::Error {
                            message: "Empty callsign".into(),
                        }),
                        Action::Disconnect(DisconnectReason::AuthFailed),
                    ];
                }
                if hmac::verify(auth_key, &self.challenge, &digest).is_ok() {
                    vec![Action::AuthSuccess { callsign }]
                } else {
                    tracing::info!(client = %self.id, %callsign, "authentication failed");
                    vec![
                        Action::Send(Msg::Error {
                            message: "Access denied".into(),
                        }),
                        Action::Disconnect(DisconnectReason::AuthFailed),
                    ]
                }
            }

            (ConState::Connected, Msg::SelectTg { tg }) => {
                if self.is_v1() {
                    // v1 nodes live on the configured shared talkgroup.
                    tracing::debug!(callsign = %self.callsign, "ignoring SelectTg from v1 node");
                    Vec::new()
                } else {
                    vec![Action::Join(tg)]
                }
            }

            (ConState::Connected, Msg::TgMonitor { tgs }) => {
                if self.is_v1() {
                    tracing::debug!(callsign = %self.callsign, "ignoring TgMonitor from v1 node");
                    Vec::new()
                } else {
                    vec![Action::SetMonitored(tgs)]
                }
            }

            (ConState::Connected, Msg::RequestQsy { tg }) => vec![Action::Qsy(tg)],

            (ConState::Connected, Msg::NodeInfo { info }) => {
                self.node_info = info;
                Vec::new()
            }

            // A client-side error report is informational.
            (_, Msg::Error { message }) => {
                tracing::warn!(client = %self.id, %message, "client reported error");
                Vec::new()
            }

            (state, msg) => {
                tracing::warn!(
                    client = %self.id,
                    ?state,
                    tag = msg.type_tag(),
                    "unexpected message for connection state"
                );
                vec![Action::Disconnect(DisconnectReason::ProtocolError)]
            }
        }
    }
}
