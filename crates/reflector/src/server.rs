//! The reflector core: client registry, listeners, and dispatch.
//!
//! One task owns all mutable state: the client map, the talkgroup
//! handler, the QSY allocator. Socket tasks (accept loop, UDP receive
//! loop, per-connection readers) feed [`Command`]s into the core's
//! channel; per-connection writer tasks drain per-client outbound
//! channels. Nothing outside the core task touches client state, which
//! is what makes the ordering guarantees hold: a talker event is fully
//! broadcast before the next datagram is even looked at.
//!
//! Client teardown follows the same discipline: a disconnect (whether
//! the peer vanished or the server decided) is only ever processed at
//! the top level of the command loop, never from inside an iteration
//! over the client map, and the `Client` value is dropped when that
//! command completes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use reflector_proto::{
    udp_msg_type, ClientId, FrameCodec, Msg, ProtoVer, UdpHeader, UdpMsg, CHALLENGE_LEN,
};
use reflector_tg::{TalkerEvent, TgHandler};
use ring::hmac;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::client::{Client, ConState, ConnCmd, DisconnectReason, SeqCheck};
use crate::filter::Filter;
use crate::qsy::QsyAllocator;
use crate::session::Action;
use crate::{ReflectorConfig, ReflectorError};

/// Command channel depth. Socket tasks back off when the core falls
/// this far behind.
const COMMAND_CHANNEL_SIZE: usize = 1024;

/// Receive buffer for one datagram. Audio frames are far smaller.
const UDP_RECV_BUF: usize = 4096;

/// Input to the core task.
enum Command {
    /// The accept loop produced a new connection.
    Accepted {
        stream: TcpStream,
        addr: SocketAddr,
    },
    /// A connection reader produced one frame payload.
    Frame { id: ClientId, payload: BytesMut },
    /// A connection reader finished.
    ConnectionLost {
        id: ClientId,
        reason: DisconnectReason,
    },
    /// The UDP socket produced one datagram.
    Datagram {
        addr: SocketAddr,
        payload: BytesMut,
    },
}

/// A bound, not-yet-running reflector.
///
/// [`bind`](Reflector::bind) claims the TCP and UDP sockets (both on the
/// same port number) and spawns the socket tasks; [`run`](Reflector::run)
/// drives the core loop until the process ends.
pub struct Reflector {
    core: Core,
    cmd_rx: mpsc::Receiver<Command>,
}

impl Reflector {
    /// Binds the listeners and prepares the core.
    ///
    /// # Errors
    /// Returns [`ReflectorError::Config`] for an unusable configuration
    /// and [`ReflectorError::Io`] when a socket cannot be bound. Both are
    /// initialization failures; the caller should exit non-zero.
    pub async fn bind(config: ReflectorConfig) -> Result<Self, ReflectorError> {
        config.validate()?;

        let listener = TcpListener::bind(("0.0.0.0", config.listen_port)).await?;
        let local_addr = listener.local_addr()?;
        // The datagram channel shares the TCP port number.
        let udp = Arc::new(UdpSocket::bind(("0.0.0.0", local_addr.port())).await?);

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        tokio::spawn(accept_loop(listener, cmd_tx.clone()));
        tokio::spawn(udp_recv_loop(Arc::clone(&udp), cmd_tx.clone()));

        let auth_key = hmac::Key::new(hmac::HMAC_SHA256, config.auth_key.as_bytes());
        let mut tg = TgHandler::new();
        tg.set_sql_timeout(config.sql_timeout());
        tg.set_sql_timeout_blocktime(config.sql_timeout_blocktime());
        let qsy = QsyAllocator::from_config(config.random_qsy_range);

        tracing::info!(%local_addr, "reflector listening");

        Ok(Self {
            core: Core {
                config,
                clients: HashMap::new(),
                tg,
                qsy,
                udp,
                cmd_tx,
                auth_key,
                next_client_id: 0,
                local_addr,
            },
            cmd_rx,
        })
    }

    /// The bound address (useful when the configured port was 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.core.local_addr
    }

    /// Runs the core loop: commands from the socket tasks plus the 1 Hz
    /// housekeeping tick (squelch timeouts, heartbeats, idle timeouts).
    pub async fn run(self) -> Result<(), ReflectorError> {
        let Reflector { mut core, mut cmd_rx } = self;
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => core.handle_command(cmd),
                    // All socket tasks hold a sender, so this only
                    // happens if they all died.
                    None => {
                        return Err(ReflectorError::Io(std::io::Error::other(
                            "all socket tasks terminated",
                        )));
                    }
                },
                _ = tick.tick() => core.handle_tick(Instant::now()),
            }
        }
    }
}

/// All reflector state, owned by the core task.
struct Core {
    config: ReflectorConfig,
    clients: HashMap<ClientId, Client>,
    tg: TgHandler,
    qsy: QsyAllocator,
    udp: Arc<UdpSocket>,
    cmd_tx: mpsc::Sender<Command>,
    auth_key: hmac::Key,
    /// Monotonic id source; ids are never reused within the process.
    next_client_id: u32,
    local_addr: SocketAddr,
}

impl Core {
    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Accepted { stream, addr } => self.handle_accepted(stream, addr),
            Command::Frame { id, payload } => self.handle_frame(id, payload),
            Command::ConnectionLost { id, reason } => self.disconnect_client(id, reason),
            Command::Datagram { addr, payload } => self.handle_datagram(addr, payload),
        }
    }

    // -----------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------

    fn handle_accepted(&mut self, stream: TcpStream, addr: SocketAddr) {
        self.next_client_id += 1;
        let id = ClientId(self.next_client_id);

        let (read_half, write_half) = stream.into_split();
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        tokio::spawn(conn_write_loop(write_half, conn_rx));
        let reader = tokio::spawn(conn_read_loop(id, read_half, self.cmd_tx.clone()));

        let challenge: [u8; CHALLENGE_LEN] = rand::rng().random();
        let mut client = Client::new(
            id,
            addr,
            conn_tx,
            Some(reader.abort_handle()),
            challenge,
            Instant::now(),
        );
        tracing::info!(%id, %addr, "client connected");

        // The server speaks first: announce our capability and wait for
        // the peer's version.
        client.send_msg(&Msg::ProtoVer(ProtoVer::CURRENT));
        client.con_state = ConState::Handshaking;
        self.clients.insert(id, client);
    }

    fn disconnect_client(&mut self, id: ClientId, reason: DisconnectReason) {
        let Some(client) = self.clients.get_mut(&id) else {
            // Already gone; a late command raced the teardown.
            return;
        };
        if client.con_state == ConState::Destroying {
            return;
        }
        client.con_state = ConState::Destroying;
        client.shutdown_transport();

        // Withdraw from talkgroup state first: a talker-stop event must
        // still be able to resolve the departing client's callsign.
        let events = self.tg.remove_client(id);
        self.process_talker_events(events);

        if let Some(client) = self.clients.remove(&id) {
            if client.callsign.is_empty() {
                tracing::info!(
                    %id,
                    host = %client.remote_host,
                    port = client.remote_tcp_port,
                    %reason,
                    "client disconnected"
                );
            } else {
                tracing::info!(callsign = %client.callsign, %reason, "client disconnected");
                self.broadcast_msg(
                    &Msg::NodeLeft {
                        callsign: client.callsign.clone(),
                    },
                    &Filter::except(id),
                );
            }
        }
        // The Client value drops here, after every map has let go of it.
    }

    // -----------------------------------------------------------------
    // Control channel
    // -----------------------------------------------------------------

    fn handle_frame(&mut self, id: ClientId, payload: BytesMut) {
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        client.last_rx = Instant::now();

        let mut buf = payload.freeze();
        let msg = match Msg::decode(&mut buf) {
            Ok(msg) => msg,
            Err(e) => {
                // Malformed control frames are fatal for the session.
                tracing::warn!(%id, error = %e, "malformed control frame");
                self.disconnect_client(id, DisconnectReason::ProtocolError);
                return;
            }
        };

        let actions = client.handle_frame(msg, &self.auth_key);
        self.apply_actions(id, actions);
    }

    fn apply_actions(&mut self, id: ClientId, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send(msg) => {
                    if let Some(client) = self.clients.get_mut(&id) {
                        client.send_msg(&msg);
                    }
                }
                Action::AuthSuccess { callsign } => self.complete_auth(id, callsign),
                Action::Join(tg) => self.join_tg(id, tg),
                Action::SetMonitored(tgs) => {
                    if let Some(client) = self.clients.get_mut(&id) {
                        client.monitored_tgs = tgs.into_iter().collect();
                        tracing::debug!(
                            callsign = %client.callsign,
                            monitored = ?client.monitored_tgs,
                            "monitored talkgroups updated"
                        );
                    }
                }
                Action::Qsy(tg) => self.request_qsy(id, tg),
                Action::Disconnect(reason) => {
                    self.disconnect_client(id, reason);
                    return;
                }
            }
        }
    }

    fn complete_auth(&mut self, id: ClientId, callsign: String) {
        let duplicate = self
            .clients
            .values()
            .any(|c| c.id != id && c.con_state == ConState::Connected && c.callsign == callsign);
        if duplicate {
            tracing::info!(%callsign, "rejecting duplicate callsign");
            if let Some(client) = self.clients.get_mut(&id) {
                client.send_msg(&Msg::Error {
                    message: format!("Callsign {callsign} is already connected"),
                });
            }
            self.disconnect_client(id, DisconnectReason::AuthFailed);
            return;
        }

        // Snapshot the roster before this client becomes part of it.
        let nodes = self.node_list();

        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        client.callsign = callsign.clone();
        client.con_state = ConState::Connected;
        let is_v1 = client.is_v1();
        tracing::info!(
            %callsign,
            ver = %client.proto_ver.unwrap_or(ProtoVer::new(0, 0)),
            "client authenticated"
        );
        client.send_msg(&Msg::AuthOk);
        client.send_msg(&Msg::ServerInfo {
            client_id: id.0,
            nodes,
        });

        self.broadcast_msg(&Msg::NodeJoined { callsign }, &Filter::except(id));

        if is_v1 {
            self.join_tg(id, self.config.tg_for_v1_clients);
        }
    }

    fn join_tg(&mut self, id: ClientId, tg: u32) {
        let events = self.tg.join(id, tg);
        if let Some(client) = self.clients.get_mut(&id) {
            client.current_tg = tg;
            if tg > 0 {
                tracing::info!(callsign = %client.callsign, tg, "selected talkgroup");
            } else {
                tracing::info!(callsign = %client.callsign, "left talkgroup");
            }
        }
        self.process_talker_events(events);
    }

    fn request_qsy(&mut self, id: ClientId, mut tg: u32) {
        let callsign = self.callsign_of(id);
        if tg == 0 {
            if !self.qsy.is_enabled() {
                tracing::info!(
                    %callsign,
                    "QSY request for random TG but no random_qsy_range configured"
                );
                return;
            }
            let tg_state = &self.tg;
            match self.qsy.allocate(|candidate| !tg_state.tg_is_empty(candidate)) {
                Some(candidate) => tg = candidate,
                None => {
                    tracing::warn!("no random TG available for QSY");
                    return;
                }
            }
        }

        let current = self.tg.tg_for_client(id);
        tracing::info!(%callsign, from = current, to = tg, "QSY requested");
        self.broadcast_msg(
            &Msg::RequestQsy { tg },
            &Filter::and(Filter::v2(), Filter::tg(current)),
        );
    }

    // -----------------------------------------------------------------
    // Datagram channel
    // -----------------------------------------------------------------

    fn handle_datagram(&mut self, addr: SocketAddr, payload: BytesMut) {
        let mut buf = payload.freeze();
        let header = match UdpHeader::decode(&mut buf) {
            Ok(header) => header,
            Err(e) => {
                tracing::warn!(%addr, error = %e, "failed to decode datagram header");
                return;
            }
        };
        let now = Instant::now();
        let id = header.client_id;

        let Some(client) = self.clients.get_mut(&id) else {
            tracing::warn!(%addr, %id, "datagram with unknown client id");
            return;
        };

        // The datagram must come from where the control channel does,
        // and once a UDP port is learned, from that exact port.
        if addr.ip() != client.remote_host {
            tracing::warn!(
                callsign = %client.callsign,
                %addr,
                expected = %client.remote_host,
                "datagram with wrong source ip"
            );
            return;
        }
        if client.remote_udp_port == 0 {
            client.remote_udp_port = addr.port();
            tracing::debug!(callsign = %client.callsign, port = addr.port(), "learned UDP port");
            client.send_udp(&self.udp, &UdpMsg::Heartbeat);
        } else if addr.port() != client.remote_udp_port {
            tracing::warn!(
                callsign = %client.callsign,
                port = addr.port(),
                expected = client.remote_udp_port,
                "datagram with wrong source UDP port"
            );
            return;
        }

        match client.check_rx_seq(header.sequence) {
            SeqCheck::OutOfSequence => {
                tracing::info!(
                    callsign = %client.callsign,
                    seq = header.sequence,
                    expected = client.next_udp_rx_seq,
                    "dropping out-of-sequence datagram"
                );
                return;
            }
            SeqCheck::Lost(n) => {
                tracing::info!(callsign = %client.callsign, lost = n, "datagram(s) lost");
            }
            SeqCheck::InOrder => {}
        }

        client.last_rx = now;

        match header.msg_type {
            udp_msg_type::HEARTBEAT => {}
            udp_msg_type::AUDIO => self.handle_udp_audio(id, &mut buf, now),
            udp_msg_type::FLUSH_SAMPLES => self.handle_udp_flush(id, now),
            udp_msg_type::ALL_SAMPLES_FLUSHED => {}
            other => {
                // Unknown datagram types pass silently so the protocol
                // can grow without breaking old reflectors.
                tracing::trace!(%id, tag = other, "ignoring unknown datagram type");
            }
        }
    }

    fn handle_udp_audio(&mut self, id: ClientId, buf: &mut Bytes, now: Instant) {
        if self.tg.is_blocked(id) {
            tracing::trace!(%id, "dropping audio from blocked client");
            return;
        }

        let audio = match UdpMsg::decode(udp_msg_type::AUDIO, buf) {
            Ok(UdpMsg::Audio { audio }) => audio,
            Ok(_) => return,
            Err(e) => {
                if let Some(client) = self.clients.get_mut(&id) {
                    if client.should_warn_decode(udp_msg_type::AUDIO, now) {
                        tracing::warn!(
                            callsign = %client.callsign,
                            error = %e,
                            "malformed audio datagram"
                        );
                    }
                }
                return;
            }
        };

        let tg = self.tg.tg_for_client(id);
        if tg == 0 || audio.is_empty() {
            return;
        }

        // First audio with the slot free takes the talker role; audio
        // from the standing talker refreshes its squelch clock. Either
        // way the start event (if any) goes out before the audio.
        let events = self.tg.set_talker(tg, Some(id), now);
        self.process_talker_events(events);

        if self.tg.talker_for_tg(tg) == Some(id) {
            self.broadcast_udp(
                &UdpMsg::Audio { audio },
                &Filter::and(Filter::tg(tg), Filter::except(id)),
            );
        }
    }

    fn handle_udp_flush(&mut self, id: ClientId, now: Instant) {
        let tg = self.tg.tg_for_client(id);
        if tg > 0 && self.tg.talker_for_tg(tg) == Some(id) {
            let events = self.tg.set_talker(tg, None, now);
            self.process_talker_events(events);
        }
        // Acknowledge straight away instead of waiting for every
        // listener to flush; waiting would stall on busy reflectors.
        if let Some(client) = self.clients.get_mut(&id) {
            client.send_udp(&self.udp, &UdpMsg::AllSamplesFlushed);
        }
    }

    // -----------------------------------------------------------------
    // Talker events and broadcasts
    // -----------------------------------------------------------------

    fn process_talker_events(&mut self, events: Vec<TalkerEvent>) {
        for event in events {
            self.on_talker_updated(event);
        }
    }

    fn on_talker_updated(&mut self, event: TalkerEvent) {
        let tg = event.tg;
        if let Some(old) = event.old {
            let callsign = self.callsign_of(old);
            tracing::info!(%callsign, tg, "talker stop");
            self.broadcast_msg(
                &Msg::TalkerStop {
                    tg,
                    callsign: callsign.clone(),
                },
                &Filter::and(
                    Filter::v2(),
                    Filter::or(Filter::tg(tg), Filter::monitor(tg)),
                ),
            );
            if tg == self.config.tg_for_v1_clients {
                self.broadcast_msg(&Msg::TalkerStopV1 { callsign }, &Filter::v1());
            }
            self.broadcast_udp(
                &UdpMsg::FlushSamples,
                &Filter::and(Filter::tg(tg), Filter::except(old)),
            );
        }
        if let Some(new) = event.new {
            let callsign = self.callsign_of(new);
            tracing::info!(%callsign, tg, "talker start");
            self.broadcast_msg(
                &Msg::TalkerStart {
                    tg,
                    callsign: callsign.clone(),
                },
                &Filter::and(
                    Filter::v2(),
                    Filter::or(Filter::tg(tg), Filter::monitor(tg)),
                ),
            );
            if tg == self.config.tg_for_v1_clients {
                self.broadcast_msg(&Msg::TalkerStartV1 { callsign }, &Filter::v1());
            }
        }
    }

    /// Sends `msg` to every connected client the filter selects.
    ///
    /// Encodes once and fans the same buffer out.
    fn broadcast_msg(&mut self, msg: &Msg, filter: &Filter) {
        let payload = match msg.encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode broadcast");
                return;
            }
        };
        for client in self.clients.values_mut() {
            if client.con_state == ConState::Connected && filter.matches(client) {
                client.send_raw(payload.clone());
            }
        }
    }

    /// Sends a datagram to every connected client the filter selects.
    ///
    /// Sequence numbers differ per client, so each recipient gets its
    /// own encoding. Clients whose UDP port is still unknown are
    /// skipped; there is nowhere to send to yet.
    fn broadcast_udp(&mut self, msg: &UdpMsg, filter: &Filter) {
        for client in self.clients.values_mut() {
            if client.con_state == ConState::Connected
                && client.remote_udp_port != 0
                && filter.matches(client)
            {
                client.send_udp(&self.udp, msg);
            }
        }
    }

    // -----------------------------------------------------------------
    // Housekeeping
    // -----------------------------------------------------------------

    fn handle_tick(&mut self, now: Instant) {
        let events = self.tg.tick(now);
        self.process_talker_events(events);

        let idle_after = self.config.idle_timeout();
        let heartbeat = self.config.heartbeat();

        let mut idle = Vec::new();
        for client in self.clients.values_mut() {
            if now.duration_since(client.last_rx) >= idle_after {
                idle.push(client.id);
                continue;
            }
            if now.duration_since(client.last_tcp_tx) >= heartbeat {
                client.send_msg(&Msg::Heartbeat);
            }
            if client.con_state == ConState::Connected
                && client.remote_udp_port != 0
                && now.duration_since(client.last_udp_tx) >= heartbeat
            {
                client.send_udp(&self.udp, &UdpMsg::Heartbeat);
            }
        }

        for id in idle {
            self.disconnect_client(id, DisconnectReason::IdleTimeout);
        }
    }

    // -----------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------

    fn callsign_of(&self, id: ClientId) -> String {
        self.clients
            .get(&id)
            .map(|c| c.callsign.clone())
            .unwrap_or_default()
    }

    /// Callsigns of all fully connected nodes, sorted for stable output.
    fn node_list(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .clients
            .values()
            .filter(|c| c.con_state == ConState::Connected && !c.callsign.is_empty())
            .map(|c| c.callsign.clone())
            .collect();
        nodes.sort();
        nodes
    }
}

// ---------------------------------------------------------------------
// Socket tasks
// ---------------------------------------------------------------------

async fn accept_loop(listener: TcpListener, cmd_tx: mpsc::Sender<Command>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if cmd_tx
                    .send(Command::Accepted { stream, addr })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                // Transient accept failures (fd exhaustion etc.) must not
                // kill the listener.
                tracing::error!(error = %e, "accept failed");
            }
        }
    }
}

async fn udp_recv_loop(udp: Arc<UdpSocket>, cmd_tx: mpsc::Sender<Command>) {
    let mut buf = vec![0u8; UDP_RECV_BUF];
    loop {
        match udp.recv_from(&mut buf).await {
            Ok((len, addr)) => {
                let payload = BytesMut::from(&buf[..len]);
                if cmd_tx
                    .send(Command::Datagram { addr, payload })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                // On Linux a previous send to a dead peer can surface
                // here as ECONNREFUSED; the socket itself is fine.
                tracing::debug!(error = %e, "UDP receive error");
            }
        }
    }
}

async fn conn_read_loop(
    id: ClientId,
    read_half: OwnedReadHalf,
    cmd_tx: mpsc::Sender<Command>,
) {
    let mut frames = FramedRead::new(read_half, FrameCodec::new());
    let reason = loop {
        match frames.next().await {
            Some(Ok(payload)) => {
                if cmd_tx.send(Command::Frame { id, payload }).await.is_err() {
                    return;
                }
            }
            Some(Err(e)) => {
                tracing::debug!(%id, error = %e, "control channel error");
                break DisconnectReason::ProtocolError;
            }
            None => break DisconnectReason::PeerClosed,
        }
    };
    let _ = cmd_tx.send(Command::ConnectionLost { id, reason }).await;
}

async fn conn_write_loop(
    write_half: OwnedWriteHalf,
    mut conn_rx: mpsc::UnboundedReceiver<ConnCmd>,
) {
    let mut frames = FramedWrite::new(write_half, FrameCodec::new());
    loop {
        match conn_rx.recv().await {
            Some(ConnCmd::Frame(payload)) => {
                if frames.send(payload).await.is_err() {
                    break;
                }
            }
            // Explicit close, or the core dropped the client.
            Some(ConnCmd::Close) | None => break,
        }
    }
    let mut inner = frames.into_inner();
    let _ = inner.shutdown().await;
}
