//! Broadcast filter algebra.
//!
//! A [`Filter`] is a pure predicate over client state, used to target
//! subsets of the connected clients in broadcasts: members of a
//! talkgroup, monitors of a talkgroup, one protocol generation, everyone
//! but the sender. Filters compose with `and`/`or`/`not` and evaluate
//! with short-circuiting.
//!
//! Broadcast call sites decide between [`Filter::tg`] (members only,
//! the audio path) and `or(tg, monitor)` (members plus monitors, the
//! talker-event path).

use reflector_proto::{ClientId, ProtoVer};

use crate::client::Client;

/// A composable predicate over client state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// The client's current talkgroup equals the given one.
    Tg(u32),
    /// The given talkgroup is in the client's monitored set.
    TgMonitor(u32),
    /// Everyone except the given client.
    Except(ClientId),
    /// The client's negotiated protocol version is within the inclusive
    /// range. A client that has not negotiated yet never matches.
    ProtoVerRange(ProtoVer, ProtoVer),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn tg(tg: u32) -> Self {
        Filter::Tg(tg)
    }

    pub fn monitor(tg: u32) -> Self {
        Filter::TgMonitor(tg)
    }

    pub fn except(client: ClientId) -> Self {
        Filter::Except(client)
    }

    pub fn ver_range(lo: ProtoVer, hi: ProtoVer) -> Self {
        Filter::ProtoVerRange(lo, hi)
    }

    /// All v1-generation clients: versions `1.0 ..= 1.999`.
    pub fn v1() -> Self {
        Filter::ProtoVerRange(ProtoVer::new(1, 0), ProtoVer::new(1, 999))
    }

    /// All v2-generation clients: versions `2.0 ..= 2.999`.
    pub fn v2() -> Self {
        Filter::ProtoVerRange(ProtoVer::new(2, 0), ProtoVer::new(2, 999))
    }

    pub fn and(a: Filter, b: Filter) -> Self {
        Filter::And(Box::new(a), Box::new(b))
    }

    pub fn or(a: Filter, b: Filter) -> Self {
        Filter::Or(Box::new(a), Box::new(b))
    }

    pub fn not(a: Filter) -> Self {
        Filter::Not(Box::new(a))
    }

    /// Evaluates the predicate against one client.
    pub fn matches(&self, client: &Client) -> bool {
        match self {
            Filter::Tg(tg) => client.current_tg == *tg,
            Filter::TgMonitor(tg) => client.monitored_tgs.contains(tg),
            Filter::Except(id) => client.id != *id,
            Filter::ProtoVerRange(lo, hi) => client
                .proto_ver
                .is_some_and(|ver| *lo <= ver && ver <= *hi),
            Filter::And(a, b) => a.matches(client) && b.matches(client),
            Filter::Or(a, b) => a.matches(client) || b.matches(client),
            Filter::Not(a) => !a.matches(client),
        }
    }
}
