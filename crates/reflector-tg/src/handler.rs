//! Membership, talker arbitration, squelch timeout, and block list.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use reflector_proto::ClientId;

/// A talker transition on one talkgroup.
///
/// At most one of `old`/`new` is `None`: a start carries `(None, new)`,
/// a stop carries `(old, None)`. The handler never replaces a live talker
/// in one step, so `(old, new)` with both set does not occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TalkerEvent {
    pub tg: u32,
    pub old: Option<ClientId>,
    pub new: Option<ClientId>,
}

/// The current talker on a talkgroup plus its activity clock.
#[derive(Debug, Clone, Copy)]
struct TalkerState {
    client: ClientId,
    last_activity: Instant,
}

/// All cross-client talkgroup state.
///
/// Membership is a pair of maps kept in sync: `tg → members` and
/// `client → tg`. A client is a member of at most one talkgroup at a
/// time (it may *monitor* any number, but monitoring is client state,
/// not membership, and lives with the client).
pub struct TgHandler {
    members: HashMap<u32, HashSet<ClientId>>,
    client_tg: HashMap<ClientId, u32>,
    talkers: HashMap<u32, TalkerState>,
    /// Clients whose audio is dropped until the stored instant.
    blocked: HashMap<ClientId, Instant>,
    sql_timeout: Duration,
    sql_timeout_blocktime: Duration,
}

impl TgHandler {
    pub fn new() -> Self {
        Self {
            members: HashMap::new(),
            client_tg: HashMap::new(),
            talkers: HashMap::new(),
            blocked: HashMap::new(),
            sql_timeout: Duration::ZERO,
            sql_timeout_blocktime: Duration::from_secs(60),
        }
    }

    /// Maximum talker silence before the slot is reclaimed. Zero disables
    /// the timeout entirely.
    pub fn set_sql_timeout(&mut self, timeout: Duration) {
        self.sql_timeout = timeout;
    }

    /// How long a timed-out talker stays on the block list.
    pub fn set_sql_timeout_blocktime(&mut self, blocktime: Duration) {
        self.sql_timeout_blocktime = blocktime;
    }

    /// Moves `client` into talkgroup `tg`, leaving its previous one.
    ///
    /// `tg == 0` means "leave only". If the client was the talker of its
    /// previous talkgroup, the talker slot is cleared and the
    /// corresponding event returned.
    pub fn join(&mut self, client: ClientId, tg: u32) -> Vec<TalkerEvent> {
        let mut events = Vec::new();

        if let Some(&current) = self.client_tg.get(&client) {
            if current == tg {
                return events;
            }
            events.extend(self.leave_current(client, current));
        }

        if tg > 0 {
            self.members.entry(tg).or_default().insert(client);
            self.client_tg.insert(client, tg);
            tracing::debug!(%client, tg, "joined talkgroup");
        }

        events
    }

    /// Removes `client` from its current talkgroup, if any.
    pub fn leave(&mut self, client: ClientId) -> Vec<TalkerEvent> {
        self.join(client, 0)
    }

    /// Full withdrawal: membership, talker slot, and block-list entry.
    ///
    /// Called when a client disconnects, before it is dropped from the
    /// registry, so a talker-stop event can still resolve the callsign.
    pub fn remove_client(&mut self, client: ClientId) -> Vec<TalkerEvent> {
        let events = self.leave(client);
        self.blocked.remove(&client);
        events
    }

    /// The talkgroup `client` is currently a member of (0 = none).
    pub fn tg_for_client(&self, client: ClientId) -> u32 {
        self.client_tg.get(&client).copied().unwrap_or(0)
    }

    /// The members of `tg`. Empty for an unknown talkgroup.
    pub fn clients_for_tg(&self, tg: u32) -> HashSet<ClientId> {
        self.members.get(&tg).cloned().unwrap_or_default()
    }

    /// `true` if `tg` has no members.
    pub fn tg_is_empty(&self, tg: u32) -> bool {
        self.members.get(&tg).map_or(true, HashSet::is_empty)
    }

    /// The current talker on `tg`, if any.
    pub fn talker_for_tg(&self, tg: u32) -> Option<ClientId> {
        self.talkers.get(&tg).map(|t| t.client)
    }

    /// Talker arbitration.
    ///
    /// - same client as the current talker: refresh its activity clock,
    ///   no event;
    /// - no current talker: install `client` and emit a start event;
    /// - `None` with a current talker: clear the slot and emit a stop
    ///   event;
    /// - a different client while one is talking: refused. The first
    ///   acquirer holds the slot until it is cleared.
    ///
    /// A client that is not a member of `tg` is never installed, which
    /// keeps every `(tg, talker)` pair inside the membership map.
    pub fn set_talker(
        &mut self,
        tg: u32,
        client: Option<ClientId>,
        now: Instant,
    ) -> Vec<TalkerEvent> {
        let current = self.talker_for_tg(tg);
        match (current, client) {
            (Some(cur), Some(new)) if cur == new => {
                if let Some(state) = self.talkers.get_mut(&tg) {
                    state.last_activity = now;
                }
                Vec::new()
            }
            (None, Some(new)) => {
                if !self.members.get(&tg).is_some_and(|m| m.contains(&new)) {
                    tracing::warn!(%new, tg, "refusing talker that is not a member");
                    return Vec::new();
                }
                self.talkers.insert(
                    tg,
                    TalkerState {
                        client: new,
                        last_activity: now,
                    },
                );
                vec![TalkerEvent {
                    tg,
                    old: None,
                    new: Some(new),
                }]
            }
            (Some(cur), None) => {
                self.talkers.remove(&tg);
                vec![TalkerEvent {
                    tg,
                    old: Some(cur),
                    new: None,
                }]
            }
            // Preemption attempt or clearing an already-empty slot.
            _ => Vec::new(),
        }
    }

    /// `true` while `client` is on the block list.
    ///
    /// Entries are reaped by [`tick`](Self::tick); between ticks an
    /// expired entry still reads as blocked, which matches the one-second
    /// granularity of the squelch machinery.
    pub fn is_blocked(&self, client: ClientId) -> bool {
        self.blocked.contains_key(&client)
    }

    /// One pass of the periodic squelch timer (1 Hz is sufficient).
    ///
    /// Clears every talker that has been silent for `sql_timeout` and
    /// puts it on the block list for `sql_timeout_blocktime`; reaps block
    /// entries whose time is up.
    pub fn tick(&mut self, now: Instant) -> Vec<TalkerEvent> {
        let mut events = Vec::new();

        if !self.sql_timeout.is_zero() {
            let timed_out: Vec<(u32, ClientId)> = self
                .talkers
                .iter()
                .filter(|(_, state)| now.duration_since(state.last_activity) >= self.sql_timeout)
                .map(|(&tg, state)| (tg, state.client))
                .collect();

            for (tg, client) in timed_out {
                tracing::info!(%client, tg, "squelch timeout, clearing talker");
                self.talkers.remove(&tg);
                if !self.sql_timeout_blocktime.is_zero() {
                    self.blocked
                        .insert(client, now + self.sql_timeout_blocktime);
                }
                events.push(TalkerEvent {
                    tg,
                    old: Some(client),
                    new: None,
                });
            }
        }

        self.blocked.retain(|client, expiry| {
            let keep = *expiry > now;
            if !keep {
                tracing::debug!(%client, "block time expired");
            }
            keep
        });

        events
    }

    fn leave_current(&mut self, client: ClientId, current: u32) -> Vec<TalkerEvent> {
        let mut events = Vec::new();
        if self.talker_for_tg(current) == Some(client) {
            self.talkers.remove(&current);
            events.push(TalkerEvent {
                tg: current,
                old: Some(client),
                new: None,
            });
        }
        if let Some(members) = self.members.get_mut(&current) {
            members.remove(&client);
            if members.is_empty() {
                self.members.remove(&current);
            }
        }
        self.client_tg.remove(&client);
        tracing::debug!(%client, tg = current, "left talkgroup");
        events
    }
}

impl Default for TgHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    //! The squelch machinery depends on elapsed time, so every
    //! time-sensitive test passes explicit `Instant`s instead of
    //! sleeping: a base instant plus offsets drives the clock forward
    //! deterministically.

    use super::*;

    fn cid(id: u32) -> ClientId {
        ClientId(id)
    }

    fn handler_with_squelch(timeout_s: u64, blocktime_s: u64) -> TgHandler {
        let mut tg = TgHandler::new();
        tg.set_sql_timeout(Duration::from_secs(timeout_s));
        tg.set_sql_timeout_blocktime(Duration::from_secs(blocktime_s));
        tg
    }

    // =====================================================================
    // join() / leave() / remove_client()
    // =====================================================================

    #[test]
    fn test_join_adds_member_and_maps_client() {
        let mut tg = TgHandler::new();

        let events = tg.join(cid(1), 42);

        assert!(events.is_empty());
        assert_eq!(tg.tg_for_client(cid(1)), 42);
        assert!(tg.clients_for_tg(42).contains(&cid(1)));
    }

    #[test]
    fn test_join_same_tg_twice_is_a_no_op() {
        let mut tg = TgHandler::new();
        tg.join(cid(1), 42);

        let events = tg.join(cid(1), 42);

        assert!(events.is_empty());
        assert_eq!(tg.clients_for_tg(42).len(), 1);
    }

    #[test]
    fn test_join_moves_client_between_tgs() {
        let mut tg = TgHandler::new();
        tg.join(cid(1), 42);

        tg.join(cid(1), 43);

        assert_eq!(tg.tg_for_client(cid(1)), 43);
        assert!(tg.tg_is_empty(42));
        assert!(tg.clients_for_tg(43).contains(&cid(1)));
    }

    #[test]
    fn test_client_is_member_of_at_most_one_tg() {
        let mut tg = TgHandler::new();
        tg.join(cid(1), 42);
        tg.join(cid(1), 43);
        tg.join(cid(1), 44);

        let membership_count = [42, 43, 44]
            .iter()
            .filter(|&&g| tg.clients_for_tg(g).contains(&cid(1)))
            .count();
        assert_eq!(membership_count, 1);
    }

    #[test]
    fn test_join_tg_zero_leaves_only() {
        let mut tg = TgHandler::new();
        tg.join(cid(1), 42);

        tg.join(cid(1), 0);

        assert_eq!(tg.tg_for_client(cid(1)), 0);
        assert!(tg.tg_is_empty(42));
    }

    #[test]
    fn test_join_clears_talker_when_talker_changes_tg() {
        let now = Instant::now();
        let mut tg = TgHandler::new();
        tg.join(cid(1), 42);
        tg.set_talker(42, Some(cid(1)), now);

        let events = tg.join(cid(1), 43);

        assert_eq!(
            events,
            vec![TalkerEvent {
                tg: 42,
                old: Some(cid(1)),
                new: None,
            }]
        );
        assert_eq!(tg.talker_for_tg(42), None);
    }

    #[test]
    fn test_remove_client_purges_block_entry() {
        let now = Instant::now();
        let mut tg = handler_with_squelch(1, 60);
        tg.join(cid(1), 42);
        tg.set_talker(42, Some(cid(1)), now);
        tg.tick(now + Duration::from_secs(2)); // talker times out, gets blocked
        assert!(tg.is_blocked(cid(1)));

        tg.remove_client(cid(1));

        assert!(!tg.is_blocked(cid(1)));
        assert_eq!(tg.tg_for_client(cid(1)), 0);
    }

    // =====================================================================
    // set_talker() arbitration rules
    // =====================================================================

    #[test]
    fn test_set_talker_installs_first_acquirer() {
        let now = Instant::now();
        let mut tg = TgHandler::new();
        tg.join(cid(1), 42);

        let events = tg.set_talker(42, Some(cid(1)), now);

        assert_eq!(
            events,
            vec![TalkerEvent {
                tg: 42,
                old: None,
                new: Some(cid(1)),
            }]
        );
        assert_eq!(tg.talker_for_tg(42), Some(cid(1)));
    }

    #[test]
    fn test_set_talker_refresh_emits_no_event() {
        let now = Instant::now();
        let mut tg = TgHandler::new();
        tg.join(cid(1), 42);
        tg.set_talker(42, Some(cid(1)), now);

        let events = tg.set_talker(42, Some(cid(1)), now + Duration::from_secs(1));

        assert!(events.is_empty());
        assert_eq!(tg.talker_for_tg(42), Some(cid(1)));
    }

    #[test]
    fn test_set_talker_refresh_extends_squelch_timeout() {
        let now = Instant::now();
        let mut tg = handler_with_squelch(2, 60);
        tg.join(cid(1), 42);
        tg.set_talker(42, Some(cid(1)), now);

        // Refresh at t+1; at t+2 only one second has passed since the
        // last activity, so the talker must survive.
        tg.set_talker(42, Some(cid(1)), now + Duration::from_secs(1));
        let events = tg.tick(now + Duration::from_secs(2));

        assert!(events.is_empty());
        assert_eq!(tg.talker_for_tg(42), Some(cid(1)));
    }

    #[test]
    fn test_set_talker_preemption_is_refused() {
        let now = Instant::now();
        let mut tg = TgHandler::new();
        tg.join(cid(1), 42);
        tg.join(cid(2), 42);
        tg.set_talker(42, Some(cid(1)), now);

        let events = tg.set_talker(42, Some(cid(2)), now);

        assert!(events.is_empty());
        assert_eq!(tg.talker_for_tg(42), Some(cid(1)));
    }

    #[test]
    fn test_set_talker_clear_emits_stop_event() {
        let now = Instant::now();
        let mut tg = TgHandler::new();
        tg.join(cid(1), 42);
        tg.set_talker(42, Some(cid(1)), now);

        let events = tg.set_talker(42, None, now);

        assert_eq!(
            events,
            vec![TalkerEvent {
                tg: 42,
                old: Some(cid(1)),
                new: None,
            }]
        );
        assert_eq!(tg.talker_for_tg(42), None);
    }

    #[test]
    fn test_set_talker_clear_on_empty_slot_is_a_no_op() {
        let now = Instant::now();
        let mut tg = TgHandler::new();

        let events = tg.set_talker(42, None, now);

        assert!(events.is_empty());
    }

    #[test]
    fn test_set_talker_refuses_non_member() {
        let now = Instant::now();
        let mut tg = TgHandler::new();
        tg.join(cid(1), 42);

        let events = tg.set_talker(42, Some(cid(2)), now);

        assert!(events.is_empty());
        assert_eq!(tg.talker_for_tg(42), None);
    }

    #[test]
    fn test_talker_is_always_a_member_of_its_tg() {
        let now = Instant::now();
        let mut tg = TgHandler::new();
        tg.join(cid(1), 42);
        tg.join(cid(2), 42);
        tg.set_talker(42, Some(cid(1)), now);
        tg.join(cid(2), 43);
        tg.set_talker(43, Some(cid(2)), now);

        for g in [42, 43] {
            if let Some(talker) = tg.talker_for_tg(g) {
                assert!(
                    tg.clients_for_tg(g).contains(&talker),
                    "talker of TG {g} must be a member"
                );
            }
        }
    }

    // =====================================================================
    // Squelch timeout and block list
    // =====================================================================

    #[test]
    fn test_tick_clears_silent_talker_and_blocks_it() {
        let now = Instant::now();
        let mut tg = handler_with_squelch(2, 5);
        tg.join(cid(1), 42);
        tg.set_talker(42, Some(cid(1)), now);

        let events = tg.tick(now + Duration::from_secs(2));

        assert_eq!(
            events,
            vec![TalkerEvent {
                tg: 42,
                old: Some(cid(1)),
                new: None,
            }]
        );
        assert_eq!(tg.talker_for_tg(42), None);
        assert!(tg.is_blocked(cid(1)));
    }

    #[test]
    fn test_tick_with_zero_timeout_never_clears() {
        let now = Instant::now();
        let mut tg = TgHandler::new(); // sql_timeout defaults to 0 = off
        tg.join(cid(1), 42);
        tg.set_talker(42, Some(cid(1)), now);

        let events = tg.tick(now + Duration::from_secs(3600));

        assert!(events.is_empty());
        assert_eq!(tg.talker_for_tg(42), Some(cid(1)));
    }

    #[test]
    fn test_block_expires_after_blocktime() {
        let now = Instant::now();
        let mut tg = handler_with_squelch(2, 5);
        tg.join(cid(1), 42);
        tg.set_talker(42, Some(cid(1)), now);
        tg.tick(now + Duration::from_secs(2));
        assert!(tg.is_blocked(cid(1)));

        // Still blocked inside the block window.
        tg.tick(now + Duration::from_secs(6));
        assert!(tg.is_blocked(cid(1)));

        // Expiry is at t = 2 + 5 = 7.
        tg.tick(now + Duration::from_secs(8));
        assert!(!tg.is_blocked(cid(1)));
    }

    #[test]
    fn test_blocked_talker_can_reacquire_after_block_expiry() {
        let now = Instant::now();
        let mut tg = handler_with_squelch(2, 5);
        tg.join(cid(1), 42);
        tg.set_talker(42, Some(cid(1)), now);
        tg.tick(now + Duration::from_secs(2));
        tg.tick(now + Duration::from_secs(8));

        let events = tg.set_talker(42, Some(cid(1)), now + Duration::from_secs(8));

        assert_eq!(events.len(), 1);
        assert_eq!(tg.talker_for_tg(42), Some(cid(1)));
    }

    #[test]
    fn test_explicit_clear_does_not_block() {
        let now = Instant::now();
        let mut tg = handler_with_squelch(2, 5);
        tg.join(cid(1), 42);
        tg.set_talker(42, Some(cid(1)), now);

        // A flush clears the talker voluntarily; that is not a timeout.
        tg.set_talker(42, None, now);

        assert!(!tg.is_blocked(cid(1)));
    }

    #[test]
    fn test_independent_tgs_time_out_independently() {
        let now = Instant::now();
        let mut tg = handler_with_squelch(2, 5);
        tg.join(cid(1), 42);
        tg.join(cid(2), 43);
        tg.set_talker(42, Some(cid(1)), now);
        tg.set_talker(43, Some(cid(2)), now + Duration::from_secs(1));

        let events = tg.tick(now + Duration::from_secs(2));

        // Only the talker on 42 has been silent long enough.
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tg, 42);
        assert_eq!(tg.talker_for_tg(43), Some(cid(2)));
    }
}
