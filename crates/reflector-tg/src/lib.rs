//! Talkgroup state for the reflector.
//!
//! A [`TgHandler`] owns all cross-client talkgroup state: which client is
//! in which talkgroup, who the current talker is, the squelch timeout
//! that reclaims a silent talker's slot, and the block list that keeps a
//! timed-out talker quiet for a while.
//!
//! There is exactly one handler instance, owned by the reflector core and
//! called only from its task. Mutating operations return the
//! [`TalkerEvent`]s they caused; the caller must process them before
//! handling any further input, which is what makes talker transitions
//! observable in order.

mod handler;

pub use handler::{TalkerEvent, TgHandler};
