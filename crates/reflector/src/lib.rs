//! # Reflector
//!
//! An audio reflector for amateur-radio voice-over-IP nodes. Nodes
//! connect over a framed TCP control channel and a parallel UDP datagram
//! channel on the same port; the reflector arbitrates a single talker
//! per talkgroup and relays that talker's compressed audio to every
//! other node currently listening on the talkgroup.
//!
//! Two protocol generations coexist: v2 nodes select and monitor
//! talkgroups, v1 nodes implicitly share one configured talkgroup and
//! receive translated talker events.
//!
//! All reflector state lives on a single core task; socket tasks only
//! shuttle bytes in and out through channels. See [`Reflector`] for the
//! entry point.

mod client;
mod config;
mod error;
mod filter;
mod qsy;
mod server;
mod session;

pub use client::Client;
pub use config::{QsyRange, ReflectorConfig};
pub use error::ReflectorError;
pub use filter::Filter;
pub use qsy::QsyAllocator;
pub use server::Reflector;
