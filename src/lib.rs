//! Grabble match server
//!
//! The game core (`game`) runs one authoritative tick loop per match: grab
//! slots, ragdoll and squish, flag ownership and the arbitration queue.
//! `ws` and `http` expose it to clients; the mirror side of every replicated
//! type (`apply_snapshot`, flag prediction and reconciliation) is public for
//! clients and tools built on this crate.

pub mod app;
pub mod config;
pub mod game;
pub mod http;
pub mod util;
pub mod ws;
