//! A user-space per-core reactor and event scheduling engine.
//!
//! The engine pins one reactor to each owned CPU core and multiplexes many
//! cooperative lightweight threads across them. Cores exchange work through
//! lockless event rings; individual cores transparently switch between
//! busy-polling and interrupt-driven operation at runtime, and a periodic
//! scheduling pass may rebalance threads between cores through pluggable
//! policies.

#[macro_use]
extern crate tracing;

pub mod core;
pub mod logger;
