#![deny(unreachable_pub)]
//! Spot grid trading engine with order reconciliation, stop-loss and
//! volume cycling.

pub mod config;
pub mod events;
pub mod grid;
pub mod market;
pub mod runner;
pub mod server;
pub mod session;
pub mod volume;
